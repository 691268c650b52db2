//! WGSL compute shaders for forces, integration and point queries.

/// Stage 6: Barnes-Hut repulsion, edge attraction and gravity per body.
///
/// Bodies are visited in tree order so neighboring invocations walk similar
/// paths. Each invocation keeps its own traversal stack.
pub const CALCULATE_FORCES_SHADER: &str = r#"
// ============================================================================
// Data structures
// ============================================================================

struct ForceParams {
    num_bodies: u32,
    num_nodes: u32,
    forward_edges: u32,
    backward_edges: u32,
    scaling_ratio: f32,
    gravity: f32,
    edge_influence: f32,
    tau: f32,
    flags: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

// ============================================================================
// Bindings
// ============================================================================

@group(0) @binding(0) var<storage, read> x_coords: array<f32>;
@group(0) @binding(1) var<storage, read> y_coords: array<f32>;
@group(0) @binding(2) var<storage, read> mass: array<f32>;
@group(0) @binding(3) var<storage, read> children: array<i32>;
@group(0) @binding(4) var<storage, read> sort: array<i32>;
@group(0) @binding(5) var<storage, read> max_depth: array<i32>;
@group(0) @binding(6) var<storage, read> radius: array<f32>;
@group(0) @binding(7) var<storage, read> point_sizes: array<f32>;
@group(0) @binding(8) var<storage, read> forward_edges: array<u32>;
@group(0) @binding(9) var<storage, read> forward_work_items: array<u32>;
@group(0) @binding(10) var<storage, read> forward_weights: array<f32>;
@group(0) @binding(11) var<storage, read> backward_edges: array<u32>;
@group(0) @binding(12) var<storage, read> backward_work_items: array<u32>;
@group(0) @binding(13) var<storage, read> backward_weights: array<f32>;
@group(0) @binding(14) var<storage, read_write> point_forces: array<f32>;
@group(0) @binding(15) var<uniform> params: ForceParams;

const FLAG_PREVENT_OVERLAP: u32 = 1u;
const FLAG_STRONG_GRAVITY: u32 = 2u;
const FLAG_DISSUADE_HUBS: u32 = 4u;
const FLAG_LIN_LOG: u32 = 8u;
const OVERLAP_REPULSION: f32 = 100.0;
const MAX_TRAVERSAL_DEPTH: u32 = 64u;
const STACK_SIZE: u32 = 192u;

fn has(flag: u32) -> bool {
    return (params.flags & flag) != 0u;
}

// ============================================================================
// Force laws
// ============================================================================

// `extent` is the summed size of two points, negative for an aggregated cell.
fn repulsion(m_i: f32, m_j: f32, d: vec2<f32>, extent: f32) -> vec2<f32> {
    let d2 = dot(d, d);
    if (d2 <= 0.0) {
        return vec2<f32>(0.0);
    }
    let k = params.scaling_ratio * m_i * m_j;
    var factor = k / d2;
    if (extent >= 0.0 && has(FLAG_PREVENT_OVERLAP)) {
        let gap = sqrt(d2) - extent;
        if (gap > 0.0) {
            factor = k / (gap * gap);
        } else if (gap < 0.0) {
            factor = OVERLAP_REPULSION * k;
        } else {
            factor = 0.0;
        }
    }
    return d * factor;
}

fn attraction(m_i: f32, weight: f32, d: vec2<f32>, extent: f32) -> vec2<f32> {
    let len = length(d);
    if (len <= 0.0) {
        return vec2<f32>(0.0);
    }
    var reach = len;
    if (has(FLAG_PREVENT_OVERLAP)) {
        reach -= extent;
        if (reach <= 0.0) {
            return vec2<f32>(0.0);
        }
    }
    var w = 1.0;
    if (params.edge_influence == 1.0) {
        w = weight;
    } else if (params.edge_influence != 0.0) {
        w = pow(weight, params.edge_influence);
    }
    var magnitude = w * reach;
    if (has(FLAG_LIN_LOG)) {
        magnitude = w * log(1.0 + reach);
    }
    if (has(FLAG_DISSUADE_HUBS)) {
        magnitude /= m_i;
    }
    return d / len * magnitude;
}

fn gravity(m_i: f32, p: vec2<f32>) -> vec2<f32> {
    let k = params.gravity * m_i;
    if (has(FLAG_STRONG_GRAVITY)) {
        return -k * p;
    }
    let len = length(p);
    if (len > 0.0) {
        return -k * p / len;
    }
    return vec2<f32>(0.0);
}

// ============================================================================
// Barnes-Hut traversal (iterative, stack-based)
// ============================================================================

fn tree_repulsion(i: u32) -> vec2<f32> {
    let p = vec2<f32>(x_coords[i], y_coords[i]);
    let m_i = mass[i];
    let size_i = point_sizes[i];
    let width = 2.0 * radius[0];
    let opening_root = width * width / (params.tau * params.tau);

    var force = vec2<f32>(0.0);
    var stack_node: array<u32, STACK_SIZE>;
    var stack_depth: array<u32, STACK_SIZE>;
    var top = 1u;
    stack_node[0] = params.num_nodes;
    stack_depth[0] = 0u;

    while (top > 0u) {
        top -= 1u;
        let node = stack_node[top];
        let depth = stack_depth[top];
        for (var j = 0u; j < 4u; j++) {
            let child = children[node * 4u + j];
            if (child < 0 || u32(child) == i) {
                continue;
            }
            let c = u32(child);
            let d = p - vec2<f32>(x_coords[c], y_coords[c]);
            let d2 = dot(d, d);
            let child_depth = min(depth + 1u, MAX_TRAVERSAL_DEPTH - 1u);
            let opening = opening_root * exp2(-2.0 * f32(child_depth));
            if (c < params.num_bodies) {
                force += repulsion(m_i, mass[c], d, size_i + point_sizes[c]);
            } else if (d2 >= opening || top >= STACK_SIZE) {
                force += repulsion(m_i, mass[c], d, -1.0);
            } else {
                stack_node[top] = c;
                stack_depth[top] = depth + 1u;
                top += 1u;
            }
        }
    }
    return force;
}

// ============================================================================
// Edge attraction, one run of edges per work item
// ============================================================================

fn forward_attraction(i: u32, p: vec2<f32>) -> vec2<f32> {
    var force = vec2<f32>(0.0);
    if (params.forward_edges == 0u) {
        return force;
    }
    let first_edge = forward_work_items[i * 4u];
    let count = forward_work_items[i * 4u + 1u];
    for (var e = first_edge; e < first_edge + count; e++) {
        let j = forward_edges[2u * e + 1u];
        let d = vec2<f32>(x_coords[j], y_coords[j]) - p;
        force += attraction(mass[i], forward_weights[e], d, point_sizes[i] + point_sizes[j]);
    }
    return force;
}

fn backward_attraction(i: u32, p: vec2<f32>) -> vec2<f32> {
    var force = vec2<f32>(0.0);
    if (params.backward_edges == 0u) {
        return force;
    }
    let first_edge = backward_work_items[i * 4u];
    let count = backward_work_items[i * 4u + 1u];
    for (var e = first_edge; e < first_edge + count; e++) {
        let j = backward_edges[2u * e + 1u];
        let d = vec2<f32>(x_coords[j], y_coords[j]) - p;
        force += attraction(mass[i], backward_weights[e], d, point_sizes[i] + point_sizes[j]);
    }
    return force;
}

// ============================================================================
// Main
// ============================================================================

@compute @workgroup_size(256)
fn main(
    @builtin(global_invocation_id) global_id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>
) {
    let stride = groups.x * 256u;
    for (var k = global_id.x; k < params.num_bodies; k += stride) {
        let body = sort[k];
        if (body < 0 || u32(body) >= params.num_bodies) {
            continue;
        }
        let i = u32(body);
        let p = vec2<f32>(x_coords[i], y_coords[i]);
        var force = tree_repulsion(i) + gravity(mass[i], p);
        force += forward_attraction(i, p);
        force += backward_attraction(i, p);
        point_forces[2u * i] = force.x;
        point_forces[2u * i + 1u] = force.y;
    }
}
"#;

/// Stage 7: move every point along its force, damped by its swing.
pub const INTEGRATE_SHADER: &str = r#"
struct IntegrateParams {
    num_points: u32,
    adjust_sizes: u32,
    _pad0: u32,
    _pad1: u32,
}

@group(0) @binding(0) var<storage, read_write> positions: array<f32>;
@group(0) @binding(1) var<storage, read> point_forces: array<f32>;
@group(0) @binding(2) var<storage, read_write> prev_forces: array<f32>;
@group(0) @binding(3) var<storage, read_write> swings: array<f32>;
@group(0) @binding(4) var<storage, read_write> tractions: array<f32>;
@group(0) @binding(5) var<storage, read> point_degrees: array<u32>;
@group(0) @binding(6) var<storage, read> global_speed: array<f32>;
@group(0) @binding(7) var<uniform> params: IntegrateParams;

const MAX_ADJUSTED_DISPLACEMENT: f32 = 10.0;

@compute @workgroup_size(256)
fn main(
    @builtin(global_invocation_id) global_id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>
) {
    let stride = groups.x * 256u;
    let speed = global_speed[0];
    for (var i = global_id.x; i < params.num_points; i += stride) {
        let force = vec2<f32>(point_forces[2u * i], point_forces[2u * i + 1u]);
        let prev = vec2<f32>(prev_forces[2u * i], prev_forces[2u * i + 1u]);
        let m = f32(point_degrees[i]) + 1.0;
        let swing = m * length(force - prev);
        swings[i] = swing;
        tractions[i] = m * length(force + prev) * 0.5;

        var factor = speed / (1.0 + sqrt(speed * swing));
        if (params.adjust_sizes != 0u) {
            factor *= 0.1;
            let df = length(force);
            if (df > 0.0) {
                factor = min(factor * df, MAX_ADJUSTED_DISPLACEMENT) / df;
            }
        }
        positions[2u * i] += force.x * factor;
        positions[2u * i + 1u] += force.y * factor;
        prev_forces[2u * i] = force.x;
        prev_forces[2u * i + 1u] = force.y;
    }
}
"#;

/// Translate every selected point by `region.xy`.
pub const MOVE_NODES_SHADER: &str = r#"
struct QueryParams {
    num_points: u32,
    shape: u32,
    _pad0: u32,
    _pad1: u32,
    region: vec4<f32>,
}

@group(0) @binding(0) var<storage, read_write> positions: array<f32>;
@group(0) @binding(1) var<storage, read> selection: array<u32>;
@group(0) @binding(2) var<uniform> params: QueryParams;

@compute @workgroup_size(256)
fn main(
    @builtin(global_invocation_id) global_id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>
) {
    let stride = groups.x * 256u;
    for (var i = global_id.x; i < params.num_points; i += stride) {
        if (selection[i] != 0u) {
            positions[2u * i] += params.region.x;
            positions[2u * i + 1u] += params.region.y;
        }
    }
}
"#;

/// Write a 0/1 selection mask for a rectangle (`shape` 0, `region` = min, max)
/// or a circle (`shape` 1, `region` = center, radius).
pub const SELECT_NODES_SHADER: &str = r#"
struct QueryParams {
    num_points: u32,
    shape: u32,
    _pad0: u32,
    _pad1: u32,
    region: vec4<f32>,
}

@group(0) @binding(0) var<storage, read> positions: array<f32>;
@group(0) @binding(1) var<storage, read_write> selection: array<u32>;
@group(0) @binding(2) var<uniform> params: QueryParams;

fn inside(p: vec2<f32>) -> bool {
    let r = params.region;
    if (params.shape == 0u) {
        return p.x >= r.x && p.x <= r.z && p.y >= r.y && p.y <= r.w;
    }
    let d = p - r.xy;
    return dot(d, d) <= r.z * r.z;
}

@compute @workgroup_size(256)
fn main(
    @builtin(global_invocation_id) global_id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>
) {
    let stride = groups.x * 256u;
    for (var i = global_id.x; i < params.num_points; i += stride) {
        let p = vec2<f32>(positions[2u * i], positions[2u * i + 1u]);
        selection[i] = select(0u, 1u, inside(p));
    }
}
"#;
