//! WGSL compute shaders for the Barnes-Hut tree stages.
//!
//! Node arrays follow the Burtscher-Pingali layout: bodies at `0..num_bodies`,
//! cells allocated downward from the root at `num_nodes`, four child slots per
//! node with `-1` for empty and `-2` for a slot locked during insertion.
//!
//! 1. TO_BARNES_LAYOUT_SHADER: positions and degrees into body coordinates and mass
//! 2. BOUND_BOX_SHADER: per-group bounds and swing reduction, then root and speed
//! 3. BUILD_TREE_SHADER: lock-free concurrent insertion
//! 4. COMPUTE_SUMS_SHADER: bottom-up mass and center of mass
//! 5. SORT_SHADER: top-down depth-first body order

/// Stage 1: copy positions into the tree input and derive mass from degree.
pub const TO_BARNES_LAYOUT_SHADER: &str = r#"
struct StageParams {
    num_bodies: u32,
    num_nodes: u32,
    num_groups: u32,
    step: u32,
}

@group(0) @binding(0) var<storage, read> positions: array<f32>;
@group(0) @binding(1) var<storage, read> point_degrees: array<u32>;
@group(0) @binding(2) var<storage, read_write> x_coords: array<f32>;
@group(0) @binding(3) var<storage, read_write> y_coords: array<f32>;
@group(0) @binding(4) var<storage, read_write> mass: array<f32>;
@group(0) @binding(5) var<storage, read_write> blocked: array<i32>;
@group(0) @binding(6) var<storage, read_write> max_depth: array<i32>;
@group(0) @binding(7) var<uniform> params: StageParams;

@compute @workgroup_size(256)
fn main(
    @builtin(global_invocation_id) global_id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>
) {
    let stride = groups.x * 256u;
    if (global_id.x == 0u) {
        blocked[0] = 0;
        max_depth[0] = 1;
    }
    for (var i = global_id.x; i < params.num_bodies; i += stride) {
        x_coords[i] = positions[2u * i];
        y_coords[i] = positions[2u * i + 1u];
        mass[i] = f32(point_degrees[i]) + 1.0;
    }
}
"#;

/// Stage 2: bounding box and speed control.
///
/// `reduce` runs on the stage geometry and leaves one partial per group;
/// `finalize` runs as a single group and folds the partials.
pub const BOUND_BOX_SHADER: &str = r#"
struct BoundBoxParams {
    num_bodies: u32,
    num_nodes: u32,
    num_groups: u32,
    jitter_tolerance: f32,
}

@group(0) @binding(0) var<storage, read_write> x_coords: array<f32>;
@group(0) @binding(1) var<storage, read_write> y_coords: array<f32>;
@group(0) @binding(2) var<storage, read_write> mass: array<f32>;
@group(0) @binding(3) var<storage, read_write> children: array<i32>;
@group(0) @binding(4) var<storage, read_write> start: array<i32>;
@group(0) @binding(5) var<storage, read_write> x_mins: array<f32>;
@group(0) @binding(6) var<storage, read_write> x_maxs: array<f32>;
@group(0) @binding(7) var<storage, read_write> y_mins: array<f32>;
@group(0) @binding(8) var<storage, read_write> y_maxs: array<f32>;
@group(0) @binding(9) var<storage, read> swings: array<f32>;
@group(0) @binding(10) var<storage, read> tractions: array<f32>;
@group(0) @binding(11) var<storage, read_write> global_swings: array<f32>;
@group(0) @binding(12) var<storage, read_write> global_tractions: array<f32>;
@group(0) @binding(13) var<storage, read_write> global_speed: array<f32>;
@group(0) @binding(14) var<storage, read_write> blocked: array<i32>;
@group(0) @binding(15) var<storage, read_write> step_counter: array<i32>;
@group(0) @binding(16) var<storage, read_write> bottom: array<i32>;
@group(0) @binding(17) var<storage, read_write> max_depth: array<i32>;
@group(0) @binding(18) var<storage, read_write> radius: array<f32>;
@group(0) @binding(19) var<uniform> params: BoundBoxParams;

const MIN_RADIUS: f32 = 1e-3;
const MAX_SWING_RATIO: f32 = 2.0;
const MIN_SPEED_EFFICIENCY: f32 = 0.05;
const MAX_SPEED: f32 = 1000.0;
const MAX_RISE: f32 = 0.5;
const CEILING_DECAY: f32 = 0.95;
const MAX_JITTER_SCALE: f32 = 10.0;

var<workgroup> local_min_x: array<f32, 256>;
var<workgroup> local_min_y: array<f32, 256>;
var<workgroup> local_max_x: array<f32, 256>;
var<workgroup> local_max_y: array<f32, 256>;
var<workgroup> local_swing: array<f32, 256>;
var<workgroup> local_traction: array<f32, 256>;

fn fold_shared(lid: u32) {
    for (var stride = 128u; stride > 0u; stride >>= 1u) {
        if (lid < stride) {
            local_min_x[lid] = min(local_min_x[lid], local_min_x[lid + stride]);
            local_min_y[lid] = min(local_min_y[lid], local_min_y[lid + stride]);
            local_max_x[lid] = max(local_max_x[lid], local_max_x[lid + stride]);
            local_max_y[lid] = max(local_max_y[lid], local_max_y[lid + stride]);
            local_swing[lid] += local_swing[lid + stride];
            local_traction[lid] += local_traction[lid + stride];
        }
        workgroupBarrier();
    }
}

@compute @workgroup_size(256)
fn reduce(
    @builtin(local_invocation_id) local_id: vec3<u32>,
    @builtin(workgroup_id) wg_id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>
) {
    let lid = local_id.x;
    let stride = groups.x * 256u;

    var min_x = 3.4e38;
    var min_y = 3.4e38;
    var max_x = -3.4e38;
    var max_y = -3.4e38;
    var swing = 0.0;
    var traction = 0.0;
    for (var i = wg_id.x * 256u + lid; i < params.num_bodies; i += stride) {
        let x = x_coords[i];
        let y = y_coords[i];
        min_x = min(min_x, x);
        min_y = min(min_y, y);
        max_x = max(max_x, x);
        max_y = max(max_y, y);
        // Swing and traction of the previous tick, weighted by mass.
        swing += mass[i] * swings[i];
        traction += mass[i] * tractions[i];
    }

    local_min_x[lid] = min_x;
    local_min_y[lid] = min_y;
    local_max_x[lid] = max_x;
    local_max_y[lid] = max_y;
    local_swing[lid] = swing;
    local_traction[lid] = traction;
    workgroupBarrier();
    fold_shared(lid);

    if (lid == 0u) {
        let g = wg_id.x;
        x_mins[g] = local_min_x[0];
        x_maxs[g] = local_max_x[0];
        y_mins[g] = local_min_y[0];
        y_maxs[g] = local_max_y[0];
        global_swings[g] = local_swing[0];
        global_tractions[g] = local_traction[0];
    }
}

fn adapt_speed(total_swing: f32, total_traction: f32) {
    if (!(total_swing > 0.0 && total_traction > 0.0) || params.num_bodies == 0u) {
        return;
    }
    let speed = global_speed[0];
    var efficiency = global_speed[1];
    let n = f32(params.num_bodies);
    let estimated = 0.05 * sqrt(n);
    let min_jitter = sqrt(estimated);
    var jitter = params.jitter_tolerance
        * max(min_jitter, min(MAX_JITTER_SCALE, estimated * total_traction / (n * n)));

    if (total_swing / total_traction > MAX_SWING_RATIO) {
        if (efficiency > MIN_SPEED_EFFICIENCY) {
            efficiency *= 0.5;
        }
        jitter = max(jitter, params.jitter_tolerance);
    }

    let target_speed = jitter * efficiency * total_traction / total_swing;

    var ceiling = global_speed[2];
    if (total_swing > jitter * total_traction) {
        if (efficiency > MIN_SPEED_EFFICIENCY) {
            efficiency *= 0.7;
        }
        ceiling = min(ceiling, speed);
    } else if (speed < MAX_SPEED) {
        efficiency *= 1.3;
    }
    if (ceiling < MAX_SPEED) {
        ceiling *= CEILING_DECAY;
    }

    global_speed[0] = min(speed + min(target_speed - speed, MAX_RISE * speed), ceiling);
    global_speed[1] = efficiency;
    global_speed[2] = ceiling;
}

@compute @workgroup_size(256)
fn finalize(@builtin(local_invocation_id) local_id: vec3<u32>) {
    let lid = local_id.x;

    var min_x = 3.4e38;
    var min_y = 3.4e38;
    var max_x = -3.4e38;
    var max_y = -3.4e38;
    var swing = 0.0;
    var traction = 0.0;
    for (var g = lid; g < params.num_groups; g += 256u) {
        min_x = min(min_x, x_mins[g]);
        min_y = min(min_y, y_mins[g]);
        max_x = max(max_x, x_maxs[g]);
        max_y = max(max_y, y_maxs[g]);
        swing += global_swings[g];
        traction += global_tractions[g];
    }

    local_min_x[lid] = min_x;
    local_min_y[lid] = min_y;
    local_max_x[lid] = max_x;
    local_max_y[lid] = max_y;
    local_swing[lid] = swing;
    local_traction[lid] = traction;
    workgroupBarrier();
    fold_shared(lid);

    if (lid == 0u) {
        let r = max(
            max(local_max_x[0] - local_min_x[0], local_max_y[0] - local_min_y[0]) * 0.5,
            MIN_RADIUS
        );
        let root = params.num_nodes;
        x_coords[root] = (local_min_x[0] + local_max_x[0]) * 0.5;
        y_coords[root] = (local_min_y[0] + local_max_y[0]) * 0.5;
        mass[root] = -1.0;
        start[root] = 0;
        for (var j = 0u; j < 4u; j++) {
            children[root * 4u + j] = -1;
        }
        radius[0] = r;
        bottom[0] = i32(root);
        max_depth[0] = 1;
        blocked[0] = 0;
        step_counter[0] = step_counter[0] + 1;
        adapt_speed(local_swing[0], local_traction[0]);
    }
}
"#;

/// Stage 3: concurrent insertion.
///
/// A thread locks the slot it splits, builds the new cells privately and
/// publishes the topmost one by unlocking. `blocked` counts inserted bodies;
/// the host treats a short count as a failed build.
pub const BUILD_TREE_SHADER: &str = r#"
struct StageParams {
    num_bodies: u32,
    num_nodes: u32,
    num_groups: u32,
    step: u32,
}

@group(0) @binding(0) var<storage, read_write> x_coords: array<f32>;
@group(0) @binding(1) var<storage, read_write> y_coords: array<f32>;
@group(0) @binding(2) var<storage, read_write> mass: array<f32>;
@group(0) @binding(3) var<storage, read_write> children: array<atomic<i32>>;
@group(0) @binding(4) var<storage, read_write> start: array<i32>;
@group(0) @binding(5) var<storage, read_write> blocked: array<atomic<i32>>;
@group(0) @binding(6) var<storage, read_write> bottom: array<atomic<i32>>;
@group(0) @binding(7) var<storage, read_write> max_depth: array<atomic<i32>>;
@group(0) @binding(8) var<storage, read> radius: array<f32>;
@group(0) @binding(9) var<uniform> params: StageParams;

const LOCKED: i32 = -2;
const NUDGE_DEPTH: i32 = 32;
const MAX_NUDGES: u32 = 8u;
const MAX_SPINS: u32 = 1048576u;
const GOLDEN_ANGLE: f32 = 2.399963;

fn quadrant(cx: f32, cy: f32, px: f32, py: f32) -> u32 {
    var j = 0u;
    if (cx < px) {
        j = 1u;
    }
    if (cy < py) {
        j += 2u;
    }
    return j;
}

fn nudge(i: u32, attempt: u32, r: f32) {
    let px = x_coords[i];
    let py = y_coords[i];
    let magnitude = max(r * 1e-4, max(abs(px), abs(py)) * 1e-5) * f32(1u << attempt);
    let angle = f32(i) * GOLDEN_ANGLE + f32(attempt);
    x_coords[i] = px + magnitude * cos(angle);
    y_coords[i] = py + magnitude * sin(angle);
}

@compute @workgroup_size(256)
fn main(
    @builtin(global_invocation_id) global_id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>
) {
    let stride = groups.x * 256u;
    let bodies = i32(params.num_bodies);
    let root = params.num_nodes;
    let root_radius = radius[0];

    var i = global_id.x;
    var restart = true;
    var n = root;
    var depth = 1;
    var r = root_radius;
    var j = 0u;
    var nudges = 0u;
    var spins = 0u;

    loop {
        if (i >= params.num_bodies || spins >= MAX_SPINS) {
            break;
        }
        spins += 1u;

        let px = x_coords[i];
        let py = y_coords[i];
        if (restart) {
            restart = false;
            n = root;
            depth = 1;
            r = root_radius;
            j = quadrant(x_coords[n], y_coords[n], px, py);
        }

        var child = atomicLoad(&children[n * 4u + j]);
        while (child >= bodies) {
            n = u32(child);
            depth += 1;
            r *= 0.5;
            j = quadrant(x_coords[n], y_coords[n], px, py);
            child = atomicLoad(&children[n * 4u + j]);
        }
        if (child == LOCKED) {
            continue;
        }

        let slot = n * 4u + j;
        if (child == -1) {
            if (atomicCompareExchangeWeak(&children[slot], -1, i32(i)).exchanged) {
                atomicMax(&max_depth[0], depth);
                atomicAdd(&blocked[0], 1);
                i += stride;
                restart = true;
                nudges = 0u;
            }
            continue;
        }

        if (!atomicCompareExchangeWeak(&children[slot], child, LOCKED).exchanged) {
            continue;
        }

        if (depth >= NUDGE_DEPTH) {
            atomicStore(&children[slot], child);
            nudges += 1u;
            if (nudges > MAX_NUDGES) {
                i += stride;
                nudges = 0u;
            } else {
                nudge(i, nudges, root_radius);
            }
            restart = true;
            continue;
        }

        let other = u32(child);
        var published = -1;
        var parent = n;
        var quad = j;
        var half = r;
        var cell_depth = depth;
        var exhausted = false;
        var coincident = false;
        loop {
            let cell = atomicSub(&bottom[0], 1) - 1;
            if (cell <= bodies) {
                exhausted = true;
                break;
            }
            let c = u32(cell);
            cell_depth += 1;
            half *= 0.5;
            if (published != -1) {
                atomicStore(&children[parent * 4u + quad], cell);
            }
            published = max(published, cell);

            x_coords[c] = x_coords[parent] + select(-half, half, (quad & 1u) != 0u);
            y_coords[c] = y_coords[parent] + select(-half, half, (quad & 2u) != 0u);
            mass[c] = -1.0;
            start[c] = -1;
            for (var k = 0u; k < 4u; k++) {
                atomicStore(&children[c * 4u + k], -1);
            }
            atomicMax(&max_depth[0], cell_depth);

            let k = quadrant(x_coords[c], y_coords[c], x_coords[other], y_coords[other]);
            atomicStore(&children[c * 4u + k], i32(other));

            parent = c;
            quad = quadrant(x_coords[c], y_coords[c], px, py);
            if (atomicLoad(&children[c * 4u + quad]) < 0) {
                break;
            }
            if (cell_depth >= NUDGE_DEPTH) {
                coincident = true;
                break;
            }
        }

        if (exhausted) {
            atomicStore(&children[slot], select(child, published, published != -1));
            break;
        }
        if (coincident) {
            atomicStore(&children[slot], published);
            nudges += 1u;
            if (nudges > MAX_NUDGES) {
                i += stride;
                nudges = 0u;
            } else {
                nudge(i, nudges, root_radius);
            }
            restart = true;
            continue;
        }

        atomicStore(&children[parent * 4u + quad], i32(i));
        atomicAdd(&blocked[0], 1);
        atomicStore(&children[slot], published);
        i += stride;
        restart = true;
        nudges = 0u;
    }
}
"#;

/// Stage 4: summarization.
///
/// Runs as one work group in rounds. A cell is marked in the first phase of
/// a round once all its children are summarized and written in the second,
/// so no cell is read in the round it is written.
pub const COMPUTE_SUMS_SHADER: &str = r#"
struct StageParams {
    num_bodies: u32,
    num_nodes: u32,
    num_groups: u32,
    step: u32,
}

@group(0) @binding(0) var<storage, read_write> x_coords: array<f32>;
@group(0) @binding(1) var<storage, read_write> y_coords: array<f32>;
@group(0) @binding(2) var<storage, read_write> mass: array<f32>;
@group(0) @binding(3) var<storage, read> children: array<i32>;
@group(0) @binding(4) var<storage, read_write> count: array<i32>;
@group(0) @binding(5) var<storage, read> bottom: array<i32>;
@group(0) @binding(6) var<uniform> params: StageParams;

const READY: i32 = -2;
const MAX_ROUNDS: u32 = 128u;

var<workgroup> pending: atomic<u32>;
var<workgroup> more: u32;

fn cells_start() -> u32 {
    let b = bottom[0];
    if (b < i32(params.num_bodies) || b > i32(params.num_nodes)) {
        return params.num_nodes + 1u;
    }
    return u32(b);
}

@compute @workgroup_size(256)
fn main(@builtin(local_invocation_id) local_id: vec3<u32>) {
    let lid = local_id.x;
    let first_cell = cells_start();
    let root = params.num_nodes;

    for (var i = lid; i < params.num_bodies; i += 256u) {
        count[i] = 1;
    }
    for (var k = first_cell + lid; k <= root; k += 256u) {
        count[k] = 0;
    }
    storageBarrier();
    workgroupBarrier();

    for (var pass_index = 0u; pass_index < MAX_ROUNDS; pass_index++) {
        if (lid == 0u) {
            atomicStore(&pending, 0u);
        }
        workgroupBarrier();

        for (var k = first_cell + lid; k <= root; k += 256u) {
            if (mass[k] >= 0.0) {
                continue;
            }
            var ready = true;
            for (var j = 0u; j < 4u; j++) {
                let child = children[k * 4u + j];
                if (child >= 0 && mass[u32(child)] < 0.0) {
                    ready = false;
                }
            }
            if (ready) {
                count[k] = READY;
            } else {
                atomicStore(&pending, 1u);
            }
        }
        storageBarrier();
        workgroupBarrier();

        for (var k = first_cell + lid; k <= root; k += 256u) {
            if (count[k] != READY) {
                continue;
            }
            var m = 0.0;
            var cx = 0.0;
            var cy = 0.0;
            var bodies = 0;
            for (var j = 0u; j < 4u; j++) {
                let child = children[k * 4u + j];
                if (child >= 0) {
                    let c = u32(child);
                    let cm = mass[c];
                    m += cm;
                    cx += x_coords[c] * cm;
                    cy += y_coords[c] * cm;
                    bodies += count[c];
                }
            }
            if (m > 0.0) {
                x_coords[k] = cx / m;
                y_coords[k] = cy / m;
            }
            count[k] = bodies;
            mass[k] = m;
        }
        storageBarrier();

        if (lid == 0u) {
            more = atomicLoad(&pending);
        }
        if (workgroupUniformLoad(&more) == 0u) {
            break;
        }
    }
}
"#;

/// Stage 5: depth-first body order.
///
/// One work group in rounds; a cell is expanded once its start offset is
/// known. Expanding a cell again writes the same values.
pub const SORT_SHADER: &str = r#"
struct StageParams {
    num_bodies: u32,
    num_nodes: u32,
    num_groups: u32,
    step: u32,
}

@group(0) @binding(0) var<storage, read> children: array<i32>;
@group(0) @binding(1) var<storage, read_write> start: array<atomic<i32>>;
@group(0) @binding(2) var<storage, read_write> sort: array<i32>;
@group(0) @binding(3) var<storage, read> count: array<i32>;
@group(0) @binding(4) var<storage, read> bottom: array<i32>;
@group(0) @binding(5) var<uniform> params: StageParams;

const MAX_ROUNDS: u32 = 128u;

var<workgroup> pending: atomic<u32>;
var<workgroup> more: u32;

fn cells_start() -> u32 {
    let b = bottom[0];
    if (b < i32(params.num_bodies) || b > i32(params.num_nodes)) {
        return params.num_nodes + 1u;
    }
    return u32(b);
}

@compute @workgroup_size(256)
fn main(@builtin(local_invocation_id) local_id: vec3<u32>) {
    let lid = local_id.x;
    let first_cell = cells_start();
    let root = params.num_nodes;
    let bodies = i32(params.num_bodies);

    if (lid == 0u) {
        atomicStore(&start[root], 0);
    }
    storageBarrier();
    workgroupBarrier();

    for (var pass_index = 0u; pass_index < MAX_ROUNDS; pass_index++) {
        if (lid == 0u) {
            atomicStore(&pending, 0u);
        }
        workgroupBarrier();

        for (var k = first_cell + lid; k <= root; k += 256u) {
            var offset = atomicLoad(&start[k]);
            if (offset < 0) {
                atomicStore(&pending, 1u);
                continue;
            }
            for (var j = 0u; j < 4u; j++) {
                let child = children[k * 4u + j];
                if (child >= bodies) {
                    atomicStore(&start[u32(child)], offset);
                    offset += count[u32(child)];
                } else if (child >= 0) {
                    sort[u32(offset)] = child;
                    offset += 1;
                }
            }
        }
        storageBarrier();

        if (lid == 0u) {
            more = atomicLoad(&pending);
        }
        if (workgroupUniformLoad(&more) == 0u) {
            break;
        }
    }
}
"#;
