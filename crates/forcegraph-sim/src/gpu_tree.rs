//! Kernel programs for the wgpu device.
//!
//! A program is a WGSL module plus the passes dispatched from it. Storage
//! buffers bind at `0..k` in the order of the kernel's argument struct and
//! the uniform block binds at `k`.

use crate::device::BufferHandle;
use crate::kernels::{KernelId, Region, StageArgs};
use crate::shaders::{CALCULATE_FORCES_SHADER, INTEGRATE_SHADER, MOVE_NODES_SHADER, SELECT_NODES_SHADER};
use crate::sizes::DispatchGeometry;
use crate::tree_shaders::{
    BOUND_BOX_SHADER, BUILD_TREE_SHADER, COMPUTE_SUMS_SHADER, SORT_SHADER, TO_BARNES_LAYOUT_SHADER,
};

/// How many work groups a pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PassGroups {
    /// The stage geometry.
    Geometry,
    /// One group that loops over the whole range.
    Single,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Pass {
    pub entry: &'static str,
    pub groups: PassGroups,
}

/// Access of one storage binding; must match the WGSL declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    ReadWrite,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Program {
    pub source: &'static str,
    pub passes: &'static [Pass],
    pub storage: &'static [Access],
}

const MAIN: &[Pass] = &[Pass {
    entry: "main",
    groups: PassGroups::Geometry,
}];

const MAIN_SINGLE: &[Pass] = &[Pass {
    entry: "main",
    groups: PassGroups::Single,
}];

const BOUND_BOX_PASSES: &[Pass] = &[
    Pass {
        entry: "reduce",
        groups: PassGroups::Geometry,
    },
    Pass {
        entry: "finalize",
        groups: PassGroups::Single,
    },
];

pub(crate) fn program(kernel: KernelId) -> Program {
    use Access::{Read as R, ReadWrite as W};

    let (source, passes, storage): (_, _, &'static [Access]) = match kernel {
        KernelId::ToBarnesLayout => (TO_BARNES_LAYOUT_SHADER, MAIN, &[R, R, W, W, W, W, W]),
        KernelId::BoundBox => (
            BOUND_BOX_SHADER,
            BOUND_BOX_PASSES,
            &[W, W, W, W, W, W, W, W, W, R, R, W, W, W, W, W, W, W, W],
        ),
        KernelId::BuildTree => (BUILD_TREE_SHADER, MAIN, &[W, W, W, W, W, W, W, W, R]),
        KernelId::ComputeSums => (COMPUTE_SUMS_SHADER, MAIN_SINGLE, &[W, W, W, R, W, R]),
        KernelId::Sort => (SORT_SHADER, MAIN_SINGLE, &[R, W, W, R, R]),
        KernelId::CalculateForces => (
            CALCULATE_FORCES_SHADER,
            MAIN,
            &[R, R, R, R, R, R, R, R, R, R, R, R, R, R, W],
        ),
        KernelId::Integrate => (INTEGRATE_SHADER, MAIN, &[W, R, W, W, W, R, R]),
        KernelId::MoveNodes => (MOVE_NODES_SHADER, MAIN, &[W, R]),
        KernelId::SelectNodes => (SELECT_NODES_SHADER, MAIN, &[R, W]),
    };
    Program {
        source,
        passes,
        storage,
    }
}

/// Matches `StageParams` in the tree shaders.
#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub(crate) struct StageUniform {
    pub num_bodies: u32,
    pub num_nodes: u32,
    pub num_groups: u32,
    pub step: u32,
}

/// Matches `BoundBoxParams`.
#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub(crate) struct BoundBoxUniform {
    pub num_bodies: u32,
    pub num_nodes: u32,
    pub num_groups: u32,
    pub jitter_tolerance: f32,
}

/// Matches `ForceParams` in the force shader.
#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub(crate) struct ForceUniform {
    pub num_bodies: u32,
    pub num_nodes: u32,
    pub forward_edges: u32,
    pub backward_edges: u32,
    pub scaling_ratio: f32,
    pub gravity: f32,
    pub edge_influence: f32,
    pub tau: f32,
    pub flags: u32,
    pub _pad: [u32; 3],
}

/// Matches `IntegrateParams`.
#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub(crate) struct IntegrateUniform {
    pub num_points: u32,
    pub adjust_sizes: u32,
    pub _pad: [u32; 2],
}

/// Matches `QueryParams` in the move and select shaders.
#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub(crate) struct QueryUniform {
    pub num_points: u32,
    pub shape: u32,
    pub _pad: [u32; 2],
    pub region: [f32; 4],
}

/// Everything one dispatch binds.
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub storage: Vec<BufferHandle>,
    pub uniform: Vec<u8>,
    /// Work groups of [`PassGroups::Geometry`] passes.
    pub groups: u32,
}

fn uniform<T: bytemuck::Pod>(value: T) -> Vec<u8> {
    bytemuck::bytes_of(&value).to_vec()
}

pub(crate) fn invocation(args: &StageArgs, geometry: &DispatchGeometry) -> Invocation {
    let groups = geometry.work_groups().max(1);
    let (storage, uniform, groups) = match args {
        StageArgs::ToBarnesLayout(a) => (
            vec![a.positions, a.degrees, a.x_coords, a.y_coords, a.mass, a.blocked, a.max_depth],
            uniform(StageUniform {
                num_bodies: a.num_points,
                num_nodes: a.num_nodes,
                num_groups: groups,
                step: a.step_number,
            }),
            groups,
        ),
        StageArgs::BoundBox(a) => {
            // Partials are stored per group, so never run more groups than slots.
            let groups = groups.min(a.num_work_groups).max(1);
            (
                vec![
                    a.x_coords,
                    a.y_coords,
                    a.mass,
                    a.children,
                    a.start,
                    a.x_mins,
                    a.x_maxs,
                    a.y_mins,
                    a.y_maxs,
                    a.swings,
                    a.tractions,
                    a.global_swings,
                    a.global_tractions,
                    a.global_speed,
                    a.blocked,
                    a.step,
                    a.bottom,
                    a.max_depth,
                    a.radius,
                ],
                uniform(BoundBoxUniform {
                    num_bodies: a.num_bodies,
                    num_nodes: a.num_nodes,
                    num_groups: groups,
                    jitter_tolerance: a.jitter_tolerance,
                }),
                groups,
            )
        }
        StageArgs::BuildTree(a) => (
            vec![
                a.x_coords,
                a.y_coords,
                a.mass,
                a.children,
                a.start,
                a.blocked,
                a.bottom,
                a.max_depth,
                a.radius,
            ],
            uniform(StageUniform {
                num_bodies: a.num_bodies,
                num_nodes: a.num_nodes,
                num_groups: groups,
                step: 0,
            }),
            groups,
        ),
        StageArgs::ComputeSums(a) => (
            vec![a.x_coords, a.y_coords, a.mass, a.children, a.count, a.bottom],
            uniform(StageUniform {
                num_bodies: a.num_bodies,
                num_nodes: a.num_nodes,
                num_groups: 1,
                step: 0,
            }),
            groups,
        ),
        StageArgs::Sort(a) => (
            vec![a.children, a.start, a.sort, a.count, a.bottom],
            uniform(StageUniform {
                num_bodies: a.num_bodies,
                num_nodes: a.num_nodes,
                num_groups: 1,
                step: 0,
            }),
            groups,
        ),
        StageArgs::CalculateForces(a) => (
            vec![
                a.x_coords,
                a.y_coords,
                a.mass,
                a.children,
                a.sort,
                a.max_depth,
                a.radius,
                a.point_sizes,
                a.forward.edges,
                a.forward.work_items,
                a.forward.weights,
                a.backward.edges,
                a.backward.work_items,
                a.backward.weights,
                a.point_forces,
            ],
            uniform(ForceUniform {
                num_bodies: a.num_bodies,
                num_nodes: a.num_nodes,
                forward_edges: a.forward.edge_count,
                backward_edges: a.backward.edge_count,
                scaling_ratio: a.params.scaling_ratio,
                gravity: a.params.gravity,
                edge_influence: a.params.edge_influence,
                tau: a.params.tau,
                flags: a.params.flags,
                _pad: [0; 3],
            }),
            groups,
        ),
        StageArgs::Integrate(a) => (
            vec![
                a.positions,
                a.point_forces,
                a.prev_forces,
                a.swings,
                a.tractions,
                a.degrees,
                a.global_speed,
            ],
            uniform(IntegrateUniform {
                num_points: a.num_points,
                adjust_sizes: u32::from(a.adjust_sizes),
                _pad: [0; 2],
            }),
            groups,
        ),
        StageArgs::MoveNodes(a) => (
            vec![a.positions, a.selection],
            uniform(QueryUniform {
                num_points: a.num_points,
                shape: 0,
                _pad: [0; 2],
                region: [a.delta[0], a.delta[1], 0.0, 0.0],
            }),
            groups,
        ),
        StageArgs::SelectNodes(a) => {
            let (shape, region) = match a.region {
                Region::Rect { min, max } => (0, [min[0], min[1], max[0], max[1]]),
                Region::Circle { center, radius } => (1, [center[0], center[1], radius, 0.0]),
            };
            (
                vec![a.positions, a.selection],
                uniform(QueryUniform {
                    num_points: a.num_points,
                    shape,
                    _pad: [0; 2],
                    region,
                }),
                groups,
            )
        }
    };
    Invocation {
        storage,
        uniform,
        groups,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{BoundBoxArgs, SelectNodesArgs};

    fn h(id: u64) -> BufferHandle {
        BufferHandle::new(id)
    }

    #[test]
    fn test_uniforms_are_16_byte_multiples() {
        assert_eq!(std::mem::size_of::<StageUniform>() % 16, 0);
        assert_eq!(std::mem::size_of::<BoundBoxUniform>() % 16, 0);
        assert_eq!(std::mem::size_of::<ForceUniform>(), 48);
        assert_eq!(std::mem::size_of::<IntegrateUniform>() % 16, 0);
        assert_eq!(std::mem::size_of::<QueryUniform>(), 32);
    }

    #[test]
    fn test_bound_box_groups_capped_by_slots() {
        let args = StageArgs::BoundBox(BoundBoxArgs {
            x_coords: h(1),
            y_coords: h(2),
            mass: h(3),
            children: h(4),
            start: h(5),
            x_mins: h(6),
            x_maxs: h(7),
            y_mins: h(8),
            y_maxs: h(9),
            swings: h(10),
            tractions: h(11),
            global_swings: h(12),
            global_tractions: h(13),
            global_speed: h(14),
            blocked: h(15),
            step: h(16),
            bottom: h(17),
            max_depth: h(18),
            radius: h(19),
            num_bodies: 100,
            num_nodes: 1024,
            num_work_groups: 4,
            jitter_tolerance: 1.0,
        });
        let invocation = invocation(&args, &DispatchGeometry::groups(30));
        assert_eq!(invocation.groups, 4);
        assert_eq!(invocation.storage.len(), 19);
        let params: BoundBoxUniform = bytemuck::pod_read_unaligned(&invocation.uniform);
        assert_eq!(params.num_groups, 4);
    }

    #[test]
    fn test_circle_region_packing() {
        let args = StageArgs::SelectNodes(SelectNodesArgs {
            positions: h(1),
            selection: h(2),
            num_points: 3,
            region: Region::Circle {
                center: [1.0, 2.0],
                radius: 5.0,
            },
        });
        let invocation = invocation(&args, &DispatchGeometry::groups(16));
        let params: QueryUniform = bytemuck::pod_read_unaligned(&invocation.uniform);
        assert_eq!(params.shape, 1);
        assert_eq!(params.region, [1.0, 2.0, 5.0, 0.0]);
        assert_eq!(invocation.storage, vec![h(1), h(2)]);
    }

    #[test]
    fn test_programs_match_their_shaders() {
        for kernel in KernelId::BARNES_HUT
            .into_iter()
            .chain([KernelId::Integrate, KernelId::MoveNodes, KernelId::SelectNodes])
        {
            let program = program(kernel);
            for pass in program.passes {
                assert!(program.source.contains(&format!("fn {}(", pass.entry)), "{kernel}");
            }
            let declared = program.source.matches("var<storage,").count();
            let read_only = program.source.matches("var<storage, read>").count();
            assert_eq!(declared, program.storage.len(), "{kernel}");
            assert_eq!(
                read_only,
                program.storage.iter().filter(|a| **a == Access::Read).count(),
                "{kernel}"
            );
            let uniform = format!("@binding({}) var<uniform>", program.storage.len());
            assert!(program.source.contains(&uniform), "{kernel}");
        }
    }
}
