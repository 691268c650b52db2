//! ForceAtlas2 force laws and adaptive speed.
//!
//! These are the host versions of the formulas the WGSL kernels evaluate.
//! Mass is `degree + 1` throughout.

/// Point sizes push overlapping points apart.
pub const FLAG_PREVENT_OVERLAP: u32 = 1;
/// Gravity grows linearly with distance from the origin.
pub const FLAG_STRONG_GRAVITY: u32 = 2;
/// Attraction is divided by the source mass.
pub const FLAG_DISSUADE_HUBS: u32 = 4;
/// Attraction grows with `ln(1 + d)`.
pub const FLAG_LIN_LOG: u32 = 8;

/// Swing/traction ratio above which speed efficiency is halved.
const MAX_SWING_RATIO: f32 = 2.0;
const MIN_SPEED_EFFICIENCY: f32 = 0.05;
const MAX_SPEED: f32 = 1000.0;
const MAX_RISE: f32 = 0.5;
/// Per-tick decay of the speed ceiling once the layout has swung.
const CEILING_DECAY: f32 = 0.95;
const MAX_JITTER_SCALE: f32 = 10.0;
/// Largest displacement per tick in adjust-sizes mode.
const MAX_ADJUSTED_DISPLACEMENT: f32 = 10.0;
/// Repulsion multiplier between overlapping points.
const OVERLAP_REPULSION: f32 = 100.0;

/// Force parameters as consumed by the force kernel.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ForceParams {
    pub scaling_ratio: f32,
    pub gravity: f32,
    pub edge_influence: f32,
    pub tau: f32,
    pub flags: u32,
}

impl ForceParams {
    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

/// Repulsion on a point of mass `m_i` from mass `m_j`; `(dx, dy)` points away from `j`.
///
/// `extent` is the summed size of both points when they are individual
/// points, `None` when `j` is an aggregated cell.
pub fn repulsion(params: &ForceParams, m_i: f32, m_j: f32, dx: f32, dy: f32, extent: Option<f32>) -> [f32; 2] {
    let d2 = dx * dx + dy * dy;
    if d2 <= 0.0 {
        return [0.0, 0.0];
    }
    let k = params.scaling_ratio * m_i * m_j;
    let factor = match extent {
        Some(extent) if params.has(FLAG_PREVENT_OVERLAP) => {
            let gap = d2.sqrt() - extent;
            if gap > 0.0 {
                k / (gap * gap)
            } else if gap < 0.0 {
                OVERLAP_REPULSION * k
            } else {
                0.0
            }
        }
        _ => k / d2,
    };
    [dx * factor, dy * factor]
}

/// Attraction along an edge of `weight`; `(dx, dy)` points towards the neighbor.
pub fn attraction(params: &ForceParams, m_i: f32, weight: f32, dx: f32, dy: f32, extent: Option<f32>) -> [f32; 2] {
    let d = (dx * dx + dy * dy).sqrt();
    if d <= 0.0 {
        return [0.0, 0.0];
    }
    let mut distance = d;
    if let Some(extent) = extent.filter(|_| params.has(FLAG_PREVENT_OVERLAP)) {
        distance -= extent;
        if distance <= 0.0 {
            return [0.0, 0.0];
        }
    }
    let w = if params.edge_influence == 0.0 {
        1.0
    } else if params.edge_influence == 1.0 {
        weight
    } else {
        weight.powf(params.edge_influence)
    };
    let mut magnitude = if params.has(FLAG_LIN_LOG) {
        w * distance.ln_1p()
    } else {
        w * distance
    };
    if params.has(FLAG_DISSUADE_HUBS) {
        magnitude /= m_i;
    }
    [dx / d * magnitude, dy / d * magnitude]
}

/// Pull towards the origin.
pub fn gravity(params: &ForceParams, m_i: f32, x: f32, y: f32) -> [f32; 2] {
    let k = params.gravity * m_i;
    if params.has(FLAG_STRONG_GRAVITY) {
        return [-k * x, -k * y];
    }
    let d = (x * x + y * y).sqrt();
    if d > 0.0 {
        [-k * x / d, -k * y / d]
    } else {
        [0.0, 0.0]
    }
}

/// Mass-weighted swing and traction of one point.
pub fn swing_traction(mass: f32, force: [f32; 2], prev: [f32; 2]) -> (f32, f32) {
    let swing = mass * (force[0] - prev[0]).hypot(force[1] - prev[1]);
    let traction = mass * (force[0] + prev[0]).hypot(force[1] + prev[1]) * 0.5;
    (swing, traction)
}

/// Global speed cell: `[speed, efficiency, ceiling]`.
///
/// The ceiling starts at `MAX_SPEED`. The first tick whose swing exceeds the
/// jitter tolerance pins it to the current speed; from then on it decays every
/// tick, so an oscillating layout cools down instead of ringing.
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct GlobalSpeed {
    pub speed: f32,
    pub efficiency: f32,
    pub ceiling: f32,
}

impl Default for GlobalSpeed {
    fn default() -> Self {
        Self {
            speed: 1.0,
            efficiency: 1.0,
            ceiling: MAX_SPEED,
        }
    }
}

impl GlobalSpeed {
    /// Adapt speed to last tick's totals. Unchanged until both totals are positive.
    pub fn adapt(self, total_swing: f32, total_traction: f32, num_points: u32, jitter_tolerance: f32) -> Self {
        if !(total_swing > 0.0 && total_traction > 0.0) || num_points == 0 {
            return self;
        }
        let n = num_points as f32;
        let estimated = 0.05 * n.sqrt();
        let min_jitter = estimated.sqrt();
        let mut jitter = jitter_tolerance
            * min_jitter.max(MAX_JITTER_SCALE.min(estimated * total_traction / (n * n)));

        let mut efficiency = self.efficiency;
        if total_swing / total_traction > MAX_SWING_RATIO {
            if efficiency > MIN_SPEED_EFFICIENCY {
                efficiency *= 0.5;
            }
            jitter = jitter.max(jitter_tolerance);
        }

        let target = jitter * efficiency * total_traction / total_swing;

        let mut ceiling = self.ceiling;
        if total_swing > jitter * total_traction {
            if efficiency > MIN_SPEED_EFFICIENCY {
                efficiency *= 0.7;
            }
            ceiling = ceiling.min(self.speed);
        } else if self.speed < MAX_SPEED {
            efficiency *= 1.3;
        }
        if ceiling < MAX_SPEED {
            ceiling *= CEILING_DECAY;
        }

        let speed = (self.speed + (target - self.speed).min(MAX_RISE * self.speed)).min(ceiling);
        Self {
            speed,
            efficiency,
            ceiling,
        }
    }
}

/// Displacement of one point for this tick.
pub fn displacement(speed: f32, swing: f32, force: [f32; 2], adjust_sizes: bool) -> [f32; 2] {
    let mut factor = speed / (1.0 + (speed * swing).sqrt());
    if adjust_sizes {
        factor *= 0.1;
        let df = force[0].hypot(force[1]);
        if df > 0.0 {
            factor = (factor * df).min(MAX_ADJUSTED_DISPLACEMENT) / df;
        }
    }
    [force[0] * factor, force[1] * factor]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ForceParams {
        ForceParams {
            scaling_ratio: 2.0,
            gravity: 1.0,
            edge_influence: 0.0,
            tau: 0.5,
            flags: 0,
        }
    }

    #[test]
    fn test_repulsion_magnitude() {
        let f = repulsion(&params(), 1.0, 3.0, 4.0, 0.0, None);
        // kr * mi * mj / d = 2 * 3 / 4
        assert!((f[0] - 1.5).abs() < 1e-6);
        assert_eq!(f[1], 0.0);
        assert_eq!(repulsion(&params(), 1.0, 1.0, 0.0, 0.0, None), [0.0, 0.0]);
    }

    #[test]
    fn test_overlap_repulsion() {
        let mut p = params();
        p.flags = FLAG_PREVENT_OVERLAP;
        let apart = repulsion(&p, 1.0, 1.0, 3.0, 0.0, Some(1.0));
        assert!((apart[0] - 3.0 * 2.0 / 4.0).abs() < 1e-6);
        let overlapping = repulsion(&p, 1.0, 1.0, 0.5, 0.0, Some(1.0));
        assert!((overlapping[0] - 0.5 * 200.0).abs() < 1e-3);
    }

    #[test]
    fn test_attraction_linear_and_log() {
        let f = attraction(&params(), 2.0, 1.0, 3.0, 4.0, None);
        assert!((f[0] - 3.0).abs() < 1e-6 && (f[1] - 4.0).abs() < 1e-6);

        let mut p = params();
        p.flags = FLAG_LIN_LOG | FLAG_DISSUADE_HUBS;
        let f = attraction(&p, 2.0, 1.0, 3.0, 4.0, None);
        let expected = 6.0f32.ln() / 2.0;
        assert!((f[0].hypot(f[1]) - expected).abs() < 1e-5);
    }

    #[test]
    fn test_edge_influence_weights() {
        let mut p = params();
        p.edge_influence = 1.0;
        let f = attraction(&p, 1.0, 3.0, 1.0, 0.0, None);
        assert!((f[0] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_gravity_modes() {
        let g = gravity(&params(), 2.0, 10.0, 0.0);
        assert!((g[0] + 2.0).abs() < 1e-6);

        let mut p = params();
        p.flags = FLAG_STRONG_GRAVITY;
        let g = gravity(&p, 2.0, 10.0, 0.0);
        assert!((g[0] + 20.0).abs() < 1e-6);
        assert_eq!(gravity(&params(), 1.0, 0.0, 0.0), [0.0, 0.0]);
    }

    #[test]
    fn test_speed_rise_capped() {
        let start = GlobalSpeed::default();
        // Tiny swing makes the target speed huge; the rise stays at +50%.
        let next = start.adapt(1e-6, 1.0, 100, 1.0);
        assert!((next.speed - 1.5).abs() < 1e-6);
        assert!(next.efficiency > start.efficiency);
    }

    #[test]
    fn test_speed_drops_when_swinging() {
        let start = GlobalSpeed::default();
        let next = start.adapt(100.0, 1.0, 100, 1.0);
        assert!(next.speed < start.speed);
        assert!(next.efficiency < start.efficiency);
    }

    #[test]
    fn test_ceiling_cools_after_swing() {
        let start = GlobalSpeed::default();
        let calm = start.adapt(1e-6, 1.0, 100, 1.0);
        assert_eq!(calm.ceiling, start.ceiling);

        let swung = GlobalSpeed {
            speed: 4.0,
            ..start
        }
        .adapt(100.0, 1.0, 100, 1.0);
        assert!((swung.ceiling - 4.0 * CEILING_DECAY).abs() < 1e-6);

        // Calm ticks afterwards may not outrun the decaying ceiling.
        let mut speed = swung;
        for _ in 0..20 {
            let next = speed.adapt(1e-6, 1.0, 100, 1.0);
            assert!(next.ceiling < speed.ceiling);
            assert!(next.speed <= next.ceiling);
            speed = next;
        }
    }

    #[test]
    fn test_speed_unchanged_without_history() {
        let start = GlobalSpeed::default();
        assert_eq!(start.adapt(0.0, 0.0, 10, 1.0), start);
    }

    #[test]
    fn test_displacement_damped_by_swing() {
        let calm = displacement(1.0, 0.0, [1.0, 0.0], false);
        let swinging = displacement(1.0, 9.0, [1.0, 0.0], false);
        assert!((calm[0] - 1.0).abs() < 1e-6);
        assert!((swinging[0] - 0.25).abs() < 1e-6);

        let capped = displacement(1.0, 0.0, [1000.0, 0.0], true);
        assert!((capped[0] - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_swing_traction() {
        let (swing, traction) = swing_traction(2.0, [3.0, 0.0], [1.0, 0.0]);
        assert!((swing - 4.0).abs() < 1e-6);
        assert!((traction - 4.0).abs() < 1e-6);
    }
}
