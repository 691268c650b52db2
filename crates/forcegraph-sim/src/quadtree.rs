//! Host implementation of the Barnes-Hut tree kernels.
//!
//! The tree uses the Burtscher-Pingali layout shared with the WGSL kernels:
//! bodies occupy node indices `0..num_bodies`, cells are allocated downward
//! from the root at `num_nodes` to `bottom`, and every node owns four child
//! slots in `children` (`-1` when empty). A cell's mass is `-1` until the
//! summarization pass has visited it.

use crate::fa2::{self, ForceParams};

/// Depth beyond which an inserted body is nudged away from its neighbor.
pub const NUDGE_DEPTH: i32 = 32;
/// Size of the per-depth opening table and of the traversal stack.
pub const MAX_TRAVERSAL_DEPTH: usize = 64;

const MAX_NUDGES: u32 = 8;
const MIN_RADIUS: f32 = 1e-3;
const GOLDEN_ANGLE: f32 = 2.399_963;

/// Axis-aligned bounds of a set of points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            min_x: f32::INFINITY,
            min_y: f32::INFINITY,
            max_x: f32::NEG_INFINITY,
            max_y: f32::NEG_INFINITY,
        }
    }
}

impl Bounds {
    pub fn include(&mut self, x: f32, y: f32) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    pub fn merge(self, other: Bounds) -> Bounds {
        Bounds {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.min_x + self.max_x) * 0.5,
            (self.min_y + self.max_y) * 0.5,
        )
    }

    /// Half the side of the enclosing square.
    pub fn radius(&self) -> f32 {
        let r = (self.max_x - self.min_x).max(self.max_y - self.min_y) * 0.5;
        if r > MIN_RADIUS {
            r
        } else {
            MIN_RADIUS
        }
    }
}

/// Per-group partial bounds, one entry per work group.
pub fn group_bounds(x: &[f32], y: &[f32], groups: usize) -> Vec<Bounds> {
    let groups = groups.max(1);
    let chunk = x.len().div_ceil(groups).max(1);
    let mut partials = vec![Bounds::default(); groups];
    for (i, (&px, &py)) in x.iter().zip(y).enumerate() {
        partials[i / chunk].include(px, py);
    }
    partials
}

/// Node arrays shared by the build and summarization passes.
pub struct Cells<'a> {
    pub x: &'a mut [f32],
    pub y: &'a mut [f32],
    pub mass: &'a mut [f32],
    pub children: &'a mut [i32],
}

/// Reset the root cell to the bounding box.
pub fn init_root(cells: &mut Cells<'_>, start: &mut [i32], root: usize, bounds: &Bounds) {
    let (cx, cy) = bounds.center();
    cells.x[root] = cx;
    cells.y[root] = cy;
    cells.mass[root] = -1.0;
    start[root] = 0;
    cells.children[root * 4..root * 4 + 4].fill(-1);
}

/// Result of a tree build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOutcome {
    pub bottom: i32,
    pub max_depth: i32,
    pub inserted: u32,
}

#[inline]
fn quadrant(cx: f32, cy: f32, px: f32, py: f32) -> usize {
    let mut j = 0;
    if cx < px {
        j = 1;
    }
    if cy < py {
        j += 2;
    }
    j
}

/// Insert bodies `0..num_bodies` below the root at `root`.
///
/// The root must have been reset with [`init_root`]. Fails when the cell
/// capacity is exhausted or a body cannot be separated from its neighbors.
pub fn build_tree(
    cells: &mut Cells<'_>,
    start: &mut [i32],
    num_bodies: usize,
    root: usize,
    radius: f32,
) -> Result<BuildOutcome, String> {
    let bodies = num_bodies as i32;
    let mut bottom = root;
    let mut max_depth = 1;

    for i in 0..num_bodies {
        let mut nudges = 0;
        'insert: loop {
            let (px, py) = (cells.x[i], cells.y[i]);
            let mut n = root;
            let mut depth = 1;
            let mut r = radius;
            let mut j = quadrant(cells.x[n], cells.y[n], px, py);

            loop {
                let child = cells.children[n * 4 + j];
                if child >= bodies {
                    n = child as usize;
                    depth += 1;
                    r *= 0.5;
                    j = quadrant(cells.x[n], cells.y[n], px, py);
                    continue;
                }
                if child == -1 {
                    cells.children[n * 4 + j] = i as i32;
                    max_depth = max_depth.max(depth);
                    break 'insert;
                }

                // The slot holds another body: split until the two separate.
                let other = child as usize;
                loop {
                    if depth >= NUDGE_DEPTH {
                        nudges += 1;
                        if nudges > MAX_NUDGES {
                            return Err(format!("body {i} cannot be separated from body {other}"));
                        }
                        nudge(cells, i, nudges, radius);
                        continue 'insert;
                    }
                    if bottom <= num_bodies {
                        return Err(format!(
                            "tree capacity of {} cells exhausted",
                            root - num_bodies
                        ));
                    }
                    bottom -= 1;
                    let cell = bottom;
                    r *= 0.5;
                    depth += 1;
                    max_depth = max_depth.max(depth);

                    cells.x[cell] = cells.x[n] + if j & 1 != 0 { r } else { -r };
                    cells.y[cell] = cells.y[n] + if j & 2 != 0 { r } else { -r };
                    cells.mass[cell] = -1.0;
                    start[cell] = -1;
                    cells.children[cell * 4..cell * 4 + 4].fill(-1);
                    cells.children[n * 4 + j] = cell as i32;

                    let k = quadrant(cells.x[cell], cells.y[cell], cells.x[other], cells.y[other]);
                    cells.children[cell * 4 + k] = other as i32;

                    n = cell;
                    j = quadrant(cells.x[n], cells.y[n], px, py);
                    if cells.children[n * 4 + j] < 0 {
                        cells.children[n * 4 + j] = i as i32;
                        break 'insert;
                    }
                }
            }
        }
    }

    Ok(BuildOutcome {
        bottom: bottom as i32,
        max_depth,
        inserted: num_bodies as u32,
    })
}

/// Move body `i` of the tree input by a small, deterministic offset.
fn nudge(cells: &mut Cells<'_>, i: usize, attempt: u32, radius: f32) {
    let (px, py) = (cells.x[i], cells.y[i]);
    let magnitude = (radius * 1e-4).max(px.abs().max(py.abs()) * 1e-5) * (1u32 << attempt) as f32;
    let angle = i as f32 * GOLDEN_ANGLE + attempt as f32;
    cells.x[i] = px + magnitude * angle.cos();
    cells.y[i] = py + magnitude * angle.sin();
}

/// Aggregate mass, center of mass and body count of every cell.
pub fn compute_sums(cells: &mut Cells<'_>, count: &mut [i32], num_bodies: usize, bottom: usize, root: usize) {
    count[..num_bodies].fill(1);
    // Children always have lower indices than their parent cell.
    for k in bottom..=root {
        let mut mass = 0.0;
        let mut cx = 0.0;
        let mut cy = 0.0;
        let mut bodies = 0;
        for j in 0..4 {
            let child = cells.children[k * 4 + j];
            if child >= 0 {
                let c = child as usize;
                let m = cells.mass[c];
                mass += m;
                cx += cells.x[c] * m;
                cy += cells.y[c] * m;
                bodies += count[c];
            }
        }
        if mass > 0.0 {
            cells.x[k] = cx / mass;
            cells.y[k] = cy / mass;
        }
        cells.mass[k] = mass;
        count[k] = bodies;
    }
}

/// Depth-first permutation of the bodies.
pub fn sort_bodies(
    children: &[i32],
    start: &mut [i32],
    sort: &mut [i32],
    count: &[i32],
    num_bodies: usize,
    bottom: usize,
    root: usize,
) {
    start[root] = 0;
    for k in (bottom..=root).rev() {
        let mut offset = start[k];
        for j in 0..4 {
            let child = children[k * 4 + j];
            if child >= num_bodies as i32 {
                start[child as usize] = offset;
                offset += count[child as usize];
            } else if child >= 0 {
                sort[offset as usize] = child;
                offset += 1;
            }
        }
    }
}

/// Squared distance thresholds per depth below which a cell is opened.
pub fn opening_table(radius: f32, tau: f32) -> [f32; MAX_TRAVERSAL_DEPTH] {
    let mut table = [0.0; MAX_TRAVERSAL_DEPTH];
    let width = 2.0 * radius;
    table[0] = width * width / (tau * tau);
    for depth in 1..MAX_TRAVERSAL_DEPTH {
        table[depth] = table[depth - 1] * 0.25;
    }
    table
}

/// Read-only view of a summarized tree.
pub struct TreeView<'a> {
    pub x: &'a [f32],
    pub y: &'a [f32],
    pub mass: &'a [f32],
    pub children: &'a [i32],
    pub num_bodies: usize,
    pub root: usize,
}

/// Approximate repulsion on body `i` by walking the tree from the root.
pub fn tree_repulsion(
    tree: &TreeView<'_>,
    i: usize,
    opening: &[f32; MAX_TRAVERSAL_DEPTH],
    params: &ForceParams,
    sizes: &[f32],
) -> [f32; 2] {
    let (px, py) = (tree.x[i], tree.y[i]);
    let m_i = tree.mass[i];
    let mut force = [0.0f32; 2];
    let mut stack = Vec::with_capacity(MAX_TRAVERSAL_DEPTH);
    stack.push((tree.root, 0usize));

    while let Some((node, depth)) = stack.pop() {
        for j in 0..4 {
            let child = tree.children[node * 4 + j];
            if child < 0 || child as usize == i {
                continue;
            }
            let c = child as usize;
            let dx = px - tree.x[c];
            let dy = py - tree.y[c];
            let d2 = dx * dx + dy * dy;
            let child_depth = (depth + 1).min(MAX_TRAVERSAL_DEPTH - 1);
            if c < tree.num_bodies {
                let extent = sizes.get(i).zip(sizes.get(c)).map(|(a, b)| a + b);
                let f = fa2::repulsion(params, m_i, tree.mass[c], dx, dy, extent);
                force[0] += f[0];
                force[1] += f[1];
            } else if d2 >= opening[child_depth] {
                let f = fa2::repulsion(params, m_i, tree.mass[c], dx, dy, None);
                force[0] += f[0];
                force[1] += f[1];
            } else {
                stack.push((c, depth + 1));
            }
        }
    }
    force
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        x: Vec<f32>,
        y: Vec<f32>,
        mass: Vec<f32>,
        children: Vec<i32>,
        start: Vec<i32>,
        count: Vec<i32>,
        sort: Vec<i32>,
        num_bodies: usize,
        root: usize,
    }

    impl Fixture {
        fn new(points: &[(f32, f32)], num_nodes: usize) -> Self {
            let slots = num_nodes + 1;
            let mut x = vec![0.0; slots];
            let mut y = vec![0.0; slots];
            let mut mass = vec![0.0; slots];
            for (i, &(px, py)) in points.iter().enumerate() {
                x[i] = px;
                y[i] = py;
                mass[i] = 1.0;
            }
            Self {
                x,
                y,
                mass,
                children: vec![7; slots * 4],
                start: vec![0; slots],
                count: vec![0; slots],
                sort: vec![0; slots],
                num_bodies: points.len(),
                root: num_nodes,
            }
        }

        fn build(&mut self) -> Result<BuildOutcome, String> {
            let n = self.num_bodies;
            let mut bounds = Bounds::default();
            for i in 0..n {
                bounds.include(self.x[i], self.y[i]);
            }
            let mut cells = Cells {
                x: &mut self.x,
                y: &mut self.y,
                mass: &mut self.mass,
                children: &mut self.children,
            };
            init_root(&mut cells, &mut self.start, self.root, &bounds);
            let outcome = build_tree(&mut cells, &mut self.start, n, self.root, bounds.radius())?;
            compute_sums(&mut cells, &mut self.count, n, outcome.bottom as usize, self.root);
            sort_bodies(
                &self.children,
                &mut self.start,
                &mut self.sort,
                &self.count,
                n,
                outcome.bottom as usize,
                self.root,
            );
            Ok(outcome)
        }
    }

    #[test]
    fn test_single_point() {
        let mut tree = Fixture::new(&[(3.0, 4.0)], 63);
        let outcome = tree.build().unwrap();
        assert_eq!(outcome.bottom, 63);
        assert_eq!(outcome.max_depth, 1);
        assert_eq!(tree.mass[63], 1.0);
        assert_eq!(tree.count[63], 1);
        assert_eq!(tree.x[63], 3.0);
    }

    #[test]
    fn test_four_corners() {
        let points = [(0.0, 0.0), (10.0, 0.0), (0.0, 10.0), (10.0, 10.0)];
        let mut tree = Fixture::new(&points, 63);
        let outcome = tree.build().unwrap();

        // One quadrant per body, no split needed.
        assert_eq!(outcome.bottom, 63);
        assert_eq!(&tree.children[63 * 4..64 * 4], &[0, 1, 2, 3]);
        assert_eq!(tree.mass[63], 4.0);
        assert!((tree.x[63] - 5.0).abs() < 1e-6);
        assert!((tree.y[63] - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_split_and_sort_permutation() {
        let points = [
            (0.0, 0.0),
            (1.0, 1.0),
            (1.5, 1.2),
            (100.0, 100.0),
            (99.0, 98.0),
            (50.0, 10.0),
            (10.0, 50.0),
            (0.5, 0.25),
        ];
        let mut tree = Fixture::new(&points, 127);
        let outcome = tree.build().unwrap();

        assert!(outcome.bottom < 127);
        assert!(outcome.max_depth > 2);
        assert_eq!(tree.mass[127], points.len() as f32);
        assert_eq!(tree.count[127], points.len() as i32);

        let mut order: Vec<i32> = tree.sort[..points.len()].to_vec();
        order.sort();
        assert_eq!(order, (0..points.len() as i32).collect::<Vec<_>>());

        // Every cell between bottom and root is summarized.
        for k in outcome.bottom as usize..=127 {
            assert!(tree.mass[k] > 0.0, "cell {k} not summarized");
        }
    }

    #[test]
    fn test_coincident_points_are_nudged() {
        let points = [(5.0, 5.0), (5.0, 5.0), (5.0, 5.0), (0.0, 0.0)];
        let mut tree = Fixture::new(&points, 1023);
        let outcome = tree.build().unwrap();

        assert_eq!(tree.count[1023], 4);
        assert!(outcome.max_depth <= NUDGE_DEPTH);
        assert!(tree.x[1] != 5.0 || tree.y[1] != 5.0);
    }

    #[test]
    fn test_capacity_exhausted() {
        let points: Vec<_> = (0..8).map(|i| (i as f32, (i * i) as f32)).collect();
        // Room for a single cell besides the root.
        let mut tree = Fixture::new(&points, 9);
        assert!(tree.build().is_err());
    }

    #[test]
    fn test_small_tau_matches_brute_force() {
        let points: Vec<_> = (0..40)
            .map(|i| {
                let t = i as f32 * 0.7;
                (t.cos() * (10.0 + i as f32), t.sin() * (5.0 + 2.0 * i as f32))
            })
            .collect();
        let mut tree = Fixture::new(&points, 255);
        let outcome = tree.build().unwrap();
        let params = ForceParams {
            scaling_ratio: 1.0,
            tau: 1e-3,
            ..Default::default()
        };
        let view = TreeView {
            x: &tree.x,
            y: &tree.y,
            mass: &tree.mass,
            children: &tree.children,
            num_bodies: points.len(),
            root: 255,
        };
        let opening = opening_table(bounds_of(&points).radius(), params.tau);
        assert!(outcome.max_depth < MAX_TRAVERSAL_DEPTH as i32);

        for i in 0..points.len() {
            let approx = tree_repulsion(&view, i, &opening, &params, &[]);
            let mut exact = [0.0f32; 2];
            for j in 0..points.len() {
                if i != j {
                    let f = fa2::repulsion(
                        &params,
                        1.0,
                        1.0,
                        points[i].0 - points[j].0,
                        points[i].1 - points[j].1,
                        None,
                    );
                    exact[0] += f[0];
                    exact[1] += f[1];
                }
            }
            let err = (approx[0] - exact[0]).hypot(approx[1] - exact[1]);
            assert!(err <= 1e-3 * exact[0].hypot(exact[1]).max(1.0), "body {i}");
        }
    }

    fn bounds_of(points: &[(f32, f32)]) -> Bounds {
        let mut bounds = Bounds::default();
        for &(x, y) in points {
            bounds.include(x, y);
        }
        bounds
    }

    #[test]
    fn test_group_bounds_cover_all() {
        let x: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let y: Vec<f32> = (0..100).map(|i| -(i as f32)).collect();
        let partials = group_bounds(&x, &y, 30);
        assert_eq!(partials.len(), 30);
        let total = partials.into_iter().fold(Bounds::default(), Bounds::merge);
        assert_eq!(total.min_x, 0.0);
        assert_eq!(total.max_x, 99.0);
        assert_eq!(total.min_y, -99.0);
    }
}
