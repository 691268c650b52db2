//! Edge sets in the device adjacency format.
//!
//! Each direction stores an edge list of `(source, target)` pairs sorted by
//! source and one work item per point, `[first_edge, edge_count, point, 0]`,
//! so one worker can process a point's contiguous run of edges.

use crate::error::SimError;
use crate::registry::{BufferName, BufferSpec, ElementType};
use crate::Result;

/// Words per work item.
pub const WORK_ITEM_WORDS: usize = 4;

/// One direction of the adjacency.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Adjacency {
    /// Flattened `(source, target)` pairs.
    pub edges: Vec<u32>,
    /// Flattened work items.
    pub work_items: Vec<u32>,
    pub weights: Vec<f32>,
}

impl Adjacency {
    fn from_sorted(point_count: u32, pairs: &[(u32, u32, f32)]) -> Self {
        let mut edges = Vec::with_capacity(pairs.len() * 2);
        let mut weights = Vec::with_capacity(pairs.len());
        let mut work_items = vec![0u32; point_count as usize * WORK_ITEM_WORDS];

        let mut next = 0;
        for point in 0..point_count {
            let first = next;
            while next < pairs.len() && pairs[next].0 == point {
                let (source, target, weight) = pairs[next];
                edges.extend([source, target]);
                weights.push(weight);
                next += 1;
            }
            let item = &mut work_items[point as usize * WORK_ITEM_WORDS..][..WORK_ITEM_WORDS];
            item.copy_from_slice(&[first as u32, (next - first) as u32, point, 0]);
        }

        Self {
            edges,
            work_items,
            weights,
        }
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len() / 2
    }

    fn validate(&self, direction: &str, point_count: u32) -> Result<()> {
        if self.edges.is_empty() {
            return Err(SimError::invalid(format!("{direction} edge buffer is empty")));
        }
        if self.edges.len() % 2 != 0 {
            return Err(SimError::invalid(format!(
                "{direction} edge buffer length {} is not a multiple of 2",
                self.edges.len()
            )));
        }
        if self.work_items.len() % WORK_ITEM_WORDS != 0 {
            return Err(SimError::invalid(format!(
                "{direction} work item buffer length {} is not a multiple of {WORK_ITEM_WORDS}",
                self.work_items.len()
            )));
        }
        if self.work_items.len() / WORK_ITEM_WORDS != point_count as usize {
            return Err(SimError::invalid(format!(
                "{direction} adjacency has {} work items for {point_count} points",
                self.work_items.len() / WORK_ITEM_WORDS
            )));
        }
        let edge_count = self.edge_count();
        if self.weights.len() != edge_count {
            return Err(SimError::invalid(format!(
                "{direction} adjacency has {} weights for {edge_count} edges",
                self.weights.len()
            )));
        }
        if let Some(bad) = self.edges.iter().find(|&&endpoint| endpoint >= point_count) {
            return Err(SimError::invalid(format!(
                "{direction} edge endpoint {bad} is out of range for {point_count} points"
            )));
        }
        if let Some(bad) = self.weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(SimError::invalid(format!("{direction} edge weight {bad} is invalid")));
        }
        for (point, item) in self.work_items.chunks_exact(WORK_ITEM_WORDS).enumerate() {
            let (first, count, owner) = (item[0] as usize, item[1] as usize, item[2]);
            if owner as usize != point {
                return Err(SimError::invalid(format!(
                    "{direction} work item {point} names point {owner}"
                )));
            }
            if first + count > edge_count {
                return Err(SimError::invalid(format!(
                    "{direction} work item {point} overruns the edge list"
                )));
            }
            if (first..first + count).any(|e| self.edges[2 * e] as usize != point) {
                return Err(SimError::invalid(format!(
                    "{direction} work item {point} covers edges of another source"
                )));
            }
        }
        Ok(())
    }

    fn specs(&self, edges: BufferName, work_items: BufferName, weights: BufferName) -> [BufferSpec; 3] {
        [
            BufferSpec::with_contents(edges, ElementType::U32, &self.edges),
            BufferSpec::with_contents(work_items, ElementType::U32, &self.work_items),
            BufferSpec::with_contents(weights, ElementType::F32, &self.weights),
        ]
    }
}

/// Forward and backward adjacency plus per-point degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSet {
    pub forward: Adjacency,
    pub backward: Adjacency,
    pub degrees: Vec<u32>,
}

impl EdgeSet {
    /// Build both directions from unweighted `(source, target)` pairs.
    pub fn from_pairs(point_count: u32, pairs: &[(u32, u32)]) -> Result<Self> {
        let weighted: Vec<_> = pairs.iter().map(|&(s, t)| (s, t, 1.0)).collect();
        Self::from_weighted_pairs(point_count, &weighted)
    }

    pub fn from_weighted_pairs(point_count: u32, pairs: &[(u32, u32, f32)]) -> Result<Self> {
        if pairs.is_empty() {
            return Err(SimError::invalid("edge list is empty"));
        }
        if let Some(&(s, t, _)) = pairs.iter().find(|(s, t, _)| *s >= point_count || *t >= point_count) {
            return Err(SimError::invalid(format!(
                "edge ({s}, {t}) is out of range for {point_count} points"
            )));
        }

        let mut forward = pairs.to_vec();
        forward.sort_by_key(|&(s, t, _)| (s, t));
        let mut backward: Vec<_> = pairs.iter().map(|&(s, t, w)| (t, s, w)).collect();
        backward.sort_by_key(|&(s, t, _)| (s, t));

        let mut degrees = vec![0u32; point_count as usize];
        for &(s, t, _) in pairs {
            degrees[s as usize] += 1;
            degrees[t as usize] += 1;
        }

        let edges = Self {
            forward: Adjacency::from_sorted(point_count, &forward),
            backward: Adjacency::from_sorted(point_count, &backward),
            degrees,
        };
        edges.validate(point_count)?;
        Ok(edges)
    }

    pub fn edge_count(&self) -> u32 {
        self.forward.edge_count() as u32
    }

    /// Check the shape rules a device kernel relies on.
    pub fn validate(&self, point_count: u32) -> Result<()> {
        self.forward.validate("forward", point_count)?;
        self.backward.validate("backward", point_count)?;
        if self.forward.edge_count() != self.backward.edge_count() {
            return Err(SimError::invalid(format!(
                "forward has {} edges, backward {}",
                self.forward.edge_count(),
                self.backward.edge_count()
            )));
        }
        if self.degrees.len() != point_count as usize {
            return Err(SimError::invalid(format!(
                "{} degrees for {point_count} points",
                self.degrees.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn specs(&self) -> Vec<BufferSpec> {
        let mut specs = Vec::with_capacity(7);
        specs.extend(self.forward.specs(
            BufferName::ForwardEdges,
            BufferName::ForwardWorkItems,
            BufferName::ForwardWeights,
        ));
        specs.extend(self.backward.specs(
            BufferName::BackwardEdges,
            BufferName::BackwardWorkItems,
            BufferName::BackwardWeights,
        ));
        specs.push(BufferSpec::with_contents(
            BufferName::PointDegrees,
            ElementType::U32,
            &self.degrees,
        ));
        specs
    }

    /// Buffers of a point set without edges: no work, one placeholder pair.
    pub(crate) fn empty_specs(point_count: u32) -> Vec<BufferSpec> {
        let empty = Adjacency {
            edges: vec![0, 0],
            work_items: (0..point_count).flat_map(|p| [0, 0, p, 0]).collect(),
            weights: vec![0.0],
        };
        let mut specs = Vec::with_capacity(7);
        specs.extend(empty.specs(
            BufferName::ForwardEdges,
            BufferName::ForwardWorkItems,
            BufferName::ForwardWeights,
        ));
        specs.extend(empty.specs(
            BufferName::BackwardEdges,
            BufferName::BackwardWorkItems,
            BufferName::BackwardWeights,
        ));
        specs.push(BufferSpec::zeroed(
            BufferName::PointDegrees,
            ElementType::U32,
            point_count as usize,
        ));
        specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_pairs_layout() {
        let edges = EdgeSet::from_pairs(4, &[(2, 0), (0, 1), (0, 3)]).unwrap();

        assert_eq!(edges.forward.edges, vec![0, 1, 0, 3, 2, 0]);
        assert_eq!(
            edges.forward.work_items,
            vec![0, 2, 0, 0, 2, 0, 1, 0, 2, 1, 2, 0, 3, 0, 3, 0]
        );
        assert_eq!(edges.backward.edges, vec![0, 2, 1, 0, 3, 0]);
        assert_eq!(edges.degrees, vec![3, 1, 1, 1]);
        assert_eq!(edges.edge_count(), 3);
    }

    #[test]
    fn test_empty_rejected() {
        assert!(matches!(
            EdgeSet::from_pairs(3, &[]),
            Err(SimError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(EdgeSet::from_pairs(3, &[(0, 3)]).is_err());
    }

    #[test]
    fn test_validate_shapes() {
        let good = EdgeSet::from_pairs(3, &[(0, 1), (1, 2)]).unwrap();

        let mut odd = good.clone();
        odd.forward.edges.push(1);
        assert!(odd.validate(3).is_err());

        let mut short_items = good.clone();
        short_items.backward.work_items.pop();
        assert!(short_items.validate(3).is_err());

        let mut empty = good.clone();
        empty.forward.edges.clear();
        assert!(empty.validate(3).is_err());

        let mut foreign = good.clone();
        // Point 0's item now claims point 1's edge.
        foreign.forward.work_items[0] = 1;
        assert!(foreign.validate(3).is_err());

        assert!(good.validate(4).is_err());
    }

    #[test]
    fn test_empty_specs_cover_every_point() {
        let specs = EdgeSet::empty_specs(5);
        let items = specs
            .iter()
            .find(|s| s.name == BufferName::ForwardWorkItems)
            .unwrap();
        assert_eq!(items.len, 20);
        assert_eq!(specs.len(), 7);
    }
}
