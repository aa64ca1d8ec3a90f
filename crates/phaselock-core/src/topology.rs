//! Flat-index neighbor topology over a toroidal lattice.
//!
//! Slots live in one flat array. Dimension 0 varies fastest, so slot
//! `index = c0 + d0*(c1 + d1*(c2 + ...))`. Every coordinate wraps around.
//!
//! Each slot gets at most [`MAX_NEIGHBORS`](phaselock_types::MAX_NEIGHBORS)
//! neighbors, taken in a fixed order until the set is full:
//!
//! 1. `-1` and `+1` along each dimension, dimension 0 first
//! 2. the four diagonals of dimensions 0 and 1
//! 3. `-2, +2, -3, +3, -4, +4` along dimension 0
//!
//! Offsets that wrap back onto the slot itself or onto an existing
//! neighbor are skipped. A ring of 8 therefore couples every slot to all
//! seven others, and a 2-D grid gets its Moore neighborhood.

use phaselock_types::NeighborSet;

/// Neighbor table and coordinate arithmetic for one lattice shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    dimensions: Vec<u32>,
    neighbors: Vec<NeighborSet>,
}

impl Topology {
    /// Build the neighbor table for `dimensions`.
    ///
    /// An empty dimension list or a zero-sized dimension yields an empty
    /// lattice.
    pub fn new(dimensions: &[u32]) -> Self {
        let slot_count = if dimensions.is_empty() {
            0
        } else {
            dimensions
                .iter()
                .try_fold(1_usize, |acc, &size| {
                    usize::try_from(size).ok().and_then(|s| acc.checked_mul(s))
                })
                .unwrap_or(0)
        };

        let offsets = candidate_offsets(dimensions.len());
        let neighbors = (0..slot_count)
            .map(|index| {
                let coords = coordinates_of(dimensions, index);
                let mut set = NeighborSet::new();
                for offset in &offsets {
                    if set.is_full() {
                        break;
                    }
                    let Some(target) = shifted_index(dimensions, &coords, offset) else {
                        continue;
                    };
                    if target == index {
                        continue;
                    }
                    if let Ok(target) = u32::try_from(target) {
                        set.push(target);
                    }
                }
                set
            })
            .collect();

        Self {
            dimensions: dimensions.to_vec(),
            neighbors,
        }
    }

    /// Dimension sizes this topology was built for.
    pub fn dimensions(&self) -> &[u32] {
        &self.dimensions
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    /// Whether the lattice has no slots.
    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    /// Neighbors of slot `index`.
    pub fn neighbors(&self, index: usize) -> Option<&NeighborSet> {
        self.neighbors.get(index)
    }

    /// Iterate the neighbor sets in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &NeighborSet> {
        self.neighbors.iter()
    }

    /// Coordinates of slot `index`.
    pub fn coordinates(&self, index: usize) -> Vec<u32> {
        coordinates_of(&self.dimensions, index)
    }
}

/// Offsets in the fixed candidate order, one entry per dimension.
fn candidate_offsets(rank: usize) -> Vec<Vec<i64>> {
    let mut offsets = Vec::new();
    let unit = |dim: usize, delta: i64| {
        let mut offset = vec![0_i64; rank];
        if let Some(cell) = offset.get_mut(dim) {
            *cell = delta;
        }
        offset
    };

    for dim in 0..rank {
        offsets.push(unit(dim, -1));
        offsets.push(unit(dim, 1));
    }
    if rank >= 2 {
        for (d0, d1) in [(1, 1), (-1, -1), (1, -1), (-1, 1)] {
            let mut offset = vec![0_i64; rank];
            if let Some(cell) = offset.get_mut(0) {
                *cell = d0;
            }
            if let Some(cell) = offset.get_mut(1) {
                *cell = d1;
            }
            offsets.push(offset);
        }
    }
    if rank >= 1 {
        for reach in 2..=4_i64 {
            offsets.push(unit(0, -reach));
            offsets.push(unit(0, reach));
        }
    }
    offsets
}

fn coordinates_of(dimensions: &[u32], index: usize) -> Vec<u32> {
    let mut rest = index;
    dimensions
        .iter()
        .map(|&size| {
            let size = usize::try_from(size).unwrap_or(1).max(1);
            let coord = rest.checked_rem(size).unwrap_or(0);
            rest = rest.checked_div(size).unwrap_or(0);
            u32::try_from(coord).unwrap_or(0)
        })
        .collect()
}

fn shifted_index(dimensions: &[u32], coords: &[u32], offset: &[i64]) -> Option<usize> {
    let mut index = 0_usize;
    let mut stride = 1_usize;
    for ((&size, &coord), &delta) in dimensions.iter().zip(coords).zip(offset) {
        let size_i = i64::from(size);
        let shifted = i64::from(coord).checked_add(delta)?.checked_rem_euclid(size_i)?;
        let shifted = usize::try_from(shifted).ok()?;
        index = index.checked_add(shifted.checked_mul(stride)?)?;
        stride = stride.checked_mul(usize::try_from(size).ok()?)?;
    }
    Some(index)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sorted(set: &NeighborSet) -> Vec<u32> {
        let mut v = set.as_slice().to_vec();
        v.sort_unstable();
        v
    }

    #[test]
    fn ring_of_eight_is_fully_connected() {
        let topology = Topology::new(&[8]);
        assert_eq!(topology.len(), 8);
        for index in 0..8_u32 {
            let neighbors = sorted(topology.neighbors(index as usize).unwrap());
            let expected: Vec<u32> = (0..8).filter(|&j| j != index).collect();
            assert_eq!(neighbors, expected);
        }
    }

    #[test]
    fn ring_order_starts_with_adjacent() {
        let topology = Topology::new(&[8]);
        let first = topology.neighbors(0).unwrap().as_slice();
        assert_eq!(first.get(..2), Some(&[7, 1][..]));
    }

    #[test]
    fn grid_gets_moore_neighborhood() {
        let topology = Topology::new(&[4, 4]);
        // Slot (1, 1) sits at index 5.
        let neighbors = sorted(topology.neighbors(5).unwrap());
        assert_eq!(neighbors, vec![0, 1, 2, 4, 6, 8, 9, 10]);
    }

    #[test]
    fn grid_wraps_at_edges() {
        let topology = Topology::new(&[4, 4]);
        let neighbors = sorted(topology.neighbors(0).unwrap());
        // (0,0) touches (3,0)=3, (1,0)=1, (0,3)=12, (0,1)=4 and the diagonals.
        assert!(neighbors.contains(&3));
        assert!(neighbors.contains(&12));
        assert!(neighbors.contains(&15));
        assert_eq!(neighbors.len(), 8);
    }

    #[test]
    fn neighbor_relation_is_symmetric() {
        for dims in [vec![8], vec![5, 3], vec![4, 4, 4], vec![3]] {
            let topology = Topology::new(&dims);
            for index in 0..topology.len() {
                for &j in topology.neighbors(index).unwrap().as_slice() {
                    let back = topology.neighbors(j as usize).unwrap();
                    assert!(
                        back.as_slice().contains(&u32::try_from(index).unwrap()),
                        "{dims:?}: {index} -> {j} not mirrored"
                    );
                }
            }
        }
    }

    #[test]
    fn single_slot_has_no_neighbors() {
        let topology = Topology::new(&[1]);
        assert_eq!(topology.len(), 1);
        assert!(topology.neighbors(0).unwrap().is_empty());
    }

    #[test]
    fn coordinates_round_trip() {
        let topology = Topology::new(&[3, 5]);
        assert_eq!(topology.coordinates(7), vec![1, 2]);
    }
}
