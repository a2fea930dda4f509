//! Neighbor list construction: for every atom, the full (symmetric, possibly-repeating) list of
//! `(neighbor, offset)` pairs within its cutoff, plus the canonical-pair predicate `pick` used
//! throughout the interaction loop to enumerate each unordered tuple exactly once.

use crate::atom::{AtomId, AtomStore};
use crate::cell::Supercell;
use crate::error::{CoreError, CoreResult};
use crate::subcell::{self, SubcellGrid};

/// A hard ceiling on how large any one atom's neighbor list may grow before construction is
/// treated as a resource exhaustion (spec.md §4.1 failure semantics). Chosen generously for
/// condensed-phase cutoffs; a pathologically dense/cold configuration could still hit it.
pub const MAX_NEIGHBORS_PER_ATOM: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborEntry {
    pub neighbor: AtomId,
    pub offset: (i32, i32, i32),
}

/// The canonical-representative predicate: decides, for a candidate pair `(i, j, offset)`, whether
/// this is the single ordering the interaction loop should visit. `j > i` always wins; ties on
/// `j == i` (a self-image pair under a small/periodic cell) are broken by lexicographic sign of
/// the offset; `j < i` is never canonical.
pub fn pick(i: AtomId, j: AtomId, offset: (i32, i32, i32)) -> bool {
    use std::cmp::Ordering;
    match j.0.cmp(&i.0) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => lexicographically_positive(offset),
    }
}

fn lexicographically_positive(offset: (i32, i32, i32)) -> bool {
    if offset.0 != 0 {
        offset.0 > 0
    } else if offset.1 != 0 {
        offset.1 > 0
    } else {
        offset.2 > 0
    }
}

/// Builds neighbor lists for every atom, given a per-atom effective cutoff. Requires the subcell
/// grid to already be binned (`subcell::bin_atoms`) against the same cell.
pub fn build_neighbor_lists(
    atoms: &mut AtomStore,
    grid: &SubcellGrid,
    cell: &Supercell,
    cutoffs: &[f64],
) -> CoreResult<()> {
    if cutoffs.len() != atoms.len() {
        return Err(CoreError::Configuration(
            "cutoffs slice must have one entry per atom".into(),
        ));
    }

    for id in atoms.ids() {
        atoms.get_mut(id).neighbors.clear();
    }

    let ids: Vec<AtomId> = atoms.ids().collect();
    let mut appended: Vec<(AtomId, NeighborEntry)> = Vec::new();

    for &a in &ids {
        let atom_a = atoms.get(a);
        let subcell = atom_a.subcell;
        let posit_a = atom_a.posit;
        let wrap_a = atom_a.wrap_offset;
        let cutoff_sq = cutoffs[a.index()] * cutoffs[a.index()];

        for cn in grid.neighbors_of(subcell) {
            if !cn.include {
                continue;
            }
            for &b in grid.atoms_in(cn.cell) {
                if b == a && cn.offset == (0, 0, 0) {
                    // Same atom, same image: not a neighbor of itself.
                    continue;
                }

                let atom_b = atoms.get(b);
                let total_offset = (
                    cn.offset.0 - wrap_a.0 + atom_b.wrap_offset.0,
                    cn.offset.1 - wrap_a.1 + atom_b.wrap_offset.1,
                    cn.offset.2 - wrap_a.2 + atom_b.wrap_offset.2,
                );

                let sep = cell.separation_vector(posit_a, atom_b.posit, total_offset);
                if sep.magnitude_squared() < cutoff_sq {
                    appended.push((
                        a,
                        NeighborEntry { neighbor: b, offset: total_offset },
                    ));
                    let reverse_offset = (-total_offset.0, -total_offset.1, -total_offset.2);
                    appended.push((
                        b,
                        NeighborEntry { neighbor: a, offset: reverse_offset },
                    ));
                }
            }
        }
    }

    for (owner, entry) in appended {
        let list = &mut atoms.get_mut(owner).neighbors;
        if list.len() >= MAX_NEIGHBORS_PER_ATOM {
            return Err(CoreError::Resource(format!(
                "neighbor list for atom {owner} exceeded {MAX_NEIGHBORS_PER_ATOM} entries"
            )));
        }
        list.push(entry);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Supercell;
    use lin_alg::f64::Vec3;
    use na_seq::Element;

    fn two_atom_setup(sep: f64) -> (AtomStore, SubcellGrid, Supercell) {
        let cell = Supercell::cubic(10.0, [false, false, false]).unwrap();
        let dims = subcell::get_optimal_splitting(&cell, 3.0).unwrap();
        let mut grid = subcell::divide_cell(&cell, dims);
        let mut atoms = AtomStore::new();
        atoms.generate_atoms(
            &[Element::Carbon, Element::Carbon],
            &[0, 0],
            &[12.0, 12.0],
            &[0.0, 0.0],
            &[Vec3::new(5.0, 5.0, 5.0), Vec3::new(5.0 + sep, 5.0, 5.0)],
        );
        subcell::bin_atoms(&mut grid, &mut atoms, &cell);
        (atoms, grid, cell)
    }

    #[test]
    fn neighbor_lists_are_symmetric() {
        let (mut atoms, grid, cell) = two_atom_setup(1.0);
        build_neighbor_lists(&mut atoms, &grid, &cell, &[2.5, 2.5]).unwrap();

        let a0 = atoms.get(AtomId(0)).neighbors.clone();
        let a1 = atoms.get(AtomId(1)).neighbors.clone();
        assert_eq!(a0.len(), 1);
        assert_eq!(a1.len(), 1);
        assert_eq!(a0[0].neighbor, AtomId(1));
        assert_eq!(a1[0].neighbor, AtomId(0));
        assert_eq!(a0[0].offset, (-a1[0].offset.0, -a1[0].offset.1, -a1[0].offset.2));
    }

    #[test]
    fn out_of_cutoff_pairs_are_not_neighbors() {
        let (mut atoms, grid, cell) = two_atom_setup(4.0);
        build_neighbor_lists(&mut atoms, &grid, &cell, &[2.5, 2.5]).unwrap();
        assert!(atoms.get(AtomId(0)).neighbors.is_empty());
        assert!(atoms.get(AtomId(1)).neighbors.is_empty());
    }

    #[test]
    fn pick_is_a_strict_total_canonicalization() {
        let a = AtomId(2);
        let b = AtomId(5);
        assert!(pick(a, b, (0, 0, 0)));
        assert!(!pick(b, a, (0, 0, 0)));
        // Self-image pairs (same atom index, nonzero offset) break ties on offset sign.
        assert!(pick(a, a, (1, 0, 0)));
        assert!(!pick(a, a, (-1, 0, 0)));
    }
}
