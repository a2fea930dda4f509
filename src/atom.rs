//! Atom storage: a contiguous arena indexed by a dense, never-reassigned `AtomId`.
//!
//! The source's pointer graph (atom ↔ neighbor list ↔ potential/BOF indices) is replaced here by
//! an arena-plus-index: atoms live in one `Vec`, and everything else (neighbor lists, registry
//! index lists) is a side table keyed by the same integer id. No cycles, no shared mutable
//! aliasing.

use lin_alg::f64::Vec3;
use na_seq::Element;

use crate::neighbor::NeighborEntry;

/// A stable, dense atom index. Never reassigned over the lifetime of an `AtomStore` — an atom
/// keeps its id even if its position, charge, or momentum changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AtomId(pub u32);

impl AtomId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for AtomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 1-based for display, matching the teacher's habit of printing 1-based indices even
        // though the backing arrays are 0-based (see SPEC_FULL.md REDESIGN FLAGS).
        write!(f, "{}", self.0 + 1)
    }
}

#[derive(Debug, Clone)]
pub struct Atom {
    pub id: AtomId,
    pub element: Element,
    pub tag: i32,
    pub mass: f64,
    pub charge: f64,
    pub posit: Vec3,
    pub momentum: Vec3,

    /// Populated by `neighbor::build_neighbor_lists`.
    pub neighbors: Vec<NeighborEntry>,
    /// Indices into the potential registry of records whose first-position target accepts this
    /// atom. Populated by `assign_potential_indices`.
    pub potential_indices: Vec<u32>,
    /// Indices into the BOF registry of records whose first-position target accepts this atom.
    /// Populated by `assign_bond_order_factor_indices`.
    pub bof_indices: Vec<u32>,
    /// The subcell this atom currently occupies; set by `create_space_partitioning`.
    pub subcell: (i32, i32, i32),
    /// The integer lattice-vector offset subtracted from this atom's raw position to wrap it
    /// into the primary image, set alongside `subcell`. Used by neighbor construction to convert
    /// a cell-neighbor-table offset into a true minimum-image offset (spec.md §4.1 step 3).
    pub wrap_offset: (i32, i32, i32),
}

impl Atom {
    pub fn new(id: AtomId, element: Element, tag: i32, mass: f64, charge: f64, posit: Vec3) -> Self {
        Self {
            id,
            element,
            tag,
            mass,
            charge,
            posit,
            momentum: Vec3::new_zero(),
            neighbors: Vec::new(),
            potential_indices: Vec::new(),
            bof_indices: Vec::new(),
            subcell: (0, 0, 0),
            wrap_offset: (0, 0, 0),
        }
    }
}

/// Arena of atoms, dense and index-stable. `generate_atoms` is the only way to grow it; removal
/// is not supported mid-run (the source doesn't support it either — atoms are cleared and
/// regenerated wholesale via `clear_atoms`).
#[derive(Debug, Clone, Default)]
pub struct AtomStore {
    atoms: Vec<Atom>,
}

impl AtomStore {
    pub fn new() -> Self {
        Self { atoms: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// Appends atoms built from parallel slices of element/tag/mass/charge/position, in the
    /// source's `generate_atoms` style. Returns the ids assigned, in order.
    pub fn generate_atoms(
        &mut self,
        elements: &[Element],
        tags: &[i32],
        masses: &[f64],
        charges: &[f64],
        posits: &[Vec3],
    ) -> Vec<AtomId> {
        let n = elements.len();
        let mut ids = Vec::with_capacity(n);
        for i in 0..n {
            let id = AtomId(self.atoms.len() as u32);
            self.atoms.push(Atom::new(
                id, elements[i], tags[i], masses[i], charges[i], posits[i],
            ));
            ids.push(id);
        }
        ids
    }

    pub fn get(&self, id: AtomId) -> &Atom {
        &self.atoms[id.index()]
    }

    pub fn get_mut(&mut self, id: AtomId) -> &mut Atom {
        &mut self.atoms[id.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Atom> {
        self.atoms.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Atom> {
        self.atoms.iter_mut()
    }

    pub fn as_slice(&self) -> &[Atom] {
        &self.atoms
    }

    pub fn ids(&self) -> impl Iterator<Item = AtomId> {
        (0..self.atoms.len() as u32).map(AtomId)
    }

    /// `update_coordinates`: bulk-assigns positions by id. Invalidates neighbor lists; the
    /// caller (`CoreState`) is responsible for marking geometry dirty.
    pub fn update_coordinates(&mut self, posits: &[(AtomId, Vec3)]) {
        for (id, p) in posits {
            self.atoms[id.index()].posit = *p;
        }
    }

    /// `update_charges`: bulk-assigns charges by id. Does not invalidate neighbor lists (charge
    /// doesn't change geometry).
    pub fn update_charges(&mut self, charges: &[(AtomId, f64)]) {
        for (id, q) in charges {
            self.atoms[id.index()].charge = *q;
        }
    }

    pub fn clear(&mut self) {
        self.atoms.clear();
    }

    pub fn clear_potential_indices(&mut self) {
        for a in &mut self.atoms {
            a.potential_indices.clear();
        }
    }

    pub fn clear_bof_indices(&mut self) {
        for a in &mut self.atoms {
            a.bof_indices.clear();
        }
    }

    /// A lightweight binary checkpoint of positions, momenta and charges (not the registry or
    /// neighbor lists, which are cheap to rebuild), in the teacher's own `bincode`-backed saved-
    /// state style.
    pub fn snapshot(&self) -> Vec<AtomSnapshot> {
        self.atoms
            .iter()
            .map(|a| AtomSnapshot {
                id: a.id.0,
                element: format!("{:?}", a.element),
                tag: a.tag,
                mass: a.mass,
                charge: a.charge,
                posit: a.posit,
                momentum: a.momentum,
            })
            .collect()
    }

    /// Restores positions, momenta and charges from a snapshot taken of the same atom set (same
    /// length and id assignment); does not recreate atoms.
    pub fn restore_snapshot(&mut self, snapshot: &[AtomSnapshot]) -> Result<(), String> {
        if snapshot.len() != self.atoms.len() {
            return Err(format!(
                "snapshot has {} atoms but store has {}",
                snapshot.len(),
                self.atoms.len()
            ));
        }
        for (atom, saved) in self.atoms.iter_mut().zip(snapshot.iter()) {
            if atom.id.0 != saved.id {
                return Err(format!("snapshot id {} does not match atom id {}", saved.id, atom.id.0));
            }
            atom.mass = saved.mass;
            atom.charge = saved.charge;
            atom.posit = saved.posit;
            atom.momentum = saved.momentum;
        }
        Ok(())
    }
}

/// A `bincode`-encodable per-atom checkpoint record; see `AtomStore::snapshot`.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct AtomSnapshot {
    pub id: u32,
    pub element: String,
    pub tag: i32,
    pub mass: f64,
    pub charge: f64,
    pub posit: Vec3,
    pub momentum: Vec3,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_and_stable() {
        let mut store = AtomStore::new();
        let ids = store.generate_atoms(
            &[Element::Carbon, Element::Oxygen],
            &[0, 0],
            &[12.0, 16.0],
            &[0.0, 0.0],
            &[Vec3::new_zero(), Vec3::new(1.0, 0.0, 0.0)],
        );
        assert_eq!(ids, vec![AtomId(0), AtomId(1)]);

        store.update_coordinates(&[(AtomId(1), Vec3::new(2.0, 0.0, 0.0))]);
        assert_eq!(store.get(AtomId(1)).posit, Vec3::new(2.0, 0.0, 0.0));
        // Id for atom 0 is untouched by mutating atom 1.
        assert_eq!(store.get(AtomId(0)).id, AtomId(0));
    }

    #[test]
    fn snapshot_roundtrips_through_bincode() {
        let mut store = AtomStore::new();
        store.generate_atoms(
            &[Element::Carbon],
            &[0],
            &[12.0],
            &[0.5],
            &[Vec3::new(1.0, 2.0, 3.0)],
        );
        let snapshot = store.snapshot();
        let encoded = bincode::encode_to_vec(&snapshot, bincode::config::standard()).unwrap();
        let (decoded, _): (Vec<AtomSnapshot>, usize) =
            bincode::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(decoded, snapshot);

        store.update_coordinates(&[(AtomId(0), Vec3::new_zero())]);
        store.restore_snapshot(&decoded).unwrap();
        assert_eq!(store.get(AtomId(0)).posit, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn restore_snapshot_rejects_mismatched_atom_count() {
        let mut store = AtomStore::new();
        store.generate_atoms(&[Element::Carbon], &[0], &[12.0], &[0.0], &[Vec3::new_zero()]);
        assert!(store.restore_snapshot(&[]).is_err());
    }
}
