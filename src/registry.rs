//! Potential and BOF registries: immutable, ordered collections of parameter records, each with
//! a target filter over element/tag/index, built once at registration time (including permutation
//! expansion) and never re-permuted in the hot loop (DESIGN NOTES §9 "Symmetry expansion").

use std::collections::HashSet;

use itertools::Itertools;

use crate::atom::{Atom, AtomId};
use crate::error::{CoreError, CoreResult};
use crate::forms::{BofFormTag, FormTag, PostProcessTag};
use na_seq::Element;

/// Identifies a BOF group: several BOF records summed together before per-atom scaling, and the
/// id potentials reference to pick up the resulting factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(pub u32);

/// A per-position filter over element, tag, and atom index. Each sub-filter is optional; an atom
/// matches a position when it satisfies every sub-filter that is `Some`. `None` across the board
/// matches every atom.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TargetFilter {
    elements: Option<Vec<Element>>,
    tags: Option<Vec<i32>>,
    indices: Option<Vec<AtomId>>,
}

impl TargetFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn elements(elements: Vec<Element>) -> Self {
        let mut deduped: Vec<Element> = Vec::new();
        for e in elements {
            if !deduped.contains(&e) {
                deduped.push(e);
            }
        }
        Self { elements: Some(deduped), tags: None, indices: None }
    }

    pub fn tags(mut tags: Vec<i32>) -> Self {
        tags.sort_unstable();
        tags.dedup();
        Self { elements: None, tags: Some(tags), indices: None }
    }

    pub fn indices(mut indices: Vec<AtomId>) -> Self {
        indices.sort();
        indices.dedup();
        Self { elements: None, tags: None, indices: Some(indices) }
    }

    /// Stands in for the source's `bond_order_factor_affects_atom` (and the analogous potential
    /// predicate): whether this filter accepts the given atom.
    pub fn matches(&self, atom: &Atom) -> bool {
        if let Some(elements) = &self.elements {
            if !elements.contains(&atom.element) {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            if !tags.contains(&atom.tag) {
                return false;
            }
        }
        if let Some(indices) = &self.indices {
            if !indices.contains(&atom.id) {
                return false;
            }
        }
        true
    }
}

fn dedup_permutations(targets: &[TargetFilter]) -> Vec<Vec<TargetFilter>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for perm in targets.iter().cloned().permutations(targets.len()) {
        if seen.insert(perm.clone()) {
            out.push(perm);
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct PotentialRecord {
    pub form: FormTag,
    pub params: Vec<f64>,
    pub hard_cutoff: f64,
    pub soft_cutoff: Option<f64>,
    pub targets: Vec<TargetFilter>,
    /// The original, unpermuted target list supplied by the caller, retained so asymmetric
    /// many-body forms (e.g. bond bending, where the central atom is distinguished) can still be
    /// filtered correctly by position against the form's own convention.
    pub original_targets: Vec<TargetFilter>,
    pub bof_group: Option<GroupId>,
}

impl PotentialRecord {
    pub fn n_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn targets_atom(&self, position: usize, atom: &Atom) -> bool {
        self.targets[position].matches(atom)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PotentialRegistry {
    records: Vec<PotentialRecord>,
}

impl PotentialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, expected: usize) {
        self.records.reserve(expected);
    }

    pub fn records(&self) -> &[PotentialRecord] {
        &self.records
    }

    pub fn get(&self, idx: u32) -> &PotentialRecord {
        &self.records[idx as usize]
    }

    /// Registers a potential, expanding the supplied target list into every distinct permutation
    /// (e.g. `[Si, O]` becomes both `Si-O` and `O-Si`). Returns the indices of every record
    /// created. Fails with a configuration error on non-positive cutoffs or an empty target list.
    pub fn add_potential(
        &mut self,
        form: FormTag,
        params: Vec<f64>,
        hard_cutoff: f64,
        soft_cutoff: Option<f64>,
        targets: Vec<TargetFilter>,
        bof_group: Option<GroupId>,
    ) -> CoreResult<Vec<u32>> {
        if targets.is_empty() {
            return Err(CoreError::Configuration(
                "potential target list must have at least one position".into(),
            ));
        }
        if hard_cutoff <= 0.0 {
            return Err(CoreError::Configuration(format!(
                "potential hard cutoff must be positive, got {hard_cutoff}"
            )));
        }
        if let Some(soft) = soft_cutoff {
            if soft <= 0.0 {
                return Err(CoreError::Configuration(format!(
                    "potential soft cutoff must be positive, got {soft}"
                )));
            }
        }

        let original = targets.clone();
        let mut indices = Vec::new();
        for perm in dedup_permutations(&targets) {
            let idx = self.records.len() as u32;
            self.records.push(PotentialRecord {
                form,
                params: params.clone(),
                hard_cutoff,
                soft_cutoff,
                targets: perm,
                original_targets: original.clone(),
                bof_group,
            });
            indices.push(idx);
        }
        Ok(indices)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Populates each atom's `potential_indices` with every record whose first-position target
    /// accepts it. Must be called after every registration change and before evaluation.
    pub fn assign_indices(&self, atoms: &mut crate::atom::AtomStore) {
        atoms.clear_potential_indices();
        for idx in 0..self.records.len() as u32 {
            let record = &self.records[idx as usize];
            let ids: Vec<AtomId> = atoms.ids().collect();
            for id in ids {
                if record.targets_atom(0, atoms.get(id)) {
                    atoms.get_mut(id).potential_indices.push(idx);
                }
            }
        }
    }
}

/// Parameters split by body-count, mirroring the source's per-arity parameter subsets for a BOF
/// record (a coordination-counting BOF, for instance, uses only the two-body subset).
#[derive(Debug, Clone, Default)]
pub struct BofParamSplit {
    pub one: Vec<f64>,
    pub two: Vec<f64>,
    pub three: Vec<f64>,
    pub four: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct BofRecord {
    pub form: BofFormTag,
    pub params: BofParamSplit,
    pub hard_cutoff: f64,
    pub soft_cutoff: Option<f64>,
    pub targets: Vec<TargetFilter>,
    pub original_targets: Vec<TargetFilter>,
    pub group: GroupId,
    /// `Some` when this record additionally post-processes the group's raw sum into a scaled
    /// factor (spec.md §4.3: first matching post-processor in registration order wins), tagging
    /// which post-processing form to dispatch to.
    pub post_process: Option<PostProcessTag>,
}

impl BofRecord {
    pub fn n_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn targets_atom(&self, position: usize, atom: &Atom) -> bool {
        self.targets[position].matches(atom)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BofRegistry {
    records: Vec<BofRecord>,
}

impl BofRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, expected: usize) {
        self.records.reserve(expected);
    }

    pub fn records(&self) -> &[BofRecord] {
        &self.records
    }

    pub fn get(&self, idx: u32) -> &BofRecord {
        &self.records[idx as usize]
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_bond_order_factor(
        &mut self,
        form: BofFormTag,
        params: BofParamSplit,
        hard_cutoff: f64,
        soft_cutoff: Option<f64>,
        targets: Vec<TargetFilter>,
        group: GroupId,
        post_process: Option<PostProcessTag>,
    ) -> CoreResult<Vec<u32>> {
        if targets.is_empty() {
            return Err(CoreError::Configuration(
                "BOF target list must have at least one position".into(),
            ));
        }
        if hard_cutoff <= 0.0 {
            return Err(CoreError::Configuration(format!(
                "BOF hard cutoff must be positive, got {hard_cutoff}"
            )));
        }

        let original = targets.clone();
        let mut indices = Vec::new();
        for perm in dedup_permutations(&targets) {
            let idx = self.records.len() as u32;
            self.records.push(BofRecord {
                form,
                params: params.clone(),
                hard_cutoff,
                soft_cutoff,
                targets: perm,
                original_targets: original.clone(),
                group,
                post_process,
            });
            indices.push(idx);
        }
        Ok(indices)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn assign_indices(&self, atoms: &mut crate::atom::AtomStore) {
        atoms.clear_bof_indices();
        for idx in 0..self.records.len() as u32 {
            let record = &self.records[idx as usize];
            let ids: Vec<AtomId> = atoms.ids().collect();
            for id in ids {
                if record.targets_atom(0, atoms.get(id)) {
                    atoms.get_mut(id).bof_indices.push(idx);
                }
            }
        }
    }

    /// First-match-in-registration-order post-processor lookup for a group and element, used
    /// identically for scaling the factor (spec.md §4.3) and for scaling its gradient
    /// (spec.md §4.4) — Open Question 3, decided to preserve source behavior.
    pub fn post_processor_for(&self, group: GroupId, element: Element) -> Option<&BofRecord> {
        self.records.iter().find(|r| {
            r.group == group
                && r.post_process.is_some()
                && r.original_targets
                    .first()
                    .map(|f| f.matches_element(element))
                    .unwrap_or(false)
        })
    }
}

impl TargetFilter {
    fn matches_element(&self, element: Element) -> bool {
        match &self.elements {
            Some(elements) => elements.contains(&element),
            None => true,
        }
    }
}
