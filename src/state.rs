//! `CoreState`: the single owner of atoms, cell, registries, BOF cache and reducer, exposing the
//! imperative operation set from spec.md §6 as methods. Every evaluation entry point validates
//! its own preconditions (state errors on missing atoms/cell/indices) rather than trusting the
//! caller, matching the error-handling design's "surfaced; no observable produced" rule.

use std::path::Path;

use lin_alg::f64::Vec3;
use na_seq::Element;

use crate::atom::{AtomId, AtomStore};
use crate::cache::{self, BondOrderStorage};
use crate::cell::Supercell;
use crate::debug;
use crate::error::{CoreError, CoreResult};
use crate::ewald::{DirectEwald, EwaldKernel, EwaldOutput, EwaldParams};
use crate::forms::{BofFormTag, FormTag, PostProcessTag};
use crate::interaction::{self, BofHandle, Observable, StepOutput};
use crate::neighbor;
use crate::reduce::{self, Reducer};
use crate::registry::{BofParamSplit, BofRegistry, GroupId, PotentialRegistry, TargetFilter};
use crate::subcell::{self, SubcellGrid};

pub struct CoreState {
    atoms: AtomStore,
    cell: Option<Supercell>,
    grid: Option<SubcellGrid>,
    potentials: PotentialRegistry,
    bofs: BofRegistry,
    bof_storage: Option<BondOrderStorage>,
    ewald_params: Option<EwaldParams>,
    ewald_kernel: Box<dyn EwaldKernel>,
    reducer: Box<dyn Reducer>,
    last_forces: Option<Vec<Vec3>>,
}

impl Default for CoreState {
    fn default() -> Self {
        Self::new(Box::new(reduce::RayonReducer::default()))
    }
}

impl CoreState {
    pub fn new(world: Box<dyn Reducer>) -> Self {
        Self {
            atoms: AtomStore::new(),
            cell: None,
            grid: None,
            potentials: PotentialRegistry::new(),
            bofs: BofRegistry::new(),
            bof_storage: None,
            ewald_params: None,
            ewald_kernel: Box::new(DirectEwald),
            reducer: world,
            last_forces: None,
        }
    }

    // ---- Structure ----

    pub fn generate_atoms(
        &mut self,
        elements: &[Element],
        tags: &[i32],
        masses: &[f64],
        charges: &[f64],
        posits: &[Vec3],
    ) -> Vec<AtomId> {
        self.atoms.generate_atoms(elements, tags, masses, charges, posits)
    }

    pub fn update_coordinates(&mut self, posits: &[(AtomId, Vec3)]) {
        self.atoms.update_coordinates(posits);
        self.grid = None;
    }

    pub fn update_charges(&mut self, charges: &[(AtomId, f64)]) {
        self.atoms.update_charges(charges);
    }

    pub fn create_cell(&mut self, vectors: [Vec3; 3], periodic: [bool; 3]) -> CoreResult<()> {
        self.cell = Some(Supercell::new(vectors, periodic)?);
        self.grid = None;
        Ok(())
    }

    pub fn get_cell_vectors(&self) -> CoreResult<[Vec3; 3]> {
        Ok(self.cell_ref()?.get_cell_vectors())
    }

    pub fn get_number_of_atoms(&self) -> usize {
        self.atoms.len()
    }

    pub fn list_atoms(&self) -> impl Iterator<Item = &crate::atom::Atom> {
        self.atoms.iter()
    }

    pub fn list_cell(&self) -> CoreResult<[Vec3; 3]> {
        self.get_cell_vectors()
    }

    fn cell_ref(&self) -> CoreResult<&Supercell> {
        self.cell.as_ref().ok_or_else(|| CoreError::State("no cell has been created".into()))
    }

    // ---- Registration ----

    pub fn allocate_potentials(&mut self, n: usize) {
        self.potentials.allocate(n);
    }

    pub fn add_potential(
        &mut self,
        form: FormTag,
        params: Vec<f64>,
        hard_cutoff: f64,
        soft_cutoff: Option<f64>,
        targets: Vec<TargetFilter>,
        bof_group: Option<GroupId>,
    ) -> CoreResult<Vec<u32>> {
        self.potentials.add_potential(form, params, hard_cutoff, soft_cutoff, targets, bof_group)
    }

    pub fn allocate_bofs(&mut self, n: usize) {
        self.bofs.allocate(n);
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
        self.bofs.add_bond_order_factor(form, params, hard_cutoff, soft_cutoff, targets, group, post_process)
    }

    // ---- Indexing ----

    pub fn assign_potential_indices(&mut self) {
        self.potentials.assign_indices(&mut self.atoms);
    }

    pub fn assign_bond_order_factor_indices(&mut self) {
        self.bofs.assign_indices(&mut self.atoms);
    }

    // ---- BOF cache ----

    pub fn allocate_bond_order_storage(&mut self, n_groups: usize, n_factors: usize) -> CoreResult<()> {
        self.bof_storage = Some(cache::allocate_bond_order_storage(self.atoms.len(), n_groups, n_factors)?);
        Ok(())
    }

    pub fn empty_bond_order_storage(&mut self) -> CoreResult<()> {
        let storage = self.bof_storage_mut()?;
        cache::empty_bond_order_storage(storage);
        Ok(())
    }

    pub fn empty_bond_order_gradient_storage(&mut self, slot: Option<usize>) -> CoreResult<()> {
        let storage = self.bof_storage_mut()?;
        cache::empty_bond_order_gradient_storage(storage, slot);
        Ok(())
    }

    pub fn fill_bond_order_storage(&mut self) -> CoreResult<()> {
        let atoms = &self.atoms;
        let bofs = &self.bofs;
        let storage = self
            .bof_storage
            .as_mut()
            .ok_or_else(|| CoreError::State("bond-order storage has not been allocated".into()))?;
        cache::fill_bond_order_storage(storage, atoms, bofs)
    }

    fn bof_storage_mut(&mut self) -> CoreResult<&mut BondOrderStorage> {
        self.bof_storage
            .as_mut()
            .ok_or_else(|| CoreError::State("bond-order storage has not been allocated".into()))
    }

    // ---- Neighbor infrastructure ----

    pub fn create_space_partitioning(&mut self, max_cutoff: f64) -> CoreResult<()> {
        let cell = self.cell_ref()?;
        let dims = subcell::get_optimal_splitting(cell, max_cutoff)?;
        self.grid = Some(subcell::divide_cell(cell, dims));
        Ok(())
    }

    pub fn build_neighbor_lists(&mut self, cutoffs: &[f64]) -> CoreResult<()> {
        if self.atoms.is_empty() {
            return Err(CoreError::State("cannot build neighbor lists with no atoms".into()));
        }
        let cell = self.cell.ok_or_else(|| CoreError::State("no cell has been created".into()))?;
        let grid = self
            .grid
            .as_mut()
            .ok_or_else(|| CoreError::State("space partitioning has not been created".into()))?;
        subcell::bin_atoms(grid, &mut self.atoms, &cell);
        neighbor::build_neighbor_lists(&mut self.atoms, grid, &cell, cutoffs)
    }

    pub fn get_number_of_neighbors(&self, i: AtomId) -> usize {
        self.atoms.get(i).neighbors.len()
    }

    pub fn get_neighbor_list_of_atom(&self, i: AtomId) -> &[neighbor::NeighborEntry] {
        &self.atoms.get(i).neighbors
    }

    // ---- Evaluation ----

    pub fn calculate_energy(&mut self) -> CoreResult<f64> {
        let per_rank = self.run_every_rank(Observable::Energy)?;
        let reduced = self.reducer.sum_scalar(per_rank.iter().map(|o| o.energy).collect());
        let ewald = self.ewald_energy_if_set()?;
        Ok(reduced + ewald)
    }

    pub fn calculate_forces(&mut self) -> CoreResult<(Vec<Vec3>, [f64; 6])> {
        let per_rank = self.run_every_rank(Observable::Forces)?;
        let mut forces = self.reducer.sum_vectors(per_rank.iter().map(|o| o.forces.clone()).collect());
        let mut stress = self.reducer.sum_stress(per_rank.iter().map(|o| o.stress).collect());

        if let Some(params) = &self.ewald_params {
            let ewald: EwaldOutput = self.ewald_kernel.forces(&self.atoms, self.cell_ref()?, params)?;
            for (f, ef) in forces.iter_mut().zip(ewald.forces.iter()) {
                *f += *ef;
            }
            for k in 0..6 {
                stress[k] += ewald.stress[k];
            }
        }

        self.last_forces = Some(forces.clone());
        Ok((forces, stress))
    }

    pub fn calculate_electronegativities(&mut self) -> CoreResult<Vec<f64>> {
        let per_rank = self.run_every_rank(Observable::Electronegativity)?;
        let n = self.atoms.len();
        let mut totals = vec![0.0; n];
        for out in per_rank {
            for (t, v) in totals.iter_mut().zip(out.electronegativities.iter()) {
                *t += v;
            }
        }

        if let Some(params) = &self.ewald_params {
            let ewald = self.ewald_kernel.electronegativities(&self.atoms, self.cell_ref()?, params)?;
            for (t, chi) in totals.iter_mut().zip(ewald.iter()) {
                *t += chi;
            }
        }

        Ok(totals)
    }

    /// Runs the local loop once per simulated rank, each owning its deterministic atom-index
    /// partition (spec.md §4.7), returning every rank's unreduced partial result for the caller
    /// to all-reduce. Errors are all-reduced by severity first (spec.md §7): a rank that
    /// succeeded never masks a more severe error raised on another rank, and the step fails as
    /// one decision every rank agrees on rather than on whichever rank happened to error first.
    fn run_every_rank(&mut self, observable: Observable) -> CoreResult<Vec<StepOutput>> {
        if self.atoms.is_empty() {
            return Err(CoreError::State("cannot evaluate with no atoms".into()));
        }
        let cell = self.cell.ok_or_else(|| CoreError::State("no cell has been created".into()))?;
        let partitions = reduce::partition_by_rank(self.atoms.len(), self.reducer.n_ranks());

        let mut results: Vec<CoreResult<StepOutput>> = Vec::with_capacity(partitions.len());
        for owned in partitions {
            let bof = self
                .bof_storage
                .as_mut()
                .map(|storage| BofHandle { storage, registry: &self.bofs });
            results.push(interaction::evaluate(&self.atoms, &cell, &self.potentials, bof, observable, &owned));
        }

        let errors: Vec<Option<CoreError>> = results.iter().map(|r| r.as_ref().err().cloned()).collect();
        if let Some(worst) = self.reducer.agree_on_error(errors) {
            return Err(worst);
        }
        Ok(results.into_iter().map(|r| r.unwrap()).collect())
    }

    fn ewald_energy_if_set(&self) -> CoreResult<f64> {
        match &self.ewald_params {
            Some(params) => self.ewald_kernel.energy(&self.atoms, self.cell_ref()?, params),
            None => Ok(0.0),
        }
    }

    // ---- Long-range ----

    pub fn set_ewald_parameters(
        &mut self,
        real_cutoff: f64,
        k_cutoffs: [i32; 3],
        sigma: f64,
        epsilon: f64,
        scaler: Vec<f64>,
    ) {
        self.ewald_params = Some(EwaldParams { real_cutoff, k_cutoffs, sigma, epsilon, scaler });
    }

    pub fn get_ewald_energy(&self) -> CoreResult<f64> {
        let params = self
            .ewald_params
            .as_ref()
            .ok_or_else(|| CoreError::State("Ewald parameters have not been set".into()))?;
        self.ewald_kernel.energy(&self.atoms, self.cell_ref()?, params)
    }

    // ---- Parameter-set loading ----

    pub fn load_potentials_toml(&mut self, contents: &str) -> CoreResult<usize> {
        crate::config::load_potentials_toml(&mut self.potentials, contents)
    }

    pub fn load_bofs_toml(&mut self, contents: &str) -> CoreResult<usize> {
        crate::config::load_bofs_toml(&mut self.bofs, contents)
    }

    // ---- Checkpointing ----

    /// Encodes a binary checkpoint of every atom's position, momentum and charge.
    pub fn snapshot_atoms(&self) -> CoreResult<Vec<u8>> {
        bincode::encode_to_vec(self.atoms.snapshot(), bincode::config::standard())
            .map_err(|e| CoreError::Internal(format!("snapshot encoding failed: {e}")))
    }

    /// Restores positions, momenta and charges from a checkpoint produced by `snapshot_atoms`
    /// against an atom set of the same size and id assignment.
    pub fn restore_atoms(&mut self, bytes: &[u8]) -> CoreResult<()> {
        let (snapshot, _): (Vec<crate::atom::AtomSnapshot>, usize) =
            bincode::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| CoreError::Configuration(format!("malformed atom snapshot: {e}")))?;
        self.atoms
            .restore_snapshot(&snapshot)
            .map_err(CoreError::State)?;
        self.grid = None;
        Ok(())
    }

    // ---- Debug dump ----

    pub fn dump_step(&self, rank: usize, step: u64, dir: &Path) -> CoreResult<()> {
        let cell = self.cell_ref()?;
        debug::dump_step(&self.atoms, cell, self.last_forces.as_deref(), rank, step, dir)
    }

    // ---- Lifecycle ----

    pub fn release_all_memory(&mut self) {
        self.atoms.clear();
        self.cell = None;
        self.grid = None;
        self.potentials.clear();
        self.bofs.clear();
        self.bof_storage = None;
        self.ewald_params = None;
        self.last_forces = None;
    }

    pub fn clear_atoms(&mut self) {
        self.atoms.clear();
        self.grid = None;
    }

    pub fn clear_potentials(&mut self) {
        self.potentials.clear();
    }

    pub fn clear_bofs(&mut self) {
        self.bofs.clear();
    }

    pub fn clear_bond_order_storage(&mut self) {
        self.bof_storage = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluating_with_no_atoms_is_a_state_error() {
        let mut state = CoreState::default();
        let err = state.calculate_energy().unwrap_err();
        assert!(matches!(err, CoreError::State(_)));
    }

    #[test]
    fn full_lifecycle_computes_lj_energy() {
        let mut state = CoreState::default();
        state.generate_atoms(
            &[Element::Argon, Element::Argon],
            &[0, 0],
            &[40.0, 40.0],
            &[0.0, 0.0],
            &[Vec3::new(5.0, 5.0, 5.0), Vec3::new(6.2, 5.0, 5.0)],
        );
        state.create_cell(
            [Vec3::new(20.0, 0.0, 0.0), Vec3::new(0.0, 20.0, 0.0), Vec3::new(0.0, 0.0, 20.0)],
            [false, false, false],
        ).unwrap();
        state
            .add_potential(
                FormTag::LennardJones, vec![1.0, 1.0], 5.0, None,
                vec![TargetFilter::any(), TargetFilter::any()], None,
            )
            .unwrap();
        state.assign_potential_indices();
        state.create_space_partitioning(5.0).unwrap();
        state.build_neighbor_lists(&[5.0, 5.0]).unwrap();

        let energy = state.calculate_energy().unwrap();
        let expected = crate::forms::evaluate_lj_energy(&[1.0, 1.0], 1.2).unwrap();
        assert!((energy - expected).abs() < 1e-9);
    }

    #[test]
    fn snapshot_and_restore_atoms_roundtrip() {
        let mut state = CoreState::default();
        state.generate_atoms(&[Element::Carbon], &[0], &[12.0], &[0.0], &[Vec3::new(1.0, 1.0, 1.0)]);
        let bytes = state.snapshot_atoms().unwrap();
        state.update_coordinates(&[(AtomId(0), Vec3::new_zero())]);
        state.restore_atoms(&bytes).unwrap();
        assert_eq!(state.list_atoms().next().unwrap().posit, Vec3::new(1.0, 1.0, 1.0));
    }

    #[test]
    fn release_all_memory_clears_every_subsystem() {
        let mut state = CoreState::default();
        state.generate_atoms(&[Element::Carbon], &[0], &[12.0], &[0.0], &[Vec3::new_zero()]);
        state.release_all_memory();
        assert_eq!(state.get_number_of_atoms(), 0);
        assert!(state.get_cell_vectors().is_err());
    }
}
