//! The main per-step driver: one nested 1/2/3/4-body loop producing energy, forces+stress, or
//! electronegativities, selected by `Observable` (spec.md §4.5).
//!
//! The bond-order weight-gradient correction term (the `(∇_α weight) · e · f_s` subtraction
//! described in spec.md §4.5b) is applied at every arity in the force path: a tuple's BOF weight
//! is the mean of its members' factors, and each factor can depend on positions outside the tuple
//! (any atom feeding that member's coordination sum), so the correction is computed through
//! `cache::cached_bof_factor_gradient` rather than folded into the direct per-tuple force term.
//! `BofHandle` bundles the mutable gradient-slot cache with the registry that describes it and is
//! reborrowed at each arity boundary so the cache survives the whole rank-local evaluation.

use lin_alg::f64::Vec3;

use crate::atom::{AtomId, AtomStore};
use crate::cache::{self, BondOrderStorage};
use crate::cell::Supercell;
use crate::error::{CoreError, CoreResult};
use crate::forms::{self, FormTag};
use crate::neighbor::pick;
use crate::registry::{BofRegistry, GroupId, PotentialRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observable {
    Energy,
    Forces,
    Electronegativity,
}

#[derive(Debug, Clone)]
pub struct StepOutput {
    pub energy: f64,
    pub forces: Vec<Vec3>,
    /// Voigt order: (xx, yy, zz, yz, xz, xy).
    pub stress: [f64; 6],
    pub electronegativities: Vec<f64>,
}

impl StepOutput {
    fn new(n_atoms: usize) -> Self {
        Self {
            energy: 0.0,
            forces: vec![Vec3::new_zero(); n_atoms],
            stress: [0.0; 6],
            electronegativities: vec![0.0; n_atoms],
        }
    }
}

/// Bundles the BOF gradient-slot cache with the registry that describes it, so the weight-gradient
/// correction (spec.md §4.5b) can recompute/reuse `d(weight)/dX` terms that reach beyond a tuple's
/// own members. `reborrow` hands a fresh, shorter-lived handle to a callee without moving the
/// original out of the caller's loop.
pub struct BofHandle<'a> {
    pub storage: &'a mut BondOrderStorage,
    pub registry: &'a BofRegistry,
}

impl<'a> BofHandle<'a> {
    fn reborrow(&mut self) -> BofHandle<'_> {
        BofHandle { storage: &mut *self.storage, registry: self.registry }
    }
}

fn factor_for(bof: Option<&BofHandle>, atom: AtomId, group: Option<GroupId>) -> f64 {
    match (bof, group) {
        (Some(h), Some(g)) => h.storage.factor(atom, g),
        _ => 1.0,
    }
}

fn accumulate_stress(stress: &mut [f64; 6], r: Vec3, f: Vec3) {
    stress[0] += r.x * f.x;
    stress[1] += r.y * f.y;
    stress[2] += r.z * f.z;
    stress[3] += r.y * f.z;
    stress[4] += r.x * f.z;
    stress[5] += r.x * f.y;
}

/// Adds `-e_f_s/n * d(b_member)/dX` to every atom `X` each tuple member's BOF factor depends on
/// (spec.md §4.5b), using the gradient-slot cache so a member visited again at the same tuple
/// position reuses its last computed gradient rather than re-deriving it.
fn apply_weight_gradient_forces(
    out: &mut StepOutput,
    bof: &mut BofHandle,
    atoms: &AtomStore,
    cell: &Supercell,
    group: GroupId,
    members: &[(AtomId, usize)],
    e_f_s: f64,
) -> CoreResult<()> {
    let n = members.len() as f64;
    for &(member, position) in members {
        let grads =
            cache::cached_bof_factor_gradient(bof.storage, atoms, bof.registry, cell, group, member, position)?;
        for (affected, grad) in grads {
            out.forces[affected.index()] += grad * (-e_f_s / n);
        }
    }
    Ok(())
}

/// Runs one full evaluation over every atom owned by `owned` (the caller's rank partition),
/// producing the requested observable. Energies/forces/electronegativities accumulate only for
/// tuples whose first atom is in `owned`; the caller reduces across ranks afterward
/// (`reduce::Reducer`).
pub fn evaluate(
    atoms: &AtomStore,
    cell: &Supercell,
    potentials: &PotentialRegistry,
    mut bof: Option<BofHandle>,
    observable: Observable,
    owned: &[AtomId],
) -> CoreResult<StepOutput> {
    if atoms.is_empty() {
        return Err(CoreError::State("cannot evaluate with no atoms".into()));
    }

    let mut out = StepOutput::new(atoms.len());

    for &i in owned {
        if let Some(h) = bof.as_mut() {
            h.storage.clear_all_gradient_slots();
        }
        let atom_i = atoms.get(i);

        // 1-body.
        for &rec_idx in &atom_i.potential_indices {
            let record = potentials.get(rec_idx);
            if record.n_targets() != 1 {
                continue;
            }
            let b_i = factor_for(bof.as_ref(), i, record.bof_group);
            contribute_one_body(
                &mut out, bof.as_mut().map(|h| h.reborrow()), atoms, cell,
                i, record.form, &record.params, record.bof_group, b_i, observable,
            )?;
        }

        // 2-body and the many-body extensions rooted at each canonical neighbor pair.
        let mut many_bodies_found = false;
        for entry in &atom_i.neighbors {
            let j = entry.neighbor;
            if !pick(i, j, entry.offset) {
                continue;
            }
            if let Some(h) = bof.as_mut() {
                h.storage.clear_slot_two();
            }
            let atom_j = atoms.get(j);
            let r_ij = cell.separation_vector(atom_i.posit, atom_j.posit, entry.offset);
            let dist = r_ij.magnitude();
            if dist <= 0.0 {
                return Err(CoreError::Numerical(format!(
                    "degenerate zero separation between atoms {i} and {j}"
                )));
            }

            for &rec_idx in &atom_i.potential_indices {
                let record = potentials.get(rec_idx);
                if record.n_targets() == 2 && record.targets_atom(1, atom_j) && record.hard_cutoff > dist {
                    let b_i = factor_for(bof.as_ref(), i, record.bof_group);
                    let b_j = factor_for(bof.as_ref(), j, record.bof_group);
                    let weight = (b_i + b_j) / 2.0;
                    contribute_two_body(
                        &mut out, bof.as_mut().map(|h| h.reborrow()), atoms, cell,
                        i, j, r_ij, dist, record.form, &record.params,
                        record.soft_cutoff, record.hard_cutoff, weight, record.bof_group, observable,
                    )?;
                } else if record.n_targets() > 2 {
                    many_bodies_found = true;
                }
            }

            if many_bodies_found {
                contribute_three_and_four_body(
                    &mut out, atoms, cell, potentials, bof.as_mut().map(|h| h.reborrow()),
                    i, j, entry.offset, observable,
                )?;
            }
        }
    }

    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn contribute_one_body(
    out: &mut StepOutput,
    mut bof: Option<BofHandle>,
    atoms: &AtomStore,
    cell: &Supercell,
    i: AtomId,
    form: FormTag,
    params: &[f64],
    bof_group: Option<GroupId>,
    b_i: f64,
    observable: Observable,
) -> CoreResult<()> {
    let FormTag::Constant = form else {
        return Ok(());
    };
    let e = forms::evaluate_constant_energy(params)?;
    match observable {
        Observable::Energy => out.energy += e * b_i,
        Observable::Forces => {
            if let (Some(h), Some(group)) = (bof.as_mut(), bof_group) {
                apply_weight_gradient_forces(out, h, atoms, cell, group, &[(i, 1)], e)?;
            }
        }
        Observable::Electronegativity => out.electronegativities[i.index()] += 0.0,
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn contribute_two_body(
    out: &mut StepOutput,
    mut bof: Option<BofHandle>,
    atoms: &AtomStore,
    cell: &Supercell,
    i: AtomId,
    j: AtomId,
    r_ij: Vec3,
    dist: f64,
    form: FormTag,
    params: &[f64],
    soft_cutoff: Option<f64>,
    hard_cutoff: f64,
    weight: f64,
    bof_group: Option<GroupId>,
    observable: Observable,
) -> CoreResult<()> {
    let FormTag::LennardJones = form else {
        return Ok(());
    };
    let f_s = forms::smoothening_factor(dist, soft_cutoff, hard_cutoff)?;
    let e = forms::evaluate_lj_energy(params, dist)?;

    match observable {
        Observable::Energy => out.energy += e * f_s * weight,
        Observable::Forces => {
            let de_dr = forms::evaluate_lj_denergy_dr(params, dist)?;
            let df_dr = forms::smoothening_gradient(dist, soft_cutoff, hard_cutoff)?;
            let direction = r_ij / dist;
            // Force on j from the pair potential, along the i->j direction; force on i is equal
            // and opposite. Product rule across the smoothening factor and energy magnitude.
            let magnitude = de_dr * f_s + e * df_dr;
            let force_on_j = direction * (-magnitude) * weight;
            out.forces[j.index()] += force_on_j;
            out.forces[i.index()] -= force_on_j;
            accumulate_stress(&mut out.stress, r_ij, force_on_j);

            if let (Some(h), Some(group)) = (bof.as_mut(), bof_group) {
                apply_weight_gradient_forces(out, h, atoms, cell, group, &[(i, 1), (j, 2)], e * f_s)?;
            }
        }
        Observable::Electronegativity => {}
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn contribute_three_and_four_body(
    out: &mut StepOutput,
    atoms: &AtomStore,
    cell: &Supercell,
    potentials: &PotentialRegistry,
    mut bof: Option<BofHandle>,
    i: AtomId,
    j: AtomId,
    offset_ij: (i32, i32, i32),
    observable: Observable,
) -> CoreResult<()> {
    let atom_i = atoms.get(i);
    let atom_j = atoms.get(j);

    // Triplets centered on i: neighbor k of i, canonical against j. The offset from j to k is
    // the offset from i to k minus the offset from i to j (both measured from the shared center).
    for entry_k in &atom_i.neighbors {
        let k = entry_k.neighbor;
        if k == j || !pick(j, k, combine_offset(offset_ij, entry_k.offset, true)) {
            continue;
        }
        evaluate_triplet(out, atoms, cell, potentials, bof.as_mut().map(|h| h.reborrow()), j, i, k, observable)?;
    }

    // Triplets centered on j: neighbor k of j, canonical against i.
    for entry_k in &atom_j.neighbors {
        let k = entry_k.neighbor;
        if k == i || !pick(i, k, entry_k.offset) {
            continue;
        }
        evaluate_triplet(out, atoms, cell, potentials, bof.as_mut().map(|h| h.reborrow()), i, j, k, observable)?;
    }

    Ok(())
}

fn combine_offset(a: (i32, i32, i32), b: (i32, i32, i32), negate_a: bool) -> (i32, i32, i32) {
    let sign = if negate_a { -1 } else { 1 };
    (sign * a.0 + b.0, sign * a.1 + b.1, sign * a.2 + b.2)
}

/// Evaluates every 3-body potential targeting the canonical triplet `(a, center, c)`, plus any
/// 4-body extension rooted at it (Open Question 1: the fourth atom is always a fresh neighbor,
/// distinct from `a`, never reusing `atom3`'s identity). Gradient-slot positions 1/2/3 are used for
/// `a`/`center`/`c` respectively.
#[allow(clippy::too_many_arguments)]
fn evaluate_triplet(
    out: &mut StepOutput,
    atoms: &AtomStore,
    cell: &Supercell,
    potentials: &PotentialRegistry,
    mut bof: Option<BofHandle>,
    a: AtomId,
    center: AtomId,
    c: AtomId,
    observable: Observable,
) -> CoreResult<()> {
    let atom_a = atoms.get(a);
    let atom_center = atoms.get(center);
    let atom_c = atoms.get(c);

    let offset_ca = atom_center.neighbors.iter().find(|n| n.neighbor == a).map(|n| n.offset).unwrap_or((0, 0, 0));
    let offset_cc = atom_center.neighbors.iter().find(|n| n.neighbor == c).map(|n| n.offset).unwrap_or((0, 0, 0));

    let r_ca = cell.separation_vector(atom_center.posit, atom_a.posit, offset_ca);
    let r_cc = cell.separation_vector(atom_center.posit, atom_c.posit, offset_cc);
    let d_ca = r_ca.magnitude();
    let d_cc = r_cc.magnitude();

    let mut four_body_enabled = false;

    for &rec_idx in &atom_center.potential_indices {
        let record = potentials.get(rec_idx);
        if record.n_targets() == 3
            && record.targets.len() == 3
            && record.targets[1].matches(atom_center)
            && (record.targets[0].matches(atom_a) && record.targets[2].matches(atom_c))
            && record.hard_cutoff > d_ca
            && record.hard_cutoff > d_cc
        {
            let FormTag::BondBending = record.form else {
                if record.n_targets() > 3 {
                    four_body_enabled = true;
                }
                continue;
            };
            let f_s_a = forms::smoothening_factor(d_ca, record.soft_cutoff, record.hard_cutoff)?;
            let f_s_c = forms::smoothening_factor(d_cc, record.soft_cutoff, record.hard_cutoff)?;
            let f_s = f_s_a * f_s_c;
            let b_a = factor_for(bof.as_ref(), a, record.bof_group);
            let b_center = factor_for(bof.as_ref(), center, record.bof_group);
            let b_c = factor_for(bof.as_ref(), c, record.bof_group);
            let weight = (b_a + b_center + b_c) / 3.0;

            let posit_a = atom_center.posit - r_ca;
            let posit_c = atom_center.posit + r_cc;
            let e = forms::evaluate_bond_bending_energy(&record.params, r_ca, r_cc)?;

            match observable {
                Observable::Energy => out.energy += e * f_s * weight,
                Observable::Forces => {
                    let tf = forms::bond_bending_forces(&record.params, posit_a, atom_center.posit, posit_c)?;
                    out.forces[a.index()] += tf.forces[0] * (f_s * weight);
                    out.forces[center.index()] += tf.forces[1] * (f_s * weight);
                    out.forces[c.index()] += tf.forces[2] * (f_s * weight);
                    accumulate_stress(&mut out.stress, r_ca, tf.forces[0] * (f_s * weight));
                    accumulate_stress(&mut out.stress, r_cc, tf.forces[2] * (f_s * weight));

                    if let (Some(h), Some(group)) = (bof.as_mut(), record.bof_group) {
                        apply_weight_gradient_forces(
                            out, h, atoms, cell, group, &[(a, 1), (center, 2), (c, 3)], e * f_s,
                        )?;
                    }
                }
                Observable::Electronegativity => {}
            }
        } else if record.n_targets() > 3 {
            four_body_enabled = true;
        }
    }

    if four_body_enabled {
        extend_to_four_body(out, atoms, cell, potentials, bof.as_mut().map(|h| h.reborrow()), a, center, c, observable)?;
    }

    Ok(())
}

/// Extends triplet `(a, center, c)` by one neighbor at either end, per Open Question 1: the
/// fourth atom (`atom4 = atom_quadruplet(4)`) is always distinct from `a` (`atom3` in the
/// enumeration's own numbering), never reusing its identity even when geometrically coincident.
#[allow(clippy::too_many_arguments)]
fn extend_to_four_body(
    out: &mut StepOutput,
    atoms: &AtomStore,
    cell: &Supercell,
    potentials: &PotentialRegistry,
    mut bof: Option<BofHandle>,
    a: AtomId,
    center: AtomId,
    c: AtomId,
    observable: Observable,
) -> CoreResult<()> {
    let atom_c = atoms.get(c);
    for entry in &atom_c.neighbors {
        let d = entry.neighbor;
        if d == a || d == center {
            continue;
        }
        if !pick(center, d, entry.offset) {
            continue;
        }
        evaluate_quadruplet(
            out, atoms, cell, potentials, bof.as_mut().map(|h| h.reborrow()), a, center, c, d, observable,
        )?;
    }
    Ok(())
}

/// Gradient-slot positions 1/2/3/4 are used for `a`/`center`/`c`/`d` respectively.
#[allow(clippy::too_many_arguments)]
fn evaluate_quadruplet(
    out: &mut StepOutput,
    atoms: &AtomStore,
    cell: &Supercell,
    potentials: &PotentialRegistry,
    mut bof: Option<BofHandle>,
    a: AtomId,
    center: AtomId,
    c: AtomId,
    d: AtomId,
    observable: Observable,
) -> CoreResult<()> {
    let atom_a = atoms.get(a);
    let atom_center = atoms.get(center);
    let atom_c = atoms.get(c);
    let atom_d = atoms.get(d);

    let offset_ca = atom_center.neighbors.iter().find(|n| n.neighbor == a).map(|n| n.offset).unwrap_or((0, 0, 0));
    let offset_cc = atom_center.neighbors.iter().find(|n| n.neighbor == c).map(|n| n.offset).unwrap_or((0, 0, 0));
    let offset_cd = atom_c.neighbors.iter().find(|n| n.neighbor == d).map(|n| n.offset).unwrap_or((0, 0, 0));

    let r_ca = cell.separation_vector(atom_center.posit, atom_a.posit, offset_ca);
    let r_cc = cell.separation_vector(atom_center.posit, atom_c.posit, offset_cc);
    let r_cd = cell.separation_vector(atom_c.posit, atom_d.posit, offset_cd);

    let posit_1 = atom_center.posit - r_ca;
    let posit_2 = atom_center.posit;
    let posit_3 = atom_center.posit + r_cc;
    let posit_4 = posit_3 + r_cd;

    for &rec_idx in &atom_center.potential_indices {
        let record = potentials.get(rec_idx);
        if record.n_targets() != 4 {
            continue;
        }
        let FormTag::Dihedral = record.form else { continue };
        if !(record.targets.len() == 4
            && record.targets[0].matches(atom_a)
            && record.targets[1].matches(atom_center)
            && record.targets[2].matches(atom_c)
            && record.targets[3].matches(atom_d))
        {
            continue;
        }
        let d_ca = r_ca.magnitude();
        let d_cc = r_cc.magnitude();
        let d_cd = r_cd.magnitude();
        if record.hard_cutoff <= d_ca || record.hard_cutoff <= d_cc || record.hard_cutoff <= d_cd {
            continue;
        }
        let f_s = forms::smoothening_factor(d_ca, record.soft_cutoff, record.hard_cutoff)?
            * forms::smoothening_factor(d_cc, record.soft_cutoff, record.hard_cutoff)?
            * forms::smoothening_factor(d_cd, record.soft_cutoff, record.hard_cutoff)?;
        let b_a = factor_for(bof.as_ref(), a, record.bof_group);
        let b_center = factor_for(bof.as_ref(), center, record.bof_group);
        let b_c = factor_for(bof.as_ref(), c, record.bof_group);
        let b_d = factor_for(bof.as_ref(), d, record.bof_group);
        let weight = (b_a + b_center + b_c + b_d) / 4.0;

        let e = forms::evaluate_dihedral_energy(&record.params, posit_1, posit_2, posit_3, posit_4)?;
        match observable {
            Observable::Energy => out.energy += e * f_s * weight,
            Observable::Forces => {
                let tf = forms::dihedral_forces(&record.params, posit_1, posit_2, posit_3, posit_4)?;
                out.forces[a.index()] += tf.forces[0] * (f_s * weight);
                out.forces[center.index()] += tf.forces[1] * (f_s * weight);
                out.forces[c.index()] += tf.forces[2] * (f_s * weight);
                out.forces[d.index()] += tf.forces[3] * (f_s * weight);
                accumulate_stress(&mut out.stress, r_ca, tf.forces[0] * (f_s * weight));
                accumulate_stress(&mut out.stress, r_cc, tf.forces[2] * (f_s * weight));
                accumulate_stress(&mut out.stress, r_ca + r_cd, tf.forces[3] * (f_s * weight));

                if let (Some(h), Some(group)) = (bof.as_mut(), record.bof_group) {
                    apply_weight_gradient_forces(
                        out, h, atoms, cell, group, &[(a, 1), (center, 2), (c, 3), (d, 4)], e * f_s,
                    )?;
                }
            }
            Observable::Electronegativity => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::allocate_bond_order_storage;
    use crate::forms::BofFormTag;
    use crate::registry::{BofParamSplit, BofRegistry, TargetFilter};
    use na_seq::Element;

    fn lj_pair(sep: f64) -> (AtomStore, Supercell, PotentialRegistry) {
        let cell = Supercell::cubic(20.0, [false, false, false]).unwrap();
        let mut atoms = AtomStore::new();
        atoms.generate_atoms(
            &[Element::Argon, Element::Argon],
            &[0, 0],
            &[40.0, 40.0],
            &[0.0, 0.0],
            &[Vec3::new(10.0, 10.0, 10.0), Vec3::new(10.0 + sep, 10.0, 10.0)],
        );
        atoms.get_mut(AtomId(0)).neighbors.push(crate::neighbor::NeighborEntry {
            neighbor: AtomId(1),
            offset: (0, 0, 0),
        });
        atoms.get_mut(AtomId(1)).neighbors.push(crate::neighbor::NeighborEntry {
            neighbor: AtomId(0),
            offset: (0, 0, 0),
        });

        let mut potentials = PotentialRegistry::new();
        potentials
            .add_potential(
                FormTag::LennardJones,
                vec![1.0, 1.0],
                5.0,
                None,
                vec![TargetFilter::any(), TargetFilter::any()],
                None,
            )
            .unwrap();
        potentials.assign_indices(&mut atoms);
        (atoms, cell, potentials)
    }

    #[test]
    fn two_body_forces_are_equal_and_opposite() {
        let (atoms, cell, potentials) = lj_pair(1.2);
        let owned: Vec<AtomId> = atoms.ids().collect();
        let out = evaluate(&atoms, &cell, &potentials, None, Observable::Forces, &owned).unwrap();
        let sum = out.forces[0] + out.forces[1];
        assert!(sum.magnitude() < 1e-9);
    }

    #[test]
    fn energy_matches_direct_lj_formula_at_separation() {
        let (atoms, cell, potentials) = lj_pair(1.5);
        let owned: Vec<AtomId> = atoms.ids().collect();
        let out = evaluate(&atoms, &cell, &potentials, None, Observable::Energy, &owned).unwrap();
        let expected = forms::evaluate_lj_energy(&[1.0, 1.0], 1.5).unwrap();
        assert!((out.energy - expected).abs() < 1e-9);
    }

    #[test]
    fn force_matches_negative_energy_gradient_by_finite_difference() {
        let (mut atoms, cell, potentials) = lj_pair(1.3);
        let owned: Vec<AtomId> = atoms.ids().collect();

        let energy_at = |atoms: &AtomStore| {
            evaluate(atoms, &cell, &potentials, None, Observable::Energy, &owned).unwrap().energy
        };

        let h = 1e-6;
        let base = atoms.get(AtomId(1)).posit;
        atoms.update_coordinates(&[(AtomId(1), Vec3::new(base.x + h, base.y, base.z))]);
        let e_plus = energy_at(&atoms);
        atoms.update_coordinates(&[(AtomId(1), Vec3::new(base.x - h, base.y, base.z))]);
        let e_minus = energy_at(&atoms);
        atoms.update_coordinates(&[(AtomId(1), base)]);

        let numeric_force_x = -(e_plus - e_minus) / (2.0 * h);
        let out = evaluate(&atoms, &cell, &potentials, None, Observable::Forces, &owned).unwrap();
        assert!((out.forces[1].x - numeric_force_x).abs() < 1e-4);
    }

    #[test]
    fn empty_atom_store_is_state_error() {
        let atoms = AtomStore::new();
        let cell = Supercell::cubic(10.0, [true, true, true]).unwrap();
        let potentials = PotentialRegistry::new();
        let err = evaluate(&atoms, &cell, &potentials, None, Observable::Energy, &[]).unwrap_err();
        assert!(matches!(err, CoreError::State(_)));
    }

    /// A three-atom chain where the outer atoms' coordination sum (and hence the pair's BOF
    /// weight) depends on a third atom outside the pair: this is exactly the case the
    /// weight-gradient correction exists for, and a build that skips it would miss this force
    /// component entirely.
    fn lj_with_coordination_weight(sep_01: f64, sep_12: f64) -> (AtomStore, Supercell, PotentialRegistry, BofRegistry) {
        let cell = Supercell::cubic(30.0, [false, false, false]).unwrap();
        let mut atoms = AtomStore::new();
        atoms.generate_atoms(
            &[Element::Argon, Element::Argon, Element::Argon],
            &[0, 0, 0],
            &[40.0, 40.0, 40.0],
            &[0.0, 0.0, 0.0],
            &[
                Vec3::new(10.0, 10.0, 10.0),
                Vec3::new(10.0 + sep_01, 10.0, 10.0),
                Vec3::new(10.0 + sep_01 + sep_12, 10.0, 10.0),
            ],
        );
        for (a, b) in [(0u32, 1u32), (1, 0), (1, 2), (2, 1)] {
            atoms.get_mut(AtomId(a)).neighbors.push(crate::neighbor::NeighborEntry {
                neighbor: AtomId(b),
                offset: (0, 0, 0),
            });
        }

        let group = GroupId(0);
        let mut potentials = PotentialRegistry::new();
        potentials
            .add_potential(
                FormTag::LennardJones,
                vec![1.0, 1.0],
                5.0,
                None,
                vec![TargetFilter::any(), TargetFilter::any()],
                Some(group),
            )
            .unwrap();
        potentials.assign_indices(&mut atoms);

        let mut bofs = BofRegistry::new();
        bofs.add_bond_order_factor(
            BofFormTag::Neighbors,
            BofParamSplit { two: vec![0.3], ..Default::default() },
            5.0,
            None,
            vec![TargetFilter::any(), TargetFilter::any()],
            group,
            None,
        )
        .unwrap();
        bofs.assign_indices(&mut atoms);

        (atoms, cell, potentials, bofs)
    }

    #[test]
    fn weight_gradient_term_matches_finite_difference_on_an_outside_atom() {
        let (atoms, cell, potentials, bofs) = lj_with_coordination_weight(1.3, 1.4);
        let owned: Vec<AtomId> = atoms.ids().collect();

        let energy_at = |atoms: &AtomStore| -> f64 {
            let mut storage = allocate_bond_order_storage(atoms.len(), 1, 1).unwrap();
            crate::cache::fill_bond_order_storage(&mut storage, atoms, &bofs).unwrap();
            let bof = BofHandle { storage: &mut storage, registry: &bofs };
            evaluate(atoms, &cell, &potentials, Some(bof), Observable::Energy, &owned).unwrap().energy
        };

        // Atom 2 does not participate in the (0, 1) pair directly, but it is atom 1's
        // coordination neighbor, so perturbing it changes the (0, 1) pair's BOF weight.
        let h = 1e-6;
        let mut perturbed = atoms.clone();
        let base = perturbed.get(AtomId(2)).posit;
        perturbed.update_coordinates(&[(AtomId(2), Vec3::new(base.x + h, base.y, base.z))]);
        let e_plus = energy_at(&perturbed);
        perturbed.update_coordinates(&[(AtomId(2), Vec3::new(base.x - h, base.y, base.z))]);
        let e_minus = energy_at(&perturbed);
        let numeric_force_x = -(e_plus - e_minus) / (2.0 * h);

        let mut storage = allocate_bond_order_storage(atoms.len(), 1, 1).unwrap();
        crate::cache::fill_bond_order_storage(&mut storage, &atoms, &bofs).unwrap();
        let bof = BofHandle { storage: &mut storage, registry: &bofs };
        let out = evaluate(&atoms, &cell, &potentials, Some(bof), Observable::Forces, &owned).unwrap();

        assert!((out.forces[2].x - numeric_force_x).abs() < 1e-3);
        // And a build that never applied the weight-gradient term would leave this force at
        // exactly zero, since atom 2 is outside the (0, 1) pair that is the only direct LJ term.
        assert!(out.forces[2].x.abs() > 1e-6);
    }
}
