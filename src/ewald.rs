//! Long-range electrostatics add-on (spec.md §4.6): one external Ewald routine per observable,
//! invoked with the full atom set after the short-range loop has been reduced.
//!
//! `EwaldKernel` is the seam the interaction core calls through, so swapping in a
//! faster/approximate implementation never touches `interaction.rs`. `DirectEwald` is the
//! reference implementation: real-space erfc sum, reciprocal-space sum over a bounded k-vector
//! box, and the self-energy correction, grounded on the same three-term decomposition as
//! `janosh-matterviz`'s Ewald module (its `erfc` approximation is reused verbatim below).

use std::f64::consts::PI;

use lin_alg::f64::Vec3;

use crate::atom::AtomStore;
use crate::cell::Supercell;
use crate::error::{CoreError, CoreResult};

/// `set_ewald_parameters`: real-space cutoff, the three reciprocal-space k-vector bounds, the
/// Gaussian splitting width `sigma` (equivalently `eta = 1/(sigma*sqrt(2))`), vacuum permittivity
/// `epsilon`, and a per-atom scaler (all-ones unless the caller wants partial electrostatics).
#[derive(Debug, Clone)]
pub struct EwaldParams {
    pub real_cutoff: f64,
    pub k_cutoffs: [i32; 3],
    pub sigma: f64,
    pub epsilon: f64,
    pub scaler: Vec<f64>,
}

impl EwaldParams {
    fn eta(&self) -> f64 {
        1.0 / (self.sigma * std::f64::consts::SQRT_2)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EwaldOutput {
    pub energy: f64,
    pub forces: Vec<Vec3>,
    pub stress: [f64; 6],
}

pub trait EwaldKernel {
    fn energy(&self, atoms: &AtomStore, cell: &Supercell, params: &EwaldParams) -> CoreResult<f64>;
    fn forces(&self, atoms: &AtomStore, cell: &Supercell, params: &EwaldParams) -> CoreResult<EwaldOutput>;
    /// `calculate_ewald_electronegativities`: `chi_a = -d(energy)/d(charge_a)` per atom (spec.md
    /// glossary), the charge-equilibration counterpart of `forces`'s position derivative.
    fn electronegativities(&self, atoms: &AtomStore, cell: &Supercell, params: &EwaldParams) -> CoreResult<Vec<f64>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DirectEwald;

impl EwaldKernel for DirectEwald {
    fn energy(&self, atoms: &AtomStore, cell: &Supercell, params: &EwaldParams) -> CoreResult<f64> {
        validate(atoms, params)?;
        let real = real_space_energy(atoms, cell, params);
        let recip = reciprocal_energy(atoms, cell, params);
        let self_energy = self_energy(atoms, params);
        let total = (real + recip + self_energy) / params.epsilon;
        if !total.is_finite() {
            return Err(CoreError::Numerical(format!("Ewald energy is non-finite: {total}")));
        }
        Ok(total)
    }

    fn forces(&self, atoms: &AtomStore, cell: &Supercell, params: &EwaldParams) -> CoreResult<EwaldOutput> {
        validate(atoms, params)?;
        const H: f64 = 1e-6;
        let n = atoms.len();
        let mut forces = vec![Vec3::new_zero(); n];
        let mut working = atoms.clone();

        for idx in 0..n {
            let id = crate::atom::AtomId(idx as u32);
            let base = working.get(id).posit;
            let mut grad = Vec3::new_zero();
            for axis in 0..3 {
                let mut plus = base;
                let mut minus = base;
                bump(&mut plus, axis, H);
                bump(&mut minus, axis, -H);
                working.update_coordinates(&[(id, plus)]);
                let e_plus = self.energy(&working, cell, params)?;
                working.update_coordinates(&[(id, minus)]);
                let e_minus = self.energy(&working, cell, params)?;
                working.update_coordinates(&[(id, base)]);
                set_axis(&mut grad, axis, (e_plus - e_minus) / (2.0 * H));
            }
            forces[idx] = Vec3::new(-grad.x, -grad.y, -grad.z);
        }

        Ok(EwaldOutput { energy: self.energy(atoms, cell, params)?, forces, stress: [0.0; 6] })
    }

    fn electronegativities(&self, atoms: &AtomStore, cell: &Supercell, params: &EwaldParams) -> CoreResult<Vec<f64>> {
        validate(atoms, params)?;
        const H: f64 = 1e-6;
        let n = atoms.len();
        let mut chi = vec![0.0; n];
        let mut working = atoms.clone();

        for idx in 0..n {
            let id = crate::atom::AtomId(idx as u32);
            let base = working.get(id).charge;
            working.update_charges(&[(id, base + H)]);
            let e_plus = self.energy(&working, cell, params)?;
            working.update_charges(&[(id, base - H)]);
            let e_minus = self.energy(&working, cell, params)?;
            working.update_charges(&[(id, base)]);
            chi[idx] = -(e_plus - e_minus) / (2.0 * H);
        }

        Ok(chi)
    }
}

fn bump(v: &mut Vec3, axis: usize, delta: f64) {
    match axis {
        0 => v.x += delta,
        1 => v.y += delta,
        _ => v.z += delta,
    }
}

fn set_axis(v: &mut Vec3, axis: usize, value: f64) {
    match axis {
        0 => v.x = value,
        1 => v.y = value,
        _ => v.z = value,
    }
}

fn validate(atoms: &AtomStore, params: &EwaldParams) -> CoreResult<()> {
    if params.scaler.len() != atoms.len() {
        return Err(CoreError::Configuration(
            "Ewald scaler must have one entry per atom".into(),
        ));
    }
    if params.real_cutoff <= 0.0 || params.sigma <= 0.0 || params.epsilon <= 0.0 {
        return Err(CoreError::Configuration(
            "Ewald real cutoff, sigma and epsilon must all be positive".into(),
        ));
    }
    Ok(())
}

fn real_space_energy(atoms: &AtomStore, cell: &Supercell, params: &EwaldParams) -> f64 {
    let eta = params.eta();
    let slice = atoms.as_slice();
    let mut energy = 0.0;
    for (i, atom_i) in slice.iter().enumerate() {
        for (j, atom_j) in slice.iter().enumerate() {
            if i == j {
                continue;
            }
            let r_vec = cell.separation_vector(atom_i.posit, atom_j.posit, (0, 0, 0));
            let r = r_vec.magnitude();
            if r <= 0.0 || r > params.real_cutoff {
                continue;
            }
            let qi = atom_i.charge * params.scaler[i];
            let qj = atom_j.charge * params.scaler[j];
            energy += 0.5 * qi * qj * erfc(eta * r) / r;
        }
    }
    energy
}

fn reciprocal_energy(atoms: &AtomStore, cell: &Supercell, params: &EwaldParams) -> f64 {
    let eta = params.eta();
    let vectors = cell.get_cell_vectors();
    let volume = vectors[0].x * (vectors[1].y * vectors[2].z - vectors[1].z * vectors[2].y)
        - vectors[0].y * (vectors[1].x * vectors[2].z - vectors[1].z * vectors[2].x)
        + vectors[0].z * (vectors[1].x * vectors[2].y - vectors[1].y * vectors[2].x);
    if volume.abs() < 1e-12 {
        return 0.0;
    }

    let recip = reciprocal_vectors(vectors, volume);
    let slice = atoms.as_slice();
    let mut energy = 0.0;

    for kx in -params.k_cutoffs[0]..=params.k_cutoffs[0] {
        for ky in -params.k_cutoffs[1]..=params.k_cutoffs[1] {
            for kz in -params.k_cutoffs[2]..=params.k_cutoffs[2] {
                if kx == 0 && ky == 0 && kz == 0 {
                    continue;
                }
                let k = recip[0] * kx as f64 + recip[1] * ky as f64 + recip[2] * kz as f64;
                let k_sq = k.x * k.x + k.y * k.y + k.z * k.z;
                let structure = slice.iter().fold((0.0, 0.0), |(re, im), atom| {
                    let q = atom.charge * params.scaler[atom.id.index()];
                    let phase = k.x * atom.posit.x + k.y * atom.posit.y + k.z * atom.posit.z;
                    (re + q * phase.cos(), im + q * phase.sin())
                });
                let s_sq = structure.0 * structure.0 + structure.1 * structure.1;
                energy += (2.0 * PI / volume) * (-k_sq / (4.0 * eta * eta)).exp() / k_sq * s_sq;
            }
        }
    }
    energy
}

fn reciprocal_vectors(vectors: [Vec3; 3], volume: f64) -> [Vec3; 3] {
    let cross = |a: Vec3, b: Vec3| {
        Vec3::new(a.y * b.z - a.z * b.y, a.z * b.x - a.x * b.z, a.x * b.y - a.y * b.x)
    };
    let factor = 2.0 * PI / volume;
    [
        cross(vectors[1], vectors[2]) * factor,
        cross(vectors[2], vectors[0]) * factor,
        cross(vectors[0], vectors[1]) * factor,
    ]
}

fn self_energy(atoms: &AtomStore, params: &EwaldParams) -> f64 {
    let eta = params.eta();
    let q_sq_sum: f64 = atoms
        .as_slice()
        .iter()
        .map(|a| (a.charge * params.scaler[a.id.index()]).powi(2))
        .sum();
    -eta / PI.sqrt() * q_sq_sum
}

/// Complementary error function via the Abramowitz & Stegun 7.1.26 approximation.
fn erfc(val: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.3275911 * val.abs());
    let coeffs = [0.254829592, -0.284496736, 1.421413741, -1.453152027, 1.061405429];
    let poly = t * (coeffs[0] + t * (coeffs[1] + t * (coeffs[2] + t * (coeffs[3] + t * coeffs[4]))))
        * (-val * val).exp();
    if val >= 0.0 {
        poly
    } else {
        2.0 - poly
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomId;
    use na_seq::Element;

    fn nacl_pair() -> (AtomStore, Supercell) {
        let cell = Supercell::cubic(10.0, [true, true, true]).unwrap();
        let mut atoms = AtomStore::new();
        atoms.generate_atoms(
            &[Element::Sodium, Element::Chlorine],
            &[0, 0],
            &[23.0, 35.5],
            &[1.0, -1.0],
            &[Vec3::new(3.0, 3.0, 3.0), Vec3::new(5.0, 3.0, 3.0)],
        );
        (atoms, cell)
    }

    #[test]
    fn erfc_matches_known_values() {
        assert!((erfc(0.0) - 1.0).abs() < 1e-5);
        assert!((erfc(1.0) - 0.1573).abs() < 1e-3);
        assert!((erfc(-1.0) - (2.0 - erfc(1.0))).abs() < 1e-10);
    }

    #[test]
    fn mismatched_scaler_length_is_configuration_error() {
        let (atoms, cell) = nacl_pair();
        let params = EwaldParams { real_cutoff: 5.0, k_cutoffs: [2, 2, 2], sigma: 1.0, epsilon: 1.0, scaler: vec![1.0] };
        let err = DirectEwald.energy(&atoms, &cell, &params).unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[test]
    fn force_matches_negative_energy_gradient_by_finite_difference() {
        let (atoms, cell) = nacl_pair();
        let params = EwaldParams {
            real_cutoff: 5.0,
            k_cutoffs: [3, 3, 3],
            sigma: 1.0,
            epsilon: 1.0,
            scaler: vec![1.0, 1.0],
        };
        let out = DirectEwald.forces(&atoms, &cell, &params).unwrap();

        let h = 1e-5;
        let base = atoms.get(AtomId(1)).posit;
        let mut working = atoms.clone();
        working.update_coordinates(&[(AtomId(1), Vec3::new(base.x + h, base.y, base.z))]);
        let e_plus = DirectEwald.energy(&working, &cell, &params).unwrap();
        working.update_coordinates(&[(AtomId(1), Vec3::new(base.x - h, base.y, base.z))]);
        let e_minus = DirectEwald.energy(&working, &cell, &params).unwrap();
        let numeric = -(e_plus - e_minus) / (2.0 * h);

        assert!((out.forces[1].x - numeric).abs() < 1e-3);
    }

    #[test]
    fn electronegativity_matches_negative_energy_gradient_by_finite_difference() {
        let (atoms, cell) = nacl_pair();
        let params = EwaldParams {
            real_cutoff: 5.0,
            k_cutoffs: [3, 3, 3],
            sigma: 1.0,
            epsilon: 1.0,
            scaler: vec![1.0, 1.0],
        };
        let chi = DirectEwald.electronegativities(&atoms, &cell, &params).unwrap();

        let h = 1e-4;
        let base = atoms.get(AtomId(0)).charge;
        let mut working = atoms.clone();
        working.update_charges(&[(AtomId(0), base + h)]);
        let e_plus = DirectEwald.energy(&working, &cell, &params).unwrap();
        working.update_charges(&[(AtomId(0), base - h)]);
        let e_minus = DirectEwald.energy(&working, &cell, &params).unwrap();
        let numeric = -(e_plus - e_minus) / (2.0 * h);

        assert!((chi[0] - numeric).abs() < 1e-3);
    }
}
