//! Debug dump (spec.md §4.9 / §6): one `dump_<rank>_<step>.txt` per rank per step, write-only,
//! listing atom positions, the last computed forces (if any), and each atom's neighbor list
//! sorted by distance. Never read back by the core — purely an operator-facing artifact, in the
//! spirit of the teacher's own `println!`-based diagnostics rather than a structured log.

use std::fs;
use std::io::Write;
use std::path::Path;

use lin_alg::f64::Vec3;

use crate::atom::AtomStore;
use crate::cell::Supercell;
use crate::error::{CoreError, CoreResult};

pub fn dump_step(
    atoms: &AtomStore,
    cell: &Supercell,
    forces: Option<&[Vec3]>,
    rank: usize,
    step: u64,
    dir: &Path,
) -> CoreResult<()> {
    fs::create_dir_all(dir)
        .map_err(|e| CoreError::Resource(format!("could not create dump directory {dir:?}: {e}")))?;
    let path = dir.join(format!("dump_{rank}_{step}.txt"));
    let mut file = fs::File::create(&path)
        .map_err(|e| CoreError::Resource(format!("could not create dump file {path:?}: {e}")))?;

    for atom in atoms.iter() {
        let posit = atom.posit;
        write!(file, "{} {:?} {:.6} {:.6} {:.6}", atom.id, atom.element, posit.x, posit.y, posit.z)
            .map_err(|e| CoreError::Resource(format!("dump write failed: {e}")))?;

        if let Some(forces) = forces {
            let f = forces[atom.id.index()];
            write!(file, " force {:.6} {:.6} {:.6}", f.x, f.y, f.z)
                .map_err(|e| CoreError::Resource(format!("dump write failed: {e}")))?;
        }
        writeln!(file).map_err(|e| CoreError::Resource(format!("dump write failed: {e}")))?;

        let mut neighbors: Vec<(crate::atom::AtomId, f64)> = atom
            .neighbors
            .iter()
            .map(|n| {
                let other = atoms.get(n.neighbor);
                let dist = cell.separation_vector(posit, other.posit, n.offset).magnitude();
                (n.neighbor, dist)
            })
            .collect();
        neighbors.sort_by(|a, b| a.1.total_cmp(&b.1));

        for (neighbor, dist) in neighbors {
            writeln!(file, "  neighbor {neighbor} {dist:.6}")
                .map_err(|e| CoreError::Resource(format!("dump write failed: {e}")))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomId;
    use na_seq::Element;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("bondorder_debug_test_{name}"));
        dir
    }

    #[test]
    fn dump_writes_one_file_per_rank_and_step() {
        let dir = scratch_dir("dump_writes_one_file_per_rank_and_step");
        let _ = fs::remove_dir_all(&dir);

        let cell = Supercell::cubic(10.0, [true, true, true]).unwrap();
        let mut atoms = AtomStore::new();
        atoms.generate_atoms(
            &[Element::Carbon, Element::Oxygen],
            &[0, 0],
            &[12.0, 16.0],
            &[0.0, 0.0],
            &[Vec3::new_zero(), Vec3::new(1.2, 0.0, 0.0)],
        );
        atoms.get_mut(AtomId(0)).neighbors.push(crate::neighbor::NeighborEntry {
            neighbor: AtomId(1),
            offset: (0, 0, 0),
        });

        dump_step(&atoms, &cell, None, 0, 3, &dir).unwrap();
        let contents = fs::read_to_string(dir.join("dump_0_3.txt")).unwrap();
        assert!(contents.contains("neighbor"));
        let _ = fs::remove_dir_all(&dir);
    }
}
