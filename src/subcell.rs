//! Spatial subcell decomposition used to avoid O(N²) neighbor search.
//!
//! The supercell is divided into a grid of subcells whose edge is at least the largest
//! interaction cutoff, so that every atom within range of a given atom lives in one of its 27
//! neighboring subcells (itself included). Binning and the 27-cell neighbor table (with
//! periodic wrap-around or a non-periodic include-flag) are built once per call to
//! `create_space_partitioning` / whenever the geometry changes.

use crate::atom::{AtomId, AtomStore};
use crate::cell::Supercell;
use crate::error::{CoreError, CoreResult};

/// One of the 27 neighboring subcells of a given cell: which cell it is, the integer lattice
/// offset needed to bring a wrapped neighbor back to this cell's frame, and whether it should be
/// visited at all (false along a non-periodic axis once the candidate index runs off the grid).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellNeighbor {
    pub cell: (i32, i32, i32),
    pub offset: (i32, i32, i32),
    pub include: bool,
}

#[derive(Debug, Clone)]
pub struct SubcellGrid {
    pub dims: (i32, i32, i32),
    /// Atoms currently binned into each cell, flattened row-major (x varies fastest).
    buckets: Vec<Vec<AtomId>>,
    /// The 27-entry neighbor table, shared by every cell of the same dims (a pure function of
    /// cell coordinate modulo periodicity), indexed the same way as `buckets`.
    neighbor_tables: Vec<[CellNeighbor; 27]>,
}

impl SubcellGrid {
    fn flat(&self, c: (i32, i32, i32)) -> usize {
        let (nx, ny, _nz) = self.dims;
        (c.2 as usize * ny as usize + c.1 as usize) * nx as usize + c.0 as usize
    }

    pub fn atoms_in(&self, c: (i32, i32, i32)) -> &[AtomId] {
        &self.buckets[self.flat(c)]
    }

    pub fn neighbors_of(&self, c: (i32, i32, i32)) -> &[CellNeighbor; 27] {
        &self.neighbor_tables[self.flat(c)]
    }
}

/// Chooses a subcell count per axis such that each subcell's edge is at least `max_cutoff`,
/// approximating triclinic lattice vectors by their own length (sufficient for the
/// near-orthogonal cells this engine is expected to run against; a heavily skewed cell would
/// need a tilted subcell lattice, out of scope here as in the source).
pub fn get_optimal_splitting(cell: &Supercell, max_cutoff: f64) -> CoreResult<(i32, i32, i32)> {
    if max_cutoff <= 0.0 {
        return Err(CoreError::Configuration("max_cutoff must be positive".into()));
    }
    let vectors = cell.get_cell_vectors();
    let mut dims = [1i32; 3];
    for axis in 0..3 {
        let length = vectors[axis].magnitude();
        let n = (length / max_cutoff).floor() as i32;
        dims[axis] = n.max(1);
    }
    Ok((dims[0], dims[1], dims[2]))
}

/// Builds the subcell grid's (empty) bucket storage and 27-neighbor table for the given
/// dimensions and periodicity. Atoms are binned in afterward by `bin_atoms`.
pub fn divide_cell(cell: &Supercell, dims: (i32, i32, i32)) -> SubcellGrid {
    let (nx, ny, nz) = dims;
    let n_cells = (nx * ny * nz) as usize;
    let mut neighbor_tables = Vec::with_capacity(n_cells);

    for iz in 0..nz {
        for iy in 0..ny {
            for ix in 0..nx {
                let mut table = [CellNeighbor {
                    cell: (0, 0, 0),
                    offset: (0, 0, 0),
                    include: false,
                }; 27];
                let mut slot = 0;
                for dz in -1..=1 {
                    for dy in -1..=1 {
                        for dx in -1..=1 {
                            let raw = (ix + dx, iy + dy, iz + dz);
                            table[slot] = wrap_cell(raw, dims, cell.periodic);
                            slot += 1;
                        }
                    }
                }
                neighbor_tables.push(table);
            }
        }
    }

    SubcellGrid {
        dims,
        buckets: vec![Vec::new(); n_cells],
        neighbor_tables,
    }
}

/// Wraps a candidate cell coordinate along periodic axes (recording the lattice-vector offset
/// incurred) or marks it not-included along non-periodic axes when it falls outside `[0, n)`.
fn wrap_cell(raw: (i32, i32, i32), dims: (i32, i32, i32), periodic: [bool; 3]) -> CellNeighbor {
    let mut cell = [raw.0, raw.1, raw.2];
    let dims_arr = [dims.0, dims.1, dims.2];
    let mut offset = [0i32; 3];
    let mut include = true;

    for axis in 0..3 {
        if periodic[axis] {
            let n = dims_arr[axis];
            let mut c = cell[axis];
            let mut shift = 0;
            while c < 0 {
                c += n;
                shift -= 1;
            }
            while c >= n {
                c -= n;
                shift += 1;
            }
            cell[axis] = c;
            offset[axis] = shift;
        } else if cell[axis] < 0 || cell[axis] >= dims_arr[axis] {
            include = false;
        }
    }

    CellNeighbor {
        cell: (cell[0], cell[1], cell[2]),
        offset: (offset[0], offset[1], offset[2]),
        include,
    }
}

/// Bins every atom into its subcell, based on its wrapped fractional position. Also records each
/// atom's subcell coordinate triple on the atom itself (`Atom::subcell`), as the source does.
pub fn bin_atoms(grid: &mut SubcellGrid, atoms: &mut AtomStore, cell: &Supercell) {
    for bucket in &mut grid.buckets {
        bucket.clear();
    }

    let dims = grid.dims;
    let ids: Vec<AtomId> = atoms.ids().collect();
    for id in ids {
        let posit = atoms.get(id).posit;
        let (wrapped, wrap_offset) = cell.wrapped_coordinates(posit);
        let vectors = cell.get_cell_vectors();

        // Fractional coordinate of the wrapped position, derived the same way `cell` computes
        // it internally but re-projected here since subcell indices need it directly.
        let frac = project_fractional(wrapped, vectors);
        let subcell = (
            cell_index(frac.0, dims.0),
            cell_index(frac.1, dims.1),
            cell_index(frac.2, dims.2),
        );

        let a = atoms.get_mut(id);
        a.subcell = subcell;
        a.wrap_offset = wrap_offset;
        let flat = (subcell.2 as usize * dims.1 as usize + subcell.1 as usize) * dims.0 as usize
            + subcell.0 as usize;
        grid.buckets[flat].push(id);
    }
}

fn cell_index(frac: f64, n: i32) -> i32 {
    let idx = (frac * n as f64).floor() as i32;
    idx.clamp(0, n - 1)
}

/// Recovers fractional coordinates from a cartesian position, given the cell's row vectors, via
/// Cramer's rule. Subcell binning only needs this once per atom per rebuild, so a dedicated
/// (un-cached) solve is cheap enough.
fn project_fractional(p: lin_alg::f64::Vec3, vectors: [lin_alg::f64::Vec3; 3]) -> (f64, f64, f64) {
    let (a, b, c) = (vectors[0], vectors[1], vectors[2]);
    let det = a.x * (b.y * c.z - b.z * c.y) - a.y * (b.x * c.z - b.z * c.x)
        + a.z * (b.x * c.y - b.y * c.x);

    // Solve p = fa*a + fb*b + fc*c for (fa, fb, fc) via Cramer's rule on the column-vector form.
    let m = [[a.x, b.x, c.x], [a.y, b.y, c.y], [a.z, b.z, c.z]];
    let rhs = [p.x, p.y, p.z];
    let solve = |col: usize| -> f64 {
        let mut mat = m;
        for row in 0..3 {
            mat[row][col] = rhs[row];
        }
        let det_col = mat[0][0] * (mat[1][1] * mat[2][2] - mat[1][2] * mat[2][1])
            - mat[0][1] * (mat[1][0] * mat[2][2] - mat[1][2] * mat[2][0])
            + mat[0][2] * (mat[1][0] * mat[2][1] - mat[1][1] * mat[2][0]);
        det_col / det
    };

    (solve(0), solve(1), solve(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomStore;
    use lin_alg::f64::Vec3;
    use na_seq::Element;

    #[test]
    fn cubic_splitting_matches_cutoff() {
        let cell = Supercell::cubic(10.0, [true, true, true]).unwrap();
        let dims = get_optimal_splitting(&cell, 2.5).unwrap();
        assert_eq!(dims, (4, 4, 4));
    }

    #[test]
    fn periodic_neighbor_table_wraps_and_includes_everything() {
        let cell = Supercell::cubic(10.0, [true, true, true]).unwrap();
        let dims = get_optimal_splitting(&cell, 5.0).unwrap();
        assert_eq!(dims, (2, 2, 2));
        let grid = divide_cell(&cell, dims);
        for table in [grid.neighbors_of((0, 0, 0)), grid.neighbors_of((1, 1, 1))] {
            assert!(table.iter().all(|n| n.include));
        }
    }

    #[test]
    fn non_periodic_axis_excludes_out_of_range_neighbors() {
        let cell = Supercell::cubic(10.0, [true, true, false]).unwrap();
        let dims = get_optimal_splitting(&cell, 5.0).unwrap();
        let grid = divide_cell(&cell, dims);
        let corner = grid.neighbors_of((0, 0, 0));
        // Along z, going to -1 is off the non-periodic grid and must be excluded.
        let excluded = corner.iter().any(|n| !n.include);
        assert!(excluded);
    }

    #[test]
    fn binning_places_atom_in_expected_cell() {
        let cell = Supercell::cubic(10.0, [true, true, true]).unwrap();
        let dims = get_optimal_splitting(&cell, 2.5).unwrap();
        let mut grid = divide_cell(&cell, dims);
        let mut atoms = AtomStore::new();
        atoms.generate_atoms(
            &[Element::Carbon],
            &[0],
            &[12.0],
            &[0.0],
            &[Vec3::new(9.0, 9.0, 9.0)],
        );
        bin_atoms(&mut grid, &mut atoms, &cell);
        assert_eq!(atoms.get(AtomId(0)).subcell, (3, 3, 3));
    }
}
