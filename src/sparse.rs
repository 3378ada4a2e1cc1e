//! Sparse matrices in two coupled representations:
//! an editable dictionary-of-keys form and a derived
//! column-compressed form used for fast column traversal.
//!
//! The dictionary preserves insertion order of its keys, which matters
//! for operations that must be deterministic with respect to the order
//! entries were created in (e.g. traversing symmetry identifications).
//! The compressed form is built lazily on first access and invalidated
//! by any edit; its columns are sorted ascending by row index, so
//! conversion is deterministic.

use nalgebra as na;
use nalgebra_sparse as nas;

use std::cell::OnceCell;
use std::collections::HashMap;

use crate::error::MorphoError;

/// A real sparse matrix.
///
/// Entries are stored in a dictionary keyed by `(row, col)`; the
/// compressed-column form is derived on demand via [`Sparse::ccs`].
/// Arithmetic operations return fresh matrices and never alias their
/// operands.
#[derive(Clone, Debug, Default)]
pub struct Sparse {
    nrows: usize,
    ncols: usize,
    entries: HashMap<(usize, usize), f64>,
    /// Keys in the order they were first inserted.
    order: Vec<(usize, usize)>,
    ccs: OnceCell<nas::CscMatrix<f64>>,
}

impl Sparse {
    /// Create an empty matrix with the given dimensions.
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            ..Default::default()
        }
    }

    #[inline]
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    #[inline]
    pub fn ncols(&self) -> usize {
        self.ncols
    }

    #[inline]
    pub fn nnz(&self) -> usize {
        self.order.len()
    }

    /// Set an entry, growing the dimensions if the index lies outside them.
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        if row >= self.nrows {
            self.nrows = row + 1;
        }
        if col >= self.ncols {
            self.ncols = col + 1;
        }
        if self.entries.insert((row, col), value).is_none() {
            self.order.push((row, col));
        }
        // the compressed form no longer matches
        self.ccs = OnceCell::new();
    }

    /// Get an entry; absent entries read as zero.
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.entries.get(&(row, col)).copied().unwrap_or(0.0)
    }

    #[inline]
    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.entries.contains_key(&(row, col))
    }

    /// Iterate over `(row, col, value)` in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.order.iter().map(|&(r, c)| (r, c, self.entries[&(r, c)]))
    }

    /// The compressed-column form, built on first access.
    pub fn ccs(&self) -> &nas::CscMatrix<f64> {
        self.ccs.get_or_init(|| {
            let mut coo = nas::CooMatrix::new(self.nrows, self.ncols);
            for &(r, c) in &self.order {
                coo.push(r, c, self.entries[&(r, c)]);
            }
            nas::CscMatrix::from(&coo)
        })
    }

    /// The row indices present in a column, sorted ascending.
    pub fn rows_in_col(&self, col: usize) -> &[usize] {
        let ccs = self.ccs();
        let lo = ccs.col_offsets()[col];
        let hi = ccs.col_offsets()[col + 1];
        &ccs.row_indices()[lo..hi]
    }

    /// The column indices present in a row, sorted ascending.
    ///
    /// This scans the whole matrix; where row access dominates,
    /// work with the transpose instead.
    pub fn cols_in_row(&self, row: usize) -> Vec<usize> {
        let mut cols: Vec<usize> = self
            .order
            .iter()
            .filter(|&&(r, _)| r == row)
            .map(|&(_, c)| c)
            .collect();
        cols.sort_unstable();
        cols
    }

    /// The transpose as a new matrix.
    pub fn transpose(&self) -> Sparse {
        let mut out = Sparse::new(self.ncols, self.nrows);
        for (r, c, v) in self.iter() {
            out.set(c, r, v);
        }
        out
    }

    /// Compute `alpha * self + beta * other`.
    pub fn add(&self, alpha: f64, beta: f64, other: &Sparse) -> Result<Sparse, MorphoError> {
        if self.nrows != other.nrows || self.ncols != other.ncols {
            return Err(MorphoError::ShapeMismatch("sparse addition"));
        }
        let mut out = Sparse::new(self.nrows, self.ncols);
        for (r, c, v) in self.iter() {
            out.set(r, c, alpha * v + beta * other.get(r, c));
        }
        for (r, c, v) in other.iter() {
            if !self.contains(r, c) {
                out.set(r, c, beta * v);
            }
        }
        Ok(out)
    }

    /// Compute the matrix product `self * other`.
    pub fn mul(&self, other: &Sparse) -> Result<Sparse, MorphoError> {
        if self.ncols != other.nrows {
            return Err(MorphoError::ShapeMismatch("sparse multiplication"));
        }
        // column-major accumulation: column j of the product gathers
        // column k of self for every entry (k, j) of other
        let a = self.ccs();
        let b = other.ccs();
        let mut out = Sparse::new(self.nrows, other.ncols);
        let mut acc: HashMap<usize, f64> = HashMap::new();
        for j in 0..other.ncols {
            acc.clear();
            let (blo, bhi) = (b.col_offsets()[j], b.col_offsets()[j + 1]);
            for bi in blo..bhi {
                let k = b.row_indices()[bi];
                let bkj = b.values()[bi];
                let (alo, ahi) = (a.col_offsets()[k], a.col_offsets()[k + 1]);
                for ai in alo..ahi {
                    *acc.entry(a.row_indices()[ai]).or_insert(0.0) += a.values()[ai] * bkj;
                }
            }
            let mut rows: Vec<usize> = acc.keys().copied().collect();
            rows.sort_unstable();
            for r in rows {
                out.set(r, j, acc[&r]);
            }
        }
        Ok(out)
    }

    /// Solve `self * x = b` for a dense right-hand side.
    ///
    /// Square systems go through LU; rectangular ones through an SVD
    /// least-squares solve.
    pub fn solve(&self, b: &na::DMatrix<f64>) -> Result<na::DMatrix<f64>, MorphoError> {
        if self.nrows != b.nrows() {
            return Err(MorphoError::ShapeMismatch("sparse solve"));
        }
        let dense = self.to_dense();
        if self.nrows == self.ncols {
            dense
                .lu()
                .solve(b)
                .ok_or(MorphoError::SingularSystem("sparse solve"))
        } else {
            dense
                .svd(true, true)
                .solve(b, crate::EPS)
                .map_err(|_| MorphoError::SingularSystem("sparse solve"))
        }
    }

    /// Expand into a dense matrix.
    pub fn to_dense(&self) -> na::DMatrix<f64> {
        let mut out = na::DMatrix::zeros(self.nrows, self.ncols);
        for (r, c, v) in self.iter() {
            out[(r, c)] = v;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sample() -> Sparse {
        let mut s = Sparse::new(3, 3);
        // deliberately out of order to exercise the CCS sort
        s.set(2, 1, 3.0);
        s.set(0, 0, 1.0);
        s.set(1, 2, 5.0);
        s.set(0, 1, 2.0);
        s
    }

    /// DOK iteration preserves insertion order while the compressed
    /// columns come out sorted.
    #[test]
    fn dok_order_and_ccs_sort() {
        let s = sample();
        let order: Vec<(usize, usize)> = s.iter().map(|(r, c, _)| (r, c)).collect();
        assert_eq!(order, vec![(2, 1), (0, 0), (1, 2), (0, 1)]);

        assert_eq!(s.rows_in_col(0), &[0]);
        assert_eq!(s.rows_in_col(1), &[0, 2]);
        assert_eq!(s.rows_in_col(2), &[1]);
        assert_eq!(s.cols_in_row(0), vec![0, 1]);
    }

    #[test]
    fn edits_invalidate_ccs() {
        let mut s = sample();
        assert_eq!(s.rows_in_col(1), &[0, 2]);
        s.set(1, 1, 4.0);
        assert_eq!(s.rows_in_col(1), &[0, 1, 2]);
        assert_eq!(s.get(1, 1), 4.0);
    }

    #[test]
    fn transpose_add_mul() {
        let s = sample();
        let t = s.transpose();
        assert_eq!(t.get(1, 2), 3.0);
        assert_eq!(t.get(2, 1), 5.0);

        let sum = s.add(2.0, -1.0, &s).unwrap();
        assert_eq!(sum.get(2, 1), 3.0);
        assert_eq!(sum.get(0, 0), 1.0);

        // product against the identity reproduces the matrix
        let mut id = Sparse::new(3, 3);
        for i in 0..3 {
            id.set(i, i, 1.0);
        }
        let p = s.mul(&id).unwrap();
        for (r, c, v) in s.iter() {
            assert_eq!(p.get(r, c), v);
        }
    }

    #[test]
    fn dense_solve_roundtrip() {
        let mut s = Sparse::new(2, 2);
        s.set(0, 0, 2.0);
        s.set(0, 1, 1.0);
        s.set(1, 1, 3.0);
        let b = na::DMatrix::from_column_slice(2, 1, &[5.0, 9.0]);
        let x = s.solve(&b).unwrap();
        assert_abs_diff_eq!(x[(0, 0)], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[(1, 0)], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn singular_solve_reports() {
        let mut s = Sparse::new(2, 2);
        s.set(0, 0, 1.0);
        s.set(1, 0, 1.0);
        s.set(0, 1, 1.0);
        s.set(1, 1, 1.0);
        let b = na::DMatrix::from_column_slice(2, 1, &[1.0, 2.0]);
        assert!(matches!(
            s.solve(&b),
            Err(MorphoError::SingularSystem(_))
        ));
    }
}
