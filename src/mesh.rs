//! The simplicial mesh: a vertex position table plus graded element
//! connectivity, with derived connectivities cached on demand.

mod selection;
pub use selection::Selection;

use nalgebra as na;

use itertools::Itertools;

use crate::{error::MorphoError, sparse::Sparse, ElementId, Grade};

/// Highest grade of element a mesh can carry (grade 3 = volumes).
pub const MAX_GRADE: Grade = 3;
const GRADES: usize = MAX_GRADE + 1;

/// A mesh of simplices graded 0 (vertices) through 3 (tetrahedra).
///
/// Vertex positions are stored as a dense `dim x nvertices` matrix whose
/// columns are vertices. Per grade `g`, the incidence matrix `C(0, g)`
/// has one column per element and a unit entry for each incident vertex;
/// these primary connectivities are supplied through [`Mesh::add_element`]
/// or [`Mesh::add_grade`]. Every other connectivity `C(g1, g2)` is
/// derived lazily by [`Mesh::connectivity`] and cached until the next
/// structural change.
///
/// The diagonal matrices `C(g, g)` are reserved for symmetry
/// identifications: an entry `(i, j)` marks element `j` as the *image*
/// of element `i`. Images are skipped during integration and receive
/// combined force contributions during gradient assembly.
#[derive(Clone, Debug)]
pub struct Mesh {
    dim: usize,
    vert: na::DMatrix<f64>,
    conn: [[Option<Sparse>; GRADES]; GRADES],
}

impl Mesh {
    /// Create a mesh from a `dim x nvertices` position matrix.
    pub fn new(vert: na::DMatrix<f64>) -> Self {
        Self {
            dim: vert.nrows(),
            vert,
            conn: std::array::from_fn(|_| std::array::from_fn(|_| None)),
        }
    }

    /// The embedding dimension (number of coordinates per vertex).
    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vert.ncols()
    }

    /// The vertex position matrix, columns are vertices.
    #[inline]
    pub fn vertex_matrix(&self) -> &na::DMatrix<f64> {
        &self.vert
    }

    /// Mutable access to vertex positions. Moving vertices does not
    /// invalidate connectivity caches; only structural edits do.
    #[inline]
    pub fn vertex_matrix_mut(&mut self) -> &mut na::DMatrix<f64> {
        &mut self.vert
    }

    /// A view of one vertex position.
    #[inline]
    pub fn vertex(&self, id: ElementId) -> na::DVectorView<'_, f64> {
        self.vert.column(id)
    }

    /// A vertex position zero-padded into three components,
    /// for cross products and other 3-vector geometry.
    pub fn vertex3(&self, id: ElementId) -> na::Vector3<f64> {
        let mut out = na::Vector3::zeros();
        for k in 0..self.dim.min(3) {
            out[k] = self.vert[(k, id)];
        }
        out
    }

    #[inline]
    pub fn vertex_coord(&self, k: usize, id: ElementId) -> f64 {
        self.vert[(k, id)]
    }

    #[inline]
    pub fn set_vertex_coord(&mut self, k: usize, id: ElementId, value: f64) {
        self.vert[(k, id)] = value;
    }

    /// The number of elements of a grade.
    pub fn count(&self, g: Grade) -> usize {
        if g == 0 {
            self.vert.ncols()
        } else {
            self.conn[0]
                .get(g)
                .and_then(|c| c.as_ref())
                .map_or(0, |c| c.ncols())
        }
    }

    /// The highest grade with elements present.
    pub fn max_grade(&self) -> Grade {
        (1..GRADES)
            .rev()
            .find(|&g| self.conn[0][g].is_some())
            .unwrap_or(0)
    }

    /// Append one element of grade `g`, given its vertex ids.
    /// Returns the new element's id.
    pub fn add_element(&mut self, g: Grade, vids: &[usize]) -> Result<ElementId, MorphoError> {
        if g == 0 || g > MAX_GRADE || vids.len() != g + 1 {
            return Err(MorphoError::ShapeMismatch("add_element"));
        }
        let nv = self.vert.ncols();
        let conn = self.conn[0][g].get_or_insert_with(|| Sparse::new(nv, 0));
        let id = conn.ncols();
        for &v in vids {
            conn.set(v, id, 1.0);
        }
        self.invalidate_derived();
        Ok(id)
    }

    /// Install the full incidence matrix `C(0, g)` for a grade.
    /// Each column must carry exactly `g + 1` incident vertices.
    pub fn add_grade(&mut self, g: Grade, conn: Sparse) -> Result<(), MorphoError> {
        if g == 0 || g > MAX_GRADE {
            return Err(MorphoError::ShapeMismatch("add_grade"));
        }
        for col in 0..conn.ncols() {
            if conn.rows_in_col(col).len() != g + 1 {
                return Err(MorphoError::ShapeMismatch("add_grade"));
            }
        }
        self.conn[0][g] = Some(conn);
        self.invalidate_derived();
        Ok(())
    }

    /// Derive the elements of grade `g` from the lowest higher grade
    /// present, taking every `g + 1`-subset of each element's vertices.
    /// This is how a mesh with only faces acquires its edges.
    pub fn derive_grade(&mut self, g: Grade) -> Result<(), MorphoError> {
        if self.conn[0][g].is_some() {
            return Ok(());
        }
        let h = (g + 1..GRADES)
            .find(|&h| self.conn[0][h].is_some())
            .ok_or(MorphoError::MissingGrade(g))?;

        let upper = self.conn[0][h].as_ref().unwrap();
        let mut subsets: Vec<Vec<usize>> = Vec::new();
        for el in 0..upper.ncols() {
            // rows_in_col is sorted, so each subset comes out sorted too
            for sub in upper.rows_in_col(el).iter().copied().combinations(g + 1) {
                subsets.push(sub);
            }
        }
        subsets.sort_unstable();
        subsets.dedup();

        let mut conn = Sparse::new(self.vert.ncols(), subsets.len());
        for (id, sub) in subsets.iter().enumerate() {
            for &v in sub {
                conn.set(v, id, 1.0);
            }
        }
        self.conn[0][g] = Some(conn);
        self.invalidate_derived();
        Ok(())
    }

    /// The connectivity matrix `C(g1, g2)`: columns are elements of grade
    /// `g2`, rows elements of grade `g1`. Derived entries are computed
    /// from the primary incidence matrices and cached.
    pub fn connectivity(&mut self, g1: Grade, g2: Grade) -> Result<&Sparse, MorphoError> {
        if g1 > MAX_GRADE || g2 > MAX_GRADE {
            return Err(MorphoError::MissingGrade(g1.max(g2)));
        }
        if self.conn[g1][g2].is_none() {
            let derived = self.derive_connectivity(g1, g2)?;
            self.conn[g1][g2] = Some(derived);
        }
        Ok(self.conn[g1][g2].as_ref().unwrap())
    }

    fn derive_connectivity(&mut self, g1: Grade, g2: Grade) -> Result<Sparse, MorphoError> {
        match (g1, g2) {
            // primary incidences and symmetry identifications
            // are installed, never derived
            (0, g) => Err(MorphoError::MissingGrade(g)),
            (g, g2) if g == g2 => Err(MorphoError::MissingGrade(g)),
            (g, 0) => {
                let c = self.connectivity(0, g)?;
                Ok(c.transpose())
            }
            (g1, g2) => {
                // elements are related when they share at least one vertex
                let down = self.connectivity(g1, 0)?.clone();
                let up = self.connectivity(0, g2)?.clone();
                down.mul(&up)
            }
        }
    }

    /// Look up a connectivity without deriving it. Callers that run with
    /// a shared mesh borrow (integrands) rely on a prior prepare step
    /// having derived what they need.
    #[inline]
    pub fn connectivity_cached(&self, g1: Grade, g2: Grade) -> Option<&Sparse> {
        self.conn.get(g1)?.get(g2)?.as_ref()
    }

    /// Drop every derived connectivity, keeping the primary incidence
    /// matrices and the symmetry identifications.
    pub fn reset_connectivity(&mut self) {
        self.invalidate_derived();
    }

    fn invalidate_derived(&mut self) {
        for g1 in 0..GRADES {
            for g2 in 0..GRADES {
                if g1 != g2 && g1 != 0 {
                    self.conn[g1][g2] = None;
                }
            }
        }
    }

    /// The vertices of one element, sorted ascending.
    pub fn element_vertices(&self, g: Grade, id: ElementId) -> Result<&[usize], MorphoError> {
        let conn = self.conn[0]
            .get(g)
            .and_then(|c| c.as_ref())
            .ok_or(MorphoError::MissingGrade(g))?;
        Ok(conn.rows_in_col(id))
    }

    /// Elements of grade `gr` incident on element `id` of grade `g`
    /// (sharing at least one vertex), ascending, excluding the element
    /// itself when the grades coincide.
    ///
    /// Requires `C(gr, 0)` to be present; derive it through
    /// [`Mesh::connectivity`] first.
    pub fn find_neighbors(
        &self,
        g: Grade,
        id: ElementId,
        gr: Grade,
    ) -> Result<Vec<ElementId>, MorphoError> {
        let vids: Vec<usize> = if g == 0 {
            vec![id]
        } else {
            self.element_vertices(g, id)?.to_vec()
        };
        let down = self
            .connectivity_cached(gr, 0)
            .ok_or(MorphoError::MissingGrade(gr))?;
        let mut out: Vec<ElementId> = vids
            .iter()
            .flat_map(|&v| down.rows_in_col(v).iter().copied())
            .collect();
        out.sort_unstable();
        out.dedup();
        if gr == g {
            out.retain(|&e| e != id);
        }
        Ok(out)
    }

    /// Record that element `image` of grade `g` is a symmetry image of
    /// element `target`: it is skipped during integration and shares
    /// accumulated forces with its target.
    pub fn add_identification(&mut self, g: Grade, target: ElementId, image: ElementId) {
        let n = self.count(g);
        let conn = self.conn[g][g].get_or_insert_with(|| Sparse::new(n, n));
        conn.set(target, image, 1.0);
    }

    /// The symmetry identification matrix for a grade, if any.
    #[inline]
    pub fn identifications(&self, g: Grade) -> Option<&Sparse> {
        self.conn[g][g].as_ref()
    }

    /// Elements identified with `id` under the grade's symmetry relation,
    /// in either direction, ascending.
    pub fn synonyms(&self, g: Grade, id: ElementId) -> Vec<ElementId> {
        let mut out = Vec::new();
        if let Some(conn) = self.identifications(g) {
            for (i, j, _) in conn.iter() {
                if i == id {
                    out.push(j);
                } else if j == id {
                    out.push(i);
                }
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }
}

//
// test fixtures
//

/// A single unit right triangle in the z = 0 plane.
/// Public for use in other modules' tests; not part of the API.
#[doc(hidden)]
pub fn unit_triangle() -> Mesh {
    let vert = na::DMatrix::from_column_slice(
        3,
        3,
        &[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
    );
    let mut mesh = Mesh::new(vert);
    mesh.add_element(2, &[0, 1, 2]).unwrap();
    mesh
}

/// The unit square split into two triangles along its diagonal.
#[doc(hidden)]
pub fn split_square() -> Mesh {
    let vert = na::DMatrix::from_column_slice(
        3,
        4,
        &[
            0.0, 0.0, 0.0, //
            1.0, 0.0, 0.0, //
            1.0, 1.0, 0.0, //
            0.0, 1.0, 0.0,
        ],
    );
    let mut mesh = Mesh::new(vert);
    mesh.add_element(2, &[0, 1, 2]).unwrap();
    mesh.add_element(2, &[0, 2, 3]).unwrap();
    mesh
}

/// A three-vertex open polyline along the x axis,
/// with the middle vertex off-center.
#[doc(hidden)]
pub fn three_vertex_line() -> Mesh {
    let vert = na::DMatrix::from_column_slice(
        3,
        3,
        &[0.0, 0.0, 0.0, 0.3, 0.0, 0.0, 1.0, 0.0, 0.0],
    );
    let mut mesh = Mesh::new(vert);
    mesh.add_element(1, &[0, 1]).unwrap();
    mesh.add_element(1, &[1, 2]).unwrap();
    mesh
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_grades() {
        let mesh = split_square();
        assert_eq!(mesh.dim(), 3);
        assert_eq!(mesh.count(0), 4);
        assert_eq!(mesh.count(2), 2);
        assert_eq!(mesh.count(1), 0);
        assert_eq!(mesh.max_grade(), 2);
    }

    /// Edges derived from faces come out deduplicated
    /// and in lexicographic order.
    #[test]
    fn derive_edges_from_faces() {
        let mut mesh = split_square();
        mesh.derive_grade(1).unwrap();
        assert_eq!(mesh.count(1), 5);

        let expected: [&[usize]; 5] = [&[0, 1], &[0, 2], &[0, 3], &[1, 2], &[2, 3]];
        for (id, verts) in expected.iter().enumerate() {
            assert_eq!(mesh.element_vertices(1, id).unwrap(), *verts);
        }
    }

    #[test]
    fn transpose_and_product_connectivities() {
        let mut mesh = split_square();
        mesh.derive_grade(1).unwrap();

        // C(2, 0): triangles incident on each vertex
        mesh.connectivity(2, 0).unwrap();
        assert_eq!(
            mesh.connectivity_cached(2, 0).unwrap().rows_in_col(0),
            &[0, 1]
        );
        assert_eq!(
            mesh.connectivity_cached(2, 0).unwrap().rows_in_col(1),
            &[0]
        );

        // triangles sharing a vertex with each edge
        mesh.connectivity(2, 1).unwrap();
        let c21 = mesh.connectivity_cached(2, 1).unwrap();
        // edge 0 = {0, 1}: vertex 0 touches both triangles
        assert_eq!(c21.rows_in_col(0), &[0, 1]);
    }

    #[test]
    fn neighbors() {
        let mut mesh = split_square();
        mesh.derive_grade(1).unwrap();
        mesh.connectivity(2, 0).unwrap();
        mesh.connectivity(1, 0).unwrap();

        // triangles around vertex 1
        assert_eq!(mesh.find_neighbors(0, 1, 2).unwrap(), vec![0]);
        // triangles around vertex 0
        assert_eq!(mesh.find_neighbors(0, 0, 2).unwrap(), vec![0, 1]);
        // edges sharing a vertex with the diagonal {0, 2}
        assert_eq!(mesh.find_neighbors(1, 1, 1).unwrap(), vec![0, 2, 3, 4]);
    }

    #[test]
    fn missing_grade_reported() {
        let mut mesh = unit_triangle();
        assert!(matches!(
            mesh.connectivity(0, 3),
            Err(MorphoError::MissingGrade(3))
        ));
    }

    #[test]
    fn synonyms_follow_identifications() {
        let mut mesh = three_vertex_line();
        mesh.add_identification(0, 0, 2);
        assert_eq!(mesh.synonyms(0, 0), vec![2]);
        assert_eq!(mesh.synonyms(0, 2), vec![0]);
        assert!(mesh.synonyms(0, 1).is_empty());
    }

    /// Structural edits invalidate derived connectivities.
    #[test]
    fn caches_reset_on_change() {
        let mut mesh = split_square();
        mesh.derive_grade(1).unwrap();
        mesh.connectivity(1, 0).unwrap();
        assert!(mesh.connectivity_cached(1, 0).is_some());
        mesh.add_element(2, &[1, 2, 3]).unwrap();
        assert!(mesh.connectivity_cached(1, 0).is_none());
    }
}
