//! Subsets of mesh elements, one bitset per grade.

use fixedbitset as fb;

use super::{Mesh, GRADES, MAX_GRADE};
use crate::{error::MorphoError, ElementId, Grade};

/// A subset of elements per grade, used to restrict functionals,
/// constraints and refinement to part of a mesh.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selection {
    grades: [fb::FixedBitSet; GRADES],
}

impl Selection {
    /// An empty selection sized for the given mesh.
    pub fn new(mesh: &Mesh) -> Self {
        Self {
            grades: std::array::from_fn(|g| fb::FixedBitSet::with_capacity(mesh.count(g))),
        }
    }

    /// A selection containing every element of every grade present.
    pub fn all(mesh: &Mesh) -> Self {
        let mut sel = Self::new(mesh);
        for g in 0..GRADES {
            sel.grades[g].set_range(.., true);
        }
        sel
    }

    /// Select the boundary of the mesh: the elements of grade
    /// `max_grade - 1` incident on exactly one top-grade element,
    /// together with their vertices.
    pub fn boundary(mesh: &mut Mesh) -> Result<Self, MorphoError> {
        let top = mesh.max_grade();
        if top == 0 {
            return Err(MorphoError::MissingGrade(1));
        }
        let g = top - 1;
        if g > 0 {
            mesh.derive_grade(g)?;
        }
        mesh.connectivity(top, 0)?;

        let mut sel = Self::new(mesh);
        for el in 0..mesh.count(g) {
            let vids: Vec<usize> = if g == 0 {
                vec![el]
            } else {
                mesh.element_vertices(g, el)?.to_vec()
            };
            // a face is on the boundary when only one top-grade element
            // contains all of its vertices
            let cofaces = mesh
                .find_neighbors(g, el, top)?
                .into_iter()
                .filter(|&c| {
                    let cv = mesh.element_vertices(top, c).unwrap();
                    vids.iter().all(|v| cv.contains(v))
                })
                .count();
            if cofaces == 1 {
                sel.select(g, el);
                for v in vids {
                    sel.select(0, v);
                }
            }
        }
        Ok(sel)
    }

    #[inline]
    pub fn select(&mut self, g: Grade, id: ElementId) {
        let bits = &mut self.grades[g];
        if id >= bits.len() {
            bits.grow(id + 1);
        }
        bits.insert(id);
    }

    #[inline]
    pub fn deselect(&mut self, g: Grade, id: ElementId) {
        if id < self.grades[g].len() {
            self.grades[g].set(id, false);
        }
    }

    #[inline]
    pub fn is_selected(&self, g: Grade, id: ElementId) -> bool {
        g <= MAX_GRADE && self.grades[g].contains(id)
    }

    /// The selected element ids of a grade, ascending.
    pub fn id_list(&self, g: Grade) -> Vec<ElementId> {
        self.grades[g].ones().collect()
    }

    /// Number of selected elements of a grade.
    #[inline]
    pub fn count(&self, g: Grade) -> usize {
        self.grades[g].count_ones(..)
    }

    /// Select elements of grade `g` from the current vertex selection.
    /// With `partials`, an element qualifies as soon as any of its
    /// vertices is selected; otherwise all of them must be.
    pub fn add_grade(
        &mut self,
        mesh: &mut Mesh,
        g: Grade,
        partials: bool,
    ) -> Result<(), MorphoError> {
        mesh.connectivity(0, g)?;
        for el in 0..mesh.count(g) {
            let vids = mesh.element_vertices(g, el)?;
            let hit = if partials {
                vids.iter().any(|&v| self.is_selected(0, v))
            } else {
                vids.iter().all(|&v| self.is_selected(0, v))
            };
            if hit {
                self.select(g, el);
            }
        }
        Ok(())
    }

    /// Clear the selection at one grade.
    pub fn remove_grade(&mut self, g: Grade) {
        self.grades[g].clear();
    }

    pub fn union(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for g in 0..GRADES {
            out.grades[g].grow(other.grades[g].len());
            out.grades[g].union_with(&other.grades[g]);
        }
        out
    }

    pub fn intersection(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for g in 0..GRADES {
            out.grades[g].grow(other.grades[g].len());
            out.grades[g].intersect_with(&other.grades[g]);
        }
        out
    }

    /// Elements in `self` but not in `other`.
    pub fn difference(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for g in 0..GRADES {
            out.grades[g].grow(other.grades[g].len());
            out.grades[g].difference_with(&other.grades[g]);
        }
        out
    }

    /// Elements of the mesh not in this selection.
    pub fn complement(&self, mesh: &Mesh) -> Self {
        let mut out = Self::all(mesh);
        for g in 0..GRADES {
            out.grades[g].grow(self.grades[g].len());
            out.grades[g].difference_with(&self.grades[g]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{split_square, three_vertex_line};

    #[test]
    fn membership_and_algebra() {
        let mesh = split_square();
        let mut a = Selection::new(&mesh);
        a.select(0, 0);
        a.select(0, 1);
        let mut b = Selection::new(&mesh);
        b.select(0, 1);
        b.select(0, 2);

        assert_eq!(a.union(&b).id_list(0), vec![0, 1, 2]);
        assert_eq!(a.intersection(&b).id_list(0), vec![1]);
        assert_eq!(a.difference(&b).id_list(0), vec![0]);

        let comp = a.complement(&mesh);
        for v in 0..mesh.count(0) {
            assert!(a.is_selected(0, v) ^ comp.is_selected(0, v));
        }
    }

    #[test]
    fn add_grade_full_and_partial() {
        let mut mesh = split_square();
        let mut sel = Selection::new(&mesh);
        sel.select(0, 0);
        sel.select(0, 1);
        sel.select(0, 2);

        let mut full = sel.clone();
        full.add_grade(&mut mesh, 2, false).unwrap();
        assert_eq!(full.id_list(2), vec![0]);

        let mut partial = sel;
        partial.add_grade(&mut mesh, 2, true).unwrap();
        assert_eq!(partial.id_list(2), vec![0, 1]);

        partial.remove_grade(2);
        assert_eq!(partial.count(2), 0);
    }

    /// Boundary of the split square is its four outer edges,
    /// and of an open polyline its two end vertices.
    #[test]
    fn boundary_selection() {
        let mut mesh = split_square();
        let sel = Selection::boundary(&mut mesh).unwrap();
        // edges in lexicographic order: the diagonal {0, 2} is edge 1
        assert_eq!(sel.id_list(1), vec![0, 2, 3, 4]);
        assert_eq!(sel.id_list(0), vec![0, 1, 2, 3]);

        let mut line = three_vertex_line();
        let ends = Selection::boundary(&mut line).unwrap();
        assert_eq!(ends.id_list(0), vec![0, 2]);
    }
}
