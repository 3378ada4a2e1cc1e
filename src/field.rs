//! Fields: numerical data attached to mesh elements,
//! addressed by (grade, element, item, component).

use nalgebra as na;

use crate::{error::MorphoError, ElementId, Grade, MeshRef};

const GRADES: usize = crate::mesh::MAX_GRADE + 1;

/// The shape of one field item: a scalar or a fixed-size matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldPrototype {
    pub rows: usize,
    pub cols: usize,
}

impl FieldPrototype {
    pub const SCALAR: Self = Self { rows: 1, cols: 1 };

    /// A column-vector item with `n` components.
    pub fn vector(n: usize) -> Self {
        Self { rows: n, cols: 1 }
    }

    /// Components per item.
    #[inline]
    pub fn size(&self) -> usize {
        self.rows * self.cols
    }
}

/// Per-element data over a mesh.
///
/// A field declares, per grade, how many items each element carries
/// (`dof`), and a [`FieldPrototype`] describing each item. Storage is a
/// single dense vector; an offset table maps (grade, element, item,
/// component) to a linear index. Element counts are frozen at
/// construction, so a field stays consistent with the mesh it was built
/// from even if that mesh is later refined into a new object.
#[derive(Clone, Debug)]
pub struct Field {
    mesh: MeshRef,
    prototype: FieldPrototype,
    dof: [usize; GRADES],
    counts: [usize; GRADES],
    offset: [usize; GRADES + 1],
    data: na::DVector<f64>,
}

impl Field {
    /// Create a zero field with the given items per element of each grade.
    pub fn new(mesh: &MeshRef, prototype: FieldPrototype, dof: [usize; GRADES]) -> Self {
        let counts: [usize; GRADES] = {
            let m = mesh.borrow();
            std::array::from_fn(|g| m.count(g))
        };
        let mut offset = [0usize; GRADES + 1];
        for g in 0..GRADES {
            offset[g + 1] = offset[g] + counts[g] * dof[g] * prototype.size();
        }
        Self {
            mesh: mesh.clone(),
            prototype,
            dof,
            counts,
            offset,
            data: na::DVector::zeros(offset[GRADES]),
        }
    }

    /// A scalar field with one value per vertex.
    pub fn scalar(mesh: &MeshRef) -> Self {
        Self::new(mesh, FieldPrototype::SCALAR, [1, 0, 0, 0])
    }

    /// A vector field with one `n`-component value per vertex.
    pub fn vector(mesh: &MeshRef, n: usize) -> Self {
        Self::new(mesh, FieldPrototype::vector(n), [1, 0, 0, 0])
    }

    /// A field with the same layout as this one, all components zero.
    pub fn zero_like(&self) -> Self {
        let mut out = self.clone();
        out.data.fill(0.0);
        out
    }

    #[inline]
    pub fn mesh(&self) -> MeshRef {
        self.mesh.clone()
    }

    #[inline]
    pub fn prototype(&self) -> FieldPrototype {
        self.prototype
    }

    /// Items per element for each grade.
    #[inline]
    pub fn shape(&self) -> [usize; GRADES] {
        self.dof
    }

    #[inline]
    pub fn dof(&self, g: Grade) -> usize {
        self.dof[g]
    }

    #[inline]
    pub fn count(&self, g: Grade) -> usize {
        self.counts[g]
    }

    /// Total number of stored components.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    /// The flat storage vector.
    #[inline]
    pub fn data(&self) -> &na::DVector<f64> {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut na::DVector<f64> {
        &mut self.data
    }

    /// Linear access by storage index.
    #[inline]
    pub fn value(&self, i: usize) -> f64 {
        self.data[i]
    }

    #[inline]
    pub fn set_value(&mut self, i: usize, v: f64) {
        self.data[i] = v;
    }

    fn index_of(&self, g: Grade, el: ElementId, indx: usize, comp: usize) -> Option<usize> {
        if g >= GRADES || el >= self.counts[g] || indx >= self.dof[g] || comp >= self.prototype.size()
        {
            return None;
        }
        Some(self.offset[g] + (el * self.dof[g] + indx) * self.prototype.size() + comp)
    }

    /// One component of one item.
    pub fn get(&self, g: Grade, el: ElementId, indx: usize, comp: usize) -> Option<f64> {
        self.index_of(g, el, indx, comp).map(|i| self.data[i])
    }

    pub fn set(
        &mut self,
        g: Grade,
        el: ElementId,
        indx: usize,
        comp: usize,
        value: f64,
    ) -> Result<(), MorphoError> {
        let i = self
            .index_of(g, el, indx, comp)
            .ok_or(MorphoError::ShapeMismatch("field set"))?;
        self.data[i] = value;
        Ok(())
    }

    /// The storage range covering one grade.
    pub fn grade_range(&self, g: Grade) -> std::ops::Range<usize> {
        self.offset[g]..self.offset[g + 1]
    }

    /// The storage range covering all items of one element.
    pub fn element_range(&self, g: Grade, el: ElementId) -> std::ops::Range<usize> {
        let stride = self.dof[g] * self.prototype.size();
        let start = self.offset[g] + el * stride;
        start..start + stride
    }

    /// All components of one element as a slice.
    pub fn element(&self, g: Grade, el: ElementId) -> &[f64] {
        &self.data.as_slice()[self.element_range(g, el)]
    }

    pub fn element_mut(&mut self, g: Grade, el: ElementId) -> &mut [f64] {
        let range = self.element_range(g, el);
        &mut self.data.as_mut_slice()[range]
    }

    /// The components of one item of one element.
    pub fn item(&self, g: Grade, el: ElementId, indx: usize) -> &[f64] {
        let psize = self.prototype.size();
        let start = self.offset[g] + (el * self.dof[g] + indx) * psize;
        &self.data.as_slice()[start..start + psize]
    }

    /// Zero every component.
    pub fn zero(&mut self) {
        self.data.fill(0.0);
    }

    /// In-place `self <- self + lambda * other`.
    pub fn accumulate(&mut self, lambda: f64, other: &Field) -> Result<(), MorphoError> {
        if !self.same_shape(other) {
            return Err(MorphoError::ShapeMismatch("field accumulate"));
        }
        self.data.axpy(lambda, &other.data, 1.0);
        Ok(())
    }

    /// Scale every component.
    pub fn scale(&mut self, lambda: f64) {
        self.data *= lambda;
    }

    fn same_shape(&self, other: &Field) -> bool {
        self.dof == other.dof
            && self.counts == other.counts
            && self.prototype.size() == other.prototype.size()
    }

    /// Apply `f` to every item, co-indexed across `others`, collecting
    /// the results into a new field. The output length of `f` must be
    /// the same for every item; it determines the result's prototype.
    pub fn op(
        &self,
        others: &[&Field],
        mut f: impl FnMut(&[f64], &[&[f64]]) -> Vec<f64>,
    ) -> Result<Field, MorphoError> {
        for other in others {
            if !self.same_shape(other) {
                return Err(MorphoError::ShapeMismatch("field op"));
            }
        }
        let mut results: Vec<Vec<f64>> = Vec::new();
        let mut coargs: Vec<&[f64]> = Vec::with_capacity(others.len());
        for g in 0..GRADES {
            for el in 0..self.counts[g] {
                for indx in 0..self.dof[g] {
                    coargs.clear();
                    coargs.extend(others.iter().map(|o| o.item(g, el, indx)));
                    results.push(f(self.item(g, el, indx), &coargs));
                }
            }
        }
        let out_size = results.first().map_or(self.prototype.size(), Vec::len);
        if results.iter().any(|r| r.len() != out_size) {
            return Err(MorphoError::BadUserFunction);
        }

        let prototype = if out_size == self.prototype.size() {
            self.prototype
        } else {
            FieldPrototype::vector(out_size)
        };
        let mut out = Field::new(&self.mesh, prototype, self.dof);
        // the new field inherits this field's element counts, which may
        // predate structural changes to the shared mesh
        out.counts = self.counts;
        let mut offset = [0usize; GRADES + 1];
        for g in 0..GRADES {
            offset[g + 1] = offset[g] + out.counts[g] * out.dof[g] * prototype.size();
        }
        out.offset = offset;
        out.data = na::DVector::zeros(offset[GRADES]);
        for (chunk, item) in out.data.as_mut_slice().chunks_exact_mut(out_size).zip(&results) {
            chunk.copy_from_slice(item);
        }
        Ok(out)
    }
}

// arithmetic between whole fields; shapes must match (checked variants
// are `accumulate` and friends)

impl std::ops::Add for &Field {
    type Output = Field;

    fn add(self, rhs: &Field) -> Field {
        let mut out = self.clone();
        out.data += &rhs.data;
        out
    }
}

impl std::ops::Sub for &Field {
    type Output = Field;

    fn sub(self, rhs: &Field) -> Field {
        let mut out = self.clone();
        out.data -= &rhs.data;
        out
    }
}

impl std::ops::Mul<&Field> for f64 {
    type Output = Field;

    fn mul(self, rhs: &Field) -> Field {
        let mut out = rhs.clone();
        out.data *= self;
        out
    }
}
