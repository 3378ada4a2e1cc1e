//! Energies of fields defined on mesh vertices: Dirichlet-type
//! gradients, norms, and the Frank elastic energy of a nematic
//! director.

use std::cell::RefCell;

use nalgebra as na;

use super::geometry::element_size;
use super::{Functional, Symmetry};
use crate::{
    error::MorphoError, field::Field, mesh::Mesh, problem::RebindMap, ElementId, FieldRef, Grade,
    EPS,
};

/// `s1` projected perpendicular to `s2` and scaled by the inverse of
/// its squared length, so that `t . s1 = 1`.
fn perpendicular(s1: &na::Vector3<f64>, s2: &na::Vector3<f64>) -> Option<na::Vector3<f64>> {
    let s2s2 = s2.dot(s2);
    if s2s2.abs() < EPS {
        return None;
    }
    let mut out = s1 - (s1.dot(s2) / s2s2) * s2;
    let norm = out.norm();
    if norm < EPS {
        return None;
    }
    out /= norm * norm;
    Some(out)
}

/// The (constant) spatial gradient of a linearly interpolated field
/// over a triangle, written as `out[i * dim + k] = d f_i / d x_k`.
///
/// Expressed as a sum over the triangle's sides weighted by the
/// perpendiculars to the opposite sides.
pub(crate) fn field_gradient_on_triangle(
    mesh: &Mesh,
    field: &Field,
    id: ElementId,
    vids: &[usize],
    out: &mut [f64],
) -> Result<(), MorphoError> {
    let dim = mesh.dim();
    let x: [na::Vector3<f64>; 3] = std::array::from_fn(|i| mesh.vertex3(vids[i]));
    let s0 = x[1] - x[0];
    let s1 = x[2] - x[1];
    let s2 = x[0] - x[2];

    let degenerate = MorphoError::DegenerateElement { grade: 2, id };
    let t = [
        perpendicular(&s2, &s1).ok_or(degenerate.clone())?,
        perpendicular(&s0, &s2).ok_or(degenerate.clone())?,
        perpendicular(&s1, &s0).ok_or(degenerate)?,
    ];

    let f: [&[f64]; 3] = std::array::from_fn(|i| field.element(0, vids[i]));
    let nentries = f[0].len();
    if out.len() != nentries * dim {
        return Err(MorphoError::ShapeMismatch("field gradient"));
    }

    out.fill(0.0);
    for j in 0..3 {
        for i in 0..nentries {
            for k in 0..dim.min(3) {
                out[i * dim + k] += f[j][i] * t[j][k];
            }
        }
    }
    Ok(())
}

/// Integrate the product of two linear functions over a triangle,
/// given their values at the vertices, per unit area.
fn bcint(f: &[f64; 3], g: &[f64; 3]) -> f64 {
    (f[0] * (2.0 * g[0] + g[1] + g[2])
        + f[1] * (g[0] + 2.0 * g[1] + g[2])
        + f[2] * (g[0] + g[1] + 2.0 * g[2]))
        / 12.0
}

/// Integrate one linear function over a triangle, per unit area.
fn bcint1(f: &[f64; 3]) -> f64 {
    (f[0] + f[1] + f[2]) / 3.0
}

/// Dirichlet energy `|grad phi|^2` of a vertex field over triangles.
pub struct GradSq {
    field: RefCell<FieldRef>,
}

impl GradSq {
    pub fn new(field: &FieldRef) -> Self {
        Self {
            field: RefCell::new(field.clone()),
        }
    }
}

impl Functional for GradSq {
    fn grade(&self) -> Grade {
        2
    }

    fn symmetry(&self) -> Symmetry {
        Symmetry::Add
    }

    fn integrand(&self, mesh: &Mesh, id: ElementId, vids: &[usize]) -> Result<f64, MorphoError> {
        let size = element_size(mesh, 2, id, vids)?;
        let handle = self.field.borrow();
        let field = handle.borrow();
        let mut grad = vec![0.0; field.element(0, vids[0]).len() * mesh.dim()];
        field_gradient_on_triangle(mesh, &field, id, vids, &mut grad)?;
        Ok(grad.iter().map(|g| g * g).sum::<f64>() * size)
    }

    fn field(&self) -> Option<FieldRef> {
        Some(self.field.borrow().clone())
    }

    fn rebind(&self, map: &RebindMap) {
        let old = self.field.borrow().clone();
        if let Some(new) = map.field_for(&old) {
            *self.field.borrow_mut() = new;
        }
    }
}

/// Sum of squared norms of a vertex field's items.
pub struct NormSq {
    field: RefCell<FieldRef>,
}

impl NormSq {
    pub fn new(field: &FieldRef) -> Self {
        Self {
            field: RefCell::new(field.clone()),
        }
    }
}

impl Functional for NormSq {
    fn grade(&self) -> Grade {
        0
    }

    fn integrand(&self, _mesh: &Mesh, id: ElementId, _vids: &[usize]) -> Result<f64, MorphoError> {
        let handle = self.field.borrow();
        let field = handle.borrow();
        let entries = field.element(0, id);
        Ok(entries.iter().map(|e| e * e).sum())
    }

    fn field(&self) -> Option<FieldRef> {
        Some(self.field.borrow().clone())
    }

    fn rebind(&self, map: &RebindMap) {
        let old = self.field.borrow().clone();
        if let Some(new) = map.field_for(&old) {
            *self.field.borrow_mut() = new;
        }
    }
}

/// Frank elastic energy of a unit director field on triangles:
/// splay `(div n)^2`, twist `(n . curl n + q)^2` and bend
/// `|n x curl n|^2` contributions, each integrated with the director
/// interpolated linearly over the element.
pub struct Nematic {
    pub ksplay: f64,
    pub ktwist: f64,
    pub kbend: f64,
    /// Cholesteric pitch wavenumber; `None` for an achiral material.
    pub pitch: Option<f64>,
    field: RefCell<FieldRef>,
}

impl Nematic {
    pub fn new(director: &FieldRef) -> Self {
        Self {
            ksplay: 1.0,
            ktwist: 1.0,
            kbend: 1.0,
            pitch: None,
            field: RefCell::new(director.clone()),
        }
    }

    pub fn with_constants(director: &FieldRef, ksplay: f64, ktwist: f64, kbend: f64) -> Self {
        Self {
            ksplay,
            ktwist,
            kbend,
            pitch: None,
            field: RefCell::new(director.clone()),
        }
    }
}

impl Functional for Nematic {
    fn grade(&self) -> Grade {
        2
    }

    fn integrand(&self, mesh: &Mesh, id: ElementId, vids: &[usize]) -> Result<f64, MorphoError> {
        let size = element_size(mesh, 2, id, vids)?;
        let handle = self.field.borrow();
        let field = handle.borrow();
        let dim = mesh.dim();
        if dim != 3 || field.prototype().size() != 3 {
            return Err(MorphoError::ShapeMismatch("nematic director"));
        }

        // director components at the vertices, transposed so nnt[j]
        // holds component j across the three vertices
        let nn: [&[f64]; 3] = std::array::from_fn(|i| field.element(0, vids[i]));
        let nnt: [[f64; 3]; 3] = std::array::from_fn(|j| std::array::from_fn(|i| nn[i][j]));

        let mut gradnn = [0.0; 9];
        field_gradient_on_triangle(mesh, &field, id, vids, &mut gradnn)?;
        // gradnn holds the matrix        with indices
        //   [ nx,x ny,x nz,x ]           [ 0 3 6 ]
        //   [ nx,y ny,y nz,y ]           [ 1 4 7 ]
        //   [ nx,z ny,z nz,z ]           [ 2 5 8 ]
        let divnn = gradnn[0] + gradnn[4] + gradnn[8];
        let curlnn = [
            gradnn[7] - gradnn[5],
            gradnn[2] - gradnn[6],
            gradnn[3] - gradnn[1],
        ];

        // coefficients in front of the integrals of nx^2, ny^2, nz^2,
        // nx ny, ny nz, nz nx over the element
        let ctwst = [
            curlnn[0] * curlnn[0],
            curlnn[1] * curlnn[1],
            curlnn[2] * curlnn[2],
            2.0 * curlnn[0] * curlnn[1],
            2.0 * curlnn[1] * curlnn[2],
            2.0 * curlnn[2] * curlnn[0],
        ];
        let cbnd = [
            ctwst[1] + ctwst[2],
            ctwst[0] + ctwst[2],
            ctwst[0] + ctwst[1],
            -ctwst[3],
            -ctwst[4],
            -ctwst[5],
        ];
        let integrals = [
            bcint(&nnt[0], &nnt[0]),
            bcint(&nnt[1], &nnt[1]),
            bcint(&nnt[2], &nnt[2]),
            bcint(&nnt[0], &nnt[1]),
            bcint(&nnt[1], &nnt[2]),
            bcint(&nnt[2], &nnt[0]),
        ];

        let splay = 0.5 * self.ksplay * size * divnn * divnn;
        let mut twist = 0.0;
        let mut bend = 0.0;
        for i in 0..6 {
            twist += ctwst[i] * integrals[i];
            bend += cbnd[i] * integrals[i];
        }
        twist *= 0.5 * self.ktwist * size;
        bend *= 0.5 * self.kbend * size;

        let mut chol = 0.0;
        if let Some(q) = self.pitch {
            for i in 0..3 {
                chol += -2.0 * curlnn[i] * bcint1(&nnt[i]) * q;
            }
            chol += q * q;
            chol *= 0.5 * self.ktwist * size;
        }

        Ok(splay + twist + bend + chol)
    }

    fn field(&self) -> Option<FieldRef> {
        Some(self.field.borrow().clone())
    }

    fn rebind(&self, map: &RebindMap) {
        let old = self.field.borrow().clone();
        if let Some(new) = map.field_for(&old) {
            *self.field.borrow_mut() = new;
        }
    }
}

/// Dielectric coupling `(n . E)^2` of a director to the electric field
/// of a scalar potential, `E = grad phi`, constant per triangle.
pub struct NematicElectric {
    director: RefCell<FieldRef>,
    potential: RefCell<FieldRef>,
}

impl NematicElectric {
    pub fn new(director: &FieldRef, potential: &FieldRef) -> Self {
        Self {
            director: RefCell::new(director.clone()),
            potential: RefCell::new(potential.clone()),
        }
    }
}

impl Functional for NematicElectric {
    fn grade(&self) -> Grade {
        2
    }

    fn integrand(&self, mesh: &Mesh, id: ElementId, vids: &[usize]) -> Result<f64, MorphoError> {
        let size = element_size(mesh, 2, id, vids)?;
        let dhandle = self.director.borrow();
        let director = dhandle.borrow();
        let phandle = self.potential.borrow();
        let potential = phandle.borrow();
        if mesh.dim() != 3 || director.prototype().size() != 3 {
            return Err(MorphoError::ShapeMismatch("nematic director"));
        }

        let nn: [&[f64]; 3] = std::array::from_fn(|i| director.element(0, vids[i]));
        let nnt: [[f64; 3]; 3] = std::array::from_fn(|j| std::array::from_fn(|i| nn[i][j]));

        let mut ee = [0.0; 3];
        field_gradient_on_triangle(mesh, &potential, id, vids, &mut ee)?;

        let total = ee[0] * ee[0] * bcint(&nnt[0], &nnt[0])
            + ee[1] * ee[1] * bcint(&nnt[1], &nnt[1])
            + ee[2] * ee[2] * bcint(&nnt[2], &nnt[2])
            + 2.0 * ee[0] * ee[1] * bcint(&nnt[0], &nnt[1])
            + 2.0 * ee[1] * ee[2] * bcint(&nnt[1], &nnt[2])
            + 2.0 * ee[2] * ee[0] * bcint(&nnt[2], &nnt[0]);

        Ok(size * total)
    }

    fn field(&self) -> Option<FieldRef> {
        Some(self.director.borrow().clone())
    }

    fn rebind(&self, map: &RebindMap) {
        for handle in [&self.director, &self.potential] {
            let old = handle.borrow().clone();
            if let Some(new) = map.field_for(&old) {
                *handle.borrow_mut() = new;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functional::{map_field_gradient, map_gradient, map_integrand, total};
    use crate::mesh::unit_triangle;
    use crate::shared;
    use approx::assert_abs_diff_eq;

    fn equilateral_triangle() -> Mesh {
        let h = 3.0_f64.sqrt() / 2.0;
        let vert = na::DMatrix::from_column_slice(
            3,
            3,
            &[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.5, h, 0.0],
        );
        let mut mesh = Mesh::new(vert);
        mesh.add_element(2, &[0, 1, 2]).unwrap();
        mesh
    }

    fn hat_scalar(mesh: &crate::MeshRef) -> FieldRef {
        let mut phi = Field::scalar(mesh);
        phi.set(0, 1, 0, 0, 1.0).unwrap();
        shared(phi)
    }

    /// Dirichlet energy of a hat function on the equilateral and unit
    /// right triangles.
    #[test]
    fn gradsq_totals() {
        let mesh = shared(equilateral_triangle());
        let phi = hat_scalar(&mesh);
        let gradsq = GradSq::new(&phi);
        let t = total(&gradsq, &mut mesh.borrow_mut(), None).unwrap();
        assert_abs_diff_eq!(t, 1.0 / 3.0_f64.sqrt(), epsilon = 1e-12);

        let right = shared(unit_triangle());
        let phi = hat_scalar(&right);
        let gradsq = GradSq::new(&phi);
        let t = total(&gradsq, &mut right.borrow_mut(), None).unwrap();
        assert_abs_diff_eq!(t, 0.5, epsilon = 1e-12);
    }

    /// Position gradient of the Dirichlet energy on the equilateral
    /// triangle. With the hat at vertex 1 the energy is
    /// `E = |v2 - v0|^2 / (4 A)`, which differentiates to the values
    /// below; the energy is scale and translation invariant in the
    /// plane, so rows sum to zero and the radial derivative vanishes.
    #[test]
    fn gradsq_position_gradient() {
        let mesh = shared(equilateral_triangle());
        let phi = hat_scalar(&mesh);
        let gradsq = GradSq::new(&phi);
        let frc = map_gradient(&gradsq, &mut mesh.borrow_mut(), None).unwrap();

        let s = 1.0 / 3.0_f64.sqrt();
        #[rustfmt::skip]
        let expected = [
            [0.0, -s, s],
            [-2.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0],
            [0.0, 0.0, 0.0],
        ];
        for (k, row) in expected.iter().enumerate() {
            for (v, want) in row.iter().enumerate() {
                assert_abs_diff_eq!(frc[(k, v)], *want, epsilon = 1e-5);
            }
        }
    }

    /// Field gradient of the Dirichlet energy against the closed form
    /// on the unit right triangle.
    #[test]
    fn gradsq_field_gradient() {
        let mesh = shared(unit_triangle());
        let phi = hat_scalar(&mesh);
        let gradsq = GradSq::new(&phi);
        let grad = map_field_gradient(&gradsq, &mut mesh.borrow_mut(), &phi, None).unwrap();
        // E = ((phi1 - phi0)^2 + (phi2 - phi0)^2) / 2 on this triangle
        assert_abs_diff_eq!(grad.get(0, 0, 0, 0).unwrap(), -1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(grad.get(0, 1, 0, 0).unwrap(), 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(grad.get(0, 2, 0, 0).unwrap(), 0.0, epsilon = 1e-5);
    }

    #[test]
    fn normsq_total_and_field_gradient() {
        let mesh = shared(unit_triangle());
        let mut v = Field::vector(&mesh, 3);
        for i in 0..3 {
            v.set(0, i, 0, 0, i as f64).unwrap();
        }
        let v = shared(v);
        let normsq = NormSq::new(&v);
        let t = total(&normsq, &mut mesh.borrow_mut(), None).unwrap();
        assert_abs_diff_eq!(t, 5.0, epsilon = 1e-12);

        let grad = map_field_gradient(&normsq, &mut mesh.borrow_mut(), &v, None).unwrap();
        for i in 0..3 {
            assert_abs_diff_eq!(grad.get(0, i, 0, 0).unwrap(), 2.0 * i as f64, epsilon = 1e-4);
        }
    }

    /// A uniform director has no elastic energy; a cholesteric pitch
    /// contributes `ktwist q^2 size / 2` on top.
    #[test]
    fn nematic_uniform_director() {
        let mesh = shared(unit_triangle());
        let mut n = Field::vector(&mesh, 3);
        for i in 0..3 {
            n.set(0, i, 0, 0, 1.0).unwrap();
        }
        let n = shared(n);

        let achiral = Nematic::new(&n);
        let t = total(&achiral, &mut mesh.borrow_mut(), None).unwrap();
        assert_abs_diff_eq!(t, 0.0, epsilon = 1e-12);

        let mut chiral = Nematic::new(&n);
        chiral.pitch = Some(2.0);
        let t = total(&chiral, &mut mesh.borrow_mut(), None).unwrap();
        assert_abs_diff_eq!(t, 1.0, epsilon = 1e-12);
    }

    /// The dielectric energy of a uniform director in the field of a
    /// hat potential, with its position gradient.
    #[test]
    fn nematic_electric_coupling() {
        let mesh = shared(unit_triangle());
        let s = 1.0 / 2.0_f64.sqrt();
        let mut n = Field::vector(&mesh, 3);
        for i in 0..3 {
            n.set(0, i, 0, 0, s).unwrap();
            n.set(0, i, 0, 1, s).unwrap();
        }
        let n = shared(n);
        let phi = hat_scalar(&mesh);
        let coupling = NematicElectric::new(&n, &phi);

        let values = map_integrand(&coupling, &mut mesh.borrow_mut(), None).unwrap();
        assert_abs_diff_eq!(values[(0, 0)], 0.25, epsilon = 1e-12);
        let t = total(&coupling, &mut mesh.borrow_mut(), None).unwrap();
        assert_abs_diff_eq!(t, 0.25, epsilon = 1e-12);

        let frc = map_gradient(&coupling, &mut mesh.borrow_mut(), None).unwrap();
        #[rustfmt::skip]
        let expected = [
            [0.75, -0.25, -0.5],
            [-0.25, 0.0, 0.25],
            [0.0, 0.0, 0.0],
        ];
        for (k, row) in expected.iter().enumerate() {
            for (v, want) in row.iter().enumerate() {
                assert_abs_diff_eq!(frc[(k, v)], *want, epsilon = 1e-5);
            }
        }
    }
}
