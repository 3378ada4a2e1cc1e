//! User-supplied integrands evaluated pointwise at vertices or by
//! quadrature over line and area elements, with optional field
//! interpolation.

use std::cell::RefCell;

use nalgebra as na;

use super::geometry::element_size;
use super::Functional;
use crate::{
    error::MorphoError, mesh::Mesh, problem::RebindMap, ElementId, FieldRef, Grade, EPS,
};

/// One evaluation point handed to a user integrand: the position, the
/// unit tangent (line integrals only), and the item values of each
/// attached field interpolated linearly to the point.
pub struct QuadPoint {
    pub position: na::DVector<f64>,
    pub tangent: Option<na::DVector<f64>>,
    pub fields: Vec<na::DVector<f64>>,
}

// Gauss-Legendre weights and abscissae on [-1, 1].
// Exact for polynomials up to degree 5.
const GL_3: [(f64, f64); 3] = [
    (0.8888888888888888, 0.0),
    (0.5555555555555556, -0.7745966692414834),
    (0.5555555555555556, 0.7745966692414834),
];

// Symmetric degree-5 rule on the triangle:
// (weight, barycentric coordinates), weights summing to one.
const TRI_5: [(f64, [f64; 3]); 7] = [
    (0.225, [1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0]),
    (
        0.1323941527885062,
        [0.0597158717897698, 0.4701420641051151, 0.4701420641051151],
    ),
    (
        0.1323941527885062,
        [0.4701420641051151, 0.0597158717897698, 0.4701420641051151],
    ),
    (
        0.1323941527885062,
        [0.4701420641051151, 0.4701420641051151, 0.0597158717897698],
    ),
    (
        0.1259391805448271,
        [0.7974269853530873, 0.1012865073234563, 0.1012865073234563],
    ),
    (
        0.1259391805448271,
        [0.1012865073234563, 0.7974269853530873, 0.1012865073234563],
    ),
    (
        0.1259391805448271,
        [0.1012865073234563, 0.1012865073234563, 0.7974269853530873],
    ),
];

/// Interpolate each attached field to barycentric weights over the
/// element's vertices.
fn interpolate_fields(
    fields: &[FieldRef],
    vids: &[usize],
    weights: &[f64],
) -> Vec<na::DVector<f64>> {
    fields
        .iter()
        .map(|f| {
            let f = f.borrow();
            let psize = f.prototype().size();
            let mut out = na::DVector::zeros(psize);
            for (&v, &w) in vids.iter().zip(weights) {
                for (o, x) in out.iter_mut().zip(f.item(0, v, 0)) {
                    *o += w * x;
                }
            }
            out
        })
        .collect()
}

fn position_at(mesh: &Mesh, vids: &[usize], weights: &[f64]) -> na::DVector<f64> {
    let mut out = na::DVector::zeros(mesh.dim());
    for (&v, &w) in vids.iter().zip(weights) {
        for k in 0..mesh.dim() {
            out[k] += w * mesh.vertex_coord(k, v);
        }
    }
    out
}

/// A potential evaluated at each vertex position, with an optional
/// user-supplied gradient.
pub struct ScalarPotential {
    potential: Box<dyn Fn(&[f64]) -> f64>,
    gradient: Option<Box<dyn Fn(&[f64]) -> Vec<f64>>>,
}

impl ScalarPotential {
    pub fn new(potential: impl Fn(&[f64]) -> f64 + 'static) -> Self {
        Self {
            potential: Box::new(potential),
            gradient: None,
        }
    }

    pub fn with_gradient(
        potential: impl Fn(&[f64]) -> f64 + 'static,
        gradient: impl Fn(&[f64]) -> Vec<f64> + 'static,
    ) -> Self {
        Self {
            potential: Box::new(potential),
            gradient: Some(Box::new(gradient)),
        }
    }
}

impl Functional for ScalarPotential {
    fn grade(&self) -> Grade {
        0
    }

    fn integrand(&self, mesh: &Mesh, id: ElementId, _vids: &[usize]) -> Result<f64, MorphoError> {
        let x: Vec<f64> = (0..mesh.dim()).map(|k| mesh.vertex_coord(k, id)).collect();
        let value = (self.potential)(&x);
        if !value.is_finite() {
            return Err(MorphoError::BadUserFunction);
        }
        Ok(value)
    }

    fn has_analytic_gradient(&self) -> bool {
        self.gradient.is_some()
    }

    fn accumulate_gradient(
        &self,
        mesh: &Mesh,
        id: ElementId,
        _vids: &[usize],
        frc: &mut na::DMatrix<f64>,
    ) -> Result<(), MorphoError> {
        let grad = self
            .gradient
            .as_ref()
            .ok_or(MorphoError::ShapeMismatch("scalar potential gradient"))?;
        let x: Vec<f64> = (0..mesh.dim()).map(|k| mesh.vertex_coord(k, id)).collect();
        let g = grad(&x);
        if g.len() != mesh.dim() || g.iter().any(|v| !v.is_finite()) {
            return Err(MorphoError::BadUserFunction);
        }
        for (k, v) in g.iter().enumerate() {
            frc[(k, id)] += v;
        }
        Ok(())
    }
}

/// Quadrature of a user integrand over line elements, scaled by
/// element length. The integrand sees the position, the unit tangent
/// of the current element and interpolated field values at each
/// evaluation point.
pub struct LineIntegral {
    integrand: Box<dyn Fn(&QuadPoint) -> f64>,
    fields: RefCell<Vec<FieldRef>>,
}

impl LineIntegral {
    pub fn new(integrand: impl Fn(&QuadPoint) -> f64 + 'static, fields: &[FieldRef]) -> Self {
        Self {
            integrand: Box::new(integrand),
            fields: RefCell::new(fields.to_vec()),
        }
    }
}

impl Functional for LineIntegral {
    fn grade(&self) -> Grade {
        1
    }

    fn integrand(&self, mesh: &Mesh, id: ElementId, vids: &[usize]) -> Result<f64, MorphoError> {
        let size = element_size(mesh, 1, id, vids)?;
        let fields = self.fields.borrow();

        let x0 = position_at(mesh, vids, &[1.0, 0.0]);
        let x1 = position_at(mesh, vids, &[0.0, 1.0]);
        let mut tangent = &x1 - &x0;
        let tnorm = tangent.norm();
        if tnorm > EPS {
            tangent /= tnorm;
        }

        let mut sum = 0.0;
        for (w, abscissa) in GL_3 {
            let t = 0.5 * (1.0 + abscissa);
            let weights = [1.0 - t, t];
            let point = QuadPoint {
                position: position_at(mesh, vids, &weights),
                tangent: Some(tangent.clone()),
                fields: interpolate_fields(&fields, vids, &weights),
            };
            let value = (self.integrand)(&point);
            if !value.is_finite() {
                return Err(MorphoError::BadUserFunction);
            }
            sum += 0.5 * w * value;
        }
        Ok(sum * size)
    }

    fn field(&self) -> Option<FieldRef> {
        self.fields.borrow().first().cloned()
    }

    fn rebind(&self, map: &RebindMap) {
        for handle in self.fields.borrow_mut().iter_mut() {
            if let Some(new) = map.field_for(handle) {
                *handle = new;
            }
        }
    }
}

/// Quadrature of a user integrand over triangle elements, scaled by
/// element area.
pub struct AreaIntegral {
    integrand: Box<dyn Fn(&QuadPoint) -> f64>,
    fields: RefCell<Vec<FieldRef>>,
}

impl AreaIntegral {
    pub fn new(integrand: impl Fn(&QuadPoint) -> f64 + 'static, fields: &[FieldRef]) -> Self {
        Self {
            integrand: Box::new(integrand),
            fields: RefCell::new(fields.to_vec()),
        }
    }
}

impl Functional for AreaIntegral {
    fn grade(&self) -> Grade {
        2
    }

    fn integrand(&self, mesh: &Mesh, id: ElementId, vids: &[usize]) -> Result<f64, MorphoError> {
        let size = element_size(mesh, 2, id, vids)?;
        let fields = self.fields.borrow();

        let mut sum = 0.0;
        for (w, bary) in TRI_5 {
            let point = QuadPoint {
                position: position_at(mesh, vids, &bary),
                tangent: None,
                fields: interpolate_fields(&fields, vids, &bary),
            };
            let value = (self.integrand)(&point);
            if !value.is_finite() {
                return Err(MorphoError::BadUserFunction);
            }
            sum += w * value;
        }
        Ok(sum * size)
    }

    fn field(&self) -> Option<FieldRef> {
        self.fields.borrow().first().cloned()
    }

    fn rebind(&self, map: &RebindMap) {
        for handle in self.fields.borrow_mut().iter_mut() {
            if let Some(new) = map.field_for(handle) {
                *handle = new;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Field;
    use crate::functional::{map_gradient, total};
    use crate::mesh::{three_vertex_line, unit_triangle, Mesh};
    use crate::shared;
    use approx::assert_abs_diff_eq;

    #[test]
    fn scalar_potential_total_and_gradients() {
        let mut mesh = unit_triangle();
        let pot = ScalarPotential::new(|x| x[0] * x[0] + x[1]);
        // vertices (0,0), (1,0), (0,1)
        assert_abs_diff_eq!(total(&pot, &mut mesh, None).unwrap(), 2.0, epsilon = 1e-12);

        let with_grad = ScalarPotential::with_gradient(
            |x| x[0] * x[0] + x[1],
            |x| vec![2.0 * x[0], 1.0, 0.0],
        );
        let analytic = map_gradient(&with_grad, &mut mesh, None).unwrap();
        let numeric = map_gradient(&pot, &mut mesh, None).unwrap();
        for k in 0..3 {
            for v in 0..3 {
                assert_abs_diff_eq!(analytic[(k, v)], numeric[(k, v)], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn line_integral_of_polynomial() {
        let vert =
            na::DMatrix::from_column_slice(3, 2, &[0.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
        let mut mesh = Mesh::new(vert);
        mesh.add_element(1, &[0, 1]).unwrap();

        let quad = LineIntegral::new(|p| p.position[0] * p.position[0], &[]);
        assert_abs_diff_eq!(
            total(&quad, &mut mesh, None).unwrap(),
            1.0 / 3.0,
            epsilon = 1e-12
        );
    }

    /// The tangent intrinsic is the unit direction of the current
    /// element.
    #[test]
    fn line_integral_sees_tangent() {
        let mut mesh = three_vertex_line();
        let arc = LineIntegral::new(|p| p.tangent.as_ref().unwrap()[0], &[]);
        assert_abs_diff_eq!(total(&arc, &mut mesh, None).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn line_integral_interpolates_fields() {
        let mesh = shared(three_vertex_line());
        let mut phi = Field::scalar(&mesh);
        for v in 0..3 {
            let x = mesh.borrow().vertex_coord(0, v);
            phi.set(0, v, 0, 0, 2.0 * x).unwrap();
        }
        let phi = shared(phi);
        let quad = LineIntegral::new(|p| p.fields[0][0], &[phi]);
        // integral of 2 x over [0, 1]
        assert_abs_diff_eq!(
            total(&quad, &mut mesh.borrow_mut(), None).unwrap(),
            1.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn area_integral_of_polynomials() {
        let mut mesh = unit_triangle();
        let linear = AreaIntegral::new(|p| p.position[0] + p.position[1], &[]);
        assert_abs_diff_eq!(
            total(&linear, &mut mesh, None).unwrap(),
            1.0 / 3.0,
            epsilon = 1e-12
        );
        let quadratic = AreaIntegral::new(|p| p.position[0] * p.position[0], &[]);
        assert_abs_diff_eq!(
            total(&quadratic, &mut mesh, None).unwrap(),
            1.0 / 12.0,
            epsilon = 1e-12
        );
    }
}
