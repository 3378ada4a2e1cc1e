//! Elastic energy against a reference configuration, and a
//! regularizer that evens out element sizes around each vertex.

use std::cell::{Cell, RefCell};

use nalgebra as na;

use super::geometry::element_size;
use super::{Functional, Symmetry};
use crate::{
    error::MorphoError, mesh::Mesh, problem::RebindMap, ElementId, Grade, MeshRef, EPS,
};

/// Gram matrix of the side vectors of a simplex,
/// `G[i][j] = <x_i+1 - x_0, x_j+1 - x_0>`.
fn gram(vert: &na::DMatrix<f64>, vids: &[usize]) -> na::DMatrix<f64> {
    let n = vids.len() - 1;
    let sides: Vec<na::DVector<f64>> = (1..=n)
        .map(|j| (vert.column(vids[j]) - vert.column(vids[0])).into_owned())
        .collect();
    let mut g = na::DMatrix::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            g[(i, j)] = sides[i].dot(&sides[j]);
        }
    }
    g
}

/// Linear elastic energy of the deformation from a reference mesh.
///
/// Per element, the Cauchy-Green strain is computed from the Gram
/// matrices of the reference and deformed side vectors,
/// `C = (G_def G_ref^-1 - I) / 2`, and the density
/// `mu tr(C^2) + lambda tr(C)^2 / 2` is weighted by the reference
/// element size. The Lame coefficients come from the Poisson ratio.
///
/// The reference must be a distinct mesh object with the same
/// connectivity as the mesh being evaluated, typically a clone taken
/// before optimization.
pub struct LinearElasticity {
    reference: RefCell<MeshRef>,
    grade: Grade,
    pub poisson: f64,
}

impl LinearElasticity {
    /// Elasticity against `reference`, acting on its top grade,
    /// with the conventional default Poisson ratio of 0.3.
    pub fn new(reference: &MeshRef) -> Self {
        let grade = reference.borrow().max_grade();
        Self {
            reference: RefCell::new(reference.clone()),
            grade,
            poisson: 0.3,
        }
    }

    pub fn with_poisson(reference: &MeshRef, poisson: f64) -> Self {
        let mut out = Self::new(reference);
        out.poisson = poisson;
        out
    }

    /// Lame coefficients `(mu, lambda)` for the current Poisson ratio.
    pub fn lame(&self) -> (f64, f64) {
        let nu = self.poisson;
        (0.5 / (1.0 + nu), nu / (1.0 + nu) / (1.0 - 2.0 * nu))
    }
}

impl Functional for LinearElasticity {
    fn grade(&self) -> Grade {
        self.grade
    }

    fn symmetry(&self) -> Symmetry {
        Symmetry::Add
    }

    fn integrand(&self, mesh: &Mesh, id: ElementId, vids: &[usize]) -> Result<f64, MorphoError> {
        let handle = self.reference.borrow();
        let refmesh = handle.borrow();
        let gdim = vids.len() - 1;

        let gram_ref = gram(refmesh.vertex_matrix(), vids);
        let gram_def = gram(mesh.vertex_matrix(), vids);

        let q = gram_ref
            .try_inverse()
            .ok_or(MorphoError::SingularSystem("elastic reference element"))?;
        let r = &gram_def * &q;

        // Cauchy-Green strain C = (R - I) / 2
        let mut cg = r * 0.5;
        for i in 0..gdim {
            cg[(i, i)] -= 0.5;
        }
        let trcg = cg.trace();
        let trcgcg = (&cg * &cg).trace();

        let weight = element_size(&refmesh, self.grade, id, vids)?;
        let (mu, lambda) = self.lame();
        Ok(weight * (mu * trcgcg + 0.5 * lambda * trcg * trcg))
    }

    fn rebind(&self, map: &RebindMap) {
        let old = self.reference.borrow().clone();
        if let Some(new) = map.mesh_for(&old) {
            *self.reference.borrow_mut() = new;
        }
    }
}

/// Vertex-centered penalty on the variance of incident element sizes,
/// optionally weighted per element. Used to keep meshes well
/// conditioned during shape optimization.
pub struct EquiElement {
    /// Grade of the elements whose sizes are compared;
    /// `None` means the mesh's top grade, resolved at evaluation.
    pub element_grade: Option<Grade>,
    /// Optional per-element weights.
    pub weight: Option<Vec<f64>>,
    resolved: Cell<Grade>,
    weight_mean: Cell<f64>,
}

impl EquiElement {
    pub fn new() -> Self {
        Self {
            element_grade: None,
            weight: None,
            resolved: Cell::new(0),
            weight_mean: Cell::new(0.0),
        }
    }
}

impl Default for EquiElement {
    fn default() -> Self {
        Self::new()
    }
}

impl Functional for EquiElement {
    fn grade(&self) -> Grade {
        0
    }

    fn symmetry(&self) -> Symmetry {
        Symmetry::Add
    }

    fn prepare(&self, mesh: &mut Mesh) -> Result<(), MorphoError> {
        let g = match self.element_grade {
            Some(g) if g >= 1 && g <= mesh.max_grade() => g,
            _ => mesh.max_grade(),
        };
        self.resolved.set(g);
        mesh.connectivity(0, g)?;
        mesh.connectivity(g, 0)?;
        if let Some(w) = &self.weight {
            self.weight_mean
                .set(w.iter().sum::<f64>() / w.len() as f64);
        }
        Ok(())
    }

    fn integrand(&self, mesh: &Mesh, id: ElementId, _vids: &[usize]) -> Result<f64, MorphoError> {
        let g = self.resolved.get();
        let conn = mesh.find_neighbors(0, id, g)?;
        if conn.len() <= 1 {
            return Ok(0.0);
        }

        let mut sizes = Vec::with_capacity(conn.len());
        for &el in &conn {
            let vids = mesh.element_vertices(g, el)?;
            sizes.push(element_size(mesh, g, el, vids)?);
        }
        let mean = sizes.iter().sum::<f64>() / sizes.len() as f64;
        if mean.abs() < EPS {
            return Err(MorphoError::DegenerateElement { grade: 0, id });
        }

        let total = match &self.weight {
            Some(w) if self.weight_mean.get().abs() >= EPS => {
                let weights: Vec<f64> =
                    conn.iter().map(|&el| w.get(el).copied().unwrap_or(1.0)).collect();
                let mut wmean = weights.iter().sum::<f64>() / weights.len() as f64;
                if wmean.abs() < EPS {
                    wmean = 1.0;
                }
                sizes
                    .iter()
                    .zip(&weights)
                    .map(|(s, w)| {
                        let term = 1.0 - w * s / mean / wmean;
                        term * term
                    })
                    .sum()
            }
            _ => sizes
                .iter()
                .map(|s| {
                    let term = 1.0 - s / mean;
                    term * term
                })
                .sum(),
        };
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functional::{map_gradient, map_integrand, total};
    use crate::mesh::{three_vertex_line, unit_triangle};
    use crate::shared;
    use approx::assert_abs_diff_eq;

    /// Elastic energy vanishes when the mesh coincides with its
    /// reference, to machine precision.
    #[test]
    fn zero_strain_at_reference() {
        let mesh = shared(unit_triangle());
        let reference = shared(mesh.borrow().clone());
        let elastic = LinearElasticity::new(&reference);
        let t = total(&elastic, &mut mesh.borrow_mut(), None).unwrap();
        assert_abs_diff_eq!(t, 0.0, epsilon = 1e-15);
    }

    /// Uniaxial stretch of the unit triangle against the closed-form
    /// strain energy.
    #[test]
    fn uniaxial_stretch() {
        let mesh = shared(unit_triangle());
        let reference = shared(mesh.borrow().clone());
        let a = 1.1;
        {
            let mut m = mesh.borrow_mut();
            for v in 0..3 {
                let x = m.vertex_coord(0, v);
                m.set_vertex_coord(0, v, a * x);
            }
        }
        let elastic = LinearElasticity::new(&reference);
        let (mu, lambda) = elastic.lame();
        // G_ref = I, G_def = diag(a^2, 1): C = diag((a^2 - 1)/2, 0)
        let c = (a * a - 1.0) / 2.0;
        let expected = 0.5 * c * c * (mu + 0.5 * lambda);
        let t = total(&elastic, &mut mesh.borrow_mut(), None).unwrap();
        assert_abs_diff_eq!(t, expected, epsilon = 1e-12);

        // stretching must pull the mesh back toward the reference
        let frc = map_gradient(&elastic, &mut mesh.borrow_mut(), None).unwrap();
        assert!(frc[(0, 1)] > 0.0);
    }

    /// The equi-element penalty measures the spread of incident edge
    /// lengths and vanishes at the balanced configuration.
    #[test]
    fn equielement_on_uneven_chain() {
        let mut mesh = three_vertex_line();
        let equi = EquiElement::new();
        let values = map_integrand(&equi, &mut mesh, None).unwrap();
        // endpoints have a single neighbor and contribute nothing
        assert_abs_diff_eq!(values[(0, 0)], 0.0);
        assert_abs_diff_eq!(values[(0, 2)], 0.0);
        // middle vertex: sizes 0.3 and 0.7 against mean 0.5
        assert_abs_diff_eq!(values[(0, 1)], 0.32, epsilon = 1e-12);

        mesh.set_vertex_coord(0, 1, 0.5);
        assert_abs_diff_eq!(total(&equi, &mut mesh, None).unwrap(), 0.0, epsilon = 1e-20);

        // unit weights reproduce the unweighted energy
        mesh.set_vertex_coord(0, 1, 0.3);
        let mut weighted = EquiElement::new();
        weighted.weight = Some(vec![1.0, 1.0]);
        assert_abs_diff_eq!(
            total(&weighted, &mut mesh, None).unwrap(),
            0.32,
            epsilon = 1e-12
        );
    }
}
