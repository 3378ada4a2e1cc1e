//! The functional protocol and its evaluator.
//!
//! A functional maps mesh elements of one grade to scalars (the
//! *integrand*); the evaluator sums integrands over elements, assembles
//! gradients with respect to vertex positions, and differentiates with
//! respect to field components. Functionals describe themselves through
//! a small capability table (grade, symmetry behavior, whether an
//! analytic gradient exists, which vertices an element depends on
//! beyond its own) and the evaluator drives everything from that, so
//! adding a new energy is a matter of implementing [`Functional`].

pub mod curvature;
pub mod elasticity;
pub mod field_energy;
pub mod geometry;
pub mod integrals;

pub use curvature::{GaussCurvature, LineCurvatureSq, LineTorsionSq, MeanCurvatureSq};
pub use elasticity::{EquiElement, LinearElasticity};
pub use field_energy::{GradSq, Nematic, NematicElectric, NormSq};
pub use geometry::{Area, AreaEnclosed, Length, Volume, VolumeEnclosed};
pub use integrals::{AreaIntegral, LineIntegral, QuadPoint, ScalarPotential};

use nalgebra as na;

use crate::{
    error::MorphoError,
    field::Field,
    mesh::{Mesh, Selection},
    problem::RebindMap,
    ElementId, FieldRef, Grade,
};

/// Central-difference step for numerical gradients.
pub(crate) const GRAD_STEP: f64 = 1e-10;

/// How a functional's gradient interacts with the mesh's symmetry
/// identifications.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Symmetry {
    /// No special handling.
    #[default]
    None,
    /// After assembly, each identified vertex pair is given the sum of
    /// the two accumulated forces, so both see the same total.
    Add,
}

/// An energy density over mesh elements of a single grade.
///
/// Implementations provide the per-element integrand and, optionally,
/// an analytic gradient. Everything else (totals, selections, symmetry
/// handling, numerical differentiation) is supplied by the evaluator
/// functions in this module.
pub trait Functional {
    /// The grade of element this functional is evaluated on.
    fn grade(&self) -> Grade;

    /// Symmetry behavior applied after gradient assembly.
    fn symmetry(&self) -> Symmetry {
        Symmetry::None
    }

    /// Derive any connectivity the integrand will look up. Called by the
    /// evaluator before iteration, while the mesh is still exclusively
    /// borrowed.
    fn prepare(&self, _mesh: &mut Mesh) -> Result<(), MorphoError> {
        Ok(())
    }

    /// The integrand for one element, given its vertex ids.
    fn integrand(&self, mesh: &Mesh, id: ElementId, vids: &[usize])
        -> Result<f64, MorphoError>;

    /// Whether [`Functional::accumulate_gradient`] is implemented.
    /// When false, gradients are computed by central differences.
    fn has_analytic_gradient(&self) -> bool {
        false
    }

    /// Accumulate this element's position gradient into the force
    /// matrix (one column per vertex).
    fn accumulate_gradient(
        &self,
        _mesh: &Mesh,
        _id: ElementId,
        _vids: &[usize],
        _frc: &mut na::DMatrix<f64>,
    ) -> Result<(), MorphoError> {
        Err(MorphoError::ShapeMismatch("analytic gradient"))
    }

    /// Vertices beyond the element's own whose motion changes the
    /// integrand of `id` (curvature-like stencils).
    fn dependencies(
        &self,
        _mesh: &Mesh,
        _id: ElementId,
        _out: &mut Vec<ElementId>,
    ) -> Result<(), MorphoError> {
        Ok(())
    }

    /// The field this functional consumes, if any.
    fn field(&self) -> Option<FieldRef> {
        None
    }

    /// Exchange held mesh/field handles after refinement.
    fn rebind(&self, _map: &RebindMap) {}
}

//
// evaluator
//

/// Kahan compensated accumulator, so totals are deterministic up to a
/// rounding error independent of element count.
#[derive(Clone, Copy, Default)]
pub(crate) struct KahanSum {
    sum: f64,
    c: f64,
}

impl KahanSum {
    pub fn add(&mut self, x: f64) {
        let y = x - self.c;
        let t = self.sum + y;
        self.c = (t - self.sum) - y;
        self.sum = t;
    }

    #[inline]
    pub fn total(&self) -> f64 {
        self.sum
    }
}

/// Element iteration order with aligned vertex lists.
struct ElementList {
    ids: Vec<ElementId>,
    vids: Vec<Vec<usize>>,
    /// total elements of the grade, including skipped ones
    count: usize,
}

/// Ids of elements that are symmetry images of another element,
/// sorted ascending.
fn symmetry_images(mesh: &Mesh, g: Grade) -> Vec<ElementId> {
    let mut ids: Vec<ElementId> = mesh
        .identifications(g)
        .map(|conn| conn.iter().map(|(_, j, _)| j).collect())
        .unwrap_or_default();
    ids.sort_unstable();
    ids
}

/// Collect the elements a map operation will visit: the selection's ids
/// (or all), ascending, optionally with symmetry images skipped.
fn collect_elements(
    mesh: &mut Mesh,
    g: Grade,
    sel: Option<&Selection>,
    skip_images: bool,
) -> Result<ElementList, MorphoError> {
    if g > 0 {
        mesh.connectivity(0, g)?;
    }
    let count = mesh.count(g);
    let images = if skip_images {
        symmetry_images(mesh, g)
    } else {
        Vec::new()
    };

    let candidates: Vec<ElementId> = match sel {
        Some(sel) => sel.id_list(g),
        None => (0..count).collect(),
    };

    let mut ids = Vec::with_capacity(candidates.len());
    let mut vids = Vec::with_capacity(candidates.len());
    for id in candidates {
        if images.binary_search(&id).is_ok() {
            continue;
        }
        ids.push(id);
        vids.push(if g == 0 {
            vec![id]
        } else {
            mesh.element_vertices(g, id)?.to_vec()
        });
    }
    Ok(ElementList { ids, vids, count })
}

/// Evaluate the integrand for every element of the functional's grade,
/// as a one-row matrix. Unselected elements and symmetry images stay
/// zero.
pub fn map_integrand(
    f: &dyn Functional,
    mesh: &mut Mesh,
    sel: Option<&Selection>,
) -> Result<na::DMatrix<f64>, MorphoError> {
    f.prepare(mesh)?;
    let list = collect_elements(mesh, f.grade(), sel, true)?;
    let mut out = na::DMatrix::zeros(1, list.count);
    for (&id, vids) in list.ids.iter().zip(&list.vids) {
        out[(0, id)] = f.integrand(mesh, id, vids)?;
    }
    Ok(out)
}

/// Sum the integrand over elements with Kahan compensation.
pub fn total(
    f: &dyn Functional,
    mesh: &mut Mesh,
    sel: Option<&Selection>,
) -> Result<f64, MorphoError> {
    f.prepare(mesh)?;
    let list = collect_elements(mesh, f.grade(), sel, true)?;
    let mut sum = KahanSum::default();
    for (&id, vids) in list.ids.iter().zip(&list.vids) {
        sum.add(f.integrand(mesh, id, vids)?);
    }
    Ok(sum.total())
}

/// Assemble the gradient of the total with respect to vertex positions,
/// as a `dim x nvertices` matrix.
///
/// Analytic gradients are used where the functional provides them;
/// otherwise each incident vertex coordinate is perturbed by
/// [`GRAD_STEP`] in both directions and the differences centered, with
/// extra stencil vertices pulled in through
/// [`Functional::dependencies`].
pub fn map_gradient(
    f: &dyn Functional,
    mesh: &mut Mesh,
    sel: Option<&Selection>,
) -> Result<na::DMatrix<f64>, MorphoError> {
    f.prepare(mesh)?;
    let analytic = f.has_analytic_gradient();
    // numerical differentiation must not visit image elements twice;
    // analytic accumulation touches each element's own vertices only
    let list = collect_elements(mesh, f.grade(), sel, !analytic)?;
    let mut frc = na::DMatrix::zeros(mesh.dim(), mesh.vertex_count());

    if analytic {
        for (&id, vids) in list.ids.iter().zip(&list.vids) {
            f.accumulate_gradient(mesh, id, vids, &mut frc)?;
        }
    } else {
        let mut deps = Vec::new();
        for (&id, vids) in list.ids.iter().zip(&list.vids) {
            numerical_gradient(f, mesh, id, vids, &mut frc)?;
            deps.clear();
            f.dependencies(mesh, id, &mut deps)?;
            for &d in &deps {
                if vids.contains(&d) {
                    continue;
                }
                numerical_remote_gradient(f, mesh, d, id, vids, &mut frc)?;
            }
        }
    }

    if f.symmetry() == Symmetry::Add {
        symmetry_sum_forces(mesh, &mut frc);
    }
    Ok(frc)
}

/// Central differences on the element's own vertices.
fn numerical_gradient(
    f: &dyn Functional,
    mesh: &mut Mesh,
    id: ElementId,
    vids: &[usize],
    frc: &mut na::DMatrix<f64>,
) -> Result<(), MorphoError> {
    for &v in vids {
        for k in 0..mesh.dim() {
            let x0 = mesh.vertex_coord(k, v);
            mesh.set_vertex_coord(k, v, x0 + GRAD_STEP);
            let fp = f.integrand(mesh, id, vids);
            mesh.set_vertex_coord(k, v, x0 - GRAD_STEP);
            let fm = f.integrand(mesh, id, vids);
            // restore before propagating any integrand failure
            mesh.set_vertex_coord(k, v, x0);
            frc[(k, v)] += (fp? - fm?) / (2.0 * GRAD_STEP);
        }
    }
    Ok(())
}

/// Central differences on a stencil vertex outside the element:
/// perturb it and re-evaluate the integrand of element `id`.
fn numerical_remote_gradient(
    f: &dyn Functional,
    mesh: &mut Mesh,
    remote: ElementId,
    id: ElementId,
    vids: &[usize],
    frc: &mut na::DMatrix<f64>,
) -> Result<(), MorphoError> {
    for k in 0..mesh.dim() {
        let x0 = mesh.vertex_coord(k, remote);
        mesh.set_vertex_coord(k, remote, x0 + GRAD_STEP);
        let fp = f.integrand(mesh, id, vids);
        mesh.set_vertex_coord(k, remote, x0 - GRAD_STEP);
        let fm = f.integrand(mesh, id, vids);
        mesh.set_vertex_coord(k, remote, x0);
        frc[(k, remote)] += (fp? - fm?) / (2.0 * GRAD_STEP);
    }
    Ok(())
}

/// Give both members of each identified vertex pair the sum of their
/// accumulated forces.
fn symmetry_sum_forces(mesh: &Mesh, frc: &mut na::DMatrix<f64>) {
    let Some(conn) = mesh.identifications(0) else {
        return;
    };
    for (i, j, _) in conn.iter() {
        let fsum = frc.column(i) + frc.column(j);
        frc.set_column(i, &fsum);
        frc.set_column(j, &fsum);
    }
}

/// Differentiate the total with respect to the components of `field`
/// by central differences, producing a field of the same shape.
///
/// For each field entry, the affected elements of the functional's
/// grade are found through the connectivity between the two grades;
/// each is re-evaluated with the entry perturbed in both directions.
pub fn map_field_gradient(
    f: &dyn Functional,
    mesh: &mut Mesh,
    field: &FieldRef,
    sel: Option<&Selection>,
) -> Result<Field, MorphoError> {
    f.prepare(mesh)?;
    let grd = f.grade();
    if grd > 0 {
        mesh.connectivity(0, grd)?;
    }

    // vertex lists for every element of the functional's grade,
    // gathered up front so the perturbation loop holds no mesh borrows
    let nel = mesh.count(grd);
    let all_vids: Vec<Vec<usize>> = (0..nel)
        .map(|el| {
            if grd == 0 {
                Ok(vec![el])
            } else {
                Ok(mesh.element_vertices(grd, el)?.to_vec())
            }
        })
        .collect::<Result<_, MorphoError>>()?;

    let mut grad = field.borrow().zero_like();
    let shape = grad.shape();
    let psize = grad.prototype().size();

    for g in 0..shape.len() {
        if shape[g] == 0 || grad.count(g) == 0 {
            continue;
        }
        // elements whose integrand reads entries of grade g
        let entry_deps: Vec<Vec<ElementId>> = if grd == g {
            (0..grad.count(g)).map(|id| vec![id]).collect()
        } else {
            mesh.connectivity(grd, g)?;
            let rconn = mesh.connectivity_cached(grd, g).unwrap();
            (0..grad.count(g))
                .map(|id| rconn.rows_in_col(id).to_vec())
                .collect()
        };

        for id in 0..grad.count(g) {
            let base = grad.element_range(g, id).start;
            for &el in &entry_deps[id] {
                if let Some(sel) = sel {
                    if !sel.is_selected(grd, el) {
                        continue;
                    }
                }
                let vids = &all_vids[el];
                for j in 0..psize * shape[g] {
                    let k = base + j;
                    let fld = field.borrow().value(k);
                    field.borrow_mut().set_value(k, fld + GRAD_STEP);
                    let fr = f.integrand(mesh, el, vids);
                    field.borrow_mut().set_value(k, fld - GRAD_STEP);
                    let fl = f.integrand(mesh, el, vids);
                    field.borrow_mut().set_value(k, fld);
                    grad.data_mut()[k] += (fr? - fl?) / (2.0 * GRAD_STEP);
                }
            }
        }
    }
    Ok(grad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{split_square, three_vertex_line, unit_triangle};
    use approx::assert_abs_diff_eq;

    /// Totals agree between meshes listing the same elements
    /// in different orders.
    #[test]
    fn total_is_order_independent() {
        let mut forward = three_vertex_line();
        let mut backward = {
            let mut mesh = Mesh::new(forward.vertex_matrix().clone());
            mesh.add_element(1, &[1, 2]).unwrap();
            mesh.add_element(1, &[0, 1]).unwrap();
            mesh
        };
        let len = Length;
        let a = total(&len, &mut forward, None).unwrap();
        let b = total(&len, &mut backward, None).unwrap();
        assert_abs_diff_eq!(a, 1.0, epsilon = 1e-14);
        assert!((a - b).abs() <= 1e-12 * a.abs());
    }

    /// Symmetry images are skipped when summing but both members of an
    /// identified pair receive the combined force.
    #[test]
    fn symmetry_skip_and_add() {
        let mut mesh = three_vertex_line();
        let plain = total(&Length, &mut mesh, None).unwrap();

        // identify the two endpoints; the grade-0 relation affects
        // forces, a grade-1 relation would skip edges
        mesh.add_identification(0, 0, 2);
        assert_abs_diff_eq!(total(&Length, &mut mesh, None).unwrap(), plain);

        let frc = map_gradient(&Length, &mut mesh, None).unwrap();
        // identified pair carries identical columns after SYMMETRY_ADD
        for k in 0..mesh.dim() {
            assert_abs_diff_eq!(frc[(k, 0)], frc[(k, 2)], epsilon = 1e-14);
        }
        // and the shared value is the sum of the raw endpoint forces,
        // here -1 and +1 along x
        assert_abs_diff_eq!(frc[(0, 0)], 0.0, epsilon = 1e-14);
    }

    /// An image element is left out of integrand maps.
    #[test]
    fn image_elements_are_skipped() {
        let mut mesh = three_vertex_line();
        mesh.add_identification(1, 0, 1);
        let values = map_integrand(&Length, &mut mesh, None).unwrap();
        assert_abs_diff_eq!(values[(0, 0)], 0.3, epsilon = 1e-14);
        assert_abs_diff_eq!(values[(0, 1)], 0.0, epsilon = 1e-14);
        assert_abs_diff_eq!(total(&Length, &mut mesh, None).unwrap(), 0.3, epsilon = 1e-14);
    }

    /// Selections restrict every map operation.
    #[test]
    fn selection_restricts_maps() {
        let mut mesh = split_square();
        let mut sel = Selection::new(&mesh);
        sel.select(2, 1);
        let t = total(&Area, &mut mesh, Some(&sel)).unwrap();
        assert_abs_diff_eq!(t, 0.5, epsilon = 1e-12);

        let values = map_integrand(&Area, &mut mesh, Some(&sel)).unwrap();
        assert_eq!(values.ncols(), 2);
        assert_abs_diff_eq!(values[(0, 0)], 0.0);
        assert_abs_diff_eq!(values[(0, 1)], 0.5, epsilon = 1e-12);
    }

    /// Analytic and central-difference gradients agree for a functional
    /// that provides both.
    #[test]
    fn numerical_matches_analytic() {
        struct NumericArea;
        impl Functional for NumericArea {
            fn grade(&self) -> Grade {
                2
            }
            fn integrand(
                &self,
                mesh: &Mesh,
                id: ElementId,
                vids: &[usize],
            ) -> Result<f64, MorphoError> {
                Area.integrand(mesh, id, vids)
            }
        }

        let mut mesh = split_square();
        // move a vertex off-plane so the gradient has all components
        mesh.set_vertex_coord(2, 2, 0.4);
        let analytic = map_gradient(&Area, &mut mesh, None).unwrap();
        let numeric = map_gradient(&NumericArea, &mut mesh, None).unwrap();
        for k in 0..3 {
            for v in 0..4 {
                assert_abs_diff_eq!(analytic[(k, v)], numeric[(k, v)], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn missing_grade_surfaces() {
        let mut mesh = unit_triangle();
        assert!(matches!(
            total(&Volume, &mut mesh, None),
            Err(MorphoError::MissingGrade(3))
        ));
    }
}
