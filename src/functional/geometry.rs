//! Geometric functionals with closed-form integrands and gradients:
//! lengths, areas and volumes of elements, and the area/volume enclosed
//! by a boundary loop or surface.

use nalgebra as na;

use super::{Functional, Symmetry};
use crate::{error::MorphoError, mesh::Mesh, ElementId, Grade, EPS};

/// Element vertex positions padded to 3-vectors.
fn positions<const N: usize>(mesh: &Mesh, vids: &[usize]) -> [na::Vector3<f64>; N] {
    std::array::from_fn(|i| mesh.vertex3(vids[i]))
}

/// Accumulate `scale * s` into one force column.
pub(crate) fn add_to_column(
    frc: &mut na::DMatrix<f64>,
    v: usize,
    scale: f64,
    s: &na::Vector3<f64>,
) {
    for k in 0..frc.nrows().min(3) {
        frc[(k, v)] += scale * s[k];
    }
}

/// The size (length, area or volume) of one element.
pub(crate) fn element_size(
    mesh: &Mesh,
    g: Grade,
    id: ElementId,
    vids: &[usize],
) -> Result<f64, MorphoError> {
    match g {
        1 => Length.integrand(mesh, id, vids),
        2 => Area.integrand(mesh, id, vids),
        3 => Volume.integrand(mesh, id, vids),
        _ => Err(MorphoError::MissingGrade(g)),
    }
}

/// Total length of line elements.
pub struct Length;

impl Functional for Length {
    fn grade(&self) -> Grade {
        1
    }

    fn symmetry(&self) -> Symmetry {
        Symmetry::Add
    }

    fn integrand(&self, mesh: &Mesh, _id: ElementId, vids: &[usize]) -> Result<f64, MorphoError> {
        let [x0, x1] = positions(mesh, vids);
        Ok((x1 - x0).norm())
    }

    fn has_analytic_gradient(&self) -> bool {
        true
    }

    fn accumulate_gradient(
        &self,
        mesh: &Mesh,
        id: ElementId,
        vids: &[usize],
        frc: &mut na::DMatrix<f64>,
    ) -> Result<(), MorphoError> {
        let [x0, x1] = positions(mesh, vids);
        let s0 = x1 - x0;
        let norm = s0.norm();
        if norm < EPS {
            return Err(MorphoError::DegenerateElement { grade: 1, id });
        }
        add_to_column(frc, vids[0], -1.0 / norm, &s0);
        add_to_column(frc, vids[1], 1.0 / norm, &s0);
        Ok(())
    }
}

/// Area enclosed by a loop of line elements around the origin,
/// one cross product per edge.
pub struct AreaEnclosed;

impl Functional for AreaEnclosed {
    fn grade(&self) -> Grade {
        1
    }

    fn symmetry(&self) -> Symmetry {
        Symmetry::Add
    }

    fn integrand(&self, mesh: &Mesh, _id: ElementId, vids: &[usize]) -> Result<f64, MorphoError> {
        let [x0, x1] = positions(mesh, vids);
        Ok(0.5 * x0.cross(&x1).norm())
    }

    fn has_analytic_gradient(&self) -> bool {
        true
    }

    fn accumulate_gradient(
        &self,
        mesh: &Mesh,
        id: ElementId,
        vids: &[usize],
        frc: &mut na::DMatrix<f64>,
    ) -> Result<(), MorphoError> {
        let [x0, x1] = positions(mesh, vids);
        let cx = x0.cross(&x1);
        let norm = cx.norm();
        if norm < EPS {
            return Err(MorphoError::DegenerateElement { grade: 1, id });
        }
        add_to_column(frc, vids[0], 0.5 / norm, &x1.cross(&cx));
        add_to_column(frc, vids[1], 0.5 / norm, &cx.cross(&x0));
        Ok(())
    }
}

/// Total area of triangle elements.
pub struct Area;

impl Functional for Area {
    fn grade(&self) -> Grade {
        2
    }

    fn symmetry(&self) -> Symmetry {
        Symmetry::Add
    }

    fn integrand(&self, mesh: &Mesh, _id: ElementId, vids: &[usize]) -> Result<f64, MorphoError> {
        let [x0, x1, x2] = positions(mesh, vids);
        Ok(0.5 * (x1 - x0).cross(&(x2 - x1)).norm())
    }

    fn has_analytic_gradient(&self) -> bool {
        true
    }

    fn accumulate_gradient(
        &self,
        mesh: &Mesh,
        id: ElementId,
        vids: &[usize],
        frc: &mut na::DMatrix<f64>,
    ) -> Result<(), MorphoError> {
        let [x0, x1, x2] = positions(mesh, vids);
        let s0 = x1 - x0;
        let s1 = x2 - x1;
        let s01 = s0.cross(&s1);
        let norm = s01.norm();
        if norm < EPS {
            return Err(MorphoError::DegenerateElement { grade: 2, id });
        }
        let s010 = s01.cross(&s0);
        let s011 = s01.cross(&s1);
        add_to_column(frc, vids[0], 0.5 / norm, &s011);
        add_to_column(frc, vids[2], 0.5 / norm, &s010);
        add_to_column(frc, vids[1], -0.5 / norm, &(s010 + s011));
        Ok(())
    }
}

/// Volume enclosed by a closed surface of triangle elements,
/// accumulated as signed tetrahedra against the origin.
pub struct VolumeEnclosed;

impl Functional for VolumeEnclosed {
    fn grade(&self) -> Grade {
        2
    }

    fn symmetry(&self) -> Symmetry {
        Symmetry::Add
    }

    fn integrand(&self, mesh: &Mesh, _id: ElementId, vids: &[usize]) -> Result<f64, MorphoError> {
        let [x0, x1, x2] = positions(mesh, vids);
        Ok(x0.cross(&x1).dot(&x2).abs() / 6.0)
    }

    fn has_analytic_gradient(&self) -> bool {
        true
    }

    fn accumulate_gradient(
        &self,
        mesh: &Mesh,
        id: ElementId,
        vids: &[usize],
        frc: &mut na::DMatrix<f64>,
    ) -> Result<(), MorphoError> {
        let [x0, x1, x2] = positions(mesh, vids);
        let cx = x0.cross(&x1);
        let dot = cx.dot(&x2);
        if dot.abs() < EPS {
            return Err(MorphoError::DegenerateElement { grade: 2, id });
        }
        let sign = dot.signum();
        add_to_column(frc, vids[2], sign / 6.0, &cx);
        add_to_column(frc, vids[0], sign / 6.0, &x1.cross(&x2));
        add_to_column(frc, vids[1], sign / 6.0, &x2.cross(&x0));
        Ok(())
    }
}

/// Total volume of tetrahedral elements.
pub struct Volume;

impl Functional for Volume {
    fn grade(&self) -> Grade {
        3
    }

    fn symmetry(&self) -> Symmetry {
        Symmetry::Add
    }

    fn integrand(&self, mesh: &Mesh, _id: ElementId, vids: &[usize]) -> Result<f64, MorphoError> {
        let [x0, x1, x2, x3] = positions(mesh, vids);
        let s10 = x1 - x0;
        let s20 = x2 - x0;
        let s30 = x3 - x0;
        Ok(s10.dot(&s20.cross(&s30)).abs() / 6.0)
    }

    fn has_analytic_gradient(&self) -> bool {
        true
    }

    fn accumulate_gradient(
        &self,
        mesh: &Mesh,
        id: ElementId,
        vids: &[usize],
        frc: &mut na::DMatrix<f64>,
    ) -> Result<(), MorphoError> {
        let [x0, x1, x2, x3] = positions(mesh, vids);
        let s10 = x1 - x0;
        let s20 = x2 - x0;
        let s30 = x3 - x0;
        let s31 = x3 - x1;
        let s21 = x2 - x1;
        let cx = s20.cross(&s30);
        let dot = s10.dot(&cx);
        if dot.abs() < EPS {
            return Err(MorphoError::DegenerateElement { grade: 3, id });
        }
        let sign = if dot > 0.0 { 1.0 } else { -1.0 };
        add_to_column(frc, vids[1], sign / 6.0, &cx);
        add_to_column(frc, vids[0], sign / 6.0, &s31.cross(&s21));
        add_to_column(frc, vids[2], sign / 6.0, &s30.cross(&s10));
        add_to_column(frc, vids[3], sign / 6.0, &s10.cross(&s20));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functional::{map_gradient, total};
    use crate::mesh::{three_vertex_line, unit_triangle};
    use approx::assert_abs_diff_eq;

    fn reference_tet() -> Mesh {
        let vert = na::DMatrix::from_column_slice(
            3,
            4,
            &[
                0.0, 0.0, 0.0, //
                1.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, //
                0.0, 0.0, 1.0,
            ],
        );
        let mut mesh = Mesh::new(vert);
        mesh.add_element(3, &[0, 1, 2, 3]).unwrap();
        mesh
    }

    /// Area of the unit right triangle, and translation invariance
    /// of its gradient.
    #[test]
    fn unit_triangle_area() {
        let mut mesh = unit_triangle();
        assert_abs_diff_eq!(total(&Area, &mut mesh, None).unwrap(), 0.5, epsilon = 1e-12);

        let frc = map_gradient(&Area, &mut mesh, None).unwrap();
        for k in 0..3 {
            let row_sum: f64 = (0..3).map(|v| frc[(k, v)]).sum();
            assert_abs_diff_eq!(row_sum, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn chain_length() {
        let mut mesh = three_vertex_line();
        assert_abs_diff_eq!(total(&Length, &mut mesh, None).unwrap(), 1.0, epsilon = 1e-14);
    }

    #[test]
    fn tet_volume() {
        let mut mesh = reference_tet();
        assert_abs_diff_eq!(
            total(&Volume, &mut mesh, None).unwrap(),
            1.0 / 6.0,
            epsilon = 1e-14
        );
    }

    /// A square loop of edges encloses its area.
    #[test]
    fn enclosed_area_of_square_loop() {
        let vert = na::DMatrix::from_column_slice(
            3,
            4,
            &[
                1.0, 1.0, 0.0, //
                -1.0, 1.0, 0.0, //
                -1.0, -1.0, 0.0, //
                1.0, -1.0, 0.0,
            ],
        );
        let mut mesh = Mesh::new(vert);
        for i in 0..4 {
            mesh.add_element(1, &[i, (i + 1) % 4]).unwrap();
        }
        assert_abs_diff_eq!(
            total(&AreaEnclosed, &mut mesh, None).unwrap(),
            4.0,
            epsilon = 1e-12
        );
    }

    /// A regular tetrahedron's surface encloses its volume.
    #[test]
    fn enclosed_volume_of_tet_surface() {
        let vert = na::DMatrix::from_column_slice(
            3,
            4,
            &[
                1.0, 1.0, 1.0, //
                1.0, -1.0, -1.0, //
                -1.0, 1.0, -1.0, //
                -1.0, -1.0, 1.0,
            ],
        );
        let mut mesh = Mesh::new(vert);
        mesh.add_element(2, &[0, 1, 2]).unwrap();
        mesh.add_element(2, &[0, 1, 3]).unwrap();
        mesh.add_element(2, &[0, 2, 3]).unwrap();
        mesh.add_element(2, &[1, 2, 3]).unwrap();
        assert_abs_diff_eq!(
            total(&VolumeEnclosed, &mut mesh, None).unwrap(),
            8.0 / 3.0,
            epsilon = 1e-12
        );
    }

    /// Analytic gradients agree with central differences
    /// on a skewed tetrahedron.
    #[test]
    fn volume_gradient_matches_differences() {
        struct NumericVolume;
        impl Functional for NumericVolume {
            fn grade(&self) -> Grade {
                3
            }
            fn integrand(
                &self,
                mesh: &Mesh,
                id: ElementId,
                vids: &[usize],
            ) -> Result<f64, MorphoError> {
                Volume.integrand(mesh, id, vids)
            }
        }

        let mut mesh = reference_tet();
        mesh.set_vertex_coord(0, 3, 0.2);
        mesh.set_vertex_coord(1, 3, -0.1);
        let analytic = map_gradient(&Volume, &mut mesh, None).unwrap();
        let numeric = map_gradient(&NumericVolume, &mut mesh, None).unwrap();
        for k in 0..3 {
            for v in 0..4 {
                assert_abs_diff_eq!(analytic[(k, v)], numeric[(k, v)], epsilon = 1e-5);
            }
        }
    }
}
