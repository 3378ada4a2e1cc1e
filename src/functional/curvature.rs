//! Discrete curvature energies on polylines and triangulated surfaces.
//!
//! These are vertex- or edge-centered: each integrand reconstructs a
//! local stencil from the element's neighborhood, ordered canonically
//! so that symmetry-identified vertices are treated as one. Gradients
//! are numerical, with the stencil reported through
//! [`Functional::dependencies`] so force contributions reach every
//! vertex that moves the integrand.

use nalgebra as na;

use super::{Functional, Symmetry};
use crate::{error::MorphoError, mesh::Mesh, ElementId, Grade, EPS};

/// Reorder `vids` so the vertex contained in `targets` comes first.
fn order_vertices(targets: &[usize], vids: &mut [usize]) -> Result<(), MorphoError> {
    let posn = vids
        .iter()
        .position(|v| targets.contains(v))
        .ok_or(MorphoError::ShapeMismatch("curvature vertex ordering"))?;
    vids.swap(0, posn);
    Ok(())
}

/// Integrated squared curvature of a polyline, vertex-centered:
/// the turning angle between the two incident edges, squared, divided
/// by half the sum of their lengths. With `integrand_only` the result
/// is divided by that length once more, yielding bare curvature.
#[derive(Clone, Copy, Debug, Default)]
pub struct LineCurvatureSq {
    pub integrand_only: bool,
}

impl Functional for LineCurvatureSq {
    fn grade(&self) -> Grade {
        0
    }

    fn symmetry(&self) -> Symmetry {
        Symmetry::Add
    }

    fn prepare(&self, mesh: &mut Mesh) -> Result<(), MorphoError> {
        mesh.connectivity(0, 1)?;
        mesh.connectivity(1, 0)?;
        Ok(())
    }

    fn integrand(&self, mesh: &Mesh, id: ElementId, _vids: &[usize]) -> Result<f64, MorphoError> {
        let nbrs = mesh.find_neighbors(0, id, 1)?;
        if nbrs.len() < 2 {
            return Ok(0.0);
        }
        let syn = mesh.synonyms(0, id);

        let mut s = [na::Vector3::zeros(); 2];
        // sign tracks the orientation of the two edges around the vertex
        let mut sgn = -1.0;
        for (i, &edge) in nbrs.iter().take(2).enumerate() {
            let entries = mesh.element_vertices(1, edge)?;
            s[i] = mesh.vertex3(entries[0]) - mesh.vertex3(entries[1]);
            if !(entries[0] == id || syn.contains(&entries[0])) {
                sgn = -sgn;
            }
        }

        let n0 = s[0].norm();
        let n1 = s[1].norm();
        if n0 < EPS || n1 < EPS {
            return Err(MorphoError::DegenerateElement { grade: 0, id });
        }
        let u = sgn * s[0].dot(&s[1]) / n0 / n1;
        let len = 0.5 * (n0 + n1);
        let theta = if u < 1.0 { u.max(-1.0).acos() } else { 0.0 };

        let mut result = theta * theta / len;
        if self.integrand_only {
            result /= len;
        }
        Ok(result)
    }

    fn dependencies(
        &self,
        mesh: &Mesh,
        id: ElementId,
        out: &mut Vec<ElementId>,
    ) -> Result<(), MorphoError> {
        for edge in mesh.find_neighbors(0, id, 1)? {
            for &v in mesh.element_vertices(1, edge)? {
                if v != id {
                    out.push(v);
                }
            }
        }
        out.sort_unstable();
        out.dedup();
        Ok(())
    }
}

/// Integrated squared torsion of a polyline, edge-centered: the angle
/// the osculating plane turns across the middle segment of three
/// consecutive edges.
#[derive(Clone, Copy, Debug, Default)]
pub struct LineTorsionSq;

impl Functional for LineTorsionSq {
    fn grade(&self) -> Grade {
        1
    }

    fn symmetry(&self) -> Symmetry {
        Symmetry::Add
    }

    fn prepare(&self, mesh: &mut Mesh) -> Result<(), MorphoError> {
        mesh.connectivity(0, 1)?;
        mesh.connectivity(1, 0)?;
        Ok(())
    }

    fn integrand(&self, mesh: &Mesh, id: ElementId, vids: &[usize]) -> Result<f64, MorphoError> {
        let nbrs = mesh.find_neighbors(1, id, 1)?;
        if nbrs.len() < 2 {
            return Ok(0.0);
        }

        // assemble an ordered list of six vertex slots
        //               v the element
        //    0 --- 1/2 --- 3/4 --- 5
        // where 1/2 and 3/4 are each one vertex that may appear under
        // two different indices through symmetry identifications
        let mut vlist = [usize::MAX; 6];
        let mut ty = [-1i32; 6];
        vlist[2] = vids[0];
        vlist[3] = vids[1];
        for (i, &nbr) in nbrs.iter().take(2).enumerate() {
            for (j, &v) in mesh.element_vertices(1, nbr)?.iter().enumerate() {
                vlist[4 * i + j] = v;
            }
        }

        // classify each slot by which of the element's vertices it is
        // a synonym of, then swap segments into canonical order
        for i in 0..2 {
            let syn = mesh.synonyms(0, vids[i]);
            for j in 0..6 {
                if vlist[j] == vids[i] || syn.contains(&vlist[j]) {
                    ty[j] = i as i32;
                }
            }
        }
        if ty[0] == 1 || ty[1] == 1 {
            vlist.swap(0, 4);
            vlist.swap(1, 5);
            ty.swap(0, 4);
            ty.swap(1, 5);
        }
        if ty[1] == -1 {
            vlist.swap(0, 1);
            ty.swap(0, 1);
        }
        if ty[4] == -1 {
            vlist.swap(4, 5);
            ty.swap(4, 5);
        }

        let x: [na::Vector3<f64>; 6] = std::array::from_fn(|i| mesh.vertex3(vlist[i]));
        let a = x[1] - x[0];
        let b = x[3] - x[2];
        let c = x[5] - x[4];
        let cross_ab = a.cross(&b);
        let cross_bc = b.cross(&c);

        let norm_b = b.norm();
        if norm_b < EPS {
            return Err(MorphoError::DegenerateElement { grade: 1, id });
        }
        let norm_ab = cross_ab.norm();
        let norm_bc = cross_bc.norm();

        let mut s = a.dot(&cross_bc) * norm_b;
        if norm_ab > EPS {
            s /= norm_ab;
        }
        if norm_bc > EPS {
            s /= norm_bc;
        }
        let s = s.clamp(-1.0, 1.0).asin();
        Ok(s * s / norm_b)
    }

    fn dependencies(
        &self,
        mesh: &Mesh,
        id: ElementId,
        out: &mut Vec<ElementId>,
    ) -> Result<(), MorphoError> {
        for nbr in mesh.find_neighbors(1, id, 1)? {
            out.extend_from_slice(mesh.element_vertices(1, nbr)?);
        }
        out.sort_unstable();
        out.dedup();
        Ok(())
    }
}

/// Squared mean curvature on a triangulated surface, vertex-centered,
/// from the cotangent-like force over the incident triangles.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeanCurvatureSq {
    pub integrand_only: bool,
}

impl Functional for MeanCurvatureSq {
    fn grade(&self) -> Grade {
        0
    }

    fn symmetry(&self) -> Symmetry {
        Symmetry::Add
    }

    fn prepare(&self, mesh: &mut Mesh) -> Result<(), MorphoError> {
        mesh.connectivity(0, 2)?;
        mesh.connectivity(2, 0)?;
        Ok(())
    }

    fn integrand(&self, mesh: &Mesh, id: ElementId, _vids: &[usize]) -> Result<f64, MorphoError> {
        let nbrs = mesh.find_neighbors(0, id, 2)?;
        if nbrs.is_empty() {
            return Ok(0.0);
        }
        let mut targets = mesh.synonyms(0, id);
        targets.push(id);

        let mut areasum = 0.0;
        let mut frc = na::Vector3::zeros();
        for &tri in &nbrs {
            let mut tv = mesh.element_vertices(2, tri)?.to_vec();
            order_vertices(&targets, &mut tv)?;
            let x: [na::Vector3<f64>; 3] = std::array::from_fn(|i| mesh.vertex3(tv[i]));

            let s0 = x[1] - x[0];
            let s1 = x[2] - x[1];
            let s01 = s0.cross(&s1);
            let norm = s01.norm();
            if norm < EPS {
                return Err(MorphoError::DegenerateElement { grade: 2, id: tri });
            }
            areasum += norm / 2.0;
            frc += (0.5 / norm) * s1.cross(&s01);
        }

        let area = areasum / 3.0;
        let mut out = frc.dot(&frc) / area / 4.0;
        if self.integrand_only {
            out /= area;
        }
        Ok(out)
    }

    fn dependencies(
        &self,
        mesh: &Mesh,
        id: ElementId,
        out: &mut Vec<ElementId>,
    ) -> Result<(), MorphoError> {
        triangle_stencil(mesh, id, out)
    }
}

/// Angle deficit at each vertex of a triangulated surface. Summed over
/// a closed surface this gives `2 * pi * chi` by Gauss-Bonnet. With
/// `integrand_only` the deficit is divided by the vertex's share of the
/// incident triangle area, approximating pointwise Gauss curvature.
#[derive(Clone, Copy, Debug, Default)]
pub struct GaussCurvature {
    pub integrand_only: bool,
}

impl Functional for GaussCurvature {
    fn grade(&self) -> Grade {
        0
    }

    fn symmetry(&self) -> Symmetry {
        Symmetry::Add
    }

    fn prepare(&self, mesh: &mut Mesh) -> Result<(), MorphoError> {
        mesh.connectivity(0, 2)?;
        mesh.connectivity(2, 0)?;
        Ok(())
    }

    fn integrand(&self, mesh: &Mesh, id: ElementId, _vids: &[usize]) -> Result<f64, MorphoError> {
        let nbrs = mesh.find_neighbors(0, id, 2)?;
        let mut targets = mesh.synonyms(0, id);
        targets.push(id);

        let mut anglesum = 0.0;
        let mut areasum = 0.0;
        for &tri in &nbrs {
            let mut tv = mesh.element_vertices(2, tri)?.to_vec();
            order_vertices(&targets, &mut tv)?;
            let x: [na::Vector3<f64>; 3] = std::array::from_fn(|i| mesh.vertex3(tv[i]));

            let s0 = x[1] - x[0];
            let s1 = x[2] - x[0];
            let cross = s0.cross(&s1);
            let area = cross.norm();
            anglesum += area.atan2(s0.dot(&s1));
            areasum += area / 2.0;
        }

        let mut out = 2.0 * std::f64::consts::PI - anglesum;
        if self.integrand_only {
            out /= areasum / 3.0;
        }
        Ok(out)
    }

    fn dependencies(
        &self,
        mesh: &Mesh,
        id: ElementId,
        out: &mut Vec<ElementId>,
    ) -> Result<(), MorphoError> {
        triangle_stencil(mesh, id, out)
    }
}

/// Vertices of the triangles incident on a vertex, excluding itself.
fn triangle_stencil(
    mesh: &Mesh,
    id: ElementId,
    out: &mut Vec<ElementId>,
) -> Result<(), MorphoError> {
    for tri in mesh.find_neighbors(0, id, 2)? {
        for &v in mesh.element_vertices(2, tri)? {
            if v != id {
                out.push(v);
            }
        }
    }
    out.sort_unstable();
    out.dedup();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functional::{map_gradient, map_integrand, total};
    use approx::assert_abs_diff_eq;

    fn circle_polygon(n: usize) -> Mesh {
        let mut coords = Vec::with_capacity(3 * n);
        for i in 0..n {
            let t = 2.0 * std::f64::consts::PI * i as f64 / n as f64;
            coords.extend_from_slice(&[t.cos(), t.sin(), 0.0]);
        }
        let mut mesh = Mesh::new(na::DMatrix::from_column_slice(3, n, &coords));
        for i in 0..n {
            mesh.add_element(1, &[i, (i + 1) % n]).unwrap();
        }
        mesh
    }

    /// A hexagonal fan around a center vertex, flat in the plane.
    fn flat_fan() -> Mesh {
        let mut coords = vec![0.0, 0.0, 0.0];
        for i in 0..6 {
            let t = 2.0 * std::f64::consts::PI * i as f64 / 6.0;
            coords.extend_from_slice(&[t.cos(), t.sin(), 0.0]);
        }
        let mut mesh = Mesh::new(na::DMatrix::from_column_slice(3, 7, &coords));
        for i in 0..6 {
            mesh.add_element(2, &[0, 1 + i, 1 + (i + 1) % 6]).unwrap();
        }
        mesh
    }

    fn icosahedron() -> Mesh {
        let p = (1.0 + 5.0_f64.sqrt()) / 2.0;
        #[rustfmt::skip]
        let coords = [
            -1.0, p, 0.0,   1.0, p, 0.0,   -1.0, -p, 0.0,   1.0, -p, 0.0,
            0.0, -1.0, p,   0.0, 1.0, p,   0.0, -1.0, -p,   0.0, 1.0, -p,
            p, 0.0, -1.0,   p, 0.0, 1.0,   -p, 0.0, -1.0,   -p, 0.0, 1.0,
        ];
        #[rustfmt::skip]
        let faces: [[usize; 3]; 20] = [
            [0, 11, 5], [0, 5, 1], [0, 1, 7], [0, 7, 10], [0, 10, 11],
            [1, 5, 9], [5, 11, 4], [11, 10, 2], [10, 7, 6], [7, 1, 8],
            [3, 9, 4], [3, 4, 2], [3, 2, 6], [3, 6, 8], [3, 8, 9],
            [4, 9, 5], [2, 4, 11], [6, 2, 10], [8, 6, 7], [9, 8, 1],
        ];
        let mut mesh = Mesh::new(na::DMatrix::from_column_slice(3, 12, &coords));
        for f in faces {
            mesh.add_element(2, &f).unwrap();
        }
        mesh
    }

    /// Discrete curvature squared of a near-circular polygon
    /// approaches `2 * pi`.
    #[test]
    fn polygon_curvature() {
        let mut mesh = circle_polygon(64);
        let t = total(&LineCurvatureSq::default(), &mut mesh, None).unwrap();
        assert_abs_diff_eq!(t, 2.0 * std::f64::consts::PI, epsilon = 1e-2);
    }

    /// Gradient contributions reach the whole stencil: the assembled
    /// force is translation invariant.
    #[test]
    fn curvature_force_is_translation_invariant() {
        let mut mesh = circle_polygon(16);
        let frc = map_gradient(&LineCurvatureSq::default(), &mut mesh, None).unwrap();
        for k in 0..3 {
            let row_sum: f64 = (0..16).map(|v| frc[(k, v)]).sum();
            assert_abs_diff_eq!(row_sum, 0.0, epsilon = 1e-3);
        }
    }

    /// Torsion vanishes on a planar Z and measures the dihedral turn
    /// on a right-angle helix step.
    #[test]
    fn torsion_on_z_paths() {
        let mut flat = Mesh::new(na::DMatrix::from_column_slice(
            3,
            4,
            &[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 2.0, 1.0, 0.0],
        ));
        for i in 0..3 {
            flat.add_element(1, &[i, i + 1]).unwrap();
        }
        let t = total(&LineTorsionSq, &mut flat, None).unwrap();
        assert_abs_diff_eq!(t, 0.0, epsilon = 1e-12);

        let mut bent = Mesh::new(na::DMatrix::from_column_slice(
            3,
            4,
            &[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0],
        ));
        for i in 0..3 {
            bent.add_element(1, &[i, i + 1]).unwrap();
        }
        let quarter = std::f64::consts::FRAC_PI_2;
        let t = total(&LineTorsionSq, &mut bent, None).unwrap();
        assert_abs_diff_eq!(t, quarter * quarter, epsilon = 1e-12);
    }

    /// Mean curvature vanishes at the interior vertex of a flat patch.
    #[test]
    fn flat_patch_has_no_mean_curvature() {
        let mut mesh = flat_fan();
        let values = map_integrand(&MeanCurvatureSq::default(), &mut mesh, None).unwrap();
        assert_abs_diff_eq!(values[(0, 0)], 0.0, epsilon = 1e-12);
    }

    /// Total angle deficit of a closed genus-zero surface is `4 * pi`
    /// whatever the geometry.
    #[test]
    fn gauss_bonnet_on_icosahedron() {
        let mut mesh = icosahedron();
        let t = total(&GaussCurvature::default(), &mut mesh, None).unwrap();
        assert_abs_diff_eq!(t, 4.0 * std::f64::consts::PI, epsilon = 1e-6);
    }
}
