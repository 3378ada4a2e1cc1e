//! Edge-midpoint refinement: builds a new mesh with every (selected)
//! edge split at its midpoint, along with a map that relates each new
//! element to its parents so fields and selections can be carried
//! forward and an optimization problem rebound.

use std::collections::BTreeMap;

use nalgebra as na;

use crate::{
    error::MorphoError,
    field::Field,
    mesh::{Mesh, Selection},
    problem::RebindMap,
    shared,
    sparse::Sparse,
    ElementId, FieldRef, Grade, MeshRef, SelectionRef,
};

/// How one refined element relates to the mesh it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Parent {
    /// A direct copy of (or sub-element of) a single old element;
    /// field values are copied.
    Single(ElementId),
    /// Field values are averaged over these old elements.
    Average(Vec<ElementId>),
    /// A midpoint vertex: coordinates and field values are averaged
    /// over the two old vertices.
    Midpoint(usize, usize),
}

/// Per-grade parent relations, indexed by new element id.
#[derive(Clone, Debug, Default)]
pub struct RefineMap {
    grades: [Vec<Parent>; 4],
}

impl RefineMap {
    /// The parent of each new element of a grade.
    pub fn parents(&self, g: Grade) -> &[Parent] {
        &self.grades[g]
    }
}

/// The product of a refinement pass: the new mesh, the parent map, and
/// the handle exchanges to feed to
/// [`OptimizationProblem::update`][crate::OptimizationProblem::update].
pub struct Refinement {
    pub mesh: MeshRef,
    pub map: RefineMap,
    pub rebind: RebindMap,
}

/// Refine a mesh and carry the given fields and selections onto the
/// result. With `restrict`, only the selected elements' edges are
/// split; adjacent triangles are subdivided to match, so the result is
/// a valid mesh without hanging vertices.
///
/// The old mesh, fields and selections remain valid; the returned
/// [`RebindMap`] pairs each with its refined counterpart.
pub fn refine(
    mesh: &MeshRef,
    fields: &[FieldRef],
    selections: &[SelectionRef],
    restrict: Option<&Selection>,
) -> Result<Refinement, MorphoError> {
    let (new_mesh, map) = {
        let mut m = mesh.borrow_mut();
        if m.max_grade() > 2 {
            return Err(MorphoError::UnsupportedRefinement(3));
        }
        m.derive_grade(1)?;
        split_mesh(&mut m, restrict)?
    };

    let new_mesh = shared(new_mesh);
    let mut rebind = RebindMap::default();
    rebind.insert_mesh(mesh.clone(), new_mesh.clone());
    for field in fields {
        let refined = refine_field(&new_mesh, &map, &field.borrow());
        rebind.insert_field(field.clone(), shared(refined));
    }
    for sel in selections {
        let refined = refine_selection(&new_mesh, &map, &sel.borrow());
        rebind.insert_selection(sel.clone(), shared(refined));
    }

    Ok(Refinement {
        mesh: new_mesh,
        map,
        rebind,
    })
}

/// Split every marked edge and subdivide elements accordingly.
fn split_mesh(mesh: &mut Mesh, restrict: Option<&Selection>) -> Result<(Mesh, RefineMap), MorphoError> {
    let dim = mesh.dim();
    let nv = mesh.vertex_count();
    let ne = mesh.count(1);
    let nf = mesh.count(2);
    mesh.connectivity(0, 1)?;

    // old edges by their (sorted) vertex pair
    let mut edge_ids: BTreeMap<(usize, usize), ElementId> = BTreeMap::new();
    for e in 0..ne {
        let v = mesh.element_vertices(1, e)?;
        edge_ids.insert((v[0], v[1]), e);
    }
    let eid = |a: usize, b: usize| edge_ids[&(a.min(b), a.max(b))];

    // every vertex pair of a face must be an edge; a mesh carrying
    // only a partial edge set cannot be split consistently
    for t in 0..nf {
        let tv = mesh.element_vertices(2, t)?;
        for i in 0..3 {
            for j in i + 1..3 {
                if !edge_ids.contains_key(&(tv[i], tv[j])) {
                    return Err(MorphoError::MissingGrade(1));
                }
            }
        }
    }

    // which edges get a midpoint: all of them, or those selected
    // directly plus every vertex pair of a selected higher element
    let mut marked = vec![restrict.is_none(); ne];
    if let Some(sel) = restrict {
        for e in sel.id_list(1) {
            marked[e] = true;
        }
        for t in sel.id_list(2) {
            let tv = mesh.element_vertices(2, t)?.to_vec();
            for i in 0..3 {
                for j in i + 1..3 {
                    marked[eid(tv[i], tv[j])] = true;
                }
            }
        }
    }

    let mut map = RefineMap::default();

    // seed the new vertex table with all original vertices,
    // then append a midpoint for each marked edge
    let mut coords: Vec<f64> = mesh.vertex_matrix().as_slice().to_vec();
    map.grades[0] = (0..nv).map(Parent::Single).collect();
    let mut midpoint = vec![None; ne];
    for e in 0..ne {
        if !marked[e] {
            continue;
        }
        let v = mesh.element_vertices(1, e)?;
        let (v0, v1) = (v[0], v[1]);
        for k in 0..dim {
            coords.push(0.5 * (mesh.vertex_coord(k, v0) + mesh.vertex_coord(k, v1)));
        }
        // midpoint ids continue from the original vertices
        midpoint[e] = Some(map.grades[0].len());
        map.grades[0].push(Parent::Midpoint(v0, v1));
    }

    // split edges in place: two halves where a midpoint exists
    let mut edges: Vec<[usize; 2]> = Vec::new();
    for e in 0..ne {
        let v = mesh.element_vertices(1, e)?;
        let (v0, v1) = (v[0], v[1]);
        match midpoint[e] {
            Some(m) => {
                edges.push([v0, m]);
                map.grades[1].push(Parent::Single(e));
                edges.push([m, v1]);
                map.grades[1].push(Parent::Single(e));
            }
            None => {
                edges.push([v0, v1]);
                map.grades[1].push(Parent::Single(e));
            }
        }
    }

    // subdivide triangles by the pattern of their refined edges
    let mut triangles: Vec<[usize; 3]> = Vec::new();
    for t in 0..nf {
        let tv = mesh.element_vertices(2, t)?.to_vec();
        let (a, b, c) = (tv[0], tv[1], tv[2]);
        let mids = [
            midpoint[eid(a, b)],
            midpoint[eid(b, c)],
            midpoint[eid(a, c)],
        ];
        let nref = mids.iter().flatten().count();

        let push_tri = |list: &mut Vec<[usize; 3]>, map: &mut RefineMap, tri: [usize; 3]| {
            list.push(tri);
            map.grades[2].push(Parent::Single(t));
        };
        let push_edge =
            |edges: &mut Vec<[usize; 2]>, map: &mut RefineMap, edge: [usize; 2], parent: Parent| {
                edges.push(edge);
                map.grades[1].push(parent);
            };

        match nref {
            0 => push_tri(&mut triangles, &mut map, [a, b, c]),
            1 => {
                // one refined edge (p, q); join its halves
                // to the opposite vertex r
                let (p, q, r, m) = if let Some(m) = mids[0] {
                    (a, b, c, m)
                } else if let Some(m) = mids[1] {
                    (b, c, a, m)
                } else {
                    (a, c, b, mids[2].unwrap())
                };
                push_tri(&mut triangles, &mut map, [p, m, r]);
                push_tri(&mut triangles, &mut map, [m, q, r]);
                push_edge(
                    &mut edges,
                    &mut map,
                    [m, r],
                    Parent::Average(vec![eid(p, r), eid(q, r)]),
                );
            }
            2 => {
                // two refined edges share a vertex q; the quadrilateral
                // remnant is split toward the midpoint m1
                let (p, q, r, m0, m1) = match (mids[0], mids[1], mids[2]) {
                    (Some(m0), Some(m1), None) => (a, b, c, m0, m1),
                    (Some(m0), None, Some(m1)) => (b, a, c, m0, m1),
                    (None, Some(m0), Some(m1)) => (b, c, a, m0, m1),
                    _ => unreachable!(),
                };
                push_tri(&mut triangles, &mut map, [q, m0, m1]);
                push_tri(&mut triangles, &mut map, [p, m0, m1]);
                push_tri(&mut triangles, &mut map, [p, m1, r]);
                // the midline is parallel to (p, r), the other strut is not
                push_edge(&mut edges, &mut map, [m0, m1], Parent::Single(eid(p, r)));
                push_edge(
                    &mut edges,
                    &mut map,
                    [p, m1],
                    Parent::Average(vec![eid(p, q), eid(p, r)]),
                );
            }
            3 => {
                // standard four-to-one subdivision
                let (mab, mbc, mac) = (mids[0].unwrap(), mids[1].unwrap(), mids[2].unwrap());
                push_tri(&mut triangles, &mut map, [a, mab, mac]);
                push_tri(&mut triangles, &mut map, [b, mbc, mab]);
                push_tri(&mut triangles, &mut map, [c, mac, mbc]);
                push_tri(&mut triangles, &mut map, [mab, mbc, mac]);
                // each midline copies the old edge it parallels
                push_edge(&mut edges, &mut map, [mab, mbc], Parent::Single(eid(a, c)));
                push_edge(&mut edges, &mut map, [mbc, mac], Parent::Single(eid(a, b)));
                push_edge(&mut edges, &mut map, [mab, mac], Parent::Single(eid(b, c)));
            }
            _ => unreachable!(),
        }
    }

    // assemble the refined mesh
    let nv_new = map.grades[0].len();
    let mut new_mesh = Mesh::new(na::DMatrix::from_column_slice(dim, nv_new, &coords));
    let mut conn1 = Sparse::new(nv_new, edges.len());
    for (id, [v0, v1]) in edges.iter().enumerate() {
        conn1.set(*v0, id, 1.0);
        conn1.set(*v1, id, 1.0);
    }
    new_mesh.add_grade(1, conn1)?;
    if nf > 0 {
        let mut conn2 = Sparse::new(nv_new, triangles.len());
        for (id, tri) in triangles.iter().enumerate() {
            for &v in tri {
                conn2.set(v, id, 1.0);
            }
        }
        new_mesh.add_grade(2, conn2)?;
    }

    Ok((new_mesh, map))
}

/// Carry a field onto a refined mesh: copied values for single
/// parents, means over parent lists, midpoint averages for new
/// vertices.
pub fn refine_field(new_mesh: &MeshRef, map: &RefineMap, field: &Field) -> Field {
    let mut out = Field::new(new_mesh, field.prototype(), field.shape());
    for g in 0..4 {
        if field.dof(g) == 0 {
            continue;
        }
        for (new_el, parent) in map.parents(g).iter().enumerate() {
            if new_el >= out.count(g) {
                break;
            }
            match parent {
                Parent::Single(old) => {
                    out.element_mut(g, new_el).copy_from_slice(field.element(g, *old));
                }
                Parent::Average(olds) => {
                    let scale = 1.0 / olds.len() as f64;
                    let dst = out.element_mut(g, new_el);
                    for old in olds {
                        for (d, s) in dst.iter_mut().zip(field.element(g, *old)) {
                            *d += scale * s;
                        }
                    }
                }
                Parent::Midpoint(v0, v1) => {
                    let dst = out.element_mut(g, new_el);
                    for (i, d) in dst.iter_mut().enumerate() {
                        *d = 0.5 * (field.element(0, *v0)[i] + field.element(0, *v1)[i]);
                    }
                }
            }
        }
    }
    out
}

/// Carry a selection onto a refined mesh: a new element is selected
/// exactly when all of its parents were.
pub fn refine_selection(new_mesh: &MeshRef, map: &RefineMap, sel: &Selection) -> Selection {
    let mut out = Selection::new(&new_mesh.borrow());
    for g in 0..4 {
        for (new_el, parent) in map.parents(g).iter().enumerate() {
            let keep = match parent {
                Parent::Single(old) => sel.is_selected(g, *old),
                Parent::Average(olds) => olds.iter().all(|&old| sel.is_selected(g, old)),
                Parent::Midpoint(v0, v1) => sel.is_selected(0, *v0) && sel.is_selected(0, *v1),
            };
            if keep {
                out.select(g, new_el);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functional::{total, Area, Length};
    use crate::mesh::{split_square, three_vertex_line};
    use approx::assert_abs_diff_eq;

    /// Full refinement of a triangulated square: faces quadruple,
    /// edge and vertex counts follow the Euler bookkeeping, and the
    /// total area is unchanged.
    #[test]
    fn square_counts_and_area() {
        let mesh = shared(split_square());
        let area_before = total(&Area, &mut mesh.borrow_mut(), None).unwrap();

        let refinement = refine(&mesh, &[], &[], None).unwrap();
        let new_mesh = refinement.mesh;
        {
            let m = new_mesh.borrow();
            // V + E, 2 E + 3 F, 4 F with V = 4, E = 5, F = 2
            assert_eq!(m.count(0), 9);
            assert_eq!(m.count(1), 16);
            assert_eq!(m.count(2), 8);
        }
        let area_after = total(&Area, &mut new_mesh.borrow_mut(), None).unwrap();
        assert_abs_diff_eq!(area_after, area_before, epsilon = 1e-10);

        // the original mesh is untouched
        assert_eq!(mesh.borrow().count(2), 2);
    }

    /// Refining a polyline preserves its total length.
    #[test]
    fn polyline_length_preserved() {
        let mesh = shared(three_vertex_line());
        let before = total(&Length, &mut mesh.borrow_mut(), None).unwrap();
        let refinement = refine(&mesh, &[], &[], None).unwrap();
        let after = total(&Length, &mut refinement.mesh.borrow_mut(), None).unwrap();
        assert_abs_diff_eq!(after, before, epsilon = 1e-10);
        assert_eq!(refinement.mesh.borrow().count(1), 4);
        assert_eq!(refinement.mesh.borrow().count(0), 5);
    }

    /// Constant fields stay constant; linear fields are interpolated
    /// exactly at midpoints; original vertices keep their values.
    #[test]
    fn field_refinement() {
        let mesh = shared(split_square());
        let mut linear = Field::scalar(&mesh);
        for v in 0..4 {
            let m = mesh.borrow();
            let value = 2.0 * m.vertex_coord(0, v) + m.vertex_coord(1, v);
            drop(m);
            linear.set(0, v, 0, 0, value).unwrap();
        }
        let linear = shared(linear);
        let constant = {
            let mut f = Field::scalar(&mesh);
            for v in 0..4 {
                f.set(0, v, 0, 0, 7.0).unwrap();
            }
            shared(f)
        };

        let refinement = refine(&mesh, &[linear.clone(), constant.clone()], &[], None).unwrap();
        let new_linear = refinement.rebind.field_for(&linear).unwrap();
        let new_constant = refinement.rebind.field_for(&constant).unwrap();

        let m = refinement.mesh.borrow();
        let nl = new_linear.borrow();
        for v in 0..m.vertex_count() {
            let expected = 2.0 * m.vertex_coord(0, v) + m.vertex_coord(1, v);
            assert_abs_diff_eq!(nl.get(0, v, 0, 0).unwrap(), expected, epsilon = 1e-12);
        }
        let nc = new_constant.borrow();
        for v in 0..m.vertex_count() {
            assert_abs_diff_eq!(nc.get(0, v, 0, 0).unwrap(), 7.0);
        }
    }

    /// A selection carries to the children of fully selected elements
    /// only.
    #[test]
    fn selection_refinement() {
        let mesh = shared(split_square());
        let sel = {
            let m = mesh.borrow();
            let mut s = Selection::new(&m);
            s.select(2, 0);
            for v in [0, 1, 2] {
                s.select(0, v);
            }
            shared(s)
        };

        let refinement = refine(&mesh, &[], &[sel.clone()], None).unwrap();
        let new_sel = refinement.rebind.selection_for(&sel).unwrap();
        let new_sel = new_sel.borrow();

        // triangle 0 contributes four selected children, triangle 1 none
        assert_eq!(new_sel.count(2), 4);
        // original selected vertices carry over; midpoints of selected
        // vertex pairs are selected too
        assert!(new_sel.is_selected(0, 0));
        assert!(!new_sel.is_selected(0, 3));
    }

    /// Restricting refinement to one triangle splits its neighbor just
    /// enough to stay conforming.
    #[test]
    fn restricted_refinement_is_conforming() {
        let mesh = shared(split_square());
        let restrict = {
            let mut m = mesh.borrow_mut();
            m.derive_grade(1).unwrap();
            let mut s = Selection::new(&m);
            s.select(2, 0);
            s
        };
        let refinement = refine(&mesh, &[], &[], Some(&restrict)).unwrap();
        let m = refinement.mesh.borrow();
        // three midpoints appear; triangle 0 splits in four,
        // triangle 1 (sharing the diagonal) in two
        assert_eq!(m.count(0), 7);
        assert_eq!(m.count(2), 6);
        assert_eq!(m.count(1), 12);
    }
}
