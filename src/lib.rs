//! Shape and field optimization on simplicial meshes.
//!
//! This crate provides the optimization core of a geometry solver:
//! meshes of graded simplicial elements ([`Mesh`]), per-element data
//! ([`Field`]), element subsets ([`Selection`]), a library of
//! geometric, curvature, elastic and field energies implementing the
//! [`Functional`] protocol, constrained gradient descent over vertex
//! positions or field values ([`ShapeOptimizer`], [`FieldOptimizer`]),
//! and edge-midpoint refinement ([`refine`]) that carries fields,
//! selections and an [`OptimizationProblem`]'s references onto the
//! refined mesh.
//!
//! A typical session builds a mesh, declares energies and constraints
//! on an [`OptimizationProblem`], and descends:
//!
//! ```
//! use std::rc::Rc;
//! use morpho_core::{functional, shared, Mesh, OptimizationProblem, Optimizer, ShapeOptimizer};
//!
//! // a loop of edges around the origin
//! let n = 12;
//! let mut coords = Vec::new();
//! for i in 0..n {
//!     let t = 2.0 * std::f64::consts::PI * i as f64 / n as f64;
//!     coords.extend_from_slice(&[t.cos(), t.sin(), 0.0]);
//! }
//! let mesh = shared({
//!     let mut mesh = Mesh::new(nalgebra::DMatrix::from_column_slice(3, n, &coords));
//!     for i in 0..n {
//!         mesh.add_element(1, &[i, (i + 1) % n]).unwrap();
//!     }
//!     mesh
//! });
//!
//! // minimize perimeter at fixed enclosed area
//! let mut problem = OptimizationProblem::new(&mesh);
//! problem.add_energy(Rc::new(functional::Length), None);
//! problem
//!     .add_constraint(Rc::new(functional::AreaEnclosed), None, None, None)
//!     .unwrap();
//!
//! let mut opt = ShapeOptimizer::new(&problem);
//! opt.params.quiet = true;
//! opt.linesearch(10).unwrap();
//! ```

pub mod error;
pub mod field;
pub mod functional;
pub mod mesh;
pub mod optimize;
pub mod problem;
pub mod refine;
pub mod sparse;

#[doc(inline)]
pub use error::MorphoError;
#[doc(inline)]
pub use field::{Field, FieldPrototype};
#[doc(inline)]
pub use functional::{Functional, Symmetry};
#[doc(inline)]
pub use mesh::{Mesh, Selection};
#[doc(inline)]
pub use optimize::{FieldOptimizer, OptimizeParams, Optimizer, ShapeOptimizer};
#[doc(inline)]
pub use problem::{OptimizationProblem, RebindMap};
#[doc(inline)]
pub use refine::{refine, RefineMap, Refinement};
#[doc(inline)]
pub use sparse::Sparse;

use std::cell::RefCell;
use std::rc::Rc;

/// Topological dimension of an element: 0 vertices, 1 edges,
/// 2 faces, 3 volumes.
pub type Grade = usize;

/// Dense index into the elements of one grade.
pub type ElementId = usize;

/// Shared handle to a mesh; optimizers and refinement mutate meshes
/// through these.
pub type MeshRef = Rc<RefCell<Mesh>>;

/// Shared handle to a field.
pub type FieldRef = Rc<RefCell<Field>>;

/// Shared handle to a selection.
pub type SelectionRef = Rc<RefCell<Selection>>;

/// Wrap a value in a shared handle.
pub fn shared<T>(value: T) -> Rc<RefCell<T>> {
    Rc::new(RefCell::new(value))
}

/// Threshold for zero tests on geometric quantities,
/// at machine epsilon scale.
pub(crate) const EPS: f64 = 1e-16;
