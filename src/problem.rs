//! Specification of an optimization problem: energies to descend on,
//! global conservation laws and pointwise constraints, each carried
//! with its selection, prefactor and target.

use std::rc::Rc;

use crate::{
    error::MorphoError,
    functional::{self, Functional},
    FieldRef, MeshRef, SelectionRef,
};

/// Shared handle to a functional object.
pub type FunctionalRef = Rc<dyn Functional>;

/// One energy contribution: a functional scaled by a prefactor,
/// optionally restricted to a selection.
pub struct EnergyTerm {
    pub functional: FunctionalRef,
    pub selection: Option<SelectionRef>,
    pub prefactor: f64,
}

/// A constraint: global (a conserved total) or local (an equation per
/// element). The target value is a conserved quantity during
/// optimization. `onesided` only applies to local constraints, which
/// are then enforced on the violating side only.
pub struct ConstraintTerm {
    pub functional: FunctionalRef,
    pub selection: Option<SelectionRef>,
    pub field: Option<FieldRef>,
    pub target: f64,
    pub onesided: bool,
}

/// Old-to-new handle pairs produced by refinement, consumed by
/// [`OptimizationProblem::update`]. Handles are matched by pointer
/// identity.
#[derive(Default)]
pub struct RebindMap {
    meshes: Vec<(MeshRef, MeshRef)>,
    fields: Vec<(FieldRef, FieldRef)>,
    selections: Vec<(SelectionRef, SelectionRef)>,
}

impl RebindMap {
    pub fn insert_mesh(&mut self, old: MeshRef, new: MeshRef) {
        self.meshes.push((old, new));
    }

    pub fn insert_field(&mut self, old: FieldRef, new: FieldRef) {
        self.fields.push((old, new));
    }

    pub fn insert_selection(&mut self, old: SelectionRef, new: SelectionRef) {
        self.selections.push((old, new));
    }

    pub fn mesh_for(&self, old: &MeshRef) -> Option<MeshRef> {
        self.meshes
            .iter()
            .find(|(o, _)| Rc::ptr_eq(o, old))
            .map(|(_, n)| n.clone())
    }

    pub fn field_for(&self, old: &FieldRef) -> Option<FieldRef> {
        self.fields
            .iter()
            .find(|(o, _)| Rc::ptr_eq(o, old))
            .map(|(_, n)| n.clone())
    }

    pub fn selection_for(&self, old: &SelectionRef) -> Option<SelectionRef> {
        self.selections
            .iter()
            .find(|(o, _)| Rc::ptr_eq(o, old))
            .map(|(_, n)| n.clone())
    }
}

/// A collection of energies and constraints over one mesh and any
/// number of auxiliary fields.
///
/// The problem holds shared handles to its targets; after refinement,
/// [`OptimizationProblem::update`] is the single point where every
/// internal reference (including those held inside functionals) is
/// exchanged for its refined counterpart.
pub struct OptimizationProblem {
    mesh: MeshRef,
    pub fields: Vec<FieldRef>,
    pub energies: Vec<EnergyTerm>,
    pub constraints: Vec<ConstraintTerm>,
    pub local_constraints: Vec<ConstraintTerm>,
}

impl OptimizationProblem {
    pub fn new(mesh: &MeshRef) -> Self {
        Self {
            mesh: mesh.clone(),
            fields: Vec::new(),
            energies: Vec::new(),
            constraints: Vec::new(),
            local_constraints: Vec::new(),
        }
    }

    #[inline]
    pub fn mesh(&self) -> MeshRef {
        self.mesh.clone()
    }

    /// Add an energy with unit prefactor.
    pub fn add_energy(&mut self, functional: FunctionalRef, selection: Option<SelectionRef>) {
        self.add_energy_scaled(functional, selection, 1.0);
    }

    pub fn add_energy_scaled(
        &mut self,
        functional: FunctionalRef,
        selection: Option<SelectionRef>,
        prefactor: f64,
    ) {
        self.energies.push(EnergyTerm {
            functional,
            selection,
            prefactor,
        });
    }

    /// Add a global constraint. When no target is supplied the
    /// functional's current total is recorded, turning its value into
    /// a conserved quantity.
    pub fn add_constraint(
        &mut self,
        functional: FunctionalRef,
        selection: Option<SelectionRef>,
        field: Option<FieldRef>,
        target: Option<f64>,
    ) -> Result<(), MorphoError> {
        let target = match target {
            Some(t) => t,
            None => {
                let mut mesh = self.mesh.borrow_mut();
                let sel = selection.as_ref().map(|s| s.borrow());
                functional::total(&*functional, &mut mesh, sel.as_deref())?
            }
        };
        self.constraints.push(ConstraintTerm {
            functional,
            selection,
            field,
            target,
            onesided: false,
        });
        Ok(())
    }

    /// Add a per-element constraint; the target defaults to zero.
    /// One-sided constraints are only enforced where the integrand has
    /// crossed the target.
    pub fn add_local_constraint(
        &mut self,
        functional: FunctionalRef,
        selection: Option<SelectionRef>,
        field: Option<FieldRef>,
        onesided: bool,
        target: Option<f64>,
    ) {
        self.local_constraints.push(ConstraintTerm {
            functional,
            selection,
            field,
            target: target.unwrap_or(0.0),
            onesided,
        });
    }

    /// Register an auxiliary field so refinement can carry it along.
    pub fn add_field(&mut self, field: FieldRef) {
        self.fields.push(field);
    }

    /// The problem's total energy: the prefactor-weighted sum of every
    /// energy functional's total.
    pub fn total_energy(&self) -> Result<f64, MorphoError> {
        let mut mesh = self.mesh.borrow_mut();
        let mut sum = 0.0;
        for term in &self.energies {
            let sel = term.selection.as_ref().map(|s| s.borrow());
            sum += term.prefactor
                * functional::total(&*term.functional, &mut mesh, sel.as_deref())?;
        }
        Ok(sum)
    }

    /// Exchange every held handle according to the map. This is the
    /// sole rebinding point after refinement; old objects stay valid
    /// but are no longer referenced by the problem.
    pub fn update(&mut self, map: &RebindMap) {
        if let Some(new) = map.mesh_for(&self.mesh) {
            self.mesh = new;
        }
        for field in &mut self.fields {
            if let Some(new) = map.field_for(field) {
                *field = new;
            }
        }
        let terms = self
            .energies
            .iter_mut()
            .map(|t| (&t.functional, &mut t.selection, None))
            .chain(
                self.constraints
                    .iter_mut()
                    .chain(self.local_constraints.iter_mut())
                    .map(|t| (&t.functional, &mut t.selection, Some(&mut t.field))),
            );
        for (functional, selection, field) in terms {
            if let Some(sel) = selection {
                if let Some(new) = map.selection_for(sel) {
                    *sel = new;
                }
            }
            if let Some(Some(fld)) = field {
                if let Some(new) = map.field_for(fld) {
                    *fld = new;
                }
            }
            functional.rebind(map);
        }
    }
}
