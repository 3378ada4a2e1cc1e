//! Constrained gradient descent on vertex positions or field values.
//!
//! The descent machinery is shared between the two optimizer kinds
//! through the [`Optimizer`] trait: implementations supply a flat view
//! of their target (the vertex matrix or a field's storage vector),
//! forces, and constraint evaluations, and the provided methods build
//! constraint projection, reprojection and the descent loops
//! ([`Optimizer::relax`], [`Optimizer::linesearch`],
//! [`Optimizer::conjugate_gradient`]) on top.
//!
//! Constraint handling follows a projection scheme: forces are
//! orthogonalized pointwise against local constraint gradients, then
//! against each global constraint direction, and after every step a
//! Newton-like reprojection restores the constraint values.

use fixedbitset as fb;
use log::{info, warn};
use nalgebra as na;

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::{
    error::MorphoError,
    functional,
    mesh::Selection,
    problem::{ConstraintTerm, OptimizationProblem},
    ElementId, FieldRef, MeshRef, EPS,
};

/// Tuning parameters shared by both optimizer kinds.
#[derive(Clone, Debug)]
pub struct OptimizeParams {
    /// Initial (and, for `relax`, fixed) step size.
    pub stepsize: f64,
    /// Upper bound on the step chosen by a line search.
    pub steplimit: f64,
    /// Relative energy tolerance for convergence.
    pub etol: f64,
    /// Constraint residual tolerance.
    pub ctol: f64,
    /// Line minimization tolerance passed to Brent.
    pub linmintol: f64,
    /// Iteration cap for Brent.
    pub linminmax: usize,
    /// Iteration cap for constraint reprojection.
    pub maxconstraintsteps: usize,
    /// Cap on bracket expansions in the line search.
    pub bracketmax: usize,
    /// Suppress per-iteration progress reporting.
    pub quiet: bool,
}

impl Default for OptimizeParams {
    fn default() -> Self {
        Self {
            stepsize: 0.1,
            steplimit: 0.5,
            etol: 1e-8,
            ctol: 1e-10,
            linmintol: 0.001,
            linminmax: 10,
            maxconstraintsteps: 20,
            bracketmax: 10,
            quiet: false,
        }
    }
}

//
// 1-d minimization
//

const CGOLD: f64 = 0.3819660;
const ZEPS: f64 = 1e-10;

/// Expand or contract the trial steps `s` until the middle energy is
/// below both ends, evaluating through `f`.
fn bracket_minimum(
    s: &mut [f64; 3],
    en: &mut [f64; 3],
    max: usize,
    f: &mut dyn FnMut(f64) -> Result<f64, MorphoError>,
) -> Result<(), MorphoError> {
    for _ in 0..max {
        if en[1] < en[0] && en[1] < en[2] {
            return Ok(());
        }
        if en[1] >= en[0] {
            // no descent at the middle point: contract toward the start
            s[2] = s[1];
            en[2] = en[1];
            s[1] *= 0.5;
            en[1] = f(s[1])?;
        } else {
            // still descending at the far point: expand outward
            s[1] = s[2];
            en[1] = en[2];
            s[2] *= 2.0;
            en[2] = f(s[2])?;
        }
    }
    if en[1] < en[0] && en[1] < en[2] {
        Ok(())
    } else {
        Err(MorphoError::BracketingFailed(max))
    }
}

/// Brent's method: golden sections with parabolic interpolation where
/// the fit is trustworthy, over the bracket `(ax, bx, cx)`.
///
/// Returns the located minimum and its value. The iteration cap is a
/// soft limit; the best point so far is returned when it is reached.
fn brent(
    bracket: (f64, f64, f64),
    tol: f64,
    itmax: usize,
    f: &mut dyn FnMut(f64) -> Result<f64, MorphoError>,
) -> Result<(f64, f64), MorphoError> {
    let (ax, bx, cx) = bracket;
    let mut a = ax.min(cx);
    let mut b = ax.max(cx);
    let (mut x, mut w, mut v) = (bx, bx, bx);
    let mut fx = f(x)?;
    let (mut fw, mut fv) = (fx, fx);
    let mut d: f64 = 0.0;
    let mut e: f64 = 0.0;

    for _ in 0..itmax {
        let xm = 0.5 * (a + b);
        let tol1 = tol * x.abs() + ZEPS;
        let tol2 = 2.0 * tol1;
        if (x - xm).abs() <= tol2 - 0.5 * (b - a) {
            return Ok((x, fx));
        }

        let mut golden = true;
        if e.abs() > tol1 {
            // try a parabolic step through x, w, v
            let r = (x - w) * (fx - fv);
            let mut q = (x - v) * (fx - fw);
            let mut p = (x - v) * q - (x - w) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            let etemp = e;
            e = d;
            if p.abs() < (0.5 * q * etemp).abs() && p > q * (a - x) && p < q * (b - x) {
                d = p / q;
                let u = x + d;
                if u - a < tol2 || b - u < tol2 {
                    d = tol1.copysign(xm - x);
                }
                golden = false;
            }
        }
        if golden {
            e = if x >= xm { a - x } else { b - x };
            d = CGOLD * e;
        }

        let u = if d.abs() >= tol1 {
            x + d
        } else {
            x + tol1.copysign(d)
        };
        let fu = f(u)?;
        if fu <= fx {
            if u >= x {
                a = x;
            } else {
                b = x;
            }
            v = w;
            w = x;
            x = u;
            fv = fw;
            fw = fx;
            fx = fu;
        } else {
            if u < x {
                a = u;
            } else {
                b = u;
            }
            if fu <= fw || w == x {
                v = w;
                w = u;
                fv = fw;
                fw = fu;
            } else if fu <= fv || v == x || v == w {
                v = u;
                fv = fu;
            }
        }
    }
    Ok((x, fx))
}

//
// the shared descent machinery
//

/// Constrained descent over a flat target vector.
///
/// The required methods define where the target lives and how forces
/// and constraint quantities are evaluated; the provided methods
/// implement force projection, constraint reprojection and the descent
/// algorithms. See [`ShapeOptimizer`] and [`FieldOptimizer`] for the
/// two implementations.
pub trait Optimizer {
    fn problem(&self) -> &OptimizationProblem;
    fn params(&self) -> &OptimizeParams;
    fn params_mut(&mut self) -> &mut OptimizeParams;
    fn energy_history(&self) -> &[f64];
    fn history_mut(&mut self) -> &mut Vec<f64>;
    /// Fixed entries of the flat target, excluded from motion.
    fn fixed_mask(&self) -> &fb::FixedBitSet;
    fn mesh(&self) -> MeshRef;

    /// A flat copy of the target (vertex matrix or field storage).
    fn read_target(&self) -> na::DVector<f64>;
    /// Write a flat vector back into the target.
    fn write_target(&self, data: &na::DVector<f64>);
    /// Energy of the terms this optimizer descends on.
    fn energy(&self) -> Result<f64, MorphoError>;
    /// Prefactor-weighted sum of energy gradients, unprojected.
    fn raw_force(&self) -> Result<na::DVector<f64>, MorphoError>;
    /// Whether a constraint term binds this optimizer's target.
    fn applies(&self, term: &ConstraintTerm) -> bool;
    /// Gradient of one constraint functional over the flat target.
    fn term_gradient(
        &self,
        term: &ConstraintTerm,
        sel: Option<&Selection>,
    ) -> Result<na::DVector<f64>, MorphoError>;
    /// Integrand row of one constraint functional.
    fn term_integrand(
        &self,
        term: &ConstraintTerm,
        sel: Option<&Selection>,
    ) -> Result<na::DMatrix<f64>, MorphoError>;
    /// Total of one constraint functional over its own selection.
    fn term_total(&self, term: &ConstraintTerm) -> Result<f64, MorphoError>;
    /// The independent blocks of the flat target used for pointwise
    /// projection of a local constraint, as (element id, range) pairs.
    fn blocks(&self, term: &ConstraintTerm) -> Vec<(ElementId, std::ops::Range<usize>)>;

    //
    // provided machinery
    //

    /// Global constraints binding this target.
    fn constraints(&self) -> Vec<&ConstraintTerm> {
        self.problem()
            .constraints
            .iter()
            .filter(|t| self.applies(t))
            .collect()
    }

    /// Local constraints binding this target.
    fn local_constraints(&self) -> Vec<&ConstraintTerm> {
        self.problem()
            .local_constraints
            .iter()
            .filter(|t| self.applies(t))
            .collect()
    }

    fn zero_fixed(&self, v: &mut na::DVector<f64>) {
        for i in self.fixed_mask().ones() {
            if i < v.len() {
                v[i] = 0.0;
            }
        }
    }

    /// Determine the active selection of every local constraint.
    /// One-sided constraints are restricted to the elements whose
    /// integrand has crossed the target.
    fn init_local_constraints(&self) -> Result<Vec<Option<Selection>>, MorphoError> {
        let locals = self.local_constraints();
        let mut active = Vec::with_capacity(locals.len());
        for term in locals {
            if term.onesided {
                let values = self.term_integrand(term, None)?;
                let g = term.functional.grade();
                let mesh = self.mesh();
                let mut sel = Selection::new(&mesh.borrow());
                for id in 0..values.ncols() {
                    if values[(0, id)] - term.target < self.params().ctol {
                        sel.select(g, id);
                    }
                }
                if let Some(own) = &term.selection {
                    sel = sel.intersection(&own.borrow());
                }
                active.push(Some(sel));
            } else {
                active.push(term.selection.as_ref().map(|s| s.borrow().clone()));
            }
        }
        Ok(active)
    }

    /// Pointwise Gram-Schmidt of `v` against each local constraint's
    /// gradient, block by block.
    fn subtract_local_constraints(
        &self,
        active: &[Option<Selection>],
        v: &mut na::DVector<f64>,
    ) -> Result<(), MorphoError> {
        let ctol = self.params().ctol;
        for (term, sel) in self.local_constraints().iter().zip(active) {
            let mut g = self.term_gradient(term, sel.as_ref())?;
            self.zero_fixed(&mut g);
            for (_, range) in self.blocks(term) {
                let gb = g.rows_range(range.clone());
                let gg = gb.dot(&gb);
                if gg < ctol {
                    continue;
                }
                let lambda = v.rows_range(range.clone()).dot(&gb) / gg;
                v.rows_range_mut(range).axpy(-lambda, &gb, 1.0);
            }
        }
        Ok(())
    }

    /// Project `v` off each global constraint's direction. The
    /// directions themselves have local projections removed first; no
    /// orthogonalization is performed between global constraints.
    fn subtract_constraints(
        &self,
        active: &[Option<Selection>],
        v: &mut na::DVector<f64>,
    ) -> Result<(), MorphoError> {
        for term in self.constraints() {
            let guard = term.selection.as_ref().map(|s| s.borrow());
            let mut g = self.term_gradient(term, guard.as_deref())?;
            drop(guard);
            self.subtract_local_constraints(active, &mut g)?;
            self.zero_fixed(&mut g);
            let gg = g.dot(&g);
            if gg < self.params().ctol {
                continue;
            }
            let lambda = v.dot(&g) / gg;
            v.axpy(-lambda, &g, 1.0);
        }
        Ok(())
    }

    /// The descent force with fixed entries zeroed and constraint
    /// directions projected out.
    fn total_force_with_constraints(&self) -> Result<na::DVector<f64>, MorphoError> {
        let active = self.init_local_constraints()?;
        self.constrained_force(&active)
    }

    fn constrained_force(
        &self,
        active: &[Option<Selection>],
    ) -> Result<na::DVector<f64>, MorphoError> {
        let mut frc = self.raw_force()?;
        self.zero_fixed(&mut frc);
        self.subtract_local_constraints(active, &mut frc)?;
        self.subtract_constraints(active, &mut frc)?;
        self.zero_fixed(&mut frc);
        Ok(frc)
    }

    /// Advance the target by `-h * dirn`.
    fn step(&self, h: f64, dirn: &na::DVector<f64>) {
        let mut x = self.read_target();
        x.axpy(-h, dirn, 1.0);
        self.write_target(&x);
    }

    fn energy_at(
        &self,
        x0: &na::DVector<f64>,
        dirn: &na::DVector<f64>,
        s: f64,
    ) -> Result<f64, MorphoError> {
        let mut x = x0.clone();
        x.axpy(-s, dirn, 1.0);
        self.write_target(&x);
        self.energy()
    }

    /// Newton-like restoration of local constraints: per block, solve
    /// the small Gram system of active constraint gradients against
    /// the residuals and move the block, iterating until the largest
    /// residual is below `ctol` or the step limit is reached.
    fn reproject_local_constraints(
        &self,
        active: &[Option<Selection>],
    ) -> Result<(), MorphoError> {
        let locals = self.local_constraints();
        if locals.is_empty() {
            return Ok(());
        }
        let ctol = self.params().ctol;

        for _ in 0..self.params().maxconstraintsteps {
            let mut rows = Vec::with_capacity(locals.len());
            let mut grads = Vec::with_capacity(locals.len());
            for (term, sel) in locals.iter().zip(active) {
                rows.push(self.term_integrand(term, sel.as_ref())?);
                let mut g = self.term_gradient(term, sel.as_ref())?;
                self.zero_fixed(&mut g);
                grads.push(g);
            }

            // group blocks shared between constraints so coupled
            // residuals are solved together
            let mut blockmap: BTreeMap<(usize, usize), Vec<(usize, ElementId)>> = BTreeMap::new();
            for (i, term) in locals.iter().enumerate() {
                for (el, range) in self.blocks(term) {
                    if let Some(sel) = &active[i] {
                        if !sel.is_selected(term.functional.grade(), el) {
                            continue;
                        }
                    }
                    blockmap
                        .entry((range.start, range.end))
                        .or_default()
                        .push((i, el));
                }
            }

            let mut x = self.read_target();
            let mut maxresid = 0.0f64;
            for (&(start, end), members) in &blockmap {
                let mut sys: Vec<(usize, f64)> = Vec::new();
                for &(i, el) in members {
                    let gb = grads[i].rows_range(start..end);
                    if gb.dot(&gb) < ctol {
                        continue;
                    }
                    let r = rows[i][(0, el)] - locals[i].target;
                    maxresid = maxresid.max(r.abs());
                    sys.push((i, r));
                }
                if sys.is_empty() || sys.iter().all(|(_, r)| r.abs() < ctol) {
                    continue;
                }

                let n = sys.len();
                let mut m = na::DMatrix::zeros(n, n);
                let mut rhs = na::DVector::zeros(n);
                for (a, &(i, ri)) in sys.iter().enumerate() {
                    rhs[a] = ri;
                    for (b, &(j, _)) in sys.iter().enumerate() {
                        m[(a, b)] = grads[i]
                            .rows_range(start..end)
                            .dot(&grads[j].rows_range(start..end));
                    }
                }
                let lambda = m
                    .lu()
                    .solve(&rhs)
                    .ok_or(MorphoError::SingularSystem("local constraint reprojection"))?;
                for (a, &(i, _)) in sys.iter().enumerate() {
                    let g = grads[i].rows_range(start..end).clone_owned();
                    x.rows_range_mut(start..end).axpy(-lambda[a], &g, 1.0);
                }
            }
            self.write_target(&x);

            if maxresid < ctol {
                return Ok(());
            }
        }
        warn!("local constraint reprojection hit the step limit; residual left as-is");
        Ok(())
    }

    /// Restore global constraints: solve the Gram system of constraint
    /// gradients against the residuals and move the whole target,
    /// iterating until the residual norm is below `ctol`.
    fn reproject_constraints(&self, active: &[Option<Selection>]) -> Result<(), MorphoError> {
        let cons = self.constraints();
        if cons.is_empty() {
            return Ok(());
        }
        let ctol = self.params().ctol;

        for _ in 0..self.params().maxconstraintsteps {
            let mut d = na::DVector::zeros(cons.len());
            for (i, term) in cons.iter().enumerate() {
                d[i] = term.target - self.term_total(term)?;
            }
            if d.norm() < ctol {
                return Ok(());
            }

            let mut grads = Vec::with_capacity(cons.len());
            for term in &cons {
                let guard = term.selection.as_ref().map(|s| s.borrow());
                let mut g = self.term_gradient(term, guard.as_deref())?;
                drop(guard);
                self.subtract_local_constraints(active, &mut g)?;
                self.zero_fixed(&mut g);
                grads.push(g);
            }
            let n = cons.len();
            let mut m = na::DMatrix::zeros(n, n);
            for i in 0..n {
                for j in 0..n {
                    m[(i, j)] = grads[i].dot(&grads[j]);
                }
            }
            let lambda = m
                .lu()
                .solve(&d)
                .ok_or(MorphoError::SingularSystem("constraint reprojection"))?;

            let mut x = self.read_target();
            for (i, g) in grads.iter().enumerate() {
                x.axpy(lambda[i], g, 1.0);
            }
            self.write_target(&x);
        }
        warn!("constraint reprojection hit the step limit; residual left as-is");
        Ok(())
    }

    /// Run both reprojections. A singular Gram system aborts the
    /// iteration but keeps accumulated progress; `false` tells the
    /// caller to stop descending.
    fn reproject(&self, active: &[Option<Selection>]) -> Result<bool, MorphoError> {
        for result in [
            self.reproject_local_constraints(active),
            self.reproject_constraints(active),
        ] {
            match result {
                Err(e @ MorphoError::SingularSystem(_)) => {
                    warn!("{e}; keeping current state");
                    return Ok(false);
                }
                other => other?,
            }
        }
        Ok(true)
    }

    fn converged(&self, e0: f64, e: f64) -> bool {
        (e - e0).abs() < self.params().etol * e0.abs() || e.abs() < self.params().etol
    }

    /// Fixed-stepsize descent for up to `n` iterations.
    fn relax(&mut self, n: usize) -> Result<&[f64], MorphoError> {
        let mut e0 = self.energy()?;
        if self.energy_history().is_empty() {
            self.history_mut().push(e0);
        }
        for iter in 0..n {
            let active = self.init_local_constraints()?;
            let frc = self.constrained_force(&active)?;
            let h = self.params().stepsize;
            self.step(h, &frc);
            if !self.reproject(&active)? {
                break;
            }
            let e = self.energy()?;
            self.history_mut().push(e);
            if !self.params().quiet {
                info!(
                    "Iteration {iter}: energy {e:.8e}, delta {:.4e}, stepsize {h:.4e}",
                    e - e0
                );
            }
            if self.converged(e0, e) {
                break;
            }
            e0 = e;
        }
        Ok(self.energy_history())
    }

    /// Bracket then Brent-minimize the energy along `dirn` from `x0`,
    /// clamp to the step limit and move there. The chosen step becomes
    /// the next trial stepsize.
    fn line_minimize(
        &mut self,
        x0: &na::DVector<f64>,
        dirn: &na::DVector<f64>,
        e0: f64,
    ) -> Result<f64, MorphoError> {
        let (trial, bracketmax, tol, itmax, steplimit) = {
            let p = self.params();
            (p.stepsize, p.bracketmax, p.linmintol, p.linminmax, p.steplimit)
        };
        let mut s = [0.0, trial, 2.0 * trial];
        let mut en = [e0, 0.0, 0.0];
        en[1] = self.energy_at(x0, dirn, s[1])?;
        en[2] = self.energy_at(x0, dirn, s[2])?;

        let sstar = {
            let mut eval = |t: f64| self.energy_at(x0, dirn, t);
            bracket_minimum(&mut s, &mut en, bracketmax, &mut eval)?;
            let (found, _) = brent((s[0], s[1], s[2]), tol, itmax, &mut eval)?;
            found
        };
        let sstar = sstar.min(steplimit);

        let mut x = x0.clone();
        x.axpy(-sstar, dirn, 1.0);
        self.write_target(&x);
        if sstar > 0.0 {
            self.params_mut().stepsize = sstar;
        }
        Ok(sstar)
    }

    /// Line-search descent: bracket and minimize along the constrained
    /// force each iteration. A failed bracket is non-fatal; the loop
    /// exits with the current state.
    fn linesearch(&mut self, n: usize) -> Result<&[f64], MorphoError> {
        let mut e0 = self.energy()?;
        if self.energy_history().is_empty() {
            self.history_mut().push(e0);
        }
        for iter in 0..n {
            let active = self.init_local_constraints()?;
            let frc = self.constrained_force(&active)?;
            let x0 = self.read_target();
            let step = match self.line_minimize(&x0, &frc, e0) {
                Ok(s) => s,
                Err(MorphoError::BracketingFailed(k)) => {
                    self.write_target(&x0);
                    warn!("line search could not bracket a minimum after {k} expansions");
                    break;
                }
                Err(e) => return Err(e),
            };
            if !self.reproject(&active)? {
                break;
            }
            let e = self.energy()?;
            self.history_mut().push(e);
            if !self.params().quiet {
                info!(
                    "Iteration {iter}: energy {e:.8e}, delta {:.4e}, stepsize {step:.4e}",
                    e - e0
                );
            }
            if self.converged(e0, e) {
                break;
            }
            e0 = e;
        }
        Ok(self.energy_history())
    }

    /// Conjugate gradient descent with the Hager-Zhang update,
    /// line-minimizing along each conjugate direction.
    fn conjugate_gradient(&mut self, n: usize) -> Result<&[f64], MorphoError> {
        let mut e0 = self.energy()?;
        if self.energy_history().is_empty() {
            self.history_mut().push(e0);
        }
        // previous force and direction, both in step convention
        // (the target moves along minus the stored vector)
        let mut prev: Option<(na::DVector<f64>, na::DVector<f64>)> = None;
        for iter in 0..n {
            let active = self.init_local_constraints()?;
            let frc = self.constrained_force(&active)?;

            let dirn = match &prev {
                Some((f_prev, d_prev)) => {
                    let y = f_prev - &frc;
                    let dy = d_prev.dot(&y);
                    if dy.abs() < EPS {
                        frc.clone()
                    } else {
                        let yy = y.dot(&y);
                        let mut probe = y.clone();
                        probe.axpy(-2.0 * yy / dy, d_prev, 1.0);
                        let beta = -probe.dot(&frc) / dy;
                        let mut d = frc.clone();
                        d.axpy(beta, d_prev, 1.0);
                        d
                    }
                }
                None => frc.clone(),
            };

            let x0 = self.read_target();
            let step = match self.line_minimize(&x0, &dirn, e0) {
                Ok(s) => s,
                Err(MorphoError::BracketingFailed(k)) => {
                    self.write_target(&x0);
                    warn!("line search could not bracket a minimum after {k} expansions");
                    break;
                }
                Err(e) => return Err(e),
            };
            prev = Some((frc, dirn));

            if !self.reproject(&active)? {
                break;
            }
            let e = self.energy()?;
            self.history_mut().push(e);
            if !self.params().quiet {
                info!(
                    "Iteration {iter}: energy {e:.8e}, delta {:.4e}, stepsize {step:.4e}",
                    e - e0
                );
            }
            if self.converged(e0, e) {
                break;
            }
            e0 = e;
        }
        Ok(self.energy_history())
    }
}

//
// shape optimization
//

/// Descends on the vertex positions of the problem's mesh. Constraints
/// without a field reference bind this target; local constraint
/// reprojection moves one vertex at a time.
pub struct ShapeOptimizer<'a> {
    problem: &'a OptimizationProblem,
    pub params: OptimizeParams,
    fixed: fb::FixedBitSet,
    history: Vec<f64>,
}

impl<'a> ShapeOptimizer<'a> {
    pub fn new(problem: &'a OptimizationProblem) -> Self {
        let mesh = problem.mesh();
        let len = {
            let m = mesh.borrow();
            m.dim() * m.vertex_count()
        };
        Self {
            problem,
            params: OptimizeParams::default(),
            fixed: fb::FixedBitSet::with_capacity(len),
            history: Vec::new(),
        }
    }

    /// Pin vertices in place: their force entries are zeroed and
    /// reprojection leaves them alone.
    pub fn fix_vertices(&mut self, ids: &[ElementId]) {
        let dim = self.problem.mesh().borrow().dim();
        for &v in ids {
            for k in 0..dim {
                let bit = v * dim + k;
                if bit >= self.fixed.len() {
                    self.fixed.grow(bit + 1);
                }
                self.fixed.insert(bit);
            }
        }
    }

    /// Pin every vertex in a selection.
    pub fn fix_selection(&mut self, sel: &Selection) {
        self.fix_vertices(&sel.id_list(0));
    }
}

impl Optimizer for ShapeOptimizer<'_> {
    fn problem(&self) -> &OptimizationProblem {
        self.problem
    }

    fn params(&self) -> &OptimizeParams {
        &self.params
    }

    fn params_mut(&mut self) -> &mut OptimizeParams {
        &mut self.params
    }

    fn energy_history(&self) -> &[f64] {
        &self.history
    }

    fn history_mut(&mut self) -> &mut Vec<f64> {
        &mut self.history
    }

    fn fixed_mask(&self) -> &fb::FixedBitSet {
        &self.fixed
    }

    fn mesh(&self) -> MeshRef {
        self.problem.mesh()
    }

    fn read_target(&self) -> na::DVector<f64> {
        let mesh = self.problem.mesh();
        let m = mesh.borrow();
        na::DVector::from_column_slice(m.vertex_matrix().as_slice())
    }

    fn write_target(&self, data: &na::DVector<f64>) {
        let mesh = self.problem.mesh();
        let mut m = mesh.borrow_mut();
        let (dim, nv) = (m.dim(), m.vertex_count());
        *m.vertex_matrix_mut() = na::DMatrix::from_column_slice(dim, nv, data.as_slice());
    }

    fn energy(&self) -> Result<f64, MorphoError> {
        self.problem.total_energy()
    }

    fn raw_force(&self) -> Result<na::DVector<f64>, MorphoError> {
        let mesh = self.problem.mesh();
        let mut m = mesh.borrow_mut();
        let mut frc = na::DVector::zeros(m.dim() * m.vertex_count());
        for term in &self.problem.energies {
            let guard = term.selection.as_ref().map(|s| s.borrow());
            let g = functional::map_gradient(&*term.functional, &mut m, guard.as_deref())?;
            frc.axpy(
                term.prefactor,
                &na::DVector::from_column_slice(g.as_slice()),
                1.0,
            );
        }
        Ok(frc)
    }

    fn applies(&self, term: &ConstraintTerm) -> bool {
        term.field.is_none()
    }

    fn term_gradient(
        &self,
        term: &ConstraintTerm,
        sel: Option<&Selection>,
    ) -> Result<na::DVector<f64>, MorphoError> {
        let mesh = self.problem.mesh();
        let mut m = mesh.borrow_mut();
        let g = functional::map_gradient(&*term.functional, &mut m, sel)?;
        Ok(na::DVector::from_column_slice(g.as_slice()))
    }

    fn term_integrand(
        &self,
        term: &ConstraintTerm,
        sel: Option<&Selection>,
    ) -> Result<na::DMatrix<f64>, MorphoError> {
        let mesh = self.problem.mesh();
        let mut m = mesh.borrow_mut();
        functional::map_integrand(&*term.functional, &mut m, sel)
    }

    fn term_total(&self, term: &ConstraintTerm) -> Result<f64, MorphoError> {
        let mesh = self.problem.mesh();
        let mut m = mesh.borrow_mut();
        let guard = term.selection.as_ref().map(|s| s.borrow());
        functional::total(&*term.functional, &mut m, guard.as_deref())
    }

    fn blocks(&self, term: &ConstraintTerm) -> Vec<(ElementId, std::ops::Range<usize>)> {
        // pointwise projection operates per vertex; local constraints
        // of higher grade are handled by the force projection only
        if term.functional.grade() != 0 {
            return Vec::new();
        }
        let mesh = self.problem.mesh();
        let m = mesh.borrow();
        let dim = m.dim();
        (0..m.vertex_count())
            .map(|v| (v, v * dim..(v + 1) * dim))
            .collect()
    }
}

//
// field optimization
//

/// Descends on the values of one field. Energies and constraints whose
/// field reference is this target bind it; local constraint
/// reprojection moves one element's items at a time.
pub struct FieldOptimizer<'a> {
    problem: &'a OptimizationProblem,
    target: FieldRef,
    pub params: OptimizeParams,
    fixed: fb::FixedBitSet,
    history: Vec<f64>,
}

impl<'a> FieldOptimizer<'a> {
    pub fn new(problem: &'a OptimizationProblem, target: &FieldRef) -> Self {
        let len = target.borrow().len();
        Self {
            problem,
            target: target.clone(),
            params: OptimizeParams::default(),
            fixed: fb::FixedBitSet::with_capacity(len),
            history: Vec::new(),
        }
    }

    /// Pin the field entries of every selected element.
    pub fn fix_selection(&mut self, sel: &Selection) {
        let field = self.target.borrow();
        for g in 0..field.shape().len() {
            if field.dof(g) == 0 {
                continue;
            }
            for el in sel.id_list(g) {
                for bit in field.element_range(g, el) {
                    if bit >= self.fixed.len() {
                        self.fixed.grow(bit + 1);
                    }
                    self.fixed.insert(bit);
                }
            }
        }
    }

    /// Energies whose functional consumes the target field.
    fn relevant_energies(&self) -> impl Iterator<Item = &crate::problem::EnergyTerm> + '_ {
        self.problem.energies.iter().filter(|term| {
            term.functional
                .field()
                .is_some_and(|f| Rc::ptr_eq(&f, &self.target))
        })
    }
}

impl Optimizer for FieldOptimizer<'_> {
    fn problem(&self) -> &OptimizationProblem {
        self.problem
    }

    fn params(&self) -> &OptimizeParams {
        &self.params
    }

    fn params_mut(&mut self) -> &mut OptimizeParams {
        &mut self.params
    }

    fn energy_history(&self) -> &[f64] {
        &self.history
    }

    fn history_mut(&mut self) -> &mut Vec<f64> {
        &mut self.history
    }

    fn fixed_mask(&self) -> &fb::FixedBitSet {
        &self.fixed
    }

    fn mesh(&self) -> MeshRef {
        self.problem.mesh()
    }

    fn read_target(&self) -> na::DVector<f64> {
        self.target.borrow().data().clone()
    }

    fn write_target(&self, data: &na::DVector<f64>) {
        self.target.borrow_mut().data_mut().copy_from(data);
    }

    fn energy(&self) -> Result<f64, MorphoError> {
        let mesh = self.problem.mesh();
        let mut m = mesh.borrow_mut();
        let mut sum = 0.0;
        for term in self.relevant_energies() {
            let guard = term.selection.as_ref().map(|s| s.borrow());
            sum += term.prefactor
                * functional::total(&*term.functional, &mut m, guard.as_deref())?;
        }
        Ok(sum)
    }

    fn raw_force(&self) -> Result<na::DVector<f64>, MorphoError> {
        let mesh = self.problem.mesh();
        let mut m = mesh.borrow_mut();
        let mut frc = na::DVector::zeros(self.target.borrow().len());
        for term in self.relevant_energies() {
            let guard = term.selection.as_ref().map(|s| s.borrow());
            let g = functional::map_field_gradient(
                &*term.functional,
                &mut m,
                &self.target,
                guard.as_deref(),
            )?;
            frc.axpy(term.prefactor, g.data(), 1.0);
        }
        Ok(frc)
    }

    fn applies(&self, term: &ConstraintTerm) -> bool {
        term.field
            .as_ref()
            .is_some_and(|f| Rc::ptr_eq(f, &self.target))
    }

    fn term_gradient(
        &self,
        term: &ConstraintTerm,
        sel: Option<&Selection>,
    ) -> Result<na::DVector<f64>, MorphoError> {
        let mesh = self.problem.mesh();
        let mut m = mesh.borrow_mut();
        let g = functional::map_field_gradient(&*term.functional, &mut m, &self.target, sel)?;
        Ok(g.data().clone())
    }

    fn term_integrand(
        &self,
        term: &ConstraintTerm,
        sel: Option<&Selection>,
    ) -> Result<na::DMatrix<f64>, MorphoError> {
        let mesh = self.problem.mesh();
        let mut m = mesh.borrow_mut();
        functional::map_integrand(&*term.functional, &mut m, sel)
    }

    fn term_total(&self, term: &ConstraintTerm) -> Result<f64, MorphoError> {
        let mesh = self.problem.mesh();
        let mut m = mesh.borrow_mut();
        let guard = term.selection.as_ref().map(|s| s.borrow());
        functional::total(&*term.functional, &mut m, guard.as_deref())
    }

    fn blocks(&self, term: &ConstraintTerm) -> Vec<(ElementId, std::ops::Range<usize>)> {
        let field = self.target.borrow();
        let g = term.functional.grade();
        if field.dof(g) == 0 {
            return Vec::new();
        }
        (0..field.count(g))
            .map(|el| (el, field.element_range(g, el)))
            .collect()
    }
}
