//! Models defined by systems of ordinary differential equations.
//!
//! An [`OdeModel`] is built from a mapping of first-order derivative markers
//! to expressions (`D(y, x) → a * y`) plus initial conditions for the one
//! independent variable and every dependent variable. Calling the model does
//! not evaluate expressions directly; it integrates the compiled vector
//! field with the `diffsol` BDF solver, feeding it the field's analytic
//! Jacobian with respect to the state.
//!
//! Requested time points need not be sorted and need not contain the initial
//! time. The time axis is split at t₀ into a forward branch (ascending) and
//! a backward branch (descending from t₀); both start from the known initial
//! state and move outward. The backward branch integrates in mirrored time
//! (`s = 2·t₀ − t`), with the field and its Jacobian negated, so the solver
//! always advances. Results are spliced back in the original request order,
//! and t₀ appears in the output iff it was explicitly requested.
//!
//! Solver failures surface as [`IntegrationError`] naming the offending
//! sub-range; non-finite states are rejected rather than returned.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use diffsol::error::{DiffsolError, OdeSolverError};
use diffsol::ode_solver::method::OdeSolverMethod;
use diffsol::{
    ConstantOp, LinearOp, NonLinearOp, NonLinearOpJacobian, OdeBuilder, OdeEquations,
    OdeEquationsRef, OdeSolverStopReason, Op,
};
use nalgebra::{DMatrix, DVector};
use ndarray::Array1;

use crate::compile::{compile, CompiledComponent};
use crate::errors::{BindingError, IntegrationError, ModelError};
use crate::expr::Expr;
use crate::model::{Callable, Gradient};
use crate::parse::parse_expr;
use crate::signature::{Args, CallSignature, Evaluation};
use crate::symbols::{Parameter, Symbol, Variable};

type T = f64;
type V = DVector<T>;
type M = DMatrix<T>;

/// Solver tolerances and initial step for the BDF integrator.
#[derive(Debug, Clone, Copy)]
pub struct OdeOptions {
    pub rtol: f64,
    pub atol: f64,
    pub h0: f64,
}

impl Default for OdeOptions {
    fn default() -> Self {
        Self {
            rtol: 1e-6,
            atol: 1e-8,
            h0: 1e-3,
        }
    }
}

/// A model whose components are integrated rather than evaluated.
///
/// ```no_run
/// use fitmodel::prelude::*;
///
/// let params = vec![Parameter::new("a").with_value(2.0)];
/// let model = OdeModel::parse(
///     &[("y", "x", "a")],            // dy/dx = a
///     &[("x", 0.0), ("y", 1.0)],     // y(0) = 1
///     &params,
/// )
/// .unwrap();
/// let out = model
///     .eval(&Args::new().pos(vec![-2.0, -1.0, 0.0, 1.0, 2.0]))
///     .unwrap();
/// // y = 1 + a * x
/// ```
pub struct OdeModel {
    pairs: Vec<(Symbol, Expr)>,
    dependent: Vec<Symbol>,
    indep: Symbol,
    initial: BTreeMap<String, f64>,
    signature: CallSignature,
    options: OdeOptions,
    components: OnceLock<Vec<CompiledComponent>>,
    jac_components: OnceLock<Vec<Vec<CompiledComponent>>>,
}

impl OdeModel {
    /// Builds an ODE model from derivative-marker keys and initial
    /// conditions.
    ///
    /// Every key must be a first-order derivative with respect to the same
    /// single independent variable; `initial` must cover that variable and
    /// every dependent variable.
    pub fn new(
        spec: Vec<(Variable, Expr)>,
        initial: Vec<(Variable, f64)>,
    ) -> Result<Self, ModelError> {
        if spec.is_empty() {
            return Err(ModelError::EmptySpec);
        }

        // Keys must be D(y, t)-shaped.
        for (key, _) in &spec {
            if key.order() != 1 {
                return Err(ModelError::InvalidKey(key.to_string()));
            }
        }
        let indep_names: BTreeSet<&str> =
            spec.iter().map(|(key, _)| key.wrt()[0].as_str()).collect();
        if indep_names.len() > 1 {
            return Err(ModelError::MultipleIndependentVars(
                indep_names.iter().map(|s| s.to_string()).collect(),
            ));
        }
        let indep_name = indep_names
            .into_iter()
            .next()
            .ok_or(ModelError::NoIndependentVar)?
            .to_string();
        let indep = Symbol::Var(Variable::new(indep_name.clone()));

        let mut pairs: Vec<(Symbol, Expr)> = spec
            .into_iter()
            .map(|(key, expr)| (Symbol::Var(key), expr))
            .collect();
        pairs.sort_by(|(a, _), (b, _)| a.cmp(b));
        for window in pairs.windows(2) {
            if window[0].0 == window[1].0 {
                return Err(ModelError::DuplicateKey(window[0].0.to_string()));
            }
        }

        let dependent: Vec<Symbol> = pairs
            .iter()
            .map(|(key, _)| Symbol::Var(Variable::new(key.name())))
            .collect();

        // Free symbols must be the independent variable, a state variable,
        // or a parameter.
        let mut params: BTreeSet<Symbol> = BTreeSet::new();
        for (_, expr) in &pairs {
            for sym in expr.free_symbols() {
                if sym.is_param() {
                    params.insert(sym);
                } else if sym != indep && !dependent.contains(&sym) {
                    return Err(ModelError::UnknownSymbol(sym.to_string()));
                }
            }
        }
        let params: Vec<Symbol> = params.into_iter().collect();

        let initial: BTreeMap<String, f64> = initial
            .into_iter()
            .map(|(var, value)| (var.name().to_string(), value))
            .collect();
        if !initial.contains_key(&indep_name) {
            return Err(ModelError::MissingInitial(indep_name));
        }
        for var in &dependent {
            if !initial.contains_key(var.name()) {
                return Err(ModelError::MissingInitial(var.name().to_string()));
            }
        }

        let signature = CallSignature::new(std::slice::from_ref(&indep), &params);
        Ok(Self {
            pairs,
            dependent,
            indep,
            initial,
            signature,
            options: OdeOptions::default(),
            components: OnceLock::new(),
            jac_components: OnceLock::new(),
        })
    }

    /// String front-end: `(dependent, independent, rhs)` triples.
    pub fn parse(
        equations: &[(&str, &str, &str)],
        initial: &[(&str, f64)],
        params: &[Parameter],
    ) -> Result<Self, ModelError> {
        let spec = equations
            .iter()
            .map(|(dep, indep, source)| {
                Ok((
                    Variable::new(*dep).partial(*indep),
                    parse_expr(source, params)?,
                ))
            })
            .collect::<Result<Vec<_>, ModelError>>()?;
        let initial = initial
            .iter()
            .map(|(name, value)| (Variable::new(*name), *value))
            .collect();
        Self::new(spec, initial)
    }

    /// Overrides the solver options.
    pub fn with_options(mut self, options: OdeOptions) -> Self {
        self.options = options;
        self
    }

    /// The (marker, expression) pairs in canonical state order.
    pub fn pairs(&self) -> &[(Symbol, Expr)] {
        &self.pairs
    }

    /// The kernel argument order shared by the field and its Jacobian:
    /// independent variable, state variables, parameters.
    fn kernel_args(&self) -> Vec<Symbol> {
        let mut order = vec![self.indep.clone()];
        order.extend(self.dependent.iter().cloned());
        order.extend(self.signature.params().iter().cloned());
        order
    }

    /// Compiled vector-field components in canonical state order.
    fn field_components(&self) -> Result<&Vec<CompiledComponent>, ModelError> {
        if let Some(built) = self.components.get() {
            return Ok(built);
        }
        let order = self.kernel_args();
        let built = self
            .pairs
            .iter()
            .map(|(_, expr)| compile(expr, &order))
            .collect::<Result<Vec<_>, _>>()?;
        let _ = self.components.set(built);
        Ok(self.components.get().expect("cache populated above"))
    }

    /// Compiled ∂fᵢ/∂yⱼ entries for the stiff solver.
    fn field_jacobian(&self) -> Result<&Vec<Vec<CompiledComponent>>, ModelError> {
        if let Some(built) = self.jac_components.get() {
            return Ok(built);
        }
        let order = self.kernel_args();
        let built = self
            .pairs
            .iter()
            .map(|(_, expr)| {
                self.dependent
                    .iter()
                    .map(|state| compile(&expr.derivative(state).simplify(), &order))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;
        let _ = self.jac_components.set(built);
        Ok(self.jac_components.get().expect("cache populated above"))
    }

    /// Integrates one outward branch and stores states at the requested
    /// indices.
    ///
    /// `requests` holds (request index, time) pairs whose mirrored times are
    /// non-decreasing from t₀.
    fn integrate_branch(
        &self,
        direction: f64,
        t0: f64,
        y0: &[f64],
        requests: &[(usize, f64)],
        params: &[f64],
        states: &mut [Option<V>],
    ) -> Result<(), ModelError> {
        if requests.is_empty() {
            return Ok(());
        }
        let n = self.dependent.len();
        let field = OdeField {
            components: self.field_components()?.clone(),
            jacobian: self.field_jacobian()?.clone(),
            params: params.to_vec(),
            y0: V::from_vec(y0.to_vec()),
            direction,
            t0,
        };

        let problem = OdeBuilder::<M>::new()
            .atol(vec![self.options.atol; n])
            .rtol(self.options.rtol)
            .t0(t0)
            .h0(self.options.h0)
            .p(params.to_vec())
            .build_from_eqn(field)
            .map_err(|e| IntegrationError::Setup {
                t0,
                message: e.to_string(),
            })?;
        let mut solver = problem
            .bdf::<diffsol::NalgebraLU<f64>>()
            .map_err(|e| IntegrationError::Setup {
                t0,
                message: e.to_string(),
            })?;

        let mut current = t0;
        for &(idx, t) in requests {
            let stop = t0 + direction * (t - t0);
            if stop > current {
                let from = t0 + direction * (current - t0);
                match solver.set_stop_time(stop) {
                    Ok(()) => loop {
                        match solver.step() {
                            Ok(OdeSolverStopReason::InternalTimestep) => continue,
                            Ok(OdeSolverStopReason::TstopReached) => break,
                            Ok(reason) => {
                                return Err(IntegrationError::Step {
                                    from,
                                    to: t,
                                    message: format!("unexpected stop reason: {reason:?}"),
                                }
                                .into())
                            }
                            Err(e) => {
                                return Err(IntegrationError::Step {
                                    from,
                                    to: t,
                                    message: e.to_string(),
                                }
                                .into())
                            }
                        }
                    },
                    // already sitting on the stop time
                    Err(DiffsolError::OdeSolverError(
                        OdeSolverError::StopTimeAtCurrentTime,
                    )) => {}
                    Err(e) => {
                        return Err(IntegrationError::Step {
                            from,
                            to: t,
                            message: e.to_string(),
                        }
                        .into())
                    }
                }
                current = stop;
            }
            let y = solver.state().y.clone();
            if y.iter().any(|v| !v.is_finite()) {
                return Err(IntegrationError::NonFinite { at: t }.into());
            }
            states[idx] = Some(y);
        }
        Ok(())
    }
}

impl Callable for OdeModel {
    fn signature(&self) -> &CallSignature {
        &self.signature
    }

    fn dependent_vars(&self) -> &[Symbol] {
        &self.dependent
    }

    fn eval(&self, args: &Args) -> Result<Evaluation, ModelError> {
        let bound = self.signature.bind(args)?;
        let t_values: Vec<f64> = bound[&self.indep].iter().copied().collect();
        let params: Vec<f64> = self
            .signature
            .params()
            .iter()
            .map(|p| {
                let arr = &bound[p];
                if arr.len() == 1 {
                    Ok(*arr.iter().next().expect("length checked"))
                } else {
                    Err(BindingError::NotScalar(p.to_string()))
                }
            })
            .collect::<Result<_, _>>()?;

        let t0 = self.initial[self.indep.name()];
        let y0: Vec<f64> = self
            .dependent
            .iter()
            .map(|var| self.initial[var.name()])
            .collect();

        // Split the axis at t0; both branches start at the initial state and
        // move outward.
        let mut forward: Vec<(usize, f64)> = Vec::new();
        let mut backward: Vec<(usize, f64)> = Vec::new();
        let mut states: Vec<Option<V>> = vec![None; t_values.len()];
        for (idx, &t) in t_values.iter().enumerate() {
            if t > t0 {
                forward.push((idx, t));
            } else if t < t0 {
                backward.push((idx, t));
            } else {
                // t0 was explicitly requested; report the initial state
                states[idx] = Some(V::from_vec(y0.clone()));
            }
        }
        forward.sort_by(|a, b| a.1.total_cmp(&b.1));
        backward.sort_by(|a, b| b.1.total_cmp(&a.1));

        self.integrate_branch(1.0, t0, &y0, &forward, &params, &mut states)?;
        self.integrate_branch(-1.0, t0, &y0, &backward, &params, &mut states)?;

        let values = self
            .dependent
            .iter()
            .enumerate()
            .map(|(j, _)| {
                let column: Vec<f64> = states
                    .iter()
                    .map(|s| s.as_ref().expect("all requested times integrated")[j])
                    .collect();
                Array1::from(column).into_dyn()
            })
            .collect();
        Ok(Evaluation::new(self.dependent.clone(), values))
    }
}

/// Jacobian w.r.t. the fit parameters via the finite-difference fallback;
/// the analytic machinery stops at the integrator boundary.
impl Gradient for OdeModel {}

/// Sign negation flips the vector field; initial conditions are kept.
impl std::ops::Neg for &OdeModel {
    type Output = OdeModel;

    fn neg(self) -> OdeModel {
        let spec = self
            .pairs
            .iter()
            .map(|(key, expr)| {
                let marker = Variable::new(key.name()).partial(&key.wrt()[0]);
                (marker, Expr::Neg(Box::new(expr.clone())))
            })
            .collect();
        let initial = self
            .initial
            .iter()
            .map(|(name, value)| (Variable::new(name.clone()), *value))
            .collect();
        let options = self.options;
        OdeModel::new(spec, initial)
            .expect("negation preserves the spec structure")
            .with_options(options)
    }
}

impl fmt::Display for OdeModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self
            .signature
            .params()
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        for (i, (key, expr)) in self.pairs.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{key}({}; {params}) = {expr}", self.indep)?;
        }
        Ok(())
    }
}

/// The vector field handed to diffsol, with the branch direction folded in:
/// integrating `s ≥ t₀` with `dy/ds = direction · f(t₀ + direction·(s−t₀), y)`
/// covers both branches with a solver that only moves forward.
struct OdeField {
    components: Vec<CompiledComponent>,
    jacobian: Vec<Vec<CompiledComponent>>,
    params: Vec<f64>,
    y0: V,
    direction: f64,
    t0: f64,
}

impl OdeField {
    /// Kernel input layout: (t, y..., params...).
    fn fill_inputs(&self, buf: &mut Vec<f64>, x: &V, s: f64) {
        buf.clear();
        buf.push(self.t0 + self.direction * (s - self.t0));
        buf.extend(x.iter().copied());
        buf.extend(self.params.iter().copied());
    }
}

struct OdeRhs<'a> {
    field: &'a OdeField,
}

impl Op for OdeRhs<'_> {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.field.y0.len()
    }
    fn nout(&self) -> usize {
        self.field.y0.len()
    }
    fn nparams(&self) -> usize {
        self.field.params.len()
    }
}

impl NonLinearOp for OdeRhs<'_> {
    fn call_inplace(&self, x: &V, s: T, y: &mut V) {
        let mut buf = Vec::with_capacity(1 + self.field.y0.len() + self.field.params.len());
        self.field.fill_inputs(&mut buf, x, s);
        for (i, component) in self.field.components.iter().enumerate() {
            y[i] = self.field.direction * component.eval_scalar(&buf);
        }
    }
}

impl NonLinearOpJacobian for OdeRhs<'_> {
    fn jac_mul_inplace(&self, x: &V, s: T, v: &V, y: &mut V) {
        let mut buf = Vec::with_capacity(1 + self.field.y0.len() + self.field.params.len());
        self.field.fill_inputs(&mut buf, x, s);
        for (i, row) in self.field.jacobian.iter().enumerate() {
            let mut acc = 0.0;
            for (j, entry) in row.iter().enumerate() {
                acc += entry.eval_scalar(&buf) * v[j];
            }
            y[i] = self.field.direction * acc;
        }
    }
}

struct OdeMass {
    nstates: usize,
    nparams: usize,
}

impl Op for OdeMass {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        self.nstates
    }
    fn nparams(&self) -> usize {
        self.nparams
    }
}

impl LinearOp for OdeMass {
    fn gemv_inplace(&self, _x: &V, _t: T, _beta: T, _y: &mut V) {}
}

struct OdeInit {
    y0: V,
    nparams: usize,
}

impl Op for OdeInit {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.y0.len()
    }
    fn nout(&self) -> usize {
        self.y0.len()
    }
    fn nparams(&self) -> usize {
        self.nparams
    }
}

impl ConstantOp for OdeInit {
    fn call_inplace(&self, _t: T, y: &mut V) {
        y.copy_from(&self.y0);
    }
}

struct OdeRoot {
    nstates: usize,
    nparams: usize,
}

impl Op for OdeRoot {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        self.nstates
    }
    fn nparams(&self) -> usize {
        self.nparams
    }
}

impl NonLinearOp for OdeRoot {
    fn call_inplace(&self, _x: &V, _t: T, _y: &mut V) {}
}

struct OdeOut {
    nstates: usize,
    nparams: usize,
}

impl Op for OdeOut {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        self.nstates
    }
    fn nparams(&self) -> usize {
        self.nparams
    }
}

impl NonLinearOp for OdeOut {
    fn call_inplace(&self, _x: &V, _t: T, _y: &mut V) {}
}

impl Op for OdeField {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.y0.len()
    }
    fn nout(&self) -> usize {
        self.y0.len()
    }
    fn nparams(&self) -> usize {
        self.params.len()
    }
}

impl<'b> OdeEquationsRef<'b> for OdeField {
    type Rhs = OdeRhs<'b>;
    type Mass = OdeMass;
    type Init = OdeInit;
    type Root = OdeRoot;
    type Out = OdeOut;
}

impl OdeEquations for OdeField {
    fn rhs(&self) -> OdeRhs<'_> {
        OdeRhs { field: self }
    }

    fn mass(&self) -> Option<OdeMass> {
        None
    }

    fn init(&self) -> OdeInit {
        OdeInit {
            y0: self.y0.clone(),
            nparams: self.params.len(),
        }
    }

    fn root(&self) -> Option<OdeRoot> {
        None
    }

    fn out(&self) -> Option<OdeOut> {
        None
    }

    fn get_params(&self, p: &mut V) {
        p.copy_from(&V::from_vec(self.params.clone()));
    }

    fn set_params(&mut self, p: &V) {
        self.params = p.iter().cloned().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn constant_slope() -> OdeModel {
        // dy/dx = a, y(0) = 1  =>  y = 1 + a*x
        let params = vec![Parameter::new("a").with_value(2.0)];
        OdeModel::parse(&[("y", "x", "a")], &[("x", 0.0), ("y", 1.0)], &params).unwrap()
    }

    #[test]
    fn round_trip_through_the_initial_time() {
        let model = constant_slope();
        let out = model
            .eval(&Args::new().pos(vec![-2.0, -1.0, 0.0, 1.0, 2.0]).set("a", 2.0))
            .unwrap();
        let y = out.get("y").unwrap();
        assert_eq!(y.len(), 5);
        for (value, expected) in y.iter().zip([-3.0, -1.0, 1.0, 3.0, 5.0]) {
            assert_abs_diff_eq!(*value, expected, epsilon = 1e-4);
        }
    }

    #[test]
    fn initial_time_never_injected_unrequested() {
        let model = constant_slope();
        let out = model
            .eval(&Args::new().pos(vec![-2.0, -1.0, 1.0, 2.0]).set("a", 2.0))
            .unwrap();
        let y = out.get("y").unwrap();
        assert_eq!(y.len(), 4);
        for (value, expected) in y.iter().zip([-3.0, -1.0, 3.0, 5.0]) {
            assert_abs_diff_eq!(*value, expected, epsilon = 1e-4);
        }
    }

    #[test]
    fn request_order_is_preserved() {
        let model = constant_slope();
        let out = model
            .eval(&Args::new().pos(vec![2.0, -1.0, 0.5]).set("a", 2.0))
            .unwrap();
        let y = out.get("y").unwrap();
        for (value, expected) in y.iter().zip([5.0, -1.0, 2.0]) {
            assert_abs_diff_eq!(*value, expected, epsilon = 1e-4);
        }
    }

    #[test]
    fn exponential_decay_matches_closed_form() {
        // dy/dx = -a*y, y(0) = 1  =>  y = exp(-a*x)
        let params = vec![Parameter::new("a")];
        let model = OdeModel::parse(
            &[("y", "x", "0 - a * y")],
            &[("x", 0.0), ("y", 1.0)],
            &params,
        )
        .unwrap();
        let xs = [0.5, 1.0, 2.0];
        let a = 1.3;
        let out = model.eval(&Args::new().pos(xs.to_vec()).set("a", a)).unwrap();
        let y = out.get("y").unwrap();
        for (value, x) in y.iter().zip(xs) {
            assert_abs_diff_eq!(*value, (-a * x).exp(), epsilon = 1e-4);
        }
    }

    #[test]
    fn coupled_system_integrates_in_canonical_order() {
        // du/dt = v, dv/dt = -u  =>  u = cos t, v = -sin t  (u(0)=1, v(0)=0)
        let model = OdeModel::parse(
            &[("u", "t", "v"), ("v", "t", "0 - u")],
            &[("t", 0.0), ("u", 1.0), ("v", 0.0)],
            &[],
        )
        .unwrap();
        let ts = [0.5, 1.0];
        let out = model.eval(&Args::new().pos(ts.to_vec())).unwrap();
        for (value, t) in out.get("u").unwrap().iter().zip(ts) {
            assert_abs_diff_eq!(*value, t.cos(), epsilon = 1e-3);
        }
        for (value, t) in out.get("v").unwrap().iter().zip(ts) {
            assert_abs_diff_eq!(*value, -t.sin(), epsilon = 1e-3);
        }
    }

    #[test]
    fn finite_difference_jacobian_of_integrated_model() {
        // ∂y/∂a of y = 1 + a*x is x.
        let model = constant_slope();
        let jac = model
            .eval_jacobian(&Args::new().pos(vec![0.5, 1.0, 2.0]).set("a", 2.0))
            .unwrap();
        let dy = jac.get("y").unwrap();
        for (k, x) in [0.5, 1.0, 2.0].into_iter().enumerate() {
            assert_abs_diff_eq!(dy[[0, k]], x, epsilon = 1e-3);
        }
    }

    #[test]
    fn structural_validation_is_eager() {
        // key must be a first-order derivative
        let bad_key = OdeModel::new(
            vec![(Variable::new("y"), Expr::Const(1.0))],
            vec![(Variable::new("y"), 1.0)],
        );
        assert!(matches!(bad_key, Err(ModelError::InvalidKey(_))));

        // two distinct independent variables
        let params = vec![Parameter::new("a")];
        let multi = OdeModel::parse(
            &[("y", "x", "a"), ("z", "t", "a")],
            &[("x", 0.0), ("y", 1.0), ("z", 1.0)],
            &params,
        );
        assert!(matches!(multi, Err(ModelError::MultipleIndependentVars(_))));

        // missing initial condition
        let missing = OdeModel::parse(&[("y", "x", "a")], &[("x", 0.0)], &params);
        assert!(matches!(missing, Err(ModelError::MissingInitial(_))));

        // unknown symbol in the field
        let unknown = OdeModel::parse(
            &[("y", "x", "a * w")],
            &[("x", 0.0), ("y", 1.0)],
            &params,
        );
        assert!(matches!(unknown, Err(ModelError::UnknownSymbol(_))));
    }

    #[test]
    fn negated_field_flips_the_solution() {
        let model = constant_slope();
        let negated = -&model;
        let out = negated
            .eval(&Args::new().pos(vec![1.0]).set("a", 2.0))
            .unwrap();
        // dy/dx = -a  =>  y = 1 - a*x
        assert_abs_diff_eq!(out.get("y").unwrap()[[0]], -1.0, epsilon = 1e-4);
    }
}
