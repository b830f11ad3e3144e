//! Analytic differentiation of models.
//!
//! The Jacobian of a model is itself a model: its keys are derivative
//! markers `D(var, param)` and its expressions are the symbolic partials.
//! Because it is a model, the dependency machinery handles evaluation order
//! and the Hessian falls out by applying the same derivation to the Jacobian
//! model.
//!
//! The difficulty sits with interdependent variables. For
//! `{y: a*x, z: y² + a}` the naive partial ∂z/∂a = 1 is wrong; the chain
//! rule must carry `∂z/∂y · ∂y/∂a`. The derivation therefore runs in three
//! steps:
//!
//! 1. *Promote*: every key becomes an explicit function of its direct
//!    dependencies, recursively, so `z` reads `z(y(x, a), a)` and ordinary
//!    symbolic differentiation applies the chain rule structurally.
//! 2. *Differentiate* each promoted expression w.r.t. each parameter. Chain
//!    rule factors stay as unevaluated partials of the function forms.
//! 3. *Restore*: function forms fold back to plain symbols and unevaluated
//!    partials become derivative-marker symbols with accumulated wrt lists.
//!    A repeated partial extends the marker (`D(y, a)` → `D(y, a, b)`);
//!    nothing ever differentiates an already-differentiated result, which is
//!    the failure mode that silently evaluates repeated partials to zero.
//!
//! The original components ride along inside the derivative model so marker
//! expressions can consume interdependent values, and so the numeric
//! assembly knows each component's data shape. Markers that vanished
//! symbolically evaluate to exact zeros and broadcast to the owning
//! component's shape.
//!
//! [`finite_difference`] provides the drop-in numeric fallback used as the
//! default [`Gradient`] implementation: a 5-point central difference with a
//! configurable step scaled by parameter magnitude (floored near zero), at
//! six model evaluations per parameter.

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::{ArrayD, ArrayViewD, Axis};

use crate::broadcast::{broadcast_shape, scalar};
use crate::errors::{BindingError, ModelError};
use crate::expr::Expr;
use crate::model::{Callable, Gradient, Hessian, Model, ModelSpec};
use crate::signature::{Args, Evaluation};
use crate::symbols::{arg_cmp, Symbol};

/// Turns every key of the model into a function application of its direct
/// dependencies, recursively, in topological order.
///
/// For `{y: a*x, z: y² + a}` this yields `{y: y(x, a), z: z(y(x, a), a)}`.
/// Arguments are ordered variables first, then parameters, alphabetical
/// within each group.
fn vars_as_functions(model: &Model) -> BTreeMap<Symbol, Expr> {
    let mut functions: BTreeMap<Symbol, Expr> = BTreeMap::new();
    for sym in &model.partition.ordered {
        if let Some(deps) = model.connectivity.get(sym) {
            let mut deps: Vec<Symbol> = deps.iter().cloned().collect();
            deps.sort_by(arg_cmp);
            let args = deps
                .iter()
                .map(|d| {
                    functions
                        .get(d)
                        .cloned()
                        .unwrap_or_else(|| Expr::Sym(d.clone()))
                })
                .collect();
            functions.insert(sym.clone(), Expr::Apply(sym.clone(), args));
        }
    }
    functions
}

/// Builds the Jacobian of `model` as a new model.
///
/// Keys are `D(key, param)` markers for every (key, parameter) pair, with the
/// original components riding along. Applying this to a Jacobian model
/// yields the Hessian, keyed `D(key, param1, param2)`.
pub fn jacobian_of(model: &Model) -> Result<Model, ModelError> {
    let functions = vars_as_functions(model);
    let mut out: BTreeMap<Symbol, Expr> = BTreeMap::new();
    for (key, expr) in model.spec().pairs() {
        let promoted = expr.substitute(&functions);
        for param in model.params() {
            let target = key.partial(param.name());
            let derived = promoted.derivative(param).restored().simplify();
            out.insert(target, derived);
        }
    }
    // The original components ride along: marker expressions consume
    // interdependent values, and assembly reads each component's shape.
    for (key, expr) in model.spec().pairs() {
        out.insert(key.clone(), expr.clone());
    }
    Model::new(ModelSpec::from_symbol_pairs(out.into_iter().collect())?)
}

impl Model {
    /// The Jacobian model, derived once and cached.
    ///
    /// The cache is idempotent: racing initializers derive equal models and
    /// the first write wins.
    pub fn jacobian_model(&self) -> Result<Arc<Model>, ModelError> {
        if let Some(cached) = self.jacobian.get() {
            return Ok(Arc::clone(cached));
        }
        let built = Arc::new(jacobian_of(self)?);
        let _ = self.jacobian.set(Arc::clone(&built));
        Ok(Arc::clone(self.jacobian.get().unwrap_or(&built)))
    }

    /// The Hessian model: the Jacobian of the Jacobian model.
    pub fn hessian_model(&self) -> Result<Arc<Model>, ModelError> {
        if let Some(cached) = self.hessian.get() {
            return Ok(Arc::clone(cached));
        }
        let jacobian = self.jacobian_model()?;
        let built = Arc::new(jacobian_of(&jacobian)?);
        let _ = self.hessian.set(Arc::clone(&built));
        Ok(Arc::clone(self.hessian.get().unwrap_or(&built)))
    }

    /// The symbolic partials of every component w.r.t. every parameter, row
    /// per component, column per parameter.
    pub fn jacobian_exprs(&self) -> Result<Vec<Vec<Expr>>, ModelError> {
        let jacobian = self.jacobian_model()?;
        Ok(self
            .dependent_vars()
            .iter()
            .map(|var| {
                self.params()
                    .iter()
                    .map(|p| {
                        jacobian
                            .spec()
                            .get(&var.partial(p.name()))
                            .cloned()
                            .unwrap_or(Expr::Const(0.0))
                    })
                    .collect()
            })
            .collect())
    }
}

/// Broadcasts gradient columns against the owning component's shape and
/// stacks them along a new leading axis.
fn stack_columns(
    cols: &[ArrayD<f64>],
    base_shape: &[usize],
) -> Result<ArrayD<f64>, ModelError> {
    if cols.is_empty() {
        let mut shape = vec![0usize];
        shape.extend_from_slice(base_shape);
        return Ok(ArrayD::zeros(shape));
    }
    let mut shapes: Vec<&[usize]> = cols.iter().map(|c| c.shape()).collect();
    shapes.push(base_shape);
    let common = broadcast_shape(&shapes)?;
    let views: Vec<ArrayViewD<f64>> = cols
        .iter()
        .map(|c| {
            c.broadcast(common.as_slice()).ok_or_else(|| {
                BindingError::ShapeMismatch(shapes.iter().map(|s| s.to_vec()).collect())
            })
        })
        .collect::<Result<_, _>>()?;
    ndarray::stack(Axis(0), &views)
        .map_err(|_| {
            BindingError::ShapeMismatch(shapes.iter().map(|s| s.to_vec()).collect()).into()
        })
}

impl Gradient for Model {
    /// Analytic Jacobian: evaluates the Jacobian model with the same inputs
    /// and assembles `(n_params, *shape)` per component, treating
    /// symbolically-vanished partials as exact zeros.
    fn eval_jacobian(&self, args: &Args) -> Result<Evaluation, ModelError> {
        let jacobian = self.jacobian_model()?;
        let ans = jacobian.eval(args)?;
        let mut values = Vec::with_capacity(self.dependent_vars().len());
        for var in self.dependent_vars() {
            let base = ans
                .get_sym(var)
                .ok_or_else(|| ModelError::UnknownSymbol(var.to_string()))?;
            let cols: Vec<ArrayD<f64>> = self
                .params()
                .iter()
                .map(|p| {
                    ans.get_sym(&var.partial(p.name()))
                        .cloned()
                        .unwrap_or_else(|| scalar(0.0))
                })
                .collect();
            values.push(stack_columns(&cols, base.shape())?);
        }
        Ok(Evaluation::new(self.dependent_vars().to_vec(), values))
    }
}

impl Hessian for Model {
    /// Analytic Hessian: `(n_params, n_params, *shape)` per component.
    fn eval_hessian(&self, args: &Args) -> Result<Evaluation, ModelError> {
        let hessian = self.hessian_model()?;
        let ans = hessian.eval(args)?;
        let params = self.params();
        let mut values = Vec::with_capacity(self.dependent_vars().len());
        for var in self.dependent_vars() {
            let base = ans
                .get_sym(var)
                .ok_or_else(|| ModelError::UnknownSymbol(var.to_string()))?;

            let entries: Vec<Vec<ArrayD<f64>>> = params
                .iter()
                .map(|p1| {
                    params
                        .iter()
                        .map(|p2| {
                            ans.get_sym(&var.partial(p1.name()).partial(p2.name()))
                                .cloned()
                                .unwrap_or_else(|| scalar(0.0))
                        })
                        .collect()
                })
                .collect();

            // one common data shape across the whole matrix
            let mut shapes: Vec<&[usize]> =
                entries.iter().flatten().map(|e| e.shape()).collect();
            shapes.push(base.shape());
            let common = broadcast_shape(&shapes)?;

            let rows: Vec<ArrayD<f64>> = entries
                .iter()
                .map(|row| {
                    let views: Vec<ArrayViewD<f64>> = row
                        .iter()
                        .map(|e| {
                            e.broadcast(common.as_slice()).ok_or_else(|| {
                                BindingError::ShapeMismatch(vec![e.shape().to_vec()])
                            })
                        })
                        .collect::<Result<_, _>>()?;
                    ndarray::stack(Axis(0), &views).map_err(|_| {
                        ModelError::from(BindingError::ShapeMismatch(vec![common.clone()]))
                    })
                })
                .collect::<Result<_, ModelError>>()?;

            if rows.is_empty() {
                let mut shape = vec![0usize, 0usize];
                shape.extend_from_slice(base.shape());
                values.push(ArrayD::zeros(shape));
            } else {
                let views: Vec<ArrayViewD<f64>> = rows.iter().map(|r| r.view()).collect();
                let stacked = ndarray::stack(Axis(0), &views).map_err(|_| {
                    ModelError::from(BindingError::ShapeMismatch(vec![common.clone()]))
                })?;
                values.push(stacked);
            }
        }
        Ok(Evaluation::new(self.dependent_vars().to_vec(), values))
    }
}

/// Step configuration for the finite-difference fallback.
#[derive(Debug, Clone, Copy)]
pub struct FdStep {
    /// Relative step size; scaled by each parameter's magnitude unless the
    /// parameter sits near zero.
    pub dx: f64,
}

impl Default for FdStep {
    fn default() -> Self {
        Self { dx: 1e-8 }
    }
}

/// 5-point central finite-difference approximation of the Jacobian.
///
/// Drop-in for the analytic evaluator: same calling convention, same
/// `(n_params, *shape)` output layout, six model evaluations per parameter.
pub fn finite_difference<M: Callable + ?Sized>(
    model: &M,
    args: &Args,
    step: FdStep,
) -> Result<Evaluation, ModelError> {
    let bound = model.signature().bind(args)?;
    let params: Vec<Symbol> = model.params().to_vec();

    if params.is_empty() {
        let basis = model.eval(args)?;
        let values = basis
            .values()
            .iter()
            .map(|comp| {
                let mut shape = vec![0usize];
                shape.extend_from_slice(comp.shape());
                ArrayD::zeros(shape)
            })
            .collect();
        return Ok(Evaluation::new(model.dependent_vars().to_vec(), values));
    }

    let param_vals: Vec<f64> = params
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

    let eval_at = |pvals: &[f64]| -> Result<Evaluation, ModelError> {
        let mut call = Args::new();
        for var in model.independent_vars() {
            call = call.set(var.name(), bound[var].clone());
        }
        for (p, v) in params.iter().zip(pvals) {
            call = call.set(p.name(), *v);
        }
        model.eval(&call)
    };

    let n_params = params.len();
    let mut out: Option<Vec<ArrayD<f64>>> = None;
    for (i, &pval) in param_vals.iter().enumerate() {
        for (order, factor) in [(1.0, 1.5), (2.0, -0.6), (3.0, 0.1)] {
            let mut h = step.dx * order;
            if pval.abs() >= 1e-7 {
                h *= pval;
            }
            let mut up_p = param_vals.clone();
            up_p[i] += h;
            let mut down_p = param_vals.clone();
            down_p[i] -= h;
            let up = eval_at(&up_p)?;
            let down = eval_at(&down_p)?;

            let grads = out.get_or_insert_with(|| {
                up.values()
                    .iter()
                    .map(|comp| {
                        let mut shape = vec![n_params];
                        shape.extend_from_slice(comp.shape());
                        ArrayD::zeros(shape)
                    })
                    .collect()
            });
            for (comp_idx, (u, d)) in
                up.values().iter().zip(down.values()).enumerate()
            {
                let delta = (u - d) * (factor / (2.0 * h));
                let mut lane = grads[comp_idx].index_axis_mut(Axis(0), i);
                lane += &delta;
            }
        }
    }
    let values = out.expect("at least one parameter");
    Ok(Evaluation::new(model.dependent_vars().to_vec(), values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::parameters;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    fn linear() -> Model {
        let params = parameters("a, b");
        let spec = ModelSpec::parse(&[("y", "a * x + b")], &params).unwrap();
        Model::new(spec).unwrap()
    }

    #[test]
    fn linear_jacobian_is_x_and_one() {
        let model = linear();
        let jac = model
            .eval_jacobian(
                &Args::new()
                    .pos(vec![1.0, 2.0, 3.0])
                    .set("a", 5.0)
                    .set("b", -2.0),
            )
            .unwrap();
        let dy = jac.get("y").unwrap();
        assert_eq!(dy.shape(), &[2, 3]);
        // ∂y/∂a = x, ∂y/∂b = 1, independent of a and b
        assert_eq!(dy.index_axis(Axis(0), 0), arr1(&[1.0, 2.0, 3.0]).into_dyn());
        assert_eq!(dy.index_axis(Axis(0), 1), arr1(&[1.0, 1.0, 1.0]).into_dyn());
    }

    #[test]
    fn linear_second_partials_are_exactly_zero() {
        let model = linear();
        let hess = model
            .eval_hessian(&Args::new().pos(vec![1.0, 2.0]).set("a", 3.0).set("b", 4.0))
            .unwrap();
        let hy = hess.get("y").unwrap();
        assert_eq!(hy.shape(), &[2, 2, 2]);
        assert!(hy.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn chain_rule_through_interdependent_variable() {
        // {y: a*x, z: y^2 + a}: ∂z/∂a must be 2*y*x + 1, not 1.
        let params = parameters("a");
        let spec =
            ModelSpec::parse(&[("y", "a * x"), ("z", "y^2 + a")], &params).unwrap();
        let model = Model::new(spec).unwrap();

        let a = 1.7;
        let xs = [0.5, 1.0, 2.0, 4.0];
        let jac = model
            .eval_jacobian(&Args::new().pos(xs.to_vec()).set("a", a))
            .unwrap();
        let dz = jac.get("z").unwrap();
        for (k, &x) in xs.iter().enumerate() {
            let y = a * x;
            assert_abs_diff_eq!(dz[[0, k]], 2.0 * y * x + 1.0, epsilon = 1e-10);
        }
        // and ∂y/∂a = x
        let dy = jac.get("y").unwrap();
        for (k, &x) in xs.iter().enumerate() {
            assert_abs_diff_eq!(dy[[0, k]], x, epsilon = 1e-12);
        }
    }

    #[test]
    fn repeated_partial_does_not_collapse_to_zero() {
        // ∂²z/∂a² for {y: a*x, z: y^2 + a} is 2x².
        let params = parameters("a");
        let spec =
            ModelSpec::parse(&[("y", "a * x"), ("z", "y^2 + a")], &params).unwrap();
        let model = Model::new(spec).unwrap();

        let xs = [0.5, 1.0, 3.0];
        let hess = model
            .eval_hessian(&Args::new().pos(xs.to_vec()).set("a", 0.8))
            .unwrap();
        let hz = hess.get("z").unwrap();
        for (k, &x) in xs.iter().enumerate() {
            assert_abs_diff_eq!(hz[[0, 0, k]], 2.0 * x * x, epsilon = 1e-10);
        }
    }

    #[test]
    fn jacobian_model_contains_marker_components() {
        let model = linear();
        let jacobian = model.jacobian_model().unwrap();
        // two markers plus the original component
        assert_eq!(jacobian.dependent_vars().len(), 3);
        let exprs = model.jacobian_exprs().unwrap();
        assert_eq!(exprs.len(), 1);
        assert_eq!(exprs[0].len(), 2);
    }

    #[test]
    fn finite_difference_converges_to_analytic() {
        let params = parameters("a, b");
        let spec = ModelSpec::parse(&[("y", "a * exp(b * x)")], &params).unwrap();
        let model = Model::new(spec).unwrap();
        let args = Args::new()
            .pos(vec![0.1, 0.4, 0.9])
            .set("a", 1.3)
            .set("b", 0.7);

        let analytic = model.eval_jacobian(&args).unwrap();
        // steps chosen inside the truncation-dominated regime
        let coarse = finite_difference(&model, &args, FdStep { dx: 0.2 }).unwrap();
        let fine = finite_difference(&model, &args, FdStep { dx: 0.02 }).unwrap();

        let err = |fd: &Evaluation| -> f64 {
            fd.get("y")
                .unwrap()
                .iter()
                .zip(analytic.get("y").unwrap().iter())
                .map(|(f, a)| (f - a).abs())
                .fold(0.0, f64::max)
        };
        assert!(err(&fine) < err(&coarse));
        assert!(err(&fine) < 1e-4);
    }

    #[test]
    fn scalar_partials_broadcast_to_data_shape() {
        // ∂y/∂b = 1 is a scalar symbolically; it must broadcast to x's shape.
        let model = linear();
        let jac = model
            .eval_jacobian(&Args::new().pos(vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        assert_eq!(jac.get("y").unwrap().shape(), &[2, 4]);
    }
}
