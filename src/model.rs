//! Symbolic models: specs, capability traits and the core [`Model`] type.
//!
//! A [`ModelSpec`] maps dependent variables to expressions. [`Model`]
//! resolves the spec's dependency graph eagerly at construction (cycle
//! detection included), derives the call signature, and compiles each
//! component lazily on first evaluation. Evaluation walks the topological
//! order so that interdependent variables are consumed as *computed* values,
//! never as symbolic placeholders: for `{y: a*x, z: y² + a}` the `z`
//! component receives the freshly evaluated `y`.
//!
//! Capabilities are composable traits rather than an inheritance chain:
//!
//! - [`Callable`]: has a signature and can be evaluated
//! - [`Gradient`]: adds `eval_jacobian`; the default implementation is the
//!   finite-difference fallback, so any callable model kind is usable by
//!   gradient-based optimizers
//! - [`Hessian`]: adds `eval_hessian`
//!
//! [`Model`] implements all three with analytic derivatives (see the
//! `deriv` module); the ODE and numeric-component model kinds implement
//! `Callable` and inherit the finite-difference gradient.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use colored::Colorize;
use itertools::Itertools;
use ndarray::ArrayD;
use rayon::prelude::*;

use crate::broadcast::atleast_1d;
use crate::compile::{compile, CompiledComponent};
use crate::errors::ModelError;
use crate::expr::Expr;
use crate::graph::{connectivity_of, Connectivity, Partition};
use crate::parse::parse_expr;
use crate::signature::{Args, CallSignature, Evaluation};
use crate::symbols::{arg_cmp, Parameter, Symbol, Variable};

/// A mapping of dependent variables to expressions, canonicalized by sorted
/// key order.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pairs: Vec<(Symbol, Expr)>,
}

impl ModelSpec {
    /// Builds a spec from (variable, expression) pairs.
    pub fn new(
        components: impl IntoIterator<Item = (Variable, Expr)>,
    ) -> Result<Self, ModelError> {
        Self::from_symbol_pairs(
            components
                .into_iter()
                .map(|(v, e)| (Symbol::Var(v), e))
                .collect(),
        )
    }

    /// Builds a spec from string components, classifying identifiers against
    /// the declared parameters.
    ///
    /// ```
    /// # use fitmodel::model::ModelSpec;
    /// # use fitmodel::symbols::parameters;
    /// let params = parameters("a, b");
    /// let spec = ModelSpec::parse(&[("y", "a * x + b")], &params).unwrap();
    /// ```
    pub fn parse(
        components: &[(&str, &str)],
        params: &[Parameter],
    ) -> Result<Self, ModelError> {
        let pairs = components
            .iter()
            .map(|(name, source)| {
                Ok((
                    Symbol::Var(Variable::new(*name)),
                    parse_expr(source, params)?,
                ))
            })
            .collect::<Result<Vec<_>, ModelError>>()?;
        Self::from_symbol_pairs(pairs)
    }

    /// Builds a spec whose keys may be derivative markers; used by the
    /// differentiation engine.
    pub(crate) fn from_symbol_pairs(
        mut pairs: Vec<(Symbol, Expr)>,
    ) -> Result<Self, ModelError> {
        if pairs.is_empty() {
            return Err(ModelError::EmptySpec);
        }
        for (key, _) in &pairs {
            if key.is_param() {
                return Err(ModelError::InvalidKey(key.to_string()));
            }
        }
        pairs.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (left, right) in pairs.iter().tuple_windows() {
            if left.0 == right.0 {
                return Err(ModelError::DuplicateKey(left.0.to_string()));
            }
        }
        Ok(Self { pairs })
    }

    /// The (key, expression) pairs in sorted key order.
    pub fn pairs(&self) -> &[(Symbol, Expr)] {
        &self.pairs
    }

    /// The expression for a dependent symbol.
    pub fn get(&self, sym: &Symbol) -> Option<&Expr> {
        self.pairs
            .iter()
            .find(|(key, _)| key == sym)
            .map(|(_, expr)| expr)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// An evaluable model with a declared calling convention.
pub trait Callable {
    /// The model's call signature: independent variables, then parameters.
    fn signature(&self) -> &CallSignature;

    /// Ordered dependent variables; one output array per entry.
    fn dependent_vars(&self) -> &[Symbol];

    /// Evaluates the model; one array (at least one-dimensional) per
    /// dependent variable, in sorted order.
    fn eval(&self, args: &Args) -> Result<Evaluation, ModelError>;

    /// Ordered independent variables.
    fn independent_vars(&self) -> &[Symbol] {
        self.signature().independent()
    }

    /// Ordered parameters.
    fn params(&self) -> &[Symbol] {
        self.signature().params()
    }

    /// (min, max) bounds aligned with [`Callable::params`].
    ///
    /// Fixed parameters collapse to a degenerate interval around their value.
    fn bounds(&self) -> Vec<(Option<f64>, Option<f64>)> {
        self.params()
            .iter()
            .map(|s| s.as_param().map(Parameter::bound).unwrap_or((None, None)))
            .collect()
    }

    /// The subset of parameters free to be optimized.
    fn free_params(&self) -> Vec<Symbol> {
        self.params()
            .iter()
            .filter(|s| s.as_param().map(|p| !p.fixed).unwrap_or(true))
            .cloned()
            .collect()
    }
}

/// A callable model with a first-derivative evaluator.
///
/// The default implementation is the 5-point central finite-difference
/// approximation; model kinds with analytic Jacobians override it.
pub trait Gradient: Callable {
    /// Evaluates ∂component/∂parameter for every (component, parameter)
    /// pair; one `(n_params, *shape)` array per dependent variable.
    fn eval_jacobian(&self, args: &Args) -> Result<Evaluation, ModelError> {
        crate::deriv::finite_difference(self, args, crate::deriv::FdStep::default())
    }
}

/// A gradient model with a second-derivative evaluator.
pub trait Hessian: Gradient {
    /// Evaluates second partials; one `(n_params, n_params, *shape)` array
    /// per dependent variable.
    fn eval_hessian(&self, args: &Args) -> Result<Evaluation, ModelError>;
}

/// A symbolic model: compiled evaluation plus analytic derivatives.
///
/// ```
/// use fitmodel::prelude::*;
///
/// let params = parameters("a, b");
/// let spec = ModelSpec::parse(&[("y", "a * x + b")], &params).unwrap();
/// let model = Model::new(spec).unwrap();
///
/// let out = model
///     .eval(&Args::new().pos(vec![0.0, 1.0, 2.0]).set("a", 2.0).set("b", 1.0))
///     .unwrap();
/// assert_eq!(out.get("y").unwrap().as_slice().unwrap(), &[1.0, 3.0, 5.0]);
/// ```
pub struct Model {
    pub(crate) spec: ModelSpec,
    pub(crate) connectivity: Connectivity,
    pub(crate) partition: Partition,
    pub(crate) signature: CallSignature,
    components: OnceLock<BTreeMap<Symbol, CompiledComponent>>,
    pub(crate) jacobian: OnceLock<Arc<Model>>,
    pub(crate) hessian: OnceLock<Arc<Model>>,
}

impl Model {
    /// Builds a model, resolving and validating the dependency graph.
    ///
    /// Fails only on structurally invalid specs; compilation is deferred to
    /// the first evaluation.
    pub fn new(spec: ModelSpec) -> Result<Self, ModelError> {
        let connectivity = connectivity_of(spec.pairs());
        let partition = Partition::new(&connectivity)?;
        let signature = CallSignature::new(&partition.independent, &partition.params);
        Ok(Self {
            spec,
            connectivity,
            partition,
            signature,
            components: OnceLock::new(),
            jacobian: OnceLock::new(),
            hessian: OnceLock::new(),
        })
    }

    /// The underlying spec.
    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    /// Symbol → direct dependencies.
    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Keys consumed by other keys; these drive chain-rule differentiation.
    pub fn interdependent_vars(&self) -> &[Symbol] {
        &self.partition.interdependent
    }

    /// Whether any parameter is shared between components.
    pub fn shared_parameters(&self) -> bool {
        if self.spec.len() <= 1 {
            return false;
        }
        let mut seen: std::collections::BTreeSet<Symbol> = Default::default();
        for (_, expr) in self.spec.pairs() {
            let params: Vec<Symbol> = expr
                .free_symbols()
                .into_iter()
                .filter(Symbol::is_param)
                .collect();
            if params.iter().any(|p| seen.contains(p)) {
                return true;
            }
            seen.extend(params);
        }
        false
    }

    /// The compiled components, built on first access.
    ///
    /// Compilation runs one Cranelift module per component, in parallel.
    /// The cache is idempotent: racing initializers compute equal values and
    /// the first write wins.
    pub(crate) fn components(
        &self,
    ) -> Result<&BTreeMap<Symbol, CompiledComponent>, ModelError> {
        if let Some(built) = self.components.get() {
            return Ok(built);
        }
        let built = self
            .spec
            .pairs()
            .par_iter()
            .map(|(key, expr)| {
                let mut deps: Vec<Symbol> = self.connectivity[key].iter().cloned().collect();
                deps.sort_by(arg_cmp);
                let component = compile(expr, &deps)?;
                Ok((key.clone(), component))
            })
            .collect::<Result<BTreeMap<_, _>, ModelError>>()?;
        let _ = self.components.set(built);
        Ok(self.components.get().expect("cache populated above"))
    }

    /// Evaluates every unsupplied key of the frame in topological order.
    pub(crate) fn eval_frame(
        &self,
        env: &mut BTreeMap<Symbol, ArrayD<f64>>,
    ) -> Result<(), ModelError> {
        let components = self.components()?;
        for sym in &self.partition.ordered {
            if env.contains_key(sym) {
                continue;
            }
            let component = components
                .get(sym)
                .ok_or_else(|| ModelError::UnknownSymbol(sym.to_string()))?;
            let value = {
                let inputs: Vec<&ArrayD<f64>> = component
                    .args()
                    .iter()
                    .map(|a| {
                        env.get(a)
                            .expect("topological order resolves dependencies first")
                    })
                    .collect();
                component.eval(&inputs)?
            };
            env.insert(sym.clone(), value);
        }
        Ok(())
    }

    /// Evaluates many argument packs in parallel.
    ///
    /// The components are compiled once up front; the workers share them.
    pub fn eval_many(&self, argsets: &[Args]) -> Result<Vec<Evaluation>, ModelError> {
        self.components()?;
        argsets.par_iter().map(|args| self.eval(args)).collect()
    }
}

impl Callable for Model {
    fn signature(&self) -> &CallSignature {
        &self.signature
    }

    fn dependent_vars(&self) -> &[Symbol] {
        &self.partition.dependent
    }

    fn eval(&self, args: &Args) -> Result<Evaluation, ModelError> {
        let mut env = self.signature.bind(args)?;
        self.eval_frame(&mut env)?;
        let values = self
            .partition
            .dependent
            .iter()
            .map(|var| {
                atleast_1d(
                    env.remove(var)
                        .expect("every dependent variable was evaluated"),
                )
            })
            .collect();
        Ok(Evaluation::new(self.partition.dependent.clone(), values))
    }
}

/// Model equality is algebraic: same dependent identities, and pairwise
/// expressions whose difference reduces to zero.
impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        if self.partition.dependent != other.partition.dependent {
            return false;
        }
        self.spec.pairs().iter().all(|(key, expr)| {
            other
                .spec
                .get(key)
                .map(|other_expr| expr.equivalent(other_expr))
                .unwrap_or(false)
        })
    }
}

/// Sign negation: a new model with every component's expression flipped.
/// The original is never mutated.
impl std::ops::Neg for &Model {
    type Output = Model;

    fn neg(self) -> Model {
        let pairs = self
            .spec
            .pairs()
            .iter()
            .map(|(key, expr)| (key.clone(), Expr::Neg(Box::new(expr.clone()))))
            .collect();
        let spec = ModelSpec::from_symbol_pairs(pairs)
            .expect("negation preserves spec keys");
        Model::new(spec).expect("negation preserves the dependency structure")
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(self.spec.len());
        for (key, expr) in self.spec.pairs() {
            let deps = &self.connectivity[key];
            let vars = deps
                .iter()
                .filter(|s| !s.is_param())
                .map(|s| s.to_string())
                .join(", ");
            let params = deps
                .iter()
                .filter(|s| s.is_param())
                .map(|s| s.to_string())
                .join(", ");
            parts.push(format!(
                "{}({}; {}) = {}",
                key.to_string().cyan(),
                vars,
                params,
                expr
            ));
        }
        write!(f, "[{}]", parts.join(",\n "))
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{{")?;
        writeln!(f, "    {}: {}", "Model".cyan(), self)?;
        writeln!(
            f,
            "    {}: {:?}",
            "Signature".cyan(),
            self.signature.slots().iter().map(|s| s.to_string()).collect::<Vec<_>>()
        )?;
        writeln!(
            f,
            "    {}: {:?}",
            "Dependent".cyan(),
            self.partition.dependent.iter().map(|s| s.to_string()).collect::<Vec<_>>()
        )?;
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::parameters;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    fn linear_model() -> Model {
        let params = parameters("a, b");
        let spec = ModelSpec::parse(&[("y", "a * x + b")], &params).unwrap();
        Model::new(spec).unwrap()
    }

    #[test]
    fn closed_form_is_reproduced() {
        let model = linear_model();
        let out = model
            .eval(
                &Args::new()
                    .pos(vec![0.0, 1.0, 2.0, 3.0])
                    .set("a", 2.0)
                    .set("b", 1.0),
            )
            .unwrap();
        assert_eq!(
            out.get("y").unwrap(),
            &arr1(&[1.0, 3.0, 5.0, 7.0]).into_dyn()
        );
    }

    #[test]
    fn parameters_default_to_declared_values() {
        let params = vec![
            Parameter::new("a").with_value(3.0),
            Parameter::new("b").with_value(-1.0),
        ];
        let spec = ModelSpec::parse(&[("y", "a * x + b")], &params).unwrap();
        let model = Model::new(spec).unwrap();
        let out = model.eval(&Args::new().pos(vec![1.0, 2.0])).unwrap();
        assert_eq!(out.get("y").unwrap(), &arr1(&[2.0, 5.0]).into_dyn());
    }

    #[test]
    fn interdependent_values_are_computed_not_symbolic() {
        // z must consume the evaluated y, not a placeholder
        let params = parameters("a");
        let spec =
            ModelSpec::parse(&[("y", "a * x"), ("z", "y^2 + a")], &params).unwrap();
        let model = Model::new(spec).unwrap();
        assert_eq!(model.interdependent_vars().len(), 1);

        let out = model
            .eval(&Args::new().pos(vec![1.0, 2.0, 3.0]).set("a", 2.0))
            .unwrap();
        // y = 2x, z = (2x)^2 + 2
        assert_eq!(out.get("y").unwrap(), &arr1(&[2.0, 4.0, 6.0]).into_dyn());
        assert_eq!(out.get("z").unwrap(), &arr1(&[6.0, 18.0, 38.0]).into_dyn());
    }

    #[test]
    fn three_stage_composition() {
        let params = parameters("a");
        let spec = ModelSpec::parse(
            &[("y", "a * x"), ("z", "y + 1"), ("w", "z^2")],
            &params,
        )
        .unwrap();
        let model = Model::new(spec).unwrap();
        let out = model
            .eval(&Args::new().pos(2.0).set("a", 3.0))
            .unwrap();
        // y = 6, z = 7, w = 49; scalars broadcast to one dimension
        assert_abs_diff_eq!(out.get("w").unwrap()[[0]], 49.0);
    }

    #[test]
    fn scalar_inputs_produce_1d_outputs() {
        let model = linear_model();
        let out = model.eval(&Args::new().pos(1.0)).unwrap();
        assert_eq!(out.get("y").unwrap().ndim(), 1);
    }

    #[test]
    fn signature_orders_vars_then_params() {
        let model = linear_model();
        let names: Vec<&str> = model
            .signature()
            .slots()
            .iter()
            .map(|s| s.name())
            .collect();
        assert_eq!(names, ["x", "a", "b"]);
    }

    #[test]
    fn equality_is_algebraic() {
        let params = parameters("a, b");
        let m1 = Model::new(
            ModelSpec::parse(&[("y", "a * x + b")], &params).unwrap(),
        )
        .unwrap();
        let m2 = Model::new(
            ModelSpec::parse(&[("y", "b + x * a")], &params).unwrap(),
        )
        .unwrap();
        let m3 = Model::new(
            ModelSpec::parse(&[("y", "a * x - b")], &params).unwrap(),
        )
        .unwrap();
        assert_eq!(m1, m2);
        assert_ne!(m1, m3);
    }

    #[test]
    fn double_negation_is_identity() {
        let model = linear_model();
        let negated = -&model;
        assert_ne!(model, negated);
        let restored = -&negated;
        assert_eq!(model, restored);
    }

    #[test]
    fn bounds_follow_parameters() {
        let params = vec![
            Parameter::new("a").with_min(0.0).with_max(10.0),
            Parameter::new("b").with_value(5.0).fix(),
        ];
        let spec = ModelSpec::parse(&[("y", "a * x + b")], &params).unwrap();
        let model = Model::new(spec).unwrap();
        let bounds = model.bounds();
        assert_eq!(bounds[0], (Some(0.0), Some(10.0)));
        // fixed parameter: degenerate interval
        let (lo, hi) = bounds[1];
        assert_eq!(hi, Some(5.0));
        assert!(lo.unwrap() < 5.0 && 5.0 - lo.unwrap() < 1e-12);
        assert_eq!(model.free_params().len(), 1);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let x = Variable::new("x");
        let result = ModelSpec::new(vec![
            (Variable::new("y"), Expr::from(&x)),
            (Variable::new("y"), Expr::from(&x) * 2.0),
        ]);
        assert!(matches!(result, Err(ModelError::DuplicateKey(_))));
    }

    #[test]
    fn eval_many_matches_eval() {
        let model = linear_model();
        let argsets = vec![
            Args::new().pos(1.0).set("a", 2.0).set("b", 0.0),
            Args::new().pos(2.0).set("a", 2.0).set("b", 0.0),
        ];
        let many = model.eval_many(&argsets).unwrap();
        assert_abs_diff_eq!(many[0].get("y").unwrap()[[0]], 2.0);
        assert_abs_diff_eq!(many[1].get("y").unwrap()[[0]], 4.0);
    }
}
