//! Models whose components are user-supplied numeric callables.
//!
//! [`NumericModel`] gives power users an escape hatch from the symbolic
//! layer: each component is an arbitrary `Fn(&[&ArrayD<f64>]) -> ArrayD<f64>`
//! plus a declared dependency list. The declared connectivity feeds the same
//! partition, signature and topological-evaluation machinery as symbolic
//! models, so numeric and symbolic components interoperate from the caller's
//! point of view. Derivatives come from the finite-difference fallback.
//!
//! Model equality is not defined for numeric components (the callables are
//! opaque), so `NumericModel` deliberately implements no `PartialEq`.

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::ArrayD;

use crate::broadcast::atleast_1d;
use crate::errors::ModelError;
use crate::graph::{Connectivity, Partition};
use crate::model::{Callable, Gradient};
use crate::signature::{Args, CallSignature, Evaluation};
use crate::symbols::{arg_cmp, Symbol, Variable};

/// A user-supplied component: receives its declared dependencies as arrays,
/// ordered variables first then parameters, alphabetical within each group.
pub type ComponentFn = Arc<dyn Fn(&[&ArrayD<f64>]) -> ArrayD<f64> + Send + Sync>;

/// A callable model built from numeric components and an explicit
/// connectivity mapping.
///
/// ```
/// use std::sync::Arc;
/// use fitmodel::prelude::*;
/// use fitmodel::numeric::{ComponentFn, NumericModel};
///
/// let y = Variable::new("y");
/// let x = Symbol::Var(Variable::new("x"));
/// let a = Symbol::Param(Parameter::new("a"));
/// let double: ComponentFn = Arc::new(|inputs| inputs[0] * inputs[1]);
/// let model = NumericModel::new(vec![(y, vec![x, a], double)]).unwrap();
/// let out = model.eval(&Args::new().pos(vec![1.0, 2.0]).set("a", 3.0)).unwrap();
/// assert_eq!(out.get("y").unwrap().as_slice().unwrap(), &[3.0, 6.0]);
/// ```
pub struct NumericModel {
    components: BTreeMap<Symbol, (Vec<Symbol>, ComponentFn)>,
    partition: Partition,
    signature: CallSignature,
}

impl NumericModel {
    /// Builds a model from (dependent variable, dependencies, callable)
    /// triples.
    pub fn new(
        components: Vec<(Variable, Vec<Symbol>, ComponentFn)>,
    ) -> Result<Self, ModelError> {
        if components.is_empty() {
            return Err(ModelError::EmptySpec);
        }
        let mut connectivity: Connectivity = BTreeMap::new();
        let mut table: BTreeMap<Symbol, (Vec<Symbol>, ComponentFn)> = BTreeMap::new();
        for (var, deps, fun) in components {
            let key = Symbol::Var(var);
            if table.contains_key(&key) {
                return Err(ModelError::DuplicateKey(key.to_string()));
            }
            connectivity.insert(key.clone(), deps.iter().cloned().collect());
            let mut ordered = deps;
            ordered.sort_by(arg_cmp);
            ordered.dedup();
            table.insert(key, (ordered, fun));
        }
        let partition = Partition::new(&connectivity)?;
        let signature = CallSignature::new(&partition.independent, &partition.params);
        Ok(Self {
            components: table,
            partition,
            signature,
        })
    }
}

impl Callable for NumericModel {
    fn signature(&self) -> &CallSignature {
        &self.signature
    }

    fn dependent_vars(&self) -> &[Symbol] {
        &self.partition.dependent
    }

    fn eval(&self, args: &Args) -> Result<Evaluation, ModelError> {
        let mut env = self.signature.bind(args)?;
        for sym in &self.partition.ordered {
            if env.contains_key(sym) {
                continue;
            }
            let (deps, fun) = self
                .components
                .get(sym)
                .ok_or_else(|| ModelError::UnknownSymbol(sym.to_string()))?;
            let value = {
                let inputs: Vec<&ArrayD<f64>> = deps
                    .iter()
                    .map(|d| {
                        env.get(d)
                            .expect("topological order resolves dependencies first")
                    })
                    .collect();
                fun(&inputs)
            };
            env.insert(sym.clone(), value);
        }
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

/// Gradient via the finite-difference fallback.
impl Gradient for NumericModel {}

/// Sign negation wraps each callable; the original is untouched.
impl std::ops::Neg for &NumericModel {
    type Output = NumericModel;

    fn neg(self) -> NumericModel {
        let components = self
            .components
            .iter()
            .map(|(key, (deps, fun))| {
                let fun = Arc::clone(fun);
                let negated: ComponentFn = Arc::new(move |inputs| -fun(inputs));
                (key.clone(), (deps.clone(), negated))
            })
            .collect();
        NumericModel {
            components,
            partition: self.partition.clone(),
            signature: self.signature.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::Parameter;
    use approx::assert_abs_diff_eq;

    fn linear_numeric() -> NumericModel {
        let y = Variable::new("y");
        let x = Symbol::Var(Variable::new("x"));
        let a = Symbol::Param(Parameter::new("a"));
        let b = Symbol::Param(Parameter::new("b"));
        // args arrive (x, a, b): vars first, then params alphabetically.
        // ndarray broadcasting wants the widest array on the left.
        let component: ComponentFn = Arc::new(|inputs| inputs[0] * inputs[1] + inputs[2]);
        NumericModel::new(vec![(y, vec![x, a, b], component)]).unwrap()
    }

    #[test]
    fn evaluates_with_signature_binding() {
        let model = linear_numeric();
        let out = model
            .eval(&Args::new().pos(vec![0.0, 1.0, 2.0]).set("a", 2.0).set("b", 1.0))
            .unwrap();
        assert_eq!(
            out.get("y").unwrap().as_slice().unwrap(),
            &[1.0, 3.0, 5.0]
        );
    }

    #[test]
    fn finite_difference_gradient_is_inherited() {
        let model = linear_numeric();
        let jac = model
            .eval_jacobian(&Args::new().pos(vec![1.0, 2.0]).set("a", 3.0).set("b", 0.5))
            .unwrap();
        let dy = jac.get("y").unwrap();
        // ∂y/∂a = x, ∂y/∂b = 1
        assert_abs_diff_eq!(dy[[0, 0]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(dy[[0, 1]], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(dy[[1, 0]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(dy[[1, 1]], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn negation_flips_outputs() {
        let model = linear_numeric();
        let negated = -&model;
        let args = Args::new().pos(vec![1.0]).set("a", 2.0).set("b", 0.0);
        let plain = model.eval(&args).unwrap();
        let flipped = negated.eval(&args).unwrap();
        assert_abs_diff_eq!(
            plain.get("y").unwrap()[[0]],
            -flipped.get("y").unwrap()[[0]]
        );
    }

    #[test]
    fn interoperates_with_interdependence() {
        // y = 2x, z = y + 1 with z's component consuming the computed y
        let x = Symbol::Var(Variable::new("x"));
        let y_sym = Symbol::Var(Variable::new("y"));
        let double: ComponentFn = Arc::new(|inputs| inputs[0] * 2.0);
        let plus_one: ComponentFn = Arc::new(|inputs| inputs[0] + 1.0);
        let model = NumericModel::new(vec![
            (Variable::new("y"), vec![x], double),
            (Variable::new("z"), vec![y_sym], plus_one),
        ])
        .unwrap();
        let out = model.eval(&Args::new().pos(vec![1.0, 2.0])).unwrap();
        assert_eq!(out.get("z").unwrap().as_slice().unwrap(), &[3.0, 5.0]);
    }
}
