//! Call signatures, argument binding and evaluation results.
//!
//! Every model exposes the same calling convention: independent variables
//! first, then parameters, alphabetical within each group. [`Args`] carries
//! the caller's positional and named values; [`CallSignature::bind`] resolves
//! them against the slots, filling unbound parameters from their declared
//! values and rejecting anything that does not line up with a
//! [`BindingError`]. Only parameters have defaults; a missing independent
//! variable is always an error.

use std::collections::BTreeMap;
use std::ops::Index;

use ndarray::{ArrayD, Array1};

use crate::broadcast::scalar;
use crate::errors::BindingError;
use crate::symbols::Symbol;

/// The ordered calling convention of a model.
#[derive(Debug, Clone)]
pub struct CallSignature {
    slots: Vec<Symbol>,
    n_independent: usize,
}

impl CallSignature {
    pub(crate) fn new(independent: &[Symbol], params: &[Symbol]) -> Self {
        let mut slots = independent.to_vec();
        slots.extend(params.iter().cloned());
        Self {
            slots,
            n_independent: independent.len(),
        }
    }

    /// All slots in call order.
    pub fn slots(&self) -> &[Symbol] {
        &self.slots
    }

    /// The independent-variable slots.
    pub fn independent(&self) -> &[Symbol] {
        &self.slots[..self.n_independent]
    }

    /// The parameter slots.
    pub fn params(&self) -> &[Symbol] {
        &self.slots[self.n_independent..]
    }

    /// Binds arguments to slots.
    ///
    /// Positional values fill slots in order; named values may fill any slot
    /// not already bound. Unbound parameters fall back to their declared
    /// value; unbound independent variables fail with
    /// [`BindingError::Missing`].
    pub fn bind(&self, args: &Args) -> Result<BTreeMap<Symbol, ArrayD<f64>>, BindingError> {
        if args.positional.len() > self.slots.len() {
            return Err(BindingError::TooManyPositional {
                expected: self.slots.len(),
                got: args.positional.len(),
            });
        }

        let mut bound: BTreeMap<Symbol, ArrayD<f64>> = BTreeMap::new();
        for (slot, value) in self.slots.iter().zip(&args.positional) {
            bound.insert(slot.clone(), value.clone());
        }
        for (name, value) in &args.named {
            let slot = self
                .slots
                .iter()
                .find(|s| s.name() == name.as_str() && s.order() == 0)
                .ok_or_else(|| BindingError::Unknown(name.clone()))?;
            if bound.contains_key(slot) {
                return Err(BindingError::Duplicate(name.clone()));
            }
            bound.insert(slot.clone(), value.clone());
        }
        for slot in &self.slots {
            if !bound.contains_key(slot) {
                match slot.as_param() {
                    Some(p) => {
                        bound.insert(slot.clone(), scalar(p.value));
                    }
                    None => return Err(BindingError::Missing(slot.to_string())),
                }
            }
        }
        Ok(bound)
    }
}

/// Caller-side argument pack: positional values in signature order plus
/// named overrides.
///
/// ```
/// # use fitmodel::signature::Args;
/// let args = Args::new().pos(vec![0.0, 1.0, 2.0]).set("a", 2.0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Args {
    positional: Vec<ArrayD<f64>>,
    named: Vec<(String, ArrayD<f64>)>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional value.
    pub fn pos(mut self, value: impl IntoArg) -> Self {
        self.positional.push(value.into_arg());
        self
    }

    /// Sets a value by slot name.
    pub fn set(mut self, name: impl Into<String>, value: impl IntoArg) -> Self {
        self.named.push((name.into(), value.into_arg()));
        self
    }
}

/// Conversion into an argument array; scalars become 0-dimensional arrays.
pub trait IntoArg {
    fn into_arg(self) -> ArrayD<f64>;
}

impl IntoArg for f64 {
    fn into_arg(self) -> ArrayD<f64> {
        scalar(self)
    }
}

impl IntoArg for ArrayD<f64> {
    fn into_arg(self) -> ArrayD<f64> {
        self
    }
}

impl IntoArg for &ArrayD<f64> {
    fn into_arg(self) -> ArrayD<f64> {
        self.clone()
    }
}

impl IntoArg for Array1<f64> {
    fn into_arg(self) -> ArrayD<f64> {
        self.into_dyn()
    }
}

impl IntoArg for Vec<f64> {
    fn into_arg(self) -> ArrayD<f64> {
        Array1::from(self).into_dyn()
    }
}

impl IntoArg for &[f64] {
    fn into_arg(self) -> ArrayD<f64> {
        Array1::from(self.to_vec()).into_dyn()
    }
}

/// Ordered evaluation results, one array per dependent variable.
///
/// Results keep their symbol identity: components are addressable by
/// position, by name, or by symbol (derivative markers included).
#[derive(Debug, Clone)]
pub struct Evaluation {
    vars: Vec<Symbol>,
    values: Vec<ArrayD<f64>>,
}

impl Evaluation {
    pub(crate) fn new(vars: Vec<Symbol>, values: Vec<ArrayD<f64>>) -> Self {
        debug_assert_eq!(vars.len(), values.len());
        Self { vars, values }
    }

    /// The symbols the values belong to, in output order.
    pub fn vars(&self) -> &[Symbol] {
        &self.vars
    }

    /// The values in output order.
    pub fn values(&self) -> &[ArrayD<f64>] {
        &self.values
    }

    /// Looks up a value by plain symbol name.
    pub fn get(&self, name: &str) -> Option<&ArrayD<f64>> {
        self.vars
            .iter()
            .position(|v| v.name() == name && v.order() == 0)
            .map(|i| &self.values[i])
    }

    /// Looks up a value by full symbol identity.
    pub fn get_sym(&self, sym: &Symbol) -> Option<&ArrayD<f64>> {
        self.vars.iter().position(|v| v == sym).map(|i| &self.values[i])
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Consumes the evaluation, yielding the values in output order.
    pub fn into_values(self) -> Vec<ArrayD<f64>> {
        self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Symbol, &ArrayD<f64>)> {
        self.vars.iter().zip(self.values.iter())
    }
}

impl Index<usize> for Evaluation {
    type Output = ArrayD<f64>;
    fn index(&self, index: usize) -> &Self::Output {
        &self.values[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::{Parameter, Variable};

    fn signature() -> CallSignature {
        CallSignature::new(
            &[Symbol::Var(Variable::new("x"))],
            &[
                Symbol::Param(Parameter::new("a").with_value(2.0)),
                Symbol::Param(Parameter::new("b").with_value(3.0)),
            ],
        )
    }

    #[test]
    fn positional_then_named_binding() {
        let sig = signature();
        let bound = sig
            .bind(&Args::new().pos(vec![1.0, 2.0]).set("b", 7.0))
            .unwrap();
        assert_eq!(bound.len(), 3);
        // a fell back to its declared value
        let a = &bound[&Symbol::Param(Parameter::new("a"))];
        assert_eq!(a.iter().next(), Some(&2.0));
        let b = &bound[&Symbol::Param(Parameter::new("b"))];
        assert_eq!(b.iter().next(), Some(&7.0));
    }

    #[test]
    fn missing_independent_var_fails() {
        let sig = signature();
        assert!(matches!(
            sig.bind(&Args::new().set("a", 1.0)),
            Err(BindingError::Missing(_))
        ));
    }

    #[test]
    fn duplicate_and_unknown_names_fail() {
        let sig = signature();
        assert!(matches!(
            sig.bind(&Args::new().pos(1.0).set("x", 2.0)),
            Err(BindingError::Duplicate(_))
        ));
        assert!(matches!(
            sig.bind(&Args::new().pos(1.0).set("nope", 2.0)),
            Err(BindingError::Unknown(_))
        ));
    }

    #[test]
    fn too_many_positional_fails() {
        let sig = signature();
        assert!(matches!(
            sig.bind(&Args::new().pos(1.0).pos(2.0).pos(3.0).pos(4.0)),
            Err(BindingError::TooManyPositional { .. })
        ));
    }
}
