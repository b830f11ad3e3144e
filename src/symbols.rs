//! Symbol identities for model expressions.
//!
//! Two kinds of symbols exist: [`Variable`]s (model inputs and outputs) and
//! [`Parameter`]s (quantities to be optimized, carrying a value, optional
//! bounds and a fixed/free flag). Both are identified by kind and name only;
//! parameter metadata never participates in equality or hashing, so two
//! `Parameter`s with the same name but different bounds are the same symbol.
//!
//! A variable may additionally be a *derivative marker*: a base name plus an
//! ordered list of names it has been differentiated with respect to. Markers
//! are how Jacobian and Hessian models key their components (`D(y, a)`,
//! `D(y, a, b)`) and they are ordinary symbols to the rest of the machinery.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A named model variable, independent or dependent.
///
/// When `wrt` is non-empty the variable is a partial-derivative marker of its
/// base name, e.g. `D(y, a)` for ∂y/∂a.
#[derive(Clone, Debug)]
pub struct Variable {
    name: String,
    wrt: Vec<String>,
}

impl Variable {
    /// Creates a plain variable.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            wrt: Vec::new(),
        }
    }

    /// The base name of this variable.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names this variable has been differentiated with respect to, in order.
    pub fn wrt(&self) -> &[String] {
        &self.wrt
    }

    /// Derivative order of this marker; 0 for plain variables.
    pub fn order(&self) -> usize {
        self.wrt.len()
    }

    /// Returns the marker for the partial of this variable w.r.t. `name`.
    ///
    /// Differentiation lists accumulate: `D(y, a).partial("b")` is
    /// `D(y, a, b)`, never a fresh first-order marker.
    pub fn partial(&self, name: impl Into<String>) -> Variable {
        let mut wrt = self.wrt.clone();
        wrt.push(name.into());
        Variable {
            name: self.name.clone(),
            wrt,
        }
    }
}

/// A fit parameter with a current value, optional bounds and a fixed flag.
///
/// Defaults mirror what an optimizer expects of an unconfigured parameter:
/// `value = 1.0`, no bounds, free.
#[derive(Clone, Debug)]
pub struct Parameter {
    name: String,
    /// Current (initial-guess) value, used as the call-time default.
    pub value: f64,
    /// Lower bound, if any.
    pub min: Option<f64>,
    /// Upper bound, if any.
    pub max: Option<f64>,
    /// Fixed parameters are excluded from optimization.
    pub fixed: bool,
}

impl Parameter {
    /// Creates a free parameter with value 1.0 and no bounds.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: 1.0,
            min: None,
            max: None,
            fixed: false,
        }
    }

    /// The parameter's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the current value.
    pub fn with_value(mut self, value: f64) -> Self {
        self.value = value;
        self
    }

    /// Sets the lower bound.
    pub fn with_min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    /// Sets the upper bound.
    pub fn with_max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    /// Marks the parameter as fixed.
    pub fn fix(mut self) -> Self {
        self.fixed = true;
        self
    }

    /// The (min, max) interval handed to optimizers.
    ///
    /// Fixed parameters collapse to a degenerate interval around their value
    /// so bounded minimizers cannot move them.
    pub fn bound(&self) -> (Option<f64>, Option<f64>) {
        if self.fixed {
            if self.value >= 0.0 {
                (Some(self.value.next_down()), Some(self.value))
            } else {
                (Some(self.value), Some(self.value.next_up()))
            }
        } else {
            (self.min, self.max)
        }
    }
}

/// A symbol appearing in a model expression: a variable or a parameter.
#[derive(Clone, Debug)]
pub enum Symbol {
    Var(Variable),
    Param(Parameter),
}

impl Symbol {
    /// The symbol's base name.
    pub fn name(&self) -> &str {
        match self {
            Symbol::Var(v) => v.name(),
            Symbol::Param(p) => p.name(),
        }
    }

    /// Differentiation list; always empty for parameters.
    pub fn wrt(&self) -> &[String] {
        match self {
            Symbol::Var(v) => v.wrt(),
            Symbol::Param(_) => &[],
        }
    }

    /// Derivative order of this symbol.
    pub fn order(&self) -> usize {
        self.wrt().len()
    }

    pub fn is_param(&self) -> bool {
        matches!(self, Symbol::Param(_))
    }

    /// Parameter metadata, if this symbol is a parameter.
    pub fn as_param(&self) -> Option<&Parameter> {
        match self {
            Symbol::Param(p) => Some(p),
            Symbol::Var(_) => None,
        }
    }

    /// The derivative marker for the partial of this symbol w.r.t. `name`.
    ///
    /// Only variables can be differentiated; the result is always a variable
    /// marker with an accumulated wrt list.
    pub(crate) fn partial(&self, name: &str) -> Symbol {
        match self {
            Symbol::Var(v) => Symbol::Var(v.partial(name)),
            // Parameters are leaves of the dependency graph, so marker keys
            // are never built on top of them.
            Symbol::Param(p) => Symbol::Var(Variable::new(p.name()).partial(name)),
        }
    }

    /// Identity tuple used for equality and hashing.
    fn identity(&self) -> (bool, &str, &[String]) {
        (self.is_param(), self.name(), self.wrt())
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

/// Layer ordering: lexicographic by name, derivative-marker ties broken by
/// ascending derivative order, parameters after a like-named variable.
impl Ord for Symbol {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.name(), self.order(), self.wrt(), self.is_param()).cmp(&(
            other.name(),
            other.order(),
            other.wrt(),
            other.is_param(),
        ))
    }
}

impl PartialOrd for Symbol {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<Variable> for Symbol {
    fn from(v: Variable) -> Self {
        Symbol::Var(v)
    }
}

impl From<Parameter> for Symbol {
    fn from(p: Parameter) -> Self {
        Symbol::Param(p)
    }
}

impl From<&Variable> for Symbol {
    fn from(v: &Variable) -> Self {
        Symbol::Var(v.clone())
    }
}

impl From<&Parameter> for Symbol {
    fn from(p: &Parameter) -> Self {
        Symbol::Param(p.clone())
    }
}

/// Argument ordering for compiled components: variables first, then
/// parameters, alphabetical within each group.
pub(crate) fn arg_cmp(a: &Symbol, b: &Symbol) -> Ordering {
    (a.is_param(), a.name(), a.order(), a.wrt()).cmp(&(
        b.is_param(),
        b.name(),
        b.order(),
        b.wrt(),
    ))
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.wrt.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "D({}, {})", self.name, self.wrt.join(", "))
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Var(v) => v.fmt(f),
            Symbol::Param(p) => p.fmt(f),
        }
    }
}

/// Creates a list of variables from a comma-separated name list.
///
/// ```
/// # use fitmodel::symbols::variables;
/// let vs = variables("x, y, z");
/// assert_eq!(vs.len(), 3);
/// assert_eq!(vs[1].name(), "y");
/// ```
pub fn variables(names: &str) -> Vec<Variable> {
    names
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Variable::new)
        .collect()
}

/// Creates a list of free parameters from a comma-separated name list.
pub fn parameters(names: &str) -> Vec<Parameter> {
    names
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Parameter::new)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn identity_ignores_parameter_metadata() {
        let a = Symbol::from(Parameter::new("a").with_value(3.0).with_min(0.0));
        let b = Symbol::from(Parameter::new("a"));
        assert_eq!(a, b);

        let v = Symbol::from(Variable::new("a"));
        assert_ne!(a, v);
    }

    #[test]
    fn marker_accumulates_wrt_list() {
        let y = Variable::new("y");
        let dy_da = y.partial("a");
        let d2y_dadb = dy_da.partial("b");
        assert_eq!(d2y_dadb.order(), 2);
        assert_eq!(d2y_dadb.wrt(), ["a", "b"]);
        assert_eq!(format!("{d2y_dadb}"), "D(y, a, b)");
    }

    #[test]
    fn layer_order_breaks_ties_by_derivative_order() {
        let y = Symbol::from(Variable::new("y"));
        let dy = Symbol::from(Variable::new("y").partial("a"));
        let x = Symbol::from(Variable::new("x"));
        let mut set = BTreeSet::new();
        set.extend([dy.clone(), y.clone(), x.clone()]);
        let ordered: Vec<_> = set.into_iter().collect();
        assert_eq!(ordered, vec![x, y, dy]);
    }

    #[test]
    fn arg_order_puts_variables_before_parameters() {
        let mut syms = vec![
            Symbol::from(Parameter::new("a")),
            Symbol::from(Variable::new("z")),
            Symbol::from(Variable::new("x")),
            Symbol::from(Parameter::new("b")),
        ];
        syms.sort_by(arg_cmp);
        let names: Vec<_> = syms.iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, ["x", "z", "a", "b"]);
    }

    #[test]
    fn fixed_parameter_bound_is_degenerate() {
        let p = Parameter::new("a").with_value(2.0).fix();
        let (lo, hi) = p.bound();
        assert_eq!(hi, Some(2.0));
        assert!(lo.unwrap() < 2.0);
        assert!(2.0 - lo.unwrap() < 1e-12);
    }
}
