//! Dependency resolution for model specs.
//!
//! A spec's expressions induce a connectivity graph: each dependent symbol
//! maps to the set of symbols its expression consumes directly. This module
//! layers that graph topologically (Kahn-style, one layer per pass) and
//! partitions the symbols into independent variables, parameters,
//! interdependent variables and dependent variables. The flattened layer
//! order is the evaluation order used by every model kind.

use std::collections::{BTreeMap, BTreeSet};

use crate::errors::ModelError;
use crate::expr::Expr;
use crate::symbols::Symbol;

/// Symbol → set of directly-depended-on symbols.
pub type Connectivity = BTreeMap<Symbol, BTreeSet<Symbol>>;

/// Builds the connectivity mapping of a spec from the free symbols of each
/// component expression. Variables and parameters are treated on the same
/// footing.
pub fn connectivity_of(pairs: &[(Symbol, Expr)]) -> Connectivity {
    pairs
        .iter()
        .map(|(key, expr)| (key.clone(), expr.free_symbols()))
        .collect()
}

/// Topological layering of a connectivity graph.
///
/// The first layer holds every symbol with no dependencies (independent
/// variables and parameters, plus any key with a constant expression); each
/// subsequent layer holds the symbols whose dependencies are all in earlier
/// layers. Within a layer symbols are ordered lexicographically by name with
/// derivative-marker ties broken by ascending derivative order, which the
/// `Ord` on [`Symbol`] encodes.
///
/// Fails with [`ModelError::CyclicDependency`] when no valid order exists.
pub fn toposort_layers(connectivity: &Connectivity) -> Result<Vec<Vec<Symbol>>, ModelError> {
    // Every symbol gets an entry; pure dependencies resolve immediately.
    let mut remaining: BTreeMap<Symbol, BTreeSet<Symbol>> = BTreeMap::new();
    for (key, deps) in connectivity {
        remaining.entry(key.clone()).or_default().extend(
            deps.iter().filter(|d| *d != key).cloned(),
        );
        for dep in deps {
            remaining.entry(dep.clone()).or_default();
        }
    }
    // A key depending on itself can never resolve.
    for (key, deps) in connectivity {
        if deps.contains(key) {
            return Err(ModelError::CyclicDependency(vec![key.to_string()]));
        }
    }

    let mut layers = Vec::new();
    while !remaining.is_empty() {
        let ready: Vec<Symbol> = remaining
            .iter()
            .filter(|(_, deps)| deps.iter().all(|d| !remaining.contains_key(d)))
            .map(|(sym, _)| sym.clone())
            .collect();
        if ready.is_empty() {
            return Err(ModelError::CyclicDependency(
                remaining.keys().map(|s| s.to_string()).collect(),
            ));
        }
        for sym in &ready {
            remaining.remove(sym);
        }
        layers.push(ready);
    }
    Ok(layers)
}

/// Topological partition of a spec's symbols.
#[derive(Debug, Clone)]
pub struct Partition {
    /// All symbols in evaluation order (flattened layers).
    pub ordered: Vec<Symbol>,
    /// Independent variables: bottom layer minus parameters and keys.
    pub independent: Vec<Symbol>,
    /// All parameters, sorted by name.
    pub params: Vec<Symbol>,
    /// Keys consumed by other keys.
    pub interdependent: Vec<Symbol>,
    /// All spec keys, sorted; the model's outputs.
    pub dependent: Vec<Symbol>,
}

impl Partition {
    /// Partitions a connectivity graph whose key set is `keys`.
    pub fn new(connectivity: &Connectivity) -> Result<Self, ModelError> {
        let layers = toposort_layers(connectivity)?;
        let keys: BTreeSet<&Symbol> = connectivity.keys().collect();
        let consumed: BTreeSet<&Symbol> = connectivity.values().flatten().collect();

        let mut independent = Vec::new();
        let mut params = Vec::new();
        let mut interdependent = Vec::new();
        let mut dependent = Vec::new();
        let mut ordered = Vec::new();

        for layer in &layers {
            for sym in layer {
                ordered.push(sym.clone());
                if keys.contains(sym) {
                    dependent.push(sym.clone());
                    if consumed.contains(sym) {
                        interdependent.push(sym.clone());
                    }
                } else if sym.is_param() {
                    params.push(sym.clone());
                } else {
                    independent.push(sym.clone());
                }
            }
        }
        independent.sort();
        params.sort();
        interdependent.sort();
        dependent.sort();

        Ok(Self {
            ordered,
            independent,
            params,
            interdependent,
            dependent,
        })
    }

    /// Position of each symbol in the evaluation order.
    pub fn index_of(&self, sym: &Symbol) -> Option<usize> {
        self.ordered.iter().position(|s| s == sym)
    }
}
