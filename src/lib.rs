//! Symbolic fit models compiled to native code.
//!
//! This crate turns declarative model specifications — dependent quantities
//! written as algebraic expressions of independent variables and parameters,
//! including systems of ODEs — into JIT-compiled numeric evaluators, and
//! derives chain-rule-correct first- and second-order sensitivity evaluators
//! (Jacobian/Hessian) by symbolic differentiation. The resulting callables
//! are what nonlinear optimizers consume: ordered parameter lists, bounds,
//! model values and derivative arrays with a fixed layout.
//!
//! # Features
//!
//! - Dependency-resolved evaluation: interdependent variables are computed
//!   in topological order and consumed as values, never as placeholders
//! - Exact Jacobians and Hessians as models themselves, with the chain rule
//!   applied structurally through interdependent variables
//! - Cranelift JIT compilation of every component
//! - A stiff-ODE bridge (BDF with analytic state Jacobian) with
//!   bidirectional integration away from the initial time
//! - Finite-difference fallback with the same output layout
//!
//! # Example
//!
//! ```
//! use fitmodel::prelude::*;
//!
//! let params = parameters("a, b");
//! let spec = ModelSpec::parse(&[("y", "a * x + b")], &params).unwrap();
//! let model = Model::new(spec).unwrap();
//!
//! let args = Args::new().pos(vec![1.0, 2.0, 3.0]).set("a", 2.0).set("b", 0.5);
//! let out = model.eval(&args).unwrap();
//! assert_eq!(out.get("y").unwrap().as_slice().unwrap(), &[2.5, 4.5, 6.5]);
//!
//! // (n_params, n_points): ∂y/∂a = x, ∂y/∂b = 1
//! let jac = model.eval_jacobian(&args).unwrap();
//! assert_eq!(jac.get("y").unwrap().shape(), &[2, 3]);
//! ```

/// NumPy-style broadcasting helpers
pub mod broadcast;
/// JIT compilation of expressions into numeric callables
pub mod compile;
/// Analytic differentiation of models
pub mod deriv;
/// Error types for the various failure modes
pub mod errors;
/// Expression tree representation and symbolic differentiation
pub mod expr;
/// Dependency resolution and topological partitioning
pub mod graph;
/// Model specs, capability traits and the core symbolic model
pub mod model;
/// Models built from user-supplied numeric callables
pub mod numeric;
/// ODE-defined models and the stiff-solver bridge
pub mod ode;
/// Expression source parsing
pub mod parse;
/// Call signatures, argument binding and evaluation results
pub mod signature;
/// Variable and parameter identities
pub mod symbols;

/// Linking of host math functions into JIT-compiled code
pub(crate) mod operators;

pub use errors::{BindingError, CompileError, IntegrationError, ModelError, ParseError};
pub use expr::Expr;
pub use model::{Callable, Gradient, Hessian, Model, ModelSpec};
pub use ode::{OdeModel, OdeOptions};
pub use signature::{Args, Evaluation};
pub use symbols::{Parameter, Symbol, Variable};

pub mod prelude {
    pub use crate::errors::ModelError;
    pub use crate::expr::Expr;
    pub use crate::model::{Callable, Gradient, Hessian, Model, ModelSpec};
    pub use crate::numeric::NumericModel;
    pub use crate::ode::{OdeModel, OdeOptions};
    pub use crate::signature::{Args, Evaluation};
    pub use crate::symbols::{parameters, variables, Parameter, Symbol, Variable};
}
