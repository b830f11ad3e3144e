//! Error types for the fitmodel crate.
//!
//! The taxonomy follows the lifecycle of a model:
//!
//! - `ParseError`: failures while converting expression source text into the
//!   internal AST
//! - `CompileError`: failures while JIT compiling an expression with Cranelift
//! - `BindingError`: call arguments that do not match a model's signature
//! - `IntegrationError`: ODE solver failures on a time sub-range
//! - `ModelError`: structurally invalid specs, plus a wrapper around the
//!   lower-level errors so model methods can return a single type
//!
//! Structural problems (cycles, malformed keys, missing initial conditions)
//! are detected eagerly at construction. Runtime errors surface at the point
//! of detection; nothing silently degrades to NaN.

use cranelift_codegen::CodegenError;
use cranelift_module::ModuleError;
use evalexpr::{DefaultNumericTypes, EvalexprError};
use thiserror::Error;

/// Errors that can occur while converting expression source text into the
/// internal AST representation.
#[derive(Error, Debug)]
pub enum ParseError {
    /// Error when the source text is not a valid expression
    #[error("failed to parse expression source")]
    Syntax(#[from] EvalexprError<DefaultNumericTypes>),
    /// Error when encountering an operator with no symbolic counterpart
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// Error when encountering a function with no symbolic counterpart
    #[error("unsupported function: {0}")]
    UnsupportedFunction(String),
    /// Error when a function is called with the wrong number of arguments
    #[error("function {name} expects {expected} argument(s)")]
    WrongArity { name: String, expected: usize },
    /// Error when a constant value is not numeric
    #[error("expected numeric constant: {0}")]
    NonNumericConstant(String),
    /// Error when the parsed tree has an unexpected root shape
    #[error("expected single child for root node: {0}")]
    RootNode(String),
}

/// Errors that can occur during JIT compilation of expressions.
///
/// These represent failure modes in the process of lowering the AST into
/// machine code through Cranelift.
#[derive(Error, Debug)]
pub enum CompileError {
    /// Error when the target machine architecture is not supported
    #[error("host machine is not supported: {0}")]
    HostMachineNotSupported(String),
    /// Error during Cranelift code generation
    #[error("codegen error: {0}")]
    Codegen(#[from] CodegenError),
    /// Error in the Cranelift JIT module
    #[error("module error: {0}")]
    Module(#[from] ModuleError),
    /// Error when defining the JIT function
    #[error("function error: {0}")]
    Function(String),
    /// Error when declaring an external function in the JIT module
    #[error("declaration error: {0}")]
    Declaration(String),
    /// Error when an expression references a symbol outside its argument list
    #[error("symbol not in argument list: {0}")]
    UnboundSymbol(String),
    /// Error when an expression still contains promoted function forms,
    /// which only exist during differentiation and cannot be lowered
    #[error("cannot compile unresolved function form: {0}")]
    UnresolvedFunctionForm(String),
}

/// Errors raised when call arguments do not match a model's signature.
#[derive(Error, Debug)]
pub enum BindingError {
    /// A required argument (independent variable) received no value
    #[error("missing required argument: {0}")]
    Missing(String),
    /// More positional values than signature slots
    #[error("too many positional arguments: expected at most {expected}, got {got}")]
    TooManyPositional { expected: usize, got: usize },
    /// A named value does not correspond to any signature slot
    #[error("unknown argument: {0}")]
    Unknown(String),
    /// The same slot was bound both positionally and by name
    #[error("argument bound twice: {0}")]
    Duplicate(String),
    /// Argument arrays whose shapes cannot be broadcast together
    #[error("shapes {0:?} cannot be broadcast together")]
    ShapeMismatch(Vec<Vec<usize>>),
    /// A slot that must hold a single value received an array
    #[error("argument {0} must be a scalar")]
    NotScalar(String),
}

/// Errors raised by the ODE bridge when the stiff solver fails.
#[derive(Error, Debug)]
pub enum IntegrationError {
    /// Error while constructing the solver for a branch
    #[error("failed to set up integration starting at t = {t0}: {message}")]
    Setup { t0: f64, message: String },
    /// Solver failure on a specific sub-range of the time axis
    #[error("integration failed on [{from}, {to}]: {message}")]
    Step { from: f64, to: f64, message: String },
    /// The solver produced a non-finite state
    #[error("non-finite state at t = {at}")]
    NonFinite { at: f64 },
}

/// High-level errors for model construction and evaluation.
///
/// Structural variants are raised eagerly by constructors; the wrapper
/// variants forward lower-level failures from binding, compilation and
/// integration so every model method can return `Result<_, ModelError>`.
#[derive(Error, Debug)]
pub enum ModelError {
    /// The connectivity graph admits no topological order
    #[error("cyclic dependency between: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),
    /// The same dependent variable appears twice in a spec
    #[error("duplicate dependent variable: {0}")]
    DuplicateKey(String),
    /// A spec key has the wrong shape (e.g. an ODE key that is not a
    /// first-order derivative)
    #[error("invalid key for this model kind: {0}")]
    InvalidKey(String),
    /// An ODE spec mentions more than one independent variable
    #[error("expected exactly one independent variable, found: {}", .0.join(", "))]
    MultipleIndependentVars(Vec<String>),
    /// An ODE spec mentions no independent variable at all
    #[error("ODE spec has no independent variable")]
    NoIndependentVar,
    /// A required construction argument is absent
    #[error("missing initial condition for: {0}")]
    MissingInitial(String),
    /// An expression references a symbol the spec knows nothing about
    #[error("unknown symbol in expression: {0}")]
    UnknownSymbol(String),
    /// The spec is empty
    #[error("model spec contains no components")]
    EmptySpec,
    /// Wrapped argument-binding failure
    #[error(transparent)]
    Binding(#[from] BindingError),
    /// Wrapped JIT compilation failure
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// Wrapped expression parse failure
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Wrapped ODE solver failure
    #[error(transparent)]
    Integration(#[from] IntegrationError),
}
