//! Symbolic expression trees.
//!
//! [`Expr`] is the immutable AST shared by every stage of the crate: model
//! specs hold one per dependent variable, the differentiation engine rewrites
//! them, and the numeric compiler lowers them to machine code. The tree is
//! built recursively with `Box<Expr>` and supports:
//!
//! - Basic arithmetic (+, -, *, /), negation and absolute value
//! - Integer, float and expression exponents
//! - Transcendental functions (exp, ln, sqrt, sin, cos)
//! - Free-symbol extraction and symbol substitution
//! - Symbolic differentiation (product, quotient, power and chain rules)
//! - Simplification by constant folding and identity rules
//!
//! Two node kinds exist purely for the differentiation engine's
//! function-promotion pass and never appear in user-facing expressions:
//! [`Expr::Apply`] represents a dependent variable as an explicit function of
//! its dependencies (`y(x, a)`), and [`Expr::Partial`] is an unevaluated
//! partial derivative of such an application. [`Expr::restored`] folds both
//! back into plain symbols.
//!
//! # Symbolic differentiation
//! `derivative` recursively applies the usual calculus rules. For function
//! applications the chain rule produces one unevaluated [`Expr::Partial`]
//! factor per argument; differentiating an already-partial node extends its
//! wrt list instead of differentiating the differentiated result, which is
//! what keeps repeated partials of interdependent variables from collapsing
//! to zero.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::symbols::{Parameter, Symbol, Variable};

/// An expression tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant floating point value
    Const(f64),
    /// A reference to a variable or parameter
    Sym(Symbol),
    /// Addition of two expressions
    Add(Box<Expr>, Box<Expr>),
    /// Subtraction of two expressions
    Sub(Box<Expr>, Box<Expr>),
    /// Multiplication of two expressions
    Mul(Box<Expr>, Box<Expr>),
    /// Division of two expressions
    Div(Box<Expr>, Box<Expr>),
    /// Negation of an expression
    Neg(Box<Expr>),
    /// Absolute value of an expression
    Abs(Box<Expr>),
    /// Exponentiation by an integer constant
    Pow(Box<Expr>, i64),
    /// Exponentiation by a floating point constant
    PowFloat(Box<Expr>, f64),
    /// Exponentiation by another expression
    PowExpr(Box<Expr>, Box<Expr>),
    /// Exponential function
    Exp(Box<Expr>),
    /// Natural logarithm
    Ln(Box<Expr>),
    /// Square root
    Sqrt(Box<Expr>),
    /// Sine (radians)
    Sin(Box<Expr>),
    /// Cosine (radians)
    Cos(Box<Expr>),
    /// A dependent variable promoted to an explicit function of its
    /// dependencies, e.g. `y(x, a)`. Produced by the differentiation engine.
    Apply(Symbol, Vec<Expr>),
    /// Unevaluated partial derivative of a function application with respect
    /// to an ordered list of symbols. Produced by the chain rule.
    Partial(Box<Expr>, Vec<Symbol>),
}

impl Expr {
    /// A symbol leaf.
    pub fn sym(s: impl Into<Symbol>) -> Expr {
        Expr::Sym(s.into())
    }

    /// A constant leaf.
    pub fn constant(v: f64) -> Expr {
        Expr::Const(v)
    }

    /// Integer power of this expression.
    pub fn pow(self, exp: i64) -> Expr {
        Expr::Pow(Box::new(self), exp)
    }

    /// Float power of this expression.
    pub fn powf(self, exp: f64) -> Expr {
        Expr::PowFloat(Box::new(self), exp)
    }

    /// Expression power of this expression.
    pub fn pow_expr(self, exp: Expr) -> Expr {
        Expr::PowExpr(Box::new(self), Box::new(exp))
    }

    pub fn exp(self) -> Expr {
        Expr::Exp(Box::new(self))
    }

    pub fn ln(self) -> Expr {
        Expr::Ln(Box::new(self))
    }

    pub fn sqrt(self) -> Expr {
        Expr::Sqrt(Box::new(self))
    }

    pub fn sin(self) -> Expr {
        Expr::Sin(Box::new(self))
    }

    pub fn cos(self) -> Expr {
        Expr::Cos(Box::new(self))
    }

    pub fn abs(self) -> Expr {
        Expr::Abs(Box::new(self))
    }

    fn is_zero(&self) -> bool {
        matches!(self, Expr::Const(c) if *c == 0.0)
    }

    fn is_one(&self) -> bool {
        matches!(self, Expr::Const(c) if *c == 1.0)
    }

    /// Collects the free symbols of this expression.
    ///
    /// Function applications contribute the free symbols of their arguments;
    /// the applied name itself is not free.
    pub fn free_symbols(&self) -> BTreeSet<Symbol> {
        let mut out = BTreeSet::new();
        self.collect_symbols(&mut out);
        out
    }

    fn collect_symbols(&self, out: &mut BTreeSet<Symbol>) {
        match self {
            Expr::Const(_) => {}
            Expr::Sym(s) => {
                out.insert(s.clone());
            }
            Expr::Add(l, r)
            | Expr::Sub(l, r)
            | Expr::Mul(l, r)
            | Expr::Div(l, r)
            | Expr::PowExpr(l, r) => {
                l.collect_symbols(out);
                r.collect_symbols(out);
            }
            Expr::Neg(e)
            | Expr::Abs(e)
            | Expr::Exp(e)
            | Expr::Ln(e)
            | Expr::Sqrt(e)
            | Expr::Sin(e)
            | Expr::Cos(e) => e.collect_symbols(out),
            Expr::Pow(b, _) | Expr::PowFloat(b, _) => b.collect_symbols(out),
            Expr::Apply(_, args) => {
                for a in args {
                    a.collect_symbols(out);
                }
            }
            Expr::Partial(inner, _) => inner.collect_symbols(out),
        }
    }

    /// Returns a copy of this expression with every symbol leaf found in
    /// `map` replaced by its mapped expression.
    pub fn substitute(&self, map: &BTreeMap<Symbol, Expr>) -> Expr {
        match self {
            Expr::Const(_) => self.clone(),
            Expr::Sym(s) => map.get(s).cloned().unwrap_or_else(|| self.clone()),
            Expr::Add(l, r) => Expr::Add(
                Box::new(l.substitute(map)),
                Box::new(r.substitute(map)),
            ),
            Expr::Sub(l, r) => Expr::Sub(
                Box::new(l.substitute(map)),
                Box::new(r.substitute(map)),
            ),
            Expr::Mul(l, r) => Expr::Mul(
                Box::new(l.substitute(map)),
                Box::new(r.substitute(map)),
            ),
            Expr::Div(l, r) => Expr::Div(
                Box::new(l.substitute(map)),
                Box::new(r.substitute(map)),
            ),
            Expr::Neg(e) => Expr::Neg(Box::new(e.substitute(map))),
            Expr::Abs(e) => Expr::Abs(Box::new(e.substitute(map))),
            Expr::Pow(b, n) => Expr::Pow(Box::new(b.substitute(map)), *n),
            Expr::PowFloat(b, x) => Expr::PowFloat(Box::new(b.substitute(map)), *x),
            Expr::PowExpr(b, e) => Expr::PowExpr(
                Box::new(b.substitute(map)),
                Box::new(e.substitute(map)),
            ),
            Expr::Exp(e) => Expr::Exp(Box::new(e.substitute(map))),
            Expr::Ln(e) => Expr::Ln(Box::new(e.substitute(map))),
            Expr::Sqrt(e) => Expr::Sqrt(Box::new(e.substitute(map))),
            Expr::Sin(e) => Expr::Sin(Box::new(e.substitute(map))),
            Expr::Cos(e) => Expr::Cos(Box::new(e.substitute(map))),
            Expr::Apply(f, args) => Expr::Apply(
                f.clone(),
                args.iter().map(|a| a.substitute(map)).collect(),
            ),
            Expr::Partial(inner, wrt) => {
                Expr::Partial(Box::new(inner.substitute(map)), wrt.clone())
            }
        }
    }

    /// The symbol a promoted argument stands for: the symbol itself for a
    /// leaf, the applied name for a nested function application.
    fn base_symbol(&self) -> Option<&Symbol> {
        match self {
            Expr::Sym(s) => Some(s),
            Expr::Apply(f, _) => Some(f),
            _ => None,
        }
    }

    /// Computes the symbolic derivative of this expression w.r.t. a symbol.
    ///
    /// The rules are the standard ones:
    /// - d/dx(c) = 0, d/dx(x) = 1, d/dx(y) = 0
    /// - Sum rule: d/dx(f + g) = f' + g'
    /// - Product rule: d/dx(f * g) = f * g' + g * f'
    /// - Quotient rule: d/dx(f / g) = (g * f' - f * g') / g²
    /// - Power rule: d/dx(fⁿ) = n * fⁿ⁻¹ * f'
    /// - General power: d/dx(f^g) = f^g * (g' ln f + g f'/f)
    /// - Chain rules for abs, exp, ln, sqrt, sin, cos
    ///
    /// Function applications follow the multivariate chain rule: each
    /// argument contributes an unevaluated [`Expr::Partial`] of the
    /// application times the argument's own derivative. Differentiating an
    /// existing `Partial` extends its wrt list; the differentiated result is
    /// never differentiated again, so repeated partials of interdependent
    /// variables survive as markers instead of vanishing.
    pub fn derivative(&self, wrt: &Symbol) -> Expr {
        match self {
            Expr::Const(_) => Expr::Const(0.0),

            Expr::Sym(s) => {
                if s == wrt {
                    Expr::Const(1.0)
                } else {
                    Expr::Const(0.0)
                }
            }

            Expr::Add(l, r) => Expr::Add(
                Box::new(l.derivative(wrt)),
                Box::new(r.derivative(wrt)),
            ),

            Expr::Sub(l, r) => Expr::Sub(
                Box::new(l.derivative(wrt)),
                Box::new(r.derivative(wrt)),
            ),

            Expr::Mul(l, r) => Expr::Add(
                Box::new(Expr::Mul(l.clone(), Box::new(r.derivative(wrt)))),
                Box::new(Expr::Mul(r.clone(), Box::new(l.derivative(wrt)))),
            ),

            Expr::Div(l, r) => Expr::Div(
                Box::new(Expr::Sub(
                    Box::new(Expr::Mul(r.clone(), Box::new(l.derivative(wrt)))),
                    Box::new(Expr::Mul(l.clone(), Box::new(r.derivative(wrt)))),
                )),
                Box::new(Expr::Pow(r.clone(), 2)),
            ),

            Expr::Neg(e) => Expr::Neg(Box::new(e.derivative(wrt))),

            // d/dx |f| = f / |f| * f'
            Expr::Abs(e) => Expr::Mul(
                Box::new(Expr::Div(e.clone(), Box::new(Expr::Abs(e.clone())))),
                Box::new(e.derivative(wrt)),
            ),

            Expr::Pow(b, n) => Expr::Mul(
                Box::new(Expr::Mul(
                    Box::new(Expr::Const(*n as f64)),
                    Box::new(Expr::Pow(b.clone(), n - 1)),
                )),
                Box::new(b.derivative(wrt)),
            ),

            Expr::PowFloat(b, x) => Expr::Mul(
                Box::new(Expr::Mul(
                    Box::new(Expr::Const(*x)),
                    Box::new(Expr::PowFloat(b.clone(), x - 1.0)),
                )),
                Box::new(b.derivative(wrt)),
            ),

            Expr::PowExpr(b, e) => Expr::Mul(
                Box::new(Expr::PowExpr(b.clone(), e.clone())),
                Box::new(Expr::Add(
                    Box::new(Expr::Mul(
                        Box::new(e.derivative(wrt)),
                        Box::new(Expr::Ln(b.clone())),
                    )),
                    Box::new(Expr::Mul(
                        e.clone(),
                        Box::new(Expr::Div(Box::new(b.derivative(wrt)), b.clone())),
                    )),
                )),
            ),

            Expr::Exp(e) => Expr::Mul(
                Box::new(Expr::Exp(e.clone())),
                Box::new(e.derivative(wrt)),
            ),

            Expr::Ln(e) => Expr::Mul(
                Box::new(Expr::Div(Box::new(Expr::Const(1.0)), e.clone())),
                Box::new(e.derivative(wrt)),
            ),

            Expr::Sqrt(e) => Expr::Mul(
                Box::new(Expr::Div(
                    Box::new(Expr::Const(1.0)),
                    Box::new(Expr::Mul(
                        Box::new(Expr::Const(2.0)),
                        Box::new(Expr::Sqrt(e.clone())),
                    )),
                )),
                Box::new(e.derivative(wrt)),
            ),

            Expr::Sin(e) => Expr::Mul(
                Box::new(Expr::Cos(e.clone())),
                Box::new(e.derivative(wrt)),
            ),

            Expr::Cos(e) => Expr::Mul(
                Box::new(Expr::Neg(Box::new(Expr::Sin(e.clone())))),
                Box::new(e.derivative(wrt)),
            ),

            Expr::Apply(_, args) => self.chain_rule(args, &[], wrt),

            Expr::Partial(inner, ws) => match &**inner {
                Expr::Apply(_, args) => inner.chain_rule(args, ws, wrt),
                // Derivative markers over anything else accumulate too; the
                // rebuild in `restored` re-differentiates from the inner
                // expression, so nothing is lost by staying unevaluated.
                _ => {
                    let mut ws = ws.clone();
                    ws.push(wrt.clone());
                    Expr::Partial(inner.clone(), ws)
                }
            },
        }
    }

    /// Multivariate chain rule for a (possibly already differentiated)
    /// function application: Σᵢ ∂f/∂argᵢ · d(argᵢ)/d(wrt), with the wrt list
    /// of each new partial extending `accumulated`.
    fn chain_rule(&self, args: &[Expr], accumulated: &[Symbol], wrt: &Symbol) -> Expr {
        let application = match self {
            Expr::Partial(inner, _) => inner.as_ref().clone(),
            other => other.clone(),
        };
        let mut terms: Vec<Expr> = Vec::new();
        for arg in args {
            let Some(base) = arg.base_symbol() else {
                continue;
            };
            let inner_d = arg.derivative(wrt);
            if inner_d.is_zero() {
                continue;
            }
            let mut ws = accumulated.to_vec();
            ws.push(base.clone());
            let outer = Expr::Partial(Box::new(application.clone()), ws);
            terms.push(if inner_d.is_one() {
                outer
            } else {
                Expr::Mul(Box::new(outer), Box::new(inner_d))
            });
        }
        terms
            .into_iter()
            .reduce(|acc, t| Expr::Add(Box::new(acc), Box::new(t)))
            .unwrap_or(Expr::Const(0.0))
    }

    /// Substitutes promoted function forms back to plain symbols.
    ///
    /// `Apply(y, ...)` becomes the symbol `y`; `Partial(Apply(y, ...), [a, b])`
    /// becomes the derivative marker `D(y, a, b)`, folding the accumulated
    /// wrt list onto the base symbol. A partial whose inner restores to a
    /// plain expression is rebuilt by re-differentiating that restored
    /// expression, never by substituting into a differentiated result.
    pub fn restored(&self) -> Expr {
        match self {
            Expr::Const(_) | Expr::Sym(_) => self.clone(),
            Expr::Add(l, r) => Expr::Add(Box::new(l.restored()), Box::new(r.restored())),
            Expr::Sub(l, r) => Expr::Sub(Box::new(l.restored()), Box::new(r.restored())),
            Expr::Mul(l, r) => Expr::Mul(Box::new(l.restored()), Box::new(r.restored())),
            Expr::Div(l, r) => Expr::Div(Box::new(l.restored()), Box::new(r.restored())),
            Expr::Neg(e) => Expr::Neg(Box::new(e.restored())),
            Expr::Abs(e) => Expr::Abs(Box::new(e.restored())),
            Expr::Pow(b, n) => Expr::Pow(Box::new(b.restored()), *n),
            Expr::PowFloat(b, x) => Expr::PowFloat(Box::new(b.restored()), *x),
            Expr::PowExpr(b, e) => {
                Expr::PowExpr(Box::new(b.restored()), Box::new(e.restored()))
            }
            Expr::Exp(e) => Expr::Exp(Box::new(e.restored())),
            Expr::Ln(e) => Expr::Ln(Box::new(e.restored())),
            Expr::Sqrt(e) => Expr::Sqrt(Box::new(e.restored())),
            Expr::Sin(e) => Expr::Sin(Box::new(e.restored())),
            Expr::Cos(e) => Expr::Cos(Box::new(e.restored())),
            Expr::Apply(f, _) => Expr::Sym(f.clone()),
            Expr::Partial(inner, ws) => match inner.restored() {
                Expr::Sym(s) => {
                    let marker = ws.iter().fold(s, |acc, w| acc.partial(w.name()));
                    Expr::Sym(marker)
                }
                plain => ws.iter().fold(plain, |acc, w| acc.derivative(w)),
            },
        }
    }

    /// Simplifies the expression by constant folding and identity rules.
    ///
    /// The rule set is deliberately small: enough to fold symbolic zeros out
    /// of derivative trees and keep compiled kernels lean, nothing close to a
    /// general simplifier.
    pub fn simplify(&self) -> Expr {
        match self {
            Expr::Const(_) | Expr::Sym(_) => self.clone(),

            Expr::Add(l, r) => {
                let l = l.simplify();
                let r = r.simplify();
                match (&l, &r) {
                    (Expr::Const(a), Expr::Const(b)) => Expr::Const(a + b),
                    (e, z) if z.is_zero() => e.clone(),
                    (z, e) if z.is_zero() => e.clone(),
                    _ => Expr::Add(Box::new(l), Box::new(r)),
                }
            }

            Expr::Sub(l, r) => {
                let l = l.simplify();
                let r = r.simplify();
                match (&l, &r) {
                    (Expr::Const(a), Expr::Const(b)) => Expr::Const(a - b),
                    (e, z) if z.is_zero() => e.clone(),
                    (z, e) if z.is_zero() => Expr::Neg(Box::new(e.clone())).simplify(),
                    (a, b) if a == b => Expr::Const(0.0),
                    _ => Expr::Sub(Box::new(l), Box::new(r)),
                }
            }

            Expr::Mul(l, r) => {
                let l = l.simplify();
                let r = r.simplify();
                if l == r {
                    return Expr::Pow(Box::new(l), 2);
                }
                match (&l, &r) {
                    (Expr::Const(a), Expr::Const(b)) => Expr::Const(a * b),
                    (z, _) | (_, z) if z.is_zero() => Expr::Const(0.0),
                    (o, e) | (e, o) if o.is_one() => e.clone(),
                    (Expr::Const(c), e) | (e, Expr::Const(c)) if *c == -1.0 => {
                        Expr::Neg(Box::new(e.clone()))
                    }
                    (Expr::Pow(b1, e1), Expr::Pow(b2, e2)) if b1 == b2 => {
                        Expr::Pow(b1.clone(), e1 + e2)
                    }
                    _ => Expr::Mul(Box::new(l), Box::new(r)),
                }
            }

            Expr::Div(l, r) => {
                let l = l.simplify();
                let r = r.simplify();
                match (&l, &r) {
                    (Expr::Const(a), Expr::Const(b)) if *b != 0.0 => Expr::Const(a / b),
                    (z, _) if z.is_zero() => Expr::Const(0.0),
                    (e, o) if o.is_one() => e.clone(),
                    (a, b) if a == b => Expr::Const(1.0),
                    (Expr::Pow(b1, e1), Expr::Pow(b2, e2)) if b1 == b2 => {
                        Expr::Pow(b1.clone(), e1 - e2)
                    }
                    _ => Expr::Div(Box::new(l), Box::new(r)),
                }
            }

            Expr::Neg(e) => {
                let e = e.simplify();
                match &e {
                    Expr::Const(a) => Expr::Const(-a),
                    Expr::Neg(inner) => (**inner).clone(),
                    _ => Expr::Neg(Box::new(e)),
                }
            }

            Expr::Abs(e) => {
                let e = e.simplify();
                match &e {
                    Expr::Const(a) => Expr::Const(a.abs()),
                    Expr::Abs(inner) => Expr::Abs(inner.clone()),
                    Expr::Neg(inner) => Expr::Abs(inner.clone()),
                    Expr::Pow(_, n) if n % 2 == 0 => e,
                    _ => Expr::Abs(Box::new(e)),
                }
            }

            Expr::Pow(b, n) => {
                let b = b.simplify();
                match (&b, n) {
                    (_, 0) => Expr::Const(1.0),
                    (e, 1) => e.clone(),
                    (Expr::Const(a), n) => Expr::Const(a.powi(*n as i32)),
                    (Expr::Pow(inner, m), n) => Expr::Pow(inner.clone(), m * n),
                    _ => Expr::Pow(Box::new(b), *n),
                }
            }

            Expr::PowFloat(b, x) => {
                let b = b.simplify();
                match &b {
                    _ if *x == 0.0 => Expr::Const(1.0),
                    e if *x == 1.0 => e.clone(),
                    Expr::Const(a) => Expr::Const(a.powf(*x)),
                    _ if x.fract() == 0.0 && x.abs() < 64.0 => {
                        Expr::Pow(Box::new(b), *x as i64)
                    }
                    _ => Expr::PowFloat(Box::new(b), *x),
                }
            }

            Expr::PowExpr(b, e) => {
                let b = b.simplify();
                let e = e.simplify();
                match (&b, &e) {
                    (Expr::Const(a), Expr::Const(x)) => Expr::Const(a.powf(*x)),
                    (_, z) if z.is_zero() => Expr::Const(1.0),
                    (base, o) if o.is_one() => base.clone(),
                    (base, Expr::Const(x)) if x.fract() == 0.0 && x.abs() < 64.0 => {
                        Expr::Pow(Box::new(base.clone()), *x as i64)
                    }
                    (base, Expr::Const(x)) => Expr::PowFloat(Box::new(base.clone()), *x),
                    _ => Expr::PowExpr(Box::new(b), Box::new(e)),
                }
            }

            Expr::Exp(e) => {
                let e = e.simplify();
                match &e {
                    Expr::Const(a) => Expr::Const(a.exp()),
                    Expr::Ln(inner) => (**inner).clone(),
                    _ => Expr::Exp(Box::new(e)),
                }
            }

            Expr::Ln(e) => {
                let e = e.simplify();
                match &e {
                    Expr::Const(a) if *a > 0.0 => Expr::Const(a.ln()),
                    Expr::Exp(inner) => (**inner).clone(),
                    _ => Expr::Ln(Box::new(e)),
                }
            }

            Expr::Sqrt(e) => {
                let e = e.simplify();
                match &e {
                    Expr::Const(a) if *a >= 0.0 => Expr::Const(a.sqrt()),
                    Expr::Pow(inner, 2) => Expr::Abs(inner.clone()),
                    _ => Expr::Sqrt(Box::new(e)),
                }
            }

            Expr::Sin(e) => {
                let e = e.simplify();
                match &e {
                    Expr::Const(a) => Expr::Const(a.sin()),
                    _ => Expr::Sin(Box::new(e)),
                }
            }

            Expr::Cos(e) => {
                let e = e.simplify();
                match &e {
                    Expr::Const(a) => Expr::Const(a.cos()),
                    _ => Expr::Cos(Box::new(e)),
                }
            }

            Expr::Apply(f, args) => {
                Expr::Apply(f.clone(), args.iter().map(Expr::simplify).collect())
            }

            Expr::Partial(inner, ws) => {
                Expr::Partial(Box::new(inner.simplify()), ws.clone())
            }
        }
    }

    /// Tree-walking evaluation with a symbol lookup.
    ///
    /// Returns `None` for unknown symbols, domain errors that would trap
    /// (`ln` of a non-positive constant is fine — it yields NaN like the
    /// compiled kernel) and unresolved function forms. Used for algebraic
    /// equivalence probing; numeric evaluation of models goes through the
    /// compiled kernels instead.
    pub(crate) fn eval_with(&self, lookup: &dyn Fn(&Symbol) -> Option<f64>) -> Option<f64> {
        Some(match self {
            Expr::Const(c) => *c,
            Expr::Sym(s) => lookup(s)?,
            Expr::Add(l, r) => l.eval_with(lookup)? + r.eval_with(lookup)?,
            Expr::Sub(l, r) => l.eval_with(lookup)? - r.eval_with(lookup)?,
            Expr::Mul(l, r) => l.eval_with(lookup)? * r.eval_with(lookup)?,
            Expr::Div(l, r) => l.eval_with(lookup)? / r.eval_with(lookup)?,
            Expr::Neg(e) => -e.eval_with(lookup)?,
            Expr::Abs(e) => e.eval_with(lookup)?.abs(),
            Expr::Pow(b, n) => b.eval_with(lookup)?.powi(*n as i32),
            Expr::PowFloat(b, x) => b.eval_with(lookup)?.powf(*x),
            Expr::PowExpr(b, e) => b.eval_with(lookup)?.powf(e.eval_with(lookup)?),
            Expr::Exp(e) => e.eval_with(lookup)?.exp(),
            Expr::Ln(e) => e.eval_with(lookup)?.ln(),
            Expr::Sqrt(e) => e.eval_with(lookup)?.sqrt(),
            Expr::Sin(e) => e.eval_with(lookup)?.sin(),
            Expr::Cos(e) => e.eval_with(lookup)?.cos(),
            Expr::Apply(..) | Expr::Partial(..) => return None,
        })
    }

    /// Algebraic equivalence: the difference reduces to zero.
    ///
    /// First the symbolic route (simplify the difference), then deterministic
    /// numeric probing over the union of free symbols. Probing accepts the
    /// pair as equivalent when both sides agree within floating tolerance at
    /// every sample point where both are finite.
    pub fn equivalent(&self, other: &Expr) -> bool {
        let diff = Expr::Sub(Box::new(self.clone()), Box::new(other.clone())).simplify();
        if let Expr::Const(c) = diff {
            return c == 0.0;
        }

        let mut syms = self.free_symbols();
        syms.extend(other.free_symbols());
        let syms: Vec<Symbol> = syms.into_iter().collect();

        let mut checked = 0usize;
        for trial in 0..16u64 {
            let env: BTreeMap<Symbol, f64> = syms
                .iter()
                .enumerate()
                .map(|(i, s)| (s.clone(), probe_value(trial * 97 + i as u64)))
                .collect();
            let lookup = |s: &Symbol| env.get(s).copied();
            let (Some(a), Some(b)) = (self.eval_with(&lookup), other.eval_with(&lookup))
            else {
                return false;
            };
            if !a.is_finite() || !b.is_finite() {
                continue;
            }
            if (a - b).abs() > 1e-9 * a.abs().max(b.abs()).max(1.0) {
                return false;
            }
            checked += 1;
        }
        // All probes landed on singularities: no evidence either way, fall
        // back to structural equality.
        if checked == 0 {
            return self == other;
        }
        true
    }
}

/// Deterministic pseudo-random probe points in (0.25, 2.25).
///
/// The range stays clear of the usual singular points (0) while remaining
/// small enough that powers do not overflow.
fn probe_value(seed: u64) -> f64 {
    let mut x = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^= x >> 31;
    0.25 + 2.0 * (x >> 11) as f64 / (1u64 << 53) as f64
}

impl From<f64> for Expr {
    fn from(v: f64) -> Self {
        Expr::Const(v)
    }
}

impl From<Variable> for Expr {
    fn from(v: Variable) -> Self {
        Expr::Sym(Symbol::Var(v))
    }
}

impl From<&Variable> for Expr {
    fn from(v: &Variable) -> Self {
        Expr::Sym(Symbol::Var(v.clone()))
    }
}

impl From<Parameter> for Expr {
    fn from(p: Parameter) -> Self {
        Expr::Sym(Symbol::Param(p))
    }
}

impl From<&Parameter> for Expr {
    fn from(p: &Parameter) -> Self {
        Expr::Sym(Symbol::Param(p.clone()))
    }
}

impl From<Symbol> for Expr {
    fn from(s: Symbol) -> Self {
        Expr::Sym(s)
    }
}

macro_rules! impl_binop {
    ($trait:ident, $method:ident, $variant:ident) => {
        impl std::ops::$trait for Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::$variant(Box::new(self), Box::new(rhs))
            }
        }

        impl std::ops::$trait<f64> for Expr {
            type Output = Expr;
            fn $method(self, rhs: f64) -> Expr {
                Expr::$variant(Box::new(self), Box::new(Expr::Const(rhs)))
            }
        }

        impl std::ops::$trait<Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::$variant(Box::new(Expr::Const(self)), Box::new(rhs))
            }
        }
    };
}

impl_binop!(Add, add, Add);
impl_binop!(Sub, sub, Sub);
impl_binop!(Mul, mul, Mul);
impl_binop!(Div, div, Div);

impl std::ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Neg(Box::new(self))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(v) => write!(f, "{v}"),
            Expr::Sym(s) => write!(f, "{s}"),
            Expr::Add(l, r) => write!(f, "({l} + {r})"),
            Expr::Sub(l, r) => write!(f, "({l} - {r})"),
            Expr::Mul(l, r) => write!(f, "({l} * {r})"),
            Expr::Div(l, r) => write!(f, "({l} / {r})"),
            Expr::Neg(e) => write!(f, "-({e})"),
            Expr::Abs(e) => write!(f, "|{e}|"),
            Expr::Pow(b, n) => write!(f, "({b}^{n})"),
            Expr::PowFloat(b, x) => write!(f, "({b}^{x})"),
            Expr::PowExpr(b, e) => write!(f, "({b}^{e})"),
            Expr::Exp(e) => write!(f, "exp({e})"),
            Expr::Ln(e) => write!(f, "ln({e})"),
            Expr::Sqrt(e) => write!(f, "sqrt({e})"),
            Expr::Sin(e) => write!(f, "sin({e})"),
            Expr::Cos(e) => write!(f, "cos({e})"),
            Expr::Apply(name, args) => {
                write!(f, "{name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
            Expr::Partial(inner, ws) => {
                write!(f, "D({inner}")?;
                for w in ws {
                    write!(f, ", {w}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> Expr {
        Expr::from(Variable::new(name))
    }

    fn par(name: &str) -> Expr {
        Expr::from(Parameter::new(name))
    }

    fn vsym(name: &str) -> Symbol {
        Symbol::Var(Variable::new(name))
    }

    fn psym(name: &str) -> Symbol {
        Symbol::Param(Parameter::new(name))
    }

    #[test]
    fn test_derivative_rules() {
        // constants and symbols
        assert_eq!(Expr::Const(5.0).derivative(&vsym("x")), Expr::Const(0.0));
        assert_eq!(var("x").derivative(&vsym("x")), Expr::Const(1.0));
        assert_eq!(var("y").derivative(&vsym("x")), Expr::Const(0.0));

        // d/da (a * x + b) = x
        let e = par("a") * var("x") + par("b");
        assert!(e.derivative(&psym("a")).simplify().equivalent(&var("x")));
        assert!(e
            .derivative(&psym("b"))
            .simplify()
            .equivalent(&Expr::Const(1.0)));

        // power rule: d/dx x^3 = 3 x^2
        let p = var("x").pow(3);
        assert!(p
            .derivative(&vsym("x"))
            .simplify()
            .equivalent(&(3.0 * var("x").pow(2))));

        // quotient rule at a point: d/dx (x / (x + 1)) = 1 / (x + 1)^2
        let q = var("x") / (var("x") + 1.0);
        let expected = 1.0 / (var("x") + 1.0).pow(2);
        assert!(q.derivative(&vsym("x")).equivalent(&expected));
    }

    #[test]
    fn test_transcendental_derivatives() {
        let x = vsym("x");
        assert!(var("x")
            .exp()
            .derivative(&x)
            .simplify()
            .equivalent(&var("x").exp()));
        assert!(var("x")
            .ln()
            .derivative(&x)
            .simplify()
            .equivalent(&(1.0 / var("x"))));
        assert!(var("x")
            .sin()
            .derivative(&x)
            .simplify()
            .equivalent(&var("x").cos()));
        assert!(var("x")
            .cos()
            .derivative(&x)
            .simplify()
            .equivalent(&(-var("x").sin())));
    }

    #[test]
    fn test_simplify() {
        // constant folding
        assert_eq!((Expr::Const(2.0) + Expr::Const(3.0)).simplify(), Expr::Const(5.0));
        // identities
        assert_eq!((var("x") + 0.0).simplify(), var("x"));
        assert_eq!((var("x") * 1.0).simplify(), var("x"));
        assert_eq!((var("x") * 0.0).simplify(), Expr::Const(0.0));
        assert_eq!((var("x") / 1.0).simplify(), var("x"));
        assert_eq!((var("x") / var("x")).simplify(), Expr::Const(1.0));
        // powers
        assert_eq!(var("x").pow(0).simplify(), Expr::Const(1.0));
        assert_eq!(var("x").pow(1).simplify(), var("x"));
        // double negation
        assert_eq!((-(-var("x"))).simplify(), var("x"));
        // x - x
        assert_eq!((var("x") - var("x")).simplify(), Expr::Const(0.0));
    }

    #[test]
    fn test_free_symbols() {
        let e = par("a") * var("x") + par("b") * var("x").pow(2);
        let syms = e.free_symbols();
        assert_eq!(syms.len(), 3);
        assert!(syms.contains(&psym("a")));
        assert!(syms.contains(&psym("b")));
        assert!(syms.contains(&vsym("x")));
    }

    #[test]
    fn test_substitute() {
        let mut map = BTreeMap::new();
        map.insert(vsym("x"), var("z") * 2.0);
        let e = (var("x") + var("y")).substitute(&map);
        assert_eq!(e, var("z") * 2.0 + var("y"));
    }

    #[test]
    fn test_chain_rule_through_application() {
        // z = y(x, a)^2 + a, with y an opaque function of (x, a).
        let y_fun = Expr::Apply(vsym("y"), vec![var("x"), par("a")]);
        let z = y_fun.clone().pow(2) + par("a");
        let dz = z.derivative(&psym("a")).restored().simplify();

        // After restoring, d z / d a = 2 * y * D(y, a) + 1.
        let marker = Expr::Sym(Symbol::Var(Variable::new("y").partial("a")));
        let expected = 2.0 * var("y") * marker + 1.0;
        assert!(dz.equivalent(&expected), "got {dz}");
    }

    #[test]
    fn test_repeated_partial_accumulates() {
        // Differentiating D(y(a), a) w.r.t. b must yield D(y, a, b), not zero.
        let y_fun = Expr::Apply(vsym("y"), vec![par("a"), par("b")]);
        let first = y_fun.derivative(&psym("a"));
        let second = first.derivative(&psym("b")).restored().simplify();
        let marker = Symbol::Var(Variable::new("y").partial("a").partial("b"));
        assert_eq!(second, Expr::Sym(marker));
    }

    #[test]
    fn test_equivalence() {
        let e1 = par("a") * var("x");
        let e2 = var("x") * par("a");
        assert!(e1.equivalent(&e2));

        let e3 = (var("x") + 1.0).pow(2);
        let e4 = var("x").pow(2) + 2.0 * var("x") + 1.0;
        assert!(e3.equivalent(&e4));

        assert!(!e1.equivalent(&(par("a") * var("x") + 1e-3)));

        // double negation is the identity
        let e5 = -(-(par("a") * var("x")));
        assert!(e5.equivalent(&e1));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", var("x") + var("y")), "(x + y)");
        assert_eq!(format!("{}", var("x").pow(2)), "(x^2)");
        assert_eq!(format!("{}", var("x").exp()), "exp(x)");
        let marker = Expr::Sym(Symbol::Var(Variable::new("y").partial("a")));
        assert_eq!(format!("{marker}"), "D(y, a)");
    }
}
