//! JIT compilation of expressions into numeric callables.
//!
//! This module lowers an [`Expr`] plus a fixed argument order into native
//! machine code using Cranelift. The generated kernel has the signature
//! `fn(*const f64) -> f64`: it reads its arguments from a flat input array at
//! the slot positions assigned to each symbol, so a [`CompiledComponent`]
//! evaluates with zero interpretation overhead and no re-derivation per call.
//!
//! Array evaluation wraps the scalar kernel: the positional argument arrays
//! are broadcast together and the kernel runs once per element of the
//! broadcast product. Kernels are pure, `Send + Sync`, and safe to call
//! concurrently.
//!
//! Integer powers expand into multiply chains (squaring for the common small
//! exponents, binary exponentiation beyond); `sqrt`, `abs` and negation are
//! native Cranelift instructions; the remaining transcendentals call linked
//! host symbols declared in [`crate::operators`].

use std::collections::BTreeMap;
use std::sync::Arc;

use cranelift::prelude::*;
use cranelift_codegen::ir::immediates::Offset32;
use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::Context;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use ndarray::ArrayD;

use crate::broadcast::{broadcast_together, scalar};
use crate::errors::{BindingError, CompileError};
use crate::expr::Expr;
use crate::operators;
use crate::symbols::Symbol;

/// A compiled scalar kernel over a flat argument array.
pub type JitKernel = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

/// An expression compiled against a fixed argument order.
///
/// The component accepts exactly `args().len()` broadcastable positional
/// arrays and evaluates the kernel elementwise over their broadcast product.
#[derive(Clone)]
pub struct CompiledComponent {
    args: Vec<Symbol>,
    expr: Expr,
    kernel: JitKernel,
}

impl std::fmt::Debug for CompiledComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledComponent")
            .field("args", &self.args)
            .field("expr", &format!("{}", self.expr))
            .finish()
    }
}

impl CompiledComponent {
    /// The fixed argument order of this component.
    pub fn args(&self) -> &[Symbol] {
        &self.args
    }

    /// The expression this component was compiled from.
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Evaluates the kernel at a single point.
    ///
    /// `inputs` must follow the component's argument order.
    pub fn eval_scalar(&self, inputs: &[f64]) -> f64 {
        debug_assert_eq!(inputs.len(), self.args.len());
        (self.kernel)(inputs)
    }

    /// Evaluates the component over broadcastable argument arrays.
    pub fn eval(&self, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>, BindingError> {
        debug_assert_eq!(inputs.len(), self.args.len());
        let (shape, views) = broadcast_together(inputs)?;
        let mut buf = vec![0.0; views.len()];

        if shape.is_empty() {
            for (j, v) in views.iter().enumerate() {
                buf[j] = *v.first().expect("0-d view holds one element");
            }
            return Ok(scalar((self.kernel)(&buf)));
        }

        let mut out = ArrayD::<f64>::zeros(shape);
        for (idx, slot) in out.indexed_iter_mut() {
            for (j, v) in views.iter().enumerate() {
                buf[j] = v[&idx];
            }
            *slot = (self.kernel)(&buf);
        }
        Ok(out)
    }
}

/// Compiles an expression against an ordered argument list.
///
/// Fails eagerly if the expression references a symbol outside `args` or
/// still contains promoted function forms.
pub fn compile(expr: &Expr, args: &[Symbol]) -> Result<CompiledComponent, CompileError> {
    let slots: BTreeMap<Symbol, u32> = args
        .iter()
        .enumerate()
        .map(|(i, s)| (s.clone(), i as u32))
        .collect();
    for sym in expr.free_symbols() {
        if !slots.contains_key(&sym) {
            return Err(CompileError::UnboundSymbol(sym.to_string()));
        }
    }
    let kernel = build_kernel(expr, &slots)?;
    Ok(CompiledComponent {
        args: args.to_vec(),
        expr: expr.clone(),
        kernel,
    })
}

/// Creates an ISA target for the host machine.
fn create_isa() -> Result<Arc<dyn TargetIsa>, CompileError> {
    let mut flag_builder = settings::builder();

    let target_triple = target_lexicon::Triple::host();
    let is_x86 = matches!(
        target_triple.architecture,
        target_lexicon::Architecture::X86_64
    );

    if is_x86 {
        // cranelift-jit requires is_pic=false; colocated libcalls are likewise
        // unsupported by the JIT backend, so mirror the non-x86 settings.
        flag_builder.set("use_colocated_libcalls", "false").unwrap();
        flag_builder.set("is_pic", "false").unwrap();
    } else {
        flag_builder.set("use_colocated_libcalls", "false").unwrap();
        flag_builder.set("is_pic", "false").unwrap();
    }
    flag_builder.set("opt_level", "speed").unwrap();

    let isa_builder = cranelift_native::builder()
        .map_err(|msg| CompileError::HostMachineNotSupported(msg.to_string()))?;

    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(CompileError::Codegen)
}

/// Creates a JIT module with the host math symbols registered, and a function
/// context with the kernel signature `fn(*const f64) -> f64`.
fn create_module(isa: Arc<dyn TargetIsa>) -> (JITModule, Context) {
    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());

    builder.symbol("exp", f64::exp as *const u8);
    builder.symbol("log", f64::ln as *const u8);
    builder.symbol("sin", f64::sin as *const u8);
    builder.symbol("cos", f64::cos as *const u8);
    builder.symbol("pow", f64::powf as *const u8);

    let module = JITModule::new(builder);
    let mut ctx = module.make_context();

    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(types::I64));
    sig.returns.push(AbiParam::new(types::F64));
    ctx.func.signature = sig;

    (module, ctx)
}

/// Builds and finalizes a scalar kernel for `expr`.
fn build_kernel(expr: &Expr, slots: &BTreeMap<Symbol, u32>) -> Result<JitKernel, CompileError> {
    let isa = create_isa()?;
    let (mut module, mut ctx) = create_module(isa);

    let mut builder_ctx = FunctionBuilderContext::new();
    {
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);

        let input_ptr = builder.block_params(entry)[0];
        let result = emit(expr, &mut builder, &mut module, input_ptr, slots)?;
        builder.ins().return_(&[result]);
        builder.finalize();
    }

    let func_id = module
        .declare_function("component", Linkage::Local, &ctx.func.signature)
        .map_err(|e| CompileError::Declaration(e.to_string()))?;
    module
        .define_function(func_id, &mut ctx)
        .map_err(|e| CompileError::Function(e.to_string()))?;
    module.clear_context(&mut ctx);
    module.finalize_definitions()?;

    let raw = module.get_finalized_function(func_id);
    // SAFETY: the function was compiled with signature fn(*const f64) -> f64,
    // and JITModule never releases its executable pages on drop, so the
    // pointer stays valid for the lifetime of the process.
    let raw_fn = unsafe { std::mem::transmute::<*const u8, fn(*const f64) -> f64>(raw) };
    Ok(Arc::new(move |input: &[f64]| raw_fn(input.as_ptr())))
}

/// Recursively generates Cranelift IR for an expression.
fn emit(
    expr: &Expr,
    builder: &mut FunctionBuilder,
    module: &mut JITModule,
    input_ptr: Value,
    slots: &BTreeMap<Symbol, u32>,
) -> Result<Value, CompileError> {
    Ok(match expr {
        Expr::Const(v) => builder.ins().f64const(*v),

        Expr::Sym(s) => {
            let idx = *slots
                .get(s)
                .ok_or_else(|| CompileError::UnboundSymbol(s.to_string()))?;
            let mem = MemFlags::new().with_aligned().with_readonly().with_notrap();
            builder
                .ins()
                .load(types::F64, mem, input_ptr, Offset32::new(idx as i32 * 8))
        }

        Expr::Add(l, r) => {
            let l = emit(l, builder, module, input_ptr, slots)?;
            let r = emit(r, builder, module, input_ptr, slots)?;
            builder.ins().fadd(l, r)
        }

        Expr::Sub(l, r) => {
            let l = emit(l, builder, module, input_ptr, slots)?;
            let r = emit(r, builder, module, input_ptr, slots)?;
            builder.ins().fsub(l, r)
        }

        Expr::Mul(l, r) => {
            let l = emit(l, builder, module, input_ptr, slots)?;
            let r = emit(r, builder, module, input_ptr, slots)?;
            builder.ins().fmul(l, r)
        }

        Expr::Div(l, r) => {
            let l = emit(l, builder, module, input_ptr, slots)?;
            let r = emit(r, builder, module, input_ptr, slots)?;
            builder.ins().fdiv(l, r)
        }

        Expr::Neg(e) => {
            let v = emit(e, builder, module, input_ptr, slots)?;
            builder.ins().fneg(v)
        }

        Expr::Abs(e) => {
            let v = emit(e, builder, module, input_ptr, slots)?;
            builder.ins().fabs(v)
        }

        Expr::Sqrt(e) => {
            let v = emit(e, builder, module, input_ptr, slots)?;
            builder.ins().sqrt(v)
        }

        Expr::Pow(b, n) => {
            let base = emit(b, builder, module, input_ptr, slots)?;
            emit_powi(builder, base, *n)
        }

        Expr::PowFloat(b, x) => {
            let base = emit(b, builder, module, input_ptr, slots)?;
            let exponent = builder.ins().f64const(*x);
            let fid = operators::link_pow(module)?;
            operators::call_pow(builder, module, fid, base, exponent)
        }

        Expr::PowExpr(b, e) => {
            let base = emit(b, builder, module, input_ptr, slots)?;
            let exponent = emit(e, builder, module, input_ptr, slots)?;
            let fid = operators::link_pow(module)?;
            operators::call_pow(builder, module, fid, base, exponent)
        }

        Expr::Exp(e) => {
            let v = emit(e, builder, module, input_ptr, slots)?;
            let fid = operators::link_unary(module, "exp")?;
            operators::call_unary(builder, module, fid, v)
        }

        Expr::Ln(e) => {
            let v = emit(e, builder, module, input_ptr, slots)?;
            let fid = operators::link_unary(module, "log")?;
            operators::call_unary(builder, module, fid, v)
        }

        Expr::Sin(e) => {
            let v = emit(e, builder, module, input_ptr, slots)?;
            let fid = operators::link_unary(module, "sin")?;
            operators::call_unary(builder, module, fid, v)
        }

        Expr::Cos(e) => {
            let v = emit(e, builder, module, input_ptr, slots)?;
            let fid = operators::link_unary(module, "cos")?;
            operators::call_unary(builder, module, fid, v)
        }

        Expr::Apply(..) | Expr::Partial(..) => {
            return Err(CompileError::UnresolvedFunctionForm(expr.to_string()))
        }
    })
}

/// Generates an integer power as a multiply chain.
///
/// Common small exponents are expanded by squaring; everything else uses
/// binary exponentiation. Negative exponents invert at the end.
fn emit_powi(builder: &mut FunctionBuilder, base: Value, exp: i64) -> Value {
    match exp {
        0 => builder.ins().f64const(1.0),
        1 => base,
        2 => builder.ins().fmul(base, base),
        3 => {
            let square = builder.ins().fmul(base, base);
            builder.ins().fmul(square, base)
        }
        4 => {
            let square = builder.ins().fmul(base, base);
            builder.ins().fmul(square, square)
        }
        -1 => {
            let one = builder.ins().f64const(1.0);
            builder.ins().fdiv(one, base)
        }
        -2 => {
            let square = builder.ins().fmul(base, base);
            let one = builder.ins().f64const(1.0);
            builder.ins().fdiv(one, square)
        }
        _ => {
            let mut result = builder.ins().f64const(1.0);
            let mut current = base;
            let mut remaining = exp.unsigned_abs();
            while remaining > 0 {
                if remaining & 1 == 1 {
                    result = builder.ins().fmul(result, current);
                }
                if remaining > 1 {
                    current = builder.ins().fmul(current, current);
                }
                remaining >>= 1;
            }
            if exp < 0 {
                let one = builder.ins().f64const(1.0);
                builder.ins().fdiv(one, result)
            } else {
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::{Parameter, Variable};
    use ndarray::arr1;

    fn var(name: &str) -> Expr {
        Expr::from(Variable::new(name))
    }

    fn par(name: &str) -> Expr {
        Expr::from(Parameter::new(name))
    }

    fn syms(names: &[(&str, bool)]) -> Vec<Symbol> {
        names
            .iter()
            .map(|(n, is_param)| {
                if *is_param {
                    Symbol::Param(Parameter::new(*n))
                } else {
                    Symbol::Var(Variable::new(*n))
                }
            })
            .collect()
    }

    #[test]
    fn linear_component_evaluates() {
        let expr = par("a") * var("x") + par("b");
        let args = syms(&[("x", false), ("a", true), ("b", true)]);
        let comp = compile(&expr, &args).unwrap();
        assert_eq!(comp.eval_scalar(&[2.0, 3.0, 1.0]), 7.0);
    }

    #[test]
    fn transcendentals_match_host_math() {
        let expr = var("x").exp() + var("x").ln() + var("x").sin() + var("x").cos()
            + var("x").sqrt();
        let args = syms(&[("x", false)]);
        let comp = compile(&expr, &args).unwrap();
        let x = 1.3f64;
        let expected = x.exp() + x.ln() + x.sin() + x.cos() + x.sqrt();
        assert!((comp.eval_scalar(&[x]) - expected).abs() < 1e-12);
    }

    #[test]
    fn integer_powers_use_multiply_chains() {
        let expr = var("x").pow(5) + var("x").pow(-2);
        let args = syms(&[("x", false)]);
        let comp = compile(&expr, &args).unwrap();
        let x = 1.7f64;
        assert!((comp.eval_scalar(&[x]) - (x.powi(5) + x.powi(-2))).abs() < 1e-12);
    }

    #[test]
    fn array_evaluation_broadcasts() {
        let expr = par("a") * var("x") + par("b");
        let args = syms(&[("x", false), ("a", true), ("b", true)]);
        let comp = compile(&expr, &args).unwrap();

        let x = arr1(&[0.0, 1.0, 2.0]).into_dyn();
        let a = scalar(2.0);
        let b = scalar(1.0);
        let out = comp.eval(&[&x, &a, &b]).unwrap();
        assert_eq!(out, arr1(&[1.0, 3.0, 5.0]).into_dyn());
    }

    #[test]
    fn constant_component_yields_scalar() {
        let comp = compile(&Expr::Const(4.0), &[]).unwrap();
        let out = comp.eval(&[]).unwrap();
        assert_eq!(out.ndim(), 0);
        assert_eq!(out.iter().next(), Some(&4.0));
    }

    #[test]
    fn unbound_symbol_is_rejected() {
        let expr = var("x") + var("y");
        let args = syms(&[("x", false)]);
        assert!(matches!(
            compile(&expr, &args),
            Err(CompileError::UnboundSymbol(_))
        ));
    }

    #[test]
    fn function_forms_cannot_be_compiled() {
        let apply = Expr::Apply(Symbol::Var(Variable::new("y")), vec![var("x")]);
        assert!(matches!(
            compile(&apply, &[Symbol::Var(Variable::new("x"))]),
            Err(CompileError::UnresolvedFunctionForm(_))
        ));
    }
}
