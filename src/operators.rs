//! Linking of host math functions into JIT-compiled code.
//!
//! Cranelift has native instructions for arithmetic, `fabs`, `fneg` and
//! `sqrt`, but the transcendental functions are calls into the host process:
//! each is declared as an imported function in the JIT module and resolved
//! against the symbols registered on the `JITBuilder`. The import names match
//! libm (`exp`, `log`, `sin`, `cos`, `pow`) so unregistered symbols would
//! still resolve via the process's own math library.

use cranelift::prelude::{AbiParam, FunctionBuilder, InstBuilder};
use cranelift_codegen::ir::types::F64;
use cranelift_codegen::ir::Value;
use cranelift_module::{FuncId, Linkage, Module};

use crate::errors::CompileError;

/// Declares a unary f64 → f64 import (e.g. `exp`, `log`, `sin`, `cos`).
///
/// Declaring the same name twice in one module is fine; Cranelift returns the
/// existing id as long as the signatures agree.
pub(crate) fn link_unary(module: &mut dyn Module, name: &str) -> Result<FuncId, CompileError> {
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(F64));
    sig.returns.push(AbiParam::new(F64));
    module
        .declare_function(name, Linkage::Import, &sig)
        .map_err(|e| CompileError::Declaration(e.to_string()))
}

/// Declares the binary `pow(f64, f64) -> f64` import.
pub(crate) fn link_pow(module: &mut dyn Module) -> Result<FuncId, CompileError> {
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(F64));
    sig.params.push(AbiParam::new(F64));
    sig.returns.push(AbiParam::new(F64));
    module
        .declare_function("pow", Linkage::Import, &sig)
        .map_err(|e| CompileError::Declaration(e.to_string()))
}

/// Emits a call to a previously linked unary import.
pub(crate) fn call_unary(
    builder: &mut FunctionBuilder,
    module: &mut dyn Module,
    func_id: FuncId,
    arg: Value,
) -> Value {
    let func = module.declare_func_in_func(func_id, builder.func);
    let call = builder.ins().call(func, &[arg]);
    builder.inst_results(call)[0]
}

/// Emits a call to the linked `pow` import.
pub(crate) fn call_pow(
    builder: &mut FunctionBuilder,
    module: &mut dyn Module,
    func_id: FuncId,
    base: Value,
    exponent: Value,
) -> Value {
    let func = module.declare_func_in_func(func_id, builder.func);
    let call = builder.ins().call(func, &[base, exponent]);
    builder.inst_results(call)[0]
}
