//! Linking and calling external math functions from JIT-compiled code.
//!
//! Cranelift has native instructions for `sqrt`, `fabs` and `fma`, but the
//! transcendental functions used by rate laws (exp, ln, pow, sin, cos) have to
//! be called out of line. Each of them is registered with the `JITBuilder`
//! under a crate-specific symbol that points at an `extern "C"` shim around the
//! corresponding `f64` method, so the JIT never depends on how the host libm
//! spells its symbols.

use cranelift::prelude::FunctionBuilder;
use cranelift_codegen::ir::types::F64;
use cranelift_codegen::ir::{AbiParam, InstBuilder, Value};
use cranelift_jit::JITBuilder;
use cranelift_module::{FuncId, Linkage, Module};

use crate::errors::BuilderError;

pub(crate) const EXP: &str = "kinetic_exp";
pub(crate) const LN: &str = "kinetic_ln";
pub(crate) const SIN: &str = "kinetic_sin";
pub(crate) const COS: &str = "kinetic_cos";
pub(crate) const POW: &str = "kinetic_pow";

extern "C" fn exp_shim(x: f64) -> f64 {
    x.exp()
}

extern "C" fn ln_shim(x: f64) -> f64 {
    x.ln()
}

extern "C" fn sin_shim(x: f64) -> f64 {
    x.sin()
}

extern "C" fn cos_shim(x: f64) -> f64 {
    x.cos()
}

extern "C" fn pow_shim(base: f64, exponent: f64) -> f64 {
    base.powf(exponent)
}

/// Makes every shim resolvable by the JIT linker.
pub(crate) fn register_symbols(builder: &mut JITBuilder) {
    builder.symbol(EXP, exp_shim as *const u8);
    builder.symbol(LN, ln_shim as *const u8);
    builder.symbol(SIN, sin_shim as *const u8);
    builder.symbol(COS, cos_shim as *const u8);
    builder.symbol(POW, pow_shim as *const u8);
}

/// Declares an imported `f64 -> f64` function.
///
/// Declaring the same name twice returns the existing id, so callers may link
/// lazily at every use site.
pub(crate) fn link_unary(module: &mut dyn Module, name: &str) -> Result<FuncId, BuilderError> {
    link(module, name, 1)
}

/// Declares an imported `(f64, f64) -> f64` function.
pub(crate) fn link_binary(module: &mut dyn Module, name: &str) -> Result<FuncId, BuilderError> {
    link(module, name, 2)
}

fn link(module: &mut dyn Module, name: &str, arity: usize) -> Result<FuncId, BuilderError> {
    let mut sig = module.make_signature();
    for _ in 0..arity {
        sig.params.push(AbiParam::new(F64));
    }
    sig.returns.push(AbiParam::new(F64));

    module
        .declare_function(name, Linkage::Import, &sig)
        .map_err(|e| BuilderError::DeclarationError(format!("{name}: {e}")))
}

/// Emits a call to a previously linked function and returns its result.
pub(crate) fn call(
    builder: &mut FunctionBuilder,
    module: &mut dyn Module,
    func_id: FuncId,
    args: &[Value],
) -> Value {
    let func = module.declare_func_in_func(func_id, builder.func);
    let call = builder.ins().call(func, args);
    builder.inst_results(call)[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shims_match_std() {
        assert_eq!(exp_shim(1.5), 1.5f64.exp());
        assert_eq!(ln_shim(2.0), 2.0f64.ln());
        assert_eq!(sin_shim(0.3), 0.3f64.sin());
        assert_eq!(cos_shim(0.3), 0.3f64.cos());
        assert_eq!(pow_shim(2.0, 0.5), 2.0f64.sqrt());
    }
}
