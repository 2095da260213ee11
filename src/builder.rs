//! This module provides functionality for JIT compilation of model expressions.
//! It uses Cranelift as the backend compiler to generate native machine code.
//!
//! The main entry point is `build_combined_function()`, which compiles a list of
//! expressions into a single function writing one result per expression.

use std::sync::Arc;

use crate::{
    errors::{BuilderError, EquationError},
    expr::Expr,
    operators,
    types::CombinedJITFunction,
};
use cranelift::prelude::*;
use cranelift_codegen::{ir::immediates::Offset32, Context};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use isa::TargetIsa;
use rayon::prelude::*;

struct ThreadSafeFunction(*const u8);
unsafe impl Send for ThreadSafeFunction {}
unsafe impl Sync for ThreadSafeFunction {}

/// Creates an Instruction Set Architecture (ISA) target for code generation.
///
/// This function detects the host machine architecture and configures appropriate
/// compilation flags for optimal code generation.
///
/// # Errors
/// Returns a BuilderError if:
/// - The host machine architecture is not supported
/// - A Cranelift setting is rejected
/// - Code generation configuration fails
pub(crate) fn create_isa() -> Result<Arc<dyn TargetIsa>, BuilderError> {
    let mut flag_builder = settings::builder();

    let target_triple = target_lexicon::Triple::host();
    let is_x86 = matches!(
        target_triple.architecture,
        target_lexicon::Architecture::X86_64
    );

    // cranelift-jit rejects PIC code on every architecture
    let colocated = if is_x86 { "true" } else { "false" };
    set_flag(&mut flag_builder, "use_colocated_libcalls", colocated)?;
    set_flag(&mut flag_builder, "is_pic", "false")?;
    set_flag(&mut flag_builder, "opt_level", "speed")?;

    #[cfg(debug_assertions)]
    set_flag(&mut flag_builder, "enable_verifier", "true")?;
    #[cfg(not(debug_assertions))]
    set_flag(&mut flag_builder, "enable_verifier", "false")?;

    let isa_builder = cranelift_native::builder()
        .map_err(|msg| BuilderError::HostMachineNotSupported(msg.to_string()))?;

    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(BuilderError::CodegenError)
}

fn set_flag(builder: &mut settings::Builder, name: &str, value: &str) -> Result<(), BuilderError> {
    builder
        .set(name, value)
        .map_err(|e| BuilderError::Setting(format!("{name}={value}: {e}")))
}

/// Creates a new JIT module with the math shims linked in.
pub(crate) fn create_module(isa: Arc<dyn TargetIsa>) -> JITModule {
    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    operators::register_symbols(&mut builder);
    JITModule::new(builder)
}

/// Builds a JIT-compiled function that evaluates multiple expressions together.
///
/// The generated machine code evaluates every expression in a single call and stores
/// result `i` at `results[i]`. Expressions are simplified in parallel before the
/// sequential Cranelift lowering.
///
/// # Arguments
/// * `name` - Symbol name of the function inside its JIT module
/// * `exprs` - Expressions to compile, one output slot each
/// * `inputs_len` - Length of the input array (`n_states + n_params`)
///
/// # Returns
/// A thread-safe function taking the input slice and the result slice.
///
/// # Errors
/// Returns an EquationError if an expression reads past `inputs_len` or compilation fails.
///
/// # Panics
/// The returned function panics if the input slice is shorter than `inputs_len` or the
/// result slice is shorter than `exprs.len()`; the compiled code does no bounds checks.
pub fn build_combined_function(
    name: &str,
    exprs: &[Expr],
    inputs_len: usize,
) -> Result<CombinedJITFunction, EquationError> {
    let results_len = exprs.len();

    let prepared_exprs: Vec<Expr> = exprs.par_iter().map(|expr| *expr.simplify()).collect();

    if let Some(max) = prepared_exprs
        .iter()
        .filter_map(|e| e.flatten().max_var_index)
        .max()
    {
        if max as usize >= inputs_len {
            return Err(EquationError::InvalidInputLength {
                expected: max as usize + 1,
                got: inputs_len,
            });
        }
    }

    let mut builder_context = FunctionBuilderContext::new();
    let mut codegen_context = Context::new();
    let isa = create_isa()?;
    let mut module = create_module(isa);

    // fn(input_ptr: *const f64, output_ptr: *mut f64)
    let ptr_type = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(ptr_type));
    sig.params.push(AbiParam::new(ptr_type));

    let func_id = module
        .declare_function(name, Linkage::Export, &sig)
        .map_err(|msg| BuilderError::DeclarationError(msg.to_string()))?;

    codegen_context.func.signature = sig;
    let mut builder = FunctionBuilder::new(&mut codegen_context.func, &mut builder_context);

    let entry_block = builder.create_block();
    builder.append_block_params_for_function_params(entry_block);
    builder.switch_to_block(entry_block);
    builder.seal_block(entry_block);

    let input_ptr = builder.block_params(entry_block)[0];
    let output_ptr = builder.block_params(entry_block)[1];

    let results: Vec<Value> = prepared_exprs
        .iter()
        .map(|expr| expr.codegen(&mut builder, &mut module, input_ptr))
        .collect::<Result<_, _>>()?;

    for (i, result) in results.iter().enumerate() {
        let offset = i as i32 * 8;
        builder
            .ins()
            .store(MemFlags::trusted(), *result, output_ptr, Offset32::new(offset));
    }

    builder.ins().return_(&[]);
    builder.finalize();

    module
        .define_function(func_id, &mut codegen_context)
        .map_err(|msg| BuilderError::FunctionError(msg.to_string()))?;
    module.clear_context(&mut codegen_context);
    module
        .finalize_definitions()
        .map_err(BuilderError::ModuleError)?;

    // The module is dropped here without `free_memory`, so the finalized code stays
    // mapped for the lifetime of the process.
    let code = Arc::new(ThreadSafeFunction(module.get_finalized_function(func_id)));
    let wrapper = move |inputs: &[f64], results: &mut [f64]| {
        assert!(
            inputs.len() >= inputs_len && results.len() >= results_len,
            "JIT buffers too short: inputs {} < {inputs_len} or results {} < {results_len}",
            inputs.len(),
            results.len(),
        );
        // SAFETY: the code was compiled with signature extern "C" fn(*const f64, *mut f64),
        // it reads at most `inputs_len` inputs and writes exactly `results_len` outputs,
        // both checked above, and its memory is never freed.
        unsafe {
            let f: extern "C" fn(*const f64, *mut f64) = std::mem::transmute(code.0);
            f(inputs.as_ptr(), results.as_mut_ptr());
        }
    };

    Ok(Arc::new(wrapper))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::parse_expression;
    use std::collections::HashMap;

    fn var_map() -> HashMap<String, u32> {
        [("x", 0), ("y", 1), ("k", 2)]
            .into_iter()
            .map(|(n, i)| (n.to_string(), i))
            .collect()
    }

    #[test]
    fn test_host_isa_is_not_pic() {
        let isa = create_isa().unwrap();
        assert!(!isa.flags().is_pic());
        // the JIT module accepts the host ISA
        let _module = create_module(isa);
    }

    #[test]
    fn test_combined_function_matches_interpreter() {
        let vars = var_map();
        let exprs: Vec<Expr> = [
            "k * x^2 * y",
            "x / y - 3",
            "exp(x) + ln(y) * sqrt(k)",
            "sin(x) * cos(y) + x^0.5 + y^x",
            "-(x * y) + abs(x - y)",
        ]
        .iter()
        .map(|s| parse_expression(s, &vars).unwrap())
        .collect();

        let f = build_combined_function("test_fn", &exprs, 3).unwrap();
        let inputs = [1.3, 2.1, 0.7];
        let mut results = vec![0.0; exprs.len()];
        f(&inputs, &mut results);

        for (expr, got) in exprs.iter().zip(&results) {
            let expected = expr.eval(&inputs);
            assert!(
                (got - expected).abs() <= 1e-12 * expected.abs().max(1.0),
                "{expr}: {got} vs {expected}"
            );
        }
    }

    #[test]
    fn test_empty_function() {
        let f = build_combined_function("empty", &[], 2).unwrap();
        let mut results: Vec<f64> = vec![];
        f(&[1.0, 2.0], &mut results);
    }

    #[test]
    fn test_rejects_out_of_range_variable() {
        let exprs = vec![*Expr::var("z", 5)];
        assert!(matches!(
            build_combined_function("oob", &exprs, 3),
            Err(EquationError::InvalidInputLength { expected: 6, got: 3 })
        ));
    }
}
