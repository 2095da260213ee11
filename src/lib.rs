//! Symbolic reaction-network models with interchangeable evaluators and native code generation.
//!
//! This crate turns a JSON reaction network into a symbolic ODE model, evaluates it with a
//! tree-walking interpreter or a [Cranelift](https://github.com/bytecodealliance/wasmtime/tree/main/cranelift)
//! JIT, and renders it into C that is compiled and loaded at runtime. Rate expressions are parsed
//! with [evalexpr](https://github.com/ISibboI/evalexpr).
//!
//! # Features
//!
//! - Mass-action and explicit rate laws, symbolic Jacobian by differentiation
//! - Interpreted and JIT evaluators behind one [`Evaluator`](evaluator::Evaluator) trait
//! - C code generation from templates, with a SUNDIALS CVODE driver or standalone routines
//! - Native build and dynamic loading of the generated code
//! - Integration driver with an L-stable Rosenbrock stepper for stiff systems
//!
//! # Example
//!
//! ```rust
//! use kinetic_codegen::prelude::*;
//!
//! let network = ReactionNetwork::from_json_str(r#"{
//!     "species": ["H2O", "H+", "OH-"],
//!     "parameters": {"kf": 2.5e-5, "kb": 1.4e8},
//!     "initial_concentrations": {"H2O": 55.4e3, "H+": 1e-4, "OH-": 1e-4},
//!     "reactions": [
//!         {"reactants": {"H2O": 1}, "products": {"H+": 1, "OH-": 1}, "rate_constant": "kf"},
//!         {"reactants": {"H+": 1, "OH-": 1}, "products": {"H2O": 1}, "rate_constant": "kb"}
//!     ]
//! }"#).unwrap();
//! let model = network.to_model(ModelOptions::default());
//!
//! // Swap evaluators without touching the model
//! let jit = EvaluatorKind::Jit.build(&model).unwrap();
//! let interpreted = EvaluatorKind::Interpreted.build(&model).unwrap();
//! let y = model.initial_state();
//! let p = model.default_parameters();
//! assert_eq!(jit.evaluate(y, p).unwrap().len(), 3);
//! assert_eq!(jit.jacobian(y, p).unwrap().len(), 9);
//! assert!((jit.evaluate(y, p).unwrap()[0] - interpreted.evaluate(y, p).unwrap()[0]).abs() < 1e-12);
//! ```

pub mod prelude {
    pub use crate::backends::vector::Vector;
    pub use crate::codegen::{
        BuildDescriptor, CodeGenerator, CodegenConfig, GeneratedArtifact, SolverTemplate,
    };
    pub use crate::errors::{
        BuildError, CodegenError, DataFormatError, EquationError, IntegrationError, KineticError,
        SolverError,
    };
    pub use crate::evaluator::{Evaluator, EvaluatorKind, InterpretedEvaluator, JitEvaluator};
    pub use crate::expr::Expr;
    pub use crate::integrate::{
        Backend, Diagnostics, DriverConfig, IntegrationDriver, IntegrationOptions,
        IntegrationResult, Method, Tolerance,
    };
    pub use crate::model::{ModelOptions, SymbolicModel};
    pub use crate::native::{BuildConfig, NativeBuilder, NativeModule};
    pub use crate::network::ReactionNetwork;
}

/// Vector types accepted for states and results
pub mod backends {
    pub mod vector;
}
/// JIT compilation functionality using Cranelift
pub mod builder;
/// C source generation from templates
pub mod codegen;
/// Conversion from parsed expressions to internal AST
pub mod convert;
/// Error types for the various failure modes
pub mod errors;
/// Interpreted and JIT evaluators
pub mod evaluator;
/// Expression tree representation and symbolic differentiation
pub mod expr;
/// Integration driver and the Rosenbrock stepper
pub mod integrate;
/// Symbolic ODE model built from a reaction network
pub mod model;
/// Native build and dynamic loading of generated code
pub mod native;
/// Reaction network input format
pub mod network;
/// Functions for linking external functions to the expression tree
pub(crate) mod operators;
/// Constant folding and fused multiply-add rewriting of flattened expressions
pub(crate) mod opt;
/// Shared function types
pub mod types;
