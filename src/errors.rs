//! Error types for the kinetic-codegen crate.
//!
//! Every stage of the pipeline has its own error type so callers can tell where a
//! failure originated:
//!
//! - `DataFormatError`: malformed or inconsistent reaction-network input
//! - `ConvertError`: rate expressions that cannot be turned into the internal AST
//! - `BuilderError`: failures while JIT compiling expressions with Cranelift
//! - `CodegenError`: expressions or templates that cannot be rendered to C
//! - `BuildError`: the external compiler/linker or the dynamic loader failed
//! - `SolverError`: the numerical integrator gave up
//! - `IntegrationError`: invalid integration inputs, or any of the above
//!
//! `KineticError` wraps all of them for callers that drive the whole pipeline.

use std::path::PathBuf;

use cranelift_codegen::CodegenError as CraneliftCodegenError;
use cranelift_module::ModuleError;
use evalexpr::{DefaultNumericTypes, EvalexprError};
use thiserror::Error;

/// Errors raised while reading a reaction network description.
///
/// All of these surface before any symbolic model or code is generated.
#[derive(Error, Debug)]
pub enum DataFormatError {
    /// The file could not be read
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid JSON or lacks a required field
    #[error("invalid reaction network document: {0}")]
    Json(#[from] serde_json::Error),
    /// The network declares no species
    #[error("reaction network declares no species")]
    NoSpecies,
    /// A species name appears more than once
    #[error("duplicate species: {0}")]
    DuplicateSpecies(String),
    /// Two species sanitize to the same expression symbol
    #[error("species {first} and {second} share the expression symbol {symbol}")]
    SymbolClash {
        first: String,
        second: String,
        symbol: String,
    },
    /// A reaction or initial concentration references an undeclared species
    #[error("unknown species {species} in {context}")]
    UnknownSpecies { species: String, context: String },
    /// A rate constant references an undeclared parameter
    #[error("unknown parameter {parameter} in reaction {reaction}")]
    UnknownParameter { parameter: String, reaction: usize },
    /// A reaction has neither a rate constant nor an explicit rate expression
    #[error("reaction {0} has neither a rate_constant nor a rate expression")]
    MissingRate(usize),
    /// A reaction has no reactants and no products
    #[error("reaction {0} has no reactants and no products")]
    EmptyReaction(usize),
    /// A numeric field is NaN or infinite
    #[error("non-finite value for {0}")]
    NonFinite(String),
    /// A parameter name collides with a species symbol
    #[error("parameter {0} collides with a species symbol")]
    ParameterClash(String),
    /// An explicit rate expression could not be parsed
    #[error("invalid rate expression in reaction {reaction}: {source}")]
    RateExpression {
        reaction: usize,
        #[source]
        source: ConvertError,
    },
}

/// Errors that can occur during conversion from evalexpr AST to our internal AST representation.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// The expression string could not be parsed by evalexpr
    #[error("failed to parse expression: {0}")]
    Parse(#[from] EvalexprError<DefaultNumericTypes>),
    /// Error when encountering an operator that is not supported by our implementation
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// Error when encountering a function that is not supported by our implementation
    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),
    /// Error when the root node does not have exactly one child
    #[error("Expected single child for root node: {0}")]
    RootNode(String),
    /// Error when a constant value is not a number
    #[error("Expected numeric constant: {0}")]
    ConstOperator(String),
    /// Error when a variable is not found in the variable map
    #[error("Variable not found: {0}")]
    VariableNotFound(String),
    /// Error when an operator node has the wrong number of operands
    #[error("Operator {operator} expects {expected} operands, got {got}")]
    Arity {
        operator: String,
        expected: usize,
        got: usize,
    },
}

/// Errors that can occur during JIT compilation of expressions.
///
/// This enum represents various failure modes in the process of converting our AST
/// into machine code using Cranelift as the JIT compiler backend.
#[derive(Error, Debug)]
pub enum BuilderError {
    /// Error when the target machine architecture is not supported
    #[error("host machine is not supported: {0}")]
    HostMachineNotSupported(String),
    /// Error during Cranelift code generation
    #[error("codegen error: {0}")]
    CodegenError(CraneliftCodegenError),
    /// Error in the Cranelift JIT module
    #[error("module error: {0}")]
    ModuleError(ModuleError),
    /// Error when defining the JIT function
    #[error("function error: {0}")]
    FunctionError(String),
    /// Error when declaring the JIT function or one of its imports
    #[error("declaration error: {0}")]
    DeclarationError(String),
    /// Error when configuring the code generator
    #[error("invalid setting: {0}")]
    Setting(String),
}

/// Errors raised while rendering a symbolic model into C source.
#[derive(Error, Debug)]
pub enum CodegenError {
    /// A constant cannot be written as a C literal
    #[error("cannot render non-finite constant {value} in {location}")]
    NonFiniteConstant { value: f64, location: String },
    /// The template needs the Jacobian but the model was built without one
    #[error("model has no symbolic Jacobian; rebuild it with ModelOptions {{ jacobian: true }}")]
    MissingJacobian,
    /// A placeholder in the template has no value
    #[error("template placeholder ${{{0}}} was not provided")]
    UnresolvedPlaceholder(String),
    /// The symbol prefix is not a C identifier
    #[error("symbol prefix {0:?} is not a C identifier")]
    InvalidPrefix(String),
    /// A placeholder is opened but never closed
    #[error("unterminated placeholder at byte {0}")]
    UnterminatedPlaceholder(usize),
    /// Writing generated files failed
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The build descriptor could not be serialized
    #[error("failed to serialize build descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),
}

/// Errors raised by the external build toolchain or the dynamic loader.
///
/// Compiler output is carried verbatim; nothing is retried.
#[derive(Error, Debug)]
pub enum BuildError {
    /// The compiler executable could not be started
    #[error("failed to launch compiler {compiler}: {source}")]
    Launch {
        compiler: String,
        #[source]
        source: std::io::Error,
    },
    /// The compiler or linker exited unsuccessfully
    #[error(
        "compilation failed\n** exit code: {code:?}\n** command: {command}\n** stdout:\n{stdout}\n** stderr:\n{stderr}"
    )]
    CompilationFailed {
        code: Option<i32>,
        command: String,
        stdout: String,
        stderr: String,
    },
    /// The shared library could not be loaded
    #[error("failed to load {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
    /// The shared library does not export an expected symbol
    #[error("symbol {symbol} not found in {}: {source}", path.display())]
    MissingSymbol {
        symbol: String,
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
    /// The loaded library does not match the model it was generated from
    #[error("{} reports {got} {what}, expected {expected}", path.display())]
    DimensionMismatch {
        path: PathBuf,
        what: &'static str,
        expected: usize,
        got: usize,
    },
}

/// Failures reported by a numerical integrator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    /// The step budget was exhausted before reaching the next output time
    #[error("maximum number of steps ({max_steps}) exceeded at t = {t}")]
    TooManySteps { t: f64, max_steps: usize },
    /// The step size dropped below the floating point resolution of t
    #[error("step size {h} too small at t = {t}")]
    StepSizeTooSmall { t: f64, h: f64 },
    /// The iteration matrix could not be factorized
    #[error("singular iteration matrix at t = {t}")]
    SingularMatrix { t: f64 },
    /// The right-hand side produced NaN or infinity
    #[error("non-finite derivative at t = {t}")]
    NonFinite { t: f64 },
    /// A native solver returned a negative status flag
    #[error("native solver failed with flag {flag} at t = {t}")]
    Native { flag: i32, t: f64 },
}

/// Errors raised when evaluating a compiled or interpreted model.
#[derive(Debug, Error)]
pub enum EquationError {
    /// Error when the input length is not the same as the number of variables
    #[error("Invalid input length: expected {expected}, got {got}")]
    InvalidInputLength { expected: usize, got: usize },
    /// Error when the output length is not the same as the number of equations
    #[error("Invalid output length: expected {expected}, got {got}")]
    InvalidOutputLength { expected: usize, got: usize },
    /// Error when JIT compiling the model
    #[error("Failed to build JIT function")]
    BuildFunctionError(#[from] BuilderError),
    /// A generated native routine returned a non-zero status
    #[error("native routine {routine} returned status {status}")]
    NativeStatus { routine: String, status: i32 },
}

/// Errors surfaced by the integration driver.
#[derive(Debug, Error)]
pub enum IntegrationError {
    /// No time points were requested
    #[error("at least one time point is required")]
    NoTimePoints,
    /// Time points decrease somewhere
    #[error("time points must be non-decreasing (index {index}: {previous} > {next})")]
    DecreasingTime {
        index: usize,
        previous: f64,
        next: f64,
    },
    /// Initial state has the wrong length
    #[error("initial state has {got} entries, model has {expected} states")]
    StateLength { expected: usize, got: usize },
    /// Parameter vector has the wrong length
    #[error("parameter vector has {got} entries, model has {expected} parameters")]
    ParameterLength { expected: usize, got: usize },
    /// A per-component tolerance has the wrong length
    #[error("{name} has {got} components, model has {expected} states")]
    ToleranceLength {
        name: &'static str,
        expected: usize,
        got: usize,
    },
    /// A tolerance or option is outside its domain
    #[error("invalid option: {0}")]
    InvalidOption(String),
    /// The evaluator failed
    #[error(transparent)]
    Evaluation(#[from] EquationError),
    /// The integrator failed
    #[error(transparent)]
    Solver(#[from] SolverError),
    /// Code generation failed
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    /// Compiling or loading the native module failed
    #[error(transparent)]
    Build(#[from] BuildError),
}

/// Any failure across the load → generate → build → integrate pipeline.
#[derive(Debug, Error)]
pub enum KineticError {
    #[error(transparent)]
    DataFormat(#[from] DataFormatError),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error(transparent)]
    Equation(#[from] EquationError),
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Solver(#[from] SolverError),
    #[error(transparent)]
    Integration(#[from] IntegrationError),
}
