//! Integration driver.
//!
//! [`IntegrationDriver`] validates integration requests and hands them to the
//! backend chosen in [`DriverConfig`]:
//!
//! - `Backend::Symbolic` runs the in-crate Rosenbrock stepper over an interpreted
//!   or JIT evaluator
//! - `Backend::Native` generates C, builds it into a shared library and loads it.
//!   The CVODE template calls the generated `<prefix>_integrate`; the standalone
//!   template runs the Rosenbrock stepper over the native routines.
//!
//! Backend preparation (JIT compilation, code generation, the native build)
//! happens once in [`IntegrationDriver::new`]; `integrate` can then be called
//! any number of times.
//!
//! # Example
//!
//! ```rust
//! use kinetic_codegen::prelude::*;
//!
//! let network = ReactionNetwork::from_json_str(r#"{
//!     "species": ["A", "B"],
//!     "parameters": {"k": 1.0},
//!     "initial_concentrations": {"A": 1.0},
//!     "reactions": [{"reactants": {"A": 1}, "products": {"B": 1}, "rate_constant": "k"}]
//! }"#).unwrap();
//! let model = network.to_model(ModelOptions::default());
//!
//! let driver = IntegrationDriver::new(&model, DriverConfig::default()).unwrap();
//! let result = driver
//!     .integrate(&[0.0, 1.0], &model.initial_state().to_vec(), &[], 1e-8, 1e-10, &IntegrationOptions::default())
//!     .unwrap();
//! assert!((result.final_state()[0] - (-1.0f64).exp()).abs() < 1e-5);
//! ```

pub mod rosenbrock;

use std::fmt;
use std::path::PathBuf;

use colored::Colorize;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backends::vector::Vector;
use crate::codegen::{CodeGenerator, CodegenConfig, GeneratedArtifact, SolverTemplate};
use crate::errors::IntegrationError;
use crate::evaluator::{Evaluator, EvaluatorKind};
use crate::model::SymbolicModel;
use crate::native::{BuildConfig, NativeBuilder, NativeModule};

/// Relative or absolute tolerance, shared by all states or given per state.
#[derive(Debug, Clone, PartialEq)]
pub enum Tolerance {
    Scalar(f64),
    PerComponent(Vec<f64>),
}

impl From<f64> for Tolerance {
    fn from(value: f64) -> Self {
        Tolerance::Scalar(value)
    }
}

impl From<Vec<f64>> for Tolerance {
    fn from(values: Vec<f64>) -> Self {
        Tolerance::PerComponent(values)
    }
}

impl From<&[f64]> for Tolerance {
    fn from(values: &[f64]) -> Self {
        Tolerance::PerComponent(values.to_vec())
    }
}

impl<const N: usize> From<[f64; N]> for Tolerance {
    fn from(values: [f64; N]) -> Self {
        Tolerance::PerComponent(values.to_vec())
    }
}

impl Tolerance {
    /// One value per state, after checking length and sign.
    pub fn expand(&self, n_states: usize, name: &'static str) -> Result<Vec<f64>, IntegrationError> {
        let values = match self {
            Tolerance::Scalar(v) => vec![*v; n_states],
            Tolerance::PerComponent(v) if v.len() != n_states => {
                return Err(IntegrationError::ToleranceLength {
                    name,
                    expected: n_states,
                    got: v.len(),
                })
            }
            Tolerance::PerComponent(v) => v.clone(),
        };
        if let Some(bad) = values.iter().find(|v| !v.is_finite() || **v < 0.0) {
            return Err(IntegrationError::InvalidOption(format!(
                "{name} must be finite and non-negative, got {bad}"
            )));
        }
        Ok(values)
    }
}

/// Linear multistep family used by the CVODE driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Backward differentiation formulas, for stiff problems
    #[default]
    Bdf,
    /// Adams-Moulton, for non-stiff problems
    Adams,
}

/// Step control options.
///
/// `max_order` and `method` only affect the CVODE backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationOptions {
    /// Initial step size; estimated from the problem when unset
    pub first_step: Option<f64>,
    /// Upper bound on the step size
    pub max_step: Option<f64>,
    /// Step attempts allowed between two consecutive output times
    pub max_steps: usize,
    pub max_order: Option<u32>,
    pub method: Method,
}

impl Default for IntegrationOptions {
    fn default() -> Self {
        Self {
            first_step: None,
            max_step: None,
            max_steps: 5000,
            max_order: None,
            method: Method::default(),
        }
    }
}

impl IntegrationOptions {
    pub fn validate(&self) -> Result<(), IntegrationError> {
        let positive = |name: &str, value: Option<f64>| match value {
            Some(v) if !(v.is_finite() && v > 0.0) => Err(IntegrationError::InvalidOption(
                format!("{name} must be positive and finite, got {v}"),
            )),
            _ => Ok(()),
        };
        positive("first_step", self.first_step)?;
        positive("max_step", self.max_step)?;
        if self.max_steps == 0 {
            return Err(IntegrationError::InvalidOption(
                "max_steps must be at least 1".to_string(),
            ));
        }
        let order_limit = match self.method {
            Method::Bdf => 5,
            Method::Adams => 12,
        };
        if let Some(order) = self.max_order {
            if order == 0 || order > order_limit {
                return Err(IntegrationError::InvalidOption(format!(
                    "max_order must be in 1..={order_limit} for {:?}, got {order}",
                    self.method
                )));
            }
        }
        Ok(())
    }
}

/// Where right-hand side and Jacobian evaluations come from.
#[derive(Debug, Clone, PartialEq)]
pub enum Backend {
    /// Rosenbrock stepper over a symbolic evaluator
    Symbolic(EvaluatorKind),
    /// Generated C, compiled and loaded at driver construction
    Native {
        template: SolverTemplate,
        build: BuildConfig,
        /// Directory receiving generated sources and libraries
        workdir: PathBuf,
    },
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Symbolic(EvaluatorKind::default())
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Symbolic(kind) => write!(f, "{kind}"),
            Backend::Native { template, .. } => match template {
                SolverTemplate::Cvode => write!(f, "native-cvode"),
                SolverTemplate::Standalone => write!(f, "native-rosenbrock"),
            },
        }
    }
}

/// Driver configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverConfig {
    pub backend: Backend,
    /// Leading part of generated file and symbol names (native backends only)
    pub stem: Option<String>,
}

impl DriverConfig {
    pub fn symbolic(kind: EvaluatorKind) -> Self {
        Self {
            backend: Backend::Symbolic(kind),
            ..Default::default()
        }
    }

    pub fn native(template: SolverTemplate, build: BuildConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            backend: Backend::Native {
                template,
                build,
                workdir: workdir.into(),
            },
            ..Default::default()
        }
    }
}

/// Work counters of one integration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub backend: String,
    pub steps: u64,
    pub rejected_steps: u64,
    pub rhs_evaluations: u64,
    pub jacobian_evaluations: u64,
    /// LU factorizations (Rosenbrock) or linear solver setups (CVODE)
    pub decompositions: u64,
    /// Name of the generated artifact, for native backends
    pub artifact: Option<String>,
}

/// Trajectory and diagnostics of a successful integration.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationResult {
    pub times: Vec<f64>,
    /// One state vector per entry of `times`
    pub states: Vec<Vec<f64>>,
    pub diagnostics: Diagnostics,
}

impl IntegrationResult {
    /// State at the `index`-th output time, as any [`Vector`] type.
    pub fn state_at<V: Vector>(&self, index: usize) -> Option<V> {
        self.states.get(index).map(|s| V::from_slice(s))
    }

    pub fn final_state(&self) -> &[f64] {
        self.states.last().map(Vec::as_slice).unwrap_or_default()
    }

    /// Time course of state `index`.
    pub fn component(&self, index: usize) -> Vec<f64> {
        self.states.iter().map(|s| s[index]).collect()
    }
}

impl fmt::Display for IntegrationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.diagnostics;
        writeln!(
            f,
            "{} {} output times, backend {}",
            "Trajectory:".bold(),
            self.times.len(),
            d.backend.cyan()
        )?;
        writeln!(
            f,
            "  steps {} (rejected {}), rhs evaluations {}, jacobian evaluations {}, decompositions {}",
            d.steps, d.rejected_steps, d.rhs_evaluations, d.jacobian_evaluations, d.decompositions
        )?;
        if let Some(artifact) = &d.artifact {
            writeln!(f, "  artifact {}", artifact.green())?;
        }
        if let (Some(t), Some(y)) = (self.times.last(), self.states.last()) {
            write!(
                f,
                "  y({t:e}) = [{}]",
                y.iter().map(|v| format!("{v:e}")).join(", ")
            )?;
        }
        Ok(())
    }
}

enum Prepared {
    Evaluator(Box<dyn Evaluator>),
    Native {
        template: SolverTemplate,
        artifact: GeneratedArtifact,
        module: NativeModule,
    },
}

/// Validates integration requests and runs them on the configured backend.
pub struct IntegrationDriver {
    n_states: usize,
    n_params: usize,
    default_parameters: Vec<f64>,
    backend: String,
    prepared: Prepared,
}

impl fmt::Debug for IntegrationDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrationDriver")
            .field("backend", &self.backend)
            .field("n_states", &self.n_states)
            .field("n_params", &self.n_params)
            .finish()
    }
}

impl IntegrationDriver {
    /// Prepares the backend for `model`.
    ///
    /// Native backends generate, compile and load the model here, so build
    /// failures surface before any integration is attempted.
    pub fn new(model: &SymbolicModel, config: DriverConfig) -> Result<Self, IntegrationError> {
        let backend = config.backend.to_string();
        let prepared = match config.backend {
            Backend::Symbolic(kind) => Prepared::Evaluator(kind.build(model)?),
            Backend::Native {
                template,
                build,
                workdir,
            } => {
                let mut codegen = CodegenConfig {
                    template,
                    use_lapack: build.use_lapack,
                    ..Default::default()
                };
                if let Some(stem) = config.stem {
                    codegen.stem = stem;
                }
                let artifact = CodeGenerator::new(codegen).generate(model, &workdir)?;
                NativeBuilder::new(build).build(&artifact)?;
                let module = NativeModule::from_artifact(&artifact)?;
                Prepared::Native {
                    template,
                    artifact,
                    module,
                }
            }
        };
        debug!(backend = %backend, "integration driver ready");

        Ok(Self {
            n_states: model.n_states(),
            n_params: model.n_params(),
            default_parameters: model.default_parameters().to_vec(),
            backend,
            prepared,
        })
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// The generated artifact, for native backends.
    pub fn artifact(&self) -> Option<&GeneratedArtifact> {
        match &self.prepared {
            Prepared::Native { artifact, .. } => Some(artifact),
            Prepared::Evaluator(_) => None,
        }
    }

    /// The evaluator the Rosenbrock stepper uses, if any.
    pub fn evaluator(&self) -> Option<&dyn Evaluator> {
        match &self.prepared {
            Prepared::Evaluator(evaluator) => Some(evaluator.as_ref()),
            Prepared::Native {
                template: SolverTemplate::Standalone,
                module,
                ..
            } => Some(module),
            Prepared::Native { .. } => None,
        }
    }

    /// Integrates from `time_points[0]` and records the state at every time point.
    ///
    /// An empty `params` slice selects the model's default parameter values.
    ///
    /// # Errors
    /// Input validation errors are returned before anything runs; solver
    /// failures are forwarded unchanged.
    pub fn integrate(
        &self,
        time_points: &[f64],
        initial_state: &impl Vector,
        params: &[f64],
        rtol: impl Into<Tolerance>,
        atol: impl Into<Tolerance>,
        options: &IntegrationOptions,
    ) -> Result<IntegrationResult, IntegrationError> {
        let result = self.run(
            time_points,
            initial_state.as_slice(),
            params,
            rtol.into(),
            atol.into(),
            options,
        );
        match &result {
            Ok(r) => info!(
                backend = %self.backend,
                outputs = r.times.len(),
                steps = r.diagnostics.steps,
                rejected = r.diagnostics.rejected_steps,
                "integration finished"
            ),
            Err(err) => warn!(backend = %self.backend, error = %err, "integration failed"),
        }
        result
    }

    fn run(
        &self,
        time_points: &[f64],
        y0: &[f64],
        params: &[f64],
        rtol: Tolerance,
        atol: Tolerance,
        options: &IntegrationOptions,
    ) -> Result<IntegrationResult, IntegrationError> {
        self.validate_times(time_points)?;
        if y0.len() != self.n_states {
            return Err(IntegrationError::StateLength {
                expected: self.n_states,
                got: y0.len(),
            });
        }
        if y0.iter().any(|v| !v.is_finite()) {
            return Err(IntegrationError::InvalidOption(
                "initial state must be finite".to_string(),
            ));
        }
        let params = if params.is_empty() {
            &self.default_parameters[..]
        } else {
            params
        };
        if params.len() != self.n_params {
            return Err(IntegrationError::ParameterLength {
                expected: self.n_params,
                got: params.len(),
            });
        }
        let rtol_values = rtol.expand(self.n_states, "rtol")?;
        let atol_values = atol.expand(self.n_states, "atol")?;
        options.validate()?;

        let mut diagnostics = Diagnostics {
            backend: self.backend.clone(),
            ..Default::default()
        };

        let states = match &self.prepared {
            Prepared::Native {
                template: SolverTemplate::Cvode,
                module,
                artifact,
            } => {
                let Tolerance::Scalar(rtol) = rtol else {
                    return Err(IntegrationError::InvalidOption(
                        "the CVODE backend takes a scalar rtol".to_string(),
                    ));
                };
                let (atol, atol_vec) = match &atol {
                    Tolerance::Scalar(v) => (*v, None),
                    Tolerance::PerComponent(v) => (0.0, Some(v.as_slice())),
                };
                let (states, stats) =
                    module.integrate(time_points, y0, params, rtol, atol, atol_vec, options)?;
                diagnostics.steps = stats.steps;
                diagnostics.rejected_steps = stats.error_test_failures + stats.nonlinear_failures;
                diagnostics.rhs_evaluations = stats.rhs_evaluations;
                diagnostics.jacobian_evaluations = stats.jacobian_evaluations;
                diagnostics.decompositions = stats.linear_setups;
                diagnostics.artifact = Some(artifact.name.clone());
                states
            }
            prepared => {
                let evaluator: &dyn Evaluator = match prepared {
                    Prepared::Evaluator(evaluator) => evaluator.as_ref(),
                    Prepared::Native {
                        module, artifact, ..
                    } => {
                        diagnostics.artifact = Some(artifact.name.clone());
                        module
                    }
                };
                let (states, stats) = rosenbrock::integrate(
                    evaluator,
                    time_points,
                    y0,
                    params,
                    &rtol_values,
                    &atol_values,
                    options,
                )?;
                diagnostics.steps = stats.steps;
                diagnostics.rejected_steps = stats.rejected_steps;
                diagnostics.rhs_evaluations = stats.rhs_evaluations;
                diagnostics.jacobian_evaluations = stats.jacobian_evaluations;
                diagnostics.decompositions = stats.decompositions;
                states
            }
        };

        Ok(IntegrationResult {
            times: time_points.to_vec(),
            states,
            diagnostics,
        })
    }

    fn validate_times(&self, time_points: &[f64]) -> Result<(), IntegrationError> {
        if time_points.is_empty() {
            return Err(IntegrationError::NoTimePoints);
        }
        if let Some(bad) = time_points.iter().find(|t| !t.is_finite()) {
            return Err(IntegrationError::InvalidOption(format!(
                "time points must be finite, got {bad}"
            )));
        }
        if let Some((index, (previous, next))) = time_points
            .iter()
            .tuple_windows()
            .enumerate()
            .find(|(_, (a, b))| b < a)
        {
            return Err(IntegrationError::DecreasingTime {
                index: index + 1,
                previous: *previous,
                next: *next,
            });
        }
        Ok(())
    }
}
