//! Interchangeable evaluators for a symbolic model.
//!
//! An [`Evaluator`] computes `f(y, p)` and the dense Jacobian `∂f/∂y` for a fixed
//! model. Two symbolic backends are provided:
//!
//! - [`InterpretedEvaluator`] walks the expression trees on every call
//! - [`JitEvaluator`] compiles them to machine code with Cranelift once
//!
//! Both read the same expressions, so swapping one for the other only changes the
//! floating point evaluation order. The native module loaded from generated C
//! implements the trait as well (see `native`).
//!
//! # Example
//!
//! ```rust
//! use kinetic_codegen::prelude::*;
//!
//! let network = ReactionNetwork::from_json_str(r#"{
//!     "species": ["A", "B"],
//!     "parameters": {"k": 2.0},
//!     "reactions": [{"reactants": {"A": 1}, "products": {"B": 1}, "rate_constant": "k"}]
//! }"#).unwrap();
//! let model = network.to_model(ModelOptions::default());
//!
//! let evaluator = EvaluatorKind::Jit.build(&model).unwrap();
//! let dydt = evaluator.evaluate(&[1.0, 0.0], &[2.0]).unwrap();
//! assert_eq!(dydt, vec![-2.0, 2.0]);
//! ```

use std::fmt;

use crate::builder::build_combined_function;
use crate::errors::EquationError;
use crate::expr::Expr;
use crate::model::SymbolicModel;
use crate::types::CombinedJITFunction;

/// Evaluates a model's right-hand side and Jacobian.
///
/// Implementations hold no state between calls.
pub trait Evaluator: Send + Sync {
    /// Short backend name used in diagnostics.
    fn name(&self) -> &'static str;

    fn n_states(&self) -> usize;

    fn n_params(&self) -> usize;

    /// Writes `f(state, params)` into `out`.
    fn eval_into(&self, state: &[f64], params: &[f64], out: &mut [f64])
        -> Result<(), EquationError>;

    /// Whether `jacobian_into` evaluates an exact Jacobian.
    fn has_jacobian(&self) -> bool {
        false
    }

    /// Writes the dense row-major Jacobian `out[i * n + k] = ∂f_i/∂y_k`.
    ///
    /// The default implementation uses forward differences on `eval_into`.
    fn jacobian_into(
        &self,
        state: &[f64],
        params: &[f64],
        out: &mut [f64],
    ) -> Result<(), EquationError> {
        finite_difference_jacobian(self, state, params, out)
    }

    /// Allocating variant of [`eval_into`](Self::eval_into).
    fn evaluate(&self, state: &[f64], params: &[f64]) -> Result<Vec<f64>, EquationError> {
        let mut out = vec![0.0; self.n_states()];
        self.eval_into(state, params, &mut out)?;
        Ok(out)
    }

    /// Allocating variant of [`jacobian_into`](Self::jacobian_into).
    fn jacobian(&self, state: &[f64], params: &[f64]) -> Result<Vec<f64>, EquationError> {
        let n = self.n_states();
        let mut out = vec![0.0; n * n];
        self.jacobian_into(state, params, &mut out)?;
        Ok(out)
    }
}

/// Selects a symbolic evaluator backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvaluatorKind {
    /// Tree-walking interpreter, no compilation step
    Interpreted,
    /// Cranelift JIT
    #[default]
    Jit,
}

impl EvaluatorKind {
    /// Builds an evaluator of this kind for `model`.
    pub fn build(self, model: &SymbolicModel) -> Result<Box<dyn Evaluator>, EquationError> {
        Ok(match self {
            EvaluatorKind::Interpreted => Box::new(InterpretedEvaluator::new(model)),
            EvaluatorKind::Jit => Box::new(JitEvaluator::new(model)?),
        })
    }
}

impl fmt::Display for EvaluatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvaluatorKind::Interpreted => write!(f, "interpreted"),
            EvaluatorKind::Jit => write!(f, "jit"),
        }
    }
}

/// Checks buffer lengths and returns the `[y..., p...]` input vector.
pub(crate) fn check_and_pack(
    n_states: usize,
    n_params: usize,
    state: &[f64],
    params: &[f64],
    out_len: usize,
    expected_out: usize,
) -> Result<Vec<f64>, EquationError> {
    if state.len() != n_states {
        return Err(EquationError::InvalidInputLength {
            expected: n_states,
            got: state.len(),
        });
    }
    if params.len() != n_params {
        return Err(EquationError::InvalidInputLength {
            expected: n_states + n_params,
            got: n_states + params.len(),
        });
    }
    if out_len != expected_out {
        return Err(EquationError::InvalidOutputLength {
            expected: expected_out,
            got: out_len,
        });
    }
    let mut inputs = Vec::with_capacity(n_states + n_params);
    inputs.extend_from_slice(state);
    inputs.extend_from_slice(params);
    Ok(inputs)
}

/// Forward-difference Jacobian, one extra rhs evaluation per column.
pub fn finite_difference_jacobian<E: Evaluator + ?Sized>(
    evaluator: &E,
    state: &[f64],
    params: &[f64],
    out: &mut [f64],
) -> Result<(), EquationError> {
    let n = evaluator.n_states();
    if out.len() != n * n {
        return Err(EquationError::InvalidOutputLength {
            expected: n * n,
            got: out.len(),
        });
    }
    let sqrt_eps = f64::EPSILON.sqrt();
    let mut f0 = vec![0.0; n];
    let mut f1 = vec![0.0; n];
    evaluator.eval_into(state, params, &mut f0)?;

    let mut perturbed = state.to_vec();
    for k in 0..n {
        let y = state[k];
        let trial = y + sqrt_eps * y.abs().max(1e-8);
        // exactly representable step
        let h = trial - y;
        perturbed[k] = trial;
        evaluator.eval_into(&perturbed, params, &mut f1)?;
        perturbed[k] = y;
        for i in 0..n {
            out[i * n + k] = (f1[i] - f0[i]) / h;
        }
    }
    Ok(())
}

/// General-purpose evaluator that walks the expression trees.
pub struct InterpretedEvaluator {
    n_params: usize,
    rhs: Vec<Expr>,
    jacobian: Option<Vec<(usize, Expr)>>,
}

impl InterpretedEvaluator {
    pub fn new(model: &SymbolicModel) -> Self {
        let n = model.n_states();
        let jacobian = model.jacobian_nonzeros().map(|nz| {
            nz.into_iter()
                .map(|(row, col, expr)| (row * n + col, expr.clone()))
                .collect()
        });
        Self {
            n_params: model.n_params(),
            rhs: model.rhs().to_vec(),
            jacobian,
        }
    }
}

impl Evaluator for InterpretedEvaluator {
    fn name(&self) -> &'static str {
        "interpreted"
    }

    fn n_states(&self) -> usize {
        self.rhs.len()
    }

    fn n_params(&self) -> usize {
        self.n_params
    }

    fn eval_into(
        &self,
        state: &[f64],
        params: &[f64],
        out: &mut [f64],
    ) -> Result<(), EquationError> {
        let n = self.rhs.len();
        let inputs = check_and_pack(n, self.n_params, state, params, out.len(), n)?;
        for (slot, expr) in out.iter_mut().zip(&self.rhs) {
            *slot = expr.eval(&inputs);
        }
        Ok(())
    }

    fn has_jacobian(&self) -> bool {
        self.jacobian.is_some()
    }

    fn jacobian_into(
        &self,
        state: &[f64],
        params: &[f64],
        out: &mut [f64],
    ) -> Result<(), EquationError> {
        let Some(entries) = &self.jacobian else {
            return finite_difference_jacobian(self, state, params, out);
        };
        let n = self.rhs.len();
        let inputs = check_and_pack(n, self.n_params, state, params, out.len(), n * n)?;
        out.fill(0.0);
        for (pos, expr) in entries {
            out[*pos] = expr.eval(&inputs);
        }
        Ok(())
    }
}

/// Performance-oriented evaluator backed by Cranelift-compiled functions.
pub struct JitEvaluator {
    n_states: usize,
    n_params: usize,
    rhs_fn: CombinedJITFunction,
    /// Compiled nonzero entries and their row-major positions
    jacobian: Option<(CombinedJITFunction, Vec<usize>)>,
}

impl JitEvaluator {
    /// Compiles the model's rhs and, if present, the nonzero Jacobian entries.
    pub fn new(model: &SymbolicModel) -> Result<Self, EquationError> {
        let n = model.n_states();
        let input_len = model.input_len();
        let rhs_fn = build_combined_function("kinetic_rhs", model.rhs(), input_len)?;

        let jacobian = match model.jacobian_nonzeros() {
            Some(nonzeros) => {
                let positions = nonzeros.iter().map(|(r, c, _)| r * n + c).collect();
                let exprs: Vec<Expr> = nonzeros.into_iter().map(|(_, _, e)| e.clone()).collect();
                let jac_fn = build_combined_function("kinetic_jac", &exprs, input_len)?;
                Some((jac_fn, positions))
            }
            None => None,
        };

        Ok(Self {
            n_states: n,
            n_params: model.n_params(),
            rhs_fn,
            jacobian,
        })
    }
}

impl Evaluator for JitEvaluator {
    fn name(&self) -> &'static str {
        "jit"
    }

    fn n_states(&self) -> usize {
        self.n_states
    }

    fn n_params(&self) -> usize {
        self.n_params
    }

    fn eval_into(
        &self,
        state: &[f64],
        params: &[f64],
        out: &mut [f64],
    ) -> Result<(), EquationError> {
        let inputs = check_and_pack(
            self.n_states,
            self.n_params,
            state,
            params,
            out.len(),
            self.n_states,
        )?;
        (self.rhs_fn)(&inputs, out);
        Ok(())
    }

    fn has_jacobian(&self) -> bool {
        self.jacobian.is_some()
    }

    fn jacobian_into(
        &self,
        state: &[f64],
        params: &[f64],
        out: &mut [f64],
    ) -> Result<(), EquationError> {
        let Some((jac_fn, positions)) = &self.jacobian else {
            return finite_difference_jacobian(self, state, params, out);
        };
        let n = self.n_states;
        let inputs = check_and_pack(n, self.n_params, state, params, out.len(), n * n)?;
        let mut values = vec![0.0; positions.len()];
        jac_fn(&inputs, &mut values);
        out.fill(0.0);
        for (pos, value) in positions.iter().zip(values) {
            out[*pos] = value;
        }
        Ok(())
    }
}
