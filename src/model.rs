//! Symbolic right-hand side and Jacobian of a reaction network.
//!
//! For a network with species `y` and reactions `r_j`, the model holds
//!
//! ```text
//! f_i = Σ_j (ν_prod(i, j) − ν_reac(i, j)) · r_j(y, p)
//! J[i][k] = ∂f_i / ∂y_k
//! ```
//!
//! Every expression addresses its inputs through the flat layout `[y..., p...]`.
//! All expressions are simplified, so a Jacobian entry that does not depend on
//! its column species is exactly `Const(0.0)` and can be skipped by consumers.

use colored::Colorize;
use itertools::Itertools;
use rayon::prelude::*;
use tracing::debug;

use crate::expr::Expr;
use crate::network::ReactionNetwork;

/// Options for building a [`SymbolicModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelOptions {
    /// Derive the dense symbolic Jacobian
    pub jacobian: bool,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self { jacobian: true }
    }
}

/// Right-hand side expressions and (optionally) their Jacobian.
#[derive(Debug, Clone)]
pub struct SymbolicModel {
    name: Option<String>,
    species: Vec<String>,
    symbols: Vec<String>,
    parameters: Vec<String>,
    default_parameters: Vec<f64>,
    initial_state: Vec<f64>,
    rhs: Vec<Expr>,
    /// Row-major, `n_states * n_states` entries
    jacobian: Option<Vec<Expr>>,
}

impl SymbolicModel {
    /// Builds the model of a validated network.
    pub fn from_network(network: &ReactionNetwork, options: ModelOptions) -> Self {
        let n = network.species().len();

        let rhs: Vec<Expr> = (0..n)
            .map(|i| {
                let terms = network
                    .rates()
                    .iter()
                    .enumerate()
                    .map(|(j, rate)| (network.net_stoichiometry(j, i), rate))
                    .filter(|(nu, _)| *nu != 0);
                *net_rate(terms).simplify()
            })
            .collect();

        let jacobian = options
            .jacobian
            .then(|| differentiate(&rhs, network.symbols()));

        let model = Self {
            name: network.name().map(str::to_string),
            species: network.species().to_vec(),
            symbols: network.symbols().to_vec(),
            parameters: network.parameters().to_vec(),
            default_parameters: network.parameter_values().to_vec(),
            initial_state: network.initial_state().to_vec(),
            rhs,
            jacobian,
        };

        debug!(
            states = model.n_states(),
            parameters = model.n_params(),
            jacobian_nonzeros = model.jacobian_nonzeros().map(|nz| nz.len()),
            "built symbolic model"
        );
        model
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Number of state variables.
    pub fn n_states(&self) -> usize {
        self.rhs.len()
    }

    /// Number of parameters.
    pub fn n_params(&self) -> usize {
        self.parameters.len()
    }

    /// Length of the evaluator input, `n_states + n_params`.
    pub fn input_len(&self) -> usize {
        self.n_states() + self.n_params()
    }

    /// Species names in state order.
    pub fn species(&self) -> &[String] {
        &self.species
    }

    /// Expression symbols of the states.
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    /// Parameter values from the network document.
    pub fn default_parameters(&self) -> &[f64] {
        &self.default_parameters
    }

    /// Initial concentrations from the network document.
    pub fn initial_state(&self) -> &[f64] {
        &self.initial_state
    }

    /// One derivative expression per state.
    pub fn rhs(&self) -> &[Expr] {
        &self.rhs
    }

    /// The dense Jacobian in row-major order, if it was built.
    pub fn jacobian(&self) -> Option<&[Expr]> {
        self.jacobian.as_deref()
    }

    /// `∂f_row / ∂y_col`.
    ///
    /// # Panics
    /// Panics if either index is out of range.
    pub fn jacobian_entry(&self, row: usize, col: usize) -> Option<&Expr> {
        let n = self.n_states();
        assert!(row < n && col < n, "Jacobian index ({row}, {col}) out of range");
        self.jacobian.as_ref().map(|j| &j[row * n + col])
    }

    /// `(row, col, expr)` for every entry that is not structurally zero, column by column.
    pub fn jacobian_nonzeros(&self) -> Option<Vec<(usize, usize, &Expr)>> {
        let n = self.n_states();
        let jac = self.jacobian.as_ref()?;
        Some(
            (0..n)
                .cartesian_product(0..n)
                .map(|(col, row)| (row, col, &jac[row * n + col]))
                .filter(|(_, _, e)| !e.is_zero())
                .collect(),
        )
    }
}

fn net_rate<'a>(terms: impl Iterator<Item = (i64, &'a Expr)>) -> Box<Expr> {
    terms.fold(Box::new(Expr::Const(0.0)), |acc, (nu, rate)| {
        let magnitude = nu.unsigned_abs();
        let term = if magnitude == 1 {
            Box::new(rate.clone())
        } else {
            Box::new(Expr::Mul(
                Box::new(Expr::Const(magnitude as f64)),
                Box::new(rate.clone()),
            ))
        };
        if nu > 0 {
            Box::new(Expr::Add(acc, term))
        } else {
            Box::new(Expr::Sub(acc, term))
        }
    })
}

/// Differentiates every rhs entry against every state, in parallel.
fn differentiate(rhs: &[Expr], symbols: &[String]) -> Vec<Expr> {
    let n = rhs.len();
    (0..n * n)
        .into_par_iter()
        .map(|idx| {
            let (row, col) = (idx / n, idx % n);
            *rhs[row].derivative(&symbols[col]).simplify()
        })
        .collect()
}

impl std::fmt::Display for SymbolicModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{{\n")?;
        if let Some(name) = &self.name {
            writeln!(f, "    {}: {}\n", "Model".cyan(), name)?;
        }
        writeln!(
            f,
            "    {}: {}\n",
            "States".cyan(),
            self.species.iter().join(", ")
        )?;
        writeln!(
            f,
            "    {}: {}\n",
            "Parameters".cyan(),
            self.parameters
                .iter()
                .zip(&self.default_parameters)
                .map(|(p, v)| format!("{p}={v:e}"))
                .join(", ")
        )?;
        for (species, expr) in self.species.iter().zip(&self.rhs) {
            writeln!(f, "    d[{}]/dt = {}", species.green(), expr)?;
        }
        if let Some(nonzeros) = self.jacobian_nonzeros() {
            writeln!(
                f,
                "\n    {}: {} of {} entries nonzero",
                "Jacobian".cyan(),
                nonzeros.len(),
                self.n_states() * self.n_states()
            )?;
        }
        writeln!(f, "}}")
    }
}
