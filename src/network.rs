//! Loading reaction networks from JSON.
//!
//! A network document lists the species, the reactions between them, named rate
//! parameters and initial concentrations:
//!
//! ```json
//! {
//!   "name": "water autoprotolysis",
//!   "species": ["H2O", "H+", "OH-"],
//!   "initial_concentrations": { "H2O": 55.4e3, "H+": 1e-4, "OH-": 1e-4 },
//!   "parameters": { "kf": 2.5e-5, "kb": 1.4e8 },
//!   "reactions": [
//!     { "reactants": { "H2O": 1 }, "products": { "H+": 1, "OH-": 1 }, "rate_constant": "kf" },
//!     { "reactants": { "H+": 1, "OH-": 1 }, "products": { "H2O": 1 }, "rate_constant": "kb" }
//!   ]
//! }
//! ```
//!
//! Reactions follow mass action kinetics, `r = k * Π c_s^ν_s` over the reactants,
//! unless they carry an explicit `rate` string in evalexpr syntax. Inside such a
//! string species are referenced by their expression symbol (see [`species_symbol`])
//! and parameters by name.
//!
//! Parameters are ordered by name. Species keep the order of the `species` array,
//! which fixes the state ordering of every model built from the network.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::convert::parse_expression;
use crate::errors::DataFormatError;
use crate::expr::Expr;
use crate::model::{ModelOptions, SymbolicModel};

/// A rate constant given either inline or by parameter name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RateConstant {
    Value(f64),
    Parameter(String),
}

/// One reaction as it appears in the JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Reaction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub reactants: BTreeMap<String, u32>,
    #[serde(default)]
    pub products: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_constant: Option<RateConstant>,
    /// Explicit rate law, overrides mass action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct NetworkDocument {
    #[serde(default)]
    name: Option<String>,
    species: Vec<String>,
    #[serde(default)]
    initial_concentrations: BTreeMap<String, f64>,
    #[serde(default)]
    parameters: BTreeMap<String, f64>,
    reactions: Vec<Reaction>,
}

/// A validated reaction network.
///
/// Immutable once loaded; every reference inside it has been resolved.
#[derive(Debug, Clone)]
pub struct ReactionNetwork {
    name: Option<String>,
    species: Vec<String>,
    symbols: Vec<String>,
    parameters: Vec<String>,
    parameter_values: Vec<f64>,
    initial_state: Vec<f64>,
    reactions: Vec<Reaction>,
    rates: Vec<Expr>,
}

/// Maps a species name to the identifier used for it in expressions.
///
/// `+` becomes `_plus`, `-` becomes `_minus`, any other character that is not
/// ASCII alphanumeric becomes `_`, and a leading digit gets a `_` prefix.
///
/// ```rust
/// use kinetic_codegen::network::species_symbol;
///
/// assert_eq!(species_symbol("H+"), "H_plus");
/// assert_eq!(species_symbol("OH-"), "OH_minus");
/// assert_eq!(species_symbol("Fe(CN)6"), "Fe_CN_6");
/// ```
pub fn species_symbol(species: &str) -> String {
    let mut symbol = String::with_capacity(species.len() + 4);
    if species.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        symbol.push('_');
    }
    for c in species.chars() {
        match c {
            '+' => symbol.push_str("_plus"),
            '-' => symbol.push_str("_minus"),
            c if c.is_ascii_alphanumeric() || c == '_' => symbol.push(c),
            _ => symbol.push('_'),
        }
    }
    symbol
}

impl ReactionNetwork {
    /// Reads and validates a network from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DataFormatError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| DataFormatError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loading reaction network");
        Self::from_json_str(&text)
    }

    /// Parses and validates a network from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, DataFormatError> {
        let document: NetworkDocument = serde_json::from_str(text)?;
        Self::from_document(document)
    }

    fn from_document(doc: NetworkDocument) -> Result<Self, DataFormatError> {
        if doc.species.is_empty() {
            return Err(DataFormatError::NoSpecies);
        }

        let mut species_index: HashMap<&str, usize> = HashMap::new();
        let mut symbol_owner: HashMap<String, &str> = HashMap::new();
        let mut symbols = Vec::with_capacity(doc.species.len());
        for (i, species) in doc.species.iter().enumerate() {
            if species_index.insert(species.as_str(), i).is_some() {
                return Err(DataFormatError::DuplicateSpecies(species.clone()));
            }
            let symbol = species_symbol(species);
            if let Some(first) = symbol_owner.insert(symbol.clone(), species.as_str()) {
                return Err(DataFormatError::SymbolClash {
                    first: first.to_string(),
                    second: species.clone(),
                    symbol,
                });
            }
            symbols.push(symbol);
        }

        let n_states = doc.species.len();
        let mut var_map: HashMap<String, u32> = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u32))
            .collect();

        let mut parameters = Vec::with_capacity(doc.parameters.len());
        let mut parameter_values = Vec::with_capacity(doc.parameters.len());
        for (k, (name, value)) in doc.parameters.iter().enumerate() {
            if symbol_owner.contains_key(name) {
                return Err(DataFormatError::ParameterClash(name.clone()));
            }
            if !value.is_finite() {
                return Err(DataFormatError::NonFinite(format!("parameter {name}")));
            }
            var_map.insert(name.clone(), (n_states + k) as u32);
            parameters.push(name.clone());
            parameter_values.push(*value);
        }

        let mut initial_state = vec![0.0; n_states];
        for (species, value) in &doc.initial_concentrations {
            let index = *species_index.get(species.as_str()).ok_or_else(|| {
                DataFormatError::UnknownSpecies {
                    species: species.clone(),
                    context: "initial_concentrations".to_string(),
                }
            })?;
            if !value.is_finite() {
                return Err(DataFormatError::NonFinite(format!(
                    "initial concentration of {species}"
                )));
            }
            initial_state[index] = *value;
        }

        let mut rates = Vec::with_capacity(doc.reactions.len());
        for (r, reaction) in doc.reactions.iter().enumerate() {
            if reaction.reactants.is_empty() && reaction.products.is_empty() {
                return Err(DataFormatError::EmptyReaction(r));
            }
            for species in reaction.reactants.keys().chain(reaction.products.keys()) {
                if !species_index.contains_key(species.as_str()) {
                    return Err(DataFormatError::UnknownSpecies {
                        species: species.clone(),
                        context: format!("reaction {r}"),
                    });
                }
            }

            let rate = match (&reaction.rate, &reaction.rate_constant) {
                (Some(text), _) => parse_expression(text, &var_map)
                    .map_err(|source| DataFormatError::RateExpression { reaction: r, source })?,
                (None, Some(constant)) => {
                    let k = match constant {
                        RateConstant::Value(v) if v.is_finite() => Expr::Const(*v),
                        RateConstant::Value(_) => {
                            return Err(DataFormatError::NonFinite(format!(
                                "rate constant of reaction {r}"
                            )))
                        }
                        RateConstant::Parameter(name) => {
                            let index = var_map
                                .get(name)
                                .filter(|&&i| i as usize >= n_states)
                                .ok_or_else(|| DataFormatError::UnknownParameter {
                                    parameter: name.clone(),
                                    reaction: r,
                                })?;
                            *Expr::var(name.clone(), *index)
                        }
                    };
                    mass_action(k, &reaction.reactants, &species_index, &symbols)
                }
                (None, None) => return Err(DataFormatError::MissingRate(r)),
            };
            rates.push(rate);
        }

        debug!(
            species = n_states,
            parameters = parameters.len(),
            reactions = rates.len(),
            "validated reaction network"
        );

        Ok(Self {
            name: doc.name,
            species: doc.species,
            symbols,
            parameters,
            parameter_values,
            initial_state,
            reactions: doc.reactions,
            rates,
        })
    }

    /// Builds the symbolic model of this network.
    pub fn to_model(&self, options: ModelOptions) -> SymbolicModel {
        SymbolicModel::from_network(self, options)
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Species names in state order.
    pub fn species(&self) -> &[String] {
        &self.species
    }

    /// Expression symbols of the species, index-aligned with [`species`](Self::species).
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Parameter names, sorted.
    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    /// Default parameter values, index-aligned with [`parameters`](Self::parameters).
    pub fn parameter_values(&self) -> &[f64] {
        &self.parameter_values
    }

    /// Initial concentrations; species missing from the document start at zero.
    pub fn initial_state(&self) -> &[f64] {
        &self.initial_state
    }

    pub fn reactions(&self) -> &[Reaction] {
        &self.reactions
    }

    /// Rate expression of every reaction over the `[y..., p...]` layout.
    pub fn rates(&self) -> &[Expr] {
        &self.rates
    }

    /// Net stoichiometric coefficient of `species` in `reaction` (products minus reactants).
    pub fn net_stoichiometry(&self, reaction: usize, species: usize) -> i64 {
        let name = &self.species[species];
        let r = &self.reactions[reaction];
        let produced = r.products.get(name).copied().unwrap_or(0) as i64;
        let consumed = r.reactants.get(name).copied().unwrap_or(0) as i64;
        produced - consumed
    }
}

fn mass_action(
    k: Expr,
    reactants: &BTreeMap<String, u32>,
    species_index: &HashMap<&str, usize>,
    symbols: &[String],
) -> Expr {
    // reactants sorted by state index so the generated product is stable
    let mut ordered: Vec<(usize, u32)> = reactants
        .iter()
        .filter(|(_, &nu)| nu > 0)
        .map(|(s, &nu)| (species_index[s.as_str()], nu))
        .collect();
    ordered.sort_unstable();

    ordered.into_iter().fold(k, |acc, (i, nu)| {
        let concentration = Expr::var(symbols[i].clone(), i as u32);
        let factor = if nu == 1 {
            concentration
        } else {
            Box::new(Expr::Pow(concentration, nu as i64))
        };
        Expr::Mul(Box::new(acc), factor)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WATER: &str = r#"{
        "species": ["H2O", "H+", "OH-"],
        "initial_concentrations": {"H2O": 55.4e3, "H+": 1e-4, "OH-": 1e-4},
        "parameters": {"kf": 2.5e-5, "kb": 1.4e8},
        "reactions": [
            {"reactants": {"H2O": 1}, "products": {"H+": 1, "OH-": 1}, "rate_constant": "kf"},
            {"reactants": {"H+": 1, "OH-": 1}, "products": {"H2O": 1}, "rate_constant": "kb"}
        ]
    }"#;

    #[test]
    fn test_load_water() {
        let net = ReactionNetwork::from_json_str(WATER).unwrap();
        assert_eq!(net.species(), ["H2O", "H+", "OH-"]);
        assert_eq!(net.symbols(), ["H2O", "H_plus", "OH_minus"]);
        assert_eq!(net.parameters(), ["kb", "kf"]);
        assert_eq!(net.parameter_values(), [1.4e8, 2.5e-5]);
        assert_eq!(net.initial_state(), [55.4e3, 1e-4, 1e-4]);
        assert_eq!(net.net_stoichiometry(0, 0), -1);
        assert_eq!(net.net_stoichiometry(1, 2), -1);

        // r1 = kb * [H+] * [OH-]
        let vars = [55.4e3, 2.0, 3.0, 1.4e8, 2.5e-5];
        assert_eq!(net.rates()[1].eval(&vars), 1.4e8 * 6.0);
        assert_eq!(net.rates()[0].eval(&vars), 2.5e-5 * 55.4e3);
    }

    #[test]
    fn test_explicit_rate_and_inline_constant() {
        let net = ReactionNetwork::from_json_str(
            r#"{
                "species": ["A", "B"],
                "reactions": [
                    {"reactants": {"A": 2}, "products": {"B": 1}, "rate_constant": 0.5},
                    {"reactants": {"B": 1}, "products": {}, "rate": "B / (1 + B)"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(net.initial_state(), [0.0, 0.0]);
        assert_eq!(net.rates()[0].eval(&[3.0, 0.0]), 4.5);
        assert_eq!(net.rates()[1].eval(&[0.0, 1.0]), 0.5);
    }

    #[test]
    fn test_missing_species_field() {
        let err = ReactionNetwork::from_json_str(r#"{"reactions": []}"#).unwrap_err();
        assert!(matches!(err, DataFormatError::Json(_)));
    }

    #[test]
    fn test_rejects_inconsistent_documents() {
        let cases = [
            (r#"{"species": [], "reactions": []}"#, "no species"),
            (r#"{"species": ["A", "A"], "reactions": []}"#, "duplicate"),
            (r#"{"species": ["A+", "A_plus"], "reactions": []}"#, "clash"),
            (
                r#"{"species": ["A"], "reactions": [{"reactants": {"B": 1}, "rate_constant": 1}]}"#,
                "unknown species",
            ),
            (
                r#"{"species": ["A"], "reactions": [{"reactants": {"A": 1}, "rate_constant": "k"}]}"#,
                "unknown parameter",
            ),
            (
                r#"{"species": ["A"], "reactions": [{"reactants": {"A": 1}}]}"#,
                "missing rate",
            ),
            (
                r#"{"species": ["A"], "reactions": [{"rate_constant": 1}]}"#,
                "empty reaction",
            ),
            (
                r#"{"species": ["A"], "reactions": [{"reactants": {"A": 1}, "rate": "k * A"}]}"#,
                "bad rate expression",
            ),
            (
                r#"{"species": ["A"], "initial_concentrations": {"B": 1.0}, "reactions": []}"#,
                "unknown initial species",
            ),
            (
                r#"{"species": ["A"], "parameters": {"A": 1.0}, "reactions": []}"#,
                "parameter clash",
            ),
        ];
        for (doc, what) in cases {
            assert!(ReactionNetwork::from_json_str(doc).is_err(), "{what} accepted");
        }
    }

    #[test]
    fn test_rate_constant_must_name_a_parameter() {
        // a species symbol is not a parameter
        let err = ReactionNetwork::from_json_str(
            r#"{"species": ["A", "B"], "reactions": [{"reactants": {"A": 1}, "rate_constant": "B"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DataFormatError::UnknownParameter { reaction: 0, .. }
        ));
    }

    #[test]
    fn test_species_symbol() {
        assert_eq!(species_symbol("H+"), "H_plus");
        assert_eq!(species_symbol("OH-"), "OH_minus");
        assert_eq!(species_symbol("2A"), "_2A");
        assert_eq!(species_symbol("CO2"), "CO2");
    }
}
