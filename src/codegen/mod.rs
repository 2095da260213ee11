//! C code generation for symbolic models.
//!
//! The generator renders the model's right-hand side and the nonzero entries of
//! its Jacobian as C expressions over flat arrays (`y[i]`, `p[k]`) and fills them
//! into a fixed source template. With [`SolverTemplate::Cvode`] the source also
//! carries an `<prefix>_integrate` entry point driving SUNDIALS CVODE.
//!
//! Each call to [`CodeGenerator::generate`] draws a fresh UUID and uses it for every
//! file and symbol it produces, so repeated runs in one directory never collide
//! with, or load, a stale module.
//!
//! # Generated symbols
//!
//! ```c
//! int64_t <prefix>_n_states(void);
//! int64_t <prefix>_n_params(void);
//! int <prefix>_rhs(double t, const double *y, const double *p, double *dydt);
//! int <prefix>_dense_jac(double t, const double *y, const double *p, double *jac, int ldim);
//! int <prefix>_integrate(...);  /* Cvode template only */
//! ```

pub mod template;

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::errors::CodegenError;
use crate::model::SymbolicModel;
use template::{render, Substitutions};

const MODEL_TEMPLATE: &str = include_str!("templates/model.c.tpl");
const CVODE_TEMPLATE: &str = include_str!("templates/cvode.c.tpl");

/// Which driver section is emitted after the model routines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverTemplate {
    /// `<prefix>_integrate` against SUNDIALS CVODE
    #[default]
    Cvode,
    /// Only the rhs and Jacobian routines
    Standalone,
}

/// Code generation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodegenConfig {
    pub template: SolverTemplate,
    /// Use the LAPACK dense linear solver instead of the built-in one (Cvode only)
    pub use_lapack: bool,
    /// Leading part of every generated name; must be a C identifier
    pub stem: String,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        Self {
            template: SolverTemplate::default(),
            use_lapack: false,
            stem: "kinetic".to_string(),
        }
    }
}

/// What a generated source file needs to be built, written next to it as JSON.
///
/// The build fields are empty after generation and filled in by the native
/// builder once it has compiled the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildDescriptor {
    pub run_id: String,
    pub prefix: String,
    pub template: SolverTemplate,
    pub use_lapack: bool,
    pub n_states: usize,
    pub n_params: usize,
    pub source: PathBuf,
    pub output: PathBuf,
    /// Libraries the generated source links against, before platform policy
    pub libraries: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiler: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub include_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub library_dirs: Vec<PathBuf>,
}

impl BuildDescriptor {
    /// Writes the descriptor as pretty-printed JSON.
    pub fn write(&self, path: &Path) -> Result<(), CodegenError> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|source| CodegenError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Files and names produced by one code generation run.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedArtifact {
    pub run_id: Uuid,
    /// `<stem>_<uuid>`, used for file names and as the C symbol prefix
    pub name: String,
    pub dir: PathBuf,
    pub source_path: PathBuf,
    pub descriptor_path: PathBuf,
    pub library_path: PathBuf,
    pub descriptor: BuildDescriptor,
}

impl GeneratedArtifact {
    /// Prefix of every exported C symbol.
    pub fn prefix(&self) -> &str {
        &self.name
    }
}

/// Renders models into C source files.
#[derive(Debug, Clone, Default)]
pub struct CodeGenerator {
    config: CodegenConfig,
}

impl CodeGenerator {
    pub fn new(config: CodegenConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CodegenConfig {
        &self.config
    }

    /// Renders the complete C source for `model` with symbols named `<prefix>_*`.
    ///
    /// Pure: touches neither the filesystem nor any global state.
    pub fn render_source(
        &self,
        model: &SymbolicModel,
        prefix: &str,
    ) -> Result<String, CodegenError> {
        if !is_c_identifier(prefix) {
            return Err(CodegenError::InvalidPrefix(prefix.to_string()));
        }
        let n = model.n_states();
        let nonzeros = model
            .jacobian_nonzeros()
            .ok_or(CodegenError::MissingJacobian)?;

        let mut rhs_body = String::new();
        for (i, expr) in model.rhs().iter().enumerate() {
            let _ = writeln!(rhs_body, "    dydt[{i}] = {};", expr.to_c(n)?);
        }

        let mut jac_body = String::new();
        let mut current_col = None;
        for (row, col, expr) in nonzeros {
            if current_col != Some(col) {
                let _ = writeln!(jac_body, "    /* d/d {} */", model.symbols()[col]);
                current_col = Some(col);
            }
            let _ = writeln!(jac_body, "    jac[{col}*ldim + {row}] = {};", expr.to_c(n)?);
        }

        let mut values = Substitutions::new();
        values
            .set("prefix", prefix)
            .set(
                "header",
                format!(
                    "Generated by kinetic-codegen {} for {}",
                    env!("CARGO_PKG_VERSION"),
                    model.name().map(comment_safe).unwrap_or_else(|| "an unnamed model".into())
                ),
            )
            .set("state_layout", layout_comment("y", model.symbols()))
            .set("parameter_layout", layout_comment("p", model.parameters()))
            .set("n_states", n)
            .set("n_params", model.n_params())
            .set("rhs_body", rhs_body.trim_end())
            .set("jac_body", jac_body.trim_end());

        match self.config.template {
            SolverTemplate::Standalone => {
                values.set("solver_includes", "").set("driver", "");
            }
            SolverTemplate::Cvode => {
                let (linsol_header, linear_solver) = if self.config.use_lapack {
                    ("sunlinsol/sunlinsol_lapackdense.h", "SUNLinSol_LapackDense")
                } else {
                    ("sunlinsol/sunlinsol_dense.h", "SUNLinSol_Dense")
                };
                values
                    .set(
                        "solver_includes",
                        format!(
                            "#include <cvode/cvode.h>\n\
                             #include <nvector/nvector_serial.h>\n\
                             #include <sunmatrix/sunmatrix_dense.h>\n\
                             #include <{linsol_header}>\n"
                        ),
                    )
                    .set("linear_solver", linear_solver);
                let driver = render(CVODE_TEMPLATE, &values)?;
                values.set("driver", driver);
            }
        }

        render(MODEL_TEMPLATE, &values)
    }

    /// Writes `<name>.c` and `<name>.build.json` into `dir` under a fresh name.
    pub fn generate(
        &self,
        model: &SymbolicModel,
        dir: impl AsRef<Path>,
    ) -> Result<GeneratedArtifact, CodegenError> {
        let dir = dir.as_ref();
        let run_id = Uuid::new_v4();
        let name = format!("{}_{}", self.config.stem, run_id.simple());

        let source = self.render_source(model, &name)?;

        std::fs::create_dir_all(dir).map_err(|source| CodegenError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let source_path = dir.join(format!("{name}.c"));
        let descriptor_path = dir.join(format!("{name}.build.json"));
        let library_path = dir.join(shared_library_file_name(&name));

        std::fs::write(&source_path, source).map_err(|source| CodegenError::Io {
            path: source_path.clone(),
            source,
        })?;

        let descriptor = BuildDescriptor {
            run_id: run_id.to_string(),
            prefix: name.clone(),
            template: self.config.template,
            use_lapack: self.config.use_lapack,
            n_states: model.n_states(),
            n_params: model.n_params(),
            source: source_path.clone(),
            output: library_path.clone(),
            libraries: required_libraries(self.config.template, self.config.use_lapack),
            compiler: None,
            flags: Vec::new(),
            include_dirs: Vec::new(),
            library_dirs: Vec::new(),
        };
        descriptor.write(&descriptor_path)?;

        debug!(
            run_id = %run_id,
            source = %source_path.display(),
            template = ?self.config.template,
            "generated C source"
        );

        Ok(GeneratedArtifact {
            run_id,
            name,
            dir: dir.to_path_buf(),
            source_path,
            descriptor_path,
            library_path,
            descriptor,
        })
    }
}

/// Libraries a template links against; `m` is listed unconditionally and
/// dropped by the builder where the platform has no separate math library.
fn required_libraries(template: SolverTemplate, use_lapack: bool) -> Vec<String> {
    let mut libs: Vec<&str> = match template {
        SolverTemplate::Standalone => vec![],
        SolverTemplate::Cvode => vec![
            "sundials_cvode",
            "sundials_nvecserial",
            "sundials_sunmatrixdense",
            if use_lapack {
                "sundials_sunlinsollapackdense"
            } else {
                "sundials_sunlinsoldense"
            },
            "sundials_core",
        ],
    };
    libs.push("m");
    libs.into_iter().map(String::from).collect()
}

/// Platform file name of a shared library, from the host binary format.
/// ASCII letters, digits and `_`, not starting with a digit.
fn is_c_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn shared_library_file_name(name: &str) -> String {
    match target_lexicon::Triple::host().binary_format {
        target_lexicon::BinaryFormat::Coff => format!("{name}.dll"),
        target_lexicon::BinaryFormat::Macho => format!("lib{name}.dylib"),
        _ => format!("lib{name}.so"),
    }
}

fn layout_comment(array: &str, names: &[String]) -> String {
    if names.is_empty() {
        return " *   (none)".to_string();
    }
    names
        .iter()
        .enumerate()
        .map(|(i, n)| format!(" *   {array}[{i}] = {}", comment_safe(n)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn comment_safe(text: &str) -> String {
    text.replace("*/", "* /")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelOptions;
    use crate::network::ReactionNetwork;

    fn model() -> SymbolicModel {
        ReactionNetwork::from_json_str(
            r#"{
                "name": "chain",
                "species": ["A", "B", "C"],
                "parameters": {"k1": 1.0, "k2": 2.0},
                "reactions": [
                    {"reactants": {"A": 2}, "products": {"B": 1}, "rate_constant": "k1"},
                    {"reactants": {"B": 1}, "products": {"C": 1}, "rate_constant": "k2"}
                ]
            }"#,
        )
        .unwrap()
        .to_model(ModelOptions::default())
    }

    #[test]
    fn test_standalone_source() {
        let generator = CodeGenerator::new(CodegenConfig {
            template: SolverTemplate::Standalone,
            ..Default::default()
        });
        let src = generator.render_source(&model(), "m").unwrap();

        assert!(src.contains("int m_rhs(double t, const double *y, const double *p, double *dydt)"));
        assert!(src.contains("int m_dense_jac("));
        assert!(src.contains("int64_t m_n_states(void) { return 3; }"));
        assert!(src.contains("dydt[0] = "));
        assert!(src.contains("dydt[2] = (p[1]*y[1]);"));
        assert!(!src.contains("${"));
        assert!(!src.contains("cvode"));
        assert!(!src.contains("m_integrate"));
    }

    #[test]
    fn test_stem_must_be_a_c_identifier() {
        let dir = tempfile::tempdir().unwrap();
        for stem in ["my-model", "9lives", "modèle"] {
            let generator = CodeGenerator::new(CodegenConfig {
                stem: stem.to_string(),
                ..Default::default()
            });
            assert!(
                matches!(
                    generator.generate(&model(), dir.path()),
                    Err(CodegenError::InvalidPrefix(_))
                ),
                "{stem:?}"
            );
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let generator = CodeGenerator::new(CodegenConfig {
            stem: "_chain2".to_string(),
            ..Default::default()
        });
        assert!(generator.generate(&model(), dir.path()).is_ok());
    }

    #[test]
    fn test_structural_zeros_are_not_written() {
        let generator = CodeGenerator::new(CodegenConfig {
            template: SolverTemplate::Standalone,
            ..Default::default()
        });
        let m = model();
        let src = generator.render_source(&m, "m").unwrap();

        let assignments: Vec<&str> = src
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with("jac["))
            .collect();
        assert_eq!(assignments.len(), 4);
        for (row, col) in [(0, 0), (1, 0), (1, 1), (2, 1)] {
            assert!(src.contains(&format!("jac[{col}*ldim + {row}] = ")));
        }
        for (row, col) in [(0, 1), (0, 2), (1, 2), (2, 0), (2, 2)] {
            assert!(!src.contains(&format!("jac[{col}*ldim + {row}]")));
        }
    }

    #[test]
    fn test_cvode_source() {
        let generator = CodeGenerator::new(CodegenConfig {
            template: SolverTemplate::Cvode,
            use_lapack: true,
            ..Default::default()
        });
        let src = generator.render_source(&model(), "m").unwrap();
        assert!(src.contains("#include <sunlinsol/sunlinsol_lapackdense.h>"));
        assert!(src.contains("LS = SUNLinSol_LapackDense(y, A, ctx);"));
        assert!(src.contains("int m_integrate(const double *tout"));
        assert!(src.contains("CVodeInit(mem, m_cv_rhs, t, y)"));
        assert!(!src.contains("${"));
    }

    #[test]
    fn test_missing_jacobian() {
        let m = ReactionNetwork::from_json_str(
            r#"{"species": ["A"], "reactions": [{"reactants": {"A": 1}, "rate_constant": 1.0}]}"#,
        )
        .unwrap()
        .to_model(ModelOptions { jacobian: false });
        assert!(matches!(
            CodeGenerator::default().render_source(&m, "m"),
            Err(CodegenError::MissingJacobian)
        ));
    }

    #[test]
    fn test_generate_writes_unique_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let generator = CodeGenerator::default();
        let m = model();
        let a = generator.generate(&m, dir.path()).unwrap();
        let b = generator.generate(&m, dir.path()).unwrap();

        assert_ne!(a.run_id, b.run_id);
        assert_ne!(a.source_path, b.source_path);
        assert!(a.source_path.exists() && b.source_path.exists());
        assert!(a.name.starts_with("kinetic_"));

        let text = std::fs::read_to_string(&a.descriptor_path).unwrap();
        let descriptor: BuildDescriptor = serde_json::from_str(&text).unwrap();
        assert_eq!(descriptor, a.descriptor);
        assert!(descriptor.libraries.contains(&"sundials_cvode".to_string()));

        let source = std::fs::read_to_string(&b.source_path).unwrap();
        assert!(source.contains(&format!("int {}_rhs(", b.name)));
    }
}
