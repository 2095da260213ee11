//! Compiling generated C into a shared library and loading it.
//!
//! [`NativeBuilder`] shells out to the host C compiler with `-shared -fPIC -O2` and
//! the include/library directories from [`BuildConfig`]. Compiler output is
//! returned verbatim on failure; nothing is retried and there is no fallback.
//!
//! [`NativeModule`] loads the library with `libloading`, checks its dimensions
//! against the build descriptor, and exposes the generated routines. It implements
//! [`Evaluator`], so a loaded module can stand in for the symbolic backends.
//!
//! The SUNDIALS headers and libraries are expected to be installed already; a
//! missing installation shows up as a `BuildError`.

use std::ffi::c_int;
use std::path::{Path, PathBuf};
use std::process::Command;

use libloading::Library;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codegen::{BuildDescriptor, GeneratedArtifact, SolverTemplate};
use crate::errors::{BuildError, EquationError, IntegrationError, SolverError};
use crate::evaluator::{check_and_pack, Evaluator};
use crate::integrate::{IntegrationOptions, Method};

/// Toolchain settings for building generated sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// C compiler executable
    pub compiler: String,
    pub include_dirs: Vec<PathBuf>,
    pub library_dirs: Vec<PathBuf>,
    /// Extra libraries, linked after the ones the template needs
    pub libraries: Vec<String>,
    /// Extra compiler flags, passed before the source file
    pub extra_flags: Vec<String>,
    /// Use the LAPACK dense linear solver in the CVODE driver
    pub use_lapack: bool,
    /// BLAS/LAPACK libraries linked into every CVODE build on POSIX hosts
    pub lapack_libraries: Vec<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            compiler: "cc".to_string(),
            include_dirs: Vec::new(),
            library_dirs: Vec::new(),
            libraries: Vec::new(),
            extra_flags: Vec::new(),
            use_lapack: false,
            lapack_libraries: vec!["lapack".to_string(), "blas".to_string()],
        }
    }
}

impl BuildConfig {
    /// Defaults overridden from the environment.
    ///
    /// - `CC`: compiler executable
    /// - `SUNDIALS_ROOT`: adds `$SUNDIALS_ROOT/include` and `$SUNDIALS_ROOT/lib`
    ///   (plus `lib64` when it exists)
    /// - `CVODE_LAPACK_LIBS`: whitespace or comma separated BLAS/LAPACK libraries;
    ///   setting it enables `use_lapack`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(cc) = env_var("CC") {
            config.compiler = cc;
        }
        if let Some(root) = env_var("SUNDIALS_ROOT") {
            let root = PathBuf::from(root);
            config.include_dirs.push(root.join("include"));
            config.library_dirs.push(root.join("lib"));
            let lib64 = root.join("lib64");
            if lib64.is_dir() {
                config.library_dirs.push(lib64);
            }
        }
        if let Some(libs) = env_var("CVODE_LAPACK_LIBS") {
            config.lapack_libraries = parse_library_list(&libs);
            config.use_lapack = true;
        }
        debug!(?config, "build configuration from environment");
        config
    }

    /// Library list after platform policy: no `m` on Windows, BLAS/LAPACK on
    /// POSIX hosts for the CVODE driver.
    pub(crate) fn link_libraries(&self, descriptor: &BuildDescriptor) -> Vec<String> {
        let windows = matches!(
            target_lexicon::Triple::host().operating_system,
            target_lexicon::OperatingSystem::Windows
        );
        let mut libs: Vec<String> = descriptor
            .libraries
            .iter()
            .chain(&self.libraries)
            .filter(|lib| !(windows && lib.as_str() == "m"))
            .cloned()
            .collect();
        if descriptor.template == SolverTemplate::Cvode && !windows {
            // before `m`, which must come last for static linkers
            let at = libs.iter().position(|l| l == "m").unwrap_or(libs.len());
            for (offset, lib) in self.lapack_libraries.iter().enumerate() {
                libs.insert(at + offset, lib.clone());
            }
        }
        libs
    }
}

/// Splits `-lopenblas, lapack` style lists into bare library names.
fn parse_library_list(text: &str) -> Vec<String> {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(|s| s.trim_start_matches("-l").to_string())
        .collect()
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Compiles generated artifacts into shared libraries.
#[derive(Debug, Clone, Default)]
pub struct NativeBuilder {
    config: BuildConfig,
}

impl NativeBuilder {
    pub fn new(config: BuildConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Compiler arguments for `artifact`, without the compiler itself.
    pub fn arguments(&self, artifact: &GeneratedArtifact) -> Vec<String> {
        let mut args: Vec<String> = ["-shared", "-fPIC", "-O2"]
            .into_iter()
            .map(String::from)
            .collect();
        args.extend(self.config.extra_flags.iter().cloned());
        args.extend(
            self.config
                .include_dirs
                .iter()
                .map(|d| format!("-I{}", d.display())),
        );
        args.push("-o".to_string());
        args.push(artifact.library_path.display().to_string());
        args.push(artifact.source_path.display().to_string());
        for dir in &self.config.library_dirs {
            args.push(format!("-L{}", dir.display()));
            if !cfg!(windows) {
                args.push(format!("-Wl,-rpath,{}", dir.display()));
            }
        }
        args.extend(
            self.config
                .link_libraries(&artifact.descriptor)
                .iter()
                .map(|lib| format!("-l{lib}")),
        );
        args
    }

    /// Compiles `artifact` and rewrites its build descriptor with the command used.
    ///
    /// Returns the path of the shared library.
    pub fn build(&self, artifact: &GeneratedArtifact) -> Result<PathBuf, BuildError> {
        let args = self.arguments(artifact);
        let mut command = Command::new(&self.config.compiler);
        command.current_dir(&artifact.dir).args(&args);
        let rendered = format!("{} {}", self.config.compiler, args.join(" "));
        debug!(command = %rendered, "compiling generated source");

        let output = command.output().map_err(|source| BuildError::Launch {
            compiler: self.config.compiler.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(BuildError::CompilationFailed {
                code: output.status.code(),
                command: rendered,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let descriptor = BuildDescriptor {
            compiler: Some(self.config.compiler.clone()),
            flags: args,
            include_dirs: self.config.include_dirs.clone(),
            library_dirs: self.config.library_dirs.clone(),
            libraries: self.config.link_libraries(&artifact.descriptor),
            ..artifact.descriptor.clone()
        };
        // the library exists at this point; a failed descriptor update is not a build failure
        if let Err(err) = descriptor.write(&artifact.descriptor_path) {
            warn!(error = %err, "failed to update build descriptor");
        }

        info!(library = %artifact.library_path.display(), "built native module");
        Ok(artifact.library_path.clone())
    }
}

type DimFn = unsafe extern "C" fn() -> i64;
type RhsFn = unsafe extern "C" fn(f64, *const f64, *const f64, *mut f64) -> c_int;
type JacFn = unsafe extern "C" fn(f64, *const f64, *const f64, *mut f64, c_int) -> c_int;
type IntegrateFn = unsafe extern "C" fn(
    *const f64,
    i64,
    *const f64,
    *const f64,
    f64,
    f64,
    *const f64,
    *const KineticOptions,
    *mut f64,
    *mut i64,
    *mut f64,
) -> c_int;

/// Mirror of the generated `kinetic_options` struct.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct KineticOptions {
    first_step: f64,
    max_step: f64,
    max_steps: i64,
    max_order: i32,
    method: i32,
}

impl From<&IntegrationOptions> for KineticOptions {
    fn from(options: &IntegrationOptions) -> Self {
        Self {
            first_step: options.first_step.unwrap_or(0.0),
            max_step: options.max_step.unwrap_or(0.0),
            max_steps: options.max_steps as i64,
            max_order: options.max_order.map_or(0, |o| o as i32),
            method: match options.method {
                Method::Bdf => 0,
                Method::Adams => 1,
            },
        }
    }
}

/// Counters reported by the generated CVODE driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeStats {
    pub steps: u64,
    pub rhs_evaluations: u64,
    pub jacobian_evaluations: u64,
    pub error_test_failures: u64,
    pub linear_setups: u64,
    pub nonlinear_failures: u64,
}

/// A loaded shared library produced from a generated artifact.
pub struct NativeModule {
    path: PathBuf,
    prefix: String,
    n_states: usize,
    n_params: usize,
    rhs: RhsFn,
    jac: JacFn,
    integrate: Option<IntegrateFn>,
    // dropped last, after the function pointers above are gone
    _library: Library,
}

impl std::fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeModule")
            .field("path", &self.path)
            .field("prefix", &self.prefix)
            .field("n_states", &self.n_states)
            .field("n_params", &self.n_params)
            .field("has_integrate", &self.integrate.is_some())
            .finish()
    }
}

impl NativeModule {
    /// Loads the library built from `artifact`.
    ///
    /// The library must report the state and parameter counts recorded in the
    /// artifact's descriptor.
    pub fn from_artifact(artifact: &GeneratedArtifact) -> Result<Self, BuildError> {
        let module = Self::load(&artifact.library_path, artifact.prefix())?;
        let expected = &artifact.descriptor;
        for (what, expected, got) in [
            ("states", expected.n_states, module.n_states),
            ("parameters", expected.n_params, module.n_params),
        ] {
            if expected != got {
                return Err(BuildError::DimensionMismatch {
                    path: module.path.clone(),
                    what,
                    expected,
                    got,
                });
            }
        }
        Ok(module)
    }

    /// Loads `path` and resolves the `<prefix>_*` symbols.
    ///
    /// `<prefix>_integrate` is optional; everything else is required.
    pub fn load(path: impl AsRef<Path>, prefix: &str) -> Result<Self, BuildError> {
        let path = path.as_ref().to_path_buf();
        // SAFETY: the library is generated by this crate; its initializers are trivial.
        let library = unsafe { Library::new(&path) }.map_err(|source| BuildError::Load {
            path: path.clone(),
            source,
        })?;

        let symbol_name = |suffix: &str| format!("{prefix}_{suffix}");
        let missing = |symbol: String, source| BuildError::MissingSymbol {
            symbol,
            path: path.clone(),
            source,
        };

        // SAFETY: the signatures match the generated C prototypes, and the copied
        // function pointers never outlive `library`, which is stored alongside them.
        let (n_states, n_params, rhs, jac, integrate) = unsafe {
            let name = symbol_name("n_states");
            let n_states: DimFn = *library
                .get::<DimFn>(name.as_bytes())
                .map_err(|e| missing(name.clone(), e))?;
            let name = symbol_name("n_params");
            let n_params: DimFn = *library
                .get::<DimFn>(name.as_bytes())
                .map_err(|e| missing(name.clone(), e))?;
            let name = symbol_name("rhs");
            let rhs: RhsFn = *library
                .get::<RhsFn>(name.as_bytes())
                .map_err(|e| missing(name.clone(), e))?;
            let name = symbol_name("dense_jac");
            let jac: JacFn = *library
                .get::<JacFn>(name.as_bytes())
                .map_err(|e| missing(name.clone(), e))?;
            let name = symbol_name("integrate");
            let integrate: Option<IntegrateFn> =
                library.get::<IntegrateFn>(name.as_bytes()).ok().map(|s| *s);
            (n_states() as usize, n_params() as usize, rhs, jac, integrate)
        };

        debug!(
            path = %path.display(),
            n_states,
            n_params,
            integrate = integrate.is_some(),
            "loaded native module"
        );

        Ok(Self {
            path,
            prefix: prefix.to_string(),
            n_states,
            n_params,
            rhs,
            jac,
            integrate,
            _library: library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether the library exports the CVODE entry point.
    pub fn has_integrate(&self) -> bool {
        self.integrate.is_some()
    }

    /// Runs the generated CVODE driver.
    ///
    /// `atol_vec`, when given, overrides the scalar `atol`. Inputs are expected to be
    /// validated by the caller; only buffer lengths are checked here.
    #[allow(clippy::too_many_arguments)]
    pub fn integrate(
        &self,
        time_points: &[f64],
        y0: &[f64],
        params: &[f64],
        rtol: f64,
        atol: f64,
        atol_vec: Option<&[f64]>,
        options: &IntegrationOptions,
    ) -> Result<(Vec<Vec<f64>>, NativeStats), IntegrationError> {
        let integrate = self.integrate.ok_or_else(|| {
            IntegrationError::InvalidOption(format!(
                "{} does not export {}_integrate",
                self.path.display(),
                self.prefix
            ))
        })?;
        let n = self.n_states;
        check_and_pack(n, self.n_params, y0, params, n, n)?;
        if let Some(v) = atol_vec {
            if v.len() != n {
                return Err(IntegrationError::ToleranceLength {
                    name: "atol",
                    expected: n,
                    got: v.len(),
                });
            }
        }

        let nt = time_points.len();
        let mut yout = vec![0.0; nt * n];
        let mut stats = [0i64; 6];
        let mut t_fail = 0.0;
        let opts = KineticOptions::from(options);

        // SAFETY: every buffer has the length the driver reads or writes:
        // tout nt, y0 n, p n_params, atol_vec n, yout nt * n, stats 6.
        let flag = unsafe {
            integrate(
                time_points.as_ptr(),
                nt as i64,
                y0.as_ptr(),
                params.as_ptr(),
                rtol,
                atol,
                atol_vec.map_or(std::ptr::null(), <[f64]>::as_ptr),
                &opts,
                yout.as_mut_ptr(),
                stats.as_mut_ptr(),
                &mut t_fail,
            )
        };

        if flag < 0 {
            return Err(SolverError::Native { flag, t: t_fail }.into());
        }

        let [steps, rhs, jac, etf, setups, ncf] = stats.map(|s| s.max(0) as u64);
        let stats = NativeStats {
            steps,
            rhs_evaluations: rhs,
            jacobian_evaluations: jac,
            error_test_failures: etf,
            linear_setups: setups,
            nonlinear_failures: ncf,
        };
        let states = yout.chunks_exact(n.max(1)).map(<[f64]>::to_vec).take(nt).collect();
        Ok((states, stats))
    }
}

impl Evaluator for NativeModule {
    fn name(&self) -> &'static str {
        "native"
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
        let n = self.n_states;
        check_and_pack(n, self.n_params, state, params, out.len(), n)?;
        // SAFETY: lengths checked above match the generated array accesses.
        let status = unsafe { (self.rhs)(0.0, state.as_ptr(), params.as_ptr(), out.as_mut_ptr()) };
        routine_status(&self.prefix, "rhs", status)
    }

    fn has_jacobian(&self) -> bool {
        true
    }

    fn jacobian_into(
        &self,
        state: &[f64],
        params: &[f64],
        out: &mut [f64],
    ) -> Result<(), EquationError> {
        let n = self.n_states;
        check_and_pack(n, self.n_params, state, params, out.len(), n * n)?;
        let mut column_major = vec![0.0; n * n];
        // SAFETY: column_major holds n * n entries with leading dimension n.
        let status = unsafe {
            (self.jac)(
                0.0,
                state.as_ptr(),
                params.as_ptr(),
                column_major.as_mut_ptr(),
                n as c_int,
            )
        };
        routine_status(&self.prefix, "dense_jac", status)?;
        for col in 0..n {
            for row in 0..n {
                out[row * n + col] = column_major[col * n + row];
            }
        }
        Ok(())
    }
}

/// Maps the `c_int` returned by a generated routine; anything but 0 is an error.
fn routine_status(prefix: &str, routine: &str, status: c_int) -> Result<(), EquationError> {
    match status {
        0 => Ok(()),
        status => Err(EquationError::NativeStatus {
            routine: format!("{prefix}_{routine}"),
            status,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{CodeGenerator, CodegenConfig};
    use crate::model::ModelOptions;
    use crate::network::ReactionNetwork;

    fn artifact(template: SolverTemplate, use_lapack: bool) -> (tempfile::TempDir, GeneratedArtifact) {
        let model = ReactionNetwork::from_json_str(
            r#"{"species": ["A", "B"], "parameters": {"k": 1.0},
                "reactions": [{"reactants": {"A": 1}, "products": {"B": 1}, "rate_constant": "k"}]}"#,
        )
        .unwrap()
        .to_model(ModelOptions::default());
        let dir = tempfile::tempdir().unwrap();
        let artifact = CodeGenerator::new(CodegenConfig {
            template,
            use_lapack,
            ..Default::default()
        })
        .generate(&model, dir.path())
        .unwrap();
        (dir, artifact)
    }

    #[test]
    fn test_arguments() {
        let (_dir, artifact) = artifact(SolverTemplate::Cvode, true);
        let builder = NativeBuilder::new(BuildConfig {
            include_dirs: vec![PathBuf::from("/opt/sundials/include")],
            library_dirs: vec![PathBuf::from("/opt/sundials/lib")],
            use_lapack: true,
            ..Default::default()
        });
        let args = builder.arguments(&artifact);
        assert_eq!(&args[..3], ["-shared", "-fPIC", "-O2"]);
        assert!(args.contains(&"-I/opt/sundials/include".to_string()));
        assert!(args.contains(&"-L/opt/sundials/lib".to_string()));
        assert!(args.contains(&"-lsundials_cvode".to_string()));
        assert!(args.contains(&"-lsundials_sunlinsollapackdense".to_string()));

        let windows = matches!(
            target_lexicon::Triple::host().operating_system,
            target_lexicon::OperatingSystem::Windows
        );
        assert_eq!(args.contains(&"-lm".to_string()), !windows);
        assert_eq!(args.contains(&"-llapack".to_string()), !windows);
    }

    #[test]
    fn test_default_cvode_links_blas_on_posix() {
        let (_dir, artifact) = artifact(SolverTemplate::Cvode, false);
        let args = NativeBuilder::default().arguments(&artifact);
        let windows = matches!(
            target_lexicon::Triple::host().operating_system,
            target_lexicon::OperatingSystem::Windows
        );
        assert!(args.contains(&"-lsundials_sunlinsoldense".to_string()));
        assert_eq!(args.contains(&"-llapack".to_string()), !windows);
        assert_eq!(args.contains(&"-lblas".to_string()), !windows);
        if !windows {
            let pos = |lib: &str| args.iter().position(|a| a == lib).unwrap();
            assert!(pos("-lblas") < pos("-lm"));
        }
    }

    #[test]
    fn test_standalone_links_no_solver() {
        let (_dir, artifact) = artifact(SolverTemplate::Standalone, false);
        let args = NativeBuilder::default().arguments(&artifact);
        assert!(!args.iter().any(|a| a.contains("sundials")));
        assert!(!args.contains(&"-llapack".to_string()));
    }

    #[test]
    fn test_missing_compiler_is_a_launch_error() {
        let (_dir, artifact) = artifact(SolverTemplate::Standalone, false);
        let builder = NativeBuilder::new(BuildConfig {
            compiler: "definitely-not-a-compiler-7f3a".to_string(),
            ..Default::default()
        });
        assert!(matches!(
            builder.build(&artifact),
            Err(BuildError::Launch { .. })
        ));
    }

    #[test]
    fn test_load_missing_library() {
        assert!(matches!(
            NativeModule::load("/nonexistent/libkinetic_missing.so", "kinetic_missing"),
            Err(BuildError::Load { .. })
        ));
    }

    #[test]
    fn test_build_and_load_standalone() {
        let (_dir, artifact) = artifact(SolverTemplate::Standalone, false);
        match NativeBuilder::new(BuildConfig::from_env()).build(&artifact) {
            Ok(_) => {}
            Err(BuildError::Launch { compiler, .. }) => {
                eprintln!("skipping: compiler {compiler} not available");
                return;
            }
            Err(err) => panic!("{err}"),
        }
        let module = NativeModule::from_artifact(&artifact).unwrap();
        assert!(!module.has_integrate());
        assert_eq!(module.evaluate(&[2.0, 0.0], &[0.5]).unwrap(), vec![-1.0, 1.0]);
        assert_eq!(
            module.jacobian(&[2.0, 0.0], &[0.5]).unwrap(),
            vec![-0.5, 0.0, 0.5, 0.0]
        );
    }

    #[test]
    fn test_routine_status() {
        assert!(routine_status("kinetic_ab", "rhs", 0).is_ok());
        match routine_status("kinetic_ab", "dense_jac", -1) {
            Err(EquationError::NativeStatus { routine, status }) => {
                assert_eq!(routine, "kinetic_ab_dense_jac");
                assert_eq!(status, -1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_library_list() {
        assert_eq!(
            parse_library_list("-lopenblas, lapack  -lgfortran"),
            vec!["openblas", "lapack", "gfortran"]
        );
        assert!(parse_library_list(" , ").is_empty());
    }
}
