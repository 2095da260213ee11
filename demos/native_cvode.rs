//! Generates C for the water network, builds it against SUNDIALS and integrates
//! with the generated CVODE driver.
//!
//! Needs a C compiler and an installed SUNDIALS (v7). Set `SUNDIALS_ROOT` when
//! it is not on the default search paths, `CC` to pick a compiler and
//! `CVODE_LAPACK_LIBS` to use the LAPACK dense solver.
//!
//! Pass `--standalone` to skip SUNDIALS: only the right-hand side and Jacobian
//! are generated, and the crate's Rosenbrock stepper drives them.

use kinetic_codegen::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let template = if std::env::args().any(|a| a == "--standalone") {
        SolverTemplate::Standalone
    } else {
        SolverTemplate::Cvode
    };

    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/data/water.json");
    let model = ReactionNetwork::from_path(path)?.to_model(ModelOptions::default());

    let workdir = tempfile::tempdir()?;
    let config = DriverConfig::native(template, BuildConfig::from_env(), workdir.path());

    let driver = match IntegrationDriver::new(&model, config) {
        Ok(driver) => driver,
        Err(IntegrationError::Build(err)) => {
            eprintln!("native build failed:\n{err}");
            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    };
    if let Some(artifact) = driver.artifact() {
        info!(source = %artifact.source_path.display(), "generated");
        println!("{}", std::fs::read_to_string(&artifact.source_path)?);
    }

    let times: Vec<f64> = (0..200)
        .map(|i| 10f64.powf(-6.0 + 9.0 * i as f64 / 199.0))
        .collect();
    let result = driver.integrate(
        &times,
        &model.initial_state().to_vec(),
        &[],
        1e-6,
        vec![1e-6, 1e-12, 1e-12],
        &IntegrationOptions::default(),
    )?;
    println!("{result}");

    // Compare against the JIT backend
    let reference = IntegrationDriver::new(&model, DriverConfig::symbolic(EvaluatorKind::Jit))?
        .integrate(
            &times,
            &model.initial_state().to_vec(),
            &[],
            1e-6,
            vec![1e-6, 1e-12, 1e-12],
            &IntegrationOptions::default(),
        )?;
    let max_rel = result
        .final_state()
        .iter()
        .zip(reference.final_state())
        .map(|(a, b)| ((a - b) / b.abs().max(1e-30)).abs())
        .fold(0.0, f64::max);
    println!("max relative deviation from the JIT backend at t_end: {max_rel:e}");

    Ok(())
}
