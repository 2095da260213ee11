//! Swaps evaluators on the water autoprotolysis network.
//!
//! Loads `data/water.json`, prints the symbolic model, then evaluates and
//! integrates it with the interpreted and the JIT backend and compares the
//! timings and results.
//!
//! Run with `RUST_LOG=debug` to see the pipeline events.

use std::time::Instant;

use colored::Colorize;
use kinetic_codegen::prelude::*;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/data/water.json");
    let network = ReactionNetwork::from_path(path)?;
    let model = network.to_model(ModelOptions::default());
    println!("{model}\n");

    // 200 output times, log-spaced from 1e-6 to 1e3
    let times: Vec<f64> = (0..200)
        .map(|i| 10f64.powf(-6.0 + 9.0 * i as f64 / 199.0))
        .collect();
    let y0 = model.initial_state().to_vec();
    let p = model.default_parameters();
    let n_runs = 100_000;

    for kind in [EvaluatorKind::Interpreted, EvaluatorKind::Jit] {
        println!("{}", format!("=== {kind} ===").bright_blue().bold());

        let start = Instant::now();
        let evaluator = kind.build(&model)?;
        println!("Build time: {:?}", start.elapsed());

        let mut out = vec![0.0; model.n_states()];
        let start = Instant::now();
        for _ in 0..n_runs {
            evaluator.eval_into(&y0, p, &mut out)?;
        }
        let elapsed = start.elapsed();
        println!(
            "Rhs evaluation: {:.1} ns/call",
            elapsed.as_nanos() as f64 / n_runs as f64
        );
        println!("f(y0) = {out:?}");

        let driver = IntegrationDriver::new(&model, DriverConfig::symbolic(kind))?;
        let start = Instant::now();
        let result = driver.integrate(
            &times,
            &y0,
            &[],
            1e-6,
            1e-12,
            &IntegrationOptions::default(),
        )?;
        println!("Integration time: {:?}", start.elapsed());
        println!("{result}\n");
    }

    Ok(())
}
