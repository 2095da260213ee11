//! # Reaction Network Simulation Benchmark
//!
//! Compares right-hand side backends inside an ODE solver loop.
//!
//! ## System Description
//!
//! `data/enzyme.json`: a substrate converted by Michaelis-Menten kinetics,
//! followed by first order decay of the product.
//!
//! ## Implementations Compared
//!
//! 1. **Direct Implementation**: hand-coded Rust, the performance ceiling.
//! 2. **Interpreted Evaluator**: walks the symbolic expression trees.
//! 3. **JIT Evaluator**: the same expressions compiled with Cranelift.
//!
//! Each is driven by the Dormand-Prince (Dopri5) integrator from `ode_solvers`
//! from t = 0 to t = 50. A second group runs the stiff water network through
//! the crate's Rosenbrock driver with both symbolic backends.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use kinetic_codegen::prelude::*;
use nalgebra::U3;
use ode_solvers::dopri5::*;
use ode_solvers::*;

type State = OVector<f64, U3>;

const ENZYME: &str = include_str!("../data/enzyme.json");
const WATER: &str = include_str!("../data/water.json");

#[derive(Clone, Copy)]
struct DirectSystem {
    vmax: f64,
    km: f64,
    k2: f64,
}

impl System<f64, State> for DirectSystem {
    #[inline(always)]
    fn system(&self, _t: f64, y: &State, dy: &mut State) {
        let conversion = self.vmax * y[0] / (self.km + y[0]);
        let decay = self.k2 * y[1];
        dy[0] = -conversion;
        dy[1] = conversion - decay;
        dy[2] = decay;
    }
}

/// Adapts any evaluator to the `ode_solvers` system trait.
struct EvaluatorSystem<'a> {
    evaluator: &'a dyn Evaluator,
    params: &'a [f64],
}

impl System<f64, State> for EvaluatorSystem<'_> {
    #[inline(always)]
    fn system(&self, _t: f64, y: &State, dy: &mut State) {
        self.evaluator
            .eval_into(y.as_slice(), self.params, dy.as_mut_slice())
            .expect("state and parameter lengths are fixed");
    }
}

fn run_simulation<S: System<f64, State>>(system: S, y0: State) {
    let mut stepper = Dopri5::new(system, 0.0, 50.0, 0.1, y0, 1.0e-8, 1.0e-10);
    let _ = stepper.integrate();
}

fn benchmark_simulations(c: &mut Criterion) {
    let model = ReactionNetwork::from_json_str(ENZYME)
        .expect("valid enzyme network")
        .to_model(ModelOptions { jacobian: false });
    let params = model.default_parameters().to_vec();
    let y0 = State::from_column_slice(model.initial_state());

    let interpreted = EvaluatorKind::Interpreted
        .build(&model)
        .expect("interpreter needs no compilation");
    let jit = EvaluatorKind::Jit.build(&model).expect("JIT compilation");

    // parameters are ordered by name: k2, km, vmax
    let direct = DirectSystem {
        k2: params[0],
        km: params[1],
        vmax: params[2],
    };

    let mut group = c.benchmark_group("Enzyme Network Simulation");

    group.bench_function("Direct Implementation", |b| {
        b.iter(|| run_simulation(black_box(direct), y0))
    });

    group.bench_function("Interpreted Evaluator", |b| {
        b.iter(|| {
            let system = EvaluatorSystem {
                evaluator: interpreted.as_ref(),
                params: &params,
            };
            run_simulation(black_box(system), y0);
        })
    });

    group.bench_function("JIT Evaluator", |b| {
        b.iter(|| {
            let system = EvaluatorSystem {
                evaluator: jit.as_ref(),
                params: &params,
            };
            run_simulation(black_box(system), y0);
        })
    });

    group.finish();
}

fn benchmark_stiff_driver(c: &mut Criterion) {
    let model = ReactionNetwork::from_json_str(WATER)
        .expect("valid water network")
        .to_model(ModelOptions::default());
    let times: Vec<f64> = (0..200)
        .map(|i| 10f64.powf(-6.0 + 9.0 * i as f64 / 199.0))
        .collect();
    let y0 = model.initial_state().to_vec();

    let mut group = c.benchmark_group("Water Network Rosenbrock");
    for kind in [EvaluatorKind::Interpreted, EvaluatorKind::Jit] {
        let driver = IntegrationDriver::new(&model, DriverConfig::symbolic(kind))
            .expect("driver construction");
        group.bench_function(kind.to_string(), |b| {
            b.iter(|| {
                driver
                    .integrate(
                        black_box(&times),
                        &y0,
                        &[],
                        1e-6,
                        1e-12,
                        &IntegrationOptions::default(),
                    )
                    .expect("water network integrates")
            })
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_simulations, benchmark_stiff_driver);
criterion_main!(benches);
