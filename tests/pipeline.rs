use std::path::Path;

use approx::assert_relative_eq;
use kinetic_codegen::prelude::*;

fn data(name: &str) -> String {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("data")
        .join(name)
        .display()
        .to_string()
}

fn water() -> SymbolicModel {
    ReactionNetwork::from_path(data("water.json"))
        .unwrap()
        .to_model(ModelOptions::default())
}

fn logspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 10f64.powf(start + (stop - start) * i as f64 / (n - 1) as f64))
        .collect()
}

#[test]
fn test_water_trajectory() {
    let model = water();
    let times = logspace(-6.0, 3.0, 200);
    let atol = 1e-12;
    let driver = IntegrationDriver::new(&model, DriverConfig::default()).unwrap();
    let result = driver
        .integrate(
            &times,
            &model.initial_state().to_vec(),
            &[],
            1e-6,
            atol,
            &IntegrationOptions::default(),
        )
        .unwrap();

    assert_eq!(result.times, times);
    assert_eq!(result.states.len(), 200);
    assert_eq!(result.states[0], vec![55.4e3, 1e-4, 1e-4]);
    for state in &result.states {
        assert_eq!(state.len(), 3);
        assert!(state.iter().all(|c| *c >= -10.0 * atol), "{state:?}");
    }

    // equilibrium: kf [H2O] = kb [H+][OH-]
    let last = result.final_state();
    let expected = (2.5e-5 * last[0] / 1.4e8).sqrt();
    assert_relative_eq!(last[1], expected, max_relative = 1e-3);
    assert_relative_eq!(last[1], last[2], max_relative = 1e-6);
    assert_relative_eq!(last[0] + last[1], 55.4e3 + 1e-4, max_relative = 1e-9);
}

#[test]
fn test_dimensions_agree() {
    for name in ["water.json", "enzyme.json"] {
        let model = ReactionNetwork::from_path(data(name))
            .unwrap()
            .to_model(ModelOptions::default());
        let n = model.n_states();
        assert_eq!(model.initial_state().len(), n);
        assert_eq!(model.rhs().len(), n);
        assert_eq!(model.jacobian().unwrap().len(), n * n);

        let evaluator = EvaluatorKind::Jit.build(&model).unwrap();
        let y = model.initial_state();
        let p = model.default_parameters();
        assert_eq!(evaluator.evaluate(y, p).unwrap().len(), n);
        assert_eq!(evaluator.jacobian(y, p).unwrap().len(), n * n);
    }
}

#[test]
fn test_backends_agree() {
    let model = ReactionNetwork::from_path(data("enzyme.json"))
        .unwrap()
        .to_model(ModelOptions::default());
    let interpreted = EvaluatorKind::Interpreted.build(&model).unwrap();
    let jit = EvaluatorKind::Jit.build(&model).unwrap();
    let p = model.default_parameters();

    for y in [[10.0, 0.0, 0.0], [3.2, 4.1, 2.7], [0.0, 1e-3, 9.9]] {
        let a = interpreted.evaluate(&y, p).unwrap();
        let b = jit.evaluate(&y, p).unwrap();
        for (a, b) in a.iter().zip(&b) {
            assert_relative_eq!(a, b, epsilon = 1e-12, max_relative = 1e-12);
        }
        let a = interpreted.jacobian(&y, p).unwrap();
        let b = jit.jacobian(&y, p).unwrap();
        for (a, b) in a.iter().zip(&b) {
            assert_relative_eq!(a, b, epsilon = 1e-12, max_relative = 1e-12);
        }
    }

    let times = [0.0, 1.0, 5.0, 20.0];
    let rtol = 1e-8;
    let atol = 1e-10;
    let run = |kind| {
        IntegrationDriver::new(&model, DriverConfig::symbolic(kind))
            .unwrap()
            .integrate(
                &times,
                &model.initial_state().to_vec(),
                &[],
                rtol,
                atol,
                &IntegrationOptions::default(),
            )
            .unwrap()
    };
    let a = run(EvaluatorKind::Interpreted);
    let b = run(EvaluatorKind::Jit);
    for (ya, yb) in a.states.iter().zip(&b.states) {
        for (a, b) in ya.iter().zip(yb) {
            assert!((a - b).abs() <= 100.0 * (atol + rtol * a.abs().max(b.abs())));
        }
    }
}

#[test]
fn test_codegen_runs_produce_distinct_artifacts() {
    let model = water();
    let dir = tempfile::tempdir().unwrap();
    let generator = CodeGenerator::default();
    let first = generator.generate(&model, dir.path()).unwrap();
    let second = generator.generate(&model, dir.path()).unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_ne!(first.source_path, second.source_path);
    assert_ne!(first.library_path, second.library_path);
    assert!(first.source_path.exists());
    assert!(second.source_path.exists());
    assert!(first.descriptor_path.exists());

    let descriptor: BuildDescriptor =
        serde_json::from_str(&std::fs::read_to_string(&first.descriptor_path).unwrap()).unwrap();
    assert_eq!(descriptor, first.descriptor);
    assert_eq!(descriptor.n_states, 3);
    assert_eq!(descriptor.n_params, 2);
}

#[test]
fn test_artifacts_from_one_directory_load_side_by_side() {
    let dir = tempfile::tempdir().unwrap();
    let generator = CodeGenerator::new(CodegenConfig {
        template: SolverTemplate::Standalone,
        ..Default::default()
    });
    let builder = NativeBuilder::new(BuildConfig::from_env());

    let mut modules = Vec::new();
    for k in [2.0, 6.0] {
        let model = ReactionNetwork::from_json_str(&format!(
            r#"{{"species": ["A", "B"],
                "reactions": [{{"reactants": {{"A": 1}}, "products": {{"B": 1}}, "rate_constant": {k}}}]}}"#
        ))
        .unwrap()
        .to_model(ModelOptions::default());
        let artifact = generator.generate(&model, dir.path()).unwrap();
        match builder.build(&artifact) {
            Ok(_) => {}
            Err(BuildError::Launch { compiler, .. }) => {
                eprintln!("skipping: compiler {compiler} not available");
                return;
            }
            Err(err) => panic!("{err}"),
        }
        modules.push((k, NativeModule::from_artifact(&artifact).unwrap()));
    }

    assert_ne!(modules[0].1.path(), modules[1].1.path());
    assert_ne!(modules[0].1.prefix(), modules[1].1.prefix());
    for (k, module) in &modules {
        assert_eq!(module.evaluate(&[1.0, 0.0], &[]).unwrap(), vec![-k, *k]);
    }
}

#[test]
fn test_structural_zeros_are_not_emitted() {
    let model = ReactionNetwork::from_path(data("enzyme.json"))
        .unwrap()
        .to_model(ModelOptions::default());
    let source = CodeGenerator::new(CodegenConfig {
        template: SolverTemplate::Standalone,
        ..Default::default()
    })
    .render_source(&model, "enzyme")
    .unwrap();

    let nonzeros = model.jacobian_nonzeros().unwrap();
    let assignments = source
        .lines()
        .filter(|l| l.trim_start().starts_with("jac["))
        .count();
    assert_eq!(assignments, nonzeros.len());
    // S, P, Q: nothing depends on Q
    assert!(nonzeros.iter().all(|(_, col, _)| *col != 2));
    assert!(!source.contains("jac[2*ldim"));
}

#[test]
fn test_malformed_input_fails_before_codegen() {
    let dir = tempfile::tempdir().unwrap();
    let documents = [
        r#"{"species": ["A"], "reactions": ["#,
        r#"{"reactions": []}"#,
        r#"{"species": ["A"], "reactions": [{"reactants": {"B": 1}, "rate_constant": 1.0}]}"#,
        r#"{"species": ["A"], "reactions": [{"reactants": {"A": 1}, "rate_constant": "k"}]}"#,
        r#"{"species": ["A", "A"], "reactions": []}"#,
    ];
    for text in documents {
        let pipeline = || -> Result<GeneratedArtifact, KineticError> {
            let model = ReactionNetwork::from_json_str(text)?.to_model(ModelOptions::default());
            Ok(CodeGenerator::default().generate(&model, dir.path())?)
        };
        assert!(
            matches!(pipeline(), Err(KineticError::DataFormat(_))),
            "{text}"
        );
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_missing_file_is_a_data_format_error() {
    assert!(matches!(
        ReactionNetwork::from_path("/nonexistent/network.json"),
        Err(DataFormatError::Io { .. })
    ));
}

#[test]
fn test_standalone_native_backend() {
    let model = water();
    let dir = tempfile::tempdir().unwrap();
    let config = DriverConfig::native(
        SolverTemplate::Standalone,
        BuildConfig::from_env(),
        dir.path(),
    );
    let driver = match IntegrationDriver::new(&model, config) {
        Ok(driver) => driver,
        Err(IntegrationError::Build(BuildError::Launch { compiler, .. })) => {
            eprintln!("skipping: compiler {compiler} not available");
            return;
        }
        Err(err) => panic!("{err}"),
    };

    let native = driver.evaluator().unwrap();
    let jit = EvaluatorKind::Jit.build(&model).unwrap();
    let y = model.initial_state();
    let p = model.default_parameters();
    for (a, b) in native
        .evaluate(y, p)
        .unwrap()
        .iter()
        .zip(&jit.evaluate(y, p).unwrap())
    {
        assert_relative_eq!(a, b, epsilon = 1e-12, max_relative = 1e-12);
    }
    for (a, b) in native
        .jacobian(y, p)
        .unwrap()
        .iter()
        .zip(&jit.jacobian(y, p).unwrap())
    {
        assert_relative_eq!(a, b, epsilon = 1e-12, max_relative = 1e-12);
    }

    let times = logspace(-6.0, 3.0, 50);
    let result = driver
        .integrate(
            &times,
            &model.initial_state().to_vec(),
            &[],
            1e-6,
            1e-12,
            &IntegrationOptions::default(),
        )
        .unwrap();
    assert_eq!(result.states.len(), 50);
    assert!(result.diagnostics.artifact.is_some());

    let artifact = driver.artifact().unwrap();
    assert!(artifact.library_path.exists());
    let descriptor: BuildDescriptor =
        serde_json::from_str(&std::fs::read_to_string(&artifact.descriptor_path).unwrap()).unwrap();
    assert!(descriptor.compiler.is_some());
    assert!(descriptor.flags.iter().any(|f| f == "-shared"));
}

#[test]
#[ignore = "requires SUNDIALS"]
fn test_cvode_backend() {
    let model = water();
    let dir = tempfile::tempdir().unwrap();
    let driver = IntegrationDriver::new(
        &model,
        DriverConfig::native(SolverTemplate::Cvode, BuildConfig::from_env(), dir.path()),
    )
    .unwrap();
    let times = logspace(-6.0, 3.0, 200);
    let result = driver
        .integrate(
            &times,
            &model.initial_state().to_vec(),
            &[],
            1e-8,
            vec![1e-6, 1e-14, 1e-14],
            &IntegrationOptions::default(),
        )
        .unwrap();
    assert_eq!(result.states.len(), 200);
    assert!(result.diagnostics.steps > 0);
    let last = result.final_state();
    let expected = (2.5e-5 * last[0] / 1.4e8).sqrt();
    assert_relative_eq!(last[1], expected, max_relative = 1e-4);

    // per-component rtol is a Rosenbrock-only feature
    assert!(matches!(
        driver.integrate(
            &times,
            &model.initial_state().to_vec(),
            &[],
            vec![1e-6; 3],
            1e-12,
            &IntegrationOptions::default(),
        ),
        Err(IntegrationError::InvalidOption(_))
    ));
}
