//! End-to-end driver runs against the scripted executor and real `sh` phases.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use fineprune_core::{
    resolve_file, FinepruneError, LogScan, NoFeasiblePolicy, OptimizerMode, Phase, ResultRecord,
    ResumePoint, RunConfig, RunEvent,
};
use fineprune_phases::fakes::{ScriptedExecutor, ScriptedFailure};
use fineprune_phases::{read_pruning_config, DriverError, IterationDriver, ProcessExecutor};
use tempfile::TempDir;

fn test_config(tmp: &TempDir, iterations: u32) -> RunConfig {
    let mut config = RunConfig::default();
    config.schedule.total_iterations = iterations;
    config.paths.results_root = tmp.path().join("results");
    config.paths.original_model = tmp.path().join("net.caffemodel");
    config.paths.architecture_spec = tmp.path().join("train_val.prototxt");
    config.paths.training_config = tmp.path().join("finetune_solver.prototxt");
    config
}

fn events(config: &RunConfig) -> Vec<RunEvent> {
    let scan = LogScan::read(&config.layout().run_log()).expect("read run log");
    scan.events().collect()
}

fn count(events: &[RunEvent], kind: &str) -> usize {
    events.iter().filter(|e| e.kind() == kind).count()
}

fn record(latency: f64, accuracy: f64) -> ResultRecord {
    ResultRecord {
        pruning_config: BTreeMap::from([("conv1".to_string(), latency / 1000.0)]),
        latency,
        accuracy,
    }
}

#[tokio::test]
async fn test_fresh_run_completes_every_iteration() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, 3);
    let executor = Arc::new(ScriptedExecutor::new());

    let mut driver = IterationDriver::fresh(config.clone(), executor.clone()).unwrap();
    let report = driver.run(ResumePoint::fresh()).await.unwrap();

    assert_eq!(report.completed_iterations, 3);
    assert_eq!(report.phases.len(), 9);
    let layout = config.layout();
    assert_eq!(report.final_model, Some(layout.finetuned_model(2)));
    assert_eq!(
        executor.call_names(),
        vec![
            "optimization#0",
            "pruning#0",
            "fine_tuning#0",
            "optimization#1",
            "pruning#1",
            "fine_tuning#1",
            "optimization#2",
            "pruning#2",
            "fine_tuning#2",
        ]
    );

    for t in 0..3 {
        assert!(layout.result_log(t).is_file());
        assert!(layout.finetuned_model(t).is_file());
    }

    let events = events(&config);
    assert_eq!(count(&events, "run_started"), 1);
    assert_eq!(count(&events, "iteration_started"), 3);
    assert_eq!(count(&events, "phase_completed"), 9);
    assert_eq!(count(&events, "candidate_selected"), 3);
    assert_eq!(count(&events, "run_completed"), 1);
    assert_eq!(count(&events, "phase_failed"), 0);

    // The feasible, most accurate default candidate wins.
    let handoff = read_pruning_config(&layout.pruning_config()).unwrap();
    assert_eq!(handoff.get("conv1"), Some(&0.3));
    assert_eq!(handoff.get("fc6"), Some(&0.6));
}

#[tokio::test]
async fn test_optimizer_receives_previous_and_current_thresholds() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, 5);
    let executor = Arc::new(ScriptedExecutor::new());

    let mut driver = IterationDriver::fresh(config.clone(), executor.clone()).unwrap();
    driver.run(ResumePoint::fresh()).await.unwrap();

    let optimizer_calls: Vec<_> = executor
        .calls()
        .into_iter()
        .filter(|c| c.phase == Phase::Optimization)
        .collect();
    assert_eq!(optimizer_calls.len(), 5);

    let first = &optimizer_calls[0].args;
    assert_eq!(first[2], config.paths.original_model.to_string_lossy());
    assert_eq!(first[3], "238");
    assert_eq!(first[4], "206.4");

    let third = &optimizer_calls[2].args;
    assert_eq!(
        third[2],
        config.layout().finetuned_model(1).to_string_lossy()
    );
    assert_eq!(third[3], "174.8");
    assert_eq!(third[4], "143.2");

    let last = &optimizer_calls[4].args;
    assert_eq!(last[4], "80");
}

#[tokio::test]
async fn test_unconstrained_optimizer_receives_tradeoff_per_iteration() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp, 5);
    config.optimizer.mode = OptimizerMode::Unconstrained;
    config.optimizer.kappa = 5.0;
    let executor = Arc::new(ScriptedExecutor::new());

    let mut driver = IterationDriver::fresh(config.clone(), executor.clone()).unwrap();
    let report = driver.run(ResumePoint::fresh()).await.unwrap();
    assert_eq!(report.completed_iterations, 5);

    let optimizer_calls: Vec<_> = executor
        .calls()
        .into_iter()
        .filter(|c| c.phase == Phase::Optimization)
        .collect();
    assert_eq!(optimizer_calls.len(), 5);
    for (iteration, call) in optimizer_calls.iter().enumerate() {
        assert_eq!(call.args.len(), 9);
        let tradeoff: f64 = call.args[7].parse().unwrap();
        let want = config.latency_tradeoff(iteration as u32).unwrap();
        assert!((tradeoff - want).abs() < 1e-12, "iteration {iteration}");
        assert!((tradeoff - 2.0 / 31.6).abs() < 1e-9);
        assert_eq!(call.args[8], "5");
    }
    assert_eq!(optimizer_calls[1].args[3], "206.4");

    let text = fs::read_to_string(config.layout().run_log()).unwrap();
    assert!(text.contains("Iteration 0: latency tradeoff factor 0.0633"));
}

#[tokio::test]
async fn test_unconstrained_one_step_schedule_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp, 3);
    config.schedule.kind = "one-step".parse().unwrap();
    config.optimizer.mode = OptimizerMode::Unconstrained;

    let err = IterationDriver::fresh(config.clone(), Arc::new(ScriptedExecutor::new()))
        .err()
        .expect("a flat constraint step must be rejected");
    assert!(matches!(
        err,
        DriverError::Core(FinepruneError::FlatConstraintStep { iteration: 1, .. })
    ));
    assert!(!config.layout().dir().exists());
}

#[tokio::test]
async fn test_failed_phase_is_logged_and_resumable() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, 3);
    let executor = Arc::new(ScriptedExecutor::new().fail_once(
        Phase::Pruning,
        1,
        ScriptedFailure::ExitCode(2),
    ));

    let mut driver = IterationDriver::fresh(config.clone(), executor.clone()).unwrap();
    let err = driver.run(ResumePoint::fresh()).await.unwrap_err();
    match err {
        DriverError::NonZeroExit {
            phase,
            iteration,
            exit_code,
            ref stderr_tail,
        } => {
            assert_eq!(phase, Phase::Pruning);
            assert_eq!(iteration, 1);
            assert_eq!(exit_code, 2);
            assert!(stderr_tail.contains("scripted failure"));
        }
        other => panic!("unexpected error: {other}"),
    }
    drop(driver);

    let logged = events(&config);
    assert_eq!(count(&logged, "phase_failed"), 1);
    assert_eq!(count(&logged, "run_completed"), 0);

    let (mut driver, resolution) =
        IterationDriver::resume(config.clone(), executor.clone()).unwrap();
    assert_eq!(
        resolution.point,
        ResumePoint {
            iteration: 1,
            next_phase: Some(Phase::Pruning)
        }
    );
    let failure = resolution.last_failure.expect("failure recorded");
    assert_eq!(failure.phase, Phase::Pruning);

    let calls_before = executor.calls().len();
    let report = driver.run(resolution.point).await.unwrap();
    assert_eq!(report.completed_iterations, 2);
    assert_eq!(
        executor.call_names()[calls_before..].to_vec(),
        vec![
            "pruning#1",
            "fine_tuning#1",
            "optimization#2",
            "pruning#2",
            "fine_tuning#2",
        ]
    );

    let logged = events(&config);
    assert_eq!(count(&logged, "run_resumed"), 1);
    assert_eq!(count(&logged, "run_completed"), 1);
}

#[tokio::test]
async fn test_missing_artifact_fails_even_when_stale_copy_exists() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, 2);
    let executor = Arc::new(ScriptedExecutor::new().fail_once(
        Phase::FineTuning,
        0,
        ScriptedFailure::NoArtifact,
    ));

    let mut driver = IterationDriver::fresh(config.clone(), executor).unwrap();
    let stale = config.layout().finetuned_model(0);
    fs::write(&stale, b"left over from an earlier attempt").unwrap();

    let err = driver.run(ResumePoint::fresh()).await.unwrap_err();
    assert!(matches!(
        err,
        DriverError::ArtifactMissing {
            phase: Phase::FineTuning,
            iteration: 0,
            ..
        }
    ));
    assert!(!stale.exists());

    let logged = events(&config);
    assert!(logged.iter().any(|e| matches!(
        e,
        RunEvent::PhaseFailed {
            phase: Phase::FineTuning,
            ..
        }
    )));
}

#[tokio::test]
async fn test_no_feasible_candidate_aborts_by_default() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, 2);
    let executor = Arc::new(
        ScriptedExecutor::new().with_records(0, vec![record(300.0, 0.6), record(250.0, 0.4)]),
    );

    let mut driver = IterationDriver::fresh(config.clone(), executor.clone()).unwrap();
    let err = driver.run(ResumePoint::fresh()).await.unwrap_err();
    assert!(matches!(
        err,
        DriverError::Core(FinepruneError::NoFeasibleCandidate { iteration: 0, .. })
    ));
    assert_eq!(executor.call_names(), vec!["optimization#0"]);

    // Optimization completed, so a resume re-enters at pruning.
    drop(driver);
    let (_, resolution) = IterationDriver::resume(config, executor).unwrap();
    assert_eq!(resolution.point.entry_phase(), Phase::Pruning);
}

#[tokio::test]
async fn test_no_feasible_candidate_falls_back_to_fastest() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp, 2);
    config.selection.no_feasible = NoFeasiblePolicy::Fastest;
    let executor = Arc::new(
        ScriptedExecutor::new().with_records(0, vec![record(300.0, 0.6), record(250.0, 0.4)]),
    );

    let mut driver = IterationDriver::fresh(config.clone(), executor).unwrap();
    let report = driver.run(ResumePoint::fresh()).await.unwrap();
    assert_eq!(report.completed_iterations, 2);

    let logged = events(&config);
    let fallback = logged
        .iter()
        .find_map(|e| match e {
            RunEvent::CandidateSelected {
                iteration: 0,
                latency,
                feasible,
                ..
            } => Some((*latency, *feasible)),
            _ => None,
        })
        .expect("candidate for iteration 0");
    assert_eq!(fallback, (250.0, false));
}

#[tokio::test]
async fn test_timeout_stops_the_run() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, 2);
    let executor = Arc::new(ScriptedExecutor::new().fail_once(
        Phase::Optimization,
        0,
        ScriptedFailure::Timeout,
    ));

    let mut driver = IterationDriver::fresh(config.clone(), executor).unwrap();
    let err = driver.run(ResumePoint::fresh()).await.unwrap_err();
    assert!(matches!(err, DriverError::Timeout { iteration: 0, .. }));
    assert_eq!(count(&events(&config), "phase_failed"), 1);
}

#[tokio::test]
async fn test_resuming_a_completed_run_does_nothing() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, 2);
    let executor = Arc::new(ScriptedExecutor::new());

    let mut driver = IterationDriver::fresh(config.clone(), executor.clone()).unwrap();
    driver.run(ResumePoint::fresh()).await.unwrap();
    drop(driver);

    let (mut driver, resolution) =
        IterationDriver::resume(config.clone(), executor.clone()).unwrap();
    assert!(resolution.run_completed);
    assert_eq!(resolution.point.iteration, 2);

    let calls_before = executor.calls().len();
    let report = driver.run(resolution.point).await.unwrap();
    assert_eq!(report.completed_iterations, 0);
    assert_eq!(report.final_model, Some(config.layout().finetuned_model(1)));
    assert_eq!(executor.calls().len(), calls_before);
    assert_eq!(count(&events(&config), "run_completed"), 1);
}

#[tokio::test]
async fn test_resume_records_missing_run_completion() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, 2);
    let executor = Arc::new(ScriptedExecutor::new());

    let mut driver = IterationDriver::fresh(config.clone(), executor.clone()).unwrap();
    driver.run(ResumePoint::fresh()).await.unwrap();
    drop(driver);

    // Lose the final marker as if the process died right after the last fine-tuning.
    let log_path = config.layout().run_log();
    let text = fs::read_to_string(&log_path).unwrap();
    let truncated: String = text
        .lines()
        .filter(|line| !line.contains("\"event\":\"run_completed\""))
        .map(|line| format!("{line}\n"))
        .collect();
    fs::write(&log_path, truncated).unwrap();
    assert!(!resolve_file(&log_path).unwrap().run_completed);

    let (mut driver, resolution) =
        IterationDriver::resume(config.clone(), executor.clone()).unwrap();
    assert!(!resolution.run_completed);
    assert_eq!(resolution.point.iteration, 2);

    let calls_before = executor.calls().len();
    let report = driver.run(resolution.point).await.unwrap();
    assert_eq!(report.completed_iterations, 0);
    assert_eq!(executor.calls().len(), calls_before);
    assert_eq!(count(&events(&config), "run_completed"), 1);
    assert!(resolve_file(&log_path).unwrap().run_completed);

    // Running the completed driver again does not duplicate the marker.
    driver.run(resolution.point).await.unwrap();
    assert_eq!(count(&events(&config), "run_completed"), 1);
}

fn sh(script: &str, name: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        script.to_string(),
        name.to_string(),
    ]
}

fn shell_config(tmp: &TempDir) -> RunConfig {
    let mut config = test_config(tmp, 2);
    fs::write(&config.paths.original_model, b"weights").unwrap();
    config.optimizer.command = sh(
        r#"printf '{"pruning_config": {"conv1": 0.25}, "latency": %s, "accuracy": 0.6}\n' "$5" > "$6bo.log""#,
        "optimizer",
    );
    config.pruner.command = sh(r#"cp "$1" "$3""#, "pruner");
    config.finetuner.command = sh(r#"cp "$1" "$3" && echo "min_acc $4" > "$6""#, "finetuner");
    config
}

#[tokio::test]
async fn test_process_executor_runs_shell_phases() {
    let tmp = TempDir::new().unwrap();
    let config = shell_config(&tmp);

    let mut driver =
        IterationDriver::fresh(config.clone(), Arc::new(ProcessExecutor::new())).unwrap();
    let report = driver.run(ResumePoint::fresh()).await.unwrap();
    assert_eq!(report.completed_iterations, 2);

    let layout = config.layout();
    assert_eq!(fs::read(layout.finetuned_model(1)).unwrap(), b"weights");
    assert_eq!(
        fs::read_to_string(layout.finetune_log(0)).unwrap().trim(),
        "min_acc 0.55"
    );
    let handoff = read_pruning_config(&layout.pruning_config()).unwrap();
    assert_eq!(handoff.get("conv1"), Some(&0.25));
}

#[tokio::test]
async fn test_process_executor_reports_exit_code() {
    let tmp = TempDir::new().unwrap();
    let mut config = shell_config(&tmp);
    config.pruner.command = sh("echo 'out of memory' >&2; exit 7", "pruner");

    let mut driver =
        IterationDriver::fresh(config.clone(), Arc::new(ProcessExecutor::new())).unwrap();
    let err = driver.run(ResumePoint::fresh()).await.unwrap_err();
    match err {
        DriverError::NonZeroExit {
            phase,
            exit_code,
            stderr_tail,
            ..
        } => {
            assert_eq!(phase, Phase::Pruning);
            assert_eq!(exit_code, 7);
            assert_eq!(stderr_tail, "out of memory");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_process_executor_kills_slow_phase() {
    let tmp = TempDir::new().unwrap();
    let mut config = shell_config(&tmp);
    config.optimizer.command = sh("sleep 5", "optimizer");
    config.optimizer.timeout_secs = 1;

    let mut driver =
        IterationDriver::fresh(config.clone(), Arc::new(ProcessExecutor::new())).unwrap();
    let err = driver.run(ResumePoint::fresh()).await.unwrap_err();
    assert!(matches!(
        err,
        DriverError::Timeout {
            phase: Phase::Optimization,
            timeout_secs: 1,
            ..
        }
    ));
}
