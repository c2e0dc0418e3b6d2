//! Full-pipeline execution tests: runbook -> compose -> generate ->
//! schedule -> engine, with real shell processes.

use std::fs;
use std::sync::Arc;

use batchrun::config::Runbook;
use batchrun::engine::{
    KeepTemps, ParallelEngine, RunOptions, RunStatus, SerialEngine, ShellRunner,
};
use batchrun::scheduler::Scheduler;
use batchrun::template::{compose_all, generate, Bindings, TempSpec, Template};
use serde_json::json;

fn collect_instances(
    template: &Template,
    bindings: &Bindings,
) -> Vec<batchrun::instance::CommandInstance> {
    generate(template, bindings, &[], &TempSpec::default())
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

#[tokio::test]
async fn end_to_end_runbook_execution() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.yaml");
    fs::write(
        &path,
        r#"
variables:
  who: [world, there]
templates:
  greet: echo hello {who}
"#,
    )
    .unwrap();

    let runbook = Runbook::load(&path).unwrap();
    let composed = compose_all(&runbook.templates).unwrap();
    let instances = collect_instances(&composed["greet"], &runbook.variables);
    assert_eq!(instances.len(), 2);

    let schedule = Scheduler::from_seed(1).schedule(instances);
    let engine = ParallelEngine::shell(RunOptions::default().with_quiet(true));
    let report = engine.run(schedule).await.unwrap();

    assert_eq!(report.total(), 2);
    assert!(report.all_succeeded());
    let mut outputs: Vec<String> = report
        .results
        .iter()
        .map(|r| String::from_utf8_lossy(&r.output).trim().to_string())
        .collect();
    outputs.sort();
    assert_eq!(outputs, vec!["hello there", "hello world"]);
}

#[tokio::test]
async fn failure_is_recorded_and_does_not_abort_siblings() {
    let template = Template::new("bench", "mix", "{cmd}").unwrap();
    let mut bindings = Bindings::new();
    bindings.insert("cmd".to_string(), json!(["exit 1", "echo ok"]));
    let instances = collect_instances(&template, &bindings);

    let engine = SerialEngine::shell(RunOptions::default().with_quiet(true));
    let report = engine.run_all(instances).await;

    assert_eq!(report.total(), 2);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.succeeded(), 1);
    assert!(!report.all_succeeded());
    // failures carry the rendered script for reporting
    let failed = report
        .results
        .iter()
        .find(|r| r.status == RunStatus::Failed)
        .unwrap();
    assert_eq!(failed.script, "exit 1");
}

#[tokio::test]
async fn dry_run_performs_no_execution() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker");
    let template = Template::new(
        "bench",
        "touchy",
        &format!("touch {}", marker.display()),
    )
    .unwrap();
    let instances = collect_instances(&template, &Bindings::new());

    let schedule = Scheduler::from_seed(1).schedule(instances);
    let engine = ParallelEngine::shell(RunOptions::default().with_dry_run(true));
    let report = engine.run(schedule).await.unwrap();

    assert_eq!(report.skipped(), 1);
    assert!(report.results[0].timing.is_none());
    assert!(!marker.exists(), "dry run executed the script");
}

#[tokio::test]
async fn keep_temps_never_deletes_regardless_of_outcome() {
    for script in ["echo data > {TempFile.log}", "echo data > {TempFile.log}; exit 1"] {
        let template = Template::new("bench", "t", script).unwrap();
        let instances = collect_instances(&template, &Bindings::new());
        let path = instances[0].assignment.temp_files["log"].clone();

        let engine = SerialEngine::shell(
            RunOptions::default()
                .with_keep_temps(KeepTemps::Never)
                .with_quiet(true),
        );
        engine.run_all(instances).await;
        assert!(!path.exists(), "keep-temps=never left {}", path.display());
    }
}

#[tokio::test]
async fn keep_temps_always_keeps_regardless_of_outcome() {
    for script in ["echo data > {TempFile.log}", "echo data > {TempFile.log}; exit 1"] {
        let template = Template::new("bench", "t", script).unwrap();
        let instances = collect_instances(&template, &Bindings::new());
        let path = instances[0].assignment.temp_files["log"].clone();

        let engine = SerialEngine::shell(
            RunOptions::default()
                .with_keep_temps(KeepTemps::Always)
                .with_quiet(true),
        );
        engine.run_all(instances).await;
        assert!(path.exists(), "keep-temps=always deleted {}", path.display());
        fs::remove_file(&path).unwrap();
    }
}

#[tokio::test]
async fn keep_temps_fail_keeps_only_failures() {
    let cases = [
        ("echo data > {TempFile.log}", false),
        ("echo data > {TempFile.log}; exit 1", true),
    ];
    for (script, should_exist) in cases {
        let template = Template::new("bench", "t", script).unwrap();
        let instances = collect_instances(&template, &Bindings::new());
        let path = instances[0].assignment.temp_files["log"].clone();

        let engine = SerialEngine::shell(
            RunOptions::default()
                .with_keep_temps(KeepTemps::Fail)
                .with_quiet(true),
        );
        engine.run_all(instances).await;
        assert_eq!(
            path.exists(),
            should_exist,
            "keep-temps=fail mishandled {}",
            path.display()
        );
        if should_exist {
            fs::remove_file(&path).unwrap();
        }
    }
}

#[tokio::test]
async fn rounds_execute_in_order_with_real_processes() {
    // a and b (round 0) sleep before appending; ab (round 1) appends
    // immediately. If the barrier holds, ab's line comes last.
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("order.log");
    let registry = batchrun::semaphore::SemaphoreRegistry::new();
    let sem_a = registry.declare("A", 1).unwrap();
    let sem_b = registry.declare("B", 1).unwrap();

    let make = |name: &str, script: String, sems: Vec<batchrun::semaphore::Semaphore>| {
        let mut template = Template::new("bench", name, &script).unwrap();
        for sem in sems {
            template = template.with_semaphore(sem);
        }
        collect_instances(&template, &Bindings::new()).remove(0)
    };

    let instances = vec![
        make(
            "a",
            format!("sleep 0.2; echo a >> {}", log.display()),
            vec![sem_a.clone()],
        ),
        make(
            "b",
            format!("sleep 0.2; echo b >> {}", log.display()),
            vec![sem_b.clone()],
        ),
        make(
            "ab",
            format!("echo ab >> {}", log.display()),
            vec![sem_a, sem_b],
        ),
    ];

    let schedule = Scheduler::from_seed(7).schedule(instances);
    let runner = Arc::new(ShellRunner::new());
    let engine = ParallelEngine::new(
        runner,
        RunOptions::default().with_workers(4).with_quiet(true),
    );
    let report = engine.run(schedule).await.unwrap();
    assert!(report.all_succeeded());

    let contents = fs::read_to_string(&log).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[2], "ab", "round barrier violated: {lines:?}");
}
