use pipecore::events::RunEvent;
use pipecore::{
    ErrorPolicy, FnTask, Format, GraphError, Iteration, Locality, PatternError, PatternSpec,
    PipelineError, Target, TargetError, Task, TaskContext, Value,
};
use piperuntime::{PipelineRuntime, RuntimeConfig, UnitStatus, WorkerMode};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn persistent_config(dir: &Path) -> RuntimeConfig {
    RuntimeConfig {
        meta_path: Some(dir.join("meta.json")),
        storage_root: Some(dir.join("store")),
        ..RuntimeConfig::default()
    }
}

fn constant(value: Value) -> Arc<dyn Task> {
    Arc::new(FnTask::new(move |_ctx| {
        let value = value.clone();
        async move { Ok(value) }
    }))
}

fn numbers(ns: impl IntoIterator<Item = i64>) -> Value {
    Value::Array(ns.into_iter().map(Value::from).collect())
}

/// Branch task: doubles the single scalar slice it receives.
fn double_of(input: &'static str) -> Arc<dyn Task> {
    Arc::new(FnTask::new(move |ctx: TaskContext| async move {
        let n = ctx
            .require_input(input)?
            .as_f64()
            .ok_or_else(|| TargetError::ExecutionFailed("expected a number".into()))?;
        Ok(Value::from(n * 2.0))
    }))
}

/// Stem task: doubles every element of an array input.
fn double_each(input: &'static str) -> Arc<dyn Task> {
    Arc::new(FnTask::new(move |ctx: TaskContext| async move {
        let items: Vec<Value> = ctx
            .require_input(input)?
            .as_array()
            .ok_or_else(|| TargetError::ExecutionFailed("expected an array".into()))?
            .iter()
            .map(|v| Value::from(v.as_f64().unwrap_or(0.0) * 2.0))
            .collect();
        Ok(Value::Array(items))
    }))
}

fn sum_of(input: &'static str) -> Arc<dyn Task> {
    Arc::new(FnTask::new(move |ctx: TaskContext| async move {
        let total: f64 = ctx
            .require_input(input)?
            .as_array()
            .ok_or_else(|| TargetError::ExecutionFailed("expected an array".into()))?
            .iter()
            .filter_map(Value::as_f64)
            .sum();
        Ok(Value::from(total))
    }))
}

fn failing_on(input: &'static str, bad: f64) -> Arc<dyn Task> {
    Arc::new(FnTask::new(move |ctx: TaskContext| async move {
        let n = ctx
            .require_input(input)?
            .as_f64()
            .ok_or_else(|| TargetError::ExecutionFailed("expected a number".into()))?;
        if n == bad {
            return Err(TargetError::ExecutionFailed(format!("cannot process {n}")));
        }
        Ok(Value::from(n * 2.0))
    }))
}

#[tokio::test]
async fn test_linear_pipeline_is_idempotent_across_runtimes() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let build = || {
        let mut rt = PipelineRuntime::with_config(persistent_config(dir.path())).unwrap();
        rt.register(Target::new("raw", "load_raw()"), constant(numbers([1, 2, 3])))
            .unwrap();
        rt.register(
            Target::new("doubled", "double(raw)").with_deps(["raw"]),
            double_each("raw"),
        )
        .unwrap();
        rt
    };

    let rt = build();
    let report = rt.run().await.unwrap();
    assert_eq!(report.executed, 2);
    assert_eq!(report.succeeded(), vec!["doubled", "raw"]);
    assert_eq!(rt.load("doubled").await.unwrap(), numbers([2, 4, 6]));

    // A fresh runtime over the same metadata re-runs nothing.
    let rt = build();
    let report = rt.run().await.unwrap();
    assert_eq!(report.executed, 0);
    assert_eq!(report.skipped(), vec!["doubled", "raw"]);
    assert_eq!(rt.load("doubled").await.unwrap(), numbers([2, 4, 6]));
}

#[tokio::test]
async fn test_command_change_reruns_only_descendants() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let build = |transform_cmd: &'static str| {
        let mut rt = PipelineRuntime::with_config(persistent_config(dir.path())).unwrap();
        rt.register(Target::new("a", "source()"), constant(numbers([1, 2])))
            .unwrap();
        rt.register(
            Target::new("b", transform_cmd).with_deps(["a"]),
            double_each("a"),
        )
        .unwrap();
        rt.register(
            Target::new("c", "summarize(b)").with_deps(["b"]),
            sum_of("b"),
        )
        .unwrap();
        rt.register(Target::new("d", "unrelated()"), constant(Value::from(7i64)))
            .unwrap();
        rt
    };

    build("transform_v1(a)").run().await.unwrap();

    let rt = build("transform_v2(a)");
    let report = rt.run().await.unwrap();
    assert_eq!(report.executed, 2);
    assert_eq!(report.skipped(), vec!["a", "d"]);
    assert_eq!(report.succeeded(), vec!["b", "c"]);
}

#[tokio::test]
async fn test_map_pattern_runs_one_branch_per_element() {
    init_tracing();
    let mut rt = PipelineRuntime::new();
    rt.register(Target::new("xs", "xs()"), constant(numbers([1, 2, 3])))
        .unwrap();
    rt.register(
        Target::new("p", "double(xs)").with_pattern(PatternSpec::map(["xs"])),
        double_of("xs"),
    )
    .unwrap();

    let report = rt.run().await.unwrap();
    let branches: Vec<&str> = report
        .statuses
        .keys()
        .filter(|n| n.starts_with("p#"))
        .map(String::as_str)
        .collect();
    assert_eq!(branches.len(), 3);
    assert!(branches
        .iter()
        .all(|b| report.status(b) == Some(&UnitStatus::Succeeded)));
    assert_eq!(rt.load("p").await.unwrap(), numbers([2, 4, 6]));
}

#[tokio::test]
async fn test_map_length_mismatch_aborts_the_run() {
    init_tracing();
    let mut rt = PipelineRuntime::new();
    rt.register(Target::new("xs", "xs()"), constant(numbers([1, 2, 3])))
        .unwrap();
    rt.register(Target::new("ys", "ys()"), constant(numbers([10, 20])))
        .unwrap();
    rt.register(
        Target::new("pairs", "combine(xs, ys)").with_pattern(PatternSpec::map(["xs", "ys"])),
        constant(Value::Null),
    )
    .unwrap();

    let err = rt.run().await.unwrap_err();
    match err {
        PipelineError::Pattern(PatternError::LengthMismatch { pattern, counts }) => {
            assert_eq!(pattern, "pairs");
            assert_eq!(counts.len(), 2);
        }
        other => panic!("expected LengthMismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cross_pattern_expands_rightmost_fastest() {
    init_tracing();
    let mut rt = PipelineRuntime::new();
    rt.register(Target::new("w", "w()"), constant(numbers([1, 2])))
        .unwrap();
    rt.register(Target::new("x", "x()"), constant(numbers([1, 2, 3])))
        .unwrap();
    rt.register(Target::new("y", "y()"), constant(numbers([4, 5, 6])))
        .unwrap();

    let spec = PatternSpec::cross([PatternSpec::leaf("w"), PatternSpec::map(["x", "y"])]);
    let task: Arc<dyn Task> = Arc::new(FnTask::new(|ctx: TaskContext| async move {
        let w = ctx.require_input("w")?.as_f64().unwrap();
        let x = ctx.require_input("x")?.as_f64().unwrap();
        let y = ctx.require_input("y")?.as_f64().unwrap();
        Ok(Value::from(w * 100.0 + x * 10.0 + y))
    }));
    rt.register(Target::new("grid", "grid(w, x, y)").with_pattern(spec), task)
        .unwrap();

    let report = rt.run().await.unwrap();
    assert_eq!(
        report
            .statuses
            .keys()
            .filter(|n| n.starts_with("grid#"))
            .count(),
        6
    );
    assert_eq!(
        rt.load("grid").await.unwrap(),
        numbers([114, 125, 136, 214, 225, 236])
    );
}

fn row(city: &str, v: i64) -> Value {
    let mut fields = HashMap::new();
    fields.insert("city".to_string(), Value::from(city));
    fields.insert("v".to_string(), Value::from(v));
    Value::Object(fields)
}

#[tokio::test]
async fn test_group_iteration_branches_by_key() {
    init_tracing();
    let mut rt = PipelineRuntime::new();
    let rows = Value::Array(vec![
        row("west", 1),
        row("east", 2),
        row("west", 3),
        row("north", 4),
        row("east", 5),
        row("west", 6),
    ]);
    rt.register(
        Target::new("rows", "rows()").with_group_by("city"),
        constant(rows),
    )
    .unwrap();

    let task: Arc<dyn Task> = Arc::new(FnTask::new(|ctx: TaskContext| async move {
        let total: f64 = ctx
            .require_input("rows")?
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|r| r.as_object()?.get("v")?.as_f64())
            .sum();
        Ok(Value::from(total))
    }));
    rt.register(
        Target::new("by_city", "sum_by_city(rows)").with_pattern(PatternSpec::map(["rows"])),
        task,
    )
    .unwrap();

    let report = rt.run().await.unwrap();
    assert_eq!(
        report
            .statuses
            .keys()
            .filter(|n| n.starts_with("by_city#"))
            .count(),
        3
    );
    // Group keys resolve in ascending order: east, north, west.
    assert_eq!(rt.load("by_city").await.unwrap(), numbers([7, 4, 10]));
}

#[tokio::test]
async fn test_head_and_tail_truncate_branches() {
    init_tracing();
    let mut rt = PipelineRuntime::new();
    rt.register(Target::new("xs", "xs()"), constant(numbers([1, 2, 3, 4])))
        .unwrap();
    rt.register(
        Target::new("first_two", "f(xs)")
            .with_pattern(PatternSpec::head(PatternSpec::map(["xs"]), 2)),
        double_of("xs"),
    )
    .unwrap();
    rt.register(
        Target::new("last_two", "g(xs)")
            .with_pattern(PatternSpec::tail(PatternSpec::map(["xs"]), 2)),
        double_of("xs"),
    )
    .unwrap();

    let report = rt.run().await.unwrap();
    assert!(report.failed().is_empty());
    assert_eq!(rt.load("first_two").await.unwrap(), numbers([2, 4]));
    assert_eq!(rt.load("last_two").await.unwrap(), numbers([6, 8]));
}

#[tokio::test]
async fn test_pattern_shape_change_reruns_consumers() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let build = |n: usize| {
        let mut rt = PipelineRuntime::with_config(persistent_config(dir.path())).unwrap();
        rt.register(Target::new("xs", "xs()"), constant(numbers([1, 2, 3])))
            .unwrap();
        rt.register(
            Target::new("p", "double(xs)")
                .with_pattern(PatternSpec::head(PatternSpec::map(["xs"]), n)),
            double_of("xs"),
        )
        .unwrap();
        rt.register(Target::new("q", "total(p)").with_deps(["p"]), sum_of("p"))
            .unwrap();
        rt
    };

    let rt = build(2);
    rt.run().await.unwrap();
    assert_eq!(rt.load("q").await.unwrap(), Value::from(6.0));

    // Widening the pattern changes the aggregate, so the consumer
    // must recompute instead of skipping against the old value.
    let rt = build(3);
    let report = rt.run().await.unwrap();
    assert_eq!(report.status("q"), Some(&UnitStatus::Succeeded));
    assert_eq!(rt.load("p").await.unwrap(), numbers([2, 4, 6]));
    assert_eq!(rt.load("q").await.unwrap(), Value::from(12.0));
}

#[tokio::test]
async fn test_sample_pattern_is_deterministic_for_a_seed() {
    init_tracing();
    let build = || {
        let mut rt = PipelineRuntime::new();
        rt.register(
            Target::new("xs", "xs()"),
            constant(numbers([10, 20, 30, 40, 50])),
        )
        .unwrap();
        rt.register(
            Target::new("picked", "pick(xs)")
                .with_pattern(PatternSpec::sample(PatternSpec::map(["xs"]), 2, 7)),
            double_of("xs"),
        )
        .unwrap();
        rt
    };

    let rt = build();
    rt.run().await.unwrap();
    let first = rt.load("picked").await.unwrap();
    let picked: Vec<f64> = first
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_f64)
        .collect();
    assert_eq!(picked.len(), 2);
    // Selected branches keep their creation order.
    assert!(picked[0] < picked[1]);

    let rt = build();
    rt.run().await.unwrap();
    assert_eq!(rt.load("picked").await.unwrap(), first);
}

#[tokio::test]
async fn test_list_iteration_keeps_one_entry_per_branch() {
    init_tracing();
    let mut rt = PipelineRuntime::new();
    rt.register(Target::new("xs", "xs()"), constant(numbers([1, 2])))
        .unwrap();

    let task: Arc<dyn Task> = Arc::new(FnTask::new(|ctx: TaskContext| async move {
        let n = ctx.require_input("xs")?.as_f64().unwrap() as i64;
        Ok(numbers([n, n * 10]))
    }));
    rt.register(
        Target::new("expanded", "expand(xs)")
            .with_pattern(PatternSpec::map(["xs"]))
            .with_iteration(Iteration::List),
        task,
    )
    .unwrap();

    rt.run().await.unwrap();
    assert_eq!(
        rt.load("expanded").await.unwrap(),
        Value::Array(vec![numbers([1, 10]), numbers([2, 20])])
    );
}

#[tokio::test]
async fn test_continue_policy_isolates_failed_branch() {
    init_tracing();
    let mut rt = PipelineRuntime::new();
    rt.register(Target::new("xs", "xs()"), constant(numbers([1, 2, 3])))
        .unwrap();
    rt.register(
        Target::new("p", "risky(xs)")
            .with_pattern(PatternSpec::map(["xs"]))
            .with_error_policy(ErrorPolicy::Continue),
        failing_on("xs", 2.0),
    )
    .unwrap();
    rt.register(
        Target::new("q", "consume(p)").with_deps(["p"]),
        constant(Value::Null),
    )
    .unwrap();

    let report = rt.run().await.unwrap();
    let ok = report
        .statuses
        .iter()
        .filter(|(n, s)| n.starts_with("p#") && matches!(s, UnitStatus::Succeeded))
        .count();
    let bad = report
        .statuses
        .iter()
        .filter(|(n, s)| n.starts_with("p#") && matches!(s, UnitStatus::Failed(_)))
        .count();
    assert_eq!((ok, bad), (2, 1));
    assert!(matches!(report.status("xs"), Some(UnitStatus::Succeeded)));
    assert!(matches!(report.status("p"), Some(UnitStatus::Failed(_))));
    assert!(matches!(report.status("q"), Some(UnitStatus::Failed(_))));
}

#[tokio::test]
async fn test_stop_policy_halts_unrelated_pending_work() {
    init_tracing();
    let config = RuntimeConfig {
        max_parallel: 1,
        ..RuntimeConfig::default()
    };
    let mut rt = PipelineRuntime::with_config(config).unwrap();
    rt.register(Target::new("xs", "xs()"), constant(numbers([1, 2, 3])))
        .unwrap();
    rt.register(
        Target::new("p", "risky(xs)").with_pattern(PatternSpec::map(["xs"])),
        failing_on("xs", 2.0),
    )
    .unwrap();
    rt.register(Target::new("island", "island()"), constant(Value::from(1i64)))
        .unwrap();

    let report = rt.run().await.unwrap();
    let ok = report
        .statuses
        .iter()
        .filter(|(n, s)| n.starts_with("p#") && matches!(s, UnitStatus::Succeeded))
        .count();
    let bad = report
        .statuses
        .iter()
        .filter(|(n, s)| n.starts_with("p#") && matches!(s, UnitStatus::Failed(_)))
        .count();
    // One branch ran, one failed, the third sibling was cut down with
    // the pattern when the run stopped.
    assert_eq!((ok, bad), (1, 2));
    assert!(matches!(report.status("p"), Some(UnitStatus::Failed(_))));
    assert_eq!(report.status("island"), Some(&UnitStatus::Cancelled));
}

#[tokio::test]
async fn test_independent_fast_path_is_not_blocked_by_slow_sibling() {
    init_tracing();
    let mut rt = PipelineRuntime::new();
    let mut events = rt.subscribe_events();

    rt.register(Target::new("data", "data()"), constant(numbers([1, 2])))
        .unwrap();
    rt.register(
        Target::new("fast", "fast(data)").with_deps(["data"]),
        constant(Value::from(1i64)),
    )
    .unwrap();
    let slow: Arc<dyn Task> = Arc::new(FnTask::new(|_ctx| async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(Value::from(2i64))
    }));
    rt.register(Target::new("slow", "slow(data)").with_deps(["data"]), slow)
        .unwrap();
    rt.register(
        Target::new("plot_fast", "plot(fast)").with_deps(["fast"]),
        constant(Value::Null),
    )
    .unwrap();
    rt.register(
        Target::new("plot_slow", "plot(slow)").with_deps(["slow"]),
        constant(Value::Null),
    )
    .unwrap();

    let report = rt.run().await.unwrap();
    assert!(report.failed().is_empty());

    let mut completions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RunEvent::UnitCompleted { unit, .. } = event {
            completions.push(unit);
        }
    }
    let pos = |name: &str| completions.iter().position(|u| u == name).unwrap();
    // The fast chain finishes while the slow sibling still runs, and
    // the slow chain's consumer waits for its producer.
    assert!(pos("plot_fast") < pos("slow"));
    assert!(pos("slow") < pos("plot_slow"));
}

#[tokio::test]
async fn test_file_target_tracks_external_content() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("report.txt");
    let out_path = out.to_string_lossy().to_string();

    let build = || {
        let mut rt = PipelineRuntime::with_config(persistent_config(dir.path())).unwrap();
        let path = out_path.clone();
        let task: Arc<dyn Task> = Arc::new(FnTask::new(move |_ctx| {
            let path = path.clone();
            async move {
                tokio::fs::write(&path, b"report body")
                    .await
                    .map_err(|e| TargetError::ExecutionFailed(e.to_string()))?;
                Ok(Value::Array(vec![Value::String(path)]))
            }
        }));
        rt.register(
            Target::new("report", "render_report()").with_format(Format::File),
            task,
        )
        .unwrap();
        rt
    };

    assert_eq!(build().run().await.unwrap().executed, 1);
    assert_eq!(build().run().await.unwrap().executed, 0);

    // Out-of-band edits invalidate the recorded digest.
    tokio::fs::write(&out, b"tampered").await.unwrap();
    let report = build().run().await.unwrap();
    assert_eq!(report.executed, 1);
    assert_eq!(report.status("report"), Some(&UnitStatus::Succeeded));

    // A missing artifact is a hard failure, not a silent re-run.
    tokio::fs::remove_file(&out).await.unwrap();
    let report = build().run().await.unwrap();
    assert!(matches!(report.status("report"), Some(UnitStatus::Failed(_))));
}

#[tokio::test]
async fn test_transient_workers_and_main_deployment() {
    init_tracing();
    let config = RuntimeConfig {
        worker_mode: WorkerMode::Transient,
        ..RuntimeConfig::default()
    };
    let mut rt = PipelineRuntime::with_config(config).unwrap();
    rt.register(
        Target::new("local", "local()").with_deployment(Locality::Main),
        constant(numbers([5, 6])),
    )
    .unwrap();
    rt.register(
        Target::new("shipped", "ship(local)").with_deps(["local"]),
        sum_of("local"),
    )
    .unwrap();

    let report = rt.run().await.unwrap();
    assert_eq!(report.succeeded().len(), 2);
    assert_eq!(rt.load("shipped").await.unwrap(), Value::from(11.0));
}

#[tokio::test]
async fn test_validate_rejects_cycles() {
    let mut rt = PipelineRuntime::new();
    rt.register(
        Target::new("a", "a(b)").with_deps(["b"]),
        constant(Value::Null),
    )
    .unwrap();
    rt.register(
        Target::new("b", "b(a)").with_deps(["a"]),
        constant(Value::Null),
    )
    .unwrap();

    let err = rt.validate().unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Graph(GraphError::CyclicDependency { .. })
    ));
}
