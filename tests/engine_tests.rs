//! End-to-end engine tests: whole runs through the public API

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use weir::{
    validate, ConfigError, FnHandler, Graph, Handler, HandlerError, HandlerRegistry,
    Invocation, NodeStatus, Outputs, Run, RunStatus, ValidatedGraph,
};

fn validated(yaml: &str) -> ValidatedGraph {
    validate(&Graph::from_yaml(yaml).unwrap()).unwrap()
}

/// Handler producing `out = sum of numeric inputs + 1` for every node
fn adder() -> Arc<dyn Handler> {
    Arc::new(FnHandler::new(|inv: Invocation| async move {
        let sum: i64 = inv.inputs.values().filter_map(|v| v.as_i64()).sum();
        let mut out = Outputs::default();
        out.insert("out".into(), json!(sum + 1));
        Ok(out)
    }))
}

fn adder_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("add", adder());
    registry
}

const DIAMOND: &str = r#"
nodes:
  - id: a
    kind: add
    inputs:
      seed: { value: 0 }
    outputs: [out]
  - id: b
    kind: add
    inputs:
      x: { from: a.out }
    outputs: [out]
  - id: c
    kind: add
    inputs:
      x: { from: a.out }
    outputs: [out]
  - id: d
    kind: add
    inputs:
      l: { from: b.out }
      r: { from: c.out }
    outputs: [out]
"#;

#[tokio::test]
async fn diamond_completes_with_dataflow() {
    let run = Run::new(validated(DIAMOND), adder_registry());
    let report = run.run().await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert!(!report.cancelled);
    for node in &report.nodes {
        assert_eq!(node.status, NodeStatus::Succeeded);
        assert_eq!(node.attempts, 1);
    }
    // a=1, b=c=2, d=2+2+1
    assert_eq!(report.outputs["a"][&Arc::<str>::from("out")], json!(1));
    assert_eq!(report.outputs["d"][&Arc::<str>::from("out")], json!(5));
}

#[tokio::test]
async fn succeeded_set_is_predecessor_closed() {
    let mut registry = adder_registry();
    let doomed: Arc<dyn Handler> = Arc::new(FnHandler::new(|_inv| async move {
        Err(HandlerError::fatal("planned failure"))
    }));
    registry.register("doomed", doomed);

    let graph = validated(
        r#"
nodes:
  - id: a
    kind: add
    outputs: [out]
  - id: bad
    kind: doomed
    inputs:
      x: { from: a.out }
    outputs: [out]
  - id: after_bad
    kind: add
    inputs:
      x: { from: bad.out }
    outputs: [out]
  - id: fine
    kind: add
    inputs:
      x: { from: a.out }
    outputs: [out]
"#,
    );
    let preds = graph.clone();
    let report = Run::new(graph, registry).run().await.unwrap();

    // every succeeded node's predecessors also succeeded
    for node in &report.nodes {
        if node.status == NodeStatus::Succeeded {
            for pred in preds.predecessors(&node.node_id) {
                assert_eq!(
                    report.node(pred).unwrap().status,
                    NodeStatus::Succeeded,
                    "{} succeeded but its predecessor {} did not",
                    node.node_id,
                    pred
                );
            }
        }
    }
    assert_eq!(report.node("fine").unwrap().status, NodeStatus::Succeeded);
    assert_eq!(
        report.node("after_bad").unwrap().status,
        NodeStatus::Skipped
    );
}

#[test]
fn cycle_rejected_before_anything_executes() {
    let graph = Graph::from_yaml(
        r#"
nodes:
  - id: a
    kind: add
    inputs:
      x: { from: c.out }
    outputs: [out]
  - id: b
    kind: add
    inputs:
      x: { from: a.out }
    outputs: [out]
  - id: c
    kind: add
    inputs:
      x: { from: b.out }
    outputs: [out]
"#,
    )
    .unwrap();

    let Err(ConfigError::Cycle { nodes }) = validate(&graph) else {
        panic!("expected a cycle error");
    };
    let mut ids: Vec<&str> = nodes.iter().map(|n| n.as_ref()).collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn fan_in_waits_for_all_predecessors() {
    let run = Run::new(validated(DIAMOND), adder_registry());
    let report = run.run().await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);

    let events = run.events().events();
    let started_d = events
        .iter()
        .find(|e| {
            matches!(&e.kind, weir::EventKind::NodeStarted { node_id, .. }
                if node_id.as_ref() == "d")
        })
        .unwrap()
        .id;
    for upstream in ["b", "c"] {
        let succeeded = events
            .iter()
            .find(|e| {
                matches!(&e.kind, weir::EventKind::NodeSucceeded { node_id, .. }
                    if node_id.as_ref() == upstream)
            })
            .unwrap()
            .id;
        assert!(
            succeeded < started_d,
            "d started before {upstream} succeeded"
        );
    }
}

#[tokio::test]
async fn failure_skips_descendants_without_invoking_them() {
    let invocations = Arc::new(AtomicU32::new(0));

    let mut registry = HandlerRegistry::new();
    let doomed: Arc<dyn Handler> = Arc::new(FnHandler::new(|_inv| async move {
        Err(HandlerError::fatal("dead on arrival"))
    }));
    let counted = Arc::clone(&invocations);
    let counting: Arc<dyn Handler> = Arc::new(FnHandler::new(move |_inv| {
        let counted = Arc::clone(&counted);
        async move {
            counted.fetch_add(1, Ordering::SeqCst);
            let mut out = Outputs::default();
            out.insert("out".into(), json!(1));
            Ok(out)
        }
    }));
    registry.register("doomed", doomed);
    registry.register("counting", counting);

    let graph = validated(
        r#"
nodes:
  - id: a
    kind: doomed
    outputs: [out]
  - id: b
    kind: counting
    inputs:
      x: { from: a.out }
    outputs: [out]
  - id: c
    kind: counting
    inputs:
      x: { from: b.out }
    outputs: [out]
"#,
    );
    let report = Run::new(graph, registry).run().await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    assert_eq!(report.node("b").unwrap().status, NodeStatus::Skipped);
    assert_eq!(report.node("c").unwrap().status, NodeStatus::Skipped);
    assert_eq!(
        report.node("c").unwrap().failed_ancestors,
        vec![Arc::<str>::from("a")]
    );
}

#[tokio::test]
async fn node_retries_override_makes_three_attempts() {
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&attempts);

    let mut registry = HandlerRegistry::new();
    let flaky: Arc<dyn Handler> = Arc::new(FnHandler::new(move |_inv| {
        let seen = Arc::clone(&seen);
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::transient("flaking"))
        }
    }));
    registry.register("flaky", flaky);

    let graph = validated(
        r#"
settings:
  retry:
    base_delay: 1ms
    max_delay: 4ms
nodes:
  - id: wobbly
    kind: flaky
    retries: 2
    outputs: [out]
"#,
    );
    let report = Run::new(graph, registry).run().await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let node = report.node("wobbly").unwrap();
    assert_eq!(node.attempts, 3);
    assert_eq!(node.status, NodeStatus::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_budget_bounds_running_nodes() {
    let current = Arc::new(AtomicI32::new(0));
    let peak = Arc::new(AtomicI32::new(0));

    let mut registry = HandlerRegistry::new();
    let gauge_current = Arc::clone(&current);
    let gauge_peak = Arc::clone(&peak);
    let gauged: Arc<dyn Handler> = Arc::new(FnHandler::new(move |_inv| {
        let current = Arc::clone(&gauge_current);
        let peak = Arc::clone(&gauge_peak);
        async move {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(25)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            let mut out = Outputs::default();
            out.insert("out".into(), json!(true));
            Ok(out)
        }
    }));
    registry.register("gauged", gauged);

    let graph = validated(
        r#"
settings:
  concurrency: 2
nodes:
  - id: v
    kind: gauged
    outputs: [out]
  - id: w
    kind: gauged
    outputs: [out]
  - id: x
    kind: gauged
    outputs: [out]
  - id: y
    kind: gauged
    outputs: [out]
  - id: z
    kind: gauged
    outputs: [out]
"#,
    );
    let report = Run::new(graph, registry).run().await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn reruns_produce_identical_reports() {
    let shape = |report: &weir::RunReport| {
        report
            .nodes
            .iter()
            .map(|n| (n.node_id.to_string(), n.status, n.attempts))
            .collect::<Vec<_>>()
    };

    let first = Run::new(validated(DIAMOND), adder_registry())
        .run()
        .await
        .unwrap();
    let second = Run::new(validated(DIAMOND), adder_registry())
        .run()
        .await
        .unwrap();

    assert_eq!(first.status, second.status);
    assert_eq!(shape(&first), shape(&second));
    assert_eq!(first.outputs, second.outputs);
    assert_ne!(first.run_id, second.run_id);
}

#[tokio::test]
async fn bootstrap_feeds_entry_nodes() {
    let graph = validated(
        r#"
nodes:
  - id: entry
    kind: add
    inputs:
      seed: { value: 10 }
    outputs: [out]
"#,
    );
    let report = Run::new(graph, adder_registry())
        .with_bootstrap("entry", "seed", json!(100))
        .run()
        .await
        .unwrap();

    // the overlay replaced the literal without touching the store invariants
    assert_eq!(
        report.outputs["entry"][&Arc::<str>::from("out")],
        json!(101)
    );
}

#[tokio::test]
async fn cancellation_skips_remaining_nodes() {
    let mut registry = HandlerRegistry::new();
    let obedient: Arc<dyn Handler> = Arc::new(FnHandler::new(|inv: Invocation| async move {
        tokio::select! {
            _ = inv.cancel.cancelled() => Err(HandlerError::transient("interrupted")),
            _ = tokio::time::sleep(Duration::from_secs(30)) => {
                let mut out = Outputs::default();
                out.insert("out".into(), json!(true));
                Ok(out)
            }
        }
    }));
    registry.register("obedient", obedient);

    let graph = validated(
        r#"
settings:
  concurrency: 1
nodes:
  - id: first
    kind: obedient
    outputs: [out]
  - id: second
    kind: obedient
    inputs:
      x: { from: first.out }
    outputs: [out]
"#,
    );
    let run = Run::new(graph, registry).with_cancel_grace(Duration::from_millis(200));

    let (report, ()) = tokio::join!(
        async { run.run().await.unwrap() },
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            run.cancel();
        }
    );

    assert!(report.cancelled);
    // no node terminally failed, so cancellation alone keeps the run completed
    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.nodes.iter().all(|n| n.status != NodeStatus::Failed));
    assert_eq!(report.node("first").unwrap().status, NodeStatus::Skipped);
    assert_eq!(report.node("second").unwrap().status, NodeStatus::Skipped);
    assert!(report.node("second").unwrap().failed_ancestors.is_empty());
}

#[tokio::test]
async fn unresponsive_handler_fails_cancelled_run() {
    let mut registry = HandlerRegistry::new();
    let deaf: Arc<dyn Handler> = Arc::new(FnHandler::new(|_inv: Invocation| async move {
        // ignores its cancellation token entirely
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Outputs::default())
    }));
    registry.register("deaf", deaf);

    let graph = validated(
        r#"
nodes:
  - id: stuck
    kind: deaf
"#,
    );
    let run = Run::new(graph, registry).with_cancel_grace(Duration::from_millis(50));

    let (report, ()) = tokio::join!(
        async { run.run().await.unwrap() },
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            run.cancel();
        }
    );

    assert!(report.cancelled);
    assert_eq!(report.node("stuck").unwrap().status, NodeStatus::Failed);
    assert_eq!(report.status, RunStatus::Failed);
}

#[tokio::test]
async fn graph_loaded_from_file_runs() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(DIAMOND.as_bytes()).unwrap();

    let yaml = std::fs::read_to_string(file.path()).unwrap();
    let graph = validate(&Graph::from_yaml(&yaml).unwrap()).unwrap();
    let report = Run::new(graph, adder_registry()).run().await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
}

#[tokio::test]
async fn event_stream_brackets_the_run() {
    let run = Run::new(validated(DIAMOND), adder_registry());
    let report = run.run().await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);

    let events = run.events().events();
    assert!(matches!(
        events.first().unwrap().kind,
        weir::EventKind::RunStarted { node_count: 4 }
    ));
    assert!(matches!(
        events.last().unwrap().kind,
        weir::EventKind::RunFinished {
            completed: true,
            cancelled: false,
            ..
        }
    ));
    // ids are a total order
    for pair in events.windows(2) {
        assert!(pair[0].id < pair[1].id);
    }
    // one scheduled + one started + one succeeded per node, minimum
    for id in ["a", "b", "c", "d"] {
        assert_eq!(run.events().filter_node(id).len(), 3);
    }
}
