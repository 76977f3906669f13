//! End-to-end pipeline behavior over the full surface: stores, requirement
//! resolution, ordered execution, and engine parity.

use tokio::runtime::Handle;

use skein_runner::prelude::*;

#[derive(Debug, PartialEq, Clone)]
struct Parsed {
    jobs: usize,
}

#[derive(Debug, PartialEq, Clone)]
struct Report {
    total: usize,
}

struct Unregistered;

#[test]
fn labelled_value_reaches_a_labelled_requirement() {
    fn read(x: Res<i32>) -> i32 {
        *x
    }

    let scope = Scope::new();
    scope.add_label_only("x", 1_i32).unwrap();

    let declared = step(read).requires(requires![Need::label("x")]);
    assert_eq!(scope.call(declared).unwrap(), 1);
}

#[test]
fn a_step_feeds_the_next_through_the_shared_scope() {
    fn step_a() -> Parsed {
        Parsed { jobs: 3 }
    }

    fn step_b(parsed: Res<Parsed>) -> Report {
        Report {
            total: parsed.jobs * 2,
        }
    }

    let mut runner = Runner::new();
    runner.add(step_a);
    runner.add(step_b);

    let scope = runner.run().unwrap();
    assert_eq!(scope.get::<Report>().unwrap().total, 6);
}

#[test]
fn duplicate_registration_clashes_by_name() {
    let scope = Scope::new();
    scope.add(Parsed { jobs: 1 }).unwrap();
    let err = scope.add(Parsed { jobs: 2 }).unwrap_err();
    assert_eq!(err.to_string(), "scope already contains Parsed");
}

#[test]
fn unregistered_requirement_fails_by_name() {
    fn read(_missing: Res<Unregistered>) {}

    let scope = Scope::new();
    let err = scope.call(read).unwrap_err();
    assert_eq!(err.to_string(), "Need(Unregistered) could not be satisfied");
}

#[test]
fn first_steps_precede_default_steps_precede_last_steps() {
    use std::sync::{Arc, Mutex};

    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let mut runner = Runner::new();
    for (name, order) in [
        ("teardown", Order::Last),
        ("work", Order::Default),
        ("setup", Order::First),
        ("more-work", Order::Default),
    ] {
        let log = Arc::clone(&log);
        let entry = runner.add(move || {
            log.lock().unwrap().push(name);
        });
        match order {
            Order::First => {
                entry.first();
            }
            Order::Last => {
                entry.last();
            }
            Order::Default => {}
        }
    }

    runner.run().unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        ["setup", "work", "more-work", "teardown"]
    );
}

#[test]
fn runner_failure_names_the_failing_step_and_dependency() {
    fn boot() -> Parsed {
        Parsed { jobs: 1 }
    }

    fn broken(_missing: Res<Unregistered>) {}

    let mut runner = Runner::new();
    runner.add(boot);
    runner.add(step(broken).named("broken"));

    let err = runner.run().unwrap_err();
    assert_eq!(
        err.to_string(),
        "while calling broken: Need(Unregistered) could not be satisfied"
    );
}

#[test]
fn pipelines_thread_scope_state_through_explicit_scope_steps() {
    fn seed(scope: Scope) {
        scope.add_label_only("seeded", 10_usize).unwrap();
    }

    fn harvest(scope: Scope) -> Report {
        let seeded = scope.get_labelled::<usize>("seeded").map(|v| *v).unwrap_or(0);
        Report { total: seeded }
    }

    let mut runner = Runner::new();
    runner.add(seed).first();
    runner.add(harvest);

    let scope = runner.run().unwrap();
    assert_eq!(scope.get::<Report>().unwrap().total, 10);
}

#[test]
fn run_in_a_nested_scope_falls_back_to_the_parent() {
    fn report(parsed: Res<Parsed>) -> Report {
        Report {
            total: parsed.jobs,
        }
    }

    let root = Scope::new();
    root.add(Parsed { jobs: 7 }).unwrap();

    let child = root.nest();
    let mut runner = Runner::new();
    runner.add(report);
    runner.run_in(&child).unwrap();

    // The result lands in the child, invisible to the parent.
    assert_eq!(child.get::<Report>().unwrap().total, 7);
    assert!(root.get::<Report>().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engines_agree_on_a_pipeline_with_providers() {
    fn consume(parsed: Res<Parsed>) -> Report {
        Report {
            total: parsed.jobs + 1,
        }
    }

    let build = || {
        let mut runner = Runner::new();
        runner.add(consume);
        runner
    };

    let blocking_scope = Scope::new();
    blocking_scope
        .add_resolver(|_ctx| Some(Parsed { jobs: 4 }))
        .unwrap();
    build().run_in(&blocking_scope).unwrap();

    let suspending_scope = Scope::new();
    suspending_scope
        .add_async_resolver(|_ctx| async { Some(Parsed { jobs: 4 }) })
        .unwrap();
    build()
        .run_in_on(&suspending_scope, &Handle::current())
        .await
        .unwrap();

    assert_eq!(
        blocking_scope.get::<Report>().unwrap().total,
        suspending_scope.get::<Report>().unwrap().total
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mixed_pipeline_crosses_the_bridge_both_ways() {
    async fn fetch() -> Parsed {
        Parsed { jobs: 2 }
    }

    fn summarize(bridge: SyncBridge) -> Report {
        // Blocking code drives a suspending lookup through the bridge.
        let parsed = bridge.get::<Parsed>().expect("stored by the first step");
        Report {
            total: parsed.jobs * 5,
        }
    }

    let mut runner = Runner::new();
    runner.add_async(fetch).first();
    runner.add(summarize);

    let scope = runner.run_on(&Handle::current()).await.unwrap();
    assert_eq!(scope.get::<Report>().unwrap().total, 10);
}

#[test]
fn extract_with_explicit_label_feeds_later_labelled_requirements() {
    fn produce() -> usize {
        99
    }

    fn read(port: Res<usize>) -> String {
        format!("port {}", *port)
    }

    let scope = Scope::new();
    let mut runner = Runner::new();
    runner.add(produce).returns(Returns::labelled("port"));
    runner
        .add(read)
        .requires(requires![Need::label("port")]);
    runner.run_in(&scope).unwrap();

    assert_eq!(*scope.get::<String>().unwrap(), "port 99");
}
