//! Execution flow through the supervisor
//!
//! Covers deferred delivery, exit routing, sync execution, the input and
//! exit pipelines and the recursion ceiling, all through the public API.
//!
//! Set `RUST_LOG=switchback=debug` to see the engine's lifecycle events.

use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use switchback::{
    EngineConfig, ExitSpec, FaultKind, InputSpec, Machine, MachineError, MachineRegistry, Outcome,
    Switchback, Typeclass, Value,
};
use tokio::sync::oneshot;

/// Install a test-friendly subscriber once per test binary.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn lookup() -> Machine {
    Machine::builder("lookup-user")
        .sync(true)
        .input("id", InputSpec::example(1).required())
        .exit("success", ExitSpec::example(json!({"id": 1, "name": "ada"})))
        .exit("notFound", ExitSpec::void().description("No user has that id"))
        .implementation(|inputs, exits, _env| {
            match inputs.number("id") {
                Some(id) if id == 7.0 => exits.success(json!({"id": "7", "name": "ada", "admin": true})),
                _ => exits.exit("notFound", Value::Undefined),
            }
            Ok(())
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_exec_delivers_after_returning() {
    init_tracing();
    let (tx, rx) = oneshot::channel();
    let delivered = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&delivered);

    lookup()
        .configure([("id", 7)])
        .unwrap()
        .exec_switchback(
            Switchback::new()
                .on_success(move |user| {
                    flag.store(true, Ordering::SeqCst);
                    let _ = tx.send(user);
                })
                .on_error(|fault| panic!("unexpected fault {fault}")),
        )
        .unwrap();

    // The implementation already exited, but the continuation has not run yet.
    assert!(!delivered.load(Ordering::SeqCst));

    let user = rx.await.unwrap();
    assert!(delivered.load(Ordering::SeqCst));
    assert_eq!(user.to_json(), Some(json!({"id": 7, "name": "ada"})));
}

#[tokio::test]
async fn test_exec_with_callback() {
    let (tx, rx) = oneshot::channel();
    lookup()
        .configure([("id", "7")])
        .unwrap()
        .exec_with(move |result| {
            let _ = tx.send(result);
        })
        .unwrap();

    let user = rx.await.unwrap().unwrap();
    assert_eq!(user.get("id"), Some(&Value::Number(7.0)));
}

#[tokio::test]
async fn test_unhandled_exit_routes_through_error() {
    let (tx, rx) = oneshot::channel();
    lookup()
        .configure([("id", 3)])
        .unwrap()
        .exec_with(move |result| {
            let _ = tx.send(result);
        })
        .unwrap();

    let fault = rx.await.unwrap().unwrap_err();
    assert_eq!(fault.code(), "E_EXIT");
    assert_eq!(fault.kind(), FaultKind::Runtime);
    assert_eq!(fault.error().exit(), Some("notFound"));
    match fault.error() {
        MachineError::Exit { description, .. } => {
            assert_eq!(description.as_deref(), Some("No user has that id"))
        }
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn test_declared_exit_continuation() {
    let (tx, rx) = oneshot::channel();
    lookup()
        .configure([("id", 3)])
        .unwrap()
        .exec_switchback(
            Switchback::new()
                .on("notFound", move |payload| {
                    let _ = tx.send(payload);
                })
                .on_error(|fault| panic!("unexpected fault {fault}")),
        )
        .unwrap();

    assert!(rx.await.unwrap().is_undefined());
}

#[tokio::test]
async fn test_missing_error_continuation_is_rejected_synchronously() {
    let fault = lookup()
        .configure([("id", 7)])
        .unwrap()
        .exec_switchback(Switchback::new().on_success(|_| {}))
        .unwrap_err();
    assert_eq!(fault.code(), "E_NO_ERROR_CALLBACK_CONFIGURED");
    assert!(fault.origin().file().ends_with("supervisor_flow.rs"));
}

#[tokio::test]
async fn test_continuation_for_undeclared_exit_is_usage_fault() {
    let fault = lookup()
        .configure([("id", 7)])
        .unwrap()
        .exec_switchback(Switchback::new().on_error(|_| {}).on("gone", |_| {}))
        .unwrap_err();
    assert_eq!(fault.code(), "E_USAGE");
}

#[test]
fn test_exec_sync_requires_sync_machine() {
    let machine = Machine::builder("later")
        .implementation(|_, exits, _| {
            exits.success(1);
            Ok(())
        })
        .build()
        .unwrap();

    let fault = machine.instance().exec_sync().unwrap_err();
    assert_eq!(fault.code(), "E_USAGE");
}

#[tokio::test]
async fn test_sync_machine_that_defers_is_inconsistent() {
    init_tracing();
    let machine = Machine::builder("liar")
        .sync(true)
        .implementation(|_, exits, _| {
            tokio::spawn(async move { exits.success(1) });
            Ok(())
        })
        .build()
        .unwrap();

    let fault = machine.instance().exec_sync().unwrap_err();
    assert_eq!(fault.code(), "E_MACHINE_INCONSISTENT");
    assert_eq!(fault.kind(), FaultKind::Consistency);
}

#[test]
fn test_exec_sync_coerces_success_payload() {
    let machine = Machine::builder("empty-dict")
        .sync(true)
        .exit("success", ExitSpec::example(json!({})))
        .implementation(|_, exits, _| {
            exits.success(0);
            Ok(())
        })
        .build()
        .unwrap();

    let out = machine.instance().exec_sync().unwrap();
    assert_eq!(out.to_json(), Some(json!({})));
}

#[test]
fn test_number_input_coercion() {
    let half = Machine::builder("half")
        .sync(true)
        .input("n", InputSpec::example(1).required())
        .exit("success", ExitSpec::example(1))
        .implementation(|inputs, exits, _| {
            exits.success(inputs.number("n").unwrap_or_default() / 2.0);
            Ok(())
        })
        .build()
        .unwrap();

    let out = half.configure([("n", "4.5")]).unwrap().exec_sync().unwrap();
    assert_eq!(out, Value::Number(2.25));

    let fault = half
        .configure([("n", "asgasdgjasdg")])
        .unwrap()
        .exec_sync()
        .unwrap_err();
    assert_eq!(fault.code(), "E_MACHINE_RUNTIME_VALIDATION");
    assert_eq!(fault.error().report().unwrap().paths(), vec!["n".to_string()]);
}

#[tokio::test]
async fn test_implementation_error_becomes_runtime_fault() {
    let machine = Machine::builder("broken")
        .implementation(|_, _, _| Err(anyhow::anyhow!("disk on fire")))
        .build()
        .unwrap();

    let (tx, rx) = oneshot::channel();
    machine
        .instance()
        .exec_with(move |result| {
            let _ = tx.send(result);
        })
        .unwrap();

    let fault = rx.await.unwrap().unwrap_err();
    assert_eq!(fault.code(), "E_MACHINE_RUNTIME");
    assert!(fault.to_string().contains("disk on fire"));
}

#[tokio::test]
async fn test_run_returns_outcome() {
    match lookup().configure([("id", 7)]).unwrap().run().await.unwrap() {
        Outcome::Success(user) => assert_eq!(user.get("name"), Some(&Value::from("ada"))),
        other => panic!("unexpected outcome {other:?}"),
    }

    let outcome = lookup().configure([("id", 2)]).unwrap().run().await.unwrap();
    assert_eq!(outcome.exit_name(), "notFound");
    assert!(!outcome.is_success());
}

#[tokio::test]
async fn test_run_reports_dropped_exits() {
    let machine = Machine::builder("silent")
        .implementation(|_, exits, _| {
            drop(exits);
            Ok(())
        })
        .build()
        .unwrap();

    let fault = machine.instance().run().await.unwrap_err();
    assert_eq!(fault.code(), "E_MACHINE_INCONSISTENT");
}

fn countdown(ceiling: usize) -> Machine {
    Machine::builder("countdown")
        .sync(true)
        .config(EngineConfig {
            max_recursion_depth: ceiling,
            ..EngineConfig::default()
        })
        .input("n", InputSpec::example(1).required())
        .exit("success", ExitSpec::example(1))
        .implementation(|inputs, exits, env| {
            let n = inputs.number("n").unwrap_or_default();
            if n <= 0.0 {
                exits.success(env.depth() as f64);
                return Ok(());
            }
            let child = env.resolve("countdown")?.configure([("n", n - 1.0)])?;
            match child.exec_sync() {
                Ok(depth) => exits.success(depth),
                Err(fault) => exits.error(fault),
            }
            Ok(())
        })
        .build()
        .unwrap()
}

#[test]
fn test_self_reference_within_ceiling() {
    let mut registry = MachineRegistry::new();
    registry.register(countdown(3));
    let registry = Arc::new(registry);

    let depth = registry
        .instantiate("countdown")
        .unwrap()
        .configure([("n", 3)])
        .unwrap()
        .exec_sync()
        .unwrap();
    assert_eq!(depth, Value::Number(3.0));
}

#[test]
fn test_self_reference_beyond_ceiling() {
    init_tracing();
    let mut registry = MachineRegistry::new();
    registry.register(countdown(3));
    let registry = Arc::new(registry);

    let fault = registry
        .instantiate("countdown")
        .unwrap()
        .configure([("n", 10)])
        .unwrap()
        .exec_sync()
        .unwrap_err();
    assert_eq!(fault.code(), "E_MAX_RECURSION");
}

#[test]
fn test_env_values_reach_implementation() {
    let machine = Machine::builder("greeter")
        .sync(true)
        .exit("success", ExitSpec::example("hi"))
        .implementation(|_, exits, env| {
            let locale = env.get("locale").and_then(Value::as_str).unwrap_or("en");
            exits.success(format!("hello ({locale})"));
            Ok(())
        })
        .build()
        .unwrap();

    let out = machine.instance().set_env("locale", "fr").exec_sync().unwrap();
    assert_eq!(out, Value::from("hello (fr)"));
}

#[test]
fn test_validator_runs_after_coercion() {
    let machine = Machine::builder("no-threes")
        .sync(true)
        .input(
            "n",
            InputSpec::example(1).required().with_validator(|value| match value.as_f64() {
                Some(n) if n == 3.0 => Err("no threes".to_string()),
                _ => Ok(()),
            }),
        )
        .exit("success", ExitSpec::example(1))
        .implementation(|inputs, exits, _| {
            exits.success(inputs.number("n").unwrap_or_default());
            Ok(())
        })
        .build()
        .unwrap();

    let out = machine.configure([("n", "5")]).unwrap().exec_sync().unwrap();
    assert_eq!(out, Value::Number(5.0));

    let fault = machine.configure([("n", "3")]).unwrap().exec_sync().unwrap_err();
    assert_eq!(fault.code(), "E_MACHINE_RUNTIME_VALIDATION");
    let report = fault.error().report().unwrap();
    assert_eq!(report.paths(), vec!["n".to_string()]);
    assert_eq!(report.issues()[0].message, "no threes");
}

#[test]
fn test_validator_only_input_sees_raw_value() {
    let machine = Machine::builder("tagged")
        .sync(true)
        .input(
            "tag",
            InputSpec::validator(|value| match value {
                Value::String(s) if s.starts_with('#') => Ok(()),
                other => Err(format!("{} is not a tag", other.type_name())),
            }),
        )
        .exit("success", ExitSpec::like("tag"))
        .implementation(|mut inputs, exits, _| {
            exits.success(inputs.take("tag").unwrap_or_default());
            Ok(())
        })
        .build()
        .unwrap();

    let out = machine.configure([("tag", "#rust")]).unwrap().exec_sync().unwrap();
    assert_eq!(out, Value::from("#rust"));

    let fault = machine.configure([("tag", 7)]).unwrap().exec_sync().unwrap_err();
    assert_eq!(fault.error().report().unwrap().issues()[0].message, "number is not a tag");
}

#[test]
fn test_input_generator_shapes_coercion() {
    let machine = Machine::builder("templated")
        .sync(true)
        .input("template", InputSpec::typeclass(Typeclass::Wildcard))
        .input(
            "record",
            InputSpec::example_fn(|raw| raw.get("template").cloned().unwrap_or_default()).required(),
        )
        .implementation(|mut inputs, exits, _| {
            exits.success(inputs.take("record").unwrap_or_default());
            Ok(())
        })
        .build()
        .unwrap();

    let out = machine
        .configure([
            ("template", json!({"a": 1})),
            ("record", json!({"a": "2", "b": true})),
        ])
        .unwrap()
        .exec_sync()
        .unwrap();
    assert_eq!(out.to_json(), Some(json!({"a": 2})));

    let fault = machine
        .configure([("template", json!({"a": 1})), ("record", json!({"a": "x"}))])
        .unwrap()
        .exec_sync()
        .unwrap_err();
    assert_eq!(fault.code(), "E_MACHINE_RUNTIME_VALIDATION");
    assert_eq!(fault.error().report().unwrap().paths(), vec!["record.a".to_string()]);
}

#[test]
fn test_exit_generator_sees_coerced_inputs() {
    let machine = Machine::builder("reshape")
        .sync(true)
        .input("shape", InputSpec::typeclass(Typeclass::Wildcard).required())
        .exit(
            "success",
            ExitSpec::example_fn(|inputs| inputs.get("shape").cloned().unwrap_or_default()),
        )
        .implementation(|_, exits, _| {
            exits.success(json!({"a": "5", "z": 1}));
            Ok(())
        })
        .build()
        .unwrap();

    let out = machine
        .configure([("shape", json!({"a": 0}))])
        .unwrap()
        .exec_sync()
        .unwrap();
    assert_eq!(out.to_json(), Some(json!({"a": 5})));
}

fn totals(config: EngineConfig) -> Machine {
    Machine::builder("totals")
        .sync(true)
        .config(config)
        .exit("success", ExitSpec::example(json!({"a": 1})))
        .implementation(|_, exits, _| {
            exits.success(json!({"a": "nope"}));
            Ok(())
        })
        .build()
        .unwrap()
}

#[test]
fn test_strict_exit_coercion_rejects_payload() {
    let strict = EngineConfig {
        lenient_exit_coercion: false,
        ..EngineConfig::default()
    };
    let fault = totals(strict).instance().exec_sync().unwrap_err();
    assert_eq!(fault.code(), "E_EXIT_VALIDATION");
    assert_eq!(fault.error().report().unwrap().paths(), vec!["a".to_string()]);

    let out = totals(EngineConfig::default()).instance().exec_sync().unwrap();
    assert_eq!(out.to_json(), Some(json!({"a": 0})));
}

#[tokio::test]
async fn test_item_of_exit_coerces_to_item_pattern() {
    let machine = Machine::builder("pick")
        .input("ids", InputSpec::example(json!([1])).required())
        .exit("first", ExitSpec::item_of("ids"))
        .implementation(|_, exits, _| {
            exits.exit("first", "7");
            Ok(())
        })
        .build()
        .unwrap();

    let outcome = machine
        .configure([("ids", json!([3, 4]))])
        .unwrap()
        .run()
        .await
        .unwrap();
    match outcome {
        Outcome::Exit { name, payload } => {
            assert_eq!(name, "first");
            assert_eq!(payload, Value::Number(7.0));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}
