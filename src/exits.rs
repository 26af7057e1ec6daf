//! The exit multiplexer.
//!
//! ```text
//! implementation ──fires──▶ Exits ──▶ ExitSink ──coerce──▶ Outcome
//!                                         │
//!                        async: spawn ────┼──▶ RouteTable ──▶ continuation
//!                        sync:  record ───┘       (exec_sync reads it back)
//! ```
//!
//! `Exits` is handed to the implementation by value and every fire method
//! consumes it, so an implementation can fire at most once. The sink tracks
//! `Running → Exited → Delivered` (or `Abandoned` when a sync machine returned
//! without exiting) and drops anything fired after it settled.

use crate::coerce::{coerce_at, CoerceOptions, HopPath};
use crate::definition::{ExitId, ExitKind, Machine};
use crate::error::MachineError;
use crate::exemplar::Exemplar;
use crate::provenance::{Fault, Omen};
use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

// ============================================================================
// Outcome
// ============================================================================

/// The single terminal result of one execution.
#[derive(Debug)]
pub enum Outcome {
    Success(Value),
    /// A declared, non-error exit.
    Exit { name: String, payload: Value },
    Error(Fault),
}

impl Outcome {
    pub fn exit_name(&self) -> &str {
        match self {
            Self::Success(_) => "success",
            Self::Exit { name, .. } => name,
            Self::Error(_) => "error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// `Ok` only for `success`; declared exits become `E_EXIT` faults.
    #[track_caller]
    pub fn into_result(self, machine: &Machine) -> Result<Value, Fault> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Error(fault) => Err(fault),
            Self::Exit {
                name,
                payload: Value::Fault(fault),
            } => match Arc::try_unwrap(fault) {
                Ok(fault) => Err(fault),
                Err(shared) => Err(Fault::from(exit_error(machine, &name, Value::Fault(shared)))),
            },
            Self::Exit { name, payload } => Err(Fault::from(exit_error(machine, &name, payload))),
        }
    }
}

pub(crate) fn exit_error(machine: &Machine, name: &str, payload: Value) -> MachineError {
    MachineError::Exit {
        machine: machine.identity().to_string(),
        exit: name.to_string(),
        description: machine
            .exit(name)
            .and_then(|exit| exit.description())
            .map(str::to_string),
        payload,
    }
}

// ============================================================================
// Switchback: the caller's continuation table
// ============================================================================

type ValueContinuation = Box<dyn FnOnce(Value) + Send>;
type FaultContinuation = Box<dyn FnOnce(Fault) + Send>;

/// One continuation per exit.
#[derive(Default)]
pub struct Switchback {
    success: Option<ValueContinuation>,
    error: Option<FaultContinuation>,
    named: BTreeMap<String, ValueContinuation>,
}

impl Switchback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expand an error-first callback into `success` + `error` continuations.
    pub fn callback<F>(callback: F) -> Self
    where
        F: FnOnce(Result<Value, Fault>) + Send + 'static,
    {
        let shared = Arc::new(Mutex::new(Some(callback)));
        let on_error = Arc::clone(&shared);
        Self::new()
            .on_success(move |value| {
                if let Some(callback) = lock(&shared).take() {
                    callback(Ok(value));
                }
            })
            .on_error(move |fault| {
                if let Some(callback) = lock(&on_error).take() {
                    callback(Err(fault));
                }
            })
    }

    pub fn on_success<F>(mut self, continuation: F) -> Self
    where
        F: FnOnce(Value) + Send + 'static,
    {
        self.success = Some(Box::new(continuation));
        self
    }

    pub fn on_error<F>(mut self, continuation: F) -> Self
    where
        F: FnOnce(Fault) + Send + 'static,
    {
        self.error = Some(Box::new(continuation));
        self
    }

    /// Continuation for the exit called `name`. An `error` continuation
    /// registered here receives the fault as a `Value`.
    pub fn on<F>(mut self, name: impl Into<String>, continuation: F) -> Self
    where
        F: FnOnce(Value) + Send + 'static,
    {
        let name = name.into();
        match name.as_str() {
            "success" => self.success = Some(Box::new(continuation)),
            "error" => {
                self.error = Some(Box::new(move |fault: Fault| continuation(Value::from(fault))))
            }
            _ => {
                self.named.insert(name, Box::new(continuation));
            }
        }
        self
    }

    /// Fold `other` onto this table; its continuations win.
    pub fn merge(mut self, other: Switchback) -> Self {
        if other.success.is_some() {
            self.success = other.success;
        }
        if other.error.is_some() {
            self.error = other.error;
        }
        self.named.extend(other.named);
        self
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.success.is_none() && self.error.is_none() && self.named.is_empty()
    }
}

impl std::fmt::Debug for Switchback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switchback")
            .field("success", &self.success.is_some())
            .field("error", &self.error.is_some())
            .field("named", &self.named.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Continuations indexed by the machine's exits.
pub(crate) struct RouteTable {
    success: Option<ValueContinuation>,
    error: FaultContinuation,
    /// `None`: no continuation, deliver through `error`.
    declared: Vec<Option<ValueContinuation>>,
}

impl RouteTable {
    pub(crate) fn build(machine: &Machine, switchback: Switchback) -> Result<Self, MachineError> {
        let error = switchback.error.ok_or_else(|| MachineError::NoErrorCallback {
            machine: machine.identity().to_string(),
        })?;

        let mut declared: Vec<Option<ValueContinuation>> =
            machine.declared_exits().iter().map(|_| None).collect();
        for (name, continuation) in switchback.named {
            match machine.exit_kind(&name) {
                Some(ExitKind::Declared(id)) => declared[id.index()] = Some(continuation),
                _ => {
                    return Err(MachineError::UnknownExit {
                        machine: machine.identity().to_string(),
                        exit: name,
                    })
                }
            }
        }

        Ok(Self {
            success: switchback.success,
            error,
            declared,
        })
    }
}

// ============================================================================
// ExitSink: per-execution delivery state
// ============================================================================

/// Per-execution payload exemplars. `None` means void.
#[derive(Debug, Clone, Default)]
pub(crate) struct EffectiveExits {
    pub(crate) success: Option<Exemplar>,
    pub(crate) declared: Vec<Option<Exemplar>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Exited,
    Delivered,
    Abandoned,
}

pub(crate) enum Delivery {
    Async {
        routes: Option<RouteTable>,
        handle: tokio::runtime::Handle,
    },
    Sync,
}

struct SinkInner {
    phase: Phase,
    omen: Option<Omen>,
    delivery: Delivery,
    recorded: Option<Outcome>,
}

pub(crate) struct ExitSink {
    machine: Machine,
    instance: Uuid,
    exits: EffectiveExits,
    options: CoerceOptions,
    inner: Mutex<SinkInner>,
}

enum Fired {
    Success(Value),
    Declared(ExitId, Value),
    Failure(anyhow::Error),
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ExitSink {
    pub(crate) fn new(
        machine: Machine,
        instance: Uuid,
        exits: EffectiveExits,
        options: CoerceOptions,
        delivery: Delivery,
        omen: Omen,
    ) -> Arc<Self> {
        Arc::new(Self {
            machine,
            instance,
            exits,
            options,
            inner: Mutex::new(SinkInner {
                phase: Phase::Running,
                omen: Some(omen),
                delivery,
                recorded: None,
            }),
        })
    }

    /// Report a failure that happened outside an exit (e.g. invalid argins or
    /// an implementation returning `Err`).
    pub(crate) fn fail(&self, error: anyhow::Error) {
        self.settle(Fired::Failure(error));
    }

    /// Take the recorded outcome of a sync execution. When nothing was
    /// recorded the sink is abandoned and later exits are dropped.
    pub(crate) fn take_recorded(&self) -> Option<Outcome> {
        let mut inner = lock(&self.inner);
        match inner.recorded.take() {
            Some(outcome) => {
                inner.phase = Phase::Delivered;
                Some(outcome)
            }
            None => {
                inner.phase = Phase::Abandoned;
                None
            }
        }
    }

    fn settle(&self, fired: Fired) {
        let dispatch = {
            let mut guard = lock(&self.inner);
            let inner: &mut SinkInner = &mut guard;
            if inner.phase != Phase::Running {
                warn!(
                    machine = %self.machine.identity(),
                    instance = %self.instance,
                    phase = ?inner.phase,
                    "exit fired after the instance settled; dropping it"
                );
                return;
            }

            let outcome = self.outcome(inner, fired);
            debug!(
                machine = %self.machine.identity(),
                instance = %self.instance,
                exit = outcome.exit_name(),
                "machine exited"
            );

            match &mut inner.delivery {
                Delivery::Sync => {
                    inner.recorded = Some(outcome);
                    inner.phase = Phase::Exited;
                    return;
                }
                Delivery::Async { routes, handle } => {
                    let handle = handle.clone();
                    let Some(routes) = routes.take() else {
                        return;
                    };
                    inner.phase = Phase::Delivered;
                    let omen = inner.omen.take();
                    (handle, self.dispatch(routes, outcome, omen))
                }
            }
        };

        let (handle, dispatch) = dispatch;
        handle.spawn(async move { dispatch() });
    }

    fn outcome(&self, inner: &mut SinkInner, fired: Fired) -> Outcome {
        match fired {
            Fired::Success(payload) => {
                match self.coerce_payload("success", self.exits.success.as_ref(), payload) {
                    Ok(value) => Outcome::Success(value),
                    Err(error) => Outcome::Error(self.customize(inner, error)),
                }
            }
            Fired::Declared(id, payload) => {
                let name = self
                    .machine
                    .exit_def(ExitKind::Declared(id))
                    .map(|exit| exit.name().to_string())
                    .unwrap_or_default();
                let exemplar = self.exits.declared.get(id.index()).and_then(Option::as_ref);
                match self.coerce_payload(&name, exemplar, payload) {
                    Ok(payload) => Outcome::Exit { name, payload },
                    Err(error) => Outcome::Error(self.customize(inner, error)),
                }
            }
            Fired::Failure(error) => Outcome::Error(self.into_fault(inner, error)),
        }
    }

    fn coerce_payload(
        &self,
        exit: &str,
        exemplar: Option<&Exemplar>,
        payload: Value,
    ) -> Result<Value, MachineError> {
        let Some(exemplar) = exemplar else {
            return Ok(payload);
        };
        coerce_at(payload, exemplar, &self.options, &HopPath::root()).map_err(|report| {
            MachineError::ExitValidation {
                machine: self.machine.identity().to_string(),
                exit: exit.to_string(),
                report,
            }
        })
    }

    fn customize(&self, inner: &mut SinkInner, error: MachineError) -> Fault {
        match inner.omen.take() {
            Some(omen) => omen.customize(error),
            None => Fault::new(error),
        }
    }

    /// Recover a fault carried inside an implementation's error, or wrap it.
    fn into_fault(&self, inner: &mut SinkInner, error: anyhow::Error) -> Fault {
        let error = match error.downcast::<Fault>() {
            Ok(fault) => return fault,
            Err(error) => error,
        };
        let error = match error.downcast::<MachineError>() {
            Ok(machine_error) => machine_error,
            Err(source) => MachineError::Runtime {
                machine: self.machine.identity().to_string(),
                source,
            },
        };
        self.customize(inner, error)
    }

    /// Bind the outcome to its continuation.
    fn dispatch(
        &self,
        routes: RouteTable,
        outcome: Outcome,
        omen: Option<Omen>,
    ) -> Box<dyn FnOnce() + Send> {
        let RouteTable {
            success,
            error,
            mut declared,
        } = routes;

        match outcome {
            Outcome::Success(value) => match success {
                Some(continuation) => Box::new(move || continuation(value)),
                None => {
                    debug!(
                        machine = %self.machine.identity(),
                        instance = %self.instance,
                        "no success continuation registered; discarding payload"
                    );
                    Box::new(|| {})
                }
            },
            Outcome::Error(fault) => Box::new(move || error(fault)),
            Outcome::Exit { name, payload } => {
                let slot = match self.machine.exit_kind(&name) {
                    Some(ExitKind::Declared(id)) => declared.get_mut(id.index()).and_then(Option::take),
                    _ => None,
                };
                match slot {
                    Some(continuation) => Box::new(move || continuation(payload)),
                    None => {
                        let exit = exit_error(&self.machine, &name, payload);
                        let fault = match omen {
                            Some(omen) => omen.customize(exit),
                            None => Fault::new(exit),
                        };
                        Box::new(move || error(fault))
                    }
                }
            }
        }
    }
}

// ============================================================================
// Exits: the handle given to the implementation
// ============================================================================

/// The exits of one execution. Firing consumes the handle.
pub struct Exits {
    sink: Arc<ExitSink>,
    fired: bool,
}

impl Exits {
    pub(crate) fn new(sink: Arc<ExitSink>) -> Self {
        Self { sink, fired: false }
    }

    pub fn machine(&self) -> &Machine {
        &self.sink.machine
    }

    pub fn has_exit(&self, name: &str) -> bool {
        self.sink.machine.exit_kind(name).is_some()
    }

    pub fn success(mut self, payload: impl Into<Value>) {
        self.fired = true;
        self.sink.settle(Fired::Success(payload.into()));
    }

    /// Fire `error`. A `Fault` or `MachineError` inside keeps its code;
    /// anything else becomes `E_MACHINE_RUNTIME`.
    pub fn error(mut self, error: impl Into<anyhow::Error>) {
        self.fired = true;
        self.sink.settle(Fired::Failure(error.into()));
    }

    /// Fire the exit called `name`.
    pub fn exit(mut self, name: &str, payload: impl Into<Value>) {
        self.fired = true;
        let payload = payload.into();
        let fired = match self.sink.machine.exit_kind(name) {
            Some(ExitKind::Success) => Fired::Success(payload),
            Some(ExitKind::Error) => Fired::Failure(self.error_payload(payload)),
            Some(ExitKind::Declared(id)) => Fired::Declared(id, payload),
            None => Fired::Failure(anyhow::Error::new(MachineError::UnknownExit {
                machine: self.sink.machine.identity().to_string(),
                exit: name.to_string(),
            })),
        };
        self.sink.settle(fired);
    }

    fn error_payload(&self, payload: Value) -> anyhow::Error {
        match payload {
            Value::Fault(fault) => match Arc::try_unwrap(fault) {
                Ok(fault) => anyhow::Error::new(fault),
                Err(shared) => anyhow::Error::new(exit_error(
                    &self.sink.machine,
                    "error",
                    Value::Fault(shared),
                )),
            },
            other => anyhow::Error::new(exit_error(&self.sink.machine, "error", other)),
        }
    }
}

impl Drop for Exits {
    fn drop(&mut self) {
        if !self.fired {
            debug!(
                machine = %self.sink.machine.identity(),
                instance = %self.sink.instance,
                "exits dropped without firing; instance stays running"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ExitSpec;
    use crate::error::FaultKind;

    fn machine() -> Machine {
        Machine::builder("router")
            .exit("notFound", ExitSpec::void())
            .exit("found", ExitSpec::example(1))
            .implementation(|_, exits, _| {
                exits.success(Value::Undefined);
                Ok(())
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_route_table_requires_error_continuation() {
        let err = RouteTable::build(&machine(), Switchback::new().on_success(|_| {}))
            .err()
            .unwrap();
        assert_eq!(err.code(), "E_NO_ERROR_CALLBACK_CONFIGURED");
    }

    #[test]
    fn test_route_table_rejects_undeclared_exit() {
        let sb = Switchback::new().on_error(|_| {}).on("missing", |_| {});
        let err = RouteTable::build(&machine(), sb).err().unwrap();
        assert_eq!(err.kind(), FaultKind::Usage);
        assert!(matches!(err, MachineError::UnknownExit { ref exit, .. } if exit == "missing"));
    }

    #[test]
    fn test_route_table_routes_unhandled_exits_via_error() {
        let sb = Switchback::new().on_error(|_| {}).on("found", |_| {});
        let routes = RouteTable::build(&machine(), sb).unwrap();
        assert!(routes.declared[0].is_none());
        assert!(routes.declared[1].is_some());
        assert!(routes.success.is_none());
    }

    #[test]
    fn test_sync_sink_records_first_outcome_only() {
        let m = machine();
        let sink = ExitSink::new(
            m.clone(),
            Uuid::now_v7(),
            EffectiveExits {
                success: None,
                declared: vec![None, Some(Exemplar::number())],
            },
            CoerceOptions::lenient(),
            Delivery::Sync,
            Omen::capture(),
        );
        Exits::new(Arc::clone(&sink)).exit("found", "42");
        Exits::new(Arc::clone(&sink)).success("late");
        match sink.take_recorded() {
            Some(Outcome::Exit { name, payload }) => {
                assert_eq!(name, "found");
                assert_eq!(payload, Value::Number(42.0));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_abandoned_sink_drops_late_exit() {
        let sink = ExitSink::new(
            machine(),
            Uuid::now_v7(),
            EffectiveExits::default(),
            CoerceOptions::lenient(),
            Delivery::Sync,
            Omen::capture(),
        );
        assert!(sink.take_recorded().is_none());
        Exits::new(Arc::clone(&sink)).success("too late");
        assert!(sink.take_recorded().is_none());
    }

    #[test]
    fn test_error_exit_with_plain_payload_is_wrapped() {
        let sink = ExitSink::new(
            machine(),
            Uuid::now_v7(),
            EffectiveExits::default(),
            CoerceOptions::lenient(),
            Delivery::Sync,
            Omen::capture(),
        );
        Exits::new(Arc::clone(&sink)).exit("error", "boom");
        match sink.take_recorded() {
            Some(Outcome::Error(fault)) => {
                assert_eq!(fault.code(), "E_EXIT");
                assert_eq!(fault.error().exit(), Some("error"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_callback_switchback_receives_success() {
        let (tx, rx) = std::sync::mpsc::channel();
        let sb = Switchback::callback(move |result| {
            let _ = tx.send(result.map(|v| v.to_json()));
        });
        assert!(sb.has_error());
        if let Some(success) = sb.success {
            success(Value::from(3));
        }
        assert_eq!(rx.recv().unwrap().unwrap(), Some(serde_json::json!(3)));
    }
}
