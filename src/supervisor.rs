//! The execution supervisor.
//!
//! ```text
//! Machine ──configure──▶ LiveInstance ──exec / exec_sync / run──▶ prepare
//!                                                                   │
//!        coerce argins, run validators, synthesize lambdas ◀────────┘
//!                           │
//!                           ▼
//!        implementation(inputs, exits, env) ──▶ ExitSink ──▶ continuation
//! ```
//!
//! A `LiveInstance` is mutated only through its builder-style methods and is
//! consumed by execution, so the argins an execution sees are frozen.
//! Nested instances are created through [`Env::instantiate`], which carries
//! the depth counter and enforces the recursion ceiling.

use crate::coerce::{coerce_at, HopPath, ValidationIssue, ValidationReport};
use crate::config::EngineConfig;
use crate::definition::{ExitDef, ExitKind, ExitShape, Machine};
use crate::error::MachineError;
use crate::exemplar::Exemplar;
use crate::exits::{lock, Delivery, EffectiveExits, ExitSink, Exits, Outcome, RouteTable, Switchback};
use crate::intersect::intersect;
use crate::lambda;
use crate::provenance::{Fault, Omen};
use crate::registry::Resolver;
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

// ============================================================================
// Inputs
// ============================================================================

/// Coerced inputs handed to an implementation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inputs {
    values: BTreeMap<String, Value>,
}

impl Inputs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    /// A lambda input, already built into a machine.
    pub fn machine(&self, name: &str) -> Option<&Machine> {
        self.get(name).and_then(Value::as_machine)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn take(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_map(self) -> BTreeMap<String, Value> {
        self.values
    }
}

impl From<BTreeMap<String, Value>> for Inputs {
    fn from(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }
}

// ============================================================================
// Env
// ============================================================================

/// Ambient environment of one execution.
#[derive(Clone)]
pub struct Env {
    machine: Machine,
    instance: Uuid,
    depth: usize,
    values: Arc<BTreeMap<String, Value>>,
    resolver: Option<Arc<dyn Resolver>>,
    config: Arc<EngineConfig>,
}

impl Env {
    /// The machine being executed.
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// A child instance one level deeper, inheriting env values, resolver and config.
    #[track_caller]
    pub fn instantiate(&self, machine: &Machine) -> Result<LiveInstance, Fault> {
        let depth = self.depth + 1;
        let ceiling = self.config.max_recursion_depth;
        if depth > ceiling {
            warn!(
                machine = %machine.identity(),
                parent = %self.machine.identity(),
                depth,
                ceiling,
                "recursion ceiling exceeded"
            );
            return Err(Fault::new(MachineError::MaxRecursion {
                machine: machine.identity().to_string(),
                depth,
                ceiling,
            }));
        }

        let mut child = LiveInstance::new(machine.clone());
        child.depth = depth;
        child.env_values = self.values.as_ref().clone();
        child.resolver = self.resolver.clone();
        child.config = Arc::clone(&self.config);
        Ok(child)
    }

    /// Look up a machine by identity through the injected resolver and instantiate it.
    #[track_caller]
    pub fn resolve(&self, identity: &str) -> Result<LiveInstance, Fault> {
        let resolved = match &self.resolver {
            Some(resolver) => resolver.resolve(identity),
            None => None,
        };
        match resolved {
            Some(machine) => self.instantiate(&machine),
            None => Err(Fault::new(MachineError::UnresolvedMachine {
                identity: identity.to_string(),
            })),
        }
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("machine", &self.machine.identity())
            .field("instance", &self.instance)
            .field("depth", &self.depth)
            .field("values", &self.values)
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

// ============================================================================
// LiveInstance
// ============================================================================

/// A configured, not yet executed machine.
pub struct LiveInstance {
    id: Uuid,
    machine: Machine,
    argins: BTreeMap<String, Value>,
    switchback: Switchback,
    env_values: BTreeMap<String, Value>,
    depth: usize,
    resolver: Option<Arc<dyn Resolver>>,
    config: Arc<EngineConfig>,
}

impl LiveInstance {
    pub(crate) fn new(machine: Machine) -> Self {
        let config = machine.shared_config();
        Self {
            id: Uuid::now_v7(),
            machine,
            argins: BTreeMap::new(),
            switchback: Switchback::new(),
            env_values: BTreeMap::new(),
            depth: 0,
            resolver: None,
            config,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn argins(&self) -> &BTreeMap<String, Value> {
        &self.argins
    }

    /// Fold argins onto the configuration. Names must be declared inputs.
    #[track_caller]
    pub fn configure<I, K, V>(mut self, argins: I) -> Result<Self, Fault>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        for (name, value) in argins {
            let name = name.into();
            if self.machine.input(&name).is_none() {
                return Err(Fault::new(MachineError::UnknownInput {
                    machine: self.machine.identity().to_string(),
                    name,
                }));
            }
            self.argins.insert(name, value.into());
        }
        Ok(self)
    }

    /// Configure from a JSON object.
    #[track_caller]
    pub fn configure_json(self, argins: serde_json::Value) -> Result<Self, Fault> {
        match argins {
            serde_json::Value::Object(entries) => self.configure(entries),
            other => Err(Fault::new(MachineError::usage(format!(
                "argins for machine `{}` must be a JSON object, got {other}",
                self.machine.identity()
            )))),
        }
    }

    pub fn set_env(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.env_values.insert(key.into(), value.into());
        self
    }

    /// Fold continuations onto the configured switchback.
    pub fn switchback(mut self, switchback: Switchback) -> Self {
        self.switchback = std::mem::take(&mut self.switchback).merge(switchback);
        self
    }

    pub fn with_resolver<R: Resolver + 'static>(mut self, resolver: Arc<R>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_shared_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Execute with the configured switchback. Delivery happens on the
    /// current Tokio runtime, strictly after this call returns.
    ///
    /// Usage faults (no runtime, no `error` continuation, continuations for
    /// undeclared exits) are returned here; everything else goes through
    /// the exits.
    #[track_caller]
    pub fn exec(self) -> Result<(), Fault> {
        let omen = Omen::capture_with(self.config.capture_backtraces);
        self.launch(omen)
    }

    /// Execute with a single error-first callback, replacing configured continuations.
    #[track_caller]
    pub fn exec_with<F>(mut self, callback: F) -> Result<(), Fault>
    where
        F: FnOnce(Result<Value, Fault>) + Send + 'static,
    {
        let omen = Omen::capture_with(self.config.capture_backtraces);
        self.switchback = Switchback::callback(callback);
        self.launch(omen)
    }

    #[track_caller]
    pub fn exec_switchback(self, switchback: Switchback) -> Result<(), Fault> {
        let omen = Omen::capture_with(self.config.capture_backtraces);
        self.switchback(switchback).launch(omen)
    }

    /// Execute inline and return the `success` payload.
    ///
    /// Only machines declared sync may run this way. Any other exit is
    /// returned as `Err`; a machine that returns without exiting yields
    /// `E_MACHINE_INCONSISTENT`.
    #[track_caller]
    pub fn exec_sync(self) -> Result<Value, Fault> {
        let omen = Omen::capture_with(self.config.capture_backtraces);
        if !self.machine.is_sync() {
            return Err(omen.customize(MachineError::usage(format!(
                "machine `{}` is not declared sync; execute it with exec",
                self.machine.identity()
            ))));
        }
        if !self.switchback.is_empty() {
            debug!(
                machine = %self.machine.identity(),
                instance = %self.id,
                "configured continuations are ignored by exec_sync"
            );
        }

        let machine = self.machine.clone();
        let identity = machine.identity().to_string();
        let instance = self.id;
        let (inputs, exits, env) = match self.prepare() {
            Ok(prepared) => prepared,
            Err(error) => return Err(omen.customize(error)),
        };
        let options = env.config.exit_coercion();
        let sink = ExitSink::new(machine.clone(), instance, exits, options, Delivery::Sync, omen);
        invoke(&machine, inputs, &sink, env);

        match sink.take_recorded() {
            Some(outcome) => outcome.into_result(&machine),
            None => {
                warn!(
                    machine = %identity,
                    instance = %instance,
                    "sync machine returned without exiting"
                );
                Err(Fault::new(MachineError::Inconsistent {
                    machine: identity,
                    message: "declared sync, but no exit fired before the implementation returned"
                        .to_string(),
                }))
            }
        }
    }

    /// Execute and await the outcome, whichever exit it comes through.
    /// Configured continuations are replaced.
    #[track_caller]
    pub fn run(mut self) -> impl Future<Output = Result<Outcome, Fault>> + Send + 'static {
        let omen = Omen::capture_with(self.config.capture_backtraces);
        let identity = self.machine.identity().to_string();
        let (tx, rx) = oneshot::channel::<Outcome>();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let mut switchback = Switchback::new()
            .on_success({
                let slot = Arc::clone(&slot);
                move |value| deliver(&slot, Outcome::Success(value))
            })
            .on_error({
                let slot = Arc::clone(&slot);
                move |fault| deliver(&slot, Outcome::Error(fault))
            });
        for exit in self.machine.declared_exits() {
            let name = exit.name().to_string();
            let slot = Arc::clone(&slot);
            switchback = switchback.on(name.clone(), move |payload| {
                deliver(&slot, Outcome::Exit { name, payload })
            });
        }
        self.switchback = switchback;

        let launched = self.launch(omen);
        async move {
            launched?;
            rx.await.map_err(|_| {
                Fault::new(MachineError::Inconsistent {
                    machine: identity,
                    message: "exits were dropped without firing".to_string(),
                })
            })
        }
    }

    fn launch(mut self, omen: Omen) -> Result<(), Fault> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                return Err(omen.customize(MachineError::usage(format!(
                    "machine `{}` was executed outside a Tokio runtime; use exec_sync or enter a runtime",
                    self.machine.identity()
                ))))
            }
        };
        let routes = match RouteTable::build(&self.machine, std::mem::take(&mut self.switchback)) {
            Ok(routes) => routes,
            Err(error) => return Err(omen.customize(error)),
        };

        let machine = self.machine.clone();
        let instance = self.id;
        let options = self.config.exit_coercion();
        let delivery = Delivery::Async {
            routes: Some(routes),
            handle,
        };
        debug!(
            machine = %machine.identity(),
            instance = %instance,
            depth = self.depth,
            "executing machine"
        );

        match self.prepare() {
            Ok((inputs, exits, env)) => {
                let sink = ExitSink::new(machine.clone(), instance, exits, options, delivery, omen);
                invoke(&machine, inputs, &sink, env);
            }
            Err(error) => {
                let sink = ExitSink::new(
                    machine,
                    instance,
                    EffectiveExits::default(),
                    options,
                    delivery,
                    omen,
                );
                sink.fail(anyhow::Error::new(error));
            }
        }
        Ok(())
    }

    /// Validate and coerce the argins, then resolve this execution's exit exemplars.
    fn prepare(self) -> Result<(Inputs, EffectiveExits, Env), MachineError> {
        let Self {
            id,
            machine,
            mut argins,
            env_values,
            depth,
            resolver,
            config,
            ..
        } = self;

        let options = config.input_coercion();
        let raw = Inputs::from(argins.clone());
        let mut report = ValidationReport::new();
        let mut values = BTreeMap::new();

        for input in machine.inputs() {
            let path = HopPath::root().key(input.name());
            let generated;
            let exemplar = match input.generator() {
                Some(generator) => {
                    generated = Exemplar::infer_lenient(&generator(&raw));
                    &generated
                }
                None => input.exemplar(),
            };

            let supplied = argins
                .remove(input.name())
                .filter(|value| !value.is_undefined())
                .or_else(|| input.default().cloned());
            let Some(value) = supplied else {
                if input.is_required() {
                    report.push(ValidationIssue::new(
                        path,
                        exemplar.kind_name(),
                        "undefined",
                        "required input was not provided",
                    ));
                }
                continue;
            };

            let coerced = match coerce_at(value, exemplar, &options, &path) {
                Ok(coerced) => coerced,
                Err(issues) => {
                    report.merge(issues);
                    continue;
                }
            };

            if let Some(validator) = input.validator() {
                if let Err(message) = validator(&coerced) {
                    report.push(ValidationIssue::new(
                        path,
                        "value accepted by the validator",
                        coerced.type_name(),
                        message,
                    ));
                    continue;
                }
            }

            let coerced = match coerced {
                Value::Function(implementation) if exemplar.is_lambda() => {
                    match lambda::synthesize(&machine, input, implementation) {
                        Ok(nested) => Value::Machine(nested),
                        Err(error) => {
                            report.push(ValidationIssue::new(
                                path,
                                "lambda",
                                "function",
                                error.to_string(),
                            ));
                            continue;
                        }
                    }
                }
                other => other,
            };
            values.insert(input.name().to_string(), coerced);
        }

        if !report.is_empty() {
            debug!(
                machine = %machine.identity(),
                instance = %id,
                issues = report.len(),
                "argins failed validation"
            );
            return Err(MachineError::RuntimeValidation {
                machine: machine.identity().to_string(),
                instance: id,
                report,
            });
        }

        let inputs = Inputs::from(values);
        let exits = EffectiveExits {
            success: machine
                .exit_def(ExitKind::Success)
                .and_then(|exit| exit_exemplar(&machine, exit, &inputs)),
            declared: machine
                .declared_exits()
                .iter()
                .map(|exit| exit_exemplar(&machine, exit, &inputs))
                .collect(),
        };
        let env = Env {
            machine,
            instance: id,
            depth,
            values: Arc::new(env_values),
            resolver,
            config,
        };
        Ok((inputs, exits, env))
    }
}

impl fmt::Debug for LiveInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveInstance")
            .field("id", &self.id)
            .field("machine", &self.machine.identity())
            .field("argins", &self.argins)
            .field("switchback", &self.switchback)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

fn deliver(slot: &Mutex<Option<oneshot::Sender<Outcome>>>, outcome: Outcome) {
    if let Some(tx) = lock(slot).take() {
        let _ = tx.send(outcome);
    }
}

fn invoke(machine: &Machine, inputs: Inputs, sink: &Arc<ExitSink>, env: Env) {
    let exits = Exits::new(Arc::clone(sink));
    let implementation = machine.definition().implementation();
    if let Err(error) = implementation(inputs, exits, env) {
        sink.fail(error);
    }
}

/// The exemplar an exit's payload is coerced against in this execution.
fn exit_exemplar(machine: &Machine, exit: &ExitDef, inputs: &Inputs) -> Option<Exemplar> {
    match exit.shape() {
        ExitShape::Static(exemplar) => Some(exemplar.clone()),
        ExitShape::ItemOfInput { pattern, .. } => Some(pattern.clone()),
        ExitShape::Generator(generator) => Some(Exemplar::infer_lenient(&generator(inputs))),
        ExitShape::Void => None,
        ExitShape::LikeInput { input, exemplar } => {
            if matches!(exemplar, Exemplar::Passthrough | Exemplar::Lambda(_)) {
                return Some(exemplar.clone());
            }
            let Some(value) = inputs.get(input) else {
                return Some(exemplar.clone());
            };
            match intersect(exemplar, &Exemplar::infer_lenient(value)) {
                Ok(narrowed) => Some(narrowed),
                Err(error) => {
                    warn!(
                        machine = %machine.identity(),
                        exit = exit.name(),
                        input = %input,
                        %error,
                        "could not narrow exit to its configured input; using the declared exemplar"
                    );
                    Some(exemplar.clone())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ExitSpec, InputSpec};
    use crate::error::FaultKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn echo(sync: bool) -> Machine {
        Machine::builder("echo")
            .sync(sync)
            .input("value", InputSpec::example(json!({"id": 1, "tags": []})).required())
            .exit("success", ExitSpec::like("value"))
            .implementation(|mut inputs, exits, _| {
                exits.success(inputs.take("value").unwrap_or_default());
                Ok(())
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_configure_rejects_unknown_input() {
        let fault = echo(true).configure([("nope", 1)]).unwrap_err();
        assert_eq!(fault.code(), "E_USAGE");
        assert!(fault.origin().file().ends_with("supervisor.rs"));
    }

    #[test]
    fn test_configure_json_requires_object() {
        let fault = echo(true).instance().configure_json(json!([1])).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::Usage);
    }

    #[test]
    fn test_like_exit_narrows_to_configured_value() {
        let out = echo(true)
            .configure([("value", json!({"id": "7", "tags": ["a", 2], "extra": true}))])
            .unwrap()
            .exec_sync()
            .unwrap();
        // `tags` narrows to `[string]` from its first configured item.
        assert_eq!(out.to_json(), Some(json!({"id": 7, "tags": ["a", "2"]})));
    }

    #[test]
    fn test_missing_required_input_is_validation_fault() {
        let fault = echo(true).instance().exec_sync().unwrap_err();
        assert_eq!(fault.code(), "E_MACHINE_RUNTIME_VALIDATION");
        let report = fault.error().report().unwrap();
        assert_eq!(report.paths(), vec!["value".to_string()]);
    }

    #[test]
    fn test_exec_outside_runtime_is_usage_fault() {
        let fault = echo(false)
            .configure([("value", json!({"id": 1}))])
            .unwrap()
            .exec_with(|_| {})
            .unwrap_err();
        assert_eq!(fault.code(), "E_USAGE");
    }

    #[test]
    fn test_env_depth_ceiling() {
        let machine = echo(true);
        let config = EngineConfig {
            max_recursion_depth: 1,
            ..EngineConfig::default()
        };
        let env = Env {
            machine: machine.clone(),
            instance: Uuid::now_v7(),
            depth: 0,
            values: Arc::new(BTreeMap::new()),
            resolver: None,
            config: Arc::new(config),
        };
        let child = env.instantiate(&machine).unwrap();
        assert_eq!(child.depth(), 1);

        let deeper = Env { depth: 1, ..env.clone() };
        let fault = deeper.instantiate(&machine).unwrap_err();
        assert_eq!(fault.code(), "E_MAX_RECURSION");
        assert_eq!(env.resolve("echo").unwrap_err().code(), "E_USAGE");
    }
}
