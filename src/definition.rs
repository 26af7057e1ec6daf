//! Machine definitions: declared inputs, exits and the unit of work.
//!
//! A definition is assembled with [`MachineBuilder`] and checked once at
//! build time. Everything that can be resolved statically (exemplars,
//! `like` / `itemOf` references, lambda contracts, defaults) is resolved
//! there, so execution only has to deal with runtime data.

use crate::coerce::{coerce_at, HopPath};
use crate::config::EngineConfig;
use crate::error::ContractError;
use crate::exemplar::{Exemplar, Typeclass};
use crate::exits::Exits;
use crate::lambda::{self, LambdaContract};
use crate::provenance::Fault;
use crate::supervisor::{Env, Inputs, LiveInstance};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// The unit of work. Returning `Err` routes the error through the `error` exit.
pub type Implementation = Arc<dyn Fn(Inputs, Exits, Env) -> anyhow::Result<()> + Send + Sync>;

/// Extra check run on a coerced input value; `Err` carries the message.
pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Produces an example value from the inputs at execution time.
pub type ExampleFn = Arc<dyn Fn(&Inputs) -> Value + Send + Sync>;

// ============================================================================
// Input specs
// ============================================================================

#[derive(Clone)]
enum InputSpecSource {
    Example(Value),
    Exemplar(Exemplar),
    Typeclass(Typeclass),
    Validator,
    Generator(ExampleFn),
    Derived(Exemplar),
    Unspecified,
}

/// Declaration of one input, before the build checks.
#[derive(Clone)]
pub struct InputSpec {
    source: InputSpecSource,
    required: bool,
    default: Option<Value>,
    description: Option<String>,
    validator: Option<Validator>,
    contract: Option<LambdaContract>,
}

impl InputSpec {
    fn from_source(source: InputSpecSource) -> Self {
        Self {
            source,
            required: false,
            default: None,
            description: None,
            validator: None,
            contract: None,
        }
    }

    /// Exemplar inferred from an example value.
    pub fn example(example: impl Into<Value>) -> Self {
        Self::from_source(InputSpecSource::Example(example.into()))
    }

    pub fn exemplar(exemplar: Exemplar) -> Self {
        Self::from_source(InputSpecSource::Exemplar(exemplar))
    }

    pub fn typeclass(typeclass: Typeclass) -> Self {
        Self::from_source(InputSpecSource::Typeclass(typeclass))
    }

    /// An input checked only by `validator`; the value is passed through uncoerced.
    pub fn validator<F>(validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        let mut spec = Self::from_source(InputSpecSource::Validator);
        spec.validator = Some(Arc::new(validator));
        spec
    }

    /// Exemplar inferred at execution time from a generated example.
    /// The generator sees the raw configured argins.
    pub fn example_fn<F>(generator: F) -> Self
    where
        F: Fn(&Inputs) -> Value + Send + Sync + 'static,
    {
        Self::from_source(InputSpecSource::Generator(Arc::new(generator)))
    }

    /// No exemplar source at all; rejected by the build.
    pub fn unspecified() -> Self {
        Self::from_source(InputSpecSource::Unspecified)
    }

    pub(crate) fn derived(exemplar: Exemplar) -> Self {
        Self::from_source(InputSpecSource::Derived(exemplar))
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Run `validator` after coercion succeeds.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// The contract a lambda input's function is built against.
    pub fn contract(mut self, contract: LambdaContract) -> Self {
        self.contract = Some(contract);
        self
    }
}

/// Where a built input's exemplar came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    Example,
    Typeclass,
    Validator,
    Generator,
    /// Resolved through `like` / `itemOf` from another scope.
    Derived,
}

/// A built input.
#[derive(Clone)]
pub struct InputDef {
    name: String,
    exemplar: Exemplar,
    source: InputSource,
    required: bool,
    default: Option<Value>,
    description: Option<String>,
    validator: Option<Validator>,
    generator: Option<ExampleFn>,
}

impl InputDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Static exemplar. Generator inputs report `Wildcard` here.
    pub fn exemplar(&self) -> &Exemplar {
        &self.exemplar
    }

    pub fn source(&self) -> InputSource {
        self.source
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub(crate) fn validator(&self) -> Option<&Validator> {
        self.validator.as_ref()
    }

    pub(crate) fn generator(&self) -> Option<&ExampleFn> {
        self.generator.as_ref()
    }

    /// Whether the exemplar is fixed by this input itself, so other shapes may refer to it.
    pub(crate) fn has_own_exemplar(&self) -> bool {
        !matches!(self.source, InputSource::Derived | InputSource::Generator)
    }

    /// Lambda contract, when this input takes a callable.
    pub fn contract(&self) -> Option<&LambdaContract> {
        match &self.exemplar {
            Exemplar::Lambda(contract) => Some(contract),
            _ => None,
        }
    }
}

impl fmt::Debug for InputDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputDef")
            .field("name", &self.name)
            .field("exemplar", &self.exemplar)
            .field("source", &self.source)
            .field("required", &self.required)
            .field("default", &self.default)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Exit specs
// ============================================================================

#[derive(Clone)]
enum ExitSpecShape {
    Example(Value),
    Exemplar(Exemplar),
    Like(String),
    ItemOf(String),
    Generator(ExampleFn),
    Void,
}

#[derive(Clone)]
pub struct ExitSpec {
    shape: ExitSpecShape,
    description: Option<String>,
}

impl ExitSpec {
    fn from_shape(shape: ExitSpecShape) -> Self {
        Self {
            shape,
            description: None,
        }
    }

    pub fn example(example: impl Into<Value>) -> Self {
        Self::from_shape(ExitSpecShape::Example(example.into()))
    }

    pub fn exemplar(exemplar: Exemplar) -> Self {
        Self::from_shape(ExitSpecShape::Exemplar(exemplar))
    }

    /// Same shape as the named input or exit.
    pub fn like(target: impl Into<String>) -> Self {
        Self::from_shape(ExitSpecShape::Like(target.into()))
    }

    /// Shape of one item of the named list-typed input or exit.
    pub fn item_of(target: impl Into<String>) -> Self {
        Self::from_shape(ExitSpecShape::ItemOf(target.into()))
    }

    /// The generator sees the coerced inputs.
    pub fn example_fn<F>(generator: F) -> Self
    where
        F: Fn(&Inputs) -> Value + Send + Sync + 'static,
    {
        Self::from_shape(ExitSpecShape::Generator(Arc::new(generator)))
    }

    /// No payload guarantee; whatever is fired passes through.
    pub fn void() -> Self {
        Self::from_shape(ExitSpecShape::Void)
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Position of a declared exit within its definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExitId(pub(crate) usize);

impl ExitId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Which exit fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitKind {
    Success,
    Error,
    Declared(ExitId),
}

/// A built exit's payload contract.
#[derive(Clone)]
pub enum ExitShape {
    Static(Exemplar),
    /// Narrowed per execution against the configured value of `input`.
    LikeInput { input: String, exemplar: Exemplar },
    ItemOfInput { input: String, pattern: Exemplar },
    Generator(ExampleFn),
    Void,
}

impl ExitShape {
    /// The exemplar known at build time, if any.
    pub fn static_exemplar(&self) -> Option<&Exemplar> {
        match self {
            Self::Static(exemplar) | Self::LikeInput { exemplar, .. } => Some(exemplar),
            Self::ItemOfInput { pattern, .. } => Some(pattern),
            Self::Generator(_) | Self::Void => None,
        }
    }
}

impl fmt::Debug for ExitShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(e) => f.debug_tuple("Static").field(e).finish(),
            Self::LikeInput { input, exemplar } => f
                .debug_struct("LikeInput")
                .field("input", input)
                .field("exemplar", exemplar)
                .finish(),
            Self::ItemOfInput { input, pattern } => f
                .debug_struct("ItemOfInput")
                .field("input", input)
                .field("pattern", pattern)
                .finish(),
            Self::Generator(_) => f.write_str("Generator(..)"),
            Self::Void => f.write_str("Void"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExitDef {
    name: String,
    kind: ExitKind,
    shape: ExitShape,
    description: Option<String>,
}

impl ExitDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExitKind {
        self.kind
    }

    pub fn shape(&self) -> &ExitShape {
        &self.shape
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

// ============================================================================
// Definition / Machine
// ============================================================================

pub struct Definition {
    identity: String,
    description: Option<String>,
    sync: bool,
    inputs: Vec<InputDef>,
    success: ExitDef,
    error: ExitDef,
    declared: Vec<ExitDef>,
    implementation: Implementation,
    config: Arc<EngineConfig>,
}

impl Definition {
    pub(crate) fn implementation(&self) -> &Implementation {
        &self.implementation
    }
}

/// A built machine. Cheap to clone.
#[derive(Clone)]
pub struct Machine(Arc<Definition>);

impl Machine {
    pub fn builder(identity: impl Into<String>) -> MachineBuilder {
        MachineBuilder::new(identity)
    }

    pub fn identity(&self) -> &str {
        &self.0.identity
    }

    pub fn description(&self) -> Option<&str> {
        self.0.description.as_deref()
    }

    pub fn is_sync(&self) -> bool {
        self.0.sync
    }

    pub fn inputs(&self) -> &[InputDef] {
        &self.0.inputs
    }

    pub fn input(&self, name: &str) -> Option<&InputDef> {
        self.0.inputs.iter().find(|input| input.name == name)
    }

    /// `success`, the declared exits in order, then `error`.
    pub fn exits(&self) -> impl Iterator<Item = &ExitDef> {
        std::iter::once(&self.0.success)
            .chain(self.0.declared.iter())
            .chain(std::iter::once(&self.0.error))
    }

    pub fn exit(&self, name: &str) -> Option<&ExitDef> {
        self.exits().find(|exit| exit.name == name)
    }

    pub fn exit_kind(&self, name: &str) -> Option<ExitKind> {
        self.exit(name).map(ExitDef::kind)
    }

    pub fn exit_def(&self, kind: ExitKind) -> Option<&ExitDef> {
        match kind {
            ExitKind::Success => Some(&self.0.success),
            ExitKind::Error => Some(&self.0.error),
            ExitKind::Declared(id) => self.0.declared.get(id.0),
        }
    }

    pub fn declared_exits(&self) -> &[ExitDef] {
        &self.0.declared
    }

    pub fn config(&self) -> &EngineConfig {
        &self.0.config
    }

    pub(crate) fn shared_config(&self) -> Arc<EngineConfig> {
        Arc::clone(&self.0.config)
    }

    /// A fresh, unconfigured instance at depth zero.
    pub fn instance(&self) -> LiveInstance {
        LiveInstance::new(self.clone())
    }

    /// Shorthand for `instance().configure(argins)`.
    #[track_caller]
    pub fn configure<I, K, V>(&self, argins: I) -> Result<LiveInstance, Fault>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.instance().configure(argins)
    }

    pub fn ptr_eq(&self, other: &Machine) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn definition(&self) -> &Definition {
        &self.0
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("identity", &self.0.identity)
            .field("sync", &self.0.sync)
            .field("inputs", &self.0.inputs)
            .field("exits", &self.exits().map(ExitDef::name).collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct MachineBuilder {
    identity: String,
    description: Option<String>,
    sync: bool,
    inputs: Vec<(String, InputSpec)>,
    exits: Vec<(String, ExitSpec)>,
    implementation: Option<Implementation>,
    config: Arc<EngineConfig>,
}

impl MachineBuilder {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            description: None,
            sync: false,
            inputs: Vec::new(),
            exits: Vec::new(),
            implementation: None,
            config: Arc::new(EngineConfig::default()),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare that the implementation always exits before returning.
    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Declaring a name twice replaces the earlier spec.
    pub fn input(mut self, name: impl Into<String>, spec: InputSpec) -> Self {
        let name = name.into();
        match self.inputs.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = spec,
            None => self.inputs.push((name, spec)),
        }
        self
    }

    pub fn exit(mut self, name: impl Into<String>, spec: ExitSpec) -> Self {
        let name = name.into();
        match self.exits.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = spec,
            None => self.exits.push((name, spec)),
        }
        self
    }

    pub fn implementation<F>(self, implementation: F) -> Self
    where
        F: Fn(Inputs, Exits, Env) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.implementation_arc(Arc::new(implementation))
    }

    pub fn implementation_arc(mut self, implementation: Implementation) -> Self {
        self.implementation = Some(implementation);
        self
    }

    pub fn config(self, config: EngineConfig) -> Self {
        self.shared_config(Arc::new(config))
    }

    pub fn shared_config(mut self, config: Arc<EngineConfig>) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Machine, ContractError> {
        let implementation =
            self.implementation
                .clone()
                .ok_or_else(|| ContractError::MissingImplementation {
                    machine: self.identity.clone(),
                })?;

        let inputs = self
            .inputs
            .iter()
            .map(|(name, spec)| build_input(name, spec, &self.config))
            .collect::<Result<Vec<_>, _>>()?;

        let mut success = ExitDef {
            name: "success".to_string(),
            kind: ExitKind::Success,
            shape: ExitShape::Void,
            description: None,
        };
        let mut error = ExitDef {
            name: "error".to_string(),
            kind: ExitKind::Error,
            shape: ExitShape::Void,
            description: Some("Unexpected error occurred.".to_string()),
        };
        let mut declared: Vec<ExitDef> = Vec::new();

        let mut named: Vec<(&str, &ExitSpec)> = Vec::new();
        for (name, spec) in &self.exits {
            if name == "error" {
                if !matches!(spec.shape, ExitSpecShape::Void) {
                    return Err(ContractError::ErrorExitExemplar);
                }
                if spec.description.is_some() {
                    error.description = spec.description.clone();
                }
            } else {
                named.push((name.as_str(), spec));
            }
        }

        // Concrete shapes first, so `like` / `itemOf` see every exit regardless of order.
        let pending = named
            .iter()
            .map(|(name, spec)| pending_shape(name, &spec.shape).map(|shape| (*name, shape)))
            .collect::<Result<Vec<_>, _>>()?;

        for ((name, spec), (_, shape)) in named.iter().zip(&pending) {
            let shape = match shape {
                PendingShape::Ready(shape) => shape.clone(),
                PendingShape::Refers { target, item_of } => {
                    referenced_shape(name, target, *item_of, &inputs, &pending)?
                }
            };
            if *name == "success" {
                success.shape = shape;
                success.description = spec.description.clone();
            } else {
                declared.push(ExitDef {
                    name: name.to_string(),
                    kind: ExitKind::Declared(ExitId(declared.len())),
                    shape,
                    description: spec.description.clone(),
                });
            }
        }

        // Lambda contracts are checked by building the nested definition they describe.
        for input in inputs.iter().filter(|input| input.contract().is_some()) {
            lambda::nested_builder(&self.identity, self.sync, input, &inputs, &self.config)?
                .implementation(|_, exits, _| {
                    exits.success(Value::Undefined);
                    Ok(())
                })
                .build()?;
        }

        Ok(Machine(Arc::new(Definition {
            identity: self.identity,
            description: self.description,
            sync: self.sync,
            inputs,
            success,
            error,
            declared,
            implementation,
            config: self.config,
        })))
    }
}

fn build_input(name: &str, spec: &InputSpec, config: &EngineConfig) -> Result<InputDef, ContractError> {
    let path = HopPath::root().key(name);
    let (mut exemplar, source, generator) = match &spec.source {
        InputSpecSource::Example(example) => {
            (Exemplar::infer_at(example, &path)?, InputSource::Example, None)
        }
        InputSpecSource::Exemplar(exemplar) => (exemplar.clone(), InputSource::Example, None),
        InputSpecSource::Typeclass(typeclass) => (typeclass.desugar(), InputSource::Typeclass, None),
        InputSpecSource::Validator => (Exemplar::Passthrough, InputSource::Validator, None),
        InputSpecSource::Generator(generator) => (
            Exemplar::Wildcard,
            InputSource::Generator,
            Some(Arc::clone(generator)),
        ),
        InputSpecSource::Derived(exemplar) => (exemplar.clone(), InputSource::Derived, None),
        InputSpecSource::Unspecified => {
            return Err(ContractError::MissingExemplar {
                input: name.to_string(),
            })
        }
    };

    if let Some(contract) = &spec.contract {
        if !exemplar.is_lambda() {
            return Err(ContractError::ContractOnNonLambda {
                input: name.to_string(),
                found: exemplar.to_string(),
            });
        }
        exemplar = Exemplar::lambda(contract.clone());
    }

    let default = match &spec.default {
        Some(value) => Some(
            coerce_at(value.clone(), &exemplar, &config.input_coercion(), &path).map_err(
                |report| ContractError::InvalidDefault {
                    input: name.to_string(),
                    report,
                },
            )?,
        ),
        None => None,
    };

    Ok(InputDef {
        name: name.to_string(),
        exemplar,
        source,
        required: spec.required,
        default,
        description: spec.description.clone(),
        validator: spec.validator.clone(),
        generator,
    })
}

enum PendingShape<'a> {
    Ready(ExitShape),
    Refers { target: &'a str, item_of: bool },
}

fn pending_shape<'a>(name: &str, shape: &'a ExitSpecShape) -> Result<PendingShape<'a>, ContractError> {
    Ok(match shape {
        ExitSpecShape::Example(example) => PendingShape::Ready(ExitShape::Static(
            Exemplar::infer_at(example, &HopPath::root().key(name))?,
        )),
        ExitSpecShape::Exemplar(exemplar) => PendingShape::Ready(ExitShape::Static(exemplar.clone())),
        ExitSpecShape::Generator(generator) => {
            PendingShape::Ready(ExitShape::Generator(Arc::clone(generator)))
        }
        ExitSpecShape::Void => PendingShape::Ready(ExitShape::Void),
        ExitSpecShape::Like(target) => PendingShape::Refers {
            target,
            item_of: false,
        },
        ExitSpecShape::ItemOf(target) => PendingShape::Refers {
            target,
            item_of: true,
        },
    })
}

/// Resolve a `like` / `itemOf` exit. Inputs shadow exits of the same name.
fn referenced_shape(
    name: &str,
    target: &str,
    item_of: bool,
    inputs: &[InputDef],
    exits: &[(&str, PendingShape<'_>)],
) -> Result<ExitShape, ContractError> {
    let field = format!("exit {name}");
    let not_array = |field: String| ContractError::InputNotArray {
        field,
        target: target.to_string(),
    };

    if let Some(input) = inputs.iter().find(|input| input.name == target) {
        if !input.has_own_exemplar() {
            return Err(ContractError::TransitiveReference {
                field,
                target: target.to_string(),
            });
        }
        if !item_of {
            return Ok(ExitShape::LikeInput {
                input: target.to_string(),
                exemplar: input.exemplar.clone(),
            });
        }
        return match input.exemplar.item_pattern() {
            Some(pattern) => Ok(ExitShape::ItemOfInput {
                input: target.to_string(),
                pattern,
            }),
            None => Err(not_array(field)),
        };
    }

    let exemplar = match exits.iter().find(|(exit, _)| *exit == target) {
        Some((_, PendingShape::Ready(ExitShape::Static(exemplar)))) => exemplar,
        Some(_) => {
            return Err(ContractError::TransitiveReference {
                field,
                target: target.to_string(),
            })
        }
        None => {
            return Err(ContractError::UnrecognizedInput {
                field,
                target: target.to_string(),
            })
        }
    };
    if !item_of {
        return Ok(ExitShape::Static(exemplar.clone()));
    }
    exemplar
        .item_pattern()
        .map(ExitShape::Static)
        .ok_or_else(|| not_array(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn noop() -> impl Fn(Inputs, Exits, Env) -> anyhow::Result<()> + Send + Sync + 'static {
        |_, exits, _| {
            exits.success(Value::Undefined);
            Ok(())
        }
    }

    #[test]
    fn test_build_indexes_exits() {
        let machine = Machine::builder("lookup")
            .input("ids", InputSpec::example(json!([7])).required())
            .exit("notFound", ExitSpec::void().description("Nothing matched"))
            .exit("first", ExitSpec::item_of("ids"))
            .exit("success", ExitSpec::example(json!({"id": 1})))
            .implementation(noop())
            .build()
            .unwrap();

        let names: Vec<&str> = machine.exits().map(ExitDef::name).collect();
        assert_eq!(names, vec!["success", "notFound", "first", "error"]);
        assert_eq!(machine.exit_kind("first"), Some(ExitKind::Declared(ExitId(1))));
        assert!(matches!(
            machine.exit("first").map(ExitDef::shape),
            Some(ExitShape::ItemOfInput { pattern: Exemplar::Primitive(_), .. })
        ));
        assert_eq!(machine.exit("notFound").and_then(ExitDef::description), Some("Nothing matched"));
        assert_eq!(machine.exit_kind("missing"), None);
    }

    #[test]
    fn test_missing_implementation() {
        let err = Machine::builder("empty").build().unwrap_err();
        assert_eq!(
            err,
            ContractError::MissingImplementation {
                machine: "empty".to_string()
            }
        );
    }

    #[test]
    fn test_input_needs_exemplar_source() {
        let err = Machine::builder("m")
            .input("x", InputSpec::unspecified())
            .implementation(noop())
            .build()
            .unwrap_err();
        assert!(matches!(err, ContractError::MissingExemplar { .. }));
    }

    #[test]
    fn test_ambiguous_input_example_reports_path() {
        let err = Machine::builder("m")
            .input("pair", InputSpec::example(json!({"xs": [1, 2]})))
            .implementation(noop())
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ContractError::AmbiguousListExample {
                path: "pair.xs".to_string(),
                len: 2
            }
        );
    }

    #[test]
    fn test_like_and_item_of_references_are_checked() {
        let unknown = Machine::builder("m")
            .exit("same", ExitSpec::like("nope"))
            .implementation(noop())
            .build()
            .unwrap_err();
        assert_eq!(unknown.code(), "UNRECOGNIZED_INPUT");

        let not_array = Machine::builder("m")
            .input("name", InputSpec::example("x"))
            .exit("each", ExitSpec::item_of("name"))
            .implementation(noop())
            .build()
            .unwrap_err();
        assert_eq!(not_array.code(), "INPUT_NOT_ARRAY");

        let transitive = Machine::builder("m")
            .input("name", InputSpec::example("x"))
            .exit("echo", ExitSpec::like("name"))
            .exit("again", ExitSpec::like("echo"))
            .implementation(noop())
            .build()
            .unwrap_err();
        assert_eq!(transitive.code(), "E_TRANSITIVE_REFERENCE");
    }

    #[test]
    fn test_like_exit_reuses_static_sibling() {
        let machine = Machine::builder("m")
            .exit("found", ExitSpec::example(json!([{"id": 1}])))
            .exit("one", ExitSpec::item_of("found"))
            .implementation(noop())
            .build()
            .unwrap();
        let shape = machine.exit("one").map(ExitDef::shape);
        assert!(matches!(shape, Some(ExitShape::Static(Exemplar::Dictionary(_)))));
    }

    #[test]
    fn test_defaults_are_coerced_at_build() {
        let machine = Machine::builder("m")
            .input("limit", InputSpec::example(10).default_value("25"))
            .implementation(noop())
            .build()
            .unwrap();
        assert_eq!(machine.input("limit").and_then(InputDef::default), Some(&Value::Number(25.0)));

        let err = Machine::builder("m")
            .input("limit", InputSpec::example(10).default_value("lots"))
            .implementation(noop())
            .build()
            .unwrap_err();
        assert!(matches!(err, ContractError::InvalidDefault { ref input, .. } if input == "limit"));
    }

    #[test]
    fn test_error_exit_cannot_carry_exemplar() {
        let err = Machine::builder("m")
            .exit("error", ExitSpec::example("x"))
            .implementation(noop())
            .build()
            .unwrap_err();
        assert_eq!(err, ContractError::ErrorExitExemplar);
    }

    #[test]
    fn test_contract_requires_lambda_input() {
        let err = Machine::builder("m")
            .input("cb", InputSpec::example("x").contract(LambdaContract::new()))
            .implementation(noop())
            .build()
            .unwrap_err();
        assert!(matches!(err, ContractError::ContractOnNonLambda { .. }));
    }

    #[test]
    fn test_typeclass_and_validator_inputs() {
        let machine = Machine::builder("m")
            .input("any", InputSpec::typeclass(Typeclass::Wildcard))
            .input("raw", InputSpec::validator(|_| Ok(())))
            .implementation(noop())
            .build()
            .unwrap();
        assert_eq!(machine.input("any").map(InputDef::exemplar), Some(&Exemplar::Wildcard));
        assert_eq!(machine.input("raw").map(InputDef::source), Some(InputSource::Validator));
        assert_eq!(machine.input("raw").map(InputDef::exemplar), Some(&Exemplar::Passthrough));
    }

    #[test]
    fn test_exit_references_ignore_declaration_order() {
        let machine = Machine::builder("m")
            .exit("all", ExitSpec::like("found"))
            .exit("one", ExitSpec::item_of("found"))
            .exit("found", ExitSpec::example(json!([1])))
            .implementation(noop())
            .build()
            .unwrap();
        assert!(matches!(
            machine.exit("all").map(ExitDef::shape),
            Some(ExitShape::Static(Exemplar::List(Some(_))))
        ));
        assert_eq!(
            machine.exit("one").map(|exit| exit.shape().static_exemplar()),
            Some(Some(&Exemplar::number()))
        );
    }

    #[test]
    fn test_like_success_declared_before_success() {
        let machine = Machine::builder("m")
            .exit("other", ExitSpec::like("success"))
            .exit("success", ExitSpec::example(1))
            .implementation(noop())
            .build()
            .unwrap();
        assert!(matches!(
            machine.exit("other").map(ExitDef::shape),
            Some(ExitShape::Static(Exemplar::Primitive(_)))
        ));
        assert!(matches!(
            machine.exit("success").map(ExitDef::shape),
            Some(ExitShape::Static(Exemplar::Primitive(_)))
        ));
    }

    #[test]
    fn test_exit_cannot_borrow_generated_input() {
        let err = Machine::builder("m")
            .input("xs", InputSpec::example_fn(|_| Value::from(json!([1]))))
            .exit("first", ExitSpec::item_of("xs"))
            .implementation(noop())
            .build()
            .unwrap_err();
        assert_eq!(err.code(), "E_TRANSITIVE_REFERENCE");
    }

    #[test]
    fn test_reference_error_names_the_exit() {
        let err = Machine::builder("m")
            .exit("all", ExitSpec::like("nope"))
            .implementation(noop())
            .build()
            .unwrap_err();
        assert_eq!(err.to_string(), "`exit all` refers to `nope`, which is not declared");
    }
}
