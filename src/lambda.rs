//! Lambda contracts: inputs whose value is itself a callable sub-machine.
//!
//! A lambda input declares what the parent will hand the callable
//! (`provides`, its inputs) and which exits the parent is prepared to
//! receive from it (`expects`). Fields may borrow their exemplar from one of
//! the parent's inputs with `like` / `itemOf`; the borrowed input must carry
//! a concrete exemplar of its own, so resolution is always a single hop.
//!
//! When a raw function is configured for a lambda input, the supervisor
//! builds it into a full machine named `{parent}.{input}` through
//! [`synthesize`], and that machine runs through the same engine.

use crate::config::EngineConfig;
use crate::definition::{ExitSpec, Implementation, InputDef, InputSpec, Machine, MachineBuilder};
use crate::error::ContractError;
use crate::exemplar::{Exemplar, Typeclass};
use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldShape {
    Example(Value),
    Typeclass(Typeclass),
    /// Same exemplar as the named parent input.
    Like(String),
    /// Item exemplar of the named list-typed parent input.
    ItemOf(String),
    /// A nested lambda with its own contract.
    Lambda(LambdaContract),
    Void,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContractField {
    pub shape: FieldShape,
    pub description: Option<String>,
}

impl ContractField {
    fn from_shape(shape: FieldShape) -> Self {
        Self {
            shape,
            description: None,
        }
    }

    pub fn example(example: impl Into<Value>) -> Self {
        Self::from_shape(FieldShape::Example(example.into()))
    }

    pub fn typeclass(typeclass: Typeclass) -> Self {
        Self::from_shape(FieldShape::Typeclass(typeclass))
    }

    pub fn like(target: impl Into<String>) -> Self {
        Self::from_shape(FieldShape::Like(target.into()))
    }

    pub fn item_of(target: impl Into<String>) -> Self {
        Self::from_shape(FieldShape::ItemOf(target.into()))
    }

    pub fn lambda(contract: LambdaContract) -> Self {
        Self::from_shape(FieldShape::Lambda(contract))
    }

    pub fn void() -> Self {
        Self::from_shape(FieldShape::Void)
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LambdaContract {
    /// Overrides the parent's sync flag for the synthesized machine.
    pub sync: Option<bool>,
    pub provides: BTreeMap<String, ContractField>,
    pub expects: BTreeMap<String, ContractField>,
}

impl LambdaContract {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn provides(mut self, name: impl Into<String>, field: ContractField) -> Self {
        self.provides.insert(name.into(), field);
        self
    }

    pub fn expects(mut self, name: impl Into<String>, field: ContractField) -> Self {
        self.expects.insert(name.into(), field);
        self
    }

    /// The contract of a bare `"->"` example: anything callable.
    pub fn is_empty(&self) -> bool {
        self.sync.is_none() && self.provides.is_empty() && self.expects.is_empty()
    }
}

/// Builder for the machine described by `input`'s contract, without an implementation.
pub(crate) fn nested_builder(
    parent_identity: &str,
    parent_sync: bool,
    input: &InputDef,
    parent_inputs: &[InputDef],
    config: &Arc<EngineConfig>,
) -> Result<MachineBuilder, ContractError> {
    let empty = LambdaContract::new();
    let contract = input.contract().unwrap_or(&empty);
    let mut builder = Machine::builder(format!("{parent_identity}.{}", input.name()))
        .sync(contract.sync.unwrap_or(parent_sync))
        .shared_config(Arc::clone(config));

    for (name, field) in &contract.provides {
        let label = format!("{}.provides.{name}", input.name());
        let spec = match &field.shape {
            FieldShape::Example(example) => InputSpec::example(example.clone()).required(),
            FieldShape::Typeclass(typeclass) => InputSpec::typeclass(*typeclass).required(),
            FieldShape::Like(target) => {
                InputSpec::derived(resolve_reference(&label, target, false, parent_inputs)?)
                    .required()
            }
            FieldShape::ItemOf(target) => {
                InputSpec::derived(resolve_reference(&label, target, true, parent_inputs)?)
                    .required()
            }
            FieldShape::Lambda(nested) => InputSpec::typeclass(Typeclass::Lambda)
                .contract(nested.clone())
                .required(),
            FieldShape::Void => InputSpec::exemplar(Exemplar::Passthrough),
        };
        builder = builder.input(name.as_str(), with_description(spec, field));
    }

    for (name, field) in &contract.expects {
        let label = format!("{}.expects.{name}", input.name());
        let spec = match &field.shape {
            FieldShape::Example(example) => ExitSpec::example(example.clone()),
            FieldShape::Typeclass(typeclass) => ExitSpec::exemplar(typeclass.desugar()),
            FieldShape::Like(target) => {
                ExitSpec::exemplar(resolve_reference(&label, target, false, parent_inputs)?)
            }
            FieldShape::ItemOf(target) => {
                ExitSpec::exemplar(resolve_reference(&label, target, true, parent_inputs)?)
            }
            FieldShape::Lambda(nested) => ExitSpec::exemplar(Exemplar::lambda(nested.clone())),
            FieldShape::Void => ExitSpec::void(),
        };
        builder = builder.exit(
            name.as_str(),
            match &field.description {
                Some(description) => spec.description(description.clone()),
                None => spec,
            },
        );
    }

    Ok(builder)
}

fn with_description(spec: InputSpec, field: &ContractField) -> InputSpec {
    match &field.description {
        Some(description) => spec.description(description.clone()),
        None => spec,
    }
}

fn resolve_reference(
    label: &str,
    target: &str,
    item_of: bool,
    parent_inputs: &[InputDef],
) -> Result<Exemplar, ContractError> {
    let sibling = parent_inputs
        .iter()
        .find(|input| input.name() == target)
        .ok_or_else(|| ContractError::UnrecognizedInput {
            field: label.to_string(),
            target: target.to_string(),
        })?;
    if !sibling.has_own_exemplar() {
        return Err(ContractError::TransitiveReference {
            field: label.to_string(),
            target: target.to_string(),
        });
    }
    if !item_of {
        return Ok(sibling.exemplar().clone());
    }
    sibling
        .exemplar()
        .item_pattern()
        .ok_or_else(|| ContractError::InputNotArray {
            field: label.to_string(),
            target: target.to_string(),
        })
}

/// Build the machine a function configured for `input` becomes.
pub(crate) fn synthesize(
    parent: &Machine,
    input: &InputDef,
    implementation: Implementation,
) -> Result<Machine, ContractError> {
    nested_builder(
        parent.identity(),
        parent.is_sync(),
        input,
        parent.inputs(),
        &parent.shared_config(),
    )?
    .implementation_arc(implementation)
    .build()
}

/// The derived definition a lambda input of `parent` expects, ready for an implementation.
pub fn derive_builder(parent: &Machine, input: &str) -> Result<MachineBuilder, ContractError> {
    let def = parent
        .input(input)
        .ok_or_else(|| ContractError::UnrecognizedInput {
            field: parent.identity().to_string(),
            target: input.to_string(),
        })?;
    if !def.exemplar().is_lambda() {
        return Err(ContractError::ContractOnNonLambda {
            input: input.to_string(),
            found: def.exemplar().to_string(),
        });
    }
    nested_builder(
        parent.identity(),
        parent.is_sync(),
        def,
        parent.inputs(),
        &parent.shared_config(),
    )
}
