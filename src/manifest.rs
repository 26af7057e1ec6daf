//! YAML contract manifests.
//!
//! A manifest carries the declarative half of a definition; the
//! implementation is attached when it is turned into a builder.
//!
//! ```yaml
//! identity: list-users
//! sync: true
//! inputs:
//!   ids:
//!     example: [1]
//!     required: true
//!   onEach:
//!     type: lambda
//!     contract:
//!       provides:
//!         id: { itemOf: ids }
//! exits:
//!   notFound:
//!     void: true
//!     description: No user matched
//!   first:
//!     itemOf: ids
//! ```

use crate::definition::{ExitSpec, InputSpec, Machine, MachineBuilder};
use crate::error::ContractError;
use crate::exemplar::Typeclass;
use crate::exits::Exits;
use crate::lambda::{ContractField, LambdaContract};
use crate::supervisor::{Env, Inputs};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to parse manifest: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("`{field}`: unknown type `{name}`")]
    UnknownTypeclass { field: String, name: String },

    #[error("`{field}` declares more than one of example / type / like / itemOf / void")]
    ConflictingShape { field: String },

    #[error(transparent)]
    Contract(#[from] ContractError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MachineManifest {
    pub identity: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sync: bool,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputManifest>,
    #[serde(default)]
    pub exits: BTreeMap<String, ExitManifest>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InputManifest {
    #[serde(default)]
    pub example: Option<JsonValue>,
    #[serde(default, rename = "type")]
    pub typeclass: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<JsonValue>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub contract: Option<ContractManifest>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExitManifest {
    #[serde(default)]
    pub example: Option<JsonValue>,
    #[serde(default, rename = "type")]
    pub typeclass: Option<String>,
    #[serde(default)]
    pub like: Option<String>,
    #[serde(default)]
    pub item_of: Option<String>,
    #[serde(default)]
    pub void: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContractManifest {
    #[serde(default)]
    pub sync: Option<bool>,
    #[serde(default)]
    pub provides: BTreeMap<String, FieldManifest>,
    #[serde(default)]
    pub expects: BTreeMap<String, FieldManifest>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FieldManifest {
    #[serde(default)]
    pub example: Option<JsonValue>,
    #[serde(default, rename = "type")]
    pub typeclass: Option<String>,
    #[serde(default)]
    pub like: Option<String>,
    #[serde(default)]
    pub item_of: Option<String>,
    #[serde(default)]
    pub void: bool,
    #[serde(default)]
    pub description: Option<String>,
    /// Contract of a nested lambda field (`type: lambda`).
    #[serde(default)]
    pub contract: Option<ContractManifest>,
}

impl MachineManifest {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ManifestError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// A builder carrying this contract and `implementation`.
    pub fn into_builder<F>(self, implementation: F) -> Result<MachineBuilder, ManifestError>
    where
        F: Fn(Inputs, Exits, Env) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut builder = Machine::builder(self.identity.as_str())
            .sync(self.sync)
            .implementation(implementation);
        if let Some(description) = self.description {
            builder = builder.description(description);
        }

        for (name, input) in self.inputs {
            let spec = input_spec(&name, input)?;
            builder = builder.input(name, spec);
        }
        for (name, exit) in self.exits {
            let spec = exit_spec(&name, exit)?;
            builder = builder.exit(name, spec);
        }
        Ok(builder)
    }

    pub fn build<F>(self, implementation: F) -> Result<Machine, ManifestError>
    where
        F: Fn(Inputs, Exits, Env) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Ok(self.into_builder(implementation)?.build()?)
    }
}

fn typeclass(field: &str, name: &str) -> Result<Typeclass, ManifestError> {
    Typeclass::from_name(name).ok_or_else(|| ManifestError::UnknownTypeclass {
        field: field.to_string(),
        name: name.to_string(),
    })
}

fn input_spec(name: &str, input: InputManifest) -> Result<InputSpec, ManifestError> {
    let mut spec = match (input.example, input.typeclass) {
        (Some(_), Some(_)) => {
            return Err(ManifestError::ConflictingShape {
                field: name.to_string(),
            })
        }
        (Some(example), None) => InputSpec::example(example),
        (None, Some(t)) => InputSpec::typeclass(typeclass(name, &t)?),
        (None, None) => InputSpec::unspecified(),
    };
    if input.required {
        spec = spec.required();
    }
    if let Some(default) = input.default {
        spec = spec.default_value(default);
    }
    if let Some(description) = input.description {
        spec = spec.description(description);
    }
    if let Some(contract) = input.contract {
        spec = spec.contract(lambda_contract(name, contract)?);
    }
    Ok(spec)
}

fn exit_spec(name: &str, exit: ExitManifest) -> Result<ExitSpec, ManifestError> {
    let declared = [
        exit.example.is_some(),
        exit.typeclass.is_some(),
        exit.like.is_some(),
        exit.item_of.is_some(),
        exit.void,
    ];
    if declared.iter().filter(|set| **set).count() > 1 {
        return Err(ManifestError::ConflictingShape {
            field: name.to_string(),
        });
    }

    let spec = if let Some(example) = exit.example {
        ExitSpec::example(example)
    } else if let Some(t) = exit.typeclass {
        ExitSpec::exemplar(typeclass(name, &t)?.desugar())
    } else if let Some(target) = exit.like {
        ExitSpec::like(target)
    } else if let Some(target) = exit.item_of {
        ExitSpec::item_of(target)
    } else {
        ExitSpec::void()
    };
    Ok(match exit.description {
        Some(description) => spec.description(description),
        None => spec,
    })
}

fn lambda_contract(owner: &str, contract: ContractManifest) -> Result<LambdaContract, ManifestError> {
    let mut out = LambdaContract::new();
    out.sync = contract.sync;
    for (name, field) in contract.provides {
        let label = format!("{owner}.provides.{name}");
        out = out.provides(name, contract_field(&label, field)?);
    }
    for (name, field) in contract.expects {
        let label = format!("{owner}.expects.{name}");
        out = out.expects(name, contract_field(&label, field)?);
    }
    Ok(out)
}

fn contract_field(label: &str, field: FieldManifest) -> Result<ContractField, ManifestError> {
    let declared = [
        field.example.is_some(),
        field.typeclass.is_some(),
        field.like.is_some(),
        field.item_of.is_some(),
        field.void,
    ];
    if declared.iter().filter(|set| **set).count() > 1 {
        return Err(ManifestError::ConflictingShape {
            field: label.to_string(),
        });
    }

    let out = if let Some(example) = field.example {
        ContractField::example(Value::from(example))
    } else if let Some(t) = field.typeclass {
        match (typeclass(label, &t)?, field.contract) {
            (Typeclass::Lambda, Some(nested)) => {
                ContractField::lambda(lambda_contract(label, nested)?)
            }
            (t, _) => ContractField::typeclass(t),
        }
    } else if let Some(target) = field.like {
        ContractField::like(target)
    } else if let Some(target) = field.item_of {
        ContractField::item_of(target)
    } else {
        ContractField::void()
    };
    Ok(match field.description {
        Some(description) => out.description(description),
        None => out,
    })
}
