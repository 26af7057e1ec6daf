//! Fault taxonomy and the codes surfaced at the engine boundary.
//!
//! ```text
//! Usage        → thrown at the misusing call        (E_USAGE, E_NO_ERROR_CALLBACK_CONFIGURED, ...)
//! Validation   → delivered through the `error` exit (E_MACHINE_RUNTIME_VALIDATION)
//! Runtime      → delivered through the chosen exit  (E_MACHINE_RUNTIME, E_EXIT)
//! Consistency  → always thrown                      (E_MACHINE_INCONSISTENT, E_MAX_RECURSION)
//! ```
//!
//! Build-time contract problems are `ContractError`s; they are usage faults
//! once they cross into a `MachineError`.

use crate::coerce::ValidationReport;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// How a fault propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Usage,
    Validation,
    Runtime,
    Consistency,
}

// ---------------------------------------------------------------------------
// ContractError: build-time
// ---------------------------------------------------------------------------

/// A definition whose declared contract cannot be built.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContractError {
    #[error("machine `{machine}` has no implementation")]
    MissingImplementation { machine: String },

    #[error("input `{input}` declares no example, typeclass, validator or example generator")]
    MissingExemplar { input: String },

    #[error("example at `{path}` is a list of {len} items; list examples hold at most one pattern item")]
    AmbiguousListExample { path: String, len: usize },

    #[error("example at `{path}` is {found}; no exemplar can be inferred from it")]
    UninferableExample { path: String, found: &'static str },

    #[error("`{field}` refers to `{target}`, which is not declared")]
    UnrecognizedInput { field: String, target: String },

    #[error("`{field}` takes itemOf `{target}`, but `{target}` is not list-typed")]
    InputNotArray { field: String, target: String },

    #[error("`{field}` refers to `{target}`, which has no concrete exemplar of its own")]
    TransitiveReference { field: String, target: String },

    #[error("cannot intersect {left} with {right}")]
    IncompatibleIntersection { left: String, right: String },

    #[error("input `{input}` declares a lambda contract but its exemplar is {found}")]
    ContractOnNonLambda { input: String, found: String },

    #[error("default for input `{input}` does not match its exemplar: {report}")]
    InvalidDefault {
        input: String,
        report: ValidationReport,
    },

    #[error("the `error` exit cannot declare an exemplar")]
    ErrorExitExemplar,
}

impl ContractError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnrecognizedInput { .. } => "UNRECOGNIZED_INPUT",
            Self::InputNotArray { .. } => "INPUT_NOT_ARRAY",
            Self::TransitiveReference { .. } => "E_TRANSITIVE_REFERENCE",
            Self::IncompatibleIntersection { .. } => "E_INCOMPATIBLE_EXEMPLARS",
            Self::AmbiguousListExample { .. } | Self::UninferableExample { .. } => {
                "E_INVALID_EXAMPLE"
            }
            Self::MissingImplementation { .. }
            | Self::MissingExemplar { .. }
            | Self::ContractOnNonLambda { .. }
            | Self::InvalidDefault { .. }
            | Self::ErrorExitExemplar => "E_INVALID_DEFINITION",
        }
    }
}

// ---------------------------------------------------------------------------
// MachineError: everything surfaced at the execution boundary
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("{message}")]
    Usage { message: String },

    #[error("`{name}` is not a declared input of machine `{machine}`")]
    UnknownInput { machine: String, name: String },

    #[error("`{exit}` is not a declared exit of machine `{machine}`")]
    UnknownExit { machine: String, exit: String },

    #[error("no machine named `{identity}` could be resolved")]
    UnresolvedMachine { identity: String },

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error("invalid argins for machine `{machine}` (instance {instance}): {report}")]
    RuntimeValidation {
        machine: String,
        instance: Uuid,
        report: ValidationReport,
    },

    #[error("payload for exit `{exit}` of machine `{machine}` does not match its exemplar: {report}")]
    ExitValidation {
        machine: String,
        exit: String,
        report: ValidationReport,
    },

    #[error("machine `{machine}` is inconsistent: {message}")]
    Inconsistent { machine: String, message: String },

    #[error("machine `{machine}` was executed without an `error` continuation")]
    NoErrorCallback { machine: String },

    #[error("instantiating `{machine}` at depth {depth} exceeds the recursion ceiling of {ceiling}")]
    MaxRecursion {
        machine: String,
        depth: usize,
        ceiling: usize,
    },

    #[error("machine `{machine}` exited through `{exit}`{}", describe(.description))]
    Exit {
        machine: String,
        exit: String,
        description: Option<String>,
        payload: Value,
    },

    #[error("machine `{machine}` failed: {source}")]
    Runtime {
        machine: String,
        #[source]
        source: anyhow::Error,
    },
}

fn describe(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(" ({d})"))
        .unwrap_or_default()
}

impl MachineError {
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    /// The boundary code for this fault.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Usage { .. }
            | Self::UnknownInput { .. }
            | Self::UnknownExit { .. }
            | Self::UnresolvedMachine { .. } => "E_USAGE",
            Self::Contract(inner) => inner.code(),
            Self::RuntimeValidation { .. } => "E_MACHINE_RUNTIME_VALIDATION",
            Self::ExitValidation { .. } => "E_EXIT_VALIDATION",
            Self::Inconsistent { .. } => "E_MACHINE_INCONSISTENT",
            Self::NoErrorCallback { .. } => "E_NO_ERROR_CALLBACK_CONFIGURED",
            Self::MaxRecursion { .. } => "E_MAX_RECURSION",
            Self::Exit { .. } => "E_EXIT",
            Self::Runtime { .. } => "E_MACHINE_RUNTIME",
        }
    }

    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Usage { .. }
            | Self::UnknownInput { .. }
            | Self::UnknownExit { .. }
            | Self::UnresolvedMachine { .. }
            | Self::Contract(_)
            | Self::NoErrorCallback { .. } => FaultKind::Usage,
            Self::RuntimeValidation { .. } | Self::ExitValidation { .. } => FaultKind::Validation,
            Self::Exit { .. } | Self::Runtime { .. } => FaultKind::Runtime,
            Self::Inconsistent { .. } | Self::MaxRecursion { .. } => FaultKind::Consistency,
        }
    }

    /// The structured sub-errors of a validation fault.
    pub fn report(&self) -> Option<&ValidationReport> {
        match self {
            Self::RuntimeValidation { report, .. } | Self::ExitValidation { report, .. } => {
                Some(report)
            }
            Self::Contract(ContractError::InvalidDefault { report, .. }) => Some(report),
            _ => None,
        }
    }

    /// Name of the exit a non-success outcome came through.
    pub fn exit(&self) -> Option<&str> {
        match self {
            Self::Exit { exit, .. } => Some(exit.as_str()),
            _ => None,
        }
    }
}
