//! Switchback - exemplar-typed machines with multi-exit control flow
//!
//! A machine declares its inputs and its possible outcomes ("exits") with
//! example values instead of hand-written schemas. Every execution coerces the
//! configured inputs against their exemplars, runs the unit of work, coerces
//! whichever exit fires and delivers it to the continuation registered for
//! that exit.
//!
//! ## Architecture
//!
//! ```text
//! exemplar ─▶ coerce / intersect        (type model, validation)
//!     │
//! definition ─▶ lambda                  (build-time contract checks, nested contracts)
//!     │
//! supervisor ─▶ exits ─▶ provenance     (execution, exit dispatch, fault origins)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use switchback::{ExitSpec, InputSpec, Machine, Value};
//! use serde_json::json;
//!
//! let parse = Machine::builder("parse-amount")
//!     .sync(true)
//!     .input("amount", InputSpec::example(123).required())
//!     .exit("negative", ExitSpec::void().description("Amount below zero"))
//!     .implementation(|inputs, exits, _env| {
//!         match inputs.number("amount") {
//!             Some(n) if n < 0.0 => exits.exit("negative", Value::Undefined),
//!             Some(n) => exits.success(n),
//!             None => exits.error(anyhow::anyhow!("amount missing")),
//!         }
//!         Ok(())
//!     })
//!     .build()?;
//!
//! let amount = parse.configure([("amount", json!("4.5"))])?.exec_sync()?;
//! assert_eq!(amount, Value::Number(4.5));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// Core error handling
pub mod error;
pub mod provenance;

// Type model
pub mod coerce;
pub mod exemplar;
pub mod intersect;
pub mod value;

// Definitions and nested contracts
pub mod definition;
pub mod lambda;

// Execution
pub mod exits;
pub mod supervisor;

// Configuration, lookup and loading
pub mod config;
pub mod manifest;
pub mod registry;

pub use coerce::{coerce, coerce_at, CoerceOptions, HopPath, ValidationIssue, ValidationReport};
pub use config::{ConfigError, EngineConfig};
pub use definition::{
    ExitDef, ExitId, ExitKind, ExitShape, ExitSpec, InputDef, InputSource, InputSpec, Machine,
    MachineBuilder,
};
pub use error::{ContractError, FaultKind, MachineError};
pub use exemplar::{Exemplar, Primitive, Typeclass};
pub use exits::{Exits, Outcome, Switchback};
pub use intersect::intersect;
pub use lambda::{derive_builder, ContractField, FieldShape, LambdaContract};
pub use manifest::{MachineManifest, ManifestError};
pub use provenance::{Fault, Omen};
pub use registry::{MachineRegistry, Resolver};
pub use supervisor::{Env, Inputs, LiveInstance};
pub use value::Value;
