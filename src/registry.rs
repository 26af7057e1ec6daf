//! Definition lookup by identity.
//!
//! Nested and self-referential machines are reached through an injected
//! [`Resolver`] rather than a process-wide cache. [`MachineRegistry`] is the
//! in-memory implementation.

use crate::definition::Machine;
use crate::error::MachineError;
use crate::provenance::Fault;
use crate::supervisor::LiveInstance;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Maps an identity to a machine definition.
pub trait Resolver: Send + Sync {
    fn resolve(&self, identity: &str) -> Option<Machine>;
}

impl<F> Resolver for F
where
    F: Fn(&str) -> Option<Machine> + Send + Sync,
{
    fn resolve(&self, identity: &str) -> Option<Machine> {
        self(identity)
    }
}

/// Registry of machine definitions indexed by identity
#[derive(Debug, Clone, Default)]
pub struct MachineRegistry {
    machines: HashMap<String, Machine>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a machine, returning the one it replaced
    pub fn register(&mut self, machine: Machine) -> Option<Machine> {
        let identity = machine.identity().to_string();
        debug!(machine = %identity, sync = machine.is_sync(), "registering machine");
        self.machines.insert(identity, machine)
    }

    pub fn get(&self, identity: &str) -> Option<&Machine> {
        self.machines.get(identity)
    }

    pub fn has(&self, identity: &str) -> bool {
        self.machines.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Identities in sorted order
    pub fn identities(&self) -> Vec<&str> {
        let mut identities: Vec<&str> = self.machines.keys().map(String::as_str).collect();
        identities.sort_unstable();
        identities
    }

    pub fn iter(&self) -> impl Iterator<Item = &Machine> {
        self.machines.values()
    }

    /// A fresh instance of `identity` that resolves nested machines through this registry.
    #[track_caller]
    pub fn instantiate(self: &Arc<Self>, identity: &str) -> Result<LiveInstance, Fault> {
        match self.machines.get(identity) {
            Some(machine) => Ok(machine.instance().with_resolver(Arc::clone(self))),
            None => Err(Fault::new(MachineError::UnresolvedMachine {
                identity: identity.to_string(),
            })),
        }
    }
}

impl Resolver for MachineRegistry {
    fn resolve(&self, identity: &str) -> Option<Machine> {
        self.machines.get(identity).cloned()
    }
}
