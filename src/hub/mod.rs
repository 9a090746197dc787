//! The hub dispatch core (§4.5): agent registry, command log, and the
//! per-connection session workers that tie them to the wire protocol.

pub mod commandlog;
pub mod registry;
pub mod server;
pub mod session_worker;

pub use commandlog::{CommandLog, CommandRecord};
pub use registry::{AgentRecord, AgentRegistry, RegistryError};

use crate::crypto::TrustRoot;

/// Shared hub state handed to every session worker and periodic GC task.
#[derive(Default)]
pub struct Hub {
    pub registry: AgentRegistry,
    pub commands: CommandLog,
    /// Pinned public keys the hub accepts signed operator requests from
    /// (§4.3).
    pub operator_trust: TrustRoot,
}

impl Hub {
    pub fn new(operator_trust: TrustRoot) -> Self {
        Self {
            registry: AgentRegistry::new(),
            commands: CommandLog::new(),
            operator_trust,
        }
    }
}
