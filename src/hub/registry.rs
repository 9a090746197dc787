//! The agent registry (§3 "Agent record", §4.5, §5).

use std::collections::HashMap;

use rand::RngCore;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::facts::SystemFacts;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no agent with id {0}")]
    NotFound(u64),
}

/// An agent's state as held by the hub (§3 "Agent record").
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRecord {
    pub id: u64,
    pub address: String,
    pub facts: SystemFacts,
    /// Set when the owning session worker terminates; the periodic GC tick
    /// erases records with this flag set (§4.5).
    pub done: bool,
}

/// Map from agent identifier to agent record, guarded by a readers-writer
/// lock (§4.5, §5).
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<u64, AgentRecord>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples a random 64-bit identifier until one is unused, inserts the
    /// new record, and returns its id (§4.5 "expected O(1) while the map is
    /// sparse").
    pub async fn allocate_new(&self, address: String, facts: SystemFacts) -> u64 {
        let mut agents = self.agents.write().await;
        loop {
            let id = rand::thread_rng().next_u64();
            if let std::collections::hash_map::Entry::Vacant(entry) = agents.entry(id) {
                entry.insert(AgentRecord {
                    id,
                    address,
                    facts,
                    done: false,
                });
                return id;
            }
        }
    }

    pub async fn get(&self, id: u64) -> Option<AgentRecord> {
        self.agents.read().await.get(&id).cloned()
    }

    pub async fn list_ids(&self) -> Vec<u64> {
        self.agents.read().await.keys().copied().collect()
    }

    pub async fn snapshot(&self) -> Vec<AgentRecord> {
        self.agents.read().await.values().cloned().collect()
    }

    /// Closes the session and erases the entry immediately (§4.5
    /// `delete_by_id`). Closing the underlying stream is the caller's
    /// responsibility; this only removes the bookkeeping entry.
    pub async fn delete_by_id(&self, id: u64) -> Result<(), RegistryError> {
        self.agents
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(RegistryError::NotFound(id))
    }

    /// Marks a record "done" for the next GC tick to erase, without removing
    /// it synchronously (used when a session worker terminates and other
    /// readers may still be iterating the map).
    pub async fn mark_done(&self, id: u64) {
        if let Some(record) = self.agents.write().await.get_mut(&id) {
            record.done = true;
        }
    }

    /// Scans for "done" records and erases them (§4.5 "periodic garbage
    /// collector (5-second tick)"). Returns how many were removed.
    pub async fn gc(&self) -> usize {
        let mut agents = self.agents.write().await;
        let before = agents.len();
        agents.retain(|_, record| !record.done);
        before - agents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts() -> SystemFacts {
        SystemFacts {
            goos: "linux".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn allocate_and_lookup_round_trips() {
        let registry = AgentRegistry::new();
        let id = registry.allocate_new("1.2.3.4:1".into(), facts()).await;
        let record = registry.get(id).await.unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.facts.goos, "linux");
    }

    #[tokio::test]
    async fn gc_removes_only_done_records() {
        let registry = AgentRegistry::new();
        let live = registry.allocate_new("a".into(), facts()).await;
        let dead = registry.allocate_new("b".into(), facts()).await;
        registry.mark_done(dead).await;

        let removed = registry.gc().await;
        assert_eq!(removed, 1);
        assert!(registry.get(live).await.is_some());
        assert!(registry.get(dead).await.is_none());
    }

    #[tokio::test]
    async fn delete_by_id_removes_immediately() {
        let registry = AgentRegistry::new();
        let id = registry.allocate_new("a".into(), facts()).await;
        registry.delete_by_id(id).await.unwrap();
        assert!(registry.get(id).await.is_none());
        assert_eq!(
            registry.delete_by_id(id).await,
            Err(RegistryError::NotFound(id))
        );
    }
}
