//! The command retention log (§3 "Command record", §4.5).

use std::collections::{HashMap, HashSet};

use rand::RngCore;
use tokio::sync::RwLock;

use crate::frame::Packet;
use crate::vm::BuiltProgram;

/// A live command awaiting fetch (§3 "Command record").
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub id: u64,
    pub program: BuiltProgram,
    pub issued_on: i64,
    pub expires_on: i64,
    pub payload: Packet,
    pub max_targets: i32,
}

/// Append-only list of live `ProxyRequest` records, guarded by a
/// readers-writer lock (§4.5), plus the per-command set of agents already
/// delivered to — `MaxTargets` (§4.5 "Fan-out sizing") is a cap on total
/// recipients across every fetch a command is ever scanned by, not a
/// per-poll limit, so it has to be tracked alongside the log entry.
#[derive(Default)]
pub struct CommandLog {
    entries: RwLock<Vec<CommandRecord>>,
    delivered: RwLock<HashMap<u64, HashSet<u64>>>,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record, assigning it a fresh random id.
    pub async fn insert(&self, mut record: CommandRecord) -> u64 {
        record.id = rand::thread_rng().next_u64();
        let id = record.id;
        self.entries.write().await.push(record);
        id
    }

    /// True iff `agent_id` may still receive `command_id` under its
    /// `max_targets` cap, given everyone it has already gone to (§4.5
    /// "Fan-out sizing"). Does not itself record the delivery.
    pub async fn may_deliver(&self, command_id: u64, max_targets: i32, agent_id: u64) -> bool {
        let delivered = self.delivered.read().await;
        let set = match delivered.get(&command_id) {
            Some(set) => set,
            None => return true,
        };
        if set.contains(&agent_id) {
            return false; // already delivered to this agent once
        }
        if max_targets <= 0 {
            true // broadcast: unlimited recipients
        } else {
            (set.len() as i32) < max_targets
        }
    }

    /// Records that `command_id` was delivered to `agent_id`.
    pub async fn record_delivery(&self, command_id: u64, agent_id: u64) {
        self.delivered
            .write()
            .await
            .entry(command_id)
            .or_default()
            .insert(agent_id);
    }

    /// Agents already on record as having received `command_id` (used to
    /// report `ProxyReply.relayed_to`).
    pub async fn delivered_to(&self, command_id: u64) -> Vec<u64> {
        self.delivered
            .read()
            .await
            .get(&command_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Scans for candidates whose `issued_on` falls in `[from, to]`.
    /// Non-positive bounds default per §4.5: `from <= 0` becomes `0`,
    /// `to <= 0` becomes `now`.
    pub async fn scan_candidates(&self, from: i64, to: i64, now: i64) -> Vec<CommandRecord> {
        let from = if from <= 0 { 0 } else { from };
        let to = if to <= 0 { now } else { to };
        self.entries
            .read()
            .await
            .iter()
            .filter(|r| r.issued_on >= from && r.issued_on <= to)
            .cloned()
            .collect()
    }

    /// Removes every entry with `expires_on <= now` in a single retaining
    /// pass (§9 "a single pass that retains live entries into a fresh
    /// vector"). Returns how many were removed.
    pub async fn gc(&self, now: i64) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let mut expired = Vec::new();
        entries.retain(|r| {
            let alive = r.expires_on > now;
            if !alive {
                expired.push(r.id);
            }
            alive
        });
        let removed = before - entries.len();
        drop(entries);
        if !expired.is_empty() {
            let mut delivered = self.delivered.write().await;
            for id in expired {
                delivered.remove(&id);
            }
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::compile;

    fn record(issued_on: i64, expires_on: i64) -> CommandRecord {
        CommandRecord {
            id: 0,
            program: compile("true").unwrap(),
            issued_on,
            expires_on,
            payload: Packet::unsigned(b"x".to_vec()),
            max_targets: 0,
        }
    }

    #[tokio::test]
    async fn scan_filters_by_issued_on_range() {
        let log = CommandLog::new();
        log.insert(record(10, 1000)).await;
        log.insert(record(500, 1000)).await;

        let hits = log.scan_candidates(0, 100, 1).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].issued_on, 10);
    }

    #[tokio::test]
    async fn non_positive_bounds_default_to_zero_and_now() {
        let log = CommandLog::new();
        log.insert(record(0, 1000)).await;
        log.insert(record(50, 1000)).await;

        let hits = log.scan_candidates(-5, 0, 50).await;
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn gc_removes_expired_entries_in_one_pass() {
        let log = CommandLog::new();
        log.insert(record(0, 10)).await;
        log.insert(record(0, 1000)).await;

        let removed = log.gc(500).await;
        assert_eq!(removed, 1);
        assert_eq!(log.len().await, 1);
    }

    #[tokio::test]
    async fn anycast_allows_exactly_one_recipient() {
        let log = CommandLog::new();
        let id = log.insert(record(0, 1000)).await;

        assert!(log.may_deliver(id, 1, 11).await);
        log.record_delivery(id, 11).await;
        assert!(!log.may_deliver(id, 1, 22).await);
        assert!(!log.may_deliver(id, 1, 11).await); // already delivered, no redelivery
    }

    #[tokio::test]
    async fn capped_fan_out_stops_at_max_targets() {
        let log = CommandLog::new();
        let id = log.insert(record(0, 1000)).await;

        for agent in [1, 2] {
            assert!(log.may_deliver(id, 2, agent).await);
            log.record_delivery(id, agent).await;
        }
        assert!(!log.may_deliver(id, 2, 3).await);
    }

    #[tokio::test]
    async fn broadcast_has_no_cap() {
        let log = CommandLog::new();
        let id = log.insert(record(0, 1000)).await;
        for agent in 0..100 {
            assert!(log.may_deliver(id, 0, agent).await);
            log.record_delivery(id, agent).await;
        }
        assert_eq!(log.delivered_to(id).await.len(), 100);
    }
}
