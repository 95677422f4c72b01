//! Per-user two-phase lock.
//!
//! One named lock per user serializes rebuilds. The holder acquires in
//! `DOING`, performs every row mutation, then compare-and-swaps the value
//! to `COMMITTING` right before committing the enclosing transaction. A
//! failed swap means the TTL expired and another holder may have taken
//! over: the worker must abort and roll back. Readers treat `DOING` as
//! "admin is modifying" and `COMMITTING` as "commit imminent, wait".

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::model::UserId;

/// Lock stage, encoded as the first segment of the lock value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Row mutations in progress.
    Doing,
    /// Mutations done, commit imminent.
    Committing,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Doing => "DOING",
            Stage::Committing => "COMMITTING",
        }
    }

    fn from_value(value: &str) -> Option<Stage> {
        match value.split(':').next() {
            Some("DOING") => Some(Stage::Doing),
            Some("COMMITTING") => Some(Stage::Committing),
            _ => None,
        }
    }
}

/// The lock key for a user's mapping-tree rebuild.
pub fn user_lock_key(user: UserId) -> String {
    format!("update_mapping_node_task:{user}")
}

/// A fresh holder value: `<stage>:<rand>:thread:<name>:<id>:<timestamp>`.
/// Unique per acquisition so a stale holder can never release or promote a
/// successor's lock.
pub fn generate_value(stage: Stage) -> String {
    let thread = std::thread::current();
    format!(
        "{}:{}:thread:{}:{:?}:{}",
        stage.as_str(),
        Uuid::new_v4(),
        thread.name().unwrap_or("unnamed"),
        thread.id(),
        OffsetDateTime::now_utc().unix_timestamp(),
    )
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: OffsetDateTime,
}

/// Process-wide named lock namespace.
#[derive(Debug, Default)]
pub struct LockService {
    entries: Mutex<HashMap<String, Entry>>,
}

impl LockService {
    /// An empty lock namespace.
    pub fn new() -> Self {
        LockService::default()
    }

    /// Take the lock iff nobody live holds it. Sets the TTL.
    pub fn acquire(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.lock_entries();
        purge_expired(&mut entries, key, now);
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: now + ttl,
            },
        );
        true
    }

    /// Compare-and-set the lock value, keeping the remaining TTL. Fails if
    /// the current value differs from `from`, including when the entry
    /// expired and someone else took over.
    pub fn change_state(&self, key: &str, from: &str, to: &str) -> bool {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.lock_entries();
        purge_expired(&mut entries, key, now);
        match entries.get_mut(key) {
            Some(entry) if entry.value == from => {
                entry.value = to.to_owned();
                true
            }
            _ => false,
        }
    }

    /// Delete the lock iff the current value matches either candidate.
    pub fn release(&self, key: &str, value_a: &str, value_b: &str) {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.lock_entries();
        purge_expired(&mut entries, key, now);
        if let Some(entry) = entries.get(key) {
            if entry.value == value_a || entry.value == value_b {
                entries.remove(key);
            }
        }
    }

    /// The stage of a live lock, if held.
    pub fn stage(&self, key: &str) -> Option<Stage> {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.lock_entries();
        purge_expired(&mut entries, key, now);
        entries.get(key).and_then(|entry| Stage::from_value(&entry.value))
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drop the entry at `key` if its TTL has passed.
fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str, now: OffsetDateTime) {
    if entries.get(key).map(|e| e.expires_at <= now).unwrap_or(false) {
        entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::seconds(60);

    #[test]
    fn second_acquire_fails_while_held() {
        let locks = LockService::new();
        let doing = generate_value(Stage::Doing);
        assert!(locks.acquire("k", &doing, TTL));
        assert!(!locks.acquire("k", &generate_value(Stage::Doing), TTL));
        assert_eq!(locks.stage("k"), Some(Stage::Doing));
    }

    #[test]
    fn change_state_swaps_only_from_the_current_value() {
        let locks = LockService::new();
        let doing = generate_value(Stage::Doing);
        let committing = generate_value(Stage::Committing);
        assert!(locks.acquire("k", &doing, TTL));

        assert!(!locks.change_state("k", "someone-else", &committing));
        assert!(locks.change_state("k", &doing, &committing));
        assert_eq!(locks.stage("k"), Some(Stage::Committing));
    }

    #[test]
    fn release_accepts_either_phase_value() {
        let locks = LockService::new();
        let doing = generate_value(Stage::Doing);
        let committing = generate_value(Stage::Committing);

        assert!(locks.acquire("k", &doing, TTL));
        locks.release("k", &committing, &doing);
        assert_eq!(locks.stage("k"), None);

        assert!(locks.acquire("k", &doing, TTL));
        assert!(locks.change_state("k", &doing, &committing));
        locks.release("k", &committing, &doing);
        assert_eq!(locks.stage("k"), None);
    }

    #[test]
    fn release_with_foreign_values_is_a_no_op() {
        let locks = LockService::new();
        let doing = generate_value(Stage::Doing);
        assert!(locks.acquire("k", &doing, TTL));
        locks.release("k", "foreign-a", "foreign-b");
        assert_eq!(locks.stage("k"), Some(Stage::Doing));
    }

    #[test]
    fn expiry_frees_the_lock_and_fails_the_swap() {
        let locks = LockService::new();
        let doing = generate_value(Stage::Doing);
        assert!(locks.acquire("k", &doing, Duration::milliseconds(5)));
        std::thread::sleep(std::time::Duration::from_millis(20));

        // TTL passed: a new holder wins and the old CAS fails.
        let usurper = generate_value(Stage::Doing);
        assert!(locks.acquire("k", &usurper, TTL));
        assert!(!locks.change_state("k", &doing, &generate_value(Stage::Committing)));
    }

    #[test]
    fn values_carry_the_stage_prefix() {
        assert!(generate_value(Stage::Doing).starts_with("DOING:"));
        assert!(generate_value(Stage::Committing).starts_with("COMMITTING:"));
    }
}
