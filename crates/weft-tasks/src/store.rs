//! Task records in the bus KV namespace.
//!
//! Layout: the record itself at `task:<id>`, the ownership claim at
//! `task:<id>:claim` (SETNX with TTL), and a per-user id index at
//! `task:by_user:<user_id>` for the task-listing skill.
//!
//! Terminal records get a 2 h TTL and are removed by the KV expiry sweep.

use std::sync::Arc;

use tracing::{debug, warn};

use weft_bus::Kv;
use weft_core::config::{CLAIM_TTL_SECS, TASK_TTL_SECS};
use weft_core::types::{Role, TaskId, UserId};
use weft_core::{Result, WeftError};

use crate::types::{Task, TaskStatus, WindowEntry, TASK_SCHEMA_VERSION};

/// CAS rounds before a conditional update is reported as lost. Only the
/// claim owner writes a task, so contention here means a logic bug upstream.
const MAX_CAS_ROUNDS: usize = 3;

pub struct TaskStore {
    kv: Arc<Kv>,
}

impl TaskStore {
    pub fn new(kv: Arc<Kv>) -> Self {
        Self { kv }
    }

    fn record_key(id: &TaskId) -> String {
        format!("task:{id}")
    }

    fn claim_key(id: &TaskId) -> String {
        format!("task:{id}:claim")
    }

    fn index_key(user_id: &UserId) -> String {
        format!("task:by_user:{user_id}")
    }

    /// Atomically create a new record. Rejects id collisions.
    pub fn create(&self, task: &Task) -> Result<TaskId> {
        let raw = serde_json::to_string(task)?;
        if !self.kv.insert(&Self::record_key(&task.id), &raw)? {
            return Err(WeftError::Internal(format!(
                "task id collision: {}",
                task.id
            )));
        }
        self.index_add(&task.user_id, &task.id)?;
        debug!(task_id = %task.id, user_id = %task.user_id, "task created");
        Ok(task.id.clone())
    }

    /// Claim ownership for `worker_id`. SETNX semantics: exactly one worker
    /// wins; the claim lapses after `ttl_secs` unless refreshed.
    pub fn claim(&self, id: &TaskId, worker_id: &str, ttl_secs: u64) -> Result<bool> {
        self.kv.set_nx(&Self::claim_key(id), worker_id, ttl_secs)
    }

    /// Convenience claim with the default TTL.
    pub fn claim_default(&self, id: &TaskId, worker_id: &str) -> Result<bool> {
        self.claim(id, worker_id, CLAIM_TTL_SECS)
    }

    /// Extend the claim TTL. Returns false when the claim was lost (another
    /// worker reclaimed after expiry) — the caller must stop mutating.
    pub fn refresh_claim(&self, id: &TaskId, worker_id: &str) -> Result<bool> {
        self.kv
            .refresh_ttl(&Self::claim_key(id), worker_id, CLAIM_TTL_SECS)
    }

    /// Drop the claim if still held by `worker_id`.
    pub fn release_claim(&self, id: &TaskId, worker_id: &str) -> Result<bool> {
        self.kv.del_if(&Self::claim_key(id), worker_id)
    }

    /// Read a record. A schema-version mismatch reads as absent so the task
    /// is re-created from scratch on the next incoming message.
    pub fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        let Some(raw) = self.kv.get(&Self::record_key(id))? else {
            return Ok(None);
        };
        match serde_json::from_str::<Task>(&raw) {
            Ok(task) if task.v == TASK_SCHEMA_VERSION => Ok(Some(task)),
            Ok(task) => {
                warn!(task_id = %id, stored_v = task.v, "task schema mismatch, treating as unreadable");
                Ok(None)
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "unreadable task record");
                Ok(None)
            }
        }
    }

    /// Conditional status transition with an optional patch applied in the
    /// same write. Returns false when the current status differs from
    /// `from` or the record vanished.
    ///
    /// The iteration counter never decreases: a patch lowering it is clamped.
    pub fn transition<F>(
        &self,
        id: &TaskId,
        from: TaskStatus,
        to: TaskStatus,
        patch: F,
    ) -> Result<bool>
    where
        F: Fn(&mut Task),
    {
        let key = Self::record_key(id);
        for _ in 0..MAX_CAS_ROUNDS {
            let Some(old_raw) = self.kv.get(&key)? else {
                return Ok(false);
            };
            let Ok(mut task) = serde_json::from_str::<Task>(&old_raw) else {
                return Ok(false);
            };
            if task.status != from {
                return Ok(false);
            }

            let prev_iterations = task.iterations;
            patch(&mut task);
            task.iterations = task.iterations.max(prev_iterations);
            task.status = to;
            task.updated_at = chrono::Utc::now().to_rfc3339();

            let new_raw = serde_json::to_string(&task)?;
            // Terminal records pick up the 2 h TTL here; live ones stay pinned.
            let ttl = to.is_terminal().then_some(TASK_TTL_SECS);
            if self.kv.cas(&key, &old_raw, &new_raw, ttl)? {
                debug!(task_id = %id, from = %from, to = %to, "task transition");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Append a role-tagged fragment to the conversation window, truncating
    /// to the most recent `window_limit` entries.
    pub fn append_message(
        &self,
        id: &TaskId,
        role: Role,
        text: &str,
        window_limit: usize,
    ) -> Result<bool> {
        let key = Self::record_key(id);
        for _ in 0..MAX_CAS_ROUNDS {
            let Some(old_raw) = self.kv.get(&key)? else {
                return Ok(false);
            };
            let Ok(mut task) = serde_json::from_str::<Task>(&old_raw) else {
                return Ok(false);
            };

            task.window.push(WindowEntry {
                role,
                text: text.to_string(),
            });
            if task.window.len() > window_limit {
                let excess = task.window.len() - window_limit;
                task.window.drain(..excess);
            }
            task.updated_at = chrono::Utc::now().to_rfc3339();

            let new_raw = serde_json::to_string(&task)?;
            if self.kv.cas(&key, &old_raw, &new_raw, None)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Allocate the next envelope sequence number for a task. Shared by every
    /// producer touching the task (orchestrator, skill dispatcher) so the
    /// per-task sequence stays strictly increasing across processes.
    pub fn next_seq(&self, id: &TaskId) -> Result<u64> {
        let key = format!("task:{id}:seq");
        loop {
            match self.kv.get(&key)? {
                None => {
                    if self.kv.insert(&key, "1")? {
                        return Ok(1);
                    }
                }
                Some(raw) => {
                    let current: u64 = raw.parse().unwrap_or(0);
                    let next = current + 1;
                    if self.kv.cas(&key, &raw, &next.to_string(), None)? {
                        return Ok(next);
                    }
                }
            }
        }
    }

    /// Force a live task to `failed` regardless of its current non-terminal
    /// status. Terminal tasks are left untouched.
    pub fn fail(&self, id: &TaskId) -> Result<bool> {
        let key = Self::record_key(id);
        for _ in 0..MAX_CAS_ROUNDS {
            let Some(old_raw) = self.kv.get(&key)? else {
                return Ok(false);
            };
            let Ok(mut task) = serde_json::from_str::<Task>(&old_raw) else {
                return Ok(false);
            };
            if task.status.is_terminal() {
                return Ok(false);
            }
            task.status = TaskStatus::Failed;
            task.updated_at = chrono::Utc::now().to_rfc3339();
            let new_raw = serde_json::to_string(&task)?;
            if self.kv.cas(&key, &old_raw, &new_raw, Some(TASK_TTL_SECS))? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn delete(&self, id: &TaskId) -> Result<()> {
        if let Some(task) = self.get(id)? {
            self.index_remove(&task.user_id, id)?;
        }
        self.kv.del(&Self::record_key(id))?;
        self.kv.del(&Self::claim_key(id))?;
        Ok(())
    }

    /// Ids of this user's tasks, oldest first (ids are time-sortable).
    pub fn list_by_user(&self, user_id: &UserId) -> Result<Vec<TaskId>> {
        let ids: Vec<String> = self
            .kv
            .get_json(&Self::index_key(user_id))?
            .unwrap_or_default();
        Ok(ids.into_iter().map(TaskId::from).collect())
    }

    fn index_add(&self, user_id: &UserId, id: &TaskId) -> Result<()> {
        let key = Self::index_key(user_id);
        for _ in 0..MAX_CAS_ROUNDS {
            let old_raw = self.kv.get(&key)?;
            let mut ids: Vec<String> = match &old_raw {
                Some(raw) => serde_json::from_str(raw).unwrap_or_default(),
                None => Vec::new(),
            };
            if !ids.contains(&id.0) {
                ids.push(id.0.clone());
            }
            ids.sort();
            let new_raw = serde_json::to_string(&ids)?;
            let swapped = match old_raw {
                Some(old) => self.kv.cas(&key, &old, &new_raw, None)?,
                None => self.kv.insert(&key, &new_raw)?,
            };
            if swapped {
                return Ok(());
            }
        }
        Err(WeftError::Internal("user index update lost races".into()))
    }

    fn index_remove(&self, user_id: &UserId, id: &TaskId) -> Result<()> {
        let key = Self::index_key(user_id);
        for _ in 0..MAX_CAS_ROUNDS {
            let Some(old_raw) = self.kv.get(&key)? else {
                return Ok(());
            };
            let mut ids: Vec<String> = serde_json::from_str(&old_raw).unwrap_or_default();
            ids.retain(|i| i != &id.0);
            let new_raw = serde_json::to_string(&ids)?;
            if self.kv.cas(&key, &old_raw, &new_raw, None)? {
                return Ok(());
            }
        }
        Err(WeftError::Internal("user index update lost races".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::types::{ChannelTag, ChatId};

    fn store() -> TaskStore {
        TaskStore::new(Arc::new(Kv::open_in_memory().unwrap()))
    }

    fn sample_task() -> Task {
        Task::new(
            TaskId::new(),
            UserId::from("u1"),
            ChannelTag::telegram(),
            ChatId::from("1"),
            "m1".to_string(),
        )
    }

    #[test]
    fn create_and_get_round_trip() {
        let store = store();
        let task = sample_task();
        store.create(&task).unwrap();
        let loaded = store.get(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.user_id, task.user_id);
    }

    #[test]
    fn create_rejects_id_collision() {
        let store = store();
        let task = sample_task();
        store.create(&task).unwrap();
        assert!(store.create(&task).is_err());
    }

    #[test]
    fn claim_is_mutually_exclusive() {
        let store = store();
        let task = sample_task();
        store.create(&task).unwrap();
        assert!(store.claim(&task.id, "w1", 60).unwrap());
        assert!(!store.claim(&task.id, "w2", 60).unwrap());
    }

    #[test]
    fn claim_reclaimable_after_ttl_expiry() {
        let store = store();
        let task = sample_task();
        store.create(&task).unwrap();
        assert!(store.claim(&task.id, "w1", 0).unwrap());
        assert!(store.claim(&task.id, "w2", 60).unwrap());
    }

    #[test]
    fn refresh_fails_after_claim_lost() {
        let store = store();
        let task = sample_task();
        store.create(&task).unwrap();
        assert!(store.claim(&task.id, "w1", 0).unwrap());
        assert!(store.claim(&task.id, "w2", 60).unwrap());
        assert!(!store.refresh_claim(&task.id, "w1").unwrap());
        assert!(store.refresh_claim(&task.id, "w2").unwrap());
    }

    #[test]
    fn transition_requires_matching_from_status() {
        let store = store();
        let task = sample_task();
        store.create(&task).unwrap();

        assert!(store
            .transition(&task.id, TaskStatus::Pending, TaskStatus::Running, |_| {})
            .unwrap());
        // Stale transition from pending must fail now.
        assert!(!store
            .transition(&task.id, TaskStatus::Pending, TaskStatus::Failed, |_| {})
            .unwrap());
        assert_eq!(
            store.get(&task.id).unwrap().unwrap().status,
            TaskStatus::Running
        );
    }

    #[test]
    fn iteration_counter_never_decreases() {
        let store = store();
        let task = sample_task();
        store.create(&task).unwrap();
        store
            .transition(&task.id, TaskStatus::Pending, TaskStatus::Running, |t| {
                t.iterations = 3;
            })
            .unwrap();
        store
            .transition(&task.id, TaskStatus::Running, TaskStatus::Running, |t| {
                t.iterations = 1; // clamped
            })
            .unwrap();
        assert_eq!(store.get(&task.id).unwrap().unwrap().iterations, 3);
    }

    #[test]
    fn window_truncates_to_limit() {
        let store = store();
        let task = sample_task();
        store.create(&task).unwrap();
        for i in 0..6 {
            store
                .append_message(&task.id, Role::User, &format!("m{i}"), 4)
                .unwrap();
        }
        let window = store.get(&task.id).unwrap().unwrap().window;
        assert_eq!(window.len(), 4);
        assert_eq!(window[0].text, "m2");
        assert_eq!(window[3].text, "m5");
    }

    #[test]
    fn list_by_user_tracks_create_and_delete() {
        let store = store();
        let a = sample_task();
        let b = sample_task();
        store.create(&a).unwrap();
        store.create(&b).unwrap();
        assert_eq!(store.list_by_user(&a.user_id).unwrap().len(), 2);

        store.delete(&a.id).unwrap();
        let remaining = store.list_by_user(&b.user_id).unwrap();
        assert_eq!(remaining, vec![b.id.clone()]);
    }

    #[test]
    fn next_seq_is_strictly_increasing_per_task() {
        let store = store();
        let a = sample_task();
        let b = sample_task();
        store.create(&a).unwrap();
        store.create(&b).unwrap();

        assert_eq!(store.next_seq(&a.id).unwrap(), 1);
        assert_eq!(store.next_seq(&a.id).unwrap(), 2);
        // Independent counter per task.
        assert_eq!(store.next_seq(&b.id).unwrap(), 1);
        assert_eq!(store.next_seq(&a.id).unwrap(), 3);
    }

    #[test]
    fn fail_overrides_any_live_status_but_not_terminal() {
        let store = store();
        let task = sample_task();
        store.create(&task).unwrap();
        store
            .transition(&task.id, TaskStatus::Pending, TaskStatus::AwaitingTool, |_| {})
            .unwrap();

        assert!(store.fail(&task.id).unwrap());
        assert_eq!(
            store.get(&task.id).unwrap().unwrap().status,
            TaskStatus::Failed
        );
        // A second fail is a no-op on the terminal record.
        assert!(!store.fail(&task.id).unwrap());
    }

    #[test]
    fn schema_mismatch_reads_as_absent() {
        let kv = Arc::new(Kv::open_in_memory().unwrap());
        let store = TaskStore::new(Arc::clone(&kv));
        let task = sample_task();
        let mut doc = serde_json::to_value(&task).unwrap();
        doc["v"] = serde_json::json!(99);
        kv.set(&format!("task:{}", task.id), &doc.to_string())
            .unwrap();
        assert!(store.get(&task.id).unwrap().is_none());
    }
}
