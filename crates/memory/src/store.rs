//! The session store — turns, scratch variables, and the in-progress
//! marker, persisted through any `SessionStorage`.
//!
//! Every mutation is read-modify-write of the whole record under a
//! per-session lock and returns only after the storage write completes.

use chrono::Utc;
use cortex_core::error::MemoryError;
use cortex_core::session::InProgressTurn;
use cortex_core::{SessionState, SessionStorage, Turn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::record;

#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<dyn SessionStorage>,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        Self {
            storage,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.storage.name()
    }

    async fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the map entry for `session_id` when no other caller holds it.
    async fn release_lock(&self, session_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        let unshared = locks
            .get(session_id)
            .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(&lock) == 2);
        if unshared {
            locks.remove(session_id);
        }
    }

    async fn read_state(&self, session_id: &str) -> Result<SessionState, MemoryError> {
        match self.storage.read(session_id).await? {
            Some(raw) => record::decode(session_id, &raw),
            None => Ok(SessionState::new(session_id)),
        }
    }

    async fn modify<T>(
        &self,
        session_id: &str,
        change: impl FnOnce(&mut SessionState) -> Result<T, MemoryError>,
    ) -> Result<T, MemoryError> {
        let lock = self.lock_for(session_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.apply(session_id, change).await
        };
        self.release_lock(session_id, lock).await;
        result
    }

    async fn apply<T>(
        &self,
        session_id: &str,
        change: impl FnOnce(&mut SessionState) -> Result<T, MemoryError>,
    ) -> Result<T, MemoryError> {
        let mut state = self.read_state(session_id).await?;
        let out = change(&mut state)?;
        self.storage
            .write(session_id, &record::encode(&state)?)
            .await?;
        Ok(out)
    }

    /// The session as PERCEIVE should see it. A turn left in progress by an
    /// earlier run is reported as abandoned and dropped from the result.
    pub async fn load(&self, session_id: &str) -> Result<SessionState, MemoryError> {
        let mut state = self.read_state(session_id).await?;
        if let Some(abandoned) = state.in_progress.take() {
            warn!(
                session = %session_id,
                stimulus = %abandoned.stimulus_id,
                started_at = %abandoned.started_at,
                "Abandoning turn left in progress"
            );
        }
        Ok(state)
    }

    /// Persist the in-progress marker for a turn that is starting.
    pub async fn begin_turn(&self, session_id: &str, stimulus_id: &str) -> Result<(), MemoryError> {
        self.modify(session_id, |state| {
            state.in_progress = Some(InProgressTurn {
                stimulus_id: stimulus_id.to_string(),
                started_at: Utc::now(),
            });
            Ok(())
        })
        .await
    }

    /// Append a finished turn. Its index must equal the current turn count;
    /// committed turns are never rewritten.
    pub async fn append_turn(&self, session_id: &str, turn: Turn) -> Result<(), MemoryError> {
        let index = turn.index;
        self.modify(session_id, move |state| {
            let expected = state.next_turn_index();
            if turn.index != expected {
                return Err(MemoryError::TurnOutOfOrder {
                    session_id: state.session_id.clone(),
                    expected,
                    got: turn.index,
                });
            }
            state.turns.push(turn);
            state.in_progress = None;
            Ok(())
        })
        .await?;
        debug!(session = %session_id, turn = index, "Turn committed");
        Ok(())
    }

    pub async fn get_scratch(&self, session_id: &str, key: &str) -> Result<Option<Value>, MemoryError> {
        Ok(self.read_state(session_id).await?.scratch.get(key).cloned())
    }

    /// Overwrite one scratch variable.
    pub async fn set_scratch(&self, session_id: &str, key: &str, value: Value) -> Result<(), MemoryError> {
        self.modify(session_id, |state| {
            state.scratch.insert(key.to_string(), value);
            Ok(())
        })
        .await
    }

    /// Whether a turn for this stimulus has been committed.
    pub async fn has_stimulus(&self, session_id: &str, stimulus_id: &str) -> Result<bool, MemoryError> {
        Ok(self.read_state(session_id).await?.has_stimulus(stimulus_id))
    }

    /// Every stored session id, sorted.
    pub async fn list_sessions(&self) -> Result<Vec<String>, MemoryError> {
        let mut ids = self.storage.list().await?;
        ids.sort();
        Ok(ids)
    }
}
