//! Session storage for the identifiers a conversation needs to resume.

use std::{collections::HashMap, sync::Mutex};

use thiserror::Error;

use crate::{constants::storage_keys, model::AgentMode, workflow::WorkflowState};

/// Opaque string storage scoped to one user session.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySessionStore {
    fn values(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.values().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.values().remove(key);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session has no `{0}` entry")]
    Missing(&'static str),
    #[error("session entry `{key}` holds an invalid value `{value}`")]
    Invalid { key: &'static str, value: String },
}

/// Write every identifier of `state` to `store`.
pub fn persist(store: &dyn SessionStore, state: &WorkflowState) {
    store.set(storage_keys::CONVERSATION_ID, state.conversation_id.clone());
    store.set(storage_keys::WORKFLOW_RUN_ID, state.workflow_run_id.clone());
    store.set(storage_keys::AGENT_MODE, state.mode.to_string());
    store.set(storage_keys::TURNS_TAKEN, state.turns_taken.to_string());
    match &state.sandbox_id {
        Some(id) => store.set(storage_keys::SANDBOX_ID, id.clone()),
        None => store.remove(storage_keys::SANDBOX_ID),
    }
}

/// Rebuild a [`WorkflowState`]; `max_turns` comes from configuration, not storage.
pub fn restore(store: &dyn SessionStore, max_turns: usize) -> Result<WorkflowState, SessionError> {
    let required = |key: &'static str| store.get(key).ok_or(SessionError::Missing(key));

    let conversation_id = required(storage_keys::CONVERSATION_ID)?;
    let workflow_run_id = required(storage_keys::WORKFLOW_RUN_ID)?;

    let mode = match store.get(storage_keys::AGENT_MODE) {
        Some(raw) => raw.parse::<AgentMode>().map_err(|_| SessionError::Invalid {
            key:   storage_keys::AGENT_MODE,
            value: raw,
        })?,
        None => AgentMode::default(),
    };

    let turns_taken = match store.get(storage_keys::TURNS_TAKEN) {
        Some(raw) => match raw.parse::<usize>() {
            Ok(turns) if turns <= max_turns => turns,
            _ => {
                return Err(SessionError::Invalid {
                    key:   storage_keys::TURNS_TAKEN,
                    value: raw,
                });
            }
        },
        None => 0,
    };

    Ok(WorkflowState {
        conversation_id,
        workflow_run_id,
        turns_taken,
        max_turns,
        mode,
        sandbox_id: store.get(storage_keys::SANDBOX_ID),
    })
}
