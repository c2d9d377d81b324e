//! Local mirror of entity states.
//!
//! Seeded once, at connect time, from the bulk `get_states` reply — last
//! writer wins on duplicate `entity_id`s (there shouldn't be any). The core
//! does **not** keep this mirror current from `state_changed` events; it
//! reflects the connect-time snapshot only. A caller that wants a live
//! mirror should apply [`crate::reader`]-delivered events to its own copy.

use std::collections::HashMap;
use std::sync::Arc;

use hass_core::protocol::HassState;
use tokio::sync::RwLock;

/// Thread-safe `entity_id -> HassState` map.
#[derive(Clone, Default)]
pub struct StateMirror {
    inner: Arc<RwLock<HashMap<String, HassState>>>,
}

impl StateMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the mirror's contents with a freshly fetched batch.
    pub(crate) async fn load(&self, states: Vec<HassState>) {
        let mut map = self.inner.write().await;
        map.clear();
        for state in states {
            map.insert(state.entity_id.clone(), state);
        }
    }

    /// Look up a single entity's last-known state.
    pub async fn get(&self, entity_id: &str) -> Option<HassState> {
        self.inner.read().await.get(entity_id).cloned()
    }

    /// Number of entities currently mirrored.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// A full copy of the mirror, for callers that want to iterate.
    pub async fn snapshot(&self) -> HashMap<String, HassState> {
        self.inner.read().await.clone()
    }
}
