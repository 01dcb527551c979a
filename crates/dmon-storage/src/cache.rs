use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use reqwest::Method;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub endpoint: String,
    pub payload: JsonValue,
    pub timestamp: Instant,
}

/// GET response cache with TTL expiry and FIFO eviction.
///
/// Eviction is by insertion order: a read never refreshes an entry's position, only a
/// re-insert does. Expiry is checked lazily on read and is independent of eviction.
#[derive(Debug)]
pub struct ResponseCache {
    capacity: usize,
    ttl: Duration,
    state: Mutex<CacheState>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

impl CacheState {
    fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn key(method: &Method, endpoint: &str, params: &[(String, String)]) -> String {
        let serialized = serde_json::to_string(params).unwrap_or_default();
        format!("{method}:{endpoint}:{serialized}")
    }

    pub async fn get(&self, key: &str) -> Option<JsonValue> {
        let mut state = self.state.lock().await;
        let expired = match state.entries.get(key) {
            None => return None,
            Some(entry) => entry.timestamp.elapsed() > self.ttl,
        };
        if expired {
            state.remove(key);
            return None;
        }
        state.entries.get(key).map(|e| e.payload.clone())
    }

    pub async fn insert(&self, key: String, endpoint: &str, payload: JsonValue) {
        let mut state = self.state.lock().await;
        state.remove(&key);
        state.order.push_back(key.clone());
        state.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                endpoint: endpoint.to_string(),
                payload,
                timestamp: Instant::now(),
            },
        );
        while state.entries.len() > self.capacity {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
        }
    }

    /// Drops every cached read of `endpoint`, used after writes to it.
    pub async fn invalidate_endpoint(&self, endpoint: &str) {
        let mut state = self.state.lock().await;
        let stale: Vec<String> = state
            .entries
            .values()
            .filter(|e| e.endpoint == endpoint)
            .map(|e| e.key.clone())
            .collect();
        for key in stale {
            state.remove(&key);
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.order.clear();
    }
}
