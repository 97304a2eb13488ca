use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::fingerprint::Fingerprint;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    /// Upper bound on stored entries, oldest insertion evicted first. `None` keeps every entry.
    pub max_entries: Option<usize>,
    /// Value substituted for an absent `max_tokens` when fingerprinting.
    pub default_max_tokens: u32,
    /// Value substituted for an absent `temperature` when fingerprinting.
    pub default_temperature: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 300,
            max_entries: None,
            default_max_tokens: 1000,
            default_temperature: 0.7,
        }
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    response: Value,
    inserted_at: u64,
}

/// Completed non-streaming responses keyed by request fingerprint.
///
/// Expiry is enforced only when an entry is read.
#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    entries: HashMap<Fingerprint, CacheEntry>,
    order: VecDeque<Fingerprint>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&mut self, key: &Fingerprint, now: u64) -> Option<Value> {
        let inserted_at = self.entries.get(key)?.inserted_at;
        if now.saturating_sub(inserted_at) >= self.config.ttl_seconds {
            self.remove(key);
            return None;
        }
        Some(self.entries.get(key)?.response.clone())
    }

    pub fn put(&mut self, key: Fingerprint, response: Value, now: u64) {
        let entry = CacheEntry {
            response,
            inserted_at: now,
        };
        if self.entries.insert(key.clone(), entry).is_some() {
            self.order.retain(|candidate| candidate != &key);
        }
        self.order.push_back(key);

        let Some(max_entries) = self.config.max_entries else {
            return;
        };
        while self.entries.len() > max_entries {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    pub fn remove(&mut self, key: &Fingerprint) -> bool {
        let existed = self.entries.remove(key).is_some();
        if existed {
            self.order.retain(|candidate| candidate != key);
        }
        existed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
