//! Invocation caching hook.
//!
//! The runtime consults the cache only for tasks that enable it. Caches are
//! per process: a value stored inside a forked worker is not visible to the
//! initiator.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

/// Lookup/store hook around task invocation.
pub trait InvocationCache: Send + Sync {
    fn lookup(&self, task: &str, args: &[Value]) -> Option<Value>;
    fn store(&self, task: &str, args: &[Value], value: &Value);
}

/// Key for a call: task name plus SHA-256 of the JSON-encoded arguments.
pub fn cache_key(task: &str, args: &[Value]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(args).unwrap_or_default());
    format!("{}:{:x}", task, hasher.finalize())
}

/// Unbounded in-memory cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl InvocationCache for MemoryCache {
    fn lookup(&self, task: &str, args: &[Value]) -> Option<Value> {
        let key = cache_key(task, args);
        self.entries.lock().ok()?.get(&key).cloned()
    }

    fn store(&self, task: &str, args: &[Value], value: &Value) {
        let key = cache_key(task, args);
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key, value.clone());
        }
    }
}
