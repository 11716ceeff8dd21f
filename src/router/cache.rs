//! 结果缓存：TTL + 容量上限（最近最少使用淘汰），键为规范化 prompt 的 SHA-256 指纹

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::router::ExecutionPath;

#[derive(Debug, Clone, PartialEq)]
pub struct CachedAnswer {
    pub text: String,
    pub confidence: f64,
    pub path: ExecutionPath,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

struct Entry {
    answer: CachedAnswer,
    inserted: Instant,
    last_used: u64,
}

struct Inner {
    entries: HashMap<String, Entry>,
    tick: u64,
    hits: u64,
    misses: u64,
}

pub struct QueryCache {
    ttl: Duration,
    max_entries: usize,
    inner: Mutex<Inner>,
}

/// 小写 + 折叠空白后取 SHA-256
pub fn fingerprint(prompt: &str) -> String {
    let normalized = prompt
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    format!("{:x}", Sha256::digest(normalized.as_bytes()))
}

impl QueryCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                tick: 0,
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<CachedAnswer> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;
        let alive = inner
            .entries
            .get(key)
            .map(|e| e.inserted.elapsed() < self.ttl);
        let fresh = match alive {
            Some(true) => inner.entries.get_mut(key).map(|e| {
                e.last_used = tick;
                e.answer.clone()
            }),
            Some(false) => {
                inner.entries.remove(key);
                None
            }
            None => None,
        };
        if fresh.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        fresh
    }

    /// 降级兜底用：忽略 TTL，不计入命中统计
    pub fn get_stale(&self, key: &str) -> Option<CachedAnswer> {
        self.inner.lock().entries.get(key).map(|e| e.answer.clone())
    }

    pub fn insert(&self, key: String, answer: CachedAnswer) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_entries {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            if let Some(k) = oldest {
                inner.entries.remove(&k);
            }
        }
        inner.entries.insert(
            key,
            Entry {
                answer,
                inserted: Instant::now(),
                last_used: tick,
            },
        );
    }

    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.inserted.elapsed() < ttl);
        before - inner.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}
