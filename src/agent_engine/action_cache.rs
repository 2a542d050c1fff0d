//! In-run memo of actions that worked on a given screen.
//!
//! When a screen whose fingerprint is close to one already handled shows up again,
//! the worker replays the recorded action instead of asking the model. A replay only
//! counts once the next capture shows the screen actually changed.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::ActionCacheConfig;
use crate::perception::fingerprint::hamming_distance;
use crate::protocol::Action;

#[derive(Debug, Clone, PartialEq)]
pub struct CachedAction {
    pub fingerprint: u64,
    pub action: Action,
    pub thought: String,
    pub raw_output: String,
    pub hit_count: u32,
    pub last_turn: u32,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub failed: usize,
    pub exhausted: usize,
}

pub struct ActionCache {
    hash_threshold: u32,
    max_reuse: u32,
    max_entries: usize,
    entries: HashMap<u64, CachedAction>,
}

impl ActionCache {
    pub fn new(config: &ActionCacheConfig) -> Self {
        Self {
            hash_threshold: config.hash_threshold,
            max_reuse: config.max_reuse,
            max_entries: config.max_entries.max(1),
            entries: HashMap::new(),
        }
    }

    /// Closest usable entry within the Hamming threshold. Failed entries and entries
    /// that used up their reuse budget are skipped.
    pub fn lookup(&self, fingerprint: u64) -> Option<&CachedAction> {
        self.entries
            .values()
            .filter(|e| e.succeeded && e.hit_count < self.max_reuse)
            .map(|e| (hamming_distance(fingerprint, e.fingerprint), e))
            .filter(|(dist, _)| *dist <= self.hash_threshold)
            .min_by_key(|(dist, e)| (*dist, e.fingerprint))
            .map(|(_, e)| e)
    }

    /// Remembers a model-chosen action that executed successfully on `fingerprint`.
    /// Terminal actions are never cached. A full cache drops its least recently used entry.
    pub fn store(&mut self, fingerprint: u64, action: Action, thought: String, raw_output: String, turn: u32) {
        if action.kind.is_terminal() {
            return;
        }
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&fingerprint) {
            let oldest = self
                .entries
                .values()
                .min_by_key(|e| e.last_turn)
                .map(|e| e.fingerprint);
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            fingerprint,
            CachedAction {
                fingerprint,
                action,
                thought,
                raw_output,
                hit_count: 0,
                last_turn: turn,
                succeeded: true,
            },
        );
    }

    pub fn record_hit(&mut self, fingerprint: u64, turn: u32) {
        if let Some(entry) = self.entries.get_mut(&fingerprint) {
            entry.hit_count += 1;
            entry.last_turn = turn;
        }
    }

    pub fn evict(&mut self, fingerprint: u64) {
        self.entries.remove(&fingerprint);
    }

    /// Keeps the entry but hides it from lookups.
    pub fn mark_failed(&mut self, fingerprint: u64) {
        if let Some(entry) = self.entries.get_mut(&fingerprint) {
            entry.succeeded = false;
        }
    }

    /// Settles a replay of `entry` made on screen `before`, given the screen after it.
    /// An unchanged screen evicts the entry. Returns whether the replay took effect.
    pub fn verify(&mut self, entry: u64, before: u64, after: u64, turn: u32) -> bool {
        if after == before {
            self.evict(entry);
            false
        } else {
            self.record_hit(entry, turn);
            true
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            total: self.entries.len(),
            failed: self.entries.values().filter(|e| !e.succeeded).count(),
            exhausted: self
                .entries
                .values()
                .filter(|e| e.hit_count >= self.max_reuse)
                .count(),
        }
    }
}
