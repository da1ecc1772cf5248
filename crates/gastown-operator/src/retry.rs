/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Backoff Service
//!
//! Per-object exponential retry state shared by all reconciles of one kind.
//! Keys are `namespace/name` strings. The delay for attempt `n` (counted from
//! zero) is `min(base * 2^n, max)`.
//!
//! Entries for objects that no longer exist must be removed with
//! [`BackoffService::cleanup`]; every controller runs it on each resync tick
//! with the keys of its reflector store.

use gastown_utils::config;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffResult {
    pub delay: Duration,
    /// Attempts recorded before this one
    pub retry_count: u32,
}

#[derive(Debug)]
pub struct BackoffService {
    base: Duration,
    max: Duration,
    max_retries: u32,
    retries: Mutex<HashMap<String, u32>>,
}

impl BackoffService {
    pub fn new(base: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max,
            max_retries,
            retries: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &config::Backoff) -> Self {
        Self::new(
            Duration::from_secs(settings.base_seconds),
            Duration::from_secs(settings.max_seconds),
            settings.max_retries,
        )
    }

    /// Returns the delay for the next attempt on `key` and records the attempt.
    pub fn get_backoff_result(&self, key: &str) -> BackoffResult {
        let mut retries = self.lock();
        let count = retries.entry(key.to_string()).or_insert(0);
        let result = BackoffResult {
            delay: self.delay_for(*count),
            retry_count: *count,
        };
        *count = count.saturating_add(1);
        result
    }

    pub fn reset_retries(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn should_give_up(&self, key: &str) -> bool {
        self.retry_count(key) >= self.max_retries
    }

    pub fn retry_count(&self, key: &str) -> u32 {
        self.lock().get(key).copied().unwrap_or(0)
    }

    /// Drops every key not present in `active`. Returns the number removed.
    pub fn cleanup(&self, active: &HashSet<String>) -> usize {
        let mut retries = self.lock();
        let before = retries.len();
        retries.retain(|key, _| active.contains(key));
        before - retries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn delay_for(&self, count: u32) -> Duration {
        // 2^31 seconds is already far past any sane max
        let factor = 1u32.checked_shl(count.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.retries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
