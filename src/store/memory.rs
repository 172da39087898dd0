//! In-process backend for tests

use super::{Backend, Dialer, HashDecision};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// How the store should misbehave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every call fails as if the endpoint were down
    Unreachable,
    /// Every call fails with a command error
    Rejecting,
}

#[derive(Debug, Default)]
struct State {
    strings: HashMap<String, (String, Option<Instant>)>,
    hashes: HashMap<String, HashMap<String, String>>,
    fault: Option<Fault>,
}

/// Key-value store held in memory, safe to share between threads
#[derive(Debug)]
pub struct MemoryStore {
    address: String,
    state: Mutex<State>,
    hash_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            state: Mutex::new(State::default()),
            hash_writes: AtomicUsize::new(0),
        }
    }

    pub fn set_fault(&self, fault: Option<Fault>) {
        self.state.lock().unwrap().fault = fault;
    }

    /// Number of hash fields written so far
    pub fn hash_writes(&self) -> usize {
        self.hash_writes.load(Ordering::SeqCst)
    }

    /// Remaining lifetime of a string key
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        let (_, expires) = state.strings.get(key)?;
        expires.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn remove(&self, key: &str) {
        self.state.lock().unwrap().strings.remove(key);
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.state.lock().unwrap();
        let fault = state.fault;
        match fault {
            None => Ok(state),
            Some(Fault::Unreachable) => Err(Error::StoreUnavailable {
                address: self.address.clone(),
                message: "connection refused".into(),
            }),
            Some(Fault::Rejecting) => Err(Error::Store(format!(
                "{}: WRONGTYPE Operation against a key holding the wrong kind of value",
                self.address
            ))),
        }
    }
}

impl Backend for MemoryStore {
    fn address(&self) -> &str {
        &self.address
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.lock()?;
        let expired = matches!(
            state.strings.get(key),
            Some((_, Some(at))) if *at <= Instant::now()
        );
        if expired {
            state.strings.remove(key);
        }
        Ok(state.strings.get(key).map(|(value, _)| value.clone()))
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut state = self.lock()?;
        state
            .strings
            .insert(key.to_string(), (value.to_string(), Some(Instant::now() + ttl)));
        Ok(())
    }

    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let state = self.lock()?;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let removed = state
            .hashes
            .get_mut(key)
            .is_some_and(|hash| hash.remove(field).is_some());
        Ok(removed)
    }

    fn hash_compare_and_set(
        &self,
        key: &str,
        decide: &mut HashDecision<'_>,
    ) -> Result<Option<(String, String)>> {
        // The lock is held across decide and write
        let mut state = self.lock()?;
        let hash = state.hashes.entry(key.to_string()).or_default();
        let Some((field, value)) = decide(hash) else {
            return Ok(None);
        };
        hash.insert(field.clone(), value.clone());
        self.hash_writes.fetch_add(1, Ordering::SeqCst);
        Ok(Some((field, value)))
    }
}

/// Hands out registered stores by address
#[derive(Debug, Default)]
pub struct MemoryDialer {
    stores: HashMap<String, Arc<MemoryStore>>,
}

impl MemoryDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, store: Arc<MemoryStore>) {
        self.stores.insert(store.address.clone(), store);
    }
}

impl Dialer for MemoryDialer {
    fn dial(&self, address: &str) -> Result<Arc<dyn Backend>> {
        let store = self
            .stores
            .get(address)
            .ok_or_else(|| Error::StoreUnavailable {
                address: address.to_string(),
                message: "no such endpoint".into(),
            })?;
        let backend: Arc<dyn Backend> = store.clone();
        Ok(backend)
    }
}
