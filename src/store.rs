//! Lease store
//!
//! Provides:
//! - The `Backend` abstraction over a key-value endpoint
//! - The lease table (container id to IPv4 address)
//! - Read/write routing between the local endpoint and the master

pub mod pool;

#[cfg(test)]
pub mod memory;

use crate::error::Result;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub use pool::RedisDialer;

/// Chooses the field/value to write given the current contents of a hash
///
/// Returning `None` leaves the hash untouched.
pub type HashDecision<'a> =
    dyn FnMut(&HashMap<String, String>) -> Option<(String, String)> + 'a;

/// Operations required from a key-value endpoint
///
/// Every call checks a connection out for its own duration only.
pub trait Backend: Send + Sync {
    /// Endpoint address, for diagnostics
    fn address(&self) -> &str;

    /// Read a string key, `None` when absent
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a string key that expires after `ttl`
    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Remove a hash field, returning whether it existed
    fn hash_delete(&self, key: &str, field: &str) -> Result<bool>;

    /// Atomically read a hash and conditionally write one field
    ///
    /// `decide` sees the hash as it is when the write commits; it may be
    /// called more than once if a concurrent writer interferes. Returns the
    /// field/value written, if any.
    fn hash_compare_and_set(
        &self,
        key: &str,
        decide: &mut HashDecision<'_>,
    ) -> Result<Option<(String, String)>>;
}

/// Opens backends for endpoint addresses
pub trait Dialer {
    fn dial(&self, address: &str) -> Result<Arc<dyn Backend>>;
}

/// Snapshot of the lease table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct LeaseTable {
    leases: BTreeMap<String, Ipv4Addr>,
}

impl LeaseTable {
    /// Build a table from raw hash contents, skipping unparsable values
    pub fn from_raw(raw: &HashMap<String, String>) -> Self {
        let mut leases = BTreeMap::new();
        for (id, value) in raw {
            match value.parse::<Ipv4Addr>() {
                Ok(addr) => {
                    leases.insert(id.clone(), addr);
                }
                Err(_) => warn!(id = %id, value = %value, "ignoring lease with malformed address"),
            }
        }
        Self { leases }
    }

    /// Address leased to a container, if any
    pub fn get(&self, id: &str) -> Option<Ipv4Addr> {
        self.leases.get(id).copied()
    }

    /// All leased addresses
    pub fn addresses(&self) -> HashSet<Ipv4Addr> {
        self.leases.values().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Ipv4Addr)> {
        self.leases.iter().map(|(id, addr)| (id.as_str(), *addr))
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

/// Outcome of an atomic reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The container already held this address; nothing was written
    Existing(Ipv4Addr),
    /// The address was written for the container
    Reserved(Ipv4Addr),
    /// No candidate was free
    Exhausted,
}

/// Outcome of recording a chosen address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pin {
    /// The container now holds the address
    Recorded,
    /// Another container holds the address; nothing was written
    HeldBy(String),
}

/// Lease table access routed through a read and a write backend
#[derive(Clone)]
pub struct LeaseStore {
    read: Arc<dyn Backend>,
    write: Arc<dyn Backend>,
    key: String,
}

impl LeaseStore {
    /// Create a store reading from `read` and writing to `write`
    pub fn new(read: Arc<dyn Backend>, write: Arc<dyn Backend>, key: impl Into<String>) -> Self {
        Self {
            read,
            write,
            key: key.into(),
        }
    }

    /// Read the full lease table
    pub fn read_all(&self) -> Result<LeaseTable> {
        let raw = self.read.hash_get_all(&self.key)?;
        Ok(LeaseTable::from_raw(&raw))
    }

    /// Address currently leased to `id`
    pub fn get(&self, id: &str) -> Result<Option<Ipv4Addr>> {
        Ok(self.read_all()?.get(id))
    }

    /// Atomically record `addr` for `id` unless another container holds it
    ///
    /// The holder check runs against the write backend, so a lagging read
    /// replica cannot hide a conflicting lease.
    pub fn pin(&self, id: &str, addr: Ipv4Addr) -> Result<Pin> {
        let mut outcome = Pin::Recorded;
        let written = self.write.hash_compare_and_set(&self.key, &mut |raw: &HashMap<String, String>| {
            let table = LeaseTable::from_raw(raw);
            if let Some((holder, _)) = table.iter().find(|(holder, held)| *held == addr && *holder != id) {
                outcome = Pin::HeldBy(holder.to_string());
                return None;
            }
            outcome = Pin::Recorded;
            if table.get(id) == Some(addr) {
                return None;
            }
            Some((id.to_string(), addr.to_string()))
        })?;

        if let Some((field, value)) = written {
            debug!(id = %field, addr = %value, store = self.write.address(), "lease pinned");
        }
        Ok(outcome)
    }

    /// Remove a lease, returning whether one existed
    pub fn delete(&self, id: &str) -> Result<bool> {
        self.write.hash_delete(&self.key, id)
    }

    /// Atomically reserve an address for `id`
    ///
    /// If `id` already holds a lease it is returned untouched. Otherwise
    /// `pick` chooses from the table as it stands at commit time.
    pub fn claim<F>(&self, id: &str, mut pick: F) -> Result<Claim>
    where
        F: FnMut(&LeaseTable) -> Option<Ipv4Addr>,
    {
        let mut outcome = Claim::Exhausted;
        let written = self.write.hash_compare_and_set(&self.key, &mut |raw: &HashMap<String, String>| {
            let table = LeaseTable::from_raw(raw);
            if let Some(addr) = table.get(id) {
                outcome = Claim::Existing(addr);
                return None;
            }
            match pick(&table) {
                Some(addr) => {
                    outcome = Claim::Reserved(addr);
                    Some((id.to_string(), addr.to_string()))
                }
                None => {
                    outcome = Claim::Exhausted;
                    None
                }
            }
        })?;

        if let Some((field, value)) = written {
            debug!(id = %field, addr = %value, store = self.write.address(), "lease written");
        }
        Ok(outcome)
    }
}
