//! IP address management for container networks
//!
//! Provides:
//! - First-fit allocation from a subnet range
//! - Idempotent lookups for containers that already hold a lease
//! - Lease release

use crate::error::{Error, Result};
use crate::network::range::SubnetRange;
use crate::store::{Claim, LeaseStore, LeaseTable, Pin};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Whether an address ends in a network, gateway or broadcast octet
pub fn is_reserved_suffix(addr: Ipv4Addr) -> bool {
    matches!(addr.octets()[3], 0 | 1 | 255)
}

/// Lowest eligible address in `range` that nobody in `table` holds
pub fn first_fit(range: &SubnetRange, table: &LeaseTable) -> Option<Ipv4Addr> {
    let held = table.addresses();
    range
        .candidates()
        .filter(|addr| !is_reserved_suffix(*addr))
        .find(|addr| !held.contains(addr))
}

/// IP allocator backed by the shared lease table
#[derive(Clone)]
pub struct IpAllocator {
    store: LeaseStore,
}

impl IpAllocator {
    /// Create a new IP allocator
    pub fn new(store: LeaseStore) -> Self {
        Self { store }
    }

    /// Return the container's address, allocating one if needed
    ///
    /// The check for a free address and its reservation happen in one atomic
    /// write, so concurrent callers never receive the same address.
    pub fn get_or_allocate(&self, id: &str, range: &str) -> Result<(Ipv4Addr, Ipv4Net)> {
        let range = SubnetRange::parse(range)?;

        if let Some(addr) = self.store.get(id)? {
            debug!(id = %id, addr = %addr, "container already holds a lease");
            return Ok((addr, range.subnet()));
        }

        match self.store.claim(id, |table| first_fit(&range, table))? {
            Claim::Existing(addr) => {
                debug!(id = %id, addr = %addr, "lease appeared during reservation");
                Ok((addr, range.subnet()))
            }
            Claim::Reserved(addr) => {
                info!(id = %id, addr = %addr, range = %range, "allocated address");
                Ok((addr, range.subnet()))
            }
            Claim::Exhausted => Err(Error::PoolExhausted {
                range: range.to_string(),
            }),
        }
    }

    /// Release a container's address
    ///
    /// Releasing a container without a lease is a no-op.
    pub fn release(&self, id: &str) -> Result<()> {
        match self.store.get(id)? {
            Some(addr) => {
                self.store.delete(id)?;
                info!(id = %id, addr = %addr, "released address");
            }
            None => debug!(id = %id, "no lease to release"),
        }
        Ok(())
    }

    /// Record a lease for a container, bypassing the range scan
    ///
    /// Fails if another container holds `addr` on the write backend.
    pub fn pin(&self, id: &str, addr: Ipv4Addr) -> Result<()> {
        match self.store.pin(id, addr)? {
            Pin::Recorded => {
                info!(id = %id, addr = %addr, "pinned address");
                Ok(())
            }
            Pin::HeldBy(holder) => Err(Error::AddressInUse { addr, holder }),
        }
    }

    /// Current lease table
    pub fn leases(&self) -> Result<LeaseTable> {
        self.store.read_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Backend;
    use crate::store::memory::{Fault, MemoryStore};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    const KEY: &str = "stellarproject.io/ips";

    fn allocator() -> (Arc<MemoryStore>, IpAllocator) {
        let backend = Arc::new(MemoryStore::new("127.0.0.1:9300"));
        let store = LeaseStore::new(backend.clone(), backend.clone(), KEY);
        (backend, IpAllocator::new(store))
    }

    #[test]
    fn test_reserved_suffixes() {
        assert!(is_reserved_suffix(Ipv4Addr::new(10, 0, 0, 0)));
        assert!(is_reserved_suffix(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(is_reserved_suffix(Ipv4Addr::new(10, 0, 0, 255)));
        assert!(!is_reserved_suffix(Ipv4Addr::new(10, 0, 0, 2)));
        assert!(!is_reserved_suffix(Ipv4Addr::new(10, 0, 0, 254)));
    }

    #[test]
    fn test_ip_allocation() {
        let (_, alloc) = allocator();

        // 10.0.1.1 is the gateway, so the first allocation should be 10.0.1.2
        let (ip, subnet) = alloc.get_or_allocate("c1", "10.0.1.0/24").unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 1, 2));
        assert_eq!(subnet, "10.0.1.0/24".parse::<Ipv4Net>().unwrap());

        let (ip2, _) = alloc.get_or_allocate("c2", "10.0.1.0/24").unwrap();
        assert_eq!(ip2, Ipv4Addr::new(10, 0, 1, 3));
    }

    #[test]
    fn test_allocation_starts_at_range_start() {
        let (_, alloc) = allocator();
        let (ip, _) = alloc
            .get_or_allocate("c1", "10.100.0.100-10.100.0.200/24")
            .unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 100, 0, 100));
    }

    #[test]
    fn test_allocation_is_idempotent() {
        let (backend, alloc) = allocator();

        let (first, _) = alloc.get_or_allocate("c1", "10.0.1.0/24").unwrap();
        let writes = backend.hash_writes();
        let (second, _) = alloc.get_or_allocate("c1", "10.0.1.0/24").unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.hash_writes(), writes);
    }

    #[test]
    fn test_allocation_skips_broadcast_and_network() {
        let (_, alloc) = allocator();
        alloc.pin("other", Ipv4Addr::new(10, 0, 0, 254)).unwrap();

        let (ip, _) = alloc
            .get_or_allocate("c1", "10.0.0.254-10.0.1.5/16")
            .unwrap();
        // .254 is taken, .255/.0/.1 are reserved suffixes
        assert_eq!(ip, Ipv4Addr::new(10, 0, 1, 2));
    }

    #[test]
    fn test_exhaustion() {
        let (_, alloc) = allocator();
        alloc.pin("other", Ipv4Addr::new(10, 0, 0, 2)).unwrap();

        let err = alloc
            .get_or_allocate("c1", "10.0.0.1-10.0.0.3/30")
            .unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { .. }));
        assert_eq!(alloc.leases().unwrap().get("c1"), None);
    }

    #[test]
    fn test_inverted_range_is_exhausted() {
        let (_, alloc) = allocator();
        assert!(matches!(
            alloc.get_or_allocate("c1", "10.0.0.200-10.0.0.100/24"),
            Err(Error::PoolExhausted { .. })
        ));
    }

    #[test]
    fn test_parse_error_touches_nothing() {
        let (backend, alloc) = allocator();
        assert!(matches!(
            alloc.get_or_allocate("c1", "1.2.3.4-254/24"),
            Err(Error::InvalidRange { .. })
        ));
        assert_eq!(backend.hash_writes(), 0);
    }

    #[test]
    fn test_ip_release() {
        let (_, alloc) = allocator();

        let (ip, _) = alloc.get_or_allocate("c1", "10.0.1.0/24").unwrap();
        let (_, _) = alloc.get_or_allocate("c2", "10.0.1.0/24").unwrap();
        alloc.release("c1").unwrap();
        assert_eq!(alloc.leases().unwrap().get("c1"), None);

        // The released address is the lowest free one again
        let (ip3, _) = alloc.get_or_allocate("c3", "10.0.1.0/24").unwrap();
        assert_eq!(ip, ip3);
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let (backend, alloc) = allocator();
        alloc.release("ghost").unwrap();
        alloc.release("ghost").unwrap();
        assert_eq!(backend.hash_writes(), 0);
    }

    #[test]
    fn test_store_down_surfaces() {
        let (backend, alloc) = allocator();
        backend.set_fault(Some(Fault::Unreachable));

        assert!(matches!(
            alloc.get_or_allocate("c1", "10.0.1.0/24"),
            Err(Error::StoreUnavailable { .. })
        ));
        assert!(matches!(
            alloc.release("c1"),
            Err(Error::StoreUnavailable { .. })
        ));
    }

    #[test]
    fn test_pin_rejects_taken_address() {
        let (_, alloc) = allocator();
        let addr = Ipv4Addr::new(10, 0, 1, 7);
        alloc.pin("c1", addr).unwrap();

        assert!(matches!(
            alloc.pin("c2", addr),
            Err(Error::AddressInUse { .. })
        ));
        // Re-pinning to the same holder is fine
        alloc.pin("c1", addr).unwrap();
    }

    #[test]
    fn test_pin_sees_lease_missing_from_replica() {
        let replica = Arc::new(MemoryStore::new("127.0.0.1:9300"));
        let master = Arc::new(MemoryStore::new("10.0.0.5:9300"));
        let alloc = IpAllocator::new(LeaseStore::new(replica, master.clone(), KEY));

        let (addr, _) = alloc.get_or_allocate("c1", "10.0.0.0/24").unwrap();
        match alloc.pin("c2", addr) {
            Err(Error::AddressInUse { addr: taken, holder }) => {
                assert_eq!(taken, addr);
                assert_eq!(holder, "c1");
            }
            other => panic!("expected AddressInUse, got {:?}", other),
        }

        let raw = master.hash_get_all(KEY).unwrap();
        assert_eq!(raw.len(), 1);
        assert!(raw.contains_key("c1"));
    }

    #[test]
    fn test_concurrent_allocations_are_distinct() {
        let (_, alloc) = allocator();
        let workers = 32;

        let handles: Vec<_> = (0..workers)
            .map(|n| {
                let alloc = alloc.clone();
                thread::spawn(move || {
                    alloc
                        .get_or_allocate(&format!("container-{}", n), "10.0.2.0/24")
                        .map(|(ip, _)| ip)
                })
            })
            .collect();

        let addrs: HashSet<Ipv4Addr> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();

        assert_eq!(addrs.len(), workers);
        assert_eq!(alloc.leases().unwrap().len(), workers);
    }

    #[test]
    fn test_first_fit_against_snapshot() {
        let range = SubnetRange::parse("10.0.0.1-10.0.0.10/24").unwrap();
        let mut raw = std::collections::HashMap::new();
        raw.insert("a".to_string(), "10.0.0.2".to_string());
        raw.insert("b".to_string(), "10.0.0.4".to_string());
        let table = LeaseTable::from_raw(&raw);

        assert_eq!(first_fit(&range, &table), Some(Ipv4Addr::new(10, 0, 0, 3)));
    }
}
