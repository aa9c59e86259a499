//! Client address access policy.
//!
//! The policy keeps two independent address sets, `allowed` and `blocked`,
//! and decides per connection whether a peer may be served:
//!
//! 1. an address in `allowed` is always permitted;
//! 2. otherwise an address in `blocked` is denied;
//! 3. anything else is permitted.
//!
//! The default posture is therefore permissive, and `allowed` acts as an
//! override for entries that are also blocked. Addresses are compared as
//! exact strings, so `::1` and `0:0:0:0:0:0:0:1` are distinct entries.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};

use super::store::{AddressStore, JsonAddressStore};

/// A set of textual client addresses. Membership-tested only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet {
    entries: BTreeSet<String>,
}

impl AddressSet {
    /// Builds a set from stored entries, dropping duplicates.
    pub fn from_entries<I: IntoIterator<Item = String>>(entries: I) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Returns true if `ip` is in the set.
    pub fn contains(&self, ip: &str) -> bool {
        self.entries.contains(ip)
    }

    /// Inserts `ip`; returns false if it was already present.
    pub fn insert(&mut self, ip: &str) -> bool {
        if self.entries.contains(ip) {
            return false;
        }
        self.entries.insert(ip.to_string())
    }

    /// Removes `ip`; returns false if it was absent.
    pub fn remove(&mut self, ip: &str) -> bool {
        self.entries.remove(ip)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the set has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in sorted order.
    pub fn to_vec(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }
}

/// Which of the two address sets an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Allowed,
    Blocked,
}

impl ListKind {
    fn as_str(self) -> &'static str {
        match self {
            ListKind::Allowed => "allowed",
            ListKind::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Default)]
struct PolicySets {
    allowed: AddressSet,
    blocked: AddressSet,
}

impl PolicySets {
    fn get_mut(&mut self, kind: ListKind) -> &mut AddressSet {
        match kind {
            ListKind::Allowed => &mut self.allowed,
            ListKind::Blocked => &mut self.blocked,
        }
    }
}

/// Thread-safe allow/block policy with write-through persistence.
///
/// Mutations are serialized by a save lock held across change and save, so
/// files are written in the order the changes were made. The set lock is
/// only held while the change is applied, so lookups never wait on disk.
/// A failed save is logged; the in-memory sets stay authoritative.
pub struct AccessPolicy {
    sets: RwLock<PolicySets>,
    save_order: Mutex<()>,
    allowed_store: Box<dyn AddressStore>,
    blocked_store: Box<dyn AddressStore>,
}

impl AccessPolicy {
    /// Creates a policy, loading both sets from their stores.
    pub fn new(allowed_store: Box<dyn AddressStore>, blocked_store: Box<dyn AddressStore>) -> Self {
        let sets = PolicySets {
            allowed: AddressSet::from_entries(allowed_store.load()),
            blocked: AddressSet::from_entries(blocked_store.load()),
        };

        tracing::info!(
            "Access policy loaded: {} allowed, {} blocked",
            sets.allowed.len(),
            sets.blocked.len()
        );

        Self {
            sets: RwLock::new(sets),
            save_order: Mutex::new(()),
            allowed_store,
            blocked_store,
        }
    }

    /// Creates a policy persisted to two JSON files.
    pub fn from_files<A: AsRef<Path>, B: AsRef<Path>>(allowed_file: A, blocked_file: B) -> Self {
        Self::new(
            Box::new(JsonAddressStore::new(allowed_file)),
            Box::new(JsonAddressStore::new(blocked_file)),
        )
    }

    /// Returns true if a client at `ip` may connect now.
    pub fn is_allowed(&self, ip: &str) -> bool {
        let sets = self.sets.read().unwrap_or_else(PoisonError::into_inner);
        if sets.allowed.contains(ip) {
            return true;
        }
        !sets.blocked.contains(ip)
    }

    /// Convenience wrapper over [`is_allowed`](Self::is_allowed) for a peer address.
    pub fn is_peer_allowed(&self, ip: IpAddr) -> bool {
        self.is_allowed(&ip.to_string())
    }

    /// Adds `ip` to the allowed set. Returns whether the set changed.
    pub fn add_allowed(&self, ip: &str) -> bool {
        self.mutate(ListKind::Allowed, ip, true)
    }

    /// Removes `ip` from the allowed set. Returns whether the set changed.
    pub fn remove_allowed(&self, ip: &str) -> bool {
        self.mutate(ListKind::Allowed, ip, false)
    }

    /// Adds `ip` to the blocked set. Returns whether the set changed.
    pub fn add_blocked(&self, ip: &str) -> bool {
        self.mutate(ListKind::Blocked, ip, true)
    }

    /// Removes `ip` from the blocked set. Returns whether the set changed.
    pub fn remove_blocked(&self, ip: &str) -> bool {
        self.mutate(ListKind::Blocked, ip, false)
    }

    /// Snapshot of the allowed set, sorted.
    pub fn allowed(&self) -> Vec<String> {
        self.sets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .allowed
            .to_vec()
    }

    /// Snapshot of the blocked set, sorted.
    pub fn blocked(&self) -> Vec<String> {
        self.sets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .blocked
            .to_vec()
    }

    fn mutate(&self, kind: ListKind, ip: &str, insert: bool) -> bool {
        // Lenient on format: entries are opaque strings, but flag obvious typos.
        if insert && ip.parse::<IpAddr>().is_err() {
            tracing::warn!(
                "Adding {:?} to {} list although it is not an IP literal",
                ip,
                kind.as_str()
            );
        }

        let _save_order = self.save_order.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = {
            let mut sets = self.sets.write().unwrap_or_else(PoisonError::into_inner);
            let set = sets.get_mut(kind);
            let changed = if insert { set.insert(ip) } else { set.remove(ip) };
            if !changed {
                return false;
            }
            set.to_vec()
        };

        if insert {
            tracing::info!("Added {} to {} list", ip, kind.as_str());
        } else {
            tracing::info!("Removed {} from {} list", ip, kind.as_str());
        }

        let store = match kind {
            ListKind::Allowed => &self.allowed_store,
            ListKind::Blocked => &self.blocked_store,
        };
        if let Err(e) = store.save(&snapshot) {
            tracing::error!("Failed to persist {} list: {}", kind.as_str(), e);
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::store::{JsonAddressStore, StoreError};
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Records every save; optionally fails them.
    #[derive(Default)]
    struct RecordingStore {
        initial: Vec<String>,
        saves: Arc<Mutex<Vec<Vec<String>>>>,
        fail: bool,
    }

    impl AddressStore for RecordingStore {
        fn load(&self) -> Vec<String> {
            self.initial.clone()
        }

        fn save(&self, addresses: &[String]) -> Result<(), StoreError> {
            self.saves.lock().unwrap().push(addresses.to_vec());
            if self.fail {
                return Err(StoreError::Write {
                    path: "/unwritable".into(),
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                });
            }
            Ok(())
        }
    }

    /// Signals when a save starts, then blocks until released.
    struct GatedStore {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl AddressStore for GatedStore {
        fn load(&self) -> Vec<String> {
            Vec::new()
        }

        fn save(&self, _addresses: &[String]) -> Result<(), StoreError> {
            self.entered.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
            Ok(())
        }
    }

    fn empty_policy() -> AccessPolicy {
        AccessPolicy::new(
            Box::new(RecordingStore::default()),
            Box::new(RecordingStore::default()),
        )
    }

    #[test]
    fn test_unknown_address_is_allowed() {
        let policy = empty_policy();
        assert!(policy.is_allowed("192.168.1.20"));
    }

    #[test]
    fn test_blocked_address_is_denied() {
        let policy = empty_policy();
        assert!(policy.add_blocked("192.168.1.20"));
        assert!(!policy.is_allowed("192.168.1.20"));
        assert!(policy.is_allowed("192.168.1.21"));
    }

    #[test]
    fn test_allowed_overrides_blocked() {
        let policy = empty_policy();
        policy.add_blocked("10.0.0.5");
        policy.add_allowed("10.0.0.5");

        assert!(policy.is_allowed("10.0.0.5"));
        assert_eq!(policy.blocked(), vec!["10.0.0.5"]);

        policy.remove_allowed("10.0.0.5");
        assert!(!policy.is_allowed("10.0.0.5"));
    }

    #[test]
    fn test_allowed_alone_does_not_restrict() {
        let policy = empty_policy();
        policy.add_allowed("10.0.0.5");
        assert!(policy.is_allowed("10.0.0.6"));
    }

    #[test]
    fn test_duplicate_add_is_no_change() {
        let policy = empty_policy();
        assert!(policy.add_allowed("10.0.0.1"));
        assert!(!policy.add_allowed("10.0.0.1"));
        assert_eq!(policy.allowed(), vec!["10.0.0.1"]);
    }

    #[test]
    fn test_remove_absent_is_no_change() {
        let policy = empty_policy();
        assert!(!policy.remove_allowed("10.0.0.1"));
        assert!(!policy.remove_blocked("10.0.0.1"));
    }

    #[test]
    fn test_sets_are_independent() {
        let policy = empty_policy();
        policy.add_allowed("10.0.0.1");
        policy.add_blocked("10.0.0.1");

        assert!(policy.remove_blocked("10.0.0.1"));
        assert_eq!(policy.allowed(), vec!["10.0.0.1"]);
        assert!(policy.blocked().is_empty());
    }

    #[test]
    fn test_addresses_compare_as_exact_strings() {
        let policy = empty_policy();
        policy.add_blocked("::1");
        assert!(!policy.is_allowed("::1"));
        assert!(policy.is_allowed("0:0:0:0:0:0:0:1"));
    }

    #[test]
    fn test_each_change_persists_full_set() {
        let saves = Arc::new(Mutex::new(Vec::new()));
        let policy = AccessPolicy::new(
            Box::new(RecordingStore {
                saves: Arc::clone(&saves),
                ..Default::default()
            }),
            Box::new(RecordingStore::default()),
        );

        policy.add_allowed("10.0.0.2");
        policy.add_allowed("10.0.0.1");
        policy.add_allowed("10.0.0.1");
        policy.remove_allowed("10.0.0.2");

        let saves = saves.lock().unwrap();
        assert_eq!(
            *saves,
            vec![
                vec!["10.0.0.2".to_string()],
                vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
                vec!["10.0.0.1".to_string()],
            ]
        );
    }

    #[test]
    fn test_failed_save_keeps_memory_authoritative() {
        let policy = AccessPolicy::new(
            Box::new(RecordingStore::default()),
            Box::new(RecordingStore {
                fail: true,
                ..Default::default()
            }),
        );

        assert!(policy.add_blocked("10.9.9.9"));
        assert!(!policy.is_allowed("10.9.9.9"));
    }

    #[test]
    fn test_loads_initial_sets() {
        let policy = AccessPolicy::new(
            Box::new(RecordingStore {
                initial: vec!["10.0.0.1".to_string(), "10.0.0.1".to_string()],
                ..Default::default()
            }),
            Box::new(RecordingStore {
                initial: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
                ..Default::default()
            }),
        );

        assert_eq!(policy.allowed(), vec!["10.0.0.1"]);
        assert!(policy.is_allowed("10.0.0.1"));
        assert!(!policy.is_allowed("10.0.0.2"));
    }

    #[test]
    fn test_json_persistence_survives_reload() {
        let temp_dir = TempDir::new().unwrap();
        let allowed = temp_dir.path().join("allowed.json");
        let blocked = temp_dir.path().join("blocked.json");

        {
            let policy = AccessPolicy::new(
                Box::new(JsonAddressStore::new(&allowed)),
                Box::new(JsonAddressStore::new(&blocked)),
            );
            policy.add_blocked("172.16.0.9");
            policy.add_allowed("172.16.0.10");
        }

        let reloaded = AccessPolicy::new(
            Box::new(JsonAddressStore::new(&allowed)),
            Box::new(JsonAddressStore::new(&blocked)),
        );
        assert!(!reloaded.is_allowed("172.16.0.9"));
        assert_eq!(reloaded.allowed(), vec!["172.16.0.10"]);
    }

    #[test]
    fn test_malformed_entries_are_kept() {
        let policy = empty_policy();
        assert!(policy.add_blocked("not-an-ip"));
        assert!(!policy.is_allowed("not-an-ip"));
    }

    #[test]
    fn test_concurrent_mutations_and_queries() {
        let policy = Arc::new(empty_policy());
        let mut handles = Vec::new();

        for t in 0..8 {
            let policy = Arc::clone(&policy);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    let ip = format!("10.{}.0.{}", t, i);
                    assert!(policy.add_blocked(&ip));
                    assert!(!policy.is_allowed(&ip));
                    assert!(policy.add_allowed(&ip));
                    assert!(policy.is_allowed(&ip));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(policy.blocked().len(), 400);
        assert_eq!(policy.allowed().len(), 400);
    }

    #[test]
    fn test_lookups_do_not_wait_for_a_slow_save() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let policy = Arc::new(AccessPolicy::new(
            Box::new(RecordingStore::default()),
            Box::new(GatedStore {
                entered: Mutex::new(entered_tx),
                release: Mutex::new(release_rx),
            }),
        ));

        let writer = std::thread::spawn({
            let policy = Arc::clone(&policy);
            move || policy.add_blocked("10.1.1.1")
        });
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // The save is still blocked; the change is already visible
        let (lookup_tx, lookup_rx) = mpsc::channel();
        std::thread::spawn({
            let policy = Arc::clone(&policy);
            move || lookup_tx.send(policy.is_allowed("10.1.1.1")).unwrap()
        });
        assert_eq!(lookup_rx.recv_timeout(Duration::from_secs(5)), Ok(false));
        assert_eq!(policy.blocked(), vec!["10.1.1.1"]);

        release_tx.send(()).unwrap();
        assert!(writer.join().unwrap());
    }

    #[test]
    fn test_saves_follow_change_order() {
        let saves = Arc::new(Mutex::new(Vec::new()));
        let policy = Arc::new(AccessPolicy::new(
            Box::new(RecordingStore {
                saves: Arc::clone(&saves),
                ..Default::default()
            }),
            Box::new(RecordingStore::default()),
        ));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let policy = Arc::clone(&policy);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        policy.add_allowed(&format!("10.{}.1.{}", t, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Every save holds one more entry than the last, ending with the full set.
        let saves = saves.lock().unwrap();
        assert_eq!(saves.len(), 200);
        assert!(saves.iter().enumerate().all(|(i, save)| save.len() == i + 1));
        assert_eq!(saves.last().unwrap(), &policy.allowed());
    }

    #[test]
    fn test_is_peer_allowed_formats_ip() {
        let policy = empty_policy();
        policy.add_blocked("127.0.0.1");
        assert!(!policy.is_peer_allowed("127.0.0.1".parse().unwrap()));
        assert!(policy.is_peer_allowed("127.0.0.2".parse().unwrap()));
    }
}
