//! Identity registry: uid → Connection and device token → Connection.
//!
//! Both maps sit behind one lock, so a supersede (evict the old owner,
//! install the new one) is a single critical section. Nothing here closes a
//! socket or touches the network; callers close evicted owners after the
//! lock is released.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::connection::Connection;

#[derive(Default)]
struct Owners {
    by_uid: HashMap<i64, Arc<Connection>>,
    by_device: HashMap<String, Arc<Connection>>,
}

/// Which keys an [`Registry::unregister`] call actually removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Released {
    pub uid: bool,
    pub device_token: bool,
}

#[derive(Default)]
pub struct Registry {
    owners: Mutex<Owners>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn owners(&self) -> MutexGuard<'_, Owners> {
        self.owners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_by_uid(&self, uid: i64) -> Option<Arc<Connection>> {
        self.owners().by_uid.get(&uid).cloned()
    }

    pub fn get_by_device_token(&self, token: &str) -> Option<Arc<Connection>> {
        self.owners().by_device.get(token).cloned()
    }

    /// Insert-if-absent. True when `conn` owns `uid` afterwards.
    pub fn register_by_uid(&self, uid: i64, conn: &Arc<Connection>) -> bool {
        let mut owners = self.owners();
        match owners.by_uid.get(&uid) {
            Some(existing) => existing.id() == conn.id(),
            None => {
                owners.by_uid.insert(uid, Arc::clone(conn));
                true
            }
        }
    }

    /// Insert-if-absent. True when `conn` owns `token` afterwards.
    pub fn register_by_device_token(&self, token: &str, conn: &Arc<Connection>) -> bool {
        let mut owners = self.owners();
        match owners.by_device.get(token) {
            Some(existing) => existing.id() == conn.id(),
            None => {
                owners.by_device.insert(token.to_string(), Arc::clone(conn));
                true
            }
        }
    }

    /// Makes `conn` the owner of `uid`, returning the previous owner if it
    /// was a different connection. The caller must close it.
    pub fn claim_uid(&self, uid: i64, conn: &Arc<Connection>) -> Option<Arc<Connection>> {
        let previous = self.owners().by_uid.insert(uid, Arc::clone(conn));
        previous.filter(|prev| prev.id() != conn.id())
    }

    /// Device-token counterpart of [`Registry::claim_uid`].
    pub fn claim_device_token(&self, token: &str, conn: &Arc<Connection>) -> Option<Arc<Connection>> {
        let previous = self.owners().by_device.insert(token.to_string(), Arc::clone(conn));
        previous.filter(|prev| prev.id() != conn.id())
    }

    /// Removes `uid` and `token` from their maps, but only where `conn_id`
    /// still owns them. Idempotent; `0` / `""` are skipped.
    pub fn unregister(&self, uid: i64, token: &str, conn_id: u64) -> Released {
        let mut released = Released::default();
        let mut removed = Vec::with_capacity(2);
        {
            let mut owners = self.owners();
            if uid != 0 && owners.by_uid.get(&uid).is_some_and(|c| c.id() == conn_id) {
                removed.extend(owners.by_uid.remove(&uid));
                released.uid = true;
            }
            if !token.is_empty() && owners.by_device.get(token).is_some_and(|c| c.id() == conn_id) {
                removed.extend(owners.by_device.remove(token));
                released.device_token = true;
            }
        }
        drop(removed);
        released
    }

    /// Every distinct registered connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let owners = self.owners();
        let mut seen = HashSet::with_capacity(owners.by_uid.len());
        owners
            .by_uid
            .values()
            .chain(owners.by_device.values())
            .filter(|conn| seen.insert(conn.id()))
            .cloned()
            .collect()
    }

    pub fn uid_count(&self) -> usize {
        self.owners().by_uid.len()
    }

    pub fn device_count(&self) -> usize {
        self.owners().by_device.len()
    }

    pub fn is_empty(&self) -> bool {
        let owners = self.owners();
        owners.by_uid.is_empty() && owners.by_device.is_empty()
    }
}
