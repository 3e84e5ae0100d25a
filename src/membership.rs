//! Group and room membership, read by the dispatch tier when fanning out.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::TransportError;

#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Members of a group or room in insertion order. Unknown ids have no members.
    async fn get_members(&self, id: i64) -> Result<Vec<i64>, TransportError>;
}

/// Ordered member sets keyed by group/room id.
#[derive(Default)]
pub struct MemoryMembership {
    groups: DashMap<i64, Vec<i64>>,
}

impl MemoryMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `{ "<groupId>": [uid, ...] }`.
    pub fn load_json(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)?;
        let raw: HashMap<String, Vec<i64>> = serde_json::from_str(&data)?;
        let membership = Self::new();
        for (id, members) in raw {
            let id: i64 = id.parse()?;
            membership.set_members(id, members);
        }
        Ok(membership)
    }

    pub fn set_members(&self, id: i64, members: impl IntoIterator<Item = i64>) {
        let mut ordered = Vec::new();
        for m in members {
            if !ordered.contains(&m) {
                ordered.push(m);
            }
        }
        self.groups.insert(id, ordered);
    }

    /// Returns false if `member` was already present.
    pub fn add_member(&self, id: i64, member: i64) -> bool {
        let mut entry = self.groups.entry(id).or_default();
        if entry.contains(&member) {
            return false;
        }
        entry.push(member);
        true
    }

    pub fn remove_member(&self, id: i64, member: i64) -> bool {
        match self.groups.get_mut(&id) {
            Some(mut members) => {
                let before = members.len();
                members.retain(|m| *m != member);
                members.len() != before
            }
            None => false,
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

#[async_trait]
impl MembershipStore for MemoryMembership {
    async fn get_members(&self, id: i64) -> Result<Vec<i64>, TransportError> {
        Ok(self.groups.get(&id).map(|m| m.value().clone()).unwrap_or_default())
    }
}
