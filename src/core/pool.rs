//! CR-011: Pools, named sets of instances persisted in the `pools` store.
//!
//! Members are keyed by a generated UUID but behave as a set by owning stack
//! and instance name: instance names are only unique inside a stack, so two
//! stacks can each place their own `web01` in the same pool. Pools outlive
//! the stacks that filled them and are only deleted once empty.

use super::error::PersistenceError;
use super::store::{ensure, Document, DocumentStore};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Store holding every pool.
pub const POOLS_STORE: &str = "pools";

/// Lifecycle state of a pool member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    Declared,
    Provisioned,
}

/// One pool member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolInstance {
    pub id: String,

    /// Stack the instance belongs to
    pub stack: String,
    pub name: String,
    pub state: MemberState,

    #[serde(default)]
    pub config: Value,
}

impl PoolInstance {
    fn is(&self, stack: &str, name: &str) -> bool {
        self.stack == stack && self.name == name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,

    /// Members keyed by instance id
    #[serde(default)]
    pub members: IndexMap<String, PoolInstance>,
}

impl Document for Pool {
    fn id(&self) -> &str {
        &self.name
    }
}

impl Pool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: IndexMap::new(),
        }
    }

    pub fn contains(&self, stack: &str, instance: &str) -> bool {
        self.members.values().any(|m| m.is(stack, instance))
    }

    /// Add `instance` of `stack`. Returns false if it is already a member.
    pub fn add(&mut self, stack: &str, instance: &str, state: MemberState, config: Value) -> bool {
        if self.contains(stack, instance) {
            return false;
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.members.insert(
            id.clone(),
            PoolInstance {
                id,
                stack: stack.to_string(),
                name: instance.to_string(),
                state,
                config,
            },
        );
        true
    }

    /// Drop `instance` of `stack`. Returns true if something was dropped.
    pub fn remove_member(&mut self, stack: &str, instance: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|_, m| !m.is(stack, instance));
        self.members.len() != before
    }

    pub fn names(&self) -> Vec<&str> {
        self.members.values().map(|m| m.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }
}

/// Access to the `pools` store.
pub struct Pools {
    store: DocumentStore<Pool>,
}

impl Pools {
    pub fn open(directory: &Path) -> Self {
        Self {
            store: DocumentStore::open(directory, POOLS_STORE),
        }
    }

    pub fn get(&self, name: &str) -> Option<Pool> {
        self.store.get(name)
    }

    pub fn list(&self) -> Vec<Pool> {
        self.store.items()
    }

    /// Fetch the pool `name`, creating it empty if missing.
    pub fn create(&self, name: &str) -> Result<Pool, PersistenceError> {
        if let Some(pool) = self.store.get(name) {
            return Ok(pool);
        }
        let pool = Pool::new(name);
        ensure(self.store.add(&pool), POOLS_STORE, "add")?;
        Ok(pool)
    }

    /// Add `instance` of `stack` to pool `name`, creating the pool if needed.
    /// Returns false if the instance was already a member.
    pub fn add_instance(
        &self,
        name: &str,
        stack: &str,
        instance: &str,
        state: MemberState,
        config: Value,
    ) -> Result<bool, PersistenceError> {
        let mut pool = self.create(name)?;
        if !pool.add(stack, instance, state, config) {
            return Ok(false);
        }
        ensure(self.store.update(name, &pool), POOLS_STORE, "update")?;
        tracing::debug!(pool = name, stack, instance, "pool member added");
        Ok(true)
    }

    /// Delete pool `name`; the store goes with its last pool.
    pub fn delete(&self, name: &str) -> Result<(), PersistenceError> {
        ensure(self.store.remove(name), POOLS_STORE, "remove")?;
        self.store.remove_persistence_if_empty();
        Ok(())
    }

    /// Drop the `removed` instances of `stack` from every pool, deleting
    /// pools left empty. Members of other stacks are never touched.
    /// Returns the names of pools that changed.
    pub fn reconcile_removed(
        &self,
        stack: &str,
        removed: &[String],
    ) -> Result<Vec<String>, PersistenceError> {
        let mut changed = Vec::new();
        if removed.is_empty() || !self.store.exists() {
            return Ok(changed);
        }
        for mut pool in self.store.items() {
            let mut touched = false;
            for instance in removed {
                touched |= pool.remove_member(stack, instance);
            }
            if !touched {
                continue;
            }
            if pool.is_empty() {
                ensure(self.store.remove(&pool.name), POOLS_STORE, "remove")?;
                tracing::info!(pool = %pool.name, "empty pool deleted");
            } else {
                ensure(self.store.update(&pool.name, &pool), POOLS_STORE, "update")?;
            }
            changed.push(pool.name);
        }
        if self.store.exists() {
            self.store.remove_persistence_if_empty();
        }
        Ok(changed)
    }

    pub fn store(&self) -> &DocumentStore<Pool> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cr011_pool_is_set_by_stack_and_name() {
        let mut pool = Pool::new("web");
        assert!(pool.add("s1", "web01", MemberState::Provisioned, json!({})));
        assert!(!pool.add("s1", "web01", MemberState::Declared, json!({})));
        assert!(pool.add("s1", "web02", MemberState::Provisioned, Value::Null));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.names(), vec!["web01", "web02"]);

        let member = pool.members.values().next().unwrap();
        assert!(uuid::Uuid::parse_str(&member.id).is_ok());
        assert_eq!(pool.members.get(&member.id).unwrap().name, "web01");
    }

    #[test]
    fn test_cr011_same_name_from_two_stacks() {
        let mut pool = Pool::new("shared");
        assert!(pool.add("s1", "web01", MemberState::Provisioned, Value::Null));
        assert!(pool.add("s2", "web01", MemberState::Provisioned, Value::Null));
        assert_eq!(pool.len(), 2);
        assert!(pool.contains("s2", "web01"));

        assert!(pool.remove_member("s1", "web01"));
        assert!(!pool.contains("s1", "web01"));
        assert!(pool.contains("s2", "web01"));
    }

    #[test]
    fn test_cr011_remove_member() {
        let mut pool = Pool::new("web");
        pool.add("s1", "a", MemberState::Provisioned, Value::Null);
        assert!(!pool.remove_member("s2", "a"));
        assert!(pool.remove_member("s1", "a"));
        assert!(!pool.remove_member("s1", "a"));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_cr011_member_state_serde() {
        let s = serde_json::to_string(&MemberState::Provisioned).unwrap();
        assert_eq!(s, "\"provisioned\"");
    }

    #[test]
    fn test_cr011_add_instance_creates_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pools = Pools::open(dir.path());
        assert!(pools.get("web").is_none());
        assert!(pools
            .add_instance("web", "s1", "web01", MemberState::Provisioned, json!({"id": "i-1"}))
            .unwrap());
        assert!(!pools
            .add_instance("web", "s1", "web01", MemberState::Provisioned, Value::Null)
            .unwrap());
        let pool = pools.get("web").unwrap();
        assert_eq!(pool.names(), vec!["web01"]);
        assert_eq!(pool.members.values().next().unwrap().stack, "s1");
        assert_eq!(pools.list().len(), 1);
    }

    #[test]
    fn test_cr011_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pools = Pools::open(dir.path());
        pools.add_instance("db", "s1", "db01", MemberState::Declared, Value::Null).unwrap();
        let pool = pools.create("db").unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_cr011_reconcile_keeps_unrelated_members() {
        let dir = tempfile::tempdir().unwrap();
        let pools = Pools::open(dir.path());
        pools.add_instance("web", "s1", "a", MemberState::Provisioned, Value::Null).unwrap();
        pools.add_instance("web", "s1", "b", MemberState::Provisioned, Value::Null).unwrap();
        pools.add_instance("db", "s1", "c", MemberState::Provisioned, Value::Null).unwrap();

        let changed = pools.reconcile_removed("s1", &["a".to_string()]).unwrap();
        assert_eq!(changed, vec!["web"]);
        assert_eq!(pools.get("web").unwrap().names(), vec!["b"]);
        assert_eq!(pools.get("db").unwrap().names(), vec!["c"]);
    }

    #[test]
    fn test_cr011_reconcile_ignores_other_stacks() {
        let dir = tempfile::tempdir().unwrap();
        let pools = Pools::open(dir.path());
        pools.add_instance("p1", "s1", "web01", MemberState::Provisioned, Value::Null).unwrap();
        pools.add_instance("p2", "s2", "web01", MemberState::Provisioned, Value::Null).unwrap();
        pools.add_instance("shared", "s1", "web01", MemberState::Provisioned, Value::Null).unwrap();
        pools.add_instance("shared", "s2", "web01", MemberState::Provisioned, Value::Null).unwrap();

        let mut changed = pools.reconcile_removed("s1", &["web01".to_string()]).unwrap();
        changed.sort();
        assert_eq!(changed, vec!["p1", "shared"]);
        assert!(pools.get("p1").is_none());
        assert!(pools.get("p2").unwrap().contains("s2", "web01"));
        let shared = pools.get("shared").unwrap();
        assert_eq!(shared.len(), 1);
        assert!(shared.contains("s2", "web01"));
    }

    #[test]
    fn test_cr011_reconcile_deletes_empty_pools_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let pools = Pools::open(dir.path());
        pools.add_instance("web", "s1", "a", MemberState::Provisioned, Value::Null).unwrap();
        pools.add_instance("db", "s1", "b", MemberState::Provisioned, Value::Null).unwrap();

        pools.reconcile_removed("s1", &["a".to_string()]).unwrap();
        assert!(pools.get("web").is_none());
        assert!(pools.store().exists());

        pools.reconcile_removed("s1", &["b".to_string()]).unwrap();
        assert!(!pools.store().exists());
        assert!(!pools.store().lock_path().exists());
    }

    #[test]
    fn test_cr011_reconcile_without_store_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let pools = Pools::open(dir.path());
        assert!(pools.reconcile_removed("s1", &["a".to_string()]).unwrap().is_empty());
        assert!(!pools.store().exists());
    }

    #[test]
    fn test_cr011_delete_last_pool_removes_store() {
        let dir = tempfile::tempdir().unwrap();
        let pools = Pools::open(dir.path());
        pools.create("web").unwrap();
        pools.delete("web").unwrap();
        assert!(!pools.store().exists());
        assert!(pools.delete("web").is_err());
    }
}
