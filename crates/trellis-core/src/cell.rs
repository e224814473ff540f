//! Reactive cell store.
//!
//! Cells hold JSON-encoded values behind typed handles. Per-session cells
//! keep their overrides inside the [`Session`] record, so the session owns
//! its values and persists them with itself. Writes go through a single
//! internal path that carries a mandatory [`Origin`]; subscribers are
//! notified synchronously, in registration order, after the store lock is
//! released.

use crate::session::{Session, SessionId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

pub type CellId = usize;
pub type SubscriptionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Session,
}

/// Where a write came from. Remote writes name the session whose client
/// sent them so the transport can skip echoing the value back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote(SessionId),
}

impl Origin {
    pub fn is_remote_from(&self, session_id: &str) -> bool {
        matches!(self, Origin::Remote(id) if id == session_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellError {
    #[error("cell {0} is not registered in this store")]
    InvalidCell(String),
    #[error("a cell named {name} is already declared")]
    DuplicateName { name: String },
    #[error("invalid cell name {name:?}")]
    InvalidName { name: String },
    #[error("cell {name} does not accept client writes")]
    NotSynced { name: String },
    #[error("cell {cell} value cannot be decoded: {reason}")]
    Decode { cell: String, reason: String },
    #[error("cell {cell} value cannot be encoded: {reason}")]
    Encode { cell: String, reason: String },
}

/// Typed handle to a declared cell. Only valid for the store that issued it.
pub struct Cell<T> {
    store_id: u64,
    id: CellId,
    name: Option<Arc<str>>,
    scope: Scope,
    marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            store_id: self.store_id,
            id: self.id,
            name: self.name.clone(),
            scope: self.scope,
            marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("scope", &self.scope)
            .finish()
    }
}

impl<T> Cell<T> {
    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    fn label(&self) -> String {
        self.name
            .as_deref()
            .map(str::to_string)
            .unwrap_or_else(|| anonymous_key(self.id))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CellChange {
    pub cell: CellId,
    pub name: Option<String>,
    pub scope: Scope,
    /// Set when the write landed in a session override.
    pub session: Option<SessionId>,
    pub value: Value,
    pub origin: Origin,
    pub synced: bool,
}

type Callback = Arc<dyn Fn(&CellChange) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    cell: Option<CellId>,
    callback: Callback,
}

struct Slot {
    name: Option<String>,
    scope: Scope,
    synced: bool,
    value: Value,
    /// Checks that a JSON value still decodes as the declared type.
    accepts: fn(&Value) -> Result<(), String>,
}

impl Slot {
    fn session_key(&self, id: CellId) -> String {
        self.name.clone().unwrap_or_else(|| anonymous_key(id))
    }
}

#[derive(Default)]
struct Registry {
    slots: Vec<Slot>,
    names: HashMap<String, CellId>,
}

pub struct CellStore {
    store_id: u64,
    registry: RwLock<Registry>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_subscription: AtomicU64,
}

impl Default for CellStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CellStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellStore")
            .field("store_id", &self.store_id)
            .field("cells", &self.read_registry().slots.len())
            .finish()
    }
}

enum Target<'a> {
    Shared,
    Session(&'a mut Session),
}

impl CellStore {
    pub fn new() -> Self {
        Self {
            store_id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            registry: RwLock::new(Registry::default()),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn declare<T: Serialize + DeserializeOwned>(
        &self,
        name: Option<&str>,
        initial: T,
        scope: Scope,
    ) -> Result<Cell<T>, CellError> {
        self.declare_inner(name, initial, scope, false)
    }

    /// Declares a named cell whose local changes are mirrored to clients.
    pub fn declare_synced<T: Serialize + DeserializeOwned>(
        &self,
        name: &str,
        initial: T,
        scope: Scope,
    ) -> Result<Cell<T>, CellError> {
        self.declare_inner(Some(name), initial, scope, true)
    }

    fn declare_inner<T: Serialize + DeserializeOwned>(
        &self,
        name: Option<&str>,
        initial: T,
        scope: Scope,
        synced: bool,
    ) -> Result<Cell<T>, CellError> {
        if let Some(name) = name {
            if name.trim().is_empty() || name.starts_with('#') {
                return Err(CellError::InvalidName {
                    name: name.to_string(),
                });
            }
        }
        let value = serde_json::to_value(&initial).map_err(|err| CellError::Encode {
            cell: name.unwrap_or("<anonymous>").to_string(),
            reason: err.to_string(),
        })?;

        let mut registry = self.write_registry();
        if let Some(name) = name {
            if let Some(&id) = registry.names.get(name) {
                let slot = &mut registry.slots[id];
                if slot.scope == Scope::Global || scope == Scope::Global {
                    return Err(CellError::DuplicateName {
                        name: name.to_string(),
                    });
                }
                // Re-declaring a session cell replaces its default in place.
                slot.value = value;
                slot.synced = synced;
                slot.accepts = decodes_as::<T>;
                return Ok(self.handle(id, Some(name), scope));
            }
        }

        let id = registry.slots.len();
        registry.slots.push(Slot {
            name: name.map(str::to_string),
            scope,
            synced,
            value,
            accepts: decodes_as::<T>,
        });
        if let Some(name) = name {
            registry.names.insert(name.to_string(), id);
        }
        Ok(self.handle(id, name, scope))
    }

    fn handle<T>(&self, id: CellId, name: Option<&str>, scope: Scope) -> Cell<T> {
        Cell {
            store_id: self.store_id,
            id,
            name: name.map(Arc::from),
            scope,
            marker: PhantomData,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<CellId> {
        self.read_registry().names.get(name).copied()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read_registry().names.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get<T: DeserializeOwned>(
        &self,
        cell: &Cell<T>,
        session: Option<&Session>,
    ) -> Result<T, CellError> {
        let value = self.get_value(cell, session)?;
        serde_json::from_value(value).map_err(|err| CellError::Decode {
            cell: cell.label(),
            reason: err.to_string(),
        })
    }

    pub fn get_value<T>(&self, cell: &Cell<T>, session: Option<&Session>) -> Result<Value, CellError> {
        self.check(cell)?;
        let registry = self.read_registry();
        let slot = &registry.slots[cell.id];
        if slot.scope == Scope::Session {
            if let Some(value) = session.and_then(|s| s.value(&slot.session_key(cell.id))) {
                return Ok(value.clone());
            }
        }
        Ok(slot.value.clone())
    }

    /// Returns whether the value changed. Takes ownership of a fresh value;
    /// arrays and objects always count as a change.
    pub fn set<T: Serialize>(
        &self,
        cell: &Cell<T>,
        session: Option<&mut Session>,
        value: T,
    ) -> Result<bool, CellError> {
        self.check(cell)?;
        let value = encode(cell, &value)?;
        self.write(cell.id, target(session), value, Origin::Local)
    }

    /// Read-modify-write under the store's writer lock for shared values.
    /// `f` must not call back into the store.
    pub fn update<T, F>(
        &self,
        cell: &Cell<T>,
        session: Option<&mut Session>,
        f: F,
    ) -> Result<bool, CellError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> T,
    {
        self.check(cell)?;
        let decode = |value: Value| {
            serde_json::from_value::<T>(value).map_err(|err| CellError::Decode {
                cell: cell.label(),
                reason: err.to_string(),
            })
        };

        let target = target(session);
        let change = {
            let mut registry = self.write_registry();
            let slot = &mut registry.slots[cell.id];
            match target {
                Target::Session(session) if slot.scope == Scope::Session => {
                    let key = slot.session_key(cell.id);
                    let current = session.value(&key).cloned().unwrap_or_else(|| slot.value.clone());
                    let next = encode(cell, &f(decode(current.clone())?))?;
                    if shallow_eq(&current, &next) {
                        return Ok(false);
                    }
                    session.set_value(&key, next.clone());
                    change_for(cell.id, slot, Some(session.id.clone()), next, Origin::Local)
                }
                _ => {
                    let next = encode(cell, &f(decode(slot.value.clone())?))?;
                    if shallow_eq(&slot.value, &next) {
                        return Ok(false);
                    }
                    slot.value = next.clone();
                    change_for(cell.id, slot, None, next, Origin::Local)
                }
            }
        };
        self.notify(&change);
        Ok(true)
    }

    /// Applies a value received from a client. Only synced cells accept
    /// these, and the value must decode as the cell's type. Subscribers see
    /// `Origin::Remote(session.id)`.
    pub fn apply_remote(
        &self,
        name: &str,
        session: &mut Session,
        value: Value,
    ) -> Result<bool, CellError> {
        let id = {
            let registry = self.read_registry();
            let id = *registry
                .names
                .get(name)
                .ok_or_else(|| CellError::InvalidCell(name.to_string()))?;
            let slot = &registry.slots[id];
            if !slot.synced {
                return Err(CellError::NotSynced {
                    name: name.to_string(),
                });
            }
            (slot.accepts)(&value).map_err(|reason| CellError::Decode {
                cell: name.to_string(),
                reason,
            })?;
            id
        };
        let origin = Origin::Remote(session.id.clone());
        self.write(id, Target::Session(session), value, origin)
    }

    fn write(
        &self,
        id: CellId,
        target: Target<'_>,
        value: Value,
        origin: Origin,
    ) -> Result<bool, CellError> {
        let change = {
            let mut registry = self.write_registry();
            let slot = registry
                .slots
                .get_mut(id)
                .ok_or_else(|| CellError::InvalidCell(anonymous_key(id)))?;
            match target {
                Target::Session(session) if slot.scope == Scope::Session => {
                    let key = slot.session_key(id);
                    let current = session.value(&key).unwrap_or(&slot.value);
                    if shallow_eq(current, &value) {
                        return Ok(false);
                    }
                    session.set_value(&key, value.clone());
                    change_for(id, slot, Some(session.id.clone()), value, origin)
                }
                _ => {
                    if shallow_eq(&slot.value, &value) {
                        return Ok(false);
                    }
                    slot.value = value.clone();
                    change_for(id, slot, None, value, origin)
                }
            }
        };
        self.notify(&change);
        Ok(true)
    }

    pub fn subscribe<T, F>(&self, cell: &Cell<T>, callback: F) -> Result<SubscriptionId, CellError>
    where
        F: Fn(&CellChange) + Send + Sync + 'static,
    {
        self.check(cell)?;
        Ok(self.add_subscriber(Some(cell.id), Arc::new(callback)))
    }

    /// Subscribes to every cell in the store; render triggers use this.
    pub fn subscribe_all<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&CellChange) + Send + Sync + 'static,
    {
        self.add_subscriber(None, Arc::new(callback))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != id);
        subscribers.len() != before
    }

    fn add_subscriber(&self, cell: Option<CellId>, callback: Callback) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber { id, cell, callback });
        id
    }

    fn notify(&self, change: &CellChange) {
        let callbacks: Vec<Callback> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|subscriber| subscriber.cell.map_or(true, |cell| cell == change.cell))
            .map(|subscriber| subscriber.callback.clone())
            .collect();
        for callback in callbacks {
            callback(change);
        }
    }

    fn check<T>(&self, cell: &Cell<T>) -> Result<(), CellError> {
        if cell.store_id != self.store_id || cell.id >= self.read_registry().slots.len() {
            return Err(CellError::InvalidCell(cell.label()));
        }
        Ok(())
    }

    fn read_registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn target(session: Option<&mut Session>) -> Target<'_> {
    match session {
        Some(session) => Target::Session(session),
        None => Target::Shared,
    }
}

fn change_for(
    id: CellId,
    slot: &Slot,
    session: Option<SessionId>,
    value: Value,
    origin: Origin,
) -> CellChange {
    CellChange {
        cell: id,
        name: slot.name.clone(),
        scope: slot.scope,
        session,
        value,
        origin,
        synced: slot.synced,
    }
}

fn encode<T: Serialize>(cell: &Cell<T>, value: &T) -> Result<Value, CellError> {
    serde_json::to_value(value).map_err(|err| CellError::Encode {
        cell: cell.label(),
        reason: err.to_string(),
    })
}

/// Primitives compare by value; arrays and objects are never equal, since a
/// write always hands over a fresh container.
fn shallow_eq(current: &Value, next: &Value) -> bool {
    match (current, next) {
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => false,
        (current, next) => current == next,
    }
}

fn decodes_as<T: DeserializeOwned>(value: &Value) -> Result<(), String> {
    <T as Deserialize>::deserialize(value).map(drop).map_err(|err| err.to_string())
}

fn anonymous_key(id: CellId) -> String {
    format!("#{id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::sync::Mutex;

    fn session(id: &str) -> Session {
        Session::with_id(id, Utc::now(), Duration::hours(1))
    }

    fn recorder(store: &CellStore) -> Arc<Mutex<Vec<CellChange>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.subscribe_all(move |change| sink.lock().unwrap().push(change.clone()));
        seen
    }

    #[test]
    fn per_session_counter_is_isolated() {
        let store = CellStore::new();
        let counter = store
            .declare(Some("counter"), 0i64, Scope::Session)
            .expect("declare");
        let mut s1 = session("s1");
        let s2 = session("s2");

        for _ in 0..2 {
            store
                .update(&counter, Some(&mut s1), |n| n + 1)
                .expect("increment");
        }

        assert_eq!(store.get(&counter, Some(&s1)).expect("get"), 2);
        assert_eq!(store.get(&counter, Some(&s2)).expect("get"), 0);
        assert_eq!(store.get(&counter, None).expect("get"), 0);
    }

    #[test]
    fn repeated_equal_write_notifies_once() {
        let store = CellStore::new();
        let label = store
            .declare(Some("label"), "a".to_string(), Scope::Session)
            .expect("declare");
        let seen = recorder(&store);
        let mut s1 = session("s1");

        assert!(store.set(&label, Some(&mut s1), "b".to_string()).expect("set"));
        assert!(!store.set(&label, Some(&mut s1), "b".to_string()).expect("set"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn containers_always_count_as_changed() {
        let store = CellStore::new();
        let items = store
            .declare(Some("items"), vec![1, 2], Scope::Global)
            .expect("declare");
        assert!(store.set(&items, None, vec![1, 2]).expect("set"));
        assert!(store.set(&items, None, vec![1, 2]).expect("set"));
    }

    #[test]
    fn subscribers_run_in_registration_order() {
        let store = CellStore::new();
        let flag = store
            .declare(Some("flag"), false, Scope::Global)
            .expect("declare");
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let order = order.clone();
            if label == "second" {
                store.subscribe_all(move |_| order.lock().unwrap().push(label));
            } else {
                store
                    .subscribe(&flag, move |_| order.lock().unwrap().push(label))
                    .expect("subscribe");
            }
        }
        store.set(&flag, None, true).expect("set");
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let store = CellStore::new();
        let flag = store.declare(None, 0u8, Scope::Global).expect("declare");
        let hits = Arc::new(Mutex::new(0));
        let sink = hits.clone();
        let id = store
            .subscribe(&flag, move |_| *sink.lock().unwrap() += 1)
            .expect("subscribe");
        store.set(&flag, None, 1).expect("set");
        assert!(store.unsubscribe(id));
        store.set(&flag, None, 2).expect("set");
        assert_eq!(*hits.lock().unwrap(), 1);
        assert!(!store.unsubscribe(id));
    }

    #[test]
    fn duplicate_global_names_are_rejected() {
        let store = CellStore::new();
        store
            .declare(Some("theme"), "dark".to_string(), Scope::Global)
            .expect("declare");
        let err = store
            .declare(Some("theme"), "light".to_string(), Scope::Global)
            .unwrap_err();
        assert_eq!(
            err,
            CellError::DuplicateName {
                name: "theme".to_string()
            }
        );
        assert!(store.declare(Some("theme"), 1, Scope::Session).is_err());
    }

    #[test]
    fn redeclared_session_cell_replaces_default() {
        let store = CellStore::new();
        let first = store
            .declare(Some("draft"), "a".to_string(), Scope::Session)
            .expect("declare");
        let second = store
            .declare(Some("draft"), "b".to_string(), Scope::Session)
            .expect("redeclare");
        assert_eq!(first.id(), second.id());
        assert_eq!(store.get(&first, None).expect("get"), "b".to_string());
        assert_eq!(store.names(), vec!["draft".to_string()]);
    }

    #[test]
    fn handles_from_another_store_fail_fast() {
        let store = CellStore::new();
        let other = CellStore::new();
        let foreign = other
            .declare(Some("count"), 0, Scope::Global)
            .expect("declare");
        assert!(matches!(
            store.set(&foreign, None, 1),
            Err(CellError::InvalidCell(_))
        ));
        assert!(matches!(store.get(&foreign, None), Err(CellError::InvalidCell(_))));
        assert!(matches!(
            store.declare(Some(""), 0, Scope::Global),
            Err(CellError::InvalidName { .. })
        ));
    }

    #[test]
    fn remote_writes_are_tagged_with_their_session() {
        let store = CellStore::new();
        let query = store
            .declare_synced("query", String::new(), Scope::Session)
            .expect("declare");
        let seen = recorder(&store);
        let mut s1 = session("s1");

        assert!(store
            .apply_remote("query", &mut s1, Value::from("rust"))
            .expect("remote"));
        store.set(&query, Some(&mut s1), "tokio".to_string()).expect("set");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].origin.is_remote_from("s1"));
        assert!(seen[0].synced);
        assert_eq!(seen[0].session.as_deref(), Some("s1"));
        assert_eq!(seen[1].origin, Origin::Local);
        assert!(matches!(
            store.apply_remote("missing", &mut s1, Value::Null),
            Err(CellError::InvalidCell(_))
        ));
    }

    #[test]
    fn client_writes_need_a_synced_cell_and_a_matching_type() {
        let store = CellStore::new();
        let banner = store
            .declare(Some("banner"), "hi".to_string(), Scope::Global)
            .expect("declare");
        let query = store
            .declare_synced("query", String::new(), Scope::Session)
            .expect("declare");
        let seen = recorder(&store);
        let mut s1 = session("s1");

        assert_eq!(
            store.apply_remote("banner", &mut s1, Value::from("pwned")),
            Err(CellError::NotSynced {
                name: "banner".to_string()
            })
        );
        assert!(matches!(
            store.apply_remote("query", &mut s1, Value::from(42)),
            Err(CellError::Decode { .. })
        ));

        assert_eq!(store.get(&banner, Some(&s1)).expect("get"), "hi");
        assert_eq!(store.get(&query, Some(&s1)).expect("get"), "");
        assert!(s1.values.is_empty());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn global_cells_ignore_session_and_count_every_update() {
        let store = Arc::new(CellStore::new());
        let visits = store
            .declare(Some("visits"), 0u64, Scope::Global)
            .expect("declare");
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let visits = visits.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        store.update(&visits, None, |n| n + 1).expect("update");
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let mut s1 = session("s1");
        store.set(&visits, Some(&mut s1), 1000).expect("set");
        assert!(s1.values.is_empty());
        assert_eq!(store.get(&visits, Some(&s1)).expect("get"), 1000);
    }

    #[test]
    fn anonymous_session_cells_use_reserved_keys() {
        let store = CellStore::new();
        let hidden = store.declare(None, 1, Scope::Session).expect("declare");
        let mut s1 = session("s1");
        store.set(&hidden, Some(&mut s1), 5).expect("set");
        assert_eq!(s1.value(&format!("#{}", hidden.id())), Some(&Value::from(5)));
    }
}
