//! Named tunables with subscribe/notify listeners
//!
//! The runtime consumes a small set of live-updatable settings (coroutine
//! stack size, default connect timeout). Each is a [`ConfigVar`] looked up by
//! dotted name from a process-wide registry. Values can be seeded from the
//! environment at first lookup (`tcp.connect.timeout` reads
//! `SILK_TCP_CONNECT_TIMEOUT`) and changed at runtime via [`ConfigVar::set`],
//! which notifies every registered listener with `(old, new)`.

use std::any::Any;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

type ListenerFn<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// A single named configuration value
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<HashMap<u64, ListenerFn<T>>>,
    next_listener_id: AtomicU64,
}

impl<T> ConfigVar<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn new(name: &str, default: T, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            value: RwLock::new(default),
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Current value (cloned)
    pub fn get(&self) -> T {
        self.value.read().unwrap().clone()
    }

    /// Replace the value, notifying listeners with `(old, new)`.
    ///
    /// Setting an equal value is a no-op and notifies nobody.
    pub fn set(&self, new: T) {
        let old = {
            let mut guard = self.value.write().unwrap();
            if *guard == new {
                return;
            }
            let old = guard.clone();
            *guard = new.clone();
            old
        };

        let listeners: Vec<ListenerFn<T>> =
            self.listeners.lock().unwrap().values().cloned().collect();
        for cb in listeners {
            cb(&old, &new);
        }
    }

    /// Register a change listener; returns an id for [`remove_listener`].
    ///
    /// [`remove_listener`]: ConfigVar::remove_listener
    pub fn add_listener<F>(&self, cb: F) -> u64
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().unwrap().insert(id, Arc::new(cb));
        id
    }

    pub fn remove_listener(&self, id: u64) {
        self.listeners.lock().unwrap().remove(&id);
    }
}

fn registry() -> &'static Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// `tcp.connect.timeout` -> `SILK_TCP_CONNECT_TIMEOUT`
fn env_key(name: &str) -> String {
    let mut key = String::from("SILK_");
    for ch in name.chars() {
        match ch {
            '.' | '-' => key.push('_'),
            c => key.push(c.to_ascii_uppercase()),
        }
    }
    key
}

/// Look up a config variable by name, creating it on first use.
///
/// On creation the environment is consulted: a parseable value under the
/// variable's `SILK_*` key overrides `default`. Subsequent lookups return the
/// registered instance; `default`/`description` are then ignored.
pub fn lookup<T>(name: &str, default: T, description: &str) -> Arc<ConfigVar<T>>
where
    T: Clone + PartialEq + FromStr + Send + Sync + 'static,
{
    let mut reg = registry().lock().unwrap();

    if let Some(existing) = reg.get(name) {
        match existing.clone().downcast::<ConfigVar<T>>() {
            Ok(var) => return var,
            Err(_) => {
                kerror!("config: lookup of '{}' with mismatched type", name);
                // Fall through and hand back an unregistered variable so the
                // caller still gets a usable default.
                return Arc::new(ConfigVar::new(name, default, description));
            }
        }
    }

    let mut initial = default;
    if let Ok(raw) = std::env::var(env_key(name)) {
        match raw.parse::<T>() {
            Ok(v) => initial = v,
            Err(_) => kwarn!("config: unparseable {}='{}' ignored", env_key(name), raw),
        }
    }

    let var = Arc::new(ConfigVar::new(name, initial, description));
    let erased: Arc<dyn Any + Send + Sync> = var.clone();
    reg.insert(name.to_string(), erased);
    var
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_lookup_returns_same_instance() {
        let a = lookup::<u64>("test.lookup.same", 7, "test");
        let b = lookup::<u64>("test.lookup.same", 99, "ignored");
        assert_eq!(b.get(), 7);
        a.set(11);
        assert_eq!(b.get(), 11);
    }

    #[test]
    fn test_listeners_see_old_and_new() {
        let var = lookup::<u64>("test.listener", 5, "test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        var.add_listener(move |old, new| {
            seen2.lock().unwrap().push((*old, *new));
        });

        var.set(5); // equal value: no notification
        var.set(8);
        var.set(13);

        assert_eq!(*seen.lock().unwrap(), vec![(5, 8), (8, 13)]);
    }

    #[test]
    fn test_remove_listener() {
        let var = lookup::<u32>("test.listener.remove", 0, "test");
        let count = Arc::new(AtomicU32::new(0));
        let count2 = count.clone();
        let id = var.add_listener(move |_, _| {
            count2.fetch_add(1, Ordering::Relaxed);
        });

        var.set(1);
        var.remove_listener(id);
        var.set(2);

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_env_key_mapping() {
        assert_eq!(env_key("coroutine.stack_size"), "SILK_COROUTINE_STACK_SIZE");
        assert_eq!(env_key("tcp.connect.timeout"), "SILK_TCP_CONNECT_TIMEOUT");
    }
}
