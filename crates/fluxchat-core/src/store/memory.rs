//! In-process store implementation.
//!
//! Backs tests and two-client simulations: multiple engines holding the
//! same `MemoryStore` behave like peers sharing one replica. Supports
//! fault injection (`set_unavailable`) so callers can exercise the
//! store-outage retry paths.

use super::{join_path, ChildCallback, SharedStore, Subscription, ValueCallback};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

enum Watcher {
    Value {
        path: String,
        callback: Arc<dyn Fn(Value) + Send + Sync>,
    },
    Children {
        parent: String,
        callback: Arc<dyn Fn(&str, Value) + Send + Sync>,
    },
}

struct Registered {
    active: Arc<AtomicBool>,
    watcher: Watcher,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, Value>,
    watchers: HashMap<u64, Registered>,
}

/// Shared in-memory store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    next_id: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
}

enum Pending {
    Value(Arc<dyn Fn(Value) + Send + Sync>),
    Child(Arc<dyn Fn(&str, Value) + Send + Sync>, String),
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate a store outage. While unavailable, every operation
    /// fails with [`Error::StoreUnavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of live (non-tombstoned) records. Test helper.
    pub fn record_count(&self) -> usize {
        match self.inner.lock() {
            Ok(inner) => inner.records.len(),
            Err(_) => 0,
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("simulated outage".into()));
        }
        Ok(())
    }

    fn register(&self, watcher: Watcher) -> Subscription {
        let active = Arc::new(AtomicBool::new(true));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut inner) = self.inner.lock() {
            inner.watchers.insert(
                id,
                Registered {
                    active: active.clone(),
                    watcher,
                },
            );
        }
        Subscription::new(active)
    }

    /// Collect callbacks matching a path while locked; invoke unlocked,
    /// so a callback may call back into the store without deadlocking.
    fn matching_watchers(inner: &mut Inner, path: &str) -> Vec<Pending> {
        inner
            .watchers
            .retain(|_, w| w.active.load(Ordering::SeqCst));

        let (parent, key) = match path.rsplit_once('/') {
            Some((p, k)) => (p, k),
            None => ("", path),
        };

        inner
            .watchers
            .values()
            .filter_map(|registered| match &registered.watcher {
                Watcher::Value { path: p, callback } if p == path => {
                    Some(Pending::Value(callback.clone()))
                }
                Watcher::Children {
                    parent: p,
                    callback,
                } if p == parent => Some(Pending::Child(callback.clone(), key.to_string())),
                _ => None,
            })
            .collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn read(&self, path: &str) -> Result<Option<Value>> {
        self.check_available()?;
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::Storage("store lock poisoned".into()))?;
        Ok(inner.records.get(path).cloned())
    }

    async fn write(&self, path: &str, value: Value) -> Result<()> {
        self.check_available()?;

        let pending = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| Error::Storage("store lock poisoned".into()))?;

            if value.is_null() {
                inner.records.remove(path);
            } else {
                inner.records.insert(path.to_string(), value.clone());
            }

            Self::matching_watchers(&mut inner, path)
        };

        for watcher in pending {
            match watcher {
                Pending::Value(cb) => cb(value.clone()),
                Pending::Child(cb, key) => cb(&key, value.clone()),
            }
        }

        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<(String, Value)>> {
        self.check_available()?;
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::Storage("store lock poisoned".into()))?;

        let prefix = format!("{}/", join_path(path, "").trim_end_matches('/'));
        let mut children: Vec<(String, Value)> = inner
            .records
            .iter()
            .filter_map(|(k, v)| {
                let rest = k.strip_prefix(&prefix)?;
                // Direct children only.
                if rest.contains('/') {
                    return None;
                }
                Some((rest.to_string(), v.clone()))
            })
            .collect();
        children.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(children)
    }

    async fn subscribe(&self, path: &str, callback: ValueCallback) -> Result<Subscription> {
        Ok(self.register(Watcher::Value {
            path: path.to_string(),
            callback: Arc::from(callback),
        }))
    }

    async fn subscribe_children(
        &self,
        path: &str,
        callback: ChildCallback,
    ) -> Result<Subscription> {
        Ok(self.register(Watcher::Children {
            parent: path.trim_end_matches('/').to_string(),
            callback: Arc::from(callback),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_write_read() {
        let store = MemoryStore::new();

        store
            .write("presence/abc", json!({"status": "online"}))
            .await
            .unwrap();

        let value = store.read("presence/abc").await.unwrap().unwrap();
        assert_eq!(value["status"], "online");
        assert!(store.read("presence/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_null_tombstones() {
        let store = MemoryStore::new();

        store.write("inbox/a/m1", json!({"id": "m1"})).await.unwrap();
        store.write("inbox/a/m1", Value::Null).await.unwrap();

        assert!(store.read("inbox/a/m1").await.unwrap().is_none());
        assert_eq!(store.record_count(), 0);
    }

    #[tokio::test]
    async fn test_list_direct_children_only() {
        let store = MemoryStore::new();

        store.write("conv/c1/m1", json!(1)).await.unwrap();
        store.write("conv/c1/m2", json!(2)).await.unwrap();
        store.write("conv/c1/m2/deep", json!(3)).await.unwrap();
        store.write("conv/c2/m3", json!(4)).await.unwrap();

        let children = store.list("conv/c1").await.unwrap();
        let keys: Vec<_> = children.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_subscribe_value() {
        let store = MemoryStore::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = hits.clone();
        let sub = store
            .subscribe(
                "presence/abc",
                Box::new(move |_| {
                    hits2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        store.write("presence/abc", json!(1)).await.unwrap();
        store.write("presence/other", json!(2)).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        sub.cancel();
        store.write("presence/abc", json!(3)).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribe_children() {
        let store = MemoryStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen2 = seen.clone();
        let _sub = store
            .subscribe_children(
                "inbox/bob",
                Box::new(move |key, _| {
                    seen2.lock().unwrap().push(key.to_string());
                }),
            )
            .await
            .unwrap();

        store.write("inbox/bob/m1", json!(1)).await.unwrap();
        store.write("inbox/alice/m2", json!(2)).await.unwrap();
        store.write("inbox/bob/m3", json!(3)).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["m1", "m3"]);
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        assert!(matches!(
            store.write("x", json!(1)).await,
            Err(Error::StoreUnavailable(_))
        ));
        assert!(matches!(
            store.read("x").await,
            Err(Error::StoreUnavailable(_))
        ));

        store.set_unavailable(false);
        store.write("x", json!(1)).await.unwrap();
    }
}
