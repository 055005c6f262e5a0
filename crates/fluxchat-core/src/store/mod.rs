//! The shared replicated store seam.
//!
//! The engine treats the store as an opaque eventually-consistent
//! key-value/graph service: reads complete with whatever has arrived
//! within a bounded wait, writes are fire-and-forget from the caller's
//! point of view, and nothing assumes read-after-write consistency from
//! another device. Paths are `/`-separated strings; values are JSON.
//!
//! Writing [`serde_json::Value::Null`] to a path removes the record
//! (tombstone semantics, matching how the inbox retires entries).

mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Callback for value subscriptions.
pub type ValueCallback = Box<dyn Fn(Value) + Send + Sync>;

/// Callback for child subscriptions: `(child key, value)`.
pub type ChildCallback = Box<dyn Fn(&str, Value) + Send + Sync>;

/// The shared store collaborator.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read the value at a path, if any has replicated here yet.
    async fn read(&self, path: &str) -> Result<Option<Value>>;

    /// Write a value at a path. `Null` tombstones the record.
    async fn write(&self, path: &str, value: Value) -> Result<()>;

    /// Snapshot the direct children of a path as `(key, value)` pairs.
    async fn list(&self, path: &str) -> Result<Vec<(String, Value)>>;

    /// Observe every update to the value at a path.
    async fn subscribe(&self, path: &str, callback: ValueCallback) -> Result<Subscription>;

    /// Observe every update to any direct child of a path.
    async fn subscribe_children(&self, path: &str, callback: ChildCallback)
        -> Result<Subscription>;
}

/// Disposable handle for a store subscription.
///
/// Cancelling (or dropping) the handle stops delivery. Every handle must
/// be cancelled on logout; a leaked subscription is a resource bug.
pub struct Subscription {
    active: Arc<AtomicBool>,
}

impl Subscription {
    /// Create a handle around a shared active flag.
    pub fn new(active: Arc<AtomicBool>) -> Self {
        Self { active }
    }

    /// Stop delivery.
    pub fn cancel(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Whether the subscription still delivers.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Join path segments without doubling separators.
pub fn join_path(base: &str, child: &str) -> String {
    if base.is_empty() {
        child.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("inbox/abc", "m1"), "inbox/abc/m1");
        assert_eq!(join_path("inbox/abc/", "m1"), "inbox/abc/m1");
        assert_eq!(join_path("", "m1"), "m1");
    }

    #[test]
    fn test_subscription_cancel() {
        let sub = Subscription::new(Arc::new(AtomicBool::new(true)));
        assert!(sub.is_active());
        sub.cancel();
        assert!(!sub.is_active());
    }

    #[test]
    fn test_subscription_drop_cancels() {
        let flag = Arc::new(AtomicBool::new(true));
        {
            let _sub = Subscription::new(flag.clone());
        }
        assert!(!flag.load(Ordering::SeqCst));
    }
}
