//! Single-flight deduplication of concurrent requests for the same
//! normalized URL.
//!
//! The first request for a URL becomes the owner and registers a fan-out
//! channel; later requests join and await the owner's published result.
//! Deregistration happens in the owner guard's `Drop`, so the entry is
//! removed even when the owner's task errors or is cancelled.  This map
//! dedupes *within one process* only; cross-fleet refresh exclusivity is
//! the metadata store's refresh lock, a separate mechanism.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use super::ThumbResult;

type FanoutRx = watch::Receiver<Option<ThumbResult>>;

#[derive(Default)]
pub struct InflightMap {
    inner: Arc<Mutex<HashMap<String, FanoutRx>>>,
}

/// Either this request owns the fetch, or it joined one already running.
pub enum Flight {
    Owner(OwnerGuard),
    Joined(FanoutRx),
}

impl InflightMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `url`: the first caller becomes the owner,
    /// everyone else gets a receiver for the owner's result.
    pub fn join_or_own(&self, url: &str) -> Flight {
        // Entries are removed by guard Drop; a poisoned lock is recovered so
        // one panicked owner cannot wedge every later request.
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(rx) = map.get(url) {
            return Flight::Joined(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        map.insert(url.to_string(), rx);
        Flight::Owner(OwnerGuard {
            map: Arc::clone(&self.inner),
            url: url.to_string(),
            tx,
        })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// Held by the owning request for the duration of its fetch.
pub struct OwnerGuard {
    map: Arc<Mutex<HashMap<String, FanoutRx>>>,
    url: String,
    tx: watch::Sender<Option<ThumbResult>>,
}

impl OwnerGuard {
    /// Fan the finished result out to all joined waiters.
    pub fn publish(&self, result: ThumbResult) {
        let _ = self.tx.send(Some(result));
    }
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.url);
    }
}

/// Await the owner's result.  Returns `None` when the owner went away
/// without publishing (task panic or cancellation).
pub async fn await_result(mut rx: FanoutRx) -> Option<ThumbResult> {
    match rx.wait_for(|v| v.is_some()).await {
        Ok(value) => value.clone(),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheTier, ThumbResult};
    use bytes::Bytes;

    fn result(body: &'static [u8]) -> ThumbResult {
        ThumbResult {
            body: Bytes::from_static(body),
            content_type: "image/jpeg".to_string(),
            placeholder: false,
            cache: CacheTier::Miss,
            store: None,
            reason: None,
            attempts: 1,
            host: None,
            allowed: true,
            stale: false,
            refresh_spawned: false,
        }
    }

    #[tokio::test]
    async fn joiner_receives_owner_result() {
        let map = InflightMap::new();
        let Flight::Owner(owner) = map.join_or_own("u") else {
            panic!("expected owner");
        };
        let Flight::Joined(rx) = map.join_or_own("u") else {
            panic!("expected join");
        };

        let waiter = tokio::spawn(await_result(rx));
        owner.publish(result(b"abc"));
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.body.as_ref(), b"abc");
    }

    #[tokio::test]
    async fn owner_drop_deregisters_entry() {
        let map = InflightMap::new();
        let Flight::Owner(owner) = map.join_or_own("u") else {
            panic!("expected owner");
        };
        assert_eq!(map.len(), 1);
        drop(owner);
        assert_eq!(map.len(), 0);

        // Next request becomes a fresh owner.
        assert!(matches!(map.join_or_own("u"), Flight::Owner(_)));
    }

    #[tokio::test]
    async fn joiner_sees_none_when_owner_vanishes() {
        let map = InflightMap::new();
        let Flight::Owner(owner) = map.join_or_own("u") else {
            panic!("expected owner");
        };
        let Flight::Joined(rx) = map.join_or_own("u") else {
            panic!("expected join");
        };
        drop(owner);
        assert!(await_result(rx).await.is_none());
    }
}
