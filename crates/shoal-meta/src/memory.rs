use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::types::{MetaOp, MetaStore, MetaTxn, WatchEvent, WatchStream};

/// In-process store with etcd-like revision semantics. Used by tests and by
/// single-node deployments started with `--store memory`.
#[derive(Debug, Clone)]
pub struct MemoryMetaStore {
    inner: Arc<RwLock<Inner>>,
    tx: broadcast::Sender<WatchEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, (Vec<u8>, u64)>,
}

impl Inner {
    fn current_revision(&self, key: &str) -> u64 {
        self.kv.get(key).map(|(_, rev)| *rev).unwrap_or(0)
    }

    /// Checks every guard, then applies all ops under one new revision, as
    /// etcd does. `None` leaves the map untouched.
    fn apply(&mut self, txn: MetaTxn) -> Option<(u64, Vec<WatchEvent>)> {
        if txn
            .guards
            .iter()
            .any(|(key, expected)| self.current_revision(key) != *expected)
        {
            return None;
        }

        self.revision = self.revision.saturating_add(1);
        let rev = self.revision;
        let mut events = Vec::with_capacity(txn.ops.len());
        for op in txn.ops {
            match op {
                MetaOp::Put { key, value } => {
                    self.kv.insert(key.clone(), (value.clone(), rev));
                    events.push(WatchEvent {
                        key,
                        value: Some(value),
                        revision: rev,
                    });
                }
                MetaOp::Delete { key } => {
                    // deleting an absent key is a no-op and emits nothing
                    if self.kv.remove(&key).is_some() {
                        events.push(WatchEvent {
                            key,
                            value: None,
                            revision: rev,
                        });
                    }
                }
            }
        }
        Some((rev, events))
    }
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            tx,
        }
    }

    fn emit(&self, events: Vec<WatchEvent>) {
        for event in events {
            // no subscribers is fine
            let _ = self.tx.send(event);
        }
    }
}

impl Default for MemoryMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MetaStore for MemoryMetaStore {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        Ok(inner.kv.get(key).map(|(v, rev)| (v.clone(), *rev)))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, rev))| (k.clone(), v.clone(), *rev))
            .collect())
    }

    async fn compare_and_swap(&self, key: &str, expected_revision: u64, value: Vec<u8>) -> Result<(bool, u64)> {
        let txn = MetaTxn::new().guard(key, expected_revision).put(key, value);
        let applied = {
            let mut inner = self.inner.write().await;
            match inner.apply(txn) {
                Some(done) => done,
                None => return Ok((false, inner.current_revision(key))),
            }
        };
        let (rev, events) = applied;
        self.emit(events);
        Ok((true, rev))
    }

    async fn commit(&self, txn: MetaTxn) -> Result<Option<u64>> {
        let applied = self.inner.write().await.apply(txn);
        Ok(applied.map(|(rev, events)| {
            self.emit(events);
            rev
        }))
    }

    async fn watch_prefix(&self, prefix: &str, start_revision_exclusive: Option<u64>) -> Result<WatchStream> {
        let prefix = prefix.to_string();
        let min_rev = start_revision_exclusive.unwrap_or(0);
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(move |msg| {
            // a lagged receiver drops the missed events; watchers resync on
            // their periodic pass
            msg.ok()
                .filter(|ev| ev.revision > min_rev && ev.key.starts_with(&prefix))
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(store: &MemoryMetaStore, key: &str, value: &[u8]) -> u64 {
        store
            .commit(MetaTxn::new().put(key, value.to_vec()))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_cas_on_absent_key_uses_zero_revision() {
        let store = MemoryMetaStore::new();
        let (ok, rev) = store.compare_and_swap("/a", 0, b"1".to_vec()).await.unwrap();
        assert!(ok);
        assert!(rev > 0);

        // stale expectation is rejected and reports the current revision
        let (ok, current) = store.compare_and_swap("/a", 0, b"2".to_vec()).await.unwrap();
        assert!(!ok);
        assert_eq!(current, rev);
        assert_eq!(store.get("/a").await.unwrap().unwrap().0, b"1".to_vec());
    }

    #[tokio::test]
    async fn test_commit_applies_all_or_nothing() {
        let store = MemoryMetaStore::new();
        let rev_a = seed(&store, "/a", b"a").await;

        let txn = MetaTxn::new()
            .guard("/a", rev_a)
            .guard("/b", 0)
            .put("/a", b"a2".to_vec())
            .put("/b", b"b".to_vec());
        let committed = store.commit(txn).await.unwrap().unwrap();
        assert_eq!(store.get("/a").await.unwrap().unwrap().1, committed);
        assert_eq!(store.get("/b").await.unwrap().unwrap(), (b"b".to_vec(), committed));

        // second attempt with the old revision of /a must not touch /c
        let txn = MetaTxn::new()
            .guard("/a", rev_a)
            .put("/c", b"c".to_vec());
        assert!(store.commit(txn).await.unwrap().is_none());
        assert!(store.get("/c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_delete_and_list_prefix() {
        let store = MemoryMetaStore::new();
        let rev = seed(&store, "/x/1", b"1").await;
        seed(&store, "/x/2", b"2").await;
        seed(&store, "/y/1", b"3").await;

        let txn = MetaTxn::new().guard("/x/1", rev).delete("/x/1");
        assert!(store.commit(txn).await.unwrap().is_some());

        let keys: Vec<String> = store
            .list_prefix("/x/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _, _)| k)
            .collect();
        assert_eq!(keys, vec!["/x/2".to_string()]);
    }

    #[tokio::test]
    async fn test_watch_prefix_filters_by_prefix() {
        let store = MemoryMetaStore::new();
        let mut stream = store.watch_prefix("/deployments/", None).await.unwrap();

        seed(&store, "/workers/w1", b"w").await;
        let rev = seed(&store, "/deployments/d1", b"d").await;

        let ev = stream.next().await.unwrap();
        assert_eq!(ev.key, "/deployments/d1");
        assert_eq!(ev.value, Some(b"d".to_vec()));

        store
            .commit(MetaTxn::new().guard("/deployments/d1", rev).delete("/deployments/d1"))
            .await
            .unwrap();
        let ev = stream.next().await.unwrap();
        assert_eq!(ev.key, "/deployments/d1");
        assert!(ev.value.is_none());
    }
}
