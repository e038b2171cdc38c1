use std::sync::Arc;

use anyhow::Result;
use etcd_client::{
    Client, Compare, CompareOp, Event, EventType, GetOptions, ResponseHeader, Txn, TxnOp, WatchOptions,
};
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;

use crate::types::{MetaOp, MetaStore, MetaTxn, WatchEvent, WatchStream};

/// Buffered watch events per subscriber before the forwarder backs off.
const WATCH_BUFFER: usize = 1024;

/// `MetaStore` backed by etcd. Mod revisions double as the optimistic
/// version of every record.
#[derive(Clone)]
pub struct EtcdMetaStore {
    client: Arc<Mutex<Client>>,
}

impl EtcdMetaStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let c = Client::connect(endpoints, None).await?;
        Ok(Self {
            client: Arc::new(Mutex::new(c)),
        })
    }

    /// Runs a guarded transaction. `Some(revision)` when every guard held.
    async fn guarded(&self, guards: &[(String, u64)], ops: Vec<TxnOp>) -> Result<Option<u64>> {
        let compares: Vec<Compare> = guards
            .iter()
            .map(|(key, rev)| Compare::mod_revision(key.as_str(), CompareOp::Equal, *rev as i64))
            .collect();
        let txn = Txn::new().when(compares).and_then(ops).or_else([]);

        let resp = self.client.lock().await.txn(txn).await?;
        Ok(resp.succeeded().then(|| header_revision(resp.header())))
    }
}

fn header_revision(header: Option<&ResponseHeader>) -> u64 {
    header.map(|h| h.revision()).unwrap_or_default() as u64
}

fn to_watch_event(ev: &Event) -> Option<WatchEvent> {
    let kv = ev.kv()?;
    let value = match ev.event_type() {
        EventType::Put => Some(kv.value().to_vec()),
        EventType::Delete => None,
    };
    Some(WatchEvent {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value,
        revision: kv.mod_revision() as u64,
    })
}

#[async_trait::async_trait]
impl MetaStore for EtcdMetaStore {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let resp = self.client.lock().await.get(key, None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| (kv.value().to_vec(), kv.mod_revision() as u64)))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let opts = GetOptions::new().with_prefix();
        let resp = self.client.lock().await.get(prefix, Some(opts)).await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).into_owned(),
                    kv.value().to_vec(),
                    kv.mod_revision() as u64,
                )
            })
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)> {
        let guards = [(key.to_string(), expected_revision)];
        if let Some(rev) = self.guarded(&guards, vec![TxnOp::put(key, value, None)]).await? {
            return Ok((true, rev));
        }

        // lost: report the revision that beat us, 0 when the key is gone
        let current = self
            .get(key)
            .await?
            .map(|(_, rev)| rev)
            .unwrap_or(0);
        Ok((false, current))
    }

    async fn commit(&self, txn: MetaTxn) -> Result<Option<u64>> {
        let ops: Vec<TxnOp> = txn
            .ops
            .into_iter()
            .map(|op| match op {
                MetaOp::Put { key, value } => TxnOp::put(key, value, None),
                MetaOp::Delete { key } => TxnOp::delete(key, None),
            })
            .collect();
        self.guarded(&txn.guards, ops).await
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision_exclusive: Option<u64>,
    ) -> Result<WatchStream> {
        let mut opts = WatchOptions::new().with_prefix();
        if let Some(min_rev) = start_revision_exclusive {
            // etcd start_revision is inclusive
            opts = opts.with_start_revision(min_rev.saturating_add(1) as i64);
        }
        let (_watcher, mut stream) = self.client.lock().await.watch(prefix, Some(opts)).await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<WatchEvent>(WATCH_BUFFER);
        tokio::spawn(async move {
            // Ends on a stream error or once the subscriber is dropped; the
            // caller re-opens the watch.
            while let Ok(Some(resp)) = stream.message().await {
                for event in resp.events().iter().filter_map(to_watch_event) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
