use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub revision: u64,
}

pub type WatchStream = Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;

/// A single write inside a [`MetaTxn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Conditional multi-key write.
///
/// Every `(key, revision)` guard must match the key's current mod revision
/// (0 means "key absent") for the ops to be applied. Either all ops apply or
/// none do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaTxn {
    pub guards: Vec<(String, u64)>,
    pub ops: Vec<MetaOp>,
}

impl MetaTxn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(mut self, key: impl Into<String>, expected_revision: u64) -> Self {
        self.guards.push((key.into(), expected_revision));
        self
    }

    pub fn put(mut self, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.ops.push(MetaOp::Put {
            key: key.into(),
            value,
        });
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(MetaOp::Delete { key: key.into() });
        self
    }
}

/// Revisioned key/value store behind every scheduler record.
///
/// There is no unconditional write: every mutation goes through
/// [`MetaStore::compare_and_swap`] or a guarded [`MetaTxn`].
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>>;
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>>;

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)>;

    /// Apply `txn` atomically. Returns `Some(revision)` on success and `None`
    /// when any guard failed.
    async fn commit(&self, txn: MetaTxn) -> Result<Option<u64>>;

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision_exclusive: Option<u64>,
    ) -> Result<WatchStream>;
}
