// Copyright 2023 The Metronome Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Typed façade over the metadata store: a replicated KV with revisions,
//! leases, watches and multi-key transactions.

mod etcd;
mod memory;
mod watcher;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

pub use self::etcd::EtcdStore;
pub use self::memory::MemStore;
pub use self::watcher::{LoopWatcher, WatcherHandle};
use crate::endpoint::ServiceUri;
use crate::utils::Retirer;

pub type Revision = i64;
pub type LeaseId = i64;

/// Most ops a single transaction may carry; larger changes must be committed
/// as serial transactions.
pub const MAX_TXN_OPS: usize = 128;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_AUTO_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Requests slower than this are logged.
pub const SLOW_REQUEST_THRESHOLD: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaKeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub mod_revision: Revision,
}

impl MetaKeyValue {
    pub fn key_str(&self) -> Result<&str> {
        Ok(std::str::from_utf8(&self.key)?)
    }

    pub fn value_str(&self) -> Result<&str> {
        Ok(std::str::from_utf8(&self.value)?)
    }
}

#[derive(Clone, Debug)]
pub enum MetaEvent {
    Put(MetaKeyValue),
    Delete(MetaKeyValue),
}

impl MetaEvent {
    pub fn key(&self) -> &[u8] {
        match self {
            Self::Put(kv) | Self::Delete(kv) => &kv.key,
        }
    }
}

/// Events applied at one revision plus the resume point for watchers.
#[derive(Clone, Debug, Default)]
pub struct EventBatch {
    pub events: Vec<MetaEvent>,
    pub revision: Revision,
    /// Set when the watched revision has been compacted away; the watcher
    /// must resume from this revision.
    pub compact_revision: Option<Revision>,
}

#[derive(Clone, Debug)]
pub struct RangeResult {
    pub kvs: Vec<MetaKeyValue>,
    pub more: bool,
    pub revision: Revision,
}

#[derive(Clone, Debug)]
pub enum MetaCompare {
    /// The key has never been created (create revision is zero).
    Missing(Vec<u8>),
    Exists(Vec<u8>),
    ValueEquals(Vec<u8>, Vec<u8>),
    ModRevision(Vec<u8>, Revision),
}

#[derive(Clone, Debug)]
pub enum MetaOp {
    Put { key: Vec<u8>, value: Vec<u8>, lease: Option<LeaseId> },
    Delete { key: Vec<u8> },
    Get { key: Vec<u8> },
}

impl MetaOp {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, lease: Option<LeaseId>) -> Self {
        Self::Put { key: key.into(), value: value.into(), lease }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn get(key: impl Into<Vec<u8>>) -> Self {
        Self::Get { key: key.into() }
    }
}

#[derive(Clone, Debug, Default)]
pub struct MetaTxn {
    pub compares: Vec<MetaCompare>,
    pub success: Vec<MetaOp>,
    pub failure: Vec<MetaOp>,
}

impl MetaTxn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compares: impl Into<Vec<MetaCompare>>) -> Self {
        self.compares = compares.into();
        self
    }

    pub fn and_then(mut self, ops: impl Into<Vec<MetaOp>>) -> Self {
        self.success = ops.into();
        self
    }

    pub fn or_else(mut self, ops: impl Into<Vec<MetaOp>>) -> Self {
        self.failure = ops.into();
        self
    }
}

#[derive(Clone, Debug)]
pub enum MetaTxnResult {
    Put,
    Delete,
    Get(Option<MetaKeyValue>),
}

#[derive(Clone, Debug)]
pub struct MetaTxnResponse {
    pub succeeded: bool,
    pub revision: Revision,
    pub results: Vec<MetaTxnResult>,
}

impl MetaTxnResponse {
    pub fn take_get(mut self) -> Option<MetaKeyValue> {
        match self.results.pop() {
            Some(MetaTxnResult::Get(kv)) => kv,
            _ => None,
        }
    }
}

/// A granted lease kept alive for as long as the handle is held. Dropping the
/// handle revokes the lease and with it every attached key.
pub struct MetaLease {
    id: LeaseId,
    ttl: Duration,
    lost: watch::Receiver<bool>,
    _keeper: Retirer,
}

impl MetaLease {
    pub(crate) fn new(id: LeaseId, ttl: Duration, lost: watch::Receiver<bool>, keeper: Retirer) -> Self {
        Self { id, ttl, lost, _keeper: keeper }
    }

    pub fn id(&self) -> LeaseId {
        self.id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Resolves when the keep-alive loop fails or the lease is revoked.
    pub async fn lost(&mut self) {
        while !*self.lost.borrow_and_update() {
            if self.lost.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Ordered stream of event batches for one key prefix.
pub struct MetaWatcher {
    receiver: mpsc::UnboundedReceiver<EventBatch>,
    _retirer: Retirer,
}

impl MetaWatcher {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<EventBatch>, retirer: Retirer) -> Self {
        Self { receiver, _retirer: retirer }
    }

    /// Next batch, or `None` once the watch is canceled server side.
    pub async fn message(&mut self) -> Option<EventBatch> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait MetaStore: Send + Sync + 'static {
    async fn get(&self, key: &[u8]) -> Result<Option<MetaKeyValue>>;

    /// Keys under `prefix` starting at `from`, at most `limit` of them,
    /// sorted ascending. `more` tells whether another page remains.
    async fn range(&self, prefix: &[u8], from: &[u8], limit: i64) -> Result<RangeResult>;

    async fn put(&self, key: Vec<u8>, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision>;

    async fn delete(&self, key: &[u8]) -> Result<Revision>;

    async fn txn(&self, txn: MetaTxn) -> Result<MetaTxnResponse>;

    async fn grant(&self, ttl: Duration) -> Result<MetaLease>;

    async fn watch(&self, prefix: &[u8], from_revision: Revision) -> Result<MetaWatcher>;
}

/// First key after every key prefixed by `prefix`, etcd range-end style.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return end;
        }
        end.pop();
    }
    vec![0]
}

/// Smallest key strictly greater than `key`, for range pagination.
pub fn next_key(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0);
    next
}

pub async fn connect(uri: &ServiceUri) -> Result<Arc<dyn MetaStore>> {
    match uri.scheme() {
        "memory" => Ok(Arc::new(MemStore::new())),
        "etcd" | "etcd+tls" => Ok(Arc::new(EtcdStore::connect(uri).await?)),
        scheme => bail!("unsupported metadata store scheme: {scheme}"),
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    #[test]
    fn test_prefix_end() {
        assert_that!(prefix_end(b"/tso/")).is_equal_to(b"/tso0".to_vec());
        assert_that!(prefix_end(&[0x01, 0xff])).is_equal_to(vec![0x02]);
        assert_that!(prefix_end(&[0xff, 0xff])).is_equal_to(vec![0x00]);
    }

    #[test]
    fn test_next_key() {
        assert_that!(next_key(b"a")).is_equal_to(b"a\0".to_vec());
        assert_that!(next_key(b"a\0") > b"a\0".to_vec()).is_true();
    }
}
