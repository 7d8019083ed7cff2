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

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use etcd_client::{
    Client,
    Compare,
    CompareOp,
    ConnectOptions,
    GetOptions,
    LeaseClient,
    LeaseKeepAliveStream,
    LeaseKeeper,
    PutOptions,
    SortOrder,
    SortTarget,
    Txn,
    TxnOp,
    TxnOpResponse,
    WatchOptions,
};
use ignore_result::Ignore;
use tokio::select;
use tokio::sync::{mpsc, watch};

use super::{
    prefix_end,
    EventBatch,
    LeaseId,
    MetaCompare,
    MetaEvent,
    MetaKeyValue,
    MetaLease,
    MetaOp,
    MetaStore,
    MetaTxn,
    MetaTxnResponse,
    MetaTxnResult,
    MetaWatcher,
    RangeResult,
    Revision,
    DEFAULT_DIAL_TIMEOUT,
    DEFAULT_REQUEST_TIMEOUT,
    SLOW_REQUEST_THRESHOLD,
};
use crate::endpoint::ServiceUri;
use crate::utils::{self, Retirement};

pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(uri: &ServiceUri) -> Result<Self> {
        let scheme = match uri.scheme() {
            "etcd" => "http",
            "etcd+tls" => "https",
            scheme => return Err(anyhow!("unsupported etcd scheme: {scheme}")),
        };
        let endpoints: Vec<_> = uri.endpoints().map(|addr| format!("{scheme}://{addr}")).collect();
        let options = ConnectOptions::new()
            .with_connect_timeout(DEFAULT_DIAL_TIMEOUT)
            .with_timeout(DEFAULT_REQUEST_TIMEOUT)
            .with_keep_alive(Duration::from_secs(10), Duration::from_secs(3));
        let client = Client::connect(&endpoints, Some(options)).await?;
        Ok(Self { client })
    }

    async fn observe<T>(name: &str, key: &[u8], op: impl Future<Output = Result<T, etcd_client::Error>>) -> Result<T> {
        let start = Instant::now();
        let result = op.await;
        let elapsed = start.elapsed();
        if elapsed > SLOW_REQUEST_THRESHOLD {
            tracing::warn!("slow mds request: {} {:?} took {:?}", name, String::from_utf8_lossy(key), elapsed);
        }
        Ok(result?)
    }

    fn convert_kv(kv: &etcd_client::KeyValue) -> MetaKeyValue {
        MetaKeyValue { key: kv.key().to_vec(), value: kv.value().to_vec(), mod_revision: kv.mod_revision() }
    }

    fn convert_compare(compare: MetaCompare) -> Compare {
        match compare {
            MetaCompare::Missing(key) => Compare::create_revision(key, CompareOp::Equal, 0),
            MetaCompare::Exists(key) => Compare::create_revision(key, CompareOp::Greater, 0),
            MetaCompare::ValueEquals(key, value) => Compare::value(key, CompareOp::Equal, value),
            MetaCompare::ModRevision(key, revision) => Compare::mod_revision(key, CompareOp::Equal, revision),
        }
    }

    fn convert_op(op: MetaOp) -> TxnOp {
        match op {
            MetaOp::Put { key, value, lease } => {
                TxnOp::put(key, value, lease.map(|id| PutOptions::new().with_lease(id)))
            },
            MetaOp::Delete { key } => TxnOp::delete(key, None),
            MetaOp::Get { key } => TxnOp::get(key, None),
        }
    }

    async fn keep_alive_lease(
        mut client: LeaseClient,
        mut keeper: LeaseKeeper,
        mut stream: LeaseKeepAliveStream,
        mut retirement: Retirement,
        ttl: Duration,
        lost: watch::Sender<bool>,
    ) {
        let mut interval = tokio::time::interval(ttl / 3);
        loop {
            select! {
                _ = interval.tick() => {
                    keeper.keep_alive().await.ignore();
                },
                r = stream.message() => match r {
                    Ok(Some(response)) if response.ttl() > 0 => continue,
                    _ => {
                        lost.send(true).ignore();
                        break;
                    },
                },
                _ = retirement.retired() => {
                    client.revoke(keeper.id()).await.ignore();
                    lost.send(true).ignore();
                    break;
                },
            }
        }
    }
}

#[async_trait]
impl MetaStore for EtcdStore {
    async fn get(&self, key: &[u8]) -> Result<Option<MetaKeyValue>> {
        let mut client = self.client.clone();
        let response = Self::observe("get", key, client.get(key, None)).await?;
        Ok(response.kvs().first().map(Self::convert_kv))
    }

    async fn range(&self, prefix: &[u8], from: &[u8], limit: i64) -> Result<RangeResult> {
        let mut client = self.client.clone();
        let options = GetOptions::new()
            .with_range(prefix_end(prefix))
            .with_sort(SortTarget::Key, SortOrder::Ascend)
            .with_limit(limit);
        let response = Self::observe("range", prefix, client.get(from, Some(options))).await?;
        let kvs = response.kvs().iter().map(Self::convert_kv).collect();
        let revision = response.header().map(|h| h.revision()).unwrap_or_default();
        Ok(RangeResult { kvs, more: response.more(), revision })
    }

    async fn put(&self, key: Vec<u8>, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        let response = Self::observe("put", &key, client.put(key.clone(), value, options)).await?;
        Ok(response.header().map(|h| h.revision()).unwrap_or_default())
    }

    async fn delete(&self, key: &[u8]) -> Result<Revision> {
        let mut client = self.client.clone();
        let response = Self::observe("delete", key, client.delete(key, None)).await?;
        Ok(response.header().map(|h| h.revision()).unwrap_or_default())
    }

    async fn txn(&self, txn: MetaTxn) -> Result<MetaTxnResponse> {
        let mut client = self.client.clone();
        let compares: Vec<_> = txn.compares.into_iter().map(Self::convert_compare).collect();
        let success: Vec<_> = txn.success.into_iter().map(Self::convert_op).collect();
        let failure: Vec<_> = txn.failure.into_iter().map(Self::convert_op).collect();
        let txn = Txn::new().when(compares).and_then(success).or_else(failure);
        let response = Self::observe("txn", b"", client.txn(txn)).await?;
        let results = response
            .op_responses()
            .into_iter()
            .map(|op| match op {
                TxnOpResponse::Put(_) => MetaTxnResult::Put,
                TxnOpResponse::Delete(_) => MetaTxnResult::Delete,
                TxnOpResponse::Get(get) => MetaTxnResult::Get(get.kvs().first().map(Self::convert_kv)),
                TxnOpResponse::Txn(_) => MetaTxnResult::Put,
            })
            .collect();
        let revision = response.header().map(|h| h.revision()).unwrap_or_default();
        Ok(MetaTxnResponse { succeeded: response.succeeded(), revision, results })
    }

    async fn grant(&self, ttl: Duration) -> Result<MetaLease> {
        let mut client = self.client.clone();
        let response = client.lease_grant(ttl.as_secs().max(1) as i64, None).await?;
        let lease_id = response.id();
        let granted = Duration::from_secs(response.ttl().max(1) as u64);
        let lease_client = client.lease_client();
        let (keeper, stream) = client.lease_keep_alive(lease_id).await?;
        let (retirer, retirement) = utils::retirement("lease-keepalive");
        let (lost_sender, lost) = watch::channel(false);
        tokio::spawn(Self::keep_alive_lease(lease_client, keeper, stream, retirement, granted, lost_sender));
        Ok(MetaLease::new(lease_id, granted, lost, retirer))
    }

    async fn watch(&self, prefix: &[u8], from_revision: Revision) -> Result<MetaWatcher> {
        let mut client = self.client.clone();
        let mut options = WatchOptions::new().with_range(prefix_end(prefix));
        if from_revision > 0 {
            options = options.with_start_revision(from_revision);
        }
        let (mut watcher, mut stream) = client.watch(prefix, Some(options)).await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let (retirer, mut retirement) = utils::retirement("mds-watch");
        tokio::spawn(async move {
            loop {
                select! {
                    _ = retirement.retired() => {
                        watcher.cancel().await.ignore();
                        break;
                    },
                    r = stream.message() => {
                        let response = match r {
                            Ok(Some(response)) => response,
                            Ok(None) | Err(_) => break,
                        };
                        if response.compact_revision() != 0 {
                            let batch = EventBatch {
                                compact_revision: Some(response.compact_revision()),
                                ..Default::default()
                            };
                            sender.send(batch).ignore();
                            break;
                        }
                        if response.canceled() {
                            break;
                        }
                        if response.events().is_empty() {
                            continue;
                        }
                        let events = response
                            .events()
                            .iter()
                            .filter_map(|event| {
                                let kv = Self::convert_kv(event.kv()?);
                                match event.event_type() {
                                    etcd_client::EventType::Put => Some(MetaEvent::Put(kv)),
                                    etcd_client::EventType::Delete => Some(MetaEvent::Delete(kv)),
                                }
                            })
                            .collect();
                        let revision = response.header().map(|h| h.revision()).unwrap_or_default();
                        let batch = EventBatch { events, revision, compact_revision: None };
                        if sender.send(batch).is_err() {
                            break;
                        }
                    },
                }
            }
        });
        Ok(MetaWatcher::new(receiver, retirer))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assertor::*;
    use testcontainers::clients::Cli as DockerCli;
    use testcontainers::images::generic::GenericImage;
    use testcontainers::core::WaitFor;

    use super::*;
    use crate::mds::{MetaOp, MetaTxn};

    fn etcd_image() -> GenericImage {
        GenericImage::new("bitnami/etcd", "3.5.9")
            .with_env_var("ALLOW_NONE_AUTHENTICATION", "yes")
            .with_wait_for(WaitFor::StdErrMessage { message: "ready to serve client requests".to_string() })
    }

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_etcd_store() {
        let docker = DockerCli::default();
        let container = docker.run(etcd_image());
        let uri = format!("etcd://127.0.0.1:{}", container.get_host_port_ipv4(2379)).parse().unwrap();
        let store = EtcdStore::connect(&uri).await.unwrap();

        let revision = store.put(b"/k1".to_vec(), b"v1".to_vec(), None).await.unwrap();
        let kv = store.get(b"/k1").await.unwrap().unwrap();
        assert_that!(kv.value).is_equal_to(b"v1".to_vec());
        assert_that!(kv.mod_revision).is_equal_to(revision);

        let mut watcher = store.watch(b"/k", revision + 1).await.unwrap();
        let txn = MetaTxn::new()
            .when([MetaCompare::ModRevision(b"/k1".to_vec(), revision)])
            .and_then([MetaOp::put(b"/k1", b"v2", None)]);
        let response = store.txn(txn).await.unwrap();
        assert_that!(response.succeeded).is_true();

        let batch = watcher.message().await.unwrap();
        assert_that!(batch.events.len()).is_equal_to(1);

        let lease = store.grant(Duration::from_secs(2)).await.unwrap();
        store.put(b"/k2".to_vec(), b"v".to_vec(), Some(lease.id())).await.unwrap();
        drop(lease);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_that!(store.get(b"/k2").await.unwrap().is_none()).is_true();
    }
}
