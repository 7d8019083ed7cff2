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

//! Client-side service discovery: member rosters, primary tracking and the
//! gRPC connection pool.
//!
//! Two deployment shapes share one mechanism: a quorum cluster whose
//! authority is the elected leader, and a primary/secondary TSO group. The
//! shape is picked at construction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use hashbrown::HashMap;
use thiserror::Error;
use tokio::select;
use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint};

use crate::mds::DEFAULT_DIAL_TIMEOUT;
use crate::protos::{GetMembersRequest, GetMembersResponse, RequestHeader, TsoClient};
use crate::utils::{self, Retirement};

pub const DEFAULT_MEMBER_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

const GET_MEMBERS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("cluster id mismatch, expect {expect}, got {got}")]
    UnmatchedClusterId { expect: u64, got: u64 },
    #[error("no service endpoint answered get-members")]
    NoEndpoint,
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

pub type DiscoveryCallback = Box<dyn Fn() + Send + Sync>;

/// What callers need from a discovered deployment, regardless of its shape.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Zero until the first successful member refresh.
    fn cluster_id(&self) -> u64;

    fn urls(&self) -> Vec<String>;

    /// The serving endpoint: quorum leader or group primary.
    fn primary_addr(&self) -> Option<String>;

    /// Healthy backup endpoints.
    fn secondary_addrs(&self) -> Vec<String>;

    /// Primary of the TSO allocator for a DC location.
    fn tso_primary_addr(&self, dc: &str) -> Option<String>;

    async fn get_connection(&self, addr: &str) -> Result<Channel>;

    /// Requests an out-of-band membership check; bursts coalesce.
    fn schedule_check_member_changed(&self);

    async fn check_member_changed(&self) -> Result<(), DiscoveryError>;

    /// Fired after the primary endpoint switched. Must not block.
    fn on_primary_switched(&self, callback: DiscoveryCallback);

    /// Fired after any change in the member set. Must not block.
    fn on_members_changed(&self, callback: DiscoveryCallback);
}

enum Shape {
    QuorumLeader,
    PrimaryStandby { dc: String },
}

struct DiscoveryCore {
    shape: Shape,
    urls: RwLock<Vec<String>>,
    cluster_id: AtomicU64,
    primary: RwLock<Option<String>>,
    secondaries: RwLock<Vec<String>>,
    tso_primaries: RwLock<HashMap<String, String>>,
    connections: Mutex<HashMap<String, Channel>>,
    check: mpsc::Sender<()>,
    primary_callbacks: Mutex<Vec<DiscoveryCallback>>,
    member_callbacks: Mutex<Vec<DiscoveryCallback>>,
}

impl DiscoveryCore {
    async fn connect(&self, addr: &str) -> Result<Channel> {
        if let Some(channel) = self.connections.lock().unwrap().get(addr) {
            return Ok(channel.clone());
        }
        let channel = Endpoint::from_shared(addr.to_string())?
            .connect_timeout(DEFAULT_DIAL_TIMEOUT)
            .connect()
            .await?;
        let mut connections = self.connections.lock().unwrap();
        // Lost check-then-insert race: keep the incumbent, the fresh
        // channel closes on drop.
        Ok(connections.entry(addr.to_string()).or_insert(channel).clone())
    }

    async fn fetch_members(&self, addr: &str) -> Result<GetMembersResponse> {
        let channel = self.connect(addr).await?;
        let mut client = TsoClient::new(channel);
        let request = GetMembersRequest {
            header: Some(RequestHeader::new(self.cluster_id.load(Ordering::Acquire))),
        };
        let response =
            tokio::time::timeout(GET_MEMBERS_TIMEOUT, client.get_members(request)).await??;
        Ok(response.into_inner())
    }

    fn check_cluster_id(&self, response: &GetMembersResponse) -> Result<(), DiscoveryError> {
        let got = response.header.as_ref().map(|header| header.cluster_id).unwrap_or_default();
        match self.cluster_id.compare_exchange(0, got, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(()),
            Err(expect) if expect == got => Ok(()),
            Err(expect) => Err(DiscoveryError::UnmatchedClusterId { expect, got }),
        }
    }

    /// Tries every known URL in turn until one answers, then applies the
    /// fresh member view and fires change callbacks.
    async fn update_members(&self) -> Result<(), DiscoveryError> {
        let urls = self.urls.read().unwrap().clone();
        let mut outcome = Err(DiscoveryError::NoEndpoint);
        for url in urls {
            match self.fetch_members(&url).await {
                Ok(response) => {
                    self.check_cluster_id(&response)?;
                    self.apply(response);
                    outcome = Ok(());
                    break;
                },
                Err(err) => {
                    tracing::warn!("get-members from {url} failed: {err:?}");
                },
            }
        }
        outcome
    }

    fn apply(&self, response: GetMembersResponse) {
        let member_urls: Vec<String> =
            response.members.iter().map(|member| member.address().to_string()).collect();
        let primary = match &self.shape {
            Shape::QuorumLeader => response.leader.as_ref().map(|leader| leader.address().to_string()),
            Shape::PrimaryStandby { dc } => response
                .tso_allocator_primaries
                .get(dc)
                .or(response.leader.as_ref())
                .map(|member| member.address().to_string()),
        };
        let secondaries: Vec<String> =
            member_urls.iter().filter(|url| Some(*url) != primary.as_ref()).cloned().collect();
        let tso_primaries: HashMap<String, String> = response
            .tso_allocator_primaries
            .iter()
            .map(|(dc, member)| (dc.clone(), member.address().to_string()))
            .collect();

        let members_changed = {
            let mut urls = self.urls.write().unwrap();
            let changed = !member_urls.is_empty() && *urls != member_urls;
            if changed {
                *urls = member_urls;
            }
            changed
        };
        let primary_changed = {
            let mut current = self.primary.write().unwrap();
            let changed = *current != primary;
            if changed {
                tracing::info!("discovered primary switched from {:?} to {:?}", *current, primary);
                *current = primary;
            }
            changed
        };
        *self.secondaries.write().unwrap() = secondaries;
        *self.tso_primaries.write().unwrap() = tso_primaries;

        if primary_changed {
            for callback in self.primary_callbacks.lock().unwrap().iter() {
                callback();
            }
        }
        if members_changed {
            for callback in self.member_callbacks.lock().unwrap().iter() {
                callback();
            }
        }
    }

    async fn member_loop(self: Arc<Self>, mut check: mpsc::Receiver<()>, mut retirement: Retirement) {
        let mut tick = tokio::time::interval(DEFAULT_MEMBER_REFRESH_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            select! {
                _ = retirement.retired() => break,
                _ = tick.tick() => {},
                checked = check.recv() => {
                    if checked.is_none() {
                        break;
                    }
                },
            }
            if let Err(err) = self.update_members().await {
                tracing::warn!("membership refresh failed: {err}");
            }
        }
    }
}

/// The single concrete client; the [Shape] decides which endpoint counts as
/// primary.
pub struct DiscoveryClient {
    core: Arc<DiscoveryCore>,
    _retirer: utils::Retirer,
}

impl DiscoveryClient {
    /// Discovery of a quorum deployment, authoritative at its leader.
    pub async fn quorum(urls: Vec<String>) -> Result<Self, DiscoveryError> {
        Self::start(urls, Shape::QuorumLeader).await
    }

    /// Discovery of a primary/standby TSO deployment for one DC location.
    pub async fn primary_standby(urls: Vec<String>, dc: impl Into<String>) -> Result<Self, DiscoveryError> {
        Self::start(urls, Shape::PrimaryStandby { dc: dc.into() }).await
    }

    async fn start(urls: Vec<String>, shape: Shape) -> Result<Self, DiscoveryError> {
        let (check, check_receiver) = mpsc::channel(1);
        let core = Arc::new(DiscoveryCore {
            shape,
            urls: RwLock::new(urls),
            cluster_id: AtomicU64::new(0),
            primary: RwLock::new(None),
            secondaries: RwLock::new(Vec::new()),
            tso_primaries: RwLock::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            check,
            primary_callbacks: Mutex::new(Vec::new()),
            member_callbacks: Mutex::new(Vec::new()),
        });
        core.update_members().await?;
        let (retirer, retirement) = utils::retirement("discovery");
        tokio::spawn(core.clone().member_loop(check_receiver, retirement));
        Ok(Self { core, _retirer: retirer })
    }
}

#[async_trait]
impl ServiceDiscovery for DiscoveryClient {
    fn cluster_id(&self) -> u64 {
        self.core.cluster_id.load(Ordering::Acquire)
    }

    fn urls(&self) -> Vec<String> {
        self.core.urls.read().unwrap().clone()
    }

    fn primary_addr(&self) -> Option<String> {
        self.core.primary.read().unwrap().clone()
    }

    fn secondary_addrs(&self) -> Vec<String> {
        self.core.secondaries.read().unwrap().clone()
    }

    fn tso_primary_addr(&self, dc: &str) -> Option<String> {
        self.core.tso_primaries.read().unwrap().get(dc).cloned()
    }

    async fn get_connection(&self, addr: &str) -> Result<Channel> {
        self.core.connect(addr).await
    }

    fn schedule_check_member_changed(&self) {
        // A full slot already carries the pending check.
        let _ = self.core.check.try_send(());
    }

    async fn check_member_changed(&self) -> Result<(), DiscoveryError> {
        self.core.update_members().await
    }

    fn on_primary_switched(&self, callback: DiscoveryCallback) {
        self.core.primary_callbacks.lock().unwrap().push(callback);
    }

    fn on_members_changed(&self, callback: DiscoveryCallback) {
        self.core.member_callbacks.lock().unwrap().push(callback);
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;
    use crate::cluster;
    use crate::mds::{MemStore, MetaStore};
    use crate::protos::GLOBAL_DC_LOCATION;
    use crate::tso::service::tests::{start_tso_node, wait_default_primary};

    #[tokio::test]
    async fn test_discovers_primary_and_cluster_id() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let cluster_id = cluster::init_cluster_id(&store).await.unwrap();
        let node = start_tso_node(store.clone(), cluster_id).await;
        wait_default_primary(&node.manager).await;

        let discovery =
            DiscoveryClient::primary_standby(vec![node.address.clone()], GLOBAL_DC_LOCATION).await.unwrap();
        assert_that!(discovery.cluster_id()).is_equal_to(cluster_id);
        assert_that!(discovery.primary_addr().unwrap()).is_equal_to(node.address.clone());
        assert_that!(discovery.tso_primary_addr(GLOBAL_DC_LOCATION).unwrap()).is_equal_to(node.address.clone());
        assert_that!(discovery.urls()).is_equal_to(vec![node.address.clone()]);

        let connection = discovery.get_connection(&node.address).await.unwrap();
        drop(connection);

        discovery.check_member_changed().await.unwrap();
        discovery.schedule_check_member_changed();
        discovery.schedule_check_member_changed();
    }

    #[tokio::test]
    async fn test_unmatched_cluster_id_is_fatal() {
        let store_a: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let store_b: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let id_a = cluster::init_cluster_id(&store_a).await.unwrap();
        let id_b = cluster::init_cluster_id(&store_b).await.unwrap();
        assert_that!(id_a).is_not_equal_to(id_b);
        let node_a = start_tso_node(store_a.clone(), id_a).await;
        let node_b = start_tso_node(store_b.clone(), id_b).await;
        wait_default_primary(&node_a.manager).await;
        wait_default_primary(&node_b.manager).await;

        let discovery =
            DiscoveryClient::quorum(vec![node_a.address.clone(), node_b.address.clone()]).await.unwrap();
        // The first answer pins the id; the disagreeing endpoint surfaces
        // on the next explicit check against it.
        let response = discovery.core.fetch_members(&node_b.address).await.unwrap();
        assert_that!(matches!(
            discovery.core.check_cluster_id(&response),
            Err(DiscoveryError::UnmatchedClusterId { .. })
        ))
        .is_true();
    }

    #[tokio::test]
    async fn test_primary_switch_callback() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let cluster_id = cluster::init_cluster_id(&store).await.unwrap();
        let node = start_tso_node(store.clone(), cluster_id).await;
        wait_default_primary(&node.manager).await;

        let discovery =
            DiscoveryClient::primary_standby(vec![node.address.clone()], GLOBAL_DC_LOCATION).await.unwrap();
        let switched = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counted = switched.clone();
        discovery.on_primary_switched(Box::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        }));

        // The primary was discovered at construction; a refresh with an
        // unchanged view must not fire the callback again.
        discovery.check_member_changed().await.unwrap();
        assert_that!(switched.load(Ordering::SeqCst)).is_equal_to(0);
    }
}
