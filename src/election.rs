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

//! Primary election for one keyspace group and DC location.
//!
//! A participant cycles candidate -> primary -> stepping down -> candidate.
//! The primary key is claimed with a create-once transaction under a
//! kept-alive lease, so it disappears when its holder does.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use rand::Rng;
use tokio::select;
use tokio::sync::{watch, Notify};

use crate::mds::{MetaCompare, MetaEvent, MetaLease, MetaOp, MetaStore, MetaTxn, Revision};
use crate::protos::Member;
use crate::utils::{self, Retirement};

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(3);

pub fn primary_key(group: u32, dc: &str) -> String {
    format!("/tso/{group}/{dc}/primary")
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PrimaryState {
    pub primary: Option<Member>,
    pub is_self: bool,
    /// Bumped on every primary acquisition by this participant.
    pub generation: u64,
}

pub type PrimaryCallback = Box<dyn Fn(&PrimaryState) + Send + Sync>;

pub struct Election {
    shared: Arc<Shared>,
    _retirer: utils::Retirer,
}

struct Shared {
    store: Arc<dyn MetaStore>,
    key: Vec<u8>,
    member: Member,
    member_value: Vec<u8>,
    lease_ttl: Duration,
    resign: Notify,
    state: watch::Sender<PrimaryState>,
    callbacks: Mutex<Vec<PrimaryCallback>>,
}

impl Shared {
    fn publish(&self, state: PrimaryState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            let state = self.state.borrow().clone();
            let callbacks = self.callbacks.lock().unwrap();
            for callback in callbacks.iter() {
                callback(&state);
            }
        }
    }
}

impl Election {
    pub fn start(store: Arc<dyn MetaStore>, group: u32, dc: &str, member: Member, lease_ttl: Duration) -> Self {
        let member_value = serde_json::to_vec(&member).expect("member is always serializable");
        let (state, _) = watch::channel(PrimaryState::default());
        let shared = Arc::new(Shared {
            store,
            key: primary_key(group, dc).into_bytes(),
            member,
            member_value,
            lease_ttl,
            resign: Notify::new(),
            state,
            callbacks: Mutex::new(Vec::new()),
        });
        let (retirer, retirement) = utils::retirement("election");
        tokio::spawn(campaign_loop(shared.clone(), retirement));
        Self { shared, _retirer: retirer }
    }

    pub fn member(&self) -> &Member {
        &self.shared.member
    }

    pub fn subscribe(&self) -> watch::Receiver<PrimaryState> {
        self.shared.state.subscribe()
    }

    pub fn state(&self) -> PrimaryState {
        self.shared.state.borrow().clone()
    }

    pub fn is_primary(&self) -> bool {
        self.shared.state.borrow().is_self
    }

    /// Registers a callback fired on every primary change, in registration
    /// order. Callbacks must not block.
    pub fn on_primary_switch(&self, callback: PrimaryCallback) {
        self.shared.callbacks.lock().unwrap().push(callback);
    }

    /// Asks a serving primary to step down and re-campaign after its lease
    /// fully expires.
    pub fn resign(&self) {
        self.shared.resign.notify_one();
    }
}

async fn campaign_loop(shared: Arc<Shared>, mut retirement: Retirement) {
    let mut generation = 0u64;
    loop {
        let result = select! {
            _ = retirement.retired() => break,
            result = campaign_once(&shared, &mut generation) => result,
        };
        if let Err(err) = result {
            tracing::warn!("campaign of {:?} failed: {:?}", String::from_utf8_lossy(&shared.key), err);
        }
        let backoff = Duration::from_millis(rand::thread_rng().gen_range(50..150));
        select! {
            _ = retirement.retired() => break,
            _ = tokio::time::sleep(backoff) => {},
        }
    }
    shared.publish(PrimaryState::default());
}

async fn campaign_once(shared: &Arc<Shared>, generation: &mut u64) -> Result<()> {
    let lease = shared.store.grant(shared.lease_ttl).await?;
    let txn = MetaTxn::new()
        .when([MetaCompare::Missing(shared.key.clone())])
        .and_then([MetaOp::put(shared.key.clone(), shared.member_value.clone(), Some(lease.id()))])
        .or_else([MetaOp::get(shared.key.clone())]);
    let response = shared.store.txn(txn).await?;
    let revision = response.revision;
    if response.succeeded {
        *generation += 1;
        tracing::info!("{} is primary of {:?}", shared.member.name, String::from_utf8_lossy(&shared.key));
        shared.publish(PrimaryState {
            primary: Some(shared.member.clone()),
            is_self: true,
            generation: *generation,
        });
        let result = lead(shared, lease, revision).await;
        tracing::info!("{} steps down from {:?}", shared.member.name, String::from_utf8_lossy(&shared.key));
        shared.publish(PrimaryState { primary: None, is_self: false, generation: *generation });
        // Let the lease fully expire before campaigning again, so a stale
        // claim can never overlap the next primary.
        tokio::time::sleep(shared.lease_ttl).await;
        result
    } else {
        drop(lease);
        let current = response
            .take_get()
            .ok_or_else(|| anyhow!("campaign transaction lost and no current primary"))?;
        let primary: Member = serde_json::from_slice(&current.value)?;
        shared.publish(PrimaryState { primary: Some(primary), is_self: false, generation: *generation });
        observe(shared, revision).await
    }
}

/// Serves as primary until the lease is lost, a newer primary is observed,
/// or a resignation is requested.
async fn lead(shared: &Arc<Shared>, lease: MetaLease, revision: Revision) -> Result<()> {
    let mut lease = lease;
    let mut watcher = shared.store.watch(&shared.key, revision + 1).await?;
    loop {
        select! {
            _ = lease.lost() => {
                bail!("primary lease lost");
            },
            _ = shared.resign.notified() => {
                // Dropping the lease revokes it and deletes the primary key.
                return Ok(());
            },
            message = watcher.message() => {
                let Some(batch) = message else {
                    bail!("primary watch closed");
                };
                for event in batch.events {
                    match event {
                        MetaEvent::Delete(_) => bail!("primary key deleted"),
                        MetaEvent::Put(kv) => {
                            if kv.value != shared.member_value {
                                bail!("observed newer primary");
                            }
                        },
                    }
                }
            },
        }
    }
}

/// Follows the current primary until the seat becomes vacant.
async fn observe(shared: &Arc<Shared>, revision: Revision) -> Result<()> {
    let mut watcher = shared.store.watch(&shared.key, revision + 1).await?;
    while let Some(batch) = watcher.message().await {
        for event in batch.events {
            match event {
                MetaEvent::Delete(_) => return Ok(()),
                MetaEvent::Put(kv) => {
                    let primary: Member = serde_json::from_slice(&kv.value)?;
                    let generation = shared.state.borrow().generation;
                    shared.publish(PrimaryState { primary: Some(primary), is_self: false, generation });
                },
            }
        }
    }
    bail!("observer watch closed")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assertor::*;
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::cluster::new_member;
    use crate::mds::MemStore;

    const TTL: Duration = Duration::from_millis(200);

    async fn wait_primary(election: &Election) {
        let mut state = election.subscribe();
        timeout(Duration::from_secs(5), async {
            while !state.borrow_and_update().is_self {
                state.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_single_winner() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let a = Election::start(store.clone(), 0, "global", new_member("a", "http://a", "global"), TTL);
        let b = Election::start(store.clone(), 0, "global", new_member("b", "http://b", "global"), TTL);

        timeout(Duration::from_secs(5), async {
            loop {
                if a.is_primary() ^ b.is_primary() {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let (winner, loser) = if a.is_primary() { (&a, &b) } else { (&b, &a) };
        assert_that!(loser.state().primary.unwrap().name).is_equal_to(winner.member().name.clone());
    }

    #[tokio::test]
    async fn test_failover_on_resign() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let a = Election::start(store.clone(), 1, "global", new_member("a", "http://a", "global"), TTL);
        wait_primary(&a).await;

        let b = Election::start(store.clone(), 1, "global", new_member("b", "http://b", "global"), TTL);
        sleep(Duration::from_millis(50)).await;
        assert_that!(b.is_primary()).is_false();

        a.resign();
        wait_primary(&b).await;
        assert_that!(a.is_primary()).is_false();
    }

    #[tokio::test]
    async fn test_failover_on_crash() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let a = Election::start(store.clone(), 2, "global", new_member("a", "http://a", "global"), TTL);
        wait_primary(&a).await;

        let b = Election::start(store.clone(), 2, "global", new_member("b", "http://b", "global"), TTL);
        sleep(Duration::from_millis(50)).await;

        // Simulates a crash: tasks abort, the lease handle drops, the key
        // goes away.
        drop(a);
        wait_primary(&b).await;
    }

    #[tokio::test]
    async fn test_primary_switch_callbacks() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        // Occupy the seat so the callback is registered before any switch.
        let blocker = Election::start(store.clone(), 3, "global", new_member("x", "http://x", "global"), TTL);
        wait_primary(&blocker).await;

        let election = Election::start(store.clone(), 3, "global", new_member("a", "http://a", "global"), TTL);
        let fired = Arc::new(AtomicUsize::new(0));
        let counted = fired.clone();
        election.on_primary_switch(Box::new(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        }));

        drop(blocker);
        wait_primary(&election).await;
        assert_that!(fired.load(Ordering::SeqCst)).is_at_least(1);
    }
}
