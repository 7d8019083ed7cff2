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

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use clap::{Parser, ValueEnum};
use metronome::admin::KeyspaceAdminImpl;
use metronome::cluster;
use metronome::election::DEFAULT_LEASE_TTL;
use metronome::endpoint::ServiceUri;
use metronome::keyspace::{KeyspaceGroupManager, DEFAULT_REPLICA_COUNT};
use metronome::protos::{KeyspaceAdminServer, TsoServer, GLOBAL_DC_LOCATION};
use metronome::proxy::{PrimaryRoster, TsoProxy};
use metronome::timestamp::MAX_SUFFIX_BITS;
use metronome::tso::{AllocatorManager, TsoServiceImpl};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Serves timestamps for the keyspace groups assigned to this node.
    Tso,
    /// Serves the proxy and the keyspace-group administration surface.
    Api,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Metadata store uri, e.g. etcd://127.0.0.1:2379 or memory://local.
    #[arg(long = "store.uri")]
    store_uri: String,
    /// Address to listen on.
    #[arg(long = "listen-addr", default_value = "127.0.0.1:3379")]
    listen_addr: SocketAddr,
    /// Address advertised to peers and clients; defaults to the listen
    /// address.
    #[arg(long = "advertise-addr")]
    advertise_addr: Option<String>,
    #[arg(long = "role", value_enum, default_value_t = Role::Tso)]
    role: Role,
    /// DC location of this node's allocators.
    #[arg(long = "dc-location", default_value = GLOBAL_DC_LOCATION)]
    dc_location: String,
    /// Logical suffix bits shared by every allocator of the deployment.
    #[arg(long = "suffix-bits", default_value_t = 0)]
    suffix_bits: u32,
    /// Replica count of newly created keyspace groups.
    #[arg(long = "replica-count", default_value_t = DEFAULT_REPLICA_COUNT)]
    replica_count: usize,
}

async fn run(args: Args) -> Result<()> {
    ensure!(args.suffix_bits <= MAX_SUFFIX_BITS, "suffix bits at most {MAX_SUFFIX_BITS}");
    let uri: ServiceUri = args.store_uri.parse().context("parse store uri")?;
    let store = metronome::mds::connect(&uri).await.context("connect metadata store")?;
    let cluster_id = cluster::init_cluster_id(&store).await?;
    info!("joined cluster {cluster_id}");

    let advertise = args.advertise_addr.unwrap_or_else(|| format!("http://{}", args.listen_addr));
    let keyspace = Arc::new(KeyspaceGroupManager::start(store.clone(), args.replica_count).await?);

    match args.role {
        Role::Tso => {
            let node_lease = cluster::register_tso_node(&store, &advertise).await?;
            let member = cluster::new_member(advertise.clone(), advertise.clone(), args.dc_location.clone());
            let manager = AllocatorManager::start(
                store.clone(),
                keyspace.clone(),
                member,
                args.dc_location,
                args.suffix_bits,
                DEFAULT_LEASE_TTL,
            );
            let service = TsoServiceImpl::new(cluster_id, keyspace, manager);
            info!("tso node {advertise} serving on {}", args.listen_addr);
            tonic::transport::Server::builder()
                .add_service(TsoServer::new(service))
                .serve(args.listen_addr)
                .await?;
            drop(node_lease);
        },
        Role::Api => {
            let roster = Arc::new(PrimaryRoster::start(store.clone()).await?);
            let member = cluster::new_member(advertise.clone(), advertise.clone(), args.dc_location);
            let proxy = TsoProxy::new(cluster_id, member, keyspace.clone(), roster);
            let admin = KeyspaceAdminImpl::new(cluster_id, keyspace);
            info!("api node {advertise} serving on {}", args.listen_addr);
            tonic::transport::Server::builder()
                .add_service(TsoServer::new(proxy))
                .add_service(KeyspaceAdminServer::new(admin))
                .serve(args.listen_addr)
                .await?;
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(non_blocking).with_level(true).with_file(true).with_line_number(true))
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        tracing::error!("metronomed failed: {err:?}");
        std::process::exit(1);
    }
}
