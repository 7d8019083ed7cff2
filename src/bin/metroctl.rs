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

use clap::{Parser, Subcommand};
use metronome::protos::{
    FinishMergeRequest,
    FinishSplitRequest,
    GetGroupRequest,
    KeyspaceAdminClient,
    ListGroupsRequest,
    MergeGroupsRequest,
    SetNodesRequest,
    SetPriorityRequest,
    SplitGroupRequest,
};

#[derive(Parser, Debug)]
#[command(version, about = "Control the keyspace groups of a metronome deployment", long_about = None)]
struct Args {
    /// Address of an API node.
    #[arg(short = 'u', long = "url", default_value = "http://127.0.0.1:3379")]
    url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show or change keyspace groups.
    #[command(name = "keyspace-group", args_conflicts_with_subcommands = true)]
    KeyspaceGroup(KeyspaceGroupArgs),
}

#[derive(clap::Args, Debug)]
struct KeyspaceGroupArgs {
    #[command(subcommand)]
    command: Option<KeyspaceGroupCommand>,
    /// Group to show; all groups when absent.
    id: Option<u32>,
    /// Restrict the listing to groups in this state: split or merge.
    #[arg(long = "state")]
    state: Option<String>,
}

#[derive(Subcommand, Debug)]
enum KeyspaceGroupCommand {
    /// Split keyspaces out of a group into a new one.
    Split { source: u32, target: u32, #[arg(required = true)] keyspaces: Vec<u32> },
    /// Finish a pending split of the target group.
    FinishSplit { id: u32 },
    /// Merge source groups into the target group.
    Merge { target: u32, #[arg(required = true)] sources: Vec<u32> },
    /// Finish a pending merge of the target group.
    FinishMerge { id: u32 },
    /// Replace the member nodes of a group.
    SetNode { id: u32, #[arg(required = true)] addresses: Vec<String> },
    /// Set the election priority of one member node.
    SetPriority {
        id: u32,
        address: String,
        #[arg(allow_hyphen_values = true)]
        priority: String,
    },
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

async fn keyspace_group(client: &mut KeyspaceAdminClient<tonic::transport::Channel>, args: KeyspaceGroupArgs) {
    let Some(command) = args.command else {
        match args.id {
            Some(id) => {
                let request = GetGroupRequest { header: None, id };
                match client.get_group(request).await {
                    Ok(response) => match response.into_inner().group {
                        Some(group) => println!("{}", serde_json::to_string_pretty(&group).unwrap()),
                        None => fail(format!("keyspace group {id} not found")),
                    },
                    Err(status) => fail(status.message()),
                }
            },
            None => {
                let state = args.state.unwrap_or_default();
                let request = ListGroupsRequest { header: None, state };
                match client.list_groups(request).await {
                    Ok(response) => {
                        println!("{}", serde_json::to_string_pretty(&response.into_inner().groups).unwrap())
                    },
                    Err(status) => fail(status.message()),
                }
            },
        }
        return;
    };
    let result = match command {
        KeyspaceGroupCommand::Split { source, target, keyspaces } => {
            let request = SplitGroupRequest { header: None, source_id: source, target_id: target, keyspaces };
            client.split_group(request).await.map(|_| ())
        },
        KeyspaceGroupCommand::FinishSplit { id } => {
            client.finish_split(FinishSplitRequest { header: None, id }).await.map(|_| ())
        },
        KeyspaceGroupCommand::Merge { target, sources } => {
            let request = MergeGroupsRequest { header: None, target_id: target, source_ids: sources };
            client.merge_groups(request).await.map(|_| ())
        },
        KeyspaceGroupCommand::FinishMerge { id } => {
            client.finish_merge(FinishMergeRequest { header: None, id }).await.map(|_| ())
        },
        KeyspaceGroupCommand::SetNode { id, addresses } => {
            client.set_nodes(SetNodesRequest { header: None, id, addresses }).await.map(|_| ())
        },
        KeyspaceGroupCommand::SetPriority { id, address, priority } => {
            let Ok(priority) = priority.parse::<i32>() else {
                fail(format!("Failed to parse the priority: {priority}"));
            };
            client.set_priority(SetPriorityRequest { header: None, id, address, priority }).await.map(|_| ())
        },
    };
    match result {
        Ok(()) => println!("Success!"),
        Err(status) => fail(status.message()),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let mut client = match KeyspaceAdminClient::connect(args.url.clone()).await {
        Ok(client) => client,
        Err(err) => fail(format!("connect {}: {err}", args.url)),
    };
    match args.command {
        Command::KeyspaceGroup(group_args) => keyspace_group(&mut client, group_args).await,
    }
}
