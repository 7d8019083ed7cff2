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

//! Control plane of a placement driver for a distributed key-value store:
//! the timestamp oracle service, its proxy, and the keyspace-group
//! partitioning that shards allocation across primary/secondary groups.

pub mod admin;
pub mod cluster;
pub mod discovery;
pub mod election;
pub mod endpoint;
pub mod keyspace;
pub mod mds;
pub mod protos;
pub mod proxy;
pub mod timestamp;
pub mod tso;
pub mod utils;
