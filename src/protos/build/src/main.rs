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

//! Regenerates `src/protos/generated` from `src/protos/protos`. The output is
//! committed so the main crate builds without protoc.

use std::env;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

fn main() {
    let pwd = env::var("CARGO_MANIFEST_DIR").unwrap();
    let parent = Path::new(&pwd).parent().unwrap();
    let protos_dir = parent.join("protos");
    let protos: Vec<_> = protos_dir
        .read_dir()
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|p| p.file_name().unwrap().to_str().unwrap().ends_with(".proto"))
        .collect();

    let outdir = parent.join("generated");

    let _ = fs::remove_dir_all(&outdir);
    fs::create_dir(&outdir).unwrap();

    let mut config = prost_build::Config::new();
    config
        .type_attribute("Timestamp", "#[derive(Copy, Eq, PartialOrd, Ord, Hash)]")
        .type_attribute("SplitState", "#[derive(Copy, Eq)]")
        .type_attribute(
            "KeyspaceGroup",
            "#[derive(::serde::Serialize, ::serde::Deserialize)]\n#[serde(rename_all = \"camelCase\")]",
        )
        .type_attribute(
            "KeyspaceGroupMember",
            "#[derive(::serde::Serialize, ::serde::Deserialize)]\n#[serde(rename_all = \"camelCase\")]",
        )
        .type_attribute(
            "SplitState",
            "#[derive(::serde::Serialize, ::serde::Deserialize)]\n#[serde(rename_all = \"camelCase\")]",
        )
        .type_attribute(
            "MergeState",
            "#[derive(::serde::Serialize, ::serde::Deserialize)]\n#[serde(rename_all = \"camelCase\")]",
        )
        .type_attribute(
            "Member",
            "#[derive(::serde::Serialize, ::serde::Deserialize)]\n#[serde(rename_all = \"camelCase\")]",
        )
        .field_attribute("KeyspaceGroup.split_state", "#[serde(default, skip_serializing_if = \"Option::is_none\")]")
        .field_attribute("KeyspaceGroup.merge_state", "#[serde(default, skip_serializing_if = \"Option::is_none\")]");

    tonic_build::configure().out_dir(&outdir).compile_with_config(config, &protos, &[protos_dir]).unwrap();

    let mut file = File::create(outdir.join("mod.rs")).unwrap();

    file.write_all(b"#![allow(clippy::all)]\n").unwrap();
    file.write_all(b"\n").unwrap();

    let modules = protos.iter().map(|p| Path::new(p).file_stem().unwrap().to_str().unwrap());
    for (i, module) in modules.enumerate() {
        if i != 0 {
            file.write_all(b"\n").unwrap();
        }
        file.write_all(b"#[rustfmt::skip]\n").unwrap();
        writeln!(&mut file, "mod {};", module).unwrap();
        writeln!(&mut file, "pub use self::{}::*;", module).unwrap();
    }
}
