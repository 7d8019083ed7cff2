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

//! Textual endpoints for services and nodes.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{bail, Error, Result};

/// A service uri of shape `scheme://host1[:port1][,host2[:port2]]`.
///
/// Multiple comma separated servers address one replicated service, e.g.
/// `etcd://127.0.0.1:2379,127.0.0.1:22379`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceUri {
    scheme: String,
    address: String,
}

impl ServiceUri {
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Comma separated servers.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        self.address.split(',')
    }
}

impl FromStr for ServiceUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((scheme, address)) = s.split_once("://") else {
            bail!("invalid service uri {s}: no scheme");
        };
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-') {
            bail!("invalid service uri {s}: malformed scheme");
        }
        if address.is_empty() || address.split(',').any(str::is_empty) {
            bail!("invalid service uri {s}: malformed address");
        }
        Ok(Self { scheme: scheme.to_string(), address: address.to_string() })
    }
}

impl Display for ServiceUri {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.address)
    }
}

/// Checks a node address of shape `scheme://host[:port]`: one server, no
/// blanks.
pub fn parse_node_address(address: &str) -> Result<&str> {
    let trimmed = address.trim();
    if trimmed.is_empty() || trimmed != address {
        bail!("invalid node address {address:?}");
    }
    let Some((scheme, rest)) = address.split_once("://") else {
        bail!("invalid node address {address:?}: no scheme");
    };
    if scheme.is_empty() || rest.is_empty() || rest.contains(',') || rest.contains(char::is_whitespace) {
        bail!("invalid node address {address:?}");
    }
    Ok(address)
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    #[test]
    fn test_service_uri() {
        let uri: ServiceUri = "etcd://127.0.0.1:2379,127.0.0.1:22379".parse().unwrap();
        assert_that!(uri.scheme()).is_equal_to("etcd");
        assert_that!(uri.endpoints().collect::<Vec<_>>())
            .is_equal_to(vec!["127.0.0.1:2379", "127.0.0.1:22379"]);
        assert_that!(uri.to_string()).is_equal_to("etcd://127.0.0.1:2379,127.0.0.1:22379".to_string());

        assert_that!("memory://local".parse::<ServiceUri>().is_ok()).is_true();
        assert_that!("127.0.0.1:2379".parse::<ServiceUri>().is_err()).is_true();
        assert_that!("etcd://".parse::<ServiceUri>().is_err()).is_true();
        assert_that!("etcd://a,,b".parse::<ServiceUri>().is_err()).is_true();
    }

    #[test]
    fn test_parse_node_address() {
        assert_that!(parse_node_address("http://127.0.0.1:3379").is_ok()).is_true();
        assert_that!(parse_node_address("").is_err()).is_true();
        assert_that!(parse_node_address("127.0.0.1:3379").is_err()).is_true();
        assert_that!(parse_node_address("http://a,b").is_err()).is_true();
    }
}
