//! Routing prefix parsing.
//!
//! A routing prefix names a region and a cluster: `/region/cluster/`. The
//! trailing slash is normalized in; anything else is rejected.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("routing prefix {0:?} should be of the form /region/cluster/")]
pub struct PrefixError(pub String);

/// Parsed `/region/cluster/` prefix, stored normalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingPrefix {
    full: String,
    region_len: usize,
}

impl RoutingPrefix {
    /// The normalized prefix, trailing slash included.
    pub fn as_str(&self) -> &str {
        &self.full
    }

    pub fn region(&self) -> &str {
        &self.full[1..1 + self.region_len]
    }

    pub fn cluster(&self) -> &str {
        &self.full[2 + self.region_len..self.full.len() - 1]
    }
}

impl FromStr for RoutingPrefix {
    type Err = PrefixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || PrefixError(s.to_string());
        let rest = s.strip_prefix('/').ok_or_else(err)?;
        let rest = rest.strip_suffix('/').unwrap_or(rest);

        let (region, cluster) = rest.split_once('/').ok_or_else(err)?;
        if region.is_empty() || cluster.is_empty() || cluster.contains('/') {
            return Err(err());
        }

        Ok(Self {
            full: format!("/{region}/{cluster}/"),
            region_len: region.len(),
        })
    }
}

impl fmt::Display for RoutingPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

/// Split a routed key into its prefix and the bare key. Keys without a
/// well-formed prefix route whole through the default.
pub fn split_routing_key(key: &str) -> (Option<&str>, &str) {
    if !key.starts_with('/') {
        return (None, key);
    }
    // "/region/cluster/rest": find the slash closing the cluster segment
    let after_region = match key[1..].find('/') {
        Some(i) => 1 + i + 1,
        None => return (None, key),
    };
    let after_cluster = match key[after_region..].find('/') {
        Some(i) => after_region + i + 1,
        None => return (None, key),
    };
    if after_region == 2 || after_cluster == after_region + 1 {
        // empty region or cluster segment
        return (None, key);
    }
    (Some(&key[..after_cluster]), &key[after_cluster..])
}
