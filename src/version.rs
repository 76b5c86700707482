//! Build version metadata.
//!
//! [`Info`] describes the binary a responder is running and is stamped on
//! PONG responses. It is built explicitly from build strings; nothing here
//! runs at load time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::identity::NodeType;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("invalid semantic version {0:?}")]
    InvalidSemVer(String),
    #[error("invalid build timestamp {0:?}")]
    InvalidTimestamp(String),
}

/// Semantic version `vMAJOR.MINOR.PATCH`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SemVer {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    pub fn parse_list<S: AsRef<str>>(versions: &[S]) -> Result<Vec<SemVer>, VersionError> {
        versions.iter().map(|v| v.as_ref().parse()).collect()
    }

    /// Exact membership in `allowed`; there is no range matching.
    pub fn is_allowed(&self, allowed: &[SemVer]) -> bool {
        allowed.contains(self)
    }
}

/// Versions accepted from each node role.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedVersions {
    pub bootstrap: Vec<SemVer>,
    pub satellite: Vec<SemVer>,
    pub storage: Vec<SemVer>,
    pub uplink: Vec<SemVer>,
}

impl AllowedVersions {
    pub fn for_node_type(&self, node_type: NodeType) -> &[SemVer] {
        match node_type {
            NodeType::Bootstrap => &self.bootstrap,
            NodeType::Satellite => &self.satellite,
            NodeType::Storage => &self.storage,
            NodeType::Uplink => &self.uplink,
            NodeType::Invalid => &[],
        }
    }

    /// Whether a node of `node_type` running `version` is accepted. Invalid
    /// roles accept nothing.
    pub fn allows(&self, node_type: NodeType, version: &SemVer) -> bool {
        version.is_allowed(self.for_node_type(node_type))
    }
}

impl FromStr for SemVer {
    type Err = VersionError;

    /// Accepts `X.Y.Z` with an optional leading `v`. Nothing else: no
    /// pre-release or build suffixes, no surrounding whitespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionError::InvalidSemVer(s.to_string());
        let digits = s.strip_prefix('v').unwrap_or(s);

        let mut parts = digits.split('.').map(|part| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse::<u64>().map_err(|_| invalid())
        });

        let major = parts.next().ok_or_else(invalid)??;
        let minor = parts.next().ok_or_else(invalid)??;
        let patch = parts.next().ok_or_else(invalid)??;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self { major, minor, patch })
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Versioning information for a binary.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    /// Unix seconds; 0 when unknown.
    pub timestamp: i64,
    pub commit_hash: String,
    pub version: SemVer,
    pub release: bool,
}

impl Info {
    /// Build from the raw strings a build pipeline injects.
    ///
    /// All-empty input yields `Info::default()`. A release flag is only
    /// honored when both a timestamp and a commit hash are present.
    pub fn from_build_strings(
        timestamp: &str,
        commit_hash: &str,
        version: &str,
        release: &str,
    ) -> Result<Self, VersionError> {
        if [timestamp, commit_hash, version, release].iter().all(|s| s.is_empty()) {
            return Ok(Self::default());
        }

        let timestamp: i64 = timestamp
            .parse()
            .map_err(|_| VersionError::InvalidTimestamp(timestamp.to_string()))?;
        let version: SemVer = version.parse()?;
        let release = release.eq_ignore_ascii_case("true") && timestamp != 0 && !commit_hash.is_empty();

        Ok(Self {
            timestamp,
            commit_hash: commit_hash.to_string(),
            version,
            release,
        })
    }

    /// Build from the `KADEMLIA_BUILD_*` variables present at compile time.
    pub fn from_build_env() -> Result<Self, VersionError> {
        Self::from_build_strings(
            option_env!("KADEMLIA_BUILD_TIMESTAMP").unwrap_or_default(),
            option_env!("KADEMLIA_BUILD_COMMIT").unwrap_or_default(),
            option_env!("KADEMLIA_BUILD_VERSION").unwrap_or_default(),
            option_env!("KADEMLIA_BUILD_RELEASE").unwrap_or_default(),
        )
    }

    pub fn is_stamped(&self) -> bool {
        *self != Self::default()
    }
}
