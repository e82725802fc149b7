//!
//! Settings of a restore session.
//!
//! Can be read from a JSON file, e.g.
//!
//! ```json
//! {
//!     "cluster": { "namespace": "default", "name": "cluster-example" },
//!     "spool_directory": "/controller/wal-restore-spool",
//!     "env": { "AWS_ENDPOINT_URL": "https://s3.example.com" },
//!     "max_concurrent_fetches": 4
//! }
//! ```
//!
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::fs::File;
use std::num::NonZeroUsize;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::fetch::BARMAN_CLOUD_WAL_RESTORE;

/// The cluster whose WAL is being restored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterIdentity {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestoreConfig {
    #[serde(default)]
    pub cluster: ClusterIdentity,

    pub spool_directory: Utf8PathBuf,

    #[serde(default = "default_fetch_tool")]
    pub fetch_tool: Utf8PathBuf,

    /// Start the fetch tool's environment from our own.
    #[serde(default = "default_inherit_env")]
    pub inherit_env: bool,

    /// Variables set for the fetch tool, overriding inherited ones.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Upper bound on fetch tools running at once. Unbounded when unset,
    /// which makes the batch size the only throttle.
    #[serde(default)]
    pub max_concurrent_fetches: Option<NonZeroUsize>,
}

fn default_fetch_tool() -> Utf8PathBuf {
    Utf8PathBuf::from(BARMAN_CLOUD_WAL_RESTORE)
}

fn default_inherit_env() -> bool {
    true
}

impl RestoreConfig {
    pub fn new(spool_directory: impl Into<Utf8PathBuf>) -> Self {
        RestoreConfig {
            cluster: ClusterIdentity::default(),
            spool_directory: spool_directory.into(),
            fetch_tool: default_fetch_tool(),
            inherit_env: default_inherit_env(),
            env: BTreeMap::new(),
            max_concurrent_fetches: None,
        }
    }

    pub fn from_json_file(path: &Utf8Path) -> anyhow::Result<Self> {
        let file = File::open(path).with_context(|| format!("open config file {path}"))?;
        serde_json::from_reader(file).with_context(|| format!("parse config file {path}"))
    }

    /// The exact environment handed to the fetch tool.
    pub fn fetch_environment(&self) -> Vec<(OsString, OsString)> {
        let mut env: Vec<(OsString, OsString)> = if self.inherit_env {
            std::env::vars_os()
                .filter(|(k, _)| k.to_str().is_none_or(|k| !self.env.contains_key(k)))
                .collect()
        } else {
            Vec::new()
        };
        env.extend(
            self.env
                .iter()
                .map(|(k, v)| (OsString::from(k), OsString::from(v))),
        );
        env
    }
}
