//! On-disk configuration of an arbor node.

#![cfg_attr(
    test,
    allow(
        clippy::missing_assert_message,
        clippy::unwrap_used,
        reason = "Not useful in unit tests"
    )
)]

use std::collections::HashSet;
use std::fs::{read_to_string, write};

use arbor_blockstream::{BlockStreamConfig, PeerDescriptor};
use arbor_vmap::VirtualMapConfig;
use camino::Utf8Path;
use eyre::{bail, Result as EyreResult, WrapErr};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
pub struct ConfigFile {
    #[serde(default)]
    pub vmap: VirtualMapConfig,

    #[serde(default)]
    pub block_stream: BlockStreamConfig,

    /// Candidate block nodes, lower priority values first.
    #[serde(default)]
    pub block_nodes: Vec<PeerDescriptor>,
}

impl ConfigFile {
    #[must_use]
    pub const fn new(
        vmap: VirtualMapConfig,
        block_stream: BlockStreamConfig,
        block_nodes: Vec<PeerDescriptor>,
    ) -> Self {
        Self {
            vmap,
            block_stream,
            block_nodes,
        }
    }

    #[must_use]
    pub fn exists(dir: &Utf8Path) -> bool {
        dir.join(CONFIG_FILE).is_file()
    }

    pub fn load(dir: &Utf8Path) -> EyreResult<Self> {
        let path = dir.join(CONFIG_FILE);
        let content = read_to_string(&path)
            .wrap_err_with(|| format!("failed to read configuration from {path:?}"))?;

        let config: Self = toml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse configuration from {path:?}"))?;

        config.validate()?;

        Ok(config)
    }

    pub fn save(&self, dir: &Utf8Path) -> EyreResult<()> {
        let path = dir.join(CONFIG_FILE);
        let content = toml::to_string_pretty(self)?;

        write(&path, content)
            .wrap_err_with(|| format!("failed to write configuration to {path:?}"))?;

        Ok(())
    }

    /// Only write config file if changes are detected
    pub fn save_if_changed(&self, dir: &Utf8Path) -> EyreResult<bool> {
        let path = dir.join(CONFIG_FILE);
        let new_content = toml::to_string_pretty(self)?;

        let changed = match read_to_string(&path) {
            Ok(existing) => existing != new_content,
            Err(_) => true,
        };

        if changed {
            write(&path, new_content)
                .wrap_err_with(|| format!("failed to write configuration to {path:?}"))?;
        }

        Ok(changed)
    }

    pub fn validate(&self) -> EyreResult<()> {
        if self.vmap.chunk_height == 0 {
            bail!("vmap.chunk_height must be at least 1");
        }

        if self.vmap.max_cached_chunks == 0 {
            bail!("vmap.max_cached_chunks must be at least 1");
        }

        if self.block_stream.max_end_of_streams == 0 {
            bail!("block_stream.max_end_of_streams must be at least 1");
        }

        let mut seen = HashSet::new();
        for node in &self.block_nodes {
            if !seen.insert((node.host.as_str(), node.port)) {
                bail!("block node {node} is listed more than once");
            }
        }

        Ok(())
    }
}
