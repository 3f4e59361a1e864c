// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The array configuration file.
//!
//! ```toml
//! block_size = 262144
//! content = "/var/lib/parsnap/content"
//! parity = "/mnt/parity/parity"
//! q_parity = "/mnt/parity/q-parity"   # optional second level
//! exclude = ["*.tmp", "lost+found/"]
//!
//! [[disk]]
//! name = "d0"
//! dir = "/mnt/disk0/"
//! ```

use std::collections::HashSet;
use std::fs;

use serde::Deserialize;

use crate::disk::DEFAULT_BLOCK_SIZE;
use crate::result::{Error, Result};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    pub content: String,
    pub parity: String,
    pub q_parity: Option<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(rename = "disk")]
    pub disks: Vec<DiskConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskConfig {
    pub name: String,
    pub dir: String,
}

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}

/// Reads and validates the configuration file.
pub fn read(path: &str) -> Result<Config> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read '{path}': {e}")))?;
    let config: Config =
        toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if !config.block_size.is_power_of_two() {
        return Err(Error::Config(format!(
            "block_size {} is not a power of two",
            config.block_size
        )));
    }
    if config.disks.is_empty() {
        return Err(Error::Config("no data disks configured".to_string()));
    }
    let mut names = HashSet::new();
    for disk in &config.disks {
        if !names.insert(disk.name.as_str()) {
            return Err(Error::Config(format!(
                "duplicate disk name '{}'",
                disk.name
            )));
        }
    }
    Ok(())
}
