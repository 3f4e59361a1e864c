// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process-wide state, threaded by reference through every
//! operation.  Nothing in the crate keeps module-level mutable
//! state.

use std::path::Path;

use crate::config::Config;
use crate::content;
use crate::disk::{BlockPos, Disk};
use crate::filter::Filter;
use crate::raid::LEV_MAX;
use crate::result::Result;

/// Behaviour switches, mostly command-line driven.
#[derive(Clone, Copy, Debug, Default)]
pub struct Options {
    /// Accept tracked files that shrank to zero size.
    pub force_zero: bool,
    /// Accept disks whose tracked files all disappeared.
    pub force_empty: bool,
    pub verbose: bool,
    /// Emit machine-readable scan events on stderr.
    pub gui: bool,
}

pub struct State {
    pub block_size: u32,
    /// Path of the content file.
    pub content: String,
    /// Parity file paths, one per configured level.
    pub parity_path: Vec<String>,
    pub disks: Vec<Disk>,
    pub filter: Filter,
    pub opts: Options,
    /// The in-memory state diverged from the content file.
    pub need_write: bool,
}

impl State {
    pub fn new(config: Config, opts: Options) -> State {
        let mut parity_path = vec![config.parity];
        if let Some(q) = config.q_parity {
            parity_path.push(q);
        }
        debug_assert!(parity_path.len() <= LEV_MAX);
        let disks = config
            .disks
            .iter()
            .map(|d| Disk::new(&d.name, &d.dir))
            .collect();
        State {
            block_size: config.block_size,
            content: config.content,
            parity_path,
            disks,
            filter: Filter::new(&config.exclude),
            opts,
            need_write: false,
        }
    }

    /// Number of configured parity levels.
    pub fn levels(&self) -> usize {
        self.parity_path.len()
    }

    /// Length of the parity column space: the longest
    /// allocation table across the disks.
    pub fn parity_allocated_size(&self) -> BlockPos {
        self.disks.iter().map(Disk::table_len).max().unwrap_or(0)
    }

    /// Loads the content file if one exists.  A missing file is
    /// a first run, not an error.
    pub fn load(&mut self) -> Result<()> {
        if Path::new(&self.content).exists() {
            content::load(self)?;
        }
        self.need_write = false;
        Ok(())
    }

    /// Persists the state and clears the dirty flag.
    pub fn save(&mut self) -> Result<()> {
        content::save(self)?;
        self.need_write = false;
        Ok(())
    }
}
