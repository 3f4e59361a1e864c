// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! parsnap is a snapshot parity engine for arrays of
//! independent filesystems.
//!
//! Each configured directory tree is treated as a logical block
//! device (a "data disk") and one or more parity files are kept
//! beside them, so that a lost disk can be rebuilt from the
//! survivors.  Unlike a real-time RAID the correspondence
//! between file bytes and parity is refreshed only on explicit
//! commands: `diff` reports the drift, `sync` refreshes the
//! parity, `check` verifies it, `fix` rebuilds broken blocks,
//! and `dry` exercises the whole read path without touching
//! anything.
//!
//! The crate is a library first; the `parsnap` binary is a thin
//! clap front end.  All operations are driven through a
//! [`state::State`] value, take no global locks, and report
//! failure through [`result::Error`] so an embedding program
//! decides what is fatal.

pub mod config;
pub mod content;
pub mod disk;
pub mod filter;
pub mod handle;
pub mod parity;
pub mod pass;
pub mod progress;
pub mod raid;
pub mod result;
pub mod scan;
pub mod state;
pub mod util;

pub use pass::Mode;
pub use result::{Error, Result};
pub use state::{Options, State};
