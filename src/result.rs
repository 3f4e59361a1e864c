// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::io;

/// Various errors.
///
/// Scan-time conditions fail the whole operation: a wrong
/// allocation decision corrupts the on-disk invariants.  The
/// parity read path instead counts per-block errors inside the
/// pass; they only surface here as an accumulated `Errors`
/// total.
#[derive(Debug)]
pub enum Error {
    /// A file name the content file cannot round-trip: empty,
    /// containing a newline, ending in a carriage return, or
    /// not valid UTF-8.
    BadName(String),
    /// A symbolic link target longer than the system path maximum.
    LinkTooLong(String),
    /// Two distinct files on one disk claimed the same inode.
    InodeClash(u64, String),
    /// The same symlink sub-path was seen twice in one scan.
    LinkClash(String),
    /// A tracked file shrank to zero size under the same name
    /// and `--force-zero` was not given.
    ZeroSized(String),
    /// Every previously tracked file on the named disks is gone
    /// and `--force-empty` was not given.
    EmptyDisks(Vec<String>),
    /// Directory traversal failure (opendir/readdir/lstat).
    Walk(String, io::Error),
    /// Failed to open a data or parity file.
    Open(String, io::Error),
    /// Failed to close a data or parity file.
    Close(String, io::Error),
    /// Positional read failure.
    Read(String, io::Error),
    /// Positional write failure.
    Write(String, io::Error),
    /// Failed to grow or truncate a file to its recorded size.
    Grow(String, io::Error),
    /// A positional read or write moved fewer bytes than asked.
    ShortIo(String),
    /// The requested starting block is beyond the parity size.
    BlockRange(u32, u32),
    /// A pass finished but accumulated per-block errors.
    Errors(u64),
    /// A pass stopped early at the given position after an
    /// unexpected open or close failure on a data disk.
    Danger(u32),
    /// Array configuration problem.
    Config(String),
    /// Malformed content file record.
    Content(usize, String),
    /// Any other I/O failure.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadName(path) => {
                write!(f, "unsupported name in file '{path}'")
            }
            Self::LinkTooLong(path) => {
                write!(f, "symlink '{path}' target is too long")
            }
            Self::InodeClash(inode, path) => {
                write!(f, "internal inode {inode} inconsistency for file '{path}'")
            }
            Self::LinkClash(path) => {
                write!(f, "internal inconsistency for symlink '{path}'")
            }
            Self::ZeroSized(path) => {
                write!(f, "the file '{path}' has now zero size")
            }
            Self::EmptyDisks(names) => {
                write!(
                    f,
                    "all files previously present in disk(s) {} are now missing or rewritten",
                    names.join(", ")
                )
            }
            Self::Walk(path, err) => {
                write!(f, "error scanning '{path}': {err}")
            }
            Self::Open(path, err) => {
                write!(f, "error opening file '{path}': {err}")
            }
            Self::Close(path, err) => {
                write!(f, "error closing file '{path}': {err}")
            }
            Self::Read(path, err) => {
                write!(f, "error reading file '{path}': {err}")
            }
            Self::Write(path, err) => {
                write!(f, "error writing file '{path}': {err}")
            }
            Self::Grow(path, err) => {
                write!(f, "error growing file '{path}': {err}")
            }
            Self::ShortIo(path) => {
                write!(f, "short I/O on file '{path}'")
            }
            Self::BlockRange(start, max) => {
                write!(
                    f,
                    "starting block {start} is bigger than the parity size {max}"
                )
            }
            Self::Errors(count) => write!(f, "{count} errors"),
            Self::Danger(pos) => {
                write!(f, "pass stopped at block {pos}")
            }
            Self::Config(what) => write!(f, "configuration: {what}"),
            Self::Content(line, what) => {
                write!(f, "content file line {line}: {what}")
            }
            Self::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
