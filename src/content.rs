// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The content file: the persistent record of every tracked
//! file, link, and block-to-parity-position assignment.
//!
//! The format is line oriented text.  Sub-paths go last on
//! their line so they may contain spaces; the scan guarantees
//! they never contain a newline.  Serialization is
//! deterministic (disks in configured order, files and links in
//! insertion order, blocks in file order), so an unchanged
//! state round-trips byte for byte.
//!
//! ```text
//! parsnap content 1
//! blksize 262144
//! file d0 5 1700000000 4242 docs/a
//! blk 0 ph 9f86d08...
//! blk 1 - -
//! link d0 docs/latest
//! to a
//! ```
//!
//! The file is replaced atomically: written to a sibling
//! temporary, synced, then renamed over the old copy.

use std::fs;
use std::io::Write as _;

use crate::disk::{BlockFlags, BlockPos, BlockRef, File, HASH_LEN, Link};
use crate::result::{Error, Result};
use crate::state::State;

fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

fn from_hex(s: &str) -> Option<[u8; HASH_LEN]> {
    if s.len() != HASH_LEN * 2 {
        return None;
    }
    let mut out = [0u8; HASH_LEN];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[i] = (hi * 16 + lo) as u8;
    }
    Some(out)
}

fn flags_str(flags: BlockFlags) -> String {
    let mut s = String::new();
    if flags.contains(BlockFlags::HAS_PARITY) {
        s.push('p');
    }
    if flags.contains(BlockFlags::HASHED) {
        s.push('h');
    }
    if s.is_empty() {
        s.push('-');
    }
    s
}

fn flags_parse(s: &str) -> Option<BlockFlags> {
    let mut flags = BlockFlags::empty();
    if s == "-" {
        return Some(flags);
    }
    for c in s.chars() {
        match c {
            'p' => flags |= BlockFlags::HAS_PARITY,
            'h' => flags |= BlockFlags::HASHED,
            _ => return None,
        }
    }
    Some(flags)
}

/// Serializes the state to a string.
fn serialize(state: &State) -> String {
    let mut out = String::new();
    out.push_str("parsnap content 1\n");
    out.push_str(&format!("blksize {}\n", state.block_size));
    for disk in &state.disks {
        for (_, file) in disk.iter_files() {
            out.push_str(&format!(
                "file {} {} {} {} {}\n",
                disk.name, file.size, file.mtime, file.inode, file.sub
            ));
            for block in &file.blocks {
                let hash = if block.is_hashed() {
                    to_hex(&block.hash)
                } else {
                    "-".to_string()
                };
                out.push_str(&format!(
                    "blk {} {} {}\n",
                    block.parity_pos,
                    flags_str(block.flags),
                    hash
                ));
            }
        }
        for (_, link) in disk.iter_links() {
            out.push_str(&format!("link {} {}\n", disk.name, link.sub));
            out.push_str(&format!("to {}\n", link.to));
        }
    }
    out
}

/// Writes the content file atomically.
pub fn save(state: &State) -> Result<()> {
    let text = serialize(state);
    let tmp = format!("{}.tmp", state.content);
    let mut f = fs::File::create(&tmp).map_err(|e| Error::Open(tmp.clone(), e))?;
    f.write_all(text.as_bytes())
        .map_err(|e| Error::Write(tmp.clone(), e))?;
    f.sync_all().map_err(|e| Error::Write(tmp.clone(), e))?;
    drop(f);
    fs::rename(&tmp, &state.content)
        .map_err(|e| Error::Write(state.content.clone(), e))?;
    Ok(())
}

struct OpenFile {
    disk: usize,
    id: crate::disk::FileId,
    /// Next expected block index.
    next: u32,
}

/// Reads the content file into the state's disks.
pub fn load(state: &mut State) -> Result<()> {
    let text = fs::read_to_string(&state.content)
        .map_err(|e| Error::Read(state.content.clone(), e))?;
    let lines: Vec<&str> = text.lines().collect();
    let mut cur: Option<OpenFile> = None;
    let mut i = 0;
    while i < lines.len() {
        let lineno = i + 1;
        let line = lines[i];
        let (kind, rest) = line.split_once(' ').unwrap_or((line, ""));
        match kind {
            "parsnap" => {
                if rest != "content 1" {
                    return Err(Error::Content(lineno, format!("unknown format '{rest}'")));
                }
            }
            "blksize" => {
                let bs: u32 = rest
                    .parse()
                    .map_err(|_| Error::Content(lineno, "bad block size".into()))?;
                if bs != state.block_size {
                    return Err(Error::Content(
                        lineno,
                        format!("block size {bs} does not match the configuration"),
                    ));
                }
            }
            "file" => {
                finish_file(state, cur.take(), lineno)?;
                cur = Some(parse_file(state, rest, lineno)?);
            }
            "blk" => {
                let open = cur
                    .as_mut()
                    .ok_or_else(|| Error::Content(lineno, "blk outside a file".into()))?;
                parse_blk(state, open, rest, lineno)?;
            }
            "link" => {
                finish_file(state, cur.take(), lineno)?;
                let Some(&to_line) = lines.get(i + 1) else {
                    return Err(Error::Content(lineno, "link without target".into()));
                };
                let to = to_line
                    .strip_prefix("to ")
                    .ok_or_else(|| Error::Content(lineno + 1, "link without target".into()))?;
                parse_link(state, rest, to, lineno)?;
                i += 1;
            }
            _ => {
                return Err(Error::Content(lineno, format!("unknown record '{kind}'")));
            }
        }
        i += 1;
    }
    finish_file(state, cur.take(), lines.len())?;
    Ok(())
}

fn disk_index(state: &State, name: &str, lineno: usize) -> Result<usize> {
    state
        .disks
        .iter()
        .position(|d| d.name == name)
        .ok_or_else(|| Error::Content(lineno, format!("unknown disk '{name}'")))
}

fn finish_file(state: &State, open: Option<OpenFile>, lineno: usize) -> Result<()> {
    if let Some(open) = open {
        let file = state.disks[open.disk]
            .file(open.id)
            .ok_or_else(|| Error::Content(lineno, "dangling file".into()))?;
        if open.next != file.block_count() {
            return Err(Error::Content(
                lineno,
                format!("file '{}' is missing block records", file.sub),
            ));
        }
    }
    Ok(())
}

fn parse_file(state: &mut State, rest: &str, lineno: usize) -> Result<OpenFile> {
    let bad = || Error::Content(lineno, "malformed file record".into());
    let mut it = rest.splitn(4, ' ');
    let name = it.next().ok_or_else(bad)?;
    let size: u64 = it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let mtime: i64 = it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let tail = it.next().ok_or_else(bad)?;
    let (inode_str, sub) = tail.split_once(' ').ok_or_else(bad)?;
    let inode: u64 = inode_str.parse().map_err(|_| bad())?;
    if sub.is_empty() {
        return Err(bad());
    }
    let d = disk_index(state, name, lineno)?;
    if state.disks[d].find_inode(inode).is_some() {
        return Err(Error::Content(
            lineno,
            format!("duplicate inode {inode} on disk '{name}'"),
        ));
    }
    let file = File::new(state.block_size, sub, size, mtime, inode);
    let id = state.disks[d].add_file(file);
    Ok(OpenFile { disk: d, id, next: 0 })
}

fn parse_blk(state: &mut State, open: &mut OpenFile, rest: &str, lineno: usize) -> Result<()> {
    let bad = || Error::Content(lineno, "malformed blk record".into());
    let mut it = rest.split(' ');
    let pos: BlockPos = it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let flags = flags_parse(it.next().ok_or_else(bad)?).ok_or_else(bad)?;
    let hash_str = it.next().ok_or_else(bad)?;
    let disk = &mut state.disks[open.disk];
    let index = open.next;
    let file = disk
        .file_mut(open.id)
        .ok_or_else(|| Error::Content(lineno, "dangling file".into()))?;
    if index >= file.block_count() {
        return Err(Error::Content(
            lineno,
            format!("too many block records for file '{}'", file.sub),
        ));
    }
    let block = &mut file.blocks[index as usize];
    block.parity_pos = pos;
    block.flags = flags;
    if flags.contains(BlockFlags::HASHED) {
        block.hash = from_hex(hash_str).ok_or_else(bad)?;
    } else if hash_str != "-" {
        return Err(bad());
    }
    // Wire the allocation table cell, growing the table on demand.
    if disk.blockarr.len() <= pos as usize {
        disk.blockarr.resize(pos as usize + 1, None);
    }
    let cell = &mut disk.blockarr[pos as usize];
    if cell.is_some() {
        return Err(Error::Content(
            lineno,
            format!("parity position {pos} is owned twice"),
        ));
    }
    *cell = Some(BlockRef { file: open.id, index });
    open.next += 1;
    Ok(())
}

fn parse_link(state: &mut State, rest: &str, to: &str, lineno: usize) -> Result<()> {
    let bad = || Error::Content(lineno, "malformed link record".into());
    let (name, sub) = rest.split_once(' ').ok_or_else(bad)?;
    if sub.is_empty() {
        return Err(bad());
    }
    let d = disk_index(state, name, lineno)?;
    if state.disks[d].find_link(sub).is_some() {
        return Err(Error::Content(
            lineno,
            format!("duplicate link '{sub}' on disk '{name}'"),
        ));
    }
    state.disks[d].add_link(Link {
        sub: sub.to_string(),
        to: to.to_string(),
        present: false,
    });
    Ok(())
}
