// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The in-memory model of the array: block records, files,
//! symbolic links, and the per-disk allocation table that maps
//! parity positions back to the block records occupying them.
//!
//! Every disk is independent except for the parity position
//! space, which all disks share: position `p` names the same
//! parity column on every disk.  Within one disk the cross
//! links are bijective; for every file `f` and block index `i`,
//! `blockarr[f.blocks[i].parity_pos]` refers back to exactly
//! that block record.
//!
//! Files own their block records.  The allocation table stores
//! weak `(file, index)` handles into a per-disk arena, never an
//! owning reference, so removing a file cannot leave a dangling
//! owner behind.

use std::collections::HashMap;

use bitflags::bitflags;
use static_assertions::const_assert;

/// Size of the hash used as a block checksum.
pub const HASH_LEN: usize = 32;

/// Basic block position type.
///
/// With 32 bits and 256 KiB blocks the parity space addresses
/// a petabyte per disk, which is plenty.
pub type BlockPos = u32;

/// Position of a block that has not been allocated yet.
pub const POS_INVALID: BlockPos = u32::MAX;

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 256 * 1024;

const_assert!(DEFAULT_BLOCK_SIZE.is_power_of_two());

bitflags! {
    /// Per-block state bits.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct BlockFlags: u8 {
        /// The parity at this block's position is consistent
        /// with the block's current content.
        const HAS_PARITY = 1 << 0;
        /// The stored hash describes the block's content.
        const HASHED = 1 << 1;
    }
}

/// Metadata for one block of one file.
#[derive(Clone, Debug)]
pub struct Block {
    /// Position of the block in the parity.
    pub parity_pos: BlockPos,
    pub flags: BlockFlags,
    /// Hash of the block content; valid iff `HASHED` is set.
    pub hash: [u8; HASH_LEN],
}

impl Block {
    pub fn new() -> Block {
        Block {
            parity_pos: POS_INVALID,
            flags: BlockFlags::empty(),
            hash: [0; HASH_LEN],
        }
    }

    pub fn has_parity(&self) -> bool {
        self.flags.contains(BlockFlags::HAS_PARITY)
    }

    pub fn is_hashed(&self) -> bool {
        self.flags.contains(BlockFlags::HASHED)
    }
}

impl Default for Block {
    fn default() -> Block {
        Block::new()
    }
}

/// A regular file tracked by the array.
#[derive(Clone, Debug)]
pub struct File {
    /// Path relative to the disk root.  Forward slashes, no
    /// leading or trailing slash.  The disk is implicit.
    pub sub: String,
    pub size: u64,
    /// Modification time, whole seconds.
    pub mtime: i64,
    pub inode: u64,
    pub blocks: Vec<Block>,
    /// Seen by the scan currently in progress.
    pub present: bool,
}

impl File {
    /// Creates a file record with `ceil(size / block_size)`
    /// fresh block records.  Zero-length files own no blocks.
    pub fn new(block_size: u32, sub: &str, size: u64, mtime: i64, inode: u64) -> File {
        let count = size.div_ceil(u64::from(block_size));
        File {
            sub: sub.to_string(),
            size,
            mtime,
            inode,
            blocks: vec![Block::new(); count as usize],
            present: false,
        }
    }

    pub fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    /// The number of file bytes covered by block `i`.  The last
    /// block of a file may be shorter than the block size.
    pub fn block_size_at(&self, i: u32, block_size: u32) -> u32 {
        let off = u64::from(i) * u64::from(block_size);
        let left = self.size - off;
        u64::from(block_size).min(left) as u32
    }
}

/// A symbolic link tracked by the array, compared by target.
#[derive(Clone, Debug)]
pub struct Link {
    pub sub: String,
    /// The link target, as returned by readlink.
    pub to: String,
    pub present: bool,
}

/// Weak handle to a file in a disk's arena.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileId(pub(crate) u32);

/// Weak handle to a link in a disk's arena.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LinkId(pub(crate) u32);

/// One cell of the allocation table: the block record that
/// occupies a parity position, named by file and block index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockRef {
    pub file: FileId,
    pub index: u32,
}

/// A data disk: a named root directory, the files and links
/// found under it, and the allocation table.
pub struct Disk {
    pub name: String,
    /// Root directory.  Always terminates with a slash.
    pub dir: String,
    /// File arena; freed slots are reused.
    pub(crate) files: Vec<Option<File>>,
    files_free: Vec<u32>,
    /// Files in insertion order.  May reference freed arena
    /// slots between a removal and the next [`Disk::compact`].
    pub(crate) filelist: Vec<FileId>,
    /// Files by inode.
    pub(crate) fileset: HashMap<u64, FileId>,
    pub(crate) links: Vec<Option<Link>>,
    links_free: Vec<u32>,
    pub(crate) linklist: Vec<LinkId>,
    /// Links by sub-path.
    pub(crate) linkset: HashMap<String, LinkId>,
    /// Allocation table, indexed by parity position.
    pub(crate) blockarr: Vec<Option<BlockRef>>,
    /// Lower bound on the first free parity position.  May lag
    /// after removals; never beyond an existing free slot.
    pub(crate) first_free_block: BlockPos,
}

impl Disk {
    pub fn new(name: &str, dir: &str) -> Disk {
        let mut dir = dir.to_string();
        if !dir.ends_with('/') {
            dir.push('/');
        }
        Disk {
            name: name.to_string(),
            dir,
            files: Vec::new(),
            files_free: Vec::new(),
            filelist: Vec::new(),
            fileset: HashMap::new(),
            links: Vec::new(),
            links_free: Vec::new(),
            linklist: Vec::new(),
            linkset: HashMap::new(),
            blockarr: Vec::new(),
            first_free_block: 0,
        }
    }

    pub fn file(&self, id: FileId) -> Option<&File> {
        self.files.get(id.0 as usize)?.as_ref()
    }

    pub fn file_mut(&mut self, id: FileId) -> Option<&mut File> {
        self.files.get_mut(id.0 as usize)?.as_mut()
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(id.0 as usize)?.as_ref()
    }

    pub fn link_mut(&mut self, id: LinkId) -> Option<&mut Link> {
        self.links.get_mut(id.0 as usize)?.as_mut()
    }

    pub fn find_inode(&self, inode: u64) -> Option<FileId> {
        self.fileset.get(&inode).copied()
    }

    pub fn find_link(&self, sub: &str) -> Option<LinkId> {
        self.linkset.get(sub).copied()
    }

    /// Length of the allocation table.
    pub fn table_len(&self) -> BlockPos {
        self.blockarr.len() as BlockPos
    }

    /// Gets the cell at a parity position.  Positions past the
    /// end of the table read as empty, without error.
    pub fn block_get(&self, pos: BlockPos) -> Option<BlockRef> {
        self.blockarr.get(pos as usize).copied().flatten()
    }

    /// Adds a file to the arena and the containers.  The blocks
    /// are not allocated here; that is the allocator's job.
    pub(crate) fn add_file(&mut self, file: File) -> FileId {
        let inode = file.inode;
        let id = match self.files_free.pop() {
            Some(slot) => {
                self.files[slot as usize] = Some(file);
                FileId(slot)
            }
            None => {
                self.files.push(Some(file));
                FileId(self.files.len() as u32 - 1)
            }
        };
        self.fileset.insert(inode, id);
        self.filelist.push(id);
        id
    }

    /// Drops a file from the arena and the containers.  The
    /// caller is responsible for having cleared its cells from
    /// the allocation table first.
    pub(crate) fn drop_file(&mut self, id: FileId) {
        if let Some(file) = self.files[id.0 as usize].take() {
            self.fileset.remove(&file.inode);
            self.files_free.push(id.0);
        }
    }

    pub(crate) fn add_link(&mut self, link: Link) -> LinkId {
        let sub = link.sub.clone();
        let id = match self.links_free.pop() {
            Some(slot) => {
                self.links[slot as usize] = Some(link);
                LinkId(slot)
            }
            None => {
                self.links.push(Some(link));
                LinkId(self.links.len() as u32 - 1)
            }
        };
        self.linkset.insert(sub, id);
        self.linklist.push(id);
        id
    }

    pub(crate) fn drop_link(&mut self, id: LinkId) {
        if let Some(link) = self.links[id.0 as usize].take() {
            self.linkset.remove(&link.sub);
            self.links_free.push(id.0);
        }
    }

    /// Removes freed arena slots from the ordered lists.
    pub(crate) fn compact(&mut self) {
        let files = &self.files;
        self.filelist.retain(|id| files[id.0 as usize].is_some());
        let links = &self.links;
        self.linklist.retain(|id| links[id.0 as usize].is_some());
    }

    /// Live files, in insertion order.
    pub fn iter_files(&self) -> impl Iterator<Item = (FileId, &File)> {
        self.filelist
            .iter()
            .filter_map(|&id| self.file(id).map(|f| (id, f)))
    }

    /// Live links, in insertion order.
    pub fn iter_links(&self) -> impl Iterator<Item = (LinkId, &Link)> {
        self.linklist
            .iter()
            .filter_map(|&id| self.link(id).map(|l| (id, l)))
    }

    /// Joins the disk root with a sub-path.
    pub fn path(&self, sub: &str) -> String {
        format!("{}{}", self.dir, sub)
    }

    /// Checks the per-disk invariants.  Test support.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        use std::collections::HashSet;

        // Every table cell points at a live block that points back.
        for (pos, cell) in self.blockarr.iter().enumerate() {
            if let Some(bref) = cell {
                let file = self.file(bref.file).expect("cell names a live file");
                let block = &file.blocks[bref.index as usize];
                assert_eq!(block.parity_pos, pos as BlockPos);
            }
        }
        // Every block of every live file occupies its cell.
        let mut seen = HashSet::new();
        for (id, file) in self.iter_files() {
            for (i, block) in file.blocks.iter().enumerate() {
                assert!(seen.insert(block.parity_pos), "position owned twice");
                let cell = self.block_get(block.parity_pos).expect("cell occupied");
                assert_eq!(cell.file, id);
                assert_eq!(cell.index, i as u32);
            }
        }
        // No position below the hint is free.
        for pos in 0..self.first_free_block {
            let occupied = self
                .blockarr
                .get(pos as usize)
                .map(|cell| cell.is_some())
                .unwrap_or(false);
            assert!(occupied, "free position {pos} below the hint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_counts() {
        let f = File::new(4, "a", 0, 0, 1);
        assert_eq!(f.block_count(), 0);
        let f = File::new(4, "a", 4, 0, 1);
        assert_eq!(f.block_count(), 1);
        let f = File::new(4, "a", 5, 0, 1);
        assert_eq!(f.block_count(), 2);
        let f = File::new(4, "a", 8, 0, 1);
        assert_eq!(f.block_count(), 2);
    }

    #[test]
    fn last_block_size() {
        let f = File::new(4, "a", 5, 0, 1);
        assert_eq!(f.block_size_at(0, 4), 4);
        assert_eq!(f.block_size_at(1, 4), 1);
        let f = File::new(4, "a", 8, 0, 1);
        assert_eq!(f.block_size_at(1, 4), 4);
    }

    #[test]
    fn arena_reuse() {
        let mut disk = Disk::new("d0", "/tmp/d0");
        assert_eq!(disk.dir, "/tmp/d0/");
        let a = disk.add_file(File::new(4, "a", 4, 0, 10));
        let b = disk.add_file(File::new(4, "b", 4, 0, 11));
        assert_eq!(disk.find_inode(10), Some(a));
        disk.drop_file(a);
        assert!(disk.file(a).is_none());
        assert_eq!(disk.find_inode(10), None);
        let c = disk.add_file(File::new(4, "c", 4, 0, 12));
        // The freed slot is recycled.
        assert_eq!(c.0, a.0);
        disk.compact();
        let subs: Vec<_> = disk.iter_files().map(|(_, f)| f.sub.clone()).collect();
        assert_eq!(subs, ["b", "c"]);
        assert_eq!(disk.find_inode(11), Some(b));
    }

    #[test]
    fn table_reads_empty_past_end() {
        let disk = Disk::new("d0", "/tmp/d0/");
        assert_eq!(disk.table_len(), 0);
        assert!(disk.block_get(100).is_none());
    }
}
