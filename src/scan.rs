// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scan engine and the position allocator.
//!
//! A scan walks each disk's directory tree and diffs it against
//! the stored snapshot, producing the minimal edit script of
//! insert, remove, update, and move operations.  Files are
//! identified by inode, links by sub-path.
//!
//! Insertions are delayed until after every removal of the same
//! disk has been applied, so parity positions freed in this
//! very scan are reusable immediately.  Together with the
//! `first_free_block` hint this keeps the position space
//! compact: replacing a file with an equally sized one yields
//! the same set of positions.
//!
//! Anything that could make the snapshot ambiguous (names the
//! content file cannot represent, inode inconsistencies,
//! suspicious mass changes) fails the whole scan before it
//! mutates the allocation.

use std::ffi::CString;
use std::fs;
use std::os::unix::fs::MetadataExt;

use crate::disk::{BlockFlags, BlockPos, BlockRef, File, FileId, Link, LinkId};
use crate::filter::Filter;
use crate::result::{Error, Result};
use crate::state::State;

const PATH_MAX: usize = 4096;

/// Per-disk counters of changes seen by one scan.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Counters {
    pub equal: u32,
    pub moved: u32,
    pub change: u32,
    pub remove: u32,
    pub insert: u32,
}

/// Removes a file from the data set.
///
/// Each of its parity positions is freed and, because the
/// parity column no longer covers the removed data, the
/// `HAS_PARITY` flag is cleared on whatever block any other
/// disk keeps at the same position.
pub(crate) fn scan_file_remove(state: &mut State, d: usize, id: FileId) {
    let Some(file) = state.disks[d].file(id) else {
        return;
    };
    let positions: Vec<BlockPos> = file.blocks.iter().map(|b| b.parity_pos).collect();

    state.need_write = true;

    for pos in positions {
        let disk = &mut state.disks[d];
        if disk.first_free_block > pos {
            disk.first_free_block = pos;
        }
        if (pos as usize) < disk.blockarr.len() {
            disk.blockarr[pos as usize] = None;
        }
        for j in 0..state.disks.len() {
            if j == d {
                continue;
            }
            let oth = &mut state.disks[j];
            if let Some(bref) = oth.block_get(pos) {
                if let Some(oth_file) = oth.file_mut(bref.file) {
                    oth_file.blocks[bref.index as usize]
                        .flags
                        .remove(BlockFlags::HAS_PARITY);
                }
            }
        }
    }

    state.disks[d].drop_file(id);
}

/// Inserts a file into the data set, assigning a parity
/// position to each of its blocks.
///
/// The sweep starts at the `first_free_block` hint and walks
/// forward over the allocation table, growing it by one slot
/// whenever the search runs off the end.  The hint advances
/// monotonically across one scan, so the amortised cost stays
/// near linear in the number of blocks inserted.
pub(crate) fn scan_file_insert(state: &mut State, d: usize, file: File) -> FileId {
    state.need_write = true;

    let disk = &mut state.disks[d];
    let blockmax = file.block_count();
    let id = disk.add_file(file);

    let mut pos = disk.first_free_block;
    let mut table_max = disk.blockarr.len() as BlockPos;
    for i in 0..blockmax {
        while pos < table_max && disk.blockarr[pos as usize].is_some() {
            pos += 1;
        }
        if pos == table_max {
            disk.blockarr.push(None);
            table_max += 1;
        }
        if let Some(f) = disk.file_mut(id) {
            f.blocks[i as usize].parity_pos = pos;
        }
        disk.blockarr[pos as usize] = Some(BlockRef { file: id, index: i });
    }
    if blockmax > 0 {
        // Only move the hint if something was allocated.
        disk.first_free_block = pos + 1;
    }
    id
}

pub(crate) fn scan_link_remove(state: &mut State, d: usize, id: LinkId) {
    state.need_write = true;
    state.disks[d].drop_link(id);
}

pub(crate) fn scan_link_insert(state: &mut State, d: usize, link: Link) -> LinkId {
    state.need_write = true;
    state.disks[d].add_link(link)
}

fn readable(path: &str) -> bool {
    let Ok(cpath) = CString::new(path.as_bytes()) else {
        return false;
    };
    unsafe { libc::access(cpath.as_ptr(), libc::R_OK) == 0 }
}

fn gui(state: &State, op: &str, disk: &str, sub: &str) {
    if state.opts.gui {
        eprintln!("scan:{op}:{disk}:{sub}");
    }
}

/// Diffs one regular file against the snapshot.
fn scan_file(
    state: &mut State,
    d: usize,
    output: bool,
    counters: &mut Counters,
    inserts: &mut Vec<File>,
    sub: &str,
    md: &fs::Metadata,
) -> Result<()> {
    let inode = md.ino();
    let size = md.len();
    let mtime = md.mtime();
    let dir = state.disks[d].dir.clone();
    let name = state.disks[d].name.clone();

    if let Some(id) = state.disks[d].find_inode(inode) {
        let (old_sub, old_size, old_mtime, old_present) = {
            let file = state.disks[d].file(id).unwrap_or_else(|| {
                unreachable!("fileset names a live file")
            });
            (file.sub.clone(), file.size, file.mtime, file.present)
        };

        if old_present {
            // Already seen in this scan under another name.
            if md.nlink() > 1 {
                tracing::warn!("ignored hardlink '{dir}{sub}'");
                return Ok(());
            }
            return Err(Error::InodeClash(inode, format!("{dir}{sub}")));
        }

        if old_size == size && old_mtime == mtime {
            let file = state.disks[d].file_mut(id).unwrap_or_else(|| {
                unreachable!("fileset names a live file")
            });
            file.present = true;
            if old_sub != sub {
                counters.moved += 1;
                gui(state, "move", &name, sub);
                if output {
                    println!("Move '{dir}{old_sub}' '{dir}{sub}'");
                }
                let file = state.disks[d].file_mut(id).unwrap_or_else(|| {
                    unreachable!("fileset names a live file")
                });
                file.sub = sub.to_string();
                state.need_write = true;
            } else {
                counters.equal += 1;
                gui(state, "equal", &name, sub);
            }
            return Ok(());
        }

        // The common post-crash accident of a file zeroed in
        // place must not silently propagate into the parity.
        if old_size != 0 && size == 0 && old_sub == sub && !state.opts.force_zero {
            return Err(Error::ZeroSized(format!("{dir}{sub}")));
        }

        if old_sub == sub {
            counters.change += 1;
            gui(state, "update", &name, sub);
            if output {
                println!("Update '{dir}{sub}'");
            }
        } else {
            // Inode reuse under a new name.
            counters.remove += 1;
            counters.insert += 1;
            gui(state, "remove", &name, &old_sub);
            gui(state, "add", &name, sub);
            if output {
                println!("Remove '{dir}{old_sub}'");
                println!("Add '{dir}{sub}'");
            }
        }

        scan_file_remove(state, d, id);
        // Fall through and reinsert with the fresh metadata.
    } else {
        // Delayed inserts are not in the inode set yet, so a
        // second hardlink to a file first seen in this very
        // scan is caught here.
        if let Some(prev) = inserts.iter().find(|f| f.inode == inode) {
            if md.nlink() > 1 {
                tracing::warn!("ignored hardlink '{dir}{sub}'");
                return Ok(());
            }
            return Err(Error::InodeClash(inode, format!("{}{}", dir, prev.sub)));
        }
        counters.insert += 1;
    }

    let mut file = File::new(state.block_size, sub, size, mtime, inode);
    file.present = true;
    inserts.push(file);
    Ok(())
}

/// Diffs one symbolic link against the snapshot.
fn scan_link(
    state: &mut State,
    d: usize,
    output: bool,
    counters: &mut Counters,
    inserts: &mut Vec<Link>,
    sub: &str,
    to: &str,
) -> Result<()> {
    let dir = state.disks[d].dir.clone();
    let name = state.disks[d].name.clone();

    if let Some(id) = state.disks[d].find_link(sub) {
        let (old_to, old_present) = {
            let link = state.disks[d].link(id).unwrap_or_else(|| {
                unreachable!("linkset names a live link")
            });
            (link.to.clone(), link.present)
        };
        if old_present {
            return Err(Error::LinkClash(format!("{dir}{sub}")));
        }
        {
            let link = state.disks[d].link_mut(id).unwrap_or_else(|| {
                unreachable!("linkset names a live link")
            });
            link.present = true;
        }
        if old_to == to {
            counters.equal += 1;
            gui(state, "equal", &name, sub);
        } else {
            counters.change += 1;
            gui(state, "update", &name, sub);
            if output {
                println!("Update '{dir}{sub}'");
            }
            let link = state.disks[d].link_mut(id).unwrap_or_else(|| {
                unreachable!("linkset names a live link")
            });
            link.to = to.to_string();
            state.need_write = true;
        }
        return Ok(());
    }

    if inserts.iter().any(|l| l.sub == sub) {
        return Err(Error::LinkClash(format!("{dir}{sub}")));
    }
    counters.insert += 1;
    inserts.push(Link {
        sub: sub.to_string(),
        to: to.to_string(),
        present: true,
    });
    Ok(())
}

/// Walks one directory level.  `sub` is either empty or ends
/// with a slash.
#[allow(clippy::too_many_arguments)]
fn scan_dir(
    state: &mut State,
    filter: &Filter,
    d: usize,
    sub: &str,
    output: bool,
    counters: &mut Counters,
    file_inserts: &mut Vec<File>,
    link_inserts: &mut Vec<Link>,
) -> Result<()> {
    let dir = state.disks[d].path(sub);
    let entries = fs::read_dir(&dir).map_err(|e| Error::Walk(dir.clone(), e))?;

    // Sorted so traversal order, and with it position
    // allocation, does not depend on readdir order.
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::Walk(dir.clone(), e))?;
        names.push(entry.file_name());
    }
    names.sort();

    for os_name in names {
        let Some(entry_name) = os_name.to_str() else {
            return Err(Error::BadName(format!(
                "{dir}{}",
                os_name.to_string_lossy()
            )));
        };
        if entry_name == "." || entry_name == ".." {
            continue;
        }

        let path_next = format!("{dir}{entry_name}");
        let sub_next = format!("{sub}{entry_name}");

        // Names the content file cannot round-trip.
        if entry_name.is_empty()
            || entry_name.contains('\n')
            || entry_name.ends_with('\r')
        {
            return Err(Error::BadName(path_next));
        }

        let md = fs::symlink_metadata(&path_next)
            .map_err(|e| Error::Walk(path_next.clone(), e))?;
        let ft = md.file_type();

        if ft.is_file() {
            if filter.excluded(&sub_next, false) {
                if state.opts.verbose {
                    println!("Excluding file '{path_next}'");
                }
                continue;
            }
            if !readable(&path_next) {
                tracing::warn!(
                    "ignoring, for missing read permission, file '{path_next}'"
                );
                continue;
            }
            scan_file(state, d, output, counters, file_inserts, &sub_next, &md)?;
        } else if ft.is_symlink() {
            if filter.excluded(&sub_next, false) {
                if state.opts.verbose {
                    println!("Excluding file '{path_next}'");
                }
                continue;
            }
            let target = fs::read_link(&path_next)
                .map_err(|e| Error::Walk(path_next.clone(), e))?;
            let Ok(target) = target.into_os_string().into_string() else {
                return Err(Error::BadName(path_next));
            };
            if target.len() >= PATH_MAX {
                return Err(Error::LinkTooLong(path_next));
            }
            scan_link(state, d, output, counters, link_inserts, &sub_next, &target)?;
        } else if ft.is_dir() {
            if filter.excluded(&sub_next, true) {
                if state.opts.verbose {
                    println!("Excluding directory '{path_next}'");
                }
                continue;
            }
            let sub_dir = format!("{sub_next}/");
            scan_dir(
                state,
                filter,
                d,
                &sub_dir,
                output,
                counters,
                file_inserts,
                link_inserts,
            )?;
        } else if filter.excluded(&sub_next, false) {
            if state.opts.verbose {
                println!("Excluding special file '{path_next}'");
            }
        } else {
            tracing::warn!("ignoring special file '{path_next}'");
        }
    }
    Ok(())
}

/// Reconciles the in-memory snapshot with the disks.
///
/// With `output` set, every difference is printed.  Returns the
/// per-disk change counters, in disk order.
pub fn scan(state: &mut State, output: bool) -> Result<Vec<Counters>> {
    let filter = state.filter.clone();
    let mut all = Vec::with_capacity(state.disks.len());

    for d in 0..state.disks.len() {
        println!("Scanning disk {}...", state.disks[d].name);

        // Forget the previous scan's sightings.
        let disk = &mut state.disks[d];
        for file in disk.files.iter_mut().flatten() {
            file.present = false;
        }
        for link in disk.links.iter_mut().flatten() {
            link.present = false;
        }

        let mut counters = Counters::default();
        let mut file_inserts: Vec<File> = Vec::new();
        let mut link_inserts: Vec<Link> = Vec::new();

        scan_dir(
            state,
            &filter,
            d,
            "",
            output,
            &mut counters,
            &mut file_inserts,
            &mut link_inserts,
        )?;

        let dir = state.disks[d].dir.clone();
        let name = state.disks[d].name.clone();

        // Sweep files and links the walk did not see.
        let gone: Vec<(FileId, String)> = state.disks[d]
            .iter_files()
            .filter(|(_, f)| !f.present)
            .map(|(id, f)| (id, f.sub.clone()))
            .collect();
        for (id, sub) in gone {
            counters.remove += 1;
            gui(state, "remove", &name, &sub);
            if output {
                println!("Remove '{dir}{sub}'");
            }
            scan_file_remove(state, d, id);
        }
        let gone: Vec<(LinkId, String)> = state.disks[d]
            .iter_links()
            .filter(|(_, l)| !l.present)
            .map(|(id, l)| (id, l.sub.clone()))
            .collect();
        for (id, sub) in gone {
            counters.remove += 1;
            gui(state, "remove", &name, &sub);
            if output {
                println!("Remove '{dir}{sub}'");
            }
            scan_link_remove(state, d, id);
        }

        // Only now drain the delayed inserts, so the positions
        // freed above are available for reuse.
        for file in file_inserts {
            gui(state, "add", &name, &file.sub);
            if output {
                println!("Add '{}{}'", dir, file.sub);
            }
            scan_file_insert(state, d, file);
        }
        for link in link_inserts {
            gui(state, "add", &name, &link.sub);
            if output {
                println!("Add '{}{}'", dir, link.sub);
            }
            scan_link_insert(state, d, link);
        }

        state.disks[d].compact();
        all.push(counters);
    }

    // A disk that lost every tracked file is far more likely
    // unmounted or reformatted than legitimately emptied.
    if !state.opts.force_empty {
        let empty: Vec<String> = state
            .disks
            .iter()
            .zip(all.iter())
            .filter(|(_, c)| c.equal == 0 && c.moved == 0 && c.remove > 0)
            .map(|(disk, _)| disk.name.clone())
            .collect();
        if !empty.is_empty() {
            return Err(Error::EmptyDisks(empty));
        }
    }

    if state.opts.verbose || output {
        let mut total = Counters::default();
        for c in &all {
            total.equal += c.equal;
            total.moved += c.moved;
            total.change += c.change;
            total.remove += c.remove;
            total.insert += c.insert;
        }
        if state.opts.verbose {
            println!("\tequal {}", total.equal);
            println!("\tmoved {}", total.moved);
            println!("\tchanged {}", total.change);
            println!("\tremoved {}", total.remove);
            println!("\tadded {}", total.insert);
        }
        if output
            && total.moved == 0
            && total.change == 0
            && total.remove == 0
            && total.insert == 0
        {
            println!("No difference");
        }
    }

    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Options;
    use std::collections::BTreeSet;

    fn test_state(block_size: u32, dirs: &[&str]) -> State {
        State {
            block_size,
            content: String::new(),
            parity_path: vec!["unused".to_string()],
            disks: dirs
                .iter()
                .enumerate()
                .map(|(i, dir)| crate::disk::Disk::new(&format!("d{i}"), dir))
                .collect(),
            filter: Filter::default(),
            opts: Options::default(),
            need_write: false,
        }
    }

    fn positions(state: &State, d: usize, sub: &str) -> BTreeSet<BlockPos> {
        let (_, file) = state.disks[d]
            .iter_files()
            .find(|(_, f)| f.sub == sub)
            .expect("file is tracked");
        file.blocks.iter().map(|b| b.parity_pos).collect()
    }

    fn two_disks() -> (tempfile::TempDir, tempfile::TempDir, State) {
        let t0 = tempfile::tempdir().unwrap();
        let t1 = tempfile::tempdir().unwrap();
        let state = test_state(
            4,
            &[&t0.path().display().to_string(), &t1.path().display().to_string()],
        );
        (t0, t1, state)
    }

    #[test]
    fn insert_allocates_compactly() {
        let (t0, _t1, mut state) = two_disks();
        fs::write(t0.path().join("a"), b"ABCDE").unwrap();

        let counters = scan(&mut state, false).unwrap();
        assert_eq!(counters[0].insert, 1);
        assert_eq!(counters[0].equal, 0);
        assert_eq!(counters[1], Counters::default());
        assert_eq!(positions(&state, 0, "a"), BTreeSet::from([0, 1]));
        assert_eq!(state.disks[0].table_len(), 2);
        assert_eq!(state.disks[1].table_len(), 0);
        assert_eq!(state.parity_allocated_size(), 2);
        assert!(state.need_write);
        state.disks[0].assert_invariants();
    }

    #[test]
    fn rescan_is_idempotent() {
        let (t0, _t1, mut state) = two_disks();
        fs::write(t0.path().join("a"), b"ABCDE").unwrap();
        scan(&mut state, false).unwrap();

        state.need_write = false;
        let counters = scan(&mut state, false).unwrap();
        assert_eq!(counters[0].equal, 1);
        assert_eq!(counters[0].moved, 0);
        assert_eq!(counters[0].change, 0);
        assert_eq!(counters[0].remove, 0);
        assert_eq!(counters[0].insert, 0);
        assert!(!state.need_write);
    }

    #[test]
    fn rename_is_a_move() {
        let (t0, _t1, mut state) = two_disks();
        fs::write(t0.path().join("a"), b"ABCDE").unwrap();
        scan(&mut state, false).unwrap();
        let before = positions(&state, 0, "a");

        fs::rename(t0.path().join("a"), t0.path().join("b")).unwrap();
        state.need_write = false;
        let counters = scan(&mut state, false).unwrap();
        assert_eq!(counters[0].moved, 1);
        assert_eq!(counters[0].equal, 0);
        assert_eq!(counters[0].insert, 0);
        assert_eq!(positions(&state, 0, "b"), before);
        assert!(state.need_write);
        state.disks[0].assert_invariants();
    }

    #[test]
    fn growth_is_a_change_and_invalidates_neighbours() {
        let (t0, t1, mut state) = two_disks();
        fs::write(t0.path().join("a"), b"ABCDE").unwrap();
        fs::write(t1.path().join("x"), b"12345678").unwrap();
        scan(&mut state, false).unwrap();

        // Pretend d1's column was synced.
        let (xid, _) = state.disks[1].iter_files().next().unwrap();
        for b in &mut state.disks[1].file_mut(xid).unwrap().blocks {
            b.flags |= BlockFlags::HAS_PARITY;
        }

        fs::write(t0.path().join("a"), b"ABCDEFGHI").unwrap();
        let counters = scan(&mut state, false).unwrap();
        assert_eq!(counters[0].change, 1);
        assert_eq!(counters[0].insert, 0);
        assert_eq!(positions(&state, 0, "a"), BTreeSet::from([0, 1, 2]));
        // d0 freed positions 0 and 1, so d1's blocks there lost
        // their parity claim; position 2 was never freed.
        let x = state.disks[1].file(xid).unwrap();
        assert!(!x.blocks[0].has_parity());
        assert!(!x.blocks[1].has_parity());
        state.disks[0].assert_invariants();
        state.disks[1].assert_invariants();
    }

    #[test]
    fn inode_reuse_is_remove_plus_insert() {
        let (t0, _t1, mut state) = two_disks();
        fs::write(t0.path().join("a"), b"ABCDE").unwrap();
        scan(&mut state, false).unwrap();

        // Same inode, new name, new size.
        fs::rename(t0.path().join("a"), t0.path().join("c")).unwrap();
        fs::write(t0.path().join("c"), b"ABCDEFGH").unwrap();
        let counters = scan(&mut state, false).unwrap();
        assert_eq!(counters[0].remove, 1);
        assert_eq!(counters[0].insert, 1);
        assert_eq!(counters[0].change, 0);
        assert_eq!(positions(&state, 0, "c"), BTreeSet::from([0, 1]));
        state.disks[0].assert_invariants();
    }

    #[test]
    fn zero_size_needs_force() {
        let (t0, _t1, mut state) = two_disks();
        fs::write(t0.path().join("a"), b"ABCDE").unwrap();
        scan(&mut state, false).unwrap();

        fs::write(t0.path().join("a"), b"").unwrap();
        assert!(matches!(scan(&mut state, false), Err(Error::ZeroSized(_))));

        state.opts.force_zero = true;
        let counters = scan(&mut state, false).unwrap();
        assert_eq!(counters[0].change, 1);
        let (_, file) = state.disks[0].iter_files().next().unwrap();
        assert_eq!(file.block_count(), 0);
        assert!(state.disks[0].block_get(0).is_none());
        assert!(state.disks[0].block_get(1).is_none());
        state.disks[0].assert_invariants();
    }

    #[test]
    fn emptied_disk_needs_force() {
        let (t0, t1, mut state) = two_disks();
        let dirs = [
            t0.path().display().to_string(),
            t1.path().display().to_string(),
        ];
        let mut forced = test_state(4, &[&dirs[0], &dirs[1]]);
        forced.opts.force_empty = true;

        fs::write(t0.path().join("a"), b"ABCDE").unwrap();
        scan(&mut state, false).unwrap();
        scan(&mut forced, false).unwrap();

        fs::remove_file(t0.path().join("a")).unwrap();
        assert!(matches!(scan(&mut state, false), Err(Error::EmptyDisks(_))));

        let counters = scan(&mut forced, false).unwrap();
        assert_eq!(counters[0].remove, 1);
        assert_eq!(forced.disks[0].iter_files().count(), 0);
    }

    #[test]
    fn freed_positions_are_reused() {
        let (t0, _t1, mut state) = two_disks();
        fs::write(t0.path().join("a"), b"12345678").unwrap();
        fs::write(t0.path().join("b"), b"1234").unwrap();
        scan(&mut state, false).unwrap();
        let a_pos = positions(&state, 0, "a");
        assert_eq!(a_pos, BTreeSet::from([0, 1]));
        assert_eq!(positions(&state, 0, "b"), BTreeSet::from([2]));

        // Replace `a` with an equally sized file: the removal
        // happens before the insert, so the positions match.
        fs::remove_file(t0.path().join("a")).unwrap();
        fs::write(t0.path().join("z"), b"abcdefgh").unwrap();
        let counters = scan(&mut state, false).unwrap();
        assert_eq!(counters[0].remove, 1);
        assert_eq!(counters[0].insert, 1);
        assert_eq!(positions(&state, 0, "z"), a_pos);
        assert_eq!(state.disks[0].table_len(), 3);
        state.disks[0].assert_invariants();
    }

    #[test]
    fn links_diff_by_target() {
        let (t0, _t1, mut state) = two_disks();
        fs::write(t0.path().join("a"), b"ABCD").unwrap();
        std::os::unix::fs::symlink("a", t0.path().join("l")).unwrap();
        let counters = scan(&mut state, false).unwrap();
        assert_eq!(counters[0].insert, 2);

        // Same target: equal.
        let counters = scan(&mut state, false).unwrap();
        assert_eq!(counters[0].equal, 2);

        // Retargeted: change.
        fs::remove_file(t0.path().join("l")).unwrap();
        std::os::unix::fs::symlink("elsewhere", t0.path().join("l")).unwrap();
        let counters = scan(&mut state, false).unwrap();
        assert_eq!(counters[0].change, 1);
        let (_, link) = state.disks[0].iter_links().next().unwrap();
        assert_eq!(link.to, "elsewhere");

        // Gone: remove.
        fs::remove_file(t0.path().join("l")).unwrap();
        let counters = scan(&mut state, false).unwrap();
        assert_eq!(counters[0].remove, 1);
        assert_eq!(state.disks[0].iter_links().count(), 0);
    }

    #[test]
    fn excluded_files_are_skipped() {
        let (t0, _t1, mut state) = two_disks();
        state.filter = Filter::new(&["*.tmp".to_string()]);
        fs::write(t0.path().join("keep"), b"ABCD").unwrap();
        fs::write(t0.path().join("drop.tmp"), b"ABCD").unwrap();
        let counters = scan(&mut state, false).unwrap();
        assert_eq!(counters[0].insert, 1);
        assert_eq!(state.disks[0].iter_files().count(), 1);
    }

    #[test]
    fn newline_in_name_is_fatal() {
        let (t0, _t1, mut state) = two_disks();
        fs::write(t0.path().join("bad\nname"), b"ABCD").unwrap();
        assert!(matches!(scan(&mut state, false), Err(Error::BadName(_))));
    }

    #[test]
    fn second_hardlink_is_ignored() {
        let (t0, _t1, mut state) = two_disks();
        fs::write(t0.path().join("a"), b"ABCD").unwrap();
        fs::hard_link(t0.path().join("a"), t0.path().join("b")).unwrap();
        let counters = scan(&mut state, false).unwrap();
        assert_eq!(counters[0].insert, 1);
        assert_eq!(state.disks[0].iter_files().count(), 1);

        // And on the next scan the tracked name stays present;
        // the second sighting is ignored again.
        let counters = scan(&mut state, false).unwrap();
        assert_eq!(counters[0].equal, 1);
        assert_eq!(counters[0].remove, 0);
    }

    #[test]
    fn subdirectories_are_walked() {
        let (t0, _t1, mut state) = two_disks();
        fs::create_dir(t0.path().join("sub")).unwrap();
        fs::write(t0.path().join("sub/f"), b"ABCD").unwrap();
        let counters = scan(&mut state, false).unwrap();
        assert_eq!(counters[0].insert, 1);
        assert_eq!(positions(&state, 0, "sub/f"), BTreeSet::from([0]));
    }
}
