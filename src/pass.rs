// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The parity pass: one loop, four behaviours.
//!
//! Every command that touches parity walks the position space
//! in ascending order and, per position, gathers the matching
//! block from each disk through the handle cache.  What happens
//! after the gather depends on the mode:
//!
//! * `Dry` discards everything.  Its value is exercising the
//!   whole read path, data and parity, without mutating a byte.
//! * `Check` verifies stored block hashes and recomputes the
//!   parity for comparison where the whole column claims to be
//!   covered.
//! * `Sync` recomputes and writes parity for the columns that
//!   need it, then records fresh hashes and coverage flags.
//! * `Fix` rebuilds unreadable or corrupt blocks from parity
//!   and writes them back into the data files.
//!
//! Error policy follows the layering of the rest of the crate:
//! per-block read problems are counted and the pass presses on;
//! close-before-reopen failures are catastrophic and stop the
//! pass at the current position, still closing every slot on
//! the way out.

use sha2::{Digest, Sha256};

use crate::disk::{BlockFlags, BlockPos, FileId, HASH_LEN};
use crate::handle::Handle;
use crate::parity::{ParityHandle, lev_name};
use crate::progress::{Progress, Usage};
use crate::raid;
use crate::result::{Error, Result};
use crate::state::State;
use crate::util::AlignedBuf;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    Dry,
    Check,
    Sync,
    Fix,
}

impl Mode {
    fn label(self) -> &'static str {
        match self {
            Mode::Dry => "Drying",
            Mode::Check => "Checking",
            Mode::Sync => "Syncing",
            Mode::Fix => "Fixing",
        }
    }
}

fn sha256(data: &[u8]) -> [u8; HASH_LEN] {
    Sha256::digest(data).into()
}

/// True when some block in the column at `pos` lacks parity
/// coverage.
fn needs_sync(state: &State, pos: BlockPos) -> bool {
    state.disks.iter().any(|disk| {
        disk.block_get(pos)
            .and_then(|bref| disk.file(bref.file).map(|f| (f, bref.index)))
            .is_some_and(|(f, index)| !f.blocks[index as usize].has_parity())
    })
}

/// One gathered block of the current column.
struct Cell {
    disk: usize,
    disk_name: String,
    file: FileId,
    index: u32,
    rsize: usize,
    hashed: bool,
    has_parity: bool,
    hash: [u8; HASH_LEN],
    sub: String,
    ok: bool,
}

/// The full column view for the codec: one buffer per disk,
/// zeros where a disk holds nothing at this position.
fn column<'a>(
    diskmax: usize,
    cells: &[Cell],
    data: &'a [AlignedBuf],
    zero: &'a AlignedBuf,
) -> Vec<&'a [u8]> {
    (0..diskmax)
        .map(|j| {
            if cells.iter().any(|c| c.disk == j && c.ok) {
                &data[j][..]
            } else {
                &zero[..]
            }
        })
        .collect()
}

/// Runs a parity pass.  A zero `blockcount` means "to the end".
pub fn run(
    state: &mut State,
    mode: Mode,
    blockstart: BlockPos,
    blockcount: BlockPos,
) -> Result<()> {
    println!("{}...", mode.label());

    let allocated = state.parity_allocated_size();
    if blockstart > allocated {
        return Err(Error::BlockRange(blockstart, allocated));
    }
    let mut blockmax = allocated;
    if blockcount != 0 && blockstart + blockcount < blockmax {
        blockmax = blockstart + blockcount;
    }

    // Open the parity files.  Sync must be able to write them;
    // the read-only passes keep going without.
    let levels = state.levels();
    let mut parity: Vec<Option<ParityHandle>> = Vec::with_capacity(levels);
    for l in 0..levels {
        let path = state.parity_path[l].clone();
        if mode == Mode::Sync {
            let size = u64::from(allocated) * u64::from(state.block_size);
            parity.push(Some(ParityHandle::create(l, &path, size)?));
        } else {
            match ParityHandle::open(l, &path) {
                Ok(h) => parity.push(Some(h)),
                Err(_) => {
                    println!("No accessible {} file.", lev_name(l));
                    parity.push(None);
                }
            }
        }
    }

    let mut errors: u64 = 0;
    let mut bail = None;
    // Skip the degenerated cases of an empty range.
    if blockstart < blockmax {
        match process(state, mode, &parity, blockstart, blockmax) {
            Ok(count) => errors += count,
            Err(e) => bail = Some(e),
        }
    }

    for handle in parity.into_iter().flatten() {
        if let Err(e) = handle.close() {
            tracing::error!("DANGER! Unexpected close error in a parity file. {e}");
            errors += 1;
        }
    }

    if let Some(e) = bail {
        return Err(e);
    }
    if errors != 0 {
        println!("{errors} errors");
        return Err(Error::Errors(errors));
    }
    println!("Everything OK");
    Ok(())
}

fn process(
    state: &mut State,
    mode: Mode,
    parity: &[Option<ParityHandle>],
    blockstart: BlockPos,
    blockmax: BlockPos,
) -> Result<u64> {
    let diskmax = state.disks.len();
    let bs = state.block_size;
    let bsz = bs as usize;
    let levels = state.levels();

    let mut handles: Vec<Handle> =
        state.disks.iter().map(|disk| Handle::new(&disk.dir)).collect();

    // Dry reuses one shared buffer for data and parity alike;
    // the computing modes keep the column plus the parity
    // levels plus two reconstruction targets.
    let single = mode == Mode::Dry;
    let mut data_bufs: Vec<AlignedBuf> = if single {
        vec![AlignedBuf::new(bsz)]
    } else {
        (0..diskmax).map(|_| AlignedBuf::new(bsz)).collect()
    };
    let zero_buf = AlignedBuf::new(bsz);
    let mut par_bufs: Vec<AlignedBuf> =
        (0..levels).map(|_| AlignedBuf::new(bsz)).collect();
    let mut spare0 = AlignedBuf::new(bsz);
    let mut spare1 = AlignedBuf::new(bsz);

    let mut usage =
        Usage::new(state.disks.iter().map(|d| d.name.clone()).collect());
    // Drop the setup time.
    usage.waste();

    let positions: Vec<BlockPos> = (blockstart..blockmax)
        .filter(|&p| mode != Mode::Sync || needs_sync(state, p))
        .collect();
    let countmax = positions.len() as u64;
    let mut progress = Progress::begin(blockstart, blockmax, countmax);

    let mut errors: u64 = 0;
    let mut countsize: u64 = 0;
    let mut countpos: u64 = 0;
    let mut danger: Option<BlockPos> = None;

    'outer: for &i in &positions {
        let mut cells: Vec<Cell> = Vec::new();
        let mut col_bad = false;

        // Gather the column, one block per disk.
        for j in 0..diskmax {
            let Some(bref) = state.disks[j].block_get(i) else {
                continue;
            };
            let Some(file) = state.disks[j].file(bref.file) else {
                continue;
            };
            let index = bref.index;
            let block = &file.blocks[index as usize];
            let mut cell = Cell {
                disk: j,
                disk_name: state.disks[j].name.clone(),
                file: bref.file,
                index,
                rsize: file.block_size_at(index, bs) as usize,
                hashed: block.is_hashed(),
                has_parity: block.has_parity(),
                hash: block.hash,
                sub: file.sub.clone(),
                ok: false,
            };
            let fsize = file.size;

            // Until now is CPU.
            usage.cpu();

            let handle = &mut handles[j];
            if handle.file() != Some(bref.file) {
                if let Err(e) = handle.close_if_different(bref.file) {
                    tracing::warn!(
                        "error:{i}:{}:{}: close error. {e}",
                        cell.disk_name,
                        cell.sub
                    );
                    tracing::error!(
                        "DANGER! Unexpected close error in a data disk. Stopping at block {i}"
                    );
                    errors += 1;
                    danger = Some(i);
                    break 'outer;
                }
                let opened = if mode == Mode::Fix {
                    handle.create_rw(bref.file, &cell.sub, fsize)
                } else {
                    handle.open_ro(bref.file, &cell.sub)
                };
                if let Err(e) = opened {
                    tracing::warn!(
                        "error:{i}:{}:{}: open error. {e}",
                        cell.disk_name,
                        cell.sub
                    );
                    tracing::error!(
                        "DANGER! Unexpected open error in a data disk. Stopping at block {i}"
                    );
                    errors += 1;
                    danger = Some(i);
                    break 'outer;
                }
            }

            let buf: &mut [u8] =
                if single { &mut data_bufs[0] } else { &mut data_bufs[j] };
            match handles[j].read(index, bs, &mut buf[..cell.rsize]) {
                Ok(()) => {
                    buf[cell.rsize..].fill(0);
                    countsize += cell.rsize as u64;
                    cell.ok = true;
                }
                Err(e) => {
                    tracing::warn!(
                        "error:{i}:{}:{}: read error at position {index}. {e}",
                        cell.disk_name,
                        cell.sub
                    );
                    // Fix settles the account after recovery.
                    if mode != Mode::Fix {
                        errors += 1;
                    }
                    col_bad = true;
                }
            }

            // Until now is disk.
            usage.disk(j);
            cells.push(cell);
        }

        match mode {
            Mode::Dry => {
                for (l, handle) in parity.iter().enumerate() {
                    if let Some(handle) = handle {
                        usage.cpu();
                        if let Err(e) = handle.read(i, bs, &mut data_bufs[0]) {
                            tracing::warn!(
                                "parity_error:{i}:{}: read error. {e}",
                                lev_name(l)
                            );
                            errors += 1;
                        }
                        usage.parity(l);
                    }
                }
            }
            Mode::Check => {
                for cell in cells.iter().filter(|c| c.ok && c.hashed) {
                    let digest = sha256(&data_bufs[cell.disk][..cell.rsize]);
                    if digest != cell.hash {
                        tracing::warn!(
                            "error:{i}:{}:{}: data mismatch",
                            cell.disk_name,
                            cell.sub
                        );
                        errors += 1;
                    }
                }
                usage.cpu();
                // Parity is comparable only when the whole
                // column was read and claims to be covered.
                let covered = !col_bad
                    && !cells.is_empty()
                    && cells.iter().all(|c| c.has_parity);
                if covered {
                    let col = column(diskmax, &cells, &data_bufs, &zero_buf);
                    for (l, handle) in parity.iter().enumerate() {
                        if let Some(handle) = handle {
                            raid::compute(l, &col, &mut spare0);
                            usage.cpu();
                            match handle.read(i, bs, &mut par_bufs[l]) {
                                Ok(()) => {
                                    if par_bufs[l][..] != spare0[..] {
                                        tracing::warn!(
                                            "parity_error:{i}:{}: data mismatch",
                                            lev_name(l)
                                        );
                                        errors += 1;
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(
                                        "parity_error:{i}:{}: read error. {e}",
                                        lev_name(l)
                                    );
                                    errors += 1;
                                }
                            }
                            usage.parity(l);
                        }
                    }
                }
            }
            Mode::Sync => {
                if !col_bad {
                    usage.cpu();
                    let col = column(diskmax, &cells, &data_bufs, &zero_buf);
                    let mut wrote_all = true;
                    for (l, handle) in parity.iter().enumerate() {
                        let Some(handle) = handle else {
                            wrote_all = false;
                            continue;
                        };
                        raid::compute(l, &col, &mut par_bufs[l]);
                        usage.cpu();
                        if let Err(e) = handle.write(i, bs, &par_bufs[l]) {
                            tracing::warn!(
                                "parity_error:{i}:{}: write error. {e}",
                                lev_name(l)
                            );
                            errors += 1;
                            wrote_all = false;
                        }
                        usage.parity(l);
                    }
                    if wrote_all {
                        // The column is covered now; remember
                        // the content it was computed from.
                        for cell in &cells {
                            let digest =
                                sha256(&data_bufs[cell.disk][..cell.rsize]);
                            if let Some(file) =
                                state.disks[cell.disk].file_mut(cell.file)
                            {
                                let block =
                                    &mut file.blocks[cell.index as usize];
                                block.hash = digest;
                                block.flags |= BlockFlags::HASHED
                                    | BlockFlags::HAS_PARITY;
                            }
                        }
                        state.need_write = true;
                    }
                }
            }
            Mode::Fix => {
                usage.cpu();
                // Bad blocks: unreadable, or readable but not
                // matching their recorded hash.
                let mut bad: Vec<usize> = Vec::new();
                for (ci, cell) in cells.iter().enumerate() {
                    if !cell.ok {
                        bad.push(ci);
                        continue;
                    }
                    if cell.hashed {
                        let digest =
                            sha256(&data_bufs[cell.disk][..cell.rsize]);
                        if digest != cell.hash {
                            tracing::warn!(
                                "error:{i}:{}:{}: data mismatch",
                                cell.disk_name,
                                cell.sub
                            );
                            bad.push(ci);
                        }
                    }
                }
                if !bad.is_empty() {
                    errors += fix_column(
                        i, bs, diskmax, &cells, &bad, parity, &mut handles,
                        &data_bufs, &zero_buf, &mut par_bufs, &mut spare0,
                        &mut spare1, &mut usage,
                    );
                }
            }
        }

        countpos += 1;
        if progress.step(i, countpos, countsize) {
            break;
        }
    }

    if danger.is_none() {
        progress.end(countpos, countsize);
        usage.print(levels);
    }

    // Close every slot left open, even when bailing out.
    for handle in handles.iter_mut() {
        if let Err(e) = handle.close() {
            tracing::error!(
                "DANGER! Unexpected close error in a data disk. {e}"
            );
            errors += 1;
        }
    }

    if let Some(pos) = danger {
        return Err(Error::Danger(pos));
    }
    Ok(errors)
}

/// Attempts to rebuild the bad blocks of one column.  Returns
/// the number of errors to account: one per block that stays
/// broken, plus any write failures.
#[allow(clippy::too_many_arguments)]
fn fix_column(
    i: BlockPos,
    bs: u32,
    diskmax: usize,
    cells: &[Cell],
    bad: &[usize],
    parity: &[Option<ParityHandle>],
    handles: &mut [Handle],
    data_bufs: &[AlignedBuf],
    zero_buf: &AlignedBuf,
    par_bufs: &mut [AlignedBuf],
    spare0: &mut AlignedBuf,
    spare1: &mut AlignedBuf,
    usage: &mut Usage,
) -> u64 {
    let mut errors = 0u64;

    // Which parity levels are actually readable here.
    let mut have = vec![false; parity.len()];
    for (l, handle) in parity.iter().enumerate() {
        if let Some(handle) = handle {
            usage.cpu();
            match handle.read(i, bs, &mut par_bufs[l]) {
                Ok(()) => have[l] = true,
                Err(e) => {
                    tracing::warn!(
                        "parity_error:{i}:{}: read error. {e}",
                        lev_name(l)
                    );
                }
            }
            usage.parity(l);
        }
    }

    let mut bad_disks: Vec<usize> = bad.iter().map(|&ci| cells[ci].disk).collect();
    bad_disks.sort_unstable();

    // Survivors: every other disk, zeros where nothing lives.
    let present: Vec<(usize, &[u8])> = (0..diskmax)
        .filter(|j| !bad_disks.contains(j))
        .map(|j| {
            let has_data = cells.iter().any(|c| c.disk == j && c.ok);
            let buf: &[u8] =
                if has_data { &data_bufs[j][..] } else { &zero_buf[..] };
            (j, buf)
        })
        .collect();

    let recovered = match bad_disks.len() {
        1 if have[0] => {
            raid::recover_one(0, bad_disks[0], &present, &par_bufs[0], spare0);
            true
        }
        1 if have.len() > 1 && have[1] => {
            raid::recover_one(1, bad_disks[0], &present, &par_bufs[1], spare0);
            true
        }
        2 if have.len() > 1 && have[0] && have[1] => {
            raid::recover_two(
                bad_disks[0],
                bad_disks[1],
                &present,
                &par_bufs[0],
                &par_bufs[1],
                spare0,
                spare1,
            );
            true
        }
        _ => false,
    };

    if !recovered {
        for &ci in bad {
            let cell = &cells[ci];
            tracing::warn!(
                "unrecoverable:{i}:{}:{}",
                cell.disk_name,
                cell.sub
            );
            errors += 1;
        }
        return errors;
    }

    for &ci in bad {
        let cell = &cells[ci];
        let slot = bad_disks
            .iter()
            .position(|&j| j == cell.disk)
            .unwrap_or(0);
        let buf: &[u8] = if slot == 0 { &spare0[..] } else { &spare1[..] };

        // Trust the rebuild only if it reproduces the recorded
        // hash; a mismatch means more was wrong than parity can
        // explain.
        if cell.hashed && sha256(&buf[..cell.rsize]) != cell.hash {
            tracing::warn!(
                "unrecoverable:{i}:{}:{}",
                cell.disk_name,
                cell.sub
            );
            errors += 1;
            continue;
        }
        match handles[cell.disk].write(cell.index, bs, &buf[..cell.rsize]) {
            Ok(()) => {
                tracing::info!("fixed:{i}:{}:{}", cell.disk_name, cell.sub);
            }
            Err(e) => {
                tracing::warn!(
                    "error:{i}:{}:{}: write error. {e}",
                    cell.disk_name,
                    cell.sub
                );
                errors += 1;
            }
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::Disk;
    use crate::filter::Filter;
    use crate::scan;
    use crate::state::Options;
    use std::fs;

    fn setup(levels: usize) -> (tempfile::TempDir, State) {
        let root = tempfile::tempdir().unwrap();
        let base = root.path().display().to_string();
        fs::create_dir(format!("{base}/d0")).unwrap();
        fs::create_dir(format!("{base}/d1")).unwrap();
        let mut parity_path = vec![format!("{base}/parity")];
        if levels > 1 {
            parity_path.push(format!("{base}/q-parity"));
        }
        let state = State {
            block_size: 4,
            content: format!("{base}/content"),
            parity_path,
            disks: vec![
                Disk::new("d0", &format!("{base}/d0/")),
                Disk::new("d1", &format!("{base}/d1/")),
            ],
            filter: Filter::default(),
            opts: Options::default(),
            need_write: false,
        };
        (root, state)
    }

    #[test]
    fn sync_writes_xor_parity() {
        let (root, mut state) = setup(1);
        let base = root.path().display().to_string();
        fs::write(format!("{base}/d0/a"), b"ABCDE").unwrap();
        scan::scan(&mut state, false).unwrap();

        run(&mut state, Mode::Sync, 0, 0).unwrap();

        // One data disk against an empty one: parity equals the
        // data, zero padded in the final block.
        let parity = fs::read(format!("{base}/parity")).unwrap();
        assert_eq!(parity, b"ABCDE\0\0\0");

        let (_, file) = state.disks[0].iter_files().next().unwrap();
        assert!(file.blocks.iter().all(|b| b.has_parity() && b.is_hashed()));
        assert_eq!(file.blocks[0].hash, sha256(b"ABCD"));
        assert_eq!(file.blocks[1].hash, sha256(b"E"));
        assert!(state.need_write);
    }

    #[test]
    fn second_sync_has_nothing_to_do() {
        let (root, mut state) = setup(1);
        let base = root.path().display().to_string();
        fs::write(format!("{base}/d0/a"), b"ABCDE").unwrap();
        scan::scan(&mut state, false).unwrap();
        run(&mut state, Mode::Sync, 0, 0).unwrap();

        state.need_write = false;
        run(&mut state, Mode::Sync, 0, 0).unwrap();
        // No column was stale, so nothing was rehashed.
        assert!(!state.need_write);
    }

    #[test]
    fn dry_tolerates_missing_parity() {
        let (root, mut state) = setup(1);
        let base = root.path().display().to_string();
        fs::write(format!("{base}/d0/a"), b"ABCDE").unwrap();
        scan::scan(&mut state, false).unwrap();

        // No parity file exists; the data path alone is enough.
        run(&mut state, Mode::Dry, 0, 0).unwrap();
    }

    #[test]
    fn range_boundaries() {
        let (root, mut state) = setup(1);
        let base = root.path().display().to_string();
        fs::write(format!("{base}/d0/a"), b"ABCDE").unwrap();
        scan::scan(&mut state, false).unwrap();
        assert_eq!(state.parity_allocated_size(), 2);

        // Start equal to the end: a successful no-op.
        run(&mut state, Mode::Dry, 2, 0).unwrap();
        // Start beyond the end: fatal.
        assert!(matches!(
            run(&mut state, Mode::Dry, 3, 0),
            Err(Error::BlockRange(3, 2))
        ));
    }

    #[test]
    fn check_is_clean_after_sync() {
        let (root, mut state) = setup(1);
        let base = root.path().display().to_string();
        fs::write(format!("{base}/d0/a"), b"ABCDE").unwrap();
        fs::write(format!("{base}/d1/b"), b"12345678").unwrap();
        scan::scan(&mut state, false).unwrap();
        run(&mut state, Mode::Sync, 0, 0).unwrap();
        run(&mut state, Mode::Check, 0, 0).unwrap();
    }

    #[test]
    fn check_counts_corruption() {
        let (root, mut state) = setup(1);
        let base = root.path().display().to_string();
        fs::write(format!("{base}/d0/a"), b"ABCDE").unwrap();
        scan::scan(&mut state, false).unwrap();
        run(&mut state, Mode::Sync, 0, 0).unwrap();

        // Flip a byte behind the array's back.
        fs::write(format!("{base}/d0/a"), b"XBCDE").unwrap();
        assert!(matches!(
            run(&mut state, Mode::Check, 0, 0),
            Err(Error::Errors(_))
        ));
    }

    #[test]
    fn fix_restores_single_corruption() {
        let (root, mut state) = setup(1);
        let base = root.path().display().to_string();
        fs::write(format!("{base}/d0/a"), b"ABCDE").unwrap();
        fs::write(format!("{base}/d1/b"), b"WXYZ").unwrap();
        scan::scan(&mut state, false).unwrap();
        run(&mut state, Mode::Sync, 0, 0).unwrap();

        fs::write(format!("{base}/d0/a"), b"QQCDE").unwrap();
        run(&mut state, Mode::Fix, 0, 0).unwrap();
        assert_eq!(fs::read(format!("{base}/d0/a")).unwrap(), b"ABCDE");
        run(&mut state, Mode::Check, 0, 0).unwrap();
    }

    #[test]
    fn fix_restores_double_corruption_with_two_levels() {
        let (root, mut state) = setup(2);
        let base = root.path().display().to_string();
        fs::write(format!("{base}/d0/a"), b"ABCD").unwrap();
        fs::write(format!("{base}/d1/b"), b"WXYZ").unwrap();
        scan::scan(&mut state, false).unwrap();
        run(&mut state, Mode::Sync, 0, 0).unwrap();

        fs::write(format!("{base}/d0/a"), b"QQQQ").unwrap();
        fs::write(format!("{base}/d1/b"), b"RRRR").unwrap();
        run(&mut state, Mode::Fix, 0, 0).unwrap();
        assert_eq!(fs::read(format!("{base}/d0/a")).unwrap(), b"ABCD");
        assert_eq!(fs::read(format!("{base}/d1/b")).unwrap(), b"WXYZ");
        run(&mut state, Mode::Check, 0, 0).unwrap();
    }

    #[test]
    fn fix_without_parity_counts_unrecoverable() {
        let (root, mut state) = setup(1);
        let base = root.path().display().to_string();
        fs::write(format!("{base}/d0/a"), b"ABCDE").unwrap();
        scan::scan(&mut state, false).unwrap();
        run(&mut state, Mode::Sync, 0, 0).unwrap();

        fs::write(format!("{base}/d0/a"), b"XBCDE").unwrap();
        fs::remove_file(format!("{base}/parity")).unwrap();
        assert!(matches!(
            run(&mut state, Mode::Fix, 0, 0),
            Err(Error::Errors(1))
        ));
        // The data was left alone.
        assert_eq!(fs::read(format!("{base}/d0/a")).unwrap(), b"XBCDE");
    }
}
