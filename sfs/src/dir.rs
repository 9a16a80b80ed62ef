/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! The directory store: a directory is a file whose content is a sequence
//! of pages packed with [`crate::dirent`] entries.
//!
//! Grounded in `original_source/dir.c`'s entry semantics, and in
//! `kernel/src/file/fs/ext2/inode.rs`'s `get_dirent`/`find_suitable_slot`/
//! `add_dirent`/`set_dirent_inode` shape, adapted to SFS's page-terminator
//! format rather than ext2's `rec_len` free-space tracking.

use crate::device::BlockDevice;
use crate::dirent::{self, entry_len, TERMINATOR_SIZE};
use crate::error::{invalid, SfsError, SfsResult};
use crate::extent;
use crate::layout::{now, Inode, BLOCK_SIZE};
use crate::volume::Txn;

fn read_page<D: BlockDevice>(txn: &Txn<D>, dir: &Inode, page: u32) -> SfsResult<[u8; BLOCK_SIZE]> {
	let phys = extent::find(txn, dir, page as u64)?.ok_or(SfsError::NotFound)?;
	let mut buf = [0u8; BLOCK_SIZE];
	txn.read_block(phys, &mut buf)?;
	Ok(buf)
}

fn write_page<D: BlockDevice>(txn: &mut Txn<D>, dir: &Inode, page: u32, buf: &[u8; BLOCK_SIZE]) -> SfsResult<()> {
	let phys = extent::find(txn, dir, page as u64)?.ok_or(SfsError::NotFound)?;
	txn.write_block(phys, buf)
}

/// The location of a found entry: which page, and its byte offset within
/// that page.
#[derive(Debug, Clone, Copy)]
pub struct EntryLoc {
	pub page: u32,
	pub offset: usize,
	pub ino: u32,
}

/// Scans `dir`'s pages for `name`. Page boundaries terminate a scan; no
/// entry straddles pages.
pub fn find_entry<D: BlockDevice>(txn: &Txn<D>, dir: &Inode, name: &[u8]) -> SfsResult<Option<EntryLoc>> {
	for page in 0..dir.block_count() {
		let buf = read_page(txn, dir, page)?;
		for e in dirent::PageIter::new(&buf) {
			if e.name == name {
				return Ok(Some(EntryLoc {
					page,
					offset: e.offset,
					ino: e.ino,
				}));
			}
		}
	}
	Ok(None)
}

/// Inserts `(name, ino)` into `dir`, reusing the first page with room or
/// appending a new page. Does not touch the target inode's `nlink` —
/// callers (namespace operations) own that bookkeeping, the same way
/// `create`/`link` do around `add_dirent`.
pub fn add_entry<D: BlockDevice>(
	txn: &mut Txn<D>,
	dir: &mut Inode,
	name: &[u8],
	ino: u32,
	namelen_limit: u16,
) -> SfsResult<()> {
	if namelen_limit > 0 && name.len() >= namelen_limit as usize {
		return Err(invalid!("name too long"));
	}
	let needed = entry_len(name.len()) + TERMINATOR_SIZE;
	if needed > BLOCK_SIZE {
		return Err(invalid!("entry too large for one page"));
	}

	for page in 0..dir.block_count() {
		let mut buf = read_page(txn, dir, page)?;
		let term = dirent::terminator_offset(&buf);
		if BLOCK_SIZE - term >= needed {
			dirent::write_entry(&mut buf, term, ino, name);
			dirent::write_terminator(&mut buf, term + entry_len(name.len()));
			write_page(txn, dir, page, &buf)?;
			return Ok(());
		}
	}

	// No existing page has room: grow the directory by one page.
	let new_page = extent::extend(txn, dir)?;
	dir.i_size = (new_page as u64 + 1).saturating_mul(BLOCK_SIZE as u64) as u32;
	let mut buf = [0u8; BLOCK_SIZE];
	dirent::write_entry(&mut buf, 0, ino, name);
	dirent::write_terminator(&mut buf, entry_len(name.len()));
	write_page(txn, dir, new_page, &buf)?;
	Ok(())
}

/// Retargets the entry at `(page, offset)` to `ino`, leaving its name and
/// position untouched. Used by `rename` to redirect an existing destination
/// entry in place, matching `set_dirent_inode`'s role in ext2's `link`/
/// `rename` path: the slot already has room for its own name, so this
/// cannot fail the way a delete-then-add sequence could.
pub fn set_entry_ino<D: BlockDevice>(txn: &mut Txn<D>, dir: &Inode, page: u32, offset: usize, ino: u32) -> SfsResult<()> {
	let mut buf = read_page(txn, dir, page)?;
	dirent::read_entry(&buf, offset).ok_or_else(|| invalid!("no entry at that offset"))?;
	buf[offset..offset + 4].copy_from_slice(&ino.to_le_bytes());
	write_page(txn, dir, page, &buf)
}

/// Removes the entry at `(page, offset)`, compacting the remainder of the
/// page leftward and re-establishing the terminator.
pub fn delete_entry<D: BlockDevice>(txn: &mut Txn<D>, dir: &mut Inode, page: u32, offset: usize) -> SfsResult<()> {
	let mut buf = read_page(txn, dir, page)?;
	let e = dirent::read_entry(&buf, offset).ok_or_else(|| invalid!("no entry at that offset"))?;
	let entry_size = e.len;
	buf.copy_within((offset + entry_size)..BLOCK_SIZE, offset);
	buf[(BLOCK_SIZE - entry_size)..BLOCK_SIZE].fill(0);
	write_page(txn, dir, page, &buf)?;
	let t = now();
	dir.i_mtime = t;
	dir.i_ctime = t;
	Ok(())
}

/// Reserved cookie values for the synthesized `.`/`..` entries; real
/// entries are encoded starting at [`FIRST_REAL_COOKIE`] as
/// `FIRST_REAL_COOKIE + (page << 12 | offset)`.
const DOT_COOKIE: u64 = 0;
const DOTDOT_COOKIE: u64 = 1;
const FIRST_REAL_COOKIE: u64 = 2;

/// One entry yielded by [`readdir`].
pub struct ReadDirEntry {
	pub name: Vec<u8>,
	pub ino: u32,
	pub next_cookie: u64,
}

/// Iterates `dir`'s entries starting from `cookie` (0 to begin). Synthesizes
/// `.` and `..` before any stored entry.
pub fn readdir<D: BlockDevice>(
	txn: &Txn<D>,
	dir: &Inode,
	dir_ino: u32,
	parent_ino: u32,
	cookie: u64,
) -> SfsResult<Option<ReadDirEntry>> {
	if cookie == DOT_COOKIE {
		return Ok(Some(ReadDirEntry {
			name: b".".to_vec(),
			ino: dir_ino,
			next_cookie: DOTDOT_COOKIE,
		}));
	}
	if cookie == DOTDOT_COOKIE {
		return Ok(Some(ReadDirEntry {
			name: b"..".to_vec(),
			ino: parent_ino,
			next_cookie: FIRST_REAL_COOKIE,
		}));
	}

	let raw = cookie - FIRST_REAL_COOKIE;
	let mut page = (raw >> 12) as u32;
	let mut offset = (raw & 0xFFF) as usize;

	loop {
		if page >= dir.block_count() {
			return Ok(None);
		}
		let buf = read_page(txn, dir, page)?;
		match dirent::read_entry(&buf, offset) {
			Some(e) => {
				let next_raw = (page as u64) << 12 | (e.offset + e.len) as u64;
				return Ok(Some(ReadDirEntry {
					name: e.name.to_vec(),
					ino: e.ino,
					next_cookie: FIRST_REAL_COOKIE + next_raw,
				}));
			}
			None => {
				// terminator on this page: advance to the next page, if any
				page += 1;
				offset = 0;
			}
		}
	}
}

/// True iff the first entry of page 0 is the terminator — matching
/// `sfs_empty_dir`'s page-0-only check (Open Question 4), not a full scan.
pub fn is_empty<D: BlockDevice>(txn: &Txn<D>, dir: &Inode) -> SfsResult<bool> {
	if dir.block_count() == 0 {
		return Ok(true);
	}
	let buf = read_page(txn, dir, 0)?;
	Ok(dirent::read_entry(&buf, 0).is_none())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::device::MemDevice;
	use crate::layout::{Superblock, SFS_MAGIC, SFS_VALID_FS};
	use crate::volume::Volume;
	use bytemuck::Zeroable;

	fn fresh_volume(nblocks: u32) -> Volume<MemDevice> {
		let dev = MemDevice::new(nblocks as u64);
		let sb = Superblock {
			s_nblocks: nblocks,
			s_ninodes: 64,
			s_inode_blocks: 1,
			s_imap_blocks: 1,
			s_bmap_blocks: 1,
			s_firstdatablock: 4,
			s_state: SFS_VALID_FS,
			s_namelen: 0,
			s_magic: SFS_MAGIC,
			s_unused: 0,
		};
		let mut sb_block = [0u8; BLOCK_SIZE];
		sb_block[..std::mem::size_of::<Superblock>()].copy_from_slice(bytemuck::bytes_of(&sb));
		dev.write_block(0, &sb_block).unwrap();
		let mut bmap = [0u8; BLOCK_SIZE];
		for b in 0..sb.s_firstdatablock {
			bmap[(b / 8) as usize] |= 1 << (b % 8);
		}
		dev.write_block(sb.bmap_start() as u64, &bmap).unwrap();
		Volume::load(dev, false).unwrap()
	}

	#[test]
	fn add_find_delete_round_trip() {
		let vol = fresh_volume(64);
		let mut txn = vol.begin();
		let mut dir = Inode::zeroed();
		add_entry(&mut txn, &mut dir, b"a", 10, 0).unwrap();
		add_entry(&mut txn, &mut dir, b"b", 11, 0).unwrap();
		add_entry(&mut txn, &mut dir, b"c", 12, 0).unwrap();

		let loc_b = find_entry(&txn, &dir, b"b").unwrap().unwrap();
		assert_eq!(loc_b.ino, 11);
		delete_entry(&mut txn, &mut dir, loc_b.page, loc_b.offset).unwrap();
		assert!(find_entry(&txn, &dir, b"b").unwrap().is_none());
		assert_eq!(find_entry(&txn, &dir, b"a").unwrap().unwrap().ino, 10);
		assert_eq!(find_entry(&txn, &dir, b"c").unwrap().unwrap().ino, 12);
	}

	#[test]
	fn readdir_yields_dot_dotdot_then_entries() {
		let vol = fresh_volume(64);
		let mut txn = vol.begin();
		let mut dir = Inode::zeroed();
		add_entry(&mut txn, &mut dir, b"x", 20, 0).unwrap();
		add_entry(&mut txn, &mut dir, b"y", 21, 0).unwrap();

		let mut names = Vec::new();
		let mut cookie = 0u64;
		loop {
			match readdir(&txn, &dir, 5, 2, cookie).unwrap() {
				Some(e) => {
					names.push(e.name);
					cookie = e.next_cookie;
				}
				None => break,
			}
		}
		assert_eq!(names, vec![b".".to_vec(), b"..".to_vec(), b"x".to_vec(), b"y".to_vec()]);
	}

	#[test]
	fn is_empty_true_for_fresh_dir() {
		let vol = fresh_volume(64);
		let txn = vol.begin();
		let dir = Inode::zeroed();
		assert!(is_empty(&txn, &dir).unwrap());
	}

	#[test]
	fn is_empty_false_after_insert() {
		let vol = fresh_volume(64);
		let mut txn = vol.begin();
		let mut dir = Inode::zeroed();
		add_entry(&mut txn, &mut dir, b"a", 10, 0).unwrap();
		assert!(!is_empty(&txn, &dir).unwrap());
	}

	#[test]
	fn rejects_name_past_namelen_limit() {
		let vol = fresh_volume(64);
		let mut txn = vol.begin();
		let mut dir = Inode::zeroed();
		let err = add_entry(&mut txn, &mut dir, b"toolong", 10, 4).unwrap_err();
		assert!(matches!(err, SfsError::Invalid { .. }));
	}
}
