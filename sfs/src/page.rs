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

//! Byte-range I/O on top of the extent tree: split a `(offset, len)` range
//! into block-sized chunks, allocating on demand when writing, and falling
//! back to a read-modify-write for partial blocks.

use crate::device::BlockDevice;
use crate::error::SfsResult;
use crate::extent;
use crate::layout::{Inode, BLOCK_SIZE};
use crate::volume::Txn;

/// Reads up to `buf.len()` bytes of `inode`'s content starting at `off`.
/// Reads past the end of the file are zero-filled, matching a sparse hole.
/// Returns the number of bytes actually backed by file content (the rest
/// of `buf`, if any, is left untouched by the caller's own size check).
pub fn read_at<D: BlockDevice>(txn: &Txn<D>, inode: &Inode, off: u64, buf: &mut [u8]) -> SfsResult<usize> {
	let size = inode.i_size as u64;
	if off >= size {
		return Ok(0);
	}
	let n = buf.len().min((size - off) as usize);
	let mut done = 0;
	while done < n {
		let abs = off + done as u64;
		let l = abs / BLOCK_SIZE as u64;
		let inner = (abs % BLOCK_SIZE as u64) as usize;
		let chunk = (BLOCK_SIZE - inner).min(n - done);
		match extent::find(txn, inode, l)? {
			Some(p) => {
				let mut blk = [0u8; BLOCK_SIZE];
				txn.read_block(p, &mut blk)?;
				buf[done..done + chunk].copy_from_slice(&blk[inner..inner + chunk]);
			}
			None => {
				buf[done..done + chunk].fill(0);
			}
		}
		done += chunk;
	}
	Ok(n)
}

/// Writes `buf` into `inode`'s content at `off`, extending the extent tree
/// (and `i_size`, left to the caller to persist) as needed. Only
/// sequential extension (writing up to and past the current end of file)
/// is supported, matching the append-oriented allocation model described
/// by the extent tree's design.
pub fn write_at<D: BlockDevice>(txn: &mut Txn<D>, inode: &mut Inode, off: u64, buf: &[u8]) -> SfsResult<usize> {
	let mut done = 0;
	while done < buf.len() {
		let abs = off + done as u64;
		let l = abs / BLOCK_SIZE as u64;
		let inner = (abs % BLOCK_SIZE as u64) as usize;
		let chunk = (BLOCK_SIZE - inner).min(buf.len() - done);

		let p = match extent::find(txn, inode, l)? {
			Some(p) => p,
			None => {
				let populated = extent::extend(txn, inode)?;
				debug_assert_eq!(populated as u64, l);
				extent::find(txn, inode, l)?.expect("just-extended block must resolve")
			}
		};

		if chunk == BLOCK_SIZE {
			txn.write_block(p, &buf[done..done + chunk])?;
		} else {
			let mut blk = [0u8; BLOCK_SIZE];
			txn.read_block(p, &mut blk)?;
			blk[inner..inner + chunk].copy_from_slice(&buf[done..done + chunk]);
			txn.write_block(p, &blk)?;
		}
		done += chunk;
	}
	let new_end = off + buf.len() as u64;
	if new_end > inode.i_size as u64 {
		inode.i_size = new_end as u32;
	}
	Ok(buf.len())
}
