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

//! Symlink targets, stored as ordinary file content (always inline, within
//! the first block, since one block comfortably exceeds the one-block
//! target limit this spec imposes).
//!
//! Grounded in `original_source/symlink.c` and in the inline-target half of
//! `kernel/src/file/fs/ext2/inode.rs`'s `LinkOps::readlink`/`symlink`
//! handling (ext2 additionally supports storing long targets out of line;
//! SFS does not, since targets longer than one block are rejected).

use crate::device::BlockDevice;
use crate::error::{invalid, SfsResult};
use crate::layout::{Inode, BLOCK_SIZE};
use crate::page;
use crate::volume::Txn;

/// Largest target length accepted, leaving room for the trailing NUL
/// within one block.
pub const MAX_TARGET_LEN: usize = BLOCK_SIZE - 1;

/// Writes `target` as `inode`'s symlink content (NUL-terminated on disk,
/// `i_size` set to `target.len()` without the NUL).
pub fn write_target<D: BlockDevice>(txn: &mut Txn<D>, inode: &mut Inode, target: &[u8]) -> SfsResult<()> {
	if target.len() + 1 > MAX_TARGET_LEN {
		return Err(invalid!("symlink target longer than one block"));
	}
	let mut buf = Vec::with_capacity(target.len() + 1);
	buf.extend_from_slice(target);
	buf.push(0);
	page::write_at(txn, inode, 0, &buf)?;
	inode.i_size = target.len() as u32;
	Ok(())
}

/// Reads back the symlink target written by [`write_target`].
pub fn read_target<D: BlockDevice>(txn: &Txn<D>, inode: &Inode) -> SfsResult<Vec<u8>> {
	let len = inode.i_size as usize;
	let mut buf = vec![0u8; len];
	page::read_at(txn, inode, 0, &mut buf)?;
	Ok(buf)
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
	fn round_trip() {
		let vol = fresh_volume(64);
		let mut txn = vol.begin();
		let mut inode = Inode::zeroed();
		write_target(&mut txn, &mut inode, b"/etc/passwd").unwrap();
		assert_eq!(inode.i_size, 11);
		assert_eq!(read_target(&txn, &inode).unwrap(), b"/etc/passwd");
	}

	#[test]
	fn rejects_target_over_one_block() {
		let vol = fresh_volume(64);
		let mut txn = vol.begin();
		let mut inode = Inode::zeroed();
		let too_long = vec![b'a'; BLOCK_SIZE];
		assert!(write_target(&mut txn, &mut inode, &too_long).is_err());
	}
}
