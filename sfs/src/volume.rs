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

//! The mounted volume: superblock, bitmaps, and the device, all behind the
//! single coarse mutex `spec.md` §5 requires. This is the "no process-wide
//! singletons, a per-mount `Volume` value" re-architecture the original
//! module-global state called for.

use crate::bitmap::{Bitmap, BitmapKind};
use crate::device::BlockDevice;
use crate::error::{invalid, SfsError, SfsResult};
use crate::layout::{Inode, Superblock, BLOCK_SIZE, INODE_PER_BLOCK, INODE_SIZE, SFS_MAGIC, SFS_MOUNTED, SFS_VALID_FS};
use bytemuck::{bytes_of, bytes_of_mut, Zeroable};
use std::sync::Mutex;

/// In-memory state protected by the volume's coarse lock: the superblock
/// and both bitmaps, resident for the lifetime of the mount.
struct VolumeState {
	sb: Superblock,
	sb_dirty: bool,
	imap: Vec<u8>,
	bmap: Vec<u8>,
}

/// A mounted SFS volume.
pub struct Volume<D: BlockDevice> {
	dev: D,
	read_only: bool,
	state: Mutex<VolumeState>,
}

/// A held transaction: the volume's lock plus device access, passed down
/// into the extent tree, directory store and namespace operations so a
/// whole logical operation runs under one lock acquisition.
pub struct Txn<'a, D: BlockDevice> {
	dev: &'a D,
	read_only: bool,
	state: std::sync::MutexGuard<'a, VolumeState>,
}

impl<D: BlockDevice> Volume<D> {
	/// Loads and mounts a volume from `dev`. Validates the magic number and
	/// basic geometry, reads in both bitmaps, and marks the volume mounted.
	pub fn load(dev: D, read_only: bool) -> SfsResult<Self> {
		let mut sb_block = [0u8; BLOCK_SIZE];
		dev.read_block(0, &mut sb_block)?;
		let mut sb = Superblock::zeroed();
		bytes_of_mut(&mut sb).copy_from_slice(&sb_block[..std::mem::size_of::<Superblock>()]);

		if sb.s_magic != SFS_MAGIC {
			return Err(invalid!("bad magic number"));
		}
		if !sb.is_valid() {
			return Err(invalid!("bad geometry: s_firstdatablock >= s_nblocks"));
		}

		if sb.s_state & SFS_MOUNTED != 0 {
			log::warn!("sfs: volume was not cleanly unmounted, clearing VALID flag");
			if !read_only {
				sb.s_state &= !SFS_VALID_FS;
			}
		} else if sb.s_state & SFS_VALID_FS == 0 {
			log::warn!("sfs: mounting a volume whose VALID flag is already clear");
		}

		let imap = read_bitmap_region(&dev, sb.imap_start(), sb.s_imap_blocks)?;
		let bmap = read_bitmap_region(&dev, sb.bmap_start(), sb.s_bmap_blocks)?;

		let mut sb_dirty = false;
		if !read_only {
			sb.s_state |= SFS_MOUNTED;
			sb_dirty = true;
			log::debug!("sfs: mounted volume ({} blocks, {} inodes)", sb.s_nblocks, sb.s_ninodes);
		}

		let volume = Self {
			dev,
			read_only,
			state: Mutex::new(VolumeState {
				sb,
				sb_dirty,
				imap,
				bmap,
			}),
		};
		if sb_dirty {
			volume.persist()?;
		}
		Ok(volume)
	}

	/// Writes back any dirty superblock/bitmap state without clearing the
	/// mounted flag.
	pub fn persist(&self) -> SfsResult<()> {
		let mut state = self.state.lock().unwrap();
		write_bitmap_region(&self.dev, state.sb.imap_start(), &state.imap)?;
		write_bitmap_region(&self.dev, state.sb.bmap_start(), &state.bmap)?;
		write_superblock(&self.dev, &state.sb)?;
		state.sb_dirty = false;
		self.dev.flush()
	}

	/// Clears the mounted flag, sets VALID, and flushes. Call this exactly
	/// once, on clean unmount.
	pub fn shutdown(&self) -> SfsResult<()> {
		if self.read_only {
			return self.dev.flush();
		}
		{
			let mut state = self.state.lock().unwrap();
			state.sb.s_state &= !SFS_MOUNTED;
			state.sb.s_state |= SFS_VALID_FS;
			state.sb_dirty = true;
		}
		self.persist()
	}

	/// Acquires the coarse lock for one logical operation.
	pub fn begin(&self) -> Txn<'_, D> {
		Txn {
			dev: &self.dev,
			read_only: self.read_only,
			state: self.state.lock().unwrap(),
		}
	}

	pub fn block_size(&self) -> usize {
		BLOCK_SIZE
	}

	pub fn namelen_limit(&self) -> u16 {
		self.state.lock().unwrap().sb.s_namelen
	}

	pub fn root_first_data_block(&self) -> u32 {
		self.state.lock().unwrap().sb.s_firstdatablock
	}
}

fn read_bitmap_region<D: BlockDevice>(dev: &D, start: u32, nblocks: u32) -> SfsResult<Vec<u8>> {
	let mut buf = vec![0u8; nblocks as usize * BLOCK_SIZE];
	for i in 0..nblocks {
		dev.read_block((start + i) as u64, &mut buf[(i as usize * BLOCK_SIZE)..((i as usize + 1) * BLOCK_SIZE)])?;
	}
	Ok(buf)
}

fn write_bitmap_region<D: BlockDevice>(dev: &D, start: u32, bytes: &[u8]) -> SfsResult<()> {
	let nblocks = bytes.len() / BLOCK_SIZE;
	for i in 0..nblocks {
		dev.write_block((start + i as u32) as u64, &bytes[(i * BLOCK_SIZE)..((i + 1) * BLOCK_SIZE)])?;
	}
	Ok(())
}

fn write_superblock<D: BlockDevice>(dev: &D, sb: &Superblock) -> SfsResult<()> {
	let mut block = [0u8; BLOCK_SIZE];
	block[..std::mem::size_of::<Superblock>()].copy_from_slice(bytes_of(sb));
	dev.write_block(0, &block)
}

impl<'a, D: BlockDevice> Txn<'a, D> {
	fn check_writable(&self) -> SfsResult<()> {
		if self.read_only {
			return Err(SfsError::ReadOnly);
		}
		Ok(())
	}

	pub fn nblocks(&self) -> u32 {
		self.state.sb.s_nblocks
	}

	pub fn ninodes(&self) -> u32 {
		self.state.sb.s_ninodes
	}

	pub fn namelen_limit(&self) -> u16 {
		self.state.sb.s_namelen
	}

	pub fn first_data_block(&self) -> u32 {
		self.state.sb.s_firstdatablock
	}

	pub fn read_block(&self, n: u32, buf: &mut [u8]) -> SfsResult<()> {
		self.dev.read_block(n as u64, buf)
	}

	pub fn write_block(&self, n: u32, buf: &[u8]) -> SfsResult<()> {
		self.check_writable()?;
		self.dev.write_block(n as u64, buf)
	}

	pub fn zero_block(&self, n: u32) -> SfsResult<()> {
		self.write_block(n, &[0u8; BLOCK_SIZE])
	}

	/// Allocates a block id, preferring the physical successor of `hint`
	/// when given (the extent tree's run-merging fast path).
	pub fn alloc_block(&mut self, hint: Option<u32>) -> SfsResult<u32> {
		self.check_writable()?;
		let limit = self.state.sb.s_nblocks;
		let mut bm = Bitmap::new(&mut self.state.bmap, limit);
		let id = match hint {
			Some(h) => bm.acquire_after(h)?,
			None => bm.acquire()?,
		};
		Ok(id)
	}

	pub fn free_block(&mut self, id: u32) -> SfsResult<()> {
		self.check_writable()?;
		let limit = self.state.sb.s_nblocks;
		let mut bm = Bitmap::new(&mut self.state.bmap, limit);
		bm.release(id)
	}

	pub fn alloc_inode(&mut self) -> SfsResult<u32> {
		self.check_writable()?;
		let limit = self.state.sb.s_ninodes;
		let mut bm = Bitmap::new(&mut self.state.imap, limit);
		bm.acquire()
	}

	pub fn free_inode(&mut self, id: u32) -> SfsResult<()> {
		self.check_writable()?;
		let limit = self.state.sb.s_ninodes;
		let mut bm = Bitmap::new(&mut self.state.imap, limit);
		bm.release(id)
	}

	/// Reads the raw inode for `id`.
	pub fn read_inode(&self, id: u32) -> SfsResult<Inode> {
		let (block, slot) = self.inode_slot(id);
		let mut buf = [0u8; BLOCK_SIZE];
		self.dev.read_block(block as u64, &mut buf)?;
		let mut ino = Inode::zeroed();
		let off = slot * INODE_SIZE;
		bytes_of_mut(&mut ino).copy_from_slice(&buf[off..off + INODE_SIZE]);
		Ok(ino)
	}

	/// Writes `inode` back to its on-disk slot.
	pub fn write_inode(&mut self, id: u32, inode: &Inode) -> SfsResult<()> {
		self.check_writable()?;
		let (block, slot) = self.inode_slot(id);
		let mut buf = [0u8; BLOCK_SIZE];
		self.dev.read_block(block as u64, &mut buf)?;
		let off = slot * INODE_SIZE;
		buf[off..off + INODE_SIZE].copy_from_slice(bytes_of(inode));
		self.dev.write_block(block as u64, &buf)
	}

	fn inode_slot(&self, id: u32) -> (u32, usize) {
		let table_start = self.state.sb.inode_table_start();
		let idx = id as usize;
		(table_start + (idx / INODE_PER_BLOCK) as u32, idx % INODE_PER_BLOCK)
	}

	/// Number of free data blocks, for `df`-style reporting and tests.
	pub fn free_blocks(&mut self) -> u32 {
		self.bitmap(BitmapKind::Block).free_count()
	}

	pub fn bitmap(&mut self, kind: BitmapKind) -> Bitmap<'_> {
		match kind {
			BitmapKind::Inode => {
				let limit = self.state.sb.s_ninodes;
				Bitmap::new(&mut self.state.imap, limit)
			}
			BitmapKind::Block => {
				let limit = self.state.sb.s_nblocks;
				Bitmap::new(&mut self.state.bmap, limit)
			}
		}
	}
}
