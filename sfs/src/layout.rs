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

//! On-disk layout: struct definitions and constants, byte-exact with the
//! original format described in `sfs_fs.h`.
//!
//! Every struct here is little-endian, packed, and derives [`bytemuck::Pod`]
//! so it can be reinterpreted in place from a block buffer without relying
//! on host struct layout.

use bytemuck::{Pod, Zeroable};

/// Block size in bytes.
pub const BLOCK_SIZE: usize = 4096;
/// log2 of [`BLOCK_SIZE`].
pub const BLOCK_LOG_SIZE: u32 = 12;
/// Number of bits in one block, i.e. how many objects one bitmap block covers.
pub const BIT_PER_BLOCK: usize = BLOCK_SIZE * 8;
/// Number of extent pairs that fit in one indirect block.
pub const INDIRECT_BY_BLOCK: usize = BLOCK_SIZE / std::mem::size_of::<ExtentPair>();
/// Number of indirect-block pointers that fit in one doubly-indirect block.
pub const DBINDIRECT_BY_BLOCK: usize = BLOCK_SIZE / std::mem::size_of::<u32>();
/// Maximum value of `i_nlink`.
pub const SFS_MAX_LINK: u16 = 65530;
/// Size in bytes of one on-disk inode.
pub const INODE_SIZE: usize = std::mem::size_of::<Inode>();
/// Number of inodes that fit in one block.
pub const INODE_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
/// The root directory's inode number.
pub const ROOT_INO: u32 = 2;
/// Number of `u32` words in [`Inode::i_data`].
pub const INO_DATA_COUNT: usize = 10;
/// Number of direct extent pairs ([`Inode::i_data`] words `0..=7`).
pub const DIRECT_EXTENTS: usize = 4;
/// Index of the indirect block pointer in [`Inode::i_data`].
pub const INDIRECT_IDX: usize = 8;
/// Index of the doubly-indirect block pointer in [`Inode::i_data`].
pub const DBINDIRECT_IDX: usize = 9;

/// Magic number identifying an SFS volume.
pub const SFS_MAGIC: u16 = 0x3234;

/// `s_state`: the volume was cleanly unmounted and its metadata is consistent.
pub const SFS_VALID_FS: u16 = 1;
/// `s_state`: the volume was detected as corrupted.
pub const SFS_ERROR_FS: u16 = 2;
/// `s_state`: the volume is currently mounted.
pub const SFS_MOUNTED: u16 = 4;

/// `i_mode`: bitmask selecting the file type.
pub const S_IFMT: u16 = 0o170000;
/// `i_mode`: regular file.
pub const S_IFREG: u16 = 0o100000;
/// `i_mode`: directory.
pub const S_IFDIR: u16 = 0o040000;
/// `i_mode`: symbolic link.
pub const S_IFLNK: u16 = 0o120000;
/// `i_mode`: character device.
pub const S_IFCHR: u16 = 0o020000;
/// `i_mode`: block device.
pub const S_IFBLK: u16 = 0o060000;

/// Default permissions used for a freshly-formatted root directory:
/// `rwxr-xr-x`.
pub const IROOT_DEF_MODE: u16 = S_IFDIR | 0o755;

/// The on-disk superblock, occupying block 0. The rest of the block is
/// padding.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Superblock {
	pub s_nblocks: u32,
	pub s_ninodes: u32,
	pub s_inode_blocks: u32,
	pub s_imap_blocks: u32,
	pub s_bmap_blocks: u32,
	pub s_firstdatablock: u32,
	pub s_state: u16,
	pub s_namelen: u16,
	pub s_magic: u16,
	pub s_unused: u16,
}

impl Superblock {
	/// Returns whether the magic number and basic geometry are sane.
	pub fn is_valid(&self) -> bool {
		self.s_magic == SFS_MAGIC && self.s_firstdatablock < self.s_nblocks
	}

	/// Number of blocks occupied by the inode table.
	pub fn inode_table_blocks(&self) -> u32 {
		self.s_inode_blocks
	}

	/// Block at which the inode bitmap begins (block 1).
	pub fn imap_start(&self) -> u32 {
		1
	}

	/// Block at which the data bitmap begins.
	pub fn bmap_start(&self) -> u32 {
		self.imap_start() + self.s_imap_blocks
	}

	/// Block at which the inode table begins.
	pub fn inode_table_start(&self) -> u32 {
		self.bmap_start() + self.s_bmap_blocks
	}
}

/// A contiguous run of physical blocks: `(start, count)`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ExtentPair {
	pub b_start: u32,
	pub b_count: u32,
}

impl ExtentPair {
	pub const ZERO: Self = Self {
		b_start: 0,
		b_count: 0,
	};

	pub fn is_empty(&self) -> bool {
		self.b_start == 0
	}
}

/// The on-disk inode: 64 bytes, including the extent tree root.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Inode {
	pub i_mode: u16,
	pub i_nlink: u16,
	pub i_uid: u16,
	pub i_gid: u16,
	pub i_size: u32,
	pub i_atime: u32,
	pub i_mtime: u32,
	pub i_ctime: u32,
	/// 4 direct extent pairs (words 0..=7), indirect pointer (word 8),
	/// doubly-indirect pointer (word 9).
	pub i_data: [u32; INO_DATA_COUNT],
}

const _: () = assert!(std::mem::size_of::<Inode>() == 64);
const _: () = assert!(std::mem::size_of::<Superblock>() == 32);
const _: () = assert!(std::mem::size_of::<ExtentPair>() == 8);

impl Inode {
	pub fn file_type(&self) -> u16 {
		self.i_mode & S_IFMT
	}

	pub fn is_dir(&self) -> bool {
		self.file_type() == S_IFDIR
	}

	pub fn is_symlink(&self) -> bool {
		self.file_type() == S_IFLNK
	}

	/// Reads the `n`th direct extent pair (`n < DIRECT_EXTENTS`).
	pub fn direct(&self, n: usize) -> ExtentPair {
		ExtentPair {
			b_start: self.i_data[n * 2],
			b_count: self.i_data[n * 2 + 1],
		}
	}

	/// Writes the `n`th direct extent pair (`n < DIRECT_EXTENTS`).
	pub fn set_direct(&mut self, n: usize, e: ExtentPair) {
		self.i_data[n * 2] = e.b_start;
		self.i_data[n * 2 + 1] = e.b_count;
	}

	pub fn indirect_block(&self) -> u32 {
		self.i_data[INDIRECT_IDX]
	}

	pub fn set_indirect_block(&mut self, b: u32) {
		self.i_data[INDIRECT_IDX] = b;
	}

	pub fn dbindirect_block(&self) -> u32 {
		self.i_data[DBINDIRECT_IDX]
	}

	pub fn set_dbindirect_block(&mut self, b: u32) {
		self.i_data[DBINDIRECT_IDX] = b;
	}

	/// Number of 4096-byte pages occupied by the file's content.
	pub fn block_count(&self) -> u32 {
		ceil_div(self.i_size as u64, BLOCK_SIZE as u64) as u32
	}
}

/// `ceil(a / b)` for unsigned integers.
pub fn ceil_div(a: u64, b: u64) -> u64 {
	(a + b - 1) / b
}

/// `log2` of a power of two; panics on non-powers-of-two (used only on
/// values checked ahead of time, such as the block size).
pub fn log2(mut n: u32) -> u32 {
	debug_assert!(n.is_power_of_two());
	let mut r = 0;
	while n > 1 {
		n >>= 1;
		r += 1;
	}
	r
}

/// Current time as a 32-bit Unix timestamp, the resolution `i_atime`/
/// `i_mtime`/`i_ctime` use on disk.
pub fn now() -> u32 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_secs() as u32)
		.unwrap_or(0)
}
