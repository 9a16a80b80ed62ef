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

//! The block device interface consumed by the engine, and two concrete
//! implementations: a real file/block-device backend and an in-memory one
//! used by tests.

use crate::error::SfsResult;
use crate::layout::BLOCK_SIZE;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

/// Block I/O interface. A block is [`BLOCK_SIZE`] bytes; offsets passed to
/// [`BlockDevice::read`]/[`BlockDevice::write`] are in blocks, not bytes.
pub trait BlockDevice {
	/// Total number of blocks on the device.
	fn block_count(&self) -> u64;

	/// Reads one block into `buf`, which must be exactly [`BLOCK_SIZE`] bytes.
	fn read_block(&self, n: u64, buf: &mut [u8]) -> SfsResult<()>;

	/// Writes one block from `buf`, which must be exactly [`BLOCK_SIZE`]
	/// bytes.
	fn write_block(&self, n: u64, buf: &[u8]) -> SfsResult<()>;

	/// Flushes any buffering below this interface to stable storage.
	fn flush(&self) -> SfsResult<()>;
}

/// A [`BlockDevice`] backed by a real file or block special device.
pub struct FileDevice {
	file: Mutex<File>,
	block_count: u64,
}

impl FileDevice {
	/// Wraps an already-open file. `block_count` is the number of
	/// [`BLOCK_SIZE`]-byte blocks the caller intends to address.
	pub fn new(file: File, block_count: u64) -> Self {
		Self {
			file: Mutex::new(file),
			block_count,
		}
	}
}

impl BlockDevice for FileDevice {
	fn block_count(&self) -> u64 {
		self.block_count
	}

	fn read_block(&self, n: u64, buf: &mut [u8]) -> SfsResult<()> {
		debug_assert_eq!(buf.len(), BLOCK_SIZE);
		let mut file = self.file.lock().unwrap();
		file.seek(SeekFrom::Start(n * BLOCK_SIZE as u64))?;
		file.read_exact(buf)?;
		Ok(())
	}

	fn write_block(&self, n: u64, buf: &[u8]) -> SfsResult<()> {
		debug_assert_eq!(buf.len(), BLOCK_SIZE);
		let mut file = self.file.lock().unwrap();
		file.seek(SeekFrom::Start(n * BLOCK_SIZE as u64))?;
		file.write_all(buf)?;
		Ok(())
	}

	fn flush(&self) -> SfsResult<()> {
		self.file.lock().unwrap().flush()?;
		Ok(())
	}
}

/// An in-memory [`BlockDevice`], used by unit and integration tests in place
/// of a real disk.
pub struct MemDevice {
	blocks: Mutex<Vec<u8>>,
	block_count: u64,
}

impl MemDevice {
	/// Creates a zeroed device of `block_count` blocks.
	pub fn new(block_count: u64) -> Self {
		Self {
			blocks: Mutex::new(vec![0u8; block_count as usize * BLOCK_SIZE]),
			block_count,
		}
	}
}

impl BlockDevice for MemDevice {
	fn block_count(&self) -> u64 {
		self.block_count
	}

	fn read_block(&self, n: u64, buf: &mut [u8]) -> SfsResult<()> {
		debug_assert_eq!(buf.len(), BLOCK_SIZE);
		let blocks = self.blocks.lock().unwrap();
		let off = n as usize * BLOCK_SIZE;
		buf.copy_from_slice(&blocks[off..off + BLOCK_SIZE]);
		Ok(())
	}

	fn write_block(&self, n: u64, buf: &[u8]) -> SfsResult<()> {
		debug_assert_eq!(buf.len(), BLOCK_SIZE);
		let mut blocks = self.blocks.lock().unwrap();
		let off = n as usize * BLOCK_SIZE;
		blocks[off..off + BLOCK_SIZE].copy_from_slice(buf);
		Ok(())
	}

	fn flush(&self) -> SfsResult<()> {
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn file_device_round_trip() {
		let tmp = tempfile::NamedTempFile::new().unwrap();
		let file = tmp.reopen().unwrap();
		let dev = FileDevice::new(file, 4);
		let mut buf = [0x42u8; BLOCK_SIZE];
		dev.write_block(1, &buf).unwrap();
		buf.fill(0);
		dev.read_block(1, &mut buf).unwrap();
		assert!(buf.iter().all(|&b| b == 0x42));
		dev.flush().unwrap();
	}

	#[test]
	fn mem_device_round_trip() {
		let dev = MemDevice::new(4);
		let mut buf = [0xAAu8; BLOCK_SIZE];
		dev.write_block(2, &buf).unwrap();
		buf.fill(0);
		dev.read_block(2, &mut buf).unwrap();
		assert!(buf.iter().all(|&b| b == 0xAA));
		// untouched block stays zeroed
		let mut other = [0xFFu8; BLOCK_SIZE];
		dev.read_block(0, &mut other).unwrap();
		assert!(other.iter().all(|&b| b == 0));
	}
}
