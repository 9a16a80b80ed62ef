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

//! A block-based filesystem engine: superblock, inode/data bitmaps, an
//! extent-tree content store, directories, symlinks and namespace
//! operations, built on a pluggable [`device::BlockDevice`].
//!
//! A volume is mounted with [`volume::Volume::load`]; every operation
//! then takes a [`volume::Txn`] acquired through [`volume::Volume::begin`],
//! so one logical filesystem call runs under a single lock acquisition.

pub mod bitmap;
pub mod device;
pub mod dir;
pub mod dirent;
pub mod error;
pub mod extent;
pub mod format;
pub mod layout;
pub mod logging;
pub mod namespace;
pub mod page;
pub mod symlink;
pub mod volume;

pub use device::{BlockDevice, FileDevice, MemDevice};
pub use error::{SfsError, SfsResult};
pub use layout::{ExtentPair, Inode, Superblock};
pub use volume::{Txn, Volume};
