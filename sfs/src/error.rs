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

//! Error taxonomy for the SFS engine.

use std::fmt;

/// An error produced by the SFS engine.
#[derive(Debug)]
pub enum SfsError {
	/// The inode or block bitmap has no free bit left.
	NoSpace,
	/// A name, inode or block lookup found nothing.
	NotFound,
	/// A value was out of range or otherwise malformed: bad id, bad magic,
	/// bad geometry, a freed bit already clear, a name too long, an entry
	/// too large for a page.
	Invalid {
		reason: &'static str,
	},
	/// The underlying block device failed.
	Io(std::io::Error),
	/// `nlink` would exceed `SFS_MAX_LINK`.
	TooManyLinks,
	/// `rmdir` was called on a non-empty directory.
	NotEmpty,
	/// The volume is mounted read-only and the operation mutates it.
	ReadOnly,
}

pub type SfsResult<T> = Result<T, SfsError>;

impl fmt::Display for SfsError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::NoSpace => write!(f, "no space left on device"),
			Self::NotFound => write!(f, "no such file or directory"),
			Self::Invalid {
				reason,
			} => write!(f, "invalid: {reason}"),
			Self::Io(e) => write!(f, "I/O error: {e}"),
			Self::TooManyLinks => write!(f, "too many links"),
			Self::NotEmpty => write!(f, "directory not empty"),
			Self::ReadOnly => write!(f, "read-only filesystem"),
		}
	}
}

impl std::error::Error for SfsError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Self::Io(e) => Some(e),
			_ => None,
		}
	}
}

impl From<std::io::Error> for SfsError {
	fn from(e: std::io::Error) -> Self {
		Self::Io(e)
	}
}

/// Shorthand for building an [`SfsError::Invalid`].
macro_rules! invalid {
	($reason:expr) => {
		$crate::error::SfsError::Invalid {
			reason: $reason,
		}
	};
}
pub(crate) use invalid;
