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

//! A minimal logger backing the `log` facade.
//!
//! Grounded in the shape of `kernel/src/logger.rs`'s `Logger`: a
//! struct implementing the logging trait, a single global instance, and
//! `init`/`get` free functions — adapted to write to stderr instead of a
//! ring buffer, and to implement [`log::Log`] instead of a kernel-specific
//! interface, since a hosted tool has no TTY driver to own.

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

/// The logger installed by [`init`].
pub struct Logger {
	/// Tells whether the logger is silent (logs are dropped rather than
	/// printed). Off by default.
	pub silent: AtomicBool,
}

impl Logger {
	pub const fn new() -> Self {
		Self {
			silent: AtomicBool::new(false),
		}
	}
}

impl Log for Logger {
	fn enabled(&self, metadata: &Metadata) -> bool {
		!self.silent.load(Ordering::Relaxed) && metadata.level() <= log::max_level()
	}

	fn log(&self, record: &Record) {
		if !self.enabled(record.metadata()) {
			return;
		}
		let prefix = match record.level() {
			Level::Error => "error",
			Level::Warn => "warn",
			Level::Info => "info",
			Level::Debug => "debug",
			Level::Trace => "trace",
		};
		let _ = writeln!(std::io::stderr(), "sfs: {prefix}: {}", record.args());
	}

	fn flush(&self) {
		let _ = std::io::stderr().flush();
	}
}

static LOGGER: Logger = Logger::new();

/// Installs [`LOGGER`] as the global `log` backend at `level`. Safe to call
/// more than once; later calls are no-ops, matching `log::set_logger`'s own
/// idempotency.
pub fn init(level: LevelFilter) {
	if log::set_logger(&LOGGER).is_ok() {
		log::set_max_level(level);
	}
}

/// Returns the installed logger, for toggling [`Logger::silent`].
pub fn get() -> &'static Logger {
	&LOGGER
}
