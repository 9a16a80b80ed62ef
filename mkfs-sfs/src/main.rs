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

//! `mkfs.sfs`: formats a device or regular file with a fresh SFS volume.
//!
//! Follows `mkfs/src/main.rs`'s `Args`/`parse_args` shape, extended with the
//! `-i`/`-n` options and positional block count `original_source/mkfs.sfs.c`
//! takes. The actual geometry computation and on-disk write-out live in
//! [`sfs::format`], shared with the integration tests; this binary only
//! handles argument parsing and the device-specific preflight checks
//! (block-special-device prompt, already-mounted check, device size probe).

use libc::{c_long, ioctl};
use sfs::format::{format, FormatOptions};
use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::process::exit;

const EXIT_DONE: i32 = 0;
const EXIT_USAGE: i32 = 4;
const EXIT_DIE: i32 = 16;

fn die(prog: &str, msg: &str) -> ! {
	eprintln!("{prog}: {msg}");
	exit(EXIT_DIE);
}

fn warn(prog: &str, msg: &str) {
	eprintln!("{prog}: warning: {msg}");
}

fn usage(prog: &str) -> ! {
	eprintln!("usage: {prog} [-i inode-count] [-n namelen] device [blocks]");
	exit(EXIT_USAGE);
}

/// Parsed command line.
struct Args {
	prog: String,
	device_path: PathBuf,
	block_count: Option<u32>,
	inode_count: Option<u32>,
	namelen: Option<u16>,
}

fn parse_args() -> Args {
	let mut iter = env::args();
	let prog = iter.next().unwrap_or_else(|| "mkfs.sfs".to_owned());

	let mut device_path = None;
	let mut block_count = None;
	let mut inode_count = None;
	let mut namelen = None;

	let args: Vec<String> = iter.collect();
	let mut i = 0;
	while i < args.len() {
		let arg = &args[i];
		let (flag, inline_value) = match arg.as_str() {
			"-h" | "--help" => usage(&prog),
			s if s.starts_with("-i") && s.len() > 2 => ("-i", Some(s[2..].to_owned())),
			s if s.starts_with("-n") && s.len() > 2 => ("-n", Some(s[2..].to_owned())),
			"-i" | "-n" => (arg.as_str(), None),
			_ => {
				if device_path.is_none() {
					device_path = Some(PathBuf::from(arg));
				} else if block_count.is_none() {
					block_count = Some(arg.parse().unwrap_or_else(|_| die(&prog, "invalid block number")));
				} else {
					usage(&prog);
				}
				i += 1;
				continue;
			}
		};

		let value = inline_value.or_else(|| {
			i += 1;
			args.get(i).cloned()
		});
		let value = value.unwrap_or_else(|| usage(&prog));
		match flag {
			"-i" => inode_count = Some(value.parse().unwrap_or_else(|_| die(&prog, "invalid inode number"))),
			"-n" => namelen = Some(value.parse().unwrap_or_else(|_| die(&prog, "invalid file name limit"))),
			_ => unreachable!(),
		}
		i += 1;
	}

	let device_path = device_path.unwrap_or_else(|| usage(&prog));
	Args {
		prog,
		device_path,
		block_count,
		inode_count,
		namelen,
	}
}

fn prompt_yes_no(question: &str) -> bool {
	print!("{question}");
	let _ = io::stdout().flush();
	let mut line = String::new();
	if io::stdin().lock().read_line(&mut line).is_err() {
		return false;
	}
	matches!(line.trim(), "y" | "Y")
}

/// `BLKGETSIZE64`: reports device size in bytes.
const BLKGETSIZE64: c_long = ((2) << 30) | ((0x12) << 8) | 114 | ((std::mem::size_of::<u64>() as c_long) << 16);

/// Size of `file` in 512-byte sectors, via `BLKGETSIZE64` for block devices
/// and `File::metadata` for regular files.
fn device_size_sectors(file: &File, is_block: bool) -> io::Result<u64> {
	if is_block {
		let mut bytes: u64 = 0;
		let ret = unsafe { ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut bytes) };
		if ret < 0 {
			return Err(io::Error::last_os_error());
		}
		Ok(bytes / 512)
	} else {
		Ok(file.metadata()?.len() / 512)
	}
}

/// Refuses to format a device already listed in `/proc/mounts`.
fn check_not_mounted(prog: &str, device_path: &std::path::Path) {
	let canonical = std::fs::canonicalize(device_path).unwrap_or_else(|_| device_path.to_path_buf());
	let mounts = match std::fs::read_to_string("/proc/mounts") {
		Ok(s) => s,
		Err(_) => {
			warn(prog, "can't check mounted filesystems");
			return;
		}
	};
	for line in mounts.lines() {
		if let Some(mnt_source) = line.split_whitespace().next() {
			if std::path::Path::new(mnt_source) == canonical {
				die(prog, "file system already mounted");
			}
		}
	}
}

fn main() {
	sfs::logging::init(log::LevelFilter::Info);
	let args = parse_args();
	let prog = args.prog.as_str();

	let meta = std::fs::metadata(&args.device_path).unwrap_or_else(|e| die(prog, &format!("can't stat device: {e}")));
	let is_block = meta.file_type().is_block_device();
	if !is_block {
		println!("{}: {} is not a block special device.", prog, args.device_path.display());
		if !prompt_yes_no("Proceed anyway? (y,n) ") {
			exit(EXIT_DONE);
		}
	}
	check_not_mounted(prog, &args.device_path);

	let mut open_opts = OpenOptions::new();
	open_opts.read(true).write(true);
	let file = open_opts
		.open(&args.device_path)
		.unwrap_or_else(|e| die(prog, &format!("can't open device: {e}")));

	let sectors = device_size_sectors(&file, is_block).unwrap_or_else(|e| die(prog, &format!("can't get device size: {e}")));
	let available_blocks = sectors / (sfs::layout::BLOCK_SIZE as u64 / 512);
	if available_blocks == 0 {
		die(prog, "device too small");
	}
	if let Some(n) = args.block_count {
		if n as u64 > available_blocks {
			die(prog, &format!("requested {n} blocks but only {available_blocks} are available"));
		}
	}
	println!(
		"sfs will use {} blocks ({} bytes each)",
		args.block_count.map(|n| n as u64).unwrap_or(available_blocks),
		sfs::layout::BLOCK_SIZE
	);

	let dev = sfs::device::FileDevice::new(file, available_blocks);
	let opts = FormatOptions {
		block_count: args.block_count,
		inode_count: args.inode_count,
		namelen: args.namelen.unwrap_or(0),
	};
	let geo = format(&dev, &opts, sfs::layout::now()).unwrap_or_else(|e| die(prog, &format!("can't format device: {e}")));
	println!(
		"{} inodes in {} blocks, {} imap block(s), {} bmap block(s), {} block(s) reserved",
		geo.inode_count, geo.inode_blocks, geo.imap_blocks, geo.bmap_blocks, geo.first_data_block
	);

	log::info!("formatted {} as sfs", args.device_path.display());
	exit(EXIT_DONE);
}
