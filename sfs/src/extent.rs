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

//! The extent tree: translates `(inode, logical_block)` to a physical
//! block, on demand allocating and growing the tree as needed.
//!
//! Lookup is grounded in `itree.c`'s `sfs_find_direct`/`sfs_find_indirect`/
//! `sfs_find_dbindirect`. Allocation and truncation generalize
//! `kernel/src/file/fs/ext2/inode.rs`'s `alloc_content_blk`/
//! `free_content_blk_impl`/`indirect_free_all` recursion shape from ext2's
//! 12-direct/indirect/doubly/triply scheme down to SFS's 4-direct/
//! indirect/doubly scheme, and complete the indirect and doubly-indirect
//! paths that the original `sfs_alloc_block`/`sfs_truncate` leave
//! unimplemented (Open Questions 2 and 3).

use crate::device::BlockDevice;
use crate::error::{invalid, SfsResult};
use crate::layout::{
	ceil_div, ExtentPair, Inode, BLOCK_SIZE, DBINDIRECT_BY_BLOCK, DIRECT_EXTENTS, INDIRECT_BY_BLOCK,
};
use crate::volume::Txn;
use bytemuck::{cast_slice, cast_slice_mut};

/// Where, within the extent tree, the next new extent slot is, and what the
/// immediately preceding extent is (the merge candidate).
enum NextSlot {
	Direct(usize),
	NeedIndirect,
	IndirectSlot(usize),
	NeedDbIndirectPtr(usize),
	NeedDbIndirectIndirect(usize),
	DbIndirectSlot(usize, usize),
	Full,
}

struct Tail {
	last: Option<ExtentPair>,
	next: NextSlot,
}

fn read_pairs<D: BlockDevice>(txn: &Txn<D>, block: u32) -> SfsResult<[ExtentPair; INDIRECT_BY_BLOCK]> {
	let mut buf = [0u8; BLOCK_SIZE];
	txn.read_block(block, &mut buf)?;
	let mut out = [ExtentPair::ZERO; INDIRECT_BY_BLOCK];
	out.copy_from_slice(cast_slice(&buf));
	Ok(out)
}

fn write_pairs<D: BlockDevice>(txn: &mut Txn<D>, block: u32, pairs: &[ExtentPair; INDIRECT_BY_BLOCK]) -> SfsResult<()> {
	let mut buf = [0u8; BLOCK_SIZE];
	cast_slice_mut(&mut buf).copy_from_slice(pairs);
	txn.write_block(block, &buf)
}

fn read_ptrs<D: BlockDevice>(txn: &Txn<D>, block: u32) -> SfsResult<[u32; DBINDIRECT_BY_BLOCK]> {
	let mut buf = [0u8; BLOCK_SIZE];
	txn.read_block(block, &mut buf)?;
	let mut out = [0u32; DBINDIRECT_BY_BLOCK];
	out.copy_from_slice(cast_slice(&buf));
	Ok(out)
}

fn write_ptrs<D: BlockDevice>(txn: &mut Txn<D>, block: u32, ptrs: &[u32; DBINDIRECT_BY_BLOCK]) -> SfsResult<()> {
	let mut buf = [0u8; BLOCK_SIZE];
	cast_slice_mut(&mut buf).copy_from_slice(ptrs);
	txn.write_block(block, &buf)
}

/// Scans a tier's extent pairs for `l`. Returns `Ok(Some(phys))` on hit,
/// `Ok(None)` if `l` falls past the last populated pair in this tier
/// (caller should continue into the next tier), after subtracting the
/// counts of every pair examined from `l`.
fn scan_direct(pairs: &[ExtentPair], l: &mut u64) -> Option<u32> {
	for e in pairs {
		if e.is_empty() {
			return None;
		}
		if *l < e.b_count as u64 {
			return Some(e.b_start + *l as u32);
		}
		*l -= e.b_count as u64;
	}
	None
}

/// Looks up the physical block backing logical block `l` of `inode`.
/// Returns `Ok(None)` if `l` is beyond the currently allocated extents.
pub fn find<D: BlockDevice>(txn: &Txn<D>, inode: &Inode, l: u64) -> SfsResult<Option<u32>> {
	let mut l = l;
	let direct: Vec<ExtentPair> = (0..DIRECT_EXTENTS).map(|i| inode.direct(i)).collect();
	if let Some(p) = scan_direct(&direct, &mut l) {
		return Ok(Some(p));
	}
	if direct.iter().any(|e| e.is_empty()) {
		return Ok(None);
	}
	if inode.indirect_block() == 0 {
		return Ok(None);
	}
	let pairs = read_pairs(txn, inode.indirect_block())?;
	if let Some(p) = scan_direct(&pairs, &mut l) {
		return Ok(Some(p));
	}
	if pairs.iter().any(|e| e.is_empty()) {
		return Ok(None);
	}
	if inode.dbindirect_block() == 0 {
		return Ok(None);
	}
	let ptrs = read_ptrs(txn, inode.dbindirect_block())?;
	for ptr in ptrs {
		if ptr == 0 {
			return Ok(None);
		}
		let pairs = read_pairs(txn, ptr)?;
		if let Some(p) = scan_direct(&pairs, &mut l) {
			return Ok(Some(p));
		}
		if pairs.iter().any(|e| e.is_empty()) {
			return Ok(None);
		}
	}
	Ok(None)
}

/// Locates the next free extent slot and the extent immediately preceding
/// it (the merge candidate), walking the tree exactly as `find` does.
fn locate_tail<D: BlockDevice>(txn: &Txn<D>, inode: &Inode) -> SfsResult<Tail> {
	let mut last = None;
	for i in 0..DIRECT_EXTENTS {
		let e = inode.direct(i);
		if e.is_empty() {
			return Ok(Tail {
				last,
				next: NextSlot::Direct(i),
			});
		}
		last = Some(e);
	}
	if inode.indirect_block() == 0 {
		return Ok(Tail {
			last,
			next: NextSlot::NeedIndirect,
		});
	}
	let pairs = read_pairs(txn, inode.indirect_block())?;
	for (j, e) in pairs.iter().enumerate() {
		if e.is_empty() {
			return Ok(Tail {
				last,
				next: NextSlot::IndirectSlot(j),
			});
		}
		last = Some(*e);
	}
	if inode.dbindirect_block() == 0 {
		return Ok(Tail {
			last,
			next: NextSlot::NeedDbIndirectPtr(0),
		});
	}
	let ptrs = read_ptrs(txn, inode.dbindirect_block())?;
	for (k, ptr) in ptrs.iter().enumerate() {
		if *ptr == 0 {
			return Ok(Tail {
				last,
				next: NextSlot::NeedDbIndirectIndirect(k),
			});
		}
		let pairs = read_pairs(txn, *ptr)?;
		for (j, e) in pairs.iter().enumerate() {
			if e.is_empty() {
				return Ok(Tail {
					last,
					next: NextSlot::DbIndirectSlot(k, j),
				});
			}
			last = Some(*e);
		}
	}
	Ok(Tail {
		last,
		next: NextSlot::Full,
	})
}

/// Allocates one new block and appends it to `inode`'s extent tree,
/// growing indirect/doubly-indirect structures on demand. Returns the
/// logical block index that was just populated (always the file's current
/// block count before the call).
pub fn extend<D: BlockDevice>(txn: &mut Txn<D>, inode: &mut Inode) -> SfsResult<u32> {
	let tail = locate_tail(txn, inode)?;
	let hint = tail.last.map(|e| e.b_start + e.b_count);
	let p = txn.alloc_block(hint)?;
	let merge = matches!((hint, tail.last), (Some(h), Some(_)) if h == p);

	match tail.next {
		NextSlot::Direct(i) => {
			if merge {
				let mut e = inode.direct(i - 1);
				e.b_count += 1;
				inode.set_direct(i - 1, e);
			} else {
				inode.set_direct(
					i,
					ExtentPair {
						b_start: p,
						b_count: 1,
					},
				);
			}
		}
		NextSlot::NeedIndirect => {
			let blk = txn.alloc_block(None)?;
			txn.zero_block(blk)?;
			inode.set_indirect_block(blk);
			let mut pairs = [ExtentPair::ZERO; INDIRECT_BY_BLOCK];
			pairs[0] = ExtentPair {
				b_start: p,
				b_count: 1,
			};
			write_pairs(txn, blk, &pairs)?;
		}
		NextSlot::IndirectSlot(j) => {
			let blk = inode.indirect_block();
			let mut pairs = read_pairs(txn, blk)?;
			if merge && j > 0 {
				pairs[j - 1].b_count += 1;
			} else {
				pairs[j] = ExtentPair {
					b_start: p,
					b_count: 1,
				};
			}
			write_pairs(txn, blk, &pairs)?;
		}
		NextSlot::NeedDbIndirectPtr(k) => {
			let dbi = txn.alloc_block(None)?;
			txn.zero_block(dbi)?;
			inode.set_dbindirect_block(dbi);
			let ind = txn.alloc_block(None)?;
			txn.zero_block(ind)?;
			let mut ptrs = [0u32; DBINDIRECT_BY_BLOCK];
			ptrs[k] = ind;
			write_ptrs(txn, dbi, &ptrs)?;
			let mut pairs = [ExtentPair::ZERO; INDIRECT_BY_BLOCK];
			pairs[0] = ExtentPair {
				b_start: p,
				b_count: 1,
			};
			write_pairs(txn, ind, &pairs)?;
		}
		NextSlot::NeedDbIndirectIndirect(k) => {
			let dbi = inode.dbindirect_block();
			let mut ptrs = read_ptrs(txn, dbi)?;
			let ind = txn.alloc_block(None)?;
			txn.zero_block(ind)?;
			ptrs[k] = ind;
			write_ptrs(txn, dbi, &ptrs)?;
			let mut pairs = [ExtentPair::ZERO; INDIRECT_BY_BLOCK];
			pairs[0] = ExtentPair {
				b_start: p,
				b_count: 1,
			};
			write_pairs(txn, ind, &pairs)?;
		}
		NextSlot::DbIndirectSlot(k, j) => {
			let dbi = inode.dbindirect_block();
			let ptrs = read_ptrs(txn, dbi)?;
			let ind = ptrs[k];
			let mut pairs = read_pairs(txn, ind)?;
			if merge && j > 0 {
				pairs[j - 1].b_count += 1;
			} else {
				pairs[j] = ExtentPair {
					b_start: p,
					b_count: 1,
				};
			}
			write_pairs(txn, ind, &pairs)?;
		}
		NextSlot::Full => {
			return Err(invalid!("file exceeds the maximum size representable by the extent tree"));
		}
	}

	// The logical index just populated is the block count before this call:
	// recompute the total now that the new extent is in place and subtract
	// one.
	let populated = {
		let mut count = 0u64;
		for i in 0..DIRECT_EXTENTS {
			count += inode.direct(i).b_count as u64;
		}
		if inode.indirect_block() != 0 {
			for e in read_pairs(txn, inode.indirect_block())? {
				if e.is_empty() {
					break;
				}
				count += e.b_count as u64;
			}
		}
		if inode.dbindirect_block() != 0 {
			for ptr in read_ptrs(txn, inode.dbindirect_block())? {
				if ptr == 0 {
					break;
				}
				for e in read_pairs(txn, ptr)? {
					if e.is_empty() {
						break;
					}
					count += e.b_count as u64;
				}
			}
		}
		count - 1
	};
	Ok(populated as u32)
}

/// Frees every block belonging to `inode`'s extent tree past logical block
/// `keep`, shrinking and, where a tier becomes entirely empty, freeing the
/// indirect/doubly-indirect structural blocks themselves. Completes what
/// the original only does for direct extents.
pub fn truncate<D: BlockDevice>(txn: &mut Txn<D>, inode: &mut Inode, new_size: u64) -> SfsResult<()> {
	let keep = ceil_div(new_size, BLOCK_SIZE as u64);

	// Doubly-indirect tier.
	if inode.dbindirect_block() != 0 {
		let dbi = inode.dbindirect_block();
		let mut ptrs = read_ptrs(txn, dbi)?;
		let mut remaining = keep.saturating_sub(tier_capacity_before_dbindirect(txn, inode)?);
		let mut any_left = false;
		for ptr in ptrs.iter_mut() {
			if *ptr == 0 {
				break;
			}
			let freed_fully = truncate_indirect_block(txn, *ptr, &mut remaining)?;
			if freed_fully {
				txn.free_block(*ptr)?;
				*ptr = 0;
			} else {
				any_left = true;
			}
		}
		if any_left {
			write_ptrs(txn, dbi, &ptrs)?;
		} else {
			txn.free_block(dbi)?;
			inode.set_dbindirect_block(0);
		}
	}

	// Indirect tier.
	if inode.indirect_block() != 0 {
		let ind = inode.indirect_block();
		let direct_cap: u64 = (0..DIRECT_EXTENTS).map(|i| inode.direct(i).b_count as u64).sum();
		let mut remaining = keep.saturating_sub(direct_cap);
		let freed_fully = truncate_indirect_block(txn, ind, &mut remaining)?;
		if freed_fully {
			txn.free_block(ind)?;
			inode.set_indirect_block(0);
		}
	}

	// Direct tier, walked back to front so later extents are trimmed first.
	let mut remaining = keep;
	for i in 0..DIRECT_EXTENTS {
		let mut e = inode.direct(i);
		if e.is_empty() {
			continue;
		}
		if remaining >= e.b_count as u64 {
			remaining -= e.b_count as u64;
			continue;
		}
		let keep_here = remaining as u32;
		for b in (e.b_start + keep_here)..(e.b_start + e.b_count) {
			txn.free_block(b)?;
		}
		if keep_here == 0 {
			inode.set_direct(i, ExtentPair::ZERO);
		} else {
			e.b_count = keep_here;
			inode.set_direct(i, e);
		}
		remaining = 0;
	}

	Ok(())
}

/// Total logical blocks actually occupied by the direct + indirect tiers,
/// i.e. the logical offset at which the doubly-indirect tier begins. Used
/// to know how many of `keep` blocks to retain within the doubly-indirect
/// subtree. Sums real extent counts rather than slot counts, since a
/// merged extent can cover many blocks per slot.
fn tier_capacity_before_dbindirect<D: BlockDevice>(txn: &Txn<D>, inode: &Inode) -> SfsResult<u64> {
	let mut cap: u64 = (0..DIRECT_EXTENTS).map(|i| inode.direct(i).b_count as u64).sum();
	if inode.indirect_block() != 0 {
		for e in read_pairs(txn, inode.indirect_block())? {
			if e.is_empty() {
				break;
			}
			cap += e.b_count as u64;
		}
	}
	Ok(cap)
}

/// Truncates one indirect block's extents to retain `*remaining` logical
/// blocks, decrementing `*remaining` by what was kept. Returns whether the
/// whole block is now empty (every pair zeroed).
fn truncate_indirect_block<D: BlockDevice>(txn: &mut Txn<D>, block: u32, remaining: &mut u64) -> SfsResult<bool> {
	let mut pairs = read_pairs(txn, block)?;
	let mut any_left = false;
	for e in pairs.iter_mut() {
		if e.is_empty() {
			break;
		}
		if *remaining >= e.b_count as u64 {
			*remaining -= e.b_count as u64;
			any_left = true;
			continue;
		}
		let keep_here = *remaining as u32;
		for b in (e.b_start + keep_here)..(e.b_start + e.b_count) {
			txn.free_block(b)?;
		}
		if keep_here == 0 {
			*e = ExtentPair::ZERO;
		} else {
			e.b_count = keep_here;
			any_left = true;
		}
		*remaining = 0;
	}
	write_pairs(txn, block, &pairs)?;
	Ok(!any_left)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::device::MemDevice;
	use crate::layout::Superblock;
	use bytemuck::Zeroable;

	fn fresh_volume(nblocks: u32) -> crate::volume::Volume<MemDevice> {
		let dev = MemDevice::new(nblocks as u64);
		let sb = Superblock {
			s_nblocks: nblocks,
			s_ninodes: 64,
			s_inode_blocks: 1,
			s_imap_blocks: 1,
			s_bmap_blocks: 1,
			s_firstdatablock: 4,
			s_state: crate::layout::SFS_VALID_FS,
			s_namelen: 0,
			s_magic: crate::layout::SFS_MAGIC,
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
		crate::volume::Volume::load(dev, false).unwrap()
	}

	#[test]
	fn extend_merges_contiguous_blocks() {
		let vol = fresh_volume(64);
		let mut txn = vol.begin();
		let mut inode = Inode::zeroed();
		for i in 0..5 {
			let l = extend(&mut txn, &mut inode).unwrap();
			assert_eq!(l, i);
		}
		let e = inode.direct(0);
		assert_eq!(e.b_count, 5, "contiguous allocations should merge into one extent");
		assert!(find(&txn, &inode, 0).unwrap().is_some());
		assert_eq!(find(&txn, &inode, 4).unwrap().unwrap(), e.b_start + 4);
		assert!(find(&txn, &inode, 5).unwrap().is_none());
	}

	#[test]
	fn extend_promotes_to_indirect_when_direct_exhausted() {
		let vol = fresh_volume(600);
		let mut txn = vol.begin();
		let mut inode = Inode::zeroed();
		// Force 4 separate direct extents by interleaving an unrelated
		// allocation between each append so they can't merge.
		for slot in 0..4u32 {
			extend(&mut txn, &mut inode).unwrap();
			let filler = txn.alloc_block(None).unwrap();
			let _ = filler;
			let _ = slot;
		}
		assert!((0..4).all(|i| !inode.direct(i).is_empty()));
		// next extend must go to the indirect tier
		extend(&mut txn, &mut inode).unwrap();
		assert_ne!(inode.indirect_block(), 0);
	}

	#[test]
	fn truncate_reclaims_direct_blocks() {
		let vol = fresh_volume(64);
		let mut txn = vol.begin();
		let mut inode = Inode::zeroed();
		for _ in 0..10 {
			extend(&mut txn, &mut inode).unwrap();
		}
		truncate(&mut txn, &mut inode, 0).unwrap();
		assert!(inode.direct(0).is_empty());
		// blocks are free again
		let id = txn.alloc_block(None).unwrap();
		assert!(id >= 4);
	}
}
