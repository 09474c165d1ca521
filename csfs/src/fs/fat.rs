//! Allocation-table maintenance: the cached copy, its block I/O, and the
//! chain operations performed on the cache.
//!
//! Entries are 32-bit little-endian, 32 per block: `FREE`, `RESERVED`,
//! `END-OF-CHAIN`, or the index of the successor block in a file's chain.
//! Mutators return undo material so a failing write can put the cache back
//! exactly as it was.

use std::io::Result as IoResult;

use super::Meta;
use crate::{
	codec,
	disk::DiskClient,
	err,
	layout::{Layout, BLOCK_SIZE, FAT_EOC, FAT_FREE, FAT_PER_BLOCK, FAT_RESERVED},
};

/// The cached table, loading it from the device on first need.  Call with
/// the metadata mutex held.
pub(super) fn cached<'m>(
	meta: &'m mut Meta,
	disk: &mut DiskClient,
	layout: &Layout,
) -> IoResult<&'m mut Vec<u32>> {
	if meta.fat.is_none() {
		meta.fat = Some(load(disk, layout)?);
	}
	match meta.fat.as_mut() {
		Some(fat) => Ok(fat),
		None => unreachable!(),
	}
}

/// Read the whole table from the device.
pub(super) fn load(disk: &mut DiskClient, layout: &Layout) -> IoResult<Vec<u32>> {
	log::trace!("fat::load({} blocks);", layout.fat_len);
	let total = layout.total_blocks as usize;
	let mut fat = Vec::with_capacity(total);
	for b in layout.fat_start..layout.fat_start + layout.fat_len {
		let block = disk.read_index(b as u64)?;
		let entries: [u32; FAT_PER_BLOCK] = codec::decode(&block)?;
		for e in entries {
			if fat.len() < total {
				fat.push(e);
			}
		}
	}
	Ok(fat)
}

/// Write the whole cached table back, zero-padding the tail of the last
/// block.
pub(super) fn flush(disk: &mut DiskClient, layout: &Layout, fat: &[u32]) -> IoResult<()> {
	log::trace!("fat::flush({} entries);", fat.len());
	for (bi, b) in (layout.fat_start..layout.fat_start + layout.fat_len).enumerate() {
		let mut entries = [FAT_FREE; FAT_PER_BLOCK];
		let base = bi * FAT_PER_BLOCK;
		for (i, e) in entries.iter_mut().enumerate() {
			if base + i < fat.len() {
				*e = fat[base + i];
			}
		}
		let mut block = [0u8; BLOCK_SIZE];
		codec::encode(&entries, &mut block)?;
		disk.write_index(b as u64, &block)?;
	}
	Ok(())
}

fn is_data_index(layout: &Layout, idx: u32) -> bool {
	idx >= layout.data_start() && idx < layout.total_blocks
}

/// Follow a chain from `first`, expecting the block count a `length`-byte
/// file implies.  Returns the indices in file order; a chain that strays
/// out of the data region, hits an unallocated entry, or has the wrong
/// length is corruption.
pub(super) fn walk(fat: &[u32], layout: &Layout, first: u32, length: u32) -> IoResult<Vec<u32>> {
	let expect = (length as usize).div_ceil(BLOCK_SIZE);
	let mut chain = Vec::with_capacity(expect);
	if expect == 0 {
		return Ok(chain);
	}

	let mut idx = first;
	while chain.len() < expect {
		if !is_data_index(layout, idx) {
			break;
		}
		let entry = fat[idx as usize];
		if entry == FAT_FREE || entry == FAT_RESERVED {
			break;
		}
		chain.push(idx);
		if entry == FAT_EOC {
			break;
		}
		idx = entry;
	}

	let terminated = matches!(chain.last(), Some(&last) if fat[last as usize] == FAT_EOC);
	if chain.len() != expect || !terminated {
		log::error!("corrupted chain at {first}: walked {} of {expect} blocks", chain.len());
		return Err(err!(EIO));
	}
	Ok(chain)
}

/// Free every block of the chain rooted at `first`, returning the undo log
/// of `(index, previous entry)` pairs in walk order.  A corrupt chain is
/// restored before the error is reported.
pub(super) fn free_chain(fat: &mut [u32], layout: &Layout, first: u32) -> IoResult<Vec<(u32, u32)>> {
	let mut freed = Vec::new();
	let mut idx = first;
	loop {
		if !is_data_index(layout, idx) {
			undo(fat, &freed);
			log::error!("corrupted chain at {first}: link to {idx}");
			return Err(err!(EIO));
		}
		let entry = fat[idx as usize];
		if entry == FAT_FREE || entry == FAT_RESERVED {
			// revisiting a freed block also lands here, so cycles stop
			undo(fat, &freed);
			log::error!("corrupted chain at {first}: {idx} holds {entry:#010x}");
			return Err(err!(EIO));
		}
		freed.push((idx, entry));
		fat[idx as usize] = FAT_FREE;
		if entry == FAT_EOC {
			break;
		}
		idx = entry;
	}
	Ok(freed)
}

/// Put entries back after a failed mutation.
pub(super) fn undo(fat: &mut [u32], log: &[(u32, u32)]) {
	for &(idx, val) in log {
		fat[idx as usize] = val;
	}
}

/// First-fit allocation of `count` blocks, scanning forward from the start
/// of the data region.  Each block is reserved as END-OF-CHAIN and linked
/// onto its predecessor as it is found.  On exhaustion every reservation
/// is released and `None` comes back.
pub(super) fn alloc_chain(fat: &mut [u32], layout: &Layout, count: usize) -> Option<Vec<u32>> {
	debug_assert!(count > 0);
	let mut chain: Vec<u32> = Vec::with_capacity(count);
	for idx in layout.data_start()..layout.total_blocks {
		if fat[idx as usize] != FAT_FREE {
			continue;
		}
		fat[idx as usize] = FAT_EOC;
		if let Some(&prev) = chain.last() {
			fat[prev as usize] = idx;
		}
		chain.push(idx);
		if chain.len() == count {
			return Some(chain);
		}
	}
	for idx in chain {
		fat[idx as usize] = FAT_FREE;
	}
	None
}
