//! Directory-table I/O: fixed 64-byte records, two per block, always moved
//! through whole-block read-modify-write so a concurrent reader never sees
//! a torn entry.

use std::io::Result as IoResult;

use crate::{
	codec,
	disk::DiskClient,
	layout::{Dirent, Layout, DIRENTS_PER_BLOCK, DIRENT_SIZE},
};

fn slot_addr(layout: &Layout, slot: u32) -> (u64, usize) {
	let block = layout.dir_start + slot / DIRENTS_PER_BLOCK as u32;
	let off = (slot as usize % DIRENTS_PER_BLOCK) * DIRENT_SIZE;
	(block as u64, off)
}

/// Iterate the directory in slot order, calling `f` on every record until
/// it returns `Some`.
pub(super) fn scan<T>(
	disk: &mut DiskClient,
	layout: &Layout,
	mut f: impl FnMut(u32, &Dirent) -> Option<T>,
) -> IoResult<Option<T>> {
	let mut slot = 0;
	for b in layout.dir_start..layout.dir_start + layout.dir_len {
		let block = disk.read_index(b as u64)?;
		for s in 0..DIRENTS_PER_BLOCK {
			if slot == layout.dir_entries {
				return Ok(None);
			}
			let ent: Dirent = codec::decode(&block[s * DIRENT_SIZE..])?;
			if let Some(x) = f(slot, &ent) {
				return Ok(Some(x));
			}
			slot += 1;
		}
	}
	Ok(None)
}

/// Find the used entry named `name`.
pub(super) fn lookup(
	disk: &mut DiskClient,
	layout: &Layout,
	name: &str,
) -> IoResult<Option<(u32, Dirent)>> {
	scan(disk, layout, |slot, ent| {
		(ent.used == 1 && ent.name() == name).then(|| (slot, ent.clone()))
	})
}

/// First unused slot, if any.
pub(super) fn free_slot(disk: &mut DiskClient, layout: &Layout) -> IoResult<Option<u32>> {
	scan(disk, layout, |slot, ent| (ent.used != 1).then_some(slot))
}

/// Every record in slot order.
pub(super) fn entries(disk: &mut DiskClient, layout: &Layout) -> IoResult<Vec<Dirent>> {
	let mut out = Vec::with_capacity(layout.dir_entries as usize);
	scan(disk, layout, |_slot, ent| {
		out.push(ent.clone());
		None::<()>
	})?;
	Ok(out)
}

/// Store `ent` in `slot` through a read-modify-write of its block.
pub(super) fn write_slot(
	disk: &mut DiskClient,
	layout: &Layout,
	slot: u32,
	ent: &Dirent,
) -> IoResult<()> {
	let (block, off) = slot_addr(layout, slot);
	let mut buf = disk.read_index(block)?;
	codec::encode(ent, &mut buf[off..off + DIRENT_SIZE])?;
	disk.write_index(block, &buf)
}

#[cfg(test)]
mod t {
	use super::*;
	use crate::geom::Geometry;

	#[test]
	fn slot_addressing() {
		let layout = Layout::compute(&Geometry::new(16, 16)).unwrap();
		assert_eq!(layout.dir_start, 9);
		assert_eq!(slot_addr(&layout, 0), (9, 0));
		assert_eq!(slot_addr(&layout, 1), (9, 64));
		assert_eq!(slot_addr(&layout, 2), (10, 0));
		assert_eq!(slot_addr(&layout, 63), (40, 64));
	}
}
