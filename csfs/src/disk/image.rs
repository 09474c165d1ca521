use std::{fs::OpenOptions, io::Result as IoResult, path::Path};

use memmap2::MmapMut;

use crate::layout::BLOCK_SIZE;

/// The device image: a file of exactly `blocks × 128` bytes mapped
/// read-write with shared visibility, so block access is slice arithmetic
/// and the contents survive restarts.
pub struct DiskImage {
	map:    MmapMut,
	blocks: u64,
}

impl DiskImage {
	/// Open or create `path` and size it to exactly `blocks` blocks.
	pub fn open(path: &Path, blocks: u64) -> IoResult<Self> {
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.open(path)?;
		file.set_len(blocks * BLOCK_SIZE as u64)?;
		// Safety: the mapping is dropped before the process can truncate
		// the file again; concurrent external writers are outside the
		// device's contract.
		let map = unsafe { MmapMut::map_mut(&file)? };
		Ok(Self {
			map,
			blocks,
		})
	}

	pub fn blocks(&self) -> u64 {
		self.blocks
	}

	pub fn block(&self, idx: u64) -> &[u8] {
		assert!(idx < self.blocks);
		let off = idx as usize * BLOCK_SIZE;
		&self.map[off..off + BLOCK_SIZE]
	}

	pub fn block_mut(&mut self, idx: u64) -> &mut [u8] {
		assert!(idx < self.blocks);
		let off = idx as usize * BLOCK_SIZE;
		&mut self.map[off..off + BLOCK_SIZE]
	}

	/// Schedule dirty pages for writeback.  The shared mapping reaches the
	/// file on unmap in any case; this only makes it eager.
	pub fn flush(&self) -> IoResult<()> {
		self.map.flush()
	}
}
