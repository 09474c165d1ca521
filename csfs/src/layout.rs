use std::io::Result as IoResult;

use bincode::{Decode, Encode};

use crate::{err, geom::Geometry};

/// Bytes per block; the unit of every device transfer.
pub const BLOCK_SIZE: usize = 128;

/// An in-memory copy of one device block.
pub type Block = [u8; BLOCK_SIZE];

/// Format identifier at offset 0 of block 0.
pub const MAGIC: [u8; 5] = *b"CSFS1";

/// Allocation-table entry: block is free for allocation.
pub const FAT_FREE: u32 = 0x0000_0000;

/// Allocation-table entry: block belongs to the metadata region.
pub const FAT_RESERVED: u32 = 0xFFFF_FFFE;

/// Allocation-table entry: last block of a chain.
pub const FAT_EOC: u32 = 0xFFFF_FFFF;

/// Allocation-table entries per block.
pub const FAT_PER_BLOCK: usize = BLOCK_SIZE / 4;

/// Bytes per directory entry.
pub const DIRENT_SIZE: usize = 64;

/// Directory entries per block.
pub const DIRENTS_PER_BLOCK: usize = BLOCK_SIZE / DIRENT_SIZE;

/// Upper bound on directory entries; small devices get a smaller
/// power of two (see [`Layout::compute`]).
pub const DIR_ENTRIES_MAX: u32 = 64;

/// Longest permitted file name; `Dirent::name` is nul-padded.
pub const NAME_MAX: usize = 31;

/// Block 0 of a formatted device.
///
/// Fixed-offset binary record: magic at 0, geometry at 16 and 24, the six
/// layout counters at 40..64, zero elsewhere.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct Superblock {
	pub magic:        [u8; 5],
	pad0:             [u8; 11],
	pub cylinders:    u64, // offset 16
	pub sectors:      u64, // offset 24
	pad1:             [u8; 8],
	pub total_blocks: u32, // offset 40
	pub fat_start:    u32, // offset 44
	pub fat_len:      u32, // offset 48
	pub dir_start:    u32, // offset 52
	pub dir_len:      u32, // offset 56
	pub dir_entries:  u32, // offset 60
	pad2:             [u8; 64],
}

impl Superblock {
	pub fn new(geom: &Geometry, layout: &Layout) -> Self {
		Self {
			magic: MAGIC,
			pad0: [0; 11],
			cylinders: geom.cylinders,
			sectors: geom.sectors,
			pad1: [0; 8],
			total_blocks: layout.total_blocks,
			fat_start: layout.fat_start,
			fat_len: layout.fat_len,
			dir_start: layout.dir_start,
			dir_len: layout.dir_len,
			dir_entries: layout.dir_entries,
			pad2: [0; 64],
		}
	}
}

/// One 64-byte directory record; two per block.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct Dirent {
	name:       [u8; 32],
	pub length: u32, // offset 32
	pub first:  u32, // offset 36
	pub used:   u8,  // offset 40
	pad:        [u8; 23],
}

impl Dirent {
	/// A fresh zero-length entry.  `name` must already be validated.
	pub fn new(name: &str) -> Self {
		let mut ent = Self::empty();
		ent.name[..name.len()].copy_from_slice(name.as_bytes());
		ent.first = FAT_EOC;
		ent.used = 1;
		ent
	}

	/// The all-zero record of an unused slot.
	pub fn empty() -> Self {
		Self {
			name:   [0; 32],
			length: 0,
			first:  0,
			used:   0,
			pad:    [0; 23],
		}
	}

	pub fn name(&self) -> &str {
		let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
		std::str::from_utf8(&self.name[..end]).unwrap_or("")
	}
}

/// Where the metadata regions live: derived from the geometry at format
/// time and recorded in the superblock, which is authoritative afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
	pub total_blocks: u32,
	pub fat_start:    u32,
	pub fat_len:      u32,
	pub dir_start:    u32,
	pub dir_len:      u32,
	pub dir_entries:  u32,
}

impl Layout {
	/// Place the metadata for a device of this geometry: superblock at 0,
	/// allocation table from block 1, directory right after.  The entry
	/// count starts at [`DIR_ENTRIES_MAX`] and halves until at least one
	/// data block remains.
	pub fn compute(geom: &Geometry) -> IoResult<Self> {
		let total = geom.total_blocks();
		if total >= FAT_RESERVED as u64 {
			// linear indices must stay clear of the entry markers
			return Err(err!(EINVAL));
		}
		let total = total as u32;
		let fat_len = total.div_ceil(FAT_PER_BLOCK as u32);

		let mut entries = DIR_ENTRIES_MAX;
		while entries >= 2 {
			let dir_len = entries / DIRENTS_PER_BLOCK as u32;
			if 1 + fat_len + dir_len < total {
				return Ok(Self {
					total_blocks: total,
					fat_start: 1,
					fat_len,
					dir_start: 1 + fat_len,
					dir_len,
					dir_entries: entries,
				});
			}
			entries /= 2;
		}
		Err(err!(ENOSPC))
	}

	/// Adopt the layout recorded by a previous format, iff the magic tag
	/// matches and the record is consistent with the device it sits on.
	pub fn from_superblock(sb: &Superblock, geom: &Geometry) -> Option<Self> {
		if sb.magic != MAGIC {
			return None;
		}
		if sb.cylinders != geom.cylinders || sb.sectors != geom.sectors {
			log::warn!(
				"superblock geometry {}x{} does not match device {}x{}",
				sb.cylinders,
				sb.sectors,
				geom.cylinders,
				geom.sectors
			);
			return None;
		}
		let layout = Self {
			total_blocks: sb.total_blocks,
			fat_start:    sb.fat_start,
			fat_len:      sb.fat_len,
			dir_start:    sb.dir_start,
			dir_len:      sb.dir_len,
			dir_entries:  sb.dir_entries,
		};
		let sane = layout.total_blocks as u64 == geom.total_blocks()
			&& layout.fat_start == 1
			&& layout.fat_len == layout.total_blocks.div_ceil(FAT_PER_BLOCK as u32)
			&& layout.dir_start == layout.fat_start + layout.fat_len
			&& layout.dir_entries.is_power_of_two()
			&& layout.dir_entries >= 2
			&& layout.dir_len == layout.dir_entries / DIRENTS_PER_BLOCK as u32
			&& layout.data_start() < layout.total_blocks;
		if !sane {
			log::warn!("superblock carries an inconsistent layout: {layout:?}");
			return None;
		}
		Some(layout)
	}

	pub fn superblock(&self, geom: &Geometry) -> Superblock {
		Superblock::new(geom, self)
	}

	/// First block available to file data.
	pub fn data_start(&self) -> u32 {
		self.dir_start + self.dir_len
	}
}

#[cfg(test)]
mod t {
	use rstest::rstest;

	use super::*;
	use crate::codec;

	#[test]
	fn superblock_offsets() {
		let geom = Geometry::new(0x0102, 0x0304);
		let layout = Layout {
			total_blocks: 0xAAAA,
			fat_start:    1,
			fat_len:      0xBBBB,
			dir_start:    0xCCCC,
			dir_len:      0xDDDD,
			dir_entries:  0xEEEE,
		};
		let mut buf = [0u8; BLOCK_SIZE];
		let n = codec::encode(&Superblock::new(&geom, &layout), &mut buf).unwrap();
		assert_eq!(n, BLOCK_SIZE);

		assert_eq!(&buf[0..5], b"CSFS1");
		assert_eq!(buf[16..24], [0x02, 0x01, 0, 0, 0, 0, 0, 0]);
		assert_eq!(buf[24..32], [0x04, 0x03, 0, 0, 0, 0, 0, 0]);
		assert_eq!(buf[40..44], [0xAA, 0xAA, 0, 0]);
		assert_eq!(buf[44..48], [0x01, 0, 0, 0]);
		assert_eq!(buf[48..52], [0xBB, 0xBB, 0, 0]);
		assert_eq!(buf[52..56], [0xCC, 0xCC, 0, 0]);
		assert_eq!(buf[56..60], [0xDD, 0xDD, 0, 0]);
		assert_eq!(buf[60..64], [0xEE, 0xEE, 0, 0]);
		assert!(buf[5..16].iter().all(|&b| b == 0));
		assert!(buf[64..].iter().all(|&b| b == 0));
	}

	#[test]
	fn superblock_roundtrip() {
		let geom = Geometry::new(16, 16);
		let layout = Layout::compute(&geom).unwrap();
		let sb = layout.superblock(&geom);

		let mut buf = [0u8; BLOCK_SIZE];
		codec::encode(&sb, &mut buf).unwrap();
		let back: Superblock = codec::decode(&buf).unwrap();
		assert_eq!(back, sb);
		assert_eq!(Layout::from_superblock(&back, &geom), Some(layout));
	}

	#[test]
	fn superblock_rejects_foreign_device() {
		let geom = Geometry::new(16, 16);
		let layout = Layout::compute(&geom).unwrap();
		let sb = layout.superblock(&geom);

		let other = Geometry::new(16, 8);
		assert_eq!(Layout::from_superblock(&sb, &other), None);

		let mut bad = sb.clone();
		bad.magic = *b"XSFS1";
		assert_eq!(Layout::from_superblock(&bad, &geom), None);
	}

	#[test]
	fn dirent_offsets() {
		let mut ent = Dirent::new("hello");
		ent.length = 0x0102_0304;
		ent.first = 0x0A0B_0C0D;

		let mut buf = [0u8; DIRENT_SIZE];
		let n = codec::encode(&ent, &mut buf).unwrap();
		assert_eq!(n, DIRENT_SIZE);

		assert_eq!(&buf[0..5], b"hello");
		assert!(buf[5..32].iter().all(|&b| b == 0));
		assert_eq!(buf[32..36], [0x04, 0x03, 0x02, 0x01]);
		assert_eq!(buf[36..40], [0x0D, 0x0C, 0x0B, 0x0A]);
		assert_eq!(buf[40], 1);
		assert!(buf[41..].iter().all(|&b| b == 0));

		let back: Dirent = codec::decode(&buf).unwrap();
		assert_eq!(back, ent);
		assert_eq!(back.name(), "hello");
	}

	#[test]
	fn fresh_dirent_is_an_empty_file() {
		let ent = Dirent::new("f");
		assert_eq!(ent.length, 0);
		assert_eq!(ent.first, FAT_EOC);
		assert_eq!(ent.used, 1);
	}

	#[rstest]
	#[case(2, 4, 8, 1, 4)] // 8 blocks: sb + 1 fat + 4 dir leaves 2 data blocks
	#[case(16, 16, 64, 8, 32)]
	#[case(100, 100, 64, 313, 32)]
	fn compute(
		#[case] c: u64,
		#[case] s: u64,
		#[case] entries: u32,
		#[case] fat_len: u32,
		#[case] dir_len: u32,
	) {
		let layout = Layout::compute(&Geometry::new(c, s)).unwrap();
		assert_eq!(layout.dir_entries, entries);
		assert_eq!(layout.fat_start, 1);
		assert_eq!(layout.fat_len, fat_len);
		assert_eq!(layout.dir_start, 1 + fat_len);
		assert_eq!(layout.dir_len, dir_len);
		assert!(layout.data_start() < layout.total_blocks);
	}

	#[test]
	fn compute_rejects_tiny_devices() {
		// 3 blocks cannot hold superblock, table, directory and data
		let e = Layout::compute(&Geometry::new(1, 3)).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::ENOSPC));
	}
}
