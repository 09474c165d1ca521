//! A two-tier simulated storage stack.
//!
//! The lower tier is a block device addressed by cylinder and sector,
//! served over a line-oriented TCP protocol with simulated seek latency
//! and a memory-mapped backing file.  The upper tier is a flat-namespace
//! filesystem (superblock, allocation table, fixed directory) whose server
//! is itself a client of the block device.  [`vdir`] adds the client-side
//! convention that emulates directories on top of the flat namespace.

/// (INTERNAL) Constructs an [`std::io::Error`] from an `errno`.
#[macro_export]
macro_rules! err {
	($name:ident) => {
		::std::io::Error::from_raw_os_error(::libc::$name)
	};
}

macro_rules! iobail {
	($kind:expr, $($tk:tt)+) => {
		return Err(::std::io::Error::new($kind, format!($($tk)+)))
	};
}

mod codec;
mod geom;
mod layout;
mod wire;

pub mod disk;
pub mod fs;
pub mod signal;
pub mod vdir;

pub use crate::{
	disk::{DiskClient, DiskServer},
	fs::{FsClient, FsServer, FsStatus},
	geom::Geometry,
	layout::{Block, Layout, BLOCK_SIZE},
	vdir::{DirClient, DirError},
};
