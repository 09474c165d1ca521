use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};

/// Simulated cylinder/sector block-device server.
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
	/// TCP port to listen on
	pub port: u16,

	/// Number of cylinders
	#[arg(value_parser = clap::value_parser!(u64).range(1..))]
	pub cylinders: u64,

	/// Sectors per cylinder
	#[arg(value_parser = clap::value_parser!(u64).range(1..))]
	pub sectors: u64,

	/// Track-to-track seek time in microseconds
	pub track_us: u64,

	/// Backing file holding the disk image
	pub backing_file: PathBuf,

	#[command(flatten)]
	pub verbose: Verbosity<WarnLevel>,
}
