use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};

/// Flat filesystem server; a client of the block-device server.
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
	/// TCP port to listen on
	pub listen_port: u16,

	/// Host of the block-device server
	pub disk_host: String,

	/// Port of the block-device server
	pub disk_port: u16,

	#[command(flatten)]
	pub verbose: Verbosity<WarnLevel>,
}
