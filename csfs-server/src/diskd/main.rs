use anyhow::Result;
use clap::Parser;
use csfs::{DiskServer, Geometry};

use crate::cli::Cli;

mod cli;

fn main() -> Result<()> {
	let cli = Cli::parse();

	env_logger::builder()
		.filter_level(cli.verbose.log_level_filter())
		.init();

	let geom = Geometry::new(cli.cylinders, cli.sectors);
	let server = DiskServer::bind(("0.0.0.0", cli.port), geom, cli.track_us, &cli.backing_file)?;
	csfs::signal::stop_on_interrupt(server.stop_flag())?;
	server.serve()?;

	Ok(())
}
