use anyhow::Result;
use clap::Parser;
use csfs::FsServer;

use crate::cli::Cli;

mod cli;

fn main() -> Result<()> {
	let cli = Cli::parse();

	env_logger::builder()
		.filter_level(cli.verbose.log_level_filter())
		.init();

	let server = FsServer::bind(
		("0.0.0.0", cli.listen_port),
		(cli.disk_host.as_str(), cli.disk_port),
	)?;
	csfs::signal::stop_on_interrupt(server.stop_flag())?;
	server.serve()?;

	Ok(())
}
