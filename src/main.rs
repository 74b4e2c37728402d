use clap::Parser;
use custody_engine::{
	logging, server,
	settings::{CommandLineOptions, Settings},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let settings = match Settings::load(CommandLineOptions::parse()) {
		Ok(settings) => settings,
		Err(error) => {
			eprintln!("Error reading settings: {error}");
			return Ok(());
		},
	};

	logging::init();
	tracing::info!("Starting the custody engine");

	server::run(settings).await
}
