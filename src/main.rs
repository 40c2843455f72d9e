mod cli;

use clap::Parser;

use blegw_common::logger::*;

use cli::Args;

static LOGGER: Logger = Logger::new("blegw", true);

#[tokio::main]
async fn main() {
    if let Err(error) = LOGGER.init() {
        eprintln!("Error cannot init logger: {error}");
        std::process::exit(1);
    }

    let args = Args::parse();

    if let Err(error) = args.command.handle().await {
        error!("{error}");
        std::process::exit(1);
    }
}
