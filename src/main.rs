use clap::Parser;
use hostrun::cli::Cli;
use hostrun::models::EXIT_SETUP_FAILURE;
use std::process;

#[tokio::main]
async fn main() {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize logging
    if let Err(e) = cli.init_logging() {
        eprintln!("Error: {:#}", e);
        process::exit(EXIT_SETUP_FAILURE);
    }

    // Execute command
    match cli.execute().await {
        Ok(0) => {}
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(EXIT_SETUP_FAILURE);
        }
    }
}
