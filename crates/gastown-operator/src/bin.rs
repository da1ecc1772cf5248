/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

use gastown_operator::cli::commands;
use gastown_operator::cli::{parse_cli, Commands};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = parse_cli();

    match cli.command {
        Commands::Start { config } => {
            commands::start(config).await?;
        }
        Commands::Crds => {
            commands::crds()?;
        }
    }

    Ok(())
}
