mod cli;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dispatch::config::Config;
use dispatch::store::{Store, StoreError};

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "manage=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let database_url = match cli.database_url {
        Some(url) => url,
        None => Config::from_env()?.database_url,
    };
    let store = Store::connect(&database_url).await?;

    match cli.command {
        Command::DbSync => {
            store.migrate().await?;
            tracing::info!(database_url = %database_url, "Database schema synchronized");
        }
        Command::CategoryList => {
            store.migrate().await?;
            let categories = store.category_names().await?;
            if categories.is_empty() {
                println!("No categories were found");
            } else {
                println!(">> Package categories:");
                for name in categories {
                    println!("* {name}");
                }
            }
        }
        Command::CategoryAdd { category_name } => {
            store.migrate().await?;
            match store.add_category(&category_name).await {
                Ok(_) => println!(">> Successfully added category {category_name}"),
                Err(StoreError::Conflict(_)) => {
                    eprintln!(">> ERROR: Category '{category_name}' already exists");
                    return Ok(ExitCode::FAILURE);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
