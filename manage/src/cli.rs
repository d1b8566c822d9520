//! CLI definition using clap derive.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "manage", about = "Deployment database management")]
pub struct Cli {
    /// Database URL (default: DISPATCH_DATABASE_URL or sqlite:./data/dispatch.db)
    #[arg(long, global = true, env = "DISPATCH_DATABASE_URL")]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create or upgrade the database schema
    DbSync,
    /// List package categories
    CategoryList,
    /// Add a package category
    CategoryAdd {
        /// Name of the new category
        category_name: String,
    },
}
