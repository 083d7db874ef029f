//! `db` sub-commands. These always talk to Postgres.

use clap::Subcommand;
use refinery_core::AppConfig;

#[derive(Debug, Subcommand)]
pub enum DbCommands {
    /// Check that the database answers
    Ping,
    /// Apply pending migrations
    Migrate,
}

pub(crate) async fn run(config: &AppConfig, command: DbCommands) -> anyhow::Result<()> {
    let pool = refinery_db::connect_pool_from_config(config).await?;

    match command {
        DbCommands::Ping => {
            refinery_db::health_check(&pool).await?;
            println!("database ok");
        }
        DbCommands::Migrate => {
            let applied = refinery_db::run_migrations(&pool).await?;
            tracing::info!(applied, "migrations complete");
            println!("applied {applied} migration(s)");
        }
    }

    pool.close().await;
    Ok(())
}
