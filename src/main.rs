//! greddit-db - Main entry point.
//!
//! Connects to PostgreSQL, brings the schema up to date and, in serve mode,
//! holds the pool open until interrupted.

use clap::Parser;
use greddit_db::config::{Config, RunMode};
use greddit_db::{ConnectionPool, Context, MigrationCatalog, MigrationRunner};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    init_tracing(&config);

    info!(mode = %config.mode, "Starting greddit-db v{}", env!("CARGO_PKG_VERSION"));

    let db_config = config.database()?;
    info!(
        url = %db_config.redacted(),
        name = db_config.database.as_deref().unwrap_or("<default>"),
        "Using database"
    );

    let catalog = match &config.migrations_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "Loading migrations from directory");
            MigrationCatalog::from_dir(dir)?
        }
        None => MigrationCatalog::embedded()?,
    };

    let pool = match ConnectionPool::connect(&db_config.connection_string, &db_config.pool_options)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, suggestion = ?e.suggestion(), "Error creating postgres pool");
            return Err(e.into());
        }
    };

    let ctx = Context::background().with_cancel();
    let runner = MigrationRunner::new(pool.clone(), catalog);

    let result = match config.mode {
        RunMode::Status => match runner.status(&ctx).await {
            Ok(status) => {
                for applied in &status.applied {
                    println!("applied  {:>6}  {}", applied.ordinal, applied.applied_at);
                }
                for file in &status.pending {
                    println!("pending          {}", file);
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
        RunMode::Migrate => runner.run(&ctx).await.map(|_| ()),
        RunMode::Serve => match runner.run(&ctx).await {
            Ok(_) => {
                info!("Ready; press Ctrl-C to stop");
                tokio::signal::ctrl_c().await?;
                info!("Shutdown requested");
                ctx.cancel();
                Ok(())
            }
            Err(e) => Err(e),
        },
    };

    pool.close().await;

    if let Err(e) = result {
        error!(error = %e, "Error initializing postgres schema");
        return Err(e.into());
    }

    info!("Shutdown complete");
    Ok(())
}
