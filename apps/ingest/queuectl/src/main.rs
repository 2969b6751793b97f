//! Queue operator CLI.

use clap::Parser;
use core_config::redis::RedisConfig;
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use queuectl::{Cli, execute};
use task_queue::{ConnectRetry, QueueConfig, QueueManager, connect_with_retry};

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre();

    let environment = Environment::from_env();
    init_tracing(&environment);

    let cli = Cli::parse();

    let queue_config = QueueConfig::from_env().wrap_err("Failed to load queue configuration")?;
    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;
    let redis = connect_with_retry(&redis_config, &ConnectRetry::new().with_max_retries(2))
        .await
        .wrap_err("Failed to connect to Redis")?;

    let manager = QueueManager::redis(redis, queue_config);
    let output = execute(&manager, cli.command, &environment).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
