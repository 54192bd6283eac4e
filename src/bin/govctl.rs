//! govctl: operator CLI for lit-governor.
//!
//! Loads the same configuration a service would and runs one-off health,
//! stats, invalidation or limiter checks against it.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;

use lit_governor::{CacheManager, GovernorConfig, HealthStatus};

#[derive(Parser)]
#[command(name = "govctl")]
#[command(version)]
#[command(about = "Inspect and administer lit-governor rate limits and caches")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, env = "LIT_GOVERNOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Round-trip a probe through the cache backend
    Health,
    /// Print cache and rate limiter statistics
    Stats,
    /// Delete every cache entry carrying a tag
    Invalidate {
        /// Tag to invalidate (e.g. "arxiv")
        tag: String,
    },
    /// Run rate-limit decisions against the configured policies
    Check {
        /// Caller identity (e.g. "user:42", "ip:10.0.0.1")
        identity: String,
        /// Units consumed per check
        #[arg(long, default_value_t = 1)]
        cost: u32,
        /// Number of consecutive checks
        #[arg(long, default_value_t = 1)]
        repeat: u32,
        /// Pause between checks in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: warn for CLI; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = GovernorConfig::load_or_default(args.config.as_deref())?;

    match args.command {
        Command::Health => {
            let cache = connect(&config).await;
            let health = cache.health_check().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
            cache.shutdown().await;
            if health.status != HealthStatus::Healthy {
                std::process::exit(1);
            }
        }
        Command::Stats => {
            let cache = connect(&config).await;
            let limiter = config.build_rate_limiter();
            let report = json!({
                "cache": cache.stats().await,
                "rate_limiter": limiter.stats(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            cache.shutdown().await;
        }
        Command::Invalidate { tag } => {
            let cache = connect(&config).await;
            let deleted = cache.invalidate_by_tag(&tag).await?;
            println!("invalidated {deleted} entries tagged {tag:?}");
            cache.shutdown().await;
        }
        Command::Check {
            identity,
            cost,
            repeat,
            interval_ms,
        } => {
            let limiter = config.build_rate_limiter();
            match limiter.policy_for(&identity) {
                Some((pattern, policy)) => println!("policy: {pattern} = {policy}"),
                None => println!("policy: none (unlimited)"),
            }
            for i in 1..=repeat {
                let result = limiter.check_limit(&identity, cost)?;
                let verdict = if result.allowed { "allowed" } else { "denied" };
                match result.retry_after_secs {
                    Some(retry) => println!(
                        "#{i}: {verdict} remaining={} retry_after={retry}s",
                        result.remaining
                    ),
                    None => println!("#{i}: {verdict} remaining={}", result.remaining),
                }
                if interval_ms > 0 && i < repeat {
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }
            }
        }
    }

    Ok(())
}

/// Build and initialize the configured cache, reporting degraded startup.
async fn connect(config: &GovernorConfig) -> CacheManager {
    let cache = config.build_cache_manager();
    if !cache.initialize().await {
        eprintln!(
            "warning: cache backend {} unavailable ({})",
            cache.backend_name(),
            config.cache.url
        );
    }
    cache
}
