use std::env;

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;

use studydesk::{cache, config::AppConfig, db};

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("purge-jobs") => {
            let days: i64 = args
                .next()
                .unwrap_or_else(|| "30".to_string())
                .parse()
                .context("retention must be a number of days")?;
            purge_jobs(days)?;
        }
        Some("expire-zombies") => expire_zombies()?,
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\nUsage: maintenance purge-jobs [days] | expire-zombies");
            std::process::exit(1);
        }
        None => {
            eprintln!("Usage: maintenance purge-jobs [days] | expire-zombies");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn purge_jobs(retention_days: i64) -> Result<()> {
    let config = AppConfig::from_env()?;
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let mut conn = pool.get().context("failed to get database connection")?;

    let deleted = cache::purge_terminal_jobs(&mut conn, ChronoDuration::days(retention_days))?;
    println!("Deleted {deleted} terminal generation jobs older than {retention_days} days.");
    Ok(())
}

fn expire_zombies() -> Result<()> {
    let config = AppConfig::from_env()?;
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let mut conn = pool.get().context("failed to get database connection")?;

    let expired = cache::expired_jobs(&mut conn, i64::MAX)?;
    if expired.is_empty() {
        println!("No expired generation jobs found.");
        return Ok(());
    }

    println!("Failing {} expired generation jobs…", expired.len());
    for job in expired {
        cache::fail_generation(&mut conn, job.id, "generation timed out", true)?;
    }
    println!("Done.");
    Ok(())
}
