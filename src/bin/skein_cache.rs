//! skein-cache: inspect the on-disk snapshot cache.
//!
//! Usage:
//!   skein-cache keys
//!   skein-cache show <identity>
//!   skein-cache clear <identity>
//!
//! Cache path and namespace come from the skein config file.

use std::process;

use anyhow::{Context, Result};
use serde_json::json;
use skein::config::Config;
use skein::storage::disk::DiskBackend;
use skein::storage::PersistentCache;
use skein::Identity;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: skein-cache <keys | show <identity> | clear <identity>>";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run(&args) {
        eprintln!("skein-cache: {:#}", e);
        process::exit(1);
    }
}

fn run(args: &[String]) -> Result<()> {
    let command = match args {
        [cmd] if cmd == "keys" => Command::Keys,
        [cmd, identity] if cmd == "show" => Command::Show(Identity::new(identity.as_str())),
        [cmd, identity] if cmd == "clear" => Command::Clear(Identity::new(identity.as_str())),
        _ => {
            eprintln!("{}", USAGE);
            process::exit(2);
        }
    };

    let config = Config::load()?;
    let path = config.cache.resolved_path()?;
    let backend = DiskBackend::create(&path)?;
    tracing::debug!("Opened cache at {}", path.display());
    let cache = PersistentCache::new(Box::new(backend), config.cache.namespace.clone());

    match command {
        Command::Keys => cmd_keys(&cache),
        Command::Show(identity) => cmd_show(&cache, &identity),
        Command::Clear(identity) => cmd_clear(&cache, &identity),
    }
}

enum Command {
    Keys,
    Show(Identity),
    Clear(Identity),
}

fn cmd_keys(cache: &PersistentCache) -> Result<()> {
    for identity in cache.identities()? {
        println!("{}", identity);
    }
    Ok(())
}

fn cmd_show(cache: &PersistentCache, identity: &Identity) -> Result<()> {
    let snapshot = cache
        .load(Some(identity))
        .with_context(|| format!("no readable snapshot for {}", identity))?;

    let projects: Vec<_> = snapshot
        .projects
        .iter()
        .map(|p| {
            json!({
                "id": p.id,
                "name": p.name,
                "last_modified": p.last_modified,
                "charts": p.charts.len(),
                "rounds": p.charts.iter().map(|c| c.rounds.len()).sum::<usize>(),
            })
        })
        .collect();
    let summary = json!({
        "identity": identity.as_str(),
        "version": snapshot.version,
        "current_project_id": snapshot.current_project_id,
        "last_sync_time": snapshot.last_sync_time,
        "projects": projects,
    });

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn cmd_clear(cache: &PersistentCache, identity: &Identity) -> Result<()> {
    cache.clear(Some(identity))?;
    println!("Cleared snapshot for {}", identity);
    Ok(())
}
