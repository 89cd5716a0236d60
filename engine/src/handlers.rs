//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - resolve: Resolve one plugin to an executable path
//! - list: List registry entries and their cache state
//! - cache list / cache purge: Inspect and clear the binary cache
//! - check-updates: Compare pinned versions with GitHub releases

use anyhow::{Context, Result};
use sdk::entry::EntrySource;
use sdk::errors::{ResolveError, ResolveErrorExt};
use serde_json::json;
use std::time::Duration;
use tracing::warn;

use crate::cache::{CacheKey, CacheRecord};
use crate::session::Session;
use crate::update::{check_latest, UpdateStatus};

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Resolve one plugin and print its executable path
///
/// After printing, waits (bounded by the download timeout) for any
/// background refresh the resolution started.
pub async fn handle_resolve(
    session: &Session,
    name: &str,
    timeout: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    let registry = session.load_registry().await?;
    let entry = registry
        .get(name)
        .with_context(|| format!("Plugin '{}' is not in the registry", name))?;

    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| session.config().download_timeout());

    let result = session
        .resolver()
        .resolve_with_timeout(&entry, timeout)
        .await;

    match result {
        Ok(path) => {
            match format {
                OutputFormat::Text => println!("{}", path.display()),
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "plugin": entry.name,
                        "version": entry.version,
                        "path": path,
                    }))?
                ),
            }
            session.settle(session.config().download_timeout()).await;
            Ok(())
        }
        Err(e) => {
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&error_json(&e))?);
            }
            let hint = e.user_hint().to_string();
            Err(anyhow::Error::new(e).context(hint))
        }
    }
}

fn error_json(error: &ResolveError) -> serde_json::Value {
    let mut value = json!({
        "error": error.to_string(),
        "plugin": error.plugin(),
        "stage": error.stage(),
        "hint": error.user_hint(),
        "retryable": error.is_retryable(),
    });
    if let ResolveError::ChecksumMismatch {
        expected, actual, ..
    } = error
    {
        value["expected"] = json!(expected);
        value["actual"] = json!(actual);
    }
    value
}

/// List every registry entry with its cache state
pub async fn handle_list(session: &Session, format: OutputFormat) -> Result<()> {
    let registry = session.load_registry().await?;
    let target = session.resolver().target();

    let rows: Vec<serde_json::Value> = registry
        .entries()
        .map(|entry| {
            let (kind, location, cached) = match &entry.source {
                EntrySource::Local { path } => ("local", path.clone(), None),
                EntrySource::Remote(remote) => {
                    let key = CacheKey::new(&entry.name, &entry.version, target);
                    let cached = session
                        .cache()
                        .lookup(&key)
                        .filter(|r| r.matches(&remote.checksum))
                        .map(|r| r.local_path);
                    ("remote", remote.download_url.clone(), cached)
                }
            };
            json!({
                "name": entry.name,
                "version": entry.version,
                "description": entry.description,
                "kind": kind,
                "source": location,
                "cached_path": cached,
            })
        })
        .collect();

    match format {
        OutputFormat::Text => {
            if rows.is_empty() {
                println!("Registry is empty.");
                return Ok(());
            }
            println!("Plugins ({}):", rows.len());
            println!();
            for row in &rows {
                println!(
                    "  {} {} [{}]",
                    row["name"].as_str().unwrap_or_default(),
                    row["version"].as_str().unwrap_or_default(),
                    row["kind"].as_str().unwrap_or_default()
                );
                let description = row["description"].as_str().unwrap_or_default();
                if !description.is_empty() {
                    println!("    {}", description);
                }
                if let Some(path) = row["cached_path"].as_str() {
                    println!("    cached: {}", path);
                }
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "registry_version": registry.version(),
                    "target": target,
                    "plugins": rows,
                }))?
            );
        }
    }

    Ok(())
}

/// List verified cache records
pub fn handle_cache_list(session: &Session, format: OutputFormat) -> Result<()> {
    let records = session.cache().records();

    match format {
        OutputFormat::Text => {
            if records.is_empty() {
                println!("Cache is empty.");
            } else {
                print_records(&records);
                println!();
                println!("{} cached binary(s).", records.len());
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "records": records }))?
            );
        }
    }

    Ok(())
}

/// Remove cached binaries for one plugin or all of them
pub fn handle_cache_purge(
    session: &Session,
    name: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    let removed = session.cache().purge(name)?;

    match format {
        OutputFormat::Text => {
            if removed.is_empty() {
                println!("Nothing to purge.");
            } else {
                print_records(&removed);
                println!();
                println!("Purged {} cached binary(s).", removed.len());
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "removed": removed }))?
            );
        }
    }

    Ok(())
}

fn print_records(records: &[CacheRecord]) {
    for record in records {
        println!(
            "  {} {} ({}-{})  fetched {}",
            record.key.name,
            record.key.version,
            record.key.os,
            record.key.arch,
            record.fetched_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        println!("    {}", record.local_path.display());
    }
}

/// Check remote plugins that declare a GitHub repository for newer releases
pub async fn handle_check_updates(
    session: &Session,
    name: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    let registry = session.load_registry().await?;

    if let Some(name) = name {
        if registry.get(name).is_none() {
            anyhow::bail!("Plugin '{}' is not in the registry", name);
        }
    }

    let mut results: Vec<(String, std::result::Result<UpdateStatus, String>)> = Vec::new();
    for entry in registry.entries() {
        if name.is_some_and(|n| n != entry.name) {
            continue;
        }
        let Some(repo) = entry.remote().and_then(|r| r.github_repo.as_deref()) else {
            continue;
        };

        let status = check_latest(session.http_client(), repo, &entry.version)
            .await
            .map_err(|e| {
                warn!(plugin = %entry.name, repo, "Update check failed: {:#}", e);
                format!("{:#}", e)
            });
        results.push((entry.name.clone(), status));
    }

    match format {
        OutputFormat::Text => {
            if results.is_empty() {
                println!("No plugins declare a GitHub repository.");
            }
            for (plugin, status) in &results {
                match status {
                    Ok(s) if s.update_available => {
                        println!("  {}: update available {} -> {}", plugin, s.current, s.latest);
                        println!("    {}", s.release_url);
                    }
                    Ok(s) => println!("  {}: up to date ({})", plugin, s.current),
                    Err(e) => println!("  {}: check failed: {}", plugin, e),
                }
            }
        }
        OutputFormat::Json => {
            let rows: Vec<serde_json::Value> = results
                .iter()
                .map(|(plugin, status)| match status {
                    Ok(s) => json!({ "plugin": plugin, "status": s }),
                    Err(e) => json!({ "plugin": plugin, "error": e }),
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "plugins": rows }))?
            );
        }
    }

    Ok(())
}
