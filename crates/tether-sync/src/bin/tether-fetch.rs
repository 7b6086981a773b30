//! # tether-fetch
//!
//! Fetches a URL through the work queue and stores what it maps.
//!
//! ## Usage
//! ```bash
//! # Fetch a collection into the default store
//! cargo run -p tether-sync --bin tether-fetch -- --url https://api.example.com/articles --entity Article --all
//!
//! # Fetch one entity keyed by "id" into a throwaway store
//! cargo run -p tether-sync --bin tether-fetch -- --url https://api.example.com/articles/7 \
//!     --entity Article --pk id --db :memory:
//!
//! # Unwrap {"data": [...]} before mapping
//! cargo run -p tether-sync --bin tether-fetch -- --url ... --entity Article --all --data-key data
//! ```

use std::env;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use tether_core::{EntitySpec, Record, DEFAULT_PRIMARY_KEY};
use tether_sync::{FetchRequest, Ledger, TetherConfig};

/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - Default: INFO, DEBUG for tether crates
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tether=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_help() {
    println!("Tether Fetch");
    println!();
    println!("Usage: tether-fetch --url <URL> --entity <NAME> [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -u, --url <URL>        URL to fetch (relative URLs need a configured base URL)");
    println!("  -e, --entity <NAME>    Entity collection to store into");
    println!("  -k, --pk <FIELD>       Primary key field (default: {})", DEFAULT_PRIMARY_KEY);
    println!("  -a, --all              Response is an array of entities");
    println!("      --data-key <KEY>   Unwrap this top-level key before mapping");
    println!("      --dry-run          Map without storing");
    println!("  -d, --db <PATH>        Database file path (\":memory:\" for none)");
    println!("  -c, --config <PATH>    Config file path");
    println!("  -h, --help             Show this help message");
}

/// One-line result of a single-entity fetch.
fn single_summary(entity: &str, record: &Record, dry_run: bool) -> String {
    let key = record
        .primary_key()
        .map(ToString::to_string)
        .unwrap_or_else(|| "(no key)".to_string());
    let verb = if dry_run { "Mapped" } else { "Stored" };
    format!("{} {} {}", verb, entity, key)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args: Vec<String> = env::args().collect();

    let mut url: Option<String> = None;
    let mut entity: Option<String> = None;
    let mut primary_key = DEFAULT_PRIMARY_KEY.to_string();
    let mut collection = false;
    let mut data_key: Option<String> = None;
    let mut dry_run = false;
    let mut db_path: Option<PathBuf> = None;
    let mut config_path: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1).cloned();
        match args[i].as_str() {
            "--url" | "-u" => {
                url = value;
                i += 1;
            }
            "--entity" | "-e" => {
                entity = value;
                i += 1;
            }
            "--pk" | "-k" => {
                if let Some(value) = value {
                    primary_key = value;
                }
                i += 1;
            }
            "--data-key" => {
                data_key = value;
                i += 1;
            }
            "--db" | "-d" => {
                db_path = value.map(PathBuf::from);
                i += 1;
            }
            "--config" | "-c" => {
                config_path = value.map(PathBuf::from);
                i += 1;
            }
            "--all" | "-a" => collection = true,
            "--dry-run" => dry_run = true,
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => eprintln!("Ignoring unknown argument: {}", other),
        }
        i += 1;
    }

    let (Some(url), Some(entity)) = (url, entity) else {
        print_help();
        return Err("--url and --entity are required".into());
    };

    let mut config = TetherConfig::load(config_path)?;
    if let Some(path) = db_path {
        config.store.path = Some(path);
    }

    let ledger = Ledger::open(&config).await?;
    let model = ledger.model_for(EntitySpec::new(&entity, &primary_key));

    let mut request = FetchRequest::new(&url).persist(!dry_run);
    if let Some(key) = data_key {
        request = request.parse_with(move |tree| tree.get(&key).cloned().unwrap_or(tree));
    }

    println!("Fetching {} into {}", url, entity);

    if collection {
        let report = model.get_all(request).await?;
        println!(
            "{} of {} elements mapped{}",
            report.records.len(),
            report.total,
            if dry_run { "" } else { " and stored" }
        );
        for failure in &report.failures {
            println!("  skipped: {}", failure);
        }
    } else {
        let record = model.get(request).await?;
        println!("{}", single_summary(&entity, &record, dry_run));
    }

    let stored = model.all().await?;
    println!("{} {} records in store", stored.len(), entity);

    ledger.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_summary_reflects_dry_run() {
        let spec = EntitySpec::new("Article", "objID");
        let record = spec.new_record_with(json!({ "objID": 7 }).as_object().cloned().unwrap());

        assert_eq!(single_summary("Article", &record, false), "Stored Article 7");
        assert_eq!(single_summary("Article", &record, true), "Mapped Article 7");
        assert_eq!(
            single_summary("Article", &spec.new_record(), true),
            "Mapped Article (no key)"
        );
    }
}
