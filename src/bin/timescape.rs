//! Timescape operator CLI
//!
//! Inspects and edits a persisted version registry: list timelines, manage
//! tags and live bindings, run lifecycle sweeps, and diff schema snapshots.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use timescape::{
    render_text_diff, LoggingRunner, SchemaSnapshot, SystemClock, Timescape, TimescapeConfig,
    TracingSink, Tsv,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "timescape")]
#[command(about = "Manage timestamp-versioned API handlers")]
struct Cli {
    /// Config file (defaults to timescape.toml and friends)
    #[arg(short, long)]
    config: Option<String>,

    /// Registry snapshot file, overriding the config
    #[arg(short, long)]
    snapshot: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List versions of one handler or of every handler
    List {
        handler: Option<String>,
    },

    /// Show one version as JSON
    Status {
        tsv: String,
    },

    /// Point a tag at a version
    Tag {
        tsv: String,
        label: String,
        /// Who created the tag
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Remove a tag
    Untag {
        label: String,
    },

    /// Bind a handler's live code to a version
    Bind {
        handler: String,
        tsv: String,
    },

    /// Deactivate a version now
    Deactivate {
        tsv: String,
        /// Deactivate even when the version carries a protected tag
        #[arg(long)]
        force: bool,
    },

    /// Reactivate a deactivated version
    Reactivate {
        tsv: String,
    },

    /// Run one lifecycle sweep
    Sweep {
        /// Report without deactivating anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Compare two schema snapshots
    Diff {
        old: PathBuf,
        new: PathBuf,
        /// Also print a line diff
        #[arg(long)]
        text: bool,
    },

    /// Print the effective configuration
    Config {
        /// Write it to this file instead
        #[arg(short, long)]
        write: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = TimescapeConfig::load_from(cli.config.as_deref()).context("loading config")?;
    if let Some(path) = cli.snapshot {
        config.registry.snapshot_path = Some(path);
    }

    match &cli.command {
        Commands::Diff { old, new, text } => return diff(old, new, *text),
        Commands::Config { write } => {
            match write {
                Some(path) => {
                    config.save(path)?;
                    println!("✅ Wrote config to {}", path);
                }
                None => print!("{}", toml::to_string_pretty(&config)?),
            }
            return Ok(());
        }
        _ => {}
    }

    if config.registry.snapshot_path.is_none() {
        bail!("no registry snapshot configured; pass --snapshot or set registry.snapshot_path");
    }
    if let Commands::Sweep { dry_run: true } = cli.command {
        config.lifecycle.dry_run = true;
    }

    let ts = Timescape::init(
        config,
        Arc::new(SystemClock),
        Arc::new(TracingSink),
        Arc::new(LoggingRunner),
    )
    .await?;
    ts.db().rebuild_from_registry().await;
    let registry = ts.registry();

    match cli.command {
        Commands::List { handler } => {
            let handlers = match handler {
                Some(h) => vec![h],
                None => registry.handlers(),
            };
            for h in handlers {
                let live = registry.live_version(&h).ok();
                println!("📦 {}", h);
                for info in registry.list(&h) {
                    let marker = if live.as_ref() == Some(&info.tsv) { "▶" } else { " " };
                    let tags: Vec<&str> = info.tags.iter().map(String::as_str).collect();
                    println!(
                        "  {} {}  {:<11} {:>8} req  {}",
                        marker,
                        info.tsv,
                        info.status.as_str(),
                        info.request_count,
                        tags.join(", ")
                    );
                }
            }
            return Ok(());
        }

        Commands::Status { tsv } => {
            let info = registry.info(&parse_tsv(&tsv)?)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            return Ok(());
        }

        Commands::Tag { tsv, label, by } => {
            let tsv = parse_tsv(&tsv)?;
            registry.tag_version(&tsv, &label, &by)?;
            println!("🏷️  {} -> {}", label, tsv);
        }

        Commands::Untag { label } => {
            if !registry.untag_version(&label) {
                bail!("no tag named '{}'", label);
            }
            println!("🗑️  Removed tag {}", label);
        }

        Commands::Bind { handler, tsv } => {
            let tsv = parse_tsv(&tsv)?;
            registry.bind_live(&handler, &tsv)?;
            println!("▶ {} now runs as {}", handler, tsv);
        }

        Commands::Deactivate { tsv, force } => {
            let tsv = parse_tsv(&tsv)?;
            ts.lifecycle().deactivate(&tsv, force).await?;
            println!("💤 Deactivated {}", tsv);
        }

        Commands::Reactivate { tsv } => {
            let tsv = parse_tsv(&tsv)?;
            ts.lifecycle().reactivate(&tsv).await?;
            println!("✅ Reactivated {}", tsv);
        }

        Commands::Sweep { .. } => {
            let report = ts.lifecycle().sweep().await;
            println!("🔍 Evaluated {} versions", report.evaluated);
            for t in &report.transitions {
                println!("  {} {} -> {}", t.tsv, t.from, t.to);
            }
            for tsv in &report.eligible {
                if report.dry_run {
                    println!("  💤 would deactivate {}", tsv);
                } else if report.deactivated.contains(tsv) {
                    println!("  💤 deactivated {}", tsv);
                }
            }
            for (tsv, reason) in &report.failed {
                println!("  ❌ {}: {}", tsv, reason);
            }
            if report.dry_run {
                return Ok(());
            }
        }

        // Handled before the registry is opened.
        Commands::Diff { .. } | Commands::Config { .. } => return Ok(()),
    }

    ts.teardown().await?;
    Ok(())
}

fn parse_tsv(raw: &str) -> Result<Tsv> {
    Ok(Tsv::parse(raw)?)
}

fn diff(old: &Path, new: &Path, text: bool) -> Result<()> {
    let old = SchemaSnapshot::from_file(old).with_context(|| format!("reading {}", old.display()))?;
    let new = SchemaSnapshot::from_file(new).with_context(|| format!("reading {}", new.display()))?;
    let report = timescape::diff(&old.content, &new.content);

    println!("🔍 {} -> {}: {}", old.name, new.name, report.summary());
    for change in &report.breaking_changes {
        println!("  ❌ {} at {}", change.description, change.path);
    }
    for change in &report.non_breaking_changes {
        println!("  ✅ {} at {}", change.description, change.path);
    }
    if text {
        println!();
        print!("{}", render_text_diff(&old.content, &new.content));
    }
    if report.requires_transformer {
        println!();
        println!("⚠️  Breaking changes: register a transformer pair for this version");
    }
    Ok(())
}
