//! Build-time precache manifest tool for swkit workers.
//!
//! ## Usage
//!
//! ```bash
//! # Hash every asset under public/ into a manifest
//! precache-manifest generate --root public --pattern '**/*.{css,js,html}' --output manifest.json
//!
//! # Embed it into the worker config
//! precache-manifest inject --manifest manifest.json --config worker.json
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use swkit_common::{init_logging, LogConfig};
use swkit_sw::PrecacheManifest;

mod manifest;

use manifest::GenerateOptions;

#[derive(Parser)]
#[command(name = "precache-manifest")]
#[command(about = "Generate and inject precache manifests for swkit workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hash matching files into a manifest
    Generate {
        /// Directory served at the prefix
        #[arg(short, long, default_value = "public")]
        root: PathBuf,
        /// Glob pattern relative to the root (repeatable)
        #[arg(short, long, default_value = "**/*.{css,js,json,html}")]
        pattern: Vec<String>,
        /// URL prefix for every entry
        #[arg(long, default_value = "/")]
        prefix: String,
        /// Output path; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Embed a manifest into a worker config file
    Inject {
        /// Manifest JSON
        #[arg(short, long)]
        manifest: PathBuf,
        /// Worker config JSON, rewritten in place
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    init_logging(LogConfig::from_env());
    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            root,
            pattern,
            prefix,
            output,
        } => {
            let manifest = manifest::generate(&GenerateOptions {
                root,
                patterns: pattern,
                prefix,
            })?;
            let json = serde_json::to_string_pretty(&manifest)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Wrote {} entries to {}", manifest.len(), path.display());
                }
                None => println!("{json}"),
            }
        }

        Commands::Inject { manifest, config } => {
            let entries = PrecacheManifest::from_file(&manifest)?;
            let updated = manifest::inject(entries, &config)?;
            println!(
                "Injected {} entries into {}",
                updated.precache_manifest.len(),
                config.display()
            );
        }
    }

    Ok(())
}
