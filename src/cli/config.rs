// ABOUTME: CLI config command - show the effective configuration or write defaults

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use super::{print_json, ConfigCommand, OutputFormat};
use clustercast::config::AppConfig;

/// Execute a config subcommand
pub fn execute(command: ConfigCommand, config: &AppConfig, format: OutputFormat) -> Result<()> {
    match command {
        ConfigCommand::Show => match format {
            OutputFormat::Json => print_json(config),
            OutputFormat::Text => {
                print!("{}", toml::to_string_pretty(config).context("Failed to render config")?);
                Ok(())
            }
        },
        ConfigCommand::Paths => {
            let paths: Vec<(PathBuf, bool)> = AppConfig::get_config_paths()
                .into_iter()
                .map(|p| {
                    let exists = p.exists();
                    (p, exists)
                })
                .collect();
            match format {
                OutputFormat::Json => print_json(&paths),
                OutputFormat::Text => {
                    for (path, exists) in paths {
                        let mark = if exists { "\u{2713}" } else { " " };
                        println!("{mark} {}", path.display());
                    }
                    Ok(())
                }
            }
        }
        ConfigCommand::Init { path, force } => {
            let path = match path {
                Some(path) => path,
                None => AppConfig::get_user_config_dir()?.join("config.toml"),
            };
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            AppConfig::default().save_to(&path)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
    }
}
