//! Work directory setup command: `freepilot init`.

use anyhow::{Context, Result};

use freepilot::config::{DEFAULT_CONFIG_TEMPLATE, FreepilotConfig};

use super::open_store;

pub fn cmd_init(config: &FreepilotConfig) -> Result<()> {
    std::fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("Failed to create {}", config.work_dir.display()))?;

    let config_file = FreepilotConfig::config_file_in(&config.work_dir);
    if config_file.exists() {
        println!("Config already exists at {}", config_file.display());
    } else {
        std::fs::write(&config_file, DEFAULT_CONFIG_TEMPLATE)
            .with_context(|| format!("Failed to write {}", config_file.display()))?;
        println!("Wrote {}", config_file.display());
    }

    open_store(config)?;
    println!("Job database initialized at {}", config.database_path.display());

    if config.github_token.is_none() {
        println!("Set GITHUB_TOKEN (or github.token) before running jobs.");
    }
    Ok(())
}
