//! 🚀 cdx-cli: the front door, the bouncer, the maitre d' of cinedex.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 Loads `.env`, sets up logging, loads config, then hands the keys to
//! `cdx::run` and waits for Ctrl-C like everybody else. 🦆

use std::path::Path;

use anyhow::{Context, Result};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// 🚀 main(): where it all begins.
///
/// 🔧 Steps:
/// 1. Read `.env` if there is one (local dev credentials live there)
/// 2. Init tracing, `RUST_LOG` wins, `info` otherwise
/// 3. Optional first argument: a TOML config path. No argument means env vars only.
/// 4. Run until a shutdown signal
/// 5. On failure, walk the error chain and hint at unreachable services
#[tokio::main]
async fn main() -> Result<()> {
    // 🌱 a missing .env is normal outside local dev
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path_arg = std::env::args().nth(1);
    let config_file = match path_arg.as_deref() {
        Some(path) => {
            let path = Path::new(path);
            let exists = path.try_exists().with_context(|| {
                format!(
                    "💀 Couldn't check whether the configuration file exists. Maybe it's a pwd/cwd thing with relative paths; an absolute path removes all doubt. Was checking here: '{}'",
                    path.display()
                )
            })?;
            if !exists {
                anyhow::bail!(
                    "💀 Configuration file '{}' does not exist. Pass a real path, or no argument at all to configure purely through CDX_* env vars.",
                    path.display()
                );
            }
            Some(path)
        }
        None => None,
    };

    let app_config = cdx::app_config::load_config(config_file)
        .context("💀 In cdx-cli, main, we couldn't load the configuration. Check the file and the CDX_* env vars for typos.")?;

    // 🚀 SEND IT.
    let result = cdx::run(app_config).await;

    if let Err(err) = result {
        error!("💀 error: {}", err);
        // -- 🧅 peel the onion, one layer at a time
        let mut looks_like_connection_trouble = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
            let cause_str = cause.to_string();
            if cause_str.contains("error sending request")
                || cause_str.contains("connection refused")
                || cause_str.contains("Connection refused")
                || cause_str.contains("tcp connect error")
                || cause_str.contains("dns error")
            {
                looks_like_connection_trouble = true;
            }
        }

        if looks_like_connection_trouble {
            error!(
                "🔧 hint: looks like a service isn't reachable. \
                Double-check that Postgres, Redis and Elasticsearch are actually running. \
                If you're using Docker, try `docker ps` to see what's up, or \
                `docker compose up -d` to resurrect them. ☕"
            );
        }

        std::process::exit(1);
    }

    Ok(())
}
