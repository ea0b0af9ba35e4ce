#![cfg(feature = "cli")]
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use base64::Engine;
use clap::{ArgAction, Parser, Subcommand};

use rseme::clearkey::{ClearKey, CLEARKEY_UUID};
use rseme::config::ProtectionConfig;
use rseme::key::KeyPair;
use rseme::key_system::KeySystem;
use rseme::pssh::{build_pssh_box, ClearKeyHeader};
use tracing::{error, info, Level};

#[derive(Parser)]
#[command(name = "rseme", version, disable_version_flag = true, about = "rseme CLI")]
struct Cli {
    #[arg(short = 'v', long = "version", action = ArgAction::SetTrue)]
    version: bool,

    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Parse a base64 ClearKey header (bare or pssh boxed) and print it.
    Inspect { header: String },
    /// Resolve the keys of a ClearKey header.
    ///
    /// Inline headers are decoded directly. Remote headers are fetched over
    /// HTTP with the timeout and user agent from the config file.
    License {
        header: String,
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        #[arg(short = 's', long = "session-id", default_value = "cli")]
        session_id: String,
    },
    /// Build a base64 ClearKey header from a URL or hex kid:key pairs.
    BuildHeader {
        #[arg(short = 'u', long = "url", conflicts_with = "keys")]
        url: Option<String>,
        #[arg(short = 'k', long = "key")]
        keys: Vec<String>,
        /// Wrap the header in a pssh box.
        #[arg(short = 'p', long = "pssh", action = ArgAction::SetTrue)]
        pssh: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .init();

    info!("rseme version {}", env!("CARGO_PKG_VERSION"));

    if cli.version {
        return Ok(());
    }

    match cli.command {
        Some(Commands::Inspect { header }) => run_inspect(&header),
        Some(Commands::License {
            header,
            config,
            session_id,
        }) => run_license(&header, config.as_deref(), &session_id).await,
        Some(Commands::BuildHeader { url, keys, pssh }) => run_build_header(url, &keys, pssh),
        None => Ok(()),
    }
}

fn run_inspect(header_b64: &str) -> anyhow::Result<()> {
    let header = ClearKeyHeader::from_base64(header_b64).context("Failed to parse header")?;
    match header {
        ClearKeyHeader::Remote { url } => {
            info!("[+] Remote header");
            println!("{}", url);
        }
        ClearKeyHeader::Inline { key_pairs } => {
            info!("[+] Inline header with {} keys", key_pairs.len());
            print_keys(&key_pairs);
        }
    }
    Ok(())
}

async fn run_license(
    header_b64: &str,
    config_path: Option<&Path>,
    session_id: &str,
) -> anyhow::Result<()> {
    let config = match config_path {
        Some(path) => ProtectionConfig::from_path(path).context("Failed to load config")?,
        None => ProtectionConfig::default(),
    };
    let clearkey = ClearKey::from_config(&config).context("Failed to set up ClearKey")?;
    info!("[+] Loaded ClearKey ({} configured keys)", config.keys.len());

    let message = base64::engine::general_purpose::STANDARD
        .decode(header_b64.trim())
        .context("Header is not valid base64")?;

    let done = clearkey
        .do_license_request(&message, None, session_id, true)
        .await;
    let key_set = match done.result {
        Ok(key_set) => key_set,
        Err(e) => {
            error!("[-] License request failed: {}", e);
            return Ok(());
        }
    };
    info!("[+] Got {} keys for {}", key_set.len(), done.correlation);

    print_keys(&key_set.key_pairs);
    println!("{}", key_set.to_jwk_string());
    Ok(())
}

fn run_build_header(url: Option<String>, keys: &[String], pssh: bool) -> anyhow::Result<()> {
    let header = match url {
        Some(url) => ClearKeyHeader::Remote { url },
        None => {
            if keys.is_empty() {
                bail!("Either --url or at least one --key is required");
            }
            let key_pairs = keys
                .iter()
                .map(|entry| parse_key_pair(entry))
                .collect::<anyhow::Result<Vec<_>>>()?;
            ClearKeyHeader::Inline { key_pairs }
        }
    };

    let mut data = header.to_bytes()?;
    if pssh {
        data = build_pssh_box(CLEARKEY_UUID, &data);
    }
    println!("{}", base64::engine::general_purpose::STANDARD.encode(data));
    Ok(())
}

fn parse_key_pair(entry: &str) -> anyhow::Result<KeyPair> {
    let (kid, key) = entry
        .split_once(':')
        .with_context(|| format!("Expected KID:KEY, got {}", entry))?;
    let kid = hex::decode(kid.trim()).context("KID is not hex")?;
    let key = hex::decode(key.trim()).context("KEY is not hex")?;
    Ok(KeyPair::from_slices(&kid, &key)?)
}

fn print_keys(key_pairs: &[KeyPair]) {
    for pair in key_pairs {
        println!("{}:{}", pair.kid_hex(), hex::encode(pair.key));
    }
}
