//! vellum-cli - Command-line interface for vellum
//!
//! One-shot commands against a vellum server, printed as relaxed JSON.

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value as Json;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vellum_bson::{doc, Document};
use vellum_client::{Client, ConnectionConfig, TlsConfig};
use vellum_wire::Compressor;

#[derive(Parser)]
#[command(name = "vellum-cli")]
#[command(about = "Command-line interface for the vellum document store")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7501", env = "VELLUM_ADDR")]
    addr: SocketAddr,

    /// Application name reported to the server
    #[arg(long, default_value = "vellum-cli")]
    app_name: String,

    /// Compressors to offer, in preference order (zstd, snappy, zlib, noop)
    #[arg(long, value_delimiter = ',', value_parser = parse_compressor)]
    compressor: Option<Vec<Compressor>>,

    /// Append a CRC32C checksum to every command message
    #[arg(long)]
    checksum: bool,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long, env = "VELLUM_TLS")]
    tls: bool,

    /// Path to CA certificate for server verification
    #[arg(long, env = "VELLUM_CA_CERT")]
    tls_ca: Option<PathBuf>,

    /// Path to client certificate (for mTLS)
    #[arg(long, env = "VELLUM_CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    /// Path to client private key (for mTLS)
    #[arg(long, env = "VELLUM_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Server name for TLS SNI (defaults to the server host)
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ping the server
    Ping,

    /// Run hello and print the server's reply
    Hello,

    /// Run a command document against a database
    Command {
        /// Database to run against
        #[arg(short, long, default_value = "admin")]
        db: String,

        /// Command document as JSON (or @file.json to read from file)
        json: String,

        /// Treat the reply as a cursor and stream every document
        #[arg(long)]
        cursor: bool,

        /// Batch size for cursor fetches
        #[arg(long)]
        batch_size: Option<i32>,
    },
}

fn parse_compressor(name: &str) -> Result<Compressor, String> {
    Compressor::from_name(name)
        .ok_or_else(|| format!("unknown compressor {name:?} (zstd, snappy, zlib, noop)"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // Build TLS config if any TLS option is set
    let tls_config =
        if cli.tls || cli.tls_ca.is_some() || cli.client_cert.is_some() || cli.insecure {
            let mut tls = TlsConfig::new();
            tls.enabled = true;

            if let Some(ref path) = cli.tls_ca {
                tls.ca_cert_path = Some(path.clone());
            }
            if let (Some(cert), Some(key)) = (&cli.client_cert, &cli.client_key) {
                tls.client_cert_path = Some(cert.clone());
                tls.client_key_path = Some(key.clone());
            } else if cli.client_cert.is_some() || cli.client_key.is_some() {
                eprintln!(
                    "{}: --client-cert and --client-key must be used together",
                    "Error".red()
                );
                std::process::exit(1);
            }
            tls.insecure = cli.insecure;
            tls.server_name = cli.server_name.clone();

            Some(tls)
        } else {
            None
        };

    let mut config = ConnectionConfig::new(cli.addr).with_app_name(&cli.app_name);
    if let Some(ref compressors) = cli.compressor {
        config = config.with_compressors(compressors.clone());
    }
    if cli.checksum {
        config = config.with_checksums();
    }
    if let Some(tls) = tls_config {
        config = config.with_tls(tls);
    }

    let client = Client::connect(config).await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    if let Err(e) = run(&client, cli.command).await {
        eprintln!("{}: {}", "Error".red(), e);
        let _ = client.close().await;
        std::process::exit(1);
    }

    client.close().await?;
    Ok(())
}

async fn run(client: &Client, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Ping => {
            client.ping().await?;
            println!("{}", "PONG".green());
        }
        Commands::Hello => {
            let reply = client.command("admin", doc! { "hello" => 1 }).await?;
            println!("{}", format_json(&reply.to_relaxed_json()));
        }
        Commands::Command {
            db,
            json,
            cursor,
            batch_size,
        } => {
            let parsed = parse_json_arg(&json)?;
            let command = Document::from_relaxed_json(&parsed)
                .ok_or("the command must be a JSON object")?;

            if cursor {
                let mut cursor = client.command_cursor(&db, command, batch_size).await?;
                while let Some(doc) = cursor.next().await? {
                    println!("{}", serde_json::to_string(&doc.to_relaxed_json())?);
                }
                cursor.close().await;
            } else {
                let reply = client.command(&db, command).await?;
                println!("{}", format_json(&reply.to_relaxed_json()));
            }
        }
    }
    Ok(())
}

/// Parses a JSON argument (either inline JSON or @file.json).
fn parse_json_arg(arg: &str) -> Result<Json, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

/// Formats JSON for display.
fn format_json(value: &Json) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
