//! Pulse CLI
//!
//! Command-line front end for the Pulse client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pulse_client::config::{default_config_path, IdentityConfig, PeerEntry};
use pulse_client::{Config, ConnectionEvent, PulseClient, RequestOutcome};
use pulse_protocol::{Command, LocalIdentity, PeerId, PeerKeys};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Pulse - encrypted request/response messaging over a relay.
#[derive(Parser, Debug)]
#[command(name = "pulse")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Generate a new identity and store it in the configuration file
    Keygen {
        /// Numeric id assigned by the relay
        id: u32,

        /// Replace an existing identity
        #[arg(long, short)]
        force: bool,
    },

    /// Print the local identity's public keys
    Whoami,

    /// Add or replace a known peer
    AddPeer {
        /// Numeric id of the peer (0 is the relay server)
        id: u32,

        /// Exchange public key (hex or base64url)
        x: String,

        /// Signing public key (hex or base64url)
        ed: String,
    },

    /// Send a query to a peer and print the answer
    Request {
        /// Recipient peer id
        to: u32,

        /// Request body
        body: String,

        /// Command byte (0 = query)
        #[arg(long, default_value = "0")]
        command: u8,

        /// Timeout in milliseconds (defaults to the configured value)
        #[arg(long, short)]
        timeout: Option<u64>,
    },

    /// Send a JSON request to the relay server and print the answer
    Server {
        /// JSON request body
        json: String,
    },

    /// Stay connected and log inbound traffic until interrupted
    Listen {
        /// Answer every query with this body
        #[arg(long)]
        reply: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    // Load configuration
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Initialize tracing; the guard flushes the log file on exit
    let _guard = init_tracing(&config, cli.verbose)?;
    tracing::debug!("Using config file: {:?}", config_path);

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Keygen { id, force } => keygen(config, &config_path, id, force),
        Commands::Whoami => whoami(&config),
        Commands::AddPeer { id, x, ed } => add_peer(config, &config_path, id, &x, &ed),
        Commands::Request {
            to,
            body,
            command,
            timeout,
        } => {
            let client = connect(&config).await?;
            let outcome = client
                .request(
                    Command::from(command),
                    body.as_bytes(),
                    PeerId(to),
                    None,
                    timeout.map(Duration::from_millis),
                )
                .await?;
            client.close();
            print_outcome(outcome)
        }
        Commands::Server { json } => {
            let value: serde_json::Value =
                serde_json::from_str(&json).context("Request body is not valid JSON")?;
            let client = connect(&config).await?;
            let outcome = client.server_request(&value).await?;
            client.close();
            print_outcome(outcome)
        }
        Commands::Listen { reply } => listen(&config, reply).await,
    }
}

/// Set up stderr logging and, when configured, a log file.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.client.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match &config.client.log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(directory).with_context(|| {
                format!("Failed to create log directory: {}", directory.display())
            })?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

fn keygen(mut config: Config, path: &Path, id: u32, force: bool) -> anyhow::Result<()> {
    if config.identity.is_configured() && !force {
        anyhow::bail!(
            "An identity already exists in {}; use --force to replace it",
            path.display()
        );
    }

    let identity = LocalIdentity::generate();
    config.identity = IdentityConfig::from_identity(id, &identity);
    config.save(path)?;

    tracing::info!("Generated identity {} in {:?}", id, path);
    print_public_keys(id, &identity.public_keys());
    Ok(())
}

fn whoami(config: &Config) -> anyhow::Result<()> {
    let identity = config.identity.to_identity()?;
    print_public_keys(config.identity.id, &identity.public_keys());
    Ok(())
}

fn add_peer(mut config: Config, path: &Path, id: u32, x: &str, ed: &str) -> anyhow::Result<()> {
    let keys = PeerKeys::parse(x, ed).with_context(|| format!("Invalid keys for peer {}", id))?;
    config.upsert_peer(PeerEntry::new(id, &keys));
    config.save(path)?;
    println!("Peer {} saved (fingerprint {})", id, keys.fingerprint());
    Ok(())
}

fn print_public_keys(id: u32, keys: &PeerKeys) {
    println!("id = {}", id);
    println!("x  = {}", hex::encode(keys.exchange_bytes()));
    println!("ed = {}", hex::encode(keys.signing_bytes()));
    println!("fingerprint: {}", keys.fingerprint());
}

/// Build a client from configuration and wait for the connection to open.
async fn connect(config: &Config) -> anyhow::Result<PulseClient> {
    let client = PulseClient::from_config(config)?;
    client
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", config.connection.server_url))?;
    Ok(client)
}

fn print_outcome(outcome: RequestOutcome) -> anyhow::Result<()> {
    match outcome {
        RequestOutcome::Reply(reply) => {
            if let Some(error) = reply.error_message() {
                anyhow::bail!("Server returned an error: {}", error);
            }
            println!("{}", reply);
            Ok(())
        }
        RequestOutcome::TimedOut => anyhow::bail!("Request timed out"),
        RequestOutcome::NotConnected => anyhow::bail!("Not connected"),
    }
}

async fn listen(config: &Config, reply: Option<String>) -> anyhow::Result<()> {
    let client = PulseClient::from_config(config)?;

    client.set_on_message(move |from, command, body| {
        let reply = reply.clone();
        async move {
            tracing::info!(
                "{} from {}: {}",
                command,
                from,
                String::from_utf8_lossy(&body)
            );
            reply.map(String::into_bytes)
        }
    });
    client.set_on_message_login(|text| {
        tracing::info!("Login message: {}", text);
    });

    let mut events = client.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConnectionEvent::Connected => tracing::info!("Connected"),
                ConnectionEvent::Disconnected => tracing::info!("Disconnected"),
            }
        }
    });

    // A failed first attempt keeps retrying in the background.
    if let Err(e) = client.connect().await {
        tracing::warn!("Initial connection failed: {}", e);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    client.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pulse_protocol::Reply;
    use serde_json::json;

    #[test]
    fn test_cli_debug_assert() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_request_command() {
        let cli = Cli::try_parse_from(["pulse", "request", "3", "ping-app", "-t", "1000"]).unwrap();
        match cli.command {
            Commands::Request {
                to,
                body,
                command,
                timeout,
            } => {
                assert_eq!(to, 3);
                assert_eq!(body, "ping-app");
                assert_eq!(command, 0);
                assert_eq!(timeout, Some(1000));
            }
            _ => panic!("Expected Request command"),
        }
    }

    #[test]
    fn test_add_peer_command() {
        let cli = Cli::try_parse_from(["pulse", "add-peer", "0", "aa", "bb"]).unwrap();
        assert!(matches!(cli.command, Commands::AddPeer { id: 0, .. }));
    }

    #[test]
    fn test_print_outcome_reply() {
        let outcome = RequestOutcome::Reply(Reply::Text("pong-app".to_string()));
        assert!(print_outcome(outcome).is_ok());
    }

    #[test]
    fn test_print_outcome_server_error_is_returned() {
        let outcome = RequestOutcome::Reply(Reply::Json(json!({"error": "unknown device"})));
        let err = print_outcome(outcome).unwrap_err();
        assert!(err.to_string().contains("unknown device"));
    }

    #[test]
    fn test_print_outcome_timeout_is_returned() {
        assert!(print_outcome(RequestOutcome::TimedOut).is_err());
        assert!(print_outcome(RequestOutcome::NotConnected).is_err());
    }
}
