//! Negotiation dry-run tool
//!
//! Builds a client and a server security context from a configuration file,
//! connects them in process, queues some application writes behind the
//! handshake, and reports how the handshake ended and what got through.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use auth::{Keyring, MechanismRegistry, Script, ScriptedFactory, SharedKeyFactory, GSSAPI_MECHANISM};
use bytes::Bytes;
use clap::Parser;
use negotiation::{
    loopback, NegotiationConfig, NegotiationStatus, Outcome, RpcCode, RpcHandler, RpcMessage,
    RpcSession, SecurityContext, SendStatus,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const APP_WRITE: RpcCode = 0x1001;

#[derive(Parser)]
#[command(name = "negotiate")]
#[command(about = "Run an authentication negotiation between two in-process sessions", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(
        short = 'c',
        long,
        env = "DSN_CONF",
        default_value = "/etc/dsn/config.ini"
    )]
    conf: String,

    /// Keyring path, enables HMAC-SHA256
    /// If not specified, will be read from the configuration file
    #[arg(long)]
    keyring: Option<String>,

    /// Entity name the client authenticates as
    #[arg(long, default_value = "client.admin")]
    name: String,

    /// Client mechanism preference (comma-separated), overrides client_mechanisms
    #[arg(short, long, value_delimiter = ',')]
    mechanism: Vec<String>,

    /// Turn authentication off on the server
    #[arg(long)]
    disable_auth: bool,

    /// Require authentication on both sides
    #[arg(long)]
    mandatory: bool,

    /// Server without the negotiation service
    #[arg(long)]
    legacy_server: bool,

    /// Accept peers without negotiation support as unauthenticated
    #[arg(long)]
    legacy_fallback: bool,

    /// Challenge rounds of the scripted GSSAPI stand-in
    #[arg(long, default_value = "1")]
    scripted_rounds: u32,

    /// Principal reported by the scripted GSSAPI stand-in
    #[arg(long, default_value = "user@EXAMPLE.COM")]
    principal: String,

    /// Application writes queued before the handshake finishes
    #[arg(long, default_value = "3")]
    messages: usize,

    /// Seconds to wait for the handshake
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

struct Collector {
    tx: mpsc::UnboundedSender<RpcMessage>,
}

#[async_trait]
impl RpcHandler for Collector {
    async fn handle(&self, _session: &Arc<RpcSession>, msg: RpcMessage) -> negotiation::Result<()> {
        let _ = self.tx.send(msg);
        Ok(())
    }
}

#[derive(Serialize)]
struct SideReport {
    status: NegotiationStatus,
    user_name: Option<String>,
    mechanism: Option<String>,
    error: Option<String>,
}

impl SideReport {
    fn new(session: &RpcSession, outcome: &Outcome) -> Self {
        Self {
            status: session.status(),
            user_name: session.user_name(),
            mechanism: session.selected_mechanism(),
            error: outcome.error().map(|e| e.to_string()),
        }
    }
}

#[derive(Serialize)]
struct Report {
    client: SideReport,
    server: SideReport,
    queued: usize,
    delivered: usize,
    delivered_as: Vec<Option<String>>,
}

impl Report {
    fn print_text(&self) {
        for (role, side) in [("client", &self.client), ("server", &self.server)] {
            println!(
                "{}: {} user={} mechanism={}",
                role,
                side.status,
                side.user_name.as_deref().unwrap_or("-"),
                side.mechanism.as_deref().unwrap_or("-")
            );
            if let Some(error) = &side.error {
                println!("{}: error: {}", role, error);
            }
        }
        println!("writes: queued={} delivered={}", self.queued, self.delivered);
    }
}

fn load_config(cli: &Cli) -> Result<NegotiationConfig> {
    let mut config = if Path::new(&cli.conf).exists() {
        debug!("Loading configuration from: {}", cli.conf);
        NegotiationConfig::from_conf(&cli.conf)
            .with_context(|| format!("Failed to load {}", cli.conf))?
    } else {
        debug!("Configuration file not found: {}, using defaults", cli.conf);
        NegotiationConfig::default()
    };

    if let Some(keyring) = &cli.keyring {
        config.keyring = Some(PathBuf::from(keyring));
    }
    if !cli.mechanism.is_empty() {
        let names: Vec<&str> = cli.mechanism.iter().map(String::as_str).collect();
        config = config.with_client_mechanisms(&names);
    }
    if cli.legacy_fallback {
        config = config.with_legacy_fallback();
    }
    if cli.mandatory {
        config = config.mandatory();
    }
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}

fn build_mechanisms(cli: &Cli, config: &NegotiationConfig) -> Result<MechanismRegistry> {
    let mut mechanisms = MechanismRegistry::new();
    mechanisms.register(Arc::new(ScriptedFactory::new(
        GSSAPI_MECHANISM,
        Script::default()
            .with_rounds(cli.scripted_rounds)
            .with_principal(cli.principal.clone()),
    )));
    if let Some(path) = &config.keyring {
        let keyring = Keyring::from_file(path)
            .with_context(|| format!("Failed to load keyring {}", path.display()))?;
        info!("Loaded keyring {} ({} entities)", path.display(), keyring.len());
        mechanisms.register(Arc::new(SharedKeyFactory::new(Arc::new(keyring), &cli.name)));
    }
    Ok(mechanisms)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    let mechanisms = build_mechanisms(&cli, &config)?;
    debug!("Mechanisms: {:?}", mechanisms.names());

    let mut server_config = config.clone();
    if cli.disable_auth {
        server_config.enable_auth = false;
        server_config.mandatory_auth = false;
    }

    let client = SecurityContext::new(config, mechanisms.clone()).await;
    let server = if cli.legacy_server {
        SecurityContext::without_negotiation_service(server_config, mechanisms)
    } else {
        SecurityContext::new(server_config, mechanisms).await
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.register_handler(APP_WRITE, Arc::new(Collector { tx })).await;

    let (client_session, server_session) = loopback(&client, &server)
        .await
        .context("Failed to connect sessions")?;

    let mut queued = 0;
    for i in 0..cli.messages {
        let write = RpcMessage::request(APP_WRITE, Bytes::from(format!("write-{}", i)));
        if client_session.send(write).await? == SendStatus::Queued {
            queued += 1;
        }
    }

    let wait = Duration::from_secs(cli.timeout);
    let client_outcome = tokio::time::timeout(wait, client_session.wait_negotiated())
        .await
        .map_err(|_| anyhow!("Client negotiation did not finish within {:?}", wait))?;
    let server_outcome = tokio::time::timeout(wait, server_session.wait_negotiated())
        .await
        .map_err(|_| anyhow!("Server negotiation did not finish within {:?}", wait))?;

    let mut delivered_as = Vec::new();
    if client_outcome.is_success() {
        while delivered_as.len() < cli.messages {
            match tokio::time::timeout(wait, rx.recv()).await {
                Ok(Some(msg)) => delivered_as.push(msg.user_name),
                _ => {
                    warn!("Only {} of {} writes arrived", delivered_as.len(), cli.messages);
                    break;
                }
            }
        }
    }

    let report = Report {
        client: SideReport::new(&client_session, &client_outcome),
        server: SideReport::new(&server_session, &server_outcome),
        queued,
        delivered: delivered_as.len(),
        delivered_as,
    };
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.print_text();
    }

    client_session.close().await;
    server_session.close().await;

    if client_outcome.status() == NegotiationStatus::AuthFailed {
        return Err(anyhow!(
            "Negotiation failed: {}",
            report.client.error.as_deref().unwrap_or("unknown error")
        ));
    }
    Ok(())
}
