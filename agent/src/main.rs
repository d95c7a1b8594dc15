use std::net::{IpAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tether_agent::config::{default_data_dir, generate_token, save_token};
use tether_agent::{AgentConfig, AgentServer, Dispatcher, SessionManager};
use tether_lib::config::{pair_url, Device};

#[derive(Parser)]
#[command(name = "tether-agent")]
#[command(version, about = "Device agent for tether clients", long_about = None)]
struct Cli {
    #[command(flatten)]
    opts: AgentOpts,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct AgentOpts {
    /// Port to listen on
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Device name announced to clients
    #[arg(long, global = true)]
    name: Option<String>,

    /// Directory holding agent.json, the token and the identity key
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Host written into the pairing URL (detected when omitted)
    #[arg(long, global = true)]
    advertise_host: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept client connections (default)
    Serve,

    /// Replace the persisted token; paired clients must pair again
    RotateToken,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.opts)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config, cli.opts.advertise_host).await,
        Commands::RotateToken => rotate_offline(&config, cli.opts.advertise_host.as_deref()),
    }
}

fn load_config(opts: &AgentOpts) -> Result<AgentConfig> {
    let data_dir = opts.data_dir.clone().unwrap_or_else(default_data_dir);
    let mut config = AgentConfig::load(&data_dir)
        .with_context(|| format!("loading agent config from {}", data_dir.display()))?;

    if let Some(port) = opts.port {
        config.port = port;
    }
    if let Some(bind) = &opts.bind {
        config.bind = bind.clone();
    }
    if let Some(name) = &opts.name {
        config.device_name = name.clone();
    }
    Ok(config)
}

async fn serve(config: AgentConfig, advertise: Option<String>) -> Result<()> {
    let token = config.load_or_create_token().context("loading token")?;
    let fingerprint = config.fingerprint().context("loading identity key")?;

    let sessions = Arc::new(
        SessionManager::new(token.as_str(), fingerprint, config.device_name.as_str())
            .with_token_file(config.token_path()),
    );
    let dispatcher = Arc::new(Dispatcher::with_builtins(Arc::clone(&sessions)));
    let server = Arc::new(
        AgentServer::new(Arc::clone(&sessions), dispatcher)
            .with_handshake_timeout(config.handshake_timeout()),
    );

    let listen_addr = config.listen_addr();
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {}", listen_addr))?;
    let port = listener.local_addr()?.port();
    let host = advertise.unwrap_or_else(|| advertise_host(&config.bind));

    info!(
        "[agent] {} serving on {} (data dir {})",
        config.device_name,
        listen_addr,
        config.data_dir.display()
    );
    print_pairing(&config.device_name, &host, port, &token)?;
    drop(token);

    spawn_rotation_on_hangup(Arc::clone(&sessions), config.device_name.clone(), host, port);

    server
        .serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("[agent] Interrupted");
        })
        .await;
    Ok(())
}

fn rotate_offline(config: &AgentConfig, advertise: Option<&str>) -> Result<()> {
    let token = generate_token();
    save_token(&config.token_path(), &token).context("writing token")?;
    let host = advertise
        .map(str::to_string)
        .unwrap_or_else(|| advertise_host(&config.bind));
    println!("Token rotated. Paired clients must pair again.");
    print_pairing(&config.device_name, &host, config.port, &token)
}

#[cfg(unix)]
fn spawn_rotation_on_hangup(sessions: Arc<SessionManager>, name: String, host: String, port: u16) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            error!("[agent] Cannot listen for SIGHUP, live rotation disabled: {}", e);
            return;
        }
    };

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match sessions.rotate_token() {
                Ok(token) => {
                    if let Err(e) = print_pairing(&name, &host, port, &token) {
                        error!("[agent] {}", e);
                    }
                }
                Err(e) => error!("[agent] Token rotation failed: {}", e),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_rotation_on_hangup(_sessions: Arc<SessionManager>, _name: String, _host: String, _port: u16) {
    info!("[agent] Live rotation is only available on Unix, use `tether-agent rotate-token`");
}

fn print_pairing(name: &str, host: &str, port: u16, token: &str) -> Result<()> {
    let url = pair_url(&Device::new(name, host, port, token))?;
    println!("Pair a client with:\n  tether pair '{}'", url);
    Ok(())
}

/// Address clients should dial. A wildcard bind is resolved to the
/// interface that carries the default route (no packet is sent).
fn advertise_host(bind: &str) -> String {
    match bind.parse::<IpAddr>() {
        Ok(ip) if !ip.is_unspecified() => return ip.to_string(),
        Ok(_) => {}
        Err(_) => return bind.to_string(),
    }

    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
