use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

use tether_lib::ai::{
    self, AiConfig, AnthropicModel, CliModel, EventSink, Orchestrator, RunEvent, RunReport,
};
use tether_lib::client::AgentClient;
use tether_lib::config::{parse_pair_url, ConfigStorage, Device};
use tether_lib::context::ContextStore;
use tether_lib::protocol::{Command, DEFAULT_PORT};

#[derive(Parser)]
#[command(name = "tether")]
#[command(version, about = "Control a paired device from the terminal", long_about = None)]
struct Cli {
    #[command(flatten)]
    target: Target,

    #[command(subcommand)]
    command: Commands,
}

/// Which agent to talk to.
#[derive(Args)]
struct Target {
    /// Paired device to use (defaults to the default device)
    #[arg(long, short = 'd', global = true)]
    device: Option<String>,

    /// Connect to this host directly instead of a paired device
    #[arg(long, global = true)]
    host: Option<String>,

    /// Agent port when using --host
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Agent token when using --host
    #[arg(long, global = true)]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Pair with an agent using its tether://pair?... URL (read from stdin if omitted)
    Pair { url: Option<String> },

    /// List paired devices
    Devices {
        /// Forget this device instead of listing
        #[arg(long, value_name = "NAME")]
        remove: Option<String>,
    },

    /// Run any agent command, e.g. `tether run swipe 100 900 100 200 --duration 300`
    Run {
        cmd: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Control the device with natural language
    Ai {
        /// Forget the saved conversation first
        #[arg(long)]
        clear: bool,

        /// Ignore saved conversation for this call
        #[arg(long)]
        no_context: bool,

        instruction: Vec<String>,
    },

    /// Save a screenshot of the device screen
    Screenshot { out: Option<PathBuf> },

    /// Show agent status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let storage = ConfigStorage::new()?;

    match cli.command {
        Commands::Pair { url } => pair(&storage, url).await,
        Commands::Devices { remove } => devices(&storage, remove),
        Commands::Run { cmd, args } => run(&storage, &cli.target, cmd, args).await,
        Commands::Ai {
            clear,
            no_context,
            instruction,
        } => run_ai(&storage, &cli.target, clear, no_context, instruction.join(" ")).await,
        Commands::Screenshot { out } => screenshot(&storage, &cli.target, out).await,
        Commands::Status => status(&storage, &cli.target).await,
    }
}

/// Device from `--host` overrides, else from the registry.
fn resolve_device(storage: &ConfigStorage, target: &Target) -> Result<Device> {
    if let Some(host) = &target.host {
        let Some(token) = &target.token else {
            bail!("--host requires --token");
        };
        return Ok(Device::new(
            host.clone(),
            host.clone(),
            target.port.unwrap_or(DEFAULT_PORT),
            token.clone(),
        ));
    }

    let registry = storage.load()?;
    Ok(registry.get_device(target.device.as_deref())?.clone())
}

async fn connect(storage: &ConfigStorage, target: &Target) -> Result<AgentClient> {
    let device = resolve_device(storage, target)?;
    Ok(AgentClient::connect(&device).await?)
}

async fn pair(storage: &ConfigStorage, url: Option<String>) -> Result<()> {
    let url = match url {
        Some(url) => url,
        None => {
            eprintln!("Paste the pairing URL shown by tether-agent:");
            let mut line = String::new();
            tokio::io::BufReader::new(tokio::io::stdin())
                .read_line(&mut line)
                .await
                .context("reading pairing URL from stdin")?;
            line
        }
    };

    let device = parse_pair_url(&url)?;
    println!("Connecting to {} at {}...", device.name, device.address());

    let mut client = AgentClient::connect(&device).await?;
    client
        .run_ok(Command::new("status", vec![], Default::default()))
        .await
        .context("test command failed")?;
    client.close().await;

    let mut registry = storage.load()?;
    registry.add_or_update(device.clone());
    storage.save(&registry)?;

    println!("Paired with {} ({})", device.name, device.address());
    if registry.is_default(&device) {
        println!("{} is the default device", device.name);
    }
    Ok(())
}

fn devices(storage: &ConfigStorage, remove: Option<String>) -> Result<()> {
    if let Some(name) = remove {
        let Some(removed) = storage.remove_device(&name)? else {
            bail!("No paired device named {:?}. Run: tether devices", name);
        };
        println!("Removed {} ({})", removed.name, removed.address());
        return Ok(());
    }

    let registry = storage.load()?;
    if registry.devices.is_empty() {
        println!("No devices paired. Run: tether pair");
        return Ok(());
    }
    for device in &registry.devices {
        let marker = if registry.is_default(device) { "*" } else { " " };
        println!("{} {:<20} {}", marker, device.name, device.address());
    }
    Ok(())
}

async fn run(storage: &ConfigStorage, target: &Target, cmd: String, args: Vec<String>) -> Result<()> {
    let (args, flags) = ai::tokenizer::split_flags(&args);
    let mut client = connect(storage, target).await?;
    let result = client.run(Command::new(cmd, args, flags)).await;
    client.close().await;

    let result = result?;
    if !result.ok {
        bail!("{}", result.error_message());
    }
    println!("{}", serde_json::to_string_pretty(&result.data)?);
    Ok(())
}

async fn status(storage: &ConfigStorage, target: &Target) -> Result<()> {
    let mut client = connect(storage, target).await?;
    let data = client
        .run_ok(Command::new("status", vec![], Default::default()))
        .await;
    client.close().await;
    println!("{}", serde_json::to_string_pretty(&data?)?);
    Ok(())
}

async fn screenshot(storage: &ConfigStorage, target: &Target, out: Option<PathBuf>) -> Result<()> {
    let mut client = connect(storage, target).await?;
    let data = client
        .run_ok(Command::new(ai::prompt::SCREENSHOT_ACTION, vec![], Default::default()))
        .await;
    client.close().await;

    let shot = ai::executor::decode_screenshot(&data?).map_err(anyhow::Error::msg)?;
    let bytes = BASE64.decode(&shot.data)?;
    let out = out.unwrap_or_else(|| {
        let ext = infer::get(&bytes).map(|k| k.extension()).unwrap_or("png");
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        PathBuf::from(format!("screenshot-{}.{}", secs, ext))
    });

    std::fs::write(&out, &bytes).with_context(|| format!("writing {}", out.display()))?;
    match shot.dimensions {
        Some((w, h)) => println!("Saved {} ({}x{})", out.display(), w, h),
        None => println!("Saved {}", out.display()),
    }
    Ok(())
}

async fn run_ai(
    storage: &ConfigStorage,
    target: &Target,
    clear: bool,
    no_context: bool,
    query: String,
) -> Result<()> {
    let registry = storage.load()?;
    let device = resolve_device(storage, target)?;
    let store = ContextStore::for_device(storage.dir(), &device.name);

    if clear {
        store.clear()?;
        println!("Conversation context cleared");
        if query.trim().is_empty() {
            return Ok(());
        }
    }
    if query.trim().is_empty() {
        bail!("provide an instruction, or --clear to reset the conversation");
    }

    let config = AiConfig::from_env();
    let api_key = ai::resolve_api_key(&registry);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(event);
        }
    });

    let mut client = AgentClient::connect(&device).await?;
    let outcome = match api_key {
        Some(key) => {
            let model = AnthropicModel::new(key, config.clone())?;
            let orchestrator = Orchestrator::new(Box::new(model), store)
                .with_max_rounds(config.max_rounds)
                .with_events(EventSink::new(tx));
            orchestrator.run(&mut client, &query, no_context).await
        }
        None => {
            let model = CliModel::new(config.cli_program.clone());
            let orchestrator =
                Orchestrator::new(Box::new(model), store).with_events(EventSink::new(tx));
            orchestrator.run_fallback(&mut client, &query).await
        }
    };
    client.close().await;
    // All senders are gone once the orchestrator is dropped
    let _ = printer.await;

    let report: RunReport = outcome?;
    if report.final_response.is_none() {
        println!("  (no final answer after {} rounds)", report.rounds);
    }
    Ok(())
}

fn print_event(event: RunEvent) {
    match event {
        RunEvent::ContextLoaded(n) => println!("  [context: {} messages]", n),
        RunEvent::Round(_) => {}
        RunEvent::Comment(text) => println!("  {}", text),
        RunEvent::Action(line) => println!("-> {}", line),
        RunEvent::Summary(line) => println!("  {}", line),
        RunEvent::ActionFailed { error, .. } => println!("  error: {}", error),
        RunEvent::ScreenshotCaptured { dimensions } => match dimensions {
            Some((w, h)) => println!("  screenshot captured ({}x{}), analyzing...", w, h),
            None => println!("  screenshot captured, analyzing..."),
        },
        RunEvent::ContextSaveFailed(e) => println!("  (context save error: {})", e),
    }
}
