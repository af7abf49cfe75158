use clap::{Parser, Subcommand};
use relay_lib::channels::{InboundEvent, SchemaMatcher};

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Webhook-to-completion message relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config.json.
    Init {
        /// Config file path (default: RELAY_CONFIG_PATH or ~/.relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the gateway: receive webhooks, complete, deliver replies.
    Gateway {
        /// Config file path (default: RELAY_CONFIG_PATH or ~/.relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP port (default from config or 15151)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Normalize a webhook payload (JSON file, or stdin) and print the canonical message.
    Normalize {
        /// Config file path; its relay.schemas decides recognizer order
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Payload file
        #[arg(value_name = "FILE")]
        payload: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    // Before the logger, so RUST_LOG may come from .env too.
    let dotenv = load_env_file(None);
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match dotenv {
        Ok(Some(path)) => log::debug!("loaded environment from {}", path.display()),
        Ok(None) => {}
        Err(e) => log::warn!("ignoring unreadable .env: {}", e),
    }

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("relay {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Normalize { config, payload }) => {
            if let Err(e) = run_normalize(config, payload) {
                log::error!("normalize failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

/// Load `GROQ_*` / `GUPSHUP_*` and friends from a `.env` file: `path`, or the first `.env`
/// found from the working directory upwards. Variables already set in the process win.
fn load_env_file(
    path: Option<&std::path::Path>,
) -> Result<Option<std::path::PathBuf>, dotenvy::Error> {
    let loaded = match path {
        Some(p) => dotenvy::from_path(p).map(|()| p.to_path_buf()),
        None => dotenvy::dotenv(),
    };
    match loaded {
        Ok(p) => Ok(Some(p)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(relay_lib::config::default_config_path);
    let dir = relay_lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = relay_lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!(
        "starting gateway on {}:{} (config {})",
        config.gateway.bind,
        config.gateway.port,
        path.display()
    );
    relay_lib::gateway::run_gateway(config).await
}

fn run_normalize(
    config_path: Option<std::path::PathBuf>,
    payload: Option<std::path::PathBuf>,
) -> anyhow::Result<()> {
    use anyhow::Context;
    use std::io::Read;

    let (config, _) = relay_lib::config::load_config(config_path)?;
    let text = match payload {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("reading payload from {}", path.display()))?,
        None => {
            let mut s = String::new();
            std::io::stdin()
                .read_to_string(&mut s)
                .context("reading payload from stdin")?;
            s
        }
    };
    let value: serde_json::Value = serde_json::from_str(&text).context("payload is not JSON")?;
    let matcher = SchemaMatcher::new(config.relay.schemas.clone());
    let schema = matcher.recognize(&value);
    match matcher.normalize(&InboundEvent::new(value)) {
        Ok(message) => {
            let out = serde_json::json!({
                "schema": schema.map(|s| s.as_str()),
                "message": message,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Err(e) => println!("ignored: {}", e.reason()),
    }
    Ok(())
}
