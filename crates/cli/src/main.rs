use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod client;

use client::GatewayClient;

#[derive(Parser)]
#[command(name = "pushgate")]
#[command(about = "Push notification gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: PUSHGATE_CONFIG_PATH or ~/.pushgate/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the gateway (HTTP + WebSocket). Apps listed in the config are provisioned at startup.
    Gateway {
        /// Config file path (default: PUSHGATE_CONFIG_PATH or ~/.pushgate/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// WebSocket and HTTP port (default from config or 7077)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Register an app's client certificate with the running gateway.
    Provision {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long)]
        app_id: String,

        /// PEM file holding the certificate and private key. Read locally when it exists,
        /// otherwise passed to the gateway as a path on its host.
        #[arg(long, value_name = "PEM")]
        cert: String,

        /// sandbox or production
        #[arg(long, default_value = "sandbox")]
        environment: String,

        /// Connect timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Send notifications. Pass --token and --notification once per device, in matching order.
    Notify {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long)]
        app_id: String,

        /// Device token as hex
        #[arg(long = "token", required = true)]
        tokens: Vec<String>,

        /// Notification JSON, e.g. '{"aps":{"alert":"hi"}}'
        #[arg(long = "notification", required = true)]
        notifications: Vec<String>,
    },

    /// Print tokens the backend reported as unreachable.
    Feedback {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long)]
        app_id: String,
    },

    /// Show provisioned apps and their session state.
    Status {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("pushgate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init { config }) => run_init(config),
        Some(Commands::Gateway { config, port }) => run_gateway(config, port).await,
        Some(Commands::Provision {
            config,
            app_id,
            cert,
            environment,
            timeout,
        }) => run_provision(config, app_id, cert, environment, timeout).await,
        Some(Commands::Notify {
            config,
            app_id,
            tokens,
            notifications,
        }) => run_notify(config, app_id, tokens, notifications).await,
        Some(Commands::Feedback { config, app_id }) => run_feedback(config, app_id).await,
        Some(Commands::Status { config }) => run_status(config).await,
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = result {
        log::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(pushgate_core::config::default_config_path);
    let dir = pushgate_core::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = pushgate_core::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!(
        "starting gateway on {}:{} (config {})",
        config.gateway.bind,
        config.gateway.port,
        path.display()
    );
    pushgate_core::gateway::run_gateway(config).await
}

async fn connect(config_path: Option<PathBuf>) -> anyhow::Result<GatewayClient> {
    let (config, _) = pushgate_core::config::load_config(config_path)?;
    GatewayClient::connect(&config).await
}

async fn run_provision(
    config_path: Option<PathBuf>,
    app_id: String,
    cert: String,
    environment: String,
    timeout: Option<u64>,
) -> anyhow::Result<()> {
    let cert = match std::fs::read_to_string(&cert) {
        Ok(pem) => pem,
        Err(_) => cert,
    };
    let mut client = connect(config_path).await?;
    let payload = client
        .request(
            "provision",
            serde_json::json!({
                "appId": app_id,
                "cert": cert,
                "environment": environment,
                "timeout": timeout,
            }),
        )
        .await?;
    if payload.get("created").and_then(|v| v.as_bool()) == Some(true) {
        println!("provisioned {}", app_id);
    } else {
        println!("{} was already provisioned; kept existing credential", app_id);
    }
    Ok(())
}

async fn run_notify(
    config_path: Option<PathBuf>,
    app_id: String,
    tokens: Vec<String>,
    notifications: Vec<String>,
) -> anyhow::Result<()> {
    let notifications = notifications
        .iter()
        .enumerate()
        .map(|(i, n)| {
            serde_json::from_str::<serde_json::Value>(n)
                .map_err(|e| anyhow::anyhow!("notification {} is not valid JSON: {}", i, e))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let mut client = connect(config_path).await?;
    let payload = client
        .request(
            "notify",
            serde_json::json!({
                "appId": app_id,
                "tokens": tokens,
                "notifications": notifications,
            }),
        )
        .await?;
    println!("sent {}", payload.get("sent").and_then(|v| v.as_u64()).unwrap_or(0));
    Ok(())
}

async fn run_feedback(config_path: Option<PathBuf>, app_id: String) -> anyhow::Result<()> {
    let mut client = connect(config_path).await?;
    let payload = client
        .request("feedback", serde_json::json!({ "appId": app_id }))
        .await?;
    for pair in payload.as_array().into_iter().flatten() {
        let expired = pair.get(0).and_then(|v| v.as_str()).unwrap_or("");
        let token = pair.get(1).and_then(|v| v.as_str()).unwrap_or("");
        println!("{}\t{}", expired, token);
    }
    Ok(())
}

async fn run_status(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let mut client = connect(config_path).await?;
    let payload = client.request("status", serde_json::json!({})).await?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}
