//! postoffice CLI - run the post office and talk to it
//!
//! `serve` runs the routing queue, the throttle queues and the operator HTTP
//! endpoints. `send` admits a single message, `token` prints a fresh secret
//! and `config` shows the resolved configuration.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use postoffice::{
    api, logging, AdmissionRequest, App, Broker, MemoryBroker, NatsBroker, OfficeConfig, Postman,
    SecurityManager, WorkflowContext,
};

#[derive(Parser)]
#[command(name = "postoffice")]
#[command(version, about = "Broker-backed routing and throttle queues for pipeline stages", long_about = None)]
struct Cli {
    /// YAML configuration file; environment variables override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the post office, throttle queues and HTTP endpoints
    Serve {
        /// Use an in-process broker instead of NATS
        #[arg(long)]
        in_memory: bool,
    },

    /// Admit one message to the post-office queue
    Send {
        /// Routing key of the target letterbox
        #[arg(short, long)]
        util: String,

        /// Message type interpreted by the letterbox
        #[arg(short = 't', long = "type", default_value = "")]
        kind: String,

        /// Payload as a JSON object
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Existing workflow context as JSON
        #[arg(short, long, conflicts_with = "location")]
        workflow: Option<String>,

        /// Start a new batch for this location id
        #[arg(short, long)]
        location: Option<String>,

        /// Admission secret (defaults to ADMISSION_SECRET)
        #[arg(long, env = "ADMISSION_SECRET", hide_env_values = true)]
        secret: Option<String>,

        /// Message id, reused for de-duplication
        #[arg(long)]
        id: Option<String>,
    },

    /// Generate a random secret suitable for any of the tokens
    Token {
        #[arg(short, long, default_value_t = 64)]
        length: usize,
    },

    /// Print the resolved configuration with secrets masked
    Config,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    logging::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve { in_memory } => serve(cli.config, in_memory).await,
        Commands::Send { util, kind, payload, workflow, location, secret, id } => {
            send(cli.config, util, kind, payload, workflow, location, secret, id).await
        }
        Commands::Token { length } => {
            println!("{}", SecurityManager::generate_secure_token(length));
            Ok(())
        }
        Commands::Config => show_config(cli.config),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<PathBuf>) -> Result<OfficeConfig, String> {
    let config = match path {
        Some(path) => OfficeConfig::load_from_file(&path, |key| std::env::var(key).ok()),
        None => OfficeConfig::from_env(),
    };
    config.map_err(|e| e.to_string())
}

async fn connect(config: &OfficeConfig, in_memory: bool) -> Result<Arc<dyn Broker>, String> {
    if in_memory {
        tracing::warn!("Using the in-memory broker; messages are lost on exit");
        let broker = MemoryBroker::new(config.broker.max_deliver.max(1) as u64).with_backoff(config.broker.backoff());
        return Ok(Arc::new(broker));
    }
    let broker = NatsBroker::connect(&config.broker)
        .await
        .map_err(|e| e.to_string())?;
    Ok(Arc::new(broker))
}

/// Run until Ctrl-C, then stop the router and drain the throttle queues
async fn serve(config: Option<PathBuf>, in_memory: bool) -> Result<(), String> {
    let config = load_config(config)?;
    let broker = connect(&config, in_memory).await?;

    let app = Arc::new(App::build(config, broker).await.map_err(|e| e.to_string())?);
    app.security.log_startup_warning();
    app.start().await.map_err(|e| e.to_string())?;

    let addr = SocketAddr::from(([0, 0, 0, 0], app.config.http_port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("Failed to bind {}: {}", addr, e))?;
    tracing::info!("Post office listening on {}", addr);
    tracing::info!(queues = ?app.manager.queue_status(), "Queue status");

    let served = axum::serve(listener, api::router(app.clone()))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received");
        })
        .await
        .map_err(|e| e.to_string());

    app.shutdown().await.map_err(|e| e.to_string())?;
    tracing::info!("Post office shutdown complete");
    served
}

#[allow(clippy::too_many_arguments)]
async fn send(
    config: Option<PathBuf>,
    util: String,
    kind: String,
    payload: String,
    workflow: Option<String>,
    location: Option<String>,
    secret: Option<String>,
    id: Option<String>,
) -> Result<(), String> {
    let config = load_config(config)?;

    let payload: serde_json::Value =
        serde_json::from_str(&payload).map_err(|e| format!("Invalid payload JSON: {}", e))?;

    let workflow = match (workflow, location) {
        (Some(raw), _) => {
            serde_json::from_str::<WorkflowContext>(&raw).map_err(|e| format!("Invalid workflow JSON: {}", e))?
        }
        (None, Some(location)) => WorkflowContext::create_batch(location, None, None, None),
        (None, None) => return Err("Either --workflow or --location is required".to_string()),
    };

    let broker = connect(&config, false).await?;
    let sender = broker
        .sender(&config.post_office.queue_name)
        .await
        .map_err(|e| e.to_string())?;
    let security = Arc::new(SecurityManager::new(config.security.clone()));
    let postman = Postman::new(security, sender, config.post_office.queue_name.clone());

    let batch_id = workflow.batch_id().to_string();
    let request = AdmissionRequest {
        util: Some(util),
        kind: Some(kind),
        workflow: Some(workflow),
        payload: Some(payload),
        api_secret: secret,
        id,
    };

    let message_id = postman
        .send_to_post_office(request)
        .await
        .map_err(|e| e.to_string())?;

    println!("✓ Admitted message {} (batch {})", message_id, batch_id);
    Ok(())
}

fn show_config(config: Option<PathBuf>) -> Result<(), String> {
    let config = load_config(config)?;
    let yaml = serde_yaml::to_string(&config.redacted()).map_err(|e| e.to_string())?;
    print!("{}", yaml);
    Ok(())
}
