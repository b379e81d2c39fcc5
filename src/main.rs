use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

mod actions;
mod api;
mod config;
mod dispatcher;
mod errors;
mod executor;
mod media;
mod mqtt;
mod protocol;
mod relay_client;
mod relay_server;
mod session;
mod signaling;
mod trigger;
mod utils;
mod workers;

use actions::ActionManager;
use config::Config;
use dispatcher::Dispatcher;
use executor::AgentExecutor;
use media::MediaClient;
use mqtt::MqttHandle;
use relay_client::RelayAgent;
use session::SessionRegistry;
use signaling::NullSignaling;
use trigger::{TriggerMonitor, TriggerSettings};
use workers::ShellWorkers;

/// Shared server-side state handed to the relay and API handlers.
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub monitor: Arc<TriggerMonitor>,
    pub actions: Arc<ActionManager>,
    pub media: MediaClient,
    pub mqtt: MqttHandle,
    pub outbox_capacity: usize,
    pub action_deadline: Duration,
}

#[derive(Parser)]
#[command(name = "camera-fleet-server", about = "Fleet management backend for IP cameras")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the central fleet server
    Server,
    /// Run an edge gateway agent
    Agent,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("camera_fleet_server=debug,info")
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config).unwrap_or_else(|_| {
        warn!("Could not load {}, using default configuration", cli.config);
        Config::default()
    });

    match cli.command {
        Commands::Server => run_server(config).await,
        Commands::Agent => run_agent(config).await,
    }
}

async fn run_server(config: Config) -> Result<()> {
    info!("Starting camera fleet server on {}:{}", config.server.host, config.server.port);

    let mqtt = match &config.mqtt {
        Some(mqtt_config) => MqttHandle::connect(mqtt_config).await?,
        None => MqttHandle::disabled(),
    };

    let trigger_settings = TriggerSettings {
        debounce_window: config.trigger.debounce_window()?,
        debounce_threshold: config.trigger.debounce_threshold,
        idle_timeout: config.trigger.idle_timeout()?,
    };
    let (monitor, trigger_events) = TriggerMonitor::new(trigger_settings);
    let actions = Arc::new(ActionManager::new(
        config.action.max_retry,
        config.action.retry_delay()?,
    ));
    let media = MediaClient::new(&config.media);
    let registry = Arc::new(SessionRegistry::new(config.relay.response_timeout()?));
    let action_deadline = config.action.deadline()?;

    let state = Arc::new(AppState {
        registry,
        monitor,
        actions: actions.clone(),
        media: media.clone(),
        mqtt: mqtt.clone(),
        outbox_capacity: config.relay.outbox_capacity,
        action_deadline,
    });

    // The dispatcher turns debounced trigger events into recording actions
    let recording_dispatcher = Dispatcher::new(actions, media, mqtt, action_deadline);
    tokio::spawn(recording_dispatcher.run(trigger_events));

    let cors_layer = if let Some(origin) = &config.server.cors_allow_origin {
        if origin == "*" {
            tower_http::cors::CorsLayer::permissive()
        } else {
            match origin.parse::<axum::http::HeaderValue>() {
                Ok(origin_header) => tower_http::cors::CorsLayer::new()
                    .allow_origin(origin_header)
                    .allow_methods(tower_http::cors::Any)
                    .allow_headers(tower_http::cors::Any),
                Err(_) => {
                    warn!("Invalid CORS origin '{}', falling back to permissive", origin);
                    tower_http::cors::CorsLayer::permissive()
                }
            }
        }
    } else {
        tower_http::cors::CorsLayer::permissive()
    };

    let app = axum::Router::new()
        .route("/relay", axum::routing::get(relay_server::relay_handler))
        .route("/api/health", axum::routing::get(api::api_health))
        .route("/api/clients", axum::routing::get(api::api_list_clients))
        .route("/api/clients/:client_id/command", axum::routing::post(api::api_send_command))
        .route("/api/streams/:stream_id/record/start", axum::routing::post(api::api_start_recording))
        .route("/api/streams/:stream_id/record/stop", axum::routing::post(api::api_stop_recording))
        .layer(cors_layer)
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn run_agent(config: Config) -> Result<()> {
    let agent_config = config
        .agent
        .clone()
        .ok_or_else(|| anyhow::anyhow!("Missing [agent] section in configuration"))?;
    info!("Starting fleet agent '{}'", agent_config.client_id);

    let media = MediaClient::new(&config.media);
    let media_ip = url::Url::parse(&config.media.url)?
        .host_str()
        .unwrap_or("127.0.0.1")
        .to_string();
    let actions = Arc::new(ActionManager::new(
        config.action.max_retry,
        config.action.retry_delay()?,
    ));
    let executor = Arc::new(AgentExecutor::new(
        media,
        media_ip,
        Arc::new(ShellWorkers),
        Arc::new(NullSignaling),
        actions,
        config.action.deadline()?,
    ));

    let agent = Arc::new(RelayAgent::new(agent_config, executor));
    agent.run().await;

    Ok(())
}
