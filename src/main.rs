//! iotda-link command line entry point

use clap::{Args, Parser, Subcommand};
use iotda_link::config::LinkConfig;
use iotda_link::observability::{init_default_logging, rest_metrics};
use iotda_link::protocol::{
    parse_device_topic, parse_property_report, ConfigCommand, ControlCommand, ThresholdCommand,
    TopicKind,
};
use iotda_link::rest::{AsyncCommandOptions, IotdaRestClient};
use iotda_link::signing::{
    build_device_auth, format_sdk_date, Credentials, RequestSigner, SignRequest,
};
use iotda_link::transport::mqtt::{configure_client_options, ConnectionState, MqttClient};
use iotda_link::LinkError;
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Telemetry and commands for an IoTDA-connected device
#[derive(Parser)]
#[command(name = "iotda-link")]
#[command(about = "Live MQTT telemetry and signed REST commands for IoTDA devices")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to device telemetry and print every message
    Monitor,
    /// Fetch the device shadow
    Shadow,
    /// Fetch device status
    DeviceInfo,
    /// Send a synchronous control command
    Control(ControlArgs),
    /// Send thresholds as an asynchronous command
    Thresholds(ThresholdArgs),
    /// Send a synchronous configuration command
    SetConfig(SetConfigArgs),
    /// Print the Authorization header for a request
    Sign(SignArgs),
    /// Print MQTT credentials derived from the device secret
    MqttAuth(MqttAuthArgs),
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[derive(Args)]
struct ControlArgs {
    #[arg(long)]
    heater: Option<bool>,
    #[arg(long)]
    pump_in: Option<bool>,
    #[arg(long)]
    pump_out: Option<bool>,
    #[arg(long)]
    mute: Option<bool>,
    #[arg(long)]
    auto_mode: Option<bool>,
    #[arg(long)]
    feed: Option<bool>,
    /// Feed once after this many seconds
    #[arg(long)]
    feed_once_delay: Option<u32>,
    #[arg(long)]
    target_temp: Option<f64>,
}

#[derive(Args)]
struct ThresholdArgs {
    #[arg(long)]
    temp_min: Option<f64>,
    #[arg(long)]
    temp_max: Option<f64>,
    #[arg(long)]
    ph_min: Option<f64>,
    #[arg(long)]
    ph_max: Option<f64>,
    #[arg(long)]
    tds_warn: Option<f64>,
    #[arg(long)]
    tds_critical: Option<f64>,
    #[arg(long)]
    turbidity_warn: Option<f64>,
    #[arg(long)]
    turbidity_critical: Option<f64>,
    #[arg(long)]
    level_min: Option<f64>,
    #[arg(long)]
    level_max: Option<f64>,
    #[arg(long)]
    feed_interval: Option<u32>,
    #[arg(long)]
    feed_amount: Option<u32>,
    /// Seconds the platform keeps the command for an offline device
    #[arg(long, default_value_t = 86_400)]
    expire_time: u64,
    #[arg(long, default_value = "immediately")]
    send_strategy: String,
}

#[derive(Args)]
struct SetConfigArgs {
    #[arg(long)]
    wifi_ssid: Option<String>,
    /// Environment variable holding the Wi-Fi password
    #[arg(long, value_name = "VAR")]
    wifi_password_env: Option<String>,
    #[arg(long)]
    ph_offset: Option<f64>,
    #[arg(long)]
    tds_factor: Option<f64>,
}

#[derive(Args)]
struct SignArgs {
    #[arg(long, default_value = "GET")]
    method: String,
    /// Canonical path, e.g. /v5/iot/{project}/devices/{device}/shadow
    #[arg(long)]
    uri: String,
    #[arg(long)]
    host: String,
    /// Pre-canonicalized query string
    #[arg(long, default_value = "")]
    query: String,
    /// X-Sdk-Date; defaults to now
    #[arg(long)]
    date: Option<String>,
    /// JSON body; implies Content-Type: application/json
    #[arg(long)]
    body: Option<String>,
    #[arg(long, env = "IOTDA_AK", hide_env_values = true)]
    ak: String,
    #[arg(long, env = "IOTDA_SK", hide_env_values = true)]
    sk: String,
}

#[derive(Args)]
struct MqttAuthArgs {
    #[arg(long, env = "IOTDA_DEVICE_ID")]
    device_id: String,
    #[arg(long, env = "IOTDA_DEVICE_SECRET", hide_env_values = true)]
    device_secret: String,
    /// UTC hour `YYYYMMDDHH`; defaults to the current hour
    #[arg(long)]
    timestamp: Option<String>,
    /// Include the derived password in the output
    #[arg(long)]
    show_password: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let result = match cli.command {
        Commands::Monitor => match load_configuration(&cli.config) {
            Ok(config) => run_monitor(config).await,
            Err(e) => Err(e),
        },
        Commands::Shadow => with_rest(&cli.config, |client| async move {
            print_json(&client.get_device_shadow().await?)
        })
        .await,
        Commands::DeviceInfo => with_rest(&cli.config, |client| async move {
            print_json(&client.get_device_info().await?)
        })
        .await,
        Commands::Control(args) => {
            let command = args.into_command();
            if command.is_empty() {
                Err("control needs at least one field".into())
            } else {
                with_rest(&cli.config, |client| async move {
                    print_json(&client.send_control(&command).await?)
                })
                .await
            }
        }
        Commands::Thresholds(args) => {
            let (command, options) = args.into_command();
            with_rest(&cli.config, |client| async move {
                print_json(&client.send_set_thresholds_async(&command, &options).await?)
            })
            .await
        }
        Commands::SetConfig(args) => match args.into_command() {
            Ok(command) => {
                with_rest(&cli.config, |client| async move {
                    print_json(&client.send_set_config(&command).await?)
                })
                .await
            }
            Err(e) => Err(e.into()),
        },
        Commands::Sign(args) => sign_request(args),
        Commands::MqttAuth(args) => derive_mqtt_auth(args),
        Commands::Config { show } => match load_configuration(&cli.config) {
            Ok(config) => handle_config_command(config, show),
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        error!(error = %iotda_link::error::sanitize_error_message(&e.to_string()), "Command failed");
        process::exit(1);
    }
}

fn load_configuration(config_path: &Option<PathBuf>) -> Result<LinkConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(LinkConfig::load_from_file(path)?);
    }

    for path_str in ["iotda-link.toml", "config/iotda-link.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(LinkConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create iotda-link.toml".into())
}

async fn with_rest<F, Fut>(config_path: &Option<PathBuf>, call: F) -> CliResult
where
    F: FnOnce(IotdaRestClient) -> Fut,
    Fut: std::future::Future<Output = CliResult>,
{
    let config = load_configuration(config_path)?;
    let client = IotdaRestClient::from_config(&config).map_err(LinkError::from)?;
    let result = call(client).await;
    let stats = rest_metrics().snapshot();
    info!(requests = stats.requests, failures = stats.failures, "REST calls finished");
    result
}

fn print_json<T: Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

impl ControlArgs {
    fn into_command(self) -> ControlCommand {
        ControlCommand {
            heater: self.heater,
            pump_in: self.pump_in,
            pump_out: self.pump_out,
            mute: self.mute,
            auto_mode: self.auto_mode,
            feed: self.feed,
            feed_once_delay: self.feed_once_delay,
            target_temp: self.target_temp,
        }
    }
}

impl ThresholdArgs {
    fn into_command(self) -> (ThresholdCommand, AsyncCommandOptions) {
        let command = ThresholdCommand {
            temp_min: self.temp_min,
            temp_max: self.temp_max,
            ph_min: self.ph_min,
            ph_max: self.ph_max,
            tds_warn: self.tds_warn,
            tds_critical: self.tds_critical,
            turbidity_warn: self.turbidity_warn,
            turbidity_critical: self.turbidity_critical,
            level_min: self.level_min,
            level_max: self.level_max,
            feed_interval: self.feed_interval,
            feed_amount: self.feed_amount,
        };
        let options = AsyncCommandOptions {
            expire_time_secs: self.expire_time,
            send_strategy: self.send_strategy,
        };
        (command, options)
    }
}

impl SetConfigArgs {
    fn into_command(self) -> Result<ConfigCommand, LinkError> {
        let wifi_password = match self.wifi_password_env {
            Some(name) => Some(std::env::var(&name).map_err(|_| {
                LinkError::invalid_input(format!("environment variable {name} is not set"))
            })?),
            None => None,
        };
        Ok(ConfigCommand {
            wifi_ssid: self.wifi_ssid,
            wifi_password,
            ph_offset: self.ph_offset,
            tds_factor: self.tds_factor,
        })
    }
}

fn sign_request(args: SignArgs) -> CliResult {
    let date = args
        .date
        .unwrap_or_else(|| format_sdk_date(chrono::Utc::now()));
    let mut request = SignRequest::new(&args.method, &args.uri, &args.host, &date)
        .with_query(&args.query);
    if let Some(body) = &args.body {
        request = request.with_body("application/json", body.as_bytes());
    }

    let signer = RequestSigner::new(Credentials::new(args.ak, args.sk));
    let authorization = signer.sign(&request).map_err(LinkError::from)?;
    println!("X-Sdk-Date: {date}");
    println!("Authorization: {authorization}");
    Ok(())
}

fn derive_mqtt_auth(args: MqttAuthArgs) -> CliResult {
    let auth = build_device_auth(&args.device_id, &args.device_secret, args.timestamp.as_deref())
        .map_err(LinkError::from)?;
    println!("client_id: {}", auth.client_id);
    println!("username:  {}", auth.username);
    println!("timestamp: {}", auth.timestamp);
    if args.show_password {
        println!("password:  {}", auth.password);
    }
    Ok(())
}

fn handle_config_command(config: LinkConfig, show: bool) -> CliResult {
    if show {
        println!("{}", toml::to_string_pretty(&config)?);
    }
    info!(device_id = %config.device.id, "Configuration validation complete");
    Ok(())
}

async fn run_monitor(config: LinkConfig) -> CliResult {
    let secret = config.device_secret()?;
    let options = configure_client_options(&config, secret);
    info!(device_id = %config.device.id, topic = %options.topic, "Starting telemetry monitor");

    let (tx, mut rx) = mpsc::channel(256);
    let mut client = MqttClient::new(options);
    client.set_message_sender(tx).await;
    let mut state_rx = client.state_receiver();
    client.start();

    #[cfg(unix)]
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    loop {
        #[cfg(unix)]
        let terminate = sigterm.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = terminate => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                match state_rx.borrow_and_update().clone() {
                    ConnectionState::Error { reason, retry_in } => {
                        warn!(reason = %reason, retry_in_ms = retry_in.as_millis() as u64, "Connection error");
                    }
                    state => info!(state = ?state, "Connection state changed"),
                }
            }
            message = rx.recv() => {
                let Some(message) = message else { break };
                let is_report = parse_device_topic(&message.topic)
                    .map(|topic| topic.kind == TopicKind::PropertyReport)
                    .unwrap_or(false);
                if is_report {
                    match parse_property_report(&message.payload) {
                        Ok((properties, _)) => print_json(&properties)?,
                        Err(e) => {
                            warn!(error = %e, "Unreadable property report");
                            println!("{}", message.payload);
                        }
                    }
                } else {
                    println!("{} {}", message.topic, message.payload);
                }
            }
        }
    }

    client.stop().await;
    let metrics = client.metrics();
    info!(
        messages = metrics.messages_received,
        reconnects = metrics.reconnects_scheduled,
        "Monitor stopped"
    );
    Ok(())
}
