use async_trait::async_trait;
use clap::Parser;
use device_state_sync::auth::{CredentialAuthGate, SessionGate};
use device_state_sync::config::{self, Config, StoreBackend, Variant};
use device_state_sync::device::{ClampMode, DeviceMode, DeviceRecord, PillMode};
use device_state_sync::store::{InMemoryStore, MqttStore, RemoteStateStore};
use device_state_sync::sync::{DeviceSyncController, SimulationScenario};
use device_state_sync::{Result, SyncError};
use log::{error, info};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Terminal dashboard for a pill dispenser or power clamp.
#[derive(Debug, Parser)]
#[command(name = "device-dashboard", version)]
struct Cli {
    /// Device variant (pill or clamp)
    #[arg(long)]
    variant: Option<Variant>,

    /// Store backend (mqtt or memory)
    #[arg(long)]
    store: Option<StoreBackend>,

    /// Document path, overriding the variant default
    #[arg(long)]
    path: Option<String>,

    /// Observe without signing in
    #[arg(long, conflicts_with = "require_login")]
    public: bool,

    /// Require signing in before observing
    #[arg(long)]
    require_login: bool,
}

const HELP: &str = "commands: login <id> <secret> | logout | mode <value> | toggle | \
                    simulate | stop | show | help | quit";

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::from_env()?;
    if let Some(variant) = cli.variant {
        config.device.variant = variant;
    }
    if let Some(backend) = cli.store {
        config.store.backend = backend;
    }
    if let Some(path) = &cli.path {
        config.device.path = Some(path.clone());
    }
    if cli.public {
        config.auth.required = Some(false);
    }
    if cli.require_login {
        config.auth.required = Some(true);
    }
    config.validate()?;
    Ok(config)
}

fn main() {
    // Load .env before any thread exists
    config::load_dotenv();
    init_logger();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };
    runtime.block_on(run(cli));
}

async fn run(cli: Cli) {
    info!("Starting device dashboard");

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            eprintln!("Dashboard unavailable: the service is not configured correctly.");
            std::process::exit(1);
        }
    };
    info!("Configuration loaded:");
    info!("  Variant: {}", config.device.variant);
    info!("  Document: {}", config.device.store_path());
    info!("  Store: {}", config.store.backend);
    info!("  Login required: {}", config.auth_required());

    let store: Arc<dyn RemoteStateStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(InMemoryStore::new()),
        StoreBackend::Mqtt => {
            info!(
                "Connecting to MQTT broker at {}:{}",
                config.store.mqtt.broker_host, config.store.mqtt.broker_port
            );
            let (store, event_loop) =
                MqttStore::new(&config.store.mqtt, config.device.store_path());
            tokio::spawn(event_loop.run());
            Arc::new(store)
        }
    };

    match config.device.variant {
        Variant::Pill => run_dashboard::<PillMode>(&config, store).await,
        Variant::Clamp => run_dashboard::<ClampMode>(&config, store).await,
    }

    info!("Device dashboard stopped");
}

/// Simulation intents; only the clamp has them.
#[async_trait]
trait Simulate {
    async fn start_simulation(&self) -> Result<()>;
    async fn stop_simulation(&self) -> Result<()>;
}

#[async_trait]
impl Simulate for DeviceSyncController<PillMode> {
    async fn start_simulation(&self) -> Result<()> {
        Err(SyncError::Unsupported("simulation"))
    }

    async fn stop_simulation(&self) -> Result<()> {
        Err(SyncError::Unsupported("simulation"))
    }
}

#[async_trait]
impl Simulate for DeviceSyncController<ClampMode> {
    async fn start_simulation(&self) -> Result<()> {
        DeviceSyncController::<ClampMode>::start_simulation(self).await
    }

    async fn stop_simulation(&self) -> Result<()> {
        DeviceSyncController::<ClampMode>::stop_simulation(self).await
    }
}

#[derive(Debug, PartialEq)]
enum Command {
    Login { identifier: String, secret: String },
    Logout,
    Mode(String),
    Toggle,
    Simulate,
    Stop,
    Show,
    Help,
    Quit,
}

impl Command {
    /// Whether the command writes to the device record.
    fn writes(&self) -> bool {
        matches!(
            self,
            Command::Mode(_) | Command::Toggle | Command::Simulate | Command::Stop
        )
    }
}

/// Whether `command` may run. `signed_in` is `None` when the dashboard does
/// not require signing in.
fn allowed(command: &Command, signed_in: Option<bool>) -> bool {
    !command.writes() || signed_in != Some(false)
}

fn parse_command(line: &str) -> std::result::Result<Command, String> {
    let mut words = line.split_whitespace();
    let command = match (words.next(), words.next(), words.next()) {
        (Some("login"), Some(identifier), Some(secret)) => Command::Login {
            identifier: identifier.to_string(),
            secret: secret.to_string(),
        },
        (Some("logout"), None, None) => Command::Logout,
        (Some("mode"), Some(mode), None) => Command::Mode(mode.to_string()),
        (Some("toggle"), None, None) => Command::Toggle,
        (Some("simulate"), None, None) => Command::Simulate,
        (Some("stop"), None, None) => Command::Stop,
        (Some("show"), None, None) => Command::Show,
        (Some("help"), None, None) => Command::Help,
        (Some("quit") | Some("exit"), None, None) => Command::Quit,
        _ => return Err(format!("unrecognized command {:?}", line.trim())),
    };
    if words.next().is_some() {
        return Err(format!("unrecognized command {:?}", line.trim()));
    }
    Ok(command)
}

fn render<M: DeviceMode>(variant: Variant, record: &DeviceRecord<M>) -> String {
    match variant {
        Variant::Pill => format!(
            "mode={} temperature={} humidity={} luminosity={} pills A={} B={} C={}",
            record.mode,
            record.temperature,
            record.humidity,
            record.luminosity,
            record.pill_counts.a,
            record.pill_counts.b,
            record.pill_counts.c,
        ),
        Variant::Clamp => format!(
            "mode={} current={} A unit={} kWh device={}",
            record.mode, record.current_now, record.unit, record.connected,
        ),
    }
}

async fn run_dashboard<M: DeviceMode>(config: &Config, store: Arc<dyn RemoteStateStore>)
where
    DeviceSyncController<M>: Simulate,
{
    let variant = config.device.variant;
    let controller = Arc::new(
        DeviceSyncController::<M>::new(store, config.device.store_path())
            .with_scenario(SimulationScenario::from(&config.simulation)),
    );

    let gate = config.auth_required().then(|| {
        let auth = Arc::new(CredentialAuthGate::new(&config.auth.users));
        let gate = Arc::new(SessionGate::new(auth, controller.clone()));
        tokio::spawn(gate.clone().run());
        gate
    });
    let _public_subscription = match &gate {
        Some(_) => {
            println!("Sign in with: login <id> <secret>");
            None
        }
        None => Some(controller.subscribe().await),
    };

    let mut status = controller.watch_status();
    let status_task = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            println!("[{}]", current);
        }
    });
    let mut records = controller.watch_record();
    let record_task = tokio::spawn(async move {
        while records.changed().await.is_ok() {
            if let Some(record) = records.borrow_and_update().as_ref() {
                println!("{}", render(variant, record));
            }
        }
    });

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(e) => {
                println!("{e}; {HELP}");
                continue;
            }
        };
        let signed_in = gate.as_ref().map(|gate| gate.session().is_some());
        if !allowed(&command, signed_in) {
            println!("Sign in first: login <id> <secret>");
            continue;
        }

        let outcome = match command {
            Command::Quit => break,
            Command::Help => {
                println!("{HELP}");
                Ok(())
            }
            Command::Show => {
                match controller.current() {
                    Some(record) => {
                        println!("[{}] {}", controller.status(), render(variant, &record))
                    }
                    None => println!("[{}] no record yet", controller.status()),
                }
                Ok(())
            }
            Command::Login { identifier, secret } => match &gate {
                Some(gate) => match gate.login(&identifier, &secret).await {
                    Ok(session) => {
                        println!("Signed in as {}", session.identifier);
                        Ok(())
                    }
                    Err(e) => {
                        println!("{e}");
                        Ok(())
                    }
                },
                None => {
                    println!("This dashboard does not require signing in");
                    Ok(())
                }
            },
            Command::Logout => match &gate {
                Some(gate) => gate.logout().await,
                None => Ok(()),
            },
            Command::Mode(raw) => match raw.parse::<M>() {
                Ok(mode) => controller.set_mode(mode).await,
                Err(_) => {
                    println!("Unknown mode {raw:?}, expected {} or {}", M::ALL[0], M::ALL[1]);
                    Ok(())
                }
            },
            Command::Toggle => controller.toggle_mode().await.map(|mode| {
                println!("Requested mode {mode}");
            }),
            Command::Simulate => Simulate::start_simulation(&*controller).await,
            Command::Stop => Simulate::stop_simulation(&*controller).await,
        };

        if let Err(e) = outcome {
            println!("Error: {e}");
        }
    }

    status_task.abort();
    record_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            parse_command("login ops@example.com hunter2"),
            Ok(Command::Login {
                identifier: "ops@example.com".to_string(),
                secret: "hunter2".to_string(),
            })
        );
        assert_eq!(parse_command("  mode automatic "), Ok(Command::Mode("automatic".to_string())));
        assert_eq!(parse_command("exit"), Ok(Command::Quit));
        assert!(parse_command("mode").is_err());
        assert!(parse_command("toggle now").is_err());
        assert!(parse_command("login a b c").is_err());
    }

    #[test]
    fn test_writes_need_a_session_when_login_is_required() {
        let toggle = Command::Toggle;
        assert!(!allowed(&toggle, Some(false)));
        assert!(!allowed(&Command::Mode("automatic".to_string()), Some(false)));
        assert!(!allowed(&Command::Simulate, Some(false)));
        assert!(!allowed(&Command::Stop, Some(false)));
        assert!(allowed(&toggle, Some(true)));
        assert!(allowed(&toggle, None));

        // reading and signing in stay available
        assert!(allowed(&Command::Show, Some(false)));
        assert!(allowed(&Command::Logout, Some(false)));
        let login = parse_command("login ops@example.com hunter2").unwrap();
        assert!(allowed(&login, Some(false)));
    }

    #[test]
    fn test_render_clamp() {
        let record = DeviceRecord::<ClampMode>::default();
        assert_eq!(
            render(Variant::Clamp, &record),
            "mode=measurement current=0.000 A unit=0.000 kWh device=disconnected"
        );
    }
}
