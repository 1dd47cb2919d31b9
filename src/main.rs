use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pow_mon::button::{ButtonHandler, ButtonWatcher, Debouncer};
use pow_mon::config::DaemonConfig;
use pow_mon::gpio::{self, BackendKind, Direction, Edge};
use pow_mon::power::{PowerController, ScriptHook};
use pow_mon::protocol::Dispatcher;
use pow_mon::server::{Server, ServerMode};
use pow_mon::utils::bind_tcp_listener;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// pow-mon command line arguments
#[derive(Parser, Debug)]
#[command(name = "pow-mon")]
#[command(version, about = "GPIO power-rail daemon with pushbutton and remote control", long_about = None)]
struct CliArgs {
    /// TCP port for the command protocol
    #[arg(value_name = "PORT", default_value_t = 8888, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Listen address
    #[arg(short = 'a', long, value_name = "ADDRESS", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// GPIO access method
    #[arg(short = 'b', long, value_enum, default_value = "cdev")]
    backend: BackendArg,

    /// GPIO character device (cdev backend)
    #[arg(long, value_name = "DEVICE", default_value = "/dev/gpiochip0")]
    gpio_chip: String,

    /// Memory device (register backend)
    #[arg(long, value_name = "DEVICE", default_value = "/dev/mem")]
    gpio_mem: String,

    /// sysfs GPIO class directory
    #[arg(long, value_name = "DIR", default_value = "/sys/class/gpio")]
    sysfs_root: PathBuf,

    /// Script run after the rail is switched on
    #[arg(long, value_name = "FILE", default_value = "/etc/pow-mon/power-up")]
    power_up_script: PathBuf,

    /// Script run after the rail is switched off
    #[arg(long, value_name = "FILE", default_value = "/etc/pow-mon/power-down")]
    power_down_script: PathBuf,

    /// Minimum time between accepted button presses
    #[arg(long, value_name = "MS", default_value_t = 2000)]
    debounce_ms: u64,

    /// Serve one client at a time
    #[arg(long)]
    serial: bool,

    /// GPIO switching the power rail
    #[arg(long, value_name = "PIN", default_value_t = 3)]
    power_pin: u32,

    /// GPIO reserved for the status LED
    #[arg(long, value_name = "PIN", default_value_t = 4)]
    led_pin: u32,

    /// GPIO wired to the pushbutton
    #[arg(long, value_name = "PIN", default_value_t = 2)]
    button_pin: u32,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Command line spelling of [`BackendKind`]
#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Register,
    Sysfs,
    Cdev,
    Simulated,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Register => BackendKind::Register,
            BackendArg::Sysfs => BackendKind::Sysfs,
            BackendArg::Cdev => BackendKind::Cdev,
            BackendArg::Simulated => BackendKind::Simulated,
        }
    }
}

impl CliArgs {
    fn to_config(&self) -> DaemonConfig {
        let mut config = DaemonConfig {
            port: self.port,
            bind: self.bind,
            debounce_ms: self.debounce_ms,
            ..Default::default()
        };
        config.gpio.backend = self.backend.into();
        config.gpio.chip = self.gpio_chip.clone();
        config.gpio.mem_device = self.gpio_mem.clone();
        config.gpio.sysfs_root = self.sysfs_root.clone();
        config.hooks.power_up = self.power_up_script.clone();
        config.hooks.power_down = self.power_down_script.clone();
        config.pins.power = self.power_pin;
        config.pins.led = self.led_pin;
        config.pins.button = self.button_pin;
        if self.serial {
            config.server.mode = ServerMode::Serial;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting pow-mon v{}", env!("CARGO_PKG_VERSION"));

    let config = args.to_config();
    config.validate()?;
    if let Ok(json) = serde_json::to_string(&config) {
        tracing::debug!("Configuration: {}", json);
    }

    // GPIO
    let gpio = gpio::open_backend(&config.gpio).context("Failed to open GPIO backend")?;
    let pins = config.pins;
    gpio.configure(pins.power, Direction::Output)
        .with_context(|| format!("Failed to configure power GPIO{}", pins.power))?;
    gpio.configure(pins.led, Direction::Output)
        .with_context(|| format!("Failed to configure LED GPIO{}", pins.led))?;
    let edges = gpio
        .subscribe_edge(pins.button, Edge::Falling)
        .with_context(|| format!("Failed to watch button GPIO{}", pins.button))?;

    // Power control
    let hook = Arc::new(ScriptHook::new(&config.hooks));
    let power = Arc::new(
        PowerController::new(gpio.clone(), pins.power, hook)
            .context("Failed to read initial power state")?,
    );

    // Button
    let (watcher, edge_rx) = ButtonWatcher::spawn(edges);
    let button = ButtonHandler::new(Debouncer::new(config.debounce_interval()), power.clone());

    // Network
    let dispatcher = Arc::new(Dispatcher::new(gpio.clone(), power, pins));
    let addr = config.listen_addr();
    let listener = bind_tcp_listener(addr).with_context(|| format!("Failed to bind {}", addr))?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    tracing::info!("Ready to accept commands on port {}", config.port);

    let server = Server::new(listener, dispatcher, button, edge_rx, config.server.clone());
    let result = server.run(shutdown_signal()).await;

    // Cleanup
    watcher.stop().await;
    if let Err(e) = gpio.release() {
        tracing::warn!("Failed to release GPIO backend: {}", e);
    }

    result?;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "pow_mon=error",
        LogLevel::Warn => "pow_mon=warn",
        LogLevel::Info => "pow_mon=info",
        LogLevel::Verbose => "pow_mon=debug,gpio_cdev=info",
        LogLevel::Debug => "pow_mon=debug,gpio_cdev=debug",
        LogLevel::Trace => "pow_mon=trace,gpio_cdev=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
