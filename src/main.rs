//! ==============================================================================
//! main.rs - sensorbox entry point
//! ==============================================================================
//!
//! purpose:
//!     parse the command line, load configuration, start logging, pick the
//!     peripherals for the operating mode and hand them to bring-up.
//!
//! responsibilities:
//!     - honour the developer jumper (forces development mode, no auto-run)
//!     - run the device until Ctrl-C
//!     - hold a halted device forever, feeding the watchdog
//!
//! relationships:
//!     - uses: sensorbox (lib.rs) for everything else
//!
//! ==============================================================================

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sensorbox::hal;
use sensorbox::{bring_up, status, BringUp, DeviceConfig, OperatingMode, Peripherals};

#[derive(Parser, Debug)]
#[command(name = "sensorbox", version, about = "Temperature sensor node")]
struct Cli {
    /// Path to sensorbox.toml (defaults to config/sensorbox.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Which peripherals to drive
    #[arg(long, value_enum, default_value_t = OperatingMode::Production)]
    mode: OperatingMode,
}

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // startup banner
    println!("===========================================================");
    println!("  SensorBox {}", env!("CARGO_PKG_VERSION"));
    println!("===========================================================");

    // step 1: load configuration
    let config = match &cli.config {
        Some(path) => DeviceConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => DeviceConfig::load_or_default(),
    };

    // step 2: logging, RUST_LOG wins over the config file
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    config.print_summary();

    // step 3: peripherals
    let dev_jumper = hal::dev_jumper_engaged(&config);
    let mode = if dev_jumper { OperatingMode::Development } else { cli.mode };
    let mut peripherals = Peripherals::for_mode(mode, &config).context("selecting peripherals")?;

    if dev_jumper {
        warn!("Developer jumper fitted: watchdog disabled, not starting");
        peripherals.display.init().context("initializing display")?;
        status::show_dev_mode(peripherals.display.as_mut()).context("drawing dev mode banner")?;
        return Ok(());
    }

    // step 4: bring-up, then run or hold
    match bring_up(config, peripherals).await {
        BringUp::Ready(mut device) => {
            device.run_until(shutdown_signal()).await;
            info!("Exiting");
        }
        BringUp::Halted(halted) => {
            error!("Device halted: {:?}", halted.reason());
            halted.hold().await;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        // without a signal handler the loop just runs until power-off
        error!("Could not listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
