// stage-monitor: inspect the stage without owning it
//
// `positions` and `config` only attach to the shared memory published by the
// process running the StageManager. `diagnose` talks to the controller directly
// but only sends queries (STA?, POS?), never motion commands.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use probe_stage::config::{
    CONFIG_SHM_NAME, DEFAULT_BAUDRATE, DEFAULT_COM_PORT, POSITION_SHM_NAME, ShmOptions,
};
use probe_stage::motor::Transport;
use probe_stage::motor::protocol::{self, Command};
use probe_stage::shm::{ConfigBlock, PositionBlock, PositionSnapshot};
use probe_stage::{Axis, StageError};

#[derive(Parser)]
#[command(name = "stage-monitor", about = "Inspect the probe-station stage")]
struct Cli {
    /// Directory holding the shared memory segments
    #[arg(long, global = true)]
    shm_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Print the published positions
    Positions {
        #[arg(long, default_value = POSITION_SHM_NAME)]
        name: String,
        /// Keep printing at this interval (ms)
        #[arg(long)]
        watch: Option<u64>,
    },
    /// Print a JSON configuration block
    Config {
        /// Block name (stage_config, ldc_config, ...)
        #[arg(long, default_value = CONFIG_SHM_NAME)]
        name: String,
    },
    /// Query status and position of every axis (read-only)
    Diagnose {
        #[arg(long, default_value = DEFAULT_COM_PORT)]
        port: String,
        #[arg(long, default_value_t = DEFAULT_BAUDRATE)]
        baudrate: u32,
        /// Reply timeout (ms)
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .init();

    let cli = Cli::parse();
    let shm = match cli.shm_dir {
        Some(dir) => ShmOptions::in_dir(dir),
        None => ShmOptions::default(),
    };

    let result = match cli.command {
        Mode::Positions { name, watch } => show_positions(&shm, &name, watch).await,
        Mode::Config { name } => show_config(&shm, &name),
        Mode::Diagnose {
            port,
            baudrate,
            timeout,
        } => diagnose(&port, baudrate, Duration::from_millis(timeout)).await,
    };

    if let Err(e) = result {
        eprintln!("stage-monitor: {}", e);
        std::process::exit(1);
    }
}

fn print_snapshot(snapshot: &PositionSnapshot) {
    println!("t = {:.3} s", snapshot.timestamp);
    for axis in Axis::ALL {
        println!(
            "  {:<15} {:>14.3} {}  {}",
            axis.name(),
            snapshot.position(axis),
            snapshot.units,
            if snapshot.homed(axis) { "homed" } else { "-" }
        );
    }
}

async fn show_positions(shm: &ShmOptions, name: &str, watch: Option<u64>) -> Result<(), StageError> {
    let block = PositionBlock::attach(&shm.dir, name)?;
    let Some(interval_ms) = watch else {
        print_snapshot(&block.read()?);
        return Ok(());
    };

    let mut tick = tokio::time::interval(Duration::from_millis(interval_ms.max(10)));
    let mut last = f64::NAN;
    loop {
        tick.tick().await;
        let snapshot = block.read()?;
        if snapshot.timestamp != last {
            last = snapshot.timestamp;
            print_snapshot(&snapshot);
        }
    }
}

fn show_config(shm: &ShmOptions, name: &str) -> Result<(), StageError> {
    let block = ConfigBlock::attach(&shm.dir, name)?;
    let value: serde_json::Value = block.read()?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn diagnose(port: &str, baudrate: u32, timeout: Duration) -> Result<(), StageError> {
    info!("Opening {} at {} baud (read-only sweep)", port, baudrate);
    let transport = Transport::open(port, baudrate, timeout)?;

    let mut responding = 0;
    for axis in Axis::ALL {
        let status = match transport.query(axis.prefix(), &Command::Status.encode()).await {
            Ok(reply) => protocol::parse_status(&reply),
            Err(e) => Err(e),
        };
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                println!("  {:<15} NO RESPONSE ({})", axis.name(), e);
                continue;
            }
        };
        responding += 1;

        let position = transport
            .query(axis.prefix(), &Command::Position.encode())
            .await
            .and_then(|reply| protocol::parse_position(&reply));
        match position {
            Ok((theoretical, actual)) => println!(
                "  {:<15} status {:#04x} {:?}  theoretical {:.3} um  actual {:.3} um",
                axis.name(),
                status.bits(),
                status,
                theoretical,
                actual
            ),
            Err(e) => println!("  {:<15} status {:#04x}  position unreadable ({})", axis.name(), status.bits(), e),
        }
    }

    if responding < Axis::ALL.len() {
        warn!("{} of {} axes responded", responding, Axis::ALL.len());
    } else {
        info!("All axes responded");
    }
    transport.close().await;
    Ok(())
}
