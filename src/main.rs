//! Autonomous rover control daemon: RTK GNSS positioning, waypoint
//! navigation, differential drive.
//!
//! Usage:
//!   rtk-rover -c /etc/rtk-rover/rover.conf
//!   rtk-rover -c /etc/rtk-rover/rover.conf --stderr     # log to stderr
//!   rtk-rover --simulate                                # no motor hardware

mod config;
mod error;
mod gnss;
mod motor;
mod nav;
mod nmea;
mod ntrip;
mod rover;
mod rtcm;
mod rtk;
mod telemetry;
mod util;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use crate::gnss::GnssReceiver;
use crate::motor::{HBridgeDriver, HBridgePins, MotorController, MotorDriver, SimulatedDriver};
use crate::nav::Navigator;
use crate::ntrip::NtripClient;
use crate::rover::{RoverConfig, RoverCoordinator};
use crate::rtk::RtkCoordinator;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "rtk-rover", about = "RTK rover control core: GNSS, navigation, motors")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", default_value = "/etc/rtk-rover/rover.conf")]
    config: PathBuf,

    /// Log to stderr instead of syslog (useful for debugging).
    #[arg(long)]
    stderr: bool,

    /// Use the simulation motor driver regardless of configuration.
    #[arg(long)]
    simulate: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("rtk-rover: config error: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = config::validate_config(&cfg) {
        eprintln!("rtk-rover: config validation: {e}");
        process::exit(1);
    }

    let use_syslog = cfg.log_syslog && !cli.stderr;
    setup_logging(use_syslog).expect("failed to set up logging");

    // Install the TLS provider (must happen before any TLS use).
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install TLS crypto provider");

    info!("rtk-rover starting (serial={})", cfg.serial_port);

    // ── RTK pipeline ──────────────────────────────────────────────────────────
    let receiver = Arc::new(GnssReceiver::new(&cfg.serial_port));
    let ntrip = cfg.ntrip().map(|ntrip_cfg| {
        Arc::new(NtripClient::new(ntrip_cfg, Box::new(|| None)))
    });
    let rtk = Arc::new(RtkCoordinator::new(receiver, ntrip.clone()));

    // Real GGA for the caster handshake once fixes exist; the cell keeps the
    // client from owning the coordinator.
    if let Some(client) = &ntrip {
        let cell = rtk.position_cell();
        client.set_gga_source(Box::new(move || {
            cell.lock().unwrap().as_ref().map(|p| {
                nmea::build_gga(p.lat, p.lon, p.altitude, p.satellites as u8, p.hdop)
            })
        }));
    }

    if let Err(e) = RtkCoordinator::start(&rtk).await {
        error!("RTK pipeline failed to start: {e}");
        process::exit(1);
    }

    // ── Motors ────────────────────────────────────────────────────────────────
    let driver: Arc<dyn MotorDriver> = if cli.simulate || !cfg.motor_use_gpio {
        info!("using simulation motor driver");
        Arc::new(SimulatedDriver::new())
    } else {
        Arc::new(HBridgeDriver::new(
            HBridgePins {
                in1:      cfg.motor_left_in1,
                in2:      cfg.motor_left_in2,
                pwm_chan: cfg.motor_left_pwm,
            },
            HBridgePins {
                in1:      cfg.motor_right_in1,
                in2:      cfg.motor_right_in2,
                pwm_chan: cfg.motor_right_pwm,
            },
        ))
    };
    let motors = Arc::new(MotorController::new(driver, cfg.motor()));

    // ── Navigation and the rover root ─────────────────────────────────────────
    let navigator = Arc::new(Navigator::new(cfg.navigator()));
    let rover = Arc::new(RoverCoordinator::new(
        navigator,
        motors,
        Arc::clone(&rtk),
        RoverConfig { update_interval: cfg.update_interval() },
    ));

    if let Err(e) = RoverCoordinator::start(&rover) {
        error!("rover coordinator failed to start: {e}");
        rtk.stop().await;
        process::exit(1);
    }

    info!("rtk-rover running; Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("signal wait failed: {e}");
    }

    info!("shutdown requested");
    rover.stop().await;
    rtk.stop().await;
    info!("rtk-rover stopped");
}

// ── Logging setup ─────────────────────────────────────────────────────────────

fn setup_logging(use_syslog: bool) -> anyhow::Result<()> {
    if use_syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process:  "rtk-rover".into(),
            pid:      process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| anyhow::anyhow!("syslog connect failed: {e}"))?;
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map(|()| log::set_max_level(log::LevelFilter::Info))
            .map_err(|e| anyhow::anyhow!("set_logger: {e}"))?;
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    }
    Ok(())
}
