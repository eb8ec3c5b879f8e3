//! Multical 402 reader service
//!
//! Reads a Kamstrup Multical 402 heat meter through an optical head and
//! logs each configured sensor once per poll cycle.

use std::path::PathBuf;

use clap::Parser;
use common::bootstrap_args::ServiceArgs;
use common::service_bootstrap::{self, LoggingOptions, ServiceInfo};
use errors::ServiceResult;
use tracing::{error, info};

use multical402::core::config::AppConfig;
use multical402::core::{Multical402Component, SerialUart, Uart};
use multical402::protocols::kmp::{MeterSimulator, RegisterId};
use multical402::runtime::{self, RuntimeOptions};

#[derive(Parser, Debug)]
#[command(name = "multical402", version, about = "Kamstrup Multical 402 heat meter reader")]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "MC402_CONFIG")]
    config: Option<PathBuf>,

    /// Poll a built-in simulated meter instead of the serial port
    #[arg(long)]
    simulate: bool,

    /// Exit after this many poll cycles
    #[arg(long)]
    cycles: Option<u64>,

    #[command(flatten)]
    service: ServiceArgs,
}

/// Publishes by logging, one per configured sensor
struct LogSensor {
    name: String,
    decimals: usize,
    unit: &'static str,
}

impl multical402::Sensor for LogSensor {
    fn publish_state(&mut self, value: f64) {
        info!("{}: {:.*} {}", self.name, self.decimals, value, self.unit);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run_service(args).await {
        eprintln!("multical402: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run_service(args: Args) -> ServiceResult<()> {
    let config = AppConfig::load(args.config.as_deref())?;

    // CLI level wins unless left at its default
    let level = if args.service.debug || args.service.log_level != "info" {
        args.service.effective_log_level()
    } else {
        config.service.log_level.clone()
    };

    let service_info = ServiceInfo::new(
        config.service.name.as_str(),
        env!("CARGO_PKG_VERSION"),
        "Kamstrup Multical 402 heat meter reader (KMP)",
    );
    service_bootstrap::init_logging(
        &service_info,
        &LoggingOptions {
            level: &level,
            log_dir: config.service.log_dir.as_deref(),
            to_file: config.service.log_to_file,
            json: config.service.log_json,
            ansi: !args.service.no_color,
        },
    )?;
    if !args.service.no_color {
        service_bootstrap::print_startup_banner(&service_info);
    }

    if let Err(e) = config.validate(args.simulate) {
        error!("Invalid configuration: {}", e);
        return Err(e.into());
    }
    if args.service.validate {
        info!("Validation completed successfully");
        return Ok(());
    }

    let uart: Box<dyn Uart> = if args.simulate {
        info!("Using simulated meter");
        Box::new(MeterSimulator::with_default_readings(
            config.meter.destination,
        ))
    } else {
        Box::new(SerialUart::open(&config.uart)?)
    };

    let mut component = Multical402Component::new(
        uart,
        config.meter.poll_config(),
        config.meter.update_interval,
    );
    for (register, sensor) in config.sensors.enabled() {
        component.set_sensor(
            register,
            log_sensor(register, sensor.display_name(register)),
        );
    }
    component.setup();
    component.dump_config();

    let options = RuntimeOptions {
        max_cycles: args.cycles,
        ..Default::default()
    };
    let summary = runtime::run(
        &mut component,
        options,
        common::shutdown::wait_for_shutdown(),
    )
    .await;

    info!(
        "Stopped after {} cycles: {} values, {} retries, {} stale, {} overruns",
        summary.cycles,
        summary.stats.values,
        summary.stats.retries,
        summary.stats.stale,
        summary.overruns
    );
    Ok(())
}

fn log_sensor(register: RegisterId, name: String) -> LogSensor {
    let request = register.request();
    LogSensor {
        name,
        decimals: request.accuracy_decimals as usize,
        unit: request.sensor_unit,
    }
}
