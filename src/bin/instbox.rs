use arod_instbox::config::InstrumentConfig;
use arod_instbox::devices::iio::DEFAULT_IIO_DEVICE;
use arod_instbox::devices::{Devices, IioEnvironmentSensor, RigParams, SimulatedRig};
use arod_instbox::display::LogSurface;
use arod_instbox::link::TcpConnector;
use arod_instbox::runtime::InstrumentBox;
use clap::{App, Arg};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("arod-instbox")
        .version("0.1.0")
        .author("ATHENA Rods Team")
        .about("Instrument box runtime: reactor simulation, rod protection and hub links")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Hub address")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("ctrl-port")
                .long("ctrl-port")
                .value_name("PORT")
                .help("Hub control port")
                .takes_value(true)
                .validator(validate_port),
        )
        .arg(
            Arg::with_name("stream-port")
                .long("stream-port")
                .value_name("PORT")
                .help("Hub telemetry port")
                .takes_value(true)
                .validator(validate_port),
        )
        .arg(
            Arg::with_name("simulated")
                .short("s")
                .long("simulated")
                .help("Use the simulated environment sensor instead of the IIO device"),
        )
        .arg(
            Arg::with_name("iio")
                .long("iio")
                .value_name("DIR")
                .help("IIO device directory of the temperature/humidity sensor")
                .takes_value(true)
                .default_value(DEFAULT_IIO_DEVICE),
        )
        .get_matches();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = match matches.value_of("config") {
        Some(path) => InstrumentConfig::load(Path::new(path)).map_err(|e| {
            error!("Config {}: {}", path, e);
            e
        })?,
        None => InstrumentConfig::default(),
    };
    if let Some(host) = matches.value_of("host") {
        config.network.hub_host = host.to_string();
    }
    if let Some(port) = matches.value_of("ctrl-port") {
        config.network.ctrl_port = port.parse()?;
    }
    if let Some(port) = matches.value_of("stream-port") {
        config.network.stream_port = port.parse()?;
    }
    config.validate()?;

    let rig = Arc::new(SimulatedRig::new(RigParams::default()));
    let mut devices = Devices::simulated(&rig);
    if !matches.is_present("simulated") {
        let iio = matches.value_of("iio").unwrap_or(DEFAULT_IIO_DEVICE);
        info!("Environment sensor: {}", iio);
        devices.environment = Arc::new(IioEnvironmentSensor::new(iio));
    }

    info!(
        "Hub {} (control {}, stream {})",
        config.network.hub_host, config.network.ctrl_port, config.network.stream_port
    );
    let control = TcpConnector::new(config.network.ctrl_addr());
    let stream = TcpConnector::new(config.network.stream_addr());

    let running = InstrumentBox::new(config, devices)
        .with_rig(rig)
        .start(control, stream, LogSurface::default());

    let shutdown = running.events().shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received");
                shutdown.trigger();
            }
            Err(e) => error!("Cannot listen for interrupts: {}", e),
        }
    });

    let report = running.wait(SHUTDOWN_GRACE).await;
    if !report.aborted.is_empty() {
        error!("Tasks aborted at shutdown: {:?}", report.aborted);
    }
    Ok(())
}

fn validate_port(value: String) -> Result<(), String> {
    value
        .parse::<u16>()
        .map(|_| ())
        .map_err(|_| "Port must be a number between 0 and 65535".into())
}
