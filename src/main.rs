mod config;
mod devices;
mod experiment;

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use config::{SessionConfig, Transport, DEFAULT_CONFIG_FILE};
#[cfg(feature = "visa")]
use devices::VisaBus;
use devices::{Bus, TcpBus};
use experiment::{MeasurementSession, SessionError, SessionPlan};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = SessionConfig::locate();
    let loaded = SessionConfig::load_from(config_path.as_deref());
    let log_dir = match &loaded {
        Ok(config) => config.log_dir.clone(),
        Err(_) => SessionConfig::default().log_dir,
    };

    // Held until exit so buffered log lines reach the file.
    let _guard = setup_logging(&log_dir);
    info!("Starting application");
    match &config_path {
        Some(path) => info!("Reading configuration from {}", path.display()),
        None => info!("No {} found, using defaults", DEFAULT_CONFIG_FILE),
    }

    let result = loaded
        .map_err(Box::<dyn std::error::Error>::from)
        .and_then(|config| run(&config));
    match result {
        Ok(path) => {
            println!("Results saved to {}", path.display());
        }
        Err(e) => {
            error!("Measurement failed: {}", e);
            eprintln!("Measurement failed: {}", e);
            return Err(e);
        }
    }

    info!("Application shutting down");
    Ok(())
}

fn run(config: &SessionConfig) -> Result<PathBuf, Box<dyn std::error::Error>> {
    info!("Using {:?}", config);

    let sample_count = prompt_sample_count()?;
    let destination = PathBuf::from(prompt("Enter the folder path to save the results: ")?);

    let plan = SessionPlan {
        campaign: config.campaign(sample_count),
        timeout: config.timeout(),
        destination,
        format: config.format,
        csv_file_name: config.csv_file_name.clone(),
    };

    let path = match config.transport {
        #[cfg(feature = "visa")]
        Transport::Visa => VisaBus::new(&config.resource_filter)
            .map_err(SessionError::Discovery)
            .and_then(|bus| acquire(bus, &plan)),
        // Rejected when the configuration is validated.
        #[cfg(not(feature = "visa"))]
        Transport::Visa => Err(SessionError::Discovery(devices::LinkError::FeatureNotEnabled(
            "visa".to_string(),
        ))),
        Transport::Tcp => acquire(TcpBus::new(config.tcp_addresses.clone()), &plan),
    }?;
    Ok(path)
}

fn acquire<B: Bus>(bus: B, plan: &SessionPlan) -> experiment::Result<PathBuf> {
    let mut session = MeasurementSession::new(bus);
    experiment::run_session(&mut session, plan)
}

fn setup_logging(log_dir: &Path) -> WorkerGuard {
    let file_appender = rolling::daily(log_dir, "scope-logger.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Everything goes to the daily file; warnings and errors also reach the console.
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_level(true),
        )
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .with_filter(LevelFilter::WARN),
        )
        .init();
    guard
}

fn prompt(message: &str) -> io::Result<String> {
    print!("{}", message);
    io::stdout().flush()?;

    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "input closed"));
    }
    Ok(line.trim().to_string())
}

fn prompt_sample_count() -> io::Result<usize> {
    loop {
        let answer = prompt("Enter the number of measurements to take: ")?;
        match answer.parse::<usize>() {
            Ok(n) if n > 0 => return Ok(n),
            _ => eprintln!("Please enter a positive whole number, got '{}'", answer),
        }
    }
}
