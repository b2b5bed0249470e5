pub mod data;
pub mod storage;

use crate::devices::sds::parse_measurement;
use crate::devices::{Bus, Channel, LinkError, Metric, Oscilloscope};
use chrono::{DateTime, Local};
use data::{FieldError, Layout, MeasurementSample, Reading, ResultTable};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use storage::OutputFormat;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No instruments found. Please check your connections.")]
    NoInstrument,

    #[error("Bus scan failed: {0}")]
    Discovery(#[source] LinkError),

    #[error("Failed to connect to {resource}: {source}")]
    Connection {
        resource: String,
        #[source]
        source: LinkError,
    },

    #[error("Cannot {operation} while the session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Filesystem error at {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Workbook error: {0}")]
    Workbook(#[from] rust_xlsxwriter::XlsxError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Lifecycle of a session. Transitions only move forward; `Failed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connected,
    Acquiring,
    Completed,
    Persisted,
    Failed,
}

/// Parameters of one acquisition campaign.
#[derive(Debug, Clone)]
pub struct CampaignConfig {
    pub channel: Channel,
    pub shunt_ohms: f64,
    pub sample_count: usize,
    pub inter_sample_delay: Duration,
    pub layout: Layout,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            channel: Channel::default(),
            shunt_ohms: 100.0,
            sample_count: 3,
            inter_sample_delay: Duration::from_secs(1),
            layout: Layout::Derived,
        }
    }
}

/// One bounded acquisition campaign against one instrument.
pub struct MeasurementSession<B: Bus> {
    bus: B,
    state: SessionState,
    scope: Option<Oscilloscope<B::Link>>,
    last_timestamp: Option<DateTime<Local>>,
}

impl<B: Bus> MeasurementSession<B> {
    pub fn new(bus: B) -> Self {
        MeasurementSession {
            bus,
            state: SessionState::Idle,
            scope: None,
            last_timestamp: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    #[cfg(test)]
    pub fn bus(&self) -> &B {
        &self.bus
    }

    fn expect_state(&self, expected: SessionState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    pub fn discover(&self) -> Result<Vec<String>> {
        let devices = self.bus.discover().map_err(SessionError::Discovery)?;
        if devices.is_empty() {
            warn!("No instruments found on the bus");
        } else {
            let listing = instrument_listing(&devices);
            info!("{}", listing);
            println!("{}", listing);
        }
        Ok(devices)
    }

    /// Opens `resource` and checks it answers `*OPC?`. Any failure leaves the
    /// session `Failed`.
    pub fn connect(&mut self, resource: &str, timeout: Duration) -> Result<()> {
        self.expect_state(SessionState::Idle, "connect")?;
        info!("Connecting to: {}", resource);

        let link = self.bus.open(resource, timeout).map_err(|source| {
            self.state = SessionState::Failed;
            SessionError::Connection {
                resource: resource.to_string(),
                source,
            }
        })?;
        let mut scope = Oscilloscope::new(link);

        if let Err(source) = scope.ready() {
            self.state = SessionState::Failed;
            return Err(SessionError::Connection {
                resource: resource.to_string(),
                source,
            });
        }

        match scope.identify() {
            Ok(id) => info!("Connected to: {}", id),
            Err(e) => warn!("{} did not identify itself: {}", resource, e),
        }

        self.scope = Some(scope);
        self.state = SessionState::Connected;
        Ok(())
    }

    /// Timestamps never go backwards even if the wall clock does.
    fn next_timestamp(&mut self) -> DateTime<Local> {
        let now = Local::now();
        let stamp = match self.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_timestamp = Some(stamp);
        stamp
    }

    fn acquire(&mut self, channel: Channel, metric: Metric) -> Reading {
        let Some(scope) = self.scope.as_mut() else {
            return Reading::Error(FieldError::Query("not connected".to_string()));
        };
        let reading: Reading = scope
            .query_metric(channel, metric)
            .map_err(FieldError::from)
            .and_then(|response| {
                parse_measurement(&response, channel, metric).map_err(FieldError::from)
            })
            .into();
        if let Reading::Error(e) = &reading {
            warn!("Error retrieving {}: {}", metric, e);
        }
        reading
    }

    pub fn run_campaign(&mut self, config: &CampaignConfig) -> Result<ResultTable> {
        self.expect_state(SessionState::Connected, "run a campaign")?;
        self.state = SessionState::Acquiring;
        info!(
            "Starting campaign: {} samples on {}, shunt {} Ω, delay {:?}",
            config.sample_count, config.channel, config.shunt_ohms, config.inter_sample_delay
        );

        let mut table = ResultTable::new(config.layout, Local::now());
        for i in 0..config.sample_count {
            let timestamp = self.next_timestamp();
            let [pkpk, rms, frequency] = Metric::ALL.map(|m| self.acquire(config.channel, m));

            let sample =
                MeasurementSample::from_readings(timestamp, pkpk, rms, frequency, config.shunt_ohms);
            let row = config.layout.row(&sample);
            info!("Measurement {}: {:?}", i + 1, row);
            println!("Measurement {}: {}", i + 1, row.join(", "));
            table.push(sample);

            if i + 1 < config.sample_count {
                std::thread::sleep(config.inter_sample_delay);
            }
        }

        let complete = table.samples().iter().filter(|s| s.is_complete()).count();
        info!("Campaign finished: {} samples, {} complete", table.len(), complete);
        self.state = SessionState::Completed;
        Ok(table)
    }

    /// Writes the table. CSV appends to the file at `destination`; the
    /// workbook format creates a new file inside the `destination` folder.
    pub fn persist(
        &mut self,
        table: ResultTable,
        destination: &Path,
        format: OutputFormat,
    ) -> Result<PathBuf> {
        self.expect_state(SessionState::Completed, "persist")?;
        let path = match format {
            OutputFormat::Csv => storage::append_csv(&table, destination)?,
            OutputFormat::Workbook => storage::write_workbook(&table, destination)?,
        };
        self.state = SessionState::Persisted;
        Ok(path)
    }

    /// Releases the instrument handle. Dropping the session does the same.
    pub fn close(&mut self) {
        if let Some(scope) = self.scope.take() {
            info!("Releasing {}", scope.resource());
        }
    }
}

/// Numbered device list shown to the operator after a scan.
fn instrument_listing(devices: &[String]) -> String {
    let mut listing = String::from("Available instruments:");
    for (i, device) in devices.iter().enumerate() {
        listing.push_str(&format!("\n{}. {}", i + 1, device));
    }
    listing
}

/// Everything [`run_session`] needs besides the bus.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub campaign: CampaignConfig,
    pub timeout: Duration,
    pub destination: PathBuf,
    pub format: OutputFormat,
    pub csv_file_name: String,
}

impl SessionPlan {
    /// Output target handed to [`MeasurementSession::persist`].
    pub fn output_path(&self) -> PathBuf {
        match self.format {
            OutputFormat::Csv => self.destination.join(&self.csv_file_name),
            OutputFormat::Workbook => self.destination.clone(),
        }
    }
}

/// Discover, connect to the first instrument, acquire and persist.
///
/// Aborts before connecting, and before touching the destination, when the
/// bus reports no instruments.
pub fn run_session<B: Bus>(session: &mut MeasurementSession<B>, plan: &SessionPlan) -> Result<PathBuf> {
    let started = Instant::now();

    let devices = session.discover()?;
    let Some(resource) = devices.first() else {
        error!("No instruments found. Aborting before any connection attempt");
        return Err(SessionError::NoInstrument);
    };

    session.connect(resource, plan.timeout)?;
    let table = session.run_campaign(&plan.campaign)?;
    let path = session.persist(table, &plan.output_path(), plan.format)?;
    session.close();

    info!(
        "Measurement completed in {:.2} s. Data saved in {}",
        started.elapsed().as_secs_f64(),
        path.display()
    );
    Ok(path)
}
