pub mod sds;
pub mod tcp;
#[cfg(feature = "visa")]
pub mod visa;
#[cfg(test)]
pub mod loopback;

use std::time::Duration;
use thiserror::Error;

pub use sds::{Channel, Metric, Oscilloscope};
pub use tcp::TcpBus;
#[cfg(feature = "visa")]
pub use visa::VisaBus;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Instrument returned an empty response to '{0}'")]
    EmptyResponse(String),

    #[error("Instrument answered '{0}' to *OPC?")]
    NotReady(String),

    #[error("Invalid resource string: {0}")]
    InvalidResource(String),

    #[error("Transport '{0}' is not enabled in this build")]
    FeatureNotEnabled(String),

    #[cfg(feature = "visa")]
    #[error("VISA error: {0}")]
    Visa(#[from] visa_rs::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;

impl LinkError {
    /// Maps an I/O failure on a link with the given timeout, turning the
    /// "no data yet" kinds into [`LinkError::Timeout`].
    pub fn from_io(err: std::io::Error, timeout: Duration) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                LinkError::Timeout(timeout)
            }
            _ => LinkError::Io(err),
        }
    }
}

/// Half-duplex text command/response channel to a single instrument.
///
/// Commands go out newline-terminated, responses come back as one trimmed
/// line. A link is never shared: each call completes before the next begins.
pub trait ScopeLink {
    /// Resource string this link was opened with.
    fn resource(&self) -> &str;

    /// Timeout bounding each read and write.
    fn timeout(&self) -> Duration;

    fn write(&mut self, command: &str) -> Result<()>;

    fn read(&mut self) -> Result<String>;

    /// Drops any input still pending on the link, e.g. a reply that arrived
    /// after its query timed out.
    fn clear(&mut self) -> Result<()> {
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String> {
        self.write(command)?;
        let response = self.read()?;
        if response.is_empty() {
            return Err(LinkError::EmptyResponse(command.to_string()));
        }
        Ok(response)
    }
}

/// An instrument bus that can be scanned for resources and open links to them.
pub trait Bus {
    type Link: ScopeLink;

    fn discover(&self) -> Result<Vec<String>>;

    fn open(&self, resource: &str, timeout: Duration) -> Result<Self::Link>;
}
