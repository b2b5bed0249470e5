use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

use super::{LinkError, Result, ScopeLink};

/// Parameter measurements available through `PAVA?` on a Siglent SDS scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    PeakToPeak,
    Rms,
    Frequency,
}

impl Metric {
    /// Query order used for every sample.
    pub const ALL: [Metric; 3] = [Metric::PeakToPeak, Metric::Rms, Metric::Frequency];

    pub fn code(self) -> &'static str {
        match self {
            Metric::PeakToPeak => "PKPK",
            Metric::Rms => "CRMS",
            Metric::Frequency => "FREQ",
        }
    }

    /// Unit suffix the scope appends to the value.
    pub fn unit(self) -> &'static str {
        match self {
            Metric::PeakToPeak | Metric::Rms => "V",
            Metric::Frequency => "Hz",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Analog input channel, `C1` to `C4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel(u8);

impl Channel {
    pub const COUNT: u8 = 4;

    pub fn new(number: u8) -> Option<Self> {
        (1..=Self::COUNT).contains(&number).then_some(Channel(number))
    }
}

impl Default for Channel {
    fn default() -> Self {
        Channel(1)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResponseError {
    #[error("no comma-separated value in response '{0}'")]
    MissingValue(String),

    #[error("expected a '{expected}' answer, got '{response}'")]
    UnexpectedMetric { expected: String, response: String },

    #[error("'{value}' in response '{response}' is not a number")]
    NotNumeric { value: String, response: String },
}

/// Header the scope puts in front of a `PAVA?` answer, e.g. `C1:PAVA PKPK`.
pub fn response_header(channel: Channel, metric: Metric) -> String {
    format!("{}:PAVA {}", channel, metric.code())
}

fn has_header(response: &str, header: &str) -> bool {
    response.split(',').next().map(str::trim) == Some(header)
}

/// Extracts the number from a `PAVA?` answer such as
/// `C1:PAVA PKPK,4.500000E+00V`.
///
/// The answer must carry the header of the channel and metric that were
/// asked for. The value is the second comma-separated field with the
/// metric's unit suffix removed. Non-finite values and the scope's `****`
/// placeholder are rejected.
pub fn parse_measurement(
    response: &str,
    channel: Channel,
    metric: Metric,
) -> std::result::Result<f64, ResponseError> {
    let field = response
        .split(',')
        .nth(1)
        .map(str::trim)
        .ok_or_else(|| ResponseError::MissingValue(response.to_string()))?;

    let expected = response_header(channel, metric);
    if !has_header(response, &expected) {
        return Err(ResponseError::UnexpectedMetric {
            expected,
            response: response.to_string(),
        });
    }

    let number = field.strip_suffix(metric.unit()).unwrap_or(field).trim();
    let not_numeric = || ResponseError::NotNumeric {
        value: field.to_string(),
        response: response.to_string(),
    };

    number
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(not_numeric)
}

pub fn metric_command(channel: Channel, metric: Metric) -> String {
    format!("{}:PAVA? {}", channel, metric.code())
}

/// Late answers to earlier queries skipped before giving up on a query.
const MAX_STALE_REPLIES: usize = 3;

/// A Siglent SDS oscilloscope on an exclusively owned link.
pub struct Oscilloscope<L: ScopeLink> {
    link: L,
}

impl<L: ScopeLink> Oscilloscope<L> {
    pub fn new(link: L) -> Self {
        info!(
            "Initializing oscilloscope at {} (timeout {:?})",
            link.resource(),
            link.timeout()
        );
        Oscilloscope { link }
    }

    pub fn resource(&self) -> &str {
        self.link.resource()
    }

    /// `*OPC?` readiness check; the scope answers `1` once idle.
    pub fn ready(&mut self) -> Result<()> {
        let status = self.link.query("*OPC?")?;
        if status.trim() != "1" {
            warn!("Unexpected *OPC? response: {}", status);
            return Err(LinkError::NotReady(status));
        }
        Ok(())
    }

    pub fn identify(&mut self) -> Result<String> {
        self.link.query("*IDN?")
    }

    /// Sends `<channel>:PAVA? <code>` and returns the matching answer.
    ///
    /// A `PAVA` answer for some other metric is a late reply to an earlier
    /// query that timed out; it is dropped and the next line read instead.
    /// After a timeout the link is cleared so the next query starts clean.
    pub fn query_metric(&mut self, channel: Channel, metric: Metric) -> Result<String> {
        let header = response_header(channel, metric);
        let mut result = self.link.query(&metric_command(channel, metric));
        let mut skipped = 0;
        while let Ok(response) = &result {
            let stale = response.contains(":PAVA ") && !has_header(response, &header);
            if !stale || skipped == MAX_STALE_REPLIES {
                break;
            }
            warn!("Discarding late reply '{}' while waiting for {}", response, header);
            skipped += 1;
            result = self.link.read();
        }

        if let Err(LinkError::Timeout(_)) = &result {
            if let Err(e) = self.link.clear() {
                warn!("Failed to clear {} after a timeout: {}", self.link.resource(), e);
            }
        }
        result
    }

    #[cfg(test)]
    pub fn into_link(self) -> L {
        self.link
    }
}
