use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::devices::sds::ResponseError;
use crate::devices::LinkError;

/// Marker written in place of a value that could not be acquired.
pub const ERROR_MARKER: &str = "ERROR";

/// Why a single measured field has no value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FieldError {
    #[error("instrument did not answer in time")]
    Timeout,

    #[error("query failed: {0}")]
    Query(String),

    #[error("unparseable response: {0}")]
    Parse(#[from] ResponseError),
}

impl From<LinkError> for FieldError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Timeout(_) => FieldError::Timeout,
            other => FieldError::Query(other.to_string()),
        }
    }
}

/// One measured field: a number, or the reason it is missing.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Value(f64),
    Error(FieldError),
}

impl Reading {
    pub fn value(&self) -> Option<f64> {
        match self {
            Reading::Value(v) => Some(*v),
            Reading::Error(_) => None,
        }
    }

    /// Cell text: the value through `format`, or [`ERROR_MARKER`].
    pub fn render(&self, format: impl Fn(f64) -> String) -> String {
        match self {
            Reading::Value(v) => format(*v),
            Reading::Error(_) => ERROR_MARKER.to_string(),
        }
    }
}

impl<E: Into<FieldError>> From<Result<f64, E>> for Reading {
    fn from(result: Result<f64, E>) -> Self {
        match result {
            Ok(v) => Reading::Value(v),
            Err(e) => Reading::Error(e.into()),
        }
    }
}

/// Current through and power dissipated in the shunt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Derived {
    pub current_rms: f64,
    pub current_pkpk: f64,
    pub power_rms: f64,
    pub power_pkpk: f64,
}

impl Derived {
    /// I = V / R, P = V * I.
    pub fn compute(pkpk: f64, rms: f64, shunt_ohms: f64) -> Self {
        let current_rms = rms / shunt_ohms;
        let current_pkpk = pkpk / shunt_ohms;
        Derived {
            current_rms,
            current_pkpk,
            power_rms: rms * current_rms,
            power_pkpk: pkpk * current_pkpk,
        }
    }
}

/// One row of a campaign. Derived values exist only when all three
/// measured fields do.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSample {
    timestamp: DateTime<Local>,
    pkpk: Reading,
    rms: Reading,
    frequency: Reading,
    derived: Option<Derived>,
}

impl MeasurementSample {
    pub fn from_readings(
        timestamp: DateTime<Local>,
        pkpk: Reading,
        rms: Reading,
        frequency: Reading,
        shunt_ohms: f64,
    ) -> Self {
        match (pkpk.value(), rms.value(), frequency.value()) {
            (Some(p), Some(r), Some(f)) => derive_sample(p, r, f, shunt_ohms, timestamp),
            _ => MeasurementSample {
                timestamp,
                pkpk,
                rms,
                frequency,
                derived: None,
            },
        }
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    pub fn pkpk(&self) -> &Reading {
        &self.pkpk
    }

    pub fn rms(&self) -> &Reading {
        &self.rms
    }

    pub fn frequency(&self) -> &Reading {
        &self.frequency
    }

    pub fn derived(&self) -> Option<&Derived> {
        self.derived.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.derived.is_some()
    }
}

pub fn derive_sample(
    pkpk: f64,
    rms: f64,
    frequency: f64,
    shunt_ohms: f64,
    timestamp: DateTime<Local>,
) -> MeasurementSample {
    MeasurementSample {
        timestamp,
        pkpk: Reading::Value(pkpk),
        rms: Reading::Value(rms),
        frequency: Reading::Value(frequency),
        derived: Some(Derived::compute(pkpk, rms, shunt_ohms)),
    }
}

/// Column set written for each sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// Epoch time plus the three measured values.
    Basic,
    /// Measured values, shunt current and power, and a local timestamp.
    #[default]
    Derived,
}

impl Layout {
    pub fn header(self) -> &'static [&'static str] {
        match self {
            Layout::Basic => &["Time (s)", "PKPK (V)", "RMS (V)", "Frequency (Hz)"],
            Layout::Derived => &[
                "RMS Voltage (V)",
                "Pk-Pk Voltage (V)",
                "Frequency (Hz)",
                "Current RMS (A)",
                "Current Pk-Pk (A)",
                "Power RMS (W)",
                "Power Pk-Pk (W)",
                "Timestamp",
            ],
        }
    }

    pub fn row(self, sample: &MeasurementSample) -> Vec<String> {
        match self {
            Layout::Basic => {
                let epoch = sample.timestamp.timestamp_millis() as f64 / 1000.0;
                vec![
                    format!("{:.3}", epoch),
                    sample.pkpk.render(|v| format_sig(v, 5)),
                    sample.rms.render(|v| format_sig(v, 5)),
                    sample.frequency.render(|v| format_sig(v, 5)),
                ]
            }
            Layout::Derived => {
                let derived = |pick: fn(&Derived) -> f64| {
                    sample
                        .derived
                        .as_ref()
                        .map(|d| pick(d).to_string())
                        .unwrap_or_default()
                };
                vec![
                    sample.rms.render(|v| v.to_string()),
                    sample.pkpk.render(|v| v.to_string()),
                    sample.frequency.render(|v| format_sig(v, 4)),
                    derived(|d| d.current_rms),
                    derived(|d| d.current_pkpk),
                    derived(|d| d.power_rms),
                    derived(|d| d.power_pkpk),
                    format_timestamp(sample.timestamp),
                ]
            }
        }
    }
}

pub fn format_timestamp(timestamp: DateTime<Local>) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Formats `value` with `digits` significant figures the way C's `%g` does:
/// fixed notation for moderate exponents, scientific otherwise, trailing
/// zeros removed.
pub fn format_sig(value: f64, digits: usize) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    let digits = digits.max(1);
    let sci = format!("{:.*e}", digits - 1, value);
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= digits as i32 {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_zeros(mantissa), sign, exponent.abs())
    } else {
        let decimals = (digits as i32 - 1 - exponent) as usize;
        trim_zeros(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn trim_zeros(number: &str) -> &str {
    if number.contains('.') {
        number.trim_end_matches('0').trim_end_matches('.')
    } else {
        number
    }
}

/// Samples of one campaign in acquisition order.
#[derive(Debug, Clone)]
pub struct ResultTable {
    layout: Layout,
    started_at: DateTime<Local>,
    samples: Vec<MeasurementSample>,
}

impl ResultTable {
    pub fn new(layout: Layout, started_at: DateTime<Local>) -> Self {
        ResultTable {
            layout,
            started_at,
            samples: Vec::new(),
        }
    }

    pub fn push(&mut self, sample: MeasurementSample) {
        self.samples.push(sample);
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn samples(&self) -> &[MeasurementSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn header(&self) -> &'static [&'static str] {
        self.layout.header()
    }

    pub fn rows(&self) -> impl Iterator<Item = Vec<String>> + '_ {
        self.samples.iter().map(|s| self.layout.row(s))
    }
}
