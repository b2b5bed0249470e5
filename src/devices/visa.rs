use std::ffi::CString;
use std::io::{self, BufRead, BufReader, Write};
use std::time::Duration;
use tracing::{info, warn};
use visa_rs::enums::attribute::{AttrTmoValue, HasAttribute};
use visa_rs::enums::status::ErrorCode;
use visa_rs::prelude::*;
use visa_rs::VisaString;

use super::{Bus, LinkError, Result, ScopeLink};

/// Pause between writing a query and reading its answer.
const QUERY_SETTLE: Duration = Duration::from_millis(50);

fn visa_string(text: &str) -> Result<VisaString> {
    CString::new(text)
        .map(Into::into)
        .map_err(|_| LinkError::InvalidResource(text.to_string()))
}

/// Maps an I/O failure from a VISA session. The session reports its own
/// I/O timeout as a wrapped `VI_ERROR_TMO` rather than `TimedOut`.
fn link_error(err: io::Error, timeout: Duration) -> LinkError {
    let visa_timeout = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<visa_rs::Error>())
        .is_some_and(|e| matches!(e.0, ErrorCode::ErrorTmo));
    if visa_timeout {
        LinkError::Timeout(timeout)
    } else {
        LinkError::from_io(err, timeout)
    }
}

/// Instruments reachable through the system VISA library.
pub struct VisaBus {
    rm: DefaultRM,
    filter: String,
}

impl VisaBus {
    pub fn new(filter: &str) -> Result<Self> {
        let rm = DefaultRM::new()?;
        info!("Successfully initialized VISA resource manager");
        Ok(VisaBus {
            rm,
            filter: filter.to_string(),
        })
    }
}

impl Bus for VisaBus {
    type Link = VisaLink;

    fn discover(&self) -> Result<Vec<String>> {
        let expr = visa_string(&self.filter)?;
        // VISA reports "no match" as an error rather than an empty list.
        let mut list = match self.rm.find_res_list(&expr) {
            Ok(list) => list,
            Err(e) => {
                warn!("VISA found no resources matching '{}': {}", self.filter, e);
                return Ok(Vec::new());
            }
        };

        let mut found = Vec::new();
        while let Some(resource) = list.find_next()? {
            found.push(resource.to_string());
        }
        Ok(found)
    }

    fn open(&self, resource: &str, timeout: Duration) -> Result<Self::Link> {
        info!("Attempting to connect to {}", resource);
        let device = self
            .rm
            .open(&visa_string(resource)?, AccessMode::NO_LOCK, timeout)?;

        // The open timeout only covers the open itself; reads and writes use
        // the session's I/O timeout attribute.
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        match AttrTmoValue::new_checked(millis) {
            Some(attr) => device.set_attr(attr)?,
            None => warn!("Timeout {:?} is out of range for VISA, keeping the default", timeout),
        }
        Ok(VisaLink {
            device,
            resource: resource.to_string(),
            timeout,
        })
    }
}

/// An open VISA session. The session is closed when the link is dropped.
pub struct VisaLink {
    device: Instrument,
    resource: String,
    timeout: Duration,
}

impl ScopeLink for VisaLink {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn write(&mut self, command: &str) -> Result<()> {
        info!("Sending command to {}: {}", self.resource, command);
        let command_with_newline = format!("{}\n", command);
        self.device
            .write_all(command_with_newline.as_bytes())
            .map_err(|e| link_error(e, self.timeout))
    }

    fn read(&mut self) -> Result<String> {
        let mut response = String::new();
        BufReader::new(&self.device)
            .read_line(&mut response)
            .map_err(|e| link_error(e, self.timeout))?;
        let trimmed = response.trim().to_string();
        info!("Received response from {}: {}", self.resource, trimmed);
        Ok(trimmed)
    }

    fn clear(&mut self) -> Result<()> {
        warn!("Clearing {}", self.resource);
        self.device.clear()?;
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String> {
        self.write(command)?;
        std::thread::sleep(QUERY_SETTLE);
        let response = self.read()?;
        if response.is_empty() {
            return Err(LinkError::EmptyResponse(command.to_string()));
        }
        Ok(response)
    }
}
