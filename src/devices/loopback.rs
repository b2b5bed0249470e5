//! Scripted in-memory instrument for tests.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use super::{Bus, LinkError, Result, ScopeLink};

const LOOPBACK_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Clone, Debug)]
pub enum Reply {
    Line(String),
    Timeout,
}

/// Answers queries from a script: one-shot replies first, then the sticky
/// reply for that command. Unknown commands time out.
pub struct LoopbackLink {
    resource: String,
    sticky: HashMap<String, String>,
    queued: HashMap<String, VecDeque<Reply>>,
    pending: Option<String>,
    sent: Vec<String>,
    clears: usize,
    closed: Option<Rc<RefCell<Vec<String>>>>,
}

impl LoopbackLink {
    pub fn new(resource: &str) -> Self {
        LoopbackLink {
            resource: resource.to_string(),
            sticky: HashMap::new(),
            queued: HashMap::new(),
            pending: None,
            sent: Vec::new(),
            clears: 0,
            closed: None,
        }
    }

    /// A link that behaves like a healthy scope measuring a steady signal.
    pub fn healthy(resource: &str) -> Self {
        LoopbackLink::new(resource)
            .respond("*OPC?", "1")
            .respond("*IDN?", "Siglent Technologies,SDS1202X-E,SDSMMFCD6R2214,1.3.27")
            .respond("C1:PAVA? PKPK", "C1:PAVA PKPK,4.500000E+00V")
            .respond("C1:PAVA? CRMS", "C1:PAVA CRMS,2.000000E+00V")
            .respond("C1:PAVA? FREQ", "C1:PAVA FREQ,1.000000E+03Hz")
    }

    pub fn respond(mut self, command: &str, response: &str) -> Self {
        self.sticky.insert(command.to_string(), response.to_string());
        self
    }

    pub fn respond_once(mut self, command: &str, reply: Reply) -> Self {
        self.queued
            .entry(command.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn sent(&self) -> &[String] {
        &self.sent
    }

    pub fn clears(&self) -> usize {
        self.clears
    }

    fn track_close(mut self, closed: Rc<RefCell<Vec<String>>>) -> Self {
        self.closed = Some(closed);
        self
    }
}

impl ScopeLink for LoopbackLink {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn timeout(&self) -> Duration {
        LOOPBACK_TIMEOUT
    }

    fn write(&mut self, command: &str) -> Result<()> {
        self.sent.push(command.to_string());
        self.pending = Some(command.to_string());
        Ok(())
    }

    fn read(&mut self) -> Result<String> {
        let command = self.pending.take().unwrap_or_default();
        let reply = self
            .queued
            .get_mut(&command)
            .and_then(VecDeque::pop_front)
            .or_else(|| self.sticky.get(&command).cloned().map(Reply::Line))
            .unwrap_or(Reply::Timeout);
        match reply {
            Reply::Line(line) => Ok(line.trim().to_string()),
            Reply::Timeout => Err(LinkError::Timeout(LOOPBACK_TIMEOUT)),
        }
    }

    fn clear(&mut self) -> Result<()> {
        self.clears += 1;
        Ok(())
    }
}

impl Drop for LoopbackLink {
    fn drop(&mut self) {
        if let Some(closed) = &self.closed {
            closed.borrow_mut().push(self.resource.clone());
        }
    }
}

/// A bus with a fixed device list handing out one prepared link.
pub struct LoopbackBus {
    devices: Vec<String>,
    link: RefCell<Option<LoopbackLink>>,
    pub opened: RefCell<Vec<String>>,
    pub closed: Rc<RefCell<Vec<String>>>,
}

impl LoopbackBus {
    pub fn new(devices: &[&str], link: LoopbackLink) -> Self {
        let closed = Rc::new(RefCell::new(Vec::new()));
        LoopbackBus {
            devices: devices.iter().map(|d| d.to_string()).collect(),
            link: RefCell::new(Some(link.track_close(Rc::clone(&closed)))),
            opened: RefCell::new(Vec::new()),
            closed,
        }
    }

    pub fn empty() -> Self {
        LoopbackBus::new(&[], LoopbackLink::new("LOOP::NONE"))
    }
}

impl Bus for LoopbackBus {
    type Link = LoopbackLink;

    fn discover(&self) -> Result<Vec<String>> {
        Ok(self.devices.clone())
    }

    fn open(&self, resource: &str, _timeout: Duration) -> Result<Self::Link> {
        self.opened.borrow_mut().push(resource.to_string());
        if !self.devices.iter().any(|d| d == resource) {
            return Err(LinkError::InvalidResource(resource.to_string()));
        }
        self.link
            .borrow_mut()
            .take()
            .ok_or_else(|| LinkError::Io(std::io::ErrorKind::AddrInUse.into()))
    }
}
