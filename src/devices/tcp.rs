use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{error, info, warn};

use super::{Bus, LinkError, Result, ScopeLink};

/// Default raw-socket SCPI port on Siglent SDS oscilloscopes.
pub const DEFAULT_SCPI_PORT: u16 = 5025;

/// Timeout used while trying configured addresses during discovery.
const DISCOVERY_TIMEOUT: Duration = Duration::from_millis(500);

/// Parses a socket resource into a socket address.
///
/// Accepts the VISA form `TCPIP[n]::<host>::<port>::SOCKET`, a bare
/// `<host>:<port>`, or a bare host (which gets the default SCPI port).
pub fn parse_socket_resource(resource: &str) -> Result<SocketAddr> {
    let invalid = || LinkError::InvalidResource(resource.to_string());

    let (host, port) = if resource.contains("::") {
        let parts: Vec<&str> = resource.split("::").collect();
        match parts.as_slice() {
            [board, host, port, "SOCKET"] if board.starts_with("TCPIP") => {
                (host.to_string(), port.parse::<u16>().map_err(|_| invalid())?)
            }
            _ => return Err(invalid()),
        }
    } else {
        match resource.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse::<u16>().map_err(|_| invalid())?),
            None => (resource.to_string(), DEFAULT_SCPI_PORT),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }

    (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|_| invalid())?
        .next()
        .ok_or_else(invalid)
}

/// Raw SCPI socket connection to one instrument.
pub struct TcpLink {
    resource: String,
    timeout: Duration,
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TcpLink {
    pub fn connect(resource: &str, timeout: Duration) -> Result<Self> {
        let socket_addr = parse_socket_resource(resource)?;
        info!("Attempting to connect to {} at {}", resource, socket_addr);

        let stream = TcpStream::connect_timeout(&socket_addr, timeout)
            .map_err(|e| LinkError::from_io(e, timeout))?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;

        let reader = BufReader::new(stream.try_clone()?);
        Ok(TcpLink {
            resource: resource.to_string(),
            timeout,
            writer: stream,
            reader,
        })
    }
}

impl ScopeLink for TcpLink {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn write(&mut self, command: &str) -> Result<()> {
        info!("Sending command to {}: {}", self.resource, command);
        let cmd = format!("{}\n", command);
        self.writer
            .write_all(cmd.as_bytes())
            .and_then(|_| self.writer.flush())
            .map_err(|e| LinkError::from_io(e, self.timeout))
    }

    fn read(&mut self) -> Result<String> {
        let mut response = String::new();
        let n = self
            .reader
            .read_line(&mut response)
            .map_err(|e| LinkError::from_io(e, self.timeout))?;
        if n == 0 {
            error!("{} closed the connection", self.resource);
            return Err(LinkError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "Connection closed by remote",
            )));
        }

        let trimmed = response.trim().to_string();
        info!("Received response from {}: {}", self.resource, trimmed);
        Ok(trimmed)
    }

    fn clear(&mut self) -> Result<()> {
        let buffered = self.reader.buffer().len();
        self.reader.consume(buffered);

        self.reader.get_ref().set_nonblocking(true)?;
        let mut scratch = [0_u8; 1024];
        let mut discarded = buffered;
        let drained = loop {
            match self.reader.get_mut().read(&mut scratch) {
                Ok(0) => break Ok(()),
                Ok(n) => discarded += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.reader.get_ref().set_nonblocking(false)?;

        if discarded > 0 {
            warn!("Discarded {} pending bytes from {}", discarded, self.resource);
        }
        drained.map_err(LinkError::Io)
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        let _ = self.writer.shutdown(std::net::Shutdown::Both);
        info!("Closed connection to {}", self.resource);
    }
}

/// A "bus" made of a fixed list of socket addresses.
///
/// Sockets cannot be enumerated, so discovery tries each configured address
/// and reports the ones that accept a connection.
pub struct TcpBus {
    addresses: Vec<String>,
}

impl TcpBus {
    pub fn new(addresses: Vec<String>) -> Self {
        TcpBus { addresses }
    }
}

impl Bus for TcpBus {
    type Link = TcpLink;

    fn discover(&self) -> Result<Vec<String>> {
        let mut found = Vec::new();
        for address in &self.addresses {
            let reachable = parse_socket_resource(address)
                .and_then(|addr| {
                    TcpStream::connect_timeout(&addr, DISCOVERY_TIMEOUT)
                        .map_err(|e| LinkError::from_io(e, DISCOVERY_TIMEOUT))
                });
            match reachable {
                Ok(_) => found.push(address.clone()),
                Err(e) => warn!("{} is not reachable: {}", address, e),
            }
        }
        Ok(found)
    }

    fn open(&self, resource: &str, timeout: Duration) -> Result<Self::Link> {
        TcpLink::connect(resource, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn parses_visa_socket_resources() {
        let addr = parse_socket_resource("TCPIP0::127.0.0.1::5025::SOCKET").unwrap();
        assert_eq!(addr, "127.0.0.1:5025".parse().unwrap());
    }

    #[test]
    fn parses_plain_addresses() {
        let addr = parse_socket_resource("127.0.0.1:6000").unwrap();
        assert_eq!(addr.port(), 6000);

        let addr = parse_socket_resource("127.0.0.1").unwrap();
        assert_eq!(addr.port(), DEFAULT_SCPI_PORT);
    }

    #[test]
    fn rejects_non_socket_resources() {
        for bad in [
            "USB0::0xF4EC::0xEE38::SDSMMFCD6R2214::INSTR",
            "TCPIP0::127.0.0.1::inst0::INSTR",
            "127.0.0.1:notaport",
            ":5025",
        ] {
            assert!(
                matches!(parse_socket_resource(bad), Err(LinkError::InvalidResource(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn queries_over_a_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0_u8; 64];
            let n = stream.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"C1:PAVA? PKPK\n");
            stream.write_all(b"C1:PAVA PKPK,4.500000E+00V\n").unwrap();
        });

        let mut link = TcpLink::connect(&addr.to_string(), Duration::from_secs(2)).unwrap();
        let response = link.query("C1:PAVA? PKPK").unwrap();
        assert_eq!(response, "C1:PAVA PKPK,4.500000E+00V");
        server.join().unwrap();
    }

    #[test]
    fn silent_instrument_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(500));
            drop(stream);
        });

        let timeout = Duration::from_millis(100);
        let mut link = TcpLink::connect(&addr.to_string(), timeout).unwrap();
        let err = link.query("*OPC?").unwrap_err();
        assert!(matches!(err, LinkError::Timeout(t) if t == timeout));
        server.join().unwrap();
    }

    #[test]
    fn discovery_keeps_reachable_addresses_only() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let live = listener.local_addr().unwrap().to_string();
        // Bind and drop to get a port nobody listens on.
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().to_string()
        };

        let bus = TcpBus::new(vec![dead, live.clone()]);
        assert_eq!(bus.discover().unwrap(), vec![live]);
    }

    #[test]
    fn clear_discards_pending_replies() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"C1:PAVA PKPK,4.5V\nC1:PAVA CRMS,2.0V\n").unwrap();
            let mut buf = [0_u8; 64];
            let n = stream.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"*OPC?\n");
            stream.write_all(b"1\n").unwrap();
        });

        let mut link = TcpLink::connect(&addr.to_string(), Duration::from_secs(2)).unwrap();
        thread::sleep(Duration::from_millis(100));
        link.clear().unwrap();
        assert_eq!(link.query("*OPC?").unwrap(), "1");
        server.join().unwrap();
    }
}
