use crate::error::{IndiError, Result};
use log::{debug, info};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Upper bound on bytes pulled in one `read_available` call
const MAX_READ_PER_CALL: usize = 4 * 1024 * 1024;
const READ_CHUNK: usize = 64 * 1024;

/// Byte stream to an INDI server
pub trait Transport: Send {
    /// Write a complete protocol message
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Return whatever bytes arrive within `max_wait`; empty on timeout.
    /// A zero wait never blocks.
    fn read_available(&mut self, max_wait: Duration) -> Result<Vec<u8>>;

    /// Release the connection. Safe to call more than once.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// TCP connection to an INDI server
pub struct TcpTransport {
    stream: Option<TcpStream>,
    address: String,
}

impl TcpTransport {
    pub fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        write_timeout: Duration,
    ) -> Result<Self> {
        let address = format!("{}:{}", host, port);
        info!("📡 Connecting to INDI server at {}", address);

        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| IndiError::Connection(format!("cannot resolve {}: {}", address, e)))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true).map_err(socket_error)?;
                    stream
                        .set_write_timeout(Some(write_timeout))
                        .map_err(socket_error)?;
                    info!("✅ Connected to INDI server at {}", addr);
                    return Ok(Self {
                        stream: Some(stream),
                        address,
                    });
                }
                Err(e) => {
                    debug!("Connection attempt to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(IndiError::Connection(match last_error {
            Some(e) => format!("cannot connect to {}: {}", address, e),
            None => format!("no addresses found for {}", address),
        }))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| IndiError::Connection("not connected".to_string()))
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream()?;
        stream
            .write_all(bytes)
            .and_then(|_| stream.flush())
            .map_err(|e| IndiError::Connection(format!("write failed: {}", e)))
    }

    fn read_available(&mut self, max_wait: Duration) -> Result<Vec<u8>> {
        let stream = self.stream()?;
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut received = Vec::new();

        // First read waits up to max_wait; follow-ups only drain what is already queued
        if max_wait.is_zero() {
            stream.set_nonblocking(true).map_err(socket_error)?;
        } else {
            stream.set_nonblocking(false).map_err(socket_error)?;
            stream.set_read_timeout(Some(max_wait)).map_err(socket_error)?;
        }

        let result = loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    if received.is_empty() {
                        break Err(IndiError::Connection(
                            "connection closed by server".to_string(),
                        ));
                    }
                    // Hand over what we have; the next call reports the close
                    break Ok(());
                }
                Ok(n) => {
                    received.extend_from_slice(&chunk[..n]);
                    if received.len() >= MAX_READ_PER_CALL {
                        break Ok(());
                    }
                    if let Err(e) = stream.set_nonblocking(true) {
                        break Err(socket_error(e));
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    break Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break Err(IndiError::Connection(format!("read failed: {}", e))),
            }
        };

        stream.set_nonblocking(false).map_err(socket_error)?;
        result.map(|_| received)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            info!("🔌 Disconnected from INDI server at {}", self.address);
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

/// Socket option failures end the session like read and write failures
fn socket_error(e: io::Error) -> IndiError {
    IndiError::Connection(format!("socket option failed: {}", e))
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub(crate) struct MockState {
        pub sent: Vec<String>,
        pub inbound: VecDeque<Vec<u8>>,
        pub closed_by_peer: bool,
    }

    /// In-memory transport: records sent messages and replays scripted chunks
    #[derive(Clone, Default)]
    pub(crate) struct MockTransport {
        pub state: Arc<Mutex<MockState>>,
        open: bool,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                state: Arc::default(),
                open: true,
            }
        }

        pub fn push_inbound(&self, xml: &str) {
            self.state
                .lock()
                .unwrap()
                .inbound
                .push_back(xml.as_bytes().to_vec());
        }

        pub fn sent(&self) -> Vec<String> {
            self.state.lock().unwrap().sent.clone()
        }

        pub fn hang_up(&self) {
            self.state.lock().unwrap().closed_by_peer = true;
        }
    }

    impl Transport for MockTransport {
        fn send(&mut self, bytes: &[u8]) -> Result<()> {
            if !self.open {
                return Err(IndiError::Connection("not connected".to_string()));
            }
            self.state
                .lock()
                .unwrap()
                .sent
                .push(String::from_utf8_lossy(bytes).into_owned());
            Ok(())
        }

        fn read_available(&mut self, _max_wait: Duration) -> Result<Vec<u8>> {
            let mut state = self.state.lock().unwrap();
            match state.inbound.pop_front() {
                Some(chunk) => Ok(chunk),
                None if state.closed_by_peer => Err(IndiError::Connection(
                    "connection closed by server".to_string(),
                )),
                None => Ok(Vec::new()),
            }
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }
}
