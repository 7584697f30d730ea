//! Scripted INDI server for integration tests

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Server side of one scripted client session
pub struct ServerSession {
    stream: TcpStream,
    received: String,
}

impl ServerSession {
    /// Block until the client has sent something containing `needle`.
    /// Returns everything received up to and including that point.
    pub fn expect(&mut self, needle: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut buf = [0u8; 4096];

        loop {
            if let Some(pos) = self.received.find(needle) {
                let end = pos + needle.len();
                let seen = self.received[..end].to_string();
                self.received.drain(..end);
                return seen;
            }
            assert!(
                Instant::now() < deadline,
                "client never sent `{}` (got `{}`)",
                needle,
                self.received
            );

            match self.stream.read(&mut buf) {
                Ok(0) => panic!("client closed while waiting for `{}`", needle),
                Ok(n) => self
                    .received
                    .push_str(&String::from_utf8_lossy(&buf[..n])),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => panic!("server read failed: {}", e),
            }
        }
    }

    pub fn send(&mut self, xml: &str) {
        self.stream
            .write_all(xml.as_bytes())
            .expect("Failed to write to client");
        self.stream.flush().expect("Failed to flush");
    }

    /// Send `xml` in pieces with a pause between them, to exercise split reads
    pub fn send_in_chunks(&mut self, xml: &str, chunk: usize, pause: Duration) {
        for piece in xml.as_bytes().chunks(chunk) {
            self.stream.write_all(piece).expect("Failed to write to client");
            self.stream.flush().expect("Failed to flush");
            thread::sleep(pause);
        }
    }
}

/// Mock INDI server that runs a script against each client it accepts
pub struct MockIndiServer {
    pub port: u16,
    handle: JoinHandle<()>,
}

impl MockIndiServer {
    /// Accept a single client
    pub fn start<F>(script: F) -> Self
    where
        F: FnOnce(&mut ServerSession) + Send + 'static,
    {
        let mut script = Some(script);
        Self::start_sessions(1, move |_, session| {
            if let Some(script) = script.take() {
                script(session);
            }
        })
    }

    /// Accept `sessions` clients one after another. The script gets the
    /// session index, and each connection is closed when its script returns.
    pub fn start_sessions<F>(sessions: usize, mut script: F) -> Self
    where
        F: FnMut(usize, &mut ServerSession) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind mock server");
        let port = listener.local_addr().expect("No local address").port();
        println!("🔭 Mock INDI server listening on port {}", port);

        let handle = thread::spawn(move || {
            for index in 0..sessions {
                let (stream, addr) = listener.accept().expect("Failed to accept client");
                println!("📡 Client {} connected from {}", index, addr);
                stream
                    .set_read_timeout(Some(Duration::from_millis(50)))
                    .expect("Failed to set read timeout");

                let mut session = ServerSession {
                    stream,
                    received: String::new(),
                };
                script(index, &mut session);
            }
            println!("🛑 Mock INDI server script finished");
        });

        Self { port, handle }
    }

    /// Wait for the script to finish; panics in the script fail the test
    pub fn join(self) {
        self.handle.join().expect("Mock server script panicked");
    }
}

pub const DEF_EXPOSURE: &str = r#"<defNumberVector device="CCD" name="CCD_EXPOSURE" label="Expose" group="Main Control" state="Idle" perm="rw" timeout="60" timestamp="2024-05-01T21:14:03">
    <defNumber name="CCD_EXPOSURE_VALUE" label="Duration (s)" format="%5.2f" min="0.01" max="3600" step="1">
0
    </defNumber>
</defNumberVector>
"#;

pub const DEF_CCD1: &str = r#"<defBLOBVector device="CCD" name="CCD1" label="Image Data" group="Image Info" state="Idle" perm="ro" timeout="60">
    <defBLOB name="CCD1" label="Image"/>
</defBLOBVector>
"#;
