use crate::client::IndiClient;
use crate::transport::Transport;
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Opt-in worker thread that keeps a shared client processing server traffic.
///
/// The client lives behind one coarse `Mutex`. The worker holds the lock only
/// for a non-blocking `process_events` call and sleeps outside it, so other
/// threads can query the mirror or send commands in between. Callbacks and
/// the event queue behave exactly as in the single-threaded case.
pub struct Poller {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn spawn<T>(client: Arc<Mutex<IndiClient<T>>>, interval: Duration) -> Self
    where
        T: Transport + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let handle = thread::spawn(move || {
            info!("🔁 INDI poller started ({:?} interval)", interval);
            while flag.load(Ordering::SeqCst) {
                let result = match client.lock() {
                    Ok(mut guard) => guard.process_events(Duration::ZERO),
                    Err(_) => {
                        error!("❌ INDI client lock poisoned, stopping poller");
                        break;
                    }
                };

                match result {
                    Ok(0) => {}
                    Ok(n) => debug!("🔁 Poller applied {} elements", n),
                    Err(e) if e.is_fatal() => {
                        error!("❌ INDI poller stopping: {}", e);
                        break;
                    }
                    Err(e) => debug!("Poller ignoring error: {}", e),
                }

                thread::sleep(interval);
            }
            flag.store(false, Ordering::SeqCst);
            info!("🛑 INDI poller stopped");
        });

        Self {
            running,
            handle: Some(handle),
        }
    }

    /// Whether the worker is still polling
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the worker to stop and wait for it to exit
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("❌ INDI poller thread panicked");
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::mock::MockTransport;
    use std::time::Instant;

    fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn test_poller_applies_updates_in_background() {
        let transport = MockTransport::new();
        let client = Arc::new(Mutex::new(IndiClient::with_transport(
            transport.clone(),
            ClientConfig::default(),
        )));
        let mut poller = Poller::spawn(client.clone(), Duration::from_millis(5));

        transport.push_inbound(
            r#"<defTextVector device="Mount" name="SITE" state="Ok" perm="rw"><defText name="NAME">Backyard</defText></defTextVector>"#,
        );

        assert!(wait_until(Duration::from_secs(2), || {
            client.lock().unwrap().get_text("Mount", "SITE", "NAME") == Some("Backyard")
        }));

        assert!(poller.is_running());
        poller.stop();
        assert!(!poller.is_running());
    }

    #[test]
    fn test_poller_stops_on_fatal_error() {
        let transport = MockTransport::new();
        let client = Arc::new(Mutex::new(IndiClient::with_transport(
            transport.clone(),
            ClientConfig::default(),
        )));
        let poller = Poller::spawn(client.clone(), Duration::from_millis(5));

        transport.hang_up();
        assert!(wait_until(Duration::from_secs(2), || !poller.is_running()));
        assert!(!client.lock().unwrap().is_connected());
    }
}
