//! Shared scaffolding for the integration tests: a `Sequencer` pumped on
//! its own thread so scenario tests can drive the blocking `Client` API
//! from the main test thread without deadlocking.

use seqfab::transport::LoopbackChannel;
use seqfab::{Client, Sequencer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const POLL_BACKOFF: Duration = Duration::from_micros(200);

pub struct TestFabric {
    seq: Arc<Mutex<Sequencer>>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TestFabric {
    pub fn spawn() -> TestFabric {
        let seq = Arc::new(Mutex::new(Sequencer::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let (seq2, stop2) = (seq.clone(), stop.clone());
        let handle = thread::spawn(move || {
            while !stop2.load(Ordering::Relaxed) {
                let _ = seq2.lock().unwrap().handle_io();
                thread::sleep(POLL_BACKOFF);
            }
        });
        TestFabric { seq, stop, handle: Some(handle) }
    }

    pub fn connect(&self) -> Client {
        let (server, client_chan) = LoopbackChannel::pair();
        self.seq.lock().unwrap().add_session(Box::new(server));
        Client::start(Box::new(client_chan)).unwrap()
    }

    pub fn session_count(&self) -> usize {
        self.seq.lock().unwrap().session_count()
    }

    /// Admits a raw loopback session without the `Client` library's local
    /// validation, so a test can push a frame that the client would have
    /// rejected before it ever reached the wire.
    pub fn connect_raw(&self) -> LoopbackChannel {
        let (server, client_chan) = LoopbackChannel::pair();
        self.seq.lock().unwrap().add_session(Box::new(server));
        client_chan
    }
}

impl Drop for TestFabric {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}
