//! External collaborator boundary: configuration in, a running acquisition
//! pipeline out (§4.5).
//!
//! The WebSocket transport, HTTP routing and static file serving that would
//! sit behind this facade in a full deployment are out of scope here; this
//! module pins the facade's interface and ships a broadcast-backed [`Sink`]
//! suitable for driving that external layer.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::errors::Result;
use crate::session::Session;
use crate::streamer::{Sink, StopFlag, Streamer, DEFAULT_BATCH_SIZE, LABEL_COUNT};
use crate::transport::DeviceAddress;

/// Configuration accepted at Bridge startup (§4.5). `Deserialize` is derived
/// so an external config-file loader (out of scope here) can populate this
/// directly from JSON/TOML without a hand-written adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Raw device address, parsed into a [`DeviceAddress`] at `start`.
    pub device: String,
    pub sampling_rate: u16,
    /// 1-indexed channel numbers as presented at this boundary; `start`
    /// subtracts one from each before handing them to [`Session::start`].
    pub channels: Vec<u8>,
    /// `[nSeq, I1, I2, O1, O2, A1, A2, A3, A4, A5, A6]`.
    pub labels: [String; LABEL_COUNT],
    pub batch_size: usize,
    pub port: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            sampling_rate: 1000,
            channels: vec![1, 2, 3, 4, 5, 6],
            labels: [
                "nSeq", "I1", "I2", "O1", "O2", "A1", "A2", "A3", "A4", "A5", "A6",
            ]
            .map(String::from),
            batch_size: DEFAULT_BATCH_SIZE,
            port: 8080,
        }
    }
}

/// Default `Sink`: broadcasts every serialized batch to every current
/// subscriber. A lagging subscriber drops the oldest unseen message rather
/// than blocking the producer (`tokio::sync::broadcast`'s documented
/// backpressure behavior).
pub struct BroadcastSink {
    tx: broadcast::Sender<String>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<String>) {
        let (tx, rx) = broadcast::channel(capacity);
        (Self { tx }, rx)
    }

    /// Subscribe an additional consumer (e.g. a newly connected WebSocket client).
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Sink for BroadcastSink {
    fn deliver(&mut self, batch: Value) {
        // No subscribers is not an error: the producer keeps running even if
        // nothing is currently listening.
        let _ = self.tx.send(batch.to_string());
    }
}

/// A running acquisition pipeline: an opened, started Session driving a
/// Streamer on a background thread.
pub struct Bridge {
    session: Arc<Mutex<Session>>,
    stop: StopFlag,
    handle: JoinHandle<Result<()>>,
}

impl Bridge {
    /// Open the device named in `config`, start acquisition, and spawn the
    /// Streamer loop. Returns once acquisition has begun.
    pub fn start<S: Sink + 'static>(config: BridgeConfig, sink: S) -> Result<Self> {
        let address = DeviceAddress::parse(&config.device)?;
        let transport = crate::open_transport(&address)?;

        let mut session = Session::new(transport);
        session.open()?;

        let mask: Vec<u8> = config.channels.iter().map(|c| c - 1).collect();
        session.start(config.sampling_rate, &mask)?;

        info!(
            "bridge started: device={}, rate={}, channels={:?}",
            config.device, config.sampling_rate, config.channels
        );

        let session = Arc::new(Mutex::new(session));
        let stop = StopFlag::new();
        let streamer = Streamer::new(
            session.clone(),
            sink,
            config.batch_size,
            config.labels,
            mask,
            stop.clone(),
        );

        let handle = thread::Builder::new()
            .name("sensorbridge-streamer".into())
            .spawn(move || streamer.run())
            .expect("failed to spawn streamer thread");

        Ok(Self {
            session,
            stop,
            handle,
        })
    }

    /// Request cancellation, wait for the streamer thread to exit, and close
    /// the Session. Surfaces any fatal error the Streamer observed.
    pub fn shutdown(self) -> Result<()> {
        self.stop.signal();
        let result = self
            .handle
            .join()
            .expect("streamer thread panicked");
        let mut session = self.session.lock().expect("session mutex poisoned");
        let _ = session.close();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_eleven_labels_and_default_batch_size() {
        let config = BridgeConfig::default();
        assert_eq!(config.labels.len(), LABEL_COUNT);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.labels[0], "nSeq");
    }

    #[test]
    fn broadcast_sink_delivers_to_late_subscriber() {
        let (mut sink, _rx) = BroadcastSink::new(16);
        let mut rx2 = sink.subscribe();
        sink.deliver(serde_json::json!({"nSeq": [1, 2]}));
        let received = rx2.try_recv().unwrap();
        assert!(received.contains("nSeq"));
    }

    #[test]
    fn broadcast_sink_delivery_with_no_subscribers_does_not_error() {
        let (mut sink, rx) = BroadcastSink::new(4);
        drop(rx);
        sink.deliver(serde_json::json!({"nSeq": []}));
    }
}
