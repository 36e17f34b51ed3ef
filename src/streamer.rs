//! Producer loop that turns a running [`Session`] into a stream of JSON batches (§4.4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, info};
use serde_json::{json, Map, Value};

use crate::errors::Result;
use crate::session::Session;

/// Default batch size (§4.5).
pub const DEFAULT_BATCH_SIZE: usize = 250;

/// Column labels in fixed order: `[nSeq, I1, I2, O1, O2, A1, A2, A3, A4, A5, A6]`.
pub const LABEL_COUNT: usize = 11;

/// An external consumer of batches (§GLOSSARY). Delivery policy — broadcast,
/// queue, drop on backpressure — is entirely up to the implementation; the
/// Streamer only guarantees every produced batch reaches `deliver` once, in
/// production order.
pub trait Sink: Send {
    fn deliver(&mut self, batch: Value);
}

/// A `Sink` that discards everything. Useful for tests and headless runs.
pub struct NullSink;

impl Sink for NullSink {
    fn deliver(&mut self, _batch: Value) {}
}

/// Cooperative stop signal shared between a Streamer and its owner.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Produces sample batches from `session` and hands each as a JSON object to `sink`.
pub struct Streamer<S: Sink> {
    session: Arc<Mutex<Session>>,
    sink: S,
    batch_size: usize,
    labels: [String; LABEL_COUNT],
    mask: Vec<u8>,
    stop: StopFlag,
}

impl<S: Sink> Streamer<S> {
    pub fn new(
        session: Arc<Mutex<Session>>,
        sink: S,
        batch_size: usize,
        labels: [String; LABEL_COUNT],
        mask: Vec<u8>,
        stop: StopFlag,
    ) -> Self {
        Self {
            session,
            sink,
            batch_size,
            labels,
            mask,
            stop,
        }
    }

    /// Run until the stop flag is set or the Session reports a fatal error.
    ///
    /// A fatal error closes the Session and is returned to the caller; the
    /// stop flag being set is a normal exit and returns `Ok(())`.
    pub fn run(mut self) -> Result<()> {
        info!("streamer started: batch_size={}", self.batch_size);
        loop {
            if self.stop.is_set() {
                info!("streamer stopping on cooperative signal");
                return Ok(());
            }

            let batch = {
                let mut session = self.session.lock().expect("session mutex poisoned");
                session.read(self.batch_size)
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    error!("streamer exiting on fatal session error: {e}");
                    let mut session = self.session.lock().expect("session mutex poisoned");
                    let _ = session.close();
                    return Err(e);
                }
            };

            self.sink.deliver(self.format_batch(&batch));
        }
    }

    fn format_batch(&self, batch: &[crate::codec::Sample]) -> Value {
        let mut columns: Map<String, Value> = Map::new();

        columns.insert(
            self.labels[0].clone(),
            Value::Array(batch.iter().map(|s| json!(s.seq)).collect()),
        );
        for (i, label) in self.labels[1..5].iter().enumerate() {
            columns.insert(
                label.clone(),
                Value::Array(batch.iter().map(|s| json!(s.digital[i])).collect()),
            );
        }
        for (col, &channel) in self.mask.iter().enumerate() {
            let label = &self.labels[5 + channel as usize];
            columns.insert(
                label.clone(),
                Value::Array(batch.iter().map(|s| json!(s.analog[col])).collect()),
            );
        }

        Value::Object(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ChannelMask, Sample};
    use crate::errors::DriverError;
    use crate::transport::Transport;
    use std::collections::VecDeque;
    use std::time::Instant;

    struct ScriptedTransport {
        frames: VecDeque<Vec<u8>>,
    }

    impl Transport for ScriptedTransport {
        fn write_byte(&mut self, _byte: u8) -> Result<()> {
            Ok(())
        }

        fn read_exact(&mut self, n: usize, _deadline: Option<Instant>) -> Result<Vec<u8>> {
            match self.frames.pop_front() {
                Some(f) if f.len() == n => Ok(f),
                _ => Err(DriverError::ContactingDevice("scripted transport exhausted".into())),
            }
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct CollectingSink {
        batches: Vec<Value>,
    }

    impl Sink for CollectingSink {
        fn deliver(&mut self, batch: Value) {
            self.batches.push(batch);
        }
    }

    fn labels() -> [String; LABEL_COUNT] {
        ["nSeq", "I1", "I2", "O1", "O2", "A1", "A2", "A3", "A4", "A5", "A6"]
            .map(String::from)
    }

    fn sample_frame() -> Vec<u8> {
        vec![0xFA, 0x5C, 0xE3]
    }

    #[test]
    fn stop_flag_set_before_first_iteration_exits_cleanly_without_reading() {
        let transport = ScriptedTransport {
            frames: vec![sample_frame()].into(),
        };
        let mut session = Session::new(Box::new(transport));
        let mask = ChannelMask::canonicalize(&[0]).unwrap();
        session.force_acquiring_for_test(mask);

        let session = Arc::new(Mutex::new(session));
        let stop = StopFlag::new();
        stop.signal();
        let sink = CollectingSink { batches: Vec::new() };
        let streamer = Streamer::new(session.clone(), sink, 1, labels(), vec![0], stop);

        assert!(streamer.run().is_ok());
        // The scripted frame was never consumed: a fresh read would still succeed.
        assert_eq!(
            session.lock().unwrap().read(1).unwrap().len(),
            1
        );
    }

    #[test]
    fn format_batch_emits_only_active_labels() {
        let transport = ScriptedTransport { frames: VecDeque::new() };
        let session = Session::new(Box::new(transport));
        let session = Arc::new(Mutex::new(session));
        let sink = CollectingSink { batches: Vec::new() };
        let streamer = Streamer::new(session, sink, 1, labels(), vec![0, 2], StopFlag::new());

        let batch = vec![Sample {
            seq: 3,
            digital: [1, 0, 1, 0],
            analog: vec![100, 200],
        }];
        let value = streamer.format_batch(&batch);
        let obj = value.as_object().unwrap();

        assert_eq!(obj.len(), 7);
        assert_eq!(obj["nSeq"], json!([3]));
        assert_eq!(obj["I1"], json!([1]));
        assert_eq!(obj["A1"], json!([100]));
        assert_eq!(obj["A3"], json!([200]));
        assert!(!obj.contains_key("A2"));
    }

    #[test]
    fn fatal_session_error_propagates_and_closes_session() {
        let transport = ScriptedTransport { frames: VecDeque::new() };
        let mut session = Session::new(Box::new(transport));
        let mask = ChannelMask::canonicalize(&[0]).unwrap();
        session.force_acquiring_for_test(mask);

        let session = Arc::new(Mutex::new(session));
        let sink = CollectingSink { batches: Vec::new() };
        let streamer = Streamer::new(session.clone(), sink, 1, labels(), vec![0], StopFlag::new());

        let err = streamer.run().unwrap_err();
        assert!(matches!(err, DriverError::ContactingDevice(_)));
        assert_eq!(
            session.lock().unwrap().state(),
            crate::session::SessionState::Disconnected
        );
    }
}
