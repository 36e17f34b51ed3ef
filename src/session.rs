//! The sensor's session state machine and command surface (§4.3).
//!
//! `Session` owns exactly one [`Transport`] and serializes every command/response
//! exchange against it, enforcing the 100 ms inter-byte pacing delay the device
//! firmware expects.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::codec::{
    self, ChannelMask, DeviceStateV2, Sample, SamplingRate, CMD_IDLE_V2, CMD_PWM_PREFIX,
    CMD_STATE_V2, CMD_STOP_V1, CMD_VERSION, STATE_FRAME_LEN,
};
use crate::errors::{DriverError, Result};
use crate::transport::Transport;

/// Delay enforced before every outbound command byte (§4.1.1).
const COMMAND_PACING: Duration = Duration::from_millis(100);

/// Version must begin with this literal (§3).
const VERSION_PREFIX: &str = "BITalino";

/// Hardware generation threshold: version >= 4.2 is "v2" (§3).
const V2_VERSION_THRESHOLD: f32 = 4.2;

/// Session lifecycle state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Idle,
    Acquiring,
}

/// The sensor's firmware version, with the v1/v2 split already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareVersion {
    pub raw: String,
    pub is_v2: bool,
}

impl HardwareVersion {
    fn parse(raw: &str) -> Self {
        let is_v2 = extract_version_number(raw)
            .map(|n| n >= V2_VERSION_THRESHOLD)
            .unwrap_or(false);
        HardwareVersion {
            raw: raw.to_string(),
            is_v2,
        }
    }
}

/// Pull the numeric version out of strings shaped like `BITalino_v5.2` or `BITalino V5.2`.
fn extract_version_number(version: &str) -> Option<f32> {
    let lower = version.to_lowercase();
    let tail = if let Some(pos) = lower.find("_v") {
        &lower[pos + 2..]
    } else {
        let pos = lower.find('v')?;
        &lower[pos + 1..]
    };
    let digits: String = tail
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits.parse::<f32>().ok()
}

/// The sensor's state machine and command surface. Owns its [`Transport`] exclusively.
pub struct Session {
    transport: Box<dyn Transport>,
    state: SessionState,
    version: Option<HardwareVersion>,
    mask: Option<ChannelMask>,
    read_deadline: Option<Duration>,
}

impl Session {
    /// Wrap an already-open transport. The session starts `Disconnected`; call
    /// [`Session::open`] before anything else.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            state: SessionState::Disconnected,
            version: None,
            mask: None,
            read_deadline: None,
        }
    }

    /// Bound every subsequent `read_exact` call to at most `timeout` after it starts.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_deadline = Some(timeout);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn hardware_version(&self) -> Option<&HardwareVersion> {
        self.version.as_ref()
    }

    fn is_v2(&self) -> bool {
        self.version.as_ref().map(|v| v.is_v2).unwrap_or(false)
    }

    fn require_state(&self, expected: SessionState, err: DriverError) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(err)
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.read_deadline.map(|d| Instant::now() + d)
    }

    fn send_command(&mut self, byte: u8) -> Result<()> {
        thread::sleep(COMMAND_PACING);
        self.transport.write_byte(byte)
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Open the session: query the version, classify v1/v2, transition to `Idle`.
    pub fn open(&mut self) -> Result<&HardwareVersion> {
        self.require_state(SessionState::Disconnected, DriverError::NotIdle)?;
        let raw = self.read_version()?;
        let version = HardwareVersion::parse(&raw);
        debug!(
            "session opened: version={}, is_v2={}",
            version.raw, version.is_v2
        );
        self.version = Some(version);
        self.state = SessionState::Idle;
        Ok(self.version.as_ref().unwrap())
    }

    /// Query the device firmware version (§4.3). Legal only in `Idle`, except
    /// during [`Session::open`] where it is used to establish the session.
    pub fn version(&mut self) -> Result<String> {
        self.require_state(SessionState::Idle, DriverError::NotIdle)?;
        self.read_version()
    }

    /// Read bytes one at a time until the accumulator contains "BITalino" and
    /// ends with `\n`; return the substring from "BITalino" up to (not
    /// including) the newline.
    fn read_version(&mut self) -> Result<String> {
        self.send_command(CMD_VERSION)?;

        let mut acc = Vec::with_capacity(64);
        let deadline = self.deadline();
        loop {
            let byte = self.transport.read_exact(1, deadline)?;
            acc.push(byte[0]);

            if acc.last() == Some(&b'\n') {
                let text = String::from_utf8_lossy(&acc);
                if let Some(start) = text.find(VERSION_PREFIX) {
                    return Ok(text[start..text.len() - 1].to_string());
                }
            }

            if acc.len() > 256 {
                return Err(DriverError::ContactingDevice(
                    "version response exceeded sanity limit".into(),
                ));
            }
        }
    }

    /// Set the battery LED threshold (§4.1.1, §4.3). Legal only in `Idle`.
    pub fn battery(&mut self, threshold: u8) -> Result<()> {
        self.require_state(SessionState::Idle, DriverError::NotIdle)?;
        let cmd = codec::encode_battery_threshold(threshold)
            .ok_or_else(|| DriverError::InvalidParameter(format!("threshold {threshold} > 63")))?;
        self.send_command(cmd)
    }

    /// Start acquisition at `rate_hz` over `channels` (§4.3). Legal only in `Idle`.
    pub fn start(&mut self, rate_hz: u16, channels: &[u8]) -> Result<()> {
        self.require_state(SessionState::Idle, DriverError::NotIdle)?;

        let rate = SamplingRate::from_hz(rate_hz)
            .ok_or_else(|| DriverError::InvalidParameter(format!("sampling rate {rate_hz}")))?;
        let mask = ChannelMask::canonicalize(channels)
            .ok_or_else(|| DriverError::InvalidParameter(format!("channel mask {channels:?}")))?;

        self.send_command(codec::encode_set_rate(rate))?;
        self.send_command(codec::encode_start(&mask))?;

        self.mask = Some(mask);
        self.state = SessionState::Acquiring;
        Ok(())
    }

    /// Read `k` samples (§4.3). Legal only in `Acquiring`. A CRC failure or
    /// transport timeout aborts the whole batch with `ContactingDevice`,
    /// leaving the session `Acquiring`.
    pub fn read(&mut self, k: usize) -> Result<Vec<Sample>> {
        self.require_state(SessionState::Acquiring, DriverError::NotAcquiring)?;
        let mask = self.mask.clone().expect("mask set while Acquiring");
        let frame_bytes = codec::frame_size(mask.len());

        let mut batch = Vec::with_capacity(k);
        let deadline = self.deadline();
        for i in 0..k {
            let frame = self.transport.read_exact(frame_bytes, deadline)?;
            if !codec::verify_crc(&frame) {
                return Err(DriverError::ContactingDevice(format!(
                    "CRC mismatch on sample {i} of {k}"
                )));
            }
            batch.push(codec::unpack_sample(&frame, &mask));
        }
        Ok(batch)
    }

    /// Set digital outputs (§4.3). v1: requires `Acquiring`, array of 4. v2:
    /// legal in `Idle` or `Acquiring`, array of 2.
    pub fn trigger(&mut self, outputs: &[u8]) -> Result<()> {
        let cmd = if self.is_v2() {
            codec::encode_trigger_v2(outputs)
        } else {
            self.require_state(SessionState::Acquiring, DriverError::NotAcquiring)?;
            codec::encode_trigger_v1(outputs)
        };
        let cmd = cmd.ok_or_else(|| DriverError::InvalidParameter(format!("{outputs:?}")))?;
        self.send_command(cmd)
    }

    /// Query the v2 device state snapshot (§4.3, §4.1.5). v2 only, `Idle` only.
    pub fn query_state(&mut self) -> Result<DeviceStateV2> {
        if !self.is_v2() {
            return Err(DriverError::InvalidVersion);
        }
        self.require_state(SessionState::Idle, DriverError::NotIdle)?;

        self.send_command(CMD_STATE_V2)?;
        let deadline = self.deadline();
        let bytes = self.transport.read_exact(STATE_FRAME_LEN, deadline)?;

        if !codec::verify_crc(&bytes) {
            return Err(DriverError::ContactingDevice(
                "CRC mismatch in state response".into(),
            ));
        }

        let frame: [u8; STATE_FRAME_LEN] = bytes.try_into().expect("exact-length read");
        Ok(codec::unpack_state(&frame))
    }

    /// Set the v2 PWM output (§4.1.1, §4.3). v2 only, `Idle` only.
    pub fn pwm(&mut self, value: u8) -> Result<()> {
        if !self.is_v2() {
            return Err(DriverError::InvalidVersion);
        }
        self.require_state(SessionState::Idle, DriverError::NotIdle)?;

        self.send_command(CMD_PWM_PREFIX)?;
        self.send_command(value)
    }

    /// Stop acquisition (§4.3). The command byte depends on whether the
    /// session is currently `Acquiring`, not on hardware version: a v2
    /// device stopped mid-acquisition sends the same `0x00` byte a v1
    /// device does. Only a v2 device may stop from `Idle`, sending `0xFF`.
    /// Both branches re-read `version()` afterward, which flushes any frame
    /// bytes still in flight from the device.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == SessionState::Acquiring {
            self.send_command(CMD_STOP_V1)?;
        } else if self.is_v2() {
            self.require_state(SessionState::Idle, DriverError::NotAcquiring)?;
            self.send_command(CMD_IDLE_V2)?;
        } else {
            return Err(DriverError::NotAcquiring);
        }

        self.mask = None;
        self.state = SessionState::Idle;
        if let Err(e) = self.read_version() {
            warn!("post-stop version flush failed: {e}");
        }
        Ok(())
    }

    /// Close the transport and transition to `Disconnected`. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        self.transport.close()?;
        self.mask = None;
        self.state = SessionState::Disconnected;
        Ok(())
    }

    /// Jump straight to `Acquiring` with the given mask, skipping the version
    /// handshake and `start` command bytes. Only for exercising the Streamer
    /// against a scripted Transport in tests.
    #[cfg(test)]
    pub(crate) fn force_acquiring_for_test(&mut self, mask: ChannelMask) {
        self.mask = Some(mask);
        self.state = SessionState::Acquiring;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// A scripted, in-memory `Transport` for exercising the state machine
    /// without a real device (§8's "scripted fake Transport"). `outbound` is
    /// shared so a test can inspect written bytes after the `Session` has
    /// taken ownership of the transport.
    struct FakeTransport {
        inbound: VecDeque<u8>,
        outbound: Arc<Mutex<Vec<u8>>>,
        closed: bool,
    }

    impl FakeTransport {
        fn new(inbound: &[u8]) -> Self {
            Self::with_outbound(inbound, Arc::new(Mutex::new(Vec::new())))
        }

        fn with_outbound(inbound: &[u8], outbound: Arc<Mutex<Vec<u8>>>) -> Self {
            Self {
                inbound: inbound.iter().copied().collect(),
                outbound,
                closed: false,
            }
        }
    }

    impl Transport for FakeTransport {
        fn write_byte(&mut self, byte: u8) -> Result<()> {
            self.outbound.lock().unwrap().push(byte);
            Ok(())
        }

        fn read_exact(&mut self, n: usize, _deadline: Option<Instant>) -> Result<Vec<u8>> {
            if self.inbound.len() < n {
                return Err(DriverError::ContactingDevice("fake exhausted".into()));
            }
            Ok((0..n).map(|_| self.inbound.pop_front().unwrap()).collect())
        }

        fn close(&mut self) -> Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    fn opened_session(version_line: &str, extra_inbound: &[u8]) -> Session {
        opened_session_with_outbound(version_line, extra_inbound).0
    }

    fn opened_session_with_outbound(
        version_line: &str,
        extra_inbound: &[u8],
    ) -> (Session, Arc<Mutex<Vec<u8>>>) {
        let mut inbound = version_line.as_bytes().to_vec();
        inbound.extend_from_slice(extra_inbound);
        let outbound = Arc::new(Mutex::new(Vec::new()));
        let transport = FakeTransport::with_outbound(&inbound, outbound.clone());
        let mut session = Session::new(Box::new(transport));
        session.open().unwrap();
        (session, outbound)
    }

    #[test]
    fn s1_v1_handshake() {
        let mut session = opened_session("BITalino_v3.1\n", &[]);
        assert!(!session.hardware_version().unwrap().is_v2);
        assert_eq!(session.query_state().unwrap_err().to_string(), DriverError::InvalidVersion.to_string());
    }

    #[test]
    fn version_handles_v2_naming() {
        let mut session = opened_session("BITalino_v5.2\n", &[]);
        assert!(session.hardware_version().unwrap().is_v2);
        assert!(!session.hardware_version().unwrap().raw.contains('\n'));
        assert!(session.hardware_version().unwrap().raw.starts_with("BITalino"));
    }

    #[test]
    fn s2_start_writes_expected_bytes() {
        let mut session = opened_session("BITalino_v3.1\n", &[]);
        session.start(100, &[3, 1, 0]).unwrap();
        assert_eq!(session.state(), SessionState::Acquiring);
    }

    #[test]
    fn start_is_idempotent_rejecting() {
        let mut session = opened_session("BITalino_v3.1\n", &[]);
        session.start(1000, &[0]).unwrap();
        let err = session.start(1000, &[0]).unwrap_err();
        assert!(matches!(err, DriverError::NotIdle));
        assert_eq!(session.state(), SessionState::Acquiring);
    }

    #[test]
    fn s3_single_sample_decode_via_read() {
        let mut session = opened_session("BITalino_v3.1\n", &[0xFA, 0x5C, 0xE3]);
        session.start(1000, &[0]).unwrap();
        let batch = session.read(1).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].seq, 0xE);
        assert_eq!(batch[0].digital, [0, 1, 0, 1]);
        assert_eq!(batch[0].analog, vec![830]);
    }

    #[test]
    fn s4_crc_failure_aborts_batch_without_leaving_acquiring() {
        let mut session = opened_session("BITalino_v3.1\n", &[0xFA, 0x5C, 0xE0]);
        session.start(1000, &[0]).unwrap();
        let err = session.read(1).unwrap_err();
        assert!(matches!(err, DriverError::ContactingDevice(_)));
        assert_eq!(session.state(), SessionState::Acquiring);
    }

    #[test]
    fn read_after_stop_fails_not_acquiring() {
        let mut session = opened_session("BITalino_v3.1\nBITalino_v3.1\n", &[]);
        session.start(1000, &[0]).unwrap();
        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        let err = session.read(1).unwrap_err();
        assert!(matches!(err, DriverError::NotAcquiring));
    }

    #[test]
    fn v2_stop_from_acquiring_sends_stop_byte_not_idle_byte() {
        // A v2 device mid-acquisition must stop the same way a v1 device
        // does: send 0x00 and re-read version, not 0xFF.
        let (mut session, outbound) =
            opened_session_with_outbound("BITalino_v5.2\nBITalino_v5.2\n", &[]);
        session.start(1000, &[0]).unwrap();
        outbound.lock().unwrap().clear();

        session.stop().unwrap();

        assert_eq!(session.state(), SessionState::Idle);
        let written = outbound.lock().unwrap();
        assert_eq!(written.first(), Some(&CMD_STOP_V1));
        assert_eq!(written.last(), Some(&CMD_VERSION));
    }

    #[test]
    fn v2_stop_from_idle_sends_idle_byte() {
        let (mut session, outbound) = opened_session_with_outbound("BITalino_v5.2\nBITalino_v5.2\n", &[]);
        outbound.lock().unwrap().clear();

        session.stop().unwrap();

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(outbound.lock().unwrap().first(), Some(&CMD_IDLE_V2));
    }

    #[test]
    fn v1_stop_from_idle_rejected() {
        let mut session = opened_session("BITalino_v3.1\n", &[]);
        let err = session.stop().unwrap_err();
        assert!(matches!(err, DriverError::NotAcquiring));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn s5_v2_trigger_in_idle() {
        let mut session = opened_session("BITalino_v5.2\n", &[]);
        session.trigger(&[1, 0]).unwrap();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn s6_v1_trigger_in_idle_rejected() {
        let mut session = opened_session("BITalino_v3.1\n", &[]);
        let before_state = session.state();
        let err = session.trigger(&[1, 0, 1, 0]).unwrap_err();
        assert!(matches!(err, DriverError::NotAcquiring));
        assert_eq!(session.state(), before_state);
    }

    #[test]
    fn mask_canonicalization_fixes_column_order() {
        let mut a = opened_session("BITalino_v3.1\n", &[]);
        let mut b = opened_session("BITalino_v3.1\n", &[]);
        a.start(1000, &[2, 0, 1]).unwrap();
        b.start(1000, &[1, 2, 0]).unwrap();
        assert_eq!(a.mask.as_ref().unwrap(), b.mask.as_ref().unwrap());
    }

    #[test]
    fn close_is_idempotent() {
        let mut session = opened_session("BITalino_v3.1\n", &[]);
        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn battery_threshold_rejects_out_of_domain() {
        let mut session = opened_session("BITalino_v3.1\n", &[]);
        assert!(session.battery(63).is_ok());
        let mut session = opened_session("BITalino_v3.1\n", &[]);
        assert!(matches!(
            session.battery(64).unwrap_err(),
            DriverError::InvalidParameter(_)
        ));
    }
}
