//! Per-connection calibration handshake
//!
//! Two independent concerns live here:
//!
//! 1. **Streaming gate**: the `Idle -> Streaming` transition fires the
//!    one-time start-streaming command on the first decoded unit of the
//!    connection. It can fire at most once per connection lifetime no matter
//!    how many units follow; a reconnect gets a fresh machine and therefore
//!    a fresh gate.
//! 2. **Calibration sourcing**: every thermal frame's embedded block is
//!    validated before use. Valid blocks are adopted immediately (provenance
//!    `Embedded`, no command traffic). An invalid block with no valid
//!    calibration held triggers a one-time fetch command; grids stay on the
//!    configured static default (provenance `StaleFallback`) until the
//!    EEPROM response arrives (provenance `Fetched`).
//!
//! The legacy protocol variant that unconditionally re-fetches calibration
//! on a fixed timer is available through
//! [`CalibrationConfig::refetch_interval_secs`](crate::config::CalibrationConfig)
//! and is off by default.

use crate::config::CalibrationConfig;
use crate::protocol::packet::signed16;
use crate::protocol::{OutboundCommand, EEPROM_WORDS, EMBEDDED_CAL_WORDS};
use crate::thermal::{Provenance, ThermalGrid};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Minimum fraction of non-zero words for a calibration block to be trusted
const MIN_NONZERO_RATIO: f64 = 0.10;

/// Fixed-point divisors for the first two calibration words
const SCALE_DIVISOR: f64 = 10000.0;
const OFFSET_DIVISOR: f64 = 100.0;

/// Where the current scale/offset came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationSource {
    Default,
    Embedded,
    Fetched,
}

/// Current per-connection calibration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationState {
    pub scale: f64,
    pub offset: f64,
    pub source: CalibrationSource,
}

/// Streaming gate phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Streaming,
}

/// Validate a calibration block and derive (scale, offset)
///
/// Hex validity is already guaranteed upstream (the decoder only yields
/// parsed words). Checks here: exact word count, non-zero content ratio,
/// and a non-zero scale word. Word 0 is scale x 10^4 (unsigned), word 1 is
/// offset x 10^2 (two's complement).
pub fn validate_block(words: &[u16], expected_words: usize) -> Result<(f64, f64), String> {
    if words.len() != expected_words {
        return Err(format!(
            "calibration block length mismatch: expected {} words, got {}",
            expected_words,
            words.len()
        ));
    }
    let nonzero = words.iter().filter(|&&w| w != 0).count();
    if (nonzero as f64) < expected_words as f64 * MIN_NONZERO_RATIO {
        return Err(format!(
            "calibration block mostly zero: {}/{} non-zero words",
            nonzero, expected_words
        ));
    }
    if words[0] == 0 {
        return Err("calibration scale word is zero".to_string());
    }

    let scale = words[0] as f64 / SCALE_DIVISOR;
    let offset = signed16(words[1]) as f64 / OFFSET_DIVISOR;
    Ok((scale, offset))
}

fn provenance_of(source: CalibrationSource) -> Provenance {
    match source {
        CalibrationSource::Embedded => Provenance::Embedded,
        CalibrationSource::Fetched => Provenance::Fetched,
        CalibrationSource::Default => Provenance::StaleFallback,
    }
}

/// One instance per connection; destroyed with it
pub struct CalibrationStateMachine {
    phase: StreamPhase,
    /// Write-once per connection: set when the start-streaming command is
    /// emitted, never reset
    start_sent: bool,
    /// One-time fetch guard (ignored by the legacy refetch timer)
    fetch_sent: bool,
    state: CalibrationState,
    polling: bool,
    refetch_interval: Option<Duration>,
    last_fetch: Option<Instant>,
}

impl CalibrationStateMachine {
    pub fn new(config: &CalibrationConfig, polling: bool) -> Self {
        Self {
            phase: StreamPhase::Idle,
            start_sent: false,
            fetch_sent: false,
            state: CalibrationState {
                scale: config.default_scale,
                offset: config.default_offset,
                source: CalibrationSource::Default,
            },
            polling,
            refetch_interval: config.refetch_interval(),
            last_fetch: None,
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn calibration(&self) -> CalibrationState {
        self.state
    }

    pub fn start_command_sent(&self) -> bool {
        self.start_sent
    }

    /// Advance the streaming gate on a successfully received unit
    ///
    /// Receipt of any unit proves the device is awake; the first one fires
    /// `Idle -> Streaming` and yields the start command exactly once. In
    /// polling mode the gate never fires (the engine's poll timer requests
    /// frames instead).
    pub fn on_unit(&mut self) -> Option<OutboundCommand> {
        if self.polling || self.phase == StreamPhase::Streaming {
            return None;
        }
        self.phase = StreamPhase::Streaming;
        if self.start_sent {
            return None;
        }
        self.start_sent = true;
        log::debug!("Streaming gate fired, sending start command");
        Some(OutboundCommand::StartStreaming)
    }

    /// Process a thermal frame, producing the calibrated grid and any
    /// command the sourcing logic decided to emit
    pub fn on_frame(
        &mut self,
        frame_id: u32,
        cells: &[i16],
        embedded: &[u16],
        now: Instant,
    ) -> (ThermalGrid, Option<OutboundCommand>) {
        let mut command = None;

        match validate_block(embedded, EMBEDDED_CAL_WORDS) {
            Ok((scale, offset)) => {
                self.state = CalibrationState {
                    scale,
                    offset,
                    source: CalibrationSource::Embedded,
                };
            }
            Err(reason) => {
                log::debug!("Frame {}: embedded calibration rejected: {}", frame_id, reason);
                // No valid calibration held: request the EEPROM once and
                // keep producing stale-fallback grids until it arrives.
                if self.state.source == CalibrationSource::Default && !self.fetch_sent {
                    self.fetch_sent = true;
                    self.last_fetch = Some(now);
                    log::info!(
                        "Frame {}: no valid calibration, requesting EEPROM fetch",
                        frame_id
                    );
                    command = Some(OutboundCommand::FetchCalibration);
                }
            }
        }

        let grid = ThermalGrid::from_raw(
            frame_id,
            cells,
            self.state.scale,
            self.state.offset,
            provenance_of(self.state.source),
        );
        (grid, command)
    }

    /// Process a fetched EEPROM response; returns whether it was accepted
    pub fn on_calibration_response(&mut self, words: &[u16]) -> bool {
        match validate_block(words, EEPROM_WORDS) {
            Ok((scale, offset)) => {
                self.state = CalibrationState {
                    scale,
                    offset,
                    source: CalibrationSource::Fetched,
                };
                log::info!(
                    "Fetched calibration accepted: scale={}, offset={}",
                    scale,
                    offset
                );
                true
            }
            Err(reason) => {
                // Keep whatever calibration we hold; a bad response is not
                // worse than no response.
                log::warn!("Fetched calibration rejected: {}", reason);
                false
            }
        }
    }

    /// Legacy timer: unconditionally re-fetch calibration at the configured
    /// interval. Call once per connection loop tick; a no-op unless
    /// `refetch_interval_secs` is set.
    pub fn maybe_refetch(&mut self, now: Instant) -> Option<OutboundCommand> {
        let interval = self.refetch_interval?;
        match self.last_fetch {
            None => {
                // Arm the timer on the first tick
                self.last_fetch = Some(now);
                None
            }
            Some(last) if now.duration_since(last) >= interval => {
                self.last_fetch = Some(now);
                log::debug!("Periodic calibration re-fetch");
                Some(OutboundCommand::FetchCalibration)
            }
            Some(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::GRID_CELLS;

    fn machine() -> CalibrationStateMachine {
        CalibrationStateMachine::new(&CalibrationConfig::default(), false)
    }

    fn valid_embedded(scale_word: u16, offset_word: u16) -> Vec<u16> {
        let mut words = vec![1u16; EMBEDDED_CAL_WORDS];
        words[0] = scale_word;
        words[1] = offset_word;
        words
    }

    #[test]
    fn test_start_command_exactly_once() {
        let mut m = machine();
        assert_eq!(m.phase(), StreamPhase::Idle);
        assert_eq!(m.on_unit(), Some(OutboundCommand::StartStreaming));
        assert_eq!(m.phase(), StreamPhase::Streaming);
        assert!(m.start_command_sent());

        // No number of subsequent units or frames re-triggers it
        let cells = vec![0i16; GRID_CELLS];
        for _ in 0..10 {
            assert_eq!(m.on_unit(), None);
            let (_, cmd) = m.on_frame(1, &cells, &valid_embedded(100, 0), Instant::now());
            assert_eq!(cmd, None);
        }
    }

    #[test]
    fn test_start_command_with_zero_frames() {
        // The gate is about units, not frames: identity alone fires it
        let mut m = machine();
        assert_eq!(m.on_unit(), Some(OutboundCommand::StartStreaming));
        assert_eq!(m.on_unit(), None);
    }

    #[test]
    fn test_polling_mode_never_starts_streaming() {
        let mut m = CalibrationStateMachine::new(&CalibrationConfig::default(), true);
        for _ in 0..5 {
            assert_eq!(m.on_unit(), None);
        }
        assert!(!m.start_command_sent());
    }

    #[test]
    fn test_embedded_calibration_adopted() {
        let mut m = machine();
        let cells = vec![-96i16; GRID_CELLS]; // raw 0xFFA0
        let (grid, cmd) = m.on_frame(1, &cells, &valid_embedded(100, 2700), Instant::now());

        assert_eq!(cmd, None);
        assert_eq!(grid.provenance, Provenance::Embedded);
        assert_eq!(grid.get(0, 0), -96.0 * 0.01 + 27.0);
        let cal = m.calibration();
        assert_eq!(cal.source, CalibrationSource::Embedded);
        assert_eq!(cal.scale, 0.01);
        assert_eq!(cal.offset, 27.0);
    }

    #[test]
    fn test_invalid_embedded_falls_back_then_fetches_once() {
        let mut m = machine();
        let cells = vec![100i16; GRID_CELLS];

        // Grid-only frame: no embedded block at all
        let (grid, cmd) = m.on_frame(1, &cells, &[], Instant::now());
        assert_eq!(cmd, Some(OutboundCommand::FetchCalibration));
        assert_eq!(grid.provenance, Provenance::StaleFallback);
        // Default calibration applied while waiting
        assert_eq!(grid.get(0, 0), 100.0 * 0.02);

        // Still waiting: further invalid frames never re-send the fetch
        let (grid, cmd) = m.on_frame(2, &cells, &[], Instant::now());
        assert_eq!(cmd, None);
        assert_eq!(grid.provenance, Provenance::StaleFallback);

        // Response arrives: provenance switches to fetched
        let mut eeprom = vec![1u16; EEPROM_WORDS];
        eeprom[0] = 200; // scale 0.02
        eeprom[1] = 500; // offset 5.0
        assert!(m.on_calibration_response(&eeprom));

        let (grid, cmd) = m.on_frame(3, &cells, &[], Instant::now());
        assert_eq!(cmd, None);
        assert_eq!(grid.provenance, Provenance::Fetched);
        assert_eq!(grid.get(0, 0), 100.0 * 0.02 + 5.0);
    }

    #[test]
    fn test_invalid_embedded_keeps_prior_valid_calibration() {
        let mut m = machine();
        let cells = vec![10i16; GRID_CELLS];

        let (_, cmd) = m.on_frame(1, &cells, &valid_embedded(100, 2700), Instant::now());
        assert_eq!(cmd, None);

        // Later corrupt block: keep the embedded calibration, no fetch
        let (grid, cmd) = m.on_frame(2, &cells, &vec![0u16; EMBEDDED_CAL_WORDS], Instant::now());
        assert_eq!(cmd, None);
        assert_eq!(grid.provenance, Provenance::Embedded);
        assert_eq!(m.calibration().source, CalibrationSource::Embedded);
    }

    #[test]
    fn test_all_zero_block_rejected() {
        let zeros = vec![0u16; EMBEDDED_CAL_WORDS];
        assert!(validate_block(&zeros, EMBEDDED_CAL_WORDS).is_err());
    }

    #[test]
    fn test_mostly_zero_block_rejected() {
        // 5 non-zero of 66 is below the 10% floor
        let mut words = vec![0u16; EMBEDDED_CAL_WORDS];
        for w in words.iter_mut().take(5) {
            *w = 1;
        }
        assert!(validate_block(&words, EMBEDDED_CAL_WORDS).is_err());

        // 7 non-zero of 66 clears it (but scale word must be non-zero)
        let mut words = vec![0u16; EMBEDDED_CAL_WORDS];
        for w in words.iter_mut().take(7) {
            *w = 1;
        }
        assert!(validate_block(&words, EMBEDDED_CAL_WORDS).is_ok());
    }

    #[test]
    fn test_block_length_mismatch_rejected() {
        let words = vec![1u16; 10];
        let err = validate_block(&words, EMBEDDED_CAL_WORDS).unwrap_err();
        assert!(err.contains("expected 66"), "{}", err);
        assert!(err.contains("got 10"), "{}", err);
    }

    #[test]
    fn test_negative_offset_word() {
        // 0xFFFF -> -1 -> -0.01 offset
        let words = valid_embedded(100, 0xFFFF);
        let (scale, offset) = validate_block(&words, EMBEDDED_CAL_WORDS).unwrap();
        assert_eq!(scale, 0.01);
        assert_eq!(offset, -0.01);
    }

    #[test]
    fn test_bad_eeprom_response_keeps_current() {
        let mut m = machine();
        assert!(!m.on_calibration_response(&vec![0u16; EEPROM_WORDS]));
        assert_eq!(m.calibration().source, CalibrationSource::Default);
    }

    #[test]
    fn test_legacy_refetch_timer() {
        let config = CalibrationConfig {
            refetch_interval_secs: Some(60),
            ..CalibrationConfig::default()
        };
        let mut m = CalibrationStateMachine::new(&config, false);
        let t0 = Instant::now();

        // First tick arms the timer
        assert_eq!(m.maybe_refetch(t0), None);
        // Before the interval: nothing
        assert_eq!(m.maybe_refetch(t0 + Duration::from_secs(30)), None);
        // After: re-fetch fires and re-arms
        assert_eq!(
            m.maybe_refetch(t0 + Duration::from_secs(61)),
            Some(OutboundCommand::FetchCalibration)
        );
        assert_eq!(m.maybe_refetch(t0 + Duration::from_secs(62)), None);
        assert_eq!(
            m.maybe_refetch(t0 + Duration::from_secs(122)),
            Some(OutboundCommand::FetchCalibration)
        );
    }

    #[test]
    fn test_refetch_disabled_by_default() {
        let mut m = machine();
        assert_eq!(m.maybe_refetch(Instant::now()), None);
        assert_eq!(
            m.maybe_refetch(Instant::now() + Duration::from_secs(100_000)),
            None
        );
    }
}
