//! Per-connection handler
//!
//! One `Connection` exclusively owns its socket, its `UnitReader`, and its
//! `CalibrationStateMachine`; all three die with it on disconnect. Health
//! records outlive the connection by design - a socket close is not an
//! offline verdict, only the liveness window is.
//!
//! Generic over the stream type so tests can drive the handler with an
//! in-memory transport instead of a socket.

use crate::calibration::CalibrationStateMachine;
use crate::engine::EngineShared;
use crate::events::Event;
use crate::fusion;
use crate::protocol::packet::DevicePacket;
use crate::protocol::unit_reader::{FeedResult, UnitEvent, UnitReader};
use crate::protocol::{decode, OutboundCommand};
use crate::thermal::ThermalGrid;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// One device connection, exclusively owned by its handler thread
pub struct Connection<S: Read + Write> {
    shared: Arc<EngineShared>,
    stream: S,
    peer: SocketAddr,
    reader: UnitReader,
    machine: CalibrationStateMachine,
    announced_location: Option<String>,
    serial: Option<String>,
    last_poll: Option<Instant>,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(shared: Arc<EngineShared>, stream: S, peer: SocketAddr) -> Self {
        let polling = shared.config.engine.poll_interval().is_some();
        let machine = CalibrationStateMachine::new(&shared.config.calibration, polling);
        Self {
            shared,
            stream,
            peer,
            reader: UnitReader::new(),
            machine,
            announced_location: None,
            serial: None,
            last_poll: None,
        }
    }

    /// Device serial, once announced
    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    /// Process the stream until disconnect or shutdown
    pub fn run(&mut self) -> crate::error::Result<()> {
        while self.shared.running.load(Ordering::Relaxed) {
            let feed = match self.reader.feed_from(&mut self.stream) {
                Ok(feed) => feed,
                Err(crate::error::Error::Io(e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::ConnectionReset
                            | std::io::ErrorKind::UnexpectedEof
                            | std::io::ErrorKind::BrokenPipe
                    ) =>
                {
                    log::debug!("Connection {} reset: {}", self.peer, e);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            while let Some(event) = self.reader.next_unit() {
                match event {
                    UnitEvent::Unit(body) => self.handle_unit(&body),
                    UnitEvent::Discarded { bytes } => {
                        let key = self.location_key();
                        log::warn!(
                            "Connection {}: discarded {} bytes of unterminated input",
                            self.peer,
                            bytes
                        );
                        // Even garbage proves the device is alive
                        if let Some(record) = self.shared.health.touch(&key) {
                            self.shared.queue.push(Event::Health {
                                device: key.clone(),
                                record,
                            });
                        }
                        self.shared.packet_log.error(
                            &key,
                            &format!("unterminated unit discarded ({} bytes)", bytes),
                            "",
                        );
                    }
                }
            }

            if feed == FeedResult::Eof {
                return Ok(());
            }

            let now = Instant::now();
            if let Some(cmd) = self.machine.maybe_refetch(now) {
                self.send(cmd);
            }
            self.maybe_poll(now);
        }
        Ok(())
    }

    /// Logical key for health records and location-less packets
    fn location_key(&self) -> String {
        self.announced_location
            .clone()
            .unwrap_or_else(|| self.peer.ip().to_string())
    }

    fn handle_unit(&mut self, body: &str) {
        let packet = decode(body);
        let key = self.location_key();

        // Receipt itself proves liveness, malformed or not
        if let Some(record) = self.shared.health.touch(&key) {
            self.shared.queue.push(Event::Health {
                device: key.clone(),
                record,
            });
        }

        // Streaming gate: fires on the first unit of the connection only
        if let Some(cmd) = self.machine.on_unit() {
            self.send(cmd);
        }

        match packet {
            DevicePacket::Identity { serial } => {
                log::info!("Connection {}: device serial {:?}", self.peer, serial);
                self.shared.packet_log.raw(&key, body);
                self.serial = Some(serial);
            }
            DevicePacket::LocationAnnounce { loc_id } => {
                log::info!("Connection {}: location {:?}", self.peer, loc_id);
                self.shared.packet_log.raw(&loc_id, body);
                self.shared.directory.observe(self.peer.ip(), &loc_id);
                self.announced_location = Some(loc_id);
            }
            DevicePacket::SensorReading { loc_id, adc_values } => {
                // Packet location wins, then the announced one, then the IP
                let location = loc_id.unwrap_or(key);
                self.shared.packet_log.raw(&location, body);
                self.apply_sensor(&location, adc_values);
            }
            DevicePacket::ThermalFrame {
                frame_id,
                cells,
                embedded_calibration,
            } => {
                log::debug!(
                    "Connection {}: frame {} ({} cal words)",
                    self.peer,
                    frame_id,
                    embedded_calibration.len()
                );
                self.shared.packet_log.raw(&key, body);
                let (grid, cmd) =
                    self.machine
                        .on_frame(frame_id, &cells, &embedded_calibration, Instant::now());
                if let Some(cmd) = cmd {
                    self.send(cmd);
                }
                self.apply_grid(&key, grid);
            }
            DevicePacket::CalibrationResponse { calibration, .. } => {
                self.shared.packet_log.raw(&key, body);
                self.machine.on_calibration_response(&calibration);
            }
            DevicePacket::Malformed { reason, raw } => {
                log::warn!("Connection {}: malformed unit: {}", self.peer, reason);
                self.shared.packet_log.error(&key, &reason, &raw);
            }
        }
    }

    /// Fold ADC readings into the location's fusion input and re-fuse
    fn apply_sensor(&self, location: &str, adc_values: BTreeMap<String, i64>) {
        let config = &self.shared.config.fusion;
        let channels = &config.channels;

        let result = {
            let mut inputs = self.shared.fusion_inputs.lock();
            let input = inputs.entry(location.to_string()).or_default();
            if let Some(&counts) = adc_values.get(&channels.gas) {
                input.gas_ppm = Some(counts as f64 * channels.gas_ppm_per_count);
            }
            if let Some(&counts) = adc_values.get(&channels.flame) {
                input.flame = Some(counts != 0);
            }
            if let Some(&counts) = adc_values.get(&channels.vision) {
                input.vision_score = Some((counts as f64 / 1000.0).clamp(0.0, 1.0));
            }
            fusion::fuse(input, config)
        };

        if result.alarm {
            log::warn!(
                "ALARM at {:?}: sources {:?}, confidence {:.2}",
                location,
                result.contributing_sources,
                result.confidence
            );
        }

        self.shared.queue.push(Event::SensorUpdate {
            location: location.to_string(),
            timestamp_us: now_us(),
            values: adc_values,
        });
        self.shared.queue.push(Event::Fusion {
            location: location.to_string(),
            result,
        });
    }

    /// Fold a calibrated grid into the location's fusion input and re-fuse
    fn apply_grid(&self, location: &str, grid: ThermalGrid) {
        let config = &self.shared.config.fusion;
        let hot = fusion::hot_cells(&grid, config.temperature_threshold_c);

        let result = {
            let mut inputs = self.shared.fusion_inputs.lock();
            let input = inputs.entry(location.to_string()).or_default();
            input.thermal_hot_cells = hot;
            fusion::fuse(input, config)
        };

        if result.alarm {
            log::warn!(
                "ALARM at {:?}: sources {:?}, confidence {:.2}, {} hot cells",
                location,
                result.contributing_sources,
                result.confidence,
                result.hot_cells.len()
            );
        }

        self.shared.queue.push(Event::ThermalGridUpdate {
            location: location.to_string(),
            grid,
        });
        self.shared.queue.push(Event::Fusion {
            location: location.to_string(),
            result,
        });
    }

    /// On-demand polling: request a single frame at the configured interval
    fn maybe_poll(&mut self, now: Instant) {
        let Some(interval) = self.shared.config.engine.poll_interval() else {
            return;
        };
        let due = match self.last_poll {
            None => true,
            Some(last) => now.duration_since(last) >= interval,
        };
        if due {
            self.last_poll = Some(now);
            self.send(OutboundCommand::SingleFrame);
        }
    }

    fn send(&mut self, cmd: OutboundCommand) {
        log::debug!("Connection {}: sending {:?}", self.peer, cmd);
        if let Err(e) = cmd.send_to(&mut self.stream) {
            // The read path will observe the dead socket and wind down
            log::error!("Connection {}: command write failed: {}", self.peer, e);
        }
    }
}
