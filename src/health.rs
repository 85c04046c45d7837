//! Device liveness tracking and bounded auto-reconnection
//!
//! One record per device, created on first sighting and never deleted.
//! `Online -> Offline` after the liveness window elapses without activity
//! (a socket close alone does not flip a device offline; brief network
//! blips are tolerated). `Offline -> Reconnecting` drives dial attempts at
//! the retry interval, bounded by `max_attempts`; after that the record
//! rests in `Offline` until an operator calls [`manual_reconnect`], which
//! resets the counter and restarts the cycle. `Reconnecting -> Online` on
//! the next activity.
//!
//! [`manual_reconnect`]: DeviceHealthMonitor::manual_reconnect
//!
//! Dialing goes through the [`Dialer`] trait so the monitor is testable
//! without sockets; the production dialer lives in the connection engine.
//! Dial attempts run with the record lock released - a slow connect must
//! not stall activity updates from connection threads.

use crate::config::HealthConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Device liveness states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Reconnecting,
}

/// Operator-visible health record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceHealthRecord {
    pub status: DeviceStatus,
    /// Wall-clock time of last activity, microseconds since epoch
    pub last_seen_us: u64,
    pub attempt_count: u32,
    pub last_failure_reason: Option<String>,
}

/// Outbound reconnection hook
pub trait Dialer: Send + Sync {
    /// Attempt to re-establish a connection to `device` (a logical location
    /// or an IP string). Ok means a connection was opened; the device goes
    /// `Online` once its traffic arrives.
    fn dial(&self, device: &str) -> Result<(), String>;
}

struct RecordInner {
    record: DeviceHealthRecord,
    last_seen: Instant,
    last_attempt: Option<Instant>,
}

fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Per-device health state machine driver
pub struct DeviceHealthMonitor {
    config: HealthConfig,
    dialer: Box<dyn Dialer>,
    records: Mutex<HashMap<String, RecordInner>>,
}

impl DeviceHealthMonitor {
    pub fn new(config: HealthConfig, dialer: Box<dyn Dialer>) -> Self {
        Self {
            config,
            dialer,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Record activity for a device; returns the new record if the status
    /// changed (first sighting or a transition to `Online`)
    pub fn touch(&self, device: &str) -> Option<DeviceHealthRecord> {
        self.touch_at(device, Instant::now())
    }

    fn touch_at(&self, device: &str, now: Instant) -> Option<DeviceHealthRecord> {
        let mut records = self.records.lock();
        match records.get_mut(device) {
            Some(inner) => {
                inner.last_seen = now;
                inner.record.last_seen_us = now_us();
                if inner.record.status != DeviceStatus::Online {
                    inner.record.status = DeviceStatus::Online;
                    inner.record.attempt_count = 0;
                    log::info!("Device {} is online", device);
                    Some(inner.record.clone())
                } else {
                    None
                }
            }
            None => {
                let record = DeviceHealthRecord {
                    status: DeviceStatus::Online,
                    last_seen_us: now_us(),
                    attempt_count: 0,
                    last_failure_reason: None,
                };
                log::info!("Device {} seen for the first time", device);
                records.insert(
                    device.to_string(),
                    RecordInner {
                        record: record.clone(),
                        last_seen: now,
                        last_attempt: None,
                    },
                );
                Some(record)
            }
        }
    }

    /// Operator-initiated reconnect: resets the attempt counter and
    /// restarts the retry cycle. Returns false for an unknown device.
    pub fn manual_reconnect(&self, device: &str) -> bool {
        let mut records = self.records.lock();
        let Some(inner) = records.get_mut(device) else {
            return false;
        };
        inner.record.attempt_count = 0;
        inner.record.status = DeviceStatus::Reconnecting;
        inner.last_attempt = None;
        log::info!("Manual reconnect requested for {}", device);
        true
    }

    /// Advance every record's state machine; returns the records that
    /// changed status this tick (for health events)
    pub fn tick(&self, now: Instant) -> Vec<(String, DeviceHealthRecord)> {
        let mut changed: Vec<String> = Vec::new();
        let mut to_dial: Vec<String> = Vec::new();

        {
            let mut records = self.records.lock();
            for (device, inner) in records.iter_mut() {
                // Liveness: no activity within the window means offline,
                // regardless of socket state
                if inner.record.status == DeviceStatus::Online
                    && now.duration_since(inner.last_seen) > self.config.liveness_timeout()
                {
                    inner.record.status = DeviceStatus::Offline;
                    inner.record.last_failure_reason = Some(format!(
                        "no activity for {}s",
                        self.config.liveness_timeout_secs
                    ));
                    log::warn!("Device {} went offline (liveness timeout)", device);
                    changed.push(device.clone());
                }

                // Bounded automatic reconnection
                let resting = inner.record.attempt_count >= self.config.max_attempts;
                let offline = matches!(
                    inner.record.status,
                    DeviceStatus::Offline | DeviceStatus::Reconnecting
                );
                let due = match inner.last_attempt {
                    None => true,
                    Some(last) => now.duration_since(last) >= self.config.retry_interval(),
                };
                if offline && !resting && due {
                    if inner.record.status != DeviceStatus::Reconnecting {
                        changed.push(device.clone());
                    }
                    inner.record.status = DeviceStatus::Reconnecting;
                    inner.record.attempt_count += 1;
                    inner.last_attempt = Some(now);
                    to_dial.push(device.clone());
                }
            }
        }

        // Dial with the lock released
        let mut failures: Vec<(String, String)> = Vec::new();
        for device in &to_dial {
            log::info!("Reconnect attempt for {}", device);
            if let Err(reason) = self.dialer.dial(device) {
                failures.push((device.clone(), reason));
            }
        }

        {
            let mut records = self.records.lock();
            for (device, reason) in failures {
                let Some(inner) = records.get_mut(&device) else {
                    continue;
                };
                // Activity may have raced the dial and flipped it online
                if inner.record.status == DeviceStatus::Online {
                    continue;
                }
                log::warn!(
                    "Reconnect attempt {}/{} for {} failed: {}",
                    inner.record.attempt_count,
                    self.config.max_attempts,
                    device,
                    reason
                );
                inner.record.last_failure_reason = Some(reason);
                if inner.record.attempt_count >= self.config.max_attempts {
                    inner.record.status = DeviceStatus::Offline;
                    inner.record.last_failure_reason = Some(format!(
                        "retries exhausted after {} attempts; manual reconnect required",
                        self.config.max_attempts
                    ));
                    log::error!(
                        "Device {} exhausted {} reconnect attempts",
                        device,
                        self.config.max_attempts
                    );
                    changed.push(device);
                }
            }

            changed.sort();
            changed.dedup();
            changed
                .into_iter()
                .filter_map(|d| records.get(&d).map(|i| (d.clone(), i.record.clone())))
                .collect()
        }
    }

    /// Current record for one device
    pub fn record(&self, device: &str) -> Option<DeviceHealthRecord> {
        self.records.lock().get(device).map(|i| i.record.clone())
    }

    /// All current records
    pub fn snapshot(&self) -> Vec<(String, DeviceHealthRecord)> {
        self.records
            .lock()
            .iter()
            .map(|(d, i)| (d.clone(), i.record.clone()))
            .collect()
    }
}
