//! Append-only packet log with size rotation
//!
//! Every decoded or malformed unit is recorded as one tab-separated line:
//!
//! ```text
//! <unix_micros>\t<location_or_ip>\tRAW\t-\t<raw_unit>
//! <unix_micros>\t<location_or_ip>\tERROR\t<reason>\t<raw_unit>
//! ```
//!
//! When the active file exceeds `max_bytes` it rotates:
//! `packets.log` -> `packets.log.1` -> ... up to `keep` generations.
//! Log failures never interrupt the data path.

use crate::config::PacketLogConfig;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

struct LogInner {
    file: Option<File>,
    written: u64,
}

/// Size-rotated packet log, shared by all connection threads
pub struct PacketLog {
    path: PathBuf,
    max_bytes: u64,
    keep: u32,
    inner: Mutex<LogInner>,
}

impl PacketLog {
    pub fn open(config: &PacketLogConfig) -> Self {
        let path = PathBuf::from(&config.path);
        let (file, written) = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => {
                let len = f.metadata().map(|m| m.len()).unwrap_or(0);
                (Some(f), len)
            }
            Err(e) => {
                log::error!("Failed to open packet log {}: {}", path.display(), e);
                (None, 0)
            }
        };
        Self {
            path,
            max_bytes: config.max_bytes,
            keep: config.keep,
            inner: Mutex::new(LogInner { file, written }),
        }
    }

    /// Record a successfully decoded unit
    pub fn raw(&self, location: &str, payload: &str) {
        self.write_line(location, "RAW", "-", payload);
    }

    /// Record a malformed unit with its rejection reason
    pub fn error(&self, location: &str, reason: &str, payload: &str) {
        self.write_line(location, "ERROR", reason, payload);
    }

    fn write_line(&self, location: &str, kind: &str, reason: &str, payload: &str) {
        let timestamp_us = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        // Tabs inside fields would break the column format
        let reason = reason.replace('\t', " ");
        let line = format!(
            "{}\t{}\t{}\t{}\t{}\n",
            timestamp_us, location, kind, reason, payload
        );

        let mut inner = self.inner.lock();
        if inner.written >= self.max_bytes {
            self.rotate(&mut inner);
        }
        if let Some(file) = inner.file.as_mut() {
            match file.write_all(line.as_bytes()) {
                Ok(()) => inner.written += line.len() as u64,
                Err(e) => log::warn!("Packet log write failed: {}", e),
            }
        }
    }

    /// Shift rotated generations and start a fresh active file
    fn rotate(&self, inner: &mut LogInner) {
        inner.file = None;

        for i in (1..self.keep).rev() {
            let from = self.numbered(i);
            let to = self.numbered(i + 1);
            if from.exists() {
                let _ = std::fs::rename(&from, &to);
            }
        }
        if self.keep > 0 {
            let _ = std::fs::rename(&self.path, self.numbered(1));
        } else {
            let _ = std::fs::remove_file(&self.path);
        }

        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(f) => {
                inner.file = Some(f);
                inner.written = 0;
                log::debug!("Packet log rotated");
            }
            Err(e) => {
                log::error!("Packet log rotation failed: {}", e);
            }
        }
    }

    fn numbered(&self, i: u32) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{}", i));
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path, max_bytes: u64) -> PacketLogConfig {
        PacketLogConfig {
            path: dir.join("packets.log").to_string_lossy().into_owned(),
            max_bytes,
            keep: 2,
        }
    }

    #[test]
    fn test_line_format() {
        let tmp = tempfile::tempdir().unwrap();
        let log = PacketLog::open(&config(tmp.path(), 1024 * 1024));
        log.raw("room_1", "locid:room_1");
        log.error("10.0.0.5", "unknown unit type", "video:h264");

        let contents = std::fs::read_to_string(tmp.path().join("packets.log")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let fields: Vec<&str> = lines[0].split('\t').collect();
        assert_eq!(fields.len(), 5);
        assert!(fields[0].parse::<u64>().unwrap() > 0);
        assert_eq!(fields[1], "room_1");
        assert_eq!(fields[2], "RAW");
        assert_eq!(fields[3], "-");
        assert_eq!(fields[4], "locid:room_1");

        let fields: Vec<&str> = lines[1].split('\t').collect();
        assert_eq!(fields[2], "ERROR");
        assert_eq!(fields[3], "unknown unit type");
        assert_eq!(fields[4], "video:h264");
    }

    #[test]
    fn test_rotation() {
        let tmp = tempfile::tempdir().unwrap();
        let log = PacketLog::open(&config(tmp.path(), 200));

        for i in 0..40 {
            log.raw("room_1", &format!("Sensor:ADC1={}", i));
        }

        let active = tmp.path().join("packets.log");
        let rotated = tmp.path().join("packets.log.1");
        assert!(active.exists());
        assert!(rotated.exists(), "expected at least one rotation");
        // Rotated generations are bounded by keep=2
        assert!(!tmp.path().join("packets.log.3").exists());
        // Active file was restarted, not still growing past the limit
        let len = std::fs::metadata(&active).unwrap().len();
        assert!(len < 400, "active file should have been rotated, len={}", len);
    }
}
