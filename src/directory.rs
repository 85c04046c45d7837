//! Device directory: IP to logical-location mapping
//!
//! Mappings come from two paths: auto-discovery (`observe`, driven by
//! `locid` announces) and operator pins (`pin`). Pins always win; an
//! observation can never overwrite one. The map persists to a TOML file so
//! locations survive daemon restarts; persistence failures are logged and
//! the directory keeps working in memory.
//!
//! Locking follows single-writer discipline: lookups take the read lock,
//! every mutation (and its persistence write) happens under the write lock.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// One mapping entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub location: String,
    /// Operator-pinned entries are never overwritten by auto-discovery
    #[serde(default)]
    pub pinned: bool,
}

/// On-disk representation
#[derive(Debug, Default, Serialize, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    devices: BTreeMap<String, DirectoryEntry>,
}

/// Bidirectional IP <-> logical-location directory
pub struct DeviceDirectory {
    inner: RwLock<BTreeMap<IpAddr, DirectoryEntry>>,
    path: Option<PathBuf>,
}

impl DeviceDirectory {
    /// In-memory directory with no persistence (tests, ephemeral runs)
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
            path: None,
        }
    }

    /// Load from `path`, or start empty if the file is missing or corrupt
    ///
    /// A corrupt file is an operational error, not a fatal one: the
    /// directory starts empty and will overwrite the file on the next
    /// mutation.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut map = BTreeMap::new();

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<DirectoryFile>(&contents) {
                Ok(file) => {
                    for (key, entry) in file.devices {
                        match key.parse::<IpAddr>() {
                            Ok(ip) => {
                                map.insert(ip, entry);
                            }
                            Err(_) => {
                                log::warn!("Directory entry with invalid IP skipped: {:?}", key);
                            }
                        }
                    }
                    log::info!("Device directory loaded: {} entries", map.len());
                }
                Err(e) => {
                    log::error!(
                        "Device directory {} is corrupt ({}), continuing in-memory",
                        path.display(),
                        e
                    );
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No device directory at {}, starting empty", path.display());
            }
            Err(e) => {
                log::error!(
                    "Failed to read device directory {} ({}), continuing in-memory",
                    path.display(),
                    e
                );
            }
        }

        Self {
            inner: RwLock::new(map),
            path: Some(path),
        }
    }

    /// Logical location for an IP, if known
    pub fn resolve(&self, ip: IpAddr) -> Option<String> {
        self.inner.read().get(&ip).map(|e| e.location.clone())
    }

    /// Reverse lookup: IP currently mapped to a logical location
    pub fn locate(&self, location: &str) -> Option<IpAddr> {
        self.inner
            .read()
            .iter()
            .find(|(_, e)| e.location == location)
            .map(|(&ip, _)| ip)
    }

    /// Record an auto-discovered mapping; pinned entries are untouched
    ///
    /// Returns whether the mapping changed.
    pub fn observe(&self, ip: IpAddr, location: &str) -> bool {
        let mut map = self.inner.write();
        match map.get(&ip) {
            Some(entry) if entry.pinned => {
                if entry.location != location {
                    log::debug!(
                        "Ignoring observed location {:?} for {}: pinned to {:?}",
                        location,
                        ip,
                        entry.location
                    );
                }
                return false;
            }
            Some(entry) if entry.location == location => return false,
            _ => {}
        }
        map.insert(
            ip,
            DirectoryEntry {
                location: location.to_string(),
                pinned: false,
            },
        );
        log::info!("Directory: observed {} -> {:?}", ip, location);
        self.persist(&map);
        true
    }

    /// Pin a mapping; wins over any past or future observation
    pub fn pin(&self, ip: IpAddr, location: &str) {
        let mut map = self.inner.write();
        map.insert(
            ip,
            DirectoryEntry {
                location: location.to_string(),
                pinned: true,
            },
        );
        log::info!("Directory: pinned {} -> {:?}", ip, location);
        self.persist(&map);
    }

    /// All current entries (operator visibility)
    pub fn snapshot(&self) -> Vec<(IpAddr, DirectoryEntry)> {
        self.inner
            .read()
            .iter()
            .map(|(&ip, e)| (ip, e.clone()))
            .collect()
    }

    /// Write the map to disk; called under the write lock so saves are
    /// serialized. Failure is logged and never interrupts the data path.
    fn persist(&self, map: &BTreeMap<IpAddr, DirectoryEntry>) {
        let Some(path) = &self.path else {
            return;
        };
        let file = DirectoryFile {
            devices: map
                .iter()
                .map(|(ip, e)| (ip.to_string(), e.clone()))
                .collect(),
        };
        let result = toml::to_string_pretty(&file)
            .map_err(|e| e.to_string())
            .and_then(|s| std::fs::write(path, s).map_err(|e| e.to_string()));
        if let Err(e) = result {
            log::error!(
                "Failed to persist device directory to {}: {}",
                path.display(),
                e
            );
        }
    }
}
