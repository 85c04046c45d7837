//! Connection engine
//!
//! Accepts device connections and runs one named handler thread per
//! connection, so per-connection decoding and calibration transitions are
//! strictly sequential. Cross-connection state is limited to the shared
//! handles in [`EngineShared`]; the device directory is the only map
//! touched by multiple connections and serializes writes internally.
//!
//! The accept loop is nonblocking with a short sleep, matching the read
//! timeout used inside connections, so the shutdown flag is honored
//! everywhere within ~500 ms.

pub mod connection;

pub use connection::Connection;

use crate::config::AppConfig;
use crate::directory::DeviceDirectory;
use crate::error::Result;
use crate::events::EventQueue;
use crate::fusion::FusionInput;
use crate::health::{Dialer, DeviceHealthMonitor};
use crate::packet_log::PacketLog;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Handles shared by every connection thread
pub struct EngineShared {
    pub config: AppConfig,
    pub directory: Arc<DeviceDirectory>,
    pub health: Arc<DeviceHealthMonitor>,
    pub queue: Arc<EventQueue>,
    pub packet_log: Arc<PacketLog>,
    /// Latest per-location fusion inputs (last value wins per field)
    pub fusion_inputs: Mutex<HashMap<String, FusionInput>>,
    pub running: Arc<AtomicBool>,
}

impl EngineShared {
    pub fn new(
        config: AppConfig,
        directory: Arc<DeviceDirectory>,
        health: Arc<DeviceHealthMonitor>,
        queue: Arc<EventQueue>,
        packet_log: Arc<PacketLog>,
        running: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            directory,
            health,
            queue,
            packet_log,
            fusion_inputs: Mutex::new(HashMap::new()),
            running,
        })
    }
}

/// Accept loop over the device listener
pub struct ConnectionEngine {
    shared: Arc<EngineShared>,
}

impl ConnectionEngine {
    pub fn new(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }

    pub fn shared(&self) -> Arc<EngineShared> {
        Arc::clone(&self.shared)
    }

    /// Accept device connections until the shutdown flag clears
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        listener.set_nonblocking(true)?;
        log::info!(
            "Device listener on {} ({} mode)",
            listener.local_addr()?,
            if self.shared.config.engine.poll_interval().is_some() {
                "polling"
            } else {
                "streaming"
            }
        );

        while self.shared.running.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    spawn_connection(Arc::clone(&self.shared), stream, addr);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    log::error!("Accept error: {}", e);
                }
            }
        }

        log::info!("Device listener stopped");
        Ok(())
    }
}

/// Start a handler thread for one device connection
///
/// Used by both the accept loop and the reconnect dialer.
pub fn spawn_connection(shared: Arc<EngineShared>, stream: TcpStream, addr: SocketAddr) {
    log::info!("Device connected: {}", addr);

    // The read timeout bounds how long a connection thread can ignore the
    // shutdown flag
    if let Err(e) = stream.set_read_timeout(Some(Duration::from_millis(500))) {
        log::warn!("Failed to set read timeout for {}: {}", addr, e);
    }
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("set_nodelay failed for {}: {}", addr, e);
    }

    let spawned = thread::Builder::new()
        .name(format!("conn-{}", addr.ip()))
        .spawn(move || {
            let mut conn = Connection::new(shared, stream, addr);
            match conn.run() {
                Ok(()) => log::info!("Device disconnected: {}", addr),
                Err(e) => log::warn!("Connection {} ended with error: {}", addr, e),
            }
        });
    if let Err(e) = spawned {
        log::error!("Failed to spawn connection thread for {}: {}", addr, e);
    }
}

/// Production reconnect dialer: connects out to `device_ip:device_port`
/// and hands the stream to a normal connection thread
///
/// The engine handle is attached after construction because the health
/// monitor (which owns the dialer) is itself part of the engine's shared
/// state.
pub struct TcpDialer {
    directory: Arc<DeviceDirectory>,
    device_port: u16,
    engine: Mutex<Option<Arc<EngineShared>>>,
}

impl TcpDialer {
    pub fn new(directory: Arc<DeviceDirectory>, device_port: u16) -> Arc<Self> {
        Arc::new(Self {
            directory,
            device_port,
            engine: Mutex::new(None),
        })
    }

    /// Late-bind the engine once its shared state exists
    pub fn attach(&self, shared: Arc<EngineShared>) {
        *self.engine.lock() = Some(shared);
    }
}

impl Dialer for Arc<TcpDialer> {
    fn dial(&self, device: &str) -> std::result::Result<(), String> {
        let shared = self
            .engine
            .lock()
            .clone()
            .ok_or_else(|| "engine not started".to_string())?;

        // Device keys are logical locations when known, IP strings otherwise
        let ip: IpAddr = match device.parse() {
            Ok(ip) => ip,
            Err(_) => self
                .directory
                .locate(device)
                .ok_or_else(|| format!("no known address for {:?}", device))?,
        };

        let addr = SocketAddr::new(ip, self.device_port);
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(3))
            .map_err(|e| format!("connect to {} failed: {}", addr, e))?;
        spawn_connection(shared, stream, addr);
        Ok(())
    }
}
