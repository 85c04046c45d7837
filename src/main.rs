//! AgniIO - telemetry ingest daemon for fire-detection edge devices
//!
//! ## Architecture
//!
//! - **TCP (device port)**: persistent inbound connections from thermal
//!   cameras and sensor boards, one handler thread each
//! - **TCP (pub port)**: outbound event stream (grids, readings, fusion
//!   decisions, health transitions) to subscribed consumers
//!
//! A health monitor thread watches per-device liveness and drives bounded
//! outbound reconnection to devices that went quiet.

use agni_io::config::AppConfig;
use agni_io::directory::DeviceDirectory;
use agni_io::engine::{ConnectionEngine, EngineShared, TcpDialer};
use agni_io::error::{Error, Result};
use agni_io::events::{Event, EventQueue};
use agni_io::health::DeviceHealthMonitor;
use agni_io::packet_log::PacketLog;
use agni_io::streaming::{EventPublisher, Serializer, WireFormat};
use std::env;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Parse config path from command line arguments.
///
/// Supports:
/// - `agni-io <path>` (positional)
/// - `agni-io --config <path>` (flag-based)
/// - `agni-io -c <path>` (short flag)
///
/// Defaults to `/etc/agni-io.toml` if not specified.
fn parse_config_path() -> String {
    let args: Vec<String> = env::args().collect();

    for i in 1..args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }

    if args.len() > 1 && !args[1].starts_with('-') {
        return args[1].clone();
    }

    "/etc/agni-io.toml".to_string()
}

fn main() -> Result<()> {
    let config_path = parse_config_path();
    let config = match AppConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Could not load config {} ({}), using defaults",
                config_path, e
            );
            AppConfig::default()
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.logging.level),
    )
    .init();

    log::info!("AgniIO v{} starting...", env!("CARGO_PKG_VERSION"));
    log::info!("Using config: {}", config_path);

    // Shutdown flag flipped by Ctrl-C
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| Error::Other(format!("Error setting Ctrl-C handler: {}", e)))?;

    // Shared state
    let directory = Arc::new(DeviceDirectory::load_or_create(&config.directory.path));
    let packet_log = Arc::new(PacketLog::open(&config.packet_log));
    let queue = Arc::new(EventQueue::new(config.engine.event_queue_capacity));

    let dialer = TcpDialer::new(Arc::clone(&directory), config.network.device_port);
    let health = Arc::new(DeviceHealthMonitor::new(
        config.health.clone(),
        Box::new(Arc::clone(&dialer)),
    ));

    let shared = EngineShared::new(
        config.clone(),
        Arc::clone(&directory),
        Arc::clone(&health),
        Arc::clone(&queue),
        packet_log,
        Arc::clone(&running),
    );
    dialer.attach(Arc::clone(&shared));

    // Event publisher thread
    let wire_format = WireFormat::from_config(&config.engine.wire_format);
    log::info!("Wire format: {:?}", wire_format);
    let mut publisher = EventPublisher::bind(
        &config.network.pub_address,
        Serializer::new(wire_format),
        Arc::clone(&queue),
        Arc::clone(&running),
    )?;
    let _pub_handle = thread::Builder::new()
        .name("event-publisher".to_string())
        .spawn(move || publisher.run())
        .map_err(|e| Error::Other(format!("Failed to spawn publisher: {}", e)))?;

    // Health monitor thread: one tick per second, transitions become events
    let monitor_health = Arc::clone(&health);
    let monitor_queue = Arc::clone(&queue);
    let monitor_running = Arc::clone(&running);
    let _health_handle = thread::Builder::new()
        .name("health-monitor".to_string())
        .spawn(move || {
            while monitor_running.load(Ordering::Relaxed) {
                for (device, record) in monitor_health.tick(Instant::now()) {
                    monitor_queue.push(Event::Health { device, record });
                }
                thread::sleep(Duration::from_secs(1));
            }
            log::info!("Health monitor stopped");
        })
        .map_err(|e| Error::Other(format!("Failed to spawn health monitor: {}", e)))?;

    // Device accept loop on the main thread
    let listener = TcpListener::bind(&config.network.bind_address).map_err(|e| {
        Error::Other(format!(
            "Failed to bind to {}: {}",
            config.network.bind_address, e
        ))
    })?;
    log::info!("AgniIO running. Press Ctrl-C to stop.");

    let engine = ConnectionEngine::new(shared);
    engine.serve(listener)?;

    log::info!("AgniIO stopped");
    Ok(())
}
