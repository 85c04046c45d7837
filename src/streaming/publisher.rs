//! TCP event publisher
//!
//! Subscribers (presentation, alerting) connect to the pub address and
//! receive every event as a length-prefixed frame. The publisher thread
//! drains the bounded event queue in small batches, serializes each event
//! once, and fans it out to all live subscribers; a failed write prunes
//! the subscriber. Backpressure is handled upstream by the queue's
//! drop-oldest policy, so a slow subscriber can delay but never wedge the
//! daemon.

use crate::error::Result;
use crate::events::{Event, EventQueue};
use crate::streaming::wire::Serializer;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Events serialized per loop iteration
const DRAIN_BATCH: usize = 32;

/// Fan-out publisher for subscriber connections
pub struct EventPublisher {
    listener: TcpListener,
    serializer: Serializer,
    queue: Arc<EventQueue>,
    running: Arc<AtomicBool>,
    subscribers: Vec<TcpStream>,
}

impl EventPublisher {
    /// Bind the pub address; the listener is nonblocking so the publisher
    /// loop can interleave accepts with queue drains
    pub fn bind(
        address: &str,
        serializer: Serializer,
        queue: Arc<EventQueue>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        log::info!("Event publisher listening on {}", address);
        Ok(Self {
            listener,
            serializer,
            queue,
            running,
            subscribers: Vec::new(),
        })
    }

    /// Local address actually bound (ephemeral ports in tests)
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run until the shutdown flag clears
    pub fn run(&mut self) {
        let mut batch: Vec<Event> = Vec::with_capacity(DRAIN_BATCH);
        let mut frame: Vec<u8> = Vec::with_capacity(4096);

        while self.running.load(Ordering::Relaxed) {
            self.accept_subscribers();

            batch.clear();
            self.queue.drain_into(&mut batch, DRAIN_BATCH);

            if batch.is_empty() {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }

            for event in &batch {
                match self.serializer.encode_frame(event, &mut frame) {
                    Ok(()) => self.broadcast(&frame),
                    Err(e) => log::error!("Event serialization failed: {}", e),
                }
            }

            // Yield briefly between batches to keep the accept path live
            std::thread::sleep(Duration::from_micros(500));
        }

        log::info!("Event publisher stopped");
    }

    fn accept_subscribers(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    log::info!("Event subscriber connected: {}", addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        log::debug!("set_nodelay failed for {}: {}", addr, e);
                    }
                    self.subscribers.push(stream);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("Subscriber accept error: {}", e);
                    break;
                }
            }
        }
    }

    /// Write one frame to every subscriber, pruning the dead
    fn broadcast(&mut self, frame: &[u8]) {
        self.subscribers.retain_mut(|stream| {
            match stream.write_all(frame) {
                Ok(()) => true,
                Err(e) => {
                    log::info!(
                        "Dropping event subscriber {:?}: {}",
                        stream.peer_addr().ok(),
                        e
                    );
                    false
                }
            }
        });
    }
}
