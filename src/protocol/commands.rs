//! Outbound device commands
//!
//! Commands are single ASCII tokens with no payload and no terminator. The
//! calibration state machine decides when each may be sent; the connection
//! engine only writes the bytes.

use std::io::{self, Write};

/// Commands the daemon can send to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundCommand {
    /// Begin continuous frame streaming (at most once per connection)
    StartStreaming,
    /// Request a single frame (on-demand polling mode only)
    SingleFrame,
    /// Request the calibration EEPROM (embedded block failed validation)
    FetchCalibration,
}

impl OutboundCommand {
    /// The wire token for this command
    pub fn token(&self) -> u8 {
        match self {
            OutboundCommand::StartStreaming => b'A',
            OutboundCommand::SingleFrame => b'B',
            OutboundCommand::FetchCalibration => b'E',
        }
    }

    /// Write the command to any writer (TCP stream, mock)
    pub fn send_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&[self.token()])
    }
}
