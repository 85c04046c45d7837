//! Device wire protocol
//!
//! Unit format: `#<body>!` over a persistent TCP stream, ASCII text. The
//! leading `#` marks the start of a unit and `!` terminates it; an optional
//! `\r\n` after the terminator is consumed silently. Bodies:
//!
//! ```text
//! serialno:<id>                      device identity
//! locid:<name>                       logical-location announce
//! Sensor:[<loc>:]k=v,k=v,...         ADC readings (loc may also appear as
//!                                    a loc=<name> field, or be absent)
//! frame<id>:<3072|3336 hex chars>    thermal grid, optionally with a
//!                                    trailing embedded calibration block
//! EEPROM<id>:<3328 hex chars>        calibration-only response
//! ```
//!
//! Parsing is stateless per unit and never fails outward: anything that
//! cannot be decoded becomes a [`DevicePacket::Malformed`] carrying the raw
//! unit for logging. Stream framing (byte stream -> units) lives in
//! [`UnitReader`].

pub mod commands;
pub mod packet;
pub mod unit_reader;

pub use commands::OutboundCommand;
pub use packet::{decode, DevicePacket};
pub use unit_reader::UnitReader;

/// Thermal grid dimensions (rows x cols)
pub const GRID_ROWS: usize = 24;
pub const GRID_COLS: usize = 32;
pub const GRID_CELLS: usize = GRID_ROWS * GRID_COLS;

/// Characters per 16-bit hex cell
pub const CELL_CHARS: usize = 4;

/// Grid-only frame payload length in characters
pub const GRID_CHARS: usize = GRID_CELLS * CELL_CHARS; // 3072

/// Embedded calibration trailer: 66 words appended to the grid payload
pub const EMBEDDED_CAL_WORDS: usize = 66;
pub const FRAME_WITH_CAL_CHARS: usize = GRID_CHARS + EMBEDDED_CAL_WORDS * CELL_CHARS; // 3336

/// Calibration-only (EEPROM) response: 832 words
pub const EEPROM_WORDS: usize = 832;
pub const EEPROM_CHARS: usize = EEPROM_WORDS * CELL_CHARS; // 3328

/// Unit delimiters
pub const UNIT_START: u8 = b'#';
pub const UNIT_END: u8 = b'!';

/// A unit longer than this without a terminator is garbage; the reader
/// resyncs on the next start marker
pub const MAX_UNIT_SIZE: usize = 8192;
