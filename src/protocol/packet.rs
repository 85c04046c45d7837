//! Unit body -> typed packet decoding
//!
//! [`decode`] is stateless and total: every failure mode yields
//! [`DevicePacket::Malformed`] with the raw body attached, so a bad unit can
//! always be logged verbatim and never tears down the connection.

use super::{EEPROM_CHARS, EEPROM_WORDS, FRAME_WITH_CAL_CHARS, GRID_CELLS, GRID_CHARS};
use std::collections::BTreeMap;

/// One decoded protocol unit
#[derive(Debug, Clone, PartialEq)]
pub enum DevicePacket {
    /// Device serial number announce
    Identity { serial: String },
    /// Logical-location announce
    LocationAnnounce { loc_id: String },
    /// ADC sensor readings; `loc_id` is `None` when the device sent no
    /// location (caller falls back to the connection's remote IP)
    SensorReading {
        loc_id: Option<String>,
        adc_values: BTreeMap<String, i64>,
    },
    /// Thermal grid frame; `embedded_calibration` is empty for the
    /// grid-only encoding
    ThermalFrame {
        frame_id: u32,
        cells: Vec<i16>,
        embedded_calibration: Vec<u16>,
    },
    /// Calibration-only EEPROM response
    CalibrationResponse { frame_id: u32, calibration: Vec<u16> },
    /// Anything that failed to decode, kept verbatim for logging
    Malformed { reason: String, raw: String },
}

/// Convert a raw 16-bit cell value to signed two's complement
///
/// Values above 32767 represent negatives: `raw - 65536`.
#[inline]
pub fn signed16(raw: u16) -> i16 {
    if raw > 0x7FFF {
        (raw as i32 - 65536) as i16
    } else {
        raw as i16
    }
}

/// Decode one unit body (text between `#` and `!`)
pub fn decode(body: &str) -> DevicePacket {
    if let Some(serial) = body.strip_prefix("serialno:") {
        if serial.is_empty() {
            return malformed("empty serial number", body);
        }
        return DevicePacket::Identity {
            serial: serial.to_string(),
        };
    }

    if let Some(loc) = body.strip_prefix("locid:") {
        if loc.is_empty() {
            return malformed("empty location id", body);
        }
        return DevicePacket::LocationAnnounce {
            loc_id: loc.to_string(),
        };
    }

    if let Some(rest) = body.strip_prefix("Sensor:") {
        return decode_sensor(rest, body);
    }

    if let Some(rest) = body.strip_prefix("frame") {
        return decode_frame(rest, body);
    }

    if let Some(rest) = body.strip_prefix("EEPROM") {
        return decode_eeprom(rest, body);
    }

    malformed("unknown unit type", body)
}

fn malformed(reason: impl Into<String>, raw: &str) -> DevicePacket {
    DevicePacket::Malformed {
        reason: reason.into(),
        raw: raw.to_string(),
    }
}

/// Sensor readings arrive in three historical encodings:
///
/// 1. `Sensor:<loc>:ADC1=1,ADC2=2` - location prefix
/// 2. `Sensor:ADC1=1,ADC2=2,loc=room` - location as a field
/// 3. `Sensor:ADC1=1,ADC2=2` - no location
fn decode_sensor(rest: &str, body: &str) -> DevicePacket {
    let (mut loc_id, pairs) = match rest.split_once(':') {
        Some((prefix, tail)) if !prefix.contains('=') => {
            if prefix.is_empty() {
                return malformed("empty location prefix in sensor reading", body);
            }
            (Some(prefix.to_string()), tail)
        }
        _ => (None, rest),
    };

    let mut adc_values = BTreeMap::new();
    for pair in pairs.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            return malformed(format!("sensor field without '=': {:?}", pair), body);
        };
        if key.is_empty() {
            return malformed("sensor field with empty key", body);
        }
        // Location supplied as a field rather than a prefix
        if key == "loc" {
            if value.is_empty() {
                return malformed("empty loc field in sensor reading", body);
            }
            loc_id = Some(value.to_string());
            continue;
        }
        let Ok(parsed) = value.parse::<i64>() else {
            return malformed(format!("non-integer value for {}: {:?}", key, value), body);
        };
        adc_values.insert(key.to_string(), parsed);
    }

    if adc_values.is_empty() {
        return malformed("sensor reading carries no channels", body);
    }

    DevicePacket::SensorReading { loc_id, adc_values }
}

fn decode_frame(rest: &str, body: &str) -> DevicePacket {
    let Some((id, payload)) = split_numeric_id(rest) else {
        return malformed("missing frame id", body);
    };

    match payload.len() {
        GRID_CHARS => match decode_cells(payload, GRID_CELLS) {
            Ok(cells) => DevicePacket::ThermalFrame {
                frame_id: id,
                cells,
                embedded_calibration: Vec::new(),
            },
            Err(reason) => malformed(reason, body),
        },
        FRAME_WITH_CAL_CHARS => {
            let cells = match decode_cells(&payload[..GRID_CHARS], GRID_CELLS) {
                Ok(c) => c,
                Err(reason) => return malformed(reason, body),
            };
            match decode_words(&payload[GRID_CHARS..], GRID_CHARS) {
                Ok(embedded_calibration) => DevicePacket::ThermalFrame {
                    frame_id: id,
                    cells,
                    embedded_calibration,
                },
                Err(reason) => malformed(reason, body),
            }
        }
        n => malformed(
            format!(
                "thermal frame payload length mismatch: expected {} or {} chars, got {}",
                GRID_CHARS, FRAME_WITH_CAL_CHARS, n
            ),
            body,
        ),
    }
}

fn decode_eeprom(rest: &str, body: &str) -> DevicePacket {
    let Some((id, payload)) = split_numeric_id(rest) else {
        return malformed("missing calibration response id", body);
    };

    if payload.len() != EEPROM_CHARS {
        return malformed(
            format!(
                "calibration payload length mismatch: expected {} chars, got {}",
                EEPROM_CHARS,
                payload.len()
            ),
            body,
        );
    }

    match decode_words(payload, 0) {
        Ok(calibration) => {
            debug_assert_eq!(calibration.len(), EEPROM_WORDS);
            DevicePacket::CalibrationResponse {
                frame_id: id,
                calibration,
            }
        }
        Err(reason) => malformed(reason, body),
    }
}

/// Split `<digits>:<payload>`, parsing the leading decimal id
fn split_numeric_id(rest: &str) -> Option<(u32, &str)> {
    let (id_part, payload) = rest.split_once(':')?;
    let id = id_part.parse::<u32>().ok()?;
    Some((id, payload))
}

/// Decode `count` signed 16-bit cells from a 4-hex-chars-per-cell payload
fn decode_cells(payload: &str, count: usize) -> Result<Vec<i16>, String> {
    let words = decode_words(payload, 0)?;
    debug_assert_eq!(words.len(), count);
    Ok(words.into_iter().map(signed16).collect())
}

/// Decode unsigned 16-bit words from a hex payload
///
/// `offset_base` is added to reported character offsets so errors in a
/// trailing calibration block point at the right place in the full payload.
fn decode_words(payload: &str, offset_base: usize) -> Result<Vec<u16>, String> {
    if !payload.is_ascii() {
        return Err("payload contains non-ASCII bytes".to_string());
    }
    debug_assert_eq!(payload.len() % 4, 0);

    let mut words = Vec::with_capacity(payload.len() / 4);
    for (i, chunk) in payload.as_bytes().chunks_exact(4).enumerate() {
        // from_str_radix alone would admit signs ("+123"), so gate on
        // hex digits explicitly
        if !chunk.iter().all(|b| b.is_ascii_hexdigit()) {
            return Err(format!(
                "invalid hex cell at char offset {}: {:?}",
                offset_base + i * 4,
                String::from_utf8_lossy(chunk)
            ));
        }
        let cell = std::str::from_utf8(chunk).map_err(|_| "payload encoding error".to_string())?;
        let raw = u16::from_str_radix(cell, 16).map_err(|_| {
            format!(
                "invalid hex cell at char offset {}: {:?}",
                offset_base + i * 4,
                cell
            )
        })?;
        words.push(raw);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EMBEDDED_CAL_WORDS;

    fn grid_payload(cell: &str) -> String {
        cell.repeat(GRID_CELLS)
    }

    #[test]
    fn test_signed16_round_trip_full_range() {
        for v in i16::MIN..=i16::MAX {
            let encoded = format!("{:04X}", v as u16);
            let raw = u16::from_str_radix(&encoded, 16).unwrap();
            assert_eq!(signed16(raw), v, "round trip failed for {}", v);
        }
    }

    #[test]
    fn test_signed16_boundaries() {
        assert_eq!(signed16(0x0000), 0);
        assert_eq!(signed16(0x7FFF), 32767);
        assert_eq!(signed16(0x8000), -32768);
        assert_eq!(signed16(0xFFFF), -1);
        assert_eq!(signed16(0xFFA0), -96);
    }

    #[test]
    fn test_identity() {
        assert_eq!(
            decode("serialno:FD-0042"),
            DevicePacket::Identity {
                serial: "FD-0042".to_string()
            }
        );
        assert!(matches!(
            decode("serialno:"),
            DevicePacket::Malformed { .. }
        ));
    }

    #[test]
    fn test_location_announce() {
        assert_eq!(
            decode("locid:room_1"),
            DevicePacket::LocationAnnounce {
                loc_id: "room_1".to_string()
            }
        );
    }

    #[test]
    fn test_sensor_location_prefix() {
        let DevicePacket::SensorReading { loc_id, adc_values } =
            decode("Sensor:room_1:ADC1=123,ADC2=-4")
        else {
            panic!("expected sensor reading");
        };
        assert_eq!(loc_id.as_deref(), Some("room_1"));
        assert_eq!(adc_values.get("ADC1"), Some(&123));
        assert_eq!(adc_values.get("ADC2"), Some(&-4));
    }

    #[test]
    fn test_sensor_location_field() {
        let DevicePacket::SensorReading { loc_id, adc_values } =
            decode("Sensor:ADC1=600,loc=cellar,ADC2=0")
        else {
            panic!("expected sensor reading");
        };
        assert_eq!(loc_id.as_deref(), Some("cellar"));
        assert_eq!(adc_values.len(), 2);
        assert!(!adc_values.contains_key("loc"));
    }

    #[test]
    fn test_sensor_location_absent() {
        let DevicePacket::SensorReading { loc_id, adc_values } = decode("Sensor:ADC1=55") else {
            panic!("expected sensor reading");
        };
        assert_eq!(loc_id, None);
        assert_eq!(adc_values.get("ADC1"), Some(&55));
    }

    #[test]
    fn test_sensor_rejects_bad_pairs() {
        assert!(matches!(
            decode("Sensor:ADC1"),
            DevicePacket::Malformed { .. }
        ));
        assert!(matches!(
            decode("Sensor:ADC1=abc"),
            DevicePacket::Malformed { .. }
        ));
        assert!(matches!(
            decode("Sensor:loc=room_1"),
            DevicePacket::Malformed { .. }
        ));
    }

    #[test]
    fn test_grid_only_frame() {
        let body = format!("frame7:{}", grid_payload("FFA0"));
        let DevicePacket::ThermalFrame {
            frame_id,
            cells,
            embedded_calibration,
        } = decode(&body)
        else {
            panic!("expected thermal frame");
        };
        assert_eq!(frame_id, 7);
        assert_eq!(cells.len(), GRID_CELLS);
        assert!(cells.iter().all(|&c| c == -96));
        assert!(embedded_calibration.is_empty());
    }

    #[test]
    fn test_frame_with_embedded_calibration() {
        // scale word 100 (-> 0.01), offset word 2700 (-> 27.0), rest 0001
        let mut payload = grid_payload("0010");
        payload.push_str("0064");
        payload.push_str("0A8C");
        payload.push_str(&"0001".repeat(EMBEDDED_CAL_WORDS - 2));
        let body = format!("frame8:{}", payload);

        let DevicePacket::ThermalFrame {
            frame_id,
            cells,
            embedded_calibration,
        } = decode(&body)
        else {
            panic!("expected thermal frame");
        };
        assert_eq!(frame_id, 8);
        assert_eq!(cells[0], 0x10);
        assert_eq!(embedded_calibration.len(), EMBEDDED_CAL_WORDS);
        assert_eq!(embedded_calibration[0], 100);
        assert_eq!(embedded_calibration[1], 2700);
    }

    #[test]
    fn test_frame_wrong_length_reports_counts() {
        let body = format!("frame1:{}", "FFA0".repeat(10));
        let DevicePacket::Malformed { reason, raw } = decode(&body) else {
            panic!("expected malformed");
        };
        assert!(reason.contains("expected 3072 or 3336"), "{}", reason);
        assert!(reason.contains("got 40"), "{}", reason);
        assert_eq!(raw, body);
    }

    #[test]
    fn test_frame_never_partially_parsed() {
        // One char short of a valid grid-only frame
        let body = format!("frame1:{}", &grid_payload("00FF")[..GRID_CHARS - 1]);
        assert!(matches!(decode(&body), DevicePacket::Malformed { .. }));
        // One char over
        let mut long = grid_payload("00FF");
        long.push('F');
        let body = format!("frame1:{}", long);
        assert!(matches!(decode(&body), DevicePacket::Malformed { .. }));
    }

    #[test]
    fn test_frame_bad_hex() {
        let mut payload = grid_payload("00FF");
        payload.replace_range(8..12, "ZZZZ");
        let body = format!("frame1:{}", payload);
        let DevicePacket::Malformed { reason, .. } = decode(&body) else {
            panic!("expected malformed");
        };
        assert!(reason.contains("char offset 8"), "{}", reason);
    }

    #[test]
    fn test_calibration_response() {
        let body = format!("EEPROM3:{}", "0064".repeat(EEPROM_CHARS / 4));
        let DevicePacket::CalibrationResponse {
            frame_id,
            calibration,
        } = decode(&body)
        else {
            panic!("expected calibration response");
        };
        assert_eq!(frame_id, 3);
        assert_eq!(calibration.len(), 832);
        assert!(calibration.iter().all(|&w| w == 100));
    }

    #[test]
    fn test_calibration_wrong_length_reports_counts() {
        let body = format!("EEPROM3:{}", "0064".repeat(10));
        let DevicePacket::Malformed { reason, .. } = decode(&body) else {
            panic!("expected malformed");
        };
        assert!(reason.contains("expected 3328"), "{}", reason);
        assert!(reason.contains("got 40"), "{}", reason);
    }

    #[test]
    fn test_unknown_unit_type() {
        let DevicePacket::Malformed { reason, raw } = decode("video:h264") else {
            panic!("expected malformed");
        };
        assert_eq!(reason, "unknown unit type");
        assert_eq!(raw, "video:h264");
    }

    #[test]
    fn test_missing_frame_id() {
        assert!(matches!(
            decode("frame:00FF"),
            DevicePacket::Malformed { .. }
        ));
        assert!(matches!(
            decode("framex:00FF"),
            DevicePacket::Malformed { .. }
        ));
    }
}
