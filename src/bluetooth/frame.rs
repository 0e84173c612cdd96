/// Oximeter notification frame decoding
use log::trace;

use crate::models::MeasurementSample;

// Frame protocol constants
const FRAME_MARKER: [u8; 2] = [0x08, 0x01]; // Start of a measurement frame
const SPO2_OFFSET: usize = 2;
const PULSE_OFFSET: usize = 3;
const PERFUSION_OFFSET: usize = 5; // Byte 4 is reserved
const PERFUSION_SCALE: f64 = 10.0;

/// Decode the first measurement frame found in a notification payload
///
/// Measurement frames can start at any offset and have the following layout:
/// - Bytes 0-1: Marker (0x08, 0x01)
/// - Byte 2: SpO2 percentage
/// - Byte 3: Pulse rate in beats per minute
/// - Byte 4: Reserved
/// - Byte 5: Perfusion index scaled by 10
///
/// Only the first marker with all six frame bytes present is decoded. Payloads
/// without a complete frame are control or padding packets and yield None.
/// Frames split across two payloads are not reassembled.
///
/// # Arguments
/// * `buffer` - Raw notification bytes
///
/// # Returns
/// Some(MeasurementSample) for the first complete frame, None otherwise
pub fn parse_frame(buffer: &[u8]) -> Option<MeasurementSample> {
    let frame = buffer
        .windows(PERFUSION_OFFSET + 1)
        .find(|window| window.starts_with(&FRAME_MARKER));

    match frame {
        Some(frame) => Some(MeasurementSample {
            spo2: frame[SPO2_OFFSET],
            pulse: frame[PULSE_OFFSET],
            perfusion_index: frame[PERFUSION_OFFSET] as f64 / PERFUSION_SCALE,
        }),
        None => {
            trace!("No measurement frame in {} byte payload", buffer.len());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_frame_at_start_of_payload() {
        let sample = parse_frame(&[0x08, 0x01, 97, 64, 0x00, 35]).expect("frame");
        assert_eq!(sample.spo2, 97);
        assert_eq!(sample.pulse, 64);
        assert_eq!(sample.perfusion_index, 3.5);
    }

    #[test]
    fn decodes_frame_at_arbitrary_offset() {
        let payload = [0xaa, 0x55, 0x0f, 0x08, 0x01, 98, 72, 0xff, 120, 0x00, 0x3c];
        let sample = parse_frame(&payload).expect("frame");
        assert_eq!(sample.spo2, 98);
        assert_eq!(sample.pulse, 72);
        assert_eq!(sample.perfusion_index, 12.0);
    }

    #[test]
    fn first_frame_wins() {
        let payload = [0x08, 0x01, 95, 60, 0x00, 10, 0x08, 0x01, 99, 80, 0x00, 20];
        let sample = parse_frame(&payload).expect("frame");
        assert_eq!(sample.spo2, 95);
        assert_eq!(sample.pulse, 60);
        assert_eq!(sample.perfusion_index, 1.0);
    }

    #[test]
    fn skips_marker_without_enough_trailing_bytes() {
        // Marker present but the frame is cut short
        assert_eq!(parse_frame(&[0x08, 0x01, 97, 64, 0x00]), None);
        assert_eq!(parse_frame(&[0x00, 0x08, 0x01, 97, 64, 0x00]), None);
        assert_eq!(parse_frame(&[0x08, 0x01]), None);
    }

    #[test]
    fn ignores_payloads_without_marker() {
        assert_eq!(parse_frame(&[]), None);
        assert_eq!(parse_frame(&[0x08]), None);
        assert_eq!(parse_frame(&[0x01, 0x08, 0x02, 0x03, 0x04, 0x05, 0x06]), None);
        assert_eq!(parse_frame(&[0x08, 0x02, 97, 64, 0x00, 35]), None);
    }

    #[test]
    fn keeps_raw_byte_range() {
        let sample = parse_frame(&[0x08, 0x01, 0xff, 0xff, 0x00, 0xff]).expect("frame");
        assert_eq!(sample.spo2, 255);
        assert_eq!(sample.pulse, 255);
        assert_eq!(sample.perfusion_index, 25.5);
    }
}
