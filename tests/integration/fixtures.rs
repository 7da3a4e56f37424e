// tests/integration/fixtures.rs

//! Sample frames and packets shared across tests.

use trackbridge::core::protocol::{AvlRecord, CodecId, IoElement, Packet};

/// A Codec 8 frame with one record and five IO elements, as sent by real firmware.
pub const CODEC8_FRAME_HEX: &str = "000000000000003608010000016B40D8EA30010000000000000000000000000000000105021503010101425E0F01F10000601A014E0000000000000000010000C7CF";

/// A Codec 8 Extended frame with one record and five IO elements.
pub const CODEC8E_FRAME_HEX: &str = "000000000000004A8E010000016B412CEE000100000000000000000000000000000000010005000100010100010011001D00010010015E2C880002000B000000003544C87A000E000000001DD7E06A00000100002994";

/// A Codec 12 frame carrying the command `getinfo`.
pub const CODEC12_GETINFO_HEX: &str = "000000000000000F0C010500000007676574696E666F0100004312";

pub const IMEI: &str = "123456789012345";

pub fn frame(hex_str: &str) -> Vec<u8> {
    hex::decode(hex_str).expect("fixture hex must be valid")
}

/// A single-record telemetry packet with a recognizable position.
pub fn sample_record(timestamp_ms: u64) -> AvlRecord {
    AvlRecord {
        timestamp_ms,
        priority: 1,
        lng: 25.2797,
        lat: 54.6872,
        altitude: 112,
        angle: 270,
        satellites: 9,
        speed: 48,
        event_id: 0,
        generation_type: None,
        elements: vec![
            IoElement {
                id: 239,
                value: vec![1],
            },
            IoElement {
                id: 66,
                value: vec![0x30, 0x39],
            },
        ],
    }
}

pub fn telemetry_packet(records: usize) -> Packet {
    let data = (0..records)
        .map(|i| sample_record(1_700_000_000_000 + i as u64 * 1000))
        .collect();
    Packet::telemetry(CodecId::Codec8, data)
}
