// src/core/protocol/teltonika.rs

//! Implements the Teltonika TCP framing and the corresponding `Encoder` and
//! `Decoder` for network communication.
//!
//! A frame on the wire is laid out as:
//!
//! ```text
//! [4 zero bytes][u32 data length][codec id][quantity][payload ...][quantity][u32 crc]
//! ```
//!
//! where the CRC is CRC-16/IBM computed over everything from the codec id up to
//! and including the trailing quantity byte.

use super::packet::{
    AvlRecord, CodecId, DecodedFrame, IoElement, Message, MessageType, Packet,
};
use crate::core::errors::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};
use crc::{CRC_16_ARC, Crc};
use tokio_util::codec::{Decoder, Encoder};

/// Protocol-level limit on a single frame's data section.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

const HEADER_LEN: usize = 8;
const CRC_LEN: usize = 4;
const COORDINATE_SCALE: f64 = 10_000_000.0;

/// CRC-16/IBM (a.k.a. CRC-16/ARC), as used by the device firmware.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// Value widths of the fixed-size IO groups, in wire order.
const IO_WIDTHS: [usize; 4] = [1, 2, 4, 8];

/// The width of each variable field in a record's IO section, which is the
/// only thing that differs between the AVL codecs.
#[derive(Debug, Clone, Copy)]
struct IoLayout {
    wide_ids: bool,
    wide_counts: bool,
    generation_type: bool,
    variable_group: bool,
}

impl IoLayout {
    fn for_codec(codec: CodecId) -> Self {
        match codec {
            CodecId::Codec8Extended => IoLayout {
                wide_ids: true,
                wide_counts: true,
                generation_type: false,
                variable_group: true,
            },
            CodecId::Codec16 => IoLayout {
                wide_ids: true,
                wide_counts: false,
                generation_type: true,
                variable_group: false,
            },
            _ => IoLayout {
                wide_ids: false,
                wide_counts: false,
                generation_type: false,
                variable_group: false,
            },
        }
    }
}

/// A `tokio_util::codec` implementation for Teltonika frames.
#[derive(Debug, Clone)]
pub struct TeltonikaCodec {
    max_frame_size: usize,
}

impl Default for TeltonikaCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl TeltonikaCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for TeltonikaCodec {
    type Item = DecodedFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let preamble = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if preamble != 0 {
            return Err(ProtocolError::InvalidPreamble(preamble));
        }
        let data_len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if data_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                len: data_len,
                max: self.max_frame_size,
            });
        }

        let total = HEADER_LEN + data_len + CRC_LEN;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let raw = src.split_to(total).freeze();
        let data = &raw[HEADER_LEN..HEADER_LEN + data_len];
        let crc_bytes = &raw[HEADER_LEN + data_len..];
        let expected = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let actual = CRC16.checksum(data);
        if expected != u32::from(actual) {
            return Err(ProtocolError::CrcMismatch { expected, actual });
        }

        let (packet, quantity) = parse_data(data)?;
        let response = packet
            .codec_id
            .is_avl()
            .then(|| Bytes::copy_from_slice(&u32::from(quantity).to_be_bytes()));

        Ok(Some(DecodedFrame {
            packet,
            response,
            raw,
        }))
    }
}

impl Encoder<&Packet> for TeltonikaCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut data = BytesMut::new();
        write_data(item, &mut data)?;
        if data.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                len: data.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(HEADER_LEN + data.len() + CRC_LEN);
        dst.put_u32(0);
        dst.put_u32(data.len() as u32);
        dst.extend_from_slice(&data);
        dst.put_u32(u32::from(CRC16.checksum(&data)));
        Ok(())
    }
}

/// A convenience method to encode a packet into a complete frame.
pub fn encode_packet(packet: &Packet) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    TeltonikaCodec::default().encode(packet, &mut buf)?;
    Ok(buf.freeze())
}

/// A bounds-checked reader over a frame's data section.
struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() < n {
            return Err(ProtocolError::Truncated(what));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, ProtocolError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, ProtocolError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, ProtocolError> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self, what: &'static str) -> Result<u64, ProtocolError> {
        let b = self.take(8, what)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn i16(&mut self, what: &'static str) -> Result<i16, ProtocolError> {
        Ok(self.u16(what)? as i16)
    }

    fn i32(&mut self, what: &'static str) -> Result<i32, ProtocolError> {
        Ok(self.u32(what)? as i32)
    }

    /// Reads a count or id that is one byte wide, or two when `wide` is set.
    fn narrow_or_wide(&mut self, wide: bool, what: &'static str) -> Result<u16, ProtocolError> {
        if wide {
            self.u16(what)
        } else {
            self.u8(what).map(u16::from)
        }
    }
}

/// Parses the data section, returning the packet and its declared record count.
fn parse_data(data: &[u8]) -> Result<(Packet, u8), ProtocolError> {
    let mut cur = Cursor { buf: data };
    let codec_id = CodecId::from_byte(cur.u8("codec id")?)?;
    let quantity = cur.u8("record quantity")?;

    let mut packet = Packet {
        codec_id,
        data: Vec::new(),
        messages: Vec::new(),
    };
    if codec_id.is_avl() {
        let layout = IoLayout::for_codec(codec_id);
        packet.data.reserve(usize::from(quantity));
        for _ in 0..quantity {
            packet.data.push(parse_record(&mut cur, layout)?);
        }
    } else {
        for _ in 0..quantity {
            packet.messages.push(parse_message(&mut cur)?);
        }
    }

    let trailer = cur.u8("trailing record quantity")?;
    if trailer != quantity {
        return Err(ProtocolError::QuantityMismatch {
            header: quantity,
            trailer,
        });
    }
    if !cur.buf.is_empty() {
        return Err(ProtocolError::TrailingBytes(cur.buf.len()));
    }
    Ok((packet, quantity))
}

fn parse_record(cur: &mut Cursor<'_>, layout: IoLayout) -> Result<AvlRecord, ProtocolError> {
    let timestamp_ms = cur.u64("timestamp")?;
    let priority = cur.u8("priority")?;
    let lng = f64::from(cur.i32("longitude")?) / COORDINATE_SCALE;
    let lat = f64::from(cur.i32("latitude")?) / COORDINATE_SCALE;
    let altitude = cur.i16("altitude")?;
    let angle = cur.u16("angle")?;
    let satellites = cur.u8("satellites")?;
    let speed = cur.u16("speed")?;

    let event_id = cur.narrow_or_wide(layout.wide_ids, "event io id")?;
    let generation_type = if layout.generation_type {
        Some(cur.u8("generation type")?)
    } else {
        None
    };
    let total = cur.narrow_or_wide(layout.wide_counts, "io element count")?;

    let mut elements = Vec::with_capacity(usize::from(total));
    for width in IO_WIDTHS {
        let count = cur.narrow_or_wide(layout.wide_counts, "io group count")?;
        for _ in 0..count {
            let id = cur.narrow_or_wide(layout.wide_ids, "io id")?;
            let value = cur.take(width, "io value")?.to_vec();
            elements.push(IoElement { id, value });
        }
    }
    if layout.variable_group {
        let count = cur.u16("variable io group count")?;
        for _ in 0..count {
            let id = cur.u16("io id")?;
            let len = cur.u16("variable io length")?;
            let value = cur.take(usize::from(len), "variable io value")?.to_vec();
            elements.push(IoElement { id, value });
        }
    }

    Ok(AvlRecord {
        timestamp_ms,
        priority,
        lng,
        lat,
        altitude,
        angle,
        satellites,
        speed,
        event_id,
        generation_type,
        elements,
    })
}

fn parse_message(cur: &mut Cursor<'_>) -> Result<Message, ProtocolError> {
    let kind = MessageType::from_byte(cur.u8("message type")?)?;
    let size = cur.u32("message size")? as usize;
    let text = cur.take(size, "message text")?;
    let text = std::str::from_utf8(text)
        .map_err(|_| ProtocolError::InvalidText)?
        .to_string();
    Ok(Message { kind, text })
}

fn write_data(packet: &Packet, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let quantity = if packet.codec_id.is_avl() {
        if !packet.messages.is_empty() {
            return Err(ProtocolError::Unencodable(format!(
                "{} cannot carry text messages",
                packet.codec_id
            )));
        }
        packet.data.len()
    } else {
        if !packet.data.is_empty() {
            return Err(ProtocolError::Unencodable(
                "Codec12 cannot carry telemetry records".to_string(),
            ));
        }
        packet.messages.len()
    };
    let quantity = u8::try_from(quantity).map_err(|_| {
        ProtocolError::Unencodable(format!("{quantity} entries exceed the 255 per frame limit"))
    })?;

    dst.put_u8(packet.codec_id.as_byte());
    dst.put_u8(quantity);
    if packet.codec_id.is_avl() {
        let layout = IoLayout::for_codec(packet.codec_id);
        for record in &packet.data {
            write_record(record, layout, dst)?;
        }
    } else {
        for message in &packet.messages {
            dst.put_u8(message.kind.as_byte());
            dst.put_u32(message.text.len() as u32);
            dst.extend_from_slice(message.text.as_bytes());
        }
    }
    dst.put_u8(quantity);
    Ok(())
}

fn put_narrow_or_wide(
    dst: &mut BytesMut,
    wide: bool,
    value: usize,
    what: &str,
) -> Result<(), ProtocolError> {
    if wide {
        let v = u16::try_from(value)
            .map_err(|_| ProtocolError::Unencodable(format!("{what} {value} exceeds u16")))?;
        dst.put_u16(v);
    } else {
        let v = u8::try_from(value)
            .map_err(|_| ProtocolError::Unencodable(format!("{what} {value} exceeds u8")))?;
        dst.put_u8(v);
    }
    Ok(())
}

fn write_record(
    record: &AvlRecord,
    layout: IoLayout,
    dst: &mut BytesMut,
) -> Result<(), ProtocolError> {
    dst.put_u64(record.timestamp_ms);
    dst.put_u8(record.priority);
    dst.put_i32((record.lng * COORDINATE_SCALE).round() as i32);
    dst.put_i32((record.lat * COORDINATE_SCALE).round() as i32);
    dst.put_i16(record.altitude);
    dst.put_u16(record.angle);
    dst.put_u8(record.satellites);
    dst.put_u16(record.speed);

    put_narrow_or_wide(dst, layout.wide_ids, usize::from(record.event_id), "event io id")?;
    if layout.generation_type {
        dst.put_u8(record.generation_type.unwrap_or_default());
    }
    put_narrow_or_wide(dst, layout.wide_counts, record.elements.len(), "io element count")?;

    for width in IO_WIDTHS {
        let group: Vec<&IoElement> = record
            .elements
            .iter()
            .filter(|e| e.value.len() == width)
            .collect();
        put_narrow_or_wide(dst, layout.wide_counts, group.len(), "io group count")?;
        for element in group {
            put_narrow_or_wide(dst, layout.wide_ids, usize::from(element.id), "io id")?;
            dst.extend_from_slice(&element.value);
        }
    }

    let variable: Vec<&IoElement> = record
        .elements
        .iter()
        .filter(|e| !IO_WIDTHS.contains(&e.value.len()))
        .collect();
    if layout.variable_group {
        put_narrow_or_wide(dst, true, variable.len(), "variable io group count")?;
        for element in variable {
            dst.put_u16(element.id);
            put_narrow_or_wide(dst, true, element.value.len(), "variable io length")?;
            dst.extend_from_slice(&element.value);
        }
    } else if let Some(element) = variable.first() {
        return Err(ProtocolError::Unencodable(format!(
            "io element {} has a {} byte value, which this codec cannot carry",
            element.id,
            element.value.len()
        )));
    }
    Ok(())
}
