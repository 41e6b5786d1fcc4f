//! Byte codec for characteristic payloads
//! Decodes fixed-offset response buffers into scaled values and encodes control writes.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::core::registry::{ChannelDescriptor, CharacteristicField, DeviceFamily};
use crate::core::telemetry::Reading;
use crate::error::CodecError;

/// Bytes 0-1 of every payload carry the device time tick.
pub const TICK_HEADER_LEN: usize = 2;

/// Control values keyed by field name, as handed to [`encode`].
pub type ControlValues = BTreeMap<String, i64>;

fn take(buffer: &[u8], offset: usize, width: usize) -> Result<&[u8], CodecError> {
    buffer
        .get(offset..offset + width)
        .ok_or(CodecError::MalformedPayload {
            offset,
            width,
            len: buffer.len(),
        })
}

/// Reads the raw big-endian integer behind `field`, sign-extended when the field is signed.
pub fn decode_raw(buffer: &[u8], field: &CharacteristicField) -> Result<i64, CodecError> {
    let bytes = take(buffer, field.byte_offset, field.byte_width)?;
    let raw = bytes.iter().fold(0i64, |acc, b| (acc << 8) | *b as i64);

    let bits = 8 * field.byte_width as u32;
    if field.signed && raw & (1 << (bits - 1)) != 0 {
        Ok(raw - (1 << bits))
    } else {
        Ok(raw)
    }
}

/// Decodes a numeric field and applies its scale.
pub fn decode(buffer: &[u8], field: &CharacteristicField) -> Result<f64, CodecError> {
    Ok(field.scale.apply(decode_raw(buffer, field)?))
}

/// Decodes a bitmask field, shifted down to its lowest bit.
pub fn decode_mask(buffer: &[u8], field: &CharacteristicField) -> Result<u8, CodecError> {
    let byte = take(buffer, field.byte_offset, 1)?[0];
    let mask = field.bitmask.unwrap_or(0xff);
    if mask == 0 {
        return Ok(0);
    }
    Ok((byte & mask) >> mask.trailing_zeros())
}

/// Decodes every field of a channel. Fails as a whole if any field is out of range.
pub fn decode_channel(
    buffer: &[u8],
    family: DeviceFamily,
    channel: &'static ChannelDescriptor,
) -> Result<Reading, CodecError> {
    let mut values = BTreeMap::new();
    for field in channel.fields {
        let value = match field.bitmask {
            Some(_) => decode_mask(buffer, field)? as f64,
            None => decode(buffer, field)?,
        };
        values.insert(field.name, value);
    }

    Ok(Reading {
        channel: channel.name,
        family,
        values,
        captured_at: Utc::now(),
    })
}

/// The device time tick from the payload header, if present.
pub fn read_tick(buffer: &[u8]) -> Option<u16> {
    buffer
        .get(..TICK_HEADER_LEN)
        .map(|header| u16::from_be_bytes([header[0], header[1]]))
}

/// Builds an outbound payload: the tick header followed by each field at its offset.
///
/// Values wider than their field are truncated to the field's low bytes. Missing
/// values encode as 0.
pub fn encode(values: &ControlValues, template: &ChannelDescriptor, tick: u16) -> Vec<u8> {
    let len = template
        .fields
        .iter()
        .map(CharacteristicField::end)
        .fold(template.payload_len.max(TICK_HEADER_LEN), usize::max);
    let mut payload = vec![0u8; len];
    payload[..TICK_HEADER_LEN].copy_from_slice(&tick.to_be_bytes());

    for field in template.fields {
        let value = values.get(field.name).copied().unwrap_or(0);
        match field.bitmask {
            Some(mask) => {
                let shift = mask.trailing_zeros();
                let bits = (value & (mask >> shift) as i64) << shift;
                payload[field.byte_offset] |= (bits & 0xff) as u8;
            }
            None => {
                for i in 0..field.byte_width {
                    let shift = 8 * (field.byte_width - 1 - i);
                    payload[field.byte_offset + i] = ((value >> shift) & 0xff) as u8;
                }
            }
        }
    }
    payload
}
