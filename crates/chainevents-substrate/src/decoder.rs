//! Lightweight decoding of the `System.Events` blob.
//!
//! Full event decoding needs the runtime metadata. [`EventCountDecoder`]
//! only reads the SCALE compact length prefix of the `Vec<EventRecord>`,
//! which is enough to report how many events a block emitted while handing
//! the raw bytes on untouched.

use chainevents_core::{DecodeError, EventDecoder};

/// A block's raw events with the record count read from the prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecords {
    pub count: u64,
    /// The full blob, prefix included.
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EventCountDecoder;

impl EventDecoder for EventCountDecoder {
    type Batch = EventRecords;

    fn decode(&self, raw: &[u8]) -> Result<EventRecords, DecodeError> {
        let (count, _) = decode_compact(raw)?;
        Ok(EventRecords {
            count,
            raw: raw.to_vec(),
        })
    }
}

/// Decode a SCALE compact integer. Returns the value and the number of
/// bytes it occupied.
pub fn decode_compact(input: &[u8]) -> Result<(u64, usize), DecodeError> {
    let first = *input
        .first()
        .ok_or_else(|| DecodeError::new("empty input for compact length"))?;
    let fixed = |len: usize| -> Result<u64, DecodeError> {
        let bytes = input
            .get(..len)
            .ok_or_else(|| DecodeError::new(format!("compact needs {len} bytes, got {}", input.len())))?;
        let mut buf = [0u8; 8];
        buf[..len].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    };

    match first & 0b11 {
        0b00 => Ok((u64::from(first >> 2), 1)),
        0b01 => Ok((fixed(2)? >> 2, 2)),
        0b10 => Ok((fixed(4)? >> 2, 4)),
        _ => {
            let len = usize::from(first >> 2) + 4;
            if len > 8 {
                return Err(DecodeError::new(format!("compact of {len} bytes exceeds u64")));
            }
            let bytes = input
                .get(1..=len)
                .ok_or_else(|| DecodeError::new(format!("compact needs {} bytes, got {}", len + 1, input.len())))?;
            let mut buf = [0u8; 8];
            buf[..len].copy_from_slice(bytes);
            Ok((u64::from_le_bytes(buf), len + 1))
        }
    }
}
