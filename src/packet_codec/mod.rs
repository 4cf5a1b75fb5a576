//! PacketCodec - camera capture control protocol
//!
//! ## Wire format
//!
//! ```text
//! +----------+------+-------------+---------+-----------+
//! | magic(4) | type | len u32 BE  | payload | cksum u16 |
//! +----------+------+-------------+---------+-----------+
//! ```
//!
//! The trailing checksum is an XOR fold of the payload. The capture firmware
//! in the field ships frames with stale checksums, so a mismatch is logged as
//! a warning and the packet is still accepted. Do not tighten this without a
//! firmware-side fix.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Frame magic bytes ("\xA7CAM")
pub const PACKET_MAGIC: [u8; 4] = [0xA7, 0x43, 0x41, 0x4D];

/// Smallest possible frame: magic(4) + type(1) + len(4) + cksum(2)
pub const MIN_PACKET_LEN: usize = 11;

/// Refuse frames larger than this to keep a hostile peer from ballooning
/// the reassembly buffer
pub const MAX_PAYLOAD_LEN: usize = 8 * 1024 * 1024;

/// Packet type derived from the single type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Video,
    Audio,
    Control,
    Heartbeat,
    Unknown(u8),
}

impl From<u8> for PacketType {
    fn from(b: u8) -> Self {
        match b {
            1 => PacketType::Video,
            2 => PacketType::Audio,
            3 => PacketType::Control,
            4 => PacketType::Heartbeat,
            other => PacketType::Unknown(other),
        }
    }
}

impl PacketType {
    pub fn as_byte(&self) -> u8 {
        match self {
            PacketType::Video => 1,
            PacketType::Audio => 2,
            PacketType::Control => 3,
            PacketType::Heartbeat => 4,
            PacketType::Unknown(b) => *b,
        }
    }
}

/// One decoded protocol frame. Ephemeral; dispatched immediately.
#[derive(Debug, Clone)]
pub struct ProtocolPacket {
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// XOR fold of the payload into a 16-bit word (even offsets into the high
/// byte, odd offsets into the low byte)
pub fn checksum(payload: &[u8]) -> u16 {
    let mut hi: u8 = 0;
    let mut lo: u8 = 0;
    for (i, b) in payload.iter().enumerate() {
        if i % 2 == 0 {
            hi ^= b;
        } else {
            lo ^= b;
        }
    }
    u16::from_be_bytes([hi, lo])
}

/// Total frame length for the frame starting at `buf[0]`, if the header is
/// complete. `Ok(None)` means more bytes are needed; `Err` means the header
/// itself is invalid and the stream must resynchronize.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    if buf[..4] != PACKET_MAGIC {
        return Err(Error::MalformedPacket("bad magic header".to_string()));
    }
    if buf.len() < 9 {
        return Ok(None);
    }
    let payload_len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(Error::MalformedPacket(format!(
            "declared payload length {} exceeds limit",
            payload_len
        )));
    }
    Ok(Some(MIN_PACKET_LEN + payload_len))
}

/// Decode a single complete frame.
///
/// Fails with `MalformedPacket` on a missing magic header, a buffer shorter
/// than the fixed minimum, or a declared length running past the available
/// bytes. A checksum mismatch is advisory only: logged, not rejected.
pub fn decode(buf: &[u8]) -> Result<ProtocolPacket> {
    if buf.len() < MIN_PACKET_LEN {
        return Err(Error::MalformedPacket(format!(
            "frame too short: {} bytes (minimum {})",
            buf.len(),
            MIN_PACKET_LEN
        )));
    }
    if buf[..4] != PACKET_MAGIC {
        return Err(Error::MalformedPacket("bad magic header".to_string()));
    }

    let packet_type = PacketType::from(buf[4]);
    let payload_len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;

    if payload_len > MAX_PAYLOAD_LEN {
        return Err(Error::MalformedPacket(format!(
            "declared payload length {} exceeds limit",
            payload_len
        )));
    }
    if buf.len() < MIN_PACKET_LEN + payload_len {
        return Err(Error::MalformedPacket(format!(
            "declared payload length {} exceeds available bytes ({})",
            payload_len,
            buf.len() - MIN_PACKET_LEN
        )));
    }

    let payload = buf[9..9 + payload_len].to_vec();
    let declared = u16::from_be_bytes([buf[9 + payload_len], buf[10 + payload_len]]);
    let computed = checksum(&payload);

    if declared != computed {
        tracing::warn!(
            packet_type = ?packet_type,
            declared = declared,
            computed = computed,
            "Checksum mismatch - accepting packet anyway"
        );
    }

    Ok(ProtocolPacket {
        packet_type,
        payload,
        received_at: Utc::now(),
    })
}

/// Encode a frame (used by capture-side clients and tests)
pub fn encode(packet_type: PacketType, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MIN_PACKET_LEN + payload.len());
    buf.extend_from_slice(&PACKET_MAGIC);
    buf.push(packet_type.as_byte());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&checksum(payload).to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_video_packet() {
        let frame = encode(PacketType::Video, b"nal-unit-data");
        let packet = decode(&frame).unwrap();
        assert_eq!(packet.packet_type, PacketType::Video);
        assert_eq!(packet.payload, b"nal-unit-data");
    }

    #[test]
    fn test_short_buffer_is_malformed() {
        // anything under the 11-byte minimum must be rejected
        for len in 0..MIN_PACKET_LEN {
            let buf = vec![0xA7; len];
            assert!(decode(&buf).is_err(), "len {} should be malformed", len);
        }
    }

    #[test]
    fn test_bad_magic_is_malformed() {
        let mut frame = encode(PacketType::Control, b"x");
        frame[0] = 0x00;
        assert!(matches!(decode(&frame), Err(crate::Error::MalformedPacket(_))));
    }

    #[test]
    fn test_declared_length_past_end_is_malformed() {
        let mut frame = encode(PacketType::Video, b"abc");
        // lie about the payload length
        frame[5..9].copy_from_slice(&1000u32.to_be_bytes());
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn test_checksum_mismatch_still_decodes() {
        let mut frame = encode(PacketType::Audio, b"pcm-data");
        let n = frame.len();
        frame[n - 1] ^= 0xFF;
        frame[n - 2] ^= 0xFF;

        // accepted despite the drifted checksum (documented quirk)
        let packet = decode(&frame).unwrap();
        assert_eq!(packet.packet_type, PacketType::Audio);
        assert_eq!(packet.payload, b"pcm-data");
    }

    #[test]
    fn test_unknown_type_byte() {
        let frame = encode(PacketType::Unknown(99), b"?");
        let packet = decode(&frame).unwrap();
        assert_eq!(packet.packet_type, PacketType::Unknown(99));
    }

    #[test]
    fn test_frame_len_incremental() {
        let frame = encode(PacketType::Video, b"0123456789");
        // header incomplete
        assert_eq!(frame_len(&frame[..3]).unwrap(), None);
        assert_eq!(frame_len(&frame[..8]).unwrap(), None);
        // header complete
        assert_eq!(frame_len(&frame).unwrap(), Some(frame.len()));
        // garbage prefix must error so the reader can resync
        assert!(frame_len(b"garbage-bytes").is_err());
    }

    #[test]
    fn test_checksum_fold() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0xFF]), 0xFF00);
        assert_eq!(checksum(&[0x01, 0x02]), 0x0102);
        assert_eq!(checksum(&[0x01, 0x02, 0x01, 0x02]), 0);
    }
}
