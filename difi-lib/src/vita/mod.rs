//! VITA-49 / DIFI packet decoding.
//!
//! [Decoder] turns one received datagram into a [DecodedPacket]: either a context packet
//! carrying a [StreamContext] snapshot, or a data packet describing where its samples live in
//! the datagram. Sample payloads are never copied here; see [DataPacket::samples].
//!
//! Reference: ANSI/VITA-49.2 and the IEEE-ISTO 4900 DIFI standard.
mod context;

use std::collections::HashMap;
use std::fmt::Display;

use num_complex::Complex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::prelude::*;

pub use context::StreamContext;

pub type StreamId = u32;

/// Size of a VITA-49 word in bytes.
pub const WORD_LEN: usize = 4;
/// Bytes per ci16 sample, one word.
pub const SAMPLE_LEN: usize = 4;
/// Largest packet expressible by the 16-bit packet size field.
pub const MAX_PACKET_LEN: usize = 0xffff * WORD_LEN;
/// Modulus of the 4-bit packet count.
pub const PACKET_COUNT_MOD: u8 = 16;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    SignalData,
    SignalDataWithStreamId,
    ExtensionData,
    ExtensionDataWithStreamId,
    Context,
    ExtensionContext,
    Command,
    ExtensionCommand,
    Reserved(u8),
}

impl PacketType {
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0xf {
            0x0 => Self::SignalData,
            0x1 => Self::SignalDataWithStreamId,
            0x2 => Self::ExtensionData,
            0x3 => Self::ExtensionDataWithStreamId,
            0x4 => Self::Context,
            0x5 => Self::ExtensionContext,
            0x6 => Self::Command,
            0x7 => Self::ExtensionCommand,
            x => Self::Reserved(x),
        }
    }

    #[must_use]
    pub fn has_stream_id(&self) -> bool {
        !matches!(self, Self::SignalData | Self::ExtensionData)
    }

    #[must_use]
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            Self::SignalData
                | Self::SignalDataWithStreamId
                | Self::ExtensionData
                | Self::ExtensionDataWithStreamId
        )
    }

    #[must_use]
    pub fn is_context(&self) -> bool {
        matches!(self, Self::Context | Self::ExtensionContext)
    }
}

/// VITA-49 packet header word.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub packet_type: PacketType,
    pub class_id_present: bool,
    /// Only meaningful for data packets.
    pub trailer_present: bool,
    /// Integer timestamp type; 0 means no integer timestamp.
    pub tsi: u8,
    /// Fractional timestamp type; 0 means no fractional timestamp.
    pub tsf: u8,
    pub packet_count: u8,
    /// Total packet size in words, including the header word.
    pub packet_size: u16,
}

impl Header {
    /// Header word length in bytes
    pub const LEN: usize = WORD_LEN;

    /// Decode from bytes. Returns `None` if there are not enough bytes.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        let word = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let packet_type = PacketType::from_bits((word >> 28) as u8);

        Some(Header {
            packet_type,
            class_id_present: (word >> 27) & 0x1 == 1,
            trailer_present: packet_type.is_data() && (word >> 26) & 0x1 == 1,
            tsi: ((word >> 22) & 0x3) as u8,
            tsf: ((word >> 20) & 0x3) as u8,
            packet_count: ((word >> 16) & 0xf) as u8,
            packet_size: (word & 0xffff) as u16,
        })
    }

    /// Packet length in bytes according to the size field.
    #[must_use]
    pub fn packet_len(&self) -> usize {
        self.packet_size as usize * WORD_LEN
    }

    /// Number of words used by the header and its optional prologue fields.
    #[must_use]
    pub fn prologue_words(&self) -> usize {
        let mut words = 1;
        if self.packet_type.has_stream_id() {
            words += 1;
        }
        if self.class_id_present {
            words += 2;
        }
        if self.tsi != 0 {
            words += 1;
        }
        if self.tsf != 0 {
            words += 2;
        }
        words
    }
}

/// A decoded data packet.
///
/// The samples are not copied out of the datagram; `offset` and `num_samples` locate them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub stream_id: StreamId,
    pub packet_count: u8,
    /// Number of complex ci16 samples in the payload.
    pub num_samples: usize,
    /// Byte offset of the first sample within the datagram.
    pub offset: usize,
    pub integer_seconds: u32,
    /// Fractional seconds, picoseconds for DIFI real-time timestamps.
    pub fractional_seconds: u64,
    /// Set when packets were dropped before this one or the trailer reports sample loss.
    pub lost_frame: bool,
    pub data_valid: bool,
}

impl DataPacket {
    /// Iterate over this packet's samples in `raw`, the datagram it was decoded from.
    ///
    /// Samples are ci16 little-endian, real part first. If `raw` is shorter than the packet
    /// claims only the available whole samples are produced.
    pub fn samples<'a>(&self, raw: &'a [u8]) -> impl Iterator<Item = Complex<i16>> + 'a {
        let end = self.offset + self.num_samples * SAMPLE_LEN;
        let payload = raw.get(self.offset..end.min(raw.len())).unwrap_or(&[]);
        payload.chunks_exact(SAMPLE_LEN).map(|s| Complex {
            re: i16::from_le_bytes([s[0], s[1]]),
            im: i16::from_le_bytes([s[2], s[3]]),
        })
    }
}

impl Display for DataPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DataPacket{{stream_id: {:#x}, count: {}, samples: {}, time: {}+{}ps}}",
            self.stream_id,
            self.packet_count,
            self.num_samples,
            self.integer_seconds,
            self.fractional_seconds
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ContextPacket {
    pub stream_id: StreamId,
    /// Accumulated context as of this packet.
    pub context: StreamContext,
}

/// Result of decoding a single datagram.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum DecodedPacket {
    Context(ContextPacket),
    Data(DataPacket),
}

impl DecodedPacket {
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        match self {
            DecodedPacket::Context(p) => p.stream_id,
            DecodedPacket::Data(p) => p.stream_id,
        }
    }
}

/// Calculate the number of packets missing between two 4-bit packet counts.
///
/// `cur` is the current count. `last` is the count seen before `cur` on the same stream.
#[must_use]
pub fn missing_packets(cur: u8, last: u8) -> u8 {
    let expected = (last + 1) % PACKET_COUNT_MOD;
    if cur == expected {
        return 0;
    }
    (cur + PACKET_COUNT_MOD - expected) % PACKET_COUNT_MOD
}

// Trailer bits, VITA-49.2 section 5.1.6
const TRAILER_VALID_DATA_ENABLE: u32 = 1 << 30;
const TRAILER_SAMPLE_LOSS_ENABLE: u32 = 1 << 24;
const TRAILER_VALID_DATA: u32 = 1 << 18;
const TRAILER_SAMPLE_LOSS: u32 = 1 << 12;

/// Stateful VITA-49 decoder.
///
/// Holds the context accumulated from all context packets seen so far, since context packets
/// may only carry the fields that changed, and the last packet count per stream used to
/// detect lost packets.
#[derive(Debug, Default)]
pub struct Decoder {
    stream_filter: Option<u32>,
    context: StreamContext,
    last_counts: HashMap<StreamId, u8>,
}

impl Decoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept packets whose stream id intersects `mask`. Others decode to
    /// [Error::Filtered].
    #[must_use]
    pub fn with_stream_filter(mut self, mask: u32) -> Self {
        self.stream_filter = Some(mask);
        self
    }

    /// Context accumulated so far.
    #[must_use]
    pub fn context(&self) -> &StreamContext {
        &self.context
    }

    /// Decode a single datagram.
    ///
    /// # Errors
    /// [Error::Decode] if `buf` is not a VITA-49 data or context packet or is truncated,
    /// [Error::Filtered] if the packet belongs to a stream outside the stream filter. Both are
    /// transient; the datagram should just be skipped.
    pub fn decode(&mut self, buf: &[u8]) -> Result<DecodedPacket> {
        let Some(header) = Header::decode(buf) else {
            return Err(Error::Decode(format!("{} byte datagram", buf.len())));
        };
        let packet_len = header.packet_len();
        if packet_len > buf.len() {
            return Err(Error::Decode(format!(
                "packet size {packet_len} exceeds datagram length {}",
                buf.len()
            )));
        }
        let prologue_words = header.prologue_words();
        if prologue_words > header.packet_size as usize {
            return Err(Error::Decode(format!(
                "packet size {} words is smaller than its {prologue_words} word prologue",
                header.packet_size
            )));
        }
        if !header.packet_type.is_data() && !header.packet_type.is_context() {
            return Err(Error::Decode(format!(
                "unsupported packet type {:?}",
                header.packet_type
            )));
        }

        let words = Words(&buf[..packet_len]);
        let mut idx = 1;
        let stream_id = if header.packet_type.has_stream_id() {
            idx += 1;
            words.u32(1)
        } else {
            0
        };
        if let Some(mask) = self.stream_filter {
            if stream_id & mask == 0 {
                return Err(Error::Filtered { stream_id });
            }
        }
        // class id (OUI and class codes) is not needed to locate samples
        if header.class_id_present {
            idx += 2;
        }
        let integer_seconds = if header.tsi != 0 {
            idx += 1;
            words.u32(idx - 1)
        } else {
            0
        };
        let fractional_seconds = if header.tsf != 0 {
            idx += 2;
            words.u64(idx - 2)
        } else {
            0
        };

        if header.packet_type.is_context() {
            self.context.update(&words, idx)?;
            trace!(stream_id, "context packet");
            return Ok(DecodedPacket::Context(ContextPacket {
                stream_id,
                context: self.context.clone(),
            }));
        }

        let trailer_words = usize::from(header.trailer_present);
        let Some(num_samples) = (header.packet_size as usize).checked_sub(idx + trailer_words)
        else {
            return Err(Error::Decode("no room for trailer".to_string()));
        };
        let (data_valid, sample_loss) = if header.trailer_present {
            let trailer = words.u32(header.packet_size as usize - 1);
            (
                trailer & TRAILER_VALID_DATA_ENABLE == 0 || trailer & TRAILER_VALID_DATA != 0,
                trailer & TRAILER_SAMPLE_LOSS_ENABLE != 0 && trailer & TRAILER_SAMPLE_LOSS != 0,
            )
        } else {
            (true, false)
        };

        let missing = match self.last_counts.insert(stream_id, header.packet_count) {
            Some(last) => missing_packets(header.packet_count, last),
            None => 0,
        };

        Ok(DecodedPacket::Data(DataPacket {
            stream_id,
            packet_count: header.packet_count,
            num_samples,
            offset: idx * WORD_LEN,
            integer_seconds,
            fractional_seconds,
            lost_frame: missing > 0 || sample_loss,
            data_valid,
        }))
    }
}

/// Big-endian word access into a packet whose length has already been validated.
pub(crate) struct Words<'a>(&'a [u8]);

impl Words<'_> {
    pub(crate) fn len(&self) -> usize {
        self.0.len() / WORD_LEN
    }

    pub(crate) fn u32(&self, idx: usize) -> u32 {
        let i = idx * WORD_LEN;
        u32::from_be_bytes([self.0[i], self.0[i + 1], self.0[i + 2], self.0[i + 3]])
    }

    pub(crate) fn u64(&self, idx: usize) -> u64 {
        (u64::from(self.u32(idx)) << 32) | u64::from(self.u32(idx + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Signal data packet with stream id, class id, UTC and real-time timestamps.
    fn data_packet(stream_id: u32, count: u8, samples: &[(i16, i16)], trailer: Option<u32>) -> Vec<u8> {
        let words = 7 + samples.len() + usize::from(trailer.is_some());
        let mut hdr: u32 = 0x1 << 28 | 1 << 27 | 0x1 << 22 | 0x2 << 20;
        if trailer.is_some() {
            hdr |= 1 << 26;
        }
        hdr |= u32::from(count) << 16 | words as u32;
        let mut dat = Vec::new();
        dat.extend(hdr.to_be_bytes());
        dat.extend(stream_id.to_be_bytes());
        dat.extend(0x6a621eu32.to_be_bytes());
        dat.extend(0x0000_0000u32.to_be_bytes());
        dat.extend(1_700_000_000u32.to_be_bytes());
        dat.extend(500_000_000_000u64.to_be_bytes());
        for (re, im) in samples {
            dat.extend(re.to_le_bytes());
            dat.extend(im.to_le_bytes());
        }
        if let Some(t) = trailer {
            dat.extend(t.to_be_bytes());
        }
        dat
    }

    #[test]
    fn decode_header() {
        let header = Header::decode(&[0x18, 0x61, 0x00, 0x10]).unwrap();

        assert_eq!(header.packet_type, PacketType::SignalDataWithStreamId);
        assert!(header.class_id_present);
        assert!(!header.trailer_present);
        assert_eq!(header.tsi, 1);
        assert_eq!(header.tsf, 2);
        assert_eq!(header.packet_count, 1);
        assert_eq!(header.packet_size, 16);
        assert_eq!(header.prologue_words(), 7);
    }

    #[test]
    fn decode_header_is_none_when_too_short() {
        assert!(Header::decode(&[0x18, 0x61]).is_none());
    }

    #[test]
    fn decode_data_packet() {
        let dat = data_packet(0x2, 3, &[(1, -1), (300, -300)], None);
        let mut decoder = Decoder::new();

        let DecodedPacket::Data(packet) = decoder.decode(&dat).unwrap() else {
            panic!("expected data packet");
        };

        assert_eq!(packet.stream_id, 0x2);
        assert_eq!(packet.num_samples, 2);
        assert_eq!(packet.offset, 28);
        assert_eq!(packet.integer_seconds, 1_700_000_000);
        assert_eq!(packet.fractional_seconds, 500_000_000_000);
        assert!(!packet.lost_frame);
        assert!(packet.data_valid);

        let samples: Vec<Complex<i16>> = packet.samples(&dat).collect();
        assert_eq!(samples, vec![Complex::new(1, -1), Complex::new(300, -300)]);
    }

    #[test]
    fn decode_trailer_flags() {
        let invalid = TRAILER_VALID_DATA_ENABLE;
        let loss = TRAILER_SAMPLE_LOSS_ENABLE | TRAILER_SAMPLE_LOSS | TRAILER_VALID_DATA_ENABLE | TRAILER_VALID_DATA;
        let mut decoder = Decoder::new();

        let DecodedPacket::Data(packet) = decoder
            .decode(&data_packet(1, 0, &[(0, 0)], Some(invalid)))
            .unwrap()
        else {
            panic!("expected data packet");
        };
        assert_eq!(packet.num_samples, 1);
        assert!(!packet.data_valid);
        assert!(!packet.lost_frame);

        let DecodedPacket::Data(packet) = decoder
            .decode(&data_packet(1, 1, &[(0, 0)], Some(loss)))
            .unwrap()
        else {
            panic!("expected data packet");
        };
        assert!(packet.data_valid);
        assert!(packet.lost_frame);
    }

    #[test]
    fn packet_count_gap_is_lost_frame() {
        let mut decoder = Decoder::new();
        let mut lost = Vec::new();
        for count in [14, 15, 0, 2, 3] {
            match decoder.decode(&data_packet(1, count, &[(0, 0)], None)).unwrap() {
                DecodedPacket::Data(p) => lost.push(p.lost_frame),
                DecodedPacket::Context(_) => panic!("expected data packet"),
            }
        }
        assert_eq!(lost, vec![false, false, false, true, false]);
    }

    #[test]
    fn packet_counts_are_tracked_per_stream() {
        let mut decoder = Decoder::new();
        for (stream, count) in [(1, 0), (2, 7), (1, 1), (2, 8)] {
            let DecodedPacket::Data(p) = decoder
                .decode(&data_packet(stream, count, &[(0, 0)], None))
                .unwrap()
            else {
                panic!("expected data packet");
            };
            assert!(!p.lost_frame, "stream {stream} count {count}");
        }
    }

    #[test]
    fn stream_filter_rejects_other_streams() {
        let mut decoder = Decoder::new().with_stream_filter(0b01);
        let zult = decoder.decode(&data_packet(0b10, 0, &[(0, 0)], None));

        assert!(matches!(zult, Err(Error::Filtered { stream_id: 0b10 })));
        assert!(zult.unwrap_err().is_transient());
    }

    #[test]
    fn truncated_datagram_is_decode_error() {
        let dat = data_packet(1, 0, &[(0, 0), (1, 1)], None);
        let zult = Decoder::new().decode(&dat[..dat.len() - 4]);

        assert!(matches!(zult, Err(Error::Decode(_))), "got {zult:?}");
    }

    #[test]
    fn garbage_is_decode_error() {
        let zult = Decoder::new().decode(&[0xff; 64]);
        assert!(matches!(zult, Err(Error::Decode(_))), "got {zult:?}");
    }

    #[test]
    fn test_missing_packets() {
        assert_eq!(missing_packets(5, 4), 0);
        assert_eq!(missing_packets(5, 3), 1);
        assert_eq!(missing_packets(0, 15), 0);
        assert_eq!(missing_packets(1, 15), 1);
        assert_eq!(missing_packets(4, 4), 15);
    }
}
