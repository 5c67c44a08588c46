#![allow(dead_code)]
//! Synthetic DIFI packet streams.
use std::cell::Cell;
use std::rc::Rc;

use difi::dada::RingBuffer;
use difi::pipeline::CancelToken;
use difi::source::{PacketSource, Received};
use difi::{Error, Result};

const TYPE_DATA: u32 = 0x1;
const TYPE_CONTEXT: u32 = 0x4;
// TSI UTC, TSF real-time picoseconds
const TIMESTAMPS: u32 = 0b01 << 22 | 0b10 << 20;
const FREQ_RADIX: f64 = (1u64 << 20) as f64;
const CIF0_RF_FREQ: u32 = 1 << 27;
const CIF0_SAMPLE_RATE: u32 = 1 << 21;

pub const PICOS: u64 = 1_000_000_000_000;
/// Integer seconds of the first window in every synthetic stream.
pub const START_SECS: u32 = 1_700_000_000;

fn header(packet_type: u32, count: u8, words: usize) -> u32 {
    packet_type << 28 | TIMESTAMPS | u32::from(count & 0xf) << 16 | words as u32
}

fn freq_words(hz: f64) -> [u32; 2] {
    let raw = (hz * FREQ_RADIX) as i64 as u64;
    [(raw >> 32) as u32, raw as u32]
}

fn to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

/// Context packet carrying a sample rate and RF frequency.
pub fn context_packet(stream_id: u32, sample_rate: f64, rf_freq: f64) -> Vec<u8> {
    let mut words = vec![0, stream_id, START_SECS, 0, 0, CIF0_RF_FREQ | CIF0_SAMPLE_RATE];
    words.extend(freq_words(rf_freq));
    words.extend(freq_words(sample_rate));
    words[0] = header(TYPE_CONTEXT, 0, words.len());
    to_bytes(&words)
}

/// Fields of a synthetic data packet.
#[derive(Debug, Clone)]
pub struct DataFields {
    pub stream_id: u32,
    pub count: u8,
    pub integer_seconds: u32,
    pub fractional_seconds: u64,
    pub samples: Vec<(i16, i16)>,
    pub sample_loss: bool,
}

impl DataFields {
    pub fn encode(&self) -> Vec<u8> {
        let trailer = usize::from(self.sample_loss);
        let words = 5 + self.samples.len() + trailer;
        let mut hdr = header(TYPE_DATA, self.count, words);
        if self.sample_loss {
            hdr |= 1 << 26;
        }
        let mut dat = to_bytes(&[
            hdr,
            self.stream_id,
            self.integer_seconds,
            (self.fractional_seconds >> 32) as u32,
            self.fractional_seconds as u32,
        ]);
        for (re, im) in &self.samples {
            dat.extend(re.to_le_bytes());
            dat.extend(im.to_le_bytes());
        }
        if self.sample_loss {
            dat.extend((1u32 << 24 | 1 << 12).to_be_bytes());
        }
        dat
    }
}

/// Deterministic sample value for a window, channel position, and sample index.
pub fn sample(window: usize, position: usize, idx: usize) -> (i16, i16) {
    (
        (position * 1000 + idx) as i16,
        (window as i16 + 1) * if position % 2 == 0 { 1 } else { -1 },
    )
}

/// A stream of data packets, one per channel per window, in channel order.
///
/// There are `per_second` windows per second and the first window sits `phase` windows into
/// a second, so alignment drops the first `per_second - phase` windows when `phase > 0`.
#[derive(Debug, Clone)]
pub struct Stream {
    pub channels: Vec<u8>,
    pub samples_per_packet: usize,
    pub per_second: usize,
    pub phase: usize,
}

impl Stream {
    pub fn new(channels: &[u8], samples_per_packet: usize) -> Self {
        Stream {
            channels: channels.to_vec(),
            samples_per_packet,
            per_second: 4,
            phase: 2,
        }
    }

    /// Windows dropped by integer second alignment.
    pub fn unaligned(&self) -> usize {
        if self.phase == 0 {
            0
        } else {
            self.per_second - self.phase
        }
    }

    pub fn fields(&self, window: usize, position: usize) -> DataFields {
        let tick = window + self.phase;
        DataFields {
            stream_id: 1 << self.channels[position],
            count: (window % 16) as u8,
            integer_seconds: START_SECS + (tick / self.per_second) as u32,
            fractional_seconds: (tick % self.per_second) as u64 * (PICOS / self.per_second as u64),
            samples: (0..self.samples_per_packet)
                .map(|i| sample(window, position, i))
                .collect(),
            sample_loss: false,
        }
    }

    /// Integer seconds of `window`.
    pub fn seconds(&self, window: usize) -> u32 {
        START_SECS + ((window + self.phase) / self.per_second) as u32
    }

    /// Context followed by `windows` windows of data.
    pub fn datagrams(&self, windows: usize) -> Vec<Vec<u8>> {
        let mut dat = vec![context_packet(1 << self.channels[0], 25e6, 1420.4e6)];
        for w in 0..windows {
            for p in 0..self.channels.len() {
                dat.push(self.fields(w, p).encode());
            }
        }
        dat
    }
}

/// Ring buffer call log entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Connect,
    LockWrite,
    Header(Vec<u8>),
    Data(Vec<u8>),
    UnlockWrite,
    Disconnect,
}

/// Ring buffer that remembers every call.
#[derive(Debug, Default)]
pub struct MemoryRingBuffer {
    pub calls: Vec<Call>,
    /// Fail data writes once this many have succeeded.
    pub fail_data_after: Option<usize>,
}

impl MemoryRingBuffer {
    pub fn headers(&self) -> Vec<&[u8]> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Header(h) => Some(h.as_slice()),
                _ => None,
            })
            .collect()
    }

    pub fn data(&self) -> Vec<&[u8]> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Data(d) => Some(d.as_slice()),
                _ => None,
            })
            .collect()
    }

    pub fn torn_down(&self) -> bool {
        self.calls.ends_with(&[Call::UnlockWrite, Call::Disconnect])
    }
}

impl RingBuffer for MemoryRingBuffer {
    fn connect(&mut self) -> Result<()> {
        self.calls.push(Call::Connect);
        Ok(())
    }
    fn lock_write(&mut self) -> Result<()> {
        self.calls.push(Call::LockWrite);
        Ok(())
    }
    fn write_header(&mut self, header: &[u8]) -> Result<()> {
        self.calls.push(Call::Header(header.to_vec()));
        Ok(())
    }
    fn write_data(&mut self, data: &[u8]) -> Result<()> {
        if let Some(max) = self.fail_data_after {
            if self.data().len() >= max {
                return Err(Error::SinkWriteFailed("consumer went away".to_string()));
            }
        }
        self.calls.push(Call::Data(data.to_vec()));
        Ok(())
    }
    fn unlock_write(&mut self) -> Result<()> {
        self.calls.push(Call::UnlockWrite);
        Ok(())
    }
    fn disconnect(&mut self) -> Result<()> {
        self.calls.push(Call::Disconnect);
        Ok(())
    }
}

/// Decode recorded frame bytes into complex float pairs.
pub fn decode_frame(dat: &[u8]) -> Vec<(f32, f32)> {
    dat.chunks_exact(8)
        .map(|c| {
            (
                f32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                f32::from_le_bytes([c[4], c[5], c[6], c[7]]),
            )
        })
        .collect()
}

/// Source that cancels a token after delivering a number of datagrams.
pub struct CancellingSource<S> {
    pub inner: S,
    pub token: CancelToken,
    pub after: usize,
    pub delivered: Rc<Cell<usize>>,
}

impl<S: PacketSource> PacketSource for CancellingSource<S> {
    fn recv(&mut self, buf: &mut [u8]) -> Result<Received> {
        let zult = self.inner.recv(buf)?;
        if matches!(zult, Received::Datagram(_)) {
            self.delivered.set(self.delivered.get() + 1);
            if self.delivered.get() >= self.after {
                self.token.cancel();
            }
        }
        Ok(zult)
    }
}
