//! Multi-channel frame assembly.
//!
//! Packets for one sample window arrive one channel at a time. [FrameAssembler] copies each
//! into its slot of an interleaved [Frame] and hands the frame out once the packet for the last
//! channel position has been copied.
//!
//! Channel packets for a window must arrive in [ChannelSet] order. A packet that arrives out of
//! order, or whose sample count differs from position 0's, abandons the window and packets are
//! dropped until the next position 0, so a frame never mixes two windows.
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::channel::ChannelSet;
use crate::prelude::*;
use crate::vita::{DataPacket, SAMPLE_LEN};

pub type Sample = Complex<f32>;

/// Bytes per recorded sample; 32-bit float real and imaginary parts.
pub const RECORDED_SAMPLE_LEN: usize = 8;

/// Channel position the calibration correction applies to.
pub const SECONDARY_POSITION: usize = 1;

/// Amplitude and phase correction applied to the secondary channel of a multi-channel set.
///
/// Only channel position 1 is corrected. Positions beyond 1 are stored as received; this is a
/// two-channel calibration model.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub amplitude: f32,
    /// Phase in turns, `[0, 1)`.
    pub phase: f32,
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration {
            amplitude: 1.0,
            phase: 0.0,
        }
    }
}

impl Calibration {
    #[must_use]
    pub fn new(amplitude: f32, phase: f32) -> Self {
        Calibration { amplitude, phase }
    }

    /// Complex correction factor `amplitude * exp(-i * 2pi * phase)`.
    #[must_use]
    pub fn factor(&self) -> Sample {
        Complex::from_polar(self.amplitude, -2.0 * std::f32::consts::PI * self.phase)
    }
}

/// Fixed-capacity interleaved multi-channel sample buffer.
///
/// Sample `i` of channel position `p` lives at `i * channels + p`.
#[derive(Debug, Clone)]
pub struct Frame {
    samples: Vec<Sample>,
    bytes: Vec<u8>,
    channels: usize,
    capacity: usize,
    len: usize,
    integer_seconds: u32,
    fractional_seconds: u64,
}

impl Frame {
    fn new(channels: usize, capacity: usize) -> Self {
        Frame {
            samples: vec![Sample::default(); channels * capacity],
            bytes: Vec::with_capacity(channels * capacity * RECORDED_SAMPLE_LEN),
            channels,
            capacity,
            len: 0,
            integer_seconds: 0,
            fractional_seconds: 0,
        }
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Maximum samples per channel.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples per channel in the current window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Integer-seconds timestamp of the first packet of the current window.
    #[must_use]
    pub fn integer_seconds(&self) -> u32 {
        self.integer_seconds
    }

    #[must_use]
    pub fn fractional_seconds(&self) -> u64 {
        self.fractional_seconds
    }

    /// Interleaved samples of the current window.
    #[must_use]
    pub fn samples(&self) -> &[Sample] {
        &self.samples[..self.len * self.channels]
    }

    /// Samples of one channel position in the current window.
    pub fn channel(&self, position: usize) -> impl Iterator<Item = &Sample> {
        self.samples().iter().skip(position).step_by(self.channels)
    }

    /// Encode the current window as little-endian f32 pairs, ready for the ring buffer.
    pub fn encode(&mut self) -> &[u8] {
        self.bytes.clear();
        for s in &self.samples[..self.len * self.channels] {
            self.bytes.extend_from_slice(&s.re.to_le_bytes());
            self.bytes.extend_from_slice(&s.im.to_le_bytes());
        }
        &self.bytes
    }
}

/// Result of handing one channel packet to a [FrameAssembler].
#[derive(Debug)]
pub enum Assembly<'a> {
    /// Copied; later channel positions are still missing.
    Partial,
    /// Copied, completing the window.
    Complete(&'a mut Frame),
    /// Could not join the current window, which has been abandoned.
    Dropped,
}

/// Accumulates channel packets into a reusable [Frame].
#[derive(Debug)]
pub struct FrameAssembler {
    frame: Frame,
    correction: Option<Sample>,
    last_position: usize,
    /// Position the current window needs next; 0 when no window is open.
    next_position: usize,
    /// Samples contributed by position 0 of the current window.
    window_samples: usize,
}

impl FrameAssembler {
    /// Create an assembler whose frame holds `max_samples` per channel.
    ///
    /// The frame is allocated once here and reused for every window.
    #[must_use]
    pub fn new(channels: &ChannelSet, max_samples: usize, calibration: Calibration) -> Self {
        let correction = if channels.len() > 1 {
            Some(calibration.factor())
        } else {
            None
        };
        FrameAssembler {
            frame: Frame::new(channels.len(), max_samples),
            correction,
            last_position: channels.last_position(),
            next_position: 0,
            window_samples: 0,
        }
    }

    #[must_use]
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Position the next packet must have to join the current window.
    #[must_use]
    pub fn next_position(&self) -> usize {
        self.next_position
    }

    /// Copy `packet`'s samples from `raw` into the slot for channel `position`.
    ///
    /// Returns the completed frame when `position` is the last channel position. Position 0
    /// always opens a new window, abandoning any partial one. Any other position must follow
    /// the previous one and carry as many samples as position 0, otherwise the window is
    /// abandoned and the packet is [Assembly::Dropped].
    ///
    /// # Errors
    /// [Error::FrameOverflow] if the packet has more samples than the frame capacity, or
    /// [Error::NotEnoughData] if `raw` does not hold all the samples the packet claims.
    pub fn assemble(
        &mut self,
        position: usize,
        packet: &DataPacket,
        raw: &[u8],
    ) -> Result<Assembly<'_>> {
        let n = packet.num_samples;
        if n > self.frame.capacity {
            return Err(Error::FrameOverflow {
                samples: n,
                capacity: self.frame.capacity,
            });
        }
        let minimum = packet.offset + n * SAMPLE_LEN;
        if raw.len() < minimum {
            return Err(Error::NotEnoughData {
                actual: raw.len(),
                minimum,
            });
        }

        if position == 0 {
            if self.next_position != 0 {
                debug!(missing = self.next_position, "abandoning partial window");
            }
            self.window_samples = n;
            self.frame.integer_seconds = packet.integer_seconds;
            self.frame.fractional_seconds = packet.fractional_seconds;
        } else if position != self.next_position {
            debug!(position, expected = self.next_position, "channel out of window order");
            self.reset();
            return Ok(Assembly::Dropped);
        } else if n != self.window_samples {
            warn!(
                position,
                samples = n,
                expected = self.window_samples,
                "channel sample count differs within a window, dropping it"
            );
            self.reset();
            return Ok(Assembly::Dropped);
        }

        let channels = self.frame.channels;
        let correction = match self.correction {
            Some(c) if position == SECONDARY_POSITION => Some(c),
            _ => None,
        };
        let slots = self.frame.samples.iter_mut().skip(position).step_by(channels);
        for (slot, s) in slots.zip(packet.samples(raw)) {
            let s = Complex::new(f32::from(s.re), f32::from(s.im));
            *slot = match correction {
                Some(c) => c * s,
                None => s,
            };
        }
        trace!(position, samples = n, "assembled");

        if position == self.last_position {
            self.next_position = 0;
            self.frame.len = n;
            return Ok(Assembly::Complete(&mut self.frame));
        }
        self.next_position = position + 1;
        Ok(Assembly::Partial)
    }

    /// Discard any partially assembled window.
    pub fn reset(&mut self) {
        self.frame.len = 0;
        self.next_position = 0;
        self.window_samples = 0;
    }
}
