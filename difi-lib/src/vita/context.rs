//! Context packet payloads and the stream context accumulated from them.
use serde::{Deserialize, Serialize};

use super::Words;
use crate::prelude::*;

// CIF0 indicator bits, VITA-49.2 section 9.1
const CIF0_CHANGE: u32 = 1 << 31;
const CIF0_REFERENCE_POINT: u32 = 1 << 30;
const CIF0_BANDWIDTH: u32 = 1 << 29;
const CIF0_IF_FREQ: u32 = 1 << 28;
const CIF0_RF_FREQ: u32 = 1 << 27;
const CIF0_RF_FREQ_OFFSET: u32 = 1 << 26;
const CIF0_IF_BAND_OFFSET: u32 = 1 << 25;
const CIF0_REFERENCE_LEVEL: u32 = 1 << 24;
const CIF0_GAIN: u32 = 1 << 23;
const CIF0_OVER_RANGE: u32 = 1 << 22;
const CIF0_SAMPLE_RATE: u32 = 1 << 21;
const CIF0_TIMESTAMP_ADJUSTMENT: u32 = 1 << 20;
const CIF0_TIMESTAMP_CALIBRATION: u32 = 1 << 19;
const CIF0_TEMPERATURE: u32 = 1 << 18;
const CIF0_DEVICE_ID: u32 = 1 << 17;
const CIF0_STATE_EVENT: u32 = 1 << 16;
const CIF0_PAYLOAD_FORMAT: u32 = 1 << 15;
// Additional CIF words follow CIF0 in the order CIF1, CIF2, CIF3, CIF7
const CIF0_EXTENSIONS: [u32; 4] = [1 << 1, 1 << 2, 1 << 3, 1 << 7];

/// Radix point of 64-bit frequency fields.
const FREQ_RADIX: f64 = (1u64 << 20) as f64;
/// Radix point of 16-bit level and gain fields.
const LEVEL_RADIX: f32 = (1u32 << 7) as f32;

/// Receiver metadata carried by context packets.
///
/// Context packets may carry only a subset of fields, so a [StreamContext] is an accumulation;
/// fields not present in a packet retain the value from earlier packets.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct StreamContext {
    /// Sample rate in Hz.
    pub sample_rate: Option<f64>,
    /// RF reference (center) frequency in Hz.
    pub rf_freq: Option<f64>,
    /// Bandwidth in Hz.
    pub bandwidth: Option<f64>,
    /// IF reference frequency in Hz.
    pub if_freq: Option<f64>,
    pub rf_freq_offset: Option<f64>,
    pub if_band_offset: Option<f64>,
    /// Reference level in dBm.
    pub reference_level: Option<f32>,
    /// Stage 1 and stage 2 gain in dB.
    pub gain: Option<(f32, f32)>,
    pub reference_point: Option<u32>,
    /// Timestamp adjustment in femtoseconds.
    pub timestamp_adjustment: Option<i64>,
    pub timestamp_calibration: Option<u32>,
    pub state_event: Option<u32>,
    /// Raw data packet payload format word.
    pub payload_format: Option<u64>,
    /// Set if the most recent context packet reported a change.
    pub changed: bool,
}

impl StreamContext {
    /// Apply the fields of a context packet whose CIF0 word is at `idx`.
    pub(crate) fn update(&mut self, words: &Words, mut idx: usize) -> Result<()> {
        let need = |idx: usize, n: usize| -> Result<()> {
            if idx + n > words.len() {
                return Err(Error::Decode(format!(
                    "context field at word {idx} exceeds packet size {}",
                    words.len()
                )));
            }
            Ok(())
        };

        need(idx, 1)?;
        let cif0 = words.u32(idx);
        idx += 1;
        for bit in CIF0_EXTENSIONS {
            if cif0 & bit != 0 {
                idx += 1;
            }
        }

        self.changed = cif0 & CIF0_CHANGE != 0;

        if cif0 & CIF0_REFERENCE_POINT != 0 {
            need(idx, 1)?;
            self.reference_point = Some(words.u32(idx));
            idx += 1;
        }
        if cif0 & CIF0_BANDWIDTH != 0 {
            need(idx, 2)?;
            self.bandwidth = Some(freq(words.u64(idx)));
            idx += 2;
        }
        if cif0 & CIF0_IF_FREQ != 0 {
            need(idx, 2)?;
            self.if_freq = Some(freq(words.u64(idx)));
            idx += 2;
        }
        if cif0 & CIF0_RF_FREQ != 0 {
            need(idx, 2)?;
            self.rf_freq = Some(freq(words.u64(idx)));
            idx += 2;
        }
        if cif0 & CIF0_RF_FREQ_OFFSET != 0 {
            need(idx, 2)?;
            self.rf_freq_offset = Some(freq(words.u64(idx)));
            idx += 2;
        }
        if cif0 & CIF0_IF_BAND_OFFSET != 0 {
            need(idx, 2)?;
            self.if_band_offset = Some(freq(words.u64(idx)));
            idx += 2;
        }
        if cif0 & CIF0_REFERENCE_LEVEL != 0 {
            need(idx, 1)?;
            self.reference_level = Some(level(words.u32(idx) as u16));
            idx += 1;
        }
        if cif0 & CIF0_GAIN != 0 {
            need(idx, 1)?;
            let x = words.u32(idx);
            self.gain = Some((level(x as u16), level((x >> 16) as u16)));
            idx += 1;
        }
        if cif0 & CIF0_OVER_RANGE != 0 {
            idx += 1;
        }
        if cif0 & CIF0_SAMPLE_RATE != 0 {
            need(idx, 2)?;
            self.sample_rate = Some(freq(words.u64(idx)));
            idx += 2;
        }
        if cif0 & CIF0_TIMESTAMP_ADJUSTMENT != 0 {
            need(idx, 2)?;
            self.timestamp_adjustment = Some(words.u64(idx) as i64);
            idx += 2;
        }
        if cif0 & CIF0_TIMESTAMP_CALIBRATION != 0 {
            need(idx, 1)?;
            self.timestamp_calibration = Some(words.u32(idx));
            idx += 1;
        }
        if cif0 & CIF0_TEMPERATURE != 0 {
            idx += 1;
        }
        if cif0 & CIF0_DEVICE_ID != 0 {
            idx += 2;
        }
        if cif0 & CIF0_STATE_EVENT != 0 {
            need(idx, 1)?;
            self.state_event = Some(words.u32(idx));
            idx += 1;
        }
        if cif0 & CIF0_PAYLOAD_FORMAT != 0 {
            need(idx, 2)?;
            self.payload_format = Some(words.u64(idx));
        }
        // Remaining fields (GPS, INS, ephemeris, association lists) are not used.

        Ok(())
    }
}

fn freq(raw: u64) -> f64 {
    raw as i64 as f64 / FREQ_RADIX
}

fn level(raw: u16) -> f32 {
    f32::from(raw as i16) / LEVEL_RADIX
}
