//! Acquisition lifecycle.
//!
//! [Acquisition] decides, one packet at a time, whether a run is still waiting for stream
//! context, discarding packets until the next integer second, or recording. It never touches
//! samples; the caller acts on the returned [Action].
use std::fmt::Display;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::vita::{DataPacket, StreamContext};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// No usable context packet seen yet; data packets are ignored.
    AwaitingContext,
    /// Dropping data packets until the fractional timestamp wraps to a new second.
    Aligning,
    Recording,
    Stopped,
}

/// Why a run stopped.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The requested sample count, or duration, was reached.
    SampleLimit,
    /// A packet was flagged as lost and lost packets are not tolerated.
    LostFrame,
    Cancelled,
    /// The packet source has no more datagrams.
    SourceClosed,
}

impl Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SampleLimit => "sample limit reached",
            Self::LostFrame => "lost frame",
            Self::Cancelled => "cancelled",
            Self::SourceClosed => "source closed",
        };
        write!(f, "{s}")
    }
}

/// What the caller should do with a data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Not in a state that consumes data.
    Ignore,
    /// Dropped while aligning to an integer second.
    Drop,
    /// Lost packet skipped under the continue-on-bad-packet policy.
    Skip,
    /// Assemble the packet, then [Acquisition::account] for its samples.
    Record,
    Stop(StopReason),
}

/// Counters for a run. Only ever increase.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunningTotals {
    /// Samples accepted for recording, summed across channels.
    pub samples: u64,
    /// Packets accepted for recording.
    pub packets: u64,
    /// Packets dropped while aligning.
    pub aligned_away: u64,
    /// Packets flagged as lost.
    pub lost: u64,
}

/// The acquisition state machine.
///
/// Alignment only considers packets for channel position 0, so that the first recorded
/// packet always opens a frame. Packets for other positions are dropped until then.
#[derive(Debug, Clone)]
pub struct Acquisition {
    state: AcquisitionState,
    int_second: bool,
    continue_on_bad_packet: bool,
    nsamps: u64,
    duration: f64,
    channels: usize,
    /// Stop once this many samples are recorded; 0 is unbounded.
    target: u64,
    last_fractional: u64,
    /// A position 0 packet has been recorded.
    opened: bool,
    context: Option<StreamContext>,
    started: Option<Instant>,
    stop_reason: Option<StopReason>,
    totals: RunningTotals,
}

impl Acquisition {
    /// `nsamps` is per channel and `duration` is in seconds, 0 for unbounded. A non-zero
    /// duration takes precedence over `nsamps` once the sample rate is known.
    #[must_use]
    pub fn new(nsamps: u64, duration: f64, channels: usize) -> Self {
        Acquisition {
            state: AcquisitionState::AwaitingContext,
            int_second: true,
            continue_on_bad_packet: false,
            nsamps,
            duration,
            channels,
            target: nsamps.saturating_mul(channels as u64),
            last_fractional: 0,
            opened: false,
            context: None,
            started: None,
            stop_reason: None,
            totals: RunningTotals::default(),
        }
    }

    #[must_use]
    pub fn with_int_second(mut self, int_second: bool) -> Self {
        self.int_second = int_second;
        self
    }

    #[must_use]
    pub fn with_continue_on_bad_packet(mut self, cont: bool) -> Self {
        self.continue_on_bad_packet = cont;
        self
    }

    #[must_use]
    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// Context captured when leaving [AcquisitionState::AwaitingContext].
    #[must_use]
    pub fn context(&self) -> Option<&StreamContext> {
        self.context.as_ref()
    }

    #[must_use]
    pub fn totals(&self) -> RunningTotals {
        self.totals
    }

    /// Total samples, across channels, at which the run stops. 0 is unbounded.
    #[must_use]
    pub fn target_samples(&self) -> u64 {
        self.target
    }

    /// When recording started; the alignment boundary if aligning.
    #[must_use]
    pub fn started(&self) -> Option<Instant> {
        self.started
    }

    #[must_use]
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Handle a context packet's accumulated context.
    ///
    /// Returns true only for the context that is captured, which is when the caller must
    /// prepare its sink. Context without a sample rate cannot size a recording and leaves the
    /// machine waiting; context after capture is ignored.
    pub fn on_context(&mut self, context: &StreamContext) -> bool {
        if self.state != AcquisitionState::AwaitingContext {
            trace!(state = ?self.state, "ignoring context");
            return false;
        }
        let Some(rate) = context.sample_rate.filter(|r| *r > 0.0) else {
            warn!("context packet without a sample rate, still waiting for context");
            return false;
        };

        if self.duration > 0.0 {
            self.nsamps = (self.duration * rate).floor() as u64;
        }
        self.target = self.nsamps.saturating_mul(self.channels as u64);
        self.context = Some(context.clone());
        if self.int_second {
            self.state = AcquisitionState::Aligning;
        } else {
            self.state = AcquisitionState::Recording;
            self.started = Some(Instant::now());
        }
        info!(
            sample_rate = rate,
            rf_freq = ?context.rf_freq,
            target = self.target,
            state = ?self.state,
            "captured stream context"
        );
        true
    }

    /// Decide what to do with a data packet for channel `position`.
    pub fn on_data(&mut self, position: usize, packet: &DataPacket) -> Action {
        if matches!(
            self.state,
            AcquisitionState::AwaitingContext | AcquisitionState::Stopped
        ) {
            return Action::Ignore;
        }

        if packet.lost_frame {
            self.totals.lost += 1;
            if !self.continue_on_bad_packet {
                warn!(stream_id = packet.stream_id, count = packet.packet_count, "lost frame");
                self.stop(StopReason::LostFrame);
                return Action::Stop(StopReason::LostFrame);
            }
            debug!(stream_id = packet.stream_id, count = packet.packet_count, "skipping lost frame");
            return Action::Skip;
        }

        if self.state == AcquisitionState::Aligning {
            if position != 0 {
                self.totals.aligned_away += 1;
                return Action::Drop;
            }
            if packet.fractional_seconds > self.last_fractional {
                self.last_fractional = packet.fractional_seconds;
                self.totals.aligned_away += 1;
                return Action::Drop;
            }
            self.state = AcquisitionState::Recording;
            self.started = Some(Instant::now());
            info!(
                integer_seconds = packet.integer_seconds,
                dropped = self.totals.aligned_away,
                "aligned to integer second"
            );
        }

        if !self.opened {
            if position != 0 {
                self.totals.aligned_away += 1;
                return Action::Drop;
            }
            self.opened = true;
        }
        Action::Record
    }

    /// Count the samples of a recorded packet.
    pub fn account(&mut self, samples: usize) {
        self.totals.samples += samples as u64;
        self.totals.packets += 1;
    }

    /// Loop-level stop check; evaluated once per iteration before receiving.
    pub fn poll_stop(&mut self, cancelled: bool) -> Option<StopReason> {
        if let Some(reason) = self.stop_reason {
            return Some(reason);
        }
        let reason = if cancelled {
            StopReason::Cancelled
        } else if self.target > 0 && self.totals.samples >= self.target {
            StopReason::SampleLimit
        } else {
            return None;
        };
        self.stop(reason);
        Some(reason)
    }

    /// Move to [AcquisitionState::Stopped]. The first reason sticks.
    pub fn stop(&mut self, reason: StopReason) {
        if self.stop_reason.is_none() {
            info!("stopping: {reason}");
            self.stop_reason = Some(reason);
        }
        self.state = AcquisitionState::Stopped;
    }
}
