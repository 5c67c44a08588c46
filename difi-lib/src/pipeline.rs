//! Receive loops.
//!
//! [record] runs the full pipeline, source to decoder to channel selection to acquisition to
//! frame assembly to sink, one datagram per iteration on the calling thread. [discard] runs
//! the same front half and throws the samples away, which is useful for measuring a stream.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info};
use typed_builder::TypedBuilder;

use crate::acquire::{Acquisition, Action, RunningTotals, StopReason};
use crate::channel::ChannelSet;
use crate::dada::{RingBuffer, SinkWriter};
use crate::frame::{Assembly, Calibration, FrameAssembler};
use crate::prelude::*;
use crate::progress::{ProgressMonitor, ProgressReport};
use crate::source::{PacketSource, Received};
use crate::vita::{DataPacket, DecodedPacket, Decoder, StreamContext, MAX_PACKET_LEN, SAMPLE_LEN};

/// Cooperative stop request shared between a receive loop and whoever wants it to stop.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for [record].
#[derive(Debug, Clone, TypedBuilder)]
pub struct RecordOpts {
    /// Samples per channel to record; 0 is unbounded.
    #[builder(default)]
    pub nsamps: u64,
    /// Seconds to record; 0 is unbounded. Overrides `nsamps` when non-zero.
    #[builder(default)]
    pub duration: f64,
    /// Correction for the secondary channel.
    #[builder(default)]
    pub calibration: Calibration,
    /// Start recording on an integer second boundary. Required.
    #[builder(default = true)]
    pub int_second: bool,
    /// Skip packets flagged as lost rather than stopping.
    #[builder(default)]
    pub continue_on_bad_packet: bool,
    /// Log throughput and signal level about once a second.
    #[builder(default)]
    pub progress: bool,
    /// Largest sample count any single packet may carry; sizes the frame.
    #[builder(default = MAX_PACKET_LEN / SAMPLE_LEN)]
    pub max_samples_per_packet: usize,
    /// Drop packets for streams outside the channel set at decode time. When disabled such
    /// packets fail the run with [Error::ChannelMismatch].
    #[builder(default = true)]
    pub filter_streams: bool,
}

impl RecordOpts {
    /// # Errors
    /// [Error::Config] if integer-second alignment is off or the calibration is not finite.
    pub fn validate(&self) -> Result<()> {
        if !self.int_second {
            return Err(Error::Config(
                "recording requires integer second alignment".to_string(),
            ));
        }
        if !self.calibration.amplitude.is_finite() || !self.calibration.phase.is_finite() {
            return Err(Error::Config(format!(
                "calibration must be finite, got amplitude={} phase={}",
                self.calibration.amplitude, self.calibration.phase
            )));
        }
        if self.duration < 0.0 || !self.duration.is_finite() {
            return Err(Error::Config(format!("invalid duration {}", self.duration)));
        }
        if self.max_samples_per_packet == 0 {
            return Err(Error::Config("max samples per packet must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Options for [discard].
#[derive(Debug, Clone, TypedBuilder)]
pub struct DiscardOpts {
    #[builder(default)]
    pub nsamps: u64,
    #[builder(default)]
    pub duration: f64,
    #[builder(default)]
    pub int_second: bool,
    #[builder(default)]
    pub continue_on_bad_packet: bool,
    #[builder(default)]
    pub progress: bool,
}

/// What happened during a run.
#[derive(Serialize, Debug, Default, Clone)]
pub struct RunSummary {
    pub stop_reason: Option<StopReason>,
    /// Datagrams received from the source.
    pub datagrams: u64,
    /// Datagrams that were not recognized or were filtered out.
    pub skipped: u64,
    pub totals: RunningTotals,
    /// Packets dropped because their window could not be completed.
    pub incomplete: u64,
    pub frames_written: u64,
    pub bytes_written: u64,
    pub context: Option<StreamContext>,
    /// Releasing the ring buffer failed after the run ended.
    pub teardown_failed: bool,
}

/// Record `channels` from `source` into `sink` until a stop condition.
///
/// The sink is torn down on every exit path, including errors. Teardown failures are logged
/// and flagged in the summary but do not fail an otherwise successful run.
///
/// # Errors
/// [Error::Config] for invalid `opts`, and any fatal error from the source, decoder, channel
/// selection, assembly, or sink. Transient decode errors are skipped.
pub fn record<S, B>(
    source: &mut S,
    channels: &ChannelSet,
    opts: &RecordOpts,
    sink: &mut SinkWriter<B>,
    cancel: &CancelToken,
) -> Result<RunSummary>
where
    S: PacketSource + ?Sized,
    B: RingBuffer,
{
    opts.validate()?;
    let zult = record_loop(source, channels, opts, sink, cancel);
    let teardown = sink.teardown();
    match zult {
        Ok(mut summary) => {
            if let Err(err) = teardown {
                error!("ring buffer teardown failed: {err}");
                summary.teardown_failed = true;
            }
            summary.frames_written = sink.frames_written();
            summary.bytes_written = sink.bytes_written();
            info!(
                frames = summary.frames_written,
                samples = summary.totals.samples,
                "recording finished"
            );
            Ok(summary)
        }
        Err(err) => {
            if let Err(teardown_err) = teardown {
                error!("ring buffer teardown failed: {teardown_err}");
            }
            Err(err)
        }
    }
}

fn record_loop<S, B>(
    source: &mut S,
    channels: &ChannelSet,
    opts: &RecordOpts,
    sink: &mut SinkWriter<B>,
    cancel: &CancelToken,
) -> Result<RunSummary>
where
    S: PacketSource + ?Sized,
    B: RingBuffer,
{
    let mut decoder = Decoder::new();
    if opts.filter_streams {
        decoder = decoder.with_stream_filter(channels.mask());
    }
    let mut acq = Acquisition::new(opts.nsamps, opts.duration, channels.len())
        .with_int_second(opts.int_second)
        .with_continue_on_bad_packet(opts.continue_on_bad_packet);
    let mut assembler =
        FrameAssembler::new(channels, opts.max_samples_per_packet, opts.calibration);
    let mut monitor = opts.progress.then(|| ProgressMonitor::new(Instant::now()));
    let mut summary = RunSummary::default();
    let mut buf = vec![0u8; MAX_PACKET_LEN];

    info!(channels = %channels, "waiting for context");
    let reason = loop {
        if let Some(reason) = acq.poll_stop(cancel.is_cancelled()) {
            break reason;
        }
        let len = match source.recv(&mut buf)? {
            Received::Datagram(len) => len,
            Received::Idle => continue,
            Received::Closed => {
                acq.stop(StopReason::SourceClosed);
                break StopReason::SourceClosed;
            }
        };
        summary.datagrams += 1;
        let raw = &buf[..len];

        let packet = match decoder.decode(raw) {
            Ok(packet) => packet,
            Err(err) if err.is_transient() => {
                debug!("skipping datagram: {err}");
                summary.skipped += 1;
                continue;
            }
            Err(err) => return Err(err),
        };

        let data = match packet {
            DecodedPacket::Context(ctx) => {
                if acq.on_context(&ctx.context) {
                    sink.prepare(&ctx.context, channels.len())?;
                }
                continue;
            }
            DecodedPacket::Data(data) => data,
        };

        if let Some(monitor) = monitor.as_mut() {
            observe(monitor, &data, raw);
        }

        let position = channels.select(data.stream_id)?;
        match acq.on_data(position, &data) {
            Action::Record => {}
            Action::Stop(reason) => break reason,
            Action::Skip => {
                // the open window can no longer be completed
                assembler.reset();
                continue;
            }
            Action::Ignore | Action::Drop => continue,
        }

        match assembler.assemble(position, &data, raw)? {
            Assembly::Complete(frame) => {
                if sink.frames_written() == 0 {
                    info!(
                        "first frame: {} samples, {} full secs, {:.9} frac secs",
                        frame.len(),
                        frame.integer_seconds(),
                        frame.fractional_seconds() as f64 / 1e12
                    );
                }
                sink.write_frame(frame)?;
            }
            Assembly::Partial => {}
            Assembly::Dropped => {
                summary.incomplete += 1;
                continue;
            }
        }
        acq.account(data.num_samples);
    };

    // a partially assembled window is abandoned, never flushed
    assembler.reset();

    summary.stop_reason = Some(reason);
    summary.totals = acq.totals();
    summary.context = acq.context().cloned();
    Ok(summary)
}

/// Receive and decode `channels` from `source` without recording anything.
///
/// Follows the same context, alignment and lost frame rules as [record].
///
/// # Errors
/// Fatal source or decode errors, or [Error::ChannelMismatch].
pub fn discard<S>(
    source: &mut S,
    channels: &ChannelSet,
    opts: &DiscardOpts,
    cancel: &CancelToken,
) -> Result<RunSummary>
where
    S: PacketSource + ?Sized,
{
    let mut decoder = Decoder::new().with_stream_filter(channels.mask());
    let mut acq = Acquisition::new(opts.nsamps, opts.duration, channels.len())
        .with_int_second(opts.int_second)
        .with_continue_on_bad_packet(opts.continue_on_bad_packet);
    let mut monitor = opts.progress.then(|| ProgressMonitor::new(Instant::now()));
    let mut summary = RunSummary::default();
    let mut buf = vec![0u8; MAX_PACKET_LEN];
    let mut first = true;

    let reason = loop {
        if let Some(reason) = acq.poll_stop(cancel.is_cancelled()) {
            break reason;
        }
        let len = match source.recv(&mut buf)? {
            Received::Datagram(len) => len,
            Received::Idle => continue,
            Received::Closed => {
                acq.stop(StopReason::SourceClosed);
                break StopReason::SourceClosed;
            }
        };
        summary.datagrams += 1;
        let raw = &buf[..len];

        let data = match decoder.decode(raw) {
            Ok(DecodedPacket::Context(ctx)) => {
                acq.on_context(&ctx.context);
                continue;
            }
            Ok(DecodedPacket::Data(data)) => data,
            Err(err) if err.is_transient() => {
                debug!("skipping datagram: {err}");
                summary.skipped += 1;
                continue;
            }
            Err(err) => return Err(err),
        };

        let position = channels.select(data.stream_id)?;
        match acq.on_data(position, &data) {
            Action::Record => {}
            Action::Stop(reason) => break reason,
            Action::Ignore | Action::Drop | Action::Skip => continue,
        }
        if first {
            info!(
                "first frame: {} samples, {} full secs, {:.9} frac secs",
                data.num_samples,
                data.integer_seconds,
                data.fractional_seconds as f64 / 1e12
            );
            first = false;
        }
        acq.account(data.num_samples);
        if let Some(monitor) = monitor.as_mut() {
            observe(monitor, &data, raw);
        }
    };

    summary.stop_reason = Some(reason);
    summary.totals = acq.totals();
    summary.context = acq.context().cloned();
    info!(samples = summary.totals.samples, "discard finished: {reason}");
    Ok(summary)
}

fn observe(monitor: &mut ProgressMonitor, data: &DataPacket, raw: &[u8]) {
    monitor.add(data, raw);
    if let Some(report) = monitor.tick(Instant::now()) {
        log_progress(&report);
    }
}

fn log_progress(report: &ProgressReport) {
    info!(
        "{:.3} Msps, mean {:.1}, occupancy {:.2} ({} bits), clipped {:.3}%",
        report.rate / 1e6,
        report.mean,
        report.occupancy,
        report.bits,
        report.clipped * 100.0
    );
}
