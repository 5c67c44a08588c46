mod summary;

use std::fs::File;
use std::io::{stderr, BufReader};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use difi::channel::ChannelSet;
use difi::dada::{FileRingBuffer, NullRingBuffer, RingBuffer, SinkWriter};
use difi::frame::Calibration;
use difi::pipeline::{self, CancelToken, DiscardOpts, RecordOpts};
use difi::source::{PacketSource, ReaderSource, ZmqSource};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// How long a receive may block before the loop checks for cancellation.
const RECV_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a DIFI stream into a DADA ring buffer.
    ///
    /// Waits for a context packet, drops data until the next integer second, then writes
    /// channel-interleaved complex float frames preceded by a single DADA header block.
    Record {
        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        run: RunArgs,

        /// Calibration amplitude applied to the second channel.
        #[arg(long, default_value_t = 1.0, allow_negative_numbers = true)]
        amplitude: f32,

        /// Calibration phase, in turns, applied to the second channel.
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        phase: f32,

        /// Discard frames instead of writing them anywhere.
        #[arg(long, action)]
        null: bool,

        /// DADA output file path.
        #[arg(short, long, default_value = "difi.dada", value_name = "path")]
        output: PathBuf,

        /// Delete output file if it already exists
        #[arg(long, action)]
        clobber: bool,

        /// Also write the DADA header block to this file.
        #[arg(long, value_name = "path")]
        header_copy: Option<PathBuf>,
    },
    /// Receive and decode a DIFI stream without recording it.
    Discard {
        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Args)]
struct SourceArgs {
    /// Publisher address.
    #[arg(long, default_value = "localhost")]
    address: String,

    /// Publisher port.
    #[arg(long, default_value_t = 50100)]
    port: u16,

    /// Receive high-water mark.
    #[arg(long, default_value_t = 10000)]
    hwm: i32,

    /// Replay VITA-49 packets from this capture file instead of subscribing.
    #[arg(short, long, value_name = "path")]
    input: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    /// Samples per channel to receive; 0 is unbounded.
    #[arg(long, default_value_t = 0)]
    nsamps: u64,

    /// Seconds to receive; 0 is unbounded. Overrides --nsamps.
    #[arg(long, default_value_t = 0.0)]
    duration: f64,

    /// Channels to receive, in frame order, e.g. 0 or 0,1.
    #[arg(long, default_value = "0")]
    channel: ChannelSet,

    /// Start on an integer second boundary.
    #[arg(long, action)]
    int_second: bool,

    /// Skip lost packets instead of stopping.
    #[arg(long = "continue", action)]
    continue_on_bad_packet: bool,

    /// Log throughput and signal level once a second.
    #[arg(long, action)]
    progress: bool,

    /// Run summary output format.
    #[arg(short, long, default_value = "text")]
    format: summary::Format,
}

fn open_source(args: &SourceArgs) -> Result<Box<dyn PacketSource>> {
    if let Some(path) = &args.input {
        info!("replaying {path:?}");
        let file = File::open(path).with_context(|| format!("opening input {path:?}"))?;
        return Ok(Box::new(ReaderSource::new(BufReader::new(file))));
    }
    let source = ZmqSource::connect(&args.address, args.port, args.hwm, RECV_TIMEOUT)
        .context("connecting to publisher")?;
    Ok(Box::new(source))
}

fn cancel_on_interrupt() -> Result<CancelToken> {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    ctrlc::set_handler(move || token.cancel()).context("installing interrupt handler")?;
    Ok(cancel)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(stderr)
        .with_ansi(false)
        .without_time()
        .with_env_filter(
            EnvFilter::try_from_env("DIFI_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    debug!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Record {
            source,
            run,
            amplitude,
            phase,
            null,
            output,
            clobber,
            header_copy,
        } => {
            if !run.int_second {
                bail!("recording requires --int-second");
            }
            if !null && !clobber && output.exists() {
                bail!("{output:?} exists; use --clobber");
            }
            let opts = RecordOpts::builder()
                .nsamps(run.nsamps)
                .duration(run.duration)
                .calibration(Calibration::new(*amplitude, *phase))
                .int_second(run.int_second)
                .continue_on_bad_packet(run.continue_on_bad_packet)
                .progress(run.progress)
                .build();
            opts.validate()?;

            let buffer: Box<dyn RingBuffer> = if *null {
                Box::new(NullRingBuffer)
            } else {
                info!("recording to {output:?}");
                Box::new(FileRingBuffer::new(output).with_clobber(*clobber))
            };
            let mut sink = SinkWriter::new(buffer).with_header_copy(header_copy.clone());
            let mut source = open_source(source)?;
            let cancel = cancel_on_interrupt()?;

            let summary =
                pipeline::record(source.as_mut(), &run.channel, &opts, &mut sink, &cancel)?;
            summary::print(&summary, &run.format)
        }
        Commands::Discard { source, run } => {
            let opts = DiscardOpts::builder()
                .nsamps(run.nsamps)
                .duration(run.duration)
                .int_second(run.int_second)
                .continue_on_bad_packet(run.continue_on_bad_packet)
                .progress(run.progress)
                .build();
            let mut source = open_source(source)?;
            let cancel = cancel_on_interrupt()?;

            let summary = pipeline::discard(source.as_mut(), &run.channel, &opts, &cancel)?;
            summary::print(&summary, &run.format)
        }
    }
}
