//! DADA ring buffer output.
//!
//! A DADA consumer expects a single fixed-size ASCII header block describing the observation,
//! followed by a contiguous stream of sample data. [SinkWriter] drives any [RingBuffer]
//! through that contract: connect and lock when the stream context is known, write the header
//! exactly once with the first complete frame, then write frames until told to tear down.
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::DateTime;
use tracing::{debug, info, warn};

use crate::frame::Frame;
use crate::prelude::*;
use crate::vita::StreamContext;

/// Size of the DADA header block in bytes.
pub const HDR_SIZE: usize = 4096;

/// Target of the header/data contract.
///
/// Implementations may block in [RingBuffer::write_data] while the consumer catches up.
pub trait RingBuffer {
    /// # Errors
    /// [Error::SinkConnect] if the buffer cannot be attached.
    fn connect(&mut self) -> Result<()>;

    /// # Errors
    /// [Error::SinkConnect] if write access cannot be acquired.
    fn lock_write(&mut self) -> Result<()>;

    /// Size of the header block; headers are padded to exactly this size.
    fn header_size(&self) -> usize {
        HDR_SIZE
    }

    /// # Errors
    /// [Error::HeaderWrite] on failure.
    fn write_header(&mut self, header: &[u8]) -> Result<()>;

    /// # Errors
    /// [Error::SinkWriteFailed] on failure.
    fn write_data(&mut self, data: &[u8]) -> Result<()>;

    /// Release write access, signalling end of data.
    ///
    /// # Errors
    /// [Error::SinkTeardown] on failure.
    fn unlock_write(&mut self) -> Result<()>;

    /// # Errors
    /// [Error::SinkTeardown] on failure.
    fn disconnect(&mut self) -> Result<()>;
}

impl<B: RingBuffer + ?Sized> RingBuffer for Box<B> {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }
    fn lock_write(&mut self) -> Result<()> {
        (**self).lock_write()
    }
    fn header_size(&self) -> usize {
        (**self).header_size()
    }
    fn write_header(&mut self, header: &[u8]) -> Result<()> {
        (**self).write_header(header)
    }
    fn write_data(&mut self, data: &[u8]) -> Result<()> {
        (**self).write_data(data)
    }
    fn unlock_write(&mut self) -> Result<()> {
        (**self).unlock_write()
    }
    fn disconnect(&mut self) -> Result<()> {
        (**self).disconnect()
    }
}

/// Writes a DADA file: the header block followed by all data.
#[derive(Debug)]
pub struct FileRingBuffer {
    path: PathBuf,
    clobber: bool,
    writer: Option<BufWriter<File>>,
}

impl FileRingBuffer {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileRingBuffer {
            path: path.as_ref().to_path_buf(),
            clobber: false,
            writer: None,
        }
    }

    /// Overwrite the output file if it already exists.
    #[must_use]
    pub fn with_clobber(mut self, clobber: bool) -> Self {
        self.clobber = clobber;
        self
    }

    fn writer(&mut self) -> std::io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| std::io::Error::other("not locked for writing"))
    }
}

impl RingBuffer for FileRingBuffer {
    fn connect(&mut self) -> Result<()> {
        if !self.clobber && self.path.exists() {
            return Err(Error::SinkConnect(format!("{:?} exists", self.path)));
        }
        Ok(())
    }

    fn lock_write(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| Error::SinkConnect(format!("{:?}: {e}", self.path)))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn write_header(&mut self, header: &[u8]) -> Result<()> {
        self.writer()
            .and_then(|w| w.write_all(header))
            .map_err(|e| Error::HeaderWrite(e.to_string()))
    }

    fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.writer()
            .and_then(|w| w.write_all(data))
            .map_err(|e| Error::SinkWriteFailed(e.to_string()))
    }

    fn unlock_write(&mut self) -> Result<()> {
        if let Some(mut w) = self.writer.take() {
            w.flush().map_err(|e| Error::SinkTeardown(e.to_string()))?;
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Accepts and discards everything.
#[derive(Debug, Default)]
pub struct NullRingBuffer;

impl RingBuffer for NullRingBuffer {
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }
    fn lock_write(&mut self) -> Result<()> {
        Ok(())
    }
    fn write_header(&mut self, _header: &[u8]) -> Result<()> {
        Ok(())
    }
    fn write_data(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }
    fn unlock_write(&mut self) -> Result<()> {
        Ok(())
    }
    fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Observation parameters written into the DADA header.
#[derive(Debug, Clone)]
pub struct DadaHeader {
    text: String,
}

impl DadaHeader {
    /// Build the header for `context` recorded with `npol` channels.
    ///
    /// # Errors
    /// [Error::Config] if `context` has no sample rate.
    pub fn new(context: &StreamContext, npol: usize) -> Result<Self> {
        let Some(sample_rate) = context.sample_rate.filter(|r| *r > 0.0) else {
            return Err(Error::Config("stream context has no sample rate".to_string()));
        };
        let rf_freq = context.rf_freq.unwrap_or_default();

        let mut text = String::new();
        // writing to a String cannot fail
        let _ = write!(
            text,
            "HEADER DADA\n\
             HDR_VERSION 1.0\n\
             HDR_SIZE    {HDR_SIZE}\n\
             FREQ {:.6}\n\
             BW {}\n\
             TELESCOPE DWL\n\
             RECEIVER VRT\n\
             INSTRUMENT dspsr\n\
             SOURCE UNDEFINED\n\
             NBIT 32\n\
             NDIM 2\n\
             NPOL {npol}\n\
             RESOLUTION 1\n\
             OBS_OFFSET 0\n\
             TSAMP {:.6}\n",
            rf_freq / 1e6,
            (sample_rate / 1e6) as i64,
            1e6 / sample_rate,
        );
        Ok(DadaHeader { text })
    }

    /// Render the complete header block with the UTC start time, padded with spaces to `size`.
    ///
    /// # Errors
    /// [Error::HeaderOverflow] if the header does not fit in `size` bytes.
    pub fn render(&self, integer_seconds: u32, size: usize) -> Result<Vec<u8>> {
        let start = DateTime::from_timestamp(i64::from(integer_seconds), 0)
            .unwrap_or_default()
            .format("%Y-%m-%d-%H:%M:%S");
        let mut block = format!("{}UTC_START {start}\n", self.text).into_bytes();
        if block.len() > size {
            return Err(Error::HeaderOverflow {
                len: block.len(),
                max: size,
            });
        }
        block.resize(size, b' ');
        Ok(block)
    }
}

#[derive(Debug)]
enum SinkState {
    Detached,
    /// Connected and locked, header known but not yet written.
    Ready(DadaHeader),
    Streaming,
}

/// Two-phase writer: header once, then frames.
#[derive(Debug)]
pub struct SinkWriter<B: RingBuffer> {
    buffer: B,
    state: SinkState,
    header_copy: Option<PathBuf>,
    frames_written: u64,
    bytes_written: u64,
}

impl<B: RingBuffer> SinkWriter<B> {
    pub fn new(buffer: B) -> Self {
        SinkWriter {
            buffer,
            state: SinkState::Detached,
            header_copy: None,
            frames_written: 0,
            bytes_written: 0,
        }
    }

    /// Also write the rendered header to `path`, for debugging.
    #[must_use]
    pub fn with_header_copy(mut self, path: Option<PathBuf>) -> Self {
        self.header_copy = path;
        self
    }

    #[must_use]
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// True once the header block has been written.
    #[must_use]
    pub fn header_written(&self) -> bool {
        matches!(self.state, SinkState::Streaming)
    }

    #[must_use]
    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    /// Attach to the ring buffer and prepare the header for `context`.
    ///
    /// # Errors
    /// [Error::SinkConnect] if attaching fails, [Error::Config] if the header cannot be built.
    pub fn prepare(&mut self, context: &StreamContext, npol: usize) -> Result<()> {
        let header = DadaHeader::new(context, npol)?;
        self.buffer.connect()?;
        self.buffer.lock_write()?;
        debug!("ring buffer connected and locked");
        self.state = SinkState::Ready(header);
        Ok(())
    }

    /// Write a complete frame, preceded by the header block if this is the first frame.
    ///
    /// # Errors
    /// [Error::HeaderWrite] or [Error::HeaderOverflow] for header failures,
    /// [Error::SinkWriteFailed] if the frame cannot be written, including when
    /// [SinkWriter::prepare] has not been called.
    pub fn write_frame(&mut self, frame: &mut Frame) -> Result<()> {
        match &self.state {
            SinkState::Detached => {
                return Err(Error::SinkWriteFailed(
                    "frame before ring buffer was prepared".to_string(),
                ))
            }
            SinkState::Ready(header) => {
                let block = header.render(frame.integer_seconds(), self.buffer.header_size())?;
                if let Some(path) = &self.header_copy {
                    if let Err(err) = std::fs::write(path, &block) {
                        warn!(?path, "failed to write header copy: {err}");
                    }
                }
                self.buffer.write_header(&block)?;
                info!(utc_start = frame.integer_seconds(), "wrote header block");
                self.state = SinkState::Streaming;
            }
            SinkState::Streaming => {}
        }

        let data = frame.encode();
        self.buffer.write_data(data)?;
        self.frames_written += 1;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Release and detach the ring buffer. Does nothing if never prepared.
    ///
    /// # Errors
    /// [Error::SinkTeardown] with the first failure; both steps are always attempted.
    pub fn teardown(&mut self) -> Result<()> {
        if matches!(self.state, SinkState::Detached) {
            return Ok(());
        }
        self.state = SinkState::Detached;
        let unlocked = self.buffer.unlock_write();
        let disconnected = self.buffer.disconnect();
        debug!(
            frames = self.frames_written,
            bytes = self.bytes_written,
            "ring buffer released"
        );
        unlocked.and(disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelSet;
    use crate::frame::{Assembly, Calibration, FrameAssembler};
    use crate::vita::DataPacket;

    fn context() -> StreamContext {
        StreamContext {
            sample_rate: Some(25e6),
            rf_freq: Some(1420.4e6),
            ..Default::default()
        }
    }

    fn packet() -> DataPacket {
        DataPacket {
            stream_id: 1,
            packet_count: 0,
            num_samples: 1,
            offset: 0,
            integer_seconds: 1_700_000_000,
            fractional_seconds: 0,
            lost_frame: false,
            data_valid: true,
        }
    }

    #[test]
    fn header_contents() {
        let header = DadaHeader::new(&context(), 2).unwrap();
        let block = header.render(1_700_000_000, HDR_SIZE).unwrap();

        assert_eq!(block.len(), HDR_SIZE);
        let text = String::from_utf8(block).unwrap();
        let lines: Vec<&str> = text.trim_end().lines().collect();
        assert_eq!(
            lines,
            vec![
                "HEADER DADA",
                "HDR_VERSION 1.0",
                "HDR_SIZE    4096",
                "FREQ 1420.400000",
                "BW 25",
                "TELESCOPE DWL",
                "RECEIVER VRT",
                "INSTRUMENT dspsr",
                "SOURCE UNDEFINED",
                "NBIT 32",
                "NDIM 2",
                "NPOL 2",
                "RESOLUTION 1",
                "OBS_OFFSET 0",
                "TSAMP 0.040000",
                "UTC_START 2023-11-14-22:13:20",
            ]
        );
    }

    #[test]
    fn header_requires_sample_rate() {
        let zult = DadaHeader::new(&StreamContext::default(), 1);
        assert!(matches!(zult, Err(Error::Config(_))), "got {zult:?}");
    }

    #[test]
    fn header_overflow_is_err() {
        let header = DadaHeader::new(&context(), 1).unwrap();
        let zult = header.render(0, 64);
        assert!(matches!(zult, Err(Error::HeaderOverflow { max: 64, .. })));
    }

    #[test]
    fn write_before_prepare_is_err() {
        let channels = ChannelSet::new(&[0]).unwrap();
        let mut asm = FrameAssembler::new(&channels, 1, Calibration::default());
        let Assembly::Complete(frame) = asm.assemble(0, &packet(), &[1, 0, 1, 0]).unwrap() else {
            panic!("single channel packet should complete a frame");
        };
        let mut sink = SinkWriter::new(NullRingBuffer);

        let zult = sink.write_frame(frame);
        assert!(matches!(zult, Err(Error::SinkWriteFailed(_))), "got {zult:?}");
    }

    #[test]
    fn file_ring_buffer_writes_header_then_data() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("out.dada");
        let copy = tmpdir.path().join("dada_header.txt");
        let channels = ChannelSet::new(&[0]).unwrap();
        let mut asm = FrameAssembler::new(&channels, 1, Calibration::default());
        let mut sink = SinkWriter::new(FileRingBuffer::new(&path)).with_header_copy(Some(copy.clone()));

        sink.prepare(&context(), 1).unwrap();
        for _ in 0..3 {
            let Assembly::Complete(frame) = asm.assemble(0, &packet(), &[1, 0, 2, 0]).unwrap()
            else {
                panic!("single channel packet should complete a frame");
            };
            sink.write_frame(frame).unwrap();
        }
        sink.teardown().unwrap();

        let dat = std::fs::read(&path).unwrap();
        assert_eq!(dat.len(), HDR_SIZE + 3 * 8);
        assert!(dat.starts_with(b"HEADER DADA\n"));
        assert_eq!(&dat[HDR_SIZE..HDR_SIZE + 4], &1.0f32.to_le_bytes());
        assert_eq!(&dat[HDR_SIZE + 4..HDR_SIZE + 8], &2.0f32.to_le_bytes());
        assert_eq!(std::fs::read(&copy).unwrap(), dat[..HDR_SIZE]);
        assert_eq!(sink.frames_written(), 3);
    }

    #[test]
    fn file_ring_buffer_refuses_to_clobber() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("exists.dada");
        std::fs::write(&path, b"x").unwrap();

        let mut sink = SinkWriter::new(FileRingBuffer::new(&path));
        let zult = sink.prepare(&context(), 1);
        assert!(matches!(zult, Err(Error::SinkConnect(_))), "got {zult:?}");

        let mut sink = SinkWriter::new(FileRingBuffer::new(&path).with_clobber(true));
        sink.prepare(&context(), 1).unwrap();
        sink.teardown().unwrap();
    }
}
