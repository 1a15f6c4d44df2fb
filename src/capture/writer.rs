use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;

use super::source::Frame;

/// Magic prefix of a segment container file.
const SEGMENT_MAGIC: &[u8; 8] = b"TLSEG01\0";

/// JPEG quality for stored frames; screen content compresses well and
/// the frames only feed a vision model, not playback.
const FRAME_JPEG_QUALITY: u8 = 70;

/// Writes a segment file: magic header followed by length-prefixed
/// JPEG frames. Finalize flushes and fsyncs so the file is durable
/// before the completed-segment event fires.
pub struct SegmentWriter {
    out: BufWriter<File>,
    path: PathBuf,
    started_at: DateTime<Utc>,
    frame_count: u32,
}

impl SegmentWriter {
    pub fn create(path: PathBuf, started_at: DateTime<Utc>) -> Result<Self> {
        let file = File::create(&path)
            .with_context(|| format!("failed to create segment file {}", path.display()))?;
        let mut out = BufWriter::new(file);
        out.write_all(SEGMENT_MAGIC)
            .context("failed to write segment header")?;
        Ok(Self {
            out,
            path,
            started_at,
            frame_count: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Seconds since the first frame of this segment.
    pub fn elapsed_secs(&self) -> f64 {
        (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, FRAME_JPEG_QUALITY)
            .encode(
                frame.as_raw(),
                frame.width(),
                frame.height(),
                image::ExtendedColorType::Rgb8,
            )
            .context("failed to encode frame as JPEG")?;

        self.out
            .write_all(&(jpeg.len() as u32).to_le_bytes())
            .and_then(|_| self.out.write_all(&jpeg))
            .with_context(|| format!("failed to append frame to {}", self.path.display()))?;
        self.frame_count += 1;
        Ok(())
    }

    /// Flushes buffered frames and fsyncs the file. Errors here mean
    /// potential data loss and must reach the caller of rotation/stop.
    pub fn finalize(mut self) -> Result<u32> {
        self.out
            .flush()
            .with_context(|| format!("failed to flush segment {}", self.path.display()))?;
        self.out
            .get_ref()
            .sync_all()
            .with_context(|| format!("failed to sync segment {}", self.path.display()))?;
        Ok(self.frame_count)
    }
}

/// Reads every JPEG frame out of a segment file.
pub fn read_segment_frames(path: &Path) -> Result<Vec<Vec<u8>>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open segment file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 8];
    reader
        .read_exact(&mut magic)
        .context("segment file too short for header")?;
    if &magic != SEGMENT_MAGIC {
        bail!("{} is not a segment file", path.display());
    }

    let mut frames = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err).context("failed to read frame length"),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut jpeg = vec![0u8; len];
        reader
            .read_exact(&mut jpeg)
            .context("truncated frame in segment file")?;
        frames.push(jpeg);
    }
    Ok(frames)
}
