//! Captures on disk, as two-channel WAV files.
//!
//! Captures are written as 32-bit float samples in volts. Reading also
//! accepts 32-bit integer files, taken to hold raw converter codes.

use crate::component::{Component, ComponentError};
use crate::stream_buffer::{code_to_voltage, StereoBlock};
use crate::trigger_aligner::Capture;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use log::debug;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

/// Stereo, 32-bit float.
pub fn wav_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    }
}

/// Write both channels of `block`, interleaved.
pub fn write_block(path: impl AsRef<Path>, block: &StereoBlock, sample_rate: u32) -> Result<(), ComponentError> {
    let mut writer = WavWriter::create(path, wav_spec(sample_rate))?;
    for (&left, &right) in block.left.iter().zip(&block.right) {
        writer.write_sample(left)?;
        writer.write_sample(right)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Read a two-channel file back into a block. Returns the block and the
/// file's sample rate.
pub fn read_block(path: impl AsRef<Path>) -> Result<(StereoBlock, u32), ComponentError> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    if spec.channels != 2 {
        return Err(hound::Error::FormatError("capture files need exactly two channels").into());
    }

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, 32) => reader.samples::<f32>().collect::<Result<_, _>>()?,
        (SampleFormat::Int, 32) => reader
            .samples::<i32>()
            .map(|s| s.map(code_to_voltage))
            .collect::<Result<_, _>>()?,
        _ => return Err(hound::Error::Unsupported.into()),
    };

    let mut block = StereoBlock::with_capacity(samples.len() / 2);
    for frame in samples.chunks_exact(2) {
        block.left.push(frame[0]);
        block.right.push(frame[1]);
    }
    Ok((block, spec.sample_rate))
}

/// Writes every capture it receives to `capture_NNNN.wav` in a directory,
/// and outputs the path written (or the error).
pub struct CaptureWriter {
    dir: PathBuf,
    sample_rate: u32,
    written: usize,
}

impl CaptureWriter {
    /// Creates `dir` if it does not exist yet.
    pub fn new(dir: impl Into<PathBuf>, sample_rate: u32) -> Result<Self, ComponentError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            sample_rate,
            written: 0,
        })
    }

    /// Number of captures written so far.
    pub fn written(&self) -> usize {
        self.written
    }
}

impl Component for CaptureWriter {
    type InData = Capture;
    type OutData = Result<PathBuf, ComponentError>;

    fn convert(&mut self, input: Capture) -> Result<PathBuf, ComponentError> {
        let path = self.dir.join(format!("capture_{:04}.wav", self.written));
        write_block(&path, &input.signal, self.sample_rate)?;
        self.written += 1;
        debug!(
            "{} : {} frames (offset {}) to {}",
            self,
            input.frames(),
            input.offset_frames,
            path.display()
        );
        Ok(path)
    }

    fn finalize(&mut self) -> Result<(), ComponentError> {
        debug!("{} : {} captures written", self, self.written);
        Ok(())
    }
}

impl fmt::Display for CaptureWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CaptureWriter")
    }
}
