//! WAV file capture source.
//!
//! Replays a 16-bit PCM WAV file as a sequence of 10 ms [`AudioFrame`]s, the
//! same chunking a live recorder uses.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use asrbridge_common::{AudioFrame, FrameStatus};
use chrono::{DateTime, Utc};
use hound::{SampleFormat, WavReader};

use crate::client::ClientError;

/// Duration of one captured frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(10);

pub struct WavCapture {
    reader: WavReader<BufReader<File>>,
    samples_per_frame: usize,
    sample_rate: u32,
    channels: u16,
    started_at: DateTime<Utc>,
    produced: usize,
    /// Samples not yet read from the file
    remaining: usize,
    finished: bool,
}

impl WavCapture {
    pub fn open(path: &Path) -> Result<Self, ClientError> {
        let reader = WavReader::open(path)?;
        let spec = reader.spec();
        if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(ClientError::Audio(hound::Error::Unsupported));
        }
        let per_channel = (spec.sample_rate / 100).max(1) as usize;
        let remaining = reader.len() as usize;
        Ok(Self {
            reader,
            samples_per_frame: per_channel * spec.channels as usize,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            started_at: Utc::now(),
            produced: 0,
            remaining,
            finished: false,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Total length of the file.
    pub fn duration(&self) -> Duration {
        let frames = self.reader.duration() as u64;
        Duration::from_micros(frames * 1_000_000 / self.sample_rate.max(1) as u64)
    }

    /// Capture time of the sample at `offset` (interleaved samples).
    fn timestamp(&self, offset: usize) -> DateTime<Utc> {
        let frames = (offset / self.channels.max(1) as usize) as i64;
        let micros = frames * 1_000_000 / self.sample_rate.max(1) as i64;
        self.started_at + chrono::Duration::microseconds(micros)
    }
}

impl Iterator for WavCapture {
    type Item = Result<AudioFrame, ClientError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let mut samples = Vec::with_capacity(self.samples_per_frame);
        for sample in self.reader.samples::<i16>().take(self.samples_per_frame) {
            match sample {
                Ok(s) => samples.push(s),
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                }
            }
        }
        if samples.is_empty() {
            self.finished = true;
            return None;
        }
        self.remaining = self.remaining.saturating_sub(samples.len());

        let mut status = FrameStatus::default();
        if samples.len() < self.samples_per_frame {
            status.input_underflow = true;
            samples.resize(self.samples_per_frame, 0);
        }
        if self.remaining == 0 {
            status.end_of_stream = true;
            self.finished = true;
        }

        let captured_at = self.timestamp(self.produced);
        self.produced += samples.len();
        Some(Ok(AudioFrame::from_samples(&samples, status).with_timestamp(captured_at)))
    }
}
