//! Peak waveform generation
//!
//! A waveform is the absolute amplitude of mono PCM at 44.1 kHz, reduced to a
//! fixed number of points by taking the maximum of each block. Taking the max
//! keeps transients visible where averaging would flatten them.
//!
//! Decoded PCM is never held in full: [`PeakAccumulator`] folds it block by
//! block as it arrives from the decoder.

use cadence_core::constants::WAVEFORM_SAMPLE_RATE;
use serde::{Deserialize, Serialize};

/// JSON document published as `waveform.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveformDocument {
    pub peaks: Vec<f32>,
    /// Seconds
    pub duration: f64,
    pub sample_rate: u32,
}

impl WaveformDocument {
    pub fn new(peaks: Vec<f32>, duration: f64) -> Self {
        Self {
            peaks,
            duration,
            sample_rate: WAVEFORM_SAMPLE_RATE,
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Intermediate blocks kept per output point.
const BLOCKS_PER_POINT: usize = 4;

/// Absolute amplitude of one little-endian f32 sample, clamped to [0, 1]. NaN becomes 0.
fn amplitude(bytes: [u8; 4]) -> f32 {
    let sample = f32::from_le_bytes(bytes).abs();
    if sample.is_nan() {
        0.0
    } else {
        sample.min(1.0)
    }
}

/// Streaming peak reduction of f32le PCM.
///
/// Blocks are sized from the expected sample count so that about
/// `BLOCKS_PER_POINT` blocks land on every output point. If the stream runs
/// longer than expected and the block buffer fills up, neighbouring blocks are
/// merged and the block length doubles, so memory stays bounded by the point
/// count whatever the input length. [`PeakAccumulator::finish`] reduces the
/// block peaks to the final points with [`downsample_peaks`].
#[derive(Debug)]
pub struct PeakAccumulator {
    target: usize,
    block_len: usize,
    capacity: usize,
    blocks: Vec<f32>,
    current: f32,
    filled: usize,
    carry: [u8; 4],
    carry_len: usize,
    samples: u64,
}

impl PeakAccumulator {
    pub fn new(expected_samples: u64, target: usize) -> Self {
        let per_block = (target.max(1) * BLOCKS_PER_POINT) as u64;
        let block_len = usize::try_from(expected_samples / per_block)
            .unwrap_or(usize::MAX)
            .max(1);
        // even, so a full buffer always merges into exact pairs
        let capacity = target.max(1) * BLOCKS_PER_POINT * 2;

        Self {
            target,
            block_len,
            capacity,
            blocks: Vec::with_capacity(capacity),
            current: 0.0,
            filled: 0,
            carry: [0; 4],
            carry_len: 0,
            samples: 0,
        }
    }

    /// Feed raw PCM bytes. Chunks may split samples anywhere.
    pub fn feed(&mut self, mut bytes: &[u8]) {
        if self.carry_len > 0 {
            let take = (4 - self.carry_len).min(bytes.len());
            self.carry[self.carry_len..self.carry_len + take].copy_from_slice(&bytes[..take]);
            self.carry_len += take;
            bytes = &bytes[take..];
            if self.carry_len < 4 {
                return;
            }
            self.carry_len = 0;
            self.push(amplitude(self.carry));
        }

        let mut samples = bytes.chunks_exact(4);
        for b in &mut samples {
            self.push(amplitude([b[0], b[1], b[2], b[3]]));
        }
        let rest = samples.remainder();
        self.carry[..rest.len()].copy_from_slice(rest);
        self.carry_len = rest.len();
    }

    /// Whole samples seen so far.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Final peaks. A trailing partial sample is dropped.
    pub fn finish(mut self) -> Vec<f32> {
        if self.filled > 0 {
            self.blocks.push(self.current);
        }
        downsample_peaks(&self.blocks, self.target)
    }

    fn push(&mut self, amplitude: f32) {
        self.samples += 1;
        self.current = self.current.max(amplitude);
        self.filled += 1;
        if self.filled < self.block_len {
            return;
        }

        self.blocks.push(self.current);
        self.current = 0.0;
        self.filled = 0;

        if self.blocks.len() >= self.capacity {
            let merged: Vec<f32> = self
                .blocks
                .chunks(2)
                .map(|pair| pair.iter().fold(0.0_f32, |peak, &s| peak.max(s)))
                .collect();
            self.blocks = merged;
            self.block_len = self.block_len.saturating_mul(2);
        }
    }
}

/// Peak-preserving downsample to `target` points.
///
/// Block `i` covers samples `[i * len / target, (i + 1) * len / target)`, so
/// every sample lands in exactly one block and no block is empty. Input no
/// longer than `target` is returned unchanged.
pub fn downsample_peaks(samples: &[f32], target: usize) -> Vec<f32> {
    let len = samples.len();
    if len <= target {
        return samples.to_vec();
    }
    if target == 0 {
        return Vec::new();
    }

    (0..target)
        .map(|i| {
            let start = i * len / target;
            let end = (i + 1) * len / target;
            samples[start..end]
                .iter()
                .fold(0.0_f32, |peak, &s| peak.max(s))
        })
        .collect()
}
