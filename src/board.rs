//! Narrow interface over the digitizer SDK, plus a synthetic board used by
//! the binary and the test suite.
//!
//! The real board is process-global and owned by exactly one
//! [`crate::digitizer::Digitizer`] for the lifetime of a scan; nothing else
//! in the engine touches it.

use std::collections::VecDeque;
use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use thiserror::Error;

pub type BoardResult<T> = Result<T, BoardError>;

/// Transport and configuration failures surfaced by the board. All of these
/// are fatal to the current scan; the adapter never retries.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BoardError {
    #[error("unable to open board system {system} board {board}")]
    NotFound { system: u32, board: u32 },
    #[error("wait timeout after {0:?}")]
    WaitTimeout(Duration),
    #[error("board overflowed on-board memory")]
    BufferOverflow,
    #[error("buffer not found in list of available buffers")]
    BufferNotReady,
    #[error("buffer not at the head of available buffers")]
    DmaInProgress,
    #[error("allocation of {0} bytes failed")]
    AllocFailed(usize),
    #[error("board rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coupling {
    Ac,
    Dc,
}

/// The operations the engine needs from the digitizer SDK. Sample codes are
/// 16-bit unsigned, two channels per buffer: the first half of `codes` is
/// channel A, the second half channel B.
pub trait Board: Send {
    /// Set the capture clock relative to the external 10 MHz reference.
    fn set_capture_clock(&mut self, bare_rate_hz: u32, decimation: u32) -> BoardResult<()>;

    fn set_input(
        &mut self,
        channel: Channel,
        coupling: Coupling,
        range_volts: f64,
        impedance_ohms: f64,
    ) -> BoardResult<()>;

    /// Toggle the 20 MHz bandwidth limit for one channel.
    fn set_bandwidth_limit(&mut self, channel: Channel, enabled: bool) -> BoardResult<()>;

    fn bits_per_sample(&self) -> u8;

    fn set_record_size(&mut self, samples_per_buffer: usize) -> BoardResult<()>;

    fn set_record_count(&mut self, buffers: usize) -> BoardResult<()>;

    /// Arm the board; capture begins on the first trigger.
    fn arm(&mut self) -> BoardResult<()>;

    /// Hand a buffer slot back to the board ring.
    fn post_buffer(&mut self, id: usize, len_samples: usize) -> BoardResult<()>;

    /// Block until the posted buffer `id` is filled, writing the raw sample
    /// codes into `codes`.
    fn wait_buffer(&mut self, id: usize, codes: &mut [u16], timeout: Duration) -> BoardResult<()>;

    fn force_trigger(&mut self) -> BoardResult<()>;

    /// Stop DMA. Safe to call after a completed acquisition.
    fn abort(&mut self) -> BoardResult<()>;
}

/// A pure tone injected by the synthetic board, expressed at the digitizer
/// IF (channel A carries the cosine, channel B the sine).
#[derive(Debug, Clone, Copy)]
pub struct SimTone {
    pub frequency_hz: f64,
    pub amplitude_volts: f64,
}

/// Deterministic in-memory digitizer. Generates IQ tones plus uniform noise
/// and honors the post/wait buffer ring protocol of the real SDK.
pub struct SimBoard {
    sample_rate_hz: f64,
    range_volts: f64,
    record_size: usize,
    armed: bool,
    posted: VecDeque<usize>,
    sample_clock: u64,
    tones: Vec<SimTone>,
    noise_volts: f64,
    rng: StdRng,
}

impl SimBoard {
    pub fn new(seed: u64) -> Self {
        Self {
            sample_rate_hz: 0.0,
            range_volts: 0.4,
            record_size: 0,
            armed: false,
            posted: VecDeque::new(),
            sample_clock: 0,
            tones: Vec::new(),
            noise_volts: 0.0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn with_tone(mut self, tone: SimTone) -> Self {
        self.tones.push(tone);
        self
    }

    pub fn with_noise(mut self, noise_volts: f64) -> Self {
        self.noise_volts = noise_volts;
        self
    }

    fn voltage_to_code(volts: f64, range: f64) -> u16 {
        let code = (volts / (2.0 * range) + 0.5) * 0xFFFF as f64;
        code.round().clamp(0.0, 0xFFFF as f64) as u16
    }
}

impl Board for SimBoard {
    fn set_capture_clock(&mut self, bare_rate_hz: u32, decimation: u32) -> BoardResult<()> {
        if decimation == 0 {
            return Err(BoardError::Rejected("zero decimation".into()));
        }
        self.sample_rate_hz = bare_rate_hz as f64 / decimation as f64;
        Ok(())
    }

    fn set_input(
        &mut self,
        _channel: Channel,
        _coupling: Coupling,
        range_volts: f64,
        _impedance_ohms: f64,
    ) -> BoardResult<()> {
        self.range_volts = range_volts;
        Ok(())
    }

    fn set_bandwidth_limit(&mut self, _channel: Channel, _enabled: bool) -> BoardResult<()> {
        Ok(())
    }

    fn bits_per_sample(&self) -> u8 {
        16
    }

    fn set_record_size(&mut self, samples_per_buffer: usize) -> BoardResult<()> {
        self.record_size = samples_per_buffer;
        Ok(())
    }

    fn set_record_count(&mut self, _buffers: usize) -> BoardResult<()> {
        Ok(())
    }

    fn arm(&mut self) -> BoardResult<()> {
        if self.record_size == 0 || self.sample_rate_hz == 0.0 {
            return Err(BoardError::Rejected("arm before clock/record setup".into()));
        }
        self.armed = true;
        Ok(())
    }

    fn post_buffer(&mut self, id: usize, len_samples: usize) -> BoardResult<()> {
        if len_samples != self.record_size {
            return Err(BoardError::Rejected(format!(
                "posted buffer holds {len_samples} samples, record size is {}",
                self.record_size
            )));
        }
        self.posted.push_back(id);
        Ok(())
    }

    fn wait_buffer(&mut self, id: usize, codes: &mut [u16], _timeout: Duration) -> BoardResult<()> {
        if !self.armed {
            return Err(BoardError::Rejected("wait on unarmed board".into()));
        }
        match self.posted.front() {
            Some(&head) if head == id => {
                self.posted.pop_front();
            }
            Some(_) => return Err(BoardError::DmaInProgress),
            None => return Err(BoardError::BufferNotReady),
        }

        let samples = codes.len() / 2;
        let (chan_a, chan_b) = codes.split_at_mut(samples);
        for i in 0..samples {
            let t = (self.sample_clock + i as u64) as f64 / self.sample_rate_hz;
            let mut va = 0.0;
            let mut vb = 0.0;
            for tone in &self.tones {
                let phase = 2.0 * std::f64::consts::PI * tone.frequency_hz * t;
                va += tone.amplitude_volts * phase.cos();
                vb += tone.amplitude_volts * phase.sin();
            }
            if self.noise_volts > 0.0 {
                va += self.noise_volts * (self.rng.gen::<f64>() - 0.5) * 2.0;
                vb += self.noise_volts * (self.rng.gen::<f64>() - 0.5) * 2.0;
            }
            chan_a[i] = Self::voltage_to_code(va, self.range_volts);
            chan_b[i] = Self::voltage_to_code(vb, self.range_volts);
        }
        self.sample_clock += samples as u64;
        Ok(())
    }

    fn force_trigger(&mut self) -> BoardResult<()> {
        Ok(())
    }

    fn abort(&mut self) -> BoardResult<()> {
        self.armed = false;
        self.posted.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured_board() -> SimBoard {
        let mut board = SimBoard::new(1);
        board.set_capture_clock(150_000_000, 15).unwrap();
        board.set_record_size(64).unwrap();
        board
    }

    #[test]
    fn wait_enforces_ring_order() {
        let mut board = configured_board();
        board.arm().unwrap();
        board.post_buffer(0, 64).unwrap();
        board.post_buffer(1, 64).unwrap();

        let mut codes = vec![0u16; 128];
        assert_eq!(
            board.wait_buffer(1, &mut codes, Duration::from_millis(1)),
            Err(BoardError::DmaInProgress)
        );
        board.wait_buffer(0, &mut codes, Duration::from_millis(1)).unwrap();
        board.wait_buffer(1, &mut codes, Duration::from_millis(1)).unwrap();
        assert_eq!(
            board.wait_buffer(0, &mut codes, Duration::from_millis(1)),
            Err(BoardError::BufferNotReady)
        );
    }

    #[test]
    fn silence_sits_at_midscale() {
        let mut board = configured_board();
        board.arm().unwrap();
        board.post_buffer(0, 64).unwrap();
        let mut codes = vec![0u16; 128];
        board.wait_buffer(0, &mut codes, Duration::from_millis(1)).unwrap();
        for &c in &codes {
            assert_eq!(c, 0x8000);
        }
    }
}
