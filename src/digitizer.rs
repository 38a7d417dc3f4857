//! Digitizer adapter: translates the requested sample rate / sample count /
//! buffer count into a legal hardware configuration, runs the DMA loop, and
//! emits voltage-domain complex buffers into the pipeline.

use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use num_complex::Complex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::board::{Board, Channel, Coupling};
use crate::scan::SyncFlags;

/// Bare sample rates the board can generate from the 10 MHz reference.
pub const BARE_RATE_MIN_HZ: u32 = 150_000_000;
pub const BARE_RATE_MAX_HZ: u32 = 180_000_000;
pub const BARE_RATE_STEP_HZ: u32 = 1_000_000;
/// Legal decimation factors are 1..=10_000.
pub const MAX_DECIMATION: u32 = 10_000;

/// Number of in-flight DMA buffers in the ring.
pub const DMA_BUFFER_COUNT: usize = 4;

const CHANNEL_COUNT: usize = 2;
const TARGET_BYTES_PER_BUFFER: f64 = 4e6;

/// Configuration mistakes caught before acquisition starts. These fail the
/// whole scan.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid channel selection '{0}', select 'a' or 'b'")]
    InvalidChannel(char),
    #[error("invalid coupling selection '{0}', select 'AC' or 'DC'")]
    InvalidCoupling(String),
    #[error("samples per buffer must be even, got {0}")]
    OddSamplesPerBuffer(usize),
    #[error("samples per acquisition must be nonzero")]
    ZeroSamples,
    #[error("digitizer has not been configured")]
    NotConfigured,
}

pub fn channel_from_letter(letter: char) -> Result<Channel, ConfigError> {
    match letter.to_ascii_uppercase() {
        'A' => Ok(Channel::A),
        'B' => Ok(Channel::B),
        other => Err(ConfigError::InvalidChannel(other)),
    }
}

pub fn coupling_from_str(name: &str) -> Result<Coupling, ConfigError> {
    match name.to_ascii_uppercase().as_str() {
        "AC" => Ok(Coupling::Ac),
        "DC" => Ok(Coupling::Dc),
        other => Err(ConfigError::InvalidCoupling(other.to_string())),
    }
}

/// Snap a requested full-scale range to the nearest legal value at or above
/// it: ±0.2, ±0.4, ±0.8 or ±2 V.
pub fn snap_input_range(range_volts: f64) -> f64 {
    if range_volts <= 0.2 {
        0.2
    } else if range_volts <= 0.4 {
        0.4
    } else if range_volts <= 0.8 {
        0.8
    } else {
        2.0
    }
}

/// Snap a requested input impedance to 50 Ω or 1 MΩ.
pub fn snap_input_impedance(impedance_ohms: f64) -> f64 {
    if impedance_ohms <= 50.0 {
        50.0
    } else {
        1e6
    }
}

/// A legal (bare rate, decimation) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleClock {
    pub bare_rate_hz: u32,
    pub decimation: u32,
}

impl SampleClock {
    /// Pick the legal pair whose effective rate is closest to the request.
    /// Ties go to the lowest bare rate. The request is clamped to
    /// [0, 180 MHz].
    pub fn closest_to(requested_hz: f64) -> Self {
        let requested = requested_hz.abs().min(BARE_RATE_MAX_HZ as f64);

        let mut best = SampleClock {
            bare_rate_hz: BARE_RATE_MIN_HZ,
            decimation: 1,
        };
        let mut best_error = f64::MAX;
        let mut bare = BARE_RATE_MIN_HZ;
        while bare <= BARE_RATE_MAX_HZ {
            let ratio = bare as f64 / requested;
            let decimation = if ratio.is_finite() {
                ratio.round().clamp(1.0, MAX_DECIMATION as f64) as u32
            } else {
                MAX_DECIMATION
            };
            let candidate = SampleClock {
                bare_rate_hz: bare,
                decimation,
            };
            let error = (candidate.realized_hz() - requested).abs();
            if error < best_error {
                best_error = error;
                best = candidate;
                if error == 0.0 {
                    break;
                }
            }
            bare += BARE_RATE_STEP_HZ;
        }
        best
    }

    pub fn realized_hz(&self) -> f64 {
        self.bare_rate_hz as f64 / self.decimation as f64
    }
}

/// Choose a buffer count near the ~4 MB/buffer sweet spot, then walk outward
/// by the smallest step until it divides the sample count exactly. Always
/// returns at least 1, even for a zero sample count (which the configuration
/// path rejects separately).
pub fn suggest_buffer_count(bytes_per_sample: usize, samples: usize) -> usize {
    if samples == 0 {
        return 1;
    }
    let target =
        (bytes_per_sample * samples * CHANNEL_COUNT) as f64 / TARGET_BYTES_PER_BUFFER;
    let mut buffers = (target.round() as usize).max(1);
    if buffers > samples {
        buffers = samples;
    }
    if samples % buffers == 0 {
        return buffers;
    }
    for spread in 1..=samples {
        if samples % (buffers + spread) == 0 {
            return buffers + spread;
        }
        if buffers > spread && samples % (buffers - spread) == 0 {
            return buffers - spread;
        }
    }
    1
}

/// Convert one 16-bit sample code to volts. Code 0x0000 is negative full
/// scale, 0x8000 is ~0 V, 0xFFFF is positive full scale.
#[inline]
pub fn code_to_voltage(code: u16, range_volts: f64) -> f64 {
    (code as f64 / 0xFFFF as f64) * 2.0 * range_volts - range_volts
}

/// Convert a raw code buffer (channel A in the first half, channel B in the
/// second) into complex voltages, negating every odd-indexed sample to shift
/// the DFT origin by half the spectrum.
pub fn codes_to_voltages(codes: &[u16], range_volts: f64) -> Vec<Complex<f64>> {
    let samples = codes.len() / 2;
    let (chan_a, chan_b) = codes.split_at(samples);
    let mut out = Vec::with_capacity(samples);
    for i in 0..samples {
        let sign = if i % 2 == 1 { -1.0 } else { 1.0 };
        out.push(Complex::new(
            sign * code_to_voltage(chan_a[i], range_volts),
            sign * code_to_voltage(chan_b[i], range_volts),
        ));
    }
    out
}

/// Hardware layout resolved from a configuration request.
#[derive(Debug, Clone)]
pub struct AcquisitionParams {
    pub sample_rate_hz: f64,
    pub samples_per_buffer: usize,
    pub buffers_per_acquisition: usize,
    pub input_range_volts: f64,
    pub input_impedance_ohms: f64,
    pub bytes_per_sample: usize,
    pub bytes_per_buffer: usize,
}

impl AcquisitionParams {
    /// Nominal wall time to fill one buffer.
    pub fn buffer_duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples_per_buffer as f64 / self.sample_rate_hz)
    }
}

/// One acquisition-ordered buffer of voltage-domain IQ samples. Owned by the
/// acquisition stage until enqueued; ownership moves to the consumer on pop.
#[derive(Debug, Clone)]
pub struct RawBuffer {
    pub index: usize,
    pub samples: Vec<Complex<f64>>,
}

#[derive(Debug, Clone, Copy)]
pub struct AcquisitionStats {
    pub buffers_completed: usize,
    pub bytes_transferred: u64,
    pub elapsed: Duration,
}

/// Owns the board handle for the lifetime of a scan.
pub struct Digitizer<B: Board> {
    board: B,
    params: Option<AcquisitionParams>,
}

impl<B: Board> Digitizer<B> {
    pub fn new(board: B) -> Self {
        Self {
            board,
            params: None,
        }
    }

    pub fn params(&self) -> Result<&AcquisitionParams, ConfigError> {
        self.params.as_ref().ok_or(ConfigError::NotConfigured)
    }

    /// Resolve a request into legal hardware parameters and push them to the
    /// board: capture clock, both channel inputs (DC coupled, bandwidth
    /// limited), record size and count.
    pub fn configure(
        &mut self,
        requested_rate_hz: f64,
        samples_per_acquisition: usize,
        buffers_hint: usize,
        input_range_volts: f64,
        input_impedance_ohms: f64,
    ) -> Result<&AcquisitionParams, crate::scan::ScanError> {
        if samples_per_acquisition == 0 {
            return Err(ConfigError::ZeroSamples.into());
        }
        let bytes_per_sample = (self.board.bits_per_sample() as usize + 7) / 8;
        let buffers = if buffers_hint == 0 {
            suggest_buffer_count(bytes_per_sample, samples_per_acquisition)
        } else {
            buffers_hint
        };
        let samples_per_buffer = samples_per_acquisition / buffers;
        if samples_per_buffer == 0 {
            return Err(ConfigError::ZeroSamples.into());
        }
        // The DC-centering sign alternation assumes an even record length.
        if samples_per_buffer % 2 != 0 {
            return Err(ConfigError::OddSamplesPerBuffer(samples_per_buffer).into());
        }

        let clock = SampleClock::closest_to(requested_rate_hz);
        let realized = clock.realized_hz();
        if (realized - requested_rate_hz).abs() > f64::EPSILON {
            info!(
                requested_mhz = requested_rate_hz / 1e6,
                realized_mhz = realized / 1e6,
                "sample rate adjusted"
            );
        }
        self.board
            .set_capture_clock(clock.bare_rate_hz, clock.decimation)?;

        let range = snap_input_range(input_range_volts);
        let impedance = snap_input_impedance(input_impedance_ohms);
        for channel in [Channel::A, Channel::B] {
            self.board
                .set_input(channel, Coupling::Dc, range, impedance)?;
            self.board.set_bandwidth_limit(channel, true)?;
        }
        self.board.set_record_size(samples_per_buffer)?;
        self.board.set_record_count(buffers)?;

        let params = AcquisitionParams {
            sample_rate_hz: realized,
            samples_per_buffer,
            buffers_per_acquisition: buffers,
            input_range_volts: range,
            input_impedance_ohms: impedance,
            bytes_per_sample,
            bytes_per_buffer: bytes_per_sample * samples_per_buffer * CHANNEL_COUNT,
        };
        debug!(
            samples_per_buffer = params.samples_per_buffer,
            buffers = params.buffers_per_acquisition,
            mb_per_buffer = params.bytes_per_buffer as f64 / 1e6,
            "acquisition layout"
        );
        self.params = Some(params);
        Ok(self.params.as_ref().unwrap())
    }

    /// Acquisition stage: posts the DMA ring, arms the board, and streams
    /// voltage buffers into the raw queue (and clones into the save queue)
    /// until the pause flag is raised, the horizon is reached, or a
    /// downstream stage disconnects. Wait failures are fatal.
    pub fn run_acquisition(
        &mut self,
        raw_tx: Sender<RawBuffer>,
        save_tx: Sender<RawBuffer>,
        flags: &SyncFlags,
        max_buffers: usize,
    ) -> Result<AcquisitionStats, crate::scan::ScanError> {
        let params = self.params.clone().ok_or(ConfigError::NotConfigured)?;
        let samples = params.samples_per_buffer;
        let timeout = 10 * params.buffer_duration();

        let mut rings: Vec<Vec<u16>> = (0..DMA_BUFFER_COUNT)
            .map(|_| vec![0u16; samples * CHANNEL_COUNT])
            .collect();
        for id in 0..DMA_BUFFER_COUNT {
            self.board.post_buffer(id, samples)?;
        }
        self.board.arm()?;

        let started = Instant::now();
        let mut completed = 0usize;
        let mut bytes_transferred = 0u64;
        let result = loop {
            if completed >= max_buffers {
                break Ok(());
            }
            if flags.pause_requested() {
                debug!("received pause signal");
                break Ok(());
            }
            self.board.force_trigger()?;

            let id = completed % DMA_BUFFER_COUNT;
            if let Err(e) = self.board.wait_buffer(id, &mut rings[id], timeout) {
                warn!(error = %e, "buffer wait failed");
                break Err(e);
            }

            let buffer = RawBuffer {
                index: completed,
                samples: codes_to_voltages(&rings[id], params.input_range_volts),
            };
            // Save gets its own copy; the processing stage takes ownership.
            if save_tx.send(buffer.clone()).is_err() || raw_tx.send(buffer).is_err() {
                debug!("downstream queue disconnected");
                break Ok(());
            }
            self.board.post_buffer(id, samples)?;
            completed += 1;
            bytes_transferred += params.bytes_per_buffer as u64;
        };

        flags.request_pause();
        flags.mark_complete();
        if let Err(e) = self.board.abort() {
            warn!(error = %e, "abort after acquisition failed");
        }
        drop(rings);

        let stats = AcquisitionStats {
            buffers_completed: completed,
            bytes_transferred,
            elapsed: started.elapsed(),
        };
        info!(
            buffers = stats.buffers_completed,
            mb = stats.bytes_transferred as f64 / 1e6,
            secs = stats.elapsed.as_secs_f64(),
            "acquisition stage done"
        );
        match result {
            Ok(()) => Ok(stats),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_rate_is_exact() {
        let clock = SampleClock::closest_to(10e6);
        assert_eq!(clock.bare_rate_hz, 150_000_000);
        assert_eq!(clock.decimation, 15);
        assert_eq!(clock.realized_hz(), 10e6);
    }

    #[test]
    fn nonstandard_rate_is_close() {
        let requested = 9.57e6;
        let clock = SampleClock::closest_to(requested);
        let relative = (clock.realized_hz() - requested).abs() / requested;
        assert!(relative < 1e-3, "relative error {relative}");
    }

    #[test]
    fn chosen_clock_is_legal_and_optimal() {
        for requested in [0.0, 1.0, 1e3, 9.57e6, 10e6, 33.1e6, 150e6, 179.5e6, 2e8] {
            let clock = SampleClock::closest_to(requested);
            assert!(clock.bare_rate_hz >= BARE_RATE_MIN_HZ);
            assert!(clock.bare_rate_hz <= BARE_RATE_MAX_HZ);
            assert_eq!(clock.bare_rate_hz % BARE_RATE_STEP_HZ, 0);
            assert!(clock.decimation >= 1 && clock.decimation <= MAX_DECIMATION);

            let clamped = requested.abs().min(BARE_RATE_MAX_HZ as f64);
            let chosen_error = (clock.realized_hz() - clamped).abs();
            let mut bare = BARE_RATE_MIN_HZ;
            while bare <= BARE_RATE_MAX_HZ {
                for decimation in 1..=MAX_DECIMATION {
                    let realized = bare as f64 / decimation as f64;
                    assert!(
                        (realized - clamped).abs() >= chosen_error - 1e-9,
                        "({bare}, {decimation}) beats chosen pair for request {requested}"
                    );
                }
                bare += BARE_RATE_STEP_HZ;
            }
        }
    }

    #[test]
    fn buffer_count_divides_exactly() {
        for samples in [1usize, 7, 4096, 1_000_000, 7_500_000, 7_499_999] {
            let buffers = suggest_buffer_count(2, samples);
            assert!(buffers >= 1);
            assert_eq!(samples % buffers, 0, "samples {samples} buffers {buffers}");
        }
        // Degenerate input still yields a usable count instead of dividing
        // by zero; the configuration path rejects it separately.
        assert_eq!(suggest_buffer_count(2, 0), 1);
    }

    #[test]
    fn suggested_buffers_hit_dma_sweet_spot() {
        let samples = 7_500_000usize;
        let buffers = suggest_buffer_count(2, samples);
        assert_eq!(samples % buffers, 0);
        let bytes_per_buffer = 2 * samples * 2 / buffers;
        assert!(
            (1_000_000..=16_000_000).contains(&bytes_per_buffer),
            "bytes per buffer {bytes_per_buffer}"
        );
    }

    #[test]
    fn voltage_conversion_stays_in_range() {
        for range in [0.2, 0.4, 0.8, 2.0] {
            for code in [0u16, 1, 0x7FFF, 0x8000, 0xFFFE, 0xFFFF] {
                let v = code_to_voltage(code, range);
                assert!(v >= -range && v <= range, "code {code:#x} range {range}");
            }
            let lsb = 2.0 * range / 0xFFFF as f64;
            assert!(code_to_voltage(0x8000, range).abs() <= lsb);
            assert_eq!(code_to_voltage(0, range), -range);
            assert_eq!(code_to_voltage(0xFFFF, range), range);
        }
    }

    #[test]
    fn channel_and_coupling_parsing() {
        assert_eq!(channel_from_letter('a').unwrap(), Channel::A);
        assert_eq!(channel_from_letter('B').unwrap(), Channel::B);
        assert_eq!(
            channel_from_letter('c').unwrap_err(),
            ConfigError::InvalidChannel('C')
        );
        assert_eq!(coupling_from_str("dc").unwrap(), Coupling::Dc);
        assert_eq!(coupling_from_str("AC").unwrap(), Coupling::Ac);
        assert!(matches!(
            coupling_from_str("rf"),
            Err(ConfigError::InvalidCoupling(_))
        ));
    }

    #[test]
    fn input_snapping_picks_legal_values() {
        assert_eq!(snap_input_range(0.1), 0.2);
        assert_eq!(snap_input_range(0.4), 0.4);
        assert_eq!(snap_input_range(0.5), 0.8);
        assert_eq!(snap_input_range(1.9), 2.0);
        assert_eq!(snap_input_impedance(50.0), 50.0);
        assert_eq!(snap_input_impedance(75.0), 1e6);
    }

    #[test]
    fn alternation_flips_odd_samples() {
        // Constant positive voltage on both channels.
        let codes = vec![0xFFFFu16; 8];
        let buffer = codes_to_voltages(&codes, 0.4);
        assert_eq!(buffer.len(), 4);
        for (i, sample) in buffer.iter().enumerate() {
            let expected = if i % 2 == 1 { -0.4 } else { 0.4 };
            assert!((sample.re - expected).abs() < 1e-12);
            assert!((sample.im - expected).abs() < 1e-12);
        }
    }
}
