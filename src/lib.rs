//! Axion-haloscope scan engine.
//!
//! A digitizer streams dual-channel IQ buffers which flow through an
//! FFT / baseline / SNR-rescale chain, get merged across LO tunings into a
//! single wideband combined spectrum, and feed a decision agent that tells
//! the scan runner when a tuning has integrated long enough.

pub mod args;
pub mod board;
pub mod decision;
pub mod digitizer;
pub mod fileio;
pub mod filter;
pub mod processing;
pub mod scan;
pub mod spectrum;

pub use board::{Board, BoardError, Channel, SimBoard};
pub use decision::{Decision, DecisionAgent};
pub use digitizer::{AcquisitionParams, ConfigError, Digitizer, RawBuffer, SampleClock};
pub use processing::{DataProcessor, ProcessingError};
pub use scan::{LocalOscillator, ScanConfig, ScanError, ScanRunner};
pub use spectrum::{CombinedSpectrum, Rescaled, Spectrum};
