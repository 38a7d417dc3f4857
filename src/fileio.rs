//! Everything the pipeline persists: spectrum CSVs, combined-spectrum CSVs,
//! raw DMA buffer dumps, and the timestamped run directory.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byte_slice_cast::AsByteSlice;
use chrono::Local;
use num_complex::Complex;

use crate::digitizer::RawBuffer;
use crate::scan::ScanError;
use crate::spectrum::{CombinedSpectrum, Spectrum};

/// Create (and return) a run directory named `YYYY-MM-DD_HH-MM-SS`.
pub fn create_run_directory(root: &Path) -> Result<PathBuf, ScanError> {
    let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let dir = root.join(stamp);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn write_row(writer: &mut csv::Writer<File>, values: &[f64]) -> Result<(), ScanError> {
    writer.write_record(values.iter().map(|v| v.to_string()))?;
    Ok(())
}

/// One comma-separated line per file row: line 1 powers, line 2 frequency
/// axis.
pub fn save_spectrum(spectrum: &Spectrum, path: &Path) -> Result<(), ScanError> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(path)?;
    write_row(&mut writer, &spectrum.powers)?;
    write_row(&mut writer, &spectrum.freq_axis)?;
    writer.flush()?;
    Ok(())
}

pub fn read_spectrum(path: &Path, true_center_freq: f64) -> Result<Spectrum, ScanError> {
    let rows = read_csv_rows(path, 2)?;
    let powers = rows.first().cloned().unwrap_or_default();
    let freq_axis = rows.get(1).cloned().unwrap_or_default();
    Ok(Spectrum::new(powers, freq_axis, true_center_freq))
}

/// Lines 1-3: powers, frequency axis, combined sigma.
pub fn save_combined_spectrum(
    combined: &CombinedSpectrum,
    path: &Path,
) -> Result<(), ScanError> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(path)?;
    write_row(&mut writer, &combined.powers)?;
    write_row(&mut writer, &combined.freq_axis)?;
    write_row(&mut writer, &combined.sigma_combined)?;
    writer.flush()?;
    Ok(())
}

/// First line is the shared frequency axis, then one powers line per
/// spectrum.
pub fn save_spectra_log(spectra: &[Spectrum], path: &Path) -> Result<(), ScanError> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(path)?;
    if let Some(first) = spectra.first() {
        write_row(&mut writer, &first.freq_axis)?;
    }
    for spectrum in spectra {
        write_row(&mut writer, &spectrum.powers)?;
    }
    writer.flush()?;
    Ok(())
}

/// One comma-separated line.
pub fn save_vector(values: &[f64], path: &Path) -> Result<(), ScanError> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(path)?;
    write_row(&mut writer, values)?;
    writer.flush()?;
    Ok(())
}

pub fn read_vector(path: &Path) -> Result<Vec<f64>, ScanError> {
    let rows = read_csv_rows(path, 1)?;
    Ok(rows.into_iter().next().unwrap_or_default())
}

fn read_csv_rows(path: &Path, max_rows: usize) -> Result<Vec<Vec<f64>>, ScanError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row: Result<Vec<f64>, _> = record.iter().map(str::parse::<f64>).collect();
        rows.push(row.map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
        })?);
        if rows.len() >= max_rows {
            break;
        }
    }
    Ok(rows)
}

/// The SNR calibration ships as two single-line CSVs: one for the powers,
/// one for the frequency axis. Empty or mismatched files are rejected here
/// rather than poisoning the processing chain later.
pub fn load_snr(powers_path: &Path, freqs_path: &Path) -> Result<Spectrum, ScanError> {
    let powers = read_vector(powers_path)?;
    let freq_axis = read_vector(freqs_path)?;
    if powers.is_empty() || freq_axis.is_empty() {
        let which = if powers.is_empty() {
            powers_path
        } else {
            freqs_path
        };
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("SNR calibration {} is empty", which.display()),
        )
        .into());
    }
    if powers.len() != freq_axis.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "SNR calibration holds {} powers but {} frequencies",
                powers.len(),
                freq_axis.len()
            ),
        )
        .into());
    }
    let center = (freq_axis[0] + freq_axis[freq_axis.len() - 1]) / 2.0;
    Ok(Spectrum::new(powers, freq_axis, center))
}

/// Raw DMA dump: contiguous (re, im) f64 pairs, one per sample, named
/// `Buffer<N>.bin` by the saving stage.
pub fn save_raw_buffer(buffer: &RawBuffer, path: &Path) -> Result<(), ScanError> {
    let mut interleaved = Vec::with_capacity(buffer.samples.len() * 2);
    for sample in &buffer.samples {
        interleaved.push(sample.re);
        interleaved.push(sample.im);
    }
    let mut file = BufWriter::new(File::create(path)?);
    file.write_all(interleaved.as_byte_slice())?;
    file.flush()?;
    Ok(())
}

pub fn read_raw_buffer(path: &Path, index: usize) -> Result<RawBuffer, ScanError> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    let samples = bytes
        .chunks_exact(16)
        .map(|pair| {
            Complex::new(
                f64::from_ne_bytes(pair[0..8].try_into().unwrap()),
                f64::from_ne_bytes(pair[8..16].try_into().unwrap()),
            )
        })
        .collect();
    Ok(RawBuffer { index, samples })
}
