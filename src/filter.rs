//! Chebyshev Type II low-pass used for baseline estimation, implemented as a
//! cascade of biquad sections and applied forward-then-reverse so the
//! baseline keeps zero phase (features stay at their true frequencies).

use num_complex::Complex;
use std::f64::consts::PI;

/// One second-order section. Coefficients only; the per-call state lives on
/// the stack so a shared filter can run from several threads.
#[derive(Debug, Clone, Copy)]
struct Biquad {
    b: [f64; 3],
    a: [f64; 2],
}

impl Biquad {
    fn dc_gain(&self) -> f64 {
        (self.b[0] + self.b[1] + self.b[2]) / (1.0 + self.a[0] + self.a[1])
    }

    /// Direct Form II Transposed, run over the whole buffer in place. The
    /// state is seeded for a step of the first sample's amplitude, so a
    /// constant input passes through exactly.
    fn apply_in_place(&self, values: &mut [f64]) {
        let Some(&first) = values.first() else {
            return;
        };
        let y0 = self.dc_gain() * first;
        let mut s1 = self.b[2] * first - self.a[1] * y0;
        let mut s0 = self.b[1] * first - self.a[0] * y0 + s1;
        for x in values.iter_mut() {
            let input = *x;
            let output = self.b[0] * input + s0;
            s0 = self.b[1] * input - self.a[0] * output + s1;
            s1 = self.b[2] * input - self.a[1] * output;
            *x = output;
        }
    }

    fn is_stable(&self) -> bool {
        self.a[1].abs() < 1.0 && self.a[0].abs() < 1.0 + self.a[1]
    }
}

/// Zero-phase Chebyshev-II low-pass. `cutoff_hz` is the stopband edge; each
/// single pass is attenuated by at least `stopband_db` beyond it, and the
/// two-pass application doubles that in dB.
#[derive(Debug, Clone)]
pub struct BaselineFilter {
    sections: Vec<Biquad>,
    order: usize,
    cutoff_hz: f64,
    sample_rate_hz: f64,
    stopband_db: f64,
}

impl BaselineFilter {
    pub fn chebyshev2(
        order: usize,
        stopband_db: f64,
        cutoff_hz: f64,
        sample_rate_hz: f64,
    ) -> Self {
        assert!(order > 0 && order <= 20, "order must be 1-20");
        assert!(stopband_db > 0.0, "stopband attenuation must be positive");
        assert!(
            cutoff_hz > 0.0 && cutoff_hz < sample_rate_hz / 2.0,
            "cutoff must sit below Nyquist"
        );

        let epsilon = 1.0 / (10f64.powf(stopband_db / 10.0) - 1.0).sqrt();
        let a = ((1.0 / epsilon) + (1.0 / (epsilon * epsilon) + 1.0).sqrt()).ln() / order as f64;
        let warped = 2.0 * sample_rate_hz * (PI * cutoff_hz / sample_rate_hz).tan();
        let k = 2.0 * sample_rate_hz;
        let k2 = k * k;

        let mut sections = Vec::with_capacity((order + 1) / 2);
        for i in 0..order / 2 {
            let theta = PI * (2 * i + 1) as f64 / (2 * order) as f64;
            // Chebyshev-I prototype pole, inverted for the type-II response
            // and scaled to the stopband edge.
            let p1 = Complex::new(-a.sinh() * theta.sin(), a.cosh() * theta.cos());
            let pole = warped * p1.inv();
            let zero_im = warped / theta.sin();

            let pm2 = pole.norm_sqr();
            let zm2 = zero_im * zero_im;
            let a0 = k2 - 2.0 * pole.re * k + pm2;
            let scale = pm2 / zm2;
            sections.push(Biquad {
                b: [
                    scale * (k2 + zm2) / a0,
                    scale * 2.0 * (zm2 - k2) / a0,
                    scale * (k2 + zm2) / a0,
                ],
                a: [
                    2.0 * (pm2 - k2) / a0,
                    (k2 + 2.0 * pole.re * k + pm2) / a0,
                ],
            });
        }
        if order % 2 == 1 {
            // Middle pole is real; it carries no finite zero.
            let pole = -warped / a.sinh();
            let alpha = k - pole;
            sections.push(Biquad {
                b: [-pole / alpha, -pole / alpha, 0.0],
                a: [-(k + pole) / alpha, 0.0],
            });
        }

        Self {
            sections,
            order,
            cutoff_hz,
            sample_rate_hz,
            stopband_db,
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn cutoff_hz(&self) -> f64 {
        self.cutoff_hz
    }

    pub fn stopband_db(&self) -> f64 {
        self.stopband_db
    }

    pub fn is_stable(&self) -> bool {
        self.sections.iter().all(Biquad::is_stable)
    }

    /// Single forward pass through the cascade.
    pub fn filter(&self, input: &[f64]) -> Vec<f64> {
        let mut values = input.to_vec();
        for section in &self.sections {
            section.apply_in_place(&mut values);
        }
        values
    }

    /// Zero-phase two-pass application: forward, reverse, forward, reverse.
    pub fn filtfilt(&self, input: &[f64]) -> Vec<f64> {
        let mut values = self.filter(input);
        values.reverse();
        let mut values = self.filter(&values);
        values.reverse();
        values
    }

    /// Complex response of one pass at `freq_hz`.
    pub fn frequency_response(&self, freq_hz: f64) -> Complex<f64> {
        let omega = 2.0 * PI * freq_hz / self.sample_rate_hz;
        let z_inv = Complex::new(omega.cos(), -omega.sin());
        let z_inv2 = z_inv * z_inv;
        let mut response = Complex::new(1.0, 0.0);
        for s in &self.sections {
            let num = s.b[0] + s.b[1] * z_inv + s.b[2] * z_inv2;
            let den = 1.0 + s.a[0] * z_inv + s.a[1] * z_inv2;
            response *= num / den;
        }
        response
    }

    /// Sampled single-pass response: (frequency, magnitude in dB, phase in
    /// radians), `points` samples from DC to Nyquist.
    pub fn response(&self, points: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let nyquist = self.sample_rate_hz / 2.0;
        let mut freqs = Vec::with_capacity(points);
        let mut mags = Vec::with_capacity(points);
        let mut phases = Vec::with_capacity(points);
        for i in 0..points {
            let f = nyquist * i as f64 / (points.max(2) - 1) as f64;
            let h = self.frequency_response(f);
            freqs.push(f);
            mags.push(20.0 * h.norm().log10());
            phases.push(h.im.atan2(h.re));
        }
        (freqs, mags, phases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nominal() -> BaselineFilter {
        BaselineFilter::chebyshev2(6, 40.0, 0.02, 1.0)
    }

    #[test]
    fn cascade_is_stable() {
        assert!(nominal().is_stable());
        assert!(BaselineFilter::chebyshev2(5, 60.0, 0.1, 1.0).is_stable());
    }

    #[test]
    fn unity_dc_gain() {
        let filter = nominal();
        let dc = filter.frequency_response(0.0).norm();
        assert!((dc - 1.0).abs() < 1e-9, "dc gain {dc}");
    }

    #[test]
    fn stopband_is_attenuated() {
        let filter = nominal();
        // Sample the stopband well past the edge.
        for f in [0.05, 0.1, 0.2, 0.4] {
            let mag_db = 20.0 * filter.frequency_response(f).norm().log10();
            assert!(mag_db <= -39.0, "only {mag_db} dB at {f}");
        }
    }

    #[test]
    fn constant_input_passes_exactly() {
        let filter = nominal();
        let input = vec![3.25; 256];
        let output = filter.filtfilt(&input);
        for y in output {
            assert!((y - 3.25).abs() < 1e-9);
        }
    }

    #[test]
    fn zero_phase_kills_fast_ripple_keeps_drift() {
        let filter = nominal();
        let n = 1024;
        let input: Vec<f64> = (0..n)
            .map(|i| {
                let x = i as f64;
                // Slow drift across the buffer plus a fast ripple.
                10.0 + 3.0 * (2.0 * PI * x / n as f64).sin() + (2.0 * PI * 0.25 * x).sin()
            })
            .collect();
        let output = filter.filtfilt(&input);
        for i in n / 4..3 * n / 4 {
            let x = i as f64;
            let drift = 10.0 + 3.0 * (2.0 * PI * x / n as f64).sin();
            assert!(
                (output[i] - drift).abs() < 0.1,
                "bin {i}: {} vs drift {drift}",
                output[i]
            );
        }
    }

    #[test]
    fn response_covers_dc_to_nyquist() {
        let (freqs, mags, phases) = nominal().response(64);
        assert_eq!(freqs.len(), 64);
        assert_eq!(mags.len(), 64);
        assert_eq!(phases.len(), 64);
        assert_eq!(freqs[0], 0.0);
        assert!((freqs[63] - 0.5).abs() < 1e-12);
        assert!(mags[0].abs() < 0.1);
    }
}
