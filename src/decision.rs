//! Decision agent: scores the active exclusion line against a target
//! coupling curve and tells the scan runner whether to keep integrating,
//! step the LO, or stop. Pure given its inputs; it never touches queues or
//! hardware.

use tracing::debug;

use crate::spectrum::{closest_index, Spectrum};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Keep integrating at the current tuning.
    Continue,
    /// Local exclusion achieved, move to the next tuning.
    Step,
    /// The whole grid is exclused, drain the pipeline.
    Stop,
}

pub struct DecisionAgent {
    /// SNR-derived coupling-ratio curve on its own (file) grid.
    target_ratio: Spectrum,
    target_coupling: f64,
    pub threshold: f64,
    /// Spectra required at a tuning before stepping is considered.
    pub min_shots: usize,
    /// Half-width of the band around the current LO that must be exclused
    /// before stepping.
    pub window_half_width_hz: f64,

    grid: Vec<f64>,
    in_progress_targets: Vec<f64>,
    points: Vec<f64>,
}

impl DecisionAgent {
    pub fn new(target_ratio: Spectrum, target_coupling: f64) -> Self {
        Self {
            target_ratio,
            target_coupling,
            threshold: 0.0,
            min_shots: 0,
            window_half_width_hz: f64::INFINITY,
            grid: Vec::new(),
            in_progress_targets: Vec::new(),
            points: Vec::new(),
        }
    }

    pub fn targets(&self) -> &[f64] {
        &self.in_progress_targets
    }

    /// Per-bin clamped margins from the last decision.
    pub fn points(&self) -> &[f64] {
        &self.points
    }

    /// Evaluate the target curve on a new active grid. The minimum
    /// SNR-normalized excess required for exclusion at each frequency is the
    /// ratio curve over target coupling squared, sampled at the nearest
    /// calibration bin.
    pub fn set_targets(&mut self, freq_axis: &[f64]) {
        if self.grid == freq_axis {
            return;
        }
        self.grid = freq_axis.to_vec();
        let g2 = self.target_coupling * self.target_coupling;
        self.in_progress_targets = freq_axis
            .iter()
            .map(|&f| {
                let ratio = if self.target_ratio.is_empty() {
                    0.0
                } else {
                    self.target_ratio.powers[closest_index(&self.target_ratio.freq_axis, f)] / g2
                };
                self.threshold - ratio
            })
            .collect();
        self.points = vec![0.0; self.grid.len()];
        debug!(bins = self.grid.len(), "targets recomputed for new grid");
    }

    /// Scalar proxy for the total margin above target over the whole grid.
    pub fn check_score(&self, active_exclusion_line: &[f64]) -> f64 {
        active_exclusion_line
            .iter()
            .zip(&self.in_progress_targets)
            .map(|(line, target)| (line - target).max(0.0))
            .sum()
    }

    /// Refresh the per-bin cumulative margins.
    pub fn set_points(&mut self, active_exclusion_line: &[f64]) {
        for (point, (line, target)) in self
            .points
            .iter_mut()
            .zip(active_exclusion_line.iter().zip(&self.in_progress_targets))
        {
            *point = (line - target).max(0.0);
        }
    }

    /// Decide the next scan action from the current exclusion line. The
    /// global check runs before the local one so a fully exclused grid stops
    /// the scan rather than stepping forever.
    pub fn get_decision(
        &mut self,
        active_exclusion_line: &[f64],
        spectra_at_tuning: usize,
        lo_freq_hz: f64,
    ) -> Decision {
        if spectra_at_tuning < self.min_shots {
            return Decision::Continue;
        }
        if self.in_progress_targets.is_empty()
            || active_exclusion_line.len() != self.in_progress_targets.len()
        {
            return Decision::Continue;
        }
        self.set_points(active_exclusion_line);

        let excluded = |i: usize| active_exclusion_line[i] >= self.in_progress_targets[i];
        if (0..self.grid.len()).all(excluded) {
            return Decision::Stop;
        }
        let window_done = (0..self.grid.len())
            .filter(|&i| (self.grid[i] - lo_freq_hz).abs() <= self.window_half_width_hz)
            .all(excluded);
        if window_done {
            return Decision::Step;
        }
        Decision::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_on_grid(n: usize) -> (DecisionAgent, Vec<f64>) {
        let axis: Vec<f64> = (0..n).map(|i| 1e9 + i as f64 * 1e3).collect();
        let ratio = Spectrum::new(vec![1.0; n], axis.clone(), 1e9);
        let mut agent = DecisionAgent::new(ratio, 1.0);
        agent.threshold = 2.0;
        agent.set_targets(&axis);
        (agent, axis)
    }

    #[test]
    fn targets_are_threshold_minus_ratio() {
        let (agent, _) = agent_on_grid(8);
        for t in agent.targets() {
            assert!((t - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn min_shots_gates_any_step() {
        let (mut agent, axis) = agent_on_grid(8);
        agent.min_shots = 10;
        agent.window_half_width_hz = 2e3;
        // The local window clears its targets but one far bin does not, so
        // the verdict after the gate is a step, not a stop.
        let mut line = vec![100.0; 8];
        line[7] = 0.0;
        let lo = axis[2];
        for shots in 0..10 {
            assert_eq!(agent.get_decision(&line, shots, lo), Decision::Continue);
        }
        assert_eq!(agent.get_decision(&line, 10, lo), Decision::Step);

        // Once the whole grid clears, the scan stops instead.
        line[7] = 100.0;
        assert_eq!(agent.get_decision(&line, 10, lo), Decision::Stop);
    }

    #[test]
    fn local_window_steps_before_global_completion() {
        let (mut agent, axis) = agent_on_grid(16);
        agent.window_half_width_hz = 2.5e3;
        // Exclused only near the LO at the center of the grid.
        let lo = axis[8];
        let line: Vec<f64> = axis
            .iter()
            .map(|&f| if (f - lo).abs() <= 2.5e3 { 5.0 } else { 0.0 })
            .collect();
        assert_eq!(agent.get_decision(&line, 0, lo), Decision::Step);
    }

    #[test]
    fn full_grid_stops() {
        let (mut agent, axis) = agent_on_grid(16);
        agent.window_half_width_hz = 2.5e3;
        let line = vec![5.0; 16];
        assert_eq!(agent.get_decision(&line, 0, axis[8]), Decision::Stop);
    }

    #[test]
    fn score_is_clamped_margin_sum() {
        let (agent, _) = agent_on_grid(4);
        // Targets are all 1.0.
        let line = vec![0.0, 1.0, 3.0, -5.0];
        assert!((agent.check_score(&line) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn score_and_decision_are_monotone_in_the_line() {
        let (mut agent, axis) = agent_on_grid(8);
        agent.window_half_width_hz = 2e3;
        let line = vec![0.5, 2.0, 1.5, 0.9, 3.0, 2.0, 1.1, 1.0];
        let base_score = agent.check_score(&line);
        for i in 0..line.len() {
            let mut bumped = line.clone();
            bumped[i] += 1.0;
            assert!(agent.check_score(&bumped) >= base_score);
        }

        // A line that already steps keeps stepping when any bin rises.
        let stepping: Vec<f64> = axis.iter().map(|_| 1.5).collect();
        let lo = axis[2];
        // One bin below target far from the window keeps this a Step, not a
        // Stop.
        let mut stepping = stepping;
        stepping[7] = 0.0;
        assert_eq!(agent.get_decision(&stepping, 0, lo), Decision::Step);
        for i in 0..stepping.len() {
            let mut bumped = stepping.clone();
            bumped[i] += 2.0;
            let decision = agent.get_decision(&bumped, 0, lo);
            assert_ne!(decision, Decision::Continue);
        }
    }
}
