use std::collections::VecDeque;

use super::FeatureSample;

/// Number of analysis frames that fit in `window_s` seconds.
#[inline]
pub fn window_cap(window_s: f32, frame_seconds: f32) -> usize {
    if !(frame_seconds > 0.0) || !window_s.is_finite() {
        return 1;
    }
    ((window_s / frame_seconds).round() as usize).max(1)
}

/// Rolling peak-density tempo estimate.
///
/// Keeps the last `cap` feature values. Once the window is full every ingest recomputes
/// `round(peaks / window_seconds * 60)`; a zero or non-finite estimate keeps the prior value
/// and anything else is clamped into `[min_bpm, max_bpm]`.
pub struct TempoEstimator {
    cap: usize,
    frame_seconds: f32,
    peak_thr: f32,
    default_bpm: f32,
    min_bpm: f32,
    max_bpm: f32,
    history: VecDeque<f32>,
    bpm: f32,
    recomputes: u64,
}

impl TempoEstimator {
    pub fn new(cfg: &crate::Config, frame_seconds: f32) -> Self {
        let cap = window_cap(cfg.tempo_window_s, frame_seconds);
        Self {
            cap,
            frame_seconds,
            peak_thr: cfg.peak_thr,
            default_bpm: cfg.default_bpm,
            min_bpm: cfg.min_bpm,
            max_bpm: cfg.max_bpm,
            history: VecDeque::with_capacity(cap),
            bpm: cfg.default_bpm,
            recomputes: 0,
        }
    }

    pub fn ingest(&mut self, sample: &FeatureSample) {
        self.history.push_back(sample.value);
        while self.history.len() > self.cap {
            self.history.pop_front();
        }
        if self.history.len() < self.cap {
            return;
        }

        let peak_count = self.history
            .iter()
            .filter(|v| **v > self.peak_thr)
            .count();
        let window_seconds = (self.cap as f32) * self.frame_seconds;
        let raw = ((peak_count as f32) / window_seconds * 60.0).round();

        self.recomputes += 1;
        if raw > 0.0 && raw.is_finite() {
            self.bpm = raw.clamp(self.min_bpm, self.max_bpm);
        }
    }

    pub fn current_bpm(&self) -> f32 {
        self.bpm
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn recomputes(&self) -> u64 {
        self.recomputes
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.bpm = self.default_bpm;
        self.recomputes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_with_window(window_s: f32) -> crate::Config {
        let mut cfg = crate::Config::default();
        cfg.tempo_window_s = window_s;
        cfg
    }

    fn sample(value: f32, t: f64) -> FeatureSample {
        FeatureSample { value, timestamp: t }
    }

    #[test]
    fn window_cap_matches_frame_rate() {
        // 1024-sample frames at 44.1 kHz: ~43 frames per second
        let frame_s = 1024.0 / 44_100.0;
        assert_eq!(window_cap(30.0, frame_s), 1292);
        assert_eq!(window_cap(1.0, 0.0), 1);
    }

    #[test]
    fn keeps_default_until_window_fills() {
        let cfg = cfg_with_window(1.0);
        let mut tempo = TempoEstimator::new(&cfg, 0.1);
        assert_eq!(tempo.capacity(), 10);
        for i in 0..9 {
            tempo.ingest(&sample(1.0, i as f64 * 0.1));
        }
        assert_eq!(tempo.current_bpm(), 120.0);
        assert_eq!(tempo.recomputes(), 0);
    }

    #[test]
    fn peak_density_sets_bpm() {
        // 10 frames of 0.2 s = 2 s window; 4 peaks -> 4 / 2 * 60 = 120
        let cfg = cfg_with_window(2.0);
        let mut tempo = TempoEstimator::new(&cfg, 0.2);
        for i in 0..10 {
            let v = if i % 5 == 0 || i % 5 == 2 { 0.5 } else { 0.0 };
            tempo.ingest(&sample(v, i as f64 * 0.2));
        }
        assert_eq!(tempo.current_bpm(), 120.0);

        // evicts a peak, adds a peak: still 4
        tempo.ingest(&sample(0.5, 2.0));
        assert_eq!(tempo.current_bpm(), 120.0);
        // evicts silence, adds a peak: 5 / 2 * 60
        tempo.ingest(&sample(0.5, 2.2));
        assert_eq!(tempo.current_bpm(), 150.0);
        assert_eq!(tempo.recomputes(), 3);
    }

    #[test]
    fn zero_peaks_keep_prior_value() {
        let cfg = cfg_with_window(1.0);
        let mut tempo = TempoEstimator::new(&cfg, 0.1);
        for i in 0..50 {
            tempo.ingest(&sample(0.0, i as f64 * 0.1));
            let bpm = tempo.current_bpm();
            assert!(bpm.is_finite() && bpm > 0.0);
        }
        assert_eq!(tempo.current_bpm(), 120.0);
    }

    #[test]
    fn clamps_runaway_estimates() {
        // every frame loud: 10 peaks in 0.1 s -> 6000 bpm before clamping
        let cfg = cfg_with_window(0.1);
        let mut tempo = TempoEstimator::new(&cfg, 0.01);
        for i in 0..10 {
            tempo.ingest(&sample(1.0, i as f64 * 0.01));
        }
        assert_eq!(tempo.current_bpm(), cfg.max_bpm);
    }

    #[test]
    fn reset_restores_default() {
        let cfg = cfg_with_window(0.1);
        let mut tempo = TempoEstimator::new(&cfg, 0.01);
        for i in 0..10 {
            tempo.ingest(&sample(1.0, i as f64 * 0.01));
        }
        tempo.reset();
        assert_eq!(tempo.current_bpm(), cfg.default_bpm);
        assert_eq!(tempo.recomputes(), 0);
    }
}
