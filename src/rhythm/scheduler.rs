use rand::{ rngs::StdRng, Rng, SeedableRng };

use super::{ FeatureSample, NoteKind };

/// Everything the note field needs to place one new note.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpawnDecision {
    pub lane: usize,
    pub kind: NoteKind,
    pub length: f32,
    pub fall_speed: f32,
}

/// Picks the lane for a spawn. `pitch` is only known for generated notes.
pub trait LaneAssigner: Send {
    fn assign(&mut self, pitch: Option<u8>, lane_count: usize) -> usize;
    fn name(&self) -> &'static str;
}

pub struct UniformLanes {
    rng: StdRng,
}

impl UniformLanes {
    pub fn new(rng: StdRng) -> Self {
        Self { rng }
    }
}

impl LaneAssigner for UniformLanes {
    fn assign(&mut self, _pitch: Option<u8>, lane_count: usize) -> usize {
        self.rng.random_range(0..lane_count.max(1))
    }
    fn name(&self) -> &'static str {
        "uniform"
    }
}

/// `pitch % lane_count`; round robin when no pitch is available.
#[derive(Default)]
pub struct PitchLanes {
    next: usize,
}

impl LaneAssigner for PitchLanes {
    fn assign(&mut self, pitch: Option<u8>, lane_count: usize) -> usize {
        let lanes = lane_count.max(1);
        match pitch {
            Some(p) => (p as usize) % lanes,
            None => {
                let lane = self.next % lanes;
                self.next = (lane + 1) % lanes;
                lane
            }
        }
    }
    fn name(&self) -> &'static str {
        "pitch"
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LanePolicy {
    Uniform,
    Pitch,
}

impl LanePolicy {
    pub fn build(self, seed: Option<u64>) -> Box<dyn LaneAssigner> {
        match self {
            LanePolicy::Uniform => Box::new(UniformLanes::new(seeded_rng(seed, 0x1a2e))),
            LanePolicy::Pitch => Box::new(PitchLanes::default()),
        }
    }
}

pub fn seeded_rng(seed: Option<u64>, stream: u64) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s ^ stream),
        None => StdRng::from_os_rng(),
    }
}

/// Turns the continuous feature stream (or generated notes) into discrete spawns.
///
/// At most one spawn per `beat_interval * spacing_factor`, where the interval comes from the
/// tempo passed with each call. Both entry points share `last_spawn`.
pub struct BeatScheduler {
    lane_count: usize,
    loudness_thr: f32,
    spacing_factor: f64,
    hold_prob: f64,
    hold_length: f32,
    normal_length: f32,
    fall_speed: f32,
    last_good_bpm: f32,
    last_spawn: Option<f64>,
    lanes: Box<dyn LaneAssigner>,
    rng: StdRng,
}

impl BeatScheduler {
    pub fn new(cfg: &crate::Config, lane_count: usize, lanes: Box<dyn LaneAssigner>) -> Self {
        Self {
            lane_count,
            loudness_thr: cfg.loudness_thr,
            spacing_factor: cfg.spacing_factor,
            hold_prob: cfg.hold_prob.clamp(0.0, 1.0) as f64,
            hold_length: cfg.hold_length,
            normal_length: cfg.normal_length,
            fall_speed: cfg.fall_speed,
            last_good_bpm: cfg.default_bpm,
            last_spawn: None,
            lanes,
            rng: seeded_rng(cfg.seed, 0x5eed),
        }
    }

    /// Loudness-gated spawn decision for one feature sample.
    pub fn on_feature_sample(
        &mut self,
        sample: &FeatureSample,
        tempo_bpm: f32,
        now: f64
    ) -> Option<SpawnDecision> {
        if !(sample.value > self.loudness_thr) {
            return None;
        }
        if !self.spacing_elapsed(tempo_bpm, now) {
            return None;
        }
        Some(self.fire(None, now))
    }

    /// Generated-note trigger; same spacing rule as the loudness gate.
    pub fn on_predicted_note(
        &mut self,
        pitch: u8,
        tempo_bpm: f32,
        now: f64
    ) -> Option<SpawnDecision> {
        if !self.spacing_elapsed(tempo_bpm, now) {
            return None;
        }
        Some(self.fire(Some(pitch), now))
    }

    pub fn min_spacing(&mut self, tempo_bpm: f32) -> f64 {
        let bpm = self.usable_bpm(tempo_bpm);
        (60.0 / (bpm as f64)) * self.spacing_factor
    }

    pub fn last_spawn(&self) -> Option<f64> {
        self.last_spawn
    }

    pub fn lane_policy_name(&self) -> &'static str {
        self.lanes.name()
    }

    pub fn reset(&mut self) {
        self.last_spawn = None;
    }

    fn usable_bpm(&mut self, tempo_bpm: f32) -> f32 {
        if tempo_bpm > 0.0 && tempo_bpm.is_finite() {
            self.last_good_bpm = tempo_bpm;
        }
        self.last_good_bpm
    }

    fn spacing_elapsed(&mut self, tempo_bpm: f32, now: f64) -> bool {
        let guard = self.min_spacing(tempo_bpm);
        match self.last_spawn {
            None => true,
            Some(last) => now - last > guard,
        }
    }

    fn fire(&mut self, pitch: Option<u8>, now: f64) -> SpawnDecision {
        self.last_spawn = Some(now);
        let lane = self.lanes.assign(pitch, self.lane_count).min(self.lane_count.saturating_sub(1));
        let kind = if self.rng.random_bool(self.hold_prob) { NoteKind::Hold } else { NoteKind::Normal };
        let length = match kind {
            NoteKind::Hold => self.hold_length,
            NoteKind::Normal => self.normal_length,
        };
        SpawnDecision { lane, kind, length, fall_speed: self.fall_speed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(hold_prob: f32) -> BeatScheduler {
        let mut cfg = crate::Config::default();
        cfg.seed = Some(7);
        cfg.hold_prob = hold_prob;
        BeatScheduler::new(&cfg, 4, LanePolicy::Uniform.build(cfg.seed))
    }

    fn loud(t: f64) -> FeatureSample {
        FeatureSample { value: 0.5, timestamp: t }
    }

    #[test]
    fn spacing_gate_at_120_bpm() {
        let mut s = scheduler(0.2);
        assert!(s.on_feature_sample(&loud(0.0), 120.0, 0.0).is_some());
        // guard is 0.45 s
        assert!(s.on_feature_sample(&loud(0.1), 120.0, 0.1).is_none());
        assert!(s.on_feature_sample(&loud(0.5), 120.0, 0.5).is_some());
        assert_eq!(s.last_spawn(), Some(0.5));
    }

    #[test]
    fn sample_exactly_on_the_guard_does_not_spawn() {
        let mut s = scheduler(0.0);
        assert!(s.on_feature_sample(&loud(0.0), 120.0, 0.0).is_some());
        assert_eq!(s.min_spacing(120.0), 0.45);
        assert!(s.on_feature_sample(&loud(0.45), 120.0, 0.45).is_none());
        assert!(s.on_feature_sample(&loud(0.46), 120.0, 0.46).is_some());
    }

    #[test]
    fn quiet_samples_never_spawn() {
        let mut s = scheduler(0.2);
        let quiet = FeatureSample { value: 0.05, timestamp: 0.0 };
        assert!(s.on_feature_sample(&quiet, 120.0, 0.0).is_none());
        assert!(s.last_spawn().is_none());
    }

    #[test]
    fn spawns_respect_guard_for_dense_streams() {
        let mut s = scheduler(0.3);
        let mut last: Option<f64> = None;
        let mut spawns = 0;
        // 100 Hz stream of loud samples with a drifting tempo
        for i in 0..2_000 {
            let t = (i as f64) * 0.01;
            let bpm = 90.0 + ((i / 200) as f32) * 10.0;
            if s.on_feature_sample(&loud(t), bpm, t).is_some() {
                if let Some(prev) = last {
                    let guard = (60.0 / (bpm as f64)) * 0.9;
                    assert!(t - prev > guard, "spawn at {t} too close to {prev}");
                }
                last = Some(t);
                spawns += 1;
            }
        }
        assert!(spawns > 10);
    }

    #[test]
    fn illegal_tempo_falls_back_to_last_good() {
        let mut s = scheduler(0.0);
        assert!(s.on_feature_sample(&loud(0.0), 60.0, 0.0).is_some());
        // last good tempo is 60 bpm -> guard 0.9 s
        assert!(s.on_feature_sample(&loud(0.5), 0.0, 0.5).is_none());
        assert!(s.on_feature_sample(&loud(0.6), f32::NAN, 0.6).is_none());
        assert!(s.on_feature_sample(&loud(0.95), -10.0, 0.95).is_some());
    }

    #[test]
    fn lanes_and_kinds_stay_in_range() {
        let mut s = scheduler(0.5);
        let mut holds = 0;
        for i in 0..200 {
            let t = (i as f64) * 1.0;
            let d = s.on_feature_sample(&loud(t), 120.0, t).unwrap();
            assert!(d.lane < 4);
            match d.kind {
                NoteKind::Hold => {
                    holds += 1;
                    assert_eq!(d.length, 80.0);
                }
                NoteKind::Normal => assert_eq!(d.length, 30.0),
            }
        }
        assert!(holds > 0 && holds < 200);
    }

    #[test]
    fn predicted_notes_share_spacing_and_map_pitch() {
        let mut cfg = crate::Config::default();
        cfg.hold_prob = 0.0;
        cfg.seed = Some(1);
        let mut s = BeatScheduler::new(&cfg, 4, LanePolicy::Pitch.build(None));
        let d = s.on_predicted_note(38, 120.0, 1.0).unwrap();
        assert_eq!(d.lane, 2);
        assert!(s.on_predicted_note(36, 120.0, 1.2).is_none());
        // loudness path sees the same last spawn
        assert!(s.on_feature_sample(&loud(1.3), 120.0, 1.3).is_none());
        assert_eq!(s.on_predicted_note(51, 120.0, 1.5).unwrap().lane, 3);
    }

    #[test]
    fn pitch_lanes_round_robin_without_pitch() {
        let mut lanes = PitchLanes::default();
        let got: Vec<usize> = (0..5).map(|_| lanes.assign(None, 4)).collect();
        assert_eq!(got, vec![0, 1, 2, 3, 0]);
    }

    #[test]
    fn reset_allows_immediate_spawn() {
        let mut s = scheduler(0.0);
        assert!(s.on_feature_sample(&loud(10.0), 120.0, 10.0).is_some());
        s.reset();
        assert!(s.on_feature_sample(&loud(0.0), 120.0, 0.0).is_some());
    }
}
