use anyhow::{ ensure, Result };
use std::{ collections::VecDeque, sync::Arc };

use super::generator::{ GenerationRequest, PredictedNote };
use super::hits::{ HitResolver, PressOutcome, ReleaseReport };
use super::keys::LiveKeyState;
use super::notes::{ Note, NoteField, NoteId, SweepReport };
use super::scheduler::{ BeatScheduler, SpawnDecision };
use super::score::ScoreKeeper;
use super::tempo::TempoEstimator;
use super::{ FeatureSample, SpawnMode };
use crate::logger::Logger;
use crate::{ log_debug, log_info, log_warn };

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub spawned: u64,
    pub hits: u64,
    pub holds_engaged: u64,
    pub hold_ticks: u64,
    pub missed: u64,
    pub presses: u64,
    pub empty_presses: u64,
    pub dropped_samples: u64,
    pub dropped_predictions: u64,
    pub generation_failures: u64,
    pub stale_generations: u64,
}

impl Stats {
    /// Resolved notes over all notes that left the field resolved or missed.
    pub fn accuracy(&self) -> f32 {
        let judged = self.hits + self.holds_engaged + self.missed;
        if judged == 0 {
            return 0.0;
        }
        ((self.hits + self.holds_engaged) as f32) / (judged as f32)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpawnedNote {
    pub id: NoteId,
    pub time: f64,
    pub bpm: f32,
    pub decision: SpawnDecision,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickReport {
    pub spawned: Vec<SpawnedNote>,
    pub hold_points: u64,
    pub swept: SweepReport,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScheduledNote {
    pub pitch: u8,
    pub time: f64,
}

#[derive(Clone, Copy, Debug)]
struct InFlight {
    token: u64,
    origin: f64,
    seconds_per_step: f64,
    steps: u32,
}

#[derive(Default)]
struct Generation {
    in_flight: Option<InFlight>,
    pending: VecDeque<ScheduledNote>,
    seed: Vec<PredictedNote>,
    next_origin: Option<f64>,
}

/// Read-only view handed to renderers and the autoplayer once per tick.
pub struct Frame<'a> {
    pub tick: u64,
    pub now: f64,
    pub bpm: f32,
    pub score: u64,
    pub notes: &'a [Note],
    pub keys: &'a LiveKeyState,
    pub stats: &'a Stats,
    pub hit_line_y: f32,
    pub hit_window: f32,
}

/// One play session: owns every piece of game state and is only ever driven from the
/// dispatcher thread.
///
/// `token` identifies the current run. It changes on every reset; feature samples and
/// generation results tagged with an older token are ignored.
pub struct Session {
    mode: SpawnMode,
    tempo: TempoEstimator,
    scheduler: BeatScheduler,
    field: NoteField,
    hits: HitResolver,
    score: ScoreKeeper,
    keys: LiveKeyState,
    generation: Generation,
    gen_steps: u32,
    gen_temperature: f32,
    gen_low_water: usize,
    steps_per_quarter: u32,
    stats: Stats,
    token: u64,
    ticks: u64,
    now: f64,
    logger: Arc<Logger>,
}

impl Session {
    pub fn new(cfg: &crate::Config, frame_seconds: f32, logger: Arc<Logger>) -> Result<Self> {
        let lane_count = cfg.lane_keys.len();
        ensure!(lane_count > 0, "at least one lane key is required");
        ensure!(frame_seconds > 0.0, "analysis frame length must be positive");

        let lanes = cfg.resolved_lane_policy().build(cfg.seed);
        let scheduler = BeatScheduler::new(cfg, lane_count, lanes);
        let _ = log_info!(
            logger,
            "session: mode={:?} lanes={} ({}) lane-policy={} frame={:.1} ms",
            cfg.spawn_mode,
            lane_count,
            cfg.lane_keys.join(","),
            scheduler.lane_policy_name(),
            frame_seconds * 1000.0
        );

        Ok(Self {
            mode: cfg.spawn_mode,
            tempo: TempoEstimator::new(cfg, frame_seconds),
            scheduler,
            field: NoteField::new(cfg, lane_count),
            hits: HitResolver::new(cfg),
            score: ScoreKeeper::new(),
            keys: LiveKeyState::new(&cfg.lane_keys),
            generation: Generation::default(),
            gen_steps: cfg.gen_steps.max(1),
            gen_temperature: cfg.gen_temperature,
            gen_low_water: cfg.gen_low_water,
            steps_per_quarter: cfg.steps_per_quarter.max(1),
            stats: Stats::default(),
            token: 1,
            ticks: 0,
            now: 0.0,
            logger,
        })
    }

    /// One analysis frame. Bad samples are counted and skipped.
    pub fn on_feature(&mut self, sample: FeatureSample) -> Option<SpawnedNote> {
        if !sample.is_valid() {
            self.stats.dropped_samples += 1;
            let _ = log_debug!(self.logger, "dropping feature sample {:?}", sample);
            return None;
        }
        self.now = self.now.max(sample.timestamp);
        self.tempo.ingest(&sample);
        let bpm = self.tempo.current_bpm();

        match self.mode {
            SpawnMode::Loudness => {
                let decision = self.scheduler.on_feature_sample(&sample, bpm, sample.timestamp)?;
                self.spawn(decision, sample.timestamp, bpm)
            }
            SpawnMode::Generative => self.release_due(sample.timestamp).into_iter().last(),
        }
    }

    /// One render frame: release due generated notes, move notes, pay holds, sweep.
    pub fn on_tick(&mut self, now: f64) -> TickReport {
        let mut report = TickReport::default();
        if now.is_finite() {
            self.now = now;
        }
        if self.mode == SpawnMode::Generative {
            report.spawned = self.release_due(self.now);
        }

        self.field.tick();

        let held: Vec<usize> = self.keys.pressed_lanes().collect();
        for lane in held {
            let hold = self.hits.on_key_held(lane, &mut self.field, &mut self.score);
            if let Some(id) = hold.engaged {
                self.stats.holds_engaged += 1;
                let _ = log_debug!(self.logger, "hold engaged: note {} lane {}", id, lane);
            }
            if hold.holding > 0 {
                self.stats.hold_ticks += 1;
            }
            report.hold_points += hold.points;
        }

        report.hold_points += self.hits.finish_held_through(&mut self.field, &mut self.score);
        report.swept = self.field.sweep();
        self.stats.missed += report.swept.missed as u64;
        self.ticks += 1;
        report
    }

    /// Key press by token. Unknown tokens and auto-repeat presses return `None`.
    pub fn key_down(&mut self, token: &str) -> Option<PressOutcome> {
        let lane = self.keys.lane_of(token)?;
        self.press_lane(lane)
    }

    pub fn key_up(&mut self, token: &str) -> Option<ReleaseReport> {
        let lane = self.keys.lane_of(token)?;
        self.release_lane(lane)
    }

    pub fn press_lane(&mut self, lane: usize) -> Option<PressOutcome> {
        if !self.keys.press(lane) {
            return None;
        }
        self.stats.presses += 1;
        let outcome = self.hits.on_key_down(lane, &mut self.field, &mut self.score);
        match outcome {
            PressOutcome::Hit { note, points } => {
                self.stats.hits += 1;
                let _ = log_debug!(
                    self.logger,
                    "hit: note {} lane {} +{} (score {})",
                    note,
                    lane,
                    points,
                    self.score.current()
                );
            }
            PressOutcome::Empty => {
                self.stats.empty_presses += 1;
            }
        }
        Some(outcome)
    }

    pub fn release_lane(&mut self, lane: usize) -> Option<ReleaseReport> {
        if !self.keys.release(lane) {
            return None;
        }
        Some(self.hits.on_key_up(lane, &mut self.field, &mut self.score))
    }

    /// Next continuation to ask the generator for, if one is due. Marks it in flight; while
    /// a request is outstanding this returns `None`.
    pub fn next_generation_request(&mut self) -> Option<GenerationRequest> {
        if self.mode != SpawnMode::Generative || self.generation.in_flight.is_some() {
            return None;
        }
        if self.generation.pending.len() >= self.gen_low_water {
            return None;
        }

        let bpm = self.tempo.current_bpm() as f64;
        let seconds_per_step = 60.0 / bpm / (self.steps_per_quarter as f64);
        let origin = self.generation.next_origin.map_or(self.now, |o| o.max(self.now));
        self.generation.in_flight = Some(InFlight {
            token: self.token,
            origin,
            seconds_per_step,
            steps: self.gen_steps,
        });

        let seed = if self.generation.seed.is_empty() {
            vec![PredictedNote { pitch: super::generator::KICK, start_step: 0, end_step: 1 }]
        } else {
            self.generation.seed.clone()
        };
        Some(GenerationRequest {
            token: self.token,
            seed,
            steps: self.gen_steps,
            temperature: self.gen_temperature,
        })
    }

    /// Completion of a generation request. Returns how many notes were queued; stale
    /// completions from before a reset queue nothing.
    pub fn complete_generation(
        &mut self,
        token: u64,
        result: anyhow::Result<Vec<PredictedNote>>
    ) -> usize {
        let flight = match self.generation.in_flight {
            Some(f) if f.token == token && token == self.token => f,
            _ => {
                self.stats.stale_generations += 1;
                let _ = log_debug!(
                    self.logger,
                    "discarding generation result for token {} (current {})",
                    token,
                    self.token
                );
                return 0;
            }
        };
        self.generation.in_flight = None;

        let notes = match result {
            Ok(notes) => notes,
            Err(e) => {
                self.stats.generation_failures += 1;
                let _ = log_warn!(self.logger, "generation failed: {:#}", e);
                return 0;
            }
        };

        let mut queued = 0;
        for n in &notes {
            let time = flight.origin + (n.start_step as f64) * flight.seconds_per_step;
            self.generation.pending.push_back(ScheduledNote { pitch: n.pitch, time });
            queued += 1;
        }
        self.generation.pending
            .make_contiguous()
            .sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap_or(std::cmp::Ordering::Equal));

        // the last bar seeds the next continuation
        let tail_from = flight.steps.saturating_sub(16);
        self.generation.seed = notes
            .iter()
            .filter(|n| n.start_step >= tail_from)
            .map(|n| PredictedNote {
                pitch: n.pitch,
                start_step: n.start_step - tail_from,
                end_step: n.end_step.saturating_sub(tail_from),
            })
            .collect();
        self.generation.next_origin = Some(
            flight.origin + (flight.steps as f64) * flight.seconds_per_step
        );

        let _ = log_debug!(
            self.logger,
            "queued {} generated notes from t={:.2}s (pending {})",
            queued,
            flight.origin,
            self.generation.pending.len()
        );
        queued
    }

    /// Starts a fresh run: new token, empty field, zero score, released keys.
    pub fn reset(&mut self) {
        self.token += 1;
        self.field.clear();
        self.score.reset();
        self.keys.release_all();
        self.scheduler.reset();
        self.tempo.reset();
        self.generation = Generation::default();
        self.stats = Stats::default();
        self.ticks = 0;
        self.now = 0.0;
        let _ = log_info!(self.logger, "session reset (token {})", self.token);
    }

    pub fn frame(&self) -> Frame<'_> {
        Frame {
            tick: self.ticks,
            now: self.now,
            bpm: self.tempo.current_bpm(),
            score: self.score.current(),
            notes: self.field.live_notes(),
            keys: &self.keys,
            stats: &self.stats,
            hit_line_y: self.field.hit_line_y(),
            hit_window: self.field.hit_window(),
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }
    pub fn score(&self) -> u64 {
        self.score.current()
    }
    pub fn bpm(&self) -> f32 {
        self.tempo.current_bpm()
    }
    pub fn stats(&self) -> &Stats {
        &self.stats
    }
    pub fn live_notes(&self) -> &[Note] {
        self.field.live_notes()
    }
    pub fn keys(&self) -> &LiveKeyState {
        &self.keys
    }
    pub fn ticks(&self) -> u64 {
        self.ticks
    }
    pub fn pending_generated(&self) -> usize {
        self.generation.pending.len()
    }
    pub fn generation_in_flight(&self) -> bool {
        self.generation.in_flight.is_some()
    }
    pub fn ticks_to_hit_line(&self, fall_speed: f32) -> u32 {
        self.field.ticks_to_hit_line(fall_speed)
    }

    fn spawn(&mut self, decision: SpawnDecision, time: f64, bpm: f32) -> Option<SpawnedNote> {
        match
            self.field.spawn(decision.lane, decision.kind, decision.length, decision.fall_speed)
        {
            Ok(id) => {
                self.stats.spawned += 1;
                let _ = log_debug!(
                    self.logger,
                    "spawn: note {} lane {} {:?} t={:.3}s bpm={:.0}",
                    id,
                    decision.lane,
                    decision.kind,
                    time,
                    bpm
                );
                Some(SpawnedNote { id, time, bpm, decision })
            }
            Err(e) => {
                let _ = log_warn!(self.logger, "spawn rejected: {:#}", e);
                None
            }
        }
    }

    fn release_due(&mut self, now: f64) -> Vec<SpawnedNote> {
        let mut spawned = Vec::new();
        let bpm = self.tempo.current_bpm();
        while let Some(next) = self.generation.pending.front().copied() {
            if next.time > now {
                break;
            }
            self.generation.pending.pop_front();
            match self.scheduler.on_predicted_note(next.pitch, bpm, now) {
                Some(decision) => {
                    if let Some(s) = self.spawn(decision, now, bpm) {
                        spawned.push(s);
                    }
                }
                None => {
                    self.stats.dropped_predictions += 1;
                }
            }
        }
        spawned
    }
}
