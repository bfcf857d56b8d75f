use anyhow::Result;
use crossbeam_channel::{ Receiver, RecvTimeoutError, Sender };
use std::{
    sync::{ atomic::{ AtomicBool, AtomicU64, Ordering }, Arc },
    time::Duration,
};

use super::autoplay::AutoPlayer;
use super::generator::{ GeneratorWorker, PredictedNote };
use super::session::{ Frame, Session, SpawnedNote };
use super::FeatureSample;
use crate::logger::Logger;
use crate::{ log_debug, log_info, log_warn };

/// Everything that reaches the dispatcher. Producers run on their own threads; only the
/// dispatcher touches the session.
#[derive(Debug)]
pub enum Event {
    /// Analysis frame tagged with the session token it was produced for.
    Feature {
        token: u64,
        sample: FeatureSample,
    },
    /// Render tick at playback time `now` (seconds).
    Tick {
        now: f64,
    },
    Key {
        key: String,
        pressed: bool,
    },
    Generated {
        token: u64,
        result: anyhow::Result<Vec<PredictedNote>>,
    },
    Reset,
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Frames played so far, shared between the audio callback and the tick thread. A paused
/// clock neither advances nor lets the output callback play.
#[derive(Clone, Debug)]
pub struct PlaybackClock {
    frames: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    sample_rate: u32,
}

impl PlaybackClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(true)),
            sample_rate: sample_rate.max(1),
        }
    }

    pub fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn seconds(&self) -> f64 {
        (self.frames() as f64) / (self.sample_rate as f64)
    }

    /// Back to frame zero.
    pub fn rewind(&self) {
        self.frames.store(0, Ordering::Relaxed);
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// A stream of feature samples. `start` begins emitting `Event::Feature` tagged with
/// `token`; `stop` must not return until the source has stopped sending.
pub trait AudioAnalysisSource {
    fn start(&mut self, token: u64, events: Sender<Event>) -> Result<()>;
    fn stop(&mut self);
    /// Playback position of the audio this source analyses; drives the tick thread.
    fn clock(&self) -> PlaybackClock;
    fn frame_seconds(&self) -> f32;
    fn name(&self) -> &str;
}

pub trait Renderer {
    fn render(&mut self, frame: &Frame);

    fn on_spawn(&mut self, _note: &SpawnedNote) {}

    fn on_reset(&mut self, _token: u64) {}

    /// Called once when the dispatcher stops.
    fn finish(&mut self, _frame: &Frame) -> Result<()> {
        Ok(())
    }
}

/// Single consumer of the event channel. Owns the session and applies every event to it in
/// arrival order.
pub struct Dispatcher {
    session: Session,
    renderer: Box<dyn Renderer>,
    source: Option<Box<dyn AudioAnalysisSource>>,
    generator: Option<GeneratorWorker>,
    autoplay: Option<AutoPlayer>,
    events: Sender<Event>,
    stale_features: u64,
    logger: Arc<Logger>,
}

impl Dispatcher {
    pub fn new(
        session: Session,
        renderer: Box<dyn Renderer>,
        events: Sender<Event>,
        logger: Arc<Logger>
    ) -> Self {
        Self {
            session,
            renderer,
            source: None,
            generator: None,
            autoplay: None,
            events,
            stale_features: 0,
            logger,
        }
    }

    pub fn with_source(mut self, source: Box<dyn AudioAnalysisSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_generator(mut self, worker: GeneratorWorker) -> Self {
        self.generator = Some(worker);
        self
    }

    pub fn with_autoplay(mut self, autoplay: AutoPlayer) -> Self {
        self.autoplay = Some(autoplay);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn stale_features(&self) -> u64 {
        self.stale_features
    }

    /// Starts the source for the current token and asks for the first continuation.
    pub fn start(&mut self) -> Result<()> {
        let token = self.session.token();
        if let Some(source) = self.source.as_mut() {
            let _ = log_info!(self.logger, "starting source '{}' (token {})", source.name(), token);
            source.start(token, self.events.clone())?;
        }
        self.request_generation();
        Ok(())
    }

    pub fn dispatch(&mut self, event: Event) -> Result<Flow> {
        match event {
            Event::Feature { token, sample } => {
                if token != self.session.token() {
                    self.stale_features += 1;
                    return Ok(Flow::Continue);
                }
                if let Some(spawned) = self.session.on_feature(sample) {
                    self.renderer.on_spawn(&spawned);
                }
                self.request_generation();
            }
            Event::Tick { now } => {
                let report = self.session.on_tick(now);
                for spawned in &report.spawned {
                    self.renderer.on_spawn(spawned);
                }
                if let Some(auto) = self.autoplay.as_mut() {
                    let actions = auto.react(&self.session.frame());
                    for (lane, pressed) in actions {
                        if pressed {
                            self.session.press_lane(lane);
                        } else {
                            self.session.release_lane(lane);
                        }
                    }
                }
                self.renderer.render(&self.session.frame());
                self.request_generation();
            }
            Event::Key { key, pressed } => {
                let handled = if pressed {
                    self.session.key_down(&key).is_some()
                } else {
                    self.session.key_up(&key).is_some()
                };
                if !handled && self.session.keys().lane_of(&key).is_none() {
                    let _ = log_debug!(self.logger, "ignoring key '{}'", key);
                }
            }
            Event::Generated { token, result } => {
                self.session.complete_generation(token, result);
                self.request_generation();
            }
            Event::Reset => {
                self.reset()?;
            }
            Event::Shutdown => {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// Drains `rx` until `Shutdown` arrives, the channel closes or `quit` is raised.
    pub fn run(&mut self, rx: &Receiver<Event>, quit: &AtomicBool) -> Result<()> {
        while !quit.load(Ordering::SeqCst) {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(event) => {
                    if self.dispatch(event)? == Flow::Stop {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    break;
                }
            }
        }
        self.shutdown()
    }

    /// Blocks until no generation request is outstanding, dispatching whatever arrives
    /// meanwhile. Used by headless runs that want generated notes on a fixed timeline.
    pub fn settle_generation(&mut self, rx: &Receiver<Event>, timeout: Duration) -> Result<()> {
        while self.session.generation_in_flight() {
            match rx.recv_timeout(timeout) {
                Ok(event) => {
                    if self.dispatch(event)? == Flow::Stop {
                        break;
                    }
                }
                Err(_) => {
                    anyhow::bail!("sequence generator did not answer within {:?}", timeout);
                }
            }
        }
        Ok(())
    }

    pub fn shutdown(&mut self) -> Result<()> {
        if let Some(source) = self.source.as_mut() {
            source.stop();
        }
        let stats = *self.session.stats();
        let _ = log_info!(
            self.logger,
            "stopped: score={} spawned={} hits={} holds={} missed={} accuracy={:.1}% stale={}",
            self.session.score(),
            stats.spawned,
            stats.hits,
            stats.holds_engaged,
            stats.missed,
            stats.accuracy() * 100.0,
            self.stale_features
        );
        self.renderer.finish(&self.session.frame())
    }

    /// Stops the source, starts a fresh session run and restarts the source under the new
    /// token. Samples still queued from the old run are dropped by their token.
    fn reset(&mut self) -> Result<()> {
        if let Some(source) = self.source.as_mut() {
            source.stop();
        }
        self.session.reset();
        if let Some(auto) = self.autoplay.as_mut() {
            auto.reset();
        }
        let token = self.session.token();
        self.renderer.on_reset(token);
        if let Some(source) = self.source.as_mut() {
            source.start(token, self.events.clone())?;
        }
        self.request_generation();
        Ok(())
    }

    fn request_generation(&mut self) {
        let Some(worker) = self.generator.as_ref() else {
            return;
        };
        let Some(req) = self.session.next_generation_request() else {
            return;
        };
        let token = req.token;
        if let Err(e) = worker.submit(req) {
            let _ = log_warn!(self.logger, "could not submit generation request: {:#}", e);
            self.session.complete_generation(token, Err(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhythm::{ PatternGenerator, SpawnMode };
    use crossbeam_channel::unbounded;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Journal(Arc<Mutex<Vec<String>>>);

    impl Journal {
        fn push(&self, s: String) {
            self.0.lock().unwrap().push(s);
        }
        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct FakeSource(Journal);

    impl AudioAnalysisSource for FakeSource {
        fn start(&mut self, token: u64, _events: Sender<Event>) -> Result<()> {
            self.0.push(format!("start {}", token));
            Ok(())
        }
        fn stop(&mut self) {
            self.0.push("stop".into());
        }
        fn clock(&self) -> PlaybackClock {
            PlaybackClock::new(100)
        }
        fn frame_seconds(&self) -> f32 {
            0.01
        }
        fn name(&self) -> &str {
            "fake"
        }
    }

    struct CountingRenderer(Journal);

    impl Renderer for CountingRenderer {
        fn render(&mut self, frame: &Frame) {
            self.0.push(format!("frame {} score {}", frame.tick, frame.score));
        }
        fn on_spawn(&mut self, note: &SpawnedNote) {
            self.0.push(format!("spawn lane {}", note.decision.lane));
        }
        fn on_reset(&mut self, token: u64) {
            self.0.push(format!("reset {}", token));
        }
    }

    fn dispatcher(cfg: &crate::Config) -> (Dispatcher, Receiver<Event>, Journal, Journal) {
        let logger = Arc::new(Logger::disabled());
        let (tx, rx) = unbounded();
        let session = Session::new(cfg, 0.01, logger.clone()).unwrap();
        let src = Journal::default();
        let out = Journal::default();
        let d = Dispatcher::new(session, Box::new(CountingRenderer(out.clone())), tx, logger)
            .with_source(Box::new(FakeSource(src.clone())));
        (d, rx, src, out)
    }

    fn loud(token: u64, t: f64) -> Event {
        Event::Feature { token, sample: FeatureSample { value: 0.5, timestamp: t } }
    }

    #[test]
    fn reset_restarts_source_and_drops_stale_samples() {
        let mut cfg = crate::Config::default();
        cfg.seed = Some(4);
        let (mut d, _rx, src, out) = dispatcher(&cfg);
        d.start().unwrap();
        assert_eq!(d.dispatch(loud(1, 0.0)).unwrap(), Flow::Continue);
        assert_eq!(d.session().live_notes().len(), 1);

        d.dispatch(Event::Reset).unwrap();
        assert_eq!(src.entries(), vec!["start 1", "stop", "start 2"]);
        assert!(d.session().live_notes().is_empty());

        // a sample from before the reset arrives late
        d.dispatch(loud(1, 0.5)).unwrap();
        assert!(d.session().live_notes().is_empty());
        assert_eq!(d.stale_features(), 1);

        d.dispatch(loud(2, 0.0)).unwrap();
        assert_eq!(d.session().live_notes().len(), 1);
        let log = out.entries();
        assert!(log.contains(&"reset 2".to_string()));
        assert_eq!(log.iter().filter(|l| l.starts_with("spawn")).count(), 2);
    }

    #[test]
    fn ticks_render_and_keys_route_by_token() {
        let cfg = crate::Config::default();
        let (mut d, _rx, _src, out) = dispatcher(&cfg);
        d.dispatch(Event::Tick { now: 0.0 }).unwrap();
        d.dispatch(Event::Key { key: "q".into(), pressed: true }).unwrap();
        d.dispatch(Event::Key { key: "A".into(), pressed: true }).unwrap();
        assert!(d.session().keys().is_pressed(0));
        d.dispatch(Event::Key { key: "a".into(), pressed: false }).unwrap();
        assert!(!d.session().keys().is_pressed(0));
        assert_eq!(d.session().stats().presses, 1);
        assert_eq!(out.entries(), vec!["frame 1 score 0"]);
    }

    #[test]
    fn shutdown_stops_the_loop() {
        let cfg = crate::Config::default();
        let (mut d, _rx, src, _out) = dispatcher(&cfg);
        let (tx, rx) = unbounded();
        tx.send(Event::Tick { now: 0.0 }).unwrap();
        tx.send(Event::Shutdown).unwrap();
        tx.send(Event::Tick { now: 0.1 }).unwrap();
        d.run(&rx, &AtomicBool::new(false)).unwrap();
        assert_eq!(d.session().ticks(), 1);
        assert_eq!(src.entries(), vec!["stop"]);
    }

    #[test]
    fn generated_notes_flow_through_the_worker() {
        let mut cfg = crate::Config::default();
        cfg.spawn_mode = SpawnMode::Generative;
        cfg.seed = Some(21);
        let logger = Arc::new(Logger::disabled());
        let (tx, rx) = unbounded();
        let session = Session::new(&cfg, 0.01, logger.clone()).unwrap();
        let worker = GeneratorWorker::spawn(
            Box::new(PatternGenerator::new(cfg.seed)),
            tx.clone(),
            logger.clone()
        );
        let out = Journal::default();
        let mut d = Dispatcher::new(
            session,
            Box::new(CountingRenderer(out.clone())),
            tx,
            logger
        ).with_generator(worker);

        d.start().unwrap();
        assert!(d.session().generation_in_flight());
        d.settle_generation(&rx, Duration::from_secs(5)).unwrap();
        assert!(d.session().pending_generated() > 0);

        // ten seconds of ticks at 60 Hz
        for i in 0..600 {
            d.dispatch(Event::Tick { now: (i as f64) / 60.0 }).unwrap();
            d.settle_generation(&rx, Duration::from_secs(5)).unwrap();
        }
        let stats = d.session().stats();
        assert!(stats.spawned > 0);
        assert_eq!(stats.generation_failures, 0);
        assert!(out.entries().iter().any(|l| l.starts_with("spawn")));
    }
}
