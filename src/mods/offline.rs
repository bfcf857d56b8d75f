use anyhow::Result;
use crossbeam_channel::unbounded;
use std::{
    fs::{ self, File },
    io::{ self, BufWriter, Write },
    path::Path,
    sync::Arc,
    time::Duration,
};

use super::drain_seconds;
use crate::features::Framer;
use crate::logger::Logger;
use crate::rhythm::{
    AutoPlayer,
    Dispatcher,
    Event,
    Frame,
    GeneratorWorker,
    NoteKind,
    PatternGenerator,
    Renderer,
    Session,
    SpawnMode,
    SpawnedNote,
    Stats,
};
use crate::{ decode, log_info, log_warn };

#[derive(Clone, Debug)]
pub struct OfflineSummary {
    pub duration_s: f64,
    pub ticks: u64,
    pub score: u64,
    pub final_bpm: f32,
    pub stats: Stats,
}

/// Writes one CSV row per spawned note: `time_s,lane,kind,length,bpm`.
struct ChartWriter {
    out: BufWriter<File>,
    error: Option<io::Error>,
    logger: Arc<Logger>,
}

impl ChartWriter {
    fn create(path: &Path, logger: Arc<Logger>) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "time_s,lane,kind,length,bpm")?;
        Ok(Self { out, error: None, logger })
    }
}

impl Renderer for ChartWriter {
    fn render(&mut self, _frame: &Frame) {}

    fn on_spawn(&mut self, note: &SpawnedNote) {
        if self.error.is_some() {
            return;
        }
        let kind = match note.decision.kind {
            NoteKind::Normal => "normal",
            NoteKind::Hold => "hold",
        };
        if
            let Err(e) = writeln!(
                self.out,
                "{:.3},{},{},{:.0},{:.1}",
                note.time,
                note.decision.lane,
                kind,
                note.decision.length,
                note.bpm
            )
        {
            let _ = log_warn!(self.logger, "chart write failed: {}", e);
            self.error = Some(e);
        }
    }

    fn finish(&mut self, _frame: &Frame) -> Result<()> {
        if let Some(e) = self.error.take() {
            return Err(e.into());
        }
        self.out.flush()?;
        Ok(())
    }
}

/// Runs a whole song through the session on a virtual clock: features are fed in timestamp
/// order between ticks, autoplay presses the keys and generation requests are awaited in
/// place, so the same input and seed always give the same chart.
pub fn simulate(
    cli: &crate::Config,
    samples: &[f32],
    sample_rate: u32,
    logger: Arc<Logger>
) -> Result<OfflineSummary> {
    let mut framer = Framer::new(cli.feature, cli.frame_size, sample_rate);
    let mut features = Vec::with_capacity(samples.len() / cli.frame_size.max(1) + 1);
    framer.push(samples, |s| features.push(s));

    let duration_s = (samples.len() as f64) / (sample_rate.max(1) as f64);
    let session = Session::new(cli, framer.frame_seconds(), logger.clone())?;
    let chart = ChartWriter::create(Path::new(&cli.chart_path), logger.clone())?;

    let (tx, rx) = unbounded::<Event>();
    let mut dispatcher = Dispatcher::new(
        session,
        Box::new(chart),
        tx.clone(),
        logger.clone()
    ).with_autoplay(AutoPlayer::new(cli.lane_keys.len()));
    if cli.spawn_mode == SpawnMode::Generative {
        let worker = GeneratorWorker::spawn(
            Box::new(PatternGenerator::new(cli.seed)),
            tx,
            logger.clone()
        );
        dispatcher = dispatcher.with_generator(worker);
    }

    let wait = Duration::from_secs(10);
    dispatcher.start()?;
    dispatcher.settle_generation(&rx, wait)?;

    let end = duration_s + drain_seconds(cli);
    let dt = 1.0 / (cli.tick_hz.max(1) as f64);
    let mut next_feature = 0usize;
    let mut tick = 0u64;
    loop {
        let now = (tick as f64) * dt;
        if now > end {
            break;
        }
        while next_feature < features.len() && features[next_feature].timestamp <= now {
            let token = dispatcher.session().token();
            dispatcher.dispatch(Event::Feature { token, sample: features[next_feature] })?;
            dispatcher.settle_generation(&rx, wait)?;
            next_feature += 1;
        }
        dispatcher.dispatch(Event::Tick { now })?;
        dispatcher.settle_generation(&rx, wait)?;
        tick += 1;
    }

    let session = dispatcher.session();
    let summary = OfflineSummary {
        duration_s,
        ticks: session.ticks(),
        score: session.score(),
        final_bpm: session.bpm(),
        stats: *session.stats(),
    };
    dispatcher.shutdown()?;
    Ok(summary)
}

/// Offline mode: decode a local file and write its chart without touching audio devices.
pub fn run_offline(cli: &crate::Config, logger: Arc<Logger>) -> Result<OfflineSummary> {
    if cli.input_path.is_empty() {
        anyhow::bail!("--input <PATH> is required in offline mode");
    }
    let path = Path::new(&cli.input_path);
    if !path.exists() {
        anyhow::bail!("Input file not found: {}", path.display());
    }

    let _ = log_info!(logger, "Decoding: {}", path.display());
    let audio = decode::load_mono(path)?;
    let _ = log_info!(
        logger,
        "Decoded: sr={} Hz, channels={}, samples(mono)={}",
        audio.sr,
        audio.channels,
        audio.samples_mono.len()
    );

    let summary = simulate(cli, &audio.samples_mono, audio.sr, logger.clone())?;
    let _ = log_info!(
        logger,
        "Wrote {} note(s) to {} | {:.1}s, {} ticks, score {}, accuracy {:.1}%, final bpm {:.0}",
        summary.stats.spawned,
        cli.chart_path,
        summary.duration_s,
        summary.ticks,
        summary.score,
        summary.stats.accuracy() * 100.0,
        summary.final_bpm
    );
    Ok(summary)
}
