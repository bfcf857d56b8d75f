use anyhow::Result;
use cpal::traits::StreamTrait;
use crossbeam_channel::unbounded;
use std::{ path::Path, sync::{ atomic::AtomicBool, Arc } };

use super::{ drain_seconds, input, install_quit_handler, render::LogRenderer, sources::SongSource, spawn_ticker };
use crate::logger::Logger;
use crate::rhythm::{
    AudioAnalysisSource,
    AutoPlayer,
    Dispatcher,
    Event,
    GeneratorWorker,
    PatternGenerator,
    PlaybackClock,
    Session,
    SpawnMode,
};
use crate::{ build_output_stream, decode, log_info };

/// Builds the dispatcher shared by the live modes: session, renderer, optional generator
/// worker and autoplayer.
pub(crate) fn live_dispatcher(
    cli: &crate::Config,
    source: Box<dyn AudioAnalysisSource>,
    events: crossbeam_channel::Sender<Event>,
    logger: Arc<Logger>
) -> Result<Dispatcher> {
    let session = Session::new(cli, source.frame_seconds(), logger.clone())?;
    let renderer = LogRenderer::new(cli.status_every_ticks, logger.clone());
    let mut dispatcher = Dispatcher::new(
        session,
        Box::new(renderer),
        events.clone(),
        logger.clone()
    ).with_source(source);

    if cli.spawn_mode == SpawnMode::Generative {
        let worker = GeneratorWorker::spawn(
            Box::new(PatternGenerator::new(cli.seed)),
            events,
            logger.clone()
        );
        dispatcher = dispatcher.with_generator(worker);
    }
    if cli.autoplay {
        dispatcher = dispatcher.with_autoplay(AutoPlayer::new(cli.lane_keys.len()));
    }
    Ok(dispatcher)
}

/// Play mode: decode a song, play it on the default output device and spawn notes from its
/// analysis. Keys come from stdin (or autoplay).
pub fn run_play(cli: &crate::Config, logger: Arc<Logger>) -> Result<()> {
    let path = Path::new(&cli.input_path);
    if !path.exists() {
        anyhow::bail!("Input file not found: {}", path.display());
    }

    let _ = log_info!(logger, "Decoding: {}", path.display());
    let audio = decode::load_mono(path)?;
    let _ = log_info!(
        logger,
        "Decoded: sr={} Hz, channels={}, {:.1}s",
        audio.sr,
        audio.channels,
        audio.duration_s()
    );
    let duration = audio.duration_s();
    let samples = Arc::new(audio.samples_mono);

    let clock = PlaybackClock::new(audio.sr);
    clock.set_running(false);
    let stream = build_output_stream(samples.clone(), clock.clone(), logger.clone())?;
    stream.play()?;

    let (tx, rx) = unbounded::<Event>();
    let quit = Arc::new(AtomicBool::new(false));
    install_quit_handler(quit.clone(), tx.clone());

    let source = SongSource::new(samples, clock.clone(), cli, logger.clone());
    let mut dispatcher = live_dispatcher(cli, Box::new(source), tx.clone(), logger.clone())?;

    if !cli.autoplay {
        input::spawn_stdin_reader(tx.clone(), logger.clone());
        let _ = log_info!(
            logger,
            "Lane keys: {} (type a key + Enter to tap, key+ / key- to hold, 'reset', 'quit')",
            cli.lane_keys.join(" ")
        );
    }

    dispatcher.start()?;
    let ticker = spawn_ticker(
        clock,
        cli.tick_hz,
        tx,
        quit.clone(),
        Some(duration + drain_seconds(cli))
    );

    dispatcher.run(&rx, &quit)?;
    quit.store(true, std::sync::atomic::Ordering::SeqCst);
    let _ = ticker.join();
    drop(stream);

    let _ = log_info!(logger, "play finished");
    Ok(())
}
