use anyhow::Result;
use crossbeam_channel::unbounded;
use std::sync::{ atomic::{ AtomicBool, Ordering }, Arc };

use super::{ input, install_quit_handler, play::live_dispatcher, sources::MicSource, spawn_ticker };
use crate::logger::Logger;
use crate::rhythm::{ AudioAnalysisSource, Event };
use crate::log_info;

/// Listen mode: spawn notes from whatever the default microphone hears until ctrl+c or
/// `quit`.
pub fn run_listen(cli: &crate::Config, logger: Arc<Logger>) -> Result<()> {
    let mic = MicSource::open(cli, logger.clone())?;
    let clock = mic.clock();
    let _ = log_info!(
        logger,
        "listen: frame={} samples ({:.1} ms), feature={:?}, spawn={:?}",
        cli.frame_size,
        mic.frame_seconds() * 1000.0,
        cli.feature,
        cli.spawn_mode
    );

    let (tx, rx) = unbounded::<Event>();
    let quit = Arc::new(AtomicBool::new(false));
    install_quit_handler(quit.clone(), tx.clone());

    let mut dispatcher = live_dispatcher(cli, Box::new(mic), tx.clone(), logger.clone())?;
    if !cli.autoplay {
        input::spawn_stdin_reader(tx.clone(), logger.clone());
    }

    dispatcher.start()?;
    let ticker = spawn_ticker(clock, cli.tick_hz, tx, quit.clone(), None);

    dispatcher.run(&rx, &quit)?;
    quit.store(true, Ordering::SeqCst);
    let _ = ticker.join();

    let _ = log_info!(logger, "listen stopped");
    Ok(())
}
