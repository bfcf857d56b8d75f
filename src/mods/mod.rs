pub mod input;
pub mod listen;
pub mod offline;
pub mod play;
pub mod render;
pub mod sources;

use crossbeam_channel::Sender;
use std::{
    sync::{ atomic::{ AtomicBool, Ordering }, Arc },
    thread,
    time::{ Duration, Instant },
};

use crate::rhythm::{ Event, PlaybackClock };

/// ctrl+c raises `quit` and wakes the dispatcher with a shutdown event.
pub fn install_quit_handler(quit: Arc<AtomicBool>, events: Sender<Event>) {
    let _ = ctrlc::set_handler(move || {
        quit.store(true, Ordering::SeqCst);
        let _ = events.send(Event::Shutdown);
    });
}

/// Sends `Event::Tick` at `tick_hz`, stamped with the clock's playback time. With `end_at`
/// set, sends `Event::Shutdown` once the clock passes it.
pub fn spawn_ticker(
    clock: PlaybackClock,
    tick_hz: u32,
    events: Sender<Event>,
    quit: Arc<AtomicBool>,
    end_at: Option<f64>
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let period = Duration::from_secs_f64(1.0 / (tick_hz.max(1) as f64));
        let mut next = Instant::now();
        while !quit.load(Ordering::SeqCst) {
            next += period;

            let now = clock.seconds();
            if events.send(Event::Tick { now }).is_err() {
                break;
            }
            if end_at.is_some_and(|end| now >= end) {
                let _ = events.send(Event::Shutdown);
                break;
            }

            let wall = Instant::now();
            if next > wall {
                thread::sleep(next - wall);
            } else {
                next = wall;
            }
        }
    })
}

/// Seconds a note needs to fall through the whole playfield plus a hold tail.
pub fn drain_seconds(cli: &crate::Config) -> f64 {
    let px = (cli.playfield_height + cli.hold_length) as f64;
    px / (cli.fall_speed.max(0.1) as f64) / (cli.tick_hz.max(1) as f64)
}
