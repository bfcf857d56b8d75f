use anyhow::Result;
use cpal::traits::{ DeviceTrait, HostTrait, StreamTrait };
use crossbeam_channel::{ bounded, RecvTimeoutError, Sender };
use std::{
    sync::{ atomic::{ AtomicBool, Ordering }, Arc },
    thread::{ self, JoinHandle },
    time::Duration,
};

use crate::features::{ FeatureKind, Framer };
use crate::logger::Logger;
use crate::rhythm::{ AudioAnalysisSource, Event, PlaybackClock };
use crate::{ build_input_stream, log_debug, log_info, log_warn, maybe_rate_supported };

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn halt(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.handle.join();
    }
}

/// Analyses a decoded song in step with its playback. Frames are emitted once the output
/// callback has played past them, so spawn times line up with what is heard.
pub struct SongSource {
    samples: Arc<Vec<f32>>,
    feature: FeatureKind,
    frame_size: usize,
    clock: PlaybackClock,
    worker: Option<Worker>,
    logger: Arc<Logger>,
}

impl SongSource {
    pub fn new(
        samples: Arc<Vec<f32>>,
        clock: PlaybackClock,
        cli: &crate::Config,
        logger: Arc<Logger>
    ) -> Self {
        Self {
            samples,
            feature: cli.feature,
            frame_size: cli.frame_size,
            clock,
            worker: None,
            logger,
        }
    }
}

impl AudioAnalysisSource for SongSource {
    fn start(&mut self, token: u64, events: Sender<Event>) -> Result<()> {
        self.stop();
        self.clock.rewind();
        self.clock.set_running(true);

        let stop = Arc::new(AtomicBool::new(false));
        let samples = self.samples.clone();
        let clock = self.clock.clone();
        let mut framer = Framer::new(self.feature, self.frame_size, clock.sample_rate());
        let frame_size = self.frame_size.max(16);
        let logger = self.logger.clone();
        let stop_flag = stop.clone();

        let handle = thread::spawn(move || {
            let mut pos = 0usize;
            while !stop_flag.load(Ordering::SeqCst) && pos < samples.len() {
                let played = (clock.frames() as usize).min(samples.len());
                while pos + frame_size <= played {
                    framer.push(&samples[pos..pos + frame_size], |sample| {
                        let _ = events.send(Event::Feature { token, sample });
                    });
                    pos += frame_size;
                }
                if played >= samples.len() {
                    break;
                }
                thread::sleep(Duration::from_millis(5));
            }
            let _ = log_debug!(logger, "song analysis finished at sample {} (token {})", pos, token);
        });

        self.worker = Some(Worker { stop, handle });
        Ok(())
    }

    fn stop(&mut self) {
        self.clock.set_running(false);
        if let Some(w) = self.worker.take() {
            w.halt();
        }
    }

    fn clock(&self) -> PlaybackClock {
        self.clock.clone()
    }

    fn frame_seconds(&self) -> f32 {
        (self.frame_size as f32) / (self.clock.sample_rate() as f32)
    }

    fn name(&self) -> &str {
        "song"
    }
}

/// Default microphone. The capture callback hands mono blocks to an analysis thread which
/// frames them and advances the clock by what it has consumed.
pub struct MicSource {
    device: cpal::Device,
    config: cpal::StreamConfig,
    feature: FeatureKind,
    frame_size: usize,
    clock: PlaybackClock,
    stream: Option<cpal::Stream>,
    worker: Option<Worker>,
    logger: Arc<Logger>,
}

impl MicSource {
    pub fn open(cli: &crate::Config, logger: Arc<Logger>) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| anyhow::anyhow!("No default input device"))?;
        let mut config = device.default_input_config()?.config();
        if let Some(sr) = maybe_rate_supported(&device, cli.sample_rate_hz) {
            config.sample_rate.0 = sr;
        } else {
            let _ = log_warn!(
                logger,
                "Mic does not support {} Hz, using {} Hz",
                cli.sample_rate_hz,
                config.sample_rate.0
            );
        }

        let _ = log_info!(
            logger,
            "Mic device: {} ({} Hz, {} ch)",
            device.name().unwrap_or_default(),
            config.sample_rate.0,
            config.channels
        );

        let clock = PlaybackClock::new(config.sample_rate.0);
        Ok(Self {
            device,
            config,
            feature: cli.feature,
            frame_size: cli.frame_size,
            clock,
            stream: None,
            worker: None,
            logger,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }
}

impl AudioAnalysisSource for MicSource {
    fn start(&mut self, token: u64, events: Sender<Event>) -> Result<()> {
        self.stop();
        self.clock.rewind();
        self.clock.set_running(true);

        let (tx_mic, rx_mic) = bounded::<Vec<f32>>(8);
        let channels = self.config.channels.max(1) as usize;
        let stream = build_input_stream(
            &self.device,
            &self.config,
            channels,
            tx_mic,
            self.logger.clone()
        )?;
        stream.play()?;
        self.stream = Some(stream);

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let clock = self.clock.clone();
        let mut framer = Framer::new(self.feature, self.frame_size, clock.sample_rate());
        let handle = thread::spawn(move || {
            while !stop_flag.load(Ordering::SeqCst) {
                match rx_mic.recv_timeout(Duration::from_millis(50)) {
                    Ok(block) => {
                        framer.push(&block, |sample| {
                            let _ = events.send(Event::Feature { token, sample });
                        });
                        clock.advance(block.len() as u64);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        break;
                    }
                }
            }
        });
        self.worker = Some(Worker { stop, handle });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
        }
        self.clock.set_running(false);
        if let Some(w) = self.worker.take() {
            w.halt();
        }
    }

    fn clock(&self) -> PlaybackClock {
        self.clock.clone()
    }

    fn frame_seconds(&self) -> f32 {
        (self.frame_size as f32) / (self.sample_rate() as f32)
    }

    fn name(&self) -> &str {
        "microphone"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn song_source_follows_the_clock() {
        let mut cli = crate::Config::default();
        cli.frame_size = 100;
        let samples = Arc::new(vec![0.5f32; 1000]);
        let clock = PlaybackClock::new(1000);
        let mut src = SongSource::new(samples, clock.clone(), &cli, Arc::new(Logger::disabled()));
        let (tx, rx) = unbounded();

        src.start(7, tx).unwrap();
        // nothing played yet: nothing analysed
        thread::sleep(Duration::from_millis(30));
        assert_eq!(rx.try_iter().count(), 0);

        clock.advance(1000);
        src.worker.take().unwrap().handle.join().unwrap();
        let got: Vec<Event> = rx.try_iter().collect();
        assert_eq!(got.len(), 10);
        match &got[3] {
            Event::Feature { token, sample } => {
                assert_eq!(*token, 7);
                assert!((sample.timestamp - 0.3).abs() < 1e-9);
                assert!((sample.value - 0.5).abs() < 1e-6);
            }
            other => panic!("unexpected {:?}", other),
        }
        src.stop();
        assert!(!clock.is_running());
    }

    #[test]
    fn restart_rewinds_and_retags() {
        let mut cli = crate::Config::default();
        cli.frame_size = 100;
        let clock = PlaybackClock::new(1000);
        let mut src = SongSource::new(
            Arc::new(vec![0.1f32; 500]),
            clock.clone(),
            &cli,
            Arc::new(Logger::disabled())
        );
        let (tx, rx) = unbounded();
        src.start(1, tx.clone()).unwrap();
        clock.advance(250);
        src.stop();
        src.start(2, tx).unwrap();
        assert_eq!(clock.frames(), 0);
        clock.advance(500);
        src.worker.take().unwrap().handle.join().unwrap();

        let tokens: Vec<u64> = rx
            .try_iter()
            .filter_map(|e| match e {
                Event::Feature { token, .. } => Some(token),
                _ => None,
            })
            .collect();
        assert_eq!(tokens.iter().filter(|t| **t == 2).count(), 5);
        assert!(tokens.iter().filter(|t| **t == 1).count() <= 2);
    }
}
