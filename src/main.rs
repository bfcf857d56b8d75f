//! src/main.rs

use anyhow::Result;
use cpal::traits::{ DeviceTrait, HostTrait };
use crossbeam_channel::Sender;
use std::{ env, path::PathBuf, sync::Arc };

mod logger;
use logger::Logger;

use crate::logger::LogLevel;
use crate::rhythm::{ LanePolicy, PlaybackClock, SpawnMode };

mod mods;
mod rhythm;

// ───────────────────────────────────────────────────────────────────────────────
// features: per-frame loudness / onset strength fed to the rhythm core
// ───────────────────────────────────────────────────────────────────────────────
pub mod features {
    use realfft::{ RealFftPlanner, RealToComplex };
    use rustfft::num_complex::Complex32;
    use std::sync::Arc;

    use crate::rhythm::FeatureSample;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum FeatureKind {
        Rms,
        SpectralFlux,
    }

    impl FeatureKind {
        pub fn parse(s: &str) -> Option<Self> {
            match s.to_lowercase().as_str() {
                "rms" => Some(FeatureKind::Rms),
                "flux" | "spectral-flux" => Some(FeatureKind::SpectralFlux),
                _ => None,
            }
        }
    }

    #[inline]
    pub fn hann(n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| {
                let t = (std::f32::consts::PI * (i as f32)) / (n as f32);
                t.sin() * t.sin()
            })
            .collect()
    }

    #[inline]
    pub fn rms(x: &[f32]) -> f32 {
        let e =
            x
                .iter()
                .map(|v| v * v)
                .sum::<f32>() / (x.len().max(1) as f32);
        e.sqrt()
    }

    /// Positive magnitude change between consecutive hann-windowed frames, averaged over
    /// bins and normalised by the frame length so it sits in the same range as RMS.
    pub struct SpectralFlux {
        r2c: Arc<dyn RealToComplex<f32>>,
        window: Vec<f32>,
        inbuf: Vec<f32>,
        outbuf: Vec<Complex32>,
        prev: Vec<f32>,
    }

    impl SpectralFlux {
        pub fn new(frame_size: usize) -> Self {
            let mut planner = RealFftPlanner::<f32>::new();
            let r2c = planner.plan_fft_forward(frame_size);
            let outbuf = r2c.make_output_vec();
            let bins = outbuf.len();
            Self {
                r2c,
                window: hann(frame_size),
                inbuf: vec![0.0; frame_size],
                outbuf,
                prev: vec![0.0; bins],
            }
        }

        pub fn process(&mut self, frame: &[f32]) -> f32 {
            let n = self.window.len();
            for j in 0..n {
                let x = frame.get(j).copied().unwrap_or(0.0);
                self.inbuf[j] = x * self.window[j];
            }
            if self.r2c.process(&mut self.inbuf, &mut self.outbuf).is_err() {
                return 0.0;
            }
            let scale = 2.0 / (n as f32);
            let mut flux = 0.0f32;
            for (k, c) in self.outbuf.iter().enumerate() {
                let mag = c.norm() * scale;
                flux += (mag - self.prev[k]).max(0.0);
                self.prev[k] = mag;
            }
            flux / (self.outbuf.len() as f32).sqrt()
        }
    }

    pub enum Extractor {
        Rms,
        Flux(SpectralFlux),
    }

    impl Extractor {
        pub fn new(kind: FeatureKind, frame_size: usize) -> Self {
            match kind {
                FeatureKind::Rms => Extractor::Rms,
                FeatureKind::SpectralFlux => Extractor::Flux(SpectralFlux::new(frame_size)),
            }
        }

        pub fn process(&mut self, frame: &[f32]) -> f32 {
            match self {
                Extractor::Rms => rms(frame),
                Extractor::Flux(f) => f.process(frame),
            }
        }
    }

    /// Cuts an arbitrary stream of mono blocks into fixed frames and timestamps each frame
    /// by its first sample.
    pub struct Framer {
        extractor: Extractor,
        frame_size: usize,
        sample_rate: u32,
        pending: Vec<f32>,
        frames_out: u64,
    }

    impl Framer {
        pub fn new(kind: FeatureKind, frame_size: usize, sample_rate: u32) -> Self {
            let frame_size = frame_size.max(16);
            Self {
                extractor: Extractor::new(kind, frame_size),
                frame_size,
                sample_rate: sample_rate.max(1),
                pending: Vec::with_capacity(frame_size * 2),
                frames_out: 0,
            }
        }

        pub fn frame_seconds(&self) -> f32 {
            (self.frame_size as f32) / (self.sample_rate as f32)
        }

        pub fn push(&mut self, block: &[f32], mut emit: impl FnMut(FeatureSample)) {
            self.pending.extend_from_slice(block);
            let mut start = 0;
            while self.pending.len() - start >= self.frame_size {
                let frame = &self.pending[start..start + self.frame_size];
                let value = self.extractor.process(frame);
                let timestamp =
                    ((self.frames_out * (self.frame_size as u64)) as f64) /
                    (self.sample_rate as f64);
                emit(FeatureSample { value, timestamp });
                self.frames_out += 1;
                start += self.frame_size;
            }
            self.pending.drain(..start);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn sine(freq: f32, sr: u32, n: usize, amp: f32) -> Vec<f32> {
            (0..n)
                .map(|i| amp * ((2.0 * std::f32::consts::PI * freq * (i as f32)) / (sr as f32)).sin())
                .collect()
        }

        #[test]
        fn rms_of_sine_and_silence() {
            let x = sine(440.0, 44_100, 44_100, 1.0);
            assert!((rms(&x) - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-3);
            assert_eq!(rms(&[]), 0.0);
            assert_eq!(rms(&[0.0; 64]), 0.0);
        }

        #[test]
        fn framer_timestamps_across_blocks() {
            let mut framer = Framer::new(FeatureKind::Rms, 100, 1000);
            let mut out = Vec::new();
            framer.push(&[0.5; 150], |s| out.push(s));
            framer.push(&[0.5; 60], |s| out.push(s));
            assert_eq!(out.len(), 2);
            assert_eq!(out[0].timestamp, 0.0);
            assert_eq!(out[1].timestamp, 0.1);
            assert!((out[0].value - 0.5).abs() < 1e-6);
            assert_eq!(framer.frame_seconds(), 0.1);
        }

        #[test]
        fn flux_reacts_to_onsets_only() {
            let mut flux = SpectralFlux::new(1024);
            let silence = vec![0.0f32; 1024];
            let tone = sine(1000.0, 44_100, 1024, 0.8);
            assert_eq!(flux.process(&silence), 0.0);
            let onset = flux.process(&tone);
            let sustain = flux.process(&tone);
            assert!(onset > 0.01);
            assert!(sustain < onset * 0.01);
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// Decoder for WAV/MP3/MP4 (AAC) using symphonia (used by play/offline)
// ───────────────────────────────────────────────────────────────────────────────
pub mod decode {
    use std::{ fs::File, path::Path };
    use symphonia::core::{
        audio::SampleBuffer,
        codecs::DecoderOptions,
        errors::Error,
        formats::FormatOptions,
        io::MediaSourceStream,
        meta::MetadataOptions,
        probe::Hint,
    };
    use symphonia::default::{ get_codecs, get_probe };

    #[derive(Debug)]
    pub struct AudioData {
        pub sr: u32,
        pub channels: u16,
        pub samples_mono: Vec<f32>, // all channels averaged
    }

    impl AudioData {
        pub fn duration_s(&self) -> f64 {
            (self.samples_mono.len() as f64) / (self.sr.max(1) as f64)
        }
    }

    pub fn load_mono<P: AsRef<Path>>(path: P) -> anyhow::Result<AudioData> {
        let path_ref = path.as_ref();

        let file = File::open(path_ref)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path_ref.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default()
        )?;
        let mut format = probed.format;

        let (track_id, codec_params) = {
            let track = format
                .default_track()
                .ok_or_else(|| anyhow::anyhow!("no default audio track found"))?;
            (track.id, track.codec_params.clone())
        };

        let mut decoder = get_codecs().make(&codec_params, &DecoderOptions::default())?;

        let sr = codec_params.sample_rate.ok_or_else(|| anyhow::anyhow!("unknown sample rate"))?;
        let channels = codec_params.channels.map(|c| c.count() as u16).unwrap_or(1u16);

        let mut sample_buf: Option<SampleBuffer<f32>> = None;
        let mut mono = Vec::<f32>::new();

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(Error::ResetRequired) => {
                    decoder.reset();
                    continue;
                }
                Err(Error::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(err) => {
                    return Err(err.into());
                }
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(Error::DecodeError(_)) => {
                    continue;
                }
                Err(err) => {
                    return Err(err.into());
                }
            };

            let spec = *decoded.spec();
            let chan_count = spec.channels.count().max(1);

            if
                sample_buf
                    .as_ref()
                    .map(|b| b.capacity() < decoded.capacity())
                    .unwrap_or(true)
            {
                sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
            }
            let Some(buf) = sample_buf.as_mut() else {
                continue;
            };

            buf.copy_interleaved_ref(decoded);
            downmix_into(buf.samples(), chan_count, &mut mono);
        }

        Ok(AudioData { sr, channels, samples_mono: mono })
    }

    pub fn downmix_into(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
        if channels <= 1 {
            out.extend_from_slice(interleaved);
            return;
        }
        for frame in interleaved.chunks_exact(channels) {
            out.push(frame.iter().sum::<f32>() / (channels as f32));
        }
    }

}

// ───────────────────────────────────────────────────────────────────────────────
// CLI config + parsing
// ───────────────────────────────────────────────────────────────────────────────
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Play,
    Listen,
    Offline,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mode: Mode,
    pub spawn_mode: SpawnMode,
    pub feature: features::FeatureKind,
    pub lane_policy: Option<LanePolicy>,
    pub lane_keys: Vec<String>,

    // analysis / tempo
    pub frame_size: usize,
    pub sample_rate_hz: u32,
    pub tempo_window_s: f32,
    pub peak_thr: f32,
    pub default_bpm: f32,
    pub min_bpm: f32,
    pub max_bpm: f32,

    // spawning
    pub loudness_thr: f32,
    pub spacing_factor: f64,
    pub hold_prob: f32,
    pub hold_length: f32,
    pub normal_length: f32,
    pub fall_speed: f32,

    // playfield / judging
    pub playfield_height: f32,
    pub hit_line_y: f32,
    pub hit_window: f32,
    pub hit_points: u64,
    pub hold_tick_points: u64,
    pub hold_release_bonus: Option<f32>,

    // generative mode
    pub gen_steps: u32,
    pub gen_temperature: f32,
    pub gen_low_water: usize,
    pub steps_per_quarter: u32,

    // runtime
    pub tick_hz: u32,
    pub autoplay: bool,
    pub seed: Option<u64>,
    pub status_every_ticks: u64,

    // paths
    pub input_path: String,
    pub chart_path: String,
    pub log_path: String,

    pub log_level: LogLevel,
    pub quiet: bool,
}

impl Default for Config {
    fn default() -> Self {
        let build_dir = env
            ::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("build");
        let default_log = build_dir.join("beat-lanes.log").to_string_lossy().into_owned();
        let default_chart = build_dir.join("chart.csv").to_string_lossy().into_owned();

        Self {
            mode: Mode::Play,
            spawn_mode: SpawnMode::Loudness,
            feature: features::FeatureKind::Rms,
            lane_policy: None,
            lane_keys: ["a", "s", "k", "l"]
                .iter()
                .map(|s| s.to_string())
                .collect(),

            frame_size: 1024,
            sample_rate_hz: 44_100,
            tempo_window_s: 30.0,
            peak_thr: 0.08,
            default_bpm: 120.0,
            min_bpm: 30.0,
            max_bpm: 300.0,

            loudness_thr: 0.05,
            spacing_factor: 0.9,
            hold_prob: 0.2,
            hold_length: 80.0,
            normal_length: 30.0,
            fall_speed: 4.0,

            playfield_height: 600.0,
            hit_line_y: 540.0,
            hit_window: 40.0,
            hit_points: 100,
            hold_tick_points: 1,
            hold_release_bonus: None,

            gen_steps: 128,
            gen_temperature: 1.0,
            gen_low_water: 8,
            steps_per_quarter: 4,

            tick_hz: 60,
            autoplay: false,
            seed: None,
            status_every_ticks: 120,

            input_path: String::new(),
            chart_path: default_chart,
            log_path: default_log,

            log_level: LogLevel::Info,
            quiet: false,
        }
    }
}

impl Config {
    /// Lane strategy in effect: explicit `--lanes`, else pitch lanes for generated notes and
    /// uniform random lanes for loudness spawns.
    pub fn resolved_lane_policy(&self) -> LanePolicy {
        match (self.lane_policy, self.spawn_mode) {
            (Some(p), _) => p,
            (None, SpawnMode::Generative) => LanePolicy::Pitch,
            (None, SpawnMode::Loudness) => LanePolicy::Uniform,
        }
    }

    pub fn validate(&self) -> Result<()> {
        use anyhow::ensure;

        ensure!(!self.lane_keys.is_empty(), "at least one lane key is required");
        for (i, k) in self.lane_keys.iter().enumerate() {
            ensure!(!k.trim().is_empty(), "lane key {} is empty", i);
            ensure!(
                !self.lane_keys[..i].iter().any(|p| p.eq_ignore_ascii_case(k)),
                "lane key '{}' is listed twice",
                k
            );
        }
        ensure!(self.frame_size >= 16, "--frame-size must be at least 16 (got {})", self.frame_size);
        ensure!(self.sample_rate_hz > 0, "--sample-rate must be positive");
        ensure!(self.tempo_window_s > 0.0, "--tempo-window-s must be positive");
        ensure!(
            self.min_bpm > 0.0 && self.min_bpm <= self.max_bpm,
            "bpm range [{}, {}] is invalid",
            self.min_bpm,
            self.max_bpm
        );
        ensure!(
            self.default_bpm >= self.min_bpm && self.default_bpm <= self.max_bpm,
            "default bpm {} outside [{}, {}]",
            self.default_bpm,
            self.min_bpm,
            self.max_bpm
        );
        ensure!((0.0..=1.0).contains(&self.hold_prob), "--hold-prob must be in [0, 1]");
        ensure!(self.spacing_factor > 0.0, "spacing factor must be positive");
        ensure!(self.fall_speed > 0.0, "--fall-speed must be positive");
        ensure!(self.hit_window > 0.0, "--hit-window must be positive");
        ensure!(
            self.hit_line_y > 0.0 && self.hit_line_y + self.hit_window <= self.playfield_height,
            "hit line {} ± {} does not fit a playfield of height {}",
            self.hit_line_y,
            self.hit_window,
            self.playfield_height
        );
        if let Some(div) = self.hold_release_bonus {
            ensure!(div > 0.0 && div.is_finite(), "--hold-release-bonus must be positive");
        }
        ensure!(self.gen_steps > 0, "--gen-steps must be positive");
        ensure!(self.gen_temperature > 0.0, "--gen-temperature must be positive");
        ensure!(self.tick_hz > 0 && self.tick_hz <= 1000, "--tick-hz must be in 1..=1000");
        if matches!(self.mode, Mode::Play | Mode::Offline) {
            ensure!(
                !self.input_path.is_empty(),
                "--input <PATH> is required in {:?} mode",
                self.mode
            );
        }
        Ok(())
    }

    pub fn frame_seconds(&self, sample_rate: u32) -> f32 {
        (self.frame_size as f32) / (sample_rate.max(1) as f32)
    }
}

fn print_usage(cfg: &Config) {
    println!("Usage: beat-lanes [OPTIONS]\n");
    println!("Modes:");
    println!("  --mode play           (default) Play a song file with live lanes on stdin");
    println!("  --mode listen         Spawn notes from the default microphone");
    println!("  --mode offline        Simulate a song headlessly and write the chart CSV\n");

    println!("General:");
    println!("  --input <PATH>                Audio file (.wav/.mp3/.mp4/.m4a/.flac)");
    println!("  --log-path <PATH>             Log file (default: {})", cfg.log_path);
    println!("  --chart-path <PATH>           (offline) Chart CSV (default: {})", cfg.chart_path);
    println!(
        "  --log-level <LEVEL>           Log level: debug, info, warning, error (default: info)"
    );
    println!("  --quiet                       Do not mirror log lines to stderr");
    println!("  --autoplay                    Let the game press the keys");
    println!("  --seed <N>                    Seed lane/kind choices and the pattern generator\n");

    println!("Spawning:");
    println!("  --spawn-mode <loudness|generative>  Note source (default: loudness)");
    println!("  --feature <rms|flux>          Analysis feature (default: rms)");
    println!("  --lanes <uniform|pitch>       Lane strategy (default: uniform, pitch when generative)");
    println!(
        "  --lane-keys <K1,K2,..>        Lane tokens in order (default: {})",
        cfg.lane_keys.join(",")
    );
    println!(
        "  --loudness-thr <VAL>          Spawn threshold on the feature (default: {:.2})",
        cfg.loudness_thr
    );
    println!("  --hold-prob <FRAC>            Hold note probability (default: {:.2})", cfg.hold_prob);
    println!("  --fall-speed <PX>             Pixels per tick (default: {:.1})", cfg.fall_speed);
    println!("  --hit-window <PX>             Half-width of the hit window (default: {:.0})", cfg.hit_window);
    println!("  --hold-release-bonus <DIV>    Pay round(length / DIV) on hold release (default: off)\n");

    println!("Analysis / tempo:");
    println!("  --frame-size <N>              Samples per analysis frame (default: {})", cfg.frame_size);
    println!("  --sample-rate, --sr <HZ>      (listen) Microphone rate (default: {})", cfg.sample_rate_hz);
    println!("  --peak-thr <VAL>              Tempo peak threshold (default: {:.2})", cfg.peak_thr);
    println!("  --tempo-window-s <SEC>        Tempo window (default: {:.0})", cfg.tempo_window_s);
    println!("  --tick-hz <HZ>                Render ticks per second (default: {})", cfg.tick_hz);
    println!("  --status-every <TICKS>        Status line interval (default: {})\n", cfg.status_every_ticks);

    println!("Generative mode:");
    println!("  --gen-steps <N>               Steps per continuation (default: {})", cfg.gen_steps);
    println!("  --gen-temperature <T>         Sampling temperature (default: {:.1})", cfg.gen_temperature);

    println!("\nKeys while playing (type + Enter): a = tap, a+ = press, a- = release, reset, quit");
    println!("\nExamples:");
    println!("  beat-lanes --mode play --input song.mp3");
    println!("  beat-lanes --mode listen --feature flux --lanes pitch");
    println!("  beat-lanes --mode offline --input song.wav --spawn-mode generative --seed 7");
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> std::result::Result<&'a str, String> {
    args.get(i + 1)
        .map(|s| s.as_str())
        .ok_or_else(|| format!("Missing value for {}", flag))
}

fn number<T: std::str::FromStr>(
    args: &[String],
    i: usize,
    flag: &str
) -> std::result::Result<T, String> {
    let raw = value(args, i, flag)?;
    raw.parse::<T>().map_err(|_| format!("Invalid {} value: {}", flag.trim_start_matches('-'), raw))
}

fn parse_arguments(args: &[String]) -> std::result::Result<Config, String> {
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                return Err("help requested".to_string());
            }
            "--mode" => {
                config.mode = match value(args, i, "--mode")?.to_lowercase().as_str() {
                    "play" => Mode::Play,
                    "listen" | "mic" => Mode::Listen,
                    "offline" => Mode::Offline,
                    other => {
                        return Err(format!("Unknown mode: {}", other));
                    }
                };
                i += 2;
            }
            "--spawn-mode" => {
                let v = value(args, i, "--spawn-mode")?;
                config.spawn_mode = SpawnMode::parse(v).ok_or_else(||
                    format!("Unknown spawn mode: {}", v)
                )?;
                i += 2;
            }
            "--feature" => {
                let v = value(args, i, "--feature")?;
                config.feature = features::FeatureKind
                    ::parse(v)
                    .ok_or_else(|| format!("Unknown feature: {}", v))?;
                i += 2;
            }
            "--lanes" => {
                config.lane_policy = match value(args, i, "--lanes")?.to_lowercase().as_str() {
                    "uniform" | "random" => Some(LanePolicy::Uniform),
                    "pitch" => Some(LanePolicy::Pitch),
                    other => {
                        return Err(format!("Unknown lane strategy: {}", other));
                    }
                };
                i += 2;
            }
            "--lane-keys" => {
                config.lane_keys = value(args, i, "--lane-keys")?
                    .split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect();
                i += 2;
            }
            "--input" => {
                config.input_path = value(args, i, "--input")?.to_string();
                i += 2;
            }
            "--chart-path" => {
                config.chart_path = value(args, i, "--chart-path")?.to_string();
                i += 2;
            }
            "--log-path" => {
                config.log_path = value(args, i, "--log-path")?.to_string();
                i += 2;
            }
            "--log-level" => {
                let v = value(args, i, "--log-level")?;
                config.log_level = LogLevel::parse(v).ok_or_else(||
                    format!("Invalid log level: {}. Valid options: debug, info, warning, error", v)
                )?;
                i += 2;
            }
            "--quiet" => {
                config.quiet = true;
                i += 1;
            }
            "--autoplay" => {
                config.autoplay = true;
                i += 1;
            }
            "--seed" => {
                config.seed = Some(number(args, i, "--seed")?);
                i += 2;
            }
            "--loudness-thr" => {
                config.loudness_thr = number(args, i, "--loudness-thr")?;
                i += 2;
            }
            "--peak-thr" => {
                config.peak_thr = number(args, i, "--peak-thr")?;
                i += 2;
            }
            "--hold-prob" => {
                config.hold_prob = number::<f32>(args, i, "--hold-prob")?.clamp(0.0, 1.0);
                i += 2;
            }
            "--fall-speed" => {
                config.fall_speed = number(args, i, "--fall-speed")?;
                i += 2;
            }
            "--hit-window" => {
                config.hit_window = number(args, i, "--hit-window")?;
                i += 2;
            }
            "--hold-release-bonus" => {
                config.hold_release_bonus = Some(number(args, i, "--hold-release-bonus")?);
                i += 2;
            }
            "--frame-size" => {
                config.frame_size = number(args, i, "--frame-size")?;
                i += 2;
            }
            "--sample-rate" | "--sr" => {
                config.sample_rate_hz = number(args, i, "--sample-rate")?;
                i += 2;
            }
            "--tempo-window-s" => {
                config.tempo_window_s = number(args, i, "--tempo-window-s")?;
                i += 2;
            }
            "--tick-hz" => {
                config.tick_hz = number::<u32>(args, i, "--tick-hz")?.max(1);
                i += 2;
            }
            "--status-every" => {
                config.status_every_ticks = number(args, i, "--status-every")?;
                i += 2;
            }
            "--gen-steps" => {
                config.gen_steps = number(args, i, "--gen-steps")?;
                i += 2;
            }
            "--gen-temperature" => {
                config.gen_temperature = number(args, i, "--gen-temperature")?;
                i += 2;
            }
            other => {
                return Err(format!("Unknown argument: {}", other));
            }
        }
    }

    Ok(config)
}

// ───────────────────────────────────────────────────────────────────────────────
// Shared audio helpers used by play/listen
// ───────────────────────────────────────────────────────────────────────────────
pub fn build_input_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    tx: Sender<Vec<f32>>,
    logger: Arc<Logger>
) -> Result<cpal::Stream> {
    let err_logger = logger.clone();
    let err_fn = move |e| {
        let _ = err_logger.error(&format!("audio input stream error: {}", e));
    };

    match device.default_input_config()?.sample_format() {
        cpal::SampleFormat::F32 => {
            let tx = tx.clone();
            Ok(
                device.build_input_stream(
                    config,
                    move |data: &[f32], _| on_audio_input_mono(data, channels, &tx),
                    err_fn,
                    None
                )?
            )
        }
        cpal::SampleFormat::I16 => {
            let tx = tx.clone();
            Ok(
                device.build_input_stream(
                    config,
                    move |data: &[i16], _| {
                        let tmp: Vec<f32> = data
                            .iter()
                            .map(|&s| (s as f32) / 32768.0)
                            .collect();
                        on_audio_input_mono(&tmp, channels, &tx);
                    },
                    err_fn,
                    None
                )?
            )
        }
        cpal::SampleFormat::U16 => {
            let tx = tx.clone();
            Ok(
                device.build_input_stream(
                    config,
                    move |data: &[u16], _| {
                        let tmp: Vec<f32> = data
                            .iter()
                            .map(|&s| ((s as f32) / 65535.0) * 2.0 - 1.0)
                            .collect();
                        on_audio_input_mono(&tmp, channels, &tx);
                    },
                    err_fn,
                    None
                )?
            )
        }
        _ => anyhow::bail!("Unsupported sample format"),
    }
}

fn on_audio_input_mono(data: &[f32], channels: usize, tx: &Sender<Vec<f32>>) {
    let mut mono = Vec::with_capacity(data.len() / channels.max(1));
    decode::downmix_into(data, channels, &mut mono);
    // a full queue means the analysis thread is behind; drop the block
    let _ = tx.try_send(mono);
}

pub fn maybe_rate_supported(device: &cpal::Device, want: u32) -> Option<u32> {
    if let Ok(mut configs) = device.supported_input_configs() {
        for c in configs.by_ref() {
            let r = c.min_sample_rate().0..=c.max_sample_rate().0;
            if r.contains(&want) {
                return Some(want);
            }
        }
    }
    None
}

/// Plays `samples` (mono) on the default output device. The read position is the clock's
/// frame count, so rewinding the clock restarts the song; a paused clock plays silence.
pub fn build_output_stream(
    samples: Arc<Vec<f32>>,
    clock: PlaybackClock,
    logger: Arc<Logger>
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow::anyhow!("No default output device"))?;
    let mut cfg = device.default_output_config()?.config();
    cfg.sample_rate.0 = clock.sample_rate();
    let channels = (cfg.channels as usize).max(1);

    let _ = log_info!(
        logger,
        "Output device: {} ({} Hz, {} ch)",
        device.name().unwrap_or_default(),
        cfg.sample_rate.0,
        channels
    );

    let err_logger = logger.clone();
    let err_fn = move |e| {
        let _ = err_logger.error(&format!("audio output stream error: {}", e));
    };

    // fills one device buffer and advances the clock by the frames it covered
    let fill = move |out_frames: usize, write: &mut dyn FnMut(usize, f32)| {
        if !clock.is_running() {
            for f in 0..out_frames {
                write(f, 0.0);
            }
            return;
        }
        let start = clock.frames() as usize;
        for f in 0..out_frames {
            write(f, samples.get(start + f).copied().unwrap_or(0.0));
        }
        clock.advance(out_frames as u64);
    };

    let stream = match device.default_output_config()?.sample_format() {
        cpal::SampleFormat::F32 =>
            device.build_output_stream(
                &cfg,
                move |out: &mut [f32], _| {
                    let frames = out.len() / channels;
                    fill(frames, &mut |f, s| {
                        out[f * channels..(f + 1) * channels].fill(s);
                    });
                },
                err_fn,
                None
            )?,
        cpal::SampleFormat::I16 =>
            device.build_output_stream(
                &cfg,
                move |out: &mut [i16], _| {
                    let frames = out.len() / channels;
                    fill(frames, &mut |f, s| {
                        let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
                        out[f * channels..(f + 1) * channels].fill(v);
                    });
                },
                err_fn,
                None
            )?,
        cpal::SampleFormat::U16 =>
            device.build_output_stream(
                &cfg,
                move |out: &mut [u16], _| {
                    let frames = out.len() / channels;
                    fill(frames, &mut |f, s| {
                        let v = ((s.clamp(-1.0, 1.0) * 0.5 + 0.5) * 65535.0) as u16;
                        out[f * channels..(f + 1) * channels].fill(v);
                    });
                },
                err_fn,
                None
            )?,
        _ => anyhow::bail!("Unsupported output format"),
    };
    Ok(stream)
}

// ───────────────────────────────────────────────────────────────────────────────
// main
// ───────────────────────────────────────────────────────────────────────────────
fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let cli = match parse_arguments(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {}\n", e);
            print_usage(&Config::default());
            std::process::exit(1);
        }
    };
    if let Err(e) = cli.validate() {
        eprintln!("error: {:#}\n", e);
        print_usage(&cli);
        std::process::exit(1);
    }

    let logger = Arc::new(
        Logger::new_with_level(&cli.log_path, true, cli.log_level)?.with_echo(!cli.quiet)
    );
    let _ = log_info!(logger, "beat-lanes starting: mode={:?} log={}", cli.mode, cli.log_path);

    match cli.mode {
        Mode::Play => mods::play::run_play(&cli, logger),
        Mode::Listen => mods::listen::run_listen(&cli, logger),
        Mode::Offline => mods::offline::run_offline(&cli, logger).map(|_| ()),
    }
}
