pub mod autoplay;
pub mod events;
pub mod generator;
pub mod hits;
pub mod keys;
pub mod notes;
pub mod scheduler;
pub mod score;
pub mod session;
pub mod tempo;

pub use autoplay::AutoPlayer;
pub use events::{ AudioAnalysisSource, Dispatcher, Event, Flow, PlaybackClock, Renderer };
pub use generator::{ GeneratorWorker, PatternGenerator, PredictedNote, SequenceGenerator };
pub use notes::{ Note, NoteBody, NoteId };
pub use scheduler::LanePolicy;
pub use session::{ Frame, Session, SpawnedNote, Stats };

/// One analysis frame: a non-negative loudness-like value and the stream time (seconds) of
/// the frame start.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FeatureSample {
    pub value: f32,
    pub timestamp: f64,
}

impl FeatureSample {
    pub fn is_valid(&self) -> bool {
        self.value.is_finite() && self.value >= 0.0 && self.timestamp.is_finite()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoteKind {
    Normal,
    Hold,
}

/// Where spawns come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpawnMode {
    /// Loud analysis frames, gated by the beat spacing.
    Loudness,
    /// Notes predicted by a sequence generator, released at their scheduled time.
    Generative,
}

impl SpawnMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "loudness" | "loud" => Some(SpawnMode::Loudness),
            "generative" | "gen" => Some(SpawnMode::Generative),
            _ => None,
        }
    }
}
