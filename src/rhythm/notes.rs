use anyhow::{ ensure, Result };

use super::NoteKind;

pub type NoteId = u64;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NoteBody {
    Normal {
        length: f32,
    },
    /// `holding` is set while the lane key keeps the note engaged.
    Hold {
        length: f32,
        holding: bool,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Note {
    pub id: NoteId,
    pub lane: usize,
    pub y: f32,
    pub fall_speed: f32,
    pub consumed: bool,
    pub body: NoteBody,
}

impl Note {
    pub fn kind(&self) -> NoteKind {
        match self.body {
            NoteBody::Normal { .. } => NoteKind::Normal,
            NoteBody::Hold { .. } => NoteKind::Hold,
        }
    }

    pub fn length(&self) -> f32 {
        match self.body {
            NoteBody::Normal { length } | NoteBody::Hold { length, .. } => length,
        }
    }

    pub fn is_holding(&self) -> bool {
        matches!(self.body, NoteBody::Hold { holding: true, .. })
    }
}

/// Notes removed by one sweep, split by outcome.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub cleared: usize,
    pub missed: usize,
}

/// Owns the live notes in spawn order.
pub struct NoteField {
    lane_count: usize,
    playfield_height: f32,
    hit_line_y: f32,
    hit_window: f32,
    default_fall_speed: f32,
    notes: Vec<Note>,
    next_id: NoteId,
}

impl NoteField {
    pub fn new(cfg: &crate::Config, lane_count: usize) -> Self {
        Self {
            lane_count,
            playfield_height: cfg.playfield_height,
            hit_line_y: cfg.hit_line_y,
            hit_window: cfg.hit_window,
            default_fall_speed: cfg.fall_speed,
            notes: Vec::new(),
            next_id: 0,
        }
    }

    /// Adds a note at the top of the playfield. A non-positive or non-finite `fall_speed`
    /// falls back to the configured default.
    pub fn spawn(
        &mut self,
        lane: usize,
        kind: NoteKind,
        length: f32,
        fall_speed: f32
    ) -> Result<NoteId> {
        ensure!(lane < self.lane_count, "lane {} out of range (lanes: {})", lane, self.lane_count);

        let id = self.next_id;
        self.next_id += 1;
        let fall_speed = if fall_speed > 0.0 && fall_speed.is_finite() {
            fall_speed
        } else {
            self.default_fall_speed
        };
        let body = match kind {
            NoteKind::Normal => NoteBody::Normal { length },
            NoteKind::Hold => NoteBody::Hold { length, holding: false },
        };
        self.notes.push(Note { id, lane, y: 0.0, fall_speed, consumed: false, body });
        Ok(id)
    }

    /// One render frame of movement.
    pub fn tick(&mut self) {
        for note in self.notes.iter_mut() {
            note.y += note.fall_speed;
        }
    }

    /// Drops notes that can no longer score. Hold notes whose head left the hit window
    /// without ever being engaged are marked consumed here so they expire normally.
    pub fn sweep(&mut self) -> SweepReport {
        let mut report = SweepReport::default();
        let (hit_line_y, hit_window, height) = (
            self.hit_line_y,
            self.hit_window,
            self.playfield_height,
        );

        for note in self.notes.iter_mut() {
            if let NoteBody::Hold { .. } = note.body {
                if !note.consumed && note.y - hit_line_y >= hit_window {
                    note.consumed = true;
                    report.missed += 1;
                }
            }
        }

        self.notes.retain(|note| {
            let remove = match note.body {
                NoteBody::Normal { .. } => note.consumed || note.y > height,
                NoteBody::Hold { length, .. } => note.consumed && note.y > hit_line_y + length,
            };
            if remove {
                match note.body {
                    NoteBody::Normal { .. } if !note.consumed => {
                        report.missed += 1;
                    }
                    _ => {
                        report.cleared += 1;
                    }
                }
            }
            !remove
        });
        report
    }

    pub fn live_notes(&self) -> &[Note] {
        &self.notes
    }

    pub(crate) fn notes_mut(&mut self) -> &mut [Note] {
        &mut self.notes
    }

    pub fn get(&self, id: NoteId) -> Option<&Note> {
        self.notes.iter().find(|n| n.id == id)
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn clear(&mut self) {
        self.notes.clear();
    }

    pub fn lane_count(&self) -> usize {
        self.lane_count
    }

    pub fn hit_line_y(&self) -> f32 {
        self.hit_line_y
    }

    pub fn hit_window(&self) -> f32 {
        self.hit_window
    }

    /// Ticks until a note spawned now sits exactly on the hit line.
    pub fn ticks_to_hit_line(&self, fall_speed: f32) -> u32 {
        let speed = if fall_speed > 0.0 { fall_speed } else { self.default_fall_speed };
        (self.hit_line_y / speed).ceil() as u32
    }
}
