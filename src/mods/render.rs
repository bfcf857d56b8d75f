use anyhow::Result;
use std::sync::Arc;

use crate::logger::Logger;
use crate::rhythm::{ Frame, NoteBody, Renderer, SpawnedNote };
use crate::{ log_debug, log_info };

/// Text playfield: one status line every `every` ticks through the logger, spawns at debug.
pub struct LogRenderer {
    every: u64,
    rows: usize,
    logger: Arc<Logger>,
}

impl LogRenderer {
    pub fn new(every: u64, logger: Arc<Logger>) -> Self {
        Self { every: every.max(1), rows: 8, logger }
    }
}

/// Coarse ASCII picture of the field: one column per lane, `rows` rows from the top down to
/// just past the hit line. `o` normal, `H` hold, `=` engaged hold, `-` hit line.
pub fn draw_lanes(frame: &Frame, rows: usize) -> Vec<String> {
    let lanes = frame.keys.lane_count();
    let bottom = frame.hit_line_y + frame.hit_window;
    let row_h = bottom / (rows.max(1) as f32);
    let hit_row = ((frame.hit_line_y / row_h) as usize).min(rows.saturating_sub(1));

    let mut grid = vec![vec![' '; lanes]; rows];
    grid[hit_row].iter_mut().for_each(|c| {
        *c = '-';
    });
    for n in frame.notes {
        if n.lane >= lanes || n.y < 0.0 || n.y >= bottom {
            continue;
        }
        let row = ((n.y / row_h) as usize).min(rows - 1);
        grid[row][n.lane] = match n.body {
            NoteBody::Normal { .. } => 'o',
            NoteBody::Hold { holding: true, .. } => '=',
            NoteBody::Hold { .. } => 'H',
        };
    }
    grid.into_iter()
        .map(|row| {
            let cells: Vec<String> = row
                .iter()
                .map(|c| c.to_string())
                .collect();
            format!("|{}|", cells.join(" "))
        })
        .collect()
}

fn key_strip(frame: &Frame) -> String {
    (0..frame.keys.lane_count())
        .map(|lane| {
            if frame.keys.is_pressed(lane) {
                frame.keys.token_of(lane).unwrap_or("?").to_uppercase()
            } else {
                ".".to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl Renderer for LogRenderer {
    fn render(&mut self, frame: &Frame) {
        if frame.tick % self.every != 0 {
            return;
        }
        let _ = log_info!(
            self.logger,
            "t={:.2}s bpm={:.0} score={} notes={} keys=[{}] hits={} holds={} missed={}",
            frame.now,
            frame.bpm,
            frame.score,
            frame.notes.len(),
            key_strip(frame),
            frame.stats.hits,
            frame.stats.holds_engaged,
            frame.stats.missed
        );
        for line in draw_lanes(frame, self.rows) {
            let _ = log_debug!(self.logger, "{}", line);
        }
    }

    fn on_spawn(&mut self, note: &SpawnedNote) {
        let _ = log_debug!(
            self.logger,
            "note {} -> lane {} ({:?}, len {:.0}) at {:.2}s",
            note.id,
            note.decision.lane,
            note.decision.kind,
            note.decision.length,
            note.time
        );
    }

    fn on_reset(&mut self, token: u64) {
        let _ = log_info!(self.logger, "--- reset (run {}) ---", token);
    }

    fn finish(&mut self, frame: &Frame) -> Result<()> {
        let _ = log_info!(
            self.logger,
            "final score {} after {:.1}s: {} hits, {} holds, {} missed, {} empty presses",
            frame.score,
            frame.now,
            frame.stats.hits,
            frame.stats.holds_engaged,
            frame.stats.missed,
            frame.stats.empty_presses
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhythm::{ FeatureSample, LanePolicy, Session };

    #[test]
    fn draws_notes_in_their_lanes() {
        let mut cfg = crate::Config::default();
        cfg.hold_prob = 0.0;
        cfg.lane_policy = Some(LanePolicy::Pitch);
        let mut s = Session::new(&cfg, 0.01, Arc::new(Logger::disabled())).unwrap();
        s.on_feature(FeatureSample { value: 1.0, timestamp: 0.0 });
        s.on_feature(FeatureSample { value: 1.0, timestamp: 1.0 });
        for _ in 0..135 {
            s.on_tick(1.0);
        }
        s.key_down("s");

        let rows = draw_lanes(&s.frame(), 8);
        assert_eq!(rows.len(), 8);
        // both notes sit on the hit line (row 7 of 8 over 580 px)
        assert_eq!(rows[7], "|o o - -|");
        assert!(rows[..7].iter().all(|r| r == "|       |"));
        assert_eq!(key_strip(&s.frame()), ". S . .");
    }
}
