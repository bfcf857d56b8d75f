use super::notes::{ NoteBody, NoteField, NoteId };
use super::score::ScoreKeeper;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PressOutcome {
    Hit {
        note: NoteId,
        points: u64,
    },
    /// Nothing hittable in the lane. Silent: no score or note change.
    Empty,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HoldReport {
    pub engaged: Option<NoteId>,
    pub holding: usize,
    pub points: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    pub released: usize,
    pub bonus: u64,
}

/// Resolves lane input against the note field.
///
/// Normal notes are judged on press edges only, one note per edge, earliest spawn first.
/// Hold notes engage while the key is held inside the window and pay `hold_tick_points`
/// for every tick they stay engaged. With `release_bonus_divisor` set, letting go of an
/// engaged hold also pays `round(length / divisor)`.
pub struct HitResolver {
    hit_line_y: f32,
    hit_window: f32,
    hit_points: u64,
    hold_tick_points: u64,
    release_bonus_divisor: Option<f32>,
}

impl HitResolver {
    pub fn new(cfg: &crate::Config) -> Self {
        Self {
            hit_line_y: cfg.hit_line_y,
            hit_window: cfg.hit_window,
            hit_points: cfg.hit_points,
            hold_tick_points: cfg.hold_tick_points,
            release_bonus_divisor: cfg.hold_release_bonus.filter(|d| *d > 0.0 && d.is_finite()),
        }
    }

    fn in_window(&self, y: f32) -> bool {
        (y - self.hit_line_y).abs() < self.hit_window
    }

    pub fn on_key_down(
        &self,
        lane: usize,
        field: &mut NoteField,
        score: &mut ScoreKeeper
    ) -> PressOutcome {
        let target = field
            .notes_mut()
            .iter_mut()
            .filter(|n| n.lane == lane && !n.consumed)
            .filter(|n| matches!(n.body, NoteBody::Normal { .. }))
            .find(|n| (n.y - self.hit_line_y).abs() < self.hit_window);

        match target {
            Some(note) => {
                note.consumed = true;
                score.add(self.hit_points);
                PressOutcome::Hit { note: note.id, points: self.hit_points }
            }
            None => PressOutcome::Empty,
        }
    }

    /// Called once per tick for every lane whose key is down.
    pub fn on_key_held(
        &self,
        lane: usize,
        field: &mut NoteField,
        score: &mut ScoreKeeper
    ) -> HoldReport {
        let mut report = HoldReport::default();

        let candidate = field
            .notes_mut()
            .iter_mut()
            .filter(|n| n.lane == lane && !n.consumed)
            .find(|n| matches!(n.body, NoteBody::Hold { .. }) && self.in_window(n.y));
        if let Some(note) = candidate {
            if let NoteBody::Hold { length, .. } = note.body {
                note.body = NoteBody::Hold { length, holding: true };
                note.consumed = true;
                report.engaged = Some(note.id);
            }
        }

        report.holding = field
            .live_notes()
            .iter()
            .filter(|n| n.lane == lane && n.is_holding())
            .count();
        report.points = (report.holding as u64) * self.hold_tick_points;
        score.add(report.points);
        report
    }

    pub fn on_key_up(
        &self,
        lane: usize,
        field: &mut NoteField,
        score: &mut ScoreKeeper
    ) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        for note in field.notes_mut().iter_mut().filter(|n| n.lane == lane) {
            if let NoteBody::Hold { length, holding: true } = note.body {
                note.body = NoteBody::Hold { length, holding: false };
                report.released += 1;
                if let Some(div) = self.release_bonus_divisor {
                    report.bonus += (length / div).round().max(0.0) as u64;
                }
            }
        }
        score.add(report.bonus);
        report
    }

    /// Ends engaged holds whose tail has passed the hit line while the key is still down.
    /// They pay the release bonus here, since the sweep removes them before any key-up.
    pub fn finish_held_through(&self, field: &mut NoteField, score: &mut ScoreKeeper) -> u64 {
        let mut bonus = 0;
        for note in field.notes_mut().iter_mut() {
            if !note.is_holding() || note.y <= self.hit_line_y + note.length() {
                continue;
            }
            note.body = NoteBody::Hold { length: note.length(), holding: false };
            if let Some(div) = self.release_bonus_divisor {
                bonus += (note.length() / div).round().max(0.0) as u64;
            }
        }
        score.add(bonus);
        bonus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhythm::NoteKind;

    fn setup() -> (crate::Config, NoteField, ScoreKeeper) {
        let cfg = crate::Config::default();
        let field = NoteField::new(&cfg, 4);
        (cfg, field, ScoreKeeper::new())
    }

    fn place(field: &mut NoteField, id: NoteId, y: f32) {
        if let Some(n) = field.notes_mut().iter_mut().find(|n| n.id == id) {
            n.y = y;
        }
    }

    #[test]
    fn press_consumes_once() {
        let (cfg, mut field, mut score) = setup();
        let hits = HitResolver::new(&cfg);
        let id = field.spawn(2, NoteKind::Normal, 30.0, 4.0).unwrap();
        place(&mut field, id, 530.0);

        assert_eq!(hits.on_key_down(2, &mut field, &mut score), PressOutcome::Hit {
            note: id,
            points: 100,
        });
        assert_eq!(hits.on_key_down(2, &mut field, &mut score), PressOutcome::Empty);
        assert_eq!(score.current(), 100);
    }

    #[test]
    fn press_outside_window_or_lane_is_silent() {
        let (cfg, mut field, mut score) = setup();
        let hits = HitResolver::new(&cfg);
        let id = field.spawn(1, NoteKind::Normal, 30.0, 4.0).unwrap();
        place(&mut field, id, 500.0); // exactly one window away: not inside
        assert_eq!(hits.on_key_down(1, &mut field, &mut score), PressOutcome::Empty);
        place(&mut field, id, 540.0);
        assert_eq!(hits.on_key_down(0, &mut field, &mut score), PressOutcome::Empty);
        assert!(!field.get(id).unwrap().consumed);
        assert_eq!(score.current(), 0);
    }

    #[test]
    fn stacked_lane_needs_one_press_per_note() {
        let (cfg, mut field, mut score) = setup();
        let hits = HitResolver::new(&cfg);
        let first = field.spawn(3, NoteKind::Normal, 30.0, 4.0).unwrap();
        let second = field.spawn(3, NoteKind::Normal, 30.0, 4.0).unwrap();
        place(&mut field, first, 560.0);
        place(&mut field, second, 538.0);

        // earliest spawned wins even though the later note is closer to the line
        match hits.on_key_down(3, &mut field, &mut score) {
            PressOutcome::Hit { note, .. } => assert_eq!(note, first),
            other => panic!("expected hit, got {:?}", other),
        }
        assert!(!field.get(second).unwrap().consumed);
        assert!(matches!(hits.on_key_down(3, &mut field, &mut score), PressOutcome::Hit { .. }));
        assert_eq!(score.current(), 200);
    }

    #[test]
    fn press_does_not_touch_hold_notes() {
        let (cfg, mut field, mut score) = setup();
        let hits = HitResolver::new(&cfg);
        let id = field.spawn(0, NoteKind::Hold, 80.0, 4.0).unwrap();
        place(&mut field, id, 540.0);
        assert_eq!(hits.on_key_down(0, &mut field, &mut score), PressOutcome::Empty);
        assert!(!field.get(id).unwrap().consumed);
    }

    #[test]
    fn hold_pays_per_held_tick() {
        let (cfg, mut field, mut score) = setup();
        let hits = HitResolver::new(&cfg);
        let id = field.spawn(1, NoteKind::Hold, 80.0, 4.0).unwrap();
        place(&mut field, id, 520.0);

        let mut prev = score.current();
        for tick in 0..10 {
            let r = hits.on_key_held(1, &mut field, &mut score);
            if tick == 0 {
                assert_eq!(r.engaged, Some(id));
            } else {
                assert_eq!(r.engaged, None);
            }
            assert_eq!(r.holding, 1);
            assert!(score.current() > prev);
            prev = score.current();
            field.tick();
        }
        assert_eq!(score.current(), 10);

        let released = hits.on_key_up(1, &mut field, &mut score);
        assert_eq!(released, ReleaseReport { released: 1, bonus: 0 });

        // re-press: the hold is consumed, nothing engages any more
        let r = hits.on_key_held(1, &mut field, &mut score);
        assert_eq!(r, HoldReport::default());
        assert_eq!(score.current(), 10);
    }

    #[test]
    fn held_key_before_window_pays_nothing() {
        let (cfg, mut field, mut score) = setup();
        let hits = HitResolver::new(&cfg);
        let id = field.spawn(1, NoteKind::Hold, 80.0, 4.0).unwrap();
        place(&mut field, id, 400.0);
        let r = hits.on_key_held(1, &mut field, &mut score);
        assert_eq!(r.points, 0);
        assert!(!field.get(id).unwrap().is_holding());
    }

    #[test]
    fn release_without_hold_is_noop() {
        let (cfg, mut field, mut score) = setup();
        let hits = HitResolver::new(&cfg);
        assert_eq!(hits.on_key_up(2, &mut field, &mut score), ReleaseReport::default());
        assert_eq!(score.current(), 0);
    }

    #[test]
    fn optional_release_bonus() {
        let (mut cfg, mut field, mut score) = setup();
        cfg.hold_release_bonus = Some(10.0);
        let hits = HitResolver::new(&cfg);
        let id = field.spawn(0, NoteKind::Hold, 80.0, 4.0).unwrap();
        place(&mut field, id, 540.0);
        for _ in 0..3 {
            hits.on_key_held(0, &mut field, &mut score);
        }
        let r = hits.on_key_up(0, &mut field, &mut score);
        assert_eq!(r.bonus, 8);
        // 3 ticks + 80 / 10
        assert_eq!(score.current(), 11);
    }

    #[test]
    fn hold_kept_past_its_tail_still_gets_the_bonus() {
        let (mut cfg, mut field, mut score) = setup();
        cfg.hold_release_bonus = Some(10.0);
        let hits = HitResolver::new(&cfg);
        let id = field.spawn(2, NoteKind::Hold, 80.0, 4.0).unwrap();
        place(&mut field, id, 540.0);
        hits.on_key_held(2, &mut field, &mut score);

        // tail not past the line yet: nothing to finish
        assert_eq!(hits.finish_held_through(&mut field, &mut score), 0);
        place(&mut field, id, 540.0 + 81.0);
        assert_eq!(hits.finish_held_through(&mut field, &mut score), 8);
        assert!(!field.get(id).unwrap().is_holding());
        assert_eq!(score.current(), 9);

        // paid once: the later key-up finds nothing engaged
        assert_eq!(hits.on_key_up(2, &mut field, &mut score), ReleaseReport::default());
        assert_eq!(hits.finish_held_through(&mut field, &mut score), 0);
        assert_eq!(score.current(), 9);
    }
}
