use super::notes::NoteBody;
use super::session::Frame;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum LaneState {
    #[default]
    Idle,
    /// Pressed for a normal note; released on the next frame.
    Tapping,
    Holding,
}

/// Plays the chart by itself: taps normal notes as they cross the hit line and holds hold
/// notes until their tail leaves the field. Used for headless runs and demos.
pub struct AutoPlayer {
    lanes: Vec<LaneState>,
}

impl AutoPlayer {
    pub fn new(lane_count: usize) -> Self {
        Self { lanes: vec![LaneState::Idle; lane_count] }
    }

    /// Key actions `(lane, pressed)` to apply after looking at `frame`.
    pub fn react(&mut self, frame: &Frame) -> Vec<(usize, bool)> {
        let mut actions = Vec::new();
        for lane in 0..self.lanes.len() {
            let in_lane = frame.notes.iter().filter(|n| n.lane == lane);
            let mut tap_due = false;
            let mut hold_due = false;
            let mut holding = false;
            for n in in_lane {
                let near = (n.y - frame.hit_line_y).abs() < frame.hit_window;
                match n.body {
                    NoteBody::Normal { .. } => {
                        // wait for the last frame before the note crosses the line
                        if !n.consumed && near && n.y + n.fall_speed > frame.hit_line_y {
                            tap_due = true;
                        }
                    }
                    NoteBody::Hold { holding: h, .. } => {
                        holding |= h;
                        if !n.consumed && near {
                            hold_due = true;
                        }
                    }
                }
            }

            let state = &mut self.lanes[lane];
            match *state {
                LaneState::Tapping => {
                    actions.push((lane, false));
                    *state = LaneState::Idle;
                }
                LaneState::Holding => {
                    if !holding && !hold_due {
                        actions.push((lane, false));
                        *state = LaneState::Idle;
                    }
                }
                LaneState::Idle => {
                    if hold_due {
                        actions.push((lane, true));
                        *state = LaneState::Holding;
                    } else if tap_due {
                        actions.push((lane, true));
                        *state = LaneState::Tapping;
                    }
                }
            }
        }
        actions
    }

    pub fn reset(&mut self) {
        self.lanes.iter_mut().for_each(|s| *s = LaneState::Idle);
    }
}
