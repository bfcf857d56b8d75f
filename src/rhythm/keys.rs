/// Ordered lane key tokens plus the live pressed state for each lane.
///
/// Tokens are compared case-insensitively; anything not in the list maps to no lane.
#[derive(Clone, Debug)]
pub struct LiveKeyState {
    tokens: Vec<String>,
    pressed: Vec<bool>,
}

impl LiveKeyState {
    pub fn new(tokens: &[String]) -> Self {
        let tokens: Vec<String> = tokens
            .iter()
            .map(|t| t.trim().to_lowercase())
            .collect();
        let pressed = vec![false; tokens.len()];
        Self { tokens, pressed }
    }

    pub fn lane_of(&self, token: &str) -> Option<usize> {
        let token = token.trim().to_lowercase();
        self.tokens.iter().position(|t| *t == token)
    }

    pub fn token_of(&self, lane: usize) -> Option<&str> {
        self.tokens.get(lane).map(|s| s.as_str())
    }

    /// Marks the lane pressed. Returns true only on the up → down edge.
    pub fn press(&mut self, lane: usize) -> bool {
        match self.pressed.get_mut(lane) {
            Some(p) if !*p => {
                *p = true;
                true
            }
            _ => false,
        }
    }

    /// Marks the lane released. Returns true only on the down → up edge.
    pub fn release(&mut self, lane: usize) -> bool {
        match self.pressed.get_mut(lane) {
            Some(p) if *p => {
                *p = false;
                true
            }
            _ => false,
        }
    }

    pub fn is_pressed(&self, lane: usize) -> bool {
        self.pressed.get(lane).copied().unwrap_or(false)
    }

    pub fn pressed_lanes(&self) -> impl Iterator<Item = usize> + '_ {
        self.pressed
            .iter()
            .enumerate()
            .filter(|(_, p)| **p)
            .map(|(i, _)| i)
    }

    pub fn lane_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn release_all(&mut self) {
        self.pressed.iter_mut().for_each(|p| *p = false);
    }
}
