/// Session score. Only ever grows until `reset`.
#[derive(Debug, Default)]
pub struct ScoreKeeper {
    total: u64,
}

impl ScoreKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, points: u64) {
        self.total = self.total.saturating_add(points);
    }

    pub fn current(&self) -> u64 {
        self.total
    }

    pub fn reset(&mut self) {
        self.total = 0;
    }
}
