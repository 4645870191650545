//! Patience-based early stopping on a validation metric (higher is better).

use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct EarlyStopping {
    enabled: bool,
    impatience: usize,
    best: Option<f64>,
    drop_cnt: usize,
}

impl EarlyStopping {
    pub fn new(enabled: bool, impatience: usize) -> Self {
        Self {
            enabled,
            impatience,
            best: None,
            drop_cnt: 0,
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Feed one validation value. Returns true when training should stop.
    ///
    /// A new best resets the counter; anything else counts as a drop.
    pub fn update(&mut self, metric: f64) -> bool {
        if !self.enabled {
            return false;
        }
        match self.best {
            Some(best) if metric <= best => {
                self.drop_cnt += 1;
                if self.drop_cnt >= self.impatience {
                    info!(best, drop_cnt = self.drop_cnt, "early stopping");
                    return true;
                }
                false
            }
            _ => {
                self.best = Some(metric);
                self.drop_cnt = 0;
                false
            }
        }
    }
}
