//! Synthetic-benchmark speculation
//!
//! The synthetic workload issues `SELECT SLEEP(t)` statements with sleep
//! times between 1ms and 10ms. Every prediction is the average statement.

use super::Speculation;

const MIN_SLEEP_MICROS: u64 = 1_000;
const MAX_SLEEP_MICROS: u64 = 10_000;

/// The statement predicted after every step
pub fn average_sleep_query() -> String {
    let micros = (MIN_SLEEP_MICROS + MAX_SLEEP_MICROS) / 2;
    format!("SELECT SLEEP({:.6});", micros as f64 * 1e-6)
}

#[derive(Debug, Default)]
pub struct SyntheticSpeculator {
    started: bool,
    cursor: usize,
}

impl SyntheticSpeculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The workload has no transactions; the first sleep starts it
    pub fn check_begin(&mut self, query: &str) {
        if query.contains("SLEEP") {
            self.started = true;
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn query_index(&self) -> usize {
        self.cursor
    }

    pub fn set_query_index(&mut self, index: usize) {
        self.cursor = index;
    }

    pub fn skip_query(&mut self) {
        if self.started {
            self.cursor += 1;
        }
    }

    pub fn try_speculate(&self, k: usize) -> Vec<Speculation> {
        if !self.started || k == 0 {
            return Vec::new();
        }
        vec![Speculation::untraced(&average_sleep_query())]
    }

    pub fn speculate(&mut self, k: usize) -> Vec<Speculation> {
        let speculations = self.try_speculate(k);
        self.skip_query();
        speculations
    }
}
