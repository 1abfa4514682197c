//! Trace-replay speculation
//!
//! The reference trace is the recorded statement log of a previous run,
//! one statement per line with BEGIN / COMMIT on lines of their own. A
//! session walks the trace with a cursor; the line after the cursor is the
//! likely next statement.

use super::Speculation;
use crate::query::classify::{is_boundary_marker, is_destructive};
use crate::query::StatementKind;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use sqp_common::{Result, SqpError};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// A trace line that must never be issued ahead of time
fn is_boundary(statement: &str) -> bool {
    is_boundary_marker(statement) || StatementKind::classify(statement).is_boundary()
}

/// Immutable, shareable reference trace
#[derive(Debug, Default)]
pub struct ReferenceTrace {
    statements: Vec<String>,
    /// Indices eligible for random fill
    fill_pool: Vec<usize>,
    /// `fill_pool` minus destructive statements
    read_pool: Vec<usize>,
}

impl ReferenceTrace {
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let statements: Vec<String> = lines.into_iter().map(Into::into).collect();
        let fill_pool: Vec<usize> = statements
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.trim().is_empty() && !is_boundary(s))
            .map(|(i, _)| i)
            .collect();
        let read_pool = fill_pool
            .iter()
            .copied()
            .filter(|&i| !is_destructive(&statements[i]))
            .collect();
        Self {
            statements,
            fill_pool,
            read_pool,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SqpError::TraceError(format!("cannot read trace {}: {}", path.display(), e))
        })?;
        let trace = Self::from_lines(content.lines().map(|l| l.trim_end_matches('\r')));
        info!(
            path = %path.display(),
            statements = trace.len(),
            "Loaded reference trace"
        );
        Ok(trace)
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.statements.get(index).map(String::as_str)
    }

    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    /// Index of the first transaction begin at or after `from`
    pub fn first_begin_from(&self, from: usize) -> Option<usize> {
        self.statements
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, s)| StatementKind::classify(s) == StatementKind::Begin)
            .map(|(i, _)| i)
    }
}

/// Tunables for trace replay
#[derive(Debug, Clone, Copy)]
pub struct TraceSettings {
    pub hit_probability: f64,
    pub avoid_destructive_fill: bool,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            hit_probability: 0.58,
            avoid_destructive_fill: true,
        }
    }
}

pub struct TraceSpeculator {
    trace: Arc<ReferenceTrace>,
    settings: TraceSettings,
    started: bool,
    /// Cursor was positioned by an out-of-band tag
    tagged: bool,
    cursor: usize,
    rng: StdRng,
    cached: Option<Vec<Speculation>>,
}

impl TraceSpeculator {
    pub fn new(trace: Arc<ReferenceTrace>, settings: TraceSettings, rng: StdRng) -> Self {
        Self {
            trace,
            settings: TraceSettings {
                hit_probability: settings.hit_probability.clamp(0.0, 1.0),
                ..settings
            },
            started: false,
            tagged: false,
            cursor: 0,
            rng,
            cached: None,
        }
    }

    pub fn check_begin(&mut self, query: &str) {
        if self.started || StatementKind::classify(query) != StatementKind::Begin {
            return;
        }
        self.started = true;
        if !self.tagged {
            if let Some(begin) = self.trace.first_begin_from(self.cursor) {
                self.cursor = begin;
            }
        }
        debug!(cursor = self.cursor, "Trace speculation started");
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn query_index(&self) -> usize {
        self.cursor
    }

    pub fn set_query_index(&mut self, index: usize) {
        self.tagged = true;
        self.cursor = index;
        self.cached = None;
    }

    pub fn skip_query(&mut self) {
        if self.started {
            self.cursor += 1;
        }
        self.cached = None;
    }

    /// Predictions for the current step, memoized until the cursor moves
    pub fn try_speculate(&mut self, k: usize) -> Vec<Speculation> {
        if let Some(cached) = &self.cached {
            return cached.clone();
        }
        if !self.started || k == 0 || self.trace.is_empty() {
            return Vec::new();
        }

        let mut speculations = Vec::with_capacity(k);
        let mut remaining = k;
        if self.rng.gen_bool(self.settings.hit_probability) {
            let next = self.cursor + 1;
            match self.trace.get(next) {
                Some(statement) if !statement.trim().is_empty() && !is_boundary(statement) => {
                    speculations.push(Speculation::traced(statement, next));
                }
                Some(_) => debug!(index = next, "Next trace statement is not speculable"),
                None => {}
            }
            remaining -= 1;
        }

        if remaining > 0 {
            let pool = if self.settings.avoid_destructive_fill {
                &self.trace.read_pool
            } else {
                &self.trace.fill_pool
            };
            let mut seen: Vec<&str> = speculations.iter().map(|s| s.query.as_str()).collect();
            let mut candidates = Vec::new();
            for &index in pool {
                if let Some(statement) = self.trace.get(index) {
                    if !seen.contains(&statement) {
                        seen.push(statement);
                        candidates.push(index);
                    }
                }
            }
            let picked: Vec<usize> = candidates
                .choose_multiple(&mut self.rng, remaining)
                .copied()
                .collect();
            for index in picked {
                if let Some(statement) = self.trace.get(index) {
                    speculations.push(Speculation::traced(statement, index));
                }
            }
        }

        self.cached = Some(speculations.clone());
        speculations
    }

    /// Consume one real statement: predict, then advance the cursor
    pub fn speculate(&mut self, k: usize) -> Vec<Speculation> {
        let speculations = self.try_speculate(k);
        self.skip_query();
        speculations
    }
}
