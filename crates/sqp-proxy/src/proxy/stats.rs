//! Per-session latency statistics
//!
//! Samples are kept in microseconds per category and mirrored into the
//! prometheus latency histogram as they are recorded.

use crate::metrics;
use sqp_common::Result;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Client frame received to response sent
    QueryProcess,
    Read,
    Write,
    /// Response sent to next client frame
    Think,
    Hit,
    Miss,
    /// Predict and dispatch for the next statement
    Speculation,
    /// Blocking on a pending speculative result
    Wait,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::QueryProcess,
        Category::Read,
        Category::Write,
        Category::Think,
        Category::Hit,
        Category::Miss,
        Category::Speculation,
        Category::Wait,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::QueryProcess => "query_process",
            Category::Read => "read",
            Category::Write => "write",
            Category::Think => "think",
            Category::Hit => "hit",
            Category::Miss => "miss",
            Category::Speculation => "speculation",
            Category::Wait => "wait",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct SessionStats {
    id: Uuid,
    report_interval: usize,
    samples: [Vec<u64>; 8],
    reads: u64,
    hits: u64,
    /// Hits whose result was already complete
    instants: u64,
    misses: u64,
    waits: u64,
    /// (trace index, micros) for every hit that had to block
    wait_queries: Vec<(usize, u64)>,
    last_response: Option<Instant>,
}

impl SessionStats {
    pub fn new(report_interval: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            report_interval,
            samples: Default::default(),
            reads: 0,
            hits: 0,
            instants: 0,
            misses: 0,
            waits: 0,
            wait_queries: Vec::new(),
            last_response: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn record(&mut self, category: Category, micros: u64) {
        self.samples[category as usize].push(micros);
        metrics::record_latency(category.as_str(), micros);
    }

    pub fn record_since(&mut self, category: Category, start: Instant) {
        self.record(category, elapsed_micros(start));
    }

    pub fn samples(&self, category: Category) -> &[u64] {
        &self.samples[category as usize]
    }

    /// A client frame arrived; closes the think interval opened by the
    /// previous response
    pub fn query_received(&mut self) {
        if let Some(sent) = self.last_response.take() {
            self.record_since(Category::Think, sent);
        }
    }

    pub fn response_sent(&mut self) {
        self.last_response = Some(Instant::now());
    }

    pub fn count_read(&mut self) {
        self.reads += 1;
        if self.report_interval > 0 && self.reads % self.report_interval as u64 == 0 {
            self.report();
        }
    }

    pub fn count_hit(&mut self, instant: bool) {
        self.hits += 1;
        if instant {
            self.instants += 1;
        }
    }

    pub fn count_miss(&mut self) {
        self.misses += 1;
    }

    pub fn count_wait(&mut self, trace_index: usize, micros: u64) {
        self.waits += 1;
        self.wait_queries.push((trace_index, micros));
        self.record(Category::Wait, micros);
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn waits(&self) -> u64 {
        self.waits
    }

    fn report(&self) {
        let mean = |c: Category| {
            let s = self.samples(c);
            if s.is_empty() {
                0
            } else {
                s.iter().sum::<u64>() / s.len() as u64
            }
        };
        debug!(
            session = %self.id,
            reads = self.reads,
            hits = self.hits,
            instants = self.instants,
            misses = self.misses,
            waits = self.waits,
            mean_read_us = mean(Category::Read),
            mean_hit_us = mean(Category::Hit),
            mean_miss_us = mean(Category::Miss),
            "Session statistics"
        );
    }

    /// Write one file per category plus the wait list into `dir`
    pub fn write_files(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        for category in Category::ALL {
            let path = dir.join(format!("{}.{}.latency", self.id, category));
            let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
            for sample in self.samples(category) {
                writeln!(out, "{}", sample)?;
            }
            out.flush()?;
        }
        let path = dir.join(format!("{}.wait_queries", self.id));
        let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
        for (index, micros) in &self.wait_queries {
            writeln!(out, "{},{}", index, micros)?;
        }
        out.flush()?;
        debug!(session = %self.id, dir = %dir.display(), "Wrote session statistics");
        Ok(())
    }
}

pub fn elapsed_micros(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX)
}
