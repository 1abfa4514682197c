//! Speculator - predicts the statements a client will send next
//!
//! One speculator instance lives in each session. All variants share one
//! contract:
//! - nothing is predicted until `check_begin` has seen the stream start
//! - `try_speculate` is memoized until the cursor moves
//! - `speculate` predicts and then advances the cursor by one statement
//! - the cursor can be read and forced (out-of-band trace index tags)

pub mod markov;
pub mod synthetic;
pub mod trace;

use markov::{ModelSpeculator, TransitionModel};
use rand::rngs::StdRng;
use rand::SeedableRng;
use sqp_common::config::SpeculationSettings;
use sqp_common::{Result, SpeculatorKind, SqpError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use synthetic::SyntheticSpeculator;
use trace::{ReferenceTrace, TraceSettings, TraceSpeculator};
use tracing::info;

/// One predicted statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Speculation {
    pub query: String,
    /// Position in the reference trace, when the prediction came from one
    pub trace_index: Option<usize>,
}

impl Speculation {
    pub fn traced(query: &str, index: usize) -> Self {
        Self {
            query: query.to_string(),
            trace_index: Some(index),
        }
    }

    pub fn untraced(query: &str) -> Self {
        Self {
            query: query.to_string(),
            trace_index: None,
        }
    }
}

pub enum Speculator {
    Trace(TraceSpeculator),
    Model(ModelSpeculator),
    Synthetic(SyntheticSpeculator),
    /// Never predicts; the proxy degrades to plain replication
    Disabled { cursor: usize },
}

impl Speculator {
    pub fn name(&self) -> &'static str {
        match self {
            Speculator::Trace(_) => "trace",
            Speculator::Model(_) => "model",
            Speculator::Synthetic(_) => "synthetic",
            Speculator::Disabled { .. } => "disabled",
        }
    }

    pub fn check_begin(&mut self, query: &str) {
        match self {
            Speculator::Trace(s) => s.check_begin(query),
            Speculator::Model(s) => s.check_begin(query),
            Speculator::Synthetic(s) => s.check_begin(query),
            Speculator::Disabled { .. } => {}
        }
    }

    pub fn is_started(&self) -> bool {
        match self {
            Speculator::Trace(s) => s.is_started(),
            Speculator::Model(s) => s.is_started(),
            Speculator::Synthetic(s) => s.is_started(),
            Speculator::Disabled { .. } => false,
        }
    }

    /// Up to `k` predictions for the statement after `query`, then consume
    /// `query` (advance the cursor). Repeated predictions within one step
    /// are memoized by each variant.
    pub fn speculate(&mut self, query: &str, k: usize) -> Vec<Speculation> {
        match self {
            Speculator::Trace(s) => s.speculate(k),
            Speculator::Model(s) => s.speculate(query, k),
            Speculator::Synthetic(s) => s.speculate(k),
            Speculator::Disabled { cursor } => {
                *cursor += 1;
                Vec::new()
            }
        }
    }

    pub fn skip_query(&mut self) {
        match self {
            Speculator::Trace(s) => s.skip_query(),
            Speculator::Model(s) => s.skip_query(),
            Speculator::Synthetic(s) => s.skip_query(),
            Speculator::Disabled { cursor } => *cursor += 1,
        }
    }

    pub fn query_index(&self) -> usize {
        match self {
            Speculator::Trace(s) => s.query_index(),
            Speculator::Model(s) => s.query_index(),
            Speculator::Synthetic(s) => s.query_index(),
            Speculator::Disabled { cursor } => *cursor,
        }
    }

    pub fn set_query_index(&mut self, index: usize) {
        match self {
            Speculator::Trace(s) => s.set_query_index(index),
            Speculator::Model(s) => s.set_query_index(index),
            Speculator::Synthetic(s) => s.set_query_index(index),
            Speculator::Disabled { cursor } => *cursor = index,
        }
    }
}

/// Loads shared speculation inputs once and builds per-session speculators
pub struct SpeculatorFactory {
    kind: SpeculatorKind,
    trace: Option<Arc<ReferenceTrace>>,
    model: Option<Arc<TransitionModel>>,
    trace_settings: TraceSettings,
    seed: Option<u64>,
    sessions: AtomicU64,
}

impl SpeculatorFactory {
    pub fn from_settings(settings: &SpeculationSettings) -> Result<Self> {
        let needs_trace = matches!(settings.kind, SpeculatorKind::Trace | SpeculatorKind::Model);
        let trace = if needs_trace {
            let path = settings.trace_path.as_deref().ok_or_else(|| {
                SqpError::ConfigError(format!(
                    "speculator '{:?}' requires speculation.trace_path",
                    settings.kind
                ))
            })?;
            Some(Arc::new(ReferenceTrace::load(path)?))
        } else {
            None
        };
        let model = match (&settings.kind, &trace) {
            (SpeculatorKind::Model, Some(trace)) => {
                Some(Arc::new(TransitionModel::from_trace(trace)))
            }
            _ => None,
        };
        info!(kind = ?settings.kind, width = settings.width, "Speculator configured");
        Ok(Self::new(settings, trace, model))
    }

    fn new(
        settings: &SpeculationSettings,
        trace: Option<Arc<ReferenceTrace>>,
        model: Option<Arc<TransitionModel>>,
    ) -> Self {
        Self {
            kind: settings.kind,
            trace,
            model,
            trace_settings: TraceSettings {
                hit_probability: settings.hit_probability,
                avoid_destructive_fill: settings.avoid_destructive_fill,
            },
            seed: settings.seed,
            sessions: AtomicU64::new(0),
        }
    }

    /// Factory over an in-memory trace
    pub fn with_trace(settings: &SpeculationSettings, trace: ReferenceTrace) -> Self {
        let trace = Arc::new(trace);
        let model = (settings.kind == SpeculatorKind::Model)
            .then(|| Arc::new(TransitionModel::from_trace(&trace)));
        Self::new(settings, Some(trace), model)
    }

    pub fn for_session(&self) -> Speculator {
        let ordinal = self.sessions.fetch_add(1, Ordering::Relaxed);
        match (self.kind, &self.trace, &self.model) {
            (SpeculatorKind::Trace, Some(trace), _) => {
                let rng = match self.seed {
                    Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(ordinal)),
                    None => StdRng::from_entropy(),
                };
                Speculator::Trace(TraceSpeculator::new(trace.clone(), self.trace_settings, rng))
            }
            (SpeculatorKind::Model, _, Some(model)) => {
                Speculator::Model(ModelSpeculator::new(model.clone()))
            }
            (SpeculatorKind::Synthetic, _, _) => Speculator::Synthetic(SyntheticSpeculator::new()),
            _ => Speculator::Disabled { cursor: 0 },
        }
    }
}
