//! First-order successor model
//!
//! Built once from the reference trace. Successors of a statement are looked
//! up by exact text first and by template second, so statements never seen
//! verbatim still get predictions from their parameterized shape.

use super::trace::ReferenceTrace;
use super::Speculation;
use crate::query::{StatementKind, TemplateRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

type Successors = Vec<(String, usize)>;

#[derive(Debug, Default)]
pub struct TransitionModel {
    by_statement: HashMap<String, Successors>,
    by_template: HashMap<usize, Successors>,
    templates: TemplateRegistry,
}

fn speculable(statement: &str) -> bool {
    !statement.trim().is_empty() && !StatementKind::classify(statement).is_boundary()
}

fn bump(successors: &mut Successors, next: &str) {
    match successors.iter_mut().find(|(s, _)| s == next) {
        Some((_, count)) => *count += 1,
        None => successors.push((next.to_string(), 1)),
    }
}

/// Most frequent first; ties broken by text for determinism
fn rank(successors: &mut Successors) {
    successors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
}

impl TransitionModel {
    pub fn from_trace(trace: &ReferenceTrace) -> Self {
        let mut model = Self::default();
        for pair in trace.statements().windows(2) {
            let (current, next) = (&pair[0], &pair[1]);
            if current.trim().is_empty() || !speculable(next) {
                continue;
            }
            bump(model.by_statement.entry(current.clone()).or_default(), next);
            let template = model.templates.intern(current);
            bump(model.by_template.entry(template).or_default(), next);
        }
        model.by_statement.values_mut().for_each(rank);
        model.by_template.values_mut().for_each(rank);
        info!(
            statements = model.by_statement.len(),
            templates = model.templates.len(),
            "Built transition model"
        );
        model
    }

    /// Ranked successors of `query`
    pub fn successors(&self, query: &str) -> &[(String, usize)] {
        if let Some(found) = self.by_statement.get(query) {
            return found;
        }
        self.templates
            .id_of(query)
            .and_then(|id| self.by_template.get(&id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }
}

pub struct ModelSpeculator {
    model: Arc<TransitionModel>,
    started: bool,
    cursor: usize,
    cached: Option<Vec<Speculation>>,
}

impl ModelSpeculator {
    pub fn new(model: Arc<TransitionModel>) -> Self {
        Self {
            model,
            started: false,
            cursor: 0,
            cached: None,
        }
    }

    pub fn check_begin(&mut self, query: &str) {
        if StatementKind::classify(query) == StatementKind::Begin {
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
        self.cached = None;
    }

    pub fn skip_query(&mut self) {
        if self.started {
            self.cursor += 1;
        }
        self.cached = None;
    }

    pub fn try_speculate(&mut self, query: &str, k: usize) -> Vec<Speculation> {
        if let Some(cached) = &self.cached {
            return cached.clone();
        }
        if !self.started {
            return Vec::new();
        }
        let speculations: Vec<Speculation> = self
            .model
            .successors(query)
            .iter()
            .take(k)
            .map(|(statement, _)| Speculation::untraced(statement))
            .collect();
        self.cached = Some(speculations.clone());
        speculations
    }

    pub fn speculate(&mut self, query: &str, k: usize) -> Vec<Speculation> {
        let speculations = self.try_speculate(query, k);
        self.skip_query();
        speculations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> Arc<TransitionModel> {
        let trace = ReferenceTrace::from_lines([
            "BEGIN",
            "SELECT * FROM ITEM WHERE i_id = 1",
            "SELECT * FROM ITEM_BID WHERE ib_i_id = 1",
            "COMMIT",
            "BEGIN",
            "SELECT * FROM ITEM WHERE i_id = 1",
            "SELECT * FROM ITEM_BID WHERE ib_i_id = 1",
            "COMMIT",
            "BEGIN",
            "SELECT * FROM ITEM WHERE i_id = 2",
            "UPDATE ITEM SET i_num_bids = i_num_bids + 1 WHERE i_id = 2",
            "COMMIT",
        ]);
        Arc::new(TransitionModel::from_trace(&trace))
    }

    #[test]
    fn test_exact_successors_ranked() {
        let model = model();
        let next = model.successors("SELECT * FROM ITEM WHERE i_id = 1");
        assert_eq!(next.len(), 1);
        assert_eq!(next[0], ("SELECT * FROM ITEM_BID WHERE ib_i_id = 1".to_string(), 2));
        // boundaries are never successors
        assert!(model
            .successors("SELECT * FROM ITEM_BID WHERE ib_i_id = 1")
            .is_empty());
    }

    #[test]
    fn test_template_fallback() {
        let model = model();
        let next = model.successors("SELECT * FROM ITEM WHERE i_id = 77");
        assert_eq!(next.len(), 2);
        assert_eq!(next[0].0, "SELECT * FROM ITEM_BID WHERE ib_i_id = 1");
        assert_eq!(next[0].1, 2);
        assert!(model.templates().len() >= 2);
    }

    #[test]
    fn test_model_speculator_gating_and_width() {
        let mut spec = ModelSpeculator::new(model());
        assert!(spec
            .speculate("SELECT * FROM ITEM WHERE i_id = 9", 2)
            .is_empty());
        spec.check_begin("BEGIN");
        let predicted = spec.speculate("SELECT * FROM ITEM WHERE i_id = 9", 1);
        assert_eq!(predicted.len(), 1);
        assert_eq!(predicted[0].trace_index, None);
        assert_eq!(spec.query_index(), 1);
    }
}
