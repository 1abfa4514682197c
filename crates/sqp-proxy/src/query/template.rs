//! Query templates
//!
//! A template is the statement with its literal values replaced by `?v`, so
//! statements differing only in parameters share an id. Ids are dense and
//! assigned in first-seen order by the registry that owns them.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::io::Write;
use std::sync::LazyLock;

pub const VALUE_PLACEHOLDER: &str = "?v";

static LITERAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // IN lists, quoted strings ('' escapes), then bare numbers
    Regex::new(r"(?i)(\bIN\s*\([^)]*\))|'(?:[^']|'')*'|\b\d+(?:\.\d+)?\b")
        .expect("constant pattern")
});

/// Literal-free form of a statement
pub fn template_of(query: &str) -> String {
    LITERAL_REGEX
        .replace_all(query.trim(), |caps: &Captures<'_>| {
            if caps.get(1).is_some() {
                format!("IN ({})", VALUE_PLACEHOLDER)
            } else {
                VALUE_PLACEHOLDER.to_string()
            }
        })
        .into_owned()
}

/// Dense template numbering
#[derive(Debug, Default, Clone)]
pub struct TemplateRegistry {
    ids: HashMap<String, usize>,
    templates: Vec<String>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the statement's template, assigning the next id if unseen
    pub fn intern(&mut self, query: &str) -> usize {
        let template = template_of(query);
        if let Some(&id) = self.ids.get(&template) {
            return id;
        }
        let id = self.templates.len();
        self.ids.insert(template.clone(), id);
        self.templates.push(template);
        id
    }

    pub fn id_of(&self, query: &str) -> Option<usize> {
        self.ids.get(&template_of(query)).copied()
    }

    pub fn template(&self, id: usize) -> Option<&str> {
        self.templates.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Write `id,template` lines in id order
    pub fn dump<W: Write>(&self, mut out: W) -> std::io::Result<()> {
        for (id, template) in self.templates.iter().enumerate() {
            writeln!(out, "{},{}", id, template)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_replaces_literals() {
        assert_eq!(
            template_of("SELECT * FROM ITEM WHERE i_id = 42 AND i_u_id = 7"),
            "SELECT * FROM ITEM WHERE i_id = ?v AND i_u_id = ?v"
        );
        assert_eq!(
            template_of("UPDATE t SET name = 'it''s' WHERE price > 1.5"),
            "UPDATE t SET name = ?v WHERE price > ?v"
        );
        assert_eq!(
            template_of("SELECT a FROM t WHERE id IN (1, 2, 3)"),
            "SELECT a FROM t WHERE id IN (?v)"
        );
    }

    #[test]
    fn test_identifiers_with_digits_are_kept() {
        assert_eq!(template_of("SELECT c1 FROM t2 WHERE c1 = 5"), "SELECT c1 FROM t2 WHERE c1 = ?v");
    }

    #[test]
    fn test_registry_assigns_dense_ids() {
        let mut registry = TemplateRegistry::new();
        assert_eq!(registry.intern("SELECT * FROM t WHERE id = 1"), 0);
        assert_eq!(registry.intern("SELECT * FROM u WHERE id = 1"), 1);
        assert_eq!(registry.intern("SELECT * FROM t WHERE id = 99"), 0);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.id_of("SELECT * FROM u WHERE id = 5"), Some(1));
        assert_eq!(registry.id_of("DELETE FROM t"), None);
        assert_eq!(registry.template(1), Some("SELECT * FROM u WHERE id = ?v"));
    }

    #[test]
    fn test_dump_format() {
        let mut registry = TemplateRegistry::new();
        registry.intern("BEGIN");
        registry.intern("SELECT 1");
        let mut out = Vec::new();
        registry.dump(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "0,BEGIN\n1,SELECT ?v\n");
    }
}
