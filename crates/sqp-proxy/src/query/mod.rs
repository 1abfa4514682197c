//! Cheap syntactic query handling: classification, the out-of-band trace
//! index tag and literal-free query templates.

pub mod classify;
pub mod template;

pub use classify::{split_index_tag, StatementKind, INDEX_TAG_WIDTH};
pub use template::{template_of, TemplateRegistry};
