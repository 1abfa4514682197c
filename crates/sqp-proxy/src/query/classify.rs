//! Statement classification by head keyword

/// Width of the space-padded decimal index prepended to tagged statements
pub const INDEX_TAG_WIDTH: usize = 10;

/// What a statement does, as far as the proxy cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Read-only; may run on any single replica
    Read,
    /// Row-changing statement (INSERT, UPDATE, DELETE, REPLACE)
    Dml,
    Begin,
    Commit,
    Rollback,
    /// Anything else (SET, DDL, savepoint control, ...); treated as a write
    Other,
}

impl StatementKind {
    pub fn classify(query: &str) -> Self {
        let mut words = query
            .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
            .split(|c: char| c.is_whitespace() || c == ';' || c == '(')
            .filter(|w| !w.is_empty());
        let head = words.next().unwrap_or_default().to_ascii_uppercase();
        match head.as_str() {
            "SELECT" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" => StatementKind::Read,
            "INSERT" | "UPDATE" | "DELETE" | "REPLACE" => StatementKind::Dml,
            "BEGIN" => StatementKind::Begin,
            "START" => match words.next() {
                Some(w) if w.eq_ignore_ascii_case("TRANSACTION") => StatementKind::Begin,
                _ => StatementKind::Other,
            },
            "COMMIT" => StatementKind::Commit,
            "ROLLBACK" => match words.next() {
                Some(w) if w.eq_ignore_ascii_case("TO") => StatementKind::Other,
                _ => StatementKind::Rollback,
            },
            _ => StatementKind::Other,
        }
    }

    pub fn is_read(self) -> bool {
        self == StatementKind::Read
    }

    pub fn is_write(self) -> bool {
        !self.is_read()
    }

    /// BEGIN, COMMIT or ROLLBACK
    pub fn is_boundary(self) -> bool {
        matches!(
            self,
            StatementKind::Begin | StatementKind::Commit | StatementKind::Rollback
        )
    }
}

/// True for trace lines that must never be pre-issued
pub fn is_boundary_marker(statement: &str) -> bool {
    statement.contains("BEGIN") || statement.contains("COMMIT")
}

/// True for statements that destroy or overwrite rows
pub fn is_destructive(statement: &str) -> bool {
    matches!(
        StatementKind::classify(statement),
        StatementKind::Dml | StatementKind::Other
    ) && !is_boundary_marker(statement)
}

/// Split the out-of-band trace index off a statement.
///
/// A tagged statement starts with an ASCII digit; its first
/// `INDEX_TAG_WIDTH` characters hold the left-justified index. Anything
/// else is returned untouched.
pub fn split_index_tag(query: &str) -> (Option<usize>, &str) {
    let split = INDEX_TAG_WIDTH.min(query.len());
    if !query.starts_with(|c: char| c.is_ascii_digit()) || !query.is_char_boundary(split) {
        return (None, query);
    }
    let (tag, rest) = query.split_at(split);
    match tag.trim_end().parse::<usize>() {
        Ok(index) => (Some(index), rest),
        Err(_) => (None, query),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_heads() {
        assert_eq!(StatementKind::classify("SELECT 1"), StatementKind::Read);
        assert_eq!(StatementKind::classify("  select * from t"), StatementKind::Read);
        assert_eq!(StatementKind::classify("(SELECT 1) UNION (SELECT 2)"), StatementKind::Read);
        assert_eq!(StatementKind::classify("show tables"), StatementKind::Read);
        assert_eq!(StatementKind::classify("INSERT INTO t VALUES (1)"), StatementKind::Dml);
        assert_eq!(StatementKind::classify("update t set a=1"), StatementKind::Dml);
        assert_eq!(StatementKind::classify("BEGIN"), StatementKind::Begin);
        assert_eq!(StatementKind::classify("start transaction"), StatementKind::Begin);
        assert_eq!(StatementKind::classify("COMMIT;"), StatementKind::Commit);
        assert_eq!(StatementKind::classify("ROLLBACK"), StatementKind::Rollback);
        assert_eq!(
            StatementKind::classify("ROLLBACK TO SAVEPOINT sp"),
            StatementKind::Other
        );
        assert_eq!(StatementKind::classify("SET autocommit=0"), StatementKind::Other);
        assert_eq!(StatementKind::classify(""), StatementKind::Other);
    }

    #[test]
    fn test_writes_include_unknown_statements() {
        assert!(StatementKind::classify("CREATE TABLE t (a INT)").is_write());
        assert!(!StatementKind::classify("SELECT 1").is_write());
        assert!(StatementKind::Commit.is_boundary());
        assert!(!StatementKind::Dml.is_boundary());
    }

    #[test]
    fn test_destructive() {
        assert!(is_destructive("DELETE FROM t WHERE id=1"));
        assert!(is_destructive("UPDATE t SET a=2"));
        assert!(!is_destructive("SELECT * FROM t"));
        assert!(!is_destructive("BEGIN"));
    }

    #[test]
    fn test_split_index_tag() {
        assert_eq!(split_index_tag("42        SELECT 1"), (Some(42), "SELECT 1"));
        assert_eq!(split_index_tag("1234567890BEGIN"), (Some(1234567890), "BEGIN"));
        assert_eq!(split_index_tag("SELECT 1"), (None, "SELECT 1"));
        // not a number in the tag field
        assert_eq!(split_index_tag("1 + 1 AS x"), (None, "1 + 1 AS x"));
    }

    #[test]
    fn test_short_tag_only() {
        assert_eq!(split_index_tag("7"), (Some(7), ""));
    }
}
