//! Undo generation for speculative writes
//!
//! A speculative write that the client never confirms is reversed with a
//! compensating statement:
//! - INSERT: `DELETE` on the inserted primary keys
//! - INSERT ... ON DUPLICATE KEY UPDATE `col = col ± n`: the inverse
//!   adjustment on the same keys
//! - UPDATE: the pre-image of the updated columns is read from the replica
//!   first and written back by an `UPDATE` over the same WHERE clause
//!
//! Anything else yields an empty string, which tells the caller to fall back
//! to rolling back to the savepoint. Statements are analysed with the MySQL
//! tokenizer only; no full parse is needed.

use crate::mysql_wire::protocol::result_set::ColumnInfo;
use crate::mysql_wire::Transport;
use crate::server_group::ServerGroup;
use sqlparser::dialect::MySqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer};
use sqp_common::{Result, SqpError};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Primary key columns per table (table names are matched case-insensitively)
#[derive(Debug, Clone, Default)]
pub struct PrimaryKeyCatalog {
    tables: HashMap<String, Vec<String>>,
}

impl PrimaryKeyCatalog {
    pub fn new(tables: HashMap<String, Vec<String>>) -> Self {
        Self {
            tables: tables
                .into_iter()
                .map(|(table, keys)| (table.to_ascii_uppercase(), keys))
                .collect(),
        }
    }

    pub fn keys_for(&self, table: &str) -> Option<&[String]> {
        self.tables
            .get(&table.to_ascii_uppercase())
            .map(Vec::as_slice)
    }
}

/// Precomputed undo statements keyed by reference-trace index
#[derive(Debug, Default)]
pub struct UndoTrace {
    statements: HashMap<usize, String>,
}

impl UndoTrace {
    /// Parse `<index> <statement>` lines
    pub fn parse(content: &str) -> Self {
        let mut statements = HashMap::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once(' ').map(|(i, s)| (i.parse::<usize>(), s.trim())) {
                Some((Ok(index), statement)) if !statement.is_empty() => {
                    statements.insert(index, statement.to_string());
                }
                _ => warn!(line = line_no + 1, "Skipping malformed undo trace line"),
            }
        }
        Self { statements }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SqpError::TraceError(format!("cannot read undo trace {}: {}", path.display(), e))
        })?;
        let trace = Self::parse(&content);
        info!(path = %path.display(), entries = trace.len(), "Loaded undo trace");
        Ok(trace)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.statements.get(&index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Escape and quote a string literal
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

/// Re-emit a result-set cell as a SQL literal
pub fn render_value(value: Option<&str>, column: &ColumnInfo) -> String {
    match value {
        None => "NULL".to_string(),
        Some(v) if column.is_numeric() => v.to_string(),
        Some(v) => quote_literal(v),
    }
}

/// INSERT ... ON DUPLICATE KEY UPDATE
pub fn is_upsert(statement: &str) -> bool {
    matches!(
        analyze(statement),
        Some(Analysis::Insert(InsertStatement {
            on_duplicate: Some(_),
            ..
        }))
    )
}

#[derive(Debug, Clone, PartialEq)]
struct Identifier {
    /// Unquoted name of the last path segment
    name: String,
    /// As written, quotes included
    sql: String,
}

#[derive(Debug, Clone, PartialEq)]
struct Assignment {
    column: Identifier,
    value: Vec<Token>,
}

#[derive(Debug, Clone, PartialEq)]
struct InsertStatement {
    table: Identifier,
    columns: Vec<Identifier>,
    rows: Vec<Vec<String>>,
    on_duplicate: Option<Vec<Assignment>>,
}

#[derive(Debug, Clone, PartialEq)]
struct UpdateStatement {
    table: Identifier,
    assignments: Vec<Assignment>,
    /// `WHERE ...` through the end of the statement
    where_clause: Option<String>,
    /// Unquoted names of every word in the WHERE tail
    where_words: Vec<String>,
}

impl UpdateStatement {
    /// The update rewrites a column its own WHERE clause filters on
    fn moves_its_rows(&self) -> bool {
        self.assignments.iter().any(|a| {
            self.where_words
                .iter()
                .any(|w| w.eq_ignore_ascii_case(&a.column.name))
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Analysis {
    Insert(InsertStatement),
    Update(UpdateStatement),
}

fn is_keyword(token: &Token, keyword: &str) -> bool {
    matches!(token, Token::Word(w) if w.quote_style.is_none() && w.value.eq_ignore_ascii_case(keyword))
}

fn render_token(token: &Token) -> String {
    match token {
        Token::SingleQuotedString(s) => quote_literal(s),
        other => other.to_string(),
    }
}

fn render(tokens: &[Token]) -> String {
    tokens.iter().map(render_token).collect::<String>().trim().to_string()
}

/// Whitespace-skipping walk over a token list
struct TokenCursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> TokenCursor<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.tokens.get(self.pos), Some(Token::Whitespace(_))) {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<&'a Token> {
        self.skip_whitespace();
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let token = self.peek()?;
        self.pos += 1;
        Some(token)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek().is_some_and(|t| is_keyword(t, keyword)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// At the end, ignoring one trailing semicolon
    fn at_end(&mut self) -> bool {
        self.eat(&Token::SemiColon);
        self.peek().is_none()
    }

    /// `name` or `schema.name`
    fn identifier(&mut self) -> Option<Identifier> {
        let mut sql = String::new();
        loop {
            let Some(Token::Word(word)) = self.next() else {
                return None;
            };
            sql.push_str(&word.to_string());
            if self.tokens.get(self.pos) == Some(&Token::Period) {
                self.pos += 1;
                sql.push('.');
            } else {
                return Some(Identifier {
                    name: word.value.clone(),
                    sql,
                });
            }
        }
    }

    /// Tokens up to a depth-0 comma, closing paren, semicolon or stop keyword
    fn expression(&mut self, stop: &[&str]) -> &'a [Token] {
        self.skip_whitespace();
        let start = self.pos;
        let mut depth = 0usize;
        while let Some(token) = self.tokens.get(self.pos) {
            match token {
                Token::LParen => depth += 1,
                Token::RParen if depth == 0 => break,
                Token::RParen => depth -= 1,
                Token::Comma | Token::SemiColon if depth == 0 => break,
                t if depth == 0 && stop.iter().any(|k| is_keyword(t, k)) => break,
                _ => {}
            }
            self.pos += 1;
        }
        let mut end = self.pos;
        while end > start && matches!(self.tokens[end - 1], Token::Whitespace(_)) {
            end -= 1;
        }
        &self.tokens[start..end]
    }

    fn assignments(&mut self, stop: &[&str]) -> Option<Vec<Assignment>> {
        let mut assignments = Vec::new();
        loop {
            let column = self.identifier()?;
            if !self.eat(&Token::Eq) {
                return None;
            }
            let value = self.expression(stop);
            if value.is_empty() {
                return None;
            }
            assignments.push(Assignment {
                column,
                value: value.to_vec(),
            });
            if !self.eat(&Token::Comma) {
                return Some(assignments);
            }
        }
    }

    /// Everything from the current token on, minus a trailing semicolon
    fn remainder(&mut self) -> String {
        self.skip_whitespace();
        let mut tail = &self.tokens[self.pos..];
        while let Some((last, rest)) = tail.split_last() {
            if matches!(last, Token::SemiColon | Token::Whitespace(_)) {
                tail = rest;
            } else {
                break;
            }
        }
        self.pos = self.tokens.len();
        render(tail)
    }
}

fn analyze(statement: &str) -> Option<Analysis> {
    let tokens = Tokenizer::new(&MySqlDialect {}, statement).tokenize().ok()?;
    let mut cursor = TokenCursor::new(&tokens);
    if cursor.eat_keyword("INSERT") {
        parse_insert(&mut cursor).map(Analysis::Insert)
    } else if cursor.eat_keyword("UPDATE") {
        parse_update(&mut cursor).map(Analysis::Update)
    } else {
        None
    }
}

fn parse_insert(cursor: &mut TokenCursor<'_>) -> Option<InsertStatement> {
    while ["LOW_PRIORITY", "DELAYED", "HIGH_PRIORITY", "IGNORE"]
        .iter()
        .any(|k| cursor.eat_keyword(k))
    {}
    cursor.eat_keyword("INTO");
    let table = cursor.identifier()?;

    let mut columns = Vec::new();
    if cursor.eat(&Token::LParen) {
        loop {
            columns.push(cursor.identifier()?);
            if cursor.eat(&Token::Comma) {
                continue;
            }
            if cursor.eat(&Token::RParen) {
                break;
            }
            return None;
        }
    }

    let mut rows = Vec::new();
    if cursor.eat_keyword("VALUES") || cursor.eat_keyword("VALUE") {
        loop {
            if !cursor.eat(&Token::LParen) {
                return None;
            }
            let mut row = Vec::new();
            loop {
                let value = cursor.expression(&[]);
                if value.is_empty() {
                    return None;
                }
                row.push(render(value));
                if cursor.eat(&Token::Comma) {
                    continue;
                }
                if cursor.eat(&Token::RParen) {
                    break;
                }
                return None;
            }
            rows.push(row);
            if !cursor.eat(&Token::Comma) {
                break;
            }
        }
    } else if cursor.eat_keyword("SET") {
        let assignments = cursor.assignments(&["ON"])?;
        columns = assignments.iter().map(|a| a.column.clone()).collect();
        rows.push(assignments.iter().map(|a| render(&a.value)).collect());
    } else {
        // INSERT ... SELECT
        return None;
    }

    let on_duplicate = if cursor.eat_keyword("ON") {
        if !(cursor.eat_keyword("DUPLICATE") && cursor.eat_keyword("KEY") && cursor.eat_keyword("UPDATE")) {
            return None;
        }
        Some(cursor.assignments(&[])?)
    } else {
        None
    };

    if !cursor.at_end() {
        return None;
    }
    Some(InsertStatement {
        table,
        columns,
        rows,
        on_duplicate,
    })
}

fn parse_update(cursor: &mut TokenCursor<'_>) -> Option<UpdateStatement> {
    while ["LOW_PRIORITY", "IGNORE"].iter().any(|k| cursor.eat_keyword(k)) {}
    let table = cursor.identifier()?;
    // aliases and multi-table updates are not handled
    if !cursor.eat_keyword("SET") {
        return None;
    }
    let assignments = cursor.assignments(&["WHERE", "ORDER", "LIMIT"])?;
    let (where_clause, where_words) = match cursor.peek() {
        Some(token) if is_keyword(token, "WHERE") => {
            let words = cursor.tokens[cursor.pos..]
                .iter()
                .filter_map(|t| match t {
                    Token::Word(w) => Some(w.value.clone()),
                    _ => None,
                })
                .collect();
            (Some(cursor.remainder()), words)
        }
        _ => (None, Vec::new()),
    };
    if !cursor.at_end() {
        return None;
    }
    Some(UpdateStatement {
        table,
        assignments,
        where_clause,
        where_words,
    })
}

/// Synthesizes compensating statements for speculative writes
#[derive(Debug, Clone, Default)]
pub struct UndoGenerator {
    catalog: Arc<PrimaryKeyCatalog>,
}

impl UndoGenerator {
    pub fn new(catalog: Arc<PrimaryKeyCatalog>) -> Self {
        Self { catalog }
    }

    /// Compensating statement for `statement`, which is about to run on
    /// `replica`. Update pre-images are read from that replica, so this
    /// must be called before the write is sent.
    ///
    /// Returns an empty string when the statement cannot be undone.
    pub async fn undo_for<T: Transport>(
        &self,
        group: &mut ServerGroup<T>,
        statement: &str,
        replica: usize,
    ) -> Result<String> {
        let undo = match analyze(statement) {
            Some(Analysis::Insert(insert)) => self.insert_undo(&insert),
            Some(Analysis::Update(update)) => self.update_undo(group, &update, replica).await?,
            None => None,
        };
        let undo = undo.unwrap_or_default();
        if undo.is_empty() {
            debug!(statement, "No undo statement; savepoint fallback");
        }
        Ok(undo)
    }

    /// Undo for statements that need no pre-image (inserts and upserts)
    pub fn undo_without_preimage(&self, statement: &str) -> String {
        match analyze(statement) {
            Some(Analysis::Insert(insert)) => self.insert_undo(&insert).unwrap_or_default(),
            _ => String::new(),
        }
    }

    /// Key columns as written plus their position in each row
    fn key_columns(&self, insert: &InsertStatement) -> Option<Vec<(String, usize)>> {
        match self.catalog.keys_for(&insert.table.name) {
            Some(keys) if !keys.is_empty() => keys
                .iter()
                .enumerate()
                .map(|(i, key)| {
                    if insert.columns.is_empty() {
                        Some((key.clone(), i))
                    } else {
                        let pos = insert
                            .columns
                            .iter()
                            .position(|c| c.name.eq_ignore_ascii_case(key))?;
                        Some((insert.columns[pos].sql.clone(), pos))
                    }
                })
                .collect(),
            _ => insert.columns.first().map(|c| vec![(c.sql.clone(), 0)]),
        }
    }

    fn key_condition(keys: &[(String, usize)], row: &[String]) -> Option<String> {
        let parts = keys
            .iter()
            .map(|(column, pos)| row.get(*pos).map(|v| format!("{}={}", column, v)))
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join(" AND "))
    }

    fn insert_undo(&self, insert: &InsertStatement) -> Option<String> {
        let keys = self.key_columns(insert)?;
        if let Some(assignments) = &insert.on_duplicate {
            return self.upsert_undo(insert, &keys, assignments);
        }
        let conditions = insert
            .rows
            .iter()
            .map(|row| Self::key_condition(&keys, row))
            .collect::<Option<Vec<_>>>()?;
        let predicate = match conditions.as_slice() {
            [] => return None,
            [single] => single.clone(),
            many => many
                .iter()
                .map(|c| format!("({})", c))
                .collect::<Vec<_>>()
                .join(" OR "),
        };
        Some(format!("DELETE FROM {} WHERE {}", insert.table.sql, predicate))
    }

    /// Only `col = col + n` / `col = col - n` adjustments have an inverse
    fn upsert_undo(
        &self,
        insert: &InsertStatement,
        keys: &[(String, usize)],
        assignments: &[Assignment],
    ) -> Option<String> {
        let [row] = insert.rows.as_slice() else {
            return None;
        };
        let mut inverse = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let significant: Vec<&Token> = assignment
                .value
                .iter()
                .filter(|t| !matches!(t, Token::Whitespace(_)))
                .collect();
            let [Token::Word(column), op, Token::Number(amount, _)] = significant.as_slice() else {
                return None;
            };
            if !column.value.eq_ignore_ascii_case(&assignment.column.name) {
                return None;
            }
            let inverse_op = match op {
                Token::Plus => "-",
                Token::Minus => "+",
                _ => return None,
            };
            inverse.push(format!(
                "{col} = {col} {} {}",
                inverse_op,
                amount,
                col = assignment.column.sql
            ));
        }
        let condition = Self::key_condition(keys, row)?;
        Some(format!(
            "UPDATE {} SET {} WHERE {}",
            insert.table.sql,
            inverse.join(", "),
            condition
        ))
    }

    async fn update_undo<T: Transport>(
        &self,
        group: &mut ServerGroup<T>,
        update: &UpdateStatement,
        replica: usize,
    ) -> Result<Option<String>> {
        // no WHERE: could touch any number of rows
        let Some(where_clause) = &update.where_clause else {
            return Ok(None);
        };
        // restoring through the same WHERE would find no row afterwards
        if update.moves_its_rows() {
            return Ok(None);
        }
        let columns: Vec<&str> = update
            .assignments
            .iter()
            .map(|a| a.column.sql.as_str())
            .collect();
        let select = format!(
            "SELECT {} FROM {} {}",
            columns.join(", "),
            update.table.sql,
            where_clause
        );
        group.send_query(replica, &select).await?;
        group.wait_for(replica).await?;

        let Some(response) = group.get_result(replica) else {
            return Ok(None);
        };
        if let Some(err) = response.error() {
            debug!(code = err.code, message = %err.message, "Pre-image select failed");
            return Ok(None);
        }
        let resultset = match response.text_result_set() {
            Ok(Some(resultset)) => resultset,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(error = %e, "Could not decode pre-image");
                return Ok(None);
            }
        };
        // zero rows: nothing to restore; several: WHERE is not a key lookup
        let [row] = resultset.rows.as_slice() else {
            return Ok(None);
        };
        if row.len() != columns.len() || resultset.columns.len() != columns.len() {
            return Ok(None);
        }
        let restores: Vec<String> = columns
            .iter()
            .zip(row.iter().zip(&resultset.columns))
            .map(|(column, (value, info))| format!("{}={}", column, render_value(value.as_deref(), info)))
            .collect();
        Ok(Some(format!(
            "UPDATE {} SET {} {}",
            update.table.sql,
            restores.join(", "),
            where_clause
        )))
    }
}
