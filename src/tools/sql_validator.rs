//! Query safety validation.
//!
//! Every query passes through [`QueryValidator::validate`] before a connection
//! is acquired. The validator:
//!
//! - bounds the request size and the effective row limit;
//! - tokenizes the text with [sqlparser](https://docs.rs/sqlparser/), using the
//!   backend's own dialect so comments and string escapes split the way the
//!   server splits them, and rejects batches, MySQL executable comments and, on read-only backends, anything
//!   that is not a single SELECT;
//! - counts and rewrites parameter placeholders into the driver's native style.
//!
//! The lexical verdict is authoritative. When the dialect parser also accepts
//! the statement, its AST must agree. When the parser cannot read a read-only
//! query, a `;` anywhere but at the end is enough to reject it.

use sqlparser::ast::Statement;
use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, TokenWithSpan, Tokenizer, Whitespace};
use tracing::debug;

use crate::db::adapter::PlaceholderStyle;
use crate::error::{DbError, DbResult};
use crate::models::query::{MAX_PARAM_LENGTH, MAX_PARAMS, MAX_QUERY_LENGTH};
use crate::models::{BackendType, DEFAULT_ROW_LIMIT, MAX_ROW_LIMIT, QueryParam};

/// Type of SQL statement, from its leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// SELECT, WITH, or a parenthesized select
    Select,
    /// INSERT, UPDATE, DELETE, MERGE, REPLACE, UPSERT, COPY, LOAD
    DmlWrite,
    /// CREATE, DROP, ALTER, TRUNCATE, RENAME, COMMENT
    Ddl,
    /// BEGIN, COMMIT, ROLLBACK, SAVEPOINT, RELEASE, START
    Transaction,
    /// CALL, EXECUTE, EXEC, DO, PREPARE
    ProcedureCall,
    /// GRANT, REVOKE, SET, LOCK, VACUUM, PRAGMA, ...
    Administrative,
    /// SHOW, DESCRIBE, EXPLAIN
    Introspection,
    Unknown,
}

impl StatementKind {
    pub fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "SELECT" | "WITH" | "(" => Self::Select,
            "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "UPSERT" | "REPLACE" | "COPY" | "LOAD" => {
                Self::DmlWrite
            }
            "CREATE" | "DROP" | "ALTER" | "TRUNCATE" | "RENAME" | "COMMENT" => Self::Ddl,
            "BEGIN" | "START" | "COMMIT" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" | "END" => {
                Self::Transaction
            }
            "CALL" | "EXEC" | "EXECUTE" | "DO" | "PREPARE" => Self::ProcedureCall,
            "GRANT" | "REVOKE" | "SET" | "RESET" | "LOCK" | "UNLOCK" | "VACUUM" | "ANALYZE"
            | "REINDEX" | "CLUSTER" | "REFRESH" | "LISTEN" | "NOTIFY" | "PRAGMA" | "ATTACH"
            | "DETACH" | "OPTIMIZE" | "HANDLER" | "REORG" | "KILL" | "FLUSH" | "USE" => {
                Self::Administrative
            }
            "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" => Self::Introspection,
            _ => Self::Unknown,
        }
    }
}

/// Error messages for each statement type category.
mod error_messages {
    pub const READ_ONLY: &str = "backend is read-only; only a single SELECT query may run";
    pub const TRANSACTION: &str =
        "Transaction control is not supported; each query runs on its own";
    pub const MULTIPLE: &str = "Multiple statements are not allowed";
    pub const EXECUTABLE_COMMENT: &str = "MySQL executable comments (/*! ... */) are not allowed";
    pub const NAMED_PLACEHOLDER: &str =
        "Named placeholders are not supported; use ?, $1 or %s with an ordered parameter list";
    pub const MIXED_PLACEHOLDERS: &str = "Placeholder styles cannot be mixed in one query";
}

/// Keywords that write, lock or escalate, wherever they appear.
const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "UPSERT", "DROP", "CREATE", "ALTER", "TRUNCATE",
    "GRANT", "REVOKE", "CALL", "EXEC", "EXECUTE", "INTO", "LOCK",
];

fn backend_write_keywords(backend: BackendType) -> &'static [&'static str] {
    match backend {
        BackendType::Postgres => &[
            "COPY", "DO", "LISTEN", "NOTIFY", "VACUUM", "REFRESH", "CLUSTER", "REINDEX",
        ],
        BackendType::MySql => &["LOAD", "HANDLER", "OPTIMIZE", "RENAME"],
        BackendType::Sqlite => &["PRAGMA", "ATTACH", "DETACH", "VACUUM", "REINDEX"],
        BackendType::Db2 => &["REORG"],
    }
}

/// Get the appropriate SQL dialect for the given backend.
fn dialect_for(backend: BackendType) -> Box<dyn Dialect> {
    match backend {
        BackendType::Postgres => Box::new(PostgreSqlDialect {}),
        BackendType::MySql => Box::new(MySqlDialect {}),
        BackendType::Sqlite => Box::new(SQLiteDialect {}),
        BackendType::Db2 => Box::new(GenericDialect {}),
    }
}

/// Limits applied to every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryPolicy {
    pub default_row_limit: u32,
    pub max_row_limit: u32,
    /// In characters.
    pub max_query_length: usize,
    /// In characters, after NUL stripping.
    pub max_param_length: usize,
    pub max_params: usize,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            default_row_limit: DEFAULT_ROW_LIMIT,
            max_row_limit: MAX_ROW_LIMIT,
            max_query_length: MAX_QUERY_LENGTH,
            max_param_length: MAX_PARAM_LENGTH,
            max_params: MAX_PARAMS,
        }
    }
}

/// The backend a query is validated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryTarget {
    pub backend_type: BackendType,
    pub read_only: bool,
    pub placeholder_style: PlaceholderStyle,
}

/// A query that passed validation, rewritten for its driver.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedQuery {
    pub sql: String,
    pub params: Vec<QueryParam>,
    pub row_limit: u32,
    pub statement: StatementKind,
}

impl ValidatedQuery {
    /// Rows to pull from the driver; one extra detects truncation.
    pub fn fetch_limit(&self) -> usize {
        self.row_limit as usize + 1
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryValidator {
    policy: QueryPolicy,
}

impl QueryValidator {
    pub fn new(policy: QueryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &QueryPolicy {
        &self.policy
    }

    /// Resolve the caller's row limit: default when absent, clamped to the ceiling.
    pub fn effective_row_limit(&self, requested: Option<u32>) -> DbResult<u32> {
        match requested {
            None => Ok(self.policy.default_row_limit.min(self.policy.max_row_limit)),
            Some(0) => Err(DbError::validation("row_limit must be at least 1")),
            Some(n) => Ok(n.min(self.policy.max_row_limit)),
        }
    }

    pub fn validate(
        &self,
        target: QueryTarget,
        sql: &str,
        params: &[QueryParam],
        row_limit: Option<u32>,
    ) -> DbResult<ValidatedQuery> {
        if sql.trim().is_empty() {
            return Err(DbError::validation("Query is empty"));
        }
        let length = sql.chars().count();
        if length > self.policy.max_query_length {
            return Err(DbError::validation(format!(
                "Query is {length} characters; the limit is {}",
                self.policy.max_query_length
            )));
        }
        if params.len() > self.policy.max_params {
            return Err(DbError::validation(format!(
                "{} parameters supplied; the limit is {}",
                params.len(),
                self.policy.max_params
            )));
        }
        let params = self.sanitize_params(params)?;
        let row_limit = self.effective_row_limit(row_limit)?;

        let tokens = tokenize(sql, target.backend_type)?;
        let statement = check_statements(&tokens, target)?;
        if target.read_only {
            check_parsed(sql, target.backend_type)?;
        }

        let occurrences = find_placeholders(sql, &tokens, target.backend_type)?;
        let (sql, params) = rewrite_placeholders(sql, &occurrences, params, target.placeholder_style)?;

        debug!(
            backend_type = %target.backend_type,
            statement = ?statement,
            params = params.len(),
            row_limit,
            "Query validated"
        );
        Ok(ValidatedQuery {
            sql,
            params,
            row_limit,
            statement,
        })
    }

    fn sanitize_params(&self, params: &[QueryParam]) -> DbResult<Vec<QueryParam>> {
        params
            .iter()
            .enumerate()
            .map(|(index, param)| match param {
                QueryParam::String(s) => {
                    let cleaned: String = s.chars().filter(|&c| c != '\0').collect();
                    let length = cleaned.chars().count();
                    if length > self.policy.max_param_length {
                        return Err(DbError::validation(format!(
                            "Parameter {} is {length} characters; the limit is {}",
                            index + 1,
                            self.policy.max_param_length
                        )));
                    }
                    Ok(QueryParam::String(cleaned))
                }
                other => Ok(other.clone()),
            })
            .collect()
    }
}

fn tokenize(sql: &str, backend: BackendType) -> DbResult<Vec<TokenWithSpan>> {
    let dialect = dialect_for(backend);
    Tokenizer::new(dialect.as_ref(), sql)
        .tokenize_with_location()
        .map_err(|e| DbError::validation(format!("Could not tokenize query: {e}")))
}

/// Uppercased keyword a statement starts with.
fn leading_keyword(statement: &[&TokenWithSpan]) -> String {
    match statement.first().map(|t| &t.token) {
        Some(Token::Word(word)) => word.value.to_ascii_uppercase(),
        Some(Token::LParen) => "(".to_string(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Lexical checks: one statement, no executable comments, read-only policy.
fn check_statements(tokens: &[TokenWithSpan], target: QueryTarget) -> DbResult<StatementKind> {
    let mut statements: Vec<Vec<&TokenWithSpan>> = vec![Vec::new()];
    for token in tokens {
        match &token.token {
            Token::Whitespace(Whitespace::MultiLineComment(body)) if body.starts_with('!') => {
                return Err(DbError::validation(error_messages::EXECUTABLE_COMMENT));
            }
            Token::Whitespace(_) | Token::EOF => {}
            Token::SemiColon => statements.push(Vec::new()),
            _ => {
                if let Some(current) = statements.last_mut() {
                    current.push(token);
                }
            }
        }
    }
    statements.retain(|s| !s.is_empty());

    let Some(first) = statements.first() else {
        return Err(DbError::validation("Query is empty"));
    };
    if let Some(second) = statements.get(1) {
        let keyword = leading_keyword(second);
        return Err(DbError::rejected_keyword(
            &keyword,
            format!(
                "{}; found a second statement starting with {keyword}",
                error_messages::MULTIPLE
            ),
        ));
    }

    let keyword = leading_keyword(first);
    let kind = StatementKind::from_keyword(&keyword);

    if kind == StatementKind::Transaction {
        return Err(DbError::rejected_keyword(
            &keyword,
            format!("{keyword}: {}", error_messages::TRANSACTION),
        ));
    }
    if !target.read_only {
        return Ok(kind);
    }

    if kind != StatementKind::Select {
        return Err(DbError::rejected_keyword(
            &keyword,
            format!("{keyword} rejected: {}", error_messages::READ_ONLY),
        ));
    }

    let extras = backend_write_keywords(target.backend_type);
    for (index, token) in first.iter().enumerate() {
        let Token::Word(word) = &token.token else {
            continue;
        };
        if word.quote_style.is_some() {
            continue;
        }
        let upper = word.value.to_ascii_uppercase();
        let is_write = WRITE_KEYWORDS.contains(&upper.as_str()) || extras.contains(&upper.as_str());
        // REPLACE(...) is the string function.
        let is_replace = upper == "REPLACE"
            && !matches!(first.get(index + 1).map(|t| &t.token), Some(Token::LParen));
        if is_write || is_replace {
            return Err(DbError::rejected_keyword(
                &upper,
                format!(
                    "{upper} is not allowed inside a query: {}",
                    error_messages::READ_ONLY
                ),
            ));
        }
    }

    Ok(kind)
}

/// Ask the dialect parser for a second opinion.
fn check_parsed(sql: &str, backend: BackendType) -> DbResult<()> {
    let dialect = dialect_for(backend);
    let statements = match Parser::parse_sql(dialect.as_ref(), sql) {
        Ok(statements) => statements,
        Err(e) if has_inner_semicolon(sql) => {
            return Err(DbError::validation(format!(
                "{}; the query could not be parsed as a single statement ({e})",
                error_messages::MULTIPLE
            )));
        }
        Err(e) => {
            debug!(error = %e, "Parser rejected query; using lexical verdict");
            return Ok(());
        }
    };

    match statements.as_slice() {
        [Statement::Query(_)] => Ok(()),
        [statement] => {
            let name = statement_name(statement);
            Err(DbError::rejected_keyword(
                name,
                format!("{name} rejected: {}", error_messages::READ_ONLY),
            ))
        }
        _ => Err(DbError::validation(error_messages::MULTIPLE)),
    }
}

/// True when `;` appears anywhere except a trailing terminator.
///
/// Byte-level on purpose: literals and comments are not trusted here.
fn has_inner_semicolon(sql: &str) -> bool {
    sql.trim_end()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
        .contains(';')
}

/// Name of a parsed statement that is not a query.
fn statement_name(stmt: &Statement) -> &'static str {
    match stmt {
        Statement::Query(_) => "SELECT",
        Statement::Insert(_) => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete(_) => "DELETE",
        Statement::Merge { .. } => "MERGE",
        Statement::Copy { .. } => "COPY",
        Statement::CreateTable { .. }
        | Statement::CreateView { .. }
        | Statement::CreateIndex(_)
        | Statement::CreateSchema { .. }
        | Statement::CreateDatabase { .. }
        | Statement::CreateFunction { .. }
        | Statement::CreateProcedure { .. }
        | Statement::CreateTrigger { .. } => "CREATE",
        Statement::AlterTable { .. } | Statement::AlterView { .. } | Statement::AlterIndex { .. } => {
            "ALTER"
        }
        Statement::Drop { .. } => "DROP",
        Statement::Truncate { .. } => "TRUNCATE",
        Statement::Call { .. } => "CALL",
        Statement::Execute { .. } => "EXECUTE",
        Statement::Grant { .. } => "GRANT",
        Statement::Revoke { .. } => "REVOKE",
        Statement::Set(_) => "SET",
        Statement::Pragma { .. } => "PRAGMA",
        Statement::Vacuum { .. } => "VACUUM",
        Statement::ExplainTable { .. } | Statement::Explain { .. } => "EXPLAIN",
        Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowDatabases { .. }
        | Statement::ShowVariables { .. } => "SHOW",
        _ => "UNKNOWN",
    }
}

// =============================================================================
// Placeholders
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    /// `?`
    QuestionMark,
    /// `$n`
    Dollar(usize),
    /// `?n`
    NumberedQuestion(usize),
    /// `%s`
    Format,
}

impl Marker {
    fn family(self) -> u8 {
        match self {
            Self::QuestionMark => 0,
            Self::Dollar(_) => 1,
            Self::NumberedQuestion(_) => 2,
            Self::Format => 3,
        }
    }

    fn index(self) -> Option<usize> {
        match self {
            Self::Dollar(n) | Self::NumberedQuestion(n) => Some(n),
            Self::QuestionMark | Self::Format => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Occurrence {
    marker: Marker,
    /// Byte range in the original text.
    start: usize,
    end: usize,
}

/// Maps tokenizer line/column locations to byte offsets.
struct Offsets<'a> {
    sql: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> Offsets<'a> {
    fn new(sql: &'a str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(sql.match_indices('\n').map(|(i, _)| i + 1));
        Self { sql, line_starts }
    }

    fn of(&self, token: &TokenWithSpan) -> Option<usize> {
        let line = usize::try_from(token.span.start.line).ok()?.checked_sub(1)?;
        let column = usize::try_from(token.span.start.column).ok()?.checked_sub(1)?;
        let line_start = *self.line_starts.get(line)?;
        let rest = self.sql.get(line_start..)?;
        match rest.char_indices().nth(column) {
            Some((offset, _)) => Some(line_start + offset),
            None => Some(self.sql.len()),
        }
    }
}

/// True when `second` starts exactly `width` bytes after `first`.
fn adjacent(offsets: &Offsets<'_>, first: &TokenWithSpan, second: &TokenWithSpan, width: usize) -> bool {
    match (offsets.of(first), offsets.of(second)) {
        (Some(a), Some(b)) => a + width == b,
        _ => false,
    }
}

fn parse_index(digits: &str) -> DbResult<usize> {
    match digits.parse::<usize>() {
        Ok(0) | Err(_) => Err(DbError::validation(format!(
            "Invalid placeholder index '{digits}'; numbering starts at 1"
        ))),
        Ok(n) => Ok(n),
    }
}

fn named_placeholder(name: &str) -> DbError {
    DbError::validation(format!("{} (found '{name}')", error_messages::NAMED_PLACEHOLDER))
}

/// Locate placeholders outside literals and comments.
fn find_placeholders(
    sql: &str,
    tokens: &[TokenWithSpan],
    backend: BackendType,
) -> DbResult<Vec<Occurrence>> {
    let offsets = Offsets::new(sql);
    let mut occurrences = Vec::new();
    let mut bracket_depth = 0usize;

    for (index, token) in tokens.iter().enumerate() {
        let next = tokens.get(index + 1).map(|t| &t.token);
        let marker_at = |marker: Marker, len: usize| -> DbResult<Occurrence> {
            let start = offsets
                .of(token)
                .ok_or_else(|| DbError::internal("placeholder location out of range"))?;
            Ok(Occurrence {
                marker,
                start,
                end: start + len,
            })
        };

        match &token.token {
            Token::LBracket => bracket_depth += 1,
            Token::RBracket => bracket_depth = bracket_depth.saturating_sub(1),
            Token::Placeholder(text) => {
                let marker = if text == "?" {
                    Marker::QuestionMark
                } else if let Some(digits) = text.strip_prefix('?') {
                    Marker::NumberedQuestion(parse_index(digits)?)
                } else if let Some(rest) = text.strip_prefix('$') {
                    if rest.chars().all(|c| c.is_ascii_digit()) {
                        Marker::Dollar(parse_index(rest)?)
                    } else {
                        return Err(named_placeholder(text));
                    }
                } else {
                    return Err(named_placeholder(text));
                };
                occurrences.push(marker_at(marker, text.len())?);
            }
            // The PostgreSQL tokenizer reads `?` as an operator; `?1` arrives as two tokens.
            Token::Question => match (next, tokens.get(index + 1)) {
                (Some(Token::Number(digits, false)), Some(number))
                    if adjacent(&offsets, token, number, 1) =>
                {
                    let marker = Marker::NumberedQuestion(parse_index(digits)?);
                    occurrences.push(marker_at(marker, 1 + digits.len())?);
                }
                _ => occurrences.push(marker_at(Marker::QuestionMark, 1)?),
            },
            // `@` is an operator in PostgreSQL; elsewhere `@name` is a named parameter.
            Token::AtSign if backend != BackendType::Postgres => {
                if let (Some(Token::Word(word)), Some(name)) = (next, tokens.get(index + 1)) {
                    if word.quote_style.is_none() && adjacent(&offsets, token, name, 1) {
                        return Err(named_placeholder(&format!("@{}", word.value)));
                    }
                }
            }
            Token::Word(word) if word.quote_style.is_none() => {
                if let Some(rest) = word.value.strip_prefix('$') {
                    if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
                        occurrences.push(marker_at(Marker::Dollar(parse_index(rest)?), word.value.len())?);
                    }
                } else if word.value.starts_with('@') && !word.value.starts_with("@@") {
                    return Err(named_placeholder(&word.value));
                }
            }
            Token::Colon if bracket_depth == 0 => {
                if let Some(Token::Word(word)) = next {
                    if word.quote_style.is_none() {
                        return Err(named_placeholder(&format!(":{}", word.value)));
                    }
                }
            }
            Token::Mod => match next {
                Some(Token::Word(word)) if word.quote_style.is_none() && word.value == "s" => {
                    occurrences.push(marker_at(Marker::Format, 2)?);
                }
                Some(Token::LParen) => return Err(named_placeholder("%(name)s")),
                _ => {}
            },
            _ => {}
        }
    }

    if let Some(first) = occurrences.first() {
        if occurrences
            .iter()
            .any(|o| o.marker.family() != first.marker.family())
        {
            return Err(DbError::validation(error_messages::MIXED_PLACEHOLDERS));
        }
    }
    Ok(occurrences)
}

/// Check the parameter count and rewrite placeholders into `style`.
///
/// Rewriting works on source byte ranges, so literals and comments are copied
/// through untouched.
fn rewrite_placeholders(
    sql: &str,
    occurrences: &[Occurrence],
    params: Vec<QueryParam>,
    style: PlaceholderStyle,
) -> DbResult<(String, Vec<QueryParam>)> {
    let numbered = occurrences.first().and_then(|o| o.marker.index()).is_some();
    let required = if numbered {
        occurrences
            .iter()
            .filter_map(|o| o.marker.index())
            .max()
            .unwrap_or(0)
    } else {
        occurrences.len()
    };

    if required != params.len() {
        return Err(DbError::validation(format!(
            "Query has {required} placeholder(s) but {} parameter(s) were supplied",
            params.len()
        )));
    }
    if occurrences.is_empty() {
        return Ok((sql.to_string(), params));
    }

    let mut out = String::with_capacity(sql.len() + occurrences.len() * 2);
    let mut reordered = Vec::with_capacity(occurrences.len());
    let mut cursor = 0;
    for (position, occurrence) in occurrences.iter().enumerate() {
        out.push_str(&sql[cursor..occurrence.start]);
        match (style, occurrence.marker.index()) {
            (PlaceholderStyle::DollarNumbered, Some(n)) => out.push_str(&format!("${n}")),
            (PlaceholderStyle::DollarNumbered, None) => {
                out.push_str(&format!("${}", position + 1))
            }
            (PlaceholderStyle::QuestionMark, index) => {
                out.push('?');
                if let Some(n) = index {
                    reordered.push(params[n - 1].clone());
                }
            }
        }
        cursor = occurrence.end;
    }
    out.push_str(&sql[cursor..]);

    let params = if style == PlaceholderStyle::QuestionMark && numbered {
        reordered
    } else {
        params
    };
    Ok((out, params))
}
