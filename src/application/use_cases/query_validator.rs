//! Query Validator
//!
//! Final gate before the database, whatever produced the SQL. Checks in order:
//! 1. non-empty, no unsubstituted template tokens
//! 2. lexes cleanly: terminated literals without backslash escapes, no comments
//! 3. exactly one statement (one trailing `;` tolerated)
//! 4. leading keyword is SELECT
//! 5. no DDL/DML keywords outside string literals
//! 6. every table in a FROM list or after JOIN is on the allowlist
//!
//! Any rejection is an `UnsafeStatement` and is never retried or repaired.

use crate::domain::error::{AppError, QueryRejection, Result};
use crate::domain::query_template::TOKEN_OPEN;
use crate::infrastructure::config::AllowlistConfig;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error};

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "EXEC", "EXECUTE", "MERGE", "GRANT",
    "TRUNCATE", "CREATE", "REVOKE", "PRAGMA", "ATTACH", "DETACH", "INTO",
];

/// Words that end a FROM list instead of aliasing a table.
const CLAUSE_WORDS: &[&str] = &[
    "WHERE", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS", "ON", "USING", "GROUP",
    "ORDER", "HAVING", "LIMIT", "OFFSET", "UNION", "EXCEPT", "INTERSECT", "FETCH", "WINDOW",
    "NATURAL", "FOR", "WITH",
];

/// Functions whose argument syntax uses FROM without naming a table.
const FROM_FUNCTIONS: &[&str] = &["EXTRACT", "SUBSTRING", "TRIM", "OVERLAY", "POSITION"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlValidation {
    pub ok: bool,
    pub error_kind: Option<QueryRejection>,
    /// Table references found, as written.
    pub tables: Vec<String>,
}

impl SqlValidation {
    fn valid(tables: Vec<String>) -> Self {
        Self {
            ok: true,
            error_kind: None,
            tables,
        }
    }

    fn rejected(kind: QueryRejection) -> Self {
        Self {
            ok: false,
            error_kind: Some(kind),
            tables: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct AllowEntry {
    schema: Option<String>,
    /// `*` allows the whole schema.
    table: String,
}

pub struct QueryValidator {
    allowed: Vec<AllowEntry>,
    default_schema: Option<String>,
    deny_keywords: Vec<String>,
}

/// Whole-word search; `_` counts as part of a word so `CREATED_AT` is not `CREATE`.
pub fn contains_whole_word(text: &str, keyword: &str) -> bool {
    let text_bytes = text.as_bytes();
    let keyword_bytes = keyword.as_bytes();
    let keyword_len = keyword_bytes.len();
    if keyword_len == 0 || keyword_len > text_bytes.len() {
        return false;
    }
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';

    for i in 0..=(text_bytes.len() - keyword_len) {
        if &text_bytes[i..i + keyword_len] == keyword_bytes {
            let before_ok = i == 0 || !is_word(text_bytes[i - 1]);
            let after_ok =
                i + keyword_len == text_bytes.len() || !is_word(text_bytes[i + keyword_len]);
            if before_ok && after_ok {
                return true;
            }
        }
    }
    false
}

/// Hex SHA-256 of the statement, for audit correlation without the SQL.
pub fn fingerprint(sql: &str) -> String {
    hex::encode(Sha256::digest(sql.as_bytes()))
}

/// Replace string literals with `?` and unwrap quoted identifiers.
fn mask_literals(sql: &str) -> std::result::Result<String, QueryRejection> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '-' if next == Some('-') => return Err(QueryRejection::CommentNotAllowed),
            '/' if next == Some('*') => return Err(QueryRejection::CommentNotAllowed),
            '\'' => {
                // E'..' strings honour backslash escapes, which would move the
                // closing quote out from under this scan.
                let escape_prefix = i > 0
                    && matches!(chars[i - 1], 'E' | 'e')
                    && (i < 2 || !(chars[i - 2].is_alphanumeric() || chars[i - 2] == '_'));
                if escape_prefix {
                    return Err(QueryRejection::Malformed);
                }
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(QueryRejection::Malformed),
                        Some('\\') => return Err(QueryRejection::Malformed),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => i += 2,
                        Some('\'') => break,
                        Some(_) => i += 1,
                    }
                }
                out.push('?');
            }
            '"' | '[' | '`' => {
                let close = match c {
                    '[' => ']',
                    other => other,
                };
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(QueryRejection::Malformed),
                        Some(ch) if *ch == close => break,
                        Some(ch) if ch.is_whitespace() => {
                            out.push('_');
                            i += 1;
                        }
                        Some(ch) => {
                            out.push(*ch);
                            i += 1;
                        }
                    }
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    Ok(out)
}

fn tokenize(masked: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for c in masked.chars() {
        if c.is_alphanumeric() || matches!(c, '_' | '.' | '$' | '#' | '*') {
            word.push(c);
        } else {
            if !word.is_empty() {
                tokens.push(std::mem::take(&mut word));
            }
            if !c.is_whitespace() {
                tokens.push(c.to_string());
            }
        }
    }
    if !word.is_empty() {
        tokens.push(word);
    }
    tokens
}

/// Words that close the FROM list of the current query level.
const LIST_END_WORDS: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "UNION", "EXCEPT", "INTERSECT",
    "FETCH", "WINDOW", "FOR",
];

/// Record the table reference starting at `j`, skipping its alias.
/// A derived table `( ... )` is left for the caller to walk.
fn take_reference(
    tokens: &[String],
    upper: &[String],
    mut j: usize,
    tables: &mut Vec<String>,
) -> usize {
    match tokens.get(j) {
        Some(token) if token != "(" && token != "," => {
            tables.push(token.clone());
            j += 1;
            if upper.get(j).map(String::as_str) == Some("AS") {
                j += 2;
            } else if let Some(word) = upper.get(j) {
                if is_alias(word) {
                    j += 1;
                }
            }
            j
        }
        _ => j,
    }
}

fn is_alias(word: &str) -> bool {
    word.chars()
        .next()
        .map_or(false, |c| c.is_alphabetic() || c == '_')
        && !CLAUSE_WORDS.contains(&word)
        && !LIST_END_WORDS.contains(&word)
}

/// Table references following FROM / JOIN, including comma lists that
/// continue after a derived table.
fn referenced_tables(masked: &str) -> Vec<String> {
    let tokens = tokenize(masked);
    let upper: Vec<String> = tokens.iter().map(|t| t.to_uppercase()).collect();
    let mut tables = Vec::new();
    // word preceding each open parenthesis
    let mut parens: Vec<String> = Vec::new();
    // paren depths with an open FROM list
    let mut from_lists: Vec<usize> = Vec::new();

    let mut i = 0;
    while i < tokens.len() {
        let depth = parens.len();
        let in_list = from_lists.last() == Some(&depth);
        match upper[i].as_str() {
            "(" => parens.push(if i > 0 { upper[i - 1].clone() } else { String::new() }),
            ")" => {
                while from_lists.last() == Some(&depth) {
                    from_lists.pop();
                }
                parens.pop();
            }
            "FROM" | "JOIN" => {
                let inside_function = upper[i] == "FROM"
                    && parens
                        .last()
                        .map_or(false, |w| FROM_FUNCTIONS.contains(&w.as_str()));
                if !inside_function {
                    if !in_list {
                        from_lists.push(depth);
                    }
                    i = take_reference(&tokens, &upper, i + 1, &mut tables);
                    continue;
                }
            }
            "," if in_list => {
                i = take_reference(&tokens, &upper, i + 1, &mut tables);
                continue;
            }
            word if in_list && LIST_END_WORDS.contains(&word) => {
                from_lists.pop();
            }
            _ => {}
        }
        i += 1;
    }
    tables
}

impl QueryValidator {
    pub fn new(config: &AllowlistConfig) -> Self {
        let default_schema = config
            .default_schema
            .as_ref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());

        let allowed = config
            .tables
            .iter()
            .filter_map(|entry| {
                let entry = entry.trim().to_lowercase();
                match entry.rsplit_once('.') {
                    Some((schema, table)) if !table.is_empty() => Some(AllowEntry {
                        schema: Some(schema.to_string()),
                        table: table.to_string(),
                    }),
                    Some(_) => None,
                    None if entry.is_empty() => None,
                    None => Some(AllowEntry {
                        schema: default_schema.clone(),
                        table: entry,
                    }),
                }
            })
            .collect();

        Self {
            allowed,
            default_schema,
            deny_keywords: config
                .deny_keywords
                .iter()
                .map(|k| k.trim().to_uppercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn is_table_allowed(&self, reference: &str) -> bool {
        let reference = reference.trim().to_lowercase();
        let parts: Vec<&str> = reference.split('.').filter(|p| !p.is_empty()).collect();
        let (schema, table) = match parts.as_slice() {
            [table] => (self.default_schema.clone(), table.to_string()),
            [.., schema, table] => (Some(schema.to_string()), table.to_string()),
            [] => return false,
        };
        self.allowed
            .iter()
            .any(|e| e.schema == schema && (e.table == "*" || e.table == table))
    }

    pub fn validate(&self, sql: &str) -> SqlValidation {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return SqlValidation::rejected(QueryRejection::Empty);
        }
        if trimmed.contains(TOKEN_OPEN) {
            return SqlValidation::rejected(QueryRejection::UnsubstitutedToken);
        }

        let masked = match mask_literals(trimmed) {
            Ok(m) => m,
            Err(kind) => return SqlValidation::rejected(kind),
        };

        let statements: Vec<&str> = masked.split(';').map(str::trim).collect();
        let statement = match statements.as_slice() {
            [only] => *only,
            [only, ""] => *only,
            _ => return SqlValidation::rejected(QueryRejection::MultipleStatements),
        };
        if statement.is_empty() {
            return SqlValidation::rejected(QueryRejection::Empty);
        }

        let upper = statement.to_uppercase();
        let leading = upper
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .find(|w| !w.is_empty())
            .unwrap_or("");
        if leading != "SELECT" {
            return SqlValidation::rejected(QueryRejection::NotSelect);
        }

        for keyword in FORBIDDEN_KEYWORDS
            .iter()
            .copied()
            .chain(self.deny_keywords.iter().map(String::as_str))
        {
            if contains_whole_word(&upper, keyword) {
                return SqlValidation::rejected(QueryRejection::ForbiddenKeyword(
                    keyword.to_string(),
                ));
            }
        }

        let tables = referenced_tables(statement);
        if let Some(bad) = tables.iter().find(|t| !self.is_table_allowed(t)) {
            return SqlValidation::rejected(QueryRejection::TableNotAllowed(bad.clone()));
        }

        debug!("SQL passed validation ({} table refs)", tables.len());
        SqlValidation::valid(tables)
    }

    /// Validate and audit. Rejections are fatal `UnsafeStatement` errors.
    pub fn check(&self, sql: &str) -> Result<Vec<String>> {
        let result = self.validate(sql);
        match result.error_kind {
            None => Ok(result.tables),
            Some(kind) => {
                error!(
                    audit = true,
                    fingerprint = %fingerprint(sql),
                    "Rejected SQL: {}",
                    kind
                );
                Err(AppError::UnsafeStatement(kind))
            }
        }
    }
}
