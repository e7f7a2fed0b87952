//! SQL syntax checking and review.
//!
//! [`SqlAdvisor`] is the seam for a real linter. [`BasicAdvisor`] splits
//! statements with a small lexer and applies a handful of review rules.

use async_trait::async_trait;
use strata_core::check::Finding;
use strata_core::instance::Engine;

pub mod codes {
    pub const EMPTY_STATEMENT: i32 = 201;
    pub const UNTERMINATED: i32 = 202;
    pub const UNBALANCED_PARENS: i32 = 203;

    pub const NO_WHERE: i32 = 301;
    pub const DROP_OBJECT: i32 = 302;
    pub const SELECT_STAR: i32 = 303;
    pub const NOT_NULL_WITHOUT_DEFAULT: i32 = 304;
    pub const TRUNCATE: i32 = 305;

    pub const DML_IN_SCHEMA_UPDATE: i32 = 401;
    pub const DDL_IN_DATA_UPDATE: i32 = 402;
    pub const CREATE_DATABASE: i32 = 403;
}

#[async_trait]
pub trait SqlAdvisor: Send + Sync {
    /// Findings for statements that would not parse.
    async fn check_syntax(&self, engine: Engine, sql: &str) -> Vec<Finding>;

    /// Review findings for statements that parse.
    async fn review(&self, engine: Engine, sql: &str) -> Vec<Finding>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Ddl,
    Dml,
    CreateDatabase,
    Other,
}

/// Classifies one statement by its leading keywords.
pub fn statement_kind(statement: &str) -> StatementKind {
    let words: Vec<String> = strip_comments(statement)
        .split_whitespace()
        .take(2)
        .map(|w| w.to_ascii_uppercase())
        .collect();
    match words.first().map(String::as_str) {
        Some("CREATE") if words.get(1).map(String::as_str) == Some("DATABASE") => {
            StatementKind::CreateDatabase
        }
        Some("CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "COMMENT" | "RENAME") => StatementKind::Ddl,
        Some("INSERT" | "UPDATE" | "DELETE" | "MERGE" | "COPY") => StatementKind::Dml,
        _ => StatementKind::Other,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub code: i32,
    pub message: String,
}

/// Splits `sql` on top-level semicolons, honoring quotes, comments and
/// dollar quoting. Empty statements are dropped.
pub fn split_statements(sql: &str) -> Result<Vec<String>, SyntaxError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    let unterminated = |what: &str| SyntaxError {
        code: codes::UNTERMINATED,
        message: format!("Unterminated {what}"),
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                let start = i;
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(unterminated(if c == '\'' {
                                "string literal"
                            } else {
                                "quoted identifier"
                            }));
                        }
                        Some(&ch) if ch == c => {
                            if chars.get(i + 1) == Some(&c) {
                                i += 2;
                                continue;
                            }
                            break;
                        }
                        Some(_) => i += 1,
                    }
                }
                current.extend(&chars[start..=i]);
                i += 1;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                loop {
                    if i + 1 >= chars.len() {
                        return Err(unterminated("block comment"));
                    }
                    if chars[i] == '*' && chars[i + 1] == '/' {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
                current.push(' ');
            }
            '$' => {
                let tag_end = chars[i + 1..]
                    .iter()
                    .position(|ch| !(ch.is_alphanumeric() || *ch == '_'))
                    .map(|p| i + 1 + p);
                match tag_end {
                    Some(end) if chars[end] == '$' => {
                        let tag: String = chars[i..=end].iter().collect();
                        let body_start = end + 1;
                        let rest: String = chars[body_start..].iter().collect();
                        let Some(close) = rest.find(&tag) else {
                            return Err(unterminated("dollar-quoted string"));
                        };
                        let close_chars = rest[..close].chars().count();
                        let stop = body_start + close_chars + tag.chars().count();
                        current.extend(&chars[i..stop]);
                        i = stop;
                    }
                    _ => {
                        current.push(c);
                        i += 1;
                    }
                }
            }
            ';' => {
                push_statement(&mut statements, &mut current);
                i += 1;
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }
    push_statement(&mut statements, &mut current);
    Ok(statements)
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
    current.clear();
}

fn strip_comments(statement: &str) -> String {
    statement
        .lines()
        .map(|line| line.split("--").next().unwrap_or_default())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parenthesis depth check that ignores quoted text.
fn parens_balanced(statement: &str) -> bool {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for c in statement.chars() {
        match (quote, c) {
            (Some(q), ch) if ch == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BasicAdvisor;

impl BasicAdvisor {
    fn review_statement(statement: &str, findings: &mut Vec<Finding>) {
        let upper = statement.to_ascii_uppercase();
        let words: Vec<&str> = upper.split_whitespace().collect();
        let first = words.first().copied().unwrap_or_default();

        if matches!(first, "UPDATE" | "DELETE") && !words.contains(&"WHERE") {
            findings.push(Finding::warn(
                codes::NO_WHERE,
                format!("{first} without WHERE"),
                format!("\"{statement}\" affects every row of the table"),
            ));
        }
        if first == "DROP" && matches!(words.get(1).copied(), Some("TABLE" | "DATABASE" | "SCHEMA")) {
            findings.push(Finding::warn(
                codes::DROP_OBJECT,
                "Dropping an object",
                format!("\"{statement}\" cannot be undone"),
            ));
        }
        if first == "TRUNCATE" {
            findings.push(Finding::warn(
                codes::TRUNCATE,
                "Truncating a table",
                format!("\"{statement}\" removes every row"),
            ));
        }
        if upper.contains("SELECT *") {
            findings.push(Finding::warn(
                codes::SELECT_STAR,
                "SELECT *",
                "List columns explicitly so schema changes do not alter results",
            ));
        }
        if first == "ALTER"
            && upper.contains("ADD COLUMN")
            && upper.contains("NOT NULL")
            && !upper.contains("DEFAULT")
        {
            findings.push(Finding::error(
                codes::NOT_NULL_WITHOUT_DEFAULT,
                "NOT NULL column without default",
                format!("\"{statement}\" fails on tables that already have rows"),
            ));
        }
    }
}

#[async_trait]
impl SqlAdvisor for BasicAdvisor {
    async fn check_syntax(&self, _engine: Engine, sql: &str) -> Vec<Finding> {
        let statements = match split_statements(sql) {
            Ok(statements) => statements,
            Err(e) => return vec![Finding::error(e.code, "Syntax error", e.message)],
        };
        if statements.is_empty() {
            return vec![Finding::error(
                codes::EMPTY_STATEMENT,
                "Empty statement",
                "The task has no SQL to run",
            )];
        }

        let findings: Vec<Finding> = statements
            .iter()
            .filter(|s| !parens_balanced(s))
            .map(|s| {
                Finding::error(
                    codes::UNBALANCED_PARENS,
                    "Syntax error",
                    format!("Unbalanced parentheses in \"{s}\""),
                )
            })
            .collect();
        if findings.is_empty() {
            vec![Finding::success("OK")]
        } else {
            findings
        }
    }

    async fn review(&self, _engine: Engine, sql: &str) -> Vec<Finding> {
        let Ok(statements) = split_statements(sql) else {
            // Reported by the syntax check.
            return vec![];
        };
        let mut findings = Vec::new();
        for statement in &statements {
            Self::review_statement(statement, &mut findings);
        }
        if findings.is_empty() {
            findings.push(Finding::success("OK"));
        }
        findings
    }
}
