use std::collections::BTreeMap;
use std::ops::ControlFlow;

use sqlgate_contracts::ErrorKind;
use sqlparser::ast::{
    BinaryOperator, Expr, Query, SelectItem, SetExpr, Statement, TableFactor, Value, Visit,
    Visitor, visit_expressions,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};

/// The only placeholder untrusted SQL may carry. The execution gateway binds
/// it to the caller's tenant.
pub const TENANT_PLACEHOLDER: &str = ":tenant_id";

/// Predicate map key for conjuncts that reference no qualifier, or several.
pub const UNQUALIFIED: &str = "*";

/// Leading keywords of statements that write, change session state or call
/// procedures. Input starting with one of these is reported as not read-only
/// even when the grammar does not cover it.
const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "UPSERT", "REPLACE", "TRUNCATE", "COPY", "CREATE",
    "ALTER", "DROP", "RENAME", "COMMENT", "GRANT", "REVOKE", "EXEC", "EXECUTE", "CALL", "DO",
    "VACUUM", "REINDEX", "CLUSTER", "REFRESH", "LOCK", "IMPORT", "SECURITY", "REASSIGN",
    "LISTEN", "NOTIFY", "UNLISTEN", "CHECKPOINT", "DISCARD", "LOAD", "SET", "RESET",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// 1-based (line, column) when the tokenizer or parser reported one.
    pub position: Option<(u64, u64)>,
    pub message: String,
    /// Leading keyword of unparseable input that names a write or a
    /// procedure call, e.g. `EXEC`.
    pub write_keyword: Option<String>,
}

impl ParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            position: None,
            message: message.into(),
            write_keyword: None,
        }
    }

    fn at(position: (u64, u64), message: impl Into<String>) -> Self {
        Self {
            position: Some(position),
            ..Self::new(message)
        }
    }

    /// `NonReadOnly` when the input was recognizably a write, otherwise
    /// `ParseError`.
    pub fn error_kind(&self) -> ErrorKind {
        match self.write_keyword {
            Some(_) => ErrorKind::NonReadOnly,
            None => ErrorKind::ParseError,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.position {
            Some((line, column)) => write!(f, "{} (line {}, column {})", self.message, line, column),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<ParserError> for ParseError {
    fn from(err: ParserError) -> Self {
        let message = match &err {
            ParserError::TokenizerError(msg) | ParserError::ParserError(msg) => msg.clone(),
            ParserError::RecursionLimitExceeded => "statement nesting is too deep".to_string(),
        };
        Self {
            position: locate(&message),
            message: strip_location(&message),
            write_keyword: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Merge,
    Ddl,
    Other,
}

impl StatementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::Merge => "MERGE",
            StatementKind::Ddl => "DDL",
            StatementKind::Other => "OTHER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    /// The name other clauses use to refer to this relation.
    pub fn exposed_name(&self) -> &str {
        match &self.alias {
            Some(alias) => alias,
            None => self.name.rsplit('.').next().unwrap_or(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    Wildcard,
    QualifiedWildcard(String),
    Column { expr: String, alias: Option<String> },
}

/// A single parsed statement plus the facts later stages reason about.
/// Only constructed by [`parse`] and by the crate's own rewrites, which
/// re-derive every fact from the new tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedStatement {
    kind: StatementKind,
    keyword: String,
    statement_count: usize,
    ast: Statement,
    tables: Vec<TableRef>,
    predicates: BTreeMap<String, Vec<String>>,
    projection: Vec<Projection>,
    limit: Option<String>,
}

impl ParsedStatement {
    fn analyze(kind: StatementKind, keyword: String, statement_count: usize, ast: Statement) -> Self {
        let mut analyzer = Analyzer::default();
        let _ = ast.visit(&mut analyzer);

        let (projection, limit) = match &ast {
            Statement::Query(query) => (
                leftmost_projection(&query.body),
                query
                    .limit
                    .as_ref()
                    .map(ToString::to_string)
                    .or_else(|| {
                        // `FETCH FIRST ROW ONLY` means one row.
                        query.fetch.as_ref().map(|fetch| {
                            fetch
                                .quantity
                                .as_ref()
                                .map_or_else(|| "1".to_string(), ToString::to_string)
                        })
                    }),
            ),
            _ => (Vec::new(), None),
        };

        Self {
            kind,
            keyword,
            statement_count,
            ast,
            tables: analyzer.tables,
            predicates: analyzer.predicates,
            projection,
            limit,
        }
    }

    /// New statement for a rewritten tree. Kind and statement count carry
    /// over unchanged.
    pub(crate) fn with_ast(&self, ast: Statement) -> Self {
        Self::analyze(self.kind, self.keyword.clone(), self.statement_count, ast)
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    /// Leading keyword as written, e.g. `DROP` for a DDL statement.
    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    pub fn statement_count(&self) -> usize {
        self.statement_count
    }

    pub fn ast(&self) -> &Statement {
        &self.ast
    }

    pub fn tables(&self) -> &[TableRef] {
        &self.tables
    }

    pub fn predicates(&self) -> &BTreeMap<String, Vec<String>> {
        &self.predicates
    }

    pub fn projection(&self) -> &[Projection] {
        &self.projection
    }

    pub fn limit(&self) -> Option<&str> {
        self.limit.as_deref()
    }

    pub fn sql(&self) -> String {
        self.ast.to_string()
    }
}

impl std::fmt::Display for ParsedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.ast)
    }
}

/// Parses untrusted SQL. Succeeds for syntactically valid input even when it
/// holds several statements; only the first is kept, and the count is
/// recorded for the validator.
///
/// The text is parsed exactly as given. Literals reach the database
/// byte for byte; only the rendering of the syntax tree changes.
pub fn parse(sql: &str) -> Result<ParsedStatement, ParseError> {
    if sql.trim().is_empty() {
        return Err(ParseError::new("empty statement"));
    }

    let dialect = PostgreSqlDialect {};
    reject_embedded_comments(&dialect, sql)?;

    let mut statements = Parser::parse_sql(&dialect, sql).map_err(|err| {
        let mut err = ParseError::from(err);
        err.write_keyword = leading_write_keyword(&dialect, sql);
        err
    })?;
    if statements.is_empty() {
        return Err(ParseError::new("no statement found"));
    }
    for statement in &statements {
        reject_foreign_placeholders(statement)?;
    }

    let statement_count = statements.len();
    let first = statements.swap_remove(0);
    let (kind, keyword) = classify(&first);
    Ok(ParsedStatement::analyze(kind, keyword, statement_count, first))
}

/// Only whitespace, further comments and statement terminators may follow a
/// comment.
fn reject_embedded_comments(dialect: &PostgreSqlDialect, sql: &str) -> Result<(), ParseError> {
    let tokens = Tokenizer::new(dialect, sql)
        .tokenize_with_location()
        .map_err(|err| {
            let message = err.to_string();
            ParseError {
                position: locate(&message),
                message: strip_location(&message),
                write_keyword: None,
            }
        })?;

    let mut seen_comment = false;
    for token in tokens {
        match token.token {
            Token::Whitespace(Whitespace::SingleLineComment { .. })
            | Token::Whitespace(Whitespace::MultiLineComment(_)) => seen_comment = true,
            Token::Whitespace(_) | Token::SemiColon | Token::EOF => {}
            _ if seen_comment => {
                return Err(ParseError::at(
                    (token.location.line, token.location.column),
                    "comments may only trail the statement",
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

fn leading_write_keyword(dialect: &PostgreSqlDialect, sql: &str) -> Option<String> {
    let tokens = Tokenizer::new(dialect, sql).tokenize().ok()?;
    let first = tokens.into_iter().find(|token| {
        !matches!(
            token,
            Token::Whitespace(_) | Token::LParen | Token::SemiColon
        )
    })?;
    match first {
        Token::Word(word) => {
            let keyword = word.value.to_ascii_uppercase();
            WRITE_KEYWORDS.contains(&keyword.as_str()).then_some(keyword)
        }
        _ => None,
    }
}

fn reject_foreign_placeholders(statement: &Statement) -> Result<(), ParseError> {
    let flow = visit_expressions(statement, |expr| match expr {
        Expr::Value(Value::Placeholder(name)) if name != TENANT_PLACEHOLDER => {
            ControlFlow::Break(name.clone())
        }
        _ => ControlFlow::Continue(()),
    });
    match flow {
        ControlFlow::Break(name) => Err(ParseError::new(format!(
            "placeholder `{}` is not allowed; only {} may be used",
            name, TENANT_PLACEHOLDER
        ))),
        ControlFlow::Continue(()) => Ok(()),
    }
}

fn classify(statement: &Statement) -> (StatementKind, String) {
    if let Statement::Query(_) = statement {
        return (StatementKind::Select, "SELECT".to_string());
    }

    let rendered = statement.to_string();
    let keyword = rendered
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    let kind = match keyword.as_str() {
        "INSERT" | "COPY" => StatementKind::Insert,
        "UPDATE" => StatementKind::Update,
        "DELETE" | "TRUNCATE" => StatementKind::Delete,
        "MERGE" => StatementKind::Merge,
        "CREATE" | "ALTER" | "DROP" | "COMMENT" | "GRANT" | "REVOKE" | "RENAME" => {
            StatementKind::Ddl
        }
        _ => StatementKind::Other,
    };
    (kind, keyword)
}

fn locate(message: &str) -> Option<(u64, u64)> {
    let line = number_after(message, "Line: ")?;
    let column = number_after(message, "Column: ")?;
    Some((line, column))
}

fn number_after(message: &str, label: &str) -> Option<u64> {
    let start = message.find(label)? + label.len();
    let digits: String = message[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

fn strip_location(message: &str) -> String {
    match message.find(" at Line: ") {
        Some(idx) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

/// Top-level AND conjuncts, looking through parentheses.
pub(crate) fn conjuncts(expr: &Expr) -> Vec<&Expr> {
    let mut out = Vec::new();
    collect_conjuncts(expr, &mut out);
    out
}

fn collect_conjuncts<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_conjuncts(left, out);
            collect_conjuncts(right, out);
        }
        Expr::Nested(inner) => collect_conjuncts(inner, out),
        other => out.push(other),
    }
}

fn leftmost_projection(body: &SetExpr) -> Vec<Projection> {
    match body {
        SetExpr::Select(select) => select
            .projection
            .iter()
            .map(|item| match item {
                SelectItem::Wildcard(_) => Projection::Wildcard,
                SelectItem::QualifiedWildcard(name, _) => {
                    Projection::QualifiedWildcard(name.to_string())
                }
                SelectItem::UnnamedExpr(expr) => Projection::Column {
                    expr: expr.to_string(),
                    alias: None,
                },
                SelectItem::ExprWithAlias { expr, alias } => Projection::Column {
                    expr: expr.to_string(),
                    alias: Some(alias.value.clone()),
                },
            })
            .collect(),
        SetExpr::Query(query) => leftmost_projection(&query.body),
        SetExpr::SetOperation { left, .. } => leftmost_projection(left),
        _ => Vec::new(),
    }
}

#[derive(Default)]
struct Analyzer {
    tables: Vec<TableRef>,
    predicates: BTreeMap<String, Vec<String>>,
}

impl Analyzer {
    fn record_predicates(&mut self, condition: &Expr) {
        for conjunct in conjuncts(condition) {
            let key = single_qualifier(conjunct).unwrap_or_else(|| UNQUALIFIED.to_string());
            self.predicates
                .entry(key)
                .or_default()
                .push(conjunct.to_string());
        }
    }

    fn record_body(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                for table in &select.from {
                    for join in &table.joins {
                        if let Some(on) = join_condition(&join.join_operator) {
                            self.record_predicates(on);
                        }
                    }
                }
                if let Some(selection) = &select.selection {
                    self.record_predicates(selection);
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.record_body(left);
                self.record_body(right);
            }
            _ => {}
        }
    }
}

impl Visitor for Analyzer {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        self.record_body(&query.body);
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        if let TableFactor::Table { name, alias, .. } = factor {
            self.tables.push(TableRef {
                name: name.to_string(),
                alias: alias.as_ref().map(|a| a.name.value.clone()),
            });
        }
        ControlFlow::Continue(())
    }
}

pub(crate) fn join_condition(operator: &sqlparser::ast::JoinOperator) -> Option<&Expr> {
    use sqlparser::ast::{JoinConstraint, JoinOperator};

    match operator {
        JoinOperator::Inner(JoinConstraint::On(expr))
        | JoinOperator::LeftOuter(JoinConstraint::On(expr))
        | JoinOperator::RightOuter(JoinConstraint::On(expr))
        | JoinOperator::FullOuter(JoinConstraint::On(expr)) => Some(expr),
        _ => None,
    }
}

/// The qualifier shared by every compound identifier in `expr`, if there is
/// exactly one.
fn single_qualifier(expr: &Expr) -> Option<String> {
    let mut qualifiers = Vec::<String>::new();
    let _ = visit_expressions(expr, |e| {
        if let Expr::CompoundIdentifier(parts) = e
            && parts.len() >= 2
        {
            let qualifier = parts[parts.len() - 2].value.clone();
            if !qualifiers.contains(&qualifier) {
                qualifiers.push(qualifier);
            }
        }
        ControlFlow::<()>::Continue(())
    });
    if qualifiers.len() == 1 {
        qualifiers.pop()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_select_and_collects_tables_across_subqueries_and_joins() {
        let parsed = parse(
            "SELECT u.name, o.total AS t FROM users u JOIN orders o ON o.user_id = u.id \
             WHERE u.id IN (SELECT user_id FROM payments) AND u.active",
        )
        .expect("query should parse");

        assert_eq!(parsed.kind(), StatementKind::Select);
        assert_eq!(parsed.statement_count(), 1);
        let names: Vec<&str> = parsed.tables().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["users", "orders", "payments"]);
        assert_eq!(parsed.tables()[0].exposed_name(), "u");
        assert_eq!(parsed.tables()[2].exposed_name(), "payments");
        assert_eq!(
            parsed.projection()[1],
            Projection::Column {
                expr: "o.total".to_string(),
                alias: Some("t".to_string()),
            }
        );
        assert_eq!(
            parsed.predicates().get("u").map(Vec::len),
            Some(2),
            "u.id IN (...) and u.active are both keyed by u"
        );
        assert!(parsed.predicates().contains_key(UNQUALIFIED));
        assert_eq!(parsed.limit(), None);
    }

    #[test]
    fn wildcard_and_limit_are_preserved() {
        let parsed = parse("select * from users limit 5").expect("query should parse");
        assert_eq!(parsed.projection(), &[Projection::Wildcard]);
        assert_eq!(parsed.limit(), Some("5"));
        assert_eq!(parsed.sql(), "SELECT * FROM users LIMIT 5");
    }

    #[test]
    fn multiple_statements_parse_with_count() {
        let parsed =
            parse("SELECT * FROM users; DROP TABLE users;").expect("both statements parse");
        assert_eq!(parsed.statement_count(), 2);
        assert_eq!(parsed.kind(), StatementKind::Select);
    }

    #[test]
    fn classifies_non_select_statements() {
        let cases = [
            ("DELETE FROM users", StatementKind::Delete),
            ("UPDATE users SET name = 'x'", StatementKind::Update),
            ("INSERT INTO users (id) VALUES (1)", StatementKind::Insert),
            ("DROP TABLE users", StatementKind::Ddl),
            ("SET search_path = public", StatementKind::Other),
        ];
        for (sql, kind) in cases {
            let parsed = parse(sql).expect("statement should parse");
            assert_eq!(parsed.kind(), kind, "{}", sql);
        }
    }

    #[test]
    fn rejects_empty_and_malformed_input() {
        assert_eq!(parse("   \n").unwrap_err().message, "empty statement");
        assert_eq!(parse(";").unwrap_err().message, "no statement found");

        let err = parse("SELECT * FROM users WHERE").unwrap_err();
        assert!(!err.message.is_empty());
    }

    #[test]
    fn malformed_input_reports_position() {
        let err = parse("SELECT *\nFROM users u extra").unwrap_err();
        let (line, _) = err.position.expect("parser reports a position");
        assert_eq!(line, 2);
    }

    #[test]
    fn comments_may_only_trail() {
        parse("SELECT * FROM users -- recent users").expect("trailing comment is fine");
        parse("SELECT 1; /* done */").expect("trailing block comment is fine");

        let err = parse("SELECT * FROM users /* x */ WHERE 1 = 1").unwrap_err();
        assert!(err.message.contains("comments"));
        assert_eq!(err.position.map(|(line, _)| line), Some(1));

        assert!(parse("SELECT * FROM users --\nWHERE tenant_id = 'a'").is_err());
    }

    #[test]
    fn only_tenant_placeholder_is_accepted() {
        parse("SELECT * FROM users WHERE tenant_id = :tenant_id")
            .expect("tenant placeholder is allowed");
        let err = parse("SELECT * FROM users WHERE id = $1").unwrap_err();
        assert!(err.message.contains("$1"));
        assert!(parse("SELECT * FROM users WHERE id = :other").is_err());
    }

    #[test]
    fn crlf_between_tokens_is_plain_whitespace() {
        let parsed = parse("SELECT id\r\nFROM users\r\n").expect("CRLF input parses");
        assert_eq!(parsed.sql(), "SELECT id FROM users");
    }

    #[test]
    fn string_literals_are_passed_through_unchanged() {
        let decomposed = parse("SELECT id FROM users WHERE name = 'e\u{0301}'")
            .expect("decomposed literal parses");
        assert!(decomposed.sql().ends_with("name = 'e\u{0301}'"));
        assert!(!decomposed.sql().contains('\u{00e9}'));

        let crlf = parse("SELECT id FROM users WHERE note = 'a\r\nb'")
            .expect("literal with CRLF parses");
        assert!(crlf.sql().ends_with("note = 'a\r\nb'"));
    }

    #[test]
    fn unparseable_writes_keep_their_keyword() {
        let err = parse("EXEC purge_tenant").unwrap_err();
        assert_eq!(err.write_keyword.as_deref(), Some("EXEC"));
        assert_eq!(err.error_kind(), ErrorKind::NonReadOnly);

        let err = parse("  delete from").unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::NonReadOnly);

        let err = parse("SELEC * FROM users").unwrap_err();
        assert_eq!(err.write_keyword, None);
        assert_eq!(err.error_kind(), ErrorKind::ParseError);
    }
}
