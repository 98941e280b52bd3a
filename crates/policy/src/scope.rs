use std::ops::ControlFlow;

use sqlgate_contracts::TenantContext;
use sqlparser::ast::{
    BinaryOperator, Expr, Ident, JoinConstraint, JoinOperator, ObjectName, Query, Select, SetExpr,
    Statement, TableFactor, TableWithJoins, Value, VisitMut, VisitorMut, visit_expressions,
};

use crate::parser::{ParsedStatement, TENANT_PLACEHOLDER, conjuncts};
use crate::registry::{SchemaRegistry, TableScope};
use crate::{ReasonCode, Rejection};

/// Set-returning functions that read no table data and may appear in FROM.
const ROW_SOURCE_FUNCTIONS: &[&str] = &[
    "generate_series",
    "generate_subscripts",
    "unnest",
    "json_array_elements",
    "json_array_elements_text",
    "jsonb_array_elements",
    "jsonb_array_elements_text",
    "json_each",
    "json_each_text",
    "jsonb_each",
    "jsonb_each_text",
    "regexp_matches",
    "regexp_split_to_table",
    "string_to_table",
];

/// Ensures every tenant-scoped relation in every query block is filtered to
/// the caller's tenant, injecting `<name>.<tenant column> = :tenant_id` where
/// the statement has no binding predicate. Running it on its own output is a
/// no-op.
pub fn enforce_tenant_scope(
    statement: &ParsedStatement,
    tenant: &TenantContext,
    registry: &SchemaRegistry,
) -> Result<ParsedStatement, Rejection> {
    let Statement::Query(_) = statement.ast() else {
        return Err(violation("only queries can be tenant scoped"));
    };

    reject_foreign_tenant_literals(statement.ast(), tenant, registry.tenant_column())?;

    let mut ast = statement.ast().clone();
    let mut enforcer = ScopeEnforcer {
        tenant,
        registry,
        cte_scopes: Vec::new(),
        injected: 0,
    };
    if let ControlFlow::Break(rejection) = VisitMut::visit(&mut ast, &mut enforcer) {
        tracing::debug!(
            tenant_id = tenant.tenant_id(),
            message = %rejection.message,
            "statement rejected by scope enforcer"
        );
        return Err(rejection);
    }

    tracing::debug!(
        tenant_id = tenant.tenant_id(),
        injected = enforcer.injected,
        "tenant scope enforced"
    );
    if enforcer.injected == 0 {
        Ok(statement.clone())
    } else {
        Ok(statement.with_ast(ast))
    }
}

fn violation(message: impl Into<String>) -> Rejection {
    Rejection::new(ReasonCode::TenantScopeViolation, message)
}

/// Unquoted identifiers fold to lower case, quoted ones keep their spelling.
fn normalize_ident(ident: &Ident) -> String {
    match ident.quote_style {
        Some(_) => ident.value.clone(),
        None => ident.value.to_ascii_lowercase(),
    }
}

fn normalize_name(name: &ObjectName) -> String {
    name.0.iter().map(normalize_ident).collect::<Vec<_>>().join(".")
}

fn is_tenant_column(expr: &Expr, column: &str) -> bool {
    match expr {
        Expr::Identifier(ident) => normalize_ident(ident) == column,
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .is_some_and(|ident| normalize_ident(ident) == column),
        Expr::Nested(inner) => is_tenant_column(inner, column),
        _ => false,
    }
}

/// The literal an expression denotes, seen through parentheses and casts.
fn literal_text(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Nested(inner) => literal_text(inner),
        Expr::Cast { expr, .. } => literal_text(expr),
        Expr::Value(Value::Placeholder(_)) | Expr::Value(Value::Null) => None,
        Expr::Value(Value::SingleQuotedString(s))
        | Expr::Value(Value::EscapedStringLiteral(s))
        | Expr::Value(Value::NationalStringLiteral(s))
        | Expr::Value(Value::DollarQuotedString(sqlparser::ast::DollarQuotedString {
            value: s,
            ..
        })) => Some(s.clone()),
        Expr::Value(Value::Number(n, _)) => Some(n.clone()),
        Expr::Value(Value::Boolean(b)) => Some(b.to_string()),
        _ => None,
    }
}

fn is_comparison(op: &BinaryOperator) -> bool {
    matches!(
        op,
        BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq
    )
}

/// Any comparison of the tenant column against a literal naming a different
/// tenant is a spoofing attempt.
fn reject_foreign_tenant_literals(
    statement: &Statement,
    tenant: &TenantContext,
    column: &str,
) -> Result<(), Rejection> {
    let foreign = |expr: &Expr| literal_text(expr).is_some_and(|v| v != tenant.tenant_id());

    let flow = visit_expressions(statement, |expr| {
        let spoofed = match expr {
            Expr::BinaryOp { left, op, right } if is_comparison(op) => {
                (is_tenant_column(left, column) && foreign(right))
                    || (is_tenant_column(right, column) && foreign(left))
            }
            Expr::InList { expr, list, .. } => {
                is_tenant_column(expr, column) && list.iter().any(|item| foreign(item))
            }
            Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
                is_tenant_column(expr, column) && foreign(pattern)
            }
            Expr::Between {
                expr, low, high, ..
            } => is_tenant_column(expr, column) && (foreign(low) || foreign(high)),
            _ => false,
        };
        if spoofed {
            ControlFlow::Break(expr.to_string())
        } else {
            ControlFlow::Continue(())
        }
    });

    match flow {
        ControlFlow::Break(predicate) => Err(violation(format!(
            "predicate `{}` names a tenant other than the caller's",
            predicate
        ))),
        ControlFlow::Continue(()) => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Binding {
    Qualified(String),
    Unqualified,
}

/// One query block: its FROM list plus the tenant bindings already present
/// in its WHERE clause.
struct Block {
    where_bindings: Vec<Binding>,
    tenant_tables: usize,
    where_targets: Vec<Ident>,
}

impl Block {
    fn binds(bindings: &[Binding], exposed: &Ident, tenant_tables: usize) -> bool {
        let exposed = normalize_ident(exposed);
        bindings.iter().any(|binding| match binding {
            Binding::Qualified(qualifier) => *qualifier == exposed,
            Binding::Unqualified => tenant_tables == 1,
        })
    }

    fn where_binds(&self, exposed: &Ident) -> bool {
        Self::binds(&self.where_bindings, exposed, self.tenant_tables)
    }
}

enum FactorScope {
    /// Tenant-scoped base table, with the identifier other clauses use for it.
    Tenant(Ident),
    Nested,
    Unscoped,
}

struct ScopeEnforcer<'a> {
    tenant: &'a TenantContext,
    registry: &'a SchemaRegistry,
    cte_scopes: Vec<Vec<String>>,
    injected: usize,
}

impl ScopeEnforcer<'_> {
    fn column(&self) -> &str {
        self.registry.tenant_column()
    }

    fn is_cte(&self, name: &ObjectName) -> bool {
        let [ident] = name.0.as_slice() else {
            return false;
        };
        let name = normalize_ident(ident);
        self.cte_scopes
            .iter()
            .any(|scope| scope.iter().any(|cte| *cte == name))
    }

    fn bindings(&self, condition: Option<&Expr>) -> Vec<Binding> {
        let Some(condition) = condition else {
            return Vec::new();
        };
        let column = self.column();
        let mut out = Vec::new();
        for conjunct in conjuncts(condition) {
            let Expr::BinaryOp {
                left,
                op: BinaryOperator::Eq,
                right,
            } = conjunct
            else {
                continue;
            };
            for (column_side, value_side) in [(left, right), (right, left)] {
                if !self.is_tenant_value(value_side) {
                    continue;
                }
                match column_side.as_ref() {
                    Expr::Identifier(ident) if normalize_ident(ident) == column => {
                        out.push(Binding::Unqualified);
                    }
                    Expr::CompoundIdentifier(parts)
                        if parts.len() >= 2
                            && normalize_ident(&parts[parts.len() - 1]) == column =>
                    {
                        out.push(Binding::Qualified(normalize_ident(&parts[parts.len() - 2])));
                    }
                    _ => {}
                }
            }
        }
        out
    }

    fn is_tenant_value(&self, expr: &Expr) -> bool {
        match expr {
            Expr::Nested(inner) => self.is_tenant_value(inner),
            Expr::Value(Value::Placeholder(name)) => name == TENANT_PLACEHOLDER,
            Expr::Value(Value::SingleQuotedString(s)) => s == self.tenant.tenant_id(),
            _ => false,
        }
    }

    fn classify(&self, factor: &TableFactor) -> Result<FactorScope, Rejection> {
        match factor {
            TableFactor::Table {
                name, alias, args, ..
            } => {
                if args.is_some() {
                    let function = name
                        .0
                        .last()
                        .map(normalize_ident)
                        .unwrap_or_default();
                    if name.0.len() == 1 && ROW_SOURCE_FUNCTIONS.contains(&function.as_str()) {
                        return Ok(FactorScope::Unscoped);
                    }
                    return Err(violation(format!(
                        "table function {} cannot be tenant scoped",
                        name
                    )));
                }
                if self.is_cte(name) {
                    return Ok(FactorScope::Unscoped);
                }
                if name
                    .0
                    .iter()
                    .any(|ident| normalize_ident(ident) != ident.value.to_ascii_lowercase())
                {
                    return Err(violation(format!("table {} is not registered", name)));
                }

                let key = normalize_name(name);
                let bare = name.0.last().map(normalize_ident).unwrap_or_default();
                let Some(scope) = self.registry.lookup(&key) else {
                    return Err(violation(format!("table {} is not registered", name)));
                };
                if !(self.tenant.allows_table(&key) || self.tenant.allows_table(&bare)) {
                    return Err(violation(format!(
                        "table {} is not allowed for this request",
                        name
                    )));
                }

                match scope {
                    TableScope::Shared => Ok(FactorScope::Unscoped),
                    TableScope::TenantScoped => {
                        let exposed = match alias {
                            Some(alias) => alias.name.clone(),
                            None => name.0.last().cloned().unwrap_or_else(|| Ident::new(bare)),
                        };
                        Ok(FactorScope::Tenant(exposed))
                    }
                }
            }
            TableFactor::Derived { .. } | TableFactor::UNNEST { .. } => Ok(FactorScope::Unscoped),
            TableFactor::NestedJoin { .. } => Ok(FactorScope::Nested),
            other => Err(violation(format!(
                "relation {} cannot be tenant scoped",
                other
            ))),
        }
    }

    fn count_tenant_tables(&self, from: &[TableWithJoins]) -> usize {
        from.iter()
            .map(|table| {
                self.count_in_factor(&table.relation)
                    + table
                        .joins
                        .iter()
                        .map(|join| self.count_in_factor(&join.relation))
                        .sum::<usize>()
            })
            .sum()
    }

    fn count_in_factor(&self, factor: &TableFactor) -> usize {
        match self.classify(factor) {
            Ok(FactorScope::Tenant(_)) => 1,
            Ok(FactorScope::Nested) => match factor {
                TableFactor::NestedJoin {
                    table_with_joins, ..
                } => self.count_tenant_tables(std::slice::from_ref(table_with_joins.as_ref())),
                _ => 0,
            },
            _ => 0,
        }
    }

    fn scope_body(&mut self, body: &mut SetExpr) -> Result<(), Rejection> {
        match body {
            SetExpr::Select(select) => self.scope_select(select),
            SetExpr::SetOperation { left, right, .. } => {
                self.scope_body(left)?;
                self.scope_body(right)
            }
            SetExpr::Query(_) | SetExpr::Values(_) => Ok(()),
            SetExpr::Table(_) => Err(violation("TABLE shorthand cannot be tenant scoped")),
            other => Err(violation(format!("query body {} cannot be tenant scoped", other))),
        }
    }

    fn scope_select(&mut self, select: &mut Select) -> Result<(), Rejection> {
        let mut block = Block {
            where_bindings: self.bindings(select.selection.as_ref()),
            tenant_tables: self.count_tenant_tables(&select.from),
            where_targets: Vec::new(),
        };

        for table in &mut select.from {
            self.scope_table_with_joins(table, &mut block)?;
        }

        let mut seen = Vec::<String>::new();
        let mut predicates = Vec::new();
        for exposed in &block.where_targets {
            let key = normalize_ident(exposed);
            if block.where_binds(exposed) || seen.contains(&key) {
                continue;
            }
            seen.push(key);
            predicates.push(self.tenant_predicate(exposed));
        }

        if !predicates.is_empty() {
            self.injected += predicates.len();
            let existing = select.selection.take().map(parenthesize_or);
            select.selection = predicates
                .into_iter()
                .fold(existing, |acc, predicate| {
                    Some(match acc {
                        Some(acc) => and(acc, predicate),
                        None => predicate,
                    })
                });
        }
        Ok(())
    }

    fn scope_table_with_joins(
        &mut self,
        table: &mut TableWithJoins,
        block: &mut Block,
    ) -> Result<(), Rejection> {
        let mut left_has_tenant = self.scope_preserved(&mut table.relation, block)?;

        for join in &mut table.joins {
            match &mut join.join_operator {
                JoinOperator::Inner(_) | JoinOperator::CrossJoin => {
                    left_has_tenant |= self.scope_preserved(&mut join.relation, block)?;
                }
                JoinOperator::LeftOuter(constraint) => {
                    match self.classify(&join.relation)? {
                        FactorScope::Tenant(exposed) => {
                            let JoinConstraint::On(on) = constraint else {
                                return Err(violation(format!(
                                    "LEFT JOIN on {} needs an ON clause to be tenant scoped",
                                    exposed
                                )));
                            };
                            let on_bindings = self.bindings(Some(&*on));
                            if !Block::binds(&on_bindings, &exposed, 0) && !block.where_binds(&exposed)
                            {
                                let scoped = and(parenthesize_or(on.clone()), self.tenant_predicate(&exposed));
                                *on = scoped;
                                self.injected += 1;
                            }
                            left_has_tenant = true;
                        }
                        FactorScope::Nested => {
                            if self.count_in_factor(&join.relation) > 0 {
                                return Err(violation(
                                    "nested join on the nullable side of a LEFT JOIN cannot be tenant scoped",
                                ));
                            }
                        }
                        FactorScope::Unscoped => {}
                    }
                }
                JoinOperator::RightOuter(_) => {
                    if left_has_tenant {
                        return Err(violation(
                            "tenant-scoped table on the nullable side of a RIGHT JOIN",
                        ));
                    }
                    left_has_tenant |= self.scope_preserved(&mut join.relation, block)?;
                }
                JoinOperator::FullOuter(_) => {
                    if left_has_tenant || self.count_in_factor(&join.relation) > 0 {
                        return Err(violation(
                            "tenant-scoped table on the nullable side of a FULL JOIN",
                        ));
                    }
                    self.classify(&join.relation)?;
                }
                _ => {
                    return Err(violation(format!(
                        "join {} cannot be tenant scoped",
                        join.relation
                    )));
                }
            }
        }
        Ok(())
    }

    /// Handles a relation whose rows are never null-extended. Returns whether
    /// it holds tenant-scoped tables.
    fn scope_preserved(
        &mut self,
        factor: &mut TableFactor,
        block: &mut Block,
    ) -> Result<bool, Rejection> {
        match self.classify(factor)? {
            FactorScope::Tenant(exposed) => {
                block.where_targets.push(exposed);
                Ok(true)
            }
            FactorScope::Unscoped => Ok(false),
            FactorScope::Nested => {
                let tenant_tables = self.count_in_factor(factor);
                let TableFactor::NestedJoin {
                    table_with_joins,
                    alias,
                } = factor
                else {
                    return Ok(false);
                };
                if tenant_tables > 0 && alias.is_some() {
                    return Err(violation(
                        "aliased nested join hides tenant-scoped tables",
                    ));
                }
                self.scope_table_with_joins(table_with_joins, block)?;
                Ok(tenant_tables > 0)
            }
        }
    }

    fn tenant_predicate(&self, exposed: &Ident) -> Expr {
        Expr::BinaryOp {
            left: Box::new(Expr::CompoundIdentifier(vec![
                exposed.clone(),
                Ident::new(self.column()),
            ])),
            op: BinaryOperator::Eq,
            right: Box::new(Expr::Value(Value::Placeholder(
                TENANT_PLACEHOLDER.to_string(),
            ))),
        }
    }
}

fn and(left: Expr, right: Expr) -> Expr {
    Expr::BinaryOp {
        left: Box::new(left),
        op: BinaryOperator::And,
        right: Box::new(right),
    }
}

/// `a OR b` must keep its grouping once another conjunct is appended.
fn parenthesize_or(expr: Expr) -> Expr {
    match expr {
        Expr::BinaryOp {
            op: BinaryOperator::Or,
            ..
        } => Expr::Nested(Box::new(expr)),
        other => other,
    }
}

impl VisitorMut for ScopeEnforcer<'_> {
    type Break = Rejection;

    fn pre_visit_query(&mut self, query: &mut Query) -> ControlFlow<Self::Break> {
        let mut names = Vec::new();
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                let name = normalize_ident(&cte.alias.name);
                if self.registry.lookup(&name).is_some() {
                    return ControlFlow::Break(violation(format!(
                        "common table expression {} shadows a registered table",
                        cte.alias.name
                    )));
                }
                names.push(name);
            }
        }
        self.cte_scopes.push(names);

        match self.scope_body(&mut query.body) {
            Ok(()) => ControlFlow::Continue(()),
            Err(rejection) => ControlFlow::Break(rejection),
        }
    }

    fn post_visit_query(&mut self, _query: &mut Query) -> ControlFlow<Self::Break> {
        self.cte_scopes.pop();
        ControlFlow::Continue(())
    }
}
