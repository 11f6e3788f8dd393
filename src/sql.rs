use sqlparser::ast::{self, Expr, ObjectNamePart, SelectItem, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// The only table the gateway exposes.
pub const RESERVATIONS_TABLE: &str = "reservations";

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// The owner is never part of the statement; it is the login user.
    InsertReservation {
        resource: String,
        start: Ms,
        end: Ms,
        returning: bool,
    },
    SelectReservations {
        resource: Option<String>,
        owner: Option<String>,
    },
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("column {0} is assigned by the server")]
    ServerAssigned(&'static str),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Column {
    Resource,
    Start,
    End,
}

fn insert_column(name: &str) -> Result<Column, SqlError> {
    match name {
        "resource" => Ok(Column::Resource),
        "start" => Ok(Column::Start),
        "end" => Ok(Column::End),
        "owner" => Err(SqlError::ServerAssigned("owner")),
        "id" => Err(SqlError::ServerAssigned("id")),
        "created_at" => Err(SqlError::ServerAssigned("created_at")),
        other => Err(SqlError::UnknownColumn(other.to_string())),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != RESERVATIONS_TABLE {
        return Err(SqlError::UnknownTable(table));
    }

    let columns = if insert.columns.is_empty() {
        vec![Column::Resource, Column::Start, Column::End]
    } else {
        let mut columns = Vec::with_capacity(insert.columns.len());
        for ident in &insert.columns {
            let column = insert_column(&ident.value.to_lowercase())?;
            if columns.contains(&column) {
                return Err(SqlError::Parse(format!("column {} specified more than once", ident.value)));
            }
            columns.push(column);
        }
        columns
    };

    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("one reservation per INSERT".into()));
    }
    let values = &rows[0];
    if values.len() != columns.len() {
        return Err(SqlError::WrongArity(RESERVATIONS_TABLE, columns.len(), values.len()));
    }

    let (mut resource, mut start, mut end) = (None, None, None);
    for (column, expr) in columns.iter().zip(values) {
        match column {
            Column::Resource => resource = Some(parse_string_expr(expr)?),
            Column::Start => start = Some(parse_i64_expr(expr)?),
            Column::End => end = Some(parse_i64_expr(expr)?),
        }
    }

    let returning = match &insert.returning {
        None => false,
        Some(items) if is_wildcard(items) => true,
        Some(_) => return Err(SqlError::Unsupported("RETURNING supports only *".into())),
    };

    Ok(Command::InsertReservation {
        resource: resource.ok_or(SqlError::WrongArity(RESERVATIONS_TABLE, 3, columns.len()))?,
        start: start.ok_or(SqlError::WrongArity(RESERVATIONS_TABLE, 3, columns.len()))?,
        end: end.ok_or(SqlError::WrongArity(RESERVATIONS_TABLE, 3, columns.len()))?,
        returning,
    })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    if select.from.len() > 1 || !select.from[0].joins.is_empty() {
        return Err(SqlError::Unsupported("joins".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    if table != RESERVATIONS_TABLE {
        return Err(SqlError::UnknownTable(table));
    }
    if !is_wildcard(&select.projection) {
        return Err(SqlError::Unsupported("only SELECT * is supported".into()));
    }
    if let Some(clause) = unsupported_clause(query, select) {
        return Err(SqlError::Unsupported(clause.into()));
    }

    let (mut resource, mut owner) = (None, None);
    if let Some(selection) = &select.selection {
        extract_reservation_filters(selection, &mut resource, &mut owner)?;
    }
    Ok(Command::SelectReservations { resource, owner })
}

/// The first clause that would change the result set if honored. Listing
/// always returns every matching row ordered by resource then start.
fn unsupported_clause(query: &ast::Query, select: &ast::Select) -> Option<&'static str> {
    let grouped = !matches!(&select.group_by, ast::GroupByExpr::Expressions(exprs, _) if exprs.is_empty());
    [
        (query.with.is_some(), "WITH"),
        (query.order_by.is_some(), "ORDER BY"),
        (query.limit_clause.is_some(), "LIMIT/OFFSET"),
        (query.fetch.is_some(), "FETCH"),
        (!query.locks.is_empty(), "row locking"),
        (select.distinct.is_some(), "DISTINCT"),
        (select.top.is_some(), "TOP"),
        (grouped, "GROUP BY"),
        (select.having.is_some(), "HAVING"),
        (select.qualify.is_some(), "QUALIFY"),
    ]
    .into_iter()
    .find_map(|(present, clause)| present.then_some(clause))
}

/// Accepts a conjunction of `resource = '..'` and `owner = '..'`. Anything
/// else is refused rather than ignored, so a filter is never silently dropped.
fn extract_reservation_filters(
    expr: &Expr,
    resource: &mut Option<String>,
    owner: &mut Option<String>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_reservation_filters(inner, resource, owner),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            extract_reservation_filters(left, resource, owner)?;
            extract_reservation_filters(right, resource, owner)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let slot = match expr_column_name(left).as_deref() {
                Some("resource") => resource,
                Some("owner") => owner,
                Some(other) => return Err(SqlError::Unsupported(format!("filter on {other}"))),
                None => return Err(SqlError::Unsupported(format!("filter {expr}"))),
            };
            if slot.is_some() {
                return Err(SqlError::Unsupported(format!("repeated filter {expr}")));
            }
            *slot = Some(parse_string_expr(right)?);
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn is_wildcard(items: &[SelectItem]) -> bool {
    matches!(items, [SelectItem::Wildcard(_)])
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Integers, negated integers, and quoted integers (extended-protocol
/// parameters arrive quoted).
fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => {
                s.trim().parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        parse_i64_expr(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("integer out of range".into()))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}
