use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, TableWithJoins, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;
use crate::normalize::RawSlot;
use crate::recurrence::WeeklyPattern;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// One row is a single create; several rows are one batch.
    InsertSlots {
        resource_id: ResourceId,
        actor_id: ActorId,
        role: Role,
        rows: Vec<RawSlot>,
    },
    InsertRecurring {
        resource_id: ResourceId,
        actor_id: ActorId,
        role: Role,
        pattern: WeeklyPattern,
    },
    /// Move a slot. A bound left out keeps its current value.
    UpdateSlot {
        id: Ulid,
        start: Option<String>,
        end: Option<String>,
    },
    DeleteSlot {
        id: Ulid,
    },
    DeleteSlots {
        resource_id: ResourceId,
        actor_id: Option<ActorId>,
    },
    SelectSlot {
        id: Ulid,
    },
    SelectSlots {
        resource_id: ResourceId,
        actor_id: Option<ActorId>,
    },
    SelectActorSlots {
        actor_id: ActorId,
    },
    SelectMatches {
        resource_id: ResourceId,
        actor_a: ActorId,
        actor_b: ActorId,
    },
    SelectResourceMatches {
        resource_id: ResourceId,
    },
}

const SLOT_RANGE_COLUMNS: &[&str] = &["resource_id", "actor_id", "role", "start", "end"];
const RECURRING_COLUMNS: &[&str] = &[
    "resource_id",
    "actor_id",
    "role",
    "weekday",
    "start_time",
    "end_time",
    "week_count",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            from: None,
            returning: None,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row with its column names.
struct Row<'a> {
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    /// Text of an optional column; absent and NULL are both `None`.
    fn text(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map_or(Ok(None), parse_text_or_null)
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    let named: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .collect();

    let defaults = match table.as_str() {
        "slots" => SLOT_RANGE_COLUMNS,
        "recurring_slots" => RECURRING_COLUMNS,
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let columns: Vec<String> = if named.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        named
    };
    for (i, values) in rows.iter().enumerate() {
        if values.len() != columns.len() {
            return Err(SqlError::WrongArity(i, columns.len(), values.len()));
        }
    }
    let rows: Vec<Row<'_>> = rows
        .iter()
        .map(|values| Row {
            columns: &columns,
            values,
        })
        .collect();

    if table == "recurring_slots" {
        if rows.len() != 1 {
            return Err(SqlError::Unsupported(
                "recurring_slots takes one row per statement".into(),
            ));
        }
        return parse_recurring_row(&rows[0]);
    }
    parse_slot_rows(&rows)
}

fn parse_owner(row: &Row<'_>) -> Result<(ResourceId, ActorId, Role), SqlError> {
    let resource_id = parse_i64_expr(row.required("resource_id")?)?;
    let actor_id = parse_i64_expr(row.required("actor_id")?)?;
    let role = parse_role(row.required("role")?)?;
    Ok((resource_id, actor_id, role))
}

fn parse_slot_rows(rows: &[Row<'_>]) -> Result<Command, SqlError> {
    let (resource_id, actor_id, role) = parse_owner(&rows[0])?;
    let cell_form = rows[0].columns.iter().any(|c| c == "date" || c == "time");

    let mut raw = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        if parse_owner(row)? != (resource_id, actor_id, role) {
            return Err(SqlError::Unsupported(format!(
                "row {i}: a multi-row INSERT must target one resource, actor and role"
            )));
        }
        raw.push(if cell_form {
            RawSlot::Cell {
                date: row.text("date")?,
                time: row.text("time")?,
            }
        } else {
            RawSlot::Range {
                start: row.text("start")?,
                end: row.text("end")?,
            }
        });
    }
    Ok(Command::InsertSlots {
        resource_id,
        actor_id,
        role,
        rows: raw,
    })
}

fn parse_recurring_row(row: &Row<'_>) -> Result<Command, SqlError> {
    let (resource_id, actor_id, role) = parse_owner(row)?;
    let weekday = parse_i64_expr(row.required("weekday")?)?;
    let weekday =
        u8::try_from(weekday).map_err(|_| SqlError::Parse(format!("weekday {weekday} out of range")))?;
    let week_count = parse_i64_expr(row.required("week_count")?)?;
    let week_count = u32::try_from(week_count)
        .map_err(|_| SqlError::Parse(format!("week_count {week_count} out of range")))?;
    let start_time = parse_text(row.required("start_time")?)?;
    let end_time = parse_text(row.required("end_time")?)?;
    Ok(Command::InsertRecurring {
        resource_id,
        actor_id,
        role,
        pattern: WeeklyPattern {
            weekday,
            start_time,
            end_time,
            week_count,
        },
    })
}

// ── UPDATE / DELETE / SELECT ──────────────────────────────────

fn parse_update(
    table: &TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    if name != "slots" {
        return Err(SqlError::UnknownTable(name));
    }
    let filters = Filters::from_selection(selection)?;
    filters.only(&["id"])?;
    let id = parse_ulid_expr(filters.get("id").ok_or(SqlError::MissingFilter("id"))?)?;

    let (mut start, mut end) = (None, None);
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported(format!("assignment to {}", assignment.target)))?;
        let value = parse_text(&assignment.value)?;
        match column.as_str() {
            "start" => start = Some(value),
            "end" => end = Some(value),
            other => return Err(SqlError::Unsupported(format!("cannot update {other}"))),
        }
    }
    Ok(Command::UpdateSlot { id, start, end })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "slots" {
        return Err(SqlError::UnknownTable(table));
    }
    let filters = Filters::from_selection(&delete.selection)?;
    if let Some(id) = filters.get("id") {
        filters.only(&["id"])?;
        return Ok(Command::DeleteSlot {
            id: parse_ulid_expr(id)?,
        });
    }
    filters.only(&["resource_id", "actor_id"])?;
    Ok(Command::DeleteSlots {
        resource_id: filters.required_i64("resource_id")?,
        actor_id: filters.optional_i64("actor_id")?,
    })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(&select.selection)?;

    match table.as_str() {
        "slots" => {
            if let Some(id) = filters.get("id") {
                filters.only(&["id"])?;
                return Ok(Command::SelectSlot {
                    id: parse_ulid_expr(id)?,
                });
            }
            filters.only(&["resource_id", "actor_id"])?;
            match filters.optional_i64("resource_id")? {
                Some(resource_id) => Ok(Command::SelectSlots {
                    resource_id,
                    actor_id: filters.optional_i64("actor_id")?,
                }),
                None => Ok(Command::SelectActorSlots {
                    actor_id: filters
                        .optional_i64("actor_id")?
                        .ok_or(SqlError::MissingFilter("resource_id"))?,
                }),
            }
        }
        "matches" => {
            filters.only(&["resource_id", "actor_a", "actor_b"])?;
            let resource_id = filters.required_i64("resource_id")?;
            match (
                filters.optional_i64("actor_a")?,
                filters.optional_i64("actor_b")?,
            ) {
                (Some(actor_a), Some(actor_b)) => Ok(Command::SelectMatches {
                    resource_id,
                    actor_a,
                    actor_b,
                }),
                (None, None) => Ok(Command::SelectResourceMatches { resource_id }),
                (Some(_), None) => Err(SqlError::MissingFilter("actor_b")),
                (None, Some(_)) => Err(SqlError::MissingFilter("actor_a")),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` terms of a WHERE clause joined by AND.
struct Filters<'a>(Vec<(String, &'a Expr)>);

impl<'a> Filters<'a> {
    fn from_selection(selection: &'a Option<Expr>) -> Result<Self, SqlError> {
        let mut out = Vec::new();
        if let Some(expr) = selection {
            collect_eq_filters(expr, &mut out)?;
        }
        Ok(Self(out))
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
    }

    fn only(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.0.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
            Some((c, _)) => Err(SqlError::Unsupported(format!("filter on {c}"))),
            None => Ok(()),
        }
    }

    fn optional_i64(&self, column: &str) -> Result<Option<i64>, SqlError> {
        self.get(column).map(parse_i64_expr).transpose()
    }

    fn required_i64(&self, column: &'static str) -> Result<i64, SqlError> {
        self.optional_i64(column)?
            .ok_or(SqlError::MissingFilter(column))
    }
}

fn collect_eq_filters<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            out.push((col, right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Literal as text. Numbers keep their spelling so instants may be given
/// either as Unix milliseconds or as strings.
fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr: inner,
    } = expr
    {
        return Ok(parse_text_or_null(inner)?.map(|s| format!("-{s}")));
    }
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    parse_text_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_role(expr: &Expr) -> Result<Role, SqlError> {
    parse_text(expr)?.parse().map_err(SqlError::Parse)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    /// Row index, expected value count, actual value count.
    WrongArity(usize, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(row, expected, got) => {
                write!(f, "row {row}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
