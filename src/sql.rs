use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::engine::{BookingPatch, RoomPatch};
use crate::model::{BookingId, Ms};

/// Per-session context variables, set by the calling auth layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionVar {
    /// The caller's current facility filter.
    Facility,
    /// Acting username.
    Actor,
    /// Acting role: provider | staff | admin.
    Role,
    /// Timezone offset in minutes (JS getTimezoneOffset convention).
    TimezoneOffset,
}

impl SessionVar {
    fn parse(s: &str) -> Option<SessionVar> {
        match s {
            "facility" => Some(SessionVar::Facility),
            "actor" => Some(SessionVar::Actor),
            "role" => Some(SessionVar::Role),
            "timezone_offset" => Some(SessionVar::TimezoneOffset),
            _ => None,
        }
    }
}

/// Parsed command from SQL input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetSession {
        var: SessionVar,
        value: String,
    },
    InsertRoom {
        name: String,
        tags: Vec<String>,
    },
    UpdateRoom {
        facility_name: Option<String>,
        name: String,
        patch: RoomPatch,
    },
    InsertBooking {
        id: Option<BookingId>,
        room_name: String,
        start_at: Ms,
        end_at: Ms,
        username: String,
    },
    UpdateBooking {
        id: BookingId,
        patch: BookingPatch,
    },
    DeleteBooking {
        id: BookingId,
    },
    SelectBookings {
        facility_name: Option<String>,
        day: Ms,
    },
    SelectRooms {
        facility_name: Option<String>,
    },
    SelectUserUsage {
        facility_name: Option<String>,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();

    // Session commands are handled at the string level, like LISTEN —
    // sqlparser's SET AST varies too much across dialects to be worth it.
    if upper.starts_with("LISTEN ") {
        let channel = unquote(trimmed[7..].trim());
        return Ok(Command::Listen { channel });
    }
    if upper == "UNLISTEN *" {
        return Ok(Command::UnlistenAll);
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = unquote(trimmed[9..].trim());
        return Ok(Command::Unlisten { channel });
    }
    if upper.starts_with("SET ") {
        return parse_set(trimmed);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn unquote(s: &str) -> String {
    s.trim_matches('"').trim_matches('\'').to_string()
}

fn parse_set(sql: &str) -> Result<Command, SqlError> {
    // SET <var> = <value>  (also accepts `SET <var> TO <value>`)
    let rest = sql[4..].trim();
    let (key, value) = if let Some((k, v)) = rest.split_once('=') {
        (k, v)
    } else if let Some((k, v)) = rest
        .find(" TO ")
        .or_else(|| rest.find(" to "))
        .map(|i| (&rest[..i], &rest[i + 4..]))
    {
        (k, v)
    } else {
        return Err(SqlError::Parse("SET requires <var> = <value>".into()));
    };

    let key = key.trim().to_lowercase();
    let var = SessionVar::parse(&key).ok_or(SqlError::UnknownSessionVar)?;
    Ok(Command::SetSession {
        var,
        value: unquote(value.trim()),
    })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "rooms" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("rooms", 1, 0));
            }
            let name = parse_string(&values[0])?;
            let tags = if values.len() >= 2 {
                parse_tags(&values[1])?
            } else {
                Vec::new()
            };
            Ok(Command::InsertRoom { name, tags })
        }
        "bookings" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("bookings", 5, values.len()));
            }
            Ok(Command::InsertBooking {
                id: parse_i64_or_null(&values[0])?,
                room_name: parse_string(&values[1])?,
                start_at: parse_i64(&values[2])?,
                end_at: parse_i64(&values[3])?,
                username: parse_string(&values[4])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "bookings" => {
            let id = extract_where_id(&delete.selection)?;
            Ok(Command::DeleteBooking { id })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;

    match table.as_str() {
        "bookings" => {
            let id = extract_where_id(selection)?;
            let mut patch = BookingPatch::default();
            for assignment in assignments {
                let col = assignment_column(assignment)?;
                match col.as_str() {
                    "facility_name" => patch.facility_name = Some(parse_string(&assignment.value)?),
                    "room_name" => patch.room_name = Some(parse_string(&assignment.value)?),
                    "username" => patch.username = Some(parse_string(&assignment.value)?),
                    "start_at" => patch.start_at = Some(parse_i64(&assignment.value)?),
                    "end_at" => patch.end_at = Some(parse_i64(&assignment.value)?),
                    "flag" => patch.flag = Some(parse_string_or_null(&assignment.value)?),
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            Ok(Command::UpdateBooking { id, patch })
        }
        "rooms" => {
            let mut name = None;
            let mut facility_name = None;
            extract_name_filters(selection, &mut name, &mut facility_name)?;
            let name = name.ok_or(SqlError::MissingFilter("name"))?;

            let mut patch = RoomPatch::default();
            for assignment in assignments {
                let col = assignment_column(assignment)?;
                match col.as_str() {
                    "tags" => patch.tags = Some(parse_tags(&assignment.value)?),
                    "flag" => patch.flag = Some(parse_string_or_null(&assignment.value)?),
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            Ok(Command::UpdateRoom { facility_name, name, patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "bookings" => {
            let (mut day, mut facility_name) = (None, None);
            if let Some(selection) = &select.selection {
                extract_booking_filters(selection, &mut day, &mut facility_name)?;
            }
            Ok(Command::SelectBookings {
                facility_name,
                day: day.ok_or(SqlError::MissingFilter("day"))?,
            })
        }
        "rooms" => {
            let mut facility_name = None;
            let mut name = None;
            extract_name_filters(&select.selection, &mut name, &mut facility_name)?;
            Ok(Command::SelectRooms { facility_name })
        }
        "user_usage" => {
            let mut facility_name = None;
            let mut name = None;
            extract_name_filters(&select.selection, &mut name, &mut facility_name)?;
            Ok(Command::SelectUserUsage { facility_name })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_booking_filters(
    expr: &Expr,
    day: &mut Option<Ms>,
    facility_name: &mut Option<String>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_booking_filters(left, day, facility_name)?;
                extract_booking_filters(right, day, facility_name)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left);
                if col.as_deref() == Some("day") || col.as_deref() == Some("date") {
                    *day = Some(parse_i64(right)?);
                } else if col.as_deref() == Some("facility_name") {
                    *facility_name = Some(parse_string(right)?);
                }
            }
            _ => {}
        },
        Expr::Nested(inner) => extract_booking_filters(inner, day, facility_name)?,
        _ => {}
    }
    Ok(())
}

/// Extract `name = '…'` and `facility_name = '…'` equality filters.
fn extract_name_filters(
    selection: &Option<Expr>,
    name: &mut Option<String>,
    facility_name: &mut Option<String>,
) -> Result<(), SqlError> {
    fn walk(
        expr: &Expr,
        name: &mut Option<String>,
        facility_name: &mut Option<String>,
    ) -> Result<(), SqlError> {
        match expr {
            Expr::BinaryOp { left, op, right } => match op {
                ast::BinaryOperator::And => {
                    walk(left, name, facility_name)?;
                    walk(right, name, facility_name)?;
                }
                ast::BinaryOperator::Eq => {
                    let col = expr_column_name(left);
                    if col.as_deref() == Some("name") {
                        *name = Some(parse_string(right)?);
                    } else if col.as_deref() == Some("facility_name") {
                        *facility_name = Some(parse_string(right)?);
                    }
                }
                _ => {}
            },
            Expr::Nested(inner) => walk(inner, name, facility_name)?,
            _ => {}
        }
        Ok(())
    }

    if let Some(expr) = selection {
        walk(expr, name, facility_name)?;
    }
    Ok(())
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn assignment_column(assignment: &ast::Assignment) -> Result<String, SqlError> {
    match &assignment.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<i64, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_i64(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

/// Tags travel as a JSON array string, the way the rooms table stores them.
fn parse_tags(expr: &Expr) -> Result<Vec<String>, SqlError> {
    let text = parse_string(expr)?;
    serde_json::from_str::<Vec<String>>(&text)
        .map_err(|e| SqlError::Parse(format!("bad tags array: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    parse_i64(expr).map(Some)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    UnknownSessionVar,
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::UnknownSessionVar => {
                write!(f, "unknown session variable (facility, actor, role, timezone_offset)")
            }
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
