use chrono::{DateTime, NaiveDate, NaiveTime};
use sqlparser::ast::{self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::DEFAULT_SLOT_MINUTES;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProfile {
        user_id: String,
        email: Option<String>,
        name: Option<String>,
        role: Role,
    },
    InsertBusiness {
        id: Ulid,
        name: String,
        description: Option<String>,
        address: Option<String>,
    },
    SelectBusinesses {
        owner_id: Option<String>,
    },
    /// Full replacement of a business's week.
    ReplaceSchedule {
        business_id: Ulid,
        days: Vec<DayHours>,
        slot_minutes: u32,
    },
    ClearSchedule {
        business_id: Ulid,
    },
    SelectSchedule {
        business_id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        business_id: Ulid,
        start: Ms,
        duration_minutes: u32,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectAvailability {
        business_id: Ulid,
        date: NaiveDate,
    },
    SelectCalendar {
        business_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingFilter {
    Business(Ulid),
    Client(String),
}

const PROFILE_COLUMNS: &[&str] = &["id", "email", "name", "role"];
const BUSINESS_COLUMNS: &[&str] = &["id", "name", "address", "description"];
const SCHEDULE_COLUMNS: &[&str] = &["business_id", "day_of_week", "start_time", "end_time", "slot_duration_minutes"];
const BOOKING_COLUMNS: &[&str] = &["id", "business_id", "start_at", "duration_minutes"];

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
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row addressed by column name.
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
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let known = match table.as_str() {
        "profiles" => PROFILE_COLUMNS,
        "businesses" => BUSINESS_COLUMNS,
        "schedules" => SCHEDULE_COLUMNS,
        "bookings" => BOOKING_COLUMNS,
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let columns = insert_columns(insert, known)?;
    let rows = extract_all_insert_rows(insert)?;
    for row in rows {
        if row.len() != columns.len() {
            return Err(SqlError::WrongArity(columns.len(), row.len()));
        }
    }
    let row_at = |i: usize| Row {
        columns: &columns,
        values: &rows[i],
    };

    if table == "schedules" {
        return parse_schedule_rows(&(0..rows.len()).map(&row_at).collect::<Vec<_>>());
    }
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    let row = row_at(0);

    match table.as_str() {
        "profiles" => Ok(Command::InsertProfile {
            user_id: parse_string(row.required("id")?)?,
            email: parse_optional(row.get("email"), parse_string)?,
            name: parse_optional(row.get("name"), parse_string)?,
            role: match parse_optional(row.get("role"), parse_string)? {
                Some(s) => Role::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown role: {s}")))?,
                None => Role::Client,
            },
        }),
        "businesses" => Ok(Command::InsertBusiness {
            id: parse_ulid(row.required("id")?)?,
            name: parse_string(row.required("name")?)?,
            description: parse_optional(row.get("description"), parse_string)?,
            address: parse_optional(row.get("address"), parse_string)?,
        }),
        _ => Ok(Command::InsertBooking {
            id: parse_ulid(row.required("id")?)?,
            business_id: parse_ulid(row.required("business_id")?)?,
            start: parse_instant(row.required("start_at")?)?,
            duration_minutes: parse_optional(row.get("duration_minutes"), parse_u32)?
                .unwrap_or(DEFAULT_SLOT_MINUTES),
        }),
    }
}

/// All rows must name the same business and slot length.
fn parse_schedule_rows(rows: &[Row<'_>]) -> Result<Command, SqlError> {
    let mut business_id = None;
    let mut slot_minutes = None;
    let mut days = Vec::with_capacity(rows.len());

    for (i, row) in rows.iter().enumerate() {
        let at_row = |e: SqlError| SqlError::Parse(format!("row {i}: {e}"));
        let bid = parse_ulid(row.required("business_id")?).map_err(at_row)?;
        let slot = parse_optional(row.get("slot_duration_minutes"), parse_u32)
            .map_err(at_row)?
            .unwrap_or(DEFAULT_SLOT_MINUTES);
        if *business_id.get_or_insert(bid) != bid {
            return Err(SqlError::Inconsistent("all schedule rows must name the same business_id"));
        }
        if *slot_minutes.get_or_insert(slot) != slot {
            return Err(SqlError::Inconsistent("all schedule rows must share slot_duration_minutes"));
        }
        let weekday = parse_u32(row.required("day_of_week")?).map_err(at_row)?;
        days.push(DayHours {
            weekday: WeekdayIndex::try_from(weekday)
                .map_err(|_| SqlError::Parse(format!("row {i}: day_of_week {weekday} out of range")))?,
            open: parse_time(row.required("start_time")?).map_err(at_row)?,
            close: parse_time(row.required("end_time")?).map_err(at_row)?,
        });
    }

    Ok(Command::ReplaceSchedule {
        business_id: business_id.ok_or(SqlError::Parse("empty VALUES".into()))?,
        days,
        slot_minutes: slot_minutes.unwrap_or(DEFAULT_SLOT_MINUTES),
    })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "schedules" {
        return Err(SqlError::Unsupported(format!("DELETE FROM {table}")));
    }
    let filters = Filters::collect(delete.selection.as_ref())?;
    filters.only(&["business_id"])?;
    Ok(Command::ClearSchedule {
        business_id: parse_ulid(filters.eq("business_id")?)?,
    })
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::collect(select.selection.as_ref())?;

    match table.as_str() {
        "businesses" => {
            filters.only(&["owner_id"])?;
            Ok(Command::SelectBusinesses {
                owner_id: filters.find_eq("owner_id").map(parse_string).transpose()?,
            })
        }
        "schedules" => {
            filters.only(&["business_id"])?;
            Ok(Command::SelectSchedule {
                business_id: parse_ulid(filters.eq("business_id")?)?,
            })
        }
        "bookings" => {
            filters.only(&["business_id", "client_id"])?;
            let filter = match (filters.find_eq("business_id"), filters.find_eq("client_id")) {
                (Some(b), None) => BookingFilter::Business(parse_ulid(b)?),
                (None, Some(c)) => BookingFilter::Client(parse_string(c)?),
                (None, None) => return Err(SqlError::MissingFilter("business_id or client_id")),
                (Some(_), Some(_)) => {
                    return Err(SqlError::Inconsistent("filter bookings by business_id or client_id, not both"));
                }
            };
            Ok(Command::SelectBookings { filter })
        }
        "availability" => {
            filters.only(&["business_id", "date"])?;
            Ok(Command::SelectAvailability {
                business_id: parse_ulid(filters.eq("business_id")?)?,
                date: parse_date(filters.eq("date")?)?,
            })
        }
        "calendar" => {
            filters.only(&["business_id", "date"])?;
            Ok(Command::SelectCalendar {
                business_id: parse_ulid(filters.eq("business_id")?)?,
                from: parse_date(filters.bound("date", BinaryOperator::GtEq)?)?,
                to: parse_date(filters.bound("date", BinaryOperator::LtEq)?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `column op value` terms of a WHERE clause joined by AND.
/// `BETWEEN a AND b` is split into `>= a` and `<= b`.
struct Filters<'a> {
    terms: Vec<(String, BinaryOperator, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut terms = Vec::new();
        if let Some(expr) = selection {
            collect_terms(expr, &mut terms)?;
        }
        Ok(Self { terms })
    }

    /// Reject filters on columns outside `allowed`.
    fn only(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.terms.iter().find(|(col, _, _)| !allowed.contains(&col.as_str())) {
            Some((col, _, _)) => Err(SqlError::UnsupportedFilter(col.clone())),
            None => Ok(()),
        }
    }

    fn find(&self, column: &str, op: BinaryOperator) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(col, o, _)| col == column && *o == op)
            .map(|(_, _, value)| *value)
    }

    fn find_eq(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, BinaryOperator::Eq)
    }

    fn eq(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.find_eq(column).ok_or(SqlError::MissingFilter(column))
    }

    fn bound(&self, column: &'static str, op: BinaryOperator) -> Result<&'a Expr, SqlError> {
        self.find(column, op).ok_or(SqlError::MissingFilter(column))
    }
}

fn collect_terms<'a>(expr: &'a Expr, out: &mut Vec<(String, BinaryOperator, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_terms(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_terms(left, out)?;
            collect_terms(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            match op {
                BinaryOperator::Eq | BinaryOperator::GtEq | BinaryOperator::LtEq => {
                    out.push((column, op.clone(), right.as_ref()));
                    Ok(())
                }
                _ => Err(SqlError::Unsupported(format!("operator {op} on {column}"))),
            }
        }
        Expr::Between {
            expr,
            negated: false,
            low,
            high,
        } => {
            let column = expr_column_name(expr)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {expr}")))?;
            out.push((column.clone(), BinaryOperator::GtEq, low.as_ref()));
            out.push((column, BinaryOperator::LtEq, high.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
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

/// Column list of an INSERT, or the table's declared order when omitted.
fn insert_columns(insert: &ast::Insert, known: &[&str]) -> Result<Vec<String>, SqlError> {
    if insert.columns.is_empty() {
        return Ok(known.iter().map(|c| c.to_string()).collect());
    }
    let mut columns = Vec::with_capacity(insert.columns.len());
    for ident in &insert.columns {
        let column = ident.value.to_lowercase();
        if !known.contains(&column.as_str()) {
            return Err(SqlError::UnknownColumn(column));
        }
        columns.push(column);
    }
    Ok(columns)
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => Err(SqlError::Parse("empty VALUES".into())),
        SetExpr::Values(values) => Ok(&values.rows),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// Absent column or NULL both read as `None`.
fn parse_optional<T>(
    expr: Option<&Expr>,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<Option<T>, SqlError> {
    match expr {
        None => Ok(None),
        Some(e) if is_null(e) => Ok(None),
        Some(e) => parse(e).map(Some),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => {
            s.parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

/// Unix milliseconds, or an RFC 3339 timestamp string.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        return DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")));
    }
    parse_i64(expr)
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    MissingColumn(&'static str),
    WrongArity(usize, usize),
    MissingFilter(&'static str),
    UnsupportedFilter(String),
    Inconsistent(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values per row, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::UnsupportedFilter(col) => write!(f, "cannot filter on {col}"),
            SqlError::Inconsistent(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for SqlError {}
