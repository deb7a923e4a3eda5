use chrono::{NaiveDate, NaiveTime, Weekday};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    RegisterUser {
        id: Ulid,
        name: String,
        email: String,
        role: UserRole,
    },
    SetWeekly {
        expert_id: Ulid,
        template: WeeklyTemplate,
    },
    ClearWeekly {
        expert_id: Ulid,
    },
    SetBlockedDates {
        expert_id: Ulid,
        dates: Vec<NaiveDate>,
    },
    ClearBlockedDates {
        expert_id: Ulid,
    },
    SetDateSlots {
        expert_id: Ulid,
        date: NaiveDate,
        slots: Vec<SlotSpec>,
    },
    RemoveDateSlots {
        expert_id: Ulid,
        date: NaiveDate,
    },
    RequestBooking {
        expert_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        user_id: Ulid,
        message: Option<String>,
    },
    CancelBooking {
        expert_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        user_id: Ulid,
    },
    SetBookingStatus {
        expert_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        user_id: Ulid,
        decision: Decision,
    },
    EditSlotMessage {
        expert_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        message: Option<String>,
    },
    SelectAvailability {
        expert_id: Ulid,
    },
    SelectSlots {
        expert_id: Ulid,
        date: NaiveDate,
    },
    SelectExperts {
        date: NaiveDate,
    },
    SelectWeekly {
        expert_id: Ulid,
    },
    SelectBlockedDates {
        expert_id: Ulid,
    },
    SelectBookingsForUser {
        user_id: Ulid,
    },
    SelectBookingsForExpert {
        expert_id: Ulid,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: Option<String>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("UNLISTEN") {
        let rest = trimmed[8..].trim().trim_matches(';').trim();
        let channel = match rest {
            "" | "*" => None,
            other => Some(other.to_string()),
        };
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update { table, assignments, selection, .. } => {
            parse_update(table, assignments, selection)
        }
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;

    match table.as_str() {
        "users" => {
            if rows.len() != 1 {
                return Err(SqlError::Unsupported("one user per INSERT".into()));
            }
            let row = &rows[0];
            if row.len() < 4 {
                return Err(SqlError::WrongArity("users", 4, row.len()));
            }
            Ok(Command::RegisterUser {
                id: parse_ulid_expr(&row[0])?,
                name: expr_str(&row[1])?,
                email: expr_str(&row[2])?,
                role: parse_role_expr(&row[3])?,
            })
        }
        "weekly" => {
            // One INSERT carries the whole template: every row is
            // (expert_id, weekday, start_time, end_time) and the write
            // replaces the expert's template wholesale.
            let mut expert_id = None;
            let mut template = WeeklyTemplate::default();
            let mut per_day: [Vec<TimeRange>; 7] = Default::default();
            for (i, row) in rows.iter().enumerate() {
                if row.len() < 4 {
                    return Err(SqlError::WrongArity("weekly row", 4, row.len()));
                }
                let row_expert = parse_ulid_expr(&row[0])
                    .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
                match expert_id {
                    None => expert_id = Some(row_expert),
                    Some(prev) if prev != row_expert => {
                        return Err(SqlError::Parse(
                            "all weekly rows must target one expert".into(),
                        ));
                    }
                    Some(_) => {}
                }
                let day = parse_weekday_expr(&row[1])?;
                let start = parse_time_expr(&row[2])?;
                let end = parse_time_expr(&row[3])?;
                per_day[weekday_index(day)].push(TimeRange { start, end });
            }
            let expert_id = expert_id.ok_or(SqlError::Empty)?;
            for (day, ranges) in WEEKDAYS.iter().zip(per_day) {
                template.set_day(*day, ranges);
            }
            Ok(Command::SetWeekly { expert_id, template })
        }
        "blocked_dates" => {
            let mut expert_id = None;
            let mut dates = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                if row.len() < 2 {
                    return Err(SqlError::WrongArity("blocked_dates row", 2, row.len()));
                }
                let row_expert = parse_ulid_expr(&row[0])
                    .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
                match expert_id {
                    None => expert_id = Some(row_expert),
                    Some(prev) if prev != row_expert => {
                        return Err(SqlError::Parse(
                            "all blocked_dates rows must target one expert".into(),
                        ));
                    }
                    Some(_) => {}
                }
                dates.push(parse_date_expr(&row[1])?);
            }
            let expert_id = expert_id.ok_or(SqlError::Empty)?;
            Ok(Command::SetBlockedDates { expert_id, dates })
        }
        "overrides" => {
            // One INSERT carries the whole date: every row is
            // (expert_id, date, start_time, end_time[, message]) and the
            // write replaces any existing override for that date.
            let mut key: Option<(Ulid, NaiveDate)> = None;
            let mut slots = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                if row.len() < 4 {
                    return Err(SqlError::WrongArity("overrides row", 4, row.len()));
                }
                let row_expert = parse_ulid_expr(&row[0])
                    .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
                let row_date = parse_date_expr(&row[1])?;
                match key {
                    None => key = Some((row_expert, row_date)),
                    Some(prev) if prev != (row_expert, row_date) => {
                        return Err(SqlError::Parse(
                            "all overrides rows must target one expert and date".into(),
                        ));
                    }
                    Some(_) => {}
                }
                let message = if row.len() >= 5 { expr_opt_str(&row[4])? } else { None };
                slots.push(SlotSpec {
                    start: parse_time_expr(&row[2])?,
                    end: parse_time_expr(&row[3])?,
                    message,
                });
            }
            let (expert_id, date) = key.ok_or(SqlError::Empty)?;
            Ok(Command::SetDateSlots { expert_id, date, slots })
        }
        "bookings" => {
            if rows.len() != 1 {
                return Err(SqlError::Unsupported("one booking per INSERT".into()));
            }
            let row = &rows[0];
            if row.len() < 5 {
                return Err(SqlError::WrongArity("bookings", 5, row.len()));
            }
            let message = if row.len() >= 6 { expr_opt_str(&row[5])? } else { None };
            Ok(Command::RequestBooking {
                expert_id: parse_ulid_expr(&row[0])?,
                date: parse_date_expr(&row[1])?,
                start: parse_time_expr(&row[2])?,
                end: parse_time_expr(&row[3])?,
                user_id: parse_ulid_expr(&row[4])?,
                message,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = collect_filters(&delete.selection)?;

    match table.as_str() {
        "weekly" => Ok(Command::ClearWeekly { expert_id: required_ulid(&filters, "expert_id")? }),
        "blocked_dates" => Ok(Command::ClearBlockedDates {
            expert_id: required_ulid(&filters, "expert_id")?,
        }),
        "overrides" => Ok(Command::RemoveDateSlots {
            expert_id: required_ulid(&filters, "expert_id")?,
            date: required_date(&filters, "date")?,
        }),
        "bookings" => Ok(Command::CancelBooking {
            expert_id: required_ulid(&filters, "expert_id")?,
            date: required_date(&filters, "date")?,
            start: required_time(&filters, "start_time")?,
            end: required_time(&filters, "end_time")?,
            user_id: required_ulid(&filters, "user_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let filters = collect_filters(selection)?;

    match table.as_str() {
        "bookings" => {
            let status = assignment_value(assignments, "status")?
                .ok_or(SqlError::Parse("status cannot be NULL".into()))?;
            let decision = match status.to_lowercase().as_str() {
                "accepted" => Decision::Accept,
                "rejected" => Decision::Reject,
                other => {
                    return Err(SqlError::Parse(format!(
                        "status must be 'accepted' or 'rejected', got '{other}'"
                    )));
                }
            };
            Ok(Command::SetBookingStatus {
                expert_id: required_ulid(&filters, "expert_id")?,
                date: required_date(&filters, "date")?,
                start: required_time(&filters, "start_time")?,
                end: required_time(&filters, "end_time")?,
                user_id: required_ulid(&filters, "user_id")?,
                decision,
            })
        }
        "slots" => {
            let message = assignment_value(assignments, "message")?;
            Ok(Command::EditSlotMessage {
                expert_id: required_ulid(&filters, "expert_id")?,
                date: required_date(&filters, "date")?,
                start: required_time(&filters, "start_time")?,
                end: required_time(&filters, "end_time")?,
                message,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Value of `SET <col> = <value>`. `Ok(None)` means an explicit NULL.
fn assignment_value(
    assignments: &[ast::Assignment],
    col: &str,
) -> Result<Option<String>, SqlError> {
    for assignment in assignments {
        let name = match &assignment.target {
            ast::AssignmentTarget::ColumnName(name) => object_name_last(name),
            ast::AssignmentTarget::Tuple(_) => None,
        };
        if name.as_deref() == Some(col) {
            return expr_opt_str(&assignment.value);
        }
    }
    Err(SqlError::MissingFilter("SET value"))
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = collect_filters(&select.selection)?;

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            expert_id: required_ulid(&filters, "expert_id")?,
        }),
        "slots" => Ok(Command::SelectSlots {
            expert_id: required_ulid(&filters, "expert_id")?,
            date: required_date(&filters, "date")?,
        }),
        "experts" => Ok(Command::SelectExperts { date: required_date(&filters, "date")? }),
        "weekly" => Ok(Command::SelectWeekly { expert_id: required_ulid(&filters, "expert_id")? }),
        "blocked_dates" => Ok(Command::SelectBlockedDates {
            expert_id: required_ulid(&filters, "expert_id")?,
        }),
        "bookings" => {
            if let Some(user) = find_filter(&filters, "user_id") {
                Ok(Command::SelectBookingsForUser { user_id: parse_ulid_str(user)? })
            } else if let Some(expert) = find_filter(&filters, "expert_id") {
                Ok(Command::SelectBookingsForExpert { expert_id: parse_ulid_str(expert)? })
            } else {
                Err(SqlError::MissingFilter("user_id or expert_id"))
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE helpers ─────────────────────────────────────────────

/// Flatten a WHERE tree of AND-joined equality comparisons into
/// (column, value) pairs. Anything else is ignored, and a missing
/// required column surfaces later as `MissingFilter`.
fn collect_filters(selection: &Option<Expr>) -> Result<Vec<(String, String)>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_filters_expr(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_filters_expr(expr: &Expr, out: &mut Vec<(String, String)>) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                collect_filters_expr(left, out)?;
                collect_filters_expr(right, out)?;
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left)
                    && let Ok(value) = expr_str(right) {
                        out.push((col, value));
                    }
            }
            _ => {}
        }
    }
    Ok(())
}

fn find_filter<'a>(filters: &'a [(String, String)], col: &str) -> Option<&'a str> {
    filters.iter().find(|(c, _)| c == col).map(|(_, v)| v.as_str())
}

fn required<'a>(filters: &'a [(String, String)], col: &'static str) -> Result<&'a str, SqlError> {
    find_filter(filters, col).ok_or(SqlError::MissingFilter(col))
}

fn required_ulid(filters: &[(String, String)], col: &'static str) -> Result<Ulid, SqlError> {
    parse_ulid_str(required(filters, col)?)
}

fn required_date(filters: &[(String, String)], col: &'static str) -> Result<NaiveDate, SqlError> {
    parse_date_str(required(filters, col)?)
}

fn required_time(filters: &[(String, String)], col: &'static str) -> Result<NaiveTime, SqlError> {
    parse_time_str(required(filters, col)?)
}

// ── AST helpers ───────────────────────────────────────────────

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

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
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

fn expr_str(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn expr_opt_str(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => expr_str(expr).map(Some),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_str(&expr_str(expr)?)
}

fn parse_ulid_str(s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    parse_date_str(&expr_str(expr)?)
}

fn parse_date_str(s: &str) -> Result<NaiveDate, SqlError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| SqlError::Parse(format!("bad date '{s}' (want YYYY-MM-DD)")))
}

fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    parse_time_str(&expr_str(expr)?)
}

fn parse_time_str(s: &str) -> Result<NaiveTime, SqlError> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| SqlError::Parse(format!("bad time '{s}' (want HH:MM)")))
}

fn parse_weekday_expr(expr: &Expr) -> Result<Weekday, SqlError> {
    let s = expr_str(expr)?;
    s.parse::<Weekday>()
        .map_err(|_| SqlError::Parse(format!("bad weekday '{s}'")))
}

fn parse_role_expr(expr: &Expr) -> Result<UserRole, SqlError> {
    let s = expr_str(expr)?;
    match s.to_lowercase().as_str() {
        "expert" | "domain_expert" => Ok(UserRole::Expert),
        "member" | "user" => Ok(UserRole::Member),
        other => Err(SqlError::Parse(format!("bad role '{other}'"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
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
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
