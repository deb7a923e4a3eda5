use std::collections::BTreeSet;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{NaiveDate, NaiveTime, Weekday};
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::SlotwireAuthSource;
use crate::engine::{Engine, ErrorKind};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct SlotwireHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotwireQueryParser>,
}

impl SlotwireHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotwireQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// The authenticated connection user doubles as the caller identity
    /// for every mutation.
    fn resolve_caller<C: ClientInfo>(client: &C) -> Option<Ulid> {
        client
            .metadata()
            .get("user")
            .and_then(|u| Ulid::from_string(u).ok())
    }

    async fn run_command(
        &self,
        engine: &Engine,
        caller: Option<Ulid>,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(engine, caller, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        caller: Option<Ulid>,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::RegisterUser { id, name, email, role } => {
                engine
                    .register_user(id, name, email, role)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SetWeekly { expert_id, template } => {
                let rows = template.iter_days().map(|(_, r)| r.len()).sum();
                engine
                    .set_weekly(require_caller(caller)?, expert_id, template)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(rows))])
            }
            Command::ClearWeekly { expert_id } => {
                engine
                    .set_weekly(require_caller(caller)?, expert_id, WeeklyTemplate::default())
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SetBlockedDates { expert_id, dates } => {
                let rows = dates.len();
                let dates: BTreeSet<NaiveDate> = dates.into_iter().collect();
                engine
                    .set_blocked_dates(require_caller(caller)?, expert_id, dates)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(rows))])
            }
            Command::ClearBlockedDates { expert_id } => {
                engine
                    .set_blocked_dates(require_caller(caller)?, expert_id, BTreeSet::new())
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SetDateSlots { expert_id, date, slots } => {
                let rows = slots.len();
                engine
                    .set_date_slots(require_caller(caller)?, expert_id, date, slots)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(rows))])
            }
            Command::RemoveDateSlots { expert_id, date } => {
                engine
                    .remove_date_slots(require_caller(caller)?, expert_id, date)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::RequestBooking { expert_id, date, start, end, user_id, message } => {
                engine
                    .request_booking(
                        require_caller(caller)?,
                        expert_id,
                        date,
                        start,
                        end,
                        user_id,
                        message,
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::CancelBooking { expert_id, date, start, end, user_id } => {
                engine
                    .cancel_booking(require_caller(caller)?, expert_id, date, start, end, user_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SetBookingStatus { expert_id, date, start, end, user_id, decision } => {
                engine
                    .set_booking_status(
                        require_caller(caller)?,
                        expert_id,
                        date,
                        start,
                        end,
                        user_id,
                        decision,
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::EditSlotMessage { expert_id, date, start, end, message } => {
                engine
                    .edit_slot_message(
                        require_caller(caller)?,
                        expert_id,
                        date,
                        start,
                        end,
                        message,
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectAvailability { expert_id } => {
                let state = engine.availability_snapshot(expert_id).await.map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let mut rows = Vec::new();
                for day in state.overrides.iter().filter(|o| o.is_active) {
                    for slot in &day.slots {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&fmt_date(day.date))?;
                        encoder.encode_field(&fmt_time(slot.start))?;
                        encoder.encode_field(&fmt_time(slot.end))?;
                        encoder.encode_field(&slot.status_label())?;
                        encoder.encode_field(&slot.message)?;
                        encoder.encode_field(&(slot.claims.len() as i32))?;
                        rows.push(Ok(encoder.take_row()));
                    }
                }
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectSlots { expert_id, date } => {
                let schedule = engine.resolve(expert_id, date).await.map_err(engine_err)?;
                let schema = Arc::new(slots_schema());
                let mut rows = Vec::new();
                match schedule {
                    DaySchedule::Blocked => {}
                    DaySchedule::Overridden(slots) => {
                        for slot in slots {
                            let mut encoder = DataRowEncoder::new(schema.clone());
                            encoder.encode_field(&fmt_date(date))?;
                            encoder.encode_field(&fmt_time(slot.start))?;
                            encoder.encode_field(&fmt_time(slot.end))?;
                            encoder.encode_field(&"override")?;
                            encoder.encode_field(&Some(slot.status_label()))?;
                            encoder.encode_field(&slot.message)?;
                            rows.push(Ok(encoder.take_row()));
                        }
                    }
                    DaySchedule::Recurring(ranges) => {
                        for range in ranges {
                            let mut encoder = DataRowEncoder::new(schema.clone());
                            encoder.encode_field(&fmt_date(date))?;
                            encoder.encode_field(&fmt_time(range.start))?;
                            encoder.encode_field(&fmt_time(range.end))?;
                            encoder.encode_field(&"weekly")?;
                            encoder.encode_field(&None::<&str>)?;
                            encoder.encode_field(&None::<String>)?;
                            rows.push(Ok(encoder.take_row()));
                        }
                    }
                }
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectExperts { date } => {
                let experts = engine.experts_available_on(date).await;
                let schema = Arc::new(experts_schema());
                let rows: Vec<PgWireResult<_>> = experts
                    .into_iter()
                    .map(|id| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&id.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectWeekly { expert_id } => {
                let state = engine.availability_snapshot(expert_id).await.map_err(engine_err)?;
                let schema = Arc::new(weekly_schema());
                let mut rows = Vec::new();
                for (day, ranges) in state.weekly.iter_days() {
                    for range in ranges {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&weekday_name(day))?;
                        encoder.encode_field(&fmt_time(range.start))?;
                        encoder.encode_field(&fmt_time(range.end))?;
                        rows.push(Ok(encoder.take_row()));
                    }
                }
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectBlockedDates { expert_id } => {
                let state = engine.availability_snapshot(expert_id).await.map_err(engine_err)?;
                let schema = Arc::new(blocked_dates_schema());
                let rows: Vec<PgWireResult<_>> = state
                    .blocked
                    .iter()
                    .map(|date| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&fmt_date(*date))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectBookingsForUser { user_id } => {
                let entries = engine.bookings_for_user(user_id).await;
                Ok(vec![bookings_response(entries)?])
            }
            Command::SelectBookingsForExpert { expert_id } => {
                let entries = engine.bookings_for_expert(expert_id).await.map_err(engine_err)?;
                Ok(vec![bookings_response(entries)?])
            }
            Command::Listen { channel } => {
                // Channels are named expert_{ulid}; validate before ack
                parse_expert_channel(&channel)?;
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                if let Some(channel) = channel {
                    parse_expert_channel(&channel)?;
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

fn parse_expert_channel(channel: &str) -> PgWireResult<Ulid> {
    let id = channel.strip_prefix("expert_").ok_or_else(|| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("invalid channel: {channel} (expected expert_{{id}})"),
        )))
    })?;
    Ulid::from_string(id).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("bad ULID in channel: {e}"),
        )))
    })
}

fn require_caller(caller: Option<Ulid>) -> PgWireResult<Ulid> {
    caller.ok_or_else(|| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "28000".into(),
            "connection user must be a ULID user id for this command".into(),
        )))
    })
}

fn fmt_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn fmt_time(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

fn bookings_response(entries: Vec<BookingEntry>) -> PgWireResult<Response> {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<_>> = entries
        .into_iter()
        .map(|entry| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&entry.expert_id.to_string())?;
            encoder.encode_field(&entry.expert_name)?;
            encoder.encode_field(&entry.user_id.to_string())?;
            encoder.encode_field(&entry.user_name)?;
            encoder.encode_field(&fmt_date(entry.date))?;
            encoder.encode_field(&fmt_time(entry.start))?;
            encoder.encode_field(&fmt_time(entry.end))?;
            encoder.encode_field(&entry.status.as_str())?;
            encoder.encode_field(&entry.message)?;
            encoder.encode_field(&entry.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

// ── Result schemas ───────────────────────────────────────────────

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        varchar("date"),
        varchar("start_time"),
        varchar("end_time"),
        varchar("status"),
        varchar("message"),
        FieldInfo::new("claims".into(), None, None, Type::INT4, FieldFormat::Text),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        varchar("date"),
        varchar("start_time"),
        varchar("end_time"),
        varchar("source"),
        varchar("status"),
        varchar("message"),
    ]
}

fn experts_schema() -> Vec<FieldInfo> {
    vec![varchar("expert_id")]
}

fn weekly_schema() -> Vec<FieldInfo> {
    vec![varchar("weekday"), varchar("start_time"), varchar("end_time")]
}

fn blocked_dates_schema() -> Vec<FieldInfo> {
    vec![varchar("date")]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        varchar("expert_id"),
        varchar("expert_name"),
        varchar("user_id"),
        varchar("user_name"),
        varchar("date"),
        varchar("start_time"),
        varchar("end_time"),
        varchar("status"),
        varchar("message"),
        FieldInfo::new("created_at".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn schema_for_statement(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("FROM SLOTS") {
        slots_schema()
    } else if upper.contains("FROM AVAILABILITY") {
        availability_schema()
    } else if upper.contains("FROM EXPERTS") {
        experts_schema()
    } else if upper.contains("FROM WEEKLY") {
        weekly_schema()
    } else if upper.contains("FROM BLOCKED_DATES") {
        blocked_dates_schema()
    } else if upper.contains("FROM BOOKINGS") {
        bookings_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotwireHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let caller = Self::resolve_caller(client);
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run_command(&engine, caller, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotwireQueryParser;

#[async_trait]
impl QueryParser for SlotwireQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for_statement(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotwireHandler {
    type Statement = String;
    type QueryParser = SlotwireQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let caller = Self::resolve_caller(client);
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.run_command(&engine, caller, cmd).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for_statement(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for_statement(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
                && n > max {
                    max = n;
                }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values
/// (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params: &Vec<Option<Bytes>> = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotwireFactory {
    handler: Arc<SlotwireHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotwireAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotwireFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotwireAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotwireHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotwireFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), io::Error> {
    let factory = Arc::new(SlotwireFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    let sqlstate = match e.kind() {
        ErrorKind::NotFound => "P0002",
        ErrorKind::Conflict => "23505",
        ErrorKind::InvalidArgument => "22023",
        ErrorKind::Forbidden => "42501",
        ErrorKind::Unavailable => "58000",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate.into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
