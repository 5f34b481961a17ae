use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
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
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type, METADATA_USER};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::auth::ReservaAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, BookingFilter, Command};

/// Per-connection query handler. The session user is the login name. Once
/// the identity built from it carries a role it is cached for the
/// connection; a reduced identity is resolved again on every request, so a
/// profile registered over another connection takes effect here too.
pub struct ReservaHandler {
    engine: Arc<Engine>,
    identity: Mutex<Option<Identity>>,
    query_parser: Arc<ReservaQueryParser>,
}

impl ReservaHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            identity: Mutex::new(None),
            query_parser: Arc::new(ReservaQueryParser),
        }
    }

    fn session_user<C: ClientInfo>(client: &C) -> PgWireResult<String> {
        client
            .metadata()
            .get(METADATA_USER)
            .filter(|u| !u.is_empty())
            .cloned()
            .ok_or_else(|| user_error("28000", "no user name in startup message".into()))
    }

    async fn identity(&self, user_id: &str) -> Identity {
        let mut cached = self.identity.lock().await;
        if let Some(identity) = cached.as_ref()
            && identity.user_id == user_id
        {
            return identity.clone();
        }
        let identity = self.engine.identify(user_id).await;
        *cached = identity.role.is_some().then(|| identity.clone());
        identity
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let user_id = Self::session_user(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(&user_id, cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result.map_err(engine_err)
    }

    async fn execute_command(&self, user_id: &str, cmd: Command) -> Result<Response, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::InsertProfile {
                user_id: profile_user,
                email,
                name,
                role,
            } => {
                // registering needs no profile, so skip the lookup
                let caller = Identity::reduced(user_id);
                let profile = Profile {
                    user_id: profile_user,
                    email,
                    name,
                    role,
                };
                let profile = engine.register_profile(&caller, profile).await?;
                *self.identity.lock().await = Some(Identity::from_profile(profile));
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertBusiness {
                id,
                name,
                description,
                address,
            } => {
                let identity = self.identity(user_id).await;
                engine
                    .create_business(&identity, id, name, description, address)
                    .await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectBusinesses { owner_id } => {
                let businesses = engine.businesses(owner_id.as_deref()).await?;
                Ok(business_rows(businesses))
            }
            Command::ReplaceSchedule {
                business_id,
                days,
                slot_minutes,
            } => {
                let identity = self.identity(user_id).await;
                let rules = engine
                    .set_weekly_schedule(&identity, business_id, days, slot_minutes)
                    .await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(rules.len())))
            }
            Command::ClearSchedule { business_id } => {
                let identity = self.identity(user_id).await;
                let before = engine.weekly_schedule(business_id).await?.len();
                engine.set_weekly_schedule(&identity, business_id, vec![], 0).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(before)))
            }
            Command::SelectSchedule { business_id } => {
                let rules = engine.weekly_schedule(business_id).await?;
                Ok(schedule_rows(business_id, rules))
            }
            Command::InsertBooking {
                id,
                business_id,
                start,
                duration_minutes,
            } => {
                let identity = self.identity(user_id).await;
                engine
                    .commit_booking(&identity, id, business_id, start, duration_minutes)
                    .await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectBookings { filter } => {
                let identity = self.identity(user_id).await;
                let bookings = match filter {
                    BookingFilter::Business(business_id) => {
                        engine.bookings_for_business(&identity, business_id).await?
                    }
                    BookingFilter::Client(client_id) => {
                        if client_id != identity.user_id {
                            return Err(EngineError::Forbidden("clients can only list their own bookings"));
                        }
                        engine.bookings_for_client(&identity).await?
                    }
                };
                Ok(booking_rows(engine.with_client_names(bookings).await?))
            }
            Command::SelectAvailability { business_id, date } => {
                let slots = engine.compute_available_slots(business_id, date).await?;
                Ok(availability_rows(engine, business_id, slots))
            }
            Command::SelectCalendar { business_id, from, to } => {
                let days = engine.calendar(business_id, from, to).await?;
                Ok(calendar_rows(days))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn business_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("owner_id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("description", Type::VARCHAR),
        text_field("address", Type::VARCHAR),
    ]
}

fn schedule_schema() -> Vec<FieldInfo> {
    vec![
        text_field("business_id", Type::VARCHAR),
        text_field("day_of_week", Type::INT4),
        text_field("start_time", Type::VARCHAR),
        text_field("end_time", Type::VARCHAR),
        text_field("slot_duration_minutes", Type::INT4),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("business_id", Type::VARCHAR),
        text_field("client_id", Type::VARCHAR),
        text_field("client_name", Type::VARCHAR),
        text_field("start_at", Type::INT8),
        text_field("end_at", Type::INT8),
        text_field("status", Type::VARCHAR),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("business_id", Type::VARCHAR),
        text_field("start_at", Type::INT8),
        text_field("end_at", Type::INT8),
        text_field("local_time", Type::VARCHAR),
    ]
}

fn calendar_schema() -> Vec<FieldInfo> {
    vec![
        text_field("date", Type::VARCHAR),
        text_field("selectable", Type::BOOL),
    ]
}

/// Build a query response, one encoder call per row.
fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn business_rows(businesses: Vec<Business>) -> Response {
    rows(business_schema(), businesses, |enc, b| {
        enc.encode_field(&b.id.to_string())?;
        enc.encode_field(&b.owner_id)?;
        enc.encode_field(&b.name)?;
        enc.encode_field(&b.description)?;
        enc.encode_field(&b.address)
    })
}

fn schedule_rows(business_id: ulid::Ulid, rules: Vec<WeeklyRule>) -> Response {
    let bid = business_id.to_string();
    rows(schedule_schema(), rules, |enc, r| {
        enc.encode_field(&bid)?;
        enc.encode_field(&(r.weekday as i32))?;
        enc.encode_field(&r.open.format("%H:%M").to_string())?;
        enc.encode_field(&r.close.format("%H:%M").to_string())?;
        enc.encode_field(&(r.slot_minutes as i32))
    })
}

fn booking_rows(bookings: Vec<(Booking, Option<String>)>) -> Response {
    rows(booking_schema(), bookings, |enc, (b, client_name)| {
        enc.encode_field(&b.id.to_string())?;
        enc.encode_field(&b.business_id.to_string())?;
        enc.encode_field(&b.client_id)?;
        enc.encode_field(&client_name)?;
        enc.encode_field(&b.span.start)?;
        enc.encode_field(&b.span.end)?;
        enc.encode_field(&b.status.as_str().to_string())
    })
}

fn availability_rows(engine: &Engine, business_id: ulid::Ulid, slots: Vec<Span>) -> Response {
    let bid = business_id.to_string();
    let locale = engine.locale();
    rows(availability_schema(), slots, |enc, slot| {
        let local = locale.time_of(slot.start).map(|t| t.format("%H:%M").to_string());
        enc.encode_field(&bid)?;
        enc.encode_field(&slot.start)?;
        enc.encode_field(&slot.end)?;
        enc.encode_field(&local)
    })
}

fn calendar_rows(days: Vec<(chrono::NaiveDate, bool)>) -> Response {
    rows(calendar_schema(), days, |enc, (date, selectable)| {
        enc.encode_field(&date.to_string())?;
        enc.encode_field(&selectable)
    })
}

/// Result columns of a SELECT, decided from its FROM table.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    let Some(table) = upper
        .split_once(" FROM ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
    else {
        return vec![];
    };
    match table.trim_end_matches(';') {
        "BUSINESSES" => business_schema(),
        "SCHEDULES" => schedule_schema(),
        "BOOKINGS" => booking_schema(),
        "AVAILABILITY" => availability_schema(),
        "CALENDAR" => calendar_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ReservaHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ReservaQueryParser;

#[async_trait]
impl QueryParser for ReservaQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ReservaHandler {
    type Statement = String;
    type QueryParser = ReservaQueryParser;

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
        let sql = substitute_params(portal);
        self.run(client, &sql).await
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Byte ranges and indexes of `$N` placeholders outside quoted literals.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                // `''` inside a literal toggles twice and stays inside
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Bound parameter `n` (1-based, text format) as a quoted literal.
fn param_literal<B: AsRef<[u8]>>(parameters: &[Option<B>], n: usize) -> Option<String> {
    let param = parameters.get(n.checked_sub(1)?)?;
    Some(match param {
        Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''")),
        None => "NULL".to_string(),
    })
}

/// Replace every `$N` of `sql` with its bound value in one pass, so text
/// inside a bound value is never scanned for placeholders.
fn substitute<B: AsRef<[u8]>>(sql: &str, parameters: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(literal) = param_literal(parameters, n) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        out.push_str(&literal);
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    substitute(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ReservaFactory {
    handler: Arc<ReservaHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ReservaAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ReservaFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(ReservaHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                ReservaAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ReservaFactory {
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

/// Serve one client connection to completion.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = ReservaFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Invalid(_) | EngineError::SlotExpired { .. } => "22023",
        EngineError::Conflict(_) | EngineError::AlreadyExists(_) => "23505",
        EngineError::Forbidden(_) => "42501",
        EngineError::NotFound(_) => "P0002",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Store(_) => "58000",
        EngineError::ConsistencyGap { .. } => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    match &e {
        EngineError::Store(cause) => warn!("store failure: {cause}"),
        other => debug!("query failed: {other}"),
    }
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
