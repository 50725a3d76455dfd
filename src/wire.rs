use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use futures::{Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::Mutex;

use crate::auth::RoomdAuthSource;
use crate::engine::{CreateOutcome, Engine, UpdateOutcome};
use crate::model::*;
use crate::sql::{self, Command, SessionVar};
use crate::tenant::TenantManager;

/// Per-connection context supplied by the calling auth layer through
/// `SET` commands. The role defaults to provider — the most restricted —
/// so a caller that forgets to forward the role cannot bypass the
/// past-day cutoff.
struct Session {
    facility: Option<String>,
    username: Option<String>,
    role: Role,
    offset_minutes: i32,
    subscriptions: Vec<(String, broadcast::Receiver<Event>)>,
}

impl Session {
    fn new() -> Self {
        Self {
            facility: None,
            username: None,
            role: Role::Provider,
            offset_minutes: 0,
            subscriptions: Vec::new(),
        }
    }

    fn actor(&self) -> PgWireResult<Actor> {
        let username = self.username.clone().ok_or_else(|| {
            user_error("28000", "no acting user: SET actor = '<username>' first")
        })?;
        Ok(Actor {
            username,
            role: self.role,
        })
    }

    fn facility(&self, explicit: Option<String>) -> PgWireResult<String> {
        explicit.or_else(|| self.facility.clone()).ok_or_else(|| {
            user_error("P0001", "no facility selected: SET facility = '<name>' first")
        })
    }
}

pub struct RoomdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<RoomdQueryParser>,
    session: Mutex<Session>,
}

impl RoomdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(RoomdQueryParser),
            session: Mutex::new(Session::new()),
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

    /// Seed the acting username from the startup message once, so a
    /// session works without an explicit `SET actor` when the connection
    /// user IS the acting user.
    async fn seed_session<C: ClientInfo>(&self, client: &C) {
        let mut session = self.session.lock().await;
        if session.username.is_none() {
            session.username = client.metadata().get("user").cloned();
        }
    }

    /// Deliver pending facility-change notifications to this session.
    /// Events are flushed at the session's next interaction, before the
    /// query's own results.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let mut session = self.session.lock().await;
        for (channel, rx) in session.subscriptions.iter_mut() {
            loop {
                match rx.try_recv() {
                    Ok(event) => {
                        let payload =
                            serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                        client
                            .send(PgWireBackendMessage::NotificationResponse(
                                NotificationResponse::new(0, channel.clone(), payload),
                            ))
                            .await?;
                    }
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
        }
        Ok(())
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let label = crate::observability::command_label(&cmd);
        let started = std::time::Instant::now();
        let result = self.dispatch_command(engine, cmd).await;
        metrics::histogram!(crate::observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        metrics::counter!(
            crate::observability::QUERIES_TOTAL,
            "command" => label,
            "status" => if result.is_ok() { "ok" } else { "error" }
        )
        .increment(1);
        result
    }

    async fn dispatch_command(
        &self,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::SetSession { var, value } => {
                let mut session = self.session.lock().await;
                match var {
                    SessionVar::Facility => session.facility = Some(value),
                    SessionVar::Actor => session.username = Some(value),
                    SessionVar::Role => {
                        session.role = Role::parse(&value).ok_or_else(|| {
                            user_error("22023", format!("invalid role: {value}"))
                        })?;
                    }
                    SessionVar::TimezoneOffset => {
                        session.offset_minutes = value.parse().map_err(|_| {
                            user_error("22023", format!("invalid timezone offset: {value}"))
                        })?;
                    }
                }
                Ok(vec![Response::Execution(Tag::new("SET"))])
            }

            Command::InsertRoom { name, tags } => {
                let facility = self.session.lock().await.facility(None)?;
                match engine.create_room(facility, name, tags).await {
                    Ok(_) => Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))]),
                    Err(e) => {
                        tracing::error!("create room failed: {e}");
                        Err(user_error("P0001", "Failed to create room."))
                    }
                }
            }

            Command::UpdateRoom { facility_name, name, patch } => {
                let facility = self.session.lock().await.facility(facility_name)?;
                let schema = Arc::new(room_result_schema());
                let row = match engine.update_room(&facility, &name, patch).await {
                    Ok(update) => encode_room_result(
                        &schema,
                        "success",
                        update.kind.message(),
                        Some(&update.room),
                        update.old_flag.as_deref(),
                    ),
                    Err(e) => {
                        tracing::error!("update room {facility}/{name} failed: {e}");
                        let current = engine.get_room(&facility, &name).await;
                        encode_room_result(
                            &schema,
                            "error",
                            "Failed to update room.",
                            current.as_ref(),
                            None,
                        )
                    }
                };
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![row]),
                ))])
            }

            Command::InsertBooking { id, room_name, start_at, end_at, username } => {
                let (facility, actor, offset) = {
                    let session = self.session.lock().await;
                    (session.facility(None)?, session.actor()?, session.offset_minutes)
                };
                let draft = crate::engine::BookingDraft {
                    id,
                    facility_name: facility,
                    room_name,
                    username,
                    start_at,
                    end_at,
                };
                let schema = Arc::new(booking_result_schema());
                let row = match engine.create_booking(draft, &actor, offset).await {
                    Ok(CreateOutcome::Created(booking)) => encode_booking_result(
                        &schema,
                        "success",
                        "Booking created.",
                        Some(&booking),
                    ),
                    Ok(CreateOutcome::Rejected(reason)) => {
                        encode_booking_result(&schema, "error", reason.message(), None)
                    }
                    Err(e) => {
                        tracing::error!("create booking failed: {e}");
                        encode_booking_result(&schema, "error", "Failed to create booking.", None)
                    }
                };
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![row]),
                ))])
            }

            Command::UpdateBooking { id, patch } => {
                let (actor, offset) = {
                    let session = self.session.lock().await;
                    (session.actor()?, session.offset_minutes)
                };
                let schema = Arc::new(booking_result_schema());
                let row = match engine.update_booking(id, patch, &actor, offset).await {
                    Ok(UpdateOutcome::Updated(booking)) => encode_booking_result(
                        &schema,
                        "success",
                        "Booking updated.",
                        Some(&booking),
                    ),
                    Ok(UpdateOutcome::Rejected { reason, current }) => {
                        // The authoritative current row rides along so the
                        // caller can reconcile its optimistic edit.
                        encode_booking_result(&schema, "error", reason.message(), Some(&current))
                    }
                    Err(e) => {
                        tracing::error!("update booking {id} failed: {e}");
                        let current = engine.get_booking(id).await;
                        encode_booking_result(
                            &schema,
                            "error",
                            "Failed to update booking.",
                            current.as_ref(),
                        )
                    }
                };
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![row]),
                ))])
            }

            Command::DeleteBooking { id } => {
                let schema = Arc::new(booking_result_schema());
                let row = match engine.delete_booking(id).await {
                    Ok(_) => encode_booking_result(&schema, "success", "Booking deleted.", None),
                    Err(e) => {
                        tracing::error!("delete booking {id} failed: {e}");
                        encode_booking_result(&schema, "error", "Failed to delete booking.", None)
                    }
                };
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![row]),
                ))])
            }

            Command::SelectBookings { facility_name, day } => {
                let (facility, offset) = {
                    let session = self.session.lock().await;
                    (session.facility(facility_name)?, session.offset_minutes)
                };
                let bookings = engine.bookings_for_day(&facility, day, offset).await;

                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id)?;
                        encoder.encode_field(&b.facility_name)?;
                        encoder.encode_field(&b.room_name)?;
                        encoder.encode_field(&b.start_at)?;
                        encoder.encode_field(&b.end_at)?;
                        encoder.encode_field(&b.username)?;
                        encoder.encode_field(&b.flag)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }

            Command::SelectRooms { facility_name } => {
                let (facility, actor) = {
                    let session = self.session.lock().await;
                    (session.facility(facility_name)?, session.actor()?)
                };
                let rooms = engine.rooms_with_usage(&facility, &actor).await;

                let schema = Arc::new(rooms_schema());
                let rows: Vec<PgWireResult<_>> = rooms
                    .iter()
                    .map(|room| {
                        let tags = serde_json::to_string(&room.tags)
                            .unwrap_or_else(|_| "[]".to_string());
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&room.name)?;
                        encoder.encode_field(&tags)?;
                        encoder.encode_field(&room.flag)?;
                        encoder.encode_field(&room.minutes_used)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }

            Command::SelectUserUsage { facility_name } => {
                let facility = self.session.lock().await.facility(facility_name)?;
                let usage = engine.user_usage(&facility).await;

                let schema = Arc::new(user_usage_schema());
                let rows: Vec<PgWireResult<_>> = usage
                    .iter()
                    .map(|u| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&u.username)?;
                        encoder.encode_field(&u.minutes_used)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }

            Command::Listen { channel } => {
                let mut session = self.session.lock().await;
                if !session.subscriptions.iter().any(|(c, _)| c == &channel) {
                    let rx = engine.notify.subscribe(&channel);
                    session.subscriptions.push((channel, rx));
                }
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                let mut session = self.session.lock().await;
                session.subscriptions.retain(|(c, _)| c != &channel);
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                let mut session = self.session.lock().await;
                session.subscriptions.clear();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

/// Mutation outcome row: tagged status + the booking row when one applies.
fn booking_result_schema() -> Vec<FieldInfo> {
    vec![
        text_field("status"),
        text_field("message"),
        int8_field("id"),
        text_field("facility_name"),
        text_field("room_name"),
        int8_field("start_at"),
        int8_field("end_at"),
        text_field("username"),
        text_field("flag"),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        int8_field("id"),
        text_field("facility_name"),
        text_field("room_name"),
        int8_field("start_at"),
        int8_field("end_at"),
        text_field("username"),
        text_field("flag"),
    ]
}

fn rooms_schema() -> Vec<FieldInfo> {
    vec![
        text_field("name"),
        text_field("tags"),
        text_field("flag"),
        int8_field("minutes_used"),
    ]
}

fn user_usage_schema() -> Vec<FieldInfo> {
    vec![text_field("username"), int8_field("minutes_used")]
}

fn room_result_schema() -> Vec<FieldInfo> {
    vec![
        text_field("status"),
        text_field("message"),
        text_field("name"),
        text_field("tags"),
        text_field("flag"),
        text_field("old_flag"),
    ]
}

fn encode_booking_result(
    schema: &Arc<Vec<FieldInfo>>,
    status: &str,
    message: &str,
    booking: Option<&Booking>,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&status)?;
    encoder.encode_field(&message)?;
    match booking {
        Some(b) => {
            encoder.encode_field(&b.id)?;
            encoder.encode_field(&b.facility_name)?;
            encoder.encode_field(&b.room_name)?;
            encoder.encode_field(&b.start_at)?;
            encoder.encode_field(&b.end_at)?;
            encoder.encode_field(&b.username)?;
            encoder.encode_field(&b.flag)?;
        }
        None => {
            encoder.encode_field(&None::<i64>)?;
            encoder.encode_field(&None::<String>)?;
            encoder.encode_field(&None::<String>)?;
            encoder.encode_field(&None::<i64>)?;
            encoder.encode_field(&None::<i64>)?;
            encoder.encode_field(&None::<String>)?;
            encoder.encode_field(&None::<String>)?;
        }
    }
    Ok(encoder.take_row())
}

fn encode_room_result(
    schema: &Arc<Vec<FieldInfo>>,
    status: &str,
    message: &str,
    room: Option<&Room>,
    old_flag: Option<&str>,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&status)?;
    encoder.encode_field(&message)?;
    match room {
        Some(r) => {
            let tags = serde_json::to_string(&r.tags).unwrap_or_else(|_| "[]".to_string());
            encoder.encode_field(&r.name)?;
            encoder.encode_field(&tags)?;
            encoder.encode_field(&r.flag)?;
        }
        None => {
            encoder.encode_field(&None::<String>)?;
            encoder.encode_field(&None::<String>)?;
            encoder.encode_field(&None::<String>)?;
        }
    }
    encoder.encode_field(&old_flag)?;
    Ok(encoder.take_row())
}

#[async_trait]
impl SimpleQueryHandler for RoomdHandler {
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
        let engine = self.resolve_engine(client)?;
        self.seed_session(client).await;
        self.flush_notifications(client).await?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute_command(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomdQueryParser;

#[async_trait]
impl QueryParser for RoomdQueryParser {
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
        Ok(result_schema_for(stmt))
    }
}

/// Best-effort schema guess from the SQL text, for Describe responses.
fn result_schema_for(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    if upper.starts_with("SELECT") {
        if upper.contains("USER_USAGE") {
            user_usage_schema()
        } else if upper.contains("ROOMS") {
            rooms_schema()
        } else if upper.contains("BOOKINGS") {
            bookings_schema()
        } else {
            vec![]
        }
    } else if upper.contains("BOOKINGS") {
        booking_result_schema()
    } else if upper.starts_with("UPDATE") && upper.contains("ROOMS") {
        room_result_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl ExtendedQueryHandler for RoomdHandler {
    type Statement = String;
    type QueryParser = RoomdQueryParser;

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
        self.seed_session(client).await;
        self.flush_notifications(client).await?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(&engine, cmd).await?;
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
            result_schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema_for(
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
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
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

pub struct RoomdFactory {
    handler: Arc<RoomdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RoomdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = RoomdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoomdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomdFactory {
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

/// Serve one client connection. The factory — and with it the session
/// context — lives exactly as long as the connection.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<pgwire::tokio::TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = RoomdFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_error(code: &str, message: impl Into<String>) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message.into(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
