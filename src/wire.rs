use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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

use crate::auth::SlotmatchAuthSource;
use crate::engine::{ConflictKind, Engine, EngineError};
use crate::model::*;
use crate::normalize::{RawSlot, ValidationError, normalize};
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

pub struct SlotmatchHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SlotmatchQueryParser>,
}

impl SlotmatchHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SlotmatchQueryParser),
        }
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run(&self, sql_text: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertSlots {
                resource_id,
                actor_id,
                role,
                rows,
            } => {
                let count = if let [raw] = rows.as_slice() {
                    engine
                        .create_from_input(actor_id, resource_id, role, raw)
                        .await
                        .map_err(engine_err)?;
                    1
                } else {
                    let grid = engine.config().grid;
                    let spans = rows
                        .iter()
                        .map(|raw| normalize(raw, &grid))
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|e| engine_err(e.into()))?;
                    engine
                        .create_slots(actor_id, resource_id, role, spans)
                        .await
                        .map_err(engine_err)?
                        .len()
                };
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::InsertRecurring {
                resource_id,
                actor_id,
                role,
                pattern,
            } => {
                let today = chrono::Utc::now().date_naive();
                let created = engine
                    .create_recurring(actor_id, resource_id, role, &pattern, today)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(
                    Tag::new("INSERT").with_rows(created.len()),
                ))
            }
            Command::UpdateSlot { id, start, end } => {
                let current = engine
                    .get_slot(id)
                    .await
                    .ok_or_else(|| engine_err(EngineError::NotFound(id)))?;
                let raw = RawSlot::Range {
                    start: Some(start.unwrap_or_else(|| current.span.start.to_string())),
                    end: Some(end.unwrap_or_else(|| current.span.end.to_string())),
                };
                let span = normalize(&raw, &engine.config().grid).map_err(|e| engine_err(e.into()))?;
                engine.replace_slot(id, span).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteSlot { id } => {
                engine.delete_slot(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::DeleteSlots {
                resource_id,
                actor_id,
            } => {
                let removed = engine
                    .delete_by_resource(resource_id, actor_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(
                    Tag::new("DELETE").with_rows(removed.len()),
                ))
            }
            Command::SelectSlot { id } => {
                slot_rows(engine.get_slot(id).await.into_iter().collect())
            }
            Command::SelectSlots {
                resource_id,
                actor_id,
            } => slot_rows(engine.list_by_resource(resource_id, actor_id).await),
            Command::SelectActorSlots { actor_id } => {
                slot_rows(engine.list_by_actor(actor_id).await)
            }
            Command::SelectMatches {
                resource_id,
                actor_a,
                actor_b,
            } => match_rows(engine.find_matches(resource_id, actor_a, actor_b).await),
            Command::SelectResourceMatches { resource_id } => {
                match_rows(engine.find_resource_matches(resource_id).await)
            }
        }
    }
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        int8("resource_id"),
        int8("actor_id"),
        varchar("role"),
        int8("start"),
        int8("end"),
        int8("created_at"),
    ]
}

fn match_schema() -> Vec<FieldInfo> {
    vec![
        int8("resource_id"),
        int8("start"),
        int8("end"),
        int8("actor_a"),
        int8("actor_b"),
    ]
}

fn slot_rows(slots: Vec<Slot>) -> PgWireResult<Response> {
    let schema = Arc::new(slot_schema());
    let rows: Vec<PgWireResult<_>> = slots
        .into_iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&slot.id.to_string())?;
            encoder.encode_field(&slot.resource_id)?;
            encoder.encode_field(&slot.actor_id)?;
            encoder.encode_field(&slot.role.as_str())?;
            encoder.encode_field(&slot.span.start)?;
            encoder.encode_field(&slot.span.end)?;
            encoder.encode_field(&slot.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn match_rows(matches: Vec<MatchResult>) -> PgWireResult<Response> {
    let schema = Arc::new(match_schema());
    let rows: Vec<PgWireResult<_>> = matches
        .into_iter()
        .map(|m| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&m.resource_id)?;
            encoder.encode_field(&m.span.start)?;
            encoder.encode_field(&m.span.end)?;
            encoder.encode_field(&m.actors[0])?;
            encoder.encode_field(&m.actors[1])?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Row schema a statement will produce, judged from its text alone.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        vec![]
    } else if upper.contains("MATCHES") {
        match_schema()
    } else {
        slot_schema()
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotmatchHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotmatchQueryParser;

#[async_trait]
impl QueryParser for SlotmatchQueryParser {
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
impl ExtendedQueryHandler for SlotmatchHandler {
    type Statement = String;
    type QueryParser = SlotmatchQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
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
        self.run(&sql).await
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals. Highest index first so
/// `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&format!("${}", i + 1), &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotmatchFactory {
    handler: Arc<SlotmatchHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotmatchAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotmatchFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(SlotmatchHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SlotmatchAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotmatchFactory {
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
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = SlotmatchFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error translation ───────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(ValidationError::Unparseable(_)) => "22007",
        EngineError::Validation(_) => "22023",
        EngineError::Conflict {
            kind: ConflictKind::DuplicateSlot,
            ..
        } => "23505",
        EngineError::Conflict {
            kind: ConflictKind::OverlappingSlot,
            ..
        } => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Cancelled => "57014",
        EngineError::Storage(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::Storage(msg) = &e {
        tracing::error!("storage failure: {msg}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
