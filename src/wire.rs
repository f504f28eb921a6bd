use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::StartupHandler;
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
use tokio::net::TcpStream;

use crate::model::DefaultLimit;
use crate::observability;
use crate::service::{parse_date, DateLimits, LimitError, LimitService, ViewScope};
use crate::sql::{self, Command, SqlError};
use crate::store::StoreError;

pub struct SlotcapHandler {
    service: Arc<LimitService>,
    query_parser: Arc<SlotcapQueryParser>,
}

impl SlotcapHandler {
    pub fn new(service: Arc<LimitService>) -> Self {
        Self {
            service,
            query_parser: Arc::new(SlotcapQueryParser),
        }
    }

    /// Execute with RED metrics: one count and one latency sample per command.
    async fn run_command(&self, cmd: Command) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let svc = &self.service;
        match cmd {
            Command::SelectDefaults => {
                let defaults = svc.get_defaults().await.map_err(limit_err)?;
                let schema = Arc::new(default_limits_schema());
                let rows: Vec<PgWireResult<_>> = defaults
                    .into_iter()
                    .map(|(slot, count)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot)?;
                        encoder.encode_field(&i64::from(count))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectDateLimits { month, date } => {
                let scope =
                    ViewScope::parse(month.as_deref(), date.as_deref()).map_err(limit_err)?;
                let view = svc.get_view(scope).await.map_err(limit_err)?;
                let schema = Arc::new(date_limits_schema());
                let rows: Vec<PgWireResult<_>> = view
                    .rows()
                    .into_iter()
                    .map(|(ym, date, slot, count)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&ym)?;
                        encoder.encode_field(&date.to_string())?;
                        encoder.encode_field(&slot)?;
                        encoder.encode_field(&i64::from(count))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectSchedulerStatus => {
                let schema = Arc::new(scheduler_status_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&svc.scheduler_status())?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertDefaults { items } => {
                let items = items
                    .into_iter()
                    .map(|(slot, count)| DefaultLimit::new(slot, count))
                    .collect();
                let created = svc.create_defaults(items).await.map_err(limit_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(created.len())))
            }
            Command::UpdateDefault {
                time_slot,
                limit_count,
            } => {
                let changes = [(time_slot, limit_count)].into_iter().collect();
                let n = svc.update_defaults(&changes).await.map_err(limit_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(n)))
            }
            Command::InsertDateLimits { rows } => {
                let mut limits = DateLimits::new();
                for (date, slot, count) in rows {
                    let date = parse_date(&date).map_err(limit_err)?;
                    if limits.entry(date).or_default().insert(slot.clone(), count).is_some() {
                        return Err(limit_err(LimitError::InvalidArgument(format!(
                            "({date}, {slot}) appears twice in one statement"
                        ))));
                    }
                }
                let n = svc.create_overrides(&limits).await.map_err(limit_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(n)))
            }
            Command::UpdateDateLimit {
                date,
                time_slot,
                limit_count,
            } => {
                let date = parse_date(&date).map_err(limit_err)?;
                let mut limits = DateLimits::new();
                limits.entry(date).or_default().insert(time_slot, limit_count);
                let n = svc.update_overrides(&limits).await.map_err(limit_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(n)))
            }
            Command::Provision { horizon } => {
                let report = svc
                    .trigger_provision(horizon.as_deref())
                    .await
                    .map_err(limit_err)?;
                let schema = Arc::new(provision_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&report.horizon.to_string())?;
                encoder.encode_field(&report.start.to_string())?;
                encoder.encode_field(&report.end.to_string())?;
                encoder.encode_field(&(report.dates_seeded as i64))?;
                encoder.encode_field(&(report.rows_inserted as i64))?;
                encoder.encode_field(&(report.dates_skipped as i64))?;
                encoder.encode_field(&(report.rows_conflicted as i64))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SchedulerStart => {
                svc.scheduler_start().map_err(limit_err)?;
                Ok(Response::Execution(Tag::new("CALL")))
            }
            Command::SchedulerStop => {
                svc.scheduler_stop().map_err(limit_err)?;
                Ok(Response::Execution(Tag::new("CALL")))
            }
        }
    }
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn default_limits_schema() -> Vec<FieldInfo> {
    vec![
        text_field("time_slot", Type::VARCHAR),
        text_field("limit_count", Type::INT8),
    ]
}

fn date_limits_schema() -> Vec<FieldInfo> {
    vec![
        text_field("month", Type::VARCHAR),
        text_field("date", Type::VARCHAR),
        text_field("time_slot", Type::VARCHAR),
        text_field("limit_count", Type::INT8),
    ]
}

fn scheduler_status_schema() -> Vec<FieldInfo> {
    vec![text_field("scheduler_active", Type::BOOL)]
}

fn provision_schema() -> Vec<FieldInfo> {
    vec![
        text_field("horizon", Type::VARCHAR),
        text_field("start_date", Type::VARCHAR),
        text_field("end_date", Type::VARCHAR),
        text_field("dates_seeded", Type::INT8),
        text_field("rows_inserted", Type::INT8),
        text_field("dates_skipped", Type::INT8),
        text_field("rows_conflicted", Type::INT8),
    ]
}

/// Row description for a statement, empty for commands that return a tag.
/// Unparseable SQL describes as empty; the error surfaces on execute.
fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    match sql::parse_sql(&neutralize_params(stmt)) {
        Ok(Command::SelectDefaults) => default_limits_schema(),
        Ok(Command::SelectDateLimits { .. }) => date_limits_schema(),
        Ok(Command::SelectSchedulerStatus) => scheduler_status_schema(),
        Ok(Command::Provision { .. }) => provision_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotcapHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.run_command(cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotcapQueryParser;

#[async_trait]
impl QueryParser for SlotcapQueryParser {
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
impl ExtendedQueryHandler for SlotcapHandler {
    type Statement = String;
    type QueryParser = SlotcapQueryParser;

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
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run_command(cmd).await
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

/// Walk `sql` once, handing each `$N` placeholder outside quoted literals and
/// identifiers to `replace`. Returns the rewritten text and the highest N seen.
fn rewrite_placeholders(
    sql: &str,
    mut replace: impl FnMut(usize) -> Option<String>,
) -> (String, usize) {
    let mut out = String::with_capacity(sql.len());
    let mut max = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = sql.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match quote {
            // a doubled quote closes and reopens, which leaves the state unchanged
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == '$' => {
                let start = i + 1;
                let mut end = start;
                while let Some(&(j, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = j + 1;
                    chars.next();
                }
                if let Ok(n) = sql[start..end].parse::<usize>() {
                    max = max.max(n);
                    if let Some(value) = replace(n) {
                        out.push_str(&value);
                        continue;
                    }
                }
                out.push_str(&sql[i..end]);
                continue;
            }
            None => {}
        }
        out.push(c);
    }
    (out, max)
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    rewrite_placeholders(sql, |_| None).1
}

/// Swap every placeholder for an empty string literal so a prepared
/// statement can be classified before its parameters are bound.
fn neutralize_params(sql: &str) -> String {
    rewrite_placeholders(sql, |_| Some("''".to_string())).0
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Placeholders past the bound parameters are left as written.
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    rewrite_placeholders(sql, |n| {
        let param = params.get(n.checked_sub(1)?)?;
        Some(match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        })
    })
    .0
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotcapFactory {
    handler: Arc<SlotcapHandler>,
    noop: Arc<NoopHandler>,
}

impl SlotcapFactory {
    pub fn new(service: Arc<LimitService>) -> Self {
        Self {
            handler: Arc::new(SlotcapHandler::new(service)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotcapFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.noop.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    service: Arc<LimitService>,
) -> Result<(), std::io::Error> {
    let factory = Arc::new(SlotcapFactory::new(service));
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for a service error.
pub fn sqlstate(e: &LimitError) -> &'static str {
    match e {
        LimitError::Store(StoreError::DuplicateKey(_)) => "23505",
        LimitError::Store(StoreError::MissingDate(_)) => "23503",
        LimitError::Store(StoreError::WalError(_)) => "58030",
        LimitError::InvalidArgument(_) => "22023",
        LimitError::NotFound(_) => "P0002",
        LimitError::Conflict(_) => "55000",
    }
}

fn limit_err(e: LimitError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::InvalidValue(_) => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
