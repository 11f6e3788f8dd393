use std::fmt::Debug;
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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse, Response,
    Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{CredentialStore, ReservdAuthSource};
use crate::engine::{Engine, ReservationFilter, ReserveError};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError};

pub struct ReservdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<ReservdQueryParser>,
}

impl ReservdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(ReservdQueryParser),
        }
    }

    async fn run(&self, owner: &str, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(owner, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, owner: &str, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertReservation {
                resource,
                start,
                end,
                returning,
            } => {
                let reservation = self
                    .engine
                    .reserve(&resource, Span::new(start, end), owner)
                    .await
                    .map_err(reserve_err)?;
                if returning {
                    Ok(reservation_rows(vec![reservation]))
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::SelectReservations { resource, owner } => {
                let listed = self
                    .engine
                    .list_reservations(&ReservationFilter { resource, owner })
                    .await
                    .map_err(reserve_err)?;
                Ok(reservation_rows(listed))
            }
        }
    }
}

/// The login user, established by the startup handler.
fn principal<C: ClientInfo>(client: &C) -> PgWireResult<String> {
    client
        .metadata()
        .get("user")
        .cloned()
        .ok_or_else(|| user_error("28000", "no authenticated user".into()))
}

pub fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("resource".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("start".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("end".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("owner".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("created_at".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn reservation_rows(reservations: Vec<Reservation>) -> Response {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.resource)?;
            encoder.encode_field(&r.span.start)?;
            encoder.encode_field(&r.span.end)?;
            encoder.encode_field(&r.owner)?;
            encoder.encode_field(&r.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Whether a statement produces rows, judged without binding parameters.
fn returns_rows(sql: &str) -> bool {
    let upper = sql.to_uppercase();
    upper.trim_start().starts_with("SELECT") || upper.contains("RETURNING")
}

fn schema_for(sql: &str) -> Vec<FieldInfo> {
    if returns_rows(sql) {
        reservation_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for ReservdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let owner = principal(client)?;
        Ok(vec![self.run(&owner, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ReservdQueryParser;

#[async_trait]
impl QueryParser for ReservdQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ReservdHandler {
    type Statement = String;
    type QueryParser = ReservdQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(&self, client: &mut C, portal: &Portal<Self::Statement>, _max_rows: usize) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let owner = principal(client)?;
        let sql = substitute_params(portal);
        self.run(&owner, &sql).await
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
        Ok(DescribeStatementResponse::new(param_types, schema_for(&target.statement)))
    }

    async fn do_describe_portal<C>(&self, _client: &mut C, target: &Portal<Self::Statement>) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for(&target.statement.statement)))
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
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text
/// format, quoted).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass over `sql`, so text inside a bound value is never
/// scanned again. A placeholder with no matching parameter is left as is.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let digits = i + 1;
        let mut j = digits;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        let param = sql[digits..j]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        if let Some(param) = param {
            out.push_str(&sql[copied..i]);
            match param {
                Some(value) => {
                    let text = String::from_utf8_lossy(value.as_ref());
                    out.push('\'');
                    out.push_str(&text.replace('\'', "''"));
                    out.push('\'');
                }
                None => out.push_str("NULL"),
            }
            copied = j;
        }
        i = j.max(i + 1);
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ReservdFactory {
    handler: Arc<ReservdHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<ReservdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ReservdFactory {
    pub fn new(engine: Arc<Engine>, credentials: Arc<CredentialStore>) -> Self {
        let auth_source = ReservdAuthSource::new(credentials);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ReservdHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ReservdFactory {
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

/// Drive one client connection to completion.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<ReservdFactory>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE and client-facing message for each engine outcome. Invariant
/// violations are already logged with full context by the engine; the
/// client gets nothing more.
fn reserve_sqlstate(e: &ReserveError) -> (&'static str, String) {
    match e {
        ReserveError::InvalidInterval(_) | ReserveError::InvalidRequest(_) => ("22023", e.to_string()),
        ReserveError::Overlap { .. } => ("23P01", e.to_string()),
        ReserveError::LimitExceeded(_) => ("54000", e.to_string()),
        ReserveError::StoreUnavailable(_) => ("58000", "reservation store unavailable, retry later".into()),
        ReserveError::InvariantViolation(_) => ("XX000", "internal error".into()),
    }
}

fn reserve_err(e: ReserveError) -> PgWireError {
    let (code, message) = reserve_sqlstate(&e);
    user_error(code, message)
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        SqlError::ServerAssigned(_) => "42501",
        SqlError::Unsupported(_) => "0A000",
        SqlError::Parse(_) | SqlError::Empty | SqlError::WrongArity(..) => "42601",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;

    fn code_of(e: ReserveError) -> &'static str {
        reserve_sqlstate(&e).0
    }

    #[test]
    fn reserve_errors_map_to_sqlstate() {
        let overlap = ReserveError::Overlap {
            resource: "RoomA".into(),
            span: Span::new(0, 10),
        };
        let (code, message) = reserve_sqlstate(&overlap);
        assert_eq!(code, "23P01");
        assert_eq!(message, "resource RoomA is unavailable for [0, 10)");
        assert_eq!(code_of(ReserveError::InvalidRequest("owner is empty")), "22023");
        assert_eq!(code_of(ReserveError::LimitExceeded("full")), "54000");
        assert_eq!(code_of(ReserveError::StoreUnavailable("disk".into())), "58000");
    }

    #[test]
    fn invariant_violation_detail_is_hidden() {
        let (code, message) = reserve_sqlstate(&ReserveError::InvariantViolation("r1 overlaps r2 on RoomA".into()));
        assert_eq!(code, "XX000");
        assert!(!message.contains("RoomA"));
    }

    #[test]
    fn sql_errors_map_to_sqlstate() {
        assert_eq!(sql_sqlstate(&SqlError::Parse("x".into())), "42601");
        assert_eq!(sql_sqlstate(&SqlError::ServerAssigned("owner")), "42501");
        assert_eq!(sql_sqlstate(&SqlError::UnknownTable("rooms".into())), "42P01");
    }

    #[test]
    fn counts_placeholders() {
        assert_eq!(count_params("SELECT * FROM reservations"), 0);
        assert_eq!(
            count_params(r#"INSERT INTO reservations (resource, start, "end") VALUES ($1, $2, $3)"#),
            3
        );
        assert_eq!(count_params("SELECT * FROM reservations WHERE owner = $2 AND resource = $1"), 2);
        assert_eq!(count_params("SELECT '$'"), 0);
    }

    #[test]
    fn row_returning_statements_describe_schema() {
        assert_eq!(schema_for("SELECT * FROM reservations").len(), 6);
        assert_eq!(
            schema_for("INSERT INTO reservations VALUES ($1, $2, $3) RETURNING *").len(),
            6
        );
        assert!(schema_for("INSERT INTO reservations VALUES ($1, $2, $3)").is_empty());
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let sql = "SELECT * FROM reservations WHERE resource = $1 AND owner = $2";
        let params = [Some("RoomA"), Some("a$1")];
        assert_eq!(
            bind_params(sql, &params),
            "SELECT * FROM reservations WHERE resource = 'RoomA' AND owner = 'a$1'"
        );
    }

    #[test]
    fn binds_quotes_nulls_and_wide_indexes() {
        let params: Vec<Option<String>> = (1..=10)
            .map(|n| if n == 2 { None } else { Some(format!("v{n}")) })
            .collect();
        assert_eq!(bind_params("$10, $1, $2", &params), "'v10', 'v1', NULL");
        assert_eq!(bind_params("$1 $3", &[Some("it's")]), "'it''s' $3");
        assert_eq!(bind_params("price $ 5", &[Some("x")]), "price $ 5");
    }
}
