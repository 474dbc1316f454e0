use std::fmt::Debug;
use std::io;
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
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::auth::SlotbookAuthSource;
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::payment::{PaymentLink, PaymentService, ReconcileOutcome};
use crate::sql::{self, BookingFilter, Command};

pub struct SlotbookHandler {
    engine: Arc<Engine>,
    payments: Arc<PaymentService>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(engine: Arc<Engine>, payments: Arc<PaymentService>) -> Self {
        Self {
            engine,
            payments,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.dispatch(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result.map_err(engine_err)
    }

    async fn dispatch(&self, cmd: Command) -> Result<Vec<Response>, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::Reserve { request } => {
                let reservation = engine.reserve(request).await?;
                Ok(vec![booking_response(vec![reservation.booking])])
            }
            Command::CancelBooking { code } => {
                engine.cancel(&code).await?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::CompleteBooking { code } => {
                engine.complete(&code).await?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::StartPayment {
                code,
                plan,
                description,
                return_url,
                cancel_url,
            } => {
                let link = self
                    .payments
                    .start_payment(&code, plan, description.as_deref(), &return_url, &cancel_url)
                    .await?;
                Ok(vec![payment_link_response(&link)])
            }
            Command::PaymentNotification { notification } => {
                let outcome = self.payments.reconcile(&notification).await?;
                Ok(vec![reconcile_response(notification.order_code, &outcome)])
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::Code(code) => found(engine.get_by_code(&code).await)?,
                    BookingFilter::OrderCode(order) => {
                        found(engine.get_by_order_code(order).await)?
                    }
                    BookingFilter::Email(email) => engine.bookings_for_customer(&email).await,
                    BookingFilter::Date(date) => engine.bookings_on_date(date).await,
                };
                Ok(vec![booking_response(bookings)])
            }
            Command::SelectOccupiedSlots { room_id, date } => {
                let slots = engine.occupied_slots(room_id, date).await;
                let schema = Arc::new(occupied_slots_schema());
                let room = room_id.to_string();
                let day = date.to_string();
                let rows: Vec<PgWireResult<DataRow>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&room)?;
                        encoder.encode_field(&day)?;
                        encoder.encode_field(&slot.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectBookingStats { email } => {
                let stats = engine.customer_stats(&email).await;
                Ok(vec![stats_response(&stats)])
            }
        }
    }
}

/// Point lookups answer with zero rows instead of an error.
fn found(result: Result<Booking, EngineError>) -> Result<Vec<Booking>, EngineError> {
    match result {
        Ok(b) => Ok(vec![b]),
        Err(EngineError::NotFound(_)) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("code"),
        text_field("id"),
        text_field("room_id"),
        text_field("date"),
        text_field("slot_ids"),
        text_field("name"),
        text_field("email"),
        text_field("phone"),
        text_field("film_id"),
        text_field("combo_id"),
        text_field("promotion_id"),
        text_field("status"),
        int_field("total_money"),
        int_field("amount_due"),
        int_field("order_code"),
        int_field("created_at"),
        int_field("updated_at"),
    ]
}

fn occupied_slots_schema() -> Vec<FieldInfo> {
    vec![text_field("room_id"), text_field("date"), text_field("slot_id")]
}

fn stats_schema() -> Vec<FieldInfo> {
    vec![
        text_field("email"),
        int_field("total_bookings"),
        int_field("pending"),
        int_field("confirmed"),
        int_field("completed"),
        int_field("cancelled"),
        int_field("expired"),
        int_field("failed"),
        int_field("completed_spend"),
        int_field("paid"),
    ]
}

fn payment_link_schema() -> Vec<FieldInfo> {
    vec![
        text_field("code"),
        int_field("order_code"),
        int_field("amount"),
        text_field("checkout_url"),
        int_field("expires_at"),
    ]
}

fn reconcile_schema() -> Vec<FieldInfo> {
    vec![
        text_field("outcome"),
        int_field("order_code"),
        text_field("code"),
        text_field("status"),
        int_field("amount_due"),
    ]
}

fn encode_booking(encoder: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    let slot_ids = b
        .slot_ids
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(",");
    encoder.encode_field(&b.code)?;
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.room_id.to_string())?;
    encoder.encode_field(&b.date.to_string())?;
    encoder.encode_field(&slot_ids)?;
    encoder.encode_field(&b.customer.name)?;
    encoder.encode_field(&b.customer.email)?;
    encoder.encode_field(&b.customer.phone)?;
    encoder.encode_field(&b.film_id.map(|id| id.to_string()))?;
    encoder.encode_field(&b.combo_id.map(|id| id.to_string()))?;
    encoder.encode_field(&b.promotion_id.map(|id| id.to_string()))?;
    encoder.encode_field(&b.status.as_str().to_string())?;
    encoder.encode_field(&b.total_money)?;
    encoder.encode_field(&b.amount_due)?;
    encoder.encode_field(&b.order_code())?;
    encoder.encode_field(&b.created_at)?;
    encoder.encode_field(&b.updated_at)?;
    Ok(())
}

fn booking_response(bookings: Vec<Booking>) -> Response {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<DataRow>> = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_booking(&mut encoder, b)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// A one-row result set.
fn single_row(
    schema: Vec<FieldInfo>,
    encode: impl FnOnce(&mut DataRowEncoder) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let mut encoder = DataRowEncoder::new(schema.clone());
    let row = encode(&mut encoder).map(|()| encoder.take_row());
    Response::Query(QueryResponse::new(schema, stream::iter(vec![row])))
}

fn stats_response(stats: &CustomerStats) -> Response {
    single_row(stats_schema(), |encoder| {
        encoder.encode_field(&stats.email)?;
        for count in [
            stats.total_bookings,
            stats.pending,
            stats.confirmed,
            stats.completed,
            stats.cancelled,
            stats.expired,
            stats.failed,
        ] {
            encoder.encode_field(&(count as i64))?;
        }
        encoder.encode_field(&stats.completed_spend)?;
        encoder.encode_field(&stats.paid)
    })
}

fn payment_link_response(link: &PaymentLink) -> Response {
    single_row(payment_link_schema(), |encoder| {
        encoder.encode_field(&link.booking_code)?;
        encoder.encode_field(&link.order_code)?;
        encoder.encode_field(&link.amount)?;
        encoder.encode_field(&link.checkout_url)?;
        encoder.encode_field(&link.expires_at)
    })
}

fn reconcile_response(order_code: i64, outcome: &ReconcileOutcome) -> Response {
    let booking = outcome.booking();
    single_row(reconcile_schema(), |encoder| {
        encoder.encode_field(&outcome.label().to_string())?;
        encoder.encode_field(&order_code)?;
        encoder.encode_field(&booking.map(|b| b.code.clone()))?;
        encoder.encode_field(&booking.map(|b| b.status.as_str().to_string()))?;
        encoder.encode_field(&booking.map(|b| b.amount_due))
    })
}

/// Row description for a statement, decided from the table it names.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_ascii_lowercase();
    let names = |table: &str| {
        lower
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .any(|word| word == table)
    };
    let trimmed = lower.trim_start();
    if names("payment_notifications") {
        reconcile_schema()
    } else if names("payment_links") {
        payment_link_schema()
    } else if names("booking_stats") {
        stats_schema()
    } else if names("occupied_slots") {
        occupied_slots_schema()
    } else if names("bookings") && !trimmed.starts_with("delete") {
        booking_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
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
        self.execute_command(cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
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
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

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
        let mut responses = self.execute_command(cmd).await?;
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

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &params)
}

fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut result = sql.to_string();
    // Highest index first so $1 does not clobber $10.
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(text) => format!("'{}'", text.replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(engine: Arc<Engine>, payments: Arc<PaymentService>, password: String) -> Self {
        let auth_source = SlotbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotbookHandler::new(engine, payments)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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
    payments: Arc<PaymentService>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SlotbookFactory::new(engine, payments, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "22023",
        ErrorKind::Conflict => "23P01",
        ErrorKind::DomainRule => "P0001",
        ErrorKind::State => "55000",
        ErrorKind::External => "58000",
        ErrorKind::Internal => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let kind = e.kind();
    match kind {
        ErrorKind::Internal => error!("{e}"),
        ErrorKind::External => warn!("{e}"),
        _ => debug!("{e}"),
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(kind).into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    let code = match e {
        sql::SqlError::Unsupported(_) => "0A000",
        sql::SqlError::UnknownTable(_) => "42P01",
        _ => "42601",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM bookings WHERE code = 'x'"), 0);
        assert_eq!(count_params("INSERT INTO completions VALUES ($1)"), 1);
        assert_eq!(
            count_params("INSERT INTO payment_notifications VALUES ($2, $1, $4, $3)"),
            4
        );
    }

    #[test]
    fn substitute_quotes_and_nulls() {
        let sql = "INSERT INTO bookings (name, film_id, email) VALUES ($1, $2, $3)";
        let out = substitute(
            sql,
            &[Some("O'Brien".into()), None, Some("o@example.com".into())],
        );
        assert_eq!(
            out,
            "INSERT INTO bookings (name, film_id, email) VALUES ('O''Brien', NULL, 'o@example.com')"
        );
    }

    #[test]
    fn substitute_does_not_clobber_two_digit_params() {
        let params: Vec<Option<String>> = (1..=10).map(|i| Some(i.to_string())).collect();
        let out = substitute("VALUES ($1, $10)", &params);
        assert_eq!(out, "VALUES ('1', '10')");
    }

    #[test]
    fn schema_follows_table() {
        assert_eq!(result_schema("SELECT * FROM bookings WHERE code = $1").len(), 17);
        assert_eq!(result_schema("insert into bookings values ($1)").len(), 17);
        assert!(result_schema("DELETE FROM bookings WHERE code = $1").is_empty());
        assert_eq!(result_schema("SELECT * FROM booking_stats WHERE email = $1").len(), 10);
        assert_eq!(result_schema("SELECT * FROM occupied_slots WHERE room_id = $1").len(), 3);
        assert_eq!(result_schema("INSERT INTO payment_links VALUES ($1, $2)").len(), 5);
        assert_eq!(
            result_schema("INSERT INTO payment_notifications VALUES ($1, $2, $3, $4)").len(),
            5
        );
        assert!(result_schema("INSERT INTO completions VALUES ($1)").is_empty());
    }

    #[test]
    fn error_kinds_map_to_sqlstate() {
        let conflict = EngineError::SlotConflict {
            slot: ulid::Ulid::new(),
            booking: ulid::Ulid::new(),
        };
        assert_eq!(sqlstate(conflict.kind()), "23P01");
        assert_eq!(sqlstate(EngineError::MissingField("email").kind()), "22023");
        assert_eq!(sqlstate(EngineError::InvalidSignature.kind()), "58000");
        assert_eq!(sqlstate(EngineError::WalError("disk".into()).kind()), "XX000");
    }
}
