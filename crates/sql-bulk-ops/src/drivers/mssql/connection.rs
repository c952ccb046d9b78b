//! Pooled tiberius session.
//!
//! One [`MssqlConnection`] pins a single pooled client between `open` and
//! `close`, so `#temp` staging tables and `SET IDENTITY_INSERT` stay visible to
//! every statement of a bulk operation. Statements without parameters are sent
//! as plain batches: `sp_executesql` would scope both to the call.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rust_decimal::Decimal;
use tiberius::{
    AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, ToSql, TokenRow,
};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

use crate::bulk::progress::ProgressReporter;
use crate::config::MssqlConfig;
use crate::core::identifier::escape_literal;
use crate::core::traits::{BulkConnection, BulkLoadRequest};
use crate::core::value::{SqlParameter, SqlValue, ValueKind};
use crate::error::{BulkError, Result};

/// Provider name reported to the dialect registry.
pub const PROVIDER_NAME: &str = "Microsoft.EntityFrameworkCore.SqlServer";

/// Connection pool timeouts.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(1800);
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Days from 0001-01-01 (day 1 of the common era) to 1900-01-01.
const DAYS_TO_1900: i32 = 693_595;

/// `datetime` stores time of day in 1/300 second ticks.
const DATETIME_TICKS_PER_DAY: u64 = 300 * 86_400;

/// A pooled client and whether its TDS stream can still be trusted.
///
/// The flag is raised before every request and lowered once the server's
/// response has been read to the end. A request future dropped half way, or a
/// bulk load that failed mid-stream, leaves it raised and the pool discards the
/// client instead of handing it out again.
pub struct TdsSession {
    client: Client<Compat<TcpStream>>,
    broken: bool,
}

impl TdsSession {
    fn new(client: Client<Compat<TcpStream>>) -> Self {
        Self {
            client,
            broken: false,
        }
    }
}

impl std::ops::Deref for TdsSession {
    type Target = Client<Compat<TcpStream>>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl std::ops::DerefMut for TdsSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.client
    }
}

/// Whether the response to a request was consumed completely.
///
/// Server errors arrive as a token inside a complete response. Anything else
/// (io, protocol, a failed bulk send) may leave unread bytes on the wire.
pub(crate) fn response_completed<T>(result: &Result<T>) -> bool {
    match result {
        Ok(_) => true,
        Err(BulkError::Mssql(tiberius::error::Error::Server(_))) => true,
        Err(_) => false,
    }
}

/// Connection manager for bb8 pool with Tiberius.
#[derive(Clone)]
pub struct TiberiusConnectionManager {
    config: MssqlConfig,
}

impl TiberiusConnectionManager {
    pub fn new(config: MssqlConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(&self.config.user, &self.config.password));

        if self.config.encrypts() {
            if self.config.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = TdsSession;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr()).await.map_err(|e| {
            tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            }
        })?;
        tcp.set_nodelay(true).ok();

        let keepalive = socket2::TcpKeepalive::new()
            .with_time(TCP_KEEPALIVE_INTERVAL)
            .with_interval(TCP_KEEPALIVE_INTERVAL);
        if let Err(e) = socket2::SockRef::from(&tcp).set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive on SQL Server connection: {}", e);
        }

        Ok(TdsSession::new(
            Client::connect(config, tcp.compat_write()).await?,
        ))
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.broken
    }
}

pub type MssqlPool = Pool<TiberiusConnectionManager>;

/// SQL Server implementation of [`BulkConnection`].
pub struct MssqlConnection {
    pool: MssqlPool,
    session: Option<PooledConnection<'static, TiberiusConnectionManager>>,
    in_transaction: bool,
}

impl MssqlConnection {
    /// Build a pool from configuration and verify it can reach the server.
    ///
    /// The returned connection is closed; it checks a session out on `open`.
    pub async fn connect(config: &MssqlConfig) -> Result<Self> {
        config.validate()?;
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .min_idle(Some(1))
            .connection_timeout(POOL_CONNECTION_TIMEOUT)
            .idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .max_lifetime(Some(POOL_MAX_LIFETIME))
            .test_on_check_out(true)
            .build(manager)
            .await
            .map_err(|e| BulkError::pool(e, "creating SQL Server pool"))?;

        {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| BulkError::pool(e, "testing SQL Server connection"))?;
            conn.simple_query("SELECT 1").await?.into_results().await?;
        }

        info!(
            "Connected to SQL Server: {}:{}/{} (pool_size={})",
            config.host, config.port, config.database, config.pool_size
        );

        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: MssqlPool) -> Self {
        Self {
            pool,
            session: None,
            in_transaction: false,
        }
    }

    pub fn pool(&self) -> &MssqlPool {
        &self.pool
    }

    /// The session for the next request, marked busy until [`Self::end_request`].
    ///
    /// A session left mid-request by an earlier call is discarded first. Its
    /// transaction went with it, which is reported instead of silently
    /// continuing on a fresh session.
    async fn begin_request(&mut self) -> Result<&mut TdsSession> {
        if self.session.as_ref().map_or(false, |s| s.broken) {
            warn!("Discarding SQL Server session interrupted mid-request");
            self.session = None;
            if self.in_transaction {
                self.in_transaction = false;
                return Err(BulkError::Connection(
                    "session was interrupted mid-request and its transaction was rolled back"
                        .into(),
                ));
            }
            self.open().await?;
        }
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BulkError::Connection("SQL Server connection is not open".into()))?;
        session.broken = true;
        Ok(&mut **session)
    }

    fn end_request<T>(&mut self, result: Result<T>) -> Result<T> {
        if response_completed(&result) {
            if let Some(session) = self.session.as_mut() {
                session.broken = false;
            }
        }
        result
    }

    async fn batch(&mut self, sql: &str) -> Result<()> {
        let session = self.begin_request().await?;
        let result = async {
            session.simple_query(sql).await?.into_results().await?;
            Ok::<_, BulkError>(())
        }
        .await;
        self.end_request(result)
    }

    /// Writable destination columns in table order.
    async fn destination_columns(&mut self, table: &str) -> Result<Vec<DestinationColumn>> {
        let (catalog, object) = if table.starts_with("[#") {
            ("tempdb.", format!("tempdb..{}", table))
        } else {
            ("", table.to_string())
        };
        let sql = format!(
            r#"SELECT c.name, TYPE_NAME(c.system_type_id), CAST(c.scale AS int)
               FROM {}sys.columns AS c
               WHERE c.object_id = OBJECT_ID(N'{}')
                 AND c.is_identity = 0 AND c.is_computed = 0 AND c.system_type_id <> 189
               ORDER BY c.column_id"#,
            catalog,
            escape_literal(&object)
        );

        let session = self.begin_request().await?;
        let result = async {
            let rows = session.simple_query(sql).await?.into_first_result().await?;
            Ok::<_, BulkError>(rows)
        }
        .await;
        let rows = self.end_request(result)?;

        let columns: Vec<DestinationColumn> = rows
            .iter()
            .map(|row| DestinationColumn {
                name: row.get::<&str, _>(0).unwrap_or_default().to_string(),
                sql_type: row.get::<&str, _>(1).unwrap_or_default().to_lowercase(),
                scale: row.get::<i32, _>(2).unwrap_or(0).clamp(0, 38) as u8,
            })
            .collect();

        if columns.is_empty() {
            return Err(BulkError::column_mapping(
                table,
                "destination table does not exist or has no writable columns",
            ));
        }
        Ok(columns)
    }
}

#[async_trait]
impl BulkConnection for MssqlConnection {
    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        if self.session.is_none() {
            let conn = self
                .pool
                .get_owned()
                .await
                .map_err(|e| BulkError::pool(e, "getting SQL Server connection"))?;
            self.session = Some(conn);
            debug!("Opened SQL Server session");
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.in_transaction {
            warn!("Closing SQL Server session with an open transaction, rolling back");
            self.rollback().await?;
        }
        self.session = None;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(BulkError::Connection("transaction already active".into()));
        }
        self.batch("BEGIN TRANSACTION").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(BulkError::Connection("no active transaction to commit".into()));
        }
        self.in_transaction = false;
        self.batch("COMMIT TRANSACTION").await
    }

    async fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        // a deadlock victim's transaction is already gone server-side, and an
        // interrupted session is replaced, its transaction dying with the socket
        self.batch("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await
    }

    async fn execute(&mut self, sql: &str, params: &[SqlParameter]) -> Result<u64> {
        if params.is_empty() {
            let batch = format!("{};\nSELECT @@ROWCOUNT", sql.trim_end().trim_end_matches(';'));
            let session = self.begin_request().await?;
            let result = async {
                let rows = session.simple_query(batch).await?.into_results().await?;
                Ok::<_, BulkError>(rows)
            }
            .await;
            let results = self.end_request(result)?;
            let affected = results
                .last()
                .and_then(|rows| rows.first())
                .and_then(|row| row.get::<i32, _>(0))
                .unwrap_or(0);
            return Ok(affected.max(0) as u64);
        }

        let (sql, bound) = bind_positional(sql, params);
        let values: Vec<Box<dyn ToSql>> = bound.iter().map(|p| to_sql_param(&p.value)).collect();
        let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let session = self.begin_request().await?;
        let result = async {
            let affected = session.execute(sql, &refs).await?.total();
            Ok::<_, BulkError>(affected)
        }
        .await;
        self.end_request(result)
    }

    async fn query(
        &mut self,
        sql: &str,
        params: &[SqlParameter],
    ) -> Result<Vec<Vec<SqlValue<'static>>>> {
        let rows = if params.is_empty() {
            let session = self.begin_request().await?;
            let result = async {
                let rows = session.simple_query(sql).await?.into_first_result().await?;
                Ok::<_, BulkError>(rows)
            }
            .await;
            self.end_request(result)?
        } else {
            let (sql, bound) = bind_positional(sql, params);
            let values: Vec<Box<dyn ToSql>> =
                bound.iter().map(|p| to_sql_param(&p.value)).collect();
            let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
            let session = self.begin_request().await?;
            let result = async {
                let rows = session.query(sql, &refs).await?.into_first_result().await?;
                Ok::<_, BulkError>(rows)
            }
            .await;
            self.end_request(result)?
        };

        rows.into_iter()
            .map(|row| row.into_iter().map(column_data_to_value).collect())
            .collect()
    }

    async fn execute_each(
        &mut self,
        sql: &str,
        rows: Vec<Vec<SqlParameter>>,
        progress: Option<ProgressReporter>,
    ) -> Result<u64> {
        let mut affected = 0;
        for params in rows {
            affected += self.execute(sql, &params).await?;
            if let Some(progress) = &progress {
                progress.add_rows(1);
            }
        }
        Ok(affected)
    }

    async fn bulk_load(&mut self, request: BulkLoadRequest<'_>) -> Result<u64> {
        let table = request.table;
        let buffer = request.buffer;
        if buffer.is_empty() {
            return Ok(0);
        }

        let destination = self.destination_columns(table).await?;
        let plan = plan_columns(table, &destination, buffer.destination_columns())?;

        let chunk_size = if request.batch_size == 0 {
            buffer.len()
        } else {
            request.batch_size
        };

        let conn = self.begin_request().await?;
        let result = async {
            let mut sent = 0u64;
            for chunk in buffer.rows.chunks(chunk_size) {
                let mut bulk = conn
                    .bulk_insert(table)
                    .await
                    .map_err(|e| BulkError::transfer(table, format!("bulk insert init: {}", e)))?;

                for row in chunk {
                    let mut token_row = TokenRow::new();
                    for (column, source) in destination.iter().zip(&plan) {
                        let data = match source {
                            Some(i) => column.encode(&row[*i]).map_err(|e| {
                                BulkError::transfer(table, format!("column {}: {}", column.name, e))
                            })?,
                            None => column.null(),
                        };
                        token_row.push(data);
                    }
                    bulk.send(token_row).await.map_err(|e| {
                        BulkError::transfer(table, format!("bulk insert send: {}", e))
                    })?;
                    sent += 1;
                    if let Some(progress) = &request.progress {
                        progress.add_rows(1);
                    }
                }

                bulk.finalize().await.map_err(|e| {
                    BulkError::transfer(table, format!("bulk insert finalize: {}", e))
                })?;
            }
            Ok::<_, BulkError>(sent)
        }
        .await;
        // only a bulk request that reached `finalize` leaves the stream usable
        let sent = result?;
        self.end_request(Ok(sent))?;

        debug!("Bulk loaded {} rows into {}", sent, table);
        Ok(sent)
    }
}

/// Rewrite `@name` parameters to tiberius' positional `@P1..@Pn`.
///
/// Names are matched case-insensitively against `params`; unknown names and
/// `@@` system variables are left alone, as is anything inside quotes,
/// brackets or comments.
pub(crate) fn bind_positional<'p>(
    sql: &str,
    params: &'p [SqlParameter],
) -> (String, Vec<&'p SqlParameter>) {
    #[derive(PartialEq)]
    enum State {
        Code,
        Literal,
        Bracket,
        Quoted,
        LineComment,
        BlockComment,
    }

    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut bound: Vec<&SqlParameter> = Vec::new();
    let mut state = State::Code;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match state {
            State::Code => match c {
                '\'' => state = State::Literal,
                '[' => state = State::Bracket,
                '"' => state = State::Quoted,
                '-' if next == Some('-') => state = State::LineComment,
                '/' if next == Some('*') => state = State::BlockComment,
                '@' if next == Some('@') => {
                    out.push_str("@@");
                    i += 2;
                    continue;
                }
                '@' => {
                    let start = i + 1;
                    let mut end = start;
                    while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                        end += 1;
                    }
                    let name: String = chars[i..end].iter().collect();
                    if let Some(param) = params.iter().find(|p| p.name.eq_ignore_ascii_case(&name)) {
                        let position = match bound.iter().position(|b| std::ptr::eq(*b, param)) {
                            Some(position) => position,
                            None => {
                                bound.push(param);
                                bound.len() - 1
                            }
                        };
                        out.push_str(&format!("@P{}", position + 1));
                        i = end;
                        continue;
                    }
                }
                _ => {}
            },
            State::Literal if c == '\'' => state = State::Code,
            State::Bracket if c == ']' => state = State::Code,
            State::Quoted if c == '"' => state = State::Code,
            State::LineComment if c == '\n' => state = State::Code,
            State::BlockComment if c == '*' && next == Some('/') => {
                out.push_str("*/");
                i += 2;
                state = State::Code;
                continue;
            }
            _ => {}
        }
        out.push(c);
        i += 1;
    }

    (out, bound)
}

/// Map buffer columns onto destination columns, by name.
fn plan_columns<'a>(
    table: &str,
    destination: &[DestinationColumn],
    sources: impl Iterator<Item = &'a str>,
) -> Result<Vec<Option<usize>>> {
    let mut plan = vec![None; destination.len()];
    for (source_index, source) in sources.enumerate() {
        let target = destination
            .iter()
            .position(|d| d.name.eq_ignore_ascii_case(source))
            .ok_or_else(|| {
                BulkError::column_mapping(
                    table,
                    format!("source column [{}] has no destination column", source),
                )
            })?;
        plan[target] = Some(source_index);
    }
    Ok(plan)
}

/// A writable column of the bulk load destination.
#[derive(Debug, Clone, PartialEq)]
struct DestinationColumn {
    name: String,
    /// Lowercase system type name.
    sql_type: String,
    scale: u8,
}

impl DestinationColumn {
    fn kind(&self) -> ValueKind {
        match self.sql_type.as_str() {
            "bit" => ValueKind::Bool,
            "tinyint" => ValueKind::U8,
            "smallint" => ValueKind::I16,
            "int" => ValueKind::I32,
            "bigint" => ValueKind::I64,
            "real" => ValueKind::F32,
            "float" => ValueKind::F64,
            "decimal" | "numeric" | "money" | "smallmoney" => ValueKind::Decimal,
            "uniqueidentifier" => ValueKind::Uuid,
            "date" => ValueKind::Date,
            "time" => ValueKind::Time,
            "datetime" | "datetime2" | "smalldatetime" => ValueKind::DateTime,
            "datetimeoffset" => ValueKind::DateTimeOffset,
            "binary" | "varbinary" | "image" => ValueKind::Bytes,
            _ => ValueKind::String,
        }
    }

    fn null(&self) -> ColumnData<'static> {
        match self.sql_type.as_str() {
            "bit" => ColumnData::Bit(None),
            "tinyint" => ColumnData::U8(None),
            "smallint" => ColumnData::I16(None),
            "int" => ColumnData::I32(None),
            "bigint" => ColumnData::I64(None),
            "real" => ColumnData::F32(None),
            "float" => ColumnData::F64(None),
            "decimal" | "numeric" | "money" | "smallmoney" => ColumnData::Numeric(None),
            "uniqueidentifier" => ColumnData::Guid(None),
            "date" => ColumnData::Date(None),
            "time" => ColumnData::Time(None),
            "datetime" => ColumnData::DateTime(None),
            "smalldatetime" => ColumnData::SmallDateTime(None),
            "datetime2" => ColumnData::DateTime2(None),
            "datetimeoffset" => ColumnData::DateTimeOffset(None),
            "binary" | "varbinary" | "image" => ColumnData::Binary(None),
            _ => ColumnData::String(None),
        }
    }

    /// Convert a value to the wire representation this column expects.
    fn encode(&self, value: &SqlValue<'_>) -> Result<ColumnData<'static>> {
        if value.is_null() {
            return Ok(self.null());
        }
        let kind = self.kind();
        let value = match value {
            SqlValue::Text(_) => value.clone().coerce_to(kind)?,
            other if kind == ValueKind::String => SqlValue::text_owned(other.to_string()),
            other => other.clone().coerce_to(kind)?,
        };

        let data = match value {
            SqlValue::Bool(b) => ColumnData::Bit(Some(b)),
            SqlValue::U8(v) => ColumnData::U8(Some(v)),
            SqlValue::I16(v) => ColumnData::I16(Some(v)),
            SqlValue::I32(v) => ColumnData::I32(Some(v)),
            SqlValue::I64(v) => ColumnData::I64(Some(v)),
            SqlValue::F32(f) => ColumnData::F32(f.is_finite().then_some(f)),
            SqlValue::F64(f) => ColumnData::F64(f.is_finite().then_some(f)),
            SqlValue::Text(s) => ColumnData::String(Some(Cow::Owned(s.into_owned()))),
            SqlValue::Bytes(b) => ColumnData::Binary(Some(Cow::Owned(b.into_owned()))),
            SqlValue::Uuid(u) => ColumnData::Guid(Some(u)),
            SqlValue::Decimal(mut d) => {
                d.rescale(u32::from(self.scale));
                ColumnData::Numeric(Some(tiberius::numeric::Numeric::new_with_scale(
                    d.mantissa(),
                    d.scale() as u8,
                )))
            }
            SqlValue::DateTime(dt) => match self.sql_type.as_str() {
                "datetime" => ColumnData::DateTime(legacy_datetime(&dt)),
                "smalldatetime" => ColumnData::SmallDateTime(small_datetime(&dt)),
                _ => ColumnData::DateTime2(datetime2(&dt)),
            },
            SqlValue::DateTimeOffset(dto) => ColumnData::DateTimeOffset(datetime2(&dto.naive_utc()).map(|dt2| {
                let offset_minutes = (dto.offset().local_minus_utc() / 60) as i16;
                tiberius::time::DateTimeOffset::new(dt2, offset_minutes)
            })),
            SqlValue::Date(d) => ColumnData::Date(tds_date(&d)),
            SqlValue::Time(t) => ColumnData::Time(Some(tds_time(&t))),
            other => {
                return Err(BulkError::Metadata(format!(
                    "{:?} values cannot be sent to a {} column",
                    other.kind(),
                    self.sql_type
                )))
            }
        };
        Ok(data)
    }
}

fn tds_date(date: &NaiveDate) -> Option<tiberius::time::Date> {
    u32::try_from(date.num_days_from_ce() - 1)
        .ok()
        .map(tiberius::time::Date::new)
}

fn nanos_from_midnight(time: &NaiveTime) -> u64 {
    u64::from(time.num_seconds_from_midnight()) * 1_000_000_000 + u64::from(time.nanosecond())
}

fn tds_time(time: &NaiveTime) -> tiberius::time::Time {
    tiberius::time::Time::new(nanos_from_midnight(time) / 100, 7)
}

fn datetime2(dt: &NaiveDateTime) -> Option<tiberius::time::DateTime2> {
    tds_date(&dt.date()).map(|date| tiberius::time::DateTime2::new(date, tds_time(&dt.time())))
}

fn legacy_datetime(dt: &NaiveDateTime) -> Option<tiberius::time::DateTime> {
    let days = dt.date().num_days_from_ce() - DAYS_TO_1900 - 1;
    let ticks = (nanos_from_midnight(&dt.time()) * 3 + 5_000_000) / 10_000_000;
    let ticks = ticks.min(DATETIME_TICKS_PER_DAY - 1) as u32;
    Some(tiberius::time::DateTime::new(days, ticks))
}

fn small_datetime(dt: &NaiveDateTime) -> Option<tiberius::time::SmallDateTime> {
    let days = u16::try_from(dt.date().num_days_from_ce() - DAYS_TO_1900 - 1).ok()?;
    let minutes = (dt.time().num_seconds_from_midnight() / 60) as u16;
    Some(tiberius::time::SmallDateTime::new(days, minutes))
}

/// Box a value as a tiberius parameter. NULLs keep their type so the server
/// does not have to convert from `nvarchar`.
fn to_sql_param(value: &SqlValue<'_>) -> Box<dyn ToSql> {
    match value {
        SqlValue::Null(kind) => match kind {
            ValueKind::Bool => Box::new(Option::<bool>::None),
            ValueKind::U8 => Box::new(Option::<u8>::None),
            ValueKind::I8 | ValueKind::I16 => Box::new(Option::<i16>::None),
            ValueKind::U16 | ValueKind::I32 => Box::new(Option::<i32>::None),
            ValueKind::U32 | ValueKind::I64 => Box::new(Option::<i64>::None),
            ValueKind::F32 => Box::new(Option::<f32>::None),
            ValueKind::F64 => Box::new(Option::<f64>::None),
            ValueKind::String => Box::new(Option::<String>::None),
            ValueKind::Bytes => Box::new(Option::<Vec<u8>>::None),
            ValueKind::Uuid => Box::new(Option::<uuid::Uuid>::None),
            ValueKind::U64 | ValueKind::Decimal => Box::new(Option::<Decimal>::None),
            ValueKind::DateTime => Box::new(Option::<NaiveDateTime>::None),
            ValueKind::DateTimeOffset => Box::new(Option::<DateTime<FixedOffset>>::None),
            ValueKind::Date => Box::new(Option::<NaiveDate>::None),
            ValueKind::Time => Box::new(Option::<NaiveTime>::None),
        },
        SqlValue::Bool(b) => Box::new(*b),
        SqlValue::I8(i) => Box::new(i16::from(*i)),
        SqlValue::U8(i) => Box::new(*i),
        SqlValue::I16(i) => Box::new(*i),
        SqlValue::U16(i) => Box::new(i32::from(*i)),
        SqlValue::I32(i) => Box::new(*i),
        SqlValue::U32(i) => Box::new(i64::from(*i)),
        SqlValue::I64(i) => Box::new(*i),
        SqlValue::U64(i) => Box::new(Decimal::from(*i)),
        SqlValue::F32(f) => Box::new(*f),
        SqlValue::F64(f) => Box::new(*f),
        SqlValue::Text(s) => Box::new(s.to_string()),
        SqlValue::Bytes(b) => Box::new(b.to_vec()),
        SqlValue::Uuid(u) => Box::new(*u),
        SqlValue::Decimal(d) => Box::new(*d),
        SqlValue::DateTime(dt) => Box::new(*dt),
        SqlValue::DateTimeOffset(dto) => Box::new(*dto),
        SqlValue::Date(d) => Box::new(*d),
        SqlValue::Time(t) => Box::new(*t),
    }
}

/// Convert a result cell back into a [`SqlValue`].
fn column_data_to_value(data: ColumnData<'static>) -> Result<SqlValue<'static>> {
    let value = match &data {
        ColumnData::U8(v) => v.map_or(SqlValue::Null(ValueKind::U8), SqlValue::U8),
        ColumnData::I16(v) => v.map_or(SqlValue::Null(ValueKind::I16), SqlValue::I16),
        ColumnData::I32(v) => v.map_or(SqlValue::Null(ValueKind::I32), SqlValue::I32),
        ColumnData::I64(v) => v.map_or(SqlValue::Null(ValueKind::I64), SqlValue::I64),
        ColumnData::F32(v) => v.map_or(SqlValue::Null(ValueKind::F32), SqlValue::F32),
        ColumnData::F64(v) => v.map_or(SqlValue::Null(ValueKind::F64), SqlValue::F64),
        ColumnData::Bit(v) => v.map_or(SqlValue::Null(ValueKind::Bool), SqlValue::Bool),
        ColumnData::Guid(v) => v.map_or(SqlValue::Null(ValueKind::Uuid), SqlValue::Uuid),
        ColumnData::String(v) => v.as_ref().map_or(SqlValue::Null(ValueKind::String), |s| {
            SqlValue::text_owned(s.to_string())
        }),
        ColumnData::Binary(v) => v.as_ref().map_or(SqlValue::Null(ValueKind::Bytes), |b| {
            SqlValue::bytes_owned(b.to_vec())
        }),
        ColumnData::Numeric(v) => match v {
            Some(n) => Decimal::try_from_i128_with_scale(n.value(), u32::from(n.scale()))
                .map(SqlValue::Decimal)
                .map_err(|e| BulkError::Metadata(format!("numeric out of range: {}", e)))?,
            None => SqlValue::Null(ValueKind::Decimal),
        },
        ColumnData::Xml(v) => v.as_ref().map_or(SqlValue::Null(ValueKind::String), |x| {
            SqlValue::text_owned(x.as_ref().clone().into_string())
        }),
        ColumnData::Date(_) => NaiveDate::from_sql(&data)?
            .map_or(SqlValue::Null(ValueKind::Date), SqlValue::Date),
        ColumnData::Time(_) => NaiveTime::from_sql(&data)?
            .map_or(SqlValue::Null(ValueKind::Time), SqlValue::Time),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(&data)?
                .map_or(SqlValue::Null(ValueKind::DateTime), SqlValue::DateTime)
        }
        ColumnData::DateTimeOffset(_) => DateTime::<FixedOffset>::from_sql(&data)?
            .map_or(SqlValue::Null(ValueKind::DateTimeOffset), SqlValue::DateTimeOffset),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, sql_type: &str, scale: u8) -> DestinationColumn {
        DestinationColumn {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            scale,
        }
    }

    #[test]
    fn test_response_completed_only_for_fully_read_responses() {
        assert!(response_completed(&Ok(3u64)));

        let io = tiberius::error::Error::Io {
            kind: std::io::ErrorKind::ConnectionReset,
            message: "connection reset".into(),
        };
        assert!(!response_completed::<u64>(&Err(BulkError::from(io))));

        // a bulk send that failed half way never reaches the end of a response
        let send = BulkError::transfer("[dbo].[ItemTemp]", "bulk insert send: broken pipe");
        assert!(!response_completed::<u64>(&Err(send)));
        assert!(!response_completed::<u64>(&Err(BulkError::Cancelled)));
    }

    #[test]
    fn test_bind_positional_numbers_distinct_names() {
        let params = vec![
            SqlParameter::new("@__p_0", SqlValue::I32(5)),
            SqlParameter::new("@Name", "x".into()),
        ];
        let (sql, bound) = bind_positional(
            "UPDATE i SET [Name] = @Name WHERE [i].[Id] > @__p_0 AND [i].[Id] < @__p_0 + 10",
            &params,
        );
        assert_eq!(
            sql,
            "UPDATE i SET [Name] = @P1 WHERE [i].[Id] > @P2 AND [i].[Id] < @P2 + 10"
        );
        assert_eq!(bound.len(), 2);
        assert_eq!(bound[0].name, "@Name");
        assert_eq!(bound[1].name, "@__p_0");
    }

    #[test]
    fn test_bind_positional_skips_quotes_comments_and_system_variables() {
        let params = vec![SqlParameter::new("a", SqlValue::I32(1))];
        let (sql, bound) = bind_positional(
            "-- uses @a\nSELECT '@a', [@a], @@ROWCOUNT, @A, @unknown /* @a */",
            &params,
        );
        assert_eq!(
            sql,
            "-- uses @a\nSELECT '@a', [@a], @@ROWCOUNT, @P1, @unknown /* @a */"
        );
        assert_eq!(bound.len(), 1);
    }

    #[test]
    fn test_plan_columns_by_name() {
        let destination = vec![
            column("Id", "int", 0),
            column("Name", "nvarchar", 0),
            column("__bulk_ordinal", "int", 0),
        ];
        let plan = plan_columns(
            "[dbo].[ItemTemp]",
            &destination,
            ["name", "__bulk_ordinal"].into_iter(),
        )
        .unwrap();
        assert_eq!(plan, vec![None, Some(0), Some(1)]);

        let err = plan_columns("[dbo].[ItemTemp]", &destination, ["Missing"].into_iter())
            .unwrap_err();
        assert!(err.is_retryable_transport());
    }

    #[test]
    fn test_encode_follows_destination_type() {
        assert!(matches!(
            column("Id", "bigint", 0).encode(&SqlValue::I32(7)).unwrap(),
            ColumnData::I64(Some(7))
        ));
        assert!(matches!(
            column("Qty", "tinyint", 0).encode(&SqlValue::Null(ValueKind::I32)).unwrap(),
            ColumnData::U8(None)
        ));
        assert!(matches!(
            column("Code", "nvarchar", 0).encode(&SqlValue::I32(42)).unwrap(),
            ColumnData::String(Some(ref s)) if s == "42"
        ));
        assert!(matches!(
            column("Ratio", "float", 0).encode(&SqlValue::F64(f64::NAN)).unwrap(),
            ColumnData::F64(None)
        ));
        assert!(column("Id", "int", 0)
            .encode(&SqlValue::I64(i64::from(i32::MAX) + 1))
            .is_err());
    }

    #[test]
    fn test_encode_rescales_decimals() {
        let data = column("Price", "decimal", 2)
            .encode(&SqlValue::Decimal(Decimal::new(15, 1)))
            .unwrap();
        match data {
            ColumnData::Numeric(Some(n)) => {
                assert_eq!(n.value(), 150);
                assert_eq!(n.scale(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_encode_dates_per_column_type() {
        let dt = NaiveDate::from_ymd_opt(1900, 1, 2)
            .unwrap()
            .and_hms_opt(0, 0, 1)
            .unwrap();
        match column("At", "datetime", 0).encode(&SqlValue::DateTime(dt)).unwrap() {
            ColumnData::DateTime(Some(v)) => {
                assert_eq!(v.days(), 1);
                assert_eq!(v.seconds_fragments(), 300);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            column("At", "datetime2", 7).encode(&SqlValue::DateTime(dt)).unwrap(),
            ColumnData::DateTime2(Some(_))
        ));
        match column("On", "date", 0)
            .encode(&SqlValue::Date(NaiveDate::from_ymd_opt(1, 1, 2).unwrap()))
            .unwrap()
        {
            ColumnData::Date(Some(d)) => assert_eq!(d.days(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_column_data_round_trip_to_values() {
        assert_eq!(
            column_data_to_value(ColumnData::I32(Some(3))).unwrap(),
            SqlValue::I32(3)
        );
        assert_eq!(
            column_data_to_value(ColumnData::String(None)).unwrap(),
            SqlValue::Null(ValueKind::String)
        );
        assert_eq!(
            column_data_to_value(ColumnData::Numeric(Some(
                tiberius::numeric::Numeric::new_with_scale(1234, 2)
            )))
            .unwrap(),
            SqlValue::Decimal(Decimal::new(1234, 2))
        );
    }
}
