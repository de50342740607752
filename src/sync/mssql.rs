//! Upstream sessions over tiberius.
//!
//! tiberius is async; each session owns a current-thread tokio runtime and
//! blocks on it, so sync runs stay plain sequential code on their own thread.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use tiberius::{AuthMethod, Client, ColumnData, Config, FromSql, Row};
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Runtime};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::config::UpstreamConfig;
use crate::sync::codec::{UpstreamRow, UpstreamValue};
use crate::sync::types::UpstreamColumn;
use crate::sync::upstream::{
    changes_sql, select_all_sql, UpstreamConnector, UpstreamError, UpstreamSession, COLUMNS_SQL,
    CURRENT_VERSION_SQL, MIN_VALID_VERSION_SQL,
};
use crate::tenant::UpstreamCredential;

/// Connects to the upstream server named in the registry credential.
pub struct MssqlConnector {
    settings: UpstreamConfig,
}

impl MssqlConnector {
    pub fn new(settings: UpstreamConfig) -> Self {
        Self { settings }
    }
}

/// Split `host` or `host,port` as written in the registry.
fn split_host(server: &str, default_port: u16) -> (String, u16) {
    match server.split_once(',') {
        Some((host, port)) => (
            host.trim().to_string(),
            port.trim().parse().unwrap_or(default_port),
        ),
        None => (server.trim().to_string(), default_port),
    }
}

impl UpstreamConnector for MssqlConnector {
    fn connect(
        &self,
        credential: &UpstreamCredential,
        database: &str,
    ) -> Result<Box<dyn UpstreamSession>, UpstreamError> {
        let runtime = Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|e| UpstreamError::Connect(format!("runtime: {e}")))?;

        let (host, port) = split_host(&credential.host, self.settings.port);
        let mut config = Config::new();
        config.host(&host);
        config.port(port);
        config.database(database);
        config.authentication(AuthMethod::sql_server(&credential.user, &credential.password));
        if self.settings.trust_cert {
            config.trust_cert();
        }

        let timeout = self.settings.handshake_timeout();
        let client = runtime.block_on(async {
            tokio::time::timeout(timeout, open(config))
                .await
                .map_err(|_| UpstreamError::Connect(format!("handshake timed out after {timeout:?}")))?
        })?;

        log::debug!("connected to upstream {host}:{port}/{database}");
        Ok(Box::new(MssqlSession { runtime, client }))
    }
}

async fn open(config: Config) -> Result<Client<Compat<TcpStream>>, UpstreamError> {
    let tcp = TcpStream::connect(config.get_addr())
        .await
        .map_err(|e| UpstreamError::Connect(e.to_string()))?;
    tcp.set_nodelay(true)
        .map_err(|e| UpstreamError::Connect(e.to_string()))?;
    Client::connect(config, tcp.compat_write())
        .await
        .map_err(|e| UpstreamError::Connect(e.to_string()))
}

pub struct MssqlSession {
    runtime: Runtime,
    client: Client<Compat<TcpStream>>,
}

fn query_error(e: tiberius::error::Error) -> UpstreamError {
    UpstreamError::Query(e.to_string())
}

impl MssqlSession {
    fn query_rows(&mut self, sql: &str, params: &[&dyn tiberius::ToSql]) -> Result<Vec<Row>, UpstreamError> {
        let MssqlSession { runtime, client } = self;
        runtime.block_on(async {
            let stream = client.query(sql, params).await.map_err(query_error)?;
            stream.into_first_result().await.map_err(query_error)
        })
    }
}

fn convert<'a, T: FromSql<'a>>(data: &'a ColumnData<'static>) -> Result<Option<T>, UpstreamError> {
    T::from_sql(data).map_err(|e| UpstreamError::Unsupported(e.to_string()))
}

fn to_upstream_value(data: ColumnData<'static>) -> Result<UpstreamValue, UpstreamError> {
    use UpstreamValue as U;

    let value = match &data {
        ColumnData::U8(v) => v.map(U::U8),
        ColumnData::I16(v) => v.map(U::I16),
        ColumnData::I32(v) => v.map(U::I32),
        ColumnData::I64(v) => v.map(U::I64),
        ColumnData::F32(v) => v.map(U::F32),
        ColumnData::F64(v) => v.map(U::F64),
        ColumnData::Bit(v) => v.map(U::Bool),
        ColumnData::String(v) => v.as_ref().map(|s| U::Text(s.to_string())),
        ColumnData::Guid(v) => v.map(U::Uuid),
        ColumnData::Binary(v) => v.as_ref().map(|b| U::Bytes(b.to_vec())),
        ColumnData::Numeric(_) => convert::<Decimal>(&data)?.map(U::Decimal),
        ColumnData::Xml(v) => v.as_ref().map(|x| U::Text(x.to_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            convert::<NaiveDateTime>(&data)?.map(U::Timestamp)
        }
        ColumnData::DateTimeOffset(_) => convert::<DateTime<Utc>>(&data)?.map(|t| U::Timestamp(t.naive_utc())),
        ColumnData::Date(_) => convert::<NaiveDate>(&data)?.map(U::Date),
        ColumnData::Time(_) => convert::<NaiveTime>(&data)?.map(U::Time),
    };
    Ok(value.unwrap_or(U::Null))
}

fn to_upstream_row(row: Row) -> Result<UpstreamRow, UpstreamError> {
    row.into_iter()
        .map(to_upstream_value)
        .collect::<Result<Vec<_>, _>>()
        .map(UpstreamRow::new)
}

fn text(row: &Row, idx: usize) -> Result<Option<String>, UpstreamError> {
    row.try_get::<&str, usize>(idx)
        .map(|v| v.map(str::to_string))
        .map_err(query_error)
}

impl UpstreamSession for MssqlSession {
    fn current_version(&mut self) -> Result<Option<i64>, UpstreamError> {
        let rows = self.query_rows(CURRENT_VERSION_SQL, &[])?;
        match rows.first() {
            Some(row) => row.try_get::<i64, usize>(0).map_err(query_error),
            None => Ok(None),
        }
    }

    fn min_valid_version(&mut self, table: &str) -> Result<Option<i64>, UpstreamError> {
        let rows = self.query_rows(MIN_VALID_VERSION_SQL, &[&table])?;
        match rows.first() {
            Some(row) => row.try_get::<i64, usize>(0).map_err(query_error),
            None => Ok(None),
        }
    }

    fn columns(&mut self, table: &str) -> Result<Vec<UpstreamColumn>, UpstreamError> {
        let rows = self.query_rows(COLUMNS_SQL, &[&table])?;
        rows.iter()
            .map(|row| {
                Ok(UpstreamColumn {
                    name: text(row, 0)?.unwrap_or_default(),
                    data_type: text(row, 1)?.unwrap_or_default(),
                    max_length: row.try_get::<i32, usize>(2).map_err(query_error)?,
                    precision: row.try_get::<u8, usize>(3).map_err(query_error)?,
                    scale: row.try_get::<i32, usize>(4).map_err(query_error)?,
                })
            })
            .collect()
    }

    fn select_all(&mut self, table: &str, columns: &[UpstreamColumn]) -> Result<Vec<UpstreamRow>, UpstreamError> {
        self.query_rows(&select_all_sql(table, columns), &[])?
            .into_iter()
            .map(to_upstream_row)
            .collect()
    }

    fn select_changed(
        &mut self,
        table: &str,
        columns: &[UpstreamColumn],
        key: &[String],
        from_version: i64,
    ) -> Result<Vec<UpstreamRow>, UpstreamError> {
        self.query_rows(&changes_sql(table, columns, key), &[&from_version])?
            .into_iter()
            .map(to_upstream_row)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host() {
        assert_eq!(split_host("erp.local", 1433), ("erp.local".to_string(), 1433));
        assert_eq!(split_host("10.1.1.5, 14330", 1433), ("10.1.1.5".to_string(), 14330));
        assert_eq!(split_host("erp.local,abc", 1433), ("erp.local".to_string(), 1433));
    }

    #[test]
    fn test_column_data_conversion() {
        assert_eq!(to_upstream_value(ColumnData::I32(Some(7))).unwrap(), UpstreamValue::I32(7));
        assert_eq!(to_upstream_value(ColumnData::I32(None)).unwrap(), UpstreamValue::Null);
        assert_eq!(
            to_upstream_value(ColumnData::String(Some("C001".into()))).unwrap(),
            UpstreamValue::Text("C001".to_string())
        );
        assert_eq!(
            to_upstream_value(ColumnData::Binary(Some(vec![1u8, 2].into()))).unwrap(),
            UpstreamValue::Bytes(vec![1, 2])
        );
    }
}
