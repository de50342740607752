//! Process-wide metrics and tracing span helpers.
//!
//! `METRICS` is an OpenTelemetry meter exported through a Prometheus registry;
//! [`EngineMetrics::render`] returns the text exposition format.

#[cfg(feature = "metrics")]
pub use self::prom::{EngineMetrics, METRICS};

#[cfg(feature = "metrics")]
mod prom {
    use once_cell::sync::Lazy;
    use opentelemetry::metrics::{Counter, Histogram, MeterProvider};
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Encoder, Registry, TextEncoder};
    use std::time::Duration;

    pub static METRICS: Lazy<EngineMetrics> = Lazy::new(EngineMetrics::init);

    pub struct EngineMetrics {
        registry: Registry,
        _provider: SdkMeterProvider,
        queries_total: Counter<u64>,
        query_errors_total: Counter<u64>,
        query_duration: Histogram<f64>,
        connection_wait: Histogram<f64>,
        rows_synced: Counter<u64>,
        rows_failed: Counter<u64>,
        tables_failed: Counter<u64>,
        type_fallbacks: Counter<u64>,
        decode_failures: Counter<u64>,
        sync_run_duration: Histogram<f64>,
        dispatch_recomputations: Counter<u64>,
        corrections: Counter<u64>,
    }

    impl EngineMetrics {
        pub fn init() -> Self {
            let registry = Registry::new();
            let provider = match opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
            {
                Ok(exporter) => SdkMeterProvider::builder().with_reader(exporter).build(),
                Err(e) => {
                    log::warn!("prometheus exporter unavailable, metrics will not be exported: {e}");
                    SdkMeterProvider::builder().build()
                }
            };
            let meter = provider.meter("shopfloor");

            Self {
                queries_total: meter
                    .u64_counter("shopfloor_queries_total")
                    .with_description("Local database statements executed")
                    .build(),
                query_errors_total: meter
                    .u64_counter("shopfloor_query_errors_total")
                    .with_description("Local database statements that failed")
                    .build(),
                query_duration: meter
                    .f64_histogram("shopfloor_query_duration_seconds")
                    .with_description("Duration of local database statements")
                    .build(),
                connection_wait: meter
                    .f64_histogram("shopfloor_connection_wait_seconds")
                    .with_description("Time spent opening local connections")
                    .build(),
                rows_synced: meter
                    .u64_counter("shopfloor_sync_rows_total")
                    .with_description("Rows written to tenant replicas")
                    .build(),
                rows_failed: meter
                    .u64_counter("shopfloor_sync_rows_failed_total")
                    .with_description("Rows skipped because of decode or write failures")
                    .build(),
                tables_failed: meter
                    .u64_counter("shopfloor_sync_tables_failed_total")
                    .with_description("Tables that failed within a sync run")
                    .build(),
                type_fallbacks: meter
                    .u64_counter("shopfloor_type_fallbacks_total")
                    .with_description("Upstream columns mapped to unbounded text by fallback")
                    .build(),
                decode_failures: meter
                    .u64_counter("shopfloor_row_decode_failures_total")
                    .with_description("Upstream rows that could not be decoded")
                    .build(),
                sync_run_duration: meter
                    .f64_histogram("shopfloor_sync_run_duration_seconds")
                    .with_description("Wall time of a tenant sync run")
                    .build(),
                dispatch_recomputations: meter
                    .u64_counter("shopfloor_dispatch_recomputations_total")
                    .with_description("Dispatch statistics recomputations")
                    .build(),
                corrections: meter
                    .u64_counter("shopfloor_corrections_total")
                    .with_description("Reports rewritten by consistency correctors")
                    .build(),
                registry,
                _provider: provider,
            }
        }

        pub fn record_query_duration(&self, elapsed: Duration) {
            self.queries_total.add(1, &[]);
            self.query_duration.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_query_error(&self) {
            self.query_errors_total.add(1, &[]);
        }

        pub fn record_connection_wait(&self, elapsed: Duration) {
            self.connection_wait.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_rows(&self, tenant: &str, succeeded: u64, failed: u64) {
            let labels = [KeyValue::new("tenant", tenant.to_string())];
            self.rows_synced.add(succeeded, &labels);
            self.rows_failed.add(failed, &labels);
        }

        pub fn record_table_failure(&self, tenant: &str) {
            self.tables_failed.add(1, &[KeyValue::new("tenant", tenant.to_string())]);
        }

        pub fn record_type_fallback(&self, source_type: &str) {
            self.type_fallbacks
                .add(1, &[KeyValue::new("source_type", source_type.to_string())]);
        }

        pub fn record_decode_failure(&self) {
            self.decode_failures.add(1, &[]);
        }

        pub fn record_sync_run(&self, tenant: &str, mode: &'static str, elapsed: Duration) {
            self.sync_run_duration.record(
                elapsed.as_secs_f64(),
                &[
                    KeyValue::new("tenant", tenant.to_string()),
                    KeyValue::new("mode", mode),
                ],
            );
        }

        pub fn record_recomputation(&self, outcome: &'static str) {
            self.dispatch_recomputations
                .add(1, &[KeyValue::new("outcome", outcome)]);
        }

        pub fn record_corrections(&self, kind: &'static str, count: u64) {
            self.corrections.add(count, &[KeyValue::new("kind", kind)]);
        }

        /// Prometheus text exposition of everything recorded so far.
        pub fn render(&self) -> String {
            let mut buffer = Vec::new();
            if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
                log::warn!("failed to encode metrics: {e}");
            }
            String::from_utf8_lossy(&buffer).into_owned()
        }
    }
}

/// Span constructors shared by the executor, transactions and services.
#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    pub fn execute_query_span(query: &str) -> Span {
        let statement: String = query.chars().take(120).collect();
        info_span!("shopfloor.query", db.statement = %statement)
    }

    pub fn acquire_connection_span() -> Span {
        info_span!("shopfloor.connect")
    }

    pub fn begin_transaction_span() -> Span {
        info_span!("shopfloor.transaction.begin")
    }

    pub fn commit_transaction_span() -> Span {
        info_span!("shopfloor.transaction.commit")
    }

    pub fn rollback_transaction_span() -> Span {
        info_span!("shopfloor.transaction.rollback")
    }

    pub fn sync_run_span(tenant: &str, mode: &str) -> Span {
        info_span!("shopfloor.sync.run", tenant = %tenant, mode = %mode)
    }

    pub fn sync_table_span(tenant: &str, table: &str) -> Span {
        info_span!("shopfloor.sync.table", tenant = %tenant, table = %table)
    }

    pub fn recompute_span(dispatch_id: i64) -> Span {
        info_span!("shopfloor.dispatch.recompute", dispatch_id)
    }

    pub fn consistency_span(kind: &str) -> Span {
        info_span!("shopfloor.consistency", kind = %kind)
    }

    pub fn work_order_rollback_span(completed_id: i64) -> Span {
        info_span!("shopfloor.work_order.rollback", completed_id)
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_recording_does_not_panic() {
        METRICS.record_query_duration(Duration::from_millis(3));
        METRICS.record_query_error();
        METRICS.record_rows("10", 5, 1);
        METRICS.record_type_fallback("sql_variant");
        METRICS.record_recomputation("updated");
        let _ = METRICS.render();
    }
}
