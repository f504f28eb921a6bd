use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotcap_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotcap_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotcap_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotcap_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotcap_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotcap_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotcap_wal_flush_batch_size";

// ── Provisioning ────────────────────────────────────────────────

/// Counter: provisioning passes, manual and scheduled. Labels: status.
pub const PROVISION_RUNS_TOTAL: &str = "slotcap_provision_runs_total";

/// Counter: override rows written by provisioning.
pub const PROVISION_ROWS_INSERTED_TOTAL: &str = "slotcap_provision_rows_inserted_total";

/// Counter: provisioning inserts lost to a concurrent writer.
pub const PROVISION_ROWS_CONFLICTED_TOTAL: &str = "slotcap_provision_rows_conflicted_total";

/// Gauge: 1 while the provisioning scheduler is armed.
pub const SCHEDULER_ACTIVE: &str = "slotcap_scheduler_active";

#[derive(Debug)]
pub struct MetricsInitError(String);

impl std::fmt::Display for MetricsInitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to install Prometheus metrics exporter: {}", self.0)
    }
}

impl std::error::Error for MetricsInitError {}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), MetricsInitError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsInitError(e.to_string()))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectDefaults => "select_defaults",
        Command::SelectDateLimits { .. } => "select_date_limits",
        Command::SelectSchedulerStatus => "select_scheduler_status",
        Command::InsertDefaults { .. } => "insert_defaults",
        Command::UpdateDefault { .. } => "update_default",
        Command::InsertDateLimits { .. } => "insert_date_limits",
        Command::UpdateDateLimit { .. } => "update_date_limit",
        Command::Provision { .. } => "provision",
        Command::SchedulerStart => "scheduler_start",
        Command::SchedulerStop => "scheduler_stop",
    }
}
