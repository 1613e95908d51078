//! Observability module for Tessera.
//!
//! Provides logging initialisation and metric helpers. Installing a metrics
//! recorder is left to the embedding process; without one the helpers are
//! no-ops.

use crate::config::ObservabilityConfig;
use crate::error::{Result, TesseraError};
use ::tracing::info;
use metrics::{counter, gauge};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| TesseraError::Config(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| TesseraError::Config(format!("Failed to init logging: {}", e)))?;
    }

    info!(metrics = config.metrics_enabled, "Observability initialized");
    Ok(())
}

/// Register standard metrics at zero.
pub fn register_metrics() {
    counter!("tessera_export_ops_total").absolute(0);
    counter!("tessera_handle_cache_misses_total").absolute(0);
    counter!("tessera_transactions_total").absolute(0);
    counter!("tessera_transaction_blocks_total").absolute(0);
    counter!("tessera_admin_commands_total").absolute(0);
    gauge!("tessera_locks_total").set(0.0);
    gauge!("tessera_locks_held").set(0.0);
}

/// Record an export (file-handle) operation.
pub fn record_export_op(kind: &str) {
    counter!("tessera_export_ops_total", "kind" => kind.to_string()).increment(1);
}

/// Record a handle resolution that had to read the object from disk.
pub fn record_handle_miss() {
    counter!("tessera_handle_cache_misses_total").increment(1);
}

/// Record a committed transaction.
pub fn record_transaction(blocks: u32) {
    counter!("tessera_transactions_total").increment(1);
    counter!("tessera_transaction_blocks_total").increment(blocks as u64);
}

/// Record an administrative command.
pub fn record_admin_command(command: &str, ok: bool) {
    counter!(
        "tessera_admin_commands_total",
        "command" => command.to_string(),
        "result" => if ok { "ok" } else { "error" }
    )
    .increment(1);
}

/// Update lock table gauges.
pub fn update_lock_gauges(total: usize, held: usize) {
    gauge!("tessera_locks_total").set(total as f64);
    gauge!("tessera_locks_held").set(held as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_without_recorder() {
        register_metrics();
        record_export_op("fh_to_dentry");
        record_handle_miss();
        record_transaction(3);
        record_admin_command("get_tune", true);
        update_lock_gauges(4, 2);
    }
}
