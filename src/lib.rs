//! Postprocessing pipeline for device performance traces.
//!
//! Raw per-thread cycle-counter dumps are drained from device scratch
//! buffers (or read from a textual dump), decoded into thread records,
//! assembled into per-core and per-epoch records and turned into JSON, CSV
//! and plain-text reports.

/// Log a data-quality warning, demoted to `debug!` when warnings are suppressed.
#[macro_export]
macro_rules! perf_warn {
    ($quiet:expr, $($arg:tt)+) => {
        if $quiet {
            tracing::debug!($($arg)+)
        } else {
            tracing::warn!($($arg)+)
        }
    };
}

pub mod aggregator;
pub mod clock;
pub mod config;
pub mod device;
pub mod export;
pub mod host;
pub mod offline;
pub mod pipeline;
pub mod poller;
pub mod record;
pub mod report;
pub mod state;
