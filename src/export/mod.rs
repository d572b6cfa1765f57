//! Run-time observability for the pipeline.

pub mod metrics;

pub use metrics::PipelineMetrics;
