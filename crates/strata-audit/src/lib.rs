//! Strata Audit Sinks
//!
//! Implementations of the `AuditSink` contract from `strata-core`:
//! - `AuditRecorder`: non-blocking sink that batches events to one or more writers
//! - `JsonlAuditWriter`: append-only JSONL files, partitioned by date and tenant
//! - `TracingAuditWriter`: structured log lines on the `audit` target

pub mod jsonl_writer;
pub mod recorder;
pub mod tracing_writer;
pub mod writer;

pub use jsonl_writer::JsonlAuditWriter;
pub use recorder::{AuditRecorder, RecorderBuilder, RecorderConfig};
pub use tracing_writer::TracingAuditWriter;
pub use writer::{AuditWriter, WriterError, WriterResult};
