//! Pluggable sinks for the trace pipeline.
//!
//! Local sinks (console, file, statistics) and the fan-out exporter consume
//! completed traces from the correlator; the OTLP emitter additionally
//! supports stream-through mode, emitting each span to the downstream
//! backend as soon as both endpoints are known while preserving the
//! upstream-generated trace and span identifiers byte-for-byte.

pub mod console;
pub mod error;
pub mod file;
pub mod multi;
pub mod otlp;
pub mod stats;
pub mod stream_through;

pub use console::ConsoleExporter;
pub use error::ExportError;
pub use file::FileExporter;
pub use multi::MultiExporter;
pub use otlp::{OtlpConfig, OtlpExporter, OtlpProtocol};
pub use stats::{StatsExporter, StatsSnapshot};
pub use stream_through::StreamThroughProcessor;
