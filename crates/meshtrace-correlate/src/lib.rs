//! Correlation of time-ordered span events into completed traces.
//!
//! Events are buffered per trace id, tolerant of out-of-order arrival, and
//! emitted as a single [`meshtrace_types::CompletedTrace`] once the trace
//! goes quiet with every span closed, or force-finalized when the abandon
//! timeout expires. Recent completed traces are cached in a bounded store
//! for the read-back surface.

pub mod builder;
pub mod correlator;
pub mod store;

pub use builder::TraceBuilder;
pub use correlator::{CorrelatorConfig, CorrelatorStats, TraceCorrelator};
pub use store::{SearchCriteria, TraceStore};
