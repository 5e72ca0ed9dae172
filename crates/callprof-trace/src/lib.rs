//! In-process call tracing for callprof.
//!
//! Instrumented code reports function entry and exit to a [`Collector`]. The
//! collector keeps a shadow stack per thread and turns each completed call
//! into a delta that the [`Aggregator`] folds into per-function statistics:
//! call counts, inclusive and exclusive time, maximum call time and maximum
//! recursion depth, plus caller/callee relations.
//!
//! A [`Session`] streams snapshots of those statistics to a consumer (the
//! `callprof` binary) over a [`Channel`], either periodically or on request.
//!
//! # Usage
//!
//! ```rust,ignore
//! use callprof_trace::{Collector, Session};
//! use std::sync::Arc;
//!
//! let collector = Arc::new(Collector::with_defaults());
//! let session = Session::connect_from_env(Arc::clone(&collector))?;
//! session.install_termination_hook(&callprof_trace::AtExitHook);
//!
//! fn work(collector: &Collector) {
//!     let _call = collector.scope(work as usize as u64);
//!     // ...
//! }
//! ```
//!
//! Start the consumer first, then point the target at its socket:
//! ```bash
//! callprof record --socket /tmp/callprof.sock &
//! CALLPROF_SOCKET=/tmp/callprof.sock ./target/release/my-app
//! ```
//!
//! Addresses are opaque to this crate. Any stable `u64` per function works;
//! function pointers are the usual choice.

pub mod aggregator;
pub mod clock;
pub mod codec;
pub mod collector;
pub mod config;
pub mod diagnostics;
pub mod hook;
pub mod notify;
pub mod protocol;
pub mod session;
pub mod stats;
pub mod transport;

pub use aggregator::{Aggregator, Cleared};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use codec::{
    DecodeError, EncodeError, decode_into, decode_snapshot, encode_limited, encode_snapshot,
    merge_checked,
};
pub use collector::{CallGuard, Collector, CollectorConfig};
pub use config::{DeliveryPolicy, HarvestMode, SessionConfig};
pub use diagnostics::{Diagnostics, DiagnosticsSnapshot};
pub use hook::{AtExitHook, ManualHook, TerminationHook};
pub use notify::{Subscribers, Subscription};
pub use protocol::{Message, PROTOCOL_VERSION, ProcessInfo};
pub use session::{Session, SessionError, SessionState};
pub use stats::{
    Address, CallDelta, CalleeMap, CallerMap, DetailedStatistics, FunctionStatistics,
    StatisticsSnapshot,
};
pub use transport::{Channel, MemoryChannel, TransportError, UnixChannel};
