//! procstats-core — shared accounting engine behind the process/package
//! runtime statistics accumulator.
//!
//! Provides:
//! - `state` — composite state-key encoding (process lifecycle × mem factor)
//! - `pool` — `LongPool`/`PackedOffset`, the packed sparse long storage
//! - `sparse` — `SparseStateTable`, the per-record sparse accumulator index
//! - `process` — `ProcessRecord`, per-process lifecycle and PSS accounting
//! - `service` — `ServiceRecord`/`ServiceMode`, per-service mode accounting
//! - `registry` — `PackageRegistry`, the common-vs-per-package ownership model
//! - `global` — `GlobalState`, the top-level owner of all of the above
//! - `codec` — the versioned binary wire format
//! - `persist` — atomic on-disk persistence

pub mod codec;
pub mod global;
pub mod persist;
pub mod pool;
pub mod process;
pub mod registry;
pub mod service;
pub mod sparse;
pub mod state;

pub use codec::{decode, encode};
pub use global::GlobalState;
pub use persist::Persistor;
pub use process::{ProcessId, ProcessRecord};
pub use registry::{PackageRecord, PackageRegistry, ProcessSlot};
pub use service::{ServiceMode, ServiceRecord};
pub use state::{MemFactor, ProcState};
