//! # regionjoin
//!
//! A streaming join of location events against replicated geofence
//! definitions. Every location event is annotated with the region its
//! coordinate falls in, using the definition of its location key; events for
//! keys with no definition yet wait in a bounded, TTL-limited buffer.
//!
//! ## Architecture
//!
//! ```text
//! Event Source ──────────┐                    ┌──> worker 0 ──┐
//!   (location|watermark) ├──> dispatcher ─────┼──> worker 1 ──┼──> Output Sink
//! Reference-Data Source ─┘   route by key,    └──> worker N ──┘      (region events,
//!   (changelog)              broadcast updates   replica + buffer     dropped reports)
//!                                                     │
//!                                      checkpoint barriers ──> CheckpointStore
//! ```
//!
//! ## Modules
//!
//! - [`geohash`], [`matcher`]: coordinate encoding and point-in-region tests
//! - [`event`], [`reference`]: wire records of both sources and the output
//! - [`replica`], [`buffer`], [`watermark`], [`processor`]: per-worker join state
//! - [`router`], [`worker`], [`engine`]: partitioned execution and supervision
//! - [`source`], [`sink`], [`checkpoint`]: adapters for streams and durable state

pub mod buffer;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod engine;
pub mod event;
pub mod geohash;
pub mod matcher;
pub mod metrics;
pub mod processor;
pub mod reference;
pub mod replica;
pub mod router;
pub mod shutdown;
pub mod sink;
pub mod source;
pub mod watermark;
pub mod worker;

// Re-export commonly used types at crate root
pub use engine::{Engine, EngineConfig, EngineError, EngineIo, EngineReport};
pub use event::{LocationEvent, RegionEvent, SourceEvent};
pub use processor::{JoinProcessor, ProcessOutcome, ProcessorConfig};
pub use reference::{ReferenceUpdate, RegionDefinition};
pub use sink::OutputSink;
pub use source::RecordSource;
