//! # NetCap
//!
//! A sharded, batched capture pipeline for high-rate network events.
//!
//! Decoded packets are turned into CSV records, spread round-robin across a
//! fixed number of shards, flushed to per-shard files on a timer, and
//! periodically consolidated into a single merged file for downstream analysis.
//!
//! ```no_run
//! use std::sync::Arc;
//! use netcap_rs::{LocalHost, LocalPacketSource, Pipeline, PipelineConfig};
//!
//! # fn main() -> netcap_rs::Result<()> {
//! let source = Arc::new(LocalPacketSource::new(2)?);
//! let pipeline = Pipeline::new(PipelineConfig::default(), Arc::new(LocalHost::new()), source.clone());
//!
//! pipeline.start()?;
//! // source.submit_frame(&frame)?;
//! pipeline.stop();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod host;
pub mod merge;
pub mod metrics;
pub mod packet;
pub mod pipeline;
pub mod record;
pub mod scheduler;
pub mod shard;

pub use config::PipelineConfig;
pub use error::{Error, MergeStage, Result};
pub use host::{
    ApplicationId, HostServices, LocalHost, LocalPacketSource, PacketProcessor, PacketSource, ProcessorId,
    TrafficSelector,
};
pub use merge::{MergeCoordinator, MergeReport};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use packet::{DecodedPacket, Ipv4Summary, TransportHeader};
pub use pipeline::{LifecycleState, Pipeline, PipelineStats};
pub use record::{PacketRecord, Protocol, RecordBuilder, StreamCounters, CSV_HEADER};
pub use scheduler::Scheduler;
pub use shard::{shard_index, Admission, FlushOutcome, ShardId, ShardManager, ShardRouter};
