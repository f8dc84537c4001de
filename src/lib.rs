//! Resumable concurrent batch captioning of sharded audio datasets.
//!
//! Clips live in large `arkive_<n>.bin` shard files described by a
//! `metadata.parquet` table.  A pool of async workers fetches clips from
//! memory-mapped shards, sends them to an OpenAI-compatible endpoint and
//! appends one JSON line per attempt to a durable ledger.  Restarting a job
//! replays the ledger and only dispatches ids that are neither done nor out
//! of retries.
//!
//! # Modules
//!
//! * [`config`]   job file (`job.toml`), defaults and validation
//! * [`store`]    metadata index and memory-mapped shard store
//! * [`audio`]    MIME sniffing, data URLs, duration probing
//! * [`client`]   captioning endpoint and queue-depth throttling
//! * [`ledger`]   ledger lines, resume replay, writer, merge and summary
//! * [`pipeline`] worker pool, throughput tracking and run reports

pub mod audio;
pub mod client;
pub mod config;
pub mod ledger;
pub mod pipeline;
pub mod store;
