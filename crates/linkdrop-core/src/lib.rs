//! # Linkdrop Core Library
//!
//! `linkdrop-core` is the data plane of a peer-to-peer session: a chunked,
//! resumable, checksum-verified file transfer engine with flow control, and
//! the connection state machine that gates when it may run.
//!
//! ## Features
//!
//! - **Chunked transfers**: fixed-size chunk packets with a per-chunk CRC32
//! - **End-to-end verification**: whole-file running CRC32 compared on completion
//! - **Resume**: receivers with a partial file ask the sender to skip ahead
//! - **Backpressure**: every chunk waits for the channel's buffered amount
//!   to fall under a low-water mark
//! - **Recovery**: corrupted or missing chunks are NACKed and retransmitted
//!
//! ## Modules
//!
//! - [`channel`] - Ordered message channel, in-memory link and TCP adapter
//! - [`checksum`] - Table-driven CRC32, single-shot and running
//! - [`config`] - Configuration management
//! - [`connection`] - Connection state machine and monitor
//! - [`events`] - Event sink and queue-until-ready dispatcher
//! - [`history`] - Transfer history persistence
//! - [`protocol`] - Chunk packet codec and JSON control messages
//! - [`session`] - Single-owner event loop tying everything together
//! - [`storage`] - Transfer sources and destination sinks
//! - [`transfer`] - Send/receive pipelines and the transfer coordinator
//!
//! ## Example
//!
//! ```rust,ignore
//! use linkdrop_core::channel::memory::MemoryLink;
//! use linkdrop_core::session::{Session, SessionConfig};
//! use linkdrop_core::storage::MemoryOnlyProvider;
//!
//! let (a, b) = MemoryLink::new(512 * 1024).connect();
//! let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
//! let sender = Session::spawn(a, SessionConfig::default(), Arc::new(MemoryOnlyProvider), events_tx);
//! sender.consumer_ready().await?;
//! let id = sender.send_file("report.pdf").await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::len_without_is_empty)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

use std::time::Duration;

pub mod channel;
pub mod checksum;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod history;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod transfer;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Envelope version for stream transports
pub const PROTOCOL_VERSION: (u8, u8) = (1, 0);

/// Default TCP port for the stream transport
pub const DEFAULT_TCP_PORT: u16 = 52530;

/// Default chunk size for file transfers (64 KiB)
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

/// Default low-water mark for the channel's buffered amount (512 KiB)
pub const DEFAULT_BUFFERED_AMOUNT_LOW: usize = 512 * 1024;

/// How long a sender waits for `file-accept` before starting anyway
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_millis(500);

/// How long callers wait for candidate gathering to complete
pub const DEFAULT_GATHERING_TIMEOUT: Duration = Duration::from_secs(10);

/// How long callers wait for the data channel to open
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default capacity of the pending event queue
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;
