//! # sorng-ftp-engine – concurrent FTP operation engine
//!
//! Architecture:
//! - `types` – configuration, queue items, statuses, prompts
//! - `error` – categorised FTP error type
//! - `config` – JSON and URL loading for the configuration types
//! - `epoch` – stale-completion guards for transports, timers and disk work
//! - `events` – actions and events between state machines and their host
//! - `protocol` – reply framing, PASV/PORT/257 helpers
//! - `parser` – Unix/Windows/MLSD LIST response parsing
//! - `proxy_script` – firewall login scripts
//! - `proxy` – SOCKS and HTTP CONNECT tunnels
//! - `tls` – FTPS handshakes and the accepted-certificate list
//! - `disk` – background disk worker
//! - `queue` – shared operation queue
//! - `control` – control connection state machine
//! - `worker` – per-connection item executor
//! - `pool` – worker pool and work distribution
//! - `reactor` – tokio event loop running the pool
//! - `session` – single control channel for one-shot commands

pub mod types;
pub mod error;
pub mod config;
pub mod epoch;
pub mod events;
pub mod protocol;
pub mod parser;
pub mod proxy_script;
pub mod proxy;
pub mod tls;
pub mod disk;
pub mod queue;
pub mod control;
pub mod worker;
pub mod pool;
pub mod reactor;
pub mod session;

// Re-exports for lib.rs consumers
pub use types::*;
pub use error::{DiskProblemKind, FtpError, FtpErrorKind, FtpResult};
pub use control::{ConnEvent, ConnState, ControlConnection};
pub use disk::{DiskWorker, DiskWork, DiskResult};
pub use events::{Action, WorkerEvent};
pub use pool::{Offer, WorkerPool, WorkerTarget};
pub use queue::{LocalTarget, OperationQueue, QueueCounts, QueueItem};
pub use reactor::{Reactor, ReactorHandle};
pub use session::ControlSession;
pub use tls::{CertificateCache, TlsContext};
pub use worker::{Worker, WorkerError, WorkerState};
