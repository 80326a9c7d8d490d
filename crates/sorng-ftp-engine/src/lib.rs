//! # SortOfRemote NG – FTP Transfer Engine
//!
//! Runs queued FTP/FTPS operations (uploads, downloads, recursive copies,
//! moves, deletes, attribute changes) over several concurrent logged-in
//! connections.
//!
//! ## Features
//!
//! - **Worker Pool** – N workers, each bound to one control connection,
//!   pulling items from a shared operation queue; batched stop/start/pause
//! - **Control Connections** – proxy login scripts (SITE/USER@host/OPEN
//!   firewalls, SOCKS 4/4A/5, HTTP CONNECT), explicit/implicit FTPS,
//!   bounded retries, keep-alive, epoch-guarded completions
//! - **Disk Worker** – one background thread for all filesystem I/O with
//!   typed problems and policy-driven recovery (rename, overwrite, resume)
//! - **Resumable Transfers** – overlap comparison before appending
//! - **Sans-IO Core** – workers and connections are plain state machines;
//!   the tokio [`Reactor`](ftp::Reactor) runs them against real sockets

pub mod ftp;
