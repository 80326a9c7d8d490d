//! The vocabulary between the state machines and whatever runs them.
//!
//! [`ControlConnection`](crate::ftp::control::ControlConnection) and
//! [`Worker`](crate::ftp::worker::Worker) never touch a socket, a timer or
//! the filesystem. They push [`Action`]s into an [`Outbox`] and are fed
//! [`WorkerEvent`]s tagged with the [`Epoch`] of the handle that produced
//! them.

use crate::ftp::disk::{DiskResult, DiskWork, FileClose};
use crate::ftp::epoch::{Epoch, EpochSource};
use crate::ftp::error::FtpError;
use crate::ftp::types::{CertificateInfo, PromptAnswer, PromptRequest, ProxyKind};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Connect, login step or command reply.
    Reply,
    /// Pause between connection attempts.
    RetryDelay,
    /// No bytes moved on the data connection.
    DataIdle,
    /// Next keep-alive command on an idle connection.
    KeepAlive,
    /// Give the idle connection up.
    KeepAliveStop,
}

/// Transport tunnel negotiated after the TCP connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub kind: ProxyKind,
    /// Where the proxy should connect to.
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug)]
pub enum Action {
    Resolve {
        epoch: Epoch,
        host: String,
        port: u16,
    },
    OpenControl {
        epoch: Epoch,
        addr: SocketAddr,
        tunnel: Option<Tunnel>,
    },
    /// Write one command line; CRLF is appended by the transport.
    SendControl {
        epoch: Epoch,
        line: String,
    },
    /// Upgrade the control connection in place.
    StartTls {
        epoch: Epoch,
        server_name: String,
    },
    CloseControl,
    ArmTimer {
        epoch: Epoch,
        kind: TimerKind,
        after: Duration,
    },
    CancelTimer {
        kind: TimerKind,
    },
    /// Passive mode: connect to the server's data port.
    OpenData {
        epoch: Epoch,
        addr: SocketAddr,
        tls: bool,
    },
    /// Active mode: listen locally and report the address.
    ListenData {
        epoch: Epoch,
        bind_ip: IpAddr,
        tls: bool,
    },
    SendData {
        epoch: Epoch,
        data: Vec<u8>,
    },
    /// Flush and shut down the write side after the last chunk.
    FinishData {
        epoch: Epoch,
    },
    CloseData,
    SubmitDisk {
        epoch: Epoch,
        work: DiskWork,
    },
    /// Cancel the outstanding disk request.
    CancelDisk,
    CloseFile(FileClose),
    Prompt {
        epoch: Epoch,
        request: PromptRequest,
    },
}

impl Action {
    /// Short tag for logs and tests.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Resolve { .. } => "Resolve",
            Action::OpenControl { .. } => "OpenControl",
            Action::SendControl { .. } => "SendControl",
            Action::StartTls { .. } => "StartTls",
            Action::CloseControl => "CloseControl",
            Action::ArmTimer { .. } => "ArmTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::OpenData { .. } => "OpenData",
            Action::ListenData { .. } => "ListenData",
            Action::SendData { .. } => "SendData",
            Action::FinishData { .. } => "FinishData",
            Action::CloseData => "CloseData",
            Action::SubmitDisk { .. } => "SubmitDisk",
            Action::CancelDisk => "CancelDisk",
            Action::CloseFile(_) => "CloseFile",
            Action::Prompt { .. } => "Prompt",
        }
    }
}

#[derive(Debug)]
pub enum WorkerEvent {
    Resolved(Result<SocketAddr, FtpError>),
    ControlConnected { local_addr: SocketAddr },
    ControlConnectFailed(FtpError),
    ControlData(Vec<u8>),
    ControlClosed(Option<FtpError>),
    TlsEstablished(CertificateInfo),
    TlsFailed(FtpError),
    DataListening(SocketAddr),
    DataConnected,
    DataConnectFailed(FtpError),
    DataReceived(Vec<u8>),
    /// Bytes of the last `SendData` are on the wire.
    DataWritten(usize),
    DataClosed(Option<FtpError>),
    Timer(TimerKind),
    DiskDone(DiskResult),
    PromptAnswered(PromptAnswer),
}

/// Collects the actions of one step and issues epochs for new handles.
#[derive(Debug, Default)]
pub struct Outbox {
    actions: Vec<Action>,
    epochs: EpochSource,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&mut self) -> Epoch {
        self.epochs.issue()
    }

    pub fn push(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub fn drain(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// One live timer per kind.
#[derive(Debug, Default)]
pub struct Timers {
    live: HashMap<TimerKind, Epoch>,
}

impl Timers {
    /// Arm (or re-arm) `kind`; an earlier timer of the same kind goes stale.
    pub fn arm(&mut self, out: &mut Outbox, kind: TimerKind, after: Duration) {
        let epoch = out.issue();
        self.live.insert(kind, epoch);
        out.push(Action::ArmTimer { epoch, kind, after });
    }

    pub fn cancel(&mut self, out: &mut Outbox, kind: TimerKind) {
        if self.live.remove(&kind).is_some() {
            out.push(Action::CancelTimer { kind });
        }
    }

    pub fn cancel_all(&mut self, out: &mut Outbox) {
        let kinds: Vec<TimerKind> = self.live.keys().copied().collect();
        for kind in kinds {
            self.cancel(out, kind);
        }
    }

    /// Accept a firing only if it belongs to the live timer of its kind.
    pub fn fired(&mut self, kind: TimerKind, epoch: Epoch) -> bool {
        if self.live.get(&kind) == Some(&epoch) {
            self.live.remove(&kind);
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.live.contains_key(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rearmed_timer_ignores_old_firing() {
        let mut out = Outbox::new();
        let mut timers = Timers::default();
        timers.arm(&mut out, TimerKind::Reply, Duration::from_secs(1));
        let first = match out.drain().pop() {
            Some(Action::ArmTimer { epoch, .. }) => epoch,
            other => panic!("{:?}", other),
        };
        timers.arm(&mut out, TimerKind::Reply, Duration::from_secs(1));
        assert!(!timers.fired(TimerKind::Reply, first));
        assert!(timers.is_armed(TimerKind::Reply));
    }

    #[test]
    fn test_cancel_only_emits_for_live_timer() {
        let mut out = Outbox::new();
        let mut timers = Timers::default();
        timers.cancel(&mut out, TimerKind::DataIdle);
        assert!(out.is_empty());
        timers.arm(&mut out, TimerKind::DataIdle, Duration::from_secs(1));
        timers.cancel_all(&mut out);
        let names: Vec<_> = out.drain().iter().map(Action::name).collect();
        assert_eq!(names, vec!["ArmTimer", "CancelTimer"]);
    }
}
