//! Engine error type.
//!
//! Every failure the engine surfaces is an [`FtpError`] with a kind from the
//! transport / protocol / proxy / disk taxonomy. The kind decides whether the
//! retry loop may try again ([`FtpError::is_fatal`]).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised engine error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    /// FTP reply code that triggered the error, if any.
    pub code: Option<u16>,
    /// Raw OS error code for transport and disk failures.
    pub os_error: Option<i32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FtpErrorKind {
    /// Connect / send / receive failure on a socket.
    Transport,
    /// Host name could not be resolved.
    Resolve,
    /// A wait (connect, reply, data idle) expired.
    Timeout,
    /// Server sent something that is not an FTP reply, or an unexpected one.
    Protocol,
    /// Server answered a command with 4xx/5xx.
    CommandRejected,
    /// Server refused the login credentials.
    AuthFailed,
    /// Server closed the control connection (or replied 421).
    Disconnected,
    /// SOCKS / HTTP CONNECT handshake failure.
    Proxy,
    /// Proxy login script is malformed.
    InvalidScript,
    /// Login script ended after a 3xx reply.
    IncompleteScript,
    /// TLS negotiation failure.
    Tls,
    /// The user rejected the server certificate.
    CertificateRejected,
    /// Local filesystem failure.
    Disk(DiskProblemKind),
    OutOfMemory,
    /// Operation cancelled by the user.
    Cancelled,
    /// Config / parameter validation error.
    InvalidConfig,
    /// Queue item or worker id not found.
    NotFound,
}

/// Semantic classification of a disk failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum DiskProblemKind {
    NameAlreadyExists,
    CannotCreate,
    ResumeVerificationFailed,
    CannotResume,
    OutOfMemory,
    ReadError,
    WriteError,
    CannotDelete,
    CannotList,
    NotFound,
}

pub type FtpResult<T> = Result<T, FtpError>;

// ── Construction helpers ─────────────────────────────────────────────

impl FtpError {
    pub fn new(kind: FtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            os_error: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_os_error(mut self, os_error: Option<i32>) -> Self {
        self.os_error = os_error;
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Transport, msg)
    }

    pub fn resolve(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Resolve, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Timeout, msg)
    }

    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Protocol, msg)
    }

    pub fn command_rejected(code: u16, msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::CommandRejected, msg).with_code(code)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::AuthFailed, msg)
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Disconnected, msg)
    }

    pub fn proxy(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Proxy, msg)
    }

    pub fn invalid_script(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidScript, msg)
    }

    pub fn tls_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Tls, msg)
    }

    pub fn disk(problem: DiskProblemKind, msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Disk(problem), msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Cancelled, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidConfig, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::NotFound, msg)
    }

    /// Classify an FTP reply code into the most appropriate error kind.
    pub fn from_reply(code: u16, text: &str) -> Self {
        let kind = match code {
            421 => FtpErrorKind::Disconnected,
            430 | 530 | 532 => FtpErrorKind::AuthFailed,
            100..=399 => FtpErrorKind::Protocol,
            _ => FtpErrorKind::CommandRejected,
        };
        Self::new(kind, text).with_code(code)
    }

    /// Whether the retry loop must give up immediately.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            FtpErrorKind::InvalidScript
                | FtpErrorKind::IncompleteScript
                | FtpErrorKind::OutOfMemory
                | FtpErrorKind::Disk(DiskProblemKind::OutOfMemory)
                | FtpErrorKind::CertificateRejected
                | FtpErrorKind::Cancelled
                | FtpErrorKind::InvalidConfig
                | FtpErrorKind::Tls
        )
    }

    /// The disk problem carried by this error, if it is a disk error.
    pub fn disk_problem(&self) -> Option<DiskProblemKind> {
        match self.kind {
            FtpErrorKind::Disk(p) => Some(p),
            _ => None,
        }
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.os_error) {
            (Some(code), _) => write!(f, "[FTP {:?} {}] {}", self.kind, code, self.message),
            (None, Some(os)) => write!(f, "[FTP {:?} os {}] {}", self.kind, os, self.message),
            (None, None) => write!(f, "[FTP {:?}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for FtpError {}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        let os = e.raw_os_error();
        let err = match e.kind() {
            std::io::ErrorKind::TimedOut => Self::timeout(format!("I/O timeout: {}", e)),
            std::io::ErrorKind::OutOfMemory => Self::new(FtpErrorKind::OutOfMemory, e.to_string()),
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset => {
                Self::disconnected(e.to_string())
            }
            _ => Self::transport(e.to_string()),
        };
        err.with_os_error(os)
    }
}
