//! Shared types for the transfer engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

// ─── Identifiers ─────────────────────────────────────────────────────

/// Stable index of a worker inside its [`WorkerPool`](crate::ftp::pool::WorkerPool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub usize);

/// Stable id of a queue item inside its [`OperationQueue`](crate::ftp::queue::OperationQueue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker#{}", self.0)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item#{}", self.0)
    }
}

// ─── Connection ──────────────────────────────────────────────────────

/// Security mode for the control channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum FtpSecurityMode {
    /// Plain-text FTP (port 21).
    #[default]
    None,
    /// Explicit FTPS: starts plain, then upgrades with AUTH TLS (port 21).
    Explicit,
    /// Implicit FTPS: TLS from the first byte (port 990).
    Implicit,
}

/// Transfer type (RFC 959 TYPE command).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TransferType {
    Ascii,
    #[default]
    Binary,
}

impl TransferType {
    pub fn command(self) -> &'static str {
        match self {
            TransferType::Ascii => "TYPE A",
            TransferType::Binary => "TYPE I",
        }
    }
}

/// How the login reaches the server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ProxyKind {
    /// Direct connection.
    #[default]
    None,
    Socks4,
    Socks4a,
    Socks5,
    /// HTTP 1.1 `CONNECT` tunnel.
    HttpConnect,
    /// `SITE host:port` firewall.
    SiteHostColonPort,
    /// `SITE host port` firewall.
    SiteHostSpacePort,
    /// `SITE user@host:port` firewall.
    SiteUserHostColonPort,
    /// `SITE user@host port` firewall.
    SiteUserHostSpacePort,
    /// `OPEN host:port` firewall.
    OpenHostColonPort,
    /// Transparent firewall login (connects to the target host).
    Transparent,
    /// `USER user@host:port` firewall.
    UserAtHostColonPort,
    /// `USER user@host port` firewall.
    UserAtHostSpacePort,
    /// `USER fireuser@host` firewall.
    FireUserAtHost,
    /// `USER user@host fireuser` firewall.
    UserAtHostFireUser,
    /// `USER user@fireuser@host` firewall.
    UserAtFireUserAtHost,
    /// User supplied login script.
    Custom,
}

impl ProxyKind {
    /// Whether the proxy is a transport tunnel (handshake before any FTP traffic).
    pub fn is_tunnel(self) -> bool {
        matches!(
            self,
            ProxyKind::Socks4 | ProxyKind::Socks4a | ProxyKind::Socks5 | ProxyKind::HttpConnect
        )
    }

    pub fn default_port(self) -> u16 {
        match self {
            ProxyKind::Socks4 | ProxyKind::Socks4a | ProxyKind::Socks5 => 1080,
            ProxyKind::HttpConnect => 8080,
            _ => 21,
        }
    }
}

/// Proxy / firewall settings for one connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Login script for [`ProxyKind::Custom`].
    #[serde(default)]
    pub script: Option<String>,
}

impl ProxyConfig {
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.kind.default_port())
    }
}

/// Configuration for one server login.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    /// Send an empty `PASS` instead of asking for a password.
    #[serde(default)]
    pub allow_empty_password: bool,
    #[serde(default)]
    pub security: FtpSecurityMode,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    /// Initial remote directory.
    #[serde(default)]
    pub initial_path: Option<String>,
    /// Use PASV; otherwise PORT with a local listener.
    #[serde(default = "default_true")]
    pub passive: bool,
}

fn default_port() -> u16 {
    21
}
fn default_true() -> bool {
    true
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            user: Some("anonymous".into()),
            password: Some("anonymous@".into()),
            account: None,
            allow_empty_password: false,
            security: FtpSecurityMode::None,
            proxy: None,
            initial_path: None,
            passive: true,
        }
    }
}

impl ConnectionConfig {
    pub fn proxy_kind(&self) -> ProxyKind {
        self.proxy.as_ref().map(|p| p.kind).unwrap_or_default()
    }
}

/// Command sent on an idle control connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum KeepAliveCommand {
    #[default]
    Noop,
    Pwd,
}

impl KeepAliveCommand {
    pub fn command(self) -> &'static str {
        match self {
            KeepAliveCommand::Noop => "NOOP",
            KeepAliveCommand::Pwd => "PWD",
        }
    }
}

// ─── Disk policies ───────────────────────────────────────────────────

/// What to do when a local name cannot be created.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CannotCreatePolicy {
    Prompt,
    Autorename,
    Skip,
}

/// What to do when a local directory already exists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DirExistsPolicy {
    Prompt,
    Autorename,
    Join,
    Skip,
}

/// What to do when a local file already exists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FileExistsPolicy {
    Prompt,
    Autorename,
    Resume,
    ResumeOrOverwrite,
    Overwrite,
    Skip,
}

/// Per-kind disk decision policies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiskPolicies {
    #[serde(default = "default_cannot_create")]
    pub cannot_create_dir: CannotCreatePolicy,
    #[serde(default = "default_dir_exists")]
    pub dir_already_exists: DirExistsPolicy,
    #[serde(default = "default_cannot_create")]
    pub cannot_create_file: CannotCreatePolicy,
    #[serde(default = "default_file_exists")]
    pub file_already_exists: FileExistsPolicy,
    /// Retrying a transfer into a file this operation created.
    #[serde(default = "default_retry_created")]
    pub retry_on_created_file: FileExistsPolicy,
    /// Retrying a transfer into a file this operation resumed.
    #[serde(default = "default_retry_resumed")]
    pub retry_on_resumed_file: FileExistsPolicy,
}

fn default_cannot_create() -> CannotCreatePolicy {
    CannotCreatePolicy::Prompt
}
fn default_dir_exists() -> DirExistsPolicy {
    DirExistsPolicy::Join
}
fn default_file_exists() -> FileExistsPolicy {
    FileExistsPolicy::Prompt
}
fn default_retry_created() -> FileExistsPolicy {
    FileExistsPolicy::ResumeOrOverwrite
}
fn default_retry_resumed() -> FileExistsPolicy {
    FileExistsPolicy::Resume
}

impl Default for DiskPolicies {
    fn default() -> Self {
        Self {
            cannot_create_dir: default_cannot_create(),
            dir_already_exists: default_dir_exists(),
            cannot_create_file: default_cannot_create(),
            file_already_exists: default_file_exists(),
            retry_on_created_file: default_retry_created(),
            retry_on_resumed_file: default_retry_resumed(),
        }
    }
}

// ─── Engine configuration ────────────────────────────────────────────

/// Timing, retry and buffer settings shared by every worker of an operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Extra connection attempts after the first one.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub delay_between_retries_secs: u64,
    /// Added to the delay for every further attempt (0 = constant delay).
    #[serde(default)]
    pub retry_delay_step_secs: u64,
    #[serde(default = "default_reply_timeout")]
    pub server_reply_timeout_secs: u64,
    #[serde(default = "default_reply_timeout")]
    pub no_data_transfer_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    #[serde(default = "default_keep_alive_every")]
    pub keep_alive_every_secs: u64,
    #[serde(default = "default_keep_alive_stop")]
    pub keep_alive_stop_after_secs: u64,
    #[serde(default)]
    pub keep_alive_command: KeepAliveCommand,
    /// Bytes re-downloaded and compared when resuming.
    #[serde(default = "default_resume_overlap")]
    pub resume_overlap: u64,
    /// Disk read / write chunk size.
    #[serde(default = "default_flush_buffer")]
    pub flush_buffer_size: usize,
    #[serde(default)]
    pub disk_policies: DiskPolicies,
}

fn default_connect_retries() -> u32 {
    20
}
fn default_retry_delay() -> u64 {
    20
}
fn default_reply_timeout() -> u64 {
    60
}
fn default_keep_alive_every() -> u64 {
    60
}
fn default_keep_alive_stop() -> u64 {
    30 * 60
}
fn default_resume_overlap() -> u64 {
    10_000
}
fn default_flush_buffer() -> usize {
    65_536
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_retries: default_connect_retries(),
            delay_between_retries_secs: default_retry_delay(),
            retry_delay_step_secs: 0,
            server_reply_timeout_secs: default_reply_timeout(),
            no_data_transfer_timeout_secs: default_reply_timeout(),
            keep_alive: true,
            keep_alive_every_secs: default_keep_alive_every(),
            keep_alive_stop_after_secs: default_keep_alive_stop(),
            keep_alive_command: KeepAliveCommand::Noop,
            resume_overlap: default_resume_overlap(),
            flush_buffer_size: default_flush_buffer(),
            disk_policies: DiskPolicies::default(),
        }
    }
}

impl EngineConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.server_reply_timeout_secs)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.no_data_transfer_timeout_secs)
    }

    /// Delay before connection attempt number `attempt` (1-based, attempt > 1).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let extra = self
            .retry_delay_step_secs
            .saturating_mul(attempt.saturating_sub(2) as u64);
        Duration::from_secs(self.delay_between_retries_secs.saturating_add(extra))
    }
}

// ─── FTP Response ────────────────────────────────────────────────────

/// First-digit classification of a reply code.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ReplyClass {
    /// 1xx
    Preliminary,
    /// 2xx
    Completion,
    /// 3xx
    Intermediate,
    /// 4xx
    TransientNegative,
    /// 5xx
    PermanentNegative,
    /// Not an FTP reply at all.
    Invalid,
}

/// A single FTP response (may be multi-line). Code 0 marks a line that
/// did not start with three digits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FtpResponse {
    pub code: u16,
    pub lines: Vec<String>,
}

impl FtpResponse {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    /// Full response text (all lines joined).
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn class(&self) -> ReplyClass {
        match self.code {
            100..=199 => ReplyClass::Preliminary,
            200..=299 => ReplyClass::Completion,
            300..=399 => ReplyClass::Intermediate,
            400..=499 => ReplyClass::TransientNegative,
            500..=599 => ReplyClass::PermanentNegative,
            _ => ReplyClass::Invalid,
        }
    }

    pub fn is_preliminary(&self) -> bool {
        self.class() == ReplyClass::Preliminary
    }

    pub fn is_completion(&self) -> bool {
        self.class() == ReplyClass::Completion
    }
}

// ─── Directory listings ──────────────────────────────────────────────

/// Type of a filesystem entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FtpEntryKind {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// One entry from a remote listing (parsed from LIST or MLSD output).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FtpEntry {
    pub name: String,
    pub kind: FtpEntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub permissions: Option<String>,
    pub link_target: Option<String>,
    /// MLSD fact map (e.g. "type" → "file", "size" → "1234").
    #[serde(default)]
    pub facts: HashMap<String, String>,
}

/// One entry of a local directory listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

// ─── Queue items ─────────────────────────────────────────────────────

/// Override applied to a queue item after a user decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ForcedAction {
    #[default]
    None,
    Autorename,
    UseExistingDir,
    Resume,
    ResumeOrOverwrite,
    Overwrite,
    ReduceFileSizeAndResume,
    Skip,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ItemState {
    Waiting,
    /// Waiting for child items to finish.
    Delayed,
    Processing,
    Done,
    Skipped,
    Failed,
    /// A child failed, so this parent can never run.
    ForcedToFail,
    /// Suspended until a human decision arrives.
    NeedsInput,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemState::Done
                | ItemState::Skipped
                | ItemState::Failed
                | ItemState::ForcedToFail
                | ItemState::NeedsInput
        )
    }

    pub fn is_success(self) -> bool {
        matches!(self, ItemState::Done | ItemState::Skipped)
    }
}

/// Why a remote directory is being explored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ExplorePurpose {
    Download { local_dir: PathBuf, is_move: bool },
    Delete,
    ChangeAttrs { mode: u32 },
}

/// What a queue item does. Remote paths are absolute, `/`-separated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ItemKind {
    /// `MKD name` in `remote_dir`; an existing directory is accepted when `join_existing`.
    CreateDir {
        remote_dir: String,
        name: String,
        join_existing: bool,
    },
    UploadFile {
        local: PathBuf,
        remote_dir: String,
        name: String,
        is_move: bool,
        transfer_type: TransferType,
    },
    DownloadFile {
        remote_dir: String,
        name: String,
        local_dir: PathBuf,
        local_name: String,
        size: Option<u64>,
        /// Remote modification time, stamped on the finished file.
        #[serde(default)]
        modified: Option<DateTime<Utc>>,
        is_move: bool,
        transfer_type: TransferType,
    },
    DeleteFile {
        remote_dir: String,
        name: String,
    },
    DeleteDir {
        remote_dir: String,
        name: String,
    },
    ChangeAttrs {
        remote_dir: String,
        name: String,
        mode: u32,
    },
    ListDir {
        remote_dir: String,
    },
    ExploreRemoteDir {
        remote_dir: String,
        name: String,
        purpose: ExplorePurpose,
    },
    ExploreLocalDir {
        local: PathBuf,
        remote_dir: String,
        name: String,
        is_move: bool,
    },
    DeleteLocalDir {
        local: PathBuf,
    },
}

impl ItemKind {
    /// Whether the item needs a logged-in control connection.
    pub fn needs_connection(&self) -> bool {
        !matches!(self, ItemKind::DeleteLocalDir { .. })
    }

    /// Short label for logs and status snapshots.
    pub fn label(&self) -> String {
        match self {
            ItemKind::CreateDir { remote_dir, name, .. } => {
                format!("mkdir {}", join_remote(remote_dir, name))
            }
            ItemKind::UploadFile { local, remote_dir, name, .. } => {
                format!("upload {} -> {}", local.display(), join_remote(remote_dir, name))
            }
            ItemKind::DownloadFile { remote_dir, name, local_dir, local_name, .. } => format!(
                "download {} -> {}",
                join_remote(remote_dir, name),
                local_dir.join(local_name).display()
            ),
            ItemKind::DeleteFile { remote_dir, name } => {
                format!("delete {}", join_remote(remote_dir, name))
            }
            ItemKind::DeleteDir { remote_dir, name } => {
                format!("rmdir {}", join_remote(remote_dir, name))
            }
            ItemKind::ChangeAttrs { remote_dir, name, mode } => {
                format!("chmod {:o} {}", mode, join_remote(remote_dir, name))
            }
            ItemKind::ListDir { remote_dir } => format!("list {}", remote_dir),
            ItemKind::ExploreRemoteDir { remote_dir, name, .. } => {
                format!("explore {}", join_remote(remote_dir, name))
            }
            ItemKind::ExploreLocalDir { local, .. } => format!("explore {}", local.display()),
            ItemKind::DeleteLocalDir { local } => format!("rmdir {}", local.display()),
        }
    }
}

/// Join a remote directory and a name with exactly one `/`.
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

// ─── Worker status ───────────────────────────────────────────────────

/// Live transfer counters of one worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatus {
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub speed_bps: u64,
}

/// Snapshot of a worker for the host UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub state: String,
    pub substate: Option<String>,
    pub item: Option<ItemId>,
    pub paused: bool,
    pub connected: bool,
    pub transfer: TransferStatus,
    pub idle_secs: u64,
    pub error: Option<String>,
    pub error_seq: Option<u64>,
}

// ─── Prompts ─────────────────────────────────────────────────────────

/// Values the login script could not fill in on its own.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NeedsInput {
    pub proxy_host: bool,
    pub proxy_password: bool,
    pub user: bool,
    pub password: bool,
    pub account: bool,
}

impl NeedsInput {
    pub fn any(&self) -> bool {
        self.proxy_host || self.proxy_password || self.user || self.password || self.account
    }
}

/// Answer to a credentials prompt. `None` fields keep the current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub proxy_host: Option<String>,
    pub proxy_password: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub account: Option<String>,
}

/// Server certificate as seen during the TLS handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateInfo {
    /// SHA-256 of the DER end-entity certificate, lowercase hex.
    pub fingerprint: String,
    pub trusted: bool,
    /// Why the chain did not verify.
    pub verify_error: Option<String>,
}

/// Question the engine needs a human (or host policy) to answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum PromptRequest {
    /// The script lacks values.
    Credentials {
        worker: WorkerId,
        host: String,
        needs: NeedsInput,
    },
    /// The server rejected the login with a 5xx reply.
    LoginRejected {
        worker: WorkerId,
        host: String,
        reply: String,
    },
    /// The certificate chain is not trusted.
    Certificate {
        worker: WorkerId,
        host: String,
        certificate: CertificateInfo,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum PromptAnswer {
    Credentials(Credentials),
    AcceptCertificate,
    Cancel,
}

/// Host callback answering engine prompts. Runs on a blocking thread.
pub trait Prompter: Send + Sync {
    fn prompt(&self, request: &PromptRequest) -> PromptAnswer;
}

/// Prompter that declines everything; unattended operations use it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAllPrompter;

impl Prompter for DenyAllPrompter {
    fn prompt(&self, _request: &PromptRequest) -> PromptAnswer {
        PromptAnswer::Cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_classes() {
        assert_eq!(FtpResponse::new(150, "x").class(), ReplyClass::Preliminary);
        assert_eq!(FtpResponse::new(226, "x").class(), ReplyClass::Completion);
        assert_eq!(FtpResponse::new(331, "x").class(), ReplyClass::Intermediate);
        assert_eq!(FtpResponse::new(421, "x").class(), ReplyClass::TransientNegative);
        assert_eq!(FtpResponse::new(550, "x").class(), ReplyClass::PermanentNegative);
        assert_eq!(FtpResponse::new(0, "x").class(), ReplyClass::Invalid);
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/", "a"), "/a");
        assert_eq!(join_remote("/pub", "a.txt"), "/pub/a.txt");
        assert_eq!(join_remote("", "a"), "a");
    }

    #[test]
    fn test_retry_delay_step() {
        let cfg = EngineConfig {
            delay_between_retries_secs: 10,
            retry_delay_step_secs: 5,
            ..Default::default()
        };
        assert_eq!(cfg.retry_delay(2), Duration::from_secs(10));
        assert_eq!(cfg.retry_delay(4), Duration::from_secs(20));
    }

    #[test]
    fn test_engine_config_defaults_from_empty_json() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.connect_retries, 20);
        assert_eq!(cfg.disk_policies.dir_already_exists, DirExistsPolicy::Join);
    }

    #[test]
    fn test_proxy_default_ports() {
        assert_eq!(ProxyKind::Socks5.default_port(), 1080);
        assert_eq!(ProxyKind::HttpConnect.default_port(), 8080);
        assert_eq!(ProxyKind::SiteHostColonPort.default_port(), 21);
        assert!(ProxyKind::Socks4a.is_tunnel());
        assert!(!ProxyKind::Transparent.is_tunnel());
    }
}
