//! Worker state machine.
//!
//! A worker owns one [`ControlConnection`] and processes queue items one at
//! a time. Each item is turned into a short plan of steps (CWD, TYPE, data
//! connection, transfer command, disk requests); the worker performs a step,
//! suspends until its completion arrives, then performs the next one. Steps
//! are the only points where pause and a deferred stop take effect.
//!
//! ```text
//! LookingForWork → Preparing → Connecting → Working ⇄ WaitingForReconnect
//!        ↑  ↓                      ↓
//!      Sleeping              ConnectionError            Stopped
//! ```

use crate::ftp::control::{ConnEvent, ControlConnection};
use crate::ftp::disk::{CreateFileMode, DiskOutcome, DiskProblem, DiskResult, DiskWork, FileClose, FileOpenMode, LocalFile};
use crate::ftp::epoch::{Epoch, EpochSlot};
use crate::ftp::error::{DiskProblemKind, FtpError};
use crate::ftp::events::{Action, Outbox, TimerKind, Timers, WorkerEvent};
use crate::ftp::parser::parse_listing;
use crate::ftp::protocol::{parse_pasv, port_command};
use crate::ftp::queue::{LocalTarget, OperationQueue, QueueItem};
use crate::ftp::tls::CertificateCache;
use crate::ftp::types::{
    join_remote, ConnectionConfig, EngineConfig, ExplorePurpose, ForcedAction, FtpEntry, FtpEntryKind, FtpResponse, ItemId,
    ItemKind, LocalEntry, TransferStatus, TransferType, WorkerId, WorkerStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

// ─── Public state ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerState {
    LookingForWork,
    /// No work right now, but the operation is not finished.
    Sleeping,
    Preparing,
    Connecting,
    WaitingForReconnect,
    Working,
    /// Connecting gave up; waits for [`Worker::start`].
    ConnectionError,
    Stopped,
}

impl WorkerState {
    pub fn name(self) -> &'static str {
        match self {
            WorkerState::LookingForWork => "looking for work",
            WorkerState::Sleeping => "sleeping",
            WorkerState::Preparing => "preparing",
            WorkerState::Connecting => "connecting",
            WorkerState::WaitingForReconnect => "waiting for reconnect",
            WorkerState::Working => "working",
            WorkerState::ConnectionError => "connection error",
            WorkerState::Stopped => "stopped",
        }
    }
}

/// Last error of a worker with its place in the operation's error order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerError {
    pub message: String,
    pub seq: u64,
}

// ─── Jobs ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferKind {
    Upload,
    Download,
    Listing,
}

#[derive(Debug, Clone)]
enum Purpose {
    Mkd { path: String, join: bool },
    /// CWD into a directory MKD could not create, to see if it exists.
    MkdCheck { path: String, error: FtpError },
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiskFor {
    OpenSource,
    CreateTarget,
    CreateLocalDir,
    ListLocal,
    DeleteLocal,
}

#[derive(Debug)]
enum Step {
    Cwd(String),
    Type(TransferType),
    OpenData,
    Rest(u64),
    Transfer(TransferKind, String),
    Command(String, Purpose),
    Disk(DiskWork, DiskFor),
}

#[derive(Debug)]
enum ReplyFor {
    Cwd(String),
    Type(TransferType),
    Pasv,
    Port,
    Rest,
    Command(Purpose),
}

#[derive(Debug)]
enum Wait {
    Idle,
    Reply(ReplyFor),
    DataListen,
    DataConnect,
    Transfer,
    Disk(DiskFor),
    Paused,
}

#[derive(Debug)]
struct Transfer {
    kind: TransferKind,
    /// 1xx (or the final reply) arrived.
    started: bool,
    finished: bool,
    data_open: bool,
    data_closed: bool,
    buffer: Vec<u8>,
    /// File offset of the first byte in `buffer`.
    offset: u64,
    /// Bytes below this offset are verified, not written.
    write_from: u64,
    inflight: usize,
    eof: bool,
    prev_cr: bool,
    sending: bool,
}

impl Transfer {
    fn new(kind: TransferKind, data_open: bool, offset: u64, write_from: u64) -> Self {
        Self {
            kind,
            started: false,
            finished: false,
            data_open,
            data_closed: false,
            buffer: Vec::new(),
            offset,
            write_from,
            inflight: 0,
            eof: false,
            prev_cr: false,
            sending: false,
        }
    }
}

#[derive(Debug)]
struct Job {
    item: QueueItem,
    plan: VecDeque<Step>,
    wait: Wait,
    file: Option<LocalFile>,
    transfer: Option<Transfer>,
    /// Passive data connection is up before the transfer command.
    data_ready: bool,
    /// (REST offset, local size) of a resumed download.
    resume: Option<(u64, u64)>,
    local_dir: Option<PathBuf>,
    /// The download target was created by this job.
    created_target: bool,
    /// A failed resume may overwrite the target instead.
    can_overwrite: bool,
}

impl Job {
    fn new(item: QueueItem, plan: VecDeque<Step>) -> Self {
        Self {
            item,
            plan,
            wait: Wait::Idle,
            file: None,
            transfer: None,
            data_ready: false,
            resume: None,
            local_dir: None,
            created_target: false,
            can_overwrite: false,
        }
    }

    fn ascii(&self) -> bool {
        matches!(
            self.item.kind,
            ItemKind::UploadFile {
                transfer_type: TransferType::Ascii,
                ..
            }
        )
    }

    fn modified(&self) -> Option<SystemTime> {
        match &self.item.kind {
            ItemKind::DownloadFile { modified, .. } => modified.map(SystemTime::from),
            _ => None,
        }
    }

    /// Whether a stop may tear the job down right now.
    fn stoppable(&self) -> bool {
        match &self.wait {
            Wait::Idle | Wait::Paused | Wait::DataListen | Wait::DataConnect => true,
            Wait::Transfer => self
                .transfer
                .as_ref()
                .is_some_and(|t| t.started || t.kind == TransferKind::Listing),
            Wait::Reply(_) | Wait::Disk(_) => false,
        }
    }
}

/// What happens after an event was applied to the job.
enum Flow {
    Wait,
    Next,
    Finish(Outcome),
}

enum Outcome {
    Done,
    Skipped,
    /// Replaced by child items.
    Expanded,
    Failed(FtpError),
    /// Worth another attempt, up to the retry limit.
    Transient(FtpError),
    NeedsInput(DiskProblemKind, String),
    /// Back to the queue without counting an attempt.
    Retry,
    Stopped,
    Lost(FtpError),
}

fn create_mode(target: LocalTarget) -> CreateFileMode {
    match target {
        LocalTarget::Untouched => CreateFileMode::Initial,
        LocalTarget::Created => CreateFileMode::RetryCreated,
        LocalTarget::Resumed => CreateFileMode::RetryResumed,
    }
}

fn plan_for(item: &QueueItem, engine: &EngineConfig) -> VecDeque<Step> {
    let mut plan = VecDeque::new();
    match &item.kind {
        ItemKind::CreateDir {
            remote_dir,
            name,
            join_existing,
        } => {
            plan.push_back(Step::Cwd(remote_dir.clone()));
            plan.push_back(Step::Command(
                format!("MKD {}", name),
                Purpose::Mkd {
                    path: join_remote(remote_dir, name),
                    join: *join_existing,
                },
            ));
        }
        ItemKind::UploadFile {
            local,
            remote_dir,
            name,
            is_move,
            transfer_type,
        } => {
            plan.push_back(Step::Disk(
                DiskWork::OpenFileForReading { path: local.clone() },
                DiskFor::OpenSource,
            ));
            plan.push_back(Step::Cwd(remote_dir.clone()));
            plan.push_back(Step::Type(*transfer_type));
            plan.push_back(Step::OpenData);
            plan.push_back(Step::Transfer(TransferKind::Upload, format!("STOR {}", name)));
            if *is_move {
                plan.push_back(Step::Disk(
                    DiskWork::DeleteFile { path: local.clone() },
                    DiskFor::DeleteLocal,
                ));
            }
        }
        ItemKind::DownloadFile {
            remote_dir,
            name,
            local_dir,
            local_name,
            is_move,
            transfer_type,
            ..
        } => {
            plan.push_back(Step::Disk(
                DiskWork::CreateFile {
                    dir: local_dir.clone(),
                    name: local_name.clone(),
                    mode: create_mode(item.local_target),
                    policies: engine.disk_policies.clone(),
                    forced: item.forced,
                    overlap: engine.resume_overlap,
                },
                DiskFor::CreateTarget,
            ));
            plan.push_back(Step::Cwd(remote_dir.clone()));
            plan.push_back(Step::Type(*transfer_type));
            plan.push_back(Step::OpenData);
            plan.push_back(Step::Transfer(TransferKind::Download, format!("RETR {}", name)));
            if *is_move {
                plan.push_back(Step::Command(format!("DELE {}", name), Purpose::Plain));
            }
        }
        ItemKind::DeleteFile { remote_dir, name } => {
            plan.push_back(Step::Cwd(remote_dir.clone()));
            plan.push_back(Step::Command(format!("DELE {}", name), Purpose::Plain));
        }
        ItemKind::DeleteDir { remote_dir, name } => {
            plan.push_back(Step::Cwd(remote_dir.clone()));
            plan.push_back(Step::Command(format!("RMD {}", name), Purpose::Plain));
        }
        ItemKind::ChangeAttrs { remote_dir, name, mode } => {
            plan.push_back(Step::Cwd(remote_dir.clone()));
            plan.push_back(Step::Command(format!("SITE CHMOD {:o} {}", mode, name), Purpose::Plain));
        }
        ItemKind::ListDir { remote_dir } => {
            plan.push_back(Step::Cwd(remote_dir.clone()));
            plan.push_back(Step::Type(TransferType::Ascii));
            plan.push_back(Step::OpenData);
            plan.push_back(Step::Transfer(TransferKind::Listing, "LIST".into()));
        }
        ItemKind::ExploreRemoteDir {
            remote_dir,
            name,
            purpose,
        } => {
            if let ExplorePurpose::Download { local_dir, .. } = purpose {
                plan.push_back(Step::Disk(
                    DiskWork::CreateDir {
                        parent: local_dir.clone(),
                        name: name.clone(),
                        policies: engine.disk_policies.clone(),
                        forced: item.forced,
                    },
                    DiskFor::CreateLocalDir,
                ));
            }
            plan.push_back(Step::Cwd(join_remote(remote_dir, name)));
            plan.push_back(Step::Type(TransferType::Ascii));
            plan.push_back(Step::OpenData);
            plan.push_back(Step::Transfer(TransferKind::Listing, "LIST".into()));
        }
        ItemKind::ExploreLocalDir {
            local, remote_dir, name, ..
        } => {
            plan.push_back(Step::Cwd(remote_dir.clone()));
            plan.push_back(Step::Command(
                format!("MKD {}", name),
                Purpose::Mkd {
                    path: join_remote(remote_dir, name),
                    join: true,
                },
            ));
            plan.push_back(Step::Disk(DiskWork::ListDir { path: local.clone() }, DiskFor::ListLocal));
        }
        ItemKind::DeleteLocalDir { local } => {
            plan.push_back(Step::Disk(DiskWork::DeleteDir { path: local.clone() }, DiskFor::DeleteLocal));
        }
    }
    plan
}

/// Items produced by exploring the remote directory `dir_name` in `parent`.
/// Returns the children and the item that runs after all of them.
pub(crate) fn remote_children(
    parent: &str,
    dir_name: &str,
    listing: &[FtpEntry],
    purpose: &ExplorePurpose,
    local_dir: Option<&Path>,
) -> (Vec<ItemKind>, Option<ItemKind>) {
    let path = join_remote(parent, dir_name);
    let mut children = Vec::new();
    for entry in listing.iter().filter(|e| e.name != "." && e.name != "..") {
        let is_dir = entry.kind == FtpEntryKind::Directory;
        let child = match purpose {
            ExplorePurpose::Download { is_move, .. } => {
                let target = local_dir.map(Path::to_path_buf).unwrap_or_default();
                if is_dir {
                    ItemKind::ExploreRemoteDir {
                        remote_dir: path.clone(),
                        name: entry.name.clone(),
                        purpose: ExplorePurpose::Download {
                            local_dir: target,
                            is_move: *is_move,
                        },
                    }
                } else {
                    ItemKind::DownloadFile {
                        remote_dir: path.clone(),
                        name: entry.name.clone(),
                        local_dir: target,
                        local_name: entry.name.clone(),
                        size: Some(entry.size),
                        modified: entry.modified,
                        is_move: *is_move,
                        transfer_type: TransferType::Binary,
                    }
                }
            }
            ExplorePurpose::Delete => {
                if is_dir {
                    ItemKind::ExploreRemoteDir {
                        remote_dir: path.clone(),
                        name: entry.name.clone(),
                        purpose: ExplorePurpose::Delete,
                    }
                } else {
                    ItemKind::DeleteFile {
                        remote_dir: path.clone(),
                        name: entry.name.clone(),
                    }
                }
            }
            ExplorePurpose::ChangeAttrs { mode } => {
                if is_dir {
                    ItemKind::ExploreRemoteDir {
                        remote_dir: path.clone(),
                        name: entry.name.clone(),
                        purpose: ExplorePurpose::ChangeAttrs { mode: *mode },
                    }
                } else {
                    ItemKind::ChangeAttrs {
                        remote_dir: path.clone(),
                        name: entry.name.clone(),
                        mode: *mode,
                    }
                }
            }
        };
        children.push(child);
    }

    let after = match purpose {
        ExplorePurpose::Download { is_move: true, .. } | ExplorePurpose::Delete => Some(ItemKind::DeleteDir {
            remote_dir: parent.to_string(),
            name: dir_name.to_string(),
        }),
        ExplorePurpose::Download { .. } => None,
        ExplorePurpose::ChangeAttrs { mode } => Some(ItemKind::ChangeAttrs {
            remote_dir: parent.to_string(),
            name: dir_name.to_string(),
            mode: *mode,
        }),
    };
    (children, after)
}

/// Items produced by exploring a local directory for upload.
pub(crate) fn local_children(
    local: &Path,
    remote_path: &str,
    entries: &[LocalEntry],
    is_move: bool,
) -> (Vec<ItemKind>, Option<ItemKind>) {
    let children = entries
        .iter()
        .map(|e| {
            if e.is_dir {
                ItemKind::ExploreLocalDir {
                    local: local.join(&e.name),
                    remote_dir: remote_path.to_string(),
                    name: e.name.clone(),
                    is_move,
                }
            } else {
                ItemKind::UploadFile {
                    local: local.join(&e.name),
                    remote_dir: remote_path.to_string(),
                    name: e.name.clone(),
                    is_move,
                    transfer_type: TransferType::Binary,
                }
            }
        })
        .collect();
    let after = is_move.then(|| ItemKind::DeleteLocalDir {
        local: local.to_path_buf(),
    });
    (children, after)
}

// ─── Worker ──────────────────────────────────────────────────────────

enum Phase {
    LookingForWork,
    Sleeping,
    Preparing,
    Connecting(Option<QueueItem>),
    WaitingForReconnect(QueueItem),
    Working(Job),
    ConnectionError,
    Stopped,
}

pub struct Worker {
    id: WorkerId,
    queue: Arc<OperationQueue>,
    engine: Arc<EngineConfig>,
    conn: ControlConnection,
    out: Outbox,
    phase: Phase,
    data: EpochSlot,
    disk: EpochSlot,
    timers: Timers,
    paused: bool,
    stop_requested: bool,
    error: Option<WorkerError>,
    progress: TransferStatus,
    progress_base: u64,
    transfer_started: Option<Instant>,
    /// Keep-alive was started for the current idle period.
    idle_marked: bool,
    idle_since: Instant,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        queue: Arc<OperationQueue>,
        engine: Arc<EngineConfig>,
        config: ConnectionConfig,
        certs: Arc<CertificateCache>,
    ) -> Self {
        let conn = ControlConnection::new(id, config, Arc::clone(&engine), certs);
        Self {
            id,
            queue,
            engine,
            conn,
            out: Outbox::new(),
            phase: Phase::LookingForWork,
            data: EpochSlot::default(),
            disk: EpochSlot::default(),
            timers: Timers::default(),
            paused: false,
            stop_requested: false,
            error: None,
            progress: TransferStatus::default(),
            progress_base: 0,
            transfer_started: None,
            idle_marked: false,
            idle_since: Instant::now(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        match &self.phase {
            Phase::LookingForWork => WorkerState::LookingForWork,
            Phase::Sleeping => WorkerState::Sleeping,
            Phase::Preparing => WorkerState::Preparing,
            Phase::Connecting(_) => WorkerState::Connecting,
            Phase::WaitingForReconnect(_) => WorkerState::WaitingForReconnect,
            Phase::Working(_) => WorkerState::Working,
            Phase::ConnectionError => WorkerState::ConnectionError,
            Phase::Stopped => WorkerState::Stopped,
        }
    }

    pub fn control(&self) -> &ControlConnection {
        &self.conn
    }

    pub fn current_item(&self) -> Option<ItemId> {
        match &self.phase {
            Phase::Connecting(item) => item.as_ref().map(|i| i.id),
            Phase::WaitingForReconnect(item) => Some(item.id),
            Phase::Working(job) => Some(job.item.id),
            _ => None,
        }
    }

    pub fn holds_item(&self) -> bool {
        self.current_item().is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_stopping(&self) -> bool {
        self.stop_requested
    }

    pub fn error(&self) -> Option<&WorkerError> {
        self.error.as_ref()
    }

    /// Idle with a logged-in connection.
    pub fn is_connected_idle(&self) -> bool {
        matches!(self.phase, Phase::LookingForWork | Phase::Sleeping)
            && self.conn.is_logged_in()
            && !self.paused
            && !self.stop_requested
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::LookingForWork | Phase::Sleeping)
    }

    pub fn drain_actions(&mut self) -> Vec<Action> {
        self.out.drain()
    }

    pub fn status(&self) -> WorkerStatus {
        let substate = match &self.phase {
            Phase::Connecting(_) | Phase::WaitingForReconnect(_) => Some(self.conn.state().name().to_string()),
            Phase::Working(job) => Some(wait_name(job).to_string()),
            _ => None,
        };
        let mut transfer = self.progress.clone();
        if let Some(started) = self.transfer_started {
            let secs = started.elapsed().as_secs_f64();
            if secs > 0.0 {
                transfer.speed_bps = (transfer.bytes_done.saturating_sub(self.progress_base) as f64 / secs) as u64;
            }
        }
        WorkerStatus {
            id: self.id,
            state: self.state().name().to_string(),
            substate,
            item: self.current_item(),
            paused: self.paused,
            connected: self.conn.is_logged_in(),
            transfer,
            idle_secs: if self.is_idle() {
                self.idle_since.elapsed().as_secs()
            } else {
                0
            },
            error: self.error.as_ref().map(|e| e.message.clone()),
            error_seq: self.error.as_ref().map(|e| e.seq),
        }
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Pick up work if idle, or continue a job that is between steps.
    pub fn activate(&mut self) {
        match &self.phase {
            Phase::LookingForWork | Phase::Sleeping => {
                if self.stop_requested {
                    self.stop_requested = false;
                    self.conn.quit(&mut self.out);
                    self.phase = Phase::Stopped;
                    return;
                }
                if self.paused {
                    self.go_idle();
                    return;
                }
                match self.queue.take_next_waiting(self.id) {
                    Some(item) => self.begin(item),
                    None => self.go_idle(),
                }
            }
            Phase::Working(job) if matches!(job.wait, Wait::Idle) => self.with_job(|_, _| Flow::Next),
            _ => {}
        }
    }

    /// Pause or resume. A pause takes effect at the next step boundary.
    pub fn pause(&mut self, paused: bool) {
        if self.paused == paused {
            return;
        }
        self.paused = paused;
        log::debug!("{}: {}", self.id, if paused { "paused" } else { "resumed" });
        if paused {
            return;
        }
        match &mut self.phase {
            Phase::Working(job) if matches!(job.wait, Wait::Paused) => {
                job.wait = Wait::Idle;
                self.with_job(|_, _| Flow::Next);
            }
            Phase::LookingForWork | Phase::Sleeping => self.activate(),
            _ => {}
        }
    }

    /// Stop now if nothing would be torn mid-reply, otherwise at the next
    /// step boundary. The item goes back to the queue.
    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Stopped) {
            Phase::Working(job) => {
                if job.stoppable() {
                    self.finish(job, Outcome::Stopped);
                } else {
                    log::debug!("{}: stop deferred to the next command boundary", self.id);
                    self.stop_requested = true;
                    self.phase = Phase::Working(job);
                }
            }
            Phase::Connecting(item) => {
                if let Some(item) = item {
                    self.give_back(item.id);
                }
                self.conn.close(&mut self.out);
            }
            Phase::WaitingForReconnect(item) => {
                self.give_back(item.id);
                self.conn.close(&mut self.out);
            }
            Phase::Stopped => {}
            Phase::LookingForWork | Phase::Sleeping | Phase::Preparing | Phase::ConnectionError => {
                self.conn.quit(&mut self.out);
            }
        }
        if matches!(self.phase, Phase::Stopped) {
            self.idle_marked = false;
            log::info!("{}: stopped", self.id);
        }
    }

    /// Restart a stopped or failed worker.
    pub fn start(&mut self) {
        self.stop_requested = false;
        if matches!(self.phase, Phase::Stopped | Phase::ConnectionError) {
            self.phase = Phase::LookingForWork;
            self.idle_since = Instant::now();
            self.activate();
        }
    }

    /// Stop immediately and log out, whatever is in flight.
    pub fn shutdown(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Stopped) {
            Phase::Working(job) => self.finish(job, Outcome::Stopped),
            Phase::Connecting(Some(item)) | Phase::WaitingForReconnect(item) => self.give_back(item.id),
            _ => {}
        }
        self.stop_requested = false;
        self.conn.shutdown(&mut self.out);
        self.phase = Phase::Stopped;
    }

    /// Hand over the item of a worker that is still connecting.
    pub(crate) fn take_connecting_item(&mut self) -> Option<QueueItem> {
        match &mut self.phase {
            Phase::Connecting(item) => item.take(),
            _ => None,
        }
    }

    /// Take over `item` from another worker; gives it back if busy.
    pub(crate) fn adopt(&mut self, item: QueueItem) -> Result<(), QueueItem> {
        if !self.is_connected_idle() {
            return Err(item);
        }
        if let Err(e) = self.queue.reassign(item.id, self.id) {
            log::warn!("{}: cannot adopt {}: {}", self.id, item.id, e);
            return Err(item);
        }
        log::debug!("{}: adopted {}", self.id, item.id);
        self.begin(item);
        Ok(())
    }

    // ── Events ───────────────────────────────────────────────────

    pub fn handle(&mut self, epoch: Epoch, event: WorkerEvent) {
        if ControlConnection::routes(&event) {
            let events = self.conn.handle(epoch, event, &mut self.out);
            self.dispatch(events);
            return;
        }
        match event {
            WorkerEvent::Timer(TimerKind::DataIdle) => {
                if self.timers.fired(TimerKind::DataIdle, epoch) {
                    self.with_job(|_, _| {
                        Flow::Finish(Outcome::Transient(FtpError::timeout("no data transferred in time")))
                    });
                }
            }
            WorkerEvent::DiskDone(result) => {
                if !self.disk.matches(epoch) {
                    log::trace!("{}: stale disk completion {}", self.id, epoch);
                    return;
                }
                self.disk.clear();
                self.with_job(|w, job| w.on_disk(job, result));
            }
            other => {
                if !self.data.matches(epoch) {
                    log::trace!("{}: stale data event {}", self.id, epoch);
                    return;
                }
                self.with_job(|w, job| w.on_data(job, other));
            }
        }
    }

    fn dispatch(&mut self, events: Vec<ConnEvent>) {
        for ev in events {
            self.on_conn_event(ev);
        }
    }

    fn on_conn_event(&mut self, ev: ConnEvent) {
        match ev {
            ConnEvent::LoggedIn => match std::mem::replace(&mut self.phase, Phase::Preparing) {
                Phase::Connecting(Some(item)) | Phase::WaitingForReconnect(item) => self.start_job(item),
                Phase::Connecting(None) => {
                    self.phase = Phase::LookingForWork;
                    self.activate();
                }
                Phase::Stopped => {
                    self.phase = Phase::Stopped;
                    self.conn.quit(&mut self.out);
                }
                other => self.phase = other,
            },
            ConnEvent::Reply(reply) => self.with_job(|w, job| w.on_reply(job, reply)),
            ConnEvent::Retrying(err) => log::info!("{}: reconnecting after: {}", self.id, err),
            ConnEvent::Failed(err) => self.connection_failed(err),
            ConnEvent::Lost(err) => {
                if matches!(self.phase, Phase::Working(_)) {
                    self.with_job(|_, _| Flow::Finish(Outcome::Lost(err)));
                } else {
                    log::info!("{}: idle connection lost: {}", self.id, err);
                }
            }
            ConnEvent::Closed => log::debug!("{}: idle connection closed", self.id),
        }
    }

    fn connection_failed(&mut self, err: FtpError) {
        let item = match std::mem::replace(&mut self.phase, Phase::ConnectionError) {
            Phase::Connecting(item) => item,
            Phase::WaitingForReconnect(item) => Some(item),
            other => {
                self.phase = other;
                log::debug!("{}: connection failure while {}: {}", self.id, self.state().name(), err);
                return;
            }
        };
        if let Some(item) = item {
            self.give_back(item.id);
        }
        let seq = self.queue.next_error_seq();
        log::warn!("{}: cannot connect: {}", self.id, err);
        self.error = Some(WorkerError {
            message: err.to_string(),
            seq,
        });
    }

    fn begin(&mut self, item: QueueItem) {
        self.phase = Phase::Preparing;
        self.idle_marked = false;
        self.conn.idle_ended(&mut self.out);
        log::debug!("{}: preparing {} ({})", self.id, item.id, item.kind.label());
        if !item.kind.needs_connection() || self.conn.is_logged_in() {
            self.start_job(item);
        } else {
            self.phase = Phase::Connecting(Some(item));
            let events = self.conn.connect(&mut self.out);
            self.dispatch(events);
        }
    }

    fn start_job(&mut self, item: QueueItem) {
        // forced action and local target may have changed since it was taken
        let item = self.queue.item(item.id).unwrap_or(item);
        log::info!("{}: {} {}", self.id, item.id, item.kind.label());
        self.progress = TransferStatus {
            bytes_done: 0,
            bytes_total: match &item.kind {
                ItemKind::DownloadFile { size, .. } => *size,
                _ => None,
            },
            speed_bps: 0,
        };
        self.progress_base = 0;
        self.transfer_started = None;
        let plan = plan_for(&item, &self.engine);
        self.settle(Job::new(item, plan), Flow::Next);
    }

    fn go_idle(&mut self) {
        // more work may appear while others are still busy
        self.phase = if self.queue.counts().is_settled() {
            Phase::LookingForWork
        } else {
            Phase::Sleeping
        };
        if !self.idle_marked {
            self.idle_marked = true;
            self.idle_since = Instant::now();
            self.conn.idle_started(&mut self.out);
        }
    }

    fn give_back(&mut self, id: ItemId) {
        if let Err(e) = self.queue.return_to_waiting(id) {
            log::error!("{}: cannot return {} to the queue: {}", self.id, id, e);
        }
    }

    // ── Job driver ───────────────────────────────────────────────

    fn with_job(&mut self, f: impl FnOnce(&mut Self, &mut Job) -> Flow) {
        let mut job = match std::mem::replace(&mut self.phase, Phase::Preparing) {
            Phase::Working(job) => job,
            other => {
                self.phase = other;
                return;
            }
        };
        let flow = f(self, &mut job);
        self.settle(job, flow);
    }

    fn settle(&mut self, mut job: Job, mut flow: Flow) {
        loop {
            match flow {
                Flow::Wait => {
                    self.phase = Phase::Working(job);
                    return;
                }
                Flow::Next => flow = self.perform_next(&mut job),
                Flow::Finish(outcome) => {
                    self.finish(job, outcome);
                    return;
                }
            }
        }
    }

    fn perform_next(&mut self, job: &mut Job) -> Flow {
        job.wait = Wait::Idle;
        if self.stop_requested {
            return Flow::Finish(Outcome::Stopped);
        }
        if self.paused {
            job.wait = Wait::Paused;
            return Flow::Wait;
        }
        match job.plan.pop_front() {
            Some(step) => self.perform(job, step),
            None => Flow::Finish(Outcome::Done),
        }
    }

    fn perform(&mut self, job: &mut Job, step: Step) -> Flow {
        match step {
            Step::Cwd(dir) => {
                if self.conn.cwd() == Some(dir.as_str()) {
                    return Flow::Next;
                }
                self.send(job, format!("CWD {}", dir), Wait::Reply(ReplyFor::Cwd(dir)))
            }
            Step::Type(t) => {
                if self.conn.transfer_type() == Some(t) {
                    return Flow::Next;
                }
                self.send(job, t.command().to_string(), Wait::Reply(ReplyFor::Type(t)))
            }
            Step::OpenData => {
                if self.conn.config().passive {
                    return self.send(job, "PASV".into(), Wait::Reply(ReplyFor::Pasv));
                }
                let Some(local) = self.conn.local_addr() else {
                    return Flow::Finish(Outcome::Lost(FtpError::disconnected("control connection is gone")));
                };
                let epoch = self.out.issue();
                self.data.set(epoch);
                self.out.push(Action::ListenData {
                    epoch,
                    bind_ip: local.ip(),
                    tls: self.conn.tls_active(),
                });
                self.timers.arm(&mut self.out, TimerKind::DataIdle, self.engine.data_timeout());
                job.wait = Wait::DataListen;
                Flow::Wait
            }
            Step::Rest(offset) => self.send(job, format!("REST {}", offset), Wait::Reply(ReplyFor::Rest)),
            Step::Transfer(kind, command) => {
                let (offset, write_from) = job.resume.unwrap_or((0, 0));
                job.transfer = Some(Transfer::new(kind, job.data_ready, offset, write_from));
                job.data_ready = false;
                self.progress.bytes_done = offset;
                self.progress_base = offset;
                self.transfer_started = Some(Instant::now());
                self.send(job, command, Wait::Transfer)
            }
            Step::Command(command, purpose) => self.send(job, command, Wait::Reply(ReplyFor::Command(purpose))),
            Step::Disk(work, purpose) => {
                self.submit(work);
                job.wait = Wait::Disk(purpose);
                Flow::Wait
            }
        }
    }

    fn send(&mut self, job: &mut Job, line: String, wait: Wait) -> Flow {
        match self.conn.send_command(&mut self.out, &line) {
            Ok(()) => {
                job.wait = wait;
                Flow::Wait
            }
            Err(e) => Flow::Finish(Outcome::Lost(e)),
        }
    }

    fn submit(&mut self, work: DiskWork) {
        let epoch = self.out.issue();
        self.disk.set(epoch);
        self.out.push(Action::SubmitDisk { epoch, work });
    }

    fn rearm_data_idle(&mut self) {
        self.timers.arm(&mut self.out, TimerKind::DataIdle, self.engine.data_timeout());
    }

    // ── Replies ──────────────────────────────────────────────────

    fn on_reply(&mut self, job: &mut Job, reply: FtpResponse) -> Flow {
        match std::mem::replace(&mut job.wait, Wait::Idle) {
            Wait::Reply(what) => self.on_command_reply(job, what, reply),
            Wait::Transfer => {
                job.wait = Wait::Transfer;
                self.on_transfer_reply(job, reply)
            }
            other => {
                job.wait = other;
                log::debug!("{}: unexpected reply {}", self.id, reply.code);
                Flow::Wait
            }
        }
    }

    fn on_command_reply(&mut self, job: &mut Job, what: ReplyFor, reply: FtpResponse) -> Flow {
        if reply.is_preliminary() {
            job.wait = Wait::Reply(what);
            return Flow::Wait;
        }
        match what {
            ReplyFor::Cwd(dir) if reply.is_completion() => {
                self.conn.set_cwd(Some(dir));
                Flow::Next
            }
            ReplyFor::Type(t) if reply.is_completion() => {
                self.conn.set_transfer_type(Some(t));
                Flow::Next
            }
            ReplyFor::Pasv if reply.code == 227 => match parse_pasv(&reply.text()) {
                Some(pasv) => {
                    let epoch = self.out.issue();
                    self.data.set(epoch);
                    self.out.push(Action::OpenData {
                        epoch,
                        addr: pasv.socket_addr(),
                        tls: self.conn.tls_active(),
                    });
                    self.rearm_data_idle();
                    job.wait = Wait::DataConnect;
                    Flow::Wait
                }
                None => Flow::Finish(Outcome::Transient(FtpError::protocol_error(format!(
                    "cannot parse PASV reply: {}",
                    reply.text()
                )))),
            },
            ReplyFor::Port if reply.is_completion() => Flow::Next,
            ReplyFor::Rest if reply.code == 350 || reply.is_completion() => Flow::Next,
            ReplyFor::Rest if job.can_overwrite => {
                log::info!("{}: server cannot resume, overwriting", self.id);
                self.force_overwrite(job)
            }
            ReplyFor::Rest => Flow::Finish(Outcome::Failed(FtpError::from_reply(
                reply.code,
                &format!("unable to resume: {}", reply.text()),
            ))),
            ReplyFor::Command(Purpose::Mkd { path, join }) => {
                if reply.is_completion() {
                    Flow::Next
                } else if join && reply.code / 100 == 5 {
                    let error = FtpError::from_reply(reply.code, &reply.text());
                    job.plan
                        .push_front(Step::Command(format!("CWD {}", path), Purpose::MkdCheck { path, error }));
                    Flow::Next
                } else {
                    reply_failure(&reply)
                }
            }
            ReplyFor::Command(Purpose::MkdCheck { path, error }) => {
                if reply.is_completion() {
                    log::debug!("{}: {} already exists", self.id, path);
                    self.conn.set_cwd(Some(path));
                    Flow::Next
                } else {
                    Flow::Finish(Outcome::Failed(error))
                }
            }
            ReplyFor::Command(Purpose::Plain) if reply.is_completion() => Flow::Next,
            _ => reply_failure(&reply),
        }
    }

    fn on_transfer_reply(&mut self, job: &mut Job, reply: FtpResponse) -> Flow {
        let Some(t) = job.transfer.as_mut() else {
            return Flow::Wait;
        };
        if reply.is_preliminary() {
            t.started = true;
            self.rearm_data_idle();
            return self.pump(job);
        }
        if reply.is_completion() {
            t.started = true;
            t.finished = true;
            return self.pump(job);
        }
        reply_failure(&reply)
    }

    // ── Data connection ──────────────────────────────────────────

    fn on_data(&mut self, job: &mut Job, event: WorkerEvent) -> Flow {
        match event {
            WorkerEvent::DataListening(addr) => {
                if !matches!(job.wait, Wait::DataListen) {
                    return Flow::Wait;
                }
                match addr {
                    SocketAddr::V4(v4) => self.send(job, port_command(v4), Wait::Reply(ReplyFor::Port)),
                    SocketAddr::V6(_) => Flow::Finish(Outcome::Failed(FtpError::protocol_error(
                        "active mode needs an IPv4 control connection",
                    ))),
                }
            }
            WorkerEvent::DataConnected => {
                if matches!(job.wait, Wait::DataConnect) {
                    job.data_ready = true;
                    return Flow::Next;
                }
                match job.transfer.as_mut() {
                    Some(t) => {
                        t.data_open = true;
                        self.rearm_data_idle();
                        self.pump(job)
                    }
                    None => {
                        job.data_ready = true;
                        Flow::Wait
                    }
                }
            }
            WorkerEvent::DataConnectFailed(e) => Flow::Finish(Outcome::Transient(e)),
            WorkerEvent::DataReceived(bytes) => {
                let Some(t) = job.transfer.as_mut() else {
                    return Flow::Wait;
                };
                self.progress.bytes_done += bytes.len() as u64;
                t.buffer.extend_from_slice(&bytes);
                self.rearm_data_idle();
                self.pump(job)
            }
            WorkerEvent::DataWritten(_) => {
                if let Some(t) = job.transfer.as_mut() {
                    t.sending = false;
                }
                self.rearm_data_idle();
                self.pump(job)
            }
            WorkerEvent::DataClosed(Some(e)) => Flow::Finish(Outcome::Transient(e)),
            WorkerEvent::DataClosed(None) => {
                self.data.clear();
                match job.transfer.as_mut() {
                    Some(t) => {
                        t.data_closed = true;
                        self.pump(job)
                    }
                    None => Flow::Finish(Outcome::Transient(FtpError::disconnected(
                        "data connection closed before the transfer",
                    ))),
                }
            }
            _ => Flow::Wait,
        }
    }

    /// Move the transfer forward: read or write the next chunk and finish
    /// once the reply, the data connection and the disk all agree.
    fn pump(&mut self, job: &mut Job) -> Flow {
        let ascii = job.ascii();
        let Some(t) = job.transfer.as_mut() else {
            return Flow::Wait;
        };
        let chunk = self.engine.flush_buffer_size.max(1);
        match t.kind {
            TransferKind::Upload => {
                if t.started && t.data_open && !t.eof && !t.sending && !self.disk.is_live() {
                    if let Some(file) = job.file.take() {
                        self.submit(DiskWork::ReadFile {
                            file,
                            size: chunk,
                            ascii,
                            prev_cr: t.prev_cr,
                        });
                    }
                }
            }
            TransferKind::Download => {
                let flush = t.buffer.len() >= chunk || (t.data_closed && !t.buffer.is_empty());
                if flush && !self.disk.is_live() {
                    if let Some(file) = job.file.take() {
                        let data = std::mem::take(&mut t.buffer);
                        t.inflight = data.len();
                        self.submit(DiskWork::CheckOrWriteFile {
                            file,
                            check_from: t.offset,
                            write_from: t.write_from.max(t.offset),
                            data,
                        });
                    }
                }
            }
            TransferKind::Listing => {}
        }

        let drained = match t.kind {
            TransferKind::Upload => t.eof,
            TransferKind::Download => t.buffer.is_empty(),
            TransferKind::Listing => true,
        };
        if t.finished && t.data_closed && drained && !self.disk.is_live() {
            self.transfer_complete(job)
        } else {
            Flow::Wait
        }
    }

    fn transfer_complete(&mut self, job: &mut Job) -> Flow {
        let Some(t) = job.transfer.take() else {
            return Flow::Next;
        };
        self.timers.cancel(&mut self.out, TimerKind::DataIdle);
        match t.kind {
            TransferKind::Upload => {
                if let Some(file) = job.file.take() {
                    self.out.push(Action::CloseFile(FileClose::new(file)));
                }
                Flow::Next
            }
            TransferKind::Download => {
                if let Some(file) = job.file.take() {
                    let mut close = FileClose::new(file);
                    close.truncate_to = Some(t.offset);
                    close.modified = job.modified();
                    self.out.push(Action::CloseFile(close));
                }
                job.created_target = false;
                Flow::Next
            }
            TransferKind::Listing => {
                let text = String::from_utf8_lossy(&t.buffer);
                let listing = parse_listing(&text);
                log::debug!("{}: listing with {} entries", self.id, listing.len());
                self.listing_complete(job, listing)
            }
        }
    }

    fn listing_complete(&mut self, job: &mut Job, listing: Vec<FtpEntry>) -> Flow {
        match &job.item.kind {
            ItemKind::ListDir { .. } => match self.queue.set_listing(job.item.id, listing) {
                Ok(()) => Flow::Next,
                Err(e) => Flow::Finish(Outcome::Failed(e)),
            },
            ItemKind::ExploreRemoteDir {
                remote_dir,
                name,
                purpose,
            } => {
                let (children, after) =
                    remote_children(remote_dir, name, &listing, purpose, job.local_dir.as_deref());
                self.expand(job, children, after)
            }
            _ => Flow::Next,
        }
    }

    fn expand(&mut self, job: &Job, children: Vec<ItemKind>, after: Option<ItemKind>) -> Flow {
        match self.queue.expand(job.item.id, children, after) {
            Ok(ids) => {
                log::debug!("{}: {} expanded into {} items", self.id, job.item.id, ids.len());
                Flow::Finish(Outcome::Expanded)
            }
            Err(e) => Flow::Finish(Outcome::Failed(e)),
        }
    }

    // ── Disk ─────────────────────────────────────────────────────

    fn on_disk(&mut self, job: &mut Job, result: DiskResult) -> Flow {
        match std::mem::replace(&mut job.wait, Wait::Idle) {
            Wait::Transfer => {
                job.wait = Wait::Transfer;
                self.on_transfer_disk(job, result)
            }
            Wait::Disk(purpose) => self.on_step_disk(job, purpose, result),
            other => {
                job.wait = other;
                log::debug!("{}: unexpected disk completion", self.id);
                Flow::Wait
            }
        }
    }

    fn on_transfer_disk(&mut self, job: &mut Job, result: DiskResult) -> Flow {
        match result {
            Ok(DiskOutcome::Read {
                file,
                data,
                eof,
                last_cr,
                ..
            }) => {
                job.file = Some(file);
                let Some(t) = job.transfer.as_mut() else {
                    return Flow::Wait;
                };
                t.prev_cr = last_cr;
                let Some(epoch) = self.data.get() else {
                    return Flow::Wait;
                };
                if eof {
                    t.eof = true;
                    self.out.push(Action::FinishData { epoch });
                } else {
                    t.sending = true;
                    self.progress.bytes_done += data.len() as u64;
                    self.out.push(Action::SendData { epoch, data });
                }
                self.pump(job)
            }
            Ok(DiskOutcome::Written { file, .. }) => {
                job.file = Some(file);
                if let Some(t) = job.transfer.as_mut() {
                    t.offset += t.inflight as u64;
                    t.inflight = 0;
                }
                self.pump(job)
            }
            Ok(other) => Flow::Finish(Outcome::Failed(FtpError::protocol_error(format!(
                "unexpected disk result during transfer: {:?}",
                other
            )))),
            Err(problem) => self.disk_problem(job, problem),
        }
    }

    fn on_step_disk(&mut self, job: &mut Job, purpose: DiskFor, result: DiskResult) -> Flow {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(problem) => return self.disk_problem(job, problem),
        };
        match (purpose, outcome) {
            (_, DiskOutcome::Skipped) => Flow::Finish(Outcome::Skipped),
            (DiskFor::OpenSource, DiskOutcome::Opened { file, size }) => {
                job.file = Some(file);
                self.progress.bytes_total = Some(size);
                Flow::Next
            }
            (
                DiskFor::CreateTarget,
                DiskOutcome::FileReady {
                    file,
                    size,
                    mode,
                    can_overwrite,
                },
            ) => {
                job.file = Some(file);
                let resumed = mode == FileOpenMode::Resumed;
                job.created_target = !resumed;
                job.can_overwrite = can_overwrite;
                let target = if resumed {
                    LocalTarget::Resumed
                } else {
                    LocalTarget::Created
                };
                if let Err(e) = self.queue.set_local_target(job.item.id, target) {
                    return Flow::Finish(Outcome::Failed(e));
                }
                if resumed {
                    let rest = size.saturating_sub(self.engine.resume_overlap);
                    log::debug!("{}: resuming at {} (local size {})", self.id, rest, size);
                    job.resume = Some((rest, size));
                    if rest > 0 {
                        let at = job
                            .plan
                            .iter()
                            .position(|s| matches!(s, Step::Transfer(..)))
                            .unwrap_or(job.plan.len());
                        job.plan.insert(at, Step::Rest(rest));
                    }
                }
                Flow::Next
            }
            (DiskFor::CreateLocalDir, DiskOutcome::DirReady { path }) => {
                job.local_dir = Some(path);
                Flow::Next
            }
            (DiskFor::ListLocal, DiskOutcome::Listing(entries)) => match &job.item.kind {
                ItemKind::ExploreLocalDir {
                    local,
                    remote_dir,
                    name,
                    is_move,
                } => {
                    let (children, after) = local_children(local, &join_remote(remote_dir, name), &entries, *is_move);
                    self.expand(job, children, after)
                }
                _ => Flow::Next,
            },
            (DiskFor::DeleteLocal, DiskOutcome::Deleted) => Flow::Next,
            (purpose, other) => Flow::Finish(Outcome::Failed(FtpError::protocol_error(format!(
                "unexpected disk result for {:?}: {:?}",
                purpose, other
            )))),
        }
    }

    fn disk_problem(&mut self, job: &mut Job, mut problem: DiskProblem) -> Flow {
        if let Some(file) = problem.file.take() {
            job.file = Some(file);
        }
        log::warn!("{}: disk: {}", self.id, problem);
        if problem.kind == DiskProblemKind::ResumeVerificationFailed && job.can_overwrite {
            return self.force_overwrite(job);
        }
        if problem.prompt {
            Flow::Finish(Outcome::NeedsInput(problem.kind, problem.message))
        } else {
            Flow::Finish(Outcome::Failed(problem.to_error()))
        }
    }

    /// Give up on resuming: the next attempt truncates the local file.
    fn force_overwrite(&mut self, job: &mut Job) -> Flow {
        match self.queue.set_forced(job.item.id, ForcedAction::Overwrite) {
            Ok(()) => Flow::Finish(Outcome::Retry),
            Err(e) => Flow::Finish(Outcome::Failed(e)),
        }
    }

    // ── Ending a job ─────────────────────────────────────────────

    fn teardown(&mut self, job: &mut Job, ok: bool) {
        if self.data.clear().is_some() {
            self.out.push(Action::CloseData);
        }
        self.timers.cancel(&mut self.out, TimerKind::DataIdle);
        if self.disk.clear().is_some() {
            self.out.push(Action::CancelDisk);
        }
        if let Some(file) = job.file.take() {
            let mut close = FileClose::new(file);
            close.delete_if_empty = !ok && job.created_target;
            self.out.push(Action::CloseFile(close));
        }
        if self.conn.is_logged_in() && !self.conn.is_ready() {
            // a reply is still due; the channel is out of step
            self.conn.close(&mut self.out);
        }
        self.transfer_started = None;
    }

    fn finish(&mut self, mut job: Job, outcome: Outcome) {
        let id = job.item.id;
        let ok = matches!(outcome, Outcome::Done | Outcome::Skipped | Outcome::Expanded);
        self.teardown(&mut job, ok);

        let result = match outcome {
            Outcome::Done => self.queue.set_done(id).map(|_| log::info!("{}: {} done", self.id, id)),
            Outcome::Skipped => self.queue.set_skipped(id),
            Outcome::Expanded => Ok(()),
            Outcome::Failed(err) => self.fail(id, err),
            Outcome::Transient(err) => match self.queue.record_attempt(id) {
                Ok(n) if n > self.engine.connect_retries => self.fail(id, err),
                Ok(n) => {
                    log::warn!("{}: {} attempt {} failed: {}", self.id, id, n, err);
                    self.queue.return_to_waiting(id)
                }
                Err(e) => Err(e),
            },
            Outcome::NeedsInput(problem, message) => self
                .queue
                .set_needs_input(id, Some(problem), &message)
                .map(|seq| self.record(message, seq)),
            Outcome::Retry => self.queue.return_to_waiting(id),
            Outcome::Stopped => {
                self.give_back(id);
                self.stop_requested = false;
                self.conn.quit(&mut self.out);
                self.phase = Phase::Stopped;
                log::info!("{}: stopped, {} returned to the queue", self.id, id);
                return;
            }
            Outcome::Lost(err) => match self.queue.record_attempt(id) {
                Ok(n) if n > self.engine.connect_retries => self.fail(id, err),
                Ok(n) => {
                    log::info!("{}: {} interrupted by lost connection (attempt {}): {}", self.id, id, n, err);
                    self.phase = Phase::WaitingForReconnect(job.item);
                    let events = self.conn.connect(&mut self.out);
                    self.dispatch(events);
                    return;
                }
                Err(e) => Err(e),
            },
        };
        if let Err(e) = result {
            log::error!("{}: queue update for {} failed: {}", self.id, id, e);
        }
        self.phase = Phase::LookingForWork;
        self.activate();
    }

    fn fail(&mut self, id: ItemId, err: FtpError) -> Result<(), FtpError> {
        let seq = self.queue.set_failed(id, &err)?;
        self.record(err.to_string(), seq);
        Ok(())
    }

    fn record(&mut self, message: String, seq: u64) {
        self.error = Some(WorkerError { message, seq });
    }
}

fn reply_failure(reply: &FtpResponse) -> Flow {
    let err = FtpError::from_reply(reply.code, &reply.text());
    if reply.code / 100 == 4 {
        Flow::Finish(Outcome::Transient(err))
    } else {
        Flow::Finish(Outcome::Failed(err))
    }
}

fn wait_name(job: &Job) -> &'static str {
    match &job.wait {
        Wait::Idle => "between steps",
        Wait::Reply(ReplyFor::Cwd(_)) => "waiting for CWD reply",
        Wait::Reply(ReplyFor::Type(_)) => "waiting for TYPE reply",
        Wait::Reply(ReplyFor::Pasv) => "waiting for PASV reply",
        Wait::Reply(ReplyFor::Port) => "waiting for PORT reply",
        Wait::Reply(ReplyFor::Rest) => "waiting for REST reply",
        Wait::Reply(ReplyFor::Command(_)) => "waiting for command reply",
        Wait::DataListen => "waiting for data listen",
        Wait::DataConnect => "waiting for data connection",
        Wait::Transfer => match job.transfer.as_ref().map(|t| t.kind) {
            Some(TransferKind::Listing) => "listing",
            Some(TransferKind::Upload) => "uploading",
            _ => "downloading",
        },
        Wait::Disk(_) => "waiting for disk",
        Wait::Paused => "paused",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::disk;
    use crate::ftp::types::ItemState;
    use std::collections::HashMap;

    struct Rig {
        worker: Worker,
        queue: Arc<OperationQueue>,
        control: Option<Epoch>,
        data: Option<Epoch>,
        timers: HashMap<TimerKind, Epoch>,
        sent: Vec<String>,
        names: Vec<&'static str>,
        pending_disk: Option<(Epoch, DiskWork)>,
    }

    impl Rig {
        fn new() -> Self {
            let queue = Arc::new(OperationQueue::new());
            let config = ConnectionConfig {
                host: "ftp.example".into(),
                user: Some("bob".into()),
                password: Some("pw".into()),
                ..Default::default()
            };
            let worker = Worker::new(
                WorkerId(0),
                Arc::clone(&queue),
                Arc::new(EngineConfig {
                    connect_retries: 1,
                    ..Default::default()
                }),
                config,
                Arc::new(CertificateCache::new()),
            );
            Self {
                worker,
                queue,
                control: None,
                data: None,
                timers: HashMap::new(),
                sent: Vec::new(),
                names: Vec::new(),
                pending_disk: None,
            }
        }

        fn absorb(&mut self) {
            for action in self.worker.drain_actions() {
                self.names.push(action.name());
                match action {
                    Action::Resolve { epoch, .. } | Action::OpenControl { epoch, .. } => self.control = Some(epoch),
                    Action::SendControl { line, .. } => self.sent.push(line),
                    Action::OpenData { epoch, .. } | Action::ListenData { epoch, .. } => self.data = Some(epoch),
                    Action::ArmTimer { epoch, kind, .. } => {
                        self.timers.insert(kind, epoch);
                    }
                    Action::CancelTimer { kind } => {
                        self.timers.remove(&kind);
                    }
                    Action::SubmitDisk { epoch, work } => self.pending_disk = Some((epoch, work)),
                    _ => {}
                }
            }
        }

        fn activate(&mut self) {
            self.worker.activate();
            self.absorb();
        }

        fn control_event(&mut self, event: WorkerEvent) {
            let epoch = self.control.unwrap();
            self.worker.handle(epoch, event);
            self.absorb();
        }

        fn reply(&mut self, text: &str) {
            self.control_event(WorkerEvent::ControlData(format!("{}\r\n", text).into_bytes()));
        }

        fn data_event(&mut self, event: WorkerEvent) {
            let epoch = self.data.unwrap();
            self.worker.handle(epoch, event);
            self.absorb();
        }

        fn run_disk(&mut self) {
            let (epoch, work) = self.pending_disk.take().unwrap();
            self.worker.handle(epoch, WorkerEvent::DiskDone(disk::execute(work)));
            self.absorb();
        }

        fn login(&mut self) {
            self.control_event(WorkerEvent::Resolved(Ok("127.0.0.1:21".parse().unwrap())));
            self.control_event(WorkerEvent::ControlConnected {
                local_addr: "127.0.0.1:40000".parse().unwrap(),
            });
            self.reply("220 hi");
            self.reply("331 pw");
            self.reply("230 in");
        }

        fn last_sent(&self) -> &str {
            self.sent.last().map(String::as_str).unwrap_or("")
        }

        fn state(&self, id: ItemId) -> ItemState {
            self.queue.item(id).unwrap().state
        }
    }

    fn mkdir(name: &str, join: bool) -> ItemKind {
        ItemKind::CreateDir {
            remote_dir: "/".into(),
            name: name.into(),
            join_existing: join,
        }
    }

    #[test]
    fn test_create_dir_then_idle() {
        let mut rig = Rig::new();
        let id = rig.queue.add(mkdir("a", false));
        rig.activate();
        assert_eq!(rig.worker.state(), WorkerState::Connecting);
        rig.login();
        assert_eq!(rig.worker.state(), WorkerState::Working);
        assert_eq!(rig.last_sent(), "CWD /");
        rig.reply("250 ok");
        assert_eq!(rig.last_sent(), "MKD a");
        rig.reply("257 \"/a\" created");
        assert_eq!(rig.state(id), ItemState::Done);
        assert_eq!(rig.worker.state(), WorkerState::LookingForWork);
        assert!(rig.worker.control().is_logged_in());
    }

    #[test]
    fn test_existing_dir_is_joined() {
        let mut rig = Rig::new();
        let id = rig.queue.add(mkdir("a", true));
        rig.activate();
        rig.login();
        rig.reply("250 ok");
        rig.reply("550 exists");
        assert_eq!(rig.last_sent(), "CWD /a");
        rig.reply("250 ok");
        assert_eq!(rig.state(id), ItemState::Done);
    }

    #[test]
    fn test_cwd_is_cached_between_items() {
        let mut rig = Rig::new();
        rig.queue.add(mkdir("a", false));
        rig.queue.add(mkdir("b", false));
        rig.activate();
        rig.login();
        rig.reply("250 ok");
        rig.reply("257 ok");
        assert_eq!(rig.last_sent(), "MKD b");
        assert_eq!(rig.sent.iter().filter(|l| l.starts_with("CWD")).count(), 1);
    }

    #[test]
    fn test_permanent_failure_records_error_sequence() {
        let mut rig = Rig::new();
        let id = rig.queue.add(ItemKind::DeleteFile {
            remote_dir: "/".into(),
            name: "x".into(),
        });
        rig.activate();
        rig.login();
        rig.reply("250 ok");
        rig.reply("550 no such file");
        let item = rig.queue.item(id).unwrap();
        assert_eq!(item.state, ItemState::Failed);
        let err = rig.worker.error().unwrap();
        assert_eq!(Some(err.seq), item.error_seq);
        assert!(err.message.contains("550"));
    }

    #[test]
    fn test_transient_failure_is_retried_then_fails() {
        let mut rig = Rig::new();
        let id = rig.queue.add(ItemKind::DeleteDir {
            remote_dir: "/".into(),
            name: "d".into(),
        });
        rig.activate();
        rig.login();
        rig.reply("250 ok");
        rig.reply("450 busy");
        // retried right away by the same worker
        assert_eq!(rig.queue.item(id).unwrap().attempts, 1);
        assert_eq!(rig.last_sent(), "RMD d");
        rig.reply("450 busy");
        assert_eq!(rig.state(id), ItemState::Failed);
    }

    #[test]
    fn test_lost_connection_reconnects_and_restarts_item() {
        let mut rig = Rig::new();
        let id = rig.queue.add(mkdir("a", false));
        rig.activate();
        rig.login();
        rig.reply("421 timeout");
        assert_eq!(rig.worker.state(), WorkerState::WaitingForReconnect);
        assert_eq!(rig.names.iter().filter(|n| **n == "OpenControl").count(), 2);
        rig.control_event(WorkerEvent::ControlConnected {
            local_addr: "127.0.0.1:40001".parse().unwrap(),
        });
        rig.reply("220 hi");
        rig.reply("331 pw");
        rig.reply("230 in");
        assert_eq!(rig.last_sent(), "CWD /");
        rig.reply("250 ok");
        rig.reply("257 ok");
        assert_eq!(rig.state(id), ItemState::Done);
    }

    #[test]
    fn test_stop_waits_for_command_boundary() {
        let mut rig = Rig::new();
        let id = rig.queue.add(mkdir("a", false));
        rig.activate();
        rig.login();
        rig.worker.stop();
        rig.absorb();
        assert_eq!(rig.worker.state(), WorkerState::Working);
        assert!(rig.worker.is_stopping());
        rig.reply("250 ok");
        assert_eq!(rig.worker.state(), WorkerState::Stopped);
        assert_eq!(rig.state(id), ItemState::Waiting);
        assert_eq!(rig.last_sent(), "QUIT");
    }

    #[test]
    fn test_pause_parks_at_boundary() {
        let mut rig = Rig::new();
        let id = rig.queue.add(mkdir("a", false));
        rig.activate();
        rig.login();
        rig.worker.pause(true);
        rig.reply("250 ok");
        assert_eq!(rig.worker.status().substate.as_deref(), Some("paused"));
        assert_eq!(rig.last_sent(), "CWD /");
        rig.worker.pause(false);
        rig.absorb();
        assert_eq!(rig.last_sent(), "MKD a");
        rig.reply("257 ok");
        assert_eq!(rig.state(id), ItemState::Done);
    }

    #[test]
    fn test_download_writes_file_and_stale_disk_result_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new();
        let id = rig.queue.add(ItemKind::DownloadFile {
            remote_dir: "/pub".into(),
            name: "f.bin".into(),
            local_dir: dir.path().to_path_buf(),
            local_name: "f.bin".into(),
            size: Some(5),
            modified: None,
            is_move: false,
            transfer_type: TransferType::Binary,
        });
        rig.activate();
        rig.login();
        rig.run_disk();
        assert_eq!(rig.last_sent(), "CWD /pub");
        rig.reply("250 ok");
        assert_eq!(rig.last_sent(), "TYPE I");
        rig.reply("200 ok");
        assert_eq!(rig.last_sent(), "PASV");
        rig.reply("227 Entering Passive Mode (127,0,0,1,4,1)");
        assert!(rig.names.contains(&"OpenData"));
        rig.data_event(WorkerEvent::DataConnected);
        assert_eq!(rig.last_sent(), "RETR f.bin");
        rig.reply("150 opening");
        rig.data_event(WorkerEvent::DataReceived(b"hello".to_vec()));
        rig.data_event(WorkerEvent::DataClosed(None));
        // a completion with an old epoch changes nothing
        let stale = rig.control.unwrap();
        rig.worker
            .handle(stale, WorkerEvent::DiskDone(Ok(DiskOutcome::Deleted)));
        rig.run_disk();
        rig.reply("226 done");
        assert_eq!(rig.state(id), ItemState::Done);
        let close = rig.names.iter().filter(|n| **n == "CloseFile").count();
        assert_eq!(close, 1);
        assert_eq!(std::fs::read(dir.path().join("f.bin")).unwrap(), b"hello");
        assert_eq!(rig.queue.item(id).unwrap().local_target, LocalTarget::Created);
    }

    /// Start a download over a 20000-byte local file, up to the REST command.
    fn resume_download(rig: &mut Rig, dir: &std::path::Path, forced: ForcedAction) -> ItemId {
        std::fs::write(dir.join("f"), vec![7u8; 20_000]).unwrap();
        let id = rig.queue.add(ItemKind::DownloadFile {
            remote_dir: "/".into(),
            name: "f".into(),
            local_dir: dir.to_path_buf(),
            local_name: "f".into(),
            size: None,
            modified: None,
            is_move: false,
            transfer_type: TransferType::Binary,
        });
        rig.queue.set_forced(id, forced).unwrap();
        rig.activate();
        rig.login();
        rig.run_disk();
        rig.reply("250 ok");
        rig.reply("200 ok");
        rig.reply("227 ok (127,0,0,1,4,1)");
        rig.data_event(WorkerEvent::DataConnected);
        assert_eq!(rig.last_sent(), "REST 10000");
        id
    }

    #[test]
    fn test_rest_rejected_under_resume_fails_and_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new();
        let id = resume_download(&mut rig, dir.path(), ForcedAction::Resume);
        rig.reply("502 not implemented");
        let item = rig.queue.item(id).unwrap();
        assert_eq!(item.state, ItemState::Failed);
        assert_eq!(item.forced, ForcedAction::Resume);
        assert!(item.error.unwrap().contains("unable to resume"));
        assert!(rig.names.contains(&"CloseData"));
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), vec![7u8; 20_000]);
    }

    #[test]
    fn test_rest_rejected_under_resume_or_overwrite_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new();
        let id = resume_download(&mut rig, dir.path(), ForcedAction::ResumeOrOverwrite);
        rig.reply("502 not implemented");
        let item = rig.queue.item(id).unwrap();
        assert_eq!(item.forced, ForcedAction::Overwrite);
        // picked up again right away
        assert_eq!(item.state, ItemState::Processing);
        assert!(rig.names.contains(&"CloseData"));
    }

    #[test]
    fn test_rest_accepts_completion_reply() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = Rig::new();
        let id = resume_download(&mut rig, dir.path(), ForcedAction::Resume);
        rig.reply("200 restarting at 10000");
        assert_eq!(rig.last_sent(), "RETR f");
        assert_eq!(rig.state(id), ItemState::Processing);
        assert_eq!(rig.queue.item(id).unwrap().forced, ForcedAction::Resume);
    }

    #[test]
    fn test_lost_connection_counts_as_attempt() {
        let mut rig = Rig::new();
        let id = rig.queue.add(mkdir("a", false));
        rig.activate();
        rig.login();
        rig.reply("421 timeout");
        assert_eq!(rig.queue.item(id).unwrap().attempts, 1);
        assert_eq!(rig.worker.state(), WorkerState::WaitingForReconnect);
        rig.control_event(WorkerEvent::ControlConnected {
            local_addr: "127.0.0.1:40001".parse().unwrap(),
        });
        rig.reply("220 hi");
        rig.reply("331 pw");
        rig.reply("230 in");
        rig.reply("421 timeout");
        // one retry allowed, the second loss fails the item
        assert_eq!(rig.state(id), ItemState::Failed);
    }

    #[test]
    fn test_remote_children_for_delete() {
        let listing = vec![
            FtpEntry {
                name: "sub".into(),
                kind: FtpEntryKind::Directory,
                size: 0,
                modified: None,
                permissions: None,
                link_target: None,
                facts: Default::default(),
            },
            FtpEntry {
                name: "a.txt".into(),
                kind: FtpEntryKind::File,
                size: 3,
                modified: None,
                permissions: None,
                link_target: None,
                facts: Default::default(),
            },
        ];
        let (children, after) = remote_children("/pub", "d", &listing, &ExplorePurpose::Delete, None);
        assert_eq!(children.len(), 2);
        assert!(matches!(&children[0], ItemKind::ExploreRemoteDir { remote_dir, name, .. }
            if remote_dir == "/pub/d" && name == "sub"));
        assert!(matches!(&children[1], ItemKind::DeleteFile { remote_dir, name }
            if remote_dir == "/pub/d" && name == "a.txt"));
        assert_eq!(
            after,
            Some(ItemKind::DeleteDir {
                remote_dir: "/pub".into(),
                name: "d".into()
            })
        );
    }

    #[test]
    fn test_local_children_for_move() {
        let entries = vec![
            LocalEntry {
                name: "x".into(),
                is_dir: true,
                size: 0,
            },
            LocalEntry {
                name: "y.txt".into(),
                is_dir: false,
                size: 4,
            },
        ];
        let (children, after) = local_children(Path::new("/tmp/src"), "/up/src", &entries, true);
        assert!(matches!(&children[0], ItemKind::ExploreLocalDir { name, .. } if name == "x"));
        assert!(matches!(&children[1], ItemKind::UploadFile { local, .. } if local == Path::new("/tmp/src/y.txt")));
        assert!(matches!(after, Some(ItemKind::DeleteLocalDir { .. })));
    }
}
