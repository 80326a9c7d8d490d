//! Background disk worker.
//!
//! All blocking filesystem calls of an operation run on one OS thread. Work
//! is posted as a [`DiskWork`] descriptor together with a completion sink and
//! executed in FIFO order. Deferred file closes live in a second queue that
//! is always drained first; each close gets a sequence number callers can
//! wait on.
//!
//! Open files travel inside the work descriptors and results, so the thread
//! that holds a [`LocalFile`] is the one responsible for releasing it. A
//! cancelled in-flight request has its result dropped on the disk thread.

use crate::ftp::error::{DiskProblemKind, FtpError, FtpResult};
use crate::ftp::types::{
    CannotCreatePolicy, DirExistsPolicy, DiskPolicies, FileExistsPolicy, ForcedAction, LocalEntry,
};
use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

/// Longest file name produced by autorename, in bytes.
pub const MAX_NAME_LEN: usize = 255;
/// Longest full path produced by autorename, in bytes.
pub const MAX_PATH_LEN: usize = 4096;
const MAX_AUTORENAME_ATTEMPTS: u32 = 10_000;

// ─── Work descriptors ────────────────────────────────────────────────

/// An open local file and the path it was opened at.
#[derive(Debug)]
pub struct LocalFile {
    pub file: File,
    pub path: PathBuf,
}

/// Why a file is being created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateFileMode {
    /// First attempt of a download.
    Initial,
    /// Retry into a file an earlier attempt created.
    RetryCreated,
    /// Retry into a file an earlier attempt resumed.
    RetryResumed,
}

#[derive(Debug)]
pub enum DiskWork {
    CreateDir {
        parent: PathBuf,
        name: String,
        policies: DiskPolicies,
        forced: ForcedAction,
    },
    CreateFile {
        dir: PathBuf,
        name: String,
        mode: CreateFileMode,
        policies: DiskPolicies,
        forced: ForcedAction,
        overlap: u64,
    },
    /// `data` starts at file offset `check_from`. Bytes before `write_from`
    /// must equal what is on disk; the rest is written.
    CheckOrWriteFile {
        file: LocalFile,
        check_from: u64,
        write_from: u64,
        data: Vec<u8>,
    },
    ListDir {
        path: PathBuf,
    },
    DeleteDir {
        path: PathBuf,
    },
    DeleteFile {
        path: PathBuf,
    },
    OpenFileForReading {
        path: PathBuf,
    },
    /// Read up to `size` bytes; `ascii` converts bare LF to CRLF.
    /// `prev_cr` tells whether the previous chunk ended with CR.
    ReadFile {
        file: LocalFile,
        size: usize,
        ascii: bool,
        prev_cr: bool,
    },
}

impl DiskWork {
    pub fn name(&self) -> &'static str {
        match self {
            DiskWork::CreateDir { .. } => "CreateDir",
            DiskWork::CreateFile { .. } => "CreateFile",
            DiskWork::CheckOrWriteFile { .. } => "CheckOrWriteFile",
            DiskWork::ListDir { .. } => "ListDir",
            DiskWork::DeleteDir { .. } => "DeleteDir",
            DiskWork::DeleteFile { .. } => "DeleteFile",
            DiskWork::OpenFileForReading { .. } => "OpenFileForReading",
            DiskWork::ReadFile { .. } => "ReadFile",
        }
    }

    /// The open file carried by the request, if any.
    pub fn into_file(self) -> Option<LocalFile> {
        match self {
            DiskWork::CheckOrWriteFile { file, .. } | DiskWork::ReadFile { file, .. } => Some(file),
            _ => None,
        }
    }
}

/// How a download target was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOpenMode {
    Created,
    Resumed,
    Overwritten,
}

#[derive(Debug)]
pub enum DiskOutcome {
    DirReady {
        path: PathBuf,
    },
    FileReady {
        file: LocalFile,
        size: u64,
        mode: FileOpenMode,
        /// A failed resume of this file may fall back to overwriting it.
        can_overwrite: bool,
    },
    Written {
        file: LocalFile,
        written: u64,
    },
    Listing(Vec<LocalEntry>),
    Deleted,
    Opened {
        file: LocalFile,
        size: u64,
    },
    Read {
        file: LocalFile,
        data: Vec<u8>,
        eof: bool,
        eols: u64,
        last_cr: bool,
    },
    /// The policy said skip.
    Skipped,
}

/// A failed disk request. `prompt` means the policy asks for a decision.
#[derive(Debug)]
pub struct DiskProblem {
    pub kind: DiskProblemKind,
    pub os_error: Option<i32>,
    pub message: String,
    pub prompt: bool,
    /// The file the request carried, handed back for closing.
    pub file: Option<LocalFile>,
}

impl DiskProblem {
    fn new(kind: DiskProblemKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            os_error: None,
            message: message.into(),
            prompt: false,
            file: None,
        }
    }

    fn from_io(kind: DiskProblemKind, path: &Path, e: &io::Error) -> Self {
        let kind = if e.kind() == ErrorKind::OutOfMemory {
            DiskProblemKind::OutOfMemory
        } else {
            kind
        };
        Self {
            os_error: e.raw_os_error(),
            ..Self::new(kind, format!("{}: {}", path.display(), e))
        }
    }

    fn prompting(mut self) -> Self {
        self.prompt = true;
        self
    }

    fn with_file(mut self, file: LocalFile) -> Self {
        self.file = Some(file);
        self
    }

    pub fn to_error(&self) -> FtpError {
        FtpError::disk(self.kind, self.message.clone()).with_os_error(self.os_error)
    }
}

impl fmt::Display for DiskProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

pub type DiskResult = Result<DiskOutcome, DiskProblem>;

/// Completion callback. Runs on the disk thread.
pub type DiskSink = Box<dyn FnOnce(DiskResult) + Send>;

/// Deferred close of a file.
#[derive(Debug)]
pub struct FileClose {
    pub file: LocalFile,
    pub truncate_to: Option<u64>,
    pub modified: Option<SystemTime>,
    pub delete_if_empty: bool,
    pub always_delete: bool,
}

impl FileClose {
    pub fn new(file: LocalFile) -> Self {
        Self {
            file,
            truncate_to: None,
            modified: None,
            delete_if_empty: false,
            always_delete: false,
        }
    }
}

// ─── Worker thread ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiskTicket(u64);

#[derive(Debug)]
pub enum CancelOutcome {
    /// Still queued; the request is handed back.
    Removed(Box<DiskWork>),
    /// Running; its result will be discarded.
    InProgress,
    /// Already finished or never submitted.
    Unknown,
}

struct Job {
    ticket: DiskTicket,
    work: DiskWork,
    sink: DiskSink,
}

#[derive(Default)]
struct DiskState {
    work: VecDeque<Job>,
    closes: VecDeque<(u64, FileClose)>,
    in_progress: Option<DiskTicket>,
    cancel_in_progress: bool,
    shutdown: bool,
    next_ticket: u64,
    next_close_seq: u64,
    done_close_seq: u64,
}

#[derive(Default)]
struct Shared {
    state: Mutex<DiskState>,
    wake: Condvar,
    closed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, DiskState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum Next {
    Close(u64, FileClose),
    Work(Job),
    Exit,
}

/// Handle to the disk thread. Dropping it flushes pending closes, discards
/// pending work and joins the thread.
pub struct DiskWorker {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DiskWorker {
    pub fn start() -> FtpResult<Self> {
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("ftp-disk".into())
            .spawn(move || run(&worker_shared))
            .map_err(FtpError::from)?;
        log::debug!("disk worker started");
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    pub fn submit(&self, work: DiskWork, sink: DiskSink) -> DiskTicket {
        let mut st = self.shared.lock();
        st.next_ticket += 1;
        let ticket = DiskTicket(st.next_ticket);
        log::trace!("disk: queue {} as {:?}", work.name(), ticket);
        st.work.push_back(Job { ticket, work, sink });
        self.shared.wake.notify_one();
        ticket
    }

    pub fn cancel(&self, ticket: DiskTicket) -> CancelOutcome {
        let mut st = self.shared.lock();
        if let Some(pos) = st.work.iter().position(|j| j.ticket == ticket) {
            return match st.work.remove(pos) {
                Some(job) => CancelOutcome::Removed(Box::new(job.work)),
                None => CancelOutcome::Unknown,
            };
        }
        if st.in_progress == Some(ticket) {
            st.cancel_in_progress = true;
            return CancelOutcome::InProgress;
        }
        CancelOutcome::Unknown
    }

    /// Queue a close ahead of all pending work. Returns its sequence number.
    pub fn close_file(&self, close: FileClose) -> u64 {
        let mut st = self.shared.lock();
        st.next_close_seq += 1;
        let seq = st.next_close_seq;
        st.closes.push_back((seq, close));
        self.shared.wake.notify_one();
        seq
    }

    /// Block until close `seq` has run. Returns false on timeout.
    pub fn wait_closed(&self, seq: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.lock();
        while st.done_close_seq < seq {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            st = match self.shared.closed.wait_timeout(st, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }

    /// Requests waiting to run.
    pub fn queued(&self) -> usize {
        self.shared.lock().work.len()
    }

    pub fn shutdown(&self) {
        {
            let mut st = self.shared.lock();
            st.shutdown = true;
            self.shared.wake.notify_all();
        }
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("disk worker thread panicked");
            }
        }
    }
}

impl Drop for DiskWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &Shared) {
    loop {
        let next = {
            let mut st = shared.lock();
            loop {
                if let Some((seq, close)) = st.closes.pop_front() {
                    break Next::Close(seq, close);
                }
                if st.shutdown {
                    let dropped = st.work.len();
                    st.work.clear();
                    if dropped > 0 {
                        log::debug!("disk worker: discarded {} pending requests", dropped);
                    }
                    break Next::Exit;
                }
                if let Some(job) = st.work.pop_front() {
                    st.in_progress = Some(job.ticket);
                    st.cancel_in_progress = false;
                    break Next::Work(job);
                }
                st = match shared.wake.wait(st) {
                    Ok(guard) => guard,
                    Err(e) => e.into_inner(),
                };
            }
        };

        match next {
            Next::Close(seq, close) => {
                apply_close(close);
                let mut st = shared.lock();
                st.done_close_seq = seq;
                shared.closed.notify_all();
            }
            Next::Work(job) => {
                let result = execute(job.work);
                let cancelled = {
                    let mut st = shared.lock();
                    st.in_progress = None;
                    std::mem::take(&mut st.cancel_in_progress)
                };
                if cancelled {
                    log::trace!("disk: {:?} cancelled, result released", job.ticket);
                    drop(result);
                } else {
                    (job.sink)(result);
                }
            }
            Next::Exit => break,
        }
    }
    log::debug!("disk worker stopped");
}

/// Run a close on the calling thread.
pub fn apply_close(close: FileClose) {
    let FileClose {
        file,
        truncate_to,
        modified,
        delete_if_empty,
        always_delete,
    } = close;
    let LocalFile { file, path } = file;

    if let Some(len) = truncate_to {
        if let Err(e) = file.set_len(len) {
            log::warn!("disk: cannot truncate {}: {}", path.display(), e);
        }
    }
    if let Some(mtime) = modified {
        if let Err(e) = file.set_modified(mtime) {
            log::warn!("disk: cannot set time of {}: {}", path.display(), e);
        }
    }
    let empty = file.metadata().map(|m| m.len() == 0).unwrap_or(false);
    drop(file);

    if always_delete || (delete_if_empty && empty) {
        if let Err(e) = fs::remove_file(&path) {
            log::warn!("disk: cannot delete {}: {}", path.display(), e);
        }
    }
}

// ─── Execution ───────────────────────────────────────────────────────

/// Run one request synchronously.
pub fn execute(work: DiskWork) -> DiskResult {
    match work {
        DiskWork::CreateDir {
            parent,
            name,
            policies,
            forced,
        } => create_dir(&parent, &name, &policies, forced),
        DiskWork::CreateFile {
            dir,
            name,
            mode,
            policies,
            forced,
            overlap,
        } => create_file(&dir, &name, mode, &policies, forced, overlap),
        DiskWork::CheckOrWriteFile {
            file,
            check_from,
            write_from,
            data,
        } => check_or_write(file, check_from, write_from, &data),
        DiskWork::ListDir { path } => list_dir(&path),
        DiskWork::DeleteDir { path } => fs::remove_dir(&path)
            .map(|_| DiskOutcome::Deleted)
            .map_err(|e| DiskProblem::from_io(DiskProblemKind::CannotDelete, &path, &e)),
        DiskWork::DeleteFile { path } => fs::remove_file(&path)
            .map(|_| DiskOutcome::Deleted)
            .map_err(|e| DiskProblem::from_io(DiskProblemKind::CannotDelete, &path, &e)),
        DiskWork::OpenFileForReading { path } => open_for_reading(path),
        DiskWork::ReadFile {
            file,
            size,
            ascii,
            prev_cr,
        } => read_file(file, size, ascii, prev_cr),
    }
}

fn create_dir(parent: &Path, name: &str, policies: &DiskPolicies, forced: ForcedAction) -> DiskResult {
    let path = parent.join(name);

    match forced {
        ForcedAction::Skip => return Ok(DiskOutcome::Skipped),
        ForcedAction::Autorename => return autorename_dir(parent, name),
        ForcedAction::UseExistingDir if path.is_dir() => return Ok(DiskOutcome::DirReady { path }),
        _ => {}
    }

    match fs::symlink_metadata(&path) {
        Ok(meta) if meta.is_dir() => match policies.dir_already_exists {
            DirExistsPolicy::Join => Ok(DiskOutcome::DirReady { path }),
            DirExistsPolicy::Autorename => autorename_dir(parent, name),
            DirExistsPolicy::Skip => Ok(DiskOutcome::Skipped),
            DirExistsPolicy::Prompt => Err(DiskProblem::new(
                DiskProblemKind::NameAlreadyExists,
                format!("directory {} already exists", path.display()),
            )
            .prompting()),
        },
        Ok(_) => cannot_create_dir(
            parent,
            name,
            policies,
            DiskProblem::new(
                DiskProblemKind::NameAlreadyExists,
                format!("{} exists and is not a directory", path.display()),
            ),
        ),
        Err(_) => match fs::create_dir(&path) {
            Ok(()) => Ok(DiskOutcome::DirReady { path }),
            Err(e) => cannot_create_dir(
                parent,
                name,
                policies,
                DiskProblem::from_io(DiskProblemKind::CannotCreate, &path, &e),
            ),
        },
    }
}

fn cannot_create_dir(parent: &Path, name: &str, policies: &DiskPolicies, problem: DiskProblem) -> DiskResult {
    if problem.kind == DiskProblemKind::OutOfMemory {
        return Err(problem);
    }
    match policies.cannot_create_dir {
        CannotCreatePolicy::Autorename => autorename_dir(parent, name),
        CannotCreatePolicy::Skip => Ok(DiskOutcome::Skipped),
        CannotCreatePolicy::Prompt => Err(problem.prompting()),
    }
}

fn autorename_dir(parent: &Path, name: &str) -> DiskResult {
    for n in 2..MAX_AUTORENAME_ATTEMPTS {
        let Some(candidate) = autorename_candidate(parent, name, n) else {
            break;
        };
        let path = parent.join(&candidate);
        match fs::create_dir(&path) {
            Ok(()) => return Ok(DiskOutcome::DirReady { path }),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(DiskProblem::from_io(DiskProblemKind::CannotCreate, &path, &e)),
        }
    }
    Err(DiskProblem::new(
        DiskProblemKind::CannotCreate,
        format!("no free name for {} in {}", name, parent.display()),
    ))
}

/// `name (n).ext`, with the stem shortened so the name and the full path
/// stay within [`MAX_NAME_LEN`] and [`MAX_PATH_LEN`].
pub fn autorename_candidate(parent: &Path, name: &str, n: u32) -> Option<String> {
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => name.split_at(dot),
        _ => (name, ""),
    };
    let suffix = format!(" ({}){}", n, ext);
    let dir_len = parent.as_os_str().len() + 1;
    let room = MAX_NAME_LEN
        .min(MAX_PATH_LEN.saturating_sub(dir_len))
        .checked_sub(suffix.len())?;
    let mut cut = stem.len().min(room);
    while !stem.is_char_boundary(cut) {
        cut -= 1;
    }
    if cut == 0 && !stem.is_empty() {
        return None;
    }
    Some(format!("{}{}", &stem[..cut], suffix))
}

fn create_file(
    dir: &Path,
    name: &str,
    mode: CreateFileMode,
    policies: &DiskPolicies,
    forced: ForcedAction,
    overlap: u64,
) -> DiskResult {
    let path = dir.join(name);

    let policy = match forced {
        ForcedAction::None | ForcedAction::UseExistingDir => match mode {
            CreateFileMode::Initial => policies.file_already_exists,
            CreateFileMode::RetryCreated => policies.retry_on_created_file,
            CreateFileMode::RetryResumed => policies.retry_on_resumed_file,
        },
        ForcedAction::Skip => return Ok(DiskOutcome::Skipped),
        ForcedAction::Autorename => return autorename_file(dir, name),
        ForcedAction::Overwrite => FileExistsPolicy::Overwrite,
        ForcedAction::Resume => FileExistsPolicy::Resume,
        ForcedAction::ResumeOrOverwrite => FileExistsPolicy::ResumeOrOverwrite,
        ForcedAction::ReduceFileSizeAndResume => return reduce_and_resume(path, overlap),
    };

    match OpenOptions::new().read(true).write(true).create_new(true).open(&path) {
        Ok(file) => Ok(DiskOutcome::FileReady {
            file: LocalFile { file, path },
            size: 0,
            mode: FileOpenMode::Created,
            can_overwrite: false,
        }),
        Err(e) if e.kind() == ErrorKind::AlreadyExists && path.is_file() => match policy {
            FileExistsPolicy::Resume => resume(path),
            FileExistsPolicy::ResumeOrOverwrite => resume_or_overwrite(path),
            FileExistsPolicy::Overwrite => overwrite(path),
            FileExistsPolicy::Autorename => autorename_file(dir, name),
            FileExistsPolicy::Skip => Ok(DiskOutcome::Skipped),
            FileExistsPolicy::Prompt => Err(DiskProblem::new(
                DiskProblemKind::NameAlreadyExists,
                format!("file {} already exists", path.display()),
            )
            .prompting()),
        },
        Err(e) => {
            let problem = DiskProblem::from_io(DiskProblemKind::CannotCreate, &path, &e);
            if problem.kind == DiskProblemKind::OutOfMemory {
                return Err(problem);
            }
            match policies.cannot_create_file {
                CannotCreatePolicy::Autorename => autorename_file(dir, name),
                CannotCreatePolicy::Skip => Ok(DiskOutcome::Skipped),
                CannotCreatePolicy::Prompt => Err(problem.prompting()),
            }
        }
    }
}

fn open_existing(path: &Path) -> Result<(File, u64), DiskProblem> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| DiskProblem::from_io(DiskProblemKind::CannotResume, path, &e))?;
    let size = file
        .metadata()
        .map_err(|e| DiskProblem::from_io(DiskProblemKind::CannotResume, path, &e))?
        .len();
    Ok((file, size))
}

fn resume(path: PathBuf) -> DiskResult {
    let (file, size) = open_existing(&path)?;
    Ok(DiskOutcome::FileReady {
        file: LocalFile { file, path },
        size,
        mode: FileOpenMode::Resumed,
        can_overwrite: false,
    })
}

fn resume_or_overwrite(path: PathBuf) -> DiskResult {
    match open_existing(&path) {
        Ok((file, size)) => Ok(DiskOutcome::FileReady {
            file: LocalFile { file, path },
            size,
            mode: FileOpenMode::Resumed,
            can_overwrite: true,
        }),
        Err(problem) if problem.kind == DiskProblemKind::OutOfMemory => Err(problem),
        Err(problem) => {
            log::info!("{}, overwriting instead", problem.message);
            overwrite(path)
        }
    }
}

fn reduce_and_resume(path: PathBuf, overlap: u64) -> DiskResult {
    let (file, size) = open_existing(&path)?;
    let size = size.saturating_sub(overlap.max(1));
    file.set_len(size)
        .map_err(|e| DiskProblem::from_io(DiskProblemKind::CannotResume, &path, &e))?;
    Ok(DiskOutcome::FileReady {
        file: LocalFile { file, path },
        size,
        mode: FileOpenMode::Resumed,
        can_overwrite: false,
    })
}

fn overwrite(path: PathBuf) -> DiskResult {
    let truncated = OpenOptions::new()
        .read(true)
        .write(true)
        .truncate(true)
        .open(&path);
    let file = match truncated {
        Ok(file) => file,
        Err(_) => {
            // read-only or otherwise stubborn: replace it
            fs::remove_file(&path)
                .map_err(|e| DiskProblem::from_io(DiskProblemKind::CannotCreate, &path, &e))?;
            OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
                .map_err(|e| DiskProblem::from_io(DiskProblemKind::CannotCreate, &path, &e))?
        }
    };
    Ok(DiskOutcome::FileReady {
        file: LocalFile { file, path },
        size: 0,
        mode: FileOpenMode::Overwritten,
        can_overwrite: false,
    })
}

fn autorename_file(dir: &Path, name: &str) -> DiskResult {
    for n in 2..MAX_AUTORENAME_ATTEMPTS {
        let Some(candidate) = autorename_candidate(dir, name, n) else {
            break;
        };
        let path = dir.join(&candidate);
        match OpenOptions::new().read(true).write(true).create_new(true).open(&path) {
            Ok(file) => {
                return Ok(DiskOutcome::FileReady {
                    file: LocalFile { file, path },
                    size: 0,
                    mode: FileOpenMode::Created,
                    can_overwrite: false,
                })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(DiskProblem::from_io(DiskProblemKind::CannotCreate, &path, &e)),
        }
    }
    Err(DiskProblem::new(
        DiskProblemKind::CannotCreate,
        format!("no free name for {} in {}", name, dir.display()),
    ))
}

fn check_or_write(mut lf: LocalFile, check_from: u64, write_from: u64, data: &[u8]) -> DiskResult {
    let verify_len = write_from.saturating_sub(check_from).min(data.len() as u64) as usize;

    if verify_len > 0 {
        let mut on_disk = vec![0u8; verify_len];
        let read = lf
            .file
            .seek(SeekFrom::Start(check_from))
            .and_then(|_| read_full(&mut lf.file, &mut on_disk));
        match read {
            Ok(n) if n == verify_len && on_disk[..] == data[..verify_len] => {}
            Ok(_) => {
                let msg = format!(
                    "{}: downloaded data does not match the local file at offset {}",
                    lf.path.display(),
                    check_from
                );
                return Err(DiskProblem::new(DiskProblemKind::ResumeVerificationFailed, msg).with_file(lf));
            }
            Err(e) => {
                let problem = DiskProblem::from_io(DiskProblemKind::ReadError, &lf.path, &e);
                return Err(problem.with_file(lf));
            }
        }
    }

    let rest = &data[verify_len..];
    if !rest.is_empty() {
        let start = check_from + verify_len as u64;
        let written = lf
            .file
            .seek(SeekFrom::Start(start))
            .and_then(|_| lf.file.write_all(rest));
        if let Err(e) = written {
            let problem = DiskProblem::from_io(DiskProblemKind::WriteError, &lf.path, &e);
            return Err(problem.with_file(lf));
        }
    }
    Ok(DiskOutcome::Written {
        file: lf,
        written: rest.len() as u64,
    })
}

fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn list_dir(path: &Path) -> DiskResult {
    let cannot_list = |e: io::Error| DiskProblem::from_io(DiskProblemKind::CannotList, path, &e);
    let mut entries = Vec::new();
    for entry in fs::read_dir(path).map_err(cannot_list)? {
        let entry = entry.map_err(cannot_list)?;
        let meta = entry.metadata().map_err(cannot_list)?;
        entries.push(LocalEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(DiskOutcome::Listing(entries))
}

fn open_for_reading(path: PathBuf) -> DiskResult {
    let not_readable = |e: io::Error| {
        let kind = if e.kind() == ErrorKind::NotFound {
            DiskProblemKind::NotFound
        } else {
            DiskProblemKind::ReadError
        };
        DiskProblem::from_io(kind, &path, &e)
    };
    let file = File::open(&path).map_err(not_readable)?;
    let size = file.metadata().map_err(not_readable)?.len();
    Ok(DiskOutcome::Opened {
        file: LocalFile { file, path },
        size,
    })
}

fn read_file(mut lf: LocalFile, size: usize, ascii: bool, prev_cr: bool) -> DiskResult {
    let mut buf = vec![0u8; size];
    let n = match read_full(&mut lf.file, &mut buf) {
        Ok(n) => n,
        Err(e) => {
            let problem = DiskProblem::from_io(DiskProblemKind::ReadError, &lf.path, &e);
            return Err(problem.with_file(lf));
        }
    };
    buf.truncate(n);

    let (data, eols, last_cr) = if ascii {
        lf_to_crlf(&buf, prev_cr)
    } else {
        let last_cr = buf.last().map_or(prev_cr, |&b| b == b'\r');
        (buf, 0, last_cr)
    };
    Ok(DiskOutcome::Read {
        file: lf,
        data,
        eof: n == 0,
        eols,
        last_cr,
    })
}

/// Insert CR before every LF not already preceded by one. Returns the
/// converted data, the number of line ends and whether it ends with CR.
pub fn lf_to_crlf(input: &[u8], prev_cr: bool) -> (Vec<u8>, u64, bool) {
    let mut out = Vec::with_capacity(input.len() + input.len() / 16);
    let mut eols = 0;
    let mut last_cr = prev_cr;
    for &b in input {
        if b == b'\n' {
            if !last_cr {
                out.push(b'\r');
            }
            eols += 1;
        }
        out.push(b);
        last_cr = b == b'\r';
    }
    (out, eols, last_cr)
}
