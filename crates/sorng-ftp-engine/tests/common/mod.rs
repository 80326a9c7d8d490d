//! In-memory FTP server and network that drive a [`WorkerPool`] without
//! sockets or timers. Disk requests run inline against the real filesystem.

#![allow(dead_code)]

use sorng_ftp_engine::ftp::disk;
use sorng_ftp_engine::ftp::epoch::Epoch;
use sorng_ftp_engine::ftp::{
    Action, CertificateCache, ConnectionConfig, EngineConfig, ItemId, ItemKind, ItemState, OperationQueue,
    PromptAnswer, WorkerEvent, WorkerId, WorkerPool,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

/// Virtual file tree shared by every control connection.
#[derive(Debug, Default)]
pub struct MockFtp {
    pub dirs: BTreeSet<String>,
    pub files: BTreeMap<String, Vec<u8>>,
    /// Every command received, in order.
    pub commands: Vec<(WorkerId, String)>,
    /// Answer this (1-based) command with `421` and hang up.
    pub fail_at: Option<usize>,
    /// Answer every command with this verb with `450`.
    pub busy_verb: Option<&'static str>,
    /// Answer every command with this verb with `421` and hang up.
    pub drop_verb: Option<&'static str>,
    /// `RMD` refuses directories that are not empty.
    pub strict_rmd: bool,
    /// `REST` is not implemented.
    pub no_rest: bool,
}

impl MockFtp {
    pub fn new() -> Self {
        let mut server = Self::default();
        server.dirs.insert("/".into());
        server
    }

    pub fn add_dir(&mut self, path: &str) {
        self.dirs.insert(path.into());
    }

    pub fn add_file(&mut self, path: &str, content: &[u8]) {
        self.files.insert(path.into(), content.to_vec());
    }

    pub fn sent(&self, line: &str) -> usize {
        self.commands.iter().filter(|(_, l)| l == line).count()
    }

    fn children(&self, dir: &str) -> Vec<(String, bool, u64)> {
        let prefix = if dir == "/" { "/".to_string() } else { format!("{}/", dir) };
        let direct = |p: &str| p.len() > prefix.len() && p.starts_with(&prefix) && !p[prefix.len()..].contains('/');
        let mut out: Vec<(String, bool, u64)> = self
            .dirs
            .iter()
            .filter(|p| direct(p))
            .map(|p| (p[prefix.len()..].to_string(), true, 0))
            .collect();
        out.extend(
            self.files
                .iter()
                .filter(|(p, _)| direct(p))
                .map(|(p, c)| (p[prefix.len()..].to_string(), false, c.len() as u64)),
        );
        out
    }

    fn is_empty_dir(&self, dir: &str) -> bool {
        self.children(dir).is_empty()
    }

    fn remove_tree(&mut self, dir: &str) {
        let prefix = format!("{}/", dir);
        self.dirs.retain(|p| p != dir && !p.starts_with(&prefix));
        self.files.retain(|p, _| !p.starts_with(&prefix));
    }
}

fn resolve(cwd: &str, arg: &str) -> String {
    if arg.starts_with('/') {
        let trimmed = arg.trim_end_matches('/');
        return if trimmed.is_empty() { "/".into() } else { trimmed.into() };
    }
    if cwd == "/" {
        format!("/{}", arg)
    } else {
        format!("{}/{}", cwd, arg)
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".into(),
        Some(i) => path[..i].to_string(),
    }
}

#[derive(Debug)]
struct Session {
    cwd: String,
    rest: u64,
    upload: Option<(String, Vec<u8>)>,
}

impl Session {
    fn new() -> Self {
        Self {
            cwd: "/".into(),
            rest: 0,
            upload: None,
        }
    }
}

pub fn connection() -> ConnectionConfig {
    ConnectionConfig {
        host: "ftp.mock".into(),
        user: Some("u".into()),
        password: Some("p".into()),
        ..Default::default()
    }
}

pub fn engine() -> EngineConfig {
    EngineConfig {
        connect_retries: 2,
        delay_between_retries_secs: 1,
        ..Default::default()
    }
}

pub struct Sim {
    pub pool: WorkerPool,
    pub queue: Arc<OperationQueue>,
    pub server: MockFtp,
    sessions: HashMap<WorkerId, Session>,
    control: HashMap<WorkerId, Epoch>,
    data: HashMap<WorkerId, Epoch>,
    events: VecDeque<(WorkerId, Epoch, WorkerEvent)>,
    /// Every action executed, by worker.
    pub actions: Vec<(WorkerId, &'static str)>,
    /// Data epochs seen, in order.
    pub data_epochs: Vec<Epoch>,
}

impl Sim {
    pub fn new(workers: usize) -> Self {
        Self::with_engine(workers, engine())
    }

    pub fn with_engine(workers: usize, engine: EngineConfig) -> Self {
        let queue = Arc::new(OperationQueue::new());
        let pool = WorkerPool::new(
            Arc::clone(&queue),
            Arc::new(engine),
            connection(),
            Arc::new(CertificateCache::new()),
            workers,
        );
        Self {
            pool,
            queue,
            server: MockFtp::new(),
            sessions: HashMap::new(),
            control: HashMap::new(),
            data: HashMap::new(),
            events: VecDeque::new(),
            actions: Vec::new(),
            data_epochs: Vec::new(),
        }
    }

    pub fn add(&mut self, kind: ItemKind) -> ItemId {
        self.queue.add(kind)
    }

    pub fn state(&self, id: ItemId) -> ItemState {
        self.queue.item(id).map(|i| i.state).unwrap_or(ItemState::Failed)
    }

    pub fn count(&self, name: &str) -> usize {
        self.actions.iter().filter(|(_, n)| *n == name).count()
    }

    /// Wake the workers and run until nothing is in flight.
    pub fn run(&mut self) {
        self.pool.offer_work(sorng_ftp_engine::ftp::Offer::All);
        self.run_until(|_| false);
    }

    /// Deliver events one at a time until `done` holds or nothing is left.
    pub fn run_until(&mut self, done: impl Fn(&Sim) -> bool) -> bool {
        for _ in 0..100_000 {
            self.flush();
            if done(self) {
                return true;
            }
            let Some((w, epoch, event)) = self.events.pop_front() else {
                return false;
            };
            self.pool.handle(w, epoch, event);
        }
        panic!("simulation did not settle");
    }

    /// Execute queued actions (and the actions they cause) without
    /// delivering any new event.
    pub fn flush(&mut self) {
        loop {
            let actions = self.pool.drain_actions();
            if actions.is_empty() {
                return;
            }
            for (w, action) in actions {
                self.apply(w, action);
            }
        }
    }

    /// Deliver an event with an explicit epoch.
    pub fn inject(&mut self, w: WorkerId, epoch: Epoch, event: WorkerEvent) {
        self.pool.handle(w, epoch, event);
        self.flush();
    }

    fn push(&mut self, w: WorkerId, epoch: Epoch, event: WorkerEvent) {
        self.events.push_back((w, epoch, event));
    }

    fn push_data(&mut self, w: WorkerId, event: WorkerEvent) {
        if let Some(&epoch) = self.data.get(&w) {
            self.push(w, epoch, event);
        }
    }

    fn reply(&mut self, w: WorkerId, text: &str) {
        if let Some(&epoch) = self.control.get(&w) {
            self.push(w, epoch, WorkerEvent::ControlData(format!("{}\r\n", text).into_bytes()));
        }
    }

    fn apply(&mut self, w: WorkerId, action: Action) {
        self.actions.push((w, action.name()));
        match action {
            Action::Resolve { epoch, .. } => {
                self.push(w, epoch, WorkerEvent::Resolved(Ok("127.0.0.1:21".parse().unwrap())));
            }
            Action::OpenControl { epoch, .. } => {
                self.control.insert(w, epoch);
                self.sessions.insert(w, Session::new());
                self.push(
                    w,
                    epoch,
                    WorkerEvent::ControlConnected {
                        local_addr: "127.0.0.1:40000".parse().unwrap(),
                    },
                );
                self.reply(w, "220 mock ready");
            }
            Action::SendControl { line, .. } => self.command(w, line),
            Action::CloseControl => {
                self.control.remove(&w);
                self.sessions.remove(&w);
            }
            Action::OpenData { epoch, .. } => {
                self.data.insert(w, epoch);
                self.data_epochs.push(epoch);
                self.push(w, epoch, WorkerEvent::DataConnected);
            }
            Action::ListenData { epoch, .. } => {
                self.data.insert(w, epoch);
                self.data_epochs.push(epoch);
                self.push(w, epoch, WorkerEvent::DataListening("127.0.0.1:50000".parse().unwrap()));
            }
            Action::SendData { data, .. } => {
                let n = data.len();
                if let Some((_, buf)) = self.sessions.get_mut(&w).and_then(|s| s.upload.as_mut()) {
                    buf.extend_from_slice(&data);
                }
                self.push_data(w, WorkerEvent::DataWritten(n));
            }
            Action::FinishData { .. } => {
                if let Some((path, content)) = self.sessions.get_mut(&w).and_then(|s| s.upload.take()) {
                    self.server.files.insert(path, content);
                    self.push_data(w, WorkerEvent::DataClosed(None));
                    self.reply(w, "226 Transfer complete");
                }
            }
            Action::CloseData => {
                self.data.remove(&w);
            }
            Action::SubmitDisk { epoch, work } => {
                self.push(w, epoch, WorkerEvent::DiskDone(disk::execute(work)));
            }
            Action::CloseFile(close) => disk::apply_close(close),
            Action::Prompt { epoch, .. } => self.push(w, epoch, WorkerEvent::PromptAnswered(PromptAnswer::Cancel)),
            Action::StartTls { .. } | Action::ArmTimer { .. } | Action::CancelTimer { .. } | Action::CancelDisk => {}
        }
    }

    fn command(&mut self, w: WorkerId, line: String) {
        self.server.commands.push((w, line.clone()));
        let (verb, arg) = match line.split_once(' ') {
            Some((v, a)) => (v.to_ascii_uppercase(), a.to_string()),
            None => (line.to_ascii_uppercase(), String::new()),
        };
        if self.server.fail_at == Some(self.server.commands.len()) || self.server.drop_verb == Some(verb.as_str()) {
            self.reply(w, "421 Timeout");
            if let Some(&epoch) = self.control.get(&w) {
                self.push(w, epoch, WorkerEvent::ControlClosed(None));
            }
            return;
        }
        if self.server.busy_verb == Some(verb.as_str()) {
            self.reply(w, "450 busy, try later");
            return;
        }
        let cwd = self.sessions.get(&w).map(|s| s.cwd.clone()).unwrap_or_else(|| "/".into());
        let path = resolve(&cwd, &arg);
        match verb.as_str() {
            "USER" => self.reply(w, "331 password required"),
            "PASS" => self.reply(w, "230 logged in"),
            "QUIT" => self.reply(w, "221 bye"),
            "NOOP" | "TYPE" | "SITE" => self.reply(w, "200 ok"),
            "PWD" => self.reply(w, &format!("257 \"{}\" is current", cwd)),
            "CWD" => {
                if self.server.dirs.contains(&path) {
                    if let Some(s) = self.sessions.get_mut(&w) {
                        s.cwd = path;
                    }
                    self.reply(w, "250 ok");
                } else {
                    self.reply(w, "550 no such directory");
                }
            }
            "MKD" => {
                if self.server.dirs.contains(&path) || self.server.files.contains_key(&path) {
                    self.reply(w, "550 exists");
                } else if self.server.dirs.contains(&parent_of(&path)) {
                    self.reply(w, &format!("257 \"{}\" created", path));
                    self.server.dirs.insert(path);
                } else {
                    self.reply(w, "550 no parent");
                }
            }
            "RMD" => {
                if !self.server.dirs.contains(&path) {
                    self.reply(w, "550 no such directory");
                } else if self.server.strict_rmd && !self.server.is_empty_dir(&path) {
                    self.reply(w, "550 directory not empty");
                } else {
                    self.server.remove_tree(&path);
                    self.reply(w, "250 removed");
                }
            }
            "DELE" => {
                if self.server.files.remove(&path).is_some() {
                    self.reply(w, "250 deleted");
                } else {
                    self.reply(w, "550 no such file");
                }
            }
            "PASV" => self.reply(w, "227 Entering Passive Mode (127,0,0,1,4,1)"),
            "PORT" => {
                self.reply(w, "200 PORT ok");
                self.push_data(w, WorkerEvent::DataConnected);
            }
            "REST" => {
                if self.server.no_rest {
                    self.reply(w, "502 REST not implemented");
                    return;
                }
                if let Some(s) = self.sessions.get_mut(&w) {
                    s.rest = arg.parse().unwrap_or(0);
                }
                self.reply(w, "350 restarting");
            }
            "STOR" => {
                if let Some(s) = self.sessions.get_mut(&w) {
                    s.upload = Some((path, Vec::new()));
                }
                self.reply(w, "150 ok to send data");
            }
            "RETR" => {
                let rest = self.sessions.get_mut(&w).map(|s| std::mem::take(&mut s.rest)).unwrap_or(0);
                match self.server.files.get(&path).cloned() {
                    Some(content) => {
                        self.reply(w, "150 opening data connection");
                        let from = (rest as usize).min(content.len());
                        if from < content.len() {
                            self.push_data(w, WorkerEvent::DataReceived(content[from..].to_vec()));
                        }
                        self.push_data(w, WorkerEvent::DataClosed(None));
                        self.reply(w, "226 Transfer complete");
                    }
                    None => self.reply(w, "550 no such file"),
                }
            }
            "LIST" => {
                let dir = if arg.is_empty() { cwd } else { path };
                let mut body = String::new();
                for (name, is_dir, size) in self.server.children(&dir) {
                    let perms = if is_dir { "drwxr-xr-x" } else { "-rw-r--r--" };
                    body.push_str(&format!("{} 1 owner group {} Jan  1 00:00 {}\r\n", perms, size, name));
                }
                self.reply(w, "150 here comes the listing");
                if !body.is_empty() {
                    self.push_data(w, WorkerEvent::DataReceived(body.into_bytes()));
                }
                self.push_data(w, WorkerEvent::DataClosed(None));
                self.reply(w, "226 Transfer complete");
            }
            _ => self.reply(w, "502 not implemented"),
        }
    }
}
