//! Tokio host for the worker pool.
//!
//! One event-loop task owns the [`WorkerPool`]. Socket tasks, timer tasks,
//! the disk thread and prompt tasks send it `(worker, epoch, event)`
//! messages; after each message the loop executes every action the workers
//! queued. A [`ReactorHandle`] talks to the loop over the same channel.

use crate::ftp::disk::{CancelOutcome, DiskTicket, DiskWorker, FileClose};
use crate::ftp::epoch::Epoch;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::events::{Action, TimerKind, Tunnel, WorkerEvent};
use crate::ftp::pool::{Offer, WorkerPool, WorkerTarget};
use crate::ftp::proxy;
use crate::ftp::queue::{OperationQueue, QueueCounts};
use crate::ftp::tls::{CertificateCache, TlsContext};
use crate::ftp::types::{
    ConnectionConfig, DenyAllPrompter, EngineConfig, ForcedAction, ItemId, ItemKind, PromptAnswer, Prompter,
    WorkerId, WorkerStatus,
};
use crate::ftp::worker::WorkerError;
use rustls::ClientConfig;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::timeout;

/// Workers touched per lock of the pool by batched commands.
const BATCH: usize = 32;

const READ_BUFFER: usize = 16 * 1024;

/// Byte stream a control or data connection runs over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

type BoxedStream = Box<dyn Transport>;

pub(crate) type Reply<T> = oneshot::Sender<T>;

pub(crate) enum Command {
    Stop(WorkerTarget, Reply<usize>),
    Start(WorkerTarget, Reply<usize>),
    Pause(WorkerTarget, bool, Reply<usize>),
    OfferWork(Offer),
    Status(Reply<Vec<WorkerStatus>>),
    NextErrorAfter(u64, Reply<Option<(WorkerId, WorkerError)>>),
    AllIdleOrStopping(Reply<bool>),
    Resolve(ItemId, ForcedAction, Reply<FtpResult<()>>),
    Shutdown(Reply<()>),
}

pub(crate) enum Msg {
    Event(WorkerId, Epoch, WorkerEvent),
    Command(Command),
}

pub(crate) type Events = mpsc::UnboundedSender<Msg>;

fn emit(tx: &Events, worker: WorkerId, epoch: Epoch, event: WorkerEvent) {
    // the loop is gone once the reactor shut down
    let _ = tx.send(Msg::Event(worker, epoch, event));
}

// ─── Builder ─────────────────────────────────────────────────────────

/// Configures and spawns the event loop.
pub struct Reactor {
    config: ConnectionConfig,
    engine: EngineConfig,
    workers: usize,
    prompter: Arc<dyn Prompter>,
    tls: Option<TlsContext>,
    queue: Arc<OperationQueue>,
}

impl Reactor {
    pub fn new(config: ConnectionConfig, engine: EngineConfig) -> Self {
        Self {
            config,
            engine,
            workers: 1,
            prompter: Arc::new(DenyAllPrompter),
            tls: None,
            queue: Arc::new(OperationQueue::new()),
        }
    }

    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count.max(1);
        self
    }

    pub fn prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    /// Trust roots for FTPS; the platform roots are used otherwise.
    pub fn tls(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Run against an existing queue.
    pub fn queue(mut self, queue: Arc<OperationQueue>) -> Self {
        self.queue = queue;
        self
    }

    /// Spawn the event loop on the current tokio runtime.
    pub fn spawn(self) -> FtpResult<ReactorHandle> {
        let disk = DiskWorker::start()?;
        let tls = match self.tls {
            Some(tls) => tls,
            None => TlsContext::with_native_roots(),
        };
        let engine = Arc::new(self.engine);
        let pool = WorkerPool::new(
            Arc::clone(&self.queue),
            Arc::clone(&engine),
            self.config.clone(),
            Arc::new(CertificateCache::new()),
            self.workers,
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let event_loop = EventLoop {
            pool,
            io: Io::new(tx.clone(), Arc::new(tls), engine, self.config.host.clone(), self.prompter, Some(disk)),
        };
        log::info!(
            "reactor: {} worker(s) for {}:{}, operation {}",
            self.workers,
            self.config.host,
            self.config.port,
            self.queue.operation_id()
        );
        tokio::spawn(event_loop.run(rx));
        Ok(ReactorHandle { tx, queue: self.queue })
    }
}

// ─── Handle ──────────────────────────────────────────────────────────

/// Host-side control of a running reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    tx: Events,
    queue: Arc<OperationQueue>,
}

impl ReactorHandle {
    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    /// Queue an item and wake the workers.
    pub fn add(&self, kind: ItemKind) -> ItemId {
        let id = self.queue.add(kind);
        self.offer_work(Offer::All);
        id
    }

    pub fn offer_work(&self, offer: Offer) {
        let _ = self.tx.send(Msg::Command(Command::OfferWork(offer)));
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> FtpResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Msg::Command(make(reply)))
            .map_err(|_| FtpError::cancelled("reactor is not running"))?;
        rx.await
            .map_err(|_| FtpError::cancelled("reactor stopped before answering"))
    }

    pub async fn stop(&self, target: WorkerTarget) -> FtpResult<()> {
        while self.request(|r| Command::Stop(target, r)).await? > 0 {}
        Ok(())
    }

    pub async fn start(&self, target: WorkerTarget) -> FtpResult<()> {
        while self.request(|r| Command::Start(target, r)).await? > 0 {}
        Ok(())
    }

    pub async fn pause(&self, target: WorkerTarget, paused: bool) -> FtpResult<()> {
        while self.request(|r| Command::Pause(target, paused, r)).await? > 0 {}
        Ok(())
    }

    pub async fn status(&self) -> FtpResult<Vec<WorkerStatus>> {
        self.request(Command::Status).await
    }

    pub async fn next_error_after(&self, last_seen: u64) -> FtpResult<Option<(WorkerId, WorkerError)>> {
        self.request(|r| Command::NextErrorAfter(last_seen, r)).await
    }

    pub async fn all_idle_or_stopping(&self) -> FtpResult<bool> {
        self.request(Command::AllIdleOrStopping).await
    }

    /// Answer a `needs-input` (or failed) item and retry it.
    pub async fn resolve(&self, id: ItemId, forced: ForcedAction) -> FtpResult<()> {
        self.request(|r| Command::Resolve(id, forced, r)).await?
    }

    /// Wait until no item is waiting or running and every worker is idle.
    pub async fn wait_settled(&self, limit: Duration) -> FtpResult<QueueCounts> {
        let poll = async {
            loop {
                let counts = self.queue.counts();
                if counts.is_settled() && self.all_idle_or_stopping().await? {
                    return Ok(counts);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        timeout(limit, poll)
            .await
            .map_err(|_| FtpError::timeout("operation did not settle in time"))?
    }

    /// Log out every worker and stop the event loop.
    pub async fn shutdown(&self) -> FtpResult<()> {
        self.request(Command::Shutdown).await
    }
}

// ─── Event loop ──────────────────────────────────────────────────────

enum ControlCmd {
    Send(String),
    StartTls {
        server_name: String,
        config: Arc<ClientConfig>,
    },
}

enum DataCmd {
    Send(Vec<u8>),
    Finish,
}

struct Link<C> {
    tx: mpsc::UnboundedSender<C>,
    task: AbortHandle,
}

/// Live I/O handles of one worker.
#[derive(Default)]
struct Links {
    control: Option<Link<ControlCmd>>,
    data: Option<Link<DataCmd>>,
    timers: HashMap<TimerKind, AbortHandle>,
    disk: Option<DiskTicket>,
    tls_config: Option<Arc<ClientConfig>>,
    server_name: Option<String>,
}

impl Links {
    fn close_all(&mut self) {
        // dropping the sender lets the control task flush and shut down
        self.control = None;
        if let Some(data) = self.data.take() {
            data.task.abort();
        }
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
    }
}

struct EventLoop {
    pool: WorkerPool,
    io: Io,
}

impl EventLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) {
        let mut shutdown = None;
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Event(worker, epoch, event) => self.pool.handle(worker, epoch, event),
                Msg::Command(cmd) => shutdown = self.command(cmd),
            }
            self.flush();
            if shutdown.is_some() {
                break;
            }
        }

        self.io.close_all();
        if let Some(disk) = self.io.disk.take() {
            if tokio::task::spawn_blocking(move || disk.shutdown()).await.is_err() {
                log::warn!("reactor: disk worker did not shut down cleanly");
            }
        }
        log::info!("reactor: stopped");
        if let Some(reply) = shutdown {
            let _ = reply.send(());
        }
    }

    fn command(&mut self, cmd: Command) -> Option<Reply<()>> {
        match cmd {
            Command::Stop(target, r) => {
                let _ = r.send(self.pool.stop(target, BATCH));
            }
            Command::Start(target, r) => {
                let _ = r.send(self.pool.start(target, BATCH));
            }
            Command::Pause(target, paused, r) => {
                let _ = r.send(self.pool.pause(target, paused, BATCH));
            }
            Command::OfferWork(offer) => self.pool.offer_work(offer),
            Command::Status(r) => {
                let _ = r.send(self.pool.status());
            }
            Command::NextErrorAfter(seq, r) => {
                let _ = r.send(self.pool.next_error_after(seq));
            }
            Command::AllIdleOrStopping(r) => {
                let _ = r.send(self.pool.all_idle_or_stopping());
            }
            Command::Resolve(id, forced, r) => {
                let result = self.pool.queue().resolve(id, forced);
                if result.is_ok() {
                    self.pool.offer_work(Offer::One);
                }
                let _ = r.send(result);
            }
            Command::Shutdown(r) => {
                self.pool.shutdown();
                return Some(r);
            }
        }
        None
    }

    fn flush(&mut self) {
        for (worker, action) in self.pool.drain_actions() {
            self.io.execute(worker, action);
        }
    }
}

/// Executes actions against sockets, timers, the disk thread and the prompter.
pub(crate) struct Io {
    disk: Option<DiskWorker>,
    prompter: Arc<dyn Prompter>,
    tls: Arc<TlsContext>,
    engine: Arc<EngineConfig>,
    host: String,
    links: HashMap<WorkerId, Links>,
    tx: Events,
}

impl Io {
    pub(crate) fn new(
        tx: Events,
        tls: Arc<TlsContext>,
        engine: Arc<EngineConfig>,
        host: String,
        prompter: Arc<dyn Prompter>,
        disk: Option<DiskWorker>,
    ) -> Self {
        Self {
            disk,
            prompter,
            tls,
            engine,
            host,
            links: HashMap::new(),
            tx,
        }
    }

    pub(crate) fn close_all(&mut self) {
        for links in self.links.values_mut() {
            links.close_all();
        }
    }

    pub(crate) fn execute(&mut self, w: WorkerId, action: Action) {
        log::trace!("reactor: {} {}", w, action.name());
        let links = self.links.entry(w).or_default();
        match action {
            Action::Resolve { epoch, host, port } => {
                let tx = self.tx.clone();
                let limit = self.engine.reply_timeout();
                tokio::spawn(async move {
                    let result = resolve(&host, port, limit).await;
                    emit(&tx, w, epoch, WorkerEvent::Resolved(result));
                });
            }
            Action::OpenControl { epoch, addr, tunnel } => {
                let (ctx, crx) = mpsc::unbounded_channel();
                let task = tokio::spawn(run_control(
                    Emitter {
                        tx: self.tx.clone(),
                        worker: w,
                        epoch,
                    },
                    addr,
                    tunnel,
                    self.engine.reply_timeout(),
                    Arc::clone(&self.tls),
                    crx,
                ));
                links.control = Some(Link {
                    tx: ctx,
                    task: task.abort_handle(),
                });
            }
            Action::SendControl { line, .. } => match &links.control {
                Some(link) => {
                    let _ = link.tx.send(ControlCmd::Send(line));
                }
                None => log::debug!("reactor: {} has no control connection", w),
            },
            Action::StartTls { epoch, server_name } => {
                let config = match &links.tls_config {
                    Some(config) => Ok(Arc::clone(config)),
                    None => self.tls.client_config(),
                };
                match (config, &links.control) {
                    (Ok(config), Some(link)) => {
                        links.tls_config = Some(Arc::clone(&config));
                        links.server_name = Some(server_name.clone());
                        let _ = link.tx.send(ControlCmd::StartTls { server_name, config });
                    }
                    (Err(e), _) => emit(&self.tx, w, epoch, WorkerEvent::TlsFailed(e)),
                    (Ok(_), None) => emit(
                        &self.tx,
                        w,
                        epoch,
                        WorkerEvent::TlsFailed(FtpError::disconnected("no control connection")),
                    ),
                }
            }
            Action::CloseControl => {
                links.control = None;
            }
            Action::ArmTimer { epoch, kind, after } => {
                let tx = self.tx.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    emit(&tx, w, epoch, WorkerEvent::Timer(kind));
                });
                if let Some(old) = links.timers.insert(kind, task.abort_handle()) {
                    old.abort();
                }
            }
            Action::CancelTimer { kind } => {
                if let Some(timer) = links.timers.remove(&kind) {
                    timer.abort();
                }
            }
            Action::OpenData { epoch, addr, tls } => {
                let secure = self.data_tls(tls, w);
                let emitter = Emitter {
                    tx: self.tx.clone(),
                    worker: w,
                    epoch,
                };
                let limit = self.engine.data_timeout();
                let links = self.links.entry(w).or_default();
                links.open_data(DataOpen::Connect(addr, limit), secure, emitter);
            }
            Action::ListenData { epoch, bind_ip, tls } => {
                let secure = self.data_tls(tls, w);
                let emitter = Emitter {
                    tx: self.tx.clone(),
                    worker: w,
                    epoch,
                };
                let links = self.links.entry(w).or_default();
                links.open_data(DataOpen::Listen(bind_ip), secure, emitter);
            }
            Action::SendData { data, .. } => {
                if let Some(link) = &links.data {
                    let _ = link.tx.send(DataCmd::Send(data));
                }
            }
            Action::FinishData { .. } => {
                if let Some(link) = &links.data {
                    let _ = link.tx.send(DataCmd::Finish);
                }
            }
            Action::CloseData => {
                if let Some(link) = links.data.take() {
                    link.task.abort();
                }
            }
            Action::SubmitDisk { epoch, work } => {
                let Some(disk) = &self.disk else {
                    log::warn!("reactor: {} submitted {} without a disk worker", w, work.name());
                    return;
                };
                let tx = self.tx.clone();
                let ticket = disk.submit(
                    work,
                    Box::new(move |result| emit(&tx, w, epoch, WorkerEvent::DiskDone(result))),
                );
                links.disk = Some(ticket);
            }
            Action::CancelDisk => {
                if let (Some(ticket), Some(disk)) = (links.disk.take(), &self.disk) {
                    if let CancelOutcome::Removed(work) = disk.cancel(ticket) {
                        if let Some(file) = (*work).into_file() {
                            disk.close_file(FileClose::new(file));
                        }
                    }
                }
            }
            Action::CloseFile(close) => {
                if let Some(disk) = &self.disk {
                    disk.close_file(close);
                }
            }
            Action::Prompt { epoch, request } => {
                let tx = self.tx.clone();
                let prompter = Arc::clone(&self.prompter);
                tokio::spawn(async move {
                    let answer = tokio::task::spawn_blocking(move || prompter.prompt(&request))
                        .await
                        .unwrap_or(PromptAnswer::Cancel);
                    emit(&tx, w, epoch, WorkerEvent::PromptAnswered(answer));
                });
            }
        }
    }

    /// TLS settings for a data connection of worker `w`.
    fn data_tls(&mut self, tls: bool, w: WorkerId) -> Option<DataTls> {
        if !tls {
            return None;
        }
        let links = self.links.entry(w).or_default();
        let config = match &links.tls_config {
            Some(config) => Arc::clone(config),
            None => match self.tls.client_config() {
                Ok(config) => {
                    links.tls_config = Some(Arc::clone(&config));
                    config
                }
                Err(e) => {
                    log::warn!("reactor: {}: {}", w, e);
                    return None;
                }
            },
        };
        Some(DataTls {
            context: Arc::clone(&self.tls),
            config,
            server_name: links.server_name.clone().unwrap_or_else(|| self.host.clone()),
        })
    }
}

impl Links {
    fn open_data(&mut self, open: DataOpen, tls: Option<DataTls>, emitter: Emitter) {
        if let Some(old) = self.data.take() {
            old.task.abort();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_data(emitter, open, tls, rx));
        self.data = Some(Link {
            tx,
            task: task.abort_handle(),
        });
    }
}

// ─── Socket tasks ────────────────────────────────────────────────────

/// Sends events of one handle.
struct Emitter {
    tx: Events,
    worker: WorkerId,
    epoch: Epoch,
}

impl Emitter {
    fn emit(&self, event: WorkerEvent) {
        emit(&self.tx, self.worker, self.epoch, event);
    }
}

async fn resolve(host: &str, port: u16, limit: Duration) -> Result<SocketAddr, FtpError> {
    let lookup = timeout(limit, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| FtpError::timeout(format!("resolving {} timed out", host)))?
        .map_err(|e| FtpError::resolve(format!("cannot resolve {}: {}", host, e)))?;
    let mut addrs: Vec<SocketAddr> = lookup.collect();
    // prefer IPv4; active mode needs it
    addrs.sort_by_key(|a| !a.is_ipv4());
    addrs
        .into_iter()
        .next()
        .ok_or_else(|| FtpError::resolve(format!("{} has no addresses", host)))
}

async fn connect_control(addr: SocketAddr, tunnel: Option<&Tunnel>) -> FtpResult<(BoxedStream, SocketAddr)> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let local = stream.local_addr()?;
    if let Some(tunnel) = tunnel {
        proxy::establish(&mut stream, tunnel).await?;
    }
    Ok((Box::new(stream), local))
}

async fn run_control(
    out: Emitter,
    addr: SocketAddr,
    tunnel: Option<Tunnel>,
    limit: Duration,
    tls: Arc<TlsContext>,
    mut rx: mpsc::UnboundedReceiver<ControlCmd>,
) {
    let (mut stream, local_addr) = match timeout(limit, connect_control(addr, tunnel.as_ref())).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(e)) => {
            out.emit(WorkerEvent::ControlConnectFailed(e));
            return;
        }
        Err(_) => {
            out.emit(WorkerEvent::ControlConnectFailed(FtpError::timeout(format!(
                "connecting to {} timed out",
                addr
            ))));
            return;
        }
    };
    out.emit(WorkerEvent::ControlConnected { local_addr });

    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(ControlCmd::Send(line)) => {
                    let mut bytes = line.into_bytes();
                    bytes.extend_from_slice(b"\r\n");
                    if let Err(e) = stream.write_all(&bytes).await {
                        out.emit(WorkerEvent::ControlClosed(Some(e.into())));
                        return;
                    }
                }
                Some(ControlCmd::StartTls { server_name, config }) => {
                    match tls.connect(&config, &server_name, stream).await {
                        Ok((secured, info)) => {
                            stream = Box::new(secured);
                            out.emit(WorkerEvent::TlsEstablished(info));
                        }
                        Err(e) => {
                            out.emit(WorkerEvent::TlsFailed(e));
                            return;
                        }
                    }
                }
                None => {
                    let _ = stream.shutdown().await;
                    return;
                }
            },
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    out.emit(WorkerEvent::ControlClosed(None));
                    return;
                }
                Ok(n) => out.emit(WorkerEvent::ControlData(buf[..n].to_vec())),
                Err(e) => {
                    out.emit(WorkerEvent::ControlClosed(Some(e.into())));
                    return;
                }
            },
        }
    }
}

struct DataTls {
    context: Arc<TlsContext>,
    config: Arc<ClientConfig>,
    server_name: String,
}

enum DataOpen {
    Connect(SocketAddr, Duration),
    Listen(IpAddr),
}

async fn open_data(out: &Emitter, open: DataOpen) -> FtpResult<TcpStream> {
    match open {
        DataOpen::Connect(addr, limit) => timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| FtpError::timeout(format!("data connection to {} timed out", addr)))?
            .map_err(FtpError::from),
        DataOpen::Listen(ip) => {
            let listener = TcpListener::bind((ip, 0)).await?;
            out.emit(WorkerEvent::DataListening(listener.local_addr()?));
            let (stream, peer) = listener.accept().await?;
            log::debug!("reactor: data connection from {}", peer);
            Ok(stream)
        }
    }
}

async fn run_data(out: Emitter, open: DataOpen, tls: Option<DataTls>, mut rx: mpsc::UnboundedReceiver<DataCmd>) {
    let tcp = match open_data(&out, open).await {
        Ok(tcp) => tcp,
        Err(e) => {
            out.emit(WorkerEvent::DataConnectFailed(e));
            return;
        }
    };
    // some servers start TLS only after the transfer command
    out.emit(WorkerEvent::DataConnected);
    let mut stream: BoxedStream = match tls {
        Some(tls) => match tls.context.connect(&tls.config, &tls.server_name, tcp).await {
            Ok((secured, _)) => Box::new(secured),
            Err(e) => {
                out.emit(WorkerEvent::DataClosed(Some(e)));
                return;
            }
        },
        None => Box::new(tcp),
    };

    let mut buf = vec![0u8; READ_BUFFER];
    let mut commands_open = true;
    loop {
        tokio::select! {
            cmd = rx.recv(), if commands_open => match cmd {
                Some(DataCmd::Send(data)) => {
                    if let Err(e) = stream.write_all(&data).await {
                        out.emit(WorkerEvent::DataClosed(Some(e.into())));
                        return;
                    }
                    out.emit(WorkerEvent::DataWritten(data.len()));
                }
                Some(DataCmd::Finish) => {
                    if let Err(e) = stream.shutdown().await {
                        out.emit(WorkerEvent::DataClosed(Some(e.into())));
                        return;
                    }
                }
                None => commands_open = false,
            },
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    out.emit(WorkerEvent::DataClosed(None));
                    return;
                }
                Ok(n) => out.emit(WorkerEvent::DataReceived(buf[..n].to_vec())),
                Err(e) => {
                    out.emit(WorkerEvent::DataClosed(Some(e.into())));
                    return;
                }
            },
        }
    }
}
