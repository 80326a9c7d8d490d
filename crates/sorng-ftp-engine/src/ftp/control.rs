//! Control connection state machine.
//!
//! Opens, secures, authenticates and keeps one FTP control channel. The
//! machine is driven by [`WorkerEvent`]s and answers with [`Action`]s in an
//! [`Outbox`]; it owns no socket. Every transport it opens gets a fresh
//! epoch, so completions of a connection that was already torn down are
//! recognised and dropped.
//!
//! ```text
//! Idle → ResolvingAddress → Connecting → AwaitingGreeting
//!      → [SecuringChannel] → RunningLoginScript → LoggedIn
//!                ↘ Retrying ↗          ↘ WaitingForInput ↗
//! ```

use crate::ftp::epoch::{Epoch, EpochSlot};
use crate::ftp::error::{FtpError, FtpErrorKind};
use crate::ftp::events::{Action, Outbox, TimerKind, Timers, Tunnel, WorkerEvent};
use crate::ftp::protocol::{mask_command, ReplyBuffer};
use crate::ftp::proxy_script::{ProxyScript, ReplyVerdict, ScriptEnd, ScriptRunner, ScriptStep, ScriptVars};
use crate::ftp::tls::CertificateCache;
use crate::ftp::types::{
    CertificateInfo, ConnectionConfig, EngineConfig, FtpResponse, FtpSecurityMode, NeedsInput, PromptAnswer,
    PromptRequest, ProxyKind, TransferType, WorkerId,
};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsStep {
    AuthTls,
    Handshake,
    Pbsz,
    Prot,
}

/// Why the login is suspended.
#[derive(Debug, Clone, PartialEq)]
pub enum InputWait {
    /// The script lacks values; `before_connect` if nothing is open yet.
    Credentials { before_connect: bool },
    LoginRejected,
    Certificate(CertificateInfo),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnState {
    Idle,
    ResolvingAddress,
    Connecting,
    Retrying,
    AwaitingGreeting,
    SecuringChannel(TlsStep),
    RunningLoginScript,
    WaitingForInput(InputWait),
    LoggedIn,
    /// Gave up; this connection cannot be used.
    FatalError,
    /// Gave up in a way retrying the operation cannot fix.
    OperationFatalError,
    Done,
}

impl ConnState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnState::Idle => "idle",
            ConnState::ResolvingAddress => "resolving address",
            ConnState::Connecting => "connecting",
            ConnState::Retrying => "waiting to retry",
            ConnState::AwaitingGreeting => "awaiting greeting",
            ConnState::SecuringChannel(_) => "securing channel",
            ConnState::RunningLoginScript => "logging in",
            ConnState::WaitingForInput(_) => "waiting for input",
            ConnState::LoggedIn => "logged in",
            ConnState::FatalError => "fatal error",
            ConnState::OperationFatalError => "operation fatal error",
            ConnState::Done => "done",
        }
    }
}

/// What the owner of the connection needs to know about.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnEvent {
    LoggedIn,
    /// Reply to a command sent with [`ControlConnection::send_command`].
    /// Preliminary (1xx) replies are passed on too.
    Reply(FtpResponse),
    /// An attempt failed; another one is scheduled.
    Retrying(FtpError),
    /// No further attempts.
    Failed(FtpError),
    /// A logged-in connection broke; it is closed now.
    Lost(FtpError),
    /// The idle connection was given up.
    Closed,
}

pub struct ControlConnection {
    worker: WorkerId,
    config: ConnectionConfig,
    engine: Arc<EngineConfig>,
    certs: Arc<CertificateCache>,
    script: Result<ProxyScript, FtpError>,
    vars: ScriptVars,
    runner: ScriptRunner,
    state: ConnState,
    control: EpochSlot,
    prompt: EpochSlot,
    timers: Timers,
    replies: ReplyBuffer,
    attempt: u32,
    fast_retry: bool,
    resolved: Option<(String, u16, SocketAddr)>,
    local_addr: Option<SocketAddr>,
    tls_active: bool,
    /// Command verb awaiting its reply.
    awaiting: Option<String>,
    keepalive_pending: bool,
    /// Command held back until the keep-alive reply arrived.
    queued: Option<String>,
    last_error: Option<FtpError>,
    cwd: Option<String>,
    transfer_type: Option<TransferType>,
}

impl ControlConnection {
    pub fn new(
        worker: WorkerId,
        config: ConnectionConfig,
        engine: Arc<EngineConfig>,
        certs: Arc<CertificateCache>,
    ) -> Self {
        let script = ProxyScript::for_connection(&config);
        let vars = ScriptVars::from_config(&config);
        Self {
            worker,
            config,
            engine,
            certs,
            script,
            vars,
            runner: ScriptRunner::new(),
            state: ConnState::Idle,
            control: EpochSlot::default(),
            prompt: EpochSlot::default(),
            timers: Timers::default(),
            replies: ReplyBuffer::new(),
            attempt: 0,
            fast_retry: false,
            resolved: None,
            local_addr: None,
            tls_active: false,
            awaiting: None,
            keepalive_pending: false,
            queued: None,
            last_error: None,
            cwd: None,
            transfer_type: None,
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn state(&self) -> &ConnState {
        &self.state
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_logged_in(&self) -> bool {
        self.state == ConnState::LoggedIn
    }

    /// Logged in and no command outstanding.
    pub fn is_ready(&self) -> bool {
        self.is_logged_in() && self.awaiting.is_none() && !self.keepalive_pending
    }

    /// Somewhere between the first attempt and a finished login.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self.state,
            ConnState::ResolvingAddress
                | ConnState::Connecting
                | ConnState::Retrying
                | ConnState::AwaitingGreeting
                | ConnState::SecuringChannel(_)
                | ConnState::RunningLoginScript
                | ConnState::WaitingForInput(_)
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, ConnState::FatalError | ConnState::OperationFatalError)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn last_error(&self) -> Option<&FtpError> {
        self.last_error.as_ref()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Control channel runs over TLS (so data channels are protected too).
    pub fn tls_active(&self) -> bool {
        self.tls_active
    }

    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    pub fn set_cwd(&mut self, cwd: Option<String>) {
        self.cwd = cwd;
    }

    pub fn transfer_type(&self) -> Option<TransferType> {
        self.transfer_type
    }

    pub fn set_transfer_type(&mut self, t: Option<TransferType>) {
        self.transfer_type = t;
    }

    // ── Commands from the owner ──────────────────────────────────

    /// Start a fresh connect sequence. No-op while connected or connecting.
    pub fn connect(&mut self, out: &mut Outbox) -> Vec<ConnEvent> {
        let mut events = Vec::new();
        if self.is_logged_in() || self.is_connecting() {
            return events;
        }
        log::info!("{}: connecting to {}:{}", self.worker, self.config.host, self.config.port);
        self.attempt = 0;
        self.last_error = None;
        self.schedule_attempt(out, &mut events);
        events
    }

    /// Send a command on the logged-in connection and wait for its reply.
    pub fn send_command(&mut self, out: &mut Outbox, line: &str) -> Result<(), FtpError> {
        if !self.is_logged_in() || self.awaiting.is_some() {
            return Err(FtpError::protocol_error(format!(
                "cannot send '{}' while {}",
                mask_command(line),
                self.state.name()
            )));
        }
        let verb = line.split_whitespace().next().unwrap_or("").to_ascii_uppercase();
        self.awaiting = Some(verb);
        if self.keepalive_pending {
            self.queued = Some(line.to_string());
            return Ok(());
        }
        self.send_line(out, line, &mask_command(line));
        self.timers.arm(out, TimerKind::Reply, self.engine.reply_timeout());
        Ok(())
    }

    /// The owner went idle: start keep-alive.
    pub fn idle_started(&mut self, out: &mut Outbox) {
        if self.is_logged_in() && self.engine.keep_alive {
            self.timers
                .arm(out, TimerKind::KeepAlive, secs(self.engine.keep_alive_every_secs));
            self.timers
                .arm(out, TimerKind::KeepAliveStop, secs(self.engine.keep_alive_stop_after_secs));
        }
    }

    pub fn idle_ended(&mut self, out: &mut Outbox) {
        self.timers.cancel(out, TimerKind::KeepAlive);
        self.timers.cancel(out, TimerKind::KeepAliveStop);
    }

    /// Close whatever is open and return to `Idle`.
    pub fn close(&mut self, out: &mut Outbox) {
        self.drop_transport(out);
        self.state = ConnState::Idle;
    }

    /// Politely log out, then close.
    pub fn quit(&mut self, out: &mut Outbox) {
        if self.is_ready() {
            self.send_line(out, "QUIT", "QUIT");
        }
        self.close(out);
    }

    pub fn shutdown(&mut self, out: &mut Outbox) {
        self.quit(out);
        self.state = ConnState::Done;
    }

    // ── Events ───────────────────────────────────────────────────

    /// Whether `event` is addressed to the control connection.
    pub fn routes(event: &WorkerEvent) -> bool {
        match event {
            WorkerEvent::Timer(kind) => *kind != TimerKind::DataIdle,
            WorkerEvent::Resolved(_)
            | WorkerEvent::ControlConnected { .. }
            | WorkerEvent::ControlConnectFailed(_)
            | WorkerEvent::ControlData(_)
            | WorkerEvent::ControlClosed(_)
            | WorkerEvent::TlsEstablished(_)
            | WorkerEvent::TlsFailed(_)
            | WorkerEvent::PromptAnswered(_) => true,
            _ => false,
        }
    }

    pub fn handle(&mut self, epoch: Epoch, event: WorkerEvent, out: &mut Outbox) -> Vec<ConnEvent> {
        let mut events = Vec::new();
        let current = match &event {
            WorkerEvent::Timer(kind) => self.timers.fired(*kind, epoch),
            WorkerEvent::PromptAnswered(_) => self.prompt.matches(epoch),
            _ => self.control.matches(epoch),
        };
        if !current {
            log::trace!("{}: stale {:?} for {}", self.worker, event_name(&event), epoch);
            return events;
        }

        match event {
            WorkerEvent::Resolved(Ok(addr)) if self.state == ConnState::ResolvingAddress => {
                if let Some((host, port)) = self.target() {
                    self.resolved = Some((host, port, addr));
                }
                self.open_control(addr, out);
            }
            WorkerEvent::Resolved(Err(e)) => self.fail_attempt(e, out, &mut events),
            WorkerEvent::ControlConnected { local_addr } if self.state == ConnState::Connecting => {
                self.local_addr = Some(local_addr);
                if self.config.security == FtpSecurityMode::Implicit {
                    self.start_tls(out);
                } else {
                    self.state = ConnState::AwaitingGreeting;
                    self.arm_reply(out);
                }
            }
            WorkerEvent::ControlConnectFailed(e) => {
                self.resolved = None;
                self.fail_attempt(e, out, &mut events);
            }
            WorkerEvent::ControlData(bytes) => {
                self.replies.push(&bytes);
                while self.control.is_live() {
                    let Some(reply) = self.replies.next_reply() else {
                        break;
                    };
                    log::trace!(
                        "<<< {} {}",
                        reply.code,
                        reply.lines.last().map(String::as_str).unwrap_or("")
                    );
                    self.on_reply(reply, out, &mut events);
                }
            }
            WorkerEvent::ControlClosed(err) => {
                let err = err.unwrap_or_else(|| FtpError::disconnected("server closed the connection"));
                self.on_closed(err, out, &mut events);
            }
            WorkerEvent::TlsEstablished(cert) => self.on_tls(cert, out),
            WorkerEvent::TlsFailed(e) => self.fail_attempt(e, out, &mut events),
            WorkerEvent::Timer(kind) => self.on_timer(kind, out, &mut events),
            WorkerEvent::PromptAnswered(answer) => {
                self.prompt.clear();
                self.on_answer(answer, out, &mut events);
            }
            other => log::debug!(
                "{}: ignoring {} while {}",
                self.worker,
                event_name(&other),
                self.state.name()
            ),
        }
        events
    }

    fn on_reply(&mut self, reply: FtpResponse, out: &mut Outbox, events: &mut Vec<ConnEvent>) {
        match self.state.clone() {
            ConnState::AwaitingGreeting => match reply.code / 100 {
                1 => self.arm_reply(out),
                2 if self.config.security == FtpSecurityMode::Explicit && !self.tls_active => {
                    self.state = ConnState::SecuringChannel(TlsStep::AuthTls);
                    self.send_line(out, "AUTH TLS", "AUTH TLS");
                    self.arm_reply(out);
                }
                2 if self.tls_active => self.send_pbsz(out),
                2 => self.begin_login(out, events),
                _ => self.fail_attempt(FtpError::from_reply(reply.code, &reply.text()), out, events),
            },
            ConnState::SecuringChannel(step) => self.on_tls_reply(step, reply, out, events),
            ConnState::RunningLoginScript => match self.runner.on_reply(&reply) {
                ReplyVerdict::Wait => self.arm_reply(out),
                ReplyVerdict::Continue => self.advance_script(out, events),
                ReplyVerdict::Retry => {
                    self.fail_attempt(FtpError::from_reply(reply.code, &reply.text()), out, events)
                }
                ReplyVerdict::Rejected => {
                    self.last_error = Some(FtpError::auth_failed(reply.text()).with_code(reply.code));
                    let request = PromptRequest::LoginRejected {
                        worker: self.worker,
                        host: self.config.host.clone(),
                        reply: reply.text(),
                    };
                    self.ask(InputWait::LoginRejected, request, out);
                }
                ReplyVerdict::NotFtp => self.fail_hard(
                    FtpError::new(FtpErrorKind::InvalidConfig, format!("not an FTP server: {}", reply.text())),
                    out,
                    events,
                ),
            },
            ConnState::LoggedIn => self.on_logged_in_reply(reply, out, events),
            _ => log::debug!(
                "{}: reply {} ignored while {}",
                self.worker,
                reply.code,
                self.state.name()
            ),
        }
    }

    fn on_tls_reply(&mut self, step: TlsStep, reply: FtpResponse, out: &mut Outbox, events: &mut Vec<ConnEvent>) {
        if reply.is_preliminary() {
            self.arm_reply(out);
            return;
        }
        if !reply.is_completion() {
            let err = FtpError::tls_failed(format!("{:?} refused: {}", step, reply.text())).with_code(reply.code);
            self.fail_attempt(err, out, events);
            return;
        }
        match step {
            TlsStep::AuthTls => self.start_tls(out),
            TlsStep::Pbsz => {
                self.state = ConnState::SecuringChannel(TlsStep::Prot);
                self.send_line(out, "PROT P", "PROT P");
                self.arm_reply(out);
            }
            TlsStep::Prot => self.begin_login(out, events),
            TlsStep::Handshake => log::debug!("{}: reply {} during handshake", self.worker, reply.code),
        }
    }

    fn on_logged_in_reply(&mut self, reply: FtpResponse, out: &mut Outbox, events: &mut Vec<ConnEvent>) {
        if self.keepalive_pending {
            if reply.is_preliminary() {
                return;
            }
            self.keepalive_pending = false;
            self.timers.cancel(out, TimerKind::Reply);
            if reply.code == 421 {
                self.lose(FtpError::from_reply(reply.code, &reply.text()), out, events);
            } else if let Some(line) = self.queued.take() {
                self.send_line(out, &line, &mask_command(&line));
                self.arm_reply(out);
            }
            return;
        }
        if self.awaiting.is_none() {
            if reply.code == 421 {
                self.lose(FtpError::from_reply(reply.code, &reply.text()), out, events);
            } else {
                log::debug!("{}: unsolicited reply {}", self.worker, reply.code);
            }
            return;
        }
        self.timers.cancel(out, TimerKind::Reply);
        if reply.is_preliminary() {
            events.push(ConnEvent::Reply(reply));
            return;
        }
        self.awaiting = None;
        if reply.code == 421 {
            self.lose(FtpError::from_reply(reply.code, &reply.text()), out, events);
        } else {
            events.push(ConnEvent::Reply(reply));
        }
    }

    fn on_tls(&mut self, cert: CertificateInfo, out: &mut Outbox) {
        if self.state != ConnState::SecuringChannel(TlsStep::Handshake) {
            log::debug!("{}: unexpected TLS completion", self.worker);
            return;
        }
        if self.certs.allows(&cert) {
            self.after_tls(out);
        } else {
            let request = PromptRequest::Certificate {
                worker: self.worker,
                host: self.config.host.clone(),
                certificate: cert.clone(),
            };
            self.ask(InputWait::Certificate(cert), request, out);
        }
    }

    fn after_tls(&mut self, out: &mut Outbox) {
        self.tls_active = true;
        log::debug!("{}: TLS established", self.worker);
        if self.config.security == FtpSecurityMode::Implicit {
            // greeting comes over the secured channel
            self.state = ConnState::AwaitingGreeting;
            self.arm_reply(out);
        } else {
            self.send_pbsz(out);
        }
    }

    fn send_pbsz(&mut self, out: &mut Outbox) {
        self.state = ConnState::SecuringChannel(TlsStep::Pbsz);
        self.send_line(out, "PBSZ 0", "PBSZ 0");
        self.arm_reply(out);
    }

    fn on_closed(&mut self, err: FtpError, out: &mut Outbox, events: &mut Vec<ConnEvent>) {
        match &self.state {
            ConnState::LoggedIn => self.lose(err, out, events),
            ConnState::WaitingForInput(_) => {
                // wait for the answer, then reconnect at once
                log::debug!("{}: connection closed while waiting for input", self.worker);
                self.control.clear();
                self.replies.clear();
                self.fast_retry = true;
            }
            _ => self.fail_attempt(err, out, events),
        }
    }

    fn on_timer(&mut self, kind: TimerKind, out: &mut Outbox, events: &mut Vec<ConnEvent>) {
        match kind {
            TimerKind::RetryDelay if self.state == ConnState::Retrying => self.start_attempt(out, events),
            TimerKind::Reply if self.is_logged_in() => {
                self.lose(FtpError::timeout("no reply from server"), out, events)
            }
            TimerKind::Reply if self.is_connecting() => {
                self.fail_attempt(FtpError::timeout("connection attempt timed out"), out, events)
            }
            TimerKind::KeepAlive if self.is_logged_in() => {
                if self.awaiting.is_none() && !self.keepalive_pending {
                    let cmd = self.engine.keep_alive_command.command();
                    self.keepalive_pending = true;
                    self.send_line(out, cmd, cmd);
                    self.timers.arm(out, TimerKind::Reply, self.engine.reply_timeout());
                }
                self.timers
                    .arm(out, TimerKind::KeepAlive, secs(self.engine.keep_alive_every_secs));
            }
            TimerKind::KeepAliveStop if self.is_logged_in() => {
                log::info!("{}: idle too long, closing connection", self.worker);
                self.quit(out);
                events.push(ConnEvent::Closed);
            }
            _ => log::trace!("{}: {:?} timer ignored while {}", self.worker, kind, self.state.name()),
        }
    }

    fn on_answer(&mut self, answer: PromptAnswer, out: &mut Outbox, events: &mut Vec<ConnEvent>) {
        let wait = match std::mem::replace(&mut self.state, ConnState::Idle) {
            ConnState::WaitingForInput(wait) => wait,
            other => {
                self.state = other;
                return;
            }
        };

        match (wait, answer) {
            (_, PromptAnswer::Cancel) => {
                self.fail_hard(FtpError::cancelled("login cancelled by the user"), out, events)
            }
            (InputWait::Certificate(cert), PromptAnswer::AcceptCertificate) => {
                self.certs.accept(&cert.fingerprint);
                if self.control.is_live() {
                    self.state = ConnState::SecuringChannel(TlsStep::Handshake);
                    self.after_tls(out);
                } else {
                    self.fast_retry = true;
                    self.schedule_next(out, events);
                }
            }
            (InputWait::Certificate(_), _) => self.fail_hard(
                FtpError::new(FtpErrorKind::CertificateRejected, "server certificate rejected"),
                out,
                events,
            ),
            (InputWait::Credentials { before_connect }, PromptAnswer::Credentials(creds)) => {
                self.vars.apply(&creds);
                if self.control.is_live() {
                    self.state = ConnState::RunningLoginScript;
                    self.advance_script(out, events);
                } else if before_connect {
                    self.begin_connect(out, events);
                } else {
                    self.fast_retry = true;
                    self.schedule_next(out, events);
                }
            }
            (InputWait::LoginRejected, PromptAnswer::Credentials(creds)) => {
                self.vars.apply(&creds);
                let direct = self.config.proxy_kind() == ProxyKind::None;
                if direct && self.control.is_live() {
                    log::info!("{}: retrying login on the open connection", self.worker);
                    self.runner.restart();
                    self.begin_login(out, events);
                } else {
                    self.drop_transport(out);
                    self.fast_retry = true;
                    self.schedule_next(out, events);
                }
            }
            (_, PromptAnswer::AcceptCertificate) => {
                self.fail_hard(FtpError::cancelled("unexpected answer to login prompt"), out, events)
            }
        }
    }

    // ── Connect sequence ─────────────────────────────────────────

    /// Next attempt now (first attempt or fast retry) or after the delay.
    fn schedule_attempt(&mut self, out: &mut Outbox, events: &mut Vec<ConnEvent>) {
        if std::mem::take(&mut self.fast_retry) || self.attempt == 0 {
            self.start_attempt(out, events);
        } else {
            self.state = ConnState::Retrying;
            let delay = self.engine.retry_delay(self.attempt + 1);
            log::debug!("{}: next attempt in {:?}", self.worker, delay);
            self.timers.arm(out, TimerKind::RetryDelay, delay);
        }
    }

    /// Like [`schedule_attempt`](Self::schedule_attempt) but honours the bound.
    fn schedule_next(&mut self, out: &mut Outbox, events: &mut Vec<ConnEvent>) {
        if self.attempt >= self.max_attempts() {
            let err = self
                .last_error
                .clone()
                .unwrap_or_else(|| FtpError::disconnected("connection lost"));
            self.state = ConnState::FatalError;
            events.push(ConnEvent::Failed(err));
        } else {
            self.schedule_attempt(out, events);
        }
    }

    fn max_attempts(&self) -> u32 {
        self.engine.connect_retries.saturating_add(1)
    }

    fn start_attempt(&mut self, out: &mut Outbox, events: &mut Vec<ConnEvent>) {
        self.attempt += 1;
        self.fast_retry = false;
        self.runner.restart();
        self.drop_transport(out);
        log::debug!("{}: connection attempt {}/{}", self.worker, self.attempt, self.max_attempts());
        self.begin_connect(out, events);
    }

    fn target(&self) -> Option<(String, u16)> {
        match &self.script {
            Ok(script) => script.connect_target(&self.vars).ok()?.ok(),
            Err(_) => None,
        }
    }

    fn begin_connect(&mut self, out: &mut Outbox, events: &mut Vec<ConnEvent>) {
        let target = match &self.script {
            Ok(script) => script.connect_target(&self.vars),
            Err(e) => Err(e.clone()),
        };
        match target {
            Err(e) => self.fail_hard(e, out, events),
            Ok(Err(needs)) => self.ask_credentials(needs, true, out),
            Ok(Ok((host, port))) => match &self.resolved {
                Some((h, p, addr)) if *h == host && *p == port => {
                    let addr = *addr;
                    self.open_control(addr, out);
                }
                _ => {
                    self.state = ConnState::ResolvingAddress;
                    let epoch = out.issue();
                    self.control.set(epoch);
                    out.push(Action::Resolve { epoch, host, port });
                    self.arm_reply(out);
                }
            },
        }
    }

    fn open_control(&mut self, addr: SocketAddr, out: &mut Outbox) {
        self.state = ConnState::Connecting;
        let epoch = out.issue();
        self.control.set(epoch);
        let tunnel = self
            .config
            .proxy
            .as_ref()
            .filter(|p| p.kind.is_tunnel())
            .map(|p| Tunnel {
                kind: p.kind,
                host: self.vars.host.clone(),
                port: self.vars.port,
                user: Some(self.vars.proxy_user.clone()).filter(|u| !u.is_empty()),
                password: self.vars.proxy_password.clone(),
            });
        out.push(Action::OpenControl { epoch, addr, tunnel });
        self.arm_reply(out);
    }

    fn start_tls(&mut self, out: &mut Outbox) {
        self.state = ConnState::SecuringChannel(TlsStep::Handshake);
        if let Some(epoch) = self.control.get() {
            out.push(Action::StartTls {
                epoch,
                server_name: self.config.host.clone(),
            });
        }
        self.arm_reply(out);
    }

    fn begin_login(&mut self, out: &mut Outbox, events: &mut Vec<ConnEvent>) {
        self.state = ConnState::RunningLoginScript;
        self.advance_script(out, events);
    }

    fn advance_script(&mut self, out: &mut Outbox, events: &mut Vec<ConnEvent>) {
        let step = match &self.script {
            Ok(script) => self.runner.next(script, &self.vars),
            Err(e) => Err(e.clone()),
        };
        match step {
            Err(e) => self.fail_hard(e, out, events),
            Ok(ScriptStep::Send { command, log }) => {
                self.send_line(out, &command, &log);
                self.arm_reply(out);
            }
            Ok(ScriptStep::NeedsInput(needs)) => self.ask_credentials(needs, false, out),
            Ok(ScriptStep::Finished(ScriptEnd::LoggedIn)) => {
                self.timers.cancel(out, TimerKind::Reply);
                self.state = ConnState::LoggedIn;
                self.last_error = None;
                log::info!(
                    "{}: logged in to {} after {} attempt(s)",
                    self.worker,
                    self.config.host,
                    self.attempt
                );
                events.push(ConnEvent::LoggedIn);
            }
            Ok(ScriptStep::Finished(ScriptEnd::Incomplete)) => self.fail_hard(
                FtpError::new(
                    FtpErrorKind::IncompleteScript,
                    "server still expects input after the last login command",
                ),
                out,
                events,
            ),
            Ok(ScriptStep::Finished(ScriptEnd::NothingSent)) => self.fail_hard(
                FtpError::invalid_script("login script did not send any command"),
                out,
                events,
            ),
        }
    }

    fn ask_credentials(&mut self, needs: NeedsInput, before_connect: bool, out: &mut Outbox) {
        let request = PromptRequest::Credentials {
            worker: self.worker,
            host: self.config.host.clone(),
            needs,
        };
        self.ask(InputWait::Credentials { before_connect }, request, out);
    }

    fn ask(&mut self, wait: InputWait, request: PromptRequest, out: &mut Outbox) {
        self.timers.cancel(out, TimerKind::Reply);
        self.state = ConnState::WaitingForInput(wait);
        let epoch = out.issue();
        self.prompt.set(epoch);
        out.push(Action::Prompt { epoch, request });
    }

    // ── Failure paths ────────────────────────────────────────────

    /// Recoverable failure of the current attempt.
    fn fail_attempt(&mut self, err: FtpError, out: &mut Outbox, events: &mut Vec<ConnEvent>) {
        if err.is_fatal() {
            self.fail_hard(err, out, events);
            return;
        }
        self.drop_transport(out);
        self.last_error = Some(err.clone());
        if self.attempt >= self.max_attempts() {
            log::warn!(
                "{}: giving up after {} attempt(s): {}",
                self.worker,
                self.attempt,
                err
            );
            self.state = ConnState::FatalError;
            events.push(ConnEvent::Failed(err));
            return;
        }
        log::warn!(
            "{}: attempt {}/{} failed: {}",
            self.worker,
            self.attempt,
            self.max_attempts(),
            err
        );
        events.push(ConnEvent::Retrying(err));
        self.schedule_attempt(out, events);
    }

    fn fail_hard(&mut self, err: FtpError, out: &mut Outbox, events: &mut Vec<ConnEvent>) {
        self.drop_transport(out);
        self.timers.cancel_all(out);
        self.state = match err.kind {
            FtpErrorKind::InvalidScript
            | FtpErrorKind::IncompleteScript
            | FtpErrorKind::CertificateRejected
            | FtpErrorKind::Cancelled
            | FtpErrorKind::InvalidConfig => ConnState::OperationFatalError,
            _ => ConnState::FatalError,
        };
        log::warn!("{}: {}: {}", self.worker, self.state.name(), err);
        self.last_error = Some(err.clone());
        events.push(ConnEvent::Failed(err));
    }

    /// A logged-in session broke.
    fn lose(&mut self, err: FtpError, out: &mut Outbox, events: &mut Vec<ConnEvent>) {
        log::warn!("{}: connection lost: {}", self.worker, err);
        self.drop_transport(out);
        self.timers.cancel_all(out);
        self.state = ConnState::Idle;
        self.fast_retry = true;
        self.last_error = Some(err.clone());
        events.push(ConnEvent::Lost(err));
    }

    fn drop_transport(&mut self, out: &mut Outbox) {
        if self.control.clear().is_some() {
            out.push(Action::CloseControl);
        }
        self.prompt.clear();
        self.replies.clear();
        self.timers.cancel(out, TimerKind::Reply);
        self.timers.cancel(out, TimerKind::KeepAlive);
        self.timers.cancel(out, TimerKind::KeepAliveStop);
        self.awaiting = None;
        self.keepalive_pending = false;
        self.queued = None;
        self.tls_active = false;
        self.local_addr = None;
        self.cwd = None;
        self.transfer_type = None;
    }

    // ── Helpers ──────────────────────────────────────────────────

    fn send_line(&mut self, out: &mut Outbox, line: &str, log_line: &str) {
        let Some(epoch) = self.control.get() else {
            log::debug!("{}: no connection for '{}'", self.worker, log_line);
            return;
        };
        log::trace!(">>> {}", log_line);
        out.push(Action::SendControl {
            epoch,
            line: line.to_string(),
        });
    }

    fn arm_reply(&mut self, out: &mut Outbox) {
        self.timers.arm(out, TimerKind::Reply, self.engine.reply_timeout());
    }
}

fn secs(s: u64) -> std::time::Duration {
    std::time::Duration::from_secs(s)
}

fn event_name(event: &WorkerEvent) -> &'static str {
    match event {
        WorkerEvent::Resolved(_) => "Resolved",
        WorkerEvent::ControlConnected { .. } => "ControlConnected",
        WorkerEvent::ControlConnectFailed(_) => "ControlConnectFailed",
        WorkerEvent::ControlData(_) => "ControlData",
        WorkerEvent::ControlClosed(_) => "ControlClosed",
        WorkerEvent::TlsEstablished(_) => "TlsEstablished",
        WorkerEvent::TlsFailed(_) => "TlsFailed",
        WorkerEvent::DataListening(_) => "DataListening",
        WorkerEvent::DataConnected => "DataConnected",
        WorkerEvent::DataConnectFailed(_) => "DataConnectFailed",
        WorkerEvent::DataReceived(_) => "DataReceived",
        WorkerEvent::DataWritten(_) => "DataWritten",
        WorkerEvent::DataClosed(_) => "DataClosed",
        WorkerEvent::Timer(_) => "Timer",
        WorkerEvent::DiskDone(_) => "DiskDone",
        WorkerEvent::PromptAnswered(_) => "PromptAnswered",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::types::{Credentials, ProxyConfig};
    use std::collections::HashMap;

    /// Feeds events with the epochs the connection last handed out.
    struct Rig {
        conn: ControlConnection,
        out: Outbox,
        control: Option<Epoch>,
        prompt: Option<Epoch>,
        timers: HashMap<TimerKind, Epoch>,
        sent: Vec<String>,
        opens: usize,
        closes: usize,
        tls_starts: usize,
    }

    impl Rig {
        fn new(config: ConnectionConfig, engine: EngineConfig) -> Self {
            let conn = ControlConnection::new(
                WorkerId(0),
                config,
                Arc::new(engine),
                Arc::new(CertificateCache::new()),
            );
            Self {
                conn,
                out: Outbox::new(),
                control: None,
                prompt: None,
                timers: HashMap::new(),
                sent: Vec::new(),
                opens: 0,
                closes: 0,
                tls_starts: 0,
            }
        }

        fn direct() -> Self {
            let config = ConnectionConfig {
                host: "ftp.example".into(),
                user: Some("bob".into()),
                password: Some("pw".into()),
                ..Default::default()
            };
            Self::new(config, EngineConfig::default())
        }

        fn absorb(&mut self) {
            for action in self.out.drain() {
                match action {
                    Action::Resolve { epoch, .. } => self.control = Some(epoch),
                    Action::OpenControl { epoch, .. } => {
                        self.control = Some(epoch);
                        self.opens += 1;
                    }
                    Action::SendControl { line, .. } => self.sent.push(line),
                    Action::StartTls { .. } => self.tls_starts += 1,
                    Action::CloseControl => self.closes += 1,
                    Action::ArmTimer { epoch, kind, .. } => {
                        self.timers.insert(kind, epoch);
                    }
                    Action::CancelTimer { kind } => {
                        self.timers.remove(&kind);
                    }
                    Action::Prompt { epoch, .. } => self.prompt = Some(epoch),
                    _ => {}
                }
            }
        }

        fn connect(&mut self) -> Vec<ConnEvent> {
            let ev = self.conn.connect(&mut self.out);
            self.absorb();
            ev
        }

        fn feed(&mut self, event: WorkerEvent) -> Vec<ConnEvent> {
            let epoch = match &event {
                WorkerEvent::Timer(kind) => self.timers[kind],
                WorkerEvent::PromptAnswered(_) => self.prompt.unwrap(),
                _ => self.control.unwrap(),
            };
            let ev = self.conn.handle(epoch, event, &mut self.out);
            self.absorb();
            ev
        }

        fn reply(&mut self, text: &str) -> Vec<ConnEvent> {
            self.feed(WorkerEvent::ControlData(format!("{}\r\n", text).into_bytes()))
        }

        fn open(&mut self) {
            self.feed(WorkerEvent::Resolved(Ok("127.0.0.1:21".parse().unwrap())));
            self.feed(WorkerEvent::ControlConnected {
                local_addr: "127.0.0.1:50000".parse().unwrap(),
            });
        }

        fn last_sent(&self) -> &str {
            self.sent.last().map(String::as_str).unwrap_or("")
        }
    }

    fn login(rig: &mut Rig) {
        rig.connect();
        rig.open();
        rig.reply("220 welcome");
        rig.reply("331 password");
        assert_eq!(rig.reply("230 ok"), vec![ConnEvent::LoggedIn]);
    }

    #[test]
    fn test_direct_login() {
        let mut rig = Rig::direct();
        rig.connect();
        assert_eq!(rig.conn.state(), &ConnState::ResolvingAddress);
        rig.open();
        assert_eq!(rig.conn.state(), &ConnState::AwaitingGreeting);
        rig.reply("120 wait a moment");
        assert!(rig.sent.is_empty());
        rig.reply("220 welcome");
        assert_eq!(rig.last_sent(), "USER bob");
        rig.reply("331 password");
        assert_eq!(rig.last_sent(), "PASS pw");
        assert_eq!(rig.reply("230 ok"), vec![ConnEvent::LoggedIn]);
        assert!(rig.conn.is_ready());
        assert!(!rig.timers.contains_key(&TimerKind::Reply));
    }

    #[test]
    fn test_retry_bound_and_delay() {
        let engine = EngineConfig {
            connect_retries: 2,
            delay_between_retries_secs: 5,
            ..Default::default()
        };
        let config = ConnectionConfig {
            host: "h".into(),
            ..Default::default()
        };
        let mut rig = Rig::new(config, engine);
        rig.connect();
        rig.feed(WorkerEvent::Resolved(Ok("10.0.0.1:21".parse().unwrap())));

        for attempt in 1..=3 {
            assert_eq!(rig.opens, attempt);
            let ev = rig.feed(WorkerEvent::ControlConnectFailed(FtpError::transport("refused")));
            if attempt < 3 {
                assert!(matches!(ev[0], ConnEvent::Retrying(_)));
                assert_eq!(rig.conn.state(), &ConnState::Retrying);
                // address is re-resolved after a failed connect
                rig.feed(WorkerEvent::Timer(TimerKind::RetryDelay));
                rig.feed(WorkerEvent::Resolved(Ok("10.0.0.1:21".parse().unwrap())));
            } else {
                assert_eq!(ev, vec![ConnEvent::Failed(FtpError::transport("refused"))]);
                assert_eq!(rig.conn.state(), &ConnState::FatalError);
            }
        }
        assert_eq!(rig.conn.attempts(), 3);
    }

    #[test]
    fn test_4xx_during_login_retries() {
        let mut rig = Rig::direct();
        rig.connect();
        rig.open();
        rig.reply("220 hi");
        let ev = rig.reply("421 too many users");
        assert!(matches!(&ev[0], ConnEvent::Retrying(e) if e.code == Some(421)));
        assert_eq!(rig.closes, 1);
    }

    #[test]
    fn test_login_rejected_restarts_script_on_same_connection() {
        let mut rig = Rig::direct();
        rig.connect();
        rig.open();
        rig.reply("220 hi");
        rig.reply("331 password");
        rig.reply("530 login incorrect");
        assert!(matches!(
            rig.conn.state(),
            ConnState::WaitingForInput(InputWait::LoginRejected)
        ));
        rig.feed(WorkerEvent::PromptAnswered(PromptAnswer::Credentials(Credentials {
            password: Some("right".into()),
            ..Default::default()
        })));
        assert_eq!(rig.opens, 1);
        assert_eq!(rig.last_sent(), "USER bob");
        rig.reply("331 password");
        assert_eq!(rig.last_sent(), "PASS right");
        assert_eq!(rig.reply("230 ok"), vec![ConnEvent::LoggedIn]);
    }

    #[test]
    fn test_cancelled_prompt_is_operation_fatal() {
        let mut rig = Rig::direct();
        rig.connect();
        rig.open();
        rig.reply("220 hi");
        rig.reply("530 no");
        let ev = rig.feed(WorkerEvent::PromptAnswered(PromptAnswer::Cancel));
        assert!(matches!(&ev[0], ConnEvent::Failed(e) if e.kind == FtpErrorKind::Cancelled));
        assert_eq!(rig.conn.state(), &ConnState::OperationFatalError);
    }

    #[test]
    fn test_missing_password_prompts_before_sending() {
        let config = ConnectionConfig {
            host: "h".into(),
            user: Some("bob".into()),
            password: None,
            ..Default::default()
        };
        let mut rig = Rig::new(config, EngineConfig::default());
        rig.connect();
        rig.open();
        rig.reply("220 hi");
        rig.reply("331 password");
        assert!(matches!(
            rig.conn.state(),
            ConnState::WaitingForInput(InputWait::Credentials { before_connect: false })
        ));
        rig.feed(WorkerEvent::PromptAnswered(PromptAnswer::Credentials(Credentials {
            password: Some("typed".into()),
            ..Default::default()
        })));
        assert_eq!(rig.last_sent(), "PASS typed");
    }

    #[test]
    fn test_stale_epoch_is_ignored() {
        let mut rig = Rig::direct();
        rig.connect();
        rig.open();
        let old = rig.control.unwrap();
        rig.reply("421 busy");
        rig.feed(WorkerEvent::Timer(TimerKind::RetryDelay));
        rig.feed(WorkerEvent::ControlConnected {
            local_addr: "127.0.0.1:50001".parse().unwrap(),
        });
        let sent_before = rig.sent.len();
        let ev = rig
            .conn
            .handle(old, WorkerEvent::ControlData(b"220 late\r\n".to_vec()), &mut rig.out);
        assert!(ev.is_empty());
        assert!(rig.out.is_empty());
        assert_eq!(rig.sent.len(), sent_before);
        assert_eq!(rig.conn.state(), &ConnState::AwaitingGreeting);
    }

    #[test]
    fn test_explicit_tls_with_certificate_prompt() {
        let config = ConnectionConfig {
            host: "secure.example".into(),
            security: FtpSecurityMode::Explicit,
            ..Default::default()
        };
        let mut rig = Rig::new(config, EngineConfig::default());
        rig.connect();
        rig.open();
        rig.reply("220 hi");
        assert_eq!(rig.last_sent(), "AUTH TLS");
        rig.reply("234 go ahead");
        assert_eq!(rig.tls_starts, 1);
        let cert = CertificateInfo {
            fingerprint: "aa".into(),
            trusted: false,
            verify_error: Some("self signed".into()),
        };
        rig.feed(WorkerEvent::TlsEstablished(cert));
        assert!(matches!(
            rig.conn.state(),
            ConnState::WaitingForInput(InputWait::Certificate(_))
        ));
        rig.feed(WorkerEvent::PromptAnswered(PromptAnswer::AcceptCertificate));
        assert_eq!(rig.last_sent(), "PBSZ 0");
        rig.reply("200 ok");
        assert_eq!(rig.last_sent(), "PROT P");
        rig.reply("200 ok");
        assert_eq!(rig.last_sent(), "USER anonymous");
        assert!(rig.conn.tls_active());
        assert!(rig.conn.certs.contains("aa"));
    }

    #[test]
    fn test_implicit_tls_handshakes_before_greeting() {
        let config = ConnectionConfig {
            host: "secure.example".into(),
            port: 990,
            security: FtpSecurityMode::Implicit,
            ..Default::default()
        };
        let mut rig = Rig::new(config, EngineConfig::default());
        rig.connect();
        rig.open();
        assert_eq!(rig.tls_starts, 1);
        rig.feed(WorkerEvent::TlsEstablished(CertificateInfo {
            fingerprint: "bb".into(),
            trusted: true,
            verify_error: None,
        }));
        assert_eq!(rig.conn.state(), &ConnState::AwaitingGreeting);
        rig.reply("220 hi");
        assert_eq!(rig.last_sent(), "PBSZ 0");
    }

    #[test]
    fn test_invalid_custom_script_is_operation_fatal() {
        let config = ConnectionConfig {
            host: "h".into(),
            proxy: Some(ProxyConfig {
                kind: ProxyKind::Custom,
                script: Some("USER x".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut rig = Rig::new(config, EngineConfig::default());
        let ev = rig.connect();
        assert!(matches!(&ev[0], ConnEvent::Failed(e) if e.kind == FtpErrorKind::InvalidScript));
        assert_eq!(rig.conn.state(), &ConnState::OperationFatalError);
    }

    #[test]
    fn test_incomplete_script() {
        let config = ConnectionConfig {
            host: "h".into(),
            proxy: Some(ProxyConfig {
                kind: ProxyKind::Custom,
                script: Some("Connect to: $(Host)\nUSER $(User)\n".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut rig = Rig::new(config, EngineConfig::default());
        rig.connect();
        rig.open();
        rig.reply("220 hi");
        let ev = rig.reply("331 need more");
        assert!(matches!(&ev[0], ConnEvent::Failed(e) if e.kind == FtpErrorKind::IncompleteScript));
    }

    #[test]
    fn test_socks_tunnel_targets_server() {
        let config = ConnectionConfig {
            host: "inner.example".into(),
            proxy: Some(ProxyConfig {
                kind: ProxyKind::Socks5,
                host: "socks.example".into(),
                user: Some("pu".into()),
                password: Some("pp".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut conn = ControlConnection::new(
            WorkerId(1),
            config,
            Arc::new(EngineConfig::default()),
            Arc::new(CertificateCache::new()),
        );
        let mut out = Outbox::new();
        conn.connect(&mut out);
        let epoch = match out.drain().into_iter().find(|a| a.name() == "Resolve") {
            Some(Action::Resolve { epoch, host, port }) => {
                assert_eq!((host.as_str(), port), ("socks.example", 1080));
                epoch
            }
            other => panic!("{:?}", other),
        };
        conn.handle(epoch, WorkerEvent::Resolved(Ok("10.1.1.1:1080".parse().unwrap())), &mut out);
        let tunnel = out.drain().into_iter().find_map(|a| match a {
            Action::OpenControl { tunnel, .. } => tunnel,
            _ => None,
        });
        let tunnel = tunnel.unwrap();
        assert_eq!(tunnel.host, "inner.example");
        assert_eq!(tunnel.port, 21);
        assert_eq!(tunnel.user.as_deref(), Some("pu"));
    }

    #[test]
    fn test_commands_and_421_loss() {
        let mut rig = Rig::direct();
        login(&mut rig);
        rig.conn.send_command(&mut rig.out, "CWD /pub").unwrap();
        rig.absorb();
        assert!(!rig.conn.is_ready());
        assert!(rig.conn.send_command(&mut rig.out, "PWD").is_err());
        assert_eq!(
            rig.reply("250 ok"),
            vec![ConnEvent::Reply(FtpResponse::new(250, "250 ok"))]
        );

        rig.conn.send_command(&mut rig.out, "PASV").unwrap();
        rig.absorb();
        let ev = rig.reply("421 timeout");
        assert!(matches!(&ev[0], ConnEvent::Lost(e) if e.code == Some(421)));
        assert_eq!(rig.conn.state(), &ConnState::Idle);

        // reconnecting after a drop starts immediately
        let opens = rig.opens;
        rig.connect();
        assert_eq!(rig.conn.state(), &ConnState::Connecting);
        assert_eq!(rig.opens, opens + 1);
    }

    #[test]
    fn test_keep_alive_and_idle_stop() {
        let mut rig = Rig::direct();
        login(&mut rig);
        rig.conn.idle_started(&mut rig.out);
        rig.absorb();
        rig.feed(WorkerEvent::Timer(TimerKind::KeepAlive));
        assert_eq!(rig.last_sent(), "NOOP");
        assert!(rig.reply("200 ok").is_empty());
        assert!(rig.conn.is_ready());

        let ev = rig.feed(WorkerEvent::Timer(TimerKind::KeepAliveStop));
        assert_eq!(ev, vec![ConnEvent::Closed]);
        assert_eq!(rig.last_sent(), "QUIT");
        assert_eq!(rig.conn.state(), &ConnState::Idle);
    }

    #[test]
    fn test_command_waits_for_keep_alive_reply() {
        let mut rig = Rig::direct();
        login(&mut rig);
        rig.conn.idle_started(&mut rig.out);
        rig.absorb();
        rig.feed(WorkerEvent::Timer(TimerKind::KeepAlive));
        rig.conn.idle_ended(&mut rig.out);
        rig.conn.send_command(&mut rig.out, "CWD /x").unwrap();
        rig.absorb();
        assert_eq!(rig.last_sent(), "NOOP");
        assert!(rig.reply("200 noop").is_empty());
        assert_eq!(rig.last_sent(), "CWD /x");
        assert_eq!(
            rig.reply("250 ok"),
            vec![ConnEvent::Reply(FtpResponse::new(250, "250 ok"))]
        );
    }

    #[test]
    fn test_reply_timeout_while_logged_in_loses_connection() {
        let mut rig = Rig::direct();
        login(&mut rig);
        rig.conn.send_command(&mut rig.out, "LIST").unwrap();
        rig.absorb();
        let ev = rig.feed(WorkerEvent::Timer(TimerKind::Reply));
        assert!(matches!(&ev[0], ConnEvent::Lost(e) if e.kind == FtpErrorKind::Timeout));
    }
}
