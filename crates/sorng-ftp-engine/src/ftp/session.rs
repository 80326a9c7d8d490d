//! A single logged-in control channel for one-shot commands.
//!
//! Uses the same [`ControlConnection`] as the workers (proxy scripts,
//! TLS, retries) but hands replies straight to the caller.

use crate::ftp::control::{ConnEvent, ControlConnection};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::events::Outbox;
use crate::ftp::reactor::{Io, Msg};
use crate::ftp::tls::{CertificateCache, TlsContext};
use crate::ftp::types::{ConnectionConfig, EngineConfig, FtpResponse, Prompter, WorkerId};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const SESSION: WorkerId = WorkerId(0);

pub struct ControlSession {
    conn: ControlConnection,
    out: Outbox,
    io: Io,
    rx: mpsc::UnboundedReceiver<Msg>,
    replies: VecDeque<FtpResponse>,
    reply_timeout: Duration,
}

impl ControlSession {
    /// Connect, secure and log in; then change to the initial path if one
    /// is configured.
    pub async fn connect(
        config: ConnectionConfig,
        engine: EngineConfig,
        prompter: Arc<dyn Prompter>,
    ) -> FtpResult<Self> {
        Self::connect_with_tls(config, engine, prompter, TlsContext::with_native_roots()).await
    }

    pub async fn connect_with_tls(
        config: ConnectionConfig,
        engine: EngineConfig,
        prompter: Arc<dyn Prompter>,
        tls: TlsContext,
    ) -> FtpResult<Self> {
        let engine = Arc::new(engine);
        let (tx, rx) = mpsc::unbounded_channel();
        let initial_path = config.initial_path.clone();
        let io = Io::new(tx, Arc::new(tls), Arc::clone(&engine), config.host.clone(), prompter, None);
        let conn = ControlConnection::new(SESSION, config, Arc::clone(&engine), Arc::new(CertificateCache::new()));

        let mut session = Self {
            conn,
            out: Outbox::new(),
            io,
            rx,
            replies: VecDeque::new(),
            reply_timeout: engine.reply_timeout(),
        };

        let events = session.conn.connect(&mut session.out);
        session.absorb(events)?;
        while !session.conn.is_logged_in() {
            session.pump().await?;
        }

        if let Some(path) = initial_path.filter(|p| !p.is_empty()) {
            let reply = session.execute(&format!("CWD {}", path)).await?;
            if !reply.is_completion() {
                return Err(FtpError::from_reply(reply.code, &reply.text()));
            }
            session.conn.set_cwd(Some(path));
        }
        Ok(session)
    }

    pub fn is_logged_in(&self) -> bool {
        self.conn.is_logged_in()
    }

    pub fn tls_active(&self) -> bool {
        self.conn.tls_active()
    }

    /// Directory last changed to with a successful `CWD`.
    pub fn cwd(&self) -> Option<&str> {
        self.conn.cwd()
    }

    /// Write a command; its replies are read with [`read_reply`](Self::read_reply).
    pub fn send_command(&mut self, line: &str) -> FtpResult<()> {
        self.conn.send_command(&mut self.out, line)?;
        self.flush();
        Ok(())
    }

    /// Next reply, preliminary ones included.
    pub async fn read_reply(&mut self) -> FtpResult<FtpResponse> {
        let limit = self.reply_timeout;
        let read = async {
            loop {
                if let Some(reply) = self.replies.pop_front() {
                    return Ok(reply);
                }
                self.pump().await?;
            }
        };
        timeout(limit, read)
            .await
            .map_err(|_| FtpError::timeout("no reply from the server"))?
    }

    /// Send `line` and return its final (non-1xx) reply.
    pub async fn execute(&mut self, line: &str) -> FtpResult<FtpResponse> {
        self.send_command(line)?;
        loop {
            let reply = self.read_reply().await?;
            if !reply.is_preliminary() {
                return Ok(reply);
            }
        }
    }

    /// Log out and close the connection.
    pub async fn quit(mut self) -> FtpResult<()> {
        self.conn.shutdown(&mut self.out);
        self.flush();
        self.io.close_all();
        Ok(())
    }

    async fn pump(&mut self) -> FtpResult<()> {
        self.flush();
        let Some(msg) = self.rx.recv().await else {
            return Err(FtpError::disconnected("session closed"));
        };
        if let Msg::Event(_, epoch, event) = msg {
            let events = self.conn.handle(epoch, event, &mut self.out);
            self.absorb(events)?;
        }
        self.flush();
        Ok(())
    }

    fn absorb(&mut self, events: Vec<ConnEvent>) -> FtpResult<()> {
        for event in events {
            match event {
                ConnEvent::LoggedIn => log::info!("session: logged in to {}", self.conn.config().host),
                ConnEvent::Reply(reply) => self.replies.push_back(reply),
                ConnEvent::Retrying(e) => log::warn!("session: attempt failed, retrying: {}", e),
                ConnEvent::Failed(e) | ConnEvent::Lost(e) => {
                    self.flush();
                    return Err(e);
                }
                ConnEvent::Closed => return Err(FtpError::disconnected("idle connection closed")),
            }
        }
        Ok(())
    }

    fn flush(&mut self) {
        for action in self.out.drain() {
            self.io.execute(SESSION, action);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::error::FtpErrorKind;
    use crate::ftp::types::DenyAllPrompter;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Serve one connection: greet, then answer each expected line in turn.
    async fn serve(script: Vec<(&'static str, &'static str)>) -> (u16, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            write.write_all(b"220 ready\r\n").await.unwrap();
            let mut seen = Vec::new();
            for (expect, answer) in script {
                let Ok(Some(line)) = lines.next_line().await else {
                    break;
                };
                assert_eq!(line, expect);
                seen.push(line);
                write.write_all(answer.as_bytes()).await.unwrap();
            }
            seen
        });
        (port, task)
    }

    fn config(port: u16) -> ConnectionConfig {
        ConnectionConfig {
            host: "127.0.0.1".into(),
            port,
            ..Default::default()
        }
    }

    fn engine() -> EngineConfig {
        EngineConfig {
            connect_retries: 0,
            server_reply_timeout_secs: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_login_and_execute() {
        let (port, server) = serve(vec![
            ("USER anonymous", "331 password please\r\n"),
            ("PASS anonymous@", "230 welcome\r\n"),
            ("CWD /pub", "250 ok\r\n"),
            ("PWD", "257 \"/pub\" is current\r\n"),
            ("QUIT", "221 bye\r\n"),
        ])
        .await;
        let mut cfg = config(port);
        cfg.initial_path = Some("/pub".into());

        let mut session = ControlSession::connect(cfg, engine(), Arc::new(DenyAllPrompter))
            .await
            .unwrap();
        assert!(session.is_logged_in());
        assert_eq!(session.cwd(), Some("/pub"));

        let reply = session.execute("PWD").await.unwrap();
        assert_eq!(reply.code, 257);
        session.quit().await.unwrap();

        let seen = server.await.unwrap();
        assert_eq!(seen.last().map(String::as_str), Some("QUIT"));
    }

    #[tokio::test]
    async fn test_rejected_login_fails_after_prompt() {
        let (port, _server) = serve(vec![
            ("USER anonymous", "331 password please\r\n"),
            ("PASS anonymous@", "530 login incorrect\r\n"),
        ])
        .await;
        let err = ControlSession::connect(config(port), engine(), Arc::new(DenyAllPrompter))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, FtpErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_command_rejected_while_waiting() {
        let (port, _server) = serve(vec![
            ("USER anonymous", "331 password please\r\n"),
            ("PASS anonymous@", "230 welcome\r\n"),
            ("NOOP", "200 ok\r\n"),
        ])
        .await;
        let mut session = ControlSession::connect(config(port), engine(), Arc::new(DenyAllPrompter))
            .await
            .unwrap();
        session.send_command("NOOP").unwrap();
        assert!(session.send_command("PWD").is_err());
        assert_eq!(session.read_reply().await.unwrap().code, 200);
    }
}
