//! Proxy login scripts.
//!
//! A script describes how to log in through a firewall or proxy:
//!
//! ```text
//! Connect to: $(ProxyHost):$(ProxyPort)
//! USER $(ProxyUser)
//! 3xx: PASS $(ProxyPassword)
//! SITE $(Host):$(Port)
//! USER $(User)
//! 3xx: PASS $(Password)
//! 3xx: ACCT $(Account)
//! ```
//!
//! The first line names the address to open. Every following line is one
//! command; a `3xx:` prefix sends it only when the previous reply was 3xx.
//! Variables are case-insensitive; `$$` is a literal `$`. The short forms
//! `{user}`, `{password}`, `{host}`, `{port}`, `{account}`, `{proxyhost}`,
//! `{proxyport}`, `{proxyuser}` and `{proxypassword}` are accepted as well.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::{ConnectionConfig, Credentials, FtpResponse, NeedsInput, ProxyKind, ReplyClass};

/// Script text for a built-in proxy kind. `Custom` has none.
pub fn builtin_script(kind: ProxyKind) -> Option<&'static str> {
    let text = match kind {
        ProxyKind::None => {
            "Connect to: $(Host):$(Port)\n\
             USER $(User)\n\
             3xx: PASS $(Password)\n\
             3xx: ACCT $(Account)\n"
        }
        ProxyKind::Socks4 | ProxyKind::Socks4a | ProxyKind::Socks5 | ProxyKind::HttpConnect => {
            "Connect to: $(ProxyHost):$(ProxyPort)\n\
             USER $(User)\n\
             3xx: PASS $(Password)\n\
             3xx: ACCT $(Account)\n"
        }
        ProxyKind::SiteHostColonPort => {
            "Connect to: $(ProxyHost):$(ProxyPort)\n\
             USER $(ProxyUser)\n\
             3xx: PASS $(ProxyPassword)\n\
             SITE $(Host):$(Port)\n\
             USER $(User)\n\
             3xx: PASS $(Password)\n\
             3xx: ACCT $(Account)\n"
        }
        ProxyKind::SiteHostSpacePort => {
            "Connect to: $(ProxyHost):$(ProxyPort)\n\
             USER $(ProxyUser)\n\
             3xx: PASS $(ProxyPassword)\n\
             SITE $(Host) $(Port)\n\
             USER $(User)\n\
             3xx: PASS $(Password)\n\
             3xx: ACCT $(Account)\n"
        }
        ProxyKind::SiteUserHostColonPort => {
            "Connect to: $(ProxyHost):$(ProxyPort)\n\
             USER $(ProxyUser)\n\
             3xx: PASS $(ProxyPassword)\n\
             SITE $(User)@$(Host):$(Port)\n\
             3xx: PASS $(Password)\n\
             3xx: ACCT $(Account)\n"
        }
        ProxyKind::SiteUserHostSpacePort => {
            "Connect to: $(ProxyHost):$(ProxyPort)\n\
             USER $(ProxyUser)\n\
             3xx: PASS $(ProxyPassword)\n\
             SITE $(User)@$(Host) $(Port)\n\
             3xx: PASS $(Password)\n\
             3xx: ACCT $(Account)\n"
        }
        ProxyKind::OpenHostColonPort => {
            "Connect to: $(ProxyHost):$(ProxyPort)\n\
             USER $(ProxyUser)\n\
             3xx: PASS $(ProxyPassword)\n\
             OPEN $(Host):$(Port)\n\
             USER $(User)\n\
             3xx: PASS $(Password)\n\
             3xx: ACCT $(Account)\n"
        }
        ProxyKind::Transparent => {
            "Connect to: $(Host):$(Port)\n\
             USER $(ProxyUser)\n\
             3xx: PASS $(ProxyPassword)\n\
             USER $(User)\n\
             3xx: PASS $(Password)\n\
             3xx: ACCT $(Account)\n"
        }
        ProxyKind::UserAtHostColonPort => {
            "Connect to: $(ProxyHost):$(ProxyPort)\n\
             USER $(ProxyUser)\n\
             3xx: PASS $(ProxyPassword)\n\
             USER $(User)@$(Host):$(Port)\n\
             3xx: PASS $(Password)\n\
             3xx: ACCT $(Account)\n"
        }
        ProxyKind::UserAtHostSpacePort => {
            "Connect to: $(ProxyHost):$(ProxyPort)\n\
             USER $(ProxyUser)\n\
             3xx: PASS $(ProxyPassword)\n\
             USER $(User)@$(Host) $(Port)\n\
             3xx: PASS $(Password)\n\
             3xx: ACCT $(Account)\n"
        }
        ProxyKind::FireUserAtHost => {
            "Connect to: $(ProxyHost):$(ProxyPort)\n\
             USER $(ProxyUser)@$(Host):$(Port)\n\
             3xx: PASS $(ProxyPassword)\n\
             USER $(User)\n\
             3xx: PASS $(Password)\n\
             3xx: ACCT $(Account)\n"
        }
        ProxyKind::UserAtHostFireUser => {
            "Connect to: $(ProxyHost):$(ProxyPort)\n\
             USER $(User)@$(Host):$(Port) $(ProxyUser)\n\
             3xx: PASS $(Password)\n\
             3xx: ACCT $(ProxyPassword)\n\
             3xx: ACCT $(Account)\n"
        }
        ProxyKind::UserAtFireUserAtHost => {
            "Connect to: $(ProxyHost):$(ProxyPort)\n\
             USER $(User)@$(ProxyUser)@$(Host):$(Port)\n\
             3xx: PASS $(Password)@$(ProxyPassword)\n\
             3xx: ACCT $(Account)\n"
        }
        ProxyKind::Custom => return None,
    };
    Some(text)
}

// ─── Variables ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Var {
    ProxyHost,
    ProxyPort,
    ProxyUser,
    ProxyPassword,
    Host,
    Port,
    User,
    Password,
    Account,
}

impl Var {
    const ALL: [(Var, &'static str); 9] = [
        (Var::ProxyHost, "ProxyHost"),
        (Var::ProxyPort, "ProxyPort"),
        (Var::ProxyUser, "ProxyUser"),
        (Var::ProxyPassword, "ProxyPassword"),
        (Var::Host, "Host"),
        (Var::Port, "Port"),
        (Var::User, "User"),
        (Var::Password, "Password"),
        (Var::Account, "Account"),
    ];

    fn lookup(name: &str) -> Option<Var> {
        Self::ALL
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(v, _)| *v)
    }

    fn hidden(self) -> bool {
        matches!(self, Var::ProxyPassword | Var::Password | Var::Account)
    }

    fn allowed_in_host_line(self) -> bool {
        matches!(self, Var::ProxyHost | Var::Host)
    }
}

/// Values substituted into a script.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptVars {
    pub proxy_host: String,
    pub proxy_port: u16,
    pub proxy_user: String,
    pub proxy_password: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub account: Option<String>,
    pub allow_empty_password: bool,
}

impl ScriptVars {
    pub fn from_config(cfg: &ConnectionConfig) -> Self {
        let proxy = cfg.proxy.clone().unwrap_or_default();
        Self {
            proxy_port: proxy.effective_port(),
            proxy_host: proxy.host,
            proxy_user: proxy.user.unwrap_or_default(),
            proxy_password: proxy.password,
            host: cfg.host.clone(),
            port: cfg.port,
            user: cfg.user.clone(),
            password: cfg.password.clone(),
            account: cfg.account.clone(),
            allow_empty_password: cfg.allow_empty_password,
        }
    }

    /// Merge an answer to a credentials prompt.
    pub fn apply(&mut self, creds: &Credentials) {
        if let Some(h) = &creds.proxy_host {
            self.proxy_host = h.clone();
        }
        if let Some(p) = &creds.proxy_password {
            self.proxy_password = Some(p.clone());
        }
        if let Some(u) = &creds.user {
            self.user = Some(u.clone());
        }
        if let Some(p) = &creds.password {
            self.password = Some(p.clone());
            if p.is_empty() {
                self.allow_empty_password = true;
            }
        }
        if let Some(a) = &creds.account {
            self.account = Some(a.clone());
        }
    }

    fn value(&self, var: Var, needs: &mut NeedsInput, skip: &mut bool) -> String {
        fn present(v: &Option<String>) -> Option<&str> {
            v.as_deref().filter(|s| !s.is_empty())
        }
        match var {
            Var::ProxyHost if self.proxy_host.is_empty() => {
                needs.proxy_host = true;
                String::new()
            }
            Var::ProxyHost => self.proxy_host.clone(),
            Var::ProxyPort => self.proxy_port.to_string(),
            Var::ProxyUser if self.proxy_user.is_empty() => {
                *skip = true;
                String::new()
            }
            Var::ProxyUser => self.proxy_user.clone(),
            Var::ProxyPassword => present(&self.proxy_password).map(str::to_string).unwrap_or_else(|| {
                needs.proxy_password = true;
                String::new()
            }),
            Var::Host => self.host.clone(),
            Var::Port => self.port.to_string(),
            Var::User => present(&self.user).map(str::to_string).unwrap_or_else(|| {
                needs.user = true;
                String::new()
            }),
            Var::Password => match (&self.password, self.allow_empty_password) {
                (Some(p), _) if !p.is_empty() => p.clone(),
                (_, true) => String::new(),
                _ => {
                    needs.password = true;
                    String::new()
                }
            },
            Var::Account => present(&self.account).map(str::to_string).unwrap_or_else(|| {
                needs.account = true;
                String::new()
            }),
        }
    }
}

// ─── Expansion ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Expanded {
    text: String,
    log: String,
    skip: bool,
    needs: NeedsInput,
}

/// Expand one script line. Without `vars` the line is only validated.
fn expand(template: &str, vars: Option<&ScriptVars>, host_line: bool) -> FtpResult<Expanded> {
    let mut out = Expanded::default();
    let mut rest = template;

    while let Some(c) = rest.chars().next() {
        let (var, consumed) = match c {
            '$' if rest.starts_with("$$") => {
                out.text.push('$');
                out.log.push('$');
                rest = &rest[2..];
                continue;
            }
            '$' if rest.starts_with("$(") => {
                let close = rest.find(')').ok_or_else(|| {
                    FtpError::invalid_script(format!("unterminated variable in '{}'", template))
                })?;
                let name = &rest[2..close];
                let var = Var::lookup(name).ok_or_else(|| {
                    FtpError::invalid_script(format!("unknown variable $({})", name))
                })?;
                (var, close + 1)
            }
            '{' => match rest.find('}').and_then(|close| alias(&rest[1..close]).map(|v| (v, close + 1))) {
                Some(found) => found,
                None => {
                    out.text.push(c);
                    out.log.push(c);
                    rest = &rest[c.len_utf8()..];
                    continue;
                }
            },
            _ => {
                out.text.push(c);
                out.log.push(c);
                rest = &rest[c.len_utf8()..];
                continue;
            }
        };

        if host_line && !var.allowed_in_host_line() {
            return Err(FtpError::invalid_script(
                "only $(Host) and $(ProxyHost) may be used on the 'Connect to:' line",
            ));
        }
        if let Some(vars) = vars {
            let value = vars.value(var, &mut out.needs, &mut out.skip);
            out.text.push_str(&value);
            if var.hidden() {
                out.log.push_str("(hidden)");
            } else {
                out.log.push_str(&value);
            }
        }
        rest = &rest[consumed..];
    }
    Ok(out)
}

fn alias(name: &str) -> Option<Var> {
    let var = match name.to_ascii_lowercase().as_str() {
        "proxyhost" => Var::ProxyHost,
        "proxyport" => Var::ProxyPort,
        "proxyuser" => Var::ProxyUser,
        "proxypassword" => Var::ProxyPassword,
        "host" => Var::Host,
        "port" => Var::Port,
        "user" => Var::User,
        "password" => Var::Password,
        "account" => Var::Account,
        _ => return None,
    };
    Some(var)
}

// ─── Parsed script ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortSpec {
    Default,
    ProxyPort,
    Port,
    Number(u16),
}

#[derive(Debug, Clone, PartialEq)]
struct ScriptLine {
    only_after_3xx: bool,
    template: String,
}

/// A validated login script.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyScript {
    host: String,
    port: PortSpec,
    lines: Vec<ScriptLine>,
}

impl ProxyScript {
    /// Parse and validate script text.
    pub fn parse(text: &str) -> FtpResult<Self> {
        let text = text.trim_start();
        let header = text.lines().next().unwrap_or("");
        let target = header
            .get(..11)
            .filter(|h| h.eq_ignore_ascii_case("Connect to:"))
            .map(|_| header[11..].trim())
            .ok_or_else(|| FtpError::invalid_script("script must start with 'Connect to:'"))?;

        let (host, port) = match target.split_once(':') {
            Some((h, p)) => (h.trim(), parse_port_spec(p.trim())?),
            None => (target, PortSpec::Default),
        };
        if host.is_empty() {
            return Err(FtpError::invalid_script("host on the 'Connect to:' line is empty"));
        }
        if host.contains(char::is_whitespace) {
            return Err(FtpError::invalid_script("invalid host or port on the 'Connect to:' line"));
        }
        expand(host, None, true)?;

        let mut lines = Vec::new();
        for raw in text.lines().skip(1) {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let (only_after_3xx, template) = match raw.get(..4) {
                Some(p) if p.eq_ignore_ascii_case("3xx:") => (true, raw[4..].trim()),
                _ => (false, raw),
            };
            if only_after_3xx && lines.is_empty() {
                return Err(FtpError::invalid_script(
                    "'3xx:' cannot be used on the first command line",
                ));
            }
            expand(template, None, false)?;
            lines.push(ScriptLine {
                only_after_3xx,
                template: template.to_string(),
            });
        }
        if lines.iter().all(|l| l.template.is_empty()) {
            return Err(FtpError::invalid_script("script contains no commands"));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            lines,
        })
    }

    /// The script for a connection: built-in for its proxy kind, or the custom one.
    pub fn for_connection(cfg: &ConnectionConfig) -> FtpResult<Self> {
        let kind = cfg.proxy_kind();
        match builtin_script(kind) {
            Some(text) => Self::parse(text),
            None => {
                let text = cfg
                    .proxy
                    .as_ref()
                    .and_then(|p| p.script.as_deref())
                    .ok_or_else(|| FtpError::invalid_script("custom proxy without a script"))?;
                Self::parse(text)
            }
        }
    }

    /// Address the script connects to, or the values missing to know it.
    pub fn connect_target(&self, vars: &ScriptVars) -> FtpResult<Result<(String, u16), NeedsInput>> {
        let host = expand(&self.host, Some(vars), true)?;
        if host.needs.any() {
            return Ok(Err(host.needs));
        }
        let port = match self.port {
            PortSpec::Default => 21,
            PortSpec::ProxyPort => vars.proxy_port,
            PortSpec::Port => vars.port,
            PortSpec::Number(n) => n,
        };
        Ok(Ok((host.text, port)))
    }

    pub fn command_count(&self) -> usize {
        self.lines.len()
    }
}

fn parse_port_spec(s: &str) -> FtpResult<PortSpec> {
    if s.is_empty() {
        return Ok(PortSpec::Default);
    }
    if s.eq_ignore_ascii_case("$(ProxyPort)") || s.eq_ignore_ascii_case("{proxyport}") {
        return Ok(PortSpec::ProxyPort);
    }
    if s.eq_ignore_ascii_case("$(Port)") || s.eq_ignore_ascii_case("{port}") {
        return Ok(PortSpec::Port);
    }
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FtpError::invalid_script(format!("invalid port '{}'", s)));
    }
    match s.parse::<u32>() {
        Ok(n @ 1..=65535) => Ok(PortSpec::Number(n as u16)),
        _ => Err(FtpError::invalid_script(format!(
            "port must be between 1 and 65535, got '{}'",
            s
        ))),
    }
}

// ─── Execution ───────────────────────────────────────────────────────

/// What the login should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    /// Send `command`; `log` is the same line with secrets masked.
    Send { command: String, log: String },
    /// Ask the user for these values, then call `next` again.
    NeedsInput(NeedsInput),
    Finished(ScriptEnd),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptEnd {
    /// Last reply was 2xx.
    LoggedIn,
    /// Last reply was 3xx; the server wants more than the script sends.
    Incomplete,
    /// Every line was skipped.
    NothingSent,
}

/// How a reply to a script command is to be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyVerdict {
    /// 1xx: keep waiting for the real reply.
    Wait,
    /// 2xx / 3xx: continue with the next line.
    Continue,
    /// 4xx: try again later through the retry loop.
    Retry,
    /// 5xx: ask for new credentials and restart the script.
    Rejected,
    /// Not an FTP reply.
    NotFtp,
}

/// Execution cursor over a [`ProxyScript`]. Only moves forward until
/// [`restart`](ScriptRunner::restart).
#[derive(Debug, Clone, Default)]
pub struct ScriptRunner {
    pos: usize,
    /// Reply that `3xx:` lines test; cleared when a line is skipped.
    cond_reply: Option<u16>,
    last_reply: Option<u16>,
    sent_any: bool,
}

impl ScriptRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restart(&mut self) {
        *self = Self::default();
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn next(&mut self, script: &ProxyScript, vars: &ScriptVars) -> FtpResult<ScriptStep> {
        while let Some(line) = script.lines.get(self.pos) {
            let after_3xx = matches!(self.cond_reply, Some(c) if c / 100 == 3);
            if line.template.is_empty() || (line.only_after_3xx && !after_3xx) {
                self.cond_reply = None;
                self.pos += 1;
                continue;
            }
            let exp = expand(&line.template, Some(vars), false)?;
            if exp.skip {
                self.cond_reply = None;
                self.pos += 1;
                continue;
            }
            if exp.needs.any() {
                return Ok(ScriptStep::NeedsInput(exp.needs));
            }
            self.pos += 1;
            self.sent_any = true;
            return Ok(ScriptStep::Send {
                command: exp.text,
                log: exp.log,
            });
        }

        let end = match self.last_reply {
            _ if !self.sent_any => ScriptEnd::NothingSent,
            Some(code) if code / 100 == 3 => ScriptEnd::Incomplete,
            _ => ScriptEnd::LoggedIn,
        };
        Ok(ScriptStep::Finished(end))
    }

    pub fn on_reply(&mut self, reply: &FtpResponse) -> ReplyVerdict {
        match reply.class() {
            ReplyClass::Preliminary => ReplyVerdict::Wait,
            ReplyClass::Completion | ReplyClass::Intermediate => {
                self.last_reply = Some(reply.code);
                self.cond_reply = Some(reply.code);
                ReplyVerdict::Continue
            }
            ReplyClass::TransientNegative => ReplyVerdict::Retry,
            ReplyClass::PermanentNegative => ReplyVerdict::Rejected,
            ReplyClass::Invalid => ReplyVerdict::NotFtp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::error::FtpErrorKind;
    use crate::ftp::types::ProxyConfig;

    fn vars() -> ScriptVars {
        ScriptVars {
            proxy_host: "fw.example".into(),
            proxy_port: 2121,
            proxy_user: String::new(),
            proxy_password: None,
            host: "ftp.example".into(),
            port: 21,
            user: Some("bob".into()),
            password: Some("secret".into()),
            account: None,
            allow_empty_password: false,
        }
    }

    fn send(step: FtpResult<ScriptStep>) -> (String, String) {
        match step.unwrap() {
            ScriptStep::Send { command, log } => (command, log),
            other => panic!("expected Send, got {:?}", other),
        }
    }

    #[test]
    fn test_every_builtin_script_parses() {
        let kinds = [
            ProxyKind::None,
            ProxyKind::Socks4,
            ProxyKind::Socks4a,
            ProxyKind::Socks5,
            ProxyKind::HttpConnect,
            ProxyKind::SiteHostColonPort,
            ProxyKind::SiteHostSpacePort,
            ProxyKind::SiteUserHostColonPort,
            ProxyKind::SiteUserHostSpacePort,
            ProxyKind::OpenHostColonPort,
            ProxyKind::Transparent,
            ProxyKind::UserAtHostColonPort,
            ProxyKind::UserAtHostSpacePort,
            ProxyKind::FireUserAtHost,
            ProxyKind::UserAtHostFireUser,
            ProxyKind::UserAtFireUserAtHost,
        ];
        for kind in kinds {
            let text = builtin_script(kind).unwrap();
            assert!(ProxyScript::parse(text).is_ok(), "{:?}", kind);
        }
        assert!(builtin_script(ProxyKind::Custom).is_none());
    }

    #[test]
    fn test_parse_errors() {
        let cases = [
            "USER x\n",
            "Connect to: $(Host):$(Port)\n3xx: PASS x\n",
            "Connect to: $(Host)\nUSER $(Nobody)\n",
            "Connect to: $(User):21\nUSER x\n",
            "Connect to: $(Host):70000\nUSER x\n",
            "Connect to: $(Host):2x1\nUSER x\n",
            "Connect to: $(Host):21\n\n   \n",
            "Connect to: :21\nUSER x\n",
        ];
        for text in cases {
            let err = ProxyScript::parse(text).unwrap_err();
            assert_eq!(err.kind, FtpErrorKind::InvalidScript, "{}", text);
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn test_direct_login_user_pass() {
        let script = ProxyScript::parse(builtin_script(ProxyKind::None).unwrap()).unwrap();
        let v = vars();
        assert_eq!(
            script.connect_target(&v).unwrap(),
            Ok(("ftp.example".to_string(), 21))
        );

        let mut run = ScriptRunner::new();
        assert_eq!(send(run.next(&script, &v)).0, "USER bob");
        assert_eq!(run.on_reply(&FtpResponse::new(331, "pw")), ReplyVerdict::Continue);
        let (cmd, log) = send(run.next(&script, &v));
        assert_eq!(cmd, "PASS secret");
        assert_eq!(log, "PASS (hidden)");
        assert_eq!(run.on_reply(&FtpResponse::new(230, "ok")), ReplyVerdict::Continue);
        // ACCT is only sent after a 3xx, so the account is never asked for
        assert_eq!(
            run.next(&script, &v).unwrap(),
            ScriptStep::Finished(ScriptEnd::LoggedIn)
        );
    }

    #[test]
    fn test_user_accepted_without_password() {
        let script = ProxyScript::parse(builtin_script(ProxyKind::None).unwrap()).unwrap();
        let v = vars();
        let mut run = ScriptRunner::new();
        send(run.next(&script, &v));
        run.on_reply(&FtpResponse::new(230, "no password needed"));
        assert_eq!(
            run.next(&script, &v).unwrap(),
            ScriptStep::Finished(ScriptEnd::LoggedIn)
        );
    }

    #[test]
    fn test_missing_password_needs_input_then_continues() {
        let script = ProxyScript::parse(builtin_script(ProxyKind::None).unwrap()).unwrap();
        let mut v = vars();
        v.password = None;
        let mut run = ScriptRunner::new();
        send(run.next(&script, &v));
        run.on_reply(&FtpResponse::new(331, "pw"));
        match run.next(&script, &v).unwrap() {
            ScriptStep::NeedsInput(n) => assert!(n.password && !n.user),
            other => panic!("{:?}", other),
        }
        v.apply(&Credentials {
            password: Some("later".into()),
            ..Default::default()
        });
        assert_eq!(send(run.next(&script, &v)).0, "PASS later");
    }

    #[test]
    fn test_empty_proxy_user_skips_line_and_its_3xx_followers() {
        let script =
            ProxyScript::parse(builtin_script(ProxyKind::SiteHostColonPort).unwrap()).unwrap();
        let v = vars();
        assert_eq!(
            script.connect_target(&v).unwrap(),
            Ok(("fw.example".to_string(), 2121))
        );
        let mut run = ScriptRunner::new();
        // USER $(ProxyUser) skipped, PASS $(ProxyPassword) skipped with it
        assert_eq!(send(run.next(&script, &v)).0, "SITE ftp.example:21");
        run.on_reply(&FtpResponse::new(220, "connected"));
        assert_eq!(send(run.next(&script, &v)).0, "USER bob");
    }

    #[test]
    fn test_missing_proxy_host() {
        let script = ProxyScript::parse(builtin_script(ProxyKind::Socks5).unwrap()).unwrap();
        let mut v = vars();
        v.proxy_host.clear();
        let needs = script.connect_target(&v).unwrap().unwrap_err();
        assert!(needs.proxy_host);
    }

    #[test]
    fn test_incomplete_script_and_restart() {
        let script = ProxyScript::parse("Connect to: {host}:{port}\nUSER {user}\n").unwrap();
        let v = vars();
        let mut run = ScriptRunner::new();
        assert_eq!(send(run.next(&script, &v)).0, "USER bob");
        run.on_reply(&FtpResponse::new(331, "more"));
        assert_eq!(
            run.next(&script, &v).unwrap(),
            ScriptStep::Finished(ScriptEnd::Incomplete)
        );
        run.restart();
        assert_eq!(run.position(), 0);
        assert_eq!(send(run.next(&script, &v)).0, "USER bob");
    }

    #[test]
    fn test_dollar_escape_and_literal_braces() {
        let script = ProxyScript::parse("Connect to: $(Host)\nSITE $$x {literal} $(port)\n").unwrap();
        let mut run = ScriptRunner::new();
        assert_eq!(send(run.next(&script, &vars())).0, "SITE $x {literal} 21");
    }

    #[test]
    fn test_reply_verdicts() {
        let mut run = ScriptRunner::new();
        assert_eq!(run.on_reply(&FtpResponse::new(120, "wait")), ReplyVerdict::Wait);
        assert_eq!(run.on_reply(&FtpResponse::new(421, "busy")), ReplyVerdict::Retry);
        assert_eq!(run.on_reply(&FtpResponse::new(530, "no")), ReplyVerdict::Rejected);
        assert_eq!(run.on_reply(&FtpResponse::new(0, "garbage")), ReplyVerdict::NotFtp);
    }

    #[test]
    fn test_custom_script_from_config() {
        let cfg = ConnectionConfig {
            host: "h".into(),
            proxy: Some(ProxyConfig {
                kind: ProxyKind::Custom,
                host: "gw".into(),
                script: Some("Connect to: $(ProxyHost):$(ProxyPort)\nUSER $(User)@$(Host)\n".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let script = ProxyScript::for_connection(&cfg).unwrap();
        let v = ScriptVars::from_config(&cfg);
        assert_eq!(script.connect_target(&v).unwrap(), Ok(("gw".to_string(), 21)));
        assert_eq!(script.command_count(), 1);

        let mut no_script = cfg.clone();
        no_script.proxy.as_mut().unwrap().script = None;
        assert!(ProxyScript::for_connection(&no_script).is_err());
    }
}
