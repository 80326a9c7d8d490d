//! Transport tunnels: SOCKS 4/4A/5 and HTTP `CONNECT`.
//!
//! The stream is already connected to the proxy; after a successful
//! handshake it carries the FTP control connection to the target.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::events::Tunnel;
use crate::ftp::types::ProxyKind;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::net::{IpAddr, Ipv4Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest HTTP response header accepted from a proxy.
const MAX_HTTP_HEADER: usize = 8192;

/// Negotiate `tunnel` over `stream`.
pub async fn establish<S>(stream: &mut S, tunnel: &Tunnel) -> FtpResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    log::debug!(
        "proxy: {:?} tunnel to {}:{}",
        tunnel.kind,
        tunnel.host,
        tunnel.port
    );
    match tunnel.kind {
        ProxyKind::Socks4 => socks4(stream, tunnel, false).await,
        ProxyKind::Socks4a => socks4(stream, tunnel, true).await,
        ProxyKind::Socks5 => socks5(stream, tunnel).await,
        ProxyKind::HttpConnect => http_connect(stream, tunnel).await,
        other => Err(FtpError::invalid_config(format!(
            "{:?} is not a transport tunnel",
            other
        ))),
    }
}

fn io_err(what: &str) -> impl Fn(std::io::Error) -> FtpError + '_ {
    move |e| FtpError::proxy(format!("{}: {}", what, e)).with_os_error(e.raw_os_error())
}

async fn socks4<S>(stream: &mut S, tunnel: &Tunnel, remote_dns: bool) -> FtpResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // +----+----+----+----+----+----+----+----+----+----+....+----+
    // | VN | CD | DSTPORT |      DSTIP        | USERID       |NULL|
    // +----+----+----+----+----+----+----+----+----+----+....+----+
    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&tunnel.port.to_be_bytes());

    let literal = tunnel.host.parse::<Ipv4Addr>().ok();
    let domain = match literal {
        Some(ip) => {
            request.extend_from_slice(&ip.octets());
            None
        }
        // 0.0.0.x asks the proxy to resolve the name
        None if remote_dns => {
            request.extend_from_slice(&[0, 0, 0, 1]);
            Some(tunnel.host.as_str())
        }
        None => {
            let ip = resolve_v4(&tunnel.host, tunnel.port).await?;
            request.extend_from_slice(&ip.octets());
            None
        }
    };

    if let Some(user) = &tunnel.user {
        request.extend_from_slice(user.as_bytes());
    }
    request.push(0x00);
    if let Some(domain) = domain {
        request.extend_from_slice(domain.as_bytes());
        request.push(0x00);
    }

    stream
        .write_all(&request)
        .await
        .map_err(io_err("cannot send SOCKS4 request"))?;

    let mut response = [0u8; 8];
    stream
        .read_exact(&mut response)
        .await
        .map_err(io_err("cannot read SOCKS4 response"))?;

    match response[1] {
        0x5A => Ok(()),
        0x5B => Err(FtpError::proxy("SOCKS4 request rejected or failed")),
        0x5C | 0x5D => Err(FtpError::proxy("SOCKS4 proxy could not verify the user id")),
        code => Err(FtpError::proxy(format!("SOCKS4 connection failed: reply code {}", code))),
    }
}

async fn resolve_v4(host: &str, port: u16) -> FtpResult<Ipv4Addr> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| FtpError::resolve(format!("cannot resolve {}: {}", host, e)))?;
    for addr in addrs {
        if let IpAddr::V4(ip) = addr.ip() {
            return Ok(ip);
        }
    }
    Err(FtpError::resolve(format!(
        "{} has no IPv4 address (SOCKS4 cannot carry IPv6)",
        host
    )))
}

async fn socks5<S>(stream: &mut S, tunnel: &Tunnel) -> FtpResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let credentials = match (&tunnel.user, &tunnel.password) {
        (Some(user), Some(password)) if !user.is_empty() => Some((user, password)),
        _ => None,
    };

    let mut greeting = vec![0x05];
    if credentials.is_some() {
        greeting.extend_from_slice(&[2, 0x00, 0x02]);
    } else {
        greeting.extend_from_slice(&[1, 0x00]);
    }
    stream
        .write_all(&greeting)
        .await
        .map_err(io_err("cannot send SOCKS5 greeting"))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(io_err("cannot read SOCKS5 greeting response"))?;
    if response[0] != 0x05 {
        return Err(FtpError::proxy("invalid SOCKS5 response"));
    }

    match response[1] {
        0x00 => {}
        0x02 => {
            let Some((user, password)) = credentials else {
                return Err(FtpError::proxy(
                    "SOCKS5 authentication required but no credentials provided",
                ));
            };
            if user.len() > 255 || password.len() > 255 {
                return Err(FtpError::proxy("SOCKS5 user name or password too long"));
            }
            let mut auth = vec![0x01, user.len() as u8];
            auth.extend_from_slice(user.as_bytes());
            auth.push(password.len() as u8);
            auth.extend_from_slice(password.as_bytes());
            stream
                .write_all(&auth)
                .await
                .map_err(io_err("cannot send SOCKS5 authentication"))?;

            let mut auth_response = [0u8; 2];
            stream
                .read_exact(&mut auth_response)
                .await
                .map_err(io_err("cannot read SOCKS5 authentication response"))?;
            if auth_response[1] != 0x00 {
                return Err(FtpError::proxy("SOCKS5 authentication failed"));
            }
        }
        0xFF => return Err(FtpError::proxy("no acceptable SOCKS5 authentication methods")),
        method => {
            return Err(FtpError::proxy(format!(
                "unsupported SOCKS5 authentication method: {}",
                method
            )))
        }
    }

    // VER, CMD (CONNECT), RSV, then the target address
    let mut request = vec![0x05, 0x01, 0x00];
    match tunnel.host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(0x01);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(0x04);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let host = tunnel.host.as_bytes();
            if host.len() > 255 {
                return Err(FtpError::proxy("target host name too long for SOCKS5"));
            }
            request.push(0x03);
            request.push(host.len() as u8);
            request.extend_from_slice(host);
        }
    }
    request.extend_from_slice(&tunnel.port.to_be_bytes());
    stream
        .write_all(&request)
        .await
        .map_err(io_err("cannot send SOCKS5 CONNECT"))?;

    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(io_err("cannot read SOCKS5 CONNECT response"))?;
    if head[1] != 0x00 {
        return Err(FtpError::proxy(format!(
            "SOCKS5 CONNECT failed: {}",
            socks5_reply(head[1])
        )));
    }

    // skip the bound address and port
    let skip = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(io_err("cannot read SOCKS5 bound address"))?;
            len[0] as usize
        }
        other => return Err(FtpError::proxy(format!("unknown SOCKS5 address type: {}", other))),
    };
    let mut rest = vec![0u8; skip + 2];
    stream
        .read_exact(&mut rest)
        .await
        .map_err(io_err("cannot read SOCKS5 bound address"))?;
    Ok(())
}

fn socks5_reply(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

async fn http_connect<S>(stream: &mut S, tunnel: &Tunnel) -> FtpResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = if tunnel.host.contains(':') {
        format!("[{}]:{}", tunnel.host, tunnel.port)
    } else {
        format!("{}:{}", tunnel.host, tunnel.port)
    };
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
    if let Some(user) = tunnel.user.as_deref().filter(|u| !u.is_empty()) {
        let auth = BASE64.encode(format!(
            "{}:{}",
            user,
            tunnel.password.as_deref().unwrap_or("")
        ));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", auth));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(io_err("cannot send CONNECT request"))?;

    // read byte by byte so no FTP greeting is swallowed
    let mut header = Vec::new();
    let mut byte = [0u8; 1];
    while !header.ends_with(b"\r\n\r\n") && !header.ends_with(b"\n\n") {
        if header.len() >= MAX_HTTP_HEADER {
            return Err(FtpError::proxy("proxy response header too long"));
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(io_err("cannot read proxy response"))?;
        if n == 0 {
            return Err(FtpError::proxy("proxy closed the connection during CONNECT"));
        }
        header.push(byte[0]);
    }

    let text = String::from_utf8_lossy(&header);
    let status_line = text.lines().next().unwrap_or("");
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok());
    match status {
        Some(code) if (200..300).contains(&code) => Ok(()),
        Some(407) => Err(FtpError::proxy(format!(
            "proxy authentication required: {}",
            status_line
        ))),
        _ => Err(FtpError::proxy(format!("proxy CONNECT failed: {}", status_line))),
    }
}
