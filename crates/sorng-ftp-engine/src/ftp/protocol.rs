//! Low-level FTP reply framing and reply-text parsers (RFC 959 §4).
//!
//! Handles:
//! - Incremental framing of single-line and multi-line replies from bytes
//!   arriving in arbitrary chunks
//! - Parsing `227` PASV addresses and building `PORT` arguments
//! - Extracting the directory name from `257` replies
//! - Masking secrets in command lines before they reach the log

use crate::ftp::types::FtpResponse;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Accumulates control-channel bytes and yields complete replies.
///
/// A reply starts with three ASCII digits. `NNN-` opens a multi-line reply
/// which ends at the first line starting with the same digits and a space.
/// Lines end with CRLF or a bare LF. A line that does not start with three
/// digits is yielded as a reply with code 0.
#[derive(Debug, Default)]
pub struct ReplyBuffer {
    buf: Vec<u8>,
}

impl ReplyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet part of a complete reply.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Extract the next complete reply, if the buffer holds one.
    pub fn next_reply(&mut self) -> Option<FtpResponse> {
        let first_end = find_line_end(&self.buf, 0)?;
        let first = line_text(&self.buf[..first_end]);

        let code = match reply_code(&first) {
            Some(code) => code,
            None => {
                self.consume(first_end + 1);
                return Some(FtpResponse {
                    code: 0,
                    lines: vec![first],
                });
            }
        };

        let multi = first.as_bytes().get(3) == Some(&b'-');
        if !multi {
            self.consume(first_end + 1);
            return Some(FtpResponse {
                code,
                lines: vec![first],
            });
        }

        let terminator = format!("{:03} ", code);
        let mut lines = vec![first];
        let mut start = first_end + 1;
        loop {
            let end = find_line_end(&self.buf, start)?;
            let line = line_text(&self.buf[start..end]);
            let done = line.starts_with(&terminator);
            lines.push(line);
            start = end + 1;
            if done {
                break;
            }
        }
        self.consume(start);
        Some(FtpResponse { code, lines })
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
    }
}

fn find_line_end(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .iter()
        .position(|&b| b == b'\n')
        .map(|p| p + from)
}

fn line_text(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

fn reply_code(line: &str) -> Option<u16> {
    let digits = line.as_bytes().get(..3)?;
    if !digits.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    line[..3].parse().ok()
}

// ─── PASV / PORT ─────────────────────────────────────────────────────

/// Address from a `227` reply.
///
/// `ip` packs the four address bytes with `h1` in the least significant
/// position, so reading it most significant byte first gives `h4.h3.h2.h1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasvAddr {
    pub ip: u32,
    pub port: u16,
}

impl PasvAddr {
    pub fn from_octets(h: [u8; 4], p1: u8, p2: u8) -> Self {
        Self {
            ip: u32::from_le_bytes(h),
            port: (p1 as u16) << 8 | p2 as u16,
        }
    }

    /// The packed value read as a dotted quad: `h4.h3.h2.h1`.
    pub fn packed_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }

    /// Address to connect the data socket to: `h1.h2.h3.h4:port`.
    pub fn socket_addr(&self) -> SocketAddr {
        let [a, b, c, d] = self.ip.to_le_bytes();
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), self.port))
    }
}

/// Parse a `227` reply: the first run of six numbers below 256 separated by
/// single commas or whitespace, searched after the reply code.
pub fn parse_pasv(reply: &str) -> Option<PasvAddr> {
    let bytes = reply.as_bytes();
    let mut i = 4.min(bytes.len());
    while i < bytes.len() {
        let starts_number = bytes[i].is_ascii_digit() && (i == 0 || !bytes[i - 1].is_ascii_digit());
        if starts_number {
            if let Some(n) = six_numbers(&bytes[i..]) {
                return Some(PasvAddr::from_octets([n[0], n[1], n[2], n[3]], n[4], n[5]));
            }
        }
        i += 1;
    }
    None
}

fn six_numbers(b: &[u8]) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut pos = 0;
    for (k, slot) in out.iter_mut().enumerate() {
        if k > 0 {
            match b.get(pos) {
                Some(&c) if c == b',' || c.is_ascii_whitespace() => pos += 1,
                _ => return None,
            }
        }
        let start = pos;
        let mut value: u32 = 0;
        while let Some(&c) = b.get(pos) {
            if !c.is_ascii_digit() || pos - start == 3 {
                break;
            }
            value = value * 10 + (c - b'0') as u32;
            pos += 1;
        }
        if pos == start || value > 255 || b.get(pos).is_some_and(|c| c.is_ascii_digit()) {
            return None;
        }
        *slot = value as u8;
    }
    Some(out)
}

/// Build the `PORT` command for a local listener.
pub fn port_command(addr: SocketAddrV4) -> String {
    let [h1, h2, h3, h4] = addr.ip().octets();
    let port = addr.port();
    format!("PORT {},{},{},{},{},{}", h1, h2, h3, h4, port >> 8, port & 0xff)
}

// ─── 257 replies ─────────────────────────────────────────────────────

/// Extract the directory name from a `257` reply text.
///
/// The name is a double-quoted string where `""` stands for one quote. A
/// server that quotes with single quotes only is handled by taking the text
/// between the first and the last single quote.
pub fn parse_257(reply: &str) -> Option<String> {
    let text = reply.get(3..).unwrap_or("");
    let open = text.find(['"', '\''])?;
    let rest = &text[open..];

    if rest.starts_with('\'') && !rest.contains('"') {
        let close = rest.rfind('\'')?;
        return (close > 0).then(|| rest[1..close].to_string());
    }

    let quoted = &rest[rest.find('"')? + 1..];
    let mut name = String::new();
    let mut chars = quoted.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                name.push('"');
            } else {
                return Some(name);
            }
        } else {
            name.push(c);
        }
    }
    None
}

// ─── Logging helpers ─────────────────────────────────────────────────

/// Replace the argument of `PASS` / `ACCT` with `(hidden)`.
pub fn mask_command(line: &str) -> String {
    let upper = line.get(..5).map(|s| s.to_ascii_uppercase());
    match upper.as_deref() {
        Some("PASS ") | Some("ACCT ") => format!("{}(hidden)", &line[..5]),
        _ => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "220-Welcome to the server\r\n\
                          220-second line\r\n\
                          220 ready\r\n\
                          331 Password required\r\n\
                          230 Logged in\n\
                          211-Features:\r\n\
                          \x20MDTM\r\n\
                          211-not the end\r\n\
                          211 End\r\n\
                          250 ok\r\n";

    fn drain(buf: &mut ReplyBuffer) -> Vec<FtpResponse> {
        std::iter::from_fn(|| buf.next_reply()).collect()
    }

    #[test]
    fn test_single_read_frames_all_replies() {
        let mut buf = ReplyBuffer::new();
        buf.push(STREAM.as_bytes());
        let replies = drain(&mut buf);
        let codes: Vec<u16> = replies.iter().map(|r| r.code).collect();
        assert_eq!(codes, vec![220, 331, 230, 211, 250]);
        assert_eq!(replies[0].lines.len(), 3);
        assert_eq!(replies[3].lines.len(), 4);
        assert_eq!(replies[3].lines[3], "211 End");
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn test_every_two_way_split_frames_the_same() {
        let bytes = STREAM.as_bytes();
        for cut in 0..=bytes.len() {
            let mut buf = ReplyBuffer::new();
            let mut replies = Vec::new();
            buf.push(&bytes[..cut]);
            replies.extend(drain(&mut buf));
            buf.push(&bytes[cut..]);
            replies.extend(drain(&mut buf));
            assert_eq!(replies.len(), 5, "split at {}", cut);
            assert_eq!(replies[3].code, 211);
        }
    }

    #[test]
    fn test_byte_by_byte_and_irregular_chunks() {
        let bytes = STREAM.as_bytes();
        let mut buf = ReplyBuffer::new();
        let mut count = 0;
        for b in bytes {
            buf.push(std::slice::from_ref(b));
            count += drain(&mut buf).len();
        }
        assert_eq!(count, 5);

        // chunk sizes from a small linear congruential sequence
        let mut seed: u32 = 7;
        let mut pos = 0;
        let mut buf = ReplyBuffer::new();
        let mut replies = Vec::new();
        while pos < bytes.len() {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let len = (seed >> 16) as usize % 9 + 1;
            let end = (pos + len).min(bytes.len());
            buf.push(&bytes[pos..end]);
            replies.extend(drain(&mut buf));
            pos = end;
        }
        assert_eq!(replies.len(), 5);
        assert_eq!(replies[0].lines[2], "220 ready");
    }

    #[test]
    fn test_incomplete_multiline_waits() {
        let mut buf = ReplyBuffer::new();
        buf.push(b"150-opening\r\n150 still");
        assert!(buf.next_reply().is_none());
        buf.push(b" going\r\n");
        let r = buf.next_reply().unwrap();
        assert_eq!(r.code, 150);
        assert_eq!(r.lines, vec!["150-opening", "150 still going"]);
    }

    #[test]
    fn test_non_ftp_line_has_code_zero() {
        let mut buf = ReplyBuffer::new();
        buf.push(b"SSH-2.0-OpenSSH\r\n220 hi\r\n");
        assert_eq!(buf.next_reply().unwrap().code, 0);
        assert_eq!(buf.next_reply().unwrap().code, 220);
    }

    #[test]
    fn test_pasv_round_trip_all_byte_values() {
        for v in 0..=255u8 {
            let h = [v, v.wrapping_add(1), v.wrapping_mul(3), 255 - v];
            let (p1, p2) = (v, 255 - v);
            let text = format!(
                "227 Entering Passive Mode ({},{},{},{},{},{})",
                h[0], h[1], h[2], h[3], p1, p2
            );
            let addr = parse_pasv(&text).unwrap();
            assert_eq!(addr.packed_ip(), Ipv4Addr::new(h[3], h[2], h[1], h[0]));
            assert_eq!(addr.port, p1 as u16 * 256 + p2 as u16);
            assert_eq!(
                addr.socket_addr(),
                SocketAddr::from(([h[0], h[1], h[2], h[3]], addr.port))
            );
        }
    }

    #[test]
    fn test_pasv_variants() {
        let a = parse_pasv("227 Entering Passive Mode 10,0,0,5,4,1").unwrap();
        assert_eq!(a.port, 1025);
        assert_eq!(a.socket_addr().to_string(), "10.0.0.5:1025");
        assert!(parse_pasv("227 Entering Passive Mode (256,0,0,1,4,1)").is_none());
        assert!(parse_pasv("227 nothing here").is_none());
        // the reply code itself is never part of the address
        assert!(parse_pasv("227").is_none());
    }

    #[test]
    fn test_port_command() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 2), 0x1234);
        assert_eq!(port_command(addr), "PORT 192,168,1,2,18,52");
    }

    #[test]
    fn test_257_quoted_and_escaped() {
        assert_eq!(parse_257("257 \"/home/x\" is current").as_deref(), Some("/home/x"));
        assert_eq!(
            parse_257("257 \"/a \"\"b\"\"\" created").as_deref(),
            Some("/a \"b\"")
        );
        assert_eq!(parse_257("257 '/pub' is cwd").as_deref(), Some("/pub"));
        assert_eq!(parse_257("257 no quotes"), None);
    }

    #[test]
    fn test_mask_command() {
        assert_eq!(mask_command("PASS secret"), "PASS (hidden)");
        assert_eq!(mask_command("acct 1234"), "acct (hidden)");
        assert_eq!(mask_command("USER bob"), "USER bob");
    }
}
