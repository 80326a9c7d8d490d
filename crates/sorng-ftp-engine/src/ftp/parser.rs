//! Remote directory listings.
//!
//! Exploration runs `LIST` and hands the body to [`parse_listing`]. Three line
//! shapes are recognised, per line, so mixed output still parses:
//!
//! ```text
//! drwxr-xr-x   2 owner group   4096 Mar  1 09:30 docs         (ls -l)
//! 03-01-26  09:30AM       <DIR>          docs                 (IIS / DOS)
//! type=dir;modify=20260301093000;unix.mode=0755; docs         (MLSD facts)
//! ```
//!
//! Anything else (`total 12`, banners, blank lines) is skipped, as are the
//! `.` and `..` entries.

use crate::ftp::types::{FtpEntry, FtpEntryKind};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Parse a listing using the current time to place year-less dates.
pub fn parse_listing(raw: &str) -> Vec<FtpEntry> {
    ListingParser::new(Utc::now()).parse(raw)
}

/// Listing parser anchored at a reference time.
///
/// `ls -l` prints recent files as `Mon DD HH:MM` without a year; such a date
/// belongs to the reference year unless that would put it more than a day in
/// the future, in which case it is from the year before.
#[derive(Debug, Clone, Copy)]
pub struct ListingParser {
    now: DateTime<Utc>,
}

impl ListingParser {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }

    pub fn parse(&self, raw: &str) -> Vec<FtpEntry> {
        raw.lines()
            .filter_map(|line| self.parse_line(line.trim_end_matches(['\r', '\n'])))
            .filter(|e| e.name != "." && e.name != "..")
            .collect()
    }

    pub fn parse_line(&self, line: &str) -> Option<FtpEntry> {
        if line.trim().is_empty() {
            return None;
        }
        if let Some(entry) = mlsd_line(line) {
            return Some(entry);
        }
        self.unix_line(line).or_else(|| dos_line(line))
    }

    fn unix_line(&self, line: &str) -> Option<FtpEntry> {
        let (mode, rest) = line.split_once(char::is_whitespace)?;
        if !mode_re()?.is_match(mode) {
            return None;
        }
        let caps = unix_tail_re()?.captures(rest)?;
        let head = &rest[..caps.get(0)?.start()];
        // link count, owner, [group,] size: the size is the last number
        let size = head.split_whitespace().last()?.parse::<u64>().ok()?;

        let kind = match mode.as_bytes()[0] {
            b'd' => FtpEntryKind::Directory,
            b'l' => FtpEntryKind::Symlink,
            b'-' => FtpEntryKind::File,
            _ => FtpEntryKind::Unknown,
        };
        let raw_name = caps.name("name")?.as_str();
        let (name, link_target) = match raw_name.split_once(" -> ") {
            Some((name, target)) if kind == FtpEntryKind::Symlink => (name, Some(target.to_string())),
            _ => (raw_name, None),
        };
        if name.is_empty() {
            return None;
        }

        Some(FtpEntry {
            name: name.to_string(),
            kind,
            size,
            modified: self.unix_date(&caps["month"], &caps["day"], &caps["clock"]),
            permissions: Some(mode.to_string()),
            link_target,
            facts: HashMap::new(),
        })
    }

    fn unix_date(&self, month: &str, day: &str, clock: &str) -> Option<DateTime<Utc>> {
        let md = format!("{} {}", month, day);
        if clock.contains(':') {
            let at = |year: i32| {
                NaiveDateTime::parse_from_str(&format!("{} {} {}", year, md, clock), "%Y %b %d %H:%M")
                    .ok()
                    .map(|dt| Utc.from_utc_datetime(&dt))
            };
            let this_year = at(self.now.year())?;
            if this_year > self.now + Duration::days(1) {
                at(self.now.year() - 1)
            } else {
                Some(this_year)
            }
        } else {
            let date = NaiveDate::parse_from_str(&format!("{} {}", md, clock), "%b %d %Y").ok()?;
            Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
        }
    }
}

fn mode_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[-dlcbps][-rwxsStTlL]{9}[+@.]?$").ok()).as_ref()
}

fn unix_tail_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\s(?P<month>[A-Za-z]{3})\s+(?P<day>\d{1,2})\s+(?P<clock>\d{1,2}:\d{2}|\d{4}) (?P<name>.+)$").ok()
    })
    .as_ref()
}

fn dos_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(?P<date>\d{2}-\d{2}-\d{2}(?:\d{2})?)\s+(?P<time>\d{1,2}:\d{2}\s*(?:[AP]M)?)\s+(?P<size><DIR>|\d+)\s+(?P<name>.+)$",
        )
        .ok()
    })
    .as_ref()
}

fn dos_line(line: &str) -> Option<FtpEntry> {
    let caps = dos_re()?.captures(line)?;
    let (kind, size) = match &caps["size"] {
        s if s.eq_ignore_ascii_case("<DIR>") => (FtpEntryKind::Directory, 0),
        s => (FtpEntryKind::File, s.parse().ok()?),
    };
    let stamp = format!("{} {}", &caps["date"], caps["time"].replace(' ', "").to_ascii_uppercase());
    let modified = ["%m-%d-%y %I:%M%p", "%m-%d-%Y %I:%M%p", "%m-%d-%y %H:%M", "%m-%d-%Y %H:%M"]
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(&stamp, f).ok())
        .map(|dt| Utc.from_utc_datetime(&dt));

    Some(FtpEntry {
        name: caps["name"].to_string(),
        kind,
        size,
        modified,
        permissions: None,
        link_target: None,
        facts: HashMap::new(),
    })
}

/// `fact=value;fact=value; name`. Facts end at the first space.
fn mlsd_line(line: &str) -> Option<FtpEntry> {
    let (facts, name) = line.split_once(' ')?;
    if !facts.ends_with(';') || !facts.contains('=') || name.is_empty() {
        return None;
    }
    let facts: HashMap<String, String> = facts
        .split(';')
        .filter_map(|f| f.split_once('='))
        .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
        .collect();

    let kind_fact = facts.get("type").map(|t| t.to_ascii_lowercase()).unwrap_or_default();
    let mut link_target = None;
    let kind = match kind_fact.as_str() {
        "file" => FtpEntryKind::File,
        "dir" | "cdir" | "pdir" => FtpEntryKind::Directory,
        t if t.starts_with("os.unix=slink") || t.starts_with("os.unix=symlink") => {
            // `OS.unix=slink:/target`; keep the target's original case
            link_target = facts
                .get("type")
                .and_then(|t| t.split_once(':'))
                .map(|(_, target)| target.to_string())
                .filter(|t| !t.is_empty());
            FtpEntryKind::Symlink
        }
        _ => FtpEntryKind::Unknown,
    };
    let modified = facts.get("modify").and_then(|m| {
        let digits = m.get(..14)?;
        NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S")
            .ok()
            .map(|dt| Utc.from_utc_datetime(&dt))
    });

    Some(FtpEntry {
        name: name.to_string(),
        kind,
        size: facts.get("size").and_then(|s| s.parse().ok()).unwrap_or(0),
        modified,
        permissions: facts.get("unix.mode").or_else(|| facts.get("perm")).cloned(),
        link_target,
        facts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> ListingParser {
        ListingParser::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap())
    }

    #[test]
    fn test_unix_file_and_total_line() {
        let raw = "total 8\r\n-rw-r--r--   1 user group  1234 Feb 10 10:00 readme.txt\r\n";
        let entries = parser().parse(raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "readme.txt");
        assert_eq!(entries[0].kind, FtpEntryKind::File);
        assert_eq!(entries[0].size, 1234);
        assert_eq!(entries[0].permissions.as_deref(), Some("-rw-r--r--"));
        assert_eq!(entries[0].modified, Some(Utc.with_ymd_and_hms(2026, 2, 10, 10, 0, 0).unwrap()));
    }

    #[test]
    fn test_unix_recent_date_from_last_year() {
        let entries = parser().parse("drwxr-xr-x 2 root root 4096 Dec 31 23:59 old");
        assert_eq!(entries[0].kind, FtpEntryKind::Directory);
        assert_eq!(entries[0].modified, Some(Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 0).unwrap()));
    }

    #[test]
    fn test_unix_without_group_and_with_year() {
        let entries = parser().parse("-rw-r--r--   1 ftp        10 Feb 12  2024 my file.txt");
        assert_eq!(entries[0].name, "my file.txt");
        assert_eq!(entries[0].size, 10);
        assert_eq!(entries[0].modified, Some(Utc.with_ymd_and_hms(2024, 2, 12, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_unix_symlink() {
        let entries = parser().parse("lrwxrwxrwx   1 root root    22 Jan  5 08:00 link -> /var/target");
        assert_eq!(entries[0].kind, FtpEntryKind::Symlink);
        assert_eq!(entries[0].name, "link");
        assert_eq!(entries[0].link_target.as_deref(), Some("/var/target"));
    }

    #[test]
    fn test_arrow_in_plain_file_name_is_kept() {
        let entries = parser().parse("-rw-r--r-- 1 a b 3 Jan  5 08:00 a -> b");
        assert_eq!(entries[0].name, "a -> b");
        assert_eq!(entries[0].link_target, None);
    }

    #[test]
    fn test_dos_lines() {
        let raw = "03-01-26  09:30AM       <DIR>          My Documents\r\n\
                   12-24-2025  11:15PM            2048 notes.txt\r\n";
        let entries = parser().parse(raw);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, FtpEntryKind::Directory);
        assert_eq!(entries[0].name, "My Documents");
        assert_eq!(entries[1].size, 2048);
        assert_eq!(entries[1].modified, Some(Utc.with_ymd_and_hms(2025, 12, 24, 23, 15, 0).unwrap()));
    }

    #[test]
    fn test_mlsd_facts() {
        let raw = "type=cdir; .\r\ntype=pdir; ..\r\n\
                   type=file;size=1024;modify=20260101120000.123;UNIX.mode=0644; example.bin\r\n\
                   type=OS.unix=slink:/srv/Data;modify=20260101120000; data\r\n";
        let entries = parser().parse(raw);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "example.bin");
        assert_eq!(entries[0].size, 1024);
        assert_eq!(entries[0].permissions.as_deref(), Some("0644"));
        assert_eq!(entries[0].modified, Some(Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()));
        assert_eq!(entries[1].kind, FtpEntryKind::Symlink);
        assert_eq!(entries[1].link_target.as_deref(), Some("/srv/Data"));
    }

    #[test]
    fn test_mlsd_name_with_spaces() {
        let entries = parser().parse("type=file;size=1; two words.txt");
        assert_eq!(entries[0].name, "two words.txt");
    }
}
