//! Alias file grammar (§4.2): `name: rhs` per line.
//!
//! RHS is one of:
//! - `| command` — a single PIPE recipient;
//! - `> host1,host2 addr` — a FORWARD recipient with an explicit relay
//!   list (not named by §4.2's RHS grammar in terms of syntax, but
//!   required by scenario S5; see `DESIGN.md` for the open-question
//!   decision to extend the grammar this way);
//! - otherwise, a comma-separated list of addresses, each implicitly
//!   qualified with the owning domain if bare.

use mailcore_common::Domain;

use crate::types::Recipient;

/// One parsed alias-file line: the raw key (before domain-qualification)
/// and its resolved recipients.
pub struct ParsedEntry {
    pub key: String,
    pub recipients: Vec<Recipient>,
}

/// Parses the full contents of one alias file for `domain`.
///
/// Blank lines and lines starting with `#` are skipped. Lines that don't
/// contain a `:` are skipped (malformed, not fatal — matches the
/// permissive style of traditional `/etc/aliases` parsers).
#[must_use]
pub fn parse_file(contents: &str, domain: &Domain) -> Vec<ParsedEntry> {
    contents
        .lines()
        .filter_map(|line| parse_line(line, domain))
        .collect()
}

fn parse_line(line: &str, domain: &Domain) -> Option<ParsedEntry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (name, rhs) = line.split_once(':')?;
    let name = name.trim();
    if name.contains('@') {
        return None;
    }

    let rhs = rhs.trim();
    let recipients = parse_rhs(rhs, domain);
    if recipients.is_empty() {
        return None;
    }

    let key = if name == "*" {
        format!("*@{domain}")
    } else {
        format!("{name}@{domain}")
    };

    Some(ParsedEntry { key, recipients })
}

fn parse_rhs(rhs: &str, domain: &Domain) -> Vec<Recipient> {
    if let Some(command) = rhs.strip_prefix('|') {
        let command = command.trim();
        return if command.is_empty() {
            Vec::new()
        } else {
            vec![Recipient::pipe(command, String::new())]
        };
    }

    if let Some(forward) = rhs.strip_prefix('>') {
        return parse_forward(forward.trim(), domain);
    }

    if rhs.is_empty() {
        return Vec::new();
    }

    rhs.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|addr| {
            let qualified = qualify(addr, domain);
            Recipient::email(qualified, String::new())
        })
        .collect()
}

fn parse_forward(spec: &str, domain: &Domain) -> Vec<Recipient> {
    let Some((hosts, addr)) = spec.rsplit_once(' ') else {
        return Vec::new();
    };
    let hosts: Vec<String> = hosts
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let addr = addr.trim();
    if hosts.is_empty() || addr.is_empty() {
        return Vec::new();
    }

    let qualified = qualify(addr, domain);
    vec![Recipient::forward(qualified, hosts, String::new())]
}

fn qualify(addr: &str, domain: &Domain) -> String {
    if addr.contains('@') {
        addr.to_string()
    } else {
        format!("{addr}@{domain}")
    }
}

/// Parses one line of a resolve hook's stdout into a recipient. Hook
/// output addresses are taken as already fully qualified; there is no
/// owning domain to fall back on.
#[must_use]
pub(crate) fn parse_hook_line(line: &str) -> Option<Recipient> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(command) = line.strip_prefix('|') {
        let command = command.trim();
        return if command.is_empty() {
            None
        } else {
            Some(Recipient::pipe(command, String::new()))
        };
    }

    if let Some(spec) = line.strip_prefix('>') {
        let (hosts, addr) = spec.trim().rsplit_once(' ')?;
        let hosts: Vec<String> = hosts
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let addr = addr.trim();
        return if hosts.is_empty() || addr.is_empty() {
            None
        } else {
            Some(Recipient::forward(addr, hosts, String::new()))
        };
    }

    Some(Recipient::email(line, String::new()))
}
