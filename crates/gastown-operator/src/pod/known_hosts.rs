/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! SSH host verification for the clone performed by `git-init`.
//!
//! Host keys come from two places. Entries configured in `ssh.known_hosts`
//! win for every host they name; otherwise the verified table below is used.
//! A host found in neither is refused: the init script fails before cloning.

/// Published host keys of the large git forges.
const VERIFIED_HOSTS: &[(&str, &str, &str)] = &[
    (
        "github.com",
        "ssh-ed25519",
        "AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl",
    ),
    (
        "github.com",
        "ecdsa-sha2-nistp256",
        "AAAAE2VjZHNhLXNoYTItbmlzdHAyNTYAAAAIbmlzdHAyNTYAAABBBEmKSENjQEezOmxkZMy7opKgwFB9nkt5YRrYMjNuG5N87uRgg6CLrbo5wAdT/y6v0mKV0U2w0WZ2YB/++Tpockg=",
    ),
    (
        "gitlab.com",
        "ssh-ed25519",
        "AAAAC3NzaC1lZDI1NTE5AAAAIAfuCHKVTjquxvt6CM6tdG4SLp1Btn/nOeHHE5UOzRdf",
    ),
    (
        "bitbucket.org",
        "ssh-ed25519",
        "AAAAC3NzaC1lZDI1NTE5AAAAIIazEu89wgQZ4bqs3d63QSEv7bZ95OWxHJ9cvtZz+Yr6",
    ),
];

/// How a repository URL is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitTransport {
    Ssh { host: String, port: Option<u16> },
    /// https, http, git:// or local paths; no SSH host key involved
    Other,
}

impl GitTransport {
    /// Host pattern as it appears in a known_hosts line
    pub fn known_hosts_pattern(&self) -> Option<String> {
        match self {
            GitTransport::Ssh { host, port } => Some(match port {
                Some(p) if *p != 22 => format!("[{}]:{}", host, p),
                _ => host.clone(),
            }),
            GitTransport::Other => None,
        }
    }
}

/// Outcome of host verification for one repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostVerification {
    NotRequired,
    Known { host: String, lines: Vec<String> },
    Unknown { host: String },
}

/// Works out the transport of a git remote.
///
/// Accepts `ssh://[user@]host[:port]/path`, scp-like `[user@]host:path` and
/// anything with another scheme.
pub fn parse_git_url(url: &str) -> GitTransport {
    let url = url.trim();
    if let Some(rest) = url.strip_prefix("ssh://").or_else(|| url.strip_prefix("git+ssh://")) {
        let authority = rest.split('/').next().unwrap_or_default();
        let host_port = authority.rsplit('@').next().unwrap_or(authority);
        let (host, port) = match host_port.rsplit_once(':') {
            Some((h, p)) => match p.parse::<u16>() {
                Ok(port) => (h, Some(port)),
                Err(_) => (host_port, None),
            },
            None => (host_port, None),
        };
        if host.is_empty() {
            return GitTransport::Other;
        }
        return GitTransport::Ssh {
            host: host.to_lowercase(),
            port,
        };
    }
    if url.contains("://") {
        return GitTransport::Other;
    }
    // scp-like syntax: a colon before the first slash
    match url.split_once(':') {
        Some((prefix, _)) if !prefix.is_empty() && !prefix.contains('/') => {
            let host = prefix.rsplit('@').next().unwrap_or(prefix);
            GitTransport::Ssh {
                host: host.to_lowercase(),
                port: None,
            }
        }
        _ => GitTransport::Other,
    }
}

fn line_matches(line: &str, pattern: &str) -> bool {
    line.split_whitespace()
        .next()
        .map(|hosts| hosts.split(',').any(|h| h.eq_ignore_ascii_case(pattern)))
        .unwrap_or(false)
}

/// Resolves the known_hosts lines for a repository URL.
pub fn resolve(url: &str, configured: &[String]) -> HostVerification {
    let transport = parse_git_url(url);
    let Some(pattern) = transport.known_hosts_pattern() else {
        return HostVerification::NotRequired;
    };

    let operator_lines: Vec<String> = configured
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter(|l| line_matches(l, &pattern))
        .map(str::to_string)
        .collect();
    if !operator_lines.is_empty() {
        return HostVerification::Known {
            host: pattern,
            lines: operator_lines,
        };
    }

    let builtin: Vec<String> = VERIFIED_HOSTS
        .iter()
        .filter(|(host, _, _)| *host == pattern)
        .map(|(host, key_type, key)| format!("{} {} {}", host, key_type, key))
        .collect();
    if builtin.is_empty() {
        HostVerification::Unknown { host: pattern }
    } else {
        HostVerification::Known {
            host: pattern,
            lines: builtin,
        }
    }
}
