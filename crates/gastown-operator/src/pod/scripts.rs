/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! Shell scripts run by the three containers of a polecat pod.
//!
//! Scripts are plain `sh` built from typed inputs. Every value that
//! originates from a resource is passed through [`shell_quote`].

use super::agents::AgentBackend;
use super::known_hosts::HostVerification;
use std::fmt::Write;

pub const HOME_DIR: &str = "/home/polecat";
pub const WORKSPACE_DIR: &str = "/workspace";
pub const REPO_DIR: &str = "/workspace/repo";
pub const GIT_SECRET_DIR: &str = "/etc/git-secret";
pub const AGENT_CREDS_DIR: &str = "/etc/agent-creds";
pub const METRICS_DIR: &str = "/var/run/polecat-metrics";
pub const TERMINATION_LOG: &str = "/dev/termination-log";

/// Wraps a value in single quotes for `sh`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Agent prompt naming the bead and optional task description.
pub fn prompt_for(bead_id: Option<&str>, description: Option<&str>) -> String {
    let mut prompt = match bead_id {
        Some(bead) => format!(
            "You are a Gas Town polecat working on bead {bead}. \
             Run `bd show {bead}` for the full issue."
        ),
        None => "You are a Gas Town polecat.".to_string(),
    };
    if let Some(description) = description.filter(|d| !d.trim().is_empty()) {
        prompt.push_str("\n\nTask:\n");
        prompt.push_str(description.trim());
    }
    prompt.push_str(
        "\n\nCommit your work on the current branch and push it to origin before you finish.",
    );
    prompt
}

pub struct InitScript<'a> {
    pub repository: &'a str,
    pub base_branch: &'a str,
    pub work_branch: &'a str,
    pub hosts: &'a HostVerification,
}

/// Script for the `git-init` container: SSH setup, clone and work branch.
pub fn init_script(input: &InitScript<'_>) -> String {
    let mut s = String::from("set -eu\n");

    match input.hosts {
        HostVerification::Unknown { host } => {
            let msg = format!(
                "ERROR: no verified SSH host key for {host}; add its known_hosts line to ssh.known_hosts in the operator configuration"
            );
            let _ = writeln!(s, "echo {} >&2", shell_quote(&msg));
            s.push_str("exit 1\n");
            return s;
        }
        HostVerification::Known { lines, .. } => {
            let _ = write!(
                s,
                r#"if [ -f {dir}/ssh-privatekey ]; then
  KEY_FILE={dir}/ssh-privatekey
elif [ -f {dir}/id_rsa ]; then
  KEY_FILE={dir}/id_rsa
else
  echo 'ERROR: git secret has neither ssh-privatekey nor id_rsa' >&2
  exit 1
fi
mkdir -p "$HOME/.ssh"
chmod 700 "$HOME/.ssh"
cp "$KEY_FILE" "$HOME/.ssh/id_git"
chmod 600 "$HOME/.ssh/id_git"
cat > "$HOME/.ssh/known_hosts" <<'GASTOWN_KNOWN_HOSTS'
{hosts}
GASTOWN_KNOWN_HOSTS
cat > "$HOME/.ssh/config" <<'GASTOWN_SSH_CONFIG'
Host *
  IdentityFile ~/.ssh/id_git
  IdentitiesOnly yes
  StrictHostKeyChecking yes
  UserKnownHostsFile ~/.ssh/known_hosts
GASTOWN_SSH_CONFIG
chmod 600 "$HOME/.ssh/config" "$HOME/.ssh/known_hosts"
"#,
                dir = GIT_SECRET_DIR,
                hosts = lines.join("\n"),
            );
        }
        HostVerification::NotRequired => {}
    }

    let _ = write!(
        s,
        r#"git clone --depth 1 --branch {base} {repo} {dest}
cd {dest}
git checkout -b {work}
echo "workspace ready on branch "{work}
"#,
        base = shell_quote(input.base_branch),
        repo = shell_quote(input.repository),
        dest = REPO_DIR,
        work = shell_quote(input.work_branch),
    );
    s
}

pub struct AgentScript<'a> {
    pub backend: &'a dyn AgentBackend,
    pub prompt: &'a str,
    pub base_branch: &'a str,
    pub work_branch: &'a str,
    pub git_user_name: &'a str,
    pub git_user_email: &'a str,
}

/// Script for the `agent` container.
///
/// On exit the workspace git state (`clean`, `has-uncommitted`,
/// `has-unpushed`) is written to the termination log so the operator can
/// decide whether the polecat may be destroyed. Without an upstream, HEAD
/// is compared with `origin/<work>` when that branch was pushed, else with
/// `origin/<base>`.
pub fn agent_script(input: &AgentScript<'_>) -> String {
    let backend = input.backend;
    let binary = shell_quote(backend.binary());
    let launch: Vec<String> = backend
        .launch_args()
        .iter()
        .map(|a| shell_quote(a))
        .collect();

    format!(
        r#"set -u
report_state() {{
  state=unknown
  if cd {repo} 2>/dev/null; then
    if [ -n "$(git status --porcelain 2>/dev/null)" ]; then
      state=has-uncommitted
    elif upstream=$(git rev-parse --abbrev-ref --symbolic-full-name '@{{u}}' 2>/dev/null); then
      if [ "$(git rev-list --count "$upstream..HEAD" 2>/dev/null || echo 1)" = "0" ]; then
        state=clean
      else
        state=has-unpushed
      fi
    else
      ref={base_ref}
      if git rev-parse --verify --quiet {work_ref} >/dev/null 2>&1; then
        ref={work_ref}
      fi
      if [ "$(git rev-list --count "$ref..HEAD" 2>/dev/null || echo 1)" = "0" ]; then
        state=clean
      else
        state=has-unpushed
      fi
    fi
  fi
  printf '%s' "$state" > {termination_log}
}}
trap report_state EXIT

mkdir -p "$HOME"
if [ -d {creds} ]; then
  mkdir -p "$HOME/"{creds_dir}
  cp -RL {creds}/. "$HOME/"{creds_dir}/
  chmod -R go-rwx "$HOME/"{creds_dir}
fi
git config --global user.name {user_name}
git config --global user.email {user_email}
if [ -f "$HOME/.ssh/config" ]; then
  export GIT_SSH_COMMAND="ssh -F $HOME/.ssh/config"
fi

if ! command -v {binary} >/dev/null 2>&1; then
  echo "ERROR: agent binary "{binary}" not found in image" >&2
  exit 127
fi

cd {repo}
PROMPT={prompt}
{binary} {launch} "$PROMPT"
status=$?
echo "agent exited with status $status"
exit $status
"#,
        repo = REPO_DIR,
        base_ref = shell_quote(&format!("origin/{}", input.base_branch)),
        work_ref = shell_quote(&format!("refs/remotes/origin/{}", input.work_branch)),
        termination_log = TERMINATION_LOG,
        creds = AGENT_CREDS_DIR,
        creds_dir = shell_quote(backend.credentials_dir()),
        user_name = shell_quote(input.git_user_name),
        user_email = shell_quote(input.git_user_email),
        binary = binary,
        prompt = shell_quote(input.prompt),
        launch = launch.join(" "),
    )
}

/// Extended regex for `pgrep -f` that matches the agent's command line as
/// an executable word. The first letter is bracketed so the pattern never
/// matches a command line that merely contains the pattern itself.
pub fn process_pattern(binary: &str) -> String {
    let name = binary.rsplit('/').next().unwrap_or(binary);
    let mut chars = name.chars();
    let head = match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' || c == '.' => format!("[{}]", c),
        Some(c) => escape_ere(&c.to_string()),
        None => return "^$".to_string(),
    };
    format!("(^|[ /]){}{}( |$)", head, escape_ere(chars.as_str()))
}

fn escape_ere(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if "\\.^$|?*+()[]{}".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub struct SidecarScript<'a> {
    pub agent_binary: &'a str,
    pub port: i32,
    pub interval_seconds: u32,
}

/// Script for the `telemetry` sidecar: writes Prometheus text to the shared
/// metrics volume and serves it with a busybox `nc` responder.
pub fn sidecar_script(input: &SidecarScript<'_>) -> String {
    format!(
        r#"START=$(date +%s)
mkdir -p {metrics}
(
  while true; do
    NOW=$(date +%s)
    if pgrep -f {pattern} >/dev/null 2>&1; then ALIVE=1; else ALIVE=0; fi
    LAST=$(find {repo} -type f ! -path '*/.git/objects/*' -exec stat -c %Y {{}} + 2>/dev/null | sort -n | tail -n 1)
    [ -n "$LAST" ] || LAST=$START
    {{
      echo '# HELP polecat_execution_duration_seconds Seconds since the pod started working'
      echo '# TYPE polecat_execution_duration_seconds gauge'
      echo "polecat_execution_duration_seconds $((NOW - START))"
      echo '# HELP polecat_agent_alive Whether the agent process is running'
      echo '# TYPE polecat_agent_alive gauge'
      echo "polecat_agent_alive $ALIVE"
      echo '# HELP polecat_workspace_last_activity_timestamp Unix time of the newest workspace change'
      echo '# TYPE polecat_workspace_last_activity_timestamp gauge'
      echo "polecat_workspace_last_activity_timestamp $LAST"
    }} > {metrics}/metrics.prom.tmp && mv {metrics}/metrics.prom.tmp {metrics}/metrics.prom
    sleep {interval}
  done
) &
while true; do
  {{
    printf 'HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nConnection: close\r\n\r\n'
    cat {metrics}/metrics.prom 2>/dev/null
  }} | nc -l -p {port} >/dev/null 2>&1 || sleep 1
done
"#,
        metrics = METRICS_DIR,
        pattern = shell_quote(&process_pattern(input.agent_binary)),
        repo = REPO_DIR,
        interval = input.interval_seconds,
        port = input.port,
    )
}

#[cfg(test)]
mod tests {
    use super::super::agents::{Claude, Codex};
    use super::*;

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn test_prompt_embeds_bead_and_description() {
        let prompt = prompt_for(Some("wd-a1b2"), Some("Fix the flaky test"));
        assert!(prompt.contains("wd-a1b2"));
        assert!(prompt.contains("Fix the flaky test"));
        let bare = prompt_for(None, Some("  "));
        assert!(!bare.contains("Task:"));
    }

    #[test]
    fn test_init_script_for_known_host() {
        let hosts = HostVerification::Known {
            host: "github.com".to_string(),
            lines: vec!["github.com ssh-ed25519 AAAAkey".to_string()],
        };
        let script = init_script(&InitScript {
            repository: "git@github.com:acme/widgets.git",
            base_branch: "main",
            work_branch: "polecat/wd-1",
            hosts: &hosts,
        });
        assert!(script.contains("StrictHostKeyChecking yes"));
        assert!(script.contains("github.com ssh-ed25519 AAAAkey"));
        assert!(script.contains("ssh-privatekey"));
        assert!(script.contains("id_rsa"));
        assert!(script.contains("git clone --depth 1 --branch 'main' 'git@github.com:acme/widgets.git'"));
        assert!(script.contains("git checkout -b 'polecat/wd-1'"));
        let clone = script.find("git clone").unwrap();
        let known = script.find("known_hosts").unwrap();
        assert!(known < clone);
    }

    #[test]
    fn test_init_script_for_unknown_host_fails_before_clone() {
        let hosts = HostVerification::Unknown {
            host: "git.example.net".to_string(),
        };
        let script = init_script(&InitScript {
            repository: "git@git.example.net:acme/widgets.git",
            base_branch: "main",
            work_branch: "polecat/wd-1",
            hosts: &hosts,
        });
        assert!(script.contains("git.example.net"));
        assert!(script.contains("exit 1"));
        assert!(!script.contains("git clone"));
    }

    #[test]
    fn test_init_script_for_https_skips_ssh() {
        let script = init_script(&InitScript {
            repository: "https://github.com/acme/widgets.git",
            base_branch: "develop",
            work_branch: "feature",
            hosts: &HostVerification::NotRequired,
        });
        assert!(!script.contains(".ssh"));
        assert!(script.contains("--branch 'develop'"));
    }

    #[test]
    fn test_agent_script_reports_git_state() {
        let script = agent_script(&AgentScript {
            backend: &Claude,
            prompt: "work on 'wd-1'",
            base_branch: "main",
            work_branch: "polecat/wd-1",
            git_user_name: "Polecat",
            git_user_email: "polecat@example.com",
        });
        assert!(script.contains("trap report_state EXIT"));
        assert!(script.contains("has-uncommitted"));
        assert!(script.contains("has-unpushed"));
        assert!(script.contains(TERMINATION_LOG));
        assert!(script.contains("command -v 'claude'"));
        assert!(script.contains("'--dangerously-skip-permissions'"));
        assert!(script.contains(r"PROMPT='work on '\''wd-1'\'''"));
        assert!(script.contains("ref='origin/main'"));
    }

    #[test]
    fn test_agent_script_prefers_pushed_work_branch() {
        let script = agent_script(&AgentScript {
            backend: &Claude,
            prompt: "p",
            base_branch: "main",
            work_branch: "polecat/wd-9",
            git_user_name: "n",
            git_user_email: "e",
        });
        let check = "git rev-parse --verify --quiet 'refs/remotes/origin/polecat/wd-9'";
        assert!(script.contains(check));
        assert!(script.contains("ref='refs/remotes/origin/polecat/wd-9'"));
        assert!(script.contains(r#"rev-list --count "$ref..HEAD""#));
        let fallback = script.find("ref='origin/main'").unwrap();
        assert!(fallback < script.find(check).unwrap());
    }

    #[test]
    fn test_agent_script_uses_backend_credentials_dir() {
        let script = agent_script(&AgentScript {
            backend: &Codex,
            prompt: "p",
            base_branch: "main",
            work_branch: "polecat/p",
            git_user_name: "n",
            git_user_email: "e",
        });
        assert!(script.contains("'.codex'"));
        assert!(script.contains("command -v 'codex'"));
    }

    #[test]
    fn test_sidecar_serves_activity_metrics() {
        let script = sidecar_script(&SidecarScript {
            agent_binary: "claude",
            port: 9090,
            interval_seconds: 15,
        });
        assert!(script.contains("polecat_agent_alive"));
        assert!(script.contains("polecat_workspace_last_activity_timestamp"));
        assert!(script.contains("polecat_execution_duration_seconds"));
        assert!(script.contains("nc -l -p 9090"));
        assert!(script.contains("pgrep -f '(^|[ /])[c]laude( |$)'"));
        assert!(!script.contains("claude"));
    }

    #[test]
    fn test_process_pattern_escapes_and_strips_path() {
        assert_eq!(process_pattern("/usr/local/bin/codex"), "(^|[ /])[c]odex( |$)");
        assert_eq!(process_pattern("my.agent"), r"(^|[ /])[m]y\.agent( |$)");
        assert_eq!(process_pattern("_run"), "(^|[ /])[_]run( |$)");
    }

    fn ere_matches(pattern: &str, text: &str) -> bool {
        std::process::Command::new("sh")
            .args(["-c", r#"printf '%s\n' "$1" | grep -Eq -- "$2""#, "sh", text, pattern])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_process_pattern_skips_the_sidecar_itself() {
        let pattern = process_pattern("claude");
        assert!(ere_matches(&pattern, "claude --dangerously-skip-permissions go"));
        assert!(ere_matches(&pattern, "node /usr/local/bin/claude -p go"));
        let sidecar = sidecar_script(&SidecarScript {
            agent_binary: "claude",
            port: 9090,
            interval_seconds: 15,
        });
        assert!(!ere_matches(&pattern, &format!("sh -c {}", sidecar.replace('\n', " "))));
        assert!(!ere_matches(&pattern, "claudette"));
    }
}
