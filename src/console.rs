//! Operator console: one `keyword [param]` command per line on stdin.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{error, info, warn};

use crate::blocklist::{is_valid_host, Change};
use crate::state::{unix_now, ProxyState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Block(String),
    Unblock(String),
    Verbose(bool),
    Cache(bool),
    Timing(bool),
    ShowSaving,
    Stats,
    List,
    Help,
    MissingHost(&'static str),
    Unknown(String),
}

impl Command {
    /// Dispatches on the first token. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let keyword = tokens.next()?;
        let param = tokens.next();

        let command = match keyword {
            "block" => match param {
                Some(host) => Command::Block(host.to_string()),
                None => Command::MissingHost("block"),
            },
            "unblock" => match param {
                Some(host) => Command::Unblock(host.to_string()),
                None => Command::MissingHost("unblock"),
            },
            "verbose" => Command::Verbose(true),
            "noverbose" => Command::Verbose(false),
            "cache" => Command::Cache(true),
            "nocache" => Command::Cache(false),
            "timing" => Command::Timing(true),
            "notiming" => Command::Timing(false),
            "showsaving" => Command::ShowSaving,
            "stats" => Command::Stats,
            "list" => Command::List,
            "help" => Command::Help,
            other => Command::Unknown(other.to_string()),
        };
        Some(command)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Feedback {
    Info(String),
    Warn(String),
}

const HELP: &str = "commands: block <host>, unblock <host>, verbose, noverbose, \
cache, nocache, timing, notiming, showsaving, stats, list, help";

pub fn execute(state: &ProxyState, command: Command) -> anyhow::Result<Feedback> {
    let feedback = match command {
        Command::Block(host) => {
            if !is_valid_host(&host) {
                Feedback::Warn(format!("{} is not a valid host", host))
            } else {
                match state.blocklist.block(&host)? {
                    Change::Applied => Feedback::Info(format!("Blocked {}", host)),
                    Change::Unchanged => Feedback::Warn(format!("{} already blocked", host)),
                }
            }
        }
        Command::Unblock(host) => match state.blocklist.unblock(&host)? {
            Change::Applied => Feedback::Info(format!("Unblocked {}", host)),
            Change::Unchanged => Feedback::Warn(format!("{} not blacklisted", host)),
        },
        Command::Verbose(on) => {
            state.flags.set_verbose(on);
            Feedback::Info(format!("Verbose logging {}", on_off(on)))
        }
        Command::Cache(on) => {
            state.flags.set_caching(on);
            Feedback::Info(format!("Caching {}", on_off(on)))
        }
        Command::Timing(on) => {
            state.flags.set_timing(on);
            Feedback::Info(format!("Timing {}", on_off(on)))
        }
        Command::ShowSaving => Feedback::Info(format!(
            "Saved {} bytes from the network",
            state.cache.bytes_saved()
        )),
        Command::Stats => {
            let purged = state.cache.purge_expired(unix_now());
            state.stats.print(&state.cache);
            Feedback::Info(format!("Purged {} expired entries", purged))
        }
        Command::List => Feedback::Info(format!("Blocked hosts: {:?}", state.blocklist.hosts())),
        Command::Help => Feedback::Info(HELP.to_string()),
        Command::MissingHost(keyword) => Feedback::Warn(format!("usage: {} <host>", keyword)),
        Command::Unknown(keyword) => Feedback::Warn(format!("{} not recognised", keyword)),
    };
    Ok(feedback)
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

/// Reads commands until `input` reaches EOF.
pub async fn run<R>(state: Arc<ProxyState>, input: R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = Command::parse(&line) else {
            continue;
        };
        let outcome = match command {
            // These rewrite the blocklist file.
            Command::Block(_) | Command::Unblock(_) => {
                let state = state.clone();
                tokio::task::spawn_blocking(move || execute(&state, command))
                    .await
                    .unwrap_or_else(|e| Err(anyhow::anyhow!("command task failed: {}", e)))
            }
            command => execute(&state, command),
        };
        match outcome {
            Ok(Feedback::Info(msg)) => info!("{}", msg),
            Ok(Feedback::Warn(msg)) => warn!("{}", msg),
            Err(e) => error!("Command failed: {:#}", e),
        }
    }
    info!("Console input closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocklist::Blocklist;
    use crate::state::RuntimeFlags;

    fn test_state(dir: &tempfile::TempDir) -> ProxyState {
        let blocklist = Blocklist::empty(dir.path().join("blockList.json"));
        ProxyState::new(blocklist, RuntimeFlags::default())
    }

    fn run_line(state: &ProxyState, line: &str) -> Feedback {
        execute(state, Command::parse(line).unwrap()).unwrap()
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            Command::parse("block example.com"),
            Some(Command::Block("example.com".into()))
        );
        assert_eq!(
            Command::parse("  unblock   a.org  "),
            Some(Command::Unblock("a.org".into()))
        );
        assert_eq!(Command::parse("nocache"), Some(Command::Cache(false)));
        assert_eq!(Command::parse("block"), Some(Command::MissingHost("block")));
        assert_eq!(Command::parse("BLOCK x"), Some(Command::Unknown("BLOCK".into())));
        assert_eq!(Command::parse("   "), None);
    }

    #[test]
    fn test_block_and_unblock() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        assert!(matches!(run_line(&state, "block example.com"), Feedback::Info(_)));
        assert!(state.blocklist.is_blocked("example.com"));
        assert_eq!(
            run_line(&state, "block example.com"),
            Feedback::Warn("example.com already blocked".into())
        );

        assert!(matches!(run_line(&state, "unblock example.com"), Feedback::Info(_)));
        assert!(!state.blocklist.is_blocked("example.com"));
        assert_eq!(
            run_line(&state, "unblock example.com"),
            Feedback::Warn("example.com not blacklisted".into())
        );

        let saved = std::fs::read_to_string(dir.path().join("blockList.json")).unwrap();
        assert!(saved.contains("blockedURLs"));
        assert!(!saved.contains("example.com"));
    }

    #[test]
    fn test_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        run_line(&state, "verbose");
        run_line(&state, "nocache");
        run_line(&state, "timing");
        assert!(state.flags.verbose());
        assert!(!state.flags.caching());
        assert!(state.flags.timing());

        run_line(&state, "noverbose");
        run_line(&state, "cache");
        run_line(&state, "notiming");
        assert!(!state.flags.verbose());
        assert!(state.flags.caching());
        assert!(!state.flags.timing());
    }

    #[test]
    fn test_unknown_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        assert_eq!(
            run_line(&state, "frobnicate now"),
            Feedback::Warn("frobnicate not recognised".into())
        );
        assert!(state.flags.caching());
        assert_eq!(state.blocklist.len(), 0);
    }

    #[test]
    fn test_showsaving() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let resp = b"HTTP/1.1 200 OK\r\nCache-Control: max-age=60\r\n\r\n";
        let now = unix_now();
        let size = state.cache.store(resp, "a/", None, now).unwrap();

        assert_eq!(
            run_line(&state, "showsaving"),
            Feedback::Info("Saved 0 bytes from the network".into())
        );
        state.cache.lookup("missing", now);
        state.cache.lookup("a/", now);
        assert_eq!(
            run_line(&state, "showsaving"),
            Feedback::Info(format!("Saved {} bytes from the network", size))
        );
    }

    #[tokio::test]
    async fn test_run_reads_lines() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(test_state(&dir));
        let input: &[u8] = b"block a.com\n\nnocache\nbogus\nblock b.com\nunblock a.com\n";

        run(state.clone(), input).await.unwrap();

        assert_eq!(state.blocklist.hosts(), vec!["b.com"]);
        assert!(!state.flags.caching());
    }

    #[tokio::test]
    async fn test_run_survives_failed_save() {
        let dir = tempfile::tempdir().unwrap();
        let blocklist = Blocklist::empty(dir.path().join("missing").join("blockList.json"));
        let state = Arc::new(ProxyState::new(blocklist, RuntimeFlags::default()));
        let input: &[u8] = b"block a.com\nnocache\n";

        run(state.clone(), input).await.unwrap();

        assert_eq!(state.blocklist.len(), 0);
        assert!(!state.flags.caching());
    }
}
