//! SCP dispatch - command detection and the file-copy collaborator
//!
//! The session core never speaks the scp protocol itself. When an `exec`
//! request's command line looks like an scp invocation, the channel streams
//! are handed to the configured [`ScpCopier`] instead of a shell.

use std::sync::LazyLock;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;

use crate::channel::ChannelIo;

static SCP_COMMAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*scp($|\s+)").expect("scp pattern compiles"));

/// True when an `exec` command line should be routed to the copier instead
/// of a shell.
pub fn is_scp_command(command: &str) -> bool {
    SCP_COMMAND.is_match(command)
}

/// File-copy collaborator invoked for `scp` commands.
///
/// Implementations parse the command line themselves and speak the scp
/// protocol over the channel streams. `Ok` maps to `exit-status 0` on the
/// channel, any error to `exit-status 1`.
#[async_trait]
pub trait ScpCopier: Send + Sync {
    async fn copy(&self, command: &str, io: ChannelIo) -> Result<()>;
}

/// Copier for daemons without file-copy support: every transfer fails.
pub struct UnsupportedScpCopier;

#[async_trait]
impl ScpCopier for UnsupportedScpCopier {
    async fn copy(&self, command: &str, _io: ChannelIo) -> Result<()> {
        anyhow::bail!("scp is not supported: {command}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_scp_invocations() {
        assert!(is_scp_command("scp"));
        assert!(is_scp_command("scp -t /tmp/dest"));
        assert!(is_scp_command("  scp -f file"));
        assert!(is_scp_command("\tscp -v -t ."));
    }

    #[test]
    fn ignores_non_scp_commands() {
        assert!(!is_scp_command("scpx -t /tmp"));
        assert!(!is_scp_command("ls scp"));
        assert!(!is_scp_command("/usr/bin/scp -t /tmp"));
        assert!(!is_scp_command(""));
    }
}
