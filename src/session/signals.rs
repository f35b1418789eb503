//! Bidirectional mapping between SSH signal names and POSIX signals

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// SSH wire name (no `SIG` prefix) paired with its POSIX signal.
const SIGNAL_TABLE: &[(&str, Signal)] = &[
    ("ABRT", Signal::SIGABRT),
    ("ALRM", Signal::SIGALRM),
    ("FPE", Signal::SIGFPE),
    ("HUP", Signal::SIGHUP),
    ("ILL", Signal::SIGILL),
    ("INT", Signal::SIGINT),
    ("KILL", Signal::SIGKILL),
    ("PIPE", Signal::SIGPIPE),
    ("QUIT", Signal::SIGQUIT),
    ("SEGV", Signal::SIGSEGV),
    ("TERM", Signal::SIGTERM),
    ("USR1", Signal::SIGUSR1),
    ("USR2", Signal::SIGUSR2),
];

/// Resolve an SSH signal name to its POSIX signal. Unknown names resolve to
/// `None`, which [`deliver`] turns into a signal-0 (existence check) send.
pub fn os_signal(name: &str) -> Option<Signal> {
    SIGNAL_TABLE
        .iter()
        .find(|(ssh_name, _)| *ssh_name == name)
        .map(|(_, signal)| *signal)
}

/// Resolve a raw signal number from a wait status to its SSH wire name.
pub fn ssh_signal_name(raw: i32) -> Option<&'static str> {
    let signal = Signal::try_from(raw).ok()?;
    SIGNAL_TABLE
        .iter()
        .find(|(_, os)| *os == signal)
        .map(|(name, _)| *name)
}

/// Deliver a signal to a process. `None` sends signal 0: no signal is
/// delivered, but errors are still reported for a vanished process.
pub fn deliver(pid: Pid, signal: Option<Signal>) -> nix::Result<()> {
    kill(pid, signal)
}
