//! PTY master lifecycle - allocation, terminal modes, window sizing
//!
//! The master half stays with the daemon for the life of the session; the
//! slave becomes the child's controlling terminal and is closed in the parent
//! right after spawn. Terminal modes arrive as the SSH-encoded modelist: a
//! run of records, each an 8-bit opcode followed by a 32-bit big-endian
//! value, terminated by opcode 0 or any opcode >= 160.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::termios::{
    cfsetispeed, cfsetospeed, tcgetattr, tcsetattr, BaudRate, ControlFlags, InputFlags, LocalFlags,
    OutputFlags, SetArg, SpecialCharacterIndices,
};
use tokio::io::unix::AsyncFd;
use tracing::debug;

/// Opcode terminating modelist parsing.
const TTY_OP_END: u8 = 0;

/// First opcode outside the mode table; also terminates parsing.
const TTY_OP_RESERVED: u8 = 160;

/// The daemon-held master half of a PTY pair.
///
/// Cheap to clone; the underlying descriptor closes when the last clone
/// drops, which the session arranges to happen exactly once at teardown.
#[derive(Clone)]
pub struct PtyMaster {
    fd: Arc<AsyncFd<OwnedFd>>,
}

impl PtyMaster {
    /// Open a master/slave pair sized to the negotiated window. The returned
    /// slave descriptor is destined for the child and must be closed in the
    /// parent after spawn.
    pub fn open(columns: u32, rows: u32) -> Result<(Self, OwnedFd)> {
        let winsize = window(columns, rows);
        let OpenptyResult { master, slave } =
            openpty(&winsize, None).context("openpty failed")?;

        set_nonblocking(&master)?;
        let fd = AsyncFd::new(master).context("registering pty master with the reactor")?;

        Ok((
            Self { fd: Arc::new(fd) },
            slave,
        ))
    }

    /// Apply the negotiated window size via `TIOCSWINSZ`.
    pub fn set_window_size(&self, columns: u32, rows: u32) -> io::Result<()> {
        let winsize = window(columns, rows);
        let ret = unsafe {
            libc::ioctl(
                self.fd.get_ref().as_raw_fd(),
                libc::TIOCSWINSZ,
                std::ptr::addr_of!(winsize),
            )
        };
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Walk the modelist and apply each record to the terminal. A record
    /// that cannot be applied is skipped; a truncated record ends the walk.
    pub fn apply_modes(&self, modelist: &[u8]) {
        let mut cursor = modelist;
        loop {
            let Some((&opcode, rest)) = cursor.split_first() else {
                break;
            };
            if opcode == TTY_OP_END || opcode >= TTY_OP_RESERVED {
                break;
            }
            if rest.len() < 4 {
                debug!(opcode, "partial modelist record, stopping");
                break;
            }
            let (value_bytes, rest) = rest.split_at(4);
            let value =
                u32::from_be_bytes([value_bytes[0], value_bytes[1], value_bytes[2], value_bytes[3]]);
            cursor = rest;

            if let Err(err) = self.apply_mode(opcode, value) {
                debug!(opcode, value, error = %err, "skipping terminal mode");
            }
        }
    }

    fn apply_mode(&self, opcode: u8, value: u32) -> Result<()> {
        let Some(mode) = term_mode(opcode) else {
            bail!("no setter for opcode {opcode}");
        };

        let fd = self.fd.get_ref();
        let mut termios = tcgetattr(fd)?;
        match mode {
            TermMode::ControlChar(index) => {
                termios.control_chars[index as usize] = value as libc::cc_t;
            }
            TermMode::Input(flag) => termios.input_flags.set(flag, value != 0),
            TermMode::Output(flag) => termios.output_flags.set(flag, value != 0),
            TermMode::Control(flag) => termios.control_flags.set(flag, value != 0),
            TermMode::Local(flag) => termios.local_flags.set(flag, value != 0),
            TermMode::InputSpeed => cfsetispeed(&mut termios, baud_rate(value)?)?,
            TermMode::OutputSpeed => cfsetospeed(&mut termios, baud_rate(value)?)?,
        }
        tcsetattr(fd, SetArg::TCSANOW, &termios)?;
        Ok(())
    }

    /// Read from the master. An `EIO` after the slave side is gone means the
    /// child is done; callers treat any error like EOF.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|fd| {
                let n = unsafe {
                    libc::read(fd.get_ref().as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(read) => return read,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write the whole buffer to the master.
    pub async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let mut guard = self.fd.writable().await?;
            let result = guard.try_io(|fd| {
                let n = unsafe {
                    libc::write(fd.get_ref().as_raw_fd(), data.as_ptr().cast(), data.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(written) => data = &data[written?..],
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn raw_fd(&self) -> std::os::fd::RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}

fn window(columns: u32, rows: u32) -> Winsize {
    Winsize {
        ws_row: rows as u16,
        ws_col: columns as u16,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error()).context("F_GETFL on pty master");
    }
    let ret = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret == -1 {
        return Err(io::Error::last_os_error()).context("F_SETFL on pty master");
    }
    Ok(())
}

enum TermMode {
    ControlChar(SpecialCharacterIndices),
    Input(InputFlags),
    Output(OutputFlags),
    Control(ControlFlags),
    Local(LocalFlags),
    InputSpeed,
    OutputSpeed,
}

/// Setter table for the SSH terminal-modes registry. Opcodes 34, 90 and 91
/// carry ICRNL, ISIG and ICANON on this wire. Opcodes with no local
/// equivalent return `None` and are skipped by the caller.
fn term_mode(opcode: u8) -> Option<TermMode> {
    use SpecialCharacterIndices::*;
    use TermMode::*;

    Some(match opcode {
        1 => ControlChar(VINTR),
        2 => ControlChar(VQUIT),
        3 => ControlChar(VERASE),
        4 => ControlChar(VKILL),
        5 => ControlChar(VEOF),
        6 => ControlChar(VEOL),
        7 => ControlChar(VEOL2),
        8 => ControlChar(VSTART),
        9 => ControlChar(VSTOP),
        10 => ControlChar(VSUSP),
        12 => ControlChar(VREPRINT),
        13 => ControlChar(VWERASE),
        14 => ControlChar(VLNEXT),
        18 => ControlChar(VDISCARD),

        30 => Input(InputFlags::IGNPAR),
        31 => Input(InputFlags::PARMRK),
        32 => Input(InputFlags::INPCK),
        33 => Input(InputFlags::ISTRIP),
        34 => Input(InputFlags::ICRNL),
        35 => Input(InputFlags::IGNCR),
        36 => Input(InputFlags::INLCR),
        37 => Input(InputFlags::from_bits_retain(libc::IUCLC)),
        38 => Input(InputFlags::IXON),
        39 => Input(InputFlags::IXANY),
        40 => Input(InputFlags::IXOFF),
        41 => Input(InputFlags::IMAXBEL),
        42 => Input(InputFlags::IUTF8),

        50 => Local(LocalFlags::ISIG),
        51 => Local(LocalFlags::ICANON),
        52 => Local(LocalFlags::from_bits_retain(libc::XCASE)),
        53 => Local(LocalFlags::ECHO),
        54 => Local(LocalFlags::ECHOE),
        55 => Local(LocalFlags::ECHOK),
        56 => Local(LocalFlags::ECHONL),
        57 => Local(LocalFlags::NOFLSH),
        58 => Local(LocalFlags::TOSTOP),
        59 => Local(LocalFlags::IEXTEN),
        60 => Local(LocalFlags::ECHOCTL),
        61 => Local(LocalFlags::ECHOKE),
        62 => Local(LocalFlags::PENDIN),

        70 => Output(OutputFlags::OPOST),
        71 => Output(OutputFlags::OLCUC),
        72 => Output(OutputFlags::ONLCR),
        73 => Output(OutputFlags::OCRNL),
        74 => Output(OutputFlags::ONOCR),
        75 => Output(OutputFlags::ONLRET),

        90 => Local(LocalFlags::ISIG),
        91 => Local(LocalFlags::ICANON),
        92 => Control(ControlFlags::PARENB),
        93 => Control(ControlFlags::PARODD),

        128 => InputSpeed,
        129 => OutputSpeed,

        _ => return None,
    })
}

fn baud_rate(value: u32) -> Result<BaudRate> {
    Ok(match value {
        50 => BaudRate::B50,
        75 => BaudRate::B75,
        110 => BaudRate::B110,
        134 => BaudRate::B134,
        150 => BaudRate::B150,
        200 => BaudRate::B200,
        300 => BaudRate::B300,
        600 => BaudRate::B600,
        1200 => BaudRate::B1200,
        1800 => BaudRate::B1800,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        other => bail!("unsupported baud rate {other}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_winsize(fd: std::os::fd::RawFd) -> Winsize {
        let mut winsize = Winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let ret = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, std::ptr::addr_of_mut!(winsize)) };
        assert_eq!(ret, 0, "TIOCGWINSZ failed");
        winsize
    }

    fn modelist(records: &[(u8, u32)], terminator: Option<u8>) -> Vec<u8> {
        let mut out = Vec::new();
        for (opcode, value) in records {
            out.push(*opcode);
            out.extend_from_slice(&value.to_be_bytes());
        }
        if let Some(op) = terminator {
            out.push(op);
        }
        out
    }

    #[tokio::test]
    async fn open_applies_initial_window_size() {
        let (master, _slave) = PtyMaster::open(80, 24).expect("openpty");
        let winsize = read_winsize(master.raw_fd());
        assert_eq!(winsize.ws_col, 80);
        assert_eq!(winsize.ws_row, 24);
    }

    #[tokio::test]
    async fn window_size_can_be_changed_later() {
        let (master, _slave) = PtyMaster::open(80, 24).expect("openpty");
        master.set_window_size(132, 40).expect("TIOCSWINSZ");
        let winsize = read_winsize(master.raw_fd());
        assert_eq!(winsize.ws_col, 132);
        assert_eq!(winsize.ws_row, 40);
    }

    #[tokio::test]
    async fn modelist_records_reach_the_terminal() {
        let (master, _slave) = PtyMaster::open(80, 24).expect("openpty");

        // ECHO off, ISIG off via its wire opcode, VINTR to ^_ (0x1f).
        let list = modelist(&[(53, 0), (90, 0), (1, 0x1f)], Some(0));
        master.apply_modes(&list);

        let termios = tcgetattr(master.fd.get_ref()).expect("tcgetattr");
        assert!(!termios.local_flags.contains(LocalFlags::ECHO));
        assert!(!termios.local_flags.contains(LocalFlags::ISIG));
        assert_eq!(
            termios.control_chars[SpecialCharacterIndices::VINTR as usize],
            0x1f
        );
    }

    #[tokio::test]
    async fn reserved_opcode_terminates_parsing() {
        let (master, _slave) = PtyMaster::open(80, 24).expect("openpty");

        // ECHO off, then a reserved opcode, then an ECHO-on record that must
        // never be applied.
        let mut list = modelist(&[(53, 0)], None);
        list.push(200);
        list.extend_from_slice(&modelist(&[(53, 1)], Some(0)));
        master.apply_modes(&list);

        let termios = tcgetattr(master.fd.get_ref()).expect("tcgetattr");
        assert!(!termios.local_flags.contains(LocalFlags::ECHO));
    }

    #[tokio::test]
    async fn unknown_opcodes_are_skipped_not_fatal() {
        let (master, _slave) = PtyMaster::open(80, 24).expect("openpty");

        // Opcode 100 has no setter; the ECHO-off record after it must still
        // be applied.
        let list = modelist(&[(100, 1), (53, 0)], Some(0));
        master.apply_modes(&list);

        let termios = tcgetattr(master.fd.get_ref()).expect("tcgetattr");
        assert!(!termios.local_flags.contains(LocalFlags::ECHO));
    }

    #[tokio::test]
    async fn truncated_record_ends_the_walk() {
        let (master, _slave) = PtyMaster::open(80, 24).expect("openpty");
        // Opcode with only two value bytes.
        master.apply_modes(&[53, 0, 0]);
        master.apply_modes(&[]);
    }
}
