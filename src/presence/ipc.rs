//! Discord local RPC transport.
//!
//! Every message is a frame: `opcode: u32 LE`, `length: u32 LE`, then
//! `length` bytes of JSON.

use std::io::{Read, Write};
#[cfg(unix)]
use std::path::PathBuf;
#[cfg(any(unix, windows))]
use std::time::Duration;

use serde_json::Value;

use super::PresenceError;

/// Largest payload we accept from the other side
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Socket slots Discord may listen on (discord-ipc-0 .. discord-ipc-9)
const SLOTS: usize = 10;

/// Longest a single read or write on the socket may block
#[cfg(any(unix, windows))]
const IO_TIMEOUT: Duration = Duration::from_secs(2);

/// How often a pipe with nothing to read is checked again
#[cfg(windows)]
const PIPE_POLL: Duration = Duration::from_millis(10);

/// Byte stream to a Discord client (Unix socket, named pipe, or a test double).
pub trait IpcStream: Read + Write + Send {}

impl<T: Read + Write + Send> IpcStream for T {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Handshake = 0,
    Frame = 1,
    Close = 2,
    Ping = 3,
    Pong = 4,
}

impl Opcode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Opcode::Handshake),
            1 => Some(Opcode::Frame),
            2 => Some(Opcode::Close),
            3 => Some(Opcode::Ping),
            4 => Some(Opcode::Pong),
            _ => None,
        }
    }
}

pub fn write_frame<W: Write + ?Sized>(writer: &mut W, opcode: Opcode, payload: &Value) -> Result<(), PresenceError> {
    let body = serde_json::to_vec(payload)?;
    let len = u32::try_from(body.len())
        .map_err(|_| PresenceError::Protocol(format!("payload too large ({} bytes)", body.len())))?;

    let mut frame = Vec::with_capacity(8 + body.len());
    frame.extend_from_slice(&(opcode as u32).to_le_bytes());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);

    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<(Opcode, Value), PresenceError> {
    let mut header = [0u8; 8];
    reader.read_exact(&mut header)?;

    let raw_op = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

    let opcode = Opcode::from_u32(raw_op)
        .ok_or_else(|| PresenceError::Protocol(format!("unknown opcode {}", raw_op)))?;
    if len > MAX_PAYLOAD {
        return Err(PresenceError::Protocol(format!("frame of {} bytes exceeds limit", len)));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    let payload = if body.is_empty() { Value::Null } else { serde_json::from_slice(&body)? };
    Ok((opcode, payload))
}

/// Socket directories, in lookup order, given an environment lookup.
#[cfg(unix)]
fn socket_dirs(env: impl Fn(&str) -> Option<String>) -> Vec<PathBuf> {
    let base = ["XDG_RUNTIME_DIR", "TMPDIR", "TMP", "TEMP"]
        .iter()
        .find_map(|key| env(key).filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "/tmp".to_string());
    let base = PathBuf::from(base);

    // Flatpak and Snap builds of Discord put the socket in a subdirectory
    vec![
        base.clone(),
        base.join("app/com.discordapp.Discord"),
        base.join("snap.discord"),
    ]
}

#[cfg(unix)]
fn candidate_paths(env: impl Fn(&str) -> Option<String>) -> Vec<PathBuf> {
    socket_dirs(env)
        .into_iter()
        .flat_map(|dir| (0..SLOTS).map(move |i| dir.join(format!("discord-ipc-{}", i))))
        .collect()
}

/// Opens the first Discord IPC endpoint that accepts a connection.
#[cfg(unix)]
pub fn connect() -> Result<Box<dyn IpcStream>, PresenceError> {
    use std::os::unix::net::UnixStream;

    let paths = candidate_paths(|key| std::env::var(key).ok());
    for path in &paths {
        if let Ok(stream) = UnixStream::connect(path) {
            stream.set_read_timeout(Some(IO_TIMEOUT))?;
            stream.set_write_timeout(Some(IO_TIMEOUT))?;
            tracing::debug!("[Presence/IPC] Connected to {}", path.display());
            return Ok(Box::new(stream));
        }
    }
    Err(PresenceError::NotFound(paths.len()))
}

/// Named pipe client whose reads give up after `IO_TIMEOUT`.
///
/// A plain pipe handle has no read timeout, so reads only start once
/// `PeekNamedPipe` reports data waiting.
#[cfg(windows)]
struct Pipe {
    file: std::fs::File,
}

#[cfg(windows)]
impl Pipe {
    fn available(&self) -> std::io::Result<u32> {
        use std::os::windows::io::AsRawHandle;
        use windows::Win32::Foundation::HANDLE;
        use windows::Win32::System::Pipes::PeekNamedPipe;

        let mut available = 0u32;
        // SAFETY: the handle belongs to `self.file`, which outlives the call,
        // and `available` is a valid out pointer
        unsafe {
            PeekNamedPipe(
                HANDLE(self.file.as_raw_handle() as isize),
                None,
                0,
                None,
                Some(&mut available),
                None,
            )
        }
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string()))?;
        Ok(available)
    }
}

#[cfg(windows)]
impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let deadline = std::time::Instant::now() + IO_TIMEOUT;
        while self.available()? == 0 {
            if std::time::Instant::now() >= deadline {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "Discord did not answer"));
            }
            std::thread::sleep(PIPE_POLL);
        }
        self.file.read(buf)
    }
}

#[cfg(windows)]
impl Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

/// Opens the first Discord named pipe that accepts a connection.
#[cfg(windows)]
pub fn connect() -> Result<Box<dyn IpcStream>, PresenceError> {
    use std::fs::OpenOptions;

    for i in 0..SLOTS {
        let path = format!(r"\\.\pipe\discord-ipc-{}", i);
        if let Ok(file) = OpenOptions::new().read(true).write(true).open(&path) {
            tracing::debug!("[Presence/IPC] Connected to {}", path);
            return Ok(Box::new(Pipe { file }));
        }
    }
    Err(PresenceError::NotFound(SLOTS))
}

#[cfg(not(any(unix, windows)))]
pub fn connect() -> Result<Box<dyn IpcStream>, PresenceError> {
    Err(PresenceError::NotFound(0))
}
