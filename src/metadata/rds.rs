// RDS text for the broadcast stage - sanitizing PS/RT and writing the
// "PS <text>" / "RT <text>" line protocol to its control FIFO

use std::ffi::CString;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

pub const PS_MAX_CHARS: usize = 8;
pub const RT_MAX_CHARS: usize = 64;

/// One line for the transmitter's control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RdsCommand {
    ProgramService(String),
    RadioText(String),
}

impl RdsCommand {
    pub fn program_service(text: &str, fallback: &str) -> Self {
        RdsCommand::ProgramService(sanitize_ps(text, fallback))
    }

    pub fn radio_text(text: &str) -> Self {
        RdsCommand::RadioText(sanitize_rt(text))
    }
}

impl fmt::Display for RdsCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RdsCommand::ProgramService(text) => write!(f, "PS {}", text),
            RdsCommand::RadioText(text) => write!(f, "RT {}", text),
        }
    }
}

/// PS is 8 characters of plain ASCII letters, digits and spaces
pub fn sanitize_ps(text: &str, fallback: &str) -> String {
    let cleaned = ps_filter(text);
    let chosen = if cleaned.is_empty() { ps_filter(fallback) } else { cleaned };
    chosen.chars().take(PS_MAX_CHARS).collect()
}

fn ps_filter(text: &str) -> String {
    let kept: String = text
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
        .collect();
    kept.trim().to_string()
}

/// RT is at most 64 characters on a single line
pub fn sanitize_rt(text: &str) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let trimmed = flat.trim();
    if trimmed.is_empty() {
        return " ".to_string();
    }
    trimmed.chars().take(RT_MAX_CHARS).collect()
}

/// "artist – title" when both are known, the bare title, else the station name
pub fn format_rt(station_name: &str, title: Option<&str>, artist: Option<&str>) -> String {
    let title = title.map(str::trim).filter(|t| !t.is_empty());
    let artist = artist.map(str::trim).filter(|a| !a.is_empty());
    match (artist, title) {
        (Some(artist), Some(title)) => format!("{} \u{2013} {}", artist, title),
        (None, Some(title)) => title.to_string(),
        _ => station_name.to_string(),
    }
}

/// Where RDS commands end up. A trait so tests can record them.
pub trait RdsSink: Send {
    fn send(&mut self, command: &RdsCommand) -> io::Result<()>;
}

/// Writes commands to the named pipe the broadcast stage reads with `-ctl`.
///
/// Opened read-write and non-blocking, so neither a missing reader nor a
/// full pipe can stall the caller. The handle is dropped after any error and
/// reopened on the next send.
pub struct FifoSink {
    path: PathBuf,
    file: Option<File>,
}

impl FifoSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&self.path)?;
            debug!("Opened RDS control channel {}", self.path.display());
            self.file = Some(file);
        }
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "control channel not open")),
        }
    }
}

impl RdsSink for FifoSink {
    fn send(&mut self, command: &RdsCommand) -> io::Result<()> {
        // One write per line. Lines are far below PIPE_BUF, so the FIFO takes
        // the whole line or none of it; a retry never lands after a fragment.
        let line = format!("{}\n", command);
        let result = self.open().and_then(|file| match file.write(line.as_bytes()) {
            Ok(n) if n == line.len() => Ok(()),
            Ok(n) => Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write to RDS control channel ({} of {} bytes)", n, line.len()),
            )),
            Err(e) => Err(e),
        });
        if result.is_err() {
            self.file = None;
        }
        result
    }
}

/// Make sure `path` is a FIFO, replacing a regular file left in its place
pub fn ensure_fifo(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => return Ok(()),
        Ok(_) => {
            info!("Replacing non-FIFO file at {}", path.display());
            fs::remove_file(path)?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated string that outlives the call
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    debug!("Created RDS control FIFO {}", path.display());
    Ok(())
}
