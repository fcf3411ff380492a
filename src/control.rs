//! Control socket
//!
//! A Unix socket the running engine listens on so a supervisor (or the
//! `status` / `stop` subcommands) can query and stop it without scanning
//! the process table. One line per request, one line per reply:
//!
//! | request  | reply                              |
//! |----------|------------------------------------|
//! | `STATUS` | engine state, e.g. `Running`       |
//! | `STOP`   | `OK`, then the engine stops        |
//! | `PING`   | `PONG`                             |
//! | other    | `ERR unknown command`              |

use crate::engine::StatusHandle;
use crate::input_backend::StopSignal;
use anyhow::{Context, Result, bail};
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const SOCKET_NAME: &str = "mousechord.sock";
const CLIENT_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Default socket location: `$XDG_RUNTIME_DIR`, else `/run` for root, else
/// a per-uid file in `/tmp`.
pub fn socket_path() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join(SOCKET_NAME);
    }
    let uid = unsafe { libc::geteuid() };
    if uid == 0 {
        PathBuf::from("/run").join(SOCKET_NAME)
    } else {
        PathBuf::from(format!("/tmp/mousechord-{uid}.sock"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Status,
    Stop,
    Ping,
}

impl ControlCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlCommand::Status => "STATUS",
            ControlCommand::Stop => "STOP",
            ControlCommand::Ping => "PING",
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_uppercase().as_str() {
            "STATUS" => Some(ControlCommand::Status),
            "STOP" => Some(ControlCommand::Stop),
            "PING" => Some(ControlCommand::Ping),
            _ => None,
        }
    }
}

/// Reply to one request line.
pub fn respond(line: &str, status: &StatusHandle, stop: &StopSignal) -> String {
    match ControlCommand::parse(line) {
        Some(ControlCommand::Status) => status.get().as_str().to_string(),
        Some(ControlCommand::Stop) => {
            info!("Stop requested over control socket");
            stop.request();
            "OK".to_string()
        }
        Some(ControlCommand::Ping) => "PONG".to_string(),
        None => "ERR unknown command".to_string(),
    }
}

pub struct ControlServer {
    path: PathBuf,
    running: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl ControlServer {
    /// Bind the socket and start serving on a background thread.
    ///
    /// A leftover socket file nobody answers on is replaced; a live one means
    /// another instance is running and binding fails.
    pub fn bind(path: &Path, status: StatusHandle, stop: Arc<StopSignal>) -> Result<Self> {
        if path.exists() {
            if UnixStream::connect(path).is_ok() {
                bail!("another instance is already listening on {:?}", path);
            }
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket {path:?}"))?;
        }

        let listener =
            UnixListener::bind(path).with_context(|| format!("Failed to bind {path:?}"))?;
        listener.set_nonblocking(true)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict permissions on {path:?}"))?;
        info!("Control socket listening on {:?}", path);

        let running = Arc::new(AtomicBool::new(true));
        let running_accept = running.clone();
        let join = thread::spawn(move || {
            while running_accept.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((client, _)) => {
                        if let Err(e) = handle_client(client, &status, &stop) {
                            debug!("control client error: {e}");
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                    Err(e) => {
                        warn!("control socket accept failed: {e}");
                        thread::sleep(ACCEPT_POLL);
                    }
                }
            }
        });

        Ok(Self {
            path: path.to_path_buf(),
            running,
            join: Some(join),
        })
    }

    /// Stop serving and remove the socket file.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
            if let Err(e) = fs::remove_file(&self.path) {
                debug!("Failed to remove {:?}: {e}", self.path);
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn handle_client(client: UnixStream, status: &StatusHandle, stop: &StopSignal) -> io::Result<()> {
    client.set_nonblocking(false)?;
    client.set_read_timeout(Some(CLIENT_TIMEOUT))?;
    client.set_write_timeout(Some(CLIENT_TIMEOUT))?;

    let mut reader = BufReader::new(client.try_clone()?);
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(());
    }

    let reply = respond(&line, status, stop);
    debug!("control: {:?} -> {}", line.trim(), reply);
    let mut client = client;
    client.write_all(format!("{reply}\n").as_bytes())
}

/// Send one command to a running instance and return its reply.
pub fn send_command(path: &Path, command: ControlCommand) -> Result<String> {
    let mut stream = UnixStream::connect(path)
        .with_context(|| format!("No running instance answers on {path:?}"))?;
    stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
    stream.set_write_timeout(Some(CLIENT_TIMEOUT))?;
    stream
        .write_all(format!("{}\n", command.as_str()).as_bytes())
        .context("Failed to send control command")?;

    let mut reply = String::new();
    BufReader::new(stream)
        .read_line(&mut reply)
        .context("Failed to read control reply")?;
    Ok(reply.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_socket(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("mousechord-test-{}-{tag}.sock", std::process::id()))
    }

    #[test]
    fn test_command_parse() {
        assert_eq!(ControlCommand::parse("STATUS\n"), Some(ControlCommand::Status));
        assert_eq!(ControlCommand::parse(" stop "), Some(ControlCommand::Stop));
        assert_eq!(ControlCommand::parse("PING"), Some(ControlCommand::Ping));
        assert_eq!(ControlCommand::parse("RESTART"), None);
    }

    #[test]
    fn test_respond() {
        let status = StatusHandle::new();
        let stop = StopSignal::new().unwrap();

        assert_eq!(respond("STATUS", &status, &stop), "Stopped");
        assert_eq!(respond("PING", &status, &stop), "PONG");
        assert_eq!(respond("bogus", &status, &stop), "ERR unknown command");
        assert!(!stop.is_requested());
        assert_eq!(respond("STOP", &status, &stop), "OK");
        assert!(stop.is_requested());
    }

    #[test]
    fn test_server_round_trip_and_cleanup() {
        let path = temp_socket("roundtrip");
        let stop = Arc::new(StopSignal::new().unwrap());
        let mut server = ControlServer::bind(&path, StatusHandle::new(), stop.clone()).unwrap();

        assert_eq!(send_command(&path, ControlCommand::Ping).unwrap(), "PONG");
        assert_eq!(send_command(&path, ControlCommand::Status).unwrap(), "Stopped");
        assert_eq!(send_command(&path, ControlCommand::Stop).unwrap(), "OK");
        assert!(stop.is_requested());

        server.shutdown();
        assert!(!path.exists());
    }

    #[test]
    fn test_second_server_on_live_socket_fails() {
        let path = temp_socket("live");
        let stop = Arc::new(StopSignal::new().unwrap());
        let _first = ControlServer::bind(&path, StatusHandle::new(), stop.clone()).unwrap();
        assert!(ControlServer::bind(&path, StatusHandle::new(), stop).is_err());
    }

    #[test]
    fn test_stale_socket_is_replaced() {
        let path = temp_socket("stale");
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let stop = Arc::new(StopSignal::new().unwrap());
        let _server = ControlServer::bind(&path, StatusHandle::new(), stop).unwrap();
        assert_eq!(send_command(&path, ControlCommand::Ping).unwrap(), "PONG");
    }
}
