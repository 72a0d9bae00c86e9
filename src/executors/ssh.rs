//! SSH transport built on libssh2
//!
//! This module provides the production [`Transport`] with the following features:
//! - Authentication through the SSH agent, then key files
//! - Connect failures classified (DNS, auth, timeout, refused) so the
//!   connection manager knows what to retry
//! - Command execution over exec channels, uploads over SFTP
//!
//! libssh2 is blocking, so every call runs on tokio's blocking pool. Command
//! output is drained without blocking so a dropped caller stops the read, and
//! `close` shuts the socket down so nothing stays parked on it.
//!
//! # Example
//!
//! ```no_run
//! use hostrun::connection::{ConnectionManager, Transport};
//! use hostrun::executors::ssh::SshTransport;
//! use hostrun::models::Host;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let transport = SshTransport::new(Duration::from_secs(10));
//! let manager = ConnectionManager::new(Arc::new(transport));
//!
//! let connection = manager.acquire(&Host::new("doble.me", 22, "lordferatum")).await?;
//! let output = connection.lock().await.exec("uname -a").await?;
//! println!("exit: {}", output.exit_code);
//! # Ok(())
//! # }
//! ```

use crate::connection::{Connection, RawOutput, Transport};
use crate::error::{ConnectFailure, HostrunError, Result};
use crate::models::Host;
use async_trait::async_trait;
use ssh2::{ErrorCode, Session};
use std::fs::File;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// SFTP status codes (draft-ietf-secsh-filexfer-02)
const SFTP_NO_SUCH_FILE: i32 = 2;
const SFTP_PERMISSION_DENIED: i32 = 3;

/// How long `close` waits for a disconnect before giving up
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Pause between reads of an idle exec channel
const POLL_INTERVAL: Duration = Duration::from_millis(10);

const READ_CHUNK: usize = 32 * 1024;

/// SSH transport for remote hosts
#[derive(Debug, Clone)]
pub struct SshTransport {
    connect_timeout: Duration,
    /// Key tried when the host has none of its own
    default_key: Option<PathBuf>,
}

impl SshTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            default_key: None,
        }
    }

    pub fn with_default_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.default_key = Some(key_path.into());
        self
    }

    fn resolve(host: &Host) -> Result<SocketAddr> {
        let mut addrs = (host.address.as_str(), host.port)
            .to_socket_addrs()
            .map_err(|e| {
                HostrunError::connection(
                    host,
                    ConnectFailure::Dns,
                    format!("Failed to resolve: {}", e),
                )
            })?;

        addrs.next().ok_or_else(|| {
            HostrunError::connection(host, ConnectFailure::Dns, "No addresses found")
        })
    }

    /// Candidate private keys, most specific first
    fn key_candidates(&self, host: &Host) -> Vec<PathBuf> {
        let home = std::env::var("HOME").ok().map(PathBuf::from);
        host.key_path
            .iter()
            .chain(self.default_key.iter())
            .cloned()
            .chain(
                home.into_iter()
                    .flat_map(|h| [h.join(".ssh/id_ed25519"), h.join(".ssh/id_rsa")]),
            )
            .collect()
    }

    /// Establish TCP, handshake, and authenticate.
    ///
    /// Also returns a second handle on the socket for shutting it down.
    fn create_session(&self, host: &Host) -> Result<(Session, TcpStream)> {
        let addr = Self::resolve(host)?;
        debug!("Creating SSH session to {} ({})", host, addr);

        let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout).map_err(|e| {
            HostrunError::connection(host, classify_io(&e), format!("Failed to connect: {}", e))
        })?;

        let socket = tcp.try_clone().map_err(|e| {
            HostrunError::connection(
                host,
                ConnectFailure::Network,
                format!("Failed to clone socket: {}", e),
            )
        })?;

        let mut session = Session::new().map_err(|e| {
            HostrunError::connection(
                host,
                ConnectFailure::Network,
                format!("Failed to create SSH session: {}", e),
            )
        })?;

        session.set_tcp_stream(tcp);
        session.set_timeout(self.connect_timeout.as_millis() as u32);
        session.handshake().map_err(|e| {
            HostrunError::connection(
                host,
                classify_ssh(&e),
                format!("SSH handshake failed: {}", e),
            )
        })?;

        let mut authenticated = try_agent(&session, &host.user);

        if !authenticated {
            for key_path in self.key_candidates(host) {
                if !key_path.exists() {
                    continue;
                }
                debug!("Authenticating with key: {}", key_path.display());
                if session
                    .userauth_pubkey_file(&host.user, None, &key_path, None)
                    .is_ok()
                {
                    authenticated = true;
                    break;
                }
            }
        }

        if !authenticated || !session.authenticated() {
            return Err(HostrunError::connection(
                host,
                ConnectFailure::Auth,
                "no agent identity or key file was accepted",
            ));
        }

        // Commands may legitimately run for a long time
        session.set_timeout(0);

        info!("SSH session established to {}", host);
        Ok((session, socket))
    }
}

fn try_agent(session: &Session, user: &str) -> bool {
    let Ok(mut agent) = session.agent() else {
        return false;
    };
    if agent.connect().is_err() || agent.list_identities().is_err() {
        return false;
    }
    let identities = agent.identities().unwrap_or_default();
    identities
        .iter()
        .any(|identity| agent.userauth(user, identity).is_ok())
}

fn classify_io(e: &io::Error) -> ConnectFailure {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ConnectFailure::Timeout,
        io::ErrorKind::ConnectionRefused => ConnectFailure::Refused,
        _ => ConnectFailure::Network,
    }
}

fn classify_ssh(e: &ssh2::Error) -> ConnectFailure {
    // LIBSSH2_ERROR_TIMEOUT
    if matches!(e.code(), ErrorCode::Session(-9)) {
        ConnectFailure::Timeout
    } else {
        ConnectFailure::Network
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self, host: &Host) -> Result<Box<dyn Connection>> {
        let transport = self.clone();
        let target = host.clone();

        let (session, socket) =
            tokio::task::spawn_blocking(move || transport.create_session(&target))
                .await
                .map_err(|e| {
                    HostrunError::connection(
                        host,
                        ConnectFailure::Network,
                        format!("Task join error: {}", e),
                    )
                })??;

        Ok(Box::new(SshConnection {
            session,
            socket,
            host: host.to_string(),
        }))
    }
}

/// One authenticated SSH session
pub struct SshConnection {
    session: Session,
    socket: TcpStream,
    host: String,
}

/// Flags the blocking side once the awaiting future is gone
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Run a blocking closure against a clone of the session
async fn run_blocking<T, F>(session: Session, host: String, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Session, &str) -> Result<T> + Send + 'static,
{
    let label = host.clone();
    tokio::task::spawn_blocking(move || op(&session, &host))
        .await
        .map_err(|e| HostrunError::execution(label, format!("Task join error: {}", e)))?
}

fn exec_blocking(
    session: &Session,
    host: &str,
    command_line: &str,
    cancelled: &AtomicBool,
) -> Result<RawOutput> {
    let ssh_err = |what: &str, e: &dyn std::fmt::Display| {
        HostrunError::execution(host, format!("{}: {}", what, e))
    };

    let mut channel = session
        .channel_session()
        .map_err(|e| ssh_err("Failed to open channel", &e))?;
    channel
        .exec(command_line)
        .map_err(|e| ssh_err("Failed to execute command", &e))?;

    session.set_blocking(false);
    let drained = drain_streams(&mut channel.stream(0), &mut channel.stderr(), cancelled);
    session.set_blocking(true);
    let (stdout, stderr) = drained.map_err(|e| ssh_err("Failed to read output", &e))?;

    channel
        .wait_close()
        .map_err(|e| ssh_err("Failed to close channel", &e))?;
    let exit_code = channel
        .exit_status()
        .map_err(|e| ssh_err("Failed to get exit status", &e))?;

    Ok(RawOutput {
        exit_code,
        stdout,
        stderr,
    })
}

/// Read both streams of a non-blocking channel to EOF.
///
/// The streams are read in turns: libssh2 only reopens the channel window
/// for data that has been read, so a stream left unread while the other is
/// drained stalls the remote side. Returns `Interrupted` once `cancelled`
/// is set.
fn drain_streams<O: Read, E: Read>(
    stdout: &mut O,
    stderr: &mut E,
    cancelled: &AtomicBool,
) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut out_done = false;
    let mut err_done = false;
    let mut buf = vec![0u8; READ_CHUNK];

    while !(out_done && err_done) {
        if cancelled.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "command cancelled"));
        }

        let mut progressed = false;
        if !out_done {
            match read_ready(stdout, &mut buf)? {
                Some(0) => out_done = true,
                Some(n) => {
                    out.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                None => {}
            }
        }
        if !err_done {
            match read_ready(stderr, &mut buf)? {
                Some(0) => err_done = true,
                Some(n) => {
                    err.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                None => {}
            }
        }

        if !progressed && !(out_done && err_done) {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    Ok((out, err))
}

/// One read; `None` when nothing is ready yet
fn read_ready<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<Option<usize>> {
    match reader.read(buf) {
        Ok(n) => Ok(Some(n)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

fn upload_blocking(session: &Session, host: &str, local: &Path, remote: &str) -> Result<u64> {
    let mut file = File::open(local).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => HostrunError::FileNotFound(local.to_path_buf()),
        _ => HostrunError::Io(e),
    })?;

    let sftp = session
        .sftp()
        .map_err(|e| HostrunError::execution(host, format!("Failed to open SFTP: {}", e)))?;

    let mut remote_file = sftp.create(Path::new(remote)).map_err(|e| match e.code() {
        ErrorCode::SFTP(SFTP_PERMISSION_DENIED) => HostrunError::Permission {
            host: host.to_string(),
            path: remote.to_string(),
        },
        _ => HostrunError::execution(host, format!("Failed to create {}: {}", remote, e)),
    })?;

    io::copy(&mut file, &mut remote_file)
        .map_err(|e| HostrunError::execution(host, format!("Failed to write {}: {}", remote, e)))
}

fn is_dir_blocking(session: &Session, host: &str, remote: &str) -> Result<bool> {
    let sftp = session
        .sftp()
        .map_err(|e| HostrunError::execution(host, format!("Failed to open SFTP: {}", e)))?;

    match sftp.stat(Path::new(remote)) {
        Ok(stat) => Ok(stat.is_dir()),
        Err(e) if matches!(e.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE)) => Ok(false),
        Err(e) => Err(HostrunError::execution(
            host,
            format!("Failed to stat {}: {}", remote, e),
        )),
    }
}

#[async_trait]
impl Connection for SshConnection {
    async fn exec(&mut self, command_line: &str) -> Result<RawOutput> {
        let command_line = command_line.to_string();
        let cancelled = Arc::new(AtomicBool::new(false));
        let _guard = CancelOnDrop(Arc::clone(&cancelled));
        run_blocking(self.session.clone(), self.host.clone(), move |session, host| {
            exec_blocking(session, host, &command_line, &cancelled)
        })
        .await
    }

    async fn upload(&mut self, local_path: &Path, remote_path: &str) -> Result<u64> {
        let local = local_path.to_path_buf();
        let remote = remote_path.to_string();
        run_blocking(self.session.clone(), self.host.clone(), move |session, host| {
            upload_blocking(session, host, &local, &remote)
        })
        .await
    }

    async fn is_dir(&mut self, remote_path: &str) -> Result<bool> {
        let remote = remote_path.to_string();
        run_blocking(self.session.clone(), self.host.clone(), move |session, host| {
            is_dir_blocking(session, host, &remote)
        })
        .await
    }

    async fn close(&mut self) -> Result<()> {
        let disconnect = run_blocking(self.session.clone(), self.host.clone(), |session, host| {
            session
                .disconnect(None, "hostrun run complete", None)
                .map_err(|e| HostrunError::execution(host, format!("Failed to disconnect: {}", e)))
        });

        let result = match tokio::time::timeout(CLOSE_GRACE, disconnect).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Disconnect from {} did not finish within {:?}", self.host, CLOSE_GRACE);
                Ok(())
            }
        };

        // Fails any blocking call still holding the session
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            debug!("Socket to {} already closed: {}", self.host, e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[test]
    fn test_classify_io() {
        let e = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(classify_io(&e), ConnectFailure::Timeout);

        let e = io::Error::new(io::ErrorKind::ConnectionRefused, "nope");
        assert_eq!(classify_io(&e), ConnectFailure::Refused);

        let e = io::Error::new(io::ErrorKind::Other, "reset");
        assert_eq!(classify_io(&e), ConnectFailure::Network);
    }

    /// Yields its chunks, then EOF; `WouldBlock` until `ready` is set
    struct Chunked {
        chunks: VecDeque<Vec<u8>>,
        ready: Rc<Cell<bool>>,
        finished: Rc<Cell<bool>>,
    }

    impl Chunked {
        fn new(chunks: &[&[u8]], ready: Rc<Cell<bool>>) -> Self {
            Self {
                chunks: chunks.iter().map(|c| c.to_vec()).collect(),
                ready,
                finished: Rc::new(Cell::new(false)),
            }
        }
    }

    impl Read for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.ready.get() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => {
                    self.finished.set(true);
                    Ok(0)
                }
            }
        }
    }

    #[test]
    fn test_drain_reads_stderr_while_stdout_waits() {
        let big = vec![b'e'; 4096];
        let chunks = [big.as_slice(), big.as_slice(), big.as_slice()];
        let mut stderr = Chunked::new(&chunks, Rc::new(Cell::new(true)));
        // stdout only moves once stderr has been read to the end
        let mut stdout = Chunked::new(&[&b"done\n"[..]], Rc::clone(&stderr.finished));

        let cancelled = AtomicBool::new(false);
        let (out, err) = drain_streams(&mut stdout, &mut stderr, &cancelled).unwrap();
        assert_eq!(out, b"done\n");
        assert_eq!(err.len(), 3 * 4096);
    }

    #[test]
    fn test_drain_interleaved_streams() {
        let ready = Rc::new(Cell::new(true));
        let mut stdout = Chunked::new(&[&b"a"[..], &b"b"[..]], Rc::clone(&ready));
        let mut stderr = Chunked::new(&[&b"x"[..]], ready);

        let cancelled = AtomicBool::new(false);
        let (out, err) = drain_streams(&mut stdout, &mut stderr, &cancelled).unwrap();
        assert_eq!(out, b"ab");
        assert_eq!(err, b"x");
    }

    #[test]
    fn test_drain_stops_when_cancelled() {
        let idle = Rc::new(Cell::new(false));
        let mut stdout = Chunked::new(&[&b"never"[..]], Rc::clone(&idle));
        let mut stderr = Chunked::new(&[], idle);

        let cancelled = AtomicBool::new(true);
        let err = drain_streams(&mut stdout, &mut stderr, &cancelled).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn test_drain_propagates_read_errors() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::ErrorKind::ConnectionReset.into())
            }
        }

        let mut stderr = Chunked::new(&[], Rc::new(Cell::new(true)));
        let cancelled = AtomicBool::new(false);
        let err = drain_streams(&mut Broken, &mut stderr, &cancelled).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn test_cancel_on_drop_sets_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        drop(CancelOnDrop(Arc::clone(&flag)));
        assert!(flag.load(Ordering::Relaxed));
    }

    #[test]
    fn test_key_candidates_order() {
        let transport = SshTransport::new(Duration::from_secs(1)).with_default_key("/keys/default");
        let host = Host::new("web1", 22, "deploy").with_key_path("/keys/web1");

        let keys = transport.key_candidates(&host);
        assert_eq!(keys[0], PathBuf::from("/keys/web1"));
        assert_eq!(keys[1], PathBuf::from("/keys/default"));
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_dns_failure() {
        let transport = SshTransport::new(Duration::from_secs(1));
        let host = Host::new("nonexistent.invalid", 22, "deploy");

        let err = transport.connect(&host).await.err().unwrap();
        assert!(matches!(
            err,
            HostrunError::Connection {
                kind: ConnectFailure::Dns,
                ..
            }
        ));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_refused_port_is_transient() {
        // Bind then drop to find a port with no listener
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let transport = SshTransport::new(Duration::from_secs(1));
        let host = Host::new("127.0.0.1", port, "deploy");

        let err = transport.connect(&host).await.err().unwrap();
        assert!(err.is_transient());
    }
}
