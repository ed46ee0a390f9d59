//! Dual-socket delivery server
//!
//! Two listeners: the monitor channel streams length-prefixed encoded frames
//! to the client, the command channel receives short text commands. At most
//! one client is served at a time; a session becomes live only once both
//! sockets have a peer and the first command-channel message matches the
//! single-use token file.
//!
//! A send failure on the monitor channel is the one recoverable error: the
//! session drains and the server goes back to accepting while the pipeline
//! keeps running. Everything else (accept failure, bad authorization,
//! shutdown) ends the session loop.

pub mod command;
pub mod mailbox;

pub use command::{dispatch, CommandSink, Param, MAX_COMMAND_LEN};
pub use mailbox::{FrameMailbox, FrameSink};

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{AppError, Result};
use crate::utils::Shutdown;

/// Mailbox poll interval of the monitor sender.
const MONITOR_POLL: Duration = Duration::from_millis(5);

/// Per-session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepting,
    Unauthorized,
    Authorized,
    Draining,
}

pub struct DeliveryServer {
    monitor_listener: TcpListener,
    command_listener: TcpListener,
    token_path: PathBuf,
    mailbox: Arc<FrameMailbox>,
    commands: Arc<dyn CommandSink>,
    shutdown: Shutdown,
}

impl DeliveryServer {
    /// Bind both listeners. Fails with `ListenFail` if either port is taken.
    pub async fn bind(
        config: &ServerConfig,
        mailbox: Arc<FrameMailbox>,
        commands: Arc<dyn CommandSink>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let monitor_listener =
            TcpListener::bind((config.bind_address.as_str(), config.monitor_port))
                .await
                .map_err(|e| {
                    AppError::ListenFail(format!("monitor port {}: {}", config.monitor_port, e))
                })?;
        info!(
            "monitor socket listening on {}",
            monitor_listener.local_addr()?
        );

        let command_listener =
            TcpListener::bind((config.bind_address.as_str(), config.command_port))
                .await
                .map_err(|e| {
                    AppError::ListenFail(format!("command port {}: {}", config.command_port, e))
                })?;
        info!(
            "command socket listening on {}",
            command_listener.local_addr()?
        );

        Ok(Self {
            monitor_listener,
            command_listener,
            token_path: config.token_path.clone(),
            mailbox,
            commands,
            shutdown,
        })
    }

    /// Actual monitor listener address (useful when bound to port 0).
    pub fn monitor_addr(&self) -> Result<SocketAddr> {
        Ok(self.monitor_listener.local_addr()?)
    }

    /// Actual command listener address.
    pub fn command_addr(&self) -> Result<SocketAddr> {
        Ok(self.command_listener.local_addr()?)
    }

    /// Session loop: accept, authorize, serve, drain, repeat. Returns `Ok`
    /// on shutdown; fatal errors propagate to the caller.
    pub async fn run(self) -> Result<()> {
        loop {
            if self.shutdown.is_triggered() {
                return Ok(());
            }

            debug!(state = ?ConnectionState::Accepting, "waiting for connection");

            let (monitor, command) = tokio::select! {
                _ = self.shutdown.wait() => return Ok(()),
                pair = accept_pair(&self.monitor_listener, &self.command_listener) => pair?,
            };

            self.run_session(monitor, command).await?;

            if self.shutdown.is_triggered() {
                return Ok(());
            }
        }
    }

    async fn run_session(&self, monitor: TcpStream, mut command: TcpStream) -> Result<()> {
        let mut state = ConnectionState::Unauthorized;
        info!(?state, "accepted new connection");

        // Authorization gate: the first command-channel message must match
        // the token file.
        tokio::select! {
            _ = self.shutdown.wait() => return Ok(()),
            res = authorize(&mut command, &self.token_path) => res?,
        }

        state = ConnectionState::Authorized;
        info!(?state, "client authorized");
        self.mailbox.set_monitoring(true);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut sender = tokio::spawn(monitor_sender(
            monitor,
            self.mailbox.clone(),
            stop_rx,
        ));

        let mut send_result = None;
        tokio::select! {
            _ = self.shutdown.wait() => {}
            _ = command_reader(&mut command, self.commands.as_ref()) => {
                debug!("command channel closed by peer");
            }
            res = &mut sender => {
                send_result = Some(res);
            }
        }

        state = ConnectionState::Draining;
        info!(?state, "releasing connection");
        self.mailbox.set_monitoring(false);
        let _ = stop_tx.send(true);

        // Unblock and join the sender; the command reader future was either
        // finished or dropped by the select above.
        let send_result = match send_result {
            Some(res) => res,
            None => sender.await,
        };
        let _ = command.shutdown().await;

        match send_result {
            Ok(Ok(())) => {}
            Ok(Err(AppError::SendFail(reason))) => {
                // Recoverable: the client went away mid-stream.
                warn!("remote client disconnected: {}", reason);
            }
            Ok(Err(e)) => return Err(e),
            Err(e) => {
                return Err(AppError::ReleaseFail(format!(
                    "monitor sender did not exit cleanly: {}",
                    e
                )))
            }
        }

        Ok(())
    }
}

/// Accept on both listeners in parallel; connected only when both have a
/// peer. An error on either side closes whichever socket was accepted.
async fn accept_pair(
    monitor: &TcpListener,
    command: &TcpListener,
) -> Result<(TcpStream, TcpStream)> {
    let (mon, cmd) = tokio::try_join!(monitor.accept(), command.accept())
        .map_err(|e| AppError::AcceptFail(e.to_string()))?;
    debug!("monitor peer {}, command peer {}", mon.1, cmd.1);
    Ok((mon.0, cmd.0))
}

/// Read the single-use token file, delete it, and compare it against the
/// first message on the command channel. Trailing whitespace is trimmed on
/// both sides before the byte-for-byte compare.
async fn authorize<R: AsyncRead + Unpin>(command: &mut R, token_path: &Path) -> Result<()> {
    let token = match tokio::fs::read(token_path).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!("token file {} unreadable: {}", token_path.display(), e);
            return Err(AppError::BadAuth);
        }
    };
    // Single use: remove before the comparison so a failed attempt also
    // consumes the secret.
    if let Err(e) = tokio::fs::remove_file(token_path).await {
        warn!("failed to remove token file: {}", e);
    }

    let mut buf = [0u8; MAX_COMMAND_LEN];
    let n = match command.read(&mut buf).await {
        Ok(0) | Err(_) => {
            warn!("client closed command channel before authorizing");
            return Err(AppError::BadAuth);
        }
        Ok(n) => n,
    };

    let expected = trim_trailing_whitespace(&token);
    let presented = trim_trailing_whitespace(&buf[..n]);
    if presented == expected {
        Ok(())
    } else {
        warn!("authorization token mismatch");
        Err(AppError::BadAuth)
    }
}

fn trim_trailing_whitespace(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|p| p + 1)
        .unwrap_or(0);
    &bytes[..end]
}

/// Read commands until the peer disconnects. One command per recv, at most
/// `MAX_COMMAND_LEN` bytes, matched exactly.
async fn command_reader<R: AsyncRead + Unpin>(command: &mut R, sink: &dyn CommandSink) {
    let mut buf = [0u8; MAX_COMMAND_LEN];
    loop {
        let n = match command.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let text = String::from_utf8_lossy(&buf[..n]);
        if !dispatch(sink, &text) {
            debug!("ignoring unknown command {:?}", text);
        }
    }
}

/// Forward mailbox frames to the monitor socket: `u32_le length` followed by
/// the payload. Polls the mailbox every 5 ms; a short or failed write ends
/// the session with `SendFail`.
async fn monitor_sender<W: AsyncWrite + Unpin>(
    mut monitor: W,
    mailbox: Arc<FrameMailbox>,
    stop: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::time::sleep(MONITOR_POLL).await;
        if *stop.borrow() {
            return Ok(());
        }

        let Some(frame) = mailbox.take() else {
            continue;
        };

        monitor
            .write_all(&(frame.len() as u32).to_le_bytes())
            .await
            .map_err(|e| AppError::SendFail(e.to_string()))?;
        monitor
            .write_all(&frame)
            .await
            .map_err(|e| AppError::SendFail(e.to_string()))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::command::tests::RecordingSink;
    use bytes::Bytes;
    use std::io::Write;
    use tokio::io::duplex;
    use tokio::net::TcpStream;
    use tokio::time::{sleep, timeout};

    fn write_token(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn trailing_whitespace_trim() {
        assert_eq!(trim_trailing_whitespace(b"secret\n"), b"secret");
        assert_eq!(trim_trailing_whitespace(b"secret \r\n"), b"secret");
        assert_eq!(trim_trailing_whitespace(b"  secret"), b"  secret");
        assert_eq!(trim_trailing_whitespace(b" \n"), b"");
    }

    #[tokio::test]
    async fn authorize_accepts_matching_token_and_consumes_file() {
        let token = write_token(b"correct\n");
        let path = token.path().to_path_buf();

        let (mut client, mut server) = duplex(256);
        client.write_all(b"correct").await.unwrap();

        authorize(&mut server, &path).await.unwrap();
        assert!(!path.exists(), "token file must be deleted after read");
    }

    #[tokio::test]
    async fn authorize_rejects_wrong_token() {
        let token = write_token(b"correct\n");
        let path = token.path().to_path_buf();

        let (mut client, mut server) = duplex(256);
        client.write_all(b"wrong").await.unwrap();

        match authorize(&mut server, &path).await {
            Err(AppError::BadAuth) => {}
            other => panic!("expected BadAuth, got {:?}", other),
        }
        assert!(!path.exists(), "even a failed attempt consumes the token");
    }

    #[tokio::test]
    async fn authorize_rejects_missing_token_file() {
        let (mut client, mut server) = duplex(256);
        client.write_all(b"anything").await.unwrap();

        let missing = std::env::temp_dir().join("pi-sentry-no-such-token");
        match authorize(&mut server, &missing).await {
            Err(AppError::BadAuth) => {}
            other => panic!("expected BadAuth, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn authorize_rejects_empty_first_message() {
        let token = write_token(b"correct");
        let path = token.path().to_path_buf();

        let (client, mut server) = duplex(256);
        drop(client);

        match authorize(&mut server, &path).await {
            Err(AppError::BadAuth) => {}
            other => panic!("expected BadAuth, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn command_reader_dispatches_in_receive_order() {
        let sink = RecordingSink::default();
        let (mut client, mut server) = duplex(256);

        let calls = sink.calls.clone();
        let reader = tokio::spawn(async move {
            command_reader(&mut server, &sink).await;
            sink.taken()
        });

        for cmd in ["mode", "page", "status"] {
            client.write_all(cmd.as_bytes()).await.unwrap();
            // Wait until the command lands so consecutive writes are not
            // coalesced into a single recv.
            timeout(Duration::from_secs(1), async {
                loop {
                    if calls.lock().len() >= 1 && calls.lock().last().map(String::as_str) == Some(cmd) {
                        break;
                    }
                    sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .unwrap();
        }
        drop(client);

        let taken = reader.await.unwrap();
        assert_eq!(taken, vec!["mode", "page", "status"]);
    }

    #[tokio::test]
    async fn coalesced_commands_are_not_split() {
        let sink = RecordingSink::default();
        let (mut client, mut server) = duplex(256);

        client.write_all(b"modepage").await.unwrap();
        drop(client);
        command_reader(&mut server, &sink).await;

        assert!(sink.taken().is_empty());
    }

    #[tokio::test]
    async fn monitor_sender_frames_with_le_length_prefix() {
        let mailbox = Arc::new(FrameMailbox::new());
        mailbox.set_monitoring(true);
        let (mut client, server) = duplex(1024);
        let (stop_tx, stop_rx) = watch::channel(false);

        let sender = tokio::spawn(monitor_sender(server, mailbox.clone(), stop_rx));

        assert!(mailbox.send_frame(Bytes::from_static(b"payload")));

        let mut len_buf = [0u8; 4];
        client.read_exact(&mut len_buf).await.unwrap();
        assert_eq!(u32::from_le_bytes(len_buf), 7);
        let mut payload = [0u8; 7];
        client.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"payload");

        stop_tx.send(true).unwrap();
        sender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn monitor_sender_reports_send_failure() {
        let mailbox = Arc::new(FrameMailbox::new());
        mailbox.set_monitoring(true);
        let (client, server) = duplex(16);
        drop(client);
        let (_stop_tx, stop_rx) = watch::channel(false);

        mailbox.send_frame(Bytes::from_static(b"payload"));
        match monitor_sender(server, mailbox, stop_rx).await {
            Err(AppError::SendFail(_)) => {}
            other => panic!("expected SendFail, got {:?}", other),
        }
    }

    async fn bind_test_server(
        token_path: &Path,
        sink: Arc<dyn CommandSink>,
        mailbox: Arc<FrameMailbox>,
        shutdown: Shutdown,
    ) -> DeliveryServer {
        let config = ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            monitor_port: 0,
            command_port: 0,
            token_path: token_path.to_path_buf(),
        };
        DeliveryServer::bind(&config, mailbox, sink, shutdown)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn full_session_streams_frames_and_commands() {
        let token = write_token(b"sesame\n");
        let mailbox = Arc::new(FrameMailbox::new());
        let sink = Arc::new(RecordingSink::default());
        let calls = sink.calls.clone();
        let shutdown = Shutdown::new();

        let server = bind_test_server(
            token.path(),
            sink.clone(),
            mailbox.clone(),
            shutdown.clone(),
        )
        .await;
        let mon_addr = server.monitor_addr().unwrap();
        let cmd_addr = server.command_addr().unwrap();

        let server_task = tokio::spawn(server.run());

        let mut mon = TcpStream::connect(mon_addr).await.unwrap();
        let mut cmd = TcpStream::connect(cmd_addr).await.unwrap();

        // Authorize.
        cmd.write_all(b"sesame").await.unwrap();
        timeout(Duration::from_secs(2), async {
            while !mailbox.ready() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session never became authorized");

        // A frame submitted by the pipeline side arrives length-prefixed.
        assert!(mailbox.send_frame(Bytes::from_static(b"frame-1")));
        let mut len_buf = [0u8; 4];
        mon.read_exact(&mut len_buf).await.unwrap();
        assert_eq!(u32::from_le_bytes(len_buf), 7);
        let mut payload = [0u8; 7];
        mon.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"frame-1");

        // Commands flow to the sink.
        cmd.write_all(b"mode").await.unwrap();
        timeout(Duration::from_secs(2), async {
            while calls.lock().is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("command never dispatched");

        // Client disconnect drains the session; shutdown ends the loop.
        drop(cmd);
        drop(mon);
        timeout(Duration::from_secs(2), async {
            while mailbox.ready() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session never drained");

        shutdown.trigger();
        timeout(Duration::from_secs(2), server_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn bad_token_ends_server_with_bad_auth() {
        let token = write_token(b"correct\n");
        let mailbox = Arc::new(FrameMailbox::new());
        let sink = Arc::new(RecordingSink::default());
        let shutdown = Shutdown::new();

        let server =
            bind_test_server(token.path(), sink, mailbox.clone(), shutdown.clone()).await;
        let mon_addr = server.monitor_addr().unwrap();
        let cmd_addr = server.command_addr().unwrap();
        let server_task = tokio::spawn(server.run());

        let _mon = TcpStream::connect(mon_addr).await.unwrap();
        let mut cmd = TcpStream::connect(cmd_addr).await.unwrap();
        cmd.write_all(b"wrong").await.unwrap();

        let result = timeout(Duration::from_secs(2), server_task)
            .await
            .unwrap()
            .unwrap();
        match result {
            Err(AppError::BadAuth) => {}
            other => panic!("expected BadAuth, got {:?}", other.map(|_| ())),
        }
        assert!(!mailbox.ready());
        assert!(!token.path().exists());
    }

    #[tokio::test]
    async fn listen_failure_on_taken_port() {
        let holder = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let taken = holder.local_addr().unwrap().port();

        let config = ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            monitor_port: taken,
            command_port: 0,
            token_path: PathBuf::from("/tmp/irrelevant"),
        };
        let result = DeliveryServer::bind(
            &config,
            Arc::new(FrameMailbox::new()),
            Arc::new(RecordingSink::default()),
            Shutdown::new(),
        )
        .await;
        match result {
            Err(AppError::ListenFail(_)) => {}
            other => panic!("expected ListenFail, got {:?}", other.err()),
        }
    }
}
