//! TCP channel adapter: one connection carries one session. Length-prefixed frames in both directions.
//!
//! Each session is owned by the task driving its connection. A reader task turns the socket into
//! channel events; the driver loop feeds those and one-second ticks into the session and executes
//! the returned actions.

use std::io::Cursor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use cardshare_core::wire::{self, LEN_SIZE};
use cardshare_core::{
    Action, Artifact, ClientMeta, DownloadState, DownloaderSession, FileInfo, SessionError,
    UploaderSession,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;

/// Host tick cadence; session timeouts are counted in these.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Frames buffered between the socket reader and the session.
const EVENT_QUEUE: usize = 64;

/// What the socket reader reports.
enum ChannelEvent {
    /// One complete frame, length prefix included.
    Data(Vec<u8>),
    Closed,
    Failed(String),
}

/// The session surface the driver needs. Caller operations that depend on
/// state (answering a challenge, starting the download) go in `poll_caller`.
trait ChannelSession {
    fn on_data(&mut self, bytes: &[u8]) -> Result<Vec<Action>, SessionError>;
    fn on_close(&mut self) -> Vec<Action>;
    fn on_error(&mut self, message: &str) -> Vec<Action>;
    fn tick(&mut self) -> Vec<Action>;
    fn is_finished(&self) -> bool;

    fn poll_caller(&mut self) -> anyhow::Result<Vec<Action>> {
        Ok(Vec::new())
    }
}

fn spawn_reader(mut reader: OwnedReadHalf) -> (mpsc::Receiver<ChannelEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE);
    let handle = tokio::spawn(async move {
        loop {
            let event = match read_frame(&mut reader).await {
                Ok(Some(bytes)) => ChannelEvent::Data(bytes),
                Ok(None) => ChannelEvent::Closed,
                Err(e) => ChannelEvent::Failed(e.to_string()),
            };
            let last = !matches!(event, ChannelEvent::Data(_));
            if tx.send(event).await.is_err() || last {
                break;
            }
        }
    });
    (rx, handle)
}

/// Read one frame. `None` on clean end of stream at a frame boundary.
async fn read_frame(reader: &mut OwnedReadHalf) -> anyhow::Result<Option<Vec<u8>>> {
    let mut header = [0u8; LEN_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = wire::body_len(header)?;
    let mut frame = vec![0u8; LEN_SIZE + len];
    frame[..LEN_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut frame[LEN_SIZE..]).await?;
    Ok(Some(frame))
}

/// Drives one session over one connection until the session finishes.
/// Owns the reader task; the socket is fully released when the driver closes or drops.
struct Driver {
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
    open: bool,
    artifact: Option<Artifact>,
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl Driver {
    /// Execute actions in order. Write failures are fed back to the session as transport errors.
    async fn execute<S: ChannelSession>(&mut self, session: &mut S, actions: Vec<Action>) {
        let mut pending = actions;
        while !pending.is_empty() {
            let mut follow_up = Vec::new();
            for action in pending {
                match action {
                    Action::Send(frame) => {
                        if !self.open {
                            continue;
                        }
                        let result = match wire::encode_frame(&frame) {
                            Ok(bytes) => self.writer.write_all(&bytes).await.map_err(|e| e.to_string()),
                            Err(e) => Err(e.to_string()),
                        };
                        if let Err(message) = result {
                            follow_up.extend(session.on_error(&message));
                        }
                    }
                    Action::Close => {
                        self.reader.abort();
                        if self.open {
                            self.open = false;
                            let _ = self.writer.shutdown().await;
                        }
                    }
                    Action::TransferComplete(artifact) => self.artifact = Some(artifact),
                    Action::Open => warn!("open requested on an established channel"),
                }
            }
            pending = follow_up;
        }
    }
}

async fn run_channel<S: ChannelSession>(
    session: &mut S,
    stream: TcpStream,
    initial: Vec<Action>,
) -> anyhow::Result<Option<Artifact>> {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let (mut events, reader) = spawn_reader(reader);
    let mut driver = Driver {
        writer,
        reader,
        open: true,
        artifact: None,
    };
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.tick().await;

    driver.execute(session, initial).await;
    loop {
        let actions = session.poll_caller()?;
        driver.execute(session, actions).await;
        if session.is_finished() {
            break;
        }
        let actions = tokio::select! {
            event = events.recv() => match event {
                Some(ChannelEvent::Data(bytes)) => match session.on_data(&bytes) {
                    Ok(actions) => actions,
                    Err(e) => session.on_error(&e.to_string()),
                },
                Some(ChannelEvent::Failed(message)) => session.on_error(&message),
                Some(ChannelEvent::Closed) | None => {
                    driver.open = false;
                    session.on_close()
                }
            },
            _ = ticker.tick() => session.tick(),
        };
        driver.execute(session, actions).await;
    }
    if driver.open {
        let _ = driver.writer.shutdown().await;
    }
    Ok(driver.artifact.take())
}

struct ServeSession(UploaderSession<Cursor<Bytes>>);

impl ChannelSession for ServeSession {
    fn on_data(&mut self, bytes: &[u8]) -> Result<Vec<Action>, SessionError> {
        self.0.on_data(bytes)
    }
    fn on_close(&mut self) -> Vec<Action> {
        self.0.on_close()
    }
    fn on_error(&mut self, message: &str) -> Vec<Action> {
        self.0.on_error(message)
    }
    fn tick(&mut self) -> Vec<Action> {
        self.0.tick()
    }
    fn is_finished(&self) -> bool {
        self.0.state().is_terminal()
    }
}

struct FetchSession {
    session: DownloaderSession,
    password: Option<String>,
}

impl ChannelSession for FetchSession {
    fn on_data(&mut self, bytes: &[u8]) -> Result<Vec<Action>, SessionError> {
        self.session.on_data(bytes)
    }
    fn on_close(&mut self) -> Vec<Action> {
        self.session.on_close()
    }
    fn on_error(&mut self, message: &str) -> Vec<Action> {
        self.session.on_error(message)
    }
    fn tick(&mut self) -> Vec<Action> {
        self.session.tick()
    }
    fn is_finished(&self) -> bool {
        self.session.state().is_terminal()
    }

    fn poll_caller(&mut self) -> anyhow::Result<Vec<Action>> {
        match self.session.state() {
            DownloadState::PasswordRequired => {
                let Some(password) = self.password.as_deref() else {
                    bail!("peer requires a password (use --password)");
                };
                match self.session.submit_password(password) {
                    Ok(actions) => Ok(actions),
                    // Already answered; waiting for the verdict.
                    Err(SessionError::NoChallenge) => Ok(Vec::new()),
                    Err(e) => Err(e.into()),
                }
            }
            DownloadState::PasswordError => bail!("password rejected by peer"),
            DownloadState::Ready => Ok(self.session.start_download()?),
            _ => Ok(Vec::new()),
        }
    }
}

/// Best-effort MIME type from the file extension.
pub fn guess_mime(path: &std::path::Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("charx") | Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("json") => "application/json",
        Some("webp") => "image/webp",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Serve one file to every peer that connects, each on its own session.
/// The file is read once up front; sessions stream from the shared buffer.
pub async fn run_serve(
    path: PathBuf,
    mime_type: Option<String>,
    password: Option<String>,
    cfg: NodeConfig,
) -> anyhow::Result<()> {
    let data = Bytes::from(
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?,
    );
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("{} has no usable file name", path.display()))?
        .to_string();
    let info = FileInfo {
        name,
        size: data.len() as u64,
        mime_type: mime_type.unwrap_or_else(|| guess_mime(&path).to_string()),
    };

    let to_hash = data.clone();
    let digest =
        tokio::task::spawn_blocking(move || cardshare_core::integrity::digest_hex(&to_hash))
            .await?;

    let listener = TcpListener::bind(("0.0.0.0", cfg.port)).await?;
    info!(
        port = cfg.port,
        name = %info.name,
        size = info.size,
        mime_type = %info.mime_type,
        sha256 = %digest,
        password = password.is_some(),
        "serving"
    );

    loop {
        let (stream, peer) = listener.accept().await?;
        let data = data.clone();
        let info = info.clone();
        let password = password.clone();
        let session_cfg = cfg.session_config();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, peer, data, info, password, session_cfg).await {
                warn!(%peer, error = %e, "connection ended with error");
            }
        });
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    data: Bytes,
    info: FileInfo,
    password: Option<String>,
    session_cfg: cardshare_core::Config,
) -> anyhow::Result<()> {
    let mut session = ServeSession(UploaderSession::new(
        info,
        Cursor::new(data),
        password,
        session_cfg,
    ));
    info!(%peer, session_id = %session.0.session_id(), "peer connected");
    let initial = session.0.on_open();
    run_channel(&mut session, stream, initial).await?;
    match session.0.error() {
        None => info!(%peer, bytes = session.0.bytes_sent(), "upload finished"),
        Some(e) => warn!(%peer, error = %e, "upload failed"),
    }
    Ok(())
}

/// Open the TCP connection while ticking the session, so its connect timer applies.
async fn connect(session: &mut FetchSession, addr: &str) -> anyhow::Result<Option<TcpStream>> {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.tick().await;
    let attempt = TcpStream::connect(addr.to_string());
    tokio::pin!(attempt);
    loop {
        tokio::select! {
            result = &mut attempt => {
                return match result {
                    Ok(stream) => Ok(Some(stream)),
                    Err(e) => {
                        session.on_error(&e.to_string());
                        Ok(None)
                    }
                };
            }
            _ = ticker.tick() => {
                session.tick();
                if session.is_finished() {
                    return Ok(None);
                }
            }
        }
    }
}

/// Fetch the file served at `addr`. Connection failures are retried up to `retries` times via
/// `reconnect`; a rejected or missing password is not.
pub async fn run_fetch(
    addr: String,
    password: Option<String>,
    out: Option<PathBuf>,
    retries: u32,
    cfg: NodeConfig,
) -> anyhow::Result<PathBuf> {
    let client_meta = ClientMeta {
        browser_name: format!("cardshare-node/{}", env!("CARGO_PKG_VERSION")),
        os_name: std::env::consts::OS.to_string(),
    };
    let mut fetch = FetchSession {
        session: DownloaderSession::new(cfg.session_config(), client_meta),
        password,
    };
    fetch.session.connect();

    let mut attempt = 0u32;
    let artifact = loop {
        let artifact = match connect(&mut fetch, &addr).await? {
            Some(stream) => {
                let initial = fetch.session.on_open();
                run_channel(&mut fetch, stream, initial).await?
            }
            None => None,
        };
        if let Some(artifact) = artifact {
            break artifact;
        }
        let reason = fetch.session.error().unwrap_or("unknown error").to_string();
        if attempt >= retries {
            bail!("download failed: {reason}");
        }
        attempt += 1;
        warn!(%addr, attempt, error = %reason, "retrying");
        fetch.session.reconnect();
    };

    let target = match out {
        Some(p) => p,
        None => PathBuf::from(safe_file_name(&artifact.info.name)),
    };
    tokio::fs::write(&target, &artifact.bytes)
        .await
        .with_context(|| format!("cannot write {}", target.display()))?;
    info!(
        path = %target.display(),
        bytes = artifact.bytes.len(),
        mime_type = %artifact.mime_type(),
        sha256 = %artifact.sha256_hex(),
        "saved"
    );
    debug!(session_id = %fetch.session.session_id(), "fetch session finished");
    Ok(target)
}

/// Last path component of a peer-supplied name, so it cannot escape the working directory.
fn safe_file_name(name: &str) -> String {
    std::path::Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "..")
        .unwrap_or("download.bin")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardshare_core::{ControlMessage, Frame};
    use std::path::Path;

    #[test]
    fn mime_from_extension() {
        assert_eq!(guess_mime(Path::new("a/char.CHARX")), "application/zip");
        assert_eq!(guess_mime(Path::new("card.png")), "image/png");
        assert_eq!(guess_mime(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn peer_names_are_confined() {
        assert_eq!(safe_file_name("../../etc/passwd"), "passwd");
        assert_eq!(safe_file_name("char.charx"), "char.charx");
        assert_eq!(safe_file_name(".."), "download.bin");
        assert_eq!(safe_file_name(""), "download.bin");
    }

    fn payload(len: u32) -> Bytes {
        (0..len).map(|i| (i % 253) as u8).collect::<Vec<u8>>().into()
    }

    fn char_info(size: usize) -> FileInfo {
        FileInfo {
            name: "char.charx".into(),
            size: size as u64,
            mime_type: "application/zip".into(),
        }
    }

    fn small_window() -> NodeConfig {
        NodeConfig {
            chunk_size: 4096,
            max_in_flight: 16384,
            ..NodeConfig::default()
        }
    }

    /// Accept one connection and serve `data` on it, handing the listener back afterwards.
    fn serve_once(
        listener: TcpListener,
        data: Bytes,
        password: Option<&str>,
        cfg: &NodeConfig,
    ) -> JoinHandle<(TcpListener, anyhow::Result<()>)> {
        let password = password.map(str::to_string);
        let session_cfg = cfg.session_config();
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let info = char_info(data.len());
            let res = serve_connection(stream, peer, data, info, password, session_cfg).await;
            (listener, res)
        })
    }

    #[tokio::test]
    async fn serve_and_fetch_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload(70_000);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cfg = small_window();
        let server = serve_once(listener, data.clone(), Some("pw"), &cfg);

        let out = dir.path().join("out.charx");
        let saved = run_fetch(addr.to_string(), Some("pw".into()), Some(out.clone()), 0, cfg)
            .await
            .unwrap();
        assert_eq!(saved, out);
        assert_eq!(std::fs::read(&out).unwrap(), data.as_ref());
        let (_listener, res) = server.await.unwrap();
        res.unwrap();
    }

    #[tokio::test]
    async fn stalled_upload_releases_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        for msg in [
            ControlMessage::RequestInfo {
                protocol_version: cardshare_core::PROTOCOL_VERSION,
                client_meta: ClientMeta::default(),
            },
            ControlMessage::Start { offset: 0 },
        ] {
            let bytes = cardshare_core::encode_frame(&Frame::Control(msg)).unwrap();
            client.write_all(&bytes).await.unwrap();
        }

        // The client never acks and never closes.
        let cfg = cardshare_core::Config {
            stall_timeout_ticks: 1,
            chunk_size: 4096,
            max_in_flight: 4096,
            ..cardshare_core::Config::default()
        };
        let data = payload(70_000);
        let info = char_info(data.len());
        serve_connection(stream, peer, data, info, None, cfg)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            tokio::runtime::Handle::current().metrics().num_alive_tasks(),
            0,
            "socket reader outlived its session"
        );
        drop(client);
    }

    #[tokio::test]
    async fn fetch_retries_after_dropped_connection() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload(10_000);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cfg = small_window();
        let server_data = data.clone();
        let server_cfg = cfg.clone();
        let server = tokio::spawn(async move {
            // First peer is hung up on straight away.
            let (first, _) = listener.accept().await.unwrap();
            drop(first);
            serve_once(listener, server_data, None, &server_cfg)
                .await
                .unwrap()
        });

        let out = dir.path().join("retry.charx");
        run_fetch(addr.to_string(), None, Some(out.clone()), 1, cfg)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), data.as_ref());
        let (_listener, res) = server.await.unwrap();
        res.unwrap();
    }

    #[tokio::test]
    async fn fetch_without_retries_reports_dropped_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (first, _) = listener.accept().await.unwrap();
            drop(first);
            listener
        });
        let err = run_fetch(addr.to_string(), None, None, 0, small_window())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("download failed"), "{err}");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_password_is_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cfg = small_window();
        let server = serve_once(listener, payload(100), Some("pw"), &cfg);

        let err = run_fetch(addr.to_string(), Some("nope".into()), None, 3, cfg)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("password rejected"), "{err}");

        let (listener, _res) = server.await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
        assert!(second.is_err(), "fetch reconnected after a password rejection");
    }

    #[tokio::test]
    async fn missing_password_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cfg = small_window();
        let server = serve_once(listener, payload(100), Some("pw"), &cfg);

        let err = run_fetch(addr.to_string(), None, None, 3, cfg)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("requires a password"), "{err}");
        let _ = server.await.unwrap();
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        // Bound but never accepted: the handshake completes, nothing is ever answered.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cfg = NodeConfig {
            connect_timeout_secs: 1,
            ..NodeConfig::default()
        };
        let err = run_fetch(addr.to_string(), None, None, 0, cfg)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("download failed: {}", cardshare_core::downloader::CONNECT_TIMEOUT_MESSAGE)
        );
        drop(listener);
    }

    #[tokio::test]
    async fn refused_dial_fails_the_session() {
        let mut fetch = FetchSession {
            session: DownloaderSession::new(
                cardshare_core::Config {
                    connect_timeout_ticks: 1,
                    ..cardshare_core::Config::default()
                },
                ClientMeta::default(),
            ),
            password: None,
        };
        fetch.session.connect();
        // Nothing listens on a port we just released.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let stream = connect(&mut fetch, &format!("127.0.0.1:{port}")).await.unwrap();
        assert!(stream.is_none());
        assert_eq!(fetch.session.state(), DownloadState::Error);
        assert!(fetch.session.error().is_some());
    }
}
