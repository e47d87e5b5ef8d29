//! The production transport: spawns the engine binary, hands it a fresh
//! pipe name on the command line, and frames JSON messages over the
//! resulting stream with a u32 length prefix.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{EngineConnector, EngineLink, LinkEvent, TransportError};
use crate::settings::EngineSettings;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

/// Spawns and connects real engine processes.
#[derive(Debug, Default)]
pub struct PipeConnector;

impl PipeConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EngineConnector for PipeConnector {
    async fn connect(&self, settings: &EngineSettings) -> Result<EngineLink, TransportError> {
        connect_platform(settings).await
    }
}

#[cfg(unix)]
async fn connect_platform(settings: &EngineSettings) -> Result<EngineLink, TransportError> {
    use tokio::net::UnixListener;

    let socket_path = std::env::temp_dir().join(format!("heatline-{}.sock", Uuid::new_v4()));
    let listener = UnixListener::bind(&socket_path).map_err(to_setup_error)?;
    let _cleanup = SocketCleanup(socket_path.clone());

    let (child, io_tasks) = spawn_engine(settings, &socket_path.to_string_lossy())?;

    let accepted = tokio::time::timeout(CONNECT_TIMEOUT, listener.accept())
        .await
        .map_err(|_| TransportError::ConnectTimeout(CONNECT_TIMEOUT))?;
    let (stream, _) = accepted.map_err(to_setup_error)?;

    Ok(spawn_link_io(stream, Some(child), io_tasks))
}

#[cfg(windows)]
async fn connect_platform(settings: &EngineSettings) -> Result<EngineLink, TransportError> {
    use tokio::net::windows::named_pipe::ServerOptions;

    let pipe_name = format!(r"\\.\pipe\heatline-{}", Uuid::new_v4());
    let server = ServerOptions::new()
        .first_pipe_instance(true)
        .create(&pipe_name)
        .map_err(to_setup_error)?;

    let (child, io_tasks) = spawn_engine(settings, &pipe_name)?;

    tokio::time::timeout(CONNECT_TIMEOUT, server.connect())
        .await
        .map_err(|_| TransportError::ConnectTimeout(CONNECT_TIMEOUT))?
        .map_err(to_setup_error)?;

    Ok(spawn_link_io(server, Some(child), io_tasks))
}

#[cfg(unix)]
struct SocketCleanup(PathBuf);

#[cfg(unix)]
impl Drop for SocketCleanup {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.0) {
            if err.kind() != ErrorKind::NotFound {
                warn!(
                    target: "heatline::transport",
                    path = %self.0.display(),
                    error = %err,
                    "failed to clean engine socket"
                );
            }
        }
    }
}

fn spawn_engine(
    settings: &EngineSettings,
    pipe: &str,
) -> Result<(Child, Vec<JoinHandle<()>>), TransportError> {
    let executable: PathBuf = settings.engine_executable();
    let mut command = Command::new(&executable);
    command
        .arg("--pipe")
        .arg(pipe)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if settings.debug {
        command.arg("--debug");
    }
    if let Some(dir) = &settings.working_dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|source| TransportError::Spawn {
        executable: executable.display().to_string(),
        source,
    })?;

    let mut tasks = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        tasks.push(forward_engine_output(stdout, "stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        tasks.push(forward_engine_output(stderr, "stderr"));
    }
    debug!(
        target: "heatline::transport",
        executable = %executable.display(),
        pipe = %pipe,
        "engine spawned"
    );
    Ok((child, tasks))
}

/// Mirrors the engine's own output into the operator-visible log.
fn forward_engine_output<R>(stream: R, stream_name: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "heatline::engine", stream = stream_name, "{line}");
        }
    })
}

fn spawn_link_io<S>(stream: S, child: Option<Child>, mut extra_tasks: Vec<JoinHandle<()>>) -> EngineLink
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<LinkEvent>();
    let (mut reader, mut writer) = tokio::io::split(stream);

    let read_events = event_tx.clone();
    let read_task = tokio::spawn(async move {
        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(err) => {
                    if err.kind() != ErrorKind::UnexpectedEof {
                        let _ = read_events.send(LinkEvent::Error(err.to_string()));
                    }
                    break;
                }
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            if len > MAX_FRAME_BYTES {
                let _ = read_events.send(LinkEvent::Error(format!(
                    "oversized frame from engine ({len} bytes)"
                )));
                break;
            }
            let mut buf = vec![0u8; len];
            if let Err(err) = reader.read_exact(&mut buf).await {
                let _ = read_events.send(LinkEvent::Error(err.to_string()));
                break;
            }
            match String::from_utf8(buf) {
                Ok(frame) => {
                    if inbound_tx.send(frame).is_err() {
                        break;
                    }
                }
                Err(_) => {
                    let _ = read_events.send(LinkEvent::Error("non-utf8 frame from engine".into()));
                }
            }
        }
        let _ = read_events.send(LinkEvent::Closed);
    });

    let write_events = event_tx;
    let write_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let bytes = frame.as_bytes();
            let len = bytes.len() as u32;
            let write = async {
                writer.write_all(&len.to_be_bytes()).await?;
                writer.write_all(bytes).await?;
                writer.flush().await
            };
            if let Err(err) = write.await {
                let _ = write_events.send(LinkEvent::Error(err.to_string()));
                break;
            }
        }
    });

    let mut tasks = vec![read_task, write_task];
    tasks.append(&mut extra_tasks);
    EngineLink::from_parts(outbound_tx, inbound_rx, event_rx, child, tasks)
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}
