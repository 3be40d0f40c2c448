use std::{
    fs,
    io::{self, BufRead, BufReader, Read, Write},
    os::unix::{
        fs::{FileTypeExt, PermissionsExt},
        net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    agent::{CancelToken, GuestAgent, TickerFactory},
    event::{ChangeEvent, Info},
};

pub const INFO_REQUEST: &str = "GET /v1/info";
pub const EVENTS_REQUEST: &str = "GET /v1/events";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("guest agent already listening on {}", .0.display())]
    AlreadyServing(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid JSON from guest agent: {0}")]
    Json(#[from] serde_json::Error),
    #[error("guest agent error: {0}")]
    Remote(String),
    #[error("guest agent closed the connection")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Info,
    Events,
}

impl Request {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            INFO_REQUEST => Some(Request::Info),
            EVENTS_REQUEST => Some(Request::Events),
            _ => None,
        }
    }

    fn as_line(self) -> &'static str {
        match self {
            Request::Info => INFO_REQUEST,
            Request::Events => EVENTS_REQUEST,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorReply {
    message: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Reply<T> {
    Error(ErrorReply),
    Ok(T),
}

pub struct AgentServer {
    listener: UnixListener,
    path: PathBuf,
    agent: Arc<GuestAgent>,
    tickers: Arc<dyn TickerFactory + Send + Sync>,
}

impl AgentServer {
    /// Binds `path`, replacing a stale socket file. Fails when another agent
    /// still answers on it.
    pub fn bind(
        path: impl Into<PathBuf>,
        agent: Arc<GuestAgent>,
        tickers: impl TickerFactory + Send + Sync + 'static,
    ) -> Result<Self, TransportError> {
        let path = path.into();
        if UnixStream::connect(&path).is_ok() {
            return Err(TransportError::AlreadyServing(path));
        }
        if is_socket_path(&path) {
            tracing::warn!(path = %path.display(), "removing stale agent socket");
            let _ = fs::remove_file(&path);
        }
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&path)?;
        let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o600));
        tracing::info!(path = %path.display(), "guest agent socket bound");
        Ok(Self {
            listener,
            path,
            agent,
            tickers: Arc::new(tickers),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts connections until the listener fails, one thread each.
    pub fn serve(self) -> Result<(), TransportError> {
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::error!(error = %err, "accept failed");
                    return Err(err.into());
                }
            };
            let agent = self.agent.clone();
            let tickers = self.tickers.clone();
            thread::spawn(move || {
                if let Err(err) = handle_connection(stream, &agent, tickers.as_ref()) {
                    tracing::debug!(error = %err, "connection closed");
                }
            });
        }
        Ok(())
    }
}

impl Drop for AgentServer {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn handle_connection(
    stream: UnixStream,
    agent: &Arc<GuestAgent>,
    tickers: &(dyn TickerFactory + Send + Sync),
) -> Result<(), TransportError> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(TransportError::Closed);
    }

    match Request::parse(&line) {
        Some(Request::Info) => {
            tracing::debug!("info requested");
            match agent.info() {
                Ok(info) => write_json_line(&mut writer, &info),
                Err(err) => write_error(&mut writer, err.to_string()),
            }
        }
        Some(Request::Events) => {
            tracing::debug!("event stream requested");
            let cancel = CancelToken::new();
            {
                let cancel = cancel.clone();
                thread::spawn(move || {
                    wait_for_disconnect(reader.into_inner());
                    cancel.cancel();
                });
            }
            for event in agent.events(cancel.clone(), tickers) {
                if let Err(err) = write_json_line(&mut writer, &event) {
                    cancel.cancel();
                    return Err(err);
                }
            }
            Ok(())
        }
        None => {
            tracing::warn!(request = line.trim(), "unknown request");
            write_error(&mut writer, format!("unknown request: {}", line.trim()))
        }
    }
}

fn write_json_line<T: Serialize>(writer: &mut UnixStream, value: &T) -> Result<(), TransportError> {
    let mut payload = serde_json::to_vec(value)?;
    payload.push(b'\n');
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

fn write_error(writer: &mut UnixStream, message: String) -> Result<(), TransportError> {
    write_json_line(writer, &ErrorReply { message })
}

fn wait_for_disconnect(mut stream: UnixStream) {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

fn is_socket_path(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.file_type().is_socket())
        .unwrap_or(false)
}

/// Client for a guest agent socket, usually one forwarded to the host.
#[derive(Debug, Clone)]
pub struct GuestAgentClient {
    socket: PathBuf,
}

impl GuestAgentClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn info(&self) -> Result<Info, TransportError> {
        let mut reader = self.request(Request::Info)?;
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(TransportError::Closed);
        }
        decode(&line)
    }

    pub fn events(&self) -> Result<ClientEvents, TransportError> {
        Ok(ClientEvents {
            reader: self.request(Request::Events)?,
        })
    }

    fn request(&self, request: Request) -> Result<BufReader<UnixStream>, TransportError> {
        let mut stream = UnixStream::connect(&self.socket)?;
        tracing::debug!(socket = %self.socket.display(), request = request.as_line(), "sending request");
        stream.write_all(request.as_line().as_bytes())?;
        stream.write_all(b"\n")?;
        stream.flush()?;
        Ok(BufReader::new(stream))
    }
}

/// Live events from a guest agent. Ends when the agent closes the stream.
pub struct ClientEvents {
    reader: BufReader<UnixStream>,
}

impl Iterator for ClientEvents {
    type Item = Result<ChangeEvent, TransportError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(decode(&line)),
            Err(err) => Some(Err(err.into())),
        }
    }
}

fn decode<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, TransportError> {
    match serde_json::from_str::<Reply<T>>(line.trim_end()) {
        Ok(Reply::Ok(value)) => Ok(value),
        Ok(Reply::Error(reply)) => Err(TransportError::Remote(reply.message)),
        Err(_) => Ok(serde_json::from_str(line.trim_end())?),
    }
}
