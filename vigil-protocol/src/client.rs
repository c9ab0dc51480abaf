use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream, ToSocketAddrs,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tracing::debug;

use crate::{
    errors::ClientError,
    protocol::{ClientMessage, Response, decode_response, encode_message},
};

pub type Result<T> = std::result::Result<T, ClientError>;

/// Sequential client for the agent protocol.
///
/// The agent answers the lines of one connection strictly in order, so each
/// request simply waits for the next response line. Request ids are
/// generated from a per-connection counter.
pub struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl Client {
    /// Connect to an agent
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Connect)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read_half).lines(),
            writer: write_half,
            next_id: 1,
        })
    }

    fn next_id(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        id.to_string()
    }

    /// Write one message without waiting for the response
    pub async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let bytes = encode_message(message)?;
        let command = message
            .cmd
            .clone()
            .or_else(|| message.kind.clone())
            .unwrap_or_default();
        self.writer
            .write_all(&bytes)
            .await
            .map_err(|source| ClientError::Send { command, source })
    }

    /// Read the next response line, skipping blank lines
    pub async fn recv(&mut self) -> Result<Response> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(ClientError::Receive)?
                .ok_or(ClientError::Disconnected)?;
            if line.trim().is_empty() {
                continue;
            }
            debug!("Received response line: {}", line);
            return Ok(decode_response(line.as_bytes())?);
        }
    }

    /// Authenticate the connection with a token
    pub async fn authenticate(&mut self, token: &str) -> Result<Response> {
        let id = self.next_id();
        self.send(&ClientMessage::auth(id, token)).await?;
        self.recv().await
    }

    /// Send a command and wait for its response
    pub async fn request(&mut self, cmd: &str, args: Option<Value>) -> Result<Response> {
        let id = self.next_id();
        self.send(&ClientMessage::command(id, cmd, args)).await?;
        self.recv().await
    }

    pub async fn help(&mut self) -> Result<Response> {
        self.request("help", None).await
    }

    /// Metric samples from the last `seconds` seconds
    pub async fn get_os_info(&mut self, seconds: Option<u64>) -> Result<Response> {
        let args = seconds.map(|time| json!({ "time": time }));
        self.request("getosinfo", args).await
    }

    /// Start watching a directory for `seconds` seconds
    pub async fn watch(&mut self, path: &str, seconds: Option<u64>) -> Result<Response> {
        let mut args = json!({ "path": path });
        if let Some(time) = seconds {
            args["time"] = json!(time);
        }
        self.request("watch", Some(args)).await
    }

    /// Events recorded for one watch
    pub async fn get_watch_events(&mut self, watch_id: &str) -> Result<Response> {
        self.request("getwatches", Some(json!({ "watchId": watch_id }))).await
    }

    /// Full durable record of one watch, including its expiry state
    pub async fn get_watch_record(&mut self, watch_id: &str) -> Result<Response> {
        self.request("getwatches", Some(json!({ "watchId": watch_id, "record": true })))
            .await
    }

    /// Every watch id known to the agent
    pub async fn list_watches(&mut self) -> Result<Response> {
        self.request("getwatches", Some(json!({ "all": true }))).await
    }

    pub async fn ps(&mut self) -> Result<Response> {
        self.request("ps", None).await
    }

    /// Run a whitelisted command on the agent host
    pub async fn os_cmd(&mut self, cmd: &str, args: &[&str]) -> Result<Response> {
        self.request("oscmd", Some(json!({ "cmd": cmd, "args": args })))
            .await
    }

    /// Ask the agent to close the connection after acknowledging
    pub async fn quit(&mut self) -> Result<Response> {
        self.request("quit", None).await
    }

    /// Half-close the write side of the connection
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await.map_err(|source| ClientError::Send {
            command: "shutdown".to_string(),
            source,
        })
    }
}
