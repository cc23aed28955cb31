//! http side of a turn: post the completion request, hand back the body as
//! a stream of raw chunks.

use crate::error::TransportError;
use crate::orchestrator::CompletionRequest;
use async_trait::async_trait;
use bevy::log::{debug, info};
use futures_lite::Stream;
use std::io::{ErrorKind, Read};
use std::pin::Pin;

/// raw body chunks in arrival order. a clean end of stream is `None`;
/// a broken body yields one `Err` and then ends.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

/// everything needed to open one completion stream.
#[derive(Clone, Debug)]
pub struct StreamRequest {
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
    pub payload: CompletionRequest,
}

/// opens a streaming completion. implementations must not retry: the first
/// failure goes straight back to the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_stream(&self, request: StreamRequest) -> Result<ChunkStream, TransportError>;
}

const READ_BUF_SIZE: usize = 4096;
const CHUNK_QUEUE: usize = 256;
const ERROR_BODY_LIMIT: usize = 512;

/// blocking `ureq` transport. the connect and every body read run on one
/// detached thread per call; a stalled body never holds up runtime shutdown.
#[derive(Clone)]
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl Default for UreqTransport {
    fn default() -> Self {
        // non-2xx is inspected by hand so the error body can be shown
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build();
        Self { agent: config.into() }
    }
}

impl UreqTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for UreqTransport {
    async fn open_stream(&self, request: StreamRequest) -> Result<ChunkStream, TransportError> {
        let agent = self.agent.clone();
        let (open_tx, open_rx) = flume::bounded::<Result<(), TransportError>>(1);
        let (chunk_tx, chunk_rx) = flume::bounded(CHUNK_QUEUE);

        std::thread::Builder::new()
            .name("unillm-stream".into())
            .spawn(move || {
                let reader = match connect(&agent, &request) {
                    Ok(reader) => {
                        let _ = open_tx.send(Ok(()));
                        reader
                    }
                    Err(err) => {
                        let _ = open_tx.send(Err(err));
                        return;
                    }
                };
                pump(reader, &chunk_tx);
            })
            .map_err(|err| TransportError::Connection(format!("spawning stream thread: {err}")))?;

        match open_rx.recv_async().await {
            Ok(Ok(())) => Ok(Box::pin(chunk_rx.into_stream())),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TransportError::Connection("transport worker exited".into())),
        }
    }
}

fn connect(
    agent: &ureq::Agent,
    request: &StreamRequest,
) -> Result<impl Read + Send + 'static, TransportError> {
    info!(target: "bevy_unillm", "POST {} (model={}, msgs={})",
        request.endpoint, request.payload.model, request.payload.messages.len()
    );

    let mut req = agent.post(request.endpoint.as_str());
    for (name, value) in &request.headers {
        req = req.header(name.as_str(), value.as_str());
    }
    let response = req.send_json(&request.payload).map_err(|err| match err {
        ureq::Error::Io(io) => TransportError::Connection(io.to_string()),
        ureq::Error::Json(json) => TransportError::Encode(json),
        other => TransportError::Connection(other.to_string()),
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .into_body()
            .read_to_string()
            .map(|text| truncate(text.trim(), ERROR_BODY_LIMIT))
            .unwrap_or_default();
        return Err(TransportError::HttpStatus { status: status.as_u16(), body });
    }

    debug!(target: "bevy_unillm", "stream opened: status={}", status.as_u16());
    Ok(response.into_body().into_reader())
}

/// forwards body bytes until eof, a read error, or the receiver going away.
fn pump(mut reader: impl Read, tx: &flume::Sender<Result<Vec<u8>, TransportError>>) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Ok(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                let _ = tx.send(Err(TransportError::Io(err)));
                break;
            }
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
