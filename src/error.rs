use thiserror::Error;

/// failures while opening or reading the completion stream.
///
/// every variant ends the current turn; the display text becomes the
/// assistant's visible reply.
#[derive(Debug, Error)]
pub enum TransportError {
    /// dns/tcp/tls failure, or anything else that kept the request from
    /// reaching a response.
    #[error("connection failed: {0}")]
    Connection(String),
    /// the endpoint answered with a non-2xx status.
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    /// the body broke off mid-stream.
    #[error("stream read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("request encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl TransportError {
    /// the text committed as the assistant message for a failed turn.
    pub fn user_message(&self) -> String {
        format!("API call failed: {self}")
    }
}

/// why `ChatOrchestrator::send` did nothing. both cases are silent no-ops
/// for the ui; they exist so callers can log them.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendRejected {
    #[error("prompt is empty")]
    Empty,
    #[error("a response is still streaming")]
    Busy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_is_readable() {
        let err = TransportError::HttpStatus { status: 401, body: "invalid api key".into() };
        assert_eq!(err.user_message(), "API call failed: http status 401: invalid api key");

        let err = TransportError::Connection("dns error: no such host".into());
        assert!(err.user_message().contains("no such host"));
    }
}
