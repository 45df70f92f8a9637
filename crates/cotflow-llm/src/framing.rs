//! Line framing shared by the SSE (cloud) and NDJSON (local) wire formats.
//!
//! Both backends send one event per line, but a network chunk may end in the
//! middle of a line (or of a multi-byte character), so bytes are buffered until
//! a newline arrives.

use std::collections::VecDeque;
use std::time::Duration;

use cotflow_core::{ChatError, ChatToken, TokenStream};
use futures::{Stream, StreamExt};
use tracing::debug;

/// How long to keep reading after the end marker before closing quietly.
const DONE_GRACE: Duration = Duration::from_millis(500);

/// Accumulates raw bytes and yields complete lines.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    /// Appends a chunk and returns every line it completed, without the newline.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.bytes.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.bytes.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.bytes.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..pos]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Returns the unterminated tail, if any.
    pub(crate) fn take_rest(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.bytes);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

/// Turns complete wire lines into tokens.
pub(crate) trait LineDecoder: Send + 'static {
    /// Decodes one line into zero or more tokens.
    fn decode_line(&mut self, line: &str) -> Result<Vec<ChatToken>, ChatError>;

    /// Called once the byte stream ends. Yields trailing tokens, or an error
    /// if the backend hung up before its end-of-stream signal.
    fn finish(&mut self) -> Result<Vec<ChatToken>, ChatError>;

    /// Whether the end-of-stream signal has been decoded.
    fn reached_end(&self) -> bool;
}

struct DecodeState<S, D> {
    bytes: std::pin::Pin<Box<S>>,
    buffer: LineBuffer,
    decoder: D,
    pending: VecDeque<Result<ChatToken, ChatError>>,
    idle_timeout: Duration,
    finished: bool,
}

impl<S, D: LineDecoder> DecodeState<S, D> {
    /// Queues decoded tokens; stops the stream at the first error.
    fn queue(&mut self, decoded: Result<Vec<ChatToken>, ChatError>) {
        match decoded {
            Ok(tokens) => self.pending.extend(tokens.into_iter().map(Ok)),
            Err(e) => {
                self.pending.push_back(Err(e));
                self.finished = true;
            }
        }
    }
}

/// Wraps a response body as a lazy [`TokenStream`].
///
/// Each wait for the next body chunk is bounded by `idle_timeout`. Once the
/// decoder has seen its end marker, the wait shrinks to a short grace period
/// and a silent connection ends the stream without error. Dropping the
/// returned stream drops the body, which closes the connection.
pub(crate) fn decode_stream<S, B, D>(bytes: S, decoder: D, idle_timeout: Duration) -> TokenStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    D: LineDecoder,
{
    let state = DecodeState {
        bytes: Box::pin(bytes),
        buffer: LineBuffer::default(),
        decoder,
        pending: VecDeque::new(),
        idle_timeout,
        finished: false,
    };

    let stream = futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }

            let wait = match st.decoder.reached_end() {
                true => DONE_GRACE.min(st.idle_timeout),
                false => st.idle_timeout,
            };

            match tokio::time::timeout(wait, st.bytes.next()).await {
                Err(_) if st.decoder.reached_end() => {
                    debug!("Backend kept the connection open after the end marker");
                    st.finished = true;
                }
                Err(_) => {
                    st.pending.push_back(Err(ChatError::Network(format!(
                        "no data from backend for {}s",
                        st.idle_timeout.as_secs()
                    ))));
                    st.finished = true;
                }
                Ok(Some(Ok(chunk))) => {
                    for line in st.buffer.push(chunk.as_ref()) {
                        let decoded = st.decoder.decode_line(&line);
                        st.queue(decoded);
                        if st.finished {
                            break;
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    st.pending.push_back(Err(ChatError::Network(format!("stream read failed: {e}"))));
                    st.finished = true;
                }
                Ok(None) => {
                    debug!("Backend closed the response body");
                    if let Some(rest) = st.buffer.take_rest() {
                        let decoded = st.decoder.decode_line(&rest);
                        st.queue(decoded);
                    }
                    if !st.finished {
                        let trailing = st.decoder.finish();
                        st.queue(trailing);
                    }
                    st.finished = true;
                }
            }
        }
    });

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One token per line; the line `end` is the end marker.
    #[derive(Default)]
    struct EchoDecoder {
        ended: bool,
    }

    impl LineDecoder for EchoDecoder {
        fn decode_line(&mut self, line: &str) -> Result<Vec<ChatToken>, ChatError> {
            if line == "end" {
                self.ended = true;
                return Ok(vec![ChatToken::Done]);
            }
            Ok(vec![ChatToken::answer(line)])
        }

        fn finish(&mut self) -> Result<Vec<ChatToken>, ChatError> {
            match self.ended {
                true => Ok(Vec::new()),
                false => Err(ChatError::Network("cut".into())),
            }
        }

        fn reached_end(&self) -> bool {
            self.ended
        }
    }

    #[tokio::test]
    async fn open_connection_after_end_marker_closes_quietly() {
        let body = futures::stream::iter(vec![Ok::<_, reqwest::Error>(b"hi\nend\n".to_vec())])
            .chain(futures::stream::pending());
        let tokens = decode_stream(body, EchoDecoder::default(), Duration::from_secs(120));

        let items: Vec<_> = tokio::time::timeout(Duration::from_secs(5), tokens.collect::<Vec<_>>())
            .await
            .expect("stream should end shortly after the end marker");
        assert_eq!(items, vec![Ok(ChatToken::answer("hi")), Ok(ChatToken::Done)]);
    }

    #[tokio::test]
    async fn silence_before_end_marker_is_network_error() {
        let body = futures::stream::iter(vec![Ok::<_, reqwest::Error>(b"hi\n".to_vec())])
            .chain(futures::stream::pending());
        let items: Vec<_> = decode_stream(body, EchoDecoder::default(), Duration::from_millis(50))
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(ChatError::Network(_))));
    }

    #[test]
    fn lines_split_across_chunks() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"data: {\"a\"").is_empty());
        assert_eq!(buffer.push(b":1}\r\ndata: x\n"), vec!["data: {\"a\":1}", "data: x"]);
        assert_eq!(buffer.take_rest(), None);
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let bytes = "思考\n".as_bytes();
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(&bytes[..2]).is_empty());
        assert_eq!(buffer.push(&bytes[2..]), vec!["思考"]);
    }

    #[test]
    fn unterminated_tail_is_returned() {
        let mut buffer = LineBuffer::default();
        buffer.push(b"{\"done\":true}");
        assert_eq!(buffer.take_rest().as_deref(), Some("{\"done\":true}"));
    }
}
