//! Server-Sent Events (SSE) processing for streaming completions.
//!
//! A streaming completion arrives as a sequence of lines:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//!
//! data: {"choices":[{"delta":{"content":"lo"}}]}
//!
//! data: [DONE]
//! ```
//!
//! [`FrameDecoder`] reassembles lines from arbitrarily fragmented bytes and
//! turns each `data: ` line into a [`StreamFrame`].  [`process_frames`] drives
//! the decoder over an HTTP byte stream and [`decode_frames`] reduces that to
//! the text fragments a chat session prints.
//!
//! Decoding is best-effort: blank lines, non-`data` lines, frames without a
//! text delta, and frames that fail to parse all produce nothing and the
//! stream carries on.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use tokio_util::codec::Decoder;

use crate::error::{Error, Result};
use crate::observability::{
    STREAM_BYTES, STREAM_DROPPED_FRAMES, STREAM_FRAGMENTS, STREAM_TRUNCATED,
};
use crate::types::ChatCompletionChunk;

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// One decoded unit of a streaming response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// An incremental text fragment.
    Delta(String),

    /// The server sent `data: [DONE]`.
    Done,

    /// The connection closed before `[DONE]` arrived.
    Truncated,
}

impl StreamFrame {
    /// Returns true for the frames that end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamFrame::Done | StreamFrame::Truncated)
    }
}

/// Line-oriented decoder for the completion event stream.
///
/// Holds back a trailing partial line until the bytes that complete it
/// arrive, so frame boundaries do not depend on how the transport chunked
/// the response.  Lines are split on raw bytes before UTF-8 validation, which
/// keeps multi-byte characters intact across chunk boundaries.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    // Bytes of the buffer already searched for a newline.
    next_index: usize,
    done: bool,
}

impl FrameDecoder {
    /// Creates a new decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once the `[DONE]` sentinel has been decoded.
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn decode_line(&mut self, line: &[u8]) -> Option<StreamFrame> {
        let Ok(line) = std::str::from_utf8(line) else {
            STREAM_DROPPED_FRAMES.click();
            return None;
        };
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let payload = line.strip_prefix(DATA_PREFIX)?;
        if payload == DONE_SENTINEL {
            self.done = true;
            return Some(StreamFrame::Done);
        }
        match serde_json::from_str::<ChatCompletionChunk>(payload) {
            Ok(chunk) => chunk.into_first_delta().map(StreamFrame::Delta),
            Err(_) => {
                STREAM_DROPPED_FRAMES.click();
                None
            }
        }
    }
}

impl Decoder for FrameDecoder {
    type Item = StreamFrame;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<StreamFrame>> {
        loop {
            if self.done {
                buf.clear();
                self.next_index = 0;
                return Ok(None);
            }
            let Some(offset) = buf[self.next_index..].iter().position(|b| *b == b'\n') else {
                self.next_index = buf.len();
                return Ok(None);
            };
            let line = buf.split_to(self.next_index + offset + 1);
            self.next_index = 0;
            if let Some(frame) = self.decode_line(&line[..line.len() - 1]) {
                return Ok(Some(frame));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<StreamFrame>> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        // The final line had no terminator.
        let line = buf.split();
        self.next_index = 0;
        Ok(self.decode_line(&line))
    }
}

struct FrameState<S> {
    source: Option<S>,
    buffer: BytesMut,
    decoder: FrameDecoder,
    finished: bool,
}

/// Process a stream of bytes into a stream of frames.
///
/// The returned stream yields `Delta` frames in arrival order and ends with
/// exactly one terminal frame: `Done` when the sentinel was seen, or
/// `Truncated` when the source closed first.  A transport error is yielded
/// once as [`Error::Streaming`] and ends the stream.  The source is dropped
/// as soon as the stream is finished, releasing the underlying connection.
pub fn process_frames<S, E>(byte_stream: S) -> impl Stream<Item = Result<StreamFrame>>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    let state = FrameState {
        source: Some(byte_stream),
        buffer: BytesMut::new(),
        decoder: FrameDecoder::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            // First check if we have a complete frame in the buffer
            let decoded = if state.source.is_some() {
                state.decoder.decode(&mut state.buffer)
            } else {
                state.decoder.decode_eof(&mut state.buffer)
            };
            match decoded {
                Ok(Some(StreamFrame::Delta(text))) => {
                    STREAM_FRAGMENTS.click();
                    return Some((Ok(StreamFrame::Delta(text)), state));
                }
                Ok(Some(frame)) => {
                    state.source = None;
                    state.finished = true;
                    return Some((Ok(frame), state));
                }
                Ok(None) => {}
                Err(err) => {
                    state.source = None;
                    state.finished = true;
                    return Some((Err(err), state));
                }
            }

            // Read more data
            let Some(source) = state.source.as_mut() else {
                state.finished = true;
                STREAM_TRUNCATED.click();
                return Some((Ok(StreamFrame::Truncated), state));
            };
            match source.next().await {
                Some(Ok(bytes)) => {
                    STREAM_BYTES.count(bytes.len() as u64);
                    state.buffer.extend_from_slice(&bytes);
                }
                Some(Err(err)) => {
                    state.source = None;
                    state.finished = true;
                    let err = Error::streaming(
                        format!("Error in HTTP stream: {err}"),
                        Some(Box::new(err)),
                    );
                    return Some((Err(err), state));
                }
                None => {
                    // Drain whatever is buffered on the next pass.
                    state.source = None;
                }
            }
        }
    })
}

/// Reduce a frame stream to its text fragments.
pub fn text_fragments<S>(frames: S) -> impl Stream<Item = Result<String>>
where
    S: Stream<Item = Result<StreamFrame>>,
{
    frames.filter_map(|frame| async move {
        match frame {
            Ok(StreamFrame::Delta(text)) => Some(Ok(text)),
            Ok(_) => None,
            Err(err) => Some(Err(err)),
        }
    })
}

/// Process a stream of bytes into the text fragments it carries.
pub fn decode_frames<S, E>(byte_stream: S) -> impl Stream<Item = Result<String>>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    text_fragments(process_frames(byte_stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn delta_line(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"index": 0, "delta": {"content": text}}]})
        )
    }

    fn chunked(chunks: Vec<Vec<u8>>) -> impl Stream<Item = std::result::Result<Bytes, io::Error>> {
        stream::iter(chunks.into_iter().map(|chunk| Ok(Bytes::from(chunk))))
    }

    async fn fragments_of(chunks: Vec<Vec<u8>>) -> Vec<String> {
        decode_frames(chunked(chunks))
            .map(|fragment| fragment.unwrap())
            .collect()
            .await
    }

    async fn frames_of(chunks: Vec<Vec<u8>>) -> Vec<StreamFrame> {
        process_frames(chunked(chunks))
            .map(|frame| frame.unwrap())
            .collect()
            .await
    }

    fn sample_stream() -> Vec<u8> {
        let mut body = String::new();
        body.push_str("data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n");
        body.push_str(&delta_line("Hel"));
        body.push_str(": keep-alive comment\n\n");
        body.push_str(&delta_line("lo"));
        body.push_str(&delta_line(" wörld ✓"));
        body.push_str("data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n");
        body.push_str("data: [DONE]\n\n");
        body.into_bytes()
    }

    #[tokio::test]
    async fn concatenated_fragments() {
        let mut body = String::new();
        body.push_str(&delta_line("Hel"));
        body.push_str(&delta_line("lo"));
        body.push_str(&delta_line(" world"));
        body.push_str("data: [DONE]\n\n");

        let fragments = fragments_of(vec![body.into_bytes()]).await;
        assert_eq!(fragments, vec!["Hel", "lo", " world"]);
        assert_eq!(fragments.concat(), "Hello world");
    }

    #[test]
    fn chunk_boundary_independence() {
        let body = sample_stream();
        let expected = tokio_test::block_on(fragments_of(vec![body.clone()]));
        assert_eq!(expected, vec!["Hel", "lo", " wörld ✓"]);

        // Every two-way split, including splits inside multi-byte characters.
        for split in 0..=body.len() {
            let chunks = vec![body[..split].to_vec(), body[split..].to_vec()];
            let fragments = tokio_test::block_on(fragments_of(chunks));
            assert_eq!(fragments, expected, "split at byte {split}");
        }

        // One byte at a time.
        let chunks = body.iter().map(|b| vec![*b]).collect();
        assert_eq!(tokio_test::block_on(fragments_of(chunks)), expected);

        // Uneven strides.
        for stride in [2, 3, 7, 16, 61] {
            let chunks = body.chunks(stride).map(<[u8]>::to_vec).collect();
            let fragments = tokio_test::block_on(fragments_of(chunks));
            assert_eq!(fragments, expected, "stride {stride}");
        }
    }

    #[tokio::test]
    async fn done_only_stream() {
        let frames = frames_of(vec![b"data: [DONE]\n".to_vec()]).await;
        assert_eq!(frames, vec![StreamFrame::Done]);

        let fragments = fragments_of(vec![b"data: [DONE]\n".to_vec()]).await;
        assert!(fragments.is_empty());
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped() {
        let mut body = String::new();
        body.push_str(&delta_line("first"));
        body.push_str("data: {\"choices\": [{\"delta\": {\"content\": \"oops\"\n\n");
        body.push_str(&delta_line("second"));
        body.push_str("data: [DONE]\n\n");

        let frames: Vec<_> = process_frames(chunked(vec![body.into_bytes()]))
            .collect()
            .await;
        assert!(frames.iter().all(|frame| frame.is_ok()));
        let frames: Vec<_> = frames.into_iter().map(|frame| frame.unwrap()).collect();
        assert_eq!(
            frames,
            vec![
                StreamFrame::Delta("first".to_string()),
                StreamFrame::Delta("second".to_string()),
                StreamFrame::Done,
            ]
        );
    }

    #[tokio::test]
    async fn invalid_utf8_frame_is_skipped() {
        let mut body = delta_line("ok").into_bytes();
        body.extend_from_slice(b"data: {\"choices\":[{\"delta\":{\"content\":\"\xff\xfe\"}}]}\n");
        body.extend_from_slice(delta_line("still ok").as_bytes());
        body.extend_from_slice(b"data: [DONE]\n");

        assert_eq!(fragments_of(vec![body]).await, vec!["ok", "still ok"]);
    }

    #[tokio::test]
    async fn control_and_unknown_lines_produce_nothing() {
        let body = concat!(
            "event: message\n",
            "id: 7\n",
            "retry: 1000\n",
            ": comment\n",
            "data:{\"choices\":[{\"delta\":{\"content\":\"no space\"}}]}\n",
            "data: {\"choices\":[]}\n",
            "data: {\"object\":\"chat.completion.chunk\"}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":null}}]}\n",
            "data: [DONE]\n",
        );
        assert_eq!(
            frames_of(vec![body.as_bytes().to_vec()]).await,
            vec![StreamFrame::Done]
        );
    }

    #[tokio::test]
    async fn crlf_lines_are_trimmed() {
        let body = delta_line("win").replace('\n', "\r\n") + "data: [DONE]\r\n\r\n";
        assert_eq!(fragments_of(vec![body.into_bytes()]).await, vec!["win"]);
    }

    #[tokio::test]
    async fn truncated_stream_keeps_fragments() {
        let body = delta_line("partial") + &delta_line(" answer");
        let frames = frames_of(vec![body.into_bytes()]).await;
        assert_eq!(
            frames,
            vec![
                StreamFrame::Delta("partial".to_string()),
                StreamFrame::Delta(" answer".to_string()),
                StreamFrame::Truncated,
            ]
        );
    }

    #[tokio::test]
    async fn unterminated_final_line_is_decoded() {
        let body = delta_line("a") + "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}";
        let frames = frames_of(vec![body.into_bytes()]).await;
        assert_eq!(
            frames,
            vec![
                StreamFrame::Delta("a".to_string()),
                StreamFrame::Delta("b".to_string()),
                StreamFrame::Truncated,
            ]
        );

        let frames = frames_of(vec![b"data: [DONE]".to_vec()]).await;
        assert_eq!(frames, vec![StreamFrame::Done]);
    }

    #[tokio::test]
    async fn empty_source_is_truncated() {
        assert_eq!(frames_of(Vec::new()).await, vec![StreamFrame::Truncated]);
        assert!(fragments_of(Vec::new()).await.is_empty());
    }

    #[tokio::test]
    async fn source_not_polled_after_done() {
        let polled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polled);
        let chunks = vec![
            Bytes::from(delta_line("only") + "data: [DONE]\n\n"),
            Bytes::from(delta_line("ignored")),
        ];
        let source = stream::iter(chunks.into_iter().map(Ok::<_, io::Error>)).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let fragments: Vec<_> = decode_frames(source).collect().await;
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].as_ref().unwrap(), "only");
        assert_eq!(polled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_error_ends_stream() {
        let chunks: Vec<std::result::Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from(delta_line("before"))),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer")),
            Ok(Bytes::from(delta_line("after"))),
        ];
        let items: Vec<_> = decode_frames(stream::iter(chunks)).collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "before");
        let err = items[1].as_ref().unwrap_err();
        assert!(matches!(err, Error::Streaming { .. }));
        assert!(err.to_string().contains("reset by peer"));
    }

    #[test]
    fn decoder_holds_partial_line() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&b"data: {\"choices\":[{\"delta\":{\"content\":\"x"[..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"y\"}}]}\n");
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(StreamFrame::Delta("xy".to_string()))
        );
        assert!(buf.is_empty());
        assert!(!decoder.is_done());
    }

    #[test]
    fn decoder_ignores_bytes_after_done() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&b"data: [DONE]\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n"[..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(StreamFrame::Done));
        assert!(decoder.is_done());
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert_eq!(decoder.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn terminal_frames() {
        assert!(StreamFrame::Done.is_terminal());
        assert!(StreamFrame::Truncated.is_terminal());
        assert!(!StreamFrame::Delta(String::new()).is_terminal());
    }
}
