// Chunk decoding for streaming responses
use serde_json::Value;

const DATA_PREFIX: &str = "data: ";
const ERROR_MARKER: &str = "[ERROR]";

/// One semantic event decoded from a raw stream chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Text(String),
    Error(String),
}

/// Decode one raw chunk from the transport into a semantic event.
///
/// A leading `"data: "` framing prefix is stripped when present; content
/// without it is treated as already clean. A chunk starting with the
/// `[ERROR]` marker becomes [`StreamEvent::Error`] with the marker and
/// surrounding whitespace removed. Everything else is [`StreamEvent::Text`],
/// including the empty chunk (`Text("")`), which callers use to tell "no
/// data yet" apart from "stream ended".
///
/// The decoder is stateless per chunk: a marker split across two physical
/// chunks is not detected. Backend flushes are line-aligned, so this is an
/// accepted limitation rather than a buffering bug to fix here.
pub fn decode_chunk(chunk: &str) -> StreamEvent {
    let clean = chunk.strip_prefix(DATA_PREFIX).unwrap_or(chunk);

    if let Some(rest) = clean.strip_prefix(ERROR_MARKER) {
        return StreamEvent::Error(rest.trim().to_string());
    }

    StreamEvent::Text(clean.to_string())
}

/// Outer chat layer on top of [`decode_chunk`]: the sidecar's chat endpoint
/// may wrap token text in a JSON envelope with a `content` field, or send it
/// as a bare JSON string. A chunk that is not JSON at all is passed through
/// unchanged; parse failure is only a fallback trigger, never an error.
/// Blank chunks and JSON without usable content yield `None`.
pub fn extract_chat_text(text: &str) -> Option<String> {
    let clean = text.strip_prefix(DATA_PREFIX).unwrap_or(text).trim();
    if clean.is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(clean) {
        Ok(value) => {
            if let Some(content) = value.get("content").and_then(Value::as_str) {
                Some(content.to_string())
            } else if let Some(text) = value.as_str() {
                Some(text.to_string())
            } else {
                None
            }
        }
        Err(_) => Some(clean.to_string()),
    }
}

/// Both layers composed, the way a chat view consumes the stream: decode the
/// chunk, then unwrap chat content from text payloads. Errors pass through;
/// text with nothing to show is dropped.
pub fn decode_chat_chunk(chunk: &str) -> Option<StreamEvent> {
    match decode_chunk(chunk) {
        StreamEvent::Error(message) => Some(StreamEvent::Error(message)),
        StreamEvent::Text(text) => extract_chat_text(&text).map(StreamEvent::Text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_chunk_decodes_to_text() {
        assert_eq!(
            decode_chunk("Hello world"),
            StreamEvent::Text("Hello world".to_string())
        );
    }

    #[test]
    fn error_marker_is_detected() {
        assert_eq!(
            decode_chunk("[ERROR] API key expired"),
            StreamEvent::Error("API key expired".to_string())
        );
    }

    #[test]
    fn data_prefix_is_stripped_before_marker_check() {
        assert_eq!(
            decode_chunk("data: [ERROR] Something went wrong"),
            StreamEvent::Error("Something went wrong".to_string())
        );
        assert_eq!(decode_chunk("data: X"), StreamEvent::Text("X".to_string()));
    }

    #[test]
    fn prefixed_text_decodes_to_text() {
        assert_eq!(
            decode_chunk("data: hi"),
            StreamEvent::Text("hi".to_string())
        );
    }

    #[test]
    fn empty_chunk_yields_empty_text_not_nothing() {
        assert_eq!(decode_chunk(""), StreamEvent::Text(String::new()));
    }

    #[test]
    fn chat_layer_extracts_json_content_field() {
        assert_eq!(
            extract_chat_text(r#"{"content":"Hello"}"#),
            Some("Hello".to_string())
        );
        assert_eq!(
            extract_chat_text(r#"data: {"content":"Hi"}"#),
            Some("Hi".to_string())
        );
    }

    #[test]
    fn chat_layer_accepts_bare_json_strings() {
        assert_eq!(extract_chat_text(r#""token""#), Some("token".to_string()));
    }

    #[test]
    fn chat_layer_passes_non_json_through_unchanged() {
        assert_eq!(
            extract_chat_text("just some text"),
            Some("just some text".to_string())
        );
    }

    #[test]
    fn chat_layer_drops_json_without_content() {
        assert_eq!(extract_chat_text(r#"{"role":"model"}"#), None);
        assert_eq!(extract_chat_text(""), None);
        assert_eq!(extract_chat_text("   "), None);
    }

    #[test]
    fn composed_chat_decoding_preserves_layering() {
        assert_eq!(
            decode_chat_chunk("data: [ERROR] quota exhausted"),
            Some(StreamEvent::Error("quota exhausted".to_string()))
        );
        assert_eq!(
            decode_chat_chunk(r#"data: {"content":"Hello"}"#),
            Some(StreamEvent::Text("Hello".to_string()))
        );
        assert_eq!(decode_chat_chunk("data: "), None);
    }
}
