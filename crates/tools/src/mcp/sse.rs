//! Incremental Server-Sent Events decoder.

use cortex_core::sse::LineBuffer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `message` when the server did not name the event
    pub event: String,
    pub data: String,
}

#[derive(Default)]
pub struct SseDecoder {
    lines: LineBuffer,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed raw body bytes; returns every event completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.lines.push(chunk);
        let mut out = Vec::new();
        while let Some(line) = self.lines.next_line() {
            if let Some(ev) = self.apply(&line) {
                out.push(ev);
            }
        }
        out
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if let Some(rest) = self.lines.take_rest()
            && let Some(ev) = self.apply(&rest)
        {
            return Some(ev);
        }
        self.dispatch()
    }

    fn apply(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".into()),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_split_across_chunks() {
        let mut d = SseDecoder::default();
        assert!(d.push(b"event: endpoint\nda").is_empty());
        let events = d.push(b"ta: /messages?sid=1\n\n: ping\n\ndata: {\"a\":1}\r\n\r\n");
        assert_eq!(
            events,
            vec![
                SseEvent {
                    event: "endpoint".into(),
                    data: "/messages?sid=1".into()
                },
                SseEvent {
                    event: "message".into(),
                    data: "{\"a\":1}".into()
                },
            ]
        );
    }

    #[test]
    fn multi_line_data_and_trailing_event() {
        let mut d = SseDecoder::default();
        assert!(d.push(b"data: one\ndata: two").is_empty());
        let last = d.finish().unwrap();
        assert_eq!(last.data, "one\ntwo");
        assert!(d.finish().is_none());
    }

    #[test]
    fn non_ascii_result_split_mid_character() {
        let body = "data: {\"result\":\"天气晴 ☀\"}\n\n".as_bytes();
        let cut = body.iter().position(|b| *b >= 0x80).unwrap() + 2;
        let mut d = SseDecoder::default();
        assert!(d.push(&body[..cut]).is_empty());
        let events = d.push(&body[cut..]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"result\":\"天气晴 ☀\"}");
    }
}
