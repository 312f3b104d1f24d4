//! The reply-writer collaborator: commands emit typed replies through it,
//! and hosts decide how those become wire bytes.

use bytes::BytesMut;

/// Sink for typed command replies.
pub trait Reply {
    fn integer(&mut self, v: i64);
    fn bulk(&mut self, bytes: &[u8]);
    fn simple(&mut self, s: &str);
    fn error(&mut self, msg: &str);
    /// Announces a multi-bulk reply of `len` elements.
    fn array(&mut self, len: usize);
    fn null(&mut self);
}

/// A reply captured in memory.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyItem {
    Integer(i64),
    Bulk(Vec<u8>),
    Simple(String),
    Error(String),
    Array(usize),
    Null,
}

/// Buffering [`Reply`] implementation used by tests and embedding hosts.
#[derive(Debug, Default)]
pub struct BufferedReply {
    pub items: Vec<ReplyItem>,
}

impl BufferedReply {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes the captured reply into RESP wire framing.
    #[must_use]
    pub fn to_wire(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        for item in &self.items {
            match item {
                ReplyItem::Integer(v) => {
                    buf.extend_from_slice(format!(":{}\r\n", v).as_bytes());
                }
                ReplyItem::Bulk(bytes) => {
                    buf.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
                    buf.extend_from_slice(bytes);
                    buf.extend_from_slice(b"\r\n");
                }
                ReplyItem::Simple(s) => {
                    buf.extend_from_slice(format!("+{}\r\n", s).as_bytes());
                }
                ReplyItem::Error(msg) => {
                    buf.extend_from_slice(format!("-{}\r\n", msg).as_bytes());
                }
                ReplyItem::Array(len) => {
                    buf.extend_from_slice(format!("*{}\r\n", len).as_bytes());
                }
                ReplyItem::Null => {
                    buf.extend_from_slice(b"$-1\r\n");
                }
            }
        }
        buf
    }

    /// The only error in the buffer, if the reply is a single error.
    #[must_use]
    pub fn single_error(&self) -> Option<&str> {
        match self.items.as_slice() {
            [ReplyItem::Error(msg)] => Some(msg),
            _ => None,
        }
    }
}

impl Reply for BufferedReply {
    fn integer(&mut self, v: i64) {
        self.items.push(ReplyItem::Integer(v));
    }
    fn bulk(&mut self, bytes: &[u8]) {
        self.items.push(ReplyItem::Bulk(bytes.to_vec()));
    }
    fn simple(&mut self, s: &str) {
        self.items.push(ReplyItem::Simple(s.to_owned()));
    }
    fn error(&mut self, msg: &str) {
        self.items.push(ReplyItem::Error(msg.to_owned()));
    }
    fn array(&mut self, len: usize) {
        self.items.push(ReplyItem::Array(len));
    }
    fn null(&mut self) {
        self.items.push(ReplyItem::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[mockalloc::test]
    fn wire_framing() {
        let mut r = BufferedReply::new();
        r.array(2);
        r.bulk(b"encoding");
        r.integer(7);
        r.simple("OK");
        r.error("ERR boom");
        r.null();
        assert_eq!(
            &r.to_wire()[..],
            b"*2\r\n$8\r\nencoding\r\n:7\r\n+OK\r\n-ERR boom\r\n$-1\r\n" as &[u8]
        );
    }

    #[test]
    fn single_error_extraction() {
        let mut r = BufferedReply::new();
        assert!(r.single_error().is_none());
        r.error("ERR nope");
        assert_eq!(r.single_error(), Some("ERR nope"));
        r.integer(1);
        assert!(r.single_error().is_none());
    }
}
