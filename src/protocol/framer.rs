//! Incremental framer for the Base byte stream.
//!
//! Bases write JSON objects back to back with no length prefix. An object is complete
//! once `{[(` / `}])` nesting returns to zero outside double-quoted strings. The framer
//! can be fed arbitrary chunks and yields each complete object as text. Bytes seen
//! while no object is open (newlines, whitespace, stray closers) are skipped.
use bytes::BytesMut;
use log::warn;

/// Default upper bound on one object, guards against a Base that never closes a brace.
pub const DEFAULT_MAX_OBJECT: usize = 64 * 1024;

pub struct ObjectFramer {
    buf: BytesMut,
    /// Bytes of `buf` already scanned for the current object.
    scanned: usize,
    depth: usize,
    in_quote: bool,
    escape: bool,
    max_len: usize,
}

impl Default for ObjectFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OBJECT)
    }
}

impl ObjectFramer {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            scanned: 0,
            depth: 0,
            in_quote: false,
            escape: false,
            max_len,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet returned.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete object, if one is buffered.
    pub fn next_object(&mut self) -> Option<String> {
        loop {
            if self.depth == 0 {
                // Drop everything before the next opener
                match self.buf.iter().position(|b| b"{[(".contains(b)) {
                    Some(start) => {
                        let _ = self.buf.split_to(start);
                        self.scanned = 0;
                    }
                    None => {
                        self.buf.clear();
                        self.scanned = 0;
                        return None;
                    }
                }
            }

            while self.scanned < self.buf.len() {
                let ch = self.buf[self.scanned];
                self.scanned += 1;

                if self.escape {
                    self.escape = false;
                } else if self.in_quote {
                    match ch {
                        b'\\' => self.escape = true,
                        b'"' => self.in_quote = false,
                        _ => {}
                    }
                } else {
                    match ch {
                        b'"' => self.in_quote = true,
                        b'{' | b'[' | b'(' => self.depth += 1,
                        b'}' | b']' | b')' => {
                            self.depth -= 1;
                            if self.depth == 0 {
                                let frame = self.buf.split_to(self.scanned);
                                self.scanned = 0;
                                return Some(String::from_utf8_lossy(&frame).into_owned());
                            }
                        }
                        _ => {}
                    }
                }

                if self.scanned > self.max_len {
                    warn!(
                        "Dropping oversize object ({} bytes without closing)",
                        self.scanned
                    );
                    let _ = self.buf.split_to(self.scanned);
                    self.reset_scan();
                    break;
                }
            }

            if self.depth > 0 || self.buf.is_empty() {
                return None;
            }
        }
    }

    fn reset_scan(&mut self) {
        self.scanned = 0;
        self.depth = 0;
        self.in_quote = false;
        self.escape = false;
    }
}
