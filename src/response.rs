//! Minimal header inspection for origin responses.
//!
//! Only the headers the cache cares about are looked at, and every span
//! points back into the original bytes so the cache can split the text
//! exactly where the Age value lives.

use memchr::memmem;

const CRLF: &[u8] = b"\r\n";
const HEAD_END: &[u8] = b"\r\n\r\n";
/// Freshness lifetimes beyond 2^31 seconds are treated as 2^31.
pub const MAX_AGE_LIMIT: u64 = i32::MAX as u64;

/// Offset just past the blank line ending the head, if it is complete.
pub fn head_end(buf: &[u8]) -> Option<usize> {
    memmem::find(buf, HEAD_END).map(|pos| pos + HEAD_END.len())
}

/// One `Name: value` line inside a message head.
#[derive(Debug, Clone, Copy)]
pub struct Header<'a> {
    pub name: &'a [u8],
    pub value: &'a [u8],
    /// Offset of the first value byte.
    pub value_start: usize,
    /// Offset of the CRLF terminating the line.
    pub line_end: usize,
}

impl Header<'_> {
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.as_bytes())
    }

    pub fn value_contains(&self, token: &str) -> bool {
        contains_ignore_case(self.value, token.as_bytes())
    }
}

/// Iterates header lines after the start line, stopping at the blank line.
pub fn headers(buf: &[u8]) -> Headers<'_> {
    let start = memmem::find(buf, CRLF).map(|p| p + CRLF.len());
    Headers { buf, pos: start }
}

pub struct Headers<'a> {
    buf: &'a [u8],
    pos: Option<usize>,
}

impl<'a> Iterator for Headers<'a> {
    type Item = Header<'a>;

    fn next(&mut self) -> Option<Header<'a>> {
        loop {
            let start = self.pos?;
            let buf: &'a [u8] = self.buf;
            let rest = &buf[start..];
            let line_len = match memmem::find(rest, CRLF) {
                Some(len) => len,
                None => {
                    self.pos = None;
                    return None;
                }
            };
            if line_len == 0 {
                self.pos = None;
                return None;
            }
            self.pos = Some(start + line_len + CRLF.len());

            let line = &rest[..line_len];
            let Some(colon) = memchr::memchr(b':', line) else {
                continue;
            };
            let mut value_offset = colon + 1;
            while value_offset < line.len() && line[value_offset] == b' ' {
                value_offset += 1;
            }
            return Some(Header {
                name: &line[..colon],
                value: trim_end(&line[value_offset..]),
                value_start: start + value_offset,
                line_end: start + line_len,
            });
        }
    }
}

/// The parts of an origin response head that drive caching decisions.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: Option<u16>,
    pub max_age: Option<u64>,
    /// Value of the first `Age` header, when it is numeric.
    pub age: Option<u64>,
    pub has_age: bool,
    pub no_cache: bool,
    pub chunked: bool,
    pub content_length: Option<usize>,
    /// Length of the head including the blank line, when it was complete.
    pub head_len: Option<usize>,
}

impl ResponseHead {
    pub fn inspect(buf: &[u8]) -> Self {
        let mut head = ResponseHead {
            status: parse_status(buf),
            head_len: head_end(buf),
            ..Default::default()
        };

        for h in headers(buf) {
            if h.is("Cache-Control") {
                if h.value_contains("no-cache") || h.value_contains("no-store") {
                    head.no_cache = true;
                }
                if head.max_age.is_none() {
                    head.max_age = parse_max_age(h.value).map(|n| n.min(MAX_AGE_LIMIT));
                }
            } else if h.is("Pragma") {
                if h.value_contains("no-cache") {
                    head.no_cache = true;
                }
            } else if h.is("Age") {
                if !head.has_age {
                    head.has_age = true;
                    head.age = parse_number(h.value);
                }
            } else if h.is("Transfer-Encoding") {
                if h.value_contains("chunked") {
                    head.chunked = true;
                }
            } else if h.is("Content-Length") {
                head.content_length =
                    parse_number(h.value).map(|n| usize::try_from(n).unwrap_or(usize::MAX));
            }
        }

        head
    }

    pub fn is_cacheable(&self) -> bool {
        !self.no_cache && self.max_age.is_some()
    }

    /// Total bytes of a non-chunked response, when the origin declared them
    /// and they fit in memory arithmetic.
    pub fn expected_len(&self) -> Option<usize> {
        if self.chunked {
            return None;
        }
        self.head_len?.checked_add(self.content_length?)
    }
}

fn parse_status(buf: &[u8]) -> Option<u16> {
    let line_end = memmem::find(buf, CRLF).unwrap_or(buf.len());
    let line = std::str::from_utf8(&buf[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// `max-age=N`, taking the first comma delimited token after `=`.
pub fn parse_max_age(value: &[u8]) -> Option<u64> {
    let key = b"max-age=";
    let mut from = 0;
    while let Some(found) = find_ignore_case(&value[from..], key) {
        let pos = from + found;
        // Only a directive start counts, not the tail of `x-max-age`.
        if pos == 0 || matches!(value[pos - 1], b' ' | b',') {
            let rest = &value[pos + key.len()..];
            let token = rest.split(|&b| b == b',').next()?;
            return parse_number(token);
        }
        from = pos + 1;
    }
    None
}

fn parse_number(value: &[u8]) -> Option<u64> {
    std::str::from_utf8(value).ok()?.trim().parse().ok()
}

fn trim_end(mut value: &[u8]) -> &[u8] {
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

fn find_ignore_case(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

pub fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    find_ignore_case(haystack, needle).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CACHEABLE: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: text/html\r\n\
Cache-Control: public, max-age=300\r\n\
Content-Length: 5\r\n\
\r\n\
hello";

    #[test]
    fn test_inspect_cacheable() {
        let head = ResponseHead::inspect(CACHEABLE);
        assert_eq!(head.status, Some(200));
        assert_eq!(head.max_age, Some(300));
        assert_eq!(head.age, None);
        assert_eq!(head.content_length, Some(5));
        assert!(head.is_cacheable());
        assert!(!head.chunked);
        assert_eq!(head.expected_len(), Some(CACHEABLE.len()));
    }

    #[test]
    fn test_no_cache_variants() {
        let a = b"HTTP/1.1 200 OK\r\nCache-Control: no-cache, max-age=10\r\n\r\n";
        let b = b"HTTP/1.1 200 OK\r\nCache-Control: max-age=10\r\nPragma: no-cache\r\n\r\n";
        let c = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n";
        assert!(!ResponseHead::inspect(a).is_cacheable());
        assert!(!ResponseHead::inspect(b).is_cacheable());
        assert!(!ResponseHead::inspect(c).is_cacheable());
    }

    #[test]
    fn test_chunked_and_age() {
        let buf = b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\ncache-control: max-age=60\r\nage: 12\r\n\r\n";
        let head = ResponseHead::inspect(buf);
        assert!(head.chunked);
        assert_eq!(head.age, Some(12));
        assert_eq!(head.max_age, Some(60));
        assert_eq!(head.expected_len(), None);
    }

    #[test]
    fn test_parse_max_age() {
        assert_eq!(parse_max_age(b"max-age=60"), Some(60));
        assert_eq!(parse_max_age(b"public, max-age=60, must-revalidate"), Some(60));
        assert_eq!(parse_max_age(b"max-age=abc"), None);
        assert_eq!(parse_max_age(b"s-max-age=60"), None);
        assert_eq!(parse_max_age(b"public"), None);
        assert_eq!(parse_max_age(b"x-max-age=1, max-age=60"), Some(60));
        assert_eq!(parse_max_age(b"X-Max-Age=1,max-age=7"), Some(7));
    }

    #[test]
    fn test_huge_max_age_is_clamped() {
        let buf = b"HTTP/1.1 200 OK\r\nCache-Control: max-age=18446744073709551615\r\n\r\n";
        assert_eq!(ResponseHead::inspect(buf).max_age, Some(MAX_AGE_LIMIT));
    }

    #[test]
    fn test_huge_content_length_has_no_expected_len() {
        let buf = b"HTTP/1.1 200 OK\r\nCache-Control: max-age=60\r\nContent-Length: 18446744073709551615\r\n\r\n";
        let head = ResponseHead::inspect(buf);
        assert!(head.content_length.is_some());
        assert_eq!(head.expected_len(), None);
    }

    #[test]
    fn test_first_age_header_wins() {
        let buf = b"HTTP/1.1 200 OK\r\nAge: soon\r\nAge: 3\r\n\r\n";
        let head = ResponseHead::inspect(buf);
        assert!(head.has_age);
        assert_eq!(head.age, None);
    }

    #[test]
    fn test_header_spans() {
        let buf = b"HTTP/1.1 200 OK\r\nAge: 7\r\nX: y\r\n\r\nbody";
        let age = headers(buf).find(|h| h.is("age")).unwrap();
        assert_eq!(age.value, b"7");
        assert_eq!(&buf[age.value_start..age.line_end], b"7");
        assert_eq!(&buf[age.value_start - 5..age.value_start], b"Age: ");
        assert_eq!(headers(buf).count(), 2);
    }

    #[test]
    fn test_status_missing() {
        assert_eq!(ResponseHead::inspect(b"garbage").status, None);
        assert_eq!(
            ResponseHead::inspect(b"HTTP/1.1 404 Not Found\r\n\r\n").status,
            Some(404)
        );
    }
}
