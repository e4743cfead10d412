//! Byte-level scanning helpers for first-buffer editing.
//!
//! The handshake editors work on raw buffers that are usually, but
//! not provably, HTTP text; everything here stays on `[u8]` so a
//! stray non-UTF-8 byte never corrupts the stream.

/// First occurrence of `needle` in `haystack`.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub(crate) fn contains_ignore_ascii_case(haystack: &[u8], needle: &[u8]) -> bool {
    find(&haystack.to_ascii_lowercase(), needle).is_some()
}

/// Split a buffer into lines on LF boundaries, trimming a trailing
/// CR per line and dropping the empty tail after a final LF, the
/// same shape `str::lines` produces.
pub(crate) fn split_lines(buf: &[u8]) -> Vec<&[u8]> {
    let mut lines: Vec<&[u8]> = buf
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .collect();
    if buf.ends_with(b"\n") {
        lines.pop();
    }
    lines
}

/// Second whitespace-separated field of a request line.
pub(crate) fn request_target(line: &[u8]) -> Option<String> {
    std::str::from_utf8(line)
        .ok()?
        .split_whitespace()
        .nth(1)
        .map(str::to_string)
}

/// Replace every occurrence of `needle`, left to right.
pub(crate) fn replace_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_locates_needles() {
        assert_eq!(find(b"abc def", b"def"), Some(4));
        assert_eq!(find(b"abc", b"abcd"), None);
        assert_eq!(find(b"abc", b""), None);
    }

    #[test]
    fn case_insensitive_contains() {
        assert!(contains_ignore_ascii_case(
            b"Upgrade: WebSocket\r\n",
            b"upgrade: websocket"
        ));
        assert!(!contains_ignore_ascii_case(b"Connection: close", b"upgrade:"));
    }

    #[test]
    fn split_lines_matches_str_lines() {
        assert_eq!(
            split_lines(b"a\r\nb\nc\r\n\r\n"),
            vec![&b"a"[..], &b"b"[..], &b"c"[..], &b""[..]]
        );
        assert_eq!(split_lines(b"no newline"), vec![&b"no newline"[..]]);
        assert_eq!(split_lines(b""), vec![&b""[..]]);
    }

    #[test]
    fn request_target_takes_second_field() {
        assert_eq!(
            request_target(b"GET /abc HTTP/1.1").as_deref(),
            Some("/abc")
        );
        assert_eq!(request_target(b"GET"), None);
    }

    #[test]
    fn replace_bytes_replaces_every_occurrence() {
        assert_eq!(replace_bytes(b"x /a x /a ", b"/a", b"/b"), b"x /b x /b ");
        assert_eq!(replace_bytes(b"abc", b"zz", b"y"), b"abc");
    }
}
