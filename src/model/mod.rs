//! The request/response data model: origins, URLs, headers, bodies, and
//! the extensions bag.

mod extensions;
mod request;
mod response;
mod url;

pub use self::{
    extensions::{
        Extensions, HttpVersion, NetworkStreamHandle, ReasonPhrase, SniHostname, StreamId,
        Timeouts, Trace,
    },
    request::{Body, BodyStream, Request},
    response::{Response, ResponseBody},
    url::{IntoUrl, Origin, Scheme, Url},
};

pub(crate) use self::{request::header_value, response::BodyRead};

use bytes::Bytes;

/// Merge a default header sequence with an override sequence.
///
/// Any default entry whose name (compared case-insensitively) also appears
/// in the overrides is dropped; the result is the surviving defaults
/// followed by the overrides, order preserved.
pub fn merge_headers(
    defaults: &[(Bytes, Bytes)],
    overrides: &[(Bytes, Bytes)],
) -> Vec<(Bytes, Bytes)> {
    let mut merged: Vec<(Bytes, Bytes)> = defaults
        .iter()
        .filter(|(name, _)| {
            !overrides
                .iter()
                .any(|(o_name, _)| o_name.eq_ignore_ascii_case(name))
        })
        .cloned()
        .collect();
    merged.extend(overrides.iter().cloned());
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdr(name: &'static str, value: &'static str) -> (Bytes, Bytes) {
        (Bytes::from_static(name.as_bytes()), Bytes::from_static(value.as_bytes()))
    }

    #[test]
    fn overrides_win_case_insensitively() {
        let defaults = vec![hdr("Accept", "*/*"), hdr("Proxy-Authorization", "Basic xyz")];
        let overrides = vec![hdr("accept", "text/html")];
        let merged = merge_headers(&defaults, &overrides);
        assert_eq!(
            merged,
            vec![hdr("Proxy-Authorization", "Basic xyz"), hdr("accept", "text/html")]
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let defaults = vec![hdr("Host", "proxy"), hdr("Accept", "*/*")];
        let overrides = vec![hdr("host", "remote"), hdr("X-Extra", "1")];
        let once = merge_headers(&defaults, &overrides);
        let twice = merge_headers(&once, &overrides);
        assert_eq!(once, twice);
    }

    #[test]
    fn empty_sides() {
        let headers = vec![hdr("A", "1")];
        assert_eq!(merge_headers(&[], &headers), headers);
        assert_eq!(merge_headers(&headers, &[]), headers);
    }
}
