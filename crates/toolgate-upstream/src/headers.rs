use http::HeaderMap;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, HOST, HeaderName};

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Client headers as sent to the backend. Host and length are recomputed by the
/// client, and encoding is negotiated by the client itself so bodies arrive decoded.
pub fn forward_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if *name == HOST || *name == CONTENT_LENGTH || *name == ACCEPT_ENCODING || is_hop_by_hop(name) {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

/// Backend headers as sent to the client. Bodies are rewritten, so length and
/// encoding no longer describe them.
pub fn response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut kept = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if *name == CONTENT_LENGTH || *name == CONTENT_ENCODING || is_hop_by_hop(name) {
            continue;
        }
        kept.append(name.clone(), value.clone());
    }
    kept
}
