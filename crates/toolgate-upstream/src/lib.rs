pub mod client;
pub mod headers;
pub mod response;
pub mod upstream;

pub use client::{ProbeOutcome, UpstreamClient, UpstreamRequest};
pub use headers::{forward_headers, response_headers};
pub use response::{ByteStream, ProxyResponse, StreamBody, UpstreamPassthroughError};
pub use upstream::{handle_response, network_failure};
