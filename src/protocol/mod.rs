pub mod http1;
pub mod transcode;

pub use http1::{Headers, HttpRequest, ParseError, ProtocolKind, parse_request};
pub use transcode::{FrameTranscoder, Transcoder};
