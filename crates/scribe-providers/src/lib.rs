//! Chat-completion plumbing: payload building, HTTP transport, SSE decoding and
//! delta merging.

pub mod error;
pub mod merge;
pub mod payload;
pub mod stream;
pub mod transport;

pub use error::{classify_error_body, classify_error_object, ProviderError};
pub use merge::{append_non_null, ResponseAccumulator, ABORTED_MARKER};
pub use payload::{build_payload, Payload};
pub use stream::{delta_stream, read_completion, Delta, DeltaStream, SseDecoder};
pub use transport::{
    read_body, ChatRequest, ChunkStream, Connection, Endpoint, HttpTransport, ProxySettings,
    Transport, TransportSettings, DEFAULT_CHAT_PATH, DEFAULT_ENDPOINT_URL,
};
