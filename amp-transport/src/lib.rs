//! Transport bindings for AMP agents.
//!
//! A [`Transport`] sends encoded messages to peers and yields inbound frames
//! for the runtime to decode. [`LoopbackNetwork`] connects runtimes inside one
//! process; [`HttpTransport`] implements the `POST /amp/v1/invoke` binding.

#![warn(missing_docs, clippy::pedantic)]

mod error;
pub mod http;
mod http_client;
pub mod loopback;
pub mod traits;

pub use error::{TransportError, TransportResult};
pub use http::{HttpTransport, HttpTransportConfig, INVOKE_PATH};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use traits::{InboundFrame, InboundStream, Transport};
