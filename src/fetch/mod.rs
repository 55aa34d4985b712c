//! Resilient upstream HTTP access: a transport seam, the retry policy and the
//! retrying client built on both.

pub mod client;
pub mod retry;
pub mod transport;

pub use client::{FetchClient, FetchError, FetchNotice};
pub use transport::{HttpTransport, ReqwestTransport, TransportError};
