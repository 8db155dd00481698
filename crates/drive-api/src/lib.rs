//! Client for the remote drive HTTP API.
//!
//! The drive exposes one directory tree per `directory_id`. Objects are addressed by absolute,
//! slash-separated paths and transferred whole: there are no ranged reads or partial uploads.

mod auth;
mod backends;
mod client;
pub mod error;
mod http_client;
pub mod models;

pub use client::{ClientBuilder, ClientConfig, DriveClient};
#[cfg(feature = "reqwest-client")]
pub use client::Drive;
#[cfg(feature = "reqwest-client")]
pub use backends::ReqwestClient;
pub use error::{DriveError, HttpClientError};
pub use http_client::{HttpClient, HttpRequest, HttpResponse};
