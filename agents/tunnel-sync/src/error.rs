//! Error types for tunnel-sync.

use thiserror::Error;

/// Errors raised while talking to Traefik or Cloudflare, or while loading configuration.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport failure (connect, timeout, body decode)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response
    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: String,
        status: reqwest::StatusCode,
        body: String,
    },

    /// Cloudflare answered with `success: false`
    #[error("Cloudflare API error: {0}")]
    Api(String),

    /// Cloudflare answered successfully but without a `result`
    #[error("No result in Cloudflare response for {0}")]
    MissingResult(String),

    /// Invalid or incomplete configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
