use std::io;

use thiserror::Error;

use crate::discovery::DiscoveryMode;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to resolve required path: {0}")]
    Path(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Keychain(#[from] keyring::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Config(String),
    #[error("places API key is not configured")]
    MissingCredential,
    #[error("invalid response from places provider: {0}")]
    InvalidResponse(String),
    #[error("places provider error: {0}")]
    ProviderError(String),
    #[error("{} discovery is already running", .0.as_str())]
    DiscoveryInFlight(DiscoveryMode),
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        // reqwest renders the request URL, which carries the API key.
        let err = err.without_url();
        match err.status() {
            Some(status) => AppError::InvalidResponse(http_status_copy(status.as_u16())),
            None => AppError::InvalidResponse(err.to_string()),
        }
    }
}

impl AppError {
    /// Text suitable for showing to the user; never contains credentials.
    pub fn user_message(&self) -> String {
        match self {
            AppError::MissingCredential => {
                "Google Places API key is missing. Add it to your configuration.".into()
            }
            AppError::InvalidResponse(reason) => {
                sanitize_error_copy(&format!("Invalid response from Google Places API: {reason}"))
            }
            AppError::ProviderError(status) => format!("Google Places API Error: {status}"),
            AppError::DiscoveryInFlight(mode) => {
                format!("Already discovering {}; please wait.", mode.display_name())
            }
            other => sanitize_error_copy(&other.to_string()),
        }
    }
}

pub(crate) fn http_status_copy(status: u16) -> String {
    let hint = match status {
        401 => "Unauthorized - Check API key",
        403 => "Forbidden - API key may be invalid or missing",
        429 => "Rate limit exceeded",
        500..=599 => "Server error",
        _ => "Unknown error",
    };
    format!("HTTP Error {status}: {hint}")
}

/// Redacts `key=` query parameters from error text before it is logged or shown.
pub fn sanitize_error_copy(message: &str) -> String {
    let mut output = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(index) = rest.find("key=") {
        let boundary_ok = index == 0
            || matches!(rest.as_bytes()[index - 1], b'?' | b'&' | b' ' | b'(');
        output.push_str(&rest[..index + 4]);
        rest = &rest[index + 4..];
        if boundary_ok {
            let end = rest
                .find(|c: char| c == '&' || c == ')' || c.is_whitespace())
                .unwrap_or(rest.len());
            output.push_str("[redacted]");
            rest = &rest[end..];
        }
    }
    output.push_str(rest);
    output
}
