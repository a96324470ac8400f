//! Error types for the Hydra agent
//!
//! Every error carries a stable code (`E1xx`..`E9xx`) grouped by the part of
//! the agent that failed. The group decides the process exit status and
//! whether the connection loop may retry.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, Error>;

/// Part of the agent an error originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Config,
    Filesystem,
    Channel,
    Framing,
    Relay,
    Internal,
}

impl Category {
    /// Process exit status for errors of this category
    pub fn exit_code(self) -> i32 {
        match self {
            Category::Config => 10,
            Category::Filesystem => 20,
            Category::Channel => 30,
            Category::Framing => 40,
            Category::Relay => 50,
            Category::Internal => 90,
        }
    }
}

/// Stable numeric error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    ConfigMissing = 100,
    ConfigSyntax = 101,
    ConfigInvalid = 102,
    ConfigExists = 103,

    FileRead = 200,
    FileWrite = 201,
    FilePermission = 202,
    FileNotFound = 203,

    ChannelUnreachable = 300,
    HandshakeTimeout = 301,
    HandshakeRejected = 302,
    ChannelLost = 303,
    ChannelClosed = 304,

    FrameMalformed = 401,
    FrameUnexpected = 402,

    TargetTransport = 500,
    RequestInvalid = 501,

    Internal = 900,
}

impl ErrorCode {
    pub fn category(self) -> Category {
        match self as u16 / 100 {
            1 => Category::Config,
            2 => Category::Filesystem,
            3 => Category::Channel,
            4 => Category::Framing,
            5 => Category::Relay,
            _ => Category::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", *self as u16)
    }
}

/// Main error type for the agent
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────

    #[error("Configuration file not found: {path}")]
    ConfigMissing { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ConfigSyntax {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    #[error("Invalid value for {field}: {reason}")]
    ConfigInvalid { field: String, reason: String },

    #[error("Configuration file already exists: {path}")]
    ConfigExists { path: PathBuf },

    // ─────────────────────────────────────────────────────────────
    // Filesystem
    // ─────────────────────────────────────────────────────────────

    #[error("Failed to read {path}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Rendering the effective configuration back to TOML
    #[error("Failed to render configuration: {0}")]
    TomlRender(#[from] toml::ser::Error),

    // ─────────────────────────────────────────────────────────────
    // Coordinator channel
    // ─────────────────────────────────────────────────────────────

    #[error("Coordinator at {url} is unreachable: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("No handshake from {url} within {after_ms}ms")]
    HandshakeTimeout { url: String, after_ms: u64 },

    /// Coordinator refused the namespace connection
    #[error("Coordinator rejected the agent: {reason}")]
    Rejected { reason: String },

    #[error("Channel to coordinator lost: {reason}")]
    ChannelLost { reason: String },

    /// The connection loop is gone or cannot take more work
    #[error("Coordinator channel closed: {0}")]
    ChannelClosed(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // ─────────────────────────────────────────────────────────────
    // Framing
    // ─────────────────────────────────────────────────────────────

    #[error("Malformed frame: {detail}")]
    MalformedFrame { detail: String },

    /// Well-formed frame arriving where the handshake expects another one
    #[error("Unexpected frame: {detail}")]
    UnexpectedFrame { detail: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Relay
    // ─────────────────────────────────────────────────────────────

    /// Target call failed before a response arrived
    #[error("Target call failed: {0}")]
    Target(#[from] reqwest::Error),

    /// Work request cannot be turned into an HTTP call
    #[error("Cannot relay request: {detail}")]
    BadRequest { detail: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        use std::io::ErrorKind;

        match self {
            Error::ConfigMissing { .. } => ErrorCode::ConfigMissing,
            Error::ConfigSyntax { .. } => ErrorCode::ConfigSyntax,
            Error::ConfigInvalid { .. } => ErrorCode::ConfigInvalid,
            Error::ConfigExists { .. } => ErrorCode::ConfigExists,
            Error::TomlRender(_) => ErrorCode::ConfigSyntax,

            Error::ReadFile { .. } => ErrorCode::FileRead,
            Error::WriteFile { .. } => ErrorCode::FileWrite,
            Error::Io(e) if e.kind() == ErrorKind::NotFound => ErrorCode::FileNotFound,
            Error::Io(e) if e.kind() == ErrorKind::PermissionDenied => ErrorCode::FilePermission,
            Error::Io(_) => ErrorCode::FileRead,

            Error::Unreachable { .. } | Error::WebSocket(_) => ErrorCode::ChannelUnreachable,
            Error::HandshakeTimeout { .. } => ErrorCode::HandshakeTimeout,
            Error::Rejected { .. } => ErrorCode::HandshakeRejected,
            Error::ChannelLost { .. } => ErrorCode::ChannelLost,
            Error::ChannelClosed(_) => ErrorCode::ChannelClosed,

            Error::MalformedFrame { .. } | Error::Json(_) => ErrorCode::FrameMalformed,
            Error::UnexpectedFrame { .. } => ErrorCode::FrameUnexpected,

            Error::Target(_) => ErrorCode::TargetTransport,
            Error::BadRequest { .. } => ErrorCode::RequestInvalid,

            Error::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether a later attempt can succeed without changing anything
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Unreachable { .. }
            | Error::HandshakeTimeout { .. }
            | Error::ChannelLost { .. }
            | Error::WebSocket(_) => true,
            Error::Target(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.code().category().exit_code()
    }

    /// What the operator can do about it
    pub fn hint(&self) -> Option<&'static str> {
        let hint = match self {
            Error::ConfigMissing { .. } => {
                "Run 'hydra-agent config init' to create a default configuration file."
            }
            Error::ConfigSyntax { .. } => {
                "Check the TOML syntax. Run 'hydra-agent config validate' to see details."
            }
            Error::ConfigInvalid { .. } => "Fix the named field in the configuration file or its HYDRA_* override.",
            Error::ConfigExists { .. } => "Pass --force to overwrite it.",
            Error::Unreachable { .. } | Error::WebSocket(_) => {
                "Verify [coordinator] url and that the coordinator is listening."
            }
            Error::HandshakeTimeout { .. } => {
                "The coordinator accepted the socket but never opened a session. Check engine_revision."
            }
            Error::Rejected { .. } => "Verify the token in the [agent] section.",
            Error::ChannelLost { .. } => {
                "The agent reconnects automatically unless reconnect = false."
            }
            Error::Target(_) => "Check that [target] base_url is running and reachable.",
            _ => return None,
        };
        Some(hint)
    }

    /// Colored report for stderr
    pub fn terminal_report(&self) -> String {
        let mut report = format!("\x1b[31mError [{}]\x1b[0m: {}\n", self.code(), self);
        if let Some(hint) = self.hint() {
            report.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }
        report
    }

    /// Single uncolored line for structured logs
    pub fn log_line(&self) -> String {
        format!("[{}] {}", self.code(), self)
    }

    // ─────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────

    pub fn missing_config(path: impl Into<PathBuf>) -> Self {
        Error::ConfigMissing { path: path.into() }
    }

    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ConfigInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn unreachable(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Unreachable {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Error::MalformedFrame {
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Error::BadRequest {
            detail: detail.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
