use actix_web::http::StatusCode;
use actix_web::{HttpResponse, HttpResponseBuilder, ResponseError};
use snafu::Snafu;
use std::io;
use std::net::SocketAddr;

use crate::{assembler, certificates};

// Server (router/handler) and controller errors live together so every high-level failure of a
// request maps to a response code in one place.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(super)))]
pub enum Error {
    // Server errors
    #[snafu(display("Unable to bind to {}: {}", addr, source))]
    BindSocket { addr: SocketAddr, source: io::Error },

    #[snafu(display("Unable to start server: {}", source))]
    ServerStart { source: io::Error },

    #[snafu(display("Unable to serialize response: {}", source))]
    ResponseSerialization { source: serde_json::Error },

    #[snafu(display("Request did not finish within {} seconds", seconds))]
    Deadline {
        seconds: u64,
        source: tokio::time::error::Elapsed,
    },

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    // Request errors
    #[snafu(display("Peer is not authorized for this route"))]
    Unauthorized,

    #[snafu(display("Invalid request body: {}", reason))]
    MalformedBody { reason: String },

    #[snafu(display("Invalid device id: {}", source))]
    InvalidDeviceId {
        source: models::modeled_types::error::Error,
    },

    #[snafu(display("Unknown directive '{}'", directive))]
    UnknownDirective { directive: String },

    #[snafu(display("Content of '{}' message is malformed: {}", directive, source))]
    MalformedContent {
        directive: String,
        source: serde_json::Error,
    },

    #[snafu(display("Directive '{}' requires a registered device certificate", directive))]
    WrongPeer { directive: String },

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    // Controller errors
    #[snafu(display("Device '{}/{}' not found", namespace, name))]
    DeviceNotFound { namespace: String, name: String },

    #[snafu(display("Repository error during {}: {}", op, source))]
    Repository {
        op: &'static str,
        source: fleetstore::Error,
    },

    #[snafu(display("Unable to assemble configuration for '{}': {}", device, source))]
    Assembly {
        device: String,
        source: assembler::Error,
    },

    #[snafu(display("Certificate error for device '{}': {}", device, source))]
    Certificate {
        device: String,
        source: certificates::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        use Error::*;
        match self {
            // 400 Bad Request
            MalformedBody { .. } => StatusCode::BAD_REQUEST,
            InvalidDeviceId { .. } => StatusCode::BAD_REQUEST,
            UnknownDirective { .. } => StatusCode::BAD_REQUEST,
            MalformedContent { .. } => StatusCode::BAD_REQUEST,
            Certificate { source, .. } if source.is_bad_request() => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            Unauthorized => StatusCode::UNAUTHORIZED,
            WrongPeer { .. } => StatusCode::UNAUTHORIZED,

            // 404 Not Found
            DeviceNotFound { .. } => StatusCode::NOT_FOUND,

            // 500 Internal Server Error
            Certificate { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Repository { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Assembly { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Deadline { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ResponseSerialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            BindSocket { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ServerStart { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        // Rejected peers learn nothing about why.
        if status == StatusCode::UNAUTHORIZED {
            return HttpResponse::new(status);
        }
        HttpResponseBuilder::new(status).body(self.to_string())
    }
}
