//! Error types and client-facing error responses for the gateway

use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Response body type used by every handler in the gateway
pub type GatewayBody = UnsyncBoxBody<Bytes, CgiError>;

/// Errors raised while running an interpreter process
#[derive(Debug, Error)]
pub enum CgiError {
    /// The interpreter binary could not be started
    #[error("failed to spawn interpreter '{bin}': {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O failure while talking to the process
    #[error("process I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The header block does not start with a status line
    #[error("malformed CGI response: {0}")]
    ProtocolViolation(String),

    /// The process died in a way that was not requested
    #[error("interpreter exited abnormally: {0}")]
    AbnormalExit(String),

    /// A signal was delivered to a process that had already exited
    #[error("process already exited")]
    AlreadyExited,

    /// The run exceeded its deadline and was killed
    #[error("run timed out")]
    RunTimeout,
}

impl CgiError {
    /// True for the exit/kill race, which is reported as a normal end
    pub fn is_already_exited(&self) -> bool {
        matches!(self, CgiError::AlreadyExited)
    }
}

/// Error codes for gateway failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorCode {
    /// Waiting line full or wait timeout elapsed
    ServerBusy,
    /// Interpreter ran past its run timeout
    RequestTimeout,
    /// Spawn failure, abnormal exit or malformed output
    ScriptFailed,
    /// No script or static file matches the path
    NotFound,
    /// Static files only answer GET and HEAD
    MethodNotAllowed,
}

impl GatewayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::ServerBusy => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            GatewayErrorCode::ScriptFailed => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::ServerBusy => "SERVER_BUSY",
            GatewayErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            GatewayErrorCode::ScriptFailed => "SCRIPT_FAILED",
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
        }
    }

    /// Literal body sent with this error
    pub fn default_body(&self) -> &'static str {
        match self {
            GatewayErrorCode::ServerBusy => "<h1>Server Too Busy</h1>",
            GatewayErrorCode::RequestTimeout => "<h1>Request Timeout</h1>",
            GatewayErrorCode::ScriptFailed => "<h1>Internal Server Error</h1>",
            GatewayErrorCode::NotFound => "<h1>Not Found</h1>",
            GatewayErrorCode::MethodNotAllowed => "<h1>Method Not Allowed</h1>",
        }
    }
}

/// Wrap a complete byte buffer as a gateway body
pub fn full_body(bytes: impl Into<Bytes>) -> GatewayBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed_unsync()
}

/// Create an error response with the code's literal HTML body
pub fn error_response(code: GatewayErrorCode) -> Response<GatewayBody> {
    build_error(code, "text/html", code.default_body().to_string())
}

/// Create a 500 response carrying the failure detail as plain text
pub fn script_failure_response(err: &CgiError) -> Response<GatewayBody> {
    build_error(GatewayErrorCode::ScriptFailed, "text/plain", err.to_string())
}

fn build_error(code: GatewayErrorCode, content_type: &'static str, body: String) -> Response<GatewayBody> {
    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, content_type)
        .header("X-Gateway-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            GatewayErrorCode::ServerBusy.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayErrorCode::RequestTimeout.status_code(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            GatewayErrorCode::ScriptFailed.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_busy_and_timeout_are_distinguishable() {
        let busy = error_response(GatewayErrorCode::ServerBusy);
        let timeout = error_response(GatewayErrorCode::RequestTimeout);

        assert_ne!(busy.status(), timeout.status());
        assert_eq!(busy.headers().get("X-Gateway-Error").unwrap(), "SERVER_BUSY");
        assert_eq!(
            timeout.headers().get("X-Gateway-Error").unwrap(),
            "REQUEST_TIMEOUT"
        );
        assert_eq!(busy.headers().get("Content-Type").unwrap(), "text/html");
    }

    #[tokio::test]
    async fn test_script_failure_carries_detail() {
        let err = CgiError::ProtocolViolation("no status code in 'garbage'".to_string());
        let response = script_failure_response(&err);

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            &body[..],
            b"malformed CGI response: no status code in 'garbage'"
        );
    }

    #[test]
    fn test_already_exited_is_benign() {
        assert!(CgiError::AlreadyExited.is_already_exited());
        assert!(!CgiError::RunTimeout.is_already_exited());
    }
}
