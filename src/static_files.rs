//! Serves non-script files from the document root

use crate::error::{error_response, full_body, GatewayBody, GatewayErrorCode};
use crate::router::resolve_under_root;
use http::request::Parts;
use hyper::body::Bytes;
use hyper::header::{ALLOW, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use std::path::{Path, PathBuf};
use tracing::debug;

const INDEX_FILE: &str = "index.html";

/// Read-only file server rooted at the document root
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Answer a GET or HEAD request with the file at its path
    pub async fn serve(&self, req: &Parts) -> Response<GatewayBody> {
        let method = &req.method;
        if method != Method::GET && method != Method::HEAD {
            let mut response = error_response(GatewayErrorCode::MethodNotAllowed);
            response
                .headers_mut()
                .insert(ALLOW, hyper::header::HeaderValue::from_static("GET, HEAD"));
            return response;
        }

        let path = req.uri.path();
        let Some(mut file) = resolve_under_root(&self.root, path) else {
            debug!(path, "Refusing path outside document root");
            return error_response(GatewayErrorCode::NotFound);
        };

        match tokio::fs::metadata(&file).await {
            Ok(meta) if meta.is_dir() => file.push(INDEX_FILE),
            Ok(_) => {}
            Err(_) => return error_response(GatewayErrorCode::NotFound),
        }

        let contents = match tokio::fs::read(&file).await {
            Ok(contents) => contents,
            Err(e) => {
                debug!(path, file = %file.display(), error = %e, "Static file not readable");
                return error_response(GatewayErrorCode::NotFound);
            }
        };

        let length = contents.len();
        let body = if method == Method::HEAD {
            Bytes::new()
        } else {
            Bytes::from(contents)
        };

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content_type(&file))
            .header(CONTENT_LENGTH, length)
            .body(full_body(body))
            .expect("valid response builder")
    }
}

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" | "map" => "application/json; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "woff2" => "font/woff2",
        "woff" => "font/woff",
        "ttf" => "font/ttf",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}
