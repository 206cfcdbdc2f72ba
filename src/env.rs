//! CGI/1.1 environment construction

use crate::config::CgiConfig;
use http::request::Parts;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};

/// Server-wide CGI variables, built once at startup
#[derive(Debug, Clone)]
pub struct ServerEnv {
    pub software: String,
    pub protocol: &'static str,
    pub gateway_interface: &'static str,
    pub server_name: String,
    pub server_port: u16,
    pub redirect_status: u16,
}

impl ServerEnv {
    pub fn from_config(cgi: &CgiConfig) -> Self {
        let server_name = cgi.server_name.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| "unknown".to_string())
        });

        Self {
            software: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            protocol: "HTTP/1.1",
            gateway_interface: "CGI/1.1",
            server_name,
            server_port: cgi.server_port,
            redirect_status: 200,
        }
    }

    fn apply(&self, env: &mut HashMap<String, String>) {
        env.insert("SERVER_SOFTWARE".into(), self.software.clone());
        env.insert("SERVER_PROTOCOL".into(), self.protocol.into());
        env.insert("GATEWAY_INTERFACE".into(), self.gateway_interface.into());
        env.insert("SERVER_NAME".into(), self.server_name.clone());
        env.insert("SERVER_PORT".into(), self.server_port.to_string());
        env.insert("REDIRECT_STATUS_ENV".into(), "0".into());
        env.insert("REDIRECT_STATUS".into(), self.redirect_status.to_string());
    }
}

/// Where the request landed on disk
#[derive(Debug, Clone)]
pub struct ScriptTarget {
    /// Document root the script was resolved against
    pub document_root: PathBuf,
    /// Resolved script file
    pub script_file: PathBuf,
}

/// Build the environment map for one scripted request
pub fn request_env(
    parts: &Parts,
    server: &ServerEnv,
    target: &ScriptTarget,
    remote_addr: SocketAddr,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    server.apply(&mut env);

    let uri = &parts.uri;
    let path = uri.path();
    let root = target.document_root.to_string_lossy();
    let translated = normalize_path(Path::new(&format!("{}{}", root.trim_end_matches('/'), path)));

    env.insert("DOCUMENT_ROOT".into(), root.to_string());
    env.insert("SCRIPT_NAME".into(), path.to_string());
    env.insert("SCRIPT_FILENAME".into(), target.script_file.to_string_lossy().into_owned());
    env.insert("PATH_INFO".into(), translated.to_string_lossy().into_owned());
    env.insert("PATH_TRANSLATED".into(), translated.to_string_lossy().into_owned());
    env.insert("REQUEST_METHOD".into(), parts.method.to_string());
    env.insert(
        "REQUEST_URI".into(),
        uri.path_and_query().map(|pq| pq.as_str()).unwrap_or(path).to_string(),
    );
    env.insert("QUERY_STRING".into(), uri.query().unwrap_or("").to_string());
    env.insert("REMOTE_ADDR".into(), remote_addr.ip().to_string());
    env.insert("REMOTE_PORT".into(), remote_addr.port().to_string());

    if let Some(host) = uri.host() {
        env.insert("SERVER_NAME".into(), host.to_string());
    }
    if let Some(port) = uri.port_u16() {
        env.insert("SERVER_PORT".into(), port.to_string());
    }

    for name in parts.headers.keys() {
        let joined = parts
            .headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        let key = format!("HTTP_{}", name.as_str().to_ascii_uppercase().replace('-', "_"));
        env.insert(key, joined);
    }

    let header = |name: hyper::header::HeaderName| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    if let Some(length) = header(hyper::header::CONTENT_LENGTH) {
        env.insert("CONTENT_LENGTH".into(), length);
    }
    if let Some(content_type) = header(hyper::header::CONTENT_TYPE) {
        env.insert("CONTENT_TYPE".into(), content_type);
    }
    if let Some(auth) = header(hyper::header::AUTHORIZATION) {
        let scheme = auth.split(' ').next().unwrap_or("").to_string();
        env.insert("AUTH_TYPE".into(), scheme);
    }

    env
}

/// Resolve `.` and `..` lexically, without touching the filesystem
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}
