//! Cgigate - A CGI gateway for PHP-style interpreters
//!
//! This library runs one interpreter process per scripted request and:
//! - Parses the interpreter's CGI response incrementally as it streams
//! - Builds the CGI/1.1 environment from the HTTP request
//! - Caps concurrent processes and holds excess requests in a FIFO line
//! - Kills runs that exceed their timeout and answers 503 when overloaded
//! - Serves everything that is not a script from the document root

pub mod config;
pub mod env;
pub mod error;
pub mod gateway;
pub mod parser;
pub mod process;
pub mod queue;
pub mod router;
pub mod server;
pub mod static_files;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
