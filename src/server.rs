use crate::error::GatewayBody;
use crate::gateway::CgiGateway;
use crate::static_files::StaticFiles;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// HTTP front end: scripts go to the gateway, everything else to static files
pub struct GatewayServer {
    bind_addr: SocketAddr,
    gateway: Arc<CgiGateway>,
    static_files: Arc<StaticFiles>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        gateway: Arc<CgiGateway>,
        static_files: StaticFiles,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            gateway,
            static_files: Arc::new(static_files),
            shutdown_rx,
        }
    }

    pub fn gateway(&self) -> &Arc<CgiGateway> {
        &self.gateway
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, root = %self.static_files.root().display(), "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            let static_files = Arc::clone(&self.static_files);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, gateway, static_files).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    gateway: Arc<CgiGateway>,
    static_files: Arc<StaticFiles>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        let static_files = Arc::clone(&static_files);
        async move { handle_request(req, gateway, static_files, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<CgiGateway>,
    static_files: Arc<StaticFiles>,
    client_addr: SocketAddr,
) -> Result<Response<GatewayBody>, Infallible> {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match gateway.resolve_script(&path).await {
        Some(target) => gateway.submit(req, target, client_addr).await,
        None => {
            let (parts, _) = req.into_parts();
            static_files.serve(&parts).await
        }
    };

    debug!(
        method = %method,
        path,
        status = response.status().as_u16(),
        client = %client_addr,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Request handled"
    );

    Ok(response)
}
