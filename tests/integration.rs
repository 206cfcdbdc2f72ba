//! Integration tests for Cgigate

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cgigate::config::Config;
use cgigate::env::ServerEnv;
use cgigate::gateway::CgiGateway;
use cgigate::queue::QueueStats;
use cgigate::server::GatewayServer;
use cgigate::static_files::StaticFiles;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Running gateway bound to an ephemeral port
struct TestGateway {
    addr: SocketAddr,
    gateway: Arc<CgiGateway>,
    shutdown_tx: watch::Sender<bool>,
    _root: TempDir,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Document root whose `.php` files are shell scripts run by `sh`
fn docroot() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let write = |name: &str, contents: &str| std::fs::write(dir.path().join(name), contents).unwrap();

    write(
        "hello.php",
        "printf 'Status: 200 OK\\r\\nContent-Type: text/plain\\r\\nX-Script: hello\\r\\n\\r\\nHello from script'\n",
    );
    write(
        "env.php",
        "printf 'Status: 200 OK\\r\\n\\r\\n'; printf '%s|%s|%s' \"$REQUEST_METHOD\" \"$QUERY_STRING\" \"$SCRIPT_NAME\"\n",
    );
    write("echo.php", "printf 'Status: 200 OK\\r\\n\\r\\n'; cat\n");
    write("created.php", "printf 'Status: 201 Created\\r\\nLocation: /item/1\\r\\n\\r\\n'\n");
    write("broken.php", "printf 'not a cgi response\\r\\n\\r\\n'\n");
    write("slow.php", "sleep 2\nprintf 'Status: 200 OK\\r\\n\\r\\nslow'\n");
    write("fast.php", "printf 'Status: 200 OK\\r\\n\\r\\nfast'\n");
    write("index.html", "<h1>static index</h1>");
    dir
}

fn test_config(root: &Path, process_limit: usize, queue_limit: usize, process_timeout_ms: u64) -> Config {
    let mut config = Config::default();
    config.cgi.bin = "sh".to_string();
    config.cgi.args = vec!["-c".to_string(), "exec sh \"$SCRIPT_FILENAME\"".to_string()];
    config.cgi.root = root.to_path_buf();
    config.cgi.server_name = Some("gateway.test".to_string());
    config.process.limit = process_limit;
    config.process.timeout_ms = process_timeout_ms;
    config.queue.limit = queue_limit;
    config.queue.timeout_ms = 10_000;
    config.validate().unwrap();
    config
}

async fn start_gateway(process_limit: usize, queue_limit: usize, process_timeout_ms: u64) -> TestGateway {
    let root = docroot();
    let config = test_config(root.path(), process_limit, queue_limit, process_timeout_ms);

    let server_env = Arc::new(ServerEnv::from_config(&config.cgi));
    let gateway = Arc::new(CgiGateway::from_config(&config, server_env));
    let static_files = StaticFiles::new(config.cgi.root.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = GatewayServer::new(addr, Arc::clone(&gateway), static_files, shutdown_rx);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    TestGateway {
        addr,
        gateway,
        shutdown_tx,
        _root: root,
    }
}

/// Send a raw HTTP/1.1 request and read the whole response
async fn http_request(addr: SocketAddr, method: &str, path: &str, body: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        addr,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    http_request(addr, "GET", path, "").await
}

fn status_line(response: &str) -> &str {
    response.lines().next().unwrap_or("")
}

#[tokio::test]
async fn test_script_response_is_streamed() {
    let gw = start_gateway(4, 4, 5_000).await;

    let response = http_get(gw.addr, "/hello.php").await;
    assert!(status_line(&response).contains("200"), "{}", response);
    assert!(response.to_lowercase().contains("x-script: hello"));
    assert!(response.contains("Hello from script"));
}

#[tokio::test]
async fn test_script_sees_cgi_environment() {
    let gw = start_gateway(4, 4, 5_000).await;

    let response = http_get(gw.addr, "/env.php?a=1&b=2").await;
    assert!(response.contains("GET|a=1&b=2|/env.php"), "{}", response);
}

#[tokio::test]
async fn test_request_body_is_piped_to_script() {
    let gw = start_gateway(4, 4, 5_000).await;

    let response = http_request(gw.addr, "POST", "/echo.php", "field=value").await;
    assert!(status_line(&response).contains("200"));
    assert!(response.contains("field=value"), "{}", response);
}

#[tokio::test]
async fn test_script_status_and_headers_are_forwarded() {
    let gw = start_gateway(4, 4, 5_000).await;

    let response = http_get(gw.addr, "/created.php").await;
    assert!(status_line(&response).contains("201"), "{}", response);
    assert!(response.to_lowercase().contains("location: /item/1"));
}

#[tokio::test]
async fn test_malformed_script_output_is_500() {
    let gw = start_gateway(4, 4, 5_000).await;

    let response = http_get(gw.addr, "/broken.php").await;
    assert!(status_line(&response).contains("500"), "{}", response);
    assert!(response.contains("SCRIPT_FAILED"));
}

#[tokio::test]
async fn test_static_files_and_missing_paths() {
    let gw = start_gateway(4, 4, 5_000).await;

    let index = http_get(gw.addr, "/").await;
    assert!(status_line(&index).contains("200"));
    assert!(index.contains("<h1>static index</h1>"));

    let missing = http_get(gw.addr, "/missing.php").await;
    assert!(status_line(&missing).contains("404"), "{}", missing);

    let post = http_request(gw.addr, "POST", "/index.html", "x").await;
    assert!(status_line(&post).contains("405"), "{}", post);
}

#[tokio::test]
async fn test_run_timeout_answers_408() {
    let gw = start_gateway(1, 1, 500).await;

    let started = std::time::Instant::now();
    let response = http_get(gw.addr, "/slow.php").await;
    assert!(status_line(&response).contains("408"), "{}", response);
    assert!(response.contains("<h1>Request Timeout</h1>"));
    assert!(started.elapsed() < Duration::from_millis(1_800));
    assert_eq!(gw.gateway.queue().running(), 0);
}

/// One slot, one place in line, 1s run timeout: the slow run is killed,
/// the queued request takes its slot and the third request is turned away.
#[tokio::test]
async fn test_overload_scenario() {
    let gw = start_gateway(1, 1, 1_000).await;
    let addr = gw.addr;

    let slow = tokio::spawn(async move { http_get(addr, "/slow.php").await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gw.gateway.queue().running(), 1);

    let queued = tokio::spawn(async move { http_get(addr, "/fast.php").await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gw.gateway.queue().waiting(), 1);

    let rejected = http_get(addr, "/fast.php").await;
    assert!(status_line(&rejected).contains("503"), "{}", rejected);
    assert!(rejected.contains("<h1>Server Too Busy</h1>"));

    let slow = slow.await.unwrap();
    assert!(status_line(&slow).contains("408"), "{}", slow);

    let queued = queued.await.unwrap();
    assert!(status_line(&queued).contains("200"), "{}", queued);
    assert!(queued.contains("fast"));

    let stats = gw.gateway.queue().stats();
    assert_eq!(QueueStats::get(&stats.admitted), 1);
    assert_eq!(QueueStats::get(&stats.promoted), 1);
    assert_eq!(QueueStats::get(&stats.rejected_full), 1);
    assert_eq!(QueueStats::get(&stats.run_timeouts), 1);
}

#[tokio::test]
async fn test_concurrent_runs_within_limit() {
    let gw = start_gateway(4, 8, 5_000).await;
    let addr = gw.addr;

    let requests: Vec<_> = (0..8)
        .map(|_| tokio::spawn(async move { http_get(addr, "/hello.php").await }))
        .collect();

    for request in requests {
        let response = request.await.unwrap();
        assert!(status_line(&response).contains("200"), "{}", response);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gw.gateway.queue().running(), 0);
    assert_eq!(gw.gateway.queue().waiting(), 0);
}

/// Open a connection, send `head` and keep the socket without reading
async fn send_partial(addr: SocketAddr, head: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(head.as_bytes()).await.unwrap();
    stream
}

#[tokio::test]
async fn test_client_disconnect_leaves_waiting_line() {
    let gw = start_gateway(1, 1, 5_000).await;
    let addr = gw.addr;

    let slow = tokio::spawn(async move { http_get(addr, "/slow.php").await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let waiting = send_partial(
        addr,
        &format!("GET /fast.php HTTP/1.1\r\nHost: {}\r\n\r\n", addr),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gw.gateway.queue().waiting(), 1);

    drop(waiting);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gw.gateway.queue().waiting(), 0);
    assert_eq!(QueueStats::get(&gw.gateway.queue().stats().abandoned), 1);

    let response = slow.await.unwrap();
    assert!(response.contains("slow"), "{}", response);
    assert_eq!(QueueStats::get(&gw.gateway.queue().stats().promoted), 0);
}

#[tokio::test]
async fn test_upload_cut_off_while_waiting_leaves_line() {
    let gw = start_gateway(1, 1, 5_000).await;
    let addr = gw.addr;

    let slow = tokio::spawn(async move { http_get(addr, "/slow.php").await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Announces a body that never arrives
    let waiting = send_partial(
        addr,
        &format!(
            "POST /echo.php HTTP/1.1\r\nHost: {}\r\nContent-Length: 11\r\n\r\n",
            addr
        ),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gw.gateway.queue().waiting(), 1);

    drop(waiting);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gw.gateway.queue().waiting(), 0);
    assert_eq!(QueueStats::get(&gw.gateway.queue().stats().abandoned), 1);

    slow.await.unwrap();
}

#[tokio::test]
async fn test_body_read_ahead_while_waiting_reaches_script() {
    let gw = start_gateway(1, 1, 5_000).await;
    let addr = gw.addr;

    let slow = tokio::spawn(async move { http_get(addr, "/slow.php").await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = http_request(addr, "POST", "/echo.php", "queued=body").await;
    assert!(status_line(&response).contains("200"), "{}", response);
    assert!(response.contains("queued=body"), "{}", response);
    assert_eq!(QueueStats::get(&gw.gateway.queue().stats().promoted), 1);

    slow.await.unwrap();
}
