//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use mitm_audit::config::AuditConfig;
use mitm_audit::lifecycle::{self, RunningProxy};

/// A request as the mock origin saw it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub head: String,
    pub body: Vec<u8>,
}

/// Start a programmable mock origin on an ephemeral port.
///
/// The origin reads each request in full (head plus `Content-Length`
/// body), reports it on the returned channel, and answers with whatever
/// `f` produces.
pub async fn start_origin<F, Fut>(f: F) -> (SocketAddr, mpsc::UnboundedReceiver<SeenRequest>)
where
    F: Fn(SeenRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let f = Arc::new(f);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let f = f.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let Some(seen) = read_request(&mut socket).await else {
                    return;
                };
                let _ = tx.send(seen.clone());
                let (status, body) = f(seen).await;
                let status_text = match status {
                    200 => "200 OK",
                    404 => "404 Not Found",
                    500 => "500 Internal Server Error",
                    _ => "200 OK",
                };
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_text,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, rx)
}

/// Origin that always answers 200 with `body`.
pub async fn start_fixed_origin(body: &'static str) -> (SocketAddr, mpsc::UnboundedReceiver<SeenRequest>) {
    start_origin(move |_| async move { (200, body.to_string()) }).await
}

async fn read_request(socket: &mut TcpStream) -> Option<SeenRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Some(SeenRequest { head, body })
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Proxy configuration rooted in `storage`, bound to an ephemeral port.
pub fn test_config(storage: &Path) -> AuditConfig {
    let mut config = AuditConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.storage.base_path = storage.to_path_buf();
    config.timeouts.connect_secs = 2;
    config.timeouts.request_secs = 5;
    config
}

pub async fn start_proxy(config: &AuditConfig) -> RunningProxy {
    lifecycle::start(config).await.expect("proxy should start")
}

/// HTTP client that sends everything through the proxy.
pub fn proxied_client(proxy: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{proxy}")).unwrap())
        .pool_max_idle_per_host(0)
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Split the audit log into records.
pub fn read_records(storage: &Path) -> Vec<String> {
    let log = std::fs::read_to_string(storage.join("log")).unwrap_or_default();
    // A record starts at the beginning of the file or right after a blank line.
    let starts: Vec<usize> = log
        .match_indices("Type: ")
        .map(|(i, _)| i)
        .filter(|&i| i == 0 || log[..i].ends_with("\r\n\r\n"))
        .collect();
    starts
        .iter()
        .enumerate()
        .map(|(n, &start)| {
            let end = starts.get(n + 1).copied().unwrap_or(log.len());
            log[start..end].to_string()
        })
        .collect()
}

/// Value of `Field: value` in a record.
pub fn field<'a>(record: &'a str, name: &str) -> Option<&'a str> {
    record
        .split("\r\n")
        .take_while(|line| !line.is_empty())
        .find_map(|line| line.strip_prefix(name)?.strip_prefix(": "))
}

/// All artifact directories (`<trace>/<transaction>`) under `storage`.
pub fn transaction_dirs(storage: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for trace in std::fs::read_dir(storage).unwrap().flatten() {
        if !trace.path().is_dir() {
            continue;
        }
        for tx in std::fs::read_dir(trace.path()).unwrap().flatten() {
            dirs.push(tx.path());
        }
    }
    dirs
}
