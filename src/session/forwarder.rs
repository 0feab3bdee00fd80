//! Loopback forwarder that injects upstream proxy credentials
//!
//! Chrome's `--proxy-server` flag cannot carry credentials, so a session
//! bound to an authenticated proxy points Chrome at a local listener which
//! adds the `Proxy-Authorization` header before handing each connection to
//! the real upstream.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::proxy::ProxyRecord;

/// Local listener ports are taken from 18080..48080, wrapping around.
const PORT_BASE: u32 = 18080;
const PORT_RANGE: u32 = 30000;

static PORT_COUNTER: AtomicU32 = AtomicU32::new(0);

fn allocate_port() -> u16 {
    let offset = PORT_COUNTER.fetch_add(1, Ordering::Relaxed) % PORT_RANGE;
    (PORT_BASE + offset) as u16
}

const MAX_HEADERS: usize = 100;
const MAX_HEADER_LINE: usize = 8192;

/// A running forwarder for one session. Stops when dropped or on `stop`.
pub struct AuthForwarder {
    local_port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    accept_task: JoinHandle<()>,
}

impl AuthForwarder {
    /// Bind a loopback listener and start relaying to the given proxy.
    pub async fn start(record: &ProxyRecord) -> std::io::Result<Self> {
        let mut last_err = None;
        for _ in 0..8 {
            let port = allocate_port();
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => return Ok(Self::spawn(listener, port, record)),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| std::io::Error::other("no free local port")))
    }

    fn spawn(listener: TcpListener, port: u16, record: &ProxyRecord) -> Self {
        let upstream = format!("{}:{}", record.host, record.port);
        let auth = auth_header(
            record.username.as_deref().unwrap_or_default(),
            record.password.as_deref().unwrap_or_default(),
        );
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let accept_task = tokio::spawn(async move {
            debug!("Credential forwarder listening on 127.0.0.1:{}", port);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        let upstream = upstream.clone();
                        let auth = auth.clone();
                        tokio::spawn(async move {
                            if let Err(e) = relay(stream, &upstream, &auth).await {
                                warn!("Forwarder connection failed: {}", e);
                            }
                        });
                    }
                }
            }
            debug!("Credential forwarder on port {} stopped", port);
        });

        Self {
            local_port: port,
            shutdown_tx: Some(shutdown_tx),
            accept_task,
        }
    }

    /// URL Chrome should be pointed at via `--proxy-server`.
    pub fn local_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.local_port)
    }

    pub fn port(&self) -> u16 {
        self.local_port
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.accept_task.abort();
    }
}

impl Drop for AuthForwarder {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.accept_task.abort();
    }
}

fn auth_header(username: &str, password: &str) -> String {
    let encoded =
        base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", username, password));
    format!("Basic {}", encoded)
}

/// Relay one client connection through the authenticated upstream.
async fn relay(
    client: TcpStream,
    upstream_addr: &str,
    auth: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut client = BufReader::new(client);

    let mut request_line = String::new();
    if client.read_line(&mut request_line).await? == 0 {
        return Err("client closed before sending a request".into());
    }

    let mut headers = Vec::new();
    for _ in 0..MAX_HEADERS {
        let mut line = String::with_capacity(128);
        let n = client.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
        if line.len() > MAX_HEADER_LINE {
            return Err("header line too long".into());
        }
        // Drop any auth the client supplied; ours is authoritative
        if !line.to_ascii_lowercase().starts_with("proxy-authorization:") {
            headers.push(line);
        }
    }

    let mut upstream = tokio::time::timeout(
        Duration::from_secs(10),
        TcpStream::connect(upstream_addr),
    )
    .await
    .map_err(|_| format!("timed out connecting to upstream proxy {}", upstream_addr))??;

    let is_connect = request_line.starts_with("CONNECT ");

    let mut head = String::new();
    head.push_str(&request_line);
    head.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    if is_connect {
        if let Some(target) = request_line.split_whitespace().nth(1) {
            head.push_str(&format!("Host: {}\r\n", target));
        }
    } else {
        for header in &headers {
            head.push_str(header);
        }
    }
    head.push_str("\r\n");

    upstream.write_all(head.as_bytes()).await?;
    upstream.flush().await?;

    if is_connect {
        // Wait for the upstream verdict before acknowledging the client
        let mut reader = BufReader::new(&mut upstream);
        let mut status = String::new();
        reader.read_line(&mut status).await?;
        for _ in 0..MAX_HEADERS {
            let mut line = String::with_capacity(128);
            let n = reader.read_line(&mut line).await?;
            if n == 0 || line == "\r\n" || line == "\n" {
                break;
            }
        }

        // Bytes read_line buffered past each header terminator must not be
        // dropped when the readers are unwrapped for splicing
        let upstream_extra = reader.buffer().to_vec();
        drop(reader);
        let client_extra = client.buffer().to_vec();

        let mut client = client.into_inner();
        if !status.contains(" 200") {
            client.write_all(status.as_bytes()).await?;
            client.write_all(b"\r\n").await?;
            client.flush().await?;
            return Err(format!("upstream rejected CONNECT: {}", status.trim()).into());
        }
        client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        if !upstream_extra.is_empty() {
            client.write_all(&upstream_extra).await?;
        }
        client.flush().await?;
        if !client_extra.is_empty() {
            upstream.write_all(&client_extra).await?;
            upstream.flush().await?;
        }

        let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    } else {
        // A request body sent in the same packet as the headers sits in the
        // reader's buffer; forward it before splicing
        let buffered = client.buffer().to_vec();
        let mut client = client.into_inner();
        if !buffered.is_empty() {
            upstream.write_all(&buffered).await?;
            upstream.flush().await?;
        }
        let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use crate::proxy::ProxyScheme;

    #[test]
    fn test_port_allocation_is_unique_and_in_range() {
        let a = allocate_port();
        let b = allocate_port();
        assert_ne!(a, b);
        assert!((a as u32) >= PORT_BASE && (a as u32) < PORT_BASE + PORT_RANGE);
    }

    #[test]
    fn test_auth_header_encoding() {
        // "user:pass" is "dXNlcjpwYXNz" in base64
        assert_eq!(auth_header("user", "pass"), "Basic dXNlcjpwYXNz");
    }

    #[tokio::test]
    async fn test_connect_tunnel_injects_credentials() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();

        // Fake upstream proxy: record the CONNECT headers, ack, then echo
        let upstream_task = tokio::spawn(async move {
            let (stream, _) = upstream.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut lines = Vec::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                if line == "\r\n" {
                    break;
                }
                lines.push(line);
            }
            let mut stream = reader.into_inner();
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            let mut buf = [0u8; 4];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
            lines
        });

        let mut record = ProxyRecord::new("up", ProxyScheme::Http, "127.0.0.1", upstream_port);
        record.username = Some("user".into());
        record.password = Some("pass".into());

        let mut forwarder = AuthForwarder::start(&record).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", forwarder.port()))
            .await
            .unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let mut reader = BufReader::new(&mut client);
        let mut ack = String::new();
        reader.read_line(&mut ack).await.unwrap();
        assert!(ack.contains("200"), "unexpected ack: {}", ack);
        let mut blank = String::new();
        reader.read_line(&mut blank).await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");

        let seen = upstream_task.await.unwrap();
        assert!(
            seen.iter().any(|l| l.starts_with("Proxy-Authorization: Basic dXNlcjpwYXNz")),
            "upstream never saw injected credentials: {:?}",
            seen
        );

        forwarder.stop();
    }

    #[tokio::test]
    async fn test_post_body_in_first_packet_reaches_upstream() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();

        // Fake upstream proxy: read the request head, then exactly the
        // four body bytes the client sent alongside it
        let upstream_task = tokio::spawn(async move {
            let (stream, _) = upstream.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut lines = Vec::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                if line == "\r\n" {
                    break;
                }
                lines.push(line);
            }
            let mut body = [0u8; 4];
            reader.read_exact(&mut body).await.unwrap();
            (lines, body)
        });

        let mut record = ProxyRecord::new("up", ProxyScheme::Http, "127.0.0.1", upstream_port);
        record.username = Some("user".into());
        record.password = Some("pass".into());

        let mut forwarder = AuthForwarder::start(&record).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", forwarder.port()))
            .await
            .unwrap();
        // Head and body in one write, the way Chrome sends small POSTs
        client
            .write_all(
                b"POST http://example.com/submit HTTP/1.1\r\n\
                  Host: example.com\r\n\
                  Content-Length: 4\r\n\r\nping",
            )
            .await
            .unwrap();
        client.flush().await.unwrap();

        let (lines, body) = upstream_task.await.unwrap();
        assert!(
            lines.iter().any(|l| l.starts_with("Proxy-Authorization: Basic")),
            "credentials missing from head: {:?}",
            lines
        );
        assert_eq!(&body, b"ping");

        forwarder.stop();
    }
}
