/// Common utilities for integration tests
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::time::timeout;

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Unique temporary directory for capture files
pub fn temp_capture_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "pump-tunnel-{}-{}-{}",
        tag,
        std::process::id(),
        uuid::Uuid::new_v4()
    ))
}

/// Create a simple echo server for testing
pub async fn start_echo_server(port: u16) -> tokio::task::JoinHandle<()> {
    let listener = TokioTcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind echo server");

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 8192];
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) => break, // Connection closed
                                Ok(n) => {
                                    if socket.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    })
}

/// Upstream that records everything it receives and replies once the client half-closes
pub async fn start_recording_server(
    port: u16,
    reply: &'static [u8],
) -> (Arc<Mutex<Vec<u8>>>, tokio::task::JoinHandle<()>) {
    let listener = TokioTcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind recording server");
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();

    let handle = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => sink.lock().unwrap().extend_from_slice(&buf[..n]),
                        Err(_) => return,
                    }
                }
                let _ = socket.write_all(reply).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (received, handle)
}

/// Send `data` through the relay and read back `expected_len` bytes
pub async fn exchange(
    relay_port: u16,
    data: &[u8],
    expected_len: usize,
    timeout_duration: Duration,
) -> Result<Vec<u8>, String> {
    timeout(timeout_duration, async {
        let mut stream = TcpStream::connect(format!("127.0.0.1:{}", relay_port))
            .await
            .map_err(|e| format!("Failed to connect to relay: {}", e))?;

        stream
            .write_all(data)
            .await
            .map_err(|e| format!("Failed to write data: {}", e))?;

        let mut response = Vec::new();
        let mut buf = vec![0u8; 8192];

        while response.len() < expected_len {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&buf[..n]),
                Err(e) => return Err(format!("Failed to read response: {}", e)),
            }
        }

        Ok(response)
    })
    .await
    .map_err(|_| "Timeout waiting for response".to_string())?
}

/// Poll `check` until it returns true or the attempts run out
pub async fn wait_until<F>(mut check: F, max_attempts: u32) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..max_attempts {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

/// Removes a temporary directory on drop
pub struct TestCleanup {
    dir: Option<PathBuf>,
}

impl TestCleanup {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir: Some(dir) }
    }
}

impl Drop for TestCleanup {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
