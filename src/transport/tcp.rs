use super::{Transport, UpstreamConnector};
use crate::config::UpstreamConfig;
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// 直连 TCP 上游
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Option<Duration>,
    nodelay: bool,
    keepalive: Option<Duration>,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: None,
            nodelay: true,
            keepalive: None,
        }
    }

    /// 根据上游配置创建
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            connect_timeout: config.connect_timeout_ms.map(Duration::from_millis),
            nodelay: config.nodelay,
            keepalive: config.keepalive_secs.map(Duration::from_secs),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_keepalive(mut self, time: Duration) -> Self {
        self.keepalive = Some(time);
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    fn apply_socket_options(&self, stream: &TcpStream) {
        if self.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY on upstream connection: {}", e);
            }
        }

        if let Some(time) = self.keepalive {
            let keepalive = TcpKeepalive::new().with_time(time);
            let sock_ref = SockRef::from(stream);
            if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
                warn!(
                    "Failed to set TCP keepalive on {}: {}",
                    self.target(),
                    e
                );
            }
        }
    }
}

#[async_trait]
impl UpstreamConnector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let addr = self.target();
        debug!("Connecting to upstream {}", addr);

        let connecting = TcpStream::connect(addr.as_str());
        let stream = match self.connect_timeout {
            Some(duration) => tokio::time::timeout(duration, connecting)
                .await
                .map_err(|_| TunnelError::timeout(duration))?,
            None => connecting.await,
        }
        .map_err(|e| TunnelError::connection_failed(addr.as_str(), e))?;

        self.apply_socket_options(&stream);

        debug!("Upstream connection established to {}", addr);
        Ok(Box::new(stream))
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
