/// 连接分发
///
/// 监听入站端口，每个连接创建一个会话，并根据配置准备抓包文件和触发器
use crate::config::{CaptureConfig, TunnelConfig};
use crate::pump::Direction;
use crate::session::{SessionOptions, TunnelSession};
use crate::stats::RelayStats;
use crate::transport::{ByteSink, TcpConnector, UpstreamConnector};
use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 入站连接分发器
pub struct ConnectionBroker {
    listener: TcpListener,
    config: Arc<TunnelConfig>,
    connector: Arc<dyn UpstreamConnector>,
    stats: RelayStats,
}

impl ConnectionBroker {
    /// 绑定监听端口，上游使用配置中的 TCP 地址
    pub async fn bind(config: TunnelConfig, stats: RelayStats) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_address())
            .await
            .with_context(|| format!("Failed to bind listener on {}", config.listen_address()))?;
        let connector = Arc::new(TcpConnector::from_config(&config.upstream));

        Ok(Self {
            listener,
            config: Arc::new(config),
            connector,
            stats,
        })
    }

    /// 替换上游连接工厂
    pub fn with_connector(mut self, connector: Arc<dyn UpstreamConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.clone()
    }

    /// 一直运行接收循环
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// 运行接收循环直到 `shutdown` 完成；已建立的会话继续运行
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            "Relaying {} -> {}",
            self.local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| self.config.listen_address()),
            self.connector.target()
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Listener shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((inbound, peer_addr)) => self.dispatch(inbound, peer_addr),
                    Err(e) => error!("Accept error: {}", e),
                },
            }
        }

        Ok(())
    }

    fn dispatch(&self, inbound: TcpStream, peer_addr: SocketAddr) {
        let config = self.config.clone();
        let connector = self.connector.clone();
        let stats = self.stats.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(inbound, peer_addr, config, connector, stats).await {
                error!("Session from {} failed: {:#}", peer_addr, e);
            }
        });
    }
}

/// 处理一个入站连接
async fn handle_connection(
    mut inbound: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<TunnelConfig>,
    connector: Arc<dyn UpstreamConnector>,
    stats: RelayStats,
) -> Result<()> {
    if config.upstream.nodelay {
        if let Err(e) = inbound.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for inbound connection: {}", e);
        }
    }

    let _guard = stats.session_started();
    let id = Uuid::new_v4();
    info!(session = %id, "Accepted connection from {}", peer_addr);

    let options = match session_options(&config, id).await {
        Ok(options) => options,
        Err(e) => {
            if let Err(close_err) = inbound.shutdown().await {
                debug!(session = %id, "Failed to close inbound connection: {}", close_err);
            }
            return Err(e.context(format!("Failed to prepare session {}", id)));
        }
    };

    let mut session = TunnelSession::new(inbound, options).with_id(id);
    match session.run(connector.as_ref()).await {
        Ok(report) => {
            stats.record_pump(&report.client_to_upstream);
            stats.record_pump(&report.upstream_to_client);
            if let Ok(snapshot) = serde_json::to_string(&stats.snapshot()) {
                debug!("Relay stats: {}", snapshot);
            }
            Ok(())
        }
        Err(e) => {
            if e.is_connect_failure() {
                stats.connect_failed();
            }
            Err(e.into())
        }
    }
}

/// 根据配置构建会话选项，抓包文件在此打开
pub async fn session_options(config: &TunnelConfig, id: Uuid) -> Result<SessionOptions> {
    let mut options = SessionOptions {
        half_close: config.half_close,
        ..Default::default()
    };

    options.client_to_upstream.triggers = config
        .correction
        .triggers(Direction::ClientToUpstream)?;
    options.upstream_to_client.triggers = config
        .correction
        .triggers(Direction::UpstreamToClient)?;

    if let Some(ref capture) = config.capture {
        options.client_to_upstream.capture =
            open_capture(capture, Direction::ClientToUpstream, id).await?;
        options.upstream_to_client.capture =
            match open_capture(capture, Direction::UpstreamToClient, id).await {
                Ok(sink) => sink,
                Err(e) => {
                    // 已创建的另一方向文件不再保留
                    if options.client_to_upstream.capture.take().is_some() {
                        discard_capture(capture, Direction::ClientToUpstream, id).await;
                    }
                    return Err(e);
                }
            };
    }

    Ok(options)
}

/// 某个会话某个方向的抓包文件路径：`<dir>/<session-id>-<name>`
pub fn capture_path(capture: &CaptureConfig, direction: Direction, id: Uuid) -> Option<PathBuf> {
    capture
        .file_name(direction)
        .map(|name| capture.expanded_dir().join(format!("{}-{}", id, name)))
}

async fn open_capture(
    capture: &CaptureConfig,
    direction: Direction,
    id: Uuid,
) -> Result<Option<Box<dyn ByteSink>>> {
    let Some(path) = capture_path(capture, direction, id) else {
        return Ok(None);
    };

    let dir = capture.expanded_dir();
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create capture directory {}", dir.display()))?;
    let file = tokio::fs::File::create(&path)
        .await
        .with_context(|| format!("Failed to create capture file {}", path.display()))?;

    debug!(session = %id, "Capturing {} to {}", direction, path.display());
    Ok(Some(Box::new(file)))
}

async fn discard_capture(capture: &CaptureConfig, direction: Direction, id: Uuid) {
    if let Some(path) = capture_path(capture, direction, id) {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!(session = %id, "Failed to remove capture file {}: {}", path.display(), e);
        }
    }
}
