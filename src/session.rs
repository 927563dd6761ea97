/// 隧道会话
///
/// 一个入站连接对应一个上游连接和两个方向的字节泵，两者作为一个整体管理生命周期
use crate::error::{Result, TunnelError};
use crate::pump::{Direction, PumpOutcome, PumpReport, StreamPump, Trigger};
use crate::transport::{ByteSink, ByteSource, Transport, UpstreamConnector};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 会话状态：`Connecting -> Active -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 正在连接上游
    Connecting,
    /// 两个方向都在转发
    Active,
    /// 终态
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// 会话的一次性拆除开关
///
/// 任一方向失败时触发，另一方向随之停止；重复调用 `close` 不会重复关闭。
#[derive(Debug, Default)]
pub struct Teardown {
    closed: AtomicBool,
    token: CancellationToken,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    /// 拆除会话；只有第一次调用返回 true
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.token.cancel();
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 等待会话被拆除
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// 泵任务 panic 时拆除会话，避免另一方向永远挂起
struct TeardownOnPanic(Arc<Teardown>);

impl Drop for TeardownOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.close();
        }
    }
}

/// 单个方向的选项
#[derive(Default)]
pub struct DirectionOptions {
    /// 触发器列表，为空表示关闭修正
    pub triggers: Vec<Trigger>,
    /// 旁路输出（例如抓包文件），必须在会话开始前打开
    pub capture: Option<Box<dyn ByteSink>>,
}

impl fmt::Debug for DirectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectionOptions")
            .field("triggers", &self.triggers)
            .field("capture", &self.capture.is_some())
            .finish()
    }
}

/// 会话选项，在创建会话时由外部提供
#[derive(Debug, Default)]
pub struct SessionOptions {
    pub client_to_upstream: DirectionOptions,
    pub upstream_to_client: DirectionOptions,
    /// 为 true 时一个方向正常结束只向对端发送 FIN，另一方向继续转发
    pub half_close: bool,
}

/// 会话结束后的汇总
#[derive(Debug)]
pub struct SessionReport {
    pub id: Uuid,
    pub client_to_upstream: PumpReport,
    pub upstream_to_client: PumpReport,
}

impl SessionReport {
    pub fn corrections(&self) -> u64 {
        self.client_to_upstream.corrections + self.upstream_to_client.corrections
    }
}

/// 一个入站连接及其上游连接
pub struct TunnelSession {
    id: Uuid,
    state: SessionState,
    inbound: Option<Box<dyn Transport>>,
    options: Option<SessionOptions>,
    teardown: Arc<Teardown>,
}

impl TunnelSession {
    pub fn new<T: Transport>(inbound: T, options: SessionOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Connecting,
            inbound: Some(Box::new(inbound)),
            options: Some(options),
            teardown: Arc::new(Teardown::new()),
        }
    }

    /// 使用外部分配的会话 ID（例如与抓包文件名保持一致）
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 会话的拆除开关，外部可借此提前结束会话
    pub fn teardown(&self) -> Arc<Teardown> {
        self.teardown.clone()
    }

    fn already_started(&self) -> TunnelError {
        TunnelError::Other(anyhow::anyhow!("session {} already started", self.id))
    }

    fn set_state(&mut self, state: SessionState) {
        debug!(session = %self.id, "Session state {} -> {}", self.state, state);
        self.state = state;
    }

    /// 连接上游并转发，直到两个方向都结束
    ///
    /// 上游连接失败时关闭入站连接并返回错误，不会启动任何方向。
    pub async fn run(&mut self, connector: &dyn UpstreamConnector) -> Result<SessionReport> {
        let mut inbound = self.inbound.take().ok_or_else(|| self.already_started())?;
        let options = self.options.take().ok_or_else(|| self.already_started())?;

        let upstream = match connector.connect().await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(
                    session = %self.id,
                    "Failed to open upstream {}: {}",
                    connector.target(),
                    e
                );
                if let Err(close_err) = inbound.shutdown().await {
                    debug!(session = %self.id, "Failed to close inbound connection: {}", close_err);
                }
                drop(inbound);
                self.teardown.close();
                self.set_state(SessionState::Closed);
                return Err(e);
            }
        };

        info!(session = %self.id, "Relaying to {}", connector.target());

        let (inbound_read, inbound_write) = tokio::io::split(inbound);
        let (upstream_read, upstream_write) = tokio::io::split(upstream);
        let close_on_eof = !options.half_close;

        let pumps = self
            .build_pump(
                Direction::ClientToUpstream,
                inbound_read,
                upstream_write,
                options.client_to_upstream,
                close_on_eof,
            )
            .and_then(|to_upstream| {
                self.build_pump(
                    Direction::UpstreamToClient,
                    upstream_read,
                    inbound_write,
                    options.upstream_to_client,
                    close_on_eof,
                )
                .map(|to_client| (to_upstream, to_client))
            });
        let (to_upstream, to_client) = match pumps {
            Ok(pumps) => pumps,
            Err(e) => {
                self.teardown.close();
                self.set_state(SessionState::Closed);
                return Err(e);
            }
        };

        self.set_state(SessionState::Active);
        let up = self.spawn_pump(to_upstream);
        let down = self.spawn_pump(to_client);
        let (up, down) = tokio::join!(up, down);

        let report = SessionReport {
            id: self.id,
            client_to_upstream: self.collect(Direction::ClientToUpstream, up),
            upstream_to_client: self.collect(Direction::UpstreamToClient, down),
        };

        if self.teardown.close() {
            debug!(session = %self.id, "Both directions finished");
        }
        self.set_state(SessionState::Closed);

        info!(
            session = %self.id,
            "Session closed: {} bytes from client, {} bytes from upstream, {} correction(s)",
            report.client_to_upstream.bytes_read,
            report.upstream_to_client.bytes_read,
            report.corrections()
        );

        Ok(report)
    }

    fn build_pump<S, W>(
        &self,
        direction: Direction,
        source: S,
        primary: W,
        options: DirectionOptions,
        close_on_eof: bool,
    ) -> Result<StreamPump>
    where
        S: ByteSource,
        W: ByteSink,
    {
        let mut pump = StreamPump::new(direction, source, primary, self.teardown.clone())
            .with_triggers(&options.triggers)?
            .close_on_eof(close_on_eof);
        if let Some(capture) = options.capture {
            pump = pump.with_secondary(capture);
        }
        if !options.triggers.is_empty() {
            debug!(
                session = %self.id,
                direction = %direction,
                "Trigger correction enabled with {} trigger(s)",
                options.triggers.len()
            );
        }
        Ok(pump)
    }

    fn spawn_pump(&self, pump: StreamPump) -> tokio::task::JoinHandle<PumpReport> {
        let guard = TeardownOnPanic(self.teardown.clone());
        tokio::spawn(async move {
            let _guard = guard;
            pump.run().await
        })
    }

    fn collect(
        &self,
        direction: Direction,
        joined: std::result::Result<PumpReport, JoinError>,
    ) -> PumpReport {
        match joined {
            Ok(report) => {
                if let PumpOutcome::Failed(ref e) = report.outcome {
                    warn!(session = %self.id, direction = %direction, "Relay failed: {}", e);
                }
                report
            }
            Err(e) => {
                error!(session = %self.id, direction = %direction, "Pump task failed: {}", e);
                PumpReport {
                    direction,
                    outcome: PumpOutcome::Aborted,
                    bytes_read: 0,
                    bytes_written: 0,
                    corrections: 0,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};

    /// 只能连接一次的内存上游
    struct StaticConnector {
        stream: Mutex<Option<DuplexStream>>,
    }

    impl StaticConnector {
        fn new(stream: DuplexStream) -> Self {
            Self {
                stream: Mutex::new(Some(stream)),
            }
        }

        fn refusing() -> Self {
            Self {
                stream: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl UpstreamConnector for StaticConnector {
        async fn connect(&self) -> Result<Box<dyn Transport>> {
            let stream = self.stream.lock().unwrap().take().ok_or_else(|| {
                TunnelError::connection_failed(
                    self.target(),
                    io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
                )
            })?;
            Ok(Box::new(stream))
        }

        fn target(&self) -> String {
            "memory:0".to_string()
        }
    }

    /// 统计 shutdown 次数的入站连接
    struct CountingStream {
        inner: DuplexStream,
        shutdowns: Arc<AtomicUsize>,
    }

    impl AsyncRead for CountingStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for CountingStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<io::Result<()>> {
            let result = Pin::new(&mut self.inner).poll_shutdown(cx);
            if result.is_ready() {
                self.shutdowns.fetch_add(1, Ordering::SeqCst);
            }
            result
        }
    }

    fn report_trigger() -> Trigger {
        Trigger::new(&b"\nREPORT "[..], b'/').unwrap()
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let teardown = Teardown::new();
        assert!(!teardown.is_closed());
        assert!(teardown.close());
        assert!(!teardown.close());
        assert!(teardown.is_closed());
    }

    #[tokio::test]
    async fn test_connect_failure_closes_inbound_once() {
        let (mut client, inbound) = tokio::io::duplex(1024);
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let inbound = CountingStream {
            inner: inbound,
            shutdowns: shutdowns.clone(),
        };

        let mut session = TunnelSession::new(inbound, SessionOptions::default());
        assert_eq!(session.state(), SessionState::Connecting);

        let err = session
            .run(&StaticConnector::refusing())
            .await
            .unwrap_err();
        assert!(err.is_connect_failure());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(session.teardown().is_closed());

        // 客户端看到连接结束
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let (_client, inbound) = tokio::io::duplex(64);
        let mut session = TunnelSession::new(inbound, SessionOptions::default());
        assert!(session.run(&StaticConnector::refusing()).await.is_err());
        let err = session
            .run(&StaticConnector::refusing())
            .await
            .unwrap_err();
        assert!(!err.is_connect_failure());
    }

    #[tokio::test]
    async fn test_relay_with_correction() {
        let (client, inbound) = tokio::io::duplex(4096);
        let (mut upstream_peer, upstream_end) = tokio::io::duplex(4096);
        let connector = StaticConnector::new(upstream_end);

        let options = SessionOptions {
            client_to_upstream: DirectionOptions {
                triggers: vec![report_trigger()],
                capture: None,
            },
            ..Default::default()
        };
        let id = Uuid::new_v4();
        let mut session = TunnelSession::new(inbound, options).with_id(id);
        let handle = tokio::spawn(async move {
            let result = session.run(&connector).await;
            (session, result)
        });

        let (mut client_r, mut client_w) = tokio::io::split(client);
        client_w.write_all(b"xx\nREPORT Xrest").await.unwrap();

        let mut forwarded = vec![0u8; 16];
        upstream_peer.read_exact(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, b"xx\nREPORT /Xrest");

        upstream_peer.write_all(b"HTTP/1.1 207\r\n").await.unwrap();
        let mut reply = vec![0u8; 14];
        client_r.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, b"HTTP/1.1 207\r\n");

        client_w.shutdown().await.unwrap();

        let (session, result) = handle.await.unwrap();
        let report = result.unwrap();
        assert_eq!(report.id, id);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            report.client_to_upstream.outcome,
            PumpOutcome::EndOfStream
        ));
        assert_eq!(report.client_to_upstream.bytes_read, 15);
        assert_eq!(report.client_to_upstream.bytes_written, 16);
        assert_eq!(report.upstream_to_client.bytes_read, 14);
        assert_eq!(report.corrections(), 1);

        // 两端都被关闭
        let mut rest = Vec::new();
        upstream_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        client_r.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_half_close_lets_reply_through() {
        let (client, inbound) = tokio::io::duplex(4096);
        let (mut upstream_peer, upstream_end) = tokio::io::duplex(4096);
        let connector = StaticConnector::new(upstream_end);

        let options = SessionOptions {
            half_close: true,
            ..Default::default()
        };
        let mut session = TunnelSession::new(inbound, options);
        let handle = tokio::spawn(async move { session.run(&connector).await });

        let (mut client_r, mut client_w) = tokio::io::split(client);
        client_w.write_all(b"request").await.unwrap();
        client_w.shutdown().await.unwrap();

        let mut request = Vec::new();
        upstream_peer.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        upstream_peer.write_all(b"late reply").await.unwrap();
        upstream_peer.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client_r.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"late reply");

        let report = handle.await.unwrap().unwrap();
        assert!(matches!(
            report.upstream_to_client.outcome,
            PumpOutcome::EndOfStream
        ));
    }

    #[tokio::test]
    async fn test_capture_receives_both_directions() {
        let (client, inbound) = tokio::io::duplex(4096);
        let (mut upstream_peer, upstream_end) = tokio::io::duplex(4096);
        let (capture_up, mut capture_up_reader) = tokio::io::duplex(4096);
        let (capture_down, mut capture_down_reader) = tokio::io::duplex(4096);
        let connector = StaticConnector::new(upstream_end);

        let options = SessionOptions {
            client_to_upstream: DirectionOptions {
                triggers: vec![report_trigger()],
                capture: Some(Box::new(capture_up)),
            },
            upstream_to_client: DirectionOptions {
                triggers: Vec::new(),
                capture: Some(Box::new(capture_down)),
            },
            half_close: false,
        };
        let mut session = TunnelSession::new(inbound, options);
        let handle = tokio::spawn(async move { session.run(&connector).await });

        let (mut client_r, mut client_w) = tokio::io::split(client);
        client_w.write_all(b"\nREPORT x").await.unwrap();
        let mut forwarded = vec![0u8; 10];
        upstream_peer.read_exact(&mut forwarded).await.unwrap();

        upstream_peer.write_all(b"ok").await.unwrap();
        let mut reply = vec![0u8; 2];
        client_r.read_exact(&mut reply).await.unwrap();

        // 上游断开后整个会话被拆除
        drop(upstream_peer);
        handle.await.unwrap().unwrap();

        let mut captured = Vec::new();
        capture_up_reader.read_to_end(&mut captured).await.unwrap();
        assert_eq!(captured, b"\nREPORT /x");

        let mut captured = Vec::new();
        capture_down_reader.read_to_end(&mut captured).await.unwrap();
        assert_eq!(captured, b"ok");
    }

    #[tokio::test]
    async fn test_client_eof_stops_blocked_reply() {
        // 客户端不再读取，回复卡在写入中；客户端 FIN 后会话仍需结束
        let (mut client, inbound) = tokio::io::duplex(64);
        let (mut upstream_peer, upstream_end) = tokio::io::duplex(8192);
        let connector = StaticConnector::new(upstream_end);

        let mut session = TunnelSession::new(inbound, SessionOptions::default());
        let teardown = session.teardown();
        let handle = tokio::spawn(async move { session.run(&connector).await });

        upstream_peer.write_all(&[b'r'; 4096]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        client.shutdown().await.unwrap();

        let report = tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("session did not finish after teardown")
            .unwrap()
            .unwrap();
        assert!(teardown.is_closed());
        assert!(matches!(
            report.client_to_upstream.outcome,
            PumpOutcome::EndOfStream
        ));
        assert!(matches!(
            report.upstream_to_client.outcome,
            PumpOutcome::Aborted
        ));
        assert_eq!(report.upstream_to_client.bytes_read, 4096);
    }
}
