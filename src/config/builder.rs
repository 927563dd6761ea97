use anyhow::{Context, Result};

use super::{
    validator::ConfigValidator, CaptureConfig, CorrectionConfig, TriggerConfig, TunnelConfig,
    UpstreamConfig,
};

/// TunnelConfig Builder
#[derive(Debug, Default)]
pub struct TunnelConfigBuilder {
    listen_addr: Option<String>,
    listen_port: Option<u16>,
    half_close: bool,
    upstream_host: Option<String>,
    upstream_port: Option<u16>,
    connect_timeout_ms: Option<u64>,
    keepalive_secs: Option<u64>,
    capture: Option<CaptureConfig>,
    correction: CorrectionConfig,
}

impl TunnelConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置监听地址
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// 设置监听端口
    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// 设置上游地址
    pub fn upstream(mut self, host: impl Into<String>, port: u16) -> Self {
        self.upstream_host = Some(host.into());
        self.upstream_port = Some(port);
        self
    }

    /// 设置上游连接超时
    pub fn connect_timeout_ms(mut self, timeout: u64) -> Self {
        self.connect_timeout_ms = Some(timeout);
        self
    }

    /// 设置上游 keepalive
    pub fn keepalive_secs(mut self, secs: u64) -> Self {
        self.keepalive_secs = Some(secs);
        self
    }

    /// 设置是否半关闭
    pub fn half_close(mut self, half_close: bool) -> Self {
        self.half_close = half_close;
        self
    }

    /// 设置抓包目录和文件名
    pub fn capture(
        mut self,
        dir: impl Into<String>,
        client_to_upstream: Option<&str>,
        upstream_to_client: Option<&str>,
    ) -> Self {
        self.capture = Some(CaptureConfig {
            dir: dir.into(),
            client_to_upstream: client_to_upstream.map(str::to_string),
            upstream_to_client: upstream_to_client.map(str::to_string),
        });
        self
    }

    /// 添加客户端 → 上游方向的触发器，并打开修正开关
    pub fn client_trigger(mut self, sequence: impl Into<String>, continuation: char) -> Self {
        self.correction.enabled = true;
        self.correction
            .client_to_upstream
            .push(TriggerConfig::new(sequence, continuation.to_string()));
        self
    }

    /// 添加上游 → 客户端方向的触发器，并打开修正开关
    pub fn upstream_trigger(mut self, sequence: impl Into<String>, continuation: char) -> Self {
        self.correction.enabled = true;
        self.correction
            .upstream_to_client
            .push(TriggerConfig::new(sequence, continuation.to_string()));
        self
    }

    /// 构建 TunnelConfig 并验证
    pub fn build(self) -> Result<TunnelConfig> {
        let config = TunnelConfig {
            listen_addr: self.listen_addr.unwrap_or_else(|| "127.0.0.1".to_string()),
            listen_port: self.listen_port.context("listen_port is required")?,
            half_close: self.half_close,
            upstream: UpstreamConfig {
                host: self.upstream_host.context("upstream host is required")?,
                port: self.upstream_port.context("upstream port is required")?,
                connect_timeout_ms: self.connect_timeout_ms,
                nodelay: true,
                keepalive_secs: self.keepalive_secs,
            },
            capture: self.capture,
            correction: self.correction,
        };

        // 验证配置
        ConfigValidator::validate_tunnel_config(&config)?;

        Ok(config)
    }
}
