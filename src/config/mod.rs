// 配置管理模块 - 使用模块化设计

mod builder;
mod validator;

// 重新导出 builder 和 validator
pub use builder::TunnelConfigBuilder;
pub use validator::ConfigValidator;

use crate::pump::{Direction, Trigger};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_nodelay() -> bool {
    true
}

/// 上游服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// 上游主机名或 IP
    pub host: String,
    /// 上游端口
    pub port: u16,
    /// 连接超时（毫秒，可选）
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// 是否启用 TCP_NODELAY（默认 true）
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
    /// TCP keepalive 空闲时间（秒，可选）
    #[serde(default)]
    pub keepalive_secs: Option<u64>,
}

/// 抓包配置：每个会话每个方向写入一个文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// 抓包目录（支持 ~ 展开）
    pub dir: String,
    /// 客户端 → 上游方向的文件名
    #[serde(default)]
    pub client_to_upstream: Option<String>,
    /// 上游 → 客户端方向的文件名
    #[serde(default)]
    pub upstream_to_client: Option<String>,
}

impl CaptureConfig {
    /// 某个方向配置的文件名
    pub fn file_name(&self, direction: Direction) -> Option<&str> {
        match direction {
            Direction::ClientToUpstream => self.client_to_upstream.as_deref(),
            Direction::UpstreamToClient => self.upstream_to_client.as_deref(),
        }
    }

    /// 展开后的抓包目录
    pub fn expanded_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.dir).as_ref())
    }
}

/// 单个触发器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerConfig {
    /// 触发序列（TOML 字符串，支持 \n 等转义）
    pub sequence: String,
    /// 期望紧随其后的单个字节
    pub continuation: String,
}

impl TriggerConfig {
    pub fn new(sequence: impl Into<String>, continuation: impl Into<String>) -> Self {
        Self {
            sequence: sequence.into(),
            continuation: continuation.into(),
        }
    }

    /// 转换为运行时触发器
    pub fn to_trigger(&self) -> crate::Result<Trigger> {
        let continuation = match self.continuation.as_bytes() {
            [byte] => *byte,
            _ => {
                return Err(crate::TunnelError::invalid_trigger(format!(
                    "continuation must be exactly one byte, got {:?}",
                    self.continuation
                )))
            }
        };
        Trigger::new(self.sequence.as_bytes(), continuation)
    }
}

/// 触发修正配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrectionConfig {
    /// 总开关（默认关闭）
    #[serde(default)]
    pub enabled: bool,
    /// 客户端 → 上游方向的触发器
    #[serde(default)]
    pub client_to_upstream: Vec<TriggerConfig>,
    /// 上游 → 客户端方向的触发器
    #[serde(default)]
    pub upstream_to_client: Vec<TriggerConfig>,
}

impl CorrectionConfig {
    /// 某个方向实际生效的触发器；总开关关闭时为空
    pub fn triggers(&self, direction: Direction) -> crate::Result<Vec<Trigger>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        let configs = match direction {
            Direction::ClientToUpstream => &self.client_to_upstream,
            Direction::UpstreamToClient => &self.upstream_to_client,
        };
        configs.iter().map(TriggerConfig::to_trigger).collect()
    }
}

/// 中继配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// 监听地址
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// 监听端口
    pub listen_port: u16,
    /// 一个方向正常结束时只半关闭（默认 false：任一方向结束即拆除会话）
    #[serde(default)]
    pub half_close: bool,
    /// 上游服务
    pub upstream: UpstreamConfig,
    /// 抓包（可选）
    #[serde(default)]
    pub capture: Option<CaptureConfig>,
    /// 触发修正
    #[serde(default)]
    pub correction: CorrectionConfig,
}

impl TunnelConfig {
    /// 创建 Builder
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::new()
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_tunnel_config(self)
    }

    /// 监听地址 `addr:port`
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }

    /// 从 TOML 字符串解析并验证
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: TunnelConfig =
            toml::from_str(content).context("Failed to parse tunnel configuration")?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    /// 从文件加载配置
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path))?;
        Self::from_toml(&content)
    }
}
