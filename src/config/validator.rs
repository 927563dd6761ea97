use anyhow::{bail, Context, Result};
use tracing::warn;

use super::{CaptureConfig, CorrectionConfig, TriggerConfig, TunnelConfig, UpstreamConfig};

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证中继配置
    pub fn validate_tunnel_config(config: &TunnelConfig) -> Result<()> {
        Self::validate_address(&config.listen_addr, "listen_addr")?;
        Self::validate_port(config.listen_port, "listen_port")?;
        Self::validate_upstream_config(&config.upstream)?;

        if let Some(ref capture) = config.capture {
            Self::validate_capture_config(capture)?;
        }

        Self::validate_correction_config(&config.correction)?;
        Ok(())
    }

    /// 验证上游配置
    pub fn validate_upstream_config(config: &UpstreamConfig) -> Result<()> {
        Self::validate_address(&config.host, "upstream.host")?;
        Self::validate_port(config.port, "upstream.port")?;

        if config.connect_timeout_ms == Some(0) {
            bail!("upstream.connect_timeout_ms must be greater than 0");
        }
        if config.keepalive_secs == Some(0) {
            bail!("upstream.keepalive_secs must be greater than 0");
        }
        Ok(())
    }

    /// 验证抓包配置
    pub fn validate_capture_config(config: &CaptureConfig) -> Result<()> {
        if config.dir.trim().is_empty() {
            bail!("capture.dir cannot be empty");
        }

        let names = [&config.client_to_upstream, &config.upstream_to_client];
        if names.iter().all(|name| name.is_none()) {
            bail!("capture: at least one of client_to_upstream / upstream_to_client must be set");
        }

        for name in names.into_iter().flatten() {
            if name.trim().is_empty() || name.contains('/') || name.contains('\\') {
                bail!("capture: invalid file name {:?}", name);
            }
        }

        if config.client_to_upstream.is_some()
            && config.client_to_upstream == config.upstream_to_client
        {
            bail!("capture: both directions cannot write to the same file");
        }
        Ok(())
    }

    /// 验证触发修正配置
    pub fn validate_correction_config(config: &CorrectionConfig) -> Result<()> {
        let sets = [
            ("correction.client_to_upstream", &config.client_to_upstream),
            ("correction.upstream_to_client", &config.upstream_to_client),
        ];

        for (context, triggers) in sets {
            for (idx, trigger) in triggers.iter().enumerate() {
                Self::validate_trigger(trigger)
                    .with_context(|| format!("{}[{}]", context, idx))?;
            }
        }

        if config.enabled && config.client_to_upstream.is_empty() && config.upstream_to_client.is_empty()
        {
            warn!("correction is enabled but no triggers are configured");
        }
        Ok(())
    }

    /// 验证单个触发器
    pub fn validate_trigger(trigger: &TriggerConfig) -> Result<()> {
        trigger.to_trigger()?;
        Ok(())
    }
}
