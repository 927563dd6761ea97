use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::TunnelConfig;
use crate::pump::Direction;

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        // Convert relative path to absolute
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

/// Collect non-fatal findings about a valid configuration
fn config_warnings(config: &TunnelConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    let correction = &config.correction;

    if correction.enabled
        && correction.client_to_upstream.is_empty()
        && correction.upstream_to_client.is_empty()
    {
        warnings.push("Correction is enabled but no triggers are configured".to_string());
    }
    if !correction.enabled
        && (!correction.client_to_upstream.is_empty() || !correction.upstream_to_client.is_empty())
    {
        warnings.push("Triggers are configured but correction is disabled".to_string());
    }
    let same_host = config.upstream.host == config.listen_addr
        || (config.upstream.host == "localhost" && config.listen_addr == "0.0.0.0");
    if same_host && config.upstream.port == config.listen_port {
        warnings.push("Upstream points back at the relay's own listener".to_string());
    }

    warnings
}

fn config_details(config: &TunnelConfig) -> serde_json::Value {
    let mut details = serde_json::json!({
        "listen": config.listen_address(),
        "upstream": format!("{}:{}", config.upstream.host, config.upstream.port),
        "half_close": config.half_close,
        "correction_enabled": config.correction.enabled,
        "client_to_upstream_triggers": config.correction.client_to_upstream.len(),
        "upstream_to_client_triggers": config.correction.upstream_to_client.len(),
    });

    if let Some(ref capture) = config.capture {
        details["capture_dir"] = serde_json::json!(capture.expanded_dir());
        details["capture_client_to_upstream"] =
            serde_json::json!(capture.file_name(Direction::ClientToUpstream));
        details["capture_upstream_to_client"] =
            serde_json::json!(capture.file_name(Direction::UpstreamToClient));
    }

    details
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let path = Path::new(config_path);

    if !path.exists() {
        if format == "json" {
            let result = CheckResult {
                valid: false,
                warnings: vec![],
                error: Some(format!("Configuration file not found: {}", config_path)),
                details: serde_json::json!({}),
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            println!("✗ Configuration file not found: {}", config_path);
        }
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    if format == "text" {
        println!("Checking configuration file: {}\n", config_path);
    }

    match TunnelConfig::load(config_path) {
        Ok(config) => {
            let warnings = config_warnings(&config);

            if format == "json" {
                let result = CheckResult {
                    valid: true,
                    warnings,
                    error: None,
                    details: config_details(&config),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("✓ Listen: {}", config.listen_address());
                println!(
                    "✓ Upstream: {}:{}",
                    config.upstream.host, config.upstream.port
                );
                println!(
                    "✓ Teardown: {}",
                    if config.half_close {
                        "half-close"
                    } else {
                        "close both directions"
                    }
                );

                match config.capture {
                    Some(ref capture) => {
                        println!("✓ Capture directory: {}", capture.expanded_dir().display())
                    }
                    None => println!("✓ Capture: disabled"),
                }

                if config.correction.enabled {
                    println!(
                        "✓ Correction: {} client->upstream / {} upstream->client trigger(s)",
                        config.correction.client_to_upstream.len(),
                        config.correction.upstream_to_client.len()
                    );
                } else {
                    println!("✓ Correction: disabled");
                }

                for warning in &warnings {
                    println!("⚠ Warning: {}", warning);
                }
                println!("\n✓ Configuration is valid!");
            }
            Ok(())
        }
        Err(e) => {
            if format == "json" {
                let result = CheckResult {
                    valid: false,
                    warnings: vec![],
                    error: Some(format!("{:#}", e)),
                    details: serde_json::json!({}),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("✗ Configuration validation failed!");
                println!("\nError details:");
                println!("{:#}", e);
            }

            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_path_absolute() {
        assert_eq!(expand_path("/etc/tunnel.toml").unwrap(), "/etc/tunnel.toml");
    }

    #[test]
    fn test_expand_path_relative() {
        let expanded = expand_path("tunnel.toml").unwrap();
        assert!(Path::new(&expanded).is_absolute());
        assert!(expanded.ends_with("tunnel.toml"));
    }

    #[test]
    fn test_config_warnings() {
        let mut config = TunnelConfig::builder()
            .listen_port(1234)
            .upstream("localhost", 27017)
            .client_trigger("\nREPORT ", '/')
            .build()
            .unwrap();
        assert!(config_warnings(&config).is_empty());

        config.correction.enabled = false;
        assert_eq!(config_warnings(&config).len(), 1);

        config.listen_addr = "localhost".to_string();
        config.upstream.port = 1234;
        assert_eq!(config_warnings(&config).len(), 2);
    }

    #[test]
    fn test_check_missing_file() {
        let missing = std::env::temp_dir().join("pump-tunnel-missing-config.toml");
        assert!(check_config(&missing.to_string_lossy(), "json").is_err());
    }
}
