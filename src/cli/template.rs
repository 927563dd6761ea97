use anyhow::{Context, Result};

/// 配置模板内容
pub const TUNNEL_TEMPLATE: &str = include_str!("../../templates/tunnel-template.toml");

/// Generate configuration template
pub fn generate_config_template(output: Option<&str>) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, TUNNEL_TEMPLATE)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!("Generated configuration template: {}", path);
    } else {
        println!("{}", TUNNEL_TEMPLATE);
    }

    Ok(())
}
