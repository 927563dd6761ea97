use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "pump-tunnel")]
#[command(author, version, about = "Transparent TCP relay with trigger correction", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行中继
    Run {
        /// 配置文件路径
        #[arg(short, long, default_value = "tunnel.toml")]
        config: String,
    },
    /// 检查配置文件
    Check {
        /// 配置文件路径
        #[arg(short, long, default_value = "tunnel.toml")]
        config: String,

        /// 输出格式 (text, json)
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 生成配置模板
    Template {
        /// 输出文件路径（默认输出到标准输出）
        #[arg(short, long)]
        output: Option<String>,
    },
}
