mod tcp;

pub use tcp::TcpConnector;

use crate::error::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// 双向字节流连接抽象
///
/// 入站连接和上游连接都以该形式交给会话，会话只依赖读、写和关闭
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 Transport
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 只读字节源（泵的输入端）
pub trait ByteSource: AsyncRead + Unpin + Send + 'static {}

impl<T> ByteSource for T where T: AsyncRead + Unpin + Send + 'static {}

/// 只写字节汇（泵的主输出或旁路输出，例如抓包文件）
pub trait ByteSink: AsyncWrite + Unpin + Send + 'static {}

impl<T> ByteSink for T where T: AsyncWrite + Unpin + Send + 'static {}

/// 上游连接工厂
///
/// 每个 broker 实例对应一个固定的上游地址，连接失败不重试
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// 建立一条新的上游连接
    async fn connect(&self) -> Result<Box<dyn Transport>>;

    /// 上游地址（用于日志和错误信息）
    fn target(&self) -> String;
}
