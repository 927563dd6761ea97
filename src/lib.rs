/// pump-tunnel 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod broker;
pub mod cli;
pub mod config;
pub mod error;
pub mod pump;
pub mod session;
pub mod stats;
pub mod transport;
pub mod window;

// 重新导出常用类型
pub use broker::ConnectionBroker;
pub use config::TunnelConfig;
pub use error::{Result, TunnelError};
pub use pump::{Direction, PumpOutcome, PumpReport, StreamPump, Trigger, TriggerCorrector};
pub use session::{
    DirectionOptions, SessionOptions, SessionReport, SessionState, Teardown, TunnelSession,
};
pub use stats::{RelayStats, RelayStatsSnapshot};
pub use transport::{TcpConnector, Transport, UpstreamConnector};
pub use window::SlidingWindow;
