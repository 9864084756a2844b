//! 虚拟桌面连接代理的后台任务管理器
//!
//! 二进制入口只负责解析参数、初始化日志与指标，实际的装配逻辑位于 [`app::Application`]。

pub mod app;
pub mod providers;
pub mod shutdown;
pub mod supervisor;

pub use app::Application;
pub use shutdown::ShutdownManager;
pub use supervisor::Supervisor;
