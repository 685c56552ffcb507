//! 约简作业调度
//!
//! 接收待处理队列中的作业, 经过取消检查、实验级去重和作业校验后
//! 交给执行器运行, 并把状态发布到 started/complete/error 队列。

pub mod admission;
pub mod dispatcher;
pub mod retry_service;
pub mod validator;

pub use admission::{AdmissionSlot, CancelSet, DedupRegistry};
pub use dispatcher::Dispatcher;
pub use retry_service::{RetryOverrides, RetryService};
pub use validator::{BeamCurrentProbe, CommandBeamCurrentProbe, JobValidator};

/// 被用户取消的运行的最终消息
pub const CANCELLED_MESSAGE: &str = "Run cancelled by user";
