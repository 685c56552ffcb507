//! 配置管理
//!
//! 默认值、TOML 配置文件与 `AUTOREDUCE_` 前缀的环境变量分层合并，
//! 每个配置段都提供 `validate` 方法，在启动阶段拒绝无效配置。

pub mod models;

pub use models::*;
