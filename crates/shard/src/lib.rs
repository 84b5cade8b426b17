//! 分片所有权、分片引擎与管理接口

pub mod admin;
pub mod context;
pub mod controller;
pub mod engine;

pub use admin::AdminHandler;
pub use context::{OwnershipLost, ShardContextImpl};
pub use controller::{ShardController, ShardHealth, ShardStatus};
pub use engine::{
    Engine, EngineFactory, EngineOptions, EngineResources, HistoryEngine, HistoryEngineFactory,
};
