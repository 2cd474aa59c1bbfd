//! 实时互动引擎的领域模型
//!
//! 包含话题、消息、表情反应、提及、在线状态和排行榜等实体，
//! 以及不依赖任何外部协作方的排序、去重与校验规则。

pub mod entities;
pub mod errors;
pub mod events;
pub mod value_objects;

// 重新导出常用类型
pub use entities::*;
pub use errors::*;
pub use events::*;
pub use value_objects::*;
