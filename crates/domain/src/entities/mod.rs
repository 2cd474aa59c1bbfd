//! 领域实体定义

pub mod leaderboard;
pub mod message;
pub mod presence;
pub mod reaction;

pub use leaderboard::*;
pub use message::*;
pub use presence::*;
pub use reaction::*;
