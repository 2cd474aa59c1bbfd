//! 应用层实现。
//!
//! 这里提供实时互动引擎的各个组件：频道租约、限流、在线状态广播、
//! 消息扇出、风控管道和排行榜投影，以及对外部协作方（传输层、
//! 后端存储、远程函数）的抽象。`RealtimeSession` 把它们组装成一个会话。

pub mod clock;
pub mod debounce;
pub mod error;
pub mod health;
pub mod lease;
pub mod local_transport;
pub mod memory_store;
pub mod presence;
pub mod rate_limiter;
pub mod remote;
pub mod repository;
pub mod services;
pub mod session;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use debounce::Debouncer;
pub use error::ApplicationError;
pub use health::{Connectivity, ConnectivityMonitor};
pub use lease::{ChannelLeaseManager, LeaseInfo, ReleaseReport};
pub use local_transport::MemoryTransport;
pub use memory_store::MemoryStore;
pub use presence::{PresenceBoard, PresenceBroadcaster, PresenceSettings, PresenceSnapshot};
pub use rate_limiter::{
    rule_for, RateDecision, RateKey, RateLimitError, RateLimitStore, RateLimiter, RateWindow,
};
pub use remote::{RemoteError, RemoteInvoker};
pub use repository::{
    MentionRepository, MessageCounter, MessageRepository, ReactionRepository, RepositoryError,
    ScoreRepository,
};
pub use services::{
    FraudScore, FraudSettings, FraudSignalPipeline, FraudTrigger, LeaderboardProjector,
    MessageService, MessageServiceDependencies, ProjectionError, RemoteScoringError, Standings,
};
pub use session::{LiveChannel, RealtimeSession, SessionDependencies, SubmitDecision};
pub use transport::{
    ChangeHandler, SubscriptionHandle, SubscriptionRequest, Transport, TransportError,
};
