mod fraud_pipeline;
mod leaderboard;
mod message_service;

pub use fraud_pipeline::{
    FraudScore, FraudSettings, FraudSignalPipeline, FraudTrigger, RemoteScoringError,
};
pub use leaderboard::{LeaderboardProjector, ProjectionError, Standings};
pub use message_service::{MessageService, MessageServiceDependencies};
