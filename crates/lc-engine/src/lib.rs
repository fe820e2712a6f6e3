//! LeadCadence worker engine
//!
//! Worker pools over the delayed queues (send, followup, analytics), the
//! outbound gateway client, and the background recovery pollers.

pub mod analytics_worker;
pub mod followup_worker;
pub mod gateway;
pub mod pool;
pub mod recovery;
pub mod send_worker;

pub use analytics_worker::AnalyticsWorker;
pub use followup_worker::FollowupWorker;
pub use gateway::{
    EmailGateway, GatewayError, GatewaySendResult, HttpEmailGateway, HttpGatewayConfig,
    SendEmailRequest,
};
pub use pool::{Disposition, JobProcessor, PoolConfig, WorkerPool};
pub use recovery::{RecoveryConfig, RecoveryPoller};
pub use send_worker::SendWorker;
