// Brokerage connectivity: REST session, live bar feed, request pacing.

pub mod rate_limit;
pub mod session;

pub use rate_limit::RequestPacer;
pub use session::{BrokerError, BrokerSession, OrderAck, OrderInstruction};
