pub mod adapter;
pub mod circuit;
pub mod live;
pub mod paper;
pub mod resilient;

use crate::model::UserRecord;
use adapter::BrokerPort;
use std::sync::Arc;

/// Selects the backend for a user: paper simulator or live venue. Two
/// independent implementations behind one interface — no hierarchy beyond
/// the port contract.
pub struct BrokerRegistry {
    paper: Arc<dyn BrokerPort>,
    live: Arc<dyn BrokerPort>,
}

impl BrokerRegistry {
    pub fn new(paper: Arc<dyn BrokerPort>, live: Arc<dyn BrokerPort>) -> Self {
        Self { paper, live }
    }

    pub fn for_user(&self, user: &UserRecord) -> Arc<dyn BrokerPort> {
        if user.is_paper {
            self.paper.clone()
        } else {
            self.live.clone()
        }
    }

    /// Fallback backend when a user record is missing: the simulator, never
    /// the live venue.
    pub fn paper(&self) -> Arc<dyn BrokerPort> {
        self.paper.clone()
    }
}
