use std::sync::Arc;

use db::DBService;
use services::services::approvals::ApprovalService;

pub mod error;
pub mod routes;

#[derive(Clone)]
pub struct AppState {
    db: DBService,
    approvals: Arc<ApprovalService>,
}

impl AppState {
    pub fn new(db: DBService, approvals: Arc<ApprovalService>) -> Self {
        Self { db, approvals }
    }

    pub fn db(&self) -> &DBService {
        &self.db
    }

    pub fn approvals(&self) -> &ApprovalService {
        &self.approvals
    }
}
