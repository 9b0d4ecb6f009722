//! Shared application state for the HTTP surface.

use crate::scheduler::Scheduler;
use std::sync::Arc;

/// Handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}
