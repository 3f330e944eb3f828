//! HTTP edge of the relay
//!
//! The chat gateway posts inbound messages and option presses here; the
//! video and speech backends post their webhooks; the payment gateway posts
//! successful charges.

mod handlers;
mod types;

pub use handlers::create_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::runtime::RelayRuntime;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RelayRuntime>,
}

impl AppState {
    pub fn new(runtime: Arc<RelayRuntime>) -> Self {
        Self { runtime }
    }
}
