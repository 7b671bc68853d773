//! Application state shared across request handlers.

use std::sync::Arc;

use crate::service::Broker;

/// Shared application state, passed to handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    broker: Broker,
}

impl AppState {
    pub fn new(broker: Broker) -> Self {
        Self {
            inner: Arc::new(AppStateInner { broker }),
        }
    }

    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }
}
