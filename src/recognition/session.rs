//! Session cookie for the remote scanning endpoint.
//!
//! Created once at startup and handed to the backends that need it; cleared on
//! logout. Cheap to clone, all clones share the same cookie.

use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Default)]
pub struct SessionCookie {
    inner: Arc<RwLock<Option<String>>>,
}

impl SessionCookie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<String> {
        self.inner.read().ok()?.clone()
    }

    /// Remember the cookie from a `Set-Cookie` response header.
    pub fn set(&self, cookie: impl Into<String>) {
        if let Ok(mut slot) = self.inner.write() {
            *slot = Some(cookie.into());
            tracing::debug!("SessionCookie: updated");
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.inner.write() {
            *slot = None;
        }
    }
}
