//! Best-effort desktop toasts.
//!
//! Notifications are fire-and-forget on a detached thread: delivery may
//! block on some desktop environments and must never stall the capture or
//! processing pipeline. Failures are logged and swallowed.

use tracing::{debug, warn};

#[derive(Clone)]
pub struct Notifier {
    enabled: bool,
}

impl Notifier {
    pub fn new() -> Self {
        Self { enabled: true }
    }

    /// Used by tests and headless deployments.
    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    pub fn notify(&self, title: &str, body: &str) {
        if !self.enabled {
            debug!(%title, "notification suppressed (notifier disabled)");
            return;
        }
        let title = title.to_string();
        let body = body.to_string();
        std::thread::spawn(move || {
            match notify_rust::Notification::new()
                .summary(&title)
                .body(&body)
                .show()
            {
                Ok(_) => debug!(%title, "desktop notification sent"),
                Err(e) => warn!(%title, error = %e, "desktop notification failed"),
            }
        });
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
