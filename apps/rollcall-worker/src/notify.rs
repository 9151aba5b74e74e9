//! Notification delivery for published events.
//!
//! No mail provider is wired in yet, so the worker records each
//! notification in the log. Swapping in a real provider means another
//! [`NotificationSender`].

use std::collections::HashMap;

use async_trait::async_trait;
use rollcall_events::event::{PERSON_ALERT_ADDED, POTENTIAL_DUPLICATE_FLAGGED};
use rollcall_events::{NotificationError, NotificationSender};
use tracing::info;

/// Event types that notify the person, and the template each uses.
pub const TEMPLATES: [(&str, &str); 2] = [
    (PERSON_ALERT_ADDED, "person-alert-added"),
    (POTENTIAL_DUPLICATE_FLAGGED, "potential-duplicate-review"),
];

pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send(
        &self,
        template_id: &str,
        address: &str,
        personalisation: &HashMap<String, String>,
    ) -> Result<(), NotificationError> {
        if !address.contains('@') {
            return Err(NotificationError {
                address: address.to_string(),
                message: "not an email address".to_string(),
            });
        }
        info!(
            template_id,
            address,
            fields = personalisation.len(),
            "notification sent"
        );
        Ok(())
    }
}
