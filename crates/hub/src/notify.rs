//! Push notifications through an ntfy-style relay: a plain-text POST to
//! `<relay>/<destination>`.

use reqwest::header::CONTENT_TYPE;
use tracing::{error, info, warn};

use crate::error::{PipelineError, Result};

#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    relay_url: String,
    target: Option<String>,
}

impl Notifier {
    pub fn new(client: reqwest::Client, relay_url: &str, target: Option<String>) -> Self {
        Self {
            client,
            relay_url: relay_url.trim_end_matches('/').to_string(),
            target,
        }
    }

    /// Fire-and-forget. Without a destination this logs and returns
    /// `NotificationUnconfigured` without touching the network. The relay's
    /// response is never inspected and a transport failure is only logged.
    pub async fn notify(&self, message: &str) -> Result<()> {
        let Some(target) = self.target.as_deref() else {
            error!("NOTIFICATION_TARGET is missing; alert dropped");
            return Err(PipelineError::NotificationUnconfigured);
        };

        info!("sending alert to configured target");
        let url = format!("{}/{target}", self.relay_url);
        if let Err(e) = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "text/plain")
            .body(message.to_string())
            .send()
            .await
        {
            warn!("notification relay unreachable: {e}");
        }
        Ok(())
    }
}
