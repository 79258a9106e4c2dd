use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pmon_storage::{Notifier, SettingsStore, KEY_ERROR_RECIPIENT};
use tracing::{error, info, warn};

/// Total delivery attempts when the inbox reports a write conflict.
pub const MAX_DELIVERY_ATTEMPTS: usize = 2;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Reports job failures to the configured operator. Never fails itself.
#[derive(Clone)]
pub struct Escalator {
    notifier: Arc<dyn Notifier>,
    settings: Arc<dyn SettingsStore>,
    retry_delay: Duration,
}

impl Escalator {
    pub fn new(notifier: Arc<dyn Notifier>, settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            notifier,
            settings,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub async fn escalate(&self, job: &str, err: &anyhow::Error) {
        error!(job, error = %format!("{err:#}"), "job failed");

        let recipient = match self.settings.get(KEY_ERROR_RECIPIENT).await {
            Ok(Some(r)) if !r.trim().is_empty() => r,
            Ok(_) => {
                warn!(job, "no error recipient configured; failure logged only");
                return;
            }
            Err(settings_err) => {
                warn!(job, error = %settings_err, "could not read error recipient; failure logged only");
                return;
            }
        };

        let subject = format!("Error in {job}");
        let body = format!("{job} failed:\n{err:#}");

        for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
            match self.notifier.send_message(&recipient, &subject, &body).await {
                Ok(()) => {
                    info!(job, recipient = %recipient, attempt, "operator notified");
                    return;
                }
                Err(notify_err) if notify_err.is_write_conflict() && attempt < MAX_DELIVERY_ATTEMPTS => {
                    warn!(job, attempt, error = %notify_err, "write conflict posting error; retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(notify_err) => {
                    error!(job, attempt, error = %notify_err, "could not notify operator");
                    return;
                }
            }
        }
    }

    /// Run a job body; on error, escalate and hand the error back.
    pub async fn guard<T, F>(&self, job: &str, body: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let result = body.await;
        if let Err(err) = &result {
            self.escalate(job, err).await;
        }
        result
    }
}
