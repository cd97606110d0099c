pub mod send_tracker;

use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::protocol::envelope::Envelope;

/// Configuration for the delivery-assurance sweep.
#[derive(Debug, Clone)]
pub struct QosConfig {
    /// fixed rate at which the sweep over the tracking table runs
    pub sweep_interval: Duration,
    /// a message younger than this is never retried in a sweep cycle, no matter the schedule
    pub grace_window: Duration,
    /// retry budget: maximum number of resend attempts before a message is declared lost
    pub max_retries: u32,
    /// enables the chatty per-entry sweep logging
    pub debug: bool,
    /// tag prefixed to log lines, to tell several tracker instances apart
    pub tag: String,
}

impl Default for QosConfig {
    fn default() -> Self {
        QosConfig {
            sweep_interval: Duration::from_millis(5000),
            grace_window: Duration::from_millis(2000),
            max_retries: 1,
            debug: false,
            tag: String::new(),
        }
    }
}

impl QosConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sweep_interval.is_zero() {
            bail!("sweep interval must not be zero");
        }
        if self.grace_window.is_zero() {
            bail!("grace window must not be zero");
        }
        Ok(())
    }
}

/// Observer for the two terminal delivery outcomes. Both notifications are complementary and
///  mutually exclusive per fingerprint: a message reported lost is never later reported
///  delivered, and vice versa.
#[cfg_attr(test, automock)]
pub trait QosEventListener: Send + Sync + 'static {
    /// invoked at most once per sweep, with the non-empty batch of terminally lost envelope
    ///  snapshots
    fn messages_lost(&self, lost: Vec<Envelope>);

    /// invoked when an ack resolved this fingerprint as delivered
    fn message_received(&self, fingerprint: &str);
}

/// Invoked exactly once per resend attempt, with the transport's reported outcome.
#[cfg_attr(test, automock)]
pub trait RetryAttemptObserver: Send + Sync + 'static {
    fn on_attempt(&self, success: bool, envelope: &Envelope);
}

/// The transport write path the sweep uses for resending. Implementations serialize the
///  envelope and put it on the wire; the reported outcome is per send call, not per delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RetrySender: Send + Sync + 'static {
    async fn resend(&self, envelope: &Envelope) -> bool;
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::defaults(QosConfig::default(), true)]
    #[case::zero_sweep_interval(QosConfig { sweep_interval: Duration::ZERO, ..QosConfig::default() }, false)]
    #[case::zero_grace_window(QosConfig { grace_window: Duration::ZERO, ..QosConfig::default() }, false)]
    #[case::zero_retry_budget_is_legal(QosConfig { max_retries: 0, ..QosConfig::default() }, true)]
    fn test_config_validate(#[case] config: QosConfig, #[case] expected_ok: bool) {
        assert_eq!(config.validate().is_ok(), expected_ok);
    }

    #[rstest]
    fn test_config_defaults() {
        let config = QosConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_millis(5000));
        assert_eq!(config.grace_window, Duration::from_millis(2000));
        assert_eq!(config.max_retries, 1);
        assert!(!config.debug);
    }
}
