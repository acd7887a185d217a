use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

/// Why the engine is waiting. Each deliberate suspension point has its own kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    InterItem,
    InterBatch,
    ModelSwitch,
    Backoff,
}

impl fmt::Display for Wait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Wait::InterItem => write!(f, "inter-item"),
            Wait::InterBatch => write!(f, "inter-batch"),
            Wait::ModelSwitch => write!(f, "model-switch"),
            Wait::Backoff => write!(f, "backoff"),
        }
    }
}

/// The engine's only way to wait. Dropping the future cancels the wait.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, wait: Wait, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, wait: Wait, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        tracing::debug!(%wait, delay_ms = duration.as_millis() as u64, "waiting");
        tokio::time::sleep(duration).await;
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSleeper;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn tokio_sleeper_waits_for_duration() {
        let start = tokio::time::Instant::now();
        TokioSleeper.sleep(Wait::Backoff, Duration::from_secs(30)).await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn recording_sleeper_counts_by_kind() {
        let sleeper = RecordingSleeper::default();
        sleeper.sleep(Wait::InterBatch, Duration::from_secs(1)).await;
        sleeper.sleep(Wait::Backoff, Duration::from_secs(2)).await;
        sleeper.sleep(Wait::InterBatch, Duration::from_secs(1)).await;
        assert_eq!(sleeper.count(Wait::InterBatch), 2);
        assert_eq!(sleeper.count(Wait::Backoff), 1);
        assert_eq!(sleeper.waits()[1], (Wait::Backoff, Duration::from_secs(2)));
    }
}
