use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;

/// Time source threaded through polling loops so tests can simulate time
/// instead of sleeping.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> NaiveDateTime;
    async fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Utc::now().naive_utc()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
