use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::RelayError;

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Backpressure applied before pre-consume: a token bucket per model and a
/// concurrent-request cap per user. Rejections are cheap and never touch the
/// ledger.
pub struct Limits {
    per_model: Option<KeyedLimiter>,
    per_user_concurrency: usize,
    user_slots: Mutex<HashMap<i64, Arc<Semaphore>>>,
}

pub struct ConcurrencyGuard {
    _permit: OwnedSemaphorePermit,
}

impl Limits {
    /// `model_rpm` of 0 disables the per-model bucket.
    pub fn new(model_rpm: u32, per_user_concurrency: usize) -> Self {
        let per_model = NonZeroU32::new(model_rpm)
            .map(|rpm| RateLimiter::keyed(Quota::per_minute(rpm)));
        Self {
            per_model,
            per_user_concurrency,
            user_slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn check_model(&self, model: &str) -> Result<(), RelayError> {
        if let Some(limiter) = &self.per_model
            && limiter.check_key(&model.to_string()).is_err()
        {
            return Err(RelayError::rate_limited(format!(
                "model {model} is receiving too many requests"
            )));
        }
        Ok(())
    }

    pub fn acquire_user_slot(&self, user_id: i64) -> Result<ConcurrencyGuard, RelayError> {
        let semaphore = {
            let mut slots = self.user_slots.lock().expect("user slots poisoned");
            slots
                .entry(user_id)
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_user_concurrency)))
                .clone()
        };
        match semaphore.try_acquire_owned() {
            Ok(permit) => Ok(ConcurrencyGuard { _permit: permit }),
            Err(TryAcquireError::NoPermits) => Err(RelayError::rate_limited(
                "too many concurrent requests for this user",
            )),
            Err(TryAcquireError::Closed) => {
                Err(RelayError::internal("user concurrency semaphore closed"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayErrorKind;

    #[test]
    fn user_concurrency_caps_and_releases() {
        let limits = Limits::new(0, 2);
        let a = limits.acquire_user_slot(1).unwrap();
        let _b = limits.acquire_user_slot(1).unwrap();
        let err = limits.acquire_user_slot(1).unwrap_err();
        assert_eq!(err.kind, RelayErrorKind::RateLimited);

        // Another user has their own pool.
        let _c = limits.acquire_user_slot(2).unwrap();

        drop(a);
        assert!(limits.acquire_user_slot(1).is_ok());
    }

    #[test]
    fn model_bucket_rejects_past_burst() {
        let limits = Limits::new(60, 100);
        let mut rejected = false;
        for _ in 0..200 {
            if limits.check_model("gpt-4o").is_err() {
                rejected = true;
                break;
            }
        }
        assert!(rejected, "bucket never rejected during a 200-call burst");
        // A different model key has its own bucket.
        assert!(limits.check_model("other-model").is_ok());
    }

    #[test]
    fn zero_rpm_disables_model_bucket() {
        let limits = Limits::new(0, 1);
        for _ in 0..1000 {
            assert!(limits.check_model("gpt-4o").is_ok());
        }
    }
}
