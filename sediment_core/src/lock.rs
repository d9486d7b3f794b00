//! Acquisition of the "migration in progress" lock.

use std::future::Future;
use std::time::Duration;

use log::{error, info, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendError, MigrationLock};
use crate::config::MigratorConfig;
use crate::error::MigrationError;

/// Calculates the delay before the next lock attempt using exponential
/// backoff with jitter.
///
/// The delay doubles with each attempt, starting from
/// `initial_lock_retry_delay`, and is capped at `max_lock_retry_delay`. A
/// ±10% random jitter keeps runners that started together from retrying in
/// lockstep.
pub(crate) fn calculate_retry_delay(config: &MigratorConfig, attempt: u32) -> Duration {
    calculate_retry_delay_with_jitter(config, attempt, true)
}

fn calculate_retry_delay_with_jitter(
    config: &MigratorConfig,
    attempt: u32,
    apply_jitter: bool,
) -> Duration {
    use rand::Rng;

    let initial_ms = config.initial_lock_retry_delay.as_millis() as u64;
    let max_ms = config.max_lock_retry_delay.as_millis() as u64;

    // 2^63 is the largest power that fits in u64
    let multiplier = 2u64.saturating_pow(attempt.min(63));
    let base_delay_ms = initial_ms.saturating_mul(multiplier).min(max_ms);

    if !apply_jitter || base_delay_ms == 0 {
        return Duration::from_millis(base_delay_ms);
    }

    let jitter_range = (base_delay_ms as f64 * 0.1) as u64;
    if jitter_range == 0 {
        return Duration::from_millis(base_delay_ms);
    }

    let mut rng = rand::thread_rng();
    let jitter: i64 = rng.gen_range(-(jitter_range as i64)..=(jitter_range as i64));
    let final_delay_ms = (base_delay_ms as i64 + jitter).max(1) as u64;

    Duration::from_millis(final_delay_ms.min(max_ms))
}

#[cfg(test)]
fn calculate_retry_delay_no_jitter(config: &MigratorConfig, attempt: u32) -> Duration {
    calculate_retry_delay_with_jitter(config, attempt, false)
}

/// A held migration lock.
///
/// There is no async drop, so the lock must be given back with
/// [`LockGuard::release`]. A guard that is simply dropped leaves the row in
/// place until it goes stale.
#[must_use = "the lock must be released"]
pub struct LockGuard<'a, L: MigrationLock + ?Sized> {
    lock: &'a L,
    owner: String,
}

impl<L: MigrationLock + ?Sized> LockGuard<'_, L> {
    /// Identity the lock is held under.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Refreshes the lock. Fails with [`MigrationError::LockLost`] when
    /// another runner has taken it over.
    pub async fn renew(&self) -> Result<(), MigrationError> {
        let held = self
            .lock
            .renew(&self.owner)
            .await
            .map_err(MigrationError::from_backend)?;
        if held {
            Ok(())
        } else {
            Err(MigrationError::LockLost {
                owner: self.owner.clone(),
            })
        }
    }

    /// Drives `run` while renewing the lock every `interval`.
    ///
    /// When renewal finds the lock taken over, `stop` is cancelled so `run`
    /// halts at its next descriptor boundary, and the run fails with
    /// [`MigrationError::LockLost`] unless it already failed on its own.
    pub async fn hold_while<T, F>(
        &self,
        run: F,
        interval: Duration,
        stop: &CancellationToken,
    ) -> Result<T, MigrationError>
    where
        F: Future<Output = Result<T, MigrationError>>,
    {
        tokio::pin!(run);
        let heartbeat = self.heartbeat(interval);
        tokio::pin!(heartbeat);

        let mut lost = None;
        loop {
            tokio::select! {
                biased;
                result = &mut run => {
                    return match lost {
                        None => result,
                        Some(lost) => match result {
                            Ok(_) | Err(MigrationError::Cancelled { .. }) => Err(lost),
                            Err(err) => Err(err),
                        },
                    };
                }
                err = &mut heartbeat, if lost.is_none() => {
                    error!("{}; stopping after the current descriptor", err);
                    stop.cancel();
                    lost = Some(err);
                }
            }
        }
    }

    /// Renews the lock every `interval` until it is lost. Renewals that fail
    /// to reach the database are retried on the next tick.
    async fn heartbeat(&self, interval: Duration) -> MigrationError {
        loop {
            sleep(interval).await;
            match self.renew().await {
                Ok(()) => log::trace!("Renewed migration lock held by {}", self.owner),
                Err(err @ MigrationError::LockLost { .. }) => return err,
                Err(err) => warn!("Could not renew migration lock: {}", err),
            }
        }
    }

    /// Gives the lock back.
    pub async fn release(self) -> Result<(), BackendError> {
        self.lock.unlock(&self.owner).await?;
        log::debug!("Released migration lock held by {}", self.owner);
        Ok(())
    }
}

/// Takes the migration lock for `owner`, retrying with backoff while
/// another runner holds it.
///
/// Gives up with [`MigrationError::LockContention`] after
/// `config.lock_retries` retries.
pub async fn acquire<'a, L: MigrationLock + ?Sized>(
    lock: &'a L,
    owner: &str,
    config: &MigratorConfig,
) -> Result<LockGuard<'a, L>, MigrationError> {
    let attempts = config.lock_retries + 1;
    for attempt in 0..attempts {
        let acquired = lock
            .try_lock(owner, config.lock_stale_after)
            .await
            .map_err(MigrationError::from_backend)?;
        if acquired {
            info!("Acquired migration lock as {}", owner);
            return Ok(LockGuard {
                lock,
                owner: owner.to_string(),
            });
        }
        if attempt + 1 < attempts {
            let delay = calculate_retry_delay(config, attempt);
            warn!(
                "Migration lock is held by another runner (attempt {}/{}). Retrying in {:?}",
                attempt + 1,
                attempts,
                delay
            );
            sleep(delay).await;
        }
    }
    Err(MigrationError::LockContention { attempts })
}

/// How often a held lock is renewed: well inside `stale_after`.
pub(crate) fn heartbeat_interval(stale_after: Duration) -> Duration {
    (stale_after / 3).max(Duration::from_millis(10))
}
