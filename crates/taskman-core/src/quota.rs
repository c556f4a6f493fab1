// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Two-phase quota reservation.
//!
//! A create path reserves quota up front (`pending`), then either commits the
//! reservation into `used` once the resource row exists, or cancels it.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::TaskError;
use crate::persistence::{Persistence, QuotaRecord};

/// Amount of one resource charged against a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaUsage {
    pub resource: String,
    pub count: i64,
}

impl QuotaUsage {
    pub fn new(resource: impl Into<String>, count: i64) -> Self {
        Self {
            resource: resource.into(),
            count,
        }
    }
}

/// Quota operations over the persisted counters.
#[derive(Clone)]
pub struct QuotaManager {
    persistence: Arc<dyn Persistence>,
    default_limit: i64,
}

impl QuotaManager {
    /// `default_limit` applies to scopes without an explicit limit.
    pub fn new(persistence: Arc<dyn Persistence>, default_limit: i64) -> Self {
        Self {
            persistence,
            default_limit,
        }
    }

    /// Reserve `usage` in `scope`, failing with `OutOfQuota` if the scope
    /// would exceed its limit.
    pub async fn check_set_pending_quota(
        &self,
        scope: &str,
        usage: QuotaUsage,
    ) -> Result<QuotaReservation, TaskError> {
        let reserved = self
            .persistence
            .reserve_quota(scope, &usage.resource, usage.count, self.default_limit)
            .await?;
        if !reserved {
            debug!(scope = %scope, resource = %usage.resource, count = usage.count, "Quota exceeded");
            return Err(TaskError::OutOfQuota {
                scope: scope.to_string(),
                resource: usage.resource,
                requested: usage.count,
            });
        }

        Ok(QuotaReservation {
            manager: self.clone(),
            scope: scope.to_string(),
            usage,
            settled: false,
        })
    }

    /// Give back usage held by a resource that was hard-deleted.
    pub async fn release_usage(&self, scope: &str, usage: &QuotaUsage) -> Result<(), TaskError> {
        self.persistence
            .release_quota(scope, &usage.resource, usage.count)
            .await
    }

    pub async fn get(&self, scope: &str, resource: &str) -> Result<Option<QuotaRecord>, TaskError> {
        self.persistence.get_quota(scope, resource).await
    }

    pub async fn set_limit(&self, scope: &str, resource: &str, limit: i64) -> Result<(), TaskError> {
        self.persistence.set_quota_limit(scope, resource, limit).await
    }
}

/// Outstanding reservation. Consume it with [`commit`](Self::commit) or
/// [`cancel`](Self::cancel); dropping it unconsumed cancels it in the
/// background.
#[must_use = "a reservation must be committed or cancelled"]
pub struct QuotaReservation {
    manager: QuotaManager,
    scope: String,
    usage: QuotaUsage,
    settled: bool,
}

impl QuotaReservation {
    pub fn usage(&self) -> &QuotaUsage {
        &self.usage
    }

    /// Move the reservation into used quota.
    pub async fn commit(mut self) -> Result<(), TaskError> {
        self.settled = true;
        self.manager
            .persistence
            .commit_quota(&self.scope, &self.usage.resource, self.usage.count)
            .await
    }

    /// Release the reservation.
    pub async fn cancel(mut self) -> Result<(), TaskError> {
        self.settled = true;
        self.manager
            .persistence
            .cancel_quota(&self.scope, &self.usage.resource, self.usage.count)
            .await
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        warn!(scope = %self.scope, resource = %self.usage.resource, "Quota reservation dropped unsettled; cancelling");

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(scope = %self.scope, "No runtime to cancel quota reservation");
            return;
        };
        let persistence = self.manager.persistence.clone();
        let scope = std::mem::take(&mut self.scope);
        let usage = self.usage.clone();
        handle.spawn(async move {
            if let Err(e) = persistence
                .cancel_quota(&scope, &usage.resource, usage.count)
                .await
            {
                warn!(scope = %scope, error = %e, "Failed to cancel dropped quota reservation");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use std::time::Duration;

    async fn manager(limit: i64) -> QuotaManager {
        let persistence: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::in_memory().await.unwrap());
        QuotaManager::new(persistence, limit)
    }

    #[tokio::test]
    async fn test_reserve_commit_cancel() {
        let quota = manager(2).await;

        let first = quota
            .check_set_pending_quota("p1", QuotaUsage::new("image", 1))
            .await
            .unwrap();
        let second = quota
            .check_set_pending_quota("p1", QuotaUsage::new("image", 1))
            .await
            .unwrap();
        let err = quota
            .check_set_pending_quota("p1", QuotaUsage::new("image", 1))
            .await
            .err()
            .unwrap();
        assert_eq!(err.error_code(), "OUT_OF_QUOTA");

        first.commit().await.unwrap();
        second.cancel().await.unwrap();

        let record = quota.get("p1", "image").await.unwrap().unwrap();
        assert_eq!((record.used, record.pending, record.quota_limit), (1, 0, 2));

        // Scopes are independent.
        quota
            .check_set_pending_quota("p2", QuotaUsage::new("image", 2))
            .await
            .unwrap()
            .commit()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_release_frees_capacity() {
        let quota = manager(1).await;
        let usage = QuotaUsage::new("image", 1);

        quota
            .check_set_pending_quota("p1", usage.clone())
            .await
            .unwrap()
            .commit()
            .await
            .unwrap();
        assert!(
            quota
                .check_set_pending_quota("p1", usage.clone())
                .await
                .is_err()
        );

        quota.release_usage("p1", &usage).await.unwrap();
        quota
            .check_set_pending_quota("p1", usage)
            .await
            .unwrap()
            .cancel()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_explicit_limit_overrides_default() {
        let quota = manager(1).await;
        quota.set_limit("p1", "image", 3).await.unwrap();
        for _ in 0..3 {
            quota
                .check_set_pending_quota("p1", QuotaUsage::new("image", 1))
                .await
                .unwrap()
                .commit()
                .await
                .unwrap();
        }
        let record = quota.get("p1", "image").await.unwrap().unwrap();
        assert_eq!(record.used, 3);
    }

    #[tokio::test]
    async fn test_dropped_reservation_is_cancelled() {
        let quota = manager(1).await;
        {
            let _reservation = quota
                .check_set_pending_quota("p1", QuotaUsage::new("image", 1))
                .await
                .unwrap();
        }

        let mut pending = 1;
        for _ in 0..50 {
            pending = quota.get("p1", "image").await.unwrap().unwrap().pending;
            if pending == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pending, 0);
    }
}
