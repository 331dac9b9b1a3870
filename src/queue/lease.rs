use async_trait::async_trait;

use crate::data::Database;
use crate::error::AppError;

/// Cluster-wide single-winner claim on a key.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClaimLock: Send + Sync {
    /// True when the caller won `key` for `ttl`.
    async fn try_claim(&self, key: &str, ttl: chrono::Duration) -> Result<bool, AppError>;
}

/// Claims backed by the `job_claims` counter: whoever bumps it to 1 wins.
#[derive(Debug, Clone)]
pub struct SqliteClaimLock {
    db: Database,
}

impl SqliteClaimLock {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ClaimLock for SqliteClaimLock {
    async fn try_claim(&self, key: &str, ttl: chrono::Duration) -> Result<bool, AppError> {
        Ok(self.db.increment_claim(key, ttl).await? == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn exactly_one_racer_wins() {
        let dir = TempDir::new().unwrap();
        let db = Database::connect(&dir.path().join("test.db"), 4)
            .await
            .unwrap();
        let lock = Arc::new(SqliteClaimLock::new(db));

        let racers: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                tokio::spawn(async move {
                    lock.try_claim("42:1700000000000", chrono::Duration::minutes(5))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut winners = 0;
        for racer in racers {
            if racer.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        // A different attempt of the same job is a fresh claim.
        assert!(
            lock.try_claim("42:1700000180000", chrono::Duration::minutes(5))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn expired_claims_can_be_won_again() {
        let dir = TempDir::new().unwrap();
        let db = Database::connect(&dir.path().join("test.db"), 4)
            .await
            .unwrap();
        let lock = SqliteClaimLock::new(db);

        assert!(lock.try_claim("7:1", chrono::Duration::zero()).await.unwrap());
        assert!(lock.try_claim("7:1", chrono::Duration::minutes(5)).await.unwrap());
        assert!(!lock.try_claim("7:1", chrono::Duration::minutes(5)).await.unwrap());
    }
}
