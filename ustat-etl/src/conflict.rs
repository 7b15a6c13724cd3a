use std::future::Future;

use tracing::debug;

use crate::error::{EtlError, EtlResult};

/// A duplicate-key failure is retried once; a second one is not a race.
pub const MAX_ATTEMPTS: u32 = 2;

/// Runs a fetch-or-insert operation, repeating it once if the insert lost a
/// race against a sibling worker.
pub async fn with_conflict_retry<T, F, Fut>(
    table: &str,
    value: &str,
    mut op: F,
) -> EtlResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EtlResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(EtlError::Warehouse(e)) if e.is_duplicate() => {
                if attempt >= MAX_ATTEMPTS {
                    return Err(EtlError::PersistentConflict {
                        table: table.to_string(),
                        value: value.to_string(),
                    });
                }
                debug!(
                    "insert race in `{}` for `{}`, attempt {} of {}",
                    table, value, attempt, MAX_ATTEMPTS
                );
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use ustat_warehouse::WarehouseError;

    use super::*;

    #[tokio::test]
    async fn retries_exactly_once() {
        let calls = AtomicU32::new(0);
        let out = with_conflict_retry("t", "v", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(WarehouseError::duplicate("t", "v").into())
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let calls = AtomicU32::new(0);
        let out: EtlResult<i64> = with_conflict_retry("t", "v", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(WarehouseError::duplicate("t", "v").into())
        })
        .await;
        assert!(matches!(out, Err(EtlError::PersistentConflict { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let out: EtlResult<i64> = with_conflict_retry("t", "v", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(WarehouseError::backend("boom").into())
        })
        .await;
        assert!(matches!(out, Err(EtlError::Warehouse(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
