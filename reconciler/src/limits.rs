//! Connection limits derived from the operator's requested maximum.
//!
//! Values here are never stored as inputs. They are recomputed on every pass
//! from `max_db_connections` and the number of local pooler workers.

use crate::document::{ConfigDocument, DocumentError, PGBOUNCER};

/// Pool sizes used when `max_db_connections` is 0 (unlimited).
const UNLIMITED_BASIS: u32 = 100;

/// Splits `total` connections across `workers` pooler processes.
///
/// Every worker gets `total / workers`; the remainder goes one by one to the
/// first workers so the shares always sum to `total`.
pub fn split_connection_limit(total: u32, workers: usize) -> Vec<u32> {
    if workers == 0 {
        return Vec::new();
    }

    let count = u32::try_from(workers).unwrap_or(u32::MAX);
    let base = total / count;
    let remainder = total % count;

    (0..count).map(|i| base + u32::from(i < remainder)).collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSizes {
    pub max_db_connections: u32,
    pub default_pool_size: u32,
    pub min_pool_size: u32,
    pub reserve_pool_size: u32,
}

impl PoolSizes {
    pub fn for_limit(max_db_connections: u32) -> Self {
        let basis = if max_db_connections == 0 {
            UNLIMITED_BASIS
        } else {
            max_db_connections
        };

        PoolSizes {
            max_db_connections,
            default_pool_size: basis.div_ceil(2),
            min_pool_size: basis.div_ceil(4),
            reserve_pool_size: basis.div_ceil(4),
        }
    }

    pub fn apply(&self, doc: &mut ConfigDocument) -> Result<(), DocumentError> {
        doc.set(
            PGBOUNCER,
            "max_db_connections",
            self.max_db_connections.to_string(),
        )?;
        doc.set(
            PGBOUNCER,
            "default_pool_size",
            self.default_pool_size.to_string(),
        )?;
        doc.set(PGBOUNCER, "min_pool_size", self.min_pool_size.to_string())?;
        doc.set(
            PGBOUNCER,
            "reserve_pool_size",
            self.reserve_pool_size.to_string(),
        )?;
        Ok(())
    }
}

/// Pool sizes for each of `workers` processes sharing `total` connections.
///
/// A zero share of a non-zero total is rendered as 1, since the pooler reads 0
/// as unlimited.
pub fn worker_pool_sizes(total: u32, workers: usize) -> Vec<PoolSizes> {
    split_connection_limit(total, workers)
        .into_iter()
        .map(|share| {
            if total > 0 && share == 0 {
                PoolSizes::for_limit(1)
            } else {
                PoolSizes::for_limit(share)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_split() {
        assert_eq!(split_connection_limit(44, 4), vec![11, 11, 11, 11]);
    }

    #[test]
    fn test_remainder_goes_to_first_workers() {
        assert_eq!(split_connection_limit(10, 4), vec![3, 3, 2, 2]);
        assert_eq!(split_connection_limit(7, 3), vec![3, 2, 2]);
    }

    #[test]
    fn test_split_sums_to_total() {
        for total in [0, 1, 5, 99, 100, 1001] {
            for workers in 1..=9 {
                let shares = split_connection_limit(total, workers);
                assert_eq!(shares.len(), workers);
                assert_eq!(shares.iter().sum::<u32>(), total);
                let floor = total / workers as u32;
                assert!(shares.iter().all(|share| *share >= floor));
            }
        }
    }

    #[test]
    fn test_no_workers() {
        assert!(split_connection_limit(10, 0).is_empty());
    }

    #[test]
    fn test_pool_sizes() {
        assert_eq!(
            PoolSizes::for_limit(25),
            PoolSizes {
                max_db_connections: 25,
                default_pool_size: 13,
                min_pool_size: 7,
                reserve_pool_size: 7,
            }
        );

        let unlimited = PoolSizes::for_limit(0);
        assert_eq!(unlimited.max_db_connections, 0);
        assert_eq!(unlimited.default_pool_size, 50);
        assert_eq!(unlimited.min_pool_size, 25);
    }

    #[test]
    fn test_worker_pool_sizes_never_unlimited_by_accident() {
        let sizes = worker_pool_sizes(2, 4);
        let limits: Vec<u32> = sizes.iter().map(|s| s.max_db_connections).collect();
        assert_eq!(limits, vec![1, 1, 1, 1]);

        let sizes = worker_pool_sizes(0, 2);
        assert!(sizes.iter().all(|s| s.max_db_connections == 0));
    }

    #[test]
    fn test_apply_writes_all_keys() {
        let mut doc = ConfigDocument::new();
        PoolSizes::for_limit(8).apply(&mut doc).unwrap();
        assert_eq!(
            doc.to_string(),
            "[pgbouncer]\nmax_db_connections = 8\ndefault_pool_size = 4\nmin_pool_size = 2\nreserve_pool_size = 2\n"
        );
    }
}
