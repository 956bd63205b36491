use std::{collections::HashMap, sync::Mutex};

use log::{debug, info};

use super::{Connector, Pool, PoolError};
use crate::utilities::lock;

/// Process-scoped registry of pools, keyed by connection settings.
///
/// Created once and handed to whatever needs pooled connections, so pools
/// with identical settings are shared and can be torn down together.
pub struct PoolRegistry<C: Connector> {
    pools: Mutex<HashMap<String, Pool<C>>>,
}

impl<C: Connector> Default for PoolRegistry<C> {
    fn default() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
        }
    }
}

impl<C: Connector> PoolRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pool registered under `key`, creating it with `make` if
    /// there is none yet or the registered one has been closed.
    pub fn get_or_create<F>(&self, key: &str, make: F) -> Result<Pool<C>, PoolError>
    where
        F: FnOnce() -> Result<Pool<C>, PoolError>,
    {
        let mut pools = lock(&self.pools);
        if let Some(pool) = pools.get(key) {
            if !pool.is_closed() {
                return Ok(pool.clone());
            }
        }
        let pool = make()?;
        debug!("registered pool '{key}'");
        pools.insert(key.to_string(), pool.clone());
        Ok(pool)
    }

    pub fn get(&self, key: &str) -> Option<Pool<C>> {
        lock(&self.pools).get(key).cloned()
    }

    /// Unregisters and closes the pool under `key`.
    pub fn remove(&self, key: &str) -> bool {
        let removed = lock(&self.pools).remove(key);
        match removed {
            Some(pool) => {
                pool.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let pools: Vec<_> = lock(&self.pools).drain().collect();
        if !pools.is_empty() {
            info!("closing {} pool(s)", pools.len());
        }
        for (_, pool) in pools {
            pool.close();
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.pools).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.pools).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{pool::{ConnectError, PoolConfig}, runtime::Scheduler};

    struct Loopback;

    impl Connector for Loopback {
        type Connection = ();

        fn connect(&self) -> Result<(), ConnectError> {
            Ok(())
        }
    }

    fn make(scheduler: &Scheduler, label: &str) -> Result<Pool<Loopback>, PoolError> {
        let config = PoolConfig {
            label: label.into(),
            ..PoolConfig::default()
        };
        Pool::new(Loopback, config, scheduler)
    }

    #[test]
    fn pools_are_shared_by_key() {
        let scheduler = Scheduler::new(1).unwrap();
        let registry = PoolRegistry::new();
        let a = registry.get_or_create("db1", || make(&scheduler, "a")).unwrap();
        let b = registry.get_or_create("db1", || make(&scheduler, "b")).unwrap();
        assert_eq!(a.label(), "a");
        assert_eq!(b.label(), "a");
        assert_eq!(registry.len(), 1);
        assert!(registry.get("db2").is_none());
    }

    #[test]
    fn remove_closes_pool() {
        let scheduler = Scheduler::new(1).unwrap();
        let registry = PoolRegistry::new();
        let pool = registry.get_or_create("db1", || make(&scheduler, "a")).unwrap();
        assert!(registry.remove("db1"));
        assert!(!registry.remove("db1"));
        assert!(pool.is_closed());

        let outcome = pool.lease().recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, Err(PoolError::Closed("a".into())));
    }

    #[test]
    fn closed_pool_is_replaced() {
        let scheduler = Scheduler::new(1).unwrap();
        let registry = PoolRegistry::new();
        registry.get_or_create("db1", || make(&scheduler, "a")).unwrap().close();
        let fresh = registry.get_or_create("db1", || make(&scheduler, "b")).unwrap();
        assert_eq!(fresh.label(), "b");

        registry.close_all();
        assert!(registry.is_empty());
        assert!(fresh.is_closed());
    }
}
