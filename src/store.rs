//! Store: the connection pool plus the metamodel, and the entry points to
//! services, example compilation and schema management.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::{
    PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};

use crate::{
    Result,
    example::ExampleBuilder,
    metamodel::{Entity, Metamodel},
    schema::SchemaManager,
    service::{CrudService, ServiceHooks},
};

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    metamodel: Arc<Metamodel>,
}

impl Store {
    pub async fn connect(url: &str, metamodel: Metamodel) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self {
            pool,
            metamodel: Arc::new(metamodel),
        })
    }

    pub fn builder(url: impl Into<String>) -> StoreBuilder {
        StoreBuilder::new(url)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn metamodel(&self) -> &Metamodel {
        &self.metamodel
    }

    /// CRUD service for one entity type.
    pub fn service<T: Entity>(&self) -> CrudService<T> {
        CrudService::new(self.pool.clone())
    }

    /// CRUD service with an installed hook implementation.
    pub fn service_with_hooks<T: Entity>(&self, hooks: Arc<dyn ServiceHooks<T>>) -> CrudService<T> {
        CrudService::new(self.pool.clone()).with_hooks(hooks)
    }

    /// Starts example compilation sessions.
    pub fn examples(&self) -> ExampleBuilder {
        ExampleBuilder::new()
    }

    pub fn schema(&self) -> SchemaManager {
        SchemaManager::new(self.pool.clone())
    }

    /// Creates any table the metamodel declares that is still missing.
    pub async fn sync_schema(&self) -> Result<()> {
        self.schema().sync(&self.metamodel).await?;
        Ok(())
    }

    /// Lightweight liveness check for the connection pool.
    pub async fn pool_health(&self) -> Result<PoolHealth> {
        let one: i32 = sqlx::query_scalar("select 1").fetch_one(&self.pool).await?;
        Ok(PoolHealth { ok: one == 1 })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PoolHealth {
    pub ok: bool,
}

pub struct StoreBuilder {
    url: String,
    max_connections: Option<u32>,
    connect_timeout: Option<Duration>,
    statement_cache_capacity: Option<usize>,
    metamodel: Metamodel,
}

impl StoreBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: None,
            connect_timeout: None,
            statement_cache_capacity: None,
            metamodel: Metamodel::new(),
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max.max(1));
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Hint for the driver's prepared statement cache.
    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = Some(capacity.max(1));
        self
    }

    pub fn metamodel(mut self, metamodel: Metamodel) -> Self {
        self.metamodel = metamodel;
        self
    }

    pub fn register<T: Entity>(mut self) -> Self {
        self.metamodel = std::mem::take(&mut self.metamodel).register::<T>();
        self
    }

    pub async fn build(self) -> Result<Store> {
        let mut opts = PgPoolOptions::new();
        if let Some(max) = self.max_connections {
            opts = opts.max_connections(max);
        }
        if let Some(timeout) = self.connect_timeout {
            opts = opts.acquire_timeout(timeout);
        }
        let pool = if let Some(capacity) = self.statement_cache_capacity {
            let connect_opts = PgConnectOptions::from_str(&self.url)
                .map_err(|e| sqlx::Error::Configuration(Box::new(e)))?
                .statement_cache_capacity(capacity);
            opts.connect_with(connect_opts).await?
        } else {
            opts.connect(&self.url).await?
        };
        Ok(Store {
            pool,
            metamodel: Arc::new(self.metamodel),
        })
    }
}
