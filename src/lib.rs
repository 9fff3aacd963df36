//! Specimen — query-by-example criteria engine for Postgres.
//!
//! A partially-populated entity instance acts as a template: its populated
//! fields compile into a joined, filterable SQL query, including fields
//! that live on associated entities several hops away from the example's
//! own type.

pub mod criteria;
mod error;
pub mod example;
pub mod filter;
pub mod metamodel;
pub mod metrics;
pub mod schema;
pub mod service;
pub mod store;
pub mod testing;

pub use criteria::{Criteria, JoinKind, SortDirection};
pub use error::{Error, Result, WithContext};
pub use example::{ComparisonOperation, Diagnostic, ExampleBuilder, ExampleDsl};
pub use filter::{Filter, MultiSort, Sort};
pub use metamodel::{
    AttributeKind, AttributeMeta, CollectionShape, Entity, EntityMeta, IdKind, IdValue, Metamodel,
};
pub use service::{CrudService, DefaultHooks, ServiceHooks};
pub use store::Store;

pub mod prelude {
    pub use crate::{
        ComparisonOperation, Criteria, CrudService, Entity, ExampleBuilder, Filter, Metamodel,
        Result, Sort, Store,
    };
}
