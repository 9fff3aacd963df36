//! CRUD and pagination on top of the criteria engine: lifecycle-hooked
//! writes, distinct counts, filter-driven listing and batched deletion.

use std::sync::Arc;

use serde_json::{Map, Value};
use sqlx::{PgPool, Postgres, QueryBuilder, types::Json};

use crate::{
    Error, Result,
    criteria::{Criteria, SortDirection, push_id_bind},
    example::ExampleBuilder,
    filter::{Filter, Sort},
    metamodel::{AttributeKind, Entity, IdKind, IdValue, document_of, id_of},
    metrics,
};

const DEFAULT_REMOVAL_BATCH_SIZE: usize = 1000;

/// Extension point for the service: lifecycle hooks around every write and
/// the restriction-configuration hook consulted before pagination.
pub trait ServiceHooks<T: Entity>: Send + Sync {
    fn before_all(&self, _entity: &T) {}
    fn after_all(&self, _entity: &T) {}
    fn before_insert(&self, _entity: &T) {}
    fn after_insert(&self, _entity: &T) {}
    fn before_update(&self, _entity: &T) {}
    fn after_update(&self, _entity: &T) {}
    fn before_delete(&self, _entity: &T) {}
    fn after_delete(&self, _entity: &T) {}

    /// Called before pagination and filtered counts; the default applies no
    /// additional restrictions.
    fn configure_restrictions(&self, _filter: &Filter<T>, criteria: Criteria) -> Criteria {
        criteria
    }
}

/// No-op hooks.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultHooks;

impl<T: Entity> ServiceHooks<T> for DefaultHooks {}

/// CRUD service for one entity type.
pub struct CrudService<T: Entity> {
    pool: PgPool,
    hooks: Arc<dyn ServiceHooks<T>>,
}

impl<T: Entity> Clone for CrudService<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            hooks: self.hooks.clone(),
        }
    }
}

/// Serialized row of an entity: the primary key (when populated) and the
/// stored document. To-one associations collapse to their foreign key under
/// the declared column; to-many associations are owned by the target side
/// and dropped.
pub(crate) fn entity_row<T: Entity>(entity: &T) -> Result<(Option<IdValue>, Map<String, Value>)> {
    let meta = T::meta();
    let mut doc = document_of(entity)?;
    for attr in meta.attributes {
        match attr.kind {
            AttributeKind::Scalar => {}
            AttributeKind::ToOne { target, column } => {
                if let Some(value) = doc.remove(attr.name) {
                    match value.as_object().and_then(|obj| id_of(target, obj)) {
                        Some(id) => {
                            doc.insert(column.to_owned(), id.to_json());
                        }
                        None => {
                            if !value.is_null() {
                                tracing::warn!(
                                    target: "specimen::service",
                                    entity = meta.entity,
                                    attribute = attr.name,
                                    "to-one value without a primary key stored as null"
                                );
                            }
                            doc.insert(column.to_owned(), Value::Null);
                        }
                    }
                }
            }
            AttributeKind::ToMany { .. } => {
                doc.remove(attr.name);
            }
        }
    }
    let id = IdValue::from_value(meta.id_kind, doc.get(meta.id_attribute));
    Ok((id, doc))
}

impl<T: Entity> CrudService<T> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            hooks: Arc::new(DefaultHooks),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ServiceHooks<T>>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fresh unrestricted criteria over this service's entity.
    pub fn criteria(&self) -> Criteria {
        Criteria::of::<T>()
    }

    /// Starts an example compilation session.
    pub fn examples(&self) -> ExampleBuilder {
        ExampleBuilder::new()
    }

    pub async fn insert(&self, entity: &T) -> Result<()> {
        let meta = T::meta();
        self.hooks.before_all(entity);
        self.hooks.before_insert(entity);
        let (id, mut doc) = entity_row(entity)?;
        let id = match id {
            Some(id) => id,
            None if meta.id_kind == IdKind::Uuid => {
                let generated = uuid::Uuid::new_v4();
                doc.insert(
                    meta.id_attribute.to_owned(),
                    Value::from(generated.to_string()),
                );
                IdValue::Uuid(generated)
            }
            None => {
                return Err(Error::TransientEntity {
                    entity: meta.entity,
                    reason: "insert requires a primary key",
                });
            }
        };
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("insert into {} (id, doc) values (", meta.table));
        push_id_bind(&mut qb, &id);
        qb.push(", ");
        qb.push_bind(Json(Value::Object(doc)));
        qb.push(")");
        qb.build().execute(&self.pool).await?;
        metrics::record_entity_write(1);
        self.hooks.after_insert(entity);
        self.hooks.after_all(entity);
        Ok(())
    }

    pub async fn update(&self, entity: &T) -> Result<()> {
        let meta = T::meta();
        self.hooks.before_all(entity);
        self.hooks.before_update(entity);
        let (id, doc) = entity_row(entity)?;
        let id = id.ok_or(Error::TransientEntity {
            entity: meta.entity,
            reason: "update requires a primary key",
        })?;
        let mut qb = QueryBuilder::<Postgres>::new(format!("update {} set doc = ", meta.table));
        qb.push_bind(Json(Value::Object(doc)));
        qb.push(" where id = ");
        push_id_bind(&mut qb, &id);
        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound {
                entity: meta.entity,
                id: id.to_string(),
            });
        }
        metrics::record_entity_write(1);
        self.hooks.after_update(entity);
        self.hooks.after_all(entity);
        Ok(())
    }

    /// Inserts when the entity carries no primary key, updates otherwise.
    pub async fn save_or_update(&self, entity: &T) -> Result<()> {
        let (id, _) = entity_row(entity)?;
        match id {
            Some(_) => self.update(entity).await,
            None => self.insert(entity).await,
        }
    }

    pub async fn find_by_id(&self, id: impl Into<IdValue>) -> Result<Option<T>> {
        let meta = T::meta();
        let id = id.into();
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("select doc from {} where id = ", meta.table));
        push_id_bind(&mut qb, &id);
        let row: Option<(Value,)> = qb.build_query_as().fetch_optional(&self.pool).await?;
        match row {
            Some((value,)) => Ok(Some(serde_json::from_value(value)?)),
            None => {
                tracing::warn!(
                    target: "specimen::service",
                    entity = meta.entity,
                    id = %id,
                    "record not found"
                );
                Ok(None)
            }
        }
    }

    pub async fn delete(&self, entity: &T) -> Result<()> {
        let meta = T::meta();
        let (id, _) = entity_row(entity)?;
        let id = id.ok_or(Error::TransientEntity {
            entity: meta.entity,
            reason: "delete requires a primary key",
        })?;
        self.hooks.before_all(entity);
        self.hooks.before_delete(entity);
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("delete from {} where id = ", meta.table));
        push_id_bind(&mut qb, &id);
        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound {
                entity: meta.entity,
                id: id.to_string(),
            });
        }
        metrics::record_entity_delete(1);
        self.hooks.after_delete(entity);
        self.hooks.after_all(entity);
        Ok(())
    }

    /// Looks the record up first so lifecycle hooks observe the entity.
    pub async fn delete_by_id(&self, id: impl Into<IdValue>) -> Result<()> {
        let meta = T::meta();
        let id = id.into();
        let entity = self
            .find_by_id(id.clone())
            .await?
            .ok_or_else(|| Error::NotFound {
                entity: meta.entity,
                id: id.to_string(),
            })?;
        self.delete(&entity).await
    }

    pub async fn delete_many(&self, entities: &[T]) -> Result<()> {
        for entity in entities {
            self.delete(entity).await?;
        }
        Ok(())
    }

    /// Deletes the entities in fixed-size windows, one bulk
    /// `delete … where id in (…)` statement per window. A non-positive batch
    /// size falls back to the default of 1000; a window contributing no
    /// primary keys is skipped with a warning. Returns the number of rows
    /// deleted.
    pub async fn delete_batch(&self, entities: &[T], batch_size: i64) -> Result<u64> {
        let meta = T::meta();
        let batch_size = if batch_size < 1 {
            tracing::warn!(
                target: "specimen::service",
                batch_size,
                fallback = DEFAULT_REMOVAL_BATCH_SIZE,
                "invalid batch size for bulk removal"
            );
            DEFAULT_REMOVAL_BATCH_SIZE
        } else {
            batch_size as usize
        };

        let mut deleted = 0u64;
        for (index, window) in entities.chunks(batch_size).enumerate() {
            let mut ids: Vec<IdValue> = Vec::with_capacity(window.len());
            for entity in window {
                let doc = document_of(entity)?;
                match id_of(meta, &doc) {
                    Some(id) => {
                        if !ids.contains(&id) {
                            ids.push(id);
                        }
                    }
                    None => {
                        tracing::warn!(
                            target: "specimen::service",
                            entity = meta.entity,
                            batch = index,
                            "skipping entity without a primary key in bulk removal"
                        );
                    }
                }
            }
            if ids.is_empty() {
                tracing::warn!(
                    target: "specimen::service",
                    entity = meta.entity,
                    batch = index,
                    "skipping batch with no primary keys"
                );
                continue;
            }
            let mut qb =
                QueryBuilder::<Postgres>::new(format!("delete from {} where id in (", meta.table));
            let mut first = true;
            for id in &ids {
                if !first {
                    qb.push(", ");
                }
                first = false;
                push_id_bind(&mut qb, id);
            }
            qb.push(")");
            let result = qb.build().execute(&self.pool).await?;
            tracing::debug!(
                target: "specimen::service",
                entity = meta.entity,
                batch = index,
                deleted = result.rows_affected(),
                "removed batch"
            );
            deleted += result.rows_affected();
        }
        metrics::record_entity_delete(deleted);
        metrics::record_batch_delete(deleted);
        Ok(deleted)
    }

    /// Distinct count of all records.
    pub async fn count(&self) -> Result<i64> {
        self.count_criteria(&self.criteria()).await
    }

    /// Distinct count under the filter's restrictions.
    pub async fn count_filter(&self, filter: &Filter<T>) -> Result<i64> {
        let criteria = self.restriction_criteria(filter)?;
        self.count_criteria(&criteria).await
    }

    /// Distinct count over a pre-populated criteria.
    pub async fn count_criteria(&self, criteria: &Criteria) -> Result<i64> {
        criteria.count(&self.pool).await
    }

    pub async fn list(&self, criteria: &Criteria) -> Result<Vec<T>> {
        criteria.fetch_all(&self.pool).await
    }

    /// Filter-driven listing: restrictions (example entity plus the
    /// configuration hook), then sorting, then offset and page size.
    pub async fn paginate(&self, filter: &Filter<T>) -> Result<Vec<T>> {
        let mut criteria = self.restriction_criteria(filter)?;
        criteria = apply_sort(filter, criteria)?;
        if filter.first() > 0 {
            criteria = criteria.offset(filter.first());
        }
        if filter.page_size() > 0 {
            criteria = criteria.limit(filter.page_size());
        }
        criteria.fetch_all(&self.pool).await
    }

    fn restriction_criteria(&self, filter: &Filter<T>) -> Result<Criteria> {
        let mut criteria = self.criteria();
        if let Some(example) = filter.example() {
            criteria = ExampleBuilder::new()
                .of(example)?
                .with_criteria(criteria)
                .build();
        }
        Ok(self.hooks.configure_restrictions(filter, criteria))
    }
}

fn apply_sort<T: Entity>(filter: &Filter<T>, mut criteria: Criteria) -> Result<Criteria> {
    if filter.multi_sort().is_empty() {
        criteria = add_sort(criteria, filter.sort(), filter.sort_field())?;
    } else {
        for entry in filter.multi_sort() {
            criteria = add_sort(criteria, entry.sort, Some(&entry.field))?;
        }
    }
    Ok(criteria)
}

fn add_sort(criteria: Criteria, sort: Sort, field: Option<&str>) -> Result<Criteria> {
    let Some(field) = field else {
        return Ok(criteria);
    };
    // Unsorted coerces to ascending.
    let direction = if matches!(sort, Sort::Descending) {
        SortDirection::Desc
    } else {
        SortDirection::Asc
    };
    criteria.order_by(field, direction)
}
