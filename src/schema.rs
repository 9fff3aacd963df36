//! Schema management: derives per-entity DDL from a [`Metamodel`] and
//! applies the missing pieces (plan / apply / sync).

use std::collections::HashSet;

use indoc::formatdoc;
use sqlx::PgPool;

use crate::{Result, metamodel::Metamodel};

#[derive(Clone, Debug)]
pub struct SchemaAction {
    summary: String,
    sql: String,
}

impl SchemaAction {
    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

#[derive(Clone, Debug, Default)]
pub struct SchemaPlan {
    actions: Vec<SchemaAction>,
}

impl SchemaPlan {
    pub fn actions(&self) -> &[SchemaAction] {
        &self.actions
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    fn push_action(&mut self, summary: impl Into<String>, sql: impl Into<String>) {
        self.actions.push(SchemaAction {
            summary: summary.into(),
            sql: sql.into(),
        });
    }
}

#[derive(Clone, Debug)]
pub struct SchemaManager {
    pool: PgPool,
}

impl SchemaManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Computes the DDL still missing for the metamodel's entities.
    pub async fn plan(&self, metamodel: &Metamodel) -> Result<SchemaPlan> {
        let mut plan = SchemaPlan::default();
        let existing = self.existing_tables().await?;

        let mut entities: Vec<_> = metamodel.entries().collect();
        entities.sort_by_key(|meta| meta.entity);
        for meta in entities {
            if existing.contains(meta.table) {
                continue;
            }
            plan.push_action(
                format!("create table {}", quote_ident(meta.table)),
                formatdoc!(
                    r#"
                    create table if not exists {table} (
                        id {id_type} primary key,
                        doc jsonb not null
                    )
                    "#,
                    table = quote_ident(meta.table),
                    id_type = meta.id_kind.sql_type(),
                ),
            );
            plan.push_action(
                format!("create index {}", quote_ident(&format!("{}_doc_gin", meta.table))),
                format!(
                    "create index if not exists {index} on {table} using gin (doc jsonb_path_ops)",
                    index = quote_ident(&format!("{}_doc_gin", meta.table)),
                    table = quote_ident(meta.table),
                ),
            );
        }
        Ok(plan)
    }

    pub async fn apply(&self, plan: &SchemaPlan) -> Result<()> {
        if plan.actions.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for action in &plan.actions {
            sqlx::query(action.sql()).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn sync(&self, metamodel: &Metamodel) -> Result<SchemaPlan> {
        let plan = self.plan(metamodel).await?;
        if !plan.is_empty() {
            self.apply(&plan).await?;
        }
        Ok(plan)
    }

    async fn existing_tables(&self) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "select table_name from information_schema.tables where table_schema = current_schema()",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}

pub fn qualified_name(schema: &str, ident: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(ident))
}

pub fn quote_ident(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{escaped}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified() {
        assert_eq!(qualified_name("public", "cars"), "\"public\".\"cars\"");
    }

    #[test]
    fn quote_handles_quotes() {
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }
}
