//! The query builder: a composable, joinable, orderable restriction set
//! over one root entity, rendered to SQL through `sqlx::QueryBuilder`.
//!
//! Entities live in `(id, doc jsonb)` tables, so attribute expressions are
//! jsonb lookups (`tN.doc -> 'attr'` / `tN.doc ->> 'attr'`) and the id
//! attribute maps to the `id` column. Associations join through the foreign
//! key stored in the owning (to-one) or target (to-many) document.

use std::time::Instant;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder, types::Json};

use crate::{
    Error, Result,
    metamodel::{AttributeKind, AttributeMeta, Entity, EntityMeta, IdValue},
    metrics,
};

/// Direction for sorting results.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn as_str(self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

/// Join flavor for fetch joins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ColumnRef {
    /// The primary-key column.
    Id,
    /// A key inside the jsonb document.
    Key(&'static str),
}

/// A restriction target: one column on one aliased table in the query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FieldRef {
    pub(crate) alias: usize,
    pub(crate) column: ColumnRef,
}

impl FieldRef {
    fn push_json(self, qb: &mut QueryBuilder<'_, Postgres>) {
        match self.column {
            ColumnRef::Id => {
                qb.push(format!("to_jsonb(t{}.id)", self.alias));
            }
            ColumnRef::Key(key) => {
                qb.push(format!("t{}.doc -> '{key}'", self.alias));
            }
        }
    }

    fn push_text(self, qb: &mut QueryBuilder<'_, Postgres>) {
        match self.column {
            ColumnRef::Id => {
                qb.push(format!("t{}.id::text", self.alias));
            }
            ColumnRef::Key(key) => {
                qb.push(format!("t{}.doc ->> '{key}'", self.alias));
            }
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) enum Predicate {
    Eq { field: FieldRef, value: Value },
    NotEq { field: FieldRef, value: Value },
    EqIgnoreCase { field: FieldRef, value: String },
    NotEqIgnoreCase { field: FieldRef, value: String },
    Gt { field: FieldRef, value: Value },
    GtOrEq { field: FieldRef, value: Value },
    Lt { field: FieldRef, value: Value },
    LtOrEq { field: FieldRef, value: Value },
    Like { field: FieldRef, pattern: String },
    NotLike { field: FieldRef, pattern: String },
    LikeIgnoreCase { field: FieldRef, pattern: String },
    NotLikeIgnoreCase { field: FieldRef, pattern: String },
    IsNull { field: FieldRef },
    NotNull { field: FieldRef },
    /// `tN.id in (…)`: membership of the aliased table's primary key.
    IdIn { alias: usize, ids: Vec<IdValue> },
    /// Correlated (not-)exists over a to-many link.
    RelEmpty {
        owner_alias: usize,
        table: &'static str,
        link: &'static str,
        cast: &'static str,
        negate: bool,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

pub(crate) fn push_id_bind<'a>(qb: &mut QueryBuilder<'a, Postgres>, id: &IdValue) {
    match id {
        IdValue::BigInt(v) => {
            qb.push_bind(*v);
        }
        IdValue::Uuid(v) => {
            qb.push_bind(*v);
        }
        IdValue::Text(v) => {
            qb.push_bind(v.clone());
        }
    }
}

fn push_ordered_cmp(
    qb: &mut QueryBuilder<'static, Postgres>,
    field: FieldRef,
    value: &Value,
    op: &str,
) {
    // Numbers compare numerically, everything else as text.
    if let Some(n) = value.as_f64() {
        qb.push("((");
        field.push_text(qb);
        qb.push(")::numeric ");
        qb.push(op);
        qb.push(" ");
        qb.push_bind(n);
        qb.push(")");
    } else {
        let text = value_text(value);
        qb.push("(");
        field.push_text(qb);
        qb.push(" ");
        qb.push(op);
        qb.push(" ");
        qb.push_bind(text);
        qb.push(")");
    }
}

/// Text form of a restriction value: strings verbatim, everything else via
/// its JSON rendering.
pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Predicate {
    fn push_sql(&self, qb: &mut QueryBuilder<'static, Postgres>) {
        match self {
            Predicate::Eq { field, value } => {
                qb.push("(");
                field.push_json(qb);
                qb.push(" = ");
                qb.push_bind(Json(value.clone()));
                qb.push(")");
            }
            Predicate::NotEq { field, value } => {
                qb.push("(");
                field.push_json(qb);
                qb.push(" <> ");
                qb.push_bind(Json(value.clone()));
                qb.push(")");
            }
            Predicate::EqIgnoreCase { field, value } => {
                qb.push("(lower(");
                field.push_text(qb);
                qb.push(") = lower(");
                qb.push_bind(value.clone());
                qb.push("))");
            }
            Predicate::NotEqIgnoreCase { field, value } => {
                qb.push("(lower(");
                field.push_text(qb);
                qb.push(") <> lower(");
                qb.push_bind(value.clone());
                qb.push("))");
            }
            Predicate::Gt { field, value } => push_ordered_cmp(qb, *field, value, ">"),
            Predicate::GtOrEq { field, value } => push_ordered_cmp(qb, *field, value, ">="),
            Predicate::Lt { field, value } => push_ordered_cmp(qb, *field, value, "<"),
            Predicate::LtOrEq { field, value } => push_ordered_cmp(qb, *field, value, "<="),
            Predicate::Like { field, pattern } => {
                qb.push("(");
                field.push_text(qb);
                qb.push(" like ");
                qb.push_bind(pattern.clone());
                qb.push(")");
            }
            Predicate::NotLike { field, pattern } => {
                qb.push("(");
                field.push_text(qb);
                qb.push(" not like ");
                qb.push_bind(pattern.clone());
                qb.push(")");
            }
            Predicate::LikeIgnoreCase { field, pattern } => {
                qb.push("(lower(");
                field.push_text(qb);
                qb.push(") like lower(");
                qb.push_bind(pattern.clone());
                qb.push("))");
            }
            Predicate::NotLikeIgnoreCase { field, pattern } => {
                qb.push("(lower(");
                field.push_text(qb);
                qb.push(") not like lower(");
                qb.push_bind(pattern.clone());
                qb.push("))");
            }
            Predicate::IsNull { field } => {
                qb.push("(");
                field.push_text(qb);
                qb.push(" is null)");
            }
            Predicate::NotNull { field } => {
                qb.push("(");
                field.push_text(qb);
                qb.push(" is not null)");
            }
            Predicate::IdIn { alias, ids } => {
                if ids.is_empty() {
                    qb.push("false");
                } else {
                    qb.push(format!("(t{alias}.id in ("));
                    let mut first = true;
                    for id in ids {
                        if !first {
                            qb.push(", ");
                        }
                        first = false;
                        push_id_bind(qb, id);
                    }
                    qb.push("))");
                }
            }
            Predicate::RelEmpty {
                owner_alias,
                table,
                link,
                cast,
                negate,
            } => {
                if *negate {
                    qb.push("exists (");
                } else {
                    qb.push("not exists (");
                }
                qb.push(format!(
                    "select 1 from {table} x where (x.doc ->> '{link}'){cast} = t{owner_alias}.id"
                ));
                qb.push(")");
            }
            Predicate::And(predicates) => {
                if predicates.is_empty() {
                    qb.push("true");
                } else {
                    qb.push("(");
                    let mut iter = predicates.iter();
                    if let Some(first) = iter.next() {
                        first.push_sql(qb);
                    }
                    for predicate in iter {
                        qb.push(" and ");
                        predicate.push_sql(qb);
                    }
                    qb.push(")");
                }
            }
            Predicate::Or(predicates) => {
                if predicates.is_empty() {
                    qb.push("false");
                } else {
                    qb.push("(");
                    let mut iter = predicates.iter();
                    if let Some(first) = iter.next() {
                        first.push_sql(qb);
                    }
                    for predicate in iter {
                        qb.push(" or ");
                        predicate.push_sql(qb);
                    }
                    qb.push(")");
                }
            }
        }
    }

    fn remap(self, map: &[usize]) -> Predicate {
        let f = |field: FieldRef| FieldRef {
            alias: map[field.alias],
            column: field.column,
        };
        match self {
            Predicate::Eq { field, value } => Predicate::Eq {
                field: f(field),
                value,
            },
            Predicate::NotEq { field, value } => Predicate::NotEq {
                field: f(field),
                value,
            },
            Predicate::EqIgnoreCase { field, value } => Predicate::EqIgnoreCase {
                field: f(field),
                value,
            },
            Predicate::NotEqIgnoreCase { field, value } => Predicate::NotEqIgnoreCase {
                field: f(field),
                value,
            },
            Predicate::Gt { field, value } => Predicate::Gt {
                field: f(field),
                value,
            },
            Predicate::GtOrEq { field, value } => Predicate::GtOrEq {
                field: f(field),
                value,
            },
            Predicate::Lt { field, value } => Predicate::Lt {
                field: f(field),
                value,
            },
            Predicate::LtOrEq { field, value } => Predicate::LtOrEq {
                field: f(field),
                value,
            },
            Predicate::Like { field, pattern } => Predicate::Like {
                field: f(field),
                pattern,
            },
            Predicate::NotLike { field, pattern } => Predicate::NotLike {
                field: f(field),
                pattern,
            },
            Predicate::LikeIgnoreCase { field, pattern } => Predicate::LikeIgnoreCase {
                field: f(field),
                pattern,
            },
            Predicate::NotLikeIgnoreCase { field, pattern } => Predicate::NotLikeIgnoreCase {
                field: f(field),
                pattern,
            },
            Predicate::IsNull { field } => Predicate::IsNull { field: f(field) },
            Predicate::NotNull { field } => Predicate::NotNull { field: f(field) },
            Predicate::IdIn { alias, ids } => Predicate::IdIn {
                alias: map[alias],
                ids,
            },
            Predicate::RelEmpty {
                owner_alias,
                table,
                link,
                cast,
                negate,
            } => Predicate::RelEmpty {
                owner_alias: map[owner_alias],
                table,
                link,
                cast,
                negate,
            },
            Predicate::And(inner) => {
                Predicate::And(inner.into_iter().map(|p| p.remap(map)).collect())
            }
            Predicate::Or(inner) => Predicate::Or(inner.into_iter().map(|p| p.remap(map)).collect()),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Join {
    owner: usize,
    alias: usize,
    attr: &'static AttributeMeta,
    left: bool,
}

#[derive(Clone, Copy, Debug)]
struct Fetch {
    alias: usize,
    key: &'static str,
}

#[derive(Clone, Copy, Debug)]
struct SortSpec {
    field: FieldRef,
    direction: SortDirection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SelectMode {
    Docs,
    CountDistinct,
}

/// A composed, joined, filterable query over one root entity.
#[derive(Clone, Debug)]
pub struct Criteria {
    aliases: Vec<&'static EntityMeta>,
    joins: Vec<Join>,
    predicates: Vec<Predicate>,
    fetches: Vec<Fetch>,
    sorts: Vec<SortSpec>,
    limit: Option<i64>,
    offset: Option<i64>,
    distinct: bool,
}

impl Criteria {
    pub fn of<T: Entity>() -> Self {
        Self::of_meta(T::meta())
    }

    pub(crate) fn of_meta(meta: &'static EntityMeta) -> Self {
        Self {
            aliases: vec![meta],
            joins: Vec::new(),
            predicates: Vec::new(),
            fetches: Vec::new(),
            sorts: Vec::new(),
            limit: None,
            offset: None,
            distinct: false,
        }
    }

    pub fn root(&self) -> &'static EntityMeta {
        self.aliases[0]
    }

    pub(crate) fn has_predicates(&self) -> bool {
        !self.predicates.is_empty()
    }

    /// Resolves a singular attribute name on the root entity; unknown or
    /// plural names produce no restriction (a warning is logged), matching
    /// the permissive by-example style.
    fn root_field(&self, name: &str) -> Option<FieldRef> {
        let meta = self.root();
        if name == meta.id_attribute {
            return Some(FieldRef {
                alias: 0,
                column: ColumnRef::Id,
            });
        }
        match meta.attribute(name) {
            Some(attr) if matches!(attr.kind, AttributeKind::Scalar) => Some(FieldRef {
                alias: 0,
                column: ColumnRef::Key(attr.name),
            }),
            _ => {
                tracing::warn!(
                    target: "specimen::criteria",
                    entity = meta.entity,
                    attribute = name,
                    "ignoring restriction on unknown or non-scalar attribute"
                );
                None
            }
        }
    }

    pub(crate) fn field_for(&self, alias: usize, attr_name: &'static str) -> FieldRef {
        let meta = self.aliases[alias];
        if attr_name == meta.id_attribute {
            FieldRef {
                alias,
                column: ColumnRef::Id,
            }
        } else {
            FieldRef {
                alias,
                column: ColumnRef::Key(attr_name),
            }
        }
    }

    pub(crate) fn push_predicate(&mut self, predicate: Predicate) {
        self.predicates.push(predicate);
    }

    fn scalar(mut self, name: &str, build: impl FnOnce(FieldRef) -> Predicate) -> Self {
        if let Some(field) = self.root_field(name) {
            self.predicates.push(build(field));
        }
        self
    }

    pub fn eq(self, name: &str, value: impl Serialize) -> Self {
        let value = to_value(value);
        self.scalar(name, |field| Predicate::Eq { field, value })
    }

    pub fn not_eq(self, name: &str, value: impl Serialize) -> Self {
        let value = to_value(value);
        self.scalar(name, |field| Predicate::NotEq { field, value })
    }

    pub fn eq_ignore_case(self, name: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        self.scalar(name, |field| Predicate::EqIgnoreCase { field, value })
    }

    pub fn not_eq_ignore_case(self, name: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        self.scalar(name, |field| Predicate::NotEqIgnoreCase { field, value })
    }

    pub fn gt(self, name: &str, value: impl Serialize) -> Self {
        let value = to_value(value);
        self.scalar(name, |field| Predicate::Gt { field, value })
    }

    pub fn gt_or_eq(self, name: &str, value: impl Serialize) -> Self {
        let value = to_value(value);
        self.scalar(name, |field| Predicate::GtOrEq { field, value })
    }

    pub fn lt(self, name: &str, value: impl Serialize) -> Self {
        let value = to_value(value);
        self.scalar(name, |field| Predicate::Lt { field, value })
    }

    pub fn lt_or_eq(self, name: &str, value: impl Serialize) -> Self {
        let value = to_value(value);
        self.scalar(name, |field| Predicate::LtOrEq { field, value })
    }

    pub fn like(self, name: &str, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        self.scalar(name, |field| Predicate::Like { field, pattern })
    }

    pub fn not_like(self, name: &str, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        self.scalar(name, |field| Predicate::NotLike { field, pattern })
    }

    pub fn like_ignore_case(self, name: &str, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        self.scalar(name, |field| Predicate::LikeIgnoreCase { field, pattern })
    }

    pub fn not_like_ignore_case(self, name: &str, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        self.scalar(name, |field| Predicate::NotLikeIgnoreCase { field, pattern })
    }

    pub fn is_null(self, name: &str) -> Self {
        self.scalar(name, |field| Predicate::IsNull { field })
    }

    pub fn not_null(self, name: &str) -> Self {
        self.scalar(name, |field| Predicate::NotNull { field })
    }

    /// Restricts the root primary key to the given set.
    pub fn id_in(mut self, ids: Vec<IdValue>) -> Self {
        self.predicates.push(Predicate::IdIn { alias: 0, ids });
        self
    }

    pub(crate) fn id_in_at(&mut self, alias: usize, ids: Vec<IdValue>) {
        self.predicates.push(Predicate::IdIn { alias, ids });
    }

    /// Restricts a to-many association on the root to be empty.
    pub fn empty(self, name: &str) -> Self {
        self.rel_cardinality(name, false)
    }

    /// Restricts a to-many association on the root to be non-empty.
    pub fn not_empty(self, name: &str) -> Self {
        self.rel_cardinality(name, true)
    }

    fn rel_cardinality(mut self, name: &str, negate: bool) -> Self {
        let meta = self.root();
        match meta.attribute(name) {
            Some(attr) => {
                if let Some(predicate) = rel_empty_predicate(0, meta, attr, negate) {
                    self.predicates.push(predicate);
                } else {
                    tracing::warn!(
                        target: "specimen::criteria",
                        entity = meta.entity,
                        attribute = name,
                        "empty/not-empty applies to to-many attributes only; no restriction applied"
                    );
                }
            }
            None => {
                tracing::warn!(
                    target: "specimen::criteria",
                    entity = meta.entity,
                    attribute = name,
                    "ignoring cardinality restriction on unknown attribute"
                );
            }
        }
        self
    }

    /// Joins a sub-query through an association attribute of the root
    /// entity, merging the sub-query's own joins and restrictions.
    pub fn join(mut self, attr_name: &str, sub: Criteria) -> Result<Self> {
        let meta = self.root();
        let attr = meta
            .attribute(attr_name)
            .filter(|a| a.is_association())
            .ok_or_else(|| Error::UnknownAttribute {
                entity: meta.entity,
                field: attr_name.to_owned(),
            })?;
        self.join_sub(0, attr, sub);
        Ok(self)
    }

    /// Attaches `sub` (a criteria over the association's target entity) via
    /// `attr` declared on the entity at `owner`. Returns the alias the
    /// target received.
    pub(crate) fn join_sub(
        &mut self,
        owner: usize,
        attr: &'static AttributeMeta,
        sub: Criteria,
    ) -> usize {
        debug_assert!(attr.is_association());
        let mut map = vec![0usize; sub.aliases.len()];
        let alias = self.aliases.len();
        self.aliases.push(sub.aliases[0]);
        map[0] = alias;
        self.joins.push(Join {
            owner,
            alias,
            attr,
            left: attr.is_plural(),
        });
        for join in &sub.joins {
            let nested = self.aliases.len();
            self.aliases.push(sub.aliases[join.alias]);
            map[join.alias] = nested;
            self.joins.push(Join {
                owner: map[join.owner],
                alias: nested,
                attr: join.attr,
                left: join.left,
            });
        }
        for predicate in sub.predicates {
            self.predicates.push(predicate.remap(&map));
        }
        for fetch in sub.fetches {
            self.fetches.push(Fetch {
                alias: map[fetch.alias],
                key: fetch.key,
            });
        }
        alias
    }

    /// Eagerly loads a to-one association into the result documents: the
    /// joined doc is overlaid under the association key.
    pub fn fetch(mut self, attr_name: &str, kind: JoinKind) -> Result<Self> {
        let meta = self.root();
        let attr = meta
            .attribute(attr_name)
            .filter(|a| matches!(a.kind, AttributeKind::ToOne { .. }))
            .ok_or_else(|| Error::UnknownAttribute {
                entity: meta.entity,
                field: attr_name.to_owned(),
            })?;
        self.fetch_to_one(attr, kind);
        Ok(self)
    }

    pub(crate) fn fetch_to_one(&mut self, attr: &'static AttributeMeta, kind: JoinKind) {
        let target = attr.target().expect("fetch requires an association");
        let alias = self.join_sub(0, attr, Criteria::of_meta(target));
        if let Some(join) = self.joins.iter_mut().find(|j| j.alias == alias) {
            join.left = matches!(kind, JoinKind::Left);
        }
        self.fetches.push(Fetch {
            alias,
            key: attr.name,
        });
    }

    /// Composes independently-built criteria over the same root as a
    /// disjunction. Each branch's joins are merged in; its restrictions form
    /// one arm of the `or`.
    pub fn or(mut self, branches: Vec<Criteria>) -> Self {
        let mut arms = Vec::with_capacity(branches.len());
        for branch in branches {
            let mut map = vec![0usize; branch.aliases.len()];
            for join in &branch.joins {
                let alias = self.aliases.len();
                self.aliases.push(branch.aliases[join.alias]);
                map[join.alias] = alias;
                self.joins.push(Join {
                    owner: map[join.owner],
                    alias,
                    attr: join.attr,
                    left: join.left,
                });
            }
            let mut arm: Vec<Predicate> = branch
                .predicates
                .into_iter()
                .map(|p| p.remap(&map))
                .collect();
            match arm.len() {
                0 => {}
                1 => arms.push(arm.remove(0)),
                _ => arms.push(Predicate::And(arm)),
            }
        }
        if !arms.is_empty() {
            self.predicates.push(Predicate::Or(arms));
        }
        self
    }

    pub fn order_asc(self, field: &str) -> Result<Self> {
        self.order_by(field, SortDirection::Asc)
    }

    pub fn order_desc(self, field: &str) -> Result<Self> {
        self.order_by(field, SortDirection::Desc)
    }

    pub fn order_by(mut self, field: &str, direction: SortDirection) -> Result<Self> {
        let meta = self.root();
        let column = if field == meta.id_attribute {
            ColumnRef::Id
        } else {
            match meta.attribute(field) {
                Some(attr) if attr.is_singular() => match attr.kind {
                    AttributeKind::Scalar => ColumnRef::Key(attr.name),
                    AttributeKind::ToOne { column, .. } => ColumnRef::Key(column),
                    AttributeKind::ToMany { .. } => unreachable!(),
                },
                _ => {
                    return Err(Error::UnknownAttribute {
                        entity: meta.entity,
                        field: field.to_owned(),
                    });
                }
            }
        };
        self.sorts.push(SortSpec {
            field: FieldRef { alias: 0, column },
            direction,
        });
        Ok(self)
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit.max(0));
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset.max(0));
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    fn is_distinct(&self) -> bool {
        // Joins fan results out; counting and listing must not observe that.
        self.distinct || !self.joins.is_empty()
    }

    fn push_sort_expr(&self, qb: &mut QueryBuilder<'static, Postgres>, spec: &SortSpec) {
        match spec.field.column {
            ColumnRef::Id => {
                qb.push(format!("t{}.id", spec.field.alias));
            }
            ColumnRef::Key(key) => {
                // jsonb ordering sorts numbers numerically and strings
                // lexicographically.
                qb.push(format!("t{}.doc -> '{key}'", spec.field.alias));
            }
        }
    }

    fn build_query(&self, mode: SelectMode) -> QueryBuilder<'static, Postgres> {
        let mut qb = QueryBuilder::new("select ");
        let distinct = self.is_distinct();

        match mode {
            SelectMode::CountDistinct => {
                qb.push("count(distinct t0.id)");
            }
            SelectMode::Docs => {
                if distinct {
                    qb.push("distinct ");
                }
                if self.fetches.is_empty() {
                    qb.push("t0.doc");
                } else {
                    for _ in &self.fetches {
                        qb.push("jsonb_set(");
                    }
                    qb.push("t0.doc");
                    for fetch in &self.fetches {
                        qb.push(format!(
                            ", '{{{key}}}', coalesce(t{alias}.doc, 'null'::jsonb), true)",
                            key = fetch.key,
                            alias = fetch.alias
                        ));
                    }
                }
                qb.push(" as doc");
                if distinct {
                    // Postgres requires order-by expressions of a distinct
                    // select to appear in the select list.
                    for spec in &self.sorts {
                        qb.push(", ");
                        self.push_sort_expr(&mut qb, spec);
                    }
                }
            }
        }

        qb.push(format!(" from {} t0", self.root().table));

        for join in &self.joins {
            let target = self.aliases[join.alias];
            let owner = self.aliases[join.owner];
            qb.push(if join.left { " left join " } else { " join " });
            qb.push(format!("{} t{}", target.table, join.alias));
            qb.push(" on ");
            match join.attr.kind {
                AttributeKind::ToOne { column, .. } => {
                    qb.push(format!(
                        "t{alias}.id = (t{owner}.doc ->> '{column}'){cast}",
                        alias = join.alias,
                        owner = join.owner,
                        cast = target.id_kind.cast()
                    ));
                }
                AttributeKind::ToMany { link, .. } => {
                    qb.push(format!(
                        "(t{alias}.doc ->> '{link}'){cast} = t{owner}.id",
                        alias = join.alias,
                        owner = join.owner,
                        cast = owner.id_kind.cast()
                    ));
                }
                AttributeKind::Scalar => unreachable!("scalar attributes never join"),
            }
        }

        if !self.predicates.is_empty() {
            qb.push(" where ");
            let mut iter = self.predicates.iter();
            if let Some(first) = iter.next() {
                first.push_sql(&mut qb);
            }
            for predicate in iter {
                qb.push(" and ");
                predicate.push_sql(&mut qb);
            }
        }

        if mode == SelectMode::Docs {
            if !self.sorts.is_empty() {
                qb.push(" order by ");
                let mut first = true;
                for spec in &self.sorts {
                    if !first {
                        qb.push(", ");
                    }
                    first = false;
                    self.push_sort_expr(&mut qb, spec);
                    qb.push(" ");
                    qb.push(spec.direction.as_str());
                }
            }
            if let Some(limit) = self.limit {
                qb.push(" limit ");
                qb.push_bind(limit);
            }
            if let Some(offset) = self.offset {
                qb.push(" offset ");
                qb.push_bind(offset);
            }
        }

        qb
    }

    /// Rendered SQL with `$n` placeholders, for logging and tests.
    pub fn to_sql(&self) -> String {
        self.build_query(SelectMode::Docs).sql().to_string()
    }

    pub async fn fetch_all<T: DeserializeOwned>(&self, pool: &PgPool) -> Result<Vec<T>> {
        let mut qb = self.build_query(SelectMode::Docs);
        let sql_captured = qb.sql().to_string();
        let query = qb.build_query_as::<(Value,)>();
        let start = Instant::now();
        let rows = query.fetch_all(pool).await?;
        finish_query("criteria_fetch_all", &sql_captured, start);
        rows.into_iter()
            .map(|(value,)| serde_json::from_value(value).map_err(Into::into))
            .collect()
    }

    pub async fn fetch_optional<T: DeserializeOwned>(&self, pool: &PgPool) -> Result<Option<T>> {
        let mut qb = self.build_query(SelectMode::Docs);
        let sql_captured = qb.sql().to_string();
        let query = qb.build_query_as::<(Value,)>();
        let start = Instant::now();
        let row = query.fetch_optional(pool).await?;
        finish_query("criteria_fetch_optional", &sql_captured, start);
        match row {
            Some((value,)) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn fetch_one<T: DeserializeOwned>(&self, pool: &PgPool) -> Result<T> {
        let mut qb = self.build_query(SelectMode::Docs);
        let sql_captured = qb.sql().to_string();
        let query = qb.build_query_as::<(Value,)>();
        let start = Instant::now();
        let (value,) = query.fetch_one(pool).await?;
        finish_query("criteria_fetch_one", &sql_captured, start);
        Ok(serde_json::from_value(value)?)
    }

    /// Distinct count over the root primary key, immune to join fan-out.
    pub async fn count(&self, pool: &PgPool) -> Result<i64> {
        let mut qb = self.build_query(SelectMode::CountDistinct);
        let sql_captured = qb.sql().to_string();
        let query = qb.build_query_as::<(i64,)>();
        let start = Instant::now();
        let (count,) = query.fetch_one(pool).await?;
        finish_query("criteria_count", &sql_captured, start);
        Ok(count)
    }
}

/// Builds the exists/not-exists predicate for a to-many attribute, if the
/// attribute is to-many.
pub(crate) fn rel_empty_predicate(
    owner_alias: usize,
    owner: &EntityMeta,
    attr: &AttributeMeta,
    negate: bool,
) -> Option<Predicate> {
    match attr.kind {
        AttributeKind::ToMany { target, link, .. } => Some(Predicate::RelEmpty {
            owner_alias,
            table: target.table,
            link,
            cast: owner.id_kind.cast(),
            negate,
        }),
        _ => None,
    }
}

fn to_value(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn finish_query(op: &'static str, sql: &str, start: Instant) {
    let elapsed = start.elapsed();
    metrics::record_query_duration(elapsed);
    if elapsed > std::time::Duration::from_millis(500) {
        tracing::warn!(
            target: "specimen::slow_query",
            elapsed_ms = elapsed.as_millis() as u64,
            op,
            sql = %sql,
            "slow criteria query"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::{Brand, Car};

    #[test]
    fn scalar_restrictions_render_against_the_document() {
        let sql = Criteria::of::<Car>().eq("model", "S").to_sql();
        assert_eq!(
            sql,
            "select t0.doc as doc from cars t0 where (t0.doc -> 'model' = $1)"
        );
    }

    #[test]
    fn id_restrictions_use_the_id_column() {
        let sql = Criteria::of::<Car>().eq("id", 1).to_sql();
        assert_eq!(
            sql,
            "select t0.doc as doc from cars t0 where (to_jsonb(t0.id) = $1)"
        );
    }

    #[test]
    fn unknown_attribute_restrictions_are_dropped() {
        let sql = Criteria::of::<Car>().eq("bogus", 1).to_sql();
        assert_eq!(sql, "select t0.doc as doc from cars t0");
    }

    #[test]
    fn pattern_and_case_insensitive_forms_use_the_text_expression() {
        let sql = Criteria::of::<Car>()
            .like_ignore_case("model", "%rrari")
            .to_sql();
        assert!(sql.contains("lower(t0.doc ->> 'model') like lower($1)"), "{sql}");

        let sql = Criteria::of::<Car>().not_eq_ignore_case("name", "fusion").to_sql();
        assert!(sql.contains("lower(t0.doc ->> 'name') <> lower($1)"), "{sql}");
    }

    #[test]
    fn ordered_comparisons_cast_numeric_values() {
        let sql = Criteria::of::<Car>().lt_or_eq("price", 12.999).to_sql();
        assert!(sql.contains("((t0.doc ->> 'price')::numeric <= $1)"), "{sql}");

        let sql = Criteria::of::<Car>().gt("model", "S").to_sql();
        assert!(sql.contains("(t0.doc ->> 'model' > $1)"), "{sql}");
    }

    #[test]
    fn joined_sub_criteria_restrict_through_the_foreign_key() {
        let sub = Criteria::of::<Brand>().eq("name", "Nissan");
        let sql = Criteria::of::<Car>().join("brand", sub).unwrap().to_sql();
        assert_eq!(
            sql,
            "select distinct t0.doc as doc from cars t0 \
             join brands t1 on t1.id = (t0.doc ->> 'brand_id')::bigint \
             where (t1.doc -> 'name' = $1)"
        );
    }

    #[test]
    fn to_many_joins_go_through_the_target_link_column() {
        let sub = Criteria::of::<Car>().eq("model", "S");
        let sql = Criteria::of::<Brand>().join("cars", sub).unwrap().to_sql();
        assert_eq!(
            sql,
            "select distinct t0.doc as doc from brands t0 \
             left join cars t1 on (t1.doc ->> 'brand_id')::bigint = t0.id \
             where (t1.doc -> 'model' = $1)"
        );
    }

    #[test]
    fn or_merges_branches_into_one_disjunction() {
        let by_model = Criteria::of::<Car>().eq("model", "S");
        let by_name = Criteria::of::<Car>().eq("name", "Fusion");
        let sql = Criteria::of::<Car>()
            .eq("price", 10.0)
            .or(vec![by_model, by_name])
            .to_sql();
        assert!(
            sql.contains(
                "where (t0.doc -> 'price' = $1) and \
                 ((t0.doc -> 'model' = $2) or (t0.doc -> 'name' = $3))"
            ),
            "{sql}"
        );
    }

    #[test]
    fn or_branches_carry_their_joins_along() {
        let by_brand = Criteria::of::<Car>()
            .join("brand", Criteria::of::<Brand>().eq("name", "Nissan"))
            .unwrap();
        let by_model = Criteria::of::<Car>().eq("model", "S");
        let sql = Criteria::of::<Car>().or(vec![by_model, by_brand]).to_sql();
        assert!(sql.contains("join brands t1 on t1.id = (t0.doc ->> 'brand_id')::bigint"), "{sql}");
        assert!(
            sql.contains("where ((t0.doc -> 'model' = $1) or (t1.doc -> 'name' = $2))"),
            "{sql}"
        );
    }

    #[test]
    fn sorting_and_paging_render_in_order() {
        let sql = Criteria::of::<Car>()
            .order_asc("id")
            .unwrap()
            .order_desc("model")
            .unwrap()
            .limit(1)
            .offset(2)
            .to_sql();
        assert_eq!(
            sql,
            "select t0.doc as doc from cars t0 \
             order by t0.id asc, t0.doc -> 'model' desc limit $1 offset $2"
        );
    }

    #[test]
    fn unknown_sort_fields_error() {
        let err = Criteria::of::<Car>().order_asc("bogus").unwrap_err();
        assert!(matches!(err, Error::UnknownAttribute { .. }));
        let err = Criteria::of::<Brand>().order_asc("cars").unwrap_err();
        assert!(matches!(err, Error::UnknownAttribute { .. }));
    }

    #[test]
    fn distinct_selects_replay_sort_expressions() {
        let sub = Criteria::of::<Brand>().eq("name", "Tesla");
        let sql = Criteria::of::<Car>()
            .join("brand", sub)
            .unwrap()
            .order_asc("name")
            .unwrap()
            .to_sql();
        assert!(
            sql.starts_with("select distinct t0.doc as doc, t0.doc -> 'name' from cars t0"),
            "{sql}"
        );
        assert!(sql.ends_with("order by t0.doc -> 'name' asc"), "{sql}");
    }

    #[test]
    fn counts_are_distinct_over_the_root_primary_key() {
        let sub = Criteria::of::<Brand>().eq("name", "Nissan");
        let criteria = Criteria::of::<Car>().join("brand", sub).unwrap();
        let sql = criteria
            .build_query(SelectMode::CountDistinct)
            .sql()
            .to_string();
        assert!(sql.starts_with("select count(distinct t0.id) from cars t0"), "{sql}");
        assert!(!sql.contains("order by"), "{sql}");
    }

    #[test]
    fn fetch_overlays_the_joined_document() {
        let sql = Criteria::of::<Car>()
            .fetch("brand", JoinKind::Left)
            .unwrap()
            .to_sql();
        assert!(
            sql.starts_with(
                "select distinct jsonb_set(t0.doc, '{brand}', \
                 coalesce(t1.doc, 'null'::jsonb), true) as doc from cars t0"
            ),
            "{sql}"
        );
        assert!(sql.contains(" left join brands t1 on "), "{sql}");
    }

    #[test]
    fn empty_and_not_empty_render_correlated_subqueries() {
        let sql = Criteria::of::<Brand>().empty("cars").to_sql();
        assert!(
            sql.contains(
                "not exists (select 1 from cars x \
                 where (x.doc ->> 'brand_id')::bigint = t0.id)"
            ),
            "{sql}"
        );
        let sql = Criteria::of::<Brand>().not_empty("cars").to_sql();
        assert!(sql.contains("exists (select 1 from cars x"), "{sql}");
        assert!(!sql.contains("not exists"), "{sql}");
    }

    #[test]
    fn id_in_binds_every_member() {
        let sql = Criteria::of::<Car>()
            .id_in(vec![IdValue::BigInt(1), IdValue::BigInt(3)])
            .to_sql();
        assert!(sql.contains("(t0.id in ($1, $2))"), "{sql}");

        let sql = Criteria::of::<Car>().id_in(Vec::new()).to_sql();
        assert!(sql.contains("where false"), "{sql}");
    }
}
