//! Query-by-example compilation: a partially-populated entity instance is
//! turned into a [`Criteria`] restricting on its populated fields.
//!
//! Directly-declared scalar fields restrict their own column; to-one
//! associations restrict the stored foreign key by the example's primary
//! key; to-many associations become an `id in (…)` join over the extracted
//! element ids. An attribute that is not declared on the root entity is
//! hunted down through the association graph and restricted behind the
//! discovered join chain.
//!
//! Compilation is best-effort: a field that cannot drive a restriction is
//! skipped, recorded as a [`Diagnostic`], and logged; it never fails the
//! whole query.

use std::collections::HashSet;
use std::mem;

use serde_json::{Map, Value};

use crate::{
    Result,
    criteria::{Criteria, JoinKind, Predicate, rel_empty_predicate, value_text},
    metamodel::{
        AttributeKind, AttributeMeta, Entity, EntityMeta, IdValue, collection_elements,
        document_of, id_of,
    },
    metrics,
};

/// Restriction semantics for one example attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComparisonOperation {
    Eq,
    EqIgnoreCase,
    NotEq,
    NotEqIgnoreCase,
    Gt,
    GtOrEq,
    Lt,
    LtOrEq,
    IsNull,
    NotNull,
    Like,
    LikeIgnoreCase,
    NotLike,
    NotLikeIgnoreCase,
    IsEmpty,
    NotEmpty,
}

impl ComparisonOperation {
    /// Null-safe operations fire even when the example's field is null: the
    /// check is about presence, not a value.
    pub fn is_null_safe(self) -> bool {
        matches!(self, ComparisonOperation::IsNull | ComparisonOperation::NotNull)
    }
}

/// One best-effort skip observed during compilation. Retrievable from the
/// DSL so callers (and tests) can assert on what was ignored rather than
/// only on the final query shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Diagnostic {
    /// The requested attribute exists nowhere in the reachable association
    /// graph.
    UnresolvedAttribute { attribute: String },
    /// A to-many example field was null, empty, or became empty after id
    /// extraction.
    EmptyCollection { attribute: String },
    /// A to-many example field held something other than its declared
    /// collection shape.
    NonCollectionValue { attribute: String },
    /// One or more collection elements carried no usable primary key.
    MissingElementId { attribute: String },
    /// A to-one example value carried no usable primary key.
    AssociationWithoutId { attribute: String },
    /// The operation cannot apply to this attribute; no restriction added.
    UnsupportedOperation {
        attribute: String,
        operation: ComparisonOperation,
    },
    /// An OR group needs at least two attributes to be a disjunction.
    DegenerateOrGroup { provided: usize },
}

/// Entry point mirroring the service side: `examples().of(&car)` starts a
/// compilation session.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExampleBuilder;

impl ExampleBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Binds an example instance, starting a compilation session over a
    /// fresh, unrestricted criteria.
    pub fn of<T: Entity>(&self, example: &T) -> Result<ExampleDsl> {
        let doc = document_of(example)?;
        Ok(ExampleDsl {
            meta: T::meta(),
            doc,
            criteria: Criteria::of_meta(T::meta()),
            has_restrictions: false,
            diagnostics: Vec::new(),
        })
    }
}

/// An attribute reference: optionally qualified by the declaring entity
/// (`"brand.name"`), otherwise matched by name alone.
#[derive(Clone, Copy, Debug)]
struct AttrRef<'a> {
    qualifier: Option<&'a str>,
    name: &'a str,
}

impl<'a> AttrRef<'a> {
    fn parse(raw: &'a str) -> Self {
        match raw.split_once('.') {
            Some((qualifier, name)) => Self {
                qualifier: Some(qualifier),
                name,
            },
            None => Self {
                qualifier: None,
                name: raw,
            },
        }
    }

    fn matches(&self, declaring: &EntityMeta, attr: &AttributeMeta) -> bool {
        attr.name == self.name && self.qualifier.map_or(true, |q| q == declaring.entity)
    }
}

fn resolve_direct(
    meta: &'static EntityMeta,
    query: AttrRef<'_>,
) -> Option<&'static AttributeMeta> {
    meta.attributes
        .iter()
        .find(|attr| query.matches(meta, attr))
}

/// Treats JSON null like an absent field.
fn present<'d>(value: Option<&'d Value>) -> Option<&'d Value> {
    value.filter(|v| !v.is_null())
}

/// One compilation session over a single example instance.
#[derive(Debug)]
pub struct ExampleDsl {
    meta: &'static EntityMeta,
    doc: Map<String, Value>,
    criteria: Criteria,
    has_restrictions: bool,
    diagnostics: Vec<Diagnostic>,
}

impl ExampleDsl {
    /// Restricts on the given attributes with `EQ`; with no attributes, every
    /// declared attribute of the example's type is considered (null fields
    /// are skipped downstream).
    pub fn with(self, attributes: &[&str]) -> Self {
        self.with_using(ComparisonOperation::Eq, attributes)
    }

    /// Restricts on the given attributes with an explicit operation.
    pub fn with_using(mut self, operation: ComparisonOperation, attributes: &[&str]) -> Self {
        self.add_restrictions(operation, attributes, false);
        self
    }

    /// Like [`ExampleDsl::with`], additionally fetch-joining restricted
    /// to-one associations into the result documents.
    pub fn with_fetch(self, attributes: &[&str]) -> Self {
        self.with_fetch_using(ComparisonOperation::Eq, attributes)
    }

    pub fn with_fetch_using(mut self, operation: ComparisonOperation, attributes: &[&str]) -> Self {
        self.add_restrictions(operation, attributes, true);
        self
    }

    /// Composes the given attributes' restrictions disjunctively with `EQ`.
    pub fn or(self, attributes: &[&str]) -> Self {
        self.or_using(ComparisonOperation::Eq, attributes)
    }

    /// Composes the given attributes' restrictions disjunctively. Each
    /// attribute is resolved into its own isolated branch so restrictions
    /// never bleed between arms. Fewer than two attributes yields the
    /// degenerate single-clause group, with a warning.
    pub fn or_using(mut self, operation: ComparisonOperation, attributes: &[&str]) -> Self {
        if attributes.len() < 2 {
            tracing::warn!(
                target: "specimen::example",
                entity = self.meta.entity,
                provided = attributes.len(),
                "or-group expects at least two attributes"
            );
            self.diagnostics.push(Diagnostic::DegenerateOrGroup {
                provided: attributes.len(),
            });
        }
        let mut branches = Vec::with_capacity(attributes.len());
        for raw in attributes {
            let mut branch = Criteria::of_meta(self.meta);
            if self.apply_attribute(&mut branch, raw, operation, false)
                && branch.has_predicates()
            {
                branches.push(branch);
            }
        }
        if !branches.is_empty() {
            let criteria = mem::replace(&mut self.criteria, Criteria::of_meta(self.meta));
            self.criteria = criteria.or(branches);
            self.has_restrictions = true;
        }
        self
    }

    /// Accumulates example restrictions onto a pre-populated criteria
    /// instead of the session's fresh one.
    pub fn with_criteria(mut self, criteria: Criteria) -> Self {
        if !std::ptr::eq(criteria.root(), self.meta) {
            tracing::warn!(
                target: "specimen::example",
                expected = self.meta.entity,
                got = criteria.root().entity,
                "pre-seeded criteria targets a different root entity"
            );
        }
        self.criteria = criteria;
        self
    }

    /// Best-effort skips observed so far.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Finishes the session. A session that never produced a restriction
    /// falls back to the default all-attributes `EQ` pass, so `build()`
    /// never yields an unrestricted scan by accident.
    pub fn build(mut self) -> Criteria {
        if !self.has_restrictions {
            self.add_restrictions(ComparisonOperation::Eq, &[], false);
        }
        metrics::record_example_compiled();
        self.criteria
    }

    /// Like [`ExampleDsl::build`], also handing back the diagnostics.
    pub fn build_with_diagnostics(mut self) -> (Criteria, Vec<Diagnostic>) {
        if !self.has_restrictions {
            self.add_restrictions(ComparisonOperation::Eq, &[], false);
        }
        metrics::record_example_compiled();
        let diagnostics = mem::take(&mut self.diagnostics);
        (self.criteria, diagnostics)
    }

    fn add_restrictions(
        &mut self,
        operation: ComparisonOperation,
        attributes: &[&str],
        fetch: bool,
    ) {
        let mut criteria = mem::replace(&mut self.criteria, Criteria::of_meta(self.meta));
        let mut applied = false;
        if attributes.is_empty() {
            let names: Vec<&'static str> =
                self.meta.attributes.iter().map(|a| a.name).collect();
            for name in names {
                applied |= self.apply_attribute(&mut criteria, name, operation, fetch);
            }
        } else {
            for raw in attributes {
                applied |= self.apply_attribute(&mut criteria, raw, operation, fetch);
            }
        }
        self.criteria = criteria;
        if applied {
            self.has_restrictions = true;
        }
    }

    /// Per-attribute dispatch: directly-declared attributes go straight to
    /// the operator or plural path; anything else goes through the
    /// association resolver. Returns whether a restriction was applied.
    fn apply_attribute(
        &mut self,
        criteria: &mut Criteria,
        raw: &str,
        operation: ComparisonOperation,
        fetch: bool,
    ) -> bool {
        let query = AttrRef::parse(raw);
        match resolve_direct(self.meta, query) {
            Some(attr) if attr.is_plural() => {
                if fetch {
                    tracing::debug!(
                        target: "specimen::example",
                        attribute = attr.name,
                        "fetch is ignored for to-many attributes"
                    );
                }
                let value = self.doc.get(attr.name).cloned();
                match operation {
                    ComparisonOperation::IsEmpty | ComparisonOperation::NotEmpty => {
                        let negate = operation == ComparisonOperation::NotEmpty;
                        if let Some(p) = rel_empty_predicate(0, self.meta, attr, negate) {
                            criteria.push_predicate(p);
                            metrics::record_restriction();
                            true
                        } else {
                            false
                        }
                    }
                    _ => self.plural_restriction(criteria, attr, value.as_ref()),
                }
            }
            Some(attr) => {
                let value = self.doc.get(attr.name).cloned();
                self.singular_restriction(criteria, attr, operation, value.as_ref(), fetch)
            }
            None => self.association_restriction(criteria, query, operation),
        }
    }

    /// Operator dispatch for a directly-declared singular attribute of
    /// `criteria`'s root: one builder primitive per operation.
    fn singular_restriction(
        &mut self,
        criteria: &mut Criteria,
        attr: &'static AttributeMeta,
        operation: ComparisonOperation,
        value: Option<&Value>,
        fetch: bool,
    ) -> bool {
        let value = present(value);
        match attr.kind {
            AttributeKind::Scalar => {
                if value.is_none() && !operation.is_null_safe() {
                    tracing::debug!(
                        target: "specimen::example",
                        attribute = attr.name,
                        "skipping null example attribute"
                    );
                    return false;
                }
                if matches!(
                    operation,
                    ComparisonOperation::IsEmpty | ComparisonOperation::NotEmpty
                ) {
                    self.skip_unsupported(attr.name, operation);
                    return false;
                }
                let field = criteria.field_for(0, attr.name);
                let predicate = scalar_predicate(field, operation, value);
                criteria.push_predicate(predicate);
                metrics::record_restriction();
                true
            }
            AttributeKind::ToOne { target, column } => {
                match operation {
                    ComparisonOperation::IsNull | ComparisonOperation::NotNull => {
                        let field = criteria.field_for(0, column);
                        criteria.push_predicate(if operation == ComparisonOperation::IsNull {
                            Predicate::IsNull { field }
                        } else {
                            Predicate::NotNull { field }
                        });
                        metrics::record_restriction();
                        true
                    }
                    ComparisonOperation::Eq | ComparisonOperation::NotEq => {
                        let Some(object) = value.and_then(Value::as_object) else {
                            tracing::debug!(
                                target: "specimen::example",
                                attribute = attr.name,
                                "skipping unpopulated to-one example attribute"
                            );
                            return false;
                        };
                        // To-one associations compare by primary key.
                        let Some(id) = id_of(target, object) else {
                            self.skip(
                                Diagnostic::AssociationWithoutId {
                                    attribute: attr.name.to_owned(),
                                },
                                attr.name,
                            );
                            return false;
                        };
                        let field = criteria.field_for(0, column);
                        let predicate = if operation == ComparisonOperation::Eq {
                            Predicate::Eq {
                                field,
                                value: id.to_json(),
                            }
                        } else {
                            Predicate::NotEq {
                                field,
                                value: id.to_json(),
                            }
                        };
                        criteria.push_predicate(predicate);
                        if fetch {
                            criteria.fetch_to_one(attr, JoinKind::Inner);
                        }
                        metrics::record_restriction();
                        true
                    }
                    _ => {
                        if value.is_none() {
                            return false;
                        }
                        self.skip_unsupported(attr.name, operation);
                        false
                    }
                }
            }
            AttributeKind::ToMany { .. } => unreachable!("plural handled by caller"),
        }
    }

    /// Membership restriction for a populated to-many example field: join
    /// the element type and restrict its primary key to the extracted ids.
    fn plural_restriction(
        &mut self,
        criteria: &mut Criteria,
        attr: &'static AttributeMeta,
        value: Option<&Value>,
    ) -> bool {
        let AttributeKind::ToMany { target, shape, .. } = attr.kind else {
            unreachable!("plural restriction requires a to-many attribute");
        };
        let Some(value) = present(value) else {
            // An empty example collection means "no restriction", distinct
            // from "restrict to empty".
            self.skip(
                Diagnostic::EmptyCollection {
                    attribute: attr.name.to_owned(),
                },
                attr.name,
            );
            return false;
        };
        let Some(elements) = collection_elements(shape, value) else {
            self.skip(
                Diagnostic::NonCollectionValue {
                    attribute: attr.name.to_owned(),
                },
                attr.name,
            );
            return false;
        };
        if elements.is_empty() {
            self.skip(
                Diagnostic::EmptyCollection {
                    attribute: attr.name.to_owned(),
                },
                attr.name,
            );
            return false;
        }

        let mut ids: Vec<IdValue> = Vec::with_capacity(elements.len());
        let mut missing = 0usize;
        for element in elements {
            match element.as_object().and_then(|obj| id_of(target, obj)) {
                Some(id) => {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                None => missing += 1,
            }
        }
        if missing > 0 {
            self.skip(
                Diagnostic::MissingElementId {
                    attribute: attr.name.to_owned(),
                },
                attr.name,
            );
        }
        if ids.is_empty() {
            return false;
        }

        tracing::debug!(
            target: "specimen::example",
            attribute = attr.name,
            ids = ids.len(),
            "adding membership restriction"
        );
        let mut sub = Criteria::of_meta(target);
        sub.id_in_at(0, ids);
        criteria.join_sub(0, attr, sub);
        metrics::record_restriction();
        true
    }

    /// The association resolver: depth-first search over the example's
    /// association graph for the entity declaring the requested attribute,
    /// then replay of the discovered join chain.
    fn association_restriction(
        &mut self,
        criteria: &mut Criteria,
        query: AttrRef<'_>,
        operation: ComparisonOperation,
    ) -> bool {
        let mut visited: HashSet<&'static str> = HashSet::new();
        visited.insert(self.meta.entity);
        let mut chain: Vec<&'static AttributeMeta> = Vec::new();

        let root_doc = mem::take(&mut self.doc);
        let found = search(&root_doc, self.meta, query, &mut visited, &mut chain);
        let applied = match found {
            Some((attr, leaf_meta, leaf_doc)) => {
                self.apply_resolved(criteria, &chain, attr, leaf_meta, leaf_doc, operation)
            }
            None => {
                tracing::warn!(
                    target: "specimen::example",
                    entity = self.meta.entity,
                    attribute = query.name,
                    "attribute not found in example entity or its associations"
                );
                self.diagnostics.push(Diagnostic::UnresolvedAttribute {
                    attribute: query.name.to_owned(),
                });
                metrics::record_attribute_skipped();
                false
            }
        };
        self.doc = root_doc;
        applied
    }

    /// Base case of the resolver: build the restriction at the leaf, then
    /// wrap it in the accumulated join chain, innermost hop first.
    fn apply_resolved(
        &mut self,
        criteria: &mut Criteria,
        chain: &[&'static AttributeMeta],
        attr: &'static AttributeMeta,
        leaf_meta: &'static EntityMeta,
        leaf_doc: &Map<String, Value>,
        operation: ComparisonOperation,
    ) -> bool {
        let value = leaf_doc.get(attr.name).cloned();
        let mut leaf = Criteria::of_meta(leaf_meta);
        let applied = if attr.is_plural() {
            self.plural_restriction(&mut leaf, attr, value.as_ref())
        } else {
            self.singular_restriction(&mut leaf, attr, operation, value.as_ref(), false)
        };
        if !applied {
            return false;
        }

        // Replay the join chain: wrap the leaf restriction hop by hop,
        // innermost first, then attach the whole thing to the root query.
        let mut sub = leaf;
        for i in (1..chain.len()).rev() {
            let owner = chain[i - 1].target().expect("chain hops are associations");
            let mut wrap = Criteria::of_meta(owner);
            wrap.join_sub(0, chain[i], sub);
            sub = wrap;
        }
        let first = chain
            .first()
            .expect("unresolved-at-root attributes always traverse at least one hop");
        criteria.join_sub(0, first, sub);
        true
    }

    fn skip(&mut self, diagnostic: Diagnostic, attribute: &str) {
        tracing::warn!(
            target: "specimen::example",
            entity = self.meta.entity,
            attribute,
            ?diagnostic,
            "ignoring example attribute"
        );
        self.diagnostics.push(diagnostic);
        metrics::record_attribute_skipped();
    }

    fn skip_unsupported(&mut self, attribute: &str, operation: ComparisonOperation) {
        self.skip(
            Diagnostic::UnsupportedOperation {
                attribute: attribute.to_owned(),
                operation,
            },
            attribute,
        );
    }
}

/// Depth-first search for the entity declaring `query`, walking association
/// attributes in declaration order. Marks every expanded target type in
/// `visited` so cyclic graphs terminate; accumulates the successful path in
/// `chain` (dead ends are popped).
fn search<'d>(
    doc: &'d Map<String, Value>,
    meta: &'static EntityMeta,
    query: AttrRef<'_>,
    visited: &mut HashSet<&'static str>,
    chain: &mut Vec<&'static AttributeMeta>,
) -> Option<(&'static AttributeMeta, &'static EntityMeta, &'d Map<String, Value>)> {
    if let Some(attr) = resolve_direct(meta, query) {
        return Some((attr, meta, doc));
    }
    for attr in meta.associations() {
        let target = attr.target().expect("association has a target");
        if visited.contains(target.entity) {
            continue;
        }
        visited.insert(target.entity);

        // One representative element drives the recursion for plural
        // associations.
        let representative = match attr.kind {
            AttributeKind::ToOne { .. } => present(doc.get(attr.name)).and_then(Value::as_object),
            AttributeKind::ToMany { shape, .. } => present(doc.get(attr.name))
                .and_then(|v| collection_elements(shape, v))
                .and_then(|els| els.first().copied())
                .and_then(Value::as_object),
            AttributeKind::Scalar => None,
        };
        let Some(associated) = representative else {
            continue;
        };

        chain.push(attr);
        if let Some(found) = search(associated, target, query, visited, chain) {
            return Some(found);
        }
        chain.pop();
    }
    None
}

/// Scalar operator dispatch. Null-safe operations ignore the value; the
/// caller has already guaranteed a value for the rest.
fn scalar_predicate(
    field: crate::criteria::FieldRef,
    operation: ComparisonOperation,
    value: Option<&Value>,
) -> Predicate {
    match operation {
        ComparisonOperation::IsNull => return Predicate::IsNull { field },
        ComparisonOperation::NotNull => return Predicate::NotNull { field },
        _ => {}
    }
    let value = value.cloned().unwrap_or(Value::Null);
    match operation {
        ComparisonOperation::Eq => Predicate::Eq { field, value },
        ComparisonOperation::NotEq => Predicate::NotEq { field, value },
        ComparisonOperation::EqIgnoreCase => Predicate::EqIgnoreCase {
            field,
            value: value_text(&value),
        },
        ComparisonOperation::NotEqIgnoreCase => Predicate::NotEqIgnoreCase {
            field,
            value: value_text(&value),
        },
        ComparisonOperation::Gt => Predicate::Gt { field, value },
        ComparisonOperation::GtOrEq => Predicate::GtOrEq { field, value },
        ComparisonOperation::Lt => Predicate::Lt { field, value },
        ComparisonOperation::LtOrEq => Predicate::LtOrEq { field, value },
        ComparisonOperation::Like => Predicate::Like {
            field,
            pattern: value_text(&value),
        },
        ComparisonOperation::NotLike => Predicate::NotLike {
            field,
            pattern: value_text(&value),
        },
        ComparisonOperation::LikeIgnoreCase => Predicate::LikeIgnoreCase {
            field,
            pattern: value_text(&value),
        },
        ComparisonOperation::NotLikeIgnoreCase => Predicate::NotLikeIgnoreCase {
            field,
            pattern: value_text(&value),
        },
        ComparisonOperation::IsNull
        | ComparisonOperation::NotNull
        | ComparisonOperation::IsEmpty
        | ComparisonOperation::NotEmpty => unreachable!("handled before dispatch"),
    }
}
