//! Static entity metadata: the attribute registry the compiler walks.
//!
//! Every entity declares its attributes once, in declaration order, as
//! `'static` data; associations point straight at the target entity's
//! metadata (statics may reference each other, cycles included). Declaration
//! order is load-bearing: the association resolver searches attributes in
//! this order, so the first declared path to a target attribute wins.

use std::collections::HashMap;
use std::fmt;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{Error, Result};

/// Collection representation of a to-many attribute on the example instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectionShape {
    List,
    Set,
    Bag,
    Map,
}

/// Primary-key column type of an entity table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdKind {
    BigInt,
    Uuid,
    Text,
}

impl IdKind {
    pub(crate) fn sql_type(self) -> &'static str {
        match self {
            IdKind::BigInt => "bigint",
            IdKind::Uuid => "uuid",
            IdKind::Text => "text",
        }
    }

    /// Cast suffix turning a `doc ->> 'col'` text expression into a value
    /// comparable against an `id` column of this kind.
    pub(crate) fn cast(self) -> &'static str {
        match self {
            IdKind::BigInt => "::bigint",
            IdKind::Uuid => "::uuid",
            IdKind::Text => "",
        }
    }
}

/// A concrete primary-key value extracted from a document.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IdValue {
    BigInt(i64),
    Uuid(Uuid),
    Text(String),
}

impl IdValue {
    /// Reads an id of the given kind out of a JSON value, if present and of
    /// the expected shape.
    pub fn from_value(kind: IdKind, value: Option<&Value>) -> Option<Self> {
        let value = value?;
        match kind {
            IdKind::BigInt => value.as_i64().map(IdValue::BigInt),
            IdKind::Uuid => value
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .map(IdValue::Uuid),
            IdKind::Text => value.as_str().map(|s| IdValue::Text(s.to_owned())),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            IdValue::BigInt(v) => Value::from(*v),
            IdValue::Uuid(v) => Value::from(v.to_string()),
            IdValue::Text(v) => Value::from(v.clone()),
        }
    }
}

impl fmt::Display for IdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdValue::BigInt(v) => write!(f, "{v}"),
            IdValue::Uuid(v) => write!(f, "{v}"),
            IdValue::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for IdValue {
    fn from(v: i64) -> Self {
        IdValue::BigInt(v)
    }
}

impl From<i32> for IdValue {
    fn from(v: i32) -> Self {
        IdValue::BigInt(v.into())
    }
}

impl From<Uuid> for IdValue {
    fn from(v: Uuid) -> Self {
        IdValue::Uuid(v)
    }
}

impl From<&str> for IdValue {
    fn from(v: &str) -> Self {
        IdValue::Text(v.to_owned())
    }
}

impl From<String> for IdValue {
    fn from(v: String) -> Self {
        IdValue::Text(v)
    }
}

/// Classification of a declared attribute.
#[derive(Clone, Copy)]
pub enum AttributeKind {
    /// A plain column stored under the attribute name in the doc.
    Scalar,
    /// To-one association; the owning doc stores the target's primary key
    /// under `column`.
    ToOne {
        target: &'static EntityMeta,
        column: &'static str,
    },
    /// To-many association owned by the target side; the target doc stores
    /// the owner's primary key under `link`.
    ToMany {
        target: &'static EntityMeta,
        link: &'static str,
        shape: CollectionShape,
    },
}

#[derive(Clone, Copy)]
pub struct AttributeMeta {
    pub name: &'static str,
    pub kind: AttributeKind,
}

impl AttributeMeta {
    pub const fn scalar(name: &'static str) -> Self {
        Self {
            name,
            kind: AttributeKind::Scalar,
        }
    }

    pub const fn to_one(
        name: &'static str,
        target: &'static EntityMeta,
        column: &'static str,
    ) -> Self {
        Self {
            name,
            kind: AttributeKind::ToOne { target, column },
        }
    }

    pub const fn to_many(
        name: &'static str,
        target: &'static EntityMeta,
        link: &'static str,
        shape: CollectionShape,
    ) -> Self {
        Self {
            name,
            kind: AttributeKind::ToMany {
                target,
                link,
                shape,
            },
        }
    }

    pub fn is_association(&self) -> bool {
        !matches!(self.kind, AttributeKind::Scalar)
    }

    pub fn is_plural(&self) -> bool {
        matches!(self.kind, AttributeKind::ToMany { .. })
    }

    pub fn is_singular(&self) -> bool {
        !self.is_plural()
    }

    /// Target entity metadata for associations (element type for plural
    /// ones), `None` for scalars.
    pub fn target(&self) -> Option<&'static EntityMeta> {
        match self.kind {
            AttributeKind::Scalar => None,
            AttributeKind::ToOne { target, .. } | AttributeKind::ToMany { target, .. } => {
                Some(target)
            }
        }
    }
}

impl fmt::Debug for AttributeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AttributeKind::Scalar => write!(f, "{} (scalar)", self.name),
            AttributeKind::ToOne { target, column } => {
                write!(f, "{} (to-one {} via {column})", self.name, target.entity)
            }
            AttributeKind::ToMany {
                target,
                link,
                shape,
            } => write!(
                f,
                "{} (to-many {} via {link}, {shape:?})",
                self.name, target.entity
            ),
        }
    }
}

/// Static description of one entity type.
pub struct EntityMeta {
    pub entity: &'static str,
    pub table: &'static str,
    pub id_attribute: &'static str,
    pub id_kind: IdKind,
    /// Declared attributes, in declaration order.
    pub attributes: &'static [AttributeMeta],
}

impl EntityMeta {
    pub fn attribute(&'static self, name: &str) -> Option<&'static AttributeMeta> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn declares(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name == name)
    }

    /// Association-typed attributes, in declaration order.
    pub fn associations(&'static self) -> impl Iterator<Item = &'static AttributeMeta> {
        self.attributes.iter().filter(|a| a.is_association())
    }
}

impl fmt::Debug for EntityMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMeta")
            .field("entity", &self.entity)
            .field("table", &self.table)
            .field("id_attribute", &self.id_attribute)
            .field("id_kind", &self.id_kind)
            .field("attributes", &self.attributes)
            .finish()
    }
}

/// A persistence-capable entity: serializable both ways, described by a
/// static [`EntityMeta`].
pub trait Entity: Serialize + DeserializeOwned + Send + Sync {
    fn meta() -> &'static EntityMeta;
}

/// Registry of every entity type known to a store; schema management and
/// services enumerate it.
#[derive(Clone, Debug, Default)]
pub struct Metamodel {
    entities: HashMap<&'static str, &'static EntityMeta>,
}

impl Metamodel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Entity>(self) -> Self {
        self.register_meta(T::meta())
    }

    pub fn register_meta(mut self, meta: &'static EntityMeta) -> Self {
        self.entities.insert(meta.entity, meta);
        self
    }

    pub fn get(&self, entity: &str) -> Option<&'static EntityMeta> {
        self.entities.get(entity).copied()
    }

    pub fn entity(&self, entity: &str) -> Result<&'static EntityMeta> {
        self.get(entity)
            .ok_or_else(|| Error::EntityNotRegistered(entity.to_owned()))
    }

    pub fn entries(&self) -> impl Iterator<Item = &'static EntityMeta> + '_ {
        self.entities.values().copied()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Serializes an example instance into the JSON object the compiler walks.
pub(crate) fn document_of<T: Entity>(example: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(example)? {
        Value::Object(map) => Ok(map),
        _ => Err(Error::NotAnObject(T::meta().entity)),
    }
}

/// Extracts the primary key of `meta` from a serialized document.
pub(crate) fn id_of(meta: &EntityMeta, doc: &Map<String, Value>) -> Option<IdValue> {
    IdValue::from_value(meta.id_kind, doc.get(meta.id_attribute))
}

/// Elements of a serialized to-many value, honoring the declared shape.
/// List/set/bag attributes serialize as arrays; map-shaped ones as objects
/// whose values are the associated entities.
pub(crate) fn collection_elements(shape: CollectionShape, value: &Value) -> Option<Vec<&Value>> {
    match shape {
        CollectionShape::List | CollectionShape::Set | CollectionShape::Bag => {
            value.as_array().map(|a| a.iter().collect())
        }
        CollectionShape::Map => value.as_object().map(|m| m.values().collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    static VENDOR_META: EntityMeta = EntityMeta {
        entity: "vendor",
        table: "vendors",
        id_attribute: "id",
        id_kind: IdKind::BigInt,
        attributes: &[
            AttributeMeta::scalar("id"),
            AttributeMeta::scalar("name"),
            AttributeMeta::to_many("widgets", &WIDGET_META, "vendor_id", CollectionShape::Set),
        ],
    };

    static WIDGET_META: EntityMeta = EntityMeta {
        entity: "widget",
        table: "widgets",
        id_attribute: "id",
        id_kind: IdKind::BigInt,
        attributes: &[
            AttributeMeta::scalar("id"),
            AttributeMeta::scalar("label"),
            AttributeMeta::to_one("vendor", &VENDOR_META, "vendor_id"),
        ],
    };

    #[test]
    fn attribute_lookup_and_classification() {
        assert!(WIDGET_META.declares("label"));
        assert!(!WIDGET_META.declares("missing"));

        let vendor = WIDGET_META.attribute("vendor").unwrap();
        assert!(vendor.is_association());
        assert!(vendor.is_singular());
        assert_eq!(vendor.target().unwrap().entity, "vendor");

        let widgets = VENDOR_META.attribute("widgets").unwrap();
        assert!(widgets.is_plural());
        assert_eq!(widgets.target().unwrap().entity, "widget");

        let assoc: Vec<_> = VENDOR_META.associations().map(|a| a.name).collect();
        assert_eq!(assoc, vec!["widgets"]);
    }

    #[test]
    fn cyclic_metadata_debug_terminates() {
        let rendered = format!("{:?}", WIDGET_META.attribute("vendor").unwrap());
        assert!(rendered.contains("to-one vendor"));
    }

    #[test]
    fn id_values_parse_per_kind() {
        assert_eq!(
            IdValue::from_value(IdKind::BigInt, Some(&json!(7))),
            Some(IdValue::BigInt(7))
        );
        assert_eq!(IdValue::from_value(IdKind::BigInt, Some(&json!("7"))), None);
        assert_eq!(IdValue::from_value(IdKind::BigInt, None), None);

        let uuid = Uuid::new_v4();
        assert_eq!(
            IdValue::from_value(IdKind::Uuid, Some(&json!(uuid.to_string()))),
            Some(IdValue::Uuid(uuid))
        );
        assert_eq!(
            IdValue::from_value(IdKind::Text, Some(&json!("k-1"))),
            Some(IdValue::Text("k-1".into()))
        );
    }

    #[test]
    fn collection_elements_respect_shape() {
        let list = json!([{"id": 1}, {"id": 2}]);
        let elements = collection_elements(CollectionShape::List, &list).unwrap();
        assert_eq!(elements.len(), 2);

        let map = json!({"first": {"id": 1}});
        let elements = collection_elements(CollectionShape::Map, &map).unwrap();
        assert_eq!(elements.len(), 1);

        assert!(collection_elements(CollectionShape::Set, &map).is_none());
    }
}
