//! Test support: schema provisioning plus a small car-dealership domain
//! used by the crate's own tests.

use sqlx::PgPool;

use crate::{Result, metamodel::Metamodel, schema::SchemaManager};

/// Creates the tables for every entity in the metamodel on a fresh
/// database.
pub async fn provision_schema(pool: &PgPool, metamodel: &Metamodel) -> Result<()> {
    SchemaManager::new(pool.clone()).sync(metamodel).await?;
    Ok(())
}

/// Empties every entity table without dropping it.
pub async fn truncate_all(pool: &PgPool, metamodel: &Metamodel) -> Result<()> {
    for meta in metamodel.entries() {
        let stmt = format!("truncate table {}", crate::schema::quote_ident(meta.table));
        sqlx::query(&stmt).execute(pool).await?;
    }
    Ok(())
}

/// A car-dealership domain with a to-one (car -> brand), two to-many sides
/// (brand -> cars, sales point -> cars) and a join entity, giving the
/// association resolver a cyclic graph to chew on.
pub mod fixtures {
    use serde::{Deserialize, Serialize};

    use crate::metamodel::{
        AttributeMeta, CollectionShape, Entity, EntityMeta, IdKind, Metamodel,
    };

    pub static BRAND_META: EntityMeta = EntityMeta {
        entity: "brand",
        table: "brands",
        id_attribute: "id",
        id_kind: IdKind::BigInt,
        attributes: &[
            AttributeMeta::scalar("id"),
            AttributeMeta::scalar("name"),
            AttributeMeta::to_many("cars", &CAR_META, "brand_id", CollectionShape::Set),
        ],
    };

    pub static CAR_META: EntityMeta = EntityMeta {
        entity: "car",
        table: "cars",
        id_attribute: "id",
        id_kind: IdKind::BigInt,
        attributes: &[
            AttributeMeta::scalar("id"),
            AttributeMeta::scalar("model"),
            AttributeMeta::scalar("name"),
            AttributeMeta::scalar("price"),
            AttributeMeta::to_one("brand", &BRAND_META, "brand_id"),
            AttributeMeta::to_many(
                "car_sales_points",
                &CAR_SALES_POINT_META,
                "car_id",
                CollectionShape::List,
            ),
        ],
    };

    pub static SALES_POINT_META: EntityMeta = EntityMeta {
        entity: "sales_point",
        table: "sales_points",
        id_attribute: "id",
        id_kind: IdKind::BigInt,
        attributes: &[
            AttributeMeta::scalar("id"),
            AttributeMeta::scalar("name"),
            AttributeMeta::scalar("address"),
            AttributeMeta::scalar("opened_at"),
            AttributeMeta::to_many(
                "cars",
                &CAR_SALES_POINT_META,
                "sales_point_id",
                CollectionShape::Bag,
            ),
        ],
    };

    pub static CAR_SALES_POINT_META: EntityMeta = EntityMeta {
        entity: "car_sales_point",
        table: "car_sales_points",
        id_attribute: "id",
        id_kind: IdKind::BigInt,
        attributes: &[
            AttributeMeta::scalar("id"),
            AttributeMeta::to_one("car", &CAR_META, "car_id"),
            AttributeMeta::to_one("sales_point", &SALES_POINT_META, "sales_point_id"),
        ],
    };

    #[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
    pub struct Brand {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub id: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub name: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub cars: Vec<Car>,
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
    pub struct Car {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub id: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub price: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub brand: Option<Brand>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub car_sales_points: Vec<CarSalesPoint>,
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
    pub struct SalesPoint {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub id: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub address: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub opened_at: Option<chrono::DateTime<chrono::Utc>>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub cars: Vec<CarSalesPoint>,
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
    pub struct CarSalesPoint {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub id: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub car: Option<Box<Car>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub sales_point: Option<SalesPoint>,
    }

    impl Entity for Brand {
        fn meta() -> &'static EntityMeta {
            &BRAND_META
        }
    }

    impl Entity for Car {
        fn meta() -> &'static EntityMeta {
            &CAR_META
        }
    }

    impl Entity for SalesPoint {
        fn meta() -> &'static EntityMeta {
            &SALES_POINT_META
        }
    }

    impl Entity for CarSalesPoint {
        fn meta() -> &'static EntityMeta {
            &CAR_SALES_POINT_META
        }
    }

    pub fn metamodel() -> Metamodel {
        Metamodel::new()
            .register::<Brand>()
            .register::<Car>()
            .register::<SalesPoint>()
            .register::<CarSalesPoint>()
    }

    impl Car {
        pub fn with_model(model: &str) -> Self {
            Self {
                model: Some(model.to_owned()),
                ..Self::default()
            }
        }
    }
}
