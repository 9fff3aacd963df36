use anyhow::Result;
use specimen::Store;
use specimen::testing::fixtures::{self, Brand, Car, CarSalesPoint, SalesPoint};
use testcontainers::{
    ContainerAsync, GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};

pub async fn start_postgres() -> Result<(ContainerAsync<GenericImage>, Store)> {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres");
    let container = image.start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgres://postgres:postgres@{host}:{port}/postgres?sslmode=disable");

    let store = Store::builder(url)
        .max_connections(4)
        .metamodel(fixtures::metamodel())
        .build()
        .await?;
    store.sync_schema().await?;
    Ok((container, store))
}

pub fn brand(id: i64, name: &str) -> Brand {
    Brand {
        id: Some(id),
        name: Some(name.into()),
        cars: vec![],
    }
}

pub fn car(id: i64, name: &str, model: &str, price: f64, brand_id: Option<i64>) -> Car {
    Car {
        id: Some(id),
        name: Some(name.into()),
        model: Some(model.into()),
        price: Some(price),
        brand: brand_id.map(|id| Brand {
            id: Some(id),
            ..Default::default()
        }),
        car_sales_points: vec![],
    }
}

pub fn sales_point(id: i64, name: &str, address: &str) -> SalesPoint {
    SalesPoint {
        id: Some(id),
        name: Some(name.into()),
        address: Some(address.into()),
        opened_at: Some(chrono::Utc::now()),
        cars: vec![],
    }
}

pub fn car_sales_point(id: i64, car_id: i64, sales_point_id: i64) -> CarSalesPoint {
    CarSalesPoint {
        id: Some(id),
        car: Some(Box::new(Car {
            id: Some(car_id),
            ..Default::default()
        })),
        sales_point: Some(SalesPoint {
            id: Some(sales_point_id),
            ..Default::default()
        }),
    }
}

/// Ford/Nissan/Tesla with four cars and two sales points:
/// Fusion (Ford), Sentra (Nissan, sold at Nissan SP), Model S and Model X
/// (Tesla, both sold at Tesla HQ).
pub async fn seed_dealership(store: &Store) -> Result<()> {
    let brands = store.service::<Brand>();
    brands.insert(&brand(1, "Ford")).await?;
    brands.insert(&brand(2, "Nissan")).await?;
    brands.insert(&brand(3, "Tesla")).await?;

    let cars = store.service::<Car>();
    cars.insert(&car(1, "Fusion", "Fusion", 20.0, Some(1))).await?;
    cars.insert(&car(2, "Sentra", "SE", 12.999, Some(2))).await?;
    cars.insert(&car(3, "Model S", "S", 5.0, Some(3))).await?;
    cars.insert(&car(4, "Model X", "X", 7.5, Some(3))).await?;

    let points = store.service::<SalesPoint>();
    points
        .insert(&sales_point(1, "Nissan SP", "Nissan address"))
        .await?;
    points
        .insert(&sales_point(2, "Tesla HQ", "Tesla HQ address"))
        .await?;

    let links = store.service::<CarSalesPoint>();
    links.insert(&car_sales_point(1, 2, 1)).await?;
    links.insert(&car_sales_point(2, 3, 2)).await?;
    links.insert(&car_sales_point(3, 4, 2)).await?;

    Ok(())
}

pub fn names(mut cars: Vec<Car>) -> Vec<String> {
    cars.sort_by_key(|c| c.id);
    cars.into_iter().filter_map(|c| c.name).collect()
}
