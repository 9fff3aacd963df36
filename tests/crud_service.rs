mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use common::{car, seed_dealership, start_postgres};
use specimen::testing::fixtures::Car;
use specimen::{Criteria, Error, Filter, ServiceHooks, Sort};

#[tokio::test]
#[cfg_attr(not(feature = "pg-tests"), ignore = "needs Docker; run with --features pg-tests")]
async fn insert_find_update_delete_roundtrip() -> Result<()> {
    let (_container, store) = start_postgres().await?;
    let service = store.service::<Car>();

    service.insert(&car(1, "Fusion", "SE", 20.0, None)).await?;
    let found = service.find_by_id(1).await?.expect("inserted car");
    assert_eq!(found.name.as_deref(), Some("Fusion"));

    let mut updated = found.clone();
    updated.name = Some("Fusion Titanium".into());
    service.update(&updated).await?;
    let found = service.find_by_id(1).await?.unwrap();
    assert_eq!(found.name.as_deref(), Some("Fusion Titanium"));

    service.delete(&found).await?;
    assert!(service.find_by_id(1).await?.is_none());

    let err = service.delete(&updated).await.expect_err("already gone");
    assert!(matches!(err, Error::NotFound { .. }), "{err:?}");

    let transient = Car::with_model("SE");
    let err = service.update(&transient).await.expect_err("no id");
    assert!(matches!(err, Error::TransientEntity { .. }), "{err:?}");
    Ok(())
}

#[tokio::test]
#[cfg_attr(not(feature = "pg-tests"), ignore = "needs Docker; run with --features pg-tests")]
async fn save_or_update_dispatches_on_id_presence() -> Result<()> {
    let (_container, store) = start_postgres().await?;
    let service = store.service::<Car>();

    let err = service
        .save_or_update(&Car::with_model("SE"))
        .await
        .expect_err("bigint ids are caller-supplied");
    assert!(matches!(err, Error::TransientEntity { .. }), "{err:?}");

    service.insert(&car(1, "Sentra", "SE", 12.999, None)).await?;
    let mut existing = service.find_by_id(1).await?.unwrap();
    existing.price = Some(11.5);
    service.save_or_update(&existing).await?;
    assert_eq!(service.find_by_id(1).await?.unwrap().price, Some(11.5));
    Ok(())
}

#[tokio::test]
#[cfg_attr(not(feature = "pg-tests"), ignore = "needs Docker; run with --features pg-tests")]
async fn paginates_in_sorted_pages() -> Result<()> {
    let (_container, store) = start_postgres().await?;
    seed_dealership(&store).await?;
    let service = store.service::<Car>();

    let page = |first: i64, size: i64| {
        Filter::<Car>::new()
            .set_sort_field("id")
            .set_sort(Sort::Ascending)
            .set_first(first)
            .set_page_size(size)
    };

    let cars = service.paginate(&page(0, 1)).await?;
    assert_eq!(cars.len(), 1);
    assert_eq!(cars[0].id, Some(1));

    let cars = service.paginate(&page(1, 1)).await?;
    assert_eq!(cars.len(), 1);
    assert_eq!(cars[0].id, Some(2));

    let cars = service.paginate(&page(0, 4)).await?;
    let ids: Vec<_> = cars.iter().filter_map(|c| c.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    Ok(())
}

#[tokio::test]
#[cfg_attr(not(feature = "pg-tests"), ignore = "needs Docker; run with --features pg-tests")]
async fn multi_field_sort_applies_in_list_order() -> Result<()> {
    let (_container, store) = start_postgres().await?;
    seed_dealership(&store).await?;
    let service = store.service::<Car>();

    // Two Teslas share a brand; model breaks the tie after price groups.
    let filter = Filter::<Car>::new()
        .add_multi_sort(Sort::Descending, "model")
        .add_multi_sort(Sort::Ascending, "price")
        .set_page_size(4);
    let cars = service.paginate(&filter).await?;
    let models: Vec<_> = cars.into_iter().filter_map(|c| c.model).collect();
    assert_eq!(models, vec!["X", "SE", "S", "Fusion"]);

    let unknown = Filter::<Car>::new().set_sort_field("warranty");
    let err = service.paginate(&unknown).await.expect_err("unknown field");
    assert!(matches!(err, Error::UnknownAttribute { .. }), "{err:?}");
    Ok(())
}

#[tokio::test]
#[cfg_attr(not(feature = "pg-tests"), ignore = "needs Docker; run with --features pg-tests")]
async fn unsorted_direction_defaults_to_ascending() -> Result<()> {
    let (_container, store) = start_postgres().await?;
    seed_dealership(&store).await?;

    let filter = Filter::<Car>::new()
        .set_sort_field("id")
        .set_sort(Sort::Unsorted)
        .set_page_size(1);
    let cars = store.service::<Car>().paginate(&filter).await?;
    assert_eq!(cars[0].id, Some(1));
    Ok(())
}

#[tokio::test]
#[cfg_attr(not(feature = "pg-tests"), ignore = "needs Docker; run with --features pg-tests")]
async fn counts_all_filtered_and_by_criteria() -> Result<()> {
    let (_container, store) = start_postgres().await?;
    seed_dealership(&store).await?;
    let service = store.service::<Car>();

    assert_eq!(service.count().await?, 4);

    let filter = Filter::of(Car::with_model("S"));
    assert_eq!(service.count_filter(&filter).await?, 1);

    let criteria = Criteria::of::<Car>().gt("price", 10.0);
    assert_eq!(service.count_criteria(&criteria).await?, 2);
    Ok(())
}

#[tokio::test]
#[cfg_attr(not(feature = "pg-tests"), ignore = "needs Docker; run with --features pg-tests")]
async fn paginate_restricts_by_the_filter_example() -> Result<()> {
    let (_container, store) = start_postgres().await?;
    seed_dealership(&store).await?;

    let filter = Filter::of(Car::with_model("SE")).set_page_size(10);
    let cars = store.service::<Car>().paginate(&filter).await?;
    assert_eq!(cars.len(), 1);
    assert_eq!(cars[0].name.as_deref(), Some("Sentra"));
    Ok(())
}

#[tokio::test]
#[cfg_attr(not(feature = "pg-tests"), ignore = "needs Docker; run with --features pg-tests")]
async fn delete_batch_removes_every_entity_for_any_batch_size() -> Result<()> {
    let (_container, store) = start_postgres().await?;
    let service = store.service::<Car>();

    // Windows smaller than, equal to, larger than the list, non-dividing,
    // and the invalid-size fallback.
    for batch_size in [3i64, 10, 20, 1, 0, -5] {
        specimen::testing::truncate_all(store.pool(), store.metamodel()).await?;
        let cars: Vec<Car> = (0..10)
            .map(|i| car(100 + i, &format!("car-{i}"), "M", 1.0, None))
            .collect();
        for entity in &cars {
            service.insert(entity).await?;
        }
        assert_eq!(service.count().await?, 10);

        let deleted = service.delete_batch(&cars, batch_size).await?;
        assert_eq!(deleted, 10, "batch size {batch_size}");
        assert_eq!(service.count().await?, 0);
    }
    Ok(())
}

#[tokio::test]
#[cfg_attr(not(feature = "pg-tests"), ignore = "needs Docker; run with --features pg-tests")]
async fn delete_batch_skips_entities_without_ids() -> Result<()> {
    let (_container, store) = start_postgres().await?;
    let service = store.service::<Car>();

    service.insert(&car(1, "Fusion", "SE", 20.0, None)).await?;
    let batch = vec![
        service.find_by_id(1).await?.unwrap(),
        Car::with_model("transient"),
    ];
    let deleted = service.delete_batch(&batch, 10).await?;
    assert_eq!(deleted, 1);

    // A window with no usable primary keys issues no statement at all.
    let deleted = service
        .delete_batch(&[Car::with_model("a"), Car::with_model("b")], 10)
        .await?;
    assert_eq!(deleted, 0);
    Ok(())
}

#[derive(Default)]
struct CountingHooks {
    inserts: AtomicUsize,
    deletes: AtomicUsize,
}

impl ServiceHooks<Car> for CountingHooks {
    fn before_insert(&self, _entity: &Car) {
        self.inserts.fetch_add(1, Ordering::SeqCst);
    }

    fn after_delete(&self, _entity: &Car) {
        self.deletes.fetch_add(1, Ordering::SeqCst);
    }

    fn configure_restrictions(&self, _filter: &Filter<Car>, criteria: Criteria) -> Criteria {
        criteria.eq("model", "SE")
    }
}

#[tokio::test]
#[cfg_attr(not(feature = "pg-tests"), ignore = "needs Docker; run with --features pg-tests")]
async fn lifecycle_and_restriction_hooks_participate() -> Result<()> {
    let (_container, store) = start_postgres().await?;
    seed_dealership(&store).await?;

    let hooks = Arc::new(CountingHooks::default());
    let service = store.service_with_hooks::<Car>(hooks.clone());

    service.insert(&car(9, "Extra", "E", 2.0, None)).await?;
    assert_eq!(hooks.inserts.load(Ordering::SeqCst), 1);

    let extra = service.find_by_id(9).await?.unwrap();
    service.delete(&extra).await?;
    assert_eq!(hooks.deletes.load(Ordering::SeqCst), 1);

    // The restriction hook narrows pagination to SE models.
    let cars = service.paginate(&Filter::<Car>::new().set_page_size(10)).await?;
    assert_eq!(cars.len(), 1);
    assert_eq!(cars[0].name.as_deref(), Some("Sentra"));
    Ok(())
}

#[tokio::test]
#[cfg_attr(not(feature = "pg-tests"), ignore = "needs Docker; run with --features pg-tests")]
async fn pool_health_reports_liveness() -> Result<()> {
    let (_container, store) = start_postgres().await?;
    assert!(store.pool_health().await?.ok);
    Ok(())
}
