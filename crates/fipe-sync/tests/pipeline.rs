use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fipe_adapters::{
    BrowserCatalog, CatalogSource, DriverError, Navigator, PageDriver, RawOption, RetryPolicy,
    SourceError, WaitPolicy,
};
use fipe_core::{Brand, CatalogItem, Model, NewReferencePeriod, ReferencePeriod, VehicleType, YearFuel};
use fipe_storage::{CatalogStore, MemoryStore};
use fipe_sync::{Stage, SyncOptions, SyncPipeline, UnitOutcome};
use tempfile::tempdir;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

struct StaticCatalog;

#[async_trait]
impl CatalogSource for StaticCatalog {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn reference_periods(&self) -> Result<Vec<NewReferencePeriod>, SourceError> {
        Ok(vec![NewReferencePeriod::parse_label("março/2025")?.with_catalog_code(318)])
    }

    async fn brands(
        &self,
        _vehicle_type: VehicleType,
        _period: &ReferencePeriod,
    ) -> Result<Vec<CatalogItem>, SourceError> {
        Ok(vec![CatalogItem::new("Toyota", 56), CatalogItem::new("Honda", 25)])
    }

    async fn models(
        &self,
        _vehicle_type: VehicleType,
        _period: &ReferencePeriod,
        brand: &Brand,
    ) -> Result<Vec<CatalogItem>, SourceError> {
        Ok(vec![CatalogItem::new(format!("{} Sedan 2.0", brand.name), 9000 + brand.external_id)])
    }

    async fn year_variants(
        &self,
        _vehicle_type: VehicleType,
        _period: &ReferencePeriod,
        _brand: &Brand,
        _model: &Model,
    ) -> Result<Vec<YearFuel>, SourceError> {
        Ok(["2020 Gasolina", "2021 Flex"]
            .into_iter()
            .filter_map(YearFuel::parse_label)
            .collect())
    }
}

/// A page whose browser session is gone: every tab click fails for good.
#[derive(Default)]
struct DeadPage {
    loads: AtomicUsize,
}

#[async_trait]
impl PageDriver for DeadPage {
    async fn load(&self) -> Result<(), DriverError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn click_vehicle_tab(&self, _slug: &str) -> Result<(), DriverError> {
        Err(DriverError::Session("chrome not reachable".into()))
    }

    async fn reveal_select(&self, _select_id: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn read_options(&self, _select_id: &str) -> Result<Vec<RawOption>, DriverError> {
        Ok(Vec::new())
    }

    async fn clear_options(&self, _select_id: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn choose_option(&self, _select_id: &str, _label: &str) -> Result<(), DriverError> {
        Ok(())
    }
}

struct ErrorCounter(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for ErrorCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::ERROR {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn cars_only() -> SyncOptions {
    SyncOptions {
        vehicle_types: vec![VehicleType::Car],
        ..SyncOptions::default()
    }
}

const ALL_STAGES: [Stage; 4] = [Stage::Periods, Stage::Brands, Stage::Models, Stage::Years];

#[tokio::test]
async fn full_run_fills_the_store_and_second_run_inserts_nothing() {
    let store = MemoryStore::new();
    let source = StaticCatalog;
    let reports = tempdir().expect("tempdir");

    let pipeline = SyncPipeline::new(&store, &source, reports.path()).with_options(cars_only());
    let first = pipeline.run_once(&ALL_STAGES).await.expect("first run");

    assert_eq!(first.totals.failed, 0);
    assert_eq!(first.totals.inserted, 1 + 2 + 2 + 4);
    assert_eq!(store.brand_count(), 2);
    assert_eq!(store.model_count(), 2);
    assert_eq!(store.variant_count(), 4);

    let summary_path = reports
        .path()
        .join(first.run_id.to_string())
        .join("summary.json");
    let body = std::fs::read_to_string(&summary_path).expect("summary written");
    let json: serde_json::Value = serde_json::from_str(&body).expect("summary is json");
    assert_eq!(json["source"], "static");
    assert_eq!(json["totals"]["inserted"], 9);

    let calls = store.insert_calls();
    let second = pipeline.run_once(&ALL_STAGES).await.expect("second run");
    assert_eq!(second.totals.inserted, 0);
    assert_eq!(second.totals.failed, 0);
    assert!(second
        .units
        .iter()
        .all(|u| u.outcome == UnitOutcome::UpToDate));
    assert_eq!(store.insert_calls(), calls);
}

#[tokio::test]
async fn dry_run_reports_pending_rows_without_writing() {
    let store = MemoryStore::new();
    let source = StaticCatalog;
    let reports = tempdir().expect("tempdir");
    store
        .insert_reference_periods(&[NewReferencePeriod::parse_label("março/2025").unwrap()])
        .await
        .unwrap();

    let options = SyncOptions {
        dry_run: true,
        ..cars_only()
    };
    let summary = SyncPipeline::new(&store, &source, reports.path())
        .with_options(options)
        .run_once(&[Stage::Brands])
        .await
        .expect("dry run");

    assert!(summary.dry_run);
    assert_eq!(summary.totals.dry_run_pending, 2);
    assert_eq!(store.brand_count(), 0);
}

#[tokio::test]
async fn unknown_period_filter_aborts_the_run() {
    let store = MemoryStore::new();
    let source = StaticCatalog;
    let reports = tempdir().expect("tempdir");
    store
        .insert_reference_periods(&[NewReferencePeriod::parse_label("março/2025").unwrap()])
        .await
        .unwrap();

    let options = SyncOptions {
        period: Some("janeiro/1999".into()),
        ..cars_only()
    };
    let err = SyncPipeline::new(&store, &source, reports.path())
        .with_options(options)
        .run_once(&[Stage::Brands])
        .await
        .expect_err("period is not stored");
    assert!(err.to_string().contains("janeiro/1999"));
}

#[tokio::test]
async fn unreadable_period_table_aborts_the_run() {
    let store = MemoryStore::new();
    store.set_fail_reads(true);
    let source = StaticCatalog;
    let reports = tempdir().expect("tempdir");

    let result = SyncPipeline::new(&store, &source, reports.path())
        .with_options(cars_only())
        .run_once(&[Stage::Brands])
        .await;
    assert!(result.is_err());
}

#[tokio::test(start_paused = true)]
async fn dead_browser_yields_one_terminal_error_per_unit() {
    let errors = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(ErrorCounter(errors.clone()));
    let _guard = tracing::subscriber::set_default(subscriber);

    let store = MemoryStore::new();
    store
        .insert_reference_periods(&[NewReferencePeriod::parse_label("março/2025").unwrap()])
        .await
        .unwrap();
    let source = BrowserCatalog::new(
        Navigator::new(DeadPage::default(), WaitPolicy::default()),
        RetryPolicy::new(3, Duration::from_millis(10)),
    );
    let reports = tempdir().expect("tempdir");

    let summary = SyncPipeline::new(&store, &source, reports.path())
        .with_options(cars_only())
        .run_once(&[Stage::Brands])
        .await
        .expect("run completes despite unit failure");

    assert_eq!(summary.totals.failed, 1);
    assert!(matches!(
        summary.units[0].outcome,
        UnitOutcome::SourceFailed {
            data_shape: false,
            ..
        }
    ));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(source.navigator().driver().loads.load(Ordering::SeqCst), 2);
    assert_eq!(store.brand_count(), 0);
}
