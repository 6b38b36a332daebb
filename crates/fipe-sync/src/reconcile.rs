//! Per-unit reconciliation: read what the store already holds, read what the
//! catalog offers now, insert the difference. Every unit reports an outcome
//! instead of failing the run.

use std::collections::HashSet;

use fipe_adapters::CatalogSource;
use fipe_core::{
    normalize_name, Brand, CatalogItem, Model, NewReferencePeriod, ReferencePeriod, VehicleType,
    YearFuel, YearVariant,
};
use fipe_storage::{CatalogStore, InsertReport};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    Inserted {
        inserted: usize,
        skipped_duplicates: usize,
    },
    UpToDate,
    EmptySource,
    DryRun {
        pending: usize,
    },
    SourceFailed {
        reason: String,
        data_shape: bool,
    },
    StoreFailed {
        reason: String,
    },
}

impl UnitOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            UnitOutcome::SourceFailed { .. } | UnitOutcome::StoreFailed { .. }
        )
    }

    fn inserted(report: InsertReport) -> Self {
        UnitOutcome::Inserted {
            inserted: report.inserted,
            skipped_duplicates: report.skipped_duplicates,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    pub unit: String,
    pub outcome: UnitOutcome,
}

impl UnitReport {
    fn new(unit: impl Into<String>, outcome: UnitOutcome) -> Self {
        Self {
            unit: unit.into(),
            outcome,
        }
    }
}

/// Items of `current` whose normalized name is not among `existing`. Repeated
/// names in `current` are kept once, in first-seen order.
pub fn compute_delta<'a, I>(current: &[CatalogItem], existing: I) -> Vec<CatalogItem>
where
    I: IntoIterator<Item = &'a str>,
{
    let known: HashSet<String> = existing.into_iter().map(normalize_name).collect();
    let mut seen = HashSet::new();
    current
        .iter()
        .filter(|item| {
            let key = item.normalized_name();
            !known.contains(&key) && seen.insert(key)
        })
        .cloned()
        .collect()
}

pub fn compute_year_delta(current: &[YearFuel], existing: &[YearVariant]) -> Vec<YearFuel> {
    let known: HashSet<(String, String)> = existing
        .iter()
        .map(|v| (normalize_name(&v.year_label), normalize_name(&v.fuel_label)))
        .collect();
    let mut seen = HashSet::new();
    current
        .iter()
        .filter(|yf| {
            let key = yf.key();
            !known.contains(&key) && seen.insert(key)
        })
        .cloned()
        .collect()
}

pub fn compute_period_delta(
    current: &[NewReferencePeriod],
    existing: &[ReferencePeriod],
) -> Vec<NewReferencePeriod> {
    let known: HashSet<&str> = existing.iter().map(|p| p.label.as_str()).collect();
    let mut seen = HashSet::new();
    current
        .iter()
        .filter(|p| !known.contains(p.label.as_str()) && seen.insert(p.label.clone()))
        .cloned()
        .collect()
}

/// Inserts the periods of `year` for `months` without consulting the catalog.
pub async fn seed_periods(
    store: &dyn CatalogStore,
    year: i32,
    months: &[u32],
    dry_run: bool,
) -> UnitReport {
    let unit = format!("seed/{year}");
    async {
        let wanted = match months
            .iter()
            .map(|m| NewReferencePeriod::from_month_year(*m, year))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(periods) => periods,
            Err(err) => {
                error!(error = %err, "invalid month list");
                return UnitReport::new(
                    &unit,
                    UnitOutcome::SourceFailed {
                        reason: err.to_string(),
                        data_shape: true,
                    },
                );
            }
        };
        let existing = match store.reference_periods().await {
            Ok(periods) => periods,
            Err(err) => return Reconciler::store_failed(&unit, "reading stored periods", err),
        };
        let delta = compute_period_delta(&wanted, &existing);
        insert_periods(store, dry_run, &unit, delta).await
    }
    .instrument(info_span!("seed_periods", year))
    .await
}

async fn insert_periods(
    store: &dyn CatalogStore,
    dry_run: bool,
    unit: &str,
    delta: Vec<NewReferencePeriod>,
) -> UnitReport {
    if delta.is_empty() {
        info!("no new reference periods");
        return UnitReport::new(unit, UnitOutcome::UpToDate);
    }
    if dry_run {
        info!(pending = delta.len(), "dry run: periods not written");
        return UnitReport::new(unit, UnitOutcome::DryRun { pending: delta.len() });
    }
    match store.insert_reference_periods(&delta).await {
        Ok(report) => {
            for period in &delta {
                info!(label = %period.label, "reference period processed");
            }
            info!(
                inserted = report.inserted,
                skipped = report.skipped_duplicates,
                "reference periods stored"
            );
            UnitReport::new(unit, UnitOutcome::inserted(report))
        }
        Err(err) => Reconciler::store_failed(unit, "inserting periods", err),
    }
}

/// Runs reconciliation units against one store and one catalog source.
pub struct Reconciler<'a> {
    store: &'a dyn CatalogStore,
    source: &'a dyn CatalogSource,
    dry_run: bool,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn CatalogStore, source: &'a dyn CatalogSource) -> Self {
        Self {
            store,
            source,
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Discovers the periods offered by the catalog and stores the new ones.
    pub async fn periods(&self) -> UnitReport {
        let unit = "periods";
        async {
            let existing = match self.store.reference_periods().await {
                Ok(periods) => periods,
                Err(err) => return Self::store_failed(unit, "reading stored periods", err),
            };
            let current = match self.source.reference_periods().await {
                Ok(periods) => periods,
                Err(err) => return Self::source_failed(unit, err),
            };
            if current.is_empty() {
                warn!("catalog offered no reference periods; nothing to reconcile");
                return UnitReport::new(unit, UnitOutcome::EmptySource);
            }
            let delta = compute_period_delta(&current, &existing);
            insert_periods(self.store, self.dry_run, unit, delta).await
        }
        .instrument(info_span!("periods", source = self.source.name()))
        .await
    }

    pub async fn brands(&self, vehicle_type: VehicleType, period: &ReferencePeriod) -> UnitReport {
        let unit = format!("brands/{vehicle_type}/{}", period.label);
        async {
            let existing = match self.store.brands(vehicle_type, period.id).await {
                Ok(brands) => brands,
                Err(err) => return Self::store_failed(&unit, "reading stored brands", err),
            };
            let current = match self.source.brands(vehicle_type, period).await {
                Ok(items) => items,
                Err(err) => return Self::source_failed(&unit, err),
            };
            if current.is_empty() {
                warn!("catalog listed no brands; nothing to reconcile");
                return UnitReport::new(&unit, UnitOutcome::EmptySource);
            }
            let delta = compute_delta(&current, existing.iter().map(|b| b.name.as_str()));
            info!(
                site = current.len(),
                stored = existing.len(),
                new = delta.len(),
                "brands compared"
            );
            if delta.is_empty() {
                return UnitReport::new(&unit, UnitOutcome::UpToDate);
            }
            if self.dry_run {
                return UnitReport::new(&unit, UnitOutcome::DryRun { pending: delta.len() });
            }
            match self.store.insert_brands(vehicle_type, period.id, &delta).await {
                Ok(report) => {
                    info!(inserted = report.inserted, skipped = report.skipped_duplicates, "brands stored");
                    UnitReport::new(&unit, UnitOutcome::inserted(report))
                }
                Err(err) => Self::store_failed(&unit, "inserting brands", err),
            }
        }
        .instrument(info_span!("brands", %vehicle_type, period = %period.label))
        .await
    }

    /// Walks the brands that still have no models for the period, one unit per brand.
    pub async fn models_for_pending_brands(
        &self,
        vehicle_type: VehicleType,
        period: &ReferencePeriod,
    ) -> Vec<UnitReport> {
        let pending = match self.store.brands_without_models(vehicle_type, period.id).await {
            Ok(brands) => brands,
            Err(err) => {
                let unit = format!("models/{vehicle_type}/{}", period.label);
                return vec![Self::store_failed(&unit, "reading brands pending models", err)];
            }
        };
        if pending.is_empty() {
            info!(%vehicle_type, period = %period.label, "every brand already has models");
            return Vec::new();
        }
        info!(%vehicle_type, period = %period.label, brands = pending.len(), "brands pending models");

        let mut reports = Vec::with_capacity(pending.len());
        for brand in &pending {
            reports.push(self.models(vehicle_type, period, brand).await);
        }
        reports
    }

    pub async fn models(
        &self,
        vehicle_type: VehicleType,
        period: &ReferencePeriod,
        brand: &Brand,
    ) -> UnitReport {
        let unit = format!("models/{vehicle_type}/{}/{}", period.label, brand.name);
        async {
            let existing = match self.store.models(brand.id, period.id).await {
                Ok(models) => models,
                Err(err) => return Self::store_failed(&unit, "reading stored models", err),
            };
            let current = match self.source.models(vehicle_type, period, brand).await {
                Ok(items) => items,
                Err(err) => return Self::source_failed(&unit, err),
            };
            if current.is_empty() {
                warn!("catalog listed no models; nothing to reconcile");
                return UnitReport::new(&unit, UnitOutcome::EmptySource);
            }
            let delta = compute_delta(&current, existing.iter().map(|m| m.name.as_str()));
            info!(site = current.len(), stored = existing.len(), new = delta.len(), "models compared");
            if delta.is_empty() {
                return UnitReport::new(&unit, UnitOutcome::UpToDate);
            }
            if self.dry_run {
                return UnitReport::new(&unit, UnitOutcome::DryRun { pending: delta.len() });
            }
            match self.store.insert_models(brand, &delta).await {
                Ok(report) => {
                    info!(inserted = report.inserted, skipped = report.skipped_duplicates, "models stored");
                    UnitReport::new(&unit, UnitOutcome::inserted(report))
                }
                Err(err) => Self::store_failed(&unit, "inserting models", err),
            }
        }
        .instrument(info_span!("models", %vehicle_type, period = %period.label, brand = %brand.name))
        .await
    }

    /// One unit per stored model of every stored brand in the scope.
    pub async fn year_variants_for_period(
        &self,
        vehicle_type: VehicleType,
        period: &ReferencePeriod,
    ) -> Vec<UnitReport> {
        let scope = format!("years/{vehicle_type}/{}", period.label);
        let brands = match self.store.brands(vehicle_type, period.id).await {
            Ok(brands) => brands,
            Err(err) => return vec![Self::store_failed(&scope, "reading stored brands", err)],
        };

        let mut reports = Vec::new();
        for brand in &brands {
            let models = match self.store.models(brand.id, period.id).await {
                Ok(models) => models,
                Err(err) => {
                    let unit = format!("{scope}/{}", brand.name);
                    reports.push(Self::store_failed(&unit, "reading stored models", err));
                    continue;
                }
            };
            for model in &models {
                reports.push(self.year_variants(vehicle_type, period, brand, model).await);
            }
        }
        reports
    }

    pub async fn year_variants(
        &self,
        vehicle_type: VehicleType,
        period: &ReferencePeriod,
        brand: &Brand,
        model: &Model,
    ) -> UnitReport {
        let unit = format!(
            "years/{vehicle_type}/{}/{}/{}",
            period.label, brand.name, model.name
        );
        async {
            let existing = match self.store.year_variants(model.id, period.id).await {
                Ok(variants) => variants,
                Err(err) => return Self::store_failed(&unit, "reading stored year variants", err),
            };
            let current = match self
                .source
                .year_variants(vehicle_type, period, brand, model)
                .await
            {
                Ok(items) => items,
                Err(err) => return Self::source_failed(&unit, err),
            };
            if current.is_empty() {
                warn!("catalog listed no years; nothing to reconcile");
                return UnitReport::new(&unit, UnitOutcome::EmptySource);
            }
            let delta = compute_year_delta(&current, &existing);
            if delta.is_empty() {
                return UnitReport::new(&unit, UnitOutcome::UpToDate);
            }
            if self.dry_run {
                return UnitReport::new(&unit, UnitOutcome::DryRun { pending: delta.len() });
            }
            match self.store.insert_year_variants(model, &delta).await {
                Ok(report) => {
                    info!(inserted = report.inserted, skipped = report.skipped_duplicates, "year variants stored");
                    UnitReport::new(&unit, UnitOutcome::inserted(report))
                }
                Err(err) => Self::store_failed(&unit, "inserting year variants", err),
            }
        }
        .instrument(info_span!("years", %vehicle_type, model = %model.name))
        .await
    }

    fn source_failed(unit: &str, err: fipe_adapters::SourceError) -> UnitReport {
        let data_shape = err.is_data_shape();
        error!(unit, error = %err, data_shape, "catalog unavailable for unit; skipping");
        UnitReport::new(
            unit,
            UnitOutcome::SourceFailed {
                reason: err.to_string(),
                data_shape,
            },
        )
    }

    fn store_failed(unit: &str, action: &str, err: fipe_storage::StoreError) -> UnitReport {
        error!(unit, action, error = %err, "store operation failed; skipping unit");
        UnitReport::new(
            unit,
            UnitOutcome::StoreFailed {
                reason: format!("{action}: {err}"),
            },
        )
    }
}
