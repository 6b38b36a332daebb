use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use fipe_core::{
    Brand, BrandExportRow, CatalogItem, Model, ModelExportRow, NewReferencePeriod,
    ReferencePeriod, VehicleType, YearFuel, YearVariant,
};

use crate::{CatalogStore, InsertReport, StoreError};

/// In-process `CatalogStore` with the same uniqueness rules as the Postgres
/// schema. Inserts stage against a copy and only publish it when the whole
/// unit succeeds.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    insert_calls: AtomicUsize,
}

#[derive(Debug, Default, Clone)]
struct MemoryState {
    next_id: i32,
    periods: Vec<ReferencePeriod>,
    brands: Vec<Brand>,
    models: Vec<Model>,
    variants: Vec<YearVariant>,
}

impl MemoryState {
    fn next_id(&mut self) -> i32 {
        self.next_id += 1;
        self.next_id
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every read fail with `StoreError::Unavailable`.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes every insert fail after staging, so nothing is published.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of `insert_*` calls that reached the store.
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn brand_count(&self) -> usize {
        self.lock().brands.len()
    }

    pub fn model_count(&self) -> usize {
        self.lock().models.len()
    }

    pub fn variant_count(&self) -> usize {
        self.lock().variants.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_reads(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated read failure".into()));
        }
        Ok(())
    }

    fn write_unit<F>(&self, apply: F) -> Result<InsertReport, StoreError>
    where
        F: FnOnce(&mut MemoryState) -> Result<InsertReport, StoreError>,
    {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.lock();
        let mut staged = guard.clone();
        let report = apply(&mut staged)?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated write failure".into()));
        }
        *guard = staged;
        Ok(report)
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn reference_periods(&self) -> Result<Vec<ReferencePeriod>, StoreError> {
        self.check_reads()?;
        let mut periods = self.lock().periods.clone();
        periods.sort_by(|a, b| (b.year, b.month).cmp(&(a.year, a.month)));
        Ok(periods)
    }

    async fn insert_reference_periods(
        &self,
        periods: &[NewReferencePeriod],
    ) -> Result<InsertReport, StoreError> {
        self.write_unit(|state| {
            let mut report = InsertReport::default();
            for period in periods {
                if state.periods.iter().any(|p| p.label == period.label) {
                    report.skipped_duplicates += 1;
                    continue;
                }
                let id = state.next_id();
                state.periods.push(ReferencePeriod {
                    id,
                    month: period.month,
                    year: period.year,
                    label: period.label.clone(),
                    catalog_code: period.catalog_code,
                });
                report.inserted += 1;
            }
            Ok(report)
        })
    }

    async fn brands(
        &self,
        vehicle_type: VehicleType,
        period_id: i32,
    ) -> Result<Vec<Brand>, StoreError> {
        self.check_reads()?;
        let mut brands: Vec<Brand> = self
            .lock()
            .brands
            .iter()
            .filter(|b| b.vehicle_type == vehicle_type && b.period_id == period_id)
            .cloned()
            .collect();
        brands.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(brands)
    }

    async fn insert_brands(
        &self,
        vehicle_type: VehicleType,
        period_id: i32,
        items: &[CatalogItem],
    ) -> Result<InsertReport, StoreError> {
        self.write_unit(|state| {
            let mut report = InsertReport::default();
            for item in items {
                let name = item.normalized_name();
                let clash = state.brands.iter().any(|b| {
                    b.vehicle_type == vehicle_type
                        && b.period_id == period_id
                        && (b.name == name || b.external_id == item.external_id)
                });
                if clash {
                    report.skipped_duplicates += 1;
                    continue;
                }
                let id = state.next_id();
                state.brands.push(Brand {
                    id,
                    name,
                    external_id: item.external_id,
                    vehicle_type,
                    period_id,
                });
                report.inserted += 1;
            }
            Ok(report)
        })
    }

    async fn brands_without_models(
        &self,
        vehicle_type: VehicleType,
        period_id: i32,
    ) -> Result<Vec<Brand>, StoreError> {
        self.check_reads()?;
        let state = self.lock();
        Ok(state
            .brands
            .iter()
            .filter(|b| b.vehicle_type == vehicle_type && b.period_id == period_id)
            .filter(|b| {
                !state
                    .models
                    .iter()
                    .any(|m| m.brand_id == b.id && m.period_id == b.period_id)
            })
            .cloned()
            .collect())
    }

    async fn models(&self, brand_id: i32, period_id: i32) -> Result<Vec<Model>, StoreError> {
        self.check_reads()?;
        Ok(self
            .lock()
            .models
            .iter()
            .filter(|m| m.brand_id == brand_id && m.period_id == period_id)
            .cloned()
            .collect())
    }

    async fn insert_models(
        &self,
        brand: &Brand,
        items: &[CatalogItem],
    ) -> Result<InsertReport, StoreError> {
        self.write_unit(|state| {
            let mut report = InsertReport::default();
            for item in items {
                let name = item.label.trim().to_string();
                let clash = state.models.iter().any(|m| {
                    m.brand_id == brand.id && m.period_id == brand.period_id && m.name == name
                });
                if clash {
                    report.skipped_duplicates += 1;
                    continue;
                }
                let id = state.next_id();
                state.models.push(Model {
                    id,
                    name,
                    external_id: Some(item.external_id),
                    brand_id: brand.id,
                    period_id: brand.period_id,
                });
                report.inserted += 1;
            }
            Ok(report)
        })
    }

    async fn year_variants(
        &self,
        model_id: i32,
        period_id: i32,
    ) -> Result<Vec<YearVariant>, StoreError> {
        self.check_reads()?;
        Ok(self
            .lock()
            .variants
            .iter()
            .filter(|v| v.model_id == model_id && v.period_id == period_id)
            .cloned()
            .collect())
    }

    async fn insert_year_variants(
        &self,
        model: &Model,
        items: &[YearFuel],
    ) -> Result<InsertReport, StoreError> {
        self.write_unit(|state| {
            let mut report = InsertReport::default();
            for item in items {
                let clash = state.variants.iter().any(|v| {
                    v.model_id == model.id
                        && v.period_id == model.period_id
                        && v.year_label == item.year
                        && v.fuel_label == item.fuel
                });
                if clash {
                    report.skipped_duplicates += 1;
                    continue;
                }
                let id = state.next_id();
                state.variants.push(YearVariant {
                    id,
                    year_label: item.year.clone(),
                    fuel_label: item.fuel.clone(),
                    model_id: model.id,
                    period_id: model.period_id,
                });
                report.inserted += 1;
            }
            Ok(report)
        })
    }

    async fn brand_export_rows(&self) -> Result<Vec<BrandExportRow>, StoreError> {
        self.check_reads()?;
        let rows: BTreeSet<BrandExportRow> = self
            .lock()
            .brands
            .iter()
            .map(|b| BrandExportRow {
                name: b.name.clone(),
                external_id: b.external_id,
                vehicle_code: b.vehicle_type.schema_code(),
            })
            .collect();
        Ok(rows.into_iter().collect())
    }

    async fn model_export_rows(&self) -> Result<Vec<ModelExportRow>, StoreError> {
        self.check_reads()?;
        let state = self.lock();
        let rows: BTreeSet<ModelExportRow> = state
            .models
            .iter()
            .filter_map(|m| {
                let brand = state.brands.iter().find(|b| b.id == m.brand_id)?;
                Some(ModelExportRow {
                    brand_name: brand.name.clone(),
                    brand_external_id: brand.external_id,
                    model_name: m.name.clone(),
                    model_external_id: m.external_id,
                    vehicle_code: brand.vehicle_type.schema_code(),
                })
            })
            .collect();
        Ok(rows.into_iter().collect())
    }
}
