//! Catalog sources: the typed page navigator over a [`PageDriver`], the
//! WebDriver backend, the JSON endpoint client, and the [`CatalogSource`]
//! contract the reconcilers consume.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use fipe_core::{
    Brand, CatalogItem, DomainError, Model, NewReferencePeriod, ReferencePeriod, VehicleType,
    YearFuel,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

mod api;
mod browser;

pub use api::{ApiCatalog, ApiClientConfig, ApiError};
pub use browser::{with_browser, BrowserConfig, WebDriverPage};

pub const CRATE_NAME: &str = "fipe-adapters";

/// One `<option>` as read from the page, before any parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOption {
    pub text: String,
    pub value: String,
}

impl RawOption {
    pub fn new(text: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("element `{0}` not found")]
    NotFound(String),
    #[error("no option labelled `{label}` in `{select_id}`")]
    NoSuchOption { select_id: String, label: String },
    #[error("webdriver command failed: {0}")]
    Command(String),
    #[error("browser session error: {0}")]
    Session(String),
}

impl DriverError {
    /// Errors that may clear up while the page keeps loading.
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::NotFound(_) | DriverError::Command(_))
    }
}

#[derive(Debug, Error)]
pub enum NavError {
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },
    #[error("no option in `{select_id}` matches `{label}` exactly")]
    NoExactMatch { select_id: String, label: String },
    #[error("option `{text}` in `{select_id}` has non-numeric value `{value}`")]
    BadOptionValue {
        select_id: String,
        text: String,
        value: String,
    },
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: usize,
        #[source]
        last: Box<NavError>,
    },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Navigation(#[from] NavError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("period `{0}` is not offered by the catalog")]
    UnknownPeriod(String),
    #[error("model `{0}` has no catalog id")]
    MissingModelId(String),
}

impl SourceError {
    /// Malformed catalog data, as opposed to an unreachable or flaky source.
    pub fn is_data_shape(&self) -> bool {
        match self {
            SourceError::Navigation(NavError::BadOptionValue { .. })
            | SourceError::Domain(_)
            | SourceError::MissingModelId(_) => true,
            SourceError::Navigation(NavError::RetriesExhausted { last, .. }) => {
                matches!(**last, NavError::BadOptionValue { .. })
            }
            SourceError::Api(err) => err.is_data_shape(),
            _ => false,
        }
    }
}

/// Fixed-delay retry, applied to whole units of navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }
}

/// Runs `attempt` until it succeeds or the policy is exhausted. Intermediate
/// failures are logged at `warn`; the final one is returned, not logged, so the
/// caller owns the terminal report.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut attempt: F,
) -> Result<T, NavError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, NavError>>,
{
    let attempts = policy.attempts();
    let mut index = 0;
    loop {
        match attempt(index).await {
            Ok(value) => return Ok(value),
            Err(err) if index + 1 < attempts => {
                warn!(
                    operation,
                    attempt = index + 1,
                    max_attempts = attempts,
                    error = %err,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(policy.delay).await;
                index += 1;
            }
            Err(err) => {
                return Err(NavError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts,
                    last: Box::new(err),
                })
            }
        }
    }
}

/// Bounded condition wait used instead of fixed sleeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            interval: Duration::from_millis(250),
        }
    }
}

/// Polls `check` until it yields `Some`. Transient driver errors count as
/// "not yet"; anything else aborts the wait.
pub async fn wait_until<T, F, Fut>(policy: &WaitPolicy, what: &str, mut check: F) -> Result<T, NavError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, DriverError>>,
{
    let deadline = Instant::now() + policy.timeout;
    loop {
        match check().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(err) if err.is_transient() => debug!(what, error = %err, "condition not met yet"),
            Err(err) => return Err(err.into()),
        }
        if Instant::now() >= deadline {
            return Err(NavError::Timeout {
                what: what.to_string(),
                waited: policy.timeout,
            });
        }
        tokio::time::sleep(policy.interval).await;
    }
}

/// DOM primitives the navigator needs. Implementations bound their own
/// element lookups; the navigator layers the workflow waits on top.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Opens (or reopens) the catalog page.
    async fn load(&self) -> Result<(), DriverError>;
    async fn click_vehicle_tab(&self, slug: &str) -> Result<(), DriverError>;
    /// Forces a CSS-hidden select to be displayed.
    async fn reveal_select(&self, select_id: &str) -> Result<(), DriverError>;
    async fn read_options(&self, select_id: &str) -> Result<Vec<RawOption>, DriverError>;
    /// Removes every option of a select, if present.
    async fn clear_options(&self, select_id: &str) -> Result<(), DriverError>;
    /// Chooses the option whose trimmed text equals `label`.
    async fn choose_option(&self, select_id: &str, label: &str) -> Result<(), DriverError>;
}

pub fn period_select_id(vehicle_type: VehicleType) -> String {
    format!("selectTabelaReferencia{}", vehicle_type.slug())
}

pub fn brand_select_id(vehicle_type: VehicleType) -> String {
    format!("selectMarca{}", vehicle_type.slug())
}

pub fn model_select_id(vehicle_type: VehicleType) -> String {
    format!("selectAnoModelo{}", vehicle_type.slug())
}

pub fn year_select_id(vehicle_type: VehicleType) -> String {
    format!("selectAno{}", vehicle_type.slug())
}

/// Entry point of the cascading-select workflow. Each selection returns the
/// next state, borrowing the navigator, so steps can only run in order:
/// vehicle type, reference period, brand, model.
pub struct Navigator<D> {
    driver: D,
    wait: WaitPolicy,
}

impl<D: PageDriver> Navigator<D> {
    pub fn new(driver: D, wait: WaitPolicy) -> Self {
        Self { driver, wait }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub async fn reload(&self) -> Result<(), NavError> {
        self.driver.load().await?;
        Ok(())
    }

    pub async fn select_vehicle_type(
        &self,
        vehicle_type: VehicleType,
    ) -> Result<TypeSelected<'_, D>, NavError> {
        let slug = vehicle_type.slug();
        let driver = &self.driver;
        wait_until(&self.wait, &format!("vehicle tab `{slug}`"), move || async move {
            driver.click_vehicle_tab(slug).await?;
            Ok::<_, DriverError>(Some(()))
        })
        .await?;
        self.populated_options(&period_select_id(vehicle_type)).await?;
        debug!(%vehicle_type, "vehicle type selected");
        Ok(TypeSelected {
            nav: self,
            vehicle_type,
        })
    }

    /// Waits until the select offers at least one non-blank option. Dependent
    /// selects are emptied before each choice, so whatever this sees was
    /// loaded for the current upstream selection.
    async fn populated_options(&self, select_id: &str) -> Result<Vec<RawOption>, NavError> {
        let driver = &self.driver;
        wait_until(&self.wait, &format!("options in `{select_id}`"), move || async move {
            driver.reveal_select(select_id).await?;
            let options: Vec<RawOption> = driver
                .read_options(select_id)
                .await?
                .into_iter()
                .filter(|o| !o.text.trim().is_empty())
                .collect();
            Ok::<_, DriverError>((!options.is_empty()).then_some(options))
        })
        .await
    }

    async fn list_items(&self, select_id: &str) -> Result<Vec<CatalogItem>, NavError> {
        self.populated_options(select_id)
            .await?
            .into_iter()
            .map(|option| -> Result<CatalogItem, NavError> {
                let value = option.value.trim();
                let external_id = value.parse::<i32>().map_err(|_| NavError::BadOptionValue {
                    select_id: select_id.to_string(),
                    text: option.text.clone(),
                    value: value.to_string(),
                })?;
                Ok(CatalogItem::new(option.text.trim(), external_id))
            })
            .collect()
    }

    /// Chooses `label` in `select_id` after emptying `dependents`, the selects
    /// the page refills in response.
    async fn choose(
        &self,
        select_id: &str,
        label: &str,
        dependents: &[String],
    ) -> Result<(), NavError> {
        let wanted = label.trim();
        let driver = &self.driver;
        let found = wait_until(
            &self.wait,
            &format!("option `{wanted}` in `{select_id}`"),
            move || async move {
                driver.reveal_select(select_id).await?;
                let options = driver.read_options(select_id).await?;
                Ok::<_, DriverError>(options.iter().any(|o| o.text.trim() == wanted).then_some(()))
            },
        )
        .await;
        match found {
            Ok(()) => {}
            Err(NavError::Timeout { .. }) => {
                return Err(NavError::NoExactMatch {
                    select_id: select_id.to_string(),
                    label: wanted.to_string(),
                })
            }
            Err(err) => return Err(err),
        }
        for dependent in dependents {
            self.driver.clear_options(dependent).await?;
        }
        self.driver.choose_option(select_id, wanted).await?;
        Ok(())
    }
}

pub struct TypeSelected<'a, D> {
    nav: &'a Navigator<D>,
    vehicle_type: VehicleType,
}

impl<'a, D: PageDriver> TypeSelected<'a, D> {
    pub fn vehicle_type(&self) -> VehicleType {
        self.vehicle_type
    }

    /// Period labels with their catalog codes, newest first as the page lists them.
    pub async fn list_reference_periods(&self) -> Result<Vec<CatalogItem>, NavError> {
        self.nav.list_items(&period_select_id(self.vehicle_type)).await
    }

    pub async fn select_reference_period(
        self,
        label: &str,
    ) -> Result<PeriodSelected<'a, D>, NavError> {
        self.nav
            .choose(
                &period_select_id(self.vehicle_type),
                label,
                &[
                    brand_select_id(self.vehicle_type),
                    model_select_id(self.vehicle_type),
                    year_select_id(self.vehicle_type),
                ],
            )
            .await?;
        Ok(PeriodSelected {
            nav: self.nav,
            vehicle_type: self.vehicle_type,
        })
    }
}

pub struct PeriodSelected<'a, D> {
    nav: &'a Navigator<D>,
    vehicle_type: VehicleType,
}

impl<'a, D: PageDriver> PeriodSelected<'a, D> {
    pub async fn list_brands(&self) -> Result<Vec<CatalogItem>, NavError> {
        self.nav.list_items(&brand_select_id(self.vehicle_type)).await
    }

    pub async fn select_brand(self, name: &str) -> Result<BrandSelected<'a, D>, NavError> {
        self.nav
            .choose(
                &brand_select_id(self.vehicle_type),
                name,
                &[model_select_id(self.vehicle_type), year_select_id(self.vehicle_type)],
            )
            .await?;
        Ok(BrandSelected {
            nav: self.nav,
            vehicle_type: self.vehicle_type,
        })
    }
}

pub struct BrandSelected<'a, D> {
    nav: &'a Navigator<D>,
    vehicle_type: VehicleType,
}

impl<'a, D: PageDriver> BrandSelected<'a, D> {
    pub async fn list_models(&self) -> Result<Vec<CatalogItem>, NavError> {
        self.nav.list_items(&model_select_id(self.vehicle_type)).await
    }

    pub async fn select_model(self, name: &str) -> Result<ModelSelected<'a, D>, NavError> {
        self.nav
            .choose(
                &model_select_id(self.vehicle_type),
                name,
                &[year_select_id(self.vehicle_type)],
            )
            .await?;
        Ok(ModelSelected {
            nav: self.nav,
            vehicle_type: self.vehicle_type,
        })
    }
}

pub struct ModelSelected<'a, D> {
    nav: &'a Navigator<D>,
    vehicle_type: VehicleType,
}

impl<'a, D: PageDriver> ModelSelected<'a, D> {
    /// Year/fuel labels of the selected model. Option values are composite
    /// codes such as `2014-1`, so only the text is kept.
    pub async fn list_years(&self) -> Result<Vec<YearFuel>, NavError> {
        let options = self
            .nav
            .populated_options(&year_select_id(self.vehicle_type))
            .await?;
        Ok(options
            .iter()
            .filter_map(|o| YearFuel::parse_label(&o.text))
            .collect())
    }
}

/// What the reconcilers need from the catalog, independent of how it is read.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn reference_periods(&self) -> Result<Vec<NewReferencePeriod>, SourceError>;

    async fn brands(
        &self,
        vehicle_type: VehicleType,
        period: &ReferencePeriod,
    ) -> Result<Vec<CatalogItem>, SourceError>;

    async fn models(
        &self,
        vehicle_type: VehicleType,
        period: &ReferencePeriod,
        brand: &Brand,
    ) -> Result<Vec<CatalogItem>, SourceError>;

    async fn year_variants(
        &self,
        vehicle_type: VehicleType,
        period: &ReferencePeriod,
        brand: &Brand,
        model: &Model,
    ) -> Result<Vec<YearFuel>, SourceError>;
}

/// Browser-backed source. Every call replays the select chain from the
/// vehicle tab, reloading the page before each retry.
pub struct BrowserCatalog<D> {
    navigator: Navigator<D>,
    retry: RetryPolicy,
}

impl<D: PageDriver> BrowserCatalog<D> {
    pub fn new(navigator: Navigator<D>, retry: RetryPolicy) -> Self {
        Self { navigator, retry }
    }

    pub fn navigator(&self) -> &Navigator<D> {
        &self.navigator
    }

    async fn prepare(&self, attempt: usize) -> Result<(), NavError> {
        if attempt > 0 {
            self.navigator.reload().await?;
        }
        Ok(())
    }

    /// Stored brand names are uppercased, so the on-page label is resolved by
    /// catalog id first and by normalized name second.
    fn brand_label(options: &[CatalogItem], brand: &Brand) -> Option<String> {
        options
            .iter()
            .find(|o| o.external_id == brand.external_id)
            .or_else(|| options.iter().find(|o| o.normalized_name() == brand.name))
            .map(|o| o.label.clone())
    }

    fn model_label(options: &[CatalogItem], model: &Model) -> Option<String> {
        options
            .iter()
            .find(|o| Some(o.external_id) == model.external_id)
            .or_else(|| options.iter().find(|o| o.label.trim() == model.name.trim()))
            .map(|o| o.label.clone())
    }
}

#[async_trait]
impl<D: PageDriver> CatalogSource for BrowserCatalog<D> {
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn reference_periods(&self) -> Result<Vec<NewReferencePeriod>, SourceError> {
        let items = with_retry(&self.retry, "list reference periods", move |attempt| async move {
            self.prepare(attempt).await?;
            let tab = self.navigator.select_vehicle_type(VehicleType::Car).await?;
            tab.list_reference_periods().await
        })
        .await?;
        items
            .into_iter()
            .map(|item| -> Result<NewReferencePeriod, SourceError> {
                Ok(NewReferencePeriod::parse_label(&item.label)?.with_catalog_code(item.external_id))
            })
            .collect()
    }

    async fn brands(
        &self,
        vehicle_type: VehicleType,
        period: &ReferencePeriod,
    ) -> Result<Vec<CatalogItem>, SourceError> {
        let items = with_retry(&self.retry, "list brands", move |attempt| async move {
            self.prepare(attempt).await?;
            let period_sel = self
                .navigator
                .select_vehicle_type(vehicle_type)
                .await?
                .select_reference_period(&period.label)
                .await?;
            period_sel.list_brands().await
        })
        .await?;
        Ok(items)
    }

    async fn models(
        &self,
        vehicle_type: VehicleType,
        period: &ReferencePeriod,
        brand: &Brand,
    ) -> Result<Vec<CatalogItem>, SourceError> {
        let items = with_retry(&self.retry, "list models", move |attempt| async move {
            self.prepare(attempt).await?;
            let period_sel = self
                .navigator
                .select_vehicle_type(vehicle_type)
                .await?
                .select_reference_period(&period.label)
                .await?;
            let options = period_sel.list_brands().await?;
            let label = Self::brand_label(&options, brand).ok_or_else(|| NavError::NoExactMatch {
                select_id: brand_select_id(vehicle_type),
                label: brand.name.clone(),
            })?;
            period_sel.select_brand(&label).await?.list_models().await
        })
        .await?;
        Ok(items)
    }

    async fn year_variants(
        &self,
        vehicle_type: VehicleType,
        period: &ReferencePeriod,
        brand: &Brand,
        model: &Model,
    ) -> Result<Vec<YearFuel>, SourceError> {
        let years = with_retry(&self.retry, "list years", move |attempt| async move {
            self.prepare(attempt).await?;
            let period_sel = self
                .navigator
                .select_vehicle_type(vehicle_type)
                .await?
                .select_reference_period(&period.label)
                .await?;
            let brands = period_sel.list_brands().await?;
            let brand_label =
                Self::brand_label(&brands, brand).ok_or_else(|| NavError::NoExactMatch {
                    select_id: brand_select_id(vehicle_type),
                    label: brand.name.clone(),
                })?;
            let brand_sel = period_sel.select_brand(&brand_label).await?;
            let models = brand_sel.list_models().await?;
            let model_label =
                Self::model_label(&models, model).ok_or_else(|| NavError::NoExactMatch {
                    select_id: model_select_id(vehicle_type),
                    label: model.name.clone(),
                })?;
            brand_sel.select_model(&model_label).await?.list_years().await
        })
        .await?;
        Ok(years)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct SelectState {
        shown: Vec<RawOption>,
        /// Options the page swaps in after the given number of further reads.
        refill: Option<(usize, Vec<RawOption>)>,
    }

    /// Scripted cascading page. Choosing an option schedules a refill of the
    /// dependent select; until the refill lands, reads return whatever the
    /// dependent select showed before. Optional failure budgets make the
    /// first N reads fail.
    #[derive(Default)]
    struct ScriptedPage {
        selects: Mutex<HashMap<String, SelectState>>,
        cascade: HashMap<(String, String), (String, Vec<RawOption>)>,
        refill_lag: usize,
        tabs: Vec<String>,
        failing_reads: AtomicUsize,
        loads: AtomicUsize,
        chosen: Mutex<Vec<(String, String)>>,
    }

    fn raw(options: &[(&str, &str)]) -> Vec<RawOption> {
        options.iter().map(|(t, v)| RawOption::new(*t, *v)).collect()
    }

    impl ScriptedPage {
        fn with_select(mut self, select_id: &str, options: &[(&str, &str)]) -> Self {
            self.selects.get_mut().unwrap().entry(select_id.to_string()).or_default().shown =
                raw(options);
            self
        }

        /// Choosing `label` in `select_id` refills `dependent` with `options`.
        fn with_cascade(
            mut self,
            select_id: &str,
            label: &str,
            dependent: &str,
            options: &[(&str, &str)],
        ) -> Self {
            self.selects
                .get_mut()
                .unwrap()
                .entry(dependent.to_string())
                .or_default();
            self.cascade.insert(
                (select_id.to_string(), label.to_string()),
                (dependent.to_string(), raw(options)),
            );
            self
        }

        fn with_refill_lag(mut self, reads: usize) -> Self {
            self.refill_lag = reads;
            self
        }

        fn with_tabs(mut self, slugs: &[&str]) -> Self {
            self.tabs = slugs.iter().map(|s| s.to_string()).collect();
            self
        }
    }

    #[async_trait]
    impl PageDriver for ScriptedPage {
        async fn load(&self) -> Result<(), DriverError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn click_vehicle_tab(&self, slug: &str) -> Result<(), DriverError> {
            if self.tabs.iter().any(|t| t == slug) {
                Ok(())
            } else {
                Err(DriverError::NotFound(slug.to_string()))
            }
        }

        async fn reveal_select(&self, select_id: &str) -> Result<(), DriverError> {
            if self.selects.lock().unwrap().contains_key(select_id) {
                Ok(())
            } else {
                Err(DriverError::NotFound(select_id.to_string()))
            }
        }

        async fn read_options(&self, select_id: &str) -> Result<Vec<RawOption>, DriverError> {
            let remaining = self.failing_reads.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_reads.store(remaining - 1, Ordering::SeqCst);
                return Err(DriverError::Session("renderer crashed".into()));
            }
            let mut selects = self.selects.lock().unwrap();
            let state = selects
                .get_mut(select_id)
                .ok_or_else(|| DriverError::NotFound(select_id.to_string()))?;
            match state.refill.take() {
                Some((0, options)) => state.shown = options,
                Some((lag, options)) => state.refill = Some((lag - 1, options)),
                None => {}
            }
            Ok(state.shown.clone())
        }

        async fn clear_options(&self, select_id: &str) -> Result<(), DriverError> {
            if let Some(state) = self.selects.lock().unwrap().get_mut(select_id) {
                state.shown.clear();
            }
            Ok(())
        }

        async fn choose_option(&self, select_id: &str, label: &str) -> Result<(), DriverError> {
            let mut selects = self.selects.lock().unwrap();
            let offered = selects
                .get(select_id)
                .is_some_and(|state| state.shown.iter().any(|o| o.text.trim() == label));
            if !offered {
                return Err(DriverError::NoSuchOption {
                    select_id: select_id.to_string(),
                    label: label.to_string(),
                });
            }
            self.chosen
                .lock()
                .unwrap()
                .push((select_id.to_string(), label.to_string()));
            if let Some((dependent, options)) =
                self.cascade.get(&(select_id.to_string(), label.to_string()))
            {
                if let Some(state) = selects.get_mut(dependent) {
                    state.refill = Some((self.refill_lag, options.clone()));
                }
            }
            Ok(())
        }
    }

    fn fast_wait() -> WaitPolicy {
        WaitPolicy {
            timeout: Duration::from_secs(2),
            interval: Duration::from_millis(100),
        }
    }

    const PERIODS: &str = "selectTabelaReferenciacarro";
    const BRANDS: &str = "selectMarcacarro";
    const MODELS: &str = "selectAnoModelocarro";
    const YEARS: &str = "selectAnocarro";

    /// Two periods with different brand lists, three brands with their own
    /// models, and years per model. Dependent selects refill two reads late.
    fn car_page() -> ScriptedPage {
        ScriptedPage::default()
            .with_tabs(&["carro"])
            .with_refill_lag(2)
            .with_select(PERIODS, &[("março/2025 ", "318"), ("fevereiro/2025 ", "317")])
            .with_cascade(PERIODS, "março/2025", BRANDS, &[("", ""), ("Honda", "25"), ("Toyota", "56")])
            .with_cascade(PERIODS, "fevereiro/2025", BRANDS, &[("", ""), ("Fiat", "21"), ("Honda", "25")])
            .with_cascade(BRANDS, "Honda", MODELS, &[("", ""), ("Civic EXL 2.0", "4828"), ("Fit LX 1.5", "5001")])
            .with_cascade(BRANDS, "Toyota", MODELS, &[("", ""), ("Corolla XEi 2.0", "7001")])
            .with_cascade(BRANDS, "Fiat", MODELS, &[("", ""), ("Uno Mille 1.0", "3001")])
            .with_cascade(MODELS, "Civic EXL 2.0", YEARS, &[("2014 Gasolina", "2014-1"), ("2013 Flex", "2013-1")])
            .with_cascade(MODELS, "Fit LX 1.5", YEARS, &[("2016 Flex", "2016-1")])
            .with_cascade(MODELS, "Corolla XEi 2.0", YEARS, &[("2020 Flex", "2020-1")])
    }

    fn period(label: &str) -> ReferencePeriod {
        ReferencePeriod {
            id: 1,
            month: 3,
            year: 2025,
            label: label.to_string(),
            catalog_code: Some(318),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn navigator_walks_the_select_chain_in_order() {
        let nav = Navigator::new(car_page(), fast_wait());
        let periods = nav
            .select_vehicle_type(VehicleType::Car)
            .await
            .expect("tab")
            .list_reference_periods()
            .await
            .expect("periods");
        assert_eq!(periods[0], CatalogItem::new("março/2025", 318));

        let brands = nav
            .select_vehicle_type(VehicleType::Car)
            .await
            .expect("tab")
            .select_reference_period("março/2025")
            .await
            .expect("period")
            .list_brands()
            .await
            .expect("brands");
        assert_eq!(
            brands,
            vec![CatalogItem::new("Honda", 25), CatalogItem::new("Toyota", 56)]
        );

        let chosen = nav.driver().chosen.lock().unwrap().clone();
        assert_eq!(
            chosen,
            vec![("selectTabelaReferenciacarro".to_string(), "março/2025".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_vehicle_tab_times_out() {
        let nav = Navigator::new(car_page(), fast_wait());
        let err = nav
            .select_vehicle_type(VehicleType::Truck)
            .await
            .err()
            .expect("truck tab is absent");
        assert!(matches!(err, NavError::Timeout { .. }), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn selection_requires_exact_text() {
        let nav = Navigator::new(car_page(), fast_wait());
        let err = nav
            .select_vehicle_type(VehicleType::Car)
            .await
            .expect("tab")
            .select_reference_period("março")
            .await
            .err()
            .expect("partial label must not match");
        assert!(matches!(err, NavError::NoExactMatch { .. }), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn non_numeric_option_value_is_a_data_shape_error() {
        let page = car_page().with_cascade(PERIODS, "março/2025", BRANDS, &[("Honda", "abc")]);
        let nav = Navigator::new(page, fast_wait());
        let err = nav
            .select_vehicle_type(VehicleType::Car)
            .await
            .expect("tab")
            .select_reference_period("março/2025")
            .await
            .expect("period")
            .list_brands()
            .await
            .err()
            .expect("bad value");
        assert!(matches!(err, NavError::BadOptionValue { .. }));
        assert!(SourceError::from(err).is_data_shape());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_the_configured_attempts() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let result: Result<(), NavError> = with_retry(&policy, "flaky", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), NavError>(NavError::from(DriverError::Session("gone".into()))) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(NavError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_returns_once_condition_holds() {
        let polls = AtomicUsize::new(0);
        let value = wait_until(&fast_wait(), "third poll", || {
            let n = polls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, DriverError>((n >= 2).then_some(n)) }
        })
        .await
        .expect("condition");
        assert_eq!(value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn browser_catalog_reloads_between_attempts() {
        let page = car_page();
        page.failing_reads.store(1, Ordering::SeqCst);
        let catalog = BrowserCatalog::new(
            Navigator::new(page, fast_wait()),
            RetryPolicy::new(3, Duration::from_millis(10)),
        );
        let brands = catalog
            .brands(VehicleType::Car, &period("março/2025"))
            .await
            .expect("second attempt succeeds");
        assert_eq!(brands.len(), 2);
        assert_eq!(catalog.navigator().driver().loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn browser_catalog_resolves_uppercased_brand_by_catalog_id() {
        let catalog = BrowserCatalog::new(Navigator::new(car_page(), fast_wait()), RetryPolicy::default());
        let brand = Brand {
            id: 7,
            name: "HONDA".into(),
            external_id: 25,
            vehicle_type: VehicleType::Car,
            period_id: 1,
        };
        let models = catalog
            .models(VehicleType::Car, &period("março/2025"), &brand)
            .await
            .expect("models");
        assert_eq!(
            models,
            vec![CatalogItem::new("Civic EXL 2.0", 4828), CatalogItem::new("Fit LX 1.5", 5001)]
        );

        let model = Model {
            id: 3,
            name: "Civic EXL 2.0".into(),
            external_id: Some(4828),
            brand_id: 7,
            period_id: 1,
        };
        let years = catalog
            .year_variants(VehicleType::Car, &period("março/2025"), &brand, &model)
            .await
            .expect("years");
        assert_eq!(years.len(), 2);
        assert_eq!(years[0].fuel, "Gasolina");
    }

    #[tokio::test(start_paused = true)]
    async fn periods_are_parsed_with_their_codes() {
        let catalog = BrowserCatalog::new(Navigator::new(car_page(), fast_wait()), RetryPolicy::default());
        let periods = catalog.reference_periods().await.expect("periods");
        assert_eq!(periods.len(), 2);
        assert_eq!(periods[0].month, 3);
        assert_eq!(periods[0].catalog_code, Some(318));
        assert_eq!(periods[1].label, "fevereiro/2025");
    }

    fn brand(name: &str, external_id: i32) -> Brand {
        Brand {
            id: external_id,
            name: name.into(),
            external_id,
            vehicle_type: VehicleType::Car,
            period_id: 1,
        }
    }

    fn model(name: &str, external_id: i32) -> Model {
        Model {
            id: external_id,
            name: name.into(),
            external_id: Some(external_id),
            brand_id: 25,
            period_id: 1,
        }
    }

    fn labels(items: &[CatalogItem]) -> Vec<&str> {
        items.iter().map(|i| i.label.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn choosing_a_brand_empties_the_stale_model_select() {
        let nav = Navigator::new(car_page(), fast_wait());
        let honda = nav
            .select_vehicle_type(VehicleType::Car)
            .await
            .expect("tab")
            .select_reference_period("março/2025")
            .await
            .expect("period")
            .select_brand("Honda")
            .await
            .expect("honda");
        assert_eq!(honda.list_models().await.expect("models").len(), 2);

        let toyota = nav
            .select_vehicle_type(VehicleType::Car)
            .await
            .expect("tab")
            .select_reference_period("março/2025")
            .await
            .expect("period")
            .select_brand("Toyota")
            .await
            .expect("toyota");
        assert!(nav.driver().selects.lock().unwrap()[MODELS].shown.is_empty());
        assert_eq!(
            toyota.list_models().await.expect("models"),
            vec![CatalogItem::new("Corolla XEi 2.0", 7001)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn successive_brands_read_their_own_models() {
        let catalog = BrowserCatalog::new(Navigator::new(car_page(), fast_wait()), RetryPolicy::default());
        let march = period("março/2025");

        let honda = catalog
            .models(VehicleType::Car, &march, &brand("HONDA", 25))
            .await
            .expect("honda models");
        assert_eq!(labels(&honda), vec!["Civic EXL 2.0", "Fit LX 1.5"]);

        let toyota = catalog
            .models(VehicleType::Car, &march, &brand("TOYOTA", 56))
            .await
            .expect("toyota models");
        assert_eq!(toyota, vec![CatalogItem::new("Corolla XEi 2.0", 7001)]);

        let honda_again = catalog
            .models(VehicleType::Car, &march, &brand("HONDA", 25))
            .await
            .expect("honda models again");
        assert_eq!(honda_again, honda);
    }

    #[tokio::test(start_paused = true)]
    async fn successive_periods_read_their_own_brands() {
        let catalog = BrowserCatalog::new(Navigator::new(car_page(), fast_wait()), RetryPolicy::default());
        let march = catalog
            .brands(VehicleType::Car, &period("março/2025"))
            .await
            .expect("march brands");
        assert_eq!(labels(&march), vec!["Honda", "Toyota"]);

        let february = catalog
            .brands(VehicleType::Car, &period("fevereiro/2025"))
            .await
            .expect("february brands");
        assert_eq!(labels(&february), vec!["Fiat", "Honda"]);

        let fiat = catalog
            .models(VehicleType::Car, &period("fevereiro/2025"), &brand("FIAT", 21))
            .await
            .expect("fiat models");
        assert_eq!(fiat, vec![CatalogItem::new("Uno Mille 1.0", 3001)]);
    }

    #[tokio::test(start_paused = true)]
    async fn successive_models_read_their_own_years() {
        let catalog = BrowserCatalog::new(Navigator::new(car_page(), fast_wait()), RetryPolicy::default());
        let march = period("março/2025");
        let honda = brand("HONDA", 25);

        let civic = catalog
            .year_variants(VehicleType::Car, &march, &honda, &model("Civic EXL 2.0", 4828))
            .await
            .expect("civic years");
        assert_eq!(civic.len(), 2);

        let fit = catalog
            .year_variants(VehicleType::Car, &march, &honda, &model("Fit LX 1.5", 5001))
            .await
            .expect("fit years");
        assert_eq!(fit, vec![YearFuel::parse_label("2016 Flex").unwrap()]);
    }
}
