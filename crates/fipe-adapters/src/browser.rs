use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use fantoccini::error::CmdError;
use fantoccini::{Client, ClientBuilder, Locator};
use serde_json::{json, Value as JsonValue};
use tracing::{info, info_span, warn, Instrument};

use crate::{DriverError, PageDriver, RawOption};

const REVEAL_SELECT_JS: &str = "document.getElementById(arguments[0]).style.display = 'block';";

const READ_OPTIONS_JS: &str = "return Array.from(document.getElementById(arguments[0]).options)\
     .map(o => ({ text: o.text, value: o.value }));";

const CLICK_JS: &str = "document.querySelector(arguments[0]).click();";

const CLEAR_OPTIONS_JS: &str = r#"
const select = document.getElementById(arguments[0]);
if (select) {
  select.options.length = 0;
  if (window.jQuery) { window.jQuery(select).trigger('chosen:updated'); }
}
"#;

const CHOOSE_OPTION_JS: &str = r#"
const select = document.getElementById(arguments[0]);
const index = Array.from(select.options).findIndex(o => o.text.trim() === arguments[1]);
if (index < 0) { return false; }
select.selectedIndex = index;
select.dispatchEvent(new Event('change', { bubbles: true }));
if (window.jQuery) { window.jQuery(select).trigger('chosen:updated'); }
return true;
"#;

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub webdriver_url: String,
    pub base_url: String,
    pub headless: bool,
    /// Upper bound for a single element lookup.
    pub element_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:9515".to_string(),
            base_url: "https://veiculos.fipe.org.br/".to_string(),
            headless: true,
            element_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_millis(250),
        }
    }
}

fn chrome_capabilities(headless: bool) -> serde_json::Map<String, JsonValue> {
    let mut args = vec![
        "--no-sandbox",
        "--disable-dev-shm-usage",
        "--disable-gpu",
        "--disable-extensions",
        "--disable-infobars",
        "--window-size=1920,1080",
        "--disable-blink-features=AutomationControlled",
    ];
    if headless {
        args.push("--headless=new");
    }
    let mut caps = serde_json::Map::new();
    caps.insert("browserName".into(), json!("chrome"));
    caps.insert(
        "goog:chromeOptions".into(),
        json!({
            "args": args,
            "excludeSwitches": ["enable-automation"],
            "useAutomationExtension": false,
        }),
    );
    caps
}

fn classify(err: CmdError, what: &str) -> DriverError {
    if err.is_no_such_element() || matches!(err, CmdError::WaitTimeout) {
        DriverError::NotFound(what.to_string())
    } else {
        DriverError::Command(format!("{what}: {err}"))
    }
}

/// [`PageDriver`] over a live WebDriver session.
pub struct WebDriverPage {
    client: Client,
    base_url: String,
    element_timeout: Duration,
    poll_interval: Duration,
}

impl WebDriverPage {
    pub async fn connect(config: &BrowserConfig) -> Result<Self, DriverError> {
        let mut builder = ClientBuilder::native();
        builder.capabilities(chrome_capabilities(config.headless));
        let client = builder
            .connect(&config.webdriver_url)
            .await
            .map_err(|err| DriverError::Session(err.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            element_timeout: config.element_timeout,
            poll_interval: config.poll_interval,
        })
    }

    async fn wait_for(&self, locator: Locator<'_>, what: &str) -> Result<(), DriverError> {
        self.client
            .wait()
            .at_most(self.element_timeout)
            .every(self.poll_interval)
            .for_element(locator)
            .await
            .map(|_| ())
            .map_err(|err| classify(err, what))
    }

    async fn run_script(
        &self,
        script: &str,
        args: Vec<JsonValue>,
        what: &str,
    ) -> Result<JsonValue, DriverError> {
        self.client
            .execute(script, args)
            .await
            .map_err(|err| classify(err, what))
    }
}

#[async_trait]
impl PageDriver for WebDriverPage {
    async fn load(&self) -> Result<(), DriverError> {
        self.client
            .goto(&self.base_url)
            .await
            .map_err(|err| classify(err, &self.base_url))?;
        self.wait_for(Locator::Css("div.tab-veiculos"), "vehicle tabs")
            .await
    }

    async fn click_vehicle_tab(&self, slug: &str) -> Result<(), DriverError> {
        let selector = format!("div.tab-veiculos ul li.ilustra a[data-slug=\"{slug}\"]");
        self.wait_for(Locator::Css(&selector), &selector).await?;
        self.run_script(CLICK_JS, vec![json!(selector)], &selector)
            .await?;
        Ok(())
    }

    async fn reveal_select(&self, select_id: &str) -> Result<(), DriverError> {
        self.wait_for(Locator::Id(select_id), select_id).await?;
        self.run_script(REVEAL_SELECT_JS, vec![json!(select_id)], select_id)
            .await?;
        Ok(())
    }

    async fn read_options(&self, select_id: &str) -> Result<Vec<RawOption>, DriverError> {
        self.wait_for(Locator::Id(select_id), select_id).await?;
        let raw = self
            .run_script(READ_OPTIONS_JS, vec![json!(select_id)], select_id)
            .await?;
        serde_json::from_value(raw)
            .map_err(|err| DriverError::Command(format!("decoding options of {select_id}: {err}")))
    }

    async fn clear_options(&self, select_id: &str) -> Result<(), DriverError> {
        self.run_script(CLEAR_OPTIONS_JS, vec![json!(select_id)], select_id)
            .await?;
        Ok(())
    }

    async fn choose_option(&self, select_id: &str, label: &str) -> Result<(), DriverError> {
        let chosen = self
            .run_script(
                CHOOSE_OPTION_JS,
                vec![json!(select_id), json!(label)],
                select_id,
            )
            .await?;
        if chosen.as_bool() == Some(true) {
            Ok(())
        } else {
            Err(DriverError::NoSuchOption {
                select_id: select_id.to_string(),
                label: label.to_string(),
            })
        }
    }
}

/// Opens one browser session, loads the catalog page, runs `run` and closes
/// the session whether or not `run` succeeded.
pub async fn with_browser<T, F, Fut>(config: &BrowserConfig, run: F) -> anyhow::Result<T>
where
    F: FnOnce(WebDriverPage) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let span = info_span!("browser_session", webdriver = %config.webdriver_url);
    let page = WebDriverPage::connect(config)
        .instrument(span.clone())
        .await
        .context("opening browser session")?;
    let client = page.client.clone();

    let outcome = async {
        page.load().await.context("loading catalog page")?;
        info!(url = %config.base_url, "catalog page loaded");
        run(page).await
    }
    .instrument(span.clone())
    .await;

    if let Err(err) = client.close().await {
        span.in_scope(|| warn!(error = %err, "closing browser session failed"));
    }
    outcome
}
