use anyhow::{anyhow, Result};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::InsertTextParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::element::Element;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::debug;

const POLL: Duration = Duration::from_millis(250);

pub struct Browser {
    page: Page,
    _browser: OxideBrowser,
}

impl Browser {
    pub async fn connect(ws_url: &str, viewport: (u32, u32)) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        let mut pages = browser.pages().await?;
        let page = match pages.pop() {
            Some(p) => p,
            None => browser.new_page("about:blank").await?,
        };
        page.execute(
            SetDeviceMetricsOverrideParams::builder()
                .width(viewport.0 as i64)
                .height(viewport.1 as i64)
                .device_scale_factor(1.0)
                .mobile(false)
                .build()
                .map_err(|e| anyhow!(e))?,
        )
        .await?;
        debug!(ws = ws_url, width = viewport.0, height = viewport.1, "attached to browser");
        Ok(Self { page, _browser: browser })
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn evaluate<T: DeserializeOwned>(&self, js: &str) -> Result<T> {
        let result = self.page.evaluate_expression(js.to_string()).await?;
        Ok(result.into_value::<T>()?)
    }

    pub async fn find_all(&self, selector: &str) -> Result<Vec<Element>> {
        Ok(self.page.find_elements(selector).await?)
    }

    /// Poll for `selector`; `None` once `timeout` elapses.
    pub async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<Option<Element>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(el) = self.page.find_element(selector).await {
                return Ok(Some(el));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(POLL).await;
        }
    }

    pub async fn open_element(&self, el: &Element) -> Result<()> {
        el.scroll_into_view().await?;
        el.hover().await?;
        sleep(Duration::from_millis(500)).await;
        el.click().await?;
        sleep(Duration::from_millis(1000)).await;
        el.press_key("Enter").await?;
        sleep(Duration::from_millis(2000)).await;
        Ok(())
    }

    pub async fn type_into(&self, el: &Element, text: &str) -> Result<()> {
        el.click().await?;
        self.page
            .execute(InsertTextParams { text: text.to_string() })
            .await?;
        el.press_key("Enter").await?;
        Ok(())
    }

    pub async fn screenshot_element(&self, selector: &str) -> Result<Vec<u8>> {
        let el = self.page.find_element(selector).await?;
        el.scroll_into_view().await?;
        el.hover().await?;
        sleep(Duration::from_millis(500)).await;
        Ok(el.screenshot(CaptureScreenshotFormat::Jpeg).await?)
    }

    pub async fn wait_for_stable(&self, settle: Duration) {
        sleep(settle).await;
    }
}
