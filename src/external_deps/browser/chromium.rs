//! Chromium backend built on `chromiumoxide`.
//!
//! Responses are intercepted on the CDP network domain: a watcher claims the
//! first `Network.responseReceived` whose URL matches its pattern, then the
//! body is pulled with `Network.getResponseBody` once the matching
//! `Network.loadingFinished` arrives.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chromiumoxide::Page;
use chromiumoxide::auth::Credentials;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetTimezoneOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventResponseReceived, GetResponseBodyParams,
    Headers, RequestId, SetExtraHttpHeadersParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::error::CdpError;
use futures::StreamExt;
use futures::stream::BoxStream;
use regex::Regex;
use tokio::task::JoinHandle;
use url::Url;

use super::{BrowserError, BrowserLauncher, BrowserSession, LaunchOptions, ResponseWatcher, WatchSender};
use crate::capture::CapturedResponse;
use crate::modules::stealth::{self, StealthProfile};

/// Launches a local Chromium per run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChromiumLauncher;

impl ChromiumLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let data_dir = session_data_dir();
        let mut builder = BrowserConfig::builder().user_data_dir(&data_dir);
        if !options.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &options.executable {
            builder = builder.chrome_executable(path);
        }

        let mut args = options.args.clone();
        if let Some(proxy) = &options.proxy {
            args.push(format!("--proxy-server={}", proxy.server_url()));
        }
        let config = builder
            .args(args)
            .build()
            .map_err(BrowserError::ExecutableNotFound)?;

        let (browser, mut handler) = match Browser::launch(config).await {
            Ok(launched) => launched,
            Err(err) => {
                remove_data_dir(&data_dir).await;
                return Err(launch_error(err));
            }
        };
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    log::debug!("chromium handler event error: {err}");
                }
            }
        });

        let (page, events) = match prepare_page(&browser, options).await {
            Ok(prepared) => prepared,
            Err(err) => {
                log::debug!("chromium page setup failed: {err}");
                shut_down(Some(browser), &handler_task, &data_dir).await;
                return Err(err);
            }
        };
        let pending = Arc::new(Mutex::new(Vec::new()));
        let router = tokio::spawn(route_responses(page.clone(), Arc::clone(&pending), events));

        Ok(Box::new(ChromiumSession {
            browser: tokio::sync::Mutex::new(Some(browser)),
            page,
            pending,
            router,
            handler: handler_task,
            data_dir,
        }))
    }
}

/// Opens the working tab, answers proxy auth challenges and subscribes to
/// the network events the router needs.
async fn prepare_page(
    browser: &Browser,
    options: &LaunchOptions,
) -> Result<(Page, BoxStream<'static, NetworkEvent>), BrowserError> {
    let page = browser.new_page("about:blank").await.map_err(launch_error)?;

    if let Some(proxy) = options.proxy.as_ref().filter(|proxy| proxy.has_credentials()) {
        page.authenticate(Credentials {
            username: proxy.username().unwrap_or_default().to_string(),
            password: proxy.password().unwrap_or_default().to_string(),
        })
        .await
        .map_err(protocol_error)?;
    }

    let events = network_events(&page).await?;
    Ok((page, events))
}

/// Fresh profile dir under the system temp dir, unique per session.
fn session_data_dir() -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "catalog-scraper-{}-{seq}-{:08x}",
        std::process::id(),
        rand::random::<u32>()
    ))
}

/// Closes the browser, stops the handler and removes the profile dir.
async fn shut_down(browser: Option<Browser>, handler: &JoinHandle<()>, data_dir: &Path) {
    if let Some(mut browser) = browser {
        if let Err(err) = browser.close().await {
            log::debug!("chromium close failed: {err}");
        }
        let _ = browser.wait().await;
    }
    handler.abort();
    remove_data_dir(data_dir).await;
}

async fn remove_data_dir(data_dir: &Path) {
    match tokio::fs::remove_dir_all(data_dir).await {
        Ok(()) => log::debug!("removed chromium profile dir {}", data_dir.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => log::warn!(
            "could not remove chromium profile dir {}: {err}",
            data_dir.display()
        ),
    }
}

struct PendingWatch {
    pattern: Regex,
    tx: WatchSender,
}

struct InFlight {
    url: String,
    status: u16,
    tx: WatchSender,
}

enum NetworkEvent {
    Received(Arc<EventResponseReceived>),
    Finished(Arc<EventLoadingFinished>),
    Failed(Arc<EventLoadingFailed>),
}

pub struct ChromiumSession {
    browser: tokio::sync::Mutex<Option<Browser>>,
    page: Page,
    pending: Arc<Mutex<Vec<PendingWatch>>>,
    router: JoinHandle<()>,
    handler: JoinHandle<()>,
    data_dir: PathBuf,
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn apply_profile(&self, profile: &StealthProfile) -> Result<(), BrowserError> {
        let mut user_agent = SetUserAgentOverrideParams::new(profile.user_agent.clone());
        user_agent.accept_language = Some(profile.accept_language.clone());
        user_agent.platform = Some(profile.platform.clone());
        self.page.execute(user_agent).await.map_err(protocol_error)?;

        self.page
            .execute(SetDeviceMetricsOverrideParams::new(
                i64::from(profile.viewport.width),
                i64::from(profile.viewport.height),
                1.0,
                false,
            ))
            .await
            .map_err(protocol_error)?;

        self.page
            .execute(SetTimezoneOverrideParams::new(profile.timezone.clone()))
            .await
            .map_err(protocol_error)?;

        let headers = serde_json::to_value(&profile.headers)
            .map_err(|err| BrowserError::Protocol(err.to_string()))?;
        self.page
            .execute(SetExtraHttpHeadersParams::new(Headers::new(headers)))
            .await
            .map_err(protocol_error)?;

        for script in stealth::init_scripts(profile) {
            self.page
                .execute(AddScriptToEvaluateOnNewDocumentParams::new(script))
                .await
                .map_err(protocol_error)?;
        }
        Ok(())
    }

    fn watch_response(&self, pattern: &Regex) -> ResponseWatcher {
        let (tx, watcher) = ResponseWatcher::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PendingWatch {
                pattern: pattern.clone(),
                tx,
            });
        watcher
    }

    async fn navigate(&self, url: &Url) -> Result<(), BrowserError> {
        self.page
            .goto(url.as_str())
            .await
            .map(|_| ())
            .map_err(|err| BrowserError::Navigation(err.to_string()))
    }

    async fn content(&self) -> Result<String, BrowserError> {
        self.page.content().await.map_err(protocol_error)
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.router.abort();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let page_result = self.page.clone().close().await.map_err(protocol_error);

        let browser = self.browser.lock().await.take();
        shut_down(browser, &self.handler, &self.data_dir).await;
        page_result
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        self.router.abort();
        self.handler.abort();
        // Still holding the browser means close() never ran.
        if self.browser.get_mut().take().is_some() {
            let _ = std::fs::remove_dir_all(&self.data_dir);
        }
    }
}

async fn network_events(page: &Page) -> Result<BoxStream<'static, NetworkEvent>, BrowserError> {
    let received = page
        .event_listener::<EventResponseReceived>()
        .await
        .map_err(protocol_error)?;
    let finished = page
        .event_listener::<EventLoadingFinished>()
        .await
        .map_err(protocol_error)?;
    let failed = page
        .event_listener::<EventLoadingFailed>()
        .await
        .map_err(protocol_error)?;

    Ok(futures::stream::select_all(vec![
        received.map(NetworkEvent::Received).boxed(),
        finished.map(NetworkEvent::Finished).boxed(),
        failed.map(NetworkEvent::Failed).boxed(),
    ])
    .boxed())
}

async fn route_responses(
    page: Page,
    pending: Arc<Mutex<Vec<PendingWatch>>>,
    mut events: BoxStream<'static, NetworkEvent>,
) {
    let mut in_flight: HashMap<RequestId, InFlight> = HashMap::new();

    while let Some(event) = events.next().await {
        match event {
            NetworkEvent::Received(event) => {
                let url = &event.response.url;
                let claimed = {
                    let mut guard = pending.lock().unwrap_or_else(PoisonError::into_inner);
                    guard.retain(|watch| !watch.tx.is_closed());
                    let index = guard.iter().position(|watch| watch.pattern.is_match(url));
                    index.map(|index| guard.remove(index))
                };
                if let Some(watch) = claimed {
                    log::debug!("intercepted {url} ({})", event.response.status);
                    in_flight.insert(
                        event.request_id.clone(),
                        InFlight {
                            url: url.clone(),
                            status: u16::try_from(event.response.status).unwrap_or(0),
                            tx: watch.tx,
                        },
                    );
                }
            }
            NetworkEvent::Finished(event) => {
                if let Some(flight) = in_flight.remove(&event.request_id) {
                    let result = response_body(&page, event.request_id.clone())
                        .await
                        .map(|body| CapturedResponse::new(flight.url, flight.status, body));
                    let _ = flight.tx.send(result);
                }
            }
            NetworkEvent::Failed(event) => {
                if let Some(flight) = in_flight.remove(&event.request_id) {
                    let _ = flight
                        .tx
                        .send(Err(BrowserError::Navigation(event.error_text.clone())));
                }
            }
        }
    }
}

async fn response_body(page: &Page, request_id: RequestId) -> Result<Vec<u8>, BrowserError> {
    let reply = page
        .execute(GetResponseBodyParams::new(request_id))
        .await
        .map_err(protocol_error)?;
    if reply.result.base64_encoded {
        STANDARD
            .decode(&reply.result.body)
            .map_err(|err| BrowserError::Protocol(err.to_string()))
    } else {
        Ok(reply.result.body.clone().into_bytes())
    }
}

fn launch_error(err: CdpError) -> BrowserError {
    match err {
        CdpError::Io(io) if io.kind() == io::ErrorKind::NotFound => {
            BrowserError::ExecutableNotFound(io.to_string())
        }
        other => BrowserError::Launch(other.to_string()),
    }
}

fn protocol_error(err: CdpError) -> BrowserError {
    BrowserError::Protocol(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_session_gets_its_own_profile_dir() {
        let first = session_data_dir();
        let second = session_data_dir();
        assert_ne!(first, second);
        assert!(first.starts_with(std::env::temp_dir()));
        assert!(!first.exists());
    }
}
