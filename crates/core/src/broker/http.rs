// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only
// Please see LICENSE in the repository root for full details.

//! The reqwest-backed client for the external browser bridge.
//!
//! The bridge is the process that owns the real browser: it exposes a small
//! JSON API over loopback and answers with the usual
//! `{success, data, error}` envelope.

use std::time::Duration;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tabfleet_data_model::{LockOwner, TabId, TabLock};
use url::Url;

use super::{BrokerError, CreateTabParams, TabBroker, UrlChange};

/// Extra time granted to the bridge on top of a script's own budget, so the
/// bridge-side timeout fires first and carries the better error.
const TRANSPORT_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    data: Option<serde_json::Value>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTabBody<'a> {
    url: &'a str,
    owner: LockOwner,
    headless: bool,
    cookie_file: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedTab {
    tab_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteBody<'a> {
    script: &'a str,
    timeout_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WaitUrlChangeBody {
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UrlChangeReply {
    changed: bool,
    url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachFileBody<'a> {
    selector: &'a str,
    file_path: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportCookiesBody<'a> {
    dest_path: &'a str,
}

/// A [`TabBroker`] speaking JSON to the external browser bridge.
#[derive(Debug, Clone)]
pub struct HttpTabBroker {
    base: Url,
    client: reqwest::Client,
}

impl HttpTabBroker {
    /// Creates a client for the bridge at `base`.
    ///
    /// # Errors
    ///
    /// Fails if the underlying HTTP client cannot be constructed.
    pub fn new(base: Url) -> Result<Self, BrokerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(BrokerError::transport)?;
        Ok(Self { base, client })
    }

    fn endpoint(&self, path: &str) -> Result<Url, BrokerError> {
        self.base
            .join(path)
            .map_err(|e| BrokerError::Bridge(format!("invalid bridge endpoint {path}: {e}")))
    }

    fn unwrap_envelope<T>(tab: Option<&TabId>, envelope: Envelope) -> Result<T, BrokerError>
    where
        T: DeserializeOwned,
    {
        if !envelope.success {
            let error = envelope.error.unwrap_or_else(|| "unknown error".to_owned());
            // The bridge tags missing tabs so callers can distinguish a dead
            // tab from a failed operation.
            if error.contains("tab not found") {
                if let Some(tab) = tab {
                    return Err(BrokerError::UnknownTab(tab.clone()));
                }
            }
            return Err(BrokerError::Bridge(error));
        }
        // Unit-style replies carry no data; `null` decodes the optional and
        // value-typed results.
        let data = envelope.data.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(data)
            .map_err(|e| BrokerError::Bridge(format!("malformed bridge reply: {e}")))
    }

    async fn post<B, T>(
        &self,
        tab: Option<&TabId>,
        path: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<T, BrokerError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let mut request = self.client.post(self.endpoint(path)?).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout + TRANSPORT_SLACK);
        }
        let envelope = request
            .send()
            .await
            .map_err(BrokerError::transport)?
            .json::<Envelope>()
            .await
            .map_err(BrokerError::transport)?;
        Self::unwrap_envelope(tab, envelope)
    }

    async fn get<T>(&self, tab: Option<&TabId>, path: &str) -> Result<T, BrokerError>
    where
        T: DeserializeOwned,
    {
        let envelope = self
            .client
            .get(self.endpoint(path)?)
            .send()
            .await
            .map_err(BrokerError::transport)?
            .json::<Envelope>()
            .await
            .map_err(BrokerError::transport)?;
        Self::unwrap_envelope(tab, envelope)
    }
}

#[async_trait]
impl TabBroker for HttpTabBroker {
    #[tracing::instrument(name = "broker.create_tab", skip_all, fields(owner = %params.owner))]
    async fn create_tab(&self, params: CreateTabParams) -> Result<TabId, BrokerError> {
        let body = CreateTabBody {
            url: params.url.as_str(),
            owner: params.owner,
            headless: params.headless,
            cookie_file: params.cookie_file.as_ref().map(|p| p.as_str()),
        };
        let created: CreatedTab = self.post(None, "tabs", &body, None).await?;
        Ok(TabId::new(created.tab_id))
    }

    #[tracing::instrument(name = "broker.close_tab", skip_all, fields(tab = %tab))]
    async fn close_tab(&self, tab: &TabId) -> Result<(), BrokerError> {
        let envelope = self
            .client
            .delete(self.endpoint(&format!("tabs/{tab}"))?)
            .send()
            .await
            .map_err(BrokerError::transport)?
            .json::<Envelope>()
            .await
            .map_err(BrokerError::transport)?;
        Self::unwrap_envelope::<serde_json::Value>(Some(tab), envelope).map(|_| ())
    }

    async fn tab_exists(&self, tab: &TabId) -> bool {
        matches!(
            self.get::<serde_json::Value>(Some(tab), &format!("tabs/{tab}")).await,
            Ok(_)
        )
    }

    async fn lock(&self, tab: &TabId) -> Result<Option<TabLock>, BrokerError> {
        self.get(Some(tab), &format!("tabs/{tab}/lock")).await
    }

    async fn navigate(&self, tab: &TabId, url: &Url) -> Result<(), BrokerError> {
        let body = serde_json::json!({ "url": url.as_str() });
        self.post::<_, serde_json::Value>(Some(tab), &format!("tabs/{tab}/navigate"), &body, None)
            .await
            .map(|_| ())
    }

    async fn current_url(&self, tab: &TabId) -> Result<String, BrokerError> {
        self.get(Some(tab), &format!("tabs/{tab}/url")).await
    }

    #[tracing::instrument(name = "broker.execute_script", skip_all, fields(tab = %tab))]
    async fn execute_script(
        &self,
        tab: &TabId,
        script: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, BrokerError> {
        let body = ExecuteBody {
            script,
            timeout_ms: timeout.as_millis() as u64,
        };
        self.post(Some(tab), &format!("tabs/{tab}/execute"), &body, Some(timeout))
            .await
    }

    #[tracing::instrument(name = "broker.wait_for_url_change", skip_all, fields(tab = %tab))]
    async fn wait_for_url_change(
        &self,
        tab: &TabId,
        timeout: Duration,
    ) -> Result<UrlChange, BrokerError> {
        let body = WaitUrlChangeBody {
            timeout_ms: timeout.as_millis() as u64,
        };
        let reply: UrlChangeReply = self
            .post(
                Some(tab),
                &format!("tabs/{tab}/wait-url-change"),
                &body,
                Some(timeout),
            )
            .await?;
        Ok(match (reply.changed, reply.url) {
            (true, Some(url)) => UrlChange::Changed(url),
            _ => UrlChange::TimedOut,
        })
    }

    #[tracing::instrument(name = "broker.attach_file", skip_all, fields(tab = %tab, file = %file))]
    async fn attach_file(
        &self,
        tab: &TabId,
        selector: &str,
        file: &Utf8Path,
    ) -> Result<(), BrokerError> {
        let body = AttachFileBody {
            selector,
            file_path: file.as_str(),
        };
        // Streaming a large video through the bridge can take a while.
        self.post::<_, serde_json::Value>(
            Some(tab),
            &format!("tabs/{tab}/attach-file"),
            &body,
            Some(Duration::from_secs(600)),
        )
        .await
        .map(|_| ())
    }

    async fn export_cookies(&self, tab: &TabId, dest: &Utf8Path) -> Result<(), BrokerError> {
        let body = ExportCookiesBody {
            dest_path: dest.as_str(),
        };
        self.post::<_, serde_json::Value>(
            Some(tab),
            &format!("tabs/{tab}/export-cookies"),
            &body,
            None,
        )
        .await
        .map(|_| ())
    }
}
