use std::{sync::Arc, time::Duration};

use duet_core::{Envelope, NETWORK_ERROR_MESSAGE, SESSION_EXPIRED_MESSAGE};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::session::SessionStore;

/// Delay between the expiry notice and the redirect notice, so the view
/// layer has time to render the toast before navigating away.
pub const EXPIRY_REDIRECT_DELAY: Duration = Duration::from_millis(1_500);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Out-of-band events the view layer subscribes to for toast display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    SessionExpired,
    NetworkError { message: String },
    RedirectToLogin,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid base URL {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("http client init failed: {0}")]
    ClientInit(reqwest::Error),
}

/// Wraps every outbound call: attaches the bearer token, classifies the
/// result, and tears the session down on expiry.
///
/// The gateway is the propagation boundary for failures. Callers always get
/// an [`Envelope`] back, never an `Err`; transport problems and expired
/// sessions come back as synthetic failure envelopes after their side
/// effects have run.
#[derive(Debug)]
pub struct RequestGateway {
    http: Client,
    base_url: Url,
    session: Arc<SessionStore>,
    notice_tx: mpsc::UnboundedSender<Notice>,
}

impl RequestGateway {
    pub fn new(
        base_url: &str,
        session: Arc<SessionStore>,
        notice_tx: mpsc::UnboundedSender<Notice>,
    ) -> Result<Self, GatewayError> {
        let base_url = Url::parse(base_url).map_err(|err| GatewayError::InvalidBaseUrl {
            url: base_url.to_owned(),
            reason: err.to_string(),
        })?;
        let scheme = base_url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(GatewayError::InvalidBaseUrl {
                url: base_url.to_string(),
                reason: "scheme must be http or https".to_owned(),
            });
        }

        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(GatewayError::ClientInit)?;

        Ok(Self {
            http,
            base_url,
            session,
            notice_tx,
        })
    }

    #[must_use]
    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Envelope<T> {
        self.call(Method::GET, path, query, None, true).await
    }

    /// GET variant for polling ticks: transport failures are logged at debug
    /// and produce no notice, so transient poll errors never toast. Expiry
    /// side effects still run; expiry always wins.
    pub async fn get_silent<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Envelope<T> {
        self.call(Method::GET, path, query, None, false).await
    }

    pub async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Envelope<T> {
        self.call(Method::POST, path, &[], Some(body), true).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        surface: bool,
    ) -> Envelope<T> {
        let url = match self.base_url.join(path) {
            Ok(url) => url,
            Err(err) => {
                return self.network_failure(path, format!("invalid path: {err}"), surface);
            }
        };

        let mut request = self.http.request(method.clone(), url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        if let Some(token) = self.session.token() {
            request = request.bearer_auth(token);
        }

        debug!(%method, path, "dispatching request");

        // Transport errors are classified before any status inspection: a
        // failed send is always NetworkFailure, never SessionExpired.
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return self.network_failure(path, err.to_string(), surface),
        };

        if response.status() == StatusCode::UNAUTHORIZED {
            return self.session_expired(path);
        }

        match response.json::<Envelope<T>>().await {
            Ok(envelope) => envelope,
            Err(err) => {
                self.network_failure(path, format!("malformed response: {err}"), surface)
            }
        }
    }

    fn network_failure<T>(&self, path: &str, detail: String, surface: bool) -> Envelope<T> {
        if surface {
            warn!(path, "request failed: {detail}");
            let _ = self.notice_tx.send(Notice::NetworkError { message: detail });
        } else {
            debug!(path, "poll fetch failed: {detail}");
        }
        Envelope::failure(NETWORK_ERROR_MESSAGE)
    }

    fn session_expired<T>(&self, path: &str) -> Envelope<T> {
        warn!(path, "session expired (401), tearing down");
        if let Err(err) = self.session.clear() {
            warn!("failed to clear expired session: {err}");
        }
        let _ = self.notice_tx.send(Notice::SessionExpired);

        let notice_tx = self.notice_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(EXPIRY_REDIRECT_DELAY).await;
            let _ = notice_tx.send(Notice::RedirectToLogin);
        });

        Envelope::failure(SESSION_EXPIRED_MESSAGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStore;

    fn store() -> Arc<SessionStore> {
        let dir = tempfile::tempdir().expect("create tempdir");
        Arc::new(SessionStore::open(dir.path().join("session.json")))
    }

    #[test]
    fn rejects_non_http_base_url() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = RequestGateway::new("ws://127.0.0.1:1", store(), tx).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidBaseUrl { .. }));
    }

    #[test]
    fn rejects_unparseable_base_url() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = RequestGateway::new("not a url", store(), tx).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidBaseUrl { .. }));
    }

    #[test]
    fn accepts_http_and_https() {
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(RequestGateway::new("http://127.0.0.1:8080", store(), tx.clone()).is_ok());
        assert!(RequestGateway::new("https://duet.example.com", store(), tx).is_ok());
    }
}
