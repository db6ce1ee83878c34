//! Database URL parsing, connection URL construction, and canonical host
//! resolution.

use serde_json::Value;
use url::Url;

use crate::error::{internal_error, invalid_argument, network_error, DatabaseResult};
use crate::realtime::protocol::PROTOCOL_VERSION;

/// The environment variable that redirects all traffic to an emulator.
pub const EMULATOR_HOST_ENV: &str = "FIREBASE_DATABASE_EMULATOR_HOST";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostInfo {
    pub secure: bool,
    pub host: String,
    pub namespace: String,
    pub is_emulator: bool,
}

impl HostInfo {
    /// Parses a database URL (`https://<ns>.firebaseio.com` or
    /// `wss://host?ns=<ns>`), honoring the emulator environment override.
    pub fn from_url(raw: &str) -> DatabaseResult<Self> {
        let url = Url::parse(raw)
            .map_err(|err| invalid_argument(format!("invalid database URL '{raw}': {err}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| invalid_argument(format!("database URL '{raw}' has no host")))?
            .to_owned();
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };
        let namespace = url
            .query_pairs()
            .find(|(key, _)| key == "ns")
            .map(|(_, value)| value.into_owned())
            .or_else(|| {
                let first = host.split('.').next()?;
                (first != host).then(|| first.to_owned())
            })
            .ok_or_else(|| {
                invalid_argument(format!(
                    "cannot determine database namespace from '{raw}'; pass ?ns=<namespace>"
                ))
            })?;

        if let Ok(emulator) = std::env::var(EMULATOR_HOST_ENV) {
            if !emulator.is_empty() {
                return Ok(Self {
                    secure: false,
                    host: emulator,
                    namespace,
                    is_emulator: true,
                });
            }
        }

        let secure = !matches!(url.scheme(), "http" | "ws");
        Ok(Self {
            secure,
            host,
            namespace,
            is_emulator: false,
        })
    }

    /// The `.ws` connection URL against `actual_host` (the configured host or
    /// a cached redirect).
    pub fn websocket_url(
        &self,
        actual_host: &str,
        last_session_id: Option<&str>,
    ) -> DatabaseResult<Url> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{scheme}://{actual_host}/.ws"))
            .map_err(|err| internal_error(format!("invalid websocket host: {err}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("ns", &self.namespace);
            query.append_pair("v", PROTOCOL_VERSION);
            if let Some(session) = last_session_id {
                query.append_pair("ls", session);
            }
        }
        Ok(url)
    }

    fn resolution_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}/.ws?ns={}", self.host, self.namespace)
    }
}

/// Asks the configured host for the canonical (possibly region-specific)
/// host to connect to. Responses are cached by the caller for the process
/// lifetime; emulators are never redirected.
pub async fn resolve_canonical_host(
    client: &reqwest::Client,
    info: &HostInfo,
) -> DatabaseResult<Option<String>> {
    if info.is_emulator {
        return Ok(None);
    }
    let response = client
        .get(info.resolution_url())
        .send()
        .await
        .map_err(|err| network_error(format!("host resolution failed: {err}")))?;
    if !response.status().is_success() {
        return Err(network_error(format!(
            "host resolution failed with status {}",
            response.status()
        )));
    }
    let body: Value = response
        .json()
        .await
        .map_err(|err| internal_error(format!("malformed host resolution response: {err}")))?;
    Ok(body
        .get("h")
        .and_then(Value::as_str)
        .filter(|canonical| !canonical.is_empty() && *canonical != info.host)
        .map(str::to_owned))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_namespace_from_subdomain() {
        let info = HostInfo::from_url("https://demo-project.firebaseio.com").unwrap();
        assert_eq!(info.namespace, "demo-project");
        assert_eq!(info.host, "demo-project.firebaseio.com");
        assert!(info.secure);
    }

    #[test]
    fn explicit_ns_parameter_wins() {
        let info = HostInfo::from_url("https://db.example.com?ns=other").unwrap();
        assert_eq!(info.namespace, "other");
    }

    #[test]
    fn rejects_urls_without_namespace() {
        let err = HostInfo::from_url("http://localhost:9000").unwrap_err();
        assert_eq!(err.code_str(), "database/invalid-argument");
    }

    #[test]
    fn websocket_url_carries_version_and_session() {
        let info = HostInfo::from_url("https://demo.firebaseio.com").unwrap();
        let url = info
            .websocket_url("demo.firebaseio.com", Some("session-1"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "wss://demo.firebaseio.com/.ws?ns=demo&v=5&ls=session-1"
        );
    }

    #[tokio::test]
    async fn host_resolution_follows_redirect_response() {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET)
                    .path("/.ws")
                    .query_param("ns", "demo");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"h":"s-usc1a-nss-123.firebaseio.com"}"#);
            })
            .await;

        let info = HostInfo {
            secure: false,
            host: server.address().to_string(),
            namespace: "demo".to_string(),
            is_emulator: false,
        };
        let client = reqwest::Client::new();
        let canonical = resolve_canonical_host(&client, &info).await.unwrap();
        assert_eq!(canonical.as_deref(), Some("s-usc1a-nss-123.firebaseio.com"));
        mock.assert_async().await;
    }
}
