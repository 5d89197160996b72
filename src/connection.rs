//! Authenticated HTTP connection to the EMS API.

use crate::config::Config;
use crate::types::{EmsError, Result};

use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// User agent sent with every request.
const USER_AGENT: &str = concat!("ems-api-sdk Rust v", env!("CARGO_PKG_VERSION"));

/// Connection to the EMS API.
pub struct Connection {
    client: Client,
    config: Config,
    uri_root: String,
    token: Option<TokenInfo>,
}

#[derive(Debug, Clone)]
struct TokenInfo {
    access_token: String,
    token_type: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

impl TokenInfo {
    /// Usable for at least another minute.
    fn is_fresh(&self) -> bool {
        self.expires_at > chrono::Utc::now() + chrono::Duration::minutes(1)
    }

    fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

/// OAuth token response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

fn default_expires_in() -> u64 {
    3600
}

/// An EMS system the user has access to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmsSystem {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl Connection {
    /// Create a connection, loading config from the default location.
    pub async fn new() -> Result<Self> {
        let config = Config::load()?;
        Self::with_config(config).await
    }

    /// Create a connection with the given config. No request is sent until
    /// the first call that needs a token.
    pub async fn with_config(config: Config) -> Result<Self> {
        let uri_root = config.uri_root()?;
        Url::parse(&uri_root)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .user_agent(USER_AGENT)
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            config,
            uri_root,
            token: None,
        })
    }

    /// API root URL, e.g. `https://ems.efoqa.com/api`.
    pub fn uri_root(&self) -> &str {
        &self.uri_root
    }

    /// Authenticate now instead of on the first request.
    pub async fn connect(&mut self) -> Result<()> {
        self.token = None;
        self.get_token().await.map(|_| ())
    }

    /// Get or refresh the authentication token.
    async fn get_token(&mut self) -> Result<TokenInfo> {
        if let Some(token) = &self.token {
            if token.is_fresh() {
                return Ok(token.clone());
            }
        }

        let username = self.config.require_username()?;
        let password = self.config.require_password()?;
        let auth_url = self.url(&["token"], &[])?;

        let mut last_error = None;
        for attempt in 1..=self.config.max_trials() {
            if attempt > 1 {
                warn!("Reconnecting to the EMS API (attempt {})", attempt);
                tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
            }

            let result = self
                .client
                .post(auth_url.clone())
                .form(&[
                    ("grant_type", "password"),
                    ("username", username),
                    ("password", password),
                ])
                .send()
                .await;

            match result {
                Ok(response) => {
                    if response.status() == StatusCode::UNAUTHORIZED
                        || response.status() == StatusCode::BAD_REQUEST
                    {
                        return Err(EmsError::Auth(
                            "Authentication failed. Check your username and password.".into(),
                        ));
                    }

                    response.error_for_status_ref()?;

                    let token_response: TokenResponse = response.json().await?;
                    let token = TokenInfo {
                        access_token: token_response.access_token,
                        token_type: token_response.token_type,
                        expires_at: chrono::Utc::now()
                            + chrono::Duration::seconds(token_response.expires_in as i64),
                    };
                    self.token = Some(token.clone());
                    return Ok(token);
                }
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            Some(e) => Err(e.into()),
            None => Err(EmsError::Auth("No authentication attempt was made".into())),
        }
    }

    /// Build a request URL from path segments and query pairs. Segments are
    /// percent-encoded, so an id containing slashes stays a single segment.
    pub fn url(&self, path: &[&str], query: &[(&str, String)]) -> Result<Url> {
        let mut url = Url::parse(&self.uri_root)?;
        url.path_segments_mut()
            .map_err(|_| EmsError::Config(format!("Invalid API root: {}", self.uri_root)))?
            .pop_if_empty()
            .extend(path);
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }

    /// Send a request and decode the JSON response.
    ///
    /// A 401 drops the cached token and retries once with a fresh one.
    pub async fn request(
        &mut self,
        method: Method,
        path: &[&str],
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<(HeaderMap, Value)> {
        let url = self.url(path, query)?;

        let mut reauthenticated = false;
        loop {
            let token = self.get_token().await?;
            debug!("{} {}", method, url);

            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .header("Authorization", token.authorization());
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !reauthenticated {
                warn!("Token rejected, authenticating again");
                self.token = None;
                reauthenticated = true;
                continue;
            }

            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(EmsError::Api(format!("{} {}: {}", status, url, message)));
            }

            let headers = response.headers().clone();
            let content: Value = response.json().await?;
            return Ok((headers, content));
        }
    }

    /// List the EMS systems available to this account.
    pub async fn ems_systems(&mut self) -> Result<Vec<EmsSystem>> {
        let (_, content) = self
            .request(Method::GET, &["v2", "ems-systems"], &[], None)
            .await?;
        Ok(serde_json::from_value(content)?)
    }

    /// Resolve an EMS system name to its id. A numeric name is taken as the
    /// id itself. Without a name the account must see exactly one system.
    pub async fn ems_id(&mut self, name: Option<&str>) -> Result<u32> {
        if let Some(id) = name.and_then(|n| n.trim().parse::<u32>().ok()) {
            return Ok(id);
        }
        let systems = self.ems_systems().await?;
        find_ems_system(&systems, name)
    }
}

/// Pick an EMS system by case-insensitive name prefix. An exact name wins
/// over other prefix matches.
pub fn find_ems_system(systems: &[EmsSystem], name: Option<&str>) -> Result<u32> {
    let names = |list: &[&EmsSystem]| {
        list.iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let all: Vec<&EmsSystem> = systems.iter().collect();
    let matches: Vec<&EmsSystem> = match name {
        Some(name) => {
            let name = name.trim().to_lowercase();
            all.iter()
                .copied()
                .filter(|s| s.name.to_lowercase().starts_with(&name))
                .collect()
        }
        None => all.clone(),
    };

    match matches.as_slice() {
        [system] => Ok(system.id),
        [] => Err(EmsError::InvalidParam(format!(
            "No matching EMS system. You have access to: {}",
            names(all.as_slice())
        ))),
        several => name
            .and_then(|name| several.iter().find(|s| s.name.eq_ignore_ascii_case(name.trim())))
            .map(|s| s.id)
            .ok_or_else(|| {
                EmsError::InvalidParam(format!(
                    "Several EMS systems match, choose one of: {}",
                    names(several)
                ))
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(server_url: &str) -> Connection {
        let config = Config {
            server_url: Some(server_url.into()),
            ..Default::default()
        };
        tokio_test::block_on(Connection::with_config(config)).unwrap()
    }

    #[test]
    fn test_token_freshness() {
        let token = TokenInfo {
            access_token: "abc".to_string(),
            token_type: "bearer".to_string(),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        };
        assert!(token.is_fresh());
        assert_eq!(token.authorization(), "bearer abc");

        let stale = TokenInfo {
            expires_at: chrono::Utc::now() + chrono::Duration::seconds(30),
            ..token
        };
        assert!(!stale.is_fresh());
    }

    #[test]
    fn test_uri_root_from_config() {
        let conn = connection("https://ems.example.com");
        assert_eq!(conn.uri_root(), "https://ems.example.com/api");
    }

    #[test]
    fn test_url_encodes_segments() {
        let conn = connection("https://ems.example.com/api");
        let url = conn
            .url(
                &["v2", "ems-systems", "3", "databases", "[ems-core][entity-type][foqa-flights]", "query"],
                &[],
            )
            .unwrap();
        assert_eq!(
            url.path(),
            "/api/v2/ems-systems/3/databases/[ems-core][entity-type][foqa-flights]/query"
        );

        let url = conn.url(&["v2", "flight data/raw"], &[]).unwrap();
        assert_eq!(url.path(), "/api/v2/flight%20data%2Fraw");
    }

    #[test]
    fn test_url_query_pairs() {
        let conn = connection("https://ems.example.com/api");
        let url = conn
            .url(&["v2", "ems-systems", "3", "database-groups"], &[("groupId", "[-hub-][x]".to_string())])
            .unwrap();
        assert!(url.as_str().ends_with("database-groups?groupId=%5B-hub-%5D%5Bx%5D"));
    }

    #[test]
    fn test_invalid_server_url() {
        let config = Config {
            server_url: Some("not a url".into()),
            ..Default::default()
        };
        assert!(tokio_test::block_on(Connection::with_config(config)).is_err());
    }

    fn systems() -> Vec<EmsSystem> {
        serde_json::from_str(
            r#"[
                {"id": 1, "name": "ACME", "description": "Production"},
                {"id": 2, "name": "ACME-TEST"},
                {"id": 5, "name": "Contoso"}
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn test_find_ems_system_by_name() {
        let systems = systems();
        assert_eq!(find_ems_system(&systems, Some("contoso")).unwrap(), 5);
        assert_eq!(find_ems_system(&systems, Some("acme-t")).unwrap(), 2);
        // The exact name beats the longer prefix match.
        assert_eq!(find_ems_system(&systems, Some("acme")).unwrap(), 1);

        let err = find_ems_system(&systems, Some("Fabrikam")).unwrap_err();
        assert!(matches!(err, EmsError::InvalidParam(msg) if msg.contains("Contoso")));
    }

    #[test]
    fn test_find_ems_system_without_name() {
        let systems = systems();
        assert!(matches!(
            find_ems_system(&systems, None),
            Err(EmsError::InvalidParam(_))
        ));
        assert_eq!(find_ems_system(&systems[2..], None).unwrap(), 5);
    }

    #[test]
    fn test_numeric_ems_name_skips_lookup() {
        let mut conn = connection("https://ems.example.com/api");
        // No credentials are configured, so any request would fail.
        assert_eq!(tokio_test::block_on(conn.ems_id(Some("7"))).unwrap(), 7);
    }

    #[test]
    fn test_token_response_defaults() {
        let token: TokenResponse = serde_json::from_str(r#"{"access_token": "t"}"#).unwrap();
        assert_eq!(token.token_type, "bearer");
        assert_eq!(token.expires_in, 3600);
    }
}
