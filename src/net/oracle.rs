// Trust oracle: verifies an opaque session ticket with the external identity
// provider and answers whether the holder is on the moderator allowlist.
//
// Fail-closed on privilege: any transport, status or shape problem means
// "not a moderator".
use std::collections::HashSet;
use std::time::Duration;

use crate::config::{ORACLE_APP_ID, ORACLE_AUTH_URL};

pub struct TrustOracle {
    http: reqwest::Client,
    api_key: String,
    moderators: HashSet<String>,
}

impl TrustOracle {
    pub fn new(api_key: String, moderators: HashSet<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        TrustOracle {
            http,
            api_key,
            moderators,
        }
    }

    pub async fn is_moderator(&self, ticket: &str) -> bool {
        if ticket.is_empty() || self.api_key.is_empty() || self.moderators.is_empty() {
            return false;
        }

        let url = format!(
            "{ORACLE_AUTH_URL}?key={}&appid={ORACLE_APP_ID}&ticket={}",
            self.api_key, ticket
        );
        let Ok(response) = self.http.get(&url).send().await else {
            return false;
        };
        let Ok(body) = response.json::<serde_json::Value>().await else {
            return false;
        };

        let inner = &body["response"];
        if inner.get("error").is_some() {
            return false;
        }
        let id = match &inner["params"]["steamid"] {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => return false,
        };
        self.moderators.contains(&id)
    }
}
