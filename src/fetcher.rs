//! Policy snapshot fetching from the zone controller.

use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;

use crate::error::{Result, ZtpError};
use crate::types::{Subnet, Transitions};

/// Pulls policy snapshots from the controller. Implemented over HTTP in
/// production and by static fixtures in tests.
pub trait Fetcher {
    fn fetch_subnets(&self) -> impl std::future::Future<Output = Result<Vec<Subnet>>> + Send;
    fn fetch_transitions(&self) -> impl std::future::Future<Output = Result<Transitions>> + Send;
}

/// Controller client. The local ZTP identifier is sent as the request body
/// so the controller can answer with this site's view of the policy.
pub struct HttpFetcher {
    local_addr: String,
    controller_addr: String,
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(local_addr: String, controller_addr: String) -> Result<Self> {
        // The controller runs with a self-signed certificate inside the
        // management network; transport identity comes from the underlay.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ZtpError::Config(format!("controller client: {}", e)))?;
        Ok(HttpFetcher {
            local_addr,
            controller_addr,
            client,
        })
    }

    async fn post<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let url = format!("https://{}/api/{}", self.controller_addr, endpoint);
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "text/plain")
            .body(self.local_addr.clone())
            .send()
            .await
            .map_err(|e| ZtpError::Transport(std::io::Error::other(e)))?
            .error_for_status()
            .map_err(|e| ZtpError::Transport(std::io::Error::other(e)))?;
        response
            .json::<T>()
            .await
            .map_err(|e| ZtpError::Payload(format!("controller response: {}", e)))
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch_subnets(&self) -> Result<Vec<Subnet>> {
        self.post("get-subnets").await
    }

    async fn fetch_transitions(&self) -> Result<Transitions> {
        self.post("get-transitions").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ZoneId;

    #[test]
    fn transitions_decode_from_controller_json() {
        let zid = |id| ZoneId::new(id).unwrap();
        let json = r#"{"1": [2, 3], "2": [1]}"#;
        let transitions: Transitions = serde_json::from_str(json).unwrap();
        assert_eq!(transitions[&zid(1)], vec![zid(2), zid(3)]);
        assert_eq!(transitions[&zid(2)], vec![zid(1)]);
    }

    #[test]
    fn subnet_list_decodes_from_controller_json() {
        let json = r#"[
            {"CIDR":"10.0.1.0/24","ZoneID":1,"TPAddr":"1-ff00:0:110,10.0.0.1"},
            {"CIDR":"10.0.2.0/24","ZoneID":2,"TPAddr":"1-ff00:0:111,10.0.0.2"}
        ]"#;
        let subnets: Vec<Subnet> = serde_json::from_str(json).unwrap();
        assert_eq!(subnets.len(), 2);
        assert_eq!(subnets[1].zone_id.get(), 2);
    }
}
