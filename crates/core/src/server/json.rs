//! JSON update check protocol.
//!
//! Request (POST to the ticket's server URL):
//!
//! ```json
//! {"protocol": "1.0", "params": {...}, "products": [{"product_id": "...", "version": "..."}]}
//! ```
//!
//! Response: `{"updates": [UpdateInfo, ...]}`.

use serde::{Deserialize, Serialize};

use super::{ServerError, ServerFactory, UpdateServer};
use crate::fetch::{FetchRequest, FetchResponse};
use crate::keystone::KeystoneParams;
use crate::ticket::Ticket;
use crate::update::UpdateInfo;

pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Serialize)]
struct CheckRequest<'a> {
    protocol: &'static str,
    params: &'a KeystoneParams,
    products: Vec<ProductQuery<'a>>,
}

#[derive(Debug, Serialize)]
struct ProductQuery<'a> {
    product_id: &'a str,
    version: &'a str,
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    #[serde(default)]
    updates: Vec<UpdateInfo>,
}

/// Update server speaking the JSON protocol.
#[derive(Debug, Clone)]
pub struct JsonServer {
    url: String,
    params: KeystoneParams,
}

impl JsonServer {
    pub fn new(url: impl Into<String>, params: KeystoneParams) -> Self {
        Self {
            url: url.into(),
            params,
        }
    }
}

impl UpdateServer for JsonServer {
    fn url(&self) -> &str {
        &self.url
    }

    fn requests_for_tickets(&self, tickets: &[Ticket]) -> Result<Vec<FetchRequest>, ServerError> {
        if tickets.is_empty() {
            return Ok(Vec::new());
        }

        let body = CheckRequest {
            protocol: PROTOCOL_VERSION,
            params: &self.params,
            products: tickets
                .iter()
                .map(|t| ProductQuery {
                    product_id: t.product_id(),
                    version: t.version(),
                })
                .collect(),
        };
        let body = serde_json::to_vec(&body).map_err(|e| ServerError::Encode(e.to_string()))?;

        Ok(vec![FetchRequest::post(&self.url, body)
            .with_header("Content-Type", "application/json")
            .with_header("Accept", "application/json")])
    }

    fn update_infos_for_response(&self, response: &FetchResponse) -> Result<Vec<UpdateInfo>, ServerError> {
        if !response.is_success() {
            return Err(ServerError::Status {
                status: response.status,
            });
        }
        let decoded: CheckResponse = serde_json::from_slice(&response.body)
            .map_err(|e| ServerError::Malformed(e.to_string()))?;
        Ok(decoded.updates)
    }

    fn pretty_print_response(&self, response: &FetchResponse) -> String {
        match serde_json::from_slice::<serde_json::Value>(&response.body) {
            Ok(value) => serde_json::to_string_pretty(&value)
                .unwrap_or_else(|_| String::from_utf8_lossy(&response.body).into_owned()),
            Err(_) => String::from_utf8_lossy(&response.body).into_owned(),
        }
    }
}

/// Creates a [`JsonServer`] for every server URL.
#[derive(Debug, Clone, Default)]
pub struct JsonServerFactory;

impl ServerFactory for JsonServerFactory {
    fn create_server(&self, url: &str, params: &KeystoneParams) -> Box<dyn UpdateServer> {
        Box::new(JsonServer::new(url, params.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchMethod;
    use crate::ticket::ExistenceChecker;

    fn ticket(product_id: &str, version: &str) -> Ticket {
        Ticket::new(product_id, version, ExistenceChecker::Never, "https://u.example.com/check").unwrap()
    }

    fn response(status: u16, body: &str) -> FetchResponse {
        FetchResponse {
            url: "https://u.example.com/check".to_string(),
            status,
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_request_body() {
        let params = KeystoneParams {
            machine_id: Some("m-1".to_string()),
            ..Default::default()
        };
        let server = JsonServer::new("https://u.example.com/check", params);

        let requests = server
            .requests_for_tickets(&[ticket("a", "1.0"), ticket("b", "2.1")])
            .unwrap();

        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.method, FetchMethod::Post);
        assert_eq!(request.url, "https://u.example.com/check");

        let body: serde_json::Value = serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["protocol"], "1.0");
        assert_eq!(body["params"]["machine_id"], "m-1");
        assert_eq!(body["products"][1]["product_id"], "b");
        assert_eq!(body["products"][1]["version"], "2.1");
    }

    #[test]
    fn test_no_tickets_no_requests() {
        let server = JsonServer::new("https://u.example.com", KeystoneParams::default());
        assert!(server.requests_for_tickets(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_decode_updates() {
        let server = JsonServer::new("https://u.example.com", KeystoneParams::default());
        let body = r#"{"updates": [{"product_id": "a", "codebase_url": "https://dl.example.com/a.sh", "code_size": 12}]}"#;

        let updates = server.update_infos_for_response(&response(200, body)).unwrap();

        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].product_id, "a");
        assert_eq!(updates[0].code_size, 12);
    }

    #[test]
    fn test_decode_empty_response() {
        let server = JsonServer::new("https://u.example.com", KeystoneParams::default());
        assert!(server
            .update_infos_for_response(&response(200, "{}"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_error_status_rejected() {
        let server = JsonServer::new("https://u.example.com", KeystoneParams::default());
        let result = server.update_infos_for_response(&response(503, "{}"));
        assert!(matches!(result, Err(ServerError::Status { status: 503 })));
    }

    #[test]
    fn test_malformed_body_rejected() {
        let server = JsonServer::new("https://u.example.com", KeystoneParams::default());
        let result = server.update_infos_for_response(&response(200, "<html>"));
        assert!(matches!(result, Err(ServerError::Malformed(_))));
    }

    #[test]
    fn test_pretty_print() {
        let server = JsonServer::new("https://u.example.com", KeystoneParams::default());
        let pretty = server.pretty_print_response(&response(200, r#"{"updates":[]}"#));
        assert_eq!(pretty, "{\n  \"updates\": []\n}");
        assert_eq!(server.pretty_print_response(&response(200, "plain")), "plain");
    }
}
