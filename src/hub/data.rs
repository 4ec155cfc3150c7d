//! Hub data plane: registry, twins and configurations over the service REST
//! API, authenticated with shared access signatures.

use super::error::{HubError, HubResult};
use super::target::Target;
use crate::state::model::{Configuration, DeviceIdentity, ModuleIdentity, Twin, TwinRecord};
use crate::traits::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use sha2::Sha256;
use std::sync::Arc;

const CONTINUATION_HEADER: &str = "x-ms-continuation";
const DEVICE_QUERY: &str = "SELECT * FROM devices";

/// Registry, twin and configuration operations against one hub
pub trait DataPlane: Send + Sync {
    /// Every device twin, following continuation tokens
    fn query_twins(&self) -> HubResult<Vec<Twin>>;

    fn get_device(&self, device_id: &str) -> HubResult<DeviceIdentity>;
    fn create_device(&self, device: &DeviceIdentity) -> HubResult<DeviceIdentity>;
    fn update_device(&self, device: &DeviceIdentity) -> HubResult<DeviceIdentity>;
    fn delete_device(&self, device_id: &str) -> HubResult<()>;
    fn update_twin(&self, device_id: &str, patch: &TwinRecord) -> HubResult<()>;

    fn list_modules(&self, device_id: &str) -> HubResult<Vec<ModuleIdentity>>;
    fn get_module_twin(&self, device_id: &str, module_id: &str) -> HubResult<Twin>;
    fn create_module(&self, module: &ModuleIdentity) -> HubResult<ModuleIdentity>;
    fn update_module_twin(&self, device_id: &str, module_id: &str, patch: &TwinRecord)
    -> HubResult<()>;

    /// Set the full modules content of an edge device
    fn apply_modules_content(
        &self,
        device_id: &str,
        modules_content: &Map<String, Value>,
    ) -> HubResult<()>;

    fn list_configurations(&self, top: usize) -> HubResult<Vec<Configuration>>;
    fn create_configuration(&self, configuration: &Configuration) -> HubResult<()>;
    fn delete_configuration(&self, configuration_id: &str) -> HubResult<()>;
}

/// Opens a data-plane session for a resolved target
pub trait DataPlaneFactory: Send + Sync {
    fn connect(&self, target: &Target) -> Arc<dyn DataPlane>;
}

/// Build a `SharedAccessSignature` authorization value for `host`
pub fn generate_sas_token(
    host: &str,
    key_name: &str,
    key: &str,
    expiry_unix: i64,
) -> HubResult<String> {
    let resource = encode(host);
    let to_sign = format!("{}\n{}", resource, expiry_unix);
    let key_bytes = STANDARD
        .decode(key)
        .map_err(|e| HubError::Auth(format!("shared access key is not valid base64: {}", e)))?;
    let mut mac = Hmac::<Sha256>::new_from_slice(&key_bytes)
        .map_err(|e| HubError::Auth(format!("invalid shared access key: {}", e)))?;
    mac.update(to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!(
        "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
        resource,
        encode(&signature),
        expiry_unix,
        key_name
    ))
}

fn encode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

/// `DataPlane` over the hub's REST API
pub struct RestDataPlane {
    http: Arc<dyn HttpClient>,
    target: Target,
    api_version: String,
    sas_ttl_secs: i64,
}

impl RestDataPlane {
    pub fn new(
        http: Arc<dyn HttpClient>,
        target: Target,
        api_version: impl Into<String>,
        sas_ttl_secs: i64,
    ) -> Self {
        Self {
            http,
            target,
            api_version: api_version.into(),
            sas_ttl_secs,
        }
    }

    fn url(&self, segments: &[&str], query: &[(&str, String)]) -> HubResult<String> {
        let mut url = url::Url::parse(&format!("https://{}", self.target.host))
            .map_err(|e| HubError::parse(format!("hub host '{}'", self.target.host), e))?;
        url.path_segments_mut()
            .map_err(|_| HubError::parse("hub host", "cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("api-version", &self.api_version);
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url.into())
    }

    fn authorization(&self) -> HubResult<String> {
        let expiry = chrono::Utc::now().timestamp() + self.sas_ttl_secs;
        generate_sas_token(
            &self.target.host,
            &self.target.policy_name,
            &self.target.primary_key,
            expiry,
        )
    }

    fn send(&self, request: HttpRequest) -> HubResult<HttpResponse> {
        tracing::debug!(method = request.method.as_str(), url = %request.url, "hub request");
        let request = request.header("Authorization", self.authorization()?);
        let response = self.http.send(request)?;
        if response.is_success() {
            return Ok(response);
        }

        let message = error_message(&response.body);
        if response.status == 404 {
            return Err(HubError::ResourceNotFound(message));
        }
        Err(HubError::Api {
            status: response.status,
            message,
        })
    }

    fn request<B: Serialize + ?Sized>(
        &self,
        method: HttpMethod,
        segments: &[&str],
        body: Option<&B>,
        if_match: bool,
    ) -> HubResult<HttpResponse> {
        let mut request = HttpRequest::new(method, self.url(segments, &[])?);
        if let Some(body) = body {
            let json = serde_json::to_string(body)
                .map_err(|e| HubError::parse("request body", e))?;
            request = request.json_body(json);
        }
        if if_match {
            request = request.header("If-Match", "\"*\"");
        }
        self.send(request)
    }

    fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> HubResult<T> {
        let response = self.request::<Value>(HttpMethod::Get, segments, None, false)?;
        decode(&segments.join("/"), &response)
    }
}

/// The service wraps errors as `{"Message": "..."}`; fall back to the raw body
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("Message")
                .or_else(|| v.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

fn decode<T: DeserializeOwned>(what: &str, response: &HttpResponse) -> HubResult<T> {
    serde_json::from_str(&response.body).map_err(|e| HubError::parse(what, e))
}

impl DataPlane for RestDataPlane {
    fn query_twins(&self) -> HubResult<Vec<Twin>> {
        let mut twins = Vec::new();
        let mut continuation: Option<String> = None;
        let body = json!({ "query": DEVICE_QUERY }).to_string();

        loop {
            let mut request = HttpRequest::new(HttpMethod::Post, self.url(&["devices", "query"], &[])?)
                .json_body(body.clone());
            if let Some(token) = &continuation {
                request = request.header(CONTINUATION_HEADER, token.clone());
            }
            let response = self.send(request)?;
            let page: Vec<Twin> = decode("device query", &response)?;
            twins.extend(page);

            continuation = response
                .header(CONTINUATION_HEADER)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            if continuation.is_none() {
                break;
            }
        }
        Ok(twins)
    }

    fn get_device(&self, device_id: &str) -> HubResult<DeviceIdentity> {
        self.get(&["devices", device_id])
    }

    fn create_device(&self, device: &DeviceIdentity) -> HubResult<DeviceIdentity> {
        let response =
            self.request(HttpMethod::Put, &["devices", device.device_id.as_str()], Some(device), false)?;
        decode("created device", &response)
    }

    fn update_device(&self, device: &DeviceIdentity) -> HubResult<DeviceIdentity> {
        let response =
            self.request(HttpMethod::Put, &["devices", device.device_id.as_str()], Some(device), true)?;
        decode("updated device", &response)
    }

    fn delete_device(&self, device_id: &str) -> HubResult<()> {
        self.request::<Value>(HttpMethod::Delete, &["devices", device_id], None, true)
            .map(|_| ())
    }

    fn update_twin(&self, device_id: &str, patch: &TwinRecord) -> HubResult<()> {
        self.request(HttpMethod::Patch, &["twins", device_id], Some(patch), true)
            .map(|_| ())
    }

    fn list_modules(&self, device_id: &str) -> HubResult<Vec<ModuleIdentity>> {
        self.get(&["devices", device_id, "modules"])
    }

    fn get_module_twin(&self, device_id: &str, module_id: &str) -> HubResult<Twin> {
        self.get(&["twins", device_id, "modules", module_id])
    }

    fn create_module(&self, module: &ModuleIdentity) -> HubResult<ModuleIdentity> {
        let response = self.request(
            HttpMethod::Put,
            &["devices", module.device_id.as_str(), "modules", module.module_id.as_str()],
            Some(module),
            false,
        )?;
        decode("created module", &response)
    }

    fn update_module_twin(
        &self,
        device_id: &str,
        module_id: &str,
        patch: &TwinRecord,
    ) -> HubResult<()> {
        self.request(
            HttpMethod::Patch,
            &["twins", device_id, "modules", module_id],
            Some(patch),
            true,
        )
        .map(|_| ())
    }

    fn apply_modules_content(
        &self,
        device_id: &str,
        modules_content: &Map<String, Value>,
    ) -> HubResult<()> {
        let body = json!({ "modulesContent": modules_content });
        self.request(
            HttpMethod::Post,
            &["devices", device_id, "applyConfigurationContent"],
            Some(&body),
            false,
        )
        .map(|_| ())
    }

    fn list_configurations(&self, top: usize) -> HubResult<Vec<Configuration>> {
        let url = self.url(&["configurations"], &[("top", top.to_string())])?;
        let response = self.send(HttpRequest::new(HttpMethod::Get, url))?;
        decode("configuration list", &response)
    }

    fn create_configuration(&self, configuration: &Configuration) -> HubResult<()> {
        self.request(
            HttpMethod::Put,
            &["configurations", configuration.id.as_str()],
            Some(configuration),
            false,
        )
        .map(|_| ())
    }

    fn delete_configuration(&self, configuration_id: &str) -> HubResult<()> {
        self.request::<Value>(
            HttpMethod::Delete,
            &["configurations", configuration_id],
            None,
            true,
        )
        .map(|_| ())
    }
}

/// Connects `RestDataPlane` sessions through a shared HTTP client
pub struct RestDataPlaneFactory {
    http: Arc<dyn HttpClient>,
    api_version: String,
    sas_ttl_secs: i64,
}

impl RestDataPlaneFactory {
    pub fn new(http: Arc<dyn HttpClient>, api_version: impl Into<String>, sas_ttl_secs: i64) -> Self {
        Self {
            http,
            api_version: api_version.into(),
            sas_ttl_secs,
        }
    }
}

impl DataPlaneFactory for RestDataPlaneFactory {
    fn connect(&self, target: &Target) -> Arc<dyn DataPlane> {
        Arc::new(RestDataPlane::new(
            self.http.clone(),
            target.clone(),
            self.api_version.clone(),
            self.sas_ttl_secs,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MockHttpClient;

    const KEY: &str = "c2VjcmV0LWtleS1mb3ItdGVzdHM=";

    fn target() -> Target {
        Target {
            host: "hub1.azure-devices.net".into(),
            policy_name: "iothubowner".into(),
            primary_key: KEY.into(),
            entity_name: "hub1".into(),
            ..Target::default()
        }
    }

    fn plane(http: Arc<MockHttpClient>) -> RestDataPlane {
        RestDataPlane::new(http, target(), "2021-04-12", 3600)
    }

    #[test]
    fn test_sas_token_shape() {
        let token = generate_sas_token("hub1.azure-devices.net", "iothubowner", KEY, 1_700_000_000).unwrap();

        assert!(token.starts_with("SharedAccessSignature sr=hub1.azure-devices.net&sig="));
        assert!(token.ends_with("&se=1700000000&skn=iothubowner"));
        // Deterministic for the same inputs
        assert_eq!(
            token,
            generate_sas_token("hub1.azure-devices.net", "iothubowner", KEY, 1_700_000_000).unwrap()
        );
    }

    #[test]
    fn test_sas_token_rejects_bad_key() {
        let err = generate_sas_token("hub1", "p", "not base64!", 1).unwrap_err();
        assert!(matches!(err, HubError::Auth(_)));
    }

    #[test]
    fn test_query_twins_follows_continuation() {
        let http = Arc::new(MockHttpClient::new());
        http.respond_with_headers(
            HttpMethod::Post,
            "/devices/query",
            200,
            r#"[{"deviceId":"d1"}]"#,
            vec![("x-ms-continuation", "token-2")],
        );
        http.respond(HttpMethod::Post, "/devices/query", 200, r#"[{"deviceId":"d2"}]"#);

        let twins = plane(http.clone()).query_twins().unwrap();

        assert_eq!(
            twins.iter().map(|t| t.device_id.as_str()).collect::<Vec<_>>(),
            vec!["d1", "d2"]
        );
        let requests = http.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].get_header("x-ms-continuation").is_none());
        assert_eq!(requests[1].get_header("x-ms-continuation"), Some("token-2"));
        assert!(requests[0]
            .get_header("Authorization")
            .unwrap()
            .starts_with("SharedAccessSignature "));
        assert!(requests[0].url.contains("api-version=2021-04-12"));
    }

    #[test]
    fn test_not_found_maps_to_resource_not_found() {
        let http = Arc::new(MockHttpClient::new());
        http.respond(
            HttpMethod::Delete,
            "/devices/gone",
            404,
            r#"{"Message":"ErrorCode:DeviceNotFound;gone"}"#,
        );

        let err = plane(http.clone()).delete_device("gone").unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(http.requests()[0].get_header("If-Match"), Some("\"*\""));
    }

    #[test]
    fn test_api_error_carries_status() {
        let http = Arc::new(MockHttpClient::new());
        http.respond(HttpMethod::Get, "/configurations", 400, r#"{"Message":"not supported on this tier"}"#);

        let err = plane(http.clone()).list_configurations(100).unwrap_err();

        assert!(matches!(err, HubError::Api { status: 400, ref message } if message == "not supported on this tier"));
        assert!(http.requests()[0].url.contains("top=100"));
    }

    #[test]
    fn test_module_twin_url_keeps_system_module_id() {
        let http = Arc::new(MockHttpClient::new());
        http.respond(
            HttpMethod::Get,
            "/twins/edge-1/modules/$edgeAgent",
            200,
            r#"{"deviceId":"edge-1","moduleId":"$edgeAgent"}"#,
        );

        let twin = plane(http).get_module_twin("edge-1", "$edgeAgent").unwrap();
        assert_eq!(twin.module_id.as_deref(), Some("$edgeAgent"));
    }

    #[test]
    fn test_apply_modules_content_body() {
        let http = Arc::new(MockHttpClient::new());
        http.respond(HttpMethod::Post, "/devices/edge-1/applyConfigurationContent", 204, "");
        let mut content = Map::new();
        content.insert("$edgeAgent".into(), json!({"properties.desired": {}}));

        plane(http.clone()).apply_modules_content("edge-1", &content).unwrap();

        let body: Value = serde_json::from_str(http.requests()[0].body.as_deref().unwrap()).unwrap();
        assert!(body["modulesContent"]["$edgeAgent"].is_object());
    }
}
