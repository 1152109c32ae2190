//! OpenStack cloud provider.
//!
//! Talks to the public REST APIs directly:
//! - Keystone v3 password authentication (token + service catalog)
//! - Nova for keypairs, flavors and servers
//! - Neutron for floating IPs and instance ports
//! - Glance v2 for image records
//!
//! The Keystone token is shared with [`crate::store::SwiftStore`] and is
//! re-issued transparently shortly before it expires, so long batches keep
//! working past the token lifetime.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use super::CloudProvider;
use crate::error::{Result, ScanError};
use crate::types::{CloudImage, FloatingIp, Instance, InstanceSpec, InstanceState, Keypair};

/// Per-request timeout for API calls.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Re-authenticate when the token has less than this left.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

/// Glance list page size.
const IMAGE_PAGE_SIZE: &str = "100";

const JSON_PATCH_CONTENT_TYPE: &str = "application/openstack-images-v2.1-json-patch";

/// Keystone password credentials.
#[derive(Clone)]
pub struct OpenStackCredentials {
    /// Identity endpoint, with or without the `/v3` suffix.
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_name: String,
    pub user_domain: String,
    pub project_domain: String,
    /// Restrict catalog lookups to one region.
    pub region: Option<String>,
    /// Endpoint interface to use from the catalog (usually "public").
    pub interface: String,
}

impl std::fmt::Debug for OpenStackCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenStackCredentials")
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("project_name", &self.project_name)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

struct Token {
    value: String,
    expires_at: DateTime<Utc>,
}

impl Token {
    fn is_fresh(&self) -> bool {
        self.expires_at - Utc::now() > chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS)
    }
}

#[derive(Debug, Clone)]
struct Endpoints {
    compute: String,
    network: String,
    image: String,
    object_store: Option<String>,
}

/// OpenStack REST client.
pub struct OpenStackClient {
    http: Client,
    credentials: OpenStackCredentials,
    token: RwLock<Token>,
    endpoints: Endpoints,
}

impl OpenStackClient {
    /// Authenticate and resolve service endpoints from the catalog.
    #[instrument(
        skip(credentials),
        fields(auth_url = %credentials.auth_url, project = %credentials.project_name)
    )]
    pub async fn connect(credentials: OpenStackCredentials) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ScanError::cloud("client setup", e))?;

        let (token, catalog) = authenticate(&http, &credentials).await?;

        let lookup = |service_type: &str| {
            find_endpoint(
                &catalog,
                service_type,
                &credentials.interface,
                credentials.region.as_deref(),
            )
        };
        let missing = |service_type: &str| {
            ScanError::cloud("catalog", format!("no {} endpoint in service catalog", service_type))
        };

        let endpoints = Endpoints {
            compute: lookup("compute").ok_or_else(|| missing("compute"))?,
            network: with_version(&lookup("network").ok_or_else(|| missing("network"))?, "v2.0"),
            image: with_version(&lookup("image").ok_or_else(|| missing("image"))?, "v2"),
            object_store: lookup("object-store"),
        };

        info!(
            compute = %endpoints.compute,
            network = %endpoints.network,
            image = %endpoints.image,
            "Authenticated with OpenStack"
        );

        Ok(Self { http, credentials, token: RwLock::new(token), endpoints })
    }

    /// Object storage (Swift) endpoint, if the catalog has one.
    pub fn object_store_endpoint(&self) -> Option<&str> {
        self.endpoints.object_store.as_deref()
    }

    /// A valid token, re-authenticating if the current one is about to expire.
    async fn token(&self) -> Result<String> {
        {
            let token = self.token.read().await;
            if token.is_fresh() {
                return Ok(token.value.clone());
            }
        }

        let mut token = self.token.write().await;
        if !token.is_fresh() {
            debug!("Keystone token near expiry, re-authenticating");
            let (fresh, _) = authenticate(&self.http, &self.credentials).await?;
            *token = fresh;
        }
        Ok(token.value.clone())
    }

    /// Request builder carrying the auth token.
    pub(crate) async fn authorized(&self, method: Method, url: &str) -> Result<RequestBuilder> {
        let token = self.token().await?;
        Ok(self.http.request(method, url).header("X-Auth-Token", token))
    }

    /// Send a request and fail on non-success status codes.
    pub(crate) async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(|e| ScanError::cloud(operation, e))?;
        check_status(operation, response).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<T> {
        let response = self.send(operation, request).await?;
        response.json::<T>().await.map_err(|e| {
            ScanError::cloud(operation, format!("unexpected response body: {}", e))
        })
    }

    /// DELETE that treats "already gone" as success.
    async fn delete(&self, operation: &str, url: &str) -> Result<()> {
        let request = self.authorized(Method::DELETE, url).await?;
        let response = request.send().await.map_err(|e| ScanError::cloud(operation, e))?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(url = %url, "{}: resource already gone", operation);
            return Ok(());
        }
        check_status(operation, response).await.map(|_| ())
    }

    async fn resolve_flavor(&self, flavor: &str) -> Result<String> {
        let url = format!("{}/flavors", self.endpoints.compute);
        let request = self.authorized(Method::GET, &url).await?;
        let body: FlavorList = self.send_json("list flavors", request).await?;

        body.flavors
            .into_iter()
            .find(|f| f.id == flavor || f.name == flavor)
            .map(|f| f.id)
            .ok_or_else(|| {
                ScanError::cloud("resolve flavor", format!("no flavor named '{}'", flavor))
            })
    }

    async fn external_network_id(&self, name: &str) -> Result<String> {
        let url = format!("{}/networks", self.endpoints.network);
        let request = self.authorized(Method::GET, &url).await?.query(&[("name", name)]);
        let body: NetworkList = self.send_json("find network", request).await?;

        body.networks.into_iter().next().map(|n| n.id).ok_or_else(|| {
            ScanError::cloud("find network", format!("no network named '{}'", name))
        })
    }

    async fn instance_port(&self, instance_id: &str) -> Result<String> {
        let url = format!("{}/ports", self.endpoints.network);
        let request =
            self.authorized(Method::GET, &url).await?.query(&[("device_id", instance_id)]);
        let body: PortList = self.send_json("find instance port", request).await?;

        body.ports.into_iter().next().map(|p| p.id).ok_or_else(|| {
            ScanError::cloud("find instance port", format!("instance {} has no port", instance_id))
        })
    }

    /// Glance `next` links are relative to the endpoint root, not to `/v2`.
    fn image_next_url(&self, next: &str) -> String {
        let root = self.endpoints.image.trim_end_matches("/v2");
        format!("{}{}", root, next)
    }
}

#[async_trait]
impl CloudProvider for OpenStackClient {
    #[instrument(skip(self))]
    async fn create_keypair(&self, name: &str) -> Result<Keypair> {
        let url = format!("{}/os-keypairs", self.endpoints.compute);
        let request = self
            .authorized(Method::POST, &url)
            .await?
            .json(&json!({ "keypair": { "name": name } }));
        let body: KeypairEnvelope = self.send_json("create keypair", request).await?;

        let private_key = body.keypair.private_key.ok_or_else(|| {
            ScanError::cloud("create keypair", "provider did not return a private key")
        })?;

        Ok(Keypair { name: body.keypair.name, private_key })
    }

    #[instrument(skip(self))]
    async fn remove_keypair(&self, name: &str) -> Result<()> {
        let url = format!("{}/os-keypairs/{}", self.endpoints.compute, name);
        self.delete("delete keypair", &url).await
    }

    #[instrument(skip(self))]
    async fn create_floating_ip(&self, network_name: &str) -> Result<FloatingIp> {
        let network_id = self.external_network_id(network_name).await?;

        let url = format!("{}/floatingips", self.endpoints.network);
        let request = self
            .authorized(Method::POST, &url)
            .await?
            .json(&json!({ "floatingip": { "floating_network_id": network_id } }));
        let body: FloatingIpEnvelope = self.send_json("create floating ip", request).await?;

        Ok(FloatingIp { id: body.floatingip.id, address: body.floatingip.floating_ip_address })
    }

    #[instrument(skip(self))]
    async fn remove_floating_ip(&self, id: &str) -> Result<()> {
        let url = format!("{}/floatingips/{}", self.endpoints.network, id);
        self.delete("delete floating ip", &url).await
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image_id = %spec.image_id))]
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance> {
        let flavor_id = self.resolve_flavor(&spec.flavor).await?;
        let user_data = base64::engine::general_purpose::STANDARD.encode(&spec.boot_script);

        let url = format!("{}/servers", self.endpoints.compute);
        let request = self.authorized(Method::POST, &url).await?.json(&json!({
            "server": {
                "name": spec.name,
                "imageRef": spec.image_id,
                "flavorRef": flavor_id,
                "key_name": spec.keypair_name,
                "networks": [{ "uuid": spec.network_id }],
                "config_drive": spec.config_drive,
                "user_data": user_data,
            }
        }));
        let body: ServerEnvelope = self.send_json("create server", request).await?;

        Ok(Instance { id: body.server.id, name: spec.name.clone() })
    }

    async fn instance_state(&self, id: &str) -> Result<InstanceState> {
        let url = format!("{}/servers/{}", self.endpoints.compute, id);
        let request = self.authorized(Method::GET, &url).await?;
        let body: ServerEnvelope = self.send_json("get server", request).await?;

        Ok(InstanceState::from_status(body.server.status.as_deref().unwrap_or("UNKNOWN")))
    }

    #[instrument(skip(self, ip), fields(address = %ip.address))]
    async fn attach_floating_ip(&self, instance_id: &str, ip: &FloatingIp) -> Result<()> {
        let port_id = self.instance_port(instance_id).await?;

        let url = format!("{}/floatingips/{}", self.endpoints.network, ip.id);
        let request = self
            .authorized(Method::PUT, &url)
            .await?
            .json(&json!({ "floatingip": { "port_id": port_id } }));
        self.send("associate floating ip", request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_instance(&self, id: &str) -> Result<()> {
        let url = format!("{}/servers/{}", self.endpoints.compute, id);
        self.delete("delete server", &url).await
    }

    #[instrument(skip(self))]
    async fn fetch_image(&self, id: &str) -> Result<CloudImage> {
        let url = format!("{}/images/{}", self.endpoints.image, id);
        let request = self.authorized(Method::GET, &url).await?;
        let response = request.send().await.map_err(|e| ScanError::cloud("get image", e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ScanError::ImageNotFound { image_id: id.to_string() });
        }

        let body: Value = check_status("get image", response)
            .await?
            .json()
            .await
            .map_err(|e| ScanError::cloud("get image", e))?;
        image_from_json(&body)
    }

    #[instrument(skip(self))]
    async fn fetch_images_by_prefix(&self, prefix: &str) -> Result<Vec<CloudImage>> {
        let mut images = Vec::new();
        let mut next_url = Some(format!("{}/images", self.endpoints.image));
        let mut first_page = true;

        while let Some(url) = next_url.take() {
            let mut request = self.authorized(Method::GET, &url).await?;
            if first_page {
                request = request.query(&[
                    ("limit", IMAGE_PAGE_SIZE),
                    ("sort_key", "name"),
                    ("sort_dir", "asc"),
                ]);
                first_page = false;
            }

            let page: ImageList = self.send_json("list images", request).await?;
            for image in &page.images {
                let image = image_from_json(image)?;
                if image.name.starts_with(prefix) {
                    images.push(image);
                }
            }

            next_url = page.next.map(|next| self.image_next_url(&next));
        }

        images.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(prefix = %prefix, count = images.len(), "Listed images by prefix");
        Ok(images)
    }

    #[instrument(skip(self))]
    async fn tag_image(&self, id: &str, key: &str, value: &str) -> Result<()> {
        let url = format!("{}/images/{}", self.endpoints.image, id);
        let patch = json!([{ "op": "add", "path": format!("/{}", key), "value": value }]);
        let body = serde_json::to_vec(&patch).map_err(|e| ScanError::cloud("tag image", e))?;
        let request = self
            .authorized(Method::PATCH, &url)
            .await?
            .header(reqwest::header::CONTENT_TYPE, JSON_PATCH_CONTENT_TYPE)
            .body(body);
        self.send("tag image", request).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_image(&self, id: &str) -> Result<()> {
        let url = format!("{}/images/{}", self.endpoints.image, id);
        self.delete("delete image", &url).await
    }

    fn name(&self) -> &str {
        "openstack"
    }
}

async fn authenticate(
    http: &Client,
    credentials: &OpenStackCredentials,
) -> Result<(Token, Vec<CatalogEntry>)> {
    let url = format!("{}/auth/tokens", with_version(&credentials.auth_url, "v3"));
    let body = json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": credentials.username,
                        "domain": { "name": credentials.user_domain },
                        "password": credentials.password,
                    }
                }
            },
            "scope": {
                "project": {
                    "name": credentials.project_name,
                    "domain": { "name": credentials.project_domain },
                }
            }
        }
    });

    let response =
        http.post(&url).json(&body).send().await.map_err(|e| ScanError::cloud("authenticate", e))?;
    let response = check_status("authenticate", response).await?;

    let value = response
        .headers()
        .get("X-Subject-Token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| ScanError::cloud("authenticate", "response carried no X-Subject-Token"))?;

    let body: TokenEnvelope = response
        .json()
        .await
        .map_err(|e| ScanError::cloud("authenticate", format!("unexpected token body: {}", e)))?;

    Ok((Token { value, expires_at: body.token.expires_at }, body.token.catalog))
}

async fn check_status(operation: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ScanError::cloud(operation, format!("HTTP {}: {}", status, body.trim())))
}

fn find_endpoint(
    catalog: &[CatalogEntry],
    service_type: &str,
    interface: &str,
    region: Option<&str>,
) -> Option<String> {
    catalog
        .iter()
        .filter(|entry| entry.service_type == service_type)
        .flat_map(|entry| entry.endpoints.iter())
        .find(|endpoint| {
            endpoint.interface == interface
                && region.map_or(true, |r| {
                    endpoint.region_id.as_deref() == Some(r)
                        || endpoint.region.as_deref() == Some(r)
                })
        })
        .map(|endpoint| endpoint.url.trim_end_matches('/').to_string())
}

/// Append an API version segment unless the URL already ends with it.
fn with_version(url: &str, version: &str) -> String {
    let url = url.trim_end_matches('/');
    if url.ends_with(&format!("/{}", version)) {
        url.to_string()
    } else {
        format!("{}/{}", url, version)
    }
}

/// Glance returns custom properties as top-level fields next to the core ones.
fn image_from_json(value: &Value) -> Result<CloudImage> {
    let object = value
        .as_object()
        .ok_or_else(|| ScanError::cloud("parse image", "image record is not an object"))?;

    let text = |key: &str| object.get(key).and_then(Value::as_str).map(str::to_string);

    let id = text("id").ok_or_else(|| ScanError::cloud("parse image", "image has no id"))?;
    let created_at = text("created_at")
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc));

    let properties: HashMap<String, String> = object
        .iter()
        .filter(|(key, _)| !GLANCE_CORE_FIELDS.contains(&key.as_str()))
        .filter_map(|(key, value)| value.as_str().map(|v| (key.clone(), v.to_string())))
        .collect();

    Ok(CloudImage {
        id,
        name: text("name").unwrap_or_default(),
        status: text("status").unwrap_or_default(),
        created_at,
        properties,
    })
}

const GLANCE_CORE_FIELDS: &[&str] = &[
    "id",
    "name",
    "status",
    "created_at",
    "updated_at",
    "visibility",
    "protected",
    "checksum",
    "os_hash_algo",
    "os_hash_value",
    "owner",
    "size",
    "virtual_size",
    "min_ram",
    "min_disk",
    "disk_format",
    "container_format",
    "tags",
    "self",
    "file",
    "schema",
    "locations",
    "direct_url",
];

// OpenStack API response structures

#[derive(Debug, Deserialize)]
struct TokenEnvelope {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    expires_at: DateTime<Utc>,
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct CatalogEndpoint {
    interface: String,
    region_id: Option<String>,
    region: Option<String>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct KeypairEnvelope {
    keypair: NovaKeypair,
}

#[derive(Debug, Deserialize)]
struct NovaKeypair {
    name: String,
    private_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FlavorList {
    flavors: Vec<NovaFlavor>,
}

#[derive(Debug, Deserialize)]
struct NovaFlavor {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ServerEnvelope {
    server: NovaServer,
}

#[derive(Debug, Deserialize)]
struct NovaServer {
    id: String,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NetworkList {
    networks: Vec<IdOnly>,
}

#[derive(Debug, Deserialize)]
struct PortList {
    ports: Vec<IdOnly>,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Debug, Deserialize)]
struct FloatingIpEnvelope {
    floatingip: NeutronFloatingIp,
}

#[derive(Debug, Deserialize)]
struct NeutronFloatingIp {
    id: String,
    floating_ip_address: String,
}

#[derive(Debug, Deserialize)]
struct ImageList {
    images: Vec<Value>,
    next: Option<String>,
}
