//! Typed hub state: the snapshot document and the service records it is
//! built from.
//!
//! Service shapes keep unknown fields in a flattened `extra` map so a
//! snapshot replays whatever the service returned, while the fields the
//! engine reasons about are typed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// One independently saved/replayed category of hub state.
///
/// Declaration order is the replay dependency order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Aspect {
    /// Control-plane resource (routing, identities, certificates, network rules)
    Arm,
    /// ADM configurations and edge deployments
    Configurations,
    /// Device and module identities and twins
    Devices,
}

impl Aspect {
    pub const ALL: [Aspect; 3] = [Aspect::Arm, Aspect::Configurations, Aspect::Devices];

    pub fn key(&self) -> &'static str {
        match self {
            Self::Arm => "arm",
            Self::Configurations => "configurations",
            Self::Devices => "devices",
        }
    }

    /// Aspects that need the management plane and so can't be used with a connection string
    pub fn requires_control_plane(&self) -> bool {
        matches!(self, Self::Arm)
    }
}

impl fmt::Display for Aspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

pub type AspectSet = BTreeSet<Aspect>;

/// Parse the requested aspects, defaulting to all of them
pub fn aspect_set(requested: &[Aspect]) -> AspectSet {
    if requested.is_empty() {
        Aspect::ALL.into_iter().collect()
    } else {
        requested.iter().copied().collect()
    }
}

/// Snapshot document of a hub
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arm: Option<ArmTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configurations: Option<ConfigurationSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<BTreeMap<String, DeviceRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificates: Option<Vec<CertificateDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identities: Option<BTreeSet<String>>,
}

impl HubState {
    pub fn has_aspect(&self, aspect: Aspect) -> bool {
        match aspect {
            Aspect::Arm => self.arm.is_some(),
            Aspect::Configurations => self.configurations.is_some(),
            Aspect::Devices => self.devices.is_some(),
        }
    }

    /// Requested aspects the document does not carry
    pub fn missing_aspects(&self, requested: &AspectSet) -> Vec<Aspect> {
        requested
            .iter()
            .copied()
            .filter(|aspect| !self.has_aspect(*aspect))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Devices, modules, twins
// ---------------------------------------------------------------------------

/// Prefix of the scope string an edge device is assigned
pub const DEVICE_SCOPE_PREFIX: &str = "ms-azure-iot-edge://";

/// Device id of the edge device owning a scope (`ms-azure-iot-edge://<id>-<generation>`)
pub fn scope_to_device_id(scope: &str) -> Option<String> {
    let rest = scope.strip_prefix(DEVICE_SCOPE_PREFIX)?;
    let (device_id, _generation) = rest.rsplit_once('-')?;
    (!device_id.is_empty()).then(|| device_id.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthKind {
    Sas,
    SelfSigned,
    CertificateAuthority,
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymmetricKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct X509Thumbprint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_thumbprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_thumbprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authentication {
    #[serde(rename = "type")]
    pub kind: AuthKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symmetric_key: Option<SymmetricKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x509_thumbprint: Option<X509Thumbprint>,
}

impl Authentication {
    pub fn none() -> Self {
        Self {
            kind: AuthKind::None,
            symmetric_key: None,
            x509_thumbprint: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default)]
    pub iot_edge: bool,
}

/// Device identity as returned by the registry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Authentication>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_scope: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// generationId, connection state, activity timestamps, message counts
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceIdentity {
    pub fn is_edge(&self) -> bool {
        self.capabilities.is_some_and(|c| c.iot_edge)
    }
}

/// Module identity as returned by the registry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleIdentity {
    pub device_id: String,
    pub module_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Authentication>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwinProperties {
    #[serde(default)]
    pub desired: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported: Option<Value>,
}

/// Device or module twin as returned by the registry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Twin {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_scope: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<TwinProperties>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Service-maintained keys inside a desired property document
const TWIN_METADATA_KEYS: [&str; 2] = ["$metadata", "$version"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredProperties {
    #[serde(default)]
    pub desired: Map<String, Value>,
}

/// Writable part of a twin: tags and desired properties.
///
/// Serializes as a twin patch body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwinRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Map<String, Value>>,
    #[serde(default)]
    pub properties: DesiredProperties,
}

impl TwinRecord {
    pub fn from_twin(twin: &Twin) -> Self {
        let mut desired = twin
            .properties
            .as_ref()
            .map(|p| p.desired.clone())
            .unwrap_or_default();
        for key in TWIN_METADATA_KEYS {
            desired.remove(key);
        }
        Self {
            tags: twin.tags.clone().filter(|t| !t.is_empty()),
            properties: DesiredProperties { desired },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_none() && self.properties.desired.is_empty()
    }
}

/// Stored device identity: mutable, replayable fields only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentityRecord {
    pub authentication: Authentication,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
}

impl DeviceIdentityRecord {
    pub fn from_identity(identity: &DeviceIdentity) -> Self {
        Self {
            authentication: identity
                .authentication
                .clone()
                .unwrap_or_else(Authentication::none),
            capabilities: identity.capabilities,
            status: identity.status.clone(),
            status_reason: identity.status_reason.clone(),
        }
    }

    /// Registry body that creates this device
    pub fn to_identity(&self, device_id: &str) -> DeviceIdentity {
        DeviceIdentity {
            device_id: device_id.to_string(),
            status: self.status.clone(),
            status_reason: self.status_reason.clone(),
            authentication: Some(self.authentication.clone()),
            capabilities: self.capabilities,
            ..DeviceIdentity::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleIdentityRecord {
    pub authentication: Authentication,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_by: Option<String>,
}

impl ModuleIdentityRecord {
    pub fn from_identity(identity: &ModuleIdentity) -> Self {
        Self {
            authentication: identity
                .authentication
                .clone()
                .unwrap_or_else(Authentication::none),
            managed_by: identity.managed_by.clone(),
        }
    }

    pub fn to_identity(&self, device_id: &str, module_id: &str) -> ModuleIdentity {
        ModuleIdentity {
            device_id: device_id.to_string(),
            module_id: module_id.to_string(),
            managed_by: self.managed_by.clone(),
            authentication: Some(self.authentication.clone()),
            ..ModuleIdentity::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRecord {
    pub identity: ModuleIdentityRecord,
    #[serde(default)]
    pub twin: TwinRecord,
}

impl ModuleRecord {
    /// System modules and modules without their own credentials can only be
    /// configured through the edge device's modules content.
    pub fn is_edge_managed(&self, module_id: &str) -> bool {
        module_id.starts_with('$') || self.identity.authentication.kind == AuthKind::None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub identity: DeviceIdentityRecord,
    #[serde(default)]
    pub twin: TwinRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub modules: BTreeMap<String, ModuleRecord>,
}

// ---------------------------------------------------------------------------
// Configurations
// ---------------------------------------------------------------------------

/// Server-generated configuration fields dropped from snapshots
pub const CONFIGURATION_VOLATILE_FIELDS: [&str; 5] = [
    "etag",
    "createdTimeUtc",
    "lastUpdatedTimeUtc",
    "schemaVersion",
    "systemMetrics",
];

/// Schema version sent when creating configurations
pub const CONFIGURATION_SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_content: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_content: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modules_content: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queries: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub content: ConfigurationContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ConfigurationMetrics>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Configuration {
    /// Edge deployments target modules through `modulesContent`
    pub fn is_edge_deployment(&self) -> bool {
        self.content
            .modules_content
            .as_ref()
            .is_some_and(|content| !content.is_empty())
    }

    /// Layered deployments patch `$edgeAgent` paths instead of defining the full document
    pub fn is_layered(&self) -> bool {
        let Some(modules) = self.content.modules_content.as_ref() else {
            return false;
        };
        !modules
            .get("$edgeAgent")
            .and_then(Value::as_object)
            .is_some_and(|agent| agent.contains_key("properties.desired"))
    }

    pub fn strip_volatile(&mut self) {
        for field in CONFIGURATION_VOLATILE_FIELDS {
            self.extra.remove(field);
        }
        if let Some(metrics) = self.metrics.as_mut() {
            metrics.results = None;
        }
    }

    /// Body for creating this configuration on a hub
    pub fn to_create_body(&self) -> Self {
        let mut body = self.clone();
        body.strip_volatile();
        body.extra.insert(
            "schemaVersion".to_string(),
            Value::String(CONFIGURATION_SCHEMA_VERSION.to_string()),
        );
        body
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSet {
    #[serde(rename = "admConfigurations", default)]
    pub adm: BTreeMap<String, Configuration>,
    #[serde(rename = "edgeDeployments", default)]
    pub edge: BTreeMap<String, Configuration>,
}

impl ConfigurationSet {
    /// Partition configurations by content shape
    pub fn from_configurations(configurations: Vec<Configuration>) -> Self {
        let mut set = Self::default();
        for mut configuration in configurations {
            configuration.strip_volatile();
            let bucket = if configuration.is_edge_deployment() {
                &mut set.edge
            } else {
                &mut set.adm
            };
            bucket.insert(configuration.id.clone(), configuration);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.adm.len() + self.edge.len()
    }
}

// ---------------------------------------------------------------------------
// Certificates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(default)]
    pub is_verified: bool,
}

// ---------------------------------------------------------------------------
// ARM template and routing
// ---------------------------------------------------------------------------

pub const HUB_RESOURCE_TYPE: &str = "Microsoft.Devices/IotHubs";
pub const CERTIFICATE_RESOURCE_TYPE: &str = "Microsoft.Devices/IotHubs/certificates";

/// Name of the built-in event hub endpoint routes may target
pub const BUILT_IN_ENDPOINT: &str = "events";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmTemplate {
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_version: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub resources: Vec<ArmResource>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ArmTemplate {
    pub fn hub_resource(&self) -> Option<&ArmResource> {
        self.resources.iter().find(|r| r.is_type(HUB_RESOURCE_TYPE))
    }

    pub fn hub_resource_mut(&mut self) -> Option<&mut ArmResource> {
        self.resources.iter_mut().find(|r| r.is_type(HUB_RESOURCE_TYPE))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<ResourceIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ArmResource {
    pub fn is_type(&self, resource_type: &str) -> bool {
        self.resource_type.eq_ignore_ascii_case(resource_type)
    }

    /// Typed view of a hub resource's properties
    pub fn hub_properties(&self) -> Result<HubProperties, serde_json::Error> {
        match &self.properties {
            Some(value) => serde_json::from_value(value.clone()),
            None => Ok(HubProperties::default()),
        }
    }

    pub fn set_hub_properties(&mut self, properties: &HubProperties) -> Result<(), serde_json::Error> {
        self.properties = Some(serde_json::to_value(properties)?);
        Ok(())
    }
}

/// `identity` block of a resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIdentity {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_assigned_identities: Option<BTreeMap<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResourceIdentity {
    pub fn has_system_assigned(&self) -> bool {
        self.kind.to_ascii_lowercase().contains("systemassigned")
    }

    pub fn user_assigned_ids(&self) -> Vec<String> {
        self.user_assigned_identities
            .as_ref()
            .map(|ids| ids.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Recompute `type` after the user-assigned set changed
    pub fn refresh_kind(&mut self) {
        let has_user = self
            .user_assigned_identities
            .as_ref()
            .is_some_and(|ids| !ids.is_empty());
        if !has_user {
            self.user_assigned_identities = None;
        }
        self.kind = match (self.has_system_assigned(), has_user) {
            (true, true) => "SystemAssigned, UserAssigned",
            (true, false) => "SystemAssigned",
            (false, true) => "UserAssigned",
            (false, false) => "None",
        }
        .to_string();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<Routing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_endpoints: Option<BTreeMap<String, StorageEndpoint>>,
    /// Network rules, cloud-to-device settings, event hub endpoints and the
    /// rest are carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    #[serde(default)]
    pub endpoints: RoutingEndpoints,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enrichments: Vec<Enrichment>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    EventHub,
    ServiceBusQueue,
    ServiceBusTopic,
    StorageContainer,
    CosmosDbCollection,
}

impl EndpointKind {
    pub const ALL: [EndpointKind; 5] = [
        EndpointKind::EventHub,
        EndpointKind::ServiceBusQueue,
        EndpointKind::ServiceBusTopic,
        EndpointKind::StorageContainer,
        EndpointKind::CosmosDbCollection,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::EventHub => "Event Hub",
            Self::ServiceBusQueue => "Service Bus queue",
            Self::ServiceBusTopic => "Service Bus topic",
            Self::StorageContainer => "Storage container",
            Self::CosmosDbCollection => "Cosmos DB collection",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingEndpoints {
    #[serde(default)]
    pub service_bus_queues: Vec<Endpoint>,
    #[serde(default)]
    pub service_bus_topics: Vec<Endpoint>,
    #[serde(default)]
    pub event_hubs: Vec<Endpoint>,
    #[serde(default)]
    pub storage_containers: Vec<Endpoint>,
    #[serde(
        rename = "cosmosDBSqlContainers",
        alias = "cosmosDBSqlCollections",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub cosmos_db_sql_containers: Vec<Endpoint>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RoutingEndpoints {
    pub fn of_kind(&self, kind: EndpointKind) -> &Vec<Endpoint> {
        match kind {
            EndpointKind::EventHub => &self.event_hubs,
            EndpointKind::ServiceBusQueue => &self.service_bus_queues,
            EndpointKind::ServiceBusTopic => &self.service_bus_topics,
            EndpointKind::StorageContainer => &self.storage_containers,
            EndpointKind::CosmosDbCollection => &self.cosmos_db_sql_containers,
        }
    }

    pub fn of_kind_mut(&mut self, kind: EndpointKind) -> &mut Vec<Endpoint> {
        match kind {
            EndpointKind::EventHub => &mut self.event_hubs,
            EndpointKind::ServiceBusQueue => &mut self.service_bus_queues,
            EndpointKind::ServiceBusTopic => &mut self.service_bus_topics,
            EndpointKind::StorageContainer => &mut self.storage_containers,
            EndpointKind::CosmosDbCollection => &mut self.cosmos_db_sql_containers,
        }
    }

    /// Names of every endpoint across all categories
    pub fn names(&self) -> BTreeSet<String> {
        EndpointKind::ALL
            .iter()
            .flat_map(|kind| self.of_kind(*kind).iter().map(|e| e.name.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        EndpointKind::ALL
            .iter()
            .map(|kind| self.of_kind(*kind).len())
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthenticationType {
    KeyBased,
    IdentityBased,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_assigned_identity: Option<String>,
}

/// How an endpoint authenticates to its resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointAuth<'a> {
    KeyBased,
    /// `None` is the hub's system-assigned identity
    IdentityBased(Option<&'a str>),
}

/// A custom routing endpoint; kind-specific settings (container, encoding,
/// batching, database, partition key) stay in `extra`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_type: Option<AuthenticationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<ManagedIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_key: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Endpoint {
    pub fn auth(&self) -> EndpointAuth<'_> {
        match self.authentication_type {
            Some(AuthenticationType::IdentityBased) => EndpointAuth::IdentityBased(
                self.identity
                    .as_ref()
                    .and_then(|i| i.user_assigned_identity.as_deref()),
            ),
            _ => EndpointAuth::KeyBased,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub name: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub endpoint_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub is_enabled: bool,
}

impl Route {
    /// Routes carry exactly one target endpoint
    pub fn target(&self) -> Option<&str> {
        self.endpoint_names.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrichment {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub endpoint_names: Vec<String>,
}

/// File-upload storage endpoint (`storageEndpoints.$default`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEndpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_type: Option<AuthenticationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<ManagedIdentity>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
