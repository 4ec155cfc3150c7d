//! In-memory stand-ins for the Azure services the state engine talks to.
//!
//! `FakeCloud` plays the management plane and sibling resources, `FakeHub`
//! plays one hub's data plane. Both append to a shared journal so tests can
//! assert on call order.

#![cfg(test)]

use crate::hub::control::{AccessPolicy, CertificateProperties, CertificateResource};
use crate::hub::resources::{ResolvedSecret, ResourceKind, ResourceLocator};
use crate::hub::{
    ControlPlane, DataPlane, DataPlaneFactory, HubError, HubResource, HubResult, HubSpec,
    ResourceCli, Services, Target, TargetResolver,
};
use crate::state::model::{
    ArmResource, ArmTemplate, AuthKind, Authentication, CERTIFICATE_RESOURCE_TYPE, Capabilities,
    Configuration, DEVICE_SCOPE_PREFIX, DesiredProperties, DeviceIdentity, DeviceIdentityRecord,
    DeviceRecord, HUB_RESOURCE_TYPE, ModuleIdentity, ModuleIdentityRecord, ModuleRecord,
    SymmetricKey, Twin, TwinProperties, TwinRecord,
};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

type Journal = Arc<Mutex<Vec<String>>>;

const HUB_API_VERSION: &str = "2021-07-02";
const FAKE_KEY: &str = "a2V5";

fn record(journal: &Journal, entry: String) {
    journal.lock().unwrap().push(entry);
}

fn sas_authentication() -> Authentication {
    Authentication {
        kind: AuthKind::Sas,
        symmetric_key: Some(SymmetricKey {
            primary_key: Some("cHJpbWFyeQ==".into()),
            secondary_key: Some("c2Vjb25kYXJ5".into()),
        }),
        x509_thumbprint: None,
    }
}

fn authentication(kind: AuthKind) -> Authentication {
    match kind {
        AuthKind::Sas => sas_authentication(),
        AuthKind::None => Authentication::none(),
        other => Authentication {
            kind: other,
            symmetric_key: None,
            x509_thumbprint: None,
        },
    }
}

fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// A stored device record as a snapshot would produce it
pub fn device_record(edge: bool) -> DeviceRecord {
    DeviceRecord {
        identity: DeviceIdentityRecord {
            authentication: sas_authentication(),
            capabilities: Some(Capabilities { iot_edge: edge }),
            status: Some("enabled".into()),
            status_reason: None,
        },
        twin: TwinRecord {
            tags: Some(object(json!({"env": "test"}))),
            properties: DesiredProperties {
                desired: object(json!({"interval": 30})),
            },
        },
        parent: None,
        modules: BTreeMap::new(),
    }
}

pub fn module_record(kind: AuthKind, desired: Value) -> ModuleRecord {
    ModuleRecord {
        identity: ModuleIdentityRecord {
            authentication: authentication(kind),
            managed_by: None,
        },
        twin: TwinRecord {
            tags: None,
            properties: DesiredProperties {
                desired: object(desired),
            },
        },
    }
}

// ---------------------------------------------------------------------------
// FakeCloud
// ---------------------------------------------------------------------------

struct FakeHubResource {
    resource: HubResource,
    template_properties: Value,
}

#[derive(Default)]
struct CloudState {
    hubs: BTreeMap<String, FakeHubResource>,
    data: BTreeMap<String, Arc<FakeHub>>,
    certificates: BTreeMap<String, BTreeMap<String, CertificateResource>>,
    secret_failures: BTreeSet<String>,
    probe_failures: BTreeSet<String>,
    placements: BTreeMap<String, String>,
    removed_identities: BTreeSet<String>,
    deploy_fails: bool,
    deployed: Vec<ArmTemplate>,
}

/// Management plane and surrounding resources of one subscription
pub struct FakeCloud {
    state: Mutex<CloudState>,
    journal: Journal,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CloudState::default()),
            journal: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn services(self: &Arc<Self>) -> Services {
        Services {
            control: self.clone(),
            resources: self.clone(),
            data: self.clone(),
        }
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    /// Register a hub and return its resolved target
    pub fn add_hub(self: &Arc<Self>, name: &str, resource_group: &str) -> Target {
        self.insert_hub(name, resource_group, "westus");
        self.target(name)
    }

    fn insert_hub(&self, name: &str, resource_group: &str, location: &str) {
        let host = format!("{}.azure-devices.net", name.to_lowercase());
        let resource = HubResource {
            name: name.to_string(),
            id: format!(
                "/subscriptions/sub/resourceGroups/{}/providers/Microsoft.Devices/IotHubs/{}",
                resource_group, name
            ),
            location: location.to_string(),
            resource_group: resource_group.to_string(),
            subscription_id: "sub".to_string(),
            sku: json!({"name": "S1", "tier": "Standard", "capacity": 1}),
            properties: json!({
                "hostName": host,
                "eventHubEndpoints": {"events": {"partitionCount": 4}},
                "features": "None"
            }),
        };
        let mut state = self.state.lock().unwrap();
        state.hubs.insert(
            name.to_lowercase(),
            FakeHubResource {
                resource,
                template_properties: json!({}),
            },
        );
        state
            .data
            .entry(host)
            .or_insert_with(|| Arc::new(FakeHub::new(self.journal.clone())));
    }

    pub fn target(self: &Arc<Self>, name: &str) -> Target {
        TargetResolver::new(self.clone())
            .resolve(&HubSpec {
                name: Some(name.to_string()),
                ..HubSpec::default()
            })
            .unwrap()
    }

    pub fn hub_data(&self, target: &Target) -> Arc<FakeHub> {
        let mut state = self.state.lock().unwrap();
        state
            .data
            .entry(target.host.clone())
            .or_insert_with(|| Arc::new(FakeHub::new(self.journal.clone())))
            .clone()
    }

    /// Properties of the hub resource in exported templates
    pub fn set_template(&self, target: &Target, properties: Value) {
        let mut state = self.state.lock().unwrap();
        if let Some(hub) = state.hubs.get_mut(&target.entity_name.to_lowercase()) {
            hub.template_properties = properties;
        }
    }

    pub fn add_certificate(&self, hub: &str, name: &str) {
        let certificate = CertificateResource {
            name: name.to_string(),
            etag: Some("etag-1".into()),
            properties: CertificateProperties {
                certificate: Some("MIIBfake".into()),
                is_verified: true,
                subject: Some(format!("CN={}", name)),
                thumbprint: Some("AB12".into()),
            },
        };
        self.state
            .lock()
            .unwrap()
            .certificates
            .entry(hub.to_lowercase())
            .or_default()
            .insert(name.to_string(), certificate);
    }

    /// Key listing fails for a resource (entity, namespace or account name)
    pub fn fail_secret(&self, subject: &str) {
        self.state.lock().unwrap().secret_failures.insert(subject.to_string());
    }

    /// Put a sibling resource in its own resource group; lookups scoped to
    /// another group then fail as not found
    pub fn place_resource(&self, subject: &str, resource_group: &str) {
        self.state
            .lock()
            .unwrap()
            .placements
            .insert(subject.to_string(), resource_group.to_string());
    }

    pub fn fail_probe(&self, subject: &str) {
        self.state.lock().unwrap().probe_failures.insert(subject.to_string());
    }

    pub fn remove_identity(&self, resource_id: &str) {
        self.state
            .lock()
            .unwrap()
            .removed_identities
            .insert(resource_id.to_string());
    }

    pub fn fail_deploy(&self) {
        self.state.lock().unwrap().deploy_fails = true;
    }

    pub fn deployed_templates(&self) -> Vec<ArmTemplate> {
        self.state.lock().unwrap().deployed.clone()
    }

    fn hub(&self, name: &str) -> HubResult<HubResource> {
        self.state
            .lock()
            .unwrap()
            .hubs
            .get(&name.to_lowercase())
            .map(|hub| hub.resource.clone())
            .ok_or_else(|| HubError::ResourceNotFound(format!("IoT Hub '{}'", name)))
    }
}

fn subjects(locator: &ResourceLocator) -> Vec<&str> {
    match &locator.kind {
        ResourceKind::EventHub { namespace, entity, .. }
        | ResourceKind::ServiceBusQueue { namespace, entity, .. }
        | ResourceKind::ServiceBusTopic { namespace, entity, .. } => {
            vec![entity.as_str(), namespace.as_str()]
        }
        ResourceKind::Storage { account } | ResourceKind::Cosmos { account } => {
            vec![account.as_str()]
        }
    }
}

fn misplaced(state: &CloudState, locator: &ResourceLocator) -> bool {
    let Some(resource_group) = &locator.resource_group else {
        return false;
    };
    subjects(locator)
        .iter()
        .any(|s| state.placements.get(*s).is_some_and(|placed| placed != resource_group))
}

impl ControlPlane for FakeCloud {
    fn list_hubs(&self, resource_group: Option<&str>) -> HubResult<Vec<HubResource>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .hubs
            .values()
            .map(|hub| hub.resource.clone())
            .filter(|hub| resource_group.is_none_or(|rg| hub.resource_group == rg))
            .collect())
    }

    fn list_policies(&self, hub_name: &str, _resource_group: &str) -> HubResult<Vec<AccessPolicy>> {
        self.hub(hub_name)?;
        Ok(vec![AccessPolicy {
            key_name: "iothubowner".into(),
            primary_key: FAKE_KEY.into(),
            secondary_key: Some(FAKE_KEY.into()),
            rights: "RegistryWrite, ServiceConnect, DeviceConnect".into(),
        }])
    }

    fn export_template(&self, _resource_group: &str, resource_id: &str) -> HubResult<ArmTemplate> {
        let state = self.state.lock().unwrap();
        let hub = state
            .hubs
            .values()
            .find(|hub| hub.resource.id == resource_id)
            .ok_or_else(|| HubError::ResourceNotFound(resource_id.to_string()))?;
        let name = hub.resource.name.clone();
        record(&self.journal, format!("export_template:{}", name));

        let mut resources = vec![ArmResource {
            resource_type: HUB_RESOURCE_TYPE.to_string(),
            api_version: Some(HUB_API_VERSION.into()),
            name: name.clone(),
            location: Some(hub.resource.location.clone()),
            sku: Some(hub.resource.sku.clone()),
            properties: Some(hub.template_properties.clone()),
            ..ArmResource::default()
        }];
        for certificate in state
            .certificates
            .get(&name.to_lowercase())
            .into_iter()
            .flat_map(|certs| certs.values())
        {
            resources.push(ArmResource {
                resource_type: CERTIFICATE_RESOURCE_TYPE.to_string(),
                api_version: Some(HUB_API_VERSION.into()),
                name: format!("{}/{}", name, certificate.name),
                properties: Some(json!({"certificate": certificate.properties.certificate})),
                ..ArmResource::default()
            });
        }
        Ok(ArmTemplate {
            schema: Some(
                "https://schema.management.azure.com/schemas/2019-04-01/deploymentTemplate.json#"
                    .into(),
            ),
            content_version: Some("1.0.0.0".into()),
            resources,
            ..ArmTemplate::default()
        })
    }

    fn deploy_template(
        &self,
        resource_group: &str,
        _deployment_name: &str,
        template_path: &Path,
    ) -> HubResult<()> {
        let raw = std::fs::read_to_string(template_path).map_err(anyhow::Error::from)?;
        let template: ArmTemplate =
            serde_json::from_str(&raw).map_err(|e| HubError::parse("template", e))?;
        let hub = template
            .hub_resource()
            .cloned()
            .ok_or_else(|| HubError::InvalidArgument("template has no hub".into()))?;
        record(&self.journal, format!("deploy:{}", hub.name));

        if self.state.lock().unwrap().deploy_fails {
            return Err(HubError::Command {
                command: "az deployment group create".into(),
                message: "InvalidTemplate".into(),
            });
        }

        if self.hub(&hub.name).is_err() {
            let location = hub.location.clone().unwrap_or_else(|| "westus".into());
            self.insert_hub(&hub.name, resource_group, &location);
        }
        for resource in template.resources.iter().filter(|r| r.is_type(CERTIFICATE_RESOURCE_TYPE)) {
            if let Some((hub_name, certificate)) = resource.name.split_once('/') {
                self.add_certificate(hub_name, certificate);
            }
        }

        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.hubs.get_mut(&hub.name.to_lowercase()) {
            entry.template_properties = hub.properties.clone().unwrap_or_else(|| json!({}));
        }
        state.deployed.push(template);
        Ok(())
    }

    fn list_certificates(
        &self,
        hub_name: &str,
        _resource_group: &str,
    ) -> HubResult<Vec<CertificateResource>> {
        self.hub(hub_name)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .certificates
            .get(&hub_name.to_lowercase())
            .map(|certs| certs.values().cloned().collect())
            .unwrap_or_default())
    }

    fn delete_certificate(
        &self,
        hub_name: &str,
        _resource_group: &str,
        certificate_name: &str,
        _etag: &str,
    ) -> HubResult<()> {
        record(
            &self.journal,
            format!("delete_certificate:{}/{}", hub_name, certificate_name),
        );
        self.state
            .lock()
            .unwrap()
            .certificates
            .get_mut(&hub_name.to_lowercase())
            .and_then(|certs| certs.remove(certificate_name))
            .map(|_| ())
            .ok_or_else(|| HubError::ResourceNotFound(format!("certificate '{}'", certificate_name)))
    }
}

impl ResourceCli for FakeCloud {
    fn resolve_secret(&self, locator: &ResourceLocator) -> HubResult<ResolvedSecret> {
        let subjects = subjects(locator);
        record(&self.journal, format!("resolve_secret:{}", subjects[0]));
        let state = self.state.lock().unwrap();
        if subjects.iter().any(|s| state.secret_failures.contains(*s)) || misplaced(&state, locator) {
            return Err(HubError::Command {
                command: "az keys list".into(),
                message: format!("(ResourceNotFound) {} was not found", locator.describe()),
            });
        }

        Ok(match &locator.kind {
            ResourceKind::EventHub { namespace, entity, policy }
            | ResourceKind::ServiceBusQueue { namespace, entity, policy }
            | ResourceKind::ServiceBusTopic { namespace, entity, policy } => {
                ResolvedSecret::ConnectionString(format!(
                    "Endpoint=sb://{}.servicebus.windows.net/;SharedAccessKeyName={};SharedAccessKey=ZnJlc2g=;EntityPath={}",
                    namespace,
                    policy.as_deref().unwrap_or("RootManageSharedAccessKey"),
                    entity
                ))
            }
            ResourceKind::Storage { account } => ResolvedSecret::ConnectionString(format!(
                "DefaultEndpointsProtocol=https;AccountName={};AccountKey=ZnJlc2g=;EndpointSuffix=core.windows.net",
                account
            )),
            ResourceKind::Cosmos { .. } => ResolvedSecret::AccountKeys {
                primary: "cHJpbWFyeQ==".into(),
                secondary: Some("c2Vjb25kYXJ5".into()),
            },
        })
    }

    fn probe(&self, locator: &ResourceLocator) -> HubResult<()> {
        let subjects = subjects(locator);
        record(&self.journal, format!("probe:{}", subjects[0]));
        let state = self.state.lock().unwrap();
        if subjects.iter().any(|s| state.probe_failures.contains(*s)) || misplaced(&state, locator) {
            return Err(HubError::ResourceNotFound(locator.describe()));
        }
        Ok(())
    }

    fn probe_identity(&self, resource_id: &str) -> HubResult<()> {
        record(&self.journal, format!("probe_identity:{}", resource_id));
        if self
            .state
            .lock()
            .unwrap()
            .removed_identities
            .contains(resource_id)
        {
            return Err(HubError::ResourceNotFound(resource_id.to_string()));
        }
        Ok(())
    }
}

impl DataPlaneFactory for FakeCloud {
    fn connect(&self, target: &Target) -> Arc<dyn DataPlane> {
        self.hub_data(target)
    }
}

// ---------------------------------------------------------------------------
// FakeHub
// ---------------------------------------------------------------------------

struct FakeModule {
    identity: ModuleIdentity,
    twin: TwinRecord,
}

struct FakeDevice {
    identity: DeviceIdentity,
    twin: TwinRecord,
    modules: BTreeMap<String, FakeModule>,
}

#[derive(Default)]
struct HubData {
    devices: BTreeMap<String, FakeDevice>,
    configurations: BTreeMap<String, Configuration>,
    configurations_disabled: bool,
    failures: BTreeSet<(String, String)>,
    not_found: BTreeSet<(String, String)>,
    modules_content: BTreeMap<String, Map<String, Value>>,
    generation: u64,
}

impl HubData {
    fn check(&self, op: &str, key: &str) -> HubResult<()> {
        let entry = (op.to_string(), key.to_string());
        if self.not_found.contains(&entry) {
            return Err(HubError::ResourceNotFound(format!("'{}' not found", key)));
        }
        if self.failures.contains(&entry) {
            return Err(HubError::Api {
                status: 500,
                message: format!("injected {} failure for '{}'", op, key),
            });
        }
        Ok(())
    }

    fn device_mut(&mut self, device_id: &str) -> HubResult<&mut FakeDevice> {
        self.devices
            .get_mut(device_id)
            .ok_or_else(|| HubError::ResourceNotFound(format!("device '{}'", device_id)))
    }

    fn insert_device(&mut self, mut identity: DeviceIdentity, twin: TwinRecord) -> HubResult<DeviceIdentity> {
        if self.devices.contains_key(&identity.device_id) {
            return Err(HubError::Api {
                status: 409,
                message: format!("device '{}' already exists", identity.device_id),
            });
        }
        self.generation += 1;
        identity.etag = Some(format!("etag-{}", self.generation));
        if identity.is_edge() && identity.device_scope.is_none() {
            identity.device_scope = Some(format!(
                "{}{}-{}",
                DEVICE_SCOPE_PREFIX,
                identity.device_id,
                638_000_000_000_000_000u64 + self.generation
            ));
        }

        let mut modules = BTreeMap::new();
        if identity.is_edge() {
            for (module_id, desired) in [
                ("$edgeAgent", json!({"schemaVersion": "1.1"})),
                ("$edgeHub", json!({"schemaVersion": "1.1", "routes": {}})),
            ] {
                modules.insert(
                    module_id.to_string(),
                    FakeModule {
                        identity: ModuleIdentity {
                            device_id: identity.device_id.clone(),
                            module_id: module_id.to_string(),
                            authentication: Some(sas_authentication()),
                            ..ModuleIdentity::default()
                        },
                        twin: module_record(AuthKind::Sas, desired).twin,
                    },
                );
            }
        }

        self.devices.insert(
            identity.device_id.clone(),
            FakeDevice {
                identity: identity.clone(),
                twin,
                modules,
            },
        );
        Ok(identity)
    }
}

fn merge_twin(twin: &mut TwinRecord, patch: &TwinRecord) {
    if let Some(tags) = &patch.tags {
        twin.tags = Some(tags.clone());
    }
    twin.properties
        .desired
        .extend(patch.properties.desired.clone());
}

fn twin_of(device_id: &str, module_id: Option<&str>, identity: Option<&DeviceIdentity>, record: &TwinRecord) -> Twin {
    let mut desired = record.properties.desired.clone();
    desired.insert("$version".into(), json!(1));
    Twin {
        device_id: device_id.to_string(),
        module_id: module_id.map(str::to_string),
        capabilities: identity.and_then(|i| i.capabilities),
        status: identity.and_then(|i| i.status.clone()),
        device_scope: identity.and_then(|i| i.device_scope.clone()),
        parent_scopes: identity.map(|i| i.parent_scopes.clone()).unwrap_or_default(),
        tags: record.tags.clone(),
        properties: Some(TwinProperties {
            desired,
            reported: Some(json!({"$version": 1})),
        }),
        ..Twin::default()
    }
}

/// Data plane of one hub
pub struct FakeHub {
    data: Mutex<HubData>,
    journal: Journal,
}

impl FakeHub {
    fn new(journal: Journal) -> Self {
        Self {
            data: Mutex::new(HubData::default()),
            journal,
        }
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    pub fn seed_device(&self, device_id: &str, edge: bool) {
        let record = device_record(edge);
        self.data
            .lock()
            .unwrap()
            .insert_device(record.identity.to_identity(device_id), record.twin)
            .unwrap();
    }

    pub fn seed_module(&self, device_id: &str, module_id: &str, kind: AuthKind) {
        let mut data = self.data.lock().unwrap();
        let device = data.device_mut(device_id).unwrap();
        device.modules.insert(
            module_id.to_string(),
            FakeModule {
                identity: ModuleIdentity {
                    device_id: device_id.to_string(),
                    module_id: module_id.to_string(),
                    authentication: Some(authentication(kind)),
                    ..ModuleIdentity::default()
                },
                twin: module_record(kind, json!({"enabled": true})).twin,
            },
        );
    }

    /// Parent `child` to the edge device `parent`
    pub fn set_parent(&self, child: &str, parent: &str) {
        let mut data = self.data.lock().unwrap();
        let scope = data.devices[parent].identity.device_scope.clone().unwrap();
        let child = data.device_mut(child).unwrap();
        child.identity.parent_scopes = vec![scope.clone()];
        if !child.identity.is_edge() {
            child.identity.device_scope = Some(scope);
        }
    }

    pub fn seed_configuration(&self, configuration: Value) {
        let configuration: Configuration = serde_json::from_value(configuration).unwrap();
        self.data
            .lock()
            .unwrap()
            .configurations
            .insert(configuration.id.clone(), configuration);
    }

    /// Every later `op` on `key` fails with a server error
    pub fn fail(&self, op: &str, key: &str) {
        self.data
            .lock()
            .unwrap()
            .failures
            .insert((op.to_string(), key.to_string()));
    }

    /// Every later `op` on `key` reports the entity as missing
    pub fn fail_not_found(&self, op: &str, key: &str) {
        self.data
            .lock()
            .unwrap()
            .not_found
            .insert((op.to_string(), key.to_string()));
    }

    /// Behave like a basic tier hub
    pub fn disable_configurations(&self) {
        self.data.lock().unwrap().configurations_disabled = true;
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.data.lock().unwrap().devices.keys().cloned().collect()
    }

    pub fn device(&self, device_id: &str) -> DeviceIdentity {
        self.data.lock().unwrap().devices[device_id].identity.clone()
    }

    pub fn modules_content(&self, device_id: &str) -> Option<Map<String, Value>> {
        self.data
            .lock()
            .unwrap()
            .modules_content
            .get(device_id)
            .cloned()
    }

    fn configurations_supported(data: &HubData) -> HubResult<()> {
        if data.configurations_disabled {
            return Err(HubError::Api {
                status: 400,
                message: "Configurations are not supported on this hub tier".into(),
            });
        }
        Ok(())
    }
}

impl DataPlane for FakeHub {
    fn query_twins(&self) -> HubResult<Vec<Twin>> {
        record(&self.journal, "query_twins".into());
        let data = self.data.lock().unwrap();
        data.check("query_twins", "")?;
        Ok(data
            .devices
            .values()
            .map(|d| twin_of(&d.identity.device_id, None, Some(&d.identity), &d.twin))
            .collect())
    }

    fn get_device(&self, device_id: &str) -> HubResult<DeviceIdentity> {
        let mut data = self.data.lock().unwrap();
        data.check("get_device", device_id)?;
        Ok(data.device_mut(device_id)?.identity.clone())
    }

    fn create_device(&self, device: &DeviceIdentity) -> HubResult<DeviceIdentity> {
        record(&self.journal, format!("create_device:{}", device.device_id));
        let mut data = self.data.lock().unwrap();
        data.check("create_device", &device.device_id)?;
        data.insert_device(device.clone(), TwinRecord::default())
    }

    fn update_device(&self, device: &DeviceIdentity) -> HubResult<DeviceIdentity> {
        record(&self.journal, format!("update_device:{}", device.device_id));
        let mut data = self.data.lock().unwrap();
        data.check("update_device", &device.device_id)?;
        let stored = data.device_mut(&device.device_id)?;
        stored.identity = device.clone();
        Ok(stored.identity.clone())
    }

    fn delete_device(&self, device_id: &str) -> HubResult<()> {
        record(&self.journal, format!("delete_device:{}", device_id));
        let mut data = self.data.lock().unwrap();
        data.check("delete_device", device_id)?;
        data.devices
            .remove(device_id)
            .map(|_| ())
            .ok_or_else(|| HubError::ResourceNotFound(format!("device '{}'", device_id)))
    }

    fn update_twin(&self, device_id: &str, patch: &TwinRecord) -> HubResult<()> {
        record(&self.journal, format!("update_twin:{}", device_id));
        let mut data = self.data.lock().unwrap();
        data.check("update_twin", device_id)?;
        merge_twin(&mut data.device_mut(device_id)?.twin, patch);
        Ok(())
    }

    fn list_modules(&self, device_id: &str) -> HubResult<Vec<ModuleIdentity>> {
        let mut data = self.data.lock().unwrap();
        data.check("list_modules", device_id)?;
        Ok(data
            .device_mut(device_id)?
            .modules
            .values()
            .map(|m| m.identity.clone())
            .collect())
    }

    fn get_module_twin(&self, device_id: &str, module_id: &str) -> HubResult<Twin> {
        let mut data = self.data.lock().unwrap();
        data.check("get_module_twin", &format!("{}/{}", device_id, module_id))?;
        let module = data
            .device_mut(device_id)?
            .modules
            .get(module_id)
            .ok_or_else(|| HubError::ResourceNotFound(format!("module '{}'", module_id)))?;
        Ok(twin_of(device_id, Some(module_id), None, &module.twin))
    }

    fn create_module(&self, module: &ModuleIdentity) -> HubResult<ModuleIdentity> {
        let key = format!("{}/{}", module.device_id, module.module_id);
        record(&self.journal, format!("create_module:{}", key));
        let mut data = self.data.lock().unwrap();
        data.check("create_module", &key)?;
        let device = data.device_mut(&module.device_id)?;
        device.modules.insert(
            module.module_id.clone(),
            FakeModule {
                identity: module.clone(),
                twin: TwinRecord::default(),
            },
        );
        Ok(module.clone())
    }

    fn update_module_twin(
        &self,
        device_id: &str,
        module_id: &str,
        patch: &TwinRecord,
    ) -> HubResult<()> {
        let key = format!("{}/{}", device_id, module_id);
        record(&self.journal, format!("update_module_twin:{}", key));
        let mut data = self.data.lock().unwrap();
        data.check("update_module_twin", &key)?;
        let module = data
            .device_mut(device_id)?
            .modules
            .get_mut(module_id)
            .ok_or_else(|| HubError::ResourceNotFound(format!("module '{}'", key)))?;
        merge_twin(&mut module.twin, patch);
        Ok(())
    }

    fn apply_modules_content(
        &self,
        device_id: &str,
        modules_content: &Map<String, Value>,
    ) -> HubResult<()> {
        record(&self.journal, format!("apply_modules_content:{}", device_id));
        let mut data = self.data.lock().unwrap();
        data.check("apply_modules_content", device_id)?;
        data.device_mut(device_id)?;
        data.modules_content
            .insert(device_id.to_string(), modules_content.clone());
        Ok(())
    }

    fn list_configurations(&self, top: usize) -> HubResult<Vec<Configuration>> {
        record(&self.journal, "list_configurations".into());
        let data = self.data.lock().unwrap();
        Self::configurations_supported(&data)?;
        Ok(data.configurations.values().take(top).cloned().collect())
    }

    fn create_configuration(&self, configuration: &Configuration) -> HubResult<()> {
        record(
            &self.journal,
            format!("create_configuration:{}", configuration.id),
        );
        let mut data = self.data.lock().unwrap();
        Self::configurations_supported(&data)?;
        data.check("create_configuration", &configuration.id)?;
        if data.configurations.contains_key(&configuration.id) {
            return Err(HubError::Api {
                status: 409,
                message: format!("configuration '{}' already exists", configuration.id),
            });
        }
        data.configurations
            .insert(configuration.id.clone(), configuration.clone());
        Ok(())
    }

    fn delete_configuration(&self, configuration_id: &str) -> HubResult<()> {
        record(
            &self.journal,
            format!("delete_configuration:{}", configuration_id),
        );
        let mut data = self.data.lock().unwrap();
        data.check("delete_configuration", configuration_id)?;
        data.configurations
            .remove(configuration_id)
            .map(|_| ())
            .ok_or_else(|| {
                HubError::ResourceNotFound(format!("configuration '{}'", configuration_id))
            })
    }
}
