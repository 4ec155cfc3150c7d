//! Applies a [`HubState`] to a destination hub.
//!
//! Order is fixed: control plane, configurations, devices and modules, then
//! parent/child relationships once every device exists. Only a failed
//! control-plane deployment stops the run; everything after it proceeds
//! past individual failures.

use super::model::{
    ArmResource, ArmTemplate, Aspect, AspectSet, CERTIFICATE_RESOURCE_TYPE, CertificateDescriptor,
    ConfigurationSet, DeviceRecord, HUB_RESOURCE_TYPE, HubState,
};
use super::pool;
use crate::hub::{DataPlane, HubError, HubResource, HubResult, HubSpec, Services, Target};
use crate::traits::Output;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// System modules every edge deployment is expected to carry
const EDGE_SYSTEM_MODULES: [&str; 2] = ["$edgeAgent", "$edgeHub"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplayPhase {
    #[default]
    NotStarted,
    ControlPlaneApplied,
    AbortedOnControlPlaneFailure,
    ConfigurationsApplied,
    DevicesApplied,
    RelationshipsApplied,
    Done,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    pub phase: ReplayPhase,
    pub hub_created: bool,
    pub certificates_added: usize,
    pub configurations_created: usize,
    pub configuration_failures: usize,
    pub devices_created: usize,
    pub device_failures: usize,
    pub modules_created: usize,
    pub module_failures: usize,
    pub relationships_applied: usize,
    pub relationship_failures: usize,
}

impl ReplayReport {
    pub fn failures(&self) -> usize {
        self.configuration_failures
            + self.device_failures
            + self.module_failures
            + self.relationship_failures
    }

    pub fn summary_items(&self) -> Vec<(String, String)> {
        vec![
            (
                "Hub".to_string(),
                if self.hub_created { "created" } else { "updated" }.to_string(),
            ),
            ("Certificates added".to_string(), self.certificates_added.to_string()),
            (
                "Configurations".to_string(),
                self.configurations_created.to_string(),
            ),
            ("Devices".to_string(), self.devices_created.to_string()),
            ("Modules".to_string(), self.modules_created.to_string()),
            (
                "Parent links".to_string(),
                self.relationships_applied.to_string(),
            ),
            ("Failures".to_string(), self.failures().to_string()),
        ]
    }
}

#[derive(Debug, Default)]
struct DeviceOutcome {
    modules_created: usize,
    module_failures: usize,
}

pub struct ReplayEngine<'a> {
    services: &'a Services,
    output: Arc<dyn Output>,
    workers: usize,
}

impl<'a> ReplayEngine<'a> {
    pub fn new(services: &'a Services, output: Arc<dyn Output>) -> Self {
        Self {
            services,
            output,
            workers: 1,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    fn advance(&self, report: &mut ReplayReport, phase: ReplayPhase) {
        tracing::debug!(from = ?report.phase, to = ?phase, "replay phase");
        report.phase = phase;
    }

    /// Replay `state` onto `dest`; `existing` is the destination when it already exists
    pub fn replay(
        &self,
        dest: &HubSpec,
        existing: Option<Target>,
        state: &HubState,
        aspects: &AspectSet,
    ) -> HubResult<ReplayReport> {
        let mut report = ReplayReport::default();
        let mut target = existing;

        if let (true, Some(arm)) = (aspects.contains(&Aspect::Arm), state.arm.as_ref()) {
            self.output.section("Applying control plane");
            if let Err(e) = self.apply_arm(dest, arm, state.certificates.as_deref(), &mut report) {
                self.advance(&mut report, ReplayPhase::AbortedOnControlPlaneFailure);
                return Err(e);
            }
            target = Some(self.services.resolver().resolve(dest)?);
        }
        self.advance(&mut report, ReplayPhase::ControlPlaneApplied);

        let target = target.ok_or_else(|| {
            HubError::NotFound(format!("IoT Hub '{}' does not exist", dest.describe()))
        })?;
        let data = self.services.data.connect(&target);

        if let (true, Some(configurations)) = (
            aspects.contains(&Aspect::Configurations),
            state.configurations.as_ref(),
        ) {
            self.output.section("Creating configurations");
            self.replay_configurations(&*data, configurations, &mut report);
        }
        self.advance(&mut report, ReplayPhase::ConfigurationsApplied);

        let mut relationships = Vec::new();
        if let (true, Some(devices)) = (aspects.contains(&Aspect::Devices), state.devices.as_ref()) {
            self.output.section("Creating devices");
            relationships = self.replay_devices(&data, devices, &mut report);
        }
        self.advance(&mut report, ReplayPhase::DevicesApplied);

        if !relationships.is_empty() {
            self.output.section("Linking child devices");
            self.replay_relationships(&*data, &relationships, &mut report);
        }
        self.advance(&mut report, ReplayPhase::RelationshipsApplied);
        self.advance(&mut report, ReplayPhase::Done);
        Ok(report)
    }

    fn apply_arm(
        &self,
        dest: &HubSpec,
        arm: &ArmTemplate,
        certificates: Option<&[CertificateDescriptor]>,
        report: &mut ReplayReport,
    ) -> HubResult<()> {
        let name = dest.name.as_deref().ok_or_else(|| {
            HubError::InvalidArgument("a hub name is required to apply the arm aspect".into())
        })?;
        let existing = self.services.resolver().find_hub(dest)?;
        let resource_group = dest
            .resource_group
            .clone()
            .or_else(|| existing.as_ref().map(|hub| hub.resource_group.clone()))
            .filter(|rg| !rg.is_empty())
            .ok_or_else(|| {
                HubError::InvalidArgument(format!(
                    "a resource group is required to create hub '{}'",
                    name
                ))
            })?;

        let mut template = arm.clone();
        let hub = template.hub_resource_mut().ok_or_else(|| {
            HubError::Deployment("the saved template has no IoT Hub resource".into())
        })?;
        let source_name = std::mem::replace(&mut hub.name, name.to_string());
        if let Some(existing) = &existing {
            keep_immutable_properties(hub, existing);
        }
        let api_version = hub.api_version.clone();
        retarget_child_resources(&mut template, &source_name, name);

        if let Some(certificates) = certificates {
            let present = self.existing_certificates(name, &resource_group, existing.is_some());
            for certificate in certificates {
                if present.contains(&certificate.name) {
                    self.output.dimmed(&format!(
                        "Certificate '{}' already exists, skipping",
                        certificate.name
                    ));
                    continue;
                }
                template
                    .resources
                    .push(certificate_resource(name, api_version.clone(), certificate));
                report.certificates_added += 1;
            }
        }

        self.deploy(&resource_group, name, &template)?;
        report.hub_created = existing.is_none();
        Ok(())
    }

    fn existing_certificates(&self, hub: &str, resource_group: &str, hub_exists: bool) -> BTreeSet<String> {
        if !hub_exists {
            return BTreeSet::new();
        }
        match self.services.control.list_certificates(hub, resource_group) {
            Ok(certificates) => certificates.into_iter().map(|c| c.name).collect(),
            Err(e) => {
                self.output
                    .warning(&format!("Could not list existing certificates: {}", e));
                BTreeSet::new()
            }
        }
    }

    /// Write the template to a temporary file and submit it; the file is
    /// removed when this returns
    fn deploy(&self, resource_group: &str, hub_name: &str, template: &ArmTemplate) -> HubResult<()> {
        let file = tempfile::Builder::new()
            .prefix("iothub-state-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| HubError::Deployment(format!("cannot create template file: {}", e)))?;
        serde_json::to_writer_pretty(file.as_file(), template)
            .map_err(|e| HubError::Deployment(format!("cannot write template file: {}", e)))?;

        let deployment_name = format!("iothub-state-{}", uuid::Uuid::new_v4().simple());
        self.output.info(&format!(
            "Deploying hub '{}' to resource group '{}' ({})",
            hub_name, resource_group, deployment_name
        ));
        self.services
            .control
            .deploy_template(resource_group, &deployment_name, file.path())
            .map_err(|e| HubError::Deployment(e.to_string()))
    }

    fn replay_configurations(
        &self,
        data: &dyn DataPlane,
        configurations: &ConfigurationSet,
        report: &mut ReplayReport,
    ) {
        // Layered deployments build on modules full deployments define
        let ordered = configurations
            .adm
            .values()
            .chain(configurations.edge.values().filter(|c| !c.is_layered()))
            .chain(configurations.edge.values().filter(|c| c.is_layered()));

        for configuration in ordered {
            match data.create_configuration(&configuration.to_create_body()) {
                Ok(()) => report.configurations_created += 1,
                Err(e) => {
                    self.output.error(&format!(
                        "Failed to create configuration '{}': {}",
                        configuration.id, e
                    ));
                    report.configuration_failures += 1;
                }
            }
        }
    }

    /// Create every device; returns the (child, parent) links to apply afterwards
    fn replay_devices(
        &self,
        data: &Arc<dyn DataPlane>,
        devices: &BTreeMap<String, DeviceRecord>,
        report: &mut ReplayReport,
    ) -> Vec<(String, String)> {
        let total = devices.len();
        let items: Vec<(usize, String, DeviceRecord)> = devices
            .iter()
            .enumerate()
            .map(|(index, (id, record))| (index, id.clone(), record.clone()))
            .collect();
        let worker_data = data.clone();
        let worker_output = self.output.clone();
        let results = pool::run_bounded(self.workers, items, move |(index, id, record)| {
            worker_output.progress(index + 1, total, &id);
            replay_device(&*worker_data, &*worker_output, &id, &record).map_err(anyhow::Error::from)
        });

        let mut relationships = Vec::new();
        for ((id, record), result) in devices.iter().zip(results) {
            match result {
                Ok(outcome) => {
                    report.devices_created += 1;
                    report.modules_created += outcome.modules_created;
                    report.module_failures += outcome.module_failures;
                    if let Some(parent) = &record.parent {
                        relationships.push((id.clone(), parent.clone()));
                    }
                }
                Err(e) => {
                    self.output
                        .error(&format!("Failed to create device '{}': {}", id, e));
                    tracing::warn!(device = %id, error = %e, "device replay failed");
                    report.device_failures += 1;
                }
            }
        }
        relationships
    }

    fn replay_relationships(
        &self,
        data: &dyn DataPlane,
        relationships: &[(String, String)],
        report: &mut ReplayReport,
    ) {
        for (child, parent) in relationships {
            match set_parent(data, child, parent) {
                Ok(()) => report.relationships_applied += 1,
                Err(e) => {
                    self.output.error(&format!(
                        "Failed to set parent of '{}' to '{}': {}",
                        child, parent, e
                    ));
                    report.relationship_failures += 1;
                }
            }
        }
    }
}

/// Location, sku, partition count and features cannot change on an existing hub
fn keep_immutable_properties(hub: &mut ArmResource, existing: &HubResource) {
    if !existing.location.is_empty() {
        hub.location = Some(existing.location.clone());
    }
    if !existing.sku.is_null() {
        hub.sku = Some(existing.sku.clone());
    }

    let properties = hub.properties.get_or_insert_with(|| json!({}));
    if !properties.is_object() {
        return;
    }
    if let Some(count) = existing.partition_count() {
        properties["eventHubEndpoints"]["events"]["partitionCount"] = count.clone();
    }
    if let Some(features) = existing.features() {
        properties["features"] = features.clone();
    }
}

/// Move resources exported alongside the hub (consumer groups and the like)
/// from the source hub's name onto the destination's
fn retarget_child_resources(template: &mut ArmTemplate, source: &str, dest: &str) {
    if source.is_empty() || source.eq_ignore_ascii_case(dest) {
        return;
    }
    let child_prefix = format!("{}/", HUB_RESOURCE_TYPE).to_ascii_lowercase();
    let source_prefix = format!("{}/", source).to_ascii_lowercase();

    for resource in &mut template.resources {
        let resource_type = resource.resource_type.to_ascii_lowercase();
        if resource_type.starts_with(&child_prefix)
            && resource.name.to_ascii_lowercase().starts_with(&source_prefix)
        {
            resource.name = format!("{}/{}", dest, &resource.name[source_prefix.len()..]);
        }
        for dependency in &mut resource.depends_on {
            if dependency
                .to_ascii_lowercase()
                .contains(&HUB_RESOURCE_TYPE.to_ascii_lowercase())
            {
                *dependency = replace_quoted(dependency, source, dest);
            }
        }
    }
}

/// Replace every `'<from>'` literal in an ARM expression, ignoring case
fn replace_quoted(expression: &str, from: &str, to: &str) -> String {
    let needle = format!("'{}'", from).to_ascii_lowercase();
    let haystack = expression.to_ascii_lowercase();
    let mut result = String::with_capacity(expression.len());
    let mut last = 0;
    for (start, _) in haystack.match_indices(&needle) {
        result.push_str(&expression[last..start]);
        result.push_str(&format!("'{}'", to));
        last = start + needle.len();
    }
    result.push_str(&expression[last..]);
    result
}

fn certificate_resource(
    hub_name: &str,
    api_version: Option<String>,
    certificate: &CertificateDescriptor,
) -> ArmResource {
    ArmResource {
        resource_type: CERTIFICATE_RESOURCE_TYPE.to_string(),
        api_version,
        name: format!("{}/{}", hub_name, certificate.name),
        properties: Some(json!({
            "certificate": certificate.certificate,
            "isVerified": certificate.is_verified,
        })),
        depends_on: vec![format!(
            "[resourceId('{}', '{}')]",
            HUB_RESOURCE_TYPE, hub_name
        )],
        ..ArmResource::default()
    }
}

fn replay_device(
    data: &dyn DataPlane,
    output: &dyn Output,
    device_id: &str,
    record: &DeviceRecord,
) -> HubResult<DeviceOutcome> {
    data.create_device(&record.identity.to_identity(device_id))?;
    if !record.twin.is_empty() {
        data.update_twin(device_id, &record.twin)?;
    }

    let mut outcome = DeviceOutcome::default();
    let mut modules_content = Map::new();
    for (module_id, module) in &record.modules {
        if module.is_edge_managed(module_id) {
            if module.twin.tags.as_ref().is_some_and(|tags| !tags.is_empty()) {
                output.warning(&format!(
                    "Tags of module '{}/{}' are not kept; modules content only carries desired properties",
                    device_id, module_id
                ));
            }
            modules_content.insert(
                module_id.clone(),
                json!({ "properties.desired": Value::Object(module.twin.properties.desired.clone()) }),
            );
            continue;
        }

        let result = data
            .create_module(&module.identity.to_identity(device_id, module_id))
            .and_then(|_| {
                if module.twin.is_empty() {
                    Ok(())
                } else {
                    data.update_module_twin(device_id, module_id, &module.twin)
                }
            });
        match result {
            Ok(()) => outcome.modules_created += 1,
            Err(e) => {
                output.error(&format!(
                    "Failed to create module '{}/{}': {}",
                    device_id, module_id, e
                ));
                outcome.module_failures += 1;
            }
        }
    }

    if !modules_content.is_empty() {
        for system in EDGE_SYSTEM_MODULES {
            if !modules_content.contains_key(system) {
                output.warning(&format!(
                    "Modules content for '{}' has no {} entry",
                    device_id, system
                ));
            }
        }
        match data.apply_modules_content(device_id, &modules_content) {
            Ok(()) => outcome.modules_created += modules_content.len(),
            Err(e) => {
                output.error(&format!(
                    "Failed to set modules on '{}': {}",
                    device_id, e
                ));
                outcome.module_failures += modules_content.len();
            }
        }
    }
    Ok(outcome)
}

/// Point `child` at `parent`'s device scope
fn set_parent(data: &dyn DataPlane, child: &str, parent: &str) -> HubResult<()> {
    let parent_identity = data.get_device(parent)?;
    let scope = parent_identity.device_scope.ok_or_else(|| {
        HubError::InvalidArgument(format!("device '{}' has no device scope", parent))
    })?;

    let mut child_identity = data.get_device(child)?;
    child_identity.parent_scopes = vec![scope.clone()];
    if !child_identity.is_edge() {
        child_identity.device_scope = Some(scope);
    }
    data.update_device(&child_identity)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::model::{AuthKind, aspect_set};
    use crate::test_helpers::{FakeCloud, device_record, module_record};
    use crate::traits::MockOutput;

    fn dest() -> HubSpec {
        HubSpec {
            name: Some("dest".into()),
            resource_group: Some("rg".into()),
            ..HubSpec::default()
        }
    }

    fn arm_template(properties: Value) -> ArmTemplate {
        ArmTemplate {
            resources: vec![ArmResource {
                resource_type: HUB_RESOURCE_TYPE.to_string(),
                api_version: Some("2021-07-02".into()),
                name: "src".into(),
                location: Some("eastus".into()),
                properties: Some(properties),
                ..ArmResource::default()
            }],
            ..ArmTemplate::default()
        }
    }

    fn position(journal: &[String], entry: &str) -> usize {
        journal
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("'{}' not in journal {:?}", entry, journal))
    }

    #[test]
    fn test_control_plane_first_and_links_last() {
        let cloud = FakeCloud::new();
        let mut devices = BTreeMap::new();
        // The child sorts before its parent, so it is created first
        let mut leaf = device_record(false);
        leaf.parent = Some("z-edge".into());
        devices.insert("a-leaf".to_string(), leaf);
        devices.insert("z-edge".to_string(), device_record(true));
        let state = HubState {
            arm: Some(arm_template(json!({}))),
            devices: Some(devices),
            ..HubState::default()
        };
        let services = cloud.services();
        let output = Arc::new(MockOutput::new());

        let report = ReplayEngine::new(&services, output.clone())
            .replay(&dest(), None, &state, &aspect_set(&[]))
            .unwrap();

        let journal = cloud.journal();
        let deploy = position(&journal, "deploy:dest");
        let create_leaf = position(&journal, "create_device:a-leaf");
        let create_edge = position(&journal, "create_device:z-edge");
        let link = position(&journal, "update_device:a-leaf");
        assert!(deploy < create_leaf);
        assert!(create_leaf < create_edge);
        assert!(create_edge < link);

        assert_eq!(report.phase, ReplayPhase::Done);
        assert!(report.hub_created);
        assert_eq!(report.relationships_applied, 1);

        let hub = cloud.hub_data(&cloud.target("dest"));
        let edge_scope = hub.device("z-edge").device_scope.unwrap();
        let leaf = hub.device("a-leaf");
        assert_eq!(leaf.parent_scopes, vec![edge_scope.clone()]);
        assert_eq!(leaf.device_scope, Some(edge_scope));
    }

    #[test]
    fn test_layered_deployments_are_created_last() {
        let cloud = FakeCloud::new();
        let target = cloud.add_hub("dest", "rg");
        let configurations = ConfigurationSet::from_configurations(vec![
            serde_json::from_value(json!({"id": "a-layer", "content": {"modulesContent": {"$edgeAgent": {"properties.desired.modules.sim": {}}}}})).unwrap(),
            serde_json::from_value(json!({"id": "m-full", "content": {"modulesContent": {"$edgeAgent": {"properties.desired": {}}}}})).unwrap(),
            serde_json::from_value(json!({"id": "z-adm", "content": {"deviceContent": {"properties.desired.x": 1}}})).unwrap(),
        ]);
        let state = HubState {
            configurations: Some(configurations),
            ..HubState::default()
        };
        let services = cloud.services();

        let report = ReplayEngine::new(&services, Arc::new(MockOutput::new()))
            .replay(&dest(), Some(target), &state, &aspect_set(&[Aspect::Configurations]))
            .unwrap();

        let created: Vec<String> = cloud
            .journal()
            .into_iter()
            .filter(|e| e.starts_with("create_configuration:"))
            .collect();
        assert_eq!(
            created,
            vec![
                "create_configuration:z-adm",
                "create_configuration:m-full",
                "create_configuration:a-layer"
            ]
        );
        assert_eq!(report.configurations_created, 3);
    }

    #[test]
    fn test_edge_managed_modules_go_through_modules_content() {
        let cloud = FakeCloud::new();
        let target = cloud.add_hub("dest", "rg");
        let mut edge = device_record(true);
        edge.modules.insert("$edgeAgent".into(), module_record(AuthKind::Sas, json!({"schemaVersion": "1.1"})));
        edge.modules.insert("$edgeHub".into(), module_record(AuthKind::Sas, json!({"routes": {}})));
        edge.modules.insert("sim".into(), module_record(AuthKind::Sas, json!({"rate": 5})));
        edge.modules.insert("no-creds".into(), module_record(AuthKind::None, json!({"x": 1})));
        let state = HubState {
            devices: Some(BTreeMap::from([("edge-1".to_string(), edge)])),
            ..HubState::default()
        };
        let services = cloud.services();
        let output = Arc::new(MockOutput::new());

        let report = ReplayEngine::new(&services, output.clone())
            .replay(&dest(), Some(target.clone()), &state, &aspect_set(&[Aspect::Devices]))
            .unwrap();

        let journal = cloud.journal();
        assert!(journal.contains(&"create_module:edge-1/sim".to_string()));
        assert!(journal.contains(&"update_module_twin:edge-1/sim".to_string()));
        assert!(!journal.iter().any(|e| e == "create_module:edge-1/$edgeAgent"));
        assert!(!journal.iter().any(|e| e == "create_module:edge-1/no-creds"));

        let content = cloud.hub_data(&target).modules_content("edge-1").unwrap();
        let keys: Vec<&String> = content.keys().collect();
        assert_eq!(keys, vec!["$edgeAgent", "$edgeHub", "no-creds"]);
        assert_eq!(content["$edgeAgent"]["properties.desired"]["schemaVersion"], "1.1");
        assert_eq!(report.modules_created, 4);
        assert!(output.get_warnings().is_empty());
    }

    #[test]
    fn test_edge_managed_module_tags_are_reported() {
        let cloud = FakeCloud::new();
        let target = cloud.add_hub("dest", "rg");
        let mut edge = device_record(true);
        edge.modules.insert("$edgeAgent".into(), module_record(AuthKind::Sas, json!({"schemaVersion": "1.1"})));
        edge.modules.insert("$edgeHub".into(), module_record(AuthKind::Sas, json!({"routes": {}})));
        let mut tagged = module_record(AuthKind::None, json!({"x": 1}));
        tagged.twin.tags = json!({"team": "ops"}).as_object().cloned();
        edge.modules.insert("no-creds".into(), tagged);
        let state = HubState {
            devices: Some(BTreeMap::from([("edge-1".to_string(), edge)])),
            ..HubState::default()
        };
        let services = cloud.services();
        let output = Arc::new(MockOutput::new());

        ReplayEngine::new(&services, output.clone())
            .replay(&dest(), Some(target.clone()), &state, &aspect_set(&[Aspect::Devices]))
            .unwrap();

        assert!(output.has_warning_containing("Tags of module 'edge-1/no-creds' are not kept"));
        assert_eq!(output.get_warnings().len(), 1);
        let content = cloud.hub_data(&target).modules_content("edge-1").unwrap();
        assert_eq!(content["no-creds"]["properties.desired"]["x"], 1);
    }

    #[test]
    fn test_failed_device_does_not_stop_the_rest() {
        let cloud = FakeCloud::new();
        let target = cloud.add_hub("dest", "rg");
        cloud.hub_data(&target).fail("create_device", "bad");
        let devices = BTreeMap::from([
            ("bad".to_string(), device_record(false)),
            ("good".to_string(), device_record(false)),
        ]);
        let state = HubState {
            devices: Some(devices),
            ..HubState::default()
        };
        let services = cloud.services();
        let output = Arc::new(MockOutput::new());

        let report = ReplayEngine::new(&services, output.clone())
            .workers(2)
            .replay(&dest(), Some(target.clone()), &state, &aspect_set(&[Aspect::Devices]))
            .unwrap();

        assert_eq!(report.devices_created, 1);
        assert_eq!(report.device_failures, 1);
        assert_eq!(report.phase, ReplayPhase::Done);
        assert!(output.get_errors()[0].contains("Failed to create device 'bad'"));
        assert_eq!(cloud.hub_data(&target).device_ids(), vec!["good".to_string()]);
    }

    #[test]
    fn test_deployment_failure_is_fatal() {
        let cloud = FakeCloud::new();
        cloud.fail_deploy();
        let state = HubState {
            arm: Some(arm_template(json!({}))),
            devices: Some(BTreeMap::from([("dev".to_string(), device_record(false))])),
            ..HubState::default()
        };
        let services = cloud.services();

        let err = ReplayEngine::new(&services, Arc::new(MockOutput::new()))
            .replay(&dest(), None, &state, &aspect_set(&[]))
            .unwrap_err();

        assert!(matches!(err, HubError::Deployment(_)));
        assert!(!cloud.journal().iter().any(|e| e.starts_with("create_device")));
    }

    #[test]
    fn test_new_hub_needs_resource_group() {
        let cloud = FakeCloud::new();
        let state = HubState {
            arm: Some(arm_template(json!({}))),
            ..HubState::default()
        };
        let services = cloud.services();
        let spec = HubSpec {
            name: Some("dest".into()),
            ..HubSpec::default()
        };

        let err = ReplayEngine::new(&services, Arc::new(MockOutput::new()))
            .replay(&spec, None, &state, &aspect_set(&[Aspect::Arm]))
            .unwrap_err();

        assert!(matches!(err, HubError::InvalidArgument(_)));
        assert!(cloud.deployed_templates().is_empty());
    }

    #[test]
    fn test_existing_hub_keeps_immutable_fields_and_certificates() {
        let cloud = FakeCloud::new();
        let target = cloud.add_hub("dest", "rg");
        cloud.add_certificate("dest", "root-ca");
        let state = HubState {
            arm: Some(arm_template(json!({
                "eventHubEndpoints": {"events": {"partitionCount": 2, "retentionTimeInDays": 1}}
            }))),
            certificates: Some(vec![
                CertificateDescriptor {
                    name: "root-ca".into(),
                    certificate: Some("MIIA".into()),
                    is_verified: true,
                },
                CertificateDescriptor {
                    name: "new-ca".into(),
                    certificate: Some("MIIB".into()),
                    is_verified: false,
                },
            ]),
            ..HubState::default()
        };
        let services = cloud.services();

        let report = ReplayEngine::new(&services, Arc::new(MockOutput::new()))
            .replay(&dest(), Some(target), &state, &aspect_set(&[Aspect::Arm]))
            .unwrap();

        assert!(!report.hub_created);
        assert_eq!(report.certificates_added, 1);
        let deployed = cloud.deployed_templates().pop().unwrap();
        let hub = deployed.hub_resource().unwrap();
        assert_eq!(hub.name, "dest");
        assert_eq!(hub.location.as_deref(), Some("westus"));
        let properties = hub.properties.clone().unwrap();
        assert_eq!(properties["eventHubEndpoints"]["events"]["partitionCount"], 4);
        assert_eq!(properties["eventHubEndpoints"]["events"]["retentionTimeInDays"], 1);

        let certificates: Vec<&ArmResource> = deployed
            .resources
            .iter()
            .filter(|r| r.is_type(CERTIFICATE_RESOURCE_TYPE))
            .collect();
        assert_eq!(certificates.len(), 1);
        assert_eq!(certificates[0].name, "dest/new-ca");
        assert_eq!(
            certificates[0].depends_on,
            vec!["[resourceId('Microsoft.Devices/IotHubs', 'dest')]".to_string()]
        );
    }

    #[test]
    fn test_child_resources_follow_the_destination_name() {
        let cloud = FakeCloud::new();
        let mut template = arm_template(json!({}));
        template.resources.push(ArmResource {
            resource_type: "Microsoft.Devices/IotHubs/eventHubEndpoints/ConsumerGroups".into(),
            api_version: Some("2021-07-02".into()),
            name: "src/events/$Default".into(),
            depends_on: vec!["[resourceId('Microsoft.Devices/IotHubs', 'src')]".into()],
            ..ArmResource::default()
        });
        let state = HubState {
            arm: Some(template),
            ..HubState::default()
        };
        let services = cloud.services();

        ReplayEngine::new(&services, Arc::new(MockOutput::new()))
            .replay(&dest(), None, &state, &aspect_set(&[Aspect::Arm]))
            .unwrap();

        let deployed = cloud.deployed_templates().pop().unwrap();
        assert_eq!(deployed.hub_resource().unwrap().name, "dest");
        let group = deployed
            .resources
            .iter()
            .find(|r| r.is_type("Microsoft.Devices/IotHubs/eventHubEndpoints/ConsumerGroups"))
            .unwrap();
        assert_eq!(group.name, "dest/events/$Default");
        assert_eq!(
            group.depends_on,
            vec!["[resourceId('Microsoft.Devices/IotHubs', 'dest')]".to_string()]
        );
    }

    #[test]
    fn test_replace_quoted_ignores_case_and_partial_names() {
        assert_eq!(
            replace_quoted("[resourceId('Microsoft.Devices/IotHubs', 'SRC')]", "src", "dest"),
            "[resourceId('Microsoft.Devices/IotHubs', 'dest')]"
        );
        assert_eq!(
            replace_quoted("[resourceId('Microsoft.Devices/IotHubs', 'src2')]", "src", "dest"),
            "[resourceId('Microsoft.Devices/IotHubs', 'src2')]"
        );
    }

    #[test]
    fn test_missing_destination_without_arm() {
        let cloud = FakeCloud::new();
        let services = cloud.services();

        let err = ReplayEngine::new(&services, Arc::new(MockOutput::new()))
            .replay(&dest(), None, &HubState::default(), &aspect_set(&[Aspect::Devices]))
            .unwrap_err();

        assert!(matches!(err, HubError::NotFound(_)));
    }
}
