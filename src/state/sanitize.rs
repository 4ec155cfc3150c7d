//! Reconciles an exported hub template against the resources it refers to.
//!
//! Identities are checked first, then endpoints (which may depend on a
//! removed identity), then routes and enrichments (which may depend on a
//! removed endpoint). Each stage works on the survivors of the previous one.

use crate::hub::connection_string::{ConnectionString, host_label};
use crate::hub::error::{HubError, HubResult};
use crate::hub::resources::{ResolvedSecret, ResourceCli, ResourceKind, ResourceLocator};
use crate::state::model::{
    ArmTemplate, AuthenticationType, BUILT_IN_ENDPOINT, Endpoint, EndpointAuth, EndpointKind,
    ResourceIdentity, Routing, RoutingEndpoints, StorageEndpoint,
};
use crate::traits::Output;
use std::collections::{BTreeMap, BTreeSet};

/// Key of the file-upload storage endpoint
pub const FILE_UPLOAD_ENDPOINT: &str = "$default";

#[derive(Debug, Clone, PartialEq)]
pub struct DroppedEndpoint {
    pub name: String,
    pub kind: EndpointKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SanitizeReport {
    pub endpoints_kept: usize,
    pub dropped_endpoints: Vec<DroppedEndpoint>,
    /// (route, endpoint it pointed at)
    pub dropped_routes: Vec<(String, String)>,
    pub dropped_identities: Vec<String>,
    /// Surviving user-assigned identities, when the hub has an identity block
    pub identities: Option<BTreeSet<String>>,
    pub file_upload_cleared: bool,
}

pub struct Sanitizer<'a> {
    resources: &'a dyn ResourceCli,
    output: &'a dyn Output,
    default_resource_group: Option<&'a str>,
    default_subscription: Option<&'a str>,
}

impl<'a> Sanitizer<'a> {
    pub fn new(resources: &'a dyn ResourceCli, output: &'a dyn Output) -> Self {
        Self {
            resources,
            output,
            default_resource_group: None,
            default_subscription: None,
        }
    }

    /// Resource group and subscription assumed for endpoints that do not name one
    pub fn with_defaults(
        mut self,
        resource_group: Option<&'a str>,
        subscription: Option<&'a str>,
    ) -> Self {
        self.default_resource_group = resource_group;
        self.default_subscription = subscription;
        self
    }

    pub fn sanitize(&self, template: &mut ArmTemplate) -> HubResult<SanitizeReport> {
        let mut report = SanitizeReport::default();
        let Some(hub) = template.hub_resource_mut() else {
            return Ok(report);
        };

        let removed = match hub.identity.as_mut() {
            Some(identity) => {
                let (kept, removed) = self.reconcile_identities(identity);
                report.identities = Some(kept);
                report.dropped_identities = removed.iter().cloned().collect();
                removed
            }
            None => BTreeSet::new(),
        };
        let removed_lower: BTreeSet<String> =
            removed.iter().map(|id| id.to_ascii_lowercase()).collect();

        let mut properties = hub
            .hub_properties()
            .map_err(|e| HubError::parse("hub properties", e))?;

        if let Some(routing) = properties.routing.as_mut() {
            report.dropped_endpoints = self.reconcile_endpoints(&mut routing.endpoints, &removed_lower);
            report.endpoints_kept = routing.endpoints.len();

            let survivors = routing.endpoints.names();
            for (route, endpoint) in prune_routes(routing, &survivors) {
                self.output.warning(&format!(
                    "Route '{}' dropped: endpoint '{}' is no longer available",
                    route, endpoint
                ));
                tracing::warn!(%route, %endpoint, "route dropped");
                report.dropped_routes.push((route, endpoint));
            }
        }

        if let Some(storage) = properties.storage_endpoints.as_mut() {
            report.file_upload_cleared = self.refresh_file_upload(storage);
        }

        hub.set_hub_properties(&properties)
            .map_err(|e| HubError::parse("hub properties", e))?;
        Ok(report)
    }

    /// Probe every user-assigned identity; returns (kept, removed)
    fn reconcile_identities(
        &self,
        identity: &mut ResourceIdentity,
    ) -> (BTreeSet<String>, BTreeSet<String>) {
        let mut kept = BTreeSet::new();
        let mut removed = BTreeSet::new();

        for id in identity.user_assigned_ids() {
            match self.resources.probe_identity(&id) {
                Ok(()) => {
                    kept.insert(id);
                }
                Err(e) => {
                    self.output
                        .warning(&format!("Identity '{}' dropped: {}", id, e));
                    tracing::warn!(identity = %id, error = %e, "identity dropped");
                    removed.insert(id);
                }
            }
        }

        if !removed.is_empty() {
            if let Some(ids) = identity.user_assigned_identities.as_mut() {
                ids.retain(|id, _| !removed.contains(id));
            }
            identity.refresh_kind();
        }
        (kept, removed)
    }

    fn reconcile_endpoints(
        &self,
        endpoints: &mut RoutingEndpoints,
        removed_identities: &BTreeSet<String>,
    ) -> Vec<DroppedEndpoint> {
        let mut dropped = Vec::new();

        for kind in EndpointKind::ALL {
            let list = std::mem::take(endpoints.of_kind_mut(kind));
            let mut kept = Vec::with_capacity(list.len());

            for mut endpoint in list {
                match self.reconcile_endpoint(kind, &mut endpoint, removed_identities) {
                    Ok(()) => kept.push(endpoint),
                    Err(reason) => {
                        self.output.warning(&format!(
                            "{} endpoint '{}' dropped: {}",
                            kind.label(),
                            endpoint.name,
                            reason
                        ));
                        tracing::warn!(endpoint = %endpoint.name, %reason, "endpoint dropped");
                        dropped.push(DroppedEndpoint {
                            name: endpoint.name,
                            kind,
                            reason,
                        });
                    }
                }
            }
            *endpoints.of_kind_mut(kind) = kept;
        }
        dropped
    }

    /// Refresh or verify one endpoint; `Err` carries the reason it must go
    fn reconcile_endpoint(
        &self,
        kind: EndpointKind,
        endpoint: &mut Endpoint,
        removed_identities: &BTreeSet<String>,
    ) -> Result<(), String> {
        let identity = match endpoint.auth() {
            EndpointAuth::KeyBased => None,
            EndpointAuth::IdentityBased(id) => Some(id.map(str::to_string)),
        };

        let locator = match &identity {
            Some(Some(id)) if removed_identities.contains(&id.to_ascii_lowercase()) => {
                return Err(format!("its identity '{}' was removed", id));
            }
            _ => self.locate(kind, endpoint)?,
        };

        if identity.is_some() {
            return self
                .resources
                .probe(&locator)
                .map_err(|e| format!("{} is not reachable: {}", locator.describe(), e));
        }

        let secret = self
            .resources
            .resolve_secret(&locator)
            .map_err(|e| format!("could not fetch keys of {}: {}", locator.describe(), e))?;
        apply_secret(endpoint, secret);
        Ok(())
    }

    fn locate(&self, kind: EndpointKind, endpoint: &Endpoint) -> Result<ResourceLocator, String> {
        let resource_group = endpoint
            .resource_group
            .as_deref()
            .or(self.default_resource_group)
            .ok_or_else(|| "its resource group is unknown".to_string())?;
        let subscription_id = endpoint
            .subscription_id
            .as_deref()
            .or(self.default_subscription)
            .map(str::to_string);

        let kind = resource_kind(kind, endpoint)
            .ok_or_else(|| "its backing resource cannot be determined".to_string())?;
        Ok(ResourceLocator {
            kind,
            subscription_id,
            resource_group: Some(resource_group.to_string()),
        })
    }

    /// Returns whether the connection string had to be cleared
    fn refresh_file_upload(&self, storage: &mut BTreeMap<String, StorageEndpoint>) -> bool {
        let Some(endpoint) = storage.get_mut(FILE_UPLOAD_ENDPOINT) else {
            return false;
        };
        if endpoint.authentication_type == Some(AuthenticationType::IdentityBased) {
            return false;
        }
        let Some(raw) = endpoint.connection_string.as_deref().filter(|cs| !cs.is_empty()) else {
            return false;
        };

        let cs = ConnectionString::parse(raw);
        // The connection string does not name a resource group
        let result = match cs.get("AccountName") {
            Some(account) => {
                let locator = ResourceLocator {
                    kind: ResourceKind::Storage {
                        account: account.to_string(),
                    },
                    subscription_id: self.default_subscription.map(str::to_string),
                    resource_group: None,
                };
                self.resources.resolve_secret(&locator).map_err(|e| e.to_string())
            }
            None => Err("storage account cannot be determined".to_string()),
        };

        match result {
            Ok(ResolvedSecret::ConnectionString(fresh)) => {
                endpoint.connection_string = Some(fresh);
                false
            }
            other => {
                let reason = match other {
                    Err(e) => e,
                    Ok(_) => "unexpected key format".to_string(),
                };
                self.output.warning(&format!(
                    "File upload storage connection string cleared: {}",
                    reason
                ));
                endpoint.connection_string = Some(String::new());
                true
            }
        }
    }
}

/// Work out which resource an endpoint is backed by
pub fn resource_kind(kind: EndpointKind, endpoint: &Endpoint) -> Option<ResourceKind> {
    let cs = endpoint
        .connection_string
        .as_deref()
        .map(ConnectionString::parse)
        .unwrap_or_default();
    let uri_label = || endpoint.endpoint_uri.as_deref().and_then(host_label);

    let messaging = || -> Option<(String, String, Option<String>)> {
        let namespace = cs.endpoint_namespace().or_else(uri_label)?;
        let entity = endpoint
            .entity_path
            .clone()
            .or_else(|| cs.get("EntityPath").map(str::to_string))?;
        let policy = cs.get("SharedAccessKeyName").map(str::to_string);
        Some((namespace, entity, policy))
    };

    match kind {
        EndpointKind::EventHub => messaging().map(|(namespace, entity, policy)| {
            ResourceKind::EventHub {
                namespace,
                entity,
                policy,
            }
        }),
        EndpointKind::ServiceBusQueue => messaging().map(|(namespace, entity, policy)| {
            ResourceKind::ServiceBusQueue {
                namespace,
                entity,
                policy,
            }
        }),
        EndpointKind::ServiceBusTopic => messaging().map(|(namespace, entity, policy)| {
            ResourceKind::ServiceBusTopic {
                namespace,
                entity,
                policy,
            }
        }),
        EndpointKind::StorageContainer => cs
            .get("AccountName")
            .map(str::to_string)
            .or_else(uri_label)
            .map(|account| ResourceKind::Storage { account }),
        EndpointKind::CosmosDbCollection => {
            uri_label().map(|account| ResourceKind::Cosmos { account })
        }
    }
}

fn apply_secret(endpoint: &mut Endpoint, secret: ResolvedSecret) {
    match secret {
        ResolvedSecret::ConnectionString(cs) => endpoint.connection_string = Some(cs),
        ResolvedSecret::AccountKeys { primary, secondary } => {
            endpoint.primary_key = Some(primary);
            endpoint.secondary_key = secondary;
        }
    }
}

/// Remove routes whose endpoint did not survive and strip dead endpoint
/// names from enrichments; returns (route, endpoint) for each removed route
pub fn prune_routes(routing: &mut Routing, survivors: &BTreeSet<String>) -> Vec<(String, String)> {
    let valid = |name: &str| name == BUILT_IN_ENDPOINT || survivors.contains(name);
    let mut dropped = Vec::new();

    routing.routes.retain(|route| match route.target() {
        Some(target) if valid(target) => true,
        target => {
            dropped.push((
                route.name.clone(),
                target.unwrap_or("<none>").to_string(),
            ));
            false
        }
    });

    for enrichment in routing.enrichments.iter_mut() {
        enrichment.endpoint_names.retain(|name| valid(name));
    }
    routing
        .enrichments
        .retain(|enrichment| !enrichment.endpoint_names.is_empty());

    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::model::{ArmResource, HUB_RESOURCE_TYPE, Route};
    use crate::test_helpers::FakeCloud;
    use crate::traits::MockOutput;
    use serde_json::json;

    fn template(properties: serde_json::Value, identity: Option<serde_json::Value>) -> ArmTemplate {
        ArmTemplate {
            resources: vec![ArmResource {
                resource_type: HUB_RESOURCE_TYPE.to_string(),
                name: "hub1".into(),
                properties: Some(properties),
                identity: identity.map(|i| serde_json::from_value(i).unwrap()),
                ..ArmResource::default()
            }],
            ..ArmTemplate::default()
        }
    }

    fn routing_of(template: &ArmTemplate) -> Routing {
        template
            .hub_resource()
            .unwrap()
            .hub_properties()
            .unwrap()
            .routing
            .unwrap()
    }

    fn sanitize(cloud: &FakeCloud, output: &MockOutput, template: &mut ArmTemplate) -> SanitizeReport {
        Sanitizer::new(cloud, output)
            .with_defaults(Some("rg"), Some("sub"))
            .sanitize(template)
            .unwrap()
    }

    #[test]
    fn test_failed_key_resolution_drops_endpoint_and_route() {
        let cloud = FakeCloud::new();
        cloud.fail_secret("eh1");
        let output = MockOutput::new();
        let mut template = template(
            json!({
                "routing": {
                    "endpoints": {
                        "eventHubs": [{
                            "name": "ep1",
                            "connectionString": "Endpoint=sb://ns1.servicebus.windows.net:5671/;SharedAccessKeyName=send;SharedAccessKey=****;EntityPath=eh1",
                            "resourceGroup": "rg"
                        }]
                    },
                    "routes": [{"name": "r1", "source": "DeviceMessages", "endpointNames": ["ep1"], "isEnabled": true}]
                }
            }),
            None,
        );

        let report = sanitize(&cloud, &output, &mut template);

        let routing = routing_of(&template);
        assert!(routing.endpoints.event_hubs.is_empty());
        assert!(routing.routes.is_empty());
        assert_eq!(report.dropped_endpoints[0].name, "ep1");
        assert_eq!(report.dropped_routes, vec![("r1".to_string(), "ep1".to_string())]);
        assert!(output.has_warning_containing("endpoint 'ep1' dropped"));
        assert!(output.has_warning_containing("Route 'r1' dropped"));
    }

    #[test]
    fn test_key_based_endpoint_gets_fresh_connection_string() {
        let cloud = FakeCloud::new();
        let output = MockOutput::new();
        let mut template = template(
            json!({
                "routing": {
                    "endpoints": {
                        "serviceBusQueues": [{
                            "name": "q-ep",
                            "connectionString": "Endpoint=sb://ns2.servicebus.windows.net/;SharedAccessKeyName=send;SharedAccessKey=****;EntityPath=orders"
                        }]
                    },
                    "routes": [{"name": "r1", "source": "DeviceMessages", "endpointNames": ["q-ep"], "isEnabled": true}]
                }
            }),
            None,
        );

        let report = sanitize(&cloud, &output, &mut template);

        let routing = routing_of(&template);
        let cs = routing.endpoints.service_bus_queues[0]
            .connection_string
            .clone()
            .unwrap();
        assert!(!cs.contains("****"));
        assert_eq!(routing.routes.len(), 1);
        assert_eq!(report.endpoints_kept, 1);
        assert!(cloud.journal().contains(&"resolve_secret:orders".to_string()));
    }

    #[test]
    fn test_removed_identity_cascades_to_endpoints() {
        let cloud = FakeCloud::new();
        let gone = "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.ManagedIdentity/userAssignedIdentities/gone";
        let alive = "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.ManagedIdentity/userAssignedIdentities/alive";
        cloud.remove_identity(gone);
        let output = MockOutput::new();
        let mut template = template(
            json!({
                "routing": {
                    "endpoints": {
                        "eventHubs": [
                            {
                                "name": "uses-gone",
                                "authenticationType": "identityBased",
                                "identity": {"userAssignedIdentity": gone},
                                "endpointUri": "sb://ns1.servicebus.windows.net",
                                "entityPath": "eh1"
                            },
                            {
                                "name": "uses-alive",
                                "authenticationType": "identityBased",
                                "identity": {"userAssignedIdentity": alive},
                                "endpointUri": "sb://ns1.servicebus.windows.net",
                                "entityPath": "eh2"
                            }
                        ],
                        "storageContainers": [{
                            "name": "uses-system",
                            "authenticationType": "identityBased",
                            "endpointUri": "https://acct.blob.core.windows.net/",
                            "containerName": "c1"
                        }]
                    },
                    "routes": [
                        {"name": "to-gone", "source": "DeviceMessages", "endpointNames": ["uses-gone"], "isEnabled": true},
                        {"name": "to-alive", "source": "DeviceMessages", "endpointNames": ["uses-alive"], "isEnabled": true}
                    ]
                }
            }),
            Some(json!({
                "type": "SystemAssigned, UserAssigned",
                "userAssignedIdentities": {gone: {}, alive: {}}
            })),
        );

        let report = sanitize(&cloud, &output, &mut template);

        assert_eq!(report.dropped_identities, vec![gone.to_string()]);
        assert_eq!(
            report.identities.unwrap().into_iter().collect::<Vec<_>>(),
            vec![alive.to_string()]
        );
        let routing = routing_of(&template);
        let names = routing.endpoints.names();
        assert!(!names.contains("uses-gone"));
        assert!(names.contains("uses-alive"));
        assert!(names.contains("uses-system"));
        assert_eq!(routing.routes.len(), 1);
        assert_eq!(routing.routes[0].name, "to-alive");

        let identity = template.hub_resource().unwrap().identity.clone().unwrap();
        assert_eq!(identity.kind, "SystemAssigned, UserAssigned");
        assert_eq!(identity.user_assigned_ids(), vec![alive.to_string()]);
    }

    #[test]
    fn test_identity_endpoint_probe_failure_drops_endpoint() {
        let cloud = FakeCloud::new();
        cloud.fail_probe("acct");
        let output = MockOutput::new();
        let mut template = template(
            json!({
                "routing": {
                    "endpoints": {
                        "cosmosDBSqlContainers": [{
                            "name": "cosmos",
                            "authenticationType": "identityBased",
                            "endpointUri": "https://acct.documents.azure.com:443/",
                            "databaseName": "db"
                        }]
                    }
                }
            }),
            None,
        );

        let report = sanitize(&cloud, &output, &mut template);

        assert_eq!(report.dropped_endpoints.len(), 1);
        assert_eq!(report.dropped_endpoints[0].kind, EndpointKind::CosmosDbCollection);
    }

    #[test]
    fn test_undeterminable_endpoint_is_dropped() {
        let cloud = FakeCloud::new();
        let output = MockOutput::new();
        let mut template = template(
            json!({"routing": {"endpoints": {"serviceBusTopics": [{"name": "mystery"}]}}}),
            None,
        );

        let report = sanitize(&cloud, &output, &mut template);

        assert_eq!(report.dropped_endpoints[0].name, "mystery");
        assert!(report.dropped_endpoints[0].reason.contains("cannot be determined"));
    }

    #[test]
    fn test_file_upload_connection_string_cleared_on_failure() {
        let cloud = FakeCloud::new();
        cloud.fail_secret("uploads");
        let output = MockOutput::new();
        let mut template = template(
            json!({
                "storageEndpoints": {
                    "$default": {
                        "connectionString": "DefaultEndpointsProtocol=https;AccountName=uploads;AccountKey=****",
                        "containerName": "files"
                    }
                },
                "cloudToDevice": {"maxDeliveryCount": 10}
            }),
            None,
        );

        let report = sanitize(&cloud, &output, &mut template);

        assert!(report.file_upload_cleared);
        let properties = template.hub_resource().unwrap().hub_properties().unwrap();
        let storage = &properties.storage_endpoints.unwrap()[FILE_UPLOAD_ENDPOINT];
        assert_eq!(storage.connection_string.as_deref(), Some(""));
        assert_eq!(storage.container_name.as_deref(), Some("files"));
        // Opaque settings pass through untouched
        assert_eq!(properties.extra["cloudToDevice"]["maxDeliveryCount"], 10);
    }

    #[test]
    fn test_file_upload_account_in_another_resource_group() {
        let cloud = FakeCloud::new();
        cloud.place_resource("uploads", "rg-storage");
        let output = MockOutput::new();
        let mut template = template(
            json!({
                "storageEndpoints": {
                    "$default": {
                        "connectionString": "DefaultEndpointsProtocol=https;AccountName=uploads;AccountKey=****",
                        "containerName": "files"
                    }
                }
            }),
            None,
        );

        let report = sanitize(&cloud, &output, &mut template);

        assert!(!report.file_upload_cleared);
        let properties = template.hub_resource().unwrap().hub_properties().unwrap();
        let storage = &properties.storage_endpoints.unwrap()[FILE_UPLOAD_ENDPOINT];
        assert!(
            storage
                .connection_string
                .as_deref()
                .unwrap()
                .contains("AccountName=uploads;AccountKey=ZnJlc2g=")
        );
        assert!(output.get_warnings().is_empty());
    }

    #[test]
    fn test_no_surviving_route_references_missing_endpoint() {
        let survivors: BTreeSet<String> = ["a", "c"].iter().map(|s| s.to_string()).collect();
        let route = |name: &str, target: Option<&str>| Route {
            name: name.into(),
            source: "DeviceMessages".into(),
            endpoint_names: target.map(|t| vec![t.to_string()]).unwrap_or_default(),
            condition: None,
            is_enabled: true,
        };
        let mut routing = Routing {
            routes: vec![
                route("r-a", Some("a")),
                route("r-b", Some("b")),
                route("r-events", Some(BUILT_IN_ENDPOINT)),
                route("r-c", Some("c")),
                route("r-none", None),
            ],
            enrichments: vec![
                serde_json::from_value(json!({"key": "k1", "value": "v", "endpointNames": ["a", "b"]})).unwrap(),
                serde_json::from_value(json!({"key": "k2", "value": "v", "endpointNames": ["b"]})).unwrap(),
            ],
            ..Routing::default()
        };

        let dropped = prune_routes(&mut routing, &survivors);

        assert_eq!(dropped.len(), 2);
        for route in &routing.routes {
            let target = route.target().unwrap();
            assert!(target == BUILT_IN_ENDPOINT || survivors.contains(target));
        }
        assert_eq!(routing.enrichments.len(), 1);
        assert_eq!(routing.enrichments[0].endpoint_names, vec!["a".to_string()]);
    }

    #[test]
    fn test_template_without_hub_is_untouched() {
        let cloud = FakeCloud::new();
        let output = MockOutput::new();
        let mut template = ArmTemplate::default();

        let report = sanitize(&cloud, &output, &mut template);

        assert_eq!(report, SanitizeReport::default());
    }
}
