//! Management-plane access: hub discovery, access policies, ARM export and
//! deployment, certificates.

use super::az::AzCli;
use super::error::{HubError, HubResult};
use crate::state::model::{ArmTemplate, CertificateDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;

/// An IoT Hub resource as listed by the management plane
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubResource {
    pub name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub location: String,
    #[serde(rename = "resourcegroup", alias = "resourceGroup", default)]
    pub resource_group: String,
    #[serde(rename = "subscriptionid", alias = "subscriptionId", default)]
    pub subscription_id: String,
    #[serde(default)]
    pub sku: Value,
    #[serde(default)]
    pub properties: Value,
}

impl HubResource {
    pub fn host_name(&self) -> Option<&str> {
        self.properties.get("hostName").and_then(Value::as_str)
    }

    pub fn sku_tier(&self) -> Option<&str> {
        self.sku.get("tier").and_then(Value::as_str)
    }

    /// Partition count of the built-in event hub endpoint
    pub fn partition_count(&self) -> Option<&Value> {
        self.properties
            .pointer("/eventHubEndpoints/events/partitionCount")
    }

    pub fn features(&self) -> Option<&Value> {
        self.properties.get("features")
    }
}

/// A shared access policy of a hub
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessPolicy {
    pub key_name: String,
    #[serde(default)]
    pub primary_key: String,
    #[serde(default)]
    pub secondary_key: Option<String>,
    #[serde(default)]
    pub rights: String,
}

impl AccessPolicy {
    /// `"RegistryWrite, ServiceConnect"` -> {RegistryWrite, ServiceConnect}
    pub fn rights_set(&self) -> BTreeSet<String> {
        self.rights
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateProperties {
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub thumbprint: Option<String>,
}

/// A hub certificate as listed by the management plane
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateResource {
    pub name: String,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub properties: CertificateProperties,
}

impl CertificateResource {
    pub fn to_descriptor(&self) -> CertificateDescriptor {
        CertificateDescriptor {
            name: self.name.clone(),
            certificate: self.properties.certificate.clone(),
            is_verified: self.properties.is_verified,
        }
    }
}

/// Management-plane operations the state engine depends on
pub trait ControlPlane: Send + Sync {
    /// Hubs in the current subscription, optionally scoped to a resource group
    fn list_hubs(&self, resource_group: Option<&str>) -> HubResult<Vec<HubResource>>;

    fn list_policies(&self, hub_name: &str, resource_group: &str) -> HubResult<Vec<AccessPolicy>>;

    /// Export the ARM template of a single resource
    fn export_template(&self, resource_group: &str, resource_id: &str) -> HubResult<ArmTemplate>;

    /// Submit a template file as a resource group deployment and wait for it
    fn deploy_template(
        &self,
        resource_group: &str,
        deployment_name: &str,
        template_path: &Path,
    ) -> HubResult<()>;

    fn list_certificates(
        &self,
        hub_name: &str,
        resource_group: &str,
    ) -> HubResult<Vec<CertificateResource>>;

    fn delete_certificate(
        &self,
        hub_name: &str,
        resource_group: &str,
        certificate_name: &str,
        etag: &str,
    ) -> HubResult<()>;
}

/// `ControlPlane` backed by the Azure CLI
pub struct AzControlPlane {
    az: AzCli,
}

impl AzControlPlane {
    pub fn new(az: AzCli) -> Self {
        Self { az }
    }
}

impl ControlPlane for AzControlPlane {
    fn list_hubs(&self, resource_group: Option<&str>) -> HubResult<Vec<HubResource>> {
        let mut args = vec!["iot", "hub", "list"];
        if let Some(rg) = resource_group {
            args.extend(["--resource-group", rg]);
        }
        self.az.invoke_as(&args)
    }

    fn list_policies(&self, hub_name: &str, resource_group: &str) -> HubResult<Vec<AccessPolicy>> {
        self.az.invoke_as(&[
            "iot",
            "hub",
            "policy",
            "list",
            "--hub-name",
            hub_name,
            "--resource-group",
            resource_group,
        ])
    }

    fn export_template(&self, resource_group: &str, resource_id: &str) -> HubResult<ArmTemplate> {
        self.az.invoke_as(&[
            "group",
            "export",
            "--name",
            resource_group,
            "--resource-ids",
            resource_id,
            "--skip-all-params",
        ])
    }

    fn deploy_template(
        &self,
        resource_group: &str,
        deployment_name: &str,
        template_path: &Path,
    ) -> HubResult<()> {
        let path = template_path.to_string_lossy();
        self.az
            .invoke(&[
                "deployment",
                "group",
                "create",
                "--resource-group",
                resource_group,
                "--name",
                deployment_name,
                "--template-file",
                &path,
            ])
            .map(|_| ())
    }

    fn list_certificates(
        &self,
        hub_name: &str,
        resource_group: &str,
    ) -> HubResult<Vec<CertificateResource>> {
        let value = self.az.invoke(&[
            "iot",
            "hub",
            "certificate",
            "list",
            "--hub-name",
            hub_name,
            "--resource-group",
            resource_group,
        ])?;
        parse_certificate_list(value)
    }

    fn delete_certificate(
        &self,
        hub_name: &str,
        resource_group: &str,
        certificate_name: &str,
        etag: &str,
    ) -> HubResult<()> {
        self.az
            .invoke(&[
                "iot",
                "hub",
                "certificate",
                "delete",
                "--hub-name",
                hub_name,
                "--resource-group",
                resource_group,
                "--name",
                certificate_name,
                "--etag",
                etag,
            ])
            .map(|_| ())
    }
}

/// Certificate listings come back either bare or wrapped in `{"value": [...]}`
fn parse_certificate_list(value: Value) -> HubResult<Vec<CertificateResource>> {
    let list = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Object(mut map) => map.remove("value").unwrap_or(Value::Array(Vec::new())),
        other => other,
    };
    serde_json::from_value(list).map_err(|e| HubError::parse("certificate list", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{MockCommandExecutor, MockCommandResult};
    use serde_json::json;
    use std::sync::Arc;

    fn control(results: Vec<MockCommandResult>) -> (AzControlPlane, Arc<MockCommandExecutor>) {
        let executor = Arc::new(MockCommandExecutor::with_outputs(results));
        (
            AzControlPlane::new(AzCli::new(executor.clone(), "az")),
            executor,
        )
    }

    #[test]
    fn test_list_hubs_parses_cli_shape() {
        let listing = json!([{
            "name": "hub1",
            "id": "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Devices/IotHubs/hub1",
            "location": "westus",
            "resourcegroup": "rg",
            "subscriptionid": "sub",
            "sku": {"name": "S1", "tier": "Standard", "capacity": 1},
            "properties": {
                "hostName": "hub1.azure-devices.net",
                "eventHubEndpoints": {"events": {"partitionCount": 4}}
            }
        }]);
        let (control, executor) = control(vec![MockCommandResult::ok(
            "az iot hub list --resource-group rg",
            &listing.to_string(),
        )]);

        let hubs = control.list_hubs(Some("rg")).unwrap();

        assert_eq!(hubs.len(), 1);
        assert_eq!(hubs[0].resource_group, "rg");
        assert_eq!(hubs[0].host_name(), Some("hub1.azure-devices.net"));
        assert_eq!(hubs[0].sku_tier(), Some("Standard"));
        assert_eq!(hubs[0].partition_count(), Some(&json!(4)));
        assert!(executor.calls()[0].starts_with("az iot hub list --resource-group rg"));
    }

    #[test]
    fn test_policy_rights_set() {
        let policy = AccessPolicy {
            key_name: "iothubowner".into(),
            rights: "RegistryWrite, ServiceConnect, DeviceConnect".into(),
            ..AccessPolicy::default()
        };
        let rights = policy.rights_set();
        assert_eq!(rights.len(), 3);
        assert!(rights.contains("ServiceConnect"));
    }

    #[test]
    fn test_certificate_list_shapes() {
        let wrapped = json!({"value": [{"name": "root", "etag": "e1", "properties": {"isVerified": true, "certificate": "MIIB"}}]});
        let certs = parse_certificate_list(wrapped).unwrap();
        assert_eq!(certs[0].to_descriptor().certificate.as_deref(), Some("MIIB"));
        assert!(certs[0].to_descriptor().is_verified);

        let bare = json!([{"name": "leaf"}]);
        assert_eq!(parse_certificate_list(bare).unwrap()[0].name, "leaf");
        assert!(parse_certificate_list(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_deploy_failure_surfaces_command_error() {
        let (control, _) = control(vec![MockCommandResult::failed(
            "az deployment group create",
            "InvalidTemplate: Deployment template validation failed",
        )]);

        let err = control
            .deploy_template("rg", "dep1", Path::new("/tmp/t.json"))
            .unwrap_err();
        assert!(matches!(err, HubError::Command { .. }));
    }
}
