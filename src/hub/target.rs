//! Resolves a hub name or a connection string into a [`Target`].

use super::connection_string::ConnectionString;
use super::control::{AccessPolicy, ControlPlane, HubResource};
use super::error::{HubError, HubResult};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Rights a policy needs to read and write registry, twins and configurations
pub const PRIVILEGED_RIGHTS: [&str; 3] = ["RegistryWrite", "ServiceConnect", "DeviceConnect"];

/// Resolved connection descriptor for one hub
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Target {
    pub host: String,
    pub policy_name: String,
    pub primary_key: String,
    pub secondary_key: Option<String>,
    pub subscription_id: Option<String>,
    pub resource_group: Option<String>,
    /// Hub name (first label of the host)
    pub entity_name: String,
    pub location: Option<String>,
    pub sku_tier: Option<String>,
    pub resource_id: Option<String>,
}

impl Target {
    /// Build a target from a hub connection string without any network call
    pub fn from_connection_string(raw: &str) -> HubResult<Self> {
        let cs = ConnectionString::parse(raw);
        let missing = |key: &str| {
            HubError::InvalidArgument(format!("connection string is missing '{}'", key))
        };
        let host = cs.get("HostName").ok_or_else(|| missing("HostName"))?;
        let policy_name = cs
            .get("SharedAccessKeyName")
            .ok_or_else(|| missing("SharedAccessKeyName"))?;
        let primary_key = cs
            .get("SharedAccessKey")
            .ok_or_else(|| missing("SharedAccessKey"))?;

        Ok(Self {
            host: host.to_string(),
            policy_name: policy_name.to_string(),
            primary_key: primary_key.to_string(),
            entity_name: host.split('.').next().unwrap_or(host).to_string(),
            ..Self::default()
        })
    }

    fn from_hub(hub: &HubResource, policy: &AccessPolicy) -> Self {
        let host = hub
            .host_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.azure-devices.net", hub.name));
        Self {
            host,
            policy_name: policy.key_name.clone(),
            primary_key: policy.primary_key.clone(),
            secondary_key: policy.secondary_key.clone(),
            subscription_id: non_empty(&hub.subscription_id),
            resource_group: non_empty(&hub.resource_group),
            entity_name: hub.name.clone(),
            location: non_empty(&hub.location),
            sku_tier: hub.sku_tier().map(str::to_string),
            resource_id: non_empty(&hub.id),
        }
    }

    /// Whether the management plane can be reached for this target
    pub fn has_control_plane(&self) -> bool {
        self.resource_group.is_some() && self.resource_id.is_some()
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// How the user identified a hub on the command line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HubSpec {
    pub name: Option<String>,
    pub resource_group: Option<String>,
    pub login: Option<String>,
    pub policy_name: Option<String>,
}

impl HubSpec {
    pub fn describe(&self) -> String {
        match (&self.name, &self.login) {
            (Some(name), _) => name.clone(),
            (None, Some(login)) => Target::from_connection_string(login)
                .map(|t| t.entity_name)
                .unwrap_or_else(|_| "<connection string>".to_string()),
            (None, None) => "<unspecified>".to_string(),
        }
    }
}

pub struct TargetResolver {
    control: Arc<dyn ControlPlane>,
}

impl TargetResolver {
    pub fn new(control: Arc<dyn ControlPlane>) -> Self {
        Self { control }
    }

    /// Resolve a hub that must exist
    pub fn resolve(&self, spec: &HubSpec) -> HubResult<Target> {
        self.find(spec)?.ok_or_else(|| {
            HubError::NotFound(format!(
                "IoT Hub '{}' not found in the current subscription{}",
                spec.describe(),
                spec.resource_group
                    .as_deref()
                    .map(|rg| format!(" (resource group '{}')", rg))
                    .unwrap_or_default()
            ))
        })
    }

    /// Resolve a hub that may not exist yet
    pub fn find(&self, spec: &HubSpec) -> HubResult<Option<Target>> {
        if let Some(login) = &spec.login {
            return Target::from_connection_string(login).map(Some);
        }

        let Some(hub) = self.find_hub(spec)? else {
            return Ok(None);
        };
        let policies = self
            .control
            .list_policies(&hub.name, &hub.resource_group)?;
        let policy = select_policy(&policies, spec.policy_name.as_deref(), &hub.name)?;
        tracing::debug!(hub = %hub.name, policy = %policy.key_name, "resolved hub target");
        Ok(Some(Target::from_hub(&hub, policy)))
    }

    /// Locate the hub resource by case-insensitive name
    pub fn find_hub(&self, spec: &HubSpec) -> HubResult<Option<HubResource>> {
        let name = spec.name.as_deref().ok_or_else(|| {
            HubError::InvalidArgument("either a hub name or a connection string is required".into())
        })?;

        let hubs = self
            .control
            .list_hubs(spec.resource_group.as_deref())
            .map_err(|e| HubError::NotFound(format!("Failed to list IoT Hubs: {}", e)))?;

        Ok(hubs
            .into_iter()
            .find(|hub| hub.name.eq_ignore_ascii_case(name)))
    }
}

/// Pick the requested policy, or the first whose rights are exactly the
/// privileged set, or the first that covers it
pub fn select_policy<'a>(
    policies: &'a [AccessPolicy],
    requested: Option<&str>,
    hub_name: &str,
) -> HubResult<&'a AccessPolicy> {
    if let Some(requested) = requested {
        return policies
            .iter()
            .find(|p| p.key_name.eq_ignore_ascii_case(requested))
            .ok_or_else(|| {
                HubError::Auth(format!(
                    "policy '{}' not found on hub '{}'",
                    requested, hub_name
                ))
            });
    }

    let privileged: BTreeSet<String> = PRIVILEGED_RIGHTS.iter().map(|r| r.to_string()).collect();
    policies
        .iter()
        .find(|p| p.rights_set() == privileged)
        .or_else(|| policies.iter().find(|p| p.rights_set().is_superset(&privileged)))
        .ok_or_else(|| {
            HubError::Auth(format!(
                "no policy on hub '{}' grants {}",
                hub_name,
                PRIVILEGED_RIGHTS.join(", ")
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::FakeCloud;

    fn policy(name: &str, rights: &str) -> AccessPolicy {
        AccessPolicy {
            key_name: name.into(),
            primary_key: format!("{}-key", name),
            secondary_key: None,
            rights: rights.into(),
        }
    }

    #[test]
    fn test_login_path_needs_no_network() {
        let target = Target::from_connection_string(
            "HostName=myhub.azure-devices.net;SharedAccessKeyName=iothubowner;SharedAccessKey=a2V5",
        )
        .unwrap();

        assert_eq!(target.host, "myhub.azure-devices.net");
        assert_eq!(target.entity_name, "myhub");
        assert_eq!(target.policy_name, "iothubowner");
        assert_eq!(target.primary_key, "a2V5");
        assert!(target.resource_group.is_none());
        assert!(!target.has_control_plane());
    }

    #[test]
    fn test_login_path_rejects_incomplete_string() {
        let err = Target::from_connection_string("HostName=myhub.azure-devices.net").unwrap_err();
        assert!(matches!(err, HubError::InvalidArgument(_)));
    }

    #[test]
    fn test_select_policy_prefers_exact_rights() {
        let policies = vec![
            policy("registryRead", "RegistryRead"),
            policy("iothubowner", "RegistryWrite, ServiceConnect, DeviceConnect, RegistryRead"),
            policy("exact", "RegistryWrite, ServiceConnect, DeviceConnect"),
        ];
        assert_eq!(select_policy(&policies, None, "hub").unwrap().key_name, "exact");

        let no_exact = &policies[..2];
        assert_eq!(
            select_policy(no_exact, None, "hub").unwrap().key_name,
            "iothubowner"
        );
    }

    #[test]
    fn test_select_policy_honors_requested_name() {
        let policies = vec![
            policy("exact", "RegistryWrite, ServiceConnect, DeviceConnect"),
            policy("service", "ServiceConnect"),
        ];
        assert_eq!(
            select_policy(&policies, Some("SERVICE"), "hub").unwrap().key_name,
            "service"
        );
        assert!(matches!(
            select_policy(&policies, Some("missing"), "hub"),
            Err(HubError::Auth(_))
        ));
    }

    #[test]
    fn test_select_policy_without_rights_is_auth_error() {
        let policies = vec![policy("device", "DeviceConnect")];
        assert!(matches!(
            select_policy(&policies, None, "hub"),
            Err(HubError::Auth(_))
        ));
    }

    #[test]
    fn test_discovery_matches_name_case_insensitively() {
        let cloud = FakeCloud::new();
        cloud.add_hub("MyHub", "rg");
        let resolver = TargetResolver::new(cloud.clone());

        let target = resolver
            .resolve(&HubSpec {
                name: Some("myhub".into()),
                ..HubSpec::default()
            })
            .unwrap();

        assert_eq!(target.entity_name, "MyHub");
        assert_eq!(target.resource_group.as_deref(), Some("rg"));
        assert_eq!(target.policy_name, "iothubowner");
        assert!(target.has_control_plane());
    }

    #[test]
    fn test_missing_hub() {
        let cloud = FakeCloud::new();
        let resolver = TargetResolver::new(cloud);
        let spec = HubSpec {
            name: Some("ghost".into()),
            ..HubSpec::default()
        };

        assert!(resolver.find(&spec).unwrap().is_none());
        assert!(matches!(resolver.resolve(&spec), Err(HubError::NotFound(_))));
    }
}
