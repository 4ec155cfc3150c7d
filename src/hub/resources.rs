//! Access to the resources routing endpoints and identities point at:
//! key listing for connection strings and lightweight existence probes.

use super::az::AzCli;
use super::connection_string::ConnectionString;
use super::error::{HubError, HubResult};
use serde_json::Value;

/// Shared access rule used when an endpoint does not name its own
pub const DEFAULT_NAMESPACE_RULE: &str = "RootManageSharedAccessKey";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    EventHub {
        namespace: String,
        entity: String,
        policy: Option<String>,
    },
    ServiceBusQueue {
        namespace: String,
        entity: String,
        policy: Option<String>,
    },
    ServiceBusTopic {
        namespace: String,
        entity: String,
        policy: Option<String>,
    },
    Storage {
        account: String,
    },
    Cosmos {
        account: String,
    },
}

/// Where an endpoint's backing resource lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLocator {
    pub kind: ResourceKind,
    pub subscription_id: Option<String>,
    /// `None` lets the CLI find the resource anywhere in the subscription
    pub resource_group: Option<String>,
}

impl ResourceLocator {
    pub fn describe(&self) -> String {
        match &self.kind {
            ResourceKind::EventHub { namespace, entity, .. } => {
                format!("event hub '{}/{}'", namespace, entity)
            }
            ResourceKind::ServiceBusQueue { namespace, entity, .. } => {
                format!("queue '{}/{}'", namespace, entity)
            }
            ResourceKind::ServiceBusTopic { namespace, entity, .. } => {
                format!("topic '{}/{}'", namespace, entity)
            }
            ResourceKind::Storage { account } => format!("storage account '{}'", account),
            ResourceKind::Cosmos { account } => format!("Cosmos DB account '{}'", account),
        }
    }
}

/// Fresh secret material for a key-based endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSecret {
    ConnectionString(String),
    AccountKeys {
        primary: String,
        secondary: Option<String>,
    },
}

pub trait ResourceCli: Send + Sync {
    /// List keys of the resource and return usable secret material
    fn resolve_secret(&self, locator: &ResourceLocator) -> HubResult<ResolvedSecret>;

    /// Succeeds when the resource exists and is visible
    fn probe(&self, locator: &ResourceLocator) -> HubResult<()>;

    /// Succeeds when the user-assigned identity exists
    fn probe_identity(&self, resource_id: &str) -> HubResult<()>;
}

/// `ResourceCli` backed by the Azure CLI
pub struct AzResourceCli {
    az: AzCli,
}

impl AzResourceCli {
    pub fn new(az: AzCli) -> Self {
        Self { az }
    }

    fn invoke_scoped(&self, args: &[&str], locator: &ResourceLocator) -> HubResult<Value> {
        let mut args: Vec<&str> = args.to_vec();
        if let Some(resource_group) = &locator.resource_group {
            args.extend(["--resource-group", resource_group.as_str()]);
        }
        if let Some(sub) = &locator.subscription_id {
            args.extend(["--subscription", sub.as_str()]);
        }
        self.az.invoke(&args)
    }

    /// Entity-level rule first, then the namespace rule with `EntityPath` appended
    fn messaging_connection_string(
        &self,
        service: &str,
        entity_type: &str,
        namespace: &str,
        entity: &str,
        policy: Option<&str>,
        locator: &ResourceLocator,
    ) -> HubResult<String> {
        if let Some(policy) = policy {
            let entity_flag = format!("--{}-name", entity_type);
            let entity_level = self.invoke_scoped(
                &[
                    service,
                    entity_type,
                    "authorization-rule",
                    "keys",
                    "list",
                    "--namespace-name",
                    namespace,
                    &entity_flag,
                    entity,
                    "--name",
                    policy,
                ],
                locator,
            );
            match entity_level.and_then(|v| primary_connection_string(&v)) {
                Ok(cs) => return Ok(cs),
                Err(e) => {
                    tracing::debug!(%namespace, %entity, error = %e, "entity rule unavailable, trying namespace rule")
                }
            }
        }

        let rule = policy.unwrap_or(DEFAULT_NAMESPACE_RULE);
        let value = self.invoke_scoped(
            &[
                service,
                "namespace",
                "authorization-rule",
                "keys",
                "list",
                "--namespace-name",
                namespace,
                "--name",
                rule,
            ],
            locator,
        )?;
        let cs = primary_connection_string(&value)?;
        Ok(with_entity_path(&cs, entity))
    }
}

fn primary_connection_string(value: &Value) -> HubResult<String> {
    value
        .get("primaryConnectionString")
        .or_else(|| value.get("connectionString"))
        .and_then(Value::as_str)
        .filter(|cs| !cs.is_empty())
        .map(str::to_string)
        .ok_or_else(|| HubError::parse("key listing", "no connection string in response"))
}

/// Append `EntityPath` unless the connection string already names one
pub fn with_entity_path(connection_string: &str, entity: &str) -> String {
    if ConnectionString::parse(connection_string).get("EntityPath").is_some() {
        return connection_string.to_string();
    }
    format!(
        "{};EntityPath={}",
        connection_string.trim_end_matches(';'),
        entity
    )
}

impl ResourceCli for AzResourceCli {
    fn resolve_secret(&self, locator: &ResourceLocator) -> HubResult<ResolvedSecret> {
        match &locator.kind {
            ResourceKind::EventHub {
                namespace,
                entity,
                policy,
            } => self
                .messaging_connection_string(
                    "eventhubs",
                    "eventhub",
                    namespace,
                    entity,
                    policy.as_deref(),
                    locator,
                )
                .map(ResolvedSecret::ConnectionString),
            ResourceKind::ServiceBusQueue {
                namespace,
                entity,
                policy,
            } => self
                .messaging_connection_string(
                    "servicebus",
                    "queue",
                    namespace,
                    entity,
                    policy.as_deref(),
                    locator,
                )
                .map(ResolvedSecret::ConnectionString),
            ResourceKind::ServiceBusTopic {
                namespace,
                entity,
                policy,
            } => self
                .messaging_connection_string(
                    "servicebus",
                    "topic",
                    namespace,
                    entity,
                    policy.as_deref(),
                    locator,
                )
                .map(ResolvedSecret::ConnectionString),
            ResourceKind::Storage { account } => {
                let value = self.invoke_scoped(
                    &["storage", "account", "show-connection-string", "--name", account],
                    locator,
                )?;
                primary_connection_string(&value).map(ResolvedSecret::ConnectionString)
            }
            ResourceKind::Cosmos { account } => {
                let value = self.invoke_scoped(
                    &["cosmosdb", "keys", "list", "--name", account, "--type", "keys"],
                    locator,
                )?;
                let primary = value
                    .get("primaryMasterKey")
                    .and_then(Value::as_str)
                    .ok_or_else(|| HubError::parse("Cosmos DB keys", "missing primaryMasterKey"))?;
                Ok(ResolvedSecret::AccountKeys {
                    primary: primary.to_string(),
                    secondary: value
                        .get("secondaryMasterKey")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
            }
        }
    }

    fn probe(&self, locator: &ResourceLocator) -> HubResult<()> {
        let result = match &locator.kind {
            ResourceKind::EventHub {
                namespace, entity, ..
            } => self.invoke_scoped(
                &["eventhubs", "eventhub", "show", "--namespace-name", namespace, "--name", entity],
                locator,
            ),
            ResourceKind::ServiceBusQueue {
                namespace, entity, ..
            } => self.invoke_scoped(
                &["servicebus", "queue", "show", "--namespace-name", namespace, "--name", entity],
                locator,
            ),
            ResourceKind::ServiceBusTopic {
                namespace, entity, ..
            } => self.invoke_scoped(
                &["servicebus", "topic", "show", "--namespace-name", namespace, "--name", entity],
                locator,
            ),
            ResourceKind::Storage { account } => {
                self.invoke_scoped(&["storage", "account", "show", "--name", account], locator)
            }
            ResourceKind::Cosmos { account } => {
                self.invoke_scoped(&["cosmosdb", "show", "--name", account], locator)
            }
        };
        result.map(|_| ())
    }

    fn probe_identity(&self, resource_id: &str) -> HubResult<()> {
        self.az
            .invoke(&["identity", "show", "--ids", resource_id])
            .map(|_| ())
    }
}
