//! Builds a [`HubState`] from a live hub.
//!
//! Aspects are read independently. A read failure that makes a whole aspect
//! unavailable skips that aspect; a failure on one device or module skips
//! only that item.

use super::model::{
    Aspect, AspectSet, CERTIFICATE_RESOURCE_TYPE, ConfigurationSet, DeviceIdentity,
    DeviceIdentityRecord, DeviceRecord, HubState, ModuleIdentityRecord, ModuleRecord, Twin,
    TwinRecord, scope_to_device_id,
};
use super::pool;
use super::sanitize::{SanitizeReport, Sanitizer};
use crate::hub::{DataPlane, HubError, HubResult, Services, Target};
use crate::traits::Output;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Counters reported once a snapshot is complete
#[derive(Debug, Clone, Default)]
pub struct SnapshotStats {
    pub devices: usize,
    pub modules: usize,
    pub device_failures: usize,
    pub module_failures: usize,
    pub configurations: usize,
    pub certificates: usize,
    pub skipped_aspects: Vec<Aspect>,
    pub sanitize: Option<SanitizeReport>,
}

impl SnapshotStats {
    /// Rows for the summary box
    pub fn summary_items(&self) -> Vec<(String, String)> {
        let mut items = vec![
            ("Devices".to_string(), self.devices.to_string()),
            ("Modules".to_string(), self.modules.to_string()),
            ("Configurations".to_string(), self.configurations.to_string()),
            ("Certificates".to_string(), self.certificates.to_string()),
        ];
        if let Some(report) = &self.sanitize {
            items.push(("Endpoints kept".to_string(), report.endpoints_kept.to_string()));
            items.push((
                "Endpoints dropped".to_string(),
                report.dropped_endpoints.len().to_string(),
            ));
            items.push((
                "Routes dropped".to_string(),
                report.dropped_routes.len().to_string(),
            ));
        }
        items.push((
            "Items skipped".to_string(),
            (self.device_failures + self.module_failures).to_string(),
        ));
        if !self.skipped_aspects.is_empty() {
            items.push((
                "Aspects skipped".to_string(),
                self.skipped_aspects
                    .iter()
                    .map(Aspect::key)
                    .collect::<Vec<_>>()
                    .join(", "),
            ));
        }
        items
    }
}

struct DeviceFetch {
    record: DeviceRecord,
    module_failures: usize,
}

pub struct SnapshotBuilder<'a> {
    services: &'a Services,
    output: Arc<dyn Output>,
    workers: usize,
    page_size: usize,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(services: &'a Services, output: Arc<dyn Output>) -> Self {
        Self {
            services,
            output,
            workers: 1,
            page_size: 100,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn build(&self, target: &Target, aspects: &AspectSet) -> HubResult<(HubState, SnapshotStats)> {
        let mut state = HubState::default();
        let mut stats = SnapshotStats::default();
        let data = self.services.data.connect(target);

        for aspect in aspects {
            self.output.section(&format!("Reading {}", aspect));
            match aspect {
                Aspect::Arm => self.snapshot_arm(target, &mut state, &mut stats)?,
                Aspect::Configurations => self.snapshot_configurations(&*data, &mut state, &mut stats),
                Aspect::Devices => self.snapshot_devices(&data, &mut state, &mut stats),
            }
        }
        Ok((state, stats))
    }

    fn skip_aspect(&self, stats: &mut SnapshotStats, aspect: Aspect, err: &dyn std::fmt::Display) {
        self.output
            .warning(&format!("Skipping {} aspect: {}", aspect, err));
        tracing::warn!(%aspect, error = %err, "aspect skipped");
        stats.skipped_aspects.push(aspect);
    }

    fn snapshot_arm(
        &self,
        target: &Target,
        state: &mut HubState,
        stats: &mut SnapshotStats,
    ) -> HubResult<()> {
        let (Some(resource_group), Some(resource_id)) =
            (target.resource_group.as_deref(), target.resource_id.as_deref())
        else {
            return Err(HubError::InvalidArgument(
                "the arm aspect requires a hub name and cannot be used with a connection string"
                    .into(),
            ));
        };

        let mut template = match self
            .services
            .control
            .export_template(resource_group, resource_id)
        {
            Ok(template) => template,
            Err(e) => {
                self.skip_aspect(stats, Aspect::Arm, &e);
                return Ok(());
            }
        };
        // Certificates are captured from the listing and re-added on replay
        template
            .resources
            .retain(|r| !r.is_type(CERTIFICATE_RESOURCE_TYPE));

        match self
            .services
            .control
            .list_certificates(&target.entity_name, resource_group)
        {
            Ok(certificates) => {
                stats.certificates = certificates.len();
                state.certificates = Some(certificates.iter().map(|c| c.to_descriptor()).collect());
            }
            Err(e) => self
                .output
                .warning(&format!("Skipping certificates: {}", e)),
        }

        let report = Sanitizer::new(&*self.services.resources, &*self.output)
            .with_defaults(Some(resource_group), target.subscription_id.as_deref())
            .sanitize(&mut template);
        match report {
            Ok(report) => {
                state.identities = report.identities.clone();
                stats.sanitize = Some(report);
                state.arm = Some(template);
            }
            Err(e) => self.skip_aspect(stats, Aspect::Arm, &e),
        }
        Ok(())
    }

    fn snapshot_configurations(
        &self,
        data: &dyn DataPlane,
        state: &mut HubState,
        stats: &mut SnapshotStats,
    ) {
        match data.list_configurations(self.page_size) {
            Ok(configurations) => {
                let set = ConfigurationSet::from_configurations(configurations);
                stats.configurations = set.len();
                state.configurations = Some(set);
            }
            Err(e) => self.skip_aspect(stats, Aspect::Configurations, &e),
        }
    }

    fn snapshot_devices(
        &self,
        data: &Arc<dyn DataPlane>,
        state: &mut HubState,
        stats: &mut SnapshotStats,
    ) {
        let twins = match data.query_twins() {
            Ok(twins) => twins,
            Err(e) => {
                self.skip_aspect(stats, Aspect::Devices, &e);
                return;
            }
        };

        let total = twins.len();
        let ids: Vec<String> = twins.iter().map(|t| t.device_id.clone()).collect();
        let worker_data = data.clone();
        let worker_output = self.output.clone();
        let results = pool::run_bounded(
            self.workers,
            twins.into_iter().enumerate().collect(),
            move |(index, twin): (usize, Twin)| {
                worker_output.progress(index + 1, total, &twin.device_id);
                fetch_device(&*worker_data, &*worker_output, &twin).map_err(anyhow::Error::from)
            },
        );

        let mut devices = BTreeMap::new();
        for (device_id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(fetch) => {
                    stats.modules += fetch.record.modules.len();
                    stats.module_failures += fetch.module_failures;
                    devices.insert(device_id, fetch.record);
                }
                Err(e) => {
                    self.output
                        .warning(&format!("Skipping device '{}': {}", device_id, e));
                    tracing::warn!(device = %device_id, error = %e, "device skipped");
                    stats.device_failures += 1;
                }
            }
        }
        stats.devices = devices.len();
        state.devices = Some(devices);
    }
}

/// Edge device a device is parented to, from its parent scopes or (for
/// leaf devices) its device scope
pub fn parent_of(twin: &Twin, identity: &DeviceIdentity) -> Option<String> {
    let scope = twin
        .parent_scopes
        .first()
        .or_else(|| identity.parent_scopes.first())
        .or_else(|| {
            if identity.is_edge() {
                None
            } else {
                twin.device_scope
                    .as_ref()
                    .or(identity.device_scope.as_ref())
            }
        })?;
    scope_to_device_id(scope).filter(|parent| parent != &twin.device_id)
}

fn fetch_device(data: &dyn DataPlane, output: &dyn Output, twin: &Twin) -> HubResult<DeviceFetch> {
    let device_id = twin.device_id.as_str();
    let identity = data.get_device(device_id)?;
    let parent = parent_of(twin, &identity);

    let mut modules = BTreeMap::new();
    let mut module_failures = 0;
    for module in data.list_modules(device_id)? {
        match data.get_module_twin(device_id, &module.module_id) {
            Ok(module_twin) => {
                modules.insert(
                    module.module_id.clone(),
                    ModuleRecord {
                        identity: ModuleIdentityRecord::from_identity(&module),
                        twin: TwinRecord::from_twin(&module_twin),
                    },
                );
            }
            Err(e) => {
                output.warning(&format!(
                    "Skipping module '{}/{}': {}",
                    device_id, module.module_id, e
                ));
                module_failures += 1;
            }
        }
    }

    Ok(DeviceFetch {
        record: DeviceRecord {
            identity: DeviceIdentityRecord::from_identity(&identity),
            twin: TwinRecord::from_twin(twin),
            parent,
            modules,
        },
        module_failures,
    })
}
