//! Clears a hub's existing state before a replace-style replay.
//!
//! Deleting something that is already gone only warns, so running a reset
//! twice is harmless.

use super::model::{Aspect, AspectSet};
use crate::hub::{DataPlane, HubError, HubResult, Services, Target};
use crate::traits::Output;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResetReport {
    pub configurations_deleted: usize,
    pub devices_deleted: usize,
    pub certificates_deleted: usize,
    pub already_absent: usize,
    pub failures: usize,
}

pub struct ResetEngine<'a> {
    services: &'a Services,
    output: &'a dyn Output,
    page_size: usize,
}

impl<'a> ResetEngine<'a> {
    pub fn new(services: &'a Services, output: &'a dyn Output) -> Self {
        Self {
            services,
            output,
            page_size: 100,
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn reset(&self, target: &Target, aspects: &AspectSet) -> ResetReport {
        let mut report = ResetReport::default();
        let data = self.services.data.connect(target);

        // Reverse of replay order
        for aspect in aspects.iter().rev() {
            self.output
                .section(&format!("Clearing {} on {}", aspect, target.entity_name));
            match aspect {
                Aspect::Devices => self.reset_devices(&*data, &mut report),
                Aspect::Configurations => self.reset_configurations(&*data, &mut report),
                Aspect::Arm => self.reset_certificates(target, &mut report),
            }
        }
        report
    }

    /// Count one delete outcome, warning on already-absent items
    fn record(&self, what: &str, result: HubResult<()>, report: &mut ResetReport) -> bool {
        match result {
            Ok(()) => true,
            Err(e) if e.is_not_found() => {
                self.output
                    .warning(&format!("{} was already deleted", what));
                report.already_absent += 1;
                false
            }
            Err(e) => {
                self.output
                    .error(&format!("Failed to delete {}: {}", what, e));
                tracing::warn!(item = %what, error = %e, "delete failed");
                report.failures += 1;
                false
            }
        }
    }

    fn reset_configurations(&self, data: &dyn DataPlane, report: &mut ResetReport) {
        let configurations = match data.list_configurations(self.page_size) {
            Ok(configurations) => configurations,
            Err(e) => {
                self.output.warning(&format!(
                    "Configurations cannot be listed on this hub, nothing to delete: {}",
                    e
                ));
                return;
            }
        };

        for configuration in configurations {
            let what = format!("configuration '{}'", configuration.id);
            if self.record(&what, data.delete_configuration(&configuration.id), report) {
                report.configurations_deleted += 1;
            }
        }
    }

    fn reset_devices(&self, data: &dyn DataPlane, report: &mut ResetReport) {
        let twins = match data.query_twins() {
            Ok(twins) => twins,
            Err(e) => {
                self.output
                    .error(&format!("Failed to list devices for deletion: {}", e));
                report.failures += 1;
                return;
            }
        };

        let total = twins.len();
        for (index, twin) in twins.iter().enumerate() {
            self.output.progress(index + 1, total, &twin.device_id);
            let what = format!("device '{}'", twin.device_id);
            if self.record(&what, data.delete_device(&twin.device_id), report) {
                report.devices_deleted += 1;
            }
        }
    }

    fn reset_certificates(&self, target: &Target, report: &mut ResetReport) {
        let Some(resource_group) = target.resource_group.as_deref() else {
            return;
        };
        let control = &self.services.control;
        let certificates = match control.list_certificates(&target.entity_name, resource_group) {
            Ok(certificates) => certificates,
            Err(e) if e.is_not_found() => return,
            Err(e) => {
                self.output
                    .error(&format!("Failed to list certificates for deletion: {}", e));
                report.failures += 1;
                return;
            }
        };

        for certificate in certificates {
            let what = format!("certificate '{}'", certificate.name);
            let result = match certificate.etag.as_deref() {
                Some(etag) => control.delete_certificate(
                    &target.entity_name,
                    resource_group,
                    &certificate.name,
                    etag,
                ),
                None => Err(HubError::InvalidArgument(format!(
                    "{} has no etag",
                    what
                ))),
            };
            if self.record(&what, result, report) {
                report.certificates_deleted += 1;
            }
        }
    }
}
