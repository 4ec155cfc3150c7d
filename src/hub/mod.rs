//! Everything that talks to Azure: management plane, sibling resources and
//! the hub data plane.

pub mod az;
pub mod connection_string;
pub mod control;
pub mod data;
pub mod error;
pub mod resources;
pub mod target;

pub use control::{ControlPlane, HubResource};
pub use data::{DataPlane, DataPlaneFactory};
pub use error::{HubError, HubResult};
pub use resources::ResourceCli;
pub use target::{HubSpec, Target, TargetResolver};

use crate::context::Context;
use az::AzCli;
use control::AzControlPlane;
use data::RestDataPlaneFactory;
use resources::AzResourceCli;
use std::sync::Arc;

/// Remote collaborators used by one command invocation
#[derive(Clone)]
pub struct Services {
    pub control: Arc<dyn ControlPlane>,
    pub resources: Arc<dyn ResourceCli>,
    pub data: Arc<dyn DataPlaneFactory>,
}

impl Services {
    /// Azure CLI for the management plane, REST for the data plane
    pub fn from_context(ctx: &Context) -> Self {
        let az = AzCli::new(ctx.command.clone(), ctx.settings.az_path.clone());
        Self {
            control: Arc::new(AzControlPlane::new(az.clone())),
            resources: Arc::new(AzResourceCli::new(az)),
            data: Arc::new(RestDataPlaneFactory::new(
                ctx.http.clone(),
                ctx.settings.api_version.clone(),
                ctx.settings.sas_ttl_secs,
            )),
        }
    }

    pub fn resolver(&self) -> TargetResolver {
        TargetResolver::new(self.control.clone())
    }
}
