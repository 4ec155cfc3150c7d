use crate::context::Context;
use crate::hub::{HubError, HubSpec, Services, Target};
use crate::output;
use crate::state::file::{read_state, write_state};
use crate::state::{
    Aspect, AspectSet, HubState, ReplayEngine, ResetEngine, SnapshotBuilder, aspect_set,
};
use anyhow::{Context as AnyhowContext, Result, bail};
use std::path::PathBuf;

pub struct StateCommand;

#[derive(Debug, Clone, Default)]
pub struct SaveArgs {
    pub hub: HubSpec,
    pub aspects: Vec<Aspect>,
    pub state_file: PathBuf,
    pub replace: bool,
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadArgs {
    pub hub: HubSpec,
    pub aspects: Vec<Aspect>,
    pub state_file: PathBuf,
    pub replace: bool,
    pub yes: bool,
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct MigrateArgs {
    pub orig: HubSpec,
    pub dest: HubSpec,
    pub aspects: Vec<Aspect>,
    pub replace: bool,
    pub yes: bool,
    pub workers: Option<usize>,
}

fn describe_aspects(aspects: &AspectSet) -> String {
    aspects
        .iter()
        .map(Aspect::key)
        .collect::<Vec<_>>()
        .join(", ")
}

impl StateCommand {
    /// Execute `hub state save`
    pub fn execute_save(ctx: &Context, args: &SaveArgs) -> Result<()> {
        Self::execute_save_with(ctx, &Services::from_context(ctx), args)
    }

    /// Execute `hub state upload`
    pub fn execute_upload(ctx: &Context, args: &UploadArgs) -> Result<()> {
        Self::execute_upload_with(ctx, &Services::from_context(ctx), args)
    }

    /// Execute `hub state migrate`
    pub fn execute_migrate(ctx: &Context, args: &MigrateArgs) -> Result<()> {
        Self::execute_migrate_with(ctx, &Services::from_context(ctx), args)
    }

    pub fn execute_save_with(ctx: &Context, services: &Services, args: &SaveArgs) -> Result<()> {
        ctx.output.section("Save IoT Hub State");
        let aspects = aspect_set(&args.aspects);
        Self::check_login(&args.hub, &aspects)?;

        if ctx.fs.exists(&args.state_file) && !args.replace {
            bail!(
                "State file {:?} already exists. Use --replace to overwrite it.",
                args.state_file
            );
        }

        let target = services.resolver().resolve(&args.hub)?;
        Self::show_target(ctx, "Hub", &target, &aspects);

        let settings = ctx.settings.clone().with_workers(args.workers);
        let (state, stats) = SnapshotBuilder::new(services, ctx.output.clone())
            .workers(settings.workers)
            .page_size(settings.configuration_page_size)
            .build(&target, &aspects)?;

        write_state(&*ctx.fs, &args.state_file, &state)?;

        output::blank();
        ctx.output.success(&format!(
            "Saved state of '{}' to {}",
            target.entity_name,
            args.state_file.display()
        ));
        ctx.output.summary("Snapshot", &stats.summary_items());
        Ok(())
    }

    pub fn execute_upload_with(
        ctx: &Context,
        services: &Services,
        args: &UploadArgs,
    ) -> Result<()> {
        ctx.output.section("Upload IoT Hub State");
        let aspects = aspect_set(&args.aspects);
        Self::check_login(&args.hub, &aspects)?;

        let state = read_state(&*ctx.fs, &args.state_file, &*ctx.output)?;
        let aspects = Self::available_aspects(ctx, &state, aspects, "state file");
        if aspects.is_empty() {
            ctx.output.info("Nothing to upload");
            return Ok(());
        }

        let resolver = services.resolver();
        let existing = resolver.find(&args.hub)?;
        Self::require_destination(&args.hub, existing.as_ref(), &aspects)?;
        if let Some(target) = &existing {
            Self::show_target(ctx, "Destination", target, &aspects);
        }

        if args.replace && !Self::confirm_replace(ctx, &args.hub, &aspects, args.yes)? {
            ctx.output.info("Upload cancelled");
            return Ok(());
        }

        let settings = ctx.settings.clone().with_workers(args.workers);
        Self::apply(ctx, services, &args.hub, existing, &state, &aspects, args.replace, settings.workers)
    }

    pub fn execute_migrate_with(
        ctx: &Context,
        services: &Services,
        args: &MigrateArgs,
    ) -> Result<()> {
        ctx.output.section("Migrate IoT Hub State");
        let aspects = aspect_set(&args.aspects);
        Self::check_login(&args.orig, &aspects)?;
        Self::check_login(&args.dest, &aspects)?;

        let resolver = services.resolver();
        let source = resolver
            .resolve(&args.orig)
            .context("Failed to resolve the origin hub")?;
        let existing = resolver.find(&args.dest)?;
        if existing
            .as_ref()
            .is_some_and(|dest| dest.host.eq_ignore_ascii_case(&source.host))
        {
            return Err(HubError::InvalidArgument(
                "origin and destination are the same hub".into(),
            )
            .into());
        }
        Self::require_destination(&args.dest, existing.as_ref(), &aspects)?;
        Self::show_target(ctx, "Origin", &source, &aspects);

        if args.replace && !Self::confirm_replace(ctx, &args.dest, &aspects, args.yes)? {
            ctx.output.info("Migration cancelled");
            return Ok(());
        }

        let settings = ctx.settings.clone().with_workers(args.workers);
        let (state, stats) = SnapshotBuilder::new(services, ctx.output.clone())
            .workers(settings.workers)
            .page_size(settings.configuration_page_size)
            .build(&source, &aspects)?;
        ctx.output.summary("Snapshot", &stats.summary_items());

        let aspects = Self::available_aspects(ctx, &state, aspects, "origin hub");
        if aspects.is_empty() {
            ctx.output.info("Nothing to migrate");
            return Ok(());
        }
        Self::apply(ctx, services, &args.dest, existing, &state, &aspects, args.replace, settings.workers)
    }

    /// Optional reset, then replay, then the summary
    #[allow(clippy::too_many_arguments)]
    fn apply(
        ctx: &Context,
        services: &Services,
        dest: &HubSpec,
        existing: Option<Target>,
        state: &HubState,
        aspects: &AspectSet,
        replace: bool,
        workers: usize,
    ) -> Result<()> {
        if replace && let Some(target) = &existing {
            let report = ResetEngine::new(services, &*ctx.output)
                .page_size(ctx.settings.configuration_page_size)
                .reset(target, aspects);
            tracing::debug!(?report, "destination cleared");
        }

        let report = ReplayEngine::new(services, ctx.output.clone())
            .workers(workers)
            .replay(dest, existing, state, aspects)?;

        output::blank();
        if report.failures() == 0 {
            ctx.output
                .success(&format!("State applied to '{}'", dest.describe()));
        } else {
            ctx.output.warning(&format!(
                "State applied to '{}' with {} failures",
                dest.describe(),
                report.failures()
            ));
        }
        ctx.output.summary("Replay", &report.summary_items());
        Ok(())
    }

    /// The arm aspect needs the management plane, which a connection string cannot reach
    fn check_login(spec: &HubSpec, aspects: &AspectSet) -> Result<()> {
        if spec.login.is_none() {
            return Ok(());
        }
        let blocked: Vec<&str> = aspects
            .iter()
            .filter(|a| a.requires_control_plane())
            .map(Aspect::key)
            .collect();
        if !blocked.is_empty() {
            return Err(HubError::InvalidArgument(format!(
                "--login cannot be used with the {} aspect; identify the hub with --hub-name instead",
                blocked.join(", ")
            ))
            .into());
        }
        Ok(())
    }

    /// Drop requested aspects the state does not carry, with a warning
    fn available_aspects(
        ctx: &Context,
        state: &HubState,
        mut aspects: AspectSet,
        source: &str,
    ) -> AspectSet {
        let missing = state.missing_aspects(&aspects);
        if !missing.is_empty() {
            ctx.output.warning(&format!(
                "Missing hub aspects in {}: {}",
                source,
                missing.iter().map(Aspect::key).collect::<Vec<_>>().join(", ")
            ));
            for aspect in missing {
                aspects.remove(&aspect);
            }
        }
        aspects
    }

    /// A missing destination is only acceptable when the arm aspect will create it
    fn require_destination(
        spec: &HubSpec,
        existing: Option<&Target>,
        aspects: &AspectSet,
    ) -> Result<()> {
        if existing.is_none() && !aspects.contains(&Aspect::Arm) {
            return Err(HubError::NotFound(format!(
                "IoT Hub '{}' does not exist. Include the arm aspect to create it.",
                spec.describe()
            ))
            .into());
        }
        Ok(())
    }

    fn confirm_replace(ctx: &Context, dest: &HubSpec, aspects: &AspectSet, yes: bool) -> Result<bool> {
        if yes {
            return Ok(true);
        }
        ctx.input.confirm(
            &format!(
                "This deletes the existing {} on '{}' before uploading. Continue?",
                describe_aspects(aspects),
                dest.describe()
            ),
            false,
        )
    }

    fn show_target(ctx: &Context, label: &str, target: &Target, aspects: &AspectSet) {
        ctx.output.key_value(label, &target.entity_name);
        ctx.output.key_value("Host", &target.host);
        if let Some(rg) = &target.resource_group {
            ctx.output.key_value("Resource group", rg);
        }
        ctx.output.key_value("Aspects", &describe_aspects(aspects));
        output::blank();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FakeCloud, device_record};
    use crate::traits::{FileSystem, MockFileSystem, MockOutput, MockUserInput};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;

    struct Harness {
        ctx: Context,
        fs: Arc<MockFileSystem>,
        input: Arc<MockUserInput>,
        output: Arc<MockOutput>,
    }

    fn harness(confirmations: Vec<bool>) -> Harness {
        let fs = Arc::new(MockFileSystem::new());
        let input = Arc::new(MockUserInput::with_confirmations(confirmations));
        let output = Arc::new(MockOutput::new());
        let ctx = Context::test_with(fs.clone(), input.clone(), output.clone());
        Harness {
            ctx,
            fs,
            input,
            output,
        }
    }

    fn named(name: &str) -> HubSpec {
        HubSpec {
            name: Some(name.into()),
            ..HubSpec::default()
        }
    }

    fn write_devices_only(fs: &MockFileSystem, path: &Path) {
        let state = HubState {
            devices: Some(BTreeMap::from([("dev-1".to_string(), device_record(false))])),
            ..HubState::default()
        };
        write_state(fs, path, &state).unwrap();
    }

    fn hub_error(err: &anyhow::Error) -> &HubError {
        err.downcast_ref::<HubError>().unwrap()
    }

    #[test]
    fn test_save_writes_state_file() {
        let h = harness(vec![]);
        let cloud = FakeCloud::new();
        let target = cloud.add_hub("src", "rg");
        cloud.hub_data(&target).seed_device("dev-1", false);
        let args = SaveArgs {
            hub: named("src"),
            aspects: vec![Aspect::Devices],
            state_file: PathBuf::from("/work/state.json"),
            ..SaveArgs::default()
        };

        StateCommand::execute_save_with(&h.ctx, &cloud.services(), &args).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&h.fs.get_file_contents(&args.state_file).unwrap()).unwrap();
        assert!(raw["devices"]["dev-1"].is_object());
        assert!(h.output.to_text().contains("Saved state of 'src'"));
    }

    #[test]
    fn test_save_refuses_existing_file_without_replace() {
        let h = harness(vec![]);
        let cloud = FakeCloud::new();
        cloud.add_hub("src", "rg");
        let path = PathBuf::from("/work/state.json");
        h.fs.write(&path, "{}").unwrap();
        let args = SaveArgs {
            hub: named("src"),
            state_file: path.clone(),
            ..SaveArgs::default()
        };

        let err = StateCommand::execute_save_with(&h.ctx, &cloud.services(), &args).unwrap_err();

        assert!(err.to_string().contains("already exists"));
        assert_eq!(h.fs.get_file_contents(&path).unwrap(), "{}");
    }

    #[test]
    fn test_login_with_arm_is_rejected() {
        let h = harness(vec![]);
        let cloud = FakeCloud::new();
        let args = SaveArgs {
            hub: HubSpec {
                login: Some(
                    "HostName=src.azure-devices.net;SharedAccessKeyName=iothubowner;SharedAccessKey=a2V5"
                        .into(),
                ),
                ..HubSpec::default()
            },
            aspects: vec![Aspect::Arm, Aspect::Devices],
            state_file: PathBuf::from("/work/state.json"),
            ..SaveArgs::default()
        };

        let err = StateCommand::execute_save_with(&h.ctx, &cloud.services(), &args).unwrap_err();

        assert!(matches!(hub_error(&err), HubError::InvalidArgument(_)));
        assert!(cloud.journal().is_empty());
        assert!(!h.fs.has_file(&args.state_file));
    }

    #[test]
    fn test_upload_skips_aspects_missing_from_file() {
        let h = harness(vec![]);
        let cloud = FakeCloud::new();
        let target = cloud.add_hub("dest", "rg");
        let path = PathBuf::from("/work/state.json");
        write_devices_only(&h.fs, &path);
        let args = UploadArgs {
            hub: named("dest"),
            aspects: vec![Aspect::Configurations, Aspect::Devices],
            state_file: path,
            ..UploadArgs::default()
        };

        StateCommand::execute_upload_with(&h.ctx, &cloud.services(), &args).unwrap();

        assert!(h
            .output
            .has_warning_containing("Missing hub aspects in state file: configurations"));
        let journal = cloud.journal();
        assert!(!journal.iter().any(|e| e.starts_with("create_configuration")));
        assert_eq!(cloud.hub_data(&target).device_ids(), vec!["dev-1".to_string()]);
    }

    #[test]
    fn test_upload_replace_declined_changes_nothing() {
        let h = harness(vec![false]);
        let cloud = FakeCloud::new();
        let target = cloud.add_hub("dest", "rg");
        cloud.hub_data(&target).seed_device("old", false);
        let path = PathBuf::from("/work/state.json");
        write_devices_only(&h.fs, &path);
        let args = UploadArgs {
            hub: named("dest"),
            aspects: vec![Aspect::Devices],
            state_file: path,
            replace: true,
            ..UploadArgs::default()
        };

        StateCommand::execute_upload_with(&h.ctx, &cloud.services(), &args).unwrap();

        assert_eq!(h.input.prompts().len(), 1);
        assert!(h.input.prompts()[0].contains("deletes the existing devices on 'dest'"));
        assert_eq!(cloud.hub_data(&target).device_ids(), vec!["old".to_string()]);
        assert!(!cloud.journal().iter().any(|e| e.starts_with("create_device")));
    }

    #[test]
    fn test_upload_replace_clears_before_replay() {
        let h = harness(vec![]);
        let cloud = FakeCloud::new();
        let target = cloud.add_hub("dest", "rg");
        cloud.hub_data(&target).seed_device("old", false);
        let path = PathBuf::from("/work/state.json");
        write_devices_only(&h.fs, &path);
        let args = UploadArgs {
            hub: named("dest"),
            aspects: vec![Aspect::Devices],
            state_file: path,
            replace: true,
            yes: true,
            ..UploadArgs::default()
        };

        StateCommand::execute_upload_with(&h.ctx, &cloud.services(), &args).unwrap();

        assert!(h.input.prompts().is_empty());
        let journal = cloud.journal();
        let deleted = journal.iter().position(|e| e == "delete_device:old").unwrap();
        let created = journal.iter().position(|e| e == "create_device:dev-1").unwrap();
        assert!(deleted < created);
        assert_eq!(cloud.hub_data(&target).device_ids(), vec!["dev-1".to_string()]);
    }

    #[test]
    fn test_upload_to_missing_hub_without_arm() {
        let h = harness(vec![]);
        let cloud = FakeCloud::new();
        let path = PathBuf::from("/work/state.json");
        write_devices_only(&h.fs, &path);
        let args = UploadArgs {
            hub: named("ghost"),
            aspects: vec![Aspect::Devices],
            state_file: path,
            ..UploadArgs::default()
        };

        let err = StateCommand::execute_upload_with(&h.ctx, &cloud.services(), &args).unwrap_err();

        assert!(matches!(hub_error(&err), HubError::NotFound(_)));
    }

    #[test]
    fn test_migrate_copies_configurations_and_devices() {
        let h = harness(vec![]);
        let cloud = FakeCloud::new();
        let source = cloud.add_hub("src", "rg");
        let dest = cloud.add_hub("dest", "rg");
        let src_hub = cloud.hub_data(&source);
        src_hub.seed_device("edge-1", true);
        src_hub.seed_device("leaf-1", false);
        src_hub.set_parent("leaf-1", "edge-1");
        src_hub.seed_configuration(json!({"id": "adm", "content": {"deviceContent": {"properties.desired.x": 1}}}));
        let args = MigrateArgs {
            orig: named("src"),
            dest: named("dest"),
            aspects: vec![Aspect::Configurations, Aspect::Devices],
            workers: Some(2),
            ..MigrateArgs::default()
        };

        StateCommand::execute_migrate_with(&h.ctx, &cloud.services(), &args).unwrap();

        let dest_hub = cloud.hub_data(&dest);
        assert_eq!(
            dest_hub.device_ids(),
            vec!["edge-1".to_string(), "leaf-1".to_string()]
        );
        let edge_scope = dest_hub.device("edge-1").device_scope.unwrap();
        assert_eq!(dest_hub.device("leaf-1").parent_scopes, vec![edge_scope]);
        assert!(cloud
            .journal()
            .contains(&"create_configuration:adm".to_string()));
        assert!(!h.output.has_error());
    }

    #[test]
    fn test_migrate_onto_itself_is_rejected() {
        let h = harness(vec![]);
        let cloud = FakeCloud::new();
        cloud.add_hub("src", "rg");
        let args = MigrateArgs {
            orig: named("src"),
            dest: named("SRC"),
            aspects: vec![Aspect::Devices],
            ..MigrateArgs::default()
        };

        let err = StateCommand::execute_migrate_with(&h.ctx, &cloud.services(), &args).unwrap_err();

        assert!(matches!(hub_error(&err), HubError::InvalidArgument(_)));
    }
}
