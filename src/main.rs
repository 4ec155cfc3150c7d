mod commands;
mod config;
mod context;
mod hub;
mod output;
mod state;
mod test_helpers;
mod traits;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use commands::{MigrateArgs, SaveArgs, StateCommand, UploadArgs};
use context::Context;
use hub::HubSpec;
use state::Aspect;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "iothub-state")]
#[command(about = "Save, upload and migrate Azure IoT Hub state", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// IoT Hub commands
    Hub {
        #[command(subcommand)]
        command: HubCommands,
    },
}

#[derive(Subcommand)]
enum HubCommands {
    /// Save, upload or migrate hub state
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// How the hub is identified
#[derive(Args, Debug, Clone)]
struct HubArgs {
    /// IoT Hub name
    #[arg(short = 'n', long)]
    hub_name: Option<String>,

    /// Resource group of the hub
    #[arg(short = 'g', long)]
    resource_group: Option<String>,

    /// Hub connection string; cannot be combined with the arm aspect
    #[arg(short = 'l', long, conflicts_with = "hub_name")]
    login: Option<String>,

    /// Shared access policy to use instead of the first privileged one
    #[arg(long)]
    policy_name: Option<String>,
}

impl HubArgs {
    fn spec(self) -> HubSpec {
        HubSpec {
            name: self.hub_name,
            resource_group: self.resource_group,
            login: self.login,
            policy_name: self.policy_name,
        }
    }
}

#[derive(Subcommand)]
enum StateCommands {
    /// Save the state of a hub to a file
    Save {
        #[command(flatten)]
        hub: HubArgs,

        /// Aspects to include (defaults to all)
        #[arg(long, value_enum, value_delimiter = ',')]
        hub_aspects: Vec<Aspect>,

        /// Path of the state file to write
        #[arg(short = 'f', long)]
        state_file: PathBuf,

        /// Overwrite an existing state file
        #[arg(short, long)]
        replace: bool,

        /// Devices fetched in parallel
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Apply a saved state file to a hub
    Upload {
        #[command(flatten)]
        hub: HubArgs,

        /// Aspects to apply (defaults to all)
        #[arg(long, value_enum, value_delimiter = ',')]
        hub_aspects: Vec<Aspect>,

        /// Path of the state file to read
        #[arg(short = 'f', long)]
        state_file: PathBuf,

        /// Delete existing state on the hub before uploading
        #[arg(short, long)]
        replace: bool,

        /// Skip the confirmation prompt for --replace
        #[arg(short, long)]
        yes: bool,

        /// Devices created in parallel
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Copy the state of one hub to another
    Migrate {
        /// Destination hub
        #[command(flatten)]
        hub: HubArgs,

        /// Origin hub name
        #[arg(long)]
        orig_hub: Option<String>,

        /// Origin hub resource group
        #[arg(long)]
        orig_resource_group: Option<String>,

        /// Origin hub connection string
        #[arg(long, conflicts_with = "orig_hub")]
        orig_login: Option<String>,

        /// Aspects to migrate (defaults to all)
        #[arg(long, value_enum, value_delimiter = ',')]
        hub_aspects: Vec<Aspect>,

        /// Delete existing state on the destination first
        #[arg(short, long)]
        replace: bool,

        /// Skip the confirmation prompt for --replace
        #[arg(short, long)]
        yes: bool,

        /// Devices processed in parallel
        #[arg(long)]
        workers: Option<usize>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // A subscriber may already be set when embedded; that is fine
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run(command: StateCommands) -> Result<()> {
    let ctx = Context::new()?;

    match command {
        StateCommands::Save {
            hub,
            hub_aspects,
            state_file,
            replace,
            workers,
        } => StateCommand::execute_save(
            &ctx,
            &SaveArgs {
                hub: hub.spec(),
                aspects: hub_aspects,
                state_file,
                replace,
                workers,
            },
        ),
        StateCommands::Upload {
            hub,
            hub_aspects,
            state_file,
            replace,
            yes,
            workers,
        } => StateCommand::execute_upload(
            &ctx,
            &UploadArgs {
                hub: hub.spec(),
                aspects: hub_aspects,
                state_file,
                replace,
                yes,
                workers,
            },
        ),
        StateCommands::Migrate {
            hub,
            orig_hub,
            orig_resource_group,
            orig_login,
            hub_aspects,
            replace,
            yes,
            workers,
        } => StateCommand::execute_migrate(
            &ctx,
            &MigrateArgs {
                orig: HubSpec {
                    name: orig_hub,
                    resource_group: orig_resource_group,
                    login: orig_login,
                    policy_name: None,
                },
                dest: hub.spec(),
                aspects: hub_aspects,
                replace,
                yes,
                workers,
            },
        ),
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let Commands::Hub {
        command: HubCommands::State { command },
    } = cli.command;

    if let Err(e) = run(command) {
        tracing::debug!(error = ?e, "command failed");
        output::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
