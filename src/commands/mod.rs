pub mod state;

pub use state::{MigrateArgs, SaveArgs, StateCommand, UploadArgs};
