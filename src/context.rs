use crate::config::Settings;
use crate::traits::{
    CommandExecutor, FileSystem, HttpClient, InquireUserInput, Output, RealCommandExecutor,
    RealFileSystem, ReqwestClient, TerminalOutput, UserInput,
};
#[cfg(test)]
use crate::traits::{
    MockCommandExecutor, MockFileSystem, MockHttpClient, MockOutput, MockUserInput,
};
use anyhow::Result;
use std::sync::Arc;

/// Application context that holds all dependencies for dependency injection
#[derive(Clone)]
pub struct Context {
    pub fs: Arc<dyn FileSystem>,
    pub input: Arc<dyn UserInput>,
    pub output: Arc<dyn Output>,
    pub command: Arc<dyn CommandExecutor>,
    pub http: Arc<dyn HttpClient>,
    pub settings: Settings,
}

impl Context {
    /// Create a new context with real implementations (for production use)
    pub fn new() -> Result<Self> {
        let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
        let settings = Settings::load(&*fs)?;
        Ok(Self {
            fs,
            input: Arc::new(InquireUserInput),
            output: Arc::new(TerminalOutput),
            command: Arc::new(RealCommandExecutor::new()),
            http: Arc::new(ReqwestClient::new()),
            settings,
        })
    }

    /// Create a new context with mock implementations (for testing)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            fs: Arc::new(MockFileSystem::new()),
            input: Arc::new(MockUserInput::new()),
            output: Arc::new(MockOutput::new()),
            command: Arc::new(MockCommandExecutor::new()),
            http: Arc::new(MockHttpClient::new()),
            settings: Settings::default(),
        }
    }

    /// Create a test context with specific mock implementations
    #[cfg(test)]
    pub fn test_with(
        fs: Arc<dyn FileSystem>,
        input: Arc<dyn UserInput>,
        output: Arc<dyn Output>,
    ) -> Self {
        Self {
            fs,
            input,
            output,
            ..Self::test()
        }
    }
}
