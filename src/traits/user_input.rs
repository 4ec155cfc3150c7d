use anyhow::Result;
#[cfg(test)]
use std::collections::VecDeque;
#[cfg(test)]
use std::sync::Mutex;

/// Trait for user input operations to enable testing with mocks
pub trait UserInput: Send + Sync {
    /// Display a confirmation prompt (yes/no)
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool>;
}

/// Real user input implementation using inquire crate
pub struct InquireUserInput;

impl UserInput for InquireUserInput {
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        use inquire::Confirm;
        let answer = Confirm::new(prompt).with_default(default).prompt()?;
        Ok(answer)
    }
}

/// Mock user input implementation for testing
#[cfg(test)]
pub struct MockUserInput {
    responses: Mutex<VecDeque<bool>>,
    prompts: Mutex<Vec<String>>,
}

#[cfg(test)]
impl MockUserInput {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Create mock with pre-configured confirmation answers
    pub fn with_confirmations(responses: Vec<bool>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts that were shown, in order
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Default for MockUserInput {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl UserInput for MockUserInput {
    fn confirm(&self, prompt: &str, _default: bool) -> Result<bool> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("No more mock responses available"))
    }
}
