//! Builder for the executor command line run inside a worker container.
//!
//! The LLM CLI takes a non-trivial flag set; the builder keeps the
//! combinations typed and testable instead of scattering argv literals
//! around the call sites.

/// How conversation context is handled across invocations.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionMode {
    #[default]
    NewSession,
    Resume(String),
    Continue,
}

#[derive(Debug, Clone)]
pub struct ExecutorCommand {
    binary: String,
    max_turns: Option<u32>,
    allowed_tools: Vec<String>,
    disallowed_tools: Vec<String>,
    session: SessionMode,
}

impl ExecutorCommand {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            max_turns: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            session: SessionMode::NewSession,
        }
    }

    pub fn with_max_turns(mut self, turns: u32) -> Self {
        self.max_turns = Some(turns);
        self
    }

    pub fn with_allowed_tools(mut self, tools: &[String]) -> Self {
        self.allowed_tools = tools.to_vec();
        self
    }

    pub fn with_disallowed_tools(mut self, tools: &[String]) -> Self {
        self.disallowed_tools = tools.to_vec();
        self
    }

    pub fn with_session(mut self, session: SessionMode) -> Self {
        self.session = session;
        self
    }

    /// Final argv for the in-container exec. The prompt is always the
    /// last argument; no shell is involved anywhere.
    pub fn build(self, prompt: &str) -> Vec<String> {
        let mut argv = vec![
            self.binary,
            "--print".to_string(),
            "--output-format".to_string(),
            "text".to_string(),
        ];
        if let Some(turns) = self.max_turns {
            argv.push("--max-turns".to_string());
            argv.push(turns.to_string());
        }
        if !self.allowed_tools.is_empty() {
            argv.push("--allowedTools".to_string());
            argv.push(self.allowed_tools.join(","));
        }
        if !self.disallowed_tools.is_empty() {
            argv.push("--disallowedTools".to_string());
            argv.push(self.disallowed_tools.join(","));
        }
        match self.session {
            SessionMode::NewSession => {}
            SessionMode::Resume(id) => {
                argv.push("--resume".to_string());
                argv.push(id);
            }
            SessionMode::Continue => argv.push("--continue".to_string()),
        }
        argv.push(prompt.to_string());
        argv
    }
}
