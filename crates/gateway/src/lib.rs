//! Talon gateway library: HTTP/WS API, runtime, and shared state.

pub mod api;
pub mod cli;
pub mod runtime;
pub mod state;

#[cfg(test)]
pub(crate) mod testutil {
    //! Shared fixtures: a full `AppState` over temp directories, a scripted
    //! LLM, and an event collector.

    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use tal_domain::chat::ContentBlock;
    use tal_domain::config::Config;
    use tal_domain::{Error, Result};
    use tal_providers::{ChatRequest, ChatResponse, LlmClient};
    use tal_sessions::{ClientStore, PlaybookStore, SessionStore, UserStore};
    use tal_tools::{Executor, TaskRegistry, ToolRegistry};

    use crate::runtime::bus::EventBus;
    use crate::runtime::redact::{Redactor, Tokenizer};
    use crate::runtime::schedules::JobStore;
    use crate::state::AppState;

    pub const SAMPLE_TOOLS: &str = r#"
tools:
  nmap:
    name: nmap
    description: Network scanning
    category: scanning
    risk_level: medium
    binary: /bin/echo
    default_args: ["nmap-run"]
    parameters:
      target:
        type: string
        positional: true
      ports:
        flag: "-p"
        type: string
  subfinder:
    name: subfinder
    description: Subdomain enumeration
    category: recon
    risk_level: low
    binary: /bin/echo
    default_args: ["subfinder-run"]
    parameters:
      domain:
        flag: "-d"
        type: string
      raw_args:
        raw_flag: true
        flag: ""
        type: string
"#;

    /// An LLM that replays a fixed script and records every request.
    pub struct ScriptedLlm {
        responses: Mutex<VecDeque<ChatResponse>>,
        pub requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedLlm {
        pub fn new(responses: Vec<ChatResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn push(&self, response: ChatResponse) {
            self.responses.lock().push_back(response);
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse> {
            self.requests.lock().push(req.clone());
            self.responses
                .lock()
                .pop_front()
                .ok_or_else(|| Error::Provider("scripted responses exhausted".into()))
        }
    }

    pub fn text_response(text: &str) -> ChatResponse {
        ChatResponse {
            content: vec![ContentBlock::Text { text: text.into() }],
            stop_reason: Some("end_turn".into()),
        }
    }

    pub fn tool_use_response(text: &str, id: &str, name: &str, input: serde_json::Value) -> ChatResponse {
        ChatResponse {
            content: vec![
                ContentBlock::Text { text: text.into() },
                ContentBlock::ToolUse {
                    id: id.into(),
                    name: name.into(),
                    input,
                },
            ],
            stop_reason: Some("tool_use".into()),
        }
    }

    pub struct Harness {
        pub state: AppState,
        pub llm: Arc<ScriptedLlm>,
        /// Keeps the temp data directory alive for the test's duration.
        #[allow(dead_code)]
        pub dir: tempfile::TempDir,
    }

    /// A complete state over temp dirs: real executor (spawning /bin/echo
    /// and bash), sample tool catalog, scripted LLM.
    pub fn harness(responses: Vec<ChatResponse>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("sessions");
        let artifact_dir = dir.path().join("tasks");
        std::fs::create_dir_all(&data_dir).unwrap();
        let tools_path = dir.path().join("tool_definitions.yaml");
        std::fs::write(&tools_path, SAMPLE_TOOLS).unwrap();

        let config = Arc::new(Config::default());
        let tasks = Arc::new(TaskRegistry::new());
        let executor = Arc::new(Executor::new(
            tasks.clone(),
            config.exec.clone(),
            artifact_dir,
        ));
        let llm = Arc::new(ScriptedLlm::new(responses));

        let state = AppState {
            config,
            llm: llm.clone(),
            sessions: Arc::new(SessionStore::load(&data_dir).unwrap()),
            clients: Arc::new(ClientStore::load(&data_dir).unwrap()),
            users: Arc::new(UserStore::load(&data_dir).unwrap()),
            playbooks: Arc::new(PlaybookStore::load(dir.path().join("playbooks")).unwrap()),
            tools: Arc::new(ToolRegistry::load(&tools_path).unwrap()),
            executor,
            tasks,
            jobs: Arc::new(JobStore::load(&data_dir).unwrap()),
            bus: Arc::new(EventBus::new()),
            tokenizer: Arc::new(Tokenizer::new()),
            redactor: Arc::new(Redactor::new()),
        };
        Harness { state, llm, dir }
    }
}
