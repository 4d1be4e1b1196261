//! Shared fakes for tests: a scripted engine/loader pair and a scripted
//! permission prompter. Nothing here ships in release builds.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{ModelConfig, ModelsConfig};
use crate::engine::{Engine, EngineLoader, GenerateOptions, LoadOptions};
use crate::error::ErrorKind;
use crate::permission::{Decision, PermissionRequest, Prompter};

/// An engine that replays canned responses and streams them token-wise.
#[derive(Debug)]
pub struct ScriptedEngine {
    path: PathBuf,
    responses: Arc<Mutex<VecDeque<String>>>,
    delay: Option<Duration>,
}

impl ScriptedEngine {
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            path: PathBuf::from("models/scripted.gguf"),
            responses: Arc::new(Mutex::new(responses.into_iter().collect())),
            delay: None,
        }
    }

    /// An engine that hangs for `delay` before answering; used for
    /// timeout and cancellation tests.
    pub fn slow(delay: Duration) -> Self {
        let mut engine = Self::with_responses(vec!["late".to_string()]);
        engine.delay = Some(delay);
        engine
    }

    fn shared(path: PathBuf, responses: Arc<Mutex<VecDeque<String>>>) -> Self {
        Self {
            path,
            responses,
            delay: None,
        }
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn model_path(&self) -> &Path {
        &self.path
    }

    async fn generate(
        &self,
        _prompt: &str,
        opts: &GenerateOptions,
        on_token: Option<mpsc::UnboundedSender<String>>,
    ) -> anyhow::Result<String> {
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = opts.cancel.cancelled() => {
                    return Err(anyhow::Error::new(ErrorKind::Cancelled));
                }
            }
        }

        let response = self
            .responses
            .lock()
            .expect("response queue lock")
            .pop_front()
            .unwrap_or_default();

        if let Some(tx) = on_token {
            // Stream in small chunks so fence detection sees real token
            // boundaries.
            let chars: Vec<char> = response.chars().collect();
            for chunk in chars.chunks(7) {
                let _ = tx.send(chunk.iter().collect());
            }
        }
        Ok(response)
    }
}

/// Loader whose engines all draw from one shared response queue, in
/// order, regardless of which role asked.
pub struct ScriptedLoader {
    responses: Arc<Mutex<VecDeque<String>>>,
    pub loads: Arc<Mutex<Vec<PathBuf>>>,
}

impl Default for ScriptedLoader {
    fn default() -> Self {
        Self::with_responses(Vec::new())
    }
}

impl ScriptedLoader {
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into_iter().collect())),
            loads: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl EngineLoader for ScriptedLoader {
    async fn load(&self, path: &Path, _opts: &LoadOptions) -> anyhow::Result<Box<dyn Engine>> {
        self.loads
            .lock()
            .expect("load log lock")
            .push(path.to_path_buf());
        Ok(Box::new(ScriptedEngine::shared(
            path.to_path_buf(),
            self.responses.clone(),
        )))
    }
}

/// A models config pointing at dummy files inside `dir`, with the
/// default role estimates (router 400 pinned, coder 4800, algorithm
/// 4500).
pub fn test_models_config(dir: &Path) -> ModelsConfig {
    let model = |name: &str, estimate: u64, resident: bool| {
        let path = dir.join(name);
        std::fs::write(&path, b"gguf-test-stub").expect("write model stub");
        ModelConfig {
            path: path.display().to_string(),
            context_size: 2048,
            max_tokens: 512,
            memory_estimate_mb: estimate,
            always_resident: resident,
            idle_evict_after_sec: 0,
            temperature: 0.2,
        }
    };
    ModelsConfig {
        router: model("router.gguf", 400, true),
        coder: model("coder.gguf", 4800, false),
        algorithm: model("algorithm.gguf", 4500, false),
    }
}

/// Prompter that replays scripted decisions and records what was asked.
#[derive(Clone)]
pub struct ScriptedPrompter {
    decisions: Arc<Mutex<VecDeque<Decision>>>,
    requests: Arc<Mutex<Vec<PermissionRequest>>>,
}

impl ScriptedPrompter {
    pub fn new(decisions: Vec<Decision>) -> Self {
        Self {
            decisions: Arc::new(Mutex::new(decisions.into_iter().collect())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Allows everything once; an empty decision queue defaults to
    /// AllowOnce.
    pub fn always_allow() -> Self {
        Self::new(Vec::new())
    }

    /// How many times the gate actually prompted.
    pub fn asked(&self) -> usize {
        self.requests.lock().expect("request log lock").len()
    }

    pub fn requests(&self) -> Vec<PermissionRequest> {
        self.requests.lock().expect("request log lock").clone()
    }
}

impl Prompter for ScriptedPrompter {
    fn ask(&self, request: &PermissionRequest) -> anyhow::Result<Decision> {
        self.requests
            .lock()
            .expect("request log lock")
            .push(request.clone());
        Ok(self
            .decisions
            .lock()
            .expect("decision queue lock")
            .pop_front()
            .unwrap_or(Decision::AllowOnce))
    }
}
