//! Engine adapter — the capability boundary to native inference.
//!
//! Everything above this module treats an engine as "load a model file,
//! produce tokens for a prompt, stream tokens, unload". The llama.cpp
//! implementation lives in [`gguf`] behind the `llama` cargo feature;
//! builds without it get [`DisabledLoader`], which fails every load with
//! an actionable message while the rest of the system keeps working.

#[cfg(feature = "llama")]
pub mod gguf;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorKind;

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub context_size: u32,
    pub n_threads: u32,
    /// Layers offloaded beyond CPU; 0 on CPU-only machines.
    pub extra_layers: u32,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            context_size: 2048,
            n_threads: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(4),
            extra_layers: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_tokens: usize,
    pub temperature: f32,
    pub stop: Vec<String>,
    pub deadline: Duration,
    pub cancel: CancellationToken,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.3,
            stop: Vec::new(),
            deadline: Duration::from_secs(300),
            cancel: CancellationToken::new(),
        }
    }
}

/// A loaded model instance capable of producing tokens. Dropping the value
/// releases the underlying file handles and compute state.
#[async_trait]
pub trait Engine: Send + Sync + std::fmt::Debug {
    fn model_path(&self) -> &Path;

    /// Produce the final text for `prompt`. When `on_token` is supplied,
    /// each decoded piece is sent as it is produced; the final text is
    /// still returned in full. Implementations must check `opts.cancel`
    /// between tokens so an interrupt stops generation promptly.
    async fn generate(
        &self,
        prompt: &str,
        opts: &GenerateOptions,
        on_token: Option<mpsc::UnboundedSender<String>>,
    ) -> anyhow::Result<String>;
}

/// Loads engines from model files. Each load is independent; there is no
/// hidden global state shared between loads.
#[async_trait]
pub trait EngineLoader: Send + Sync {
    async fn load(&self, path: &Path, opts: &LoadOptions) -> anyhow::Result<Box<dyn Engine>>;
}

/// Run `generate` under the caller's deadline and cancellation signal,
/// converting both into their typed failure kinds. The cancel arm makes
/// interrupts observable even when an engine is slow to notice the token.
pub async fn generate_bounded(
    engine: &dyn Engine,
    prompt: &str,
    opts: &GenerateOptions,
    on_token: Option<mpsc::UnboundedSender<String>>,
) -> anyhow::Result<String> {
    tokio::select! {
        res = tokio::time::timeout(opts.deadline, engine.generate(prompt, opts, on_token)) => {
            match res {
                Ok(inner) => inner,
                Err(_) => Err(anyhow::Error::new(ErrorKind::Timeout(opts.deadline))),
            }
        }
        _ = opts.cancel.cancelled() => Err(anyhow::Error::new(ErrorKind::Cancelled)),
    }
}

/// Stand-in loader for builds without the `llama` feature.
pub struct DisabledLoader;

#[async_trait]
impl EngineLoader for DisabledLoader {
    async fn load(&self, path: &Path, _opts: &LoadOptions) -> anyhow::Result<Box<dyn Engine>> {
        anyhow::bail!(
            "inference engine not compiled in; rebuild with --features llama (model: {})",
            path.display()
        )
    }
}

/// The loader for this build: llama.cpp when compiled in, otherwise the
/// disabled stub.
pub fn default_loader() -> Box<dyn EngineLoader> {
    #[cfg(feature = "llama")]
    {
        Box::new(gguf::GgufLoader::new())
    }
    #[cfg(not(feature = "llama"))]
    {
        Box::new(DisabledLoader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;
    use crate::testing::ScriptedEngine;

    #[tokio::test]
    async fn disabled_loader_names_the_feature() {
        let err = DisabledLoader
            .load(Path::new("models/router.gguf"), &LoadOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("--features llama"));
    }

    #[tokio::test]
    async fn bounded_generate_times_out() {
        let engine = ScriptedEngine::slow(Duration::from_secs(5));
        let opts = GenerateOptions {
            deadline: Duration::from_millis(50),
            ..Default::default()
        };
        let err = generate_bounded(&engine, "hi", &opts, None).await.unwrap_err();
        assert!(matches!(kind_of(&err), Some(ErrorKind::Timeout(_))));
    }

    #[tokio::test]
    async fn bounded_generate_observes_cancellation() {
        let engine = ScriptedEngine::slow(Duration::from_secs(5));
        let opts = GenerateOptions {
            deadline: Duration::from_secs(10),
            ..Default::default()
        };
        let cancel = opts.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = generate_bounded(&engine, "hi", &opts, None).await.unwrap_err();
        assert!(matches!(kind_of(&err), Some(ErrorKind::Cancelled)));
    }

    #[tokio::test]
    async fn scripted_engine_streams_tokens() {
        let engine = ScriptedEngine::with_responses(vec!["hello world".to_string()]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let text = engine
            .generate("hi", &GenerateOptions::default(), Some(tx))
            .await
            .unwrap();
        assert_eq!(text, "hello world");
        let mut streamed = String::new();
        while let Ok(tok) = rx.try_recv() {
            streamed.push_str(&tok);
        }
        assert_eq!(streamed, "hello world");
    }
}
