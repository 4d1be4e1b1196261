//! llama.cpp-backed engine. Compiled only with `--features llama`.
//!
//! One `LlamaBackend` serves every loaded model; models and contexts are
//! created per load and dropped on unload. Generation runs on a blocking
//! thread so the async runtime stays responsive while llama.cpp chews
//! through a CPU decode.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use tokio::sync::mpsc;

use super::{Engine, EngineLoader, GenerateOptions, LoadOptions};

pub struct GgufLoader {
    backend: Arc<LlamaBackend>,
}

impl GgufLoader {
    pub fn new() -> Self {
        let backend = LlamaBackend::init().expect("llama backend init");
        Self {
            backend: Arc::new(backend),
        }
    }
}

impl Default for GgufLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineLoader for GgufLoader {
    async fn load(&self, path: &Path, opts: &LoadOptions) -> anyhow::Result<Box<dyn Engine>> {
        let backend = self.backend.clone();
        let path_buf = path.to_path_buf();
        let opts = opts.clone();

        let engine = tokio::task::spawn_blocking(move || -> anyhow::Result<GgufEngine> {
            let model_params =
                LlamaModelParams::default().with_n_gpu_layers(opts.extra_layers);
            let model = LlamaModel::load_from_file(&backend, &path_buf, &model_params)?;
            Ok(GgufEngine {
                backend,
                model: Mutex::new(model),
                path: path_buf,
                context_size: opts.context_size,
                n_threads: opts.n_threads,
            })
        })
        .await??;

        Ok(Box::new(engine))
    }
}

#[derive(Debug)]
pub struct GgufEngine {
    backend: Arc<LlamaBackend>,
    // Single-writer: lifecycle serializes generation per role above us,
    // the mutex keeps the model handle honest if that ever slips.
    model: Mutex<LlamaModel>,
    path: PathBuf,
    context_size: u32,
    n_threads: u32,
}

#[async_trait]
impl Engine for GgufEngine {
    fn model_path(&self) -> &Path {
        &self.path
    }

    async fn generate(
        &self,
        prompt: &str,
        opts: &GenerateOptions,
        on_token: Option<mpsc::UnboundedSender<String>>,
    ) -> anyhow::Result<String> {
        let prompt = prompt.to_string();
        let opts = opts.clone();
        let context_size = self.context_size;
        let n_threads = self.n_threads;
        let backend = self.backend.clone();

        // The model reference cannot cross the spawn_blocking boundary, so
        // the whole decode runs inside block_in_place on the model lock.
        tokio::task::block_in_place(move || {
            let model = self
                .model
                .lock()
                .map_err(|_| anyhow::anyhow!("model lock poisoned"))?;

            let ctx_params = LlamaContextParams::default()
                .with_n_ctx(NonZeroU32::new(context_size))
                .with_n_threads(n_threads as i32)
                .with_n_threads_batch(n_threads as i32);
            let mut ctx = model.new_context(&backend, ctx_params)?;

            let tokens = model.str_to_token(&prompt, AddBos::Always)?;
            let n_prompt = tokens.len();
            let mut batch = LlamaBatch::new(context_size as usize, 1);
            for (i, token) in tokens.iter().enumerate() {
                batch.add(*token, i as i32, &[0], i + 1 == n_prompt)?;
            }
            ctx.decode(&mut batch)?;

            let mut sampler = if opts.temperature <= 0.0 {
                LlamaSampler::greedy()
            } else {
                LlamaSampler::chain_simple([
                    LlamaSampler::temp(opts.temperature),
                    LlamaSampler::dist(0),
                ])
            };

            let mut output = String::new();
            let mut n_cur = n_prompt as i32;

            for _ in 0..opts.max_tokens {
                if opts.cancel.is_cancelled() {
                    break;
                }

                let token = sampler.sample(&ctx, batch.n_tokens() - 1);
                sampler.accept(token);

                if model.is_eog_token(token) {
                    break;
                }

                let piece = model.token_to_str(token, llama_cpp_2::model::Special::Tokenize)?;
                output.push_str(&piece);
                if let Some(tx) = &on_token {
                    let _ = tx.send(piece);
                }

                if opts.stop.iter().any(|s| output.ends_with(s.as_str())) {
                    for stop in &opts.stop {
                        if let Some(stripped) = output.strip_suffix(stop.as_str()) {
                            output.truncate(stripped.len());
                            break;
                        }
                    }
                    break;
                }

                batch.clear();
                batch.add(token, n_cur, &[0], true)?;
                n_cur += 1;
                ctx.decode(&mut batch)?;
            }

            Ok(output.trim().to_string())
        })
    }
}
