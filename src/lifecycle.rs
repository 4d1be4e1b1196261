//! Model lifecycle manager: one loaded engine per role, a hard memory
//! budget, LRU eviction under pressure, and a pin on the always-resident
//! router.
//!
//! All state mutations serialize on a single async lock. Generation never
//! runs under that lock; each role has its own semaphore so concurrent
//! requests for the same engine queue up instead of interleaving tokens.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, info};

use crate::config::{ModelConfig, ModelsConfig};
use crate::engine::{generate_bounded, Engine, EngineLoader, GenerateOptions, LoadOptions};
use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Router,
    Coder,
    Algorithm,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Router, Role::Coder, Role::Algorithm];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Router => write!(f, "router"),
            Role::Coder => write!(f, "coder"),
            Role::Algorithm => write!(f, "algorithm"),
        }
    }
}

/// Static per-role policy, fixed at construction from config.
#[derive(Debug, Clone)]
pub struct RolePolicy {
    pub model_path: PathBuf,
    pub context_size: u32,
    pub max_tokens: usize,
    /// 0 means "estimate from the model file size".
    pub memory_estimate_mb: u64,
    pub always_resident: bool,
    pub idle_evict_after: Option<Duration>,
    pub temperature: f32,
}

impl RolePolicy {
    fn from_config(cfg: &ModelConfig) -> Self {
        Self {
            model_path: PathBuf::from(shellexpand::tilde(&cfg.path).into_owned()),
            context_size: cfg.context_size,
            max_tokens: cfg.max_tokens,
            memory_estimate_mb: cfg.memory_estimate_mb,
            always_resident: cfg.always_resident,
            idle_evict_after: (cfg.idle_evict_after_sec > 0)
                .then(|| Duration::from_secs(cfg.idle_evict_after_sec)),
            temperature: cfg.temperature,
        }
    }
}

/// A live engine paired with its bookkeeping. Unique per role within one
/// manager.
pub struct LoadedEngine {
    pub role: Role,
    pub engine: Arc<dyn Engine>,
    pub model_path: PathBuf,
    pub estimated_mb: u64,
    pub loaded_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RoleUsage {
    pub role: Role,
    pub loaded: bool,
    pub memory_mb: u64,
}

#[derive(Debug, Clone)]
pub struct MemoryUsage {
    pub total_mb: u64,
    pub budget_mb: u64,
    pub available_mb: u64,
    pub utilization_pct: f64,
    pub per_role: Vec<RoleUsage>,
}

struct Inner {
    loaded: HashMap<Role, LoadedEngine>,
    shut_down: bool,
}

pub struct LifecycleManager {
    loader: Box<dyn EngineLoader>,
    policies: HashMap<Role, RolePolicy>,
    budget_mb: u64,
    inner: Mutex<Inner>,
    /// One permit per role: engines are single-writer during generation.
    generation_locks: HashMap<Role, Arc<Semaphore>>,
}

impl LifecycleManager {
    pub fn new(models: &ModelsConfig, budget_mb: u64, loader: Box<dyn EngineLoader>) -> Self {
        let mut policies = HashMap::new();
        policies.insert(Role::Router, RolePolicy::from_config(&models.router));
        policies.insert(Role::Coder, RolePolicy::from_config(&models.coder));
        policies.insert(Role::Algorithm, RolePolicy::from_config(&models.algorithm));

        let generation_locks = Role::ALL
            .iter()
            .map(|role| (*role, Arc::new(Semaphore::new(1))))
            .collect();

        Self {
            loader,
            policies,
            budget_mb,
            inner: Mutex::new(Inner {
                loaded: HashMap::new(),
                shut_down: false,
            }),
            generation_locks,
        }
    }

    pub fn policy(&self, role: Role) -> &RolePolicy {
        &self.policies[&role]
    }

    /// Generation options seeded from the role's policy. Callers override
    /// the deadline and token budget per step.
    pub fn policy_options(&self, role: Role) -> GenerateOptions {
        let policy = self.policy(role);
        GenerateOptions {
            max_tokens: policy.max_tokens,
            temperature: policy.temperature,
            ..Default::default()
        }
    }

    /// Return the engine for `role`, loading it first if necessary.
    /// Concurrent callers for the same role share the first load.
    pub async fn ensure_loaded(&self, role: Role) -> anyhow::Result<Arc<dyn Engine>> {
        let mut inner = self.inner.lock().await;

        if let Some(entry) = inner.loaded.get_mut(&role) {
            entry.last_used_at = Utc::now();
            return Ok(entry.engine.clone());
        }

        let policy = self.policies[&role].clone();
        if !policy.model_path.exists() {
            return Err(anyhow::Error::new(ErrorKind::NotFound(
                policy.model_path.display().to_string(),
            )));
        }

        let need_mb = self.estimate_need_mb(&policy)?;
        if need_mb > self.budget_mb {
            // Nothing to gain from evicting: the model alone is over budget.
            return Err(anyhow::Error::new(ErrorKind::ResourceExhausted {
                need_mb,
                budget_mb: self.budget_mb,
            }));
        }
        self.enforce_budget(&mut inner, need_mb)?;

        info!(role = %role, path = %policy.model_path.display(), need_mb, "loading model");
        let engine = self
            .loader
            .load(
                &policy.model_path,
                &LoadOptions {
                    context_size: policy.context_size,
                    ..Default::default()
                },
            )
            .await?;

        let now = Utc::now();
        let engine: Arc<dyn Engine> = Arc::from(engine);
        inner.loaded.insert(
            role,
            LoadedEngine {
                role,
                engine: engine.clone(),
                model_path: policy.model_path,
                estimated_mb: need_mb,
                loaded_at: now,
                last_used_at: now,
            },
        );
        Ok(engine)
    }

    /// Unload a role's engine. Idempotent when not loaded; always an error
    /// for always-resident roles.
    pub async fn unload(&self, role: Role) -> anyhow::Result<()> {
        if self.policies[&role].always_resident {
            return Err(anyhow::Error::new(ErrorKind::Forbidden(format!(
                "{} is always-resident and only unloads at shutdown",
                role
            ))));
        }
        let mut inner = self.inner.lock().await;
        if inner.loaded.remove(&role).is_some() {
            info!(role = %role, "unloaded model");
        }
        Ok(())
    }

    /// Unload everything, always-resident roles included.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        let roles: Vec<Role> = inner.loaded.keys().copied().collect();
        for role in roles {
            inner.loaded.remove(&role);
            info!(role = %role, "unloaded model at shutdown");
        }
        inner.shut_down = true;
    }

    pub async fn is_loaded(&self, role: Role) -> bool {
        self.inner.lock().await.loaded.contains_key(&role)
    }

    pub async fn loaded_roles(&self) -> Vec<Role> {
        let inner = self.inner.lock().await;
        Role::ALL
            .iter()
            .copied()
            .filter(|r| inner.loaded.contains_key(r))
            .collect()
    }

    pub async fn memory_usage(&self) -> MemoryUsage {
        let inner = self.inner.lock().await;
        let mut per_role = Vec::with_capacity(Role::ALL.len());
        let mut total_mb = 0;
        for role in Role::ALL {
            let memory_mb = inner.loaded.get(&role).map(|e| e.estimated_mb).unwrap_or(0);
            total_mb += memory_mb;
            per_role.push(RoleUsage {
                role,
                loaded: memory_mb > 0 || inner.loaded.contains_key(&role),
                memory_mb,
            });
        }
        MemoryUsage {
            total_mb,
            budget_mb: self.budget_mb,
            available_mb: self.budget_mb.saturating_sub(total_mb),
            utilization_pct: if self.budget_mb > 0 {
                total_mb as f64 / self.budget_mb as f64 * 100.0
            } else {
                0.0
            },
            per_role,
        }
    }

    /// Unload `from` (unless pinned) before loading `to`. Used by the
    /// orchestrator when two specialists cannot be co-resident.
    pub async fn switch(&self, from: Role, to: Role) -> anyhow::Result<Arc<dyn Engine>> {
        if from != to && !self.policies[&from].always_resident {
            self.unload(from).await?;
        }
        self.ensure_loaded(to).await
    }

    /// Generate with the role's engine. The per-role semaphore is taken
    /// before any state lock, and the state lock is never held while the
    /// engine runs.
    pub async fn generate_with(
        &self,
        role: Role,
        prompt: &str,
        opts: &GenerateOptions,
        on_token: Option<mpsc::UnboundedSender<String>>,
    ) -> anyhow::Result<String> {
        let permit = self.generation_locks[&role].clone();
        let _guard = permit.acquire_owned().await?;

        let engine = self.ensure_loaded(role).await?;
        let result = generate_bounded(engine.as_ref(), prompt, opts, on_token).await;

        if result.is_ok() {
            let mut inner = self.inner.lock().await;
            if let Some(entry) = inner.loaded.get_mut(&role) {
                entry.last_used_at = Utc::now();
            }
        }
        result
    }

    fn estimate_need_mb(&self, policy: &RolePolicy) -> anyhow::Result<u64> {
        if policy.memory_estimate_mb > 0 {
            return Ok(policy.memory_estimate_mb);
        }
        let bytes = std::fs::metadata(&policy.model_path)?.len();
        // File size plus mmap/kv-cache overhead.
        Ok((bytes as f64 / (1024.0 * 1024.0) * 1.2) as u64)
    }

    /// Evict least-recently-used, non-pinned engines until `need_mb` fits.
    fn enforce_budget(&self, inner: &mut Inner, need_mb: u64) -> anyhow::Result<()> {
        let total: u64 = inner.loaded.values().map(|e| e.estimated_mb).sum();
        if total + need_mb <= self.budget_mb {
            return Ok(());
        }

        let mut candidates: Vec<(DateTime<Utc>, Role, u64)> = inner
            .loaded
            .values()
            .filter(|e| !self.policies[&e.role].always_resident)
            .map(|e| (e.last_used_at, e.role, e.estimated_mb))
            .collect();
        candidates.sort_by_key(|(last_used, _, _)| *last_used);

        let mut total = total;
        for (_, role, mb) in candidates {
            debug!(role = %role, freed_mb = mb, "evicting for budget");
            inner.loaded.remove(&role);
            total -= mb;
            if total + need_mb <= self.budget_mb {
                return Ok(());
            }
        }

        Err(anyhow::Error::new(ErrorKind::ResourceExhausted {
            need_mb,
            budget_mb: self.budget_mb,
        }))
    }
}
