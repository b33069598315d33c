//! LLM Registry.
//!
//! Constructs and holds all configured [`LlmService`] instances. At startup
//! (and on every `update_configs` call thereafter) the registry reads the
//! [`LlmConfig`], resolves authentication, and instantiates the appropriate
//! adapter for each configured provider, wrapping it in a service that tracks
//! retry/availability state across calls.
//!
//! Config updates are applied by building a brand new provider map off to the
//! side and swapping it into place under a single write-lock acquisition, so
//! readers never observe a partially-rebuilt registry.

use crate::llm_service::LlmService;
use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;
use parking_lot::RwLock;
use sa_domain::config::{LlmConfig, LlmStartupPolicy};
use sa_domain::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ProviderRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Records a provider that failed to initialize.
#[derive(Debug, Clone)]
pub struct ProviderInitError {
    pub provider_id: String,
    pub kind: String,
    /// Error message with any potential secrets masked.
    pub error: String,
}

/// One row of [`ProviderRegistry::available_summaries`] — what the planner
/// sees when choosing which service to hand a piece of work to.
#[derive(Debug, Clone)]
pub struct LlmSummary {
    pub id: String,
    pub model: String,
    pub strengths: String,
    pub weaknesses: String,
    pub cost_per_1m: f64,
    pub is_available: bool,
}

/// Mask substrings that look like API keys or bearer tokens in an error
/// message. This prevents raw secrets from leaking into logs, readiness
/// endpoints, or dashboard UIs.
fn mask_secrets(msg: &str) -> String {
    let mut result = msg.to_string();
    for word in msg.split(|c: char| c.is_whitespace() || c == '\'' || c == '"' || c == ',') {
        let trimmed = word.trim();
        if trimmed.len() >= 20
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            let masked = if trimmed.len() > 8 {
                format!("{}...{}", &trimmed[..4], &trimmed[trimmed.len() - 4..])
            } else {
                "***masked***".to_string()
            };
            result = result.replace(trimmed, &masked);
        }
    }
    result
}

/// Every configured provider speaks the OpenAI-compatible chat-completions
/// wire format; `kind` only selects which auth mode dresses the request.
fn build_provider(pc: &sa_domain::config::ProviderConfig) -> Result<Arc<dyn LlmProvider>> {
    OpenAiCompatProvider::from_config(pc).map(|p| Arc::new(p) as Arc<dyn LlmProvider>)
}

fn build_services(
    config: &LlmConfig,
) -> (HashMap<String, Arc<LlmService>>, Vec<ProviderInitError>) {
    let mut services: HashMap<String, Arc<LlmService>> = HashMap::new();
    let mut init_errors: Vec<ProviderInitError> = Vec::new();

    for pc in &config.providers {
        match build_provider(pc) {
            Ok(provider) => {
                tracing::info!(provider_id = %pc.id, kind = ?pc.kind, "registered LLM provider");
                let model = pc.default_model.clone().unwrap_or_default();
                let pricing = config.pricing.get(&model).copied();
                let service = LlmService::new(pc.id.clone(), model, provider, pricing, pc);
                services.insert(pc.id.clone(), Arc::new(service));
            }
            Err(e) => {
                let safe_error = mask_secrets(&e.to_string());
                tracing::warn!(
                    provider_id = %pc.id,
                    kind = ?pc.kind,
                    error = %safe_error,
                    "failed to initialize LLM provider, skipping"
                );
                init_errors.push(ProviderInitError {
                    provider_id: pc.id.clone(),
                    kind: format!("{:?}", pc.kind),
                    error: safe_error,
                });
            }
        }
    }

    (services, init_errors)
}

fn check_startup_policy(config: &LlmConfig, services_empty: bool, init_errors_len: usize) -> Result<()> {
    if !services_empty || config.providers.is_empty() {
        return Ok(());
    }

    let effective_policy = if config.startup_policy != LlmStartupPolicy::AllowNone {
        config.startup_policy
    } else if config.require_provider
        || std::env::var("SA_REQUIRE_LLM")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false)
    {
        LlmStartupPolicy::RequireOne
    } else {
        LlmStartupPolicy::AllowNone
    };

    match effective_policy {
        LlmStartupPolicy::RequireOne => Err(Error::Config(
            "all configured LLM providers failed to initialize (startup_policy = require_one)".into(),
        )),
        LlmStartupPolicy::AllowNone => {
            tracing::warn!(
                failed_providers = init_errors_len,
                "no LLM providers initialized (startup_policy = allow_none); \
                 gateway will boot but LLM endpoints will fail until auth \
                 is configured — check /v1/models/readiness for details"
            );
            Ok(())
        }
    }
}

/// Holds all instantiated LLM services and role assignments.
///
/// Mutable state (provider map, roles, init errors) lives behind a
/// [`RwLock`] so `update_configs` can swap in a freshly-built registry
/// atomically, while most calls (`get`, `for_role`, summaries) only need a
/// read lock.
pub struct ProviderRegistry {
    inner: RwLock<Inner>,
}

struct Inner {
    services: HashMap<String, Arc<LlmService>>,
    roles: HashMap<String, String>,
    init_errors: Vec<ProviderInitError>,
}

impl ProviderRegistry {
    /// Build the registry from the application's [`LlmConfig`].
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let (services, init_errors) = build_services(config);
        check_startup_policy(config, services.is_empty(), init_errors.len())?;

        let mut roles = HashMap::new();
        for (role_name, role_cfg) in &config.roles {
            roles.insert(role_name.clone(), role_cfg.model.clone());
        }

        Ok(Self {
            inner: RwLock::new(Inner {
                services,
                roles,
                init_errors,
            }),
        })
    }

    /// Rebuild every service from a new config and swap it into place.
    ///
    /// Rebuilding happens entirely outside the lock; only the final swap is
    /// guarded, so in-flight calls against the old services finish unaffected
    /// and no caller ever observes a partially-rebuilt registry.
    pub fn update_configs(&self, config: &LlmConfig) -> Result<()> {
        let (services, init_errors) = build_services(config);
        check_startup_policy(config, services.is_empty(), init_errors.len())?;

        let mut roles = HashMap::new();
        for (role_name, role_cfg) in &config.roles {
            roles.insert(role_name.clone(), role_cfg.model.clone());
        }

        let mut guard = self.inner.write();
        guard.services = services;
        guard.roles = roles;
        guard.init_errors = init_errors;
        Ok(())
    }

    /// Look up a service by its config id.
    pub fn get(&self, provider_id: &str) -> Option<Arc<LlmService>> {
        self.inner.read().services.get(provider_id).cloned()
    }

    /// Get the service assigned to a given role (e.g. "planner", "executor").
    /// The role config stores "provider_id/model_name"; we split on '/' and
    /// look up the service by the first segment.
    pub fn for_role(&self, role: &str) -> Option<Arc<LlmService>> {
        let guard = self.inner.read();
        let model_spec = guard.roles.get(role)?;
        let provider_id = model_spec.split('/').next().unwrap_or(model_spec);
        guard.services.get(provider_id).cloned()
    }

    /// Get the model name assigned to a given role.
    pub fn model_for_role(&self, role: &str) -> Option<String> {
        self.inner.read().roles.get(role).cloned()
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.inner.read().services.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().services.is_empty()
    }

    /// List all registered service IDs (sorted).
    pub fn list_providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().services.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// List roles and their assigned model specs.
    pub fn list_roles(&self) -> HashMap<String, String> {
        self.inner.read().roles.clone()
    }

    /// Provider initialization errors (empty if all succeeded).
    pub fn init_errors(&self) -> Vec<ProviderInitError> {
        self.inner.read().init_errors.clone()
    }

    /// Summaries of every service whose estimated per-1M-token cost fits
    /// within `remaining_budget`, for the planner to choose among.
    /// `None` budget means unlimited.
    pub fn available_summaries(&self, remaining_budget: Option<f64>) -> Vec<LlmSummary> {
        let guard = self.inner.read();
        let mut out: Vec<LlmSummary> = guard
            .services
            .values()
            .filter(|svc| match remaining_budget {
                Some(budget) => svc.cost_per_1m() <= budget,
                None => true,
            })
            .map(|svc| LlmSummary {
                id: svc.id.clone(),
                model: svc.model.clone(),
                strengths: svc.strengths(),
                weaknesses: svc.weaknesses(),
                cost_per_1m: svc.cost_per_1m(),
                is_available: svc.is_available(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Update the free-form strengths/weaknesses notes for a service.
    /// No-op (returns `false`) if `provider_id` isn't registered.
    pub fn update_llm_notes(
        &self,
        provider_id: &str,
        strengths: Option<String>,
        weaknesses: Option<String>,
    ) -> bool {
        let guard = self.inner.read();
        match guard.services.get(provider_id) {
            Some(svc) => {
                svc.update_notes(strengths, weaknesses);
                true
            }
            None => false,
        }
    }
}
