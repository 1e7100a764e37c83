// Contracts of the external collaborators the orchestrator delegates to, plus
// the defaults used when an agent has no backend configured for them.
//
// The orchestrator only interprets a collaborator's boolean outcome and the
// bytes it writes to the step's sink.

use agent_common::{
    is_boxed_value, ArtifactsInstruction, CacheInstruction, CacheRetrievalAttempt, Environment,
    ResourceUtilization, UploadCacheInstruction, WaitForTerminalInstruction,
};
use agent_sdk::OutputSink;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::resource_monitor::SysinfoResourceMonitor;

/// What every delegated call receives.
pub struct CollaboratorCall<'a> {
    pub cancel: CancellationToken,
    pub sink: Arc<dyn OutputSink>,
    pub command_name: &'a str,
    pub environment: &'a Environment,
}

impl CollaboratorCall<'_> {
    /// Write a line to the step's log.
    pub async fn log(&self, message: &str) {
        let _ = self
            .sink
            .write_output(format!("{message}\n").as_bytes())
            .await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SecretResolutionError {
    /// The value is not a boxed secret; it passes through unchanged.
    #[error("value is not a boxed secret")]
    NotBoxed,
    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Resolve `boxed` using the fully expanded staged environment.
    async fn resolve(
        &self,
        boxed: &str,
        staged: &HashMap<String, String>,
    ) -> Result<String, SecretResolutionError>;
}

#[async_trait]
pub trait CacheManager: Send + Sync {
    async fn populate(
        &self,
        call: &CollaboratorCall<'_>,
        instruction: &CacheInstruction,
        registry: &CacheRegistry,
    ) -> bool;

    async fn upload(
        &self,
        call: &CollaboratorCall<'_>,
        instruction: &UploadCacheInstruction,
        registry: &CacheRegistry,
    ) -> bool;
}

#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    async fn upload(&self, call: &CollaboratorCall<'_>, instruction: &ArtifactsInstruction) -> bool;
}

#[async_trait]
pub trait RepositoryCloner: Send + Sync {
    async fn clone_repository(&self, call: &CollaboratorCall<'_>) -> bool;
}

#[async_trait]
pub trait TerminalWaiter: Send + Sync {
    async fn wait(
        &self,
        call: &CollaboratorCall<'_>,
        instruction: &WaitForTerminalInstruction,
    ) -> bool;
}

/// Summary produced by a resource monitor when its scope ends.
#[derive(Debug, Clone, Default)]
pub struct MonitorResult {
    pub utilization: Option<ResourceUtilization>,
    pub errors: Vec<String>,
}

pub trait ResourceMonitor: Send + Sync {
    /// Start sampling until `cancel` fires; the result is sent once.
    fn start(&self, cancel: CancellationToken) -> oneshot::Receiver<MonitorResult>;
}

/// A cache declared by a cache instruction during this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub name: String,
    pub folders: Vec<String>,
    pub key: String,
    pub hit: bool,
}

/// Caches declared during one run. Owned by the run and passed to the cache
/// manager explicitly.
#[derive(Debug, Default)]
pub struct CacheRegistry {
    entries: Mutex<Vec<CacheEntry>>,
    attempts: Mutex<HashMap<String, CacheRetrievalAttempt>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry`, replacing an earlier entry with the same name.
    pub fn register(&self, entry: CacheEntry) {
        let mut entries = self.entries.lock();
        entries.retain(|e| e.name != entry.name);
        entries.push(entry);
    }

    pub fn find(&self, name: &str) -> Option<CacheEntry> {
        self.entries.lock().iter().find(|e| e.name == name).cloned()
    }

    pub fn entries(&self) -> Vec<CacheEntry> {
        self.entries.lock().clone()
    }

    pub fn record_attempt(&self, name: &str, attempt: CacheRetrievalAttempt) {
        self.attempts.lock().insert(name.to_string(), attempt);
    }

    /// Diagnostics for the final report.
    pub fn attempts(&self) -> HashMap<String, CacheRetrievalAttempt> {
        self.attempts.lock().clone()
    }
}

/// Records every cache as a miss and never uploads.
pub struct DisabledCacheManager;

#[async_trait]
impl CacheManager for DisabledCacheManager {
    async fn populate(
        &self,
        call: &CollaboratorCall<'_>,
        instruction: &CacheInstruction,
        registry: &CacheRegistry,
    ) -> bool {
        let name = call.command_name.trim_end_matches("_cache");
        let key = instruction
            .fingerprint_key
            .clone()
            .unwrap_or_else(|| name.to_string());

        registry.register(CacheEntry {
            name: name.to_string(),
            folders: instruction.folders.clone(),
            key,
            hit: false,
        });
        registry.record_attempt(
            name,
            CacheRetrievalAttempt {
                hit: false,
                error: "caching is not configured for this agent".into(),
                ..CacheRetrievalAttempt::default()
            },
        );

        call.log(&format!(
            "Caching is not configured for this agent, cache '{name}' will not be restored."
        ))
        .await;
        true
    }

    async fn upload(
        &self,
        call: &CollaboratorCall<'_>,
        instruction: &UploadCacheInstruction,
        registry: &CacheRegistry,
    ) -> bool {
        match registry.find(&instruction.cache_name) {
            Some(entry) => {
                call.log(&format!(
                    "Caching is not configured for this agent, skipping upload of cache '{}'.",
                    entry.name
                ))
                .await;
                true
            }
            None => {
                call.log(&format!("No cache found with name '{}'!", instruction.cache_name))
                    .await;
                false
            }
        }
    }
}

pub struct DisabledArtifactUploader;

#[async_trait]
impl ArtifactUploader for DisabledArtifactUploader {
    async fn upload(&self, call: &CollaboratorCall<'_>, instruction: &ArtifactsInstruction) -> bool {
        call.log(&format!(
            "Artifact upload is not configured for this agent, skipping {} path(s).",
            instruction.paths.len()
        ))
        .await;
        true
    }
}

pub struct UnsupportedCloner;

#[async_trait]
impl RepositoryCloner for UnsupportedCloner {
    async fn clone_repository(&self, call: &CollaboratorCall<'_>) -> bool {
        call.log("Cloning is not supported by this agent, use a script instruction instead.")
            .await;
        false
    }
}

pub struct NoTerminalWaiter;

#[async_trait]
impl TerminalWaiter for NoTerminalWaiter {
    async fn wait(
        &self,
        call: &CollaboratorCall<'_>,
        instruction: &WaitForTerminalInstruction,
    ) -> bool {
        if instruction.terminal_server_address.is_empty() {
            call.log("No terminal server configured, not waiting for a terminal.")
                .await;
        } else {
            call.log(&format!(
                "Terminal access via {} is not supported by this agent.",
                instruction.terminal_server_address
            ))
            .await;
        }
        true
    }
}

/// Fails every boxed value: no secret backend is configured.
pub struct UnavailableSecretResolver;

#[async_trait]
impl SecretResolver for UnavailableSecretResolver {
    async fn resolve(
        &self,
        boxed: &str,
        _staged: &HashMap<String, String>,
    ) -> Result<String, SecretResolutionError> {
        if !is_boxed_value(boxed) {
            return Err(SecretResolutionError::NotBoxed);
        }
        Err(SecretResolutionError::Failed(
            "no secret backend is configured for this agent".into(),
        ))
    }
}

/// The collaborators one run delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub cache: Arc<dyn CacheManager>,
    pub artifacts: Arc<dyn ArtifactUploader>,
    pub cloner: Arc<dyn RepositoryCloner>,
    pub terminal: Arc<dyn TerminalWaiter>,
    pub secrets: Arc<dyn SecretResolver>,
    pub resources: Arc<dyn ResourceMonitor>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            cache: Arc::new(DisabledCacheManager),
            artifacts: Arc::new(DisabledArtifactUploader),
            cloner: Arc::new(UnsupportedCloner),
            terminal: Arc::new(NoTerminalWaiter),
            secrets: Arc::new(UnavailableSecretResolver),
            resources: Arc::new(SysinfoResourceMonitor::default()),
        }
    }
}
