pub mod arm;
pub mod config;
pub mod credential;
pub mod engine;
pub mod memory;
pub mod resources;
pub mod types;

pub use arm::{ArmClient, ArmError, ArmResult, ManagementApi};
pub use config::{
    ClientOptions, CloudEndpoints, CloudEnvironment, ConfigError, FileSettings, ResourceNames,
    ServicePrincipal, Settings,
};
pub use credential::{
    AccessToken, AzureCliCredential, ClientSecretCredential, CredentialError, DefaultCredential,
    ManagedIdentityCredential, TokenCache, TokenCredential,
};
pub use engine::{ProvisionEngine, ProvisionError};
pub use memory::{ApiCall, InMemoryManagementApi};
pub use resources::{ImageReference, ResourceId};
pub use types::{
    ActionReport, EnsureOutcome, ProvisionMode, ProvisionReport, ResourceKind, StepResult,
    VmAction,
};

/// Builds a management client for `settings` using the default credential chain.
pub fn connect(settings: &Settings) -> Result<ArmClient, ArmError> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("arm-provision/", env!("CARGO_PKG_VERSION")))
        .timeout(std::time::Duration::from_secs(60))
        .build()?;
    let credential = DefaultCredential::from_settings(http.clone(), settings);
    tracing::debug!(sources = ?credential.source_names(), "credential chain");
    let tokens = TokenCache::new(Box::new(credential), settings.cloud.scope());
    Ok(ArmClient::new(
        http,
        settings.cloud.resource_manager.clone(),
        tokens,
        settings.client.clone(),
    ))
}
