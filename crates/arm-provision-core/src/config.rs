use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

pub const SUBSCRIPTION_ENV: &str = "ARM_SUBSCRIPTION_ID";
pub const VM_PASSWORD_ENV: &str = "VM_PASSWORD";
pub const SQL_PASSWORD_ENV: &str = "SQL_PASSWORD";
pub const ENVIRONMENT_ENV: &str = "ARM_ENVIRONMENT";
pub const AUTHORITY_HOST_ENV: &str = "AZURE_AUTHORITY_HOST";
pub const RESOURCE_MANAGER_ENV: &str = "ARM_RESOURCE_MANAGER_ENDPOINT";

const TENANT_ENV: &[&str] = &["ARM_TENANT_ID", "AZURE_TENANT_ID"];
const CLIENT_ID_ENV: &[&str] = &["ARM_CLIENT_ID", "AZURE_CLIENT_ID"];
const CLIENT_SECRET_ENV: &[&str] = &["ARM_CLIENT_SECRET", "AZURE_CLIENT_SECRET"];

pub const DEFAULT_LOCATION: &str = "eastus";
pub const DEFAULT_VM_USERNAME: &str = "pyvmtest";
pub const DEFAULT_VM_SIZE: &str = "Standard_DS1_v2";
pub const DEFAULT_SQL_ADMIN_LOGIN: &str = "adminuser";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    MissingEnv(&'static str),
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("unknown cloud environment: {0}")]
    UnknownEnvironment(String),
}

/// Names of the managed resources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceNames {
    pub resource_group: String,
    pub virtual_network: String,
    pub subnet: String,
    pub network_interface: String,
    pub virtual_machine: String,
    pub sql_server: String,
    pub sql_database: String,
    pub storage_account: String,
}

impl Default for ResourceNames {
    fn default() -> Self {
        Self {
            resource_group: "py-testing".to_string(),
            virtual_network: "pytesting-vnet".to_string(),
            subnet: "pytesting-subnet-1".to_string(),
            network_interface: "pytesting-vm-nic".to_string(),
            virtual_machine: "pytesting-vm".to_string(),
            sql_server: "pytestingbr1-sql-server".to_string(),
            sql_database: "pytestingbr1-database".to_string(),
            storage_account: "pytestingstorageaccount".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CloudEnvironment {
    #[default]
    Public,
    UsGovernment,
    China,
}

impl CloudEnvironment {
    pub fn login_endpoint(&self) -> &'static str {
        match self {
            Self::Public => "https://login.microsoftonline.com",
            Self::UsGovernment => "https://login.microsoftonline.us",
            Self::China => "https://login.chinacloudapi.cn",
        }
    }

    pub fn resource_manager_endpoint(&self) -> &'static str {
        match self {
            Self::Public => "https://management.azure.com",
            Self::UsGovernment => "https://management.usgovcloudapi.net",
            Self::China => "https://management.chinacloudapi.cn",
        }
    }
}

impl FromStr for CloudEnvironment {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "public" | "azurecloud" => Ok(Self::Public),
            "usgovernment" | "azureusgovernment" | "azureusgovernmentcloud" => {
                Ok(Self::UsGovernment)
            }
            "china" | "azurechinacloud" => Ok(Self::China),
            _ => Err(ConfigError::UnknownEnvironment(value.to_string())),
        }
    }
}

/// Resolved endpoints for the selected cloud, after overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudEndpoints {
    pub environment: CloudEnvironment,
    pub login: String,
    pub resource_manager: String,
}

impl CloudEndpoints {
    /// OAuth scope for the management API.
    pub fn scope(&self) -> String {
        format!("{}/.default", self.resource_manager)
    }
}

/// Timing knobs for the management API client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub poll_interval: Duration,
    pub operation_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(30 * 60),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Service principal read from the environment.
#[derive(Debug)]
pub struct ServicePrincipal {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: SecretString,
}

/// Overrides accepted in the optional JSON settings file.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FileSettings {
    pub location: Option<String>,
    pub names: Option<ResourceNames>,
    pub vm_admin_username: Option<String>,
    pub vm_size: Option<String>,
    pub sql_admin_login: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub operation_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
}

impl FileSettings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_reader(file).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug)]
pub struct Settings {
    pub subscription_id: String,
    pub location: String,
    pub names: ResourceNames,
    pub vm_admin_username: String,
    pub vm_size: String,
    pub vm_admin_password: Option<SecretString>,
    pub sql_admin_login: String,
    pub sql_admin_password: Option<SecretString>,
    pub cloud: CloudEndpoints,
    pub service_principal: Option<ServicePrincipal>,
    pub managed_identity_client_id: Option<String>,
    pub client: ClientOptions,
}

impl Settings {
    /// Reads settings from the process environment and an optional file.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = config_path
            .map(FileSettings::load)
            .transpose()?
            .unwrap_or_default();
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    pub fn from_sources<F>(file: FileSettings, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let first = |keys: &[&str]| keys.iter().find_map(|key| var(*key));

        let subscription_id = var(SUBSCRIPTION_ENV).ok_or(ConfigError::MissingEnv(SUBSCRIPTION_ENV))?;

        let environment = var(ENVIRONMENT_ENV)
            .map(|value| value.parse::<CloudEnvironment>())
            .transpose()?
            .unwrap_or_default();
        let cloud = CloudEndpoints {
            environment,
            login: var(AUTHORITY_HOST_ENV)
                .unwrap_or_else(|| environment.login_endpoint().to_string())
                .trim_end_matches('/')
                .to_string(),
            resource_manager: var(RESOURCE_MANAGER_ENV)
                .unwrap_or_else(|| environment.resource_manager_endpoint().to_string())
                .trim_end_matches('/')
                .to_string(),
        };

        let client_id = first(CLIENT_ID_ENV);
        let service_principal = match (first(TENANT_ENV), client_id.clone(), first(CLIENT_SECRET_ENV)) {
            (Some(tenant_id), Some(client_id), Some(secret)) => Some(ServicePrincipal {
                tenant_id,
                client_id,
                client_secret: SecretString::from(secret),
            }),
            _ => None,
        };
        // Without a secret, a client id selects a user-assigned managed identity.
        let managed_identity_client_id = if service_principal.is_none() {
            client_id
        } else {
            None
        };

        let defaults = ClientOptions::default();
        let client = ClientOptions {
            poll_interval: file
                .poll_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            operation_timeout: file
                .operation_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.operation_timeout),
            max_retries: file.max_retries.unwrap_or(defaults.max_retries),
            retry_delay: defaults.retry_delay,
        };

        Ok(Self {
            subscription_id,
            location: file.location.unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
            names: file.names.unwrap_or_default(),
            vm_admin_username: file
                .vm_admin_username
                .unwrap_or_else(|| DEFAULT_VM_USERNAME.to_string()),
            vm_size: file.vm_size.unwrap_or_else(|| DEFAULT_VM_SIZE.to_string()),
            vm_admin_password: var(VM_PASSWORD_ENV).map(SecretString::from),
            sql_admin_login: file
                .sql_admin_login
                .unwrap_or_else(|| DEFAULT_SQL_ADMIN_LOGIN.to_string()),
            sql_admin_password: var(SQL_PASSWORD_ENV).map(SecretString::from),
            cloud,
            service_principal,
            managed_identity_client_id,
            client,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use secrecy::ExposeSecret;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_subscription_is_fatal() {
        let err = Settings::from_sources(FileSettings::default(), env(&[]))
            .expect_err("subscription is required");
        assert!(matches!(err, ConfigError::MissingEnv(SUBSCRIPTION_ENV)));
        assert_eq!(err.to_string(), "ARM_SUBSCRIPTION_ID environment variable not set");
    }

    #[test]
    fn empty_subscription_counts_as_missing() {
        let err = Settings::from_sources(FileSettings::default(), env(&[(SUBSCRIPTION_ENV, "  ")]))
            .expect_err("blank subscription");
        assert!(matches!(err, ConfigError::MissingEnv(_)));
    }

    #[test]
    fn defaults_match_fixed_environment() {
        let settings =
            Settings::from_sources(FileSettings::default(), env(&[(SUBSCRIPTION_ENV, "sub")]))
                .expect("settings");
        assert_eq!(settings.location, "eastus");
        assert_eq!(settings.names.resource_group, "py-testing");
        assert_eq!(settings.names.storage_account, "pytestingstorageaccount");
        assert_eq!(settings.vm_admin_username, "pyvmtest");
        assert!(settings.vm_admin_password.is_none());
        assert!(settings.service_principal.is_none());
        assert_eq!(settings.cloud.resource_manager, "https://management.azure.com");
        assert_eq!(settings.cloud.scope(), "https://management.azure.com/.default");
        assert_eq!(settings.client, ClientOptions::default());
    }

    #[test]
    fn service_principal_requires_all_three_values() {
        let partial = Settings::from_sources(
            FileSettings::default(),
            env(&[(SUBSCRIPTION_ENV, "sub"), ("ARM_CLIENT_ID", "app")]),
        )
        .expect("settings");
        assert!(partial.service_principal.is_none());
        assert_eq!(partial.managed_identity_client_id.as_deref(), Some("app"));

        let full = Settings::from_sources(
            FileSettings::default(),
            env(&[
                (SUBSCRIPTION_ENV, "sub"),
                ("AZURE_TENANT_ID", "tenant"),
                ("ARM_CLIENT_ID", "app"),
                ("ARM_CLIENT_SECRET", "shh"),
                (VM_PASSWORD_ENV, "vm-pass"),
            ]),
        )
        .expect("settings");
        let principal = full.service_principal.expect("principal");
        assert_eq!(principal.tenant_id, "tenant");
        assert_eq!(principal.client_secret.expose_secret(), "shh");
        assert!(full.managed_identity_client_id.is_none());
        assert_eq!(
            full.vm_admin_password.as_ref().map(|p| p.expose_secret()),
            Some("vm-pass")
        );
    }

    #[test]
    fn endpoint_overrides_and_environment() {
        let settings = Settings::from_sources(
            FileSettings::default(),
            env(&[
                (SUBSCRIPTION_ENV, "sub"),
                (ENVIRONMENT_ENV, "china"),
                (RESOURCE_MANAGER_ENV, "http://127.0.0.1:9000/"),
            ]),
        )
        .expect("settings");
        assert_eq!(settings.cloud.environment, CloudEnvironment::China);
        assert_eq!(settings.cloud.login, "https://login.chinacloudapi.cn");
        assert_eq!(settings.cloud.resource_manager, "http://127.0.0.1:9000");

        let err = Settings::from_sources(
            FileSettings::default(),
            env(&[(SUBSCRIPTION_ENV, "sub"), (ENVIRONMENT_ENV, "mars")]),
        )
        .expect_err("unknown cloud");
        assert!(matches!(err, ConfigError::UnknownEnvironment(_)));
    }

    #[test]
    fn file_overrides_apply_and_unknown_keys_fail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        let mut file = File::create(&path).expect("create");
        write!(
            file,
            r#"{{"location": "westeurope", "poll_interval_secs": 1, "names": {{"virtual_machine": "lab-vm"}}}}"#
        )
        .expect("write");

        let file_settings = FileSettings::load(&path).expect("load");
        let settings =
            Settings::from_sources(file_settings, env(&[(SUBSCRIPTION_ENV, "sub")])).expect("settings");
        assert_eq!(settings.location, "westeurope");
        assert_eq!(settings.names.virtual_machine, "lab-vm");
        assert_eq!(settings.names.subnet, "pytesting-subnet-1");
        assert_eq!(settings.client.poll_interval, Duration::from_secs(1));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, r#"{"region": "westeurope"}"#).expect("write");
        assert!(matches!(
            FileSettings::load(&bad),
            Err(ConfigError::Json { .. })
        ));
    }
}
