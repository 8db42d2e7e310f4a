use serde_json::Value;
use tracing::info;

use crate::arm::{ArmError, ManagementApi};
use crate::config::{SQL_PASSWORD_ENV, Settings, VM_PASSWORD_ENV};
use crate::resources::{
    ImageReference, ResourceId, VirtualMachineSpec, network_interface_body, resource_group_body,
    sql_database_body, sql_server_body, storage_account_body, subnet_body, virtual_machine_body,
    virtual_network_body,
};
use crate::types::{
    ActionReport, EnsureOutcome, ProvisionMode, ProvisionReport, ResourceKind, StepResult, VmAction,
};

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Arm(#[from] ArmError),
    #[error("{0} environment variable not set; it is required to create the {1}")]
    MissingSecret(&'static str, ResourceKind),
    #[error("{kind} '{name}' has no `{property}` in its response")]
    MissingProperty {
        kind: ResourceKind,
        name: String,
        property: &'static str,
    },
}

pub struct ProvisionEngine<A: ManagementApi> {
    api: A,
    settings: Settings,
    image: ImageReference,
}

impl<A: ManagementApi> ProvisionEngine<A> {
    pub fn new(api: A, settings: Settings) -> Self {
        Self {
            api,
            settings,
            image: ImageReference::default(),
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn resource_id(&self, kind: ResourceKind) -> ResourceId {
        kind.resource_id(&self.settings.subscription_id, &self.settings.names)
    }

    /// Ensures every resource, in dependency order.
    pub async fn run(&self, mode: ProvisionMode) -> Result<ProvisionReport, ProvisionError> {
        info!("Starting resource creation or update process...");
        let mut steps = Vec::new();
        for kind in ResourceKind::ALL {
            steps.push(self.ensure(kind, mode).await?);
        }
        info!("Resource creation or update process completed.");
        Ok(ProvisionReport { mode, steps })
    }

    pub async fn ensure(
        &self,
        kind: ResourceKind,
        mode: ProvisionMode,
    ) -> Result<StepResult, ProvisionError> {
        let id = self.resource_id(kind);
        let name = kind.name(&self.settings.names).to_string();
        info!("Ensuring {} '{}'...", kind, name);

        let outcome = if kind.is_unconditional() {
            match mode {
                ProvisionMode::DryRun => EnsureOutcome::WouldEnsure,
                ProvisionMode::Apply => {
                    self.create(kind, &id).await?;
                    EnsureOutcome::Ensured
                }
            }
        } else if self.exists(kind, &id).await? {
            EnsureOutcome::Found
        } else {
            match mode {
                ProvisionMode::DryRun => EnsureOutcome::WouldCreate,
                ProvisionMode::Apply => {
                    self.create(kind, &id).await?;
                    EnsureOutcome::Created
                }
            }
        };

        info!("{} '{}' {}.", kind, name, outcome.describe());
        Ok(StepResult {
            kind,
            name,
            resource_id: id.into(),
            outcome,
        })
    }

    async fn exists(&self, kind: ResourceKind, id: &ResourceId) -> Result<bool, ProvisionError> {
        match self.api.get(id, kind.api_version()).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn create(&self, kind: ResourceKind, id: &ResourceId) -> Result<Value, ProvisionError> {
        let body = self.body_for(kind).await?;
        Ok(self
            .api
            .create_or_update(id, kind.api_version(), &body)
            .await?)
    }

    async fn body_for(&self, kind: ResourceKind) -> Result<Value, ProvisionError> {
        let location = self.settings.location.as_str();
        let body = match kind {
            ResourceKind::ResourceGroup => resource_group_body(location),
            ResourceKind::VirtualNetwork => virtual_network_body(location),
            ResourceKind::Subnet => subnet_body(),
            ResourceKind::NetworkInterface => {
                let subnet_id = self.existing_id(ResourceKind::Subnet).await?;
                network_interface_body(location, &subnet_id)
            }
            ResourceKind::VirtualMachine => {
                let password = self
                    .settings
                    .vm_admin_password
                    .as_ref()
                    .ok_or(ProvisionError::MissingSecret(VM_PASSWORD_ENV, kind))?;
                let nic_id = self.existing_id(ResourceKind::NetworkInterface).await?;
                virtual_machine_body(&VirtualMachineSpec {
                    location,
                    computer_name: &self.settings.names.virtual_machine,
                    size: &self.settings.vm_size,
                    image: &self.image,
                    admin_username: &self.settings.vm_admin_username,
                    admin_password: password,
                    nic_id: &nic_id,
                })
            }
            ResourceKind::SqlServer => {
                let password = self
                    .settings
                    .sql_admin_password
                    .as_ref()
                    .ok_or(ProvisionError::MissingSecret(SQL_PASSWORD_ENV, kind))?;
                sql_server_body(location, &self.settings.sql_admin_login, password)
            }
            ResourceKind::SqlDatabase => sql_database_body(location),
            ResourceKind::StorageAccount => storage_account_body(location),
        };
        Ok(body)
    }

    /// Looks up a dependency and returns its full resource id.
    async fn existing_id(&self, kind: ResourceKind) -> Result<String, ProvisionError> {
        let body = self
            .api
            .get(&self.resource_id(kind), kind.api_version())
            .await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProvisionError::MissingProperty {
                kind,
                name: kind.name(&self.settings.names).to_string(),
                property: "id",
            })
    }

    pub async fn run_vm_action(
        &self,
        action: VmAction,
        mode: ProvisionMode,
    ) -> Result<ActionReport, ProvisionError> {
        let kind = ResourceKind::VirtualMachine;
        let id = self.resource_id(kind);
        let vm_name = self.settings.names.virtual_machine.clone();
        info!("{} VM: {}", action.present_participle(), vm_name);

        let performed = match mode {
            ProvisionMode::DryRun => {
                self.api.get(&id, kind.api_version()).await?;
                info!("VM {} exists; dry run, not {}.", vm_name, action.past_tense());
                false
            }
            ProvisionMode::Apply => {
                match action {
                    VmAction::Start => {
                        self.api
                            .post_action(&id, "start", kind.api_version())
                            .await?
                    }
                    VmAction::Stop => {
                        self.api
                            .post_action(&id, "deallocate", kind.api_version())
                            .await?
                    }
                    VmAction::Delete => self.api.delete(&id, kind.api_version()).await?,
                }
                info!("VM {} {} successfully.", vm_name, action.past_tense());
                true
            }
        };

        Ok(ActionReport {
            action,
            mode,
            vm_name,
            resource_id: id.into(),
            performed,
        })
    }

    pub async fn start_vm(&self) -> Result<ActionReport, ProvisionError> {
        self.run_vm_action(VmAction::Start, ProvisionMode::Apply).await
    }

    /// Deallocates the VM so compute is no longer billed.
    pub async fn stop_vm(&self) -> Result<ActionReport, ProvisionError> {
        self.run_vm_action(VmAction::Stop, ProvisionMode::Apply).await
    }

    pub async fn delete_vm(&self) -> Result<ActionReport, ProvisionError> {
        self.run_vm_action(VmAction::Delete, ProvisionMode::Apply).await
    }
}
