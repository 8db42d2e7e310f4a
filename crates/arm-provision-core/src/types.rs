use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionMode {
    Apply,
    DryRun,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    ResourceGroup,
    VirtualNetwork,
    Subnet,
    NetworkInterface,
    VirtualMachine,
    SqlServer,
    SqlDatabase,
    StorageAccount,
}

impl ResourceKind {
    /// Provisioning order; later kinds reference earlier ones.
    pub const ALL: [ResourceKind; 8] = [
        ResourceKind::ResourceGroup,
        ResourceKind::VirtualNetwork,
        ResourceKind::Subnet,
        ResourceKind::NetworkInterface,
        ResourceKind::VirtualMachine,
        ResourceKind::SqlServer,
        ResourceKind::SqlDatabase,
        ResourceKind::StorageAccount,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::ResourceGroup => "resource group",
            Self::VirtualNetwork => "virtual network",
            Self::Subnet => "subnet",
            Self::NetworkInterface => "network interface",
            Self::VirtualMachine => "virtual machine",
            Self::SqlServer => "SQL server",
            Self::SqlDatabase => "SQL database",
            Self::StorageAccount => "storage account",
        }
    }

    /// Kinds that are always create-or-updated instead of looked up first.
    pub fn is_unconditional(&self) -> bool {
        matches!(self, Self::ResourceGroup | Self::SqlDatabase)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnsureOutcome {
    Found,
    Created,
    Ensured,
    WouldCreate,
    WouldEnsure,
}

impl EnsureOutcome {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Found => "found",
            Self::Created => "created",
            Self::Ensured => "ensured",
            Self::WouldCreate => "would create",
            Self::WouldEnsure => "would ensure",
        }
    }

    pub fn changed(&self) -> bool {
        matches!(self, Self::Created | Self::Ensured)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepResult {
    pub kind: ResourceKind,
    pub name: String,
    pub resource_id: String,
    pub outcome: EnsureOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisionReport {
    pub mode: ProvisionMode,
    pub steps: Vec<StepResult>,
}

impl ProvisionReport {
    pub fn outcome_of(&self, kind: ResourceKind) -> Option<EnsureOutcome> {
        self.steps
            .iter()
            .find(|step| step.kind == kind)
            .map(|step| step.outcome)
    }

    pub fn changed_count(&self) -> usize {
        self.steps.iter().filter(|step| step.outcome.changed()).count()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VmAction {
    Start,
    Stop,
    Delete,
}

impl VmAction {
    pub fn present_participle(&self) -> &'static str {
        match self {
            Self::Start => "Starting",
            Self::Stop => "Stopping",
            Self::Delete => "Deleting",
        }
    }

    pub fn past_tense(&self) -> &'static str {
        match self {
            Self::Start => "started",
            Self::Stop => "stopped",
            Self::Delete => "deleted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionReport {
    pub action: VmAction,
    pub mode: ProvisionMode,
    pub vm_name: String,
    pub resource_id: String,
    pub performed: bool,
}
