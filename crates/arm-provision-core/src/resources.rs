//! Resource ids, API versions and request bodies for the managed resources.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::ResourceNames;
use crate::types::ResourceKind;

pub const VNET_ADDRESS_SPACE: &str = "10.0.0.0/16";
pub const SUBNET_PREFIX: &str = "10.0.0.0/24";
pub const NIC_IP_CONFIGURATION: &str = "ipconfig1";
pub const SQL_SERVER_VERSION: &str = "12.0";
pub const SQL_DATABASE_SKU: &str = "S0";
pub const STORAGE_SKU: &str = "Standard_RAGRS";
pub const STORAGE_KIND: &str = "StorageV2";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageReference {
    pub publisher: String,
    pub offer: String,
    pub sku: String,
    pub version: String,
}

impl Default for ImageReference {
    fn default() -> Self {
        Self {
            publisher: "MicrosoftWindowsServer".to_string(),
            offer: "WindowsServer".to_string(),
            sku: "2016-Datacenter".to_string(),
            version: "latest".to_string(),
        }
    }
}

impl ResourceKind {
    pub fn api_version(&self) -> &'static str {
        match self {
            Self::ResourceGroup => "2021-04-01",
            Self::VirtualNetwork | Self::Subnet | Self::NetworkInterface => "2023-09-01",
            Self::VirtualMachine => "2023-09-01",
            Self::SqlServer | Self::SqlDatabase => "2021-11-01",
            Self::StorageAccount => "2023-01-01",
        }
    }

    pub fn name<'a>(&self, names: &'a ResourceNames) -> &'a str {
        match self {
            Self::ResourceGroup => &names.resource_group,
            Self::VirtualNetwork => &names.virtual_network,
            Self::Subnet => &names.subnet,
            Self::NetworkInterface => &names.network_interface,
            Self::VirtualMachine => &names.virtual_machine,
            Self::SqlServer => &names.sql_server,
            Self::SqlDatabase => &names.sql_database,
            Self::StorageAccount => &names.storage_account,
        }
    }

    pub fn resource_id(&self, subscription_id: &str, names: &ResourceNames) -> ResourceId {
        let group = ResourceId::resource_group(subscription_id, &names.resource_group);
        match self {
            Self::ResourceGroup => group,
            Self::VirtualNetwork => {
                group.provider("Microsoft.Network", "virtualNetworks", &names.virtual_network)
            }
            Self::Subnet => group
                .provider("Microsoft.Network", "virtualNetworks", &names.virtual_network)
                .child("subnets", &names.subnet),
            Self::NetworkInterface => group.provider(
                "Microsoft.Network",
                "networkInterfaces",
                &names.network_interface,
            ),
            Self::VirtualMachine => {
                group.provider("Microsoft.Compute", "virtualMachines", &names.virtual_machine)
            }
            Self::SqlServer => group.provider("Microsoft.Sql", "servers", &names.sql_server),
            Self::SqlDatabase => group
                .provider("Microsoft.Sql", "servers", &names.sql_server)
                .child("databases", &names.sql_database),
            Self::StorageAccount => group.provider(
                "Microsoft.Storage",
                "storageAccounts",
                &names.storage_account,
            ),
        }
    }
}

/// Path of a resource under the management endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn resource_group(subscription_id: &str, resource_group: &str) -> Self {
        Self(format!(
            "/subscriptions/{subscription_id}/resourceGroups/{resource_group}"
        ))
    }

    pub fn provider(&self, namespace: &str, resource_type: &str, name: &str) -> Self {
        Self(format!("{}/providers/{namespace}/{resource_type}/{name}", self.0))
    }

    pub fn child(&self, resource_type: &str, name: &str) -> Self {
        Self(format!("{}/{resource_type}/{name}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.0
    }
}

pub fn resource_group_body(location: &str) -> Value {
    json!({ "location": location })
}

pub fn virtual_network_body(location: &str) -> Value {
    json!({
        "location": location,
        "properties": {
            "addressSpace": { "addressPrefixes": [VNET_ADDRESS_SPACE] }
        }
    })
}

pub fn subnet_body() -> Value {
    json!({ "properties": { "addressPrefix": SUBNET_PREFIX } })
}

pub fn network_interface_body(location: &str, subnet_id: &str) -> Value {
    json!({
        "location": location,
        "properties": {
            "ipConfigurations": [{
                "name": NIC_IP_CONFIGURATION,
                "properties": { "subnet": { "id": subnet_id } }
            }]
        }
    })
}

pub struct VirtualMachineSpec<'a> {
    pub location: &'a str,
    pub computer_name: &'a str,
    pub size: &'a str,
    pub image: &'a ImageReference,
    pub admin_username: &'a str,
    pub admin_password: &'a SecretString,
    pub nic_id: &'a str,
}

pub fn virtual_machine_body(spec: &VirtualMachineSpec<'_>) -> Value {
    json!({
        "location": spec.location,
        "properties": {
            "hardwareProfile": { "vmSize": spec.size },
            "storageProfile": { "imageReference": spec.image },
            "osProfile": {
                "computerName": spec.computer_name,
                "adminUsername": spec.admin_username,
                "adminPassword": spec.admin_password.expose_secret()
            },
            "networkProfile": {
                "networkInterfaces": [{ "id": spec.nic_id }]
            }
        }
    })
}

pub fn sql_server_body(location: &str, admin_login: &str, admin_password: &SecretString) -> Value {
    json!({
        "location": location,
        "properties": {
            "administratorLogin": admin_login,
            "administratorLoginPassword": admin_password.expose_secret(),
            "version": SQL_SERVER_VERSION
        }
    })
}

pub fn sql_database_body(location: &str) -> Value {
    json!({ "location": location, "sku": { "name": SQL_DATABASE_SKU } })
}

pub fn storage_account_body(location: &str) -> Value {
    json!({
        "location": location,
        "sku": { "name": STORAGE_SKU },
        "kind": STORAGE_KIND
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_arm_layout() {
        let names = ResourceNames::default();
        assert_eq!(
            ResourceKind::ResourceGroup.resource_id("sub", &names).as_str(),
            "/subscriptions/sub/resourceGroups/py-testing"
        );
        assert_eq!(
            ResourceKind::Subnet.resource_id("sub", &names).as_str(),
            "/subscriptions/sub/resourceGroups/py-testing/providers/Microsoft.Network/virtualNetworks/pytesting-vnet/subnets/pytesting-subnet-1"
        );
        assert_eq!(
            ResourceKind::SqlDatabase.resource_id("sub", &names).as_str(),
            "/subscriptions/sub/resourceGroups/py-testing/providers/Microsoft.Sql/servers/pytestingbr1-sql-server/databases/pytestingbr1-database"
        );
        assert_eq!(
            ResourceKind::StorageAccount.resource_id("sub", &names).to_string(),
            "/subscriptions/sub/resourceGroups/py-testing/providers/Microsoft.Storage/storageAccounts/pytestingstorageaccount"
        );
    }

    #[test]
    fn virtual_machine_body_references_nic_and_image() {
        let password = SecretString::from("P@ssw0rd!".to_string());
        let image = ImageReference::default();
        let body = virtual_machine_body(&VirtualMachineSpec {
            location: "eastus",
            computer_name: "pytesting-vm",
            size: "Standard_DS1_v2",
            image: &image,
            admin_username: "pyvmtest",
            admin_password: &password,
            nic_id: "/nic",
        });
        let props = &body["properties"];
        assert_eq!(props["hardwareProfile"]["vmSize"], "Standard_DS1_v2");
        assert_eq!(props["storageProfile"]["imageReference"]["sku"], "2016-Datacenter");
        assert_eq!(props["osProfile"]["adminPassword"], "P@ssw0rd!");
        assert_eq!(props["networkProfile"]["networkInterfaces"][0]["id"], "/nic");
    }

    #[test]
    fn network_and_storage_bodies_carry_fixed_parameters() {
        let nic = network_interface_body("eastus", "/subnet");
        assert_eq!(nic["properties"]["ipConfigurations"][0]["name"], "ipconfig1");
        assert_eq!(
            nic["properties"]["ipConfigurations"][0]["properties"]["subnet"]["id"],
            "/subnet"
        );
        assert_eq!(
            virtual_network_body("eastus")["properties"]["addressSpace"]["addressPrefixes"][0],
            "10.0.0.0/16"
        );
        let storage = storage_account_body("eastus");
        assert_eq!(storage["sku"]["name"], "Standard_RAGRS");
        assert_eq!(storage["kind"], "StorageV2");
        assert_eq!(sql_database_body("eastus")["sku"]["name"], "S0");
    }
}
