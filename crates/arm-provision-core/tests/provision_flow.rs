use arm_provision_core::{
    EnsureOutcome, FileSettings, ProvisionEngine, ProvisionMode, ResourceKind, Settings, VmAction,
    connect,
};
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const GROUP: &str = "/subscriptions/sub-1/resourceGroups/py-testing";

fn settings_for(server: &MockServer) -> Settings {
    let uri = server.uri();
    let file = FileSettings {
        poll_interval_secs: Some(0),
        ..FileSettings::default()
    };
    Settings::from_sources(file, |key| {
        let value = match key {
            "ARM_SUBSCRIPTION_ID" => "sub-1",
            "ARM_TENANT_ID" => "tenant-1",
            "ARM_CLIENT_ID" => "app-1",
            "ARM_CLIENT_SECRET" => "secret",
            "VM_PASSWORD" => "vm-secret",
            "SQL_PASSWORD" => "sql-secret",
            "AZURE_AUTHORITY_HOST" | "ARM_RESOURCE_MANAGER_ENDPOINT" => uri.as_str(),
            _ => return None,
        };
        Some(value.to_string())
    })
    .expect("settings")
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/tenant-1/oauth2/v2.0/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "arm-token",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(server)
        .await;
}

fn found(id: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "id": id,
        "properties": { "provisioningState": "Succeeded" }
    }))
}

#[tokio::test]
async fn provisions_missing_resources_over_http() {
    let server = MockServer::start().await;
    mount_token(&server).await;

    let vnet = format!("{GROUP}/providers/Microsoft.Network/virtualNetworks/pytesting-vnet");
    let subnet = format!("{vnet}/subnets/pytesting-subnet-1");
    let nic = format!("{GROUP}/providers/Microsoft.Network/networkInterfaces/pytesting-vm-nic");

    Mock::given(method("GET"))
        .and(path(vnet.as_str()))
        .respond_with(found(&vnet))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(subnet.as_str()))
        .respond_with(found(&subnet))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(nic.as_str()))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "code": "ResourceNotFound", "message": "missing" }
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(nic.as_str()))
        .respond_with(found(&nic))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "properties": { "provisioningState": "Succeeded" }
        })))
        .expect(6)
        .mount(&server)
        .await;

    let settings = settings_for(&server);
    let client = connect(&settings).expect("client");
    let engine = ProvisionEngine::new(client, settings);
    let report = engine.run(ProvisionMode::Apply).await.expect("provisioned");

    let outcomes: Vec<_> = report.steps.iter().map(|step| (step.kind, step.outcome)).collect();
    assert_eq!(
        outcomes,
        vec![
            (ResourceKind::ResourceGroup, EnsureOutcome::Ensured),
            (ResourceKind::VirtualNetwork, EnsureOutcome::Found),
            (ResourceKind::Subnet, EnsureOutcome::Found),
            (ResourceKind::NetworkInterface, EnsureOutcome::Created),
            (ResourceKind::VirtualMachine, EnsureOutcome::Created),
            (ResourceKind::SqlServer, EnsureOutcome::Created),
            (ResourceKind::SqlDatabase, EnsureOutcome::Ensured),
            (ResourceKind::StorageAccount, EnsureOutcome::Created),
        ]
    );

    let requests = server.received_requests().await.expect("recording enabled");
    let vm_put = requests
        .iter()
        .find(|request| {
            request.method.as_str() == "PUT" && request.url.path().ends_with("/virtualMachines/pytesting-vm")
        })
        .expect("vm created");
    let body: Value = serde_json::from_slice(&vm_put.body).expect("json body");
    assert_eq!(body["properties"]["networkProfile"]["networkInterfaces"][0]["id"], json!(nic));
    assert!(
        vm_put
            .url
            .query()
            .is_some_and(|query| query.contains("api-version=2023-09-01"))
    );
    assert!(requests.iter().all(|request| {
        request.url.path().ends_with("/token")
            || request
                .headers
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                == Some("Bearer arm-token")
    }));
}

#[tokio::test]
async fn dry_run_against_empty_subscription_only_reads() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let settings = settings_for(&server);
    let client = connect(&settings).expect("client");
    let engine = ProvisionEngine::new(client, settings);
    let report = engine.run(ProvisionMode::DryRun).await.expect("dry run");

    assert_eq!(report.changed_count(), 0);
    assert_eq!(
        report.outcome_of(ResourceKind::VirtualMachine),
        Some(EnsureOutcome::WouldCreate)
    );
}

#[tokio::test]
async fn stop_deallocates_the_vm() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    let vm = format!("{GROUP}/providers/Microsoft.Compute/virtualMachines/pytesting-vm");
    Mock::given(method("POST"))
        .and(path(format!("{vm}/deallocate")))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let settings = settings_for(&server);
    let client = connect(&settings).expect("client");
    let engine = ProvisionEngine::new(client, settings);
    let report = engine
        .run_vm_action(VmAction::Stop, ProvisionMode::Apply)
        .await
        .expect("stopped");
    assert!(report.performed);
    assert_eq!(report.resource_id, vm);
}
