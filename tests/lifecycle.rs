//! End-to-end resource and data source lifecycles against the in-memory API server.

use std::path::PathBuf;
use std::time::Duration;

use kubecrd_provider::testing::{
    assert_no_errors, assert_plan_changes_attribute, assert_plan_creates, assert_plan_no_changes,
    assert_plan_replaces, assert_plan_updates_in_place, MockDynamicClient, ProviderTester,
    TestError,
};
use kubecrd_provider::{validate, CrdProvider, ProviderError, ResourceCatalog};
use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};

const WIDGET: &str = "k8s_example_com_widget_v1";
const WIDGET_MANIFEST: &str = "k8s_example_com_widget_v1_manifest";
const GADGET: &str = "k8s_example_com_gadget_v1";

fn fixtures() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn catalog() -> ResourceCatalog {
    ResourceCatalog::from_paths("k8s", &[fixtures()]).unwrap()
}

async fn tester(config: Value) -> (ProviderTester<CrdProvider>, MockDynamicClient) {
    let client = MockDynamicClient::new();
    let tester = ProviderTester::new(CrdProvider::new(catalog()).with_client(client.clone()));
    tester.configure(config).await.unwrap();
    (tester, client)
}

fn widget_config() -> Value {
    json!({
        "id": null,
        "api_version": null,
        "kind": null,
        "metadata": {
            "name": "demo",
            "namespace": "default",
            "labels": {"app": "web"},
            "annotations": null
        },
        "spec": {
            "size": 2,
            "color": "red",
            "revision_history_limit": null,
            "ports": [{"name": "http", "port": 80}],
            "selector": null
        },
        "wait_for_delete": {"timeout": "10s", "poll_interval": "1s"}
    })
}

#[tokio::test]
async fn test_create_applies_object() {
    let (tester, client) = tester(json!({"field_manager": "ci", "force_conflicts": true})).await;

    let plan = tester.plan_create(WIDGET, widget_config()).await.unwrap();
    assert_plan_creates(&plan);
    assert_eq!(plan.planned_state["id"], "default/demo");

    let state = tester.lifecycle_create(WIDGET, widget_config()).await.unwrap();
    assert_eq!(state["id"], "default/demo");
    assert_eq!(state["api_version"], "example.com/v1");
    assert_eq!(state["kind"], "Widget");
    assert_eq!(state["spec"]["size"], 2);
    assert_eq!(state["spec"]["ports"][0]["port"], 80);
    assert_eq!(state["metadata"]["labels"]["app"], "web");
    assert_eq!(state["wait_for_delete"]["timeout"], "10s");

    let resource = &tester.provider().catalog().resource(WIDGET).unwrap().api_resource;
    let object = client.object(resource, Some("default"), "demo").unwrap();
    assert_eq!(object["apiVersion"], "example.com/v1");
    assert_eq!(object["kind"], "Widget");
    assert_eq!(object["spec"]["ports"], json!([{"name": "http", "port": 80}]));
    assert!(object["spec"].get("revisionHistoryLimit").is_none());
    assert!(object.get("wait_for_delete").is_none());
    assert!(object.get("id").is_none());

    let options = client.last_apply_options().unwrap();
    assert_eq!(options.field_manager, "ci");
    assert!(options.force);
    assert_eq!(client.counts().apply, 1);
}

#[tokio::test]
async fn test_update_in_place_and_replace() {
    let (tester, client) = tester(json!({})).await;
    let created = tester.lifecycle_create(WIDGET, widget_config()).await.unwrap();

    let plan = tester
        .plan_update(WIDGET, created.clone(), created.clone())
        .await
        .unwrap();
    assert_plan_no_changes(&plan);

    let mut resized = created.clone();
    resized["spec"]["size"] = json!(3);
    let plan = tester
        .plan_update(WIDGET, created.clone(), resized.clone())
        .await
        .unwrap();
    assert_plan_updates_in_place(&plan);
    assert_plan_changes_attribute(&plan, "spec.size");

    let updated = tester
        .lifecycle_update(WIDGET, created.clone(), resized)
        .await
        .unwrap();
    assert_eq!(updated["spec"]["size"], 3);
    assert_eq!(client.counts().apply, 2);
    assert_eq!(client.len(), 1);

    let mut moved = created.clone();
    moved["metadata"]["namespace"] = json!("staging");
    let plan = tester.plan_update(WIDGET, created, moved).await.unwrap();
    assert_plan_replaces(&plan);
    assert_eq!(plan.planned_state["id"], "staging/demo");
}

#[tokio::test]
async fn test_read_after_external_delete() {
    let (tester, client) = tester(json!({})).await;
    let created = tester.lifecycle_create(WIDGET, widget_config()).await.unwrap();

    let resource = tester.provider().catalog().resource(WIDGET).unwrap().api_resource.clone();
    kubecrd_provider::DynamicClient::delete(&client, &resource, Some("default"), "demo")
        .await
        .unwrap();

    let state = tester.read(WIDGET, created).await.unwrap();
    assert!(state.is_null());
}

#[tokio::test(start_paused = true)]
async fn test_delete_waits_for_finalizers() {
    let (tester, client) = tester(json!({})).await;
    let created = tester.lifecycle_create(WIDGET, widget_config()).await.unwrap();
    client.linger_on_delete(2);
    client.reset_counts();

    let start = tokio::time::Instant::now();
    assert_ok!(tester.delete(WIDGET, created.clone()).await);
    assert_eq!(client.counts().delete, 1);
    assert_eq!(client.counts().get, 3);
    assert_eq!(start.elapsed(), Duration::from_secs(2));

    // already gone: tolerated, no wait
    client.reset_counts();
    assert_ok!(tester.delete(WIDGET, created).await);
    assert_eq!(client.counts().get, 0);
}

#[tokio::test(start_paused = true)]
async fn test_delete_wait_timeout() {
    let (tester, client) = tester(json!({})).await;
    let mut config = widget_config();
    config["wait_for_delete"] = json!({"timeout": "3s", "poll_interval": "1s"});
    let created = tester.lifecycle_create(WIDGET, config).await.unwrap();
    client.linger_on_delete(100);

    let err = assert_err!(tester.delete(WIDGET, created).await);
    assert!(matches!(err, ProviderError::WaitTimeoutExceeded { .. }));
    assert_eq!(
        err.to_string(),
        "Timed out after 3s waiting for Widget default/demo to be deleted"
    );
}

#[tokio::test]
async fn test_delete_without_wait_block() {
    let (tester, client) = tester(json!({})).await;
    let mut config = widget_config();
    config["wait_for_delete"] = Value::Null;
    let created = tester.lifecycle_create(WIDGET, config).await.unwrap();
    client.linger_on_delete(5);
    client.reset_counts();

    assert_ok!(tester.delete(WIDGET, created).await);
    assert_eq!(client.counts().get, 0);
}

#[tokio::test]
async fn test_apply_conflict() {
    let (tester, client) = tester(json!({})).await;
    client.fail_next_apply(409, "Conflict");

    let err = assert_err!(tester.lifecycle_create(WIDGET, widget_config()).await);
    assert!(err.to_string().starts_with("Unable to PATCH Widget default/demo: "));
    assert!(!err.is_not_found());
}

#[tokio::test]
async fn test_delete_forbidden() {
    let (tester, client) = tester(json!({})).await;
    let created = tester.lifecycle_create(WIDGET, widget_config()).await.unwrap();
    client.fail_next_delete(403, "Forbidden");

    let err = assert_err!(tester.delete(WIDGET, created.clone()).await);
    assert!(err.to_string().starts_with("Unable to DELETE Widget default/demo: "));

    let state = tester.read(WIDGET, created).await.unwrap();
    assert_eq!(state["metadata"]["name"], "demo");
}

#[test]
fn test_validate_config_diagnostics() {
    let provider = CrdProvider::new(catalog());
    let widget = provider.catalog().resource(WIDGET).unwrap();
    assert_no_errors(&validate(&widget.resource_schema, &widget_config()));
}

#[tokio::test]
async fn test_import() {
    let (tester, client) = tester(json!({})).await;
    let resource = tester.provider().catalog().resource(WIDGET).unwrap().api_resource.clone();
    client.insert(
        &resource,
        Some("default"),
        json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {"name": "existing", "namespace": "default", "uid": "abc"},
            "spec": {"size": 4},
            "status": {"phase": "Ready"}
        }),
    );

    let imported = tester.import_resource(WIDGET, "default/existing").await.unwrap();
    assert_eq!(imported.len(), 1);
    assert_eq!(imported[0].resource_type, WIDGET);
    let state = &imported[0].state;
    assert_eq!(state["id"], "default/existing");
    assert_eq!(state["spec"]["size"], 4);
    assert!(state["spec"]["color"].is_null());
    assert!(state.get("status").is_none());
    assert!(state["wait_for_delete"].is_null());

    let err = assert_err!(tester.import_resource(WIDGET, "existing").await);
    assert!(matches!(err, ProviderError::InvalidRequest(_)));

    let err = assert_err!(tester.import_resource(WIDGET, "default/missing").await);
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_cluster_scoped_resource() {
    let (tester, client) = tester(json!({})).await;
    let state = tester
        .lifecycle_create(
            GADGET,
            json!({"metadata": {"name": "g1"}, "spec": {"mode": "fast"}}),
        )
        .await
        .unwrap();
    assert_eq!(state["id"], "g1");

    let resource = tester.provider().catalog().resource(GADGET).unwrap().api_resource.clone();
    assert!(client.object(&resource, None, "g1").is_some());

    let imported = tester.import_resource(GADGET, "g1").await.unwrap();
    assert_eq!(imported[0].state["spec"]["mode"], "fast");
    assert_err!(tester.import_resource(GADGET, "default/g1").await);
}

#[tokio::test]
async fn test_data_source_read() {
    let (tester, client) = tester(json!({})).await;
    let resource = tester.provider().catalog().data_source(WIDGET).unwrap().api_resource.clone();
    client.insert(
        &resource,
        Some("default"),
        json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {"name": "demo", "namespace": "default", "labels": {"team": "a"}},
            "spec": {"size": 1, "selector": {"app": "web"}}
        }),
    );

    let config = json!({"metadata": {"name": "demo", "namespace": "default"}});
    assert_ok!(tester.validate_data_source_config(WIDGET, config.clone()).await);
    let state = tester.read_data_source(WIDGET, config).await.unwrap();
    assert_eq!(state["id"], "default/demo");
    assert_eq!(state["metadata"]["labels"]["team"], "a");
    assert_eq!(state["spec"]["selector"]["app"], "web");

    let missing = json!({"metadata": {"name": "other", "namespace": "default"}});
    let err = assert_err!(tester.read_data_source(WIDGET, missing).await);
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_manifest_works_offline() {
    let (tester, client) = tester(json!({"offline": true})).await;
    let mut config = widget_config();
    config
        .as_object_mut()
        .unwrap()
        .remove("wait_for_delete");
    config["yaml"] = Value::Null;

    assert_ok!(tester.validate_data_source_config(WIDGET_MANIFEST, config.clone()).await);
    let state = tester.read_data_source(WIDGET_MANIFEST, config).await.unwrap();
    assert_eq!(state["id"], "default/demo");

    let yaml = state["yaml"].as_str().unwrap();
    let manifest: Value = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(manifest["apiVersion"], "example.com/v1");
    assert_eq!(manifest["kind"], "Widget");
    assert_eq!(manifest["metadata"]["labels"]["app"], "web");
    assert_eq!(manifest["spec"]["size"], 2);
    assert!(manifest["spec"].get("revisionHistoryLimit").is_none());
    assert_eq!(client.counts(), Default::default());

    let err = assert_err!(tester.read_data_source(WIDGET, widget_config()).await);
    assert!(matches!(err, ProviderError::Offline(_)));
}

#[tokio::test]
async fn test_validate_resource_config() {
    let (tester, _) = tester(json!({})).await;
    assert_ok!(tester.validate_resource_config(WIDGET, widget_config()).await);

    let mut config = widget_config();
    config["spec"]["color"] = json!("purple");
    config["spec"]["size"] = json!(11);
    config["wait_for_delete"]["poll_interval"] = json!("often");
    match tester.validate_resource_config(WIDGET, config).await {
        Err(TestError::Diagnostics(diagnostics)) => {
            let attributes: Vec<_> = diagnostics
                .iter()
                .filter_map(|d| d.attribute.as_deref())
                .collect();
            assert!(attributes.contains(&"spec.color"), "{:?}", attributes);
            assert!(attributes.contains(&"spec.size"), "{:?}", attributes);
            assert!(attributes.contains(&"wait_for_delete.poll_interval"), "{:?}", attributes);
        },
        other => panic!("expected diagnostics, got {:?}", other),
    }

    let mut config = widget_config();
    config["metadata"]["namespace"] = Value::Null;
    config["metadata"]["name"] = json!("Not_A_Name");
    assert_err!(tester.validate_resource_config(WIDGET, config).await);
}

#[tokio::test]
async fn test_metadata_lists_every_type() {
    let (tester, _) = tester(json!({})).await;
    assert_eq!(
        tester.resource_types(),
        vec![GADGET, WIDGET, "k8s_example_com_widget_v1beta1"]
    );
    let data_sources = tester.data_source_types();
    assert_eq!(data_sources.len(), 6);
    assert!(data_sources.contains(&WIDGET_MANIFEST.to_string()));

    let schema = tester.schema();
    let deprecated = &schema.resources["k8s_example_com_widget_v1beta1"];
    assert!(deprecated
        .block
        .description
        .as_deref()
        .unwrap()
        .contains("deprecated"));
}

#[tokio::test]
async fn test_catalog_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::copy(
        fixtures().join("widgets.example.com.yaml"),
        dir.path().join("crds.yml"),
    )
    .unwrap();
    std::fs::write(dir.path().join("README.md"), "not a manifest").unwrap();

    let catalog = ResourceCatalog::from_paths("acme", &[dir.path()]).unwrap();
    assert_eq!(catalog.len(), 3);
    assert!(catalog.resource("acme_example_com_widget_v1").is_some());
}
