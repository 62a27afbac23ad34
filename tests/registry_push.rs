//! Fake-registry-server tests for the upload and auth state machines:
//! pushing a blob the registry already has is a single HEAD and nothing
//! else, and a `401` challenge triggers exactly one token exchange before
//! the retried request succeeds.

use mockito::Server;

use pycontainer::config::{BuildPlan, BuildPlanOverrides};
use pycontainer::digest::digest_bytes;
use pycontainer::output::OutputManager;
use pycontainer::registry::RegistryClient;

fn host_of(server: &Server) -> String {
    server
        .url()
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .to_string()
}

fn plan_with_tag(context: &std::path::Path, tag: &str) -> BuildPlan {
    BuildPlan::assemble(
        BuildPlanOverrides {
            tag: Some(tag.to_string()),
            ..Default::default()
        },
        context,
    )
    .unwrap()
}

#[tokio::test]
async fn push_skips_a_blob_the_registry_already_has() {
    let mut server = Server::new_async().await;
    let host = host_of(&server);
    let context = tempfile::tempdir().unwrap();
    let plan = plan_with_tag(context.path(), &format!("{host}/demo:latest"));
    let output = OutputManager::quiet();
    let client = RegistryClient::new(&host, &plan, &output).unwrap();

    let bytes = b"layer-bytes";
    let digest = digest_bytes(bytes);
    let head_mock = server
        .mock("HEAD", format!("/v2/demo/blobs/sha256:{}", digest.hex()).as_str())
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    // No upload-session mock is registered; if put_blob attempted an upload
    // despite the blob already existing, this test would fail on a 501 from
    // mockito's unmatched-request response rather than silently passing.

    client.put_blob("demo", &digest, bytes).await.unwrap();

    head_mock.assert_async().await;
}

#[tokio::test]
async fn push_uploads_a_missing_blob_monolithically_then_the_manifest() {
    let mut server = Server::new_async().await;
    let host = host_of(&server);
    let context = tempfile::tempdir().unwrap();
    let plan = plan_with_tag(context.path(), &format!("{host}/demo:latest"));
    let output = OutputManager::quiet();
    let client = RegistryClient::new(&host, &plan, &output).unwrap();

    let bytes = b"small layer";
    let digest = digest_bytes(bytes);

    let head_mock = server
        .mock("HEAD", format!("/v2/demo/blobs/sha256:{}", digest.hex()).as_str())
        .with_status(404)
        .expect(1)
        .create_async()
        .await;
    let start_upload_mock = server
        .mock("POST", "/v2/demo/blobs/uploads/")
        .with_status(202)
        .with_header("location", "/v2/demo/blobs/uploads/session-1")
        .expect(1)
        .create_async()
        .await;
    let put_blob_mock = server
        .mock("PUT", "/v2/demo/blobs/uploads/session-1")
        .match_query(mockito::Matcher::Any)
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    client.put_blob("demo", &digest, bytes).await.unwrap();

    head_mock.assert_async().await;
    start_upload_mock.assert_async().await;
    put_blob_mock.assert_async().await;

    let manifest_bytes = br#"{"schemaVersion":2}"#;
    let put_manifest_mock = server
        .mock("PUT", "/v2/demo/manifests/latest")
        .with_status(201)
        .expect(1)
        .create_async()
        .await;
    client
        .put_manifest("demo", "latest", manifest_bytes, "application/vnd.oci.image.manifest.v1+json")
        .await
        .unwrap();
    put_manifest_mock.assert_async().await;
}

#[tokio::test]
async fn a_401_challenge_triggers_exactly_one_token_exchange() {
    let mut server = Server::new_async().await;
    let host = host_of(&server);
    let context = tempfile::tempdir().unwrap();
    let plan = {
        let mut plan = plan_with_tag(context.path(), &format!("{host}/demo:latest"));
        plan.explicit_username = Some("builder".to_string());
        plan.explicit_password = Some("secret".to_string());
        plan
    };
    let output = OutputManager::quiet();
    let client = RegistryClient::new(&host, &plan, &output).unwrap();

    let bytes = b"layer-bytes";
    let digest = digest_bytes(bytes);
    let realm = format!("http://{host}/token");

    let challenge_mock = server
        .mock("HEAD", format!("/v2/demo/blobs/sha256:{}", digest.hex()).as_str())
        .with_status(401)
        .with_header(
            "www-authenticate",
            &format!(r#"Bearer realm="{realm}",service="demo-registry",scope="repository:demo:pull""#),
        )
        .expect(1)
        .create_async()
        .await;
    let token_mock = server
        .mock("GET", "/token")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"token":"fake-bearer-token"}"#)
        .expect(1)
        .create_async()
        .await;
    let authorized_mock = server
        .mock("HEAD", format!("/v2/demo/blobs/sha256:{}", digest.hex()).as_str())
        .match_header("authorization", "Bearer fake-bearer-token")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let exists = client.exists_blob("demo", &digest).await.unwrap();
    assert!(exists);

    challenge_mock.assert_async().await;
    token_mock.assert_async().await;
    authorized_mock.assert_async().await;
}
