use deal_backup::services::deal_client::{DealError, DealNetwork, FileData, MetaClient};
use httpmock::prelude::*;
use serde_json::json;

fn client(server: &MockServer) -> MetaClient {
    MetaClient::new(&server.base_url(), "key-1", "token-1")
}

#[tokio::test]
async fn backup_posts_a_json_rpc_call_with_credentials() {
    let server = MockServer::start_async().await;
    let rpc = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/rpc/v0")
                .header("api-key", "key-1")
                .header("api-token", "token-1")
                .json_body_partial(
                    r#"{"jsonrpc":"2.0","method":"meta.Backup","params":["b1-b1-20240101000000",[{"source_name":"b1","data_size":5,"is_directory":true,"download_url":"http://d/b1"}],"0xwallet"]}"#,
                );
            then.status(200).json_body(json!({
                "result": {"code": "success", "message": "", "data": 314}
            }));
        })
        .await;

    let job = client(&server)
        .submit_backup(
            "b1-b1-20240101000000".into(),
            "0xwallet".into(),
            vec![FileData {
                source_name: "b1".into(),
                data_size: 5,
                is_directory: true,
                download_url: "http://d/b1".into(),
            }],
        )
        .await
        .unwrap();

    assert_eq!(job, 314);
    rpc.assert_async().await;
}

#[tokio::test]
async fn non_success_codes_surface_the_remote_message() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/rpc/v0");
            then.status(200).json_body(json!({
                "result": {"code": "fail", "message": "dataset not found", "data": null}
            }));
        })
        .await;

    let err = client(&server).backup_deal_status(12).await.unwrap_err();
    match err {
        DealError::Remote(message) => assert_eq!(message, "dataset not found"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn rpc_errors_are_reported() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/rpc/v0");
            then.status(200).json_body(json!({
                "error": {"code": -32601, "message": "method not found"}
            }));
        })
        .await;

    let err = client(&server).rebuild(3, "cat.png".into()).await.unwrap_err();
    assert!(matches!(err, DealError::Rpc(message) if message == "method not found"));
}

#[tokio::test]
async fn rebuild_sends_dataset_and_object() {
    let server = MockServer::start_async().await;
    let rpc = server
        .mock_async(|when, then| {
            when.method(POST).path("/rpc/v0").json_body_partial(
                r#"{"method":"meta.DatasetRebuild","params":[{"dataset_id":3,"object":"cat.png"}]}"#,
            );
            then.status(200).json_body(json!({
                "result": {"code": "success", "data": {
                    "status": 1,
                    "payload_cid": "bafy",
                    "payload_url": "http://payload/cat.png",
                    "providers": null
                }}
            }));
        })
        .await;

    let resp = client(&server).rebuild(3, "cat.png".into()).await.unwrap();
    assert_eq!(resp.status, 1);
    assert_eq!(resp.payload_url, "http://payload/cat.png");
    assert!(resp.providers.is_empty());
    rpc.assert_async().await;
}

#[tokio::test]
async fn http_failures_are_transport_errors() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/rpc/v0");
            then.status(502);
        })
        .await;

    let err = client(&server).backup_deal_status(1).await.unwrap_err();
    assert!(matches!(err, DealError::Transport(_)));
}

#[tokio::test]
async fn an_unconfigured_server_is_rejected() {
    let err = MetaClient::new("", "k", "t")
        .backup_deal_status(1)
        .await
        .unwrap_err();
    assert!(matches!(err, DealError::Config(_)));
}
