use super::*;
use serde_json::json;
use serial_test::serial;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> GenerationConfig {
    GenerationConfig {
        endpoint: format!("{}/v1/chat/completions", server.uri()),
        model: "test-model".to_string(),
        api_key_env: "INBOX_RAG_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
        ..GenerationConfig::default()
    }
}

fn request() -> CompletionRequest {
    CompletionRequest {
        system: "system text".to_string(),
        prompt: "user prompt".to_string(),
        max_tokens: 64,
        temperature: 0.3,
    }
}

fn reply(content: &str) -> serde_json::Value {
    json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
}

#[test]
fn missing_api_key_is_tolerated() {
    let client =
        ChatCompletionClient::new(&GenerationConfig {
            api_key_env: "INBOX_RAG_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..GenerationConfig::default()
        })
        .expect("should create client");

    assert!(!client.has_api_key());
    assert_eq!(client.model(), "llama3-70b-8192");
    assert_eq!(client.endpoint().host_str(), Some("api.groq.com"));
}

#[tokio::test]
#[serial]
async fn api_key_is_read_from_named_variable() {
    const VAR: &str = "INBOX_RAG_TEST_COMPLETION_KEY";
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("Authorization", "Bearer from-env"))
        .respond_with(ResponseTemplate::new(200).set_body_json(reply("ok")))
        .expect(1)
        .mount(&server)
        .await;

    // SAFETY: serialized with every other test that touches the environment
    unsafe { std::env::set_var(VAR, "from-env") };
    let client = ChatCompletionClient::new(&GenerationConfig {
        api_key_env: VAR.to_string(),
        ..config_for(&server)
    });
    // SAFETY: as above
    unsafe { std::env::remove_var(VAR) };

    let client = client.expect("should create client");
    assert!(client.has_api_key());
    let text = client.complete(&request()).await.expect("should complete");
    assert_eq!(text, "ok");
}

#[test]
#[serial]
fn blank_api_key_is_ignored() {
    const VAR: &str = "INBOX_RAG_TEST_BLANK_KEY";
    // SAFETY: serialized with every other test that touches the environment
    unsafe { std::env::set_var(VAR, "   ") };
    let client = ChatCompletionClient::new(&GenerationConfig {
        api_key_env: VAR.to_string(),
        ..GenerationConfig::default()
    });
    // SAFETY: as above
    unsafe { std::env::remove_var(VAR) };

    assert!(!client.expect("should create client").has_api_key());
}

#[test]
fn invalid_endpoint_is_rejected() {
    let result = ChatCompletionClient::new(&GenerationConfig {
        endpoint: "not a url".to_string(),
        ..GenerationConfig::default()
    });
    assert!(result.is_err());
}

#[tokio::test]
async fn sends_chat_request_and_reads_first_choice() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("Authorization", "Bearer secret"))
        .and(body_partial_json(json!({
            "model": "test-model",
            "max_tokens": 64,
            "messages": [
                {"role": "system", "content": "system text"},
                {"role": "user", "content": "user prompt"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(reply("The answer.")))
        .expect(1)
        .mount(&server)
        .await;

    let client = ChatCompletionClient::new(&config_for(&server))
        .expect("should create client")
        .with_api_key(Some("secret".to_string()));

    let text = client.complete(&request()).await.expect("should complete");
    assert_eq!(text, "The answer.");
}

#[tokio::test]
async fn status_codes_are_classified() {
    for (status, expected) in [
        (429, CompletionError::RateLimited),
        (503, CompletionError::Server { status: 503 }),
        (400, CompletionError::Client { status: 400 }),
    ] {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status))
            .expect(1)
            .mount(&server)
            .await;

        let client = ChatCompletionClient::new(&config_for(&server)).expect("should create client");
        let err = client.complete(&request()).await.expect_err("should fail");
        assert_eq!(err, expected);
        assert_eq!(err.is_transient(), status != 400);
    }
}

#[tokio::test]
async fn response_without_choices_is_invalid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .mount(&server)
        .await;

    let client = ChatCompletionClient::new(&config_for(&server)).expect("should create client");
    let err = client.complete(&request()).await.expect_err("should fail");
    assert!(matches!(err, CompletionError::InvalidResponse(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn slow_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(reply("late"))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let client = ChatCompletionClient::new(&config_for(&server))
        .expect("should create client")
        .with_timeout(Duration::from_millis(200));

    let err = client.complete(&request()).await.expect_err("should time out");
    assert_eq!(err, CompletionError::Timeout);
}

#[test]
fn unreachable_server_is_a_transport_error() {
    let client = ChatCompletionClient::new(&GenerationConfig {
        endpoint: "http://127.0.0.1:9/chat/completions".to_string(),
        api_key_env: "INBOX_RAG_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
        ..GenerationConfig::default()
    })
    .expect("should create client")
    .with_timeout(Duration::from_secs(2));

    let err = client.complete_blocking(&request()).expect_err("should fail");
    assert!(err.is_transient());
}
