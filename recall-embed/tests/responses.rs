//! Response decoding for both embedding APIs, without network access.

use recall_core::{ErrorKind, RecallError};
use recall_embed::EmbedError;
use recall_embed::types::{OllamaEmbedRequest, OllamaEmbedResponse, OpenAiEmbedResponse};

#[test]
fn ollama_request_shape() {
    let input = ["first", "second"];
    let body = serde_json::to_value(OllamaEmbedRequest {
        model: "all-minilm",
        input: &input,
    })
    .expect("serialize");
    assert_eq!(body["model"], "all-minilm");
    assert_eq!(body["input"][1], "second");
}

#[test]
fn ollama_response_keeps_order() {
    let raw = r#"{"model":"all-minilm","embeddings":[[0.1,0.2],[0.3,0.4]],"total_duration":12}"#;
    let resp: OllamaEmbedResponse = serde_json::from_str(raw).expect("decode");
    let vectors = resp.into_vectors(2).expect("two");
    assert_eq!(vectors[1], vec![0.3, 0.4]);
}

#[test]
fn ollama_count_mismatch_is_an_error() {
    let resp: OllamaEmbedResponse =
        serde_json::from_str(r#"{"embeddings":[[1.0]]}"#).expect("decode");
    assert!(matches!(resp.into_vectors(2), Err(EmbedError::ParseError(_))));
}

#[test]
fn openai_response_is_reordered_by_index() {
    let raw = r#"{
        "object": "list",
        "data": [
            {"object": "embedding", "index": 1, "embedding": [0.0, 1.0]},
            {"object": "embedding", "index": 0, "embedding": [1.0, 0.0]}
        ],
        "model": "text-embedding-3-small",
        "usage": {"prompt_tokens": 4, "total_tokens": 4}
    }"#;
    let resp: OpenAiEmbedResponse = serde_json::from_str(raw).expect("decode");
    let vectors = resp.into_vectors(2).expect("two");
    assert_eq!(vectors[0], vec![1.0, 0.0]);
    assert_eq!(vectors[1], vec![0.0, 1.0]);
}

#[test]
fn openai_bad_indexes_are_rejected() {
    let repeated: OpenAiEmbedResponse = serde_json::from_str(
        r#"{"data":[{"index":0,"embedding":[1.0]},{"index":0,"embedding":[2.0]}]}"#,
    )
    .expect("decode");
    assert!(repeated.into_vectors(2).is_err());

    let out_of_range: OpenAiEmbedResponse =
        serde_json::from_str(r#"{"data":[{"index":3,"embedding":[1.0]}]}"#).expect("decode");
    assert!(out_of_range.into_vectors(1).is_err());
}

#[test]
fn errors_become_dependency_failures() {
    let err: RecallError = EmbedError::RetriesExhausted {
        attempts: 3,
        last_error: "HTTP 503".into(),
    }
    .into();
    assert_eq!(err.kind(), ErrorKind::Dependency);
    assert!(err.is_retryable());

    let cfg: RecallError = EmbedError::ConfigError("bad".into()).into();
    assert_eq!(cfg.kind(), ErrorKind::Validation);
}
