#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Submission and result wire format.

use serde_json::json;
use sitebot_core::*;

#[test]
fn test_minimal_submission_gets_defaults() {
    let task: TaskDefinition =
        serde_json::from_value(json!({"id": "home", "name": "build-page"})).unwrap();
    assert_eq!(task.version, "1.0.0");
    assert_eq!(task.priority, Priority::Normal);
    assert_eq!(task.concurrency_class, ConcurrencyClass::Cpu);
    assert_eq!(task.timeout_ms, 30_000);
    assert!(task.depends_on.is_empty());
    assert!(task.validate().is_ok());
}

#[test]
fn test_full_submission_fields() {
    let task: TaskDefinition = serde_json::from_value(json!({
        "id": "hero-copy",
        "version": "2.1.0",
        "name": "write-copy",
        "priority": "high",
        "concurrencyClass": "llm",
        "idempotencyKey": "hero-v2",
        "inputsRef": {"page": "home"},
        "timeoutMs": 60000,
        "dependsOn": ["seed"],
        "estimatedTokens": 1500,
        "fallbackRules": ["page-stub"]
    }))
    .unwrap();
    assert_eq!(task.resolved_key(), "hero-v2");
    assert_eq!(task.estimated_tokens, 1500);
    assert_eq!(task.fallback_rules, vec!["page-stub"]);

    let value = serde_json::to_value(&task).unwrap();
    assert_eq!(value["concurrencyClass"], "llm");
    assert_eq!(value["dependsOn"][0], "seed");
}

#[test]
fn test_derived_key_ignores_input_key_order() {
    let a: TaskDefinition = serde_json::from_str(
        r#"{"id":"a","name":"build-page","inputsRef":{"slug":"home","meta":{"x":1,"y":2}}}"#,
    )
    .unwrap();
    let b: TaskDefinition = serde_json::from_str(
        r#"{"id":"b","name":"build-page","inputsRef":{"meta":{"y":2,"x":1},"slug":"home"}}"#,
    )
    .unwrap();
    assert_eq!(a.resolved_key(), b.resolved_key());
    assert_eq!(a.resolved_key().len(), 64);

    let bumped = a.clone().with_version("1.0.1");
    assert_ne!(a.resolved_key(), bumped.resolved_key());
}

#[test]
fn test_invalid_submissions() {
    let cases = [
        TaskDefinition::new("", "build"),
        TaskDefinition::new("a", " "),
        TaskDefinition::new("a", "build").with_timeout_ms(0),
        TaskDefinition::new("a", "build").with_dependencies(["a"]),
        TaskDefinition::new("a", "build").with_dependencies(["b", "b"]),
        TaskDefinition::new("a", "build").with_idempotency_key(""),
    ];
    for task in cases {
        let err = task.validate().unwrap_err();
        assert_eq!(err.code(), "VALIDATION", "{task:?}");
    }
}

#[test]
fn test_failed_result_shape() {
    let result = TaskResult::failed(
        "deploy",
        &SitebotError::BudgetExceeded {
            requested: 200,
            remaining: 100,
        },
    );
    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(value["status"], "fail");
    assert_eq!(value["errorCode"], "BUDGET_EXCEEDED");
    assert!(value["errorMsg"].as_str().unwrap().contains("200"));
    assert!(value.get("startedAt").is_none());
    assert_eq!(value["attempts"], 0);
}
