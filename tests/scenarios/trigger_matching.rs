//! Test: Trigger matching - only pushes to the target branch start an execution

use shipgraph::core::trigger::{BranchFilter, TriggerError, TriggerEvent};
use serde_json::json;

fn push(branch_ref: &str) -> TriggerEvent {
    TriggerEvent::new("9b1c7d2", branch_ref, "https://github.com/acme/site.git")
}

#[test]
fn test_both_ref_forms_match() {
    let filter = BranchFilter::new("main");
    assert!(filter.matches(&push("main")));
    assert!(filter.matches(&push("refs/heads/main")));

    // The target may itself be given fully qualified
    let qualified = BranchFilter::new("refs/heads/main");
    assert_eq!(qualified.target(), "main");
    assert!(qualified.matches(&push("main")));
}

#[test]
fn test_other_branches_and_tags_do_not_match() {
    let filter = BranchFilter::new("main");
    assert!(!filter.matches(&push("develop")));
    assert!(!filter.matches(&push("refs/heads/main-backup")));
    assert!(!filter.matches(&push("refs/tags/main")));
    assert!(!filter.matches(&push("refs/heads/feature/main")));
}

#[test]
fn test_webhook_payload_to_trigger() {
    let payload = json!({
        "ref": "refs/heads/main",
        "after": "0d1e2f3a4b5c",
        "repository": {
            "clone_url": "https://github.com/acme/site.git",
            "full_name": "acme/site"
        },
        "pusher": { "name": "octocat" }
    });

    let event = TriggerEvent::from_webhook_payload(&payload).unwrap();
    assert_eq!(event.commit_id, "0d1e2f3a4b5c");
    assert_eq!(event.branch(), Some("main"));
    assert_eq!(event.source_url, "https://github.com/acme/site.git");
    assert_eq!(event.actor.as_deref(), Some("octocat"));
    assert!(BranchFilter::new("main").matches(&event));
}

#[test]
fn test_incomplete_payloads_are_rejected() {
    let missing_commit = json!({
        "ref": "refs/heads/main",
        "repository": { "clone_url": "https://github.com/acme/site.git" }
    });
    assert_eq!(
        TriggerEvent::from_webhook_payload(&missing_commit).unwrap_err(),
        TriggerError::MissingField("after".to_string())
    );

    let empty_ref = json!({
        "ref": "",
        "after": "abc",
        "repository": { "clone_url": "https://github.com/acme/site.git" }
    });
    assert_eq!(
        TriggerEvent::from_webhook_payload(&empty_ref).unwrap_err(),
        TriggerError::InvalidField("ref".to_string())
    );

    assert!(TriggerEvent::from_webhook_payload(&json!([1, 2, 3])).is_err());
}
