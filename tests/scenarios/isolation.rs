//! Test: Isolation - instances on one substrate never share or delete each other's resources

use crate::helpers::*;
use shipgraph::core::error::IsolationError;
use shipgraph::core::identity::{
    derive_names, derive_names_with, teardown_plan, NameCategory, NameOverrides, NameRegistry,
    PipelineIdentity, WebhookSecret, SHARED_SUBSTRATE,
};
use std::collections::HashSet;

#[test]
fn test_two_instances_have_disjoint_names() {
    let frontend = derive_names(&identity("frontend"));
    let backend = derive_names(&identity("backend"));

    assert!(frontend.collisions(&backend).is_empty());
    let frontend_names: HashSet<&str> = frontend.iter().map(|(_, name)| name).collect();
    assert!(backend.iter().all(|(_, name)| !frontend_names.contains(name)));
    assert_eq!(frontend_names.len(), NameCategory::ALL.len());
}

#[test]
fn test_compiled_graphs_do_not_share_names() {
    let frontend = compile_yaml(&single_environment_yaml(), "frontend");
    let backend = compile_yaml(&single_environment_yaml(), "backend");

    assert_ne!(frontend.name, backend.name);
    assert_ne!(frontend.service_account, backend.service_account);
    assert_ne!(frontend.digest(), backend.digest());
}

#[test]
fn test_registry_rejects_colliding_override() {
    let mut registry = NameRegistry::new();
    registry.register(derive_names(&identity("frontend"))).unwrap();

    let stolen = derive_names(&identity("frontend")).sensor().to_string();
    let overrides = NameOverrides::new().with(NameCategory::Sensor, stolen.clone());
    let backend = derive_names_with(&identity("backend"), &overrides).unwrap();

    let err = registry.register(backend).unwrap_err();
    match err {
        IsolationError::NameCollision { name, owner, .. } => {
            assert_eq!(name, stolen);
            assert_eq!(owner, "frontend");
        }
        other => panic!("expected a collision, got {:?}", other),
    }

    // Nothing of the rejected set was claimed
    assert!(registry.get("backend").is_none());
    registry.register(derive_names(&identity("backend"))).unwrap();
}

#[test]
fn test_overrides_cannot_name_the_shared_substrate() {
    for shared in SHARED_SUBSTRATE.iter().filter(|name| name.len() >= 3) {
        let overrides = NameOverrides::new().with(NameCategory::ServiceAccount, *shared);
        assert!(derive_names_with(&identity("demo"), &overrides).is_err(), "{}", shared);
    }
}

#[test]
fn test_teardown_only_touches_own_resources() {
    let mut registry = NameRegistry::new();
    let frontend = derive_names(&identity("frontend"));
    let backend = derive_names(&identity("backend"));
    registry.register(frontend.clone()).unwrap();
    registry.register(backend.clone()).unwrap();

    let plan = registry.teardown("frontend").unwrap().unwrap();
    assert_eq!(plan.entries.len(), NameCategory::ALL.len());
    // Dependents go first
    assert_eq!(plan.entries[0].category, NameCategory::Sensor);
    for entry in &plan.entries {
        assert!(!SHARED_SUBSTRATE.contains(&entry.name.as_str()));
        assert_eq!(entry.name, frontend.get(entry.category));
        assert!(backend.iter().all(|(_, name)| name != entry.name));
    }

    // Backend is still registered, frontend is gone
    assert!(registry.get("backend").is_some());
    assert!(registry.teardown("frontend").is_none());
}

#[test]
fn test_plan_for_other_instance_fails_verification() {
    let frontend = derive_names(&identity("frontend"));
    let backend = derive_names(&identity("backend"));
    let plan = teardown_plan(&frontend);

    assert!(plan.verify(&frontend).is_ok());
    assert!(matches!(
        plan.verify(&backend),
        Err(IsolationError::ForeignResource { .. })
    ));
}

#[test]
fn test_prefix_separates_instances() {
    let default = derive_names(&identity("demo"));
    let prefixed = derive_names(&PipelineIdentity::new("demo").unwrap().with_prefix("teama").unwrap());
    assert!(default.collisions(&prefixed).is_empty());
}

#[test]
fn test_hyphen_cannot_move_between_prefix_and_instance() {
    let a_bc = derive_names(&PipelineIdentity::new("b-c").unwrap().with_prefix("a").unwrap());
    let ab_c = PipelineIdentity::new("c").unwrap().with_prefix("a-b");
    assert!(matches!(
        ab_c,
        Err(IsolationError::InvalidName { ref category, .. }) if category == "prefix"
    ));

    let abc = derive_names(&PipelineIdentity::new("c").unwrap().with_prefix("ab").unwrap());
    assert!(a_bc.collisions(&abc).is_empty());
}

#[test]
fn test_webhook_secrets_are_unique_hex() {
    let secrets: HashSet<String> = (0..16)
        .map(|_| WebhookSecret::generate().expose().to_string())
        .collect();
    assert_eq!(secrets.len(), 16);
    for secret in &secrets {
        assert_eq!(secret.len(), WebhookSecret::LEN);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
