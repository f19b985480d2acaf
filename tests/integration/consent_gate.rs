//! Consent gating of model calls.

use crate::integration::test_utils::{text, Bench, ScriptedProvider, MODEL_ID, PROVIDER_ID};
use draftbench::consent::EgressEventKind;
use draftbench::error::{Action, ErrorCode};

#[tokio::test]
async fn test_run_without_consent_fails_closed() {
    let bench = Bench::new(ScriptedProvider::new(vec![Ok(text("never"))]));
    let id = bench.workbench_with(&[("a.md", "alpha")]).await;

    let err = bench.engine.run_agent(&id, PROVIDER_ID, "hello").await.unwrap_err();
    assert_eq!(err.error_code, ErrorCode::EgressConsentRequired);
    assert!(err.retryable);
    assert_eq!(err.actions, vec![Action::Retry]);
    assert_eq!(err.provider_id.as_deref(), Some(PROVIDER_ID));
    assert_eq!(err.model_id.as_deref(), Some(MODEL_ID));
    assert_eq!(err.workbench_id.as_deref(), Some(id.as_str()));
    assert!(err.scope_hash.is_some());

    assert_eq!(bench.provider.call_count(), 0);
    assert!(bench.engine.conversation(&id).unwrap().is_empty());
}

#[tokio::test]
async fn test_adding_a_file_invalidates_consent() {
    let bench = Bench::new(ScriptedProvider::new(vec![
        Ok(text("first")),
        Ok(text("second")),
    ]));
    let id = bench.workbench_with(&[("a.md", "alpha")]).await;
    bench.grant(&id);
    let granted = bench.engine.consent_status(&id, PROVIDER_ID).unwrap();
    assert!(granted.consented);

    bench.engine.run_agent(&id, PROVIDER_ID, "hello").await.unwrap();
    assert_eq!(bench.provider.call_count(), 1);

    let extra = bench.source("b.md", "bravo");
    bench.engine.add_files(&id, &[extra]).await.unwrap();

    let status = bench.engine.consent_status(&id, PROVIDER_ID).unwrap();
    assert!(!status.consented);
    assert_ne!(status.scope_hash, granted.scope_hash);

    let err = bench.engine.run_agent(&id, PROVIDER_ID, "again").await.unwrap_err();
    assert_eq!(err.error_code, ErrorCode::EgressConsentRequired);
    assert_eq!(err.scope_hash.as_deref(), Some(status.scope_hash.as_str()));
    assert_eq!(bench.provider.call_count(), 1);
}

#[tokio::test]
async fn test_grant_revoke_and_events() {
    let bench = Bench::new(ScriptedProvider::new(vec![Ok(text("hi"))]));
    let id = bench.workbench_with(&[("a.md", "alpha")]).await;

    let err = bench
        .engine
        .grant_consent(&id, PROVIDER_ID, "stale-hash", false)
        .unwrap_err();
    assert_eq!(err.error_code, ErrorCode::ValidationFailed);

    let status = bench.engine.consent_status(&id, PROVIDER_ID).unwrap();
    let granted = bench
        .engine
        .grant_consent(&id, PROVIDER_ID, &status.scope_hash, true)
        .unwrap();
    assert!(granted.consented);
    assert!(granted.persisted);

    bench.engine.run_agent(&id, PROVIDER_ID, "hello").await.unwrap();

    assert!(bench.engine.revoke_consent(&id, PROVIDER_ID).unwrap());
    assert!(!bench.engine.consent_status(&id, PROVIDER_ID).unwrap().consented);
    assert!(!bench.engine.revoke_consent(&id, PROVIDER_ID).unwrap());

    let kinds: Vec<EgressEventKind> = bench
        .engine
        .egress_events(&id)
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            EgressEventKind::ConsentGranted,
            EgressEventKind::ModelCall,
            EgressEventKind::ConsentRevoked,
        ]
    );
}

#[tokio::test]
async fn test_unknown_provider() {
    let bench = Bench::new(ScriptedProvider::new(Vec::new()));
    let id = bench.workbench_with(&[]).await;

    let err = bench.engine.run_agent(&id, "missing", "hello").await.unwrap_err();
    assert_eq!(err.error_code, ErrorCode::ProviderNotConfigured);
    assert_eq!(err.actions, vec![Action::OpenSettings]);
}
