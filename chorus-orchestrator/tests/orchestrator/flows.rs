//! End-to-end flows through the dispatcher: fan-out, refinement, failure
//! isolation, load balancing, deadlines and synthesis.

use crate::support::{good_colors_json, harness, CannedLlm, ScriptedAdapter};
use chorus_orchestrator::dispatcher::ExecuteRequest;
use chorus_orchestrator::records::{ExecutionMode, ResponseStatus};
use chorus_orchestrator::sessions::SessionState;
use chorus_orchestrator::synthesis::SynthesisStrategy;
use chorus_providers::{ExpectedSchema, OutputFormat, ProviderError, ProviderId};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn colors_schema() -> ExpectedSchema {
    ExpectedSchema::structured([("colors", Some("[]"))])
}

#[tokio::test]
async fn single_provider_json_success() {
    let adapter = ScriptedAdapter::repeating(ProviderId::Claude, &good_colors_json());
    let h = harness(vec![Arc::new(adapter)], 2, None).await;

    let record = h
        .dispatcher
        .execute(
            ExecuteRequest::new(
                "list three primary colors",
                vec![ProviderId::Claude],
                colors_schema(),
                OutputFormat::Json,
            )
            .with_mode(ExecutionMode::Parallel)
            .with_quality_threshold(0.8)
            .with_max_refinements(3),
        )
        .await;

    let response = &record.responses[&ProviderId::Claude];
    assert_eq!(response.status, ResponseStatus::Completed);
    assert!(response.refinement_count <= 1);

    let parsed = response.parsed_value.as_ref().expect("parsed JSON value");
    let colors = parsed["colors"].as_array().expect("colors array");
    assert_eq!(colors.len(), 3);

    assert!((record.success_rate - 1.0).abs() < 1e-9);
    assert!(record.execution_time_seconds >= 0.0);
    assert!(record.completed_at.is_some());
}

#[tokio::test]
async fn refinement_recovers_malformed_json() {
    let adapter = ScriptedAdapter::new(
        ProviderId::Claude,
        vec![
            Ok("Here you go: { \"colors\": [\"red\",\"green\",\"blue\"] }".to_string()),
            Ok("{\"colors\": [\"red\",\"green\",\"blue\"]}".to_string()),
        ],
    );
    let h = harness(vec![Arc::new(adapter)], 2, None).await;

    let record = h
        .dispatcher
        .execute(
            ExecuteRequest::new(
                "list three primary colors",
                vec![ProviderId::Claude],
                colors_schema(),
                OutputFormat::Json,
            )
            .with_quality_threshold(0.7)
            .with_max_refinements(3),
        )
        .await;

    let response = &record.responses[&ProviderId::Claude];
    assert_eq!(response.status, ResponseStatus::Completed);
    assert_eq!(response.refinement_count, 1);

    // The refinement attempt went through the store with its trigger.
    let stats = h
        .dispatcher
        .persistence()
        .refinement_statistics()
        .await
        .unwrap();
    assert_eq!(stats.refined_requests, 1);
    assert_eq!(stats.common_triggers[0].0, "format_mismatch");
}

#[tokio::test]
async fn fact_check_synthesis_on_disagreement() {
    let rich = |claim: &str| {
        format!(
            "{claim}. The outlook is detailed here at length: {}",
            "market conditions are shifting and analysts are watching closely. ".repeat(4)
        )
    };
    let claude = ScriptedAdapter::repeating(ProviderId::Claude, &rich("prices will increase"));
    let gemini = ScriptedAdapter::repeating(ProviderId::Gemini, &rich("prices will decrease"));
    let h = harness(
        vec![Arc::new(claude), Arc::new(gemini)],
        2,
        Some(Arc::new(CannedLlm)),
    )
    .await;

    let record = h
        .dispatcher
        .execute(
            ExecuteRequest::new(
                "what will prices do next quarter",
                vec![ProviderId::Claude, ProviderId::Gemini],
                ExpectedSchema::freeform("a market outlook", vec!["prices".to_string()]),
                OutputFormat::StructuredText,
            )
            .with_quality_threshold(0.6)
            .with_max_refinements(2),
        )
        .await;

    assert!((record.success_rate - 1.0).abs() < 1e-9);
    let synthesis = record.synthesis.expect("synthesis result");
    assert_eq!(synthesis.strategy, SynthesisStrategy::FactCheck);

    assert!(!synthesis.contradictions.is_empty());
    let named: Vec<ProviderId> = synthesis
        .contradictions
        .iter()
        .flat_map(|c| [c.provider_a, c.provider_b])
        .collect();
    assert!(named.contains(&ProviderId::Claude));
    assert!(named.contains(&ProviderId::Gemini));

    assert_eq!(synthesis.contributions.len(), 2);
    let contribution_sum: f64 = synthesis.contributions.values().sum();
    assert!((contribution_sum - 1.0).abs() < 1e-6);
    // Two contradictions outweigh the agreement bonus, so overall
    // confidence lands strictly under the per-answer mean (~0.98 here).
    assert!(synthesis.overall_confidence < 0.9);
}

#[tokio::test]
async fn load_balancing_picks_fastest_healthy_provider() {
    let call_log = Arc::new(Mutex::new(Vec::<(ProviderId, Instant)>::new()));
    let adapters: Vec<Arc<dyn chorus_providers::ProviderAdapter>> = vec![
        Arc::new(
            ScriptedAdapter::repeating(ProviderId::Claude, &good_colors_json())
                .with_delay(Duration::from_millis(200))
                .with_call_log(Arc::clone(&call_log)),
        ),
        Arc::new(
            ScriptedAdapter::repeating(ProviderId::Gemini, &good_colors_json())
                .with_delay(Duration::from_millis(200))
                .with_call_log(Arc::clone(&call_log)),
        ),
        Arc::new(
            ScriptedAdapter::repeating(ProviderId::Perplexity, &good_colors_json())
                .with_delay(Duration::from_millis(200))
                .with_call_log(Arc::clone(&call_log)),
        ),
    ];
    let h = harness(adapters, 1, None).await;

    // Seed history: Claude 1s / 0.95, Gemini 5s / 0.9, Perplexity 15s / 0.5.
    let seed = [
        (ProviderId::Claude, 1.0, [true, true, true, true]),
        (ProviderId::Gemini, 5.0, [true, true, true, false]),
        (ProviderId::Perplexity, 15.0, [true, false, false, false]),
    ];
    for (provider, seconds, outcomes) in seed {
        for success in outcomes {
            let token = h.dispatcher.registry().acquire(provider).unwrap();
            h.dispatcher.registry().release(
                token,
                chorus_orchestrator::sessions::CallOutcome {
                    success,
                    response_time: seconds,
                },
            );
        }
    }

    // One request: the fastest healthy provider goes first.
    let record = h
        .dispatcher
        .execute(
            ExecuteRequest::new(
                "list three primary colors",
                vec![
                    ProviderId::Claude,
                    ProviderId::Gemini,
                    ProviderId::Perplexity,
                ],
                colors_schema(),
                OutputFormat::Json,
            )
            .with_mode(ExecutionMode::LoadBalanced)
            .with_quality_threshold(0.8)
            .with_max_refinements(1)
            .with_deadline(Duration::from_secs(30)),
        )
        .await;
    assert_eq!(record.responses.len(), 3);
    {
        let log = call_log.lock().unwrap();
        assert_eq!(log[0].0, ProviderId::Claude);
    }
    call_log.lock().unwrap().clear();

    // A three-request burst with max_concurrent = 1: the first pick of each
    // execution lands on a different provider.
    let mut handles = Vec::new();
    for i in 0..3u64 {
        let dispatcher = Arc::clone(&h.dispatcher);
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40 * i)).await;
            dispatcher
                .execute(
                    ExecuteRequest::new(
                        "list three primary colors",
                        vec![
                            ProviderId::Claude,
                            ProviderId::Gemini,
                            ProviderId::Perplexity,
                        ],
                        ExpectedSchema::structured([("colors", Some("[]"))]),
                        OutputFormat::Json,
                    )
                    .with_mode(ExecutionMode::LoadBalanced)
                    .with_quality_threshold(0.8)
                    .with_max_refinements(1)
                    .with_deadline(Duration::from_secs(30)),
                )
                .await
        }));
    }
    for handle in handles {
        let record = handle.await.unwrap();
        assert_eq!(record.responses.len(), 3);
    }

    let log = call_log.lock().unwrap();
    let first_three: std::collections::HashSet<ProviderId> =
        log.iter().take(3).map(|(provider, _)| *provider).collect();
    assert_eq!(first_three.len(), 3, "burst spread over all providers");
    assert_eq!(log[0].0, ProviderId::Claude);
}

#[tokio::test]
async fn deadline_is_honoured_with_no_session_left_busy() {
    let adapter = ScriptedAdapter::repeating(ProviderId::Gemini, &good_colors_json())
        .with_delay(Duration::from_secs(10));
    let h = harness(vec![Arc::new(adapter)], 2, None).await;

    let started = Instant::now();
    let record = h
        .dispatcher
        .execute(
            ExecuteRequest::new(
                "slow question",
                vec![ProviderId::Gemini],
                colors_schema(),
                OutputFormat::Json,
            )
            .with_max_refinements(3)
            .with_deadline(Duration::from_secs(2)),
        )
        .await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(1800));
    assert!(elapsed <= Duration::from_millis(2400));

    let response = &record.responses[&ProviderId::Gemini];
    assert_eq!(response.status, ResponseStatus::Failed);
    assert_eq!(response.error.as_deref(), Some("timeout"));
    assert_eq!(record.success_rate, 0.0);

    let session = h
        .dispatcher
        .registry()
        .snapshot(ProviderId::Gemini)
        .unwrap();
    assert_ne!(session.state, SessionState::Busy);
    assert_eq!(session.current_load, 0);
}

#[tokio::test]
async fn auth_error_aborts_only_its_controller() {
    let claude = ScriptedAdapter::repeating(ProviderId::Claude, &good_colors_json());
    let perplexity = ScriptedAdapter::repeating(ProviderId::Perplexity, &good_colors_json());
    let gemini = ScriptedAdapter::new(
        ProviderId::Gemini,
        vec![Err(ProviderError::Auth {
            message: "credentials rejected".to_string(),
        })],
    );
    let h = harness(
        vec![Arc::new(claude), Arc::new(gemini), Arc::new(perplexity)],
        2,
        None,
    )
    .await;

    let record = h
        .dispatcher
        .execute(
            ExecuteRequest::new(
                "list three primary colors",
                vec![
                    ProviderId::Claude,
                    ProviderId::Gemini,
                    ProviderId::Perplexity,
                ],
                colors_schema(),
                OutputFormat::Json,
            )
            .with_quality_threshold(0.8)
            .with_max_refinements(3),
        )
        .await;

    let gemini_response = &record.responses[&ProviderId::Gemini];
    assert_eq!(gemini_response.status, ResponseStatus::Failed);
    assert_eq!(gemini_response.error.as_deref(), Some("auth"));
    assert_eq!(gemini_response.refinement_count, 0);

    for provider in [ProviderId::Claude, ProviderId::Perplexity] {
        assert_eq!(
            record.responses[&provider].status,
            ResponseStatus::Completed
        );
    }
    assert!((record.success_rate - 2.0 / 3.0).abs() < 1e-9);

    let synthesis = record.synthesis.expect("synthesis result");
    assert_eq!(synthesis.contributions.len(), 2);
    assert!(!synthesis.contributions.contains_key(&ProviderId::Gemini));
    let contribution_sum: f64 = synthesis.contributions.values().sum();
    assert!((contribution_sum - 1.0).abs() < 1e-6);

    // No refinement attempts were recorded for the aborted provider.
    let stats = h
        .dispatcher
        .persistence()
        .refinement_statistics()
        .await
        .unwrap();
    assert_eq!(stats.refined_requests, 0);
}
