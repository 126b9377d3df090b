//! Enrichment cache properties: canonical-key round trips, the
//! two-phase fuzzy confirmation flow, and generation-then-hit behaviour.

use std::collections::HashMap;
use std::sync::Arc;

use sommelier::cancel::CancelToken;
use sommelier::config::{Config, RouteTarget, TaskRoute};
use sommelier::enrich::{canonical, canonical_key, EnrichOutcome, EnrichRequest, EnrichmentService};
use sommelier::llm::LlmClient;
use sommelier::providers::mock::{MockCall, MockProvider};
use sommelier::providers::Provider;
use sommelier::store::memory::MemoryStore;
use sommelier::usage::Caller;

const CARD: &str = r#"{"overview":"Iconic Australian shiraz.","grapeComposition":[{"grape":"Shiraz","percentage":98.0},{"grape":"Cabernet Sauvignon","percentage":2.0}],"styleProfile":{"body":"Full","tannin":"High","acidity":"Medium","sweetness":"Dry"},"drinkWindow":{"start":2030,"peak":2045,"end":2065},"foodPairings":["beef"]}"#;

struct Rig {
    service: EnrichmentService,
    gemini: Arc<MockProvider>,
}

fn rig(gemini: MockProvider) -> Rig {
    let mut cfg = Config::default();
    cfg.retry.base_delay_ms = 1;
    cfg.enrichment.cache_replay_delay_ms = 0;
    cfg.task_routing.insert(
        "enrich".into(),
        TaskRoute {
            primary: RouteTarget {
                provider: "gemini".into(),
                model: "gemini-mock-model".into(),
            },
            fallback: None,
        },
    );
    let config = Arc::new(cfg);
    let store = Arc::new(MemoryStore::new());
    let gemini = Arc::new(gemini);
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    providers.insert("gemini".into(), gemini.clone());
    let llm = Arc::new(LlmClient::new(config.clone(), providers, store.clone()));
    Rig {
        service: EnrichmentService::new(llm, config, store),
        gemini,
    }
}

fn request(producer: &str, wine: &str, vintage: &str) -> EnrichRequest {
    EnrichRequest {
        producer: producer.into(),
        wine_name: wine.into(),
        vintage: Some(vintage.into()),
        ..Default::default()
    }
}

fn caller() -> Caller {
    Caller::new("u1", None)
}

// ── Canonical key properties ──────────────────────────────────

#[test]
fn canonical_is_idempotent_over_key_tuples() {
    let samples = [
        ("Château Margaux", "Grand Vin", "2015"),
        ("  PENFOLDS ", "Grange\tBin 95", "NV"),
        ("Domaine de la Romanée-Conti", "La Tâche", "1990"),
    ];
    for (p, w, v) in samples {
        let once = canonical_key(p, w, Some(v));
        let twice = canonical_key(&once.producer, &once.wine_name, Some(&once.vintage));
        assert_eq!(once, twice);
    }
}

#[test]
fn canonical_folds_case_diacritics_whitespace() {
    assert_eq!(canonical("  Château  MARGAUX "), canonical("chateau margaux"));
    assert_eq!(canonical("Romanée-Conti"), "romanee-conti");
}

// ── Round trip: generate once, hit cache after ────────────────

#[tokio::test]
async fn generated_card_round_trips_through_cache() {
    let r = rig(MockProvider::new("gemini").queue(MockCall::text(CARD)));

    let first = r
        .service
        .enrich(&request("Penfolds", "Grange", "2016"), &caller(), &CancelToken::none())
        .await
        .unwrap();
    let EnrichOutcome::Record(generated) = first else {
        panic!("expected record")
    };
    assert_eq!(r.gemini.calls().len(), 1);

    // Diacritic/case/whitespace variants address the same row, no LLM call.
    let second = r
        .service
        .enrich(
            &request("  PENFOLDS ", "grange", "2016"),
            &caller(),
            &CancelToken::none(),
        )
        .await
        .unwrap();
    let EnrichOutcome::Record(cached) = second else {
        panic!("expected cache hit")
    };
    assert_eq!(r.gemini.calls().len(), 1, "second lookup must not call the LLM");
    assert_eq!(cached.source, "cache");

    // Scalar sections come back unchanged
    assert_eq!(cached.overview, generated.overview);
    assert_eq!(cached.drink_window, generated.drink_window);
    assert_eq!(cached.grape_composition, generated.grape_composition);
}

// ── Two-phase fuzzy confirmation ──────────────────────────────

#[tokio::test]
async fn fuzzy_match_confirms_in_two_phases() {
    let r = rig(MockProvider::new("gemini").queue(MockCall::text(CARD)));
    r.service
        .enrich(&request("Penfolds", "Grange", "2016"), &caller(), &CancelToken::none())
        .await
        .unwrap();

    // Phase 1: near-miss query proposes, does not serve
    let proposal = r
        .service
        .enrich(
            &request("Penfold", "Grange", "2016"),
            &caller(),
            &CancelToken::none(),
        )
        .await
        .unwrap();
    let EnrichOutcome::PendingConfirmation {
        matched_to,
        confidence,
        ..
    } = proposal
    else {
        panic!("expected confirmation request")
    };
    assert_eq!(matched_to, "penfolds grange");
    assert!(confidence > 0.8);
    assert_eq!(r.gemini.calls().len(), 1, "proposal must not call the LLM");

    // Phase 2: the same query with confirmMatch accepts the row
    let mut confirmed_req = request("Penfold", "Grange", "2016");
    confirmed_req.confirm_match = true;
    let confirmed = r
        .service
        .enrich(&confirmed_req, &caller(), &CancelToken::none())
        .await
        .unwrap();
    let EnrichOutcome::Record(record) = confirmed else {
        panic!("expected cache hit after confirmation")
    };
    assert_eq!(record.source, "cache");
    assert_eq!(record.overview.as_deref(), Some("Iconic Australian shiraz."));
    assert_eq!(r.gemini.calls().len(), 1);
}
