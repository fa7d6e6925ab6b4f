mod common;

use common::{classify, column_values, fixture, rows_of};
use projects_nlq::context::{ContextChain, TurnOutcome};
use projects_nlq::{ErrorKind, QueryRequest, QueryResponse};
use serde_json::json;

#[tokio::test]
async fn test_follow_up_merges_arguments_and_keeps_original() {
    let f = fixture(vec![
        classify("search_projects", json!({"status": "open"})),
        classify("search_projects", json!({"region": "UAE"})),
        classify("search_projects", json!({"status": "won"})),
    ]);

    let root = f.engine.handle(QueryRequest::new("Show me all open projects")).await;
    assert_eq!(rows_of(&root.response).len(), 12);
    let chain = root.next_context.unwrap();

    let narrowed = f
        .engine
        .handle(QueryRequest::following("only those in the UAE", &chain))
        .await;
    let rows = rows_of(&narrowed.response);
    assert_eq!(rows.len(), 4);
    assert!(column_values(rows, "Region").iter().all(|r| *r == "MENA"));
    let chain = narrowed.next_context.unwrap();
    assert_eq!(chain.previous.as_ref().unwrap().depth, 1);
    assert_eq!(chain.original.as_ref().unwrap().question, "Show me all open projects");

    // the current turn's status replaces the one carried from the chain
    let swapped = f
        .engine
        .handle(QueryRequest::following("which of these were won instead", &chain))
        .await;
    let rows = rows_of(&swapped.response);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["ProjectName"], json!("Dubai Metro Extension 3"));

    let requests = f.classifier.requests();
    assert!(requests[0].previous.is_none());
    assert_eq!(requests[2].original.as_ref().unwrap().template_name, "search_projects");
    assert_eq!(requests[2].previous.as_ref().unwrap().question, "only those in the UAE");
}

#[tokio::test]
async fn test_fourth_follow_up_is_rejected_before_classification() {
    let f = fixture(vec![
        classify("search_projects", json!({"status": "open"})),
        classify("search_projects", json!({})),
        classify("search_projects", json!({})),
        classify("search_projects", json!({})),
        classify("search_projects", json!({})),
    ]);

    let mut chain = f
        .engine
        .handle(QueryRequest::new("show open projects"))
        .await
        .next_context
        .unwrap();
    for turn in 1..=3 {
        let mut request = QueryRequest::following("and sort them by fee", &chain);
        request.follow_up = true;
        let outcome = f.engine.handle(request).await;
        chain = outcome.next_context.unwrap();
        assert_eq!(chain.previous.as_ref().unwrap().depth, turn);
    }

    let mut request = QueryRequest::following("and sort them by fee", &chain);
    request.follow_up = true;
    let rejected = f.engine.handle(request).await;

    assert!(matches!(
        rejected.response,
        QueryResponse::Error { kind: ErrorKind::InvalidRequest, .. }
    ));
    assert_eq!(f.classifier.calls(), 4);
}

#[tokio::test]
async fn test_new_question_without_anaphora_starts_a_new_chain() {
    let f = fixture(vec![
        classify("search_projects", json!({"status": "open"})),
        classify("search_projects", json!({"entity": "LiRo"})),
    ]);

    let chain = f
        .engine
        .handle(QueryRequest::new("show open projects"))
        .await
        .next_context
        .unwrap();
    let fresh = f
        .engine
        .handle(QueryRequest::following("Show me all projects for LiRo", &chain))
        .await;

    assert_eq!(rows_of(&fresh.response).len(), 15);
    let next = fresh.next_context.unwrap();
    assert_eq!(next.original.unwrap().question, "Show me all projects for LiRo");
    assert!(f.classifier.requests()[1].previous.is_none());
}

#[tokio::test]
async fn test_same_noun_follow_up_filters_to_previous_values() {
    let f = fixture(vec![
        classify("search_projects", json!({"region": "UAE"})),
        classify("search_projects", json!({"status": "won"})),
    ]);

    let chain = f
        .engine
        .handle(QueryRequest::new("projects in the UAE"))
        .await
        .next_context
        .unwrap();
    let outcome = f
        .engine
        .handle(QueryRequest::following("show won projects for the same clients", &chain))
        .await;

    let rows = rows_of(&outcome.response);
    assert!(column_values(rows, "Client").iter().all(|c| *c == "RTA"));
    let QueryResponse::Tabular(result) = &outcome.response else { unreachable!() };
    assert!(result.query.sql.contains("\"Client\" IN (@"));
}

#[tokio::test]
async fn test_malformed_classification_answers_with_narrative() {
    let f = fixture(vec![
        classify("search_projects", json!({"region": "UAE"})),
        classify("forecast_revenue", json!({"year": 2030})),
    ]);

    let chain = f
        .engine
        .handle(QueryRequest::new("projects in the UAE"))
        .await
        .next_context
        .unwrap();
    let outcome = f
        .engine
        .handle(QueryRequest::following("what do these projects have in common", &chain))
        .await;

    let QueryResponse::NarrativeFallback { text, samples } = &outcome.response else {
        panic!("expected a narrative, got {:?}", outcome.response);
    };
    assert!(!text.is_empty());
    assert_eq!(samples.len(), 5);
    assert!(column_values(samples, "Region").iter().all(|r| *r == "MENA"));

    let next = outcome.next_context.clone().unwrap();
    let previous = next.previous.unwrap();
    let original = next.original.unwrap();
    assert!(previous.same_turn(&original));
    assert_eq!(previous.depth, 1);

    let body = outcome.to_api_json();
    assert_eq!(body["data"][0]["type"], json!("ai_analysis"));
}

#[tokio::test]
async fn test_narrative_follow_ups_use_up_the_chain() {
    let mut script = vec![classify("search_projects", json!({"region": "UAE"}))];
    script.extend((0..5).map(|_| classify("forecast_revenue", json!({"year": 2030}))));
    let f = fixture(script);

    let mut chain = f
        .engine
        .handle(QueryRequest::new("projects in the UAE"))
        .await
        .next_context
        .unwrap();
    for turn in 1..=3 {
        let outcome = f
            .engine
            .handle(QueryRequest::following("what do these projects have in common", &chain))
            .await;
        assert!(matches!(outcome.response, QueryResponse::NarrativeFallback { .. }));
        chain = outcome.next_context.unwrap();
        assert_eq!(chain.previous.as_ref().unwrap().depth, turn);
    }

    let rejected = f
        .engine
        .handle(QueryRequest::following("what do these projects have in common", &chain))
        .await;
    assert!(matches!(
        rejected.response,
        QueryResponse::Error { kind: ErrorKind::InvalidRequest, .. }
    ));
    assert!(rejected.next_context.is_none());
    assert_eq!(f.classifier.calls(), 4);
}

#[tokio::test]
async fn test_context_round_trips_through_the_api_shape() {
    let f = fixture(vec![
        classify("search_projects", json!({"entity": "Springfield"})),
        classify("search_projects", json!({"status": "open"})),
    ]);
    let question = projects_nlq::disambiguation::annotate("projects for Springfield", "Client", "Springfield");

    let root = f.engine.handle(QueryRequest::new(question)).await;
    assert_eq!(rows_of(&root.response).len(), 12);

    // a client echoes the context back with its next question
    let body = root.to_api_json();
    let request: QueryRequest = serde_json::from_value(json!({
        "question": "which of them are still open",
        "previousContext": body["context"]["previousContext"],
        "originalContext": body["context"]["originalContext"],
    }))
    .unwrap();
    let outcome = f.engine.handle(request).await;

    // the column choice carries into the follow-up without a new prompt
    let rows = rows_of(&outcome.response);
    assert_eq!(rows.len(), 6);
    assert!(column_values(rows, "Client").iter().all(|c| *c == "Springfield Water Dept"));
}

#[test]
fn test_chain_rebuilt_from_history_skips_failures() {
    let context = |question: &str, depth: u32| projects_nlq::QueryContext {
        question: question.to_string(),
        template_name: "search_projects".to_string(),
        arguments: json!({"status": "open"}).as_object().cloned().unwrap(),
        result_rows: None,
        depth,
    };
    let chain = ContextChain::from_history(&[
        TurnOutcome::Answered(context("open projects", 0)),
        TurnOutcome::Failed,
        TurnOutcome::Answered(context("those in the UAE", 1)),
        TurnOutcome::Narrative,
    ]);

    assert_eq!(chain.original.as_ref().unwrap().question, "open projects");
    let previous = chain.previous.unwrap();
    assert_eq!(previous.question, "open projects");
    assert_eq!(previous.depth, 2);
}
