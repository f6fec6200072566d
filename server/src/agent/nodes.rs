//! Analysis Nodes
//!
//! The seven node adapters: thin prompts and lookups over the LLM, vector
//! store and semantic cache. Each node returns a JSON payload; failures and
//! missing collaborators degrade to a skipped payload, never to an error.
//!
//! System prompts are consts so they stay byte-identical across ticks and
//! the provider's prefix cache keeps working.

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::customer::CustomerContext;
use super::graph::{NodeContext, NodeDeps, NodeKind};
use crate::room::TranscriptTurn;
use crate::signal::messages::Role;

/// Intent labels the pipeline recognizes.
pub const KNOWN_INTENTS: &[&str] = &["요금제변경", "해지", "위약금", "멤버십", "일반문의"];

/// Below this intent confidence the policy retrieval is skipped.
pub const INTENT_CONFIDENCE_FLOOR: f64 = 0.5;

/// Risk flags the pipeline recognizes.
pub const KNOWN_RISK_FLAGS: &[&str] = &["churn", "cancellation", "complaint", "escalation"];

const SUMMARIZE_SYSTEM: &str = "당신은 통신사 상담사를 돕는 분석 도우미입니다. \
대화 전체를 읽고 JSON으로만 답하세요: \
{\"summary\": \"대화 요약 한 문장\", \"customer_issue\": \"고객 문제 한 문장\", \"agent_action\": \"상담사가 취한/취할 행동 한 문장\"}";

const INTENT_SYSTEM: &str = "당신은 통신사 상담 의도 분류기입니다. \
고객 발화를 읽고 다음 중 하나로 분류해 JSON으로만 답하세요. \
라벨: 요금제변경, 해지, 위약금, 멤버십, 일반문의. \
형식: {\"intent_label\": \"...\", \"confidence\": 0.0, \"explanation\": \"...\"}";

const SENTIMENT_SYSTEM: &str = "당신은 통신사 상담 감정 분석기입니다. \
고객 발화의 감정을 JSON으로만 답하세요: \
{\"sentiment_label\": \"positive|neutral|negative\", \"sentiment_score\": 0.0, \"explanation\": \"...\"}";

const DRAFT_REPLY_SYSTEM: &str = "당신은 통신사 상담사의 응대 초안을 쓰는 도우미입니다. \
고객의 최근 발화에 대한 짧고 정중한 응대 한두 문장과 핵심 키워드를 JSON으로만 답하세요: \
{\"short_reply\": \"...\", \"keywords\": [\"...\"]}";

const RISK_SYSTEM: &str = "당신은 통신사 상담 리스크 탐지기입니다. \
다음 발화에서 위험 신호를 찾아 JSON으로만 답하세요. \
가능한 플래그: churn, cancellation, complaint, escalation. \
형식: {\"risk_flags\": [\"...\"], \"explanation\": \"...\"}";

const GUIDE_SYSTEM: &str = "당신은 통신사 상담 가이드 작성기입니다. \
의도와 정책 근거를 바탕으로 상담사가 따라할 3~5단계 안내를 JSON으로만 답하세요: \
{\"guide\": [\"1단계 ...\", \"2단계 ...\"]}";

/// Vector collections consulted per intent label.
#[must_use]
pub fn intent_collections(intent_label: &str) -> &'static [&'static str] {
    match intent_label {
        "요금제변경" => &["mobile_plans"],
        "해지" => &["mobile_plans", "penalty_policy"],
        "위약금" => &["penalty_policy"],
        "멤버십" => &["membership"],
        _ => &["faq_general"],
    }
}

/// Empty/skipped payload for a node, used on deadline, missing
/// collaborators and missing input.
#[must_use]
pub fn skipped_payload(kind: NodeKind) -> Value {
    match kind {
        NodeKind::Summarize => json!({
            "summary": "", "customer_issue": "", "agent_action": "", "skipped": true
        }),
        NodeKind::Intent => json!({
            "intent_label": "일반문의", "confidence": 0.0, "explanation": "", "skipped": true
        }),
        NodeKind::Sentiment => json!({
            "sentiment_label": "neutral", "sentiment_score": 0.5, "explanation": "", "skipped": true
        }),
        NodeKind::DraftReply => json!({
            "short_reply": "", "keywords": [], "skipped": true
        }),
        NodeKind::Risk => json!({
            "risk_flags": [], "explanation": "", "skipped": true
        }),
        NodeKind::FaqSearch => json!({
            "faqs": [], "cache_hit": false, "skipped": true
        }),
        NodeKind::RagPolicy => json!({
            "recommendations": [], "skipped": true
        }),
    }
}

/// Run one node to completion. Never fails: collaborator errors produce the
/// node's skipped payload.
pub async fn execute(kind: NodeKind, ctx: &NodeContext, deps: &NodeDeps) -> Value {
    match kind {
        NodeKind::Summarize => summarize(ctx, deps).await,
        NodeKind::Intent => intent(ctx, deps).await,
        NodeKind::Sentiment => sentiment(ctx, deps).await,
        NodeKind::DraftReply => draft_reply(ctx, deps).await,
        NodeKind::Risk => risk(ctx, deps).await,
        NodeKind::FaqSearch => faq_search(ctx, deps).await,
        NodeKind::RagPolicy => rag_policy(ctx, deps).await,
    }
}

fn turns_text(turns: &[TranscriptTurn]) -> String {
    turns
        .iter()
        .map(|turn| format!("{} ({}): {}", turn.nickname, turn.speaker_role.as_str(), turn.text))
        .collect::<Vec<_>>()
        .join("\n")
}

fn customer_turns(turns: &[TranscriptTurn]) -> Vec<&TranscriptTurn> {
    turns
        .iter()
        .filter(|turn| turn.speaker_role == Role::Customer)
        .collect()
}

fn last_customer_text(turns: &[TranscriptTurn]) -> Option<String> {
    customer_turns(turns).last().map(|turn| turn.text.clone())
}

fn customer_block(customer: Option<&CustomerContext>) -> String {
    customer.map_or_else(String::new, |ctx| {
        format!("\n\n고객 정보: {}", ctx.profile)
    })
}

/// Pull the first JSON object out of a completion, tolerating prose and
/// code fences around it.
#[must_use]
pub fn extract_json(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

async fn complete_json(deps: &NodeDeps, system: &str, user: &str) -> Option<Value> {
    if !deps.llm_available {
        return None;
    }
    match deps.llm.complete(system, user).await {
        Ok(text) => {
            let parsed = extract_json(&text);
            if parsed.is_none() {
                debug!("Completion carried no JSON object");
            }
            parsed
        }
        Err(e) => {
            warn!(error = %e, "LLM completion failed");
            None
        }
    }
}

/// Rewritten fresh from the whole transcript every tick; incremental
/// appending would grow the summary without bound.
async fn summarize(ctx: &NodeContext, deps: &NodeDeps) -> Value {
    if ctx.snapshot.is_empty() {
        return skipped_payload(NodeKind::Summarize);
    }
    let user = format!(
        "대화:\n{}{}",
        turns_text(&ctx.snapshot),
        customer_block(ctx.customer.as_ref())
    );
    match complete_json(deps, SUMMARIZE_SYSTEM, &user).await {
        Some(mut payload) => {
            for field in ["summary", "customer_issue", "agent_action"] {
                if payload.get(field).is_none() {
                    payload[field] = json!("");
                }
            }
            payload
        }
        None => skipped_payload(NodeKind::Summarize),
    }
}

async fn intent(ctx: &NodeContext, deps: &NodeDeps) -> Value {
    let new_turns = &ctx.snapshot[ctx.cursor.min(ctx.snapshot.len())..];
    let Some(text) = last_customer_text(new_turns).or_else(|| last_customer_text(&ctx.snapshot))
    else {
        return skipped_payload(NodeKind::Intent);
    };

    if let Some(payload) = complete_json(deps, INTENT_SYSTEM, &text).await {
        let label = payload
            .get("intent_label")
            .and_then(Value::as_str)
            .unwrap_or("일반문의");
        let label = if KNOWN_INTENTS.contains(&label) {
            label
        } else {
            "일반문의"
        };
        return json!({
            "intent_label": label,
            "confidence": payload.get("confidence").and_then(Value::as_f64).unwrap_or(0.0),
            "explanation": payload.get("explanation").and_then(Value::as_str).unwrap_or(""),
        });
    }

    // Keyword fallback keeps intent (and therefore policy retrieval) alive
    // without an LLM.
    let (label, confidence) = if text.contains("요금제") {
        ("요금제변경", 0.6)
    } else if text.contains("위약금") {
        ("위약금", 0.6)
    } else if text.contains("해지") {
        ("해지", 0.6)
    } else if text.contains("멤버십") {
        ("멤버십", 0.6)
    } else {
        ("일반문의", 0.3)
    };
    json!({
        "intent_label": label,
        "confidence": confidence,
        "explanation": "keyword match",
    })
}

async fn sentiment(ctx: &NodeContext, deps: &NodeDeps) -> Value {
    let new_turns = &ctx.snapshot[ctx.cursor.min(ctx.snapshot.len())..];
    let Some(text) = last_customer_text(new_turns) else {
        return skipped_payload(NodeKind::Sentiment);
    };
    match complete_json(deps, SENTIMENT_SYSTEM, &text).await {
        Some(payload) => {
            let score = payload
                .get("sentiment_score")
                .and_then(Value::as_f64)
                .unwrap_or(0.5)
                .clamp(0.0, 1.0);
            json!({
                "sentiment_label": payload.get("sentiment_label").and_then(Value::as_str).unwrap_or("neutral"),
                "sentiment_score": score,
                "explanation": payload.get("explanation").and_then(Value::as_str).unwrap_or(""),
            })
        }
        None => skipped_payload(NodeKind::Sentiment),
    }
}

/// Consumes only customer turns appended since this node's cursor.
async fn draft_reply(ctx: &NodeContext, deps: &NodeDeps) -> Value {
    let new_turns = &ctx.snapshot[ctx.cursor.min(ctx.snapshot.len())..];
    let fresh: Vec<&TranscriptTurn> = customer_turns(new_turns);
    if fresh.is_empty() {
        return skipped_payload(NodeKind::DraftReply);
    }
    let user = fresh
        .iter()
        .map(|turn| turn.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    match complete_json(deps, DRAFT_REPLY_SYSTEM, &user).await {
        Some(payload) => json!({
            "short_reply": payload.get("short_reply").and_then(Value::as_str).unwrap_or(""),
            "keywords": payload.get("keywords").cloned().unwrap_or_else(|| json!([])),
        }),
        None => skipped_payload(NodeKind::DraftReply),
    }
}

async fn risk(ctx: &NodeContext, deps: &NodeDeps) -> Value {
    let new_turns = &ctx.snapshot[ctx.cursor.min(ctx.snapshot.len())..];
    if new_turns.is_empty() {
        return skipped_payload(NodeKind::Risk);
    }
    let text = turns_text(new_turns);

    if let Some(payload) = complete_json(deps, RISK_SYSTEM, &text).await {
        let flags: Vec<String> = payload
            .get("risk_flags")
            .and_then(Value::as_array)
            .map(|flags| {
                flags
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|flag| KNOWN_RISK_FLAGS.contains(flag))
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        return json!({
            "risk_flags": flags,
            "explanation": payload.get("explanation").and_then(Value::as_str).unwrap_or(""),
        });
    }

    let mut flags = Vec::new();
    if text.contains("해지") {
        flags.push("cancellation");
        flags.push("churn");
    }
    if text.contains("불만") || text.contains("짜증") {
        flags.push("complaint");
    }
    if text.contains("책임자") || text.contains("상급자") {
        flags.push("escalation");
    }
    json!({ "risk_flags": flags, "explanation": "keyword match" })
}

async fn faq_search(ctx: &NodeContext, deps: &NodeDeps) -> Value {
    let new_turns = &ctx.snapshot[ctx.cursor.min(ctx.snapshot.len())..];
    let Some(query) = last_customer_text(new_turns) else {
        return skipped_payload(NodeKind::FaqSearch);
    };

    let (cached, embedding) = deps.cache.lookup(&query).await;
    if let Some(payload) = cached {
        let faqs = payload.get("faqs").cloned().unwrap_or_else(|| json!([]));
        return json!({ "faqs": faqs, "cache_hit": true });
    }

    let documents = match deps.vector.search("faq", &query, 3).await {
        Ok(documents) => documents,
        Err(e) => {
            debug!(error = %e, "FAQ search unavailable");
            return skipped_payload(NodeKind::FaqSearch);
        }
    };

    let faqs: Vec<Value> = documents
        .iter()
        .map(|doc| {
            json!({
                "question": doc.title,
                "answer": doc.content,
                "score": doc.score,
            })
        })
        .collect();
    let payload = json!({ "faqs": faqs, "cache_hit": false });

    if let Some(embedding) = embedding {
        deps.cache
            .insert(&embedding, json!({ "faqs": payload["faqs"].clone() }))
            .await;
    }
    payload
}

/// Search every collection mapped to an intent label, ranked best-first.
async fn search_policies(label: &str, query: &str, deps: &NodeDeps) -> Vec<Value> {
    let mut recommendations = Vec::new();
    for collection in intent_collections(label) {
        match deps.vector.search(collection, query, 3).await {
            Ok(documents) => {
                for doc in documents {
                    recommendations.push(json!({
                        "title": doc.title,
                        "content": doc.content,
                        "metadata": doc.metadata,
                        "relevance_score": doc.score,
                    }));
                }
            }
            Err(e) => {
                debug!(collection, error = %e, "Policy search unavailable");
            }
        }
    }

    recommendations.sort_by(|a, b| {
        let score_a = a["relevance_score"].as_f64().unwrap_or(0.0);
        let score_b = b["relevance_score"].as_f64().unwrap_or(0.0);
        score_b.partial_cmp(&score_a).unwrap_or(std::cmp::Ordering::Equal)
    });
    recommendations.truncate(5);
    recommendations
}

/// Runs after intent; the intent label picks the collections to search.
async fn rag_policy(ctx: &NodeContext, deps: &NodeDeps) -> Value {
    let Some(intent) = ctx.intent.as_ref() else {
        return skipped_payload(NodeKind::RagPolicy);
    };
    let confidence = intent
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    if confidence < INTENT_CONFIDENCE_FLOOR {
        return skipped_payload(NodeKind::RagPolicy);
    }
    let label = intent
        .get("intent_label")
        .and_then(Value::as_str)
        .unwrap_or("일반문의");
    let Some(query) = last_customer_text(&ctx.snapshot) else {
        return skipped_payload(NodeKind::RagPolicy);
    };

    let recommendations = search_policies(label, &query, deps).await;
    if recommendations.is_empty() {
        return skipped_payload(NodeKind::RagPolicy);
    }
    json!({ "recommendations": recommendations, "skipped": false })
}

/// One-shot consultation guide: intent over the full transcript, policy
/// retrieval, then a composed step list.
///
/// The requester's options steer the run: an `intent_label` from the known
/// set pins the intent instead of classifying, and a `focus` string
/// replaces the last customer utterance as the retrieval query.
pub async fn consultation_guide(
    snapshot: &[TranscriptTurn],
    customer: Option<&CustomerContext>,
    options: Option<&Value>,
    deps: &NodeDeps,
) -> (Vec<String>, Vec<Value>, Vec<String>) {
    let requested_intent = options
        .and_then(|opts| opts.get("intent_label"))
        .and_then(Value::as_str)
        .filter(|label| KNOWN_INTENTS.contains(label));
    let focus = options
        .and_then(|opts| opts.get("focus"))
        .and_then(Value::as_str);

    let intent_payload = if let Some(label) = requested_intent {
        json!({ "intent_label": label, "confidence": 1.0, "explanation": "requested" })
    } else {
        let ctx = NodeContext {
            snapshot: std::sync::Arc::new(snapshot.to_vec()),
            cursor: 0,
            previous: None,
            customer: customer.cloned(),
            intent: None,
        };
        intent(&ctx, deps).await
    };

    let label = intent_payload
        .get("intent_label")
        .and_then(Value::as_str)
        .unwrap_or("일반문의");
    let confidence = intent_payload
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let query = focus
        .map(ToString::to_string)
        .or_else(|| last_customer_text(snapshot));

    let recommendations = match &query {
        Some(query) if confidence >= INTENT_CONFIDENCE_FLOOR => {
            search_policies(label, query, deps).await
        }
        _ => Vec::new(),
    };
    let citations: Vec<String> = recommendations
        .iter()
        .filter_map(|doc| doc.get("title").and_then(Value::as_str))
        .map(ToString::to_string)
        .collect();

    let user = format!(
        "의도: {intent_payload}\n요청 포커스: {}\n정책 근거: {}\n대화:\n{}",
        focus.unwrap_or("없음"),
        serde_json::Value::Array(recommendations.clone()),
        turns_text(snapshot),
    );
    let guide = match complete_json(deps, GUIDE_SYSTEM, &user).await {
        Some(payload) => payload
            .get("guide")
            .and_then(Value::as_array)
            .map(|steps| {
                steps
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        None => citations
            .iter()
            .map(|title| format!("관련 정책 확인: {title}"))
            .collect(),
    };

    (guide, recommendations, citations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_tolerates_fences_and_prose() {
        let fenced = "```json\n{\"a\": 1}\n```";
        assert_eq!(extract_json(fenced).unwrap()["a"], 1);

        let prose = "분석 결과는 다음과 같습니다: {\"intent_label\": \"해지\"} 감사합니다";
        assert_eq!(extract_json(prose).unwrap()["intent_label"], "해지");

        assert!(extract_json("no json here").is_none());
    }

    #[test]
    fn intent_collections_cover_known_labels() {
        assert_eq!(intent_collections("요금제변경"), &["mobile_plans"]);
        assert_eq!(intent_collections("해지"), &["mobile_plans", "penalty_policy"]);
        assert_eq!(intent_collections("멤버십"), &["membership"]);
        assert_eq!(intent_collections("뭔가다른것"), &["faq_general"]);
    }

    #[test]
    fn skipped_payloads_carry_node_shape() {
        assert_eq!(skipped_payload(NodeKind::RagPolicy)["skipped"], true);
        assert!(skipped_payload(NodeKind::FaqSearch)["faqs"]
            .as_array()
            .unwrap()
            .is_empty());
        assert_eq!(
            skipped_payload(NodeKind::Sentiment)["sentiment_label"],
            "neutral"
        );
    }
}
