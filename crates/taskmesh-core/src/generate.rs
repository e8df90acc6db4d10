use crate::error::{MeshError, MeshResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Injected generative/decision collaborator.
///
/// The orchestrator uses this for intent classification, planning, tool
/// selection, and response synthesis. It is an opaque service: given a
/// structured prompt pair it returns a raw answer that the caller parses
/// with the typed schemas below. A malformed answer or a failed call is an
/// ordinary stage failure subject to the pipeline's recovery rules.
///
/// To plug in a concrete provider, implement this trait and hand it to the
/// orchestrator as an `Arc<dyn GenerationService>`.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Run one generation call and return the raw structured answer.
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> MeshResult<String>;
}

/// Classified intent of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentAnswer {
    pub intent: String,
    /// Classifier confidence in `[0, 1]`.
    pub confidence: f64,
}

impl IntentAnswer {
    /// Parse a raw generation answer, rejecting anything that does not match
    /// the schema.
    pub fn parse(raw: &str) -> MeshResult<Self> {
        let answer: Self = serde_json::from_str(raw)
            .map_err(|e| MeshError::Generation(format!("malformed intent answer: {e}")))?;
        if !(0.0..=1.0).contains(&answer.confidence) {
            return Err(MeshError::Generation(format!(
                "intent confidence {} out of range",
                answer.confidence
            )));
        }
        Ok(answer)
    }

    /// The safe fallback used when intent classification fails: a neutral
    /// intent with confidence 0.5.
    pub fn neutral() -> Self {
        Self {
            intent: "general".to_string(),
            confidence: 0.5,
        }
    }
}

/// One planned step returned by the planning stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    /// Ids of plan steps this step depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A decomposition of a request into ordered steps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanAnswer {
    pub steps: Vec<PlanStep>,
}

impl PlanAnswer {
    /// Parse a raw generation answer into a validated plan.
    ///
    /// Steps must carry unique, non-empty ids; dependency references must
    /// resolve within the plan.
    pub fn parse(raw: &str) -> MeshResult<Self> {
        let answer: Self = serde_json::from_str(raw)
            .map_err(|e| MeshError::Generation(format!("malformed plan answer: {e}")))?;
        let mut seen = std::collections::HashSet::new();
        for step in &answer.steps {
            if step.id.is_empty() {
                return Err(MeshError::Generation("plan step with empty id".to_string()));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(MeshError::Generation(format!(
                    "duplicate plan step id '{}'",
                    step.id
                )));
            }
        }
        for step in &answer.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(MeshError::Generation(format!(
                        "plan step '{}' depends on unknown step '{dep}'",
                        step.id
                    )));
                }
            }
        }
        Ok(answer)
    }
}

/// Tool ids selected for a plan.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolsAnswer {
    pub tools: Vec<String>,
}

impl ToolsAnswer {
    /// Parse a raw generation answer into a tool selection.
    pub fn parse(raw: &str) -> MeshResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| MeshError::Generation(format!("malformed tool answer: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_parse_valid() {
        let answer = IntentAnswer::parse(r#"{"intent":"research","confidence":0.9}"#).unwrap();
        assert_eq!(answer.intent, "research");
        assert_eq!(answer.confidence, 0.9);
    }

    #[test]
    fn test_intent_parse_rejects_garbage() {
        assert!(IntentAnswer::parse("sure, here is the intent:").is_err());
        assert!(IntentAnswer::parse(r#"{"intent":"x","confidence":1.4}"#).is_err());
    }

    #[test]
    fn test_intent_neutral() {
        let neutral = IntentAnswer::neutral();
        assert_eq!(neutral.intent, "general");
        assert_eq!(neutral.confidence, 0.5);
    }

    #[test]
    fn test_plan_parse_valid() {
        let raw = r#"{"steps":[
            {"id":"a","description":"fetch"},
            {"id":"b","description":"summarize","depends_on":["a"]}
        ]}"#;
        let plan = PlanAnswer::parse(raw).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].depends_on, vec!["a"]);
    }

    #[test]
    fn test_plan_parse_rejects_dangling_dep() {
        let raw = r#"{"steps":[{"id":"a","description":"x","depends_on":["ghost"]}]}"#;
        let err = PlanAnswer::parse(raw).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_plan_parse_rejects_duplicate_id() {
        let raw = r#"{"steps":[
            {"id":"a","description":"x"},
            {"id":"a","description":"y"}
        ]}"#;
        assert!(PlanAnswer::parse(raw).is_err());
    }

    #[test]
    fn test_tools_parse() {
        let tools = ToolsAnswer::parse(r#"{"tools":["web_search","calculator"]}"#).unwrap();
        assert_eq!(tools.tools.len(), 2);
    }
}
