use crate::chain::{ChainExecutionResult, ChainExecutor, ChainStep, ToolChain};
use crate::progress::{ProgressStatus, ProgressTracker};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use taskmesh_core::{
    DurableStore, GenerationService, IntentAnswer, MemoryStore, MeshError, MeshResult, PlanAnswer,
    ToolsAnswer,
};
use taskmesh_delegation::{DelegationEngine, DelegationResult, Task};
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

/// Total number of stages a run moves through, for progress reporting.
const STAGE_COUNT: f64 = 7.0;

/// A user request entering the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub query: String,
    pub requester_id: String,
    /// Capabilities an agent must carry if the request is delegated.
    #[serde(default)]
    pub required_capabilities: HashSet<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub is_urgent: bool,
    /// Estimated difficulty in `[0, 1]`.
    #[serde(default = "default_complexity")]
    pub complexity: f64,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

fn default_complexity() -> f64 {
    0.5
}

impl PipelineRequest {
    pub fn new(query: impl Into<String>, requester_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            requester_id: requester_id.into(),
            required_capabilities: HashSet::new(),
            priority: 0,
            is_urgent: false,
            complexity: default_complexity(),
            context: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.complexity = complexity.clamp(0.0, 1.0);
        self
    }

    pub fn urgent(mut self) -> Self {
        self.is_urgent = true;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Terminal status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// One recorded stage failure, with its recovery outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageError {
    pub stage: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub recovery_attempted: bool,
    pub recovery_successful: bool,
}

/// The mutable record threaded through one pipeline run.
///
/// Owned by a single run and discarded once the response is returned;
/// progress is persisted separately through the tracker before discard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub request: PipelineRequest,
    pub status: RunStatus,
    /// Context fragments gathered for the request.
    pub context: Vec<String>,
    pub intent: Option<IntentAnswer>,
    pub entities: Vec<String>,
    pub should_delegate: bool,
    pub delegation: Option<DelegationResult>,
    pub plan: Option<PlanAnswer>,
    pub selected_tools: Vec<String>,
    pub chain_result: Option<ChainExecutionResult>,
    /// Human-readable trace, one line per stage.
    pub reasoning: Vec<String>,
    pub response: String,
    pub errors: Vec<StageError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunState {
    fn new(request: PipelineRequest) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            request,
            status: RunStatus::Running,
            context: Vec::new(),
            intent: None,
            entities: Vec::new(),
            should_delegate: false,
            delegation: None,
            plan: None,
            selected_tools: Vec::new(),
            chain_result: None,
            reasoning: Vec::new(),
            response: String::new(),
            errors: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn trace(&mut self, line: impl Into<String>) {
        self.reasoning.push(line.into());
    }

    /// Append a stage error after its recovery ran.
    fn record_error(&mut self, stage: &str, error: &MeshError, recovery_successful: bool) {
        self.errors.push(StageError {
            stage: stage.to_string(),
            message: error.to_string(),
            timestamp: Utc::now(),
            recovery_attempted: true,
            recovery_successful,
        });
    }
}

/// Tunable parameters of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound on each generation service call, in milliseconds.
    #[serde(default = "default_generation_timeout_ms")]
    pub generation_timeout_ms: u64,
    /// Requests at or above this complexity are delegated even without
    /// explicit capability requirements.
    #[serde(default = "default_delegation_complexity")]
    pub delegation_complexity: f64,
}

fn default_generation_timeout_ms() -> u64 {
    20_000
}

fn default_delegation_complexity() -> f64 {
    0.8
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            generation_timeout_ms: default_generation_timeout_ms(),
            delegation_complexity: default_delegation_complexity(),
        }
    }
}

/// Top-level sequential state machine turning one request into a response.
///
/// Fixed stage order: retrieve context, classify intent, extract entities,
/// assess delegation, then either a delegation hand-off or a local
/// plan/select-tools/apply-reasoning path, then response synthesis. Every
/// stage carries an isolated recovery policy; only context retrieval and
/// response synthesis may fail the run, and even then the caller receives a
/// best-effort fallback response. `run` never raises.
pub struct PipelineOrchestrator {
    generation: Arc<dyn GenerationService>,
    executor: ChainExecutor,
    delegation: Option<Arc<DelegationEngine>>,
    tracker: Arc<ProgressTracker>,
    store: Arc<dyn DurableStore>,
    config: PipelineConfig,
}

impl PipelineOrchestrator {
    pub fn new(generation: Arc<dyn GenerationService>, executor: ChainExecutor) -> Self {
        Self {
            generation,
            executor,
            delegation: None,
            tracker: Arc::new(ProgressTracker::new()),
            store: Arc::new(MemoryStore::new()),
            config: PipelineConfig::default(),
        }
    }

    /// Wire in a delegation engine for the hand-off branch.
    pub fn with_delegation(mut self, engine: Arc<DelegationEngine>) -> Self {
        self.delegation = Some(engine);
        self
    }

    /// Share an externally owned progress tracker.
    pub fn with_tracker(mut self, tracker: Arc<ProgressTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Wire in a durable store for optional persistence.
    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// The tracker observing this orchestrator's runs.
    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    /// Run the full pipeline for one request. Always returns a `RunState`
    /// with a terminal status and a non-empty response.
    pub async fn run(&self, request: PipelineRequest) -> RunState {
        let mut run = RunState::new(request);
        self.tracker.register_task(run.run_id).await;
        self.tracker
            .update_status(run.run_id, ProgressStatus::InProgress)
            .await;
        info!(run_id = %run.run_id, query = %run.request.query, "Pipeline: run started");

        // Stage 1: retrieve context — one of the two stages allowed to be
        // fatal to the run.
        match self.retrieve_context(&run.request).await {
            Ok(context) => {
                run.trace(format!("context: {} fragment(s)", context.len()));
                run.context = context;
            }
            Err(e) => {
                run.record_error("retrieve_context", &e, false);
                self.tracker.record_error(run.run_id, e.to_string()).await;
                return self.finish(run, RunStatus::Failed).await;
            }
        }
        self.stage_done(&run, 1.0).await;

        // Stage 2: classify intent — recovers to a neutral classification.
        run.intent = Some(match self.classify_intent(&run).await {
            Ok(intent) => {
                run.trace(format!(
                    "intent: {} ({:.2})",
                    intent.intent, intent.confidence
                ));
                intent
            }
            Err(e) => {
                warn!(run_id = %run.run_id, error = %e, "Pipeline: intent classification failed, using neutral");
                run.record_error("classify_intent", &e, true);
                run.trace("intent: recovered neutral");
                IntentAnswer::neutral()
            }
        });
        self.stage_done(&run, 2.0).await;

        // Stage 3: extract entities — recovers to an empty list.
        run.entities = match self.extract_entities(&run.request.query) {
            Ok(entities) => {
                run.trace(format!("entities: {}", entities.len()));
                entities
            }
            Err(e) => {
                run.record_error("extract_entities", &e, true);
                Vec::new()
            }
        };
        self.stage_done(&run, 3.0).await;

        // Stage 4: assess delegation — recovers to the local path.
        run.should_delegate = self.assess_delegation(&run.request);
        run.trace(format!("delegation assessment: {}", run.should_delegate));
        self.stage_done(&run, 4.0).await;

        if run.should_delegate {
            match self.delegate(&mut run).await {
                Ok(()) => {}
                Err(e) => {
                    // A failed hand-off degrades to the local planning path.
                    warn!(run_id = %run.run_id, error = %e, "Pipeline: delegation hand-off failed, falling back to local path");
                    run.record_error("delegate", &e, true);
                    run.should_delegate = false;
                }
            }
        }

        if !run.should_delegate {
            self.local_path(&mut run).await;
        }
        self.stage_done(&run, 6.0).await;

        // Final stage: synthesize response — the other fatal-capable stage.
        match self.synthesize_response(&run).await {
            Ok(response) => {
                run.response = response;
                self.finish(run, RunStatus::Completed).await
            }
            Err(e) => {
                run.record_error("synthesize_response", &e, false);
                self.tracker.record_error(run.run_id, e.to_string()).await;
                self.finish(run, RunStatus::Failed).await
            }
        }
    }

    /// Stamp the terminal status, fill the fallback response if needed, and
    /// persist a run summary (best effort).
    async fn finish(&self, mut run: RunState, status: RunStatus) -> RunState {
        run.status = status;
        run.finished_at = Some(Utc::now());
        if run.response.is_empty() {
            run.response = self.fallback_response(&run);
        }

        let progress_status = match status {
            RunStatus::Failed => ProgressStatus::Failed,
            _ => ProgressStatus::Completed,
        };
        self.tracker.update_status(run.run_id, progress_status).await;

        let summary = json!({
            "run_id": run.run_id,
            "status": run.status,
            "delegated": run.should_delegate,
            "errors": run.errors.len(),
        });
        if let Err(e) = self.store.persist("run", &summary).await {
            // Persistence failures never become run failures.
            warn!(run_id = %run.run_id, error = %e, "Pipeline: run summary persist failed");
        }

        info!(
            run_id = %run.run_id,
            status = ?run.status,
            errors = run.errors.len(),
            "Pipeline: run finished"
        );
        run
    }

    async fn stage_done(&self, run: &RunState, stages_complete: f64) {
        self.tracker
            .update_progress(run.run_id, stages_complete / STAGE_COUNT, None)
            .await;
    }

    /// Gather context fragments for the request.
    async fn retrieve_context(&self, request: &PipelineRequest) -> MeshResult<Vec<String>> {
        if request.query.trim().is_empty() {
            return Err(MeshError::Validation("empty query".to_string()));
        }
        let mut fragments = vec![format!("requester: {}", request.requester_id)];
        if let Some(context) = &request.context {
            fragments.push(context.to_string());
        }
        Ok(fragments)
    }

    async fn classify_intent(&self, run: &RunState) -> MeshResult<IntentAnswer> {
        let raw = self
            .generate(
                "Classify the intent of the user request. \
                 Answer as JSON: {\"intent\": string, \"confidence\": number}.",
                &run.request.query,
            )
            .await?;
        IntentAnswer::parse(&raw)
    }

    /// Local heuristic: quoted spans and capitalized tokens.
    fn extract_entities(&self, query: &str) -> MeshResult<Vec<String>> {
        let quoted = Regex::new(r#""([^"]+)""#)
            .map_err(|e| MeshError::Execution(format!("entity pattern: {e}")))?;
        let capitalized = Regex::new(r"\b[A-Z][A-Za-z0-9_-]+\b")
            .map_err(|e| MeshError::Execution(format!("entity pattern: {e}")))?;

        let mut entities = Vec::new();
        for capture in quoted.captures_iter(query) {
            if let Some(span) = capture.get(1) {
                entities.push(span.as_str().to_string());
            }
        }
        for m in capitalized.find_iter(query) {
            let candidate = m.as_str().to_string();
            if !entities.contains(&candidate) {
                entities.push(candidate);
            }
        }
        Ok(entities)
    }

    /// Delegate when the request names capabilities or is complex enough.
    fn assess_delegation(&self, request: &PipelineRequest) -> bool {
        !request.required_capabilities.is_empty()
            || request.complexity >= self.config.delegation_complexity
    }

    /// Hand the request off to the delegation engine.
    async fn delegate(&self, run: &mut RunState) -> MeshResult<()> {
        let engine = self.delegation.as_ref().ok_or_else(|| {
            MeshError::Precondition("no delegation engine configured".to_string())
        })?;

        let mut task = Task::new(run.request.query.clone(), run.request.requester_id.clone())
            .with_capabilities(run.request.required_capabilities.iter().cloned())
            .with_priority(run.request.priority)
            .with_complexity(run.request.complexity)
            .with_context(json!({"run_id": run.run_id}));
        if run.request.is_urgent {
            task = task.urgent();
        }
        let task_id = task.id;

        self.tracker.register_task(task_id).await;
        let result = engine.delegate(task).await;
        if result.success {
            self.tracker
                .update_status(task_id, ProgressStatus::InProgress)
                .await;
        }

        run.trace(match (&result.agent_id, result.success) {
            (Some(agent_id), true) => format!("delegated task {task_id} to agent {agent_id}"),
            _ => format!("task {task_id} queued: {}", result.reason),
        });

        if let Err(e) = self
            .store
            .persist("task", &json!({"task_id": task_id, "run_id": run.run_id}))
            .await
        {
            warn!(task_id = %task_id, error = %e, "Pipeline: task persist failed");
        }

        run.delegation = Some(result);
        Ok(())
    }

    /// The local branch: plan → select tools → apply reasoning.
    async fn local_path(&self, run: &mut RunState) {
        // Stage 5: plan — recovers to an empty plan.
        let plan = match self.plan(run).await {
            Ok(plan) => {
                run.trace(format!("plan: {} step(s)", plan.steps.len()));
                plan
            }
            Err(e) => {
                warn!(run_id = %run.run_id, error = %e, "Pipeline: planning failed, continuing without a plan");
                run.record_error("plan", &e, true);
                PlanAnswer::default()
            }
        };
        run.plan = Some(plan.clone());
        self.stage_done(run, 5.0).await;

        if plan.steps.is_empty() {
            run.trace("no plan steps; skipping tool execution");
            return;
        }

        // Stage 6: select tools — recovers to an empty selection (each plan
        // step then falls back to its own id as the tool id).
        run.selected_tools = match self.select_tools(run, &plan).await {
            Ok(answer) => {
                run.trace(format!("tools: {}", answer.tools.join(", ")));
                answer.tools
            }
            Err(e) => {
                run.record_error("select_tools", &e, true);
                Vec::new()
            }
        };

        // Stage 6b: apply reasoning — build and execute the tool chain;
        // recovers by carrying partial results into synthesis.
        match self.build_chain(run, &plan) {
            Ok(chain) => {
                let initial = json!({"query": run.request.query, "entities": run.entities});
                let result = self.executor.execute(&chain, &initial).await;
                if !result.success {
                    let error = MeshError::Execution(
                        result
                            .error
                            .clone()
                            .unwrap_or_else(|| "chain execution failed".to_string()),
                    );
                    run.record_error("apply_reasoning", &error, true);
                }
                run.trace(format!(
                    "chain: {}/{} step(s) completed",
                    result.step_order.len(),
                    chain.len()
                ));
                run.chain_result = Some(result);
            }
            Err(e) => {
                warn!(run_id = %run.run_id, error = %e, "Pipeline: chain build failed, continuing without tools");
                run.record_error("apply_reasoning", &e, true);
            }
        }
    }

    async fn plan(&self, run: &RunState) -> MeshResult<PlanAnswer> {
        let raw = self
            .generate(
                "Decompose the request into tool steps. Answer as JSON: \
                 {\"steps\": [{\"id\": string, \"description\": string, \"depends_on\": [string]}]}.",
                &run.request.query,
            )
            .await?;
        PlanAnswer::parse(&raw)
    }

    async fn select_tools(&self, run: &RunState, plan: &PlanAnswer) -> MeshResult<ToolsAnswer> {
        let steps: Vec<&str> = plan.steps.iter().map(|s| s.description.as_str()).collect();
        let raw = self
            .generate(
                "Pick one tool id per step. Answer as JSON: {\"tools\": [string]}.",
                &format!("request: {}\nsteps: {}", run.request.query, steps.join("; ")),
            )
            .await?;
        ToolsAnswer::parse(&raw)
    }

    /// Turn the plan into an executable chain; the i-th selected tool serves
    /// the i-th plan step, defaulting to the step id.
    fn build_chain(&self, run: &RunState, plan: &PlanAnswer) -> MeshResult<ToolChain> {
        let steps = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let tool_id = run
                    .selected_tools
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| step.id.clone());
                ChainStep::new(step.id.clone(), tool_id)
                    .with_parameters(json!({"instruction": step.description}))
                    .depends_on(step.depends_on.iter().cloned())
                    .with_transformation("input.query", "query", None)
            })
            .collect();
        ToolChain::build(format!("run-{}", run.run_id), steps)
    }

    async fn synthesize_response(&self, run: &RunState) -> MeshResult<String> {
        let mut prompt = format!("request: {}\n", run.request.query);
        if let Some(intent) = &run.intent {
            prompt.push_str(&format!("intent: {}\n", intent.intent));
        }
        if let Some(delegation) = &run.delegation {
            prompt.push_str(&format!(
                "delegation: {} ({})\n",
                delegation.success, delegation.reason
            ));
        }
        if let Some(chain) = &run.chain_result {
            for id in &chain.step_order {
                if let Some(output) = chain.step_results.get(id) {
                    prompt.push_str(&format!("tool {id}: {output}\n"));
                }
            }
        }

        let response = self
            .generate("Compose the final answer to the request from the gathered material.", &prompt)
            .await?;
        if response.trim().is_empty() {
            return Err(MeshError::Generation("empty synthesis answer".to_string()));
        }
        Ok(response)
    }

    /// Best-effort apology string for failed runs; the caller-facing
    /// contract guarantees a response object for every run.
    fn fallback_response(&self, run: &RunState) -> String {
        let detail = run
            .errors
            .last()
            .map(|e| format!(" ({})", e.stage))
            .unwrap_or_default();
        format!(
            "I couldn't fully process this request{detail}. Partial results may be \
             available via the progress log for run {}.",
            run.run_id
        )
    }

    /// One generation call bounded by the configured timeout; exceeding it
    /// is an ordinary stage failure.
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> MeshResult<String> {
        let budget = Duration::from_millis(self.config.generation_timeout_ms);
        match timeout(budget, self.generation.generate(system_prompt, user_prompt)).await {
            Ok(result) => result,
            Err(_) => Err(MeshError::Generation(format!(
                "generation call timed out after {}ms",
                budget.as_millis()
            ))),
        }
    }
}
