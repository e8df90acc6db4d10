use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskmesh_core::{MeshError, MeshResult};
use tracing::{debug, info, warn};

/// A named rule applied to a value while it moves between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformRule {
    Uppercase,
    Lowercase,
    /// Serialize the value to its JSON string form.
    Stringify,
    /// Length of a string or array.
    Length,
    /// First element of an array or first character of a string.
    First,
}

impl TransformRule {
    fn apply(self, value: &Value) -> MeshResult<Value> {
        match self {
            TransformRule::Uppercase => match value.as_str() {
                Some(s) => Ok(Value::String(s.to_uppercase())),
                None => Err(MeshError::Execution("uppercase rule expects a string".into())),
            },
            TransformRule::Lowercase => match value.as_str() {
                Some(s) => Ok(Value::String(s.to_lowercase())),
                None => Err(MeshError::Execution("lowercase rule expects a string".into())),
            },
            TransformRule::Stringify => Ok(Value::String(value.to_string())),
            TransformRule::Length => match value {
                Value::String(s) => Ok(Value::from(s.chars().count())),
                Value::Array(items) => Ok(Value::from(items.len())),
                _ => Err(MeshError::Execution(
                    "length rule expects a string or array".into(),
                )),
            },
            TransformRule::First => match value {
                Value::String(s) => Ok(s
                    .chars()
                    .next()
                    .map(|c| Value::String(c.to_string()))
                    .unwrap_or(Value::Null)),
                Value::Array(items) => Ok(items.first().cloned().unwrap_or(Value::Null)),
                _ => Err(MeshError::Execution(
                    "first rule expects a string or array".into(),
                )),
            },
        }
    }
}

/// Moves one value into a step's parameters before it runs.
///
/// `from` is a dotted path rooted either at `input` (the chain's initial
/// parameters) or at the id of a direct or transitive dependency (that
/// step's output); `to` is a dotted path within the step's parameter map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transformation {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub rule: Option<TransformRule>,
}

/// Per-step retry behaviour: up to `max_retries` retries with exponential
/// backoff (`backoff_ms · 2^attempt`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    100
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// One tool invocation within a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStep {
    pub id: String,
    pub tool_id: String,
    /// Static parameters, merged with transformation outputs at run time.
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub depends_on: HashSet<String>,
    #[serde(default)]
    pub transformations: Vec<Transformation>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl ChainStep {
    pub fn new(id: impl Into<String>, tool_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool_id: tool_id.into(),
            parameters: Value::Object(serde_json::Map::new()),
            depends_on: HashSet::new(),
            transformations: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_transformation(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        rule: Option<TransformRule>,
    ) -> Self {
        self.transformations.push(Transformation {
            from: from.into(),
            to: to.into(),
            rule,
        });
        self
    }

    pub fn with_retry(mut self, max_retries: u32, backoff_ms: u64) -> Self {
        self.retry = RetryPolicy {
            max_retries,
            backoff_ms,
        };
        self
    }
}

/// A validated, immutable DAG of tool-invocation steps.
///
/// Built through [`ToolChain::build`], which rejects duplicate ids, dangling
/// dependency references, transformations reading outside a step's upstream
/// dependency set (every offending step reported in one error), and cycles,
/// and fixes a deterministic depth-first topological order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChain {
    pub name: String,
    steps: HashMap<String, ChainStep>,
    order: Vec<String>,
}

impl ToolChain {
    /// Validate the steps and compute the execution order.
    pub fn build(name: impl Into<String>, steps: Vec<ChainStep>) -> MeshResult<Self> {
        let name = name.into();
        let mut by_id: HashMap<String, ChainStep> = HashMap::new();
        let mut offenses = Vec::new();

        for step in steps {
            if step.id.is_empty() {
                offenses.push("step with empty id".to_string());
                continue;
            }
            let id = step.id.clone();
            if by_id.insert(id.clone(), step).is_some() {
                offenses.push(format!("duplicate step id '{id}'"));
            }
        }
        fn collect_upstream<'a>(
            deps: &'a HashSet<String>,
            steps: &'a HashMap<String, ChainStep>,
            out: &mut HashSet<&'a str>,
        ) {
            for dep in deps {
                if out.insert(dep.as_str()) {
                    if let Some(step) = steps.get(dep) {
                        collect_upstream(&step.depends_on, steps, out);
                    }
                }
            }
        }

        for step in by_id.values() {
            for dep in &step.depends_on {
                if !by_id.contains_key(dep) {
                    offenses.push(format!("step '{}' depends on unknown step '{dep}'", step.id));
                }
            }
            if step.transformations.is_empty() {
                continue;
            }
            let mut upstream = HashSet::new();
            collect_upstream(&step.depends_on, &by_id, &mut upstream);
            for t in &step.transformations {
                let root = t.from.split('.').next().unwrap_or_default();
                if root == "input" {
                    continue;
                }
                if !by_id.contains_key(root) {
                    offenses.push(format!(
                        "step '{}' transformation reads unknown source '{root}'",
                        step.id
                    ));
                } else if !upstream.contains(root) {
                    offenses.push(format!(
                        "step '{}' transformation reads '{root}' which is not among its dependencies",
                        step.id
                    ));
                }
            }
        }
        if !offenses.is_empty() {
            offenses.sort();
            return Err(MeshError::Validation(offenses.join("; ")));
        }

        let order = Self::topological_order(&by_id)?;
        Ok(Self {
            name,
            steps: by_id,
            order,
        })
    }

    /// Deterministic depth-first topological sort; detects cycles with a
    /// tri-color marking.
    fn topological_order(steps: &HashMap<String, ChainStep>) -> MeshResult<Vec<String>> {
        let mut ids: Vec<&String> = steps.keys().collect();
        ids.sort();

        let mut marks: HashMap<&str, u8> = HashMap::new();
        let mut order = Vec::with_capacity(steps.len());
        let mut stack = Vec::new();

        fn visit<'a>(
            id: &'a str,
            steps: &'a HashMap<String, ChainStep>,
            marks: &mut HashMap<&'a str, u8>,
            order: &mut Vec<String>,
            stack: &mut Vec<&'a str>,
        ) -> MeshResult<()> {
            match marks.get(id) {
                Some(1) => {
                    stack.push(id);
                    return Err(MeshError::CircularDependency(stack.join(" -> ")));
                }
                Some(2) => return Ok(()),
                _ => {}
            }
            marks.insert(id, 1);
            stack.push(id);
            if let Some(step) = steps.get(id) {
                let mut deps: Vec<&String> = step.depends_on.iter().collect();
                deps.sort();
                for dep in deps {
                    visit(dep, steps, marks, order, stack)?;
                }
            }
            stack.pop();
            marks.insert(id, 2);
            order.push(id.to_string());
            Ok(())
        }

        for id in ids {
            visit(id, steps, &mut marks, &mut order, &mut stack)?;
        }
        Ok(order)
    }

    /// Step ids in execution order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Look up one step.
    pub fn step(&self, id: &str) -> Option<&ChainStep> {
        self.steps.get(id)
    }

    /// Number of steps in the chain.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the chain has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Injected tool-invocation collaborator.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Invoke one tool with assembled parameters and return its output.
    async fn invoke(&self, tool_id: &str, parameters: &Value) -> MeshResult<Value>;
}

/// Result of one chain execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainExecutionResult {
    pub success: bool,
    /// Outputs of every step that actually ran, keyed by step id.
    pub step_results: HashMap<String, Value>,
    /// Ids of the steps that ran, in completion order.
    pub step_order: Vec<String>,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Runs a [`ToolChain`] against a [`ToolRunner`].
///
/// Ready steps whose dependencies have all completed execute as one
/// concurrent batch; each step retries per its own policy, and a step that
/// exhausts its retries halts the chain without running anything downstream.
pub struct ChainExecutor {
    runner: Arc<dyn ToolRunner>,
    step_timeout: Duration,
}

impl ChainExecutor {
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            runner,
            step_timeout: Duration::from_secs(30),
        }
    }

    /// Bound every individual tool invocation by this timeout. Exceeding it
    /// counts as an ordinary step failure subject to the retry policy.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Execute every step of the chain in dependency order.
    pub async fn execute(&self, chain: &ToolChain, initial: &Value) -> ChainExecutionResult {
        let start = Instant::now();
        let mut completed: HashMap<String, Value> = HashMap::new();
        let mut executed_order: Vec<String> = Vec::new();
        let mut remaining: Vec<&str> = chain.order().iter().map(String::as_str).collect();

        info!(chain = %chain.name, steps = chain.len(), "Chain: starting execution");

        while !remaining.is_empty() {
            let ready: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|id| {
                    chain
                        .step(id)
                        .is_some_and(|s| s.depends_on.iter().all(|d| completed.contains_key(d)))
                })
                .collect();

            // Build keeps the graph acyclic, so progress is always possible.
            if ready.is_empty() {
                return self.failure(
                    completed,
                    executed_order,
                    None,
                    "no runnable step remains".to_string(),
                    start,
                );
            }
            remaining.retain(|id| !ready.contains(id));

            let batch = ready.iter().map(|id| {
                #[allow(clippy::unwrap_used)] // ids come from chain.order()
                let step = chain.step(id).unwrap();
                self.run_step(step, initial, &completed)
            });
            let outcomes: Vec<MeshResult<Value>> = join_all(batch).await;

            let mut batch_failure: Option<(String, String)> = None;
            for (id, outcome) in ready.iter().zip(outcomes) {
                match outcome {
                    Ok(output) => {
                        completed.insert((*id).to_string(), output);
                        executed_order.push((*id).to_string());
                    }
                    Err(e) if batch_failure.is_none() => {
                        batch_failure = Some(((*id).to_string(), e.to_string()));
                    }
                    Err(_) => {}
                }
            }

            if let Some((failed_step, error)) = batch_failure {
                warn!(chain = %chain.name, step = %failed_step, error = %error, "Chain: step exhausted retries, halting");
                return self.failure(completed, executed_order, Some(failed_step), error, start);
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(chain = %chain.name, duration_ms, "Chain: execution complete");
        ChainExecutionResult {
            success: true,
            step_results: completed,
            step_order: executed_order,
            failed_step: None,
            error: None,
            duration_ms,
        }
    }

    fn failure(
        &self,
        step_results: HashMap<String, Value>,
        step_order: Vec<String>,
        failed_step: Option<String>,
        error: String,
        start: Instant,
    ) -> ChainExecutionResult {
        ChainExecutionResult {
            success: false,
            step_results,
            step_order,
            failed_step,
            error: Some(error),
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Assemble one step's parameters and invoke its tool under the retry
    /// policy.
    async fn run_step(
        &self,
        step: &ChainStep,
        initial: &Value,
        completed: &HashMap<String, Value>,
    ) -> MeshResult<Value> {
        let parameters = assemble_parameters(step, initial, completed)?;

        let mut attempt: u32 = 0;
        loop {
            let invocation = self.runner.invoke(&step.tool_id, &parameters);
            let outcome = match tokio::time::timeout(self.step_timeout, invocation).await {
                Ok(result) => result,
                Err(_) => Err(MeshError::Execution(format!(
                    "tool '{}' timed out after {}ms",
                    step.tool_id,
                    self.step_timeout.as_millis()
                ))),
            };

            match outcome {
                Ok(output) => {
                    debug!(step = %step.id, tool = %step.tool_id, attempt, "Chain: step succeeded");
                    return Ok(output);
                }
                Err(e) if attempt < step.retry.max_retries => {
                    let delay = step.retry.backoff_ms.saturating_mul(2u64.saturating_pow(attempt));
                    warn!(
                        step = %step.id,
                        tool = %step.tool_id,
                        attempt,
                        delay_ms = delay,
                        error = %e,
                        "Chain: step failed, backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Merge a step's static parameters with its transformation outputs.
fn assemble_parameters(
    step: &ChainStep,
    initial: &Value,
    completed: &HashMap<String, Value>,
) -> MeshResult<Value> {
    let mut parameters = step.parameters.clone();
    if !parameters.is_object() {
        parameters = Value::Object(serde_json::Map::new());
    }

    for t in &step.transformations {
        let (root, rest) = match t.from.split_once('.') {
            Some((root, rest)) => (root, Some(rest)),
            None => (t.from.as_str(), None),
        };
        let source = if root == "input" {
            initial
        } else {
            completed.get(root).ok_or_else(|| {
                MeshError::Execution(format!(
                    "step '{}' reads from '{root}' before it completed",
                    step.id
                ))
            })?
        };
        let value = match rest {
            Some(path) => lookup_path(source, path).ok_or_else(|| {
                MeshError::Execution(format!(
                    "step '{}' transformation path '{}' not found",
                    step.id, t.from
                ))
            })?,
            None => source,
        };
        let value = match t.rule {
            Some(rule) => rule.apply(value)?,
            None => value.clone(),
        };
        insert_path(&mut parameters, &t.to, value);
    }

    Ok(parameters)
}

/// Resolve a dotted path inside a JSON value. Array elements are addressed
/// by numeric segments.
fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write a value at a dotted path, creating intermediate objects.
fn insert_path(root: &mut Value, path: &str, value: Value) {
    let mut current = root;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        #[allow(clippy::unwrap_used)] // objectness established above
        let map = current.as_object_mut().unwrap();
        if i == segments.len() - 1 {
            map.insert((*segment).to_string(), value);
            return;
        }
        current = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}
