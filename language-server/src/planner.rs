use crate::config::PlannerSettings;
use crate::error::PlanningError;
use crate::plan::{parse_plan, PlanStep, DOMAIN_META, PROBLEM_META};
use crate::text::Document;
use crate::validation::{expand_command, write_temp, HTTP_AGENT};
use serde::Deserialize;
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Notify;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanningRequest {
    pub domain: String,
    pub problem: String,
}

#[derive(Debug, Clone, Default)]
pub struct PlanningOutcome {
    pub steps: Vec<PlanStep>,
    /// Whatever the planner printed besides the plan.
    pub output: String,
}

impl PlanningOutcome {
    pub fn makespan(&self) -> f64 {
        self.steps
            .iter()
            .map(PlanStep::end_time)
            .fold(0.0, f64::max)
    }

    /// The plan in `.plan` file syntax, with meta lines binding it to its
    /// domain and problem.
    pub fn render(&self, domain_name: &str, problem_name: &str) -> String {
        let mut text = format!("{} {}\n{} {}\n\n", DOMAIN_META, domain_name, PROBLEM_META, problem_name);
        for step in &self.steps {
            text.push_str(&format!("{:.3}: ({})", step.time, step.full_action_name()));
            if let Some(duration) = step.duration {
                text.push_str(&format!(" [{:.3}]", duration));
            }
            text.push('\n');
        }
        text
    }
}

#[tower_lsp::async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &PlanningRequest) -> Result<PlanningOutcome, PlanningError>;

    /// Stops a running `plan` call, which then returns
    /// `PlanningError::Cancelled`.
    fn cancel(&self);
}

pub fn planner_from_settings(settings: &PlannerSettings, epsilon: f64) -> Option<Arc<dyn Planner>> {
    let configured = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    if let Some(command) = configured(&settings.executable) {
        return Some(Arc::new(ExecutablePlanner::new(command, epsilon)));
    }
    let url = configured(&settings.url)?;
    if settings.asynchronous {
        Some(Arc::new(AsyncServicePlanner::new(url, settings.timeout_secs, epsilon)))
    } else {
        Some(Arc::new(SyncServicePlanner::new(url, settings.timeout_secs, epsilon)))
    }
}

/// Killed-state of the current run.
#[derive(Debug, Default)]
struct CancelState {
    killed: AtomicBool,
    notify: Notify,
}

impl CancelState {
    fn reset(&self) {
        self.killed.store(false, Ordering::SeqCst);
    }

    fn cancel(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

/// Runs a local planner on temp copies of the domain and problem and reads
/// the plan from its standard output.
#[derive(Debug)]
pub struct ExecutablePlanner {
    command: String,
    epsilon: f64,
    state: CancelState,
}

impl ExecutablePlanner {
    pub fn new(command: impl Into<String>, epsilon: f64) -> Self {
        Self {
            command: command.into(),
            epsilon,
            state: CancelState::default(),
        }
    }
}

#[tower_lsp::async_trait]
impl Planner for ExecutablePlanner {
    async fn plan(&self, request: &PlanningRequest) -> Result<PlanningOutcome, PlanningError> {
        self.state.reset();
        let domain_file = write_temp("domain", &request.domain)?;
        let problem_file = write_temp("problem", &request.problem)?;
        let domain_path = domain_file.path().to_string_lossy().into_owned();
        let problem_path = problem_file.path().to_string_lossy().into_owned();
        let args = expand_command(&self.command, &domain_path, Some(&problem_path));
        let Some((program, rest)) = args.split_first() else {
            return Err(PlanningError::NotConfigured);
        };

        tracing::info!("Starting planner: {}", args.join(" "));
        let mut command = Command::new(program);
        command
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        let child = command.spawn().map_err(|source| PlanningError::Spawn {
            command: self.command.clone(),
            source,
        })?;
        let group = child.id();

        let cancelled = self.state.notify.notified();
        if self.state.is_killed() {
            kill_process_group(group).await;
            return Err(PlanningError::Cancelled);
        }
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = cancelled => {
                tracing::info!("Planner stopped by user");
                kill_process_group(group).await;
                return Err(PlanningError::Cancelled);
            }
        };

        if self.state.is_killed() {
            return Err(PlanningError::Cancelled);
        }
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(PlanningError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let mut ignored = Vec::new();
        let plan = parse_plan(&Document::new(stdout.as_str()), self.epsilon, &mut ignored);
        tracing::info!("Planner returned {} step(s)", plan.steps.len());
        Ok(PlanningOutcome {
            steps: plan.steps,
            output: stdout,
        })
    }

    fn cancel(&self) {
        self.state.cancel();
    }
}

/// Planners are often wrapper scripts; stopping one means stopping
/// everything it started, not only the direct child.
#[cfg(unix)]
async fn kill_process_group(group: Option<u32>) {
    let Some(group) = group else {
        return;
    };
    let target = format!("-{}", group);
    let status = Command::new("kill")
        .args(["-s", "KILL", "--", target.as_str()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(err) = status {
        tracing::warn!("Could not stop planner process group {}: {}", group, err);
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_group: Option<u32>) {}

#[derive(Debug, Deserialize)]
struct ServicePlanStep {
    name: String,
    time: Option<f64>,
    duration: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceResult {
    #[serde(default)]
    plan: Vec<ServicePlanStep>,
    output: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServiceResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    result: Value,
}

fn to_plan_steps(steps: Vec<ServicePlanStep>, epsilon: f64) -> Vec<PlanStep> {
    let mut previous_end: Option<f64> = None;
    let mut converted = Vec::with_capacity(steps.len());
    for (index, step) in steps.into_iter().enumerate() {
        let body = step.name.trim().trim_start_matches('(').trim_end_matches(')');
        let mut words = body.split_whitespace().map(str::to_string);
        let Some(action_name) = words.next() else {
            continue;
        };
        let time = step
            .time
            .unwrap_or_else(|| previous_end.map(|end| end + epsilon).unwrap_or(0.0));
        let plan_step = PlanStep {
            time,
            action_name,
            parameters: words.collect(),
            duration: step.duration,
            line: index as u32,
        };
        previous_end = Some(plan_step.end_time());
        converted.push(plan_step);
    }
    converted
}

fn outcome_from(response: ServiceResponse, epsilon: f64) -> Result<PlanningOutcome, PlanningError> {
    let result: ServiceResult = match &response.result {
        Value::Object(_) => serde_json::from_value(response.result.clone())
            .map_err(|err| PlanningError::InvalidResponse(err.to_string()))?,
        _ => ServiceResult::default(),
    };
    if !response.status.eq_ignore_ascii_case("ok") {
        let detail = result
            .error
            .or(result.output)
            .or_else(|| response.result.as_str().map(str::to_string))
            .unwrap_or_default();
        return Err(PlanningError::Failed {
            status: response.status,
            stderr: detail,
        });
    }
    Ok(PlanningOutcome {
        steps: to_plan_steps(result.plan, epsilon),
        output: result.output.unwrap_or_default(),
    })
}

async fn call_service(
    method: &'static str,
    url: String,
    body: Option<Value>,
    timeout: Duration,
) -> Result<ServiceResponse, PlanningError> {
    tokio::task::spawn_blocking(move || {
        let http_error = |message: String| PlanningError::Http {
            url: url.clone(),
            message,
        };
        let request = HTTP_AGENT.request(method, &url).timeout(timeout);
        let response = match body {
            Some(body) => request.send_json(body),
            None => request.call(),
        }
        .map_err(|err| http_error(err.to_string()))?;
        let text = response.into_string().map_err(|err| http_error(err.to_string()))?;
        serde_json::from_str(&text).map_err(|err| PlanningError::InvalidResponse(err.to_string()))
    })
    .await?
}

fn service_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn request_body(request: &PlanningRequest) -> Value {
    json!({ "domain": request.domain, "problem": request.problem })
}

/// `POST <url>/solve`, answered with the plan in the same response.
#[derive(Debug)]
pub struct SyncServicePlanner {
    url: String,
    timeout: Duration,
    epsilon: f64,
    state: CancelState,
}

impl SyncServicePlanner {
    pub fn new(url: impl Into<String>, timeout_secs: u64, epsilon: f64) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(timeout_secs),
            epsilon,
            state: CancelState::default(),
        }
    }
}

#[tower_lsp::async_trait]
impl Planner for SyncServicePlanner {
    async fn plan(&self, request: &PlanningRequest) -> Result<PlanningOutcome, PlanningError> {
        self.state.reset();
        let url = service_url(&self.url, "solve");
        tracing::info!("Requesting plan from {}", url);
        let response = call_service("POST", url, Some(request_body(request)), self.timeout).await?;
        if self.state.is_killed() {
            return Err(PlanningError::Cancelled);
        }
        outcome_from(response, self.epsilon)
    }

    fn cancel(&self) {
        self.state.cancel();
    }
}

/// `POST <url>/request` returns a check URL that is polled until the job
/// leaves the `PENDING` state.
#[derive(Debug)]
pub struct AsyncServicePlanner {
    url: String,
    timeout: Duration,
    epsilon: f64,
    state: CancelState,
}

impl AsyncServicePlanner {
    pub fn new(url: impl Into<String>, timeout_secs: u64, epsilon: f64) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(timeout_secs),
            epsilon,
            state: CancelState::default(),
        }
    }
}

#[tower_lsp::async_trait]
impl Planner for AsyncServicePlanner {
    async fn plan(&self, request: &PlanningRequest) -> Result<PlanningOutcome, PlanningError> {
        self.state.reset();
        let started = Instant::now();
        let submit_url = service_url(&self.url, "request");
        tracing::info!("Submitting planning job to {}", submit_url);
        let submitted =
            call_service("POST", submit_url, Some(request_body(request)), self.timeout).await?;
        let Some(check) = submitted.result.as_str() else {
            return Err(PlanningError::InvalidResponse(format!(
                "expected a check URL, got {}",
                submitted.result
            )));
        };
        let check_url = service_url(&self.url, check);

        loop {
            if self.state.is_killed() {
                return Err(PlanningError::Cancelled);
            }
            if started.elapsed() >= self.timeout {
                return Err(PlanningError::Timeout(self.timeout.as_secs()));
            }
            let response = call_service("GET", check_url.clone(), None, self.timeout).await?;
            if !response.status.eq_ignore_ascii_case("pending") {
                if self.state.is_killed() {
                    return Err(PlanningError::Cancelled);
                }
                return outcome_from(response, self.epsilon);
            }
            tracing::debug!("Planning job at {} still pending", check_url);
            let cancelled = self.state.notify.notified();
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancelled => return Err(PlanningError::Cancelled),
            }
        }
    }

    fn cancel(&self) {
        self.state.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PlanningRequest {
        PlanningRequest {
            domain: "(define (domain d))".to_string(),
            problem: "(define (problem p) (:domain d))".to_string(),
        }
    }

    fn response(value: Value) -> ServiceResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn reads_service_plans() {
        let outcome = outcome_from(
            response(json!({
                "status": "ok",
                "result": {
                    "plan": [
                        { "name": "(drive t1 a b)", "duration": 2.0 },
                        { "name": "(unload t1 b)" },
                        { "name": "(fly p1 b c)", "time": 10.0, "duration": 1.5 }
                    ],
                    "output": "found plan"
                }
            })),
            0.001,
        )
        .unwrap();
        assert_eq!(outcome.steps.len(), 3);
        assert_eq!(outcome.steps[0].time, 0.0);
        assert_eq!(outcome.steps[0].parameters, vec!["t1", "a", "b"]);
        assert!((outcome.steps[1].time - 2.001).abs() < 1e-9);
        assert_eq!(outcome.steps[2].full_action_name(), "fly p1 b c");
        assert_eq!(outcome.makespan(), 11.5);
        assert_eq!(outcome.output, "found plan");
    }

    #[test]
    fn service_failure_carries_detail() {
        let err = outcome_from(
            response(json!({ "status": "error", "result": { "error": "unsolvable" } })),
            0.001,
        )
        .unwrap_err();
        match err {
            PlanningError::Failed { status, stderr } => {
                assert_eq!(status, "error");
                assert_eq!(stderr, "unsolvable");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn joins_service_urls() {
        assert_eq!(service_url("http://solver/", "solve"), "http://solver/solve");
        assert_eq!(service_url("http://solver", "/check/42"), "http://solver/check/42");
        assert_eq!(service_url("http://solver", "https://other/check/1"), "https://other/check/1");
    }

    #[test]
    fn renders_plan_files() {
        let outcome = outcome_from(
            response(json!({
                "status": "ok",
                "result": { "plan": [{ "name": "(drive t1 a b)", "time": 0.0, "duration": 2.0 }] }
            })),
            0.001,
        )
        .unwrap();
        assert_eq!(
            outcome.render("d", "p"),
            ";;!domain: d\n;;!problem: p\n\n0.000: (drive t1 a b) [2.000]\n"
        );
    }

    #[test]
    fn selects_planner_from_settings() {
        assert!(planner_from_settings(&PlannerSettings::default(), 0.001).is_none());
        let settings = PlannerSettings {
            url: Some("http://solver".to_string()),
            asynchronous: true,
            ..PlannerSettings::default()
        };
        assert!(planner_from_settings(&settings, 0.001).is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reads_plan_from_executable_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("plan.sh");
        std::fs::write(
            &script,
            "test -f \"$1\" || exit 2\necho '; searching'\necho '0.000: (drive t1 a b) [2.000]'\necho '2.001: (unload t1 b) [1.000]'\n",
        )
        .unwrap();
        let planner = ExecutablePlanner::new(format!("sh {} $(domain) $(problem)", script.display()), 0.001);
        let outcome = planner.plan(&request()).await.unwrap();
        assert_eq!(outcome.steps.len(), 2);
        assert_eq!(outcome.steps[1].action_name, "unload");
        assert!((outcome.makespan() - 3.001).abs() < 1e-9);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reports_planner_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fail.sh");
        std::fs::write(&script, "echo 'no solution' >&2\nexit 3\n").unwrap();
        let planner = ExecutablePlanner::new(format!("sh {}", script.display()), 0.001);
        match planner.plan(&request()).await.unwrap_err() {
            PlanningError::Failed { stderr, .. } => assert_eq!(stderr, "no solution"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_is_not_a_failure() {
        let planner = Arc::new(ExecutablePlanner::new("sleep 5", 0.001));
        let running = Arc::clone(&planner);
        let handle = tokio::spawn(async move { running.plan(&request()).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        planner.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(PlanningError::Cancelled)));
    }

    #[cfg(target_os = "linux")]
    fn is_running(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| !rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn cancel_stops_processes_started_by_the_planner() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("child.pid");
        let script = dir.path().join("planner.sh");
        std::fs::write(
            &script,
            format!("sleep 30 &\necho $! > {}\nwait\n", pid_file.display()),
        )
        .unwrap();
        let planner = Arc::new(ExecutablePlanner::new(
            format!("sh {}", script.display()),
            0.001,
        ));
        let running = Arc::clone(&planner);
        let handle = tokio::spawn(async move { running.plan(&request()).await });

        let mut pid = String::new();
        for _ in 0..40 {
            if let Ok(text) = std::fs::read_to_string(&pid_file) {
                if !text.trim().is_empty() {
                    pid = text.trim().to_string();
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!pid.is_empty());
        assert!(is_running(&pid));

        planner.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(PlanningError::Cancelled)));

        for _ in 0..20 {
            if !is_running(&pid) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!is_running(&pid));
    }
}
