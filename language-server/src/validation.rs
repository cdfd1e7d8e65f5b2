use crate::analysis::to_diagnostic;
use crate::config::{Settings, ValidatorSettings, DEFAULT_VALIDATOR_PATTERN};
use crate::error::ValidationError;
use crate::file_info::{FileKind, FileStatus};
use crate::scheduler::{Debouncer, SchedulerState};
use crate::text::Document;
use crate::workspace::{SharedWorkspace, Workspace};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tower_lsp::lsp_types::{Diagnostic, DiagnosticSeverity, Position, Range, Url};

/// Shared connection pool for the validation and planning services.
pub(crate) static HTTP_AGENT: Lazy<Arc<ureq::Agent>> =
    Lazy::new(|| Arc::new(ureq::AgentBuilder::new().build()));

/// Validator diagnostics keyed by file. Every file of the bundle has an
/// entry, so files that came back clean clear their previous results.
pub type ValidationReport = BTreeMap<Url, Vec<Diagnostic>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationInput {
    pub uri: Url,
    pub text: String,
}

/// A domain together with every problem bound to it.
#[derive(Debug, Clone)]
pub struct ValidationBundle {
    pub domain: ValidationInput,
    pub problems: Vec<ValidationInput>,
}

impl ValidationBundle {
    pub fn inputs(&self) -> impl Iterator<Item = &ValidationInput> {
        std::iter::once(&self.domain).chain(self.problems.iter())
    }

    fn empty_report(&self) -> ValidationReport {
        self.inputs()
            .map(|input| (input.uri.clone(), Vec::new()))
            .collect()
    }
}

#[tower_lsp::async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, bundle: &ValidationBundle) -> Result<ValidationReport, ValidationError>;
}

/// Where validation results and failures go.
#[tower_lsp::async_trait]
pub trait DiagnosticsSink: Send + Sync {
    async fn publish(&self, report: ValidationReport);
    async fn report_failure(&self, domain: &Url, error: ValidationError);
}

/// Picks the validator the settings describe; a local executable wins over
/// a service URL.
pub fn validator_from_settings(
    settings: &ValidatorSettings,
) -> Result<Option<Arc<dyn Validator>>, ValidationError> {
    let configured = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    if let Some(command) = configured(&settings.executable) {
        let validator = ExecutableValidator::new(command, &settings.patterns, settings.timeout_secs)?;
        return Ok(Some(Arc::new(validator)));
    }
    if let Some(url) = configured(&settings.url) {
        return Ok(Some(Arc::new(ServiceValidator::new(url, settings.timeout_secs))));
    }
    Ok(None)
}

fn parse_severity(value: Option<&str>) -> DiagnosticSeverity {
    let value = value.unwrap_or_default().trim().to_ascii_lowercase();
    match value.trim_end_matches('s') {
        "warning" => DiagnosticSeverity::WARNING,
        "information" | "info" => DiagnosticSeverity::INFORMATION,
        "hint" => DiagnosticSeverity::HINT,
        _ => DiagnosticSeverity::ERROR,
    }
}

/// The whole line, or from `column` to the end of the line.
fn line_range(document: &Document, line: u32, column: Option<u32>) -> Range {
    let whole = document
        .line_span(line as usize)
        .map(|span| document.range_of(span))
        .unwrap_or_else(|| Range::new(Position::new(line, 0), Position::new(line, 0)));
    match column {
        Some(character) => {
            let start = Position::new(line, character);
            let end = if whole.end.character > character {
                whole.end
            } else {
                start
            };
            Range::new(start, end)
        }
        None => whole,
    }
}

fn push_unique(report: &mut ValidationReport, uri: Url, diagnostic: Diagnostic) {
    let entries = report.entry(uri).or_default();
    let duplicate = entries
        .iter()
        .any(|existing| existing.range == diagnostic.range && existing.message == diagnostic.message);
    if !duplicate {
        entries.push(diagnostic);
    }
}

/// A file handed to the validator executable.
struct Target {
    path: String,
    uri: Url,
    document: Document,
}

impl Target {
    fn new(path: &Path, input: &ValidationInput) -> Self {
        Self {
            path: path.to_string_lossy().into_owned(),
            uri: input.uri.clone(),
            document: Document::new(input.text.clone()),
        }
    }
}

fn find_target<'a>(targets: &'a [Target], file: &str) -> Option<&'a Target> {
    let file = file.trim();
    targets.iter().find(|target| target.path == file).or_else(|| {
        let name = Path::new(file).file_name()?;
        targets
            .iter()
            .find(|target| Path::new(&target.path).file_name() == Some(name))
    })
}

/// Turns validator output into diagnostics. Lines reported without a
/// recognisable file go to `targets[fallback]`.
fn scrape_output(
    output: &str,
    patterns: &[Regex],
    targets: &[Target],
    fallback: usize,
) -> Vec<(Url, Diagnostic)> {
    let mut found = Vec::new();
    for pattern in patterns {
        for caps in pattern.captures_iter(output) {
            let target = caps
                .name("file")
                .and_then(|file| find_target(targets, file.as_str()))
                .or_else(|| targets.get(fallback));
            let Some(target) = target else {
                continue;
            };
            let line = caps
                .name("line")
                .and_then(|line| line.as_str().parse::<u32>().ok())
                .map(|line| line.saturating_sub(1))
                .unwrap_or(0);
            let column = caps
                .name("column")
                .and_then(|column| column.as_str().parse::<u32>().ok())
                .map(|column| column.saturating_sub(1));
            let message = caps
                .name("message")
                .map(|message| message.as_str().trim().to_string())
                .unwrap_or_else(|| caps[0].trim().to_string());
            let severity = parse_severity(caps.name("severity").map(|severity| severity.as_str()));
            found.push((
                target.uri.clone(),
                to_diagnostic(line_range(&target.document, line, column), severity, message),
            ));
        }
    }
    found
}

/// Splits the command template on whitespace and fills in the file paths.
/// Arguments mentioning `$(problem)` are dropped when there is no problem.
pub(crate) fn expand_command(template: &str, domain: &str, problem: Option<&str>) -> Vec<String> {
    template
        .split_whitespace()
        .filter_map(|part| {
            if part.contains("$(problem)") {
                problem.map(|problem| part.replace("$(problem)", problem))
            } else {
                Some(part.to_string())
            }
        })
        .map(|part| part.replace("$(domain)", domain))
        .collect()
}

pub(crate) fn write_temp(prefix: &str, text: &str) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".pddl")
        .tempfile()?;
    file.write_all(text.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Runs a local validator once per problem on temp copies of the files.
#[derive(Debug)]
pub struct ExecutableValidator {
    command: String,
    patterns: Vec<Regex>,
    timeout: Duration,
}

impl ExecutableValidator {
    pub fn new(
        command: impl Into<String>,
        patterns: &[String],
        timeout_secs: u64,
    ) -> Result<Self, ValidationError> {
        let default_pattern = [DEFAULT_VALIDATOR_PATTERN.to_string()];
        let sources = if patterns.is_empty() {
            &default_pattern[..]
        } else {
            patterns
        };
        let patterns = sources
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ValidationError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            command: command.into(),
            patterns,
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    async fn run(&self, args: &[String]) -> Result<String, ValidationError> {
        let Some((program, rest)) = args.split_first() else {
            return Err(ValidationError::NotConfigured);
        };
        tracing::debug!("Running validator: {}", args.join(" "));
        let child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ValidationError::Spawn {
                command: self.command.clone(),
                source,
            })?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ValidationError::Timeout(self.timeout.as_secs()))??;
        if !output.status.success() {
            tracing::debug!("Validator exited with {}", output.status);
        }
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push('\n');
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }
}

#[tower_lsp::async_trait]
impl Validator for ExecutableValidator {
    async fn validate(&self, bundle: &ValidationBundle) -> Result<ValidationReport, ValidationError> {
        let domain_file = write_temp("domain", &bundle.domain.text)?;
        let mut targets = vec![Target::new(domain_file.path(), &bundle.domain)];
        let mut problem_files = Vec::with_capacity(bundle.problems.len());
        for problem in &bundle.problems {
            let file = write_temp("problem", &problem.text)?;
            targets.push(Target::new(file.path(), problem));
            problem_files.push(file);
        }

        let runs: Vec<Option<usize>> = if bundle.problems.is_empty() {
            vec![None]
        } else {
            (1..targets.len()).map(Some).collect()
        };
        let mut report = bundle.empty_report();
        for problem in runs {
            let args = expand_command(
                &self.command,
                &targets[0].path,
                problem.map(|index| targets[index].path.as_str()),
            );
            let output = self.run(&args).await?;
            for (uri, diagnostic) in scrape_output(&output, &self.patterns, &targets, problem.unwrap_or(0)) {
                push_unique(&mut report, uri, diagnostic);
            }
        }
        tracing::debug!(
            "Validated {} with {} problem file(s)",
            bundle.domain.uri,
            problem_files.len()
        );
        Ok(report)
    }
}

#[derive(Debug, Serialize)]
struct ServiceRequest {
    domain: String,
    problems: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ServicePosition {
    line: u32,
    #[serde(default, alias = "column")]
    character: u32,
}

#[derive(Debug, Deserialize)]
struct ServiceIssue {
    #[serde(default)]
    location: String,
    #[serde(default)]
    severity: String,
    position: Option<ServicePosition>,
    message: String,
}

/// Index into `bundle.inputs()`: `DOMAIN` is the domain, anything else a
/// problem numbered by its trailing digits.
fn issue_target(location: &str, problem_count: usize) -> usize {
    let location = location.trim();
    if problem_count == 0 || location.eq_ignore_ascii_case("domain") {
        return 0;
    }
    let digits_start = location.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let index = location[digits_start..].parse::<usize>().unwrap_or(0);
    if index < problem_count {
        index + 1
    } else {
        1
    }
}

fn map_service_issues(bundle: &ValidationBundle, issues: Vec<ServiceIssue>) -> ValidationReport {
    let inputs: Vec<&ValidationInput> = bundle.inputs().collect();
    let documents: Vec<Document> = inputs
        .iter()
        .map(|input| Document::new(input.text.clone()))
        .collect();
    let mut report = bundle.empty_report();
    for issue in issues {
        let index = issue_target(&issue.location, bundle.problems.len());
        let range = issue
            .position
            .map(|position| line_range(&documents[index], position.line, Some(position.character)))
            .unwrap_or_default();
        let diagnostic = to_diagnostic(
            range,
            parse_severity(Some(&issue.severity)),
            issue.message.trim().to_string(),
        );
        push_unique(&mut report, inputs[index].uri.clone(), diagnostic);
    }
    report
}

/// Posts `{domain, problems}` to a validation service.
#[derive(Debug, Clone)]
pub struct ServiceValidator {
    url: String,
    timeout: Duration,
}

impl ServiceValidator {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[tower_lsp::async_trait]
impl Validator for ServiceValidator {
    async fn validate(&self, bundle: &ValidationBundle) -> Result<ValidationReport, ValidationError> {
        let request = ServiceRequest {
            domain: bundle.domain.text.clone(),
            problems: bundle.problems.iter().map(|problem| problem.text.clone()).collect(),
        };
        let url = self.url.clone();
        let timeout = self.timeout;
        tracing::debug!("Posting {} problem(s) to {}", request.problems.len(), url);
        let body = tokio::task::spawn_blocking(move || -> Result<String, ValidationError> {
            let http_error = |message: String| ValidationError::Http {
                url: url.clone(),
                message,
            };
            let response = HTTP_AGENT
                .post(&url)
                .timeout(timeout)
                .send_json(&request)
                .map_err(|err| http_error(err.to_string()))?;
            response.into_string().map_err(|err| http_error(err.to_string()))
        })
        .await??;
        let issues: Vec<ServiceIssue> = serde_json::from_str(&body)?;
        Ok(map_service_issues(bundle, issues))
    }
}

/// The domain whose bundle a change to `uri` affects.
fn bundle_domain(workspace: &Workspace, uri: &Url) -> Option<Url> {
    let info = workspace.get_file_info(uri)?;
    match info.kind {
        FileKind::Domain(_) => Some(uri.clone()),
        FileKind::Problem(_) => workspace
            .get_domain_file_for(uri)
            .map(|domain| domain.uri.clone()),
        _ => None,
    }
}

fn collect_bundle(workspace: &Workspace, domain_uri: &Url) -> Option<ValidationBundle> {
    let domain = workspace.get_file_info(domain_uri).filter(|info| info.is_domain())?;
    let problems = workspace
        .get_problem_files(domain_uri)
        .into_iter()
        .map(|info| ValidationInput {
            uri: info.uri.clone(),
            text: info
                .as_problem()
                .and_then(|problem| problem.preprocessed_text.clone())
                .unwrap_or_else(|| info.text().to_string()),
        })
        .collect();
    Some(ValidationBundle {
        domain: ValidationInput {
            uri: domain.uri.clone(),
            text: domain.text().to_string(),
        },
        problems,
    })
}

/// Moves bundle files from `from` to `to`; files edited in the meantime
/// keep their status.
fn transition(workspace: &SharedWorkspace, bundle: &ValidationBundle, from: FileStatus, to: FileStatus) {
    let mut workspace = workspace.write();
    for input in bundle.inputs() {
        let current = workspace.get_file_info(&input.uri).map(|info| info.status);
        if current == Some(from) {
            workspace.set_status(&input.uri, to);
        }
    }
}

/// Debounced validation of domain bundles, separate from the re-parse
/// timer.
#[derive(Clone)]
pub struct ValidationScheduler {
    workspace: SharedWorkspace,
    validator: Arc<RwLock<Option<Arc<dyn Validator>>>>,
    sink: Arc<dyn DiagnosticsSink>,
    debouncer: Debouncer,
    pending: Arc<Mutex<BTreeSet<Url>>>,
}

impl ValidationScheduler {
    pub fn new(workspace: SharedWorkspace, sink: Arc<dyn DiagnosticsSink>, settings: &Settings) -> Self {
        let scheduler = Self {
            workspace,
            validator: Arc::new(RwLock::new(None)),
            sink,
            debouncer: Debouncer::new(Duration::from_millis(settings.validation_debounce_ms)),
            pending: Arc::new(Mutex::new(BTreeSet::new())),
        };
        scheduler.apply_settings(settings);
        scheduler
    }

    pub fn apply_settings(&self, settings: &Settings) {
        self.debouncer
            .set_delay(Duration::from_millis(settings.validation_debounce_ms));
        let validator = match validator_from_settings(&settings.validator) {
            Ok(validator) => validator,
            Err(err) => {
                tracing::warn!("Validator disabled: {}", err);
                None
            }
        };
        self.set_validator(validator);
    }

    pub fn set_validator(&self, validator: Option<Arc<dyn Validator>>) {
        *self.validator.write() = validator;
    }

    pub fn is_configured(&self) -> bool {
        self.validator.read().is_some()
    }

    pub fn state(&self) -> SchedulerState {
        self.debouncer.state()
    }

    /// Queues the bundle `uri` belongs to and restarts the validation timer.
    pub fn schedule(&self, uri: &Url) {
        if !self.is_configured() {
            return;
        }
        let domain = {
            let workspace = self.workspace.read();
            bundle_domain(&workspace, uri)
        };
        let Some(domain) = domain else {
            return;
        };
        self.pending.lock().insert(domain);
        let scheduler = self.clone();
        self.debouncer.schedule(move || async move {
            scheduler.run_pending().await;
        });
    }

    async fn run_pending(&self) {
        let domains = std::mem::take(&mut *self.pending.lock());
        for domain in domains {
            if let Err(err) = self.validate_domain(&domain).await {
                tracing::error!("Validation of {} failed: {}", domain, err);
                self.sink.report_failure(&domain, err).await;
            }
        }
    }

    /// Validates the bundle of `uri` right away.
    pub async fn validate_now(&self, uri: &Url) -> Result<(), ValidationError> {
        let domain = {
            let workspace = self.workspace.read();
            bundle_domain(&workspace, uri)
        };
        match domain {
            Some(domain) => {
                self.pending.lock().remove(&domain);
                self.validate_domain(&domain).await
            }
            None => {
                tracing::info!("{} is not part of a domain bundle", uri);
                Ok(())
            }
        }
    }

    async fn validate_domain(&self, domain: &Url) -> Result<(), ValidationError> {
        let validator = { self.validator.read().clone() };
        let Some(validator) = validator else {
            return Err(ValidationError::NotConfigured);
        };
        let bundle = {
            let workspace = self.workspace.read();
            collect_bundle(&workspace, domain)
        };
        let Some(bundle) = bundle else {
            return Ok(());
        };

        transition(&self.workspace, &bundle, FileStatus::Parsed, FileStatus::Validating);
        let result = validator.validate(&bundle).await;
        let next = if result.is_ok() {
            FileStatus::Validated
        } else {
            FileStatus::Parsed
        };
        transition(&self.workspace, &bundle, FileStatus::Validating, next);

        let report = result?;
        tracing::info!(
            "Validator reported {} diagnostic(s) for {}",
            report.values().map(Vec::len).sum::<usize>(),
            domain
        );
        self.sink.publish(report).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DOMAIN: &str = "(define (domain d)\n  (:predicates (at ?x))\n  (:action go :effect (at ?x)))";
    const PROBLEM: &str = "(define (problem p) (:domain d)\n  (:init (at a)))";

    fn uri(name: &str) -> Url {
        Url::parse(&format!("file:///w/{}", name)).unwrap()
    }

    fn bundle() -> ValidationBundle {
        ValidationBundle {
            domain: ValidationInput {
                uri: uri("domain.pddl"),
                text: DOMAIN.to_string(),
            },
            problems: vec![ValidationInput {
                uri: uri("p.pddl"),
                text: PROBLEM.to_string(),
            }],
        }
    }

    #[test]
    fn expands_placeholders() {
        assert_eq!(
            expand_command("validate -v $(domain) $(problem)", "/t/d.pddl", Some("/t/p.pddl")),
            vec!["validate", "-v", "/t/d.pddl", "/t/p.pddl"]
        );
        assert_eq!(
            expand_command("parser $(domain) $(problem)", "/t/d.pddl", None),
            vec!["parser", "/t/d.pddl"]
        );
    }

    #[test]
    fn scrapes_default_pattern() {
        let bundle = bundle();
        let targets = vec![
            Target::new(Path::new("/tmp/domainX.pddl"), &bundle.domain),
            Target::new(Path::new("/tmp/problemY.pddl"), &bundle.problems[0]),
        ];
        let patterns = vec![Regex::new(DEFAULT_VALIDATOR_PATTERN).unwrap()];
        let output = "Checking...\n/tmp/domainX.pddl: line: 3: Error: Undefined variable\nproblemY.pddl: line: 2: Warning: Unused object\n";
        let found = scrape_output(output, &patterns, &targets, 1);
        assert_eq!(found.len(), 2);

        assert_eq!(found[0].0, uri("domain.pddl"));
        assert_eq!(found[0].1.range.start, Position::new(2, 0));
        assert_eq!(found[0].1.severity, Some(DiagnosticSeverity::ERROR));
        assert_eq!(found[0].1.message, "Undefined variable");

        assert_eq!(found[1].0, uri("p.pddl"));
        assert_eq!(found[1].1.range.start, Position::new(1, 0));
        assert_eq!(found[1].1.severity, Some(DiagnosticSeverity::WARNING));
    }

    #[test]
    fn custom_pattern_without_file_uses_fallback() {
        let bundle = bundle();
        let targets = vec![
            Target::new(Path::new("/tmp/d.pddl"), &bundle.domain),
            Target::new(Path::new("/tmp/p.pddl"), &bundle.problems[0]),
        ];
        let patterns = vec![Regex::new(r"(?m)^(?P<line>\d+):(?P<column>\d+) (?P<message>.+)$").unwrap()];
        let found = scrape_output("2:3 goal unreachable", &patterns, &targets, 1);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, uri("p.pddl"));
        assert_eq!(found[0].1.range.start, Position::new(1, 2));
        assert_eq!(found[0].1.range.end, Position::new(1, 17));
        assert_eq!(found[0].1.severity, Some(DiagnosticSeverity::ERROR));
    }

    #[test]
    fn rejects_invalid_patterns() {
        let err = ExecutableValidator::new("validate", &["(".to_string()], 5).unwrap_err();
        assert!(matches!(err, ValidationError::Pattern { .. }));
    }

    #[test]
    fn maps_service_locations() {
        assert_eq!(issue_target("DOMAIN", 2), 0);
        assert_eq!(issue_target("PROBLEM1", 2), 2);
        assert_eq!(issue_target("PROBLEM", 2), 1);
        assert_eq!(issue_target("PROBLEM7", 2), 1);
        assert_eq!(issue_target("PROBLEM0", 0), 0);

        let issues: Vec<ServiceIssue> = serde_json::from_str(
            r#"[
                {"location": "DOMAIN", "severity": "warning", "position": {"line": 1, "character": 2}, "message": "unused"},
                {"location": "PROBLEM0", "severity": "error", "message": "bad goal"},
                {"location": "DOMAIN", "severity": "warning", "position": {"line": 1, "character": 2}, "message": "unused"}
            ]"#,
        )
        .unwrap();
        let report = map_service_issues(&bundle(), issues);
        assert_eq!(report.len(), 2);
        let domain = &report[&uri("domain.pddl")];
        assert_eq!(domain.len(), 1);
        assert_eq!(domain[0].range.start, Position::new(1, 2));
        assert_eq!(domain[0].severity, Some(DiagnosticSeverity::WARNING));
        assert_eq!(report[&uri("p.pddl")][0].message, "bad goal");
    }

    #[test]
    fn settings_select_validator() {
        assert!(validator_from_settings(&ValidatorSettings::default())
            .unwrap()
            .is_none());
        let settings = ValidatorSettings {
            url: Some("http://localhost:8080/validate".to_string()),
            ..ValidatorSettings::default()
        };
        assert!(validator_from_settings(&settings).unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_validator_executable_per_problem() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("validate.sh");
        std::fs::write(
            &script,
            "echo \"$1: line: 2: Error: Undeclared predicate\" >&2\necho \"$2: line: 1: Warning: Unused object\"\n",
        )
        .unwrap();
        let command = format!("sh {} $(domain) $(problem)", script.display());
        let validator = ExecutableValidator::new(command, &[], 10).unwrap();

        let mut bundle = bundle();
        bundle.problems.push(ValidationInput {
            uri: uri("p2.pddl"),
            text: PROBLEM.to_string(),
        });
        let report = validator.validate(&bundle).await.unwrap();

        // two runs report the same domain issue once
        let domain = &report[&uri("domain.pddl")];
        assert_eq!(domain.len(), 1);
        assert_eq!(domain[0].range.start.line, 1);
        assert_eq!(domain[0].message, "Undeclared predicate");
        assert_eq!(report[&uri("p.pddl")].len(), 1);
        assert_eq!(report[&uri("p2.pddl")][0].severity, Some(DiagnosticSeverity::WARNING));
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let validator = ExecutableValidator::new("pddl-validator-that-does-not-exist $(domain)", &[], 5).unwrap();
        let err = validator.validate(&bundle()).await.unwrap_err();
        assert!(matches!(err, ValidationError::Spawn { .. }));
    }

    struct CountingValidator {
        calls: AtomicUsize,
    }

    #[tower_lsp::async_trait]
    impl Validator for CountingValidator {
        async fn validate(&self, bundle: &ValidationBundle) -> Result<ValidationReport, ValidationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(bundle.empty_report())
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        reports: Mutex<Vec<ValidationReport>>,
    }

    #[tower_lsp::async_trait]
    impl DiagnosticsSink for CollectingSink {
        async fn publish(&self, report: ValidationReport) {
            self.reports.lock().push(report);
        }

        async fn report_failure(&self, _domain: &Url, _error: ValidationError) {}
    }

    #[tokio::test]
    async fn coalesces_edits_into_one_validation() {
        let settings = Settings {
            validation_debounce_ms: 20,
            ..Settings::default()
        };
        let workspace = SharedWorkspace::new(&settings);
        workspace.write().upsert_and_parse_file(&uri("domain.pddl"), 1, DOMAIN);
        workspace.write().upsert_and_parse_file(&uri("p.pddl"), 1, PROBLEM);

        let sink = Arc::new(CollectingSink::default());
        let scheduler = ValidationScheduler::new(workspace.clone(), sink.clone(), &settings);
        let validator = Arc::new(CountingValidator {
            calls: AtomicUsize::new(0),
        });
        scheduler.set_validator(Some(validator.clone() as Arc<dyn Validator>));

        scheduler.schedule(&uri("domain.pddl"));
        scheduler.schedule(&uri("p.pddl"));
        scheduler.schedule(&uri("domain.pddl"));
        assert_eq!(scheduler.state(), SchedulerState::Scheduled);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
        let reports = sink.reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].len(), 2);
        let status = workspace.read().get_file_info(&uri("p.pddl")).unwrap().status;
        assert_eq!(status, FileStatus::Validated);
    }
}
