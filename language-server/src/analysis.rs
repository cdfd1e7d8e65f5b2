use crate::config::SERVER_NAME;
use crate::domain::DomainInfo;
use crate::file_info::{Action, FileInfo, FileKind, Parameter, ParsingProblem, Variable};
use crate::inheritance::ROOT_TYPE;
use crate::parser::{line_range, FileFormat};
use crate::problem::ProblemInfo;
use crate::text::is_commented;
use crate::workspace::{Binding, Workspace};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tower_lsp::lsp_types::{Diagnostic, DiagnosticSeverity, Position, Range, Url};
use walkdir::WalkDir;

static TYPE_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)-\s+([A-Za-z][\w\-]*)").expect("valid type suffix pattern"));

pub(crate) fn sanitize_markdown(value: &str) -> String {
    value.trim().replace('|', "\\|").replace('\n', "<br>")
}

fn or_none(values: &[String]) -> String {
    if values.is_empty() {
        "(none)".to_string()
    } else {
        values
            .iter()
            .map(|value| sanitize_markdown(value))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub(crate) fn format_variable_hover(variable: &Variable) -> String {
    let mut lines = vec![format!(
        "**{}:** {}",
        variable.kind.label(),
        sanitize_markdown(&variable.name)
    )];
    lines.push(format!("- Declaration: `({})`", variable.declared_name));
    if let Some(doc) = variable.documentation.as_deref() {
        lines.push(String::new());
        lines.push(sanitize_markdown(doc));
    }
    lines.join("\n")
}

pub(crate) fn format_type_hover(domain: &DomainInfo, name: &str) -> String {
    let mut lines = vec![format!("**Type:** {}", sanitize_markdown(name))];
    lines.push(format!(
        "- Parents: {}",
        or_none(&domain.type_inheritance.get_parents(name))
    ));
    lines.push(format!(
        "- Subtypes: {}",
        or_none(&domain.get_types_inheriting_from(name))
    ));
    lines.join("\n")
}

pub(crate) fn format_action_hover(action: &Action) -> String {
    let mut lines = vec![format!(
        "**{}:** {}",
        action.kind.keyword(),
        sanitize_markdown(&action.name)
    )];
    lines.push(format!(
        "- Parameters: {}",
        if action.parameters.is_empty() {
            "(none)".to_string()
        } else {
            sanitize_markdown(&Parameter::render(&action.parameters))
        }
    ));
    if let Some(doc) = action.documentation.as_deref() {
        lines.push(String::new());
        lines.push(sanitize_markdown(doc));
    }
    lines.join("\n")
}

pub(crate) fn to_diagnostic(range: Range, severity: DiagnosticSeverity, message: String) -> Diagnostic {
    Diagnostic {
        range,
        severity: Some(severity),
        code: None,
        code_description: None,
        source: Some(SERVER_NAME.to_string()),
        message,
        related_information: None,
        tags: None,
        data: None,
    }
}

impl From<&ParsingProblem> for Diagnostic {
    fn from(problem: &ParsingProblem) -> Self {
        to_diagnostic(problem.range, problem.severity, problem.message.clone())
    }
}

fn file_name(uri: &Url) -> String {
    uri.path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(str::to_string)
        .unwrap_or_else(|| uri.to_string())
}

fn binding_hint(workspace: &Workspace, file: &FileInfo) -> Option<Diagnostic> {
    let (range, wanted) = match &file.kind {
        // spans of a pre-processed problem point into the generated text
        FileKind::Problem(problem) if problem.preprocessed_text.is_some() => (
            line_range(&file.document, 0),
            format!("domain '{}'", problem.domain_name),
        ),
        FileKind::Problem(problem) => (
            file.document.range_of(problem.domain_name_span.clone()),
            format!("domain '{}'", problem.domain_name),
        ),
        FileKind::Plan(plan) => (
            Range::new(Position::new(0, 0), Position::new(0, 0)),
            plan.domain_name
                .as_deref()
                .map(|name| format!("domain '{}'", name))
                .unwrap_or_else(|| "a domain".to_string()),
        ),
        _ => return None,
    };
    let message = match workspace.domain_binding(&file.uri) {
        Binding::Unique(_) => return None,
        Binding::Missing => format!("No file in this folder declares {}", wanted),
        Binding::Ambiguous(candidates) => format!(
            "Several files declare {}: {}",
            wanted,
            candidates
                .iter()
                .map(file_name)
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    Some(to_diagnostic(range, DiagnosticSeverity::HINT, message))
}

fn undeclared_in_problem(
    file: &FileInfo,
    problem: &ProblemInfo,
    domain: &DomainInfo,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for entry in &problem.init_entries {
        let atom = entry.atom();
        if domain.find_variable(&atom.name).is_none() {
            diagnostics.push(to_diagnostic(
                file.document.range_of(atom.span.clone()),
                DiagnosticSeverity::WARNING,
                format!("Undeclared predicate or function '{}'", atom.name),
            ));
        }
    }
    for entry in &problem.object_entries {
        for type_name in &entry.types {
            if !domain.has_type(type_name) {
                diagnostics.push(to_diagnostic(
                    file.document.range_of(entry.span.clone()),
                    DiagnosticSeverity::WARNING,
                    format!("Object '{}' has undeclared type '{}'", entry.name, type_name),
                ));
            }
        }
    }
}

fn undeclared_types_in_domain(file: &FileInfo, domain: &DomainInfo, diagnostics: &mut Vec<Diagnostic>) {
    if domain.sections.types.is_none() {
        return;
    }
    let text = file.text();
    for caps in TYPE_SUFFIX.captures_iter(text) {
        let Some(name) = caps.get(1) else {
            continue;
        };
        let type_name = name.as_str();
        if type_name.eq_ignore_ascii_case("number")
            || type_name.eq_ignore_ascii_case(ROOT_TYPE)
            || domain.has_type(type_name)
            || is_commented(text, name.start())
        {
            continue;
        }
        diagnostics.push(to_diagnostic(
            file.document.range_of(name.range()),
            DiagnosticSeverity::WARNING,
            format!("Undeclared type '{}'", type_name),
        ));
    }
}

/// Parsing problems, binding hints and undeclared-symbol warnings for one
/// file, capped at `max_problems`.
pub fn collect_diagnostics(workspace: &Workspace, uri: &Url, max_problems: usize) -> Vec<Diagnostic> {
    let Some(file) = workspace.get_file_info(uri) else {
        return Vec::new();
    };
    let mut diagnostics: Vec<Diagnostic> = file.problems.iter().map(Diagnostic::from).collect();
    diagnostics.extend(binding_hint(workspace, file));

    match &file.kind {
        FileKind::Domain(domain) => undeclared_types_in_domain(file, domain, &mut diagnostics),
        FileKind::Problem(problem) if problem.preprocessed_text.is_none() => {
            if let Some(domain) = workspace
                .get_domain_file_for(uri)
                .and_then(FileInfo::as_domain)
            {
                undeclared_in_problem(file, problem, domain, &mut diagnostics);
            }
        }
        _ => {}
    }

    if diagnostics.len() > max_problems {
        tracing::debug!(
            "Capping {} diagnostics for {} at {}",
            diagnostics.len(),
            uri,
            max_problems
        );
        diagnostics.truncate(max_problems);
    }
    diagnostics
}

/// PDDL, plan and happenings files directly inside `dir`.
pub fn scan_directory(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    WalkDir::new(dir)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            Url::from_file_path(path)
                .map(|uri| FileFormat::is_supported(&uri))
                .unwrap_or(false)
        })
        .collect()
}
