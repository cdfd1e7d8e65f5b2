use crate::domain::DomainInfo;
use crate::happenings::HappeningsInfo;
use crate::plan::PlanInfo;
use crate::problem::ProblemInfo;
use crate::syntax::{NodeKind, SyntaxNode, SyntaxTree, TokenKind};
use crate::text::Document;
use once_cell::sync::OnceCell;
use std::ops::Range as Span;
use tower_lsp::lsp_types::{DiagnosticSeverity, Range, Url};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Dirty,
    Parsed,
    Validating,
    Validated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsingProblem {
    pub message: String,
    pub range: Range,
    pub severity: DiagnosticSeverity,
}

impl ParsingProblem {
    pub fn error(message: impl Into<String>, range: Range) -> Self {
        Self {
            message: message.into(),
            range,
            severity: DiagnosticSeverity::ERROR,
        }
    }

    pub fn warning(message: impl Into<String>, range: Range) -> Self {
        Self {
            message: message.into(),
            range,
            severity: DiagnosticSeverity::WARNING,
        }
    }
}

/// What a file turned out to be after parsing.
#[derive(Debug)]
pub enum FileKind {
    Domain(DomainInfo),
    Problem(ProblemInfo),
    Plan(PlanInfo),
    Happenings(HappeningsInfo),
    Unknown,
}

impl FileKind {
    pub fn label(&self) -> &'static str {
        match self {
            FileKind::Domain(_) => "domain",
            FileKind::Problem(_) => "problem",
            FileKind::Plan(_) => "plan",
            FileKind::Happenings(_) => "happenings",
            FileKind::Unknown => "unknown",
        }
    }
}

/// A parsed workspace file. Replaced wholesale on every re-parse.
#[derive(Debug)]
pub struct FileInfo {
    pub uri: Url,
    pub version: i32,
    pub document: Document,
    pub syntax_tree: SyntaxTree,
    pub status: FileStatus,
    pub problems: Vec<ParsingProblem>,
    pub kind: FileKind,
}

impl FileInfo {
    pub fn text(&self) -> &str {
        self.document.text()
    }

    /// Accepts new content only when `version` moved forward; the file is
    /// then Dirty until the next parse replaces it.
    pub fn update(&mut self, version: i32, text: &str) -> bool {
        if version <= self.version {
            return false;
        }
        self.version = version;
        if text != self.document.text() {
            self.document = Document::new(text);
        }
        self.status = FileStatus::Dirty;
        true
    }

    pub fn as_domain(&self) -> Option<&DomainInfo> {
        match &self.kind {
            FileKind::Domain(domain) => Some(domain),
            _ => None,
        }
    }

    pub fn as_problem(&self) -> Option<&ProblemInfo> {
        match &self.kind {
            FileKind::Problem(problem) => Some(problem),
            _ => None,
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self.kind, FileKind::Domain(_))
    }

    pub fn is_problem(&self) -> bool {
        matches!(self.kind, FileKind::Problem(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub type_name: String,
}

impl Parameter {
    pub fn render(parameters: &[Parameter]) -> String {
        parameters
            .iter()
            .map(|p| format!("{} - {}", p.name, p.type_name))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    Predicate,
    Function,
    Derived,
}

impl VariableKind {
    pub fn label(self) -> &'static str {
        match self {
            VariableKind::Predicate => "Predicate",
            VariableKind::Function => "Function",
            VariableKind::Derived => "Derived predicate",
        }
    }
}

/// A predicate, function or derived predicate declaration.
///
/// Only the name and signature are recorded while parsing. The source
/// location is resolved on first request by re-scanning the declaring
/// section and memoized in `location`.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    /// Declaration with normalized whitespace, e.g. `at ?t - truck ?l - loc`.
    pub declared_name: String,
    pub parameters: Vec<Parameter>,
    pub kind: VariableKind,
    pub documentation: Option<String>,
    pub(crate) location: OnceCell<Option<Range>>,
}

impl Variable {
    pub fn new(
        name: impl Into<String>,
        declared_name: impl Into<String>,
        parameters: Vec<Parameter>,
        kind: VariableKind,
    ) -> Self {
        Self {
            name: name.into(),
            declared_name: declared_name.into(),
            parameters,
            kind,
            documentation: None,
            location: OnceCell::new(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn is_location_resolved(&self) -> bool {
        self.location.get().is_some()
    }
}

/// Objects (or constants) grouped under one type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeObjects {
    pub type_name: String,
    pub objects: Vec<String>,
}

impl TypeObjects {
    pub fn group(entries: &[TypedEntry]) -> Vec<TypeObjects> {
        let mut groups: Vec<TypeObjects> = Vec::new();
        for entry in entries {
            for type_name in &entry.types {
                match groups
                    .iter_mut()
                    .find(|group| group.type_name.eq_ignore_ascii_case(type_name))
                {
                    Some(group) => group.objects.push(entry.name.clone()),
                    None => groups.push(TypeObjects {
                        type_name: type_name.clone(),
                        objects: vec![entry.name.clone()],
                    }),
                }
            }
        }
        groups
    }

    pub fn has_object(&self, name: &str) -> bool {
        self.objects.iter().any(|object| object.eq_ignore_ascii_case(name))
    }

    pub fn type_of<'a>(groups: &'a [TypeObjects], object: &str) -> Option<&'a str> {
        groups
            .iter()
            .find(|group| group.has_object(object))
            .map(|group| group.type_name.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Instantaneous,
    Durative,
    Process,
    Event,
}

impl ActionKind {
    pub fn keyword(self) -> &'static str {
        match self {
            ActionKind::Instantaneous => ":action",
            ActionKind::Durative => ":durative-action",
            ActionKind::Process => ":process",
            ActionKind::Event => ":event",
        }
    }

    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword.to_ascii_lowercase().as_str() {
            ":action" => Some(ActionKind::Instantaneous),
            ":durative-action" => Some(ActionKind::Durative),
            ":process" => Some(ActionKind::Process),
            ":event" => Some(ActionKind::Event),
            _ => None,
        }
    }
}

/// An action block. Conditions and effects are kept as spans for display only.
#[derive(Debug, Clone)]
pub struct Action {
    pub name: String,
    pub kind: ActionKind,
    pub parameters: Vec<Parameter>,
    pub span: Span<usize>,
    pub name_span: Option<Span<usize>>,
    pub condition: Option<Span<usize>>,
    pub effect: Option<Span<usize>>,
    pub documentation: Option<String>,
}

impl Action {
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// One name from a PDDL typed list (`a b - c`), with the types it was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedEntry {
    pub name: String,
    pub span: Span<usize>,
    pub types: Vec<String>,
}

/// Parses the children of `nodes` as a typed list.
///
/// Names accumulate until a `-` suffix assigns them a type; `- (either a b)`
/// assigns several. Names left without a suffix are typed `object`.
pub fn parse_typed_list(tree: &SyntaxTree, nodes: &[&SyntaxNode]) -> Vec<TypedEntry> {
    let mut entries = Vec::new();
    let mut pending: Vec<TypedEntry> = Vec::new();
    let mut iter = nodes.iter().filter(|node| node.kind != NodeKind::Comment);

    while let Some(node) = iter.next() {
        match node.kind {
            NodeKind::Terminal(TokenKind::Dash) => {
                let types = match iter.next() {
                    Some(type_node) if type_node.is_terminal() => {
                        vec![tree.node_text(type_node).to_string()]
                    }
                    Some(type_node) if tree.has_name(type_node, "either") => tree
                        .arguments(type_node)
                        .into_iter()
                        .filter(|arg| arg.is_terminal())
                        .map(|arg| tree.node_text(arg).to_string())
                        .collect(),
                    _ => Vec::new(),
                };
                for mut entry in pending.drain(..) {
                    entry.types = types.clone();
                    entries.push(entry);
                }
            }
            NodeKind::Terminal(_) => pending.push(TypedEntry {
                name: tree.node_text(node).to_string(),
                span: node.span.clone(),
                types: Vec::new(),
            }),
            _ => {}
        }
    }

    for mut entry in pending {
        entry.types = vec!["object".to_string()];
        entries.push(entry);
    }

    entries
}

pub fn to_parameters(entries: Vec<TypedEntry>) -> Vec<Parameter> {
    entries
        .into_iter()
        .map(|entry| Parameter {
            name: entry.name,
            type_name: entry.types.join(" "),
        })
        .collect()
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
