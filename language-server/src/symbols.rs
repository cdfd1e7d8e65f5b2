use crate::analysis::{format_action_hover, format_type_hover, format_variable_hover};
use crate::domain::{preceded_by_bracket, preceded_by_dash, DomainInfo};
use crate::file_info::{ActionKind, FileInfo, FileKind, VariableKind};
use crate::text::{identifier_occurrences, is_commented, Document};
use crate::workspace::Workspace;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::ops::Range as Span;
use tower_lsp::lsp_types::{
    DocumentSymbol, Location, Position, Range, SymbolKind as LspSymbolKind, TextEdit, Url,
    WorkspaceEdit,
};

static VALID_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_\-]*$").expect("valid name pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Variable(VariableKind),
    Type,
    Action(ActionKind),
}

impl SymbolKind {
    pub fn label(self) -> &'static str {
        match self {
            SymbolKind::Variable(kind) => kind.label(),
            SymbolKind::Type => "Type",
            SymbolKind::Action(ActionKind::Durative) => "Durative action",
            SymbolKind::Action(ActionKind::Process) => "Process",
            SymbolKind::Action(ActionKind::Event) => "Event",
            SymbolKind::Action(ActionKind::Instantaneous) => "Action",
        }
    }

    pub fn is_renameable(self) -> bool {
        matches!(self, SymbolKind::Variable(_) | SymbolKind::Type)
    }
}

/// What the word under the cursor refers to.
#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub kind: SymbolKind,
    /// Name as declared in the domain.
    pub name: String,
    /// The occurrence under the cursor.
    pub range: Range,
    pub hover: String,
    /// Declaration site, when it could be resolved.
    pub location: Option<Location>,
    pub domain_uri: Url,
}

fn is_symbol_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_')
}

/// Span of the identifier touching `offset`. Parameters (`?x`) and keywords
/// (`:types`) are not symbols.
fn word_at(text: &str, offset: usize) -> Option<Span<usize>> {
    let bytes = text.as_bytes();
    let mut start = offset.min(bytes.len());
    while start > 0 && is_symbol_byte(bytes[start - 1]) {
        start -= 1;
    }
    let mut end = offset.min(bytes.len());
    while end < bytes.len() && is_symbol_byte(bytes[end]) {
        end += 1;
    }
    if start == end {
        return None;
    }
    if start > 0 && matches!(bytes[start - 1], b'?' | b':') {
        return None;
    }
    Some(start..end)
}

fn preceded_by_action_keyword(text: &str, offset: usize) -> bool {
    let before = text[..offset].trim_end().to_ascii_lowercase();
    [":action", ":durative-action", ":process", ":event"]
        .iter()
        .any(|keyword| before.ends_with(keyword))
}

fn inside_either(file: &FileInfo, offset: usize) -> bool {
    file.syntax_tree
        .get_breadcrumbs(offset)
        .iter()
        .any(|node| node.is_bracket() && file.syntax_tree.has_name(node, "either"))
}

/// Whether the word at `offset` names a predicate or function application,
/// as opposed to an argument or the `at` of a time specifier.
fn names_variable(file: &FileInfo, offset: usize) -> bool {
    file.syntax_tree
        .bracket_named_at(offset)
        .map(|bracket| !file.syntax_tree.is_time_specifier(bracket))
        .unwrap_or(false)
}

fn in_types_section(domain: &DomainInfo, offset: usize) -> bool {
    domain
        .sections
        .types
        .as_ref()
        .map(|span| span.contains(&offset))
        .unwrap_or(false)
}

/// Resolves the symbol at `position` against the domain bound to the file.
pub fn get_symbol_info(workspace: &Workspace, uri: &Url, position: Position) -> Option<SymbolInfo> {
    let file = workspace.get_file_info(uri)?;
    let text = file.text();
    let offset = file.document.offset(position)?;
    if is_commented(text, offset) {
        return None;
    }
    let span = word_at(text, offset)?;
    let word = &text[span.clone()];
    let range = file.document.range_of(span.clone());

    let domain_file = workspace.get_domain_file_for(uri)?;
    let domain = domain_file.as_domain()?;
    let domain_document = &domain_file.document;
    let location = |range: Option<Range>| {
        range.map(|range| Location {
            uri: domain_file.uri.clone(),
            range,
        })
    };

    let is_plan = matches!(file.kind, FileKind::Plan(_) | FileKind::Happenings(_));

    if is_plan {
        if preceded_by_bracket(text, span.start) {
            if let Some(action) = domain.find_action(word) {
                return Some(SymbolInfo {
                    kind: SymbolKind::Action(action.kind),
                    name: action.name.clone(),
                    range,
                    hover: format_action_hover(action),
                    location: location(Some(domain.action_location(action, domain_document))),
                    domain_uri: domain_file.uri.clone(),
                });
            }
        }
    } else if names_variable(file, span.start) {
        if let Some(variable) = domain.find_variable(word) {
            return Some(SymbolInfo {
                kind: SymbolKind::Variable(variable.kind),
                name: variable.name.clone(),
                range,
                hover: format_variable_hover(variable),
                location: location(domain.resolve_location(variable, domain_document)),
                domain_uri: domain_file.uri.clone(),
            });
        }
    }

    if file.is_domain() && preceded_by_action_keyword(text, span.start) {
        let action = domain.find_action(word)?;
        return Some(SymbolInfo {
            kind: SymbolKind::Action(action.kind),
            name: action.name.clone(),
            range,
            hover: format_action_hover(action),
            location: location(Some(domain.action_location(action, domain_document))),
            domain_uri: domain_file.uri.clone(),
        });
    }

    let type_context = preceded_by_dash(text, span.start)
        || inside_either(file, span.start)
        || (file.is_domain() && in_types_section(domain, span.start));
    if type_context && domain.has_type(word) {
        let name = domain
            .types
            .iter()
            .find(|declared| declared.eq_ignore_ascii_case(word))
            .cloned()
            .unwrap_or_else(|| word.to_string());
        return Some(SymbolInfo {
            kind: SymbolKind::Type,
            hover: format_type_hover(domain, &name),
            location: location(domain.resolve_type_location(&name, domain_document)),
            name,
            range,
            domain_uri: domain_file.uri.clone(),
        });
    }

    None
}

fn spans_where<F>(document: &Document, name: &str, mut keep: F) -> Vec<Range>
where
    F: FnMut(&str, usize) -> bool,
{
    let text = document.text();
    identifier_occurrences(text, 0..text.len(), name)
        .into_iter()
        .filter(|span| keep(text, span.start))
        .map(|span| document.range_of(span))
        .collect()
}

fn occurrences_in(file: &FileInfo, domain: &DomainInfo, symbol: &SymbolInfo) -> Vec<Range> {
    match symbol.kind {
        SymbolKind::Variable(_) => match file.kind {
            FileKind::Domain(_) | FileKind::Problem(_) => {
                spans_where(&file.document, &symbol.name, |_, offset| names_variable(file, offset))
            }
            _ => Vec::new(),
        },
        SymbolKind::Type => match &file.kind {
            FileKind::Domain(_) => spans_where(&file.document, &symbol.name, |text, offset| {
                preceded_by_dash(text, offset)
                    || in_types_section(domain, offset)
                    || inside_either(file, offset)
            }),
            FileKind::Problem(_) => spans_where(&file.document, &symbol.name, |text, offset| {
                preceded_by_dash(text, offset) || inside_either(file, offset)
            }),
            _ => Vec::new(),
        },
        SymbolKind::Action(_) => match &file.kind {
            FileKind::Domain(_) => domain
                .find_action(&symbol.name)
                .map(|action| vec![domain.action_location(action, &file.document)])
                .unwrap_or_default(),
            FileKind::Plan(_) | FileKind::Happenings(_) => {
                spans_where(&file.document, &symbol.name, preceded_by_bracket)
            }
            _ => Vec::new(),
        },
    }
}

/// Every occurrence of `symbol` across its domain, the problems bound to it
/// and, for actions, the plans bound to it.
pub fn find_symbol_references(
    workspace: &Workspace,
    symbol: &SymbolInfo,
    include_declaration: bool,
) -> Vec<Location> {
    let Some(domain_file) = workspace.get_file_info(&symbol.domain_uri) else {
        return Vec::new();
    };
    let Some(domain) = domain_file.as_domain() else {
        return Vec::new();
    };

    let mut files = vec![domain_file];
    files.extend(workspace.get_problem_files(&symbol.domain_uri));
    if matches!(symbol.kind, SymbolKind::Action(_)) {
        files.extend(workspace.get_plan_files(&symbol.domain_uri));
    }

    let declaration = symbol.location.as_ref();
    let mut locations = Vec::new();
    for file in files {
        for range in occurrences_in(file, domain, symbol) {
            let location = Location {
                uri: file.uri.clone(),
                range,
            };
            if !include_declaration && Some(&location) == declaration {
                continue;
            }
            locations.push(location);
        }
    }
    locations
}

pub fn is_valid_name(name: &str) -> bool {
    VALID_NAME.is_match(name)
}

/// Range to rename, when the symbol under the cursor supports it.
pub fn prepare_rename(workspace: &Workspace, uri: &Url, position: Position) -> Option<Range> {
    get_symbol_info(workspace, uri, position)
        .filter(|symbol| symbol.kind.is_renameable())
        .map(|symbol| symbol.range)
}

fn collect_rename_edits(locations: Vec<Location>, new_name: &str) -> HashMap<Url, Vec<TextEdit>> {
    let mut edits: HashMap<Url, Vec<TextEdit>> = HashMap::new();
    for location in locations {
        edits.entry(location.uri).or_default().push(TextEdit {
            range: location.range,
            new_text: new_name.to_string(),
        });
    }
    edits
}

/// Renames a predicate, function or type everywhere it is used. Returns
/// `None` for other symbols or an invalid `new_name`.
pub fn rename(
    workspace: &Workspace,
    uri: &Url,
    position: Position,
    new_name: &str,
) -> Option<WorkspaceEdit> {
    if !is_valid_name(new_name) {
        return None;
    }
    let symbol = get_symbol_info(workspace, uri, position)?;
    if !symbol.kind.is_renameable() {
        return None;
    }
    let locations = find_symbol_references(workspace, &symbol, true);
    tracing::debug!(
        "Renaming {} '{}' to '{}' at {} location(s)",
        symbol.kind.label(),
        symbol.name,
        new_name,
        locations.len()
    );
    Some(WorkspaceEdit {
        changes: Some(collect_rename_edits(locations, new_name)),
        ..WorkspaceEdit::default()
    })
}

#[allow(deprecated)]
fn document_symbol(
    name: &str,
    detail: Option<String>,
    kind: LspSymbolKind,
    range: Range,
    children: Option<Vec<DocumentSymbol>>,
) -> DocumentSymbol {
    DocumentSymbol {
        name: name.to_string(),
        detail,
        kind,
        tags: None,
        deprecated: None,
        range,
        selection_range: range,
        children,
    }
}

/// Outline of a domain or problem file.
pub fn document_symbols(file: &FileInfo) -> Vec<DocumentSymbol> {
    let document = &file.document;
    match &file.kind {
        FileKind::Domain(domain) => {
            let mut symbols = Vec::new();
            for name in &domain.types {
                if let Some(range) = domain.resolve_type_location(name, document) {
                    symbols.push(document_symbol(name, None, LspSymbolKind::CLASS, range, None));
                }
            }
            for variable in domain.variables() {
                if let Some(range) = domain.resolve_location(variable, document) {
                    let kind = match variable.kind {
                        VariableKind::Function => LspSymbolKind::FUNCTION,
                        _ => LspSymbolKind::BOOLEAN,
                    };
                    symbols.push(document_symbol(
                        &variable.name,
                        Some(variable.declared_name.clone()),
                        kind,
                        range,
                        None,
                    ));
                }
            }
            for action in domain.actions.iter().filter(|action| !action.name.is_empty()) {
                symbols.push(document_symbol(
                    &action.name,
                    Some(action.kind.keyword().to_string()),
                    LspSymbolKind::METHOD,
                    domain.action_location(action, document),
                    None,
                ));
            }
            symbols
        }
        FileKind::Problem(problem) => problem
            .object_entries
            .iter()
            .map(|entry| {
                document_symbol(
                    &entry.name,
                    Some(entry.types.join(" ")),
                    LspSymbolKind::CONSTANT,
                    document.range_of(entry.span.clone()),
                    None,
                )
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = "(define (domain d)\n  (:types truck - vehicle loc)\n  (:predicates (at ?v - vehicle ?l - loc))\n  (:action drive :parameters (?t - truck ?l - loc)))";
    const PROBLEM: &str =
        "(define (problem p) (:domain d)\n  (:objects t1 - truck a - loc)\n  (:init (at t1 a)))";

    fn uri(name: &str) -> Url {
        Url::parse(&format!("file:///w/{}", name)).unwrap()
    }

    fn workspace() -> Workspace {
        let mut workspace = Workspace::default();
        workspace.upsert_and_parse_file(&uri("domain.pddl"), 1, DOMAIN);
        workspace.upsert_and_parse_file(&uri("p.pddl"), 1, PROBLEM);
        workspace.upsert_and_parse_file(&uri("p.plan"), 1, "0: (drive t1 a) [1]");
        workspace
    }

    #[test]
    fn resolves_predicate_from_problem() {
        let workspace = workspace();
        let symbol = get_symbol_info(&workspace, &uri("p.pddl"), Position::new(2, 11)).unwrap();
        assert_eq!(symbol.kind, SymbolKind::Variable(VariableKind::Predicate));
        assert_eq!(symbol.name, "at");
        let declaration = symbol.location.clone().unwrap();
        assert_eq!(declaration.uri, uri("domain.pddl"));
        assert_eq!(declaration.range.start, Position::new(2, 16));
        assert!(symbol.hover.contains("at ?v - vehicle ?l - loc"));
    }

    #[test]
    fn finds_predicate_references_across_files() {
        let workspace = workspace();
        let symbol = get_symbol_info(&workspace, &uri("p.pddl"), Position::new(2, 11)).unwrap();
        assert_eq!(find_symbol_references(&workspace, &symbol, true).len(), 2);
        let without = find_symbol_references(&workspace, &symbol, false);
        assert_eq!(without.len(), 1);
        assert_eq!(without[0].uri, uri("p.pddl"));
    }

    #[test]
    fn resolves_types_after_dash() {
        let workspace = workspace();
        let symbol = get_symbol_info(&workspace, &uri("p.pddl"), Position::new(1, 20)).unwrap();
        assert_eq!(symbol.kind, SymbolKind::Type);
        assert_eq!(symbol.name, "truck");
        let references = find_symbol_references(&workspace, &symbol, true);
        // :types declaration, action parameter, problem object
        assert_eq!(references.len(), 3);
    }

    #[test]
    fn resolves_actions_from_plans() {
        let workspace = workspace();
        let symbol = get_symbol_info(&workspace, &uri("p.plan"), Position::new(0, 5)).unwrap();
        assert_eq!(symbol.kind, SymbolKind::Action(ActionKind::Instantaneous));
        let references = find_symbol_references(&workspace, &symbol, true);
        assert_eq!(references.len(), 2);
        assert!(prepare_rename(&workspace, &uri("p.plan"), Position::new(0, 5)).is_none());
    }

    #[test]
    fn ignores_parameters_and_comments() {
        let workspace = workspace();
        // `?v` in the predicate declaration
        assert!(get_symbol_info(&workspace, &uri("domain.pddl"), Position::new(2, 21)).is_none());
        assert!(word_at("(at ?x)", 5).is_none());
        assert!(word_at(":types", 3).is_none());
    }

    #[test]
    fn renames_predicates_in_every_bound_file() {
        let workspace = workspace();
        let edit = rename(&workspace, &uri("p.pddl"), Position::new(2, 11), "located").unwrap();
        let changes = edit.changes.unwrap();
        assert_eq!(changes[&uri("domain.pddl")].len(), 1);
        assert_eq!(changes[&uri("p.pddl")].len(), 1);
        assert!(rename(&workspace, &uri("p.pddl"), Position::new(2, 11), "bad name").is_none());
        assert!(rename(&workspace, &uri("p.pddl"), Position::new(2, 11), "?x").is_none());
    }

    #[test]
    fn time_specifiers_are_not_predicate_references() {
        let domain = "(define (domain d)\n  (:predicates (at ?x) (open ?x))\n  (:durative-action go :parameters (?p)\n    :condition (at start (at ?p))\n    :effect (at end (not (at ?p)))))";
        let problem = "(define (problem p) (:domain d)\n  (:init (at a) (at 12 (open a))))";
        let mut workspace = Workspace::default();
        workspace.upsert_and_parse_file(&uri("domain.pddl"), 1, domain);
        workspace.upsert_and_parse_file(&uri("p.pddl"), 1, problem);

        // `at` of `(at start`
        assert!(get_symbol_info(&workspace, &uri("domain.pddl"), Position::new(3, 17)).is_none());

        let symbol = get_symbol_info(&workspace, &uri("p.pddl"), Position::new(1, 11)).unwrap();
        assert_eq!(symbol.name, "at");
        let references = find_symbol_references(&workspace, &symbol, true);
        assert_eq!(references.len(), 4);

        let edit = rename(&workspace, &uri("p.pddl"), Position::new(1, 11), "located").unwrap();
        let changes = edit.changes.unwrap();
        assert_eq!(changes[&uri("domain.pddl")].len(), 3);
        assert_eq!(changes[&uri("p.pddl")].len(), 1);
    }

    #[test]
    fn outlines_domain() {
        let workspace = workspace();
        let file = workspace.get_file_info(&uri("domain.pddl")).unwrap();
        let names: Vec<String> = document_symbols(file).into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["truck", "vehicle", "loc", "at", "drive"]);
    }
}
