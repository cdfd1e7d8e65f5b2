use crate::analysis::{format_action_hover, format_variable_hover};
use crate::domain::{DomainInfo, KNOWN_REQUIREMENTS};
use crate::file_info::{FileInfo, FileKind, TypeObjects};
use crate::inheritance::ROOT_TYPE;
use crate::syntax::SyntaxNode;
use crate::text::is_commented;
use crate::workspace::Workspace;
use tower_lsp::lsp_types::{
    CompletionItem, CompletionItemKind, Documentation, MarkupContent, MarkupKind, Position, Url,
};

pub const TRIGGER_CHARACTERS: &[&str] = &["(", ":", "-", " "];

const DOMAIN_SECTIONS: &[&str] = &[
    ":requirements",
    ":types",
    ":constants",
    ":predicates",
    ":functions",
    ":derived",
    ":action",
    ":durative-action",
    ":process",
    ":event",
];

const PROBLEM_SECTIONS: &[&str] = &[":domain", ":objects", ":init", ":goal", ":metric", ":constraints"];

const ACTION_FIELDS: &[&str] = &[":parameters", ":precondition", ":effect", ":duration", ":condition"];

const OPERATORS: &[&str] = &[
    "and", "or", "not", "imply", "forall", "exists", "when", "at start", "at end", "over all",
    "increase", "decrease", "assign", "scale-up", "scale-down",
];

const ACTION_KEYWORDS: &[&str] = &[":action", ":durative-action", ":process", ":event"];

/// Sections whose bracketed children are predicate or function atoms.
const ATOM_SCOPES: &[&str] = &[
    ":action",
    ":durative-action",
    ":process",
    ":event",
    ":derived",
    ":init",
    ":goal",
    ":metric",
    ":constraints",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    TopLevel,
    Section,
    ActionField,
    Requirement,
    Type,
    Atom,
    Argument,
    PlanAction,
}

fn keyword_item(label: &str, detail: &str) -> CompletionItem {
    CompletionItem {
        label: label.to_string(),
        kind: Some(CompletionItemKind::KEYWORD),
        detail: Some(detail.to_string()),
        ..Default::default()
    }
}

fn markdown(value: String) -> Option<Documentation> {
    Some(Documentation::MarkupContent(MarkupContent {
        kind: MarkupKind::Markdown,
        value,
    }))
}

fn partial_word_start(text: &str, offset: usize) -> usize {
    let bytes = text.as_bytes();
    let mut start = offset;
    while start > 0
        && (bytes[start - 1].is_ascii_alphanumeric()
            || matches!(bytes[start - 1], b'-' | b'_' | b':' | b'?'))
    {
        start -= 1;
    }
    // a lone dash is the typing suffix, not part of a word
    if &text[start..offset] == "-" {
        return offset;
    }
    start
}

fn bracket_names<'a>(file: &'a FileInfo, crumbs: &[&'a SyntaxNode]) -> Vec<String> {
    crumbs
        .iter()
        .map(|node| {
            file.syntax_tree
                .name(node)
                .map(str::to_ascii_lowercase)
                .unwrap_or_default()
        })
        .collect()
}

fn detect_context(file: &FileInfo, offset: usize) -> Option<Context> {
    let text = file.text();
    let word_start = partial_word_start(text, offset);
    let before = text[..word_start].trim_end_matches(|c: char| c == ' ' || c == '\t');
    let after_bracket = text[..word_start].ends_with('(');

    if matches!(file.kind, FileKind::Plan(_) | FileKind::Happenings(_)) {
        return after_bracket.then_some(Context::PlanAction);
    }

    let crumbs: Vec<&SyntaxNode> = file
        .syntax_tree
        .get_breadcrumbs(offset)
        .into_iter()
        .filter(|node| node.is_bracket())
        .collect();
    let names = bracket_names(file, &crumbs);
    // the bracket being typed does not count as context
    let enclosing = if after_bracket && !names.is_empty() {
        &names[..names.len() - 1]
    } else {
        &names[..]
    };

    if before.ends_with(" -") || before.ends_with("\t-") || before.ends_with("\n-") {
        return Some(Context::Type);
    }
    if enclosing.iter().any(|name| name == ":requirements") {
        return Some(Context::Requirement);
    }
    if after_bracket {
        return match enclosing.last().map(String::as_str) {
            None => Some(Context::TopLevel),
            Some("define") => Some(Context::Section),
            Some(_) if enclosing.iter().any(|name| ATOM_SCOPES.contains(&name.as_str())) => {
                Some(Context::Atom)
            }
            _ => None,
        };
    }
    match enclosing.split_last() {
        Some((last, _)) if ACTION_KEYWORDS.contains(&last.as_str()) => Some(Context::ActionField),
        Some((last, parents))
            if !ATOM_SCOPES.contains(&last.as_str())
                && parents.iter().any(|name| ATOM_SCOPES.contains(&name.as_str())) =>
        {
            Some(Context::Argument)
        }
        _ => None,
    }
}

fn type_items(domain: &DomainInfo) -> Vec<CompletionItem> {
    std::iter::once(ROOT_TYPE.to_string())
        .chain(domain.types.iter().cloned())
        .map(|name| CompletionItem {
            detail: Some(format!("Type: {}", name)),
            kind: Some(CompletionItemKind::CLASS),
            label: name,
            ..Default::default()
        })
        .collect()
}

fn atom_items(domain: &DomainInfo) -> Vec<CompletionItem> {
    let variables = domain.variables().map(|variable| CompletionItem {
        label: variable.name.clone(),
        kind: Some(CompletionItemKind::FUNCTION),
        detail: Some(format!("{}: ({})", variable.kind.label(), variable.declared_name)),
        documentation: markdown(format_variable_hover(variable)),
        ..Default::default()
    });
    let operators = OPERATORS
        .iter()
        .map(|operator| keyword_item(operator, "Operator"));
    variables.chain(operators).collect()
}

fn object_items(groups: &[TypeObjects], detail: &str) -> Vec<CompletionItem> {
    groups
        .iter()
        .flat_map(|group| {
            group.objects.iter().map(move |object| CompletionItem {
                label: object.clone(),
                kind: Some(CompletionItemKind::CONSTANT),
                detail: Some(format!("{} - {}", detail, group.type_name)),
                ..Default::default()
            })
        })
        .collect()
}

/// Completion items for the cursor position, chosen by the enclosing
/// brackets and the file kind.
pub fn completions(workspace: &Workspace, uri: &Url, position: Position) -> Vec<CompletionItem> {
    let Some(file) = workspace.get_file_info(uri) else {
        return Vec::new();
    };
    let Some(offset) = file.document.offset(position) else {
        return Vec::new();
    };
    if is_commented(file.text(), offset) {
        return Vec::new();
    }
    let Some(context) = detect_context(file, offset) else {
        return Vec::new();
    };
    let domain = workspace
        .get_domain_file_for(uri)
        .and_then(FileInfo::as_domain);

    match context {
        Context::TopLevel => vec![keyword_item("define", "PDDL definition")],
        Context::Section => {
            let sections = match file.kind {
                FileKind::Problem(_) => PROBLEM_SECTIONS,
                FileKind::Domain(_) => DOMAIN_SECTIONS,
                _ => return vec![keyword_item("domain", "Domain"), keyword_item("problem", "Problem")],
            };
            sections.iter().map(|section| keyword_item(section, "Section")).collect()
        }
        Context::ActionField => ACTION_FIELDS
            .iter()
            .map(|field| keyword_item(field, "Action field"))
            .collect(),
        Context::Requirement => KNOWN_REQUIREMENTS
            .iter()
            .map(|requirement| keyword_item(requirement, "Requirement"))
            .collect(),
        Context::Type => domain.map(type_items).unwrap_or_default(),
        Context::Atom => domain.map(atom_items).unwrap_or_default(),
        Context::Argument => {
            let mut items = domain
                .map(|domain| object_items(&domain.constants, "Constant"))
                .unwrap_or_default();
            if let Some(problem) = file.as_problem() {
                items.extend(object_items(&problem.objects, "Object"));
            }
            items
        }
        Context::PlanAction => domain
            .map(|domain| {
                domain
                    .actions
                    .iter()
                    .filter(|action| !action.name.is_empty())
                    .map(|action| CompletionItem {
                        label: action.name.clone(),
                        kind: Some(CompletionItemKind::METHOD),
                        detail: Some(format!("Action: {}", action.name)),
                        documentation: markdown(format_action_hover(action)),
                        ..Default::default()
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = "(define (domain d)\n  (:requirements :typing)\n  (:types truck - vehicle)\n  (:constants depot - place)\n  (:predicates (at ?v - vehicle))\n  (:action drive :parameters (?t - truck) :effect (at ?t)))";

    fn uri(name: &str) -> Url {
        Url::parse(&format!("file:///w/{}", name)).unwrap()
    }

    fn labels_at(files: &[(&str, &str)], target: &str, position: Position) -> Vec<String> {
        let mut workspace = Workspace::default();
        for (name, text) in files {
            workspace.upsert_and_parse_file(&uri(name), 1, text);
        }
        completions(&workspace, &uri(target), position)
            .into_iter()
            .map(|item| item.label)
            .collect()
    }

    #[test]
    fn offers_sections_inside_define() {
        let text = "(define (domain d)\n  ()\n)";
        let labels = labels_at(&[("d.pddl", text)], "d.pddl", Position::new(1, 3));
        assert!(labels.contains(&":predicates".to_string()));
        assert!(!labels.contains(&":init".to_string()));
    }

    #[test]
    fn offers_requirements() {
        let text = "(define (domain d)\n  (:requirements :typing :))";
        let labels = labels_at(&[("d.pddl", text)], "d.pddl", Position::new(1, 25));
        assert!(labels.contains(&":durative-actions".to_string()));
    }

    #[test]
    fn offers_types_after_dash() {
        let text = "(define (domain d)\n  (:types truck - vehicle)\n  (:predicates (at ?v - )))";
        let labels = labels_at(&[("d.pddl", text)], "d.pddl", Position::new(2, 24));
        assert_eq!(labels, vec!["object", "truck", "vehicle"]);
    }

    #[test]
    fn offers_predicates_in_problem_init() {
        let problem = "(define (problem p) (:domain d)\n  (:objects t1 - truck)\n  (:init ( ))";
        let files = [("domain.pddl", DOMAIN), ("p.pddl", problem)];
        let labels = labels_at(&files, "p.pddl", Position::new(2, 10));
        assert_eq!(labels[0], "at");
        assert!(labels.contains(&"not".to_string()));

        let problem = "(define (problem p) (:domain d)\n  (:objects t1 - truck)\n  (:init (at )))";
        let files = [("domain.pddl", DOMAIN), ("p.pddl", problem)];
        let labels = labels_at(&files, "p.pddl", Position::new(2, 13));
        assert_eq!(labels, vec!["depot", "t1"]);
    }

    #[test]
    fn offers_actions_in_plans() {
        let files = [("domain.pddl", DOMAIN), ("p.plan", "0: ()")];
        let labels = labels_at(&files, "p.plan", Position::new(0, 4));
        assert_eq!(labels, vec!["drive"]);
    }

    #[test]
    fn nothing_inside_comments() {
        let text = "(define (domain d)\n  ; (\n)";
        assert!(labels_at(&[("d.pddl", text)], "d.pddl", Position::new(1, 5)).is_empty());
    }
}
