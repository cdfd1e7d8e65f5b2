use crate::file_info::{
    normalize_whitespace, parse_typed_list, to_parameters, Action, ActionKind, ParsingProblem,
    TypeObjects, Variable, VariableKind,
};
use crate::inheritance::{TypeInheritance, ROOT_TYPE};
use crate::syntax::{SyntaxNode, SyntaxTree};
use crate::text::{identifier_occurrences, Document};
use dashmap::DashMap;
use std::ops::Range as Span;
use tower_lsp::lsp_types::Range;

/// Requirement keywords offered by completion. Others are accepted as-is.
pub const KNOWN_REQUIREMENTS: &[&str] = &[
    ":strips",
    ":typing",
    ":negative-preconditions",
    ":disjunctive-preconditions",
    ":equality",
    ":existential-preconditions",
    ":universal-preconditions",
    ":quantified-preconditions",
    ":conditional-effects",
    ":fluents",
    ":numeric-fluents",
    ":object-fluents",
    ":adl",
    ":durative-actions",
    ":duration-inequalities",
    ":continuous-effects",
    ":derived-predicates",
    ":timed-initial-literals",
    ":preferences",
    ":constraints",
    ":action-costs",
    ":time",
];

#[derive(Debug, Clone, Default)]
pub struct DomainSections {
    pub requirements: Option<Span<usize>>,
    pub types: Option<Span<usize>>,
    pub constants: Option<Span<usize>>,
    pub predicates: Option<Span<usize>>,
    pub functions: Option<Span<usize>>,
    pub derived: Vec<Span<usize>>,
}

#[derive(Debug)]
pub struct DomainInfo {
    pub name: String,
    pub name_span: Option<Span<usize>>,
    pub requirements: Vec<String>,
    pub types: Vec<String>,
    pub type_inheritance: TypeInheritance,
    pub constants: Vec<TypeObjects>,
    pub predicates: Vec<Variable>,
    pub functions: Vec<Variable>,
    pub derived: Vec<Variable>,
    pub actions: Vec<Action>,
    pub sections: DomainSections,
    type_locations: DashMap<String, Option<Range>>,
}

impl DomainInfo {
    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.predicates
            .iter()
            .chain(self.functions.iter())
            .chain(self.derived.iter())
    }

    pub fn find_variable(&self, name: &str) -> Option<&Variable> {
        self.variables().find(|variable| variable.matches(name))
    }

    pub fn find_action(&self, name: &str) -> Option<&Action> {
        self.actions.iter().find(|action| action.matches(name))
    }

    pub fn has_type(&self, name: &str) -> bool {
        name.eq_ignore_ascii_case(ROOT_TYPE)
            || self.types.iter().any(|declared| declared.eq_ignore_ascii_case(name))
    }

    pub fn get_types_inheriting_from(&self, name: &str) -> Vec<String> {
        self.type_inheritance.get_types_inheriting_from(name)
    }

    pub fn has_requirement(&self, requirement: &str) -> bool {
        self.requirements
            .iter()
            .any(|declared| declared.eq_ignore_ascii_case(requirement))
    }

    pub fn is_name(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Declaration site of `variable`, found by scanning its section on first
    /// use and memoized on the variable.
    pub fn resolve_location(&self, variable: &Variable, document: &Document) -> Option<Range> {
        *variable.location.get_or_init(|| {
            let scopes: Vec<Span<usize>> = match variable.kind {
                VariableKind::Predicate => self.sections.predicates.iter().cloned().collect(),
                VariableKind::Function => self.sections.functions.iter().cloned().collect(),
                VariableKind::Derived => self.sections.derived.clone(),
            };
            let text = document.text();
            scopes
                .into_iter()
                .flat_map(|scope| identifier_occurrences(text, scope, &variable.name))
                .find(|span| preceded_by_bracket(text, span.start))
                .map(|span| document.range_of(span))
        })
    }

    /// Declaration site of a type: its first occurrence in `(:types ...)` that
    /// is not a `- parent` suffix. Memoized per type name.
    pub fn resolve_type_location(&self, name: &str, document: &Document) -> Option<Range> {
        let key = name.to_ascii_lowercase();
        if let Some(cached) = self.type_locations.get(&key) {
            return *cached;
        }
        let location = self.sections.types.clone().and_then(|scope| {
            let text = document.text();
            let occurrences = identifier_occurrences(text, scope, name);
            occurrences
                .iter()
                .find(|span| !preceded_by_dash(text, span.start))
                .or_else(|| occurrences.first())
                .map(|span| document.range_of(span.clone()))
        });
        self.type_locations.insert(key, location);
        location
    }

    /// Where the action's name is written.
    pub fn action_location(&self, action: &Action, document: &Document) -> Range {
        let span = action.name_span.clone().unwrap_or(action.span.clone());
        document.range_of(span)
    }
}

pub(crate) fn preceded_by_bracket(text: &str, offset: usize) -> bool {
    text[..offset].trim_end().ends_with('(')
}

pub(crate) fn preceded_by_dash(text: &str, offset: usize) -> bool {
    let before = text[..offset].trim_end();
    before.ends_with(" -") || before.ends_with("\t-") || before.ends_with("\n-") || before == "-"
}

/// Parses `(define (domain ...) ...)`. Returns `None` when the text has no
/// domain header, so the caller can try the other file kinds.
pub fn try_domain(
    document: &Document,
    tree: &SyntaxTree,
    problems: &mut Vec<ParsingProblem>,
) -> Option<DomainInfo> {
    let define = tree.get_define_node()?;
    let header = tree.child_brackets_named(define, "domain").next()?;

    let name_node = tree.arguments(header).into_iter().find(|node| node.is_terminal());
    let name = name_node
        .map(|node| tree.node_text(node).to_string())
        .unwrap_or_default();
    if name.is_empty() {
        problems.push(ParsingProblem::error(
            "Domain name is missing",
            document.range_of(header.span.clone()),
        ));
    }

    let mut domain = DomainInfo {
        name,
        name_span: name_node.map(|node| node.span.clone()),
        requirements: Vec::new(),
        types: Vec::new(),
        type_inheritance: TypeInheritance::default(),
        constants: Vec::new(),
        predicates: Vec::new(),
        functions: Vec::new(),
        derived: Vec::new(),
        actions: Vec::new(),
        sections: DomainSections::default(),
        type_locations: DashMap::new(),
    };
    domain.type_inheritance.add_type(ROOT_TYPE);

    for section in tree.significant_children(define).filter(|node| node.is_bracket()) {
        let Some(keyword) = tree.name(section).map(str::to_ascii_lowercase) else {
            continue;
        };
        match keyword.as_str() {
            ":requirements" => {
                domain.sections.requirements = Some(section.span.clone());
                domain.requirements = tree
                    .arguments(section)
                    .into_iter()
                    .filter(|node| node.is_terminal())
                    .map(|node| tree.node_text(node).to_string())
                    .collect();
            }
            ":types" => {
                domain.sections.types = Some(section.span.clone());
                parse_types(&mut domain, document, tree, section, problems);
            }
            ":constants" => {
                domain.sections.constants = Some(section.span.clone());
                let entries = parse_typed_list(tree, &tree.arguments(section));
                domain.constants = TypeObjects::group(&entries);
            }
            ":predicates" => {
                domain.sections.predicates = Some(section.span.clone());
                domain.predicates =
                    parse_variables(tree, section, VariableKind::Predicate, document, problems);
            }
            ":functions" => {
                domain.sections.functions = Some(section.span.clone());
                domain.functions =
                    parse_variables(tree, section, VariableKind::Function, document, problems);
            }
            ":derived" => {
                domain.sections.derived.push(section.span.clone());
                if let Some(signature) = tree
                    .arguments(section)
                    .into_iter()
                    .find(|node| node.is_bracket())
                {
                    if let Some(variable) = variable_from_bracket(tree, signature, VariableKind::Derived)
                    {
                        domain.derived.push(variable);
                    }
                }
            }
            other => {
                if let Some(kind) = ActionKind::from_keyword(other) {
                    domain.actions.push(parse_action(tree, section, kind));
                }
            }
        }
    }

    Some(domain)
}

fn parse_types(
    domain: &mut DomainInfo,
    document: &Document,
    tree: &SyntaxTree,
    section: &SyntaxNode,
    problems: &mut Vec<ParsingProblem>,
) {
    let entries = parse_typed_list(tree, &tree.arguments(section));
    for entry in entries {
        push_unique(&mut domain.types, &entry.name);
        domain.type_inheritance.add_type(&entry.name);
        for parent in &entry.types {
            if !parent.eq_ignore_ascii_case(ROOT_TYPE) {
                push_unique(&mut domain.types, parent);
            }
            if !domain.type_inheritance.add_edge(&entry.name, parent) {
                problems.push(ParsingProblem::error(
                    format!(
                        "Type '{}' cannot inherit from '{}': the inheritance would be cyclic",
                        entry.name, parent
                    ),
                    document.range_of(entry.span.clone()),
                ));
            }
        }
    }
    // parents never declared themselves hang off the root
    for declared in domain.types.clone() {
        if domain.type_inheritance.get_parents(&declared).is_empty()
            && !declared.eq_ignore_ascii_case(ROOT_TYPE)
        {
            domain.type_inheritance.add_edge(&declared, ROOT_TYPE);
        }
    }
    domain.types.retain(|name| !name.eq_ignore_ascii_case(ROOT_TYPE));
}

fn push_unique(names: &mut Vec<String>, name: &str) {
    if !names.iter().any(|existing| existing.eq_ignore_ascii_case(name)) {
        names.push(name.to_string());
    }
}

fn parse_variables(
    tree: &SyntaxTree,
    section: &SyntaxNode,
    kind: VariableKind,
    document: &Document,
    problems: &mut Vec<ParsingProblem>,
) -> Vec<Variable> {
    let mut variables: Vec<Variable> = Vec::new();
    for node in tree.arguments(section).into_iter().filter(|node| node.is_bracket()) {
        let Some(variable) = variable_from_bracket(tree, node, kind) else {
            continue;
        };
        if variables.iter().any(|existing| existing.matches(&variable.name)) {
            problems.push(ParsingProblem::warning(
                format!(
                    "{} '{}' is declared more than once",
                    kind.label(),
                    variable.name
                ),
                document.range_of(node.span.clone()),
            ));
            continue;
        }
        variables.push(variable);
    }
    variables
}

fn variable_from_bracket(tree: &SyntaxTree, node: &SyntaxNode, kind: VariableKind) -> Option<Variable> {
    let name = tree.name(node)?.to_string();
    let parameters = to_parameters(parse_typed_list(tree, &tree.arguments(node)));
    let declared_name = normalize_whitespace(
        &tree
            .significant_children(node)
            .filter(|child| child.is_terminal())
            .map(|child| tree.node_text(child))
            .collect::<Vec<_>>()
            .join(" "),
    );
    let mut variable = Variable::new(name, declared_name, parameters, kind);
    variable.documentation = tree.documentation_before(node.span.start);
    Some(variable)
}

fn parse_action(tree: &SyntaxTree, section: &SyntaxNode, kind: ActionKind) -> Action {
    let arguments = tree.arguments(section);
    let name_node = arguments.first().filter(|node| node.is_terminal() && !tree.node_text(node).starts_with(':'));

    let mut action = Action {
        name: name_node
            .map(|node| tree.node_text(node).to_string())
            .unwrap_or_default(),
        kind,
        parameters: Vec::new(),
        span: section.span.clone(),
        name_span: name_node.map(|node| node.span.clone()),
        condition: None,
        effect: None,
        documentation: tree.documentation_before(section.span.start),
    };

    let mut iter = arguments.iter().peekable();
    while let Some(node) = iter.next() {
        if !node.is_terminal() {
            continue;
        }
        let keyword = tree.node_text(node).to_ascii_lowercase();
        let value = match iter.peek() {
            Some(next) if next.is_bracket() => *next,
            _ => continue,
        };
        match keyword.as_str() {
            ":parameters" => {
                let children: Vec<&SyntaxNode> = tree.significant_children(value).collect();
                action.parameters = to_parameters(parse_typed_list(tree, &children));
            }
            ":precondition" | ":condition" => action.condition = Some(value.span.clone()),
            ":effect" => action.effect = Some(value.span.clone()),
            _ => {}
        }
    }

    action
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> (Option<DomainInfo>, Vec<ParsingProblem>, Document) {
        let document = Document::new(text);
        let tree = SyntaxTree::build(text);
        let mut problems = Vec::new();
        let domain = try_domain(&document, &tree, &mut problems);
        (domain, problems, document)
    }

    const LOGISTICS: &str = r#"(define (domain logistics)
  (:requirements :strips :typing :fluents :made-up)
  (:types truck plane - vehicle
          loc)
  (:constants depot - loc)
  (:predicates
    ; vehicle location
    (at ?v - vehicle ?l - loc)
    (connected ?from ?to - loc))
  (:functions (fuel ?v - vehicle) - number
              (total-cost))
  (:action drive
    :parameters (?t - truck ?from ?to - loc)
    :precondition (and (at ?t ?from) (connected ?from ?to))
    :effect (and (not (at ?t ?from)) (at ?t ?to)))
  (:durative-action fly
    :parameters (?p - plane ?from ?to - loc)
    :duration (= ?duration 5)
    :condition (at start (at ?p ?from))
    :effect (at end (at ?p ?to)))
)"#;

    #[test]
    fn parses_domain_sections() {
        let (domain, problems, _) = parse(LOGISTICS);
        let domain = domain.unwrap();
        assert!(problems.is_empty(), "{:?}", problems);
        assert_eq!(domain.name, "logistics");
        assert!(domain.has_requirement(":made-up"));
        assert_eq!(domain.types, vec!["truck", "vehicle", "plane", "loc"]);
        assert_eq!(domain.constants[0].objects, vec!["depot"]);
        assert_eq!(domain.predicates.len(), 2);
        assert_eq!(domain.predicates[0].declared_name, "at ?v - vehicle ?l - loc");
        assert_eq!(domain.predicates[0].documentation.as_deref(), Some("vehicle location"));
        assert_eq!(
            domain.predicates[1].parameters.iter().map(|p| p.type_name.as_str()).collect::<Vec<_>>(),
            vec!["loc", "loc"]
        );
        assert_eq!(domain.functions.len(), 2);
        assert_eq!(domain.functions[1].name, "total-cost");

        let drive = domain.find_action("DRIVE").unwrap();
        assert_eq!(drive.kind, ActionKind::Instantaneous);
        assert_eq!(drive.parameters.len(), 3);
        assert!(drive.condition.is_some() && drive.effect.is_some());
        let fly = domain.find_action("fly").unwrap();
        assert_eq!(fly.kind, ActionKind::Durative);
        assert!(fly.condition.is_some());
    }

    #[test]
    fn builds_type_inheritance_from_groups() {
        let (domain, _, _) = parse("(define (domain d) (:types a b - c))");
        let domain = domain.unwrap();
        let edges = domain.type_inheritance.edges();
        assert!(edges.contains(&("a".to_string(), "c".to_string())));
        assert!(edges.contains(&("b".to_string(), "c".to_string())));
        assert_eq!(domain.get_types_inheriting_from("c"), vec!["a", "b"]);
        assert_eq!(domain.type_inheritance.get_parents("c"), vec!["object"]);
    }

    #[test]
    fn bare_type_list_inherits_from_object() {
        let (domain, _, _) = parse("(define (domain d) (:types a b))");
        let domain = domain.unwrap();
        assert_eq!(domain.get_types_inheriting_from("object"), vec!["a", "b"]);
    }

    #[test]
    fn domain_without_types_still_parses() {
        let (domain, problems, _) =
            parse("(define (domain d) (:predicates (p ?x)) (:action a :parameters () :effect (p)))");
        let domain = domain.unwrap();
        assert!(domain.types.is_empty());
        assert!(problems.is_empty());
        assert_eq!(domain.actions.len(), 1);
    }

    #[test]
    fn reports_cyclic_types() {
        let (_, problems, _) = parse("(define (domain d) (:types a - b b - a))");
        assert_eq!(problems.len(), 1);
        assert!(problems[0].message.contains("cyclic"));
    }

    #[test]
    fn not_a_domain() {
        let (domain, _, _) = parse("(define (problem p) (:domain d))");
        assert!(domain.is_none());
    }

    #[test]
    fn resolves_locations_lazily() {
        let (domain, _, document) = parse(LOGISTICS);
        let domain = domain.unwrap();
        let at = domain.find_variable("at").unwrap();
        assert!(!at.is_location_resolved());
        let range = domain.resolve_location(at, &document).unwrap();
        assert!(at.is_location_resolved());
        assert_eq!(range.start.line, 7);
        assert_eq!(range.start.character, 5);

        let loc = domain.resolve_type_location("loc", &document).unwrap();
        assert_eq!(loc.start.line, 3);
        let vehicle = domain.resolve_type_location("vehicle", &document).unwrap();
        assert_eq!(vehicle.start.line, 2);
    }

    #[test]
    fn tolerates_partial_text() {
        let (domain, _, _) = parse("(define (domain d)\n (:predicates (at ?x - lo");
        let domain = domain.unwrap();
        assert_eq!(domain.predicates.len(), 1);
        assert_eq!(domain.predicates[0].parameters[0].type_name, "lo");
    }
}
