//! Bracket-nesting syntax tree over raw PDDL text.
//!
//! The builder never fails: an unmatched `(` yields an open node whose span
//! runs to the end of the text, and a stray `)` becomes a terminal under the
//! document node. Comments (`;` to end of line) are kept as their own nodes so
//! that symbol scans can skip them.

use std::ops::Range as Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    OpenBracket,
    CloseBracket,
    Whitespace,
    Comment,
    /// `:types`, `:action`, ...
    Keyword,
    /// `?x`
    Parameter,
    /// A lone `-` (typing suffix or arithmetic minus).
    Dash,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span<usize>,
}

pub fn tokenize(text: &str) -> Vec<Token> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        let kind = match bytes[i] {
            b'(' => {
                i += 1;
                TokenKind::OpenBracket
            }
            b')' => {
                i += 1;
                TokenKind::CloseBracket
            }
            b';' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                if i > start && bytes[i - 1] == b'\r' {
                    i -= 1;
                }
                TokenKind::Comment
            }
            b if b.is_ascii_whitespace() => {
                while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                TokenKind::Whitespace
            }
            _ => {
                while i < bytes.len()
                    && !bytes[i].is_ascii_whitespace()
                    && !matches!(bytes[i], b'(' | b')' | b';')
                {
                    i += 1;
                }
                match &text[start..i] {
                    "-" => TokenKind::Dash,
                    word if word.starts_with(':') => TokenKind::Keyword,
                    word if word.starts_with('?') => TokenKind::Parameter,
                    _ => TokenKind::Other,
                }
            }
        };
        tokens.push(Token {
            kind,
            span: start..i,
        });
    }

    tokens
}

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Document,
    OpenBracket,
    Terminal(TokenKind),
    Comment,
}

#[derive(Debug, Clone)]
pub struct SyntaxNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub span: Span<usize>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// False for brackets left open at end of text.
    pub closed: bool,
}

impl SyntaxNode {
    pub fn is_bracket(&self) -> bool {
        self.kind == NodeKind::OpenBracket
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, NodeKind::Terminal(_))
    }
}

#[derive(Debug, Clone)]
pub struct SyntaxTree {
    text: String,
    nodes: Vec<SyntaxNode>,
}

impl SyntaxTree {
    pub fn build(text: &str) -> Self {
        let mut nodes = vec![SyntaxNode {
            id: 0,
            kind: NodeKind::Document,
            span: 0..text.len(),
            parent: None,
            children: Vec::new(),
            closed: true,
        }];
        let mut stack: Vec<NodeId> = vec![0];

        for token in tokenize(text) {
            let parent = *stack.last().unwrap_or(&0);
            match token.kind {
                TokenKind::Whitespace => {}
                TokenKind::OpenBracket => {
                    let id = nodes.len();
                    nodes.push(SyntaxNode {
                        id,
                        kind: NodeKind::OpenBracket,
                        span: token.span.start..text.len(),
                        parent: Some(parent),
                        children: Vec::new(),
                        closed: false,
                    });
                    nodes[parent].children.push(id);
                    stack.push(id);
                }
                TokenKind::CloseBracket if stack.len() > 1 => {
                    if let Some(id) = stack.pop() {
                        nodes[id].span.end = token.span.end;
                        nodes[id].closed = true;
                    }
                }
                kind => {
                    let id = nodes.len();
                    let node_kind = if kind == TokenKind::Comment {
                        NodeKind::Comment
                    } else {
                        NodeKind::Terminal(kind)
                    };
                    nodes.push(SyntaxNode {
                        id,
                        kind: node_kind,
                        span: token.span,
                        parent: Some(parent),
                        children: Vec::new(),
                        closed: true,
                    });
                    nodes[parent].children.push(id);
                }
            }
        }

        Self {
            text: text.to_string(),
            nodes,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn root(&self) -> &SyntaxNode {
        &self.nodes[0]
    }

    pub fn node(&self, id: NodeId) -> &SyntaxNode {
        &self.nodes[id]
    }

    pub fn node_text(&self, node: &SyntaxNode) -> &str {
        &self.text[node.span.clone()]
    }

    pub fn children<'a>(&'a self, node: &'a SyntaxNode) -> impl Iterator<Item = &'a SyntaxNode> + 'a {
        node.children.iter().map(move |id| &self.nodes[*id])
    }

    /// Children that take part in the PDDL structure (comments skipped).
    pub fn significant_children<'a>(
        &'a self,
        node: &'a SyntaxNode,
    ) -> impl Iterator<Item = &'a SyntaxNode> + 'a {
        self.children(node).filter(|child| child.kind != NodeKind::Comment)
    }

    /// The first terminal inside a bracket, e.g. `define` or `:types`.
    pub fn name_node<'a>(&'a self, node: &'a SyntaxNode) -> Option<&'a SyntaxNode> {
        if !node.is_bracket() {
            return None;
        }
        self.significant_children(node)
            .next()
            .filter(|child| child.is_terminal())
    }

    pub fn name(&self, node: &SyntaxNode) -> Option<&str> {
        self.name_node(node).map(|name| self.node_text(name))
    }

    pub fn has_name(&self, node: &SyntaxNode, name: &str) -> bool {
        self.name(node)
            .map(|actual| actual.eq_ignore_ascii_case(name))
            .unwrap_or(false)
    }

    /// Significant children following the bracket's name token.
    pub fn arguments<'a>(&'a self, node: &'a SyntaxNode) -> Vec<&'a SyntaxNode> {
        let mut children: Vec<&SyntaxNode> = self.significant_children(node).collect();
        if self.name_node(node).is_some() {
            children.remove(0);
        }
        children
    }

    /// First top-level `(define ...)` bracket.
    pub fn get_define_node(&self) -> Option<&SyntaxNode> {
        self.children(self.root())
            .find(|child| child.is_bracket() && self.has_name(child, "define"))
    }

    /// First bracket named `name` below `scope`, in document order.
    pub fn get_first_open_bracket<'a>(
        &'a self,
        scope: &'a SyntaxNode,
        name: &str,
    ) -> Option<&'a SyntaxNode> {
        for child in self.children(scope).filter(|child| child.is_bracket()) {
            if self.has_name(child, name) {
                return Some(child);
            }
            if let Some(found) = self.get_first_open_bracket(child, name) {
                return Some(found);
            }
        }
        None
    }

    /// The bracket whose name token starts at `offset`: `(at ?x)` for the
    /// offset of `at`.
    pub fn bracket_named_at(&self, offset: usize) -> Option<&SyntaxNode> {
        let bracket = self
            .get_breadcrumbs(offset)
            .into_iter()
            .rev()
            .find(|node| node.is_bracket())?;
        let name = self.name_node(bracket)?;
        (name.span.start == offset).then_some(bracket)
    }

    /// `(at start ..)`, `(at end ..)` and timed initial `(at 12 ..)`, where
    /// `at` is a keyword rather than a predicate.
    pub fn is_time_specifier(&self, node: &SyntaxNode) -> bool {
        if !self.has_name(node, "at") {
            return false;
        }
        let arguments = self.arguments(node);
        let leads_with_time = arguments
            .first()
            .filter(|first| first.is_terminal())
            .map(|first| {
                let word = self.node_text(first);
                word.eq_ignore_ascii_case("start")
                    || word.eq_ignore_ascii_case("end")
                    || word.parse::<f64>().is_ok()
            })
            .unwrap_or(false);
        leads_with_time || arguments.iter().any(|argument| argument.is_bracket())
    }

    /// Direct child brackets of `scope` named `name`.
    pub fn child_brackets_named<'a>(
        &'a self,
        scope: &'a SyntaxNode,
        name: &'a str,
    ) -> impl Iterator<Item = &'a SyntaxNode> + 'a {
        self.children(scope)
            .filter(move |child| child.is_bracket() && self.has_name(child, name))
    }

    /// Nodes enclosing `offset` from the document down to the innermost one.
    ///
    /// A bracket encloses offsets strictly after its `(` and up to (not past)
    /// its `)`; an unclosed bracket extends to the end of text. A terminal is
    /// included when the offset touches it.
    pub fn get_breadcrumbs(&self, offset: usize) -> Vec<&SyntaxNode> {
        let mut crumbs = vec![self.root()];
        let mut current = self.root();

        'descend: loop {
            for child in self.children(current) {
                let inside = match child.kind {
                    NodeKind::OpenBracket => {
                        child.span.start < offset
                            && (offset < child.span.end
                                || (!child.closed && offset <= child.span.end))
                    }
                    NodeKind::Terminal(_) | NodeKind::Comment => {
                        child.span.start <= offset && offset <= child.span.end
                    }
                    NodeKind::Document => false,
                };
                if inside {
                    crumbs.push(child);
                    if child.is_bracket() {
                        current = child;
                        continue 'descend;
                    }
                    break 'descend;
                }
            }
            break;
        }

        crumbs
    }

    /// Whether `offset` falls inside a `;` comment.
    pub fn is_in_comment(&self, offset: usize) -> bool {
        self.get_breadcrumbs(offset)
            .last()
            .map(|node| node.kind == NodeKind::Comment && offset > node.span.start)
            .unwrap_or(false)
    }

    /// Brackets that were never closed.
    pub fn unclosed_brackets(&self) -> impl Iterator<Item = &SyntaxNode> {
        self.nodes
            .iter()
            .filter(|node| node.is_bracket() && !node.closed)
    }

    /// `)` tokens without a matching `(`.
    pub fn stray_closing_brackets(&self) -> impl Iterator<Item = &SyntaxNode> {
        self.nodes
            .iter()
            .filter(|node| node.kind == NodeKind::Terminal(TokenKind::CloseBracket))
    }

    /// Comment lines directly above the line containing `offset`, joined,
    /// plus a trailing comment on that same line.
    pub fn documentation_before(&self, offset: usize) -> Option<String> {
        let line_start = self.text[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
        let line_end = self.text[offset..]
            .find('\n')
            .map(|i| offset + i)
            .unwrap_or(self.text.len());

        let mut lines = Vec::new();
        let mut cursor = line_start;
        while cursor > 0 {
            let prev_end = cursor - 1;
            let prev_start = self.text[..prev_end].rfind('\n').map(|i| i + 1).unwrap_or(0);
            let trimmed = self.text[prev_start..prev_end].trim();
            match trimmed.strip_prefix(';') {
                Some(comment) if !trimmed.starts_with(";;!") => {
                    lines.push(comment.trim_start_matches(';').trim().to_string());
                    cursor = prev_start;
                }
                _ => break,
            }
        }
        lines.reverse();

        let rest = &self.text[offset..line_end];
        if let Some(idx) = rest.find(';') {
            let trailing = rest[idx..].trim_start_matches(';').trim();
            if !trailing.is_empty() {
                lines.push(trailing.to_string());
            }
        }

        let doc = lines
            .into_iter()
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if doc.is_empty() {
            None
        } else {
            Some(doc)
        }
    }
}
