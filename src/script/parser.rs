//! Tree-sitter front end: parse script text and lower the CST into [`super::ast`]

use super::ast::*;
use crate::error::{PatchError, Result};
use std::cell::RefCell;
use std::sync::Arc;
use tree_sitter::{Node, Parser, Tree};

// ═══════════════════════════════════════════════════════════════════════════
//  THREAD-LOCAL PARSER POOL
// ═══════════════════════════════════════════════════════════════════════════

thread_local! {
    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // Ignore error here - will be caught at parse time if language fails
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });
}

fn parse_tree(text: &str, origin: &str) -> Result<Tree> {
    PYTHON_PARSER
        .with(|p| p.borrow_mut().parse(text, None))
        .ok_or_else(|| PatchError::Parse {
            origin: origin.to_string(),
            line: 1,
            message: "parser produced no tree".to_string(),
        })
}

/// Parse a whole module.
pub fn parse_module(text: &str, origin: &str) -> Result<Module> {
    let tree = parse_tree(text, origin)?;
    let root = tree.root_node();
    let lowerer = Lowerer::new(text, origin);
    if root.has_error() {
        return Err(lowerer.syntax_error_at(root));
    }
    let body = lowerer.block(root)?;
    Ok(Module { body })
}

/// Returns true if the text parses without syntax error nodes.
pub fn is_well_formed(text: &str) -> bool {
    parse_tree(text, "<check>")
        .map(|t| !t.root_node().has_error())
        .unwrap_or(false)
}

/// Top-level function definitions of a module, in source order.
pub fn top_level_functions(module: &Module) -> Vec<Arc<FunctionDef>> {
    module
        .body
        .iter()
        .filter_map(|s| match &s.kind {
            StmtKind::FunctionDef(def) => Some(def.clone()),
            _ => None,
        })
        .collect()
}

struct Lowerer<'s> {
    src: &'s str,
    origin: &'s str,
    lines: Vec<&'s str>,
}

fn named_children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor)
        .filter(|n| n.kind() != "comment")
        .collect()
}

fn all_children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children(&mut cursor)
        .filter(|n| n.kind() != "comment")
        .collect()
}

fn line_of(node: Node<'_>) -> usize {
    node.start_position().row + 1
}

impl<'s> Lowerer<'s> {
    fn new(src: &'s str, origin: &'s str) -> Self {
        Self {
            src,
            origin,
            lines: src.split_inclusive('\n').collect(),
        }
    }

    fn text(&self, node: Node<'_>) -> &'s str {
        &self.src[node.byte_range()]
    }

    fn error(&self, node: Node<'_>, message: impl Into<String>) -> PatchError {
        PatchError::Parse {
            origin: self.origin.to_string(),
            line: line_of(node),
            message: message.into(),
        }
    }

    fn syntax_error_at(&self, root: Node<'_>) -> PatchError {
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if node.is_error() || node.is_missing() {
                let snippet = crate::util::truncate(self.text(node).trim(), 40);
                return self.error(node, format!("invalid syntax near `{}`", snippet));
            }
            let mut children = all_children(node);
            children.reverse();
            stack.extend(children);
        }
        self.error(root, "invalid syntax")
    }

    fn field<'t>(&self, node: Node<'t>, name: &str) -> Result<Node<'t>> {
        node.child_by_field_name(name)
            .ok_or_else(|| self.error(node, format!("`{}` is missing `{}`", node.kind(), name)))
    }

    fn span(&self, node: Node<'_>) -> Span {
        let start = node.start_position().row;
        let mut end = node.end_position().row;
        if node.end_position().column == 0 && end > start {
            end -= 1;
        }
        let end = end.min(self.lines.len().saturating_sub(1));
        let lines = self.lines[start..=end]
            .iter()
            .map(|l| {
                if l.ends_with('\n') {
                    l.to_string()
                } else {
                    format!("{}\n", l)
                }
            })
            .collect();
        Span {
            start_line: start + 1,
            end_line: end + 1,
            lines,
        }
    }

    // ───────────────────────────────────────────────────────────────────
    //  Statements
    // ───────────────────────────────────────────────────────────────────

    fn block(&self, node: Node<'_>) -> Result<Vec<Stmt>> {
        let mut out = Vec::new();
        for child in named_children(node) {
            self.statement(child, &mut out)?;
        }
        Ok(out)
    }

    fn statement(&self, node: Node<'_>, out: &mut Vec<Stmt>) -> Result<()> {
        let line = line_of(node);
        let kind = match node.kind() {
            "expression_statement" => {
                let children = named_children(node);
                if children.len() == 1 {
                    let only = children[0];
                    match only.kind() {
                        "assignment" => self.assignment(only)?,
                        "augmented_assignment" => self.augmented(only)?,
                        _ => StmtKind::Expr(self.expr(only)?),
                    }
                } else {
                    let items = children
                        .into_iter()
                        .map(|c| self.expr(c))
                        .collect::<Result<Vec<_>>>()?;
                    StmtKind::Expr(Expr {
                        line,
                        kind: ExprKind::Tuple(items),
                    })
                }
            }
            "return_statement" => {
                let value = named_children(node)
                    .into_iter()
                    .next()
                    .map(|n| self.expr(n))
                    .transpose()?;
                StmtKind::Return(value)
            }
            "pass_statement" => StmtKind::Pass,
            "break_statement" => StmtKind::Break,
            "continue_statement" => StmtKind::Continue,
            "raise_statement" => {
                let value = named_children(node)
                    .into_iter()
                    .find(|n| node.child_by_field_name("cause") != Some(*n))
                    .map(|n| self.expr(n))
                    .transpose()?;
                StmtKind::Raise(value)
            }
            "assert_statement" => {
                let mut parts = named_children(node).into_iter();
                let test = match parts.next() {
                    Some(n) => self.expr(n)?,
                    None => return Err(self.error(node, "empty assert")),
                };
                let msg = parts.next().map(|n| self.expr(n)).transpose()?;
                StmtKind::Assert { test, msg }
            }
            "if_statement" => self.if_statement(node)?,
            "while_statement" => StmtKind::While {
                test: self.expr(self.field(node, "condition")?)?,
                body: self.block(self.field(node, "body")?)?,
                orelse: self.else_body(node)?,
            },
            "for_statement" => {
                if all_children(node).iter().any(|c| c.kind() == "async") {
                    return Err(self.error(node, "async for is not supported"));
                }
                StmtKind::For {
                    target: self.target(self.field(node, "left")?)?,
                    iter: self.expr(self.field(node, "right")?)?,
                    body: self.block(self.field(node, "body")?)?,
                    orelse: self.else_body(node)?,
                }
            }
            "try_statement" => self.try_statement(node)?,
            "with_statement" => self.with_statement(node)?,
            "function_definition" => StmtKind::FunctionDef(Arc::new(self.function(node, Vec::new())?)),
            "class_definition" => StmtKind::ClassDef(Arc::new(self.class(node, Vec::new())?)),
            "decorated_definition" => {
                let decorators = named_children(node)
                    .into_iter()
                    .filter(|n| n.kind() == "decorator")
                    .map(|d| self.decorator(d))
                    .collect::<Result<Vec<_>>>()?;
                let definition = self.field(node, "definition")?;
                match definition.kind() {
                    "function_definition" => {
                        StmtKind::FunctionDef(Arc::new(self.function(definition, decorators)?))
                    }
                    "class_definition" => {
                        StmtKind::ClassDef(Arc::new(self.class(definition, decorators)?))
                    }
                    other => return Err(self.error(node, format!("cannot decorate `{}`", other))),
                }
            }
            // Imports are resolved against builtins; the statement itself is a no-op.
            "import_statement" | "import_from_statement" | "future_import_statement" => {
                tracing::debug!(line, "ignoring import: {}", self.text(node).trim());
                StmtKind::Pass
            }
            other => {
                return Err(self.error(node, format!("unsupported statement `{}`", other)));
            }
        };
        out.push(Stmt { line, kind });
        Ok(())
    }

    fn assignment(&self, node: Node<'_>) -> Result<StmtKind> {
        let left = self.field(node, "left")?;
        if let Some(ty) = node.child_by_field_name("type") {
            let value = node
                .child_by_field_name("right")
                .map(|r| self.expr(r))
                .transpose()?;
            return Ok(StmtKind::AnnAssign {
                target: self.target(left)?,
                annotation: self.annotation(ty)?,
                value,
            });
        }
        let mut targets = vec![self.target(left)?];
        let mut right = self.field(node, "right")?;
        // `a = b = value` nests assignments on the right-hand side.
        while right.kind() == "assignment" {
            targets.push(self.target(self.field(right, "left")?)?);
            right = self.field(right, "right")?;
        }
        Ok(StmtKind::Assign {
            targets,
            value: self.expr(right)?,
        })
    }

    fn augmented(&self, node: Node<'_>) -> Result<StmtKind> {
        let op_node = self.field(node, "operator")?;
        let op = BinOp::from_token(self.text(op_node))
            .ok_or_else(|| self.error(node, format!("unknown operator `{}`", self.text(op_node))))?;
        Ok(StmtKind::AugAssign {
            target: self.target(self.field(node, "left")?)?,
            op,
            value: self.expr(self.field(node, "right")?)?,
        })
    }

    fn if_statement(&self, node: Node<'_>) -> Result<StmtKind> {
        let mut branches = vec![(
            self.expr(self.field(node, "condition")?)?,
            self.block(self.field(node, "consequence")?)?,
        )];
        let mut orelse = Vec::new();
        let mut cursor = node.walk();
        let alternatives: Vec<Node<'_>> = node.children_by_field_name("alternative", &mut cursor).collect();
        for alt in alternatives {
            match alt.kind() {
                "elif_clause" => branches.push((
                    self.expr(self.field(alt, "condition")?)?,
                    self.block(self.field(alt, "consequence")?)?,
                )),
                "else_clause" => orelse = self.block(self.field(alt, "body")?)?,
                _ => {}
            }
        }
        Ok(StmtKind::If { branches, orelse })
    }

    fn else_body(&self, node: Node<'_>) -> Result<Vec<Stmt>> {
        match node.child_by_field_name("alternative") {
            Some(alt) => self.block(self.field(alt, "body")?),
            None => Ok(Vec::new()),
        }
    }

    fn try_statement(&self, node: Node<'_>) -> Result<StmtKind> {
        let body = self.block(self.field(node, "body")?)?;
        let mut handlers = Vec::new();
        let mut orelse = Vec::new();
        let mut finally = Vec::new();
        for child in named_children(node) {
            match child.kind() {
                "except_clause" => handlers.push(self.except_clause(child)?),
                "else_clause" => orelse = self.block(self.field(child, "body")?)?,
                "finally_clause" => {
                    if let Some(block) = named_children(child).into_iter().find(|c| c.kind() == "block") {
                        finally = self.block(block)?;
                    }
                }
                "except_group_clause" => {
                    return Err(self.error(child, "except* is not supported"));
                }
                _ => {}
            }
        }
        Ok(StmtKind::Try {
            body,
            handlers,
            orelse,
            finally,
        })
    }

    fn except_clause(&self, node: Node<'_>) -> Result<ExceptHandler> {
        let mut kind = None;
        let mut alias = None;
        let mut body = Vec::new();
        let mut exprs = Vec::new();
        for child in named_children(node) {
            match child.kind() {
                "block" => body = self.block(child)?,
                "as_pattern" => {
                    if let Some(first) = named_children(child).into_iter().next() {
                        kind = Some(self.expr(first)?);
                    }
                    if let Some(target) = child.child_by_field_name("alias") {
                        alias = Some(self.text(target).trim().to_string());
                    }
                }
                _ => exprs.push(child),
            }
        }
        if kind.is_none() {
            if let Some(first) = exprs.first() {
                kind = Some(self.expr(*first)?);
            }
            if let Some(second) = exprs.get(1) {
                alias = Some(self.text(*second).trim().to_string());
            }
        }
        Ok(ExceptHandler { kind, alias, body })
    }

    fn with_statement(&self, node: Node<'_>) -> Result<StmtKind> {
        let body = self.block(self.field(node, "body")?)?;
        let clause = named_children(node)
            .into_iter()
            .find(|c| c.kind() == "with_clause")
            .ok_or_else(|| self.error(node, "with statement without items"))?;
        let items = named_children(clause);
        if items.len() != 1 {
            return Err(self.error(node, "only single-item with statements are supported"));
        }
        let value = self.field(items[0], "value")?;
        let (context, alias) = if value.kind() == "as_pattern" {
            let inner = named_children(value)
                .into_iter()
                .next()
                .ok_or_else(|| self.error(value, "empty with item"))?;
            let alias = match value.child_by_field_name("alias") {
                Some(a) => {
                    let target = named_children(a).into_iter().next().unwrap_or(a);
                    Some(self.target(target)?)
                }
                None => None,
            };
            (self.expr(inner)?, alias)
        } else {
            (self.expr(value)?, None)
        };
        Ok(StmtKind::With {
            context,
            alias,
            body,
        })
    }

    fn decorator(&self, node: Node<'_>) -> Result<Decorator> {
        let expr_node = named_children(node)
            .into_iter()
            .next()
            .ok_or_else(|| self.error(node, "empty decorator"))?;
        Ok(Decorator {
            text: self.text(expr_node).trim().to_string(),
            expr: self.expr(expr_node)?,
        })
    }

    fn function(&self, node: Node<'_>, decorators: Vec<Decorator>) -> Result<FunctionDef> {
        if all_children(node).iter().any(|c| c.kind() == "async") {
            return Err(self.error(node, "async functions are not supported"));
        }
        let name = self.text(self.field(node, "name")?).to_string();
        let params = self.parameters(self.field(node, "parameters")?)?;
        let returns = node
            .child_by_field_name("return_type")
            .map(|r| self.annotation(r))
            .transpose()?;
        let body_node = self.field(node, "body")?;
        let body = self.block(body_node)?;
        Ok(FunctionDef {
            name,
            params,
            returns,
            docstring: docstring_of(&body),
            body,
            decorators,
            span: self.span(node),
        })
    }

    fn class(&self, node: Node<'_>, decorators: Vec<Decorator>) -> Result<ClassDef> {
        let name = self.text(self.field(node, "name")?).to_string();
        let mut bases = Vec::new();
        if let Some(args) = node.child_by_field_name("superclasses") {
            for arg in named_children(args) {
                if arg.kind() == "keyword_argument" {
                    continue;
                }
                bases.push(self.expr(arg)?);
            }
        }
        let body = self.block(self.field(node, "body")?)?;
        Ok(ClassDef {
            name,
            bases,
            docstring: docstring_of(&body),
            body,
            decorators,
            span: self.span(node),
        })
    }

    fn parameters(&self, node: Node<'_>) -> Result<Vec<Param>> {
        let mut params = Vec::new();
        let mut keyword_only = false;
        for child in named_children(node) {
            let base_kind = if keyword_only {
                ParamKind::KeywordOnly
            } else {
                ParamKind::Positional
            };
            let param = match child.kind() {
                "identifier" => Param {
                    name: self.text(child).to_string(),
                    kind: base_kind,
                    annotation: None,
                    default: None,
                    default_text: None,
                },
                "default_parameter" | "typed_default_parameter" => {
                    let value = self.field(child, "value")?;
                    Param {
                        name: self.text(self.field(child, "name")?).to_string(),
                        kind: base_kind,
                        annotation: child
                            .child_by_field_name("type")
                            .map(|t| self.annotation(t))
                            .transpose()?,
                        default: Some(self.expr(value)?),
                        default_text: Some(self.text(value).to_string()),
                    }
                }
                "typed_parameter" => {
                    let inner = named_children(child)
                        .into_iter()
                        .next()
                        .ok_or_else(|| self.error(child, "typed parameter without a name"))?;
                    let (name, kind) = self.splat_name(inner, base_kind);
                    if kind == ParamKind::VarArgs {
                        keyword_only = true;
                    }
                    Param {
                        name,
                        kind,
                        annotation: Some(self.annotation(self.field(child, "type")?)?),
                        default: None,
                        default_text: None,
                    }
                }
                "list_splat_pattern" | "dictionary_splat_pattern" => {
                    let (name, kind) = self.splat_name(child, base_kind);
                    if kind == ParamKind::VarArgs {
                        keyword_only = true;
                    }
                    Param {
                        name,
                        kind,
                        annotation: None,
                        default: None,
                        default_text: None,
                    }
                }
                "keyword_separator" => {
                    keyword_only = true;
                    continue;
                }
                "positional_separator" => continue,
                other => {
                    return Err(self.error(child, format!("unsupported parameter `{}`", other)));
                }
            };
            params.push(param);
        }
        Ok(params)
    }

    fn splat_name(&self, node: Node<'_>, base_kind: ParamKind) -> (String, ParamKind) {
        let name = self
            .text(node)
            .trim_start_matches('*')
            .trim()
            .to_string();
        let kind = match node.kind() {
            "list_splat_pattern" => ParamKind::VarArgs,
            "dictionary_splat_pattern" => ParamKind::KwArgs,
            _ => base_kind,
        };
        (name, kind)
    }

    // ───────────────────────────────────────────────────────────────────
    //  Types
    // ───────────────────────────────────────────────────────────────────

    fn annotation(&self, node: Node<'_>) -> Result<Annotation> {
        Ok(Annotation {
            text: self.text(node).trim().to_string(),
            expr: self.type_expr(node),
        })
    }

    fn type_expr(&self, node: Node<'_>) -> TypeExpr {
        match node.kind() {
            "type" | "parenthesized_expression" => match named_children(node).as_slice() {
                [only] => self.type_expr(*only),
                _ => TypeExpr::Opaque(self.text(node).to_string()),
            },
            "identifier" => TypeExpr::Name(self.text(node).to_string()),
            "none" => TypeExpr::None,
            "attribute" | "member_type" => TypeExpr::Dotted(self.text(node).to_string()),
            "subscript" => {
                let base = match node.child_by_field_name("value") {
                    Some(v) => self.type_expr(v),
                    None => return TypeExpr::Opaque(self.text(node).to_string()),
                };
                let mut cursor = node.walk();
                let subs: Vec<Node<'_>> = node.children_by_field_name("subscript", &mut cursor).collect();
                let mut args = Vec::new();
                for sub in subs {
                    if sub.kind() == "tuple" {
                        args.extend(named_children(sub).into_iter().map(|n| self.type_expr(n)));
                    } else {
                        args.push(self.type_expr(sub));
                    }
                }
                TypeExpr::Generic {
                    base: Box::new(base),
                    args,
                }
            }
            "generic_type" => {
                let children = named_children(node);
                let base = children
                    .first()
                    .map(|n| self.type_expr(*n))
                    .unwrap_or_else(|| TypeExpr::Opaque(self.text(node).to_string()));
                let args = children
                    .iter()
                    .filter(|n| n.kind() == "type_parameter")
                    .flat_map(|p| named_children(*p))
                    .map(|n| self.type_expr(n))
                    .collect();
                TypeExpr::Generic {
                    base: Box::new(base),
                    args,
                }
            }
            "union_type" => {
                let mut members = Vec::new();
                for child in named_children(node) {
                    match self.type_expr(child) {
                        TypeExpr::Union(inner) => members.extend(inner),
                        other => members.push(other),
                    }
                }
                TypeExpr::Union(members)
            }
            "binary_operator" => {
                let is_union = node
                    .child_by_field_name("operator")
                    .map(|op| self.text(op) == "|")
                    .unwrap_or(false);
                if !is_union {
                    return TypeExpr::Opaque(self.text(node).to_string());
                }
                let mut members = Vec::new();
                for side in ["left", "right"] {
                    if let Some(child) = node.child_by_field_name(side) {
                        match self.type_expr(child) {
                            TypeExpr::Union(inner) => members.extend(inner),
                            other => members.push(other),
                        }
                    }
                }
                TypeExpr::Union(members)
            }
            "string" => {
                // Forward reference: "Token"
                let raw = self.text(node).trim_matches(|c| c == '"' || c == '\'');
                if !raw.is_empty() && raw.chars().all(|c| c.is_alphanumeric() || c == '_') {
                    TypeExpr::Name(raw.to_string())
                } else {
                    TypeExpr::Opaque(raw.to_string())
                }
            }
            _ => TypeExpr::Opaque(self.text(node).to_string()),
        }
    }

    // ───────────────────────────────────────────────────────────────────
    //  Targets
    // ───────────────────────────────────────────────────────────────────

    fn target(&self, node: Node<'_>) -> Result<Target> {
        Ok(match node.kind() {
            "identifier" | "keyword_identifier" => Target::Name(self.text(node).to_string()),
            "attribute" => Target::Attribute(
                self.expr(self.field(node, "object")?)?,
                self.text(self.field(node, "attribute")?).to_string(),
            ),
            "subscript" => Target::Subscript(
                self.expr(self.field(node, "value")?)?,
                self.subscript_index(node)?,
            ),
            "pattern_list" | "tuple_pattern" | "list_pattern" | "expression_list" | "tuple" | "list" => {
                Target::Tuple(
                    named_children(node)
                        .into_iter()
                        .map(|n| self.target(n))
                        .collect::<Result<Vec<_>>>()?,
                )
            }
            "parenthesized_expression" => match named_children(node).as_slice() {
                [inner] => self.target(*inner)?,
                _ => return Err(self.error(node, "invalid assignment target")),
            },
            other => return Err(self.error(node, format!("cannot assign to `{}`", other))),
        })
    }

    // ───────────────────────────────────────────────────────────────────
    //  Expressions
    // ───────────────────────────────────────────────────────────────────

    fn boxed(&self, node: Node<'_>) -> Result<Box<Expr>> {
        Ok(Box::new(self.expr(node)?))
    }

    fn exprs(&self, nodes: Vec<Node<'_>>) -> Result<Vec<Expr>> {
        nodes.into_iter().map(|n| self.expr(n)).collect()
    }

    fn expr(&self, node: Node<'_>) -> Result<Expr> {
        let line = line_of(node);
        let kind = match node.kind() {
            "identifier" | "keyword_identifier" => ExprKind::Name(self.text(node).to_string()),
            "integer" => ExprKind::Int(self.integer(node)?),
            "float" => {
                let cleaned = self.text(node).replace('_', "");
                ExprKind::Float(
                    cleaned
                        .parse()
                        .map_err(|_| self.error(node, format!("invalid float `{}`", cleaned)))?,
                )
            }
            "true" => ExprKind::Bool(true),
            "false" => ExprKind::Bool(false),
            "none" => ExprKind::None,
            "ellipsis" => ExprKind::Ellipsis,
            "string" => self.string(node)?,
            "concatenated_string" => {
                let mut parts = Vec::new();
                for piece in named_children(node) {
                    match self.string(piece)? {
                        ExprKind::Str(s) => parts.push(FStringPart::Literal(s)),
                        ExprKind::FString(inner) => parts.extend(inner),
                        _ => {}
                    }
                }
                collapse_fstring(parts)
            }
            "parenthesized_expression" => match named_children(node).as_slice() {
                [inner] => return self.expr(*inner),
                _ => return Err(self.error(node, "empty parentheses")),
            },
            "binary_operator" => {
                let op_node = self.field(node, "operator")?;
                let op = BinOp::from_token(self.text(op_node))
                    .ok_or_else(|| self.error(node, format!("unknown operator `{}`", self.text(op_node))))?;
                ExprKind::Binary {
                    op,
                    left: self.boxed(self.field(node, "left")?)?,
                    right: self.boxed(self.field(node, "right")?)?,
                }
            }
            "unary_operator" => {
                let op = match self.text(self.field(node, "operator")?) {
                    "-" => UnaryOp::Neg,
                    "+" => UnaryOp::Pos,
                    "~" => UnaryOp::Invert,
                    other => return Err(self.error(node, format!("unknown unary `{}`", other))),
                };
                ExprKind::Unary {
                    op,
                    operand: self.boxed(self.field(node, "argument")?)?,
                }
            }
            "not_operator" => ExprKind::Unary {
                op: UnaryOp::Not,
                operand: self.boxed(self.field(node, "argument")?)?,
            },
            "boolean_operator" => ExprKind::BoolOp {
                and: self.text(self.field(node, "operator")?) == "and",
                left: self.boxed(self.field(node, "left")?)?,
                right: self.boxed(self.field(node, "right")?)?,
            },
            "comparison_operator" => self.comparison(node)?,
            "conditional_expression" => match named_children(node).as_slice() {
                [body, test, orelse] => ExprKind::Conditional {
                    body: self.boxed(*body)?,
                    test: self.boxed(*test)?,
                    orelse: self.boxed(*orelse)?,
                },
                _ => return Err(self.error(node, "malformed conditional expression")),
            },
            "call" => {
                let func = self.boxed(self.field(node, "function")?)?;
                let arguments = self.field(node, "arguments")?;
                let args = if arguments.kind() == "generator_expression" {
                    vec![Arg::Positional(self.expr(arguments)?)]
                } else {
                    self.arguments(arguments)?
                };
                ExprKind::Call { func, args }
            }
            "attribute" => ExprKind::Attribute {
                value: self.boxed(self.field(node, "object")?)?,
                attr: self.text(self.field(node, "attribute")?).to_string(),
            },
            "subscript" => ExprKind::Subscript {
                value: self.boxed(self.field(node, "value")?)?,
                index: Box::new(self.subscript_index(node)?),
            },
            "slice" => self.slice(node)?,
            "list" => ExprKind::List(self.exprs(named_children(node))?),
            "tuple" | "expression_list" | "pattern_list" => ExprKind::Tuple(self.exprs(named_children(node))?),
            "set" => ExprKind::Set(self.exprs(named_children(node))?),
            "dictionary" => {
                let mut pairs = Vec::new();
                for pair in named_children(node) {
                    if pair.kind() != "pair" {
                        return Err(self.error(pair, "dictionary unpacking is not supported"));
                    }
                    pairs.push((
                        self.expr(self.field(pair, "key")?)?,
                        self.expr(self.field(pair, "value")?)?,
                    ));
                }
                ExprKind::Dict(pairs)
            }
            "list_comprehension" | "generator_expression" | "set_comprehension" => {
                let element = self.boxed(self.field(node, "body")?)?;
                let clauses = self.comp_clauses(node)?;
                let comp = ExprKind::ListComp { element, clauses };
                if node.kind() == "set_comprehension" {
                    ExprKind::Call {
                        func: Box::new(Expr {
                            line,
                            kind: ExprKind::Name("set".to_string()),
                        }),
                        args: vec![Arg::Positional(Expr { line, kind: comp })],
                    }
                } else {
                    comp
                }
            }
            "dictionary_comprehension" => {
                let pair = self.field(node, "body")?;
                ExprKind::DictComp {
                    key: self.boxed(self.field(pair, "key")?)?,
                    value: self.boxed(self.field(pair, "value")?)?,
                    clauses: self.comp_clauses(node)?,
                }
            }
            "lambda" => {
                let params = match node.child_by_field_name("parameters") {
                    Some(p) => self.parameters(p)?,
                    None => Vec::new(),
                };
                let body_expr = self.expr(self.field(node, "body")?)?;
                ExprKind::Lambda(Arc::new(FunctionDef {
                    name: "<lambda>".to_string(),
                    params,
                    returns: None,
                    body: vec![Stmt {
                        line,
                        kind: StmtKind::Return(Some(body_expr)),
                    }],
                    docstring: None,
                    decorators: Vec::new(),
                    span: self.span(node),
                }))
            }
            other => return Err(self.error(node, format!("unsupported expression `{}`", other))),
        };
        Ok(Expr { line, kind })
    }

    fn integer(&self, node: Node<'_>) -> Result<i64> {
        let raw = self.text(node).replace('_', "").to_lowercase();
        let raw = raw.trim_end_matches('l');
        let parsed = if let Some(hex) = raw.strip_prefix("0x") {
            i64::from_str_radix(hex, 16)
        } else if let Some(oct) = raw.strip_prefix("0o") {
            i64::from_str_radix(oct, 8)
        } else if let Some(bin) = raw.strip_prefix("0b") {
            i64::from_str_radix(bin, 2)
        } else {
            raw.parse()
        };
        parsed.map_err(|_| self.error(node, format!("integer literal `{}` out of range", raw)))
    }

    fn comparison(&self, node: Node<'_>) -> Result<ExprKind> {
        let mut operands = Vec::new();
        let mut ops = Vec::new();
        let mut pending_not = false;
        let mut pending_is = false;
        for child in all_children(node) {
            if child.is_named() && !matches!(child.kind(), "not in" | "is not") {
                operands.push(self.expr(child)?);
                continue;
            }
            let token = self.text(child).trim();
            match token {
                "not" if !pending_is => pending_not = true,
                "not" => {
                    ops.push(CmpOp::IsNot);
                    pending_is = false;
                }
                "is" => pending_is = true,
                "in" if pending_not => {
                    ops.push(CmpOp::NotIn);
                    pending_not = false;
                }
                _ => {
                    if pending_is {
                        ops.push(CmpOp::Is);
                        pending_is = false;
                    }
                    let op = CmpOp::from_token(token)
                        .ok_or_else(|| self.error(child, format!("unknown comparison `{}`", token)))?;
                    ops.push(op);
                }
            }
        }
        if pending_is {
            // `a is b`: the operand after `is` already closed the token run
            ops.push(CmpOp::Is);
        }
        if operands.len() != ops.len() + 1 || operands.is_empty() {
            return Err(self.error(node, "malformed comparison"));
        }
        let mut operands = operands.into_iter();
        let first = Box::new(operands.next().ok_or_else(|| self.error(node, "malformed comparison"))?);
        Ok(ExprKind::Compare {
            first,
            rest: ops.into_iter().zip(operands).collect(),
        })
    }

    fn arguments(&self, node: Node<'_>) -> Result<Vec<Arg>> {
        let mut args = Vec::new();
        for child in named_children(node) {
            let arg = match child.kind() {
                "keyword_argument" => Arg::Keyword(
                    self.text(self.field(child, "name")?).to_string(),
                    self.expr(self.field(child, "value")?)?,
                ),
                "list_splat" => Arg::Star(self.first_named_expr(child)?),
                "dictionary_splat" => Arg::DoubleStar(self.first_named_expr(child)?),
                _ => Arg::Positional(self.expr(child)?),
            };
            args.push(arg);
        }
        Ok(args)
    }

    fn first_named_expr(&self, node: Node<'_>) -> Result<Expr> {
        let inner = named_children(node)
            .into_iter()
            .next()
            .ok_or_else(|| self.error(node, "empty splat"))?;
        self.expr(inner)
    }

    fn subscript_index(&self, node: Node<'_>) -> Result<Expr> {
        let mut cursor = node.walk();
        let subs: Vec<Node<'_>> = node.children_by_field_name("subscript", &mut cursor).collect();
        match subs.as_slice() {
            [single] => self.expr(*single),
            [] => Err(self.error(node, "empty subscript")),
            many => Ok(Expr {
                line: line_of(node),
                kind: ExprKind::Tuple(self.exprs(many.to_vec())?),
            }),
        }
    }

    fn slice(&self, node: Node<'_>) -> Result<ExprKind> {
        let mut parts: [Option<Box<Expr>>; 3] = [None, None, None];
        let mut slot = 0;
        for child in all_children(node) {
            if !child.is_named() {
                if self.text(child) == ":" {
                    slot += 1;
                }
                continue;
            }
            if slot < 3 {
                parts[slot] = Some(self.boxed(child)?);
            }
        }
        let [lower, upper, step] = parts;
        Ok(ExprKind::Slice { lower, upper, step })
    }

    fn comp_clauses(&self, node: Node<'_>) -> Result<Vec<CompClause>> {
        let mut clauses = Vec::new();
        for child in named_children(node) {
            match child.kind() {
                "for_in_clause" => clauses.push(CompClause::For {
                    target: self.target(self.field(child, "left")?)?,
                    iter: self.expr(self.field(child, "right")?)?,
                }),
                "if_clause" => clauses.push(CompClause::If(self.first_named_expr(child)?)),
                _ => {}
            }
        }
        Ok(clauses)
    }

    fn string(&self, node: Node<'_>) -> Result<ExprKind> {
        let mut prefix = String::new();
        let mut parts = Vec::new();
        for child in all_children(node) {
            match child.kind() {
                "string_start" => {
                    prefix = self
                        .text(child)
                        .trim_end_matches(['"', '\''])
                        .to_lowercase();
                }
                "string_content" => {
                    let raw = self.text(child);
                    let text = if prefix.contains('r') {
                        raw.to_string()
                    } else {
                        unescape(raw)
                    };
                    parts.push(FStringPart::Literal(text));
                }
                "escape_sequence" => parts.push(FStringPart::Literal(unescape(self.text(child)))),
                "interpolation" => {
                    let expr_node = match child.child_by_field_name("expression") {
                        Some(e) => e,
                        None => named_children(child)
                            .into_iter()
                            .next()
                            .ok_or_else(|| self.error(child, "empty f-string field"))?,
                    };
                    let spec = named_children(child)
                        .into_iter()
                        .find(|c| c.kind() == "format_specifier")
                        .map(|s| self.text(s).trim_start_matches(':').to_string());
                    parts.push(FStringPart::Field {
                        expr: self.expr(expr_node)?,
                        spec,
                    });
                }
                _ => {}
            }
        }
        if prefix.contains('f') {
            Ok(collapse_fstring(parts))
        } else {
            let mut text = String::new();
            for part in parts {
                if let FStringPart::Literal(s) = part {
                    text.push_str(&s);
                }
            }
            Ok(ExprKind::Str(text))
        }
    }
}

fn collapse_fstring(parts: Vec<FStringPart>) -> ExprKind {
    if parts.iter().all(|p| matches!(p, FStringPart::Literal(_))) {
        let mut text = String::new();
        for part in parts {
            if let FStringPart::Literal(s) = part {
                text.push_str(&s);
            }
        }
        ExprKind::Str(text)
    } else {
        ExprKind::FString(parts)
    }
}

/// First-statement string literal, cleaned the way `inspect.cleandoc` would.
fn docstring_of(body: &[Stmt]) -> Option<String> {
    let first = body.first()?;
    let StmtKind::Expr(Expr {
        kind: ExprKind::Str(raw),
        ..
    }) = &first.kind
    else {
        return None;
    };
    let mut lines = raw.lines();
    let head = lines.next().unwrap_or("").trim().to_string();
    let rest: Vec<&str> = lines.collect();
    let indent = rest
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    let mut out = vec![head];
    for line in rest {
        out.push(line.get(indent..).unwrap_or("").trim_end().to_string());
    }
    while out.last().map(|l| l.is_empty()).unwrap_or(false) {
        out.pop();
    }
    while out.first().map(|l| l.is_empty()).unwrap_or(false) {
        out.remove(0);
    }
    Some(out.join("\n"))
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('\n') => {}
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn only_function(src: &str) -> Arc<FunctionDef> {
        let module = parse_module(src, "<test>").unwrap();
        top_level_functions(&module).remove(0)
    }

    #[test]
    fn test_function_span_and_docstring() {
        let src = "x = 1\n\ndef add(a: int, b: int = 2) -> int:\n    \"\"\"Add two numbers.\"\"\"\n    return a + b\n\ny = 2\n";
        let def = only_function(src);
        assert_eq!(def.name, "add");
        assert_eq!(def.span.start_line, 3);
        assert_eq!(def.span.end_line, 5);
        assert_eq!(def.span.lines.len(), 3);
        assert_eq!(def.docstring.as_deref(), Some("Add two numbers."));
        assert_eq!(def.signature(), "add(a: int, b: int = 2) -> int");
    }

    #[test]
    fn test_parameter_kinds() {
        let def = only_function("def f(a, b=1, *rest, key, **opts):\n    pass\n");
        let kinds: Vec<ParamKind> = def.params.iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ParamKind::Positional,
                ParamKind::Positional,
                ParamKind::VarArgs,
                ParamKind::KeywordOnly,
                ParamKind::KwArgs
            ]
        );
        assert_eq!(def.params[2].name, "rest");
        assert_eq!(def.params[4].name, "opts");
    }

    #[test]
    fn test_union_and_generic_annotations() {
        let def = only_function("def f(items: list[Token], maybe: Token | None):\n    pass\n");
        let first = def.params[0].annotation.as_ref().unwrap();
        assert_eq!(first.text, "list[Token]");
        match &first.expr {
            TypeExpr::Generic { base, args } => {
                assert_eq!(**base, TypeExpr::Name("list".into()));
                assert_eq!(args, &vec![TypeExpr::Name("Token".into())]);
            }
            other => panic!("expected generic, got {:?}", other),
        }
        let second = def.params[1].annotation.as_ref().unwrap();
        assert_eq!(
            second.expr,
            TypeExpr::Union(vec![TypeExpr::Name("Token".into()), TypeExpr::None])
        );
    }

    #[test]
    fn test_decorated_definition_keeps_def_span() {
        let src = "@trace\ndef f():\n    return 1\n";
        let def = only_function(src);
        assert_eq!(def.decorators.len(), 1);
        assert_eq!(def.decorators[0].text, "trace");
        assert_eq!(def.span.start_line, 2);
    }

    #[test]
    fn test_syntax_error_reports_line() {
        let err = parse_module("def f(:\n    pass\n", "<bad>").unwrap_err();
        assert!(matches!(err, PatchError::Parse { .. }));
    }

    #[test]
    fn test_imports_are_ignored() {
        let module = parse_module("from dataclasses import dataclass\nimport math\n", "<m>").unwrap();
        assert!(module.body.iter().all(|s| matches!(s.kind, StmtKind::Pass)));
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(r"a\nb\t\\"), "a\nb\t\\");
        assert_eq!(unescape(r"\d"), "\\d");
    }
}
