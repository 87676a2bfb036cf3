//! Owned syntax tree for the script subset
//!
//! Lowered from the tree-sitter CST so the interpreter never touches
//! parser lifetimes. Every statement and definition keeps its 1-based line.

use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Module {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub line: usize,
    pub kind: StmtKind,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Expr(Expr),
    Assign {
        targets: Vec<Target>,
        value: Expr,
    },
    AnnAssign {
        target: Target,
        annotation: Annotation,
        value: Option<Expr>,
    },
    AugAssign {
        target: Target,
        op: BinOp,
        value: Expr,
    },
    Return(Option<Expr>),
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        orelse: Vec<Stmt>,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    For {
        target: Target,
        iter: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    Break,
    Continue,
    Pass,
    Raise(Option<Expr>),
    Try {
        body: Vec<Stmt>,
        handlers: Vec<ExceptHandler>,
        orelse: Vec<Stmt>,
        finally: Vec<Stmt>,
    },
    Assert {
        test: Expr,
        msg: Option<Expr>,
    },
    With {
        context: Expr,
        alias: Option<Target>,
        body: Vec<Stmt>,
    },
    FunctionDef(Arc<FunctionDef>),
    ClassDef(Arc<ClassDef>),
}

#[derive(Debug, Clone)]
pub struct ExceptHandler {
    pub kind: Option<Expr>,
    pub alias: Option<String>,
    pub body: Vec<Stmt>,
}

/// Assignment target
#[derive(Debug, Clone)]
pub enum Target {
    Name(String),
    Attribute(Expr, String),
    Subscript(Expr, Expr),
    Tuple(Vec<Target>),
}

/// Line range plus the verbatim lines it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub start_line: usize,
    pub end_line: usize,
    /// Full source lines (first line included from column 0), newline-terminated.
    pub lines: Vec<String>,
}

impl Span {
    pub fn text(&self) -> String {
        self.lines.concat()
    }
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub returns: Option<Annotation>,
    pub body: Vec<Stmt>,
    pub docstring: Option<String>,
    pub decorators: Vec<Decorator>,
    pub span: Span,
}

impl FunctionDef {
    /// Render `name(a: int, b=2, *rest) -> str`.
    pub fn signature(&self) -> String {
        let mut params: Vec<String> = Vec::with_capacity(self.params.len() + 1);
        let mut starred = false;
        for param in &self.params {
            match param.kind {
                ParamKind::VarArgs => starred = true,
                ParamKind::KeywordOnly if !starred => {
                    params.push("*".to_string());
                    starred = true;
                }
                _ => {}
            }
            params.push(param.to_string());
        }
        match &self.returns {
            Some(ret) => format!("{}({}) -> {}", self.name, params.join(", "), ret.text),
            None => format!("{}({})", self.name, params.join(", ")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Decorator {
    /// Source text after `@`.
    pub text: String,
    pub expr: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Positional,
    KeywordOnly,
    VarArgs,
    KwArgs,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
    pub annotation: Option<Annotation>,
    pub default: Option<Expr>,
    /// Source text of the default expression, for signatures.
    pub default_text: Option<String>,
}

impl Param {
    pub fn is_variadic(&self) -> bool {
        matches!(self.kind, ParamKind::VarArgs | ParamKind::KwArgs)
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ParamKind::VarArgs => write!(f, "*")?,
            ParamKind::KwArgs => write!(f, "**")?,
            _ => {}
        }
        write!(f, "{}", self.name)?;
        if let Some(ann) = &self.annotation {
            write!(f, ": {}", ann.text)?;
        }
        if let Some(default) = &self.default_text {
            if self.annotation.is_some() {
                write!(f, " = {}", default)?;
            } else {
                write!(f, "={}", default)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: String,
    pub bases: Vec<Expr>,
    pub body: Vec<Stmt>,
    pub docstring: Option<String>,
    pub decorators: Vec<Decorator>,
    pub span: Span,
}

/// A declared type as written, plus its structure.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub text: String,
    pub expr: TypeExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeExpr {
    Name(String),
    /// `module.Type`
    Dotted(String),
    /// `list[int]`, `Optional[Token]`, `dict[str, list[Token]]`
    Generic {
        base: Box<TypeExpr>,
        args: Vec<TypeExpr>,
    },
    /// `A | B | None`
    Union(Vec<TypeExpr>),
    None,
    /// Anything else (literals, calls); carried as text.
    Opaque(String),
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub line: usize,
    pub kind: ExprKind,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    None,
    Ellipsis,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    FString(Vec<FStringPart>),
    Name(String),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Set(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    BoolOp {
        and: bool,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        first: Box<Expr>,
        rest: Vec<(CmpOp, Expr)>,
    },
    Conditional {
        body: Box<Expr>,
        test: Box<Expr>,
        orelse: Box<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Arg>,
    },
    Attribute {
        value: Box<Expr>,
        attr: String,
    },
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    Lambda(Arc<FunctionDef>),
    ListComp {
        element: Box<Expr>,
        clauses: Vec<CompClause>,
    },
    DictComp {
        key: Box<Expr>,
        value: Box<Expr>,
        clauses: Vec<CompClause>,
    },
}

#[derive(Debug, Clone)]
pub enum FStringPart {
    Literal(String),
    Field { expr: Expr, spec: Option<String> },
}

#[derive(Debug, Clone)]
pub enum Arg {
    Positional(Expr),
    Keyword(String, Expr),
    Star(Expr),
    DoubleStar(Expr),
}

#[derive(Debug, Clone)]
pub enum CompClause {
    For { target: Target, iter: Expr },
    If(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinOp {
    pub fn from_token(token: &str) -> Option<Self> {
        Some(match token.trim_end_matches('=') {
            "+" => BinOp::Add,
            "-" => BinOp::Sub,
            "*" => BinOp::Mul,
            "/" => BinOp::Div,
            "//" => BinOp::FloorDiv,
            "%" => BinOp::Mod,
            "**" => BinOp::Pow,
            "&" => BinOp::BitAnd,
            "|" => BinOp::BitOr,
            "^" => BinOp::BitXor,
            "<<" => BinOp::Shl,
            ">>" => BinOp::Shr,
            _ => return None,
        })
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
    Is,
    IsNot,
}

impl CmpOp {
    pub fn from_token(token: &str) -> Option<Self> {
        let normalized: Vec<&str> = token.split_whitespace().collect();
        Some(match normalized.as_slice() {
            ["=="] => CmpOp::Eq,
            ["!="] | ["<>"] => CmpOp::NotEq,
            ["<"] => CmpOp::Lt,
            ["<="] => CmpOp::LtE,
            [">"] => CmpOp::Gt,
            [">="] => CmpOp::GtE,
            ["in"] => CmpOp::In,
            ["not", "in"] => CmpOp::NotIn,
            ["is"] => CmpOp::Is,
            ["is", "not"] => CmpOp::IsNot,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmp_tokens_accept_split_keywords() {
        assert_eq!(CmpOp::from_token("not in"), Some(CmpOp::NotIn));
        assert_eq!(CmpOp::from_token("is  not"), Some(CmpOp::IsNot));
        assert_eq!(CmpOp::from_token("=>"), None);
    }

    #[test]
    fn test_augmented_operator_tokens() {
        assert_eq!(BinOp::from_token("+="), Some(BinOp::Add));
        assert_eq!(BinOp::from_token("//="), Some(BinOp::FloorDiv));
        assert_eq!(BinOp::from_token("**"), Some(BinOp::Pow));
    }
}
