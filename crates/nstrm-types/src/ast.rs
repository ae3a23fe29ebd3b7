//! Expression tree evaluated by the interpreter.
//!
//! The grammar lives outside this workspace; a parser hands programs over as
//! JSON in this shape. Every node carries the [`Position`] of its source text.

use serde::{Deserialize, Serialize};

use crate::{Number, Position};

/// A whole program: a sequence of top-level expressions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    pub body: Vec<Expr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expr {
    #[serde(default)]
    pub pos: Position,
    pub kind: ExprKind,
}

/// Literal constant. `null` decodes to `Nil`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Nil,
    Bool(bool),
    Number(Number),
    String(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExprKind {
    /// Hardcoded value, e.g. a number or a string.
    Literal { value: Literal },
    /// Variable reference.
    Var { name: String },
    /// Variable binding, `name = expr`.
    Bind { name: String, expr: Box<Expr> },
    /// Function call, `name(args...)`. Operators arrive as calls too (`ADD`, `==`).
    Call {
        name: String,
        #[serde(default)]
        args: Vec<Expr>,
    },
    /// Pipe expression, `a | b | c`. The flags mark an open edge that must
    /// be treated as a filter instead of a producer or consumer.
    Pipe {
        args: Vec<Expr>,
        #[serde(default)]
        first_filter: bool,
        #[serde(default)]
        last_filter: bool,
    },
    /// Function literal, `{ a, b -> body }`.
    Block {
        #[serde(default)]
        params: Vec<String>,
        body: Vec<Expr>,
    },
    If {
        cond: Vec<Expr>,
        then: Vec<Expr>,
        #[serde(default)]
        otherwise: Vec<Expr>,
    },
    While { cond: Vec<Expr>, body: Vec<Expr> },
    Array {
        #[serde(default)]
        elements: Vec<Expr>,
    },
    /// Start pending pipelines of the current scope and wait for them.
    Wait,
    /// Terminate the running stage, optionally with a final value.
    Close {
        #[serde(default)]
        value: Option<Box<Expr>>,
    },
    /// Send values to the scope's output.
    Emit { values: Vec<Expr> },
    /// Drop the current item.
    Skip,
}

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        Self {
            pos: Position::default(),
            kind,
        }
    }

    pub fn at(mut self, pos: Position) -> Self {
        self.pos = pos;
        self
    }

    /// Short node name used in diagnostics.
    pub fn describe(&self) -> &'static str {
        match &self.kind {
            ExprKind::Literal { .. } => "literal",
            ExprKind::Var { .. } => "variable",
            ExprKind::Bind { .. } => "binding",
            ExprKind::Call { .. } => "call",
            ExprKind::Pipe { .. } => "pipe",
            ExprKind::Block { .. } => "block",
            ExprKind::If { .. } => "if",
            ExprKind::While { .. } => "while",
            ExprKind::Array { .. } => "array",
            ExprKind::Wait => "wait",
            ExprKind::Close { .. } => "close",
            ExprKind::Emit { .. } => "emit",
            ExprKind::Skip => "skip",
        }
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Terse constructors for building trees in code and tests.
pub mod build {
    use super::*;

    pub fn nil() -> Expr {
        Expr::new(ExprKind::Literal {
            value: Literal::Nil,
        })
    }

    pub fn int(i: i64) -> Expr {
        Expr::new(ExprKind::Literal {
            value: Literal::Number(Number::Int(i)),
        })
    }

    pub fn boolean(b: bool) -> Expr {
        Expr::new(ExprKind::Literal {
            value: Literal::Bool(b),
        })
    }

    pub fn string(s: impl Into<String>) -> Expr {
        Expr::new(ExprKind::Literal {
            value: Literal::String(s.into()),
        })
    }

    pub fn var(name: impl Into<String>) -> Expr {
        Expr::new(ExprKind::Var { name: name.into() })
    }

    pub fn bind(name: impl Into<String>, expr: Expr) -> Expr {
        Expr::new(ExprKind::Bind {
            name: name.into(),
            expr: Box::new(expr),
        })
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::new(ExprKind::Call {
            name: name.into(),
            args,
        })
    }

    pub fn pipe(args: Vec<Expr>) -> Expr {
        Expr::new(ExprKind::Pipe {
            args,
            first_filter: false,
            last_filter: false,
        })
    }

    /// Pipe whose edges are open: `| a | b |` style.
    pub fn open_pipe(args: Vec<Expr>, first_filter: bool, last_filter: bool) -> Expr {
        Expr::new(ExprKind::Pipe {
            args,
            first_filter,
            last_filter,
        })
    }

    pub fn block(params: &[&str], body: Vec<Expr>) -> Expr {
        Expr::new(ExprKind::Block {
            params: params.iter().map(|p| p.to_string()).collect(),
            body,
        })
    }

    pub fn if_else(cond: Expr, then: Vec<Expr>, otherwise: Vec<Expr>) -> Expr {
        Expr::new(ExprKind::If {
            cond: vec![cond],
            then,
            otherwise,
        })
    }

    pub fn while_loop(cond: Expr, body: Vec<Expr>) -> Expr {
        Expr::new(ExprKind::While {
            cond: vec![cond],
            body,
        })
    }

    pub fn array(elements: Vec<Expr>) -> Expr {
        Expr::new(ExprKind::Array { elements })
    }

    pub fn emit(values: Vec<Expr>) -> Expr {
        Expr::new(ExprKind::Emit { values })
    }

    pub fn close(value: Option<Expr>) -> Expr {
        Expr::new(ExprKind::Close {
            value: value.map(Box::new),
        })
    }

    pub fn skip() -> Expr {
        Expr::new(ExprKind::Skip)
    }

    pub fn wait() -> Expr {
        Expr::new(ExprKind::Wait)
    }
}

#[cfg(test)]
mod tests {
    use super::build::*;
    use super::*;

    #[test]
    fn decodes_pipe_with_positions() {
        let json = r#"{
            "pos": {"begin": 0, "end": 22},
            "kind": {
                "type": "pipe",
                "args": [
                    {"pos": {"begin": 0, "end": 6}, "kind": {"type": "call", "name": "seq", "args": [
                        {"kind": {"type": "literal", "value": 3}}
                    ]}},
                    {"kind": {"type": "var", "name": "collect"}}
                ]
            }
        }"#;
        let expr: Expr = serde_json::from_str(json).unwrap();
        assert_eq!(expr.pos, Position::new(0, 22));
        match &expr.kind {
            ExprKind::Pipe {
                args,
                first_filter,
                last_filter,
            } => {
                assert_eq!(args.len(), 2);
                assert!(!first_filter && !last_filter);
                assert_eq!(args[0].pos, Position::new(0, 6));
                assert_eq!(args[1].describe(), "variable");
            }
            other => panic!("expected pipe, got {other:?}"),
        }
    }

    #[test]
    fn decodes_literal_variants() {
        let lits: Vec<Literal> =
            serde_json::from_str(r#"[null, true, 1, 2.5, "s"]"#).unwrap();
        assert_eq!(lits[0], Literal::Nil);
        assert_eq!(lits[1], Literal::Bool(true));
        assert!(matches!(lits[2], Literal::Number(Number::Int(1))));
        assert!(matches!(lits[3], Literal::Number(Number::Float(f)) if f == 2.5));
        assert_eq!(lits[4], Literal::String("s".into()));
    }

    #[test]
    fn unit_nodes_decode_from_type_tag() {
        let exprs: Vec<Expr> = serde_json::from_str(
            r#"[{"kind": {"type": "skip"}}, {"kind": {"type": "wait"}}, {"kind": {"type": "close"}}]"#,
        )
        .unwrap();
        assert!(matches!(exprs[0].kind, ExprKind::Skip));
        assert!(matches!(exprs[1].kind, ExprKind::Wait));
        assert!(matches!(exprs[2].kind, ExprKind::Close { value: None }));
    }

    #[test]
    fn builders_produce_expected_shape() {
        let e = block(&["x"], vec![call("MUL", vec![var("x"), int(2)])]);
        match e.kind {
            ExprKind::Block { params, body } => {
                assert_eq!(params, vec!["x".to_string()]);
                assert_eq!(body.len(), 1);
            }
            other => panic!("expected block, got {other:?}"),
        }
    }
}
