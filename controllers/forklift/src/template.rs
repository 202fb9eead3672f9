//! Name templates for target claims, volumes and network interfaces.
//!
//! A small text-template interpreter: text with `{{ ... }}` actions holding field references
//! (`.VmName`), string/int/bool literals, function calls, pipes (`.VmName | lower`),
//! parenthesized sub-expressions and `{{if}}...{{else}}...{{end}}` blocks. `{{-` and `-}}`
//! trim surrounding whitespace. Only a fixed set of functions and, per template kind, a
//! fixed set of fields exist; anything else fails at parse or validation time rather than
//! producing colliding names at run time.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Longest DNS-1123 label
pub const MAX_LABEL_LENGTH: usize = 63;

/// Characters appended by the API server to a `generateName` prefix
const GENERATE_NAME_SUFFIX_LENGTH: usize = 5;

/// Template errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// Malformed template text
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Function outside the supported set
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// Field not available for this template kind
    #[error("unknown field '.{0}'")]
    UnknownField(String),

    /// Wrong number of arguments
    #[error("function '{name}' takes {expected} argument(s), got {got}")]
    Arity {
        /// Function name
        name: String,
        /// Expected arguments
        expected: usize,
        /// Provided arguments
        got: usize,
    },

    /// Argument of the wrong type
    #[error("function '{0}' expects string arguments")]
    Type(String),

    /// Rendered output is not a valid object name
    #[error("'{0}' is not a valid DNS-1123 label")]
    InvalidName(String),
}

/// A value flowing through a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// String
    Str(String),
    /// Integer
    Int(i64),
    /// Boolean
    Bool(bool),
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Self::Str(s) => !s.is_empty(),
            Self::Int(i) => *i != 0,
            Self::Bool(b) => *b,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{}", i),
            Self::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

/// Indexes beyond `i64::MAX` saturate
impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Self::Int(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Field values a template renders against
pub type TemplateData = BTreeMap<&'static str, Value>;

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Field(String),
    Literal(Value),
    Call { name: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Action(Expr),
    If { cond: Expr, then: Vec<Node>, otherwise: Vec<Node> },
}

fn arity(name: &str) -> Option<usize> {
    match name {
        "lower" | "upper" | "trim" | "not" => Some(1),
        "trimPrefix" | "trimSuffix" | "eq" | "ne" => Some(2),
        "replace" => Some(3),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field(String),
    Literal(Value),
    Ident(String),
    Pipe,
    LParen,
    RParen,
}

fn tokenize(action: &str) -> Result<Vec<Token>, TemplateError> {
    let chars: Vec<char> = action.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' => {
                let start = i + 1;
                i = start;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                if i == start {
                    return Err(TemplateError::Syntax("'.' must be followed by a field name".to_string()));
                }
                tokens.push(Token::Field(chars[start..i].iter().collect()));
            }
            '"' => {
                let mut literal = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(TemplateError::Syntax("unterminated string literal".to_string())),
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .ok_or_else(|| TemplateError::Syntax("unterminated escape".to_string()))?;
                            literal.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(other) => {
                            literal.push(*other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(Value::Str(literal)));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<i64>()
                    .map_err(|_| TemplateError::Syntax(format!("invalid number '{}'", text)))?;
                tokens.push(Token::Literal(Value::Int(value)));
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    _ => Token::Ident(word),
                });
            }
            other => return Err(TemplateError::Syntax(format!("unexpected character '{}'", other))),
        }
    }
    Ok(tokens)
}

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn pipeline(&mut self) -> Result<Expr, TemplateError> {
        let mut expr = self.command(None)?;
        while self.peek() == Some(&Token::Pipe) {
            self.pos += 1;
            expr = self.command(Some(expr))?;
        }
        Ok(expr)
    }

    fn command(&mut self, piped: Option<Expr>) -> Result<Expr, TemplateError> {
        if let Some(Token::Ident(name)) = self.peek().cloned() {
            self.pos += 1;
            let expected = arity(&name).ok_or_else(|| TemplateError::UnknownFunction(name.clone()))?;
            let mut args = Vec::new();
            while let Some(token) = self.peek() {
                if matches!(token, Token::Pipe | Token::RParen) {
                    break;
                }
                args.push(self.operand()?);
            }
            if let Some(piped) = piped {
                args.push(piped);
            }
            if args.len() != expected {
                return Err(TemplateError::Arity {
                    name,
                    expected,
                    got: args.len(),
                });
            }
            return Ok(Expr::Call { name, args });
        }
        if piped.is_some() {
            return Err(TemplateError::Syntax("only functions can follow '|'".to_string()));
        }
        let operand = self.operand()?;
        match self.peek() {
            None | Some(Token::Pipe) | Some(Token::RParen) => Ok(operand),
            Some(_) => Err(TemplateError::Syntax("unexpected operand after value".to_string())),
        }
    }

    fn operand(&mut self) -> Result<Expr, TemplateError> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| TemplateError::Syntax("missing value".to_string()))?;
        self.pos += 1;
        match token {
            Token::Field(name) => Ok(Expr::Field(name)),
            Token::Literal(value) => Ok(Expr::Literal(value)),
            Token::LParen => {
                let inner = self.pipeline()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(TemplateError::Syntax("missing ')'".to_string()));
                }
                self.pos += 1;
                Ok(inner)
            }
            Token::Ident(name) => match arity(&name) {
                Some(_) => Err(TemplateError::Syntax(format!("function '{}' used as a value; wrap it in parentheses", name))),
                None => Err(TemplateError::UnknownFunction(name)),
            },
            Token::Pipe | Token::RParen => Err(TemplateError::Syntax("missing value".to_string())),
        }
    }
}

fn parse_expr(tokens: Vec<Token>) -> Result<Expr, TemplateError> {
    if tokens.is_empty() {
        return Err(TemplateError::Syntax("empty action".to_string()));
    }
    let mut parser = ExprParser { tokens, pos: 0 };
    let expr = parser.pipeline()?;
    if parser.pos != parser.tokens.len() {
        return Err(TemplateError::Syntax("unexpected ')'".to_string()));
    }
    Ok(expr)
}

enum Segment {
    Text(String),
    Action(String),
}

fn split_segments(source: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = source;
    let mut trim_next_text = false;
    while let Some(open) = rest.find("{{") {
        let mut text = &rest[..open];
        if trim_next_text {
            text = text.trim_start();
        }
        let mut action = &rest[open + 2..];
        if let Some(stripped) = action.strip_prefix('-') {
            text = text.trim_end();
            action = stripped;
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text.to_string()));
        }
        let close = action
            .find("}}")
            .ok_or_else(|| TemplateError::Syntax("unclosed action".to_string()))?;
        let mut body = &action[..close];
        trim_next_text = false;
        if let Some(stripped) = body.strip_suffix('-') {
            body = stripped;
            trim_next_text = true;
        }
        segments.push(Segment::Action(body.trim().to_string()));
        rest = &action[close + 2..];
    }
    let text = if trim_next_text { rest.trim_start() } else { rest };
    if !text.is_empty() {
        segments.push(Segment::Text(text.to_string()));
    }
    Ok(segments)
}

/// A parsed template
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    /// Parse template text
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        // Stack of open blocks: (condition, then-branch, else-branch, in-else)
        let mut stack: Vec<(Expr, Vec<Node>, Vec<Node>, bool)> = Vec::new();
        let mut root: Vec<Node> = Vec::new();

        fn current<'a>(root: &'a mut Vec<Node>, stack: &'a mut [(Expr, Vec<Node>, Vec<Node>, bool)]) -> &'a mut Vec<Node> {
            match stack.last_mut() {
                Some((_, _, otherwise, true)) => otherwise,
                Some((_, then, _, false)) => then,
                None => root,
            }
        }

        for segment in split_segments(source)? {
            match segment {
                Segment::Text(text) => current(&mut root, &mut stack).push(Node::Text(text)),
                Segment::Action(body) => {
                    let mut tokens = tokenize(&body)?;
                    match tokens.first() {
                        Some(Token::Ident(word)) if word == "if" => {
                            tokens.remove(0);
                            stack.push((parse_expr(tokens)?, Vec::new(), Vec::new(), false));
                        }
                        Some(Token::Ident(word)) if word == "else" => {
                            if tokens.len() != 1 {
                                return Err(TemplateError::Syntax("'else' takes no arguments".to_string()));
                            }
                            match stack.last_mut() {
                                Some(block) if !block.3 => block.3 = true,
                                Some(_) => return Err(TemplateError::Syntax("duplicate 'else'".to_string())),
                                None => return Err(TemplateError::Syntax("'else' outside 'if'".to_string())),
                            }
                        }
                        Some(Token::Ident(word)) if word == "end" => {
                            if tokens.len() != 1 {
                                return Err(TemplateError::Syntax("'end' takes no arguments".to_string()));
                            }
                            let (cond, then, otherwise, _) = stack
                                .pop()
                                .ok_or_else(|| TemplateError::Syntax("'end' outside 'if'".to_string()))?;
                            current(&mut root, &mut stack).push(Node::If { cond, then, otherwise });
                        }
                        _ => {
                            let expr = parse_expr(tokens)?;
                            current(&mut root, &mut stack).push(Node::Action(expr));
                        }
                    }
                }
            }
        }
        if !stack.is_empty() {
            return Err(TemplateError::Syntax("missing 'end'".to_string()));
        }
        Ok(Self { nodes: root })
    }

    /// Field names referenced anywhere in the template
    pub fn fields(&self) -> BTreeSet<String> {
        fn visit_expr(expr: &Expr, out: &mut BTreeSet<String>) {
            match expr {
                Expr::Field(name) => {
                    out.insert(name.clone());
                }
                Expr::Literal(_) => {}
                Expr::Call { args, .. } => args.iter().for_each(|a| visit_expr(a, out)),
            }
        }
        fn visit(nodes: &[Node], out: &mut BTreeSet<String>) {
            for node in nodes {
                match node {
                    Node::Text(_) => {}
                    Node::Action(expr) => visit_expr(expr, out),
                    Node::If { cond, then, otherwise } => {
                        visit_expr(cond, out);
                        visit(then, out);
                        visit(otherwise, out);
                    }
                }
            }
        }
        let mut out = BTreeSet::new();
        visit(&self.nodes, &mut out);
        out
    }

    /// Render against field values
    pub fn render(&self, data: &TemplateData) -> Result<String, TemplateError> {
        let mut out = String::new();
        render_nodes(&self.nodes, data, &mut out)?;
        Ok(out)
    }
}

fn render_nodes(nodes: &[Node], data: &TemplateData, out: &mut String) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Action(expr) => out.push_str(&eval(expr, data)?.to_string()),
            Node::If { cond, then, otherwise } => {
                if eval(cond, data)?.truthy() {
                    render_nodes(then, data, out)?;
                } else {
                    render_nodes(otherwise, data, out)?;
                }
            }
        }
    }
    Ok(())
}

fn string_arg(name: &str, value: Value) -> Result<String, TemplateError> {
    match value {
        Value::Str(s) => Ok(s),
        _ => Err(TemplateError::Type(name.to_string())),
    }
}

fn eval(expr: &Expr, data: &TemplateData) -> Result<Value, TemplateError> {
    match expr {
        Expr::Field(name) => data
            .get(name.as_str())
            .cloned()
            .ok_or_else(|| TemplateError::UnknownField(name.clone())),
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Call { name, args } => {
            let mut values = args.iter().map(|a| eval(a, data)).collect::<Result<Vec<_>, _>>()?.into_iter();
            let mut next = || values.next().ok_or_else(|| TemplateError::Syntax(format!("missing argument to '{}'", name)));
            match name.as_str() {
                "lower" => Ok(Value::Str(string_arg(name, next()?)?.to_lowercase())),
                "upper" => Ok(Value::Str(string_arg(name, next()?)?.to_uppercase())),
                "trim" => Ok(Value::Str(string_arg(name, next()?)?.trim().to_string())),
                "trimPrefix" => {
                    let prefix = string_arg(name, next()?)?;
                    let s = string_arg(name, next()?)?;
                    Ok(Value::Str(s.strip_prefix(prefix.as_str()).unwrap_or(&s).to_string()))
                }
                "trimSuffix" => {
                    let suffix = string_arg(name, next()?)?;
                    let s = string_arg(name, next()?)?;
                    Ok(Value::Str(s.strip_suffix(suffix.as_str()).unwrap_or(&s).to_string()))
                }
                "replace" => {
                    let old = string_arg(name, next()?)?;
                    let new = string_arg(name, next()?)?;
                    let s = string_arg(name, next()?)?;
                    Ok(Value::Str(s.replace(old.as_str(), new.as_str())))
                }
                "eq" => Ok(Value::Bool(next()? == next()?)),
                "ne" => Ok(Value::Bool(next()? != next()?)),
                "not" => Ok(Value::Bool(!next()?.truthy())),
                other => Err(TemplateError::UnknownFunction(other.to_string())),
            }
        }
    }
}

/// True when `name` is a DNS-1123 label
pub fn is_dns1123_label(name: &str) -> bool {
    let bytes = name.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= MAX_LABEL_LENGTH
        && bytes.iter().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
}

/// Check a rendered name. As a `generateName` prefix it may end with '-' and must leave
/// room for the random suffix.
pub fn validate_rendered(name: &str, generate_name: bool) -> Result<(), TemplateError> {
    let valid = if generate_name {
        let prefix = name.trim_end_matches('-');
        name.len() + GENERATE_NAME_SUFFIX_LENGTH <= MAX_LABEL_LENGTH && is_dns1123_label(prefix)
    } else {
        is_dns1123_label(name)
    };
    if valid { Ok(()) } else { Err(TemplateError::InvalidName(name.to_string())) }
}

impl From<TemplateError> for crate::error::ControllerError {
    fn from(e: TemplateError) -> Self {
        Self::Template(e.to_string())
    }
}

/// The three template surfaces of a Plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    /// Target claim names
    Pvc,
    /// Volume names inside the target VM
    Volume,
    /// Interface names inside the target VM
    Network,
}

impl TemplateKind {
    /// Fields available to templates of this kind
    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            Self::Pvc => &["VmName", "PlanName", "DiskIndex", "WinDriveLetter", "RootDiskIndex", "Shared", "FileName"],
            Self::Volume => &["PVCName", "VolumeIndex"],
            Self::Network => &["NetworkName", "NetworkNamespace", "NetworkType", "NetworkIndex"],
        }
    }

    /// Representative values used to validate a template before any VM is migrated
    pub fn sample(&self) -> TemplateData {
        match self {
            Self::Pvc => TemplateData::from([
                ("VmName", Value::from("test-vm")),
                ("PlanName", Value::from("test-plan")),
                ("DiskIndex", Value::Int(0)),
                ("WinDriveLetter", Value::from("c")),
                ("RootDiskIndex", Value::Int(0)),
                ("Shared", Value::from(false)),
                ("FileName", Value::from("disk.vmdk")),
            ]),
            Self::Volume => TemplateData::from([("PVCName", Value::from("test-pvc")), ("VolumeIndex", Value::Int(0))]),
            Self::Network => TemplateData::from([
                ("NetworkName", Value::from("test-network")),
                ("NetworkNamespace", Value::from("default")),
                ("NetworkType", Value::from("Multus")),
                ("NetworkIndex", Value::Int(0)),
            ]),
        }
    }
}

/// Parse a template and check it against the fields of its kind and a sample render
pub fn validate_template(source: &str, kind: TemplateKind, generate_name: bool) -> Result<Template, TemplateError> {
    let template = Template::parse(source)?;
    if let Some(unknown) = template.fields().into_iter().find(|f| !kind.fields().contains(&f.as_str())) {
        return Err(TemplateError::UnknownField(unknown));
    }
    let rendered = template.render(&kind.sample())?;
    validate_rendered(&rendered, generate_name && kind == TemplateKind::Pvc)?;
    Ok(template)
}
