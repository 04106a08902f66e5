//! Parser for `{{ ... }}` template actions
//!
//! The accepted language is deliberately small:
//!
//! ```text
//! action := expr | "if" expr | "else" | "end"
//! expr   := path | string | func arg+
//! path   := ("." ident)+
//! arg    := path | string
//! string := "..." | `...`
//! ```
//!
//! `{{-` and `-}}` trim adjacent whitespace.

use super::error::TemplateError;

/// Functions callable from templates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Func {
    /// `ChildName parent suffix`
    ChildName,
    /// `or a b ...`: first non-empty argument
    Or,
}

impl Func {
    fn from_ident(ident: &str) -> Option<Self> {
        match ident {
            "ChildName" => Some(Self::ChildName),
            "or" => Some(Self::Or),
            _ => None,
        }
    }

    /// Name as written in templates
    pub fn name(self) -> &'static str {
        match self {
            Self::ChildName => "ChildName",
            Self::Or => "or",
        }
    }
}

/// A template expression
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    /// Field chain such as `.Spec.Model.Name`
    Path(Vec<String>),
    /// String literal
    Str(String),
    /// Function call
    Call {
        /// Called function
        func: Func,
        /// Arguments in order
        args: Vec<Expr>,
    },
}

/// A parsed template node
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    /// Literal text
    Text(String),
    /// `{{ expr }}`
    Output {
        /// Expression to print
        expr: Expr,
        /// Original action text, for error messages
        source: String,
    },
    /// `{{ if cond }} ... {{ else }} ... {{ end }}`
    If {
        /// Condition
        cond: Expr,
        /// Original action text
        source: String,
        /// Nodes rendered when the condition holds
        then: Vec<Node>,
        /// Nodes rendered otherwise
        otherwise: Vec<Node>,
    },
}

/// A parsed template
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Template {
    /// Template name used in errors
    pub name: String,
    /// Top-level nodes
    pub nodes: Vec<Node>,
}

impl Template {
    /// Whether the template contains no actions at all
    pub fn is_static(&self) -> bool {
        self.nodes.iter().all(|n| matches!(n, Node::Text(_)))
    }
}

/// Whether `s` contains anything that looks like an action
pub fn has_actions(s: &str) -> bool {
    s.contains("{{")
}

#[derive(Debug, PartialEq)]
enum Token {
    Field(Vec<String>),
    Ident(String),
    Str(String),
}

enum Action {
    Expr(Expr),
    If(Expr),
    Else,
    End,
}

struct Frame {
    cond: Expr,
    source: String,
    then: Vec<Node>,
    otherwise: Vec<Node>,
    in_else: bool,
}

/// `{{-` followed by whitespace
fn is_left_trim(action: &str) -> bool {
    let mut chars = action.chars();
    chars.next() == Some('-') && chars.next().is_some_and(char::is_whitespace)
}

/// Whitespace followed by `-}}`
fn is_right_trim(action: &str) -> bool {
    let mut chars = action.chars().rev();
    chars.next() == Some('-') && chars.next().is_some_and(char::is_whitespace)
}

/// Parse `src` into a template named `name`.
pub fn parse(name: &str, src: &str) -> Result<Template, TemplateError> {
    let err = |line: usize, message: String| TemplateError::Parse {
        template: name.to_string(),
        line,
        message,
    };

    let mut root: Vec<Node> = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut rest = src;
    let mut consumed = 0usize;
    let mut trim_next = false;

    loop {
        let Some(open) = rest.find("{{") else {
            let text = if trim_next { rest.trim_start() } else { rest };
            push_text(current(&mut root, &mut stack), text);
            break;
        };

        let line = 1 + src[..consumed + open].matches('\n').count();
        let mut text = &rest[..open];
        if trim_next {
            text = text.trim_start();
        }
        let mut inner_start = open + 2;
        if is_left_trim(&rest[inner_start..]) {
            text = text.trim_end();
            inner_start += 1;
        }
        push_text(current(&mut root, &mut stack), text);

        let close = find_close(&rest[inner_start..])
            .ok_or_else(|| err(line, "unclosed action".to_string()))?;
        let mut inner = &rest[inner_start..inner_start + close];
        trim_next = false;
        if is_right_trim(inner) {
            inner = &inner[..inner.len() - 1];
            trim_next = true;
        }

        let source = inner.trim().to_string();
        let tokens = tokenize(inner).map_err(|m| err(line, m))?;
        match parse_action(tokens).map_err(|m| err(line, m))? {
            Action::Expr(expr) => current(&mut root, &mut stack).push(Node::Output { expr, source }),
            Action::If(cond) => stack.push(Frame {
                cond,
                source,
                then: Vec::new(),
                otherwise: Vec::new(),
                in_else: false,
            }),
            Action::Else => match stack.last_mut() {
                Some(frame) if !frame.in_else => frame.in_else = true,
                _ => return Err(err(line, "unexpected {{else}}".to_string())),
            },
            Action::End => {
                let frame = stack
                    .pop()
                    .ok_or_else(|| err(line, "unexpected {{end}}".to_string()))?;
                let node = Node::If {
                    cond: frame.cond,
                    source: frame.source,
                    then: frame.then,
                    otherwise: frame.otherwise,
                };
                current(&mut root, &mut stack).push(node);
            }
        }

        let advance = inner_start + close + 2;
        consumed += advance;
        rest = &rest[advance..];
    }

    if !stack.is_empty() {
        let line = 1 + src.matches('\n').count();
        return Err(err(line, "unexpected EOF".to_string()));
    }

    Ok(Template {
        name: name.to_string(),
        nodes: root,
    })
}

fn current<'a>(root: &'a mut Vec<Node>, stack: &'a mut [Frame]) -> &'a mut Vec<Node> {
    match stack.last_mut() {
        Some(frame) if frame.in_else => &mut frame.otherwise,
        Some(frame) => &mut frame.then,
        None => root,
    }
}

fn push_text(nodes: &mut Vec<Node>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(Node::Text(prev)) = nodes.last_mut() {
        prev.push_str(text);
    } else {
        nodes.push(Node::Text(text.to_string()));
    }
}

/// Offset of the closing `}}`, skipping over quoted strings.
fn find_close(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'`' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'`' {
                    i += 1;
                }
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

fn tokenize(inner: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = inner.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        match c {
            '.' => {
                let mut fields = Vec::new();
                while chars.peek() == Some(&'.') {
                    chars.next();
                    let ident: String = std::iter::from_fn(|| {
                        chars.next_if(|c| c.is_alphanumeric() || *c == '_')
                    })
                    .collect();
                    if ident.is_empty() {
                        return Err("bare \".\" is not supported".to_string());
                    }
                    fields.push(ident);
                }
                tokens.push(Token::Field(fields));
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some(other) => value.push(other),
                            None => return Err("unterminated quoted string".to_string()),
                        },
                        Some(other) => value.push(other),
                        None => return Err("unterminated quoted string".to_string()),
                    }
                }
                tokens.push(Token::Str(value));
            }
            '`' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('`') => break,
                        Some(other) => value.push(other),
                        None => return Err("unterminated raw quoted string".to_string()),
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let ident: String =
                    std::iter::from_fn(|| chars.next_if(|c| c.is_alphanumeric() || *c == '_'))
                        .collect();
                tokens.push(Token::Ident(ident));
            }
            other => return Err(format!("unexpected {:?} in command", other)),
        }
    }
    Ok(tokens)
}

fn parse_action(tokens: Vec<Token>) -> Result<Action, String> {
    let mut iter = tokens.into_iter();
    let Some(first) = iter.next() else {
        return Err("missing value for command".to_string());
    };
    let rest: Vec<Token> = iter.collect();

    match first {
        Token::Ident(ref kw) if kw == "if" => {
            if rest.is_empty() {
                return Err("missing value for if".to_string());
            }
            Ok(Action::If(parse_expr(rest)?))
        }
        Token::Ident(ref kw) if kw == "else" => {
            if !rest.is_empty() {
                return Err("unexpected arguments after else".to_string());
            }
            Ok(Action::Else)
        }
        Token::Ident(ref kw) if kw == "end" => {
            if !rest.is_empty() {
                return Err("unexpected arguments after end".to_string());
            }
            Ok(Action::End)
        }
        first => {
            let mut all = vec![first];
            all.extend(rest);
            Ok(Action::Expr(parse_expr(all)?))
        }
    }
}

fn parse_expr(tokens: Vec<Token>) -> Result<Expr, String> {
    let mut iter = tokens.into_iter();
    let Some(head) = iter.next() else {
        return Err("missing value for command".to_string());
    };
    let rest: Vec<Token> = iter.collect();

    match head {
        Token::Ident(name) => {
            let func =
                Func::from_ident(&name).ok_or_else(|| format!("function {:?} not defined", name))?;
            let args = rest
                .into_iter()
                .map(operand)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Expr::Call { func, args })
        }
        other if rest.is_empty() => operand(other),
        other => Err(format!(
            "can't give argument to non-function {}",
            describe(&other)
        )),
    }
}

fn operand(token: Token) -> Result<Expr, String> {
    match token {
        Token::Field(fields) => Ok(Expr::Path(fields)),
        Token::Str(s) => Ok(Expr::Str(s)),
        Token::Ident(name) => Err(format!(
            "nested call to {:?} requires parentheses, which are not supported",
            name
        )),
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Field(f) => format!(".{}", f.join(".")),
        Token::Ident(i) => i.clone(),
        Token::Str(s) => format!("{:?}", s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(parts: &[&str]) -> Expr {
        Expr::Path(parts.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn plain_text_is_static() {
        let t = parse("config", "no actions here").unwrap();
        assert!(t.is_static());
        assert_eq!(t.nodes, vec![Node::Text("no actions here".into())]);
    }

    #[test]
    fn field_chain_with_surrounding_text() {
        let t = parse("config", "{{ .Namespace }}-models").unwrap();
        assert_eq!(t.nodes.len(), 2);
        assert!(matches!(&t.nodes[0], Node::Output { expr, .. } if *expr == path(&["Namespace"])));
        assert_eq!(t.nodes[1], Node::Text("-models".into()));
    }

    #[test]
    fn child_name_with_raw_string() {
        let t = parse("config", "{{ ChildName .Name `-sa` }}").unwrap();
        match &t.nodes[0] {
            Node::Output { expr, .. } => assert_eq!(
                *expr,
                Expr::Call {
                    func: Func::ChildName,
                    args: vec![path(&["Name"]), Expr::Str("-sa".into())],
                }
            ),
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn if_else_end() {
        let t = parse(
            "config",
            "{{ if .Spec.Model.Name }}{{ .Spec.Model.Name }}{{ else }}default-model{{ end }}",
        )
        .unwrap();
        match &t.nodes[0] {
            Node::If {
                cond,
                then,
                otherwise,
                ..
            } => {
                assert_eq!(*cond, path(&["Spec", "Model", "Name"]));
                assert_eq!(then.len(), 1);
                assert_eq!(otherwise, &vec![Node::Text("default-model".into())]);
            }
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn trim_markers_strip_whitespace() {
        let t = parse("config", "a  {{- .Name -}}  b").unwrap();
        assert_eq!(t.nodes.first(), Some(&Node::Text("a".into())));
        assert_eq!(t.nodes.last(), Some(&Node::Text("b".into())));
    }

    #[test]
    fn trim_markers_accept_any_whitespace() {
        let t = parse("config", "a \n{{-\t.Name\n-}}\n  b").unwrap();
        assert_eq!(t.nodes.len(), 3);
        assert_eq!(t.nodes.first(), Some(&Node::Text("a".into())));
        assert_eq!(t.nodes.last(), Some(&Node::Text("b".into())));
    }

    #[test]
    fn braces_inside_strings_do_not_close() {
        let t = parse("config", r#"{{ or .Name "}}" }}"#).unwrap();
        assert_eq!(t.nodes.len(), 1);
    }

    mod errors {
        use super::*;

        #[test]
        fn unclosed_action() {
            let err = parse("config", "{{ .Name").unwrap_err();
            assert!(err.is_parse());
            assert!(err.to_string().contains("unclosed action"));
        }

        #[test]
        fn unknown_function() {
            let err = parse("config", "{{ printf .Name }}").unwrap_err();
            assert!(err.to_string().contains("function \"printf\" not defined"));
        }

        #[test]
        fn unbalanced_blocks() {
            assert!(parse("config", "{{ if .Name }}x").unwrap_err().is_parse());
            assert!(parse("config", "x{{ end }}").unwrap_err().is_parse());
            assert!(parse("config", "{{ else }}").unwrap_err().is_parse());
        }

        #[test]
        fn empty_action() {
            assert!(parse("config", "{{ }}").unwrap_err().is_parse());
        }

        #[test]
        fn reports_line_number() {
            let err = parse("config", "a\nb\n{{ .Name").unwrap_err();
            assert!(err.to_string().starts_with("template: config:3:"));
        }
    }
}
