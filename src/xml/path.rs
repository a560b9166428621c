//! XPath subset over a shared [`XmlMessage`].
//!
//! Supported: `/`, `/name`, `//name`, `/@name`, `[n]` (1-based), `[@attr]`,
//! `[name]`, `last()`, `contains(e,'t')`, `starts-with(e,'t')` and the
//! comparisons `=`, `<`, `>` against a quoted string or a number.
//!
//! Steps walk a current element until a step yields a list of results;
//! from then on name and attribute steps filter that list instead of
//! searching again.

use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::BigDecimal;

use crate::xml::document::{ElementId, XmlMessage};

const NOT_FOUND: &str = "Path not found in the XML document!";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XPathStatus {
    None,
    Invalid,
    /// `/` on its own.
    Root,
    Element,
    Attribute,
}

/// One hit of an XPath query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XPathNode {
    Element(ElementId),
    /// Element and index into its attribute list.
    Attribute(ElementId, usize),
}

impl XPathNode {
    pub fn element(self) -> ElementId {
        match self {
            XPathNode::Element(id) | XPathNode::Attribute(id, _) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Slash,
    At,
    Open,
    Close,
    LParen,
    RParen,
    Comma,
    Dot,
    Star,
    Op(char),
    Name(String),
    Literal(String),
    Number(String),
}

#[derive(Debug, Clone)]
enum Operand {
    Own,
    Child(String),
    Attribute(String),
}

#[derive(Debug)]
pub struct XPath {
    document: Option<Arc<XmlMessage>>,
    path: String,
    status: XPathStatus,
    results: Vec<XPathNode>,
    current: Option<ElementId>,
    error: String,
}

impl XPath {
    pub fn new(document: Arc<XmlMessage>, path: &str) -> Self {
        let mut query = Self {
            document: Some(document),
            path: path.to_string(),
            status: XPathStatus::None,
            results: Vec::new(),
            current: None,
            error: String::new(),
        };
        query.evaluate();
        query
    }

    pub fn set_document(&mut self, document: Arc<XmlMessage>) -> bool {
        self.document = Some(document);
        self.evaluate()
    }

    pub fn set_path(&mut self, path: &str) -> bool {
        self.path = path.to_string();
        self.evaluate()
    }

    pub fn status(&self) -> XPathStatus {
        self.status
    }

    pub fn error_text(&self) -> &str {
        &self.error
    }

    pub fn results(&self) -> &[XPathNode] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn first_result(&self) -> Option<XPathNode> {
        self.results.first().copied()
    }

    /// Text of a result: the element value or the attribute value.
    pub fn value(&self, node: XPathNode) -> Option<&str> {
        let document = self.document.as_ref()?;
        let element = document.get(node.element())?;
        match node {
            XPathNode::Element(_) => Some(element.value.as_str()),
            XPathNode::Attribute(_, index) => element.attributes.get(index).map(|a| a.value.as_str()),
        }
    }

    fn invalid(&mut self, reason: &str) -> bool {
        self.status = XPathStatus::Invalid;
        self.results.clear();
        self.error = reason.to_string();
        tracing::debug!(path = %self.path, reason, "XPath invalid");
        false
    }

    pub fn evaluate(&mut self) -> bool {
        self.status = XPathStatus::None;
        self.results.clear();
        self.current = None;
        self.error.clear();

        let Some(document) = self.document.clone() else {
            return self.invalid("No XML document to search");
        };
        let path = self.path.trim().to_string();
        if !path.starts_with('/') {
            return self.invalid("XPath must start with '/'");
        }
        let Some(root) = document.root() else {
            return self.invalid("XML document has no root element");
        };
        if path == "/" {
            self.status = XPathStatus::Root;
            self.results.push(XPathNode::Element(root));
            return true;
        }

        let tokens = match tokenize(&path) {
            Ok(tokens) => tokens,
            Err(reason) => return self.invalid(&reason),
        };

        let mut attribute_step = false;
        let mut pos = 0;
        while pos < tokens.len() {
            let step = match tokens[pos] {
                Token::Slash => {
                    pos += 1;
                    let recursive = tokens.get(pos) == Some(&Token::Slash);
                    if recursive {
                        pos += 1;
                    }
                    match tokens.get(pos) {
                        Some(Token::Name(name)) => {
                            pos += 1;
                            attribute_step = false;
                            self.name_step(&document, root, name, recursive)
                        }
                        Some(Token::Star) => {
                            pos += 1;
                            attribute_step = false;
                            self.name_step(&document, root, "*", recursive)
                        }
                        Some(Token::At) => match tokens.get(pos + 1) {
                            Some(Token::Name(name)) => {
                                pos += 2;
                                attribute_step = true;
                                self.attribute_step(&document, name)
                            }
                            _ => Err("Attribute name expected after '@'".to_string()),
                        },
                        _ => Err("Name expected after '/'".to_string()),
                    }
                }
                Token::Open => self.predicate(&document, &tokens, &mut pos),
                _ => Err("Unexpected token in XPath".to_string()),
            };
            if let Err(reason) = step {
                return self.invalid(&reason);
            }
        }

        if self.results.is_empty() {
            if let Some(current) = self.current {
                self.results.push(XPathNode::Element(current));
            }
        }
        if self.results.is_empty() {
            return self.invalid(NOT_FOUND);
        }
        self.status = if attribute_step {
            XPathStatus::Attribute
        } else {
            XPathStatus::Element
        };
        true
    }

    fn name_step(&mut self, document: &XmlMessage, root: ElementId, name: &str, recursive: bool) -> Result<(), String> {
        if !self.results.is_empty() {
            self.results.retain(|node| match node {
                XPathNode::Element(id) => {
                    name == "*" && !document.children(*id).is_empty()
                        || document.subtree_contains(*id, name, recursive)
                }
                XPathNode::Attribute(..) => false,
            });
            if self.results.is_empty() {
                return Err(NOT_FOUND.to_string());
            }
        } else if recursive {
            let mut found = Vec::new();
            match self.current {
                Some(current) => found.extend(document.descendants_named(current, name)),
                None => {
                    if name == "*" || document.element(root).name == name {
                        found.push(root);
                    }
                    found.extend(document.descendants_named(root, name));
                }
            }
            if found.is_empty() {
                return Err(NOT_FOUND.to_string());
            }
            self.results = found.into_iter().map(XPathNode::Element).collect();
        } else {
            let next = match self.current {
                None => (name == "*" || document.element(root).name == name).then_some(root),
                Some(current) if name == "*" => document.children(current).first().copied(),
                Some(current) => document.find_child(current, name),
            };
            self.current = Some(next.ok_or_else(|| NOT_FOUND.to_string())?);
        }
        Ok(())
    }

    fn attribute_step(&mut self, document: &XmlMessage, name: &str) -> Result<(), String> {
        let elements: Vec<ElementId> = if self.results.is_empty() {
            self.current.into_iter().collect()
        } else {
            self.results.iter().map(|n| n.element()).collect()
        };
        self.results = elements
            .into_iter()
            .filter_map(|id| {
                let index = document.element(id).attributes.iter().position(|a| a.name == name)?;
                Some(XPathNode::Attribute(id, index))
            })
            .collect();
        if self.results.is_empty() {
            return Err(NOT_FOUND.to_string());
        }
        Ok(())
    }

    /// Elements a predicate selects from.
    fn candidates(&self, document: &XmlMessage) -> Vec<ElementId> {
        if !self.results.is_empty() {
            return self.results.iter().map(|n| n.element()).collect();
        }
        let Some(current) = self.current else {
            return Vec::new();
        };
        match document.parent(current) {
            Some(parent) => {
                let name = &document.element(current).name;
                document
                    .children(parent)
                    .iter()
                    .copied()
                    .filter(|&c| &document.element(c).name == name)
                    .collect()
            }
            None => vec![current],
        }
    }

    fn select_one(&mut self, chosen: ElementId) {
        if self.results.is_empty() {
            self.current = Some(chosen);
        } else {
            self.results = vec![XPathNode::Element(chosen)];
        }
    }

    fn predicate(&mut self, document: &XmlMessage, tokens: &[Token], pos: &mut usize) -> Result<(), String> {
        *pos += 1;
        let candidates = self.candidates(document);
        if candidates.is_empty() {
            return Err(NOT_FOUND.to_string());
        }

        match tokens.get(*pos) {
            Some(Token::Number(text)) => {
                let index: usize = text
                    .parse()
                    .map_err(|_| format!("Invalid position '{text}'"))?;
                let chosen = index
                    .checked_sub(1)
                    .and_then(|i| candidates.get(i))
                    .copied()
                    .ok_or_else(|| format!("Position {index} out of range"))?;
                *pos += 1;
                self.select_one(chosen);
            }
            Some(Token::Name(name)) if tokens.get(*pos + 1) == Some(&Token::LParen) => {
                let function = name.clone();
                *pos += 2;
                self.function(document, &function, candidates, tokens, pos)?;
            }
            Some(_) => {
                let operand = parse_operand(tokens, pos)?;
                let comparison = match tokens.get(*pos) {
                    Some(Token::Op(op)) => {
                        let op = *op;
                        *pos += 1;
                        let literal = tokens.get(*pos).cloned();
                        *pos += 1;
                        match literal {
                            Some(Token::Literal(text)) => Some((op, Comparand::Text(text))),
                            Some(Token::Number(text)) => {
                                let number = BigDecimal::from_str(&text)
                                    .map_err(|_| format!("Invalid number '{text}'"))?;
                                Some((op, Comparand::Number(number)))
                            }
                            _ => return Err("Literal or number expected after operator".to_string()),
                        }
                    }
                    _ => None,
                };
                let kept: Vec<ElementId> = candidates
                    .into_iter()
                    .filter(|&id| {
                        let Some(value) = operand_value(document, id, &operand) else {
                            return false;
                        };
                        match &comparison {
                            None => true,
                            Some((op, comparand)) => compare(value, *op, comparand),
                        }
                    })
                    .collect();
                self.set_filtered(kept)?;
            }
            None => return Err("Unterminated predicate".to_string()),
        }

        if tokens.get(*pos) != Some(&Token::Close) {
            return Err("Missing ']' in XPath".to_string());
        }
        *pos += 1;
        Ok(())
    }

    fn function(
        &mut self,
        document: &XmlMessage,
        name: &str,
        candidates: Vec<ElementId>,
        tokens: &[Token],
        pos: &mut usize,
    ) -> Result<(), String> {
        match name {
            "last" => {
                if tokens.get(*pos) != Some(&Token::RParen) {
                    return Err("last() takes no arguments".to_string());
                }
                *pos += 1;
                if let Some(&chosen) = candidates.last() {
                    self.select_one(chosen);
                }
                Ok(())
            }
            "contains" | "starts-with" => {
                let operand = parse_operand(tokens, pos)?;
                if tokens.get(*pos) != Some(&Token::Comma) {
                    return Err(format!("{name}() needs two arguments"));
                }
                *pos += 1;
                let Some(Token::Literal(text)) = tokens.get(*pos).cloned() else {
                    return Err(format!("{name}() needs a quoted text argument"));
                };
                *pos += 1;
                if tokens.get(*pos) != Some(&Token::RParen) {
                    return Err(format!("Missing ')' after {name}()"));
                }
                *pos += 1;
                let starts = name == "starts-with";
                let kept = candidates
                    .into_iter()
                    .filter(|&id| {
                        operand_value(document, id, &operand).is_some_and(|value| {
                            if starts {
                                value.starts_with(text.as_str())
                            } else {
                                value.contains(text.as_str())
                            }
                        })
                    })
                    .collect();
                self.set_filtered(kept)
            }
            other => Err(format!("Unsupported XPath function '{other}()'")),
        }
    }

    fn set_filtered(&mut self, kept: Vec<ElementId>) -> Result<(), String> {
        if kept.is_empty() {
            return Err(NOT_FOUND.to_string());
        }
        self.results = kept.into_iter().map(XPathNode::Element).collect();
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Comparand {
    Text(String),
    Number(BigDecimal),
}

fn parse_operand(tokens: &[Token], pos: &mut usize) -> Result<Operand, String> {
    match tokens.get(*pos) {
        Some(Token::Dot) => {
            *pos += 1;
            Ok(Operand::Own)
        }
        Some(Token::Name(name)) => {
            *pos += 1;
            Ok(Operand::Child(name.clone()))
        }
        Some(Token::At) => match tokens.get(*pos + 1) {
            Some(Token::Name(name)) => {
                *pos += 2;
                Ok(Operand::Attribute(name.clone()))
            }
            _ => Err("Attribute name expected after '@'".to_string()),
        },
        _ => Err("Element or attribute expected in predicate".to_string()),
    }
}

fn operand_value<'a>(document: &'a XmlMessage, id: ElementId, operand: &Operand) -> Option<&'a str> {
    match operand {
        Operand::Own => Some(document.element(id).value.as_str()),
        Operand::Child(name) => document
            .find_child(id, name)
            .map(|child| document.element(child).value.as_str()),
        Operand::Attribute(name) => document.find_attribute(id, name).map(|a| a.value.as_str()),
    }
}

fn compare(value: &str, op: char, comparand: &Comparand) -> bool {
    let ordering = match comparand {
        Comparand::Text(text) => value.cmp(text.as_str()),
        Comparand::Number(number) => match BigDecimal::from_str(value.trim()) {
            Ok(parsed) => parsed.cmp(number),
            Err(_) => return false,
        },
    };
    match op {
        '=' => ordering == Ordering::Equal,
        '<' => ordering == Ordering::Less,
        '>' => ordering == Ordering::Greater,
        _ => false,
    }
}

fn tokenize(path: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = path.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '@' => {
                tokens.push(Token::At);
                i += 1;
            }
            '[' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ']' => {
                tokens.push(Token::Close);
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
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '=' | '<' | '>' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '\'' | '"' => {
                let begin = i + 1;
                let end = chars[begin..]
                    .iter()
                    .position(|&ch| ch == c)
                    .map(|offset| begin + offset)
                    .ok_or_else(|| "Unterminated string in XPath".to_string())?;
                tokens.push(Token::Literal(chars[begin..end].iter().collect()));
                i = end + 1;
            }
            '.' if !chars.get(i + 1).is_some_and(|ch| ch.is_ascii_digit()) => {
                tokens.push(Token::Dot);
                i += 1;
            }
            _ if c.is_ascii_digit() || c == '.' || (c == '-' && chars.get(i + 1).is_some_and(|ch| ch.is_ascii_digit())) => {
                let begin = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Number(chars[begin..i].iter().collect()));
            }
            _ if c.is_alphanumeric() || c == '_' => {
                let begin = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '-' | ':' | '.'))
                {
                    i += 1;
                }
                tokens.push(Token::Name(chars[begin..i].iter().collect()));
            }
            other => return Err(format!("Unexpected '{other}' in XPath")),
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items() -> Arc<XmlMessage> {
        let mut doc = XmlMessage::new("root");
        let root = doc.root().unwrap();
        doc.add_element(root, "item", "a");
        doc.add_element(root, "item", "b");
        Arc::new(doc)
    }

    fn catalog() -> Arc<XmlMessage> {
        let mut doc = XmlMessage::new("catalog");
        let root = doc.root().unwrap();
        for (id, title, price) in [("1", "Rust in Action", "39.99"), ("2", "Programming Rust", "49.50"), ("3", "Rust Atomics", "9.95")] {
            let book = doc.add_element(root, "book", "");
            doc.set_attribute(book, "id", id);
            doc.add_element(book, "title", title);
            doc.add_element(book, "price", price);
        }
        Arc::new(doc)
    }

    fn value_of(path: &XPath) -> Option<&str> {
        path.first_result().and_then(|node| path.value(node))
    }

    #[test]
    fn test_positional_index() {
        let path = XPath::new(items(), "/root/item[2]");
        assert_eq!(path.status(), XPathStatus::Element);
        assert_eq!(path.len(), 1);
        assert_eq!(value_of(&path), Some("b"));
    }

    #[test]
    fn test_root_only() {
        let path = XPath::new(items(), "/");
        assert_eq!(path.status(), XPathStatus::Root);
        assert_eq!(path.len(), 1);
    }

    #[test]
    fn test_anchor_required() {
        let path = XPath::new(items(), "root/item");
        assert_eq!(path.status(), XPathStatus::Invalid);
        assert!(path.error_text().contains('/'));
    }

    #[test]
    fn test_missing_root_element() {
        let path = XPath::new(Arc::new(XmlMessage::empty()), "/root");
        assert_eq!(path.status(), XPathStatus::Invalid);
    }

    #[test]
    fn test_recursive_descent() {
        let path = XPath::new(catalog(), "//title");
        assert_eq!(path.len(), 3);
        assert_eq!(value_of(&path), Some("Rust in Action"));
    }

    #[test]
    fn test_attribute_step() {
        let path = XPath::new(catalog(), "/catalog/book/@id");
        assert_eq!(path.status(), XPathStatus::Attribute);
        assert_eq!(value_of(&path), Some("1"));
    }

    #[test]
    fn test_last_function() {
        let path = XPath::new(catalog(), "/catalog/book[last()]/title");
        assert_eq!(value_of(&path), Some("Rust Atomics"));
    }

    #[test]
    fn test_contains_and_starts_with() {
        let path = XPath::new(catalog(), "/catalog/book[contains(title,'Programming')]");
        assert_eq!(path.len(), 1);
        let path = XPath::new(catalog(), "//book[starts-with(title,'Rust')]");
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn test_numeric_and_string_comparison() {
        let cheap = XPath::new(catalog(), "//book[price<40]");
        assert_eq!(cheap.len(), 2);
        let exact = XPath::new(catalog(), "//book[title='Programming Rust']");
        assert_eq!(exact.len(), 1);
        let by_attribute = XPath::new(catalog(), "//book[@id>'1']");
        assert_eq!(by_attribute.len(), 2);
    }

    #[test]
    fn test_reduction_keeps_order() {
        let mut doc = XmlMessage::new("root");
        let root = doc.root().unwrap();
        let first = doc.add_element(root, "entry", "");
        doc.add_element(first, "flag", "x");
        doc.add_element(root, "entry", "");
        let third = doc.add_element(root, "entry", "");
        doc.add_element(third, "flag", "y");
        let path = XPath::new(Arc::new(doc), "//entry/flag");
        assert_eq!(path.results(), &[XPathNode::Element(first), XPathNode::Element(third)]);
    }

    #[test]
    fn test_no_match_is_invalid() {
        let path = XPath::new(items(), "/root/missing");
        assert_eq!(path.status(), XPathStatus::Invalid);
        assert_eq!(path.error_text(), NOT_FOUND);
        let path = XPath::new(items(), "/root/item[5]");
        assert_eq!(path.status(), XPathStatus::Invalid);
    }
}
