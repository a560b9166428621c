//! JSONPath evaluation over a shared [`JsonMessage`].
//!
//! Supported syntax: `$`, `.name`, `['name']`, `[n]` (negative counts from
//! the end), `.*` / `[*]`, `..name`, `[start:end:step]` and `[i,j,k]`.
//! Slices and unions are only accepted as the last segment.
//!
//! Results are positions into the document, not copies. The evaluator
//! holds its document through an `Arc`; the document cannot change while a
//! path refers to it.

use std::sync::Arc;

use crate::json::value::{JsonKind, JsonMessage, JsonValue};

const NOT_FOUND: &str = "Path not found in the JSON document";

/// Outcome of the last evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    /// Nothing evaluated yet.
    None,
    Invalid,
    /// `$` on its own.
    WholeDocument,
    String,
    Int,
    Decimal,
    Constant,
    Array,
    Object,
}

impl PathStatus {
    fn from_kind(kind: JsonKind) -> Self {
        match kind {
            JsonKind::String => PathStatus::String,
            JsonKind::Int => PathStatus::Int,
            JsonKind::Decimal => PathStatus::Decimal,
            JsonKind::Null | JsonKind::Bool => PathStatus::Constant,
            JsonKind::Array => PathStatus::Array,
            JsonKind::Object => PathStatus::Object,
        }
    }
}

/// Reference to a node: child positions walked from the document root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct NodeRef(Vec<usize>);

impl NodeRef {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    fn child(&self, position: usize) -> Self {
        let mut positions = self.0.clone();
        positions.push(position);
        Self(positions)
    }

    pub fn positions(&self) -> &[usize] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Member { name: String, recursive: bool },
    Wildcard { recursive: bool },
    Index(i64),
    Slice { start: Option<i64>, end: Option<i64>, step: i64 },
    Union(Vec<i64>),
}

/// A JSONPath query bound to one document.
#[derive(Debug)]
pub struct JsonPath {
    document: Option<Arc<JsonMessage>>,
    path: String,
    status: PathStatus,
    results: Vec<NodeRef>,
    error: String,
}

impl JsonPath {
    /// Bind `path` to `document` and evaluate it.
    pub fn new(document: Arc<JsonMessage>, path: &str) -> Self {
        let mut query = Self {
            document: Some(document),
            path: path.to_string(),
            status: PathStatus::None,
            results: Vec::new(),
            error: String::new(),
        };
        query.evaluate();
        query
    }

    /// Attach another document, dropping the old handle, and re-evaluate.
    pub fn set_document(&mut self, document: Arc<JsonMessage>) -> bool {
        self.document = Some(document);
        self.evaluate()
    }

    pub fn set_path(&mut self, path: &str) -> bool {
        self.path = path.to_string();
        self.evaluate()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn status(&self) -> PathStatus {
        self.status
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self.status, PathStatus::Invalid | PathStatus::None)
    }

    /// Reason for an `Invalid` status.
    pub fn error_text(&self) -> &str {
        &self.error
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn result_refs(&self) -> &[NodeRef] {
        &self.results
    }

    pub fn result(&self, index: usize) -> Option<&JsonValue> {
        let node = self.results.get(index)?;
        self.document.as_ref()?.value().resolve(node.positions())
    }

    pub fn first_result(&self) -> Option<&JsonValue> {
        self.result(0)
    }

    pub fn results(&self) -> impl Iterator<Item = &JsonValue> + '_ {
        let root = self.document.as_ref().map(|d| d.value());
        self.results
            .iter()
            .filter_map(move |node| root.and_then(|r| r.resolve(node.positions())))
    }

    fn invalid(&mut self, reason: &str) -> bool {
        self.status = PathStatus::Invalid;
        self.results.clear();
        self.error = reason.to_string();
        tracing::debug!(path = %self.path, reason, "JSONPath invalid");
        false
    }

    /// Run the query. Returns true if at least one node matched.
    pub fn evaluate(&mut self) -> bool {
        self.status = PathStatus::None;
        self.results.clear();
        self.error.clear();

        let Some(document) = self.document.clone() else {
            return self.invalid("No JSON document to search");
        };
        let path = self.path.trim().to_string();
        let Some(rest) = path.strip_prefix('$') else {
            return self.invalid("JSONPath must start with '$'");
        };
        if rest.is_empty() {
            self.status = PathStatus::WholeDocument;
            self.results.push(NodeRef::root());
            return true;
        }
        if !rest.starts_with('.') && !rest.starts_with('[') {
            return self.invalid("Expected '.' or '[' after '$'");
        }

        let segments = match tokenize(rest) {
            Ok(segments) => segments,
            Err(reason) => return self.invalid(&reason),
        };

        let root = document.value();
        let mut current = vec![NodeRef::root()];
        let last = segments.len().saturating_sub(1);

        for (i, segment) in segments.iter().enumerate() {
            let is_last = i == last;
            let next = match segment {
                Segment::Member { name, recursive } => {
                    let mut found = Vec::new();
                    for node in &current {
                        if let Some(value) = root.resolve(node.positions()) {
                            find_member(value, node, name, *recursive, &mut found);
                        }
                    }
                    found
                }
                Segment::Wildcard { recursive } => {
                    let mut found = Vec::new();
                    for node in &current {
                        if let Some(value) = root.resolve(node.positions()) {
                            wildcard(value, node, *recursive, &mut found);
                        }
                    }
                    found
                }
                Segment::Index(index) => current
                    .iter()
                    .filter_map(|node| {
                        let value = root.resolve(node.positions())?;
                        let items = value.as_array()?;
                        resolve_index(*index, items.len()).map(|p| node.child(p))
                    })
                    .collect(),
                Segment::Slice { start, end, step } => {
                    if !is_last {
                        return self.invalid("Array slice must be the last path element");
                    }
                    match slice(root, &current, *start, *end, *step) {
                        Ok(found) => found,
                        Err(reason) => return self.invalid(reason),
                    }
                }
                Segment::Union(indices) => {
                    if !is_last {
                        return self.invalid("Index union must be the last path element");
                    }
                    match union(root, &current, indices) {
                        Ok(found) => found,
                        Err(reason) => return self.invalid(reason),
                    }
                }
            };

            if next.is_empty() {
                return self.invalid(NOT_FOUND);
            }
            if matches!(segment, Segment::Slice { .. } | Segment::Union(_)) {
                self.status = PathStatus::Array;
            } else if let Some(value) = next.first().and_then(|n| root.resolve(n.positions())) {
                self.status = PathStatus::from_kind(value.kind());
            }
            current = next;
        }

        self.results = current;
        true
    }
}

fn find_member(value: &JsonValue, node: &NodeRef, name: &str, recursive: bool, found: &mut Vec<NodeRef>) {
    match value {
        JsonValue::Object(pairs) => {
            for (position, pair) in pairs.iter().enumerate() {
                if pair.name == name {
                    found.push(node.child(position));
                    if !recursive {
                        return;
                    }
                }
                if recursive {
                    find_member(&pair.value, &node.child(position), name, true, found);
                }
            }
        }
        JsonValue::Array(items) if recursive => {
            for (position, item) in items.iter().enumerate() {
                find_member(item, &node.child(position), name, true, found);
            }
        }
        _ => {}
    }
}

fn wildcard(value: &JsonValue, node: &NodeRef, recursive: bool, found: &mut Vec<NodeRef>) {
    match value {
        JsonValue::Array(_) | JsonValue::Object(_) => {
            for position in 0..value.len() {
                let child = node.child(position);
                found.push(child.clone());
                if recursive {
                    if let Some(inner) = value.child(position) {
                        wildcard(inner, &child, true, found);
                    }
                }
            }
        }
        _ if !recursive => found.push(node.clone()),
        _ => {}
    }
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let position = if index < 0 { len + index } else { index };
    (0..len).contains(&position).then_some(position as usize)
}

const SLICE_OUT_OF_RANGE: &str = "Array slice index out of range";

fn slice(
    root: &JsonValue,
    current: &[NodeRef],
    start: Option<i64>,
    end: Option<i64>,
    step: i64,
) -> Result<Vec<NodeRef>, &'static str> {
    if step == 0 {
        return Err("Array slice step cannot be zero");
    }
    let mut found = Vec::new();
    for node in current {
        let Some(items) = root.resolve(node.positions()).and_then(|v| v.as_array()) else {
            continue;
        };
        // i128 keeps bound and step arithmetic clear of overflow.
        let len = items.len() as i128;
        let step = i128::from(step);
        let normalize = |bound: i64| {
            let bound = i128::from(bound);
            if bound < 0 {
                len + bound
            } else {
                bound
            }
        };
        let start = start.map(normalize).unwrap_or(0).max(0);
        let end = end.map(normalize).unwrap_or(len);
        if start > end {
            return Err("Array slice start lies beyond its end");
        }

        if step > 0 {
            let mut i = start;
            while i < end {
                if i >= len {
                    if found.is_empty() {
                        return Err(SLICE_OUT_OF_RANGE);
                    }
                    break;
                }
                found.push(node.child(i as usize));
                i += step;
            }
        } else {
            let mut i = end - 1;
            if i >= len {
                if found.is_empty() {
                    return Err(SLICE_OUT_OF_RANGE);
                }
                // Skip to the last position of the run inside the array.
                let stride = -step;
                i -= (i - (len - 1) + stride - 1) / stride * stride;
            }
            while i >= start {
                found.push(node.child(i as usize));
                i += step;
            }
        }
    }
    Ok(found)
}

fn union(root: &JsonValue, current: &[NodeRef], indices: &[i64]) -> Result<Vec<NodeRef>, &'static str> {
    let mut found = Vec::new();
    for node in current {
        let Some(items) = root.resolve(node.positions()).and_then(|v| v.as_array()) else {
            continue;
        };
        for &index in indices {
            match resolve_index(index, items.len()) {
                Some(position) => found.push(node.child(position)),
                None if found.is_empty() => return Err("Array index in union out of range"),
                None => break,
            }
        }
    }
    Ok(found)
}

fn tokenize(path: &str) -> Result<Vec<Segment>, String> {
    let chars: Vec<char> = path.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                let recursive = chars.get(i + 1) == Some(&'.');
                i += if recursive { 2 } else { 1 };
                match chars.get(i) {
                    Some('*') => {
                        segments.push(Segment::Wildcard { recursive });
                        i += 1;
                    }
                    Some('[') if recursive => {
                        let (inner, next) = bracket(&chars, i)?;
                        match parse_bracket(&inner)? {
                            Segment::Member { name, .. } => {
                                segments.push(Segment::Member { name, recursive: true })
                            }
                            Segment::Wildcard { .. } => segments.push(Segment::Wildcard { recursive: true }),
                            _ => return Err("Only names may follow '..'".to_string()),
                        }
                        i = next;
                    }
                    Some(_) => {
                        let begin = i;
                        while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                            i += 1;
                        }
                        let name: String = chars[begin..i].iter().collect();
                        if name.is_empty() {
                            return Err("Empty member name in path".to_string());
                        }
                        segments.push(Segment::Member { name, recursive });
                    }
                    None => return Err("Path ends with a '.'".to_string()),
                }
            }
            '[' => {
                let (inner, next) = bracket(&chars, i)?;
                segments.push(parse_bracket(&inner)?);
                i = next;
            }
            other => return Err(format!("Unexpected '{other}' in path")),
        }
    }
    Ok(segments)
}

/// Contents of the bracket starting at `open`, and the index after `]`.
fn bracket(chars: &[char], open: usize) -> Result<(String, usize), String> {
    let mut i = open + 1;
    let mut quote: Option<char> = None;
    while i < chars.len() {
        match (chars[i], quote) {
            (c, Some(q)) if c == q => quote = None,
            ('\'' | '"', None) => quote = Some(chars[i]),
            (']', None) => {
                let inner: String = chars[open + 1..i].iter().collect();
                return Ok((inner.trim().to_string(), i + 1));
            }
            _ => {}
        }
        i += 1;
    }
    Err("Missing ']' in path".to_string())
}

fn parse_bracket(inner: &str) -> Result<Segment, String> {
    if inner == "*" {
        return Ok(Segment::Wildcard { recursive: false });
    }
    if let Some(name) = unquote(inner) {
        return Ok(Segment::Member {
            name: name.to_string(),
            recursive: false,
        });
    }
    if inner.contains(':') {
        let parts: Vec<&str> = inner.split(':').map(str::trim).collect();
        if parts.len() > 3 {
            return Err(format!("Invalid slice '{inner}'"));
        }
        let bound = |text: &str| -> Result<Option<i64>, String> {
            if text.is_empty() {
                Ok(None)
            } else {
                text.parse::<i64>()
                    .map(Some)
                    .map_err(|_| format!("Invalid slice bound '{text}'"))
            }
        };
        let start = bound(parts[0])?;
        let end = bound(parts.get(1).copied().unwrap_or(""))?;
        let step = bound(parts.get(2).copied().unwrap_or(""))?.unwrap_or(1);
        return Ok(Segment::Slice { start, end, step });
    }
    if inner.contains(',') {
        let indices = inner
            .split(',')
            .map(|part| part.trim().parse::<i64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| format!("Invalid index union '{inner}'"))?;
        return Ok(Segment::Union(indices));
    }
    inner
        .parse::<i64>()
        .map(Segment::Index)
        .map_err(|_| format!("Invalid array index '{inner}'"))
}

fn unquote(text: &str) -> Option<&str> {
    let first = text.chars().next()?;
    if (first == '\'' || first == '"') && text.len() >= 2 && text.ends_with(first) {
        return Some(&text[1..text.len() - 1]);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(text: &str) -> Arc<JsonMessage> {
        let message = JsonMessage::parse(text);
        assert!(message.is_valid());
        Arc::new(message)
    }

    const STORE: &str = r#"{"store":{"book":[{"title":"A","price":8},{"title":"B","price":12.5}],"bicycle":{"color":"red"}}}"#;

    #[test]
    fn test_member_and_index() {
        let path = JsonPath::new(doc(STORE), "$.store.book[0].title");
        assert_eq!(path.status(), PathStatus::String);
        assert_eq!(path.len(), 1);
        assert_eq!(path.first_result().and_then(|v| v.as_str()), Some("A"));
    }

    #[test]
    fn test_slice_with_step() {
        let path = JsonPath::new(doc(r#"{"arr":[0,1,2,3,4,5]}"#), "$.arr[1:4:2]");
        let values: Vec<i32> = path.results().filter_map(|v| v.as_i32()).collect();
        assert_eq!(values, vec![1, 3]);
        assert_eq!(path.status(), PathStatus::Array);
    }

    #[test]
    fn test_negative_step_reverses() {
        let path = JsonPath::new(doc(r#"[0,1,2,3,4,5]"#), "$[1:4:-1]");
        let values: Vec<i32> = path.results().filter_map(|v| v.as_i32()).collect();
        assert_eq!(values, vec![3, 2, 1]);
    }

    #[test]
    fn test_slice_errors() {
        let document = doc(r#"[0,1,2]"#);
        let zero = JsonPath::new(document.clone(), "$[0:2:0]");
        assert_eq!(zero.status(), PathStatus::Invalid);
        let reversed = JsonPath::new(document.clone(), "$[2:1]");
        assert_eq!(reversed.status(), PathStatus::Invalid);
        let not_last = JsonPath::new(document, "$[0:1].x");
        assert_eq!(not_last.status(), PathStatus::Invalid);
    }

    #[test]
    fn test_slice_out_of_range_keeps_partial_results() {
        let path = JsonPath::new(doc(r#"[0,1,2]"#), "$[1:10]");
        let values: Vec<i32> = path.results().filter_map(|v| v.as_i32()).collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn test_slice_bounds_beyond_array() {
        let document = doc(r#"[0,1,2]"#);
        let wide = JsonPath::new(document.clone(), "$[0:9223372036854775807]");
        let values: Vec<i32> = wide.results().filter_map(|v| v.as_i32()).collect();
        assert_eq!(values, vec![0, 1, 2]);

        let huge_step = JsonPath::new(document.clone(), "$[1:5:9223372036854775807]");
        let values: Vec<i32> = huge_step.results().filter_map(|v| v.as_i32()).collect();
        assert_eq!(values, vec![1]);

        let huge_back = JsonPath::new(document.clone(), "$[0:3:-9223372036854775808]");
        let values: Vec<i32> = huge_back.results().filter_map(|v| v.as_i32()).collect();
        assert_eq!(values, vec![2]);

        let beyond = JsonPath::new(document.clone(), "$[5:9]");
        assert_eq!(beyond.status(), PathStatus::Invalid);
        assert_eq!(beyond.error_text(), SLICE_OUT_OF_RANGE);

        let reversed_beyond = JsonPath::new(document, "$[0:9:-1]");
        assert_eq!(reversed_beyond.status(), PathStatus::Invalid);
    }

    #[test]
    fn test_negative_index() {
        let path = JsonPath::new(doc(STORE), "$.store.book[-1].title");
        assert_eq!(path.first_result().and_then(|v| v.as_str()), Some("B"));
    }

    #[test]
    fn test_bracket_member() {
        let path = JsonPath::new(doc(STORE), "$['store']['bicycle'].color");
        assert_eq!(path.first_result().and_then(|v| v.as_str()), Some("red"));
    }

    #[test]
    fn test_wildcard_values() {
        let path = JsonPath::new(doc(STORE), "$.store.bicycle.*");
        assert_eq!(path.len(), 1);
        let path = JsonPath::new(doc(STORE), "$.store.*");
        assert_eq!(path.len(), 2);
        assert_eq!(path.status(), PathStatus::Array);
    }

    #[test]
    fn test_wildcard_on_scalar_returns_scalar() {
        let path = JsonPath::new(doc(r#"{"a":5}"#), "$.a.*");
        assert_eq!(path.first_result(), Some(&JsonValue::Int(5)));
    }

    #[test]
    fn test_recursive_descent() {
        let path = JsonPath::new(doc(STORE), "$..title");
        let titles: Vec<&str> = path.results().filter_map(|v| v.as_str()).collect();
        assert_eq!(titles, vec!["A", "B"]);
    }

    #[test]
    fn test_union_leniency() {
        let document = doc(r#"[10,20,30]"#);
        let path = JsonPath::new(document.clone(), "$[0,2]");
        assert_eq!(path.len(), 2);
        assert_eq!(path.status(), PathStatus::Array);
        let partial = JsonPath::new(document.clone(), "$[1,7,0]");
        let values: Vec<i32> = partial.results().filter_map(|v| v.as_i32()).collect();
        assert_eq!(values, vec![20]);
        let none = JsonPath::new(document, "$[7,1]");
        assert_eq!(none.status(), PathStatus::Invalid);
    }

    #[test]
    fn test_root_anchor_required() {
        let path = JsonPath::new(doc(STORE), "store.book");
        assert_eq!(path.status(), PathStatus::Invalid);
        assert!(path.error_text().contains('$'));
        let path = JsonPath::new(doc(STORE), "$store");
        assert_eq!(path.status(), PathStatus::Invalid);
    }

    #[test]
    fn test_whole_document() {
        let path = JsonPath::new(doc(STORE), "$");
        assert_eq!(path.status(), PathStatus::WholeDocument);
        assert_eq!(path.len(), 1);
    }

    #[test]
    fn test_no_match_reports_invalid() {
        let path = JsonPath::new(doc(STORE), "$.store.car");
        assert_eq!(path.status(), PathStatus::Invalid);
        assert_eq!(path.error_text(), NOT_FOUND);
        assert!(path.is_empty());
    }

    #[test]
    fn test_reattach_releases_document() {
        let first = doc(STORE);
        let mut path = JsonPath::new(first.clone(), "$.store.bicycle.color");
        assert_eq!(Arc::strong_count(&first), 2);
        path.set_document(doc(r#"{"store":{"bicycle":{"color":"blue"}}}"#));
        assert_eq!(Arc::strong_count(&first), 1);
        assert_eq!(path.first_result().and_then(|v| v.as_str()), Some("blue"));
    }
}
