//! Arena-backed XML document.
//!
//! Elements live in one `Vec` and refer to each other by [`ElementId`].
//! A document is built through [`XmlBuilder`] or [`XmlMessage::new`] and
//! the `add_*` methods, then usually shared as `Arc<XmlMessage>`. Once shared it is
//! read-only.

/// Index of an element inside its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(usize);

impl ElementId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlAttribute {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct XmlElement {
    pub name: String,
    pub value: String,
    pub attributes: Vec<XmlAttribute>,
    pub children: Vec<ElementId>,
    pub parent: Option<ElementId>,
}

impl XmlElement {
    fn new(name: &str, value: &str, parent: Option<ElementId>) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            attributes: Vec::new(),
            children: Vec::new(),
            parent,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&XmlAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// An XML document with a single root element.
#[derive(Debug, Clone)]
pub struct XmlMessage {
    elements: Vec<XmlElement>,
}

impl XmlMessage {
    pub fn new(root_name: &str) -> Self {
        Self {
            elements: vec![XmlElement::new(root_name, "", None)],
        }
    }

    /// A document without any element.
    pub fn empty() -> Self {
        Self { elements: Vec::new() }
    }

    pub fn root(&self) -> Option<ElementId> {
        (!self.elements.is_empty()).then_some(ElementId(0))
    }

    pub fn element(&self, id: ElementId) -> &XmlElement {
        &self.elements[id.0]
    }

    pub fn get(&self, id: ElementId) -> Option<&XmlElement> {
        self.elements.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Append a child element under `parent`.
    pub fn add_element(&mut self, parent: ElementId, name: &str, value: &str) -> ElementId {
        let id = ElementId(self.elements.len());
        self.elements.push(XmlElement::new(name, value, Some(parent)));
        self.elements[parent.0].children.push(id);
        id
    }

    pub fn set_attribute(&mut self, element: ElementId, name: &str, value: &str) {
        let attributes = &mut self.elements[element.0].attributes;
        match attributes.iter_mut().find(|a| a.name == name) {
            Some(existing) => existing.value = value.to_string(),
            None => attributes.push(XmlAttribute {
                name: name.to_string(),
                value: value.to_string(),
            }),
        }
    }

    pub fn set_value(&mut self, element: ElementId, value: &str) {
        self.elements[element.0].value = value.to_string();
    }

    pub fn children(&self, id: ElementId) -> &[ElementId] {
        &self.elements[id.0].children
    }

    pub fn parent(&self, id: ElementId) -> Option<ElementId> {
        self.elements[id.0].parent
    }

    /// First element named `name`: `start` itself, then its children, and
    /// with `recursive` the whole subtree in document order.
    pub fn find_element(&self, start: ElementId, name: &str, recursive: bool) -> Option<ElementId> {
        if self.element(start).name == name {
            return Some(start);
        }
        for &child in self.children(start) {
            if self.element(child).name == name {
                return Some(child);
            }
            if recursive {
                if let Some(found) = self.find_element(child, name, true) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Direct child named `name`.
    pub fn find_child(&self, parent: ElementId, name: &str) -> Option<ElementId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|&c| self.element(c).name == name)
    }

    /// All descendants of `start` (excluding `start`) named `name`, in
    /// document order. `*` matches any name.
    pub fn descendants_named(&self, start: ElementId, name: &str) -> Vec<ElementId> {
        let mut found = Vec::new();
        self.collect_named(start, name, &mut found);
        found
    }

    fn collect_named(&self, start: ElementId, name: &str, found: &mut Vec<ElementId>) {
        for &child in self.children(start) {
            if name == "*" || self.element(child).name == name {
                found.push(child);
            }
            self.collect_named(child, name, found);
        }
    }

    /// Whether the subtree below `start` holds an element named `name`.
    pub fn subtree_contains(&self, start: ElementId, name: &str, recursive: bool) -> bool {
        self.children(start).iter().any(|&c| {
            self.element(c).name == name || (recursive && self.subtree_contains(c, name, true))
        })
    }

    pub fn find_attribute(&self, element: ElementId, name: &str) -> Option<&XmlAttribute> {
        self.element(element).attribute(name)
    }
}

/// Fluent construction of an [`XmlMessage`].
///
/// `open` descends into a new element, `close` returns to its parent;
/// `leaf` and `attr` act on the element currently open.
#[derive(Debug)]
pub struct XmlBuilder {
    doc: XmlMessage,
    stack: Vec<ElementId>,
}

impl XmlBuilder {
    pub fn new(root_name: &str) -> Self {
        Self {
            doc: XmlMessage::new(root_name),
            stack: vec![ElementId(0)],
        }
    }

    fn current(&self) -> ElementId {
        self.stack.last().copied().unwrap_or(ElementId(0))
    }

    pub fn open(mut self, name: &str) -> Self {
        let id = self.doc.add_element(self.current(), name, "");
        self.stack.push(id);
        self
    }

    pub fn close(mut self) -> Self {
        if self.stack.len() > 1 {
            self.stack.pop();
        }
        self
    }

    pub fn leaf(mut self, name: &str, value: &str) -> Self {
        self.doc.add_element(self.current(), name, value);
        self
    }

    pub fn text(mut self, value: &str) -> Self {
        let current = self.current();
        self.doc.set_value(current, value);
        self
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        let current = self.current();
        self.doc.set_attribute(current, name, value);
        self
    }

    pub fn build(self) -> XmlMessage {
        self.doc
    }
}
