//! XML document tree and XPath queries.
//!
//! Only navigation is provided: documents are assembled in code through
//! [`XmlMessage`] and then queried with [`XPath`].

pub mod document;
pub mod path;

pub use document::{ElementId, XmlAttribute, XmlBuilder, XmlElement, XmlMessage};
pub use path::{XPath, XPathNode, XPathStatus};
