//! Page Parser
//!
//! HTML to normalised text, links, file-link candidates, keywords and PGP
//! markers. Pure; no I/O. Text extraction inserts separators at block-level
//! boundaries before whitespace collapsing, so adjacent block contents never
//! concatenate into joined tokens.

use crate::content;
use crate::{FileLink, Link};
use ego_tree::NodeRef;
use scraper::{Html, Node, Selector};
use std::collections::HashSet;

/// Parsed view of one fetched page.
#[derive(Debug, Clone, Default)]
pub struct ParsedPage {
    pub title: Option<String>,
    /// Visible text with runs of whitespace collapsed to single spaces.
    pub text: String,
    pub links: Vec<Link>,
    pub file_links: Vec<FileLink>,
    /// Canonical dictionary keywords present in the text.
    pub keywords: Vec<String>,
    pub pgp_detected: bool,
}

const PGP_BEGIN: &str = "-----BEGIN PGP";
const PGP_END: &str = "-----END PGP";

/// Extensions that mark a link as a downloadable-file candidate.
fn default_file_extensions() -> HashSet<String> {
    [
        "pdf", "doc", "docx", "xls", "xlsx", "zip", "rar", "7z", "tar", "gz", "exe", "apk",
        "bin", "iso", "img", "dmg",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn is_block_element(name: &str) -> bool {
    matches!(
        name,
        "p" | "div"
            | "li"
            | "ul"
            | "ol"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "table"
            | "tr"
            | "td"
            | "th"
            | "section"
            | "article"
            | "header"
            | "footer"
            | "form"
            | "pre"
            | "blockquote"
            | "nav"
            | "aside"
            | "main"
            | "hr"
            | "br"
            | "title"
    )
}

fn is_skipped_element(name: &str) -> bool {
    matches!(name, "script" | "style" | "noscript" | "template" | "head")
}

pub struct PageParser {
    file_extensions: HashSet<String>,
    title_selector: Selector,
    anchor_selector: Selector,
}

impl PageParser {
    pub fn new() -> Self {
        Self {
            file_extensions: default_file_extensions(),
            title_selector: Selector::parse("title").expect("title selector"),
            anchor_selector: Selector::parse("a[href]").expect("anchor selector"),
        }
    }

    /// Parse raw HTML (or plain text) into its normalised view. Idempotent on
    /// its own text output: parsing already-normalised text is a fixed point.
    pub fn parse(&self, html: &str) -> ParsedPage {
        let document = Html::parse_document(html);

        let title = document
            .select(&self.title_selector)
            .next()
            .map(|el| collapse_whitespace(&el.text().collect::<String>()))
            .filter(|t| !t.is_empty());

        let mut raw_text = String::new();
        visit_text(document.tree.root(), &mut raw_text);
        let text = collapse_whitespace(&raw_text);

        let mut links = Vec::new();
        let mut file_links = Vec::new();
        for el in document.select(&self.anchor_selector) {
            let href = match el.value().attr("href") {
                Some(h) if !h.trim().is_empty() => h.trim().to_string(),
                _ => continue,
            };
            let anchor_text = collapse_whitespace(&el.text().collect::<String>());
            if let Some(ext) = self.file_extension_of(&href) {
                file_links.push(FileLink {
                    url: href.clone(),
                    extension: ext,
                });
            }
            links.push(Link {
                url: href,
                anchor_text,
            });
        }

        let keywords = content::match_keywords(&text);
        let pgp_detected = text.contains(PGP_BEGIN) || text.contains(PGP_END);

        ParsedPage {
            title,
            text,
            links,
            file_links,
            keywords,
            pgp_detected,
        }
    }

    /// Extension of a URL path when it belongs to the candidate set.
    fn file_extension_of(&self, href: &str) -> Option<String> {
        let path = href.split(['?', '#']).next().unwrap_or(href);
        let segment = path.rsplit('/').next().unwrap_or(path);
        let ext = segment.rsplit_once('.')?.1.to_lowercase();
        if self.file_extensions.contains(&ext) {
            Some(ext)
        } else {
            None
        }
    }
}

impl Default for PageParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Depth-first text extraction with newline separators around block elements.
fn visit_text(node: NodeRef<'_, Node>, out: &mut String) {
    match node.value() {
        Node::Text(t) => out.push_str(&t),
        Node::Element(el) => {
            let name = el.name();
            if is_skipped_element(name) {
                return;
            }
            let block = is_block_element(name);
            if block {
                out.push('\n');
            }
            for child in node.children() {
                visit_text(child, out);
            }
            if block {
                out.push('\n');
            }
        }
        Node::Document | Node::Fragment => {
            for child in node.children() {
                visit_text(child, out);
            }
        }
        _ => {}
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
