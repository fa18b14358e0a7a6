//! Rewriting of user fields inside the XML entries of an export.
//!
//! The documents are never re-serialized. A small scanner finds the spans
//! that hold user names, and replacements are spliced into the original
//! text, so every byte outside a replaced span survives unchanged.

use std::collections::BTreeMap;
use std::ops::Range;

use tracing::{debug, trace};

use crate::config::FieldSet;
use crate::errors::ArchiveError;
use crate::rules::RuleSet;

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Character data between markup.
    Text(Range<usize>),
    /// Contents of a `<![CDATA[...]]>` section, without the delimiters.
    CData(Range<usize>),
    /// `<name attrs>` or `<name attrs/>`; `attrs` excludes the closing `/`.
    Start {
        name: Range<usize>,
        attrs: Range<usize>,
        self_closing: bool,
    },
    End(Range<usize>),
    /// Comments, processing instructions and declarations.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ScanError {
    offset: usize,
    detail: &'static str,
}

struct Scanner<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn next_token(&mut self) -> Result<Option<Token>, ScanError> {
        let bytes = self.src.as_bytes();
        let start = self.pos;
        if start >= bytes.len() {
            return Ok(None);
        }

        if bytes[start] != b'<' {
            let end = self.src[start..]
                .find('<')
                .map_or(bytes.len(), |rel| start + rel);
            self.pos = end;
            return Ok(Some(Token::Text(start..end)));
        }

        let rest = &self.src[start..];
        if rest.starts_with("<!--") {
            let end = self.find_from(start + 4, "-->", "unterminated comment")?;
            self.pos = end + 3;
            return Ok(Some(Token::Other));
        }
        if rest.starts_with("<![CDATA[") {
            let inner = start + 9;
            let end = self.find_from(inner, "]]>", "unterminated CDATA section")?;
            self.pos = end + 3;
            return Ok(Some(Token::CData(inner..end)));
        }
        if rest.starts_with("<?") {
            let end = self.find_from(start + 2, "?>", "unterminated processing instruction")?;
            self.pos = end + 2;
            return Ok(Some(Token::Other));
        }
        if rest.starts_with("<!") {
            self.pos = self.declaration_end(start)?;
            return Ok(Some(Token::Other));
        }
        if rest.starts_with("</") {
            let end = self.find_from(start + 2, ">", "unterminated end tag")?;
            let name = trim_range(self.src, start + 2..end);
            self.pos = end + 1;
            return Ok(Some(Token::End(name)));
        }

        let name_start = start + 1;
        let name_end = bytes[name_start..]
            .iter()
            .position(|&b| b.is_ascii_whitespace() || b == b'/' || b == b'>')
            .map_or(bytes.len(), |rel| name_start + rel);
        if name_end == name_start {
            return Err(ScanError {
                offset: start,
                detail: "tag without a name",
            });
        }

        let gt = self.tag_end(name_end).ok_or(ScanError {
            offset: start,
            detail: "unterminated start tag",
        })?;
        let self_closing = gt > name_end && bytes[gt - 1] == b'/';
        let attrs_end = if self_closing { gt - 1 } else { gt };
        self.pos = gt + 1;
        Ok(Some(Token::Start {
            name: name_start..name_end,
            attrs: name_end..attrs_end,
            self_closing,
        }))
    }

    fn find_from(&self, from: usize, needle: &str, detail: &'static str) -> Result<usize, ScanError> {
        self.src[from..]
            .find(needle)
            .map(|rel| from + rel)
            .ok_or(ScanError {
                offset: self.pos,
                detail,
            })
    }

    /// Position of the `>` closing a start tag, skipping quoted values.
    fn tag_end(&self, from: usize) -> Option<usize> {
        let mut quote: Option<u8> = None;
        for (i, &b) in self.src.as_bytes()[from..].iter().enumerate() {
            match quote {
                Some(q) if b == q => quote = None,
                Some(_) => {}
                None if b == b'"' || b == b'\'' => quote = Some(b),
                None if b == b'>' => return Some(from + i),
                None if b == b'<' => return None,
                None => {}
            }
        }
        None
    }

    /// End of a `<!DOCTYPE ...>`-style declaration, including an internal subset.
    fn declaration_end(&self, start: usize) -> Result<usize, ScanError> {
        let mut depth = 0usize;
        let mut quote: Option<u8> = None;
        for (i, &b) in self.src.as_bytes()[start + 2..].iter().enumerate() {
            match quote {
                Some(q) if b == q => quote = None,
                Some(_) => {}
                None => match b {
                    b'"' | b'\'' => quote = Some(b),
                    b'[' => depth += 1,
                    b']' => depth = depth.saturating_sub(1),
                    b'>' if depth == 0 => return Ok(start + 2 + i + 1),
                    _ => {}
                },
            }
        }
        Err(ScanError {
            offset: start,
            detail: "unterminated declaration",
        })
    }
}

fn trim_range(src: &str, range: Range<usize>) -> Range<usize> {
    let slice = &src[range.clone()];
    let lead = slice.len() - slice.trim_start().len();
    let trail = slice.len() - slice.trim_end().len();
    if lead == slice.len() {
        return range.start..range.start;
    }
    range.start + lead..range.end - trail
}

/// Attribute of a start tag: name span and the span between the quotes.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Attribute {
    name: Range<usize>,
    value: Range<usize>,
}

fn parse_attributes(src: &str, attrs: Range<usize>) -> Vec<Attribute> {
    let bytes = src.as_bytes();
    let end = attrs.end;
    let mut out = Vec::new();
    let mut i = attrs.start;

    let skip_ws = |mut i: usize| {
        while i < end && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        i
    };

    loop {
        i = skip_ws(i);
        if i >= end {
            break;
        }
        let name_start = i;
        while i < end && !bytes[i].is_ascii_whitespace() && bytes[i] != b'=' {
            i += 1;
        }
        let name = name_start..i;
        i = skip_ws(i);
        if i >= end || bytes[i] != b'=' {
            // Valueless attribute: not XML, nothing to rewrite.
            continue;
        }
        i = skip_ws(i + 1);
        if i >= end || (bytes[i] != b'"' && bytes[i] != b'\'') {
            while i < end && !bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            continue;
        }
        let quote = bytes[i];
        let value_start = i + 1;
        let value_end = bytes[value_start..end]
            .iter()
            .position(|&b| b == quote)
            .map_or(end, |rel| value_start + rel);
        out.push(Attribute {
            name,
            value: value_start..value_end,
        });
        i = (value_end + 1).min(end);
    }
    out
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Decode the predefined entities and numeric character references.
///
/// Unknown or malformed references are kept verbatim.
pub fn xml_unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let decoded = after.find(';').and_then(|semi| {
            let entity = &after[..semi];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => decode_char_ref(entity),
            };
            ch.map(|c| (c, semi))
        });
        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &after[semi + 1..];
            }
            None => {
                out.push('&');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_char_ref(entity: &str) -> Option<char> {
    let digits = entity.strip_prefix('#')?;
    let code = match digits.strip_prefix(['x', 'X']) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<u32>().ok()?,
    };
    char::from_u32(code)
}

/// Escape character data.
pub fn xml_escape_text(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Escape an attribute value for either quote style.
pub fn xml_escape_attr(s: &str) -> String {
    xml_escape_text(s)
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

// ---------------------------------------------------------------------------
// Rewrite passes
// ---------------------------------------------------------------------------

/// Rename hits keyed by old identifier.
pub type Hits = BTreeMap<String, usize>;

struct Rewriter<'a> {
    src: &'a str,
    rules: &'a RuleSet,
    fields: &'a FieldSet,
    edits: Vec<(Range<usize>, String)>,
    hits: &'a mut Hits,
}

impl Rewriter<'_> {
    fn rename(&mut self, span: Range<usize>, old: &str, escaped_new: String) {
        trace!(old, at = span.start, "renaming user reference");
        *self.hits.entry(old.to_string()).or_insert(0) += 1;
        self.edits.push((span, escaped_new));
    }

    /// Attribute pass: space-separated tokens of user attributes.
    fn rewrite_attributes(&mut self, attrs: Range<usize>) {
        let (src, rules) = (self.src, self.rules);
        for attr in parse_attributes(src, attrs) {
            if !self.fields.is_user_attribute(&src[attr.name.clone()]) {
                continue;
            }
            let mut offset = attr.value.start;
            for token in src[attr.value.clone()].split(' ') {
                let span = offset..offset + token.len();
                offset = span.end + 1;
                if token.is_empty() {
                    continue;
                }
                let decoded = xml_unescape(token);
                if let Some(new) = rules.lookup(&decoded) {
                    let escaped = xml_escape_attr(new);
                    self.rename(span, &decoded, escaped);
                }
            }
        }
    }

    /// Element-text pass: the whole trimmed text of a leaf user element.
    fn rewrite_text(&mut self, content: Content) {
        let (src, rules) = (self.src, self.rules);
        let (span, decoded, cdata) = match content {
            Content::Text(range) => {
                let core = trim_range(src, range);
                (core.clone(), xml_unescape(&src[core]), false)
            }
            Content::CData(range) => {
                let core = trim_range(src, range);
                (core.clone(), src[core].to_string(), true)
            }
        };
        if decoded.is_empty() {
            return;
        }
        if let Some(new) = rules.lookup(&decoded) {
            let replacement = if cdata {
                new.to_string()
            } else {
                xml_escape_text(new)
            };
            self.rename(span, &decoded, replacement);
        }
    }

    fn finish(self) -> Option<String> {
        if self.edits.is_empty() {
            return None;
        }
        let mut out = String::with_capacity(self.src.len());
        let mut last = 0;
        for (span, replacement) in &self.edits {
            out.push_str(&self.src[last..span.start]);
            out.push_str(replacement);
            last = span.end;
        }
        out.push_str(&self.src[last..]);
        Some(out)
    }
}

#[derive(Debug, Clone)]
enum Content {
    Text(Range<usize>),
    CData(Range<usize>),
}

/// An open user element waiting for its text and end tag.
struct Pending {
    name: Range<usize>,
    content: Option<Content>,
    mixed: bool,
}

/// Rewrite user references in one XML document.
///
/// Returns `Ok(None)` when nothing matched, so callers can keep the original
/// bytes. `hits` is updated with one count per replacement.
pub fn rewrite_document(
    entry: &str,
    xml: &str,
    rules: &RuleSet,
    fields: &FieldSet,
    hits: &mut Hits,
) -> Result<Option<String>, ArchiveError> {
    if rules.is_empty() {
        return Ok(None);
    }

    let mut rewriter = Rewriter {
        src: xml,
        rules,
        fields,
        edits: Vec::new(),
        hits,
    };
    let mut scanner = Scanner::new(xml);
    let mut pending: Option<Pending> = None;

    loop {
        let token = scanner.next_token().map_err(|e| ArchiveError::MalformedXml {
            entry: entry.to_string(),
            offset: e.offset,
            detail: e.detail.to_string(),
        })?;
        let Some(token) = token else { break };

        match token {
            Token::Text(range) => {
                if let Some(p) = pending.as_mut() {
                    p.mixed |= p.content.is_some();
                    p.content = Some(Content::Text(range));
                }
            }
            Token::CData(range) => {
                if let Some(p) = pending.as_mut() {
                    p.mixed |= p.content.is_some();
                    p.content = Some(Content::CData(range));
                }
            }
            Token::Start {
                name,
                attrs,
                self_closing,
            } => {
                rewriter.rewrite_attributes(attrs);
                pending = None;
                if !self_closing && fields.is_user_element(&xml[name.clone()]) {
                    pending = Some(Pending {
                        name,
                        content: None,
                        mixed: false,
                    });
                }
            }
            Token::End(name) => {
                if let Some(p) = pending.take() {
                    if xml[p.name.clone()] == xml[name] && !p.mixed {
                        if let Some(content) = p.content {
                            rewriter.rewrite_text(content);
                        }
                    }
                }
            }
            Token::Other => pending = None,
        }
    }

    let edits = rewriter.edits.len();
    let result = rewriter.finish();
    debug!(entry, edits, "rewrote XML document");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RenameRule;

    fn rules(pairs: &[(&str, &str)]) -> RuleSet {
        RuleSet::from_rules(pairs.iter().map(|(o, n)| RenameRule::new(*o, *n))).unwrap()
    }

    fn rewrite(xml: &str, pairs: &[(&str, &str)]) -> Option<String> {
        let mut hits = Hits::new();
        rewrite_document("test.xml", xml, &rules(pairs), &FieldSet::default(), &mut hits)
            .unwrap()
    }

    #[test]
    fn test_element_text_replaced() {
        let out = rewrite("<issue><assignee>alice</assignee></issue>", &[("alice", "bob")]);
        assert_eq!(out.as_deref(), Some("<issue><assignee>bob</assignee></issue>"));
    }

    #[test]
    fn test_config_elements() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<project key="X">
  <lead>alice</lead>
  <role name="Developers"><memberUser>alice</memberUser><memberUser>carol</memberUser></role>
  <administratorUser>
    alice
  </administratorUser>
</project>"#;
        let out = rewrite(xml, &[("alice", "alice2")]).unwrap();
        assert!(out.contains("<lead>alice2</lead>"));
        assert!(out.contains("<memberUser>alice2</memberUser><memberUser>carol</memberUser>"));
        assert!(out.contains("<administratorUser>\n    alice2\n  </administratorUser>"));
        assert!(out.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
    }

    #[test]
    fn test_non_user_elements_untouched() {
        assert_eq!(rewrite("<summary>alice</summary>", &[("alice", "bob")]), None);
    }

    #[test]
    fn test_partial_text_not_replaced() {
        assert_eq!(rewrite("<lead>alice smith</lead>", &[("alice", "bob")]), None);
        assert_eq!(rewrite("<lead>malice</lead>", &[("alice", "bob")]), None);
    }

    #[test]
    fn test_element_with_children_untouched() {
        let xml = "<owner>alice<name>x</name></owner>";
        assert_eq!(rewrite(xml, &[("alice", "bob")]), None);
    }

    #[test]
    fn test_cdata_text() {
        let out = rewrite("<author><![CDATA[alice]]></author>", &[("alice", "bob")]);
        assert_eq!(out.as_deref(), Some("<author><![CDATA[bob]]></author>"));
    }

    #[test]
    fn test_escaped_names() {
        let out = rewrite("<owner>a&amp;b</owner>", &[("a&b", "c<d")]);
        assert_eq!(out.as_deref(), Some("<owner>c&lt;d</owner>"));
    }

    #[test]
    fn test_attribute_whole_value() {
        let xml = r#"<User id="10" userName="Alice" lowerUserName="alice"/>"#;
        let out = rewrite(xml, &[("alice", "alice2")]).unwrap();
        assert_eq!(
            out,
            r#"<User id="10" userName="Alice" lowerUserName="alice2"/>"#
        );
    }

    #[test]
    fn test_attribute_space_separated_tokens() {
        let xml = r#"<ChangeItem field="assignee" oldvalue="alice bob" newvalue="x alice alice y"/>"#;
        let out = rewrite(xml, &[("alice", "al"), ("bob", "rob")]).unwrap();
        assert_eq!(
            out,
            r#"<ChangeItem field="assignee" oldvalue="al rob" newvalue="x al al y"/>"#
        );
    }

    #[test]
    fn test_attribute_partial_tokens_untouched() {
        let xml = r#"<Action author="alice.old" body="alice"/>"#;
        assert_eq!(rewrite(xml, &[("alice", "bob")]), None);
    }

    #[test]
    fn test_attribute_single_quotes_and_gt_inside_value() {
        let xml = "<Action body='a > b' author='alice'>text</Action>";
        let out = rewrite(xml, &[("alice", "o'neil")]).unwrap();
        assert_eq!(out, "<Action body='a > b' author='o&apos;neil'>text</Action>");
    }

    #[test]
    fn test_untouched_tokens_keep_entities() {
        let xml = r#"<Item newvalue="a&#10;b alice"/>"#;
        let out = rewrite(xml, &[("alice", "bob")]).unwrap();
        assert_eq!(out, r#"<Item newvalue="a&#10;b bob"/>"#);
    }

    #[test]
    fn test_comments_untouched() {
        let xml = "<!-- <lead>alice</lead> --><root lead=\"carol\"/>";
        assert_eq!(rewrite(xml, &[("alice", "bob")]), None);
    }

    #[test]
    fn test_simultaneous_substitution() {
        let xml = "<r><lead>alice</lead><owner>bob</owner></r>";
        let out = rewrite(xml, &[("alice", "bob"), ("bob", "carol")]).unwrap();
        assert_eq!(out, "<r><lead>bob</lead><owner>carol</owner></r>");
    }

    #[test]
    fn test_hits_counted() {
        let mut hits = Hits::new();
        let xml = r#"<r><lead>alice</lead><A author="alice" user="bob"/></r>"#;
        rewrite_document(
            "x.xml",
            xml,
            &rules(&[("alice", "a2"), ("bob", "b2"), ("zed", "z2")]),
            &FieldSet::default(),
            &mut hits,
        )
        .unwrap();
        assert_eq!(hits.get("alice"), Some(&2));
        assert_eq!(hits.get("bob"), Some(&1));
        assert_eq!(hits.get("zed"), None);
    }

    #[test]
    fn test_doctype_with_internal_subset() {
        let xml = "<!DOCTYPE r [<!ENTITY e \"x>y\">]><r><lead>alice</lead></r>";
        let out = rewrite(xml, &[("alice", "bob")]).unwrap();
        assert!(out.ends_with("<r><lead>bob</lead></r>"));
    }

    #[test]
    fn test_malformed_comment_is_error() {
        let mut hits = Hits::new();
        let result = rewrite_document(
            "entities.xml",
            "<r><!-- never closed <lead>alice</lead></r>",
            &rules(&[("alice", "bob")]),
            &FieldSet::default(),
            &mut hits,
        );
        assert!(matches!(result, Err(ArchiveError::MalformedXml { .. })));
    }

    #[test]
    fn test_unterminated_tag_is_error() {
        let mut hits = Hits::new();
        let result = rewrite_document(
            "config.xml",
            "<r><lead attr=\"x\"",
            &rules(&[("alice", "bob")]),
            &FieldSet::default(),
            &mut hits,
        );
        assert!(matches!(result, Err(ArchiveError::MalformedXml { .. })));
    }

    #[test]
    fn test_empty_rules_short_circuit() {
        let mut hits = Hits::new();
        let result = rewrite_document(
            "x.xml",
            "<lead>alice</lead>",
            &RuleSet::default(),
            &FieldSet::default(),
            &mut hits,
        )
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_xml_unescape() {
        assert_eq!(xml_unescape("foo &amp; bar"), "foo & bar");
        assert_eq!(xml_unescape("a &lt; b &gt; c"), "a < b > c");
        assert_eq!(xml_unescape("&quot;hi&quot; it&apos;s"), "\"hi\" it's");
        assert_eq!(xml_unescape("&#65;&#x42;"), "AB");
        assert_eq!(xml_unescape("&bogus; & alone"), "&bogus; & alone");
        assert_eq!(xml_unescape("no entities"), "no entities");
    }

    #[test]
    fn test_escape_helpers() {
        assert_eq!(xml_escape_text("a<b&c>"), "a&lt;b&amp;c&gt;");
        assert_eq!(xml_escape_attr("\"o'\""), "&quot;o&apos;&quot;");
    }

    #[test]
    fn test_scanner_tokens() {
        let xml = "<a x=\"1\"/><b>t</b>";
        let mut scanner = Scanner::new(xml);
        let mut kinds = Vec::new();
        while let Some(token) = scanner.next_token().unwrap() {
            kinds.push(match token {
                Token::Start { self_closing, .. } => {
                    if self_closing {
                        "empty"
                    } else {
                        "start"
                    }
                }
                Token::End(_) => "end",
                Token::Text(_) => "text",
                Token::CData(_) => "cdata",
                Token::Other => "other",
            });
        }
        assert_eq!(kinds, vec!["empty", "start", "text", "end"]);
    }
}
