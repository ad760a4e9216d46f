use std::collections::{HashMap, HashSet};

use ammonia::Builder;

/// HTML sanitiser for untrusted feed content. Scripts, event handlers and
/// anything outside the allowlist are stripped; text, inline formatting,
/// lists, links and images survive.
pub struct Sanitizer {
    builder: Builder<'static>,
}

impl Sanitizer {
    /// Policy for user-generated content pulled from arbitrary upstreams.
    pub fn ugc() -> Self {
        let mut builder = Builder::default();
        builder
            .tags(HashSet::from([
                "a", "abbr", "b", "blockquote", "br", "code", "dd", "dl", "dt", "em", "h1", "h2",
                "h3", "h4", "h5", "h6", "hr", "i", "img", "li", "ol", "p", "pre", "q", "s",
                "small", "strike", "strong", "sub", "sup", "table", "tbody", "td", "th", "thead",
                "tr", "u", "ul",
            ]))
            .tag_attributes(HashMap::from([
                ("a", HashSet::from(["href", "title"])),
                ("img", HashSet::from(["src", "alt", "title", "width", "height"])),
            ]))
            .url_schemes(HashSet::from(["http", "https", "mailto"]))
            .link_rel(Some("noopener noreferrer nofollow"));
        Self { builder }
    }

    pub fn clean(&self, html: &str) -> String {
        self.builder.clean(html).to_string()
    }
}
