use lazy_static::lazy_static;
use scraper::{Html, Selector};
use url::Url;

lazy_static! {
    static ref ANCHOR: Selector = Selector::parse("a[href]").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

/// A child entry discovered on a listing page.
#[derive(Debug, Clone)]
pub struct RemoteNode {
    pub url: Url,
    pub kind: NodeKind,
    /// The href as written on the page, used for include/exclude matching.
    pub name: String,
}

/// A fetched listing page. `links` walks its anchors lazily, one pass per
/// parse; re-fetch the page to iterate again.
pub struct Listing {
    html: Html,
    base: Url,
}

impl Listing {
    pub fn parse(body: &str, base: Url) -> Self {
        Self {
            html: Html::parse_document(body),
            base,
        }
    }

    pub fn links(&self) -> impl Iterator<Item = RemoteNode> + '_ {
        self.html
            .select(&ANCHOR)
            .filter_map(|a| a.value().attr("href"))
            .filter_map(move |href| classify(&self.base, href.trim()))
    }
}

/// Listing pages link their children relatively. Absolute hrefs point at
/// parents or other hosts, and `?` hrefs are auto-index sort links; both are
/// skipped to keep the crawl inside the listing subtree.
fn classify(base: &Url, href: &str) -> Option<RemoteNode> {
    if href.is_empty()
        || href.starts_with('/')
        || href.starts_with('?')
        || href.starts_with("http")
    {
        return None;
    }
    let kind = if href.ends_with('/') || href.ends_with("html") {
        NodeKind::Directory
    } else {
        NodeKind::File
    };
    let url = base.join(href).ok()?;
    Some(RemoteNode {
        url,
        kind,
        name: href.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTOINDEX: &str = r#"
        <html><body><pre>
        <a href="/data/">Parent Directory</a>
        <a href="?C=M;O=A">Last modified</a>
        <a href="18060818EP0218.DAT">18060818EP0218.DAT</a>
        <a href="1806072011EP02.AMSR2.INTENSITY_ETA.DAT">1806072011EP02.AMSR2..&gt;</a>
        <a href="subdir/">subdir/</a>
        <a href="archive.html">archive.html</a>
        <a href="http://elsewhere.invalid/file.dat">elsewhere</a>
        </pre></body></html>
    "#;

    fn base() -> Url {
        Url::parse("https://example.com/data/prod/").unwrap()
    }

    #[test]
    fn files_and_directories_are_classified() {
        let listing = Listing::parse(AUTOINDEX, base());
        let nodes: Vec<_> = listing.links().collect();

        assert_eq!(nodes.len(), 4);
        assert_eq!(
            nodes[0].url.as_str(),
            "https://example.com/data/prod/18060818EP0218.DAT"
        );
        assert_eq!(nodes[0].kind, NodeKind::File);
        assert_eq!(nodes[1].kind, NodeKind::File);
        assert_eq!(
            nodes[2].url.as_str(),
            "https://example.com/data/prod/subdir/"
        );
        assert_eq!(nodes[2].kind, NodeKind::Directory);
        assert_eq!(nodes[3].kind, NodeKind::Directory);
        assert_eq!(nodes[3].name, "archive.html");
    }

    #[test]
    fn parent_sort_and_external_links_are_skipped() {
        let listing = Listing::parse(AUTOINDEX, base());
        assert!(listing
            .links()
            .all(|n| n.url.as_str().starts_with("https://example.com/data/prod/")));
    }

    #[test]
    fn malformed_markup_yields_what_the_parser_recovers() {
        let listing = Listing::parse("<a href='x.dat'<a<<>broken", base());
        let nodes: Vec<_> = listing.links().collect();
        assert!(nodes.len() <= 1);
    }

    #[test]
    fn empty_body_yields_no_links() {
        let listing = Listing::parse("", base());
        assert_eq!(listing.links().count(), 0);
    }
}
