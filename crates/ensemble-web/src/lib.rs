//! Web search and page-fetch collaborator.
//!
//! Search scrapes the DuckDuckGo HTML endpoint; page fetches extract main
//! text content. Sub-research fans out page fetches concurrently and
//! tolerates individual failures, returning whatever partial set succeeded.

use anyhow::{Context, Result};
use ensemble_core::WebConfig;
use reqwest::blocking::Client;
use scraper::{Html, Node, Selector};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedPage {
    pub title: String,
    pub url: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubResearchReport {
    pub query: String,
    pub hits: Vec<SearchHit>,
    pub pages: Vec<FetchedPage>,
}

pub struct WebClient {
    client: Client,
    cfg: WebConfig,
}

impl WebClient {
    pub fn new(cfg: WebConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .user_agent(cfg.user_agent.clone())
            .build()?;
        Ok(Self { client, cfg })
    }

    pub fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        anyhow::ensure!(self.cfg.enabled, "web browsing is disabled");
        let url = format!(
            "https://html.duckduckgo.com/html/?q={}",
            urlencode(query)
        );
        let body = self
            .client
            .get(&url)
            .header("Accept", "text/html,application/xhtml+xml")
            .header("Referer", "https://duckduckgo.com/")
            .send()
            .context("search request failed")?
            .error_for_status()
            .context("search engine returned an error status")?
            .text()?;
        Ok(parse_search_html(&body, self.cfg.max_results))
    }

    /// Fetch a page and extract its main text, or `None` when the page is
    /// unreachable or yields no usable text.
    pub fn fetch_page(&self, url: &str) -> Result<Option<String>> {
        anyhow::ensure!(self.cfg.enabled, "web browsing is disabled");
        let response = match self.client.get(url).send() {
            Ok(resp) => resp,
            Err(_) => return Ok(None),
        };
        if !response.status().is_success() {
            return Ok(None);
        }
        let body = response.text()?;
        let text = extract_text(&body);
        if text.is_empty() {
            return Ok(None);
        }
        let capped = text
            .char_indices()
            .take_while(|(idx, _)| *idx < self.cfg.max_page_bytes)
            .map(|(_, ch)| ch)
            .collect::<String>();
        Ok(Some(capped))
    }

    /// Search, then fetch the top hits concurrently. Fetch failures are
    /// filtered out rather than failing the task; a partial result set is
    /// fine.
    pub fn sub_research(&self, query: &str) -> Result<SubResearchReport> {
        let hits = self.search(query)?;
        let targets: Vec<SearchHit> = hits
            .iter()
            .filter(|hit| hit.url.starts_with("http"))
            .take(self.cfg.fetch_count)
            .cloned()
            .collect();
        let pages = self.fetch_pages(&targets);

        Ok(SubResearchReport {
            query: query.to_string(),
            hits,
            pages,
        })
    }

    /// Fetch every target concurrently on scoped threads. Unreachable,
    /// erroring or empty pages are dropped; the surviving subset is returned
    /// in target order.
    fn fetch_pages(&self, targets: &[SearchHit]) -> Vec<FetchedPage> {
        let mut pages: Vec<Option<FetchedPage>> = Vec::new();
        thread::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|hit| {
                    scope.spawn(move || {
                        self.fetch_page(&hit.url).ok().flatten().map(|content| {
                            FetchedPage {
                                title: hit.title.clone(),
                                url: hit.url.clone(),
                                content,
                            }
                        })
                    })
                })
                .collect();
            for handle in handles {
                pages.push(handle.join().unwrap_or(None));
            }
        });
        pages.into_iter().flatten().collect()
    }
}

fn parse_search_html(body: &str, max_results: usize) -> Vec<SearchHit> {
    let document = Html::parse_document(body);
    let result_sel = Selector::parse(".result__body").expect("result selector");
    let title_sel = Selector::parse(".result__title").expect("title selector");
    let snippet_sel = Selector::parse(".result__snippet").expect("snippet selector");
    let url_sel = Selector::parse(".result__url").expect("url selector");

    let mut hits = Vec::new();
    for result in document.select(&result_sel).take(max_results) {
        let Some(title_elem) = result.select(&title_sel).next() else {
            continue;
        };
        let title = collapse_ws(&title_elem.text().collect::<String>());
        let snippet = result
            .select(&snippet_sel)
            .next()
            .map(|elem| collapse_ws(&elem.text().collect::<String>()))
            .unwrap_or_default();
        let mut url = result
            .select(&url_sel)
            .next()
            .map(|elem| collapse_ws(&elem.text().collect::<String>()))
            .unwrap_or_default();
        if !url.is_empty() && !url.starts_with("http") {
            url = format!("https://{url}");
        }
        hits.push(SearchHit {
            title,
            snippet,
            url,
        });
    }
    hits
}

/// Visible text of a document, skipping script/style/navigation chrome,
/// preferring `<main>`/`<article>` when present.
fn extract_text(body: &str) -> String {
    const SKIP: [&str; 6] = ["script", "style", "nav", "footer", "header", "aside"];
    let document = Html::parse_document(body);

    let root = ["main", "article", "body"]
        .iter()
        .find_map(|tag| {
            let selector = Selector::parse(tag).expect("root selector");
            document.select(&selector).next()
        });
    let Some(root) = root else {
        return String::new();
    };

    let mut lines = Vec::new();
    for node in root.descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let skipped = node.ancestors().any(|ancestor| match ancestor.value() {
            Node::Element(element) => SKIP.contains(&element.name()),
            _ => false,
        });
        if skipped {
            continue;
        }
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }
    lines.join("\n")
}

fn collapse_ws(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn urlencode(raw: &str) -> String {
    let mut out = String::new();
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    const RESULTS_HTML: &str = r#"
<html><body>
  <div class="result__body">
    <h2 class="result__title"><a>Rust Book</a></h2>
    <a class="result__snippet">Learn   Rust here.</a>
    <a class="result__url"> doc.rust-lang.org/book </a>
  </div>
  <div class="result__body">
    <h2 class="result__title"><a>Tokio</a></h2>
    <a class="result__snippet">Async runtime.</a>
    <a class="result__url">https://tokio.rs</a>
  </div>
</body></html>"#;

    #[test]
    fn parses_search_results_with_scheme_fixup() {
        let hits = parse_search_html(RESULTS_HTML, 5);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "Rust Book");
        assert_eq!(hits[0].snippet, "Learn Rust here.");
        assert_eq!(hits[0].url, "https://doc.rust-lang.org/book");
        assert_eq!(hits[1].url, "https://tokio.rs");
    }

    #[test]
    fn max_results_caps_parsing() {
        let hits = parse_search_html(RESULTS_HTML, 1);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn extract_text_skips_chrome_tags() {
        let html = r#"<html><body>
            <nav>Menu Menu</nav>
            <main><p>Real content.</p><script>var x = 1;</script></main>
            <footer>Copyright</footer>
        </body></html>"#;
        let text = extract_text(html);
        assert!(text.contains("Real content."));
        assert!(!text.contains("Menu"));
        assert!(!text.contains("var x"));
        assert!(!text.contains("Copyright"));
    }

    #[test]
    fn extract_text_prefers_main_over_body() {
        let html = "<html><body><p>outside</p><main><p>inside</p></main></body></html>";
        let text = extract_text(html);
        assert_eq!(text, "inside");
    }

    #[test]
    fn urlencode_escapes_query_characters() {
        assert_eq!(urlencode("rust async?"), "rust+async%3F");
    }

    fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buf = vec![0_u8; 8192];
            let _ = stream.read(&mut buf).expect("read request");
            let response = format!(
                "{status_line}\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{body}",
                body.len(),
            );
            stream.write_all(response.as_bytes()).expect("write");
        });
        format!("http://{addr}/")
    }

    #[test]
    fn fetch_pages_keeps_partial_results() {
        let good = serve_once(
            "HTTP/1.1 200 OK",
            "<html><body><main><p>alpha content</p></main></body></html>",
        );
        let erroring = serve_once("HTTP/1.1 500 Internal Server Error", "oops");
        // Bind then drop so the port refuses connections.
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            format!("http://{}/", listener.local_addr().expect("addr"))
        };

        let targets: Vec<SearchHit> = [("Alpha", &good), ("Beta", &erroring), ("Gamma", &dead)]
            .into_iter()
            .map(|(title, url)| SearchHit {
                title: title.to_string(),
                snippet: String::new(),
                url: url.clone(),
            })
            .collect();

        let cfg = WebConfig {
            enabled: true,
            timeout_seconds: 5,
            ..WebConfig::default()
        };
        let client = WebClient::new(cfg).expect("client");
        let pages = client.fetch_pages(&targets);

        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].title, "Alpha");
        assert_eq!(pages[0].url, good);
        assert!(pages[0].content.contains("alpha content"));
    }
}
