use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, instrument};

use super::status_is_retryable;
use crate::capabilities::{ContentExtractor, DynTextGenerator, GenerationParams, Purpose};
use crate::error::ResearchError;
use crate::text::truncate_chars;

static SCRIPT_BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style|noscript|svg|head)\b.*?</(script|style|noscript|svg|head)\s*>")
        .expect("invalid script block regex")
});
static COMMENTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("invalid comment regex"));
static TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("invalid tag regex"));
static WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t\r\f]+").expect("invalid whitespace regex"));
static BLANK_LINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n\s*\n+").expect("invalid blank line regex"));

/// Reduce an HTML document to its visible text.
pub fn strip_html(html: &str) -> String {
    let text = SCRIPT_BLOCKS.replace_all(html, " ");
    let text = COMMENTS.replace_all(&text, " ");
    let text = TAGS.replace_all(&text, "\n");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    let text = WHITESPACE.replace_all(&text, " ");
    let text = text
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n");
    BLANK_LINES.replace_all(text.trim(), "\n").into_owned()
}

/// Fetches a page over HTTP and asks the text generator to pull out what the
/// instruction asks for.
pub struct LlmPageExtractor {
    client: reqwest::Client,
    generator: DynTextGenerator,
    max_page_chars: usize,
}

impl LlmPageExtractor {
    pub fn new(
        client: reqwest::Client,
        generator: DynTextGenerator,
        max_page_chars: usize,
    ) -> Self {
        Self {
            client,
            generator,
            max_page_chars,
        }
    }

    async fn fetch_text(&self, url: &str) -> Result<String, ResearchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| ResearchError::fetch(format!("request to {url} failed: {err}"), true))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResearchError::fetch(
                format!("{url} returned {status}"),
                status_is_retryable(status),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|err| ResearchError::fetch(format!("reading {url} failed: {err}"), true))?;
        Ok(truncate_chars(&strip_html(&body), self.max_page_chars))
    }
}

fn extraction_prompt(instruction: &str, page: &str) -> String {
    format!(
        "{instruction}\n\
         Use only the page text below. Reply with the extracted content as plain text, \
         or with NONE if the page has nothing relevant.\n\n\
         Page text:\n{page}"
    )
}

#[async_trait]
impl ContentExtractor for LlmPageExtractor {
    #[instrument(skip(self, instruction))]
    async fn extract(
        &self,
        url: &str,
        instruction: &str,
        max_tokens: usize,
    ) -> Result<String, ResearchError> {
        let page = self.fetch_text(url).await?;
        if page.is_empty() {
            return Err(ResearchError::fetch(format!("{url} has no readable text"), false));
        }
        debug!(chars = page.chars().count(), "page fetched");

        let params = GenerationParams::new(Purpose::Extraction)
            .with_temperature(0.0)
            .with_max_tokens(max_tokens);
        let extracted = self
            .generator
            .generate(&extraction_prompt(instruction, &page), &params)
            .await?;

        if extracted.trim().eq_ignore_ascii_case("none") {
            return Err(ResearchError::fetch(
                format!("{url} has no content relevant to the question"),
                false,
            ));
        }
        Ok(extracted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_scripts_tags_and_entities() {
        let html = r#"<html><head><title>x</title><style>p{}</style></head>
            <body><script>var a = 1;</script><!-- note -->
            <h1>Solar&nbsp;output</h1><p>Rose by <b>20%</b> &amp; more.</p></body></html>"#;
        let text = strip_html(html);
        assert!(!text.contains("var a"));
        assert!(!text.contains("p{}"));
        assert!(!text.contains('<'));
        assert!(text.contains("Solar output"));
        assert!(text.contains("Rose by"));
        assert!(text.contains("20%"));
        assert!(text.contains("& more."));
    }
}
