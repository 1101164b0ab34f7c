//! Observation sources: JSON bundle files and paged HTML listing pages.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use adwatch_core::{normalize_listing_url, Observation, SequencePosition};
use adwatch_store::{FetchError, HttpClient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adwatch-source";

#[derive(Debug, Clone, Copy)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading bundle {path}: {source}")]
    BundleRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing bundle {path}: {source}")]
    BundleParse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Yields one ordered observation batch per run. Order reflects the source's
/// own ranking and must survive into the reconciled table.
#[async_trait]
pub trait ObservationSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn observe(&self, ctx: &RunContext) -> Result<Vec<Observation>, SourceError>;
}

/// A pre-captured observation batch on disk, used for replays and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationBundle {
    pub source_id: String,
    pub captured_at: DateTime<Utc>,
    pub observations: Vec<Observation>,
}

#[derive(Debug, Clone)]
pub struct JsonBundleSource {
    source_id: String,
    path: PathBuf,
}

impl JsonBundleSource {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl ObservationSource for JsonBundleSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn observe(&self, _ctx: &RunContext) -> Result<Vec<Observation>, SourceError> {
        let text = std::fs::read_to_string(&self.path).map_err(|err| SourceError::BundleRead {
            path: self.path.clone(),
            source: err,
        })?;
        let bundle: ObservationBundle =
            serde_json::from_str(&text).map_err(|err| SourceError::BundleParse {
                path: self.path.clone(),
                source: err,
            })?;
        Ok(bundle.observations)
    }
}

/// CSS selectors for one listing layout. Each selector is resolved relative
/// to `item`, except `item` itself which is resolved against the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingSelectors {
    pub item: String,
    pub link: String,
    pub title: String,
    pub price: String,
    pub posted_time: String,
    pub location: String,
    pub seller: String,
    pub views: String,
}

impl Default for ListingSelectors {
    fn default() -> Self {
        Self {
            item: "li.a14axl8t".to_string(),
            link: "a[href]".to_string(),
            title: "h3".to_string(),
            price: ".price".to_string(),
            posted_time: ".time".to_string(),
            location: ".location".to_string(),
            seller: ".seller".to_string(),
            views: ".views".to_string(),
        }
    }
}

fn compile(selector: &str) -> Result<Selector, SourceError> {
    Selector::parse(selector).map_err(|err| SourceError::Selector {
        selector: selector.to_string(),
        message: err.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn select_first_attr(scope: ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

/// First run of digits in the text, e.g. "1.234 lượt xem" -> 1234.
fn first_number(text: &str) -> Option<u64> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .filter(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn insert_if_present(map: &mut BTreeMap<String, String>, key: &str, value: Option<String>) {
    if let Some(value) = value {
        map.insert(key.to_string(), value);
    }
}

/// Parse one listing page into ordered observations. Items whose link cannot
/// be extracted still come back, with `identity: None`, so the engine can
/// count them as skipped instead of the page silently shrinking.
pub fn parse_listing_page(
    html: &str,
    page: u32,
    base_url: &str,
    selectors: &ListingSelectors,
) -> Result<Vec<Observation>, SourceError> {
    let document = Html::parse_document(html);
    let item_sel = compile(&selectors.item)?;
    let link_sel = compile(&selectors.link)?;
    let title_sel = compile(&selectors.title)?;
    let price_sel = compile(&selectors.price)?;
    let time_sel = compile(&selectors.posted_time)?;
    let location_sel = compile(&selectors.location)?;
    let seller_sel = compile(&selectors.seller)?;
    let views_sel = compile(&selectors.views)?;

    let mut observations = Vec::new();
    for (index, item) in document.select(&item_sel).enumerate() {
        let link = select_first_attr(item, &link_sel, "href")
            .map(|href| absolutize(base_url, &href));
        let identity = link.as_deref().and_then(normalize_listing_url);

        let mut immutable = BTreeMap::new();
        insert_if_present(&mut immutable, "title", select_first_text(item, &title_sel));
        insert_if_present(&mut immutable, "price", select_first_text(item, &price_sel));
        insert_if_present(&mut immutable, "posted_time", select_first_text(item, &time_sel));
        insert_if_present(&mut immutable, "location", select_first_text(item, &location_sel));
        insert_if_present(&mut immutable, "seller", select_first_text(item, &seller_sel));
        insert_if_present(&mut immutable, "link", link);

        let mut mutable = BTreeMap::new();
        let views = select_first_text(item, &views_sel)
            .and_then(|t| first_number(&t))
            .unwrap_or(0);
        mutable.insert("views".to_string(), views.to_string());

        observations.push(Observation {
            identity,
            position: SequencePosition::new(page, index as u32 + 1),
            immutable,
            mutable,
        });
    }
    Ok(observations)
}

fn absolutize(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    if let Some(rest) = href.strip_prefix("//") {
        let scheme = base_url.split_once("://").map(|(s, _)| s).unwrap_or("https");
        return format!("{scheme}://{rest}");
    }
    let origin = base_url
        .split_once("://")
        .map(|(scheme, rest)| {
            let host = rest.split('/').next().unwrap_or(rest);
            format!("{scheme}://{host}")
        })
        .unwrap_or_else(|| base_url.trim_end_matches('/').to_string());
    format!("{}/{}", origin.trim_end_matches('/'), href.trim_start_matches('/'))
}

/// Paged HTML listing source: fetches `start_url`, then `start_url&page=N`,
/// until `max_pages`, an empty page run of `max_consecutive_empty`, or a page
/// that fails to fetch repeatedly.
pub struct PagedHtmlSource {
    source_id: String,
    start_url: String,
    selectors: ListingSelectors,
    max_pages: u32,
    max_consecutive_empty: u32,
    http: HttpClient,
}

impl PagedHtmlSource {
    pub fn new(
        source_id: impl Into<String>,
        start_url: impl Into<String>,
        selectors: ListingSelectors,
        max_pages: u32,
        max_consecutive_empty: u32,
        http: HttpClient,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            start_url: start_url.into(),
            selectors,
            max_pages: max_pages.max(1),
            max_consecutive_empty: max_consecutive_empty.max(1),
            http,
        }
    }

    fn page_url(&self, page: u32) -> String {
        if page == 1 {
            self.start_url.clone()
        } else if self.start_url.contains('?') {
            format!("{}&page={}", self.start_url, page)
        } else {
            format!("{}?page={}", self.start_url, page)
        }
    }
}

#[async_trait]
impl ObservationSource for PagedHtmlSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn observe(&self, ctx: &RunContext) -> Result<Vec<Observation>, SourceError> {
        let mut all = Vec::new();
        let mut consecutive_empty = 0u32;

        for page in 1..=self.max_pages {
            let url = self.page_url(page);
            let response = match self.http.get_bytes(ctx.run_id, &url).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(source_id = %self.source_id, page, %url, error = %err, "page fetch failed");
                    consecutive_empty += 1;
                    if consecutive_empty >= self.max_consecutive_empty {
                        break;
                    }
                    continue;
                }
            };

            let observations =
                parse_listing_page(&response.text(), page, &url, &self.selectors)?;
            info!(
                source_id = %self.source_id,
                page,
                items = observations.len(),
                "parsed listing page"
            );

            if observations.is_empty() {
                consecutive_empty += 1;
                if consecutive_empty >= self.max_consecutive_empty {
                    break;
                }
            } else {
                consecutive_empty = 0;
                all.extend(observations);
            }
        }

        Ok(all)
    }
}

/// Write a captured batch next to the tests that replay it.
pub fn write_bundle(path: impl AsRef<Path>, bundle: &ObservationBundle) -> anyhow::Result<()> {
    let path = path.as_ref();
    let text = serde_json::to_string_pretty(bundle)?;
    std::fs::write(path, text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING_PAGE: &str = r#"
        <html><body><ul>
            <li class="a14axl8t">
                <a href="/mua-ban/guitar-yamaha-123.htm?src=list">xem</a>
                <h3>Guitar Yamaha C40</h3>
                <span class="price">1.500.000 đ</span>
                <span class="time">2 giờ trước</span>
                <span class="location">Hà Nội</span>
                <span class="seller">Tuấn</span>
                <span class="views">37 lượt xem</span>
            </li>
            <li class="a14axl8t">
                <h3>Tin không có link</h3>
                <span class="views">5</span>
            </li>
            <li class="a14axl8t">
                <a href="https://www.chotot.com/mua-ban/dan-piano-456.htm">xem</a>
                <h3>Piano điện Casio</h3>
                <span class="price">2.000.000 đ</span>
                <span class="views">1.204 lượt xem</span>
            </li>
        </ul></body></html>
    "#;

    #[test]
    fn parses_cards_in_page_order_with_positions() {
        let observations = parse_listing_page(
            LISTING_PAGE,
            2,
            "https://www.chotot.com/ha-noi/mua-ban-nhac-cu?price=0-2100000",
            &ListingSelectors::default(),
        )
        .expect("parse");

        assert_eq!(observations.len(), 3);
        assert_eq!(observations[0].position, SequencePosition::new(2, 1));
        assert_eq!(observations[2].position, SequencePosition::new(2, 3));
    }

    #[test]
    fn derives_identity_from_normalized_absolute_link() {
        let observations = parse_listing_page(
            LISTING_PAGE,
            1,
            "https://www.chotot.com/ha-noi/mua-ban-nhac-cu",
            &ListingSelectors::default(),
        )
        .expect("parse");

        assert_eq!(
            observations[0].identity.as_deref(),
            Some("https://www.chotot.com/mua-ban/guitar-yamaha-123.htm")
        );
        assert_eq!(
            observations[2].identity.as_deref(),
            Some("https://www.chotot.com/mua-ban/dan-piano-456.htm")
        );
    }

    #[test]
    fn protocol_relative_link_inherits_base_scheme() {
        assert_eq!(
            absolutize(
                "https://www.chotot.com/ha-noi/mua-ban-nhac-cu",
                "//www.chotot.com/mua-ban/trong-789.htm"
            ),
            "https://www.chotot.com/mua-ban/trong-789.htm"
        );
        assert_eq!(
            absolutize("http://example.com/list", "//cdn.example.com/x.htm"),
            "http://cdn.example.com/x.htm"
        );
    }

    #[test]
    fn card_without_link_yields_observation_without_identity() {
        let observations = parse_listing_page(
            LISTING_PAGE,
            1,
            "https://www.chotot.com/ha-noi/mua-ban-nhac-cu",
            &ListingSelectors::default(),
        )
        .expect("parse");

        assert!(observations[1].identity.is_none());
        assert_eq!(
            observations[1].immutable.get("title").map(String::as_str),
            Some("Tin không có link")
        );
    }

    #[test]
    fn views_parse_through_thousands_separators() {
        let observations = parse_listing_page(
            LISTING_PAGE,
            1,
            "https://www.chotot.com/ha-noi/mua-ban-nhac-cu",
            &ListingSelectors::default(),
        )
        .expect("parse");

        assert_eq!(observations[0].mutable.get("views").map(String::as_str), Some("37"));
        assert_eq!(
            observations[2].mutable.get("views").map(String::as_str),
            Some("1204")
        );
    }

    #[test]
    fn immutable_fields_capture_card_details() {
        let observations = parse_listing_page(
            LISTING_PAGE,
            1,
            "https://www.chotot.com/ha-noi/mua-ban-nhac-cu",
            &ListingSelectors::default(),
        )
        .expect("parse");

        let first = &observations[0].immutable;
        assert_eq!(first.get("title").map(String::as_str), Some("Guitar Yamaha C40"));
        assert_eq!(first.get("price").map(String::as_str), Some("1.500.000 đ"));
        assert_eq!(first.get("location").map(String::as_str), Some("Hà Nội"));
        assert_eq!(first.get("seller").map(String::as_str), Some("Tuấn"));
    }

    #[test]
    fn bad_selector_is_reported_not_panicked() {
        let mut selectors = ListingSelectors::default();
        selectors.item = ":::".to_string();
        let err = parse_listing_page("<html></html>", 1, "https://x.test", &selectors)
            .expect_err("selector error");
        assert!(matches!(err, SourceError::Selector { .. }));
    }

    #[tokio::test]
    async fn bundle_source_round_trips_observations() {
        let dir = std::env::temp_dir().join(format!("adwatch-bundle-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("bundle.json");

        let bundle = ObservationBundle {
            source_id: "chotot-nhac-cu".to_string(),
            captured_at: Utc::now(),
            observations: vec![Observation::new(
                "https://www.chotot.com/mua-ban/guitar-1.htm",
                SequencePosition::new(1, 1),
            )
            .with_immutable("title", "Guitar")
            .with_mutable("views", "9")],
        };
        write_bundle(&path, &bundle).expect("write bundle");

        let source = JsonBundleSource::new("chotot-nhac-cu", &path);
        let ctx = RunContext::new();
        let observations = source.observe(&ctx).await.expect("observe");
        assert_eq!(observations, bundle.observations);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn page_url_appends_page_parameter_after_first_page() {
        let http = HttpClient::new(Default::default()).expect("client");
        let source = PagedHtmlSource::new(
            "chotot",
            "https://www.chotot.com/ha-noi/mua-ban-nhac-cu?price=0-2100000",
            ListingSelectors::default(),
            10,
            2,
            http,
        );
        assert_eq!(
            source.page_url(1),
            "https://www.chotot.com/ha-noi/mua-ban-nhac-cu?price=0-2100000"
        );
        assert_eq!(
            source.page_url(3),
            "https://www.chotot.com/ha-noi/mua-ban-nhac-cu?price=0-2100000&page=3"
        );
    }
}
