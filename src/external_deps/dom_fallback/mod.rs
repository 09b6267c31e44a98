//! DOM fallback extraction.
//!
//! When interception captures nothing, the rendered page is read directly.
//! Extractors never fail as a whole: a key they cannot fill comes back as a
//! `DomFallbackError` outcome.

use std::collections::HashMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde_json::{Map, Value, json};

use crate::capture::{ErrorKind, MENU_KEY, SHOP_INFO_KEY, ScrapeOutcome};
use crate::external_deps::browser::BrowserSession;

static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").expect("title selector"));
static META: Lazy<Selector> =
    Lazy::new(|| Selector::parse("meta[content]").expect("meta selector"));
static JSON_LD: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"script[type="application/ld+json"]"#).expect("json-ld selector")
});

const BUSINESS_TYPES: &[&str] = &[
    "Restaurant",
    "FoodEstablishment",
    "Store",
    "LocalBusiness",
    "Organization",
];

#[async_trait]
pub trait DomFallbackExtractor: Send + Sync {
    /// Best-effort outcomes for `keys`, read from the session's current page.
    async fn extract(
        &self,
        session: &dyn BrowserSession,
        keys: &[String],
    ) -> HashMap<String, ScrapeOutcome>;
}

/// Builds `shop_info` from title, meta, OpenGraph and JSON-LD data, and
/// `menu` from a JSON-LD `hasMenu` tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlMetadataExtractor;

impl HtmlMetadataExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract_from_html(&self, html: &str, keys: &[String]) -> HashMap<String, ScrapeOutcome> {
        let document = Html::parse_document(html);
        let page = PageMetadata::read(&document);

        keys.iter()
            .map(|key| {
                let outcome = match key.as_str() {
                    SHOP_INFO_KEY => page.shop_info().map(ScrapeOutcome::Success).unwrap_or_else(|| {
                        ScrapeOutcome::failure(
                            ErrorKind::DomFallbackError,
                            "no shop metadata found in page",
                        )
                    }),
                    MENU_KEY => ScrapeOutcome::Success(page.menu()),
                    other => ScrapeOutcome::failure(
                        ErrorKind::DomFallbackError,
                        format!("no DOM extraction available for '{other}'"),
                    ),
                };
                (key.clone(), outcome)
            })
            .collect()
    }
}

#[async_trait]
impl DomFallbackExtractor for HtmlMetadataExtractor {
    async fn extract(
        &self,
        session: &dyn BrowserSession,
        keys: &[String],
    ) -> HashMap<String, ScrapeOutcome> {
        match session.content().await {
            Ok(html) => self.extract_from_html(&html, keys),
            Err(err) => keys
                .iter()
                .map(|key| {
                    (
                        key.clone(),
                        ScrapeOutcome::failure(
                            ErrorKind::DomFallbackError,
                            format!("could not read page content: {err}"),
                        ),
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default)]
struct PageMetadata {
    title: Option<String>,
    meta: HashMap<String, String>,
    json_ld: Vec<Value>,
}

impl PageMetadata {
    fn read(document: &Html) -> Self {
        let title = document
            .select(&TITLE)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|title| !title.is_empty());

        let mut meta = HashMap::new();
        for el in document.select(&META) {
            let name = el
                .value()
                .attr("property")
                .or_else(|| el.value().attr("name"));
            if let (Some(name), Some(content)) = (name, el.value().attr("content")) {
                let content = content.trim();
                if !content.is_empty() {
                    meta.entry(name.to_ascii_lowercase())
                        .or_insert_with(|| content.to_string());
                }
            }
        }

        let mut json_ld = Vec::new();
        for el in document.select(&JSON_LD) {
            let text = el.text().collect::<String>();
            match serde_json::from_str::<Value>(text.trim()) {
                Ok(value) => flatten_json_ld(value, &mut json_ld),
                Err(err) => log::debug!("skipping malformed JSON-LD block: {err}"),
            }
        }

        Self {
            title,
            meta,
            json_ld,
        }
    }

    fn business(&self) -> Option<&Map<String, Value>> {
        let objects = || self.json_ld.iter().filter_map(Value::as_object);
        objects()
            .find(|obj| is_business(obj))
            .or_else(|| objects().find(|obj| obj.contains_key("hasMenu")))
    }

    fn shop_info(&self) -> Option<Value> {
        let business = self.business();
        let from_ld = |field: &str| business.and_then(|b| b.get(field)).cloned();
        let meta = |name: &str| self.meta.get(name).cloned().map(Value::String);

        let mut info = Map::new();
        let name = from_ld("name")
            .or_else(|| meta("og:title"))
            .or_else(|| self.title.clone().map(Value::String));
        let fields = [
            ("name", name),
            (
                "description",
                from_ld("description")
                    .or_else(|| meta("og:description"))
                    .or_else(|| meta("description")),
            ),
            ("image", from_ld("image").or_else(|| meta("og:image"))),
            ("url", from_ld("url").or_else(|| meta("og:url"))),
            ("address", from_ld("address")),
            ("telephone", from_ld("telephone")),
            ("cuisine", from_ld("servesCuisine")),
            ("priceRange", from_ld("priceRange")),
            (
                "rating",
                business
                    .and_then(|b| b.get("aggregateRating"))
                    .and_then(|rating| rating.get("ratingValue"))
                    .cloned(),
            ),
        ];
        for (field, value) in fields {
            if let Some(value) = value {
                info.insert(field.to_string(), value);
            }
        }

        if info.is_empty() {
            return None;
        }
        info.insert("source".into(), Value::String("dom".into()));
        Some(Value::Object(info))
    }

    fn menu(&self) -> Value {
        let has_menu = self.business().and_then(|b| b.get("hasMenu"));
        match has_menu {
            Some(Value::String(url)) => json!({ "categories": [], "items": [], "url": url }),
            Some(menu @ Value::Object(_)) => menu_from_ld(menu),
            _ => json!({ "categories": [], "items": [] }),
        }
    }
}

fn flatten_json_ld(value: Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                flatten_json_ld(item, out);
            }
        }
        Value::Object(mut obj) => {
            if let Some(graph) = obj.remove("@graph") {
                flatten_json_ld(graph, out);
            }
            if !obj.is_empty() {
                out.push(Value::Object(obj));
            }
        }
        _ => {}
    }
}

fn is_business(obj: &Map<String, Value>) -> bool {
    let matches = |ty: &str| BUSINESS_TYPES.contains(&ty);
    match obj.get("@type") {
        Some(Value::String(ty)) => matches(ty.as_str()),
        Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).any(matches),
        _ => false,
    }
}

fn as_list(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(item @ Value::Object(_)) => vec![item],
        _ => Vec::new(),
    }
}

fn menu_item(item: &Value, category: Option<&str>) -> Value {
    let offer = as_list(item.get("offers")).into_iter().next();
    json!({
        "name": item.get("name").cloned().unwrap_or(Value::Null),
        "description": item.get("description").cloned().unwrap_or(Value::Null),
        "price": offer.and_then(|o| o.get("price")).cloned().unwrap_or(Value::Null),
        "currency": offer.and_then(|o| o.get("priceCurrency")).cloned().unwrap_or(Value::Null),
        "category": category,
    })
}

fn menu_from_ld(menu: &Value) -> Value {
    let mut categories = Vec::new();
    let mut items = Vec::new();

    for section in as_list(menu.get("hasMenuSection")) {
        let name = section.get("name").and_then(Value::as_str);
        let section_items: Vec<Value> = as_list(section.get("hasMenuItem"))
            .into_iter()
            .map(|item| menu_item(item, name))
            .collect();
        items.extend(section_items.iter().cloned());
        categories.push(json!({ "name": name, "items": section_items }));
    }
    for item in as_list(menu.get("hasMenuItem")) {
        items.push(menu_item(item, None));
    }

    json!({ "categories": categories, "items": items })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><head>
            <title>Pizzaria Bella - Delivery</title>
            <meta name="description" content="Pizzas artesanais">
            <meta property="og:image" content="https://cdn.example/logo.png">
            <script type="application/ld+json">
            {"@context": "https://schema.org", "@graph": [
                {"@type": "WebSite", "name": "Delivery"},
                {"@type": "Restaurant", "name": "Pizzaria Bella",
                 "telephone": "+55 11 5555-0000",
                 "aggregateRating": {"ratingValue": 4.7},
                 "hasMenu": {"@type": "Menu", "hasMenuSection": [
                    {"name": "Pizzas", "hasMenuItem": [
                        {"name": "Margherita", "offers": {"price": "49.90", "priceCurrency": "BRL"}},
                        {"name": "Calabresa", "offers": [{"price": "52.00"}]}
                    ]}
                 ]}}
            ]}
            </script>
        </head><body></body></html>
    "#;

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn reads_shop_info_from_json_ld_and_meta() {
        let outcomes = HtmlMetadataExtractor::new().extract_from_html(PAGE, &keys(&["shop_info"]));
        let info = outcomes["shop_info"].payload().unwrap();
        assert_eq!(info["name"], "Pizzaria Bella");
        assert_eq!(info["description"], "Pizzas artesanais");
        assert_eq!(info["image"], "https://cdn.example/logo.png");
        assert_eq!(info["rating"], 4.7);
        assert_eq!(info["source"], "dom");
    }

    #[test]
    fn builds_menu_from_sections() {
        let outcomes = HtmlMetadataExtractor::new().extract_from_html(PAGE, &keys(&["menu"]));
        let menu = outcomes["menu"].payload().unwrap();
        assert_eq!(menu["categories"][0]["name"], "Pizzas");
        assert_eq!(menu["items"].as_array().unwrap().len(), 2);
        assert_eq!(menu["items"][0]["price"], "49.90");
        assert_eq!(menu["items"][1]["category"], "Pizzas");
    }

    #[test]
    fn bare_page_yields_empty_menu_and_failed_shop_info() {
        let html = "<html><body><p>nothing here</p></body></html>";
        let outcomes =
            HtmlMetadataExtractor::new().extract_from_html(html, &keys(&["menu", "shop_info"]));
        assert_eq!(
            outcomes["menu"].payload(),
            Some(&json!({"categories": [], "items": []}))
        );
        assert_eq!(
            outcomes["shop_info"].error_kind(),
            Some(ErrorKind::DomFallbackError)
        );
    }

    #[test]
    fn only_requested_keys_are_filled() {
        let outcomes = HtmlMetadataExtractor::new().extract_from_html(PAGE, &keys(&["reviews"]));
        assert_eq!(outcomes.len(), 1);
        assert_eq!(
            outcomes["reviews"].error_kind(),
            Some(ErrorKind::DomFallbackError)
        );
    }
}
