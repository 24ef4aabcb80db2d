//! Page-metadata strategy: `og:` / `event:` / `place:` meta tags.

use evsync_core::{PartialFieldSet, Strategy};
use scraper::Html;

use super::jsonld::{find_event_node, image_of, ld_blocks};
use super::ExtractContext;
use crate::datetime::parse_instant;
use crate::{absolute_url, select_first_attr};

fn pick_meta(document: &Html, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        select_first_attr(
            document,
            &format!("meta[property=\"{key}\"], meta[name=\"{key}\"]"),
            "content",
        )
    })
}

pub fn extract(html: &str, url: Option<&str>, ctx: &ExtractContext) -> PartialFieldSet {
    let document = Html::parse_document(html);
    let mut set = PartialFieldSet::new(Strategy::PageMetadata);

    set.title = pick_meta(&document, &["og:title", "twitter:title"]);
    set.description = pick_meta(&document, &["og:description", "description"]);
    set.starts_at = pick_meta(&document, &["event:start_time", "og:start_time"])
        .and_then(|v| parse_instant(&v, ctx.default_tz));
    set.ends_at = pick_meta(&document, &["event:end_time", "og:end_time"])
        .and_then(|v| parse_instant(&v, ctx.default_tz));
    set.venue = pick_meta(&document, &["event:location", "event:venue", "place:name"]);
    set.city = pick_meta(&document, &["event:location:city", "place:location:city"]);
    set.url = pick_meta(&document, &["og:url"]).map(|u| absolute_url(url, &u));

    let image = pick_meta(&document, &["og:image", "og:image:url", "og:image:secure_url"])
        .or_else(|| {
            ld_blocks(&document)
                .iter()
                .filter_map(find_event_node)
                .find_map(|node| node.get("image").and_then(image_of))
        });
    set.image_url = image.map(|img| absolute_url(url, &img));
    set
}
