use evsync_core::{PartialFieldSet, Strategy};

use super::ExtractContext;
use crate::{absolute_url, ListingCard};

/// A listing card carries free text only; the date and time cells become one
/// schedule line for the merger to parse.
pub fn extract(card: &ListingCard, url: Option<&str>, ctx: &ExtractContext) -> PartialFieldSet {
    let mut set = PartialFieldSet::new(Strategy::DomHeuristic);
    set.title = card.title.clone();
    set.schedule_text = match (card.date_text.as_deref(), card.time_text.as_deref()) {
        (Some(date), Some(time)) if !date.to_lowercase().contains(&time.to_lowercase()) => {
            Some(format!("{date} {time}"))
        }
        (Some(date), _) => Some(date.to_string()),
        (None, Some(time)) => Some(time.to_string()),
        (None, None) => None,
    };
    set.venue = card.venue.clone();
    set.city = ctx.default_city.clone();
    set.url = card.link.as_deref().map(|href| absolute_url(url, href));
    set.image_url = card.image.as_deref().map(|src| absolute_url(url, src));
    set.description = card.summary.clone();
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_date_and_time_cells() {
        let card = ListingCard {
            title: Some("Quiz Night".into()),
            link: Some("/event/quiz-night/".into()),
            date_text: Some("November 5, 2025".into()),
            time_text: Some("8:00 pm - 10:00 pm".into()),
            ..ListingCard::default()
        };
        let ctx = ExtractContext {
            default_city: Some("St. John's".into()),
            ..ExtractContext::default()
        };
        let set = extract(&card, Some("https://venue.example/events/"), &ctx);
        assert_eq!(set.schedule_text.as_deref(), Some("November 5, 2025 8:00 pm - 10:00 pm"));
        assert_eq!(set.url.as_deref(), Some("https://venue.example/event/quiz-night/"));
        assert_eq!(set.city.as_deref(), Some("St. John's"));
    }

    #[test]
    fn date_cell_that_already_holds_the_time_is_not_doubled() {
        let card = ListingCard {
            date_text: Some("November 5, 2025 8:00 pm".into()),
            time_text: Some("8:00 pm".into()),
            ..ListingCard::default()
        };
        let set = extract(&card, None, &ExtractContext::default());
        assert_eq!(set.schedule_text.as_deref(), Some("November 5, 2025 8:00 pm"));
    }
}
