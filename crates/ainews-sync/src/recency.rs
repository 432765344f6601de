use ainews_core::ArticleBundle;
use chrono::{DateTime, Duration, Utc};

pub const DEFAULT_WINDOW_HOURS: i64 = 24;
/// Longest accepted window, about a century.
pub const MAX_WINDOW_HOURS: i64 = 24 * 366 * 100;

/// Freshness window check. An item exactly `window` old is still fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecencyFilter {
    window: Duration,
}

impl Default for RecencyFilter {
    fn default() -> Self {
        Self::hours(DEFAULT_WINDOW_HOURS)
    }
}

impl RecencyFilter {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Window of `hours`, clamped to `0..=MAX_WINDOW_HOURS`.
    pub fn hours(hours: i64) -> Self {
        Self::new(Duration::hours(hours.clamp(0, MAX_WINDOW_HOURS)))
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Oldest fresh instant; saturates at the earliest representable time.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn is_fresh(&self, published: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        published >= self.cutoff(now)
    }

    /// Keeps fresh bundles in order; returns them with the number dropped.
    pub fn retain(
        &self,
        bundles: Vec<ArticleBundle>,
        now: DateTime<Utc>,
    ) -> (Vec<ArticleBundle>, usize) {
        let before = bundles.len();
        let kept: Vec<_> = bundles
            .into_iter()
            .filter(|b| self.is_fresh(b.article.published_date, now))
            .collect();
        let dropped = before - kept.len();
        (kept, dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ainews_core::{Article, Source};
    use chrono::{FixedOffset, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 28, 12, 0, 0).single().unwrap()
    }

    fn bundle(age: Duration) -> ArticleBundle {
        let url = format!("https://example.com/{}", age.num_minutes());
        ArticleBundle::new(Article::new(Source::BensBites, &url, now() - age).unwrap())
    }

    #[test]
    fn older_than_window_is_stale_and_younger_is_fresh() {
        let filter = RecencyFilter::default();
        assert!(!filter.is_fresh(now() - Duration::hours(25), now()));
        assert!(filter.is_fresh(now() - Duration::hours(23), now()));
    }

    #[test]
    fn exact_window_boundary_is_fresh_and_one_second_past_is_not() {
        let filter = RecencyFilter::hours(24);
        assert!(filter.is_fresh(now() - Duration::hours(24), now()));
        assert!(!filter.is_fresh(
            now() - Duration::hours(24) - Duration::seconds(1),
            now()
        ));
    }

    #[test]
    fn offsets_do_not_skew_the_window() {
        let filter = RecencyFilter::default();
        let tokyo = FixedOffset::east_opt(9 * 3600).unwrap();
        // 08:00 on the 28th in Tokyo is 23:00 UTC on the 27th: 13h old.
        let published = tokyo
            .with_ymd_and_hms(2026, 1, 28, 8, 0, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc);
        assert!(filter.is_fresh(published, now()));
    }

    #[test]
    fn oversized_windows_saturate_instead_of_overflowing() {
        let widest = RecencyFilter::hours(i64::MAX);
        assert_eq!(widest.window(), Duration::hours(MAX_WINDOW_HOURS));
        assert!(widest.is_fresh(now() - Duration::days(365 * 50), now()));
        assert_eq!(RecencyFilter::hours(-5).window(), Duration::zero());

        let unbounded = RecencyFilter::new(Duration::MAX);
        assert_eq!(unbounded.cutoff(now()), DateTime::<Utc>::MIN_UTC);
        assert!(unbounded.is_fresh(DateTime::<Utc>::MIN_UTC, now()));
    }

    #[test]
    fn retain_preserves_order_and_counts_drops() {
        let filter = RecencyFilter::default();
        let batch = vec![
            bundle(Duration::hours(1)),
            bundle(Duration::hours(30)),
            bundle(Duration::hours(5)),
        ];
        let (kept, dropped) = filter.retain(batch, now());
        assert_eq!(dropped, 1);
        assert_eq!(
            kept.iter().map(|b| b.article.url.as_str()).collect::<Vec<_>>(),
            vec!["https://example.com/60", "https://example.com/300"]
        );
    }
}
