use std::collections::VecDeque;

use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Orders submitted by one account, by UTC day and over a rolling 24h window
///
/// Owned by the account book and handed to the risk manager by reference.
/// Call `roll` with the current time before reading counts.
#[derive(Debug, Clone)]
pub struct TradeFrequencyCounter {
    day: NaiveDate,
    today: u32,
    window: VecDeque<DateTime<Utc>>,
}

impl TradeFrequencyCounter {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            day: now.date_naive(),
            today: 0,
            window: VecDeque::new(),
        }
    }

    /// Apply day rollover and expire submissions older than 24h
    pub fn roll(&mut self, now: DateTime<Utc>) {
        let day = now.date_naive();
        if day != self.day {
            tracing::info!("UTC day rollover ({} -> {}), daily trade count reset", self.day, day);
            self.day = day;
            self.today = 0;
        }

        let cutoff = now - Duration::hours(24);
        while self.window.front().is_some_and(|t| *t <= cutoff) {
            self.window.pop_front();
        }
    }

    /// Count a successful submission
    pub fn record(&mut self, at: DateTime<Utc>) {
        self.roll(at);
        self.today += 1;
        self.window.push_back(at);
    }

    /// Release the slot taken by a submission that never filled
    pub fn rollback(&mut self, at: DateTime<Utc>) {
        if let Some(idx) = self.window.iter().rposition(|t| *t == at) {
            self.window.remove(idx);
        }
        if at.date_naive() == self.day {
            self.today = self.today.saturating_sub(1);
        }
    }

    /// Submissions in the current UTC day
    pub fn daily_count(&self) -> u32 {
        self.today
    }

    /// Submissions within the last 24 hours as of the last roll
    pub fn rolling_count(&self) -> usize {
        self.window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_record_counts_today_and_window() {
        let mut counter = TradeFrequencyCounter::new(at(1, 0));
        counter.record(at(1, 1));
        counter.record(at(1, 2));
        assert_eq!(counter.daily_count(), 2);
        assert_eq!(counter.rolling_count(), 2);
    }

    #[test]
    fn test_day_rollover_resets_daily_bucket_only() {
        let mut counter = TradeFrequencyCounter::new(at(1, 0));
        counter.record(at(1, 22));
        counter.record(at(1, 23));

        counter.roll(at(2, 1));
        assert_eq!(counter.daily_count(), 0);
        // Still inside the rolling window
        assert_eq!(counter.rolling_count(), 2);

        counter.roll(at(2, 23));
        assert_eq!(counter.rolling_count(), 0);
    }

    #[test]
    fn test_rollback_releases_slot() {
        let mut counter = TradeFrequencyCounter::new(at(1, 0));
        counter.record(at(1, 5));
        counter.record(at(1, 6));

        counter.rollback(at(1, 6));
        assert_eq!(counter.daily_count(), 1);
        assert_eq!(counter.rolling_count(), 1);
    }

    #[test]
    fn test_rollback_of_previous_day_keeps_today() {
        let mut counter = TradeFrequencyCounter::new(at(1, 0));
        counter.record(at(1, 23));
        counter.record(at(2, 1));

        counter.rollback(at(1, 23));
        assert_eq!(counter.daily_count(), 1);
        assert_eq!(counter.rolling_count(), 1);
    }
}
