//! カレンダー・季節性タグ
//!
//! タイムスタンプのみから導出される季節性フィールド。同じタイムスタンプと
//! 休日カレンダーからは常に同じタグが得られる。

use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// 休日カレンダー
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolidayCalendar {
    holidays: BTreeSet<NaiveDate>,
}

impl HolidayCalendar {
    /// 空のカレンダーを作成
    pub fn new() -> Self {
        Self::default()
    }

    /// 日付リストからカレンダーを作成
    pub fn from_dates(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            holidays: dates.into_iter().collect(),
        }
    }

    /// 休日を追加
    pub fn with_holiday(mut self, date: NaiveDate) -> Self {
        self.holidays.insert(date);
        self
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }

    pub fn len(&self) -> usize {
        self.holidays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holidays.is_empty()
    }
}

/// 季節性タグ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeasonalityTags {
    /// 曜日（1=月曜 … 7=日曜）
    pub day_of_week: u8,
    /// ISO週番号（1-53）
    pub week_of_year: u8,
    /// 月（1-12）
    pub month: u8,
    /// 四半期（1-4）
    pub quarter: u8,
    /// 時（0-23）
    pub hour: u8,
    pub is_weekend: bool,
    pub is_holiday: bool,
}

impl SeasonalityTags {
    /// タイムスタンプから季節性タグを導出
    pub fn derive(timestamp: DateTime<Utc>, calendar: &HolidayCalendar) -> Self {
        let weekday = timestamp.weekday();
        let month = timestamp.month() as u8;

        Self {
            day_of_week: weekday.number_from_monday() as u8,
            week_of_year: timestamp.iso_week().week() as u8,
            month,
            quarter: (month - 1) / 3 + 1,
            hour: timestamp.hour() as u8,
            is_weekend: matches!(weekday, Weekday::Sat | Weekday::Sun),
            is_holiday: calendar.is_holiday(timestamp.date_naive()),
        }
    }
}

/// 集計期間 [start, end)（日付単位）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start >= end {
            return Err(Error::validation(format!(
                "period start {} must precede end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// 暦月の期間
    pub fn month(year: i32, month: u32) -> Result<Self> {
        let start = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| Error::validation(format!("invalid month {}-{}", year, month)))?;
        let end = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)
        }
        .ok_or_else(|| Error::validation(format!("invalid month {}-{}", year, month)))?;
        Self::new(start, end)
    }

    /// 最終日を含む期間（内部では翌日を終端にする）
    pub fn through(start: NaiveDate, last_day: NaiveDate) -> Result<Self> {
        let end = last_day
            .succ_opt()
            .ok_or_else(|| Error::validation(format!("period end {} is out of range", last_day)))?;
        Self::new(start, end)
    }

    /// 終端（含まない）から遡る日数の期間
    pub fn trailing_days(end: NaiveDate, days: i64) -> Result<Self> {
        Self::new(end - Duration::days(days), end)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date < self.end
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    /// 直前の同じ長さの期間
    pub fn previous(&self) -> Self {
        let length = self.end - self.start;
        Self {
            start: self.start - length,
            end: self.start,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}
