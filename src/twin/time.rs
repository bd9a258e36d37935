//! 时间模型：时间点、时间分辨率与时间范围
//!
//! 所有时间以 Unix epoch 毫秒表示；月、年按固定跨度（30 天 / 365 天）折算，
//! 调度器的网格与分辨率计算都基于这里的毫秒跨度。

use std::fmt;

use serde::{Deserialize, Serialize};

/// 时间点（毫秒）
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct TimeInstant(i64);

impl TimeInstant {
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis())
    }

    pub fn millis(&self) -> i64 {
        self.0
    }

    pub fn plus_millis(&self, millis: i64) -> Self {
        Self(self.0.saturating_add(millis))
    }
}

impl fmt::Display for TimeInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match chrono::DateTime::<chrono::Utc>::from_timestamp_millis(self.0) {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}ms", self.0),
        }
    }
}

/// 分辨率单位，从粗到细排列
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionUnit {
    Millennium,
    Century,
    Decade,
    Year,
    Month,
    Week,
    Day,
    Hour,
    Minute,
    Second,
    Millisecond,
}

impl ResolutionUnit {
    /// 由粗到细的全部单位
    pub const ALL: [ResolutionUnit; 11] = [
        ResolutionUnit::Millennium,
        ResolutionUnit::Century,
        ResolutionUnit::Decade,
        ResolutionUnit::Year,
        ResolutionUnit::Month,
        ResolutionUnit::Week,
        ResolutionUnit::Day,
        ResolutionUnit::Hour,
        ResolutionUnit::Minute,
        ResolutionUnit::Second,
        ResolutionUnit::Millisecond,
    ];

    pub fn millis(&self) -> i64 {
        const DAY: i64 = 1000 * 60 * 60 * 24;
        match self {
            ResolutionUnit::Millisecond => 1,
            ResolutionUnit::Second => 1000,
            ResolutionUnit::Minute => 1000 * 60,
            ResolutionUnit::Hour => 1000 * 60 * 60,
            ResolutionUnit::Day => DAY,
            ResolutionUnit::Week => DAY * 7,
            ResolutionUnit::Month => DAY * 30,
            ResolutionUnit::Year => DAY * 365,
            ResolutionUnit::Decade => DAY * 365 * 10,
            ResolutionUnit::Century => DAY * 365 * 100,
            ResolutionUnit::Millennium => DAY * 365 * 1000,
        }
    }

    pub fn predicate(&self) -> &'static str {
        match self {
            ResolutionUnit::Millisecond => "millisecond",
            ResolutionUnit::Second => "second",
            ResolutionUnit::Minute => "minute",
            ResolutionUnit::Hour => "hourly",
            ResolutionUnit::Day => "daily",
            ResolutionUnit::Week => "weekly",
            ResolutionUnit::Month => "monthly",
            ResolutionUnit::Year => "yearly",
            ResolutionUnit::Decade => "decadal",
            ResolutionUnit::Century => "century",
            ResolutionUnit::Millennium => "millennial",
        }
    }
}

/// 时间分辨率：单位 × 倍数
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Resolution {
    pub unit: ResolutionUnit,
    pub multiplier: u64,
}

impl Resolution {
    pub fn new(multiplier: u64, unit: ResolutionUnit) -> Self {
        Self {
            unit,
            multiplier: multiplier.max(1),
        }
    }

    pub fn days(n: u64) -> Self {
        Self::new(n, ResolutionUnit::Day)
    }

    pub fn hours(n: u64) -> Self {
        Self::new(n, ResolutionUnit::Hour)
    }

    /// 用能整除 `millis` 的最粗单位表示该跨度
    pub fn of_millis(millis: i64) -> Self {
        let millis = millis.max(1);
        for unit in ResolutionUnit::ALL {
            if millis % unit.millis() == 0 {
                return Self::new((millis / unit.millis()) as u64, unit);
            }
        }
        Self::new(millis as u64, ResolutionUnit::Millisecond)
    }

    pub fn span_millis(&self) -> i64 {
        let multiplier = i64::try_from(self.multiplier).unwrap_or(i64::MAX);
        self.unit.millis().saturating_mul(multiplier)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.multiplier == 1 {
            write!(f, "{}", self.unit.predicate())
        } else {
            write!(f, "{} x {:?}", self.multiplier, self.unit)
        }
    }
}

/// 时间范围；带步长（step）的范围是发生型（occurrent）的时间网格
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TimeExtent {
    pub start: TimeInstant,
    pub end: TimeInstant,
    pub step: Option<Resolution>,
}

impl TimeExtent {
    /// 单一时间点
    pub fn point(at: TimeInstant) -> Self {
        Self {
            start: at,
            end: at,
            step: None,
        }
    }

    /// 无步长的时间段
    pub fn period(start: TimeInstant, end: TimeInstant) -> Self {
        let (start, end) = if end < start { (end, start) } else { (start, end) };
        Self {
            start,
            end,
            step: None,
        }
    }

    /// 按步长划分的时间网格
    pub fn grid(start: TimeInstant, end: TimeInstant, step: Resolution) -> Self {
        Self {
            step: Some(step),
            ..Self::period(start, end)
        }
    }

    pub fn is_occurrent(&self) -> bool {
        self.step.is_some()
    }

    pub fn span_millis(&self) -> i64 {
        self.end.millis().saturating_sub(self.start.millis())
    }

    /// 网格步数（向上取整）；无步长时为 0
    pub fn steps(&self) -> u64 {
        match self.step {
            Some(step) => {
                let span = self.span_millis();
                let step = step.span_millis();
                if span <= 0 {
                    0
                } else {
                    (span / step + i64::from(span % step != 0)) as u64
                }
            }
            None => 0,
        }
    }

    /// 第 index 个网格边界（该步的起点）
    pub fn boundary(&self, index: u64) -> Option<TimeInstant> {
        let step = self.step?;
        if index >= self.steps() {
            return None;
        }
        let offset = step.span_millis().checked_mul(i64::try_from(index).ok()?)?;
        Some(self.start.plus_millis(offset))
    }

    /// 第 index 步覆盖的时间段 [boundary, boundary + step)，末步截断到 end
    pub fn step_period(&self, index: u64) -> Option<TimeExtent> {
        let start = self.boundary(index)?;
        let step = self.step?.span_millis();
        let end = start.plus_millis(step).min(self.end);
        Some(TimeExtent::period(start, end))
    }

    pub fn boundaries(&self) -> Vec<TimeInstant> {
        (0..self.steps()).filter_map(|i| self.boundary(i)).collect()
    }

    /// 时间点是否落在范围内（半开区间；零长度范围只包含其自身时间点）
    pub fn contains(&self, at: TimeInstant) -> bool {
        if self.start == self.end {
            at == self.start
        } else {
            self.start <= at && at < self.end
        }
    }

    /// 两个范围是否有公共部分（零长度范围按时间点处理）
    pub fn intersects(&self, other: &TimeExtent) -> bool {
        match (self.start == self.end, other.start == other.end) {
            (true, _) => other.contains(self.start),
            (_, true) => self.contains(other.start),
            _ => self.start < other.end && other.start < self.end,
        }
    }
}

impl fmt::Display for TimeExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.step {
            Some(step) => write!(f, "[{} .. {} @ {}]", self.start, self.end, step),
            None if self.start == self.end => write!(f, "[{}]", self.start),
            None => write!(f, "[{} .. {}]", self.start, self.end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 86_400_000;

    #[test]
    fn test_resolution_of_millis_picks_coarsest_unit() {
        assert_eq!(Resolution::of_millis(DAY), Resolution::days(1));
        assert_eq!(Resolution::of_millis(DAY * 14), Resolution::new(2, ResolutionUnit::Week));
        assert_eq!(Resolution::of_millis(DAY * 3), Resolution::days(3));
        assert_eq!(Resolution::of_millis(1500), Resolution::new(1500, ResolutionUnit::Millisecond));
    }

    #[test]
    fn test_grid_boundaries() {
        let start = TimeInstant::from_millis(0);
        let extent = TimeExtent::grid(start, start.plus_millis(10 * DAY), Resolution::days(1));
        assert!(extent.is_occurrent());
        assert_eq!(extent.steps(), 10);
        let boundaries = extent.boundaries();
        assert_eq!(boundaries.first(), Some(&start));
        assert_eq!(boundaries.last(), Some(&start.plus_millis(9 * DAY)));
        assert_eq!(extent.boundary(10), None);
    }

    #[test]
    fn test_partial_last_step_is_truncated() {
        let start = TimeInstant::from_millis(0);
        let extent = TimeExtent::grid(start, start.plus_millis(DAY + DAY / 2), Resolution::days(1));
        assert_eq!(extent.steps(), 2);
        let last = extent.step_period(1).unwrap();
        assert_eq!(last.end, extent.end);
    }

    #[test]
    fn test_point_contains_only_itself() {
        let t = TimeInstant::from_millis(42);
        let point = TimeExtent::point(t);
        assert!(point.contains(t));
        assert!(!point.contains(t.plus_millis(1)));
        assert_eq!(point.steps(), 0);
    }

    #[test]
    fn test_intersects() {
        let t = TimeInstant::from_millis(0);
        let first = TimeExtent::period(t, t.plus_millis(DAY));
        let second = TimeExtent::period(t.plus_millis(DAY), t.plus_millis(2 * DAY));
        assert!(!first.intersects(&second));
        assert!(first.intersects(&TimeExtent::period(t.plus_millis(DAY / 2), t.plus_millis(2 * DAY))));
        assert!(first.intersects(&TimeExtent::point(t)));
        assert!(!TimeExtent::point(t.plus_millis(DAY)).intersects(&first));
    }

    #[test]
    fn test_extreme_extents_do_not_overflow() {
        let huge = Resolution::new(u64::MAX, ResolutionUnit::Millennium);
        assert_eq!(huge.span_millis(), i64::MAX);

        let extent = TimeExtent::grid(TimeInstant::from_millis(i64::MIN), TimeInstant::from_millis(i64::MAX), huge);
        assert_eq!(extent.span_millis(), i64::MAX);
        assert_eq!(extent.steps(), 1);
        assert_eq!(extent.boundary(0), Some(TimeInstant::from_millis(i64::MIN)));
        assert_eq!(extent.boundary(u64::MAX), None);

        let fine = TimeExtent::grid(TimeInstant::from_millis(i64::MIN), TimeInstant::from_millis(i64::MAX), Resolution::days(1));
        assert!(fine.steps() > 0);
        assert!(fine.step_period(fine.steps() - 1).is_some());
    }
}
