//! Business-hours evaluation in the deployment's fixed locale offset.
//!
//! Schedules come either from a queue's stored configuration or from the
//! CRM; both deserialise to [`WeekSchedule`].

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Opening hours for one weekday. Times are `HH:MM` in local time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DayHours {
    /// 0 = Monday … 6 = Sunday.
    pub day: u8,
    pub open: String,
    pub close: String,
}

/// A full week of opening hours. Days without an entry are closed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WeekSchedule {
    pub days: Vec<DayHours>,
}

/// Result of evaluating a schedule at an instant.
#[derive(Debug, Clone, Serialize)]
pub struct HoursStatus {
    pub is_open: bool,
    pub current_day: String,
    pub current_time: String,
    pub schedule: WeekSchedule,
}

const DAY_NAMES: [&str; 7] = [
    "lunes",
    "martes",
    "miércoles",
    "jueves",
    "viernes",
    "sábado",
    "domingo",
];

/// Evaluate `schedule` at `now`, shifted into the fixed locale offset.
pub fn evaluate(schedule: &WeekSchedule, now: DateTime<Utc>, utc_offset_minutes: i32) -> HoursStatus {
    let offset =
        FixedOffset::east_opt(utc_offset_minutes * 60).unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
    let local = now.with_timezone(&offset);

    let day_index = local.weekday().num_days_from_monday() as u8;
    let minute_of_day = (local.hour() * 60 + local.minute()) as u16;

    let is_open = schedule
        .days
        .iter()
        .filter(|d| d.day == day_index)
        .any(|d| match (parse_hhmm(&d.open), parse_hhmm(&d.close)) {
            (Some(open), Some(close)) => open <= minute_of_day && minute_of_day < close,
            _ => false,
        });

    HoursStatus {
        is_open,
        current_day: DAY_NAMES[day_index as usize].to_string(),
        current_time: format!("{:02}:{:02}", local.hour(), local.minute()),
        schedule: schedule.clone(),
    }
}

fn parse_hhmm(s: &str) -> Option<u16> {
    let (h, m) = s.split_once(':')?;
    let h: u16 = h.parse().ok()?;
    let m: u16 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn weekday_schedule() -> WeekSchedule {
        WeekSchedule {
            days: (0..5)
                .map(|day| DayHours {
                    day,
                    open: "09:00".into(),
                    close: "18:00".into(),
                })
                .collect(),
        }
    }

    #[test]
    fn open_during_lima_business_hours() {
        // 2026-03-02 is a Monday; 15:00 UTC = 10:00 in Lima (-05:00).
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap();
        let status = evaluate(&weekday_schedule(), now, -300);
        assert!(status.is_open);
        assert_eq!(status.current_day, "lunes");
        assert_eq!(status.current_time, "10:00");
    }

    #[test]
    fn closed_before_opening() {
        // 13:59 UTC = 08:59 in Lima.
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 13, 59, 0).unwrap();
        assert!(!evaluate(&weekday_schedule(), now, -300).is_open);
    }

    #[test]
    fn close_boundary_is_exclusive() {
        // 23:00 UTC = 18:00 in Lima, already closed.
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 23, 0, 0).unwrap();
        assert!(!evaluate(&weekday_schedule(), now, -300).is_open);
    }

    #[test]
    fn missing_day_means_closed() {
        // 2026-03-07 is a Saturday; schedule only covers Mon-Fri.
        let now = Utc.with_ymd_and_hms(2026, 3, 7, 15, 0, 0).unwrap();
        let status = evaluate(&weekday_schedule(), now, -300);
        assert!(!status.is_open);
        assert_eq!(status.current_day, "sábado");
    }

    #[test]
    fn malformed_times_mean_closed() {
        let schedule = WeekSchedule {
            days: vec![DayHours {
                day: 0,
                open: "9am".into(),
                close: "18:00".into(),
            }],
        };
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap();
        assert!(!evaluate(&schedule, now, -300).is_open);
    }
}
