use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::NodeError;

/// Time service queried once at boot to set the hardware clock.
pub const TIME_API_URL: &str = "http://worldtimeapi.org/api/timezone/Etc/UTC";

/// Response body of the time API.
#[derive(Debug, Deserialize)]
pub struct TimeApiResponse {
    /// ISO8601-like string, e.g. "2025-11-25T13:45:30.123456+01:00".
    pub datetime: String,
    /// 1 = Monday .. 7 = Sunday.
    pub day_of_week: i64,
}

/// Parts handed to the hardware RTC. Weekday is 0 = Monday .. 6 = Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSetting {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub weekday: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl ClockSetting {
    /// Seconds since the Unix epoch, for `settimeofday`-style clocks.
    pub fn epoch_seconds(&self) -> Result<i64, NodeError> {
        let datetime = NaiveDate::from_ymd_opt(self.year, self.month, self.day)
            .and_then(|date| date.and_hms_opt(self.hour, self.minute, self.second))
            .ok_or_else(|| {
                NodeError::TimeSync(format!(
                    "time service returned an impossible date: {self:?}"
                ))
            })?;
        Ok(datetime.and_utc().timestamp())
    }
}

/// Parses the time API body into RTC parts. The datetime string is sliced at
/// fixed offsets rather than parsed as a full ISO8601 value; the service
/// always emits zero-padded fields.
pub fn parse_time_api(body: &str) -> Result<ClockSetting, NodeError> {
    let response: TimeApiResponse = serde_json::from_str(body)
        .map_err(|err| NodeError::TimeSync(format!("invalid time API response: {err}")))?;
    clock_setting(&response)
}

pub fn clock_setting(response: &TimeApiResponse) -> Result<ClockSetting, NodeError> {
    let dt = &response.datetime;
    if dt.len() < 19 {
        return Err(NodeError::TimeSync(format!(
            "datetime string too short: {dt:?}"
        )));
    }

    Ok(ClockSetting {
        year: field(dt, 0, 4)?,
        month: field(dt, 5, 7)?,
        day: field(dt, 8, 10)?,
        weekday: map_weekday(response.day_of_week),
        hour: field(dt, 11, 13)?,
        minute: field(dt, 14, 16)?,
        second: field(dt, 17, 19)?,
    })
}

/// The API counts 1 = Monday .. 7 = Sunday; the RTC wants 0 = Monday ..
/// 6 = Sunday. An out-of-range index is clamped to Sunday rather than
/// rejected, matching the reference behavior.
pub fn map_weekday(day_of_week: i64) -> u32 {
    let shifted = day_of_week - 1;
    if (0..=6).contains(&shifted) {
        shifted as u32
    } else {
        6
    }
}

fn field<T: std::str::FromStr>(dt: &str, start: usize, end: usize) -> Result<T, NodeError> {
    dt.get(start..end)
        .and_then(|part| part.parse().ok())
        .ok_or_else(|| {
            NodeError::TimeSync(format!(
                "datetime field at {start}..{end} is not numeric: {dt:?}"
            ))
        })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_full_response() {
        let body = r#"{"datetime": "2025-11-25T13:45:30.123456+01:00", "day_of_week": 2}"#;
        let clock = parse_time_api(body).unwrap();

        assert_eq!(
            clock,
            ClockSetting {
                year: 2025,
                month: 11,
                day: 25,
                weekday: 1,
                hour: 13,
                minute: 45,
                second: 30,
            }
        );
    }

    #[test]
    fn weekday_mapping_is_one_based_to_zero_based() {
        for (api, rtc) in [(1, 0), (2, 1), (6, 5), (7, 6)] {
            assert_eq!(map_weekday(api), rtc);
        }
    }

    #[test]
    fn degenerate_weekday_clamps_to_sunday() {
        assert_eq!(map_weekday(0), 6);
        assert_eq!(map_weekday(8), 6);
        assert_eq!(map_weekday(-3), 6);
    }

    #[test]
    fn truncated_datetime_is_rejected() {
        let body = r#"{"datetime": "2025-11-25T13:45", "day_of_week": 2}"#;
        assert!(parse_time_api(body).is_err());
    }

    #[test]
    fn garbage_datetime_is_rejected() {
        let body = r#"{"datetime": "yyyy-mm-ddThh:mm:ss", "day_of_week": 2}"#;
        assert!(parse_time_api(body).is_err());
    }

    #[test]
    fn epoch_conversion_matches_known_instant() {
        let clock = ClockSetting {
            year: 2026,
            month: 1,
            day: 1,
            weekday: 3,
            hour: 0,
            minute: 0,
            second: 0,
        };

        assert_eq!(clock.epoch_seconds().unwrap(), 1_767_225_600);
    }

    #[test]
    fn impossible_date_fails_epoch_conversion() {
        let clock = ClockSetting {
            year: 2026,
            month: 2,
            day: 30,
            weekday: 0,
            hour: 0,
            minute: 0,
            second: 0,
        };

        assert!(clock.epoch_seconds().is_err());
    }
}
