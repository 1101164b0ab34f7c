//! Lunar/solar calendar arithmetic and birthday matching.
//!
//! The conversion follows the usual astronomical construction of the
//! Vietnamese lunisolar calendar: locate the k-th new moon, anchor months on
//! the month containing the winter solstice (lunar month 11), and resolve
//! leap months from apparent sun longitude. All of it is closed-form `f64`
//! arithmetic; days are Julian day numbers shifted by the local timezone.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

pub const CRATE_NAME: &str = "adwatch-almanac";

/// Vietnam standard time. The calendar shifts with the observer's timezone,
/// so the offset is a parameter everywhere and this is only the default.
pub const DEFAULT_TZ_HOURS: f64 = 7.0;

const SYNODIC_MONTH: f64 = 29.530588853;
const NEW_MOON_EPOCH_JD: f64 = 2415021.076998695;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LunarDate {
    pub day: u32,
    pub month: u32,
    pub year: i32,
    #[serde(default)]
    pub leap: bool,
}

impl LunarDate {
    pub fn new(day: u32, month: u32, year: i32) -> Self {
        Self {
            day,
            month,
            year,
            leap: false,
        }
    }
}

fn jd_from_date(day: i64, month: i64, year: i64) -> i64 {
    let a = (14 - month) / 12;
    let y = year + 4800 - a;
    let m = month + 12 * a - 3;
    let jd = day + (153 * m + 2) / 5 + 365 * y + y / 4 - y / 100 + y / 400 - 32045;
    if jd < 2299161 {
        day + (153 * m + 2) / 5 + 365 * y + y / 4 - 32083
    } else {
        jd
    }
}

fn jd_to_date(jd: i64) -> (i64, i64, i64) {
    let (b, c);
    if jd > 2299160 {
        let a = jd + 32044;
        b = (4 * a + 3) / 146097;
        c = a - 146097 * b / 4;
    } else {
        b = 0;
        c = jd + 32082;
    }
    let d = (4 * c + 3) / 1461;
    let e = c - 1461 * d / 4;
    let m = (5 * e + 2) / 153;
    let day = e - (153 * m + 2) / 5 + 1;
    let month = m + 3 - 12 * (m / 10);
    let year = b * 100 + d - 4800 + m / 10;
    (day, month, year)
}

/// Julian date of the k-th new moon counted from the 1900 epoch.
fn new_moon(k: i64) -> f64 {
    let t = k as f64 / 1236.85;
    let t2 = t * t;
    let t3 = t2 * t;
    let dr = PI / 180.0;

    let mut jd1 = 2415020.75933 + 29.53058868 * k as f64 + 0.0001178 * t2 - 0.000000155 * t3;
    jd1 += 0.00033 * ((166.56 + 132.87 * t - 0.009173 * t2) * dr).sin();
    let m = 359.2242 + 29.10535608 * k as f64 - 0.0000333 * t2 - 0.00000347 * t3;
    let mpr = 306.0253 + 385.81691806 * k as f64 + 0.0107306 * t2 + 0.00001236 * t3;
    let f = 21.2964 + 390.67050646 * k as f64 - 0.0016528 * t2 - 0.00000239 * t3;

    let mut c1 = (0.1734 - 0.000393 * t) * (m * dr).sin() + 0.0021 * (2.0 * dr * m).sin();
    c1 = c1 - 0.4068 * (mpr * dr).sin() + 0.0161 * (dr * 2.0 * mpr).sin();
    c1 -= 0.0004 * (dr * 3.0 * mpr).sin();
    c1 = c1 + 0.0104 * (dr * 2.0 * f).sin() - 0.0051 * (dr * (m + mpr)).sin();
    c1 = c1 - 0.0074 * (dr * (m - mpr)).sin() + 0.0004 * (dr * (2.0 * f + m)).sin();
    c1 = c1 - 0.0004 * (dr * (2.0 * f - m)).sin() - 0.0006 * (dr * (2.0 * f + mpr)).sin();
    c1 = c1 + 0.0010 * (dr * (2.0 * f - mpr)).sin() + 0.0005 * (dr * (2.0 * mpr + m)).sin();

    let deltat = if t < -11.0 {
        0.001 + 0.000839 * t + 0.0002261 * t2 - 0.00000845 * t3 - 0.000000081 * t * t3
    } else {
        -0.000278 + 0.000265 * t + 0.000262 * t2
    };
    jd1 + c1 - deltat
}

/// Apparent ecliptic longitude of the sun, in radians in [0, 2π).
fn sun_longitude(jdn: f64) -> f64 {
    let t = (jdn - 2451545.0) / 36525.0;
    let t2 = t * t;
    let dr = PI / 180.0;
    let m = 357.52910 + 35999.05030 * t - 0.0001559 * t2 - 0.00000048 * t * t2;
    let l0 = 280.46645 + 36000.76983 * t + 0.0003032 * t2;
    let mut dl = (1.914600 - 0.004817 * t - 0.000014 * t2) * (dr * m).sin();
    dl += (0.019993 - 0.000101 * t) * (dr * 2.0 * m).sin() + 0.000290 * (dr * 3.0 * m).sin();
    let l = (l0 + dl) * dr;
    l - 2.0 * PI * (l / (2.0 * PI)).floor()
}

/// Zodiac term index 0..11 of the sun at local midnight ending `day_number`.
fn sun_longitude_index(day_number: i64, tz_hours: f64) -> i64 {
    (sun_longitude(day_number as f64 - 0.5 - tz_hours / 24.0) / PI * 6.0).floor() as i64
}

fn new_moon_day(k: i64, tz_hours: f64) -> i64 {
    (new_moon(k) + 0.5 + tz_hours / 24.0).floor() as i64
}

/// First day of the lunar month 11 of `year` (the month containing the
/// winter solstice).
fn lunar_month_11(year: i64, tz_hours: f64) -> i64 {
    let off = jd_from_date(31, 12, year) as f64 - 2415021.0;
    let k = (off / SYNODIC_MONTH).floor() as i64;
    let mut nm = new_moon_day(k, tz_hours);
    if sun_longitude_index(nm, tz_hours) >= 9 {
        nm = new_moon_day(k - 1, tz_hours);
    }
    nm
}

fn leap_month_offset(a11: i64, tz_hours: f64) -> i64 {
    let k = ((a11 as f64 - NEW_MOON_EPOCH_JD) / SYNODIC_MONTH + 0.5).floor() as i64;
    let mut i = 1i64;
    let mut arc = sun_longitude_index(new_moon_day(k + i, tz_hours), tz_hours);
    loop {
        let last = arc;
        i += 1;
        arc = sun_longitude_index(new_moon_day(k + i, tz_hours), tz_hours);
        if arc == last || i >= 14 {
            break;
        }
    }
    i - 1
}

/// Convert a lunar date to the solar date it falls on, or `None` when the
/// date does not exist (e.g. a leap month the year does not have).
pub fn lunar_to_solar(lunar: LunarDate, tz_hours: f64) -> Option<NaiveDate> {
    if lunar.day == 0 || lunar.day > 30 || lunar.month == 0 || lunar.month > 12 {
        return None;
    }
    let (lunar_day, lunar_month, lunar_year) =
        (lunar.day as i64, lunar.month as i64, lunar.year as i64);

    let (a11, b11) = if lunar_month < 11 {
        (
            lunar_month_11(lunar_year - 1, tz_hours),
            lunar_month_11(lunar_year, tz_hours),
        )
    } else {
        (
            lunar_month_11(lunar_year, tz_hours),
            lunar_month_11(lunar_year + 1, tz_hours),
        )
    };

    let k = (0.5 + (a11 as f64 - NEW_MOON_EPOCH_JD) / SYNODIC_MONTH).floor() as i64;
    let mut off = lunar_month - 11;
    if off < 0 {
        off += 12;
    }
    if b11 - a11 > 365 {
        let leap_off = leap_month_offset(a11, tz_hours);
        let mut leap_month = leap_off - 2;
        if leap_month < 0 {
            leap_month += 12;
        }
        if lunar.leap && lunar_month != leap_month {
            return None;
        }
        if lunar.leap || off >= leap_off {
            off += 1;
        }
    } else if lunar.leap {
        return None;
    }

    let month_start = new_moon_day(k + off, tz_hours);
    let month_len = new_moon_day(k + off + 1, tz_hours) - month_start;
    if lunar_day > month_len {
        return None;
    }
    let (day, month, year) = jd_to_date(month_start + lunar_day - 1);
    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
}

/// Solar date the lunar day/month falls on in `target_year`, ignoring the
/// lunar date's own (birth) year. Leap months are not considered: the source
/// book records plain day/month pairs.
pub fn solar_for_year(lunar: LunarDate, target_year: i32, tz_hours: f64) -> Option<NaiveDate> {
    lunar_to_solar(
        LunarDate::new(lunar.day, lunar.month, target_year),
        tz_hours,
    )
}

/// One row of the birthday book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BirthdayEntry {
    pub name: String,
    #[serde(default)]
    pub solar: Option<NaiveDate>,
    #[serde(default)]
    pub lunar: Option<LunarDate>,
    /// Derived column: the lunar birthday's solar date in the current year.
    #[serde(default)]
    pub solar_from_lunar: Option<NaiveDate>,
}

/// Recompute the derived solar-from-lunar column for `target_year`. Returns
/// whether anything changed, so the caller writes the book back only then.
pub fn refresh_solar_from_lunar(
    entries: &mut [BirthdayEntry],
    target_year: i32,
    tz_hours: f64,
) -> bool {
    let mut changed = false;
    for entry in entries.iter_mut() {
        let Some(lunar) = entry.lunar else { continue };
        let derived = solar_for_year(lunar, target_year, tz_hours);
        if derived != entry.solar_from_lunar {
            entry.solar_from_lunar = derived;
            changed = true;
        }
    }
    changed
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "calendar", content = "date")]
pub enum BirthdayBasis {
    Solar(NaiveDate),
    Lunar(LunarDate),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BirthdayMatch {
    pub name: String,
    pub basis: BirthdayBasis,
}

/// Entries whose solar or derived solar-from-lunar birthday shares `target`'s
/// month and day. An entry can match on both calendars at once.
pub fn birthdays_on(entries: &[BirthdayEntry], target: NaiveDate) -> Vec<BirthdayMatch> {
    let mut matches = Vec::new();
    for entry in entries {
        if let Some(solar) = entry.solar {
            if solar.month() == target.month() && solar.day() == target.day() {
                matches.push(BirthdayMatch {
                    name: entry.name.clone(),
                    basis: BirthdayBasis::Solar(solar),
                });
            }
        }
        if let (Some(derived), Some(lunar)) = (entry.solar_from_lunar, entry.lunar) {
            if derived.month() == target.month() && derived.day() == target.day() {
                matches.push(BirthdayMatch {
                    name: entry.name.clone(),
                    basis: BirthdayBasis::Lunar(lunar),
                });
            }
        }
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
    }

    #[test]
    fn tet_dates_convert_correctly() {
        // Lunar new year (1/1) across several years, UTC+7.
        assert_eq!(
            lunar_to_solar(LunarDate::new(1, 1, 2024), DEFAULT_TZ_HOURS),
            Some(d(2024, 2, 10))
        );
        assert_eq!(
            lunar_to_solar(LunarDate::new(1, 1, 2025), DEFAULT_TZ_HOURS),
            Some(d(2025, 1, 29))
        );
        assert_eq!(
            lunar_to_solar(LunarDate::new(1, 1, 2026), DEFAULT_TZ_HOURS),
            Some(d(2026, 2, 17))
        );
    }

    #[test]
    fn mid_autumn_2025_is_october_6() {
        assert_eq!(
            lunar_to_solar(LunarDate::new(15, 8, 2025), DEFAULT_TZ_HOURS),
            Some(d(2025, 10, 6))
        );
    }

    #[test]
    fn hung_kings_day_2025_is_april_7() {
        assert_eq!(
            lunar_to_solar(LunarDate::new(10, 3, 2025), DEFAULT_TZ_HOURS),
            Some(d(2025, 4, 7))
        );
    }

    #[test]
    fn out_of_range_lunar_components_are_rejected() {
        assert_eq!(lunar_to_solar(LunarDate::new(0, 1, 2025), DEFAULT_TZ_HOURS), None);
        assert_eq!(lunar_to_solar(LunarDate::new(31, 1, 2025), DEFAULT_TZ_HOURS), None);
        assert_eq!(lunar_to_solar(LunarDate::new(1, 13, 2025), DEFAULT_TZ_HOURS), None);
    }

    #[test]
    fn day_30_of_a_29_day_month_does_not_exist() {
        // Lunar month 2 of 2025 runs 28/02..28/03 solar, 29 days.
        assert_eq!(
            lunar_to_solar(LunarDate::new(29, 2, 2025), DEFAULT_TZ_HOURS),
            Some(d(2025, 3, 28))
        );
        assert_eq!(
            lunar_to_solar(LunarDate::new(30, 2, 2025), DEFAULT_TZ_HOURS),
            None
        );
    }

    #[test]
    fn solar_for_year_uses_target_year() {
        let lunar = LunarDate::new(1, 1, 1990);
        assert_eq!(
            solar_for_year(lunar, 2025, DEFAULT_TZ_HOURS),
            Some(d(2025, 1, 29))
        );
    }

    #[test]
    fn refresh_updates_only_stale_rows_and_reports_change() {
        let mut entries = vec![
            BirthdayEntry {
                name: "An".to_string(),
                solar: Some(d(1992, 3, 14)),
                lunar: None,
                solar_from_lunar: None,
            },
            BirthdayEntry {
                name: "Bình".to_string(),
                solar: None,
                lunar: Some(LunarDate::new(1, 1, 1988)),
                solar_from_lunar: None,
            },
        ];

        assert!(refresh_solar_from_lunar(&mut entries, 2025, DEFAULT_TZ_HOURS));
        assert_eq!(entries[0].solar_from_lunar, None);
        assert_eq!(entries[1].solar_from_lunar, Some(d(2025, 1, 29)));

        // Second refresh for the same year is a no-op.
        assert!(!refresh_solar_from_lunar(&mut entries, 2025, DEFAULT_TZ_HOURS));
    }

    #[test]
    fn matches_solar_and_lunar_birthdays_on_month_and_day() {
        let mut entries = vec![
            BirthdayEntry {
                name: "An".to_string(),
                solar: Some(d(1992, 1, 29)),
                lunar: None,
                solar_from_lunar: None,
            },
            BirthdayEntry {
                name: "Bình".to_string(),
                solar: None,
                lunar: Some(LunarDate::new(1, 1, 1988)),
                solar_from_lunar: None,
            },
            BirthdayEntry {
                name: "Chi".to_string(),
                solar: Some(d(1995, 7, 2)),
                lunar: None,
                solar_from_lunar: None,
            },
        ];
        refresh_solar_from_lunar(&mut entries, 2025, DEFAULT_TZ_HOURS);

        let matches = birthdays_on(&entries, d(2025, 1, 29));
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].name, "An");
        assert!(matches!(matches[0].basis, BirthdayBasis::Solar(_)));
        assert_eq!(matches[1].name, "Bình");
        assert!(matches!(matches[1].basis, BirthdayBasis::Lunar(_)));
    }

    #[test]
    fn no_matches_on_a_quiet_day() {
        let entries = vec![BirthdayEntry {
            name: "An".to_string(),
            solar: Some(d(1992, 3, 14)),
            lunar: None,
            solar_from_lunar: None,
        }];
        assert!(birthdays_on(&entries, d(2025, 6, 1)).is_empty());
    }
}
