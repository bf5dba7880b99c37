//! DOS packed time/date conversion.
//!
//! Time: `hh<<11 | mm<<5 | ss/2`. Date: `(yyyy-1980)<<9 | mm<<5 | dd`.
//! Conversions go through the host's local timezone, matching what the
//! guest sees on its own clock.

use std::time::SystemTime;

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};

/// Pack a host timestamp into DOS (time, date).
pub fn to_dos(t: SystemTime) -> (u16, u16) {
    let dt: DateTime<Local> = t.into();
    let time = (dt.hour() << 11 | dt.minute() << 5 | dt.second() / 2) as u16;
    let date = (((dt.year() - 1980) & 0x7f) << 9) as u16 | (dt.month() << 5) as u16 | dt.day() as u16;
    (time, date)
}

/// Unpack DOS (time, date) into a host timestamp. `None` for field values
/// that name no real calendar instant.
pub fn from_dos(time: u16, date: u16) -> Option<SystemTime> {
    let sec = ((time & 0x1f) * 2) as u32;
    let min = ((time >> 5) & 0x3f) as u32;
    let hour = ((time >> 11) & 0x1f) as u32;
    let day = (date & 0x1f) as u32;
    let mon = ((date >> 5) & 0x0f) as u32;
    let year = 1980 + ((date >> 9) & 0x7f) as i32;

    match Local.with_ymd_and_hms(year, mon, day, hour, min, sec) {
        chrono::LocalResult::Single(dt) => Some(dt.into()),
        chrono::LocalResult::Ambiguous(dt, _) => Some(dt.into()),
        chrono::LocalResult::None => None,
    }
}
