//! Trading-session clocks.
//!
//! Times are evaluated in the venue's own zone so daylight-saving shifts
//! come from the tz database. Exchange holidays are not modelled.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::America::New_York;
use chrono_tz::Asia::Seoul;
use chrono_tz::Tz;

fn hm(h: u32, m: u32) -> u32 {
    h * 60 + m
}

/// Regular US session: weekdays 09:30 through 16:00 New York time, both
/// ends inclusive at minute granularity.
pub fn is_us_market_open(now: DateTime<Utc>) -> bool {
    let ny = now.with_timezone(&New_York);
    if matches!(ny.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let minute = hm(ny.hour(), ny.minute());
    (hm(9, 30)..=hm(16, 0)).contains(&minute)
}

/// Window in which the brokerage accepts US reservation orders: 10:00 to
/// 23:20 Seoul time, except its 16:30-16:45 settlement break.
pub fn is_reservation_window(now: DateTime<Utc>) -> bool {
    let kst = now.with_timezone(&Seoul);
    let minute = hm(kst.hour(), kst.minute());
    let open = (hm(10, 0)..=hm(23, 20)).contains(&minute);
    let settling = (hm(16, 30)..=hm(16, 45)).contains(&minute);
    open && !settling
}

/// Next instant strictly after `now` at which the wall clock in `tz`
/// reads `at`.
///
/// On a spring-forward day a skipped time runs an hour later; on a
/// fall-back day the earlier of the two readings is used.
pub fn next_daily_run(now: DateTime<Utc>, tz: Tz, at: NaiveTime) -> DateTime<Utc> {
    let local_today = now.with_timezone(&tz).date_naive();
    for offset in 0..3 {
        let date = local_today + ChronoDuration::days(offset);
        let naive = date.and_time(at);
        let candidate = tz
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| tz.from_local_datetime(&(naive + ChronoDuration::hours(1))).earliest());
        if let Some(local) = candidate {
            let utc = local.with_timezone(&Utc);
            if utc > now {
                return utc;
            }
        }
    }
    now + ChronoDuration::days(1)
}
