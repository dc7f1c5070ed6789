use crate::schedule::{Action, Schedule, Target, Timer};
use crate::timespec::TimeSpec;
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use std::fmt::Display;

pub const GRACE_SECS: i64 = 5; //timer slop absorbed around each wake

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockState {
    Idle,
    Armed,
    Due,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Due {
    Rescan,
    Switch { target: Target, action: Action },
}

//every check covers (watermark, now + grace] and moves the watermark to
//now + grace, so an occurrence is dispatched at most once
pub struct Clock<Tz: TimeZone> {
    pub name: String,
    pub state: ClockState,
    tz: Tz,
    grace: Duration,
    watermark: Option<DateTime<Utc>>,
    rescan_interval: Option<u32>,
    next_rescan: Option<DateTime<Utc>>,
}

impl<Tz: TimeZone> Clock<Tz>
where
    Tz::Offset: Display,
{
    pub fn new(tz: Tz) -> Self {
        Self {
            name: "clock".into(),
            state: ClockState::Idle,
            tz,
            grace: Duration::seconds(GRACE_SECS),
            watermark: None,
            rescan_interval: None,
            next_rescan: None,
        }
    }

    /// First instant strictly after `after` that matches time of day and weekdays.
    pub fn occurrence_after(&self, time: &TimeSpec, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = after.with_timezone(&self.tz).date_naive();
        let time_of_day = NaiveTime::from_num_seconds_from_midnight_opt(time.seconds_of_day, 0)?;
        for day in 0..=7 {
            let date = today + Duration::days(day);
            if !time.matches(date.weekday()) {
                continue;
            }
            //skipped entirely when the local time falls into a DST gap on that date
            let local = self.tz.from_local_datetime(&date.and_time(time_of_day));
            let candidate = match local.earliest() {
                Some(t) => t.with_timezone(&Utc),
                None => continue,
            };
            if candidate > after {
                return Some(candidate);
            }
        }
        None
    }

    pub fn next_occurrence(&self, time: &TimeSpec, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.occurrence_after(time, self.since(now))
    }

    pub fn next_rescan(&self) -> Option<DateTime<Utc>> {
        self.next_rescan
    }

    //an unchanged interval keeps the running period
    pub fn sync_rescan(&mut self, interval: Option<u32>, now: DateTime<Utc>) {
        if interval == self.rescan_interval {
            return;
        }
        self.rescan_interval = interval;
        self.next_rescan = interval.map(|secs| now + Duration::seconds(secs as i64));
        match self.next_rescan {
            Some(at) => debug!(
                "{}: next rescan at {}",
                self.name,
                at.with_timezone(&self.tz).format("%F %T")
            ),
            None => debug!("{}: periodic rescan disabled", self.name),
        }
    }

    pub fn rescanned(&mut self, now: DateTime<Utc>) {
        self.next_rescan = self
            .rescan_interval
            .map(|secs| now + Duration::seconds(secs as i64));
    }

    fn since(&self, bound: DateTime<Utc>) -> DateTime<Utc> {
        match self.watermark {
            Some(mark) if mark > bound => mark,
            _ => bound,
        }
    }

    fn fire(&mut self, since: DateTime<Utc>, now: DateTime<Utc>, schedule: &Schedule) -> Vec<Due> {
        self.state = ClockState::Due;
        let horizon = now + self.grace;

        let mut due = vec![];
        for (category, timer) in schedule.iter() {
            if let Timer::Switch {
                target,
                time,
                action,
            } = timer
            {
                match self.occurrence_after(time, since) {
                    Some(at) if at <= horizon => {
                        debug!("{}: {} {} {} is due", self.name, category, target, action);
                        due.push(Due::Switch {
                            target: target.clone(),
                            action: *action,
                        });
                    }
                    _ => (),
                }
            }
        }

        self.watermark = Some(horizon);
        due
    }

    //switches come first, a rescan blocks the loop
    pub fn check(&mut self, now: DateTime<Utc>, schedule: &Schedule) -> Vec<Due> {
        let since = self.since(now - self.grace);
        let mut due = self.fire(since, now, schedule);
        if let Some(at) = self.next_rescan {
            if at <= now + self.grace {
                due.push(Due::Rescan);
                self.rescanned(now);
            }
        }
        due
    }

    /// Switches that came due while the loop was busy since `started`.
    pub fn catch_up(
        &mut self,
        started: DateTime<Utc>,
        now: DateTime<Utc>,
        schedule: &Schedule,
    ) -> Vec<Due> {
        let since = self.since(started - self.grace);
        self.fire(since, now, schedule)
    }

    pub fn arm(&mut self, now: DateTime<Utc>, schedule: &Schedule) -> Option<DateTime<Utc>> {
        let after = self.since(now);
        let mut deadline = self.next_rescan;
        for (_, timer) in schedule.iter() {
            if let Timer::Switch { time, .. } = timer {
                if let Some(at) = self.occurrence_after(time, after) {
                    deadline = Some(match deadline {
                        Some(d) if d <= at => d,
                        _ => at,
                    });
                }
            }
        }

        self.state = match deadline {
            Some(at) => {
                trace!(
                    "{}: armed for {}",
                    self.name,
                    at.with_timezone(&self.tz).format("%F %T")
                );
                ClockState::Armed
            }
            None => ClockState::Idle,
        };
        deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plug::Plug;
    use crate::schedule::tests::{named, StubSun};
    use crate::schedule::Compiler;
    use crate::settings::Settings;
    use chrono::FixedOffset;
    use pretty_assertions::assert_eq;

    fn tz() -> FixedOffset {
        FixedOffset::east_opt(3600).unwrap()
    }

    //2024-06-12 is a Wednesday, 2024-06-15 a Saturday
    fn at(day: u32, h: u32, m: u32, s: u32) -> DateTime<Utc> {
        tz().with_ymd_and_hms(2024, 6, day, h, m, s)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn compile(config: &str, plugs: &[Plug]) -> Schedule {
        let settings = Settings::parse(config).unwrap();
        Compiler::new().compile(&settings, plugs, &mut StubSun::new("06:00", "20:00"))
    }

    fn lamp_on() -> Due {
        Due::Switch {
            target: Target {
                addr: named(1, "Lamp").addr(),
                name: "Lamp".into(),
            },
            action: Action::On,
        }
    }

    #[test]
    fn weekday_restriction_skips_to_next_week() {
        let clock = Clock::new(tz());
        let wednesday_seven = TimeSpec::new(7 * 3600, 0b000_0100);
        assert_eq!(
            clock.occurrence_after(&wednesday_seven, at(12, 8, 0, 0)),
            Some(at(19, 7, 0, 0))
        );
        //unrestricted: tomorrow
        assert_eq!(
            clock.occurrence_after(&TimeSpec::new(7 * 3600, 0), at(12, 8, 0, 0)),
            Some(at(13, 7, 0, 0))
        );
        //later today
        assert_eq!(
            clock.occurrence_after(&TimeSpec::new(9 * 3600, 0b000_0100), at(12, 8, 0, 0)),
            Some(at(12, 9, 0, 0))
        );
    }

    #[test]
    fn lamp_fires_on_saturday_evening() {
        let schedule = compile(
            "[Lamp]\ndaily = true\nontimes = 7:00,19:00%6-7\n",
            &[named(1, "Lamp")],
        );
        let mut clock = Clock::new(tz());
        let now = at(15, 18, 59, 57);

        assert_eq!(clock.arm(at(15, 12, 0, 0), &schedule), Some(at(15, 19, 0, 0)));
        assert_eq!(clock.state, ClockState::Armed);

        assert_eq!(clock.check(now, &schedule), vec![lamp_on()]);
        assert_eq!(clock.state, ClockState::Due);

        let weekend = TimeSpec::new(19 * 3600, 0b110_0000);
        assert_eq!(clock.next_occurrence(&weekend, now), Some(at(16, 19, 0, 0)));
        assert_eq!(clock.arm(now, &schedule), Some(at(16, 7, 0, 0)));
    }

    #[test]
    fn each_occurrence_fires_once() {
        let schedule = compile(
            "[Lamp]\ndaily = true\nontimes = 19:00\n",
            &[named(1, "Lamp")],
        );
        let mut clock = Clock::new(tz());

        assert_eq!(clock.check(at(15, 18, 59, 57), &schedule), vec![lamp_on()]);
        assert!(clock.check(at(15, 18, 59, 59), &schedule).is_empty());
        assert!(clock.check(at(15, 19, 0, 1), &schedule).is_empty());
        assert_eq!(clock.check(at(16, 19, 0, 0), &schedule), vec![lamp_on()]);
    }

    #[test]
    fn early_wake_fires_nothing() {
        let schedule = compile(
            "[Lamp]\ndaily = true\nontimes = 19:00\n",
            &[named(1, "Lamp")],
        );
        let mut clock = Clock::new(tz());
        assert!(clock.check(at(15, 18, 59, 40), &schedule).is_empty());
        assert_eq!(clock.arm(at(15, 18, 59, 40), &schedule), Some(at(15, 19, 0, 0)));
        assert_eq!(clock.check(at(15, 19, 0, 0), &schedule), vec![lamp_on()]);
    }

    #[test]
    fn missed_occurrence_is_not_replayed() {
        let schedule = compile(
            "[Lamp]\ndaily = true\nontimes = 7:00\n",
            &[named(1, "Lamp")],
        );
        let mut clock = Clock::new(tz());
        clock.check(at(15, 6, 0, 0), &schedule);
        //the process was stuck well past 07:00
        assert!(clock.check(at(15, 9, 0, 0), &schedule).is_empty());
    }

    #[test]
    fn rescan_runs_periodically() {
        let schedule = compile("[global]\nrescan = 300\n", &[]);
        let mut clock = Clock::new(tz());
        let start = at(15, 12, 0, 0);
        clock.sync_rescan(schedule.rescan_interval(), start);

        assert_eq!(clock.arm(start, &schedule), Some(at(15, 12, 5, 0)));
        assert!(clock.check(at(15, 12, 4, 0), &schedule).is_empty());
        assert_eq!(clock.check(at(15, 12, 5, 0), &schedule), vec![Due::Rescan]);
        assert_eq!(clock.next_rescan(), Some(at(15, 12, 10, 0)));

        //same interval after recompiling keeps the period
        clock.sync_rescan(Some(300), at(15, 12, 6, 0));
        assert_eq!(clock.next_rescan(), Some(at(15, 12, 10, 0)));

        clock.sync_rescan(None, at(15, 12, 6, 0));
        assert_eq!(clock.arm(at(15, 12, 6, 0), &schedule), None);
        assert_eq!(clock.state, ClockState::Idle);
    }

    #[test]
    fn timer_due_during_rescan_fires_afterwards() {
        let schedule = compile(
            "[Lamp]\ndaily = true\nontimes = 13:05:07\n",
            &[named(1, "Lamp")],
        );
        let mut clock = Clock::new(tz());
        assert!(clock.check(at(15, 13, 0, 0), &schedule).is_empty());
        assert_eq!(clock.arm(at(15, 13, 0, 0), &schedule), Some(at(15, 13, 5, 7)));

        //a requested rescan holds the loop from 13:05:05 to 13:05:08
        let started = at(15, 13, 5, 5);
        clock.rescanned(started);
        let now = at(15, 13, 5, 8);
        assert_eq!(clock.catch_up(started, now, &schedule), vec![lamp_on()]);

        assert!(clock.check(at(15, 13, 5, 9), &schedule).is_empty());
        assert_eq!(clock.arm(now, &schedule), Some(at(16, 13, 5, 7)));
    }

    #[test]
    fn catch_up_does_not_replay_older_misses() {
        let schedule = compile(
            "[Lamp]\ndaily = true\nontimes = 7:00\n",
            &[named(1, "Lamp")],
        );
        let mut clock = Clock::new(tz());
        clock.check(at(15, 6, 0, 0), &schedule);
        //resumed from suspend at 09:00 straight into a rescan
        let started = at(15, 9, 0, 0);
        assert!(clock
            .catch_up(started, at(15, 9, 0, 3), &schedule)
            .is_empty());
    }

    #[test]
    fn switches_come_before_rescan() {
        let schedule = compile(
            "[global]\nrescan = 300\n[Lamp]\ndaily = true\nontimes = 19:00\n",
            &[named(1, "Lamp")],
        );
        let mut clock = Clock::new(tz());
        clock.sync_rescan(schedule.rescan_interval(), at(15, 18, 55, 0));
        assert_eq!(
            clock.check(at(15, 19, 0, 0), &schedule),
            vec![lamp_on(), Due::Rescan]
        );
    }
}
