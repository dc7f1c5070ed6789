use crate::error::{Error, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use std::fmt::Display;

/// Local sunrise and sunset as "HH:MM" for the given coordinates.
pub trait SunSource {
    fn rise(&mut self, latitude: f64, longitude: f64) -> Result<String>;
    fn set(&mut self, latitude: f64, longitude: f64) -> Result<String>;
}

struct Cached {
    date: NaiveDate,
    latitude: f64,
    longitude: f64,
    rise: String,
    set: String,
}

pub struct SunCalc<Tz: TimeZone> {
    tz: Tz,
    cache: Option<Cached>,
}

impl<Tz: TimeZone> SunCalc<Tz>
where
    Tz::Offset: Display,
{
    pub fn new(tz: Tz) -> Self {
        Self { tz, cache: None }
    }

    fn local_time(&self, unixtime_ms: i64) -> Result<String> {
        match self.tz.timestamp_millis_opt(unixtime_ms).single() {
            Some(t) => Ok(t.format("%H:%M").to_string()),
            None => Err(Error::SunUnavailable(format!(
                "cannot convert {} to local time",
                unixtime_ms
            ))),
        }
    }

    pub fn times_on(
        &mut self,
        date: NaiveDate,
        latitude: f64,
        longitude: f64,
    ) -> Result<(String, String)> {
        if let Some(c) = &self.cache {
            if c.date == date && c.latitude == latitude && c.longitude == longitude {
                return Ok((c.rise.clone(), c.set.clone()));
            }
        }
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(Error::SunUnavailable(format!(
                "bad coordinates {}, {}",
                latitude, longitude
            )));
        }

        let noon = match date.and_hms_opt(12, 0, 0) {
            Some(t) => Utc.from_utc_datetime(&t).timestamp_millis(),
            None => return Err(Error::SunUnavailable(format!("bad date {}", date))),
        };
        let rise_ms = sun::time_at_phase(noon, sun::SunPhase::Sunrise, latitude, longitude, 0.0);
        let set_ms = sun::time_at_phase(noon, sun::SunPhase::Sunset, latitude, longitude, 0.0);
        let rise = self.local_time(rise_ms)?;
        let set = self.local_time(set_ms)?;
        debug!("sun: {} at {}, {}: rise {}, set {}", date, latitude, longitude, rise, set);

        self.cache = Some(Cached {
            date,
            latitude,
            longitude,
            rise: rise.clone(),
            set: set.clone(),
        });
        Ok((rise, set))
    }

    fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.tz).date_naive()
    }
}

impl<Tz: TimeZone> SunSource for SunCalc<Tz>
where
    Tz::Offset: Display,
{
    fn rise(&mut self, latitude: f64, longitude: f64) -> Result<String> {
        let today = self.today();
        Ok(self.times_on(today, latitude, longitude)?.0)
    }

    fn set(&mut self, latitude: f64, longitude: f64) -> Result<String> {
        let today = self.today();
        Ok(self.times_on(today, latitude, longitude)?.1)
    }
}
