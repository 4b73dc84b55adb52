//! Timer parsing and the intermediate timer-catch executor.
//!
//! Durations are ISO-8601-like (`PT5S`, `PT1M30S`, `P1DT2H`); dates are
//! RFC 3339; cycles are `R<n>/PT<duration>`. Sleeps are interruptible: the
//! cancellation token wins immediately.

use super::{ExecContext, ExecOutcome, TaskExecutor};
use crate::error::{EngineError, EngineResult};
use crate::events::EventPayload;
use crate::model::Element;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum TimerSpec {
    Duration(Duration),
    Date(DateTime<Utc>),
    Cycle { repetitions: u32, interval: Duration },
}

/// Parse an ISO-8601-like duration: `P[nD]` and/or `T[nH][nM][nS]`, with a
/// fractional seconds field allowed. Weeks (`P2W`) are accepted as 7-day
/// units.
pub fn parse_duration(input: &str) -> EngineResult<Duration> {
    let s = input.trim();
    let rest = s
        .strip_prefix('P')
        .or_else(|| s.strip_prefix('p'))
        .ok_or_else(|| bad_timer(s, "missing `P` prefix"))?;

    let (date_part, time_part) = match rest.split_once(['T', 't']) {
        Some((d, t)) => (d, t),
        None => (rest, ""),
    };

    let mut total = 0.0f64;
    let mut any = false;

    for (text, unit) in [(date_part, "date"), (time_part, "time")] {
        let mut number = String::new();
        for c in text.chars() {
            if c.is_ascii_digit() || c == '.' {
                number.push(c);
                continue;
            }
            let value: f64 = number
                .parse()
                .map_err(|_| bad_timer(s, "missing digits before unit"))?;
            number.clear();
            any = true;
            let seconds = match (unit, c.to_ascii_uppercase()) {
                ("date", 'W') => value * 7.0 * 86_400.0,
                ("date", 'D') => value * 86_400.0,
                ("time", 'H') => value * 3_600.0,
                ("time", 'M') => value * 60.0,
                ("time", 'S') => value,
                _ => return Err(bad_timer(s, &format!("unexpected unit `{c}`"))),
            };
            total += seconds;
        }
        if !number.is_empty() {
            return Err(bad_timer(s, "trailing digits without a unit"));
        }
    }

    if !any {
        return Err(bad_timer(s, "no components"));
    }
    Ok(Duration::from_secs_f64(total))
}

/// Parse `R<n>/PT<duration>`.
pub fn parse_cycle(input: &str) -> EngineResult<(u32, Duration)> {
    let s = input.trim();
    let rest = s
        .strip_prefix('R')
        .or_else(|| s.strip_prefix('r'))
        .ok_or_else(|| bad_timer(s, "missing `R` prefix"))?;
    let (count, duration) = rest
        .split_once('/')
        .ok_or_else(|| bad_timer(s, "missing `/` separator"))?;
    let repetitions: u32 = count
        .parse()
        .map_err(|_| bad_timer(s, "bad repetition count"))?;
    if repetitions == 0 {
        return Err(bad_timer(s, "repetition count must be at least 1"));
    }
    Ok((repetitions, parse_duration(duration)?))
}

/// Read the timer properties off an element. `timerType` selects the field;
/// when absent, the populated field wins.
pub fn parse_timer(element: &Element) -> EngineResult<TimerSpec> {
    let timer_type = element
        .prop_str("timerType")
        .unwrap_or_default()
        .to_lowercase();

    let duration_prop = element.prop_str("timerDuration");
    let date_prop = element.prop_str("timerDate");
    let cycle_prop = element.prop_str("timerCycle");

    match timer_type.as_str() {
        "duration" => {
            let raw = duration_prop
                .ok_or_else(|| bad_timer(&element.id, "timerDuration missing"))?;
            Ok(TimerSpec::Duration(parse_duration(&raw)?))
        }
        "date" => {
            let raw = date_prop.ok_or_else(|| bad_timer(&element.id, "timerDate missing"))?;
            let parsed = DateTime::parse_from_rfc3339(raw.trim())
                .map_err(|e| bad_timer(&raw, &e.to_string()))?;
            Ok(TimerSpec::Date(parsed.with_timezone(&Utc)))
        }
        "cycle" => {
            let raw = cycle_prop.ok_or_else(|| bad_timer(&element.id, "timerCycle missing"))?;
            let (repetitions, interval) = parse_cycle(&raw)?;
            Ok(TimerSpec::Cycle {
                repetitions,
                interval,
            })
        }
        "" => {
            if let Some(raw) = duration_prop {
                Ok(TimerSpec::Duration(parse_duration(&raw)?))
            } else if let Some(raw) = date_prop {
                let parsed = DateTime::parse_from_rfc3339(raw.trim())
                    .map_err(|e| bad_timer(&raw, &e.to_string()))?;
                Ok(TimerSpec::Date(parsed.with_timezone(&Utc)))
            } else if let Some(raw) = cycle_prop {
                let (repetitions, interval) = parse_cycle(&raw)?;
                Ok(TimerSpec::Cycle {
                    repetitions,
                    interval,
                })
            } else {
                Err(bad_timer(&element.id, "no timer properties"))
            }
        }
        other => Err(bad_timer(&element.id, &format!("unknown timerType `{other}`"))),
    }
}

fn bad_timer(what: &str, reason: &str) -> EngineError {
    EngineError::Executor(format!("timer `{what}`: {reason}"))
}

/// Interruptible sleep. Returns false if cancellation won.
pub async fn sleep_cancellable(
    duration: Duration,
    cancel: &tokio_util::sync::CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

pub struct TimerEventExecutor;

#[async_trait]
impl TaskExecutor for TimerEventExecutor {
    async fn execute(&self, exec: &ExecContext) -> EngineResult<ExecOutcome> {
        let spec = parse_timer(&exec.element)?;
        exec.set_waiting();

        match spec {
            TimerSpec::Duration(duration) => {
                if !sleep_cancellable(duration, &exec.cancel).await {
                    return cancelled();
                }
            }
            TimerSpec::Date(deadline) => {
                let now = Utc::now();
                let wait = (deadline - now).to_std().unwrap_or(Duration::ZERO);
                if !sleep_cancellable(wait, &exec.cancel).await {
                    return cancelled();
                }
            }
            TimerSpec::Cycle {
                repetitions,
                interval,
            } => {
                for fire in 1..=repetitions {
                    if !sleep_cancellable(interval, &exec.cancel).await {
                        return cancelled();
                    }
                    exec.emit(EventPayload::TaskProgress {
                        message: format!("timer cycle {fire}/{repetitions} fired"),
                    });
                }
            }
        }

        exec.set_running();
        Ok(ExecOutcome::Completed)
    }
}

fn cancelled() -> EngineResult<ExecOutcome> {
    Ok(ExecOutcome::Cancelled {
        reason: "timer interrupted".to_string(),
        partial: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_durations() {
        assert_eq!(parse_duration("PT5S").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("PT1M30S").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("PT2H").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("P1D").unwrap(), Duration::from_secs(86_400));
        assert_eq!(
            parse_duration("P1DT2H3M4S").unwrap(),
            Duration::from_secs(86_400 + 7200 + 180 + 4)
        );
        assert_eq!(
            parse_duration("PT0.5S").unwrap(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn rejects_garbage_durations() {
        assert!(parse_duration("5 seconds").is_err());
        assert!(parse_duration("P").is_err());
        assert!(parse_duration("PT5").is_err());
        assert!(parse_duration("PT5X").is_err());
    }

    #[test]
    fn parses_cycles() {
        let (reps, interval) = parse_cycle("R3/PT10S").unwrap();
        assert_eq!(reps, 3);
        assert_eq!(interval, Duration::from_secs(10));
        assert!(parse_cycle("R0/PT10S").is_err());
        assert!(parse_cycle("PT10S").is_err());
    }
}
