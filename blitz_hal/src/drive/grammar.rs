//! Servo driver command grammar.
//!
//! The wire grammar of the servo driver is not fixed yet. Everything that
//! depends on it goes through [`DriveGrammar`]; [`PlaceholderGrammar`] is
//! the ASCII command set the commissioning firmware accepts today.

/// Information carried by one line received from the drive.
#[derive(Debug, Clone, PartialEq)]
pub enum DriveEvent {
    /// Unsolicited alarm report.
    Alarm(String),
    /// Reply to a position query.
    Position(f64),
    /// Reply to an alarm query.
    AlarmState(bool),
    /// Reply to a motion query.
    Moving(bool),
    /// Anything else (acknowledgements, banners).
    Other,
}

/// Command encoder and reply decoder for one drive model.
pub trait DriveGrammar: Send + Sync {
    fn move_absolute(&self, position_mm: f64, speed_mm_s: f64) -> String;
    fn move_relative(&self, distance_mm: f64, speed_mm_s: f64) -> String;
    fn stop(&self) -> String;
    fn query_position(&self) -> String;
    fn query_alarm(&self) -> String;
    fn query_moving(&self) -> String;
    fn clear_alarm(&self) -> String;
    fn set_speed(&self, speed_mm_s: f64) -> String;
    fn set_acceleration(&self, accel_mm_s2: f64) -> String;
    fn home(&self, speed_mm_s: f64) -> String;
    fn reset(&self) -> String;

    /// Value part of a reply: `"POS=12.5"` and `"12.5"` both give `"12.5"`.
    fn reply_value<'a>(&self, reply: &'a str) -> &'a str {
        reply
            .split_once('=')
            .map_or(reply, |(_, value)| value)
            .trim()
    }

    /// Classify one received line.
    fn classify(&self, line: &str) -> DriveEvent;
}

/// `PA`/`PR`/`ST`/`?POS` command set.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderGrammar;

fn flag(value: &str) -> Option<bool> {
    value.parse::<i64>().ok().map(|v| v != 0)
}

impl DriveGrammar for PlaceholderGrammar {
    fn move_absolute(&self, position_mm: f64, speed_mm_s: f64) -> String {
        format!("PA {position_mm:.3} {speed_mm_s:.1}")
    }

    fn move_relative(&self, distance_mm: f64, speed_mm_s: f64) -> String {
        format!("PR {distance_mm:.3} {speed_mm_s:.1}")
    }

    fn stop(&self) -> String {
        "ST".to_string()
    }

    fn query_position(&self) -> String {
        "?POS".to_string()
    }

    fn query_alarm(&self) -> String {
        "?ALM".to_string()
    }

    fn query_moving(&self) -> String {
        "?MOV".to_string()
    }

    fn clear_alarm(&self) -> String {
        "CLRALM".to_string()
    }

    fn set_speed(&self, speed_mm_s: f64) -> String {
        format!("SPEED {speed_mm_s:.1}")
    }

    fn set_acceleration(&self, accel_mm_s2: f64) -> String {
        format!("ACCEL {accel_mm_s2:.1}")
    }

    fn home(&self, speed_mm_s: f64) -> String {
        format!("HOME {speed_mm_s:.1}")
    }

    fn reset(&self) -> String {
        "RESET".to_string()
    }

    fn classify(&self, line: &str) -> DriveEvent {
        let line = line.trim();
        if line
            .get(..5)
            .is_some_and(|head| head.eq_ignore_ascii_case("ALARM"))
        {
            return DriveEvent::Alarm(line.to_string());
        }
        let Some((key, value)) = line.split_once('=') else {
            return DriveEvent::Other;
        };
        let value = value.trim();
        match key.trim().to_ascii_uppercase().as_str() {
            "POS" => value
                .parse()
                .map(DriveEvent::Position)
                .unwrap_or(DriveEvent::Other),
            "ALM" => flag(value).map_or(DriveEvent::Other, DriveEvent::AlarmState),
            "MOV" => flag(value).map_or(DriveEvent::Other, DriveEvent::Moving),
            _ => DriveEvent::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_text() {
        let g = PlaceholderGrammar;
        assert_eq!(g.move_absolute(1000.5, 500.0), "PA 1000.500 500.0");
        assert_eq!(g.move_relative(-12.25, 80.0), "PR -12.250 80.0");
        assert_eq!(g.stop(), "ST");
        assert_eq!(g.home(500.0), "HOME 500.0");
        assert_eq!(g.set_acceleration(2500.0), "ACCEL 2500.0");
    }

    #[test]
    fn reply_values_split_on_equals() {
        let g = PlaceholderGrammar;
        assert_eq!(g.reply_value("POS=1234.56"), "1234.56");
        assert_eq!(g.reply_value(" 1234.56 "), "1234.56");
        assert_eq!(g.reply_value("ALM= 1"), "1");
    }

    #[test]
    fn classification() {
        let g = PlaceholderGrammar;
        assert_eq!(
            g.classify("ALARM 31 overcurrent"),
            DriveEvent::Alarm("ALARM 31 overcurrent".to_string())
        );
        assert!(matches!(g.classify("alarm"), DriveEvent::Alarm(_)));
        assert_eq!(g.classify("POS=250.000"), DriveEvent::Position(250.0));
        assert_eq!(g.classify("ALM=0"), DriveEvent::AlarmState(false));
        assert_eq!(g.classify("MOV=1"), DriveEvent::Moving(true));
        assert_eq!(g.classify("OK"), DriveEvent::Other);
        assert_eq!(g.classify("POS=abc"), DriveEvent::Other);
    }
}
