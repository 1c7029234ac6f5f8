//! Field constraints shared by the write endpoints.

use chrono::NaiveDate;

use crate::error::ValidationErrors;

pub const MAX_HOURS_PER_ENTRY: f64 = 24.0;

pub fn require_text(errors: &mut ValidationErrors, field: &str, value: &str, max_len: usize) {
    if value.trim().is_empty() {
        errors.add(field, "This field is required");
    } else {
        max_length(errors, field, value, max_len);
    }
}

pub fn max_length(errors: &mut ValidationErrors, field: &str, value: &str, max_len: usize) {
    if value.chars().count() > max_len {
        errors.add(field, format!("Must be at most {max_len} characters"));
    }
}

/// End may equal start.
pub fn end_not_before(errors: &mut ValidationErrors, field: &str, start: NaiveDate, end: NaiveDate) {
    if end < start {
        errors.add(field, "End date cannot be before start date");
    }
}

pub fn non_negative(errors: &mut ValidationErrors, field: &str, value: f64) {
    if !value.is_finite() || value < 0.0 {
        errors.add(field, "Must be zero or greater");
    }
}

pub fn positive(errors: &mut ValidationErrors, field: &str, value: f64) {
    if !value.is_finite() || value <= 0.0 {
        errors.add(field, "Must be greater than zero");
    }
}

/// Logged hours must lie in (0, 24] and be whole hundredths.
pub fn work_hours(errors: &mut ValidationErrors, field: &str, hours: f64) {
    if !hours.is_finite() || hours <= 0.0 {
        errors.add(field, "Hours must be positive");
    } else if hours > MAX_HOURS_PER_ENTRY {
        errors.add(field, "Cannot log more than 24 hours in a day");
    } else if !is_hundredths(hours) {
        errors.add(field, "Hours can have at most 2 decimal places");
    }
}

fn is_hundredths(value: f64) -> bool {
    let scaled = value * 100.0;
    (scaled - scaled.round()).abs() < 1e-6
}

pub fn coordinates(errors: &mut ValidationErrors, latitude: Option<f64>, longitude: Option<f64>) {
    if latitude.is_some_and(|lat| !(-90.0..=90.0).contains(&lat)) {
        errors.add("latitude", "Latitude must be between -90 and 90");
    }
    if longitude.is_some_and(|lon| !(-180.0..=180.0).contains(&lon)) {
        errors.add("longitude", "Longitude must be between -180 and 180");
    }
}

pub fn email(errors: &mut ValidationErrors, field: &str, value: &str) {
    let valid = value
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !valid {
        errors.add(field, "Enter a valid email address");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hours_ok(hours: f64) -> bool {
        let mut errors = ValidationErrors::new();
        work_hours(&mut errors, "hours", hours);
        errors.is_empty()
    }

    #[test]
    fn hours_bounds() {
        assert!(hours_ok(0.1));
        assert!(hours_ok(2.35));
        assert!(hours_ok(24.0));
        assert!(!hours_ok(0.004));
        assert!(!hours_ok(1.005));
        assert!(!hours_ok(24.01));
        assert!(!hours_ok(0.0));
        assert!(!hours_ok(-1.0));
        assert!(!hours_ok(f64::NAN));
    }

    #[test]
    fn text_and_dates() {
        let mut errors = ValidationErrors::new();
        require_text(&mut errors, "name", "   ", 10);
        max_length(&mut errors, "description", "abcdef", 5);
        let start = NaiveDate::from_ymd_opt(2025, 5, 2).unwrap();
        end_not_before(&mut errors, "planned_end", start, start);
        end_not_before(&mut errors, "actual_end", start, start.pred_opt().unwrap());
        email(&mut errors, "email", "worker@site.fr");
        email(&mut errors, "contact", "nope");

        assert!(errors.field("name").is_some());
        assert!(errors.field("description").is_some());
        assert!(errors.field("planned_end").is_none());
        assert!(errors.field("actual_end").is_some());
        assert!(errors.field("email").is_none());
        assert!(errors.field("contact").is_some());
    }
}
