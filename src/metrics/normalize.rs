// Normalizer - averages extracted data points and rescales them
//
// Rescaling follows the naming convention of the metrics API: service
// timings are reported in microseconds, app and user-action metrics in
// milliseconds. The sheet holds seconds.

use serde_json::Value;
use thiserror::Error;

/// Errors that leave a metric without a value for this run
#[derive(Error, Debug, PartialEq)]
pub enum NormalizeError {
    #[error("No data points in response")]
    NoData,

    #[error("Non-numeric data point: {0}")]
    NonNumeric(String),
}

/// Divisor applied to the mean, chosen from the selector name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scale {
    /// `builtin:service.` and `calc:service.` metrics
    Micros,

    /// `builtin:apps.` and `uacm.` metrics
    Millis,

    Unscaled,
}

const MICROS_MARKERS: [&str; 2] = ["builtin:service.", "calc:service."];
const MILLIS_MARKERS: [&str; 2] = ["builtin:apps.", "uacm."];

impl Scale {
    /// Picks the scale for a selector using case-sensitive substring checks
    pub fn for_selector(selector: &str) -> Self {
        if MICROS_MARKERS.iter().any(|marker| selector.contains(marker)) {
            Scale::Micros
        } else if MILLIS_MARKERS.iter().any(|marker| selector.contains(marker)) {
            Scale::Millis
        } else {
            Scale::Unscaled
        }
    }

    pub fn divisor(self) -> f64 {
        match self {
            Scale::Micros => 1_000_000.0,
            Scale::Millis => 1_000.0,
            Scale::Unscaled => 1.0,
        }
    }

    pub fn apply(self, value: f64) -> f64 {
        value / self.divisor()
    }
}

/// Averages the extracted entries and rescales the mean for `selector`
///
/// Nested arrays are flattened and nulls dropped before averaging.
///
/// # Errors
/// * `NormalizeError::NoData` - nothing but nulls and empty arrays
/// * `NormalizeError::NonNumeric` - a string, bool or object data point
pub fn normalize(selector: &str, extracted: &[&Value]) -> Result<f64, NormalizeError> {
    let mut points = Vec::new();
    for entry in extracted {
        flatten_into(entry, &mut points)?;
    }

    // A series of nulls means the entity reported nothing in the window
    if points.is_empty() {
        return Err(NormalizeError::NoData);
    }

    let mean = points.iter().sum::<f64>() / points.len() as f64;
    Ok(Scale::for_selector(selector).apply(mean))
}

/// Appends every number found in `value` to `points`, depth first
///
/// # Arguments
/// * `value` - one extracted entry, a number or an arbitrarily nested array
/// * `points` - accumulator shared across all entries of a response
///
/// # Returns
/// * `Ok(())` - every leaf was a number or null
/// * `Err(NormalizeError::NonNumeric)` - the first leaf that is neither
fn flatten_into(value: &Value, points: &mut Vec<f64>) -> Result<(), NormalizeError> {
    match value {
        // Gaps in a series
        Value::Null => Ok(()),
        Value::Array(items) => items.iter().try_for_each(|item| flatten_into(item, points)),
        Value::Number(number) => {
            // Only fails for arbitrary-precision numbers outside f64
            let point = number
                .as_f64()
                .ok_or_else(|| NormalizeError::NonNumeric(number.to_string()))?;
            points.push(point);
            Ok(())
        }
        other => Err(NormalizeError::NonNumeric(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_scale_for_selector() {
        assert_eq!(Scale::for_selector("builtin:service.response.time"), Scale::Micros);
        assert_eq!(Scale::for_selector("calc:service.checkout_latency"), Scale::Micros);
        assert_eq!(Scale::for_selector("builtin:apps.web.actionDuration"), Scale::Millis);
        assert_eq!(Scale::for_selector("uacm.users"), Scale::Millis);
        assert_eq!(Scale::for_selector("builtin:host.cpu.usage"), Scale::Unscaled);
        // Matching is case-sensitive
        assert_eq!(Scale::for_selector("BUILTIN:SERVICE.response"), Scale::Unscaled);
    }

    #[test]
    fn test_mean_of_non_null_points() {
        let entry = json!([10, 20, null]);
        let value = normalize("builtin:host.cpu.usage", &[&entry]).unwrap();
        assert!(close(value, 15.0));
    }

    #[test]
    fn test_service_scaling() {
        let entry = json!([[10, 20, null]]);
        let value = normalize("builtin:service.responsetime", &[&entry]).unwrap();
        assert!(close(value, 0.000015));
    }

    #[test]
    fn test_millis_scaling() {
        let entry = json!([[5, 5]]);
        let value = normalize("uacm.users", &[&entry]).unwrap();
        assert!(close(value, 0.005));
    }

    #[test]
    fn test_mean_across_entries() {
        let first = json!([1.5, null]);
        let second = json!([2.5, 3.5]);
        let scalar = json!(4.5);
        let value = normalize("custom.metric", &[&first, &second, &scalar]).unwrap();
        assert!(close(value, 3.0));
    }

    #[test]
    fn test_no_data() {
        assert_eq!(normalize("uacm.users", &[]), Err(NormalizeError::NoData));

        let nulls = json!([null, null]);
        let empty = json!([]);
        assert_eq!(
            normalize("uacm.users", &[&nulls, &empty, &Value::Null]),
            Err(NormalizeError::NoData)
        );
    }

    #[test]
    fn test_non_numeric_point() {
        let entry = json!([1, "n/a"]);
        assert!(matches!(
            normalize("uacm.users", &[&entry]),
            Err(NormalizeError::NonNumeric(_))
        ));
    }
}
