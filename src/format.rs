/// Render a metric value the way mackerel-agent expects: integral values
/// without a fractional part, everything else with six decimals.
pub fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        format!("{}", value as i64)
    } else {
        format!("{value:.6}")
    }
}
