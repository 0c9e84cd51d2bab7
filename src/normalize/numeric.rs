use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::sync::LazyLock;

static NON_NUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^0-9.,\-]").expect("static pattern"));

/// Coerce a model-supplied value into a decimal.
///
/// Returns `None` when the value is not numeric-like; callers substitute zero.
pub fn to_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .ok()
        }
        Value::String(s) => parse_amount(s),
        _ => None,
    }
}

/// Parse a free-form amount such as `"$ 1.234,56"` or `"10,50 EUR"`.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let kept = NON_NUMERIC.replace_all(raw, "");
    let normalized = normalize_separators(&kept)?;
    Decimal::from_str(&normalized).ok()
}

/// Rewrite `,`/`.` so that exactly one `.` (at most) marks the decimal point.
///
/// * a single separator of either kind is the decimal point;
/// * with both kinds present the last separator is the decimal point and the
///   other kind is thousands grouping;
/// * one kind repeated on its own is ambiguous and rejected.
fn normalize_separators(s: &str) -> Option<String> {
    let commas = s.matches(',').count();
    let dots = s.matches('.').count();

    match (commas, dots) {
        (0, 0) | (0, 1) => Some(s.to_string()),
        (1, 0) => Some(s.replace(',', ".")),
        (c, d) if c > 0 && d > 0 => {
            let last = s.rfind([',', '.'])?;
            let (decimal, grouping) = if s[last..].starts_with(',') {
                (',', '.')
            } else {
                ('.', ',')
            };
            if s.matches(decimal).count() > 1 {
                return None;
            }
            Some(
                s.chars()
                    .filter(|&c| c != grouping)
                    .map(|c| if c == decimal { '.' } else { c })
                    .collect(),
            )
        }
        _ => None,
    }
}
