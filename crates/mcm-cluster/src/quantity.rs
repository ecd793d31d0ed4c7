//! Numeric reading of orchestrator resource quantities (`500m`, `512Mi`, `1G`).

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1024.0 * 1024.0),
    ("Gi", 1024.0 * 1024.0 * 1024.0),
    ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
];

/// Value of a quantity in base units, `None` when it is not parseable.
pub fn parse(q: &Quantity) -> Option<f64> {
    let s = q.0.trim();
    if s.is_empty() {
        return None;
    }
    for (suffix, factor) in SUFFIXES {
        if let Some(num) = s.strip_suffix(suffix) {
            return num.parse::<f64>().ok().map(|n| n * factor);
        }
    }
    // plain numbers, including exponent forms like 1e3
    s.parse::<f64>().ok()
}

pub fn cores(q: &Quantity) -> f64 {
    parse(q).unwrap_or(0.0)
}

pub fn mebibytes(q: &Quantity) -> f64 {
    parse(q).unwrap_or(0.0) / 1024.0 / 1024.0
}

pub fn gibibytes(q: &Quantity) -> f64 {
    parse(q).unwrap_or(0.0) / 1024.0 / 1024.0 / 1024.0
}
