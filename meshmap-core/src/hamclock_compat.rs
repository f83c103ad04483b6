//! Propagation-service compatibility layer.
//!
//! Two dashboard variants answer the same logical endpoints with diverging
//! key spellings: the legacy HamClock and its community successor
//! OpenHamClock. These pure functions detect which variant answered and fold
//! case variants, aliases, and deprecated field names into one canonical
//! shape. No I/O here.

use std::collections::HashMap;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    HamClock,
    OpenHamClock,
    Unknown,
}

impl Variant {
    pub fn as_str(self) -> &'static str {
        match self {
            Variant::HamClock => "hamclock",
            Variant::OpenHamClock => "openhamclock",
            Variant::Unknown => "unknown",
        }
    }
}

/// Detect the responding variant from the `get_sys.txt` body.
pub fn detect_variant(sys_text: &str) -> Variant {
    if sys_text.trim().is_empty() {
        return Variant::Unknown;
    }
    if sys_text.to_ascii_lowercase().contains("openhamclock") {
        Variant::OpenHamClock
    } else {
        Variant::HamClock
    }
}

/// Logical endpoint names mapped to URL paths for a detected variant.
/// The variants currently share paths; OpenHamClock adds `config`.
pub fn endpoint_map(variant: Variant) -> HashMap<&'static str, &'static str> {
    let mut endpoints = HashMap::from([
        ("system", "/get_sys.txt"),
        ("spacewx", "/get_spacewx.txt"),
        ("band_conditions", "/get_bc.txt"),
        ("voacap", "/get_voacap.txt"),
        ("de", "/get_de.txt"),
        ("dx", "/get_dx.txt"),
        ("dxspots", "/get_dxspots.txt"),
    ]);
    if variant == Variant::OpenHamClock {
        endpoints.insert("config", "/get_config.txt");
    }
    endpoints
}

/// Parse the `key=value` text format both variants emit. Lines without `=`
/// are skipped; whitespace around keys and values is trimmed.
pub fn parse_key_value(text: &str) -> HashMap<String, String> {
    let mut parsed = HashMap::new();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                parsed.insert(key.to_string(), value.trim().to_string());
            }
        }
    }
    parsed
}

fn normalize_keys(
    parsed: HashMap<String, String>,
    aliases: &[(&str, &str)],
) -> HashMap<String, String> {
    let mut result = HashMap::new();
    for (key, value) in parsed {
        let canonical = aliases
            .iter()
            .find(|(alias, _)| *alias == key.to_ascii_lowercase().trim())
            .map(|(_, canon)| canon.to_string());
        result.insert(canonical.unwrap_or(key), value);
    }
    result
}

/// Space-weather keys: lowercase OpenHamClock spellings folded into the
/// canonical HamClock names.
pub fn normalize_spacewx(parsed: HashMap<String, String>) -> HashMap<String, String> {
    normalize_keys(
        parsed,
        &[
            ("sfi", "SFI"),
            ("flux", "SFI"),
            ("solar_flux", "SFI"),
            ("kp", "Kp"),
            ("kp_index", "Kp"),
            ("a", "A"),
            ("a_index", "A"),
            ("xray", "Xray"),
            ("x-ray", "Xray"),
            ("xray_flux", "Xray"),
            ("ssn", "SSN"),
            ("sunspot", "SSN"),
            ("sunspots", "SSN"),
            ("proton", "Proton"),
            ("pf", "Proton"),
            ("proton_flux", "Proton"),
            ("aurora", "Aurora"),
            ("aur", "Aurora"),
        ],
    )
}

/// DE/DX location keys.
pub fn normalize_de_dx(parsed: HashMap<String, String>) -> HashMap<String, String> {
    normalize_keys(
        parsed,
        &[
            ("latitude", "lat"),
            ("longitude", "lng"),
            ("lon", "lng"),
            ("callsign", "call"),
            ("gridsquare", "grid"),
            ("grid_square", "grid"),
        ],
    )
}

/// Band-condition keys: each `bandNNm` key maps to its own canonical band.
pub fn normalize_band_conditions(parsed: HashMap<String, String>) -> HashMap<String, String> {
    normalize_keys(
        parsed,
        &[
            ("band80m", "80m"),
            ("band40m", "40m"),
            ("band30m", "30m"),
            ("band20m", "20m"),
            ("band17m", "17m"),
            ("band15m", "15m"),
            ("band12m", "12m"),
            ("band10m", "10m"),
        ],
    )
}

/// Extract a canonical band key (`80m`, `40m`, ... `10m`) from free-form
/// text. The band number must not be preceded by another digit, so `180m`
/// never matches as `80m`.
pub fn parse_band_key(text: &str) -> Option<String> {
    // Hand-rolled lookbehind: capture the char before the band number.
    let re = Regex::new(r"(^|[^0-9])(80|40|30|20|17|15|12|10)m?\b").ok()?;
    let caps = re.captures(text)?;
    Some(format!("{}m", &caps[2]))
}
