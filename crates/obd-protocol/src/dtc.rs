//! Diagnostic Trouble Code Decoding
//!
//! Turns Mode 03 answers from an ELM327 into five-character codes such as
//! `P0171`. Only generic SAE descriptions are known; manufacturer codes are
//! reported with an empty description.

/// Generic SAE J2012 descriptions for the most common powertrain codes
const GENERIC_DESCRIPTIONS: &[(&str, &str)] = &[
    ("P0100", "Mass or Volume Air Flow Circuit Malfunction"),
    ("P0101", "Mass or Volume Air Flow Circuit Range/Performance Problem"),
    ("P0110", "Intake Air Temperature Circuit Malfunction"),
    ("P0115", "Engine Coolant Temperature Circuit Malfunction"),
    ("P0120", "Throttle Position Sensor/Switch A Circuit Malfunction"),
    ("P0130", "O2 Sensor Circuit Malfunction (Bank 1 Sensor 1)"),
    ("P0171", "System Too Lean (Bank 1)"),
    ("P0172", "System Too Rich (Bank 1)"),
    ("P0300", "Random/Multiple Cylinder Misfire Detected"),
    ("P0301", "Cylinder 1 Misfire Detected"),
    ("P0302", "Cylinder 2 Misfire Detected"),
    ("P0303", "Cylinder 3 Misfire Detected"),
    ("P0304", "Cylinder 4 Misfire Detected"),
    ("P0380", "Glow Plug/Heater Circuit A Malfunction"),
    ("P0400", "Exhaust Gas Recirculation Flow Malfunction"),
    ("P0401", "Exhaust Gas Recirculation Flow Insufficient Detected"),
    ("P0420", "Catalyst System Efficiency Below Threshold (Bank 1)"),
    ("P0500", "Vehicle Speed Sensor Malfunction"),
    ("P0562", "System Voltage Low"),
    ("P0670", "Glow Plug Module Control Circuit"),
];

/// Look up the generic description for a code, or an empty string
pub fn describe(code: &str) -> &'static str {
    GENERIC_DESCRIPTIONS
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, description)| *description)
        .unwrap_or("")
}

/// Decode one two-byte trouble code. Returns `None` for zero padding.
pub fn decode_pair(a: u8, b: u8) -> Option<String> {
    if a == 0 && b == 0 {
        return None;
    }
    let system = match a >> 6 {
        0 => 'P',
        1 => 'C',
        2 => 'B',
        _ => 'U',
    };
    Some(format!("{}{}{:X}{:02X}", system, (a >> 4) & 0x03, a & 0x0F, b))
}

/// Decode a raw Mode 03 answer into (code, description) pairs.
///
/// `has_count_byte` is true for CAN protocols, where the mode byte is
/// followed by the number of codes. Returns `None` if no `43` frame was found.
pub fn parse_mode03(raw: &str, has_count_byte: bool) -> Option<Vec<(String, String)>> {
    let mut codes = Vec::new();
    let mut saw_frame = false;

    for payload in frames(raw) {
        let Some(bytes) = hex_bytes(&payload) else {
            continue;
        };
        if bytes.first() != Some(&0x43) {
            continue;
        }
        saw_frame = true;

        let (skip, limit) = if has_count_byte {
            (2, bytes.get(1).map_or(0, |&n| usize::from(n)))
        } else {
            (1, usize::MAX)
        };
        let pairs = bytes.get(skip..).unwrap_or_default().chunks_exact(2);
        for pair in pairs.take(limit) {
            if let Some(code) = decode_pair(pair[0], pair[1]) {
                let description = describe(&code).to_string();
                codes.push((code, description));
            }
        }
    }

    saw_frame.then_some(codes)
}

/// Adapter status lines that can precede the vehicle's answer, such as
/// `SEARCHING...` or `BUS INIT: ...OK`
pub fn is_status_line(line: &str) -> bool {
    let upper = line.trim_start().to_uppercase();
    upper.starts_with("SEARCHING") || upper.starts_with("BUS INIT")
}

/// Split an adapter answer into frame payloads.
///
/// Multi-frame CAN segments (`0: ...`, `1: ...`) are joined into one payload
/// after the single-line frames. Status lines are skipped.
fn frames(raw: &str) -> Vec<String> {
    let mut frames = Vec::new();
    let mut segments = Vec::new();

    let lines = raw
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|l| !l.is_empty() && !is_status_line(l));
    for line in lines {
        match frame_segment(line) {
            Some(rest) => segments.push(rest),
            None => frames.push(line.to_string()),
        }
    }

    if !segments.is_empty() {
        frames.push(segments.concat());
    }
    frames
}

/// Payload of a multi-frame line: a hex frame index, then `:`
fn frame_segment(line: &str) -> Option<&str> {
    let (index, rest) = line.split_once(':')?;
    let index = index.trim();
    let is_index = !index.is_empty()
        && index.len() <= 2
        && index.chars().all(|c| c.is_ascii_hexdigit());
    is_index.then_some(rest)
}

/// Parse a run of hex digits (spaces allowed) into bytes
fn hex_bytes(payload: &str) -> Option<Vec<u8>> {
    let digits: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.is_empty() || !digits.is_ascii() || digits.len() % 2 != 0 {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).ok())
        .collect()
}
