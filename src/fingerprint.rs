use std::sync::OnceLock;

use regex::Regex;

/// Normalized tail length kept in a fingerprint.
const NORMALIZED_ERROR_LEN: usize = 200;

fn timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:?\d{2})?")
            .expect("static regex")
    })
}

fn hex_addr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"0x[0-9a-fA-F]+").expect("static regex"))
}

fn path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Unix or Windows style path with at least one separator
    RE.get_or_init(|| {
        Regex::new(r"(?:[A-Za-z]:)?(?:[\\/][\w.\-]+){2,}").expect("static regex")
    })
}

fn line_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(line|ln)[ :]\d+").expect("static regex"))
}

fn id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(run|session|phase|attempt)[-_][\w-]+").expect("static regex")
    })
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d+\b").expect("static regex"))
}

/// Normalize a failure message so that repeats of the same underlying error
/// collapse onto one signature: timestamps, file paths, memory addresses,
/// line numbers, run/session ids, and bare numbers become stable tokens.
pub fn normalize_error(error: &str) -> String {
    let s = error.trim();
    let s = timestamp_re().replace_all(s, "<TS>");
    let s = hex_addr_re().replace_all(&s, "<ADDR>");
    let s = path_re().replace_all(&s, "<PATH>");
    let s = line_number_re().replace_all(&s, "<LINE>");
    let s = id_re().replace_all(&s, "<ID>");
    let s = number_re().replace_all(&s, "<N>");
    let s = s.to_lowercase();
    let collapsed: String = s.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(NORMALIZED_ERROR_LEN).collect()
}

/// Bucket a subprocess return code: `rc0`, `rc1`, ..., `rcsig` for
/// signal-terminated, `rcnone` for unknown.
pub fn rc_bucket(returncode: Option<i32>) -> String {
    match returncode {
        Some(rc) if rc >= 0 => format!("rc{}", rc),
        Some(_) => "rcsig".to_string(),
        None => "rcnone".to_string(),
    }
}

/// Failure signature used by the drain controller to detect repeats:
/// `FAILED|<rc-bucket>|<normalized-error:200>`.
pub fn failure_fingerprint(returncode: Option<i32>, error: &str) -> String {
    format!("FAILED|{}|{}", rc_bucket(returncode), normalize_error(error))
}
