//! Redaction helpers applied to anything sensitive before it reaches a log
//! line or an error message. The production config path never goes through
//! these; only logging does.

use std::collections::BTreeMap;

const AUTH_HEADERS: &[&str] = &["Authorization", "X-Serverless-Authorization"];
const EMAIL_HEADER: &str = "X-User-Email";

/// Truncate a bearer token for logging. Short values are elided entirely,
/// longer ones keep a length-proportional prefix and suffix (at most 20
/// characters each) so operators can correlate tokens without ever seeing
/// a usable credential.
pub fn sanitize_token(token: &str) -> String {
	let n = token.chars().count();
	if n <= 20 {
		return format!("[token len={n}]");
	}
	let keep = (n / 10).clamp(4, 20);
	let head: String = token.chars().take(keep).collect();
	let tail: String = token.chars().skip(n - keep).collect();
	format!("{head}...{tail} [len={n}]")
}

/// Keep only the first two characters of the local part of an email
/// address. Values that do not look like an email (or have a local part
/// too short to truncate) pass through unchanged.
pub fn sanitize_email(email: &str) -> String {
	let Some((local, domain)) = email.split_once('@') else {
		return email.to_string();
	};
	if local.chars().count() <= 2 {
		return email.to_string();
	}
	let head: String = local.chars().take(2).collect();
	format!("{head}@{domain}")
}

/// Strip CR/LF (log-line injection) and clamp length. A `max_len` of zero
/// disables the length clamp.
pub fn sanitize_for_log(value: &str, max_len: usize) -> String {
	let cleaned: String = value.chars().filter(|c| *c != '\n' && *c != '\r').collect();
	if max_len > 0 && cleaned.chars().count() > max_len {
		let truncated: String = cleaned.chars().take(max_len).collect();
		return format!("{truncated}...[truncated]");
	}
	cleaned
}

/// Copy a header map with credential-bearing values redacted. The `Bearer `
/// prefix is preserved on auth headers so the header shape stays readable.
pub fn sanitize_headers_for_logging(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
	headers
		.iter()
		.map(|(k, v)| {
			let sanitized = if AUTH_HEADERS.contains(&k.as_str()) {
				match v.strip_prefix("Bearer ") {
					Some(token) => format!("Bearer {}", sanitize_token(token)),
					None => sanitize_token(v),
				}
			} else if k == EMAIL_HEADER {
				sanitize_email(v)
			} else {
				v.clone()
			};
			(k.clone(), sanitized)
		})
		.collect()
}
