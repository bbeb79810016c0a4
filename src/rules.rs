//! Process-wide rule alias table. Backends may declare routing intent as a
//! short `rule_id` label instead of a full matching expression; this table
//! maps those ids to Traefik rule expressions. It is seeded at startup and
//! replaceable as a whole, but treated as read-only within a generation
//! cycle.

use std::collections::HashMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;

static RULE_ALIASES: Lazy<RwLock<HashMap<String, String>>> =
	Lazy::new(|| RwLock::new(default_aliases()));

/// Replace the alias table. `None` leaves the current table intact so
/// callers can thread an optional override straight through; `Some` replaces
/// the table, including with an empty map.
pub fn set_rule_aliases(aliases: Option<HashMap<String, String>>) {
	if let Some(aliases) = aliases {
		*RULE_ALIASES.write().unwrap() = aliases;
	}
}

pub fn resolve(id: &str) -> Option<String> {
	RULE_ALIASES.read().unwrap().get(id).cloned()
}

/// The table shipped by default, covering the home app and the labs.
pub fn default_aliases() -> HashMap<String, String> {
	let mut m = HashMap::new();
	m.insert("home-index-root".into(), "PathPrefix(`/`)".into());
	m.insert(
		"home-index-signin".into(),
		"Path(`/sign-in`) || Path(`/sign-up`)".into(),
	);
	m.insert("home-seo".into(), "PathPrefix(`/api/seo`)".into());
	m.insert("labs-analytics".into(), "PathPrefix(`/api/analytics`)".into());
	for lab in ["lab1", "lab2", "lab3", "lab4"] {
		m.insert(lab.into(), format!("PathPrefix(`/{lab}`)"));
		m.insert(format!("{lab}-main"), format!("PathPrefix(`/{lab}`)"));
		m.insert(format!("{lab}-health"), format!("Path(`/{lab}/health`)"));
		m.insert(
			format!("{lab}-static"),
			format!(
				"PathPrefix(`/{lab}/css/`) || PathPrefix(`/{lab}/js/`) || PathPrefix(`/{lab}/images/`) || PathPrefix(`/{lab}/img/`) || PathPrefix(`/{lab}/static/`) || PathPrefix(`/{lab}/assets/`)"
			),
		);
	}
	for lab in ["lab1", "lab2", "lab4"] {
		m.insert(format!("{lab}-c2"), format!("PathPrefix(`/{lab}/c2`)"));
	}
	m.insert("lab3-extension".into(), "PathPrefix(`/lab3/extension`)".into());
	m
}

#[cfg(test)]
pub(crate) static TEST_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn replace_and_restore() {
		let _guard = TEST_GUARD.lock().unwrap();

		set_rule_aliases(Some(HashMap::from([(
			"custom".to_string(),
			"PathPrefix(`/custom`)".to_string(),
		)])));
		assert_eq!(resolve("custom").as_deref(), Some("PathPrefix(`/custom`)"));
		assert_eq!(resolve("lab1"), None);

		set_rule_aliases(Some(default_aliases()));
		assert_eq!(resolve("lab1").as_deref(), Some("PathPrefix(`/lab1`)"));
	}

	#[test]
	fn none_is_a_no_op() {
		let _guard = TEST_GUARD.lock().unwrap();

		set_rule_aliases(Some(HashMap::from([(
			"keep-me".to_string(),
			"Path(`/keep`)".to_string(),
		)])));
		set_rule_aliases(None);
		assert_eq!(resolve("keep-me").as_deref(), Some("Path(`/keep`)"));

		set_rule_aliases(Some(default_aliases()));
	}

	#[test]
	fn empty_map_replaces() {
		let _guard = TEST_GUARD.lock().unwrap();

		set_rule_aliases(Some(HashMap::new()));
		assert_eq!(resolve("lab1"), None);

		set_rule_aliases(Some(default_aliases()));
	}

	#[test]
	fn default_table_contents() {
		let _guard = TEST_GUARD.lock().unwrap();
		let m = default_aliases();
		assert_eq!(m["home-index-root"], "PathPrefix(`/`)");
		assert_eq!(m["lab3-extension"], "PathPrefix(`/lab3/extension`)");
		assert!(m["lab2-static"].contains("PathPrefix(`/lab2/assets/`)"));
		assert!(!m.contains_key("lab3-c2"));
	}
}
