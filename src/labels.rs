//! Translates the flat label DSL on a Cloud Run service into router
//! definitions. Labels follow the docker-compose provider encoding:
//!
//! ```text
//! traefik_http_routers_<router>_rule        full matching expression
//! traefik_http_routers_<router>_rule_id     alias resolved via the rule table
//! traefik_http_routers_<router>_service     bound service name
//! traefik_http_routers_<router>_priority    integer priority
//! traefik_http_routers_<router>_entrypoints comma-separated entry points
//! traefik_http_routers_<router>_middlewares middleware names
//! ```
//!
//! Router names cannot contain `_` (the key encoding has no way to escape
//! it); keys that do not parse into a known property are skipped.

use std::collections::{BTreeMap, HashMap};

use tracing::warn;

use crate::gateway::RouterConfig;
use crate::redact::sanitize_for_log;
use crate::rules;

pub const DEFAULT_ENTRY_POINT: &str = "web";
pub const ENABLE_LABEL: &str = "traefik_enable";

const ROUTER_LABEL_PREFIX: &str = "traefik_http_routers_";
const FALLBACK_PRIORITY: i32 = 200;

#[derive(Default)]
struct PendingRouter {
	explicit_rule: Option<String>,
	alias_rule: Option<String>,
	service: Option<String>,
	priority: Option<i32>,
	entry_points: Option<Vec<String>>,
	middlewares: Vec<String>,
}

/// Parse all router labels out of a label map. The result is keyed by router
/// name and is deterministic regardless of the map's iteration order: keys
/// are visited sorted, and an explicit `rule` label beats a `rule_id` alias
/// no matter which key is seen first. An empty result means the backend
/// carries no routing intent.
pub fn parse_router_labels(labels: &HashMap<String, String>) -> BTreeMap<String, RouterConfig> {
	let mut pending: BTreeMap<String, PendingRouter> = BTreeMap::new();

	let mut keys: Vec<&String> = labels.keys().collect();
	keys.sort();

	for key in keys {
		let value = &labels[key];
		if !key.starts_with(ROUTER_LABEL_PREFIX) {
			continue;
		}

		// traefik_http_routers_<router>_<property>
		let parts: Vec<&str> = key.splitn(5, '_').collect();
		if parts.len() < 5 {
			continue;
		}
		let router_name = parts[3];
		let property = parts[4];

		match property {
			"rule" => {
				entry(&mut pending, router_name).explicit_rule = Some(value.clone());
			},
			"rule_id" => match rules::resolve(value) {
				Some(rule) => entry(&mut pending, router_name).alias_rule = Some(rule),
				None => {
					warn!(
						key = %sanitize_for_log(key, 100),
						alias = %sanitize_for_log(value, 100),
						"unknown rule alias, router will have an empty rule"
					);
					entry(&mut pending, router_name);
				},
			},
			"service" => {
				entry(&mut pending, router_name).service = Some(value.clone());
			},
			"priority" => {
				let priority = match value.trim().parse::<i32>() {
					Ok(p) => p,
					Err(_) => {
						warn!(
							key = %sanitize_for_log(key, 100),
							value = %sanitize_for_log(value, 100),
							"priority is not an integer, using 0"
						);
						0
					},
				};
				entry(&mut pending, router_name).priority = Some(priority);
			},
			"entrypoints" => {
				let points: Vec<String> = value
					.split(',')
					.map(str::trim)
					.filter(|p| !p.is_empty())
					.map(str::to_string)
					.collect();
				entry(&mut pending, router_name).entry_points = Some(points);
			},
			"middlewares" => {
				entry(&mut pending, router_name)
					.middlewares
					.extend(split_middlewares(value));
			},
			_ => {
				// Covers router names containing `_`: the five-way split eats
				// the name and leaves an unrecognized property behind.
				warn!(
					key = %sanitize_for_log(key, 100),
					"unrecognized router label key, skipping"
				);
			},
		}
	}

	pending
		.into_iter()
		.map(|(name, p)| {
			let router = finalize(&name, p);
			(name, router)
		})
		.collect()
}

fn entry<'a>(
	pending: &'a mut BTreeMap<String, PendingRouter>,
	name: &str,
) -> &'a mut PendingRouter {
	pending.entry(name.to_string()).or_default()
}

fn finalize(name: &str, pending: PendingRouter) -> RouterConfig {
	let mut entry_points = pending.entry_points.unwrap_or_default();
	if entry_points.is_empty() {
		// Traefik rejects routers with no entry points.
		warn!(router = name, "router has no entry points, defaulting to '{DEFAULT_ENTRY_POINT}'");
		entry_points = vec![DEFAULT_ENTRY_POINT.to_string()];
	}
	RouterConfig {
		rule: pending.explicit_rule.or(pending.alias_rule).unwrap_or_default(),
		service: pending.service.unwrap_or_default(),
		priority: pending.priority.unwrap_or_else(|| default_priority(name)),
		entry_points,
		middlewares: pending.middlewares,
	}
}

/// Separator precedence for middleware lists: `__` beats `;` beats `,`.
/// A `-file` suffix marks a middleware resolved by the file provider and is
/// rewritten to Traefik's `@file` form.
fn split_middlewares(value: &str) -> Vec<String> {
	let parts: Vec<&str> = if value.contains("__") {
		value.split("__").collect()
	} else if value.contains(';') {
		value.split(';').collect()
	} else {
		value.split(',').collect()
	};
	parts
		.into_iter()
		.map(str::trim)
		.filter(|p| !p.is_empty())
		.map(|p| match p.strip_suffix("-file") {
			Some(stem) => format!("{stem}@file"),
			None => p.to_string(),
		})
		.collect()
}

/// Default priorities by router name. Higher matches first; the home index
/// is the catch-all at the bottom.
pub fn default_priority(router_name: &str) -> i32 {
	match router_name {
		"home-index" | "home-index-root" => 1,
		"home-index-signin" => 100,
		"lab1-static" | "lab2-static" | "lab3-static" | "lab4-static" => 250,
		"lab1-c2" | "lab2-c2" | "lab4-c2" | "lab3-extension" => 300,
		"lab1-health" | "lab2-health" | "lab3-health" | "lab4-health" => 400,
		"home-seo" | "labs-analytics" => 500,
		_ => FALLBACK_PRIORITY,
	}
}
