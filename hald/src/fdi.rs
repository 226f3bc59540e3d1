// SPDX-License-Identifier: GPL-2.0

//! Declarative match-and-merge rule engine (fdi passes)

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::DaemonConfig;
use crate::device::{Device, Property};
use crate::error::{Error, Result};
use crate::store::DeviceStore;

/// The three fixed rule passes, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePass {
	Preprobe,
	Information,
	Policy,
}

/// Predicate applied to one property key
#[derive(Debug, Clone, PartialEq)]
pub enum MatchTest {
	/// String equality
	Equals(String),
	/// Substring of a string property, or element of a strlist
	Contains(String),
	Prefix(String),
	Suffix(String),
	IntEquals(i64),
	IntInRange { min: i64, max: i64 },
	IntOutsideRange { min: i64, max: i64 },
	BoolEquals(bool),
	/// The key is present, whatever its type
	Exists,
}

/// Leaf mutation of a rule file
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
	/// Overwrite (or create) a property
	Merge { key: String, value: Property },
	/// Grow a strlist at the tail
	Append { key: String, value: String },
	/// Grow a strlist at the head
	Prepend { key: String, value: String },
	/// Delete a property
	Remove { key: String },
}

/// A node of the parsed rule tree
#[derive(Debug, Clone, PartialEq)]
pub enum RuleNode {
	Match {
		key: String,
		test: MatchTest,
		children: Vec<RuleNode>,
	},
	Action(Action),
}

/// One parsed rule file; applies atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleFile {
	pub name: String,
	pub nodes: Vec<RuleNode>,
}

/// Parser collaborator turning file contents into rule trees.
///
/// The on-disk format is not interpreted here; a parse failure skips just
/// that file.
pub trait RuleParser {
	fn parse(&self, name: &str, content: &str) -> Result<RuleFile>;
}

fn test_matches(device: &Device, key: &str, test: &MatchTest) -> bool {
	let prop = device.get_property(key);
	match test {
		MatchTest::Exists => prop.is_some(),
		MatchTest::Equals(want) => matches!(prop, Some(Property::String(s)) if s == want),
		MatchTest::Contains(want) => match prop {
			Some(Property::String(s)) => s.contains(want.as_str()),
			Some(Property::Strlist(l)) => l.iter().any(|v| v == want),
			_ => false,
		},
		MatchTest::Prefix(want) => matches!(prop, Some(Property::String(s)) if s.starts_with(want.as_str())),
		MatchTest::Suffix(want) => matches!(prop, Some(Property::String(s)) if s.ends_with(want.as_str())),
		MatchTest::IntEquals(want) => match prop {
			Some(Property::Int(i)) => i == want,
			Some(Property::Uint64(u)) => i64::try_from(*u).map(|v| v == *want).unwrap_or(false),
			_ => false,
		},
		MatchTest::IntInRange { min, max } => match prop {
			Some(Property::Int(i)) => *i >= *min && *i <= *max,
			Some(Property::Uint64(u)) => {
				i64::try_from(*u).map(|v| v >= *min && v <= *max).unwrap_or(false)
			}
			_ => false,
		},
		MatchTest::IntOutsideRange { min, max } => match prop {
			Some(Property::Int(i)) => *i < *min || *i > *max,
			Some(Property::Uint64(u)) => {
				i64::try_from(*u).map(|v| v < *min || v > *max).unwrap_or(true)
			}
			_ => false,
		},
		MatchTest::BoolEquals(want) => matches!(prop, Some(Property::Bool(b)) if b == want),
	}
}

/// Walk a rule tree against the current device state, accumulating the
/// actions of every satisfied branch. Nested matches are a logical AND.
fn collect_actions(device: &Device, nodes: &[RuleNode], out: &mut Vec<Action>) {
	for node in nodes {
		match node {
			RuleNode::Action(action) => out.push(action.clone()),
			RuleNode::Match { key, test, children } => {
				if test_matches(device, key, test) {
					collect_actions(device, children, out);
				}
			}
		}
	}
}

fn apply_action(store: &mut DeviceStore, udi: &str, action: &Action) {
	let result = match action {
		Action::Merge { key, value } => {
			// capability merges keep the capability set in step
			if key == "info.capabilities" {
				if let Property::Strlist(caps) = value {
					for cap in caps {
						let _ = store.add_capability(udi, cap);
					}
					return;
				}
			}
			store.set_property(udi, key, value.clone()).map(|_| ())
		}
		Action::Append { key, value } => {
			if key == "info.capabilities" {
				store.add_capability(udi, value).map(|_| ())
			} else {
				store.strlist_append(udi, key, value).map(|_| ())
			}
		}
		Action::Prepend { key, value } => store.strlist_prepend(udi, key, value).map(|_| ()),
		Action::Remove { key } => store.remove_property(udi, key).map(|_| ()),
	};
	if let Err(e) = result {
		crate::warn!("rule action on {} failed: {}", udi, e);
	}
}

/// Apply one rule file atomically: evaluate all matches against the state
/// the device had on entry, then commit the accumulated actions.
pub fn apply_rule_file(store: &mut DeviceStore, udi: &str, file: &RuleFile) -> bool {
	let actions = {
		let device = match store.find(udi) {
			Some(d) => d,
			None => return false,
		};
		let mut actions = Vec::new();
		collect_actions(device, &file.nodes, &mut actions);
		actions
	};
	let applied = !actions.is_empty();
	for action in &actions {
		apply_action(store, udi, action);
	}
	applied
}

/// Loaded rule files for all three passes
#[derive(Debug, Default)]
pub struct RuleBook {
	pub preprobe: Vec<RuleFile>,
	pub information: Vec<RuleFile>,
	pub policy: Vec<RuleFile>,
}

impl RuleBook {
	pub fn empty() -> Self {
		Self::default()
	}

	/// Load every pass from its configured directory set.
	pub fn load(config: &DaemonConfig, parser: &dyn RuleParser) -> Self {
		Self {
			preprobe: load_rule_files(&config.fdi_preprobe_dirs, parser),
			information: load_rule_files(&config.fdi_information_dirs, parser),
			policy: load_rule_files(&config.fdi_policy_dirs, parser),
		}
	}

	pub fn files_for(&self, pass: RulePass) -> &[RuleFile] {
		match pass {
			RulePass::Preprobe => &self.preprobe,
			RulePass::Information => &self.information,
			RulePass::Policy => &self.policy,
		}
	}

	/// Run one pass over a stored device, file by file in load order.
	pub fn run_pass(&self, pass: RulePass, store: &mut DeviceStore, udi: &str) {
		for file in self.files_for(pass) {
			apply_rule_file(store, udi, file);
		}
	}
}

/// List the `.fdi` files of one directory, lexically ordered.
fn rule_files_in(dir: &Path) -> Vec<PathBuf> {
	let mut files = Vec::new();
	let entries = match fs::read_dir(dir) {
		Ok(e) => e,
		Err(_) => return files,
	};
	for entry in entries.flatten() {
		let path = entry.path();
		if path.extension().map(|e| e == "fdi").unwrap_or(false) {
			files.push(path);
		}
	}
	files.sort();
	files
}

/// Load rule files from a directory set: lexical order within each
/// directory, directories in configured order. A file that fails to parse
/// is skipped; the rest still apply.
pub fn load_rule_files(dirs: &[PathBuf], parser: &dyn RuleParser) -> Vec<RuleFile> {
	let mut out = Vec::new();
	for dir in dirs {
		for path in rule_files_in(dir) {
			let name = path.to_string_lossy().into_owned();
			let content = match fs::read_to_string(&path) {
				Ok(c) => c,
				Err(e) => {
					crate::warn!("cannot read rule file {}: {}", name, e);
					continue;
				}
			};
			match parser.parse(&name, &content) {
				Ok(file) => out.push(file),
				Err(Error::ParseError) => {
					crate::warn!("skipping malformed rule file {}", name);
				}
				Err(e) => {
					crate::warn!("skipping rule file {}: {}", name, e);
				}
			}
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	fn store_with(udi: &str, props: &[(&str, Property)]) -> DeviceStore {
		let mut store = DeviceStore::new("tdl", &["linux.sysfs_path".to_string()]);
		let mut d = Device::new();
		d.set_udi(udi);
		for (k, v) in props {
			d.set_property(k, v.clone());
		}
		store.add(d).unwrap();
		store
	}

	#[test]
	fn nested_matches_are_anded() {
		let file = RuleFile {
			name: "10-mouse.fdi".into(),
			nodes: vec![RuleNode::Match {
				key: "info.subsystem".into(),
				test: MatchTest::Equals("input".into()),
				children: vec![RuleNode::Match {
					key: "input.product".into(),
					test: MatchTest::Contains("Mouse".into()),
					children: vec![RuleNode::Action(Action::Append {
						key: "info.capabilities".into(),
						value: "input.mouse".into(),
					})],
				}],
			}],
		};

		let mut store = store_with(
			"/d",
			&[
				("info.subsystem", Property::String("input".into())),
				("input.product", Property::String("USB Optical Mouse".into())),
			],
		);
		assert!(apply_rule_file(&mut store, "/d", &file));
		assert!(store.find("/d").unwrap().has_capability("input.mouse"));

		// second conjunct fails: nothing applies
		let mut store2 = store_with(
			"/d",
			&[("info.subsystem", Property::String("input".into()))],
		);
		assert!(!apply_rule_file(&mut store2, "/d", &file));
	}

	#[test]
	fn matches_evaluate_against_entry_state() {
		// the first branch rewrites the key the second branch tests;
		// both must see the state on entry
		let file = RuleFile {
			name: "20-rewrite.fdi".into(),
			nodes: vec![
				RuleNode::Match {
					key: "info.product".into(),
					test: MatchTest::Equals("Old".into()),
					children: vec![RuleNode::Action(Action::Merge {
						key: "info.product".into(),
						value: Property::String("New".into()),
					})],
				},
				RuleNode::Match {
					key: "info.product".into(),
					test: MatchTest::Equals("Old".into()),
					children: vec![RuleNode::Action(Action::Merge {
						key: "seen.old".into(),
						value: Property::Bool(true),
					})],
				},
			],
		};

		let mut store = store_with("/d", &[("info.product", Property::String("Old".into()))]);
		apply_rule_file(&mut store, "/d", &file);
		let d = store.find("/d").unwrap();
		assert_eq!(d.get_string("info.product").unwrap(), "New");
		assert!(d.get_bool("seen.old").unwrap());
	}

	#[test]
	fn int_range_tests() {
		let d_props = [("pci.device_class", Property::Int(3))];
		let in_range = RuleFile {
			name: "r".into(),
			nodes: vec![RuleNode::Match {
				key: "pci.device_class".into(),
				test: MatchTest::IntInRange { min: 2, max: 4 },
				children: vec![RuleNode::Action(Action::Merge {
					key: "matched".into(),
					value: Property::Bool(true),
				})],
			}],
		};
		let mut store = store_with("/d", &d_props);
		assert!(apply_rule_file(&mut store, "/d", &in_range));

		let outside = RuleFile {
			name: "r".into(),
			nodes: vec![RuleNode::Match {
				key: "pci.device_class".into(),
				test: MatchTest::IntOutsideRange { min: 2, max: 4 },
				children: vec![RuleNode::Action(Action::Merge {
					key: "matched".into(),
					value: Property::Bool(true),
				})],
			}],
		};
		let mut store2 = store_with("/d", &d_props);
		assert!(!apply_rule_file(&mut store2, "/d", &outside));
	}

	#[test]
	fn remove_and_merge_actions() {
		let file = RuleFile {
			name: "r".into(),
			nodes: vec![
				RuleNode::Action(Action::Merge {
					key: "info.ignore".into(),
					value: Property::Bool(true),
				}),
				RuleNode::Action(Action::Remove {
					key: "info.product".into(),
				}),
			],
		};
		let mut store = store_with("/d", &[("info.product", Property::String("X".into()))]);
		apply_rule_file(&mut store, "/d", &file);
		let d = store.find("/d").unwrap();
		assert!(d.bool_or_false("info.ignore"));
		assert!(!d.has_property("info.product"));
	}

	struct PickyParser;

	impl RuleParser for PickyParser {
		fn parse(&self, name: &str, content: &str) -> Result<RuleFile> {
			if content.contains("bad") {
				return Err(Error::ParseError);
			}
			Ok(RuleFile {
				name: name.to_string(),
				nodes: Vec::new(),
			})
		}
	}

	#[test]
	fn malformed_file_is_skipped_others_load_in_lexical_order() {
		let dir = std::env::temp_dir().join(format!("hald-fdi-test-{}", std::process::id()));
		let _ = fs::remove_dir_all(&dir);
		fs::create_dir_all(&dir).unwrap();
		fs::write(dir.join("20-second.fdi"), "ok").unwrap();
		fs::write(dir.join("10-first.fdi"), "ok").unwrap();
		fs::write(dir.join("15-broken.fdi"), "bad").unwrap();
		fs::write(dir.join("notes.txt"), "ignored").unwrap();

		let files = load_rule_files(&[dir.clone()], &PickyParser);
		assert_eq!(files.len(), 2);
		assert!(files[0].name.ends_with("10-first.fdi"));
		assert!(files[1].name.ends_with("20-second.fdi"));
	}
}
